//! SpeexDSP preprocessor (denoise + AGC) used by the ALSA backend.

use std::ffi::{c_int, c_void};

/// Opaque type for SpeexPreprocessState
#[repr(C)]
pub struct SpeexPreprocessState {
    _private: [u8; 0],
}

const SPEEX_PREPROCESS_SET_DENOISE: c_int = 0;
const SPEEX_PREPROCESS_SET_AGC: c_int = 2;
const SPEEX_PREPROCESS_SET_AGC_LEVEL: c_int = 6;
const SPEEX_PREPROCESS_SET_NOISE_SUPPRESS: c_int = 8;

// Target level and suppression used for voice chat.
const VOICE_AGC_LEVEL: f32 = 24000.0;
const VOICE_NOISE_SUPPRESS_DB: c_int = -25;

unsafe extern "C" {
    fn speex_preprocess_state_init(frame_size: c_int, sampling_rate: c_int)
        -> *mut SpeexPreprocessState;
    fn speex_preprocess_state_destroy(st: *mut SpeexPreprocessState);
    fn speex_preprocess_run(st: *mut SpeexPreprocessState, x: *mut i16) -> c_int;
    fn speex_preprocess_ctl(
        st: *mut SpeexPreprocessState,
        request: c_int,
        ptr: *mut c_void,
    ) -> c_int;
}

/// One channel of Speex preprocessing. Works on fixed-size frames.
pub struct Preprocessor {
    state: *mut SpeexPreprocessState,
    frame_size: usize,
}

// SpeexPreprocessState is used from a single thread only
unsafe impl Send for Preprocessor {}

impl Preprocessor {
    /// Preprocessor for `frame_size` samples per run, configured for voice.
    pub fn for_voice(
        frame_size: usize,
        sample_rate: u32,
        denoise: bool,
        agc: bool,
    ) -> anyhow::Result<Self> {
        let state = unsafe { speex_preprocess_state_init(frame_size as c_int, sample_rate as c_int) };
        if state.is_null() {
            anyhow::bail!("Failed to initialize speex preprocessor");
        }
        let mut pp = Self { state, frame_size };

        pp.ctl_int(SPEEX_PREPROCESS_SET_DENOISE, denoise as c_int);
        if denoise {
            pp.ctl_int(SPEEX_PREPROCESS_SET_NOISE_SUPPRESS, VOICE_NOISE_SUPPRESS_DB);
        }
        pp.ctl_int(SPEEX_PREPROCESS_SET_AGC, agc as c_int);
        if agc {
            let mut level = VOICE_AGC_LEVEL;
            unsafe {
                speex_preprocess_ctl(
                    pp.state,
                    SPEEX_PREPROCESS_SET_AGC_LEVEL,
                    &mut level as *mut f32 as *mut c_void,
                );
            }
        }
        Ok(pp)
    }

    /// Process one frame in place. `samples` must hold exactly `frame_size`
    /// samples; anything else is passed through untouched.
    pub fn process(&mut self, samples: &mut [i16]) {
        if samples.len() != self.frame_size {
            log::debug!(
                "Skipping preprocess of {} samples (frame size {})",
                samples.len(),
                self.frame_size
            );
            return;
        }
        unsafe {
            speex_preprocess_run(self.state, samples.as_mut_ptr());
        }
    }

    fn ctl_int(&mut self, request: c_int, value: c_int) {
        let mut val = value;
        unsafe {
            speex_preprocess_ctl(self.state, request, &mut val as *mut c_int as *mut c_void);
        }
    }
}

impl Drop for Preprocessor {
    fn drop(&mut self) {
        unsafe {
            speex_preprocess_state_destroy(self.state);
        }
    }
}
