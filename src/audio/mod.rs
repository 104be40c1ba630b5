//! audio - Microphone capture backends and the real-time render thread.
//!
//! Capture runs on dedicated OS threads; the control plane only sees
//! [`MediaTrack`] handles and the graph behind a short-lived lock.
//! The ALSA backend (with SpeexDSP denoise/AGC) is behind the
//! `alsa-capture` feature.

#[cfg(feature = "alsa-capture")]
mod alsa_device;
mod capture;
mod render;
#[cfg(feature = "alsa-capture")]
mod speex;

#[cfg(feature = "alsa-capture")]
pub use alsa_device::AlsaCapture;
pub use capture::{
    CaptureConstraints, CaptureDevice, CaptureStream, ChannelCapture, MediaTrack, ReadOutcome,
    SampleFeeder, SampleReader, SampleSource,
};
pub use render::RenderThread;
