//! Loudness metering and speech detection over the analyser's byte spectrum.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::ser::{Serialize, Serializer};

/// Magnitudes at or above this mean count as full scale.
pub const LEVEL_REFERENCE: f32 = 128.0;

pub const DEFAULT_NOISE_FLOOR: f32 = 0.05;

/// Fixed-size magnitude buffer shared between the analyser and frame
/// consumers. Written in place every tick, never reallocated.
#[derive(Clone)]
pub struct SpectrumBuffer(Arc<Mutex<Vec<u8>>>);

impl SpectrumBuffer {
    pub fn new(bins: usize) -> Self {
        Self(Arc::new(Mutex::new(vec![0; bins])))
    }

    pub fn len(&self) -> usize {
        self.0.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of the current contents.
    pub fn snapshot(&self) -> Vec<u8> {
        self.0.lock().clone()
    }

    pub fn with<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        f(&self.0.lock())
    }

    pub(crate) fn write<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        f(&mut self.0.lock())
    }

    pub(crate) fn clear(&self) {
        self.0.lock().fill(0);
    }

    /// Whether both handles point at the same storage.
    pub fn shares_storage(&self, other: &SpectrumBuffer) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for SpectrumBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SpectrumBuffer({} bins)", self.len())
    }
}

impl Serialize for SpectrumBuffer {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.with(|bins| serializer.collect_seq(bins))
    }
}

/// Per-tick metering snapshot. Only the most recent frame is meaningful.
#[derive(Clone, Debug, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioFrame {
    pub level: f32,
    pub is_speaking: bool,
    pub spectrum: SpectrumBuffer,
}

/// Mean magnitude over [`LEVEL_REFERENCE`], clamped to `[0, 1]`.
/// An empty buffer reads as silence.
pub fn compute_level(magnitudes: &[u8]) -> f32 {
    if magnitudes.is_empty() {
        return 0.0;
    }
    let sum: u64 = magnitudes.iter().map(|&m| u64::from(m)).sum();
    let mean = sum as f32 / magnitudes.len() as f32;
    (mean / LEVEL_REFERENCE).clamp(0.0, 1.0)
}

pub fn is_speaking(level: f32, noise_floor: f32, muted: bool) -> bool {
    !muted && level > noise_floor
}

pub struct LevelAnalyzer {
    noise_floor: f32,
    spectrum: SpectrumBuffer,
}

impl LevelAnalyzer {
    pub fn new(noise_floor: f32, bins: usize) -> Self {
        Self {
            noise_floor: sanitize_floor(noise_floor),
            spectrum: SpectrumBuffer::new(bins),
        }
    }

    pub fn noise_floor(&self) -> f32 {
        self.noise_floor
    }

    pub fn spectrum(&self) -> &SpectrumBuffer {
        &self.spectrum
    }

    /// One metering pass. `fill` writes the current magnitudes into the
    /// shared buffer and returns how many bins it wrote, or `None` when the
    /// tap is gone, in which case no frame is produced.
    pub fn tick<F>(&self, muted: bool, fill: F) -> Option<AudioFrame>
    where
        F: FnOnce(&mut [u8]) -> Option<usize>,
    {
        let level = self.spectrum.write(|buf| {
            let written = fill(buf)?.min(buf.len());
            buf[written..].fill(0);
            Some(compute_level(&buf[..written]))
        })?;
        Some(self.frame(level, muted))
    }

    /// Meter a caller-supplied magnitude buffer, copying it into the shared
    /// spectrum (truncated or zero-padded to its size).
    pub fn analyze(&self, magnitudes: &[u8], muted: bool) -> AudioFrame {
        self.spectrum.write(|buf| {
            let n = magnitudes.len().min(buf.len());
            buf[..n].copy_from_slice(&magnitudes[..n]);
            buf[n..].fill(0);
        });
        self.frame(compute_level(magnitudes), muted)
    }

    /// The frame published when nothing is being metered.
    pub fn silent_frame(&self) -> AudioFrame {
        self.spectrum.clear();
        self.frame(0.0, true)
    }

    fn frame(&self, level: f32, muted: bool) -> AudioFrame {
        AudioFrame {
            level,
            is_speaking: is_speaking(level, self.noise_floor, muted),
            spectrum: self.spectrum.clone(),
        }
    }
}

fn sanitize_floor(noise_floor: f32) -> f32 {
    if noise_floor.is_finite() {
        noise_floor.clamp(0.0, 1.0)
    } else {
        DEFAULT_NOISE_FLOOR
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn reference_levels() {
        assert_eq!(compute_level(&[]), 0.0);
        assert_eq!(compute_level(&[0; 128]), 0.0);
        assert_eq!(compute_level(&[255; 128]), 1.0);
        assert!((compute_level(&[100; 128]) - 0.78125).abs() < 1e-6);
    }

    #[test]
    fn muted_speech_is_not_speaking() {
        let analyzer = LevelAnalyzer::new(0.05, 128);
        let loud = [100u8; 128];
        assert!(analyzer.analyze(&loud, false).is_speaking);
        let frame = analyzer.analyze(&loud, true);
        assert!(!frame.is_speaking);
        assert!((frame.level - 0.78125).abs() < 1e-6);
    }

    #[test]
    fn tick_reuses_the_same_buffer() {
        let analyzer = LevelAnalyzer::new(0.05, 8);
        let a = analyzer.tick(false, |buf| {
            buf.fill(64);
            Some(buf.len())
        });
        let b = analyzer.tick(false, |buf| {
            buf[..4].fill(128);
            Some(4)
        });
        let (a, b) = (a.unwrap(), b.unwrap());
        assert!(a.spectrum.shares_storage(&b.spectrum));
        assert_eq!(b.level, 1.0);
        assert_eq!(b.spectrum.snapshot(), vec![128, 128, 128, 128, 0, 0, 0, 0]);
    }

    #[test]
    fn missing_tap_yields_no_frame() {
        let analyzer = LevelAnalyzer::new(0.05, 8);
        assert!(analyzer.tick(false, |_| None).is_none());
    }

    #[test]
    fn frame_serialises_camel_case() {
        let analyzer = LevelAnalyzer::new(0.05, 2);
        let json = serde_json::to_value(analyzer.analyze(&[128, 128], false)).unwrap();
        assert_eq!(json["isSpeaking"], true);
        assert_eq!(json["level"], 1.0);
        assert_eq!(json["spectrum"], serde_json::json!([128, 128]));
    }

    proptest! {
        #[test]
        fn level_is_normalised(magnitudes in proptest::collection::vec(any::<u8>(), 0..512)) {
            let level = compute_level(&magnitudes);
            prop_assert!((0.0..=1.0).contains(&level));
        }

        #[test]
        fn muted_never_speaks(
            magnitudes in proptest::collection::vec(any::<u8>(), 1..256),
            floor in 0.0f32..1.0,
        ) {
            let analyzer = LevelAnalyzer::new(floor, 256);
            prop_assert!(!analyzer.analyze(&magnitudes, true).is_speaking);
        }
    }
}
