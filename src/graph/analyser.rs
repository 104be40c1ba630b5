//! Spectrum analyser tap: passes audio through unchanged and keeps the most
//! recent `fft_size` samples for byte-scaled magnitude snapshots.

use std::f32::consts::PI;
use std::sync::Arc;

use rustfft::num_complex::Complex32;
use rustfft::{Fft, FftPlanner};

pub const DEFAULT_FFT_SIZE: usize = 256;
pub const MIN_FFT_SIZE: usize = 32;
pub const MAX_FFT_SIZE: usize = 32_768;

const MIN_DECIBELS: f32 = -100.0;
const MAX_DECIBELS: f32 = -30.0;

pub struct Analyser {
    fft: Arc<dyn Fft<f32>>,
    fft_size: usize,
    smoothing: f32,
    // Ring of the latest time-domain samples; `write_pos` is the oldest.
    history: Vec<f32>,
    write_pos: usize,
    window: Vec<f32>,
    spectrum: Vec<Complex32>,
    scratch: Vec<Complex32>,
    smoothed: Vec<f32>,
}

impl Analyser {
    /// `fft_size` is clamped to 32..=32768 and rounded up to a power of two.
    pub fn new(fft_size: usize, smoothing: f32) -> Self {
        let fft_size = fft_size.clamp(MIN_FFT_SIZE, MAX_FFT_SIZE).next_power_of_two();
        let fft = FftPlanner::<f32>::new().plan_fft_forward(fft_size);
        let scratch = vec![Complex32::new(0.0, 0.0); fft.get_inplace_scratch_len()];

        // Blackman window
        let window = (0..fft_size)
            .map(|i| {
                let x = i as f32 / fft_size as f32;
                0.42 - 0.5 * (2.0 * PI * x).cos() + 0.08 * (4.0 * PI * x).cos()
            })
            .collect();

        Self {
            fft,
            fft_size,
            smoothing: smoothing.clamp(0.0, 1.0),
            history: vec![0.0; fft_size],
            write_pos: 0,
            window,
            spectrum: vec![Complex32::new(0.0, 0.0); fft_size],
            scratch,
            smoothed: vec![0.0; fft_size / 2],
        }
    }

    pub fn fft_size(&self) -> usize {
        self.fft_size
    }

    /// Number of magnitude bins produced per snapshot.
    pub fn bin_count(&self) -> usize {
        self.fft_size / 2
    }

    pub(crate) fn push(&mut self, samples: &[f32]) {
        for &s in samples {
            self.history[self.write_pos] = s;
            self.write_pos = (self.write_pos + 1) % self.fft_size;
        }
    }

    /// Write byte-scaled magnitudes (0..=255 mapped over -100..-30 dBFS) into
    /// `out`. Writes at most `bin_count()` bytes and returns the count.
    /// Allocation free.
    pub fn byte_frequency_data(&mut self, out: &mut [u8]) -> usize {
        let n = self.fft_size;
        for i in 0..n {
            let sample = self.history[(self.write_pos + i) % n];
            self.spectrum[i] = Complex32::new(sample * self.window[i], 0.0);
        }
        self.fft
            .process_with_scratch(&mut self.spectrum, &mut self.scratch);

        let bins = self.bin_count().min(out.len());
        let tau = self.smoothing;
        let scale = 1.0 / n as f32;
        for k in 0..bins {
            let magnitude = self.spectrum[k].norm() * scale;
            let smoothed = tau * self.smoothed[k] + (1.0 - tau) * magnitude;
            self.smoothed[k] = if smoothed.is_finite() { smoothed } else { 0.0 };

            let db = 20.0 * self.smoothed[k].max(1e-12).log10();
            let scaled = 255.0 * (db - MIN_DECIBELS) / (MAX_DECIBELS - MIN_DECIBELS);
            out[k] = scaled.clamp(0.0, 255.0) as u8;
        }
        bins
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn silence_maps_to_zero_bytes() {
        let mut a = Analyser::new(256, 0.0);
        a.push(&[0.0; 256]);
        let mut out = [7u8; 128];
        assert_eq!(a.byte_frequency_data(&mut out), 128);
        assert!(out.iter().all(|&b| b == 0));
    }

    #[test]
    fn loud_tone_lights_up_its_bin() {
        let mut a = Analyser::new(256, 0.0);
        let sr = 48_000.0;
        // bin 16 center frequency
        let freq = 16.0 * sr / 256.0;
        let tone: Vec<f32> = (0..256)
            .map(|i| (2.0 * PI * freq * i as f32 / sr).sin())
            .collect();
        a.push(&tone);
        let mut out = [0u8; 128];
        a.byte_frequency_data(&mut out);
        assert!(out[16] > 200, "bin 16 = {}", out[16]);
        assert!(out[16] > out[60]);
    }

    #[test]
    fn fft_size_is_rounded_to_power_of_two() {
        let a = Analyser::new(200, 0.8);
        assert_eq!(a.fft_size(), 256);
        assert_eq!(a.bin_count(), 128);
    }

    #[test]
    fn oversized_fft_is_capped() {
        let a = Analyser::new(usize::MAX, 0.8);
        assert_eq!(a.fft_size(), MAX_FFT_SIZE);
        assert_eq!(Analyser::new(0, 0.8).fft_size(), MIN_FFT_SIZE);
    }
}
