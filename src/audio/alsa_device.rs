//! ALSA microphone backend: PCM capture with SpeexDSP denoise/AGC.

use alsa::pcm::{Access, Format, HwParams, PCM};
use alsa::{Direction, ValueOr};
use anyhow::{Context, Result};
use async_trait::async_trait;

use super::capture::{
    CaptureConstraints, CaptureDevice, CaptureStream, MediaTrack, ReadOutcome, SampleSource,
};
use super::speex::Preprocessor;
use crate::error::AudioError;

const EPERM: i32 = 1;
const EACCES: i32 = 13;

/// Parameters negotiated with the ALSA hardware.
#[derive(Debug, Clone)]
pub struct AlsaParams {
    /// Actual sample rate after negotiation
    pub sample_rate: u32,
    /// Actual number of channels
    pub channels: u32,
    /// Period size in frames (one frame = channels × sample_width)
    pub period_size: usize,
}

/// Open a PCM device for capture (recording).
pub fn open_capture(device: &str, sample_rate: u32, channels: u32) -> Result<(PCM, AlsaParams)> {
    let pcm = PCM::new(device, Direction::Capture, false)
        .with_context(|| format!("Failed to open PCM device '{}' for Capture", device))?;

    {
        let hwp = HwParams::any(&pcm).with_context(|| "Failed to initialize HwParams")?;
        hwp.set_access(Access::RWInterleaved)?;
        hwp.set_format(Format::S16LE)?;
        hwp.set_channels(channels)?;
        hwp.set_rate_near(sample_rate, ValueOr::Nearest)?;
        pcm.hw_params(&hwp)?;
    }

    // Read back actual negotiated parameters
    let (actual_rate, actual_channels, period_size) = {
        let hwp = pcm.hw_params_current()?;
        (hwp.get_rate()?, hwp.get_channels()?, hwp.get_period_size()? as usize)
    };

    log::info!(
        "ALSA Capture: device={}, rate={}, channels={}, period_size={}",
        device,
        actual_rate,
        actual_channels,
        period_size,
    );

    Ok((
        pcm,
        AlsaParams {
            sample_rate: actual_rate,
            channels: actual_channels,
            period_size,
        },
    ))
}

/// Microphone access through ALSA. Opening happens on a blocking task.
#[derive(Debug, Default, Clone, Copy)]
pub struct AlsaCapture;

#[async_trait]
impl CaptureDevice for AlsaCapture {
    async fn acquire(&self, constraints: &CaptureConstraints) -> Result<CaptureStream, AudioError> {
        let constraints = constraints.clone();
        let opened = tokio::task::spawn_blocking(move || AlsaSource::open(&constraints)).await;
        match opened {
            Ok(Ok((source, rate, label))) => {
                Ok(CaptureStream::new(rate, MediaTrack::new(label), Box::new(source)))
            }
            Ok(Err(e)) => Err(classify(e)),
            Err(join) => Err(AudioError::device(join)),
        }
    }
}

fn classify(err: anyhow::Error) -> AudioError {
    let errno = err.downcast_ref::<alsa::Error>().map(|e| e.errno());
    match errno {
        Some(EACCES) | Some(EPERM) => {
            log::warn!("Capture device refused access: {:#}", err);
            AudioError::PermissionDenied
        }
        _ => AudioError::from(err),
    }
}

struct AlsaSource {
    pcm: PCM,
    channels: usize,
    period_size: usize,
    // One Speex state per channel for independent denoise/AGC.
    preprocessors: Vec<Preprocessor>,
    read_buf: Vec<i16>,
    channel_buffers: Vec<Vec<i16>>,
}

impl AlsaSource {
    fn open(constraints: &CaptureConstraints) -> Result<(Self, u32, String)> {
        let (pcm, params) =
            open_capture(&constraints.device, constraints.sample_rate, constraints.channels)?;
        let channels = params.channels as usize;
        let period_size = params.period_size;

        if constraints.echo_cancellation {
            log::warn!("Echo cancellation is not supported by the ALSA backend; continuing without it");
        }

        let mut preprocessors = Vec::new();
        if constraints.noise_suppression || constraints.auto_gain_control {
            for _ in 0..channels {
                let pp = Preprocessor::for_voice(
                    period_size,
                    params.sample_rate,
                    constraints.noise_suppression,
                    constraints.auto_gain_control,
                )?;
                preprocessors.push(pp);
            }
        }

        let source = Self {
            pcm,
            channels,
            period_size,
            preprocessors,
            read_buf: vec![0; period_size * channels],
            channel_buffers: (0..channels).map(|_| vec![0; period_size]).collect(),
        };
        let label = format!("alsa:{}", constraints.device);
        Ok((source, params.sample_rate, label))
    }
}

impl SampleSource for AlsaSource {
    fn read(&mut self, out: &mut [f32]) -> Result<ReadOutcome> {
        let io = self.pcm.io_i16()?;
        let frames = match io.readi(&mut self.read_buf) {
            Ok(frames) => frames,
            Err(e) => {
                log::warn!("ALSA capture error: {}, recovering...", e);
                self.pcm
                    .prepare()
                    .context("Failed to recover PCM capture")?;
                return Ok(ReadOutcome::Idle);
            }
        };

        let ch = self.channels;
        if !self.preprocessors.is_empty() {
            // Split interleaved -> per-channel, pad short reads to a full period
            for (c, buf) in self.channel_buffers.iter_mut().enumerate() {
                for i in 0..self.period_size {
                    buf[i] = if i < frames { self.read_buf[i * ch + c] } else { 0 };
                }
            }
            for (pp, buf) in self.preprocessors.iter_mut().zip(&mut self.channel_buffers) {
                pp.process(buf);
            }
            for (c, buf) in self.channel_buffers.iter().enumerate() {
                for i in 0..frames {
                    self.read_buf[i * ch + c] = buf[i];
                }
            }
        }

        // Downmix to mono f32
        let n = frames.min(out.len());
        for (i, sample) in out[..n].iter_mut().enumerate() {
            let frame = &self.read_buf[i * ch..(i + 1) * ch];
            let sum: i32 = frame.iter().map(|&s| i32::from(s)).sum();
            *sample = sum as f32 / (ch as f32 * 32768.0);
        }
        Ok(ReadOutcome::Frames(n))
    }

    fn preferred_block(&self) -> Option<usize> {
        Some(self.period_size)
    }
}
