//! Capture devices, stream handles and the in-process channel backend.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::AudioError;

/// What the session asks of the microphone.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureConstraints {
    /// Backend device name (e.g. "default", "plughw:0,0").
    pub device: String,
    pub sample_rate: u32,
    pub channels: u32,
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
}

impl Default for CaptureConstraints {
    fn default() -> Self {
        Self {
            device: "default".to_string(),
            sample_rate: 48_000,
            channels: 1,
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
        }
    }
}

#[async_trait]
pub trait CaptureDevice: Send + Sync {
    /// Ask for microphone access and open a live stream.
    async fn acquire(&self, constraints: &CaptureConstraints) -> Result<CaptureStream, AudioError>;
}

struct TrackState {
    label: String,
    enabled: AtomicBool,
    live: AtomicBool,
}

/// Shared handle to a capture track. A disabled track delivers silence
/// (hard mute); a stopped track ends its stream for good.
#[derive(Clone)]
pub struct MediaTrack {
    inner: Arc<TrackState>,
}

impl MediaTrack {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(TrackState {
                label: label.into(),
                enabled: AtomicBool::new(true),
                live: AtomicBool::new(true),
            }),
        }
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.inner.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::SeqCst)
    }

    /// Idempotent.
    pub fn stop(&self) {
        if self.inner.live.swap(false, Ordering::SeqCst) {
            log::info!("Capture track '{}' stopped", self.inner.label);
        }
    }

    pub fn is_live(&self) -> bool {
        self.inner.live.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for MediaTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaTrack")
            .field("label", &self.inner.label)
            .field("enabled", &self.is_enabled())
            .field("live", &self.is_live())
            .finish()
    }
}

/// Result of one blocking read from a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// This many mono frames were written.
    Frames(usize),
    /// Nothing arrived within the backend's poll window.
    Idle,
    Closed,
}

/// Backend side of a stream. Reads mono f32 samples and may block briefly.
pub trait SampleSource: Send {
    fn read(&mut self, out: &mut [f32]) -> anyhow::Result<ReadOutcome>;

    /// Block size the backend naturally produces, if it has one.
    fn preferred_block(&self) -> Option<usize> {
        None
    }
}

/// Blocking reader owned by the render thread. Applies the track's enable
/// flag and stops the track when dropped.
pub struct SampleReader {
    track: MediaTrack,
    source: Box<dyn SampleSource>,
}

impl SampleReader {
    pub fn track(&self) -> &MediaTrack {
        &self.track
    }

    pub fn preferred_block(&self) -> Option<usize> {
        self.source.preferred_block()
    }

    /// `None` once the stream has ended: the track was stopped, the backend
    /// closed, or the backend failed.
    pub fn read(&mut self, out: &mut [f32]) -> Option<usize> {
        if !self.track.is_live() {
            return None;
        }
        match self.source.read(out) {
            Ok(ReadOutcome::Frames(n)) => {
                let n = n.min(out.len());
                if !self.track.is_enabled() {
                    out[..n].fill(0.0);
                }
                Some(n)
            }
            Ok(ReadOutcome::Idle) => Some(0),
            Ok(ReadOutcome::Closed) => {
                log::info!("Capture source for '{}' closed", self.track.label());
                self.track.stop();
                None
            }
            Err(e) => {
                log::error!("Capture read on '{}' failed: {:#}", self.track.label(), e);
                self.track.stop();
                None
            }
        }
    }
}

impl Drop for SampleReader {
    fn drop(&mut self) {
        self.track.stop();
    }
}

/// A live microphone stream: the shared track plus the sample reader.
pub struct CaptureStream {
    sample_rate: u32,
    reader: SampleReader,
}

impl CaptureStream {
    pub fn new(sample_rate: u32, track: MediaTrack, source: Box<dyn SampleSource>) -> Self {
        Self {
            sample_rate,
            reader: SampleReader { track, source },
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn track(&self) -> &MediaTrack {
        self.reader.track()
    }

    pub fn into_reader(self) -> SampleReader {
        self.reader
    }

    /// Stop every track of this stream. Idempotent.
    pub fn release(&self) {
        self.reader.track.stop();
    }
}

// ======================== Channel backend ========================

const CHANNEL_POLL: Duration = Duration::from_millis(20);
const CHANNEL_DEPTH: usize = 64;

#[derive(Debug, Clone, Default)]
enum Script {
    #[default]
    Grant,
    Deny,
    Fail(String),
}

#[derive(Default)]
struct ChannelShared {
    script: Mutex<Script>,
    delay: Mutex<Option<Duration>>,
    sender: Mutex<Option<SyncSender<Vec<f32>>>>,
    track: Mutex<Option<MediaTrack>>,
    acquisitions: AtomicUsize,
}

/// Capture device fed from inside the process through a [`SampleFeeder`].
/// Used for synthetic sources and for exercising permission outcomes.
pub struct ChannelCapture {
    shared: Arc<ChannelShared>,
}

/// Pushes samples into whichever stream [`ChannelCapture`] handed out last,
/// and scripts how the next acquisition behaves.
#[derive(Clone)]
pub struct SampleFeeder {
    shared: Arc<ChannelShared>,
}

impl ChannelCapture {
    pub fn new() -> (Self, SampleFeeder) {
        let shared = Arc::new(ChannelShared::default());
        (
            Self {
                shared: shared.clone(),
            },
            SampleFeeder { shared },
        )
    }
}

#[async_trait]
impl CaptureDevice for ChannelCapture {
    async fn acquire(&self, constraints: &CaptureConstraints) -> Result<CaptureStream, AudioError> {
        let delay = *self.shared.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let script = self.shared.script.lock().clone();
        match script {
            Script::Grant => {}
            Script::Deny => return Err(AudioError::PermissionDenied),
            Script::Fail(msg) => return Err(AudioError::DeviceError(msg)),
        }

        let n = self.shared.acquisitions.fetch_add(1, Ordering::SeqCst) + 1;
        let (tx, rx) = mpsc::sync_channel(CHANNEL_DEPTH);
        let track = MediaTrack::new(format!("channel-{}", n));
        *self.shared.sender.lock() = Some(tx);
        *self.shared.track.lock() = Some(track.clone());

        log::info!(
            "Channel capture '{}' opened at {} Hz (device hint '{}')",
            track.label(),
            constraints.sample_rate,
            constraints.device
        );
        let source = ChannelSource {
            rx,
            pending: Vec::new(),
            offset: 0,
        };
        Ok(CaptureStream::new(constraints.sample_rate, track, Box::new(source)))
    }
}

impl SampleFeeder {
    /// Queue a block of mono samples. Returns false when no stream is open
    /// or its queue is full.
    pub fn push(&self, samples: Vec<f32>) -> bool {
        let sender = self.shared.sender.lock();
        let Some(tx) = sender.as_ref() else {
            return false;
        };
        match tx.try_send(samples) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => false,
        }
    }

    /// Make subsequent acquisitions fail with `PermissionDenied`.
    pub fn deny(&self) {
        *self.shared.script.lock() = Script::Deny;
    }

    /// Make subsequent acquisitions fail with a device error.
    pub fn fail(&self, message: impl Into<String>) {
        *self.shared.script.lock() = Script::Fail(message.into());
    }

    pub fn grant(&self) {
        *self.shared.script.lock() = Script::Grant;
    }

    /// Hold every acquisition for `delay` before resolving, like a slow
    /// permission prompt.
    pub fn set_delay(&self, delay: Option<Duration>) {
        *self.shared.delay.lock() = delay;
    }

    /// Track of the most recently opened stream.
    pub fn last_track(&self) -> Option<MediaTrack> {
        self.shared.track.lock().clone()
    }

    pub fn acquisitions(&self) -> usize {
        self.shared.acquisitions.load(Ordering::SeqCst)
    }

    /// Close the current stream from the device side.
    pub fn close(&self) {
        self.shared.sender.lock().take();
    }
}

struct ChannelSource {
    rx: Receiver<Vec<f32>>,
    pending: Vec<f32>,
    offset: usize,
}

impl SampleSource for ChannelSource {
    fn read(&mut self, out: &mut [f32]) -> anyhow::Result<ReadOutcome> {
        if self.offset >= self.pending.len() {
            match self.rx.recv_timeout(CHANNEL_POLL) {
                Ok(block) => {
                    self.pending = block;
                    self.offset = 0;
                }
                Err(RecvTimeoutError::Timeout) => return Ok(ReadOutcome::Idle),
                Err(RecvTimeoutError::Disconnected) => return Ok(ReadOutcome::Closed),
            }
        }
        let n = (self.pending.len() - self.offset).min(out.len());
        out[..n].copy_from_slice(&self.pending[self.offset..self.offset + n]);
        self.offset += n;
        Ok(ReadOutcome::Frames(n))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn feeder_reaches_reader_and_disable_silences() {
        let (device, feeder) = ChannelCapture::new();
        let stream = device.acquire(&CaptureConstraints::default()).await.unwrap();
        assert_eq!(stream.sample_rate(), 48_000);
        let track = stream.track().clone();
        let mut reader = stream.into_reader();

        assert!(feeder.push(vec![0.25; 4]));
        let mut buf = [0.0f32; 8];
        assert_eq!(reader.read(&mut buf), Some(4));
        assert_eq!(&buf[..4], &[0.25; 4]);

        track.set_enabled(false);
        assert!(feeder.push(vec![0.25; 4]));
        assert_eq!(reader.read(&mut buf), Some(4));
        assert_eq!(&buf[..4], &[0.0; 4]);
    }

    #[tokio::test]
    async fn stopped_track_ends_the_stream() {
        let (device, feeder) = ChannelCapture::new();
        let stream = device.acquire(&CaptureConstraints::default()).await.unwrap();
        stream.release();
        stream.release();
        let mut reader = stream.into_reader();
        feeder.push(vec![1.0; 4]);
        assert_eq!(reader.read(&mut [0.0; 4]), None);
    }

    #[tokio::test]
    async fn dropping_the_stream_stops_its_track() {
        let (device, feeder) = ChannelCapture::new();
        let stream = device.acquire(&CaptureConstraints::default()).await.unwrap();
        drop(stream);
        assert!(!feeder.last_track().unwrap().is_live());
    }

    #[tokio::test]
    async fn scripted_failures() {
        let (device, feeder) = ChannelCapture::new();
        feeder.deny();
        let err = device.acquire(&CaptureConstraints::default()).await.err();
        assert_eq!(err, Some(AudioError::PermissionDenied));

        feeder.fail("no such card");
        let err = device.acquire(&CaptureConstraints::default()).await.err();
        assert_eq!(err, Some(AudioError::DeviceError("no such card".into())));
        assert_eq!(feeder.acquisitions(), 0);

        feeder.grant();
        assert!(device.acquire(&CaptureConstraints::default()).await.is_ok());
        assert_eq!(feeder.acquisitions(), 1);
    }

    #[tokio::test]
    async fn closing_the_feeder_side_closes_the_reader() {
        let (device, feeder) = ChannelCapture::new();
        let mut reader = device
            .acquire(&CaptureConstraints::default())
            .await
            .unwrap()
            .into_reader();
        feeder.close();
        assert_eq!(reader.read(&mut [0.0; 4]), None);
        assert!(!reader.track().is_live());
    }
}
