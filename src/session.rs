//! Session lifecycle manager.
//!
//! `AudioEngine` owns everything a live session needs: the capture track,
//! the graph and its effect chain, the analysis loop and the render thread.
//! Lock order is engine state, then analysis gate, then graph.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

use crate::audio::{CaptureConstraints, CaptureDevice, CaptureStream, MediaTrack, RenderThread};
use crate::config::Config;
use crate::effects::{EffectChain, EffectChainBuilder, VoiceEffect};
use crate::error::AudioError;
use crate::gain::GainController;
use crate::graph::{DspGraph, NodeId, ParamKind, SignalGraph};
use crate::level::{AudioFrame, LevelAnalyzer};
use crate::spatial::{SpatialPosition, SpatialStage};
use crate::status::{AudioStatus, PermissionState, StatusPublisher};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Lifecycle {
    Uninitialized,
    Initializing,
    Active,
    PermissionDenied,
    Error,
    /// Terminal.
    Disposed,
}

#[derive(Clone, Debug)]
pub struct EngineOptions {
    pub constraints: CaptureConstraints,
    pub fft_size: usize,
    pub smoothing: f32,
    pub tick_interval: Duration,
    pub ramp: Duration,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for EngineOptions {
    fn from(config: &Config) -> Self {
        Self {
            constraints: config.capture.constraints(),
            fft_size: config.analysis.fft_size(),
            smoothing: config.analysis.smoothing,
            tick_interval: config.analysis.tick_interval(),
            ramp: config.gain.ramp(),
        }
    }
}

/// Point-in-time view of the session graph, for diagnostics and tests.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GraphStats {
    pub nodes: usize,
    pub connections: usize,
    pub oscillators: usize,
    pub running_oscillators: usize,
    /// Master gain once any in-flight ramp completes.
    pub master_gain: f32,
    pub rendering: bool,
}

pub struct AudioEngine {
    device: Arc<dyn CaptureDevice>,
    options: EngineOptions,
    output: Option<mpsc::Sender<Vec<f32>>>,
    publisher: Arc<StatusPublisher>,
    state: Mutex<EngineState>,
    // Flipped to true by dispose; wakes an initialize waiting on the device.
    closed: watch::Sender<bool>,
}

struct EngineState {
    lifecycle: Lifecycle,
    attempt: u64,
    session: Option<Session>,
}

impl AudioEngine {
    pub fn new(device: Arc<dyn CaptureDevice>, options: EngineOptions) -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            device,
            options,
            output: None,
            publisher: Arc::new(StatusPublisher::new()),
            state: Mutex::new(EngineState {
                lifecycle: Lifecycle::Uninitialized,
                attempt: 0,
                session: None,
            }),
            closed,
        }
    }

    /// Forward rendered interleaved stereo blocks to `sink`.
    pub fn with_output_sink(mut self, sink: mpsc::Sender<Vec<f32>>) -> Self {
        self.output = Some(sink);
        self
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.state.lock().lifecycle
    }

    pub fn status(&self) -> watch::Receiver<AudioStatus> {
        self.publisher.subscribe_status()
    }

    pub fn current_status(&self) -> AudioStatus {
        self.publisher.current()
    }

    pub fn levels(&self) -> broadcast::Receiver<AudioFrame> {
        self.publisher.subscribe_levels()
    }

    pub fn errors(&self) -> broadcast::Receiver<String> {
        self.publisher.subscribe_errors()
    }

    /// Capture track of the live session.
    pub fn track(&self) -> Option<MediaTrack> {
        let st = self.state.lock();
        st.session.as_ref().map(|s| s.track.clone())
    }

    pub fn graph_stats(&self) -> Option<GraphStats> {
        let st = self.state.lock();
        st.session.as_ref().map(Session::stats)
    }

    /// Request the microphone and build the session with the passthrough
    /// effect. Returns `Ok(false)` when access is denied, the device fails,
    /// or the session is disposed while waiting; details go to the status
    /// and error streams. Can be retried after a denial or failure.
    pub async fn initialize(&self, noise_floor: f32) -> Result<bool, AudioError> {
        let (attempt, mut closed) = {
            let mut st = self.state.lock();
            match st.lifecycle {
                Lifecycle::Disposed => return Err(AudioError::SessionClosed),
                Lifecycle::Active => return Ok(true),
                Lifecycle::Initializing => {
                    log::warn!("initialize called while another is in flight");
                    return Ok(false);
                }
                Lifecycle::Uninitialized | Lifecycle::PermissionDenied | Lifecycle::Error => {}
            }
            st.lifecycle = Lifecycle::Initializing;
            st.attempt += 1;
            (st.attempt, self.closed.subscribe())
        };
        self.publisher.update(|s| s.permission = PermissionState::Prompt);
        log::info!(
            "Requesting microphone '{}' ({} Hz)",
            self.options.constraints.device,
            self.options.constraints.sample_rate
        );

        let acquired = tokio::select! {
            result = self.device.acquire(&self.options.constraints) => result,
            _ = closed.changed() => {
                log::info!("Session disposed while waiting for microphone access");
                return Ok(false);
            }
        };

        let stream = match acquired {
            Ok(stream) => stream,
            Err(e) => {
                self.fail_initialize(attempt, e);
                return Ok(false);
            }
        };

        let mut st = self.state.lock();
        if st.lifecycle != Lifecycle::Initializing || st.attempt != attempt {
            log::info!("Discarding microphone stream acquired after dispose");
            stream.release();
            return Ok(false);
        }

        match self.start_session(stream, noise_floor) {
            Ok(session) => {
                log::info!(
                    "Audio session {} active at {} Hz (noise floor {:.3})",
                    session.id,
                    session.sample_rate,
                    session.analyzer.noise_floor()
                );
                st.session = Some(session);
                st.lifecycle = Lifecycle::Active;
                self.publisher.update(|s| {
                    s.permission = PermissionState::Granted;
                    s.is_active = true;
                    s.is_muted = false;
                    s.current_effect = VoiceEffect::None;
                });
                Ok(true)
            }
            Err(e) => {
                st.lifecycle = Lifecycle::Error;
                self.publisher.update(|s| {
                    s.permission = PermissionState::Error;
                    s.is_active = false;
                });
                drop(st);
                self.publisher
                    .publish_error(format!("Failed to start audio session: {}", e));
                Ok(false)
            }
        }
    }

    fn fail_initialize(&self, attempt: u64, err: AudioError) {
        {
            let mut st = self.state.lock();
            if st.lifecycle != Lifecycle::Initializing || st.attempt != attempt {
                return;
            }
            let (lifecycle, permission) = match err {
                AudioError::PermissionDenied => (Lifecycle::PermissionDenied, PermissionState::Denied),
                _ => (Lifecycle::Error, PermissionState::Error),
            };
            st.lifecycle = lifecycle;
            self.publisher.update(|s| {
                s.permission = permission;
                s.is_active = false;
            });
        }
        self.publisher
            .publish_error(format!("Microphone unavailable: {}", err));
    }

    fn start_session(&self, stream: CaptureStream, noise_floor: f32) -> Result<Session, AudioError> {
        let sample_rate = stream.sample_rate();
        let mut graph = DspGraph::new(sample_rate);
        let source = graph.create_source();
        let analyser = graph.create_analyser(self.options.fft_size, self.options.smoothing);
        let master = graph.create_gain(1.0);
        let destination = graph.create_destination();
        graph.connect(analyser, master)?;
        graph.connect(master, destination)?;

        let builder = EffectChainBuilder::new(source, analyser);
        let chain = builder.build(&mut graph, VoiceEffect::None)?;
        let bins = graph.frequency_bin_count(analyser)?;
        let graph = Arc::new(Mutex::new(graph));

        let track = stream.track().clone();
        track.set_enabled(true);
        let render = RenderThread::spawn(stream.into_reader(), graph.clone(), self.output.clone())?;

        let muted = Arc::new(AtomicBool::new(false));
        let analyzer = Arc::new(LevelAnalyzer::new(noise_floor, bins));
        let analysis = AnalysisLoop::spawn(
            Meter {
                graph: graph.clone(),
                analyser,
                analyzer: analyzer.clone(),
                muted: muted.clone(),
                publisher: self.publisher.clone(),
            },
            self.options.tick_interval,
        );

        Ok(Session {
            id: Uuid::new_v4(),
            sample_rate,
            graph,
            builder,
            chain,
            gain: GainController::new(master, self.options.ramp),
            spatial: SpatialStage::new(master, destination),
            track,
            muted,
            analyzer,
            analysis,
            render,
        })
    }

    /// Soft mute (gain ramp) and hard mute (track enable) together.
    pub fn set_muted(&self, muted: bool) -> Result<(), AudioError> {
        let mut st = self.state.lock();
        let Some(session) = active_session(&mut st)? else {
            return Ok(());
        };

        session
            .gain
            .set_muted(&mut *session.graph.lock(), &session.track, muted)
            .map_err(|e| AudioError::device(format!("mute ramp failed: {}", e)))?;
        session.muted.store(muted, Ordering::SeqCst);
        self.publisher.update(|s| s.is_muted = muted);
        drop(st);

        log::info!("Microphone {}", if muted { "muted" } else { "unmuted" });
        Ok(())
    }

    /// Swap the effect chain. Rebuilds are serialised by the state lock; a
    /// chain that cannot be built falls back to passthrough and is reported
    /// on the error stream only.
    pub fn apply_voice_effect(&self, effect: VoiceEffect) -> Result<(), AudioError> {
        let mut st = self.state.lock();
        let Some(session) = active_session(&mut st)? else {
            return Ok(());
        };

        let source = session.builder.source();
        let previous = std::mem::replace(&mut session.chain, EffectChain::detached(source));
        let (chain, err) = {
            let mut graph = session.graph.lock();
            session.builder.switch(&mut *graph, previous, effect)
        };
        let current = chain.effect();
        session.chain = chain;
        self.publisher.update(|s| s.current_effect = current);
        drop(st);

        if let Some(e) = err {
            self.publisher.publish_error(format!(
                "Voice effect '{}' unavailable, using passthrough: {}",
                effect, e
            ));
        }
        Ok(())
    }

    pub fn apply_spatial_position(&self, position: SpatialPosition) -> Result<(), AudioError> {
        let mut st = self.state.lock();
        let Some(session) = active_session(&mut st)? else {
            return Ok(());
        };
        let applied = session.spatial.apply(&mut session.graph.lock(), position);
        drop(st);

        if let Err(e) = applied {
            self.publisher
                .publish_error(format!("Spatial position not applied: {}", e));
        }
        Ok(())
    }

    /// Meter a caller-supplied magnitude buffer as if it came from the
    /// analyser tap, and publish the frame. `None` when no session is active.
    pub fn analyze_magnitudes(&self, magnitudes: &[u8]) -> Result<Option<AudioFrame>, AudioError> {
        let mut st = self.state.lock();
        let Some(session) = active_session(&mut st)? else {
            return Ok(None);
        };
        let frame = session
            .analyzer
            .analyze(magnitudes, session.muted.load(Ordering::SeqCst));
        drop(st);

        self.publisher.publish_level(frame.clone());
        Ok(Some(frame))
    }

    /// Tear the session down. Every step runs regardless of earlier ones;
    /// calling it again is a no-op.
    pub fn dispose(&self) {
        let (session, previous) = {
            let mut st = self.state.lock();
            if st.lifecycle == Lifecycle::Disposed {
                log::debug!("dispose on a closed session ignored");
                return;
            }
            let previous = st.lifecycle;
            st.lifecycle = Lifecycle::Disposed;
            self.closed.send_replace(true);
            (st.session.take(), previous)
        };
        log::info!("Disposing audio session (was {:?})", previous);

        if let Some(session) = session {
            let silent = session.shutdown();
            self.publisher.publish_level(silent);
        }
        self.publisher.update(|s| {
            s.is_active = false;
            s.is_muted = true;
            s.current_effect = VoiceEffect::None;
        });
    }
}

impl Drop for AudioEngine {
    fn drop(&mut self) {
        self.dispose();
    }
}

fn active_session(st: &mut EngineState) -> Result<Option<&mut Session>, AudioError> {
    match st.lifecycle {
        Lifecycle::Disposed => Err(AudioError::SessionClosed),
        Lifecycle::Active => Ok(st.session.as_mut()),
        _ => Ok(None),
    }
}

struct Session {
    id: Uuid,
    sample_rate: u32,
    graph: Arc<Mutex<DspGraph>>,
    builder: EffectChainBuilder,
    chain: EffectChain,
    gain: GainController,
    spatial: SpatialStage,
    track: MediaTrack,
    muted: Arc<AtomicBool>,
    analyzer: Arc<LevelAnalyzer>,
    analysis: AnalysisLoop,
    render: RenderThread,
}

impl Session {
    fn stats(&self) -> GraphStats {
        let graph = self.graph.lock();
        GraphStats {
            nodes: graph.node_count(),
            connections: graph.connection_count(),
            oscillators: graph.oscillator_count(),
            running_oscillators: graph.running_oscillator_count(),
            master_gain: graph
                .param(self.gain.node(), ParamKind::Gain)
                .map(|p| p.settled_value())
                .unwrap_or(0.0),
            rendering: self.render.is_running(),
        }
    }

    /// Ordered teardown. Returns the zeroed level frame to publish.
    fn shutdown(self) -> AudioFrame {
        let Session {
            id,
            graph,
            chain,
            track,
            analyzer,
            analysis,
            mut render,
            ..
        } = self;

        // 1. no tick runs once this returns
        analysis.cancel();

        // 2. disconnect the chain, stop its oscillators
        if let Err(e) = chain.teardown(&mut *graph.lock()) {
            log::warn!("Effect chain teardown incomplete: {}", e);
        }

        // 3. release the microphone
        track.stop();

        // 4. close the graph
        render.stop();
        drop(graph);

        log::info!("Audio session {} closed", id);
        analyzer.silent_frame()
    }
}

/// Everything one analysis tick touches.
struct Meter {
    graph: Arc<Mutex<DspGraph>>,
    analyser: NodeId,
    analyzer: Arc<LevelAnalyzer>,
    muted: Arc<AtomicBool>,
    publisher: Arc<StatusPublisher>,
}

impl Meter {
    fn tick(&self) {
        let muted = self.muted.load(Ordering::SeqCst);
        let frame = self.analyzer.tick(muted, |buf| {
            // A vanished tap mid-teardown skips the tick.
            self.graph.lock().byte_frequency_data(self.analyser, buf).ok()
        });
        if let Some(frame) = frame {
            self.publisher.publish_level(frame);
        }
    }
}

struct AnalysisLoop {
    // Held for the duration of each tick; `true` once cancelled.
    gate: Arc<Mutex<bool>>,
    task: JoinHandle<()>,
}

impl AnalysisLoop {
    fn spawn(meter: Meter, every: Duration) -> Self {
        let gate = Arc::new(Mutex::new(false));
        let task = {
            let gate = gate.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(every);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                loop {
                    ticker.tick().await;
                    let ran = {
                        let cancelled = gate.lock();
                        if !*cancelled {
                            meter.tick();
                        }
                        !*cancelled
                    };
                    if !ran {
                        break;
                    }
                }
            })
        };
        Self { gate, task }
    }

    /// Synchronous: waits out a tick in progress, and none start afterwards.
    fn cancel(self) {
        *self.gate.lock() = true;
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::ChannelCapture;

    fn engine() -> (AudioEngine, crate::audio::SampleFeeder) {
        let (device, feeder) = ChannelCapture::new();
        (AudioEngine::new(Arc::new(device), EngineOptions::default()), feeder)
    }

    #[tokio::test]
    async fn initialize_activates_with_passthrough() {
        let (engine, _feeder) = engine();
        assert_eq!(engine.lifecycle(), Lifecycle::Uninitialized);
        assert!(engine.initialize(0.05).await.unwrap());
        assert_eq!(engine.lifecycle(), Lifecycle::Active);

        let status = engine.current_status();
        assert_eq!(status.permission, PermissionState::Granted);
        assert!(status.is_active);
        assert!(!status.is_muted);
        assert_eq!(status.current_effect, VoiceEffect::None);
        // source, analyser, master gain, destination
        assert_eq!(engine.graph_stats().unwrap().nodes, 4);
        engine.dispose();
    }

    #[tokio::test]
    async fn oversized_fft_from_config_still_initializes() {
        let config = Config::from_toml_str("[analysis]\nfft_size = 9223372036854775807").unwrap();
        let (device, _feeder) = ChannelCapture::new();
        let engine = AudioEngine::new(Arc::new(device), EngineOptions::from(&config));
        assert!(engine.initialize(0.05).await.unwrap());
        let frame = engine.analyze_magnitudes(&[0; 4]).unwrap().unwrap();
        assert_eq!(frame.spectrum.len(), 16_384);
        engine.dispose();
    }

    #[tokio::test]
    async fn robot_scenario_meters_and_respects_mute() {
        let (engine, _feeder) = engine();
        assert!(engine.initialize(0.05).await.unwrap());
        engine.apply_voice_effect(VoiceEffect::Robot).unwrap();
        assert_eq!(engine.current_status().current_effect, VoiceEffect::Robot);

        let magnitudes = [100u8; 128];
        let frame = engine.analyze_magnitudes(&magnitudes).unwrap().unwrap();
        assert!((frame.level - 0.78).abs() < 0.01, "level {}", frame.level);
        assert!(frame.is_speaking);

        engine.set_muted(true).unwrap();
        let frame = engine.analyze_magnitudes(&magnitudes).unwrap().unwrap();
        assert!((frame.level - 0.78).abs() < 0.01);
        assert!(!frame.is_speaking);
        engine.dispose();
    }

    #[tokio::test]
    async fn denial_is_reported_and_retry_works() {
        let (engine, feeder) = engine();
        feeder.deny();
        assert!(!engine.initialize(0.05).await.unwrap());
        assert_eq!(engine.lifecycle(), Lifecycle::PermissionDenied);
        assert_eq!(engine.current_status().permission, PermissionState::Denied);

        // Not active: controls are quiet no-ops.
        engine.set_muted(false).unwrap();
        assert!(engine.current_status().is_muted);

        feeder.grant();
        assert!(engine.initialize(0.05).await.unwrap());
        assert_eq!(engine.current_status().permission, PermissionState::Granted);
        engine.dispose();
    }

    #[tokio::test]
    async fn device_failure_maps_to_error_state() {
        let (engine, feeder) = engine();
        let mut errors = engine.errors();
        feeder.fail("card vanished");
        assert!(!engine.initialize(0.05).await.unwrap());
        assert_eq!(engine.lifecycle(), Lifecycle::Error);
        assert_eq!(engine.current_status().permission, PermissionState::Error);
        assert!(errors.recv().await.unwrap().contains("card vanished"));
    }

    #[tokio::test]
    async fn operations_after_dispose_fail_closed() {
        let (engine, _feeder) = engine();
        assert!(engine.initialize(0.05).await.unwrap());
        engine.dispose();
        engine.dispose();
        assert_eq!(engine.lifecycle(), Lifecycle::Disposed);
        assert_eq!(engine.set_muted(true), Err(AudioError::SessionClosed));
        assert_eq!(
            engine.apply_voice_effect(VoiceEffect::Echo),
            Err(AudioError::SessionClosed)
        );
        assert_eq!(engine.initialize(0.05).await, Err(AudioError::SessionClosed));
        assert!(engine.graph_stats().is_none());
    }
}
