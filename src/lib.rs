//! voxfx - real-time voice capture, swappable effects, level metering and
//! click-free mute for voice rooms.
//!
//! [`AudioEngine`] is the entry point: it acquires a microphone through a
//! [`CaptureDevice`](audio::CaptureDevice), renders it through an effects
//! graph on a dedicated thread and publishes status and level streams.

pub mod audio;
pub mod config;
pub mod effects;
pub mod error;
pub mod gain;
pub mod graph;
pub mod level;
pub mod session;
pub mod spatial;
pub mod status;
pub mod status_bridge;

pub use config::Config;
pub use effects::VoiceEffect;
pub use error::AudioError;
pub use level::{AudioFrame, SpectrumBuffer};
pub use session::{AudioEngine, EngineOptions, GraphStats, Lifecycle};
pub use spatial::SpatialPosition;
pub use status::{AudioStatus, PermissionState};
