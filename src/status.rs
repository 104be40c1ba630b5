//! Session status and level streams.
//!
//! Status goes through a `watch` channel, so late subscribers see the latest
//! value and unchanged updates are not re-sent. Level frames and error
//! messages go through `broadcast` channels; slow receivers lag and skip.

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};

use crate::effects::VoiceEffect;
use crate::level::AudioFrame;

const LEVEL_CAPACITY: usize = 8;
const ERROR_CAPACITY: usize = 16;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionState {
    #[default]
    Prompt,
    Granted,
    Denied,
    Error,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioStatus {
    pub permission: PermissionState,
    pub is_active: bool,
    pub is_muted: bool,
    pub current_effect: VoiceEffect,
}

/// No session: the microphone reads as muted until one starts.
impl Default for AudioStatus {
    fn default() -> Self {
        Self {
            permission: PermissionState::Prompt,
            is_active: false,
            is_muted: true,
            current_effect: VoiceEffect::None,
        }
    }
}

pub struct StatusPublisher {
    status: watch::Sender<AudioStatus>,
    levels: broadcast::Sender<AudioFrame>,
    errors: broadcast::Sender<String>,
}

impl Default for StatusPublisher {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusPublisher {
    pub fn new() -> Self {
        let (status, _) = watch::channel(AudioStatus::default());
        let (levels, _) = broadcast::channel(LEVEL_CAPACITY);
        let (errors, _) = broadcast::channel(ERROR_CAPACITY);
        Self {
            status,
            levels,
            errors,
        }
    }

    pub fn current(&self) -> AudioStatus {
        *self.status.borrow()
    }

    /// Apply `f` to the status; subscribers are only notified if it changed.
    /// Returns whether it changed.
    pub fn update(&self, f: impl FnOnce(&mut AudioStatus)) -> bool {
        self.status.send_if_modified(|status| {
            let before = *status;
            f(status);
            *status != before
        })
    }

    pub fn publish_level(&self, frame: AudioFrame) {
        // No receivers is fine.
        let _ = self.levels.send(frame);
    }

    pub fn publish_error(&self, message: impl Into<String>) {
        let message = message.into();
        log::warn!("{}", message);
        let _ = self.errors.send(message);
    }

    pub fn subscribe_status(&self) -> watch::Receiver<AudioStatus> {
        self.status.subscribe()
    }

    pub fn subscribe_levels(&self) -> broadcast::Receiver<AudioFrame> {
        self.levels.subscribe()
    }

    pub fn subscribe_errors(&self) -> broadcast::Receiver<String> {
        self.errors.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::level::LevelAnalyzer;

    #[test]
    fn status_serialises_camel_case() {
        let status = AudioStatus {
            permission: PermissionState::Granted,
            is_active: true,
            is_muted: false,
            current_effect: VoiceEffect::PitchDown,
        };
        let json = serde_json::to_value(status).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "permission": "granted",
                "isActive": true,
                "isMuted": false,
                "currentEffect": "pitch-down",
            })
        );
    }

    #[tokio::test]
    async fn unchanged_status_is_not_resent() {
        let publisher = StatusPublisher::new();
        let mut rx = publisher.subscribe_status();
        assert!(rx.borrow().is_muted);
        assert!(!publisher.update(|s| s.is_muted = true));
        assert!(!rx.has_changed().unwrap());

        assert!(publisher.update(|s| s.is_muted = false));
        rx.changed().await.unwrap();
        assert!(!rx.borrow_and_update().is_muted);
    }

    #[tokio::test]
    async fn late_subscriber_sees_latest_status() {
        let publisher = StatusPublisher::new();
        publisher.update(|s| s.permission = PermissionState::Denied);
        let rx = publisher.subscribe_status();
        assert_eq!(rx.borrow().permission, PermissionState::Denied);
    }

    #[tokio::test]
    async fn levels_reach_every_subscriber() {
        let publisher = StatusPublisher::new();
        let mut a = publisher.subscribe_levels();
        let mut b = publisher.subscribe_levels();
        let analyzer = LevelAnalyzer::new(0.05, 4);
        publisher.publish_level(analyzer.analyze(&[128; 4], false));
        assert_eq!(a.recv().await.unwrap().level, 1.0);
        assert_eq!(b.recv().await.unwrap().level, 1.0);
    }
}
