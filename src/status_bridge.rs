use std::sync::Arc;

use serde::Serialize;
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, watch};

use crate::config::BridgeConfig;
use crate::level::AudioFrame;
use crate::status::AudioStatus;

/// 界面进程和本进程通过本地UDP通信，只传状态和电平，不传音频
pub struct StatusBridge {
    socket: Arc<UdpSocket>,
    target_addr: String,
    level_every: u32,
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
enum BridgeMessage<'a> {
    Status(&'a AudioStatus),
    Level(&'a AudioFrame),
    Error { text: &'a str },
}

impl StatusBridge {
    pub async fn new(config: &BridgeConfig) -> anyhow::Result<Self> {
        // 绑定本地UDP端口，0 表示由系统分配
        let socket = UdpSocket::bind(format!("127.0.0.1:{}", config.local_port)).await?;
        log::info!(
            "Status bridge bound to {}, sending to {}",
            socket.local_addr()?,
            config.remote_addr
        );
        Ok(Self {
            socket: Arc::new(socket),
            target_addr: config.remote_addr.clone(),
            level_every: config.level_every_n_ticks,
        })
    }

    pub fn local_addr(&self) -> anyhow::Result<std::net::SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Forward status changes, every Nth level frame and error messages
    /// until the status stream closes.
    pub async fn run(
        &self,
        mut status: watch::Receiver<AudioStatus>,
        mut levels: broadcast::Receiver<AudioFrame>,
        mut errors: broadcast::Receiver<String>,
    ) -> anyhow::Result<()> {
        let initial = *status.borrow_and_update();
        self.send(&BridgeMessage::Status(&initial)).await;

        let mut ticks: u32 = 0;
        loop {
            tokio::select! {
                changed = status.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let current = *status.borrow_and_update();
                    self.send(&BridgeMessage::Status(&current)).await;
                }
                frame = levels.recv() => match frame {
                    Ok(frame) => {
                        ticks = ticks.wrapping_add(1);
                        if self.level_every > 0 && ticks % self.level_every == 0 {
                            self.send(&BridgeMessage::Level(&frame)).await;
                        }
                    }
                    // 界面跟不上时直接跳过旧帧
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                message = errors.recv() => match message {
                    Ok(text) => self.send(&BridgeMessage::Error { text: &text }).await,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        log::warn!("Status bridge skipped {} error messages", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
        Ok(())
    }

    async fn send(&self, message: &BridgeMessage<'_>) {
        let json = match serde_json::to_string(message) {
            Ok(json) => json,
            Err(e) => {
                log::error!("Failed to encode bridge message: {}", e);
                return;
            }
        };
        if let Err(e) = self.socket.send_to(json.as_bytes(), &self.target_addr).await {
            log::debug!("Status bridge send failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::StatusPublisher;
    use std::time::Duration;

    async fn recv_json(ui: &UdpSocket) -> serde_json::Value {
        let mut buf = [0u8; 1024];
        let (n, _) = tokio::time::timeout(Duration::from_secs(2), ui.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        serde_json::from_slice(&buf[..n]).unwrap()
    }

    #[tokio::test]
    async fn forwards_status_changes_as_json() {
        let ui = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let config = BridgeConfig {
            enabled: true,
            local_port: 0,
            remote_addr: ui.local_addr().unwrap().to_string(),
            level_every_n_ticks: 0,
        };
        let bridge = StatusBridge::new(&config).await.unwrap();
        let publisher = StatusPublisher::new();
        let (status, levels, errors) = (
            publisher.subscribe_status(),
            publisher.subscribe_levels(),
            publisher.subscribe_errors(),
        );
        let task = tokio::spawn(async move { bridge.run(status, levels, errors).await });

        let first = recv_json(&ui).await;
        assert_eq!(first["type"], "status");
        assert_eq!(first["isActive"], false);

        publisher.update(|s| s.is_muted = false);
        let second = recv_json(&ui).await;
        assert_eq!(second["isMuted"], false);

        task.abort();
    }
}
