use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tokio::sync::mpsc;

use voxfx::audio::CaptureDevice;
use voxfx::status_bridge::StatusBridge;
use voxfx::{AudioEngine, Config, EngineOptions, SpatialPosition, VoiceEffect};

/// 控制台命令，对应房间界面里的按钮
#[derive(Debug, PartialEq)]
enum Command {
    Mute,
    Unmute,
    Effect(VoiceEffect),
    Pan(f32),
    Status,
    Quit,
}

fn parse_command(line: &str) -> Result<Command, String> {
    let mut parts = line.split_whitespace();
    let verb = parts.next().unwrap_or_default();
    let arg = parts.next();
    match (verb, arg) {
        ("mute", None) => Ok(Command::Mute),
        ("unmute", None) => Ok(Command::Unmute),
        ("status", None) => Ok(Command::Status),
        ("quit" | "exit", None) => Ok(Command::Quit),
        ("effect", Some(name)) => name
            .parse()
            .map(Command::Effect)
            .map_err(|e| format!("{}", e)),
        ("pan", Some(x)) => x
            .parse()
            .map(Command::Pan)
            .map_err(|_| format!("pan expects a number, got '{}'", x)),
        _ => Err(format!("unknown command '{}'", line.trim())),
    }
}

fn load_config() -> anyhow::Result<Config> {
    let path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("VOXFX_CONFIG").ok());
    match path {
        Some(path) => Config::load(path),
        None => Ok(Config::default()),
    }
}

#[cfg(feature = "alsa-capture")]
fn capture_device(_config: &Config) -> Arc<dyn CaptureDevice> {
    Arc::new(voxfx::audio::AlsaCapture)
}

/// 没有声卡时用合成的“说话声”代替麦克风
#[cfg(not(feature = "alsa-capture"))]
fn capture_device(config: &Config) -> Arc<dyn CaptureDevice> {
    use std::f32::consts::PI;
    use std::time::Duration;

    let (device, feeder) = voxfx::audio::ChannelCapture::new();
    let sample_rate = config.capture.sample_rate.max(1) as f32;
    tokio::spawn(async move {
        let block = (sample_rate / 50.0) as usize; // 20ms
        let mut ticker = tokio::time::interval(Duration::from_millis(20));
        let mut n: u64 = 0;
        loop {
            ticker.tick().await;
            let samples = (0..block)
                .map(|_| {
                    let t = n as f32 / sample_rate;
                    n += 1;
                    // 220 Hz voice-like tone with a 2 Hz syllable envelope
                    let envelope = (2.0 * PI * 2.0 * t).sin().max(0.0);
                    0.4 * envelope * (2.0 * PI * 220.0 * t).sin()
                })
                .collect();
            feeder.push(samples);
        }
    });
    Arc::new(device)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志
    env_logger::init();

    // 加载配置
    let config = load_config()?;

    // 处理后的音频输出，只统计峰值用于展示
    let (tx_output, mut rx_output) = mpsc::channel::<Vec<f32>>(32);
    let output_peak = Arc::new(Mutex::new(0.0f32));
    {
        let output_peak = output_peak.clone();
        tokio::spawn(async move {
            while let Some(block) = rx_output.recv().await {
                let peak = block.iter().fold(0.0f32, |m, s| m.max(s.abs()));
                *output_peak.lock() = peak;
            }
        });
    }

    let engine = Arc::new(
        AudioEngine::new(capture_device(&config), EngineOptions::from(&config))
            .with_output_sink(tx_output),
    );

    // 启动状态桥，把状态和电平发给界面进程
    if config.bridge.enabled {
        let bridge = StatusBridge::new(&config.bridge).await?;
        let (status, levels, errors) = (engine.status(), engine.levels(), engine.errors());
        tokio::spawn(async move {
            if let Err(e) = bridge.run(status, levels, errors).await {
                log::error!("StatusBridge error: {}", e);
            }
        });
    }

    let mut errors = engine.errors();
    let mut status = engine.status();
    let mut levels = engine.levels();

    if !engine.initialize(config.analysis.noise_floor).await? {
        println!(
            "Microphone unavailable ({:?}); commands will be ignored until restart",
            engine.current_status().permission
        );
    }

    // 标准输入命令通道
    let (tx_cmd, mut rx_cmd) = mpsc::channel::<String>(16);
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if tx_cmd.send(line).await.is_err() {
                break;
            }
        }
    });

    println!("voxfx ready. Commands: mute | unmute | effect <name> | pan <x> | status | quit");
    let mut last_level = None;

    loop {
        tokio::select! {
            // 监听 Ctrl+C 信号
            _ = signal::ctrl_c() => {
                println!("Received Ctrl+C, shutting down...");
                break;
            }

            Ok(()) = status.changed() => {
                let s = *status.borrow_and_update();
                println!(
                    "Status: permission={:?} active={} muted={} effect={}",
                    s.permission, s.is_active, s.is_muted, s.current_effect
                );
            }

            Ok(frame) = levels.recv() => {
                last_level = Some((frame.level, frame.is_speaking));
            }

            Ok(message) = errors.recv() => {
                eprintln!("Audio error: {}", message);
            }

            line = rx_cmd.recv() => {
                let Some(line) = line else { break };
                if line.trim().is_empty() {
                    continue;
                }
                let result = match parse_command(&line) {
                    Ok(Command::Mute) => engine.set_muted(true),
                    Ok(Command::Unmute) => engine.set_muted(false),
                    Ok(Command::Effect(effect)) => engine.apply_voice_effect(effect),
                    Ok(Command::Pan(x)) => engine.apply_spatial_position(SpatialPosition::new(x, 0.0, 0.0)),
                    Ok(Command::Status) => {
                        let s = engine.current_status();
                        let (level, speaking) = last_level.unwrap_or((0.0, false));
                        println!(
                            "{:?} | level {:.2} speaking={} | output peak {:.2} | {:?}",
                            s,
                            level,
                            speaking,
                            *output_peak.lock(),
                            engine.graph_stats()
                        );
                        Ok(())
                    }
                    Ok(Command::Quit) => break,
                    Err(e) => {
                        println!("{}", e);
                        Ok(())
                    }
                };
                if let Err(e) = result {
                    eprintln!("Command failed: {}", e);
                }
            }
        }
    }

    engine.dispose();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_room_commands() {
        assert_eq!(parse_command("mute"), Ok(Command::Mute));
        assert_eq!(parse_command("  unmute "), Ok(Command::Unmute));
        assert_eq!(
            parse_command("effect pitch-up"),
            Ok(Command::Effect(VoiceEffect::PitchUp))
        );
        assert_eq!(parse_command("pan -0.5"), Ok(Command::Pan(-0.5)));
        assert!(parse_command("pan left").is_err());
        assert!(parse_command("effect").is_err());
        assert!(parse_command("dance").is_err());
    }
}
