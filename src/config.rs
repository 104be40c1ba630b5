use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::audio::CaptureConstraints;
use crate::gain::{MAX_RAMP, MIN_RAMP};
use crate::graph::{DEFAULT_FFT_SIZE, MAX_FFT_SIZE, MIN_FFT_SIZE};
use crate::level::DEFAULT_NOISE_FLOOR;

/// 运行时配置，从 TOML 文件读取；缺省的段和字段使用默认值
#[derive(Debug, Deserialize, Serialize, Clone, Default, PartialEq)]
#[serde(default)]
pub struct Config {
    pub capture: CaptureConfig,
    pub analysis: AnalysisConfig,
    pub gain: GainConfig,
    pub bridge: BridgeConfig,
}

// 麦克风采集配置
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct CaptureConfig {
    pub device: String,
    pub sample_rate: u32,
    pub channels: u32,
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        let c = CaptureConstraints::default();
        Self {
            device: c.device,
            sample_rate: c.sample_rate,
            channels: c.channels,
            echo_cancellation: c.echo_cancellation,
            noise_suppression: c.noise_suppression,
            auto_gain_control: c.auto_gain_control,
        }
    }
}

impl CaptureConfig {
    pub fn constraints(&self) -> CaptureConstraints {
        CaptureConstraints {
            device: self.device.clone(),
            sample_rate: self.sample_rate,
            channels: self.channels,
            echo_cancellation: self.echo_cancellation,
            noise_suppression: self.noise_suppression,
            auto_gain_control: self.auto_gain_control,
        }
    }
}

// 电平分析配置
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct AnalysisConfig {
    pub noise_floor: f32,
    pub fft_size: usize,
    pub tick_interval_ms: u64,
    pub smoothing: f32,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            noise_floor: DEFAULT_NOISE_FLOOR,
            fft_size: DEFAULT_FFT_SIZE,
            tick_interval_ms: 16,
            smoothing: 0.8,
        }
    }
}

impl AnalysisConfig {
    /// Clamped to 32..=32768.
    pub fn fft_size(&self) -> usize {
        self.fft_size.clamp(MIN_FFT_SIZE, MAX_FFT_SIZE)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }
}

// 静音渐变配置
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct GainConfig {
    pub ramp_ms: u64,
}

impl Default for GainConfig {
    fn default() -> Self {
        Self { ramp_ms: 20 }
    }
}

impl GainConfig {
    /// Clamped to 20..=50 ms.
    pub fn ramp(&self) -> Duration {
        Duration::from_millis(self.ramp_ms).clamp(MIN_RAMP, MAX_RAMP)
    }
}

// 状态桥配置，通过本地UDP把状态发给界面进程
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct BridgeConfig {
    pub enabled: bool,
    pub local_port: u16,
    pub remote_addr: String,
    /// Forward one level frame every N analysis ticks; 0 disables levels.
    pub level_every_n_ticks: u32,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            local_port: 0,
            remote_addr: "127.0.0.1:5679".to_string(),
            level_every_n_ticks: 4,
        }
    }
}

impl Config {
    pub fn from_toml_str(text: &str) -> anyhow::Result<Self> {
        toml::from_str(text).context("Invalid configuration")
    }

    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_toml_str(&text).with_context(|| format!("In {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let config = Config::from_toml_str("").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.analysis.noise_floor, 0.05);
        assert_eq!(config.analysis.fft_size, 256);
        assert_eq!(config.capture.sample_rate, 48_000);
        assert!(!config.bridge.enabled);
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config = Config::from_toml_str(
            r#"
            [capture]
            device = "plughw:1,0"
            echo_cancellation = false

            [gain]
            ramp_ms = 500
            "#,
        )
        .unwrap();
        assert_eq!(config.capture.device, "plughw:1,0");
        assert!(!config.capture.echo_cancellation);
        assert!(config.capture.noise_suppression);
        assert_eq!(config.gain.ramp(), Duration::from_millis(50));
        assert_eq!(config.analysis.tick_interval(), Duration::from_millis(16));
    }

    #[test]
    fn out_of_range_fft_size_is_clamped() {
        let config =
            Config::from_toml_str("[analysis]\nfft_size = 9223372036854775807").unwrap();
        assert_eq!(config.analysis.fft_size(), 32_768);
        let config = Config::from_toml_str("[analysis]\nfft_size = 4").unwrap();
        assert_eq!(config.analysis.fft_size(), 32);
    }

    #[test]
    fn bad_types_are_rejected() {
        assert!(Config::from_toml_str("[analysis]\nnoise_floor = \"loud\"").is_err());
    }
}
