//! Persistent configuration for the demo binary
//!
//! Stores device name, timing, buffering and waveform settings in a JSON
//! file at `<config_dir>/daqstream/config.json`.

use daqstream_core::stream::channels::ChannelSet;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

fn default_device() -> String {
    "Dev1".to_string()
}

fn default_sample_rate() -> f64 {
    daqstream_core::DEFAULT_SAMPLE_RATE
}

fn default_buffer_frames() -> usize {
    daqstream_core::DEFAULT_BUFFER_FRAMES
}

fn default_regeneration() -> bool {
    true
}

fn default_wave_amplitude() -> f64 {
    1.5
}

fn default_wave_length() -> usize {
    500
}

fn default_input_channels() -> Vec<String> {
    vec!["ai0".to_string()]
}

fn default_output_channels() -> Vec<String> {
    vec!["ao0".to_string()]
}

/// How an output task is buffered and refilled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputPlan {
    pub buffer_frames: usize,
    pub regeneration: bool,
    /// Frames per refill callback; `None` when the device replays the buffer
    pub threshold: Option<usize>,
}

/// Persistent application configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Device name, prefixed to every channel (`Dev1/ai0`)
    #[serde(default = "default_device")]
    pub device: String,
    /// Sample clock rate in Hz
    #[serde(default = "default_sample_rate")]
    pub sample_rate: f64,
    /// Buffer size per task in frames
    #[serde(default = "default_buffer_frames")]
    pub buffer_frames: usize,
    /// Frames between notifications (None = half the buffer)
    #[serde(default)]
    pub callback_threshold: Option<usize>,
    /// Replay the output buffer instead of refilling it (`mixed`, `do-pattern`)
    #[serde(default = "default_regeneration")]
    pub regeneration: bool,
    /// Peak output voltage
    #[serde(default = "default_wave_amplitude")]
    pub wave_amplitude: f64,
    /// Points per output waveform period
    #[serde(default = "default_wave_length")]
    pub wave_length: usize,
    #[serde(default = "default_input_channels")]
    pub input_channels: Vec<String>,
    #[serde(default = "default_output_channels")]
    pub output_channels: Vec<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            device: default_device(),
            sample_rate: default_sample_rate(),
            buffer_frames: default_buffer_frames(),
            callback_threshold: None,
            regeneration: default_regeneration(),
            wave_amplitude: default_wave_amplitude(),
            wave_length: default_wave_length(),
            input_channels: default_input_channels(),
            output_channels: default_output_channels(),
        }
    }
}

impl AppConfig {
    /// Config file path: `<config_dir>/daqstream/config.json`
    pub fn path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("daqstream")
            .join("config.json")
    }

    /// Load config from the default path
    pub fn load() -> Self {
        Self::load_from(&Self::path())
    }

    /// Load config from `path`, falling back to defaults on any error
    pub fn load_from(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => match serde_json::from_str::<Self>(&contents) {
                Ok(config) => match config.validate() {
                    Ok(()) => {
                        tracing::info!(path = %path.display(), "Loaded config from disk");
                        config
                    }
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "Invalid config, using defaults");
                        Self::default()
                    }
                },
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Failed to parse config, using defaults");
                    Self::default()
                }
            },
            Err(_) => {
                tracing::info!(path = %path.display(), "No config file found, using defaults");
                Self::default()
            }
        }
    }

    /// Check values the demos cannot run with
    pub fn validate(&self) -> anyhow::Result<()> {
        if !(self.sample_rate.is_finite() && self.sample_rate > 0.0) {
            anyhow::bail!("sample_rate must be positive, got {}", self.sample_rate);
        }
        if self.buffer_frames == 0 {
            anyhow::bail!("buffer_frames must be at least 1");
        }
        if self.wave_length == 0 {
            anyhow::bail!("wave_length must be at least 1");
        }
        if self.callback_threshold == Some(0) {
            anyhow::bail!("callback_threshold must be at least 1");
        }
        Ok(())
    }

    /// Buffering for an output replaying a table of `period` frames
    ///
    /// Regenerating outputs hold exactly one period. Refilled outputs hold
    /// four and are topped up every `callback_threshold` frames, or every
    /// half period when that does not fit.
    pub fn output_plan(&self, period: usize, regeneration: bool) -> OutputPlan {
        let period = period.max(1);
        if regeneration {
            return OutputPlan {
                buffer_frames: period,
                regeneration,
                threshold: None,
            };
        }
        let buffer_frames = period * 4;
        let threshold = self
            .callback_threshold
            .filter(|n| (1..=buffer_frames).contains(n))
            .unwrap_or((period / 2).max(1));
        OutputPlan {
            buffer_frames,
            regeneration,
            threshold: Some(threshold),
        }
    }

    /// Save config to disk, creating parent directories if needed
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        tracing::info!(path = %path.display(), "Config saved to disk");
        Ok(())
    }

    /// Analog input channels qualified with the device name
    pub fn input_set(&self) -> ChannelSet {
        ChannelSet::analog(&self.qualify(&self.input_channels))
    }

    /// Analog output channels qualified with the device name
    pub fn output_set(&self) -> ChannelSet {
        ChannelSet::analog(&self.qualify(&self.output_channels))
    }

    /// `Dev1/ai0` style name for a bare channel
    pub fn channel(&self, name: &str) -> String {
        format!("{}/{}", self.device, name)
    }

    fn qualify(&self, names: &[String]) -> Vec<String> {
        names.iter().map(|n| self.channel(n)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.device, "Dev1");
        assert_eq!(config.sample_rate, 5000.0);
        assert_eq!(config.callback_threshold, None);
        assert!(config.regeneration);
    }

    #[test]
    fn test_missing_fields_use_defaults() {
        let json = r#"{"device": "Dev2", "buffer_frames": 80}"#;
        let config: AppConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.device, "Dev2");
        assert_eq!(config.buffer_frames, 80);
        assert_eq!(config.wave_length, 500);
        assert_eq!(config.output_channels, vec!["ao0".to_string()]);
    }

    #[test]
    fn test_channels_are_qualified() {
        let config = AppConfig {
            input_channels: vec!["ai0".into(), "ai1".into()],
            ..AppConfig::default()
        };
        assert_eq!(config.input_set().names(), ["Dev1/ai0", "Dev1/ai1"]);
        assert_eq!(config.channel("ao0"), "Dev1/ao0");
    }

    #[test]
    fn test_zero_wave_length_is_rejected() {
        let config = AppConfig {
            wave_length: 0,
            ..AppConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("wave_length"));
        assert!(AppConfig::default().validate().is_ok());
    }

    #[test]
    fn test_invalid_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"device": "Dev2", "wave_length": 0}"#).unwrap();

        let config = AppConfig::load_from(&path);
        assert_eq!(config, AppConfig::default());
        assert!(config.wave_length > 0);
    }

    #[test]
    fn test_output_plan_follows_regeneration() {
        let config = AppConfig::default();
        let regen = config.output_plan(500, true);
        assert_eq!(
            regen,
            OutputPlan {
                buffer_frames: 500,
                regeneration: true,
                threshold: None
            }
        );

        let refill = config.output_plan(500, false);
        assert_eq!(refill.buffer_frames, 2000);
        assert_eq!(refill.threshold, Some(250));

        let config = AppConfig {
            callback_threshold: Some(100),
            ..AppConfig::default()
        };
        assert_eq!(config.output_plan(500, false).threshold, Some(100));
        assert_eq!(
            config.output_plan(10, false).threshold,
            Some(5),
            "A threshold larger than the buffer falls back to half a period"
        );
    }

    #[test]
    fn test_unparsable_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert_eq!(AppConfig::load_from(&path), AppConfig::default());
    }
}
