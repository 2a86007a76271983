//! Streamer configuration management

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use streamer::adc::{DEFAULT_FRAME_SIZE, DEFAULT_NUM_FRAMES, DEFAULT_SAMPLE_RATE};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamerConfig {
    #[serde(default)]
    pub device: DeviceSettings,
    #[serde(default)]
    pub stream: StreamSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceSettings {
    /// Index among attached supported devices
    #[serde(default)]
    pub index: usize,
    /// Firmware image for devices in boot loader mode (`~` is expanded)
    #[serde(default)]
    pub firmware: Option<String>,
}

impl DeviceSettings {
    /// Firmware path with `~` expanded
    pub fn firmware_path(&self) -> Option<PathBuf> {
        self.firmware
            .as_deref()
            .map(|p| PathBuf::from(shellexpand::tilde(p).as_ref()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamSettings {
    /// Bytes per bulk transfer (0 = library default)
    #[serde(default = "StreamSettings::default_frame_size")]
    pub frame_size: usize,
    /// Transfers kept in flight (0 = library default)
    #[serde(default = "StreamSettings::default_num_frames")]
    pub num_frames: usize,
    /// ADC sample rate in Hz
    #[serde(default = "StreamSettings::default_sample_rate")]
    pub sample_rate: u32,
    /// Frames buffered between the USB thread and the writer
    #[serde(default = "StreamSettings::default_queue_depth")]
    pub queue_depth: usize,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            frame_size: Self::default_frame_size(),
            num_frames: Self::default_num_frames(),
            sample_rate: Self::default_sample_rate(),
            queue_depth: Self::default_queue_depth(),
        }
    }
}

impl StreamSettings {
    fn default_frame_size() -> usize {
        DEFAULT_FRAME_SIZE
    }

    fn default_num_frames() -> usize {
        DEFAULT_NUM_FRAMES
    }

    fn default_sample_rate() -> u32 {
        DEFAULT_SAMPLE_RATE
    }

    fn default_queue_depth() -> usize {
        256
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    #[serde(default = "LoggingSettings::default_log_level")]
    pub log_level: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            log_level: Self::default_log_level(),
        }
    }
}

impl LoggingSettings {
    fn default_log_level() -> String {
        "info".to_string()
    }
}

impl StreamerConfig {
    /// Load configuration from file
    ///
    /// Without an explicit path the per-user file is tried first, then the
    /// system-wide one.
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            p
        } else {
            let candidates = vec![
                Self::default_path(),
                PathBuf::from("/etc/fx3-stream/streamer.toml"),
            ];

            candidates
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("No configuration file found"))?
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: StreamerConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        config.validate()?;

        tracing::info!("Loaded configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Load configuration or return defaults if not found
    pub fn load_or_default() -> Self {
        match Self::load(None) {
            Ok(config) => config,
            Err(e) => {
                tracing::debug!("{:#}, using defaults", e);
                Self::default()
            }
        }
    }

    /// Save configuration to the specified path
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::info!("Saved configuration to: {}", path.display());
        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("fx3-stream").join("streamer.toml")
        } else {
            PathBuf::from(".config/fx3-stream/streamer.toml")
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.log_level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.logging.log_level,
                valid_levels.join(", ")
            ));
        }

        if self.stream.queue_depth == 0 {
            return Err(anyhow!("queue_depth must be at least 1"));
        }

        if self.stream.sample_rate == 0 {
            return Err(anyhow!("sample_rate must be greater than 0"));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = StreamerConfig::default();
        assert_eq!(config.device.index, 0);
        assert!(config.device.firmware.is_none());
        assert_eq!(config.stream.frame_size, 16384);
        assert_eq!(config.stream.num_frames, 64);
        assert_eq!(config.stream.sample_rate, 64_000_000);
        assert_eq!(config.logging.log_level, "info");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_log_level() {
        let mut config = StreamerConfig::default();
        config.logging.log_level = "verbose".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("verbose"));
    }

    #[test]
    fn test_validate_queue_depth() {
        let mut config = StreamerConfig::default();
        config.stream.queue_depth = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_sample_rate() {
        let mut config = StreamerConfig::default();
        config.stream.sample_rate = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_firmware_path_expands_tilde() {
        let settings = DeviceSettings {
            index: 0,
            firmware: Some("~/fx3/SDDC_FX3.img".to_string()),
        };
        let path = settings.firmware_path().unwrap();
        assert!(!path.starts_with("~"));
        assert!(path.ends_with("fx3/SDDC_FX3.img"));
    }

    #[test]
    fn test_default_path() {
        let path = StreamerConfig::default_path();
        assert!(path.ends_with("fx3-stream/streamer.toml"));
    }
}
