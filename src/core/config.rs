use crate::models::audio::AudioDeviceConfig;
use crate::models::capture::VideoDeviceConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Capture configuration for one video and one audio device
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CaptureConfig {
    pub video: VideoDeviceConfig,
    pub audio: AudioDeviceConfig,
}

impl CaptureConfig {
    /// Load configuration from a JSON file. Missing fields take their defaults.
    pub fn load_from(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        let contents = std::fs::read_to_string(path)?;
        let config: CaptureConfig = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from `path`, creating it with defaults if it doesn't exist
    pub fn load_or_create(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        if path.exists() {
            Self::load_from(path)
        } else {
            let config = Self::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    /// Save configuration as pretty-printed JSON
    pub fn save_to(&self, path: &Path) -> Result<(), Box<dyn std::error::Error>> {
        self.validate()?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;

        Ok(())
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), Box<dyn std::error::Error>> {
        self.video.validate()?;
        self.audio.validate()?;
        Ok(())
    }

    /// Default location of the configuration file
    pub fn default_path() -> Result<PathBuf, Box<dyn std::error::Error>> {
        let home = std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .map_err(|_| "Could not determine home directory")?;

        let mut path = PathBuf::from(home);
        path.push(".config");
        path.push("capture-devices");
        path.push("capture.json");

        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::capture::VideoBackendKind;
    use std::fs;

    fn get_test_config_path(name: &str) -> PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("capture_devices_test_{}", name));
        path.push("capture.json");
        path
    }

    fn cleanup_test_config(path: &Path) {
        if let Some(parent) = path.parent() {
            let _ = fs::remove_dir_all(parent);
        }
    }

    #[test]
    fn test_default_config() {
        let config = CaptureConfig::default();
        assert!(config.video.capture_cursor);
        assert!(config.video.use_shm);
        assert_eq!(config.audio.sample_rate, 44100);
        assert_eq!(config.audio.channels, 2);
        assert_eq!(config.audio.buffer_ms, 100);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = CaptureConfig::default();
        assert!(config.validate().is_ok());

        config.audio.channels = 0;
        assert!(config.validate().is_err());
        config.audio.channels = 2;

        config.video.display_id = "\0".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_save_and_load() {
        let path = get_test_config_path("save_load");
        cleanup_test_config(&path);

        let mut config = CaptureConfig::default();
        config.video.backend = VideoBackendKind::NvFbc;
        config.video.display_id = ":1".to_string();
        config.audio.sample_rate = 48000;
        config.save_to(&path).unwrap();

        let loaded = CaptureConfig::load_from(&path).unwrap();
        assert_eq!(loaded, config);

        cleanup_test_config(&path);
    }

    #[test]
    fn test_load_partial_file() {
        let path = get_test_config_path("partial");
        cleanup_test_config(&path);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, r#"{ "audio": { "buffer_ms": 20 } }"#).unwrap();

        let loaded = CaptureConfig::load_from(&path).unwrap();
        assert_eq!(loaded.audio.buffer_ms, 20);
        assert_eq!(loaded.audio.sample_rate, 44100);
        assert_eq!(loaded.video, VideoDeviceConfig::default());

        cleanup_test_config(&path);
    }

    #[test]
    fn test_load_rejects_invalid_values() {
        let path = get_test_config_path("invalid");
        cleanup_test_config(&path);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, r#"{ "audio": { "sample_rate": 10 } }"#).unwrap();

        assert!(CaptureConfig::load_from(&path).is_err());

        cleanup_test_config(&path);
    }

    #[test]
    fn test_load_or_create_writes_defaults() {
        let path = get_test_config_path("create");
        cleanup_test_config(&path);

        let config = CaptureConfig::load_or_create(&path).unwrap();
        assert_eq!(config, CaptureConfig::default());
        assert!(path.exists());

        cleanup_test_config(&path);
    }
}
