// Data models for system audio (loopback) capture

use serde::{Deserialize, Serialize};
use std::fmt;

// ==============================================================================
// Configuration
// ==============================================================================

/// Platform mechanism an audio device is built on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AudioBackendKind {
    /// WASAPI loopback on the render endpoint (Windows)
    Wasapi,
    /// PulseAudio record stream on a monitor source (Linux)
    Pulse,
}

impl AudioBackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AudioBackendKind::Wasapi => "wasapi",
            AudioBackendKind::Pulse => "pulse",
        }
    }

    pub fn platform_default() -> Self {
        if cfg!(target_os = "windows") {
            AudioBackendKind::Wasapi
        } else {
            AudioBackendKind::Pulse
        }
    }
}

impl fmt::Display for AudioBackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configuration for an audio capture device.
///
/// The values are a request: the device reports what it actually negotiated
/// through [`crate::AudioDevice::config`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioDeviceConfig {
    pub backend: AudioBackendKind,
    pub sample_rate: u32,  // Hz (e.g., 48000)
    pub channels: u16,     // 1 = mono, 2 = stereo
    pub buffer_ms: u32,    // capture buffer duration
    /// Endpoint id (WASAPI) or source name (PulseAudio), platform default if empty
    pub device_id: String,
}

impl Default for AudioDeviceConfig {
    fn default() -> Self {
        Self {
            backend: AudioBackendKind::platform_default(),
            sample_rate: 44100,
            channels: 2,
            buffer_ms: 100,
            device_id: String::new(),
        }
    }
}

impl AudioDeviceConfig {
    pub fn with_backend(backend: AudioBackendKind) -> Self {
        Self {
            backend,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> AudioResult<()> {
        if !(8_000..=384_000).contains(&self.sample_rate) {
            return Err(AudioError::InvalidConfig(format!(
                "Invalid sample rate: {}. Must be between 8000 and 384000 Hz",
                self.sample_rate
            )));
        }

        if self.channels == 0 || self.channels > 32 {
            return Err(AudioError::InvalidConfig(format!(
                "Invalid channel count: {}. Must be between 1 and 32",
                self.channels
            )));
        }

        if self.buffer_ms == 0 || self.buffer_ms > 10_000 {
            return Err(AudioError::InvalidConfig(format!(
                "Invalid buffer duration: {} ms. Must be between 1 and 10000",
                self.buffer_ms
            )));
        }

        if self.device_id.contains('\0') {
            return Err(AudioError::InvalidConfig(
                "device id must not contain NUL bytes".to_string(),
            ));
        }

        Ok(())
    }

    /// Bytes of 16-bit interleaved audio covering `buffer_ms`
    pub fn s16_buffer_bytes(&self) -> usize {
        self.sample_rate as usize * self.channels as usize * 2 * self.buffer_ms as usize / 1000
    }
}

// ==============================================================================
// Negotiated format
// ==============================================================================

/// Sample encoding delivered by the hardware or sound server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleFormat {
    /// Signed 16-bit little-endian integers
    S16,
    /// 32-bit IEEE float little-endian
    F32,
    /// Anything else, kept so the device can report it and refuse to convert
    Unsupported { bits_per_sample: u16 },
}

impl SampleFormat {
    pub fn from_bits_per_sample(bits: u16) -> Self {
        match bits {
            16 => SampleFormat::S16,
            32 => SampleFormat::F32,
            other => SampleFormat::Unsupported {
                bits_per_sample: other,
            },
        }
    }

    pub fn bits_per_sample(&self) -> u16 {
        match self {
            SampleFormat::S16 => 16,
            SampleFormat::F32 => 32,
            SampleFormat::Unsupported { bits_per_sample } => *bits_per_sample,
        }
    }

    pub fn bytes_per_sample(&self) -> usize {
        self.bits_per_sample() as usize / 8
    }
}

/// Format a backend session settled on while connecting. Fixed for the
/// session's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NegotiatedFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub sample_format: SampleFormat,
    /// Frames the endpoint buffers between pulls
    pub buffer_frames: u32,
}

impl NegotiatedFormat {
    /// Bytes per interleaved sample frame in the raw format
    pub fn frame_size(&self) -> usize {
        self.channels as usize * self.sample_format.bytes_per_sample()
    }

    pub fn buffer_ms(&self) -> u32 {
        if self.sample_rate == 0 {
            return 0;
        }
        (self.buffer_frames as u64 * 1000 / self.sample_rate as u64) as u32
    }

    pub fn is_populated(&self) -> bool {
        self.sample_rate > 0 && self.channels > 0 && self.buffer_frames > 0
    }
}

// ==============================================================================
// Errors
// ==============================================================================

#[derive(Debug, thiserror::Error)]
pub enum AudioError {
    #[error("Audio backend {0} is not supported on this platform")]
    UnsupportedBackend(AudioBackendKind),

    #[error("Failed to acquire audio resources: {0}")]
    ResourceAcquisition(String),

    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Timed out after {0} ms")]
    Timeout(u64),

    #[error("Device not connected: {0}")]
    NotConnected(String),

    #[error("Unsupported sample format: {0} bits per sample")]
    UnsupportedFormat(u16),

    #[error("No audio data captured")]
    NoData,

    #[error("Capture failed: {0}")]
    CaptureFailed(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

pub type AudioResult<T> = Result<T, AudioError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AudioDeviceConfig::default();
        assert_eq!(config.sample_rate, 44100);
        assert_eq!(config.channels, 2);
        assert_eq!(config.buffer_ms, 100);
        assert!(config.device_id.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = AudioDeviceConfig::default();

        config.sample_rate = 0;
        assert!(config.validate().is_err());
        config.sample_rate = 48000;

        config.channels = 0;
        assert!(config.validate().is_err());
        config.channels = 33;
        assert!(config.validate().is_err());
        config.channels = 2;

        config.buffer_ms = 0;
        assert!(config.validate().is_err());
        config.buffer_ms = 20;

        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_s16_buffer_bytes() {
        let config = AudioDeviceConfig {
            sample_rate: 48000,
            channels: 2,
            buffer_ms: 100,
            ..AudioDeviceConfig::default()
        };
        // 4800 frames * 2 channels * 2 bytes
        assert_eq!(config.s16_buffer_bytes(), 19200);
    }

    #[test]
    fn test_sample_format_from_bits() {
        assert_eq!(SampleFormat::from_bits_per_sample(16), SampleFormat::S16);
        assert_eq!(SampleFormat::from_bits_per_sample(32), SampleFormat::F32);
        assert_eq!(
            SampleFormat::from_bits_per_sample(24),
            SampleFormat::Unsupported { bits_per_sample: 24 }
        );
        assert_eq!(SampleFormat::from_bits_per_sample(24).bytes_per_sample(), 3);
    }

    #[test]
    fn test_negotiated_format_sizes() {
        let format = NegotiatedFormat {
            sample_rate: 48000,
            channels: 2,
            sample_format: SampleFormat::F32,
            buffer_frames: 4800,
        };
        assert_eq!(format.frame_size(), 8);
        assert_eq!(format.buffer_ms(), 100);
        assert!(format.is_populated());
    }
}
