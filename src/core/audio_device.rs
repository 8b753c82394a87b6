// Audio capture device: loopback capture normalised to 16-bit PCM

use crate::core::convert;
use crate::models::audio::{
    AudioBackendKind, AudioDeviceConfig, AudioError, AudioResult, NegotiatedFormat, SampleFormat,
};
use crate::platform::audio::{self, AudioSource};
use tracing::{info, warn};

/// System audio (loopback) capture device.
///
/// Pulls always hand out signed 16-bit little-endian interleaved samples, at the
/// rate and channel count reported by [`AudioDevice::config`].
pub struct AudioDevice {
    requested: AudioDeviceConfig,
    effective: AudioDeviceConfig,
    format: NegotiatedFormat,
    raw: Vec<u8>,
    source: Box<dyn AudioSource>,
}

impl AudioDevice {
    /// Connect the backend named in `config`
    pub fn create(config: &AudioDeviceConfig) -> AudioResult<Self> {
        config.validate()?;
        let source = audio::open(config)?;
        Self::from_source(config.clone(), source)
    }

    pub(crate) fn from_source(
        requested: AudioDeviceConfig,
        source: Box<dyn AudioSource>,
    ) -> AudioResult<Self> {
        let format = source.format();
        if !format.is_populated() {
            return Err(AudioError::ResourceAcquisition(format!(
                "{} negotiated an empty format: {:?}",
                requested.backend, format
            )));
        }

        let effective = AudioDeviceConfig {
            sample_rate: format.sample_rate,
            channels: format.channels,
            buffer_ms: format.buffer_ms().max(1),
            ..requested.clone()
        };

        if effective.sample_rate != requested.sample_rate
            || effective.channels != requested.channels
        {
            info!(
                requested_rate = requested.sample_rate,
                requested_channels = requested.channels,
                rate = effective.sample_rate,
                channels = effective.channels,
                "Audio format differs from request"
            );
        }

        if let SampleFormat::Unsupported { bits_per_sample } = format.sample_format {
            warn!(bits_per_sample, "Audio device delivers a sample format that cannot be converted");
        }

        info!(
            backend = %requested.backend,
            rate = effective.sample_rate,
            channels = effective.channels,
            buffer_ms = effective.buffer_ms,
            "Audio device ready"
        );

        Ok(Self {
            requested,
            effective,
            format,
            raw: Vec::new(),
            source,
        })
    }

    /// Effective configuration, as negotiated with the platform
    pub fn config(&self) -> &AudioDeviceConfig {
        &self.effective
    }

    /// Configuration the device was created with
    pub fn requested_config(&self) -> &AudioDeviceConfig {
        &self.requested
    }

    pub fn format(&self) -> NegotiatedFormat {
        self.format
    }

    pub fn backend(&self) -> AudioBackendKind {
        self.effective.backend
    }

    /// Pull the next chunk of captured audio as 16-bit little-endian PCM.
    /// `out` is replaced, never appended to.
    pub fn get_frame_s16le(&mut self, out: &mut Vec<u8>) -> AudioResult<()> {
        out.clear();
        self.source.read_raw(&mut self.raw)?;
        convert::to_s16le(&self.raw, self.format.sample_format, out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::session::Lifecycle;
    use std::collections::VecDeque;

    struct FakeLoopback {
        lifecycle: Lifecycle,
        format: NegotiatedFormat,
        chunks: VecDeque<Vec<u8>>,
    }

    impl FakeLoopback {
        fn new(sample_format: SampleFormat) -> Self {
            let mut lifecycle = Lifecycle::new("fake");
            lifecycle.begin().unwrap();
            lifecycle.ready().unwrap();
            Self {
                lifecycle,
                format: NegotiatedFormat {
                    sample_rate: 48000,
                    channels: 2,
                    sample_format,
                    buffer_frames: 960,
                },
                chunks: VecDeque::new(),
            }
        }
    }

    impl AudioSource for FakeLoopback {
        fn format(&self) -> NegotiatedFormat {
            self.format
        }

        fn read_raw(&mut self, out: &mut Vec<u8>) -> AudioResult<()> {
            self.lifecycle.ensure_ready()?;
            out.clear();
            match self.chunks.pop_front() {
                Some(chunk) => {
                    out.extend_from_slice(&chunk);
                    Ok(())
                }
                None => Err(AudioError::NoData),
            }
        }
    }

    fn f32_bytes(samples: &[f32]) -> Vec<u8> {
        samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    }

    fn as_i16(bytes: &[u8]) -> Vec<i16> {
        bytes
            .chunks_exact(2)
            .map(|c| i16::from_le_bytes([c[0], c[1]]))
            .collect()
    }

    #[test]
    fn test_effective_config_reflects_negotiation() {
        let requested = AudioDeviceConfig::default();
        let device =
            AudioDevice::from_source(requested.clone(), Box::new(FakeLoopback::new(SampleFormat::F32)))
                .unwrap();

        assert_eq!(device.config().sample_rate, 48000);
        assert_eq!(device.config().channels, 2);
        assert_eq!(device.config().buffer_ms, 20);
        assert_eq!(device.requested_config(), &requested);
        assert_eq!(device.format().sample_format, SampleFormat::F32);
    }

    #[test]
    fn test_float_pull_is_converted() {
        let mut source = FakeLoopback::new(SampleFormat::F32);
        source.chunks.push_back(f32_bytes(&[1.0, -1.0, 0.0, 1.5]));
        let mut device =
            AudioDevice::from_source(AudioDeviceConfig::default(), Box::new(source)).unwrap();

        let mut out = Vec::new();
        device.get_frame_s16le(&mut out).unwrap();
        assert_eq!(as_i16(&out), vec![32767, -32767, 0, 32767]);
    }

    #[test]
    fn test_pulls_do_not_leak_previous_contents() {
        let mut source = FakeLoopback::new(SampleFormat::S16);
        source.chunks.push_back(vec![1, 0, 2, 0, 3, 0, 4, 0]);
        source.chunks.push_back(vec![5, 0, 6, 0]);
        let mut device =
            AudioDevice::from_source(AudioDeviceConfig::default(), Box::new(source)).unwrap();

        let mut out = Vec::new();
        device.get_frame_s16le(&mut out).unwrap();
        assert_eq!(as_i16(&out), vec![1, 2, 3, 4]);
        device.get_frame_s16le(&mut out).unwrap();
        assert_eq!(as_i16(&out), vec![5, 6]);

        // A failed pull leaves no stale samples behind
        assert!(device.get_frame_s16le(&mut out).is_err());
        assert!(out.is_empty());
    }

    #[test]
    fn test_unsupported_depth_fails_pull() {
        let mut source = FakeLoopback::new(SampleFormat::Unsupported { bits_per_sample: 24 });
        source.chunks.push_back(vec![0; 12]);
        let mut device =
            AudioDevice::from_source(AudioDeviceConfig::default(), Box::new(source)).unwrap();

        let mut out = Vec::new();
        let result = device.get_frame_s16le(&mut out);
        assert!(matches!(result, Err(AudioError::UnsupportedFormat(24))));
    }

    #[test]
    fn test_pull_after_termination_fails() {
        let mut source = FakeLoopback::new(SampleFormat::S16);
        source.chunks.push_back(vec![1, 0]);
        source.lifecycle.terminate();
        let mut device =
            AudioDevice::from_source(AudioDeviceConfig::default(), Box::new(source)).unwrap();

        let mut out = vec![9, 9];
        let result = device.get_frame_s16le(&mut out);
        assert!(matches!(result, Err(AudioError::NotConnected(_))));
        assert!(out.is_empty());
    }

    #[test]
    fn test_empty_format_rejected() {
        let mut source = FakeLoopback::new(SampleFormat::S16);
        source.format.buffer_frames = 0;
        let result = AudioDevice::from_source(AudioDeviceConfig::default(), Box::new(source));
        assert!(matches!(result, Err(AudioError::ResourceAcquisition(_))));
    }
}
