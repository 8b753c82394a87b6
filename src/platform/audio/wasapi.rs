// Windows loopback capture through WASAPI shared mode

use super::AudioSource;
use crate::core::drain::{drain_packets, Packet, PacketData, PacketSource};
use crate::core::session::Lifecycle;
use crate::models::audio::{
    AudioDeviceConfig, AudioError, AudioResult, NegotiatedFormat, SampleFormat,
};
use std::time::Duration;
use tracing::{debug, info, warn};
use windows::core::PCWSTR;
use windows::Win32::Foundation::RPC_E_CHANGED_MODE;
use windows::Win32::Media::Audio::*;
use windows::Win32::System::Com::*;

/// Not exported as a typed flag by the bindings
const AUDCLNT_STREAMFLAGS_LOOPBACK: u32 = 0x00020000;

/// WASAPI durations are expressed in 100ns units
const REFTIMES_PER_MS: i64 = 10_000;

/// COM apartment joined by this session
struct ComApartment {
    owned: bool,
}

impl ComApartment {
    fn join() -> AudioResult<Self> {
        let hr = unsafe { CoInitializeEx(None, COINIT_MULTITHREADED) };
        if hr == RPC_E_CHANGED_MODE {
            // The thread already lives in another apartment, which still works for us
            debug!("COM already initialised with a different threading model");
            return Ok(Self { owned: false });
        }
        hr.ok().map_err(|e| {
            AudioError::ResourceAcquisition(format!("Failed to initialise COM: {}", e))
        })?;
        Ok(Self { owned: true })
    }
}

impl Drop for ComApartment {
    fn drop(&mut self) {
        if self.owned {
            unsafe { CoUninitialize() };
        }
    }
}

/// Mix format allocated by the audio engine
struct MixFormat(*mut WAVEFORMATEX);

impl MixFormat {
    fn get(&self) -> &WAVEFORMATEX {
        unsafe { &*self.0 }
    }
}

impl Drop for MixFormat {
    fn drop(&mut self) {
        unsafe { CoTaskMemFree(Some(self.0 as *const _)) };
    }
}

/// Stops the stream when dropped
struct RunningStream {
    client: IAudioClient,
}

impl Drop for RunningStream {
    fn drop(&mut self) {
        if let Err(e) = unsafe { self.client.Stop() } {
            debug!("Audio client stop failed: {}", e);
        }
    }
}

/// Build the negotiated format from mix format fields
fn describe_format(
    sample_rate: u32,
    channels: u16,
    bits_per_sample: u16,
    buffer_frames: u32,
) -> NegotiatedFormat {
    NegotiatedFormat {
        sample_rate,
        channels,
        sample_format: SampleFormat::from_bits_per_sample(bits_per_sample),
        buffer_frames,
    }
}

fn pull_interval(buffer_ms: u32) -> Duration {
    Duration::from_millis((buffer_ms / 2).max(1) as u64)
}

fn acquisition(step: &str) -> impl Fn(windows::core::Error) -> AudioError + '_ {
    move |e| AudioError::ResourceAcquisition(format!("{}: {}", step, e))
}

/// Packet view over a started capture client
struct CapturePackets<'a> {
    client: &'a IAudioCaptureClient,
    frame_size: usize,
}

impl PacketSource for CapturePackets<'_> {
    type Error = windows::core::Error;

    fn next_packet_frames(&mut self) -> Result<u32, Self::Error> {
        unsafe { self.client.GetNextPacketSize() }
    }

    fn acquire(&mut self) -> Result<Packet<'_>, Self::Error> {
        let mut data: *mut u8 = std::ptr::null_mut();
        let mut frames = 0u32;
        let mut flags = 0u32;
        unsafe {
            self.client
                .GetBuffer(&mut data, &mut frames, &mut flags, None, None)?;
        }

        let silent = flags & AUDCLNT_BUFFERFLAGS_SILENT.0 as u32 != 0;
        let data = if silent || data.is_null() {
            PacketData::Silent
        } else {
            let len = frames as usize * self.frame_size;
            PacketData::Samples(unsafe { std::slice::from_raw_parts(data, len) })
        };

        Ok(Packet { frames, data })
    }

    fn release(&mut self, frames: u32) -> Result<(), Self::Error> {
        unsafe { self.client.ReleaseBuffer(frames) }
    }
}

/// Loopback capture of one render endpoint.
///
/// Fields are declared in release order: the stream is stopped, then the
/// capture and audio clients go before the device, the enumerator and the COM
/// apartment they came from.
pub struct WasapiSession {
    lifecycle: Lifecycle,
    format: NegotiatedFormat,
    frame_size: usize,
    interval: Duration,
    _running: RunningStream,
    capture: IAudioCaptureClient,
    _client: IAudioClient,
    _device: IMMDevice,
    _enumerator: IMMDeviceEnumerator,
    _com: ComApartment,
}

impl WasapiSession {
    pub fn connect(config: &AudioDeviceConfig) -> AudioResult<Self> {
        let mut lifecycle = Lifecycle::new("wasapi");
        lifecycle.begin()?;

        let com = match ComApartment::join() {
            Ok(com) => com,
            Err(e) => {
                lifecycle.fail(&e.to_string());
                return Err(e);
            }
        };

        match unsafe { Self::acquire(config) } {
            Ok(parts) => {
                lifecycle.ready()?;
                let (enumerator, device, client, capture, running, format, frame_size) = parts;
                Ok(Self {
                    lifecycle,
                    format,
                    frame_size,
                    interval: pull_interval(config.buffer_ms),
                    _running: running,
                    capture,
                    _client: client,
                    _device: device,
                    _enumerator: enumerator,
                    _com: com,
                })
            }
            Err(e) => {
                lifecycle.fail(&e.to_string());
                Err(e)
            }
        }
    }

    #[allow(clippy::type_complexity)]
    unsafe fn acquire(
        config: &AudioDeviceConfig,
    ) -> AudioResult<(
        IMMDeviceEnumerator,
        IMMDevice,
        IAudioClient,
        IAudioCaptureClient,
        RunningStream,
        NegotiatedFormat,
        usize,
    )> {
        let enumerator: IMMDeviceEnumerator =
            CoCreateInstance(&MMDeviceEnumerator, None, CLSCTX_ALL)
                .map_err(acquisition("Failed to create device enumerator"))?;

        let device = if config.device_id.is_empty() {
            enumerator
                .GetDefaultAudioEndpoint(eRender, eConsole)
                .map_err(acquisition("Failed to get default audio endpoint"))?
        } else {
            let wide: Vec<u16> = config
                .device_id
                .encode_utf16()
                .chain(std::iter::once(0))
                .collect();
            enumerator
                .GetDevice(PCWSTR(wide.as_ptr()))
                .map_err(|e| AudioError::DeviceNotFound(format!("{}: {}", config.device_id, e)))?
        };

        let client: IAudioClient = device
            .Activate(CLSCTX_ALL, None)
            .map_err(acquisition("Failed to activate audio client"))?;

        let mix = MixFormat(
            client
                .GetMixFormat()
                .map_err(acquisition("Failed to get mix format"))?,
        );

        // WAVEFORMATEX is packed, copy fields out before formatting them
        let wave = mix.get();
        let sample_rate = wave.nSamplesPerSec;
        let channels = wave.nChannels;
        let bits_per_sample = wave.wBitsPerSample;
        let block_align = wave.nBlockAlign;

        if sample_rate != config.sample_rate || channels != config.channels {
            debug!(
                sample_rate,
                channels,
                bits_per_sample,
                "Loopback uses the engine mix format"
            );
        }

        client
            .Initialize(
                AUDCLNT_SHAREMODE_SHARED,
                AUDCLNT_STREAMFLAGS_LOOPBACK,
                config.buffer_ms as i64 * REFTIMES_PER_MS,
                0,
                mix.0,
                None,
            )
            .map_err(acquisition("Failed to initialize audio client"))?;
        drop(mix);

        let buffer_frames = client
            .GetBufferSize()
            .map_err(acquisition("Failed to get buffer size"))?;

        let capture: IAudioCaptureClient = client
            .GetService()
            .map_err(acquisition("Failed to get capture service"))?;

        client
            .Start()
            .map_err(acquisition("Failed to start audio stream"))?;
        let running = RunningStream {
            client: client.clone(),
        };

        let format = describe_format(sample_rate, channels, bits_per_sample, buffer_frames);
        info!(
            sample_rate,
            channels, bits_per_sample, buffer_frames, "WASAPI loopback capture started"
        );

        Ok((
            enumerator,
            device,
            client,
            capture,
            running,
            format,
            block_align as usize,
        ))
    }
}

impl AudioSource for WasapiSession {
    fn format(&self) -> NegotiatedFormat {
        self.format
    }

    fn read_raw(&mut self, out: &mut Vec<u8>) -> AudioResult<()> {
        out.clear();
        self.lifecycle.ensure_ready()?;

        std::thread::sleep(self.interval);

        let mut packets = CapturePackets {
            client: &self.capture,
            frame_size: self.frame_size,
        };
        match drain_packets(&mut packets, self.frame_size, out) {
            Ok(0) => Err(AudioError::NoData),
            Ok(_) => Ok(()),
            Err(e) => {
                out.clear();
                if e.code() == AUDCLNT_E_DEVICE_INVALIDATED {
                    warn!("Loopback endpoint was removed");
                    self.lifecycle.fail(&e.to_string());
                }
                Err(AudioError::CaptureFailed(format!(
                    "Failed to read captured audio: {}",
                    e
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::audio::AudioBackendKind;

    #[test]
    fn test_describe_float_mix_format() {
        let format = describe_format(48000, 2, 32, 4800);
        assert_eq!(format.sample_format, SampleFormat::F32);
        assert_eq!(format.frame_size(), 8);
        assert_eq!(format.buffer_ms(), 100);
    }

    #[test]
    fn test_describe_unusual_depth() {
        let format = describe_format(44100, 6, 24, 4410);
        assert_eq!(
            format.sample_format,
            SampleFormat::Unsupported { bits_per_sample: 24 }
        );
        assert!(format.is_populated());
    }

    #[test]
    fn test_pull_interval_is_half_buffer() {
        assert_eq!(pull_interval(100), Duration::from_millis(50));
        assert_eq!(pull_interval(1), Duration::from_millis(1));
    }

    #[test]
    fn test_capture_loopback() {
        let config = AudioDeviceConfig::with_backend(AudioBackendKind::Wasapi);
        let mut session = match WasapiSession::connect(&config) {
            Ok(session) => session,
            Err(e) => {
                println!("Skipping WASAPI capture test - {}", e);
                return;
            }
        };

        let format = session.format();
        assert!(format.is_populated());

        let mut raw = Vec::new();
        match session.read_raw(&mut raw) {
            Ok(()) => assert_eq!(raw.len() % format.frame_size(), 0),
            Err(AudioError::NoData) => println!("No audio packets during WASAPI test pull"),
            Err(e) => panic!("WASAPI pull failed: {}", e),
        }
    }

    #[test]
    fn test_unknown_device_id() {
        let mut config = AudioDeviceConfig::with_backend(AudioBackendKind::Wasapi);
        config.device_id = "{not-a-device}".to_string();
        assert!(WasapiSession::connect(&config).is_err());
    }
}
