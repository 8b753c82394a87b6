//! Screen and system audio capture behind one pull-based API.
//!
//! A [`VideoDevice`] hands out full-screen frames from DXGI desktop duplication,
//! X11 or NvFBC. An [`AudioDevice`] hands out loopback audio from WASAPI or
//! PulseAudio, always as 16-bit little-endian PCM. Both connect when created and
//! release every platform resource when dropped.

pub mod core;
pub mod logging;
pub mod models;
pub mod platform;

pub use crate::core::audio_device::AudioDevice;
pub use crate::core::config::CaptureConfig;
pub use crate::core::video_device::VideoDevice;
pub use crate::models::audio::{
    AudioBackendKind, AudioDeviceConfig, AudioError, AudioResult, NegotiatedFormat, SampleFormat,
};
pub use crate::models::capture::{
    CaptureError, CaptureResult, PixelFormat, VideoBackendKind, VideoDeviceConfig,
};
