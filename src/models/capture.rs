// Data structures for screen capture devices

use serde::{Deserialize, Serialize};
use std::fmt;

/// Platform mechanism a video device is built on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VideoBackendKind {
    /// DXGI desktop duplication (Windows)
    Dxgi,
    /// Root window grabs over the X protocol, through MIT-SHM when available (Linux)
    X11,
    /// NVIDIA frame buffer capture (Linux, NVIDIA driver)
    NvFbc,
}

impl VideoBackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            VideoBackendKind::Dxgi => "dxgi",
            VideoBackendKind::X11 => "x11",
            VideoBackendKind::NvFbc => "nvfbc",
        }
    }

    /// Backend used when the configuration does not name one
    pub fn platform_default() -> Self {
        if cfg!(target_os = "windows") {
            VideoBackendKind::Dxgi
        } else {
            VideoBackendKind::X11
        }
    }
}

impl fmt::Display for VideoBackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configuration for a video capture device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VideoDeviceConfig {
    pub backend: VideoBackendKind,
    /// Ask the backend to include the mouse cursor
    pub capture_cursor: bool,
    /// Display identifier, platform default if empty
    /// (`\\.\DISPLAY2` for DXGI, `:1` for X11 and NvFBC)
    pub display_id: String,
    /// Prefer a shared memory segment for X11 grabs
    pub use_shm: bool,
}

impl Default for VideoDeviceConfig {
    fn default() -> Self {
        Self {
            backend: VideoBackendKind::platform_default(),
            capture_cursor: true,
            display_id: String::new(),
            use_shm: true,
        }
    }
}

impl VideoDeviceConfig {
    pub fn with_backend(backend: VideoBackendKind) -> Self {
        Self {
            backend,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> CaptureResult<()> {
        if self.display_id.contains('\0') {
            return Err(CaptureError::InvalidConfig(
                "display id must not contain NUL bytes".to_string(),
            ));
        }
        Ok(())
    }
}

/// Pixel layouts a video device can hand out.
///
/// `Bgra` is the canonical format every backend supports. The other layouts are
/// only produced by backends that can grab them natively.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PixelFormat {
    Bgra,
    Rgba,
    Argb,
    /// Packed 24-bit RGB
    Rgb,
    /// Full-resolution Y plane followed by interleaved half-resolution UV
    Nv12,
    /// Planar Y, U, V at full resolution
    Yuv444p,
    /// Planar Y, U, V with half-resolution chroma (YUV 4:2:0)
    I420,
}

/// Error types for screen capture operations
#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("Video backend {0} is not supported on this platform")]
    UnsupportedBackend(VideoBackendKind),

    #[error("Failed to acquire capture resources: {0}")]
    ResourceAcquisition(String),

    #[error("Display not found: {0}")]
    DisplayNotFound(String),

    #[error("Timed out after {0} ms")]
    Timeout(u64),

    #[error("Device not connected: {0}")]
    NotConnected(String),

    #[error("Unsupported pixel format: {0}")]
    UnsupportedFormat(String),

    #[error("Output buffer too small: need {needed} bytes, got {got}")]
    BufferTooSmall { needed: usize, got: usize },

    #[error("Capture failed: {0}")]
    CaptureFailed(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

pub type CaptureResult<T> = Result<T, CaptureError>;
