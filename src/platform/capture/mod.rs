// Platform-specific screen capture backends
// Each backend implements `VideoSource`; `open` picks one by configuration

#[cfg(target_os = "windows")]
pub mod dxgi;

#[cfg(all(target_os = "linux", feature = "x11"))]
pub mod x11;

#[cfg(all(target_os = "linux", feature = "nvfbc"))]
pub mod nvfbc;

use crate::core::convert::frame_size;
use crate::models::capture::{
    CaptureError, CaptureResult, PixelFormat, VideoBackendKind, VideoDeviceConfig,
};

/// A connected screen capture session
pub trait VideoSource {
    fn width(&self) -> u32;

    fn height(&self) -> u32;

    /// Pull the next frame as tightly packed BGRA into `out`, which holds at
    /// least `width * height * 4` bytes. `Ok(false)` means no new frame yet.
    fn grab_bgra(&mut self, out: &mut [u8]) -> CaptureResult<bool>;

    /// Pull the next frame in `format`, resizing `out` to the frame size.
    /// Backends without native support for a format refuse it.
    fn grab(&mut self, format: PixelFormat, out: &mut Vec<u8>) -> CaptureResult<bool> {
        match format {
            PixelFormat::Bgra => {
                out.resize(frame_size(format, self.width(), self.height()), 0);
                self.grab_bgra(out)
            }
            other => Err(CaptureError::UnsupportedFormat(format!(
                "{:?} is not produced by this backend",
                other
            ))),
        }
    }
}

/// Connect the backend named by `config`
pub fn open(config: &VideoDeviceConfig) -> CaptureResult<Box<dyn VideoSource>> {
    match config.backend {
        #[cfg(target_os = "windows")]
        VideoBackendKind::Dxgi => Ok(Box::new(dxgi::DxgiSession::connect(config)?)),

        #[cfg(all(target_os = "linux", feature = "x11"))]
        VideoBackendKind::X11 => Ok(Box::new(x11::X11Session::connect(config)?)),

        #[cfg(all(target_os = "linux", feature = "nvfbc"))]
        VideoBackendKind::NvFbc => Ok(Box::new(nvfbc::NvFbcSession::connect(config)?)),

        #[allow(unreachable_patterns)]
        other => Err(CaptureError::UnsupportedBackend(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_foreign_backend_is_refused() {
        // DXGI only exists on Windows, X11 and NvFBC only on Linux
        let foreign = if cfg!(target_os = "windows") {
            VideoBackendKind::X11
        } else {
            VideoBackendKind::Dxgi
        };
        let result = open(&VideoDeviceConfig::with_backend(foreign));
        assert!(matches!(result, Err(CaptureError::UnsupportedBackend(kind)) if kind == foreign));
    }
}
