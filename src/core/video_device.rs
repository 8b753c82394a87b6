// Video capture device: one backend session behind a uniform pull API

use crate::core::convert::frame_size;
use crate::models::capture::{
    CaptureError, CaptureResult, PixelFormat, VideoBackendKind, VideoDeviceConfig,
};
use crate::platform::capture::{self, VideoSource};
use tracing::info;

/// Screen capture device.
///
/// A `VideoDevice` only exists in the connected state: `create` either returns
/// a device ready to serve frames or an error. Dropping it releases every
/// platform resource the backend acquired.
pub struct VideoDevice {
    config: VideoDeviceConfig,
    source: Box<dyn VideoSource>,
}

impl VideoDevice {
    /// Connect the backend named in `config`
    pub fn create(config: &VideoDeviceConfig) -> CaptureResult<Self> {
        config.validate()?;
        let source = capture::open(config)?;
        Self::from_source(config.clone(), source)
    }

    pub(crate) fn from_source(
        config: VideoDeviceConfig,
        source: Box<dyn VideoSource>,
    ) -> CaptureResult<Self> {
        if source.width() == 0 || source.height() == 0 {
            return Err(CaptureError::ResourceAcquisition(format!(
                "{} reported an empty screen ({}x{})",
                config.backend,
                source.width(),
                source.height()
            )));
        }

        info!(
            backend = %config.backend,
            width = source.width(),
            height = source.height(),
            "Video device ready"
        );

        Ok(Self { config, source })
    }

    pub fn width(&self) -> u32 {
        self.source.width()
    }

    pub fn height(&self) -> u32 {
        self.source.height()
    }

    pub fn backend(&self) -> VideoBackendKind {
        self.config.backend
    }

    pub fn config(&self) -> &VideoDeviceConfig {
        &self.config
    }

    /// Bytes a frame in `format` occupies at the current dimensions
    pub fn frame_len(&self, format: PixelFormat) -> usize {
        frame_size(format, self.width(), self.height())
    }

    /// Pull the next frame as packed BGRA.
    ///
    /// Returns `Ok(false)` when no new frame was available within the backend's
    /// short wait; `out` is left untouched in that case.
    pub fn get_frame_bgra(&mut self, out: &mut [u8]) -> CaptureResult<bool> {
        let needed = self.frame_len(PixelFormat::Bgra);
        if out.len() < needed {
            return Err(CaptureError::BufferTooSmall {
                needed,
                got: out.len(),
            });
        }
        self.source.grab_bgra(&mut out[..needed])
    }

    /// Pull the next frame in `format`. `out` is resized to the frame size.
    pub fn get_frame(&mut self, format: PixelFormat, out: &mut Vec<u8>) -> CaptureResult<bool> {
        self.source.grab(format, out)
    }

    pub fn get_frame_nv12(&mut self, out: &mut Vec<u8>) -> CaptureResult<bool> {
        self.get_frame(PixelFormat::Nv12, out)
    }

    /// Planar YUV 4:2:0 (I420)
    pub fn get_frame_yuv420(&mut self, out: &mut Vec<u8>) -> CaptureResult<bool> {
        self.get_frame(PixelFormat::I420, out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::session::Lifecycle;
    use std::cell::RefCell;
    use std::rc::Rc;

    type DropLog = Rc<RefCell<Vec<&'static str>>>;

    struct Tracked {
        name: &'static str,
        log: DropLog,
    }

    impl Drop for Tracked {
        fn drop(&mut self) {
            self.log.borrow_mut().push(self.name);
        }
    }

    fn acquire(name: &'static str, log: &DropLog) -> Tracked {
        Tracked {
            name,
            log: log.clone(),
        }
    }

    /// Fake session holding three resources, declared in release order
    struct FakeScreen {
        lifecycle: Lifecycle,
        width: u32,
        height: u32,
        pending_frames: Vec<u8>,
        _stream: Tracked,
        _client: Tracked,
        _connection: Tracked,
    }

    impl FakeScreen {
        fn connect(log: &DropLog, fail_at_stream: bool) -> CaptureResult<Self> {
            let mut lifecycle = Lifecycle::new("fake");
            lifecycle.begin()?;
            let connection = acquire("connection", log);
            let client = acquire("client", log);
            if fail_at_stream {
                lifecycle.fail("stream refused");
                return Err(CaptureError::ResourceAcquisition("stream refused".into()));
            }
            let stream = acquire("stream", log);
            lifecycle.ready()?;
            Ok(Self {
                lifecycle,
                width: 2,
                height: 2,
                pending_frames: vec![0x11, 0x22],
                _stream: stream,
                _client: client,
                _connection: connection,
            })
        }
    }

    impl VideoSource for FakeScreen {
        fn width(&self) -> u32 {
            self.width
        }

        fn height(&self) -> u32 {
            self.height
        }

        fn grab_bgra(&mut self, out: &mut [u8]) -> CaptureResult<bool> {
            self.lifecycle.ensure_ready()?;
            match self.pending_frames.pop() {
                Some(value) => {
                    out.fill(value);
                    Ok(true)
                }
                None => Ok(false),
            }
        }
    }

    fn fake_device(log: &DropLog) -> VideoDevice {
        let source = FakeScreen::connect(log, false).unwrap();
        VideoDevice::from_source(VideoDeviceConfig::default(), Box::new(source)).unwrap()
    }

    #[test]
    fn test_frames_then_no_frame() {
        let log = DropLog::default();
        let mut device = fake_device(&log);
        assert_eq!(device.width(), 2);
        assert_eq!(device.frame_len(PixelFormat::Bgra), 16);

        let mut frame = vec![0u8; 16];
        assert!(device.get_frame_bgra(&mut frame).unwrap());
        assert!(frame.iter().all(|b| *b == 0x22));
        assert!(device.get_frame_bgra(&mut frame).unwrap());
        assert!(frame.iter().all(|b| *b == 0x11));

        // No new frame: buffer is not touched
        frame.fill(0xAB);
        assert!(!device.get_frame_bgra(&mut frame).unwrap());
        assert!(frame.iter().all(|b| *b == 0xAB));
    }

    #[test]
    fn test_small_buffer_rejected() {
        let log = DropLog::default();
        let mut device = fake_device(&log);
        let mut frame = vec![0u8; 15];
        let result = device.get_frame_bgra(&mut frame);
        assert!(matches!(
            result,
            Err(CaptureError::BufferTooSmall { needed: 16, got: 15 })
        ));
    }

    #[test]
    fn test_oversized_buffer_only_frame_written() {
        let log = DropLog::default();
        let mut device = fake_device(&log);
        let mut frame = vec![0u8; 20];
        assert!(device.get_frame_bgra(&mut frame).unwrap());
        assert!(frame[..16].iter().all(|b| *b == 0x22));
        assert_eq!(&frame[16..], &[0, 0, 0, 0]);
    }

    #[test]
    fn test_default_grab_formats() {
        let log = DropLog::default();
        let mut device = fake_device(&log);

        let mut out = Vec::new();
        assert!(device.get_frame(PixelFormat::Bgra, &mut out).unwrap());
        assert_eq!(out.len(), 16);

        assert!(matches!(
            device.get_frame_nv12(&mut out),
            Err(CaptureError::UnsupportedFormat(_))
        ));
        assert!(matches!(
            device.get_frame_yuv420(&mut out),
            Err(CaptureError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn test_pull_after_termination_fails() {
        let log = DropLog::default();
        let mut source = FakeScreen::connect(&log, false).unwrap();
        source.lifecycle.terminate();
        let mut device =
            VideoDevice::from_source(VideoDeviceConfig::default(), Box::new(source)).unwrap();

        let mut frame = vec![0u8; 16];
        let result = device.get_frame_bgra(&mut frame);
        assert!(matches!(result, Err(CaptureError::NotConnected(_))));
        assert!(frame.iter().all(|b| *b == 0));
    }

    #[test]
    fn test_release_in_reverse_order() {
        let log = DropLog::default();
        let device = fake_device(&log);
        assert!(log.borrow().is_empty());

        drop(device);
        assert_eq!(*log.borrow(), vec!["stream", "client", "connection"]);
    }

    #[test]
    fn test_partial_connect_releases_acquired() {
        let log = DropLog::default();
        let result = FakeScreen::connect(&log, true);
        assert!(result.is_err());
        // Locals drop in reverse declaration order
        assert_eq!(*log.borrow(), vec!["client", "connection"]);
    }

    #[test]
    fn test_empty_screen_rejected() {
        let log = DropLog::default();
        let mut source = FakeScreen::connect(&log, false).unwrap();
        source.width = 0;
        let result = VideoDevice::from_source(VideoDeviceConfig::default(), Box::new(source));
        assert!(matches!(result, Err(CaptureError::ResourceAcquisition(_))));
        assert_eq!(log.borrow().len(), 3);
    }
}
