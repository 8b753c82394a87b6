// Linux screen capture over the X11 protocol, with MIT-SHM when the server allows it

use super::VideoSource;
use crate::core::convert::frame_size;
use crate::core::session::Lifecycle;
use crate::models::capture::{CaptureError, CaptureResult, PixelFormat, VideoDeviceConfig};
use std::io;
use std::rc::Rc;
use tracing::debug;
use x11rb::connection::{Connection, RequestConnection};
use x11rb::errors::ReplyError;
use x11rb::protocol::shm::{self, ConnectionExt as _};
use x11rb::protocol::xproto::{ConnectionExt as _, ImageFormat, Window};
use x11rb::rust_connection::RustConnection;

/// SysV shared memory segment attached to this process
struct ShmSegment {
    id: i32,
    addr: *mut u8,
    len: usize,
    removed: bool,
}

impl ShmSegment {
    fn create(len: usize) -> io::Result<Self> {
        let id = unsafe { libc::shmget(libc::IPC_PRIVATE, len, libc::IPC_CREAT | 0o600) };
        if id == -1 {
            return Err(io::Error::last_os_error());
        }

        let addr = unsafe { libc::shmat(id, std::ptr::null(), 0) };
        if addr as isize == -1 {
            let err = io::Error::last_os_error();
            unsafe { libc::shmctl(id, libc::IPC_RMID, std::ptr::null_mut()) };
            return Err(err);
        }

        Ok(Self {
            id,
            addr: addr as *mut u8,
            len,
            removed: false,
        })
    }

    /// The kernel destroys the segment once every attachment is gone
    fn mark_for_removal(&mut self) {
        if !self.removed {
            unsafe { libc::shmctl(self.id, libc::IPC_RMID, std::ptr::null_mut()) };
            self.removed = true;
        }
    }

    fn bytes(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.addr, self.len) }
    }

    #[cfg(test)]
    fn bytes_mut(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.addr, self.len) }
    }
}

impl Drop for ShmSegment {
    fn drop(&mut self) {
        unsafe { libc::shmdt(self.addr as *const libc::c_void) };
        self.mark_for_removal();
    }
}

/// Server-side registration of a segment, detached when dropped
struct ServerAttachment {
    conn: Rc<RustConnection>,
    seg: shm::Seg,
}

impl Drop for ServerAttachment {
    fn drop(&mut self) {
        if self.conn.shm_detach(self.seg).is_ok() {
            let _ = self.conn.flush();
        }
    }
}

/// Shared memory grab target. The server detaches before the local mapping goes away.
struct ShmGrab {
    attachment: ServerAttachment,
    segment: ShmSegment,
}

impl ShmGrab {
    fn setup(conn: &Rc<RustConnection>, len: usize) -> Result<Self, String> {
        let present = conn
            .extension_information(shm::X11_EXTENSION_NAME)
            .map_err(|e| e.to_string())?;
        if present.is_none() {
            return Err("MIT-SHM extension not present".to_string());
        }

        conn.shm_query_version()
            .map_err(|e| e.to_string())?
            .reply()
            .map_err(|e| format!("MIT-SHM version query failed: {}", e))?;

        let mut segment =
            ShmSegment::create(len).map_err(|e| format!("shared memory segment: {}", e))?;

        let seg = conn.generate_id().map_err(|e| e.to_string())?;
        conn.shm_attach(seg, segment.id as u32, false)
            .map_err(|e| e.to_string())?
            .check()
            .map_err(|e| format!("server refused segment: {}", e))?;
        let attachment = ServerAttachment {
            conn: Rc::clone(conn),
            seg,
        };

        segment.mark_for_removal();

        Ok(Self {
            attachment,
            segment,
        })
    }
}

enum GrabPath {
    Shm(ShmGrab),
    /// Image data travels in the GetImage reply
    Standard,
}

/// Root window capture on one X screen
pub struct X11Session {
    lifecycle: Lifecycle,
    width: u16,
    height: u16,
    root: Window,
    path: GrabPath,
    conn: Rc<RustConnection>,
}

impl X11Session {
    pub fn connect(config: &VideoDeviceConfig) -> CaptureResult<Self> {
        let mut lifecycle = Lifecycle::new("x11");
        lifecycle.begin()?;

        let display = if config.display_id.is_empty() {
            None
        } else {
            Some(config.display_id.as_str())
        };

        let (conn, screen_num) = match x11rb::connect(display) {
            Ok(connected) => connected,
            Err(e) => {
                lifecycle.fail(&e.to_string());
                return Err(CaptureError::ResourceAcquisition(format!(
                    "Failed to connect to X server {:?}: {}",
                    config.display_id, e
                )));
            }
        };

        let (root, width, height) = match conn.setup().roots.get(screen_num) {
            Some(screen) => (screen.root, screen.width_in_pixels, screen.height_in_pixels),
            None => {
                lifecycle.fail("screen missing from setup");
                return Err(CaptureError::DisplayNotFound(format!(
                    "screen {} on {:?}",
                    screen_num, config.display_id
                )));
            }
        };

        let conn = Rc::new(conn);
        let len = frame_size(PixelFormat::Bgra, width as u32, height as u32);

        let path = if config.use_shm {
            match ShmGrab::setup(&conn, len) {
                Ok(grab) => GrabPath::Shm(grab),
                Err(reason) => {
                    debug!(%reason, "MIT-SHM unavailable, using GetImage");
                    GrabPath::Standard
                }
            }
        } else {
            GrabPath::Standard
        };

        lifecycle.ready()?;
        debug!(
            width,
            height,
            shm = matches!(path, GrabPath::Shm(_)),
            "X11 capture ready"
        );

        Ok(Self {
            lifecycle,
            width,
            height,
            root,
            path,
            conn,
        })
    }

    pub fn uses_shm(&self) -> bool {
        matches!(self.path, GrabPath::Shm(_))
    }

    fn fetch_shm(&self, grab: &ShmGrab) -> Result<(), ReplyError> {
        self.conn
            .shm_get_image(
                self.root,
                0,
                0,
                self.width,
                self.height,
                !0,
                ImageFormat::Z_PIXMAP.into(),
                grab.attachment.seg,
                0,
            )?
            .reply()?;
        Ok(())
    }

    fn fetch_standard(&self) -> Result<(u8, Vec<u8>), ReplyError> {
        let reply = self
            .conn
            .get_image(ImageFormat::Z_PIXMAP, self.root, 0, 0, self.width, self.height, !0)?
            .reply()?;
        Ok((reply.depth, reply.data))
    }
}

/// Copy a GetImage reply verbatim into a frame-sized `out`. Only replies that
/// fill the frame at 4 bytes per pixel, which the server hands out as packed
/// BGRA on little-endian hosts, are accepted.
fn copy_reply(depth: u8, data: &[u8], out: &mut [u8]) -> CaptureResult<()> {
    if depth != 24 && depth != 32 {
        return Err(CaptureError::UnsupportedFormat(format!(
            "X server image depth {} is not 32-bit BGRA",
            depth
        )));
    }
    if data.len() != out.len() {
        return Err(CaptureError::UnsupportedFormat(format!(
            "X server image is {} bytes, a 32-bit BGRA frame needs {}",
            data.len(),
            out.len()
        )));
    }
    out.copy_from_slice(data);
    Ok(())
}

impl VideoSource for X11Session {
    fn width(&self) -> u32 {
        self.width as u32
    }

    fn height(&self) -> u32 {
        self.height as u32
    }

    fn grab_bgra(&mut self, out: &mut [u8]) -> CaptureResult<bool> {
        self.lifecycle.ensure_ready()?;

        let len = frame_size(PixelFormat::Bgra, self.width(), self.height());
        if out.len() < len {
            return Err(CaptureError::BufferTooSmall {
                needed: len,
                got: out.len(),
            });
        }

        let fetched = match &self.path {
            GrabPath::Shm(grab) => self.fetch_shm(grab).map(|()| {
                out[..len].copy_from_slice(&grab.segment.bytes()[..len]);
                Ok(())
            }),
            GrabPath::Standard => self
                .fetch_standard()
                .map(|(depth, data)| copy_reply(depth, &data, &mut out[..len])),
        };

        match fetched {
            Ok(copied) => copied.map(|()| true),
            Err(e) => {
                if let ReplyError::ConnectionError(ref lost) = e {
                    self.lifecycle.fail(&lost.to_string());
                }
                Err(CaptureError::CaptureFailed(format!("Failed to get image: {}", e)))
            }
        }
    }
}
