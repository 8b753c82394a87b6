// Linux screen capture through NVIDIA frame buffer capture (NvFBC), system memory path

use super::VideoSource;
use crate::core::convert::{frame_size, nv12_to_i420};
use crate::core::session::Lifecycle;
use crate::models::capture::{CaptureError, CaptureResult, PixelFormat, VideoDeviceConfig};
use std::ffi::{c_void, CStr};
use std::rc::Rc;
use tracing::{debug, warn};
use x11rb::connection::Connection;
use x11rb::rust_connection::RustConnection;

/// Bindings for the subset of the NvFBC 1.8 ABI used here
#[allow(dead_code)]
mod ffi {
    use std::ffi::{c_char, c_void};

    pub const NVFBC_VERSION: u32 = 8 | (1 << 8);

    pub type Status = u32;
    pub type Bool = u32;
    pub type SessionHandle = u64;

    pub const SUCCESS: Status = 0;
    pub const FALSE: Bool = 0;
    pub const TRUE: Bool = 1;

    pub const CAPTURE_TO_SYS: u32 = 0;
    pub const TRACKING_SCREEN: u32 = 2;

    pub const BUFFER_FORMAT_ARGB: u32 = 0;
    pub const BUFFER_FORMAT_RGB: u32 = 1;
    pub const BUFFER_FORMAT_NV12: u32 = 2;
    pub const BUFFER_FORMAT_YUV444P: u32 = 3;
    pub const BUFFER_FORMAT_RGBA: u32 = 4;
    pub const BUFFER_FORMAT_BGRA: u32 = 5;

    pub const TOSYS_GRAB_FLAGS_NOWAIT: u32 = 1;

    const OUTPUT_MAX: usize = 5;
    const OUTPUT_NAME_LEN: usize = 128;

    /// Versioned struct tag: size, struct revision, API version
    pub fn struct_version<T>(revision: u32) -> u32 {
        std::mem::size_of::<T>() as u32 | (revision << 16) | (NVFBC_VERSION << 24)
    }

    #[repr(C)]
    #[derive(Clone, Copy)]
    pub struct BoxRect {
        pub x: u32,
        pub y: u32,
        pub w: u32,
        pub h: u32,
    }

    #[repr(C)]
    #[derive(Clone, Copy)]
    pub struct Size {
        pub w: u32,
        pub h: u32,
    }

    #[repr(C)]
    pub struct FrameGrabInfo {
        pub width: u32,
        pub height: u32,
        pub byte_size: u32,
        pub current_frame: u32,
        pub is_new_frame: Bool,
        pub timestamp_us: u64,
        pub missed_frames: u32,
        pub required_post_processing: Bool,
        pub direct_capture: Bool,
    }

    #[repr(C)]
    pub struct CreateHandleParams {
        pub version: u32,
        pub private_data: *const c_void,
        pub private_data_size: u32,
        pub externally_managed_context: Bool,
        pub glx_ctx: *mut c_void,
        pub glx_fb_config: *mut c_void,
    }

    #[repr(C)]
    pub struct DestroyHandleParams {
        pub version: u32,
    }

    #[repr(C)]
    pub struct RandrOutputInfo {
        pub id: u32,
        pub name: [c_char; OUTPUT_NAME_LEN],
        pub tracked_box: BoxRect,
    }

    #[repr(C)]
    pub struct GetStatusParams {
        pub version: u32,
        pub is_capture_possible: Bool,
        pub currently_capturing: Bool,
        pub can_create_now: Bool,
        pub screen_size: Size,
        pub xrandr_available: Bool,
        pub outputs: [RandrOutputInfo; OUTPUT_MAX],
        pub output_num: u32,
        pub nvfbc_version: u32,
        pub in_modeset: Bool,
    }

    #[repr(C)]
    pub struct CreateCaptureSessionParams {
        pub version: u32,
        pub capture_type: u32,
        pub tracking_type: u32,
        pub output_id: u32,
        pub capture_box: BoxRect,
        pub frame_size: Size,
        pub with_cursor: Bool,
        pub disable_auto_modeset_recovery: Bool,
        pub round_frame_size: Bool,
        pub sampling_rate_ms: u32,
        pub push_model: Bool,
        pub allow_direct_capture: Bool,
    }

    #[repr(C)]
    pub struct DestroyCaptureSessionParams {
        pub version: u32,
    }

    #[repr(C)]
    pub struct ToSysSetupParams {
        pub version: u32,
        pub buffer_format: u32,
        pub buffer: *mut *mut c_void,
        pub with_diff_map: Bool,
        pub diff_map: *mut *mut c_void,
        pub diff_map_scaling_factor: u32,
        pub diff_map_size: Size,
    }

    #[repr(C)]
    pub struct ToSysGrabFrameParams {
        pub version: u32,
        pub flags: u32,
        pub frame_grab_info: *mut FrameGrabInfo,
        pub timeout_ms: u32,
    }

    pub type GetLastErrorStrFn = unsafe extern "C" fn(SessionHandle) -> *const c_char;
    pub type CreateHandleFn =
        unsafe extern "C" fn(*mut SessionHandle, *mut CreateHandleParams) -> Status;
    pub type DestroyHandleFn =
        unsafe extern "C" fn(SessionHandle, *mut DestroyHandleParams) -> Status;
    pub type GetStatusFn = unsafe extern "C" fn(SessionHandle, *mut GetStatusParams) -> Status;
    pub type CreateCaptureSessionFn =
        unsafe extern "C" fn(SessionHandle, *mut CreateCaptureSessionParams) -> Status;
    pub type DestroyCaptureSessionFn =
        unsafe extern "C" fn(SessionHandle, *mut DestroyCaptureSessionParams) -> Status;
    pub type ToSysSetUpFn = unsafe extern "C" fn(SessionHandle, *mut ToSysSetupParams) -> Status;
    pub type ToSysGrabFrameFn =
        unsafe extern "C" fn(SessionHandle, *mut ToSysGrabFrameParams) -> Status;

    #[repr(C)]
    pub struct FunctionList {
        pub version: u32,
        pub get_last_error_str: Option<GetLastErrorStrFn>,
        pub create_handle: Option<CreateHandleFn>,
        pub destroy_handle: Option<DestroyHandleFn>,
        pub get_status: Option<GetStatusFn>,
        pub create_capture_session: Option<CreateCaptureSessionFn>,
        pub destroy_capture_session: Option<DestroyCaptureSessionFn>,
        pub to_sys_set_up: Option<ToSysSetUpFn>,
        pub to_sys_grab_frame: Option<ToSysGrabFrameFn>,
        pub to_cuda_set_up: *const c_void,
        pub to_cuda_grab_frame: *const c_void,
        pub pad1: *const c_void,
        pub pad2: *const c_void,
        pub pad3: *const c_void,
        pub bind_context: *const c_void,
        pub release_context: *const c_void,
        pub pad4: *const c_void,
        pub pad5: *const c_void,
        pub pad6: *const c_void,
        pub pad7: *const c_void,
        pub to_gl_set_up: *const c_void,
        pub to_gl_grab_frame: *const c_void,
    }

    pub type CreateInstanceFn = unsafe extern "C" fn(*mut FunctionList) -> Status;
}

const LIBRARY_NAME: &CStr = c"libnvidia-fbc.so.1";

/// SDK buffer format for a pixel layout the driver can produce natively
fn native_format(format: PixelFormat) -> Option<u32> {
    match format {
        PixelFormat::Argb => Some(ffi::BUFFER_FORMAT_ARGB),
        PixelFormat::Rgb => Some(ffi::BUFFER_FORMAT_RGB),
        PixelFormat::Nv12 => Some(ffi::BUFFER_FORMAT_NV12),
        PixelFormat::Yuv444p => Some(ffi::BUFFER_FORMAT_YUV444P),
        PixelFormat::Rgba => Some(ffi::BUFFER_FORMAT_RGBA),
        PixelFormat::Bgra => Some(ffi::BUFFER_FORMAT_BGRA),
        PixelFormat::I420 => None,
    }
}

fn missing(name: &str) -> CaptureError {
    CaptureError::ResourceAcquisition(format!("NvFBC function list lacks {}", name))
}

/// Handle returned by `dlopen`, closed when dropped
struct Library {
    raw: *mut c_void,
}

impl Library {
    fn open(name: &CStr) -> CaptureResult<Self> {
        let raw = unsafe { libc::dlopen(name.as_ptr(), libc::RTLD_NOW) };
        if raw.is_null() {
            return Err(CaptureError::ResourceAcquisition(format!(
                "Unable to open {}: {}",
                name.to_string_lossy(),
                dl_error()
            )));
        }
        Ok(Self { raw })
    }

    fn symbol(&self, name: &CStr) -> CaptureResult<*mut c_void> {
        let sym = unsafe { libc::dlsym(self.raw, name.as_ptr()) };
        if sym.is_null() {
            return Err(CaptureError::ResourceAcquisition(format!(
                "Unable to resolve {}: {}",
                name.to_string_lossy(),
                dl_error()
            )));
        }
        Ok(sym)
    }
}

impl Drop for Library {
    fn drop(&mut self) {
        unsafe { libc::dlclose(self.raw) };
    }
}

fn dl_error() -> String {
    let msg = unsafe { libc::dlerror() };
    if msg.is_null() {
        "unknown error".to_string()
    } else {
        unsafe { CStr::from_ptr(msg) }.to_string_lossy().into_owned()
    }
}

/// Entry points filled in by `NvFBCCreateInstance`
struct Api {
    fns: ffi::FunctionList,
}

impl Api {
    fn load(library: &Library) -> CaptureResult<Self> {
        let sym = library.symbol(c"NvFBCCreateInstance")?;
        let create_instance: ffi::CreateInstanceFn = unsafe { std::mem::transmute(sym) };

        let mut fns: ffi::FunctionList = unsafe { std::mem::zeroed() };
        fns.version = ffi::NVFBC_VERSION;
        let status = unsafe { create_instance(&mut fns) };
        if status != ffi::SUCCESS {
            return Err(CaptureError::ResourceAcquisition(format!(
                "Unable to create NvFBC instance (status {})",
                status
            )));
        }
        Ok(Self { fns })
    }

    fn last_error(&self, handle: ffi::SessionHandle) -> String {
        let Some(get_last_error_str) = self.fns.get_last_error_str else {
            return "no error string available".to_string();
        };
        let msg = unsafe { get_last_error_str(handle) };
        if msg.is_null() {
            return "no error string available".to_string();
        }
        unsafe { CStr::from_ptr(msg) }.to_string_lossy().into_owned()
    }
}

/// NvFBC client handle, destroyed when dropped
struct Handle {
    api: Rc<Api>,
    raw: ffi::SessionHandle,
}

impl Handle {
    fn create(api: &Rc<Api>) -> CaptureResult<Self> {
        let create_handle = api.fns.create_handle.ok_or_else(|| missing("nvFBCCreateHandle"))?;

        let mut raw: ffi::SessionHandle = 0;
        let mut params: ffi::CreateHandleParams = unsafe { std::mem::zeroed() };
        params.version = ffi::struct_version::<ffi::CreateHandleParams>(2);
        let status = unsafe { create_handle(&mut raw, &mut params) };
        if status != ffi::SUCCESS {
            return Err(CaptureError::ResourceAcquisition(format!(
                "NvFBC create handle failed: {}",
                api.last_error(raw)
            )));
        }
        Ok(Self {
            api: Rc::clone(api),
            raw,
        })
    }

    fn status(&self) -> CaptureResult<ffi::GetStatusParams> {
        let get_status = self.api.fns.get_status.ok_or_else(|| missing("nvFBCGetStatus"))?;

        let mut params: ffi::GetStatusParams = unsafe { std::mem::zeroed() };
        params.version = ffi::struct_version::<ffi::GetStatusParams>(2);
        let status = unsafe { get_status(self.raw, &mut params) };
        if status != ffi::SUCCESS {
            return Err(CaptureError::ResourceAcquisition(format!(
                "NvFBC get status failed: {}",
                self.api.last_error(self.raw)
            )));
        }
        Ok(params)
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        let Some(destroy_handle) = self.api.fns.destroy_handle else {
            return;
        };
        let mut params = ffi::DestroyHandleParams {
            version: ffi::struct_version::<ffi::DestroyHandleParams>(1),
        };
        if unsafe { destroy_handle(self.raw, &mut params) } != ffi::SUCCESS {
            warn!("NvFBC destroy handle failed: {}", self.api.last_error(self.raw));
        }
    }
}

/// System memory capture session on a handle, destroyed when dropped
struct CaptureSession {
    api: Rc<Api>,
    raw: ffi::SessionHandle,
}

impl CaptureSession {
    fn create(handle: &Handle, width: u32, height: u32, with_cursor: bool) -> CaptureResult<Self> {
        let api = &handle.api;
        let create_capture_session = api
            .fns
            .create_capture_session
            .ok_or_else(|| missing("nvFBCCreateCaptureSession"))?;

        let mut params: ffi::CreateCaptureSessionParams = unsafe { std::mem::zeroed() };
        params.version = ffi::struct_version::<ffi::CreateCaptureSessionParams>(6);
        params.capture_type = ffi::CAPTURE_TO_SYS;
        params.tracking_type = ffi::TRACKING_SCREEN;
        params.with_cursor = if with_cursor { ffi::TRUE } else { ffi::FALSE };
        params.capture_box = ffi::BoxRect {
            x: 0,
            y: 0,
            w: width,
            h: height,
        };
        params.frame_size = ffi::Size {
            w: width,
            h: height,
        };

        let status = unsafe { create_capture_session(handle.raw, &mut params) };
        if status != ffi::SUCCESS {
            return Err(CaptureError::ResourceAcquisition(format!(
                "NvFBC create capture session failed: {}",
                api.last_error(handle.raw)
            )));
        }
        Ok(Self {
            api: Rc::clone(api),
            raw: handle.raw,
        })
    }
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        let Some(destroy_capture_session) = self.api.fns.destroy_capture_session else {
            return;
        };
        let mut params = ffi::DestroyCaptureSessionParams {
            version: ffi::struct_version::<ffi::DestroyCaptureSessionParams>(1),
        };
        if unsafe { destroy_capture_session(self.raw, &mut params) } != ffi::SUCCESS {
            warn!(
                "NvFBC destroy capture session failed: {}",
                self.api.last_error(self.raw)
            );
        }
    }
}

/// Environment variable value that is put back when dropped
struct EnvOverride {
    name: &'static str,
    previous: Option<std::ffi::OsString>,
}

impl EnvOverride {
    fn set(name: &'static str, value: &str) -> Self {
        let previous = std::env::var_os(name);
        std::env::set_var(name, value);
        Self { name, previous }
    }
}

impl Drop for EnvOverride {
    fn drop(&mut self) {
        match self.previous.take() {
            Some(value) => std::env::set_var(self.name, value),
            None => std::env::remove_var(self.name),
        }
    }
}

/// NvFBC capture of a whole X screen.
///
/// Release order follows field order: capture session, handle, entry points,
/// the shared library, then the X connection used to size the screen.
pub struct NvFbcSession {
    lifecycle: Lifecycle,
    width: u32,
    height: u32,
    capture: CaptureSession,
    handle: Handle,
    api: Rc<Api>,
    _library: Library,
    _display: RustConnection,
}

impl NvFbcSession {
    pub fn connect(config: &VideoDeviceConfig) -> CaptureResult<Self> {
        let mut lifecycle = Lifecycle::new("nvfbc");
        lifecycle.begin()?;

        match Self::acquire(lifecycle, config) {
            Ok(session) => Ok(session),
            Err((mut lifecycle, e)) => {
                lifecycle.fail(&e.to_string());
                Err(e)
            }
        }
    }

    fn acquire(
        mut lifecycle: Lifecycle,
        config: &VideoDeviceConfig,
    ) -> Result<Self, (Lifecycle, CaptureError)> {
        macro_rules! step {
            ($e:expr) => {
                match $e {
                    Ok(v) => v,
                    Err(e) => return Err((lifecycle, e)),
                }
            };
        }

        // The driver opens its own X connection from DISPLAY while the handle
        // is created. Other threads reading the environment meanwhile see the
        // override.
        let display_env = (!config.display_id.is_empty())
            .then(|| EnvOverride::set("DISPLAY", &config.display_id));

        let display = if config.display_id.is_empty() {
            None
        } else {
            Some(config.display_id.as_str())
        };
        let (conn, screen_num) = step!(x11rb::connect(display).map_err(|e| {
            CaptureError::ResourceAcquisition(format!("Failed to open X display: {}", e))
        }));
        let (width, height) = step!(conn
            .setup()
            .roots
            .get(screen_num)
            .map(|s| (s.width_in_pixels as u32, s.height_in_pixels as u32))
            .ok_or_else(|| CaptureError::DisplayNotFound(format!("screen {}", screen_num))));

        let library = step!(Library::open(LIBRARY_NAME));
        let api = Rc::new(step!(Api::load(&library)));
        let handle = step!(Handle::create(&api));
        drop(display_env);

        let status = step!(handle.status());
        if status.can_create_now == ffi::FALSE {
            return Err((
                lifecycle,
                CaptureError::ResourceAcquisition(
                    "NvFBC cannot create a capture session on this system now".to_string(),
                ),
            ));
        }

        let capture = step!(CaptureSession::create(
            &handle,
            width,
            height,
            config.capture_cursor
        ));

        step!(lifecycle.ready().map_err(CaptureError::from));
        debug!(width, height, cursor = config.capture_cursor, "NvFBC capture ready");

        Ok(Self {
            lifecycle,
            width,
            height,
            capture,
            handle,
            api,
            _library: library,
            _display: conn,
        })
    }

    /// Grab one frame in `buffer_format`. The returned bytes live in a
    /// driver-owned buffer that stays valid until the next grab.
    fn grab_native(&mut self, format: PixelFormat, buffer_format: u32) -> CaptureResult<&[u8]> {
        self.lifecycle.ensure_ready()?;

        let to_sys_set_up = self.api.fns.to_sys_set_up.ok_or_else(|| missing("nvFBCToSysSetUp"))?;
        let to_sys_grab_frame = self
            .api
            .fns
            .to_sys_grab_frame
            .ok_or_else(|| missing("nvFBCToSysGrabFrame"))?;

        let mut frame: *mut c_void = std::ptr::null_mut();

        let mut setup: ffi::ToSysSetupParams = unsafe { std::mem::zeroed() };
        setup.version = ffi::struct_version::<ffi::ToSysSetupParams>(3);
        setup.buffer_format = buffer_format;
        setup.buffer = &mut frame;
        setup.with_diff_map = ffi::FALSE;

        // Repeated setups with the same format are accepted by the driver
        if unsafe { to_sys_set_up(self.capture.raw, &mut setup) } != ffi::SUCCESS {
            return Err(CaptureError::CaptureFailed(format!(
                "NvFBC ToSysSetUp failed: {}",
                self.api.last_error(self.handle.raw)
            )));
        }

        let mut info: ffi::FrameGrabInfo = unsafe { std::mem::zeroed() };
        let mut grab: ffi::ToSysGrabFrameParams = unsafe { std::mem::zeroed() };
        grab.version = ffi::struct_version::<ffi::ToSysGrabFrameParams>(2);
        grab.flags = ffi::TOSYS_GRAB_FLAGS_NOWAIT;
        grab.frame_grab_info = &mut info;

        if unsafe { to_sys_grab_frame(self.capture.raw, &mut grab) } != ffi::SUCCESS {
            return Err(CaptureError::CaptureFailed(format!(
                "NvFBC grab frame failed: {}",
                self.api.last_error(self.handle.raw)
            )));
        }

        if frame.is_null() {
            return Err(CaptureError::CaptureFailed(
                "NvFBC returned no frame buffer".to_string(),
            ));
        }

        let len = frame_size(format, self.width, self.height);
        Ok(unsafe { std::slice::from_raw_parts(frame as *const u8, len) })
    }
}

impl VideoSource for NvFbcSession {
    fn width(&self) -> u32 {
        self.width
    }

    fn height(&self) -> u32 {
        self.height
    }

    fn grab_bgra(&mut self, out: &mut [u8]) -> CaptureResult<bool> {
        let len = frame_size(PixelFormat::Bgra, self.width, self.height);
        if out.len() < len {
            return Err(CaptureError::BufferTooSmall {
                needed: len,
                got: out.len(),
            });
        }
        let frame = self.grab_native(PixelFormat::Bgra, ffi::BUFFER_FORMAT_BGRA)?;
        out[..len].copy_from_slice(frame);
        Ok(true)
    }

    fn grab(&mut self, format: PixelFormat, out: &mut Vec<u8>) -> CaptureResult<bool> {
        let (width, height) = (self.width, self.height);
        match native_format(format) {
            Some(buffer_format) => {
                let frame = self.grab_native(format, buffer_format)?;
                out.clear();
                out.extend_from_slice(frame);
            }
            None => {
                let nv12 = self.grab_native(PixelFormat::Nv12, ffi::BUFFER_FORMAT_NV12)?;
                nv12_to_i420(nv12, width, height, out)?;
            }
        }
        Ok(true)
    }
}
