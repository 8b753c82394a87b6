// Windows screen capture through DXGI desktop duplication

use super::VideoSource;
use crate::core::convert::copy_rows;
use crate::core::session::Lifecycle;
use crate::models::capture::{CaptureError, CaptureResult, VideoDeviceConfig};
use tracing::{debug, trace};
use windows::core::Interface;
use windows::Win32::Foundation::HMODULE;
use windows::Win32::Graphics::Direct3D::*;
use windows::Win32::Graphics::Direct3D11::*;
use windows::Win32::Graphics::Dxgi::Common::*;
use windows::Win32::Graphics::Dxgi::*;

/// How long a pull waits for the compositor to present a new frame
const ACQUIRE_TIMEOUT_MS: u32 = 100;

/// Identifier that always means the first output of the adapter
const PRIMARY_DISPLAY: &str = r"\\.\DISPLAY1";

fn is_primary_display(display_id: &str) -> bool {
    display_id.is_empty() || display_id == PRIMARY_DISPLAY
}

fn output_name(desc: &DXGI_OUTPUT_DESC) -> String {
    String::from_utf16_lossy(&desc.DeviceName)
        .trim_end_matches('\0')
        .to_string()
}

/// Desktop duplication session for one output.
///
/// Fields are declared in release order: the staging texture and duplication go
/// before the device context and device they were created from.
pub struct DxgiSession {
    lifecycle: Lifecycle,
    width: u32,
    height: u32,
    capture_cursor: bool,
    staging: ID3D11Texture2D,
    duplication: IDXGIOutputDuplication,
    context: ID3D11DeviceContext,
    _device: ID3D11Device,
}

impl DxgiSession {
    pub fn connect(config: &VideoDeviceConfig) -> CaptureResult<Self> {
        let mut lifecycle = Lifecycle::new("dxgi");
        lifecycle.begin()?;

        match unsafe { Self::acquire(config) } {
            Ok(parts) => {
                lifecycle.ready()?;
                let (device, context, duplication, staging, width, height) = parts;
                debug!(width, height, display = %config.display_id, "DXGI duplication ready");
                Ok(Self {
                    lifecycle,
                    width,
                    height,
                    capture_cursor: config.capture_cursor,
                    staging,
                    duplication,
                    context,
                    _device: device,
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
        config: &VideoDeviceConfig,
    ) -> CaptureResult<(
        ID3D11Device,
        ID3D11DeviceContext,
        IDXGIOutputDuplication,
        ID3D11Texture2D,
        u32,
        u32,
    )> {
        let (device, context) = create_d3d_device()?;

        let dxgi_device: IDXGIDevice = device.cast().map_err(|e| {
            CaptureError::ResourceAcquisition(format!("Failed to query IDXGIDevice: {}", e))
        })?;
        let adapter = dxgi_device.GetAdapter().map_err(|e| {
            CaptureError::ResourceAcquisition(format!("Failed to get DXGI adapter: {}", e))
        })?;

        let output = find_output(&adapter, &config.display_id)?;
        let desc = output.GetDesc().map_err(|e| {
            CaptureError::ResourceAcquisition(format!("Failed to get output desc: {}", e))
        })?;

        let width = (desc.DesktopCoordinates.right - desc.DesktopCoordinates.left) as u32;
        let height = (desc.DesktopCoordinates.bottom - desc.DesktopCoordinates.top) as u32;

        let output1: IDXGIOutput1 = output.cast().map_err(|e| {
            CaptureError::ResourceAcquisition(format!("Failed to cast to IDXGIOutput1: {}", e))
        })?;

        let duplication = output1.DuplicateOutput(&device).map_err(|e| {
            CaptureError::ResourceAcquisition(format!(
                "Failed to duplicate output {}: {}",
                output_name(&desc),
                e
            ))
        })?;

        let texture_desc = D3D11_TEXTURE2D_DESC {
            Width: width,
            Height: height,
            MipLevels: 1,
            ArraySize: 1,
            Format: DXGI_FORMAT_B8G8R8A8_UNORM,
            SampleDesc: DXGI_SAMPLE_DESC {
                Count: 1,
                Quality: 0,
            },
            Usage: D3D11_USAGE_STAGING,
            CPUAccessFlags: D3D11_CPU_ACCESS_READ.0 as u32,
            ..Default::default()
        };

        let mut staging: Option<ID3D11Texture2D> = None;
        device
            .CreateTexture2D(&texture_desc, None, Some(&mut staging))
            .map_err(|e| {
                CaptureError::ResourceAcquisition(format!("Failed to create staging texture: {}", e))
            })?;
        let staging = staging.ok_or_else(|| {
            CaptureError::ResourceAcquisition("Staging texture was not returned".to_string())
        })?;

        Ok((device, context, duplication, staging, width, height))
    }
}

unsafe fn create_d3d_device() -> CaptureResult<(ID3D11Device, ID3D11DeviceContext)> {
    let feature_levels = [
        D3D_FEATURE_LEVEL_11_0,
        D3D_FEATURE_LEVEL_10_1,
        D3D_FEATURE_LEVEL_10_0,
        D3D_FEATURE_LEVEL_9_3,
        D3D_FEATURE_LEVEL_9_2,
        D3D_FEATURE_LEVEL_9_1,
    ];

    let mut device: Option<ID3D11Device> = None;
    let mut context: Option<ID3D11DeviceContext> = None;

    D3D11CreateDevice(
        None,
        D3D_DRIVER_TYPE_HARDWARE,
        HMODULE::default(),
        D3D11_CREATE_DEVICE_BGRA_SUPPORT,
        Some(&feature_levels),
        D3D11_SDK_VERSION,
        Some(&mut device),
        None,
        Some(&mut context),
    )
    .map_err(|e| CaptureError::ResourceAcquisition(format!("Failed to create D3D11 device: {}", e)))?;

    match (device, context) {
        (Some(device), Some(context)) => Ok((device, context)),
        _ => Err(CaptureError::ResourceAcquisition(
            "D3D11 device creation returned no device".to_string(),
        )),
    }
}

/// First output for the primary id, otherwise the output whose device name matches
unsafe fn find_output(adapter: &IDXGIAdapter, display_id: &str) -> CaptureResult<IDXGIOutput> {
    if is_primary_display(display_id) {
        return adapter
            .EnumOutputs(0)
            .map_err(|_| CaptureError::DisplayNotFound(PRIMARY_DISPLAY.to_string()));
    }

    let mut index = 0;
    loop {
        let output = match adapter.EnumOutputs(index) {
            Ok(output) => output,
            Err(e) if e.code() == DXGI_ERROR_NOT_FOUND => break,
            Err(e) => {
                return Err(CaptureError::ResourceAcquisition(format!(
                    "Failed to enumerate outputs: {}",
                    e
                )))
            }
        };

        if let Ok(desc) = output.GetDesc() {
            if output_name(&desc) == display_id {
                return Ok(output);
            }
        }
        index += 1;
    }

    Err(CaptureError::DisplayNotFound(display_id.to_string()))
}

/// An acquired duplication frame, released exactly once when dropped
struct FrameLease<'a> {
    duplication: &'a IDXGIOutputDuplication,
}

impl Drop for FrameLease<'_> {
    fn drop(&mut self) {
        if let Err(e) = unsafe { self.duplication.ReleaseFrame() } {
            debug!("ReleaseFrame failed: {}", e);
        }
    }
}

/// CPU mapping of the staging texture, unmapped when dropped
struct MappedStaging<'a> {
    context: &'a ID3D11DeviceContext,
    texture: &'a ID3D11Texture2D,
    mapped: D3D11_MAPPED_SUBRESOURCE,
}

impl<'a> MappedStaging<'a> {
    unsafe fn map(
        context: &'a ID3D11DeviceContext,
        texture: &'a ID3D11Texture2D,
    ) -> CaptureResult<Self> {
        let mut mapped = D3D11_MAPPED_SUBRESOURCE::default();
        context
            .Map(texture, 0, D3D11_MAP_READ, 0, Some(&mut mapped))
            .map_err(|e| CaptureError::CaptureFailed(format!("Failed to map texture: {}", e)))?;
        Ok(Self {
            context,
            texture,
            mapped,
        })
    }

    /// Mapped bytes covering `rows` rows of `row_bytes`
    unsafe fn bytes(&self, row_bytes: usize, rows: usize) -> &[u8] {
        let pitch = self.mapped.RowPitch as usize;
        let len = if rows == 0 {
            0
        } else {
            pitch * (rows - 1) + row_bytes
        };
        std::slice::from_raw_parts(self.mapped.pData as *const u8, len)
    }
}

impl Drop for MappedStaging<'_> {
    fn drop(&mut self) {
        unsafe { self.context.Unmap(self.texture, 0) };
    }
}

impl VideoSource for DxgiSession {
    fn width(&self) -> u32 {
        self.width
    }

    fn height(&self) -> u32 {
        self.height
    }

    fn grab_bgra(&mut self, out: &mut [u8]) -> CaptureResult<bool> {
        self.lifecycle.ensure_ready()?;

        let mut frame_info = DXGI_OUTDUPL_FRAME_INFO::default();
        let mut resource: Option<IDXGIResource> = None;

        let acquired = unsafe {
            self.duplication
                .AcquireNextFrame(ACQUIRE_TIMEOUT_MS, &mut frame_info, &mut resource)
        };
        if let Err(e) = acquired {
            if e.code() == DXGI_ERROR_WAIT_TIMEOUT {
                return Ok(false);
            }
            if e.code() == DXGI_ERROR_ACCESS_LOST {
                self.lifecycle.fail("desktop duplication access lost");
            }
            return Err(CaptureError::CaptureFailed(format!("Failed to acquire frame: {}", e)));
        }

        let _lease = FrameLease {
            duplication: &self.duplication,
        };

        let resource = resource.ok_or_else(|| {
            CaptureError::CaptureFailed("Acquired frame carries no resource".to_string())
        })?;
        let texture: ID3D11Texture2D = resource
            .cast()
            .map_err(|e| CaptureError::CaptureFailed(format!("Failed to cast to texture: {}", e)))?;

        let row_bytes = self.width as usize * 4;
        let rows = self.height as usize;

        unsafe {
            self.context.CopyResource(&self.staging, &texture);
            let mapped = MappedStaging::map(&self.context, &self.staging)?;
            copy_rows(
                mapped.bytes(row_bytes, rows),
                mapped.mapped.RowPitch as usize,
                out,
                row_bytes,
                rows,
            )?;
        }

        // Cursor blending is not performed, the update time only tells whether it would apply
        if self.capture_cursor && frame_info.LastMouseUpdateTime != 0 {
            trace!(
                visible = frame_info.PointerPosition.Visible.as_bool(),
                "Cursor updated in frame"
            );
        }

        Ok(true)
    }
}
