// Raw-to-canonical format conversion for frames and samples

use crate::models::audio::{AudioError, AudioResult, SampleFormat};
use crate::models::capture::{CaptureError, CaptureResult, PixelFormat};

// ==============================================================================
// Audio
// ==============================================================================

/// Convert one float sample to 16-bit. Out of range input is clamped, the
/// scaled value truncates toward zero.
pub fn f32_to_s16(sample: f32) -> i16 {
    let clamped = if sample.is_nan() {
        0.0
    } else {
        sample.clamp(-1.0, 1.0)
    };
    (clamped * 32767.0) as i16
}

/// Normalise raw interleaved samples into 16-bit little-endian PCM.
///
/// `out` is cleared first. A trailing partial sample is ignored.
pub fn to_s16le(raw: &[u8], format: SampleFormat, out: &mut Vec<u8>) -> AudioResult<()> {
    out.clear();
    match format {
        SampleFormat::S16 => {
            let whole = raw.len() - raw.len() % 2;
            out.extend_from_slice(&raw[..whole]);
        }
        SampleFormat::F32 => {
            out.reserve(raw.len() / 2);
            for chunk in raw.chunks_exact(4) {
                let sample = f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                out.extend_from_slice(&f32_to_s16(sample).to_le_bytes());
            }
        }
        SampleFormat::Unsupported { bits_per_sample } => {
            return Err(AudioError::UnsupportedFormat(bits_per_sample));
        }
    }
    Ok(())
}

// ==============================================================================
// Video
// ==============================================================================

/// Byte length of a tightly packed `width` x `height` image
pub fn frame_size(format: PixelFormat, width: u32, height: u32) -> usize {
    let pixels = width as usize * height as usize;
    match format {
        PixelFormat::Bgra | PixelFormat::Rgba | PixelFormat::Argb => pixels * 4,
        PixelFormat::Rgb | PixelFormat::Yuv444p => pixels * 3,
        PixelFormat::Nv12 => pixels * 3 / 2,
        PixelFormat::I420 => {
            let chroma = (width as usize / 2) * (height as usize / 2);
            pixels + 2 * chroma
        }
    }
}

/// Copy `rows` rows of `row_bytes` from a buffer whose rows are `src_pitch`
/// apart into `dst` with no gaps. Pitch padding is never copied.
pub fn copy_rows(
    src: &[u8],
    src_pitch: usize,
    dst: &mut [u8],
    row_bytes: usize,
    rows: usize,
) -> CaptureResult<()> {
    if src_pitch < row_bytes {
        return Err(CaptureError::CaptureFailed(format!(
            "Row pitch {} is smaller than row size {}",
            src_pitch, row_bytes
        )));
    }

    let needed = row_bytes * rows;
    if dst.len() < needed {
        return Err(CaptureError::BufferTooSmall {
            needed,
            got: dst.len(),
        });
    }

    if rows > 0 && src.len() < src_pitch * (rows - 1) + row_bytes {
        return Err(CaptureError::CaptureFailed(format!(
            "Source holds {} bytes, too short for {} rows at pitch {}",
            src.len(),
            rows,
            src_pitch
        )));
    }

    if src_pitch == row_bytes {
        dst[..needed].copy_from_slice(&src[..needed]);
        return Ok(());
    }

    for (y, dst_row) in dst[..needed].chunks_exact_mut(row_bytes).enumerate() {
        let offset = y * src_pitch;
        dst_row.copy_from_slice(&src[offset..offset + row_bytes]);
    }

    Ok(())
}

/// De-interleave the chroma plane of an NV12 image into planar I420.
/// `out` is resized to the I420 frame size.
pub fn nv12_to_i420(nv12: &[u8], width: u32, height: u32, out: &mut Vec<u8>) -> CaptureResult<()> {
    let (w, h) = (width as usize, height as usize);
    let luma = w * h;
    let (cw, ch) = (w / 2, h / 2);
    let chroma = cw * ch;

    // UV rows are `w` bytes apart even when the width is odd
    let uv_pitch = w;
    let needed = luma + ch * uv_pitch;
    if nv12.len() < needed {
        return Err(CaptureError::CaptureFailed(format!(
            "NV12 buffer holds {} bytes, need {}",
            nv12.len(),
            needed
        )));
    }

    out.clear();
    out.resize(frame_size(PixelFormat::I420, width, height), 0);
    out[..luma].copy_from_slice(&nv12[..luma]);

    let (u_plane, v_plane) = out[luma..].split_at_mut(chroma);
    for row in 0..ch {
        let src = &nv12[luma + row * uv_pitch..];
        for col in 0..cw {
            u_plane[row * cw + col] = src[col * 2];
            v_plane[row * cw + col] = src[col * 2 + 1];
        }
    }

    Ok(())
}
