// Copyright (c) 2023 Huawei Technologies Co.,Ltd. All rights reserved.
//
// StratoVirt is licensed under Mulan PSL v2.
// You can use this software according to the terms and conditions of the Mulan
// PSL v2.
// You may obtain a copy of Mulan PSL v2 at:
//         http://license.coscl.org.cn/MulanPSL2
// THIS SOFTWARE IS PROVIDED ON AN "AS IS" BASIS, WITHOUT WARRANTIES OF ANY
// KIND, EITHER EXPRESS OR IMPLIED, INCLUDING BUT NOT LIMITED TO
// NON-INFRINGEMENT, MERCHANTABILITY OR FIT FOR A PARTICULAR PURPOSE.
// See the Mulan PSL v2 for more details.

//! Pixel conversions feeding the planar 4:2:0 output buffers.

use anyhow::{bail, Result};

/// External JPEG decode collaborator. The pipeline does not care whether the
/// implementation is native or hosted.
pub trait MjpegDecoder: Send + Sync {
    /// Decode one JPEG frame into tightly packed planar 4:2:0. The returned
    /// buffer must hold exactly `width * height * 3 / 2` bytes.
    fn decode(&self, jpeg: &[u8], width: u32, height: u32) -> Result<Vec<u8>>;
}

/// Convert packed 4:2:2 (Y0 U Y1 V) into planar 4:2:0 with caller strides.
/// Chroma is averaged over each two-row pair.
pub fn yuy2_to_i420(
    src: &[u8],
    width: usize,
    height: usize,
    dst_y: &mut [u8],
    y_stride: usize,
    dst_u: &mut [u8],
    dst_v: &mut [u8],
    uv_stride: usize,
) -> Result<()> {
    if width == 0 || height == 0 || width % 2 != 0 || height % 2 != 0 {
        bail!("Geometry {}x{} is not 4:2:0 subsampleable", width, height);
    }
    let src_stride = width * 2;
    if src.len() < src_stride * height {
        bail!(
            "Packed source holds {} bytes, {}x{} needs {}",
            src.len(),
            width,
            height,
            src_stride * height
        );
    }
    if y_stride < width || uv_stride < width / 2 {
        bail!("Destination strides {}/{} too small", y_stride, uv_stride);
    }
    if dst_y.len() < y_stride * height
        || dst_u.len() < uv_stride * height / 2
        || dst_v.len() < uv_stride * height / 2
    {
        bail!("Destination planes too small for {}x{}", width, height);
    }

    for row_pair in 0..height / 2 {
        let top = src_stride * row_pair * 2;
        let bottom = top + src_stride;
        for x in 0..width / 2 {
            let group_top = top + x * 4;
            let group_bottom = bottom + x * 4;

            let y_row = y_stride * row_pair * 2;
            dst_y[y_row + x * 2] = src[group_top];
            dst_y[y_row + x * 2 + 1] = src[group_top + 2];
            dst_y[y_row + y_stride + x * 2] = src[group_bottom];
            dst_y[y_row + y_stride + x * 2 + 1] = src[group_bottom + 2];

            let uv_off = uv_stride * row_pair + x;
            dst_u[uv_off] = avg(src[group_top + 1], src[group_bottom + 1]);
            dst_v[uv_off] = avg(src[group_top + 3], src[group_bottom + 3]);
        }
    }
    Ok(())
}

fn avg(a: u8, b: u8) -> u8 {
    ((a as u16 + b as u16 + 1) / 2) as u8
}

/// Split semi-planar 4:2:0 (Y plane, then interleaved chroma pairs) into
/// separate U and V planes. `v_first` selects the NV21 pair order.
pub fn semi_planar_to_i420(
    src: &[u8],
    width: usize,
    height: usize,
    dst_y: &mut [u8],
    y_stride: usize,
    dst_u: &mut [u8],
    dst_v: &mut [u8],
    uv_stride: usize,
    v_first: bool,
) -> Result<()> {
    if width == 0 || height == 0 || width % 2 != 0 || height % 2 != 0 {
        bail!("Geometry {}x{} is not 4:2:0 subsampleable", width, height);
    }
    if src.len() < width * height * 3 / 2 {
        bail!(
            "Semi-planar source holds {} bytes, {}x{} needs {}",
            src.len(),
            width,
            height,
            width * height * 3 / 2
        );
    }
    copy_plane(&src[..width * height], width, dst_y, y_stride, width, height)?;

    if dst_u.len() < uv_stride * height / 2 || dst_v.len() < uv_stride * height / 2 {
        bail!("Destination chroma planes too small for {}x{}", width, height);
    }
    let chroma = &src[width * height..];
    for row in 0..height / 2 {
        for x in 0..width / 2 {
            let pair = row * width + x * 2;
            let (u, v) = if v_first {
                (chroma[pair + 1], chroma[pair])
            } else {
                (chroma[pair], chroma[pair + 1])
            };
            dst_u[row * uv_stride + x] = u;
            dst_v[row * uv_stride + x] = v;
        }
    }
    Ok(())
}

/// Copy one plane row by row between buffers with differing strides.
pub fn copy_plane(
    src: &[u8],
    src_stride: usize,
    dst: &mut [u8],
    dst_stride: usize,
    width: usize,
    height: usize,
) -> Result<()> {
    if src_stride < width || dst_stride < width {
        bail!("Plane strides {}/{} below width {}", src_stride, dst_stride, width);
    }
    if src.len() < src_stride * (height - 1) + width || dst.len() < dst_stride * (height - 1) + width
    {
        bail!("Plane buffers too small for {}x{}", width, height);
    }
    for row in 0..height {
        let s = &src[row * src_stride..row * src_stride + width];
        dst[row * dst_stride..row * dst_stride + width].copy_from_slice(s);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packed_frame(width: usize, height: usize, y: u8, u: u8, v: u8) -> Vec<u8> {
        let mut frame = Vec::with_capacity(width * height * 2);
        for _ in 0..width * height / 2 {
            frame.extend_from_slice(&[y, u, y, v]);
        }
        frame
    }

    #[test]
    fn test_uniform_frame_conversion() {
        let (w, h) = (8, 4);
        let src = packed_frame(w, h, 0x80, 0x40, 0xC0);
        let mut y = vec![0_u8; w * h];
        let mut u = vec![0_u8; w * h / 4];
        let mut v = vec![0_u8; w * h / 4];

        yuy2_to_i420(&src, w, h, &mut y, w, &mut u, &mut v, w / 2).unwrap();

        assert!(y.iter().all(|&b| b == 0x80));
        assert!(u.iter().all(|&b| b == 0x40));
        assert!(v.iter().all(|&b| b == 0xC0));
    }

    #[test]
    fn test_luma_positions_preserved() {
        // Two 2x2 blocks with distinct luma per pixel.
        let (w, h) = (4, 2);
        let src = vec![
            10, 0x40, 11, 0xC0, 12, 0x40, 13, 0xC0, // row 0
            20, 0x42, 21, 0xC2, 22, 0x42, 23, 0xC2, // row 1
        ];
        let mut y = vec![0_u8; w * h];
        let mut u = vec![0_u8; 2];
        let mut v = vec![0_u8; 2];

        yuy2_to_i420(&src, w, h, &mut y, w, &mut u, &mut v, 2).unwrap();

        assert_eq!(y, vec![10, 11, 12, 13, 20, 21, 22, 23]);
        // Chroma averages the two rows.
        assert_eq!(u, vec![0x41, 0x41]);
        assert_eq!(v, vec![0xC1, 0xC1]);
    }

    #[test]
    fn test_strided_destination() {
        let (w, h) = (4, 2);
        let src = packed_frame(w, h, 0x11, 0x22, 0x33);
        let y_stride = 8;
        let uv_stride = 4;
        let mut y = vec![0xFF_u8; y_stride * h];
        let mut u = vec![0xFF_u8; uv_stride * h / 2];
        let mut v = vec![0xFF_u8; uv_stride * h / 2];

        yuy2_to_i420(&src, w, h, &mut y, y_stride, &mut u, &mut v, uv_stride).unwrap();

        for row in 0..h {
            assert!(y[row * y_stride..row * y_stride + w].iter().all(|&b| b == 0x11));
            // Padding beyond the width is untouched.
            assert!(y[row * y_stride + w..(row + 1) * y_stride]
                .iter()
                .all(|&b| b == 0xFF));
        }
        assert!(u[..w / 2].iter().all(|&b| b == 0x22));
        assert!(v[..w / 2].iter().all(|&b| b == 0x33));
    }

    #[test]
    fn test_short_source_rejected() {
        let mut y = vec![0_u8; 16];
        let mut u = vec![0_u8; 4];
        let mut v = vec![0_u8; 4];
        assert!(yuy2_to_i420(&[0_u8; 10], 4, 4, &mut y, 4, &mut u, &mut v, 2).is_err());
        assert!(yuy2_to_i420(&[0_u8; 64], 3, 4, &mut y, 4, &mut u, &mut v, 2).is_err());
    }

    #[test]
    fn test_semi_planar_split() {
        let (w, h) = (4, 2);
        let mut src = vec![0x11_u8; w * h]; // Y
        src.extend_from_slice(&[0x22, 0x33, 0x22, 0x33]); // UVUV
        let mut y = vec![0_u8; w * h];
        let mut u = vec![0_u8; 2];
        let mut v = vec![0_u8; 2];

        semi_planar_to_i420(&src, w, h, &mut y, w, &mut u, &mut v, 2, false).unwrap();
        assert!(y.iter().all(|&b| b == 0x11));
        assert_eq!(u, vec![0x22, 0x22]);
        assert_eq!(v, vec![0x33, 0x33]);

        // NV21 swaps the pair order.
        semi_planar_to_i420(&src, w, h, &mut y, w, &mut u, &mut v, 2, true).unwrap();
        assert_eq!(u, vec![0x33, 0x33]);
        assert_eq!(v, vec![0x22, 0x22]);
    }

    #[test]
    fn test_copy_plane_strides() {
        let src = vec![1_u8, 2, 3, 0, 4, 5, 6, 0]; // 3x2 with stride 4
        let mut dst = vec![0_u8; 12]; // stride 6
        copy_plane(&src, 4, &mut dst, 6, 3, 2).unwrap();
        assert_eq!(&dst[..3], &[1, 2, 3]);
        assert_eq!(&dst[6..9], &[4, 5, 6]);
    }
}
