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

//! Pixel format model shared by the device nodes and the capture pipeline.

use anyhow::{bail, Context, Result};

#[macro_export]
macro_rules! video_fourcc {
    ($a:expr, $b:expr, $c:expr, $d:expr) => {
        $a as u32 | (($b as u32) << 8) | (($c as u32) << 16) | (($d as u32) << 24)
    };
}

pub const PIXFMT_YUYV: u32 = video_fourcc!('Y', 'U', 'Y', 'V');
pub const PIXFMT_MJPG: u32 = video_fourcc!('M', 'J', 'P', 'G');
pub const PIXFMT_NV12: u32 = video_fourcc!('N', 'V', '1', '2');
pub const PIXFMT_NV21: u32 = video_fourcc!('N', 'V', '2', '1');
pub const PIXFMT_YU12: u32 = video_fourcc!('Y', 'U', '1', '2');

/// Source pixel layouts the capture nodes can produce.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Default)]
pub enum FourccFormat {
    /// Packed 4:2:2, Y0 U Y1 V.
    #[default]
    Yuy2,
    /// Motion JPEG, one JPEG image per frame.
    Mjpg,
    /// Semi-planar 4:2:0, Y plane then interleaved UV.
    Nv12,
    /// Semi-planar 4:2:0, Y plane then interleaved VU.
    Nv21,
    /// Planar 4:2:0, Y then U then V planes.
    Yuv420,
}

impl FourccFormat {
    pub fn from_v4l2(pixelformat: u32) -> Option<Self> {
        match pixelformat {
            PIXFMT_YUYV => Some(FourccFormat::Yuy2),
            PIXFMT_MJPG => Some(FourccFormat::Mjpg),
            PIXFMT_NV12 => Some(FourccFormat::Nv12),
            PIXFMT_NV21 => Some(FourccFormat::Nv21),
            PIXFMT_YU12 => Some(FourccFormat::Yuv420),
            _ => None,
        }
    }

    pub fn to_v4l2(self) -> u32 {
        match self {
            FourccFormat::Yuy2 => PIXFMT_YUYV,
            FourccFormat::Mjpg => PIXFMT_MJPG,
            FourccFormat::Nv12 => PIXFMT_NV12,
            FourccFormat::Nv21 => PIXFMT_NV21,
            FourccFormat::Yuv420 => PIXFMT_YU12,
        }
    }

}

/// Output formats advertised to the framework.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub enum HalPixelFormat {
    /// Interleaved 4:2:2, backed directly by YUY2 nodes.
    YCbCr422I,
    /// Framework-flexible planar 4:2:0.
    YCbCr420Flex,
    /// Semi-planar 4:2:0 with VU chroma order.
    YCrCb420Sp,
    /// Opaque byte container carrying one JPEG image.
    Blob,
}

/// The HAL format a source layout maps to without any conversion.
pub fn direct_hal_format(format: FourccFormat) -> Option<HalPixelFormat> {
    match format {
        FourccFormat::Yuy2 => Some(HalPixelFormat::YCbCr422I),
        FourccFormat::Nv12 | FourccFormat::Yuv420 => Some(HalPixelFormat::YCbCr420Flex),
        FourccFormat::Nv21 => Some(HalPixelFormat::YCrCb420Sp),
        FourccFormat::Mjpg => None,
    }
}

/// Byte length of a tightly packed planar 4:2:0 frame.
pub fn planar_420_size(width: u32, height: u32) -> Result<usize> {
    let pixel_size = width
        .checked_mul(height)
        .with_context(|| format!("Invalid width {} or height {}", width, height))?;
    if width % 2 != 0 || height % 2 != 0 {
        bail!("Abnormal width {} or height {}", width, height);
    }
    // 4 Y values share one U and one V value, 1.5 bytes per pixel on average.
    Ok(pixel_size as usize * 3 / 2)
}

/// Byte length of a tightly packed 4:2:2 frame.
pub fn packed_422_size(width: u32, height: u32) -> Result<usize> {
    let pixel_size = width
        .checked_mul(height)
        .with_context(|| format!("Invalid width {} or height {}", width, height))?;
    if width % 2 != 0 {
        bail!("Abnormal width {} for packed 4:2:2", width);
    }
    Ok(pixel_size as usize * 2)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fourcc_round_trip() {
        for fmt in [
            FourccFormat::Yuy2,
            FourccFormat::Mjpg,
            FourccFormat::Nv12,
            FourccFormat::Nv21,
            FourccFormat::Yuv420,
        ] {
            assert_eq!(FourccFormat::from_v4l2(fmt.to_v4l2()), Some(fmt));
        }
        assert_eq!(FourccFormat::from_v4l2(0), None);
    }

    #[test]
    fn test_direct_mapping() {
        assert_eq!(
            direct_hal_format(FourccFormat::Yuy2),
            Some(HalPixelFormat::YCbCr422I)
        );
        assert_eq!(
            direct_hal_format(FourccFormat::Nv12),
            Some(HalPixelFormat::YCbCr420Flex)
        );
        assert_eq!(
            direct_hal_format(FourccFormat::Nv21),
            Some(HalPixelFormat::YCrCb420Sp)
        );
        assert_eq!(direct_hal_format(FourccFormat::Mjpg), None);
    }

    #[test]
    fn test_frame_sizes() {
        assert_eq!(planar_420_size(1280, 720).unwrap(), 1280 * 720 * 3 / 2);
        assert_eq!(packed_422_size(640, 480).unwrap(), 640 * 480 * 2);
        assert!(planar_420_size(641, 480).is_err());
        assert!(packed_422_size(641, 480).is_err());
    }
}
