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

//! Stream descriptors and the session-owned ring of planar output buffers.

use anyhow::{bail, Context, Result};

use crate::convert::copy_plane;
use crate::format::HalPixelFormat;

pub const USAGE_CPU_WRITE: u64 = 1 << 0;
pub const USAGE_CAMERA_WRITE: u64 = 1 << 1;

/// Row strides are rounded up to this many bytes, matching what common
/// allocators hand out.
const STRIDE_ALIGN: usize = 64;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamDirection {
    Output,
    Input,
}

/// A stream as requested by the framework.
#[derive(Clone, Debug)]
pub struct StreamDescriptor {
    pub stream_id: i32,
    pub direction: StreamDirection,
    pub width: u32,
    pub height: u32,
    pub pixel_format: HalPixelFormat,
    pub dataspace: i32,
    pub usage: u64,
    pub max_buffers: u32,
}

/// Per-stream answer handed back from stream configuration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HalStreamInfo {
    pub stream_id: i32,
    pub override_format: HalPixelFormat,
    pub producer_usage: u64,
    pub max_buffers: u32,
    pub dataspace: i32,
}

/// Opaque reference to one output ring slot. The generation ties a handle to
/// one configuration epoch so stale handles cannot alias a newer ring.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BufferHandle {
    index: u32,
    generation: u64,
}

impl BufferHandle {
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

/// One planar 4:2:0 output image.
///
/// The plane layout is one contiguous allocation, Y plane first, then U and
/// V. Consumers that require separately allocated planes are not supported
/// by this pool.
#[derive(Debug)]
pub struct OutputImage {
    width: u32,
    height: u32,
    stride_y: usize,
    stride_uv: usize,
    data: Vec<u8>,
}

fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) / align * align
}

impl OutputImage {
    pub fn new(width: u32, height: u32) -> Result<Self> {
        if width == 0 || height == 0 || width % 2 != 0 || height % 2 != 0 {
            bail!("Geometry {}x{} is not 4:2:0 representable", width, height);
        }
        let stride_y = align_up(width as usize, STRIDE_ALIGN);
        let stride_uv = align_up(width as usize / 2, STRIDE_ALIGN);
        let len = stride_y * height as usize + stride_uv * height as usize;
        Ok(OutputImage {
            width,
            height,
            stride_y,
            stride_uv,
            data: vec![0; len],
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn stride_y(&self) -> usize {
        self.stride_y
    }

    pub fn stride_uv(&self) -> usize {
        self.stride_uv
    }

    fn y_len(&self) -> usize {
        self.stride_y * self.height as usize
    }

    fn uv_len(&self) -> usize {
        self.stride_uv * self.height as usize / 2
    }

    pub fn y_plane(&self) -> &[u8] {
        &self.data[..self.y_len()]
    }

    pub fn u_plane(&self) -> &[u8] {
        &self.data[self.y_len()..self.y_len() + self.uv_len()]
    }

    pub fn v_plane(&self) -> &[u8] {
        &self.data[self.y_len() + self.uv_len()..self.y_len() + 2 * self.uv_len()]
    }

    /// Mutable views of the Y, U and V planes.
    pub fn planes_mut(&mut self) -> (&mut [u8], &mut [u8], &mut [u8]) {
        let y_len = self.y_len();
        let uv_len = self.uv_len();
        let (y, rest) = self.data.split_at_mut(y_len);
        let (u, rest) = rest.split_at_mut(uv_len);
        (y, u, &mut rest[..uv_len])
    }

    /// Fill the image from a tightly packed planar 4:2:0 buffer of exactly
    /// width * height * 3 / 2 bytes.
    pub fn fill_from_i420(&mut self, src: &[u8]) -> Result<()> {
        let width = self.width as usize;
        let height = self.height as usize;
        let expected = width * height * 3 / 2;
        if src.len() != expected {
            bail!(
                "Planar source holds {} bytes, expected {}",
                src.len(),
                expected
            );
        }
        let stride_y = self.stride_y;
        let stride_uv = self.stride_uv;
        let (y, u, v) = self.planes_mut();
        copy_plane(&src[..width * height], width, y, stride_y, width, height)?;
        let chroma = width * height / 4;
        copy_plane(
            &src[width * height..width * height + chroma],
            width / 2,
            u,
            stride_uv,
            width / 2,
            height / 2,
        )?;
        copy_plane(
            &src[width * height + chroma..],
            width / 2,
            v,
            stride_uv,
            width / 2,
            height / 2,
        )?;
        Ok(())
    }
}

/// Pool of output images rotated by the session worker. A slot is vacated
/// while its image is taken out for conversion, so every access goes through
/// the slot index instead of a raw pointer.
pub struct OutputBufferRing {
    slots: Vec<Option<Box<OutputImage>>>,
    next: usize,
    generation: u64,
}

impl OutputBufferRing {
    pub fn new(count: u32, width: u32, height: u32, generation: u64) -> Result<Self> {
        if count == 0 {
            bail!("Output ring needs at least one slot");
        }
        let mut slots = Vec::with_capacity(count as usize);
        for _ in 0..count {
            slots.push(Some(Box::new(OutputImage::new(width, height)?)));
        }
        Ok(OutputBufferRing {
            slots,
            next: 0,
            generation,
        })
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Take the next slot's image out of the ring, or None when the slot is
    /// still out for conversion.
    pub fn try_acquire(&mut self) -> Option<(BufferHandle, Box<OutputImage>)> {
        let index = self.next;
        let image = self.slots[index].take()?;
        self.next = (self.next + 1) % self.slots.len();
        Some((
            BufferHandle {
                index: index as u32,
                generation: self.generation,
            },
            image,
        ))
    }

    /// Return a taken image to its slot.
    pub fn restore(&mut self, handle: BufferHandle, image: Box<OutputImage>) -> Result<()> {
        if handle.generation != self.generation {
            bail!("Buffer handle from configuration epoch {}", handle.generation);
        }
        let slot = self
            .slots
            .get_mut(handle.index as usize)
            .with_context(|| format!("Ring slot {} out of range", handle.index))?;
        if slot.is_some() {
            bail!("Ring slot {} is already occupied", handle.index);
        }
        *slot = Some(image);
        Ok(())
    }

    /// Read access to a resident slot image.
    pub fn image(&self, handle: BufferHandle) -> Result<&OutputImage> {
        if handle.generation != self.generation {
            bail!("Buffer handle from configuration epoch {}", handle.generation);
        }
        self.slots
            .get(handle.index as usize)
            .and_then(|s| s.as_deref())
            .with_context(|| format!("Ring slot {} is not resident", handle.index))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_layout() {
        let image = OutputImage::new(100, 50).unwrap();
        assert_eq!(image.stride_y(), 128);
        assert_eq!(image.stride_uv(), 64);
        assert_eq!(image.y_plane().len(), 128 * 50);
        assert_eq!(image.u_plane().len(), 64 * 25);
        assert_eq!(image.v_plane().len(), 64 * 25);
        assert!(OutputImage::new(101, 50).is_err());
    }

    #[test]
    fn test_fill_from_i420() {
        let mut image = OutputImage::new(4, 2).unwrap();
        let mut src = vec![0x10_u8; 8];
        src.extend_from_slice(&[0x20, 0x20]); // U
        src.extend_from_slice(&[0x30, 0x30]); // V
        image.fill_from_i420(&src).unwrap();

        assert!(image.y_plane()[..4].iter().all(|&b| b == 0x10));
        assert!(image.u_plane()[..2].iter().all(|&b| b == 0x20));
        assert!(image.v_plane()[..2].iter().all(|&b| b == 0x30));

        // Wrong source length is rejected.
        assert!(image.fill_from_i420(&[0_u8; 10]).is_err());
    }

    #[test]
    fn test_ring_rotation() {
        let mut ring = OutputBufferRing::new(3, 4, 2, 7).unwrap();
        let (h0, img0) = ring.try_acquire().unwrap();
        let (h1, img1) = ring.try_acquire().unwrap();
        assert_eq!(h0.index(), 0);
        assert_eq!(h1.index(), 1);
        assert_eq!(h0.generation(), 7);

        ring.restore(h0, img0).unwrap();
        ring.restore(h1, img1).unwrap();

        // Rotation continues where it left off.
        let (h2, img2) = ring.try_acquire().unwrap();
        assert_eq!(h2.index(), 2);
        ring.restore(h2, img2).unwrap();
    }

    #[test]
    fn test_ring_slot_exhaustion() {
        let mut ring = OutputBufferRing::new(1, 4, 2, 0).unwrap();
        let (handle, image) = ring.try_acquire().unwrap();
        assert!(ring.try_acquire().is_none());
        ring.restore(handle, image).unwrap();
        assert!(ring.try_acquire().is_some());
    }

    #[test]
    fn test_ring_rejects_stale_generation() {
        let mut old_ring = OutputBufferRing::new(1, 4, 2, 0).unwrap();
        let (stale, image) = old_ring.try_acquire().unwrap();
        old_ring.restore(stale, image).unwrap();

        let new_ring = OutputBufferRing::new(1, 4, 2, 1).unwrap();
        assert!(new_ring.image(stale).is_err());
    }
}
