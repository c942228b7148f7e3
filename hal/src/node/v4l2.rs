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

//! Kernel-backed device node. /dev/videoX and VIDIOC_XX ioctls are used.

use anyhow::{bail, Context, Result};
use log::{info, warn};
use v4l2_sys_mit::{
    v4l2_buf_type_V4L2_BUF_TYPE_VIDEO_CAPTURE, v4l2_field_V4L2_FIELD_NONE, v4l2_fmtdesc,
    v4l2_format, v4l2_frmivalenum, v4l2_frmsizeenum,
    v4l2_frmsizetypes_V4L2_FRMSIZE_TYPE_DISCRETE, v4l2_streamparm, V4L2_CAP_STREAMING,
    V4L2_CAP_VIDEO_CAPTURE, V4L2_FMT_FLAG_EMULATED,
};

use super::{
    BufferArena, DequeueEvent, DeviceNode, FormatEntry, NodeCapabilities, SourceFrame,
};
use crate::format::FourccFormat;
use util::v4l2::{fixed_cstr_to_string, new_init, V4l2Backend};

const ENUM_LIMIT: u32 = 1000;

pub struct V4l2DeviceNode {
    backend: V4l2Backend,
    arena: BufferArena,
    streaming: bool,
}

impl V4l2DeviceNode {
    pub fn new(path: &str) -> Result<Self> {
        let backend = V4l2Backend::new(path.to_string())?;
        let node = V4l2DeviceNode {
            backend,
            arena: BufferArena::default(),
            streaming: false,
        };
        node.check_cap()?;
        Ok(node)
    }

    pub fn path(&self) -> &str {
        self.backend.path()
    }

    fn check_cap(&self) -> Result<()> {
        let cap = self.backend.query_cap()?;
        if cap.capabilities & V4L2_CAP_VIDEO_CAPTURE != V4L2_CAP_VIDEO_CAPTURE {
            bail!(
                "Device {} does not support the single-planar capture capability {:#x}",
                self.backend.path(),
                cap.capabilities
            );
        }
        if cap.capabilities & V4L2_CAP_STREAMING != V4L2_CAP_STREAMING {
            bail!(
                "Device {} does not support streaming I/O {:#x}",
                self.backend.path(),
                cap.capabilities
            );
        }
        Ok(())
    }

    fn list_frame_sizes(&self, pixelformat: u32) -> Result<Vec<(u32, u32)>> {
        let mut list = Vec::new();
        let mut frmsize = new_init::<v4l2_frmsizeenum>();
        frmsize.pixel_format = pixelformat;
        for i in 0..ENUM_LIMIT {
            frmsize.index = i;
            if self.backend.enum_frame_size(&mut frmsize)? {
                break;
            }
            // NOTE: Only discrete sizes are supported now.
            if frmsize.type_ != v4l2_frmsizetypes_V4L2_FRMSIZE_TYPE_DISCRETE {
                continue;
            }
            // SAFETY: type_ was checked to be discrete, so reading the
            // discrete arm of the union is defined.
            let width = unsafe { frmsize.__bindgen_anon_1.discrete.width };
            // SAFETY: The reason is the same as above.
            let height = unsafe { frmsize.__bindgen_anon_1.discrete.height };
            list.push((width, height));
        }
        Ok(list)
    }

    fn list_frame_rates(&self, pixelformat: u32, width: u32, height: u32) -> Result<Vec<f32>> {
        let mut list = Vec::new();
        let mut frame_val = new_init::<v4l2_frmivalenum>();
        frame_val.pixel_format = pixelformat;
        frame_val.width = width;
        frame_val.height = height;
        for i in 0..ENUM_LIMIT {
            frame_val.index = i;
            if self.backend.enum_frame_interval(&mut frame_val)? {
                break;
            }
            // NOTE: Only discrete intervals are supported now.
            if frame_val.type_ != v4l2_frmsizetypes_V4L2_FRMSIZE_TYPE_DISCRETE {
                continue;
            }
            // SAFETY: type_ was checked to be discrete, so reading the
            // discrete arm of the union is defined.
            let numerator = unsafe { frame_val.__bindgen_anon_1.discrete.numerator };
            // SAFETY: The reason is the same as above.
            let denominator = unsafe { frame_val.__bindgen_anon_1.discrete.denominator };
            if numerator == 0 {
                warn!(
                    "Invalid interval numerator, format {} width {} height {}",
                    frame_val.pixel_format, frame_val.width, frame_val.height
                );
                continue;
            }
            // The kernel reports fractional frame intervals; invert to fps.
            list.push(denominator as f32 / numerator as f32);
        }
        Ok(list)
    }
}

impl DeviceNode for V4l2DeviceNode {
    fn query_capabilities(&self) -> Result<NodeCapabilities> {
        let cap = self.backend.query_cap()?;
        Ok(NodeCapabilities {
            card: fixed_cstr_to_string(&cap.card),
            bus_info: fixed_cstr_to_string(&cap.bus_info),
            driver_caps: cap.capabilities,
        })
    }

    fn enumerate_formats(&mut self) -> Result<Vec<FormatEntry>> {
        let mut list = Vec::new();
        let mut desc = new_init::<v4l2_fmtdesc>();
        desc.type_ = v4l2_buf_type_V4L2_BUF_TYPE_VIDEO_CAPTURE;
        for i in 0..ENUM_LIMIT {
            desc.index = i;
            if self.backend.enum_format(&mut desc)? {
                break;
            }
            if desc.flags & V4L2_FMT_FLAG_EMULATED != 0 {
                continue;
            }
            let format = match FourccFormat::from_v4l2(desc.pixelformat) {
                Some(f) => f,
                None => continue,
            };
            for (width, height) in self.list_frame_sizes(desc.pixelformat)? {
                let frame_rates = self.list_frame_rates(desc.pixelformat, width, height)?;
                if frame_rates.is_empty() {
                    continue;
                }
                list.push(FormatEntry {
                    format,
                    width,
                    height,
                    frame_rates,
                });
            }
        }
        Ok(list)
    }

    fn set_format(&mut self, format: FourccFormat, width: u32, height: u32) -> Result<()> {
        info!(
            "Camera node {} set format {:?} {}x{}",
            self.backend.path(),
            format,
            width,
            height
        );
        let mut fmt = new_init::<v4l2_format>();
        fmt.type_ = v4l2_buf_type_V4L2_BUF_TYPE_VIDEO_CAPTURE;
        fmt.fmt.pix.width = width;
        fmt.fmt.pix.height = height;
        fmt.fmt.pix.pixelformat = format.to_v4l2();
        fmt.fmt.pix.field = v4l2_field_V4L2_FIELD_NONE;
        self.backend.set_format(&mut fmt)?;

        // SAFETY: type_ selects the single-planar pix arm of the union.
        let granted = unsafe { (fmt.fmt.pix.pixelformat, fmt.fmt.pix.width, fmt.fmt.pix.height) };
        if granted != (format.to_v4l2(), width, height) {
            bail!(
                "Node {} substituted format {:#x} {}x{} for requested {:?} {}x{}",
                self.backend.path(),
                granted.0,
                granted.1,
                granted.2,
                format,
                width,
                height
            );
        }
        Ok(())
    }

    fn set_frame_interval(&mut self, fps: f32) -> Result<bool> {
        if fps <= 0.0 {
            bail!("Invalid fps {}", fps);
        }
        let mut parm = new_init::<v4l2_streamparm>();
        parm.type_ = v4l2_buf_type_V4L2_BUF_TYPE_VIDEO_CAPTURE;
        // SAFETY: type_ selects the capture arm of the parm union.
        unsafe {
            parm.parm.capture.timeperframe.numerator = 100;
            parm.parm.capture.timeperframe.denominator = (fps * 100.0) as u32;
        }
        match self.backend.set_stream_parameter(&parm) {
            Ok(()) => Ok(true),
            Err(e) => {
                // A node without timing support is not a fatal condition.
                warn!(
                    "Node {} did not take frame interval for {} fps: {:?}",
                    self.backend.path(),
                    fps,
                    e
                );
                Ok(false)
            }
        }
    }

    fn get_control(&self, id: u32) -> Result<i32> {
        self.backend.get_control(id)
    }

    fn set_control(&mut self, id: u32, value: i32) -> Result<()> {
        self.backend.set_control(id, value)
    }

    fn request_buffers(&mut self, count: u32) -> Result<()> {
        self.backend.request_buffers(count)?;
        self.arena = BufferArena::new(count as usize);
        Ok(())
    }

    fn map_buffers(&mut self) -> Result<()> {
        self.backend.map_buffers()
    }

    fn queue_buffer(&mut self, index: u32) -> Result<()> {
        self.arena.mark_queued(index)?;
        self.backend.queue_buffer(index)
    }

    fn dequeue_buffer(&mut self, timeout_ms: u32) -> Result<DequeueEvent> {
        if !self.backend.wait_readable(timeout_ms as i32)? {
            return Ok(DequeueEvent::TimedOut);
        }
        match self.backend.dequeue_buffer()? {
            Some(buf) => {
                self.arena.mark_dequeued(buf.index)?;
                Ok(DequeueEvent::Frame(SourceFrame {
                    index: buf.index,
                    sequence: buf.sequence,
                    bytes_used: buf.bytes_used,
                    timestamp_ns: buf.timestamp_ns,
                }))
            }
            // The readiness report can be stale; treat it like a timeout
            // and let the caller re-arm the wait.
            None => Ok(DequeueEvent::TimedOut),
        }
    }

    fn frame_bytes(&self, index: u32, len: usize) -> Result<&[u8]> {
        let mapping = self
            .backend
            .mapped_buffer(index as usize)
            .with_context(|| format!("Buffer {} is not mapped", index))?;
        if len as u64 > mapping.len {
            bail!(
                "Frame length {} exceeds mapping length {} for buffer {}",
                len,
                mapping.len,
                index
            );
        }
        // SAFETY: the mapping stays valid until the pool is released, which
        // requires exclusive access to this node.
        Ok(unsafe { std::slice::from_raw_parts(mapping.addr as *const u8, len) })
    }

    fn stream_on(&mut self) -> Result<()> {
        if self.streaming {
            return Ok(());
        }
        info!("Camera node {} stream on", self.backend.path());
        self.backend.stream_on()?;
        self.streaming = true;
        Ok(())
    }

    fn stream_off(&mut self) -> Result<()> {
        if !self.streaming {
            return Ok(());
        }
        info!("Camera node {} stream off", self.backend.path());
        self.backend.stream_off()?;
        self.arena.release_kernel_owned();
        self.streaming = false;
        Ok(())
    }

    fn idle_buffers(&self) -> Vec<u32> {
        self.arena.idle_indices()
    }

    fn buffer_count(&self) -> usize {
        self.arena.len()
    }
}
