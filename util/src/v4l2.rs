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

//! Typed wrappers over the V4L2 single-planar capture ABI. /dev/videoX and
//! VIDIOC_XX ioctls are used.

use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::os::raw::{c_int, c_ulong};
use std::os::unix::prelude::{AsRawFd, OpenOptionsExt, RawFd};
use std::sync::Mutex;

use anyhow::{bail, Context, Result};
use log::{debug, error};
use v4l2_sys_mit::{
    v4l2_buf_type_V4L2_BUF_TYPE_VIDEO_CAPTURE, v4l2_buffer, v4l2_capability, v4l2_control,
    v4l2_fmtdesc, v4l2_format, v4l2_frmivalenum, v4l2_frmsizeenum, v4l2_memory_V4L2_MEMORY_MMAP,
    v4l2_requestbuffers, v4l2_streamparm,
};
use vmm_sys_util::ioctl::{ioctl_with_mut_ref, ioctl_with_ref};
use vmm_sys_util::{ioctl_ioc_nr, ioctl_ior_nr, ioctl_iow_nr, ioctl_iowr_nr};

const VIDEO: u32 = 86;

ioctl_ior_nr!(VIDIOC_QUERYCAP, VIDEO, 0, v4l2_capability);
ioctl_iowr_nr!(VIDIOC_ENUM_FMT, VIDEO, 2, v4l2_fmtdesc);
ioctl_iowr_nr!(VIDIOC_G_FMT, VIDEO, 4, v4l2_format);
ioctl_iowr_nr!(VIDIOC_S_FMT, VIDEO, 5, v4l2_format);
ioctl_iowr_nr!(VIDIOC_REQBUFS, VIDEO, 8, v4l2_requestbuffers);
ioctl_iowr_nr!(VIDIOC_QUERYBUF, VIDEO, 9, v4l2_buffer);
ioctl_iowr_nr!(VIDIOC_QBUF, VIDEO, 15, v4l2_buffer);
ioctl_iowr_nr!(VIDIOC_DQBUF, VIDEO, 17, v4l2_buffer);
ioctl_iow_nr!(VIDIOC_STREAMON, VIDEO, 18, c_int);
ioctl_iow_nr!(VIDIOC_STREAMOFF, VIDEO, 19, c_int);
ioctl_iowr_nr!(VIDIOC_S_PARM, VIDEO, 22, v4l2_streamparm);
ioctl_iowr_nr!(VIDIOC_G_CTRL, VIDEO, 27, v4l2_control);
ioctl_iowr_nr!(VIDIOC_S_CTRL, VIDEO, 28, v4l2_control);
ioctl_iowr_nr!(VIDIOC_ENUM_FRAMESIZES, VIDEO, 74, v4l2_frmsizeenum);
ioctl_iowr_nr!(VIDIOC_ENUM_FRAMEINTERVALS, VIDEO, 75, v4l2_frmivalenum);

/// One memory mapped capture buffer.
#[derive(Clone, Copy, Default)]
pub struct MappedBuffer {
    /// Mapping address in this process.
    pub addr: u64,
    /// Mapping length in bytes.
    pub len: u64,
}

impl MappedBuffer {
    fn is_mapped(&self) -> bool {
        self.addr != 0
    }
}

/// A filled frame handed back by VIDIOC_DQBUF.
#[derive(Clone, Copy, Debug, Default)]
pub struct DequeuedBuffer {
    pub index: u32,
    pub sequence: u32,
    pub bytes_used: u32,
    /// Driver timestamp converted to monotonic nanoseconds.
    pub timestamp_ns: u64,
}

pub struct V4l2Backend {
    /// V4L2 backend path, such as /dev/video0.
    path: String,
    /// V4L2 backend device fd.
    fd: File,
    /// Mappings of the kernel capture buffers, indexed by buffer index.
    buffers: Mutex<Vec<MappedBuffer>>,
}

impl Drop for V4l2Backend {
    fn drop(&mut self) {
        debug!("Drop v4l2 backend fd {}", self.as_raw_fd());
        if let Err(e) = self.release_buffers() {
            error!("Failed to release buffers for {}, {:?}", self.path, e);
        }
    }
}

impl V4l2Backend {
    pub fn new(path: String) -> Result<Self> {
        let fd = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_CLOEXEC | libc::O_NONBLOCK)
            .open(&path)
            .with_context(|| format!("Failed to open v4l2 backend {}.", &path))?;
        Ok(Self {
            path,
            fd,
            buffers: Mutex::new(Vec::new()),
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Run an ioctl that reads `arg`, retrying on EINTR.
    fn xioctl_ref<T>(&self, req: c_ulong, arg: &T) -> std::io::Result<()> {
        loop {
            // SAFETY: self.fd is created in function new() and arg outlives the call.
            let ret = unsafe { ioctl_with_ref(self, req, arg) };
            if ret >= 0 {
                return Ok(());
            }
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            return Err(err);
        }
    }

    /// Run an ioctl that fills `arg`, retrying on EINTR.
    fn xioctl_mut_ref<T>(&self, req: c_ulong, arg: &mut T) -> std::io::Result<()> {
        loop {
            // SAFETY: self.fd is created in function new() and arg outlives the call.
            let ret = unsafe { ioctl_with_mut_ref(self, req, arg) };
            if ret >= 0 {
                return Ok(());
            }
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            return Err(err);
        }
    }

    pub fn query_cap(&self) -> Result<v4l2_capability> {
        let mut cap = new_init::<v4l2_capability>();
        self.xioctl_mut_ref(VIDIOC_QUERYCAP(), &mut cap)
            .with_context(|| format!("Failed to query capability for {}", self.path))?;
        Ok(cap)
    }

    /// Commit a format. The kernel writes the format it actually granted
    /// back into `fmt`.
    pub fn set_format(&self, fmt: &mut v4l2_format) -> Result<()> {
        self.xioctl_mut_ref(VIDIOC_S_FMT(), fmt)
            .with_context(|| format!("Failed to set format for {}", self.path))
    }

    pub fn get_format(&self, fmt: &mut v4l2_format) -> Result<()> {
        self.xioctl_mut_ref(VIDIOC_G_FMT(), fmt)
            .with_context(|| format!("Failed to get format for {}", self.path))
    }

    pub fn set_stream_parameter(&self, parm: &v4l2_streamparm) -> Result<()> {
        self.xioctl_ref(VIDIOC_S_PARM(), parm)
            .with_context(|| format!("Failed to set stream parameter for {}", self.path))
    }

    pub fn get_control(&self, id: u32) -> Result<i32> {
        let mut ctrl = new_init::<v4l2_control>();
        ctrl.id = id;
        self.xioctl_mut_ref(VIDIOC_G_CTRL(), &mut ctrl)
            .with_context(|| format!("Failed to get control {:#x} for {}", id, self.path))?;
        Ok(ctrl.value)
    }

    pub fn set_control(&self, id: u32, value: i32) -> Result<()> {
        let mut ctrl = new_init::<v4l2_control>();
        ctrl.id = id;
        ctrl.value = value;
        self.xioctl_ref(VIDIOC_S_CTRL(), &ctrl)
            .with_context(|| format!("Failed to set control {:#x} for {}", id, self.path))
    }

    /// Ask the kernel for `count` MMAP capture buffers. A count of zero
    /// releases the pool and drops all mappings.
    pub fn request_buffers(&self, count: u32) -> Result<()> {
        if count == 0 {
            return self.release_buffers();
        }
        // Stale mappings must not survive a new pool.
        self.unmap_buffers()?;

        let mut bufs = new_init::<v4l2_requestbuffers>();
        bufs.type_ = v4l2_buf_type_V4L2_BUF_TYPE_VIDEO_CAPTURE;
        bufs.memory = v4l2_memory_V4L2_MEMORY_MMAP;
        bufs.count = count;
        self.xioctl_mut_ref(VIDIOC_REQBUFS(), &mut bufs)
            .with_context(|| format!("Failed to request {} buffers for {}", count, self.path))?;
        if bufs.count != count {
            bail!(
                "Kernel granted {} buffers instead of {} for {}",
                bufs.count,
                count,
                self.path
            );
        }

        let mut locked_buf = self.buffers.lock().unwrap();
        locked_buf.clear();
        locked_buf.resize(count as usize, MappedBuffer::default());
        Ok(())
    }

    /// Memory map every requested buffer into this process.
    pub fn map_buffers(&self) -> Result<()> {
        let mut locked_buf = self.buffers.lock().unwrap();
        for (i, mapping) in locked_buf.iter_mut().enumerate() {
            let mut buf = new_init::<v4l2_buffer>();
            buf.index = i as u32;
            buf.type_ = v4l2_buf_type_V4L2_BUF_TYPE_VIDEO_CAPTURE;
            buf.memory = v4l2_memory_V4L2_MEMORY_MMAP;
            self.xioctl_mut_ref(VIDIOC_QUERYBUF(), &mut buf)
                .with_context(|| format!("Failed to query buffer {} for {}", i, self.path))?;

            // SAFETY:
            // 1. self.fd is created in function new().
            // 2. buf.length and buf.m.offset are filled by VIDIOC_QUERYBUF.
            let ret = unsafe {
                libc::mmap(
                    std::ptr::null_mut() as *mut libc::c_void,
                    buf.length as libc::size_t,
                    libc::PROT_WRITE | libc::PROT_READ,
                    libc::MAP_SHARED,
                    self.as_raw_fd(),
                    buf.m.offset.into(),
                )
            };
            if ret == libc::MAP_FAILED {
                bail!(
                    "Failed to mmap buffer {} for {}, error {:?}",
                    i,
                    self.path,
                    std::io::Error::last_os_error()
                );
            }
            mapping.addr = ret as u64;
            mapping.len = buf.length as u64;
        }
        Ok(())
    }

    fn unmap_buffers(&self) -> Result<()> {
        let mut locked_buf = self.buffers.lock().unwrap();
        for buf in locked_buf.iter_mut() {
            if !buf.is_mapped() {
                continue;
            }
            // SAFETY: buf records a mapping created by map_buffers().
            let ret =
                unsafe { libc::munmap(buf.addr as *mut libc::c_void, buf.len as libc::size_t) };
            if ret < 0 {
                bail!(
                    "Failed to unmap buffer for {}, error {:?}",
                    self.path,
                    std::io::Error::last_os_error()
                );
            }
            buf.addr = 0;
            buf.len = 0;
        }
        Ok(())
    }

    /// Release the kernel buffer pool and all mappings.
    pub fn release_buffers(&self) -> Result<()> {
        self.unmap_buffers()?;
        let empty = self.buffers.lock().unwrap().is_empty();
        if !empty {
            let mut bufs = new_init::<v4l2_requestbuffers>();
            bufs.type_ = v4l2_buf_type_V4L2_BUF_TYPE_VIDEO_CAPTURE;
            bufs.memory = v4l2_memory_V4L2_MEMORY_MMAP;
            bufs.count = 0;
            self.xioctl_mut_ref(VIDIOC_REQBUFS(), &mut bufs)
                .with_context(|| format!("Failed to release buffers for {}", self.path))?;
            self.buffers.lock().unwrap().clear();
        }
        Ok(())
    }

    pub fn buffer_count(&self) -> usize {
        self.buffers.lock().unwrap().len()
    }

    pub fn mapped_buffer(&self, index: usize) -> Option<MappedBuffer> {
        self.buffers.lock().unwrap().get(index).copied()
    }

    pub fn stream_on(&self) -> Result<()> {
        let vtype = v4l2_buf_type_V4L2_BUF_TYPE_VIDEO_CAPTURE as c_int;
        self.xioctl_ref(VIDIOC_STREAMON(), &vtype)
            .with_context(|| format!("Failed to stream on for {}", self.path))
    }

    pub fn stream_off(&self) -> Result<()> {
        let vtype = v4l2_buf_type_V4L2_BUF_TYPE_VIDEO_CAPTURE as c_int;
        self.xioctl_ref(VIDIOC_STREAMOFF(), &vtype)
            .with_context(|| format!("Failed to stream off for {}", self.path))
    }

    pub fn queue_buffer(&self, index: u32) -> Result<()> {
        let mut buf = new_init::<v4l2_buffer>();
        buf.index = index;
        buf.type_ = v4l2_buf_type_V4L2_BUF_TYPE_VIDEO_CAPTURE;
        buf.memory = v4l2_memory_V4L2_MEMORY_MMAP;
        self.xioctl_ref(VIDIOC_QBUF(), &buf)
            .with_context(|| format!("Failed to queue buffer {} for {}", index, self.path))
    }

    /// Dequeue one filled buffer. Returns `None` when no frame is ready yet.
    pub fn dequeue_buffer(&self) -> Result<Option<DequeuedBuffer>> {
        let mut buf = new_init::<v4l2_buffer>();
        buf.type_ = v4l2_buf_type_V4L2_BUF_TYPE_VIDEO_CAPTURE;
        buf.memory = v4l2_memory_V4L2_MEMORY_MMAP;
        match self.xioctl_mut_ref(VIDIOC_DQBUF(), &mut buf) {
            Ok(()) => {}
            Err(e) if e.raw_os_error() == Some(libc::EAGAIN) => return Ok(None),
            Err(e) => bail!("Failed to dequeue buffer for {}, error {:?}", self.path, e),
        }
        let timestamp_ns = buf.timestamp.tv_sec as u64 * crate::time::NANOSECONDS_PER_SECOND
            + buf.timestamp.tv_usec as u64 * 1_000;
        Ok(Some(DequeuedBuffer {
            index: buf.index,
            sequence: buf.sequence,
            bytes_used: buf.bytesused,
            timestamp_ns,
        }))
    }

    /// Wait until the node has a frame ready, bounded by `timeout_ms`.
    /// Returns false on timeout.
    pub fn wait_readable(&self, timeout_ms: i32) -> Result<bool> {
        let mut pfd = libc::pollfd {
            fd: self.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        loop {
            // SAFETY: pfd refers to an fd owned by this backend.
            let ret = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
            if ret > 0 {
                if pfd.revents & (libc::POLLERR | libc::POLLHUP) != 0 {
                    bail!("Poll reported error condition for {}", self.path);
                }
                return Ok(true);
            }
            if ret == 0 {
                return Ok(false);
            }
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            bail!("Failed to poll {}, error {:?}", self.path, err);
        }
    }

    pub fn enum_format(&self, desc: &mut v4l2_fmtdesc) -> Result<bool> {
        match self.xioctl_mut_ref(VIDIOC_ENUM_FMT(), desc) {
            Ok(()) => Ok(false),
            Err(e) if e.kind() == ErrorKind::InvalidInput => Ok(true),
            Err(e) => bail!("Failed to enumerate format, error {:?}", e),
        }
    }

    pub fn enum_frame_size(&self, frmsize: &mut v4l2_frmsizeenum) -> Result<bool> {
        match self.xioctl_mut_ref(VIDIOC_ENUM_FRAMESIZES(), frmsize) {
            Ok(()) => Ok(false),
            Err(e) if e.kind() == ErrorKind::InvalidInput => Ok(true),
            Err(e) => bail!("Failed to enumerate frame size, error {:?}", e),
        }
    }

    pub fn enum_frame_interval(&self, frame_val: &mut v4l2_frmivalenum) -> Result<bool> {
        match self.xioctl_mut_ref(VIDIOC_ENUM_FRAMEINTERVALS(), frame_val) {
            Ok(()) => Ok(false),
            Err(e) if e.kind() == ErrorKind::InvalidInput => Ok(true),
            Err(e) => bail!("Failed to enumerate frame interval, error {:?}", e),
        }
    }
}

impl AsRawFd for V4l2Backend {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

pub fn new_init<T>() -> T {
    let mut s = ::std::mem::MaybeUninit::<T>::uninit();
    // SAFETY: s can be guaranteed not be null.
    unsafe {
        ::std::ptr::write_bytes(s.as_mut_ptr(), 0, 1);
        s.assume_init()
    }
}

/// Convert a fixed-size NUL padded byte array from the kernel into a string.
pub fn fixed_cstr_to_string(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_cstr_to_string() {
        let mut raw = [0_u8; 16];
        raw[..9].copy_from_slice(b"uvcvideo\0");
        assert_eq!(fixed_cstr_to_string(&raw), "uvcvideo");

        let full = [b'a'; 8];
        assert_eq!(fixed_cstr_to_string(&full), "aaaaaaaa");

        assert_eq!(fixed_cstr_to_string(&[0_u8; 4]), "");
    }

    #[test]
    fn test_new_init_zeroed() {
        let buf = new_init::<v4l2_buffer>();
        assert_eq!(buf.index, 0);
        assert_eq!(buf.bytesused, 0);
        assert_eq!(buf.sequence, 0);
    }
}
