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

//! The abstract layer between the capture pipeline and concrete frame
//! sources. Sources, such as a kernel V4L2 node or the demo generator, shall
//! implement trait DeviceNode.

pub mod demo;
pub mod v4l2;

use anyhow::{bail, Result};

use crate::format::FourccFormat;

#[derive(Clone, Debug)]
pub struct NodeCapabilities {
    /// Human readable card name.
    pub card: String,
    /// Persistent identifier of the device, e.g. the USB bus path.
    pub bus_info: String,
    /// Raw driver capability bits.
    pub driver_caps: u32,
}

/// One enumerated (format, size) pair with the rates the node can sustain.
#[derive(Clone, Debug)]
pub struct FormatEntry {
    pub format: FourccFormat,
    pub width: u32,
    pub height: u32,
    pub frame_rates: Vec<f32>,
}

impl FormatEntry {
    pub fn max_fps(&self) -> f32 {
        self.frame_rates.iter().copied().fold(0.0, f32::max)
    }
}

/// Ownership of one capture buffer at any instant.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BufferState {
    KernelOwned,
    InConversion,
    UserIdle,
}

/// Indexed arena tracking which side owns each capture buffer. All pipeline
/// code refers to buffers by index; ownership moves are explicit transitions.
#[derive(Debug, Default)]
pub struct BufferArena {
    states: Vec<BufferState>,
}

impl BufferArena {
    pub fn new(count: usize) -> Self {
        Self {
            states: vec![BufferState::UserIdle; count],
        }
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    fn state_of(&self, index: u32) -> Result<BufferState> {
        match self.states.get(index as usize) {
            Some(s) => Ok(*s),
            None => bail!("Buffer index {} out of range {}", index, self.states.len()),
        }
    }

    /// User hands the buffer to the kernel.
    pub fn mark_queued(&mut self, index: u32) -> Result<()> {
        match self.state_of(index)? {
            BufferState::KernelOwned => {
                bail!("Buffer {} queued twice without intervening dequeue", index)
            }
            _ => {
                self.states[index as usize] = BufferState::KernelOwned;
                Ok(())
            }
        }
    }

    /// Kernel hands a filled buffer back for conversion.
    pub fn mark_dequeued(&mut self, index: u32) -> Result<()> {
        match self.state_of(index)? {
            BufferState::KernelOwned => {
                self.states[index as usize] = BufferState::InConversion;
                Ok(())
            }
            s => bail!("Buffer {} dequeued while {:?}", index, s),
        }
    }

    /// Stream off implicitly returns every kernel-owned buffer.
    pub fn release_kernel_owned(&mut self) {
        for state in self.states.iter_mut() {
            if *state == BufferState::KernelOwned {
                *state = BufferState::UserIdle;
            }
        }
    }

    pub fn idle_indices(&self) -> Vec<u32> {
        self.states
            .iter()
            .enumerate()
            .filter(|(_, s)| **s == BufferState::UserIdle)
            .map(|(i, _)| i as u32)
            .collect()
    }

    pub fn count_in(&self, state: BufferState) -> usize {
        self.states.iter().filter(|s| **s == state).count()
    }
}

/// A filled frame as seen by the session worker.
#[derive(Clone, Copy, Debug)]
pub struct SourceFrame {
    pub index: u32,
    pub sequence: u32,
    pub bytes_used: u32,
    /// Monotonic nanoseconds reported by the source.
    pub timestamp_ns: u64,
}

/// Outcome of one bounded dequeue attempt.
#[derive(Clone, Copy, Debug)]
pub enum DequeueEvent {
    Frame(SourceFrame),
    TimedOut,
}

/// A synchronous handle over one capture node.
pub trait DeviceNode: Send {
    fn query_capabilities(&self) -> Result<NodeCapabilities>;

    /// Full cross-product of format, discrete size and frame rate.
    fn enumerate_formats(&mut self) -> Result<Vec<FormatEntry>>;

    /// Commit a format. Fails if the kernel coerces to a different
    /// format or geometry.
    fn set_format(&mut self, format: FourccFormat, width: u32, height: u32) -> Result<()>;

    /// Best effort; Ok(false) means the node did not take the rate.
    fn set_frame_interval(&mut self, fps: f32) -> Result<bool>;

    fn get_control(&self, id: u32) -> Result<i32>;

    fn set_control(&mut self, id: u32, value: i32) -> Result<()>;

    /// Allocate `count` buffers; zero releases the pool.
    fn request_buffers(&mut self, count: u32) -> Result<()>;

    /// Map every requested buffer into user space.
    fn map_buffers(&mut self) -> Result<()>;

    fn queue_buffer(&mut self, index: u32) -> Result<()>;

    fn dequeue_buffer(&mut self, timeout_ms: u32) -> Result<DequeueEvent>;

    /// Payload bytes of a dequeued buffer.
    fn frame_bytes(&self, index: u32, len: usize) -> Result<&[u8]>;

    /// Idempotent with respect to repeated calls.
    fn stream_on(&mut self) -> Result<()>;

    /// Idempotent; returns all kernel-owned buffers to the user side.
    fn stream_off(&mut self) -> Result<()>;

    fn idle_buffers(&self) -> Vec<u32>;

    fn buffer_count(&self) -> usize;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arena_transitions() {
        let mut arena = BufferArena::new(2);
        assert_eq!(arena.count_in(BufferState::UserIdle), 2);

        arena.mark_queued(0).unwrap();
        assert_eq!(arena.count_in(BufferState::KernelOwned), 1);

        // A kernel-owned buffer must not be queued again.
        assert!(arena.mark_queued(0).is_err());

        arena.mark_dequeued(0).unwrap();
        assert_eq!(arena.count_in(BufferState::InConversion), 1);

        // Only kernel-owned buffers can be dequeued.
        assert!(arena.mark_dequeued(1).is_err());

        // Requeue straight from conversion.
        arena.mark_queued(0).unwrap();
        assert_eq!(arena.count_in(BufferState::KernelOwned), 1);
    }

    #[test]
    fn test_arena_stream_off_returns_buffers() {
        let mut arena = BufferArena::new(3);
        arena.mark_queued(0).unwrap();
        arena.mark_queued(1).unwrap();
        arena.mark_dequeued(1).unwrap();

        arena.release_kernel_owned();
        assert_eq!(arena.count_in(BufferState::KernelOwned), 0);
        // In-conversion buffers stay with their holder.
        assert_eq!(arena.count_in(BufferState::InConversion), 1);
        assert_eq!(arena.idle_indices(), vec![0, 2]);
    }

    #[test]
    fn test_arena_out_of_range() {
        let mut arena = BufferArena::new(1);
        assert!(arena.mark_queued(4).is_err());
    }

    #[test]
    fn test_format_entry_max_fps() {
        let entry = FormatEntry {
            format: FourccFormat::Yuy2,
            width: 640,
            height: 480,
            frame_rates: vec![10.0, 30.0, 15.0],
        };
        assert_eq!(entry.max_fps(), 30.0);
    }
}
