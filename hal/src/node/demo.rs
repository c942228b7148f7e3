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

//! Demo device node that synthesizes frames in memory. It backs the `demo`
//! config backend and the pipeline tests, which need a frame source without
//! kernel support.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use log::info;

use super::{
    BufferArena, BufferState, DequeueEvent, DeviceNode, FormatEntry, NodeCapabilities, SourceFrame,
};
use crate::format::{packed_422_size, planar_420_size, FourccFormat};
use util::time::monotonic_time_ns;

/// Knobs that steer the generator from outside the node, mainly for tests.
#[derive(Default)]
struct ControlState {
    /// Payloads that replace the generated pattern, oldest first.
    injected: VecDeque<Vec<u8>>,
    /// Number of dequeue attempts to answer with a timeout.
    starve: u32,
    /// Sequence numbers to swallow before the next frame.
    skip_sequences: u32,
    /// Fail the next stream-on attempt.
    fail_stream_on: bool,
    /// Fail every dequeue attempt with a hard error.
    fail_dequeue: bool,
    /// Frames handed out so far.
    frames_produced: u64,
}

/// Cloneable handle steering a [`DemoDeviceNode`].
#[derive(Clone, Default)]
pub struct DemoController {
    state: Arc<Mutex<ControlState>>,
}

impl DemoController {
    pub fn inject_payload(&self, payload: Vec<u8>) {
        self.state.lock().unwrap().injected.push_back(payload);
    }

    pub fn starve_dequeues(&self, count: u32) {
        self.state.lock().unwrap().starve = count;
    }

    pub fn skip_sequences(&self, count: u32) {
        self.state.lock().unwrap().skip_sequences = count;
    }

    pub fn fail_next_stream_on(&self) {
        self.state.lock().unwrap().fail_stream_on = true;
    }

    pub fn fail_dequeues(&self, fail: bool) {
        self.state.lock().unwrap().fail_dequeue = fail;
    }

    pub fn frames_produced(&self) -> u64 {
        self.state.lock().unwrap().frames_produced
    }
}

pub struct DemoDeviceNode {
    name: String,
    formats: Vec<FormatEntry>,
    current_format: Option<(FourccFormat, u32, u32)>,
    arena: BufferArena,
    buffers: Vec<Vec<u8>>,
    /// FIFO of kernel-owned buffer indexes, front is filled next.
    fifo: VecDeque<u32>,
    sequence: u32,
    streaming: bool,
    controls: BTreeMap<u32, i32>,
    frame_delay: Duration,
    controller: DemoController,
}

impl DemoDeviceNode {
    pub fn new(name: &str, formats: Vec<FormatEntry>) -> Self {
        info!("Demo camera node {} created", name);
        DemoDeviceNode {
            name: name.to_string(),
            formats,
            current_format: None,
            arena: BufferArena::default(),
            buffers: Vec::new(),
            fifo: VecDeque::new(),
            sequence: 0,
            streaming: false,
            controls: BTreeMap::new(),
            frame_delay: Duration::ZERO,
            controller: DemoController::default(),
        }
    }

    /// A generator advertising the sizes a typical webcam would.
    pub fn with_default_formats(name: &str) -> Self {
        Self::new(
            name,
            vec![
                FormatEntry {
                    format: FourccFormat::Yuy2,
                    width: 640,
                    height: 480,
                    frame_rates: vec![15.0, 30.0],
                },
                FormatEntry {
                    format: FourccFormat::Yuy2,
                    width: 1280,
                    height: 720,
                    frame_rates: vec![30.0],
                },
                FormatEntry {
                    format: FourccFormat::Mjpg,
                    width: 1920,
                    height: 1080,
                    frame_rates: vec![30.0],
                },
            ],
        )
    }

    pub fn controller(&self) -> DemoController {
        self.controller.clone()
    }

    /// Delay applied before each produced frame, simulating sensor pacing.
    pub fn set_frame_delay(&mut self, delay: Duration) {
        self.frame_delay = delay;
    }

    fn frame_capacity(format: FourccFormat, width: u32, height: u32) -> Result<usize> {
        match format {
            // A compressed frame never exceeds the packed equivalent.
            FourccFormat::Yuy2 | FourccFormat::Mjpg => packed_422_size(width, height),
            _ => planar_420_size(width, height),
        }
    }

    fn generate_payload(&self, format: FourccFormat, width: u32, height: u32) -> Vec<u8> {
        let seq = self.sequence as u8;
        match format {
            FourccFormat::Yuy2 => {
                let mut data = vec![0_u8; packed_422_size(width, height).unwrap_or(0)];
                for group in data.chunks_exact_mut(4) {
                    group[0] = 0x50_u8.wrapping_add(seq);
                    group[1] = 0x80;
                    group[2] = 0x50_u8.wrapping_add(seq);
                    group[3] = 0x80;
                }
                data
            }
            FourccFormat::Mjpg => {
                // A stand-in JPEG payload: SOI marker, sequence byte, EOI.
                let body = (width as usize * height as usize / 8).max(16);
                let mut data = vec![seq; body];
                data[0] = 0xFF;
                data[1] = 0xD8;
                let len = data.len();
                data[len - 2] = 0xFF;
                data[len - 1] = 0xD9;
                data
            }
            _ => {
                let mut data = vec![0x80_u8; planar_420_size(width, height).unwrap_or(0)];
                let luma = (width * height) as usize;
                data[..luma].fill(0x50_u8.wrapping_add(seq));
                data
            }
        }
    }
}

impl DeviceNode for DemoDeviceNode {
    fn query_capabilities(&self) -> Result<NodeCapabilities> {
        Ok(NodeCapabilities {
            card: "Demo Camera".to_string(),
            bus_info: format!("platform:demo:{}", self.name),
            driver_caps: 0,
        })
    }

    fn enumerate_formats(&mut self) -> Result<Vec<FormatEntry>> {
        Ok(self.formats.clone())
    }

    fn set_format(&mut self, format: FourccFormat, width: u32, height: u32) -> Result<()> {
        if !self
            .formats
            .iter()
            .any(|e| e.format == format && e.width == width && e.height == height)
        {
            bail!(
                "Demo node {} does not offer {:?} {}x{}",
                self.name,
                format,
                width,
                height
            );
        }
        self.current_format = Some((format, width, height));
        Ok(())
    }

    fn set_frame_interval(&mut self, _fps: f32) -> Result<bool> {
        Ok(true)
    }

    fn get_control(&self, id: u32) -> Result<i32> {
        Ok(self.controls.get(&id).copied().unwrap_or(0))
    }

    fn set_control(&mut self, id: u32, value: i32) -> Result<()> {
        self.controls.insert(id, value);
        Ok(())
    }

    fn request_buffers(&mut self, count: u32) -> Result<()> {
        if count == 0 {
            self.arena = BufferArena::default();
            self.buffers.clear();
            self.fifo.clear();
            return Ok(());
        }
        let (format, width, height) = self
            .current_format
            .with_context(|| "Demo node has no format set")?;
        let capacity = Self::frame_capacity(format, width, height)?;
        self.arena = BufferArena::new(count as usize);
        self.buffers = vec![vec![0_u8; capacity]; count as usize];
        self.fifo.clear();
        Ok(())
    }

    fn map_buffers(&mut self) -> Result<()> {
        if self.buffers.is_empty() {
            bail!("Demo node {} has no buffers to map", self.name);
        }
        Ok(())
    }

    fn queue_buffer(&mut self, index: u32) -> Result<()> {
        self.arena.mark_queued(index)?;
        self.fifo.push_back(index);
        Ok(())
    }

    fn dequeue_buffer(&mut self, timeout_ms: u32) -> Result<DequeueEvent> {
        {
            let mut ctl = self.controller.state.lock().unwrap();
            if ctl.fail_dequeue {
                bail!("Demo node {} dequeue failure injected", self.name);
            }
            if ctl.starve > 0 {
                ctl.starve -= 1;
                drop(ctl);
                std::thread::sleep(Duration::from_millis(u64::from(timeout_ms).min(5)));
                return Ok(DequeueEvent::TimedOut);
            }
        }

        let index = match self.fifo.pop_front() {
            Some(i) => i,
            None => {
                std::thread::sleep(Duration::from_millis(u64::from(timeout_ms).min(5)));
                return Ok(DequeueEvent::TimedOut);
            }
        };
        if !self.frame_delay.is_zero() {
            std::thread::sleep(self.frame_delay);
        }

        let (format, width, height) = self
            .current_format
            .with_context(|| "Demo node has no format set")?;
        let payload = {
            let mut ctl = self.controller.state.lock().unwrap();
            self.sequence = self.sequence.wrapping_add(1 + ctl.skip_sequences);
            ctl.skip_sequences = 0;
            ctl.frames_produced += 1;
            ctl.injected.pop_front()
        }
        .unwrap_or_else(|| self.generate_payload(format, width, height));

        let buffer = &mut self.buffers[index as usize];
        let len = payload.len().min(buffer.len());
        buffer[..len].copy_from_slice(&payload[..len]);

        self.arena.mark_dequeued(index)?;
        Ok(DequeueEvent::Frame(SourceFrame {
            index,
            sequence: self.sequence,
            bytes_used: len as u32,
            timestamp_ns: monotonic_time_ns(),
        }))
    }

    fn frame_bytes(&self, index: u32, len: usize) -> Result<&[u8]> {
        let buffer = self
            .buffers
            .get(index as usize)
            .with_context(|| format!("Demo buffer {} out of range", index))?;
        if len > buffer.len() {
            bail!(
                "Frame length {} exceeds demo buffer length {}",
                len,
                buffer.len()
            );
        }
        Ok(&buffer[..len])
    }

    fn stream_on(&mut self) -> Result<()> {
        if self.streaming {
            return Ok(());
        }
        let mut ctl = self.controller.state.lock().unwrap();
        if ctl.fail_stream_on {
            ctl.fail_stream_on = false;
            bail!("Demo node {} stream-on failure injected", self.name);
        }
        drop(ctl);
        self.streaming = true;
        Ok(())
    }

    fn stream_off(&mut self) -> Result<()> {
        if !self.streaming {
            return Ok(());
        }
        self.arena.release_kernel_owned();
        self.fifo.clear();
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

impl DemoDeviceNode {
    /// Buffer ownership snapshot used by pipeline tests.
    pub fn ownership_counts(&self) -> (usize, usize, usize) {
        (
            self.arena.count_in(BufferState::KernelOwned),
            self.arena.count_in(BufferState::InConversion),
            self.arena.count_in(BufferState::UserIdle),
        )
    }
}
