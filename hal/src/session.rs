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

//! Per-open capture session: the request queue, the worker that turns
//! dequeued frames into filled output buffers, and the result dispatcher.

use std::collections::VecDeque;
use std::os::unix::io::RawFd;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::thread::{JoinHandle, ThreadId};
use std::time::Duration;

use anyhow::{Context, Result};
use log::{debug, error, info, warn};

use crate::characteristics::StaticCharacteristics;
use crate::convert::{semi_planar_to_i420, yuy2_to_i420, MjpegDecoder};
use crate::error::{CameraError, CameraResult};
use crate::format::{direct_hal_format, planar_420_size, FourccFormat, HalPixelFormat};
use crate::node::{DequeueEvent, DeviceNode, FormatEntry, SourceFrame};
use crate::request::{CaptureRequest, RequestSettings, RequestTemplate};
use crate::stream::{
    BufferHandle, HalStreamInfo, OutputBufferRing, OutputImage, StreamDescriptor, StreamDirection,
    USAGE_CAMERA_WRITE, USAGE_CPU_WRITE,
};
use util::time::monotonic_time_ns;

/// Bound on one kernel wait; timeouts are retried until the state changes.
const DEQUEUE_TIMEOUT_MS: u32 = 250;
/// Slice for condition waits so state changes are always observed.
const WAIT_SLICE_MS: u64 = 100;

/// Error kinds carried in notify messages.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorCode {
    /// The session is unusable.
    Device,
    /// This request failed; others may still succeed.
    Request,
    /// Result metadata was dropped; buffers are fine.
    Result,
    /// One buffer was lost; the rest of the request may succeed.
    Buffer,
}

#[derive(Clone, Debug)]
pub enum NotifyMsg {
    Shutter {
        frame_number: u64,
        timestamp_ns: u64,
    },
    Error {
        frame_number: u64,
        /// None marks the invalid stream.
        stream_id: Option<i32>,
        code: ErrorCode,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BufferStatus {
    Ok,
    Error,
}

/// One filled output buffer referenced by its ring handle.
#[derive(Clone, Debug)]
pub struct ResultBuffer {
    pub stream_id: i32,
    pub handle: BufferHandle,
    pub status: BufferStatus,
    /// Read barrier for the consumer; absent when the write already landed.
    pub release_fence: Option<RawFd>,
}

#[derive(Clone, Debug, Default)]
pub struct ResultMetadata {
    pub sensor_timestamp_ns: u64,
}

#[derive(Clone, Debug)]
pub struct CaptureResult {
    pub frame_number: u64,
    pub partial_result: u32,
    pub output_buffers: Vec<ResultBuffer>,
    pub metadata: ResultMetadata,
}

/// Sink the framework registers at open time. Implementations must be
/// thread-safe; the session calls it with no internal lock held.
pub trait CameraCallback: Send + Sync {
    fn notify(&self, msgs: &[NotifyMsg]);
    fn process_capture_result(&self, results: &[CaptureResult]);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SessionState {
    Idle,
    Active,
    Flushing,
    Closed,
    Broken,
}

#[derive(Clone, Debug)]
struct ActiveConfig {
    stream_id: i32,
    width: u32,
    height: u32,
    source_format: FourccFormat,
    depth: u32,
}

#[derive(Debug)]
struct QueuedRequest {
    frame_number: u64,
}

struct ExternalFrame {
    data: Vec<u8>,
    format: FourccFormat,
    timestamp_ns: u64,
}

struct SessionInner {
    state: SessionState,
    config: Option<ActiveConfig>,
    ring: Option<OutputBufferRing>,
    generation: u64,
    queue: VecDeque<QueuedRequest>,
    external: VecDeque<ExternalFrame>,
    callback: Option<Arc<dyn CameraCallback>>,
    stream_started: bool,
    in_flight: Option<u64>,
    expected_sequence: Option<u32>,
    last_frame_number: Option<u64>,
}

struct SessionShared {
    camera_id: String,
    inner: Mutex<SessionInner>,
    cond: Condvar,
    worker_tid: Mutex<Option<ThreadId>>,
}

impl SessionShared {
    /// Drain every queued request into ERROR_REQUEST messages. Caller
    /// dispatches them after releasing the lock.
    fn drain_queue(inner: &mut SessionInner, msgs: &mut Vec<NotifyMsg>) {
        while let Some(req) = inner.queue.pop_front() {
            msgs.push(NotifyMsg::Error {
                frame_number: req.frame_number,
                stream_id: None,
                code: ErrorCode::Request,
            });
        }
    }
}

struct WorkerCtx {
    shared: Arc<SessionShared>,
    node: Arc<Mutex<Box<dyn DeviceNode>>>,
    decoder: Option<Arc<dyn MjpegDecoder>>,
}

pub struct CaptureSession {
    shared: Arc<SessionShared>,
    node: Arc<Mutex<Box<dyn DeviceNode>>>,
    decoder: Option<Arc<dyn MjpegDecoder>>,
    formats: Vec<FormatEntry>,
    characteristics: Arc<StaticCharacteristics>,
    worker: Mutex<Option<JoinHandle<()>>>,
    on_closed: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl CaptureSession {
    pub fn new(
        camera_id: String,
        node: Arc<Mutex<Box<dyn DeviceNode>>>,
        formats: Vec<FormatEntry>,
        characteristics: Arc<StaticCharacteristics>,
        decoder: Option<Arc<dyn MjpegDecoder>>,
        callback: Arc<dyn CameraCallback>,
    ) -> Result<Arc<Self>> {
        let shared = Arc::new(SessionShared {
            camera_id: camera_id.clone(),
            inner: Mutex::new(SessionInner {
                state: SessionState::Idle,
                config: None,
                ring: None,
                generation: 0,
                queue: VecDeque::new(),
                external: VecDeque::new(),
                callback: Some(callback),
                stream_started: false,
                in_flight: None,
                expected_sequence: None,
                last_frame_number: None,
            }),
            cond: Condvar::new(),
            worker_tid: Mutex::new(None),
        });

        let ctx = WorkerCtx {
            shared: shared.clone(),
            node: node.clone(),
            decoder: decoder.clone(),
        };
        let handle = thread::Builder::new()
            .name(format!("uvc cam {} worker", camera_id))
            .spawn(move || worker_loop(ctx))
            .with_context(|| "Failed to create session worker thread")?;

        info!("Capture session created for camera {}", camera_id);
        Ok(Arc::new(CaptureSession {
            shared,
            node,
            decoder,
            formats,
            characteristics,
            worker: Mutex::new(Some(handle)),
            on_closed: Mutex::new(None),
        }))
    }

    pub fn camera_id(&self) -> &str {
        &self.shared.camera_id
    }

    /// Hook run exactly once when the session finishes closing.
    pub fn set_on_closed(&self, hook: Box<dyn FnOnce() + Send>) {
        *self.on_closed.lock().unwrap() = Some(hook);
    }

    pub fn is_closed(&self) -> bool {
        matches!(
            self.shared.inner.lock().unwrap().state,
            SessionState::Closed | SessionState::Broken
        )
    }

    /// Pick the node format one output stream will be fed from. Preference:
    /// identical layout, then packed 4:2:2 conversion, then MJPEG decode.
    fn elect_source(&self, stream: &StreamDescriptor) -> Option<FourccFormat> {
        let geometry_matches = |e: &&FormatEntry| e.width == stream.width && e.height == stream.height;
        if let Some(entry) = self
            .formats
            .iter()
            .filter(geometry_matches)
            .find(|e| direct_hal_format(e.format) == Some(stream.pixel_format))
        {
            return Some(entry.format);
        }
        if stream.pixel_format != HalPixelFormat::YCbCr420Flex {
            return None;
        }
        if self
            .formats
            .iter()
            .filter(geometry_matches)
            .any(|e| e.format == FourccFormat::Yuy2)
        {
            return Some(FourccFormat::Yuy2);
        }
        if self.decoder.is_some()
            && self
                .formats
                .iter()
                .filter(geometry_matches)
                .any(|e| e.format == FourccFormat::Mjpg)
        {
            return Some(FourccFormat::Mjpg);
        }
        None
    }

    /// Validate and commit a stream set. One OUTPUT stream is supported; an
    /// empty set tears the configuration down.
    pub fn configure_streams(
        &self,
        streams: &[StreamDescriptor],
    ) -> CameraResult<Vec<HalStreamInfo>> {
        // Validate before touching anything so a rejected call leaves the
        // previous configuration intact.
        {
            let inner = self.shared.inner.lock().unwrap();
            match inner.state {
                SessionState::Closed | SessionState::Broken => {
                    return Err(CameraError::InvalidArgument("session is closed".to_string()))
                }
                _ => {}
            }
            if !inner.queue.is_empty() || inner.in_flight.is_some() {
                return Err(CameraError::InvalidArgument(
                    "stream configuration with requests in flight".to_string(),
                ));
            }
        }

        if streams.is_empty() {
            self.teardown_streams();
            info!(
                "Camera {} deconfigured, no streams remain",
                self.shared.camera_id
            );
            return Ok(Vec::new());
        }
        if streams.len() > 1 {
            return Err(CameraError::InvalidArgument(format!(
                "{} streams requested, the pipeline supports exactly one",
                streams.len()
            )));
        }
        let stream = &streams[0];
        if stream.direction != StreamDirection::Output {
            return Err(CameraError::InvalidArgument(
                "input streams are not supported".to_string(),
            ));
        }
        if !self
            .characteristics
            .supports_config(stream.pixel_format, stream.width, stream.height)
        {
            return Err(CameraError::InvalidArgument(format!(
                "{:?} {}x{} is not an advertised configuration",
                stream.pixel_format, stream.width, stream.height
            )));
        }
        if stream.pixel_format != HalPixelFormat::YCbCr420Flex {
            return Err(CameraError::InvalidArgument(format!(
                "{:?} output is not produced by this pipeline",
                stream.pixel_format
            )));
        }
        let source_format = self.elect_source(stream).ok_or_else(|| {
            CameraError::InvalidArgument(format!(
                "no node format converts to {:?} {}x{}",
                stream.pixel_format, stream.width, stream.height
            ))
        })?;

        let depth = u32::from(self.characteristics.pipeline_max_depth());
        let ring_size = stream.max_buffers.max(depth);

        self.teardown_streams();

        // Commit the node side of the configuration.
        {
            let mut node = self.node.lock().unwrap();
            let result = (|| -> Result<()> {
                node.set_format(source_format, stream.width, stream.height)?;
                if node.set_frame_interval(self.best_fps(source_format, stream))? {
                    debug!("Camera {} frame interval committed", self.shared.camera_id);
                }
                node.request_buffers(depth)?;
                node.map_buffers()
            })();
            if let Err(e) = result {
                error!(
                    "Camera {} failed to commit node configuration: {:?}",
                    self.shared.camera_id, e
                );
                let _ = node.request_buffers(0);
                drop(node);
                self.fail_device(&format!("node configuration failed: {e:#}"));
                return Err(CameraError::Broken(format!("{e:#}")));
            }
        }

        let hal_info = HalStreamInfo {
            stream_id: stream.stream_id,
            override_format: stream.pixel_format,
            producer_usage: USAGE_CPU_WRITE | USAGE_CAMERA_WRITE,
            max_buffers: ring_size,
            dataspace: stream.dataspace,
        };

        let mut inner = self.shared.inner.lock().unwrap();
        inner.generation += 1;
        let generation = inner.generation;
        let ring = OutputBufferRing::new(ring_size, stream.width, stream.height, generation)
            .map_err(|e| CameraError::InvalidArgument(format!("{e:#}")))?;
        inner.ring = Some(ring);
        inner.config = Some(ActiveConfig {
            stream_id: stream.stream_id,
            width: stream.width,
            height: stream.height,
            source_format,
            depth,
        });
        inner.expected_sequence = None;
        info!(
            "Camera {} configured {}x{} from {:?}, ring {} buffers",
            self.shared.camera_id, stream.width, stream.height, source_format, ring_size
        );
        Ok(vec![hal_info])
    }

    fn best_fps(&self, source_format: FourccFormat, stream: &StreamDescriptor) -> f32 {
        self.formats
            .iter()
            .filter(|e| {
                e.format == source_format && e.width == stream.width && e.height == stream.height
            })
            .map(|e| e.max_fps())
            .fold(0.0, f32::max)
            .max(1.0)
    }

    /// Drop the node pool, the ring and all derived state.
    fn teardown_streams(&self) {
        {
            let mut node = self.node.lock().unwrap();
            if let Err(e) = node.stream_off() {
                warn!("Camera {} stream off failed: {:?}", self.shared.camera_id, e);
            }
            if let Err(e) = node.request_buffers(0) {
                warn!(
                    "Camera {} buffer release failed: {:?}",
                    self.shared.camera_id, e
                );
            }
        }
        let mut inner = self.shared.inner.lock().unwrap();
        inner.ring = None;
        inner.config = None;
        inner.stream_started = false;
        inner.expected_sequence = None;
        inner.external.clear();
    }

    pub fn construct_default_request_settings(
        &self,
        template: RequestTemplate,
    ) -> CameraResult<RequestSettings> {
        if self.is_closed() {
            return Err(CameraError::InvalidArgument("session is closed".to_string()));
        }
        Ok(RequestSettings::default_for_template(
            template,
            &self.characteristics,
        ))
    }

    /// Enqueue capture work. Returns how many requests were taken; a count
    /// below the submitted number means the queue bound was hit and the
    /// caller retries the remainder.
    pub fn process_capture_request(&self, requests: &[CaptureRequest]) -> CameraResult<u32> {
        let mut msgs = Vec::new();
        let mut accepted = 0_u32;
        let cb;
        {
            let mut inner = self.shared.inner.lock().unwrap();
            match inner.state {
                SessionState::Closed => {
                    return Err(CameraError::InvalidArgument("session is closed".to_string()))
                }
                SessionState::Broken => {
                    return Err(CameraError::Broken("session lost its device".to_string()))
                }
                _ => {}
            }
            let config = match inner.config.as_ref() {
                Some(c) => c.clone(),
                None => {
                    return Err(CameraError::InvalidArgument(
                        "streams are not configured".to_string(),
                    ))
                }
            };
            let bound = (config.depth * 2) as usize;

            for req in requests {
                if req.output_stream_ids.is_empty() {
                    warn!(
                        "Camera {} request {} carries no output buffers",
                        self.shared.camera_id, req.frame_number
                    );
                    msgs.push(NotifyMsg::Error {
                        frame_number: req.frame_number,
                        stream_id: None,
                        code: ErrorCode::Request,
                    });
                    continue;
                }
                if req
                    .output_stream_ids
                    .iter()
                    .any(|id| *id != config.stream_id)
                {
                    warn!(
                        "Camera {} request {} names an unknown stream",
                        self.shared.camera_id, req.frame_number
                    );
                    msgs.push(NotifyMsg::Error {
                        frame_number: req.frame_number,
                        stream_id: None,
                        code: ErrorCode::Request,
                    });
                    continue;
                }
                if inner
                    .last_frame_number
                    .map_or(false, |last| req.frame_number < last)
                {
                    warn!(
                        "Camera {} frame number {} went backwards",
                        self.shared.camera_id, req.frame_number
                    );
                    msgs.push(NotifyMsg::Error {
                        frame_number: req.frame_number,
                        stream_id: None,
                        code: ErrorCode::Request,
                    });
                    continue;
                }
                if inner.queue.len() >= bound {
                    // Backpressure: the caller retries the remainder.
                    break;
                }
                inner.queue.push_back(QueuedRequest {
                    frame_number: req.frame_number,
                });
                inner.last_frame_number = Some(req.frame_number);
                accepted += 1;
            }

            if accepted > 0 && inner.state == SessionState::Idle {
                inner.state = SessionState::Active;
            }
            cb = inner.callback.clone();
            self.shared.cond.notify_all();
        }

        if !msgs.is_empty() {
            if let Some(cb) = cb {
                cb.notify(&msgs);
            }
        }
        Ok(accepted)
    }

    /// Alternative ingress for sources upstream of the kernel node.
    pub fn push_external_frame(
        &self,
        data: Vec<u8>,
        width: u32,
        height: u32,
        format: FourccFormat,
    ) -> CameraResult<()> {
        let mut inner = self.shared.inner.lock().unwrap();
        match inner.state {
            SessionState::Closed | SessionState::Broken => {
                return Err(CameraError::InvalidArgument("session is closed".to_string()))
            }
            _ => {}
        }
        let config = inner
            .config
            .as_ref()
            .ok_or_else(|| CameraError::InvalidArgument("streams are not configured".to_string()))?;
        if width != config.width || height != config.height {
            return Err(CameraError::InvalidArgument(format!(
                "frame geometry {}x{} does not match the configured {}x{}",
                width, height, config.width, config.height
            )));
        }
        match format {
            FourccFormat::Yuy2 => {}
            FourccFormat::Mjpg if self.decoder.is_some() => {}
            other => {
                return Err(CameraError::InvalidArgument(format!(
                    "no ingress conversion for {:?}",
                    other
                )))
            }
        }
        let bound = (config.depth * 2) as usize;
        if inner.external.len() >= bound {
            debug!(
                "Camera {} external frame dropped, queue full",
                self.shared.camera_id
            );
            return Ok(());
        }
        inner.external.push_back(ExternalFrame {
            data,
            format,
            timestamp_ns: monotonic_time_ns(),
        });
        self.shared.cond.notify_all();
        Ok(())
    }

    /// Abort queued work promptly. Requests that have not shuttered receive
    /// ERROR_REQUEST before this returns; at most one in-conversion frame is
    /// allowed to finish on its own.
    pub fn flush(&self) -> CameraResult<()> {
        let mut msgs = Vec::new();
        let cb;
        {
            let mut inner = self.shared.inner.lock().unwrap();
            match inner.state {
                SessionState::Closed | SessionState::Broken | SessionState::Idle => return Ok(()),
                _ => {}
            }
            SessionShared::drain_queue(&mut inner, &mut msgs);
            inner.external.clear();
            inner.state = if inner.in_flight.is_some() {
                SessionState::Flushing
            } else {
                SessionState::Idle
            };
            cb = inner.callback.clone();
            self.shared.cond.notify_all();
        }
        info!(
            "Camera {} flushed {} pending requests",
            self.shared.camera_id,
            msgs.len()
        );
        if !msgs.is_empty() {
            if let Some(cb) = cb {
                cb.notify(&msgs);
            }
        }
        Ok(())
    }

    /// Terminal teardown; idempotent, and safe to invoke from the worker's
    /// own completion path.
    pub fn close(&self) -> CameraResult<()> {
        {
            let mut inner = self.shared.inner.lock().unwrap();
            if inner.state == SessionState::Closed {
                return Ok(());
            }
            inner.state = SessionState::Closed;
            self.shared.cond.notify_all();
        }
        info!("Camera {} session closing", self.shared.camera_id);

        let on_worker_thread = self
            .shared
            .worker_tid
            .lock()
            .unwrap()
            .map_or(false, |tid| tid == thread::current().id());
        if !on_worker_thread {
            if let Some(handle) = self.worker.lock().unwrap().take() {
                if handle.join().is_err() {
                    error!("Camera {} worker thread panicked", self.shared.camera_id);
                }
            }
        }

        {
            let mut node = self.node.lock().unwrap();
            if let Err(e) = node.stream_off() {
                warn!("Camera {} stream off failed: {:?}", self.shared.camera_id, e);
            }
            if let Err(e) = node.request_buffers(0) {
                warn!(
                    "Camera {} buffer release failed: {:?}",
                    self.shared.camera_id, e
                );
            }
        }

        let mut msgs = Vec::new();
        let cb;
        {
            let mut inner = self.shared.inner.lock().unwrap();
            SessionShared::drain_queue(&mut inner, &mut msgs);
            inner.external.clear();
            inner.ring = None;
            inner.config = None;
            inner.stream_started = false;
            cb = inner.callback.take();
        }
        if !msgs.is_empty() {
            if let Some(cb) = cb {
                cb.notify(&msgs);
            }
        }

        if let Some(hook) = self.on_closed.lock().unwrap().take() {
            hook();
        }
        info!("Camera {} session closed", self.shared.camera_id);
        Ok(())
    }

    /// Mark the session dead after losing the device, failing every pending
    /// request and notifying ERROR_DEVICE.
    pub fn fail_device(&self, reason: &str) {
        let mut msgs = Vec::new();
        let cb;
        {
            let mut inner = self.shared.inner.lock().unwrap();
            if matches!(inner.state, SessionState::Closed | SessionState::Broken) {
                return;
            }
            error!(
                "Camera {} session broken: {}",
                self.shared.camera_id, reason
            );
            msgs.push(NotifyMsg::Error {
                frame_number: 0,
                stream_id: None,
                code: ErrorCode::Device,
            });
            if let Some(frame_number) = inner.in_flight.take() {
                msgs.push(NotifyMsg::Error {
                    frame_number,
                    stream_id: None,
                    code: ErrorCode::Request,
                });
            }
            SessionShared::drain_queue(&mut inner, &mut msgs);
            inner.external.clear();
            inner.state = SessionState::Broken;
            cb = inner.callback.clone();
            self.shared.cond.notify_all();
        }
        if let Some(cb) = cb {
            cb.notify(&msgs);
        }
    }

    /// Read access to a delivered output buffer.
    pub fn with_output<R>(
        &self,
        handle: BufferHandle,
        f: impl FnOnce(&OutputImage) -> R,
    ) -> CameraResult<R> {
        let inner = self.shared.inner.lock().unwrap();
        let ring = inner
            .ring
            .as_ref()
            .ok_or_else(|| CameraError::InvalidArgument("streams are not configured".to_string()))?;
        let image = ring
            .image(handle)
            .map_err(|e| CameraError::InvalidArgument(format!("{e:#}")))?;
        Ok(f(image))
    }

    pub fn is_reconfiguration_required(
        &self,
        _old_settings: &RequestSettings,
        _new_settings: &RequestSettings,
    ) -> CameraResult<bool> {
        Ok(false)
    }

    pub fn repeating_request_end(&self, _frame_number: u64, _stream_ids: &[i32]) -> CameraResult<()> {
        Ok(())
    }

    pub fn signal_stream_flush(&self, _stream_ids: &[i32], _config_counter: u32) -> CameraResult<()> {
        Ok(())
    }

    pub fn switch_to_offline(&self, _streams_to_keep: &[i32]) -> CameraResult<()> {
        Err(CameraError::NotSupported)
    }

    pub fn capture_request_metadata_queue(&self) -> CameraResult<()> {
        Err(CameraError::NotSupported)
    }

    pub fn capture_result_metadata_queue(&self) -> CameraResult<()> {
        Err(CameraError::NotSupported)
    }

    /// Human readable one-line summary used by device dumps.
    pub fn summary(&self) -> String {
        let inner = self.shared.inner.lock().unwrap();
        let config = match inner.config.as_ref() {
            Some(c) => format!(
                "{}x{} from {:?} stream {}",
                c.width, c.height, c.source_format, c.stream_id
            ),
            None => "unconfigured".to_string(),
        };
        format!(
            "state {:?}, {} queued, {}, ring {}",
            inner.state,
            inner.queue.len(),
            config,
            inner.ring.as_ref().map_or(0, |r| r.len())
        )
    }
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

enum Job {
    Exit,
    Kernel {
        config: ActiveConfig,
        need_start: bool,
    },
    External {
        config: ActiveConfig,
        frame: ExternalFrame,
    },
}

fn worker_loop(ctx: WorkerCtx) {
    *ctx.shared.worker_tid.lock().unwrap() = Some(thread::current().id());
    debug!("Camera {} worker running", ctx.shared.camera_id);

    loop {
        let job = wait_for_job(&ctx);
        match job {
            Job::Exit => break,
            Job::Kernel { config, need_start } => {
                process_kernel_frame(&ctx, &config, need_start);
            }
            Job::External { config, frame } => {
                process_external_frame(&ctx, &config, frame);
            }
        }
    }

    // Requests that never made it to a shutter are failed on the way out.
    let mut msgs = Vec::new();
    let cb;
    {
        let mut inner = ctx.shared.inner.lock().unwrap();
        SessionShared::drain_queue(&mut inner, &mut msgs);
        inner.in_flight = None;
        cb = inner.callback.clone();
    }
    if !msgs.is_empty() {
        if let Some(cb) = cb {
            cb.notify(&msgs);
        }
    }
    debug!("Camera {} worker stopped", ctx.shared.camera_id);
}

fn wait_for_job(ctx: &WorkerCtx) -> Job {
    let mut inner = ctx.shared.inner.lock().unwrap();
    loop {
        match inner.state {
            SessionState::Closed | SessionState::Broken => return Job::Exit,
            SessionState::Flushing => {
                if inner.in_flight.is_none() && inner.queue.is_empty() {
                    inner.state = SessionState::Idle;
                    continue;
                }
            }
            SessionState::Active => {
                if !inner.queue.is_empty() {
                    if let Some(config) = inner.config.clone() {
                        if let Some(frame) = inner.external.pop_front() {
                            return Job::External { config, frame };
                        }
                        return Job::Kernel {
                            config,
                            need_start: !inner.stream_started,
                        };
                    }
                }
            }
            SessionState::Idle => {}
        }
        let (guard, _) = ctx
            .shared
            .cond
            .wait_timeout(inner, Duration::from_millis(WAIT_SLICE_MS))
            .unwrap();
        inner = guard;
    }
}

/// Queue every idle buffer and turn the stream on.
fn start_stream(node: &mut dyn DeviceNode) -> Result<()> {
    for index in node.idle_buffers() {
        node.queue_buffer(index)?;
    }
    node.stream_on()
}

fn process_kernel_frame(ctx: &WorkerCtx, config: &ActiveConfig, need_start: bool) {
    if need_start {
        let started = {
            let mut node = ctx.node.lock().unwrap();
            start_stream(node.as_mut())
        };
        match started {
            Ok(()) => ctx.shared.inner.lock().unwrap().stream_started = true,
            Err(e) => {
                worker_fatal(ctx, &format!("stream start failed: {e:#}"));
                return;
            }
        }
    }

    let event = {
        let mut node = ctx.node.lock().unwrap();
        node.dequeue_buffer(DEQUEUE_TIMEOUT_MS)
    };
    let frame = match event {
        Ok(DequeueEvent::TimedOut) => {
            // Recoverable; go around and re-check the session state.
            debug!("Camera {} dequeue timed out", ctx.shared.camera_id);
            return;
        }
        Ok(DequeueEvent::Frame(frame)) => frame,
        Err(e) => {
            worker_fatal(ctx, &format!("dequeue failed: {e:#}"));
            return;
        }
    };

    report_sequence_gaps(ctx, &frame);

    let claim = {
        let mut inner = ctx.shared.inner.lock().unwrap();
        if inner.state != SessionState::Active {
            None
        } else {
            match (inner.queue.pop_front(), inner.callback.clone()) {
                (Some(req), Some(cb)) => {
                    inner.in_flight = Some(req.frame_number);
                    Some((req.frame_number, cb))
                }
                _ => None,
            }
        }
    };
    let (frame_number, cb) = match claim {
        Some(claim) => claim,
        None => {
            // Flushed or closed while the kernel was filling the buffer.
            requeue_source(ctx, frame.index);
            return;
        }
    };

    cb.notify(&[NotifyMsg::Shutter {
        frame_number,
        timestamp_ns: frame.timestamp_ns,
    }]);

    let (handle, mut image) = match acquire_slot(ctx) {
        Some(slot) => slot,
        None => {
            requeue_source(ctx, frame.index);
            finish_with_error(ctx, frame_number, config.stream_id);
            return;
        }
    };

    // Convert under the node lock, then restore the pool balance right away.
    let converted = {
        let mut node = ctx.node.lock().unwrap();
        let result = convert_source(
            node.as_ref(),
            ctx.decoder.as_deref(),
            config,
            &frame,
            &mut image,
        );
        if let Err(e) = node.queue_buffer(frame.index) {
            drop(node);
            restore_slot(ctx, handle, image);
            worker_fatal(ctx, &format!("requeue failed: {e:#}"));
            return;
        }
        result
    };

    publish(ctx, config, frame_number, frame.timestamp_ns, handle, image, converted);
}

fn process_external_frame(ctx: &WorkerCtx, config: &ActiveConfig, frame: ExternalFrame) {
    let claim = {
        let mut inner = ctx.shared.inner.lock().unwrap();
        if inner.state != SessionState::Active {
            None
        } else {
            match (inner.queue.pop_front(), inner.callback.clone()) {
                (Some(req), Some(cb)) => {
                    inner.in_flight = Some(req.frame_number);
                    Some((req.frame_number, cb))
                }
                _ => None,
            }
        }
    };
    let (frame_number, cb) = match claim {
        Some(claim) => claim,
        None => return,
    };

    cb.notify(&[NotifyMsg::Shutter {
        frame_number,
        timestamp_ns: frame.timestamp_ns,
    }]);

    let (handle, mut image) = match acquire_slot(ctx) {
        Some(slot) => slot,
        None => {
            finish_with_error(ctx, frame_number, config.stream_id);
            return;
        }
    };

    let converted = convert_bytes(
        &frame.data,
        frame.format,
        ctx.decoder.as_deref(),
        config,
        &mut image,
    );
    publish(ctx, config, frame_number, frame.timestamp_ns, handle, image, converted);
}

/// The kernel only reorders delivery through sequence gaps; each lost
/// sequence fails the request that would have consumed it.
fn report_sequence_gaps(ctx: &WorkerCtx, frame: &SourceFrame) {
    let mut msgs = Vec::new();
    let cb;
    {
        let mut inner = ctx.shared.inner.lock().unwrap();
        if let Some(expected) = inner.expected_sequence {
            let mut missed = frame.sequence.wrapping_sub(expected);
            while missed > 0 {
                match inner.queue.pop_front() {
                    Some(req) => msgs.push(NotifyMsg::Error {
                        frame_number: req.frame_number,
                        stream_id: None,
                        code: ErrorCode::Request,
                    }),
                    None => break,
                }
                missed -= 1;
            }
        }
        inner.expected_sequence = Some(frame.sequence.wrapping_add(1));
        cb = inner.callback.clone();
    }
    if !msgs.is_empty() {
        warn!(
            "Camera {} lost {} frames to sequence gaps",
            ctx.shared.camera_id,
            msgs.len()
        );
        if let Some(cb) = cb {
            cb.notify(&msgs);
        }
    }
}

fn acquire_slot(ctx: &WorkerCtx) -> Option<(BufferHandle, Box<OutputImage>)> {
    let mut inner = ctx.shared.inner.lock().unwrap();
    loop {
        match inner.state {
            SessionState::Closed | SessionState::Broken => return None,
            _ => {}
        }
        match inner.ring.as_mut() {
            Some(ring) => {
                if let Some(slot) = ring.try_acquire() {
                    return Some(slot);
                }
            }
            None => return None,
        }
        // Every slot is out with the consumer; wait for one to come home.
        let (guard, _) = ctx
            .shared
            .cond
            .wait_timeout(inner, Duration::from_millis(WAIT_SLICE_MS))
            .unwrap();
        inner = guard;
    }
}

fn convert_source(
    node: &dyn DeviceNode,
    decoder: Option<&dyn MjpegDecoder>,
    config: &ActiveConfig,
    frame: &SourceFrame,
    image: &mut OutputImage,
) -> Result<()> {
    let bytes = node.frame_bytes(frame.index, frame.bytes_used as usize)?;
    convert_bytes(bytes, config.source_format, decoder, config, image)
}

fn convert_bytes(
    bytes: &[u8],
    source_format: FourccFormat,
    decoder: Option<&dyn MjpegDecoder>,
    config: &ActiveConfig,
    image: &mut OutputImage,
) -> Result<()> {
    match source_format {
        FourccFormat::Yuy2 => {
            let stride_y = image.stride_y();
            let stride_uv = image.stride_uv();
            let (y, u, v) = image.planes_mut();
            yuy2_to_i420(
                bytes,
                config.width as usize,
                config.height as usize,
                y,
                stride_y,
                u,
                v,
                stride_uv,
            )
        }
        FourccFormat::Mjpg => {
            let decoder = decoder.with_context(|| "No MJPEG decoder registered")?;
            let decoded = decoder.decode(bytes, config.width, config.height)?;
            let expected = planar_420_size(config.width, config.height)?;
            if decoded.len() != expected {
                anyhow::bail!(
                    "Decoder produced {} bytes, expected {}",
                    decoded.len(),
                    expected
                );
            }
            image.fill_from_i420(&decoded)
        }
        FourccFormat::Nv12 | FourccFormat::Nv21 => {
            let stride_y = image.stride_y();
            let stride_uv = image.stride_uv();
            let (y, u, v) = image.planes_mut();
            semi_planar_to_i420(
                bytes,
                config.width as usize,
                config.height as usize,
                y,
                stride_y,
                u,
                v,
                stride_uv,
                source_format == FourccFormat::Nv21,
            )
        }
        FourccFormat::Yuv420 => {
            let expected = planar_420_size(config.width, config.height)?;
            if bytes.len() < expected {
                anyhow::bail!(
                    "Planar source holds {} bytes, expected {}",
                    bytes.len(),
                    expected
                );
            }
            image.fill_from_i420(&bytes[..expected])
        }
    }
}

fn requeue_source(ctx: &WorkerCtx, index: u32) {
    let mut node = ctx.node.lock().unwrap();
    if let Err(e) = node.queue_buffer(index) {
        drop(node);
        worker_fatal(ctx, &format!("requeue failed: {e:#}"));
    }
}

fn restore_slot(ctx: &WorkerCtx, handle: BufferHandle, image: Box<OutputImage>) {
    let mut inner = ctx.shared.inner.lock().unwrap();
    if let Some(ring) = inner.ring.as_mut() {
        if let Err(e) = ring.restore(handle, image) {
            warn!("Camera {} slot restore failed: {:?}", ctx.shared.camera_id, e);
        }
    }
}

fn finish_with_error(ctx: &WorkerCtx, frame_number: u64, stream_id: i32) {
    let cb;
    {
        let mut inner = ctx.shared.inner.lock().unwrap();
        inner.in_flight = None;
        if inner.state == SessionState::Flushing && inner.queue.is_empty() {
            inner.state = SessionState::Idle;
        }
        cb = inner.callback.clone();
        ctx.shared.cond.notify_all();
    }
    if let Some(cb) = cb {
        cb.notify(&[NotifyMsg::Error {
            frame_number,
            stream_id: Some(stream_id),
            code: ErrorCode::Request,
        }]);
    }
}

fn publish(
    ctx: &WorkerCtx,
    config: &ActiveConfig,
    frame_number: u64,
    timestamp_ns: u64,
    handle: BufferHandle,
    image: Box<OutputImage>,
    converted: Result<()>,
) {
    let cb;
    {
        let mut inner = ctx.shared.inner.lock().unwrap();
        if let Some(ring) = inner.ring.as_mut() {
            if let Err(e) = ring.restore(handle, image) {
                warn!("Camera {} slot restore failed: {:?}", ctx.shared.camera_id, e);
            }
        }
        inner.in_flight = None;
        if inner.state == SessionState::Flushing && inner.queue.is_empty() {
            inner.state = SessionState::Idle;
        }
        cb = inner.callback.clone();
        ctx.shared.cond.notify_all();
    }
    let cb = match cb {
        Some(cb) => cb,
        None => return,
    };

    match converted {
        Ok(()) => {
            let result = CaptureResult {
                frame_number,
                partial_result: 1,
                output_buffers: vec![ResultBuffer {
                    stream_id: config.stream_id,
                    handle,
                    status: BufferStatus::Ok,
                    release_fence: None,
                }],
                metadata: ResultMetadata {
                    sensor_timestamp_ns: timestamp_ns,
                },
            };
            cb.process_capture_result(&[result]);
        }
        Err(e) => {
            warn!(
                "Camera {} frame {} conversion failed: {:#}",
                ctx.shared.camera_id, frame_number, e
            );
            cb.notify(&[NotifyMsg::Error {
                frame_number,
                stream_id: Some(config.stream_id),
                code: ErrorCode::Request,
            }]);
        }
    }
}

fn worker_fatal(ctx: &WorkerCtx, reason: &str) {
    let mut msgs = Vec::new();
    let cb;
    {
        let mut inner = ctx.shared.inner.lock().unwrap();
        if matches!(inner.state, SessionState::Closed | SessionState::Broken) {
            return;
        }
        error!("Camera {} session broken: {}", ctx.shared.camera_id, reason);
        msgs.push(NotifyMsg::Error {
            frame_number: 0,
            stream_id: None,
            code: ErrorCode::Device,
        });
        if let Some(frame_number) = inner.in_flight.take() {
            msgs.push(NotifyMsg::Error {
                frame_number,
                stream_id: None,
                code: ErrorCode::Request,
            });
        }
        SessionShared::drain_queue(&mut inner, &mut msgs);
        inner.external.clear();
        inner.state = SessionState::Broken;
        cb = inner.callback.clone();
        ctx.shared.cond.notify_all();
    }
    if let Some(cb) = cb {
        cb.notify(&msgs);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Instant;

    use crate::characteristics::{build_characteristics, CharacteristicsOptions};
    use crate::node::demo::{DemoController, DemoDeviceNode};
    use crate::provider::{CameraProvider, CameraStatus, ProviderStatusCallback};
    use crate::request::RequestTemplate;

    #[derive(Clone, Debug, PartialEq)]
    enum Event {
        Shutter(u64, u64),
        Result(u64, u64, BufferHandle),
        Error(u64, Option<i32>, ErrorCode),
    }

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<Event>>,
        cond: Condvar,
    }

    impl Recorder {
        fn events(&self) -> Vec<Event> {
            self.events.lock().unwrap().clone()
        }

        fn wait_until(&self, timeout_ms: u64, pred: impl Fn(&[Event]) -> bool) -> bool {
            let deadline = Instant::now() + Duration::from_millis(timeout_ms);
            let mut guard = self.events.lock().unwrap();
            loop {
                if pred(&guard) {
                    return true;
                }
                let now = Instant::now();
                if now >= deadline {
                    return false;
                }
                let (g, _) = self.cond.wait_timeout(guard, deadline - now).unwrap();
                guard = g;
            }
        }
    }

    impl CameraCallback for Recorder {
        fn notify(&self, msgs: &[NotifyMsg]) {
            let mut guard = self.events.lock().unwrap();
            for msg in msgs {
                guard.push(match msg {
                    NotifyMsg::Shutter {
                        frame_number,
                        timestamp_ns,
                    } => Event::Shutter(*frame_number, *timestamp_ns),
                    NotifyMsg::Error {
                        frame_number,
                        stream_id,
                        code,
                    } => Event::Error(*frame_number, *stream_id, *code),
                });
            }
            self.cond.notify_all();
        }

        fn process_capture_result(&self, results: &[CaptureResult]) {
            let mut guard = self.events.lock().unwrap();
            for result in results {
                guard.push(Event::Result(
                    result.frame_number,
                    result.metadata.sensor_timestamp_ns,
                    result.output_buffers[0].handle,
                ));
            }
            self.cond.notify_all();
        }
    }

    fn shutters(events: &[Event]) -> Vec<(u64, u64)> {
        events
            .iter()
            .filter_map(|e| match e {
                Event::Shutter(f, t) => Some((*f, *t)),
                _ => None,
            })
            .collect()
    }

    fn results(events: &[Event]) -> Vec<(u64, u64, BufferHandle)> {
        events
            .iter()
            .filter_map(|e| match e {
                Event::Result(f, t, h) => Some((*f, *t, *h)),
                _ => None,
            })
            .collect()
    }

    fn request_errors(events: &[Event]) -> Vec<u64> {
        events
            .iter()
            .filter_map(|e| match e {
                Event::Error(f, _, ErrorCode::Request) => Some(*f),
                _ => None,
            })
            .collect()
    }

    fn device_errors(events: &[Event]) -> usize {
        events
            .iter()
            .filter(|e| matches!(e, Event::Error(_, _, ErrorCode::Device)))
            .count()
    }

    struct StubDecoder {
        short: AtomicBool,
        value: u8,
    }

    impl MjpegDecoder for StubDecoder {
        fn decode(&self, _jpeg: &[u8], width: u32, height: u32) -> Result<Vec<u8>> {
            let len = planar_420_size(width, height)?;
            if self.short.load(Ordering::Acquire) {
                Ok(vec![self.value; len - 16])
            } else {
                Ok(vec![self.value; len])
            }
        }
    }

    struct Harness {
        session: Arc<CaptureSession>,
        recorder: Arc<Recorder>,
        controller: DemoController,
        decoder: Arc<StubDecoder>,
    }

    fn harness(frame_delay_ms: u64) -> Harness {
        let mut node = DemoDeviceNode::with_default_formats("test-cam");
        node.set_frame_delay(Duration::from_millis(frame_delay_ms));
        let controller = node.controller();
        let mut boxed: Box<dyn DeviceNode> = Box::new(node);
        let formats = boxed.enumerate_formats().unwrap();
        let characteristics = Arc::new(
            build_characteristics(&formats, &CharacteristicsOptions::default(), true).unwrap(),
        );
        let recorder = Arc::new(Recorder::default());
        let decoder = Arc::new(StubDecoder {
            short: AtomicBool::new(false),
            value: 0x42,
        });
        let session = CaptureSession::new(
            "test-cam".to_string(),
            Arc::new(Mutex::new(boxed)),
            formats,
            characteristics,
            Some(decoder.clone()),
            recorder.clone(),
        )
        .unwrap();
        Harness {
            session,
            recorder,
            controller,
            decoder,
        }
    }

    fn flex_stream(width: u32, height: u32) -> StreamDescriptor {
        StreamDescriptor {
            stream_id: 0,
            direction: StreamDirection::Output,
            width,
            height,
            pixel_format: HalPixelFormat::YCbCr420Flex,
            dataspace: 0,
            usage: 0,
            max_buffers: 4,
        }
    }

    fn request(h: &Harness, frame_number: u64) -> CaptureRequest {
        CaptureRequest {
            frame_number,
            output_stream_ids: vec![0],
            settings: h
                .session
                .construct_default_request_settings(RequestTemplate::Preview)
                .unwrap(),
        }
    }

    /// Submit `count` requests starting at `first`, retrying on backpressure.
    fn submit_all(h: &Harness, first: u64, count: u64) {
        let mut next = first;
        let deadline = Instant::now() + Duration::from_secs(10);
        while next < first + count {
            let batch: Vec<CaptureRequest> =
                (next..(first + count).min(next + 8)).map(|f| request(h, f)).collect();
            let accepted = h.session.process_capture_request(&batch).unwrap();
            next += u64::from(accepted);
            if accepted == 0 {
                assert!(Instant::now() < deadline, "queue never drained");
                thread::sleep(Duration::from_millis(2));
            }
        }
    }

    #[test]
    fn test_preview_happy_path() {
        let h = harness(0);
        h.session.configure_streams(&[flex_stream(640, 480)]).unwrap();
        submit_all(&h, 0, 10);

        assert!(h.recorder.wait_until(5000, |e| results(e).len() == 10));
        let events = h.recorder.events();

        let shutters = shutters(&events);
        assert_eq!(
            shutters.iter().map(|s| s.0).collect::<Vec<_>>(),
            (0..10).collect::<Vec<u64>>()
        );
        assert!(shutters.windows(2).all(|w| w[0].1 <= w[1].1));

        let results = results(&events);
        assert_eq!(
            results.iter().map(|r| r.0).collect::<Vec<_>>(),
            (0..10).collect::<Vec<u64>>()
        );
        // Sensor timestamp equals the shutter timestamp of the same frame.
        for (shutter, result) in shutters.iter().zip(results.iter()) {
            assert_eq!(shutter.1, result.1);
        }
        // Consecutive results rotate through distinct ring slots.
        assert!(results.windows(2).all(|w| w[0].2 != w[1].2));
        // Every shutter precedes its result.
        for f in 0..10_u64 {
            let s = events.iter().position(|e| matches!(e, Event::Shutter(n, _) if *n == f));
            let r = events.iter().position(|e| matches!(e, Event::Result(n, _, _) if *n == f));
            assert!(s.unwrap() < r.unwrap());
        }
        assert!(request_errors(&events).is_empty());
        assert_eq!(device_errors(&events), 0);

        h.session.close().unwrap();
    }

    #[test]
    fn test_packed_422_conversion_values() {
        let h = harness(0);
        h.session.configure_streams(&[flex_stream(640, 480)]).unwrap();

        let mut frame = Vec::with_capacity(640 * 480 * 2);
        for _ in 0..640 * 480 / 2 {
            frame.extend_from_slice(&[0x80, 0x40, 0x80, 0xC0]);
        }
        h.controller.inject_payload(frame);

        assert_eq!(h.session.process_capture_request(&[request(&h, 0)]).unwrap(), 1);
        assert!(h.recorder.wait_until(5000, |e| results(e).len() == 1));

        let handle = results(&h.recorder.events())[0].2;
        h.session
            .with_output(handle, |image| {
                let width = image.width() as usize;
                for row in 0..image.height() as usize {
                    let y = &image.y_plane()[row * image.stride_y()..];
                    assert!(y[..width].iter().all(|&b| b == 0x80));
                }
                for row in 0..image.height() as usize / 2 {
                    let u = &image.u_plane()[row * image.stride_uv()..];
                    let v = &image.v_plane()[row * image.stride_uv()..];
                    assert!(u[..width / 2].iter().all(|&b| b == 0x40));
                    assert!(v[..width / 2].iter().all(|&b| b == 0xC0));
                }
            })
            .unwrap();

        h.session.close().unwrap();
    }

    #[test]
    fn test_mjpeg_decode_and_short_decode() {
        let h = harness(0);
        // The demo node offers 1920x1080 only as MJPEG.
        h.session.configure_streams(&[flex_stream(1920, 1080)]).unwrap();

        assert_eq!(h.session.process_capture_request(&[request(&h, 0)]).unwrap(), 1);
        assert!(h.recorder.wait_until(5000, |e| results(e).len() == 1));
        let (frame, ts, handle) = results(&h.recorder.events())[0];
        assert_eq!(frame, 0);
        let shutter_ts = shutters(&h.recorder.events())[0].1;
        assert_eq!(ts, shutter_ts);
        h.session
            .with_output(handle, |image| {
                assert!(image.y_plane()[..64].iter().all(|&b| b == 0x42));
            })
            .unwrap();

        // A short decode fails this request only.
        h.decoder.short.store(true, Ordering::Release);
        assert_eq!(h.session.process_capture_request(&[request(&h, 1)]).unwrap(), 1);
        assert!(h.recorder.wait_until(5000, |e| request_errors(e) == vec![1]));
        assert_eq!(device_errors(&h.recorder.events()), 0);

        // The session stays live for the next request.
        h.decoder.short.store(false, Ordering::Release);
        assert_eq!(h.session.process_capture_request(&[request(&h, 2)]).unwrap(), 1);
        assert!(h.recorder.wait_until(5000, |e| results(e).len() == 2));

        h.session.close().unwrap();
    }

    #[test]
    fn test_flush_mid_stream_then_new_requests() {
        let h = harness(2);
        h.session.configure_streams(&[flex_stream(640, 480)]).unwrap();

        submit_all(&h, 0, 100);
        // Park the frame source so the queue tail cannot drain before the
        // flush lands.
        h.controller.starve_dequeues(100);
        assert!(results(&h.recorder.events()).len() >= 5);
        h.session.flush().unwrap();
        h.controller.starve_dequeues(0);

        // Every submitted request ends as exactly one result or one error.
        assert!(h.recorder.wait_until(5000, |e| {
            results(e).len() + request_errors(e).len() == 100
        }));
        let events = h.recorder.events();
        for f in 0..100_u64 {
            let completed = results(&events).iter().filter(|r| r.0 == f).count();
            let errored = request_errors(&events).iter().filter(|&&e| e == f).count();
            assert_eq!(completed + errored, 1, "frame {} accounted once", f);
        }
        // The flush left plenty of work undone.
        assert!(!request_errors(&events).is_empty());

        // The session takes new work without reconfiguration.
        submit_all(&h, 100, 3);
        assert!(h.recorder.wait_until(5000, |e| {
            results(e).iter().filter(|r| r.0 >= 100).count() == 3
        }));
        let tail: Vec<u64> = results(&h.recorder.events())
            .iter()
            .filter(|r| r.0 >= 100)
            .map(|r| r.0)
            .collect();
        assert_eq!(tail, vec![100, 101, 102]);

        h.session.close().unwrap();
    }

    #[test]
    fn test_flush_on_idle_session_is_noop() {
        let h = harness(0);
        h.session.configure_streams(&[flex_stream(640, 480)]).unwrap();
        h.session.flush().unwrap();
        h.session.flush().unwrap();
        assert!(h.recorder.events().is_empty());
        h.session.close().unwrap();
    }

    #[test]
    fn test_configure_idempotent() {
        let h = harness(0);
        let first = h.session.configure_streams(&[flex_stream(640, 480)]).unwrap();
        let second = h.session.configure_streams(&[flex_stream(640, 480)]).unwrap();
        assert_eq!(first, second);
        assert_eq!(first[0].max_buffers, 4);
        assert_eq!(first[0].override_format, HalPixelFormat::YCbCr420Flex);
        h.session.close().unwrap();
    }

    #[test]
    fn test_invalid_configurations_preserve_previous() {
        let h = harness(0);
        h.session.configure_streams(&[flex_stream(640, 480)]).unwrap();

        // Two streams.
        assert!(matches!(
            h.session
                .configure_streams(&[flex_stream(640, 480), flex_stream(640, 480)]),
            Err(CameraError::InvalidArgument(_))
        ));
        // Input direction.
        let mut input = flex_stream(640, 480);
        input.direction = StreamDirection::Input;
        assert!(matches!(
            h.session.configure_streams(&[input]),
            Err(CameraError::InvalidArgument(_))
        ));
        // Unadvertised geometry.
        assert!(matches!(
            h.session.configure_streams(&[flex_stream(320, 200)]),
            Err(CameraError::InvalidArgument(_))
        ));

        // The earlier configuration still captures.
        assert_eq!(h.session.process_capture_request(&[request(&h, 0)]).unwrap(), 1);
        assert!(h.recorder.wait_until(5000, |e| results(e).len() == 1));
        h.session.close().unwrap();
    }

    #[test]
    fn test_empty_outputs_rejected() {
        let h = harness(0);
        h.session.configure_streams(&[flex_stream(640, 480)]).unwrap();
        let mut bad = request(&h, 0);
        bad.output_stream_ids.clear();
        assert_eq!(h.session.process_capture_request(&[bad]).unwrap(), 0);
        assert!(h.recorder.wait_until(1000, |e| request_errors(e) == vec![0]));
        h.session.close().unwrap();
    }

    #[test]
    fn test_unknown_stream_rejected() {
        let h = harness(0);
        h.session.configure_streams(&[flex_stream(640, 480)]).unwrap();
        let mut bad = request(&h, 0);
        bad.output_stream_ids = vec![7];
        assert_eq!(h.session.process_capture_request(&[bad]).unwrap(), 0);
        assert!(h.recorder.wait_until(1000, |e| request_errors(e) == vec![0]));
        h.session.close().unwrap();
    }

    #[test]
    fn test_request_without_configuration_rejected() {
        let h = harness(0);
        assert!(matches!(
            h.session.process_capture_request(&[request_unchecked(0)]),
            Err(CameraError::InvalidArgument(_))
        ));
        h.session.close().unwrap();
    }

    fn request_unchecked(frame_number: u64) -> CaptureRequest {
        CaptureRequest {
            frame_number,
            output_stream_ids: vec![0],
            settings: RequestSettings {
                capture_intent: crate::request::CaptureIntent::Preview,
                control_mode: crate::request::ControlMode::Auto,
                ae_mode: 1,
                af_mode: 0,
                awb_mode: 1,
                target_fps_range: (30, 30),
                ae_exposure_compensation: 0,
                jpeg_quality: 90,
                jpeg_thumbnail_size: (320, 240),
            },
        }
    }

    #[test]
    fn test_close_idempotent_and_silent_afterwards() {
        let h = harness(2);
        h.session.configure_streams(&[flex_stream(640, 480)]).unwrap();
        submit_all(&h, 0, 4);
        assert!(h.recorder.wait_until(5000, |e| results(e).len() >= 1));

        h.session.close().unwrap();
        h.session.close().unwrap();

        let frozen = h.recorder.events().len();
        assert!(matches!(
            h.session.process_capture_request(&[request_unchecked(9)]),
            Err(CameraError::InvalidArgument(_))
        ));
        thread::sleep(Duration::from_millis(100));
        assert_eq!(h.recorder.events().len(), frozen);
    }

    #[test]
    fn test_dequeue_timeout_is_retried_silently() {
        let h = harness(0);
        h.session.configure_streams(&[flex_stream(640, 480)]).unwrap();
        h.controller.starve_dequeues(3);
        assert_eq!(h.session.process_capture_request(&[request(&h, 0)]).unwrap(), 1);
        assert!(h.recorder.wait_until(5000, |e| results(e).len() == 1));
        assert!(request_errors(&h.recorder.events()).is_empty());
        assert_eq!(device_errors(&h.recorder.events()), 0);
        h.session.close().unwrap();
    }

    #[test]
    fn test_sequence_gap_fails_owning_requests() {
        let h = harness(0);
        h.session.configure_streams(&[flex_stream(640, 480)]).unwrap();

        assert_eq!(h.session.process_capture_request(&[request(&h, 0)]).unwrap(), 1);
        assert!(h.recorder.wait_until(5000, |e| results(e).len() == 1));

        h.controller.skip_sequences(2);
        submit_all(&h, 1, 2);
        assert!(h.recorder.wait_until(5000, |e| request_errors(e).len() == 2));
        assert_eq!(request_errors(&h.recorder.events()), vec![1, 2]);

        submit_all(&h, 3, 1);
        assert!(h.recorder.wait_until(5000, |e| results(e).len() == 2));
        h.session.close().unwrap();
    }

    #[test]
    fn test_stream_start_failure_breaks_session() {
        let h = harness(0);
        h.session.configure_streams(&[flex_stream(640, 480)]).unwrap();
        h.controller.fail_next_stream_on();

        submit_all(&h, 0, 2);
        assert!(h.recorder.wait_until(5000, |e| device_errors(e) == 1));
        assert!(h.recorder.wait_until(5000, |e| request_errors(e).len() == 2));

        assert!(matches!(
            h.session.process_capture_request(&[request_unchecked(5)]),
            Err(CameraError::Broken(_))
        ));
        h.session.close().unwrap();
    }

    #[test]
    fn test_external_frame_ingress() {
        let h = harness(0);
        h.session.configure_streams(&[flex_stream(640, 480)]).unwrap();

        // Geometry mismatch is rejected at the API.
        assert!(matches!(
            h.session
                .push_external_frame(vec![0; 16], 320, 240, FourccFormat::Yuy2),
            Err(CameraError::InvalidArgument(_))
        ));

        let mut frame = Vec::with_capacity(640 * 480 * 2);
        for _ in 0..640 * 480 / 2 {
            frame.extend_from_slice(&[0x66, 0x33, 0x66, 0x99]);
        }
        h.session
            .push_external_frame(frame, 640, 480, FourccFormat::Yuy2)
            .unwrap();
        assert_eq!(h.session.process_capture_request(&[request(&h, 0)]).unwrap(), 1);
        assert!(h.recorder.wait_until(5000, |e| results(e).len() == 1));

        let handle = results(&h.recorder.events())[0].2;
        h.session
            .with_output(handle, |image| {
                assert!(image.y_plane()[..64].iter().all(|&b| b == 0x66));
                assert!(image.u_plane()[..32].iter().all(|&b| b == 0x33));
                assert!(image.v_plane()[..32].iter().all(|&b| b == 0x99));
            })
            .unwrap();
        h.session.close().unwrap();
    }

    #[test]
    fn test_default_request_settings() {
        let h = harness(0);
        let preview = h
            .session
            .construct_default_request_settings(RequestTemplate::Preview)
            .unwrap();
        assert_eq!(preview.target_fps_range, (30, 30));
        let manual = h
            .session
            .construct_default_request_settings(RequestTemplate::Manual)
            .unwrap();
        assert_eq!(manual.control_mode, crate::request::ControlMode::Off);
        h.session.close().unwrap();
    }

    #[test]
    fn test_session_stubs() {
        let h = harness(0);
        assert!(matches!(h.session.switch_to_offline(&[0]), Err(CameraError::NotSupported)));
        assert!(matches!(
            h.session.capture_request_metadata_queue(),
            Err(CameraError::NotSupported)
        ));
        assert!(matches!(
            h.session.capture_result_metadata_queue(),
            Err(CameraError::NotSupported)
        ));
        let settings = h
            .session
            .construct_default_request_settings(RequestTemplate::Preview)
            .unwrap();
        assert_eq!(
            h.session
                .is_reconfiguration_required(&settings, &settings)
                .unwrap(),
            false
        );
        h.session.repeating_request_end(0, &[0]).unwrap();
        h.session.signal_stream_flush(&[0], 0).unwrap();
        h.session.close().unwrap();
    }

    struct EdgeSink {
        edges: Mutex<Vec<(String, CameraStatus)>>,
    }

    impl ProviderStatusCallback for EdgeSink {
        fn camera_device_status_change(&self, camera_id: &str, status: CameraStatus) {
            self.edges
                .lock()
                .unwrap()
                .push((camera_id.to_string(), status));
        }
    }

    #[test]
    fn test_hotplug_during_capture() {
        use crate::device::CameraDevice;

        let provider = CameraProvider::new();
        let device = CameraDevice::new(
            "cam0".to_string(),
            Box::new(DemoDeviceNode::with_default_formats("cam0")),
            None,
            &CharacteristicsOptions::default(),
        )
        .unwrap();
        provider.add_camera(device.clone()).unwrap();
        let sink = Arc::new(EdgeSink {
            edges: Mutex::new(Vec::new()),
        });
        provider.set_status_callback(sink.clone());

        let recorder = Arc::new(Recorder::default());
        let session = device.open(recorder.clone()).unwrap();
        session.configure_streams(&[flex_stream(640, 480)]).unwrap();
        let settings = session
            .construct_default_request_settings(RequestTemplate::Preview)
            .unwrap();
        session
            .process_capture_request(&[CaptureRequest {
                frame_number: 0,
                output_stream_ids: vec![0],
                settings,
            }])
            .unwrap();
        assert!(recorder.wait_until(5000, |e| results(e).len() == 1));

        // The device goes away mid-capture.
        provider.signal_availability("cam0", false).unwrap();
        assert!(recorder.wait_until(5000, |e| device_errors(e) == 1));
        assert_eq!(
            sink.edges.lock().unwrap().as_slice(),
            &[("cam0".to_string(), CameraStatus::NotPresent)]
        );

        // Re-open is refused until presence returns.
        assert!(matches!(
            device.open(Arc::new(Recorder::default())),
            Err(CameraError::Unavailable)
        ));

        provider.signal_availability("cam0", true).unwrap();
        let reopened = device.open(Arc::new(Recorder::default())).unwrap();
        reopened.close().unwrap();
        session.close().unwrap();
    }
}
