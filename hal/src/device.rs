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

//! Per-camera facade: static capability metadata, stream combination
//! answers, and the at-most-one live capture session.

use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use anyhow::Result;
use log::{info, warn};

use crate::characteristics::{build_characteristics, CharacteristicsOptions, StaticCharacteristics};
use crate::convert::MjpegDecoder;
use crate::error::{CameraError, CameraResult};
use crate::node::{DeviceNode, FormatEntry};
use crate::session::{CameraCallback, CaptureSession};
use crate::stream::{StreamDescriptor, StreamDirection};

pub struct CameraDevice {
    id: String,
    card: String,
    bus_info: String,
    characteristics: Arc<StaticCharacteristics>,
    formats: Vec<FormatEntry>,
    node: Arc<Mutex<Box<dyn DeviceNode>>>,
    decoder: Option<Arc<dyn MjpegDecoder>>,
    available: AtomicBool,
    active_session: Mutex<Weak<CaptureSession>>,
    closed_hook: Mutex<Option<Arc<dyn Fn(&str) + Send + Sync>>>,
}

impl CameraDevice {
    /// Wrap a probed node. The node is introspected once here; the session
    /// borrows it for the lifetime of each open.
    pub fn new(
        id: String,
        mut node: Box<dyn DeviceNode>,
        decoder: Option<Arc<dyn MjpegDecoder>>,
        opts: &CharacteristicsOptions,
    ) -> Result<Arc<Self>> {
        let caps = node.query_capabilities()?;
        let formats = node.enumerate_formats()?;
        let characteristics = Arc::new(build_characteristics(&formats, opts, decoder.is_some())?);
        info!(
            "Camera {} ({}) advertises {} configurations",
            id,
            caps.card,
            characteristics.stream_configs().len()
        );
        Ok(Arc::new(CameraDevice {
            id,
            card: caps.card,
            bus_info: caps.bus_info,
            characteristics,
            formats,
            node: Arc::new(Mutex::new(node)),
            decoder,
            available: AtomicBool::new(true),
            active_session: Mutex::new(Weak::new()),
            closed_hook: Mutex::new(None),
        }))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn card(&self) -> &str {
        &self.card
    }

    pub fn bus_info(&self) -> &str {
        &self.bus_info
    }

    /// Shared immutable view of the static characteristics.
    pub fn characteristics(&self) -> Arc<StaticCharacteristics> {
        self.characteristics.clone()
    }

    /// Pure function of the static characteristics: exactly one OUTPUT
    /// stream whose configuration is advertised.
    pub fn is_stream_combination_supported(&self, streams: &[StreamDescriptor]) -> bool {
        if streams.len() != 1 {
            return false;
        }
        let stream = &streams[0];
        stream.direction == StreamDirection::Output
            && self
                .characteristics
                .supports_config(stream.pixel_format, stream.width, stream.height)
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::Acquire)
    }

    pub(crate) fn set_closed_hook(&self, hook: Arc<dyn Fn(&str) + Send + Sync>) {
        *self.closed_hook.lock().unwrap() = Some(hook);
    }

    pub fn active_session(&self) -> Option<Arc<CaptureSession>> {
        self.active_session
            .lock()
            .unwrap()
            .upgrade()
            .filter(|s| !s.is_closed())
    }

    /// Open the one live session this device supports.
    pub fn open(
        self: &Arc<Self>,
        callback: Arc<dyn CameraCallback>,
    ) -> CameraResult<Arc<CaptureSession>> {
        if !self.is_available() {
            return Err(CameraError::Unavailable);
        }
        let mut active = self.active_session.lock().unwrap();
        if let Some(session) = active.upgrade() {
            if !session.is_closed() {
                warn!("Camera {} is already open", self.id);
                return Err(CameraError::AlreadyInUse);
            }
        }

        let session = CaptureSession::new(
            self.id.clone(),
            self.node.clone(),
            self.formats.clone(),
            self.characteristics.clone(),
            self.decoder.clone(),
            callback,
        )
        .map_err(|e| CameraError::Broken(format!("{e:#}")))?;

        let device = Arc::downgrade(self);
        session.set_on_closed(Box::new(move || {
            if let Some(device) = device.upgrade() {
                device.on_session_closed();
            }
        }));

        *active = Arc::downgrade(&session);
        info!("Camera {} opened", self.id);
        Ok(session)
    }

    /// Session teardown completed; forget it and tell the provider.
    fn on_session_closed(&self) {
        *self.active_session.lock().unwrap() = Weak::new();
        if let Some(hook) = self.closed_hook.lock().unwrap().clone() {
            hook(&self.id);
        }
    }

    pub fn mark_available(&self) {
        self.available.store(true, Ordering::Release);
    }

    /// The device disappeared; a live session becomes broken.
    pub fn mark_unavailable(&self) {
        self.available.store(false, Ordering::Release);
        if let Some(session) = self.active_session() {
            session.fail_device("device became unavailable");
        }
    }

    pub fn set_torch_mode(&self, _enabled: bool) -> CameraResult<()> {
        Err(CameraError::NotSupported)
    }

    pub fn get_physical_camera_characteristics(
        &self,
        _physical_id: &str,
    ) -> CameraResult<Arc<StaticCharacteristics>> {
        Err(CameraError::NotSupported)
    }

    pub fn open_injection_session(&self) -> CameraResult<()> {
        Err(CameraError::NotSupported)
    }

    pub fn get_resource_cost(&self) -> CameraResult<u32> {
        Err(CameraError::NotSupported)
    }

    /// Write a human readable summary of this device.
    pub fn dump_state(&self, w: &mut dyn Write) -> std::io::Result<()> {
        writeln!(w, "camera {} ({})", self.id, self.card)?;
        writeln!(w, "  bus: {}", self.bus_info)?;
        writeln!(w, "  available: {}", self.is_available())?;
        writeln!(
            w,
            "  characteristics: {} entries",
            self.characteristics.entry_count()
        )?;
        match self.active_session() {
            Some(session) => writeln!(w, "  session: {}", session.summary())?,
            None => writeln!(w, "  session: none")?,
        }
        writeln!(w, "  configurations:")?;
        for cfg in self.characteristics.stream_configs() {
            let duration = self
                .characteristics
                .min_frame_duration(cfg.format, cfg.width, cfg.height)
                .unwrap_or(0);
            writeln!(
                w,
                "    {:?} {}x{} min-duration {} ns",
                cfg.format, cfg.width, cfg.height, duration
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::HalPixelFormat;
    use crate::node::demo::DemoDeviceNode;
    use crate::session::{CaptureResult, NotifyMsg};

    struct NullCallback;

    impl CameraCallback for NullCallback {
        fn notify(&self, _msgs: &[NotifyMsg]) {}
        fn process_capture_result(&self, _results: &[CaptureResult]) {}
    }

    fn demo_device() -> Arc<CameraDevice> {
        CameraDevice::new(
            "demo-0".to_string(),
            Box::new(DemoDeviceNode::with_default_formats("demo-0")),
            None,
            &CharacteristicsOptions::default(),
        )
        .unwrap()
    }

    fn output_stream(format: HalPixelFormat, width: u32, height: u32) -> StreamDescriptor {
        StreamDescriptor {
            stream_id: 0,
            direction: StreamDirection::Output,
            width,
            height,
            pixel_format: format,
            dataspace: 0,
            usage: 0,
            max_buffers: 4,
        }
    }

    #[test]
    fn test_stream_combination_answers() {
        let device = demo_device();
        let good = output_stream(HalPixelFormat::YCbCr420Flex, 640, 480);
        assert!(device.is_stream_combination_supported(&[good.clone()]));

        // Unknown geometry.
        assert!(!device
            .is_stream_combination_supported(&[output_stream(HalPixelFormat::YCbCr420Flex, 320, 200)]));

        // Two streams.
        assert!(!device.is_stream_combination_supported(&[good.clone(), good.clone()]));

        // Input direction.
        let mut input = good;
        input.direction = StreamDirection::Input;
        assert!(!device.is_stream_combination_supported(&[input]));

        // Empty set.
        assert!(!device.is_stream_combination_supported(&[]));
    }

    #[test]
    fn test_double_open_rejected_until_close() {
        let device = demo_device();
        let session = device.open(Arc::new(NullCallback)).unwrap();

        match device.open(Arc::new(NullCallback)) {
            Err(CameraError::AlreadyInUse) => {}
            other => panic!("expected AlreadyInUse, got {:?}", other.map(|_| ())),
        }

        session.close().unwrap();
        drop(session);

        // A closed session no longer blocks the device.
        let reopened = device.open(Arc::new(NullCallback)).unwrap();
        reopened.close().unwrap();
    }

    #[test]
    fn test_unavailable_device_rejects_open() {
        let device = demo_device();
        device.mark_unavailable();
        match device.open(Arc::new(NullCallback)) {
            Err(CameraError::Unavailable) => {}
            other => panic!("expected Unavailable, got {:?}", other.map(|_| ())),
        }
        device.mark_available();
    }

    #[test]
    fn test_advisory_calls_unsupported() {
        let device = demo_device();
        assert!(matches!(
            device.set_torch_mode(true),
            Err(CameraError::NotSupported)
        ));
        assert!(matches!(
            device.get_physical_camera_characteristics("0"),
            Err(CameraError::NotSupported)
        ));
        assert!(matches!(
            device.open_injection_session(),
            Err(CameraError::NotSupported)
        ));
        assert!(matches!(
            device.get_resource_cost(),
            Err(CameraError::NotSupported)
        ));
    }

    #[test]
    fn test_dump_state_mentions_device() {
        let device = demo_device();
        let mut out = Vec::new();
        device.dump_state(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("demo-0"));
        assert!(text.contains("configurations"));
    }
}
