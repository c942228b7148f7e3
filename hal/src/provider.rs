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

//! Camera provider: the id table, device presence signaling and discovery.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use log::{info, warn};

use crate::characteristics::CharacteristicsOptions;
use crate::config::{CamBackendType, HalConfig};
use crate::convert::MjpegDecoder;
use crate::device::CameraDevice;
use crate::error::{CameraError, CameraResult};
use crate::format::FourccFormat;
use crate::node::demo::DemoDeviceNode;
use crate::node::v4l2::V4l2DeviceNode;
use crate::node::DeviceNode;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CameraStatus {
    Present,
    NotPresent,
}

/// Availability sink the framework registers once at startup.
pub trait ProviderStatusCallback: Send + Sync {
    fn camera_device_status_change(&self, camera_id: &str, status: CameraStatus);
}

struct ProviderInner {
    cameras: BTreeMap<String, Arc<CameraDevice>>,
    callback: Option<Arc<dyn ProviderStatusCallback>>,
}

pub struct CameraProvider {
    inner: Mutex<ProviderInner>,
}

impl CameraProvider {
    pub fn new() -> Arc<Self> {
        Arc::new(CameraProvider {
            inner: Mutex::new(ProviderInner {
                cameras: BTreeMap::new(),
                callback: None,
            }),
        })
    }

    /// Build a provider holding one device per configured camera.
    pub fn from_config(
        config: &HalConfig,
        decoder: Option<Arc<dyn MjpegDecoder>>,
    ) -> Result<Arc<Self>> {
        let provider = Self::new();
        for cam in &config.cameras {
            let (id, node): (String, Box<dyn DeviceNode>) = match cam.backend {
                CamBackendType::V4l2 => {
                    let path = cam
                        .path
                        .as_deref()
                        .with_context(|| "no path configured for v4l2 cameradev")?;
                    let node = V4l2DeviceNode::new(path)?;
                    let id = stable_camera_id(&node)?;
                    (id, Box::new(node))
                }
                CamBackendType::Demo => {
                    let id = cam
                        .id
                        .clone()
                        .with_context(|| "no id configured for demo cameradev")?;
                    (id.clone(), Box::new(DemoDeviceNode::with_default_formats(&id)))
                }
            };
            let device =
                CameraDevice::new(id, node, decoder.clone(), &CharacteristicsOptions::default())?;
            provider.add_camera(device)?;
        }
        Ok(provider)
    }

    pub fn add_camera(self: &Arc<Self>, device: Arc<CameraDevice>) -> Result<()> {
        let id = device.id().to_string();
        let weak = Arc::downgrade(self);
        device.set_closed_hook(Arc::new(move |camera_id: &str| {
            if let Some(provider) = weak.upgrade() {
                provider.on_device_closed(camera_id);
            }
        }));
        let mut inner = self.inner.lock().unwrap();
        if inner.cameras.contains_key(&id) {
            anyhow::bail!("Camera id {} is already registered", id);
        }
        info!("Provider registered camera {}", id);
        inner.cameras.insert(id, device);
        Ok(())
    }

    pub fn set_status_callback(&self, callback: Arc<dyn ProviderStatusCallback>) {
        self.inner.lock().unwrap().callback = Some(callback);
    }

    /// Ids of the cameras currently marked available.
    pub fn list_cameras(&self) -> Vec<String> {
        self.inner
            .lock()
            .unwrap()
            .cameras
            .iter()
            .filter(|(_, d)| d.is_available())
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn get_device(&self, camera_id: &str) -> CameraResult<Arc<CameraDevice>> {
        let inner = self.inner.lock().unwrap();
        let device = inner
            .cameras
            .get(camera_id)
            .ok_or_else(|| CameraError::InvalidArgument(format!("unknown camera {}", camera_id)))?;
        if !device.is_available() {
            return Err(CameraError::Unavailable);
        }
        Ok(device.clone())
    }

    /// Presence edge from discovery. Idempotent; the status callback fires
    /// on transitions only.
    pub fn signal_availability(&self, camera_id: &str, available: bool) -> CameraResult<()> {
        let (device, callback) = {
            let inner = self.inner.lock().unwrap();
            let device = inner.cameras.get(camera_id).ok_or_else(|| {
                CameraError::InvalidArgument(format!("unknown camera {}", camera_id))
            })?;
            if device.is_available() == available {
                return Ok(());
            }
            (device.clone(), inner.callback.clone())
        };

        if available {
            device.mark_available();
        } else {
            device.mark_unavailable();
        }
        info!(
            "Camera {} is now {}",
            camera_id,
            if available { "PRESENT" } else { "NOT_PRESENT" }
        );
        if let Some(cb) = callback {
            let status = if available {
                CameraStatus::Present
            } else {
                CameraStatus::NotPresent
            };
            cb.camera_device_status_change(camera_id, status);
        }
        Ok(())
    }

    /// Teardown notification from a device whose session finished closing.
    pub fn on_device_closed(&self, camera_id: &str) {
        info!("Camera {} session teardown completed", camera_id);
    }

    /// Route an externally pushed frame to the camera's live session.
    pub fn push_external_frame(
        &self,
        camera_id: &str,
        data: Vec<u8>,
        width: u32,
        height: u32,
        format: FourccFormat,
    ) -> CameraResult<()> {
        let device = self.get_device(camera_id)?;
        let session = device
            .active_session()
            .ok_or_else(|| CameraError::InvalidArgument(format!("camera {} is not open", camera_id)))?;
        session.push_external_frame(data, width, height, format)
    }

    pub fn get_vendor_tags(&self) -> Vec<String> {
        Vec::new()
    }

    pub fn get_concurrent_camera_ids(&self) -> Vec<Vec<String>> {
        Vec::new()
    }

    pub fn is_concurrent_stream_combination_supported(&self) -> bool {
        false
    }

    pub fn notify_device_state_change(&self, _device_state: i64) -> CameraResult<()> {
        Ok(())
    }
}

fn sanitize_id(raw: &str) -> String {
    raw.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect()
}

/// Stable id derived from the kernel's persistent bus identifier, so the
/// same physical device keeps its id across disconnects.
pub fn stable_camera_id(node: &V4l2DeviceNode) -> Result<String> {
    let caps = node.query_capabilities()?;
    if !caps.bus_info.is_empty() {
        return Ok(sanitize_id(&caps.bus_info));
    }
    warn!(
        "Node {} reports no bus info, falling back to the card name",
        node.path()
    );
    Ok(sanitize_id(&caps.card))
}

/// Capture node candidates under a device directory, e.g. /dev.
pub fn scan_video_nodes(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut nodes = Vec::new();
    for entry in std::fs::read_dir(dir)
        .with_context(|| format!("Failed to read device directory {}", dir.display()))?
    {
        let entry = entry?;
        let name = entry.file_name();
        if name.to_string_lossy().starts_with("video") {
            nodes.push(entry.path());
        }
    }
    nodes.sort();
    Ok(nodes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    use crate::node::demo::DemoDeviceNode;

    #[derive(Default)]
    struct EdgeRecorder {
        edges: StdMutex<Vec<(String, CameraStatus)>>,
    }

    impl ProviderStatusCallback for EdgeRecorder {
        fn camera_device_status_change(&self, camera_id: &str, status: CameraStatus) {
            self.edges
                .lock()
                .unwrap()
                .push((camera_id.to_string(), status));
        }
    }

    fn provider_with_demo(id: &str) -> Arc<CameraProvider> {
        let provider = CameraProvider::new();
        let device = CameraDevice::new(
            id.to_string(),
            Box::new(DemoDeviceNode::with_default_formats(id)),
            None,
            &CharacteristicsOptions::default(),
        )
        .unwrap();
        provider.add_camera(device).unwrap();
        provider
    }

    #[test]
    fn test_unknown_id_is_invalid_argument() {
        let provider = provider_with_demo("cam0");
        assert!(matches!(
            provider.get_device("nope"),
            Err(CameraError::InvalidArgument(_))
        ));
        assert!(matches!(
            provider.signal_availability("nope", true),
            Err(CameraError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_availability_edges_fire_once() {
        let provider = provider_with_demo("cam0");
        let recorder = Arc::new(EdgeRecorder::default());
        provider.set_status_callback(recorder.clone());

        // Already present; no edge.
        provider.signal_availability("cam0", true).unwrap();
        assert!(recorder.edges.lock().unwrap().is_empty());

        provider.signal_availability("cam0", false).unwrap();
        provider.signal_availability("cam0", false).unwrap();
        provider.signal_availability("cam0", true).unwrap();

        let edges = recorder.edges.lock().unwrap();
        assert_eq!(
            *edges,
            vec![
                ("cam0".to_string(), CameraStatus::NotPresent),
                ("cam0".to_string(), CameraStatus::Present),
            ]
        );
    }

    #[test]
    fn test_absent_camera_not_listed_and_unavailable() {
        let provider = provider_with_demo("cam0");
        assert_eq!(provider.list_cameras(), vec!["cam0".to_string()]);

        provider.signal_availability("cam0", false).unwrap();
        assert!(provider.list_cameras().is_empty());
        assert!(matches!(
            provider.get_device("cam0"),
            Err(CameraError::Unavailable)
        ));

        provider.signal_availability("cam0", true).unwrap();
        assert!(provider.get_device("cam0").is_ok());
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let provider = provider_with_demo("cam0");
        let duplicate = CameraDevice::new(
            "cam0".to_string(),
            Box::new(DemoDeviceNode::with_default_formats("cam0")),
            None,
            &CharacteristicsOptions::default(),
        )
        .unwrap();
        assert!(provider.add_camera(duplicate).is_err());
    }

    #[test]
    fn test_concurrent_stubs() {
        let provider = provider_with_demo("cam0");
        assert!(provider.get_vendor_tags().is_empty());
        assert!(provider.get_concurrent_camera_ids().is_empty());
        assert!(!provider.is_concurrent_stream_combination_supported());
        assert!(provider.notify_device_state_change(3).is_ok());
    }

    #[test]
    fn test_scan_video_nodes() {
        let dir = std::env::temp_dir().join(format!("uvc-hal-scan-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        for name in ["video0", "video2", "card0", "media1"] {
            std::fs::write(dir.join(name), b"").unwrap();
        }

        let nodes = scan_video_nodes(&dir).unwrap();
        let names: Vec<String> = nodes
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["video0".to_string(), "video2".to_string()]);

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_sanitize_id_stability() {
        assert_eq!(
            sanitize_id("usb-0000:00:14.0-1"),
            "usb-0000-00-14-0-1".to_string()
        );
        assert_eq!(sanitize_id(""), String::new());
    }
}
