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

//! Service configuration: which cameras to expose and how they are backed.

use std::path::Path;
use std::str::FromStr;

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CamBackendType {
    V4l2,
    Demo,
}

impl FromStr for CamBackendType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "v4l2" => Ok(CamBackendType::V4l2),
            "demo" => Ok(CamBackendType::Demo),
            _ => Err(anyhow!("Unknown camera backend type")),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CameraDevConfig {
    /// Required for demo cameras; v4l2 ids are derived from bus info.
    pub id: Option<String>,
    pub path: Option<String>,
    pub backend: CamBackendType,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct HalConfig {
    #[serde(default)]
    pub cameras: Vec<CameraDevConfig>,
}

impl HalConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: HalConfig = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;
        config.check()?;
        Ok(config)
    }

    pub fn check(&self) -> Result<()> {
        for (i, cam) in self.cameras.iter().enumerate() {
            match cam.backend {
                CamBackendType::V4l2 => {
                    let path = cam
                        .path
                        .as_deref()
                        .with_context(|| format!("cameradev {} has no path", i))?;
                    for (j, other) in self.cameras.iter().enumerate() {
                        if i != j
                            && other.backend == CamBackendType::V4l2
                            && other.path.as_deref() == Some(path)
                        {
                            bail!("cameradevs {} and {} share backend device {}", i, j, path);
                        }
                    }
                }
                CamBackendType::Demo => {
                    let id = cam
                        .id
                        .as_deref()
                        .with_context(|| format!("demo cameradev {} has no id", i))?;
                    for (j, other) in self.cameras.iter().enumerate() {
                        if i != j && other.id.as_deref() == Some(id) {
                            bail!("cameradevs {} and {} share id {}", i, j, id);
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let raw = r#"{
            "cameras": [
                { "id": null, "path": "/dev/video0", "backend": "v4l2" },
                { "id": "demo0", "path": null, "backend": "demo" }
            ]
        }"#;
        let config: HalConfig = serde_json::from_str(raw).unwrap();
        config.check().unwrap();
        assert_eq!(config.cameras.len(), 2);
        assert_eq!(config.cameras[0].backend, CamBackendType::V4l2);
        assert_eq!(config.cameras[1].id.as_deref(), Some("demo0"));
    }

    #[test]
    fn test_duplicate_path_rejected() {
        let config = HalConfig {
            cameras: vec![
                CameraDevConfig {
                    id: None,
                    path: Some("/dev/video0".to_string()),
                    backend: CamBackendType::V4l2,
                },
                CameraDevConfig {
                    id: None,
                    path: Some("/dev/video0".to_string()),
                    backend: CamBackendType::V4l2,
                },
            ],
        };
        assert!(config.check().is_err());
    }

    #[test]
    fn test_demo_requires_id() {
        let config = HalConfig {
            cameras: vec![CameraDevConfig {
                id: None,
                path: None,
                backend: CamBackendType::Demo,
            }],
        };
        assert!(config.check().is_err());
    }

    #[test]
    fn test_backend_from_str() {
        assert_eq!(CamBackendType::from_str("v4l2").unwrap(), CamBackendType::V4l2);
        assert_eq!(CamBackendType::from_str("demo").unwrap(), CamBackendType::Demo);
        assert!(CamBackendType::from_str("gstreamer").is_err());
    }
}
