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

//! Capture request model and the per-template default settings.

use crate::characteristics::{StaticCharacteristics, AE_MODE_ON, AF_MODE_OFF, AWB_MODE_AUTO};

/// Use-case presets the framework requests defaults for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestTemplate {
    Preview,
    StillCapture,
    VideoRecord,
    VideoSnapshot,
    ZeroShutterLag,
    Manual,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CaptureIntent {
    Custom,
    Preview,
    StillCapture,
    VideoRecord,
    VideoSnapshot,
    ZeroShutterLag,
    Manual,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControlMode {
    Off,
    Auto,
}

/// Per-request control settings. UVC devices expose no per-frame sensor
/// control, so these act as carried metadata rather than actuation.
#[derive(Clone, Debug, PartialEq)]
pub struct RequestSettings {
    pub capture_intent: CaptureIntent,
    pub control_mode: ControlMode,
    pub ae_mode: u8,
    pub af_mode: u8,
    pub awb_mode: u8,
    pub target_fps_range: (i32, i32),
    pub ae_exposure_compensation: i32,
    pub jpeg_quality: u8,
    pub jpeg_thumbnail_size: (u32, u32),
}

impl RequestSettings {
    /// Build the preset for one template from the static characteristics.
    pub fn default_for_template(
        template: RequestTemplate,
        chars: &StaticCharacteristics,
    ) -> Self {
        let fps_range = chars.ae_fps_ranges().first().copied().unwrap_or((15, 30));

        let capture_intent = match template {
            RequestTemplate::Preview => CaptureIntent::Preview,
            RequestTemplate::StillCapture => CaptureIntent::StillCapture,
            RequestTemplate::VideoRecord => CaptureIntent::VideoRecord,
            RequestTemplate::VideoSnapshot => CaptureIntent::VideoSnapshot,
            RequestTemplate::ZeroShutterLag => CaptureIntent::ZeroShutterLag,
            RequestTemplate::Manual => CaptureIntent::Manual,
        };
        let control_mode = if template == RequestTemplate::Manual {
            ControlMode::Off
        } else {
            ControlMode::Auto
        };

        RequestSettings {
            capture_intent,
            control_mode,
            ae_mode: AE_MODE_ON,
            af_mode: AF_MODE_OFF,
            awb_mode: AWB_MODE_AUTO,
            target_fps_range: fps_range,
            ae_exposure_compensation: 0,
            jpeg_quality: 90,
            jpeg_thumbnail_size: (320, 240),
        }
    }
}

/// One unit of capture work submitted by the framework.
#[derive(Clone, Debug)]
pub struct CaptureRequest {
    /// Monotonically non-decreasing across a session.
    pub frame_number: u64,
    pub output_stream_ids: Vec<i32>,
    pub settings: RequestSettings,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::characteristics::{build_characteristics, CharacteristicsOptions};
    use crate::format::FourccFormat;
    use crate::node::FormatEntry;

    fn chars() -> StaticCharacteristics {
        build_characteristics(
            &[FormatEntry {
                format: FourccFormat::Yuy2,
                width: 640,
                height: 480,
                frame_rates: vec![30.0],
            }],
            &CharacteristicsOptions::default(),
            false,
        )
        .unwrap()
    }

    #[test]
    fn test_template_presets() {
        let chars = chars();
        let preview = RequestSettings::default_for_template(RequestTemplate::Preview, &chars);
        assert_eq!(preview.capture_intent, CaptureIntent::Preview);
        assert_eq!(preview.control_mode, ControlMode::Auto);
        assert_eq!(preview.target_fps_range, (30, 30));

        let manual = RequestSettings::default_for_template(RequestTemplate::Manual, &chars);
        assert_eq!(manual.capture_intent, CaptureIntent::Manual);
        assert_eq!(manual.control_mode, ControlMode::Off);
    }
}
