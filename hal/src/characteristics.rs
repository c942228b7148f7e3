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

//! Static capability metadata computed once from the format tables a device
//! node advertises.

use std::collections::{BTreeMap, BTreeSet};

use anyhow::{bail, Result};

use crate::format::{direct_hal_format, FourccFormat, HalPixelFormat};
use crate::node::FormatEntry;
use util::time::NANOSECONDS_PER_SECOND;

pub const LENS_FACING_FRONT: u8 = 0;
pub const LENS_FACING_BACK: u8 = 1;
pub const LENS_FACING_EXTERNAL: u8 = 2;

pub const HARDWARE_LEVEL_LIMITED: u8 = 0;
pub const HARDWARE_LEVEL_FULL: u8 = 1;
pub const HARDWARE_LEVEL_EXTERNAL: u8 = 2;

pub const AF_MODE_OFF: u8 = 0;
pub const AE_MODE_ON: u8 = 1;
pub const AWB_MODE_AUTO: u8 = 1;

pub const REQUEST_CAPABILITY_BACKWARD_COMPATIBLE: u8 = 0;

pub const TIMESTAMP_SOURCE_UNKNOWN: u8 = 0;
pub const TIMESTAMP_SOURCE_REALTIME: u8 = 1;

pub const SYNC_MAX_LATENCY_PER_FRAME_CONTROL: i32 = 0;
pub const SYNC_MAX_LATENCY_UNKNOWN: i32 = -1;

/// Well-known characteristic keys.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Tag {
    LensFacing,
    SensorOrientation,
    HardwareLevel,
    StreamConfigurations,
    MinFrameDurations,
    StallDurations,
    ActiveArraySize,
    PixelArraySize,
    AeAvailableModes,
    AeTargetFpsRanges,
    AfAvailableModes,
    AwbAvailableModes,
    JpegThumbnailSizes,
    MaxNumOutputStreams,
    RequestCapabilities,
    PartialResultCount,
    PipelineMaxDepth,
    SyncMaxLatency,
    TimestampSource,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Rect {
    pub left: i32,
    pub top: i32,
    pub width: i32,
    pub height: i32,
}

/// One advertised output stream configuration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StreamConfig {
    pub format: HalPixelFormat,
    pub width: u32,
    pub height: u32,
}

/// Per-configuration duration in nanoseconds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DurationEntry {
    pub format: HalPixelFormat,
    pub width: u32,
    pub height: u32,
    pub duration_ns: i64,
}

#[derive(Clone, Debug)]
pub enum TagValue {
    U8s(Vec<u8>),
    I32s(Vec<i32>),
    Rect(Rect),
    StreamConfigs(Vec<StreamConfig>),
    Durations(Vec<DurationEntry>),
    FpsRanges(Vec<(i32, i32)>),
    Sizes(Vec<(u32, u32)>),
}

/// Immutable mapping from characteristic keys to typed values, built once at
/// device construction.
#[derive(Clone, Debug)]
pub struct StaticCharacteristics {
    entries: BTreeMap<Tag, TagValue>,
}

impl StaticCharacteristics {
    pub fn get(&self, tag: Tag) -> Option<&TagValue> {
        self.entries.get(&tag)
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    pub fn stream_configs(&self) -> &[StreamConfig] {
        match self.entries.get(&Tag::StreamConfigurations) {
            Some(TagValue::StreamConfigs(v)) => v,
            _ => &[],
        }
    }

    pub fn supports_config(&self, format: HalPixelFormat, width: u32, height: u32) -> bool {
        self.stream_configs()
            .iter()
            .any(|c| c.format == format && c.width == width && c.height == height)
    }

    fn duration(&self, tag: Tag, format: HalPixelFormat, width: u32, height: u32) -> Option<i64> {
        match self.entries.get(&tag) {
            Some(TagValue::Durations(v)) => v
                .iter()
                .find(|d| d.format == format && d.width == width && d.height == height)
                .map(|d| d.duration_ns),
            _ => None,
        }
    }

    pub fn min_frame_duration(
        &self,
        format: HalPixelFormat,
        width: u32,
        height: u32,
    ) -> Option<i64> {
        self.duration(Tag::MinFrameDurations, format, width, height)
    }

    pub fn stall_duration(&self, format: HalPixelFormat, width: u32, height: u32) -> Option<i64> {
        self.duration(Tag::StallDurations, format, width, height)
    }

    pub fn ae_fps_ranges(&self) -> Vec<(i32, i32)> {
        match self.entries.get(&Tag::AeTargetFpsRanges) {
            Some(TagValue::FpsRanges(v)) => v.clone(),
            _ => Vec::new(),
        }
    }

    pub fn active_array(&self) -> Rect {
        match self.entries.get(&Tag::ActiveArraySize) {
            Some(TagValue::Rect(r)) => *r,
            _ => Rect::default(),
        }
    }

    pub fn pipeline_max_depth(&self) -> u8 {
        match self.entries.get(&Tag::PipelineMaxDepth) {
            Some(TagValue::U8s(v)) if !v.is_empty() => v[0],
            _ => 4,
        }
    }

    pub fn partial_result_count(&self) -> u32 {
        match self.entries.get(&Tag::PartialResultCount) {
            Some(TagValue::I32s(v)) if !v.is_empty() => v[0] as u32,
            _ => 1,
        }
    }
}

/// Knobs that are host policy rather than device introspection.
#[derive(Clone, Debug)]
pub struct CharacteristicsOptions {
    pub lens_facing: u8,
    pub sensor_orientation: i32,
    pub pipeline_depth: u8,
}

impl Default for CharacteristicsOptions {
    fn default() -> Self {
        Self {
            lens_facing: LENS_FACING_EXTERNAL,
            sensor_orientation: 0,
            pipeline_depth: 4,
        }
    }
}

/// Build the static characteristics from the enumerated format table.
///
/// Beyond the directly mapped formats, every MJPEG size is advertised as a
/// BLOB stream and as a decoder-backed flexible 4:2:0 stream, and every YUY2
/// size as a conversion-backed flexible 4:2:0 stream.
pub fn build_characteristics(
    formats: &[FormatEntry],
    opts: &CharacteristicsOptions,
    mjpeg_decodable: bool,
) -> Result<StaticCharacteristics> {
    if formats.is_empty() {
        bail!("Device advertises no formats");
    }
    let depth = opts.pipeline_depth.max(3);

    // Accumulate the best fps per advertised (format, w, h) so that the
    // duration tables stay aligned with the configuration table.
    let mut max_fps: BTreeMap<(HalPixelFormat, u32, u32), f32> = BTreeMap::new();
    let mut ordered: Vec<(HalPixelFormat, u32, u32)> = Vec::new();
    let mut add_config = |format: HalPixelFormat, width: u32, height: u32, fps: f32| {
        let key = (format, width, height);
        match max_fps.get_mut(&key) {
            Some(cur) => {
                if fps > *cur {
                    *cur = fps;
                }
            }
            None => {
                max_fps.insert(key, fps);
                ordered.push(key);
            }
        }
    };

    for entry in formats {
        let fps = entry.max_fps();
        if fps <= 0.0 {
            continue;
        }
        if let Some(hal_fmt) = direct_hal_format(entry.format) {
            add_config(hal_fmt, entry.width, entry.height, fps);
        }
        match entry.format {
            FourccFormat::Mjpg => {
                add_config(HalPixelFormat::Blob, entry.width, entry.height, fps);
                if mjpeg_decodable {
                    add_config(HalPixelFormat::YCbCr420Flex, entry.width, entry.height, fps);
                }
            }
            FourccFormat::Yuy2 => {
                add_config(HalPixelFormat::YCbCr420Flex, entry.width, entry.height, fps);
            }
            _ => {}
        }
    }
    if ordered.is_empty() {
        bail!("No enumerated format maps to an output configuration");
    }

    let mut configs = Vec::new();
    let mut min_durations = Vec::new();
    let mut stall_durations = Vec::new();
    let mut fps_ranges: Vec<(i32, i32)> = Vec::new();
    for key in &ordered {
        let (format, width, height) = *key;
        let fps = max_fps[key];
        configs.push(StreamConfig {
            format,
            width,
            height,
        });
        min_durations.push(DurationEntry {
            format,
            width,
            height,
            duration_ns: (NANOSECONDS_PER_SECOND as f64 / fps as f64) as i64,
        });
        stall_durations.push(DurationEntry {
            format,
            width,
            height,
            duration_ns: 0,
        });
        if format == HalPixelFormat::YCbCr420Flex {
            let fps = fps.round() as i32;
            if !fps_ranges.contains(&(fps, fps)) {
                fps_ranges.push((fps, fps));
            }
        }
    }
    if fps_ranges.is_empty() {
        fps_ranges.push((15, 30));
    }

    let max_width = formats.iter().map(|f| f.width).max().unwrap_or(640);
    let max_height = formats.iter().map(|f| f.height).max().unwrap_or(480);

    let mut entries = BTreeMap::new();
    entries.insert(Tag::LensFacing, TagValue::U8s(vec![opts.lens_facing]));
    entries.insert(
        Tag::SensorOrientation,
        TagValue::I32s(vec![opts.sensor_orientation]),
    );
    entries.insert(
        Tag::HardwareLevel,
        TagValue::U8s(vec![HARDWARE_LEVEL_LIMITED]),
    );
    entries.insert(Tag::StreamConfigurations, TagValue::StreamConfigs(configs));
    entries.insert(Tag::MinFrameDurations, TagValue::Durations(min_durations));
    entries.insert(Tag::StallDurations, TagValue::Durations(stall_durations));
    entries.insert(
        Tag::ActiveArraySize,
        TagValue::Rect(Rect {
            left: 0,
            top: 0,
            width: max_width as i32,
            height: max_height as i32,
        }),
    );
    entries.insert(
        Tag::PixelArraySize,
        TagValue::Sizes(vec![(max_width, max_height)]),
    );
    entries.insert(Tag::AeAvailableModes, TagValue::U8s(vec![AE_MODE_ON]));
    entries.insert(Tag::AeTargetFpsRanges, TagValue::FpsRanges(fps_ranges));
    entries.insert(Tag::AfAvailableModes, TagValue::U8s(vec![AF_MODE_OFF]));
    entries.insert(Tag::AwbAvailableModes, TagValue::U8s(vec![AWB_MODE_AUTO]));
    entries.insert(
        Tag::JpegThumbnailSizes,
        TagValue::Sizes(vec![(0, 0), (160, 120), (320, 240)]),
    );
    entries.insert(Tag::MaxNumOutputStreams, TagValue::I32s(vec![0, 1, 1]));
    entries.insert(
        Tag::RequestCapabilities,
        TagValue::U8s(vec![REQUEST_CAPABILITY_BACKWARD_COMPATIBLE]),
    );
    entries.insert(Tag::PartialResultCount, TagValue::I32s(vec![1]));
    entries.insert(Tag::PipelineMaxDepth, TagValue::U8s(vec![depth]));
    entries.insert(
        Tag::SyncMaxLatency,
        TagValue::I32s(vec![SYNC_MAX_LATENCY_PER_FRAME_CONTROL]),
    );
    entries.insert(
        Tag::TimestampSource,
        TagValue::U8s(vec![TIMESTAMP_SOURCE_UNKNOWN]),
    );

    let chars = StaticCharacteristics { entries };
    verify_duration_coverage(&chars)?;
    Ok(chars)
}

/// Every advertised configuration must carry both duration entries.
fn verify_duration_coverage(chars: &StaticCharacteristics) -> Result<()> {
    let config_keys: BTreeSet<(u32, u32, String)> = chars
        .stream_configs()
        .iter()
        .map(|c| (c.width, c.height, format!("{:?}", c.format)))
        .collect();
    for tag in [Tag::MinFrameDurations, Tag::StallDurations] {
        let keys: BTreeSet<(u32, u32, String)> = match chars.get(tag) {
            Some(TagValue::Durations(v)) => v
                .iter()
                .map(|d| (d.width, d.height, format!("{:?}", d.format)))
                .collect(),
            _ => BTreeSet::new(),
        };
        if keys != config_keys {
            bail!("Duration table {:?} does not cover the configuration table", tag);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_formats() -> Vec<FormatEntry> {
        vec![
            FormatEntry {
                format: FourccFormat::Yuy2,
                width: 640,
                height: 480,
                frame_rates: vec![15.0, 30.0],
            },
            FormatEntry {
                format: FourccFormat::Mjpg,
                width: 1920,
                height: 1080,
                frame_rates: vec![30.0],
            },
        ]
    }

    #[test]
    fn test_derivation_rules() {
        let chars =
            build_characteristics(&sample_formats(), &CharacteristicsOptions::default(), true)
                .unwrap();

        // Direct mapping plus the conversion-backed virtual entries.
        assert!(chars.supports_config(HalPixelFormat::YCbCr422I, 640, 480));
        assert!(chars.supports_config(HalPixelFormat::YCbCr420Flex, 640, 480));
        assert!(chars.supports_config(HalPixelFormat::Blob, 1920, 1080));
        assert!(chars.supports_config(HalPixelFormat::YCbCr420Flex, 1920, 1080));
        assert!(!chars.supports_config(HalPixelFormat::YCbCr422I, 1920, 1080));

        // Min frame duration follows the highest rate; stall is zero.
        assert_eq!(
            chars.min_frame_duration(HalPixelFormat::YCbCr420Flex, 640, 480),
            Some((1e9 / 30.0) as i64)
        );
        assert_eq!(
            chars.stall_duration(HalPixelFormat::Blob, 1920, 1080),
            Some(0)
        );

        // AE ranges come from the flexible 4:2:0 entries only.
        let ranges = chars.ae_fps_ranges();
        assert!(ranges.contains(&(30, 30)));

        // Active array spans the largest enumerated geometry.
        let rect = chars.active_array();
        assert_eq!((rect.width, rect.height), (1920, 1080));
    }

    #[test]
    fn test_no_decoder_drops_virtual_mjpeg_entry() {
        let chars =
            build_characteristics(&sample_formats(), &CharacteristicsOptions::default(), false)
                .unwrap();
        assert!(chars.supports_config(HalPixelFormat::Blob, 1920, 1080));
        assert!(!chars.supports_config(HalPixelFormat::YCbCr420Flex, 1920, 1080));
    }

    #[test]
    fn test_duration_tables_cover_configs() {
        let chars =
            build_characteristics(&sample_formats(), &CharacteristicsOptions::default(), true)
                .unwrap();
        for cfg in chars.stream_configs() {
            assert!(chars
                .min_frame_duration(cfg.format, cfg.width, cfg.height)
                .is_some());
            assert!(chars
                .stall_duration(cfg.format, cfg.width, cfg.height)
                .is_some());
        }
    }

    #[test]
    fn test_required_tags_present() {
        let chars =
            build_characteristics(&sample_formats(), &CharacteristicsOptions::default(), true)
                .unwrap();
        for tag in [
            Tag::LensFacing,
            Tag::SensorOrientation,
            Tag::HardwareLevel,
            Tag::StreamConfigurations,
            Tag::MinFrameDurations,
            Tag::StallDurations,
            Tag::ActiveArraySize,
            Tag::AeTargetFpsRanges,
            Tag::AfAvailableModes,
            Tag::AwbAvailableModes,
            Tag::JpegThumbnailSizes,
            Tag::RequestCapabilities,
            Tag::PartialResultCount,
            Tag::PipelineMaxDepth,
            Tag::SyncMaxLatency,
            Tag::TimestampSource,
        ] {
            assert!(chars.get(tag).is_some(), "missing tag {:?}", tag);
        }
        assert_eq!(chars.partial_result_count(), 1);
        assert!(chars.pipeline_max_depth() >= 3);
    }

    #[test]
    fn test_empty_format_table_rejected() {
        assert!(build_characteristics(&[], &CharacteristicsOptions::default(), true).is_err());
    }
}
