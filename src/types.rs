// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

//! 领域模型 (Domain model)

use chrono::{DateTime, TimeDelta, Utc};

/// 结果来源类型 (固定值)
pub const SOURCE_TYPE: &str = "playback";

/// 回放时间窗口 `[start, end)`, UTC, 整秒
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeWindow {
    pub fn duration(&self) -> TimeDelta {
        self.end - self.start
    }

    /// 窗口时长 (秒, 可含小数)
    pub fn duration_secs(&self) -> f64 {
        self.duration().num_milliseconds() as f64 / 1000.0
    }
}

/// 逐帧人数的统计量
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct WindowStats {
    pub max_people: u32,
    pub avg_people: f64,
    pub min_people: u32,
    pub frames_processed: usize,
}

/// 单个摄像头单个窗口的分析结果
#[derive(Debug, Clone, PartialEq)]
pub struct WindowResult {
    pub camera_id: String,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub max_people: u32,
    pub avg_people: f64,
    pub min_people: u32,
    pub frames_processed: usize,
    pub sampling_fps: f64,
    pub source_type: &'static str,
    /// 原始逐帧人数, 长度 == frames_processed
    pub frame_counts: Vec<u32>,
}

impl WindowResult {
    pub fn new(
        camera_id: impl Into<String>,
        window: TimeWindow,
        sampling_fps: f64,
        stats: WindowStats,
        frame_counts: Vec<u32>,
    ) -> Self {
        debug_assert_eq!(stats.frames_processed, frame_counts.len());
        Self {
            camera_id: camera_id.into(),
            window_start: window.start,
            window_end: window.end,
            max_people: stats.max_people,
            avg_people: stats.avg_people,
            min_people: stats.min_people,
            frames_processed: stats.frames_processed,
            sampling_fps,
            source_type: SOURCE_TYPE,
            frame_counts,
        }
    }
}
