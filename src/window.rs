// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

//! 时间窗口计算 (Time Window Calculator)
//!
//! end = now − delay, start = end − window_duration, 均截断到整秒。

use chrono::{DateTime, DurationRound, TimeDelta, Utc};

use crate::config::PlaybackConfig;
use crate::types::TimeWindow;

/// 回放 URL 时间格式: `YYYYMMDDtHHMMSSz` (小写 t/z 为字面量, 不带时区偏移)
const PLAYBACK_TS_FORMAT: &str = "%Y%m%dt%H%M%Sz";

/// 计算当前周期的回放窗口
pub fn calculate_time_window(now: DateTime<Utc>, config: &PlaybackConfig) -> TimeWindow {
    // 先截断 now, 保证 end - start 恰好等于窗口时长
    let now = truncate_to_seconds(now);
    let end = now - config.delay();
    let start = end - config.window_duration();
    TimeWindow { start, end }
}

/// 回放 URL 中使用的时间戳
pub fn format_playback_timestamp(ts: DateTime<Utc>) -> String {
    ts.naive_utc().format(PLAYBACK_TS_FORMAT).to_string()
}

/// 后端 payload 中使用的 ISO-8601 UTC 时间 (末尾 Z)
pub fn format_iso_utc(ts: DateTime<Utc>) -> String {
    ts.format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

fn truncate_to_seconds(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.duration_trunc(TimeDelta::seconds(1)).unwrap_or(ts)
}
