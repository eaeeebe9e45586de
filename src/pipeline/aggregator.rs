// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

//! 窗口聚合 (Window aggregator)

use crate::types::WindowStats;

/// 逐帧人数 → max / min / avg / 帧数; 空输入全为 0
pub fn aggregate(counts: &[u32]) -> WindowStats {
    if counts.is_empty() {
        return WindowStats::default();
    }

    let max_people = counts.iter().copied().max().unwrap_or(0);
    let min_people = counts.iter().copied().min().unwrap_or(0);
    let sum: u64 = counts.iter().map(|&c| c as u64).sum();

    WindowStats {
        max_people,
        avg_people: sum as f64 / counts.len() as f64,
        min_people,
        frames_processed: counts.len(),
    }
}
