// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

//! 检测适配器 (Detection adapter)
//! 职责: 帧序列 → 逐帧人数, 长度与顺序同输入

use std::sync::Arc;
use std::time::Instant;

use image::DynamicImage;
use tracing::{debug, warn};

use super::PersonCounter;
use crate::error::ErrorKind;
use crate::metrics::MetricsSink;

/// 每处理多少帧打印一次进度
const PROGRESS_EVERY: usize = 50;

pub struct DetectionAdapter<D> {
    detector: D,
    metrics: Arc<dyn MetricsSink>,
}

impl<D: PersonCounter> DetectionAdapter<D> {
    /// `detector` 必须已完成初始化 (模型加载 + 预热)
    pub fn new(detector: D, metrics: Arc<dyn MetricsSink>) -> Self {
        Self { detector, metrics }
    }

    /// 单帧人数; 检测失败返回 0 并计入 detection_error
    pub fn detect(&mut self, camera_id: &str, frame: &DynamicImage, confidence: f32) -> u32 {
        let t = Instant::now();
        let result = self.detector.count_people(frame, confidence);
        self.metrics.observe_inference(camera_id, t.elapsed());

        match result {
            Ok(n) => u32::try_from(n).unwrap_or(u32::MAX),
            Err(e) => {
                warn!(camera_id, error = %e, "⚠️ 单帧检测失败, 记为 0");
                self.metrics.inc_error(camera_id, ErrorKind::DetectionError);
                0
            }
        }
    }

    /// 批量检测: 输出长度 == 输入长度
    pub fn detect_batch(
        &mut self,
        camera_id: &str,
        frames: &[DynamicImage],
        confidence: f32,
    ) -> Vec<u32> {
        let total = frames.len();
        let mut counts = Vec::with_capacity(total);
        for (i, frame) in frames.iter().enumerate() {
            counts.push(self.detect(camera_id, frame, confidence));
            if (i + 1) % PROGRESS_EVERY == 0 {
                debug!(camera_id, "检测进度 {}/{}", i + 1, total);
            }
        }
        self.metrics.inc_frames(camera_id, total as u64);
        counts
    }

    pub fn detector_mut(&mut self) -> &mut D {
        &mut self.detector
    }
}
