// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

/// 检测系统 (Detection System)
///
/// - PersonCounter:    单帧 → 人数 (外部能力, 黑盒)
/// - DetectionAdapter: 逐帧/批量调用, 单帧失败记 0 不中断
pub mod adapter;

pub use adapter::DetectionAdapter;

use image::DynamicImage;

/// 人数检测能力
///
/// 只统计 person 类; `confidence` 为本次调用的置信度阈值。
pub trait PersonCounter {
    fn count_people(&mut self, frame: &DynamicImage, confidence: f32) -> anyhow::Result<usize>;
}

impl<T: PersonCounter + ?Sized> PersonCounter for Box<T> {
    fn count_people(&mut self, frame: &DynamicImage, confidence: f32) -> anyhow::Result<usize> {
        (**self).count_people(frame, confidence)
    }
}
