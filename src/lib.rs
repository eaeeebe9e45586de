// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
pub mod acquisition; // 帧采集 (快照 → 视频流)
pub mod config; // 配置加载与校验
pub mod detection; // 人数检测能力 + 适配器
pub mod error; // 错误类型
pub mod health; // 健康检查 / 指标端点
pub mod http; // ureq 公共部分
pub mod metrics; // 指标能力
pub mod models; // 模型实现
pub mod ort_backend; // ONNX Runtime 后端
pub mod pipeline; // 回放处理流水线
pub mod reporter; // 后端上报
pub mod scheduler; // 周期调度
pub mod status; // 服务状态
pub mod types; // 领域模型
pub mod window; // 时间窗口

pub use crate::acquisition::{Acquisition, FrameAcquirer, FrameSource};
pub use crate::config::{AppConfig, Args, CameraConfig, PlaybackConfig, ServiceConfig};
pub use crate::detection::{DetectionAdapter, PersonCounter};
pub use crate::models::YoloPersonCounter;
pub use crate::ort_backend::{OrtBackend, OrtEP};
pub use crate::pipeline::{CameraOutcome, CameraStage, PlaybackProcessor};
pub use crate::reporter::{BackendReporter, ReportOutcome, ResultSink};
pub use crate::scheduler::{CycleRunner, CycleSummary, Scheduler, ShutdownToken};
pub use crate::status::{ServiceState, ServiceStatus};
pub use crate::types::{TimeWindow, WindowResult, WindowStats};

/// 按置信度降序保留, 与已保留框 IoU 超过阈值的丢弃
pub fn non_max_suppression(xs: &mut Vec<Bbox>, iou_threshold: f32) {
    xs.sort_by(|b1, b2| b2.confidence().total_cmp(&b1.confidence()));

    let mut current_index = 0;
    for index in 0..xs.len() {
        let mut drop = false;
        for prev_index in 0..current_index {
            let iou = xs[prev_index].iou(&xs[index]);
            if iou > iou_threshold {
                drop = true;
                break;
            }
        }
        if !drop {
            xs.swap(current_index, index);
            current_index += 1;
        }
    }
    xs.truncate(current_index);
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Bbox {
    // a bounding box around an object
    xmin: f32,
    ymin: f32,
    width: f32,
    height: f32,
    id: usize,
    confidence: f32,
}

impl Bbox {
    pub fn new(xmin: f32, ymin: f32, width: f32, height: f32, id: usize, confidence: f32) -> Self {
        Self {
            xmin,
            ymin,
            width,
            height,
            id,
            confidence,
        }
    }

    pub fn width(&self) -> f32 {
        self.width
    }

    pub fn height(&self) -> f32 {
        self.height
    }

    pub fn xmin(&self) -> f32 {
        self.xmin
    }

    pub fn ymin(&self) -> f32 {
        self.ymin
    }

    pub fn xmax(&self) -> f32 {
        self.xmin + self.width
    }

    pub fn ymax(&self) -> f32 {
        self.ymin + self.height
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn confidence(&self) -> f32 {
        self.confidence
    }

    pub fn area(&self) -> f32 {
        self.width * self.height
    }

    pub fn intersection_area(&self, another: &Bbox) -> f32 {
        let l = self.xmin.max(another.xmin);
        let r = self.xmax().min(another.xmax());
        let t = self.ymin.max(another.ymin);
        let b = self.ymax().min(another.ymax());
        (r - l).max(0.) * (b - t).max(0.)
    }

    pub fn union(&self, another: &Bbox) -> f32 {
        self.area() + another.area() - self.intersection_area(another)
    }

    pub fn iou(&self, another: &Bbox) -> f32 {
        let union = self.union(another);
        if union <= 0. {
            0.
        } else {
            self.intersection_area(another) / union
        }
    }
}
