// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

/// 帧采集系统 (Frame Acquisition)
///
/// 从媒体代理拉取一个回放窗口内按时间采样的帧序列:
/// - SnapshotStrategy: 主策略, 逐张请求回放快照
/// - StreamStrategy:   降级策略, 解码实时视频流并按间隔抽帧
///
/// 两个策略都拿不到帧时返回 `Acquisition::Empty`, 调用方跳过该摄像头。
pub mod decode_filter;
pub mod locator;
pub mod snapshot;
pub mod stream;

use std::sync::Arc;

use image::DynamicImage;
use tracing::{info, warn};

use crate::config::{CameraConfig, PlaybackConfig};
use crate::error::{AcquireError, ErrorKind};
use crate::metrics::MetricsSink;
use crate::types::TimeWindow;

pub use decode_filter::SamplingFilter;
pub use snapshot::SnapshotStrategy;
pub use stream::StreamStrategy;

/// 解码后的一帧
pub type Frame = DynamicImage;

/// 流帧率缺失或异常时使用的默认值
pub const DEFAULT_STREAM_FPS: f64 = 25.0;
/// 超过该值的帧率视为异常
pub const MAX_SANE_FPS: f64 = 60.0;
/// 目标帧数算出来 <= 0 时的保底值
pub const MIN_TARGET_FRAMES: usize = 30;

/// 采集结果
#[derive(Debug)]
pub enum Acquisition {
    Frames {
        frames: Vec<Frame>,
        strategy: &'static str,
    },
    Empty,
}

impl Acquisition {
    pub fn len(&self) -> usize {
        match self {
            Acquisition::Frames { frames, .. } => frames.len(),
            Acquisition::Empty => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn into_frames(self) -> Vec<Frame> {
        match self {
            Acquisition::Frames { frames, .. } => frames,
            Acquisition::Empty => Vec::new(),
        }
    }
}

/// 单个采集策略
pub trait AcquisitionStrategy: Send {
    fn name(&self) -> &'static str;

    /// 失败时记入 errors_total 的类别
    fn error_kind(&self) -> ErrorKind;

    /// `Ok` 可能为空; `Err` 表示策略整体失败
    fn acquire(&self, camera: &CameraConfig, window: &TimeWindow)
        -> Result<Vec<Frame>, AcquireError>;
}

/// 调度器看到的采集接口
pub trait FrameSource {
    fn fetch(&mut self, camera: &CameraConfig, window: &TimeWindow) -> Acquisition;
}

/// 主策略 + 降级策略
pub struct FrameAcquirer {
    primary: Box<dyn AcquisitionStrategy>,
    fallback: Box<dyn AcquisitionStrategy>,
    metrics: Arc<dyn MetricsSink>,
}

impl FrameAcquirer {
    /// 快照 → 视频流
    pub fn from_config(
        config: &PlaybackConfig,
        metrics: Arc<dyn MetricsSink>,
    ) -> Result<Self, native_tls::Error> {
        Ok(Self::with_strategies(
            Box::new(SnapshotStrategy::new(config)?),
            Box::new(StreamStrategy::new(config)),
            metrics,
        ))
    }

    pub fn with_strategies(
        primary: Box<dyn AcquisitionStrategy>,
        fallback: Box<dyn AcquisitionStrategy>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            primary,
            fallback,
            metrics,
        }
    }

    fn run_strategy(
        strategy: &dyn AcquisitionStrategy,
        metrics: &dyn MetricsSink,
        camera: &CameraConfig,
        window: &TimeWindow,
    ) -> Vec<Frame> {
        match strategy.acquire(camera, window) {
            Ok(frames) => {
                if frames.is_empty() {
                    warn!(camera_id = %camera.camera_id, strategy = strategy.name(), "⚠️ 未获取到任何帧");
                }
                frames
            }
            Err(e) => {
                warn!(camera_id = %camera.camera_id, strategy = strategy.name(), error = %e, "⚠️ 采集策略失败");
                metrics.inc_error(&camera.camera_id, strategy.error_kind());
                Vec::new()
            }
        }
    }
}

impl FrameSource for FrameAcquirer {
    fn fetch(&mut self, camera: &CameraConfig, window: &TimeWindow) -> Acquisition {
        let frames = Self::run_strategy(self.primary.as_ref(), self.metrics.as_ref(), camera, window);
        if !frames.is_empty() {
            return Acquisition::Frames {
                frames,
                strategy: self.primary.name(),
            };
        }

        info!(camera_id = %camera.camera_id, "🔄 降级到 {} 模式", self.fallback.name());
        let frames = Self::run_strategy(self.fallback.as_ref(), self.metrics.as_ref(), camera, window);
        if !frames.is_empty() {
            return Acquisition::Frames {
                frames,
                strategy: self.fallback.name(),
            };
        }

        Acquisition::Empty
    }
}

/// 目标帧数 = min(时长 × 采样帧率, 上限); 计算值 <= 0 时取 min(30, 上限)
pub fn target_frame_count(duration_secs: f64, sampling_fps: f64, cap: usize) -> usize {
    let computed = (duration_secs * sampling_fps).floor();
    if !computed.is_finite() || computed <= 0.0 {
        MIN_TARGET_FRAMES.min(cap)
    } else {
        (computed as usize).min(cap)
    }
}

/// 流报告的帧率 → 实际用于计算间隔的帧率
pub fn effective_fps(reported: Option<f64>) -> f64 {
    match reported {
        Some(fps) if fps > 0.0 && fps <= MAX_SANE_FPS => fps,
        _ => DEFAULT_STREAM_FPS,
    }
}

/// 抽帧间隔 = max(1, round(fps / sampling_fps))
pub fn sampling_interval(fps: f64, sampling_fps: f64) -> usize {
    let ratio = (fps / sampling_fps).round();
    if ratio.is_finite() && ratio >= 1.0 {
        ratio as usize
    } else {
        1
    }
}
