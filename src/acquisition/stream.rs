// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

/// 视频流模式 (Stream mode)
///
/// 快照模式拿不到帧时使用: 通过代理的 `/api/stream.mp4` 打开实时源,
/// 解码后每 interval 帧保留一帧, 直到达到目标帧数或整体超时。
/// 帧率取自解码帧本身, 整个过程只有一个带 rw_timeout 的连接。
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError};
use ez_ffmpeg::core::context::null_output::create_null_output;
use ez_ffmpeg::filter::frame_pipeline_builder::FramePipelineBuilder;
use ez_ffmpeg::{AVMediaType, FfmpegContext, Input};
use tracing::{info, warn};

use super::decode_filter::SamplingFilter;
use super::{locator, target_frame_count, AcquisitionStrategy, Frame};
use crate::config::{CameraConfig, PlaybackConfig};
use crate::error::{AcquireError, ErrorKind};
use crate::types::TimeWindow;

/// 接收循环的轮询粒度
const POLL_INTERVAL: Duration = Duration::from_millis(500);

pub struct StreamStrategy {
    proxy_base: String,
    sampling_fps: f64,
    frame_cap: usize,
    io_timeout: Duration,
    fetch_timeout: Duration,
    verify_tls: bool,
}

impl StreamStrategy {
    pub fn new(config: &PlaybackConfig) -> Self {
        Self {
            proxy_base: config.proxy_base().to_string(),
            sampling_fps: config.sampling_fps,
            frame_cap: config.stream_frame_cap,
            io_timeout: config.snapshot_timeout(),
            fetch_timeout: config.fetch_timeout(),
            verify_tls: config.verify_ssl,
        }
    }

    /// 打开输入时的 AVOptions: 单次读写超时 (微秒) 与 TLS 校验
    fn input_opts(&self) -> Vec<(String, String)> {
        vec![
            (
                "rw_timeout".to_string(),
                self.io_timeout.as_micros().to_string(),
            ),
            (
                "tls_verify".to_string(),
                if self.verify_tls { "1" } else { "0" }.to_string(),
            ),
        ]
    }
}

/// 从通道收帧, 直到满 target、超过 deadline、解码结束或通道断开
pub(crate) fn collect_frames(
    rx: &Receiver<Frame>,
    target: usize,
    deadline: Instant,
    is_ended: impl Fn() -> bool,
) -> Vec<Frame> {
    let mut frames = Vec::with_capacity(target);
    while frames.len() < target {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            warn!("⏱️ 视频流超时, 已收到 {} 帧", frames.len());
            break;
        }
        match rx.recv_timeout(remaining.min(POLL_INTERVAL)) {
            Ok(frame) => frames.push(frame),
            Err(RecvTimeoutError::Timeout) => {
                if is_ended() {
                    break;
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    frames
}

impl AcquisitionStrategy for StreamStrategy {
    fn name(&self) -> &'static str {
        "stream"
    }

    fn error_kind(&self) -> ErrorKind {
        ErrorKind::StreamError
    }

    fn acquire(
        &self,
        camera: &CameraConfig,
        window: &TimeWindow,
    ) -> Result<Vec<Frame>, AcquireError> {
        let source = locator::live_locator(camera);
        let url = locator::stream_url(&self.proxy_base, &source);
        let target = target_frame_count(window.duration_secs(), self.sampling_fps, self.frame_cap);
        let started = Instant::now();
        info!(
            camera_id = %camera.camera_id,
            "🎬 视频流模式: 目标 {} 帧 | 采样 {} fps",
            target, self.sampling_fps
        );

        let (tx, rx) = crossbeam_channel::bounded::<Frame>(target.max(1));
        let filter = SamplingFilter::new(tx, self.sampling_fps, target);

        let pipe: FramePipelineBuilder = AVMediaType::AVMEDIA_TYPE_VIDEO.into();
        let pipe = pipe.filter("sample", Box::new(filter));
        let out = create_null_output().add_frame_pipeline(pipe);
        let input = Input::new(url).set_input_opts(self.input_opts());

        let ctx = FfmpegContext::builder()
            .input(input)
            .filter_desc("format=rgb24")
            .output(out)
            .build()
            .map_err(|e| AcquireError::Stream(format!("构建失败: {}", e)))?;
        let sch = ctx
            .start()
            .map_err(|e| AcquireError::Stream(format!("启动失败: {}", e)))?;

        let frames = collect_frames(&rx, target, started + self.fetch_timeout, || sch.is_ended());

        // 不等待解码线程自然结束
        sch.abort();

        if frames.is_empty() {
            warn!(camera_id = %camera.camera_id, "⚠️ 视频流未产出任何帧");
        } else {
            info!(
                camera_id = %camera.camera_id,
                "✅ 视频流获取 {} 帧, 耗时 {:.1}s",
                frames.len(),
                started.elapsed().as_secs_f64()
            );
        }
        Ok(frames)
    }
}
