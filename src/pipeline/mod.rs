// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

/// 回放处理流水线 (Playback Processing Pipeline)
///
/// 每个摄像头每个周期走一遍:
/// COMPUTE_WINDOW → ACQUIRE_FRAMES → DETECT → AGGREGATE → REPORT → DONE
///
/// 任一阶段失败直接跳到 DONE, 只影响当前摄像头。
/// 单个摄像头内的 panic 也被截获并记为 processing_error。
pub mod aggregator;

pub use aggregator::aggregate;

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use tracing::{error, info, warn};

use crate::acquisition::{Acquisition, FrameSource};
use crate::config::{AppConfig, CameraConfig, PlaybackConfig};
use crate::detection::{DetectionAdapter, PersonCounter};
use crate::error::ErrorKind;
use crate::metrics::MetricsSink;
use crate::reporter::{ReportOutcome, ResultSink};
use crate::scheduler::{panic_message, CycleRunner, CycleSummary, ShutdownToken};
use crate::status::ServiceStatus;
use crate::types::WindowResult;
use crate::window::calculate_time_window;

/// 单摄像头处理阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CameraStage {
    ComputeWindow,
    AcquireFrames,
    Detect,
    Aggregate,
    Report,
    Done,
}

impl fmt::Display for CameraStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CameraStage::ComputeWindow => "COMPUTE_WINDOW",
            CameraStage::AcquireFrames => "ACQUIRE_FRAMES",
            CameraStage::Detect => "DETECT",
            CameraStage::Aggregate => "AGGREGATE",
            CameraStage::Report => "REPORT",
            CameraStage::Done => "DONE",
        };
        f.write_str(s)
    }
}

/// 单摄像头处理结果
#[derive(Debug, Clone, PartialEq)]
pub enum CameraOutcome {
    /// 完成聚合 (上报成功与否见 report)
    Completed {
        result: WindowResult,
        report: ReportOutcome,
    },
    /// 在 stage 阶段放弃
    Skipped { stage: CameraStage, reason: String },
    /// 在 stage 阶段 panic, 已截获
    Panicked { stage: CameraStage, reason: String },
}

impl CameraOutcome {
    pub fn result(&self) -> Option<&WindowResult> {
        match self {
            CameraOutcome::Completed { result, .. } => Some(result),
            CameraOutcome::Skipped { .. } | CameraOutcome::Panicked { .. } => None,
        }
    }
}

/// 回放处理器: 采集 → 检测 → 聚合 → 上报
pub struct PlaybackProcessor<S, D, R> {
    playback: PlaybackConfig,
    default_confidence: f32,
    legacy_payload: bool,
    cameras: Vec<CameraConfig>,
    source: S,
    detector: DetectionAdapter<D>,
    sink: R,
    metrics: Arc<dyn MetricsSink>,
    status: ServiceStatus,
    clock: fn() -> DateTime<Utc>,
    stage: CameraStage,
}

impl<S, D, R> PlaybackProcessor<S, D, R>
where
    S: FrameSource,
    D: PersonCounter,
    R: ResultSink,
{
    pub fn new(
        config: &AppConfig,
        source: S,
        detector: D,
        sink: R,
        metrics: Arc<dyn MetricsSink>,
        status: ServiceStatus,
    ) -> Self {
        Self {
            playback: config.playback.clone(),
            default_confidence: config.service.confidence,
            legacy_payload: config.service.legacy_payload,
            cameras: config.enabled_cameras(),
            source,
            detector: DetectionAdapter::new(detector, metrics.clone()),
            sink,
            metrics,
            status,
            clock: Utc::now,
            stage: CameraStage::Done,
        }
    }

    /// 替换时钟 (每个摄像头开始时取一次当前时间)
    pub fn with_clock(mut self, clock: fn() -> DateTime<Utc>) -> Self {
        self.clock = clock;
        self
    }

    pub fn cameras(&self) -> &[CameraConfig] {
        &self.cameras
    }

    /// 处理单个摄像头
    pub fn process_camera(&mut self, camera: &CameraConfig, now: DateTime<Utc>) -> CameraOutcome {
        let id = camera.camera_id.as_str();

        // COMPUTE_WINDOW
        self.stage = CameraStage::ComputeWindow;
        let window = calculate_time_window(now, &self.playback);
        if window.start >= window.end {
            self.metrics.inc_error(id, ErrorKind::ProcessingError);
            return CameraOutcome::Skipped {
                stage: CameraStage::ComputeWindow,
                reason: format!("无效窗口 {} → {}", window.start, window.end),
            };
        }
        info!(
            camera_id = id,
            "🎥 处理回放窗口 {} → {} UTC",
            window.start.format("%Y-%m-%d %H:%M:%S"),
            window.end.format("%H:%M:%S")
        );

        // ACQUIRE_FRAMES
        self.stage = CameraStage::AcquireFrames;
        let t = Instant::now();
        let acquisition = self.source.fetch(camera, &window);
        self.metrics.observe_fetch(id, t.elapsed());
        let strategy = match &acquisition {
            Acquisition::Frames { strategy, .. } => *strategy,
            Acquisition::Empty => {
                warn!(camera_id = id, "⚠️ 没有获取到帧, 跳过本窗口");
                self.metrics.inc_error(id, ErrorKind::NoFrames);
                return CameraOutcome::Skipped {
                    stage: CameraStage::AcquireFrames,
                    reason: "no frames".into(),
                };
            }
        };
        let frames = acquisition.into_frames();

        // DETECT
        self.stage = CameraStage::Detect;
        let confidence = camera.effective_confidence(self.default_confidence);
        info!(camera_id = id, "🔍 对 {} 帧运行检测 ({}, conf {:.2})", frames.len(), strategy, confidence);
        let t = Instant::now();
        let counts = self.detector.detect_batch(id, &frames, confidence);
        let detect_secs = t.elapsed().as_secs_f64();
        drop(frames);

        // AGGREGATE
        self.stage = CameraStage::Aggregate;
        let stats = aggregate(&counts);
        let result = WindowResult::new(id, window, self.playback.sampling_fps, stats, counts);
        info!(
            camera_id = id,
            "📊 帧数 {} | 最大 {} | 平均 {:.1} | 最小 {} | 检测耗时 {:.1}s",
            result.frames_processed,
            result.max_people,
            result.avg_people,
            result.min_people,
            detect_secs
        );
        self.metrics.observe_window(id, &result);

        // REPORT
        self.stage = CameraStage::Report;
        let report = self.sink.send(&result);
        if self.legacy_payload {
            self.sink.send_simple(id, result.max_people, (self.clock)());
        }
        self.stage = CameraStage::Done;

        CameraOutcome::Completed { result, report }
    }

    /// 按配置顺序处理所有启用的摄像头; 每个摄像头结束后检查退出标志
    pub fn process_all_cameras(&mut self, token: &ShutdownToken) -> Vec<CameraOutcome> {
        let cameras = self.cameras.clone();
        let mut outcomes = Vec::with_capacity(cameras.len());
        for (index, camera) in cameras.iter().enumerate() {
            let now = (self.clock)();
            let outcome = self.guarded_process_camera(camera, now);
            if let CameraOutcome::Skipped { stage, reason } = &outcome {
                info!(camera_id = %camera.camera_id, "⏭️ 跳过 (阶段 {}): {}", stage, reason);
            }
            outcomes.push(outcome);

            if token.is_cancelled() {
                let left = cameras.len() - index - 1;
                if left > 0 {
                    info!("🛑 收到退出信号, 剩余 {} 个摄像头不再处理", left);
                }
                break;
            }
        }
        outcomes
    }

    /// process_camera + panic 截获
    fn guarded_process_camera(&mut self, camera: &CameraConfig, now: DateTime<Utc>) -> CameraOutcome {
        self.stage = CameraStage::ComputeWindow;
        match panic::catch_unwind(AssertUnwindSafe(|| self.process_camera(camera, now))) {
            Ok(outcome) => outcome,
            Err(payload) => {
                let reason = panic_message(payload.as_ref());
                error!(camera_id = %camera.camera_id, stage = %self.stage, "💥 处理时发生 panic: {}", reason);
                self.metrics.inc_error(&camera.camera_id, ErrorKind::ProcessingError);
                CameraOutcome::Panicked {
                    stage: self.stage,
                    reason,
                }
            }
        }
    }
}

impl<S, D, R> CycleRunner for PlaybackProcessor<S, D, R>
where
    S: FrameSource,
    D: PersonCounter,
    R: ResultSink,
{
    /// 有摄像头 panic 时返回 Err, 调度器按退避时间重试
    fn run_cycle(&mut self, token: &ShutdownToken) -> anyhow::Result<CycleSummary> {
        let outcomes = self.process_all_cameras(token);

        let mut summary = CycleSummary::default();
        let mut panicked = 0usize;
        for outcome in &outcomes {
            match outcome {
                CameraOutcome::Completed { report, .. } => {
                    summary.processed += 1;
                    if report.success {
                        summary.reported += 1;
                    }
                }
                CameraOutcome::Skipped { .. } => summary.skipped += 1,
                CameraOutcome::Panicked { .. } => {
                    summary.skipped += 1;
                    panicked += 1;
                }
            }
        }

        self.status
            .record_cycle((self.clock)(), self.cameras.len(), summary.processed as u64);
        if panicked > 0 {
            anyhow::bail!(
                "{} 个摄像头处理时 panic (成功 {}, 跳过 {})",
                panicked,
                summary.processed,
                summary.skipped
            );
        }
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{NoopMetrics, PipelineMetrics};
    use crate::scheduler::Scheduler;
    use crate::types::TimeWindow;
    use std::time::Duration;
    use chrono::TimeZone;
    use image::DynamicImage;
    use std::collections::HashMap;

    /// 按 camera_id 返回预设帧 (帧宽度即人数)
    struct FakeSource {
        frames: HashMap<String, Vec<u32>>,
        seen: Vec<(String, TimeWindow)>,
        /// 取帧时触发退出 (模拟处理中收到信号)
        cancel_on_fetch: Option<ShutdownToken>,
    }

    impl FrameSource for FakeSource {
        fn fetch(&mut self, camera: &CameraConfig, window: &TimeWindow) -> Acquisition {
            self.seen.push((camera.camera_id.clone(), *window));
            if let Some(token) = &self.cancel_on_fetch {
                token.cancel();
            }
            match self.frames.get(&camera.camera_id) {
                Some(widths) if !widths.is_empty() => Acquisition::Frames {
                    frames: widths.iter().map(|&w| DynamicImage::new_rgb8(w, 1)).collect(),
                    strategy: "snapshot",
                },
                _ => Acquisition::Empty,
            }
        }
    }

    struct WidthCounter;

    impl PersonCounter for WidthCounter {
        fn count_people(&mut self, frame: &DynamicImage, _: f32) -> anyhow::Result<usize> {
            Ok(frame.width() as usize)
        }
    }

    #[derive(Default)]
    struct FakeSink {
        fail: bool,
        sent: Vec<WindowResult>,
        simple: Vec<(String, u32)>,
    }

    impl ResultSink for FakeSink {
        fn send(&mut self, result: &WindowResult) -> ReportOutcome {
            self.sent.push(result.clone());
            if self.fail {
                ReportOutcome::failed("HTTP 500")
            } else {
                ReportOutcome::ok()
            }
        }

        fn send_simple(&mut self, camera_id: &str, count: u32, _: DateTime<Utc>) -> ReportOutcome {
            self.simple.push((camera_id.to_string(), count));
            ReportOutcome::ok()
        }
    }

    fn camera(id: &str) -> CameraConfig {
        CameraConfig {
            camera_id: id.into(),
            host: "10.0.0.1".into(),
            port: 554,
            username: "admin".into(),
            password: String::new(),
            track_id: "201".into(),
            confidence: None,
            enabled: true,
        }
    }

    fn config(cameras: Vec<CameraConfig>) -> AppConfig {
        AppConfig {
            cameras,
            ..Default::default()
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 3, 12, 45, 0).unwrap()
    }

    fn processor(
        cfg: &AppConfig,
        frames: &[(&str, Vec<u32>)],
        sink: FakeSink,
        metrics: Arc<dyn MetricsSink>,
    ) -> PlaybackProcessor<FakeSource, WidthCounter, FakeSink> {
        let source = FakeSource {
            frames: frames
                .iter()
                .map(|(id, w)| (id.to_string(), w.clone()))
                .collect(),
            seen: Vec::new(),
            cancel_on_fetch: None,
        };
        PlaybackProcessor::new(cfg, source, WidthCounter, sink, metrics, ServiceStatus::new())
            .with_clock(now)
    }

    fn running() -> ShutdownToken {
        ShutdownToken::new()
    }

    #[test]
    fn test_counts_aggregate_into_window_result() {
        let cfg = config(vec![camera("cam-1")]);
        let mut p = processor(&cfg, &[("cam-1", vec![2, 3, 1, 4, 2])], FakeSink::default(), Arc::new(NoopMetrics));

        let outcome = p.process_camera(&camera("cam-1"), now());
        let result = outcome.result().unwrap();
        assert_eq!(result.max_people, 4);
        assert_eq!(result.min_people, 1);
        assert!((result.avg_people - 2.4).abs() < 1e-9);
        assert_eq!(result.frames_processed, 5);
        assert_eq!(result.frame_counts, vec![2, 3, 1, 4, 2]);
        assert_eq!(result.source_type, "playback");
        assert_eq!(result.window_end, Utc.with_ymd_and_hms(2026, 2, 3, 12, 44, 0).unwrap());
        assert_eq!(p.sink.sent.len(), 1);
    }

    #[test]
    fn test_empty_camera_is_skipped_and_next_proceeds() {
        let cfg = config(vec![camera("dark"), camera("lit")]);
        let metrics = Arc::new(PipelineMetrics::new());
        let mut p = processor(&cfg, &[("lit", vec![1, 2])], FakeSink::default(), metrics.clone());

        let outcomes = p.process_all_cameras(&running());
        assert_eq!(outcomes.len(), 2);
        assert!(matches!(
            outcomes[0],
            CameraOutcome::Skipped { stage: CameraStage::AcquireFrames, .. }
        ));
        assert_eq!(outcomes[1].result().unwrap().camera_id, "lit");

        // 只有成功的摄像头被上报
        assert_eq!(p.sink.sent.len(), 1);
        let order: Vec<&str> = p.source.seen.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(order, vec!["dark", "lit"]);

        let text = metrics.render().unwrap();
        assert!(text.contains("errors_total{camera_id=\"dark\",error_type=\"no_frames\"} 1"));
        assert!(text.contains("windows_processed_total{camera_id=\"lit\"} 1"));
    }

    #[test]
    fn test_backend_failure_does_not_abort_cycle() {
        let cfg = config(vec![camera("a"), camera("b")]);
        let sink = FakeSink {
            fail: true,
            ..Default::default()
        };
        let mut p = processor(&cfg, &[("a", vec![1]), ("b", vec![2])], sink, Arc::new(NoopMetrics));

        let summary = p.run_cycle(&running()).unwrap();
        assert_eq!(summary.processed, 2);
        assert_eq!(summary.reported, 0);
        assert_eq!(summary.skipped, 0);
        // 每个结果只发送一次
        assert_eq!(p.sink.sent.len(), 2);

        let snap = p.status.read();
        assert_eq!(snap.total_processed, 2);
        assert_eq!(snap.cameras_active, 2);
        assert!(snap.last_process.is_some());
    }

    #[test]
    fn test_disabled_cameras_are_not_scheduled() {
        let mut off = camera("off");
        off.enabled = false;
        let cfg = config(vec![off, camera("on")]);
        let mut p = processor(&cfg, &[("on", vec![1]), ("off", vec![1])], FakeSink::default(), Arc::new(NoopMetrics));

        let outcomes = p.process_all_cameras(&running());
        assert_eq!(outcomes.len(), 1);
        assert_eq!(p.cameras().len(), 1);
        assert_eq!(p.source.seen[0].0, "on");
    }

    #[test]
    fn test_legacy_payload_sends_window_max() {
        let mut cfg = config(vec![camera("cam")]);
        cfg.service.legacy_payload = true;
        let mut p = processor(&cfg, &[("cam", vec![3, 9, 4])], FakeSink::default(), Arc::new(NoopMetrics));

        p.process_all_cameras(&running());
        assert_eq!(p.sink.simple, vec![("cam".to_string(), 9)]);
    }

    #[test]
    fn test_camera_confidence_override() {
        struct ConfidenceRecorder(Vec<f32>);
        impl PersonCounter for ConfidenceRecorder {
            fn count_people(&mut self, _: &DynamicImage, c: f32) -> anyhow::Result<usize> {
                self.0.push(c);
                Ok(0)
            }
        }

        let mut strict = camera("strict");
        strict.confidence = Some(0.7);
        let cfg = config(vec![strict.clone(), camera("default")]);
        let source = FakeSource {
            frames: HashMap::from([
                ("strict".to_string(), vec![1]),
                ("default".to_string(), vec![1]),
            ]),
            seen: Vec::new(),
            cancel_on_fetch: None,
        };
        let mut p = PlaybackProcessor::new(
            &cfg,
            source,
            ConfidenceRecorder(Vec::new()),
            FakeSink::default(),
            Arc::new(NoopMetrics),
            ServiceStatus::new(),
        )
        .with_clock(now);

        p.process_all_cameras(&running());
        assert_eq!(p.detector.detector_mut().0, vec![0.7, 0.4]);
    }

    #[test]
    fn test_shutdown_stops_after_current_camera() {
        let ids: Vec<String> = (0..5).map(|i| format!("cam-{}", i)).collect();
        let cfg = config(ids.iter().map(|id| camera(id)).collect());
        let frames: Vec<(&str, Vec<u32>)> = ids.iter().map(|id| (id.as_str(), vec![1])).collect();

        let token = ShutdownToken::new();
        let mut p = processor(&cfg, &frames, FakeSink::default(), Arc::new(NoopMetrics));
        p.source.cancel_on_fetch = Some(token.clone());

        let cycles = Scheduler::new(Duration::from_secs(300), token).run(&mut p);
        assert_eq!(cycles, 1);
        let fetched: Vec<&str> = p.source.seen.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(fetched, vec!["cam-0"]);
        // 当前摄像头照常完成上报
        assert_eq!(p.sink.sent.len(), 1);
    }

    #[test]
    fn test_panicking_detector_is_isolated_per_camera() {
        /// 宽度 99 的帧触发 panic
        struct FragileCounter;
        impl PersonCounter for FragileCounter {
            fn count_people(&mut self, frame: &DynamicImage, _: f32) -> anyhow::Result<usize> {
                if frame.width() == 99 {
                    panic!("ort session crashed");
                }
                Ok(frame.width() as usize)
            }
        }

        let cfg = config(vec![camera("bad"), camera("good")]);
        let metrics = Arc::new(PipelineMetrics::new());
        let source = FakeSource {
            frames: HashMap::from([
                ("bad".to_string(), vec![99]),
                ("good".to_string(), vec![2, 3]),
            ]),
            seen: Vec::new(),
            cancel_on_fetch: None,
        };
        let mut p = PlaybackProcessor::new(
            &cfg,
            source,
            FragileCounter,
            FakeSink::default(),
            metrics.clone(),
            ServiceStatus::new(),
        )
        .with_clock(now);

        let outcomes = p.process_all_cameras(&running());
        assert!(matches!(
            &outcomes[0],
            CameraOutcome::Panicked { stage: CameraStage::Detect, reason } if reason.contains("ort session crashed")
        ));
        assert_eq!(outcomes[1].result().unwrap().max_people, 3);
        assert_eq!(p.sink.sent.len(), 1);

        let text = metrics.render().unwrap();
        assert!(text.contains("errors_total{camera_id=\"bad\",error_type=\"processing_error\"} 1"));

        // 整个周期报告失败, 调度器走退避
        let err = p.run_cycle(&running()).unwrap_err();
        assert!(err.to_string().contains("panic"));
        assert_eq!(p.status.read().total_processed, 1);
    }

    #[test]
    fn test_each_camera_window_uses_its_own_clock_reading() {
        use std::sync::atomic::{AtomicI64, Ordering};
        static TICKS: AtomicI64 = AtomicI64::new(0);
        fn ticking() -> DateTime<Utc> {
            // 每次读取前进 7 分钟
            let n = TICKS.fetch_add(1, Ordering::SeqCst);
            Utc.with_ymd_and_hms(2026, 2, 3, 12, 45, 0).unwrap() + chrono::TimeDelta::minutes(7 * n)
        }

        let cfg = config(vec![camera("a"), camera("b")]);
        let mut p = processor(&cfg, &[("a", vec![1]), ("b", vec![1])], FakeSink::default(), Arc::new(NoopMetrics))
            .with_clock(ticking);

        p.process_all_cameras(&running());
        let ends: Vec<DateTime<Utc>> = p.source.seen.iter().map(|(_, w)| w.end).collect();
        assert_eq!(ends.len(), 2);
        assert_eq!(ends[1] - ends[0], chrono::TimeDelta::minutes(7));
    }
}
