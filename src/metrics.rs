// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

//! 指标 (Metrics)
//!
//! `MetricsSink` 是可选能力: 启动时选定一次实现,
//! 端口为 0 时使用 `NoopMetrics`,核心流程不感知差异。

use std::collections::{BTreeMap, HashMap};
use std::fmt::Write as _;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::error::ErrorKind;
use crate::types::WindowResult;

/// 指标能力
pub trait MetricsSink: Send + Sync {
    /// 窗口聚合完成
    fn observe_window(&self, _camera_id: &str, _result: &WindowResult) {}

    /// 完成检测的帧数
    fn inc_frames(&self, _camera_id: &str, _frames: u64) {}

    fn observe_fetch(&self, _camera_id: &str, _elapsed: Duration) {}

    /// 单帧推理耗时
    fn observe_inference(&self, _camera_id: &str, _elapsed: Duration) {}

    fn observe_send(&self, _camera_id: &str, _elapsed: Duration) {}

    fn inc_error(&self, _camera_id: &str, _kind: ErrorKind) {}

    /// Prometheus 文本格式; 不支持导出时返回 None
    fn render(&self) -> Option<String> {
        None
    }
}

/// 空实现
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {}

/// 耗时汇总 (count + sum)
#[derive(Debug, Default, Clone, Copy)]
struct Timing {
    count: u64,
    sum_secs: f64,
}

impl Timing {
    fn observe(&mut self, elapsed: Duration) {
        self.count += 1;
        self.sum_secs += elapsed.as_secs_f64();
    }
}

/// 单个摄像头的指标
#[derive(Debug, Default, Clone)]
struct CameraMetrics {
    people_count: f64,
    people_max: f64,
    people_avg: f64,
    frames_processed: u64,
    windows_processed: u64,
    fetch: Timing,
    inference: Timing,
    send: Timing,
    errors: BTreeMap<ErrorKind, u64>,
}

/// 进程内指标 (按 camera_id 分组)
pub struct PipelineMetrics {
    cameras: Mutex<HashMap<String, CameraMetrics>>,
    started_at: Instant,
}

impl Default for PipelineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self {
            cameras: Mutex::new(HashMap::new()),
            started_at: Instant::now(),
        }
    }

    fn with_camera<F: FnOnce(&mut CameraMetrics)>(&self, camera_id: &str, f: F) {
        // 锁中毒时继续使用内部数据,指标不应影响主流程
        let mut cameras = self.cameras.lock().unwrap_or_else(|e| e.into_inner());
        f(cameras.entry(camera_id.to_string()).or_default());
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    fn snapshot(&self) -> BTreeMap<String, CameraMetrics> {
        let cameras = self.cameras.lock().unwrap_or_else(|e| e.into_inner());
        cameras
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

impl MetricsSink for PipelineMetrics {
    fn observe_window(&self, camera_id: &str, result: &WindowResult) {
        self.with_camera(camera_id, |m| {
            m.people_count = result.max_people as f64;
            m.people_max = result.max_people as f64;
            m.people_avg = result.avg_people;
            m.windows_processed += 1;
        });
    }

    fn inc_frames(&self, camera_id: &str, frames: u64) {
        self.with_camera(camera_id, |m| m.frames_processed += frames);
    }

    fn observe_fetch(&self, camera_id: &str, elapsed: Duration) {
        self.with_camera(camera_id, |m| m.fetch.observe(elapsed));
    }

    fn observe_inference(&self, camera_id: &str, elapsed: Duration) {
        self.with_camera(camera_id, |m| m.inference.observe(elapsed));
    }

    fn observe_send(&self, camera_id: &str, elapsed: Duration) {
        self.with_camera(camera_id, |m| m.send.observe(elapsed));
    }

    fn inc_error(&self, camera_id: &str, kind: ErrorKind) {
        self.with_camera(camera_id, |m| *m.errors.entry(kind).or_insert(0) += 1);
    }

    fn render(&self) -> Option<String> {
        let cameras = self.snapshot();
        let mut out = String::new();

        let gauges: [(&str, &str, fn(&CameraMetrics) -> f64); 3] = [
            ("people_count", "Current people count", |m| m.people_count),
            ("people_max", "Max people in window", |m| m.people_max),
            ("people_avg", "Average people in window", |m| m.people_avg),
        ];
        for (name, help, value) in gauges {
            header(&mut out, name, help, "gauge");
            for (camera_id, m) in &cameras {
                sample(&mut out, name, camera_id, None, value(m));
            }
        }

        let counters: [(&str, &str, fn(&CameraMetrics) -> u64); 2] = [
            ("frames_processed_total", "Total frames processed", |m| m.frames_processed),
            ("windows_processed_total", "Total playback windows processed", |m| m.windows_processed),
        ];
        for (name, help, value) in counters {
            header(&mut out, name, help, "counter");
            for (camera_id, m) in &cameras {
                sample(&mut out, name, camera_id, None, value(m) as f64);
            }
        }

        header(&mut out, "errors_total", "Total errors", "counter");
        for (camera_id, m) in &cameras {
            for (kind, count) in &m.errors {
                sample(&mut out, "errors_total", camera_id, Some(kind.as_str()), *count as f64);
            }
        }

        let timings: [(&str, &str, fn(&CameraMetrics) -> Timing); 3] = [
            ("playback_fetch_seconds", "Time to fetch playback frames", |m| m.fetch),
            ("inference_seconds", "Inference time per frame", |m| m.inference),
            ("backend_send_seconds", "Time to send data to backend", |m| m.send),
        ];
        for (name, help, value) in timings {
            header(&mut out, name, help, "summary");
            for (camera_id, m) in &cameras {
                let t = value(m);
                sample(&mut out, &format!("{}_count", name), camera_id, None, t.count as f64);
                sample(&mut out, &format!("{}_sum", name), camera_id, None, t.sum_secs);
            }
        }

        header(&mut out, "process_uptime_seconds", "Seconds since service start", "gauge");
        let _ = writeln!(out, "process_uptime_seconds {:.3}", self.uptime().as_secs_f64());

        Some(out)
    }
}

fn header(out: &mut String, name: &str, help: &str, kind: &str) {
    let _ = writeln!(out, "# HELP {} {}", name, help);
    let _ = writeln!(out, "# TYPE {} {}", name, kind);
}

fn sample(out: &mut String, name: &str, camera_id: &str, error_type: Option<&str>, value: f64) {
    let camera_id = escape_label(camera_id);
    let _ = match error_type {
        Some(kind) => writeln!(
            out,
            "{}{{camera_id=\"{}\",error_type=\"{}\"}} {}",
            name, camera_id, kind, value
        ),
        None => writeln!(out, "{}{{camera_id=\"{}\"}} {}", name, camera_id, value),
    };
}

/// Prometheus 标签值转义
fn escape_label(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}
