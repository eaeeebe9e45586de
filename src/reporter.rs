// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

//! 后端上报 (Backend reporter)
//!
//! 失败只记录, 不重试, 不中断周期。

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::config::ServiceConfig;
use crate::error::{ErrorKind, ReportError};
use crate::http;
use crate::metrics::MetricsSink;
use crate::types::{WindowResult, SOURCE_TYPE};
use crate::window::format_iso_utc;

/// 上报请求超时
pub const SEND_TIMEOUT: Duration = Duration::from_secs(30);

/// 上报结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportOutcome {
    pub success: bool,
    /// 失败原因 (成功时为 None)
    pub reason: Option<String>,
}

impl ReportOutcome {
    pub fn ok() -> Self {
        Self {
            success: true,
            reason: None,
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            success: false,
            reason: Some(reason.into()),
        }
    }
}

/// 结果去向
pub trait ResultSink {
    fn send(&mut self, result: &WindowResult) -> ReportOutcome;

    /// 旧版简化 payload
    fn send_simple(&mut self, camera_id: &str, count: u32, timestamp: DateTime<Utc>)
        -> ReportOutcome;
}

/// 窗口结果 payload
#[derive(Debug, Serialize)]
pub struct WindowPayload<'a> {
    pub camera_id: &'a str,
    pub window_start: String,
    pub window_end: String,
    pub max_people: u32,
    pub avg_people: f64,
    pub min_people: u32,
    pub frames_processed: usize,
    pub sampling_fps: f64,
    pub source_type: &'a str,
    pub timestamp: String,
}

impl<'a> WindowPayload<'a> {
    pub fn new(result: &'a WindowResult, sent_at: DateTime<Utc>) -> Self {
        Self {
            camera_id: &result.camera_id,
            window_start: format_iso_utc(result.window_start),
            window_end: format_iso_utc(result.window_end),
            max_people: result.max_people,
            avg_people: round1(result.avg_people),
            min_people: result.min_people,
            frames_processed: result.frames_processed,
            sampling_fps: result.sampling_fps,
            source_type: result.source_type,
            timestamp: sent_at.to_rfc3339_opts(SecondsFormat::Millis, true),
        }
    }
}

/// 旧版 payload
#[derive(Debug, Serialize)]
pub struct SimplePayload<'a> {
    pub camera_id: &'a str,
    pub count: u32,
    pub timestamp: String,
    pub source_type: &'a str,
}

fn round1(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}

pub struct BackendReporter {
    agent: ureq::Agent,
    endpoint: Option<String>,
    api_key: Option<String>,
    dry_run: bool,
    metrics: Arc<dyn MetricsSink>,
}

impl BackendReporter {
    pub fn new(
        config: &ServiceConfig,
        dry_run: bool,
        metrics: Arc<dyn MetricsSink>,
    ) -> Result<Self, native_tls::Error> {
        Ok(Self {
            agent: http::build_agent(true, SEND_TIMEOUT)?,
            endpoint: config.endpoint().map(str::to_string),
            api_key: config.api_key().map(str::to_string),
            dry_run,
            metrics,
        })
    }

    fn post(&self, body: &str) -> Result<(), ReportError> {
        let endpoint = self.endpoint.as_deref().ok_or(ReportError::NotConfigured)?;
        let mut request = self
            .agent
            .post(endpoint)
            .set("Content-Type", "application/json");
        if let Some(key) = &self.api_key {
            request = request.set("X-API-Key", key);
        }

        match request.send_string(body) {
            Ok(resp) if (200..300).contains(&resp.status()) => Ok(()),
            Ok(resp) => Err(ReportError::Status {
                status: resp.status(),
                body: resp.into_string().unwrap_or_default(),
            }),
            Err(ureq::Error::Status(status, resp)) => Err(ReportError::Status {
                status,
                body: resp.into_string().unwrap_or_default(),
            }),
            Err(ureq::Error::Transport(t)) if http::is_timeout(&t) => Err(ReportError::Timeout),
            Err(ureq::Error::Transport(t)) => Err(ReportError::Transport(t.to_string())),
        }
    }

    /// 序列化 + 发送 + 记录
    fn deliver<T: Serialize>(&self, camera_id: &str, payload: &T, what: &str) -> ReportOutcome {
        let body = match serde_json::to_string(payload) {
            Ok(b) => b,
            Err(e) => {
                let e = ReportError::from(e);
                warn!(camera_id, error = %e, "❌ {} 序列化失败", what);
                self.metrics.inc_error(camera_id, e.kind());
                return ReportOutcome::failed(e.to_string());
            }
        };

        if self.dry_run {
            info!(camera_id, payload = %body, "🧪 dry-run: 跳过发送 {}", what);
            return ReportOutcome::ok();
        }

        let t = Instant::now();
        let result = self.post(&body);
        let elapsed = t.elapsed();

        match result {
            Ok(()) => {
                self.metrics.observe_send(camera_id, elapsed);
                info!(camera_id, "📤 {} 已发送 ({:.0}ms)", what, elapsed.as_secs_f64() * 1000.0);
                ReportOutcome::ok()
            }
            Err(ReportError::NotConfigured) => {
                warn!(camera_id, "⚠️ 未配置 backend_endpoint, 跳过发送 {}", what);
                ReportOutcome::failed(ReportError::NotConfigured.to_string())
            }
            Err(e) => {
                self.metrics.observe_send(camera_id, elapsed);
                self.metrics.inc_error(camera_id, e.kind());
                warn!(camera_id, error = %e, "❌ {} 发送失败", what);
                ReportOutcome::failed(e.to_string())
            }
        }
    }
}

impl ResultSink for BackendReporter {
    fn send(&mut self, result: &WindowResult) -> ReportOutcome {
        let payload = WindowPayload::new(result, Utc::now());
        self.deliver(&result.camera_id, &payload, "窗口结果")
    }

    fn send_simple(
        &mut self,
        camera_id: &str,
        count: u32,
        timestamp: DateTime<Utc>,
    ) -> ReportOutcome {
        let payload = SimplePayload {
            camera_id,
            count,
            timestamp: timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
            source_type: SOURCE_TYPE,
        };
        self.deliver(camera_id, &payload, "简化结果")
    }
}
