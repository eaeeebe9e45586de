// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

//! 健康检查 / 指标端点 (Health & metrics side channel)
//!
//! 独立线程上运行单线程 tokio runtime + axum。
//! 绑定失败只告警, 不影响主流程。

use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::JoinHandle;

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::metrics::MetricsSink;
use crate::status::{ServiceState, ServiceStatus};

pub const SERVICE_NAME: &str = "ai-people-counting";

#[derive(Clone)]
struct HealthState {
    status: ServiceStatus,
    metrics: Arc<dyn MetricsSink>,
}

/// `/health` 响应体
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub service: &'static str,
    pub version: &'static str,
    pub timestamp: String,
    pub state: ServiceState,
    pub last_process: Option<String>,
    pub cameras_active: usize,
    pub total_processed: u64,
}

impl HealthResponse {
    fn from_status(status: &ServiceStatus, now: DateTime<Utc>) -> Self {
        let snap = status.read();
        Self {
            status: "ok",
            service: SERVICE_NAME,
            version: env!("CARGO_PKG_VERSION"),
            timestamp: now.to_rfc3339_opts(SecondsFormat::Millis, true),
            state: snap.state,
            last_process: snap
                .last_process
                .map(|t| t.to_rfc3339_opts(SecondsFormat::Millis, true)),
            cameras_active: snap.cameras_active,
            total_processed: snap.total_processed,
        }
    }
}

pub fn router(status: ServiceStatus, metrics: Arc<dyn MetricsSink>) -> Router {
    Router::new()
        .route("/", get(health_check))
        .route("/health", get(health_check))
        .route("/metrics", get(metrics_text))
        .with_state(HealthState { status, metrics })
}

async fn health_check(State(state): State<HealthState>) -> impl IntoResponse {
    Json(HealthResponse::from_status(&state.status, Utc::now()))
}

async fn metrics_text(State(state): State<HealthState>) -> impl IntoResponse {
    match state.metrics.render() {
        Some(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

/// 在后台线程启动健康检查服务; 端口为 0 时不启动
pub fn spawn(
    port: u16,
    status: ServiceStatus,
    metrics: Arc<dyn MetricsSink>,
) -> Option<JoinHandle<()>> {
    if port == 0 {
        info!("健康检查端点已禁用 (metrics_port = 0)");
        return None;
    }

    let app = router(status, metrics);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let spawned = std::thread::Builder::new()
        .name("health".into())
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(rt) => rt,
                Err(e) => {
                    warn!("⚠️ 健康检查 runtime 创建失败: {}", e);
                    return;
                }
            };

            runtime.block_on(async move {
                let listener = match tokio::net::TcpListener::bind(addr).await {
                    Ok(l) => l,
                    Err(e) => {
                        warn!("⚠️ 健康检查端口 {} 绑定失败: {}", port, e);
                        return;
                    }
                };
                info!("🏥 健康检查服务: http://{}", addr);
                if let Err(e) = axum::serve(listener, app).await {
                    warn!("⚠️ 健康检查服务退出: {}", e);
                }
            });
        });

    match spawned {
        Ok(handle) => Some(handle),
        Err(e) => {
            warn!("⚠️ 健康检查线程启动失败: {}", e);
            None
        }
    }
}
