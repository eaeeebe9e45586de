// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

//! 快照模式 (Snapshot mode)
//!
//! 对窗口内均匀分布的时间点逐个请求 `/api/frame.jpeg`,
//! 每个时间点用 starttime 偏移后的回放地址寻址。

use std::io::Read;
use std::time::{Duration, Instant};

use chrono::TimeDelta;
use tracing::{debug, info, warn};

use super::{locator, target_frame_count, AcquisitionStrategy, Frame};
use crate::config::{CameraConfig, PlaybackConfig};
use crate::error::{AcquireError, ErrorKind};
use crate::http;
use crate::types::TimeWindow;

/// 单张快照最大字节数
const MAX_SNAPSHOT_BYTES: u64 = 20 * 1024 * 1024;

pub struct SnapshotStrategy {
    agent: ureq::Agent,
    proxy_base: String,
    sampling_fps: f64,
    frame_cap: usize,
    request_timeout: Duration,
    fetch_timeout: Duration,
    max_misses: usize,
}

impl SnapshotStrategy {
    pub fn new(config: &PlaybackConfig) -> Result<Self, native_tls::Error> {
        Ok(Self {
            agent: http::build_agent(config.verify_ssl, config.snapshot_timeout())?,
            proxy_base: config.proxy_base().to_string(),
            sampling_fps: config.sampling_fps,
            frame_cap: config.snapshot_frame_cap,
            request_timeout: config.snapshot_timeout(),
            fetch_timeout: config.fetch_timeout(),
            max_misses: config.snapshot_max_misses.max(1),
        })
    }

    /// 第 i 个采样点的时间偏移 (均匀分布在窗口内)
    fn sample_offset(window: &TimeWindow, target: usize, index: usize) -> TimeDelta {
        if target == 0 {
            return TimeDelta::zero();
        }
        let step_ms = window.duration().num_milliseconds() / target as i64;
        TimeDelta::milliseconds(step_ms * index as i64)
    }

    fn fetch_one(&self, url: &str, timeout: Duration) -> Result<Frame, AcquireError> {
        let response = self
            .agent
            .get(url)
            .timeout(timeout)
            .call()
            .map_err(|e| match e {
                ureq::Error::Status(code, _) => AcquireError::Status(code),
                ureq::Error::Transport(t) if http::is_timeout(&t) => AcquireError::Timeout,
                ureq::Error::Transport(t) => AcquireError::Transport(t.to_string()),
            })?;

        if response.status() != 200 {
            return Err(AcquireError::Status(response.status()));
        }

        let mut bytes = Vec::new();
        response
            .into_reader()
            .take(MAX_SNAPSHOT_BYTES)
            .read_to_end(&mut bytes)
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => {
                    AcquireError::Timeout
                }
                _ => AcquireError::Transport(e.to_string()),
            })?;

        image::load_from_memory(&bytes).map_err(|e| AcquireError::Decode(e.to_string()))
    }
}

impl AcquisitionStrategy for SnapshotStrategy {
    fn name(&self) -> &'static str {
        "snapshot"
    }

    fn error_kind(&self) -> ErrorKind {
        ErrorKind::SnapshotError
    }

    fn acquire(
        &self,
        camera: &CameraConfig,
        window: &TimeWindow,
    ) -> Result<Vec<Frame>, AcquireError> {
        let target = target_frame_count(window.duration_secs(), self.sampling_fps, self.frame_cap);
        info!(camera_id = %camera.camera_id, "📸 快照模式: 请求 {} 帧", target);

        let started = Instant::now();
        let deadline = started + self.fetch_timeout;
        let mut frames = Vec::with_capacity(target);
        let mut misses = 0usize;
        let mut last_error = None;

        for index in 0..target {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                warn!(camera_id = %camera.camera_id, "⏱️ 快照模式超时 ({:.1}s)", started.elapsed().as_secs_f64());
                last_error.get_or_insert(AcquireError::Timeout);
                break;
            }

            let at = window.start + Self::sample_offset(window, target, index);
            let source = locator::playback_locator(camera, at, window.end);
            let url = locator::snapshot_url(&self.proxy_base, &source);

            match self.fetch_one(&url, self.request_timeout.min(remaining)) {
                Ok(frame) => {
                    debug!(camera_id = %camera.camera_id, index, "快照 {}x{}", frame.width(), frame.height());
                    frames.push(frame);
                    misses = 0;
                }
                Err(e) => {
                    warn!(camera_id = %camera.camera_id, index, error = %e, "⚠️ 快照失败");
                    misses += 1;
                    last_error = Some(e);
                    if misses >= self.max_misses {
                        warn!(camera_id = %camera.camera_id, "⚠️ 连续 {} 次快照失败, 结束快照模式", misses);
                        break;
                    }
                }
            }
        }

        if frames.is_empty() {
            if let Some(e) = last_error {
                return Err(e);
            }
        } else {
            info!(
                camera_id = %camera.camera_id,
                "✅ 快照模式获取 {} 帧, 耗时 {:.1}s",
                frames.len(),
                started.elapsed().as_secs_f64()
            );
        }
        Ok(frames)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use axum::http::{header, StatusCode};
    use axum::response::IntoResponse;
    use axum::routing::get;
    use axum::Router;
    use chrono::{TimeZone, Utc};
    use image::{DynamicImage, ImageFormat};

    fn jpeg() -> Vec<u8> {
        let mut bytes = Cursor::new(Vec::new());
        DynamicImage::new_rgb8(8, 8)
            .write_to(&mut bytes, ImageFormat::Jpeg)
            .unwrap();
        bytes.into_inner()
    }

    /// 本地代理: 第 n 个请求 (从 0 开始) 由 `ok(n)` 决定返回 JPEG 还是 500
    fn serve(ok: fn(usize) -> bool) -> (String, Arc<AtomicUsize>) {
        let requests = Arc::new(AtomicUsize::new(0));
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        listener.set_nonblocking(true).unwrap();

        let counter = requests.clone();
        let body = jpeg();
        std::thread::spawn(move || {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            rt.block_on(async move {
                let app = Router::new().route(
                    "/api/frame.jpeg",
                    get(move || {
                        let n = counter.fetch_add(1, Ordering::SeqCst);
                        let body = body.clone();
                        async move {
                            if ok(n) {
                                ([(header::CONTENT_TYPE, "image/jpeg")], body).into_response()
                            } else {
                                StatusCode::INTERNAL_SERVER_ERROR.into_response()
                            }
                        }
                    }),
                );
                let listener = tokio::net::TcpListener::from_std(listener).unwrap();
                axum::serve(listener, app).await.unwrap();
            });
        });

        (format!("http://{}", addr), requests)
    }

    fn strategy(proxy_base: String) -> SnapshotStrategy {
        let config = PlaybackConfig {
            proxy_base_url: proxy_base,
            sampling_fps: 1.0,
            snapshot_frame_cap: 60,
            snapshot_max_misses: 3,
            snapshot_timeout_seconds: 5,
            timeout_seconds: 60,
            ..Default::default()
        };
        SnapshotStrategy::new(&config).unwrap()
    }

    fn camera() -> CameraConfig {
        CameraConfig {
            camera_id: "cam".into(),
            host: "10.0.0.1".into(),
            port: 554,
            username: "admin".into(),
            password: String::new(),
            track_id: "201".into(),
            confidence: None,
            enabled: true,
        }
    }

    fn window(minutes: i64) -> TimeWindow {
        let start = Utc.with_ymd_and_hms(2026, 2, 3, 12, 39, 0).unwrap();
        TimeWindow {
            start,
            end: start + TimeDelta::minutes(minutes),
        }
    }

    #[test]
    fn test_sample_offsets_span_window() {
        let w = window(5);
        let target = 60;
        assert_eq!(SnapshotStrategy::sample_offset(&w, target, 0), TimeDelta::zero());
        assert_eq!(SnapshotStrategy::sample_offset(&w, target, 1), TimeDelta::seconds(5));
        let last = SnapshotStrategy::sample_offset(&w, target, target - 1);
        assert!(w.start + last < w.end);
    }

    #[test]
    fn test_sample_offsets_zero_duration() {
        let w = window(0);
        assert_eq!(SnapshotStrategy::sample_offset(&w, 30, 7), TimeDelta::zero());
    }

    #[test]
    fn test_unreachable_proxy_is_strategy_failure() {
        // 端口 9 (discard) 在测试环境中一般拒绝连接
        let config = PlaybackConfig {
            proxy_base_url: "http://127.0.0.1:9".into(),
            snapshot_timeout_seconds: 2,
            timeout_seconds: 5,
            ..Default::default()
        };
        let strategy = SnapshotStrategy::new(&config).unwrap();

        let result = strategy.acquire(&camera(), &window(5));
        assert!(result.is_err());
    }

    #[test]
    fn test_isolated_misses_are_skipped_and_cap_holds() {
        // 1 小时窗口 @1fps 需要 3600 帧, 上限 60; 奇数请求返回 500
        let (base, requests) = serve(|n| n % 2 == 0);
        let frames = strategy(base).acquire(&camera(), &window(60)).unwrap();

        assert_eq!(frames.len(), 30);
        assert_eq!(frames[0].width(), 8);
        assert_eq!(requests.load(Ordering::SeqCst), 60);
    }

    #[test]
    fn test_consecutive_misses_end_snapshot_mode() {
        // 前 2 张成功, 之后一直 500: 第 3 次连续失败后停止
        let (base, requests) = serve(|n| n < 2);
        let frames = strategy(base).acquire(&camera(), &window(60)).unwrap();

        assert_eq!(frames.len(), 2);
        assert_eq!(requests.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn test_all_misses_report_status() {
        let (base, requests) = serve(|_| false);
        let result = strategy(base).acquire(&camera(), &window(5));

        assert!(matches!(result, Err(AcquireError::Status(500))));
        assert_eq!(requests.load(Ordering::SeqCst), 3);
    }
}
