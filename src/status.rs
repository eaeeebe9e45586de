// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

//! 服务状态 (Service status)
//!
//! 调度线程写, 健康检查线程读。

use std::fmt;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::Serialize;

/// 服务生命周期
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceState {
    Starting,
    Running,
    Stopping,
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ServiceState::Starting => "starting",
            ServiceState::Running => "running",
            ServiceState::Stopping => "stopping",
        };
        f.write_str(s)
    }
}

/// 某一时刻的状态快照
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusSnapshot {
    pub state: ServiceState,
    pub last_process: Option<DateTime<Utc>>,
    pub cameras_active: usize,
    pub total_processed: u64,
}

impl Default for StatusSnapshot {
    fn default() -> Self {
        Self {
            state: ServiceState::Starting,
            last_process: None,
            cameras_active: 0,
            total_processed: 0,
        }
    }
}

/// 共享状态句柄 (clone 即共享)
#[derive(Debug, Clone, Default)]
pub struct ServiceStatus {
    inner: Arc<RwLock<StatusSnapshot>>,
}

impl ServiceStatus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn read(&self) -> StatusSnapshot {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// 原地修改快照
    pub fn update<F: FnOnce(&mut StatusSnapshot)>(&self, f: F) {
        let mut guard = self.inner.write().unwrap_or_else(|e| e.into_inner());
        f(&mut guard);
    }

    pub fn set_state(&self, state: ServiceState) {
        self.update(|s| s.state = state);
    }

    /// 一个周期结束: 记录时间与成功窗口数
    pub fn record_cycle(&self, at: DateTime<Utc>, cameras_active: usize, processed: u64) {
        self.update(|s| {
            s.last_process = Some(at);
            s.cameras_active = cameras_active;
            s.total_processed += processed;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_initial_status() {
        let status = ServiceStatus::new();
        let snap = status.read();
        assert_eq!(snap.state, ServiceState::Starting);
        assert!(snap.last_process.is_none());
        assert_eq!(snap.total_processed, 0);
    }

    #[test]
    fn test_clones_share_state() {
        let status = ServiceStatus::new();
        let reader = status.clone();
        let at = Utc.with_ymd_and_hms(2026, 2, 3, 12, 45, 0).unwrap();

        status.set_state(ServiceState::Running);
        status.record_cycle(at, 3, 2);
        status.record_cycle(at, 3, 1);

        let snap = reader.read();
        assert_eq!(snap.state, ServiceState::Running);
        assert_eq!(snap.last_process, Some(at));
        assert_eq!(snap.cameras_active, 3);
        assert_eq!(snap.total_processed, 3);
    }

    #[test]
    fn test_state_serializes_lowercase() {
        let json = serde_json::to_string(&ServiceState::Stopping).unwrap();
        assert_eq!(json, "\"stopping\"");
        assert_eq!(ServiceState::Running.to_string(), "running");
    }
}
