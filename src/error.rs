// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

//! 错误类型 (Error taxonomy)
//!
//! 除启动阶段外,所有错误都在组件边界内被转换为 跳过/继续 语义,
//! 这里的类型只负责描述 "哪里失败了"。

use std::fmt;

/// 配置加载/校验错误 (启动期,致命)
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("读取配置文件失败 {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("解析 YAML 失败: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("配置无效: {0}")]
    Invalid(String),
}

/// 单个采集策略的失败原因 (非致命,触发降级)
#[derive(Debug, thiserror::Error)]
pub enum AcquireError {
    #[error("HTTP {0}")]
    Status(u16),

    #[error("请求超时")]
    Timeout,

    #[error("网络错误: {0}")]
    Transport(String),

    #[error("图像解码失败: {0}")]
    Decode(String),

    #[error("视频流错误: {0}")]
    Stream(String),
}

/// 上报失败原因 (纯观测,不影响周期)
#[derive(Debug, thiserror::Error)]
pub enum ReportError {
    #[error("未配置后端地址")]
    NotConfigured,

    #[error("后端超时")]
    Timeout,

    #[error("后端返回 HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("后端网络错误: {0}")]
    Transport(String),

    #[error("序列化失败: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// 错误类别标签 (用于 errors_total{error_type})
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ErrorKind {
    SnapshotError,
    StreamError,
    NoFrames,
    DetectionError,
    BackendTimeout,
    BackendError,
    ProcessingError,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::SnapshotError => "snapshot_error",
            ErrorKind::StreamError => "stream_error",
            ErrorKind::NoFrames => "no_frames",
            ErrorKind::DetectionError => "detection_error",
            ErrorKind::BackendTimeout => "backend_timeout",
            ErrorKind::BackendError => "backend_error",
            ErrorKind::ProcessingError => "processing_error",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ReportError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ReportError::Timeout => ErrorKind::BackendTimeout,
            _ => ErrorKind::BackendError,
        }
    }
}
