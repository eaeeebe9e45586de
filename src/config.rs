// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

//! 配置 (Configuration)
//!
//! YAML 文件 → `AppConfig`,启动时加载一次,之后只读。
//! 三个段落: `service` / `playback` / `cameras` (兼容旧版 `streams` 列表)。

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::TimeDelta;
use clap::Parser;
use serde::{Deserialize, Deserializer};
use tracing::{info, warn};

use crate::error::ConfigError;

/// 命令行参数
#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "回放窗口人数统计服务 (Playback People Counter)", long_about = None)]
pub struct Args {
    /// 配置文件路径 (YAML), 缺省时依次查找 ./config.yaml, /app/config.yaml
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// 只执行一个处理周期后退出
    #[arg(long)]
    pub once: bool,

    /// 不向后端发送数据,只在日志中打印 payload
    #[arg(long)]
    pub dry_run: bool,
}

/// 默认配置文件查找路径
const DEFAULT_CONFIG_PATHS: [&str; 2] = ["./config.yaml", "/app/config.yaml"];

/// 单个摄像头配置
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CameraConfig {
    pub camera_id: String,

    #[serde(rename = "rtsp_ip")]
    pub host: String,

    #[serde(rename = "rtsp_port", default = "default_rtsp_port")]
    pub port: u16,

    #[serde(rename = "rtsp_username", default = "default_username")]
    pub username: String,

    #[serde(rename = "rtsp_password", default)]
    pub password: String,

    /// 回放通道 (例如 201), YAML 中可写数字或字符串
    #[serde(default = "default_track_id", deserialize_with = "string_or_number")]
    pub track_id: String,

    /// 摄像头级置信度 (覆盖 service.confidence)
    #[serde(default)]
    pub confidence: Option<f32>,

    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl CameraConfig {
    /// 有效置信度: 摄像头覆盖 > 服务默认
    pub fn effective_confidence(&self, service_default: f32) -> f32 {
        self.confidence.unwrap_or(service_default)
    }
}

/// 回放模式配置
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    pub enabled: bool,

    /// 媒体代理地址 (go2rtc)
    #[serde(rename = "go2rtc_base_url", alias = "proxy_base_url")]
    pub proxy_base_url: String,

    pub window_duration_minutes: u32,
    /// 窗口结束时间相对 now 的回退量,留给录像落盘
    pub delay_minutes: u32,
    pub interval_minutes: u32,
    pub sampling_fps: f64,
    /// 单次采集 (整个策略) 的时间上限
    pub timeout_seconds: u64,
    pub verify_ssl: bool,

    /// 单次快照请求超时
    pub snapshot_timeout_seconds: u64,
    pub snapshot_frame_cap: usize,
    pub stream_frame_cap: usize,
    /// 快照模式连续失败次数上限,达到后提前结束并降级
    pub snapshot_max_misses: usize,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            proxy_base_url: "http://localhost:1984".to_string(),
            window_duration_minutes: 5,
            delay_minutes: 1,
            interval_minutes: 5,
            sampling_fps: 1.0,
            timeout_seconds: 120,
            verify_ssl: false,
            snapshot_timeout_seconds: 15,
            snapshot_frame_cap: 60,
            stream_frame_cap: 100,
            snapshot_max_misses: 3,
        }
    }
}

impl PlaybackConfig {
    pub fn window_duration(&self) -> TimeDelta {
        TimeDelta::minutes(self.window_duration_minutes as i64)
    }

    pub fn delay(&self) -> TimeDelta {
        TimeDelta::minutes(self.delay_minutes as i64)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_minutes as u64 * 60)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    pub fn snapshot_timeout(&self) -> Duration {
        Duration::from_secs(self.snapshot_timeout_seconds)
    }

    /// 去掉末尾 `/` 的代理地址
    pub fn proxy_base(&self) -> &str {
        self.proxy_base_url.trim_end_matches('/')
    }
}

/// 服务配置
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// ONNX 模型路径
    pub model: String,
    /// 计算设备: cpu / cuda / cuda:N
    pub device: String,
    pub confidence: f32,
    pub iou: f32,
    pub input_size: u32,
    pub backend_endpoint: String,
    pub backend_api_key: String,
    /// 0 表示不启动健康检查/指标端点
    pub metrics_port: u16,
    /// 额外发送旧版简化 payload
    pub legacy_payload: bool,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            model: "yolov8n.onnx".to_string(),
            device: "cpu".to_string(),
            confidence: 0.4,
            iou: 0.45,
            input_size: 640,
            backend_endpoint: String::new(),
            backend_api_key: String::new(),
            metrics_port: 8080,
            legacy_payload: false,
        }
    }
}

impl ServiceConfig {
    pub fn endpoint(&self) -> Option<&str> {
        non_empty(&self.backend_endpoint)
    }

    pub fn api_key(&self) -> Option<&str> {
        non_empty(&self.backend_api_key)
    }
}

/// 旧版 `streams` 条目
#[derive(Debug, Clone, Deserialize)]
struct StreamEntry {
    #[serde(default)]
    stream_id: Option<String>,
    #[serde(default)]
    rtsp: String,
    #[serde(default)]
    confidence: Option<f32>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawConfig {
    service: ServiceConfig,
    playback: PlaybackConfig,
    cameras: Vec<CameraConfig>,
    streams: Vec<StreamEntry>,
}

/// 完整配置
#[derive(Debug, Clone, Default)]
pub struct AppConfig {
    pub service: ServiceConfig,
    pub playback: PlaybackConfig,
    /// 配置文件中的全部摄像头 (保持文件顺序)
    pub cameras: Vec<CameraConfig>,
}

impl AppConfig {
    /// 加载配置
    ///
    /// 显式路径必须存在; 未指定时按默认路径查找,都不存在则使用内置默认值。
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = explicit {
            let config = Self::from_file(path)?;
            info!("✅ 已加载配置: {}", path.display());
            return Ok(config);
        }

        for candidate in DEFAULT_CONFIG_PATHS {
            let path = Path::new(candidate);
            if path.exists() {
                let config = Self::from_file(path)?;
                info!("✅ 已加载配置: {}", path.display());
                return Ok(config);
            }
        }

        warn!("⚠️ 未找到配置文件,使用默认配置");
        let config = Self::default();
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml(&contents)
    }

    pub fn from_yaml(contents: &str) -> Result<Self, ConfigError> {
        // 空文件 → 默认值
        let raw: RawConfig = if contents.trim().is_empty() {
            RawConfig::default()
        } else {
            serde_yaml::from_str(contents)?
        };

        let mut cameras = raw.cameras;
        if cameras.is_empty() {
            cameras = raw
                .streams
                .iter()
                .enumerate()
                .filter_map(|(i, stream)| camera_from_stream(i, stream))
                .collect();
        }

        let config = Self {
            service: raw.service,
            playback: raw.playback,
            cameras,
        };
        config.validate()?;
        Ok(config)
    }

    /// 参与调度的摄像头 (enabled, 文件顺序)
    pub fn enabled_cameras(&self) -> Vec<CameraConfig> {
        self.cameras.iter().filter(|c| c.enabled).cloned().collect()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let pb = &self.playback;
        if !(pb.sampling_fps > 0.0 && pb.sampling_fps.is_finite()) {
            return Err(ConfigError::Invalid(format!(
                "playback.sampling_fps 必须 > 0 (当前 {})",
                pb.sampling_fps
            )));
        }
        if pb.window_duration_minutes == 0 {
            return Err(ConfigError::Invalid(
                "playback.window_duration_minutes 必须 > 0".into(),
            ));
        }
        if pb.interval_minutes == 0 {
            return Err(ConfigError::Invalid(
                "playback.interval_minutes 必须 > 0".into(),
            ));
        }
        if pb.timeout_seconds == 0 || pb.snapshot_timeout_seconds == 0 {
            return Err(ConfigError::Invalid("playback 超时必须 > 0".into()));
        }
        if pb.snapshot_frame_cap == 0 || pb.stream_frame_cap == 0 {
            return Err(ConfigError::Invalid("playback 帧数上限必须 > 0".into()));
        }

        check_confidence("service.confidence", self.service.confidence)?;
        check_confidence("service.iou", self.service.iou)?;
        if self.service.input_size == 0 {
            return Err(ConfigError::Invalid("service.input_size 必须 > 0".into()));
        }

        let mut seen = HashSet::new();
        for camera in &self.cameras {
            if camera.camera_id.is_empty() {
                return Err(ConfigError::Invalid("camera_id 不能为空".into()));
            }
            if !seen.insert(camera.camera_id.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "camera_id 重复: {}",
                    camera.camera_id
                )));
            }
            if let Some(conf) = camera.confidence {
                check_confidence(&format!("{}.confidence", camera.camera_id), conf)?;
            }
        }
        Ok(())
    }
}

fn check_confidence(name: &str, value: f32) -> Result<(), ConfigError> {
    if value > 0.0 && value <= 1.0 {
        Ok(())
    } else {
        Err(ConfigError::Invalid(format!(
            "{} 必须在 (0, 1] 范围内 (当前 {})",
            name, value
        )))
    }
}

fn non_empty(s: &str) -> Option<&str> {
    let s = s.trim();
    if s.is_empty() {
        None
    } else {
        Some(s)
    }
}

/// 旧版 `streams` 条目 → CameraConfig (从 RTSP URL 中提取地址/凭据/通道)
fn camera_from_stream(index: usize, stream: &StreamEntry) -> Option<CameraConfig> {
    if stream.rtsp.is_empty() {
        return None;
    }
    let parsed = match url::Url::parse(&stream.rtsp) {
        Ok(u) => u,
        Err(e) => {
            warn!("⚠️ 无法解析 streams[{}].rtsp: {}", index, e);
            return None;
        }
    };

    let decode = |s: &str| {
        urlencoding::decode(s)
            .map(|d| d.into_owned())
            .unwrap_or_else(|_| s.to_string())
    };

    let track_id = parsed
        .path()
        .split("Channels/")
        .nth(1)
        .and_then(|rest| rest.split('/').next())
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .unwrap_or_else(default_track_id);

    let username = if parsed.username().is_empty() {
        default_username()
    } else {
        decode(parsed.username())
    };

    Some(CameraConfig {
        camera_id: stream
            .stream_id
            .clone()
            .unwrap_or_else(|| format!("camera-{}", index + 1)),
        host: parsed.host_str().unwrap_or_default().to_string(),
        port: parsed.port().unwrap_or_else(default_rtsp_port),
        username,
        password: parsed.password().map(decode).unwrap_or_default(),
        track_id,
        confidence: stream.confidence,
        enabled: true,
    })
}

fn default_rtsp_port() -> u16 {
    554
}

fn default_username() -> String {
    "admin".to_string()
}

fn default_track_id() -> String {
    "201".to_string()
}

fn default_true() -> bool {
    true
}

fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum StringOrNumber {
        String(String),
        Number(u64),
    }

    Ok(match StringOrNumber::deserialize(deserializer)? {
        StringOrNumber::String(s) => s,
        StringOrNumber::Number(n) => n.to_string(),
    })
}
