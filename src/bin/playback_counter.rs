// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

/// 回放窗口人数统计服务 (Playback People Counter)
///
/// 主程序入口 - 直接运行: cargo run --bin playback-counter --release -- --config config.yaml
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use mimalloc::MiMalloc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use playback_counter_rs::metrics::{MetricsSink, NoopMetrics, PipelineMetrics};
use playback_counter_rs::{
    health, AppConfig, Args, BackendReporter, FrameAcquirer, PlaybackProcessor, Scheduler,
    ServiceState, ServiceStatus, ShutdownToken, YoloPersonCounter,
};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

const DEFAULT_LOG_FILTER: &str = "playback_counter_rs=info,playback_counter=info,ort=warn";

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)),
        )
        .init();

    let args = Args::parse();
    let config = AppConfig::load(args.config.as_deref()).context("加载配置失败")?;
    print_summary(&config, &args);

    if !config.playback.enabled {
        warn!("⚠️ playback.enabled = false, 服务退出");
        return Ok(());
    }
    if config.enabled_cameras().is_empty() {
        warn!("⚠️ 没有启用的摄像头");
    }

    // 指标能力启动时选定一次
    let metrics: Arc<dyn MetricsSink> = if config.service.metrics_port == 0 {
        Arc::new(NoopMetrics)
    } else {
        Arc::new(PipelineMetrics::new())
    };
    let status = ServiceStatus::new();
    health::spawn(config.service.metrics_port, status.clone(), metrics.clone());

    // 检测器初始化失败为致命错误
    let detector = YoloPersonCounter::new(
        &config.service.model,
        &config.service.device,
        config.service.iou,
        config.service.input_size,
    )
    .with_context(|| format!("检测模型初始化失败: {}", config.service.model))?;

    let source = FrameAcquirer::from_config(&config.playback, metrics.clone())
        .context("创建 HTTP 客户端失败")?;
    let reporter = BackendReporter::new(&config.service, args.dry_run, metrics.clone())
        .context("创建上报客户端失败")?;
    let mut processor =
        PlaybackProcessor::new(&config, source, detector, reporter, metrics, status.clone());

    let token = ShutdownToken::new();
    let handler_token = token.clone();
    ctrlc::set_handler(move || {
        info!("🛑 收到退出信号...");
        handler_token.cancel();
    })
    .context("注册信号处理失败")?;

    status.set_state(ServiceState::Running);
    let scheduler = Scheduler::new(config.playback.interval(), token).run_once(args.once);
    scheduler.run(&mut processor);
    status.set_state(ServiceState::Stopping);

    info!("👋 服务已停止");
    Ok(())
}

fn print_summary(config: &AppConfig, args: &Args) {
    let service = &config.service;
    let playback = &config.playback;

    info!("{}", "=".repeat(60));
    info!("🚀 回放窗口人数统计服务 v{}", env!("CARGO_PKG_VERSION"));
    info!("📋 模型: {} | 设备: {} | 置信度: {}", service.model, service.device, service.confidence);
    info!(
        "⏰ 窗口 {} 分钟 | 延迟 {} 分钟 | 间隔 {} 分钟 | 采样 {} fps",
        playback.window_duration_minutes,
        playback.delay_minutes,
        playback.interval_minutes,
        playback.sampling_fps
    );
    info!("🌐 媒体代理: {}", playback.proxy_base());
    info!("📹 摄像头:");
    for camera in &config.cameras {
        info!(
            "   {} {} @ {}:{} (track {})",
            if camera.enabled { "✅" } else { "❌" },
            camera.camera_id,
            camera.host,
            camera.port,
            camera.track_id
        );
    }
    // API key 不打印
    info!("🔗 后端: {}", service.endpoint().unwrap_or("未配置"));
    if args.dry_run {
        info!("🧪 dry-run: 不向后端发送数据");
    }
    if args.once {
        info!("1️⃣ 只执行一个周期");
    }
    info!("{}", "=".repeat(60));
}
