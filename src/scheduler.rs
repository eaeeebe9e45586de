// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

//! 周期调度 (Camera scheduler)
//!
//! 启动后立即执行一轮, 之后每 interval 执行一次;
//! 睡眠按 tick 切片, 每片检查一次退出标志。
//! 周期内的 panic 按失败处理, 退避后重试。

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::anyhow;
use tracing::{error, info};

/// 睡眠切片
pub const DEFAULT_TICK: Duration = Duration::from_secs(1);
/// 周期失败后的退避时间
pub const DEFAULT_BACKOFF: Duration = Duration::from_secs(60);

/// 协作式退出标志 (clone 即共享)
#[derive(Debug, Clone, Default)]
pub struct ShutdownToken(Arc<AtomicBool>);

impl ShutdownToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// 最多等待 `duration`, 每 `tick` 检查一次; 被取消时返回 true
    pub fn wait(&self, duration: Duration, tick: Duration) -> bool {
        let deadline = Instant::now() + duration;
        let tick = tick.max(Duration::from_millis(1));
        loop {
            if self.is_cancelled() {
                return true;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            std::thread::sleep(remaining.min(tick));
        }
    }
}

/// 一轮处理的汇总
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleSummary {
    /// 完成聚合的摄像头数
    pub processed: usize,
    /// 上报成功的摄像头数
    pub reported: usize,
    pub skipped: usize,
}

/// 调度目标; 每个摄像头之间应检查 token
pub trait CycleRunner {
    fn run_cycle(&mut self, token: &ShutdownToken) -> anyhow::Result<CycleSummary>;
}

/// panic 载荷 → 可读文本
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

pub struct Scheduler {
    interval: Duration,
    tick: Duration,
    backoff: Duration,
    run_once: bool,
    token: ShutdownToken,
}

impl Scheduler {
    pub fn new(interval: Duration, token: ShutdownToken) -> Self {
        Self {
            interval,
            tick: DEFAULT_TICK,
            backoff: DEFAULT_BACKOFF,
            run_once: false,
            token,
        }
    }

    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    /// 只执行一轮
    pub fn run_once(mut self, once: bool) -> Self {
        self.run_once = once;
        self
    }

    /// 主循环; 返回执行的轮数
    pub fn run<C: CycleRunner>(&self, runner: &mut C) -> usize {
        let mut cycles = 0usize;
        while !self.token.is_cancelled() {
            let started = Instant::now();
            info!("🔄 开始处理周期 #{}", cycles + 1);
            let result = panic::catch_unwind(AssertUnwindSafe(|| runner.run_cycle(&self.token)))
                .unwrap_or_else(|payload| Err(anyhow!("panic: {}", panic_message(payload.as_ref()))));
            cycles += 1;

            let pause = match result {
                Ok(summary) => {
                    info!(
                        "✅ 周期完成: 成功 {} | 已上报 {} | 跳过 {} | 耗时 {:.1}s",
                        summary.processed,
                        summary.reported,
                        summary.skipped,
                        started.elapsed().as_secs_f64()
                    );
                    if self.run_once {
                        break;
                    }
                    info!("⏳ 等待 {}s 后开始下一周期", self.interval.as_secs());
                    self.interval
                }
                Err(e) => {
                    error!(error = %e, "❌ 周期执行失败, {}s 后重试", self.backoff.as_secs());
                    if self.run_once {
                        break;
                    }
                    self.backoff
                }
            };

            if self.token.wait(pause, self.tick) {
                break;
            }
        }
        info!("👋 调度器退出 (共 {} 个周期)", cycles);
        cycles
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 记录调用次数; 第 n 次调用后取消
    struct CountingRunner {
        calls: usize,
        fail: bool,
        panic: bool,
        cancel_after: Option<usize>,
    }

    impl CycleRunner for CountingRunner {
        fn run_cycle(&mut self, token: &ShutdownToken) -> anyhow::Result<CycleSummary> {
            self.calls += 1;
            if let Some(n) = self.cancel_after {
                if self.calls >= n {
                    token.cancel();
                }
            }
            if self.panic {
                panic!("decoder exploded");
            }
            if self.fail {
                Err(anyhow!("boom"))
            } else {
                Ok(CycleSummary::default())
            }
        }
    }

    fn runner(fail: bool) -> CountingRunner {
        CountingRunner {
            calls: 0,
            fail,
            panic: false,
            cancel_after: None,
        }
    }

    #[test]
    fn test_first_cycle_runs_immediately() {
        let token = ShutdownToken::new();
        let scheduler = Scheduler::new(Duration::from_secs(300), token).run_once(true);
        let mut r = runner(false);

        let started = Instant::now();
        assert_eq!(scheduler.run(&mut r), 1);
        assert_eq!(r.calls, 1);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_shutdown_during_sleep_exits_within_tick() {
        let token = ShutdownToken::new();
        let scheduler = Scheduler::new(Duration::from_secs(300), token.clone())
            .with_tick(Duration::from_millis(20));
        let mut r = runner(false);

        let canceller = token.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(100));
            canceller.cancel();
        });

        let started = Instant::now();
        let cycles = scheduler.run(&mut r);
        handle.join().unwrap();

        assert_eq!(cycles, 1);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_error_backs_off_then_retries() {
        let token = ShutdownToken::new();
        let scheduler = Scheduler::new(Duration::from_secs(300), token.clone())
            .with_tick(Duration::from_millis(5))
            .with_backoff(Duration::from_millis(10));
        let mut r = runner(true);
        r.cancel_after = Some(3);

        assert_eq!(scheduler.run(&mut r), 3);
        assert_eq!(r.calls, 3);
    }

    #[test]
    fn test_panicking_cycle_backs_off_instead_of_exiting() {
        let token = ShutdownToken::new();
        let scheduler = Scheduler::new(Duration::from_secs(300), token.clone())
            .with_tick(Duration::from_millis(5))
            .with_backoff(Duration::from_millis(10));
        let mut r = runner(false);
        r.panic = true;
        r.cancel_after = Some(2);

        assert_eq!(scheduler.run(&mut r), 2);
        assert_eq!(r.calls, 2);
    }

    #[test]
    fn test_panic_message_text() {
        let payload = panic::catch_unwind(|| panic!("static text")).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "static text");
        let payload = panic::catch_unwind(|| panic!("formatted {}", 7)).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "formatted 7");
    }

    #[test]
    fn test_cancelled_before_start_runs_nothing() {
        let token = ShutdownToken::new();
        token.cancel();
        let mut r = runner(false);
        assert_eq!(Scheduler::new(Duration::from_secs(1), token).run(&mut r), 0);
    }

    #[test]
    fn test_wait_returns_false_on_timeout() {
        let token = ShutdownToken::new();
        assert!(!token.wait(Duration::from_millis(30), Duration::from_millis(10)));
        token.cancel();
        assert!(token.wait(Duration::from_secs(10), Duration::from_millis(10)));
    }
}
