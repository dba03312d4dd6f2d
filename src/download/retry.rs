//! 冷却/退避重试策略。
//!
//! 指数退避 + 随机抖动，避免多个 worker 同时失败后同步重试。
//! 限流信号携带的等待时间优先于计算出的退避时间。

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use rand::Rng;

use super::error::FailureKind;
use crate::base_system::context::Config;

const SLEEP_SLICE: Duration = Duration::from_millis(50);

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: bool,
    pub max_rate_limit_wait: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryDecision {
    pub retry: bool,
    pub delay: Duration,
}

impl RetryDecision {
    const STOP: RetryDecision = RetryDecision {
        retry: false,
        delay: Duration::ZERO,
    };

    fn after(delay: Duration) -> Self {
        Self { retry: true, delay }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(30),
            jitter: true,
            max_rate_limit_wait: Duration::from_secs(300),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            max_attempts: cfg.max_attempts.max(1),
            base_delay: Duration::from_millis(cfg.base_delay_ms),
            max_delay: Duration::from_millis(cfg.max_delay_ms.max(cfg.base_delay_ms)),
            jitter: cfg.jitter,
            max_rate_limit_wait: Duration::from_secs(cfg.max_rate_limit_wait_secs),
        }
    }

    /// 第 `attempt_number` 次（从 1 开始）尝试失败后，是否继续以及等待多久。
    pub fn should_retry(&self, attempt_number: u32, kind: FailureKind) -> RetryDecision {
        match kind {
            FailureKind::Fatal | FailureKind::Interrupted => RetryDecision::STOP,
            _ if attempt_number >= self.max_attempts => RetryDecision::STOP,
            FailureKind::Throttled(Some(wait)) => {
                RetryDecision::after(wait.min(self.max_rate_limit_wait))
            }
            FailureKind::Throttled(None) | FailureKind::Retryable => {
                RetryDecision::after(self.backoff(attempt_number))
            }
        }
    }

    /// base * 2^(n-1)，封顶 max_delay，再叠加 [0, d/2] 的抖动。
    pub fn backoff(&self, attempt_number: u32) -> Duration {
        let shift = attempt_number.saturating_sub(1).min(16);
        let base_ms = self.base_delay.as_millis().min(u64::MAX as u128) as u64;
        let max_ms = self.max_delay.as_millis().min(u64::MAX as u128) as u64;
        let factor = 1u64.checked_shl(shift).unwrap_or(u64::MAX);
        let wait = base_ms.saturating_mul(factor).min(max_ms.max(base_ms));

        let jitter = if self.jitter && wait > 1 {
            rand::thread_rng().gen_range(0..=wait / 2)
        } else {
            0
        };
        Duration::from_millis(wait.saturating_add(jitter))
    }
}

/// 分片睡眠，期间收到取消信号则提前返回 `false`。
pub(crate) fn sleep_unless_cancelled(delay: Duration, cancel: &AtomicBool) -> bool {
    let deadline = Instant::now() + delay;
    loop {
        if cancel.load(Ordering::Relaxed) {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        std::thread::sleep((deadline - now).min(SLEEP_SLICE));
    }
}
