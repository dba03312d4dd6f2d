//! 单个任务的尝试循环（显式状态机）。
//!
//! `Pending → Attempting → {Succeeded | RetryScheduled → Attempting | Failed}`

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use time::OffsetDateTime;
use tracing::{debug, info, warn};

use super::error::TransferError;
use super::models::{
    AttemptOutcome, AttemptRecord, DownloadTask, FailureReason, FinalStatus, OutcomeRecord,
};
use super::retry::{RetryPolicy, sleep_unless_cancelled};
use super::transfer::{TransferExecutor, discard_partial};
use super::verify::IntegrityVerifier;

/// worker 执行任务所需的协作者（只读共享）。
#[derive(Clone, Copy)]
pub(crate) struct TaskContext<'a> {
    pub executor: &'a dyn TransferExecutor,
    pub verifier: &'a dyn IntegrityVerifier,
    pub policy: &'a RetryPolicy,
    pub timeout: Duration,
    pub cancel: &'a AtomicBool,
}

#[derive(Debug)]
enum TaskState {
    Pending,
    Attempting {
        attempt: u32,
        delay_before: Duration,
    },
    RetryScheduled {
        attempt: u32,
        delay: Duration,
    },
    Succeeded {
        bytes: u64,
    },
    Failed {
        reason: FailureReason,
        error: String,
    },
}

impl TaskState {
    fn step(self, task: &mut DownloadTask, ctx: &TaskContext<'_>) -> TaskState {
        match self {
            TaskState::Pending => {
                if ctx.cancel.load(Ordering::Relaxed) {
                    TaskState::Failed {
                        reason: FailureReason::Interrupted,
                        error: "interrupted before start".to_string(),
                    }
                } else {
                    TaskState::Attempting {
                        attempt: 1,
                        delay_before: Duration::ZERO,
                    }
                }
            }
            TaskState::Attempting {
                attempt,
                delay_before,
            } => attempt_once(task, ctx, attempt, delay_before),
            TaskState::RetryScheduled { attempt, delay } => {
                if sleep_unless_cancelled(delay, ctx.cancel) {
                    TaskState::Attempting {
                        attempt,
                        delay_before: delay,
                    }
                } else {
                    TaskState::Failed {
                        reason: FailureReason::Interrupted,
                        error: "interrupted during backoff".to_string(),
                    }
                }
            }
            terminal => terminal,
        }
    }
}

fn attempt_once(
    task: &mut DownloadTask,
    ctx: &TaskContext<'_>,
    attempt: u32,
    delay_before: Duration,
) -> TaskState {
    let started_at = OffsetDateTime::now_utc();
    let clock = Instant::now();
    debug!(target: "task", id = task.id(), attempt, "开始下载");

    let result: Result<u64, TransferError> = ctx
        .executor
        .fetch(task, ctx.timeout, ctx.cancel)
        .and_then(|bytes| ctx.verifier.verify(&task.destination).map(|()| bytes));

    let outcome = match &result {
        Ok(_) => AttemptOutcome::Success,
        Err(err) => AttemptOutcome::from(err),
    };
    task.attempts.push(AttemptRecord {
        attempt_number: attempt,
        started_at,
        delay_before_ms: millis(delay_before),
        duration_ms: millis(clock.elapsed()),
        outcome,
    });

    match result {
        Ok(bytes) => TaskState::Succeeded { bytes },
        Err(err) => {
            discard_partial(&task.destination);
            let decision = ctx.policy.should_retry(attempt, err.kind());
            if decision.retry {
                warn!(
                    target: "task",
                    id = task.id(),
                    attempt,
                    delay_ms = millis(decision.delay),
                    "下载失败，稍后重试: {err}"
                );
                TaskState::RetryScheduled {
                    attempt: attempt + 1,
                    delay: decision.delay,
                }
            } else {
                TaskState::Failed {
                    reason: FailureReason::from(&err),
                    error: err.to_string(),
                }
            }
        }
    }
}

/// 一个正在推进的任务；可以先在调用线程上完成首次尝试，再交给 worker 跑完剩余重试。
#[derive(Debug)]
pub(crate) struct TaskRun {
    task: DownloadTask,
    state: TaskState,
    clock: Instant,
}

impl TaskRun {
    pub(crate) fn new(task: DownloadTask) -> Self {
        Self {
            task,
            state: TaskState::Pending,
            clock: Instant::now(),
        }
    }

    pub(crate) fn id(&self) -> &str {
        self.task.id()
    }

    fn is_terminal(&self) -> bool {
        matches!(
            self.state,
            TaskState::Succeeded { .. } | TaskState::Failed { .. }
        )
    }

    fn advance(&mut self, ctx: &TaskContext<'_>) {
        let state = std::mem::replace(&mut self.state, TaskState::Pending);
        self.state = state.step(&mut self.task, ctx);
    }

    /// 推进到第一次尝试结束（或未尝试即终止）。
    pub(crate) fn run_first_attempt(&mut self, ctx: &TaskContext<'_>) {
        while !self.is_terminal() && self.task.attempts.is_empty() {
            self.advance(ctx);
        }
    }

    /// 已因鉴权失败终止时返回错误信息。
    pub(crate) fn unauthorized(&self) -> Option<&str> {
        match &self.state {
            TaskState::Failed {
                reason: FailureReason::Unauthorized,
                error,
            } => Some(error),
            _ => None,
        }
    }

    /// 执行到终态，恰好产出一条 OutcomeRecord。
    pub(crate) fn finish(mut self, ctx: &TaskContext<'_>) -> OutcomeRecord {
        let terminal = loop {
            match std::mem::replace(&mut self.state, TaskState::Pending) {
                TaskState::Succeeded { bytes } => break Ok(bytes),
                TaskState::Failed { reason, error } => break Err((reason, error)),
                state => self.state = state.step(&mut self.task, ctx),
            }
        };

        let total_duration_ms = millis(self.clock.elapsed());
        let DownloadTask {
            descriptor,
            attempts,
            ..
        } = self.task;

        match terminal {
            Ok(bytes) => {
                info!(target: "task", id = %descriptor.id, bytes, attempts = attempts.len(), "下载完成 {}", descriptor.display_name);
                OutcomeRecord {
                    descriptor,
                    final_status: FinalStatus::Succeeded,
                    attempts,
                    bytes_written: bytes,
                    total_duration_ms,
                    failure: None,
                    last_error: None,
                }
            }
            Err((reason, error)) => {
                warn!(target: "task", id = %descriptor.id, reason = reason.as_str(), attempts = attempts.len(), "下载失败 {}: {error}", descriptor.display_name);
                OutcomeRecord {
                    descriptor,
                    final_status: FinalStatus::Failed,
                    attempts,
                    bytes_written: 0,
                    total_duration_ms,
                    failure: Some(reason),
                    last_error: Some(error),
                }
            }
        }
    }
}

fn millis(d: Duration) -> u64 {
    d.as_millis().min(u64::MAX as u128) as u64
}
