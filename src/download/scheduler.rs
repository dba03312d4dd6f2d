//! 下载调度器。
//!
//! 根据条目数量选择策略：少量条目直接在调用线程上顺序执行；否则建立有界工作池，
//! 预留一个并行单位给编排线程。无论哪种策略、是否被中断，每个条目恰好产出一条
//! OutcomeRecord。
//!
//! 第一个条目的首次尝试总是在调用线程上先行执行：若它返回鉴权失败，整个会话直接终止，
//! 不再尝试剩余条目；否则它的后续重试与其余条目一起进入调度。

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crossbeam_channel as channel;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use super::models::{DownloadTask, FailureReason, ItemDescriptor, OutcomeRecord};
use super::retry::RetryPolicy;
use super::task::{TaskContext, TaskRun};
use super::transfer::TransferExecutor;
use super::verify::IntegrityVerifier;
use crate::base_system::context::Config;
use crate::base_system::paths::DestinationResolver;

const DISPATCH_POLL: Duration = Duration::from_millis(200);

/// 会话开始时一次性确定的调度参数。
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub available_parallelism: usize,
    pub sequential_threshold: usize,
    pub timeout: Duration,
}

impl SchedulerConfig {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            available_parallelism: cfg.available_parallelism(),
            sequential_threshold: cfg.sequential_threshold,
            timeout: Duration::from_secs(cfg.timeout_secs.max(1)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Sequential,
    Pooled { workers: usize },
}

impl Strategy {
    pub fn workers(self) -> usize {
        match self {
            Strategy::Sequential => 1,
            Strategy::Pooled { workers } => workers,
        }
    }
}

/// 纯函数：条目数不超过阈值时顺序执行，否则使用 `max(1, parallelism - 1)` 个 worker。
pub fn select_strategy(item_count: usize, available_parallelism: usize, threshold: usize) -> Strategy {
    if item_count <= threshold {
        Strategy::Sequential
    } else {
        Strategy::Pooled {
            workers: available_parallelism.saturating_sub(1).max(1),
        }
    }
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("authorization rejected on first item {id}: {message}")]
    Unauthorized { id: String, message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    pub strategy: Strategy,
    /// 产出的 OutcomeRecord 条数（即消费的条目数）。
    pub outcomes: usize,
    pub interrupted: bool,
}

pub struct Scheduler<'a> {
    config: SchedulerConfig,
    policy: RetryPolicy,
    executor: &'a dyn TransferExecutor,
    verifier: &'a dyn IntegrityVerifier,
    resolver: &'a dyn DestinationResolver,
    cancel: Arc<AtomicBool>,
}

impl<'a> Scheduler<'a> {
    pub fn new(
        config: SchedulerConfig,
        policy: RetryPolicy,
        executor: &'a dyn TransferExecutor,
        verifier: &'a dyn IntegrityVerifier,
        resolver: &'a dyn DestinationResolver,
        cancel: Arc<AtomicBool>,
    ) -> Self {
        Self {
            config,
            policy,
            executor,
            verifier,
            resolver,
            cancel,
        }
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }

    /// 消费全部条目，每个条目的终态交给 `sink`（可能在 worker 线程上并发调用）。
    pub fn run<I>(
        &self,
        items: I,
        sink: &(dyn Fn(OutcomeRecord) + Sync),
    ) -> Result<RunSummary, SchedulerError>
    where
        I: IntoIterator<Item = ItemDescriptor>,
    {
        let threshold = self.config.sequential_threshold;
        let mut items = items.into_iter();
        // 只预读 threshold + 1 个条目即可判断策略，其余保持惰性。
        let head: Vec<ItemDescriptor> = items.by_ref().take(threshold + 1).collect();
        let strategy = select_strategy(head.len(), self.config.available_parallelism, threshold);

        let mut rest = head.into_iter().chain(items);
        let Some(first) = rest.next() else {
            debug!(target: "scheduler", "没有需要下载的条目");
            return Ok(RunSummary {
                strategy,
                outcomes: 0,
                interrupted: self.cancelled(),
            });
        };
        info!(target: "scheduler", ?strategy, timeout_secs = self.config.timeout.as_secs(), "开始调度");

        let ctx = TaskContext {
            executor: self.executor,
            verifier: self.verifier,
            policy: &self.policy,
            timeout: self.config.timeout,
            cancel: &self.cancel,
        };

        let first_run = match self.prepare(first) {
            Ok(mut run) => {
                run.run_first_attempt(&ctx);
                if let Some(message) = run.unauthorized() {
                    let message = message.to_string();
                    error!(target: "scheduler", id = run.id(), "首个条目鉴权失败，终止会话: {message}");
                    return Err(SchedulerError::Unauthorized {
                        id: run.id().to_string(),
                        message,
                    });
                }
                Some(run)
            }
            Err(record) => {
                sink(record);
                None
            }
        };

        let remaining = match strategy {
            Strategy::Sequential => {
                if let Some(run) = first_run {
                    sink(run.finish(&ctx));
                }
                self.run_sequential(rest, &ctx, sink)
            }
            Strategy::Pooled { workers } => self.run_pooled(first_run, rest, workers, &ctx, sink),
        };

        let summary = RunSummary {
            strategy,
            outcomes: remaining + 1,
            interrupted: self.cancelled(),
        };
        info!(target: "scheduler", outcomes = summary.outcomes, interrupted = summary.interrupted, "调度结束");
        Ok(summary)
    }

    fn run_sequential(
        &self,
        items: impl Iterator<Item = ItemDescriptor>,
        ctx: &TaskContext<'_>,
        sink: &(dyn Fn(OutcomeRecord) + Sync),
    ) -> usize {
        let mut count = 0;
        for descriptor in items {
            sink(self.execute(descriptor, ctx));
            count += 1;
        }
        count
    }

    fn run_pooled(
        &self,
        first_run: Option<TaskRun>,
        items: impl Iterator<Item = ItemDescriptor>,
        workers: usize,
        ctx: &TaskContext<'_>,
        sink: &(dyn Fn(OutcomeRecord) + Sync),
    ) -> usize {
        let (tx, rx) = channel::bounded::<Job>(workers);
        let mut count = 0;

        std::thread::scope(|scope| {
            let mut handles = Vec::with_capacity(workers);
            for n in 0..workers {
                let rx = rx.clone();
                handles.push(scope.spawn(move || {
                    debug!(target: "scheduler", worker = n, "worker 启动");
                    // 中断后 worker 仍要取空队列，为排队条目记录 interrupted。
                    for job in rx.iter() {
                        let record = match job {
                            Job::Fresh(descriptor) => self.execute(descriptor, ctx),
                            Job::Resume(run) => run.finish(ctx),
                        };
                        sink(record);
                    }
                }));
            }
            drop(rx);

            if let Some(run) = first_run {
                self.dispatch(&tx, Job::Resume(run), ctx, sink);
            }
            for descriptor in items {
                count += 1;
                if self.cancelled() {
                    sink(interrupted(descriptor, "interrupted before dispatch"));
                    continue;
                }
                self.dispatch(&tx, Job::Fresh(descriptor), ctx, sink);
            }
            drop(tx);

            for h in handles {
                if h.join().is_err() {
                    error!(target: "scheduler", "worker 线程异常退出");
                }
            }
        });

        count
    }

    /// 把任务交给 worker；队列满时轮询中断标志，放弃的任务就地记录。
    fn dispatch(
        &self,
        tx: &channel::Sender<Job>,
        job: Job,
        ctx: &TaskContext<'_>,
        sink: &(dyn Fn(OutcomeRecord) + Sync),
    ) {
        let mut pending = job;
        loop {
            match tx.send_timeout(pending, DISPATCH_POLL) {
                Ok(()) => return,
                Err(channel::SendTimeoutError::Timeout(job)) => {
                    if self.cancelled() {
                        sink(job.abandon("interrupted before dispatch", ctx));
                        return;
                    }
                    pending = job;
                }
                Err(channel::SendTimeoutError::Disconnected(job)) => {
                    sink(job.abandon("worker pool stopped", ctx));
                    return;
                }
            }
        }
    }

    fn prepare(&self, descriptor: ItemDescriptor) -> Result<TaskRun, OutcomeRecord> {
        if self.cancelled() {
            return Err(interrupted(descriptor, "interrupted before start"));
        }
        match self.resolver.resolve(&descriptor) {
            Ok(destination) => Ok(TaskRun::new(DownloadTask::new(descriptor, destination))),
            Err(e) => {
                warn!(target: "scheduler", id = %descriptor.id, "无法确定保存路径: {e}");
                Err(OutcomeRecord::unattempted(
                    descriptor,
                    FailureReason::InvalidDestination,
                    Some(e.to_string()),
                ))
            }
        }
    }

    fn execute(&self, descriptor: ItemDescriptor, ctx: &TaskContext<'_>) -> OutcomeRecord {
        match self.prepare(descriptor) {
            Ok(run) => run.finish(ctx),
            Err(record) => record,
        }
    }
}

enum Job {
    Fresh(ItemDescriptor),
    /// 首个条目：首次尝试已在调用线程完成，剩余重试交给 worker。
    Resume(TaskRun),
}

impl Job {
    fn abandon(self, message: &str, ctx: &TaskContext<'_>) -> OutcomeRecord {
        match self {
            Job::Fresh(descriptor) => interrupted(descriptor, message),
            // 保留已完成的尝试；中断标志已置位时不会再发起新的尝试
            Job::Resume(run) => run.finish(ctx),
        }
    }
}

fn interrupted(descriptor: ItemDescriptor, message: &str) -> OutcomeRecord {
    OutcomeRecord::unattempted(
        descriptor,
        FailureReason::Interrupted,
        Some(message.to_string()),
    )
}
