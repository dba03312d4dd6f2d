//! gh-vault：把 GitHub 仓库与 gist 备份为经过校验的 zip 归档。
//!
//! 代码结构（读代码入口）：
//! - `base_system`：配置/日志/中断/路径等基础设施
//! - `download`：条目来源、传输、校验、重试与调度
//! - `report`：结果汇总、报告渲染与落盘

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use time::OffsetDateTime;
use tracing::{error, info, warn};

mod base_system;
mod download;
mod report;

use base_system::config::load_or_create;
use base_system::context::Config;
use base_system::interrupt::{self, EXIT_INTERRUPTED};
use base_system::logging::{LogOptions, LogSystem};
use base_system::paths::LayoutResolver;
use download::retry::RetryPolicy;
use download::source::{ManifestSource, PagedItems};
use download::transfer::HttpTransfer;
use download::verify::ZipVerifier;
use download::{OutcomeRecord, Scheduler, SchedulerConfig, SchedulerError};
use download::progress::ProgressReporter;
use report::{
    FileReportSink, ReportSink, ResultAggregator, SessionMeta, SessionStats, SharedAggregator,
};

const VERSION: &str = env!("CARGO_PKG_VERSION");
const EXIT_OK: u8 = 0;
const EXIT_FATAL: u8 = 1;
const EXIT_PARTIAL: u8 = 2;

#[derive(Debug, Parser)]
#[command(name = "gh-vault", version)]
#[command(about = "Back up GitHub repositories and gists as verified zip archives")]
struct Cli {
    /// 配置文件路径（默认 ./gh-vault.yml，不存在时自动生成）
    #[arg(long)]
    config: Option<PathBuf>,

    /// 条目清单（ItemDescriptor 的 JSON 数组）
    #[arg(long)]
    manifest: PathBuf,

    /// 备份目录，覆盖配置中的 backup_dir
    #[arg(long, short)]
    output: Option<PathBuf>,

    /// worker 数量（0 = 按 CPU 自动）
    #[arg(long)]
    workers: Option<usize>,

    /// 单个条目的下载超时（秒）
    #[arg(long)]
    timeout: Option<u64>,

    /// 每个条目的最大尝试次数
    #[arg(long)]
    max_attempts: Option<u32>,

    /// 启用调试日志输出
    #[arg(long, default_value_t = false)]
    debug: bool,

    /// 关闭进度条
    #[arg(long, default_value_t = false)]
    no_progress: bool,
}

impl Cli {
    fn apply_overrides(&self, config: &mut Config) {
        if let Some(out) = self.output.as_ref() {
            config.backup_dir = out.display().to_string();
        }
        if let Some(workers) = self.workers {
            config.max_workers = workers;
        }
        if let Some(timeout) = self.timeout {
            config.timeout_secs = timeout;
        }
        if let Some(max_attempts) = self.max_attempts {
            config.max_attempts = max_attempts;
        }
        if self.no_progress {
            config.progress_bar = false;
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            eprintln!("错误: {err:#}");
            ExitCode::from(EXIT_FATAL)
        }
    }
}

fn run(cli: Cli) -> Result<u8> {
    let mut config =
        load_or_create::<Config>(cli.config.as_deref()).context("failed to load config")?;
    cli.apply_overrides(&mut config);
    config.validate().context("invalid configuration")?;

    let log = init_logging(&cli, &config)?;
    info!(target: "startup", "gh-vault v{VERSION}");

    let cancel = interrupt::install(log.exit_handle()).context("failed to install Ctrl-C handler")?;

    let token = config.token();
    if token.is_none() {
        warn!(target: "startup", "未找到环境变量 {} 中的 token，将以匿名方式下载", config.token_env);
    }
    let executor = HttpTransfer::new(
        token,
        std::time::Duration::from_secs(config.connect_timeout_secs.max(1)),
    )
    .context("failed to build http client")?;
    let resolver = LayoutResolver::new(config.backup_root());
    resolver.prepare().context("failed to prepare backup directory")?;

    let source = ManifestSource::open(&cli.manifest, config.page_size)
        .with_context(|| format!("failed to open manifest {}", cli.manifest.display()))?;
    let mut items = PagedItems::new(source);

    let scheduler_config = SchedulerConfig::from_config(&config);
    let timeout_secs = scheduler_config.timeout.as_secs();
    let scheduler = Scheduler::new(
        scheduler_config,
        RetryPolicy::from_config(&config),
        &executor,
        &ZipVerifier,
        &resolver,
        cancel,
    );

    let progress = ProgressReporter::new(config.progress_bar, items.total_hint());
    let aggregator =
        SharedAggregator::new(ResultAggregator::new(config.top_n_size, config.top_n_recent));
    let sink = |record: OutcomeRecord| {
        progress.record(&record);
        aggregator.accumulate(record);
    };

    let reports = FileReportSink::new(config.reports_dir());
    let outcome = scheduler.run(items.by_ref(), &sink);
    progress.finish();

    let summary = match outcome {
        Ok(summary) => summary,
        Err(err @ SchedulerError::Unauthorized { .. }) => {
            error!(target: "session", "{err}");
            let text = report::render_error(&err.to_string(), OffsetDateTime::now_utc());
            match reports.persist_error(&text) {
                Ok(path) => info!(target: "session", "错误报告已保存: {}", path.display()),
                Err(e) => warn!(target: "session", "错误报告保存失败: {e}"),
            }
            eprintln!("{text}");
            return Ok(EXIT_FATAL);
        }
    };

    let source_failed = match items.take_error() {
        Some(err) => {
            error!(target: "session", "条目枚举中断，部分条目未被处理: {err}");
            true
        }
        None => false,
    };

    let stats = aggregator.finalize().with_meta(SessionMeta {
        backup_path: config.backup_root(),
        workers: summary.strategy.workers(),
        timeout_secs,
        generated_at: OffsetDateTime::now_utc(),
        interrupted: summary.interrupted,
    });
    let rendered = report::render(&stats);
    match reports.persist(&rendered) {
        Ok(saved) => info!(target: "session", "报告已保存: {}", saved.structured.display()),
        Err(e) => warn!(target: "session", "报告保存失败: {e}"),
    }

    println!("{}", rendered.human);
    println!("{}", rendered.summary);

    Ok(exit_code(&stats, summary.interrupted, source_failed))
}

fn exit_code(stats: &SessionStats, interrupted: bool, source_failed: bool) -> u8 {
    if interrupted {
        EXIT_INTERRUPTED as u8
    } else if stats.failed > 0 || source_failed {
        EXIT_PARTIAL
    } else {
        EXIT_OK
    }
}

fn init_logging(cli: &Cli, config: &Config) -> Result<LogSystem> {
    let opts = LogOptions {
        debug: cli.debug,
        use_color: true,
        archive_on_exit: true,
        // 进度条占用终端时日志只写文件
        console: !config.progress_bar,
    };
    LogSystem::init(opts, &PathBuf::from(&config.log_dir)).context("failed to init logging")
}
