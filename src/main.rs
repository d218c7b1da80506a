//! SciStar 批量运行入口
//!
//! 读取配置与数据集，按并发上限运行全部任务，结果逐行写入
//! <output_dir>/<run_name>/<时间戳>/answers.jsonl。Ctrl+C 取消在途任务，已写入的结果保留，
//! 之后可用 --resume <时间戳> 续跑。

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;

use scistar::agent::{build_coordinator, build_registry, build_runtime, create_llm_from_config, TaskLimits};
use scistar::config::load_config;
use scistar::core::ShutdownManager;
use scistar::observability;
use scistar::runner::{
    select_tasks, AnswerReformulator, JsonlTaskSource, ResultsStore, RunDir, RunOptions, RunOrchestrator,
    TaskSource,
};

#[derive(Debug, Parser)]
#[command(name = "scistar", version, about = "Run the science-QA agent over a task dataset")]
struct Cli {
    /// 额外的配置文件（覆盖 config/default.toml）
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// JSONL 数据集路径
    #[arg(short, long)]
    dataset: Option<PathBuf>,

    #[arg(long)]
    concurrency: Option<usize>,

    #[arg(long)]
    run_name: Option<String>,

    /// 续跑已有的时间戳目录
    #[arg(long)]
    resume: Option<String>,

    /// 只运行指定任务（id 或从 1 开始的序号），可重复
    #[arg(long = "task")]
    tasks: Vec<String>,

    /// 串行执行且忽略已有结果
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();
    let cli = Cli::parse();

    let mut cfg = load_config(cli.config.clone()).context("Failed to load config")?;
    if let Some(dataset) = cli.dataset {
        cfg.runtime.dataset = Some(dataset);
    }
    if let Some(c) = cli.concurrency {
        cfg.runtime.concurrency = c;
    }
    if let Some(name) = cli.run_name {
        cfg.runtime.run_name = name;
    }
    if cli.resume.is_some() {
        cfg.runtime.resume_from = cli.resume;
    }
    if !cli.tasks.is_empty() {
        cfg.runtime.selected_tasks = cli.tasks;
    }
    cfg.runtime.debug |= cli.debug;

    let dataset = cfg
        .runtime
        .dataset
        .clone()
        .context("No dataset given (use --dataset or runtime.dataset)")?;
    let tasks = JsonlTaskSource::new(&dataset)
        .load()
        .await
        .with_context(|| format!("Failed to load tasks from {}", dataset.display()))?;
    let tasks = select_tasks(tasks, &cfg.runtime.selected_tasks);
    tracing::info!(dataset = %dataset.display(), tasks = tasks.len(), "loaded tasks");

    let run_dir = RunDir::prepare(
        &cfg.runtime.output_dir,
        &cfg.runtime.run_name,
        cfg.runtime.resume_from.as_deref(),
    )
    .context("Failed to prepare run directory")?;
    run_dir.write_config(&cfg).context("Failed to write config.json")?;
    tracing::info!(dir = %run_dir.root.display(), "run directory ready");

    let llm = create_llm_from_config(&cfg);
    let registry = build_registry(&cfg, llm.clone());
    let runtime = build_runtime(&cfg, llm.clone(), registry);
    let coordinator = build_coordinator(&cfg, runtime);

    let shutdown = ShutdownManager::new();
    shutdown.install_signal_handlers();

    let mut orchestrator = RunOrchestrator::new(
        coordinator,
        TaskLimits::from_config(&cfg),
        ResultsStore::new(&run_dir.answers),
        RunOptions {
            concurrency: cfg.runtime.concurrency,
            debug: cfg.runtime.debug,
            agent_name: cfg.llm.model.clone(),
        },
    )
    .with_shutdown(shutdown);
    if cfg.agent.reformulate_answer {
        orchestrator = orchestrator.with_reformulator(AnswerReformulator::new(Arc::clone(&llm)));
    }

    let summary = orchestrator.run(tasks).await.context("Run aborted")?;
    println!(
        "{} tasks: {} completed ({} answered, {} failed), {} skipped, {} not started",
        summary.total, summary.completed, summary.succeeded, summary.failed, summary.skipped, summary.not_started
    );
    println!("results: {}", run_dir.answers.display());
    Ok(())
}
