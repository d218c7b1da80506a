//! Run Orchestrator
//!
//! 以并发上限 C 运行一组任务：Semaphore 控制同时执行的 DelegationCoordinator 数，
//! 每个任务结束即追加一行结果（不在内存中攒到最后）。单个任务失败或 panic 只产生该任务的
//! FAILED 记录，不影响其它任务。续跑时跳过结果日志中已有的 task id。

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::agent::TaskLimits;
use crate::core::ShutdownManager;
use crate::react::{AgentStatus, DelegationCoordinator, EventSender};
use crate::runner::record::RunRecord;
use crate::runner::reformulate::AnswerReformulator;
use crate::runner::results::ResultsStore;
use crate::runner::scorer::{NoopScorer, Scorer};
use crate::runner::task::Task;

const QUESTION_PREVIEW_CHARS: usize = 80;

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub concurrency: usize,
    /// 忽略已有结果、强制串行
    pub debug: bool,
    /// 写入记录的 agent_name（通常是模型名）
    pub agent_name: String,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            concurrency: 1,
            debug: false,
            agent_name: "scistar".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub total: usize,
    /// 结果日志中已存在、本次跳过的任务
    pub skipped: usize,
    pub completed: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// 因关闭信号未开始的任务
    pub not_started: usize,
}

/// 任务共享的只读部分
struct Shared {
    coordinator: DelegationCoordinator,
    limits: TaskLimits,
    store: ResultsStore,
    scorer: Arc<dyn Scorer>,
    reformulator: Option<AnswerReformulator>,
    events: Option<EventSender>,
    agent_name: String,
}

pub struct RunOrchestrator {
    shared: Arc<Shared>,
    options: RunOptions,
    shutdown: ShutdownManager,
}

fn now_string() -> String {
    chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

fn preview(text: &str) -> String {
    if text.chars().count() > QUESTION_PREVIEW_CHARS {
        format!("{}...", text.chars().take(QUESTION_PREVIEW_CHARS).collect::<String>())
    } else {
        text.to_string()
    }
}

impl Shared {
    async fn run_one(self: Arc<Self>, task: Task, cancel: CancellationToken) -> RunRecord {
        let augmented = task.augmented_question();
        let start_time = now_string();
        tracing::info!(task_id = %task.id, question = %preview(&task.question), "starting task");

        let outcome = self
            .coordinator
            .run(&augmented, self.limits.budget(), cancel, self.events.clone())
            .await;
        let mut record = match outcome {
            Ok(outcome) => {
                let mut prediction = outcome.manager.final_answer.clone();
                if let (Some(r), AgentStatus::Done) = (&self.reformulator, outcome.manager.status) {
                    match r.reformulate(&augmented, &outcome.manager.transcript).await {
                        Ok(answer) if !answer.is_empty() => prediction = Some(answer),
                        Ok(_) => {}
                        Err(e) => tracing::warn!(task_id = %task.id, error = %e, "reformulation failed, keeping raw answer"),
                    }
                }
                RunRecord::from_outcome(
                    &task,
                    &self.agent_name,
                    augmented,
                    &outcome,
                    prediction,
                    start_time,
                    now_string(),
                )
            }
            Err(e) => {
                tracing::error!(task_id = %task.id, error = %e, "task ended without an outcome");
                RunRecord::internal_failure(&task, &self.agent_name, augmented, e.to_string(), start_time, now_string())
            }
        };

        if let Some(prediction) = record.prediction.clone() {
            record.judgment = self
                .scorer
                .score(&task.id, &prediction, task.reference_answer.as_deref())
                .await;
        }
        tracing::info!(
            task_id = %task.id,
            steps = record.steps,
            prediction = ?record.prediction.as_deref().map(preview),
            failure = ?record.failure,
            "task completed"
        );
        record
    }
}

impl RunOrchestrator {
    pub fn new(
        coordinator: DelegationCoordinator,
        limits: TaskLimits,
        store: ResultsStore,
        options: RunOptions,
    ) -> Self {
        let agent_name = options.agent_name.clone();
        Self {
            shared: Arc::new(Shared {
                coordinator,
                limits,
                store,
                scorer: Arc::new(NoopScorer),
                reformulator: None,
                events: None,
                agent_name,
            }),
            options,
            shutdown: ShutdownManager::new(),
        }
    }

    fn shared_mut(&mut self) -> Option<&mut Shared> {
        Arc::get_mut(&mut self.shared)
    }

    pub fn with_scorer(mut self, scorer: Arc<dyn Scorer>) -> Self {
        if let Some(s) = self.shared_mut() {
            s.scorer = scorer;
        }
        self
    }

    pub fn with_reformulator(mut self, reformulator: AnswerReformulator) -> Self {
        if let Some(s) = self.shared_mut() {
            s.reformulator = Some(reformulator);
        }
        self
    }

    pub fn with_events(mut self, events: Option<EventSender>) -> Self {
        if let Some(s) = self.shared_mut() {
            s.events = events;
        }
        self
    }

    pub fn with_shutdown(mut self, shutdown: ShutdownManager) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn shutdown(&self) -> &ShutdownManager {
        &self.shutdown
    }

    /// 结果日志中尚无记录的任务（debug 模式下为全部任务）
    pub async fn pending_tasks(&self, tasks: Vec<Task>) -> std::io::Result<Vec<Task>> {
        let done: HashSet<String> = if self.options.debug {
            HashSet::new()
        } else {
            self.shared.store.completed_ids().await?
        };
        if !done.is_empty() {
            tracing::info!(previous = done.len(), "found previous results");
        }
        Ok(tasks.into_iter().filter(|t| !done.contains(&t.id)).collect())
    }

    pub async fn run(&self, tasks: Vec<Task>) -> std::io::Result<RunSummary> {
        let total = tasks.len();
        let pending = self.pending_tasks(tasks).await?;
        let mut summary = RunSummary {
            total,
            skipped: total - pending.len(),
            ..RunSummary::default()
        };
        let concurrency = if self.options.debug { 1 } else { self.options.concurrency.max(1) };
        tracing::info!(
            total,
            pending = pending.len(),
            concurrency,
            output = %self.shared.store.path().display(),
            "run started"
        );

        let semaphore = Arc::new(Semaphore::new(concurrency));
        let mut set: JoinSet<(String, std::io::Result<bool>)> = JoinSet::new();
        let pending_count = pending.len();
        let mut started = 0usize;
        let shutdown_token = self.shutdown.token();

        for task in pending {
            let permit = tokio::select! {
                p = semaphore.clone().acquire_owned() => match p {
                    Ok(p) => p,
                    Err(_) => break,
                },
                _ = shutdown_token.cancelled() => break,
            };
            if self.shutdown.is_shutdown() {
                break;
            }
            started += 1;
            let shared = self.shared.clone();
            let cancel = self.shutdown.task_token();
            set.spawn(async move {
                let _permit = permit;
                let id = task.id.clone();
                // 内层 spawn 把 panic 隔离为 JoinError，仍能为该任务写一条记录
                let record = match tokio::spawn(shared.clone().run_one(task.clone(), cancel)).await {
                    Ok(record) => record,
                    Err(e) => {
                        tracing::error!(task_id = %id, error = %e, "task panicked");
                        RunRecord::internal_failure(
                            &task,
                            &shared.agent_name,
                            task.augmented_question(),
                            format!("task panicked: {e}"),
                            now_string(),
                            now_string(),
                        )
                    }
                };
                let ok = record.is_success();
                let appended = shared.store.append(&record).await.map(|_| ok);
                (id, appended)
            });
        }
        summary.not_started = pending_count - started;

        let mut write_error = None;
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((_, Ok(ok))) => {
                    summary.completed += 1;
                    if ok {
                        summary.succeeded += 1;
                    } else {
                        summary.failed += 1;
                    }
                }
                Ok((id, Err(e))) => {
                    tracing::error!(task_id = %id, error = %e, "could not append result");
                    write_error.get_or_insert(e);
                }
                Err(e) => tracing::error!(error = %e, "task runner crashed"),
            }
        }
        tracing::info!(
            completed = summary.completed,
            succeeded = summary.succeeded,
            failed = summary.failed,
            skipped = summary.skipped,
            not_started = summary.not_started,
            "run finished"
        );
        match write_error {
            Some(e) => Err(e),
            None => Ok(summary),
        }
    }
}
