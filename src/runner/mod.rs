//! 批量运行：任务加载、并发编排、结果日志与断点续跑

pub mod orchestrator;
pub mod record;
pub mod reformulate;
pub mod results;
pub mod run_dir;
pub mod scorer;
pub mod task;

pub use orchestrator::{RunOptions, RunOrchestrator, RunSummary};
pub use record::RunRecord;
pub use reformulate::AnswerReformulator;
pub use results::ResultsStore;
pub use run_dir::RunDir;
pub use scorer::{NoopScorer, Scorer};
pub use task::{select_tasks, JsonlTaskSource, Task, TaskSource, TaskSourceError, VecTaskSource};
