//! Task 与数据集读取
//!
//! Task 只读；TaskSource 每次 load() 都从头产出同一组任务，可重复调用。
//! JSONL 字段兼容常见基准的列名（task_id / Question / Final answer / file_name）。

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 问题前缀：强调必须给出答案
pub const AUGMENTED_QUESTION_PREFIX: &str = "You have one question to answer. It is paramount that you provide a correct answer.\n\
Give it all you can: I know for a fact that you have access to all the relevant tools to solve it and find the correct answer (the answer does exist). \n\
Failure or 'I cannot answer' or 'None found' will not be tolerated, success will be rewarded.\n\
Run verification steps if that's needed, you must make sure you find the correct answer!\n\
Here is the task:\n";

const SINGLE_ATTACHMENT_PREFIX: &str = "\n\nTo solve the task above, you will have to use this attached file:";
const MULTIPLE_ATTACHMENT_PREFIX: &str = "\n\nTo solve the task above, you will have to use these attached files:\n";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    #[serde(alias = "task_id")]
    pub id: String,
    #[serde(alias = "Question")]
    pub question: String,
    #[serde(default)]
    pub attachments: Vec<PathBuf>,
    #[serde(default, alias = "Category", alias = "Level")]
    pub category: Option<String>,
    /// 参考答案，原样透传给评分方
    #[serde(default, alias = "answer", alias = "Final answer")]
    pub reference_answer: Option<String>,
}

impl Task {
    pub fn new(id: impl Into<String>, question: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            question: question.into(),
            attachments: Vec::new(),
            category: None,
            reference_answer: None,
        }
    }

    pub fn with_attachment(mut self, path: impl Into<PathBuf>) -> Self {
        self.attachments.push(path.into());
        self
    }

    /// 交给智能体的完整问题：前缀 + 原题 + 附件说明
    pub fn augmented_question(&self) -> String {
        let mut q = format!("{AUGMENTED_QUESTION_PREFIX}{}", self.question);
        match self.attachments.as_slice() {
            [] => {}
            [single] => {
                q.push_str(SINGLE_ATTACHMENT_PREFIX);
                q.push_str(&format!(
                    "\nAttached file: {}\nUse the file inspection tools with this path to read it.",
                    single.display()
                ));
            }
            many => {
                q.push_str(MULTIPLE_ATTACHMENT_PREFIX);
                for p in many {
                    q.push_str(&format!("- Attached file: {}\n", p.display()));
                }
                q.push_str("Use the file inspection tools with these paths to read them.");
            }
        }
        q
    }
}

#[derive(Error, Debug)]
pub enum TaskSourceError {
    #[error("Dataset not found: {0}")]
    NotFound(PathBuf),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Line {line}: {message}")]
    Parse { line: usize, message: String },
}

/// 数据集：有限、可重复读取
#[async_trait]
pub trait TaskSource: Send + Sync {
    async fn load(&self) -> Result<Vec<Task>, TaskSourceError>;
}

/// 内存中的任务列表（测试与嵌入使用）
pub struct VecTaskSource(pub Vec<Task>);

#[async_trait]
impl TaskSource for VecTaskSource {
    async fn load(&self) -> Result<Vec<Task>, TaskSourceError> {
        Ok(self.0.clone())
    }
}

#[derive(Deserialize)]
struct RawTask {
    #[serde(flatten)]
    task: Task,
    /// 单个附件（基准数据常见写法）
    #[serde(default)]
    file_name: Option<String>,
}

/// 每行一个 JSON 任务；附件的相对路径相对于 attachments_root
pub struct JsonlTaskSource {
    path: PathBuf,
    attachments_root: Option<PathBuf>,
}

impl JsonlTaskSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let attachments_root = path.parent().map(Path::to_path_buf);
        Self { path, attachments_root }
    }

    pub fn with_attachments_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.attachments_root = Some(root.into());
        self
    }

    fn resolve(&self, p: PathBuf) -> PathBuf {
        match &self.attachments_root {
            Some(root) if p.is_relative() => root.join(p),
            _ => p,
        }
    }
}

#[async_trait]
impl TaskSource for JsonlTaskSource {
    async fn load(&self) -> Result<Vec<Task>, TaskSourceError> {
        if !self.path.exists() {
            return Err(TaskSourceError::NotFound(self.path.clone()));
        }
        let content = tokio::fs::read_to_string(&self.path).await?;
        let mut tasks = Vec::new();
        for (i, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let raw: RawTask = serde_json::from_str(line).map_err(|e| TaskSourceError::Parse {
                line: i + 1,
                message: e.to_string(),
            })?;
            let mut task = raw.task;
            if let Some(f) = raw.file_name.filter(|f| !f.trim().is_empty()) {
                task.attachments.push(PathBuf::from(f));
            }
            task.attachments = task.attachments.into_iter().map(|p| self.resolve(p)).collect();
            tasks.push(task);
        }
        tracing::info!(path = %self.path.display(), count = tasks.len(), "dataset loaded");
        Ok(tasks)
    }
}

/// 按 id 或 1 起始的序号筛选；selected 为空时返回全部。
/// 与某个任务 id 相同的条目只按 id 匹配
pub fn select_tasks(tasks: Vec<Task>, selected: &[String]) -> Vec<Task> {
    if selected.is_empty() {
        return tasks;
    }
    let ids: HashSet<String> = tasks.iter().map(|t| t.id.clone()).collect();
    let indices: HashSet<usize> = selected
        .iter()
        .filter(|s| !ids.contains(s.as_str()))
        .filter_map(|s| s.trim().parse::<usize>().ok())
        .collect();
    tasks
        .into_iter()
        .enumerate()
        .filter(|(i, t)| indices.contains(&(i + 1)) || selected.iter().any(|s| s == &t.id))
        .map(|(_, t)| t)
        .collect()
}
