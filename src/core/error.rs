//! Agent 错误类型与恢复动作
//!
//! 与 RecoveryEngine 配合：根据 AgentError / ToolError 决定重试、反思、记录失败或终止。

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::llm::LlmError;

/// 工具错误分类（每个工具声明自己可能返回的种类）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolErrorKind {
    /// 工具调用超时
    Timeout,
    /// 上游限流（含本地限流计数器拒绝）
    RateLimited,
    /// 参数非法或请求了白名单外的能力
    InvalidInput,
    /// 目标不存在（未知工具、404、零结果）
    NotFound,
    /// 上游服务失败
    UpstreamFailure,
}

impl ToolErrorKind {
    /// Timeout / RateLimited 为瞬时错误，由 ACTING 状态按退避重试
    pub fn is_transient(self) -> bool {
        matches!(self, ToolErrorKind::Timeout | ToolErrorKind::RateLimited)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ToolErrorKind::Timeout => "timeout",
            ToolErrorKind::RateLimited => "rate_limited",
            ToolErrorKind::InvalidInput => "invalid_input",
            ToolErrorKind::NotFound => "not_found",
            ToolErrorKind::UpstreamFailure => "upstream_failure",
        }
    }
}

impl fmt::Display for ToolErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 工具调用失败：种类 + 可读描述
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct ToolError {
    pub kind: ToolErrorKind,
    pub message: String,
}

impl ToolError {
    pub fn new(kind: ToolErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ToolErrorKind::Timeout, message)
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::new(ToolErrorKind::RateLimited, message)
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(ToolErrorKind::InvalidInput, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ToolErrorKind::NotFound, message)
    }

    pub fn upstream(message: impl Into<String>) -> Self {
        Self::new(ToolErrorKind::UpstreamFailure, message)
    }

    pub fn is_transient(&self) -> bool {
        self.kind.is_transient()
    }
}

/// 单个任务执行过程中可能出现的错误（模型协议、模型不可用、工具、预算、委派、取消）
#[derive(Error, Debug)]
pub enum AgentError {
    /// 模型输出在有限次修正后仍无法解析为工具调用或最终答案
    #[error("Model protocol error: {0}")]
    ModelProtocol(String),

    /// 模型后端在自身重试策略后仍失败（传输 / 鉴权）
    #[error("Model unavailable: {0}")]
    ModelUnavailable(#[source] LlmError),

    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),

    #[error("Step budget exhausted ({consumed}/{max_steps})")]
    BudgetExhausted { consumed: usize, max_steps: usize },

    #[error("Task deadline exceeded")]
    DeadlineExceeded,

    /// 子智能体未在分配预算内到达终态
    #[error("Delegation error: {0}")]
    Delegation(String),

    #[error("Cancelled")]
    Cancelled,

    /// 状态机已到达终态后再次推进
    #[error("Agent already terminated in state {0}")]
    AlreadyTerminated(String),

    /// 终态 Transcript 不允许再追加
    #[error("Transcript error: {0}")]
    Transcript(String),

    #[error("Config error: {0}")]
    ConfigError(String),
}

/// 终态失败原因（写入 Outcome，可序列化）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureReason {
    BudgetExhausted { max_steps: usize },
    DeadlineExceeded,
    ModelProtocol { detail: String },
    ModelUnavailable { detail: String },
    Tool { error: ToolError },
    Delegation { detail: String },
    Cancelled,
    Internal { detail: String },
}

impl FailureReason {
    pub fn is_budget_exhausted(&self) -> bool {
        matches!(self, FailureReason::BudgetExhausted { .. })
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::BudgetExhausted { max_steps } => {
                write!(f, "step budget of {max_steps} exhausted without a final answer")
            }
            FailureReason::DeadlineExceeded => f.write_str("task deadline exceeded"),
            FailureReason::ModelProtocol { detail } => write!(f, "model protocol error: {detail}"),
            FailureReason::ModelUnavailable { detail } => write!(f, "model unavailable: {detail}"),
            FailureReason::Tool { error } => write!(f, "tool error: {error}"),
            FailureReason::Delegation { detail } => write!(f, "delegation error: {detail}"),
            FailureReason::Cancelled => f.write_str("cancelled"),
            FailureReason::Internal { detail } => write!(f, "internal error: {detail}"),
        }
    }
}

impl From<&AgentError> for FailureReason {
    fn from(err: &AgentError) -> Self {
        match err {
            AgentError::ModelProtocol(d) => FailureReason::ModelProtocol { detail: d.clone() },
            AgentError::ModelUnavailable(e) => FailureReason::ModelUnavailable {
                detail: e.to_string(),
            },
            AgentError::Tool(e) => FailureReason::Tool { error: e.clone() },
            AgentError::BudgetExhausted { max_steps, .. } => FailureReason::BudgetExhausted {
                max_steps: *max_steps,
            },
            AgentError::DeadlineExceeded => FailureReason::DeadlineExceeded,
            AgentError::Delegation(d) => FailureReason::Delegation { detail: d.clone() },
            AgentError::Cancelled => FailureReason::Cancelled,
            other => FailureReason::Internal {
                detail: other.to_string(),
            },
        }
    }
}

/// 恢复引擎根据错误类型给出的建议动作
#[derive(Debug, Clone, PartialEq)]
pub enum RecoveryAction {
    /// 等待后重试同一调用（瞬时工具错误）
    RetryAfter(Duration),
    /// 交给 Reflection 模块复盘（永久错误且该工具类别启用了反思）
    Reflect,
    /// 追加失败的 ToolResult 并回到 PLANNING
    RecordFailure,
    /// 将提示注入下一轮，让模型修正输出格式
    Reprompt(String),
    /// 终止当前任务
    Abort,
}
