//! 错误恢复引擎
//!
//! 根据 ToolError / AgentError 返回 RecoveryAction，供状态机决定是退避重试、反思、记录失败、
//! 重新提示模型还是终止任务。重试次数与退避曲线均为配置项。

use std::time::Duration;

use crate::config::AgentSection;
use crate::core::{AgentError, RecoveryAction, ToolError};

/// 指数退避：delay(n) = min(cap, base * 2^n)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub cap: Duration,
}

impl BackoffPolicy {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self { base, cap }
    }

    pub fn delay(&self, attempt: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(31) as u32).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.cap)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::new(Duration::from_millis(500), Duration::from_secs(8))
    }
}

/// 语义化错误恢复：将错误映射为可执行动作
#[derive(Debug, Clone)]
pub struct RecoveryEngine {
    /// 瞬时工具错误（Timeout / RateLimited）的最大重试次数
    max_transient_retries: usize,
    /// 模型协议错误在 step 级别的最大重试次数，超过后任务失败
    max_step_retries: usize,
    backoff: BackoffPolicy,
}

impl Default for RecoveryEngine {
    fn default() -> Self {
        Self::new(2, 2, BackoffPolicy::default())
    }
}

impl RecoveryEngine {
    pub fn new(max_transient_retries: usize, max_step_retries: usize, backoff: BackoffPolicy) -> Self {
        Self {
            max_transient_retries,
            max_step_retries,
            backoff,
        }
    }

    pub fn from_config(cfg: &AgentSection) -> Self {
        Self::new(
            cfg.transient_tool_retries,
            cfg.max_step_retries,
            BackoffPolicy::new(
                Duration::from_millis(cfg.backoff_base_ms),
                Duration::from_millis(cfg.backoff_cap_ms),
            ),
        )
    }

    pub fn backoff(&self) -> BackoffPolicy {
        self.backoff
    }

    /// 工具调用失败：attempt 为已重试次数；reflect_enabled 表示该工具类别启用了反思且配额未耗尽
    pub fn on_tool_error(&self, err: &ToolError, attempt: usize, reflect_enabled: bool) -> RecoveryAction {
        if err.is_transient() && attempt < self.max_transient_retries {
            return RecoveryAction::RetryAfter(self.backoff.delay(attempt));
        }
        if reflect_enabled {
            RecoveryAction::Reflect
        } else {
            RecoveryAction::RecordFailure
        }
    }

    /// 规划阶段失败：protocol_failures 为本任务已发生的协议错误次数（含本次）
    pub fn on_agent_error(&self, err: &AgentError, protocol_failures: usize) -> RecoveryAction {
        match err {
            AgentError::ModelProtocol(problem) if protocol_failures <= self.max_step_retries => {
                RecoveryAction::Reprompt(self.reprompt_for(problem))
            }
            _ => RecoveryAction::Abort,
        }
    }

    pub fn reprompt_for(&self, problem: &str) -> String {
        format_reprompt(problem)
    }
}

/// 输出格式修正提示（原地重新提示与 step 级重试共用）
pub fn format_reprompt(problem: &str) -> String {
    format!(
        "Your previous reply could not be used: {problem}. \
         Reply with exactly one JSON object of the form {{\"tool\": \"<tool name>\", \"args\": {{...}}}} \
         using only the tools listed, or give your result with \
         {{\"tool\": \"final_answer\", \"args\": {{\"answer\": \"...\"}}}}. Output nothing else."
    )
}
