//! LLM 客户端抽象
//!
//! 所有后端（OpenAI 兼容 / Scripted）实现 LlmClient：给定对话与可用工具，返回工具调用或纯文本。
//! RetryingLlmClient 为任意后端加上退避重试，重试耗尽后由 Step Executor 转为 ModelUnavailable。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::llm::Message;

/// 模型后端错误（传输层分类）
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LlmError {
    #[error("Rate limited (retry after {retry_after_ms:?} ms)")]
    RateLimited { retry_after_ms: Option<u64> },

    #[error("Request timed out")]
    Timeout,

    #[error("Transport error: {0}")]
    Transport(String),

    /// 鉴权失败不重试
    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

impl LlmError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, LlmError::Auth(_))
    }

    /// 按错误文本粗分类（各 SDK 错误类型不同，这里统一按状态码 / 关键词判断）
    pub fn classify(message: impl Into<String>) -> Self {
        let message = message.into();
        let lower = message.to_lowercase();
        if lower.contains("429") || lower.contains("rate limit") || lower.contains("rate_limit") {
            LlmError::RateLimited { retry_after_ms: None }
        } else if lower.contains("401")
            || lower.contains("403")
            || lower.contains("api key")
            || lower.contains("unauthorized")
        {
            LlmError::Auth(message)
        } else if lower.contains("timed out") || lower.contains("timeout") {
            LlmError::Timeout
        } else {
            LlmError::Transport(message)
        }
    }
}

/// 工具调用协议：structured 通过结构化 JSON 调用工具；plain_text 只返回文本
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolProtocol {
    #[default]
    Structured,
    PlainText,
}

/// 提供给模型的工具描述（名称 / 说明 / 参数 JSON Schema）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// 模型一次回复：工具调用（含 final_answer 与委派）或纯文本
#[derive(Debug, Clone, PartialEq)]
pub enum ModelReply {
    ToolCall { name: String, arguments: Value },
    Text(String),
}

impl ModelReply {
    pub fn tool_call(name: impl Into<String>, arguments: Value) -> Self {
        ModelReply::ToolCall {
            name: name.into(),
            arguments,
        }
    }

    pub fn final_answer(answer: impl Into<String>) -> Self {
        ModelReply::ToolCall {
            name: crate::llm::FINAL_ANSWER_TOOL.to_string(),
            arguments: serde_json::json!({ "answer": answer.into() }),
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        ModelReply::Text(text.into())
    }
}

#[async_trait]
pub trait LlmClient: Send + Sync {
    /// 给定完整对话与可用工具，返回一次回复
    async fn complete(&self, messages: &[Message], tools: &[ToolSpec]) -> Result<ModelReply, LlmError>;

    /// 当前后端使用的工具调用协议
    fn protocol(&self) -> ToolProtocol {
        ToolProtocol::Structured
    }

    /// 获取累计 token 使用统计：(prompt_tokens, completion_tokens, total_tokens)
    fn token_usage(&self) -> (u64, u64, u64) {
        (0, 0, 0)
    }
}

/// 重试配置：最大尝试次数与指数退避
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryConfig {
    pub max_attempts: usize,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(10),
        }
    }
}

impl RetryConfig {
    fn backoff(&self, attempt: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(31) as u32).unwrap_or(u32::MAX);
        self.initial_backoff.saturating_mul(factor).min(self.max_backoff)
    }
}

/// 带重试的 LLM 客户端：限流时优先使用服务端给出的 retry_after
pub struct RetryingLlmClient {
    inner: Arc<dyn LlmClient>,
    config: RetryConfig,
}

impl RetryingLlmClient {
    pub fn new(inner: Arc<dyn LlmClient>, config: RetryConfig) -> Self {
        Self { inner, config }
    }
}

#[async_trait]
impl LlmClient for RetryingLlmClient {
    async fn complete(&self, messages: &[Message], tools: &[ToolSpec]) -> Result<ModelReply, LlmError> {
        let attempts = self.config.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            match self.inner.complete(messages, tools).await {
                Ok(reply) => return Ok(reply),
                Err(e) if e.is_retryable() && attempt + 1 < attempts => {
                    let delay = match &e {
                        LlmError::RateLimited {
                            retry_after_ms: Some(ms),
                        } => Duration::from_millis(*ms).min(self.config.max_backoff),
                        _ => self.config.backoff(attempt),
                    };
                    tracing::warn!(attempt, error = %e, delay_ms = delay.as_millis() as u64, "llm call failed, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn protocol(&self) -> ToolProtocol {
        self.inner.protocol()
    }

    fn token_usage(&self) -> (u64, u64, u64) {
        self.inner.token_usage()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ScriptedLlmClient;

    fn fast_retry(max_attempts: usize) -> RetryConfig {
        RetryConfig {
            max_attempts,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
        }
    }

    #[test]
    fn test_classify() {
        assert!(matches!(LlmError::classify("HTTP 429 Too Many Requests"), LlmError::RateLimited { .. }));
        assert!(matches!(LlmError::classify("Incorrect API key provided"), LlmError::Auth(_)));
        assert_eq!(LlmError::classify("operation timed out"), LlmError::Timeout);
        assert!(matches!(LlmError::classify("connection reset"), LlmError::Transport(_)));
    }

    #[tokio::test]
    async fn test_retrying_client_recovers_from_transient_errors() {
        let inner = Arc::new(ScriptedLlmClient::from_results(vec![
            Err(LlmError::Timeout),
            Err(LlmError::RateLimited { retry_after_ms: Some(1) }),
            Ok(ModelReply::final_answer("42")),
        ]));
        let client = RetryingLlmClient::new(inner.clone(), fast_retry(3));
        let reply = client.complete(&[Message::user("q")], &[]).await.unwrap();
        assert_eq!(reply, ModelReply::final_answer("42"));
        assert_eq!(inner.calls(), 3);
    }

    #[tokio::test]
    async fn test_retrying_client_gives_up() {
        let inner = Arc::new(ScriptedLlmClient::from_results(vec![
            Err(LlmError::Transport("down".into())),
            Err(LlmError::Transport("down".into())),
        ]));
        let client = RetryingLlmClient::new(inner.clone(), fast_retry(2));
        let err = client.complete(&[Message::user("q")], &[]).await.unwrap_err();
        assert!(matches!(err, LlmError::Transport(_)));
        assert_eq!(inner.calls(), 2);
    }

    #[tokio::test]
    async fn test_auth_errors_are_not_retried() {
        let inner = Arc::new(ScriptedLlmClient::from_results(vec![Err(LlmError::Auth("bad".into()))]));
        let client = RetryingLlmClient::new(inner.clone(), fast_retry(5));
        assert!(client.complete(&[], &[]).await.is_err());
        assert_eq!(inner.calls(), 1);
    }
}
