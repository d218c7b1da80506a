//! 脚本化 LLM 客户端（用于测试与 `mock` provider，无需 API）
//!
//! 按顺序回放预置的回复；脚本耗尽后返回 fallback（默认为 InvalidResponse 错误）。
//! 记录每次调用收到的消息，便于断言 prompt 内容。

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::llm::{LlmClient, LlmError, Message, ModelReply, ToolProtocol, ToolSpec};

pub struct ScriptedLlmClient {
    script: Mutex<VecDeque<Result<ModelReply, LlmError>>>,
    fallback: Option<ModelReply>,
    protocol: ToolProtocol,
    received: Mutex<Vec<Vec<Message>>>,
}

impl ScriptedLlmClient {
    pub fn new(replies: Vec<ModelReply>) -> Self {
        Self::from_results(replies.into_iter().map(Ok).collect())
    }

    pub fn from_results(results: Vec<Result<ModelReply, LlmError>>) -> Self {
        Self {
            script: Mutex::new(results.into()),
            fallback: None,
            protocol: ToolProtocol::Structured,
            received: Mutex::new(Vec::new()),
        }
    }

    /// 脚本耗尽后一直返回该回复
    pub fn with_fallback(mut self, reply: ModelReply) -> Self {
        self.fallback = Some(reply);
        self
    }

    pub fn with_protocol(mut self, protocol: ToolProtocol) -> Self {
        self.protocol = protocol;
        self
    }

    /// 已收到的调用次数
    pub fn calls(&self) -> usize {
        self.received.lock().map(|r| r.len()).unwrap_or(0)
    }

    /// 第 n 次调用收到的消息
    pub fn received(&self, n: usize) -> Option<Vec<Message>> {
        self.received.lock().ok().and_then(|r| r.get(n).cloned())
    }

    pub fn remaining(&self) -> usize {
        self.script.lock().map(|s| s.len()).unwrap_or(0)
    }
}

#[async_trait]
impl LlmClient for ScriptedLlmClient {
    async fn complete(&self, messages: &[Message], _tools: &[ToolSpec]) -> Result<ModelReply, LlmError> {
        if let Ok(mut received) = self.received.lock() {
            received.push(messages.to_vec());
        }
        let next = self.script.lock().ok().and_then(|mut s| s.pop_front());
        match next {
            Some(result) => result,
            None => self
                .fallback
                .clone()
                .ok_or_else(|| LlmError::InvalidResponse("script exhausted".to_string())),
        }
    }

    fn protocol(&self) -> ToolProtocol {
        self.protocol
    }
}
