//! OpenAI 兼容 API 客户端
//!
//! 通过 async_openai 调用任意 OpenAI 兼容端点（可配置 base_url）。
//! structured 协议下把工具列表渲染进 system prompt，并把回复解析为结构化工具调用；
//! plain_text 协议下不发送工具列表，原样返回文本。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_openai::config::OpenAIConfig;
use async_openai::types::chat::{
    ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
    ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
    CreateChatCompletionRequestArgs,
};
use async_openai::Client;
use async_trait::async_trait;

use crate::config::LlmSection;
use crate::llm::protocol::{parse_text, render_tool_prompt, TextParse};
use crate::llm::{LlmClient, LlmError, Message, ModelReply, Role, ToolProtocol, ToolSpec};

/// Token 使用统计（累计值）
#[derive(Debug, Clone, Default)]
pub struct TokenUsage {
    pub prompt_tokens: Arc<AtomicU64>,
    pub completion_tokens: Arc<AtomicU64>,
    pub total_tokens: Arc<AtomicU64>,
}

impl TokenUsage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, prompt: u64, completion: u64) {
        self.prompt_tokens.fetch_add(prompt, Ordering::Relaxed);
        self.completion_tokens.fetch_add(completion, Ordering::Relaxed);
        self.total_tokens.fetch_add(prompt + completion, Ordering::Relaxed);
    }

    pub fn get(&self) -> (u64, u64, u64) {
        (
            self.prompt_tokens.load(Ordering::Relaxed),
            self.completion_tokens.load(Ordering::Relaxed),
            self.total_tokens.load(Ordering::Relaxed),
        )
    }
}

/// OpenAI 兼容客户端：持有 Client、模型名、采样参数与协议模式
pub struct OpenAiClient {
    client: Client<OpenAIConfig>,
    model: String,
    temperature: f32,
    max_tokens: u32,
    request_timeout: Duration,
    protocol: ToolProtocol,
    pub usage: TokenUsage,
}

impl OpenAiClient {
    pub fn new(base_url: Option<&str>, model: &str, api_key: Option<&str>) -> Self {
        let api_key = api_key
            .map(String::from)
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .unwrap_or_else(|| "sk-placeholder".to_string());

        let config = if let Some(url) = base_url {
            OpenAIConfig::new().with_api_base(url).with_api_key(api_key)
        } else {
            OpenAIConfig::new().with_api_key(api_key)
        };

        Self {
            client: Client::with_config(config),
            model: model.to_string(),
            temperature: 0.8,
            max_tokens: 4096,
            request_timeout: Duration::from_secs(120),
            protocol: ToolProtocol::Structured,
            usage: TokenUsage::new(),
        }
    }

    /// 从 [llm] 段创建；base_url 未配置时读取 OPENAI_BASE_URL
    pub fn from_config(cfg: &LlmSection) -> Self {
        let base = cfg
            .base_url
            .clone()
            .or_else(|| std::env::var("OPENAI_BASE_URL").ok());
        let mut client = Self::new(base.as_deref(), &cfg.model, None);
        client.temperature = cfg.temperature;
        client.max_tokens = cfg.max_tokens;
        client.request_timeout = Duration::from_secs(cfg.request_timeout_secs);
        client.protocol = cfg.protocol;
        client
    }

    pub fn with_protocol(mut self, protocol: ToolProtocol) -> Self {
        self.protocol = protocol;
        self
    }

    fn to_openai_messages(
        &self,
        messages: &[Message],
        tools: &[ToolSpec],
    ) -> Result<Vec<ChatCompletionRequestMessage>, LlmError> {
        let build_err = |e: async_openai::error::OpenAIError| LlmError::InvalidResponse(e.to_string());
        let mut out = Vec::with_capacity(messages.len() + 1);
        // structured 协议：工具列表并入第一条 system 消息（若没有则单独插入一条）
        let tool_block = match self.protocol {
            ToolProtocol::Structured if !tools.is_empty() => Some(render_tool_prompt(tools)),
            _ => None,
        };
        let mut tool_block_used = false;
        for m in messages {
            let msg = match m.role {
                Role::System => {
                    let content = match (&tool_block, tool_block_used) {
                        (Some(block), false) => {
                            tool_block_used = true;
                            format!("{}\n\n{}", m.content, block)
                        }
                        _ => m.content.clone(),
                    };
                    ChatCompletionRequestMessage::System(
                        ChatCompletionRequestSystemMessageArgs::default()
                            .content(content)
                            .build()
                            .map_err(build_err)?,
                    )
                }
                Role::User => ChatCompletionRequestMessage::User(
                    ChatCompletionRequestUserMessageArgs::default()
                        .content(m.content.clone())
                        .build()
                        .map_err(build_err)?,
                ),
                Role::Assistant => ChatCompletionRequestMessage::Assistant(
                    ChatCompletionRequestAssistantMessageArgs::default()
                        .content(m.content.clone())
                        .build()
                        .map_err(build_err)?,
                ),
            };
            out.push(msg);
        }
        if let (Some(block), false) = (tool_block, tool_block_used) {
            out.insert(
                0,
                ChatCompletionRequestMessage::System(
                    ChatCompletionRequestSystemMessageArgs::default()
                        .content(block)
                        .build()
                        .map_err(build_err)?,
                ),
            );
        }
        Ok(out)
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    async fn complete(&self, messages: &[Message], tools: &[ToolSpec]) -> Result<ModelReply, LlmError> {
        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .messages(self.to_openai_messages(messages, tools)?)
            .temperature(self.temperature)
            .max_completion_tokens(self.max_tokens)
            .build()
            .map_err(|e| LlmError::InvalidResponse(e.to_string()))?;

        let response = tokio::time::timeout(self.request_timeout, self.client.chat().create(request))
            .await
            .map_err(|_| LlmError::Timeout)?
            .map_err(|e| LlmError::classify(e.to_string()))?;

        if let Some(usage) = &response.usage {
            self.usage
                .add(usage.prompt_tokens as u64, usage.completion_tokens as u64);
        }

        let content = response
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .ok_or_else(|| LlmError::InvalidResponse("response has no message content".to_string()))?;

        if self.protocol == ToolProtocol::PlainText || tools.is_empty() {
            return Ok(ModelReply::Text(content));
        }
        Ok(match parse_text(&content) {
            TextParse::ToolCall { name, arguments } => ModelReply::ToolCall { name, arguments },
            // 无法解析的文本交给 Step Executor 判断（最终答案标记 / 重新提示）
            TextParse::Malformed(_) | TextParse::Prose(_) => ModelReply::Text(content),
        })
    }

    fn protocol(&self) -> ToolProtocol {
        self.protocol
    }

    fn token_usage(&self) -> (u64, u64, u64) {
        self.usage.get()
    }
}
