//! LLM 层：消息、客户端抽象、工具调用协议与实现（OpenAI 兼容 / Scripted）

pub mod message;
pub mod mock;
pub mod openai;
pub mod protocol;
pub mod traits;

pub use message::{Message, Role};
pub use mock::ScriptedLlmClient;
pub use openai::{OpenAiClient, TokenUsage};
pub use protocol::{extract_final_answer, parse_text, TextParse, FINAL_ANSWER_TOOL};
pub use traits::{
    LlmClient, LlmError, ModelReply, RetryConfig, RetryingLlmClient, ToolProtocol, ToolSpec,
};
