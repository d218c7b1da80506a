//! 状态机过程事件：状态迁移、工具调用、观察、重试、反思、委派与终态
//!
//! 通过可选的 UnboundedSender 推送；没有接收方时静默丢弃。

use serde::Serialize;

use crate::react::loop_::{AgentPhase, AgentStatus};

pub type EventSender = tokio::sync::mpsc::UnboundedSender<AgentEvent>;

/// 单个事件（可序列化为 JSON）
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    StateChanged {
        agent: String,
        from: AgentPhase,
        to: AgentPhase,
    },
    /// 正在调用模型规划下一步
    Thinking {
        agent: String,
        consumed: usize,
        max_steps: usize,
    },
    ToolCall {
        agent: String,
        seq: u64,
        tool: String,
        args: serde_json::Value,
    },
    /// 结果已写入 Transcript（预览，避免过长）
    Observation {
        agent: String,
        seq: u64,
        tool: String,
        ok: bool,
        degraded: bool,
        preview: String,
    },
    /// 瞬时错误退避重试
    Retry {
        agent: String,
        tool: String,
        attempt: usize,
        delay_ms: u64,
        reason: String,
    },
    Reflection {
        agent: String,
        tool: String,
        revised: bool,
        critique: String,
    },
    DelegationStarted {
        agent: String,
        sub_agent: String,
        task: String,
        max_steps: usize,
    },
    DelegationFinished {
        agent: String,
        sub_agent: String,
        status: AgentStatus,
        steps: usize,
    },
    Terminal {
        agent: String,
        status: AgentStatus,
        steps: usize,
    },
}

pub(crate) fn emit(tx: &Option<EventSender>, ev: AgentEvent) {
    if let Some(t) = tx {
        let _ = t.send(ev);
    }
}

/// 预览截断（按字符）
pub(crate) fn preview(text: &str, max_chars: usize) -> String {
    if text.chars().count() > max_chars {
        format!("{}...", text.chars().take(max_chars).collect::<String>())
    } else {
        text.to_string()
    }
}
