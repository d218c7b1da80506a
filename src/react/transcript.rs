//! Transcript：单个状态机的有序 Turn 记录
//!
//! 只追加；每个 ToolCall 至多一个 ToolResult（按序号配对）；FinalAnswer 至多一个且必为最后一条。
//! 终态后 seal，之后任何追加都会被拒绝。

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::{AgentError, ToolError};
use crate::llm::Message;

/// 工具调用（参数已通过注册表校验）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub seq: u64,
    pub tool: String,
    pub args: Value,
}

/// 管理者 Transcript 指向子智能体 Outcome 的引用（不拥有子智能体状态）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubTaskHandle {
    pub agent: String,
    /// 在 TaskOutcome.sub_agents 中的下标
    pub index: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ResultOutcome {
    Success {
        payload: String,
        #[serde(default)]
        degraded: bool,
    },
    ToolFailure {
        error: ToolError,
    },
    /// 子智能体未在预算内给出答案
    DelegationFailure {
        detail: String,
    },
}

impl ResultOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ResultOutcome::Success { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub seq: u64,
    pub tool: String,
    pub outcome: ResultOutcome,
    pub latency_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handle: Option<SubTaskHandle>,
}

impl ToolResult {
    pub fn success(call: &ToolCall, payload: String, degraded: bool, latency_ms: u64) -> Self {
        Self {
            seq: call.seq,
            tool: call.tool.clone(),
            outcome: ResultOutcome::Success { payload, degraded },
            latency_ms,
            handle: None,
        }
    }

    pub fn failure(call: &ToolCall, error: ToolError, latency_ms: u64) -> Self {
        Self {
            seq: call.seq,
            tool: call.tool.clone(),
            outcome: ResultOutcome::ToolFailure { error },
            latency_ms,
            handle: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Turn {
    User {
        content: String,
    },
    /// synthetic 表示由引擎写入（反思结论、格式错误记录），而非模型原话
    Thought {
        content: String,
        #[serde(default)]
        synthetic: bool,
    },
    ToolCall(ToolCall),
    ToolResult(ToolResult),
    FinalAnswer {
        answer: String,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Transcript {
    turns: Vec<Turn>,
    #[serde(skip)]
    next_seq: u64,
    /// 已发出、尚无结果的调用序号
    #[serde(skip)]
    open_call: Option<u64>,
    #[serde(skip)]
    sealed: bool,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    /// 以任务提示作为第一条 UserTurn
    pub fn with_prompt(prompt: impl Into<String>) -> Self {
        Self {
            turns: vec![Turn::User { content: prompt.into() }],
            ..Self::default()
        }
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    pub fn last(&self) -> Option<&Turn> {
        self.turns.last()
    }

    /// 最近 n 条
    pub fn tail(&self, n: usize) -> &[Turn] {
        &self.turns[self.turns.len().saturating_sub(n)..]
    }

    /// 尚未配对结果的调用
    pub fn open_call(&self) -> Option<&ToolCall> {
        let seq = self.open_call?;
        self.turns.iter().rev().find_map(|t| match t {
            Turn::ToolCall(c) if c.seq == seq => Some(c),
            _ => None,
        })
    }

    pub fn final_answer(&self) -> Option<&str> {
        match self.turns.last() {
            Some(Turn::FinalAnswer { answer }) => Some(answer),
            _ => None,
        }
    }

    fn ensure_open(&self) -> Result<(), AgentError> {
        if self.sealed {
            Err(AgentError::Transcript("transcript is sealed".to_string()))
        } else {
            Ok(())
        }
    }

    pub fn push_user(&mut self, content: impl Into<String>) -> Result<(), AgentError> {
        self.ensure_open()?;
        self.turns.push(Turn::User {
            content: content.into(),
        });
        Ok(())
    }

    pub fn push_thought(&mut self, content: impl Into<String>, synthetic: bool) -> Result<(), AgentError> {
        self.ensure_open()?;
        self.turns.push(Turn::Thought {
            content: content.into(),
            synthetic,
        });
        Ok(())
    }

    /// 追加调用并分配序号；上一个调用必须已有结果
    pub fn push_call(&mut self, tool: impl Into<String>, args: Value) -> Result<ToolCall, AgentError> {
        self.ensure_open()?;
        if let Some(open) = self.open_call {
            return Err(AgentError::Transcript(format!("call #{open} has no result yet")));
        }
        self.next_seq += 1;
        let call = ToolCall {
            seq: self.next_seq,
            tool: tool.into(),
            args,
        };
        self.open_call = Some(call.seq);
        self.turns.push(Turn::ToolCall(call.clone()));
        Ok(call)
    }

    /// 检查结果能否追加（不修改）
    pub fn check_result(&self, result: &ToolResult) -> Result<(), AgentError> {
        self.ensure_open()?;
        match self.open_call {
            Some(seq) if seq == result.seq => Ok(()),
            Some(seq) => Err(AgentError::Transcript(format!(
                "result #{} does not match open call #{seq}",
                result.seq
            ))),
            None => Err(AgentError::Transcript(format!(
                "result #{} has no open call",
                result.seq
            ))),
        }
    }

    pub fn push_result(&mut self, result: ToolResult) -> Result<(), AgentError> {
        self.check_result(&result)?;
        self.open_call = None;
        self.turns.push(Turn::ToolResult(result));
        Ok(())
    }

    /// 追加最终答案并封存
    pub fn push_final(&mut self, answer: impl Into<String>) -> Result<(), AgentError> {
        self.ensure_open()?;
        if let Some(open) = self.open_call {
            return Err(AgentError::Transcript(format!("call #{open} has no result yet")));
        }
        self.turns.push(Turn::FinalAnswer { answer: answer.into() });
        self.sealed = true;
        Ok(())
    }

    pub fn seal(&mut self) {
        self.sealed = true;
    }

    /// 渲染为模型对话（不含 system）
    pub fn to_messages(&self) -> Vec<Message> {
        self.turns
            .iter()
            .map(|turn| match turn {
                Turn::User { content } => Message::user(content.clone()),
                Turn::Thought { content, synthetic: false } => Message::assistant(content.clone()),
                Turn::Thought { content, synthetic: true } => Message::user(format!("[note] {content}")),
                Turn::ToolCall(c) => Message::assistant(
                    serde_json::json!({ "tool": c.tool, "args": c.args }).to_string(),
                ),
                Turn::ToolResult(r) => Message::user(render_observation(r)),
                Turn::FinalAnswer { answer } => Message::assistant(format!("FINAL ANSWER: {answer}")),
            })
            .collect()
    }
}

/// 工具结果的文本形式（喂回模型，也用于反思上下文）
pub fn render_observation(r: &ToolResult) -> String {
    match &r.outcome {
        ResultOutcome::Success { payload, degraded: false } => {
            format!("Observation (call #{}, {}):\n{payload}", r.seq, r.tool)
        }
        ResultOutcome::Success { payload, degraded: true } => format!(
            "Observation (call #{}, {}, partial coverage, some sources failed):\n{payload}",
            r.seq, r.tool
        ),
        ResultOutcome::ToolFailure { error } => {
            format!("Error (call #{}, {}): {error}", r.seq, r.tool)
        }
        ResultOutcome::DelegationFailure { detail } => {
            format!("Delegation failed (call #{}, {}): {detail}", r.seq, r.tool)
        }
    }
}
