//! Step Executor：执行一次推理步
//!
//! 把 system prompt + Transcript 发给模型，解析出工具调用、委派或最终答案。
//! 工具调用在返回前按注册表 schema 校验；无法解析或校验失败时原地重新提示（有上限），
//! 仍失败则返回 ModelProtocol。模型后端错误（已经过后端自身重试）返回 ModelUnavailable。

use std::sync::Arc;

use serde_json::Value;

use crate::core::{format_reprompt, AgentError, Budget};
use crate::llm::protocol::final_answer_spec;
use crate::llm::{
    extract_final_answer, parse_text, LlmClient, Message, ModelReply, TextParse, ToolProtocol, ToolSpec,
    FINAL_ANSWER_TOOL,
};
use crate::react::transcript::Transcript;
use crate::tools::ToolExecutor;

/// 一步的决策
#[derive(Debug, Clone, PartialEq)]
pub enum StepDecision {
    ToolCall { tool: String, args: Value },
    /// 委派给子智能体
    Delegate { task: String },
    FinalAnswer(String),
}

/// 本步可用的能力：工具（可按角色限制）与可选的子智能体
#[derive(Clone, Copy)]
pub struct StepContext<'a> {
    pub tools: &'a ToolExecutor,
    pub allowed: Option<&'a [String]>,
    pub delegate: Option<&'a ToolSpec>,
}

impl<'a> StepContext<'a> {
    pub fn specs(&self) -> Vec<ToolSpec> {
        let mut specs = self.tools.specs(self.allowed);
        if let Some(d) = self.delegate {
            specs.push(d.clone());
        }
        specs.push(final_answer_spec());
        specs
    }

    fn is_allowed(&self, tool: &str) -> bool {
        self.allowed.map_or(true, |a| a.iter().any(|t| t == tool))
    }

    /// 校验一个具体调用（供反思修正后的调用复用）
    pub fn validate_call(&self, tool: &str, args: &Value) -> Result<(), String> {
        if !self.is_allowed(tool) {
            return Err(format!("tool `{tool}` is not available to this agent"));
        }
        self.tools.validate(tool, args).map(|_| ()).map_err(|e| e.to_string())
    }
}

pub struct StepExecutor {
    llm: Arc<dyn LlmClient>,
    system_prompt: String,
    max_reprompts: usize,
}

impl StepExecutor {
    pub fn new(llm: Arc<dyn LlmClient>, system_prompt: impl Into<String>, max_reprompts: usize) -> Self {
        Self {
            llm,
            system_prompt: system_prompt.into(),
            max_reprompts,
        }
    }

    pub fn system_prompt(&self) -> &str {
        &self.system_prompt
    }

    pub fn token_usage(&self) -> (u64, u64, u64) {
        self.llm.token_usage()
    }

    fn build_messages(&self, transcript: &Transcript, budget: &Budget, hint: Option<&str>) -> Vec<Message> {
        let system = format!(
            "{}\n\nYou have used {} of {} steps; {} remaining.",
            self.system_prompt,
            budget.consumed_steps(),
            budget.max_steps(),
            budget.remaining()
        );
        let mut messages = vec![Message::system(system)];
        messages.extend(transcript.to_messages());
        if let Some(h) = hint {
            messages.push(Message::user(h.to_string()));
        }
        messages
    }

    /// execute(transcript, budget) → ToolCall | Delegate | FinalAnswer
    pub async fn execute(
        &self,
        transcript: &Transcript,
        budget: &Budget,
        ctx: &StepContext<'_>,
        hint: Option<&str>,
    ) -> Result<StepDecision, AgentError> {
        let specs = ctx.specs();
        let mut messages = self.build_messages(transcript, budget, hint);
        let protocol = self.llm.protocol();
        let mut attempt = 0;
        loop {
            let reply = self
                .llm
                .complete(&messages, &specs)
                .await
                .map_err(AgentError::ModelUnavailable)?;
            let problem = match interpret(&reply, protocol, ctx) {
                Ok(decision) => return Ok(decision),
                Err(problem) => problem,
            };
            if attempt >= self.max_reprompts {
                return Err(AgentError::ModelProtocol(problem));
            }
            attempt += 1;
            tracing::warn!(attempt, problem = %problem, "unusable model reply, re-prompting");
            messages.push(Message::assistant(reply_text(&reply)));
            messages.push(Message::user(format_reprompt(&problem)));
        }
    }
}

fn reply_text(reply: &ModelReply) -> String {
    match reply {
        ModelReply::Text(t) => t.clone(),
        ModelReply::ToolCall { name, arguments } => {
            serde_json::json!({ "tool": name, "args": arguments }).to_string()
        }
    }
}

/// 把回复解析为决策；Err 为给模型看的问题描述
pub fn interpret(reply: &ModelReply, protocol: ToolProtocol, ctx: &StepContext<'_>) -> Result<StepDecision, String> {
    match reply {
        ModelReply::ToolCall { name, arguments } => interpret_call(name, arguments, ctx),
        ModelReply::Text(text) => {
            if let Some(answer) = extract_final_answer(text) {
                return Ok(StepDecision::FinalAnswer(answer));
            }
            match (parse_text(text), protocol) {
                (TextParse::ToolCall { name, arguments }, _) => interpret_call(&name, &arguments, ctx),
                // plain_text 协议下，不含工具调用的文本即为答案
                (_, ToolProtocol::PlainText) if !text.trim().is_empty() => {
                    Ok(StepDecision::FinalAnswer(text.trim().to_string()))
                }
                (TextParse::Malformed(e), _) => Err(format!("malformed tool call ({e})")),
                _ => Err("the reply contained neither a tool call nor a final answer".to_string()),
            }
        }
    }
}

fn interpret_call(name: &str, args: &Value, ctx: &StepContext<'_>) -> Result<StepDecision, String> {
    if name == FINAL_ANSWER_TOOL {
        let answer = match args.get("answer") {
            Some(Value::String(s)) => s.trim().to_string(),
            Some(Value::Null) | None => String::new(),
            Some(other) => other.to_string(),
        };
        if answer.is_empty() {
            return Err(format!("`{FINAL_ANSWER_TOOL}` requires a non-empty `answer`"));
        }
        return Ok(StepDecision::FinalAnswer(answer));
    }
    if let Some(spec) = ctx.delegate.filter(|d| d.name == name) {
        let task = args.get("task").and_then(|t| t.as_str()).unwrap_or("").trim();
        if task.is_empty() {
            return Err(format!("`{}` requires a `task` describing what to do", spec.name));
        }
        return Ok(StepDecision::Delegate { task: task.to_string() });
    }
    ctx.validate_call(name, args)?;
    Ok(StepDecision::ToolCall {
        tool: name.to_string(),
        args: args.clone(),
    })
}
