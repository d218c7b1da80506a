//! Agent 状态机
//!
//! PLANNING → ACTING → OBSERVING → (REFLECTING) → PLANNING | DONE | FAILED；委派时进入 AWAITING_SUB_AGENT。
//! 每次 advance() 只推进一个状态；向 Transcript 追加 Turn 与 consumed_steps 加一在同一步内完成。
//! 取消与截止时间只在挂起点（等待模型、工具、退避、反思）检查。

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::core::{AgentError, Budget, FailureReason, RecoveryAction, RecoveryEngine, ToolError};
use crate::llm::{LlmClient, ToolSpec};
use crate::react::events::{emit, preview, AgentEvent, EventSender};
use crate::react::planner::{StepContext, StepDecision, StepExecutor};
use crate::react::reflection::{FailureContext, ReflectionVerdict, Reflector};
use crate::react::transcript::{ResultOutcome, SubTaskHandle, ToolCall, ToolResult, Transcript};
use crate::tools::ToolExecutor;

/// 反思时附带的最近 Turn 数
const RECENT_TURNS: usize = 6;
/// 事件中观察结果的预览长度
const OBSERVATION_PREVIEW_CHARS: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentPhase {
    Planning,
    Acting,
    Observing,
    Reflecting,
    AwaitingSubAgent,
    Done,
    Failed,
}

impl AgentPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, AgentPhase::Done | AgentPhase::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AgentPhase::Planning => "PLANNING",
            AgentPhase::Acting => "ACTING",
            AgentPhase::Observing => "OBSERVING",
            AgentPhase::Reflecting => "REFLECTING",
            AgentPhase::AwaitingSubAgent => "AWAITING_SUB_AGENT",
            AgentPhase::Done => "DONE",
            AgentPhase::Failed => "FAILED",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Done,
    Failed,
}

/// 角色：名字、system prompt、可用工具与可选的委派目标
#[derive(Debug, Clone)]
pub struct AgentRole {
    pub name: String,
    pub system_prompt: String,
    /// None 表示注册表中的全部工具
    pub allowed_tools: Option<Vec<String>>,
    pub delegate: Option<ToolSpec>,
}

impl AgentRole {
    pub fn new(name: impl Into<String>, system_prompt: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            system_prompt: system_prompt.into(),
            allowed_tools: None,
            delegate: None,
        }
    }

    pub fn with_tools(mut self, tools: Vec<String>) -> Self {
        self.allowed_tools = Some(tools);
        self
    }

    pub fn with_delegate(mut self, spec: ToolSpec) -> Self {
        self.delegate = Some(spec);
        self
    }
}

/// 跨状态机共享的只读依赖
#[derive(Clone)]
pub struct AgentRuntime {
    pub llm: Arc<dyn LlmClient>,
    pub tools: Arc<ToolExecutor>,
    pub reflector: Arc<Reflector>,
    pub recovery: RecoveryEngine,
    /// Step Executor 原地重新提示的次数
    pub max_reprompts: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenCounts {
    pub prompt: u64,
    pub completion: u64,
    pub total: u64,
}

impl TokenCounts {
    fn since(start: (u64, u64, u64), now: (u64, u64, u64)) -> Self {
        Self {
            prompt: now.0.saturating_sub(start.0),
            completion: now.1.saturating_sub(start.1),
            total: now.2.saturating_sub(start.2),
        }
    }
}

/// 终态记录；只在状态机到达 DONE / FAILED 后生成
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentOutcome {
    pub agent: String,
    pub status: AgentStatus,
    pub final_answer: Option<String>,
    pub failure: Option<FailureReason>,
    pub transcript: Transcript,
    pub steps: usize,
    pub max_steps: usize,
    pub reflections_used: usize,
    pub wall_time_ms: u64,
    pub token_usage: TokenCounts,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DelegationRequest {
    /// 管理者 Transcript 中对应 ToolCall 的序号
    pub seq: u64,
    pub task: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Advance {
    Continue,
    /// 需要由 DelegationCoordinator 运行子智能体，然后调用 resume_with_sub_agent
    Delegate(DelegationRequest),
    Terminal(AgentStatus),
}

/// 当前状态携带的数据
enum Pending {
    Act { call: ToolCall, attempt: usize },
    Observe { result: ToolResult },
    Reflect { call: ToolCall, error: ToolError, latency_ms: u64 },
    SubAgent { call: ToolCall },
}

/// 在取消 / 截止时间下等待一个挂起点
async fn guarded<F: Future>(
    cancel: &CancellationToken,
    deadline: Option<Instant>,
    fut: F,
) -> Result<F::Output, AgentError> {
    let deadline_wait = async move {
        match deadline {
            Some(d) => tokio::time::sleep_until(tokio::time::Instant::from_std(d)).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(AgentError::Cancelled),
        _ = deadline_wait => Err(AgentError::DeadlineExceeded),
        out = fut => Ok(out),
    }
}

pub struct AgentStateMachine {
    role: AgentRole,
    runtime: AgentRuntime,
    executor: StepExecutor,
    goal: String,
    transcript: Transcript,
    budget: Budget,
    phase: AgentPhase,
    pending: Option<Pending>,
    /// 下一次规划附带的格式修正提示
    hint: Option<String>,
    protocol_failures: usize,
    failure: Option<FailureReason>,
    cancel: CancellationToken,
    events: Option<EventSender>,
    started: Instant,
    usage_start: (u64, u64, u64),
    wall_time_ms: Option<u64>,
}

impl AgentStateMachine {
    pub fn new(
        role: AgentRole,
        runtime: AgentRuntime,
        task_prompt: impl Into<String>,
        budget: Budget,
        cancel: CancellationToken,
    ) -> Self {
        let goal = task_prompt.into();
        let executor = StepExecutor::new(runtime.llm.clone(), role.system_prompt.clone(), runtime.max_reprompts);
        let usage_start = runtime.llm.token_usage();
        Self {
            transcript: Transcript::with_prompt(goal.clone()),
            role,
            runtime,
            executor,
            goal,
            budget,
            phase: AgentPhase::Planning,
            pending: None,
            hint: None,
            protocol_failures: 0,
            failure: None,
            cancel,
            events: None,
            started: Instant::now(),
            usage_start,
            wall_time_ms: None,
        }
    }

    pub fn with_events(mut self, events: Option<EventSender>) -> Self {
        self.events = events;
        self
    }

    pub fn name(&self) -> &str {
        &self.role.name
    }

    pub fn phase(&self) -> AgentPhase {
        self.phase
    }

    pub fn transcript(&self) -> &Transcript {
        &self.transcript
    }

    pub fn budget(&self) -> &Budget {
        &self.budget
    }

    fn context(&self) -> StepContext<'_> {
        StepContext {
            tools: &self.runtime.tools,
            allowed: self.role.allowed_tools.as_deref(),
            delegate: self.role.delegate.as_ref(),
        }
    }

    fn set_phase(&mut self, to: AgentPhase) {
        if self.phase == to {
            return;
        }
        tracing::debug!(agent = %self.role.name, from = self.phase.as_str(), to = to.as_str(), "state transition");
        emit(
            &self.events,
            AgentEvent::StateChanged {
                agent: self.role.name.clone(),
                from: self.phase,
                to,
            },
        );
        self.phase = to;
    }

    fn budget_exhausted(&self) -> AgentError {
        AgentError::BudgetExhausted {
            consumed: self.budget.consumed_steps(),
            max_steps: self.budget.max_steps(),
        }
    }

    /// 追加结果并消耗一步
    fn commit_result(&mut self, result: ToolResult) -> Result<(), AgentError> {
        self.transcript.check_result(&result)?;
        self.budget.try_consume()?;
        let (seq, tool) = (result.seq, result.tool.clone());
        let (ok, degraded, text) = match &result.outcome {
            ResultOutcome::Success { payload, degraded } => (true, *degraded, payload.clone()),
            ResultOutcome::ToolFailure { error } => (false, false, error.to_string()),
            ResultOutcome::DelegationFailure { detail } => (false, false, detail.clone()),
        };
        self.transcript.push_result(result)?;
        emit(
            &self.events,
            AgentEvent::Observation {
                agent: self.role.name.clone(),
                seq,
                tool,
                ok,
                degraded,
                preview: preview(&text, OBSERVATION_PREVIEW_CHARS),
            },
        );
        Ok(())
    }

    /// 追加引擎生成的 Thought 并消耗一步
    fn commit_thought(&mut self, content: String) -> Result<(), AgentError> {
        if self.budget.is_exhausted() {
            return Err(self.budget_exhausted());
        }
        self.transcript.push_thought(content, true)?;
        self.budget.try_consume()?;
        Ok(())
    }

    /// 提交后检查预算：耗尽即 FAILED
    fn after_commit(&mut self, next: AgentPhase) -> Advance {
        if self.budget.is_exhausted() {
            let err = self.budget_exhausted();
            return self.fail(err);
        }
        self.set_phase(next);
        Advance::Continue
    }

    fn open_call(&mut self, tool: &str, args: serde_json::Value) -> Result<ToolCall, AgentError> {
        let call = self.transcript.push_call(tool, args)?;
        emit(
            &self.events,
            AgentEvent::ToolCall {
                agent: self.role.name.clone(),
                seq: call.seq,
                tool: call.tool.clone(),
                args: call.args.clone(),
            },
        );
        Ok(call)
    }

    fn finish(&mut self, status: AgentStatus) {
        self.wall_time_ms = Some(self.started.elapsed().as_millis() as u64);
        self.transcript.seal();
        self.pending = None;
        emit(
            &self.events,
            AgentEvent::Terminal {
                agent: self.role.name.clone(),
                status,
                steps: self.budget.consumed_steps(),
            },
        );
    }

    /// 进入 FAILED；未配对的调用补一条失败结果（不计步）
    fn fail(&mut self, err: AgentError) -> Advance {
        let reason = FailureReason::from(&err);
        if let Some(call) = self.transcript.open_call().cloned() {
            let outcome = match self.pending {
                Some(Pending::SubAgent { .. }) => ResultOutcome::DelegationFailure {
                    detail: format!("interrupted: {reason}"),
                },
                _ => ResultOutcome::ToolFailure {
                    error: ToolError::upstream(format!("interrupted: {reason}")),
                },
            };
            let result = ToolResult {
                seq: call.seq,
                tool: call.tool,
                outcome,
                latency_ms: 0,
                handle: None,
            };
            if let Err(e) = self.transcript.push_result(result) {
                tracing::error!(agent = %self.role.name, error = %e, "could not close open call");
            }
        }
        tracing::info!(
            agent = %self.role.name,
            steps = self.budget.consumed_steps(),
            max_steps = self.budget.max_steps(),
            reason = %reason,
            "agent failed"
        );
        self.failure = Some(reason);
        self.set_phase(AgentPhase::Failed);
        self.finish(AgentStatus::Failed);
        Advance::Terminal(AgentStatus::Failed)
    }

    /// 推进一个状态
    pub async fn advance(&mut self) -> Result<Advance, AgentError> {
        match self.phase {
            AgentPhase::Done | AgentPhase::Failed => {
                return Err(AgentError::AlreadyTerminated(self.phase.as_str().to_string()))
            }
            AgentPhase::AwaitingSubAgent => {
                return Err(AgentError::Delegation(
                    "agent is waiting for a sub-agent outcome".to_string(),
                ))
            }
            _ => {}
        }
        if self.cancel.is_cancelled() {
            return Ok(self.fail(AgentError::Cancelled));
        }
        if self.budget.deadline_passed() {
            return Ok(self.fail(AgentError::DeadlineExceeded));
        }
        match self.phase {
            AgentPhase::Planning => self.plan().await,
            AgentPhase::Acting => self.act().await,
            AgentPhase::Observing => self.observe(),
            AgentPhase::Reflecting => self.reflect().await,
            _ => Err(AgentError::Transcript(format!("unexpected phase {}", self.phase.as_str()))),
        }
    }

    async fn plan(&mut self) -> Result<Advance, AgentError> {
        if self.budget.is_exhausted() {
            let err = self.budget_exhausted();
            return Ok(self.fail(err));
        }
        emit(
            &self.events,
            AgentEvent::Thinking {
                agent: self.role.name.clone(),
                consumed: self.budget.consumed_steps(),
                max_steps: self.budget.max_steps(),
            },
        );
        let deadline = self.budget.deadline();
        let decided = {
            let ctx = self.context();
            let fut = self
                .executor
                .execute(&self.transcript, &self.budget, &ctx, self.hint.as_deref());
            guarded(&self.cancel, deadline, fut).await
        };
        let decision = match decided {
            Err(interrupt) => return Ok(self.fail(interrupt)),
            Ok(Ok(d)) => d,
            Ok(Err(err)) => {
                if matches!(err, AgentError::ModelProtocol(_)) {
                    self.protocol_failures += 1;
                }
                return match self.runtime.recovery.on_agent_error(&err, self.protocol_failures) {
                    RecoveryAction::Reprompt(hint) => {
                        tracing::warn!(
                            agent = %self.role.name,
                            failures = self.protocol_failures,
                            error = %err,
                            "unparseable model output, retrying step"
                        );
                        if let Err(e) = self.commit_thought(format!("Model output could not be used: {err}")) {
                            return Ok(self.fail(e));
                        }
                        self.hint = Some(hint);
                        Ok(self.after_commit(AgentPhase::Planning))
                    }
                    _ => Ok(self.fail(err)),
                };
            }
        };
        self.hint = None;

        match decision {
            StepDecision::FinalAnswer(answer) => {
                self.transcript.push_final(answer)?;
                tracing::info!(agent = %self.role.name, steps = self.budget.consumed_steps(), "agent done");
                self.set_phase(AgentPhase::Done);
                self.finish(AgentStatus::Done);
                Ok(Advance::Terminal(AgentStatus::Done))
            }
            StepDecision::ToolCall { tool, args } => {
                let call = self.open_call(&tool, args)?;
                self.pending = Some(Pending::Act { call, attempt: 0 });
                self.set_phase(AgentPhase::Acting);
                Ok(Advance::Continue)
            }
            StepDecision::Delegate { task } => {
                let name = match &self.role.delegate {
                    Some(d) => d.name.clone(),
                    None => return Err(AgentError::Delegation("agent has no sub-agent".to_string())),
                };
                let call = self.open_call(&name, serde_json::json!({ "task": task }))?;
                let seq = call.seq;
                self.pending = Some(Pending::SubAgent { call });
                self.set_phase(AgentPhase::AwaitingSubAgent);
                Ok(Advance::Delegate(DelegationRequest { seq, task }))
            }
        }
    }

    async fn act(&mut self) -> Result<Advance, AgentError> {
        let (call, attempt) = match self.pending.take() {
            Some(Pending::Act { call, attempt }) => (call, attempt),
            _ => return Err(AgentError::Transcript("ACTING without a pending call".to_string())),
        };
        let deadline = self.budget.deadline();
        let start = Instant::now();
        let executed = guarded(
            &self.cancel,
            deadline,
            self.runtime.tools.execute(&call.tool, call.args.clone()),
        )
        .await;
        let latency_ms = start.elapsed().as_millis() as u64;

        let error = match executed {
            Err(interrupt) => {
                self.pending = Some(Pending::Act { call, attempt });
                return Ok(self.fail(interrupt));
            }
            Ok(Ok(out)) => {
                let result = ToolResult::success(&call, out.content, out.degraded, latency_ms);
                self.pending = Some(Pending::Observe { result });
                self.set_phase(AgentPhase::Observing);
                return Ok(Advance::Continue);
            }
            Ok(Err(e)) => e,
        };

        let class = self.runtime.tools.class_of(&call.tool);
        // 配额耗尽等同于直接放弃：记录失败，不再进入反思
        let reflect = self.runtime.reflector.should_reflect(class) && self.budget.reflections_left() > 0;
        match self.runtime.recovery.on_tool_error(&error, attempt, reflect) {
            RecoveryAction::RetryAfter(delay) => {
                tracing::warn!(
                    agent = %self.role.name,
                    tool = %call.tool,
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "transient tool error, retrying"
                );
                emit(
                    &self.events,
                    AgentEvent::Retry {
                        agent: self.role.name.clone(),
                        tool: call.tool.clone(),
                        attempt: attempt + 1,
                        delay_ms: delay.as_millis() as u64,
                        reason: error.to_string(),
                    },
                );
                let slept = guarded(&self.cancel, deadline, tokio::time::sleep(delay)).await;
                self.pending = Some(Pending::Act {
                    call,
                    attempt: attempt + 1,
                });
                if let Err(interrupt) = slept {
                    return Ok(self.fail(interrupt));
                }
                Ok(Advance::Continue)
            }
            RecoveryAction::Reflect => {
                self.pending = Some(Pending::Reflect { call, error, latency_ms });
                self.set_phase(AgentPhase::Reflecting);
                Ok(Advance::Continue)
            }
            _ => {
                let result = ToolResult::failure(&call, error, latency_ms);
                self.pending = Some(Pending::Observe { result });
                self.set_phase(AgentPhase::Observing);
                Ok(Advance::Continue)
            }
        }
    }

    fn observe(&mut self) -> Result<Advance, AgentError> {
        let result = match self.pending.take() {
            Some(Pending::Observe { result }) => result,
            _ => return Err(AgentError::Transcript("OBSERVING without a result".to_string())),
        };
        if let Err(e) = self.commit_result(result) {
            return Ok(self.fail(e));
        }
        Ok(self.after_commit(AgentPhase::Planning))
    }

    async fn reflect(&mut self) -> Result<Advance, AgentError> {
        let (call, error, latency_ms) = match self.pending.take() {
            Some(Pending::Reflect { call, error, latency_ms }) => (call, error, latency_ms),
            _ => return Err(AgentError::Transcript("REFLECTING without a failure".to_string())),
        };
        if let Err(e) = self.commit_result(ToolResult::failure(&call, error.clone(), latency_ms)) {
            return Ok(self.fail(e));
        }
        if self.budget.is_exhausted() {
            let err = self.budget_exhausted();
            return Ok(self.fail(err));
        }

        let deadline = self.budget.deadline();
        let recent = self.transcript.tail(RECENT_TURNS).to_vec();
        let verdict = {
            let ctx = FailureContext {
                goal: &self.goal,
                call: &call,
                error: &error,
                recent: &recent,
            };
            guarded(&self.cancel, deadline, self.runtime.reflector.reflect(&ctx, &mut self.budget)).await
        };
        let verdict = match verdict {
            Ok(v) => v,
            Err(interrupt) => return Ok(self.fail(interrupt)),
        };

        let revised = matches!(verdict, ReflectionVerdict::Revise { .. });
        emit(
            &self.events,
            AgentEvent::Reflection {
                agent: self.role.name.clone(),
                tool: call.tool.clone(),
                revised,
                critique: verdict.critique().to_string(),
            },
        );
        let note = match &verdict {
            ReflectionVerdict::Revise { tool, args, critique } => format!(
                "Reflection on failed call #{} ({}): {critique} Retrying with `{tool}` {args}.",
                call.seq, call.tool
            ),
            ReflectionVerdict::Abandon { critique } => format!(
                "Reflection on failed call #{} ({}): {critique} Abandoning this approach.",
                call.seq, call.tool
            ),
        };
        if let Err(e) = self.commit_thought(note) {
            return Ok(self.fail(e));
        }
        if self.budget.is_exhausted() {
            let err = self.budget_exhausted();
            return Ok(self.fail(err));
        }

        if let ReflectionVerdict::Revise { tool, args, .. } = verdict {
            match self.context().validate_call(&tool, &args) {
                Ok(()) => {
                    let call = self.open_call(&tool, args)?;
                    self.pending = Some(Pending::Act { call, attempt: 0 });
                    self.set_phase(AgentPhase::Acting);
                    return Ok(Advance::Continue);
                }
                Err(problem) => {
                    tracing::warn!(agent = %self.role.name, problem = %problem, "revised call rejected");
                }
            }
        }
        self.set_phase(AgentPhase::Planning);
        Ok(Advance::Continue)
    }

    /// 把子智能体的 Outcome 作为一条 ToolResult 写回（管理者只计一步）
    pub fn resume_with_sub_agent(&mut self, outcome: &AgentOutcome, handle: SubTaskHandle) -> Result<Advance, AgentError> {
        let call = match self.pending.take() {
            Some(Pending::SubAgent { call }) => call,
            other => {
                self.pending = other;
                return Err(AgentError::Delegation("no delegation is pending".to_string()));
            }
        };
        self.budget.absorb_reflections(outcome.reflections_used);

        if let Some(reason @ (FailureReason::Cancelled | FailureReason::DeadlineExceeded)) = &outcome.failure {
            let err = match reason {
                FailureReason::Cancelled => AgentError::Cancelled,
                _ => AgentError::DeadlineExceeded,
            };
            self.pending = Some(Pending::SubAgent { call });
            return Ok(self.fail(err));
        }

        let result_outcome = match (&outcome.status, &outcome.final_answer) {
            (AgentStatus::Done, Some(answer)) => ResultOutcome::Success {
                payload: answer.clone(),
                degraded: false,
            },
            _ => {
                let reason = outcome
                    .failure
                    .as_ref()
                    .map(|r| r.to_string())
                    .unwrap_or_else(|| "no final answer".to_string());
                ResultOutcome::DelegationFailure {
                    detail: format!(
                        "sub-agent `{}` did not reach a final answer: {reason} ({}/{} steps)",
                        outcome.agent, outcome.steps, outcome.max_steps
                    ),
                }
            }
        };
        let result = ToolResult {
            seq: call.seq,
            tool: call.tool.clone(),
            outcome: result_outcome,
            latency_ms: outcome.wall_time_ms,
            handle: Some(handle),
        };
        if let Err(e) = self.commit_result(result) {
            return Ok(self.fail(e));
        }
        Ok(self.after_commit(AgentPhase::Planning))
    }

    /// 拒绝委派（没有可用的子智能体），记为一次失败结果
    pub fn reject_delegation(&mut self, detail: impl Into<String>) -> Result<Advance, AgentError> {
        let call = match self.pending.take() {
            Some(Pending::SubAgent { call }) => call,
            other => {
                self.pending = other;
                return Err(AgentError::Delegation("no delegation is pending".to_string()));
            }
        };
        let result = ToolResult {
            seq: call.seq,
            tool: call.tool.clone(),
            outcome: ResultOutcome::DelegationFailure { detail: detail.into() },
            latency_ms: 0,
            handle: None,
        };
        if let Err(e) = self.commit_result(result) {
            return Ok(self.fail(e));
        }
        Ok(self.after_commit(AgentPhase::Planning))
    }

    /// 独立运行到终态（子智能体使用；遇到委派直接拒绝）
    pub async fn run_to_completion(&mut self) -> Result<AgentOutcome, AgentError> {
        loop {
            match self.advance().await? {
                Advance::Continue => {}
                Advance::Delegate(_) => {
                    if let Advance::Terminal(_) = self.reject_delegation("delegation is not available to this agent")? {
                        break;
                    }
                }
                Advance::Terminal(_) => break,
            }
        }
        self.outcome()
            .ok_or_else(|| AgentError::Transcript("agent stopped before a terminal state".to_string()))
    }

    pub fn status(&self) -> Option<AgentStatus> {
        match self.phase {
            AgentPhase::Done => Some(AgentStatus::Done),
            AgentPhase::Failed => Some(AgentStatus::Failed),
            _ => None,
        }
    }

    /// 终态后的 Outcome；未到终态返回 None
    pub fn outcome(&self) -> Option<AgentOutcome> {
        let status = self.status()?;
        Some(AgentOutcome {
            agent: self.role.name.clone(),
            status,
            final_answer: self.transcript.final_answer().map(str::to_string),
            failure: self.failure.clone(),
            transcript: self.transcript.clone(),
            steps: self.budget.consumed_steps(),
            max_steps: self.budget.max_steps(),
            reflections_used: self.budget.reflections_used(),
            wall_time_ms: self.wall_time_ms.unwrap_or_default(),
            token_usage: TokenCounts::since(self.usage_start, self.runtime.llm.token_usage()),
        })
    }

    pub fn into_outcome(self) -> Option<AgentOutcome> {
        self.outcome()
    }
}
