//! Delegation Coordinator：管理者 + 子智能体
//!
//! 管理者发出委派指令后，按剩余预算的固定比例为子智能体切出独立 Budget 与 Transcript，
//! 驱动其到终态，再把 Outcome 作为一条 ToolResult 写回管理者（管理者只计一步）。
//! 同一时刻每个管理者至多一个子智能体；子智能体不能再委派。

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::core::{AgentError, Budget};
use crate::llm::ToolSpec;
use crate::react::events::{emit, AgentEvent, EventSender};
use crate::react::loop_::{Advance, AgentOutcome, AgentRole, AgentRuntime, AgentStateMachine};
use crate::react::prompts::sub_task_prompt;
use crate::react::transcript::SubTaskHandle;

/// 子智能体定义
#[derive(Debug, Clone)]
pub struct SubAgentSpec {
    pub role: AgentRole,
    pub description: String,
    /// 占管理者剩余预算的比例
    pub budget_fraction: f64,
}

impl SubAgentSpec {
    /// 作为管理者可调用的"工具"
    pub fn tool_spec(&self) -> ToolSpec {
        ToolSpec {
            name: self.role.name.clone(),
            description: self.description.clone(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "task": {
                        "type": "string",
                        "description": "Long detailed description of the task, as a full sentence with all the context needed"
                    }
                },
                "required": ["task"]
            }),
        }
    }
}

/// 单个任务的结果：管理者 Outcome + 按委派顺序排列的子智能体 Outcome
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskOutcome {
    pub manager: AgentOutcome,
    pub sub_agents: Vec<AgentOutcome>,
}

pub struct DelegationCoordinator {
    runtime: AgentRuntime,
    manager: AgentRole,
    sub_agent: Option<SubAgentSpec>,
}

impl DelegationCoordinator {
    pub fn new(runtime: AgentRuntime, manager: AgentRole) -> Self {
        Self {
            runtime,
            manager,
            sub_agent: None,
        }
    }

    pub fn with_sub_agent(mut self, mut spec: SubAgentSpec) -> Self {
        // 不允许嵌套委派
        spec.role.delegate = None;
        self.manager.delegate = Some(spec.tool_spec());
        self.sub_agent = Some(spec);
        self
    }

    pub fn manager_role(&self) -> &AgentRole {
        &self.manager
    }

    pub async fn run(
        &self,
        task_prompt: &str,
        budget: Budget,
        cancel: CancellationToken,
        events: Option<EventSender>,
    ) -> Result<TaskOutcome, AgentError> {
        let mut manager = AgentStateMachine::new(
            self.manager.clone(),
            self.runtime.clone(),
            task_prompt,
            budget,
            cancel.clone(),
        )
        .with_events(events.clone());
        let mut sub_agents: Vec<AgentOutcome> = Vec::new();

        loop {
            let request = match manager.advance().await? {
                Advance::Continue => continue,
                Advance::Terminal(_) => break,
                Advance::Delegate(request) => request,
            };
            let spec = match &self.sub_agent {
                Some(s) => s,
                None => {
                    if let Advance::Terminal(_) = manager.reject_delegation("no sub-agent is configured")? {
                        break;
                    }
                    continue;
                }
            };

            let child_budget = manager.budget().child(spec.budget_fraction);
            tracing::info!(
                manager = %self.manager.name,
                sub_agent = %spec.role.name,
                call = request.seq,
                max_steps = child_budget.max_steps(),
                "delegating sub-task"
            );
            emit(
                &events,
                AgentEvent::DelegationStarted {
                    agent: self.manager.name.clone(),
                    sub_agent: spec.role.name.clone(),
                    task: request.task.clone(),
                    max_steps: child_budget.max_steps(),
                },
            );

            let mut sub = AgentStateMachine::new(
                spec.role.clone(),
                self.runtime.clone(),
                sub_task_prompt(&spec.role.name, &request.task),
                child_budget,
                cancel.child_token(),
            )
            .with_events(events.clone());
            let outcome = sub.run_to_completion().await?;

            tracing::info!(
                sub_agent = %spec.role.name,
                status = ?outcome.status,
                steps = outcome.steps,
                max_steps = outcome.max_steps,
                "sub-agent finished"
            );
            emit(
                &events,
                AgentEvent::DelegationFinished {
                    agent: self.manager.name.clone(),
                    sub_agent: spec.role.name.clone(),
                    status: outcome.status,
                    steps: outcome.steps,
                },
            );
            let handle = SubTaskHandle {
                agent: spec.role.name.clone(),
                index: sub_agents.len(),
            };
            let next = manager.resume_with_sub_agent(&outcome, handle)?;
            sub_agents.push(outcome);
            if let Advance::Terminal(_) = next {
                break;
            }
        }

        let manager = manager
            .into_outcome()
            .ok_or_else(|| AgentError::Transcript("manager stopped before a terminal state".to_string()))?;
        Ok(TaskOutcome { manager, sub_agents })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use crate::core::{BackoffPolicy, RecoveryEngine};
    use crate::llm::{LlmClient, ModelReply, ScriptedLlmClient};
    use crate::react::loop_::AgentStatus;
    use crate::react::reflection::Reflector;
    use crate::react::transcript::{ResultOutcome, Turn};
    use crate::tools::{ToolExecutor, ToolRegistry};

    fn coordinator(llm: Arc<ScriptedLlmClient>, fraction: f64) -> DelegationCoordinator {
        let llm: Arc<dyn LlmClient> = llm;
        let runtime = AgentRuntime {
            reflector: Arc::new(Reflector::disabled(llm.clone())),
            llm,
            tools: Arc::new(ToolExecutor::new(ToolRegistry::new(), Duration::from_secs(1))),
            recovery: RecoveryEngine::new(0, 0, BackoffPolicy::default()),
            max_reprompts: 0,
        };
        DelegationCoordinator::new(runtime, AgentRole::new("manager", "plan")).with_sub_agent(SubAgentSpec {
            role: AgentRole::new("search_agent", "search"),
            description: "searches".into(),
            budget_fraction: fraction,
        })
    }

    #[tokio::test]
    async fn test_successful_delegation_returns_answer_to_manager() {
        let llm = Arc::new(ScriptedLlmClient::new(vec![
            ModelReply::tool_call("search_agent", serde_json::json!({"task": "find the value"})),
            ModelReply::final_answer("value is 7"),
            ModelReply::final_answer("7"),
        ]));
        let c = coordinator(llm.clone(), 0.5);
        let out = c
            .run("q", Budget::new(10), CancellationToken::new(), None)
            .await
            .unwrap();
        assert_eq!(out.manager.status, AgentStatus::Done);
        assert_eq!(out.manager.final_answer.as_deref(), Some("7"));
        assert_eq!(out.manager.steps, 1);
        assert_eq!(out.sub_agents.len(), 1);
        assert_eq!(out.sub_agents[0].max_steps, 5);
        // 子智能体收到的是包装后的任务
        let sub_prompt = &llm.received(1).unwrap()[1].content;
        assert!(sub_prompt.contains("Task:\nfind the value"));

        let result = out
            .manager
            .transcript
            .turns()
            .iter()
            .find_map(|t| match t {
                Turn::ToolResult(r) => Some(r.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(result.handle, Some(SubTaskHandle { agent: "search_agent".into(), index: 0 }));
        assert!(matches!(result.outcome, ResultOutcome::Success { ref payload, .. } if payload == "value is 7"));
    }

    #[tokio::test]
    async fn test_delegation_without_sub_agent_is_recorded_as_failure() {
        let llm: Arc<dyn LlmClient> = Arc::new(ScriptedLlmClient::new(vec![ModelReply::final_answer("x")]));
        let runtime = AgentRuntime {
            reflector: Arc::new(Reflector::disabled(llm.clone())),
            llm,
            tools: Arc::new(ToolExecutor::new(ToolRegistry::new(), Duration::from_secs(1))),
            recovery: RecoveryEngine::default(),
            max_reprompts: 0,
        };
        let c = DelegationCoordinator::new(runtime, AgentRole::new("manager", "plan"));
        assert!(c.manager_role().delegate.is_none());
        let out = c.run("q", Budget::new(2), CancellationToken::new(), None).await.unwrap();
        assert_eq!(out.manager.final_answer.as_deref(), Some("x"));
        assert!(out.sub_agents.is_empty());
    }
}
