//! 结果记录：answers.jsonl 中的一行

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::FailureReason;
use crate::react::{AgentOutcome, AgentStatus, TaskOutcome, TokenCounts, Transcript};
use crate::runner::task::Task;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: String,
    pub agent_name: String,
    pub question: String,
    pub augmented_question: String,
    /// 最终答案；失败时为 null
    pub prediction: Option<String>,
    pub failure: Option<FailureReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    pub true_answer: Option<String>,
    pub transcript: Transcript,
    pub steps: usize,
    pub max_steps: usize,
    #[serde(default)]
    pub sub_agents: Vec<AgentOutcome>,
    pub parsing_error: bool,
    pub iteration_limit_exceeded: bool,
    pub start_time: String,
    pub end_time: String,
    pub wall_time_ms: u64,
    pub token_usage: TokenCounts,
    pub judgment: Option<Value>,
}

impl RunRecord {
    /// 由任务结果生成记录；prediction 可能已被重述替换
    pub fn from_outcome(
        task: &Task,
        agent_name: &str,
        augmented_question: String,
        outcome: &TaskOutcome,
        prediction: Option<String>,
        start_time: String,
        end_time: String,
    ) -> Self {
        let manager = &outcome.manager;
        let failure = manager.failure.clone();
        Self {
            id: task.id.clone(),
            agent_name: agent_name.to_string(),
            question: task.question.clone(),
            augmented_question,
            prediction: match manager.status {
                AgentStatus::Done => prediction,
                AgentStatus::Failed => None,
            },
            parsing_error: matches!(failure, Some(FailureReason::ModelProtocol { .. })),
            iteration_limit_exceeded: failure.as_ref().is_some_and(FailureReason::is_budget_exhausted),
            failure,
            category: task.category.clone(),
            true_answer: task.reference_answer.clone(),
            transcript: manager.transcript.clone(),
            steps: manager.steps,
            max_steps: manager.max_steps,
            sub_agents: outcome.sub_agents.clone(),
            start_time,
            end_time,
            wall_time_ms: manager.wall_time_ms,
            token_usage: manager.token_usage,
            judgment: None,
        }
    }

    /// 任务未能产生 Outcome（内部错误或 panic）时的记录
    pub fn internal_failure(
        task: &Task,
        agent_name: &str,
        augmented_question: String,
        detail: String,
        start_time: String,
        end_time: String,
    ) -> Self {
        Self {
            id: task.id.clone(),
            agent_name: agent_name.to_string(),
            question: task.question.clone(),
            augmented_question,
            prediction: None,
            failure: Some(FailureReason::Internal { detail }),
            category: task.category.clone(),
            true_answer: task.reference_answer.clone(),
            transcript: Transcript::new(),
            steps: 0,
            max_steps: 0,
            sub_agents: Vec::new(),
            parsing_error: false,
            iteration_limit_exceeded: false,
            start_time,
            end_time,
            wall_time_ms: 0,
            token_usage: TokenCounts::default(),
            judgment: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.prediction.is_some()
    }
}
