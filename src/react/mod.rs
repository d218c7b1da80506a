//! 执行引擎：Transcript、Step Executor、Reflection、Agent 状态机与委派

pub mod delegation;
pub mod events;
pub mod loop_;
pub mod planner;
pub mod prompts;
pub mod reflection;
pub mod transcript;

pub use delegation::{DelegationCoordinator, SubAgentSpec, TaskOutcome};
pub use events::{AgentEvent, EventSender};
pub use loop_::{
    Advance, AgentOutcome, AgentPhase, AgentRole, AgentRuntime, AgentStateMachine, AgentStatus,
    DelegationRequest, TokenCounts,
};
pub use planner::{StepContext, StepDecision, StepExecutor};
pub use reflection::{FailureContext, ReflectionVerdict, Reflector};
pub use transcript::{ResultOutcome, SubTaskHandle, ToolCall, ToolResult, Transcript, Turn};
