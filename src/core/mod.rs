//! 核心层：错误分类与恢复、步数预算、运行级关闭信号

pub mod budget;
pub mod error;
pub mod recovery;
pub mod shutdown;

pub use budget::{Budget, BudgetSnapshot};
pub use error::{AgentError, FailureReason, RecoveryAction, ToolError, ToolErrorKind};
pub use recovery::{format_reprompt, BackoffPolicy, RecoveryEngine};
pub use shutdown::{ShutdownManager, ShutdownReason};
