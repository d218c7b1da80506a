//! 工具执行器
//!
//! 持有 ToolRegistry 与全局超时，execute(tool_name, args) 在超时内调用工具，
//! 超时转为 ToolError::Timeout；每次调用输出结构化审计日志（JSON）。

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::time::timeout;

use crate::core::ToolError;
use crate::llm::ToolSpec;
use crate::tools::{Tool, ToolClass, ToolOutput, ToolRegistry};

/// 工具执行器：对每次调用施加超时，跨任务只读共享
pub struct ToolExecutor {
    registry: Arc<ToolRegistry>,
    timeout: Duration,
}

impl ToolExecutor {
    pub fn new(registry: ToolRegistry, timeout: Duration) -> Self {
        Self {
            registry: Arc::new(registry),
            timeout,
        }
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub fn validate(&self, tool_name: &str, args: &Value) -> Result<Arc<dyn Tool>, ToolError> {
        self.registry.validate_call(tool_name, args)
    }

    pub fn specs(&self, allowed: Option<&[String]>) -> Vec<ToolSpec> {
        self.registry.specs(allowed)
    }

    pub fn class_of(&self, tool_name: &str) -> ToolClass {
        self.registry.class_of(tool_name)
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.registry.tool_names()
    }

    /// 执行指定工具；未知工具返回 NotFound，超时返回 Timeout；输出 JSON 审计日志
    pub async fn execute(&self, tool_name: &str, args: Value) -> Result<ToolOutput, ToolError> {
        let start = Instant::now();
        let args_preview = args_preview(&args);
        let result = match self.registry.get(tool_name) {
            Some(tool) => match timeout(self.timeout, tool.execute(args)).await {
                Ok(r) => r,
                Err(_) => Err(ToolError::timeout(format!(
                    "{tool_name} did not finish within {}s",
                    self.timeout.as_secs_f32()
                ))),
            },
            None => Err(ToolError::not_found(format!("Unknown tool: {tool_name}"))),
        };

        let outcome = match &result {
            Ok(out) if out.degraded => "degraded",
            Ok(_) => "ok",
            Err(e) => e.kind.as_str(),
        };
        let audit = serde_json::json!({
            "event": "tool_audit",
            "tool": tool_name,
            "ok": result.is_ok(),
            "outcome": outcome,
            "duration_ms": start.elapsed().as_millis() as u64,
            "args_preview": args_preview,
        });
        tracing::info!(audit = %audit.to_string(), "tool");
        result
    }
}

fn args_preview(args: &Value) -> String {
    let s = args.to_string();
    if s.chars().count() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct Sleepy;

    #[async_trait]
    impl Tool for Sleepy {
        fn name(&self) -> &str {
            "sleepy"
        }
        fn description(&self) -> &str {
            "never returns in time"
        }
        async fn execute(&self, _args: Value) -> Result<ToolOutput, ToolError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(ToolOutput::full("late"))
        }
    }

    #[tokio::test]
    async fn test_timeout_maps_to_transient_error() {
        let mut reg = ToolRegistry::new();
        reg.register(Sleepy);
        let exec = ToolExecutor::new(reg, Duration::from_millis(20));
        let err = exec.execute("sleepy", serde_json::json!({})).await.unwrap_err();
        assert_eq!(err.kind, crate::core::ToolErrorKind::Timeout);
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_unknown_tool_is_not_found() {
        let exec = ToolExecutor::new(ToolRegistry::new(), Duration::from_secs(1));
        let err = exec.execute("ghost", serde_json::json!({})).await.unwrap_err();
        assert_eq!(err.kind, crate::core::ToolErrorKind::NotFound);
    }
}
