//! 工具注册表
//!
//! 所有工具实现 Tool trait（name / description / parameters_schema / class / execute），
//! 由 ToolRegistry 按名注册与查找；调用前用 parameters_schema 校验参数，非法调用不会被派发。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::ToolError;
use crate::llm::ToolSpec;
use crate::tools::schema::validate_args;

/// 工具类别：反思按类别启用（搜索 / 检索 / 抓取 ...）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolClass {
    Search,
    Retrieval,
    Crawl,
    Inspect,
    Code,
    General,
}

/// 工具成功时的输出；degraded 表示部分上游失败、覆盖不完整
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolOutput {
    pub content: String,
    #[serde(default)]
    pub degraded: bool,
}

impl ToolOutput {
    pub fn full(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            degraded: false,
        }
    }

    pub fn degraded(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            degraded: true,
        }
    }
}

/// 工具 trait：名称、描述（供 LLM 理解）、参数 schema、类别、异步执行（args 为 JSON）
#[async_trait]
pub trait Tool: Send + Sync {
    /// 工具名称（用于 JSON 中的 "tool" 字段）
    fn name(&self) -> &str;

    /// 工具描述（供 LLM 理解功能）
    fn description(&self) -> &str;

    /// 参数 JSON Schema；默认不接受任何参数
    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {},
            "required": []
        })
    }

    fn class(&self) -> ToolClass {
        ToolClass::General
    }

    /// 执行工具；错误必须落在 ToolErrorKind 的分类内
    async fn execute(&self, args: Value) -> Result<ToolOutput, ToolError>;
}

/// 工具注册表：按名称存储 Arc<dyn Tool>，任务之间只读共享
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: impl Tool + 'static) {
        self.register_arc(Arc::new(tool));
    }

    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        if self.tools.insert(name.clone(), tool).is_some() {
            tracing::warn!(tool = %name, "tool registered twice, keeping the latest");
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// 工具名（排序，保证 prompt 稳定）
    pub fn tool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// 生成提供给模型的工具描述；allowed 为 None 时返回全部
    pub fn specs(&self, allowed: Option<&[String]>) -> Vec<ToolSpec> {
        self.tool_names()
            .into_iter()
            .filter(|name| allowed.map_or(true, |a| a.iter().any(|x| x == name)))
            .filter_map(|name| self.tools.get(&name))
            .map(|tool| ToolSpec {
                name: tool.name().to_string(),
                description: tool.description().to_string(),
                parameters: tool.parameters_schema(),
            })
            .collect()
    }

    /// 校验调用：工具必须存在且参数符合 schema（fail-fast，不派发）
    pub fn validate_call(&self, name: &str, args: &Value) -> Result<Arc<dyn Tool>, ToolError> {
        let tool = self
            .get(name)
            .ok_or_else(|| ToolError::not_found(format!("Unknown tool: {name}")))?;
        validate_args(&tool.parameters_schema(), args)
            .map_err(|e| ToolError::invalid_input(format!("Invalid arguments for {name}: {e}")))?;
        Ok(tool)
    }

    pub fn class_of(&self, name: &str) -> ToolClass {
        self.tools.get(name).map_or(ToolClass::General, |t| t.class())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait]
    impl Tool for Echo {
        fn name(&self) -> &str {
            "echo"
        }
        fn description(&self) -> &str {
            "Echo the text back"
        }
        fn parameters_schema(&self) -> Value {
            serde_json::json!({
                "type": "object",
                "properties": { "text": { "type": "string" } },
                "required": ["text"]
            })
        }
        async fn execute(&self, args: Value) -> Result<ToolOutput, ToolError> {
            Ok(ToolOutput::full(args["text"].as_str().unwrap_or_default()))
        }
    }

    #[test]
    fn test_validate_call_rejects_unknown_and_bad_args() {
        let mut reg = ToolRegistry::new();
        reg.register(Echo);
        assert!(reg.validate_call("echo", &serde_json::json!({"text": "hi"})).is_ok());

        let err = reg.validate_call("nope", &serde_json::json!({})).err().unwrap();
        assert_eq!(err.kind, crate::core::ToolErrorKind::NotFound);

        let err = reg.validate_call("echo", &serde_json::json!({"text": 3})).err().unwrap();
        assert_eq!(err.kind, crate::core::ToolErrorKind::InvalidInput);
    }

    #[test]
    fn test_specs_respect_allowed_list() {
        let mut reg = ToolRegistry::new();
        reg.register(Echo);
        assert_eq!(reg.specs(None).len(), 1);
        assert!(reg.specs(Some(&["other".to_string()])).is_empty());
        assert_eq!(reg.class_of("echo"), ToolClass::General);
    }
}
