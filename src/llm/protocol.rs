//! 工具调用协议：把可用工具渲染进 system prompt，并从模型文本中解析结构化调用
//!
//! 结构化调用格式：{"tool": "<name>", "args": {...}}；最终答案为 final_answer 工具，
//! 或文本中的 `FINAL ANSWER:` 标记。

use std::collections::HashMap;

use schemars::{schema_for, JsonSchema};
use serde::Deserialize;
use serde_json::Value;

use crate::llm::ToolSpec;

/// 给出最终答案的保留工具名
pub const FINAL_ANSWER_TOOL: &str = "final_answer";

const FINAL_ANSWER_MARKER: &str = "final answer:";

/// 工具调用请求格式（仅用于 Schema 生成）
#[allow(dead_code)]
#[derive(JsonSchema)]
struct ToolCallFormat {
    /// 工具名，如 web_search、crawl_page、final_answer，或子智能体名
    pub tool: String,
    /// 工具参数，须符合该工具的 parameters schema
    pub args: HashMap<String, serde_json::Value>,
}

/// 返回工具调用的 JSON Schema 字符串，可拼入 system prompt
pub fn tool_call_schema_json() -> String {
    let schema = schema_for!(ToolCallFormat);
    serde_json::to_string_pretty(&schema).unwrap_or_default()
}

/// final_answer 的工具描述（所有角色都可用）
pub fn final_answer_spec() -> ToolSpec {
    ToolSpec {
        name: FINAL_ANSWER_TOOL.to_string(),
        description: "Provide the final answer to the task. Call this exactly once, when you are done."
            .to_string(),
        parameters: serde_json::json!({
            "type": "object",
            "properties": {
                "answer": { "type": "string", "description": "The final answer" }
            },
            "required": ["answer"]
        }),
    }
}

/// 渲染 Available tools 段落 + 调用格式 Schema
pub fn render_tool_prompt(tools: &[ToolSpec]) -> String {
    let listing: Vec<Value> = tools
        .iter()
        .map(|t| {
            serde_json::json!({
                "name": t.name,
                "description": t.description,
                "parameters": t.parameters,
            })
        })
        .collect();
    format!(
        "## Available tools\n{}\n\n## Calling convention\nTo act, reply with ONE JSON object matching this schema and nothing else:\n{}\nWhen you know the answer, call `{}`.",
        serde_json::to_string_pretty(&listing).unwrap_or_else(|_| "[]".to_string()),
        tool_call_schema_json(),
        FINAL_ANSWER_TOOL,
    )
}

/// 模型文本的解析结果
#[derive(Debug, Clone, PartialEq)]
pub enum TextParse {
    /// 合法的结构化调用
    ToolCall { name: String, arguments: Value },
    /// 看起来想调用工具，但 JSON 无法解析
    Malformed(String),
    /// 不含任何 JSON 的自然语言
    Prose(String),
}

#[derive(Deserialize)]
struct RawCall {
    #[serde(alias = "name")]
    tool: String,
    #[serde(default, alias = "arguments")]
    args: Value,
}

/// 解析模型输出：提取 ```json 块或首尾花括号之间的 JSON
pub fn parse_text(output: &str) -> TextParse {
    let trimmed = output.trim();

    let json_str = if let Some(start) = trimmed.find("```json") {
        let rest = &trimmed[start + 7..];
        rest.find("```").map(|end| rest[..end].trim()).unwrap_or(rest.trim())
    } else if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}')) {
        if end <= start {
            return TextParse::Prose(trimmed.to_string());
        }
        &trimmed[start..=end]
    } else {
        return TextParse::Prose(trimmed.to_string());
    };

    match serde_json::from_str::<RawCall>(json_str) {
        Ok(call) if call.tool.trim().is_empty() => TextParse::Malformed("empty tool name".to_string()),
        Ok(call) => TextParse::ToolCall {
            name: call.tool.trim().to_string(),
            arguments: if call.args.is_null() {
                Value::Object(Default::default())
            } else {
                call.args
            },
        },
        Err(e) => TextParse::Malformed(format!("{e}: {json_str}")),
    }
}

/// 提取文本中最后一个 `FINAL ANSWER:` 之后的内容
pub fn extract_final_answer(output: &str) -> Option<String> {
    let lower = output.to_lowercase();
    let idx = lower.rfind(FINAL_ANSWER_MARKER)?;
    // 小写化只改变 ASCII 大小写时字节偏移不变；非 ASCII 时退回原文查找
    let rest = output
        .get(idx + FINAL_ANSWER_MARKER.len()..)
        .filter(|_| lower.len() == output.len())?;
    let answer = rest.trim();
    if answer.is_empty() {
        None
    } else {
        Some(answer.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_json() {
        let out = r#"{"tool": "web_search", "args": {"query": "rust"}}"#;
        assert_eq!(
            parse_text(out),
            TextParse::ToolCall {
                name: "web_search".into(),
                arguments: serde_json::json!({"query": "rust"}),
            }
        );
    }

    #[test]
    fn test_parse_fenced_json_with_aliases() {
        let out = "I will search.\n```json\n{\"name\": \"crawl_page\", \"arguments\": {\"url\": \"https://a.org\"}}\n```";
        match parse_text(out) {
            TextParse::ToolCall { name, arguments } => {
                assert_eq!(name, "crawl_page");
                assert_eq!(arguments["url"], "https://a.org");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_parse_malformed_and_prose() {
        assert!(matches!(parse_text(r#"{"tool": "x", "args": {"#), TextParse::Malformed(_) | TextParse::Prose(_)));
        assert!(matches!(parse_text(r#"{"tool": "web_search" "args": {}}"#), TextParse::Malformed(_)));
        assert!(matches!(parse_text(r#"{"tool": "", "args": {}}"#), TextParse::Malformed(_)));
        assert_eq!(parse_text("just words"), TextParse::Prose("just words".into()));
    }

    #[test]
    fn test_missing_args_become_empty_object() {
        match parse_text(r#"{"tool": "list"}"#) {
            TextParse::ToolCall { arguments, .. } => assert!(arguments.as_object().unwrap().is_empty()),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_extract_final_answer() {
        assert_eq!(extract_final_answer("Thinking...\nFINAL ANSWER: 42"), Some("42".into()));
        assert_eq!(
            extract_final_answer("Final Answer: a\nfinal answer:  b  "),
            Some("b".into())
        );
        assert_eq!(extract_final_answer("FINAL ANSWER:   "), None);
        assert_eq!(extract_final_answer("no marker"), None);
    }

    #[test]
    fn test_render_tool_prompt_lists_tools() {
        let prompt = render_tool_prompt(&[final_answer_spec()]);
        assert!(prompt.contains("final_answer"));
        assert!(prompt.contains("Available tools"));
    }
}
