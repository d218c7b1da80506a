//! Reflection：工具永久失败后的复盘
//!
//! 给模型看失败的调用、错误与最近几条 Turn，要求给出修正后的调用（Revise）或放弃（Abandon）。
//! 每次反思占用 Budget 中的反思配额；配额耗尽时直接 Abandon，不再调用模型。
//! 反思本身从不让任务失败：模型出错或回复无法解析都视为 Abandon。

use std::collections::HashSet;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;

use crate::config::ReflectionSection;
use crate::core::{Budget, ToolError};
use crate::llm::{parse_text, LlmClient, Message, ModelReply, TextParse};
use crate::react::transcript::{render_observation, ToolCall, Turn};
use crate::tools::ToolClass;

const DEFAULT_TEMPLATE: &str = "You are reviewing a failed tool call made while working on this goal:\n{goal}\n\n\
Failed call: tool `{tool}` with arguments {args}\n\
Error: {error}\n\n\
Recent history:\n{recent}\n\n\
Decide whether a corrected call is likely to succeed. Reply with ONE JSON object and nothing else:\n\
{\"action\": \"revise\", \"tool\": \"<tool name>\", \"args\": {...}, \"critique\": \"<what went wrong>\"}\n\
or\n\
{\"action\": \"abandon\", \"critique\": \"<why this approach should be dropped>\"}";

/// 复盘所需的上下文
pub struct FailureContext<'a> {
    pub goal: &'a str,
    pub call: &'a ToolCall,
    pub error: &'a ToolError,
    pub recent: &'a [Turn],
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReflectionVerdict {
    Revise { tool: String, args: Value, critique: String },
    Abandon { critique: String },
}

impl ReflectionVerdict {
    pub fn critique(&self) -> &str {
        match self {
            ReflectionVerdict::Revise { critique, .. } | ReflectionVerdict::Abandon { critique } => critique,
        }
    }
}

#[derive(Deserialize)]
struct RawVerdict {
    action: String,
    #[serde(default)]
    tool: Option<String>,
    #[serde(default)]
    args: Option<Value>,
    #[serde(default)]
    critique: String,
}

pub struct Reflector {
    llm: Arc<dyn LlmClient>,
    prompt_template: String,
    enabled: bool,
    classes: HashSet<ToolClass>,
}

impl Reflector {
    pub fn new(llm: Arc<dyn LlmClient>, enabled: bool, classes: impl IntoIterator<Item = ToolClass>) -> Self {
        Self {
            llm,
            prompt_template: DEFAULT_TEMPLATE.to_string(),
            enabled,
            classes: classes.into_iter().collect(),
        }
    }

    pub fn from_config(llm: Arc<dyn LlmClient>, cfg: &ReflectionSection) -> Self {
        let mut r = Self::new(llm, cfg.enabled, cfg.tool_classes.iter().copied());
        if let Some(t) = cfg.prompt_template.as_ref().filter(|t| !t.trim().is_empty()) {
            r.prompt_template = t.clone();
        }
        r
    }

    /// 关闭反思（所有失败都直接记录）
    pub fn disabled(llm: Arc<dyn LlmClient>) -> Self {
        Self::new(llm, false, [])
    }

    pub fn should_reflect(&self, class: ToolClass) -> bool {
        self.enabled && self.classes.contains(&class)
    }

    fn render_prompt(&self, ctx: &FailureContext<'_>) -> String {
        let recent: Vec<String> = ctx
            .recent
            .iter()
            .map(|turn| match turn {
                Turn::User { content } => format!("[user] {content}"),
                Turn::Thought { content, .. } => format!("[thought] {content}"),
                Turn::ToolCall(c) => format!("[call #{}] {} {}", c.seq, c.tool, c.args),
                Turn::ToolResult(r) => render_observation(r),
                Turn::FinalAnswer { answer } => format!("[final] {answer}"),
            })
            .collect();
        let args = ctx.call.args.to_string();
        let error = ctx.error.to_string();
        let recent = recent.join("\n");
        fill_template(
            &self.prompt_template,
            &[
                ("{goal}", ctx.goal),
                ("{tool}", ctx.call.tool.as_str()),
                ("{args}", args.as_str()),
                ("{error}", error.as_str()),
                ("{recent}", recent.as_str()),
            ],
        )
    }

    /// 复盘一次失败；配额不足时不调用模型
    pub async fn reflect(&self, ctx: &FailureContext<'_>, budget: &mut Budget) -> ReflectionVerdict {
        if !budget.try_reflect() {
            return ReflectionVerdict::Abandon {
                critique: "reflection quota exhausted".to_string(),
            };
        }
        let messages = vec![Message::user(self.render_prompt(ctx))];
        match self.llm.complete(&messages, &[]).await {
            Ok(reply) => parse_verdict(&reply, ctx.call),
            Err(e) => {
                tracing::warn!(error = %e, tool = %ctx.call.tool, "reflection call failed");
                ReflectionVerdict::Abandon {
                    critique: format!("reflection unavailable: {e}"),
                }
            }
        }
    }
}

fn parse_verdict(reply: &ModelReply, call: &ToolCall) -> ReflectionVerdict {
    let raw = match reply {
        ModelReply::ToolCall { name, arguments } => {
            // 直接以工具调用作答，视为修正
            return ReflectionVerdict::Revise {
                tool: name.clone(),
                args: arguments.clone(),
                critique: String::new(),
            };
        }
        ModelReply::Text(text) => text,
    };
    let json = match (raw.find('{'), raw.rfind('}')) {
        (Some(s), Some(e)) if e > s => &raw[s..=e],
        _ => {
            return ReflectionVerdict::Abandon {
                critique: raw.trim().to_string(),
            }
        }
    };
    match serde_json::from_str::<RawVerdict>(json) {
        Ok(v) if v.action.eq_ignore_ascii_case("revise") => ReflectionVerdict::Revise {
            tool: v.tool.filter(|t| !t.trim().is_empty()).unwrap_or_else(|| call.tool.clone()),
            args: v.args.unwrap_or_else(|| call.args.clone()),
            critique: v.critique,
        },
        Ok(v) => ReflectionVerdict::Abandon { critique: v.critique },
        Err(_) => match parse_text(raw) {
            TextParse::ToolCall { name, arguments } => ReflectionVerdict::Revise {
                tool: name,
                args: arguments,
                critique: String::new(),
            },
            _ => ReflectionVerdict::Abandon {
                critique: raw.trim().to_string(),
            },
        },
    }
}

/// 单遍替换占位符；替换进来的文本不会再被展开
fn fill_template(template: &str, values: &[(&str, &str)]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(pos) = rest.find('{') {
        out.push_str(&rest[..pos]);
        let tail = &rest[pos..];
        match values.iter().find(|(key, _)| tail.starts_with(key)) {
            Some((key, value)) => {
                out.push_str(value);
                rest = &tail[key.len()..];
            }
            None => {
                out.push('{');
                rest = &tail[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ScriptedLlmClient;

    fn call() -> ToolCall {
        ToolCall {
            seq: 3,
            tool: "web_search".into(),
            args: serde_json::json!({"query": "boiling point of nitrogen in kelvin at 2 atm pressure"}),
        }
    }

    #[tokio::test]
    async fn test_revise_verdict() {
        let llm = Arc::new(ScriptedLlmClient::new(vec![ModelReply::text(
            r#"{"action": "revise", "args": {"query": "nitrogen boiling point 2 atm"}, "critique": "query too long"}"#,
        )]));
        let r = Reflector::new(llm.clone(), true, [ToolClass::Search]);
        let c = call();
        let err = ToolError::not_found("No results");
        let ctx = FailureContext { goal: "find it", call: &c, error: &err, recent: &[] };
        let mut budget = Budget::new(5).with_reflection_quota(1);
        let v = r.reflect(&ctx, &mut budget).await;
        assert_eq!(
            v,
            ReflectionVerdict::Revise {
                tool: "web_search".into(),
                args: serde_json::json!({"query": "nitrogen boiling point 2 atm"}),
                critique: "query too long".into(),
            }
        );
        assert_eq!(budget.reflections_used(), 1);
        let prompt = &llm.received(0).unwrap()[0].content;
        assert!(prompt.contains("not_found: No results"));
        assert!(prompt.contains("find it"));
    }

    #[tokio::test]
    async fn test_quota_exhausted_skips_model() {
        let llm = Arc::new(ScriptedLlmClient::new(vec![]));
        let r = Reflector::new(llm.clone(), true, [ToolClass::Search]);
        let c = call();
        let err = ToolError::not_found("No results");
        let ctx = FailureContext { goal: "g", call: &c, error: &err, recent: &[] };
        let mut budget = Budget::new(5);
        assert!(matches!(r.reflect(&ctx, &mut budget).await, ReflectionVerdict::Abandon { .. }));
        assert_eq!(llm.calls(), 0);
    }

    #[tokio::test]
    async fn test_model_error_means_abandon() {
        let llm = Arc::new(ScriptedLlmClient::new(vec![]));
        let r = Reflector::new(llm, true, [ToolClass::Search]);
        let c = call();
        let err = ToolError::upstream("503");
        let ctx = FailureContext { goal: "g", call: &c, error: &err, recent: &[] };
        let mut budget = Budget::new(5).with_reflection_quota(2);
        assert!(matches!(r.reflect(&ctx, &mut budget).await, ReflectionVerdict::Abandon { .. }));
        assert_eq!(budget.reflections_used(), 1);
    }

    #[test]
    fn test_parse_verdict_variants() {
        let c = call();
        assert_eq!(
            parse_verdict(&ModelReply::text(r#"{"action":"abandon","critique":"dead end"}"#), &c),
            ReflectionVerdict::Abandon { critique: "dead end".into() }
        );
        assert!(matches!(
            parse_verdict(&ModelReply::tool_call("crawl_page", serde_json::json!({"url": "u"})), &c),
            ReflectionVerdict::Revise { ref tool, .. } if tool == "crawl_page"
        ));
        assert!(matches!(parse_verdict(&ModelReply::text("no idea"), &c), ReflectionVerdict::Abandon { .. }));
    }

    #[test]
    fn test_should_reflect_by_class() {
        let r = Reflector::new(Arc::new(ScriptedLlmClient::new(vec![])), true, [ToolClass::Search, ToolClass::Crawl]);
        assert!(r.should_reflect(ToolClass::Search));
        assert!(!r.should_reflect(ToolClass::Code));
        assert!(!Reflector::disabled(Arc::new(ScriptedLlmClient::new(vec![]))).should_reflect(ToolClass::Search));
    }

    #[test]
    fn test_placeholder_text_inside_goal_is_not_expanded() {
        let r = Reflector::new(Arc::new(ScriptedLlmClient::new(Vec::new())), true, [ToolClass::Search]);
        let c = call();
        let err = ToolError::not_found("No results for {recent}");
        let ctx = FailureContext {
            goal: "explain the literal string {tool} in f-strings",
            call: &c,
            error: &err,
            recent: &[],
        };
        let prompt = r.render_prompt(&ctx);
        assert!(prompt.contains("explain the literal string {tool} in f-strings"));
        assert!(prompt.contains("No results for {recent}"));
        assert!(prompt.contains("tool `web_search`"));
        assert!(prompt.contains(r#"{"action": "abandon""#));
    }
}
