//! 代码执行沙箱：run_code
//!
//! 执行前先静态检查：import 的顶层模块必须在白名单内，且不得出现禁用调用（__import__、exec( 等）。
//! 检查不通过直接返回 InvalidInput，不会启动任何进程。通过后用 tokio::process 启动解释器，
//! 带超时与 kill_on_drop（任务被取消时子进程随之结束）。

use std::collections::HashSet;
use std::process::Stdio;
use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;
use tokio::process::Command;

use crate::config::CodeSection;
use crate::core::ToolError;
use crate::tools::{Tool, ToolClass, ToolOutput};

static IMPORT_RE: OnceLock<Regex> = OnceLock::new();
static FROM_IMPORT_RE: OnceLock<Regex> = OnceLock::new();
static COMMENT_RE: OnceLock<Regex> = OnceLock::new();

// import 语句可以出现在 `;`、`:` 之后，因此不按行首锚定
fn import_re() -> &'static Regex {
    IMPORT_RE.get_or_init(|| Regex::new(r"\bimport\s+([^#;:\n]+)").unwrap())
}

fn from_import_re() -> &'static Regex {
    FROM_IMPORT_RE.get_or_init(|| Regex::new(r"\bfrom\s+(\S+)\s+import\b").unwrap())
}

fn comment_re() -> &'static Regex {
    COMMENT_RE.get_or_init(|| Regex::new(r"#[^\n]*").unwrap())
}

/// 同长度的空白替换，保持其余文本的偏移不变
fn blank(caps: &regex::Captures<'_>) -> String {
    " ".repeat(caps[0].len())
}

/// 代码中 import 的顶层模块（按出现顺序，去重）
///
/// 字符串中的 `import x` 也会被当作导入；误判只会导致拒绝，不会放行。
pub fn imported_modules(code: &str) -> Vec<String> {
    let code = comment_re().replace_all(code, blank);
    let mut found: Vec<(usize, String)> = Vec::new();
    let top = |module: &str| module.trim().split('.').next().unwrap_or("").to_string();

    for cap in from_import_re().captures_iter(&code) {
        // 相对导入 `from . import x` 的顶层模块为空串，必然不在白名单
        found.push((cap.get(0).map_or(0, |m| m.start()), top(&cap[1])));
    }
    // 去掉 `from X import` 前缀后，剩下的 `import` 才是独立的 import 语句
    let stripped = from_import_re().replace_all(&code, blank);
    for cap in import_re().captures_iter(&stripped) {
        let start = cap.get(0).map_or(0, |m| m.start());
        // import a.b as c, d
        for item in cap[1].split(',') {
            let name = item.split_whitespace().next().unwrap_or("");
            found.push((start, top(name.trim_matches(|c: char| c == '(' || c == ')' || c == '\\'))));
        }
    }
    found.sort_by_key(|(pos, _)| *pos);

    let mut out: Vec<String> = Vec::new();
    for (_, module) in found {
        if !out.contains(&module) {
            out.push(module);
        }
    }
    out
}

/// 禁用调用的匹配器：以 `(` 结尾的模式按 `\bname\s*\(` 匹配，其余按子串匹配
struct ForbiddenPattern {
    raw: String,
    call: Option<Regex>,
}

impl ForbiddenPattern {
    fn new(raw: String) -> Self {
        let call = raw
            .strip_suffix('(')
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .and_then(|name| Regex::new(&format!(r"\b{}\s*\(", regex::escape(name))).ok());
        Self { raw, call }
    }

    fn matches(&self, code: &str) -> bool {
        match &self.call {
            Some(re) => re.is_match(code),
            None => code.contains(self.raw.as_str()),
        }
    }
}

pub struct CodeExecTool {
    interpreter: String,
    timeout: Duration,
    max_output_chars: usize,
    allowed_imports: HashSet<String>,
    forbidden_patterns: Vec<ForbiddenPattern>,
}

impl CodeExecTool {
    pub fn new(
        interpreter: impl Into<String>,
        timeout: Duration,
        allowed_imports: Vec<String>,
        forbidden_patterns: Vec<String>,
    ) -> Self {
        Self {
            interpreter: interpreter.into(),
            timeout,
            max_output_chars: 10_000,
            allowed_imports: allowed_imports.into_iter().collect(),
            forbidden_patterns: forbidden_patterns.into_iter().map(ForbiddenPattern::new).collect(),
        }
    }

    pub fn from_config(cfg: &CodeSection) -> Self {
        let mut tool = Self::new(
            cfg.interpreter.clone(),
            Duration::from_secs(cfg.timeout_secs),
            cfg.allowed_imports.clone(),
            cfg.forbidden_patterns.clone(),
        );
        tool.max_output_chars = cfg.max_output_chars;
        tool
    }

    /// 静态检查；任何白名单外能力都返回 InvalidInput
    pub fn check(&self, code: &str) -> Result<(), ToolError> {
        for pattern in &self.forbidden_patterns {
            if pattern.matches(code) {
                return Err(ToolError::invalid_input(format!(
                    "Forbidden call `{}` is not allowed in sandboxed code",
                    pattern.raw
                )));
            }
        }
        let denied: Vec<String> = imported_modules(code)
            .into_iter()
            .filter(|m| !self.allowed_imports.contains(m))
            .map(|m| if m.is_empty() { "<relative import>".to_string() } else { m })
            .collect();
        if !denied.is_empty() {
            let mut allowed: Vec<&str> = self.allowed_imports.iter().map(String::as_str).collect();
            allowed.sort_unstable();
            return Err(ToolError::invalid_input(format!(
                "Import of {} is not allowed. Allowed modules: {}",
                denied.join(", "),
                allowed.join(", ")
            )));
        }
        Ok(())
    }

    fn clip(&self, s: &str) -> String {
        let s = s.trim();
        if s.chars().count() > self.max_output_chars {
            s.chars().take(self.max_output_chars).collect::<String>() + "\n...[truncated]"
        } else {
            s.to_string()
        }
    }
}

#[async_trait]
impl Tool for CodeExecTool {
    fn name(&self) -> &str {
        "run_code"
    }

    fn description(&self) -> &str {
        "Run a short Python snippet for calculations and data processing and return what it prints. \
         Only allow-listed modules can be imported; file, network and process access are not available. \
         Use print() to output results."
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "code": { "type": "string", "description": "Python source code; print the values you need" }
            },
            "required": ["code"]
        })
    }

    fn class(&self) -> ToolClass {
        ToolClass::Code
    }

    async fn execute(&self, args: Value) -> Result<ToolOutput, ToolError> {
        let code = args.get("code").and_then(|v| v.as_str()).unwrap_or("");
        if code.trim().is_empty() {
            return Err(ToolError::invalid_input("Missing code"));
        }
        self.check(code)?;

        tracing::info!(interpreter = %self.interpreter, bytes = code.len(), "run_code execute");
        let child = Command::new(&self.interpreter)
            .arg("-c")
            .arg(code)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ToolError::upstream(format!("Failed to start {}: {e}", self.interpreter)))?;

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| ToolError::timeout(format!("Code did not finish within {}s", self.timeout.as_secs())))?
            .map_err(|e| ToolError::upstream(format!("Waiting for interpreter failed: {e}")))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !output.status.success() {
            return Err(ToolError::invalid_input(format!(
                "Code exited with {}:\n{}",
                output.status,
                self.clip(&stderr)
            )));
        }
        let stdout = self.clip(&stdout);
        Ok(ToolOutput::full(if stdout.is_empty() {
            "(no output; use print() to show results)".to_string()
        } else {
            stdout
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ToolErrorKind;

    fn tool(interpreter: &str) -> CodeExecTool {
        CodeExecTool::new(
            interpreter,
            Duration::from_secs(5),
            vec!["math".into(), "numpy".into()],
            vec!["__import__".into(), "exec(".into(), "open(".into()],
        )
    }

    #[test]
    fn test_imported_modules() {
        let code = "import numpy as np, math\nfrom os.path import join\n  import sys.path\nfrom . import x\nx = 1 # import nothing";
        assert_eq!(imported_modules(code), vec!["numpy", "math", "os", "sys", ""]);
    }

    #[test]
    fn test_check_allows_listed_modules() {
        assert!(tool("python3").check("import math\nprint(math.pi)").is_ok());
        assert!(tool("python3").check("print(1 + 1)").is_ok());
    }

    #[test]
    fn test_imports_after_semicolon_or_colon_are_seen() {
        assert_eq!(imported_modules("import math; import os"), vec!["math", "os"]);
        assert_eq!(imported_modules("if 1: import subprocess"), vec!["subprocess"]);
        assert_eq!(imported_modules("x = 1; from shutil import rmtree"), vec!["shutil"]);
        let t = tool("python3");
        for code in ["import math; import os", "if True: import os", "for _ in [1]: from os import system"] {
            let err = t.check(code).unwrap_err();
            assert_eq!(err.kind, ToolErrorKind::InvalidInput, "{code}");
        }
    }

    #[test]
    fn test_forbidden_call_with_spacing_is_rejected() {
        let t = tool("python3");
        for code in ["f = open ('x', 'w')", "f = open\t('x')", "exec  ('1')"] {
            assert_eq!(t.check(code).unwrap_err().kind, ToolErrorKind::InvalidInput, "{code}");
        }
        // 名字只是标识符的一部分时不算调用
        assert!(t.check("reopen = 1\nprint(reopen)").is_ok());
    }

    #[tokio::test]
    async fn test_disallowed_import_fails_before_spawning() {
        // 解释器不存在：若真的尝试执行会得到 UpstreamFailure，而不是 InvalidInput
        let t = tool("/nonexistent/interpreter");
        let err = t
            .execute(serde_json::json!({"code": "import os\nos.remove('x')"}))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ToolErrorKind::InvalidInput);
        assert!(err.message.contains("os"));

        let err = t
            .execute(serde_json::json!({"code": "__import__('subprocess')"}))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ToolErrorKind::InvalidInput);

        let err = t
            .execute(serde_json::json!({"code": "print(1)"}))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ToolErrorKind::UpstreamFailure);
    }

    #[tokio::test]
    async fn test_forbidden_file_write_has_no_side_effect() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("pwned.txt");
        let code = format!("f = open({:?}, 'w')\nf.write('x')", target.display().to_string());
        let err = tool("python3")
            .execute(serde_json::json!({ "code": code }))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ToolErrorKind::InvalidInput);
        assert!(!target.exists());
    }
}
