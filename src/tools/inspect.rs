//! 附件检查：inspect_file_as_text / inspect_image / inspect_audio
//!
//! 按扩展名判断文件类别；文本类直接读取，PDF/Office 文档经 DocumentConverter 转为文本，
//! 图像/音频交给 MediaDescriber（视觉/转写后端在外部）。
//! 带 question 时再用模型针对问题回答，否则返回原始内容（按 text_limit 截断）。

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::process::Command;

use crate::config::InspectorSection;
use crate::core::ToolError;
use crate::llm::{LlmClient, Message, ModelReply};
use crate::tools::{Tool, ToolClass, ToolOutput};

/// 附件类别（按扩展名）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Text,
    /// 需要先转换为文本的文档（pdf、docx、xlsx、pptx）
    Document,
    Image,
    Audio,
    Unsupported,
}

const TEXT_EXTENSIONS: &[&str] = &[
    "txt", "md", "csv", "tsv", "json", "jsonl", "jsonld", "xml", "html", "htm", "py", "rs", "js",
    "ts", "yaml", "yml", "toml", "log", "tex", "pdb", "sql", "ini",
];
const DOCUMENT_EXTENSIONS: &[&str] = &["pdf", "docx", "xlsx", "xls", "pptx"];
const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "gif", "bmp", "webp"];
const AUDIO_EXTENSIONS: &[&str] = &["mp3", "m4a", "wav", "flac", "ogg"];

impl FileKind {
    pub fn of(path: &Path) -> FileKind {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_lowercase())
            .unwrap_or_default();
        if TEXT_EXTENSIONS.contains(&ext.as_str()) {
            FileKind::Text
        } else if DOCUMENT_EXTENSIONS.contains(&ext.as_str()) {
            FileKind::Document
        } else if IMAGE_EXTENSIONS.contains(&ext.as_str()) {
            FileKind::Image
        } else if AUDIO_EXTENSIONS.contains(&ext.as_str()) {
            FileKind::Audio
        } else {
            FileKind::Unsupported
        }
    }

    fn tool_for(self) -> &'static str {
        match self {
            FileKind::Text | FileKind::Document => "inspect_file_as_text",
            FileKind::Image => "inspect_image",
            FileKind::Audio => "inspect_audio",
            FileKind::Unsupported => "crawl_page or run_code",
        }
    }
}

/// 图像描述 / 音频转写能力
#[async_trait]
pub trait MediaDescriber: Send + Sync {
    async fn describe(&self, path: &Path, kind: FileKind) -> Result<String, ToolError>;
}

/// 未配置视觉/转写后端时使用：一律返回 UpstreamFailure
pub struct UnavailableDescriber;

#[async_trait]
impl MediaDescriber for UnavailableDescriber {
    async fn describe(&self, path: &Path, kind: FileKind) -> Result<String, ToolError> {
        Err(ToolError::upstream(format!(
            "no {kind:?} backend configured, cannot inspect {}",
            path.display()
        )))
    }
}

/// 文档转文本能力（PDF / Office）
#[async_trait]
pub trait DocumentConverter: Send + Sync {
    async fn convert(&self, path: &Path) -> Result<String, ToolError>;
}

/// 按扩展名调用外部转换命令，命令行中的 `{path}` 替换为文件路径，stdout 即文本
pub struct CommandConverter {
    commands: HashMap<String, Vec<String>>,
    timeout: Duration,
}

impl CommandConverter {
    pub fn new(commands: HashMap<String, Vec<String>>, timeout: Duration) -> Self {
        let commands = commands
            .into_iter()
            .map(|(ext, argv)| (ext.to_lowercase(), argv))
            .collect();
        Self { commands, timeout }
    }

    pub fn from_config(cfg: &InspectorSection) -> Self {
        Self::new(cfg.converters.clone(), Duration::from_secs(cfg.convert_timeout_secs))
    }
}

#[async_trait]
impl DocumentConverter for CommandConverter {
    async fn convert(&self, path: &Path) -> Result<String, ToolError> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_lowercase())
            .unwrap_or_default();
        let Some((program, rest)) = self.commands.get(&ext).and_then(|argv| argv.split_first()) else {
            return Err(ToolError::upstream(format!("no converter configured for .{ext} files")));
        };
        let file = path.display().to_string();
        let args: Vec<String> = rest.iter().map(|a| a.replace("{path}", &file)).collect();

        tracing::info!(program = %program, file = %file, "converting document");
        let child = Command::new(program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ToolError::upstream(format!("Failed to start converter {program}: {e}")))?;
        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| ToolError::timeout(format!("Converting {file} took longer than {}s", self.timeout.as_secs())))?
            .map_err(|e| ToolError::upstream(format!("Converter {program} failed: {e}")))?;
        if !output.status.success() {
            return Err(ToolError::upstream(format!(
                "Converter {program} exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// 三个检查工具共享的部分：路径解析、截断、针对问题调用模型
#[derive(Clone)]
pub struct InspectorContext {
    root: Option<PathBuf>,
    text_limit: usize,
    llm: Option<Arc<dyn LlmClient>>,
}

impl InspectorContext {
    pub fn new(root: Option<PathBuf>, text_limit: usize, llm: Option<Arc<dyn LlmClient>>) -> Self {
        Self { root, text_limit, llm }
    }

    pub fn from_config(cfg: &InspectorSection, llm: Option<Arc<dyn LlmClient>>) -> Self {
        Self::new(cfg.root.clone(), cfg.text_limit, llm)
    }

    fn resolve(&self, args: &Value, accepted: &[FileKind]) -> Result<PathBuf, ToolError> {
        let raw = args.get("file_path").and_then(|v| v.as_str()).unwrap_or("").trim();
        if raw.is_empty() {
            return Err(ToolError::invalid_input("Missing file_path"));
        }
        if raw.starts_with("http://") || raw.starts_with("https://") {
            return Err(ToolError::invalid_input(
                "file_path is a URL; use crawl_page for web pages",
            ));
        }
        let path = PathBuf::from(raw);
        let path = match &self.root {
            Some(root) if path.is_relative() => root.join(path),
            _ => path,
        };
        let kind = FileKind::of(&path);
        if !accepted.contains(&kind) {
            return Err(ToolError::invalid_input(format!(
                "{} is not a supported {:?} file; use {} instead",
                path.display(),
                accepted[0],
                kind.tool_for()
            )));
        }
        if !path.exists() {
            return Err(ToolError::not_found(format!("File not found: {}", path.display())));
        }
        Ok(path)
    }

    fn clip(&self, text: &str) -> String {
        text.chars().take(self.text_limit).collect()
    }

    /// 有 question 且有模型时让模型针对问题作答，否则返回带标题的原文
    async fn answer(&self, label: &str, content: &str, question: Option<&str>) -> Result<String, ToolError> {
        let content = self.clip(content);
        let (Some(question), Some(llm)) = (question.filter(|q| !q.trim().is_empty()), &self.llm) else {
            return Ok(format!("{label}:\n{content}"));
        };
        let messages = vec![
            Message::system(format!(
                "Here is the {label}:\n{content}\n\nAnswer the question based on this content using the format:\n\
                 1. Brief answer\n2. Detailed analysis\n3. Relevant context"
            )),
            Message::user(format!("Please answer the question: {question}")),
        ];
        match llm.complete(&messages, &[]).await {
            Ok(ModelReply::Text(t)) => Ok(t),
            Ok(ModelReply::ToolCall { arguments, .. }) => Ok(arguments
                .get("answer")
                .and_then(|a| a.as_str())
                .map(String::from)
                .unwrap_or_else(|| arguments.to_string())),
            Err(e) => Err(ToolError::upstream(format!("inspection model call failed: {e}"))),
        }
    }
}

fn question_arg(args: &Value) -> Option<&str> {
    args.get("question").and_then(|v| v.as_str())
}

fn inspector_schema(what: &str) -> Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "file_path": { "type": "string", "description": format!("Path to the {what} file") },
            "question": { "type": "string", "description": "Optional question about the content; omit to get the raw content" }
        },
        "required": ["file_path"]
    })
}

/// inspect_file_as_text
pub struct TextInspectorTool {
    ctx: InspectorContext,
    converter: Option<Arc<dyn DocumentConverter>>,
}

impl TextInspectorTool {
    pub fn new(ctx: InspectorContext) -> Self {
        Self { ctx, converter: None }
    }

    pub fn with_converter(mut self, converter: Arc<dyn DocumentConverter>) -> Self {
        self.converter = Some(converter);
        self
    }

    async fn read_document(&self, path: &Path) -> Result<String, ToolError> {
        match &self.converter {
            Some(c) => c.convert(path).await,
            None => Err(ToolError::upstream(format!(
                "no document converter configured, cannot read {}",
                path.display()
            ))),
        }
    }
}

#[async_trait]
impl Tool for TextInspectorTool {
    fn name(&self) -> &str {
        "inspect_file_as_text"
    }

    fn description(&self) -> &str {
        "Read a text-like file (txt, md, csv, json, xml, html, source code...) or a document \
         (pdf, docx, xlsx, pptx) and return its content, or answer a question about it. Not for images or audio."
    }

    fn parameters_schema(&self) -> Value {
        inspector_schema("text")
    }

    fn class(&self) -> ToolClass {
        ToolClass::Inspect
    }

    async fn execute(&self, args: Value) -> Result<ToolOutput, ToolError> {
        let path = self.ctx.resolve(&args, &[FileKind::Text, FileKind::Document])?;
        if FileKind::of(&path) == FileKind::Document {
            let text = self.read_document(&path).await?;
            let out = self.ctx.answer("Document content", &text, question_arg(&args)).await?;
            return Ok(ToolOutput::full(out));
        }
        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|e| ToolError::upstream(format!("Reading {} failed: {e}", path.display())))?;
        let text = String::from_utf8_lossy(&bytes);
        let text = if matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("html") | Some("htm")
        ) {
            html2text::from_read(text.as_bytes(), 120).unwrap_or_else(|_| text.to_string())
        } else {
            text.into_owned()
        };
        let out = self.ctx.answer("Document content", &text, question_arg(&args)).await?;
        Ok(ToolOutput::full(out))
    }
}

/// inspect_image / inspect_audio 共用实现
pub struct MediaInspectorTool {
    ctx: InspectorContext,
    describer: Arc<dyn MediaDescriber>,
    kind: FileKind,
}

impl MediaInspectorTool {
    pub fn image(ctx: InspectorContext, describer: Arc<dyn MediaDescriber>) -> Self {
        Self {
            ctx,
            describer,
            kind: FileKind::Image,
        }
    }

    pub fn audio(ctx: InspectorContext, describer: Arc<dyn MediaDescriber>) -> Self {
        Self {
            ctx,
            describer,
            kind: FileKind::Audio,
        }
    }
}

#[async_trait]
impl Tool for MediaInspectorTool {
    fn name(&self) -> &str {
        match self.kind {
            FileKind::Audio => "inspect_audio",
            _ => "inspect_image",
        }
    }

    fn description(&self) -> &str {
        match self.kind {
            FileKind::Audio => {
                "Transcribe an audio file (mp3, m4a, wav, flac, ogg) and optionally answer a question about it."
            }
            _ => "Describe an image file (png, jpg, gif, bmp, webp) and optionally answer a question about it.",
        }
    }

    fn parameters_schema(&self) -> Value {
        match self.kind {
            FileKind::Audio => inspector_schema("audio"),
            _ => inspector_schema("image"),
        }
    }

    fn class(&self) -> ToolClass {
        ToolClass::Inspect
    }

    async fn execute(&self, args: Value) -> Result<ToolOutput, ToolError> {
        let path = self.ctx.resolve(&args, &[self.kind])?;
        let described = self.describer.describe(&path, self.kind).await?;
        let label = match self.kind {
            FileKind::Audio => "Audio transcription",
            _ => "Image description",
        };
        let out = self.ctx.answer(label, &described, question_arg(&args)).await?;
        Ok(ToolOutput::full(out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ToolErrorKind;
    use crate::llm::ScriptedLlmClient;

    #[test]
    fn test_file_kind_by_extension() {
        assert_eq!(FileKind::of(Path::new("a/b.CSV")), FileKind::Text);
        assert_eq!(FileKind::of(Path::new("x.jpeg")), FileKind::Image);
        assert_eq!(FileKind::of(Path::new("x.wav")), FileKind::Audio);
        assert_eq!(FileKind::of(Path::new("paper.PDF")), FileKind::Document);
        assert_eq!(FileKind::of(Path::new("x.xlsx")), FileKind::Document);
        assert_eq!(FileKind::of(Path::new("x.zip")), FileKind::Unsupported);
    }

    #[tokio::test]
    async fn test_text_inspection_reads_relative_to_root() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("notes.txt"), "the boiling point is 100 C").unwrap();
        let tool = TextInspectorTool::new(InspectorContext::new(Some(dir.path().to_path_buf()), 1000, None));
        let out = tool
            .execute(serde_json::json!({"file_path": "notes.txt"}))
            .await
            .unwrap();
        assert!(out.content.contains("boiling point"));
    }

    #[tokio::test]
    async fn test_question_is_answered_by_model() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("data.csv"), "x,y\n1,2\n").unwrap();
        let llm = Arc::new(ScriptedLlmClient::new(vec![ModelReply::text("y is 2")]));
        let tool = TextInspectorTool::new(InspectorContext::new(Some(dir.path().to_path_buf()), 1000, Some(llm.clone())));
        let out = tool
            .execute(serde_json::json!({"file_path": "data.csv", "question": "what is y?"}))
            .await
            .unwrap();
        assert_eq!(out.content, "y is 2");
        assert!(llm.received(0).unwrap()[0].content.contains("x,y"));
    }

    #[tokio::test]
    async fn test_wrong_family_and_missing_file() {
        let ctx = InspectorContext::new(None, 1000, None);
        let tool = TextInspectorTool::new(ctx.clone());
        let err = tool.execute(serde_json::json!({"file_path": "photo.png"})).await.unwrap_err();
        assert_eq!(err.kind, ToolErrorKind::InvalidInput);
        assert!(err.message.contains("inspect_image"));

        let err = tool
            .execute(serde_json::json!({"file_path": "/no/such/file.txt"}))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ToolErrorKind::NotFound);

        let audio = MediaInspectorTool::audio(ctx, Arc::new(UnavailableDescriber));
        let err = audio.execute(serde_json::json!({"file_path": "a.txt"})).await.unwrap_err();
        assert_eq!(err.kind, ToolErrorKind::InvalidInput);
    }

    fn converter(ext: &str, argv: &[&str]) -> Arc<dyn DocumentConverter> {
        let commands = HashMap::from([(ext.to_string(), argv.iter().map(|a| a.to_string()).collect())]);
        Arc::new(CommandConverter::new(commands, Duration::from_secs(10)))
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_pdf_is_read_through_converter() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("paper.pdf"), "Abstract: the rate constant is 3.2e-4").unwrap();
        // cat 代替真正的 PDF 转换命令
        let tool = TextInspectorTool::new(InspectorContext::new(Some(dir.path().to_path_buf()), 1000, None))
            .with_converter(converter("PDF", &["cat", "{path}"]));
        let out = tool
            .execute(serde_json::json!({"file_path": "paper.pdf"}))
            .await
            .unwrap();
        assert!(out.content.contains("rate constant is 3.2e-4"));
    }

    #[tokio::test]
    async fn test_document_without_working_converter_is_upstream_failure() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("table.xlsx"), "binary").unwrap();
        let ctx = InspectorContext::new(Some(dir.path().to_path_buf()), 1000, None);

        let err = TextInspectorTool::new(ctx.clone())
            .execute(serde_json::json!({"file_path": "table.xlsx"}))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ToolErrorKind::UpstreamFailure);

        let err = TextInspectorTool::new(ctx)
            .with_converter(converter("xlsx", &["scistar-no-such-converter", "{path}"]))
            .execute(serde_json::json!({"file_path": "table.xlsx"}))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ToolErrorKind::UpstreamFailure);
        assert!(err.message.contains("scistar-no-such-converter"));
    }
}
