//! 运行配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `SCISTAR__*` 覆盖（双下划线表示嵌套，如 `SCISTAR__AGENT__MAX_STEPS=20`）。
//! 所有字段都有默认值，空文件即可运行。

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::llm::ToolProtocol;
use crate::tools::ToolClass;

/// 配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct AppConfig {
    pub llm: LlmSection,
    pub agent: AgentSection,
    pub reflection: ReflectionSection,
    pub tools: ToolsSection,
    pub runtime: RuntimeSection,
}

/// [llm] 段：后端、模型、采样参数、协议与重试
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LlmSection {
    /// openai（任意 OpenAI 兼容端点）/ mock
    pub provider: String,
    pub model: String,
    pub base_url: Option<String>,
    pub temperature: f32,
    pub max_tokens: u32,
    pub request_timeout_secs: u64,
    pub protocol: ToolProtocol,
    pub retry: LlmRetrySection,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            model: "gpt-4o-mini".to_string(),
            base_url: None,
            temperature: 0.8,
            max_tokens: 4096,
            request_timeout_secs: 120,
            protocol: ToolProtocol::Structured,
            retry: LlmRetrySection::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LlmRetrySection {
    pub max_attempts: usize,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for LlmRetrySection {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 500,
            max_backoff_ms: 10_000,
        }
    }
}

/// [agent] 段：步数预算、重试与委派
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AgentSection {
    /// 管理者每个任务的最大步数
    pub max_steps: usize,
    /// 模型协议错误在 step 级别的最大重试次数
    pub max_step_retries: usize,
    /// 单次规划内，格式错误时原地重新提示的次数
    pub max_reprompts: usize,
    /// 瞬时工具错误（Timeout / RateLimited）的重试次数
    pub transient_tool_retries: usize,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
    /// 单任务墙钟截止时间（秒），未设置则不限
    pub task_timeout_secs: Option<u64>,
    /// 管理者可用工具（空表示全部）
    pub manager_tools: Vec<String>,
    /// 覆盖管理者 system prompt
    pub system_prompt: Option<String>,
    /// DONE 后是否用模型把答案改写成严格的短答案格式
    pub reformulate_answer: bool,
    pub sub_agent: SubAgentSection,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            max_steps: 12,
            max_step_retries: 2,
            max_reprompts: 1,
            transient_tool_retries: 2,
            backoff_base_ms: 500,
            backoff_cap_ms: 8_000,
            task_timeout_secs: None,
            manager_tools: vec![
                "inspect_file_as_text".into(),
                "inspect_image".into(),
                "inspect_audio".into(),
                "run_code".into(),
                "retrieve_content".into(),
            ],
            system_prompt: None,
            reformulate_answer: true,
            sub_agent: SubAgentSection::default(),
        }
    }
}

/// [agent.sub_agent] 段：委派给子智能体（默认是搜索智能体）
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SubAgentSection {
    pub enabled: bool,
    /// 管理者调用子智能体时使用的工具名
    pub name: String,
    pub description: String,
    /// 子智能体预算占管理者剩余步数的比例
    pub budget_fraction: f64,
    /// 子智能体可用工具（空表示全部）
    pub tools: Vec<String>,
    pub system_prompt: Option<String>,
}

impl Default for SubAgentSection {
    fn default() -> Self {
        Self {
            enabled: true,
            name: "search_agent".to_string(),
            description: "A team member that will search the internet to answer your question. \
                Give it a complete sentence describing what to find, with as much context as possible \
                (for example a specific timeframe), not a few keywords."
                .to_string(),
            budget_fraction: 0.5,
            tools: vec![
                "web_search".into(),
                "crawl_page".into(),
                "search_and_crawl".into(),
                "retrieve_content".into(),
                "inspect_file_as_text".into(),
            ],
            system_prompt: None,
        }
    }
}

/// [reflection] 段：失败复盘
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ReflectionSection {
    pub enabled: bool,
    /// 每个任务的反思次数上限（管理者与子智能体共享）
    pub quota: usize,
    /// 启用反思的工具类别
    pub tool_classes: Vec<ToolClass>,
    /// 模板占位符：{goal} {tool} {args} {error} {recent}
    pub prompt_template: Option<String>,
}

impl Default for ReflectionSection {
    fn default() -> Self {
        Self {
            enabled: true,
            quota: 3,
            tool_classes: vec![ToolClass::Search, ToolClass::Retrieval, ToolClass::Crawl],
            prompt_template: None,
        }
    }
}

/// [tools] 段
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ToolsSection {
    /// 单次工具调用超时（秒）
    pub tool_timeout_secs: u64,
    pub search: SearchSection,
    pub crawl: CrawlSection,
    pub code: CodeSection,
    pub retrieval: RetrievalSection,
    pub inspector: InspectorSection,
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            tool_timeout_secs: 90,
            search: SearchSection::default(),
            crawl: CrawlSection::default(),
            code: CodeSection::default(),
            retrieval: RetrievalSection::default(),
            inspector: InspectorSection::default(),
        }
    }
}

/// [tools.search] 段：聚合搜索
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SearchSection {
    pub providers: Vec<SearchProviderSection>,
    /// 单个 provider 的超时（秒），超时视为该 provider 失败
    pub per_provider_timeout_secs: u64,
    pub max_results: usize,
    /// search_and_crawl 抓取前 N 个链接
    pub crawl_top_n: usize,
}

impl Default for SearchSection {
    fn default() -> Self {
        Self {
            providers: Vec::new(),
            per_provider_timeout_secs: 15,
            max_results: 10,
            crawl_top_n: 3,
        }
    }
}

/// [[tools.search.providers]]：返回 JSON 结果列表的 HTTP 搜索端点
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SearchProviderSection {
    pub name: String,
    pub endpoint: String,
    /// 存放 API Key 的环境变量名（以 Bearer 方式发送）
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default = "default_query_param")]
    pub query_param: String,
    /// 同时在途请求上限（跨任务共享的限流计数器）
    #[serde(default)]
    pub max_in_flight: Option<usize>,
    #[serde(default)]
    pub extra_params: HashMap<String, String>,
}

fn default_query_param() -> String {
    "q".to_string()
}

/// [tools.crawl] 段
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CrawlSection {
    pub timeout_secs: u64,
    pub max_result_chars: usize,
    /// 域名白名单（空表示不限）
    pub allowed_domains: Vec<String>,
}

impl Default for CrawlSection {
    fn default() -> Self {
        Self {
            timeout_secs: 20,
            max_result_chars: 20_000,
            allowed_domains: Vec::new(),
        }
    }
}

/// [tools.code] 段：代码执行沙箱
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CodeSection {
    pub enabled: bool,
    pub interpreter: String,
    pub timeout_secs: u64,
    pub max_output_chars: usize,
    /// 允许 import 的顶层模块
    pub allowed_imports: Vec<String>,
    /// 出现即拒绝的调用/子串
    pub forbidden_patterns: Vec<String>,
}

impl Default for CodeSection {
    fn default() -> Self {
        Self {
            enabled: true,
            interpreter: "python3".to_string(),
            timeout_secs: 30,
            max_output_chars: 10_000,
            allowed_imports: [
                "math", "statistics", "fractions", "decimal", "datetime", "json", "csv", "re",
                "random", "itertools", "collections", "functools", "numpy", "sympy", "scipy",
                "pandas",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            forbidden_patterns: [
                "__import__", "exec(", "eval(", "compile(", "open(", "globals(", "getattr(",
                "breakpoint(",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        }
    }
}

/// [tools.retrieval] 段
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RetrievalSection {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub top_k: usize,
    /// 低于该分数的段落丢弃
    pub min_score: f32,
}

impl Default for RetrievalSection {
    fn default() -> Self {
        Self {
            chunk_size: 500,
            chunk_overlap: 50,
            top_k: 5,
            min_score: 0.05,
        }
    }
}

/// [tools.inspector] 段
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct InspectorSection {
    pub text_limit: usize,
    /// 附件相对路径的根目录
    pub root: Option<PathBuf>,
    /// 扩展名 -> 转换命令（`{path}` 为文件路径占位，stdout 为文本）
    pub converters: HashMap<String, Vec<String>>,
    pub convert_timeout_secs: u64,
}

impl Default for InspectorSection {
    fn default() -> Self {
        let command = |argv: &[&str]| argv.iter().map(|a| a.to_string()).collect::<Vec<_>>();
        let mut converters = HashMap::from([(
            "pdf".to_string(),
            command(&["pdftotext", "-layout", "{path}", "-"]),
        )]);
        for ext in ["docx", "xlsx", "xls", "pptx"] {
            converters.insert(ext.to_string(), command(&["markitdown", "{path}"]));
        }
        Self {
            text_limit: 100_000,
            root: None,
            converters,
            convert_timeout_secs: 60,
        }
    }
}

/// [runtime] 段：并发、输出目录、断点续跑
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RuntimeSection {
    pub concurrency: usize,
    pub output_dir: PathBuf,
    pub run_name: String,
    /// 复用已有的时间戳目录（断点续跑）
    pub resume_from: Option<String>,
    /// 调试模式：忽略已有结果并串行执行
    pub debug: bool,
    pub dataset: Option<PathBuf>,
    /// 仅运行这些任务 id（空表示全部）
    pub selected_tasks: Vec<String>,
}

impl Default for RuntimeSection {
    fn default() -> Self {
        Self {
            concurrency: 1,
            output_dir: PathBuf::from("output"),
            run_name: "run".to_string(),
            resume_from: None,
            debug: false,
            dataset: None,
            selected_tasks: Vec::new(),
        }
    }
}

/// 从 config 目录加载配置，环境变量 SCISTAR__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 SCISTAR__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if !path.exists() {
            return Err(config::ConfigError::NotFound(path.display().to_string()));
        }
        builder = builder.add_source(config::File::from(path.clone()).required(true));
    }

    builder = builder.add_source(
        config::Environment::with_prefix("SCISTAR")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_usable() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.runtime.concurrency, 1);
        assert_eq!(cfg.agent.sub_agent.name, "search_agent");
        assert!(cfg.agent.sub_agent.budget_fraction > 0.0);
        assert!(cfg.tools.code.allowed_imports.iter().any(|m| m == "math"));
        assert!(cfg.reflection.tool_classes.contains(&ToolClass::Search));
        assert_eq!(cfg.tools.inspector.converters["pdf"][0], "pdftotext");
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.toml");
        std::fs::write(
            &path,
            r#"
[agent]
max_steps = 5

[runtime]
concurrency = 4

[[tools.search.providers]]
name = "gateway"
endpoint = "http://localhost:9000/search"
"#,
        )
        .unwrap();
        let cfg = load_config(Some(path)).unwrap();
        assert_eq!(cfg.agent.max_steps, 5);
        assert_eq!(cfg.agent.max_step_retries, 2);
        assert_eq!(cfg.runtime.concurrency, 4);
        assert_eq!(cfg.tools.search.providers.len(), 1);
        assert_eq!(cfg.tools.search.providers[0].query_param, "q");
        assert_eq!(cfg.llm.protocol, ToolProtocol::Structured);
    }

    #[test]
    fn test_missing_explicit_config_is_an_error() {
        assert!(load_config(Some(PathBuf::from("/definitely/not/here.toml"))).is_err());
    }
}
