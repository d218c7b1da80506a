//! 组件装配
//!
//! 从 AppConfig 构建 LLM 客户端、工具注册表、AgentRuntime 与 DelegationCoordinator，
//! 供 Run Orchestrator 与测试共享。工具与 provider 全部由配置驱动注册。

use std::sync::Arc;
use std::time::Duration;

use crate::config::AppConfig;
use crate::core::{Budget, RecoveryEngine};
use crate::llm::{LlmClient, ModelReply, OpenAiClient, RetryConfig, RetryingLlmClient, ScriptedLlmClient};
use crate::react::prompts::{manager_prompt, SEARCH_AGENT_SYSTEM_PROMPT, SOLO_SYSTEM_PROMPT};
use crate::react::{AgentRole, AgentRuntime, DelegationCoordinator, Reflector, SubAgentSpec};
use crate::tools::{
    AggregatedSearch, AggregatedSearchTool, CodeExecTool, CommandConverter, CrawlTool, InMemoryRetrieval,
    InspectorContext, MediaInspectorTool, PageFetcher, RetrieverTool, SearchAndCrawlTool, TextInspectorTool,
    ToolExecutor, ToolRegistry, UnavailableDescriber,
};

/// 管理者角色名
pub const MANAGER_NAME: &str = "manager";

/// 按 [llm] 段创建客户端：mock 为离线脚本客户端；否则 OpenAI 兼容端点 + 重试
pub fn create_llm_from_config(cfg: &AppConfig) -> Arc<dyn LlmClient> {
    let provider = cfg.llm.provider.to_lowercase();
    let has_key = std::env::var("OPENAI_API_KEY").is_ok_and(|k| !k.is_empty());
    if provider == "mock" || !has_key {
        if provider != "mock" {
            tracing::warn!(provider = %provider, "OPENAI_API_KEY not set, using mock LLM");
        }
        return Arc::new(
            ScriptedLlmClient::new(Vec::new())
                .with_fallback(ModelReply::final_answer("Unable to determine"))
                .with_protocol(cfg.llm.protocol),
        );
    }
    tracing::info!(model = %cfg.llm.model, protocol = ?cfg.llm.protocol, "Using OpenAI-compatible LLM");
    let inner: Arc<dyn LlmClient> = Arc::new(OpenAiClient::from_config(&cfg.llm));
    let retry = RetryConfig {
        max_attempts: cfg.llm.retry.max_attempts,
        initial_backoff: Duration::from_millis(cfg.llm.retry.initial_backoff_ms),
        max_backoff: Duration::from_millis(cfg.llm.retry.max_backoff_ms),
    };
    Arc::new(RetryingLlmClient::new(inner, retry))
}

/// 注册全部内置工具（run_code 可在配置中关闭）
pub fn build_registry(cfg: &AppConfig, llm: Arc<dyn LlmClient>) -> ToolRegistry {
    let tools = &cfg.tools;
    let mut registry = ToolRegistry::new();

    let search = Arc::new(AggregatedSearch::from_config(&tools.search));
    if search.provider_count() == 0 {
        tracing::warn!("no search providers configured; web_search will report upstream failures");
    }
    let fetcher = Arc::new(PageFetcher::from_config(&tools.crawl));
    registry.register(AggregatedSearchTool::new(search.clone()));
    registry.register(CrawlTool::new(fetcher.clone()));
    registry.register(SearchAndCrawlTool::new(search, fetcher, tools.search.crawl_top_n));

    let inspector = InspectorContext::from_config(&tools.inspector, Some(llm));
    let describer = Arc::new(UnavailableDescriber);
    registry.register(
        TextInspectorTool::new(inspector.clone())
            .with_converter(Arc::new(CommandConverter::from_config(&tools.inspector))),
    );
    registry.register(MediaInspectorTool::image(inspector.clone(), describer.clone()));
    registry.register(MediaInspectorTool::audio(inspector, describer));

    registry.register(RetrieverTool::from_config(
        Arc::new(InMemoryRetrieval::new()),
        &tools.retrieval,
    ));

    if tools.code.enabled {
        registry.register(CodeExecTool::from_config(&tools.code));
    }
    registry
}

pub fn build_runtime(cfg: &AppConfig, llm: Arc<dyn LlmClient>, registry: ToolRegistry) -> AgentRuntime {
    AgentRuntime {
        reflector: Arc::new(Reflector::from_config(llm.clone(), &cfg.reflection)),
        tools: Arc::new(ToolExecutor::new(
            registry,
            Duration::from_secs(cfg.tools.tool_timeout_secs),
        )),
        llm,
        recovery: RecoveryEngine::from_config(&cfg.agent),
        max_reprompts: cfg.agent.max_reprompts,
    }
}

/// 只保留注册表中存在的工具名，未知名字记录告警
fn existing_tools(runtime: &AgentRuntime, wanted: &[String], role: &str) -> Vec<String> {
    let registry = runtime.tools.registry();
    wanted
        .iter()
        .filter(|name| {
            let ok = registry.contains(name);
            if !ok {
                tracing::warn!(role, tool = %name, "configured tool is not registered, skipping");
            }
            ok
        })
        .cloned()
        .collect()
}

/// 管理者（+ 可选搜索子智能体）
pub fn build_coordinator(cfg: &AppConfig, runtime: AgentRuntime) -> DelegationCoordinator {
    let agent = &cfg.agent;
    let sub = &agent.sub_agent;
    if !sub.enabled {
        let prompt = agent.system_prompt.clone().unwrap_or_else(|| SOLO_SYSTEM_PROMPT.to_string());
        return DelegationCoordinator::new(runtime, AgentRole::new(MANAGER_NAME, prompt));
    }

    let manager_prompt_text = agent.system_prompt.clone().unwrap_or_else(|| manager_prompt(&sub.name));
    let manager = AgentRole::new(MANAGER_NAME, manager_prompt_text)
        .with_tools(existing_tools(&runtime, &agent.manager_tools, MANAGER_NAME));
    let sub_role = AgentRole::new(
        sub.name.clone(),
        sub.system_prompt.clone().unwrap_or_else(|| SEARCH_AGENT_SYSTEM_PROMPT.to_string()),
    )
    .with_tools(existing_tools(&runtime, &sub.tools, &sub.name));

    DelegationCoordinator::new(runtime, manager).with_sub_agent(SubAgentSpec {
        role: sub_role,
        description: sub.description.clone(),
        budget_fraction: sub.budget_fraction,
    })
}

/// 每个任务的限额；budget() 在任务开始时调用，截止时间从那一刻算起
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskLimits {
    pub max_steps: usize,
    pub reflection_quota: usize,
    pub timeout: Option<Duration>,
}

impl TaskLimits {
    pub fn from_config(cfg: &AppConfig) -> Self {
        Self {
            max_steps: cfg.agent.max_steps,
            reflection_quota: if cfg.reflection.enabled { cfg.reflection.quota } else { 0 },
            timeout: cfg.agent.task_timeout_secs.map(Duration::from_secs),
        }
    }

    pub fn budget(&self) -> Budget {
        let budget = Budget::new(self.max_steps).with_reflection_quota(self.reflection_quota);
        match self.timeout {
            Some(t) => budget.with_deadline(t),
            None => budget,
        }
    }
}

/// 单个任务的预算（步数、截止时间、反思配额）
pub fn task_budget(cfg: &AppConfig) -> Budget {
    TaskLimits::from_config(cfg).budget()
}
