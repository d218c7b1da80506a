//! Web 搜索：多 provider 聚合
//!
//! 查询并发发往所有已配置的 provider（每个 provider 单独超时、单独限流），
//! 结果按 URL / 摘要去重后按名次轮流交错合并。全部失败报 UpstreamFailure；
//! 部分失败返回 degraded 结果，不会被当作完整成功。

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::join_all;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::{SearchProviderSection, SearchSection};
use crate::core::ToolError;
use crate::tools::rate_limit::RateLimiter;
use crate::tools::{Tool, ToolClass, ToolOutput};

/// 统一的搜索结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchHit {
    pub title: String,
    pub link: String,
    pub snippet: String,
    #[serde(default)]
    pub date: Option<String>,
    /// 返回该结果的 provider
    #[serde(default)]
    pub source: String,
}

/// 搜索 provider 能力接口；具体 SDK / 网关在外部实现
#[async_trait]
pub trait SearchProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn search(
        &self,
        query: &str,
        filter_year: Option<i32>,
        max_results: usize,
    ) -> Result<Vec<SearchHit>, ToolError>;
}

/// 一次聚合搜索的结果
#[derive(Debug, Clone)]
pub struct AggregatedResults {
    pub hits: Vec<SearchHit>,
    /// 至少一个 provider 失败
    pub degraded: bool,
    pub failures: Vec<(String, ToolError)>,
}

struct ProviderSlot {
    provider: Arc<dyn SearchProvider>,
    limiter: Option<Arc<RateLimiter>>,
}

/// 聚合搜索：join-on-all（每个 provider 带超时）
pub struct AggregatedSearch {
    providers: Vec<ProviderSlot>,
    per_provider_timeout: Duration,
    max_results: usize,
}

impl AggregatedSearch {
    pub fn new(per_provider_timeout: Duration, max_results: usize) -> Self {
        Self {
            providers: Vec::new(),
            per_provider_timeout,
            max_results,
        }
    }

    /// 按 [tools.search] 段注册 HTTP provider
    pub fn from_config(cfg: &SearchSection) -> Self {
        let mut agg = Self::new(Duration::from_secs(cfg.per_provider_timeout_secs), cfg.max_results);
        for p in &cfg.providers {
            let limiter = p.max_in_flight.map(|n| RateLimiter::new(p.name.clone(), n));
            agg = agg.with_provider(Arc::new(HttpJsonSearchProvider::from_config(p)), limiter);
        }
        agg
    }

    pub fn with_provider(mut self, provider: Arc<dyn SearchProvider>, limiter: Option<Arc<RateLimiter>>) -> Self {
        self.providers.push(ProviderSlot { provider, limiter });
        self
    }

    pub fn provider_count(&self) -> usize {
        self.providers.len()
    }

    async fn call_provider(
        &self,
        slot: &ProviderSlot,
        query: &str,
        filter_year: Option<i32>,
    ) -> Result<Vec<SearchHit>, ToolError> {
        let _guard = match &slot.limiter {
            Some(l) => Some(l.try_acquire()?),
            None => None,
        };
        tokio::time::timeout(
            self.per_provider_timeout,
            slot.provider.search(query, filter_year, self.max_results),
        )
        .await
        .map_err(|_| ToolError::timeout(format!("{} did not answer in time", slot.provider.name())))?
    }

    pub async fn search(&self, query: &str, filter_year: Option<i32>) -> Result<AggregatedResults, ToolError> {
        if self.providers.is_empty() {
            return Err(ToolError::upstream("no search providers configured"));
        }

        let calls = self.providers.iter().map(|slot| async move {
            (slot.provider.name().to_string(), self.call_provider(slot, query, filter_year).await)
        });
        let responses = join_all(calls).await;

        let mut ranked: Vec<Vec<SearchHit>> = Vec::new();
        let mut failures = Vec::new();
        for (name, result) in responses {
            match result {
                Ok(mut hits) => {
                    for h in hits.iter_mut() {
                        if h.source.is_empty() {
                            h.source = name.clone();
                        }
                    }
                    ranked.push(hits);
                }
                Err(e) => {
                    tracing::warn!(provider = %name, error = %e, "search provider failed");
                    failures.push((name, e));
                }
            }
        }

        if ranked.is_empty() {
            let detail = failures
                .iter()
                .map(|(n, e)| format!("{n}: {e}"))
                .collect::<Vec<_>>()
                .join("; ");
            return Err(ToolError::upstream(format!("all search providers failed ({detail})")));
        }

        Ok(AggregatedResults {
            hits: interleave_dedup(ranked, self.max_results),
            degraded: !failures.is_empty(),
            failures,
        })
    }
}

/// URL 归一化：忽略协议、www、片段与末尾斜杠，host 小写
pub fn normalize_url(url: &str) -> String {
    let url = url.trim();
    let rest = url.split_once("://").map_or(url, |(_, r)| r);
    let rest = rest.split('#').next().unwrap_or(rest);
    let (host, path) = rest.split_once('/').unwrap_or((rest, ""));
    let host = host.to_lowercase();
    let host = host.strip_prefix("www.").unwrap_or(&host);
    let path = path.trim_end_matches('/');
    if path.is_empty() {
        host.to_string()
    } else {
        format!("{host}/{path}")
    }
}

fn snippet_key(snippet: &str) -> Option<String> {
    let words: Vec<String> = snippet
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(|w| w.to_lowercase())
        .collect();
    // 太短的摘要不足以判断重复
    (words.len() >= 6).then(|| words.join(" "))
}

/// 按名次轮流取各 provider 的结果，跳过重复 URL / 摘要
fn interleave_dedup(ranked: Vec<Vec<SearchHit>>, max_results: usize) -> Vec<SearchHit> {
    let mut seen_urls = HashSet::new();
    let mut seen_snippets = HashSet::new();
    let mut out = Vec::new();
    let depth = ranked.iter().map(|r| r.len()).max().unwrap_or(0);
    'outer: for rank in 0..depth {
        for hits in &ranked {
            let Some(hit) = hits.get(rank) else { continue };
            if !seen_urls.insert(normalize_url(&hit.link)) {
                continue;
            }
            if let Some(key) = snippet_key(&hit.snippet) {
                if !seen_snippets.insert(key) {
                    continue;
                }
            }
            out.push(hit.clone());
            if out.len() >= max_results {
                break 'outer;
            }
        }
    }
    out
}

/// 渲染给模型看的结果列表
pub fn format_hits(query: &str, results: &AggregatedResults) -> String {
    let mut out = format!("## Search Results for '{query}'\n");
    if results.degraded {
        let failed: Vec<&str> = results.failures.iter().map(|(n, _)| n.as_str()).collect();
        out.push_str(&format!(
            "(partial coverage: provider(s) {} failed)\n",
            failed.join(", ")
        ));
    }
    for (i, hit) in results.hits.iter().enumerate() {
        out.push_str(&format!("\n{}. [{}]({})\n", i + 1, hit.title, hit.link));
        if let Some(date) = hit.date.as_deref().filter(|d| !d.is_empty()) {
            out.push_str(&format!("Date published: {date}\n"));
        }
        out.push_str(&format!("Source: {}\n{}\n", hit.source, hit.snippet));
    }
    out
}

fn parse_filter_year(args: &Value) -> Result<Option<i32>, ToolError> {
    match args.get("filter_year") {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n
            .as_i64()
            .and_then(|y| i32::try_from(y).ok())
            .map(Some)
            .ok_or_else(|| ToolError::invalid_input(format!("filter_year must be a year like 2020, got {n}"))),
        Some(Value::String(s)) if s.trim().is_empty() => Ok(None),
        Some(Value::String(s)) => s
            .trim()
            .parse::<i32>()
            .map(Some)
            .map_err(|_| ToolError::invalid_input(format!("filter_year must be a year, got '{s}'"))),
        Some(_) => Err(ToolError::invalid_input("filter_year must be a year like 2020")),
    }
}

/// web_search 工具
pub struct AggregatedSearchTool {
    search: Arc<AggregatedSearch>,
}

impl AggregatedSearchTool {
    pub fn new(search: Arc<AggregatedSearch>) -> Self {
        Self { search }
    }
}

#[async_trait]
impl Tool for AggregatedSearchTool {
    fn name(&self) -> &str {
        "web_search"
    }

    fn description(&self) -> &str {
        "Perform a web search and return ranked results (title, link, snippet). \
         Provide filter_year (YYYY) if you need results from a specific year."
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "query": { "type": "string", "description": "Search query (natural language or keywords)" },
                "filter_year": { "type": ["integer", "string"], "description": "Optional year filter, e.g. 2020" }
            },
            "required": ["query"]
        })
    }

    fn class(&self) -> ToolClass {
        ToolClass::Search
    }

    async fn execute(&self, args: Value) -> Result<ToolOutput, ToolError> {
        let query = args
            .get("query")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .trim();
        if query.is_empty() {
            return Err(ToolError::invalid_input("Missing query"));
        }
        let filter_year = parse_filter_year(&args)?;
        let results = self.search.search(query, filter_year).await?;
        if results.hits.is_empty() {
            let suffix = filter_year.map(|y| format!(" (filter year={y})")).unwrap_or_default();
            // 其余 provider 失败时零结果不代表真的没有，带上失败信息
            let failed = if results.failures.is_empty() {
                String::new()
            } else {
                let detail = results
                    .failures
                    .iter()
                    .map(|(n, e)| format!("{n}: {e}"))
                    .collect::<Vec<_>>()
                    .join("; ");
                format!(" Some providers failed, coverage is partial ({detail}).")
            };
            return Err(ToolError::not_found(format!(
                "No results for '{query}'{suffix}.{failed} Try a broader query."
            )));
        }
        let text = format_hits(query, &results);
        Ok(if results.degraded {
            ToolOutput::degraded(text)
        } else {
            ToolOutput::full(text)
        })
    }
}

/// 返回 JSON 结果列表的通用 HTTP 搜索端点（自建网关、SerpAPI 代理等）
pub struct HttpJsonSearchProvider {
    name: String,
    endpoint: String,
    query_param: String,
    api_key: Option<String>,
    extra_params: HashMap<String, String>,
    client: Client,
}

impl HttpJsonSearchProvider {
    pub fn from_config(cfg: &SearchProviderSection) -> Self {
        let api_key = cfg
            .api_key_env
            .as_deref()
            .and_then(|var| std::env::var(var).ok())
            .filter(|k| !k.is_empty());
        Self {
            name: cfg.name.clone(),
            endpoint: cfg.endpoint.clone(),
            query_param: cfg.query_param.clone(),
            api_key,
            extra_params: cfg.extra_params.clone(),
            client: Client::new(),
        }
    }
}

/// 从常见响应形状中取结果数组：顶层数组或 results / organic_results / items / data 字段
fn result_array(body: &Value) -> Option<&Vec<Value>> {
    if let Some(arr) = body.as_array() {
        return Some(arr);
    }
    ["results", "organic_results", "organic", "items", "data"]
        .iter()
        .find_map(|k| body.get(*k).and_then(|v| v.as_array()))
}

fn str_field(item: &Value, keys: &[&str]) -> String {
    keys.iter()
        .find_map(|k| item.get(*k).and_then(|v| v.as_str()))
        .unwrap_or_default()
        .to_string()
}

pub(crate) fn parse_search_body(provider: &str, body: &Value, max_results: usize) -> Vec<SearchHit> {
    result_array(body)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| {
                    let link = str_field(item, &["link", "url", "href"]);
                    if link.is_empty() {
                        return None;
                    }
                    let date = str_field(item, &["date", "published_date", "published"]);
                    Some(SearchHit {
                        title: str_field(item, &["title", "name"]),
                        link,
                        snippet: str_field(item, &["snippet", "content", "description", "body"]),
                        date: (!date.is_empty()).then_some(date),
                        source: provider.to_string(),
                    })
                })
                .take(max_results)
                .collect()
        })
        .unwrap_or_default()
}

#[async_trait]
impl SearchProvider for HttpJsonSearchProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn search(
        &self,
        query: &str,
        filter_year: Option<i32>,
        max_results: usize,
    ) -> Result<Vec<SearchHit>, ToolError> {
        let mut params: Vec<(String, String)> = vec![
            (self.query_param.clone(), query.to_string()),
            ("num".to_string(), max_results.to_string()),
        ];
        if let Some(year) = filter_year {
            params.push(("filter_year".to_string(), year.to_string()));
        }
        params.extend(self.extra_params.iter().map(|(k, v)| (k.clone(), v.clone())));

        let mut req = self.client.get(&self.endpoint).query(&params);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        let resp = req.send().await.map_err(|e| {
            if e.is_timeout() {
                ToolError::timeout(format!("{}: {e}", self.name))
            } else {
                ToolError::upstream(format!("{}: request failed: {e}", self.name))
            }
        })?;
        match resp.status() {
            StatusCode::TOO_MANY_REQUESTS => {
                return Err(ToolError::rate_limited(format!("{}: HTTP 429", self.name)))
            }
            s if !s.is_success() => return Err(ToolError::upstream(format!("{}: HTTP {s}", self.name))),
            _ => {}
        }
        let body: Value = resp
            .json()
            .await
            .map_err(|e| ToolError::upstream(format!("{}: invalid JSON body: {e}", self.name)))?;
        Ok(parse_search_body(&self.name, &body, max_results))
    }
}
