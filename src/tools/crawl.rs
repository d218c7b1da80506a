//! 网页抓取：crawl_page 与 search_and_crawl
//!
//! GET 请求带超时与浏览器 UA；HTML 用 html2text 提取可读文本，超过 max_result_chars 截断。
//! HTTP 404 → NotFound，429 → RateLimited，其余失败 → UpstreamFailure。

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::join_all;
use html2text::from_read;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, ACCEPT_LANGUAGE};
use reqwest::{Client, StatusCode};
use serde_json::Value;

use crate::config::CrawlSection;
use crate::core::ToolError;
use crate::tools::search::AggregatedSearch;
use crate::tools::{Tool, ToolClass, ToolOutput};

const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36";

/// 抓取结果为空时给模型的提示
const EMPTY_PAGE_HINT: &str =
    "returned no readable text. It may be a PDF or an uncrawlable page; try inspect_file_as_text on it.";

/// 简易去除 HTML 标签（html2text 失败时的回退）
fn strip_tags(html: &str) -> String {
    let mut out = String::with_capacity(html.len());
    let mut in_tag = false;
    for c in html.chars() {
        match c {
            '<' => in_tag = true,
            '>' => {
                in_tag = false;
                out.push(' ');
            }
            _ if !in_tag => out.push(c),
            _ => {}
        }
    }
    out.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn looks_like_html(s: &str, content_type: Option<&str>) -> bool {
    if content_type.is_some_and(|ct| ct.contains("html")) {
        return true;
    }
    let head: String = s.trim_start().chars().take(512).collect::<String>().to_ascii_lowercase();
    head.starts_with("<!doctype") || head.starts_with("<html") || head.contains("<head") || head.contains("<body")
}

/// 提取 host（小写，不含端口）
pub fn url_host(url: &str) -> Option<String> {
    let rest = url
        .trim()
        .strip_prefix("https://")
        .or_else(|| url.trim().strip_prefix("http://"))?;
    let host = rest.split(['/', '?', '#']).next()?.split(':').next()?;
    (!host.is_empty()).then(|| host.to_lowercase())
}

fn truncate_chars(text: String, limit: usize) -> String {
    if text.chars().count() > limit {
        text.chars().take(limit).collect::<String>() + "\n...[truncated]"
    } else {
        text
    }
}

/// 共享的页面抓取器（只读，跨任务共享一个 reqwest Client）
pub struct PageFetcher {
    client: Client,
    allowed_domains: HashSet<String>,
    max_result_chars: usize,
}

impl PageFetcher {
    pub fn new(timeout: Duration, max_result_chars: usize, allowed_domains: Vec<String>) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(
            ACCEPT,
            HeaderValue::from_static("text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8"),
        );
        headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("en-US,en;q=0.9"));
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .default_headers(headers)
            .build()
            .unwrap_or_default();
        Self {
            client,
            allowed_domains: allowed_domains.into_iter().map(|d| d.to_lowercase()).collect(),
            max_result_chars,
        }
    }

    pub fn from_config(cfg: &CrawlSection) -> Self {
        Self::new(
            Duration::from_secs(cfg.timeout_secs),
            cfg.max_result_chars,
            cfg.allowed_domains.clone(),
        )
    }

    /// 白名单为空表示不限；子域名视为同一域
    fn check_url(&self, url: &str) -> Result<(), ToolError> {
        let host = url_host(url).ok_or_else(|| ToolError::invalid_input(format!("Not an http(s) URL: {url}")))?;
        if self.allowed_domains.is_empty()
            || self
                .allowed_domains
                .iter()
                .any(|d| host == *d || host.ends_with(&format!(".{d}")))
        {
            Ok(())
        } else {
            Err(ToolError::invalid_input(format!("Domain not in allowlist: {host}")))
        }
    }

    /// 抓取并转为纯文本；空页面返回 Ok("")
    pub async fn fetch_text(&self, url: &str) -> Result<String, ToolError> {
        self.check_url(url)?;
        let resp = self.client.get(url).send().await.map_err(|e| {
            if e.is_timeout() {
                ToolError::timeout(format!("Fetching {url} timed out"))
            } else {
                ToolError::upstream(format!("Request to {url} failed: {e}"))
            }
        })?;
        match resp.status() {
            StatusCode::NOT_FOUND | StatusCode::GONE => {
                return Err(ToolError::not_found(format!("{url} returned HTTP {}", resp.status())))
            }
            StatusCode::TOO_MANY_REQUESTS => {
                return Err(ToolError::rate_limited(format!("{url} returned HTTP 429")))
            }
            s if !s.is_success() => return Err(ToolError::upstream(format!("{url} returned HTTP {s}"))),
            _ => {}
        }
        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_lowercase());
        let body = resp
            .text()
            .await
            .map_err(|e| ToolError::upstream(format!("Reading body of {url} failed: {e}")))?;
        let body = body.trim_start_matches('\u{FEFF}');

        let text = if looks_like_html(body, content_type.as_deref()) {
            match from_read(body.as_bytes(), 120) {
                Ok(t) if !t.trim().is_empty() => t,
                _ => strip_tags(body),
            }
        } else {
            body.to_string()
        };
        Ok(truncate_chars(text.trim().to_string(), self.max_result_chars))
    }
}

fn url_arg(args: &Value) -> Result<&str, ToolError> {
    let url = args.get("url").and_then(|v| v.as_str()).unwrap_or("").trim();
    if url.is_empty() {
        return Err(ToolError::invalid_input("Missing url"));
    }
    Ok(url)
}

/// crawl_page 工具
pub struct CrawlTool {
    fetcher: Arc<PageFetcher>,
}

impl CrawlTool {
    pub fn new(fetcher: Arc<PageFetcher>) -> Self {
        Self { fetcher }
    }
}

#[async_trait]
impl Tool for CrawlTool {
    fn name(&self) -> &str {
        "crawl_page"
    }

    fn description(&self) -> &str {
        "Fetch a webpage by URL and return its text content. Use for diving deeper into search results."
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "url": { "type": "string", "description": "URL to fetch (http or https)" }
            },
            "required": ["url"]
        })
    }

    fn class(&self) -> ToolClass {
        ToolClass::Crawl
    }

    async fn execute(&self, args: Value) -> Result<ToolOutput, ToolError> {
        let url = url_arg(&args)?;
        tracing::info!(url = %url, "crawl_page fetch");
        let text = self.fetcher.fetch_text(url).await?;
        if text.is_empty() {
            return Ok(ToolOutput::full(format!("Crawling {url} {EMPTY_PAGE_HINT}")));
        }
        Ok(ToolOutput::full(text))
    }
}

/// search_and_crawl 工具：先搜索，再并发抓取前 N 个链接
pub struct SearchAndCrawlTool {
    search: Arc<AggregatedSearch>,
    fetcher: Arc<PageFetcher>,
    default_urls: usize,
}

impl SearchAndCrawlTool {
    pub fn new(search: Arc<AggregatedSearch>, fetcher: Arc<PageFetcher>, default_urls: usize) -> Self {
        Self {
            search,
            fetcher,
            default_urls: default_urls.max(1),
        }
    }
}

#[async_trait]
impl Tool for SearchAndCrawlTool {
    fn name(&self) -> &str {
        "search_and_crawl"
    }

    fn description(&self) -> &str {
        "Search the web, then fetch the full content of the top URLs. Use when snippets are not enough."
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "query": { "type": "string", "description": "Search query" },
                "filter_year": { "type": ["integer", "string"], "description": "Optional year filter" },
                "num_urls": { "type": "integer", "description": "Number of URLs to crawl (default 3)" }
            },
            "required": ["query"]
        })
    }

    fn class(&self) -> ToolClass {
        ToolClass::Search
    }

    async fn execute(&self, args: Value) -> Result<ToolOutput, ToolError> {
        let query = args.get("query").and_then(|v| v.as_str()).unwrap_or("").trim();
        if query.is_empty() {
            return Err(ToolError::invalid_input("Missing query"));
        }
        let filter_year = args
            .get("filter_year")
            .and_then(|v| v.as_i64().or_else(|| v.as_str().and_then(|s| s.trim().parse().ok())))
            .map(|y| y as i32);
        let num_urls = args
            .get("num_urls")
            .and_then(|v| v.as_u64())
            .map(|n| n as usize)
            .unwrap_or(self.default_urls)
            .clamp(1, 10);

        let results = self.search.search(query, filter_year).await?;
        if results.hits.is_empty() {
            return Err(ToolError::not_found(format!("No results for '{query}'. Try a broader query.")));
        }

        let urls: Vec<&str> = results.hits.iter().take(num_urls).map(|h| h.link.as_str()).collect();
        let pages = join_all(urls.iter().map(|u| self.fetcher.fetch_text(u))).await;

        let mut degraded = results.degraded;
        let mut out = format!("# Search: {query}\n\n## Results\n");
        for (i, (url, page)) in urls.iter().zip(pages).enumerate() {
            let body = match page {
                Ok(text) if text.is_empty() => format!("(page {EMPTY_PAGE_HINT})"),
                Ok(text) => text,
                Err(e) => {
                    degraded = true;
                    format!("(could not fetch: {e})")
                }
            };
            out.push_str(&format!("### {}. {url}\n\n{body}\n\n---\n", i + 1));
        }
        Ok(ToolOutput { content: out, degraded })
    }
}
