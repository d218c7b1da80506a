//! 语义检索：Retrieval 接口、内存实现与 retrieve_content 工具
//!
//! Retrieval 只暴露 query / upsert，核心不关心后端（向量库、图库、对象存储）细节。
//! 内置 InMemoryRetrieval 用词频余弦相似度打分；嵌入模型后端实现同一 trait 即可替换。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;

use crate::config::RetrievalSection;
use crate::core::ToolError;
use crate::tools::{Tool, ToolClass, ToolOutput};

/// 检索命中的段落
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Passage {
    pub text: String,
    pub score: f32,
}

#[async_trait]
pub trait Retrieval: Send + Sync {
    /// 返回按分数降序的至多 k 个段落
    async fn query(&self, text: &str, k: usize) -> Result<Vec<Passage>, ToolError>;

    /// 写入一个文档，返回其 id
    async fn upsert(&self, document: &str) -> Result<String, ToolError>;
}

/// 分块：目标 chunk_size 个字符，优先在段落 / 句子 / 空格处断开，相邻块重叠 overlap 个字符
#[derive(Debug, Clone)]
pub struct Chunker {
    chunk_size: usize,
    overlap: usize,
}

const SEPARATORS: &[&str] = &["\n\n", "\n", ". ", "。", "? ", "! ", " "];

impl Chunker {
    pub fn new(chunk_size: usize, overlap: usize) -> Self {
        let chunk_size = chunk_size.max(1);
        Self {
            chunk_size,
            overlap: overlap.min(chunk_size - 1),
        }
    }

    pub fn chunk(&self, text: &str) -> Vec<String> {
        let chars: Vec<char> = text.chars().collect();
        let total = chars.len();
        let mut chunks = Vec::new();
        let mut start = 0;
        while start < total {
            let target = (start + self.chunk_size).min(total);
            let mut end = target;
            if target < total {
                let window: String = chars[start..target].iter().collect();
                // 分隔符位置不能太靠前，否则块会退化得很小
                let min_len = self.chunk_size / 2;
                if let Some(cut) = SEPARATORS.iter().find_map(|sep| {
                    window
                        .rfind(sep)
                        .map(|pos| window[..pos].chars().count() + sep.chars().count())
                        .filter(|&n| n > min_len)
                }) {
                    end = start + cut;
                }
            }
            let piece: String = chars[start..end].iter().collect();
            if !piece.trim().is_empty() {
                chunks.push(piece.trim().to_string());
            }
            if end >= total {
                break;
            }
            let next = end.saturating_sub(self.overlap);
            start = if next > start { next } else { end };
        }
        chunks
    }
}

impl Default for Chunker {
    fn default() -> Self {
        Self::new(500, 50)
    }
}

fn term_frequencies(text: &str) -> HashMap<String, f32> {
    let mut tf = HashMap::new();
    for term in text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.chars().count() > 1 || t.chars().all(|c| c.is_ascii_digit()))
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
    {
        *tf.entry(term).or_insert(0.0) += 1.0;
    }
    tf
}

fn norm(tf: &HashMap<String, f32>) -> f32 {
    tf.values().map(|v| v * v).sum::<f32>().sqrt()
}

struct Entry {
    text: String,
    tf: HashMap<String, f32>,
    norm: f32,
}

/// 内存检索后端（词频余弦）
#[derive(Default)]
pub struct InMemoryRetrieval {
    entries: RwLock<Vec<Entry>>,
}

impl InMemoryRetrieval {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}

#[async_trait]
impl Retrieval for InMemoryRetrieval {
    async fn query(&self, text: &str, k: usize) -> Result<Vec<Passage>, ToolError> {
        let q = term_frequencies(text);
        let q_norm = norm(&q);
        if q_norm == 0.0 {
            return Err(ToolError::invalid_input("query has no searchable terms"));
        }
        let entries = self.entries.read().await;
        let mut scored: Vec<Passage> = entries
            .iter()
            .filter(|e| e.norm > 0.0)
            .map(|e| {
                let dot: f32 = q.iter().filter_map(|(t, w)| e.tf.get(t).map(|x| x * w)).sum();
                Passage {
                    text: e.text.clone(),
                    score: dot / (q_norm * e.norm),
                }
            })
            .filter(|p| p.score > 0.0)
            .collect();
        scored.sort_by(|a, b| b.score.total_cmp(&a.score));
        scored.truncate(k);
        Ok(scored)
    }

    async fn upsert(&self, document: &str) -> Result<String, ToolError> {
        let tf = term_frequencies(document);
        let mut entries = self.entries.write().await;
        // 相同文本只保留一份
        if let Some(i) = entries.iter().position(|e| e.text == document) {
            return Ok(format!("doc-{i}"));
        }
        entries.push(Entry {
            text: document.to_string(),
            norm: norm(&tf),
            tf,
        });
        Ok(format!("doc-{}", entries.len() - 1))
    }
}

/// retrieve_content 工具：给了 content 时在临时索引里检索，否则查询共享后端
pub struct RetrieverTool {
    backend: Arc<dyn Retrieval>,
    chunker: Chunker,
    top_k: usize,
    min_score: f32,
}

impl RetrieverTool {
    pub fn new(backend: Arc<dyn Retrieval>, chunker: Chunker, top_k: usize, min_score: f32) -> Self {
        Self {
            backend,
            chunker,
            top_k: top_k.max(1),
            min_score,
        }
    }

    pub fn from_config(backend: Arc<dyn Retrieval>, cfg: &RetrievalSection) -> Self {
        Self::new(
            backend,
            Chunker::new(cfg.chunk_size, cfg.chunk_overlap),
            cfg.top_k,
            cfg.min_score,
        )
    }
}

#[async_trait]
impl Tool for RetrieverTool {
    fn name(&self) -> &str {
        "retrieve_content"
    }

    fn description(&self) -> &str {
        "Given a query and (optionally) long text content from search, crawl or a document, \
         return the passages most relevant to the query. Without content, searches the shared knowledge store."
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "query": { "type": "string", "description": "The question to find relevant passages for" },
                "content": { "type": "string", "description": "Text to search within (optional)" }
            },
            "required": ["query"]
        })
    }

    fn class(&self) -> ToolClass {
        ToolClass::Retrieval
    }

    async fn execute(&self, args: Value) -> Result<ToolOutput, ToolError> {
        let query = args.get("query").and_then(|v| v.as_str()).unwrap_or("").trim();
        if query.is_empty() {
            return Err(ToolError::invalid_input("Missing query"));
        }
        let content = args.get("content").and_then(|v| v.as_str()).map(str::trim);

        let passages = match content {
            Some("") => return Err(ToolError::invalid_input("No content provided to search")),
            Some(text) => {
                let scratch = InMemoryRetrieval::new();
                for chunk in self.chunker.chunk(text) {
                    scratch.upsert(&chunk).await?;
                }
                scratch.query(query, self.top_k).await?
            }
            None => self.backend.query(query, self.top_k).await?,
        };
        let passages: Vec<Passage> = passages.into_iter().filter(|p| p.score >= self.min_score).collect();
        if passages.is_empty() {
            return Err(ToolError::not_found(format!(
                "No passages relevant to '{query}'. Rephrase the query or provide different content."
            )));
        }

        let body = passages
            .iter()
            .enumerate()
            .map(|(i, p)| format!("[{}] (score {:.2})\n{}", i + 1, p.score, p.text))
            .collect::<Vec<_>>()
            .join("\n\n");
        Ok(ToolOutput::full(format!("## Relevant passages for '{query}'\n\n{body}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ToolErrorKind;

    #[test]
    fn test_chunker_overlaps_and_covers_text() {
        let text = "word ".repeat(300);
        let chunks = Chunker::new(100, 20).chunk(&text);
        assert!(chunks.len() > 10);
        assert!(chunks.iter().all(|c| c.chars().count() <= 100));
        assert!(Chunker::new(100, 20).chunk("   ").is_empty());
    }

    #[test]
    fn test_chunker_prefers_paragraph_breaks() {
        let text = format!("{}\n\n{}", "a".repeat(70), "b".repeat(70));
        let chunks = Chunker::new(100, 0).chunk(&text);
        assert_eq!(chunks[0], "a".repeat(70));
    }

    #[tokio::test]
    async fn test_in_memory_ranks_by_overlap() {
        let store = InMemoryRetrieval::new();
        store.upsert("The mitochondria is the powerhouse of the cell").await.unwrap();
        store.upsert("Rust ownership rules and borrowing").await.unwrap();
        store.upsert("Rust ownership rules and borrowing").await.unwrap();
        assert_eq!(store.len().await, 2);

        let hits = store.query("what powers the cell? mitochondria", 5).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert!(hits[0].text.contains("mitochondria"));
    }

    #[tokio::test]
    async fn test_tool_uses_given_content_and_reports_misses() {
        let tool = RetrieverTool::new(Arc::new(InMemoryRetrieval::new()), Chunker::new(60, 10), 2, 0.05);
        let content = "Graphene is a single layer of carbon atoms.\n\nThe Krebs cycle produces ATP in cells.";
        let out = tool
            .execute(serde_json::json!({"query": "carbon atoms graphene", "content": content}))
            .await
            .unwrap();
        assert!(out.content.contains("Graphene"));

        let err = tool
            .execute(serde_json::json!({"query": "volcano", "content": content}))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ToolErrorKind::NotFound);

        let err = tool.execute(serde_json::json!({"query": "x", "content": " "})).await.unwrap_err();
        assert_eq!(err.kind, ToolErrorKind::InvalidInput);
    }
}
