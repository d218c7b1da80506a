//! 结果存储：append-only JSONL，一行一个已完成任务
//!
//! 写入通过 Mutex 串行化，每行写完即 flush，运行中任意时刻文件都可逐行解析。
//! 续跑时从已有文件读取完成的 task id；无法解析的行（如中断时写了一半）被跳过。

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use tokio::fs;
use std::io::SeekFrom;

use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;

use crate::runner::record::RunRecord;

pub struct ResultsStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl ResultsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 已有记录的 task id
    pub async fn completed_ids(&self) -> std::io::Result<HashSet<String>> {
        let content = match fs::read_to_string(&self.path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(HashSet::new()),
            Err(e) => return Err(e),
        };
        let mut ids = HashSet::new();
        for (i, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<serde_json::Value>(line) {
                Ok(v) => match v.get("id").and_then(|id| id.as_str()) {
                    Some(id) => {
                        ids.insert(id.to_string());
                    }
                    None => tracing::warn!(line = i + 1, "result line without id, skipping"),
                },
                Err(e) => tracing::warn!(line = i + 1, error = %e, "unparseable result line, skipping"),
            }
        }
        Ok(ids)
    }

    pub async fn append(&self, record: &RunRecord) -> std::io::Result<()> {
        let mut line = serde_json::to_string(record)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        line.push('\n');
        let _guard = self.lock.lock().await;
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let mut file = fs::OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&self.path)
            .await?;
        // 上次中断可能留下没有换行的半行；先补换行，避免新记录接在残片后面
        if file.metadata().await?.len() > 0 {
            file.seek(SeekFrom::End(-1)).await?;
            let mut last = [0u8; 1];
            file.read_exact(&mut last).await?;
            if last[0] != b'\n' {
                tracing::warn!(path = %self.path.display(), "results log ends with a partial line, starting a new one");
                line.insert(0, '\n');
            }
        }
        file.write_all(line.as_bytes()).await?;
        file.flush().await
    }

    /// 读出全部可解析的记录
    pub async fn load(&self) -> std::io::Result<Vec<RunRecord>> {
        let content = match fs::read_to_string(&self.path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        Ok(content
            .lines()
            .filter_map(|l| serde_json::from_str::<RunRecord>(l).ok())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::task::Task;

    fn record(id: &str) -> RunRecord {
        RunRecord::internal_failure(
            &Task::new(id, "q"),
            "test",
            "q".into(),
            "boom".into(),
            "t0".into(),
            "t1".into(),
        )
    }

    #[tokio::test]
    async fn test_append_then_read_ids() {
        let dir = tempfile::tempdir().unwrap();
        let store = ResultsStore::new(dir.path().join("run").join("answers.jsonl"));
        assert!(store.completed_ids().await.unwrap().is_empty());
        store.append(&record("1")).await.unwrap();
        store.append(&record("2")).await.unwrap();
        let ids = store.completed_ids().await.unwrap();
        assert_eq!(ids, HashSet::from(["1".to_string(), "2".to_string()]));
        assert_eq!(store.load().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_truncated_line_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("answers.jsonl");
        std::fs::write(&path, "{\"id\": \"1\"}\n{\"id\": \"2\", \"pred").unwrap();
        let ids = ResultsStore::new(&path).completed_ids().await.unwrap();
        assert_eq!(ids, HashSet::from(["1".to_string()]));
    }

    #[tokio::test]
    async fn test_append_after_partial_line_stays_readable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("answers.jsonl");
        std::fs::write(&path, "{\"id\": \"1\"}\n{\"id\": \"2\", \"pred").unwrap();
        let store = ResultsStore::new(&path);
        store.append(&record("3")).await.unwrap();
        store.append(&record("4")).await.unwrap();
        let ids = store.completed_ids().await.unwrap();
        assert_eq!(ids, HashSet::from(["1".to_string(), "3".to_string(), "4".to_string()]));
        let ids: Vec<String> = store.load().await.unwrap().into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec!["3", "4"]);
    }
}
