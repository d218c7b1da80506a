//! 评分钩子：把每个任务的预测交给外部评分方（本 crate 不判定对错）

use async_trait::async_trait;
use serde_json::Value;

#[async_trait]
pub trait Scorer: Send + Sync {
    /// 返回写入结果记录 judgment 字段的内容；None 表示未评分
    async fn score(&self, task_id: &str, prediction: &str, reference: Option<&str>) -> Option<Value>;
}

pub struct NoopScorer;

#[async_trait]
impl Scorer for NoopScorer {
    async fn score(&self, _task_id: &str, _prediction: &str, _reference: Option<&str>) -> Option<Value> {
        None
    }
}
