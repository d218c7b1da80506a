//! 步数预算：max_steps / consumed_steps / 可选截止时间 / 反思配额
//!
//! 只由拥有它的状态机修改；剩余预算单调递减，consumed_steps 永远不超过 max_steps。

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::core::AgentError;

#[derive(Debug, Clone)]
pub struct Budget {
    max_steps: usize,
    consumed_steps: usize,
    deadline: Option<Instant>,
    /// 本任务剩余可用的反思次数（反思也是预算的一部分，保证终止）
    reflection_quota: usize,
    reflections_used: usize,
}

/// 预算快照（写入 Outcome / 事件）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetSnapshot {
    pub max_steps: usize,
    pub consumed_steps: usize,
    pub reflections_used: usize,
}

impl Budget {
    pub fn new(max_steps: usize) -> Self {
        Self {
            max_steps,
            consumed_steps: 0,
            deadline: None,
            reflection_quota: 0,
            reflections_used: 0,
        }
    }

    pub fn with_deadline(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }

    pub fn with_deadline_at(mut self, deadline: Option<Instant>) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn with_reflection_quota(mut self, quota: usize) -> Self {
        self.reflection_quota = quota;
        self
    }

    pub fn max_steps(&self) -> usize {
        self.max_steps
    }

    pub fn consumed_steps(&self) -> usize {
        self.consumed_steps
    }

    pub fn remaining(&self) -> usize {
        self.max_steps - self.consumed_steps
    }

    pub fn is_exhausted(&self) -> bool {
        self.consumed_steps >= self.max_steps
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn deadline_passed(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// 消耗一步；若会超出 max_steps 则不修改并返回 BudgetExhausted
    pub fn try_consume(&mut self) -> Result<usize, AgentError> {
        if self.consumed_steps >= self.max_steps {
            return Err(AgentError::BudgetExhausted {
                consumed: self.consumed_steps,
                max_steps: self.max_steps,
            });
        }
        self.consumed_steps += 1;
        Ok(self.consumed_steps)
    }

    pub fn reflections_left(&self) -> usize {
        self.reflection_quota.saturating_sub(self.reflections_used)
    }

    pub fn reflections_used(&self) -> usize {
        self.reflections_used
    }

    /// 占用一次反思配额；配额耗尽返回 false（调用方直接走 Abandon）
    pub fn try_reflect(&mut self) -> bool {
        if self.reflections_left() == 0 {
            return false;
        }
        self.reflections_used += 1;
        true
    }

    /// 为子智能体切出预算：剩余步数的 fraction（至少 1 步，且永不超过剩余步数），
    /// 继承截止时间与剩余反思配额
    pub fn child(&self, fraction: f64) -> Budget {
        let remaining = self.remaining();
        let share = (remaining as f64 * fraction.clamp(0.0, 1.0)).floor() as usize;
        let steps = share.max(1).min(remaining);
        Budget::new(steps)
            .with_deadline_at(self.deadline)
            .with_reflection_quota(self.reflections_left())
    }

    /// 子智能体结束后把其消耗的反思配额计入本预算（不影响步数）
    pub fn absorb_reflections(&mut self, used: usize) {
        self.reflections_used = (self.reflections_used + used).min(self.reflection_quota);
    }

    pub fn snapshot(&self) -> BudgetSnapshot {
        BudgetSnapshot {
            max_steps: self.max_steps,
            consumed_steps: self.consumed_steps,
            reflections_used: self.reflections_used,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_consume_never_exceeds_max() {
        let mut b = Budget::new(2);
        assert_eq!(b.try_consume().unwrap(), 1);
        assert_eq!(b.try_consume().unwrap(), 2);
        assert!(b.is_exhausted());
        assert!(matches!(
            b.try_consume(),
            Err(AgentError::BudgetExhausted { consumed: 2, max_steps: 2 })
        ));
        assert_eq!(b.consumed_steps(), 2);
        assert_eq!(b.remaining(), 0);
    }

    #[test]
    fn test_reflection_quota() {
        let mut b = Budget::new(10).with_reflection_quota(1);
        assert!(b.try_reflect());
        assert!(!b.try_reflect());
        assert_eq!(b.reflections_used(), 1);
    }

    #[test]
    fn test_child_budget_is_fraction_of_remaining() {
        let mut b = Budget::new(10).with_reflection_quota(3);
        for _ in 0..4 {
            b.try_consume().unwrap();
        }
        let child = b.child(0.5);
        assert_eq!(child.max_steps(), 3);
        assert_eq!(child.reflections_left(), 3);

        let full = b.child(2.0);
        assert_eq!(full.max_steps(), 6);

        let tiny = b.child(0.01);
        assert_eq!(tiny.max_steps(), 1);
    }

    #[test]
    fn test_child_of_exhausted_budget_has_no_steps() {
        let mut b = Budget::new(1);
        b.try_consume().unwrap();
        assert_eq!(b.child(0.5).max_steps(), 0);
    }

    #[test]
    fn test_deadline() {
        let b = Budget::new(1).with_deadline(Duration::from_secs(0));
        assert!(b.deadline_passed());
        let b = Budget::new(1).with_deadline(Duration::from_secs(3600));
        assert!(!b.deadline_passed());
        assert!(!Budget::new(1).deadline_passed());
    }
}
