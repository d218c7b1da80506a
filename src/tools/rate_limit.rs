//! 上游限流计数器
//!
//! 每个 provider 一个在途请求计数器，跨任务共享；只通过原子 CAS 增减，
//! 超限立即返回 RateLimited（瞬时错误），RateLimitGuard 在 drop 时归还名额。

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::core::ToolError;

#[derive(Debug)]
pub struct RateLimiter {
    name: String,
    max_in_flight: usize,
    in_flight: AtomicUsize,
}

/// 持有期间占用一个名额
#[derive(Debug)]
pub struct RateLimitGuard {
    limiter: Arc<RateLimiter>,
}

impl RateLimiter {
    pub fn new(name: impl Into<String>, max_in_flight: usize) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            max_in_flight,
            in_flight: AtomicUsize::new(0),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// 占用一个名额；已满则不修改计数并返回 RateLimited
    pub fn try_acquire(self: &Arc<Self>) -> Result<RateLimitGuard, ToolError> {
        let max = self.max_in_flight;
        self.in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < max).then_some(n + 1))
            .map_err(|n| {
                ToolError::rate_limited(format!("{}: {n}/{max} requests already in flight", self.name))
            })?;
        Ok(RateLimitGuard {
            limiter: Arc::clone(self),
        })
    }
}

impl Drop for RateLimitGuard {
    fn drop(&mut self) {
        self.limiter.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guard_releases_on_drop() {
        let limiter = RateLimiter::new("p", 2);
        let a = limiter.try_acquire().unwrap();
        let _b = limiter.try_acquire().unwrap();
        let err = limiter.try_acquire().unwrap_err();
        assert!(err.is_transient());
        assert_eq!(limiter.in_flight(), 2);
        drop(a);
        assert_eq!(limiter.in_flight(), 1);
        assert!(limiter.try_acquire().is_ok());
    }

    #[test]
    fn test_concurrent_acquire_never_exceeds_limit() {
        let limiter = RateLimiter::new("p", 3);
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let l = Arc::clone(&limiter);
                std::thread::spawn(move || {
                    for _ in 0..200 {
                        if let Ok(guard) = l.try_acquire() {
                            assert!(l.in_flight() <= 3);
                            drop(guard);
                        }
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(limiter.in_flight(), 0);
    }
}
