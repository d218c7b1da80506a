//! 运行级关闭信号
//!
//! Ctrl+C / SIGTERM 触发根 CancellationToken；每个任务持有其子 token，
//! 状态机在下一个挂起点观察到取消后以 FAILED(cancelled) 结束，结果照常追加到结果日志。

use std::sync::Arc;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// 关闭原因
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    /// Ctrl+C
    UserInitiated,
    /// SIGTERM 信号
    Signal,
    /// 运行中出现致命错误（如结果文件不可写）
    FatalError(String),
}

/// 关闭信号管理器：根 token + 最近一次关闭原因
#[derive(Clone)]
pub struct ShutdownManager {
    token: CancellationToken,
    reason_tx: Arc<watch::Sender<Option<ShutdownReason>>>,
}

impl ShutdownManager {
    pub fn new() -> Self {
        let (reason_tx, _) = watch::channel(None);
        Self {
            token: CancellationToken::new(),
            reason_tx: Arc::new(reason_tx),
        }
    }

    /// 为单个任务派生子 token：根取消时子 token 一并取消，反之不影响其它任务
    pub fn task_token(&self) -> CancellationToken {
        self.token.child_token()
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn shutdown(&self, reason: ShutdownReason) {
        tracing::warn!(?reason, "shutdown requested, cancelling in-flight tasks");
        self.reason_tx.send_replace(Some(reason));
        self.token.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn reason(&self) -> Option<ShutdownReason> {
        self.reason_tx.borrow().clone()
    }

    /// 安装系统信号处理器 (Ctrl+C, SIGTERM)
    pub fn install_signal_handlers(&self) {
        let manager = self.clone();
        tokio::spawn(async move {
            if let Ok(()) = tokio::signal::ctrl_c().await {
                tracing::info!("Received Ctrl+C, cancelling run...");
                manager.shutdown(ShutdownReason::UserInitiated);
            }
        });

        #[cfg(unix)]
        {
            let manager = self.clone();
            tokio::spawn(async move {
                use tokio::signal::unix::{signal, SignalKind};
                if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                    sigterm.recv().await;
                    tracing::info!("Received SIGTERM, cancelling run...");
                    manager.shutdown(ShutdownReason::Signal);
                }
            });
        }
    }
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shutdown_cancels_task_tokens() {
        let manager = ShutdownManager::new();
        let a = manager.task_token();
        let b = manager.task_token();
        assert!(!manager.is_shutdown());
        manager.shutdown(ShutdownReason::UserInitiated);
        assert!(a.is_cancelled());
        assert!(b.is_cancelled());
        assert_eq!(manager.reason(), Some(ShutdownReason::UserInitiated));
    }

    #[test]
    fn test_task_token_cancel_is_local() {
        let manager = ShutdownManager::new();
        let a = manager.task_token();
        let b = manager.task_token();
        a.cancel();
        assert!(!b.is_cancelled());
        assert!(!manager.is_shutdown());
    }
}
