//! 优雅关闭：统一的停止信号与有界等待
//!
//! 所有后台任务（监控采样、编排 tick、反馈调度）都在自己的 select 循环里
//! 监听同一个 CancellationToken；join 一律带超时，超时记日志后继续，
//! 绝不让关闭流程挂死进程。

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// 关闭信号管理器。shutdown 可重复调用，后续调用为 no-op。
#[derive(Clone)]
pub struct ShutdownManager {
    token: CancellationToken,
}

impl ShutdownManager {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    /// 获取子任务用的取消 token
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// 请求全部后台任务退出
    pub fn shutdown(&self) {
        if !self.token.is_cancelled() {
            tracing::info!("Shutdown requested");
            self.token.cancel();
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.token.is_cancelled()
    }

    /// 等待关闭信号
    pub async fn wait_for_shutdown(&self) {
        self.token.cancelled().await;
    }
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}

/// 有界 join：任务在 timeout 内退出则正常回收，否则记告警并放弃等待
pub async fn join_with_timeout(handle: JoinHandle<()>, timeout: Duration, name: &str) {
    match tokio::time::timeout(timeout, handle).await {
        Ok(Ok(())) => {
            tracing::debug!("Task '{}' joined cleanly", name);
        }
        Ok(Err(e)) => {
            tracing::warn!("Task '{}' join failed: {}", name, e);
        }
        Err(_) => {
            tracing::warn!(
                "Task '{}' did not stop within {:?}, proceeding anyway",
                name,
                timeout
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shutdown_is_idempotent() {
        let manager = ShutdownManager::new();
        assert!(!manager.is_shutdown());

        manager.shutdown();
        manager.shutdown();
        assert!(manager.is_shutdown());
    }

    #[test]
    fn test_child_token_observes_shutdown() {
        let manager = ShutdownManager::new();
        let token = manager.token();
        assert!(!token.is_cancelled());

        manager.shutdown();
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn test_join_with_timeout_quick_task() {
        let handle = tokio::spawn(async {});
        join_with_timeout(handle, Duration::from_secs(1), "quick").await;
    }

    #[tokio::test]
    async fn test_join_with_timeout_hanging_task_returns() {
        let handle = tokio::spawn(async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        });

        let start = std::time::Instant::now();
        join_with_timeout(handle, Duration::from_millis(50), "hanging").await;
        assert!(start.elapsed() < Duration::from_secs(5));
    }
}
