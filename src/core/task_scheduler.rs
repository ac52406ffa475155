//! 工具并发池
//!
//! 所有会话共享一个 Semaphore，限制同时在途的外部工具调用数；单轮内的调用再按调用数自然封顶。

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::core::ChatError;

/// 工具执行许可池
#[derive(Debug, Clone)]
pub struct TaskScheduler {
    tool_semaphore: Arc<Semaphore>,
    capacity: usize,
}

impl TaskScheduler {
    pub fn new(max_concurrent_tools: usize) -> Self {
        let capacity = max_concurrent_tools.max(1);
        Self {
            tool_semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// 获取工具执行许可；池被关闭时返回 Internal
    pub async fn acquire_tool(&self) -> Result<OwnedSemaphorePermit, ChatError> {
        self.tool_semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| ChatError::Internal("tool pool closed".to_string()))
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// 当前空闲许可数
    pub fn available(&self) -> usize {
        self.tool_semaphore.available_permits()
    }
}

impl Default for TaskScheduler {
    fn default() -> Self {
        Self::new(4)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_permits_are_bounded_and_returned() {
        let sched = TaskScheduler::new(2);
        let a = sched.acquire_tool().await.unwrap();
        let _b = sched.acquire_tool().await.unwrap();
        assert_eq!(sched.available(), 0);
        drop(a);
        assert_eq!(sched.available(), 1);
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        assert_eq!(TaskScheduler::new(0).capacity(), 1);
    }
}
