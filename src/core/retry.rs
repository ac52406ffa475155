//! 重试 / 退避引擎
//!
//! run(policy, operation, classify)：按 min(max_delay, base_delay × 2^k) + [0, delay) 抖动退避，
//! 直到成功、遇到 Fatal 分类或次数耗尽。工具分发、模型调用与归档写入共用。

use std::fmt;
use std::future::Future;
use std::time::Duration;

use rand::Rng;

/// 错误分类：Transient 可重试，Fatal 立即返回
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Transient,
    Fatal,
}

/// 重试预算与退避参数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// 最多尝试次数（含首次），至少为 1
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
        }
    }

    /// 测试与本地场景：不等待
    pub fn immediate(max_attempts: u32) -> Self {
        Self::new(max_attempts, Duration::ZERO, Duration::ZERO)
    }

    /// 第 attempt 次（0 起）失败后的基础等待，不含抖动
    pub fn base_delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// 基础等待 + [0, delay) 均匀抖动
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let delay = self.base_delay_for(attempt);
        let millis = delay.as_millis() as u64;
        if millis == 0 {
            return delay;
        }
        let jitter = rand::thread_rng().gen_range(0..millis);
        delay + Duration::from_millis(jitter)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(200), Duration::from_secs(5))
    }
}

/// 成功结果与实际尝试次数
#[derive(Debug, Clone, PartialEq)]
pub struct Attempted<T> {
    pub value: T,
    pub attempts: u32,
}

/// 失败：最后一次错误、尝试次数以及最后错误的分类
#[derive(Debug)]
pub struct RetryError<E> {
    pub error: E,
    pub attempts: u32,
    pub class: ErrorClass,
}

impl<E> RetryError<E> {
    /// 是否因 Transient 错误耗尽预算（而非 Fatal 直接返回）
    pub fn exhausted(&self) -> bool {
        self.class == ErrorClass::Transient
    }
}

impl<E: fmt::Display> fmt::Display for RetryError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (after {} attempt(s))", self.error, self.attempts)
    }
}

impl<E: fmt::Debug + fmt::Display> std::error::Error for RetryError<E> {}

/// 执行 operation，Transient 错误按策略退避重试；最后一次失败后不再等待
pub async fn run<T, E, F, Fut, C>(
    policy: &RetryPolicy,
    mut operation: F,
    classify: C,
) -> Result<Attempted<T>, RetryError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    C: Fn(&E) -> ErrorClass,
    E: fmt::Display,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0u32;
    loop {
        match operation(attempt).await {
            Ok(value) => {
                return Ok(Attempted {
                    value,
                    attempts: attempt + 1,
                })
            }
            Err(error) => {
                let class = classify(&error);
                let attempts = attempt + 1;
                if class == ErrorClass::Fatal || attempts >= max_attempts {
                    return Err(RetryError {
                        error,
                        attempts,
                        class,
                    });
                }
                let delay = policy.delay_for(attempt);
                tracing::debug!(attempt = attempts, delay_ms = delay.as_millis() as u64, error = %error, "retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug)]
    enum TestError {
        Flaky,
        Broken,
    }

    impl fmt::Display for TestError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{:?}", self)
        }
    }

    fn classify(e: &TestError) -> ErrorClass {
        match e {
            TestError::Flaky => ErrorClass::Transient,
            TestError::Broken => ErrorClass::Fatal,
        }
    }

    #[tokio::test]
    async fn test_transient_then_success_counts_attempts() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::immediate(5);
        let result = run(
            &policy,
            |_| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(TestError::Flaky)
                    } else {
                        Ok("done")
                    }
                }
            },
            classify,
        )
        .await
        .unwrap();
        assert_eq!(result.value, "done");
        assert_eq!(result.attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhaustion_makes_exactly_max_attempts() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::immediate(3);
        let err = run(
            &policy,
            |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(TestError::Flaky) }
            },
            classify,
        )
        .await
        .unwrap_err();
        assert_eq!(err.attempts, 3);
        assert!(err.exhausted());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_fatal_returns_immediately() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::immediate(4);
        let err = run(
            &policy,
            |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(TestError::Broken) }
            },
            classify,
        )
        .await
        .unwrap_err();
        assert_eq!(err.attempts, 1);
        assert!(!err.exhausted());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy::new(5, Duration::from_millis(100), Duration::from_millis(350));
        assert_eq!(policy.base_delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.base_delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.base_delay_for(2), Duration::from_millis(350));
        assert_eq!(policy.base_delay_for(40), Duration::from_millis(350));
    }

    #[test]
    fn test_jitter_stays_below_twice_the_delay() {
        let policy = RetryPolicy::new(5, Duration::from_millis(50), Duration::from_secs(1));
        for attempt in 0..4 {
            let base = policy.base_delay_for(attempt);
            let d = policy.delay_for(attempt);
            assert!(d >= base);
            assert!(d < base * 2);
        }
    }
}
