//! 工具分发器
//!
//! 对一轮内的调用列表：先按注册表校验，再经重试引擎调用外部执行服务（每次尝试单独超时），
//! 多个调用并发执行但结果顺序与调用顺序一致；单个失败只影响自己的 ToolResult。
//! 每次调用输出结构化审计日志（JSON）。

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::join_all;
use tokio::time::timeout;

use crate::core::retry::{self, RetryPolicy};
use crate::core::TaskScheduler;
use crate::tools::{
    ExecutorError, ShopOutput, ToolExecutor, ToolInvocation, ToolRegistry, ToolRequest,
    ToolResult, ToolStatus,
};

const ARGS_PREVIEW_CHARS: usize = 200;

pub struct ToolDispatcher {
    registry: Arc<ToolRegistry>,
    executor: Arc<dyn ToolExecutor>,
    scheduler: TaskScheduler,
    retry: RetryPolicy,
    attempt_timeout: Duration,
}

impl ToolDispatcher {
    pub fn new(registry: Arc<ToolRegistry>, executor: Arc<dyn ToolExecutor>) -> Self {
        Self {
            registry,
            executor,
            scheduler: TaskScheduler::default(),
            retry: RetryPolicy::default(),
            attempt_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// 单次尝试的超时；超时按 Transient 处理
    pub fn with_attempt_timeout(mut self, attempt_timeout: Duration) -> Self {
        self.attempt_timeout = attempt_timeout;
        self
    }

    /// 与其他会话共享的工具并发池
    pub fn with_scheduler(mut self, scheduler: TaskScheduler) -> Self {
        self.scheduler = scheduler;
        self
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    /// 分发一轮调用；返回顺序与 invocations 相同
    pub async fn dispatch(&self, invocations: &[ToolInvocation]) -> Vec<ToolResult> {
        join_all(invocations.iter().map(|inv| self.dispatch_one(inv))).await
    }

    async fn dispatch_one(&self, invocation: &ToolInvocation) -> ToolResult {
        let start = Instant::now();

        if let Err(e) = self.registry.validate(invocation) {
            let result = ToolResult {
                invocation_id: invocation.id.clone(),
                tool_name: invocation.name.clone(),
                arguments: invocation.arguments.clone(),
                status: ToolStatus::Error,
                duration_ms: 0,
                attempts: 0,
                payload: serde_json::json!({ "error": "validation", "message": e.to_string() }),
            };
            audit(&result);
            return result;
        }

        let _permit = match self.scheduler.acquire_tool().await {
            Ok(p) => Some(p),
            Err(e) => {
                tracing::warn!(error = %e, "running tool without a pool permit");
                None
            }
        };

        let request = ToolRequest::from(invocation);
        let request = &request;
        let executor = self.executor.as_ref();
        let attempt_timeout = self.attempt_timeout;
        let outcome = retry::run(
            &self.retry,
            move |_attempt| async move {
                match timeout(attempt_timeout, executor.execute(request)).await {
                    Ok(r) => r,
                    Err(_) => Err(ExecutorError::Timeout),
                }
            },
            ExecutorError::classify,
        )
        .await;

        let duration_ms = start.elapsed().as_millis() as u64;
        let result = match outcome {
            Ok(done) => ToolResult {
                invocation_id: invocation.id.clone(),
                tool_name: invocation.name.clone(),
                arguments: invocation.arguments.clone(),
                status: ToolStatus::Success,
                duration_ms,
                attempts: done.attempts,
                payload: ShopOutput::decode(&invocation.name, done.value).to_value(),
            },
            Err(err) => {
                let status = if err.exhausted() && err.error == ExecutorError::Timeout {
                    ToolStatus::Timeout
                } else {
                    ToolStatus::Error
                };
                ToolResult {
                    invocation_id: invocation.id.clone(),
                    tool_name: invocation.name.clone(),
                    arguments: invocation.arguments.clone(),
                    status,
                    duration_ms,
                    attempts: err.attempts,
                    payload: err.error.to_payload(),
                }
            }
        };
        audit(&result);
        result
    }
}

fn audit(result: &ToolResult) {
    let audit = serde_json::json!({
        "event": "tool_audit",
        "tool": result.tool_name,
        "call_id": result.invocation_id,
        "outcome": result.status.as_str(),
        "attempts": result.attempts,
        "duration_ms": result.duration_ms,
        "args_preview": args_preview(&result.arguments),
    });
    tracing::info!(audit = %audit.to_string(), "tool");
}

fn args_preview(args: &serde_json::Value) -> String {
    let s = args.to_string();
    if s.chars().count() > ARGS_PREVIEW_CHARS {
        format!("{}...", s.chars().take(ARGS_PREVIEW_CHARS).collect::<String>())
    } else {
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::shop::{shop_registry, GET_CART, SEARCH_CATALOG, UPDATE_CART};
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// 按工具名脚本化：先返回 failures 次错误，再成功；可选延迟
    #[derive(Default)]
    struct FakeExecutor {
        failures: HashMap<String, (u32, ExecutorError)>,
        delays: HashMap<String, Duration>,
        calls: Mutex<HashMap<String, u32>>,
        completed: Mutex<Vec<String>>,
    }

    impl FakeExecutor {
        fn fail(mut self, tool: &str, times: u32, err: ExecutorError) -> Self {
            self.failures.insert(tool.to_string(), (times, err));
            self
        }

        fn delay(mut self, tool: &str, d: Duration) -> Self {
            self.delays.insert(tool.to_string(), d);
            self
        }

        fn calls(&self, tool: &str) -> u32 {
            self.calls.lock().unwrap().get(tool).copied().unwrap_or(0)
        }
    }

    #[async_trait]
    impl ToolExecutor for FakeExecutor {
        async fn execute(&self, request: &ToolRequest) -> Result<Value, ExecutorError> {
            let n = {
                let mut calls = self.calls.lock().unwrap();
                let c = calls.entry(request.tool.clone()).or_insert(0);
                *c += 1;
                *c
            };
            if let Some(d) = self.delays.get(&request.tool) {
                tokio::time::sleep(*d).await;
            }
            self.completed.lock().unwrap().push(request.tool.clone());
            if let Some((times, err)) = self.failures.get(&request.tool) {
                if n <= *times {
                    return Err(err.clone());
                }
            }
            Ok(json!({ "tool": request.tool, "call": n }))
        }
    }

    fn dispatcher(exec: Arc<FakeExecutor>, attempts: u32) -> ToolDispatcher {
        ToolDispatcher::new(Arc::new(shop_registry()), exec).with_retry(RetryPolicy::immediate(attempts))
    }

    #[tokio::test]
    async fn test_timeouts_then_success_on_third_attempt() {
        let exec = Arc::new(FakeExecutor::default().fail(UPDATE_CART, 2, ExecutorError::Timeout));
        let d = dispatcher(exec.clone(), 3);
        let inv = ToolInvocation::new(UPDATE_CART, json!({"lines": [{"merchandise_id": "v1", "quantity": 1}]}));
        let results = d.dispatch(&[inv.clone()]).await;
        assert_eq!(results[0].status, ToolStatus::Success);
        assert_eq!(results[0].attempts, 3);
        assert_eq!(results[0].invocation_id, inv.id);
        assert_eq!(exec.calls(UPDATE_CART), 3);
    }

    #[tokio::test]
    async fn test_persistent_timeout_stops_at_max_attempts() {
        let exec = Arc::new(FakeExecutor::default().fail(SEARCH_CATALOG, 5, ExecutorError::Timeout));
        let d = dispatcher(exec.clone(), 3);
        let inv = ToolInvocation::new(SEARCH_CATALOG, json!({"query": "mug"}));
        let results = d.dispatch(&[inv]).await;
        assert_eq!(results[0].status, ToolStatus::Timeout);
        assert_eq!(results[0].attempts, 3);
        assert_eq!(exec.calls(SEARCH_CATALOG), 3);
    }

    #[tokio::test]
    async fn test_attempt_timeout_is_transient() {
        let exec = Arc::new(FakeExecutor::default().delay(GET_CART, Duration::from_millis(200)));
        let d = dispatcher(exec.clone(), 2).with_attempt_timeout(Duration::from_millis(10));
        let results = d.dispatch(&[ToolInvocation::new(GET_CART, json!({}))]).await;
        assert_eq!(results[0].status, ToolStatus::Timeout);
        assert_eq!(results[0].attempts, 2);
    }

    #[tokio::test]
    async fn test_results_keep_invocation_order() {
        let exec = Arc::new(FakeExecutor::default().delay(GET_CART, Duration::from_millis(50)));
        let d = dispatcher(exec.clone(), 1);
        let invs = vec![
            ToolInvocation::new(GET_CART, json!({})),
            ToolInvocation::new(SEARCH_CATALOG, json!({"query": "mug"})),
        ];
        let results = d.dispatch(&invs).await;
        assert_eq!(
            exec.completed.lock().unwrap().clone(),
            vec![SEARCH_CATALOG.to_string(), GET_CART.to_string()]
        );
        assert_eq!(results[0].invocation_id, invs[0].id);
        assert_eq!(results[1].invocation_id, invs[1].id);
        assert!(results.iter().all(|r| r.is_success()));
    }

    #[tokio::test]
    async fn test_validation_failure_is_isolated_and_not_retried() {
        let exec = Arc::new(FakeExecutor::default());
        let d = dispatcher(exec.clone(), 3);
        let invs = vec![
            ToolInvocation::new("drop_tables", json!({})),
            ToolInvocation::new(UPDATE_CART, json!({})),
            ToolInvocation::new(GET_CART, json!({})),
        ];
        let results = d.dispatch(&invs).await;
        assert_eq!(results[0].status, ToolStatus::Error);
        assert_eq!(results[0].attempts, 0);
        assert_eq!(results[0].payload["error"], "validation");
        assert_eq!(results[1].status, ToolStatus::Error);
        assert_eq!(results[2].status, ToolStatus::Success);
        assert_eq!(exec.calls("drop_tables"), 0);
        assert_eq!(exec.calls(UPDATE_CART), 0);
    }

    #[tokio::test]
    async fn test_fatal_service_error_not_retried() {
        let err = ExecutorError::Rejected { status: 422, message: "bad line".into() };
        let exec = Arc::new(FakeExecutor::default().fail(UPDATE_CART, 5, err));
        let d = dispatcher(exec.clone(), 3);
        let inv = ToolInvocation::new(UPDATE_CART, json!({"lines": []}));
        let results = d.dispatch(&[inv]).await;
        assert_eq!(results[0].status, ToolStatus::Error);
        assert_eq!(results[0].attempts, 1);
        assert_eq!(results[0].payload["error"], "rejected");
    }

    #[tokio::test]
    async fn test_exhausted_server_error_reports_error_status() {
        let err = ExecutorError::Server { status: 502, message: "bad gateway".into() };
        let exec = Arc::new(FakeExecutor::default().fail(GET_CART, 9, err));
        let d = dispatcher(exec.clone(), 2);
        let results = d.dispatch(&[ToolInvocation::new(GET_CART, json!({}))]).await;
        assert_eq!(results[0].status, ToolStatus::Error);
        assert_eq!(results[0].attempts, 2);
    }

    #[tokio::test]
    async fn test_pool_bounds_concurrency() {
        let exec = Arc::new(FakeExecutor::default().delay(GET_CART, Duration::from_millis(20)));
        let d = dispatcher(exec, 1).with_scheduler(TaskScheduler::new(1));
        let invs: Vec<_> = (0..3).map(|_| ToolInvocation::new(GET_CART, json!({}))).collect();
        let start = Instant::now();
        let results = d.dispatch(&invs).await;
        assert_eq!(results.len(), 3);
        assert!(start.elapsed() >= Duration::from_millis(60));
    }
}
