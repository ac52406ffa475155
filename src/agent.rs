//! Headless 聊天服务
//!
//! 供 REPL、HTTP API 等前端调用的无界面逻辑：AgentComponentsBuilder 组装 Planner / ToolDispatcher，
//! ChatService 管理会话注册表、单轮执行（后台任务 + 取消令牌）、关闭与归档。

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::archive::{ArchiveMetricsSnapshot, ArchiveRecord, SessionArchiver, SqliteArchiveStore};
use crate::config::AppConfig;
use crate::core::{ChatError, RetryPolicy, TaskScheduler};
use crate::llm::{LlmClient, MockLlmClient, OpenAiClient};
use crate::react::parser::DEFAULT_MAX_BLOCK_CHARS;
use crate::react::{
    run_turn, Planner, TurnContext, TurnEvent, TurnOutcome, DEFAULT_MAX_TOOL_ROUNDS,
    DEFAULT_SYSTEM_PROMPT,
};
use crate::session::{SessionRegistry, TranscriptMessage};
use crate::tools::{shop_registry, HttpToolExecutor, ToolDispatcher, ToolExecutor, ToolRegistry};

/// 预构建的组件，多会话共享
pub struct AgentComponents {
    pub planner: Planner,
    pub dispatcher: ToolDispatcher,
    pub max_tool_rounds: usize,
    pub max_block_chars: usize,
}

/// AgentComponents 构建器；模型客户端与工具执行服务必须注入
pub struct AgentComponentsBuilder {
    llm: Option<Arc<dyn LlmClient>>,
    executor: Option<Arc<dyn ToolExecutor>>,
    registry: Option<ToolRegistry>,
    system_prompt: String,
    llm_retry: RetryPolicy,
    request_timeout: Duration,
    tool_retry: RetryPolicy,
    attempt_timeout: Duration,
    max_concurrency: usize,
    max_tool_rounds: usize,
    max_block_chars: usize,
}

impl Default for AgentComponentsBuilder {
    fn default() -> Self {
        Self {
            llm: None,
            executor: None,
            registry: None,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            llm_retry: RetryPolicy::default(),
            request_timeout: Duration::from_secs(60),
            tool_retry: RetryPolicy::default(),
            attempt_timeout: Duration::from_secs(10),
            max_concurrency: 4,
            max_tool_rounds: DEFAULT_MAX_TOOL_ROUNDS,
            max_block_chars: DEFAULT_MAX_BLOCK_CHARS,
        }
    }
}

impl AgentComponentsBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// 按配置选择 LLM 后端与工具执行服务
    pub fn from_config(cfg: &AppConfig) -> Result<Self, ChatError> {
        let llm: Arc<dyn LlmClient> = match cfg.llm.provider.as_str() {
            "openai" => Arc::new(OpenAiClient::new(
                cfg.llm.base_url.as_deref(),
                &cfg.llm.model,
                None,
            )),
            "mock" => Arc::new(MockLlmClient::new()),
            other => {
                return Err(ChatError::ConfigError(format!(
                    "unknown llm provider: {other}"
                )))
            }
        };
        let attempt_timeout = Duration::from_millis(cfg.tools.attempt_timeout_ms);

        let mut builder = Self::new()
            .with_llm(llm)
            .with_llm_retry(cfg.llm.retry.to_policy())
            .with_request_timeout(Duration::from_secs(cfg.llm.timeouts.request))
            .with_tool_retry(cfg.tools.retry.to_policy())
            .with_attempt_timeout(attempt_timeout)
            .with_max_concurrency(cfg.tools.max_concurrency)
            .with_max_tool_rounds(cfg.conversation.max_tool_rounds)
            .with_max_block_chars(cfg.tools.max_block_chars);
        if let Some(prompt) = cfg.system_prompt() {
            builder = builder.with_system_prompt(prompt);
        }
        if let Some(endpoint) = &cfg.tools.endpoint {
            let executor = HttpToolExecutor::new(endpoint.clone(), attempt_timeout)
                .map_err(|e| ChatError::ConfigError(format!("tool executor: {e}")))?;
            builder = builder.with_executor(Arc::new(executor));
        }
        Ok(builder)
    }

    pub fn with_llm(mut self, llm: Arc<dyn LlmClient>) -> Self {
        self.llm = Some(llm);
        self
    }

    pub fn with_executor(mut self, executor: Arc<dyn ToolExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// 默认是店铺工具集
    pub fn with_registry(mut self, registry: ToolRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    pub fn with_llm_retry(mut self, retry: RetryPolicy) -> Self {
        self.llm_retry = retry;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_tool_retry(mut self, retry: RetryPolicy) -> Self {
        self.tool_retry = retry;
        self
    }

    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    pub fn with_max_concurrency(mut self, n: usize) -> Self {
        self.max_concurrency = n;
        self
    }

    pub fn with_max_tool_rounds(mut self, n: usize) -> Self {
        self.max_tool_rounds = n;
        self
    }

    pub fn with_max_block_chars(mut self, n: usize) -> Self {
        self.max_block_chars = n;
        self
    }

    pub fn build(self) -> Result<AgentComponents, ChatError> {
        let llm = self.llm.ok_or(ChatError::MissingCapability("llm client"))?;
        let executor = self
            .executor
            .ok_or(ChatError::MissingCapability("tool executor"))?;
        let registry = Arc::new(self.registry.unwrap_or_else(shop_registry));

        let planner = Planner::new(llm, self.system_prompt)
            .with_retry(self.llm_retry)
            .with_request_timeout(self.request_timeout);
        let dispatcher = ToolDispatcher::new(registry, executor)
            .with_retry(self.tool_retry)
            .with_attempt_timeout(self.attempt_timeout)
            .with_scheduler(TaskScheduler::new(self.max_concurrency));

        Ok(AgentComponents {
            planner,
            dispatcher,
            max_tool_rounds: self.max_tool_rounds,
            max_block_chars: self.max_block_chars,
        })
    }
}

/// 入站消息：{session_id, user_message}；customer_id / cart_id 只在首条消息时生效
#[derive(Debug, Clone, Deserialize)]
pub struct ChatRequest {
    pub session_id: String,
    #[serde(alias = "message")]
    pub user_message: String,
    #[serde(default)]
    pub customer_id: Option<String>,
    #[serde(default)]
    pub cart_id: Option<String>,
}

impl ChatRequest {
    pub fn new(session_id: impl Into<String>, user_message: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            user_message: user_message.into(),
            customer_id: None,
            cart_id: None,
        }
    }
}

pub struct ChatService {
    components: Arc<AgentComponents>,
    sessions: Arc<SessionRegistry>,
    archiver: Arc<SessionArchiver>,
    /// 每个会话一个父令牌，每轮用其子令牌
    cancel_tokens: Mutex<HashMap<String, CancellationToken>>,
    shutdown: CancellationToken,
    idle_timeout: chrono::Duration,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl ChatService {
    pub fn new(
        components: AgentComponents,
        archiver: Arc<SessionArchiver>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            components: Arc::new(components),
            sessions: Arc::new(SessionRegistry::new()),
            archiver,
            cancel_tokens: Mutex::new(HashMap::new()),
            shutdown,
            idle_timeout: chrono::Duration::minutes(30),
            workers: Mutex::new(Vec::new()),
        }
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout =
            chrono::Duration::from_std(idle_timeout).unwrap_or_else(|_| chrono::Duration::minutes(30));
        self
    }

    /// 按配置构建并启动后台任务（归档 worker、归档确认监听、空闲会话维护）
    pub async fn from_config(
        cfg: &AppConfig,
        shutdown: CancellationToken,
    ) -> Result<Arc<Self>, ChatError> {
        let components = AgentComponentsBuilder::from_config(cfg)?.build()?;
        let store = SqliteArchiveStore::connect(&cfg.archive.database_url)
            .await
            .map_err(|e| ChatError::ConfigError(format!("archive database: {e}")))?;

        let (archived_tx, archived_rx) = mpsc::unbounded_channel();
        let archiver = Arc::new(
            SessionArchiver::new(Arc::new(store), cfg.archive.queue_capacity)
                .with_retry(cfg.archive.retry.to_policy())
                .with_archived_notifier(archived_tx),
        );
        let service = Arc::new(
            Self::new(components, archiver.clone(), shutdown.clone()).with_idle_timeout(
                Duration::from_secs(cfg.conversation.session_idle_timeout_secs),
            ),
        );

        let flush = Duration::from_secs(cfg.archive.flush_interval_secs.max(1));
        let maintenance = Duration::from_secs(cfg.conversation.maintenance_interval_secs.max(1));
        let handles = vec![
            archiver.spawn(flush, shutdown),
            service.spawn_archived_listener(archived_rx),
            service.spawn_maintenance(maintenance),
        ];
        service.track(handles);
        tracing::info!(
            model = service.components.planner.model_name(),
            tools = service.components.dispatcher.registry().len(),
            "chat service started"
        );
        Ok(service)
    }

    fn track(&self, handles: Vec<JoinHandle<()>>) {
        self.workers
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .extend(handles);
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    pub fn archiver(&self) -> &SessionArchiver {
        &self.archiver
    }

    pub fn archive_metrics(&self) -> ArchiveMetricsSnapshot {
        self.archiver.metrics()
    }

    fn turn_token(&self, session_id: &str) -> CancellationToken {
        let mut tokens = self.cancel_tokens.lock().unwrap_or_else(|p| p.into_inner());
        tokens
            .entry(session_id.to_string())
            .or_insert_with(|| self.shutdown.child_token())
            .child_token()
    }

    pub async fn start_turn(&self, request: ChatRequest) -> Result<TurnOutcome, ChatError> {
        self.run(request, None).await
    }

    /// 同 start_turn，过程事件推送到 events
    pub async fn start_turn_with_events(
        &self,
        request: ChatRequest,
        events: UnboundedSender<TurnEvent>,
    ) -> Result<TurnOutcome, ChatError> {
        self.run(request, Some(events)).await
    }

    /// 在后台任务里跑一轮；调用方的 future 被丢弃时取消令牌，已派发的工具仍会完成并写入日志
    async fn run(
        &self,
        request: ChatRequest,
        events: Option<UnboundedSender<TurnEvent>>,
    ) -> Result<TurnOutcome, ChatError> {
        let session = self
            .sessions
            .open(&request.session_id, request.customer_id, request.cart_id)
            .await?;
        let token = self.turn_token(&request.session_id);
        let guard = token.clone().drop_guard();

        let components = Arc::clone(&self.components);
        let archiver = Arc::clone(&self.archiver);
        let message = request.user_message;
        let handle = tokio::spawn(async move {
            let mut session = session.lock_owned().await;
            let mut ctx = TurnContext::new(&components.planner, &components.dispatcher, token)
                .with_max_tool_rounds(components.max_tool_rounds)
                .with_max_block_chars(components.max_block_chars);
            if let Some(tx) = &events {
                ctx = ctx.with_event_tx(tx);
            }
            let result = run_turn(&ctx, &mut session, &message).await;
            archiver.enqueue(ArchiveRecord::from_session(&session));
            result
        });

        let result = handle
            .await
            .map_err(|e| ChatError::Internal(format!("turn task failed: {e}")))?;
        guard.disarm();
        result
    }

    pub async fn transcript(&self, session_id: &str) -> Result<Vec<TranscriptMessage>, ChatError> {
        let session = self
            .sessions
            .get(session_id)
            .await
            .ok_or_else(|| ChatError::SessionNotFound(session_id.to_string()))?;
        let transcript = session.lock().await.transcript();
        Ok(transcript)
    }

    /// 取消该会话进行中与排队中的轮次
    pub fn cancel(&self, session_id: &str) -> bool {
        let token = self
            .cancel_tokens
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(session_id);
        match token {
            Some(t) => {
                t.cancel();
                tracing::info!(session_id, "turn cancelled by request");
                true
            }
            None => false,
        }
    }

    /// 关闭会话并入队最后一份快照
    pub async fn close_session(&self, session_id: &str) -> Result<(), ChatError> {
        let session = self.sessions.close(session_id).await?;
        let record = ArchiveRecord::from_session(&*session.lock().await);
        self.archiver.enqueue(record);
        self.cancel_tokens
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(session_id);
        Ok(())
    }

    /// 关闭空闲会话；返回关闭数量
    pub async fn close_idle(&self) -> usize {
        let mut closed = 0;
        for id in self.sessions.idle_sessions(self.idle_timeout).await {
            match self.close_session(&id).await {
                Ok(()) => {
                    tracing::info!(session_id = %id, "closed idle session");
                    closed += 1;
                }
                Err(e) => tracing::warn!(session_id = %id, error = %e, "failed to close idle session"),
            }
        }
        closed
    }

    fn spawn_maintenance(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = service.shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        service.close_idle().await;
                        service.sessions.evict_archived().await;
                    }
                }
            }
        })
    }

    fn spawn_archived_listener(self: &Arc<Self>, mut rx: UnboundedReceiver<String>) -> JoinHandle<()> {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let id = tokio::select! {
                    _ = service.shutdown.cancelled() => break,
                    id = rx.recv() => match id {
                        Some(id) => id,
                        None => break,
                    },
                };
                service.confirm_archived(&id).await;
            }
        })
    }

    /// 归档确认：标记 Archived 并从注册表移除
    pub async fn confirm_archived(&self, session_id: &str) {
        if self.sessions.mark_archived(session_id).await {
            tracing::info!(session_id, "session archived");
            self.sessions.evict_archived().await;
        }
    }

    /// 触发关闭并等待后台任务结束（归档 worker 会先排空队列）
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handles: Vec<JoinHandle<()>> = self
            .workers
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .drain(..)
            .collect();
        for h in handles {
            if let Err(e) = h.await {
                tracing::warn!(error = %e, "background task ended abnormally");
            }
        }
        // worker 退出后才入队的快照
        if self.archiver.pending() > 0 {
            if let Err(e) = self.archiver.drain().await {
                tracing::error!(error = %e, "final archive drain failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::{ArchiveError, ArchiveStore};
    use crate::tools::{ExecutorError, ToolRequest};
    use async_trait::async_trait;
    use serde_json::{json, Value};

    struct StaticExecutor;

    #[async_trait]
    impl ToolExecutor for StaticExecutor {
        async fn execute(&self, _request: &ToolRequest) -> Result<Value, ExecutorError> {
            Ok(json!({"id": "cart_1", "lines": []}))
        }
    }

    struct NullStore;

    #[async_trait]
    impl ArchiveStore for NullStore {
        async fn write(&self, _record: &ArchiveRecord) -> Result<(), ArchiveError> {
            Ok(())
        }
    }

    fn service(mock: MockLlmClient) -> ChatService {
        let components = AgentComponentsBuilder::new()
            .with_llm(Arc::new(mock))
            .with_executor(Arc::new(StaticExecutor))
            .with_llm_retry(RetryPolicy::immediate(1))
            .build()
            .unwrap();
        let archiver = Arc::new(SessionArchiver::new(Arc::new(NullStore), 8));
        ChatService::new(components, archiver, CancellationToken::new())
    }

    #[test]
    fn test_build_requires_capabilities() {
        let err = AgentComponentsBuilder::new()
            .with_executor(Arc::new(StaticExecutor))
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, ChatError::MissingCapability("llm client")));

        let err = AgentComponentsBuilder::new()
            .with_llm(Arc::new(MockLlmClient::new()))
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, ChatError::MissingCapability("tool executor")));
    }

    #[test]
    fn test_from_config_without_endpoint_fails_at_build() {
        let cfg = AppConfig::default();
        let err = AgentComponentsBuilder::from_config(&cfg)
            .unwrap()
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, ChatError::MissingCapability(_)));
    }

    #[test]
    fn test_unknown_provider_is_config_error() {
        let mut cfg = AppConfig::default();
        cfg.llm.provider = "nope".into();
        assert!(matches!(
            AgentComponentsBuilder::from_config(&cfg),
            Err(ChatError::ConfigError(_))
        ));
    }

    #[tokio::test]
    async fn test_turn_enqueues_snapshot_and_close_blocks_reopen() {
        let svc = service(MockLlmClient::scripted(["Hello there."]));
        let out = svc.start_turn(ChatRequest::new("s1", "hi")).await.unwrap();
        assert_eq!(out.reply, "Hello there.");
        assert_eq!(svc.archiver().pending(), 1);

        let transcript = svc.transcript("s1").await.unwrap();
        assert_eq!(transcript.len(), 2);

        svc.close_session("s1").await.unwrap();
        assert_eq!(svc.archiver().pending(), 1);
        assert!(matches!(
            svc.start_turn(ChatRequest::new("s1", "again")).await,
            Err(ChatError::SessionClosed(_))
        ));

        svc.archiver().flush().await;
        svc.confirm_archived("s1").await;
        assert!(svc.sessions().get("s1").await.is_none());
        assert!(matches!(
            svc.transcript("s1").await,
            Err(ChatError::SessionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_cancel_without_turn_returns_false() {
        let svc = service(MockLlmClient::new());
        assert!(!svc.cancel("nobody"));
        svc.start_turn(ChatRequest::new("s1", "hi")).await.unwrap();
        assert!(svc.cancel("s1"));
        // 新令牌，后续轮次不受影响
        let out = svc.start_turn(ChatRequest::new("s1", "again")).await.unwrap();
        assert_eq!(out.reply, "Echo from Mock: again");
    }

    #[tokio::test]
    async fn test_concurrent_turns_keep_their_own_usage() {
        let svc = service(MockLlmClient::new().with_latency(Duration::from_millis(50)));
        let (a, b) = tokio::join!(
            svc.start_turn(ChatRequest::new("slow", "first session here")),
            svc.start_turn(ChatRequest::new("fast", "hi")),
        );
        let (a, b) = (a.unwrap(), b.unwrap());

        // 每轮一次模型调用：各自 10 个 prompt token，completion 为各自回显的词数
        let ua = a.usage.unwrap();
        let ub = b.usage.unwrap();
        assert_eq!(ua.prompt_tokens, 10);
        assert_eq!(ua.completion_tokens, 6);
        assert_eq!(ub.prompt_tokens, 10);
        assert_eq!(ub.completion_tokens, 4);
    }
}
