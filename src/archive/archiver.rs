//! 后台归档器
//!
//! 有界队列：同一会话已有待写快照时用新快照原地替换；队列满时丢弃最旧的一份并计数。
//! 写入经 RetryPolicy 重试；瞬时错误耗尽后重新入队等下一次 flush，致命错误丢弃并计数。

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::archive::{ArchiveError, ArchiveRecord, ArchiveStore};
use crate::core::retry::{self, RetryError, RetryPolicy};
use crate::core::ErrorClass;

pub const DEFAULT_QUEUE_CAPACITY: usize = 64;

#[derive(Debug, Default)]
pub struct ArchiveMetrics {
    archived: AtomicU64,
    dropped: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ArchiveMetricsSnapshot {
    /// 成功写入的快照数
    pub archived: u64,
    /// 队列满被挤掉的快照数
    pub dropped: u64,
    /// 致命错误丢弃的快照数
    pub failed: u64,
    /// 重试次数（不含首次尝试）
    pub retried: u64,
    pub pending: usize,
}

pub struct SessionArchiver {
    store: Arc<dyn ArchiveStore>,
    queue: Mutex<VecDeque<ArchiveRecord>>,
    capacity: usize,
    retry: RetryPolicy,
    write_timeout: Duration,
    notify: Notify,
    metrics: ArchiveMetrics,
    /// 已关闭会话的最后一份快照写入后上报其 ID
    archived_tx: Option<UnboundedSender<String>>,
}

impl SessionArchiver {
    pub fn new(store: Arc<dyn ArchiveStore>, capacity: usize) -> Self {
        Self {
            store,
            queue: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
            retry: RetryPolicy::default(),
            write_timeout: Duration::from_secs(10),
            notify: Notify::new(),
            metrics: ArchiveMetrics::default(),
            archived_tx: None,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_write_timeout(mut self, write_timeout: Duration) -> Self {
        self.write_timeout = write_timeout;
        self
    }

    pub fn with_archived_notifier(mut self, tx: UnboundedSender<String>) -> Self {
        self.archived_tx = Some(tx);
        self
    }

    fn queue(&self) -> MutexGuard<'_, VecDeque<ArchiveRecord>> {
        // 中毒时直接取回数据
        self.queue.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// 非阻塞入队
    pub fn enqueue(&self, record: ArchiveRecord) {
        {
            let mut queue = self.queue();
            if let Some(slot) = queue
                .iter_mut()
                .find(|r| r.session_id == record.session_id)
            {
                *slot = record;
            } else {
                if queue.len() >= self.capacity {
                    if let Some(old) = queue.pop_front() {
                        self.metrics.dropped.fetch_add(1, Ordering::Relaxed);
                        tracing::warn!(session_id = %old.session_id, "archive queue full, dropped oldest snapshot");
                    }
                }
                queue.push_back(record);
            }
        }
        self.notify.notify_one();
    }

    /// 写失败的快照放回队列；期间已有更新的快照则放弃旧的
    fn requeue(&self, record: ArchiveRecord) {
        let mut queue = self.queue();
        if queue.iter().any(|r| r.session_id == record.session_id) {
            return;
        }
        if queue.len() >= self.capacity {
            self.metrics.dropped.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(session_id = %record.session_id, "archive queue full, dropped retry snapshot");
            return;
        }
        queue.push_back(record);
    }

    pub fn pending(&self) -> usize {
        self.queue().len()
    }

    pub fn metrics(&self) -> ArchiveMetricsSnapshot {
        ArchiveMetricsSnapshot {
            archived: self.metrics.archived.load(Ordering::Relaxed),
            dropped: self.metrics.dropped.load(Ordering::Relaxed),
            failed: self.metrics.failed.load(Ordering::Relaxed),
            retried: self.metrics.retried.load(Ordering::Relaxed),
            pending: self.pending(),
        }
    }

    async fn write_one(&self, record: &ArchiveRecord) -> Result<(), RetryError<ArchiveError>> {
        let store = self.store.as_ref();
        let write_timeout = self.write_timeout;
        let outcome = retry::run(
            &self.retry,
            move |_attempt| async move {
                match tokio::time::timeout(write_timeout, store.write(record)).await {
                    Ok(r) => r,
                    Err(_) => Err(ArchiveError::Timeout),
                }
            },
            ArchiveError::classify,
        )
        .await;
        let attempts = match &outcome {
            Ok(done) => done.attempts,
            Err(e) => e.attempts,
        };
        self.metrics
            .retried
            .fetch_add(u64::from(attempts.saturating_sub(1)), Ordering::Relaxed);

        outcome.map(|_| {
            self.metrics.archived.fetch_add(1, Ordering::Relaxed);
            if record.is_final() {
                if let Some(tx) = &self.archived_tx {
                    let _ = tx.send(record.session_id.clone());
                }
            }
        })
    }

    /// 写出当前所有待写快照；返回成功数。错误只记录，不返回
    pub async fn flush(&self) -> usize {
        let (written, _) = self.flush_batch().await;
        written
    }

    /// 同步排空：与 flush 相同，但把第一个错误交给调用方
    pub async fn drain(&self) -> Result<usize, ArchiveError> {
        match self.flush_batch().await {
            (written, None) => Ok(written),
            (_, Some(e)) => Err(e),
        }
    }

    async fn flush_batch(&self) -> (usize, Option<ArchiveError>) {
        let batch: Vec<ArchiveRecord> = self.queue().drain(..).collect();
        let mut written = 0usize;
        let mut first_error = None;
        for record in batch {
            match self.write_one(&record).await {
                Ok(()) => written += 1,
                Err(e) if e.class == ErrorClass::Transient => {
                    tracing::warn!(session_id = %record.session_id, attempts = e.attempts, error = %e.error, "archive write exhausted retries, requeued");
                    self.requeue(record);
                    first_error.get_or_insert(e.error);
                }
                Err(e) => {
                    self.metrics.failed.fetch_add(1, Ordering::Relaxed);
                    tracing::error!(session_id = %record.session_id, error = %e.error, "archive write failed, snapshot dropped");
                    first_error.get_or_insert(e.error);
                }
            }
        }
        (written, first_error)
    }

    /// 后台 worker：入队通知或每 interval 一次 flush；shutdown 后排空再退出
    pub fn spawn(self: &Arc<Self>, interval: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        let archiver = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = archiver.notify.notified() => {}
                    _ = ticker.tick() => {}
                }
                archiver.flush().await;
            }
            match archiver.drain().await {
                Ok(n) => tracing::info!(written = n, "archive drained on shutdown"),
                Err(e) => tracing::error!(error = %e, "archive drain on shutdown failed"),
            }
        })
    }
}
