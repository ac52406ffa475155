//! 会话注册表
//!
//! 每个会话一把 tokio Mutex，整轮对话持有 owned guard，保证同一会话同一时刻只有一个生成循环。
//! 关闭过的 ID 进入 retired 集合，不能重新打开（归档序号因此不会歧义）。

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{Mutex, RwLock};

use crate::core::ChatError;
use crate::session::{Session, SessionStatus};

pub type SharedSession = Arc<Mutex<Session>>;

#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, SharedSession>>,
    retired: RwLock<HashSet<String>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 获取或创建会话；customer_id / cart_id 只在首次创建时生效
    pub async fn open(
        &self,
        session_id: &str,
        customer_id: Option<String>,
        cart_id: Option<String>,
    ) -> Result<SharedSession, ChatError> {
        if self.retired.read().await.contains(session_id) {
            return Err(ChatError::SessionClosed(session_id.to_string()));
        }
        if let Some(s) = self.sessions.read().await.get(session_id) {
            return Ok(s.clone());
        }
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .entry(session_id.to_string())
            .or_insert_with(|| {
                tracing::info!(session_id, "session opened");
                Arc::new(Mutex::new(
                    Session::new(session_id).with_customer(customer_id, cart_id),
                ))
            })
            .clone();
        Ok(session)
    }

    pub async fn get(&self, session_id: &str) -> Option<SharedSession> {
        self.sessions.read().await.get(session_id).cloned()
    }

    pub async fn is_retired(&self, session_id: &str) -> bool {
        self.retired.read().await.contains(session_id)
    }

    /// 关闭会话（等待进行中的轮次结束）；返回会话供调用方入队归档
    pub async fn close(&self, session_id: &str) -> Result<SharedSession, ChatError> {
        let session = self
            .get(session_id)
            .await
            .ok_or_else(|| ChatError::SessionNotFound(session_id.to_string()))?;
        self.retired.write().await.insert(session_id.to_string());
        session.lock().await.close();
        tracing::info!(session_id, "session closed");
        Ok(session)
    }

    /// 空闲超过 idle_timeout 的打开会话；正在跑轮次的会话跳过
    pub async fn idle_sessions(&self, idle_timeout: chrono::Duration) -> Vec<String> {
        let now = Utc::now();
        let sessions = self.sessions.read().await;
        sessions
            .iter()
            .filter_map(|(id, s)| {
                let guard = s.try_lock().ok()?;
                (guard.is_open() && guard.idle_for(now) > idle_timeout).then(|| id.clone())
            })
            .collect()
    }

    /// 归档确认后标记；会话不存在或未关闭时返回 false
    pub async fn mark_archived(&self, session_id: &str) -> bool {
        match self.get(session_id).await {
            Some(s) => s.lock().await.mark_archived(),
            None => false,
        }
    }

    /// 移除已归档的会话；返回移除数量
    pub async fn evict_archived(&self) -> usize {
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|_, s| match s.try_lock() {
            Ok(guard) => guard.status() != SessionStatus::Archived,
            Err(_) => true,
        });
        let evicted = before - sessions.len();
        if evicted > 0 {
            tracing::debug!(evicted, "evicted archived sessions");
        }
        evicted
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}
