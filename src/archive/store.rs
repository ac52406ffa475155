//! 归档存储
//!
//! 写入全部是 upsert：消息、工具调用、usage 按 (session_id, seq) `ON CONFLICT DO NOTHING`，
//! 会话头 `ON CONFLICT(id) DO UPDATE`。同一窗口重复写不会产生重复行。

use std::path::Path;

use async_trait::async_trait;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use thiserror::Error;

use crate::archive::ArchiveRecord;
use crate::core::ErrorClass;

#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("storage write timed out")]
    Timeout,
}

impl ArchiveError {
    /// I/O、连接池超时、SQLite busy/locked 可重试；其余（约束、SQL 错误等）不可重试
    pub fn classify(&self) -> ErrorClass {
        match self {
            ArchiveError::Timeout => ErrorClass::Transient,
            ArchiveError::Database(e) => match e {
                sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::WorkerCrashed => {
                    ErrorClass::Transient
                }
                sqlx::Error::Database(db) => {
                    let msg = db.message().to_lowercase();
                    if msg.contains("locked") || msg.contains("busy") {
                        ErrorClass::Transient
                    } else {
                        ErrorClass::Fatal
                    }
                }
                _ => ErrorClass::Fatal,
            },
        }
    }
}

/// 归档后端
#[async_trait]
pub trait ArchiveStore: Send + Sync {
    /// 幂等写入一份快照
    async fn write(&self, record: &ArchiveRecord) -> Result<(), ArchiveError>;
}

/// 某个会话在归档中的行数
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArchiveCounts {
    pub messages: i64,
    pub tool_calls: i64,
    pub usage: i64,
}

/// SQLite 归档（sqlx，异步）
pub struct SqliteArchiveStore {
    pool: SqlitePool,
}

impl SqliteArchiveStore {
    /// 连接 database_url（如 `sqlite:storechat.db?mode=rwc`）并建表
    pub async fn connect(database_url: &str) -> Result<Self, ArchiveError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        let store = Self { pool };
        store.init_tables().await?;
        Ok(store)
    }

    /// 按文件路径打开（不存在则创建）
    pub async fn open(db_path: impl AsRef<Path>) -> Result<Self, ArchiveError> {
        let db_url = format!("sqlite:{}?mode=rwc", db_path.as_ref().display());
        Self::connect(&db_url).await
    }

    async fn init_tables(&self) -> Result<(), ArchiveError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                customer_id TEXT,
                cart_id TEXT,
                status TEXT NOT NULL,
                created_at TEXT NOT NULL,
                last_activity TEXT NOT NULL,
                degraded INTEGER NOT NULL DEFAULT 0
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS messages (
                session_id TEXT NOT NULL,
                seq INTEGER NOT NULL,
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                tool_calls_json TEXT,
                tool_call_id TEXT,
                timestamp TEXT NOT NULL,
                PRIMARY KEY (session_id, seq)
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS tool_calls (
                session_id TEXT NOT NULL,
                seq INTEGER NOT NULL,
                invocation_id TEXT NOT NULL,
                tool_name TEXT NOT NULL,
                arguments_json TEXT NOT NULL,
                result_json TEXT NOT NULL,
                status TEXT NOT NULL,
                attempts INTEGER NOT NULL,
                duration_ms INTEGER NOT NULL,
                timestamp TEXT NOT NULL,
                PRIMARY KEY (session_id, seq)
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS usage (
                session_id TEXT NOT NULL,
                seq INTEGER NOT NULL,
                model TEXT NOT NULL,
                prompt_tokens INTEGER NOT NULL,
                completion_tokens INTEGER NOT NULL,
                timestamp TEXT NOT NULL,
                PRIMARY KEY (session_id, seq)
            )",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// 归档中的会话状态
    pub async fn session_status(&self, session_id: &str) -> Result<Option<String>, ArchiveError> {
        let row = sqlx::query("SELECT status FROM sessions WHERE id = ?")
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get("status")))
    }

    pub async fn counts(&self, session_id: &str) -> Result<ArchiveCounts, ArchiveError> {
        let row = sqlx::query(
            "SELECT
                (SELECT COUNT(*) FROM messages WHERE session_id = ?) AS messages,
                (SELECT COUNT(*) FROM tool_calls WHERE session_id = ?) AS tool_calls,
                (SELECT COUNT(*) FROM usage WHERE session_id = ?) AS usage",
        )
        .bind(session_id)
        .bind(session_id)
        .bind(session_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(ArchiveCounts {
            messages: row.get("messages"),
            tool_calls: row.get("tool_calls"),
            usage: row.get("usage"),
        })
    }

    /// 按 seq 读出归档消息：(seq, role, content)
    pub async fn load_messages(
        &self,
        session_id: &str,
    ) -> Result<Vec<(i64, String, String)>, ArchiveError> {
        let rows = sqlx::query(
            "SELECT seq, role, content FROM messages WHERE session_id = ? ORDER BY seq ASC",
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|row| (row.get("seq"), row.get("role"), row.get("content")))
            .collect())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl ArchiveStore for SqliteArchiveStore {
    async fn write(&self, record: &ArchiveRecord) -> Result<(), ArchiveError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO sessions (id, customer_id, cart_id, status, created_at, last_activity, degraded)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                status = excluded.status,
                last_activity = excluded.last_activity,
                degraded = excluded.degraded",
        )
        .bind(&record.session_id)
        .bind(&record.customer_id)
        .bind(&record.cart_id)
        .bind(record.durable_status())
        .bind(record.created_at.to_rfc3339())
        .bind(record.last_activity.to_rfc3339())
        .bind(record.degraded)
        .execute(&mut *tx)
        .await?;

        for m in &record.messages {
            sqlx::query(
                "INSERT INTO messages (session_id, seq, role, content, tool_calls_json, tool_call_id, timestamp)
                 VALUES (?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT(session_id, seq) DO NOTHING",
            )
            .bind(&record.session_id)
            .bind(m.seq)
            .bind(m.role)
            .bind(&m.content)
            .bind(&m.tool_calls_json)
            .bind(&m.tool_call_id)
            .bind(m.timestamp.to_rfc3339())
            .execute(&mut *tx)
            .await?;
        }

        for t in &record.tool_calls {
            sqlx::query(
                "INSERT INTO tool_calls (session_id, seq, invocation_id, tool_name, arguments_json,
                    result_json, status, attempts, duration_ms, timestamp)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT(session_id, seq) DO NOTHING",
            )
            .bind(&record.session_id)
            .bind(t.seq)
            .bind(&t.invocation_id)
            .bind(&t.tool_name)
            .bind(&t.arguments_json)
            .bind(&t.result_json)
            .bind(t.status)
            .bind(t.attempts)
            .bind(t.duration_ms)
            .bind(t.timestamp.to_rfc3339())
            .execute(&mut *tx)
            .await?;
        }

        for u in &record.usage {
            sqlx::query(
                "INSERT INTO usage (session_id, seq, model, prompt_tokens, completion_tokens, timestamp)
                 VALUES (?, ?, ?, ?, ?, ?)
                 ON CONFLICT(session_id, seq) DO NOTHING",
            )
            .bind(&record.session_id)
            .bind(u.seq)
            .bind(&u.model)
            .bind(u.prompt_tokens)
            .bind(u.completion_tokens)
            .bind(u.timestamp.to_rfc3339())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        tracing::debug!(
            session_id = %record.session_id,
            messages = record.messages.len(),
            tool_calls = record.tool_calls.len(),
            "archive snapshot written"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::Message;
    use crate::session::Session;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_overlapping_writes_create_no_duplicates() {
        let dir = TempDir::new().unwrap();
        let store = SqliteArchiveStore::open(dir.path().join("archive.db"))
            .await
            .unwrap();

        let mut s = Session::new("s1");
        s.push_message(Message::user("hello"));
        s.push_message(Message::assistant("hi"));
        store.write(&ArchiveRecord::from_session(&s)).await.unwrap();

        s.push_message(Message::user("bye"));
        let record = ArchiveRecord::from_session(&s);
        store.write(&record).await.unwrap();
        store.write(&record).await.unwrap();

        let counts = store.counts("s1").await.unwrap();
        assert_eq!(counts.messages, 3);
        assert_eq!(counts.tool_calls, 0);
        let rows = store.load_messages("s1").await.unwrap();
        let seqs: Vec<i64> = rows.iter().map(|r| r.0).collect();
        assert_eq!(seqs, vec![0, 1, 2]);
        assert_eq!(rows[2].2, "bye");
        assert_eq!(store.session_status("s1").await.unwrap().as_deref(), Some("open"));

        s.close();
        store.write(&ArchiveRecord::from_session(&s)).await.unwrap();
        assert_eq!(
            store.session_status("s1").await.unwrap().as_deref(),
            Some("archived")
        );
        assert_eq!(store.counts("s1").await.unwrap().messages, 3);
    }

    #[test]
    fn test_classify() {
        assert_eq!(ArchiveError::Timeout.classify(), ErrorClass::Transient);
        assert_eq!(
            ArchiveError::Database(sqlx::Error::PoolTimedOut).classify(),
            ErrorClass::Transient
        );
        assert_eq!(
            ArchiveError::Database(sqlx::Error::RowNotFound).classify(),
            ErrorClass::Fatal
        );
    }
}
