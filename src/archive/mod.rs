//! 会话归档：把会话快照异步、幂等地写入 SQLite
//!
//! 请求路径只调用非阻塞的 SessionArchiver::enqueue；写入在后台 worker 中完成，失败不会回到请求路径。

pub mod archiver;
pub mod record;
pub mod store;

pub use archiver::{ArchiveMetrics, ArchiveMetricsSnapshot, SessionArchiver};
pub use record::{ArchiveRecord, ArchivedMessage, ArchivedToolCall, ArchivedUsage};
pub use store::{ArchiveCounts, ArchiveError, ArchiveStore, SqliteArchiveStore};
