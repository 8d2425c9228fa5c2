//! 持久化存储 - SQLite (WAL 模式)
//!
//! 所有组件共享同一个数据库文件，多进程并发访问安全。
//! 每次操作打开独立连接，依赖 WAL + busy_timeout 处理并发写入。

pub mod audit;
pub mod config;
pub mod events;
pub mod sessions;

use anyhow::{Context, Result};
use rusqlite::Connection;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// 默认 busy 超时（毫秒）
const BUSY_TIMEOUT_MS: u64 = 30_000;

/// 获取当前 unix 时间戳（秒）
pub fn now_ts() -> i64 {
    chrono::Utc::now().timestamp()
}

/// 存储句柄 - 可 Clone，跨线程共享
#[derive(Clone)]
pub struct Store {
    db_path: PathBuf,
}

impl Store {
    /// 打开（或创建）数据库并初始化 schema
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref().to_path_buf();

        if let Some(parent) = db_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create state dir: {}", parent.display()))?;
        }

        let store = Self { db_path };
        let conn = store.conn()?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Self::init_schema(&conn)?;
        Ok(store)
    }

    /// 默认数据库路径: ~/.claude/state/notifications.db
    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".claude")
            .join("state")
            .join("notifications.db")
    }

    /// 数据库文件路径
    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// 打开一个新连接（每个操作独立连接，外键约束始终开启）
    pub(crate) fn conn(&self) -> Result<Connection> {
        let conn = Connection::open(&self.db_path)?;
        conn.busy_timeout(Duration::from_millis(BUSY_TIMEOUT_MS))?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Ok(conn)
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            -- 原始 hook 事件（append-only）
            CREATE TABLE IF NOT EXISTS events (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              session_id TEXT NOT NULL,
              event_type TEXT NOT NULL,
              hook_payload TEXT NOT NULL,
              created_at INTEGER NOT NULL,
              processed_at INTEGER
            );
            CREATE INDEX IF NOT EXISTS idx_events_session ON events(session_id);
            CREATE INDEX IF NOT EXISTS idx_events_created ON events(created_at);
            CREATE INDEX IF NOT EXISTS idx_events_processed ON events(processed_at);

            -- 通知投递队列（event_id 可空：通知不必绑定某个事件）
            CREATE TABLE IF NOT EXISTS notifications (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              event_id INTEGER,
              session_id TEXT NOT NULL,
              notification_type TEXT NOT NULL,
              backend TEXT NOT NULL DEFAULT 'slack',
              status TEXT NOT NULL DEFAULT 'pending',
              retry_count INTEGER DEFAULT 0,
              payload TEXT NOT NULL,
              error TEXT,
              created_at INTEGER NOT NULL,
              sent_at INTEGER,
              next_retry_at INTEGER,
              claimed_at INTEGER,
              FOREIGN KEY (event_id) REFERENCES events(id)
            );
            CREATE INDEX IF NOT EXISTS idx_notifications_status ON notifications(status);
            CREATE INDEX IF NOT EXISTS idx_notifications_session ON notifications(session_id);
            CREATE INDEX IF NOT EXISTS idx_notifications_retry ON notifications(next_retry_at)
                WHERE status = 'failed';

            -- 会话元数据
            CREATE TABLE IF NOT EXISTS sessions (
              session_id TEXT PRIMARY KEY,
              project_name TEXT,
              cwd TEXT NOT NULL,
              git_branch TEXT,
              terminal_type TEXT,
              terminal_info TEXT,
              started_at INTEGER NOT NULL,
              last_activity_at INTEGER NOT NULL,
              ended_at INTEGER,
              is_idle INTEGER DEFAULT 0
            );

            -- 配置项（敏感值加密存储）
            CREATE TABLE IF NOT EXISTS config (
              key TEXT PRIMARY KEY,
              value TEXT NOT NULL,
              is_encrypted INTEGER DEFAULT 0,
              updated_at INTEGER NOT NULL
            );

            -- 审计日志（append-only）
            CREATE TABLE IF NOT EXISTS audit_log (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              session_id TEXT,
              action TEXT NOT NULL,
              details TEXT,
              created_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_audit_session ON audit_log(session_id);
            CREATE INDEX IF NOT EXISTS idx_audit_action ON audit_log(action);

            -- 数值指标（append-only）
            CREATE TABLE IF NOT EXISTS metrics (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              metric_name TEXT NOT NULL,
              metric_value REAL NOT NULL,
              session_id TEXT,
              created_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_metrics_name_time ON metrics(metric_name, created_at);

            -- 限流/去重状态
            CREATE TABLE IF NOT EXISTS rate_limit_state (
              session_id TEXT NOT NULL,
              notification_type TEXT NOT NULL,
              last_sent_at INTEGER,
              last_payload_hash TEXT,
              last_payload_at INTEGER,
              suppressed_count INTEGER DEFAULT 0,
              updated_at INTEGER NOT NULL,
              PRIMARY KEY (session_id, notification_type)
            );
            "#,
        )?;
        Ok(())
    }
}
