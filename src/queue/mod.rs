//! 通知队列 - 状态机、重试退避、死信
//!
//! 状态流转: pending → processing → {sent | failed}
//!           failed → processing（到达重试时间）| dead_letter（超过重试上限）
//!
//! dequeue 在同一事务内完成"选中 + 置为 processing"（claim-and-lock），
//! 多个 dispatcher 实例并发拉取不会重复认领同一条通知。

use anyhow::Result;
use rusqlite::{params, OptionalExtension, Row, TransactionBehavior};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

use crate::store::{now_ts, Store};

/// 重试退避序列（秒）: 1min, 5min, 15min, 1hr, 4hr
pub const RETRY_DELAYS: [i64; 5] = [60, 300, 900, 3600, 14400];

/// 重试上限，超过后进入死信
pub const MAX_RETRIES: i64 = 5;

/// processing 状态的认领超时（秒）。dispatcher 崩溃后由 reaper 重新入队。
pub const STALE_CLAIM_SECS: i64 = 300;

/// 错误信息落库上限（字节）
const ERROR_MAX_BYTES: usize = 500;

/// 通知状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationStatus {
    Pending,
    Processing,
    Sent,
    Failed,
    DeadLetter,
}

impl NotificationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Sent => "sent",
            Self::Failed => "failed",
            Self::DeadLetter => "dead_letter",
        }
    }

    /// 终止状态不可再变更
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Sent | Self::DeadLetter)
    }
}

impl fmt::Display for NotificationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NotificationStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "sent" => Ok(Self::Sent),
            "failed" => Ok(Self::Failed),
            "dead_letter" => Ok(Self::DeadLetter),
            other => Err(anyhow::anyhow!("Unknown notification status: {other}")),
        }
    }
}

/// 通知类别（闭合枚举，路由和 payload 构建处穷尽匹配）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    /// 工具权限请求
    Permission,
    /// 任务完成
    TaskComplete,
    /// 等待用户输入
    InputRequired,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Permission => "permission",
            Self::TaskComplete => "task_complete",
            Self::InputRequired => "input_required",
        }
    }
}

impl fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NotificationKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "permission" => Ok(Self::Permission),
            "task_complete" => Ok(Self::TaskComplete),
            "input_required" => Ok(Self::InputRequired),
            other => Err(anyhow::anyhow!("Unknown notification kind: {other}")),
        }
    }
}

/// 队列中的通知记录
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub id: i64,
    pub event_id: Option<i64>,
    pub session_id: String,
    pub notification_type: String,
    pub backend: String,
    pub status: NotificationStatus,
    pub retry_count: i64,
    pub payload: Value,
    pub error: Option<String>,
    pub created_at: i64,
    pub sent_at: Option<i64>,
    pub next_retry_at: Option<i64>,
}

impl Notification {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let status_s: String = row.get("status")?;
        let payload_s: String = row.get("payload")?;
        Ok(Self {
            id: row.get("id")?,
            event_id: row.get("event_id")?,
            session_id: row.get("session_id")?,
            notification_type: row.get("notification_type")?,
            backend: row.get("backend")?,
            status: status_s.parse().unwrap_or(NotificationStatus::Pending),
            retry_count: row.get("retry_count")?,
            payload: serde_json::from_str(&payload_s).unwrap_or(Value::Null),
            error: row.get("error")?,
            created_at: row.get("created_at")?,
            sent_at: row.get("sent_at")?,
            next_retry_at: row.get("next_retry_at")?,
        })
    }
}

/// 队列统计
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueStats {
    pub pending: i64,
    pub processing: i64,
    pub sent: i64,
    pub failed: i64,
    pub dead_letter: i64,
    pub total: i64,
}

/// 第 retry_count 次重试的退避延迟（秒）
pub fn retry_delay(retry_count: i64) -> i64 {
    let index = (retry_count - 1).clamp(0, RETRY_DELAYS.len() as i64 - 1);
    RETRY_DELAYS[index as usize]
}

/// 下次重试时间的人类可读描述
pub fn format_retry_time(next_retry_at: i64) -> String {
    let delta = next_retry_at - now_ts();
    if delta <= 0 {
        return "now".to_string();
    }
    if delta < 60 {
        return format!("in {delta}s");
    }
    if delta < 3600 {
        return format!("in {}m", delta / 60);
    }
    if delta < 86400 {
        return format!("in {}h", delta / 3600);
    }
    format!("in {}d", delta / 86400)
}

/// 通知队列 - 所有状态变更必须经过这里
#[derive(Clone)]
pub struct NotificationQueue {
    store: Store,
}

impl NotificationQueue {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// 入队，初始状态 pending。同步写入，生产者不等待任何网络 IO。
    pub fn enqueue(
        &self,
        kind: NotificationKind,
        payload: &Value,
        session_id: &str,
        backend: &str,
        event_id: Option<i64>,
    ) -> Result<i64> {
        let conn = self.store.conn()?;
        conn.execute(
            "INSERT INTO notifications
             (event_id, session_id, notification_type, backend, status, payload, created_at, retry_count)
             VALUES (?1, ?2, ?3, ?4, 'pending', ?5, ?6, 0)",
            params![
                event_id,
                session_id,
                kind.as_str(),
                backend,
                payload.to_string(),
                now_ts()
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// 原子认领一批待处理通知并置为 processing。
    /// 就绪条件: pending，或 failed 且 next_retry_at 已到；FIFO 顺序。
    pub fn dequeue(&self, batch_size: usize) -> Result<Vec<Notification>> {
        if batch_size == 0 {
            return Ok(Vec::new());
        }

        let mut conn = self.store.conn()?;
        let now = now_ts();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let mut notifications = {
            let mut stmt = tx.prepare(
                "SELECT * FROM notifications
                 WHERE status = 'pending'
                    OR (status = 'failed' AND next_retry_at <= ?1)
                 ORDER BY created_at ASC, id ASC
                 LIMIT ?2",
            )?;
            let rows = stmt
                .query_map(params![now, batch_size as i64], Notification::from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };

        for notification in &mut notifications {
            tx.execute(
                "UPDATE notifications SET status = 'processing', claimed_at = ?1 WHERE id = ?2",
                params![now, notification.id],
            )?;
            notification.status = NotificationStatus::Processing;
        }

        tx.commit()?;
        Ok(notifications)
    }

    /// 标记发送成功。终止状态不可变更，sent_at 至多设置一次；
    /// id 不存在时安静返回。
    pub fn mark_sent(&self, id: i64) -> Result<()> {
        let conn = self.store.conn()?;
        conn.execute(
            "UPDATE notifications
             SET status = 'sent', sent_at = ?1, claimed_at = NULL
             WHERE id = ?2 AND status NOT IN ('sent', 'dead_letter')",
            params![now_ts(), id],
        )?;
        Ok(())
    }

    /// 标记发送失败：递增 retry_count，按退避序列排期重试；
    /// 超过重试上限后进入 dead_letter。
    pub fn mark_failed(&self, id: i64, error: &str) -> Result<()> {
        let mut conn = self.store.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let current: Option<(i64, String)> = tx
            .query_row(
                "SELECT retry_count, status FROM notifications WHERE id = ?1",
                params![id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let Some((retry_count, status)) = current else {
            tx.commit()?;
            return Ok(());
        };

        // 终止状态不可变更
        if status == "sent" || status == "dead_letter" {
            tx.commit()?;
            return Ok(());
        }

        let new_retry_count = retry_count + 1;
        let error = truncate_error(error);

        if new_retry_count > MAX_RETRIES {
            tx.execute(
                "UPDATE notifications
                 SET status = 'dead_letter', retry_count = ?1, error = ?2, claimed_at = NULL
                 WHERE id = ?3",
                params![new_retry_count, error, id],
            )?;
        } else {
            let next_retry_at = now_ts() + retry_delay(new_retry_count);
            tx.execute(
                "UPDATE notifications
                 SET status = 'failed', retry_count = ?1, error = ?2,
                     next_retry_at = ?3, claimed_at = NULL
                 WHERE id = ?4",
                params![new_retry_count, error, next_retry_at, id],
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    /// 按 ID 查询
    pub fn get(&self, id: i64) -> Result<Option<Notification>> {
        let conn = self.store.conn()?;
        let notification = conn
            .query_row(
                "SELECT * FROM notifications WHERE id = ?1",
                params![id],
                Notification::from_row,
            )
            .optional()?;
        Ok(notification)
    }

    /// 就绪待投递的数量（pending + 到期的 failed）
    pub fn pending_count(&self, session_id: Option<&str>) -> Result<i64> {
        let conn = self.store.conn()?;
        let now = now_ts();
        let count = match session_id {
            Some(sid) => conn.query_row(
                "SELECT COUNT(*) FROM notifications
                 WHERE session_id = ?1
                   AND (status = 'pending' OR (status = 'failed' AND next_retry_at <= ?2))",
                params![sid, now],
                |row| row.get(0),
            )?,
            None => conn.query_row(
                "SELECT COUNT(*) FROM notifications
                 WHERE status = 'pending' OR (status = 'failed' AND next_retry_at <= ?1)",
                params![now],
                |row| row.get(0),
            )?,
        };
        Ok(count)
    }

    /// 按状态统计，可选会话过滤
    pub fn stats(&self, session_id: Option<&str>) -> Result<QueueStats> {
        let conn = self.store.conn()?;
        let sql = "SELECT
                       SUM(CASE WHEN status = 'pending' THEN 1 ELSE 0 END),
                       SUM(CASE WHEN status = 'processing' THEN 1 ELSE 0 END),
                       SUM(CASE WHEN status = 'sent' THEN 1 ELSE 0 END),
                       SUM(CASE WHEN status = 'failed' THEN 1 ELSE 0 END),
                       SUM(CASE WHEN status = 'dead_letter' THEN 1 ELSE 0 END),
                       COUNT(*)
                   FROM notifications";
        let map = |row: &Row<'_>| {
            Ok(QueueStats {
                pending: row.get::<_, Option<i64>>(0)?.unwrap_or(0),
                processing: row.get::<_, Option<i64>>(1)?.unwrap_or(0),
                sent: row.get::<_, Option<i64>>(2)?.unwrap_or(0),
                failed: row.get::<_, Option<i64>>(3)?.unwrap_or(0),
                dead_letter: row.get::<_, Option<i64>>(4)?.unwrap_or(0),
                total: row.get(5)?,
            })
        };
        let stats = match session_id {
            Some(sid) => conn.query_row(
                &format!("{sql} WHERE session_id = ?1"),
                params![sid],
                map,
            )?,
            None => conn.query_row(sql, [], map)?,
        };
        Ok(stats)
    }

    /// 死信列表（新到旧）
    pub fn dead_letters(&self, limit: Option<i64>) -> Result<Vec<Notification>> {
        let conn = self.store.conn()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM notifications
             WHERE status = 'dead_letter'
             ORDER BY created_at DESC
             LIMIT ?1",
        )?;
        let notifications = stmt
            .query_map(params![limit.unwrap_or(i64::MAX)], Notification::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(notifications)
    }

    /// 清理 N 天前的终止状态通知（sent / dead_letter）。
    /// pending/processing/failed 无论多旧都不会被删除。
    pub fn cleanup_old(&self, days: i64) -> Result<usize> {
        let conn = self.store.conn()?;
        let cutoff = now_ts() - days * 24 * 60 * 60;
        let deleted = conn.execute(
            "DELETE FROM notifications
             WHERE status IN ('sent', 'dead_letter') AND created_at < ?1",
            params![cutoff],
        )?;
        Ok(deleted)
    }

    /// 僵尸回收：dispatcher 崩溃遗留的 processing 行超时后重新入队。
    /// 没有任何 processing 行可以永久存活。
    pub fn requeue_stale(&self, threshold_secs: i64) -> Result<usize> {
        let conn = self.store.conn()?;
        let cutoff = now_ts() - threshold_secs;
        let requeued = conn.execute(
            "UPDATE notifications
             SET status = 'pending', claimed_at = NULL
             WHERE status = 'processing' AND claimed_at IS NOT NULL AND claimed_at < ?1",
            params![cutoff],
        )?;
        Ok(requeued)
    }
}

fn truncate_error(error: &str) -> String {
    if error.len() <= ERROR_MAX_BYTES {
        return error.to_string();
    }
    let mut end = ERROR_MAX_BYTES;
    while !error.is_char_boundary(end) {
        end -= 1;
    }
    error[..end].to_string()
}
