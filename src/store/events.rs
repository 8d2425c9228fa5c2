//! 事件存储 - 原始 hook 事件的 append-only 记录

use anyhow::Result;
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{now_ts, Store};

/// 事件记录
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: i64,
    pub session_id: String,
    pub event_type: String,
    /// 原始 hook payload（JSON）
    pub payload: Value,
    pub created_at: i64,
    pub processed_at: Option<i64>,
}

impl Event {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let payload_s: String = row.get("hook_payload")?;
        Ok(Self {
            id: row.get("id")?,
            session_id: row.get("session_id")?,
            event_type: row.get("event_type")?,
            payload: serde_json::from_str(&payload_s).unwrap_or(Value::Null),
            created_at: row.get("created_at")?,
            processed_at: row.get("processed_at")?,
        })
    }
}

impl Store {
    /// 写入事件，返回事件 ID（同步落盘后才返回）
    pub fn insert_event(&self, session_id: &str, event_type: &str, payload: &Value) -> Result<i64> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO events (session_id, event_type, hook_payload, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![session_id, event_type, payload.to_string(), now_ts()],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// 按 ID 查询事件
    pub fn get_event(&self, event_id: i64) -> Result<Option<Event>> {
        let conn = self.conn()?;
        let event = conn
            .query_row(
                "SELECT * FROM events WHERE id = ?1",
                params![event_id],
                Event::from_row,
            )
            .optional()?;
        Ok(event)
    }

    /// 获取所有未处理事件（按时间升序）
    pub fn get_unprocessed_events(&self) -> Result<Vec<Event>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM events WHERE processed_at IS NULL ORDER BY created_at ASC, id ASC",
        )?;
        let events = stmt
            .query_map([], Event::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(events)
    }

    /// 标记事件已处理（幂等：重复标记是 no-op）
    pub fn mark_event_processed(&self, event_id: i64) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE events SET processed_at = ?1 WHERE id = ?2 AND processed_at IS NULL",
            params![now_ts(), event_id],
        )?;
        Ok(())
    }

    /// 获取会话的所有事件
    pub fn get_events_by_session(&self, session_id: &str) -> Result<Vec<Event>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM events WHERE session_id = ?1 ORDER BY created_at ASC",
        )?;
        let events = stmt
            .query_map(params![session_id], Event::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_util::temp_store;
    use serde_json::json;

    #[test]
    fn test_insert_and_get_event() {
        let (_dir, store) = temp_store();

        let payload = json!({"tool_name": "Edit", "cwd": "/tmp"});
        let id = store.insert_event("s1", "pre_tool_use", &payload).unwrap();
        assert!(id > 0);

        let event = store.get_event(id).unwrap().unwrap();
        assert_eq!(event.session_id, "s1");
        assert_eq!(event.event_type, "pre_tool_use");
        assert_eq!(event.payload, payload);
        assert!(event.processed_at.is_none());
    }

    #[test]
    fn test_get_event_missing() {
        let (_dir, store) = temp_store();
        assert!(store.get_event(999).unwrap().is_none());
    }

    #[test]
    fn test_unprocessed_and_mark_processed() {
        let (_dir, store) = temp_store();

        let id1 = store.insert_event("s1", "notification", &json!({})).unwrap();
        let id2 = store.insert_event("s1", "stop", &json!({})).unwrap();

        let unprocessed = store.get_unprocessed_events().unwrap();
        assert_eq!(unprocessed.len(), 2);
        // FIFO 顺序
        assert_eq!(unprocessed[0].id, id1);

        store.mark_event_processed(id1).unwrap();
        let unprocessed = store.get_unprocessed_events().unwrap();
        assert_eq!(unprocessed.len(), 1);
        assert_eq!(unprocessed[0].id, id2);
    }

    #[test]
    fn test_mark_processed_idempotent() {
        let (_dir, store) = temp_store();
        let id = store.insert_event("s1", "stop", &json!({})).unwrap();

        store.mark_event_processed(id).unwrap();
        let first = store.get_event(id).unwrap().unwrap().processed_at;

        // 重复标记不报错、不改变时间戳
        store.mark_event_processed(id).unwrap();
        let second = store.get_event(id).unwrap().unwrap().processed_at;
        assert_eq!(first, second);

        // 标记不存在的事件也是 no-op
        store.mark_event_processed(12345).unwrap();
    }

    #[test]
    fn test_get_events_by_session() {
        let (_dir, store) = temp_store();
        store.insert_event("s1", "notification", &json!({})).unwrap();
        store.insert_event("s2", "notification", &json!({})).unwrap();
        store.insert_event("s1", "stop", &json!({})).unwrap();

        let events = store.get_events_by_session("s1").unwrap();
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.session_id == "s1"));
    }
}
