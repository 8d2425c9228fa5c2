//! 审计日志与指标 - append-only 旁路可观测性

use anyhow::Result;
use rusqlite::{params, Row};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{now_ts, Store};

/// 审计条目
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: i64,
    pub session_id: Option<String>,
    pub action: String,
    pub details: Option<Value>,
    pub created_at: i64,
}

impl AuditEntry {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let details_s: Option<String> = row.get("details")?;
        Ok(Self {
            id: row.get("id")?,
            session_id: row.get("session_id")?,
            action: row.get("action")?,
            details: details_s.and_then(|s| serde_json::from_str(&s).ok()),
            created_at: row.get("created_at")?,
        })
    }
}

/// 指标统计摘要
#[derive(Debug, Clone, Serialize)]
pub struct MetricStats {
    pub count: i64,
    pub avg: Option<f64>,
    pub min: Option<f64>,
    pub max: Option<f64>,
}

impl Store {
    /// 写入审计条目
    pub fn log_audit(
        &self,
        session_id: Option<&str>,
        action: &str,
        details: Option<&Value>,
    ) -> Result<i64> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO audit_log (session_id, action, details, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![session_id, action, details.map(|d| d.to_string()), now_ts()],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// 会话的审计记录（新到旧）
    pub fn get_audit_by_session(&self, session_id: &str) -> Result<Vec<AuditEntry>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM audit_log WHERE session_id = ?1 ORDER BY created_at DESC",
        )?;
        let entries = stmt
            .query_map(params![session_id], AuditEntry::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(entries)
    }

    /// 按动作名查询审计记录
    pub fn get_audit_by_action(&self, action: &str) -> Result<Vec<AuditEntry>> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare("SELECT * FROM audit_log WHERE action = ?1 ORDER BY created_at DESC")?;
        let entries = stmt
            .query_map(params![action], AuditEntry::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(entries)
    }

    /// 最近的审计记录
    pub fn get_recent_audit(&self, limit: i64) -> Result<Vec<AuditEntry>> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare("SELECT * FROM audit_log ORDER BY created_at DESC LIMIT ?1")?;
        let entries = stmt
            .query_map(params![limit], AuditEntry::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(entries)
    }

    /// 记录数值指标（投递延迟、结果计数等）
    pub fn record_metric(
        &self,
        metric_name: &str,
        metric_value: f64,
        session_id: Option<&str>,
    ) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO metrics (metric_name, metric_value, session_id, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![metric_name, metric_value, session_id, now_ts()],
        )?;
        Ok(())
    }

    /// 指标统计（count/avg/min/max），可选起始时间过滤
    pub fn get_metric_stats(&self, metric_name: &str, since: Option<i64>) -> Result<MetricStats> {
        let conn = self.conn()?;
        let stats = conn.query_row(
            "SELECT COUNT(*), AVG(metric_value), MIN(metric_value), MAX(metric_value)
             FROM metrics
             WHERE metric_name = ?1 AND created_at >= ?2",
            params![metric_name, since.unwrap_or(0)],
            |row| {
                Ok(MetricStats {
                    count: row.get(0)?,
                    avg: row.get(1)?,
                    min: row.get(2)?,
                    max: row.get(3)?,
                })
            },
        )?;
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_util::temp_store;
    use serde_json::json;

    #[test]
    fn test_audit_insert_and_query() {
        let (_dir, store) = temp_store();

        store
            .log_audit(Some("s1"), "notification_queued", Some(&json!({"event_id": 1})))
            .unwrap();
        store.log_audit(Some("s1"), "session_stopped", None).unwrap();
        store.log_audit(None, "event_rejected", Some(&json!({"error": "bad"}))).unwrap();

        let by_session = store.get_audit_by_session("s1").unwrap();
        assert_eq!(by_session.len(), 2);

        let by_action = store.get_audit_by_action("event_rejected").unwrap();
        assert_eq!(by_action.len(), 1);
        assert!(by_action[0].session_id.is_none());
        assert_eq!(by_action[0].details.as_ref().unwrap()["error"], "bad");

        let recent = store.get_recent_audit(2).unwrap();
        assert_eq!(recent.len(), 2);
    }

    #[test]
    fn test_metric_stats() {
        let (_dir, store) = temp_store();

        store.record_metric("send_latency_ms", 120.0, Some("s1")).unwrap();
        store.record_metric("send_latency_ms", 80.0, Some("s1")).unwrap();
        store.record_metric("send_latency_ms", 100.0, None).unwrap();
        store.record_metric("other", 5.0, None).unwrap();

        let stats = store.get_metric_stats("send_latency_ms", None).unwrap();
        assert_eq!(stats.count, 3);
        assert_eq!(stats.avg, Some(100.0));
        assert_eq!(stats.min, Some(80.0));
        assert_eq!(stats.max, Some(120.0));
    }

    #[test]
    fn test_metric_stats_empty() {
        let (_dir, store) = temp_store();
        let stats = store.get_metric_stats("missing", None).unwrap();
        assert_eq!(stats.count, 0);
        assert!(stats.avg.is_none());
    }
}
