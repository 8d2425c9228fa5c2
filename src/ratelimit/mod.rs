//! 限流与去重 - 冷却窗口 + 载荷指纹去重
//!
//! 状态落在 rate_limit_state 表里（按会话 + 通知类别一行），进程重启不丢。
//! 被抑制的次数会累积，下一条放行的通知把计数带给用户（"+N suppressed"）。

use anyhow::Result;
use rusqlite::{params, OptionalExtension};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::queue::NotificationKind;
use crate::store::{now_ts, Store};

/// 限流配置（冷却秒数按通知类别区分）
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub permission_cooldown_secs: i64,
    pub input_required_cooldown_secs: i64,
    pub task_complete_cooldown_secs: i64,
    pub dedup_enabled: bool,
    pub dedup_window_secs: i64,
    pub state_ttl_hours: i64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            permission_cooldown_secs: 30,
            input_required_cooldown_secs: 60,
            // 任务完成不限流，每次都发
            task_complete_cooldown_secs: 0,
            dedup_enabled: true,
            dedup_window_secs: 300,
            state_ttl_hours: 24,
        }
    }
}

impl RateLimitConfig {
    pub fn cooldown_for(&self, kind: NotificationKind) -> i64 {
        match kind {
            NotificationKind::Permission => self.permission_cooldown_secs,
            NotificationKind::InputRequired => self.input_required_cooldown_secs,
            NotificationKind::TaskComplete => self.task_complete_cooldown_secs,
        }
    }
}

/// 限流判定结果
#[derive(Debug, Clone)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub reason: &'static str,
    /// 本窗口内已抑制的条数（放行时用于展示，抑制时含本条）
    pub suppressed_count: i64,
    pub cooldown_remaining: i64,
}

impl RateLimitDecision {
    fn allow(reason: &'static str, suppressed_count: i64) -> Self {
        Self {
            allowed: true,
            reason,
            suppressed_count,
            cooldown_remaining: 0,
        }
    }

    fn suppress(reason: &'static str, suppressed_count: i64, cooldown_remaining: i64) -> Self {
        Self {
            allowed: false,
            reason,
            suppressed_count,
            cooldown_remaining,
        }
    }
}

/// 限流器
#[derive(Clone)]
pub struct RateLimiter {
    store: Store,
    config: RateLimitConfig,
}

impl RateLimiter {
    pub fn new(store: Store, config: RateLimitConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// 判定是否放行。抑制时已顺手递增 suppressed_count。
    pub fn should_send(
        &self,
        session_id: &str,
        kind: NotificationKind,
        payload: Option<&Value>,
    ) -> Result<RateLimitDecision> {
        if !self.config.enabled {
            return Ok(RateLimitDecision::allow("rate_limiting_disabled", 0));
        }

        let cooldown = self.config.cooldown_for(kind);
        if cooldown == 0 {
            return Ok(RateLimitDecision::allow("no_cooldown", 0));
        }

        let conn = self.store.conn()?;
        let state: Option<(Option<i64>, i64, Option<String>, Option<i64>)> = conn
            .query_row(
                "SELECT last_sent_at, suppressed_count, last_payload_hash, last_payload_at
                 FROM rate_limit_state
                 WHERE session_id = ?1 AND notification_type = ?2",
                params![session_id, kind.as_str()],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .optional()?;

        let Some((last_sent_at, suppressed, last_hash, last_payload_at)) = state else {
            return Ok(RateLimitDecision::allow("first_notification", 0));
        };

        let now = now_ts();

        if let Some(last_sent_at) = last_sent_at {
            let elapsed = now - last_sent_at;
            if elapsed < cooldown {
                self.increment_suppressed(&conn, session_id, kind)?;
                return Ok(RateLimitDecision::suppress(
                    "cooldown_active",
                    suppressed + 1,
                    cooldown - elapsed,
                ));
            }
        }

        // 冷却已过，检查去重窗口内的重复载荷
        if self.config.dedup_enabled {
            if let (Some(payload), Some(last_hash), Some(last_at)) =
                (payload, last_hash, last_payload_at)
            {
                if hash_payload(payload) == last_hash
                    && last_at > now - self.config.dedup_window_secs
                {
                    self.increment_suppressed(&conn, session_id, kind)?;
                    return Ok(RateLimitDecision::suppress(
                        "duplicate_suppressed",
                        suppressed + 1,
                        0,
                    ));
                }
            }
        }

        Ok(RateLimitDecision::allow("cooldown_expired", suppressed))
    }

    /// 记录一次实际发送：刷新冷却起点、载荷指纹，清零抑制计数。
    /// 返回清零前的抑制数。
    pub fn record_sent(
        &self,
        session_id: &str,
        kind: NotificationKind,
        payload: Option<&Value>,
    ) -> Result<i64> {
        let conn = self.store.conn()?;
        let now = now_ts();

        let prior: i64 = conn
            .query_row(
                "SELECT suppressed_count FROM rate_limit_state
                 WHERE session_id = ?1 AND notification_type = ?2",
                params![session_id, kind.as_str()],
                |row| row.get(0),
            )
            .optional()?
            .unwrap_or(0);

        let hash = payload.map(hash_payload);
        conn.execute(
            "INSERT INTO rate_limit_state
             (session_id, notification_type, last_sent_at, suppressed_count,
              last_payload_hash, last_payload_at, updated_at)
             VALUES (?1, ?2, ?3, 0, ?4, ?5, ?3)
             ON CONFLICT(session_id, notification_type) DO UPDATE SET
                 last_sent_at = excluded.last_sent_at,
                 suppressed_count = 0,
                 last_payload_hash = excluded.last_payload_hash,
                 last_payload_at = excluded.last_payload_at,
                 updated_at = excluded.updated_at",
            params![
                session_id,
                kind.as_str(),
                now,
                hash,
                payload.map(|_| now)
            ],
        )?;
        Ok(prior)
    }

    /// 当前抑制计数
    pub fn suppressed_count(&self, session_id: &str, kind: NotificationKind) -> Result<i64> {
        let conn = self.store.conn()?;
        let count = conn
            .query_row(
                "SELECT suppressed_count FROM rate_limit_state
                 WHERE session_id = ?1 AND notification_type = ?2",
                params![session_id, kind.as_str()],
                |row| row.get(0),
            )
            .optional()?
            .unwrap_or(0);
        Ok(count)
    }

    /// 清理超龄状态行，返回删除条数
    pub fn cleanup_old_state(&self, max_age_hours: Option<i64>) -> Result<usize> {
        let conn = self.store.conn()?;
        let max_age = max_age_hours.unwrap_or(self.config.state_ttl_hours);
        let cutoff = now_ts() - max_age * 3600;
        let deleted = conn.execute(
            "DELETE FROM rate_limit_state WHERE updated_at < ?1",
            params![cutoff],
        )?;
        Ok(deleted)
    }

    /// 重置某会话的全部限流状态
    pub fn reset_session(&self, session_id: &str) -> Result<()> {
        let conn = self.store.conn()?;
        conn.execute(
            "DELETE FROM rate_limit_state WHERE session_id = ?1",
            params![session_id],
        )?;
        Ok(())
    }

    fn increment_suppressed(
        &self,
        conn: &rusqlite::Connection,
        session_id: &str,
        kind: NotificationKind,
    ) -> Result<()> {
        conn.execute(
            "UPDATE rate_limit_state
             SET suppressed_count = suppressed_count + 1, updated_at = ?1
             WHERE session_id = ?2 AND notification_type = ?3",
            params![now_ts(), session_id, kind.as_str()],
        )?;
        Ok(())
    }
}

/// 载荷指纹：只取区分"同一个请求"的字段，sha256 前 16 位十六进制
pub fn hash_payload(payload: &Value) -> String {
    let mut relevant = serde_json::Map::new();
    for key in ["tool_name", "tool_input", "notification_type"] {
        if let Some(v) = payload.get(key) {
            if !v.is_null() {
                relevant.insert(key.to_string(), v.clone());
            }
        }
    }

    let canonical = Value::Object(relevant).to_string();
    let digest = Sha256::digest(canonical.as_bytes());
    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    hex[..16].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_util::temp_store;
    use serde_json::json;

    fn limiter() -> (tempfile::TempDir, RateLimiter) {
        let (dir, store) = temp_store();
        (dir, RateLimiter::new(store, RateLimitConfig::default()))
    }

    #[test]
    fn test_first_notification_allowed() {
        let (_dir, limiter) = limiter();
        let d = limiter
            .should_send("s1", NotificationKind::Permission, None)
            .unwrap();
        assert!(d.allowed);
        assert_eq!(d.reason, "first_notification");
    }

    #[test]
    fn test_cooldown_suppresses_then_counts() {
        let (_dir, limiter) = limiter();
        limiter.record_sent("s1", NotificationKind::Permission, None).unwrap();

        let d1 = limiter.should_send("s1", NotificationKind::Permission, None).unwrap();
        assert!(!d1.allowed);
        assert_eq!(d1.reason, "cooldown_active");
        assert_eq!(d1.suppressed_count, 1);
        assert!(d1.cooldown_remaining > 0 && d1.cooldown_remaining <= 30);

        let d2 = limiter.should_send("s1", NotificationKind::Permission, None).unwrap();
        assert_eq!(d2.suppressed_count, 2);
        assert_eq!(
            limiter.suppressed_count("s1", NotificationKind::Permission).unwrap(),
            2
        );
    }

    #[test]
    fn test_task_complete_never_limited() {
        let (_dir, limiter) = limiter();
        limiter.record_sent("s1", NotificationKind::TaskComplete, None).unwrap();

        let d = limiter.should_send("s1", NotificationKind::TaskComplete, None).unwrap();
        assert!(d.allowed);
        assert_eq!(d.reason, "no_cooldown");
    }

    #[test]
    fn test_disabled_always_allows() {
        let (_dir, store) = temp_store();
        let limiter = RateLimiter::new(
            store,
            RateLimitConfig {
                enabled: false,
                ..Default::default()
            },
        );
        limiter.record_sent("s1", NotificationKind::Permission, None).unwrap();
        let d = limiter.should_send("s1", NotificationKind::Permission, None).unwrap();
        assert!(d.allowed);
        assert_eq!(d.reason, "rate_limiting_disabled");
    }

    #[test]
    fn test_dedup_suppresses_identical_payload_after_cooldown() {
        let (_dir, store) = temp_store();
        let limiter = RateLimiter::new(
            store.clone(),
            RateLimitConfig {
                permission_cooldown_secs: 30,
                ..Default::default()
            },
        );

        let payload = json!({"tool_name": "Edit", "tool_input": {"file_path": "/a.rs"}});
        limiter.record_sent("s1", NotificationKind::Permission, Some(&payload)).unwrap();

        // 把冷却起点拨到过去，落在去重窗口内
        let conn = store.conn().unwrap();
        conn.execute(
            "UPDATE rate_limit_state SET last_sent_at = last_sent_at - 60",
            [],
        )
        .unwrap();

        let dup = limiter
            .should_send("s1", NotificationKind::Permission, Some(&payload))
            .unwrap();
        assert!(!dup.allowed);
        assert_eq!(dup.reason, "duplicate_suppressed");

        // 不同载荷放行
        let other = json!({"tool_name": "Bash", "tool_input": {"command": "ls"}});
        let d = limiter
            .should_send("s1", NotificationKind::Permission, Some(&other))
            .unwrap();
        assert!(d.allowed);
    }

    #[test]
    fn test_dedup_window_expiry() {
        let (_dir, store) = temp_store();
        let limiter = RateLimiter::new(store.clone(), RateLimitConfig::default());

        let payload = json!({"tool_name": "Edit"});
        limiter.record_sent("s1", NotificationKind::Permission, Some(&payload)).unwrap();

        // 冷却已过且载荷时间超出去重窗口
        let conn = store.conn().unwrap();
        conn.execute(
            "UPDATE rate_limit_state SET last_sent_at = last_sent_at - 400, last_payload_at = last_payload_at - 400",
            [],
        )
        .unwrap();

        let d = limiter
            .should_send("s1", NotificationKind::Permission, Some(&payload))
            .unwrap();
        assert!(d.allowed);
        assert_eq!(d.reason, "cooldown_expired");
    }

    #[test]
    fn test_record_sent_resets_suppressed_and_returns_prior() {
        let (_dir, store) = temp_store();
        let limiter = RateLimiter::new(store.clone(), RateLimitConfig::default());

        limiter.record_sent("s1", NotificationKind::Permission, None).unwrap();
        limiter.should_send("s1", NotificationKind::Permission, None).unwrap();
        limiter.should_send("s1", NotificationKind::Permission, None).unwrap();

        let prior = limiter.record_sent("s1", NotificationKind::Permission, None).unwrap();
        assert_eq!(prior, 2);
        assert_eq!(
            limiter.suppressed_count("s1", NotificationKind::Permission).unwrap(),
            0
        );
    }

    #[test]
    fn test_sessions_and_kinds_isolated() {
        let (_dir, limiter) = limiter();
        limiter.record_sent("s1", NotificationKind::Permission, None).unwrap();

        // 其他会话不受影响
        let d = limiter.should_send("s2", NotificationKind::Permission, None).unwrap();
        assert!(d.allowed);
        // 同会话其他类别不受影响
        let d = limiter.should_send("s1", NotificationKind::InputRequired, None).unwrap();
        assert!(d.allowed);
    }

    #[test]
    fn test_cleanup_and_reset() {
        let (_dir, store) = temp_store();
        let limiter = RateLimiter::new(store.clone(), RateLimitConfig::default());

        limiter.record_sent("s1", NotificationKind::Permission, None).unwrap();
        limiter.record_sent("s2", NotificationKind::Permission, None).unwrap();

        // 做旧 s1
        let conn = store.conn().unwrap();
        conn.execute(
            "UPDATE rate_limit_state SET updated_at = 0 WHERE session_id = 's1'",
            [],
        )
        .unwrap();

        assert_eq!(limiter.cleanup_old_state(None).unwrap(), 1);

        limiter.reset_session("s2").unwrap();
        let d = limiter.should_send("s2", NotificationKind::Permission, None).unwrap();
        assert_eq!(d.reason, "first_notification");
    }

    #[test]
    fn test_hash_payload_stable_and_selective() {
        let a = json!({"tool_name": "Edit", "tool_input": {"x": 1}, "extra": "ignored"});
        let b = json!({"tool_input": {"x": 1}, "tool_name": "Edit", "extra": "different"});
        assert_eq!(hash_payload(&a), hash_payload(&b));
        assert_eq!(hash_payload(&a).len(), 16);

        let c = json!({"tool_name": "Bash", "tool_input": {"x": 1}});
        assert_ne!(hash_payload(&a), hash_payload(&c));
    }
}
