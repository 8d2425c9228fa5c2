//! 事件处理 - 校验、路由、富化、入队
//!
//! 入口协议：处理结果只通过返回值表达，handle 本身不发任何网络请求。
//! 被拒绝/跳过/抑制的事件都会留下审计记录，绝不进入投递队列。

pub mod enrich;
pub mod event;

use anyhow::Result;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::queue::{NotificationKind, NotificationQueue};
use crate::ratelimit::{RateLimitConfig, RateLimiter};
use crate::sender::payload::StoredPayload;
use crate::store::Store;

pub use event::{EventCommon, HookEvent, PromptKind, ValidationError};

/// 默认投递后端
pub const DEFAULT_BACKEND: &str = "slack";

/// 终端探测函数。可注入：tmux 判定依赖进程环境，测试需要确定性。
pub type TerminalProbe = Box<dyn Fn() -> enrich::TerminalInfo + Send + Sync>;

/// 事件处理结果
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum HandleOutcome {
    /// 已入队等待投递
    Queued { event_id: i64, notification_id: i64 },
    /// 仅存档，无需通知
    Stored { event_id: i64 },
    /// 被限流/去重抑制
    Suppressed { event_id: i64, reason: String },
    /// 策略关闭，跳过通知
    Skipped { reason: String },
    /// 载荷校验失败
    Rejected { error: String },
}

/// 事件处理器
pub struct EventHandler {
    store: Store,
    queue: NotificationQueue,
    limiter: RateLimiter,
    terminal: TerminalProbe,
}

impl EventHandler {
    pub fn new(store: Store) -> Self {
        Self::with_rate_limit(store, RateLimitConfig::default())
    }

    pub fn with_rate_limit(store: Store, config: RateLimitConfig) -> Self {
        Self {
            queue: NotificationQueue::new(store.clone()),
            limiter: RateLimiter::new(store.clone(), config),
            store,
            terminal: Box::new(enrich::detect_terminal),
        }
    }

    /// 替换终端探测（默认探测当前进程环境）
    pub fn with_terminal_probe(mut self, probe: TerminalProbe) -> Self {
        self.terminal = probe;
        self
    }

    /// 处理一条入站 hook 事件
    pub fn handle(&self, payload: &Value) -> Result<HandleOutcome> {
        let event = match HookEvent::parse(payload) {
            Ok(event) => event,
            Err(e) => {
                let session_id = payload
                    .get("session_id")
                    .and_then(|v| v.as_str())
                    .map(|s| s.to_string());
                warn!(error = %e, "Rejected hook event");
                self.store.log_audit(
                    session_id.as_deref(),
                    "event_rejected",
                    Some(&json!({"error": e.to_string()})),
                )?;
                return Ok(HandleOutcome::Rejected {
                    error: e.to_string(),
                });
            }
        };

        let session_id = event.session_id().to_string();
        let cwd = event.cwd().to_string();

        // 登记会话并刷新活跃时间
        let terminal = (self.terminal)();
        let meta = enrich::session_meta(&cwd, &terminal);
        self.store.upsert_session(&session_id, &cwd, &meta)?;

        info!(
            event_type = event.event_type(),
            session = %session_serial(&session_id),
            "Processing hook event"
        );

        match event {
            HookEvent::Notification { prompt, .. } => {
                self.handle_notification(&session_id, &cwd, prompt, payload, &terminal)
            }
            HookEvent::Stop { .. } => self.handle_stop(&session_id, &cwd, payload, &terminal),
            HookEvent::PreToolUse { .. } => {
                let event_id =
                    self.store.insert_event(&session_id, "pre_tool_use", payload)?;
                self.store.mark_event_processed(event_id)?;
                Ok(HandleOutcome::Stored { event_id })
            }
            HookEvent::PostToolUse { ref tool_name, .. } => {
                // 只跟踪 AskUserQuestion（代表会话进入等待输入状态）
                if tool_name != "AskUserQuestion" {
                    return Ok(HandleOutcome::Skipped {
                        reason: format!("tool not tracked: {tool_name}"),
                    });
                }
                let event_id =
                    self.store.insert_event(&session_id, "post_tool_use", payload)?;
                self.store.set_session_idle(&session_id, true)?;
                self.store.mark_event_processed(event_id)?;
                Ok(HandleOutcome::Stored { event_id })
            }
        }
    }

    fn handle_notification(
        &self,
        session_id: &str,
        cwd: &str,
        prompt: PromptKind,
        payload: &Value,
        terminal: &enrich::TerminalInfo,
    ) -> Result<HandleOutcome> {
        if prompt == PromptKind::Idle {
            self.store.set_session_idle(session_id, true)?;
        }

        let event_id = self.store.insert_event(session_id, "notification", payload)?;
        let kind = prompt.notification_kind();

        let outcome =
            self.queue_if_allowed(event_id, session_id, cwd, kind, payload, false, terminal)?;
        self.store.mark_event_processed(event_id)?;
        Ok(outcome)
    }

    fn handle_stop(
        &self,
        session_id: &str,
        cwd: &str,
        payload: &Value,
        terminal: &enrich::TerminalInfo,
    ) -> Result<HandleOutcome> {
        let event_id = self.store.insert_event(session_id, "stop", payload)?;

        let session = self.store.get_session(session_id)?;
        self.store.end_session(session_id)?;
        self.store.log_audit(
            Some(session_id),
            "session_stopped",
            Some(&json!({"event_id": event_id, "cwd": cwd})),
        )?;

        // Stop 只在能切回会话（tmux）或显式要求时才打扰用户
        let in_tmux = session
            .and_then(|s| s.terminal_type)
            .is_some_and(|t| t == "tmux");
        let notify_always = self.store.get_config_bool("notify_always", false)?;
        if !in_tmux && !notify_always {
            self.store.mark_event_processed(event_id)?;
            return Ok(HandleOutcome::Skipped {
                reason: "not in tmux and notify_always=false".to_string(),
            });
        }

        let outcome = self.queue_if_allowed(
            event_id,
            session_id,
            cwd,
            NotificationKind::TaskComplete,
            payload,
            true,
            terminal,
        )?;
        self.store.mark_event_processed(event_id)?;
        Ok(outcome)
    }

    /// 策略与限流都放行后才入队
    #[allow(clippy::too_many_arguments)]
    fn queue_if_allowed(
        &self,
        event_id: i64,
        session_id: &str,
        cwd: &str,
        kind: NotificationKind,
        payload: &Value,
        with_tokens: bool,
        terminal: &enrich::TerminalInfo,
    ) -> Result<HandleOutcome> {
        if !self.notifications_enabled(kind)? {
            self.store.log_audit(
                Some(session_id),
                "notification_skipped",
                Some(&json!({"event_id": event_id, "kind": kind})),
            )?;
            return Ok(HandleOutcome::Skipped {
                reason: format!("{kind} notifications disabled"),
            });
        }

        let decision = self.limiter.should_send(session_id, kind, Some(payload))?;
        if !decision.allowed {
            self.store.log_audit(
                Some(session_id),
                "notification_suppressed",
                Some(&json!({
                    "event_id": event_id,
                    "kind": kind,
                    "reason": decision.reason,
                    "suppressed_count": decision.suppressed_count,
                })),
            )?;
            return Ok(HandleOutcome::Suppressed {
                event_id,
                reason: decision.reason.to_string(),
            });
        }

        let context = enrich::build_context(session_id, cwd, with_tokens, terminal);
        let stored = StoredPayload {
            kind,
            event_data: payload.clone(),
            context,
            suppressed_count: decision.suppressed_count,
        };
        let notification_id = self.queue.enqueue(
            kind,
            &serde_json::to_value(&stored)?,
            session_id,
            DEFAULT_BACKEND,
            Some(event_id),
        )?;
        self.limiter.record_sent(session_id, kind, Some(payload))?;

        self.store.log_audit(
            Some(session_id),
            "notification_queued",
            Some(&json!({
                "event_id": event_id,
                "notification_id": notification_id,
                "kind": kind,
            })),
        )?;

        Ok(HandleOutcome::Queued {
            event_id,
            notification_id,
        })
    }

    fn notifications_enabled(&self, kind: NotificationKind) -> Result<bool> {
        if !self.store.get_config_bool("enabled", true)? {
            return Ok(false);
        }
        self.store
            .get_config_bool(&format!("notify_on_{}", kind.as_str()), true)
    }
}

/// 日志里只显示会话尾号
fn session_serial(session_id: &str) -> &str {
    let len = session_id.chars().count();
    if len <= 4 {
        return session_id;
    }
    match session_id.char_indices().nth(len - 4) {
        Some((idx, _)) => &session_id[idx..],
        None => session_id,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::enrich::TerminalInfo;
    use crate::queue::NotificationStatus;
    use crate::store::test_util::temp_store;
    use serde_json::json;
    use tempfile::TempDir;

    fn probe(kind: &str, info: &str) -> TerminalProbe {
        let kind = kind.to_string();
        let info = info.to_string();
        Box::new(move || TerminalInfo {
            kind: kind.clone(),
            info: info.clone(),
        })
    }

    // 固定终端探测结果，tmux 判定不随测试进程的环境漂移
    fn handler() -> (TempDir, EventHandler) {
        let (dir, store) = temp_store();
        let handler = EventHandler::new(store).with_terminal_probe(probe("terminal", ""));
        (dir, handler)
    }

    fn permission_payload(dir: &TempDir, session: &str, command: &str) -> Value {
        json!({
            "hook_event_name": "Notification",
            "notification_type": "permission_prompt",
            "session_id": session,
            "cwd": dir.path().to_str().unwrap(),
            "tool_name": "Bash",
            "tool_input": {"command": command}
        })
    }

    fn stop_payload(dir: &TempDir, session: &str) -> Value {
        json!({
            "hook_event_name": "Stop",
            "session_id": session,
            "cwd": dir.path().to_str().unwrap()
        })
    }

    #[test]
    fn test_permission_event_queues_notification() {
        let (dir, handler) = handler();
        let outcome = handler.handle(&permission_payload(&dir, "sess-abcd", "ls")).unwrap();

        let HandleOutcome::Queued { event_id, notification_id } = outcome else {
            panic!("expected Queued, got {outcome:?}");
        };

        // 事件已存档并标记处理
        let event = handler.store.get_event(event_id).unwrap().unwrap();
        assert_eq!(event.event_type, "notification");
        assert!(event.processed_at.is_some());

        // 通知 pending，payload 可回读
        let n = handler.queue.get(notification_id).unwrap().unwrap();
        assert_eq!(n.status, NotificationStatus::Pending);
        assert_eq!(n.event_id, Some(event_id));
        let stored: StoredPayload = serde_json::from_value(n.payload).unwrap();
        assert_eq!(stored.kind, NotificationKind::Permission);
        assert_eq!(stored.event_data["tool_input"]["command"], "ls");

        // 会话已登记
        let session = handler.store.get_session("sess-abcd").unwrap().unwrap();
        assert!(session.project_name.is_some());

        // 审计
        let audit = handler.store.get_audit_by_action("notification_queued").unwrap();
        assert_eq!(audit.len(), 1);
    }

    #[test]
    fn test_second_permission_suppressed_by_cooldown() {
        let (dir, handler) = handler();
        handler.handle(&permission_payload(&dir, "s1", "ls")).unwrap();

        let outcome = handler.handle(&permission_payload(&dir, "s1", "pwd")).unwrap();
        let HandleOutcome::Suppressed { reason, .. } = outcome else {
            panic!("expected Suppressed, got {outcome:?}");
        };
        assert_eq!(reason, "cooldown_active");

        // 队列里仍只有一条
        assert_eq!(handler.queue.stats(None).unwrap().total, 1);
        let audit = handler.store.get_audit_by_action("notification_suppressed").unwrap();
        assert_eq!(audit.len(), 1);
    }

    #[test]
    fn test_disabled_config_skips() {
        let (dir, handler) = handler();
        handler.store.set_config("enabled", "false").unwrap();

        let outcome = handler.handle(&permission_payload(&dir, "s1", "ls")).unwrap();
        assert!(matches!(outcome, HandleOutcome::Skipped { .. }));
        assert_eq!(handler.queue.stats(None).unwrap().total, 0);

        // 按类别关闭
        handler.store.set_config("enabled", "true").unwrap();
        handler.store.set_config("notify_on_permission", "false").unwrap();
        let outcome = handler.handle(&permission_payload(&dir, "s2", "ls")).unwrap();
        assert!(matches!(outcome, HandleOutcome::Skipped { .. }));
    }

    #[test]
    fn test_invalid_payload_rejected_and_audited() {
        let (_dir, handler) = handler();
        let outcome = handler
            .handle(&json!({"hook_event_name": "Stop", "session_id": "s1"}))
            .unwrap();

        let HandleOutcome::Rejected { error } = outcome else {
            panic!("expected Rejected, got {outcome:?}");
        };
        assert!(error.contains("cwd"));

        // 审计记录了拒绝，队列和事件表都是空的
        let audit = handler.store.get_audit_by_action("event_rejected").unwrap();
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].session_id.as_deref(), Some("s1"));
        assert_eq!(handler.queue.stats(None).unwrap().total, 0);
        assert!(handler.store.get_unprocessed_events().unwrap().is_empty());
    }

    #[test]
    fn test_stop_skipped_outside_tmux() {
        let (dir, handler) = handler();
        let outcome = handler.handle(&stop_payload(&dir, "s1")).unwrap();

        assert!(matches!(outcome, HandleOutcome::Skipped { .. }));
        // 会话仍被标记结束
        let session = handler.store.get_session("s1").unwrap().unwrap();
        assert!(session.ended_at.is_some());
        // 事件仍存档
        let events = handler.store.get_events_by_session("s1").unwrap();
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn test_stop_inside_tmux_queues_without_notify_always() {
        let (dir, store) = temp_store();
        let handler =
            EventHandler::new(store).with_terminal_probe(probe("tmux", "main:1.0"));

        let outcome = handler.handle(&stop_payload(&dir, "s1")).unwrap();
        let HandleOutcome::Queued { notification_id, .. } = outcome else {
            panic!("expected Queued, got {outcome:?}");
        };

        let n = handler.queue.get(notification_id).unwrap().unwrap();
        let stored: StoredPayload = serde_json::from_value(n.payload).unwrap();
        assert_eq!(stored.kind, NotificationKind::TaskComplete);
        assert_eq!(
            stored.context.switch_command.as_deref(),
            Some("tmux switch-client -t 'main:1.0'")
        );
    }

    #[test]
    fn test_stop_with_notify_always_queues_task_complete() {
        let (dir, handler) = handler();
        handler.store.set_config("notify_always", "true").unwrap();

        let outcome = handler.handle(&stop_payload(&dir, "s1")).unwrap();
        let HandleOutcome::Queued { notification_id, .. } = outcome else {
            panic!("expected Queued, got {outcome:?}");
        };

        let n = handler.queue.get(notification_id).unwrap().unwrap();
        let stored: StoredPayload = serde_json::from_value(n.payload).unwrap();
        assert_eq!(stored.kind, NotificationKind::TaskComplete);

        let audit = handler.store.get_audit_by_action("session_stopped").unwrap();
        assert_eq!(audit.len(), 1);
    }

    #[test]
    fn test_idle_prompt_marks_session_idle() {
        let (dir, handler) = handler();
        let outcome = handler
            .handle(&json!({
                "hook_event_name": "Notification",
                "notification_type": "idle_prompt",
                "session_id": "s1",
                "cwd": dir.path().to_str().unwrap()
            }))
            .unwrap();

        assert!(matches!(outcome, HandleOutcome::Queued { .. }));
        assert!(handler.store.get_session("s1").unwrap().unwrap().is_idle);
    }

    #[test]
    fn test_pre_tool_use_stored_only() {
        let (dir, handler) = handler();
        let outcome = handler
            .handle(&json!({
                "hook_event_name": "PreToolUse",
                "session_id": "s1",
                "cwd": dir.path().to_str().unwrap(),
                "tool_name": "Bash",
                "tool_input": {"command": "ls"}
            }))
            .unwrap();

        assert!(matches!(outcome, HandleOutcome::Stored { .. }));
        assert_eq!(handler.queue.stats(None).unwrap().total, 0);
    }

    #[test]
    fn test_post_tool_use_tracks_ask_user_question_only() {
        let (dir, handler) = handler();

        let ask = handler
            .handle(&json!({
                "hook_event_name": "PostToolUse",
                "session_id": "s1",
                "cwd": dir.path().to_str().unwrap(),
                "tool_name": "AskUserQuestion"
            }))
            .unwrap();
        assert!(matches!(ask, HandleOutcome::Stored { .. }));
        assert!(handler.store.get_session("s1").unwrap().unwrap().is_idle);

        let other = handler
            .handle(&json!({
                "hook_event_name": "PostToolUse",
                "session_id": "s1",
                "cwd": dir.path().to_str().unwrap(),
                "tool_name": "Bash"
            }))
            .unwrap();
        assert!(matches!(other, HandleOutcome::Skipped { .. }));
        // Bash 的 PostToolUse 不存档
        assert_eq!(handler.store.get_events_by_session("s1").unwrap().len(), 1);
    }
}
