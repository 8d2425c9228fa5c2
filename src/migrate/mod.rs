//! V1 迁移 - 一次性把旧版 JSON 文件状态导入 SQLite
//!
//! V1 用明文的 slack-config.json、按会话记状态的 notification_states.json
//! 和 tool_requests/ 目录下的原始载荷文件保存状态。导入是幂等的：
//! 完成后写入标记配置，重复执行是 no-op。源文件保持不动。

use anyhow::{Context, Result};
use rusqlite::params;
use serde_json::Value;
use std::fs;
use std::path::PathBuf;
use tracing::{info, warn};

use crate::store::sessions::SessionMeta;
use crate::store::{now_ts, Store};
use crate::vault::Vault;

/// 迁移完成后写入的标记键
pub const MIGRATED_KEY: &str = "v1_migrated";

/// V1 状态文件的位置
#[derive(Debug, Clone)]
pub struct V1Paths {
    pub config: PathBuf,
    pub states: PathBuf,
    pub tool_requests: PathBuf,
}

impl Default for V1Paths {
    fn default() -> Self {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        let claude = home.join(".claude");
        Self {
            config: claude.join("config").join("slack-config.json"),
            states: claude.join("state").join("notification_states.json"),
            tool_requests: claude.join("state").join("tool_requests"),
        }
    }
}

/// 迁移实际导入的内容
#[derive(Debug, Default, Clone, serde::Serialize)]
pub struct MigrationReport {
    pub already_migrated: bool,
    pub config_keys: usize,
    pub sessions: usize,
    pub tool_requests: usize,
}

/// 导入 V1 状态，可重复调用
pub fn migrate_v1(store: &Store, vault: &Vault, paths: &V1Paths) -> Result<MigrationReport> {
    if store.get_config(MIGRATED_KEY)?.as_deref() == Some("true") {
        return Ok(MigrationReport {
            already_migrated: true,
            ..Default::default()
        });
    }

    let mut report = MigrationReport::default();
    report.config_keys = import_config(store, vault, paths)?;
    report.sessions = import_states(store, paths)?;
    report.tool_requests = import_tool_requests(store, paths)?;

    store.set_config(MIGRATED_KEY, "true")?;
    info!(
        config_keys = report.config_keys,
        sessions = report.sessions,
        tool_requests = report.tool_requests,
        "V1 migration complete"
    );
    Ok(report)
}

fn import_config(store: &Store, vault: &Vault, paths: &V1Paths) -> Result<usize> {
    let Some(config) = read_json(&paths.config)? else {
        return Ok(0);
    };
    let mut imported = 0;

    // V1 的 webhook URL 是明文存储，导入时加密
    if let Some(url) = config["webhook_url"].as_str().filter(|u| !u.is_empty()) {
        store.set_config_encrypted("webhook_url", url, vault)?;
        imported += 1;
    }

    if let Some(enabled) = config["enabled"].as_bool() {
        store.set_config("enabled", bool_str(enabled))?;
        imported += 1;
    }

    let notify_on = &config["notify_on"];
    for (v1_key, key) in [
        ("permission_required", "notify_on_permission"),
        ("task_complete", "notify_on_task_complete"),
        ("input_required", "notify_on_input_required"),
    ] {
        if let Some(value) = notify_on[v1_key].as_bool() {
            store.set_config(key, bool_str(value))?;
            imported += 1;
        }
    }

    if let Some(always) = config["notify_always"].as_bool() {
        store.set_config("notify_always", bool_str(always))?;
        imported += 1;
    }

    Ok(imported)
}

fn import_states(store: &Store, paths: &V1Paths) -> Result<usize> {
    let Some(states) = read_json(&paths.states)? else {
        return Ok(0);
    };

    // 文件可能是单个状态对象，也可能是按会话 ID 为键的映射
    let entries: Vec<Value> = if states.get("session_id").is_some() {
        vec![states]
    } else if let Some(map) = states.as_object() {
        map.values().cloned().collect()
    } else if let Some(list) = states.as_array() {
        list.clone()
    } else {
        return Ok(0);
    };

    let mut imported = 0;
    for state in entries {
        let Some(session_id) = state["session_id"].as_str().filter(|s| !s.is_empty()) else {
            continue;
        };
        let cwd = state["cwd"].as_str().unwrap_or("/unknown");

        let mut meta = SessionMeta::default();
        if state["in_tmux"].as_bool() == Some(true) {
            meta.terminal_type = Some("tmux".to_string());
            meta.terminal_info = state["tmux_info"].as_str().map(|s| s.to_string());
        }
        store.upsert_session(session_id, cwd, &meta)?;

        if let Some(last) = state["last_notification_time"].as_i64() {
            let conn = store.conn()?;
            conn.execute(
                "UPDATE sessions SET last_activity_at = ?1 WHERE session_id = ?2",
                params![last, session_id],
            )?;
        }
        if state["is_waiting_for_input"].as_bool() == Some(true) {
            store.set_session_idle(session_id, true)?;
        }
        imported += 1;
    }
    Ok(imported)
}

fn import_tool_requests(store: &Store, paths: &V1Paths) -> Result<usize> {
    let Ok(entries) = fs::read_dir(&paths.tool_requests) else {
        return Ok(0);
    };

    let mut imported = 0;
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let Ok(Some(request)) = read_json(&path) else {
            warn!(path = %path.display(), "Skipping unreadable V1 tool request");
            continue;
        };

        let session_id = request["session_id"].as_str().unwrap_or("v1-unknown");
        let created_at = request["timestamp"].as_i64().unwrap_or_else(now_ts);

        // 历史事件落库即标记已处理
        let conn = store.conn()?;
        conn.execute(
            "INSERT INTO events (session_id, event_type, hook_payload, created_at, processed_at)
             VALUES (?1, 'pre_tool_use', ?2, ?3, ?3)",
            params![session_id, request.to_string(), created_at],
        )?;
        imported += 1;
    }
    Ok(imported)
}

fn read_json(path: &std::path::Path) -> Result<Option<Value>> {
    if !path.exists() {
        return Ok(None);
    }
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let value = serde_json::from_str(&content)
        .with_context(|| format!("Invalid JSON in {}", path.display()))?;
    Ok(Some(value))
}

fn bool_str(b: bool) -> &'static str {
    if b {
        "true"
    } else {
        "false"
    }
}
