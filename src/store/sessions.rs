//! 会话注册表 - 跟踪产生事件的逻辑会话生命周期

use anyhow::{bail, Result};
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use super::{now_ts, Store};

/// 会话记录
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub project_name: Option<String>,
    pub cwd: String,
    pub git_branch: Option<String>,
    pub terminal_type: Option<String>,
    pub terminal_info: Option<String>,
    pub started_at: i64,
    pub last_activity_at: i64,
    pub ended_at: Option<i64>,
    pub is_idle: bool,
}

impl Session {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            session_id: row.get("session_id")?,
            project_name: row.get("project_name")?,
            cwd: row.get("cwd")?,
            git_branch: row.get("git_branch")?,
            terminal_type: row.get("terminal_type")?,
            terminal_info: row.get("terminal_info")?,
            started_at: row.get("started_at")?,
            last_activity_at: row.get("last_activity_at")?,
            ended_at: row.get("ended_at")?,
            is_idle: row.get::<_, i64>("is_idle")? != 0,
        })
    }
}

/// 新建/更新会话时的元数据
#[derive(Debug, Clone, Default)]
pub struct SessionMeta {
    pub project_name: Option<String>,
    pub git_branch: Option<String>,
    pub terminal_type: Option<String>,
    pub terminal_info: Option<String>,
}

impl Store {
    /// 创建会话，session_id 已存在时报错（需要 create-or-update 用 upsert_session）
    pub fn create_session(&self, session_id: &str, cwd: &str, meta: &SessionMeta) -> Result<()> {
        let conn = self.conn()?;
        let now = now_ts();
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO sessions
             (session_id, cwd, project_name, git_branch, terminal_type, terminal_info,
              started_at, last_activity_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                session_id,
                cwd,
                meta.project_name,
                meta.git_branch,
                meta.terminal_type,
                meta.terminal_info,
                now,
                now
            ],
        )?;
        if inserted == 0 {
            bail!("Session already exists: {session_id}");
        }
        Ok(())
    }

    /// 创建或更新会话（并发 upsert 安全，刷新 last_activity_at）
    pub fn upsert_session(&self, session_id: &str, cwd: &str, meta: &SessionMeta) -> Result<()> {
        let conn = self.conn()?;
        let now = now_ts();
        conn.execute(
            "INSERT INTO sessions
             (session_id, cwd, project_name, git_branch, terminal_type, terminal_info,
              started_at, last_activity_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(session_id) DO UPDATE SET
                 cwd = excluded.cwd,
                 project_name = COALESCE(excluded.project_name, project_name),
                 git_branch = COALESCE(excluded.git_branch, git_branch),
                 terminal_type = COALESCE(excluded.terminal_type, terminal_type),
                 terminal_info = COALESCE(excluded.terminal_info, terminal_info),
                 last_activity_at = excluded.last_activity_at",
            params![
                session_id,
                cwd,
                meta.project_name,
                meta.git_branch,
                meta.terminal_type,
                meta.terminal_info,
                now,
                now
            ],
        )?;
        Ok(())
    }

    /// 查询会话
    pub fn get_session(&self, session_id: &str) -> Result<Option<Session>> {
        let conn = self.conn()?;
        let session = conn
            .query_row(
                "SELECT * FROM sessions WHERE session_id = ?1",
                params![session_id],
                Session::from_row,
            )
            .optional()?;
        Ok(session)
    }

    /// 刷新 last_activity_at
    pub fn update_session_activity(&self, session_id: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE sessions SET last_activity_at = ?1 WHERE session_id = ?2",
            params![now_ts(), session_id],
        )?;
        Ok(())
    }

    /// 设置空闲标记
    pub fn set_session_idle(&self, session_id: &str, is_idle: bool) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE sessions SET is_idle = ?1 WHERE session_id = ?2",
            params![is_idle as i64, session_id],
        )?;
        Ok(())
    }

    /// 标记会话结束（ended_at 只设置一次）
    pub fn end_session(&self, session_id: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE sessions SET ended_at = ?1 WHERE session_id = ?2 AND ended_at IS NULL",
            params![now_ts(), session_id],
        )?;
        Ok(())
    }

    /// 所有活跃会话（ended_at IS NULL）
    pub fn get_active_sessions(&self) -> Result<Vec<Session>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM sessions WHERE ended_at IS NULL ORDER BY started_at DESC",
        )?;
        let sessions = stmt
            .query_map([], Session::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(sessions)
    }
}
