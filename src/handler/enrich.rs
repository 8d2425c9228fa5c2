//! 上下文富化 - 附加到通知的项目/git/终端/token 信息
//!
//! 这里的所有探测都优雅降级：git 不存在、分离头指针、transcript 不可读
//! 都不能阻塞通知，每个探测自行吞掉失败并返回 Option。

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::debug;

use crate::sender::payload::SessionContext;
use crate::store::sessions::SessionMeta;

/// git 工作区快照
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitStatus {
    pub branch: String,
    pub staged: i64,
    pub modified: i64,
    pub untracked: i64,
}

/// 探测到的终端环境
#[derive(Debug, Clone)]
pub struct TerminalInfo {
    pub kind: String,
    pub info: String,
}

/// 从会话 transcript 读取的 token 统计
#[derive(Debug, Clone, Default)]
pub struct TokenUsage {
    pub input: i64,
    pub output: i64,
    pub cache_read: i64,
}

impl TokenUsage {
    /// 紧凑展示形式，如 "12.3k in / 840 out"
    pub fn display(&self) -> String {
        format!("{} in / {} out", humanize(self.input), humanize(self.output))
    }
}

fn humanize(n: i64) -> String {
    if n >= 1_000_000 {
        format!("{:.1}M", n as f64 / 1_000_000.0)
    } else if n >= 1_000 {
        format!("{:.1}k", n as f64 / 1_000.0)
    } else {
        n.to_string()
    }
}

/// 项目名：git 顶层目录名，退化为 cwd 的 basename
pub fn project_name(cwd: &str) -> String {
    if let Some(toplevel) = git_output(cwd, &["rev-parse", "--show-toplevel"]) {
        if let Some(name) = Path::new(&toplevel).file_name() {
            return name.to_string_lossy().into_owned();
        }
    }
    Path::new(cwd)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| cwd.to_string())
}

/// 分支 + staged/modified/untracked 计数。不在 git 仓库时返回 None。
pub fn git_status(cwd: &str) -> Option<GitStatus> {
    git_output(cwd, &["rev-parse", "--git-dir"])?;

    let branch = git_output(cwd, &["branch", "--show-current"])
        .filter(|b| !b.is_empty())
        .unwrap_or_else(|| "detached".to_string());

    let porcelain = git_output(cwd, &["status", "--porcelain"]).unwrap_or_default();
    let mut staged = 0;
    let mut modified = 0;
    let mut untracked = 0;
    for line in porcelain.lines() {
        if line.starts_with("M ") || line.starts_with("A ") || line.starts_with("D ") {
            staged += 1;
        } else if line.starts_with(" M") {
            modified += 1;
        } else if line.starts_with("??") {
            untracked += 1;
        }
    }

    Some(GitStatus {
        branch,
        staged,
        modified,
        untracked,
    })
}

fn git_output(cwd: &str, args: &[&str]) -> Option<String> {
    let output = Command::new("git").arg("-C").arg(cwd).args(args).output().ok()?;
    if !output.status.success() {
        return None;
    }
    Some(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// 探测承载会话的终端。tmux 优先：只有它能程序化切回。
pub fn detect_terminal() -> TerminalInfo {
    if std::env::var_os("TMUX").is_some() {
        let info = Command::new("tmux")
            .args(["display-message", "-p", "#S:#I.#P"])
            .output()
            .ok()
            .filter(|o| o.status.success())
            .map(|o| String::from_utf8_lossy(&o.stdout).trim().to_string())
            .unwrap_or_default();
        return TerminalInfo {
            kind: "tmux".to_string(),
            info,
        };
    }

    match std::env::var("TERM_PROGRAM").as_deref() {
        Ok("vscode") => TerminalInfo {
            kind: "vscode".to_string(),
            info: String::new(),
        },
        Ok("iTerm.app") => TerminalInfo {
            kind: "iterm".to_string(),
            info: String::new(),
        },
        _ => TerminalInfo {
            kind: "terminal".to_string(),
            info: String::new(),
        },
    }
}

/// 汇总 ~/.claude/projects 下会话 transcript 的 token 用量
pub fn token_usage(session_id: &str) -> Option<TokenUsage> {
    let projects_dir = dirs::home_dir()?.join(".claude").join("projects");
    let transcript = find_transcript(&projects_dir, &format!("{session_id}.jsonl"))?;
    token_usage_from_file(&transcript)
}

fn find_transcript(dir: &Path, filename: &str) -> Option<PathBuf> {
    let entries = fs::read_dir(dir).ok()?;
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            if let Some(found) = find_transcript(&path, filename) {
                return Some(found);
            }
        } else if path.file_name() == Some(std::ffi::OsStr::new(filename)) {
            return Some(path);
        }
    }
    None
}

fn token_usage_from_file(path: &Path) -> Option<TokenUsage> {
    let content = fs::read_to_string(path).ok()?;
    let mut usage = TokenUsage::default();
    for line in content.lines() {
        let Ok(data) = serde_json::from_str::<serde_json::Value>(line) else {
            continue;
        };
        let u = &data["message"]["usage"];
        if u.is_object() {
            usage.input += u["input_tokens"].as_i64().unwrap_or(0);
            usage.output += u["output_tokens"].as_i64().unwrap_or(0);
            usage.cache_read += u["cache_read_input_tokens"].as_i64().unwrap_or(0);
        }
    }
    // cache 读取计入输入侧
    usage.input += usage.cache_read;
    Some(usage)
}

/// 会话注册表用的元数据（终端信息由调用方探测后传入）
pub fn session_meta(cwd: &str, terminal: &TerminalInfo) -> SessionMeta {
    SessionMeta {
        project_name: Some(project_name(cwd)),
        git_branch: git_status(cwd).map(|g| g.branch),
        terminal_type: Some(terminal.kind.clone()),
        terminal_info: Some(terminal.info.clone()),
    }
}

/// 构建通知展示用的会话上下文
pub fn build_context(
    session_id: &str,
    cwd: &str,
    with_tokens: bool,
    terminal: &TerminalInfo,
) -> SessionContext {
    let mut ctx = SessionContext {
        project_name: Some(project_name(cwd)),
        ..Default::default()
    };

    if let Some(git) = git_status(cwd) {
        ctx.git_branch = Some(git.branch);
        ctx.git_staged = git.staged;
        ctx.git_modified = git.modified;
        ctx.git_untracked = git.untracked;
    }

    if terminal.kind == "tmux" && !terminal.info.is_empty() {
        ctx.switch_command = Some(format!("tmux switch-client -t '{}'", terminal.info));
    }
    ctx.terminal_info = if terminal.info.is_empty() {
        None
    } else {
        Some(terminal.info.clone())
    };
    ctx.terminal_type = Some(terminal.kind.clone());

    if with_tokens {
        if let Some(usage) = token_usage(session_id) {
            ctx.token_usage = Some(usage.display());
        } else {
            debug!(session_id, "No transcript found for token usage");
        }
    }

    ctx
}
