//! Slack Block Kit payload 构建 - 纯函数，便于测试
//!
//! 队列里存的是结构化数据（事件 + 上下文），Block Kit 格式在发送时才构建，
//! 这样格式调整不影响已入队的通知。

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::Path;

use crate::queue::NotificationKind;

/// 入队时落库的结构化 payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredPayload {
    pub kind: NotificationKind,
    #[serde(default)]
    pub event_data: Value,
    #[serde(default)]
    pub context: SessionContext,
    #[serde(default)]
    pub suppressed_count: i64,
}

/// 通知展示用的会话上下文（由事件处理阶段富化）
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionContext {
    pub project_name: Option<String>,
    pub git_branch: Option<String>,
    pub git_staged: i64,
    pub git_modified: i64,
    pub git_untracked: i64,
    pub terminal_type: Option<String>,
    pub terminal_info: Option<String>,
    pub switch_command: Option<String>,
    pub task_description: Option<String>,
    pub token_usage: Option<String>,
}

/// 从落库 payload 构建 webhook 请求体
pub fn build_webhook_payload(stored: &StoredPayload) -> Value {
    match stored.kind {
        NotificationKind::Permission => build_permission_payload(stored),
        NotificationKind::TaskComplete => build_task_complete_payload(stored),
        NotificationKind::InputRequired => build_input_required_payload(stored),
    }
}

/// 权限请求通知
fn build_permission_payload(stored: &StoredPayload) -> Value {
    let ctx = &stored.context;
    let tool_name = stored.event_data["tool_name"].as_str().unwrap_or("Unknown");
    let tool_input = &stored.event_data["tool_input"];
    let session_id = stored.event_data["session_id"].as_str().unwrap_or("unknown");
    let project_name = ctx.project_name.as_deref().unwrap_or("project");

    let mut blocks = vec![
        header_block(&format!("🔔 {project_name}: Permission Required")),
        section_block(&format_tool_details(tool_name, tool_input)),
    ];
    push_switch_command(&mut blocks, ctx);

    let mut footer = Vec::new();
    if ctx.git_branch.is_some() {
        footer.push(format_git_summary(ctx));
    }
    if let Some(terminal) = &ctx.terminal_type {
        footer.push(terminal.clone());
    }
    footer.push(format!("#{}", session_serial(session_id)));
    if stored.suppressed_count > 0 {
        footer.push(format!("+{} suppressed", stored.suppressed_count));
    }
    blocks.push(context_block(&footer.join(" | ")));

    let mut fallback = format!("{project_name}: {tool_name} permission required");
    if stored.suppressed_count > 0 {
        fallback.push_str(&format!(" (+{} suppressed)", stored.suppressed_count));
    }

    json!({ "text": fallback, "blocks": blocks })
}

/// 任务完成通知
fn build_task_complete_payload(stored: &StoredPayload) -> Value {
    let ctx = &stored.context;
    let session_id = stored.event_data["session_id"].as_str().unwrap_or("unknown");
    let project_name = ctx.project_name.as_deref().unwrap_or("project");
    let task = truncate_chars(
        ctx.task_description.as_deref().unwrap_or("Task completed"),
        150,
    );

    let mut summary = vec![format!("*Task:* {task}")];
    if let Some(tokens) = &ctx.token_usage {
        summary.push(format!("*Tokens:* {tokens}"));
    }
    if ctx.git_branch.is_some() {
        summary.push(format!("*Git:* {}", format_git_summary(ctx)));
    }

    let mut blocks = vec![
        header_block(&format!("✅ {project_name}: Task Complete")),
        section_block(&summary.join("\n")),
    ];
    push_switch_command(&mut blocks, ctx);

    let mut footer = Vec::new();
    if let Some(terminal) = &ctx.terminal_type {
        footer.push(terminal.clone());
    }
    footer.push(format!("#{}", session_serial(session_id)));
    blocks.push(context_block(&footer.join(" | ")));

    json!({ "text": format!("{project_name}: Task complete"), "blocks": blocks })
}

/// 等待输入通知
fn build_input_required_payload(stored: &StoredPayload) -> Value {
    let ctx = &stored.context;
    let session_id = stored.event_data["session_id"].as_str().unwrap_or("unknown");
    let project_name = ctx.project_name.as_deref().unwrap_or("project");

    let mut blocks = vec![
        header_block(&format!("⏸️ {project_name}: Waiting for Input")),
        section_block("Claude is waiting for your response."),
    ];
    push_switch_command(&mut blocks, ctx);

    let mut footer = Vec::new();
    if let Some(terminal) = &ctx.terminal_type {
        footer.push(terminal.clone());
    }
    footer.push(format!("#{}", session_serial(session_id)));
    if stored.suppressed_count > 0 {
        footer.push(format!("+{} suppressed", stored.suppressed_count));
    }
    blocks.push(context_block(&footer.join(" | ")));

    let mut fallback = format!("{project_name}: Waiting for input");
    if stored.suppressed_count > 0 {
        fallback.push_str(&format!(" (+{} suppressed)", stored.suppressed_count));
    }

    json!({ "text": fallback, "blocks": blocks })
}

/// 工具细节格式化（按工具类型展示关键参数）
fn format_tool_details(tool_name: &str, tool_input: &Value) -> String {
    match tool_name {
        "Edit" => match tool_input["file_path"].as_str().filter(|p| !p.is_empty()) {
            Some(path) => {
                let (filename, dirname) = split_path(path);
                let dirname = shorten_tail(&dirname, 50);
                format!("*Edit Permission*\n📄 File: `{filename}`\n📁 Path: `{dirname}`")
            }
            None => "*Edit Permission*\nWaiting for approval".to_string(),
        },
        "Bash" => match tool_input["command"].as_str().filter(|c| !c.is_empty()) {
            Some(command) => {
                let command = truncate_chars(command, 100);
                format!("*Bash Permission*\n💻 Command: `{command}`")
            }
            None => "*Bash Permission*\nWaiting for approval".to_string(),
        },
        "WebFetch" => match tool_input["url"].as_str().filter(|u| !u.is_empty()) {
            Some(url) => format!("*Web Access Permission*\n🌐 URL: {url}"),
            None => "*Web Access Permission*\nWaiting for approval".to_string(),
        },
        "Task" => match tool_input["subagent_type"].as_str().filter(|s| !s.is_empty()) {
            Some(subagent) => {
                let description =
                    truncate_chars(tool_input["description"].as_str().unwrap_or(""), 100);
                format!("*Agent Task Permission*\n🤖 Agent: {subagent}\n📋 Task: {description}")
            }
            None => "*Task Permission*\nWaiting for approval".to_string(),
        },
        "Write" => match tool_input["file_path"].as_str().filter(|p| !p.is_empty()) {
            Some(path) => {
                let (filename, _) = split_path(path);
                format!("*Write Permission*\n📄 File: `{filename}`")
            }
            None => "*Write Permission*\nWaiting for approval".to_string(),
        },
        "Read" => match tool_input["file_path"].as_str().filter(|p| !p.is_empty()) {
            Some(path) => {
                let (filename, _) = split_path(path);
                format!("*Read Permission*\n📄 File: `{filename}`")
            }
            None => "*Read Permission*\nWaiting for approval".to_string(),
        },
        other => format!("*{other} Permission*\n⚠️ Waiting for approval"),
    }
}

/// git 状态摘要: "branch | S:n M:n U:n"（全零时只显示分支）
fn format_git_summary(ctx: &SessionContext) -> String {
    let branch = ctx.git_branch.as_deref().unwrap_or("");
    if ctx.git_staged == 0 && ctx.git_modified == 0 && ctx.git_untracked == 0 {
        return branch.to_string();
    }
    format!(
        "{branch} | S:{} M:{} U:{}",
        ctx.git_staged, ctx.git_modified, ctx.git_untracked
    )
}

/// 会话序号: session_id 末 4 位
fn session_serial(session_id: &str) -> &str {
    let len = session_id.chars().count();
    if len <= 4 {
        return session_id;
    }
    let (idx, _) = session_id.char_indices().nth(len - 4).unwrap_or((0, ' '));
    &session_id[idx..]
}

fn header_block(text: &str) -> Value {
    json!({ "type": "header", "text": { "type": "plain_text", "text": text } })
}

fn section_block(text: &str) -> Value {
    json!({ "type": "section", "text": { "type": "mrkdwn", "text": text } })
}

fn context_block(text: &str) -> Value {
    json!({ "type": "context", "elements": [{ "type": "mrkdwn", "text": text }] })
}

fn push_switch_command(blocks: &mut Vec<Value>, ctx: &SessionContext) {
    if let Some(cmd) = &ctx.switch_command {
        blocks.push(section_block(&format!("```{cmd}```")));
    }
}

fn split_path(path: &str) -> (String, String) {
    let p = Path::new(path);
    let filename = p
        .file_name()
        .map(|f| f.to_string_lossy().into_owned())
        .unwrap_or_default();
    let dirname = p
        .parent()
        .map(|d| d.to_string_lossy().into_owned())
        .unwrap_or_default();
    (filename, dirname)
}

/// 按字符数截断，超长时末尾加省略号
fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let truncated: String = s.chars().take(max.saturating_sub(3)).collect();
    format!("{truncated}...")
}

/// 保留尾部 max-3 个字符，前面加省略号（用于长目录路径）
fn shorten_tail(s: &str, max: usize) -> String {
    let count = s.chars().count();
    if count <= max {
        return s.to_string();
    }
    let tail: String = s.chars().skip(count - (max - 3)).collect();
    format!("...{tail}")
}
