//! Hook 事件解析与校验
//!
//! 入站事件是闭合枚举：未知的 hook 名或通知类型在入口处被拒绝，
//! 不会以"未知字符串"的形态流进队列。

use serde_json::Value;
use thiserror::Error;

use crate::queue::NotificationKind;

/// 载荷校验失败
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Payload is not a JSON object")]
    NotObject,
    #[error("Missing required field: {0}")]
    MissingField(&'static str),
    #[error("Unknown hook event: {0}")]
    UnknownEvent(String),
    #[error("Unknown notification type: {0}")]
    UnknownNotificationType(String),
}

/// 所有事件共有的字段
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventCommon {
    pub session_id: String,
    pub cwd: String,
}

/// Notification hook 的提示类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptKind {
    /// 工具权限请求 (permission_prompt)
    Permission,
    /// 等待用户输入 (idle_prompt)
    Idle,
}

impl PromptKind {
    /// 对应的通知类别
    pub fn notification_kind(&self) -> NotificationKind {
        match self {
            Self::Permission => NotificationKind::Permission,
            Self::Idle => NotificationKind::InputRequired,
        }
    }
}

/// 入站 hook 事件（闭合枚举）
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookEvent {
    Notification {
        common: EventCommon,
        prompt: PromptKind,
    },
    Stop {
        common: EventCommon,
    },
    PreToolUse {
        common: EventCommon,
        tool_name: String,
    },
    PostToolUse {
        common: EventCommon,
        tool_name: String,
    },
}

impl HookEvent {
    /// 从原始 JSON 解析并校验
    pub fn parse(payload: &Value) -> Result<Self, ValidationError> {
        let obj = payload.as_object().ok_or(ValidationError::NotObject)?;

        let common = EventCommon {
            session_id: require_str(obj, "session_id")?,
            cwd: require_str(obj, "cwd")?,
        };

        let hook_name = require_str(obj, "hook_event_name")?;
        match hook_name.as_str() {
            "Notification" => {
                let notification_type = require_str(obj, "notification_type")?;
                let prompt = match notification_type.as_str() {
                    "permission_prompt" => PromptKind::Permission,
                    "idle_prompt" => PromptKind::Idle,
                    other => {
                        return Err(ValidationError::UnknownNotificationType(other.to_string()))
                    }
                };
                Ok(Self::Notification { common, prompt })
            }
            "Stop" => Ok(Self::Stop { common }),
            "PreToolUse" => Ok(Self::PreToolUse {
                tool_name: require_str(obj, "tool_name")?,
                common,
            }),
            "PostToolUse" => Ok(Self::PostToolUse {
                tool_name: require_str(obj, "tool_name")?,
                common,
            }),
            other => Err(ValidationError::UnknownEvent(other.to_string())),
        }
    }

    /// 落库用的事件类型名
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Notification { .. } => "notification",
            Self::Stop { .. } => "stop",
            Self::PreToolUse { .. } => "pre_tool_use",
            Self::PostToolUse { .. } => "post_tool_use",
        }
    }

    pub fn common(&self) -> &EventCommon {
        match self {
            Self::Notification { common, .. }
            | Self::Stop { common }
            | Self::PreToolUse { common, .. }
            | Self::PostToolUse { common, .. } => common,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.common().session_id
    }

    pub fn cwd(&self) -> &str {
        &self.common().cwd
    }
}

fn require_str(
    obj: &serde_json::Map<String, Value>,
    field: &'static str,
) -> Result<String, ValidationError> {
    obj.get(field)
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .ok_or(ValidationError::MissingField(field))
}
