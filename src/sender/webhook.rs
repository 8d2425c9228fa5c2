//! Webhook URL 校验与 HTTP 投递
//!
//! 安全基线: 仅 HTTPS、域名白名单（SSRF 防护）。投递策略可注入，
//! 默认值即安全默认值。

use anyhow::Result;
use reqwest::Url;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// 默认域名白名单
pub const ALLOWED_WEBHOOK_DOMAINS: &[&str] =
    &["hooks.slack.com", "discord.com", "hooks.zapier.com"];

/// 默认请求超时
pub const DEFAULT_TIMEOUT_SECS: u64 = 10;

/// URL 安全校验失败。错误信息只含 URL 元数据，绝不回显完整 URL。
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WebhookValidationError {
    #[error("Webhook URL cannot be empty")]
    Empty,
    #[error("Malformed webhook URL")]
    Malformed,
    #[error("Webhook URL must use HTTPS (got: {0})")]
    InsecureScheme(String),
    #[error("Domain '{0}' not allowed")]
    DomainNotAllowed(String),
}

/// 投递策略
#[derive(Debug, Clone)]
pub struct SenderPolicy {
    pub allowed_domains: Vec<String>,
    pub require_https: bool,
    pub timeout: Duration,
}

impl Default for SenderPolicy {
    fn default() -> Self {
        Self {
            allowed_domains: ALLOWED_WEBHOOK_DOMAINS.iter().map(|d| d.to_string()).collect(),
            require_https: true,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        }
    }
}

/// 校验 webhook URL：HTTPS + 白名单域名（或其子域）
pub fn validate_webhook_url(url: &str, policy: &SenderPolicy) -> Result<(), WebhookValidationError> {
    if url.is_empty() {
        return Err(WebhookValidationError::Empty);
    }

    let parsed = Url::parse(url).map_err(|_| WebhookValidationError::Malformed)?;

    if policy.require_https && parsed.scheme() != "https" {
        return Err(WebhookValidationError::InsecureScheme(
            parsed.scheme().to_string(),
        ));
    }

    let host = parsed
        .host_str()
        .ok_or(WebhookValidationError::Malformed)?
        .to_ascii_lowercase();

    let allowed = policy.allowed_domains.iter().any(|domain| {
        let domain = domain.to_ascii_lowercase();
        host == domain || host.ends_with(&format!(".{domain}"))
    });
    if !allowed {
        return Err(WebhookValidationError::DomainNotAllowed(host));
    }

    Ok(())
}

/// Webhook HTTP 投递器
#[derive(Clone)]
pub struct WebhookSender {
    client: reqwest::Client,
    policy: SenderPolicy,
}

impl WebhookSender {
    pub fn new(policy: SenderPolicy) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(policy.timeout).build()?;
        Ok(Self { client, policy })
    }

    pub fn policy(&self) -> &SenderPolicy {
        &self.policy
    }

    /// 校验并投递。返回的错误信息直接落库（已截断、不含 URL）。
    /// 任何 2xx 视为成功（Discord webhook 返回 204），其余状态码都走重试。
    pub async fn post(&self, url: &str, payload: &Value) -> Result<(), String> {
        validate_webhook_url(url, &self.policy)
            .map_err(|e| format!("Invalid webhook URL: {e}"))?;

        let response = self.client.post(url).json(payload).send().await;

        match response {
            Ok(resp) => {
                let status = resp.status();
                if status.is_success() {
                    debug!("Webhook delivered");
                    return Ok(());
                }
                let body = resp.text().await.unwrap_or_default();
                let body: String = body.chars().take(200).collect();
                Err(format!("HTTP {}: {}", status.as_u16(), body))
            }
            Err(e) if e.is_timeout() => Err("Connection timeout".to_string()),
            Err(e) => {
                // reqwest 错误 Display 可能含完整 URL，只保留错误分类
                let kind = if e.is_connect() {
                    "connection error"
                } else if e.is_request() {
                    "request error"
                } else {
                    "transport error"
                };
                Err(format!("Request failed: {kind}"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn default_policy() -> SenderPolicy {
        SenderPolicy::default()
    }

    #[test]
    fn test_allowed_domains_pass() {
        let policy = default_policy();
        for url in [
            "https://hooks.slack.com/services/T00/B00/XXX",
            "https://discord.com/api/webhooks/1/abc",
            "https://hooks.zapier.com/hooks/catch/1/x",
            "https://canary.discord.com/api/webhooks/1/abc",
            "https://HOOKS.SLACK.COM/services/T/B/X",
            "https://hooks.slack.com:443/services/T/B/X",
        ] {
            assert!(validate_webhook_url(url, &policy).is_ok(), "should allow {url}");
        }
    }

    #[test]
    fn test_http_rejected() {
        let err = validate_webhook_url("http://hooks.slack.com/services/T/B/X", &default_policy())
            .unwrap_err();
        assert_eq!(err, WebhookValidationError::InsecureScheme("http".into()));
    }

    #[test]
    fn test_unlisted_domain_rejected() {
        let policy = default_policy();
        for url in [
            "https://evil.com/webhook",
            "https://hooks.slack.com.evil.com/x",
            "https://notdiscord.com/api",
            "https://localhost/webhook",
            "https://127.0.0.1/webhook",
            "https://169.254.169.254/latest/meta-data",
        ] {
            assert!(
                matches!(
                    validate_webhook_url(url, &policy),
                    Err(WebhookValidationError::DomainNotAllowed(_))
                ),
                "should reject {url}"
            );
        }
    }

    #[test]
    fn test_empty_and_malformed() {
        let policy = default_policy();
        assert_eq!(
            validate_webhook_url("", &policy),
            Err(WebhookValidationError::Empty)
        );
        assert_eq!(
            validate_webhook_url("not a url", &policy),
            Err(WebhookValidationError::Malformed)
        );
    }

    #[test]
    fn test_validation_error_never_contains_path() {
        // 错误信息不回显 URL path（可能携带 webhook token）
        let err = validate_webhook_url(
            "https://evil.com/super-secret-token-path",
            &default_policy(),
        )
        .unwrap_err();
        assert!(!err.to_string().contains("super-secret-token-path"));
    }

    #[test]
    fn test_permissive_policy_for_local_targets() {
        let policy = SenderPolicy {
            allowed_domains: vec!["127.0.0.1".into()],
            require_https: false,
            timeout: Duration::from_secs(1),
        };
        assert!(validate_webhook_url("http://127.0.0.1:8080/hook", &policy).is_ok());
    }
}
