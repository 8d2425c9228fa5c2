//! 通知投递 - 出队、发送、状态回写的调度循环
//!
//! 投递失败绝不向上传播：每条通知的失败都被记录为 mark_failed，
//! 由退避重试兜底，一条坏通知不会阻塞整个批次。

pub mod payload;
pub mod webhook;

use anyhow::Result;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::queue::{Notification, NotificationQueue, NotificationStatus, STALE_CLAIM_SECS};
use crate::store::Store;
use crate::vault::Vault;

pub use payload::{build_webhook_payload, SessionContext, StoredPayload};
pub use webhook::{validate_webhook_url, SenderPolicy, WebhookSender, WebhookValidationError};

/// webhook URL 的配置键（加密存储）
pub const WEBHOOK_URL_KEY: &str = "webhook_url";

/// 单批默认处理条数
pub const DEFAULT_BATCH_SIZE: usize = 10;

/// 通知调度器
pub struct Dispatcher {
    store: Store,
    queue: NotificationQueue,
    vault: Vault,
    sender: WebhookSender,
}

impl Dispatcher {
    pub fn new(store: Store, vault: Vault) -> Result<Self> {
        Self::with_policy(store, vault, SenderPolicy::default())
    }

    pub fn with_policy(store: Store, vault: Vault, policy: SenderPolicy) -> Result<Self> {
        let sender = WebhookSender::new(policy)?;
        Ok(Self {
            queue: NotificationQueue::new(store.clone()),
            store,
            vault,
            sender,
        })
    }

    /// 投递单条通知并回写状态。返回是否发送成功；任何失败都已落库。
    pub async fn send_notification(&self, notification: &Notification) -> bool {
        let id = notification.id;
        let session_id = notification.session_id.as_str();

        let stored: StoredPayload = match serde_json::from_value(notification.payload.clone()) {
            Ok(p) => p,
            Err(e) => {
                self.fail(notification, &format!("Invalid stored payload: {e}")).await;
                return false;
            }
        };

        let webhook_url = match self.store.get_config_decrypted(WEBHOOK_URL_KEY, &self.vault) {
            Ok(Some(url)) => url,
            Ok(None) => {
                self.fail(notification, "Webhook URL not configured").await;
                return false;
            }
            Err(_) => {
                // 解密失败信息保持笼统，不泄漏密文或密钥细节
                self.fail(notification, "Failed to decrypt webhook URL").await;
                return false;
            }
        };

        let body = build_webhook_payload(&stored);
        let started = Instant::now();

        match self.sender.post(&webhook_url, &body).await {
            Ok(()) => {
                let latency_ms = started.elapsed().as_millis() as f64;
                if let Err(e) = self.queue.mark_sent(id) {
                    error!(id, "Failed to mark notification sent: {e}");
                    return false;
                }
                let _ = self.store.record_metric("send_latency_ms", latency_ms, Some(session_id));
                let _ = self.store.log_audit(
                    Some(session_id),
                    "notification_sent",
                    Some(&serde_json::json!({"notification_id": id, "kind": stored.kind})),
                );
                debug!(id, latency_ms, "Notification sent");
                true
            }
            Err(error_msg) => {
                self.fail(notification, &error_msg).await;
                false
            }
        }
    }

    async fn fail(&self, notification: &Notification, error_msg: &str) {
        let id = notification.id;
        if let Err(e) = self.queue.mark_failed(id, error_msg) {
            error!(id, "Failed to record notification failure: {e}");
            return;
        }
        warn!(id, error = error_msg, "Notification delivery failed");

        // 进入死信时审计一次
        if let Ok(Some(n)) = self.queue.get(id) {
            if n.status == NotificationStatus::DeadLetter {
                let _ = self.store.log_audit(
                    Some(&notification.session_id),
                    "notification_dead_letter",
                    Some(&serde_json::json!({
                        "notification_id": id,
                        "retry_count": n.retry_count,
                        "error": n.error,
                    })),
                );
                warn!(id, retry_count = n.retry_count, "Notification moved to dead letter");
            }
        }
    }

    /// 处理一批就绪通知。先回收僵尸认领，再出队逐条投递。
    /// 返回实际处理条数（含失败的）。
    pub async fn process_queue(&self, batch_size: usize) -> Result<usize> {
        let requeued = self.queue.requeue_stale(STALE_CLAIM_SECS)?;
        if requeued > 0 {
            warn!(requeued, "Requeued stale processing notifications");
        }

        let batch = self.queue.dequeue(batch_size)?;
        if batch.is_empty() {
            return Ok(0);
        }

        let mut sent = 0;
        for notification in &batch {
            if self.send_notification(notification).await {
                sent += 1;
            }
        }

        info!(processed = batch.len(), sent, "Queue batch processed");
        Ok(batch.len())
    }

    /// 常驻调度循环，每 interval 处理一批
    pub async fn run(&self, interval: Duration, batch_size: usize) -> Result<()> {
        info!(interval_secs = interval.as_secs(), "Dispatcher started");
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            if let Err(e) = self.process_queue(batch_size).await {
                error!("Dispatcher iteration failed: {e}");
            }
        }
    }
}
