//! Code Agent Notifier - 编码代理会话的出站通知投递

pub mod handler;
pub mod migrate;
pub mod queue;
pub mod ratelimit;
pub mod sender;
pub mod store;
pub mod vault;

pub use handler::{EventHandler, HandleOutcome, HookEvent, TerminalProbe, ValidationError};
pub use migrate::{migrate_v1, MigrationReport, V1Paths};
pub use queue::{
    Notification, NotificationKind, NotificationQueue, NotificationStatus, QueueStats,
};
pub use ratelimit::{RateLimitConfig, RateLimiter};
pub use sender::{Dispatcher, SenderPolicy, SessionContext, StoredPayload, WebhookSender};
pub use store::sessions::{Session, SessionMeta};
pub use store::Store;
pub use vault::Vault;
