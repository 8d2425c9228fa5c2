//! Code Agent Notifier CLI
//!
//! 编码代理 hook 事件的接收入口与通知队列的运维工具

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use code_agent_notifier::{
    migrate_v1, vault, Dispatcher, EventHandler, HandleOutcome, NotificationQueue, RateLimitConfig,
    RateLimiter, Store, V1Paths, Vault,
};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(name = "can")]
#[command(about = "Code Agent Notifier - 编码代理会话的出站通知")]
#[command(version)]
struct Cli {
    /// 数据库路径 (默认: ~/.claude/state/notifications.db)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// 加密密钥路径 (默认: ~/.claude/state/encryption.key)
    #[arg(long, global = true)]
    key: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// 处理 stdin 上的 hook 事件 (hook 命令入口)
    Hook {
        /// 入队后不派生投递进程（只依赖 daemon/process-queue 投递）
        #[arg(long)]
        no_send: bool,
    },
    /// 处理一批待投递通知后退出
    ProcessQueue {
        /// 单批最大条数
        #[arg(long, default_value = "10")]
        batch_size: usize,
    },
    /// 常驻调度进程，周期性处理队列
    Daemon {
        /// 轮询间隔（秒）
        #[arg(long, short, default_value = "60")]
        interval: u64,
        /// 单批最大条数
        #[arg(long, default_value = "10")]
        batch_size: usize,
    },
    /// 查看队列状态
    Status {
        /// 只看指定会话
        #[arg(long)]
        session: Option<String>,
        /// 输出 JSON 格式
        #[arg(long)]
        json: bool,
    },
    /// 列出死信通知
    DeadLetters {
        /// 最多显示条数
        #[arg(long, default_value = "20")]
        limit: i64,
        /// 输出 JSON 格式
        #[arg(long)]
        json: bool,
    },
    /// 列出活跃会话
    Sessions {
        /// 输出 JSON 格式
        #[arg(long)]
        json: bool,
    },
    /// 清理历史数据（已终结的通知 + 过期限流状态）
    Cleanup {
        /// 保留最近 N 天
        #[arg(long, default_value = "30")]
        days: i64,
    },
    /// 读写配置
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// 轮换加密密钥并重加密所有密文配置
    RotateKey,
    /// 导入 V1 的 JSON 状态文件（幂等）
    MigrateV1,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// 写入配置项
    Set {
        key: String,
        value: String,
        /// 加密存储（webhook URL 等敏感值）
        #[arg(long)]
        encrypt: bool,
    },
    /// 读取配置项
    Get {
        key: String,
        /// 解密后输出
        #[arg(long)]
        decrypt: bool,
    },
    /// 删除配置项
    Delete { key: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging();

    let db_path = cli.db.clone().unwrap_or_else(Store::default_path);
    let key_path = cli.key.clone().unwrap_or_else(Vault::default_key_path);
    let store = Store::open(&db_path)?;

    match cli.command {
        Commands::Hook { no_send } => {
            let mut input = String::new();
            std::io::stdin()
                .read_to_string(&mut input)
                .context("Failed to read hook payload from stdin")?;
            let payload: serde_json::Value =
                serde_json::from_str(&input).context("Invalid JSON on stdin")?;

            let handler = EventHandler::new(store.clone());
            let outcome = handler.handle(&payload)?;
            println!("{}", serde_json::to_string(&outcome)?);

            // 投递完全脱离生产者：派生独立进程处理队列，hook 入口不等网络 IO
            if !no_send {
                if let HandleOutcome::Queued { .. } = outcome {
                    if let Err(e) = spawn_delivery(cli.db.as_deref(), cli.key.as_deref()) {
                        warn!("Failed to spawn delivery process: {e}");
                    }
                }
            }
        }

        Commands::ProcessQueue { batch_size } => {
            let vault = Vault::get_or_create(&key_path)?;
            let dispatcher = Dispatcher::new(store, vault)?;
            let processed = dispatcher.process_queue(batch_size).await?;
            println!("{}", serde_json::json!({ "processed": processed }));
        }

        Commands::Daemon {
            interval,
            batch_size,
        } => {
            let vault = Vault::get_or_create(&key_path)?;
            let dispatcher = Dispatcher::new(store, vault)?;
            dispatcher
                .run(Duration::from_secs(interval), batch_size)
                .await?;
        }

        Commands::Status { session, json } => {
            let queue = NotificationQueue::new(store.clone());
            let stats = queue.stats(session.as_deref())?;
            if json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            } else {
                println!("通知队列状态:");
                println!("  pending:     {}", stats.pending);
                println!("  processing:  {}", stats.processing);
                println!("  sent:        {}", stats.sent);
                println!("  failed:      {}", stats.failed);
                println!("  dead_letter: {}", stats.dead_letter);
                println!("  total:       {}", stats.total);
            }
        }

        Commands::DeadLetters { limit, json } => {
            let queue = NotificationQueue::new(store);
            let dead = queue.dead_letters(Some(limit))?;
            if json {
                println!("{}", serde_json::to_string_pretty(&dead)?);
            } else if dead.is_empty() {
                println!("没有死信通知");
            } else {
                for n in dead {
                    println!(
                        "#{} [{}] session={} retries={} created={}  {}",
                        n.id,
                        n.notification_type,
                        n.session_id,
                        n.retry_count,
                        format_ts(n.created_at),
                        n.error.as_deref().unwrap_or("-"),
                    );
                }
            }
        }

        Commands::Sessions { json } => {
            let sessions = store.get_active_sessions()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&sessions)?);
            } else if sessions.is_empty() {
                println!("没有活跃会话");
            } else {
                for s in sessions {
                    println!(
                        "{}  {}  {}{}  last_activity={}",
                        s.session_id,
                        s.project_name.as_deref().unwrap_or("-"),
                        s.terminal_type.as_deref().unwrap_or("-"),
                        if s.is_idle { " (idle)" } else { "" },
                        format_ts(s.last_activity_at),
                    );
                }
            }
        }

        Commands::Cleanup { days } => {
            let queue = NotificationQueue::new(store.clone());
            let deleted = queue.cleanup_old(days)?;
            let limiter = RateLimiter::new(store, RateLimitConfig::default());
            let state_deleted = limiter.cleanup_old_state(None)?;
            info!(deleted, state_deleted, "Cleanup complete");
            println!("已清理 {deleted} 条通知, {state_deleted} 条限流状态");
        }

        Commands::Config { action } => match action {
            ConfigAction::Set {
                key,
                value,
                encrypt,
            } => {
                if encrypt {
                    let vault = Vault::get_or_create(&key_path)?;
                    store.set_config_encrypted(&key, &value, &vault)?;
                    println!("已加密写入 {key}");
                } else {
                    store.set_config(&key, &value)?;
                    println!("已写入 {key}");
                }
            }
            ConfigAction::Get { key, decrypt } => {
                let value = if decrypt {
                    let vault = Vault::get_or_create(&key_path)?;
                    store.get_config_decrypted(&key, &vault)?
                } else {
                    store.get_config(&key)?
                };
                match value {
                    Some(v) => println!("{v}"),
                    None => {
                        eprintln!("配置项不存在: {key}");
                        std::process::exit(1);
                    }
                }
            }
            ConfigAction::Delete { key } => {
                store.delete_config(&key)?;
                println!("已删除 {key}");
            }
        },

        Commands::RotateKey => {
            let old_vault = Vault::get_or_create(&key_path)?;
            let staging_path = key_path.with_extension("key.new");
            let new_vault = vault::rotate_key(&staging_path)?;

            // 全部重加密成功后才替换旧密钥文件
            let count = store.reencrypt_all_config(&old_vault, &new_vault)?;
            std::fs::rename(&staging_path, &key_path)
                .context("Failed to replace key file after re-encryption")?;
            info!(count, "Key rotated");
            println!("密钥已轮换，重加密 {count} 条配置");
        }

        Commands::MigrateV1 => {
            let vault = Vault::get_or_create(&key_path)?;
            let report = migrate_v1(&store, &vault, &V1Paths::default())?;
            if report.already_migrated {
                println!("V1 数据已导入过，跳过");
            } else {
                println!("{}", serde_json::to_string_pretty(&report)?);
            }
        }
    }

    Ok(())
}

/// 派生后台投递进程并立即返回，不等待其退出
fn spawn_delivery(db: Option<&Path>, key: Option<&Path>) -> Result<()> {
    let exe = std::env::current_exe().context("Failed to locate current executable")?;
    let mut cmd = std::process::Command::new(exe);
    cmd.arg("process-queue")
        .arg("--batch-size")
        .arg("1")
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null());
    if let Some(db) = db {
        cmd.arg("--db").arg(db);
    }
    if let Some(key) = key {
        cmd.arg("--key").arg(key);
    }
    cmd.spawn().context("Failed to spawn delivery process")?;
    Ok(())
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("code_agent_notifier=info,can=info"));

    fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .init();
}

fn format_ts(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| ts.to_string())
}
