use clap::{Parser, Subcommand};
use serde::Serialize;
use std::sync::Arc;
use tabled::{Table, Tabled};

use crate::adapters::PgRosterStore;
use crate::config::{AppConfig, LeaseBackend};
use crate::domain::{QueuedTransaction, TransactionStatus};
use crate::error::{Result, RosterError};
use crate::persistence::{
    open_sqlite_pool, LeaseStore, PgLeaseStore, QueueStore, SqliteLeaseStore, TransactionQueue,
};

#[derive(Parser)]
#[command(name = "rosterd")]
#[command(author = "Rosterd Team")]
#[command(version = "0.1.0")]
#[command(about = "Graceful degradation and recovery core for the league roster bot", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Config directory (default.toml plus $ROSTERD_ENV.toml)
    #[arg(short, long, default_value = "config", env = "ROSTERD_CONFIG_DIR")]
    pub config: String,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the supervisor: probes, lease renewal, recovery and dashboard
    Run,
    /// Show local queue statistics and the current lease
    Status {
        #[arg(long)]
        json: bool,
    },
    /// Inspect or repair the transaction queue
    #[command(subcommand)]
    Queue(QueueCommands),
    /// Inspect or clear the authority lease
    #[command(subcommand)]
    Lock(LockCommands),
}

#[derive(Subcommand, Debug, Clone)]
pub enum QueueCommands {
    /// List queued transactions
    List {
        /// Filter by status (queued, processing, completed, failed)
        #[arg(long)]
        status: Option<String>,
        #[arg(long, default_value = "25")]
        limit: u32,
        #[arg(long, default_value = "0")]
        offset: u32,
        #[arg(long)]
        json: bool,
    },
    /// Move a failed transaction back to queued with a fresh retry budget
    Requeue { id: String },
    /// Delete completed/failed records older than the retention window
    Purge {
        /// Override queue.retention_hours
        #[arg(long)]
        older_than_hours: Option<u64>,
    },
    /// Delete every record, pending ones included
    Clear {
        /// Required confirmation
        #[arg(long)]
        yes: bool,
    },
}

#[derive(Subcommand, Debug, Clone)]
pub enum LockCommands {
    /// Show the lease row
    Show {
        #[arg(long)]
        json: bool,
    },
    /// Delete the lease regardless of owner (recovery only)
    Release {
        /// Required confirmation
        #[arg(long)]
        force: bool,
    },
}

#[derive(Debug, Serialize, Tabled)]
pub struct QueueRow {
    pub id: String,
    pub kind: String,
    pub status: String,
    pub retries: String,
    pub enqueued_at: String,
    pub description: String,
    pub last_error: String,
}

impl From<&QueuedTransaction> for QueueRow {
    fn from(tx: &QueuedTransaction) -> Self {
        Self {
            id: tx.id.clone(),
            kind: tx.kind.to_string(),
            status: tx.status.to_string(),
            retries: format!("{}/{}", tx.retries, tx.max_retries),
            enqueued_at: tx.enqueued_at.format("%Y-%m-%d %H:%M:%S").to_string(),
            description: tx.payload.describe(),
            last_error: tx.last_error.clone().unwrap_or_default(),
        }
    }
}

async fn open_queue(config: &AppConfig) -> Result<TransactionQueue> {
    let pool = open_sqlite_pool(&config.queue.path).await?;
    Ok(TransactionQueue::new(
        QueueStore::from_pool(pool),
        config.queue.queue_config(),
        config.retry.clone(),
    ))
}

async fn open_lease_store(config: &AppConfig) -> Result<Arc<dyn LeaseStore>> {
    Ok(match config.lease.backend {
        LeaseBackend::Postgres => {
            let roster =
                PgRosterStore::connect(&config.database.url, config.database.max_connections).await?;
            Arc::new(PgLeaseStore::from_pool(roster.pool().clone()))
        }
        LeaseBackend::Sqlite => {
            Arc::new(SqliteLeaseStore::from_pool(open_sqlite_pool(&config.queue.path).await?))
        }
    })
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub async fn show_status(config: &AppConfig, json: bool) -> Result<()> {
    let queue = open_queue(config).await?;
    let stats = queue.stats().await?;
    let lease = match open_lease_store(config).await {
        Ok(store) => store.current(&config.lease.manager.resource).await.ok().flatten(),
        Err(_) => None,
    };

    if json {
        return print_json(&serde_json::json!({ "queue": stats, "lease": lease }));
    }

    println!("Queue ({})", config.queue.path.display());
    println!("  pending:    {}", stats.pending());
    println!("  queued:     {}", stats.queued);
    println!("  processing: {}", stats.processing);
    println!("  completed:  {}", stats.completed);
    println!("  failed:     {}", stats.failed);
    println!("  FA moves:   {}", stats.free_agent_moves);
    println!("  trades:     {}", stats.trade_approvals);
    if let Some(oldest) = stats.oldest_pending_at {
        println!("  oldest:     {}", oldest.format("%Y-%m-%d %H:%M:%S UTC"));
    }
    match lease {
        Some(lease) => println!(
            "Lease {}: held by {} until {} (renewed {} times)",
            lease.resource_name,
            lease.owner_id,
            lease.expires_at.format("%H:%M:%S UTC"),
            lease.renew_count
        ),
        None => println!("Lease {}: not held", config.lease.manager.resource),
    }
    Ok(())
}

pub async fn run_queue_command(config: &AppConfig, cmd: QueueCommands) -> Result<()> {
    let queue = open_queue(config).await?;

    match cmd {
        QueueCommands::List {
            status,
            limit,
            offset,
            json,
        } => {
            let status = status
                .as_deref()
                .map(TransactionStatus::try_from)
                .transpose()?;
            let items = queue.list_page(status, limit, offset).await?;
            if json {
                return print_json(&items);
            }
            if items.is_empty() {
                println!("(no results)");
            } else {
                let rows: Vec<QueueRow> = items.iter().map(QueueRow::from).collect();
                println!("{}", Table::new(rows));
            }
        }
        QueueCommands::Requeue { id } => {
            queue.requeue_failed(&id).await?;
            println!("Requeued {}", id);
        }
        QueueCommands::Purge { older_than_hours } => {
            let retention = older_than_hours
                .map(|h| chrono::Duration::hours(h as i64))
                .unwrap_or_else(|| config.queue.retention());
            let purged = queue.purge_terminal(retention).await?;
            println!("Purged {} terminal records", purged);
        }
        QueueCommands::Clear { yes } => {
            if !yes {
                return Err(RosterError::Validation(
                    "queue clear deletes pending work; pass --yes to confirm".to_string(),
                ));
            }
            let removed = queue.clear().await?;
            println!("Removed {} records", removed);
        }
    }
    Ok(())
}

pub async fn run_lock_command(config: &AppConfig, cmd: LockCommands) -> Result<()> {
    let store = open_lease_store(config).await?;
    let resource = &config.lease.manager.resource;

    match cmd {
        LockCommands::Show { json } => {
            let lease = store.current(resource).await?;
            if json {
                return print_json(&lease);
            }
            match lease {
                Some(lease) => {
                    let state = if lease.is_expired(chrono::Utc::now()) {
                        "expired"
                    } else {
                        "active"
                    };
                    println!("resource:    {}", lease.resource_name);
                    println!("owner:       {}", lease.owner_id);
                    println!("acquired at: {}", lease.acquired_at);
                    println!("expires at:  {} ({})", lease.expires_at, state);
                    println!("renewals:    {}", lease.renew_count);
                }
                None => println!("No lease on {}", resource),
            }
        }
        LockCommands::Release { force } => {
            if !force {
                return Err(RosterError::Validation(
                    "lock release ignores the current owner; pass --force to confirm".to_string(),
                ));
            }
            if store.force_clear(resource).await? {
                println!("Lease {} cleared", resource);
            } else {
                println!("No lease on {}", resource);
            }
        }
    }
    Ok(())
}
