use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::RosterError;

/// Default retry bound for queued transactions
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Category of a buffered user action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    FreeAgentMove,
    TradeApproval,
}

impl TransactionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionKind::FreeAgentMove => "free_agent_move",
            TransactionKind::TradeApproval => "trade_approval",
        }
    }

    /// Prefix used when generating transaction ids
    fn id_prefix(&self) -> &'static str {
        match self {
            TransactionKind::FreeAgentMove => "fa",
            TransactionKind::TradeApproval => "trade",
        }
    }
}

impl std::fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for TransactionKind {
    type Error = RosterError;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        match s {
            "free_agent_move" => Ok(TransactionKind::FreeAgentMove),
            "trade_approval" => Ok(TransactionKind::TradeApproval),
            other => Err(RosterError::UnknownKind(other.to_string())),
        }
    }
}

/// Lifecycle status of a queued transaction.
///
/// Forward-only except `Failed -> Queued` on an operator requeue, and
/// `Processing -> Queued` when a claim is released or a retryable attempt fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Queued,
    Processing,
    Completed,
    Failed,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Queued => "queued",
            TransactionStatus::Processing => "processing",
            TransactionStatus::Completed => "completed",
            TransactionStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TransactionStatus::Completed | TransactionStatus::Failed)
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, TransactionStatus::Queued | TransactionStatus::Processing)
    }
}

impl std::fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for TransactionStatus {
    type Error = RosterError;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        match s {
            "queued" => Ok(TransactionStatus::Queued),
            "processing" => Ok(TransactionStatus::Processing),
            "completed" => Ok(TransactionStatus::Completed),
            "failed" => Ok(TransactionStatus::Failed),
            other => Err(RosterError::Validation(format!(
                "unknown transaction status: {}",
                other
            ))),
        }
    }
}

/// Free-agent signing: drop one player, sign another for a coin bid
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FreeAgentMove {
    pub team: String,
    pub drop_player: String,
    pub sign_player: String,
    pub bid_amount: u32,
    pub user_id: String,
    pub message_id: String,
}

/// Approval of a negotiated trade between two teams
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradeApproval {
    pub message_id: String,
    pub team_one: String,
    pub team_two: String,
    /// Players moving from `team_one` to `team_two`
    pub team_one_sends: Vec<String>,
    /// Players moving from `team_two` to `team_one`
    pub team_two_sends: Vec<String>,
    pub user_id: String,
}

/// Kind-specific immutable fields of a queued transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransactionPayload {
    FreeAgentMove(FreeAgentMove),
    TradeApproval(TradeApproval),
}

impl TransactionPayload {
    pub fn kind(&self) -> TransactionKind {
        match self {
            TransactionPayload::FreeAgentMove(_) => TransactionKind::FreeAgentMove,
            TransactionPayload::TradeApproval(_) => TransactionKind::TradeApproval,
        }
    }

    /// Chat message that originated the action, used for dedupe
    pub fn message_id(&self) -> &str {
        match self {
            TransactionPayload::FreeAgentMove(m) => &m.message_id,
            TransactionPayload::TradeApproval(t) => &t.message_id,
        }
    }

    /// Short human description for logs and chat replies
    pub fn describe(&self) -> String {
        match self {
            TransactionPayload::FreeAgentMove(m) => {
                format!(
                    "{}: {} -> {} ({} coins)",
                    m.team, m.drop_player, m.sign_player, m.bid_amount
                )
            }
            TransactionPayload::TradeApproval(t) => {
                format!("{} <-> {}", t.team_one, t.team_two)
            }
        }
    }
}

/// A user action buffered for later application against the datastore
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedTransaction {
    pub id: String,
    pub kind: TransactionKind,
    pub payload: TransactionPayload,
    pub status: TransactionStatus,
    pub enqueued_at: DateTime<Utc>,
    pub retries: u32,
    pub max_retries: u32,
    pub last_error: Option<String>,
    /// Earliest instant the next attempt may start (per-item backoff)
    pub next_attempt_at: DateTime<Utc>,
    /// Instance currently holding the `Processing` claim
    pub claimed_by: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl QueuedTransaction {
    /// Build a fresh `Queued` record with a generated, stable id
    pub fn new(payload: TransactionPayload, max_retries: u32) -> Self {
        let now = Utc::now();
        let kind = payload.kind();
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        Self {
            id: format!(
                "{}-{}-{}",
                kind.id_prefix(),
                now.timestamp_millis(),
                &suffix[..9]
            ),
            kind,
            payload,
            status: TransactionStatus::Queued,
            enqueued_at: now,
            retries: 0,
            max_retries,
            last_error: None,
            next_attempt_at: now,
            claimed_by: None,
            claimed_at: None,
            updated_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fa_move() -> TransactionPayload {
        TransactionPayload::FreeAgentMove(FreeAgentMove {
            team: "Lakers".to_string(),
            drop_player: "Player1".to_string(),
            sign_player: "Player2".to_string(),
            bid_amount: 5,
            user_id: "user123".to_string(),
            message_id: "msg123".to_string(),
        })
    }

    #[test]
    fn test_new_transaction_defaults() {
        let tx = QueuedTransaction::new(fa_move(), DEFAULT_MAX_RETRIES);
        assert!(tx.id.starts_with("fa-"));
        assert_eq!(tx.kind, TransactionKind::FreeAgentMove);
        assert_eq!(tx.status, TransactionStatus::Queued);
        assert_eq!(tx.retries, 0);
        assert_eq!(tx.max_retries, 3);
        assert!(tx.last_error.is_none());
        assert!(tx.next_attempt_at <= Utc::now());
    }

    #[test]
    fn test_ids_are_unique() {
        let a = QueuedTransaction::new(fa_move(), 3);
        let b = QueuedTransaction::new(fa_move(), 3);
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_status_parsing() {
        for status in [
            TransactionStatus::Queued,
            TransactionStatus::Processing,
            TransactionStatus::Completed,
            TransactionStatus::Failed,
        ] {
            assert_eq!(TransactionStatus::try_from(status.as_str()).unwrap(), status);
        }
        assert!(TransactionStatus::try_from("resolved").is_err());
        assert!(TransactionKind::try_from("upgrade").is_err());
    }

    #[test]
    fn test_payload_is_tagged_by_kind() {
        let json = serde_json::to_value(fa_move()).unwrap();
        assert_eq!(json["type"], "free_agent_move");
        assert_eq!(json["sign_player"], "Player2");
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(TransactionStatus::Completed.is_terminal());
        assert!(TransactionStatus::Failed.is_terminal());
        assert!(TransactionStatus::Processing.is_pending());
        assert!(!TransactionStatus::Queued.is_terminal());
    }
}
