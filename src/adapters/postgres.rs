use crate::domain::{FreeAgentMove, TradeApproval, TransactionPayload};
use crate::error::{DatastoreError, Result};
use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, Row, Transaction};
use std::time::Duration;
use tracing::{debug, info, instrument};

/// Team that unsigned players belong to
pub const FREE_AGENTS_TEAM: &str = "Free Agents";

/// Calls into the roster datastore.
///
/// Every mutation is split into a precondition check and an apply step. The
/// apply step re-checks inside its own database transaction, so a queued
/// action that went stale is rejected rather than half-applied.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RosterDatastore: Send + Sync {
    /// Cheap liveness check
    async fn ping(&self) -> std::result::Result<(), DatastoreError>;

    async fn check_free_agent_move(
        &self,
        mv: &FreeAgentMove,
    ) -> std::result::Result<(), DatastoreError>;

    /// Apply the move; returns a human-readable summary
    async fn apply_free_agent_move(
        &self,
        mv: &FreeAgentMove,
    ) -> std::result::Result<String, DatastoreError>;

    async fn check_trade_approval(
        &self,
        trade: &TradeApproval,
    ) -> std::result::Result<(), DatastoreError>;

    /// Apply the approval; returns a human-readable summary
    async fn apply_trade_approval(
        &self,
        trade: &TradeApproval,
    ) -> std::result::Result<String, DatastoreError>;
}

/// Re-validate then apply a queued payload
pub async fn apply_payload(
    datastore: &dyn RosterDatastore,
    payload: &TransactionPayload,
) -> std::result::Result<String, DatastoreError> {
    match payload {
        TransactionPayload::FreeAgentMove(mv) => {
            datastore.check_free_agent_move(mv).await?;
            datastore.apply_free_agent_move(mv).await
        }
        TransactionPayload::TradeApproval(trade) => {
            datastore.check_trade_approval(trade).await?;
            datastore.apply_trade_approval(trade).await
        }
    }
}

/// Bid as stored in the integer coin columns
fn bid_coins(mv: &FreeAgentMove) -> std::result::Result<i32, DatastoreError> {
    i32::try_from(mv.bid_amount).map_err(|_| {
        DatastoreError::RuleViolation(format!("bid of {} coins is out of range", mv.bid_amount))
    })
}

struct PlayerRow {
    id: i32,
    team: String,
    overall: Option<i32>,
}

/// PostgreSQL roster datastore
#[derive(Clone)]
pub struct PgRosterStore {
    pool: PgPool,
}

impl PgRosterStore {
    /// Connect with a short acquire timeout so an outage surfaces as a failed probe
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(3))
            .connect_lazy(database_url)?;

        info!("PostgreSQL pool configured ({} connections)", max_connections);
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn find_player(
        tx: &mut Transaction<'_, Postgres>,
        name: &str,
    ) -> std::result::Result<PlayerRow, DatastoreError> {
        let row = sqlx::query("SELECT id, team, overall FROM players WHERE name = $1 LIMIT 1 FOR UPDATE")
            .bind(name)
            .fetch_optional(&mut **tx)
            .await?;

        row.map(|r| PlayerRow {
            id: r.get("id"),
            team: r.get("team"),
            overall: r.get("overall"),
        })
        .ok_or_else(|| DatastoreError::RuleViolation(format!("player {} not found", name)))
    }

    async fn coins_remaining(
        tx: &mut Transaction<'_, Postgres>,
        team: &str,
    ) -> std::result::Result<i32, DatastoreError> {
        let coins: Option<i32> = sqlx::query_scalar(
            "SELECT coins_remaining FROM team_coins WHERE team = $1 LIMIT 1 FOR UPDATE",
        )
        .bind(team)
        .fetch_optional(&mut **tx)
        .await?;

        coins.ok_or_else(|| DatastoreError::RuleViolation(format!("team {} not found", team)))
    }

    /// Shared precondition checks; returns (dropped, signed, coins remaining, bid)
    async fn validate_move(
        tx: &mut Transaction<'_, Postgres>,
        mv: &FreeAgentMove,
    ) -> std::result::Result<(PlayerRow, PlayerRow, i32, i32), DatastoreError> {
        let bid = bid_coins(mv)?;
        let dropped = Self::find_player(tx, &mv.drop_player).await?;
        if dropped.team != mv.team {
            return Err(DatastoreError::RuleViolation(format!(
                "{} is no longer on {}",
                mv.drop_player, mv.team
            )));
        }

        let signed = Self::find_player(tx, &mv.sign_player).await?;
        if signed.team != FREE_AGENTS_TEAM {
            return Err(DatastoreError::RuleViolation(format!(
                "{} is no longer a free agent (now on {})",
                mv.sign_player, signed.team
            )));
        }

        let coins = Self::coins_remaining(tx, &mv.team).await?;
        if coins < bid {
            return Err(DatastoreError::RuleViolation(format!(
                "{} has {} coins, need {}",
                mv.team, coins, mv.bid_amount
            )));
        }

        Ok((dropped, signed, coins, bid))
    }

    async fn pending_trade_id(
        tx: &mut Transaction<'_, Postgres>,
        trade: &TradeApproval,
    ) -> std::result::Result<i32, DatastoreError> {
        let row = sqlx::query(
            "SELECT id, players_moved_at IS NOT NULL AS moved FROM trades WHERE message_id = $1 LIMIT 1 FOR UPDATE",
        )
        .bind(&trade.message_id)
        .fetch_optional(&mut **tx)
        .await?
        .ok_or_else(|| {
            DatastoreError::RuleViolation(format!(
                "no trade record for message {}",
                trade.message_id
            ))
        })?;

        if row.get::<bool, _>("moved") {
            return Err(DatastoreError::RuleViolation(format!(
                "trade {} was already processed",
                trade.message_id
            )));
        }
        Ok(row.get("id"))
    }

    /// Move `names` from `from` to `to`; every player must still be on `from`
    async fn move_players(
        tx: &mut Transaction<'_, Postgres>,
        names: &[String],
        from: &str,
        to: &str,
    ) -> std::result::Result<(), DatastoreError> {
        if names.is_empty() {
            return Ok(());
        }
        let moved = sqlx::query("UPDATE players SET team = $1 WHERE team = $2 AND name = ANY($3)")
            .bind(to)
            .bind(from)
            .bind(names)
            .execute(&mut **tx)
            .await?
            .rows_affected();

        if moved != names.len() as u64 {
            return Err(DatastoreError::RuleViolation(format!(
                "only {} of {} players are still on {}",
                moved,
                names.len(),
                from
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl RosterDatastore for PgRosterStore {
    async fn ping(&self) -> std::result::Result<(), DatastoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    #[instrument(skip(self, mv), fields(team = %mv.team))]
    async fn check_free_agent_move(
        &self,
        mv: &FreeAgentMove,
    ) -> std::result::Result<(), DatastoreError> {
        let mut tx = self.pool.begin().await?;
        Self::validate_move(&mut tx, mv).await?;
        tx.rollback().await?;
        Ok(())
    }

    #[instrument(skip(self, mv), fields(team = %mv.team))]
    async fn apply_free_agent_move(
        &self,
        mv: &FreeAgentMove,
    ) -> std::result::Result<String, DatastoreError> {
        let mut tx = self.pool.begin().await?;
        let (dropped, signed, coins, bid) = Self::validate_move(&mut tx, mv).await?;
        let remaining = coins - bid;

        sqlx::query("UPDATE team_coins SET coins_remaining = $1 WHERE team = $2")
            .bind(remaining)
            .bind(&mv.team)
            .execute(&mut *tx)
            .await?;
        sqlx::query("UPDATE players SET team = $1 WHERE id = $2")
            .bind(FREE_AGENTS_TEAM)
            .bind(dropped.id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("UPDATE players SET team = $1 WHERE id = $2")
            .bind(&mv.team)
            .bind(signed.id)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            r#"
            INSERT INTO fa_transactions
                (team, drop_player, sign_player, sign_player_ovr, bid_amount, admin_user, coins_remaining)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(&mv.team)
        .bind(&mv.drop_player)
        .bind(&mv.sign_player)
        .bind(signed.overall)
        .bind(bid)
        .bind(&mv.user_id)
        .bind(remaining)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        debug!("Applied free agent move for {}", mv.team);

        Ok(format!(
            "{} dropped {}, signed {} ({} coins, {} remaining)",
            mv.team, mv.drop_player, mv.sign_player, mv.bid_amount, remaining
        ))
    }

    #[instrument(skip(self, trade), fields(message_id = %trade.message_id))]
    async fn check_trade_approval(
        &self,
        trade: &TradeApproval,
    ) -> std::result::Result<(), DatastoreError> {
        let mut tx = self.pool.begin().await?;
        Self::pending_trade_id(&mut tx, trade).await?;
        tx.rollback().await?;
        Ok(())
    }

    #[instrument(skip(self, trade), fields(message_id = %trade.message_id))]
    async fn apply_trade_approval(
        &self,
        trade: &TradeApproval,
    ) -> std::result::Result<String, DatastoreError> {
        let mut tx = self.pool.begin().await?;
        let trade_id = Self::pending_trade_id(&mut tx, trade).await?;

        Self::move_players(&mut tx, &trade.team_one_sends, &trade.team_one, &trade.team_two).await?;
        Self::move_players(&mut tx, &trade.team_two_sends, &trade.team_two, &trade.team_one).await?;

        sqlx::query(
            r#"
            UPDATE trades
            SET status = 'approved', approved_at = NOW(), approved_by = $1, players_moved_at = NOW()
            WHERE id = $2
            "#,
        )
        .bind(&trade.user_id)
        .bind(trade_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        debug!("Applied trade approval {}", trade.message_id);

        Ok(format!(
            "Trade between {} and {} approved and processed",
            trade.team_one, trade.team_two
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mv() -> FreeAgentMove {
        FreeAgentMove {
            team: "Lakers".to_string(),
            drop_player: "Player1".to_string(),
            sign_player: "Player2".to_string(),
            bid_amount: 5,
            user_id: "user123".to_string(),
            message_id: "msg123".to_string(),
        }
    }

    #[test]
    fn test_bid_out_of_integer_range_is_a_rule_violation() {
        assert_eq!(bid_coins(&mv()), Ok(5));

        let mut huge = mv();
        huge.bid_amount = u32::MAX;
        assert!(matches!(
            bid_coins(&huge),
            Err(DatastoreError::RuleViolation(msg)) if msg.contains("out of range")
        ));
    }

    #[tokio::test]
    async fn test_apply_payload_checks_before_applying() {
        let mut mock = MockRosterDatastore::new();
        mock.expect_check_free_agent_move()
            .times(1)
            .returning(|_| Err(DatastoreError::RuleViolation("already signed".into())));
        mock.expect_apply_free_agent_move().never();

        let result = apply_payload(&mock, &TransactionPayload::FreeAgentMove(mv())).await;
        assert_eq!(
            result,
            Err(DatastoreError::RuleViolation("already signed".into()))
        );
    }

    #[tokio::test]
    async fn test_apply_payload_routes_by_kind() {
        let mut mock = MockRosterDatastore::new();
        mock.expect_check_trade_approval().returning(|_| Ok(()));
        mock.expect_apply_trade_approval()
            .returning(|t| Ok(format!("{} <-> {}", t.team_one, t.team_two)));

        let trade = TradeApproval {
            message_id: "m".to_string(),
            team_one: "Lakers".to_string(),
            team_two: "Celtics".to_string(),
            team_one_sends: vec![],
            team_two_sends: vec![],
            user_id: "admin".to_string(),
        };
        let result = apply_payload(&mock, &TransactionPayload::TradeApproval(trade)).await;
        assert_eq!(result.unwrap(), "Lakers <-> Celtics");
    }
}
