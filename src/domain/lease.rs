use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Resource name guarding mutation authority for the bot
pub const BOT_AUTHORITY_RESOURCE: &str = "bot_authority";

/// Time-bounded grant of exclusive authority over a resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockLease {
    pub resource_name: String,
    pub owner_id: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Renewals since this owner took the lease
    pub renew_count: u64,
}

impl LockLease {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn is_held_by(&self, owner_id: &str, now: DateTime<Utc>) -> bool {
        self.owner_id == owner_id && !self.is_expired(now)
    }
}

/// Result of one conditional acquire-or-renew write
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LeaseOutcome {
    /// Lease was free, expired, or newly created and now belongs to the caller
    Acquired,
    /// Caller already held the lease and extended it
    Renewed,
    /// Another owner holds an unexpired lease
    Denied,
}

impl LeaseOutcome {
    pub fn is_held(&self) -> bool {
        !matches!(self, LeaseOutcome::Denied)
    }
}

impl std::fmt::Display for LeaseOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LeaseOutcome::Acquired => write!(f, "acquired"),
            LeaseOutcome::Renewed => write!(f, "renewed"),
            LeaseOutcome::Denied => write!(f, "denied"),
        }
    }
}

/// Random per-process instance identity
pub fn generate_owner_id() -> String {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "local".to_string());
    format!(
        "{}-{}-{}",
        host,
        std::process::id(),
        &uuid::Uuid::new_v4().simple().to_string()[..8]
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_lease_expiry_and_ownership() {
        let now = Utc::now();
        let lease = LockLease {
            resource_name: BOT_AUTHORITY_RESOURCE.to_string(),
            owner_id: "A".to_string(),
            acquired_at: now,
            expires_at: now + Duration::seconds(120),
            renew_count: 0,
        };

        assert!(lease.is_held_by("A", now));
        assert!(!lease.is_held_by("B", now));
        assert!(lease.is_expired(now + Duration::seconds(120)));
        assert!(!lease.is_held_by("A", now + Duration::seconds(121)));
    }

    #[test]
    fn test_owner_ids_differ_per_call() {
        assert_ne!(generate_owner_id(), generate_owner_id());
    }
}
