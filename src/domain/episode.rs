use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Datastore health as seen by the degradation detector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectorState {
    Healthy,
    Degraded,
}

impl std::fmt::Display for DetectorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DetectorState::Healthy => write!(f, "healthy"),
            DetectorState::Degraded => write!(f, "degraded"),
        }
    }
}

/// A contiguous interval during which the datastore was considered unavailable
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DegradationEpisode {
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub recovery_attempt_count: u32,
    /// Pending items when the datastore was first considered down
    pub queue_size_at_open: usize,
    /// Backlog the recovery started with; refreshed when the episode closes
    pub queue_size_at_start: usize,
    /// Pending items left once the recovery drain for this episode stopped
    pub queue_size_at_end: Option<usize>,
}

impl DegradationEpisode {
    pub fn open(started_at: DateTime<Utc>, queue_size: usize) -> Self {
        Self {
            started_at,
            ended_at: None,
            recovery_attempt_count: 0,
            queue_size_at_open: queue_size,
            queue_size_at_start: queue_size,
            queue_size_at_end: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.ended_at.is_none()
    }

    /// Elapsed time, measured to `now` while the episode is still open
    pub fn duration_ms(&self, now: DateTime<Utc>) -> i64 {
        let end = self.ended_at.unwrap_or(now);
        (end - self.started_at).num_milliseconds().max(0)
    }
}
