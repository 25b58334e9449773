use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shared::Priority;
use std::cmp::Ordering;
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Processing,
    Paid,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PurchaseJob {
    pub id: Uuid,
    pub reservation_id: Uuid,
    pub sale_id: Uuid,
    pub priority: Priority,
    pub attempts: u32,
    pub state: JobState,
    pub enqueued_at: DateTime<Utc>,
    pub last_error: Option<String>,
    #[serde(skip)]
    pub(crate) sequence: u64,
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub workers: usize,
    /// Total charge attempts per job, first try included.
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub payment_timeout: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            workers: 10,
            max_attempts: 3,
            base_backoff: Duration::from_millis(200),
            payment_timeout: Duration::from_secs(5),
        }
    }
}

impl QueueConfig {
    /// Delay before the next try after `attempts` failed ones: base, 2×base,
    /// 4×base, …
    pub fn backoff_for(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(16);
        self.base_backoff.saturating_mul(1 << exponent)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub queued: usize,
    pub processing: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueTotals {
    pub paid: u64,
    pub failed: u64,
    pub retried: u64,
}

/// Heap entry: higher priority first, then earlier enqueue. The job id only
/// breaks ties so that ordering agrees with equality.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct QueueEntry {
    pub priority: Priority,
    pub sequence: u64,
    pub job_id: Uuid,
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.sequence.cmp(&self.sequence))
            .then_with(|| self.job_id.cmp(&other.job_id))
    }
}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BinaryHeap;

    #[test]
    fn heap_pops_by_priority_then_age() {
        let entry = |priority, sequence| QueueEntry { priority, sequence, job_id: Uuid::new_v4() };
        let mut heap = BinaryHeap::new();
        heap.push(entry(Priority::Normal, 1));
        heap.push(entry(Priority::Low, 0));
        heap.push(entry(Priority::High, 3));
        heap.push(entry(Priority::Normal, 2));

        let order: Vec<_> = std::iter::from_fn(|| heap.pop())
            .map(|e| (e.priority, e.sequence))
            .collect();
        assert_eq!(
            order,
            vec![
                (Priority::High, 3),
                (Priority::Normal, 1),
                (Priority::Normal, 2),
                (Priority::Low, 0),
            ]
        );
    }

    #[test]
    fn backoff_doubles_per_attempt() {
        let config = QueueConfig { base_backoff: Duration::from_millis(100), ..QueueConfig::default() };
        assert_eq!(config.backoff_for(1), Duration::from_millis(100));
        assert_eq!(config.backoff_for(2), Duration::from_millis(200));
        assert_eq!(config.backoff_for(3), Duration::from_millis(400));
    }

    #[test]
    fn ordering_agrees_with_equality() {
        let a = QueueEntry { priority: Priority::High, sequence: 7, job_id: Uuid::new_v4() };
        let b = QueueEntry { job_id: Uuid::new_v4(), ..a };

        assert_ne!(a, b);
        assert_ne!(a.cmp(&b), Ordering::Equal);
        assert_eq!(a.cmp(&b), b.cmp(&a).reverse());
        assert_eq!(a.cmp(&a), Ordering::Equal);
    }
}
