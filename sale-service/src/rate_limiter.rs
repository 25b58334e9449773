use chrono::{DateTime, Duration, Utc};
use shared::{Clock, CustomerId};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub window: Duration,
    pub max_attempts: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window: Duration::seconds(60),
            max_attempts: 5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    pub allowed: bool,
    pub retry_after: std::time::Duration,
}

#[derive(Debug, Clone, Copy)]
struct Window {
    started_at: DateTime<Utc>,
    attempts: u32,
}

/// Fixed-window attempt counter per customer. Every call spends budget,
/// denied ones included.
pub struct RateLimiter {
    windows: Mutex<HashMap<CustomerId, Window>>,
    clock: Arc<dyn Clock>,
    config: RateLimitConfig,
}

impl RateLimiter {
    pub fn new(clock: Arc<dyn Clock>, config: RateLimitConfig) -> Self {
        Self {
            windows: Mutex::new(HashMap::new()),
            clock,
            config,
        }
    }

    pub async fn allow(&self, customer_id: &str) -> RateDecision {
        let now = self.clock.now();
        let mut windows = self.windows.lock().await;
        let window = windows
            .entry(customer_id.to_string())
            .or_insert(Window { started_at: now, attempts: 0 });

        if now >= window.started_at + self.config.window {
            *window = Window { started_at: now, attempts: 0 };
        }
        window.attempts = window.attempts.saturating_add(1);

        if window.attempts <= self.config.max_attempts {
            return RateDecision {
                allowed: true,
                retry_after: std::time::Duration::ZERO,
            };
        }

        let retry_after = (window.started_at + self.config.window - now)
            .to_std()
            .unwrap_or_default();
        debug!(
            "Customer {} rate limited ({} attempts in window)",
            customer_id, window.attempts
        );
        RateDecision {
            allowed: false,
            retry_after,
        }
    }

    /// Drops windows that have already closed. Returns how many went.
    pub async fn prune(&self) -> usize {
        let now = self.clock.now();
        let window_len = self.config.window;
        let mut windows = self.windows.lock().await;
        let before = windows.len();
        windows.retain(|_, window| now < window.started_at + window_len);
        before - windows.len()
    }

    pub async fn tracked_customers(&self) -> usize {
        self.windows.lock().await.len()
    }

    pub async fn run_janitor(&self, every: std::time::Duration) {
        let mut interval = time::interval(every.max(std::time::Duration::from_millis(1)));
        loop {
            interval.tick().await;
            let pruned = self.prune().await;
            if pruned > 0 {
                debug!("Pruned {} idle rate-limit window(s)", pruned);
            }
        }
    }
}
