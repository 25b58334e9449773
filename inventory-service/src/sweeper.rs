use std::sync::Arc;
use std::time::Duration;
use tokio::time;
use tracing::{debug, info};

use crate::store::InventoryReservationStore;

const MIN_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub status_changes: usize,
    pub expired: usize,
}

/// Periodic task that flips sale status at window boundaries and reclaims
/// holds that were never paid for.
pub struct ExpirySweeper {
    store: Arc<InventoryReservationStore>,
    interval: Duration,
}

impl ExpirySweeper {
    /// A zero `interval` is raised to one millisecond; `tokio::time::interval`
    /// rejects zero periods.
    pub fn new(store: Arc<InventoryReservationStore>, interval: Duration) -> Self {
        Self {
            store,
            interval: interval.max(MIN_INTERVAL),
        }
    }

    pub async fn run(&self) {
        let mut interval = time::interval(self.interval);
        interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

        loop {
            interval.tick().await;
            self.sweep_once().await;
        }
    }

    pub async fn sweep_once(&self) -> SweepReport {
        let report = SweepReport {
            status_changes: self.store.advance_schedule().await.len(),
            expired: self.store.expire_overdue().await,
        };

        if report.expired > 0 {
            info!("Expiry sweep reclaimed {} reservation(s)", report.expired);
        } else {
            debug!("Expiry sweep found nothing to reclaim");
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreConfig;
    use bigdecimal::BigDecimal;
    use chrono::Utc;
    use shared::*;
    use uuid::Uuid;

    #[tokio::test]
    async fn background_sweep_reclaims_within_one_interval() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let store = Arc::new(InventoryReservationStore::new(
            clock.clone(),
            StoreConfig { hold_ttl: chrono::Duration::seconds(30) },
        ));
        let sale = store
            .create_sale(NewSale {
                sale_id: None,
                product_id: Uuid::new_v4(),
                original_price: BigDecimal::from(10),
                sale_price: BigDecimal::from(5),
                currency: "EUR".to_string(),
                total_quantity: 2,
                start_time: clock.now(),
                end_time: clock.now() + chrono::Duration::hours(1),
                max_per_customer: 2,
            })
            .await
            .unwrap();

        let sweeper = ExpirySweeper::new(store.clone(), Duration::from_millis(20));
        assert_eq!(sweeper.sweep_once().await, SweepReport { status_changes: 1, expired: 0 });

        let hold = store.reserve(sale.id, "alice", 2).await.unwrap();
        let handle = tokio::spawn(async move { sweeper.run().await });

        clock.advance(chrono::Duration::seconds(31));
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.abort();

        let audit = store.audit(sale.id).await.unwrap();
        assert_eq!((audit.available, audit.held), (2, 0));
        assert_eq!(
            store.reservations_for_sale(sale.id).await[0].status,
            ReservationStatus::Expired
        );
        assert_eq!(hold.status, ReservationStatus::Held);
    }

    #[tokio::test]
    async fn zero_interval_keeps_sweeping() {
        let store = Arc::new(InventoryReservationStore::new(Arc::new(SystemClock), StoreConfig::default()));
        let sweeper = ExpirySweeper::new(store, Duration::ZERO);

        let handle = tokio::spawn(async move { sweeper.run().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!handle.is_finished());
        handle.abort();
    }
}
