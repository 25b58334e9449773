use chrono::{DateTime, Utc};
use inventory_service::InventoryReservationStore;
use payment_service::PurchaseQueue;
use shared::*;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::rate_limiter::RateLimiter;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdmissionOutcome {
    Accepted {
        reservation_id: Uuid,
        job_id: Uuid,
        expires_at: DateTime<Utc>,
    },
    Denied {
        reason: DenialReason,
        retry_after: Option<Duration>,
    },
}

impl AdmissionOutcome {
    fn denied(reason: DenialReason) -> Self {
        AdmissionOutcome::Denied { reason, retry_after: None }
    }

    pub fn is_accepted(&self) -> bool {
        matches!(self, AdmissionOutcome::Accepted { .. })
    }

    pub fn denial_reason(&self) -> Option<DenialReason> {
        match self {
            AdmissionOutcome::Denied { reason, .. } => Some(*reason),
            AdmissionOutcome::Accepted { .. } => None,
        }
    }
}

/// Front door for purchase attempts: rate limit, then hold inventory, then
/// hand the hold to the payment queue. Never blocks on payment.
pub struct SaleCoordinator {
    limiter: Arc<RateLimiter>,
    store: Arc<InventoryReservationStore>,
    queue: PurchaseQueue,
    default_priority: Priority,
}

impl SaleCoordinator {
    pub fn new(limiter: Arc<RateLimiter>, store: Arc<InventoryReservationStore>, queue: PurchaseQueue) -> Self {
        Self {
            limiter,
            store,
            queue,
            default_priority: Priority::Normal,
        }
    }

    pub fn with_default_priority(mut self, priority: Priority) -> Self {
        self.default_priority = priority;
        self
    }

    pub fn store(&self) -> &Arc<InventoryReservationStore> {
        &self.store
    }

    pub fn queue(&self) -> &PurchaseQueue {
        &self.queue
    }

    pub async fn attempt_purchase(&self, sale_id: Uuid, customer_id: &str, quantity: u32) -> AdmissionOutcome {
        self.attempt_purchase_with_priority(sale_id, customer_id, quantity, self.default_priority)
            .await
    }

    pub async fn attempt_purchase_with_priority(
        &self,
        sale_id: Uuid,
        customer_id: &str,
        quantity: u32,
        priority: Priority,
    ) -> AdmissionOutcome {
        let decision = self.limiter.allow(customer_id).await;
        if !decision.allowed {
            return AdmissionOutcome::Denied {
                reason: DenialReason::RateLimited,
                retry_after: Some(decision.retry_after),
            };
        }

        let reservation = match self.store.reserve(sale_id, customer_id, quantity).await {
            Ok(reservation) => reservation,
            Err(e) => {
                debug!("Denied {} on sale {}: {}", customer_id, sale_id, e);
                return AdmissionOutcome::denied(e.denial_reason().unwrap_or(DenialReason::Unavailable));
            }
        };

        match self.queue.enqueue(reservation.id, priority).await {
            Ok(job_id) => {
                info!(
                    "Admitted {} for {} unit(s) of sale {} (reservation {}, job {})",
                    customer_id, quantity, sale_id, reservation.id, job_id
                );
                AdmissionOutcome::Accepted {
                    reservation_id: reservation.id,
                    job_id,
                    expires_at: reservation.expires_at,
                }
            }
            Err(e) => {
                error!("Failed to queue reservation {}: {}", reservation.id, e);
                if let Err(release_err) = self.store.release(reservation.id, ReleaseReason::Aborted).await {
                    error!("Failed to release orphaned reservation {}: {}", reservation.id, release_err);
                }
                AdmissionOutcome::denied(DenialReason::Unavailable)
            }
        }
    }

    pub async fn get_status(&self, reservation_id: Uuid) -> Result<ReservationStatus, ReservationError> {
        self.store.get_status(reservation_id).await
    }

    pub async fn reservation(&self, reservation_id: Uuid) -> Result<Reservation, ReservationError> {
        self.store.reservation(reservation_id).await
    }

    /// Customer-initiated release of a hold. `false` when it had already
    /// settled.
    pub async fn cancel(&self, reservation_id: Uuid) -> Result<bool, ReservationError> {
        let released = self
            .store
            .release(reservation_id, ReleaseReason::UserCancelled)
            .await?;
        if released {
            info!("Reservation {} cancelled by customer", reservation_id);
        }
        Ok(released)
    }
}
