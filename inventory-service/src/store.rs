use chrono::Duration;
use shared::*;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::models::{Checkout, SaleLedger};

#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// How long a `held` reservation waits for payment before it expires.
    pub hold_ttl: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            hold_ttl: Duration::minutes(10),
        }
    }
}

/// Authoritative inventory for every sale.
///
/// Each sale lives behind its own lock; reserve, confirm and release each
/// take that lock exactly once, so the availability check and the decrement
/// can never interleave with another caller. Sales do not share state, so
/// contention on one sale never blocks another.
pub struct InventoryReservationStore {
    sales: RwLock<HashMap<Uuid, Arc<Mutex<SaleLedger>>>>,
    reservation_index: RwLock<HashMap<Uuid, Uuid>>,
    clock: Arc<dyn Clock>,
    config: StoreConfig,
}

impl InventoryReservationStore {
    pub fn new(clock: Arc<dyn Clock>, config: StoreConfig) -> Self {
        Self {
            sales: RwLock::new(HashMap::new()),
            reservation_index: RwLock::new(HashMap::new()),
            clock,
            config,
        }
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub async fn create_sale(&self, new_sale: NewSale) -> Result<Sale, SaleError> {
        new_sale.validate()?;
        let sale = Sale::from_new(new_sale, self.clock.now());

        let mut sales = self.sales.write().await;
        if sales.contains_key(&sale.id) {
            return Err(SaleError::Duplicate(sale.id));
        }
        sales.insert(sale.id, Arc::new(Mutex::new(SaleLedger::new(sale.clone()))));

        info!(
            "Sale {} created for product {}: {} units at {} {}",
            sale.id, sale.product_id, sale.total_quantity, sale.sale_price, sale.currency
        );
        Ok(sale)
    }

    pub async fn sale(&self, sale_id: Uuid) -> Option<Sale> {
        let ledger = self.ledger(sale_id).await?;
        let ledger = ledger.lock().await;
        Some(ledger.sale.clone())
    }

    pub async fn sales(&self) -> Vec<Sale> {
        let mut sales = Vec::new();
        for ledger in self.ledgers().await {
            sales.push(ledger.lock().await.sale.clone());
        }
        sales.sort_by_key(|sale| sale.start_time);
        sales
    }

    pub async fn start_sale(&self, sale_id: Uuid) -> Result<Sale, SaleError> {
        let ledger = self.ledger(sale_id).await.ok_or(SaleError::NotFound(sale_id))?;
        let mut ledger = ledger.lock().await;
        ledger.start(self.clock.now())?;
        info!("Sale {} started manually", sale_id);
        Ok(ledger.sale.clone())
    }

    pub async fn end_sale(&self, sale_id: Uuid) -> Result<Sale, SaleError> {
        let ledger = self.ledger(sale_id).await.ok_or(SaleError::NotFound(sale_id))?;
        let mut ledger = ledger.lock().await;
        ledger.end(self.clock.now())?;
        info!("Sale {} ended manually", sale_id);
        Ok(ledger.sale.clone())
    }

    /// Flips `scheduled → active → ended` for every sale whose window
    /// boundary has passed.
    pub async fn advance_schedule(&self) -> Vec<(Uuid, SaleStatus)> {
        let now = self.clock.now();
        let mut changes = Vec::new();
        for ledger in self.ledgers().await {
            let mut ledger = ledger.lock().await;
            if let Some(status) = ledger.advance_schedule(now) {
                info!("Sale {} is now {:?}", ledger.sale.id, status);
                changes.push((ledger.sale.id, status));
            }
        }
        changes
    }

    pub async fn reserve(
        &self,
        sale_id: Uuid,
        customer_id: &str,
        quantity: u32,
    ) -> Result<Reservation, ReservationError> {
        let ledger = self
            .ledger(sale_id)
            .await
            .ok_or(ReservationError::SaleNotFound(sale_id))?;

        let reservation = {
            let mut ledger = ledger.lock().await;
            ledger.reserve(customer_id, quantity, self.clock.now(), self.config.hold_ttl)?
        };

        self.reservation_index
            .write()
            .await
            .insert(reservation.id, sale_id);

        debug!(
            "Reservation {} holds {} unit(s) of sale {} for {} until {}",
            reservation.id, quantity, sale_id, customer_id, reservation.expires_at
        );
        Ok(reservation)
    }

    pub async fn confirm(&self, reservation_id: Uuid) -> Result<Reservation, ReservationError> {
        let ledger = self.ledger_for(reservation_id).await?;
        let mut ledger = ledger.lock().await;
        match ledger.confirm(reservation_id, self.clock.now()) {
            Ok(reservation) => {
                info!(
                    "Reservation {} confirmed: {} unit(s) for {}",
                    reservation.id, reservation.quantity, reservation.customer_id
                );
                Ok(reservation)
            }
            Err(ReservationError::Expired(id)) => {
                warn!("Reservation {} expired before it could be confirmed", id);
                Err(ReservationError::Expired(id))
            }
            Err(e) => Err(e),
        }
    }

    /// Releases a held reservation back to the pool. Releasing a reservation
    /// that is already terminal is a no-op; the return value tells whether
    /// this call restored inventory.
    pub async fn release(
        &self,
        reservation_id: Uuid,
        reason: ReleaseReason,
    ) -> Result<bool, ReservationError> {
        let ledger = self.ledger_for(reservation_id).await?;
        let mut ledger = ledger.lock().await;
        let released = ledger.release(reservation_id, reason, self.clock.now())?;
        if released {
            info!(
                "Reservation {} released ({:?}); sale {} has {} unit(s) available",
                reservation_id, reason, ledger.sale.id, ledger.sale.available_quantity
            );
        } else {
            debug!("Reservation {} already terminal, release ignored", reservation_id);
        }
        Ok(released)
    }

    pub async fn get_status(&self, reservation_id: Uuid) -> Result<ReservationStatus, ReservationError> {
        Ok(self.reservation(reservation_id).await?.status)
    }

    /// Current view of a reservation. A hold whose expiry has passed is
    /// expired on the spot, so late readers never see a stale `held`.
    pub async fn reservation(&self, reservation_id: Uuid) -> Result<Reservation, ReservationError> {
        let ledger = self.ledger_for(reservation_id).await?;
        let mut ledger = ledger.lock().await;
        ledger
            .settle_overdue(reservation_id, self.clock.now())
            .cloned()
    }

    /// Charge details for a reservation that is still held and unexpired.
    pub async fn checkout(&self, reservation_id: Uuid) -> Result<Checkout, ReservationError> {
        let ledger = self.ledger_for(reservation_id).await?;
        let mut ledger = ledger.lock().await;
        let reservation = ledger
            .settle_overdue(reservation_id, self.clock.now())?
            .clone();

        match reservation.status {
            ReservationStatus::Held => Ok(Checkout {
                amount: ledger.sale.charge_amount(reservation.quantity),
                currency: ledger.sale.currency.clone(),
                reservation,
            }),
            ReservationStatus::Expired => Err(ReservationError::Expired(reservation_id)),
            status => Err(ReservationError::AlreadyTerminal {
                id: reservation_id,
                status,
            }),
        }
    }

    /// Expires every held reservation whose hold has run out and returns how
    /// many were reclaimed.
    pub async fn expire_overdue(&self) -> usize {
        let now = self.clock.now();
        let mut expired = 0;
        for ledger in self.ledgers().await {
            let mut ledger = ledger.lock().await;
            for reservation in ledger.expire_overdue(now) {
                info!(
                    "Reservation {} expired; {} unit(s) returned to sale {}",
                    reservation.id, reservation.quantity, reservation.sale_id
                );
                expired += 1;
            }
        }
        expired
    }

    pub async fn audit(&self, sale_id: Uuid) -> Option<InventoryAudit> {
        let ledger = self.ledger(sale_id).await?;
        let audit = ledger.lock().await.audit();
        Some(audit)
    }

    pub async fn purchase_count(&self, sale_id: Uuid, customer_id: &str) -> Option<CustomerPurchaseCount> {
        let ledger = self.ledger(sale_id).await?;
        let count = ledger.lock().await.purchase_count(customer_id);
        Some(count)
    }

    pub async fn reservations_for_sale(&self, sale_id: Uuid) -> Vec<Reservation> {
        let Some(ledger) = self.ledger(sale_id).await else {
            return Vec::new();
        };
        let ledger = ledger.lock().await;
        let mut reservations: Vec<Reservation> = ledger.reservations.values().cloned().collect();
        reservations.sort_by_key(|reservation| reservation.created_at);
        reservations
    }

    async fn ledger(&self, sale_id: Uuid) -> Option<Arc<Mutex<SaleLedger>>> {
        self.sales.read().await.get(&sale_id).cloned()
    }

    async fn ledgers(&self) -> Vec<Arc<Mutex<SaleLedger>>> {
        self.sales.read().await.values().cloned().collect()
    }

    async fn ledger_for(&self, reservation_id: Uuid) -> Result<Arc<Mutex<SaleLedger>>, ReservationError> {
        let sale_id = self
            .reservation_index
            .read()
            .await
            .get(&reservation_id)
            .copied()
            .ok_or(ReservationError::NotFound(reservation_id))?;
        self.ledger(sale_id)
            .await
            .ok_or(ReservationError::NotFound(reservation_id))
    }
}
