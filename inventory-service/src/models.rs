use bigdecimal::BigDecimal;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use shared::*;
use std::collections::HashMap;
use uuid::Uuid;

/// Everything a payment worker needs to charge for a hold.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkout {
    pub reservation: Reservation,
    pub amount: BigDecimal,
    pub currency: String,
}

#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct CustomerTally {
    pub held: u32,
    pub purchased: u32,
}

impl CustomerTally {
    fn committed(&self) -> u32 {
        self.held.saturating_add(self.purchased)
    }
}

/// Authoritative state of one sale. All mutation happens under the sale's
/// lock in the store, so every method here is one atomic transition.
#[derive(Debug)]
pub(crate) struct SaleLedger {
    pub sale: Sale,
    pub reservations: HashMap<Uuid, Reservation>,
    customers: HashMap<CustomerId, CustomerTally>,
    held_units: u32,
    confirmed_units: u32,
}

impl SaleLedger {
    pub fn new(sale: Sale) -> Self {
        Self {
            sale,
            reservations: HashMap::new(),
            customers: HashMap::new(),
            held_units: 0,
            confirmed_units: 0,
        }
    }

    pub fn reserve(
        &mut self,
        customer_id: &str,
        quantity: u32,
        now: DateTime<Utc>,
        hold_ttl: Duration,
    ) -> Result<Reservation, ReservationError> {
        if quantity == 0 {
            return Err(ReservationError::InvalidQuantity);
        }
        if !self.sale.accepts_purchases_at(now) {
            return Err(ReservationError::SaleNotActive(self.sale.id));
        }

        let committed = self
            .customers
            .get(customer_id)
            .map(CustomerTally::committed)
            .unwrap_or(0);
        if committed.saturating_add(quantity) > self.sale.max_per_customer {
            return Err(ReservationError::LimitExceeded {
                max_per_customer: self.sale.max_per_customer,
                committed,
            });
        }

        if self.sale.available_quantity < quantity {
            return Err(ReservationError::SoldOut {
                requested: quantity,
                available: self.sale.available_quantity,
            });
        }

        self.sale.available_quantity -= quantity;
        self.sale.updated_at = now;
        self.held_units += quantity;
        self.customers.entry(customer_id.to_string()).or_default().held += quantity;

        let reservation = Reservation::hold(
            self.sale.id,
            customer_id.to_string(),
            quantity,
            now,
            now.checked_add_signed(hold_ttl).unwrap_or(DateTime::<Utc>::MAX_UTC),
        );
        self.reservations.insert(reservation.id, reservation.clone());
        Ok(reservation)
    }

    pub fn confirm(&mut self, id: Uuid, now: DateTime<Utc>) -> Result<Reservation, ReservationError> {
        let reservation = self
            .reservations
            .get(&id)
            .ok_or(ReservationError::NotFound(id))?;
        if reservation.status.is_terminal() {
            return Err(ReservationError::AlreadyTerminal {
                id,
                status: reservation.status,
            });
        }
        if reservation.is_overdue(now) {
            self.release(id, ReleaseReason::Expired, now)?;
            return Err(ReservationError::Expired(id));
        }

        let reservation = self
            .reservations
            .get_mut(&id)
            .ok_or(ReservationError::NotFound(id))?;
        reservation.status = ReservationStatus::Confirmed;
        reservation.updated_at = now;
        let quantity = reservation.quantity;
        let confirmed = reservation.clone();

        self.held_units -= quantity;
        self.confirmed_units += quantity;
        let tally = self.customers.entry(confirmed.customer_id.clone()).or_default();
        tally.held -= quantity;
        tally.purchased += quantity;
        Ok(confirmed)
    }

    /// Returns `Ok(true)` when the hold was released by this call and its
    /// quantity went back to the pool, `Ok(false)` when it was already
    /// terminal.
    pub fn release(
        &mut self,
        id: Uuid,
        reason: ReleaseReason,
        now: DateTime<Utc>,
    ) -> Result<bool, ReservationError> {
        let reservation = self
            .reservations
            .get_mut(&id)
            .ok_or(ReservationError::NotFound(id))?;
        if reservation.status.is_terminal() {
            return Ok(false);
        }

        reservation.status = reason.terminal_status();
        reservation.release_reason = Some(reason);
        reservation.updated_at = now;
        let quantity = reservation.quantity;
        let customer_id = reservation.customer_id.clone();

        self.sale.available_quantity += quantity;
        self.sale.updated_at = now;
        self.held_units -= quantity;
        if let Some(tally) = self.customers.get_mut(&customer_id) {
            tally.held -= quantity;
        }
        Ok(true)
    }

    /// Expires the reservation first if its hold ran out, then returns it.
    pub fn settle_overdue(&mut self, id: Uuid, now: DateTime<Utc>) -> Result<&Reservation, ReservationError> {
        let overdue = self
            .reservations
            .get(&id)
            .ok_or(ReservationError::NotFound(id))?
            .is_overdue(now);
        if overdue {
            self.release(id, ReleaseReason::Expired, now)?;
        }
        self.reservations.get(&id).ok_or(ReservationError::NotFound(id))
    }

    pub fn expire_overdue(&mut self, now: DateTime<Utc>) -> Vec<Reservation> {
        let overdue: Vec<Uuid> = self
            .reservations
            .values()
            .filter(|reservation| reservation.is_overdue(now))
            .map(|reservation| reservation.id)
            .collect();

        overdue
            .into_iter()
            .filter_map(|id| match self.release(id, ReleaseReason::Expired, now) {
                Ok(true) => self.reservations.get(&id).cloned(),
                _ => None,
            })
            .collect()
    }

    /// Scheduler transition for the given instant, if one is due.
    pub fn advance_schedule(&mut self, now: DateTime<Utc>) -> Option<SaleStatus> {
        let next = match self.sale.status {
            SaleStatus::Scheduled if now >= self.sale.end_time => SaleStatus::Ended,
            SaleStatus::Scheduled if now >= self.sale.start_time => SaleStatus::Active,
            SaleStatus::Active if now >= self.sale.end_time => SaleStatus::Ended,
            _ => return None,
        };
        self.sale.status = next;
        self.sale.updated_at = now;
        Some(next)
    }

    pub fn start(&mut self, now: DateTime<Utc>) -> Result<(), SaleError> {
        if self.sale.status != SaleStatus::Scheduled || now >= self.sale.end_time {
            return Err(SaleError::InvalidTransition {
                id: self.sale.id,
                from: self.sale.status,
                to: SaleStatus::Active,
            });
        }
        if now < self.sale.start_time {
            self.sale.start_time = now;
        }
        self.sale.status = SaleStatus::Active;
        self.sale.updated_at = now;
        Ok(())
    }

    pub fn end(&mut self, now: DateTime<Utc>) -> Result<(), SaleError> {
        if self.sale.status == SaleStatus::Ended {
            return Err(SaleError::InvalidTransition {
                id: self.sale.id,
                from: self.sale.status,
                to: SaleStatus::Ended,
            });
        }
        if now < self.sale.end_time {
            self.sale.end_time = now;
        }
        self.sale.status = SaleStatus::Ended;
        self.sale.updated_at = now;
        Ok(())
    }

    pub fn purchase_count(&self, customer_id: &str) -> CustomerPurchaseCount {
        CustomerPurchaseCount {
            sale_id: self.sale.id,
            customer_id: customer_id.to_string(),
            purchased: self.customers.get(customer_id).map(|t| t.purchased).unwrap_or(0),
        }
    }

    pub fn audit(&self) -> InventoryAudit {
        InventoryAudit {
            sale_id: self.sale.id,
            total: self.sale.total_quantity,
            available: self.sale.available_quantity,
            held: self.held_units,
            confirmed: self.confirmed_units,
        }
    }
}
