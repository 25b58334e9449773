pub mod clock;
pub mod error;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{PaymentError, PaymentErrorKind, QueueError, ReservationError, SaleError};

use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use num_traits::Zero;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type CustomerId = String;

fn default_currency() -> String {
    "USD".to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SaleStatus {
    Scheduled,
    Active,
    Ended,
}

/// Administrative request that creates a sale in `scheduled` status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewSale {
    #[serde(default)]
    pub sale_id: Option<Uuid>,
    pub product_id: Uuid,
    pub original_price: BigDecimal,
    pub sale_price: BigDecimal,
    #[serde(default = "default_currency")]
    pub currency: String,
    pub total_quantity: u32,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub max_per_customer: u32,
}

impl NewSale {
    pub fn validate(&self) -> Result<(), SaleError> {
        if self.total_quantity == 0 {
            return Err(SaleError::Invalid("total_quantity must be positive".to_string()));
        }
        if self.max_per_customer == 0 {
            return Err(SaleError::Invalid("max_per_customer must be positive".to_string()));
        }
        if self.end_time <= self.start_time {
            return Err(SaleError::Invalid("end_time must be after start_time".to_string()));
        }
        if self.sale_price <= BigDecimal::zero() || self.original_price <= BigDecimal::zero() {
            return Err(SaleError::Invalid("prices must be positive".to_string()));
        }
        if self.currency.trim().is_empty() {
            return Err(SaleError::Invalid("currency must not be empty".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sale {
    pub id: Uuid,
    pub product_id: Uuid,
    pub original_price: BigDecimal,
    pub sale_price: BigDecimal,
    pub currency: String,
    pub total_quantity: u32,
    pub available_quantity: u32,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub max_per_customer: u32,
    pub status: SaleStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Sale {
    pub fn from_new(new_sale: NewSale, now: DateTime<Utc>) -> Self {
        Self {
            id: new_sale.sale_id.unwrap_or_else(Uuid::new_v4),
            product_id: new_sale.product_id,
            original_price: new_sale.original_price,
            sale_price: new_sale.sale_price,
            currency: new_sale.currency,
            total_quantity: new_sale.total_quantity,
            available_quantity: new_sale.total_quantity,
            start_time: new_sale.start_time,
            end_time: new_sale.end_time,
            max_per_customer: new_sale.max_per_customer,
            status: SaleStatus::Scheduled,
            created_at: now,
            updated_at: now,
        }
    }

    /// True only while the sale is `active` and `now` falls inside
    /// `[start_time, end_time)`.
    pub fn accepts_purchases_at(&self, now: DateTime<Utc>) -> bool {
        self.status == SaleStatus::Active && self.start_time <= now && now < self.end_time
    }

    /// Share of the stock that is no longer available, held units included.
    pub fn percent_sold(&self) -> f64 {
        if self.total_quantity == 0 {
            return 0.0;
        }
        let taken = self.total_quantity - self.available_quantity;
        f64::from(taken) * 100.0 / f64::from(self.total_quantity)
    }

    pub fn charge_amount(&self, quantity: u32) -> BigDecimal {
        &self.sale_price * &BigDecimal::from(quantity)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReservationStatus {
    Held,
    Confirmed,
    Released,
    Expired,
}

impl ReservationStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, ReservationStatus::Held)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseReason {
    Expired,
    UserCancelled,
    PaymentDeclined,
    PaymentFailed,
    Aborted,
}

impl ReleaseReason {
    /// Status a held reservation lands in when released for this reason.
    pub fn terminal_status(self) -> ReservationStatus {
        match self {
            ReleaseReason::Expired => ReservationStatus::Expired,
            _ => ReservationStatus::Released,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Uuid,
    pub sale_id: Uuid,
    pub customer_id: CustomerId,
    pub quantity: u32,
    pub status: ReservationStatus,
    pub release_reason: Option<ReleaseReason>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Reservation {
    pub fn hold(
        sale_id: Uuid,
        customer_id: CustomerId,
        quantity: u32,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            sale_id,
            customer_id,
            quantity,
            status: ReservationStatus::Held,
            release_reason: None,
            created_at: now,
            expires_at,
            updated_at: now,
        }
    }

    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        self.status == ReservationStatus::Held && now >= self.expires_at
    }
}

/// Units a customer has paid for in one sale. Never decremented.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomerPurchaseCount {
    pub sale_id: Uuid,
    pub customer_id: CustomerId,
    pub purchased: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenialReason {
    RateLimited,
    SaleNotFound,
    SaleNotActive,
    SoldOut,
    LimitExceeded,
    InvalidQuantity,
    Unavailable,
}

impl DenialReason {
    pub fn as_str(self) -> &'static str {
        match self {
            DenialReason::RateLimited => "rate_limited",
            DenialReason::SaleNotFound => "sale_not_found",
            DenialReason::SaleNotActive => "sale_not_active",
            DenialReason::SoldOut => "sold_out",
            DenialReason::LimitExceeded => "limit_exceeded",
            DenialReason::InvalidQuantity => "invalid_quantity",
            DenialReason::Unavailable => "unavailable",
        }
    }
}

impl std::fmt::Display for DenialReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time view of a sale published to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SaleSnapshot {
    pub sale_id: Uuid,
    pub status: SaleStatus,
    pub available_quantity: u32,
    pub total_quantity: u32,
    pub queue_depth: usize,
    pub processing_count: usize,
    pub percent_sold: f64,
    pub taken_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryAudit {
    pub sale_id: Uuid,
    pub total: u32,
    pub available: u32,
    pub held: u32,
    pub confirmed: u32,
}

impl InventoryAudit {
    pub fn is_balanced(&self) -> bool {
        u64::from(self.available) + u64::from(self.held) + u64::from(self.confirmed)
            == u64::from(self.total)
    }
}
