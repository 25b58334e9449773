use crate::{DenialReason, ReservationStatus, SaleStatus};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SaleError {
    #[error("invalid sale: {0}")]
    Invalid(String),
    #[error("sale {0} already exists")]
    Duplicate(Uuid),
    #[error("sale {0} not found")]
    NotFound(Uuid),
    #[error("sale {id} cannot move from {from:?} to {to:?}")]
    InvalidTransition {
        id: Uuid,
        from: SaleStatus,
        to: SaleStatus,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReservationError {
    #[error("sale {0} not found")]
    SaleNotFound(Uuid),
    #[error("sale {0} is not accepting purchases")]
    SaleNotActive(Uuid),
    #[error("sold out: requested {requested}, available {available}")]
    SoldOut { requested: u32, available: u32 },
    #[error("per-customer limit of {max_per_customer} exceeded ({committed} already held or purchased)")]
    LimitExceeded { max_per_customer: u32, committed: u32 },
    #[error("quantity must be at least 1")]
    InvalidQuantity,
    #[error("reservation {0} not found")]
    NotFound(Uuid),
    #[error("reservation {id} is already {status:?}")]
    AlreadyTerminal { id: Uuid, status: ReservationStatus },
    #[error("reservation {0} expired")]
    Expired(Uuid),
}

impl ReservationError {
    /// Admission-time failures map onto a user-visible denial reason.
    /// Lifecycle errors (confirm/release on an existing hold) do not.
    pub fn denial_reason(&self) -> Option<DenialReason> {
        match self {
            ReservationError::SaleNotFound(_) => Some(DenialReason::SaleNotFound),
            ReservationError::SaleNotActive(_) => Some(DenialReason::SaleNotActive),
            ReservationError::SoldOut { .. } => Some(DenialReason::SoldOut),
            ReservationError::LimitExceeded { .. } => Some(DenialReason::LimitExceeded),
            ReservationError::InvalidQuantity => Some(DenialReason::InvalidQuantity),
            ReservationError::NotFound(_)
            | ReservationError::AlreadyTerminal { .. }
            | ReservationError::Expired(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentErrorKind {
    Declined,
    Transient,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PaymentError {
    #[error("payment declined: {0}")]
    Declined(String),
    #[error("transient payment failure: {0}")]
    Transient(String),
    #[error("payment failed: {0}")]
    Unknown(String),
}

impl PaymentError {
    pub fn kind(&self) -> PaymentErrorKind {
        match self {
            PaymentError::Declined(_) => PaymentErrorKind::Declined,
            PaymentError::Transient(_) => PaymentErrorKind::Transient,
            PaymentError::Unknown(_) => PaymentErrorKind::Unknown,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind() == PaymentErrorKind::Transient
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    #[error("purchase queue is shut down")]
    Closed,
    #[error(transparent)]
    Reservation(#[from] ReservationError),
}
