pub mod executor;
pub mod models;
pub mod queue;

pub use executor::{
    ChargeReceipt, ChargeRequest, PaymentExecutor, SimulatedPaymentConfig, SimulatedPaymentExecutor,
};
pub use models::{JobState, PurchaseJob, QueueConfig, QueueStats, QueueTotals};
pub use queue::PurchaseQueue;
