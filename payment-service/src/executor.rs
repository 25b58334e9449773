use async_trait::async_trait;
use bigdecimal::BigDecimal;
use serde::{Deserialize, Serialize};
use shared::{CustomerId, PaymentError};
use std::collections::HashMap;
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChargeRequest {
    pub customer_id: CustomerId,
    pub amount: BigDecimal,
    pub currency: String,
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChargeReceipt {
    pub transaction_id: String,
}

/// The payment backend. Implementations tag every failure with a
/// [`shared::PaymentErrorKind`] so the queue can tell retryable failures
/// from final ones.
#[async_trait]
pub trait PaymentExecutor: Send + Sync {
    async fn charge(&self, request: ChargeRequest) -> Result<ChargeReceipt, PaymentError>;

    /// Reverses a successful charge whose reservation could not be
    /// confirmed.
    async fn refund(&self, transaction_id: &str) -> Result<(), PaymentError>;
}

#[derive(Debug, Clone)]
pub struct SimulatedPaymentConfig {
    pub success_rate: f64,
    pub transient_rate: f64,
    pub latency: Duration,
}

impl Default for SimulatedPaymentConfig {
    fn default() -> Self {
        Self {
            success_rate: 0.8,
            transient_rate: 0.1,
            latency: Duration::from_millis(50),
        }
    }
}

/// Stand-in backend for local runs: succeeds, fails transiently or declines
/// at the configured rates.
pub struct SimulatedPaymentExecutor {
    config: SimulatedPaymentConfig,
}

impl SimulatedPaymentExecutor {
    pub fn new(config: SimulatedPaymentConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl PaymentExecutor for SimulatedPaymentExecutor {
    async fn charge(&self, request: ChargeRequest) -> Result<ChargeReceipt, PaymentError> {
        let roll = rand::random::<f64>();
        tokio::time::sleep(self.config.latency).await;

        if roll < self.config.success_rate {
            let transaction_id = format!("sim_{}", Uuid::new_v4().simple());
            info!(
                "Charged {} {} to {} ({})",
                request.amount, request.currency, request.customer_id, transaction_id
            );
            Ok(ChargeReceipt { transaction_id })
        } else if roll < self.config.success_rate + self.config.transient_rate {
            Err(PaymentError::Transient("payment network unavailable".to_string()))
        } else {
            Err(PaymentError::Declined("card declined".to_string()))
        }
    }

    async fn refund(&self, transaction_id: &str) -> Result<(), PaymentError> {
        tokio::time::sleep(self.config.latency).await;
        info!("Refunded {}", transaction_id);
        Ok(())
    }
}
