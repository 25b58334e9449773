use anyhow::Result;
use clap::Parser;
use inventory_service::{InventoryReservationStore, StoreConfig};
use payment_service::{QueueConfig, SimulatedPaymentConfig};
use shared::{NewSale, Sale};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::broadcaster::BroadcasterConfig;
use crate::rate_limiter::RateLimitConfig;

const MAX_WINDOW_SECS: i64 = 86_400;

#[derive(Parser, Debug, Clone)]
#[command(name = "sale-service")]
pub struct Args {
    #[arg(long, env = "PORT", default_value = "3001")]
    pub port: u16,

    /// JSON array of sales to create at startup.
    #[arg(long, env = "SALES_FILE")]
    pub sales_file: Option<PathBuf>,

    #[arg(long, env = "PURCHASE_WORKERS", default_value = "10")]
    pub workers: usize,

    #[arg(long, env = "PAYMENT_MAX_ATTEMPTS", default_value = "3")]
    pub payment_max_attempts: u32,

    #[arg(long, default_value = "200")]
    pub payment_backoff_ms: u64,

    #[arg(long, default_value = "5000", value_parser = clap::value_parser!(u64).range(1..))]
    pub payment_timeout_ms: u64,

    /// At most one day.
    #[arg(long, env = "HOLD_TTL_SECS", default_value = "600", value_parser = clap::value_parser!(i64).range(1..=MAX_WINDOW_SECS))]
    pub hold_ttl_secs: i64,

    #[arg(long, default_value = "1000", value_parser = clap::value_parser!(u64).range(1..))]
    pub sweep_interval_ms: u64,

    #[arg(long, env = "RATE_LIMIT_WINDOW_SECS", default_value = "60", value_parser = clap::value_parser!(i64).range(1..=MAX_WINDOW_SECS))]
    pub rate_limit_window_secs: i64,

    #[arg(long, env = "RATE_LIMIT_MAX_ATTEMPTS", default_value = "5")]
    pub rate_limit_max_attempts: u32,

    #[arg(long, default_value = "1000", value_parser = clap::value_parser!(u64).range(1..))]
    pub broadcast_interval_ms: u64,

    #[arg(long, default_value = "16")]
    pub subscriber_buffer: usize,

    #[arg(long, default_value = "0.8")]
    pub payment_success_rate: f64,

    #[arg(long, default_value = "0.1")]
    pub payment_transient_rate: f64,

    #[arg(long, default_value = "50")]
    pub payment_latency_ms: u64,
}

impl Args {
    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {
            hold_ttl: chrono::Duration::seconds(self.hold_ttl_secs),
        }
    }

    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig {
            workers: self.workers.max(1),
            max_attempts: self.payment_max_attempts.max(1),
            base_backoff: Duration::from_millis(self.payment_backoff_ms),
            payment_timeout: Duration::from_millis(self.payment_timeout_ms),
        }
    }

    pub fn rate_limit_config(&self) -> RateLimitConfig {
        RateLimitConfig {
            window: chrono::Duration::seconds(self.rate_limit_window_secs),
            max_attempts: self.rate_limit_max_attempts,
        }
    }

    pub fn broadcaster_config(&self) -> BroadcasterConfig {
        BroadcasterConfig {
            interval: Duration::from_millis(self.broadcast_interval_ms),
            buffer: self.subscriber_buffer,
        }
    }

    pub fn payment_config(&self) -> SimulatedPaymentConfig {
        SimulatedPaymentConfig {
            success_rate: self.payment_success_rate,
            transient_rate: self.payment_transient_rate,
            latency: Duration::from_millis(self.payment_latency_ms),
        }
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    /// Idle rate-limit windows are pruned once per window length.
    pub fn janitor_interval(&self) -> Duration {
        Duration::from_secs(self.rate_limit_window_secs.max(1).unsigned_abs())
    }
}

pub fn parse_sales(json: &str) -> Result<Vec<NewSale>> {
    serde_json::from_str(json).map_err(|e| anyhow::anyhow!("Invalid sales file: {}", e))
}

pub async fn load_sales_file(path: &Path, store: &InventoryReservationStore) -> Result<Vec<Sale>> {
    let contents = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to read {}: {}", path.display(), e))?;

    let mut created = Vec::new();
    for new_sale in parse_sales(&contents)? {
        let sale = store.create_sale(new_sale).await?;
        created.push(sale);
    }
    Ok(created)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let args = Args::parse_from(["sale-service"]);
        assert_eq!(args.port, 3001);
        assert_eq!(args.queue_config().workers, 10);
        assert_eq!(args.queue_config().max_attempts, 3);
        assert_eq!(args.rate_limit_config().max_attempts, 5);
        assert_eq!(args.rate_limit_config().window, chrono::Duration::seconds(60));
        assert_eq!(args.store_config().hold_ttl, chrono::Duration::minutes(10));
        assert_eq!(args.broadcaster_config().interval, Duration::from_secs(1));
        assert!(args.sales_file.is_none());
    }

    #[test]
    fn flags_override_defaults() {
        let args = Args::parse_from([
            "sale-service",
            "--workers",
            "2",
            "--hold-ttl-secs",
            "30",
            "--payment-success-rate",
            "1.0",
        ]);
        assert_eq!(args.queue_config().workers, 2);
        assert_eq!(args.store_config().hold_ttl, chrono::Duration::seconds(30));
        assert_eq!(args.payment_config().success_rate, 1.0);
    }

    #[test]
    fn rejects_values_that_would_stall_background_loops() {
        for flag in ["--sweep-interval-ms", "--broadcast-interval-ms", "--payment-timeout-ms"] {
            assert!(Args::try_parse_from(["sale-service", flag, "0"]).is_err(), "{flag} accepted 0");
        }
        for flag in ["--hold-ttl-secs", "--rate-limit-window-secs"] {
            assert!(Args::try_parse_from(["sale-service", flag, "0"]).is_err(), "{flag} accepted 0");
            assert!(Args::try_parse_from(["sale-service", flag, "-5"]).is_err(), "{flag} accepted -5");
            assert!(Args::try_parse_from(["sale-service", flag, "86401"]).is_err(), "{flag} accepted 86401");
            assert!(Args::try_parse_from(["sale-service", flag, "86400"]).is_ok());
        }
    }

    #[test]
    fn parses_sales_json() {
        let json = r#"[{
            "product_id": "6f1c1f9e-3a57-4d8e-9b47-2f4c2d6c1a10",
            "original_price": "49.99",
            "sale_price": "19.99",
            "total_quantity": 100,
            "start_time": "2026-11-27T00:00:00Z",
            "end_time": "2026-11-27T01:00:00Z",
            "max_per_customer": 2
        }]"#;
        let sales = parse_sales(json).unwrap();
        assert_eq!(sales.len(), 1);
        assert_eq!(sales[0].currency, "USD");
        assert!(sales[0].validate().is_ok());

        assert!(parse_sales("{not json").is_err());
    }

    #[tokio::test]
    async fn loads_sales_into_the_store() {
        let path = std::env::temp_dir().join(format!("sales-{}.json", uuid::Uuid::new_v4()));
        tokio::fs::write(
            &path,
            r#"[{
                "product_id": "6f1c1f9e-3a57-4d8e-9b47-2f4c2d6c1a10",
                "original_price": 50,
                "sale_price": 25,
                "total_quantity": 10,
                "start_time": "2026-11-27T00:00:00Z",
                "end_time": "2026-11-27T01:00:00Z",
                "max_per_customer": 1
            }]"#,
        )
        .await
        .unwrap();

        let store = InventoryReservationStore::new(
            std::sync::Arc::new(shared::SystemClock),
            StoreConfig::default(),
        );
        let created = load_sales_file(&path, &store).await.unwrap();
        tokio::fs::remove_file(&path).await.unwrap();

        assert_eq!(created.len(), 1);
        assert_eq!(store.sales().await.len(), 1);
        assert_eq!(created[0].available_quantity, 10);
    }
}
