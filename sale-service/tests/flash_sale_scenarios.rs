//! End-to-end admission scenarios: rate limiter, store, queue and workers
//! wired together the way the binary wires them.

use bigdecimal::BigDecimal;
use chrono::{Duration as ChronoDuration, Utc};
use futures::future::join_all;
use inventory_service::{ExpirySweeper, InventoryReservationStore, StoreConfig};
use payment_service::{PurchaseQueue, QueueConfig, SimulatedPaymentConfig, SimulatedPaymentExecutor};
use sale_service::*;
use shared::*;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

struct Stack {
    coordinator: Arc<SaleCoordinator>,
    store: Arc<InventoryReservationStore>,
    queue: PurchaseQueue,
    clock: Arc<ManualClock>,
}

fn payments(success_rate: f64) -> SimulatedPaymentConfig {
    SimulatedPaymentConfig {
        success_rate,
        transient_rate: 0.0,
        latency: Duration::from_millis(1),
    }
}

fn stack(payment: SimulatedPaymentConfig, rate_limit: u32, start_workers: bool) -> Stack {
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let store = Arc::new(InventoryReservationStore::new(
        clock.clone(),
        StoreConfig { hold_ttl: ChronoDuration::minutes(10) },
    ));
    let queue = PurchaseQueue::new(
        store.clone(),
        Arc::new(SimulatedPaymentExecutor::new(payment)),
        QueueConfig {
            workers: 4,
            max_attempts: 3,
            base_backoff: Duration::from_millis(5),
            payment_timeout: Duration::from_secs(1),
        },
    );
    if start_workers {
        queue.start();
    }
    let limiter = Arc::new(RateLimiter::new(
        clock.clone(),
        RateLimitConfig { window: ChronoDuration::seconds(60), max_attempts: rate_limit },
    ));
    let coordinator = Arc::new(SaleCoordinator::new(limiter, store.clone(), queue.clone()));
    Stack { coordinator, store, queue, clock }
}

fn new_sale(total: u32, max_per_customer: u32, start_offset: ChronoDuration, now: chrono::DateTime<Utc>) -> NewSale {
    NewSale {
        sale_id: None,
        product_id: Uuid::new_v4(),
        original_price: BigDecimal::from(120),
        sale_price: BigDecimal::from(45),
        currency: "USD".to_string(),
        total_quantity: total,
        start_time: now + start_offset,
        end_time: now + start_offset + ChronoDuration::hours(1),
        max_per_customer,
    }
}

async fn active_sale(stack: &Stack, total: u32, max_per_customer: u32) -> Uuid {
    let sale = stack
        .store
        .create_sale(new_sale(total, max_per_customer, ChronoDuration::zero(), stack.clock.now()))
        .await
        .unwrap();
    stack.store.start_sale(sale.id).await.unwrap();
    sale.id
}

async fn wait_for_idle(queue: &PurchaseQueue) {
    for _ in 0..300 {
        if queue.stats().await == payment_service::QueueStats::default() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("queue never drained");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn twenty_customers_race_for_ten_units() {
    let stack = stack(payments(1.0), 5, true);
    let sale_id = active_sale(&stack, 10, 2).await;

    let attempts = (0..20).map(|i| {
        let coordinator = stack.coordinator.clone();
        tokio::spawn(async move { coordinator.attempt_purchase(sale_id, &format!("customer-{i}"), 1).await })
    });
    let outcomes: Vec<AdmissionOutcome> = join_all(attempts).await.into_iter().map(Result::unwrap).collect();

    let accepted = outcomes.iter().filter(|o| o.is_accepted()).count();
    let sold_out = outcomes
        .iter()
        .filter(|o| o.denial_reason() == Some(DenialReason::SoldOut))
        .count();
    assert_eq!(accepted, 10);
    assert_eq!(sold_out, 10);

    wait_for_idle(&stack.queue).await;
    let audit = stack.store.audit(sale_id).await.unwrap();
    assert_eq!(audit.confirmed, 10);
    assert_eq!(audit.available, 0);
    assert_eq!(stack.queue.totals().await.paid, 10);
}

#[tokio::test]
async fn customer_cap_spans_separate_purchases() {
    let stack = stack(payments(1.0), 10, true);
    let sale_id = active_sale(&stack, 50, 2).await;

    assert!(stack.coordinator.attempt_purchase(sale_id, "alice", 1).await.is_accepted());
    wait_for_idle(&stack.queue).await;
    assert!(stack.coordinator.attempt_purchase(sale_id, "alice", 1).await.is_accepted());

    assert_eq!(
        stack.coordinator.attempt_purchase(sale_id, "alice", 1).await.denial_reason(),
        Some(DenialReason::LimitExceeded)
    );
    wait_for_idle(&stack.queue).await;
    assert_eq!(stack.store.purchase_count(sale_id, "alice").await.unwrap().purchased, 2);
    assert_eq!(
        stack.coordinator.attempt_purchase(sale_id, "alice", 1).await.denial_reason(),
        Some(DenialReason::LimitExceeded)
    );
}

#[tokio::test]
async fn second_pair_hits_the_customer_cap() {
    let stack = stack(payments(1.0), 5, false);
    let sale_id = active_sale(&stack, 10, 2).await;

    assert!(stack.coordinator.attempt_purchase(sale_id, "alice", 2).await.is_accepted());
    assert_eq!(
        stack.coordinator.attempt_purchase(sale_id, "alice", 2).await.denial_reason(),
        Some(DenialReason::LimitExceeded)
    );
    assert_eq!(stack.store.sale(sale_id).await.unwrap().available_quantity, 8);
}

#[tokio::test]
async fn sixth_rapid_attempt_is_rate_limited() {
    let stack = stack(payments(1.0), 5, false);
    let sale_id = active_sale(&stack, 100, 100).await;

    for _ in 0..5 {
        assert!(stack.coordinator.attempt_purchase(sale_id, "bot", 1).await.is_accepted());
    }
    match stack.coordinator.attempt_purchase(sale_id, "bot", 1).await {
        AdmissionOutcome::Denied { reason, retry_after } => {
            assert_eq!(reason, DenialReason::RateLimited);
            assert_eq!(retry_after, Some(Duration::from_secs(60)));
        }
        other => panic!("expected rate limit, got {other:?}"),
    }
    assert_eq!(stack.store.sale(sale_id).await.unwrap().available_quantity, 95);

    stack.clock.advance(ChronoDuration::seconds(61));
    assert!(stack.coordinator.attempt_purchase(sale_id, "bot", 1).await.is_accepted());
}

#[tokio::test]
async fn unpaid_hold_expires_and_stock_returns() {
    let stack = stack(payments(1.0), 5, false);
    let sale_id = active_sale(&stack, 1, 1).await;
    let sweeper = ExpirySweeper::new(stack.store.clone(), Duration::from_millis(10));

    let AdmissionOutcome::Accepted { reservation_id, expires_at, .. } =
        stack.coordinator.attempt_purchase(sale_id, "alice", 1).await
    else {
        panic!("expected acceptance");
    };
    assert_eq!(expires_at, stack.clock.now() + ChronoDuration::minutes(10));
    assert_eq!(
        stack.coordinator.attempt_purchase(sale_id, "bob", 1).await.denial_reason(),
        Some(DenialReason::SoldOut)
    );

    stack.clock.advance(ChronoDuration::minutes(10) + ChronoDuration::seconds(1));
    assert_eq!(sweeper.sweep_once().await.expired, 1);

    let reservation = stack.coordinator.reservation(reservation_id).await.unwrap();
    assert_eq!(reservation.status, ReservationStatus::Expired);
    assert_eq!(reservation.release_reason, Some(ReleaseReason::Expired));
    assert!(stack.coordinator.attempt_purchase(sale_id, "bob", 1).await.is_accepted());
}

#[tokio::test]
async fn declined_payments_put_units_back() {
    let stack = stack(payments(0.0), 5, true);
    let sale_id = active_sale(&stack, 3, 3).await;

    let AdmissionOutcome::Accepted { reservation_id, .. } =
        stack.coordinator.attempt_purchase(sale_id, "alice", 3).await
    else {
        panic!("expected acceptance");
    };
    wait_for_idle(&stack.queue).await;

    let reservation = stack.coordinator.reservation(reservation_id).await.unwrap();
    assert_eq!(reservation.status, ReservationStatus::Released);
    assert_eq!(reservation.release_reason, Some(ReleaseReason::PaymentDeclined));
    assert_eq!(stack.store.sale(sale_id).await.unwrap().available_quantity, 3);
    assert_eq!(stack.store.purchase_count(sale_id, "alice").await.unwrap().purchased, 0);
}

#[tokio::test]
async fn scheduled_sale_opens_on_the_sweep() {
    let stack = stack(payments(1.0), 5, false);
    let sale = stack
        .store
        .create_sale(new_sale(5, 1, ChronoDuration::minutes(5), stack.clock.now()))
        .await
        .unwrap();
    let sweeper = ExpirySweeper::new(stack.store.clone(), Duration::from_millis(10));

    assert_eq!(
        stack.coordinator.attempt_purchase(sale.id, "alice", 1).await.denial_reason(),
        Some(DenialReason::SaleNotActive)
    );

    stack.clock.advance(ChronoDuration::minutes(5));
    assert_eq!(sweeper.sweep_once().await.status_changes, 1);
    assert_eq!(stack.store.sale(sale.id).await.unwrap().status, SaleStatus::Active);
    assert!(stack.coordinator.attempt_purchase(sale.id, "alice", 1).await.is_accepted());

    stack.clock.advance(ChronoDuration::hours(1));
    sweeper.sweep_once().await;
    assert_eq!(stack.store.sale(sale.id).await.unwrap().status, SaleStatus::Ended);
    assert_eq!(
        stack.coordinator.attempt_purchase(sale.id, "bob", 1).await.denial_reason(),
        Some(DenialReason::SaleNotActive)
    );
}

#[tokio::test]
async fn broadcaster_reports_a_sell_out() {
    let stack = stack(payments(1.0), 5, true);
    let sale_id = active_sale(&stack, 2, 2).await;
    let broadcaster = SaleStateBroadcaster::new(
        stack.store.clone(),
        stack.queue.clone(),
        BroadcasterConfig::default(),
    );
    let mut subscription = broadcaster.subscribe(sale_id).await.unwrap();
    assert_eq!(subscription.receiver.recv().await.unwrap().available_quantity, 2);

    assert!(stack.coordinator.attempt_purchase(sale_id, "alice", 2).await.is_accepted());
    wait_for_idle(&stack.queue).await;
    broadcaster.publish_once().await;

    let snapshot = subscription.receiver.recv().await.unwrap();
    assert_eq!(snapshot.available_quantity, 0);
    assert_eq!(snapshot.percent_sold, 100.0);
    assert_eq!(snapshot.queue_depth, 0);
    assert_eq!(snapshot.processing_count, 0);
}
