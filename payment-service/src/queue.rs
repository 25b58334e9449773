use inventory_service::{Checkout, InventoryReservationStore};
use shared::*;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::executor::{ChargeReceipt, ChargeRequest, PaymentExecutor};
use crate::models::*;

#[derive(Default)]
struct QueueState {
    pending: BinaryHeap<QueueEntry>,
    jobs: HashMap<Uuid, PurchaseJob>,
    next_sequence: u64,
    backing_off: usize,
    closed: bool,
    totals: QueueTotals,
}

struct QueueShared {
    state: Mutex<QueueState>,
    notify: Notify,
    store: Arc<InventoryReservationStore>,
    executor: Arc<dyn PaymentExecutor>,
    config: QueueConfig,
}

/// Priority queue of reservations awaiting payment, drained by a fixed pool
/// of workers.
///
/// Every job ends `paid` (reservation confirmed) or `failed` (reservation
/// released). Only transient payment errors loop a job back to `queued`,
/// and only until `max_attempts` is spent.
#[derive(Clone)]
pub struct PurchaseQueue {
    shared: Arc<QueueShared>,
}

impl PurchaseQueue {
    pub fn new(
        store: Arc<InventoryReservationStore>,
        executor: Arc<dyn PaymentExecutor>,
        config: QueueConfig,
    ) -> Self {
        Self {
            shared: Arc::new(QueueShared {
                state: Mutex::new(QueueState::default()),
                notify: Notify::new(),
                store,
                executor,
                config,
            }),
        }
    }

    pub fn start(&self) -> Vec<JoinHandle<()>> {
        info!("Starting {} purchase worker(s)", self.shared.config.workers);
        (0..self.shared.config.workers)
            .map(|worker| {
                let shared = self.shared.clone();
                tokio::spawn(async move {
                    while let Some(job) = shared.next_job().await {
                        shared.process(job).await;
                    }
                    debug!("Purchase worker {} stopped", worker);
                })
            })
            .collect()
    }

    pub async fn enqueue(&self, reservation_id: Uuid, priority: Priority) -> Result<Uuid, QueueError> {
        if self.shared.state.lock().await.closed {
            return Err(QueueError::Closed);
        }
        let reservation = self.shared.store.reservation(reservation_id).await?;

        let mut state = self.shared.state.lock().await;
        if state.closed {
            return Err(QueueError::Closed);
        }
        let sequence = state.next_sequence;
        state.next_sequence += 1;

        let job = PurchaseJob {
            id: Uuid::new_v4(),
            reservation_id,
            sale_id: reservation.sale_id,
            priority,
            attempts: 0,
            state: JobState::Queued,
            enqueued_at: self.shared.store.clock().now(),
            last_error: None,
            sequence,
        };
        let job_id = job.id;
        state.pending.push(QueueEntry { priority, sequence, job_id });
        state.jobs.insert(job_id, job);
        drop(state);

        self.shared.notify.notify_one();
        debug!("Queued job {} for reservation {}", job_id, reservation_id);
        Ok(job_id)
    }

    /// Live job, or `None` once it reached `paid`/`failed` and left the
    /// queue.
    pub async fn job(&self, job_id: Uuid) -> Option<PurchaseJob> {
        self.shared.state.lock().await.jobs.get(&job_id).cloned()
    }

    pub async fn stats(&self) -> QueueStats {
        let state = self.shared.state.lock().await;
        count_states(state.jobs.values())
    }

    pub async fn stats_for_sale(&self, sale_id: Uuid) -> QueueStats {
        let state = self.shared.state.lock().await;
        count_states(state.jobs.values().filter(|job| job.sale_id == sale_id))
    }

    pub async fn totals(&self) -> QueueTotals {
        self.shared.state.lock().await.totals
    }

    /// Stops accepting jobs. Workers finish what is already queued, including
    /// pending retries, and then exit.
    pub async fn shutdown(&self) {
        self.shared.state.lock().await.closed = true;
        self.shared.notify.notify_waiters();
        info!("Purchase queue closed to new jobs");
    }
}

fn count_states<'a>(jobs: impl Iterator<Item = &'a PurchaseJob>) -> QueueStats {
    jobs.fold(QueueStats::default(), |mut stats, job| {
        match job.state {
            JobState::Queued => stats.queued += 1,
            JobState::Processing => stats.processing += 1,
            JobState::Paid | JobState::Failed => {}
        }
        stats
    })
}

impl QueueShared {
    async fn next_job(&self) -> Option<PurchaseJob> {
        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.state.lock().await;
                while let Some(entry) = state.pending.pop() {
                    if let Some(job) = state.jobs.get_mut(&entry.job_id) {
                        job.state = JobState::Processing;
                        job.attempts += 1;
                        return Some(job.clone());
                    }
                }
                if state.closed && state.backing_off == 0 {
                    return None;
                }
            }
            notified.await;
        }
    }

    async fn process(self: &Arc<Self>, job: PurchaseJob) {
        let checkout = match self.store.checkout(job.reservation_id).await {
            Ok(checkout) => checkout,
            Err(e) => {
                warn!(
                    "Job {} dropped: reservation {} is no longer payable ({})",
                    job.id, job.reservation_id, e
                );
                self.finish(job.id, JobState::Failed, Some(e.to_string())).await;
                return;
            }
        };

        match self.charge(&job, &checkout).await {
            Ok(receipt) => self.settle_paid(job, receipt).await,
            Err(e) if e.is_transient() && job.attempts < self.config.max_attempts => {
                self.retry_later(job, e).await
            }
            Err(e) => self.settle_failed(job, e).await,
        }
    }

    async fn charge(&self, job: &PurchaseJob, checkout: &Checkout) -> Result<ChargeReceipt, PaymentError> {
        let metadata = HashMap::from([
            ("sale_id".to_string(), job.sale_id.to_string()),
            ("reservation_id".to_string(), job.reservation_id.to_string()),
            ("job_id".to_string(), job.id.to_string()),
            ("attempt".to_string(), job.attempts.to_string()),
        ]);
        let request = ChargeRequest {
            customer_id: checkout.reservation.customer_id.clone(),
            amount: checkout.amount.clone(),
            currency: checkout.currency.clone(),
            metadata,
        };

        match time::timeout(self.config.payment_timeout, self.executor.charge(request)).await {
            Ok(result) => result,
            Err(_) => Err(PaymentError::Transient(format!(
                "payment timed out after {:?}",
                self.config.payment_timeout
            ))),
        }
    }

    async fn settle_paid(&self, job: PurchaseJob, receipt: ChargeReceipt) {
        match self.store.confirm(job.reservation_id).await {
            Ok(_) => {
                info!(
                    "Job {} paid on attempt {} ({})",
                    job.id, job.attempts, receipt.transaction_id
                );
                self.finish(job.id, JobState::Paid, None).await;
            }
            Err(e) => {
                error!(
                    "Reservation {} could not be confirmed after charge {}: {}; refunding",
                    job.reservation_id, receipt.transaction_id, e
                );
                if let Err(refund_err) = self.executor.refund(&receipt.transaction_id).await {
                    error!("Refund of {} failed: {}", receipt.transaction_id, refund_err);
                }
                self.finish(job.id, JobState::Failed, Some(e.to_string())).await;
            }
        }
    }

    async fn settle_failed(&self, job: PurchaseJob, e: PaymentError) {
        let reason = match e.kind() {
            PaymentErrorKind::Declined => ReleaseReason::PaymentDeclined,
            PaymentErrorKind::Transient | PaymentErrorKind::Unknown => ReleaseReason::PaymentFailed,
        };
        warn!(
            "Job {} failed after {} attempt(s): {}",
            job.id, job.attempts, e
        );
        if let Err(release_err) = self.store.release(job.reservation_id, reason).await {
            error!(
                "Failed to release reservation {}: {}",
                job.reservation_id, release_err
            );
        }
        self.finish(job.id, JobState::Failed, Some(e.to_string())).await;
    }

    async fn retry_later(self: &Arc<Self>, job: PurchaseJob, e: PaymentError) {
        let delay = self.config.backoff_for(job.attempts);
        warn!(
            "Job {} attempt {} failed transiently ({}); retrying in {:?}",
            job.id, job.attempts, e, delay
        );

        {
            let mut state = self.state.lock().await;
            state.backing_off += 1;
            state.totals.retried += 1;
            if let Some(queued) = state.jobs.get_mut(&job.id) {
                queued.state = JobState::Queued;
                queued.last_error = Some(e.to_string());
            }
        }

        let shared = self.clone();
        tokio::spawn(async move {
            time::sleep(delay).await;
            let mut state = shared.state.lock().await;
            state.backing_off -= 1;
            state.pending.push(QueueEntry {
                priority: job.priority,
                sequence: job.sequence,
                job_id: job.id,
            });
            drop(state);
            shared.notify.notify_one();
        });
    }

    async fn finish(&self, job_id: Uuid, outcome: JobState, last_error: Option<String>) {
        let mut state = self.state.lock().await;
        if let Some(mut job) = state.jobs.remove(&job_id) {
            job.state = outcome;
            job.last_error = last_error;
            debug!("Job {} finished as {:?}", job.id, job.state);
        }
        match outcome {
            JobState::Paid => state.totals.paid += 1,
            _ => state.totals.failed += 1,
        }
        let closed = state.closed;
        drop(state);

        if closed {
            self.notify.notify_waiters();
        }
    }
}
