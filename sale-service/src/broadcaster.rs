use inventory_service::InventoryReservationStore;
use payment_service::PurchaseQueue;
use shared::SaleSnapshot;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::RwLock;
use tokio::time;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct BroadcasterConfig {
    pub interval: Duration,
    /// Snapshots a subscriber may fall behind before it is dropped.
    pub buffer: usize,
}

impl Default for BroadcasterConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            buffer: 16,
        }
    }
}

pub struct Subscription {
    pub id: Uuid,
    pub sale_id: Uuid,
    pub receiver: mpsc::Receiver<SaleSnapshot>,
}

type Subscribers = HashMap<Uuid, HashMap<Uuid, mpsc::Sender<SaleSnapshot>>>;

/// Pushes periodic sale snapshots to subscribers. Delivery never waits on a
/// slow reader: a full or closed channel gets the subscriber dropped.
pub struct SaleStateBroadcaster {
    store: Arc<InventoryReservationStore>,
    queue: PurchaseQueue,
    subscribers: RwLock<Subscribers>,
    closed: AtomicBool,
    config: BroadcasterConfig,
}

impl SaleStateBroadcaster {
    pub fn new(store: Arc<InventoryReservationStore>, queue: PurchaseQueue, config: BroadcasterConfig) -> Self {
        Self {
            store,
            queue,
            subscribers: RwLock::new(HashMap::new()),
            closed: AtomicBool::new(false),
            config,
        }
    }

    pub async fn snapshot(&self, sale_id: Uuid) -> Option<SaleSnapshot> {
        let sale = self.store.sale(sale_id).await?;
        let stats = self.queue.stats_for_sale(sale_id).await;
        Some(SaleSnapshot {
            sale_id,
            status: sale.status,
            available_quantity: sale.available_quantity,
            total_quantity: sale.total_quantity,
            queue_depth: stats.queued,
            processing_count: stats.processing,
            percent_sold: sale.percent_sold(),
            taken_at: self.store.clock().now(),
        })
    }

    /// Registers a subscriber and hands it the current snapshot right away.
    /// `None` for an unknown sale. After `close` the subscription yields that
    /// one snapshot and then ends.
    pub async fn subscribe(&self, sale_id: Uuid) -> Option<Subscription> {
        let snapshot = self.snapshot(sale_id).await?;
        let (sender, receiver) = mpsc::channel(self.config.buffer.max(1));
        // Fresh channel with capacity of at least one.
        let _ = sender.try_send(snapshot);

        let id = Uuid::new_v4();
        let mut subscribers = self.subscribers.write().await;
        if self.is_closed() {
            debug!("Broadcaster closed, subscriber {} gets a single snapshot", id);
        } else {
            subscribers.entry(sale_id).or_default().insert(id, sender);
            debug!("Subscriber {} watching sale {}", id, sale_id);
        }

        Some(Subscription { id, sale_id, receiver })
    }

    /// Drops every subscriber so open streams end, and stops `run`.
    pub async fn close(&self) {
        let mut subscribers = self.subscribers.write().await;
        self.closed.store(true, Ordering::SeqCst);
        let dropped: usize = subscribers.values().map(HashMap::len).sum();
        subscribers.clear();
        info!("Snapshot broadcaster closed, {} subscriber(s) dropped", dropped);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub async fn unsubscribe(&self, sale_id: Uuid, subscriber_id: Uuid) -> bool {
        let mut subscribers = self.subscribers.write().await;
        let Some(watchers) = subscribers.get_mut(&sale_id) else {
            return false;
        };
        let removed = watchers.remove(&subscriber_id).is_some();
        if watchers.is_empty() {
            subscribers.remove(&sale_id);
        }
        removed
    }

    pub async fn subscriber_count(&self, sale_id: Uuid) -> usize {
        self.subscribers
            .read()
            .await
            .get(&sale_id)
            .map_or(0, HashMap::len)
    }

    /// One broadcast round. Returns the number of snapshots delivered.
    pub async fn publish_once(&self) -> usize {
        let watched: Vec<Uuid> = self.subscribers.read().await.keys().copied().collect();

        let mut snapshots = Vec::with_capacity(watched.len());
        for sale_id in watched {
            if let Some(snapshot) = self.snapshot(sale_id).await {
                snapshots.push(snapshot);
            }
        }

        let mut delivered = 0;
        let mut subscribers = self.subscribers.write().await;
        for snapshot in snapshots {
            let sale_id = snapshot.sale_id;
            let Some(watchers) = subscribers.get_mut(&sale_id) else {
                continue;
            };
            watchers.retain(|id, sender| match sender.try_send(snapshot.clone()) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(TrySendError::Full(_)) => {
                    warn!("Subscriber {} on sale {} fell behind, dropping it", id, sale_id);
                    false
                }
                Err(TrySendError::Closed(_)) => {
                    debug!("Subscriber {} on sale {} went away", id, sale_id);
                    false
                }
            });
            if watchers.is_empty() {
                subscribers.remove(&sale_id);
            }
        }
        delivered
    }

    pub async fn run(&self) {
        let mut interval = time::interval(self.config.interval.max(Duration::from_millis(1)));
        interval.set_missed_tick_behavior(time::MissedTickBehavior::Skip);

        loop {
            interval.tick().await;
            if self.is_closed() {
                debug!("Snapshot publisher stopped");
                return;
            }
            self.publish_once().await;
        }
    }
}
