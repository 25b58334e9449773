use anyhow::Result;
use clap::Parser;
use inventory_service::{ExpirySweeper, InventoryReservationStore};
use payment_service::{PurchaseQueue, SimulatedPaymentExecutor};
use sale_service::api;
use sale_service::config::{self, Args};
use sale_service::{RateLimiter, SaleCoordinator, SaleStateBroadcaster};
use shared::{Clock, SystemClock};
use std::sync::Arc;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let store = Arc::new(InventoryReservationStore::new(clock.clone(), args.store_config()));

    if let Some(path) = &args.sales_file {
        info!("Loading sales from {}", path.display());
        let sales = config::load_sales_file(path, &store).await?;
        info!("Loaded {} sale(s)", sales.len());
    }

    let executor = Arc::new(SimulatedPaymentExecutor::new(args.payment_config()));
    let queue = PurchaseQueue::new(store.clone(), executor, args.queue_config());
    let workers = queue.start();

    let limiter = Arc::new(RateLimiter::new(clock.clone(), args.rate_limit_config()));
    let coordinator = Arc::new(SaleCoordinator::new(limiter.clone(), store.clone(), queue.clone()));
    let broadcaster = Arc::new(SaleStateBroadcaster::new(
        store.clone(),
        queue.clone(),
        args.broadcaster_config(),
    ));

    let sweeper = ExpirySweeper::new(store.clone(), args.sweep_interval());
    tokio::spawn(async move {
        sweeper.run().await;
    });

    let janitor_interval = args.janitor_interval();
    tokio::spawn(async move {
        limiter.run_janitor(janitor_interval).await;
    });

    let publisher = broadcaster.clone();
    tokio::spawn(async move {
        publisher.run().await;
    });

    let app_state = api::AppState {
        coordinator,
        broadcaster,
    };

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", args.port)).await?;

    info!("Sale service web server started on port {}", args.port);
    info!("Sale service ready to accept purchases at http://0.0.0.0:{}/sales", args.port);

    api::serve(listener, app_state, shutdown_signal()).await?;

    queue.shutdown().await;
    for worker in workers {
        worker.await?;
    }
    info!("Purchase workers drained, exiting");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
