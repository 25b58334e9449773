use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Json, Response,
    },
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use shared::*;
use std::convert::Infallible;
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_stream::wrappers::ReceiverStream;
use uuid::Uuid;

use crate::broadcaster::SaleStateBroadcaster;
use crate::coordinator::{AdmissionOutcome, SaleCoordinator};

#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<SaleCoordinator>,
    pub broadcaster: Arc<SaleStateBroadcaster>,
}

#[derive(Debug, Deserialize)]
pub struct PurchaseRequest {
    pub customer_id: CustomerId,
    #[serde(default = "default_quantity")]
    pub quantity: u32,
}

fn default_quantity() -> u32 {
    1
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PurchaseAccepted {
    pub status: String,
    pub reservation_id: Uuid,
    pub job_id: Uuid,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PurchaseDenied {
    pub status: String,
    pub reason: DenialReason,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_secs: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ReservationResponse {
    pub reservation_id: Uuid,
    pub sale_id: Uuid,
    pub status: ReservationStatus,
    pub quantity: u32,
    pub expires_at: DateTime<Utc>,
    pub release_reason: Option<ReleaseReason>,
}

impl From<Reservation> for ReservationResponse {
    fn from(reservation: Reservation) -> Self {
        Self {
            reservation_id: reservation.id,
            sale_id: reservation.sale_id,
            status: reservation.status,
            quantity: reservation.quantity,
            expires_at: reservation.expires_at,
            release_reason: reservation.release_reason,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CancelResponse {
    pub reservation_id: Uuid,
    pub released: bool,
    pub status: ReservationStatus,
}

#[derive(Debug, Serialize)]
pub struct SaleDetails {
    pub sale: Sale,
    pub snapshot: SaleSnapshot,
    pub audit: InventoryAudit,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, error: impl ToString) -> ApiError {
    (status, Json(ErrorResponse { error: error.to_string() }))
}

fn sale_error(e: SaleError) -> ApiError {
    let status = match e {
        SaleError::Invalid(_) => StatusCode::UNPROCESSABLE_ENTITY,
        SaleError::Duplicate(_) | SaleError::InvalidTransition { .. } => StatusCode::CONFLICT,
        SaleError::NotFound(_) => StatusCode::NOT_FOUND,
    };
    api_error(status, e)
}

fn reservation_error(e: ReservationError) -> ApiError {
    let status = match e {
        ReservationError::NotFound(_) | ReservationError::SaleNotFound(_) => StatusCode::NOT_FOUND,
        ReservationError::InvalidQuantity => StatusCode::BAD_REQUEST,
        _ => StatusCode::CONFLICT,
    };
    api_error(status, e)
}

fn denial_status(reason: DenialReason) -> StatusCode {
    match reason {
        DenialReason::RateLimited => StatusCode::TOO_MANY_REQUESTS,
        DenialReason::SaleNotFound => StatusCode::NOT_FOUND,
        DenialReason::SaleNotActive | DenialReason::SoldOut => StatusCode::CONFLICT,
        DenialReason::LimitExceeded => StatusCode::FORBIDDEN,
        DenialReason::InvalidQuantity => StatusCode::BAD_REQUEST,
        DenialReason::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
    }
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/sales", post(create_sale).get(list_sales))
        .route("/sales/:sale_id", get(get_sale))
        .route("/sales/:sale_id/start", post(start_sale))
        .route("/sales/:sale_id/end", post(end_sale))
        .route("/sales/:sale_id/purchase", post(purchase))
        .route(
            "/sales/:sale_id/reservations/:reservation_id",
            get(get_reservation).delete(cancel_reservation),
        )
        .route("/sales/:sale_id/stream", get(stream_sale))
        .route("/health", get(health_check))
        .with_state(state)
        .layer(
            tower_http::cors::CorsLayer::new()
                .allow_origin(tower_http::cors::Any)
                .allow_methods(tower_http::cors::Any)
                .allow_headers(tower_http::cors::Any),
        )
}

/// Serves the router until `signal` fires. Snapshot streams are closed at
/// that point so graceful shutdown is not held open by watchers.
pub async fn serve<F>(listener: TcpListener, state: AppState, signal: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let broadcaster = state.broadcaster.clone();
    let app = create_router(state);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            signal.await;
            broadcaster.close().await;
        })
        .await
}

pub async fn create_sale(
    State(state): State<AppState>,
    Json(request): Json<NewSale>,
) -> Result<(StatusCode, Json<Sale>), ApiError> {
    let sale = state
        .coordinator
        .store()
        .create_sale(request)
        .await
        .map_err(sale_error)?;
    tracing::info!("Created sale {} for product {}", sale.id, sale.product_id);
    Ok((StatusCode::CREATED, Json(sale)))
}

pub async fn list_sales(State(state): State<AppState>) -> Json<Vec<Sale>> {
    Json(state.coordinator.store().sales().await)
}

pub async fn get_sale(
    State(state): State<AppState>,
    Path(sale_id): Path<Uuid>,
) -> Result<Json<SaleDetails>, ApiError> {
    let store = state.coordinator.store();
    let not_found = || sale_error(SaleError::NotFound(sale_id));

    let sale = store.sale(sale_id).await.ok_or_else(not_found)?;
    let snapshot = state.broadcaster.snapshot(sale_id).await.ok_or_else(not_found)?;
    let audit = store.audit(sale_id).await.ok_or_else(not_found)?;
    Ok(Json(SaleDetails { sale, snapshot, audit }))
}

pub async fn start_sale(
    State(state): State<AppState>,
    Path(sale_id): Path<Uuid>,
) -> Result<Json<Sale>, ApiError> {
    let sale = state
        .coordinator
        .store()
        .start_sale(sale_id)
        .await
        .map_err(sale_error)?;
    Ok(Json(sale))
}

pub async fn end_sale(
    State(state): State<AppState>,
    Path(sale_id): Path<Uuid>,
) -> Result<Json<Sale>, ApiError> {
    let sale = state
        .coordinator
        .store()
        .end_sale(sale_id)
        .await
        .map_err(sale_error)?;
    Ok(Json(sale))
}

pub async fn purchase(
    State(state): State<AppState>,
    Path(sale_id): Path<Uuid>,
    Json(request): Json<PurchaseRequest>,
) -> Response {
    let outcome = state
        .coordinator
        .attempt_purchase(sale_id, &request.customer_id, request.quantity)
        .await;

    match outcome {
        AdmissionOutcome::Accepted { reservation_id, job_id, expires_at } => (
            StatusCode::ACCEPTED,
            Json(PurchaseAccepted {
                status: "accepted".to_string(),
                reservation_id,
                job_id,
                expires_at,
            }),
        )
            .into_response(),
        AdmissionOutcome::Denied { reason, retry_after } => {
            // Round up so clients never retry a moment too early.
            let retry_after_secs = retry_after.map(|d| d.as_secs() + u64::from(d.subsec_nanos() > 0));
            let body = Json(PurchaseDenied {
                status: "denied".to_string(),
                reason,
                retry_after_secs,
            });
            match retry_after_secs {
                Some(secs) => (
                    denial_status(reason),
                    [(header::RETRY_AFTER, secs.to_string())],
                    body,
                )
                    .into_response(),
                None => (denial_status(reason), body).into_response(),
            }
        }
    }
}

pub async fn get_reservation(
    State(state): State<AppState>,
    Path((sale_id, reservation_id)): Path<(Uuid, Uuid)>,
) -> Result<Json<ReservationResponse>, ApiError> {
    let reservation = state
        .coordinator
        .reservation(reservation_id)
        .await
        .map_err(reservation_error)?;
    if reservation.sale_id != sale_id {
        return Err(reservation_error(ReservationError::NotFound(reservation_id)));
    }
    Ok(Json(reservation.into()))
}

pub async fn cancel_reservation(
    State(state): State<AppState>,
    Path((sale_id, reservation_id)): Path<(Uuid, Uuid)>,
) -> Result<Json<CancelResponse>, ApiError> {
    let reservation = state
        .coordinator
        .reservation(reservation_id)
        .await
        .map_err(reservation_error)?;
    if reservation.sale_id != sale_id {
        return Err(reservation_error(ReservationError::NotFound(reservation_id)));
    }

    let released = state
        .coordinator
        .cancel(reservation_id)
        .await
        .map_err(reservation_error)?;
    let status = state
        .coordinator
        .get_status(reservation_id)
        .await
        .map_err(reservation_error)?;
    Ok(Json(CancelResponse { reservation_id, released, status }))
}

pub async fn stream_sale(
    State(state): State<AppState>,
    Path(sale_id): Path<Uuid>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let subscription = state
        .broadcaster
        .subscribe(sale_id)
        .await
        .ok_or_else(|| sale_error(SaleError::NotFound(sale_id)))?;

    let stream = ReceiverStream::new(subscription.receiver).map(|snapshot| {
        let event = Event::default()
            .event("snapshot")
            .json_data(&snapshot)
            .unwrap_or_else(|_| Event::default().comment("snapshot unavailable"));
        Ok(event)
    });
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

pub async fn health_check() -> &'static str {
    "OK"
}
