use axum::{
    extract::{Path, State},
    http::HeaderMap,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::entities::{reservation, reservation_line};
use crate::errors::ServiceError;
use crate::fingerprint;
use crate::handlers::common::{CallerId, IDEMPOTENCY_KEY_HEADER};
use crate::services::checkout::{Address, ConfirmInput, ReserveInput};
use crate::AppState;

pub fn checkout_routes() -> Router<AppState> {
    Router::new()
        .route("/reserve", post(reserve))
        .route("/confirm", post(confirm))
}

pub fn reservation_routes() -> Router<AppState> {
    Router::new().route("/:id", get(get_reservation))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReserveRequest {
    #[serde(default)]
    address: Address,
    #[serde(default)]
    shipping_method: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ReserveResponse {
    reservation_id: Uuid,
    expires_at: DateTime<Utc>,
}

/// Phase 1: hold the caller's cart against the stock pool.
async fn reserve(
    State(state): State<AppState>,
    caller: CallerId,
    Json(body): Json<ReserveRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    let outcome = state
        .services
        .checkout
        .reserve(
            &caller.0,
            ReserveInput {
                address: body.address,
                shipping_method: body.shipping_method,
            },
        )
        .await?;

    Ok(Json(ReserveResponse {
        reservation_id: outcome.reservation_id,
        expires_at: outcome.expires_at,
    }))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ConfirmResponse {
    order_id: Uuid,
    status: String,
}

/// Phase 2: commit a hold into an order, exactly once per idempotency key.
///
/// The body is taken as raw JSON so the fingerprint covers exactly what the
/// caller sent, canonicalized.
async fn confirm(
    State(state): State<AppState>,
    caller: CallerId,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Result<impl IntoResponse, ServiceError> {
    let idempotency_key = headers
        .get(IDEMPOTENCY_KEY_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| {
            ServiceError::Validation("Idempotency-Key header is required".to_string())
        })?
        .to_string();

    let reservation_id = body
        .get("reservationId")
        .and_then(Value::as_str)
        .ok_or_else(|| ServiceError::Validation("reservationId is required".to_string()))?;
    let reservation_id = Uuid::parse_str(reservation_id)
        .map_err(|_| ServiceError::Validation("reservationId must be a UUID".to_string()))?;

    let outcome = state
        .services
        .checkout
        .confirm(
            &caller.0,
            ConfirmInput {
                reservation_id,
                idempotency_key,
                fingerprint: fingerprint::fingerprint(&body),
            },
        )
        .await?;

    Ok(Json(ConfirmResponse {
        order_id: outcome.order_id,
        status: outcome.status,
    }))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ReservationLineResponse {
    product_id: Uuid,
    sku: String,
    name: String,
    unit_price: i64,
    quantity: i32,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ReservationResponse {
    reservation_id: Uuid,
    status: String,
    shipping_method: String,
    address: AddressResponse,
    lines: Vec<ReservationLineResponse>,
    expires_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
    is_valid: bool,
}

#[derive(Debug, Serialize)]
struct AddressResponse {
    name: String,
    phone: String,
    line1: String,
    city: String,
    state: String,
    pincode: String,
}

impl ReservationResponse {
    fn from_parts(
        model: reservation::Model,
        lines: Vec<reservation_line::Model>,
        is_valid: bool,
    ) -> Self {
        Self {
            reservation_id: model.id,
            status: model.status.clone(),
            shipping_method: model.shipping_method.clone(),
            address: AddressResponse {
                name: model.ship_to_name,
                phone: model.ship_to_phone,
                line1: model.ship_to_line1,
                city: model.ship_to_city,
                state: model.ship_to_state,
                pincode: model.ship_to_pincode,
            },
            lines: lines
                .into_iter()
                .map(|line| ReservationLineResponse {
                    product_id: line.product_id,
                    sku: line.sku,
                    name: line.name,
                    unit_price: line.unit_price,
                    quantity: line.quantity,
                })
                .collect(),
            expires_at: model.expires_at,
            created_at: model.created_at,
            is_valid,
        }
    }
}

/// Read-back of one hold, including whether it can still be confirmed.
async fn get_reservation(
    State(state): State<AppState>,
    caller: CallerId,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ServiceError> {
    let (model, lines, is_valid) = state
        .services
        .checkout
        .get_reservation(&caller.0, id)
        .await?;

    Ok(Json(ReservationResponse::from_parts(model, lines, is_valid)))
}
