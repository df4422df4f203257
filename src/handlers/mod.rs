pub mod checkout;
pub mod common;

use axum::http::{HeaderValue, Method, StatusCode};
use axum::response::IntoResponse;
use axum::{middleware, Json, Router};
use serde_json::json;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::config::AppConfig;
use crate::db::DbPool;
use crate::events::EventSender;
use crate::rate_limiter;
use crate::services::{
    CartService, CheckoutService, IdempotencyService, InventoryService, ReservationService,
};
use crate::{health, AppState};

/// Services layer that encapsulates business logic used by HTTP handlers.
#[derive(Clone)]
pub struct AppServices {
    pub inventory: InventoryService,
    pub reservations: ReservationService,
    pub idempotency: IdempotencyService,
    pub carts: CartService,
    pub checkout: Arc<CheckoutService>,
}

impl AppServices {
    pub fn new(db: Arc<DbPool>, event_sender: EventSender, config: &AppConfig) -> Self {
        let inventory = InventoryService::new(db.clone());
        let reservations = ReservationService::new(db.clone());
        let idempotency = IdempotencyService::new(db.clone());
        let carts = CartService::new(db.clone());
        let checkout = Arc::new(CheckoutService::new(
            db,
            inventory.clone(),
            reservations.clone(),
            idempotency.clone(),
            carts.clone(),
            event_sender,
            config,
        ));

        Self {
            inventory,
            reservations,
            idempotency,
            carts,
            checkout,
        }
    }
}

async fn not_found() -> impl IntoResponse {
    (
        StatusCode::NOT_FOUND,
        Json(json!({
            "type": "invalid_request",
            "code": "not_found",
            "message": "no such route",
        })),
    )
}

fn cors_layer(config: &AppConfig) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any);

    match &config.allowed_origin {
        Some(origin) => match origin.parse::<HeaderValue>() {
            Ok(value) => layer.allow_origin(value),
            Err(_) => {
                warn!(origin = %origin, "invalid allowed_origin, falling back to any");
                layer.allow_origin(Any)
            }
        },
        None => layer.allow_origin(Any),
    }
}

/// Builds the full application router.
pub fn router(state: AppState) -> Router {
    let checkout_routes = checkout::checkout_routes().layer(middleware::from_fn_with_state(
        state.clone(),
        rate_limiter::rate_limit_middleware,
    ));

    let api = Router::new()
        .nest("/checkout", checkout_routes)
        .nest("/reservations", checkout::reservation_routes());

    Router::new()
        .nest("/health", health::health_routes())
        .nest("/api/v1", api)
        .fallback(not_found)
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer(&state.config))
        .with_state(state)
}
