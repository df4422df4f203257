use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::{self, Body},
    http::{Method, Request, StatusCode},
    response::Response,
    Router,
};
use sea_orm::{ActiveModelTrait, Set};
use serde_json::{json, Value};
use tower::ServiceExt;
use uuid::Uuid;

use softhold_api::config::AppConfig;
use softhold_api::entities::{cart, cart_line, product};
use softhold_api::events::{self, EventSender};
use softhold_api::handlers::{self, AppServices};
use softhold_api::rate_limiter::{RateLimitConfig, RateLimiter};
use softhold_api::services::ReservationSweeper;
use softhold_api::{db, AppState};

/// Test application backed by an in-memory SQLite database.
pub struct TestApp {
    router: Router,
    pub state: AppState,
    pub event_sender: EventSender,
}

impl TestApp {
    pub async fn new() -> Self {
        Self::new_with(|_| {}).await
    }

    /// Construct with configuration tweaks (e.g. a tiny rate limit).
    pub async fn new_with(customize: impl FnOnce(&mut AppConfig)) -> Self {
        let mut cfg = AppConfig::new(
            "sqlite::memory:".to_string(),
            "127.0.0.1".to_string(),
            18_080,
            "test".to_string(),
        );
        // A single connection keeps the in-memory database shared and the
        // interleavings deterministic.
        cfg.db_max_connections = 1;
        cfg.db_min_connections = 1;
        // Tests issue many requests per caller; individual tests lower this
        // when rate limiting itself is under test.
        cfg.rate_limit_requests_per_window = 10_000;
        customize(&mut cfg);

        let pool = db::establish_connection_from_app_config(&cfg)
            .await
            .expect("failed to create test database");
        db::run_migrations(&pool).await.expect("schema bootstrap");
        let db = Arc::new(pool);

        let (event_sender, event_rx) = events::channel(64);
        tokio::spawn(events::process_events(event_rx));

        let services = AppServices::new(db.clone(), event_sender.clone(), &cfg);
        let rate_limiter = Arc::new(RateLimiter::new(RateLimitConfig {
            requests_per_window: cfg.rate_limit_requests_per_window,
            window: Duration::from_secs(cfg.rate_limit_window_seconds),
        }));

        let state = AppState {
            db,
            config: cfg,
            services,
            rate_limiter,
        };
        let router = handlers::router(state.clone());

        Self {
            router,
            state,
            event_sender,
        }
    }

    /// A sweeper over the same stores, driven manually via `run_cycle`.
    pub fn sweeper(&self) -> ReservationSweeper {
        ReservationSweeper::new(
            self.state.db.clone(),
            self.state.services.inventory.clone(),
            self.state.services.reservations.clone(),
            self.event_sender.clone(),
            Duration::from_secs(60),
        )
    }

    pub async fn seed_product(
        &self,
        sku: &str,
        unit_price: i64,
        stock: i32,
        threshold: i32,
    ) -> product::Model {
        product::ActiveModel {
            id: Set(Uuid::new_v4()),
            sku: Set(sku.to_string()),
            name: Set(format!("{} test product", sku)),
            unit_price: Set(unit_price),
            stock: Set(stock),
            reserved: Set(0),
            low_stock_threshold: Set(threshold),
            image: Set(None),
            ..Default::default()
        }
        .insert(&*self.state.db)
        .await
        .expect("seed product")
    }

    pub async fn seed_cart(&self, caller: &str, lines: &[(Uuid, i32)]) {
        let cart = cart::ActiveModel {
            id: Set(Uuid::new_v4()),
            caller_id: Set(caller.to_string()),
            ..Default::default()
        }
        .insert(&*self.state.db)
        .await
        .expect("seed cart");

        for (position, (product_id, quantity)) in lines.iter().enumerate() {
            cart_line::ActiveModel {
                id: Set(Uuid::new_v4()),
                cart_id: Set(cart.id),
                position: Set(position as i32),
                product_id: Set(*product_id),
                quantity: Set(*quantity),
                ..Default::default()
            }
            .insert(&*self.state.db)
            .await
            .expect("seed cart line");
        }
    }

    pub async fn request(
        &self,
        method: Method,
        uri: &str,
        caller: Option<&str>,
        headers: &[(&str, &str)],
        body: Option<Value>,
    ) -> Response {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(caller) = caller {
            builder = builder.header("x-caller-id", caller);
        }
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }

        let request = match body {
            Some(json) => builder
                .header("content-type", "application/json")
                .body(Body::from(json.to_string()))
                .expect("request"),
            None => builder.body(Body::empty()).expect("request"),
        };

        self.router.clone().oneshot(request).await.expect("response")
    }

    /// POST /api/v1/checkout/reserve with a well-formed body.
    pub async fn reserve(&self, caller: &str) -> Response {
        self.request(
            Method::POST,
            "/api/v1/checkout/reserve",
            Some(caller),
            &[],
            Some(reserve_body()),
        )
        .await
    }

    /// POST /api/v1/checkout/confirm for a reservation with a given key.
    pub async fn confirm(&self, caller: &str, reservation_id: &str, key: &str) -> Response {
        self.request(
            Method::POST,
            "/api/v1/checkout/confirm",
            Some(caller),
            &[("idempotency-key", key)],
            Some(json!({ "reservationId": reservation_id })),
        )
        .await
    }
}

pub fn reserve_body() -> Value {
    json!({
        "address": {
            "name": "Asha Rao",
            "phone": "9876543210",
            "line1": "14 Lake View Road",
            "city": "Bengaluru",
            "state": "KA",
            "pincode": "560001"
        },
        "shippingMethod": "standard"
    })
}

pub async fn response_json(response: Response) -> Value {
    let bytes = body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("response body bytes");
    serde_json::from_slice(&bytes).expect("json response")
}

/// Reserve for `caller` and return the reservation id, asserting success.
pub async fn reserve_ok(app: &TestApp, caller: &str) -> String {
    let response = app.reserve(caller).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = response_json(response).await;
    body["reservationId"]
        .as_str()
        .expect("reservationId present")
        .to_string()
}
