//! End-to-end tests for the reserve -> confirm protocol: holds, commits,
//! idempotent replay, token conflicts, low-stock signals and input
//! validation.

mod common;

use axum::http::{Method, StatusCode};
use chrono::{DateTime, Utc};
use sea_orm::{ColumnTrait, EntityTrait, PaginatorTrait, QueryFilter};
use serde_json::json;
use uuid::Uuid;

use common::{reserve_body, reserve_ok, response_json, TestApp};
use softhold_api::entities::{
    cart, low_stock_signal, order, order_line, product, reservation,
};
use softhold_api::fingerprint;

async fn product_counters(app: &TestApp, id: Uuid) -> (i32, i32) {
    let model = product::Entity::find_by_id(id)
        .one(&*app.state.db)
        .await
        .expect("query product")
        .expect("product exists");
    (model.stock, model.reserved)
}

#[tokio::test]
async fn checkout_happy_path() {
    let app = TestApp::new().await;
    let product_a = app.seed_product("SKU-A", 2500, 50, 10).await;
    let product_b = app.seed_product("SKU-B", 1900, 30, 5).await;
    app.seed_cart("caller-x", &[(product_a.id, 2), (product_b.id, 1)])
        .await;

    // Phase 1: hold.
    let response = app.reserve("caller-x").await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = response_json(response).await;
    let reservation_id = body["reservationId"].as_str().expect("reservationId");

    // The hold window is ten minutes, give or take scheduling noise.
    let expires_at: DateTime<Utc> = body["expiresAt"]
        .as_str()
        .expect("expiresAt")
        .parse()
        .expect("expiresAt parses");
    let remaining = expires_at - Utc::now();
    assert!(
        remaining > chrono::Duration::seconds(570) && remaining <= chrono::Duration::seconds(630),
        "hold window was {:?}",
        remaining
    );

    assert_eq!(product_counters(&app, product_a.id).await, (50, 2));
    assert_eq!(product_counters(&app, product_b.id).await, (30, 1));

    // Phase 2: commit.
    let response = app.confirm("caller-x", reservation_id, "K1").await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = response_json(response).await;
    assert_eq!(body["status"], "created");
    let order_id: Uuid = body["orderId"]
        .as_str()
        .expect("orderId")
        .parse()
        .expect("orderId is a uuid");

    assert_eq!(product_counters(&app, product_a.id).await, (48, 0));
    assert_eq!(product_counters(&app, product_b.id).await, (29, 0));

    let order = order::Entity::find_by_id(order_id)
        .one(&*app.state.db)
        .await
        .expect("query order")
        .expect("order exists");
    assert_eq!(order.total, 2 * 2500 + 1900);
    assert_eq!(order.status, "created");
    assert_eq!(order.caller_id, "caller-x");

    // Snapshots round-trip from product through reservation into the order.
    let lines = order_line::Entity::find()
        .filter(order_line::Column::OrderId.eq(order_id))
        .all(&*app.state.db)
        .await
        .expect("query order lines");
    assert_eq!(lines.len(), 2);
    let line_a = lines
        .iter()
        .find(|l| l.product_id == product_a.id)
        .expect("line for product A");
    assert_eq!(line_a.sku, "SKU-A");
    assert_eq!(line_a.unit_price, 2500);
    assert_eq!(line_a.quantity, 2);
    assert_eq!(line_a.name, product_a.name);

    // The reservation is consumed and the cart is gone.
    let res = reservation::Entity::find_by_id(reservation_id.parse::<Uuid>().unwrap())
        .one(&*app.state.db)
        .await
        .expect("query reservation")
        .expect("reservation exists");
    assert_eq!(res.status, "consumed");

    let cart = cart::Entity::find()
        .filter(cart::Column::CallerId.eq("caller-x"))
        .one(&*app.state.db)
        .await
        .expect("query cart");
    assert!(cart.is_none(), "cart should be deleted after confirm");

    // 48 >= 10 and 29 >= 5: nothing crossed a threshold.
    let signals = low_stock_signal::Entity::find()
        .count(&*app.state.db)
        .await
        .expect("count signals");
    assert_eq!(signals, 0);
}

#[tokio::test]
async fn confirm_replays_with_the_same_token() {
    let app = TestApp::new().await;
    let product_a = app.seed_product("SKU-RPL", 2500, 50, 10).await;
    app.seed_cart("caller-x", &[(product_a.id, 2)]).await;

    let reservation_id = reserve_ok(&app, "caller-x").await;

    let first = app.confirm("caller-x", &reservation_id, "K1").await;
    assert_eq!(first.status(), StatusCode::OK);
    let first_body = response_json(first).await;

    let second = app.confirm("caller-x", &reservation_id, "K1").await;
    assert_eq!(second.status(), StatusCode::OK);
    let second_body = response_json(second).await;

    assert_eq!(first_body, second_body, "replay must return the cached response");

    // Replay performed no state changes.
    assert_eq!(product_counters(&app, product_a.id).await, (48, 0));
    let orders = order::Entity::find()
        .count(&*app.state.db)
        .await
        .expect("count orders");
    assert_eq!(orders, 1, "exactly one order for one idempotency key");
}

#[tokio::test]
async fn confirm_rejects_token_reuse_with_a_different_payload() {
    let app = TestApp::new().await;
    let product_a = app.seed_product("SKU-MIS", 2500, 50, 10).await;
    app.seed_cart("caller-x", &[(product_a.id, 1)]).await;

    let reservation_id = reserve_ok(&app, "caller-x").await;

    let first = app.confirm("caller-x", &reservation_id, "K1").await;
    assert_eq!(first.status(), StatusCode::OK);

    // Same token, different reservation id in the body.
    let other = Uuid::new_v4().to_string();
    let conflict = app.confirm("caller-x", &other, "K1").await;
    assert_eq!(conflict.status(), StatusCode::CONFLICT);
    let body = response_json(conflict).await;
    assert_eq!(body["code"], "idempotency_conflict");

    let orders = order::Entity::find()
        .count(&*app.state.db)
        .await
        .expect("count orders");
    assert_eq!(orders, 1, "the conflicting attempt must not create an order");
}

#[tokio::test]
async fn confirm_proceeds_after_an_in_progress_or_failed_slot() {
    let app = TestApp::new().await;
    let product_a = app.seed_product("SKU-RTY", 1000, 10, 2).await;
    app.seed_cart("caller-x", &[(product_a.id, 1)]).await;

    let reservation_id = reserve_ok(&app, "caller-x").await;

    // A previous attempt died mid-flight, leaving an in_progress slot with
    // the same fingerprint.
    let fp = fingerprint::fingerprint(&json!({ "reservationId": reservation_id }));
    app.state
        .services
        .idempotency
        .reserve_slot("caller-x", "confirm", "K-retry", &fp)
        .await
        .expect("seed slot");

    let response = app.confirm("caller-x", &reservation_id, "K-retry").await;
    assert_eq!(response.status(), StatusCode::OK, "retry path must proceed");

    // And a failed slot also allows a retry (with a fresh reservation).
    app.seed_cart("caller-x", &[(product_a.id, 1)]).await;
    let second_reservation = reserve_ok(&app, "caller-x").await;
    let fp = fingerprint::fingerprint(&json!({ "reservationId": second_reservation }));
    app.state
        .services
        .idempotency
        .reserve_slot("caller-x", "confirm", "K-failed", &fp)
        .await
        .expect("seed slot");
    app.state
        .services
        .idempotency
        .mark_failed("caller-x", "confirm", "K-failed")
        .await;

    let response = app.confirm("caller-x", &second_reservation, "K-failed").await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn concurrent_confirms_with_one_token_create_one_order() {
    let app = TestApp::new().await;
    let product_a = app.seed_product("SKU-RACE", 2500, 50, 10).await;
    app.seed_cart("caller-x", &[(product_a.id, 2)]).await;

    let reservation_id = reserve_ok(&app, "caller-x").await;

    let (first, second) = tokio::join!(
        app.confirm("caller-x", &reservation_id, "K1"),
        app.confirm("caller-x", &reservation_id, "K1"),
    );

    let statuses = [first.status(), second.status()];
    assert!(
        statuses.contains(&StatusCode::OK),
        "one attempt must win: {:?}",
        statuses
    );
    for status in statuses {
        assert!(
            status == StatusCode::OK || status == StatusCode::GONE,
            "unexpected status {:?}",
            status
        );
    }

    let orders = order::Entity::find()
        .count(&*app.state.db)
        .await
        .expect("count orders");
    assert_eq!(orders, 1, "at most one order per token");
    assert_eq!(product_counters(&app, product_a.id).await, (48, 0));
}

#[tokio::test]
async fn confirm_emits_a_low_stock_signal_when_stock_crosses_the_threshold() {
    let app = TestApp::new().await;
    let product_e = app.seed_product("SKU-E", 500, 12, 10).await;
    app.seed_cart("caller-x", &[(product_e.id, 5)]).await;

    let reservation_id = reserve_ok(&app, "caller-x").await;
    let response = app.confirm("caller-x", &reservation_id, "K-low").await;
    assert_eq!(response.status(), StatusCode::OK);

    assert_eq!(product_counters(&app, product_e.id).await, (7, 0));

    let signals = low_stock_signal::Entity::find()
        .all(&*app.state.db)
        .await
        .expect("query signals");
    assert_eq!(signals.len(), 1);
    assert_eq!(signals[0].product_id, product_e.id);
    assert_eq!(signals[0].stock_after, 7);
    assert_eq!(signals[0].threshold, 10);
    assert!(!signals[0].processed);

    // A commit that stays at or above the threshold emits nothing.
    let product_f = app.seed_product("SKU-F", 500, 50, 10).await;
    app.seed_cart("caller-y", &[(product_f.id, 5)]).await;
    let reservation_id = reserve_ok(&app, "caller-y").await;
    let response = app.confirm("caller-y", &reservation_id, "K-high").await;
    assert_eq!(response.status(), StatusCode::OK);

    let signals = low_stock_signal::Entity::find()
        .count(&*app.state.db)
        .await
        .expect("count signals");
    assert_eq!(signals, 1, "45 >= 10 must not emit");
}

#[tokio::test]
async fn reserve_validates_its_inputs() {
    let app = TestApp::new().await;
    let product_a = app.seed_product("SKU-VAL", 1000, 50, 10).await;

    // No caller identity never reaches the engine.
    let response = app
        .request(
            Method::POST,
            "/api/v1/checkout/reserve",
            None,
            &[],
            Some(reserve_body()),
        )
        .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    // Empty cart.
    let response = app.reserve("caller-empty").await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    // Quantity outside [1, 5].
    app.seed_cart("caller-toomany", &[(product_a.id, 6)]).await;
    let response = app.reserve("caller-toomany").await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    app.seed_cart("caller-zero", &[(product_a.id, 0)]).await;
    let response = app.reserve("caller-zero").await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    // Unknown shipping method.
    app.seed_cart("caller-ship", &[(product_a.id, 1)]).await;
    let mut body = reserve_body();
    body["shippingMethod"] = serde_json::json!("overnight");
    let response = app
        .request(
            Method::POST,
            "/api/v1/checkout/reserve",
            Some("caller-ship"),
            &[],
            Some(body),
        )
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    // Missing address field.
    let mut body = reserve_body();
    body["address"]
        .as_object_mut()
        .unwrap()
        .remove("pincode");
    let response = app
        .request(
            Method::POST,
            "/api/v1/checkout/reserve",
            Some("caller-ship"),
            &[],
            Some(body),
        )
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    // Product the catalog does not know.
    app.seed_cart("caller-ghost", &[(Uuid::new_v4(), 1)]).await;
    let response = app.reserve("caller-ghost").await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    // None of the rejected attempts held stock.
    assert_eq!(product_counters(&app, product_a.id).await, (50, 0));
}

#[tokio::test]
async fn confirm_validates_identity_and_input() {
    let app = TestApp::new().await;
    let product_a = app.seed_product("SKU-CONF", 1000, 50, 10).await;
    app.seed_cart("caller-x", &[(product_a.id, 1)]).await;
    let reservation_id = reserve_ok(&app, "caller-x").await;

    // Missing idempotency key.
    let response = app
        .request(
            Method::POST,
            "/api/v1/checkout/confirm",
            Some("caller-x"),
            &[],
            Some(json!({ "reservationId": reservation_id })),
        )
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    // Malformed reservation id.
    let response = app.confirm("caller-x", "not-a-uuid", "K1").await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    // Unknown reservation.
    let response = app
        .confirm("caller-x", &Uuid::new_v4().to_string(), "K2")
        .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    // Somebody else's reservation.
    let response = app.confirm("caller-y", &reservation_id, "K3").await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    // The hold is untouched by all of the above.
    assert_eq!(product_counters(&app, product_a.id).await, (50, 1));
}

#[tokio::test]
async fn reservation_lookup_is_scoped_to_its_owner() {
    let app = TestApp::new().await;
    let product_a = app.seed_product("SKU-GET", 1500, 50, 10).await;
    app.seed_cart("caller-x", &[(product_a.id, 2)]).await;
    let reservation_id = reserve_ok(&app, "caller-x").await;

    let uri = format!("/api/v1/reservations/{}", reservation_id);

    let response = app.request(Method::GET, &uri, Some("caller-x"), &[], None).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = response_json(response).await;
    assert_eq!(body["status"], "active");
    assert_eq!(body["isValid"], true);
    assert_eq!(body["lines"][0]["sku"], "SKU-GET");
    assert_eq!(body["lines"][0]["unitPrice"], 1500);
    assert_eq!(body["address"]["pincode"], "560001");

    // Foreign callers see nothing.
    let response = app.request(Method::GET, &uri, Some("caller-z"), &[], None).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    // Unknown id.
    let uri = format!("/api/v1/reservations/{}", Uuid::new_v4());
    let response = app.request(Method::GET, &uri, Some("caller-x"), &[], None).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn checkout_routes_are_rate_limited_per_caller() {
    let app = TestApp::new_with(|cfg| cfg.rate_limit_requests_per_window = 2).await;

    for _ in 0..2 {
        let response = app.reserve("caller-burst").await;
        // Empty cart: rejected, but still counted by the limiter.
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    let response = app.reserve("caller-burst").await;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

    // Another caller is unaffected.
    let response = app.reserve("caller-calm").await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}
