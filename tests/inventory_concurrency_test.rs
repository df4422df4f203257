//! Availability invariants under concurrent writers and the guarded
//! counter primitives themselves.

mod common;

use axum::http::StatusCode;
use sea_orm::EntityTrait;
use uuid::Uuid;

use assert_matches::assert_matches;
use common::TestApp;
use softhold_api::entities::product;
use softhold_api::errors::ServiceError;

async fn product_counters(app: &TestApp, id: Uuid) -> (i32, i32) {
    let model = product::Entity::find_by_id(id)
        .one(&*app.state.db)
        .await
        .expect("query product")
        .expect("product exists");
    (model.stock, model.reserved)
}

#[tokio::test]
async fn racing_reserves_never_oversell() {
    let app = TestApp::new().await;
    // Eight units, two callers wanting five each: only one can win.
    let product_c = app.seed_product("SKU-C", 1200, 8, 2).await;
    app.seed_cart("caller-one", &[(product_c.id, 5)]).await;
    app.seed_cart("caller-two", &[(product_c.id, 5)]).await;

    let (first, second) = tokio::join!(app.reserve("caller-one"), app.reserve("caller-two"));

    let mut statuses = [first.status(), second.status()];
    statuses.sort();
    assert_eq!(
        statuses,
        [StatusCode::OK, StatusCode::CONFLICT],
        "exactly one hold may succeed"
    );

    let (stock, reserved) = product_counters(&app, product_c.id).await;
    assert_eq!(stock, 8);
    assert_eq!(reserved, 5, "no partial hold may survive the losing attempt");
    assert!(stock >= reserved && reserved >= 0);
}

#[tokio::test]
async fn sequential_holds_drain_availability_exactly() {
    let app = TestApp::new().await;
    let item = app.seed_product("SKU-SEQ", 700, 10, 2).await;

    // Ten callers, one unit each; then an eleventh finds nothing left.
    for i in 0..10 {
        let caller = format!("caller-{i}");
        app.seed_cart(&caller, &[(item.id, 1)]).await;
        let response = app.reserve(&caller).await;
        assert_eq!(response.status(), StatusCode::OK, "hold {i} should fit");
    }

    app.seed_cart("caller-overflow", &[(item.id, 1)]).await;
    let response = app.reserve("caller-overflow").await;
    assert_eq!(response.status(), StatusCode::CONFLICT);

    let (stock, reserved) = product_counters(&app, item.id).await;
    assert_eq!((stock, reserved), (10, 10));
}

#[tokio::test]
async fn multi_line_reserve_is_all_or_nothing() {
    let app = TestApp::new().await;
    let plenty = app.seed_product("SKU-PLENTY", 900, 50, 5).await;
    let scarce = app.seed_product("SKU-SCARCE", 900, 1, 1).await;

    // The scarce line cannot be covered, so the plentiful one must not be
    // held either.
    app.seed_cart("caller-x", &[(plenty.id, 2), (scarce.id, 3)])
        .await;
    let response = app.reserve("caller-x").await;
    assert_eq!(response.status(), StatusCode::CONFLICT);

    assert_eq!(product_counters(&app, plenty.id).await, (50, 0));
    assert_eq!(product_counters(&app, scarce.id).await, (1, 0));
}

#[tokio::test]
async fn guarded_primitives_enforce_their_counters() {
    let app = TestApp::new().await;
    let item = app.seed_product("SKU-PRIM", 100, 4, 1).await;
    let inventory = &app.state.services.inventory;
    let conn = &*app.state.db;

    // Holding more than is available fails without touching anything.
    let err = inventory
        .try_increment_reserved(conn, item.id, 5)
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::Insufficient(_));
    assert_eq!(product_counters(&app, item.id).await, (4, 0));

    // Committing without a hold fails the reserved guard.
    let err = inventory.try_commit(conn, item.id, 1).await.unwrap_err();
    assert_matches!(err, ServiceError::Insufficient(_));

    // Releasing more than is held fails the guard.
    inventory
        .try_increment_reserved(conn, item.id, 2)
        .await
        .expect("hold two");
    let err = inventory.release_reserved(conn, item.id, 3).await.unwrap_err();
    assert_matches!(err, ServiceError::Insufficient(_));

    // A covered commit reports the post-commit stock and threshold.
    let outcome = inventory.try_commit(conn, item.id, 2).await.expect("commit");
    assert_eq!(outcome.stock_after, 2);
    assert_eq!(outcome.low_stock_threshold, 1);
    assert_eq!(product_counters(&app, item.id).await, (2, 0));

    // Unknown products are not an availability problem.
    let err = inventory
        .try_increment_reserved(conn, Uuid::new_v4(), 1)
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::NotFound(_));
    let err = inventory.read(Uuid::new_v4()).await.unwrap_err();
    assert_matches!(err, ServiceError::NotFound(_));

    // The read primitive derives availability.
    let levels = inventory.read(item.id).await.expect("read");
    assert_eq!(levels.stock, 2);
    assert_eq!(levels.reserved, 0);
    assert_eq!(levels.available, 2);
}
