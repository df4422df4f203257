use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, DatabaseConnection, DatabaseTransaction, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::{instrument, warn};
use uuid::Uuid;
use validator::Validate;

use crate::config::AppConfig;
use crate::db;
use crate::entities::order::{self, OrderStatus};
use crate::entities::reservation::{self, ReservationStatus};
use crate::entities::reservation_line;
use crate::entities::{low_stock_signal, order_line};
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};
use crate::services::idempotency::SlotOutcome;
use crate::services::reservations::{LineSnapshot, NewReservation};
use crate::services::{CartService, IdempotencyService, InventoryService, ReservationService};

/// Bounds on a single requested line.
const MIN_LINE_QUANTITY: i32 = 1;
const MAX_LINE_QUANTITY: i32 = 5;

/// Whole-transaction attempts when the storage engine reports a transient
/// conflict. Aborted attempts left no visible state, so re-running is safe.
const MAX_TXN_ATTEMPTS: u32 = 3;

const CONFIRM_ENDPOINT: &str = "confirm";

/// Recognized shipping methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShippingMethod {
    Standard,
    Express,
}

impl ShippingMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            ShippingMethod::Standard => "standard",
            ShippingMethod::Express => "express",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "standard" => Some(ShippingMethod::Standard),
            "express" => Some(ShippingMethod::Express),
            _ => None,
        }
    }
}

/// Destination address snapshot.
///
/// Fields default to empty on deserialization so that an absent field is a
/// validation failure, not a deserialization one.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
pub struct Address {
    #[serde(default)]
    #[validate(length(min = 1, message = "name is required"))]
    pub name: String,
    #[serde(default)]
    #[validate(length(min = 1, message = "phone is required"))]
    pub phone: String,
    #[serde(default)]
    #[validate(length(min = 1, message = "line1 is required"))]
    pub line1: String,
    #[serde(default)]
    #[validate(length(min = 1, message = "city is required"))]
    pub city: String,
    #[serde(default)]
    #[validate(length(min = 1, message = "state is required"))]
    pub state: String,
    #[serde(default)]
    #[validate(length(min = 1, message = "pincode is required"))]
    pub pincode: String,
}

#[derive(Debug, Clone)]
pub struct ReserveInput {
    pub address: Address,
    pub shipping_method: String,
}

#[derive(Debug, Clone)]
pub struct ReserveOutcome {
    pub reservation_id: Uuid,
    pub expires_at: chrono::DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ConfirmInput {
    pub reservation_id: Uuid,
    pub idempotency_key: String,
    /// SHA-256 hex over the canonicalized request body.
    pub fingerprint: String,
}

#[derive(Debug, Clone)]
pub struct ConfirmOutcome {
    pub order_id: Uuid,
    pub status: String,
}

impl ConfirmOutcome {
    fn to_response(&self) -> serde_json::Value {
        json!({ "orderId": self.order_id, "status": self.status })
    }

    fn from_response(value: &serde_json::Value) -> Option<Self> {
        Some(Self {
            order_id: value.get("orderId")?.as_str().and_then(|s| Uuid::parse_str(s).ok())?,
            status: value.get("status")?.as_str()?.to_string(),
        })
    }
}

struct CommittedLine {
    line: reservation_line::Model,
    stock_after: i32,
    threshold: i32,
}

/// The reservation engine: enforces the reserve -> confirm protocol over the
/// inventory, reservation, idempotency and cart stores.
///
/// Mutual exclusion is delegated entirely to the storage engine; no lock is
/// held across any await point. Multi-product updates are issued in ascending
/// product-id order.
#[derive(Clone)]
pub struct CheckoutService {
    db: Arc<DatabaseConnection>,
    inventory: InventoryService,
    reservations: ReservationService,
    idempotency: IdempotencyService,
    carts: CartService,
    events: EventSender,
    hold_duration: chrono::Duration,
}

impl CheckoutService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        inventory: InventoryService,
        reservations: ReservationService,
        idempotency: IdempotencyService,
        carts: CartService,
        events: EventSender,
        config: &AppConfig,
    ) -> Self {
        Self {
            db,
            inventory,
            reservations,
            idempotency,
            carts,
            events,
            hold_duration: config.hold_duration(),
        }
    }

    /// Phase 1: place an all-or-nothing soft hold on the caller's cart.
    #[instrument(skip(self, input))]
    pub async fn reserve(
        &self,
        caller_id: &str,
        input: ReserveInput,
    ) -> Result<ReserveOutcome, ServiceError> {
        input.address.validate()?;

        let shipping_method = ShippingMethod::from_str(&input.shipping_method).ok_or_else(|| {
            ServiceError::Validation(format!(
                "unrecognized shipping method '{}'",
                input.shipping_method
            ))
        })?;

        let mut cart_lines = self.carts.lines_for_caller(caller_id).await?;
        if cart_lines.is_empty() {
            return Err(ServiceError::Validation("cart is empty".to_string()));
        }
        for line in &cart_lines {
            if line.quantity < MIN_LINE_QUANTITY || line.quantity > MAX_LINE_QUANTITY {
                return Err(ServiceError::Validation(format!(
                    "quantity {} for product {} is outside [{}, {}]",
                    line.quantity, line.product_id, MIN_LINE_QUANTITY, MAX_LINE_QUANTITY
                )));
            }
        }

        // Deterministic update order across all multi-product writers.
        cart_lines.sort_by_key(|line| line.product_id);

        let mut attempt = 0;
        let reservation = loop {
            attempt += 1;
            match self
                .try_reserve_txn(caller_id, &input.address, shipping_method, &cart_lines)
                .await
            {
                Err(ServiceError::Database(err))
                    if attempt < MAX_TXN_ATTEMPTS && db::is_transient(&err) =>
                {
                    warn!(attempt, error = %err, "transient failure during reserve, retrying");
                    continue;
                }
                other => break other?,
            }
        };

        self.events
            .send_or_log(Event::ReservationCreated {
                reservation_id: reservation.id,
                caller_id: caller_id.to_string(),
                expires_at: reservation.expires_at,
            })
            .await;

        Ok(ReserveOutcome {
            reservation_id: reservation.id,
            expires_at: reservation.expires_at,
        })
    }

    async fn try_reserve_txn(
        &self,
        caller_id: &str,
        address: &Address,
        shipping_method: ShippingMethod,
        cart_lines: &[crate::entities::cart_line::Model],
    ) -> Result<reservation::Model, ServiceError> {
        let txn = self.db.begin().await?;
        match self
            .reserve_in_txn(&txn, caller_id, address, shipping_method, cart_lines)
            .await
        {
            Ok(model) => {
                txn.commit().await?;
                Ok(model)
            }
            Err(err) => {
                let _ = txn.rollback().await;
                Err(err)
            }
        }
    }

    async fn reserve_in_txn(
        &self,
        txn: &DatabaseTransaction,
        caller_id: &str,
        address: &Address,
        shipping_method: ShippingMethod,
        cart_lines: &[crate::entities::cart_line::Model],
    ) -> Result<reservation::Model, ServiceError> {
        use crate::entities::product;
        use sea_orm::EntityTrait;

        let mut snapshots = Vec::with_capacity(cart_lines.len());

        for line in cart_lines {
            let product = product::Entity::find_by_id(line.product_id)
                .one(txn)
                .await?
                .ok_or_else(|| {
                    // A cart naming a product the catalog no longer has is a
                    // bad request, not a missing resource.
                    ServiceError::Validation(format!("unknown product {}", line.product_id))
                })?;

            self.inventory
                .try_increment_reserved(txn, line.product_id, line.quantity)
                .await?;

            snapshots.push(LineSnapshot {
                product_id: product.id,
                sku: product.sku,
                name: product.name,
                unit_price: product.unit_price,
                quantity: line.quantity,
            });
        }

        let expires_at = Utc::now() + self.hold_duration;
        self.reservations
            .create(
                txn,
                NewReservation {
                    caller_id: caller_id.to_string(),
                    shipping_method: shipping_method.as_str().to_string(),
                    ship_to_name: address.name.clone(),
                    ship_to_phone: address.phone.clone(),
                    ship_to_line1: address.line1.clone(),
                    ship_to_city: address.city.clone(),
                    ship_to_state: address.state.clone(),
                    ship_to_pincode: address.pincode.clone(),
                    expires_at,
                },
                &snapshots,
            )
            .await
    }

    /// Phase 2: turn an active hold into an order, exactly once per
    /// idempotency key.
    #[instrument(skip(self, input), fields(reservation_id = %input.reservation_id))]
    pub async fn confirm(
        &self,
        caller_id: &str,
        input: ConfirmInput,
    ) -> Result<ConfirmOutcome, ServiceError> {
        // Consult the idempotency store before touching anything else.
        let slot = self
            .idempotency
            .reserve_slot(
                caller_id,
                CONFIRM_ENDPOINT,
                &input.idempotency_key,
                &input.fingerprint,
            )
            .await?;

        if let SlotOutcome::Existing(record) = &slot {
            if record.fingerprint != input.fingerprint {
                return Err(ServiceError::IdempotencyMismatch(
                    "idempotency key was already used with a different payload".to_string(),
                ));
            }
            match record.status() {
                Some(crate::entities::idempotency_record::IdempotencyStatus::Succeeded) => {
                    let cached = record.response.as_deref().ok_or_else(|| {
                        ServiceError::Internal(
                            "succeeded idempotency record has no cached response".to_string(),
                        )
                    })?;
                    let value: serde_json::Value = serde_json::from_str(cached).map_err(|e| {
                        ServiceError::Internal(format!("corrupt cached response: {}", e))
                    })?;
                    return ConfirmOutcome::from_response(&value).ok_or_else(|| {
                        ServiceError::Internal("corrupt cached response shape".to_string())
                    });
                }
                // in_progress or failed with a matching fingerprint: retry
                // path. The unique index plus the active-state claim keep a
                // double commit impossible.
                Some(_) => {}
                None => {
                    return Err(ServiceError::Internal(
                        "idempotency record in unknown state".to_string(),
                    ))
                }
            }
        }

        let mut attempt = 0;
        let result = loop {
            attempt += 1;
            match self.try_confirm_txn(caller_id, &input).await {
                Err(ServiceError::Database(err))
                    if attempt < MAX_TXN_ATTEMPTS && db::is_transient(&err) =>
                {
                    warn!(attempt, error = %err, "transient failure during confirm, retrying");
                    continue;
                }
                other => break other,
            }
        };

        match result {
            Ok((outcome, effects)) => {
                self.events
                    .send_or_log(Event::OrderCreated {
                        order_id: outcome.order_id,
                        reservation_id: input.reservation_id,
                        total: effects.total,
                    })
                    .await;
                for signal in effects.signals {
                    self.events
                        .send_or_log(Event::LowStock {
                            product_id: signal.0,
                            stock_after: signal.1,
                            threshold: signal.2,
                        })
                        .await;
                }
                Ok(outcome)
            }
            Err(err) => {
                // Best-effort, outside the aborted transaction.
                self.idempotency
                    .mark_failed(caller_id, CONFIRM_ENDPOINT, &input.idempotency_key)
                    .await;
                Err(err)
            }
        }
    }

    async fn try_confirm_txn(
        &self,
        caller_id: &str,
        input: &ConfirmInput,
    ) -> Result<(ConfirmOutcome, CommitSideEffects), ServiceError> {
        let txn = self.db.begin().await?;
        match self.confirm_in_txn(&txn, caller_id, input).await {
            Ok(result) => {
                txn.commit().await?;
                Ok(result)
            }
            Err(err) => {
                let _ = txn.rollback().await;
                Err(err)
            }
        }
    }

    async fn confirm_in_txn(
        &self,
        txn: &DatabaseTransaction,
        caller_id: &str,
        input: &ConfirmInput,
    ) -> Result<(ConfirmOutcome, CommitSideEffects), ServiceError> {
        let now = Utc::now();

        let (res, mut lines) = self
            .reservations
            .find_with_lines(txn, input.reservation_id)
            .await?
            .ok_or_else(|| {
                ServiceError::NotFound(format!("reservation {} not found", input.reservation_id))
            })?;

        if res.caller_id != caller_id {
            return Err(ServiceError::Forbidden(
                "reservation belongs to a different caller".to_string(),
            ));
        }
        if res.status() != Some(ReservationStatus::Active) || res.expires_at <= now {
            return Err(ServiceError::Gone(
                "reservation is no longer active".to_string(),
            ));
        }

        // Same deterministic ordering discipline as reserve.
        lines.sort_by_key(|line| line.product_id);

        let mut committed = Vec::with_capacity(lines.len());
        for line in lines {
            let outcome = match self
                .inventory
                .try_commit(txn, line.product_id, line.quantity)
                .await
            {
                Ok(outcome) => outcome,
                // The reserve phase already held these units, so a failed
                // guard here is exceptional; surface it and abort everything.
                Err(ServiceError::NotFound(msg)) => {
                    return Err(ServiceError::Internal(format!(
                        "held product vanished before commit: {}",
                        msg
                    )))
                }
                Err(err) => return Err(err),
            };
            committed.push(CommittedLine {
                line,
                stock_after: outcome.stock_after,
                threshold: outcome.low_stock_threshold,
            });
        }

        let total: i64 = committed
            .iter()
            .map(|c| c.line.unit_price * c.line.quantity as i64)
            .sum();

        let order = order::ActiveModel {
            id: Set(Uuid::new_v4()),
            caller_id: Set(res.caller_id.clone()),
            status: Set(OrderStatus::Created.as_str().to_string()),
            reservation_id: Set(res.id),
            total: Set(total),
            shipping_method: Set(res.shipping_method.clone()),
            ship_to_name: Set(res.ship_to_name.clone()),
            ship_to_phone: Set(res.ship_to_phone.clone()),
            ship_to_line1: Set(res.ship_to_line1.clone()),
            ship_to_city: Set(res.ship_to_city.clone()),
            ship_to_state: Set(res.ship_to_state.clone()),
            ship_to_pincode: Set(res.ship_to_pincode.clone()),
            ..Default::default()
        }
        .insert(txn)
        .await?;

        for committed_line in &committed {
            let line = &committed_line.line;
            order_line::ActiveModel {
                id: Set(Uuid::new_v4()),
                order_id: Set(order.id),
                position: Set(line.position),
                product_id: Set(line.product_id),
                sku: Set(line.sku.clone()),
                name: Set(line.name.clone()),
                unit_price: Set(line.unit_price),
                quantity: Set(line.quantity),
                ..Default::default()
            }
            .insert(txn)
            .await?;
        }

        // Claim the state transition; losing it means the sweeper expired
        // the hold between our state check and here.
        if !self
            .reservations
            .claim_transition(txn, res.id, ReservationStatus::Consumed)
            .await?
        {
            return Err(ServiceError::Gone(
                "reservation expired during confirm".to_string(),
            ));
        }

        self.carts.clear_for_caller(txn, caller_id).await?;

        let mut signals = Vec::new();
        for committed_line in &committed {
            if committed_line.stock_after < committed_line.threshold {
                low_stock_signal::ActiveModel {
                    id: Set(Uuid::new_v4()),
                    product_id: Set(committed_line.line.product_id),
                    stock_after: Set(committed_line.stock_after),
                    threshold: Set(committed_line.threshold),
                    processed: Set(false),
                    ..Default::default()
                }
                .insert(txn)
                .await?;
                signals.push((
                    committed_line.line.product_id,
                    committed_line.stock_after,
                    committed_line.threshold,
                ));
            }
        }

        let outcome = ConfirmOutcome {
            order_id: order.id,
            status: OrderStatus::Created.as_str().to_string(),
        };

        self.idempotency
            .finish_succeeded(
                txn,
                caller_id,
                CONFIRM_ENDPOINT,
                &input.idempotency_key,
                &outcome.to_response(),
            )
            .await?;

        Ok((outcome, CommitSideEffects { total, signals }))
    }

    /// Read-back of a hold, scoped to its owner.
    #[instrument(skip(self))]
    pub async fn get_reservation(
        &self,
        caller_id: &str,
        reservation_id: Uuid,
    ) -> Result<(reservation::Model, Vec<reservation_line::Model>, bool), ServiceError> {
        let (res, lines) = self
            .reservations
            .find_with_lines(&*self.db, reservation_id)
            .await?
            .ok_or_else(|| {
                ServiceError::NotFound(format!("reservation {} not found", reservation_id))
            })?;

        // A foreign reservation is indistinguishable from an unknown one.
        if res.caller_id != caller_id {
            return Err(ServiceError::NotFound(format!(
                "reservation {} not found",
                reservation_id
            )));
        }

        let is_valid = res.is_valid(Utc::now());
        Ok((res, lines, is_valid))
    }
}

/// What a committed confirm produced besides its response: data for the
/// post-commit domain events.
struct CommitSideEffects {
    total: i64,
    signals: Vec<(Uuid, i32, i32)>,
}
