use chrono::{DateTime, Utc};
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, QueryFilter,
    QueryOrder, Set,
};
use std::sync::Arc;
use tracing::instrument;
use uuid::Uuid;

use crate::entities::reservation::{self, ReservationStatus};
use crate::entities::reservation_line;
use crate::errors::ServiceError;

/// Snapshot of one requested line, priced at reserve time.
#[derive(Debug, Clone)]
pub struct LineSnapshot {
    pub product_id: Uuid,
    pub sku: String,
    pub name: String,
    pub unit_price: i64,
    pub quantity: i32,
}

/// Everything needed to persist a new active hold.
#[derive(Debug, Clone)]
pub struct NewReservation {
    pub caller_id: String,
    pub shipping_method: String,
    pub ship_to_name: String,
    pub ship_to_phone: String,
    pub ship_to_line1: String,
    pub ship_to_city: String,
    pub ship_to_state: String,
    pub ship_to_pincode: String,
    pub expires_at: DateTime<Utc>,
}

/// The reservation store: soft-hold records and their line snapshots.
#[derive(Clone)]
pub struct ReservationService {
    db: Arc<DatabaseConnection>,
}

impl ReservationService {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    /// Persists an active reservation with its line snapshots.
    #[instrument(skip(self, conn, new, lines), fields(caller_id = %new.caller_id))]
    pub async fn create<C: ConnectionTrait>(
        &self,
        conn: &C,
        new: NewReservation,
        lines: &[LineSnapshot],
    ) -> Result<reservation::Model, ServiceError> {
        let model = reservation::ActiveModel {
            id: Set(Uuid::new_v4()),
            caller_id: Set(new.caller_id),
            status: Set(ReservationStatus::Active.as_str().to_string()),
            shipping_method: Set(new.shipping_method),
            ship_to_name: Set(new.ship_to_name),
            ship_to_phone: Set(new.ship_to_phone),
            ship_to_line1: Set(new.ship_to_line1),
            ship_to_city: Set(new.ship_to_city),
            ship_to_state: Set(new.ship_to_state),
            ship_to_pincode: Set(new.ship_to_pincode),
            expires_at: Set(new.expires_at),
            ..Default::default()
        }
        .insert(conn)
        .await?;

        for (position, line) in lines.iter().enumerate() {
            reservation_line::ActiveModel {
                id: Set(Uuid::new_v4()),
                reservation_id: Set(model.id),
                position: Set(position as i32),
                product_id: Set(line.product_id),
                sku: Set(line.sku.clone()),
                name: Set(line.name.clone()),
                unit_price: Set(line.unit_price),
                quantity: Set(line.quantity),
                ..Default::default()
            }
            .insert(conn)
            .await?;
        }

        Ok(model)
    }

    /// Loads a reservation together with its lines in snapshot order.
    pub async fn find_with_lines<C: ConnectionTrait>(
        &self,
        conn: &C,
        id: Uuid,
    ) -> Result<Option<(reservation::Model, Vec<reservation_line::Model>)>, ServiceError> {
        let Some(model) = reservation::Entity::find_by_id(id).one(conn).await? else {
            return Ok(None);
        };

        let lines = self.lines(conn, id).await?;
        Ok(Some((model, lines)))
    }

    /// Lines of a reservation in snapshot order.
    pub async fn lines<C: ConnectionTrait>(
        &self,
        conn: &C,
        reservation_id: Uuid,
    ) -> Result<Vec<reservation_line::Model>, ServiceError> {
        Ok(reservation_line::Entity::find()
            .filter(reservation_line::Column::ReservationId.eq(reservation_id))
            .order_by_asc(reservation_line::Column::Position)
            .all(conn)
            .await?)
    }

    /// Claims the transition `active -> to`. Returns whether this caller won
    /// the claim; a false result means another writer (confirm or the
    /// sweeper) already moved the record out of `active`.
    #[instrument(skip(self, conn))]
    pub async fn claim_transition<C: ConnectionTrait>(
        &self,
        conn: &C,
        id: Uuid,
        to: ReservationStatus,
    ) -> Result<bool, ServiceError> {
        debug_assert!(to.is_terminal(), "claims only move out of active");

        let result = reservation::Entity::update_many()
            .col_expr(reservation::Column::Status, Expr::value(to.as_str()))
            .col_expr(reservation::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(reservation::Column::Id.eq(id))
            .filter(reservation::Column::Status.eq(ReservationStatus::Active.as_str()))
            .exec(conn)
            .await?;

        Ok(result.rows_affected == 1)
    }

    /// Active reservations whose deadline has passed, oldest first. The scan
    /// rides the `(status, expires_at)` index.
    #[instrument(skip(self))]
    pub async fn find_expired(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<reservation::Model>, ServiceError> {
        Ok(reservation::Entity::find()
            .filter(reservation::Column::Status.eq(ReservationStatus::Active.as_str()))
            .filter(reservation::Column::ExpiresAt.lte(now))
            .order_by_asc(reservation::Column::ExpiresAt)
            .all(&*self.db)
            .await?)
    }
}
