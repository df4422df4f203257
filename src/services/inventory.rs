use chrono::Utc;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, QueryFilter,
};
use std::sync::Arc;
use tracing::instrument;
use uuid::Uuid;

use crate::entities::product;
use crate::errors::ServiceError;

/// Result of a successful stock commit for one line.
#[derive(Debug, Clone, Copy)]
pub struct CommitOutcome {
    pub stock_after: i32,
    pub low_stock_threshold: i32,
}

/// Point-in-time counters for one product.
#[derive(Debug, Clone, Copy)]
pub struct StockLevels {
    pub stock: i32,
    pub reserved: i32,
    pub available: i32,
}

/// The inventory store: guarded counter updates over `products`.
///
/// Every mutation is a single conditional UPDATE whose guard is evaluated by
/// the storage engine, never a read-then-write. A zero-row result means the
/// guard failed; a follow-up read splits that into NotFound vs Insufficient.
/// Callers touching several products in one operation must issue these in
/// ascending product-id order.
#[derive(Clone)]
pub struct InventoryService {
    db: Arc<DatabaseConnection>,
}

impl InventoryService {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    /// Holds `quantity` units: `reserved += quantity` iff
    /// `stock - reserved >= quantity`.
    #[instrument(skip(self, conn))]
    pub async fn try_increment_reserved<C: ConnectionTrait>(
        &self,
        conn: &C,
        product_id: Uuid,
        quantity: i32,
    ) -> Result<(), ServiceError> {
        let result = product::Entity::update_many()
            .col_expr(
                product::Column::Reserved,
                Expr::col(product::Column::Reserved).add(quantity),
            )
            .col_expr(product::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(product::Column::Id.eq(product_id))
            // Guard: stock - reserved >= quantity.
            .filter(
                Expr::col(product::Column::Stock)
                    .gte(Expr::col(product::Column::Reserved).add(quantity)),
            )
            .exec(conn)
            .await?;

        if result.rows_affected == 0 {
            return Err(self.guard_failure(conn, product_id, quantity, "available").await?);
        }

        Ok(())
    }

    /// Commits `quantity` held units into a sale: `stock -= quantity` and
    /// `reserved -= quantity` iff both counters cover it. Returns the
    /// post-commit stock together with the product's threshold so the caller
    /// can decide whether to emit a low-stock signal.
    #[instrument(skip(self, conn))]
    pub async fn try_commit<C: ConnectionTrait>(
        &self,
        conn: &C,
        product_id: Uuid,
        quantity: i32,
    ) -> Result<CommitOutcome, ServiceError> {
        let result = product::Entity::update_many()
            .col_expr(
                product::Column::Stock,
                Expr::col(product::Column::Stock).sub(quantity),
            )
            .col_expr(
                product::Column::Reserved,
                Expr::col(product::Column::Reserved).sub(quantity),
            )
            .col_expr(product::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(product::Column::Id.eq(product_id))
            .filter(product::Column::Reserved.gte(quantity))
            .filter(product::Column::Stock.gte(quantity))
            .exec(conn)
            .await?;

        if result.rows_affected == 0 {
            return Err(self.guard_failure(conn, product_id, quantity, "held").await?);
        }

        // Read-your-writes within the transaction for the post-commit stock.
        let updated = product::Entity::find_by_id(product_id)
            .one(conn)
            .await?
            .ok_or_else(|| {
                ServiceError::Internal(format!("product {} vanished mid-commit", product_id))
            })?;

        Ok(CommitOutcome {
            stock_after: updated.stock,
            low_stock_threshold: updated.low_stock_threshold,
        })
    }

    /// Returns held units to the free pool: `reserved -= quantity` iff
    /// `reserved >= quantity`.
    #[instrument(skip(self, conn))]
    pub async fn release_reserved<C: ConnectionTrait>(
        &self,
        conn: &C,
        product_id: Uuid,
        quantity: i32,
    ) -> Result<(), ServiceError> {
        let result = product::Entity::update_many()
            .col_expr(
                product::Column::Reserved,
                Expr::col(product::Column::Reserved).sub(quantity),
            )
            .col_expr(product::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(product::Column::Id.eq(product_id))
            .filter(product::Column::Reserved.gte(quantity))
            .exec(conn)
            .await?;

        if result.rows_affected == 0 {
            return Err(self.guard_failure(conn, product_id, quantity, "reserved").await?);
        }

        Ok(())
    }

    /// Current counters plus the derived available quantity.
    #[instrument(skip(self))]
    pub async fn read(&self, product_id: Uuid) -> Result<StockLevels, ServiceError> {
        let model = product::Entity::find_by_id(product_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("product {} not found", product_id)))?;

        Ok(StockLevels {
            stock: model.stock,
            reserved: model.reserved,
            available: model.available(),
        })
    }

    /// A guarded update matched no rows: either the product does not exist
    /// or its counters cannot cover the request.
    async fn guard_failure<C: ConnectionTrait>(
        &self,
        conn: &C,
        product_id: Uuid,
        quantity: i32,
        pool: &str,
    ) -> Result<ServiceError, ServiceError> {
        match product::Entity::find_by_id(product_id).one(conn).await? {
            None => Ok(ServiceError::NotFound(format!(
                "product {} not found",
                product_id
            ))),
            Some(p) => {
                let on_hand = match pool {
                    "available" => p.available(),
                    "reserved" => p.reserved,
                    _ => p.stock.min(p.reserved),
                };
                Ok(ServiceError::Insufficient(format!(
                    "product {}: requested {}, only {} {}",
                    product_id, quantity, on_hand, pool
                )))
            }
        }
    }
}
