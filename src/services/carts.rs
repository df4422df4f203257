use sea_orm::{
    ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder,
};
use std::sync::Arc;
use tracing::instrument;

use crate::entities::{cart, cart_line};
use crate::errors::ServiceError;

/// Interface to the cart subsystem. The reservation core never mutates cart
/// contents; it reads the caller's lines during reserve and deletes the cart
/// when a confirm commits.
#[derive(Clone)]
pub struct CartService {
    db: Arc<DatabaseConnection>,
}

impl CartService {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    /// The caller's cart lines in cart order; empty when there is no cart.
    #[instrument(skip(self))]
    pub async fn lines_for_caller(
        &self,
        caller_id: &str,
    ) -> Result<Vec<cart_line::Model>, ServiceError> {
        let Some(cart) = cart::Entity::find()
            .filter(cart::Column::CallerId.eq(caller_id))
            .one(&*self.db)
            .await?
        else {
            return Ok(Vec::new());
        };

        Ok(cart_line::Entity::find()
            .filter(cart_line::Column::CartId.eq(cart.id))
            .order_by_asc(cart_line::Column::Position)
            .all(&*self.db)
            .await?)
    }

    /// Deletes the caller's cart and its lines. Part of the confirm
    /// transaction, so an aborted commit leaves the cart untouched.
    #[instrument(skip(self, conn))]
    pub async fn clear_for_caller<C: ConnectionTrait>(
        &self,
        conn: &C,
        caller_id: &str,
    ) -> Result<(), ServiceError> {
        let Some(cart) = cart::Entity::find()
            .filter(cart::Column::CallerId.eq(caller_id))
            .one(conn)
            .await?
        else {
            return Ok(());
        };

        cart_line::Entity::delete_many()
            .filter(cart_line::Column::CartId.eq(cart.id))
            .exec(conn)
            .await?;
        cart::Entity::delete_by_id(cart.id).exec(conn).await?;

        Ok(())
    }
}
