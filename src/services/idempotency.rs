use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, QueryFilter,
    Set, SqlErr,
};
use serde_json::Value;
use std::sync::Arc;
use tracing::{instrument, warn};
use uuid::Uuid;

use crate::db::{with_retry, RetryConfig};
use crate::entities::idempotency_record::{self, IdempotencyStatus};
use crate::errors::ServiceError;

/// Result of attempting to claim an idempotency slot.
#[derive(Debug)]
pub enum SlotOutcome {
    /// This attempt inserted the record and owns the slot.
    Inserted,
    /// Another attempt got there first; the caller decides replay, conflict
    /// or retry from the existing record.
    Existing(idempotency_record::Model),
}

/// The idempotency store: at-most-once effective commits per
/// `(caller, endpoint, key)`.
///
/// Slot claiming leans entirely on the composite unique index — the insert
/// either wins or collides, and a collision is resolved by reading the record
/// that beat us. No in-memory coordination.
#[derive(Clone)]
pub struct IdempotencyService {
    db: Arc<DatabaseConnection>,
}

impl IdempotencyService {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    /// Atomic insert-if-absent of an `in_progress` record.
    #[instrument(skip(self, fingerprint))]
    pub async fn reserve_slot(
        &self,
        caller_id: &str,
        endpoint: &str,
        key: &str,
        fingerprint: &str,
    ) -> Result<SlotOutcome, ServiceError> {
        let attempt = idempotency_record::ActiveModel {
            id: Set(Uuid::new_v4()),
            caller_id: Set(caller_id.to_string()),
            endpoint: Set(endpoint.to_string()),
            key: Set(key.to_string()),
            fingerprint: Set(fingerprint.to_string()),
            status: Set(IdempotencyStatus::InProgress.as_str().to_string()),
            response: Set(None),
            ..Default::default()
        };

        match attempt.insert(&*self.db).await {
            Ok(_) => Ok(SlotOutcome::Inserted),
            Err(err) => {
                if matches!(err.sql_err(), Some(SqlErr::UniqueConstraintViolation(_))) {
                    let existing = self
                        .find(caller_id, endpoint, key)
                        .await?
                        .ok_or_else(|| {
                            ServiceError::Internal(
                                "idempotency record missing after unique conflict".to_string(),
                            )
                        })?;
                    Ok(SlotOutcome::Existing(existing))
                } else {
                    Err(err.into())
                }
            }
        }
    }

    pub async fn find(
        &self,
        caller_id: &str,
        endpoint: &str,
        key: &str,
    ) -> Result<Option<idempotency_record::Model>, ServiceError> {
        Ok(idempotency_record::Entity::find()
            .filter(idempotency_record::Column::CallerId.eq(caller_id))
            .filter(idempotency_record::Column::Endpoint.eq(endpoint))
            .filter(idempotency_record::Column::Key.eq(key))
            .one(&*self.db)
            .await?)
    }

    /// Freezes the slot as `succeeded` with its cached response. Runs inside
    /// the commit transaction so the cached response becomes visible exactly
    /// when the order does.
    #[instrument(skip(self, conn, response))]
    pub async fn finish_succeeded<C: ConnectionTrait>(
        &self,
        conn: &C,
        caller_id: &str,
        endpoint: &str,
        key: &str,
        response: &Value,
    ) -> Result<(), ServiceError> {
        idempotency_record::Entity::update_many()
            .col_expr(
                idempotency_record::Column::Status,
                Expr::value(IdempotencyStatus::Succeeded.as_str()),
            )
            .col_expr(
                idempotency_record::Column::Response,
                Expr::value(response.to_string()),
            )
            .col_expr(
                idempotency_record::Column::UpdatedAt,
                Expr::value(chrono::Utc::now()),
            )
            .filter(idempotency_record::Column::CallerId.eq(caller_id))
            .filter(idempotency_record::Column::Endpoint.eq(endpoint))
            .filter(idempotency_record::Column::Key.eq(key))
            .exec(conn)
            .await?;

        Ok(())
    }

    /// Best-effort `failed` mark after an aborted attempt. Never downgrades a
    /// `succeeded` record: a parallel attempt may have committed while this
    /// one was losing its race.
    #[instrument(skip(self))]
    pub async fn mark_failed(&self, caller_id: &str, endpoint: &str, key: &str) {
        let result = with_retry(&RetryConfig::default(), "idempotency.mark_failed", || {
            idempotency_record::Entity::update_many()
                .col_expr(
                    idempotency_record::Column::Status,
                    Expr::value(IdempotencyStatus::Failed.as_str()),
                )
                .col_expr(
                    idempotency_record::Column::UpdatedAt,
                    Expr::value(chrono::Utc::now()),
                )
                .filter(idempotency_record::Column::CallerId.eq(caller_id))
                .filter(idempotency_record::Column::Endpoint.eq(endpoint))
                .filter(idempotency_record::Column::Key.eq(key))
                .filter(
                    idempotency_record::Column::Status
                        .ne(IdempotencyStatus::Succeeded.as_str()),
                )
                .exec(&*self.db)
        })
        .await;

        if let Err(err) = result {
            warn!(
                caller_id,
                key,
                error = %err,
                "failed to mark idempotency slot as failed"
            );
        }
    }
}
