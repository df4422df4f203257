use sea_orm::sea_query::{Index, IndexCreateStatement};
use sea_orm::{
    ConnectOptions, ConnectionTrait, Database, DatabaseConnection, DbBackend, DbErr, Schema,
    Statement,
};
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::config::AppConfig;
use crate::entities::{
    cart, cart_line, idempotency_record, low_stock_signal, order, order_line, product,
    reservation, reservation_line,
};

/// Type alias for a database connection pool.
pub type DbPool = DatabaseConnection;

/// Configuration for database retry logic.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            backoff_multiplier: 2.0,
        }
    }
}

/// Determines if an error is transient and worth retrying.
pub fn is_transient(err: &DbErr) -> bool {
    match err {
        DbErr::Conn(_) => true,
        DbErr::ConnectionAcquire(_) => true,
        DbErr::Query(runtime_err) => {
            let msg = runtime_err.to_string().to_lowercase();
            msg.contains("connection")
                || msg.contains("timeout")
                || msg.contains("broken pipe")
                || msg.contains("reset by peer")
                || msg.contains("deadlock")
                || msg.contains("serialization")
                || msg.contains("database is locked")
        }
        _ => false,
    }
}

/// Execute a database operation with retry logic and exponential backoff.
pub async fn with_retry<F, Fut, T>(
    config: &RetryConfig,
    operation_name: &str,
    mut f: F,
) -> Result<T, DbErr>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, DbErr>>,
{
    let mut attempts = 0;
    let mut delay = config.initial_delay;

    loop {
        attempts += 1;

        match f().await {
            Ok(result) => {
                if attempts > 1 {
                    info!(
                        operation = %operation_name,
                        attempts,
                        "database operation succeeded after retry"
                    );
                }
                return Ok(result);
            }
            Err(err) => {
                if attempts >= config.max_retries || !is_transient(&err) {
                    return Err(err);
                }

                warn!(
                    operation = %operation_name,
                    attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "transient database error, retrying"
                );

                sleep(delay).await;

                delay = Duration::from_secs_f64(
                    (delay.as_secs_f64() * config.backoff_multiplier)
                        .min(config.max_delay.as_secs_f64()),
                );
            }
        }
    }
}

/// Configuration for a database connection.
#[derive(Debug, Clone)]
pub struct DbConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout: Duration,
    pub idle_timeout: Duration,
    pub acquire_timeout: Duration,
    /// Server-side statement timeout (Postgres only).
    pub statement_timeout: Option<Duration>,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            max_connections: 10,
            min_connections: 1,
            connect_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(600),
            acquire_timeout: Duration::from_secs(10),
            statement_timeout: Some(Duration::from_secs(45)),
        }
    }
}

impl From<&AppConfig> for DbConfig {
    fn from(cfg: &AppConfig) -> Self {
        Self {
            url: cfg.database_url.clone(),
            max_connections: cfg.db_max_connections,
            min_connections: cfg.db_min_connections,
            connect_timeout: Duration::from_secs(cfg.db_connect_timeout_secs),
            idle_timeout: Duration::from_secs(cfg.db_idle_timeout_secs),
            acquire_timeout: Duration::from_secs(cfg.db_acquire_timeout_secs),
            statement_timeout: cfg.db_statement_timeout_secs.map(Duration::from_secs),
        }
    }
}

/// Establishes a connection pool to the database.
pub async fn establish_connection(database_url: &str) -> Result<DbPool, DbErr> {
    let config = DbConfig {
        url: database_url.to_string(),
        ..Default::default()
    };

    establish_connection_with_config(&config).await
}

/// Establishes a connection pool using the application configuration.
pub async fn establish_connection_from_app_config(cfg: &AppConfig) -> Result<DbPool, DbErr> {
    establish_connection_with_config(&DbConfig::from(cfg)).await
}

/// Establishes a connection pool with custom settings.
pub async fn establish_connection_with_config(config: &DbConfig) -> Result<DbPool, DbErr> {
    debug!("configuring database connection: {:?}", config);

    let mut opt = ConnectOptions::new(config.url.clone());

    opt.max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .connect_timeout(config.connect_timeout)
        .acquire_timeout(config.acquire_timeout)
        .idle_timeout(config.idle_timeout)
        .sqlx_logging(false);

    let pool = Database::connect(opt).await?;

    if let Some(timeout) = config.statement_timeout {
        let backend = pool.get_database_backend();
        if backend == DbBackend::Postgres {
            let sql = format!("SET statement_timeout = {}", timeout.as_millis());
            match pool.execute(Statement::from_string(backend, sql)).await {
                Ok(_) => info!("statement timeout set to {:?}", timeout),
                Err(e) => warn!("failed to set statement timeout: {}", e),
            }
        }
    }

    info!(
        max_connections = config.max_connections,
        "database connection pool established"
    );

    Ok(pool)
}

fn required_indexes() -> Vec<IndexCreateStatement> {
    vec![
        Index::create()
            .name("ux_products_sku")
            .table(product::Entity)
            .col(product::Column::Sku)
            .unique()
            .if_not_exists()
            .to_owned(),
        Index::create()
            .name("ux_carts_caller")
            .table(cart::Entity)
            .col(cart::Column::CallerId)
            .unique()
            .if_not_exists()
            .to_owned(),
        Index::create()
            .name("ux_idempotency_caller_endpoint_key")
            .table(idempotency_record::Entity)
            .col(idempotency_record::Column::CallerId)
            .col(idempotency_record::Column::Endpoint)
            .col(idempotency_record::Column::Key)
            .unique()
            .if_not_exists()
            .to_owned(),
        // The sweeper's scan.
        Index::create()
            .name("ix_reservations_status_expires")
            .table(reservation::Entity)
            .col(reservation::Column::Status)
            .col(reservation::Column::ExpiresAt)
            .if_not_exists()
            .to_owned(),
        Index::create()
            .name("ix_reservations_caller_status")
            .table(reservation::Entity)
            .col(reservation::Column::CallerId)
            .col(reservation::Column::Status)
            .if_not_exists()
            .to_owned(),
        Index::create()
            .name("ix_reservation_lines_reservation")
            .table(reservation_line::Entity)
            .col(reservation_line::Column::ReservationId)
            .if_not_exists()
            .to_owned(),
        Index::create()
            .name("ix_order_lines_order")
            .table(order_line::Entity)
            .col(order_line::Column::OrderId)
            .if_not_exists()
            .to_owned(),
        Index::create()
            .name("ix_cart_lines_cart")
            .table(cart_line::Entity)
            .col(cart_line::Column::CartId)
            .if_not_exists()
            .to_owned(),
    ]
}

/// Creates the schema and the indexes the core depends on.
///
/// The unique indexes are load-bearing (idempotency linearization, one cart
/// per caller), so a failure here is fatal at startup.
pub async fn run_migrations(pool: &DbPool) -> Result<(), DbErr> {
    info!("running schema bootstrap");
    let backend = pool.get_database_backend();
    let schema = Schema::new(backend);

    macro_rules! ensure_table {
        ($entity:expr) => {{
            let mut stmt = schema.create_table_from_entity($entity);
            stmt.if_not_exists();
            pool.execute(backend.build(&stmt)).await?;
        }};
    }

    ensure_table!(product::Entity);
    ensure_table!(reservation::Entity);
    ensure_table!(reservation_line::Entity);
    ensure_table!(order::Entity);
    ensure_table!(order_line::Entity);
    ensure_table!(idempotency_record::Entity);
    ensure_table!(low_stock_signal::Entity);
    ensure_table!(cart::Entity);
    ensure_table!(cart_line::Entity);

    for index in required_indexes() {
        pool.execute(backend.build(&index)).await.map_err(|e| {
            error!(error = %e, "failed to create required index");
            e
        })?;
    }

    info!("schema bootstrap complete");
    Ok(())
}

/// Checks if the database connection is alive.
pub async fn check_connection(pool: &DbPool) -> Result<(), DbErr> {
    pool.ping().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(is_transient(&DbErr::Conn(sea_orm::RuntimeErr::Internal(
            "connection refused".into()
        ))));
        assert!(is_transient(&DbErr::Query(sea_orm::RuntimeErr::Internal(
            "database is locked".into()
        ))));
        assert!(!is_transient(&DbErr::RecordNotFound("x".into())));
    }

    #[tokio::test]
    async fn with_retry_gives_up_on_permanent_errors() {
        let mut calls = 0u32;
        let result: Result<(), DbErr> = with_retry(&RetryConfig::default(), "test", || {
            calls += 1;
            async { Err(DbErr::RecordNotFound("nope".into())) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls, 1, "permanent errors must not be retried");
    }
}
