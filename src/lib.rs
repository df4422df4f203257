pub mod config;
pub mod db;
pub mod entities;
pub mod errors;
pub mod events;
pub mod fingerprint;
pub mod handlers;
pub mod health;
pub mod rate_limiter;
pub mod services;

use std::sync::Arc;

use crate::config::AppConfig;
use crate::db::DbPool;
use crate::handlers::AppServices;
use crate::rate_limiter::RateLimiter;

/// Application state shared with every handler.
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<DbPool>,
    pub config: AppConfig,
    pub services: AppServices,
    pub rate_limiter: Arc<RateLimiter>,
}
