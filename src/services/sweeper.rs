use chrono::Utc;
use sea_orm::{DatabaseConnection, TransactionTrait};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument, warn};

use crate::db::{with_retry, RetryConfig};
use crate::entities::reservation::{self, ReservationStatus};
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};
use crate::services::{InventoryService, ReservationService};

/// Counters for one sweep cycle.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepStats {
    pub expired: u64,
    pub units_released: u64,
    pub errors: u64,
}

/// Handle to the running sweeper task. Dropping the handle without calling
/// `shutdown` leaves the task running for the life of the process.
pub struct SweeperHandle {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl SweeperHandle {
    /// Cancels the next scheduled cycle and waits for any in-flight cycle to
    /// finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(err) = self.handle.await {
            warn!(error = %err, "sweeper task join failed during shutdown");
        }
    }
}

/// Background task that moves stale active reservations to `expired` and
/// returns their held units to the free pool.
///
/// One cycle at a time: a cycle invoked while another is running returns
/// immediately. Each reservation is expired in its own transaction, so one
/// corrupt record cannot wedge the whole cycle.
pub struct ReservationSweeper {
    db: Arc<DatabaseConnection>,
    inventory: InventoryService,
    reservations: ReservationService,
    events: EventSender,
    interval: Duration,
    cycle_lock: tokio::sync::Mutex<()>,
}

impl ReservationSweeper {
    pub fn new(
        db: Arc<DatabaseConnection>,
        inventory: InventoryService,
        reservations: ReservationService,
        events: EventSender,
        interval: Duration,
    ) -> Self {
        Self {
            db,
            inventory,
            reservations,
            events,
            interval,
            cycle_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Spawns the interval loop. The first cycle runs immediately.
    pub fn spawn(self: Arc<Self>) -> SweeperHandle {
        let (tx, mut rx) = watch::channel(false);

        let sweeper = self;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sweeper.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(interval_secs = sweeper.interval.as_secs(), "sweeper started");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(err) = sweeper.run_cycle().await {
                            error!(error = %err, "sweep cycle failed");
                        }
                    }
                    changed = rx.changed() => {
                        if changed.is_err() || *rx.borrow() {
                            info!("sweeper shutting down");
                            break;
                        }
                    }
                }
            }
        });

        SweeperHandle {
            shutdown: tx,
            handle,
        }
    }

    /// One sweep over everything past its deadline.
    #[instrument(skip(self))]
    pub async fn run_cycle(&self) -> Result<SweepStats, ServiceError> {
        // A second invocation while a cycle is running returns immediately.
        let Ok(_guard) = self.cycle_lock.try_lock() else {
            debug!("sweep cycle already in flight, skipping");
            return Ok(SweepStats::default());
        };

        let now = Utc::now();
        let stale = with_retry(&RetryConfig::default(), "sweeper.scan", || async {
            self.reservations
                .find_expired(now)
                .await
                .map_err(|err| match err {
                    ServiceError::Database(db_err) => db_err,
                    other => sea_orm::DbErr::Custom(other.to_string()),
                })
        })
        .await?;

        let mut stats = SweepStats::default();

        for res in stale {
            match self.expire_one(&res).await {
                Ok(Some(release)) => {
                    stats.expired += 1;
                    stats.units_released += release.units as u64;
                    stats.errors += release.skipped_lines;
                    self.events
                        .send_or_log(Event::ReservationExpired {
                            reservation_id: res.id,
                            units_released: release.units,
                        })
                        .await;
                }
                // Lost the claim: a confirm consumed the hold first.
                Ok(None) => {}
                Err(err) => {
                    stats.errors += 1;
                    error!(reservation_id = %res.id, error = %err, "failed to expire reservation");
                }
            }
        }

        info!(
            expired = stats.expired,
            units_released = stats.units_released,
            errors = stats.errors,
            "sweep cycle complete"
        );

        Ok(stats)
    }

    async fn expire_one(
        &self,
        res: &reservation::Model,
    ) -> Result<Option<LineRelease>, ServiceError> {
        let txn = self.db.begin().await?;

        // Claim the transition first; zero matched rows means confirm won the
        // race and there is nothing to release.
        if !self
            .reservations
            .claim_transition(&txn, res.id, ReservationStatus::Expired)
            .await?
        {
            txn.rollback().await?;
            return Ok(None);
        }

        let mut lines = self.reservations.lines(&txn, res.id).await?;
        lines.sort_by_key(|line| line.product_id);

        let mut release = LineRelease::default();
        for line in lines {
            match self
                .inventory
                .release_reserved(&txn, line.product_id, line.quantity)
                .await
            {
                Ok(()) => release.units += line.quantity,
                // A failed guard here means the counters no longer cover this
                // hold (corruption or a prior partial release). Skip the line
                // and keep going; the reservation still expires.
                Err(ServiceError::Insufficient(msg)) | Err(ServiceError::NotFound(msg)) => {
                    release.skipped_lines += 1;
                    warn!(
                        reservation_id = %res.id,
                        product_id = %line.product_id,
                        quantity = line.quantity,
                        "skipping release: {}", msg
                    );
                }
                Err(err) => {
                    let _ = txn.rollback().await;
                    return Err(err);
                }
            }
        }

        txn.commit().await?;
        Ok(Some(release))
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct LineRelease {
    units: i32,
    skipped_lines: u64,
}
