//! Retry scheduler
//!
//! Background worker that periodically:
//! 1. fails `PROCESSING` attempts that went stale (crash mid-attempt),
//! 2. resumes `RETRYING` allocations,
//! 3. resumes `PENDING` allocations nobody claimed within the stale window.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use splitledger_db::AllocationStore;
use splitledger_types::AllocationStatus;

use crate::{AllocationEngine, AllocationResult};

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub poll_interval: Duration,
    /// A `PROCESSING` or `PENDING` record idle this long is taken over
    pub stale_after: chrono::Duration,
    /// Allocations resumed per status per tick
    pub batch_size: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            stale_after: chrono::Duration::minutes(10),
            batch_size: 100,
        }
    }
}

/// What one scheduler pass did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub recovered: usize,
    pub resumed: usize,
    pub completed: usize,
    pub errors: usize,
}

pub struct RetryScheduler {
    engine: Arc<AllocationEngine>,
    config: SchedulerConfig,
}

impl RetryScheduler {
    pub fn new(engine: Arc<AllocationEngine>, config: SchedulerConfig) -> Self {
        Self { engine, config }
    }

    /// One pass over stale and retrying allocations
    pub async fn tick(&self) -> AllocationResult<TickReport> {
        let mut report = TickReport {
            recovered: self.engine.recover_stale(self.config.stale_after).await?,
            ..TickReport::default()
        };

        let store = self.engine.store();
        let mut due = store
            .list_allocations_by_status(AllocationStatus::Retrying, self.config.batch_size)
            .await?;

        let cutoff = Utc::now() - self.config.stale_after;
        due.extend(
            store
                .list_allocations_by_status(AllocationStatus::Pending, self.config.batch_size)
                .await?
                .into_iter()
                .filter(|a| a.created_at <= cutoff),
        );

        for allocation in due {
            report.resumed += 1;
            match self.engine.resume(&allocation.id).await {
                Ok(after) if after.status == AllocationStatus::Completed => report.completed += 1,
                Ok(_) => {}
                Err(e) => {
                    report.errors += 1;
                    warn!(allocation_id = %allocation.id, error = %e, "Retry attempt errored");
                }
            }
        }

        if report != TickReport::default() {
            info!(
                recovered = report.recovered,
                resumed = report.resumed,
                completed = report.completed,
                errors = report.errors,
                "Retry scheduler pass"
            );
        }
        Ok(report)
    }

    /// Tick every `poll_interval` until `shutdown` flips to `true` or closes
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.config.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            "Retry scheduler started"
        );

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.tick().await {
                        warn!(error = %e, "Retry scheduler pass failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    debug!("Shutdown signal changed but not set");
                }
            }
        }

        info!("Retry scheduler stopped");
    }

    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }
}
