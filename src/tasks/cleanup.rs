//! Expired Entry Cleanup
//!
//! Background service that periodically deletes a bounded batch of expired
//! rows. When manager election is active only the manager does the work.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::CacheOptions;
use crate::datasource::DataSource;
use crate::election::ManagerElection;
use crate::resilience::ResiliencePipeline;
use crate::time::SharedClock;

// == Cleanup Outcome ==
/// Result of a single cleanup tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupOutcome {
    /// Automatic cleanup is turned off
    Disabled,
    /// Election is active and another instance is manager
    NotManager,
    /// Number of expired rows deleted
    Removed(u64),
    /// The delete failed; already logged
    Failed,
}

// == Cleanup Service ==
pub struct CleanupService {
    source: Arc<dyn DataSource>,
    pipeline: ResiliencePipeline,
    election: Option<Arc<ManagerElection>>,
    clock: SharedClock,
    enabled: bool,
    interval: Duration,
    batch_size: u32,
    task: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl CleanupService {
    /// Creates a cleanup service.
    ///
    /// # Arguments
    /// * `options` - Interval, batch size and resilience settings
    /// * `source` - Data source holding the cache table
    /// * `election` - Manager election gating the work, if any
    /// * `clock` - Time source for the expiry cut-off
    pub fn new(
        options: &CacheOptions,
        source: Arc<dyn DataSource>,
        election: Option<Arc<ManagerElection>>,
        clock: SharedClock,
    ) -> Self {
        let pipeline = ResiliencePipeline::new(options.resilience.clone(), source.target());
        Self {
            source,
            pipeline,
            election,
            clock,
            enabled: options.enable_automatic_cleanup,
            interval: options.cleanup_interval,
            batch_size: options.cleanup_batch_size,
            task: Mutex::new(None),
        }
    }

    // == Run Once ==
    /// Executes one tick. Failures are logged, never returned.
    pub async fn run_once(&self) -> CleanupOutcome {
        if !self.enabled {
            return CleanupOutcome::Disabled;
        }
        if let Some(election) = &self.election {
            if election.is_active() && !election.is_manager() {
                debug!("Not the cache manager, skipping cleanup");
                return CleanupOutcome::NotManager;
            }
        }

        let now = self.clock.now();
        let batch_size = self.batch_size;
        let source = &self.source;
        let pipeline = &self.pipeline;
        let result = pipeline
            .execute("cleanup", move || async move {
                let mut conn = pipeline
                    .with_connection_timeout("cleanup", source.get_connection())
                    .await?;
                pipeline
                    .with_command_timeout("cleanup", conn.delete_expired(now, batch_size))
                    .await
            })
            .await;

        match result {
            Ok(removed) => {
                if removed > 0 {
                    info!(removed, "Cleanup removed expired cache entries");
                } else {
                    debug!("Cleanup found no expired cache entries");
                }
                CleanupOutcome::Removed(removed)
            }
            Err(err) => {
                warn!(error = %err, "Cleanup run failed");
                CleanupOutcome::Failed
            }
        }
    }

    // == Background Task ==
    /// Schedules [`CleanupService::run_once`] every cleanup interval.
    pub fn start(self: &Arc<Self>) {
        if !self.enabled {
            info!("Automatic cleanup disabled");
            return;
        }
        let mut task = self.task.lock().unwrap_or_else(|e| e.into_inner());
        if task.is_some() {
            return;
        }

        let token = CancellationToken::new();
        let service = Arc::clone(self);
        let cancelled = token.clone();
        let handle = tokio::spawn(async move {
            info!(interval = ?service.interval, batch_size = service.batch_size, "Starting cleanup task");
            let mut ticker = tokio::time::interval_at(
                tokio::time::Instant::now() + service.interval,
                service.interval,
            );
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = cancelled.cancelled() => break,
                    _ = ticker.tick() => {
                        service.run_once().await;
                    }
                }
            }
            debug!("Cleanup task stopped");
        });
        *task = Some((token, handle));
    }

    /// Cancels the timer and waits for an in-flight run to finish.
    pub async fn stop(&self) {
        let running = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some((token, handle)) = running {
            token.cancel();
            if let Err(err) = handle.await {
                warn!(error = %err, "Cleanup task ended abnormally");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_some_and(|(_, handle)| !handle.is_finished())
    }
}
