//! Manager Election Service
//!
//! Picks at most one instance per cache table to run maintenance work. The
//! role is a session-scoped advisory lock: it is held exactly as long as the
//! session that took it stays open, so a crashed manager frees the role
//! without any heartbeat.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{CacheOptions, TableTarget, TableTargetObserver};
use crate::datasource::{advisory_lock_key, CacheConnection, DataSource, LockPurpose};
use crate::error::Result;
use crate::time::SharedClock;

const EVENT_CAPACITY: usize = 16;

// == Election Events ==
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ElectionEvent {
    ManagerElected { elected_at: DateTime<Utc> },
    ManagerLost { lost_at: DateTime<Utc> },
}

/// Session holding the election lock while this instance is manager.
struct HeldRole {
    conn: Box<dyn CacheConnection>,
    lock_key: i64,
}

// == Manager Election ==
pub struct ManagerElection {
    source: Arc<dyn DataSource>,
    clock: SharedClock,
    /// Random per-instance id, only used to tell instances apart in logs
    instance_id: String,
    target: StdMutex<TableTarget>,
    interval: Duration,
    enabled: bool,
    is_manager: AtomicBool,
    acquired_at: StdMutex<Option<DateTime<Utc>>>,
    /// Set when the database refuses advisory lock calls
    disabled: AtomicBool,
    session: Mutex<Option<HeldRole>>,
    events: broadcast::Sender<ElectionEvent>,
    task: StdMutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl ManagerElection {
    pub fn new(options: &CacheOptions, source: Arc<dyn DataSource>, clock: SharedClock) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            source,
            clock,
            instance_id: format!("{:016x}", fastrand::u64(..)),
            target: StdMutex::new(options.target.clone()),
            interval: options.election_interval,
            enabled: options.enable_manager_election,
            is_manager: AtomicBool::new(false),
            acquired_at: StdMutex::new(None),
            disabled: AtomicBool::new(false),
            session: Mutex::new(None),
            events,
            task: StdMutex::new(None),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Cached role flag; never touches the database.
    pub fn is_manager(&self) -> bool {
        self.is_manager.load(Ordering::Acquire)
    }

    /// When this instance last became manager, `None` while it is not.
    pub fn acquired_at(&self) -> Option<DateTime<Utc>> {
        *self.acquired_at.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn target(&self) -> TableTarget {
        self.target.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Advisory lock key of the current table.
    pub fn lock_key(&self) -> i64 {
        advisory_lock_key(&self.target(), LockPurpose::Election)
    }

    /// False when election is turned off in configuration or was disabled
    /// because the database refused advisory lock calls.
    pub fn is_active(&self) -> bool {
        self.enabled && !self.disabled.load(Ordering::Acquire)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ElectionEvent> {
        self.events.subscribe()
    }

    // == Try Acquire ==
    /// Makes one non-blocking attempt to become manager.
    ///
    /// # Returns
    /// - `Ok(true)` if this instance is (now) the manager
    /// - `Ok(false)` if another instance holds the role or election is inactive
    pub async fn try_acquire_manager_role(&self) -> Result<bool> {
        if !self.is_active() {
            return Ok(false);
        }

        let mut session = self.session.lock().await;
        if session.is_some() {
            return Ok(true);
        }

        let target = self.target();
        let lock_key = advisory_lock_key(&target, LockPurpose::Election);
        let mut conn = self.source.get_connection().await?;
        match conn.try_advisory_lock(lock_key).await {
            Ok(true) => {
                *session = Some(HeldRole { conn, lock_key });
                let elected_at = self.clock.now();
                *self.acquired_at.lock().unwrap_or_else(|e| e.into_inner()) = Some(elected_at);
                self.is_manager.store(true, Ordering::Release);
                info!(
                    instance_id = %self.instance_id,
                    target_table = %target,
                    %elected_at,
                    "Acquired cache manager role"
                );
                let _ = self.events.send(ElectionEvent::ManagerElected { elected_at });
                Ok(true)
            }
            Ok(false) => {
                debug!(
                    instance_id = %self.instance_id,
                    target_table = %target,
                    "Another instance holds the cache manager role"
                );
                Ok(false)
            }
            Err(err) if err.is_permission_denied() => {
                warn!(
                    instance_id = %self.instance_id,
                    target_table = %target,
                    error = %err,
                    "Insufficient privileges for advisory locks, disabling manager election. \
                     Grant EXECUTE on pg_try_advisory_lock(bigint) and pg_advisory_unlock(bigint) \
                     to the cache role to enable it"
                );
                self.disabled.store(true, Ordering::Release);
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }

    // == Release ==
    /// Gives up the role if held. Closing the session releases the lock even
    /// when the explicit unlock fails.
    pub async fn release_manager_role(&self) {
        let mut session = self.session.lock().await;
        if let Some(held) = session.take() {
            self.give_up(held, "released").await;
        }
    }

    async fn give_up(&self, mut held: HeldRole, reason: &str) {
        if let Err(err) = held.conn.advisory_unlock(held.lock_key).await {
            debug!(error = %err, "Explicit unlock failed, closing manager session");
        }
        drop(held);
        self.lose_role(reason);
    }

    // == Verify ==
    /// Pings the held session. A dead session means the lock is gone too.
    /// A role held for a table that is no longer the target is given up.
    pub async fn verify_manager_role(&self) -> bool {
        let mut session = self.session.lock().await;
        let Some(held) = session.as_mut() else {
            return false;
        };

        if held.lock_key != self.lock_key() {
            if let Some(held) = session.take() {
                self.give_up(held, "cache table changed").await;
            }
            return false;
        }

        match held.conn.ping().await {
            Ok(()) => true,
            Err(err) => {
                warn!(instance_id = %self.instance_id, error = %err, "Manager session lost");
                session.take();
                self.lose_role("session lost");
                false
            }
        }
    }

    fn lose_role(&self, reason: &str) {
        *self.acquired_at.lock().unwrap_or_else(|e| e.into_inner()) = None;
        if self.is_manager.swap(false, Ordering::AcqRel) {
            let lost_at = self.clock.now();
            info!(instance_id = %self.instance_id, %lost_at, reason, "Cache manager role lost");
            let _ = self.events.send(ElectionEvent::ManagerLost { lost_at });
        }
    }

    // == Background Task ==
    /// Starts periodic verification/acquisition. Does nothing when election
    /// is disabled or the task is already running.
    pub fn start(self: &Arc<Self>) {
        if !self.enabled {
            return;
        }
        let mut task = self.task.lock().unwrap_or_else(|e| e.into_inner());
        if task.is_some() {
            return;
        }

        let token = CancellationToken::new();
        let election = Arc::clone(self);
        let cancelled = token.clone();
        let handle = tokio::spawn(async move {
            info!(
                instance_id = %election.instance_id,
                interval = ?election.interval,
                "Starting manager election task"
            );
            loop {
                if !election.is_active() {
                    break;
                }
                if election.is_manager() {
                    election.verify_manager_role().await;
                } else if let Err(err) = election.try_acquire_manager_role().await {
                    warn!(error = %err, "Manager election attempt failed");
                }

                tokio::select! {
                    _ = cancelled.cancelled() => break,
                    _ = tokio::time::sleep(election.interval) => {}
                }
            }
            debug!("Manager election task stopped");
        });
        *task = Some((token, handle));
    }

    /// Stops the background task and releases the role.
    pub async fn stop(&self) {
        let running = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some((token, handle)) = running {
            token.cancel();
            if let Err(err) = handle.await {
                warn!(error = %err, "Manager election task ended abnormally");
            }
        }
        self.release_manager_role().await;
    }
}

impl TableTargetObserver for ManagerElection {
    /// Takes effect on the next verification, which gives up a role held
    /// for the previous table.
    fn on_table_target_changed(&self, target: &TableTarget) {
        let mut current = self.target.lock().unwrap_or_else(|e| e.into_inner());
        if *current != *target {
            info!(instance_id = %self.instance_id, from = %*current, to = %target, "Cache table changed");
            *current = target.clone();
        }
    }
}
