//! Schema Manager
//!
//! Creates the cache schema, table and index once across every process
//! pointed at the same database, using a session-scoped advisory lock.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::{CacheOptions, TableTarget, TableTargetObserver};
use crate::datasource::{advisory_lock_key, CacheConnection, DataSource, LockPurpose};
use crate::error::{CacheError, DataSourceError, DataSourceErrorKind, Result};

// == Infrastructure State ==
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum InfrastructureState {
    NotEnsured = 0,
    Ensuring = 1,
    Ensured = 2,
    SkippedByConfig = 3,
}

impl InfrastructureState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Ensuring,
            2 => Self::Ensured,
            3 => Self::SkippedByConfig,
            _ => Self::NotEnsured,
        }
    }
}

// == Ensure Outcome ==
/// What a call to [`SchemaManager::ensure`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnsureOutcome {
    /// This call created the objects while holding the lock
    Created,
    /// The objects were already there, or a previous call ensured them
    AlreadyEnsured,
    /// Another instance created them while this one waited
    CreatedByPeer,
    /// Created without the lock (privileges missing or lock timeout)
    Uncoordinated,
    /// Creation is disabled in configuration
    SkippedByConfig,
}

// == Schema Manager ==
pub struct SchemaManager {
    source: Arc<dyn DataSource>,
    /// Replaced on a runtime table change, which also resets `state`
    target: StdMutex<TableTarget>,
    create_infrastructure: bool,
    lock_timeout: Duration,
    poll_interval: Duration,
    state: AtomicU8,
    /// Serialises callers within this process
    gate: Mutex<()>,
}

impl SchemaManager {
    pub fn new(options: &CacheOptions, source: Arc<dyn DataSource>) -> Self {
        Self {
            source,
            target: StdMutex::new(options.target.clone()),
            create_infrastructure: options.create_infrastructure,
            lock_timeout: options.infrastructure_lock_timeout,
            poll_interval: options.infrastructure_poll_interval,
            state: AtomicU8::new(InfrastructureState::NotEnsured as u8),
            gate: Mutex::new(()),
        }
    }

    pub fn state(&self) -> InfrastructureState {
        InfrastructureState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: InfrastructureState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn target(&self) -> TableTarget {
        self.target.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    // == Ensure ==
    /// Makes sure the cache table exists. Safe to call repeatedly and
    /// concurrently; only the first successful call touches the database.
    pub async fn ensure(&self) -> Result<EnsureOutcome> {
        if let Some(outcome) = self.settled() {
            return Ok(outcome);
        }

        let _gate = self.gate.lock().await;
        if let Some(outcome) = self.settled() {
            return Ok(outcome);
        }

        let target = self.target();
        if !self.create_infrastructure {
            info!(
                target_table = %target,
                "Infrastructure creation disabled, expecting the cache table to exist"
            );
            self.set_state(InfrastructureState::SkippedByConfig);
            return Ok(EnsureOutcome::SkippedByConfig);
        }

        self.set_state(InfrastructureState::Ensuring);
        match self.coordinate(&target).await {
            Ok(outcome) => {
                // a table change while this ran leaves the new table to the next call
                if self.target() == target {
                    self.set_state(InfrastructureState::Ensured);
                } else {
                    self.set_state(InfrastructureState::NotEnsured);
                }
                Ok(outcome)
            }
            Err(err) => {
                warn!(target_table = %target, error = %err, "Failed to ensure cache infrastructure");
                self.set_state(InfrastructureState::NotEnsured);
                Err(err)
            }
        }
    }

    fn settled(&self) -> Option<EnsureOutcome> {
        match self.state() {
            InfrastructureState::Ensured => Some(EnsureOutcome::AlreadyEnsured),
            InfrastructureState::SkippedByConfig => Some(EnsureOutcome::SkippedByConfig),
            InfrastructureState::NotEnsured | InfrastructureState::Ensuring => None,
        }
    }

    async fn coordinate(&self, target: &TableTarget) -> Result<EnsureOutcome> {
        let mut conn = self.source.get_connection().await?;
        if conn.infrastructure_exists().await? {
            debug!(target_table = %target, "Cache table already exists");
            return Ok(EnsureOutcome::AlreadyEnsured);
        }

        let key = advisory_lock_key(target, LockPurpose::Infrastructure);
        let deadline = Instant::now() + self.lock_timeout;
        let mut waiting = false;

        loop {
            match conn.try_advisory_lock(key).await {
                Ok(true) => return create_locked(conn.as_mut(), key, target).await,
                Ok(false) => {
                    if !waiting {
                        info!(target_table = %target, "Another instance is creating infrastructure, waiting");
                        waiting = true;
                    }
                    if conn.infrastructure_exists().await? {
                        info!(target_table = %target, "Infrastructure created by another instance");
                        return Ok(EnsureOutcome::CreatedByPeer);
                    }
                    if Instant::now() >= deadline {
                        warn!(
                            target_table = %target,
                            timeout = ?self.lock_timeout,
                            "Timed out waiting for infrastructure lock, creating without coordination"
                        );
                        return create_uncoordinated(conn.as_mut(), target).await;
                    }
                    tokio::time::sleep(self.poll_interval).await;
                }
                Err(err) if err.is_permission_denied() => {
                    warn!(
                        target_table = %target,
                        error = %err,
                        "Insufficient privileges for advisory locks. Grant EXECUTE on \
                         pg_try_advisory_lock(bigint) and pg_advisory_unlock(bigint) to the cache role, \
                         or set create_infrastructure = false and create the table manually. \
                         Creating infrastructure without coordination"
                    );
                    return create_uncoordinated(conn.as_mut(), target).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

impl TableTargetObserver for SchemaManager {
    fn on_table_target_changed(&self, target: &TableTarget) {
        let mut current = self.target.lock().unwrap_or_else(|e| e.into_inner());
        if *current != *target {
            info!(from = %*current, to = %target, "Cache table changed, infrastructure must be ensured again");
            *current = target.clone();
            self.set_state(InfrastructureState::NotEnsured);
        }
    }
}

async fn create_locked(conn: &mut dyn CacheConnection, key: i64, target: &TableTarget) -> Result<EnsureOutcome> {
    let created = match conn.infrastructure_exists().await {
        Ok(true) => Ok(EnsureOutcome::CreatedByPeer),
        Ok(false) => conn
            .create_infrastructure()
            .await
            .map(|_| EnsureOutcome::Created),
        Err(err) => Err(err),
    };

    // a failed unlock is harmless: closing the session releases it
    if let Err(err) = conn.advisory_unlock(key).await {
        debug!(error = %err, "Failed to release infrastructure lock");
    }

    if created.as_ref().is_ok_and(|o| *o == EnsureOutcome::Created) {
        info!(target_table = %target, "Created cache infrastructure");
    }
    created
}

async fn create_uncoordinated(conn: &mut dyn CacheConnection, target: &TableTarget) -> Result<EnsureOutcome> {
    match conn.create_infrastructure().await {
        Ok(())
        | Err(CacheError::DataSource(DataSourceError {
            kind: DataSourceErrorKind::AlreadyExists,
            ..
        })) => {
            info!(target_table = %target, "Created cache infrastructure without coordination");
            Ok(EnsureOutcome::Uncoordinated)
        }
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use tracing_test::traced_test;

    use super::*;
    use crate::datasource::MemoryDataSource;

    fn manager(source: &MemoryDataSource, options: &CacheOptions) -> SchemaManager {
        SchemaManager::new(options, Arc::new(source.clone()))
    }

    #[tokio::test]
    async fn test_creates_once_then_short_circuits() {
        let source = MemoryDataSource::new();
        let schema = manager(&source, &CacheOptions::default());

        assert_eq!(schema.ensure().await.unwrap(), EnsureOutcome::Created);
        assert_eq!(schema.state(), InfrastructureState::Ensured);

        let checkouts = source.checkouts();
        assert_eq!(schema.ensure().await.unwrap(), EnsureOutcome::AlreadyEnsured);
        assert_eq!(source.checkouts(), checkouts);
        assert_eq!(source.creations(), 1);
    }

    #[tokio::test]
    async fn test_existing_table_is_already_ensured() {
        let source = MemoryDataSource::with_infrastructure();
        let schema = manager(&source, &CacheOptions::default());

        assert_eq!(schema.ensure().await.unwrap(), EnsureOutcome::AlreadyEnsured);
        assert_eq!(source.creations(), 0);
    }

    #[tokio::test]
    async fn test_disabled_creation_never_touches_database() {
        let source = MemoryDataSource::new();
        let options = CacheOptions {
            create_infrastructure: false,
            ..CacheOptions::default()
        };
        let schema = manager(&source, &options);

        assert_eq!(schema.ensure().await.unwrap(), EnsureOutcome::SkippedByConfig);
        assert_eq!(schema.state(), InfrastructureState::SkippedByConfig);
        assert_eq!(source.checkouts(), 0);
        assert!(!source.has_infrastructure());
    }

    #[tokio::test]
    #[traced_test]
    async fn test_privilege_denial_falls_back_to_uncoordinated() {
        let source = MemoryDataSource::new();
        source.deny_lock_privileges();
        let schema = manager(&source, &CacheOptions::default());

        assert_eq!(schema.ensure().await.unwrap(), EnsureOutcome::Uncoordinated);
        assert!(source.has_infrastructure());
        assert!(logs_contain("pg_try_advisory_lock"));
        assert!(logs_contain("create_infrastructure = false"));
    }

    #[tokio::test]
    async fn test_failure_resets_state() {
        let source = MemoryDataSource::new();
        source.fail_next_checkouts(1);
        let schema = manager(&source, &CacheOptions::default());

        assert!(schema.ensure().await.is_err());
        assert_eq!(schema.state(), InfrastructureState::NotEnsured);
        assert_eq!(schema.ensure().await.unwrap(), EnsureOutcome::Created);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lock_timeout_falls_back_to_uncoordinated() {
        let source = MemoryDataSource::new();
        let options = CacheOptions::default();
        let key = advisory_lock_key(&options.target, LockPurpose::Infrastructure);

        // a stuck peer holds the lock and never creates the table
        let mut peer = source.get_connection().await.unwrap();
        assert!(peer.try_advisory_lock(key).await.unwrap());

        let schema = manager(&source.share(), &options);
        assert_eq!(schema.ensure().await.unwrap(), EnsureOutcome::Uncoordinated);
        assert!(source.has_infrastructure());
        drop(peer);
    }

    #[tokio::test]
    async fn test_table_change_requires_new_ensure() {
        let source = MemoryDataSource::new();
        let schema = manager(&source, &CacheOptions::default());
        assert_eq!(schema.ensure().await.unwrap(), EnsureOutcome::Created);

        let renamed = TableTarget::new("public", "cache_entries_v2");
        source.on_table_target_changed(&renamed);
        schema.on_table_target_changed(&renamed);

        assert_eq!(schema.state(), InfrastructureState::NotEnsured);
        assert_eq!(schema.target(), renamed);
        assert_eq!(schema.ensure().await.unwrap(), EnsureOutcome::Created);
        assert!(source.has_infrastructure());
        assert_eq!(source.creations(), 2);
    }
}
