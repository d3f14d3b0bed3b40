//! Session mutual exclusion and cooperative cancellation.
//!
//! Two layers guard a session: [`SessionLock`] serializes callers sharing one
//! orchestrator, and the database lease (see `repo::lock_repo`) serializes
//! processes sharing one database file.
//!
//! # Invariants
//! - At most one guard exists per lock at any time.
//! - The guard releases the lock on every exit path (drop).
//! - An [`OperationGuard`] holds the in-process lock before it takes the
//!   lease, and gives the lease back before the in-process lock.

use crate::repo::{LeaseOutcome, LockRepository, StoreError, StoreResult};
use chrono::Utc;
use log::{debug, warn};
use std::cell::Cell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Non-blocking, in-process lock shared by sync sessions, manual edits and
/// backups.
#[derive(Debug, Default)]
pub struct SessionLock {
    held: AtomicBool,
    holder: Mutex<Option<&'static str>>,
}

impl SessionLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquires the lock for `operation`, or returns the operation currently
    /// holding it.
    pub fn try_acquire(&self, operation: &'static str) -> Result<SessionGuard<'_>, &'static str> {
        if self
            .held
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(self.current_holder().unwrap_or("unknown"));
        }
        *self.holder.lock().unwrap_or_else(PoisonError::into_inner) = Some(operation);
        debug!("event=session_lock module=sync status=acquired operation={operation}");
        Ok(SessionGuard { lock: self })
    }

    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::Acquire)
    }

    /// Operation name of the current holder.
    pub fn current_holder(&self) -> Option<&'static str> {
        *self.holder.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Scoped ownership of a [`SessionLock`].
#[derive(Debug)]
pub struct SessionGuard<'lock> {
    lock: &'lock SessionLock,
}

impl Drop for SessionGuard<'_> {
    fn drop(&mut self) {
        let operation = self
            .lock
            .holder
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.lock.held.store(false, Ordering::Release);
        debug!(
            "event=session_lock module=sync status=released operation={}",
            operation.unwrap_or("unknown")
        );
    }
}

/// Why an [`OperationGuard`] could not be taken.
#[derive(Debug)]
pub enum AcquireError {
    /// Operation name of the current holder, in this process or another one.
    Held(String),
    Store(StoreError),
}

impl From<StoreError> for AcquireError {
    fn from(value: StoreError) -> Self {
        Self::Store(value)
    }
}

/// Ownership of both the in-process lock and the database lease.
///
/// The lease heartbeat is moved forward by [`OperationGuard::heartbeat`]; the
/// lease is deleted on drop.
pub struct OperationGuard<'a, S: LockRepository> {
    store: &'a S,
    owner: Uuid,
    operation: &'static str,
    stale_after: Duration,
    last_heartbeat: Cell<Instant>,
    _local: SessionGuard<'a>,
}

impl<'a, S: LockRepository> OperationGuard<'a, S> {
    pub fn acquire(
        lock: &'a SessionLock,
        store: &'a S,
        operation: &'static str,
        stale_after: Duration,
    ) -> Result<Self, AcquireError> {
        let local = lock
            .try_acquire(operation)
            .map_err(|holder| AcquireError::Held(holder.to_string()))?;
        let owner = Uuid::new_v4();
        match store.try_acquire_lease(owner, operation, now_ms(), duration_ms(stale_after))? {
            LeaseOutcome::Acquired => {}
            LeaseOutcome::Held(holder) => {
                debug!(
                    "event=session_lease module=sync status=held operation={operation} holder={} holder_pid={}",
                    holder.operation, holder.pid
                );
                return Err(AcquireError::Held(holder.operation));
            }
        }
        debug!("event=session_lease module=sync status=acquired operation={operation} owner={owner}");
        Ok(Self {
            store,
            owner,
            operation,
            stale_after,
            last_heartbeat: Cell::new(Instant::now()),
            _local: local,
        })
    }

    pub fn owner(&self) -> Uuid {
        self.owner
    }

    /// Refreshes the lease once a quarter of the stale threshold has passed.
    ///
    /// Returns `false` when another process has taken the lease over.
    pub fn heartbeat(&self) -> StoreResult<bool> {
        if self.last_heartbeat.get().elapsed() < self.stale_after / 4 {
            return Ok(true);
        }
        let kept = self.store.refresh_lease(self.owner, now_ms())?;
        if kept {
            self.last_heartbeat.set(Instant::now());
        }
        Ok(kept)
    }
}

impl<S: LockRepository> Drop for OperationGuard<'_, S> {
    fn drop(&mut self) {
        if let Err(err) = self.store.release_lease(self.owner) {
            warn!(
                "event=session_lease module=sync status=release_failed operation={} owner={} error={err}",
                self.operation, self.owner
            );
        }
    }
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn duration_ms(value: Duration) -> i64 {
    i64::try_from(value.as_millis()).unwrap_or(i64::MAX)
}

/// Cloneable cancellation request shared between a running session and the
/// caller that may stop it.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<CancelState>,
}

#[derive(Debug, Default)]
struct CancelState {
    cancelled: AtomicBool,
    reason: Mutex<Option<String>>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation; the first reason wins.
    pub fn cancel(&self, reason: impl Into<String>) {
        let mut slot = self.inner.reason.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_none() {
            *slot = Some(reason.into());
        }
        self.inner.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    pub fn reason(&self) -> Option<String> {
        self.inner
            .reason
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}
