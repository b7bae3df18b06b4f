use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use chrono::NaiveDate;
use tokio::sync::Notify;
use ulid::Ulid;

use crate::observability;

/// Key serializing every booking attempt on one court for one day.
///
/// Coarser than the requested interval on purpose: two overlapping requests
/// with different start times must contend for the same key.
pub fn court_day_key(court_id: Ulid, date: NaiveDate) -> String {
    format!("court:{court_id}:{date}")
}

/// Key serializing creation of payment attempts for one reservation.
pub fn deposit_key(reservation_id: Ulid) -> String {
    format!("deposit:{reservation_id}")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockTimeout {
    pub key: String,
    pub waited: Duration,
}

impl std::fmt::Display for LockTimeout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "timed out after {:?} waiting for lock {}", self.waited, self.key)
    }
}

impl std::error::Error for LockTimeout {}

/// Process-wide table of held resource keys.
///
/// One map behind one mutex; waiters park on a shared `Notify` and re-check
/// after every release. Constructed once and shared by reference.
#[derive(Default)]
pub struct LockRegistry {
    held: Mutex<HashMap<String, Ulid>>,
    released: Notify,
}

impl LockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn try_take(&self, key: &str) -> Option<Ulid> {
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        if held.contains_key(key) {
            return None;
        }
        let token = Ulid::new();
        held.insert(key.to_string(), token);
        metrics::gauge!(observability::LOCKS_HELD).set(held.len() as f64);
        Some(token)
    }

    /// Wait up to `timeout` for `key`. The guard releases on drop.
    pub async fn acquire(&self, key: &str, timeout: Duration) -> Result<LockGuard<'_>, LockTimeout> {
        let started = Instant::now();
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let notified = self.released.notified();
            tokio::pin!(notified);
            // Register before checking so a release between the check and the
            // wait is not missed.
            notified.as_mut().enable();

            if let Some(token) = self.try_take(key) {
                metrics::histogram!(observability::LOCK_WAIT_SECONDS)
                    .record(started.elapsed().as_secs_f64());
                return Ok(LockGuard {
                    registry: self,
                    key: key.to_string(),
                    token,
                });
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                metrics::counter!(observability::LOCK_TIMEOUTS_TOTAL).increment(1);
                tracing::warn!(key, waited_ms = started.elapsed().as_millis() as u64, "lock timeout");
                return Err(LockTimeout {
                    key: key.to_string(),
                    waited: started.elapsed(),
                });
            }
        }
    }

    /// Release `key` unconditionally. Releasing an unheld key is a no-op.
    pub fn release(&self, key: &str) {
        self.release_if(key, None);
    }

    fn release_if(&self, key: &str, token: Option<Ulid>) {
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        let owned = match (held.get(key), token) {
            (None, _) => false,
            (Some(_), None) => true,
            (Some(current), Some(token)) => *current == token,
        };
        if owned {
            held.remove(key);
            metrics::gauge!(observability::LOCKS_HELD).set(held.len() as f64);
            drop(held);
            self.released.notify_waiters();
        }
    }

    pub fn is_held(&self, key: &str) -> bool {
        self.held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(key)
    }

    pub fn held_count(&self) -> usize {
        self.held.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

/// Ownership of one key. Dropping it releases the key on every exit path.
pub struct LockGuard<'a> {
    registry: &'a LockRegistry,
    key: String,
    token: Ulid,
}

impl LockGuard<'_> {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        // A forced `release` followed by a new holder must not be undone here.
        self.registry.release_if(&self.key, Some(self.token));
    }
}
