//! Per-class lock map serializing batch operations.
//!
//! SQLite has no `SELECT ... FOR UPDATE`, so operations that must not
//! interleave on the same class (batch VM creation, settings commits, pool
//! claims) take an in-process async lock instead. Batches on different
//! classes proceed in parallel.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use anyhow::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::error::LabError;

/// Default lock acquisition timeout.
pub const LOCK_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct ClassLockMap {
    locks: Arc<StdMutex<HashMap<i64, Arc<Mutex<()>>>>>,
}

impl ClassLockMap {
    pub fn new() -> Self {
        Self {
            locks: Arc::new(StdMutex::new(HashMap::new())),
        }
    }

    fn entry(&self, class_id: i64) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().expect("class lock map poisoned");
        Arc::clone(locks.entry(class_id).or_default())
    }

    /// Acquire the lock for `class_id`, waiting at most `timeout`.
    ///
    /// Surfaces [`LabError::ResourceBusy`] when the timeout elapses.
    pub async fn lock_with_timeout(
        &self,
        class_id: i64,
        timeout: Duration,
    ) -> Result<OwnedMutexGuard<()>, Error> {
        let entry = self.entry(class_id);
        match tokio::time::timeout(timeout, entry.lock_owned()).await {
            Ok(guard) => Ok(guard),
            Err(_) => Err(LabError::ResourceBusy(format!(
                "could not lock class {class_id} within {}s",
                timeout.as_secs()
            ))
            .into()),
        }
    }

    /// Acquire the lock for `class_id` with the default timeout.
    pub async fn lock(&self, class_id: i64) -> Result<OwnedMutexGuard<()>, Error> {
        self.lock_with_timeout(class_id, LOCK_TIMEOUT).await
    }
}

impl Default for ClassLockMap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_lock_times_out_while_held() {
        let locks = ClassLockMap::new();

        let guard = locks.lock(7).await.unwrap();

        let err = locks
            .lock_with_timeout(7, Duration::from_millis(20))
            .await
            .unwrap_err();
        match err.downcast_ref::<LabError>() {
            Some(LabError::ResourceBusy(_)) => {}
            other => panic!("unexpected error: {other:?}"),
        }

        // other classes are unaffected
        let _other = locks
            .lock_with_timeout(8, Duration::from_millis(20))
            .await
            .unwrap();

        drop(guard);
        let _reacquired = locks
            .lock_with_timeout(7, Duration::from_millis(20))
            .await
            .unwrap();
    }
}
