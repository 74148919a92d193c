//! In-process registry of the jobs this worker is executing.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use orbital_core::types::DbId;

/// Shared set of running job ids, read by the heartbeat.
#[derive(Debug, Clone, Default)]
pub struct ActiveJobs {
    inner: Arc<Mutex<BTreeSet<DbId>>>,
}

impl ActiveJobs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `job_id` until the returned guard is dropped.
    pub fn track(&self, job_id: DbId) -> ActiveGuard {
        if let Ok(mut set) = self.inner.lock() {
            set.insert(job_id);
        }
        ActiveGuard {
            jobs: self.clone(),
            job_id,
        }
    }

    /// Running job ids in ascending order.
    pub fn snapshot(&self) -> Vec<DbId> {
        self.inner
            .lock()
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|set| set.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Removes its job from [`ActiveJobs`] on drop, including on panic.
#[derive(Debug)]
pub struct ActiveGuard {
    jobs: ActiveJobs,
    job_id: DbId,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        if let Ok(mut set) = self.jobs.inner.lock() {
            set.remove(&self.job_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_removes_on_drop() {
        let active = ActiveJobs::new();
        let a = active.track(3);
        let b = active.track(1);
        assert_eq!(active.snapshot(), vec![1, 3]);
        drop(a);
        assert_eq!(active.snapshot(), vec![1]);
        drop(b);
        assert!(active.is_empty());
    }
}
