use std::{
    sync::{
        Arc, Condvar, Mutex,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use crate::foundation::error::{FractError, FractResult};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FenceStatus {
    Unsignaled,
    Signaled,
    /// The device failed while executing work guarded by this fence.
    Lost(String),
}

#[derive(Debug)]
struct FenceInner {
    id: u64,
    status: Mutex<FenceStatus>,
    cond: Condvar,
}

static NEXT_FENCE_ID: AtomicU64 = AtomicU64::new(1);

/// Binary device-to-host completion signal.
///
/// Clones share the same signal; devices keep a clone to signal from their completion path.
#[derive(Clone, Debug)]
pub struct Fence {
    inner: Arc<FenceInner>,
}

impl Default for Fence {
    fn default() -> Self {
        Self::new()
    }
}

impl Fence {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(FenceInner {
                id: NEXT_FENCE_ID.fetch_add(1, Ordering::Relaxed),
                status: Mutex::new(FenceStatus::Unsignaled),
                cond: Condvar::new(),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn status(&self) -> FenceStatus {
        match self.inner.status.lock() {
            Ok(s) => s.clone(),
            Err(_) => FenceStatus::Lost("fence mutex poisoned".to_string()),
        }
    }

    pub fn is_signaled(&self) -> bool {
        self.status() == FenceStatus::Signaled
    }

    pub fn signal(&self) {
        self.set(FenceStatus::Signaled);
    }

    pub fn mark_lost(&self, reason: impl Into<String>) {
        self.set(FenceStatus::Lost(reason.into()));
    }

    /// Return to unsignaled so the fence can guard the next submission.
    pub fn reset(&self) -> FractResult<()> {
        let mut s = self
            .inner
            .status
            .lock()
            .map_err(|_| FractError::device("fence mutex poisoned"))?;
        if let FenceStatus::Lost(reason) = &*s {
            return Err(FractError::device(format!(
                "cannot reset lost fence {}: {reason}",
                self.inner.id
            )));
        }
        *s = FenceStatus::Unsignaled;
        Ok(())
    }

    /// Block until signaled or `deadline` passes.
    pub fn wait_until(&self, deadline: Instant) -> FractResult<()> {
        let mut s = self
            .inner
            .status
            .lock()
            .map_err(|_| FractError::device("fence mutex poisoned"))?;
        loop {
            match &*s {
                FenceStatus::Signaled => return Ok(()),
                FenceStatus::Lost(reason) => {
                    return Err(FractError::device(format!(
                        "fence {} lost: {reason}",
                        self.inner.id
                    )));
                }
                FenceStatus::Unsignaled => {}
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(FractError::timeout(format!(
                    "fence {} not signaled before deadline",
                    self.inner.id
                )));
            }
            let (guard, _) = self
                .inner
                .cond
                .wait_timeout(s, deadline - now)
                .map_err(|_| FractError::device("fence mutex poisoned"))?;
            s = guard;
        }
    }

    pub fn wait(&self, timeout: Duration) -> FractResult<()> {
        self.wait_until(Instant::now() + timeout)
    }

    fn set(&self, status: FenceStatus) {
        if let Ok(mut s) = self.inner.status.lock() {
            *s = status;
            self.inner.cond.notify_all();
        }
    }
}

#[cfg(test)]
#[path = "../../tests/unit/compute/fence.rs"]
mod tests;
