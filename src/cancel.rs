//! Cooperative cancellation handle, checked at every I/O boundary.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::MemoryError;

#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// A token that also trips once `timeout` has elapsed.
    pub fn with_deadline(timeout: Duration) -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            deadline: Some(Instant::now() + timeout),
        }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst) || self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// `Err(Cancelled)` once the token tripped.
    pub fn check(&self) -> anyhow::Result<()> {
        if self.is_cancelled() {
            return Err(MemoryError::Cancelled.into());
        }
        Ok(())
    }

    /// Sleep in small slices so a cancel during backoff is observed promptly.
    pub fn sleep(&self, total: Duration) -> anyhow::Result<()> {
        let slice = Duration::from_millis(25);
        let start = Instant::now();
        while start.elapsed() < total {
            self.check()?;
            std::thread::sleep(slice.min(total.saturating_sub(start.elapsed())));
        }
        self.check()
    }
}
