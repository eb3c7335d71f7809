//! Cooperative cancellation

use crate::error::{DataHubError, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Longest uninterrupted sleep inside [`CancelToken::sleep`]
const SLEEP_SLICE: Duration = Duration::from_millis(20);

/// Shared abort flag polled by adapters at every blocking-loop iteration
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation; every clone observes it
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// `Err(Aborted)` once cancelled
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(DataHubError::Aborted)
        } else {
            Ok(())
        }
    }

    /// Sleep for `duration`, waking early with `Err(Aborted)` on cancellation
    pub fn sleep(&self, duration: Duration) -> Result<()> {
        let deadline = Instant::now() + duration;
        loop {
            self.check()?;
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            std::thread::sleep((deadline - now).min(SLEEP_SLICE));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clones_share_flag() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(clone.check().is_ok());
        token.cancel();
        assert!(clone.is_cancelled());
        assert!(clone.check().unwrap_err().is_aborted());
    }

    #[test]
    fn test_sleep_wakes_on_cancel() {
        let token = CancelToken::new();
        let canceller = token.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            canceller.cancel();
        });

        let started = Instant::now();
        let result = token.sleep(Duration::from_secs(10));
        handle.join().unwrap();

        assert!(result.unwrap_err().is_aborted());
        assert!(started.elapsed() < Duration::from_secs(2));
    }
}
