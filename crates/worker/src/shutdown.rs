#![forbid(unsafe_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

const SLEEP_SLICE: Duration = Duration::from_millis(50);

/// Cancellation token behind SIGTERM/SIGINT. The handlers only set the flag;
/// the worker loop observes it at its defined suspension points. The flag is
/// sticky: once requested, shutdown never un-requests.
#[derive(Clone, Debug)]
pub struct ShutdownToken {
    flag: Arc<AtomicBool>,
}

impl ShutdownToken {
    /// Token not wired to any signal; tests trigger it by hand.
    pub fn manual() -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn install() -> Result<Self, std::io::Error> {
        let token = Self::manual();
        signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&token.flag))?;
        signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&token.flag))?;
        Ok(token)
    }

    pub fn requested(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    #[cfg(test)]
    pub fn trigger(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// Sleep up to `duration`, waking early when shutdown is requested.
    /// Returns true if the sleep was interrupted.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.requested() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            std::thread::sleep(SLEEP_SLICE.min(deadline - now));
        }
    }
}
