#![forbid(unsafe_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// SIGTERM/SIGINT flag for the supervisor's wait loop. Handlers only set the
/// flag; the loop forwards the stop to its workers at the next poll.
#[derive(Clone, Debug)]
pub(crate) struct ShutdownToken {
    flag: Arc<AtomicBool>,
}

impl ShutdownToken {
    pub(crate) fn manual() -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
        }
    }

    pub(crate) fn install() -> Result<Self, std::io::Error> {
        let token = Self::manual();
        signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&token.flag))?;
        signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&token.flag))?;
        Ok(token)
    }

    pub(crate) fn requested(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}
