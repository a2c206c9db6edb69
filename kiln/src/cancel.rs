//! Cooperative cancellation shared between the control thread and callers.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Result;

/// Cloneable cancellation flag. All clones observe the same state.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Cancel `token` on the first SIGINT or SIGTERM; exit on the second.
///
/// Both signals are blocked on the calling thread and waited for on a
/// dedicated one. Threads inherit the mask, so call this before spawning
/// any. Spawned child processes start with an empty mask.
#[cfg(unix)]
pub fn cancel_on_signals(token: CancelToken) -> Result<()> {
    use anyhow::Context;
    use nix::sys::signal::{SigSet, Signal};
    use tracing::warn;

    let mut signals = SigSet::empty();
    signals.add(Signal::SIGINT);
    signals.add(Signal::SIGTERM);
    signals
        .thread_block()
        .context("block termination signals")?;

    std::thread::Builder::new()
        .name("signals".to_string())
        .spawn(move || {
            loop {
                match signals.wait() {
                    Ok(signal) if token.is_cancelled() => {
                        warn!(signal = signal.as_str(), "second signal, exiting");
                        std::process::exit(crate::exit_codes::FAILED);
                    }
                    Ok(signal) => {
                        warn!(signal = signal.as_str(), "interrupted, pausing");
                        token.cancel();
                    }
                    Err(err) => {
                        warn!(err = %err, "waiting for signals failed");
                        return;
                    }
                }
            }
        })
        .context("spawn signal thread")?;
    Ok(())
}

#[cfg(not(unix))]
pub fn cancel_on_signals(_token: CancelToken) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_state() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());
    }
}
