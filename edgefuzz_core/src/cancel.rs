use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Granularity used when sleeping so that cancellation is observed promptly.
const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// A cloneable, campaign-wide cancellation signal.
///
/// Every clone shares the same flag. Long-running operations (channel
/// receives, retry backoff, the campaign loop) poll it between steps.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Sleeps for `duration` in small slices.
    ///
    /// Returns `false` if the token was cancelled before the full duration elapsed.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.is_cancelled() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            std::thread::sleep(CANCEL_POLL_INTERVAL.min(deadline - now));
        }
    }

    /// Spawns a watchdog thread that cancels this token once `duration` has elapsed.
    pub fn cancel_after(&self, duration: Duration) -> std::thread::JoinHandle<()> {
        let token = self.clone();
        std::thread::spawn(move || {
            if token.sleep(duration) {
                tracing::warn!(
                    after_secs = duration.as_secs(),
                    "Campaign deadline reached, cancelling"
                );
                token.cancel();
            }
        })
    }
}
