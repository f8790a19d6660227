// Job context: progress and cancellation for long-running operations

pub mod progress;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::config::StoreConfig;
use crate::error::{Result, StoreError};
use progress::{NoProgress, Throttle};
pub use progress::{JobProgress, ProgressSink};

/// Shared cooperative cancellation flag.
/// Clone it into the thread that may cancel; the running job polls it at
/// batch boundaries.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Passed explicitly into every long-running store operation.
pub struct JobContext<'a> {
    sink: &'a mut dyn ProgressSink,
    throttle: Throttle,
    cancel: CancelToken,
    backoff: Duration,
}

impl<'a> JobContext<'a> {
    pub fn new(sink: &'a mut dyn ProgressSink, cancel: CancelToken, config: &StoreConfig) -> Self {
        Self {
            sink,
            throttle: Throttle::new(config.progress_interval()),
            cancel,
            backoff: config.backoff(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Err(Cancelled) once cancellation was requested.
    pub fn checkpoint(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(StoreError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Report progress. When the event gets through the throttle the worker
    /// sleeps for the configured backoff so the consumer can keep up.
    pub fn report(&mut self, progress: JobProgress) {
        if !self.throttle.admit(&progress) {
            return;
        }
        self.sink.report(&progress);
        if !self.backoff.is_zero() && !progress.is_done {
            std::thread::sleep(self.backoff);
        }
    }
}

/// Run `f` with a context that reports nowhere and is never cancelled.
pub fn with_silent_context<T>(config: &StoreConfig, f: impl FnOnce(&mut JobContext<'_>) -> T) -> T {
    let mut sink = NoProgress;
    let mut ctx = JobContext::new(&mut sink, CancelToken::new(), config);
    f(&mut ctx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_is_shared_between_clones() {
        let token = CancelToken::new();
        let other = token.clone();
        assert!(!token.is_cancelled());
        other.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_checkpoint_after_cancel() {
        let config = StoreConfig::for_tests();
        let token = CancelToken::new();
        let mut sink = NoProgress;
        let ctx = JobContext::new(&mut sink, token.clone(), &config);
        assert!(ctx.checkpoint().is_ok());
        token.cancel();
        assert!(matches!(ctx.checkpoint(), Err(StoreError::Cancelled)));
    }
}
