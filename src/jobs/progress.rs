// Job progress events and sinks

use std::sync::mpsc::{self, Receiver, Sender};
use std::time::{Duration, Instant};

use serde::Serialize;

/// Progress payload emitted during long-running operations.
/// Import, merge, checkout and bulk insert all use this same shape.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobProgress {
    pub phase: String,
    pub current: u64,
    pub total: u64,
    pub percent: f64,
    pub message: String,
    pub cancel_allowed: bool,
    pub is_cancelled: bool,
    pub is_done: bool,
}

impl JobProgress {
    pub fn new(phase: impl Into<String>, current: u64, total: u64) -> Self {
        let total_safe = total.max(1);
        let percent = (current as f64 / total_safe as f64) * 100.0;
        Self {
            phase: phase.into(),
            current,
            total,
            percent: percent.min(100.0),
            message: String::new(),
            cancel_allowed: true,
            is_cancelled: false,
            is_done: false,
        }
    }

    pub fn with_message(mut self, msg: impl Into<String>) -> Self {
        self.message = msg.into();
        self
    }

    pub fn not_cancellable(mut self) -> Self {
        self.cancel_allowed = false;
        self
    }

    pub fn cancelled(mut self) -> Self {
        self.is_cancelled = true;
        self
    }

    pub fn done(mut self) -> Self {
        self.is_done = true;
        self.percent = 100.0;
        self
    }

    /// Events that must reach the sink even when throttled.
    fn is_terminal(&self) -> bool {
        self.is_done || self.is_cancelled
    }
}

/// Receives progress events from a running operation.
pub trait ProgressSink {
    fn report(&mut self, progress: &JobProgress);
}

impl<F: FnMut(&JobProgress)> ProgressSink for F {
    fn report(&mut self, progress: &JobProgress) {
        self(progress)
    }
}

/// Discards every event.
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn report(&mut self, _progress: &JobProgress) {}
}

/// Writes each event to the log at info level.
pub struct LogProgress;

impl ProgressSink for LogProgress {
    fn report(&mut self, p: &JobProgress) {
        if p.message.is_empty() {
            log::info!("[{}] {}/{} ({:.0}%)", p.phase, p.current, p.total, p.percent);
        } else {
            log::info!("[{}] {:.0}% {}", p.phase, p.percent, p.message);
        }
    }
}

/// Sends events over a channel; pair with [`progress_channel`] to consume
/// them as an iterator on another thread.
pub struct ChannelProgress {
    tx: Sender<JobProgress>,
}

impl ProgressSink for ChannelProgress {
    fn report(&mut self, progress: &JobProgress) {
        // A dropped receiver means nobody is listening any more.
        let _ = self.tx.send(progress.clone());
    }
}

pub fn progress_channel() -> (ChannelProgress, Receiver<JobProgress>) {
    let (tx, rx) = mpsc::channel();
    (ChannelProgress { tx }, rx)
}

/// Decides whether an event is due given a minimum interval.
/// Terminal events (done, cancelled) are always due.
#[derive(Debug)]
pub struct Throttle {
    interval: Duration,
    last: Option<Instant>,
}

impl Throttle {
    pub fn new(interval: Duration) -> Self {
        Self { interval, last: None }
    }

    pub fn admit(&mut self, progress: &JobProgress) -> bool {
        let now = Instant::now();
        let due = match self.last {
            None => true,
            Some(last) => now.duration_since(last) >= self.interval,
        };
        if due || progress.is_terminal() {
            self.last = Some(now);
            true
        } else {
            false
        }
    }
}

/// Forwards at most one event per interval to the inner sink.
pub struct Throttled<S> {
    inner: S,
    throttle: Throttle,
}

impl<S: ProgressSink> Throttled<S> {
    pub fn new(inner: S, interval: Duration) -> Self {
        Self {
            inner,
            throttle: Throttle::new(interval),
        }
    }
}

impl<S: ProgressSink> ProgressSink for Throttled<S> {
    fn report(&mut self, progress: &JobProgress) {
        if self.throttle.admit(progress) {
            self.inner.report(progress);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percent_is_clamped() {
        let p = JobProgress::new("import", 5, 0);
        assert_eq!(p.percent, 100.0);
        let p = JobProgress::new("import", 1, 4);
        assert_eq!(p.percent, 25.0);
    }

    #[test]
    fn test_throttle_drops_bursts_but_keeps_done() {
        let mut seen = Vec::new();
        {
            let mut sink = Throttled::new(|p: &JobProgress| seen.push(p.current), Duration::from_secs(60));
            for i in 0..10 {
                sink.report(&JobProgress::new("merge", i, 10));
            }
            sink.report(&JobProgress::new("merge", 10, 10).done());
        }
        assert_eq!(seen, vec![0, 10]);
    }

    #[test]
    fn test_channel_sink_is_iterable() {
        let (mut sink, rx) = progress_channel();
        sink.report(&JobProgress::new("checkout", 1, 2));
        sink.report(&JobProgress::new("checkout", 2, 2).done());
        drop(sink);
        let events: Vec<_> = rx.iter().collect();
        assert_eq!(events.len(), 2);
        assert!(events[1].is_done);
    }
}
