//! Channels through which a backend reports load progress and streamed tokens.

use crate::protocol::WorkerEvent;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tokio::sync::mpsc::UnboundedSender;
use tracing::debug;

pub type EventSender = UnboundedSender<WorkerEvent>;

/// Shared cooperative cancellation flag for the running inference.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn clear(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

fn send(tx: &EventSender, event: WorkerEvent) {
    if tx.send(event).is_err() {
        debug!("event receiver dropped");
    }
}

/// Reports load phases and fractions.
///
/// Fractions are clamped to [0, 1] and never go backwards, even when a
/// backend restarts its own per-file progress.
#[derive(Debug)]
pub struct ProgressSink {
    tx: EventSender,
    fraction: f32,
}

impl ProgressSink {
    pub fn new(tx: EventSender) -> Self {
        Self { tx, fraction: 0.0 }
    }

    /// Announce a new load phase without a fraction.
    pub fn phase(&mut self, message: impl Into<String>) {
        send(&self.tx, WorkerEvent::loading(message, None));
    }

    /// Announce a new load phase at `fraction`.
    pub fn phase_at(&mut self, message: impl Into<String>, fraction: f32) {
        let fraction = self.advance(fraction);
        send(&self.tx, WorkerEvent::loading(message, Some(fraction)));
    }

    /// Report a load fraction.
    pub fn report(&mut self, fraction: f32) {
        let fraction = self.advance(fraction);
        send(&self.tx, WorkerEvent::progress(fraction));
    }

    /// Report 1.0 unless it was already reported.
    pub fn finish(&mut self) {
        if self.fraction < 1.0 {
            self.report(1.0);
        }
    }

    /// Last fraction reported.
    pub fn fraction(&self) -> f32 {
        self.fraction
    }

    fn advance(&mut self, fraction: f32) -> f32 {
        let fraction = if fraction.is_nan() {
            self.fraction
        } else {
            fraction.clamp(0.0, 1.0)
        };
        self.fraction = self.fraction.max(fraction);
        self.fraction
    }
}

/// Streams generated tokens as `update` events and carries the cancel flag.
#[derive(Debug)]
pub struct TokenSink {
    tx: EventSender,
    cancel: CancelFlag,
    first_token_at: Option<Instant>,
    num_tokens: usize,
}

impl TokenSink {
    pub fn new(tx: EventSender, cancel: CancelFlag) -> Self {
        Self {
            tx,
            cancel,
            first_token_at: None,
            num_tokens: 0,
        }
    }

    /// Emit one decoded token.
    ///
    /// Throughput is tokens per second since the first token and is only
    /// reported from the second token on. Returns `false` once cancellation
    /// was requested; the token is then not emitted and the backend should
    /// stop at this point.
    pub fn push(&mut self, output: impl Into<String>) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }

        self.num_tokens += 1;
        let tps = match self.first_token_at {
            None => {
                self.first_token_at = Some(Instant::now());
                None
            }
            Some(start) => {
                let elapsed = start.elapsed().as_secs_f64();
                (elapsed > 0.0).then(|| self.num_tokens as f64 / elapsed)
            }
        };

        send(
            &self.tx,
            WorkerEvent::Update {
                output: output.into(),
                tps,
                num_tokens: Some(self.num_tokens),
            },
        );
        true
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn token_count(&self) -> usize {
        self.num_tokens
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn drain(rx: &mut mpsc::UnboundedReceiver<WorkerEvent>) -> Vec<WorkerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[test]
    fn progress_is_clamped_and_monotonic() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut sink = ProgressSink::new(tx);

        sink.report(0.5);
        sink.report(0.2);
        sink.report(7.0);
        sink.report(-1.0);

        let fractions: Vec<f32> = drain(&mut rx).iter().filter_map(|e| e.fraction()).collect();
        assert_eq!(fractions, vec![0.5, 0.5, 1.0, 1.0]);
    }

    #[test]
    fn nan_progress_keeps_last_fraction() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut sink = ProgressSink::new(tx);
        sink.report(0.3);
        sink.report(f32::NAN);
        let fractions: Vec<f32> = drain(&mut rx).iter().filter_map(|e| e.fraction()).collect();
        assert_eq!(fractions, vec![0.3, 0.3]);
    }

    #[test]
    fn finish_reports_one_only_once() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut sink = ProgressSink::new(tx);
        sink.report(0.4);
        sink.finish();
        sink.finish();
        let events = drain(&mut rx);
        assert_eq!(events.len(), 2);
        assert_eq!(events[1], WorkerEvent::progress(1.0));
    }

    #[test]
    fn phase_messages_are_loading_events() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut sink = ProgressSink::new(tx);
        sink.phase("Loading weights");
        sink.phase_at("Warming up model...", 0.9);
        assert_eq!(
            drain(&mut rx),
            vec![
                WorkerEvent::loading("Loading weights", None),
                WorkerEvent::loading("Warming up model...", Some(0.9)),
            ]
        );
        assert_eq!(sink.fraction(), 0.9);
    }

    #[test]
    fn first_token_has_no_throughput() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut sink = TokenSink::new(tx, CancelFlag::new());

        assert!(sink.push("Hel"));
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert!(sink.push("lo"));

        let events = drain(&mut rx);
        match &events[0] {
            WorkerEvent::Update {
                output,
                tps,
                num_tokens,
            } => {
                assert_eq!(output, "Hel");
                assert_eq!(*tps, None);
                assert_eq!(*num_tokens, Some(1));
            }
            other => panic!("unexpected event {other:?}"),
        }
        match &events[1] {
            WorkerEvent::Update {
                tps, num_tokens, ..
            } => {
                assert!(tps.is_some_and(|t| t > 0.0));
                assert_eq!(*num_tokens, Some(2));
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(sink.token_count(), 2);
    }

    #[test]
    fn cancelled_sink_refuses_tokens() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let cancel = CancelFlag::new();
        let mut sink = TokenSink::new(tx, cancel.clone());

        assert!(sink.push("a"));
        cancel.cancel();
        assert!(sink.is_cancelled());
        assert!(!sink.push("b"));
        assert_eq!(drain(&mut rx).len(), 1);
    }

    #[test]
    fn cancel_flag_clears() {
        let flag = CancelFlag::new();
        flag.cancel();
        assert!(flag.clone().is_cancelled());
        flag.clear();
        assert!(!flag.is_cancelled());
    }

    #[test]
    fn sinks_tolerate_dropped_receiver() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let mut progress = ProgressSink::new(tx.clone());
        progress.report(0.5);
        let mut tokens = TokenSink::new(tx, CancelFlag::new());
        assert!(tokens.push("x"));
    }
}
