//! Status-keyed broadcast of worker events.
//!
//! Replaces "chain a handler until the worker says ready" with an explicit
//! wait on a status kind.

use crate::error::{ModelhostError, Result};
use crate::protocol::{StatusKind, WorkerEvent};
use tokio::sync::broadcast;
use tracing::warn;

/// Message carried on the bus.
#[derive(Debug, Clone, PartialEq)]
pub enum BusMessage {
    /// Event from the live context with the given epoch.
    Event { epoch: u64, event: WorkerEvent },
    /// The context with the given epoch was torn down or exited.
    Closed { epoch: u64 },
}

#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<BusMessage>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn publish(&self, message: BusMessage) {
        // No subscribers is fine: nobody is waiting.
        self.tx.send(message).ok();
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BusMessage> {
        self.tx.subscribe()
    }

    /// Subscribe now and wait later for the next event of `kind`.
    ///
    /// Create the waiter before dispatching the message whose answer it
    /// waits for, so the answer cannot be missed.
    pub fn waiter(&self, kind: StatusKind) -> Waiter {
        Waiter {
            rx: self.tx.subscribe(),
            kind,
            epoch: None,
        }
    }

    /// Like [`EventBus::waiter`], but ignoring messages from other contexts.
    pub fn waiter_for(&self, epoch: u64, kind: StatusKind) -> Waiter {
        Waiter {
            rx: self.tx.subscribe(),
            kind,
            epoch: Some(epoch),
        }
    }
}

/// Pending wait for one status kind.
#[derive(Debug)]
pub struct Waiter {
    rx: broadcast::Receiver<BusMessage>,
    kind: StatusKind,
    epoch: Option<u64>,
}

impl Waiter {
    /// Resolve with the next event of the awaited kind.
    ///
    /// # Errors
    /// An `error` event resolves the wait with `Load` (when waiting for
    /// `ready`) or `Inference`; a closed context resolves it with
    /// `ContextClosed`.
    pub async fn wait(mut self) -> Result<WorkerEvent> {
        loop {
            match self.rx.recv().await {
                Ok(BusMessage::Event { epoch, .. } | BusMessage::Closed { epoch })
                    if self.epoch.is_some_and(|e| e != epoch) =>
                {
                    continue;
                }
                Ok(BusMessage::Event { event, .. }) if event.kind() == self.kind => {
                    return Ok(event);
                }
                Ok(BusMessage::Event {
                    event: WorkerEvent::Error { error },
                    ..
                }) => {
                    return Err(if self.kind == StatusKind::Ready {
                        ModelhostError::load(error)
                    } else {
                        ModelhostError::inference(error)
                    });
                }
                Ok(BusMessage::Event { .. }) => continue,
                Ok(BusMessage::Closed { .. }) | Err(broadcast::error::RecvError::Closed) => {
                    return Err(ModelhostError::ContextClosed);
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, kind = ?self.kind, "event waiter lagged behind");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskResult;

    fn event(event: WorkerEvent) -> BusMessage {
        BusMessage::Event { epoch: 1, event }
    }

    #[tokio::test]
    async fn test_waiter_skips_other_kinds() {
        let bus = EventBus::new(16);
        let waiter = bus.waiter(StatusKind::Ready);

        bus.publish(event(WorkerEvent::progress(0.5)));
        bus.publish(event(WorkerEvent::loading("Loading weights", None)));
        bus.publish(event(WorkerEvent::Ready));

        assert_eq!(waiter.wait().await.unwrap(), WorkerEvent::Ready);
    }

    #[tokio::test]
    async fn test_error_resolves_ready_wait_as_load_error() {
        let bus = EventBus::new(16);
        let waiter = bus.waiter(StatusKind::Ready);
        bus.publish(event(WorkerEvent::error("out of memory")));

        match waiter.wait().await {
            Err(ModelhostError::Load { message }) => assert_eq!(message, "out of memory"),
            other => panic!("expected load error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_error_resolves_complete_wait_as_inference_error() {
        let bus = EventBus::new(16);
        let waiter = bus.waiter(StatusKind::Complete);
        bus.publish(event(WorkerEvent::error("bad input")));
        assert!(matches!(
            waiter.wait().await,
            Err(ModelhostError::Inference { .. })
        ));
    }

    #[tokio::test]
    async fn test_closed_context_resolves_wait() {
        let bus = EventBus::new(16);
        let waiter = bus.waiter(StatusKind::Complete);
        bus.publish(BusMessage::Closed { epoch: 1 });
        assert!(matches!(
            waiter.wait().await,
            Err(ModelhostError::ContextClosed)
        ));
    }

    #[tokio::test]
    async fn test_events_before_subscription_are_not_seen() {
        let bus = EventBus::new(16);
        bus.publish(event(WorkerEvent::complete(
            TaskResult::Reply("old".into()),
            None,
        )));
        let waiter = bus.waiter(StatusKind::Complete);
        bus.publish(event(WorkerEvent::complete(
            TaskResult::Reply("new".into()),
            None,
        )));
        assert_eq!(
            waiter.wait().await.unwrap(),
            WorkerEvent::complete(TaskResult::Reply("new".into()), None)
        );
    }

    #[tokio::test]
    async fn test_epoch_waiter_ignores_other_contexts() {
        let bus = EventBus::new(16);
        let waiter = bus.waiter_for(2, StatusKind::Ready);
        bus.publish(event(WorkerEvent::error("stale failure")));
        bus.publish(BusMessage::Closed { epoch: 1 });
        bus.publish(BusMessage::Event {
            epoch: 2,
            event: WorkerEvent::Ready,
        });
        assert_eq!(waiter.wait().await.unwrap(), WorkerEvent::Ready);
    }

    #[tokio::test]
    async fn test_lagged_waiter_keeps_waiting() {
        let bus = EventBus::new(2);
        let waiter = bus.waiter(StatusKind::Ready);
        for i in 0..10 {
            bus.publish(event(WorkerEvent::progress(i as f32 / 10.0)));
        }
        bus.publish(event(WorkerEvent::Ready));
        assert_eq!(waiter.wait().await.unwrap(), WorkerEvent::Ready);
    }
}
