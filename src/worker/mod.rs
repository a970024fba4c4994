//! Worker execution contexts.
//!
//! A context is a dedicated OS thread running its own single-threaded tokio
//! runtime and owning exactly one backend. It is reachable only through its
//! control and event channels.

mod runner;

use crate::backend::{CancelFlag, ModelBackend};
use crate::error::{ModelhostError, Result};
use crate::protocol::{ControlMessage, WorkerEvent};
use crate::task::Task;
use runner::Worker;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;
use tracing::debug;

/// Handle to a running worker context.
///
/// Dropping the handle terminates the context.
pub struct WorkerContext {
    task: Task,
    epoch: u64,
    control: Option<UnboundedSender<ControlMessage>>,
    events: Option<UnboundedReceiver<WorkerEvent>>,
    shutdown: Option<oneshot::Sender<()>>,
    exited: Option<oneshot::Receiver<()>>,
    cancel: CancelFlag,
    survives_errors: bool,
    thread: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for WorkerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerContext")
            .field("task", &self.task)
            .field("epoch", &self.epoch)
            .field("finished", &self.is_finished())
            .finish()
    }
}

impl WorkerContext {
    /// Start a context hosting `backend`.
    ///
    /// `epoch` identifies this context among the successive contexts of one
    /// controller.
    pub fn spawn(task: Task, backend: Box<dyn ModelBackend>, epoch: u64) -> Result<Self> {
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let (exited_tx, exited_rx) = oneshot::channel();
        let cancel = CancelFlag::new();
        let survives_errors = backend.survives_inference_error();

        let worker = Worker::new(task, backend, events_tx, cancel.clone());
        let thread = thread::Builder::new()
            .name(format!("modelhost-{}-{}", task.id(), epoch))
            .spawn(move || {
                worker.run_on_thread(control_rx, shutdown_rx);
                if exited_tx.send(()).is_err() {
                    debug!(%task, epoch, "nobody waiting for worker exit");
                }
            })
            .map_err(|e| ModelhostError::Other(format!("Failed to spawn worker thread: {e}")))?;

        debug!(%task, epoch, "worker context spawned");

        Ok(Self {
            task,
            epoch,
            control: Some(control_tx),
            events: Some(events_rx),
            shutdown: Some(shutdown_tx),
            exited: Some(exited_rx),
            cancel,
            survives_errors,
            thread: Some(thread),
        })
    }

    pub fn task(&self) -> Task {
        self.task
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Whether the context keeps running after an inference error.
    ///
    /// When `false`, an `error` event for a request is the context's last
    /// event.
    pub fn survives_inference_error(&self) -> bool {
        self.survives_errors
    }

    /// Post a control message.
    ///
    /// # Errors
    /// `ContextClosed` if the context has already exited.
    pub fn send(&self, message: ControlMessage) -> Result<()> {
        self.post(message).map_err(|_| ModelhostError::ContextClosed)
    }

    /// Post a control message, handing it back if the context has exited.
    pub fn post(&self, message: ControlMessage) -> std::result::Result<(), ControlMessage> {
        debug!(task = %self.task, epoch = self.epoch, message = message.kind(), "dispatch");
        match &self.control {
            Some(control) => control.send(message).map_err(|e| e.0),
            None => Err(message),
        }
    }

    /// Stop accepting control messages.
    ///
    /// The worker finishes the messages already queued (including a running
    /// request) and then exits, closing the event channel.
    pub fn close(&mut self) {
        self.control.take();
    }

    /// Take the event receiver. Returns `None` after the first call.
    pub fn take_events(&mut self) -> Option<UnboundedReceiver<WorkerEvent>> {
        self.events.take()
    }

    /// Whether the context thread has exited.
    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Tear the context down.
    ///
    /// Raises the cancel flag and signals shutdown; the worker drops its
    /// backend and any in-flight inference without emitting further events.
    /// The thread is detached; await the returned [`WorkerExit`] to observe
    /// it releasing the backend.
    pub fn terminate(mut self) -> WorkerExit {
        self.signal_shutdown();
        WorkerExit {
            exited: self.exited.take(),
        }
    }

    fn signal_shutdown(&mut self) {
        self.cancel.cancel();
        if let Some(shutdown) = self.shutdown.take()
            && shutdown.send(()).is_err()
        {
            debug!(task = %self.task, epoch = self.epoch, "worker already exited");
        }
        // Detach: the thread exits on its own once the worker loop is dropped.
        self.thread.take();
    }
}

impl Drop for WorkerContext {
    fn drop(&mut self) {
        self.signal_shutdown();
    }
}

/// Completion signal of a terminated worker context.
#[derive(Debug)]
pub struct WorkerExit {
    exited: Option<oneshot::Receiver<()>>,
}

impl WorkerExit {
    /// Wait up to `timeout` for the worker thread to release its backend.
    ///
    /// Returns `true` if it did.
    pub async fn wait(self, timeout: Duration) -> bool {
        match self.exited {
            Some(exited) => tokio::time::timeout(timeout, exited).await.is_ok(),
            None => true,
        }
    }
}
