//! Message loop of a worker context.

use crate::backend::{CancelFlag, EventSender, ModelBackend, ProgressSink, TokenSink};
use crate::error::{ModelhostError, Result};
use crate::protocol::{Action, ControlMessage, LoadOptions, ProtocolState, WorkerEvent};
use crate::task::{InferenceRequest, Task, TaskResult};
use futures_util::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::time::Instant;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// Owns the backend and processes control messages one at a time.
pub(crate) struct Worker {
    task: Task,
    backend: Box<dyn ModelBackend>,
    state: ProtocolState,
    events: EventSender,
    cancel: CancelFlag,
}

/// Outcome of handling one message.
enum Flow {
    Continue,
    Exit,
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Flatten a caught panic into the backend's error type.
fn caught<T>(result: std::thread::Result<Result<T>>, what: &str) -> Result<T> {
    match result {
        Ok(inner) => inner,
        Err(payload) => Err(ModelhostError::Other(format!(
            "backend panicked during {what}: {}",
            panic_message(payload)
        ))),
    }
}

/// Error text carried by `error` events.
fn event_text(error: &ModelhostError) -> String {
    match error {
        ModelhostError::Load { message } | ModelhostError::Inference { message } => {
            message.clone()
        }
        other => other.to_string(),
    }
}

impl Worker {
    pub(crate) fn new(
        task: Task,
        backend: Box<dyn ModelBackend>,
        events: EventSender,
        cancel: CancelFlag,
    ) -> Self {
        Self {
            task,
            backend,
            state: ProtocolState::Idle,
            events,
            cancel,
        }
    }

    /// Run the message loop on the current thread until the control channel
    /// closes, a fatal error ends the context, or `shutdown` fires.
    ///
    /// The backend is dropped before this returns.
    pub(crate) fn run_on_thread(
        self,
        control: UnboundedReceiver<ControlMessage>,
        shutdown: oneshot::Receiver<()>,
    ) {
        let runtime = match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(runtime) => runtime,
            Err(e) => {
                warn!(task = %self.task, error = %e, "failed to start worker runtime");
                self.emit(WorkerEvent::error(format!("failed to start worker runtime: {e}")));
                return;
            }
        };

        let task = self.task;
        runtime.block_on(async move {
            let mut worker = self;
            tokio::select! {
                _ = worker.run(control) => {}
                _ = shutdown => debug!(%task, "worker terminated"),
            }
        });
        runtime.shutdown_background();
        debug!(%task, "worker context exited");
    }

    fn emit(&self, event: WorkerEvent) {
        if self.events.send(event).is_err() {
            debug!(task = %self.task, "controller stopped listening");
        }
    }

    pub(crate) async fn run(&mut self, mut control: UnboundedReceiver<ControlMessage>) {
        while let Some(message) = control.recv().await {
            debug!(task = %self.task, message = message.kind(), state = ?self.state, "control message");

            let (next, action) = self.state.on_control(&message);
            self.state = next;

            let flow = match action {
                Action::BeginLoad => {
                    let options = match message {
                        ControlMessage::Load { data } => data.unwrap_or_default(),
                        _ => LoadOptions::default(),
                    };
                    self.load(options).await
                }
                Action::AcknowledgeReady => {
                    self.emit(WorkerEvent::Ready);
                    Flow::Continue
                }
                Action::BeginInference => match message.into_request() {
                    Some(request) => self.infer(request, &mut control).await,
                    None => Flow::Continue,
                },
                Action::Reject(reason) => {
                    self.emit(WorkerEvent::error(reason));
                    Flow::Continue
                }
                Action::Cancel => {
                    self.cancel.cancel();
                    Flow::Continue
                }
                Action::ClearMemory => {
                    self.backend.reset();
                    Flow::Continue
                }
                Action::Release => {
                    self.backend.unload().await;
                    info!(task = %self.task, "model unloaded");
                    Flow::Continue
                }
                Action::Ignore => Flow::Continue,
                Action::Violation(detail) => {
                    warn!(task = %self.task, "protocol violation: {detail}");
                    Flow::Continue
                }
            };

            if let Flow::Exit = flow {
                break;
            }
        }
    }

    async fn load(&mut self, options: LoadOptions) -> Flow {
        let mut progress = ProgressSink::new(self.events.clone());
        progress.phase_at("Loading model...", 0.0);

        let started = Instant::now();
        let result = AssertUnwindSafe(self.backend.load(&options, &mut progress))
            .catch_unwind()
            .await;

        match caught(result, "load") {
            Ok(()) => {
                progress.finish();
                self.transition(WorkerEvent::Ready);
                info!(
                    task = %self.task,
                    model = self.backend.name(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "model ready"
                );
                Flow::Continue
            }
            Err(e) => {
                warn!(task = %self.task, error = %e, "model load failed");
                self.transition(WorkerEvent::error(event_text(&e)));
                Flow::Exit
            }
        }
    }

    async fn infer(
        &mut self,
        request: InferenceRequest,
        control: &mut UnboundedReceiver<ControlMessage>,
    ) -> Flow {
        self.cancel.clear();
        if self.task.is_streaming() {
            self.emit(WorkerEvent::Start);
        }

        let task = self.task;
        let cancel = self.cancel.clone();
        let mut tokens = TokenSink::new(self.events.clone(), self.cancel.clone());
        let mut reset_requested = false;
        let mut control_closed = false;
        let started = Instant::now();

        let result: Result<TaskResult> = {
            let inference = AssertUnwindSafe(self.backend.infer(request, &mut tokens)).catch_unwind();
            tokio::pin!(inference);

            loop {
                tokio::select! {
                    result = &mut inference => break caught(result, "inference"),
                    message = control.recv(), if !control_closed => match message {
                        Some(ControlMessage::Interrupt) => {
                            debug!(%task, "interrupt requested");
                            cancel.cancel();
                        }
                        Some(ControlMessage::Reset) => {
                            debug!(%task, "reset requested during generation");
                            cancel.cancel();
                            reset_requested = true;
                        }
                        Some(other) => {
                            warn!(%task, "protocol violation: '{}' while Generating", other.kind());
                        }
                        // Finish the request, then exit.
                        None => control_closed = true,
                    },
                }
            }
        };

        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        let flow = match result {
            Ok(output) => {
                let time = (!self.task.is_streaming()).then_some(elapsed_ms);
                self.transition(WorkerEvent::complete(output, time));
                Flow::Continue
            }
            Err(e) => {
                warn!(task = %self.task, error = %e, "inference failed");
                self.transition(WorkerEvent::error(event_text(&e)));
                if self.backend.survives_inference_error() {
                    Flow::Continue
                } else {
                    self.state = ProtocolState::Failed;
                    Flow::Exit
                }
            }
        };

        if reset_requested {
            self.backend.reset();
        }
        if control_closed { Flow::Exit } else { flow }
    }

    /// Emit a terminal event and apply its state transition.
    fn transition(&mut self, event: WorkerEvent) {
        self.state = self.state.on_event(&event);
        self.emit(event);
    }
}
