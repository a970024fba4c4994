//! Per-task lifecycle controller.
//!
//! A controller owns at most one worker context at a time. It creates the
//! context on load, destroys it on unload or failure, and turns the
//! context's events into load-state transitions and observer callbacks.
//! Every context carries an epoch; events from a context that has been torn
//! down are dropped by the event pump and never touch controller state.

pub mod bus;
pub mod observer;

pub use bus::{BusMessage, EventBus, Waiter};
pub use observer::{LifecycleObserver, LogObserver};

use crate::backend::ModelBackend;
use crate::defaults;
use crate::error::{ModelhostError, Result};
use crate::protocol::{ControlMessage, LoadOptions, StatusKind, WorkerEvent};
use crate::task::{InferenceRequest, ModelLoadState, Task, TaskResult};
use crate::worker::{WorkerContext, WorkerExit};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Creates a fresh backend for each new worker context.
pub type BackendFactory = Arc<dyn Fn() -> Box<dyn ModelBackend> + Send + Sync>;

const CONTEXT_EXITED: &str = "worker context exited";

/// State shared between the controller and its event pump.
#[derive(Debug, Default)]
struct Shared {
    state: ModelLoadState,
    /// Epoch of the live context, 0 when there is none.
    epoch: u64,
    in_flight: bool,
    partial: String,
    /// The live context exits after a request error.
    fatal_errors: bool,
    /// Error of the last failed request, kept as the failure reason if the
    /// context exits right after it.
    last_error: Option<String>,
}

/// Observer call computed under the lock and delivered after it.
enum Notice {
    State(ModelLoadState),
    Progress(f32, String),
    Update(String, Option<f64>),
    Complete(TaskResult),
    Error(String),
}

fn lock(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

fn deliver(observer: &dyn LifecycleObserver, task: Task, notices: Vec<Notice>) {
    for notice in notices {
        match notice {
            Notice::State(state) => observer.on_state_change(task, &state),
            Notice::Progress(fraction, message) => observer.on_progress(task, fraction, &message),
            Notice::Update(output, tps) => observer.on_update(task, &output, tps),
            Notice::Complete(result) => observer.on_complete(task, &result),
            Notice::Error(error) => observer.on_error(task, &error),
        }
    }
}

impl Shared {
    fn set_state(&mut self, state: ModelLoadState, notices: &mut Vec<Notice>) {
        let changed = self.state.differs_in_kind(&state);
        self.state = state;
        if changed {
            notices.push(Notice::State(self.state.clone()));
        }
    }

    /// Apply an event from the context with `epoch`.
    ///
    /// Returns `None` when the event comes from a stale context.
    fn apply(&mut self, task: Task, epoch: u64, event: &WorkerEvent) -> Option<Vec<Notice>> {
        if self.epoch != epoch {
            debug!(%task, epoch, live = self.epoch, "dropping event from stale context");
            return None;
        }

        let mut notices = Vec::new();
        match event {
            WorkerEvent::Loading { data, progress } => match &mut self.state {
                ModelLoadState::Loading {
                    progress: current,
                    message,
                } => {
                    if let Some(fraction) = progress {
                        *current = current.max(fraction.clamp(0.0, 1.0));
                    }
                    *message = data.clone();
                    notices.push(Notice::Progress(*current, data.clone()));
                }
                other => warn!(%task, state = ?other, "protocol violation: loading event outside a load"),
            },
            WorkerEvent::Progress { data } => match &mut self.state {
                ModelLoadState::Loading {
                    progress: current,
                    message,
                } => {
                    *current = current.max(data.progress.clamp(0.0, 1.0));
                    notices.push(Notice::Progress(*current, message.clone()));
                }
                other => warn!(%task, state = ?other, "protocol violation: progress outside a load"),
            },
            WorkerEvent::Ready => {
                self.last_error = None;
                if self.state.is_loading() {
                    self.set_state(ModelLoadState::Ready, &mut notices);
                } else if !self.state.is_ready() {
                    warn!(%task, state = ?self.state, "protocol violation: ready outside a load");
                }
            }
            WorkerEvent::Start => {
                if self.in_flight {
                    self.partial.clear();
                    self.last_error = None;
                } else {
                    warn!(%task, "protocol violation: start without a request");
                }
            }
            WorkerEvent::Update { output, tps, .. } => {
                if self.in_flight {
                    self.partial.push_str(output);
                    notices.push(Notice::Update(output.clone(), *tps));
                } else {
                    warn!(%task, "protocol violation: update without a request");
                }
            }
            WorkerEvent::Complete { result, .. } => {
                if self.in_flight {
                    self.in_flight = false;
                    self.partial.clear();
                    notices.push(Notice::Complete(result.clone()));
                } else {
                    warn!(%task, "protocol violation: complete without a request");
                }
            }
            WorkerEvent::Error { error } => {
                if self.state.is_loading() {
                    self.set_state(
                        ModelLoadState::Failed {
                            reason: error.clone(),
                        },
                        &mut notices,
                    );
                    notices.push(Notice::Error(error.clone()));
                } else if self.in_flight {
                    // Partial output stays readable until the next request.
                    self.in_flight = false;
                    self.last_error = Some(error.clone());
                    notices.push(Notice::Error(error.clone()));
                    if self.fatal_errors {
                        // The context exits after this event; let go of it
                        // before anyone can dispatch into it.
                        self.epoch = 0;
                        self.set_state(
                            ModelLoadState::Failed {
                                reason: error.clone(),
                            },
                            &mut notices,
                        );
                    }
                } else {
                    warn!(%task, error, "protocol violation: error without a pending operation");
                }
            }
        }
        Some(notices)
    }

    /// The live context exited on its own.
    fn context_exited(&mut self) -> Vec<Notice> {
        self.epoch = 0;
        let mut notices = Vec::new();
        if self.in_flight {
            self.in_flight = false;
            notices.push(Notice::Error(CONTEXT_EXITED.to_string()));
        }
        let reason = self
            .last_error
            .take()
            .unwrap_or_else(|| CONTEXT_EXITED.to_string());
        if matches!(
            self.state,
            ModelLoadState::Loading { .. } | ModelLoadState::Ready
        ) {
            self.set_state(ModelLoadState::Failed { reason }, &mut notices);
        }
        notices
    }
}

fn completion(event: WorkerEvent) -> Result<TaskResult> {
    match event {
        WorkerEvent::Complete { result, .. } => Ok(result),
        other => Err(ModelhostError::ProtocolViolation {
            message: format!("expected complete, got {:?}", other.kind()),
        }),
    }
}

/// Forwards one context's events into controller state, observers and the bus.
async fn pump(
    task: Task,
    epoch: u64,
    mut events: UnboundedReceiver<WorkerEvent>,
    shared: Arc<Mutex<Shared>>,
    bus: EventBus,
    observer: Arc<dyn LifecycleObserver>,
) {
    while let Some(event) = events.recv().await {
        let notices = lock(&shared).apply(task, epoch, &event);
        let Some(notices) = notices else {
            continue;
        };
        deliver(observer.as_ref(), task, notices);
        bus.publish(BusMessage::Event { epoch, event });
    }

    let notices = {
        let mut shared = lock(&shared);
        (shared.epoch == epoch).then(|| shared.context_exited())
    };
    if let Some(notices) = notices {
        debug!(%task, epoch, "worker context exited on its own");
        deliver(observer.as_ref(), task, notices);
        bus.publish(BusMessage::Closed { epoch });
    }
}

struct LiveContext {
    worker: WorkerContext,
    pump: JoinHandle<()>,
}

/// Orchestrates one task's model: loading, requests and teardown.
///
/// Methods that create a worker context must be called from within a tokio
/// runtime.
pub struct LifecycleController {
    task: Task,
    factory: BackendFactory,
    load_options: LoadOptions,
    shared: Arc<Mutex<Shared>>,
    bus: EventBus,
    observer: Arc<dyn LifecycleObserver>,
    context: Option<LiveContext>,
    next_epoch: u64,
    join_timeout: Duration,
}

impl std::fmt::Debug for LifecycleController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleController")
            .field("task", &self.task)
            .field("state", &self.state())
            .field("busy", &self.is_busy())
            .field("epoch", &self.next_epoch)
            .finish()
    }
}

impl LifecycleController {
    pub fn new(task: Task, factory: BackendFactory) -> Self {
        Self {
            task,
            factory,
            load_options: LoadOptions::default(),
            shared: Arc::new(Mutex::new(Shared::default())),
            bus: EventBus::new(defaults::EVENT_BUS_CAPACITY),
            observer: Arc::new(LogObserver),
            context: None,
            next_epoch: 0,
            join_timeout: Duration::from_millis(defaults::WORKER_JOIN_TIMEOUT_MS),
        }
    }

    /// Options sent with every `load`.
    pub fn with_load_options(mut self, options: LoadOptions) -> Self {
        self.load_options = options;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn LifecycleObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// How long `shutdown` waits for the worker thread.
    pub fn with_join_timeout(mut self, timeout: Duration) -> Self {
        self.join_timeout = timeout;
        self
    }

    pub fn task(&self) -> Task {
        self.task
    }

    pub fn state(&self) -> ModelLoadState {
        lock(&self.shared).state.clone()
    }

    /// Whether a request is in flight.
    pub fn is_busy(&self) -> bool {
        lock(&self.shared).in_flight
    }

    /// Output streamed so far for the current (or last failed) request.
    pub fn partial_output(&self) -> String {
        lock(&self.shared).partial.clone()
    }

    /// Receive every bus message from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<BusMessage> {
        self.bus.subscribe()
    }

    /// Register interest in the next event of `kind`.
    pub fn waiter(&self, kind: StatusKind) -> Waiter {
        self.bus.waiter(kind)
    }

    /// Wait for the next event of `kind` from any context.
    pub async fn wait_for(&self, kind: StatusKind) -> Result<WorkerEvent> {
        self.bus.waiter(kind).wait().await
    }

    /// Load the model if it is unloaded or failed; unload it if it is
    /// loading or ready.
    ///
    /// Returns as soon as the `load` is dispatched; progress arrives through
    /// the observer.
    pub fn toggle_model(&mut self) -> Result<()> {
        match self.state() {
            ModelLoadState::Ready | ModelLoadState::Loading { .. } => {
                self.unload();
                Ok(())
            }
            ModelLoadState::Unloaded | ModelLoadState::Failed { .. } => {
                self.begin_load()?;
                Ok(())
            }
        }
    }

    /// Validate and dispatch `request`, loading the model first if needed.
    ///
    /// Returns once the request is dispatched; output arrives through the
    /// observer and the bus.
    ///
    /// # Errors
    /// `Validation` for empty payloads, `Busy` when a request is already in
    /// flight, `Load` when the automatic load fails.
    pub async fn submit(&mut self, request: InferenceRequest) -> Result<()> {
        self.launch(request).await?;
        Ok(())
    }

    /// Submit `request` and wait for its result.
    pub async fn run(&mut self, request: InferenceRequest) -> Result<TaskResult> {
        let waiter = self.launch(request).await?;
        completion(waiter.wait().await?)
    }

    /// Like [`run`](Self::run), but interrupts the request once `stop`
    /// resolves.
    ///
    /// An interrupted request still completes, carrying the output produced
    /// up to that point.
    pub async fn run_until<F>(&mut self, request: InferenceRequest, stop: F) -> Result<TaskResult>
    where
        F: Future<Output = ()>,
    {
        let waiter = self.launch(request).await?;
        let done = waiter.wait();
        tokio::pin!(done);

        tokio::select! {
            event = &mut done => return completion(event?),
            () = stop => {
                if self.interrupt() {
                    debug!(task = %self.task, "request interrupted");
                }
            }
        }
        completion(done.await?)
    }

    /// Ask the running request to stop. Returns `false` when nothing runs.
    pub fn interrupt(&self) -> bool {
        if !self.is_busy() {
            return false;
        }
        match self.dispatch(ControlMessage::Interrupt) {
            Ok(()) => true,
            Err(e) => {
                warn!(task = %self.task, error = %e, "interrupt not delivered");
                false
            }
        }
    }

    /// Clear backend memory; a failed model returns to unloaded.
    pub fn reset(&mut self) -> Result<()> {
        match self.state() {
            ModelLoadState::Failed { .. } => {
                self.teardown();
                self.set_state(ModelLoadState::Unloaded);
                Ok(())
            }
            ModelLoadState::Ready | ModelLoadState::Loading { .. } => {
                self.dispatch(ControlMessage::Reset)
            }
            ModelLoadState::Unloaded => Ok(()),
        }
    }

    /// Terminate the worker context and wait for it to release the backend.
    pub async fn shutdown(&mut self) {
        if let Some(exit) = self.teardown()
            && !exit.wait(self.join_timeout).await
        {
            warn!(task = %self.task, "worker did not exit in time; detached");
        }
        self.set_state(ModelLoadState::Unloaded);
    }

    async fn prepare(&mut self, request: &InferenceRequest) -> Result<()> {
        if request.task() != self.task {
            return Err(ModelhostError::validation(format!(
                "{} request sent to the {} controller",
                request.task(),
                self.task
            )));
        }
        request.validate()?;
        if self.is_busy() {
            return Err(ModelhostError::Busy {
                task: self.task.to_string(),
            });
        }

        let (state, epoch) = {
            let shared = lock(&self.shared);
            (shared.state.clone(), shared.epoch)
        };
        // Subscribe before re-reading the state so the terminal event of a
        // load already in progress cannot be missed.
        let pending = self.bus.waiter_for(epoch, StatusKind::Ready);
        let waiter = match (state, self.state()) {
            (_, ModelLoadState::Ready) => return Ok(()),
            (ModelLoadState::Loading { .. }, ModelLoadState::Loading { .. }) => pending,
            _ => self.begin_load()?,
        };

        match waiter.wait().await {
            Ok(_) => Ok(()),
            Err(e) => {
                warn!(task = %self.task, error = %e, "automatic load failed; request dropped");
                self.teardown();
                self.set_state(ModelLoadState::Unloaded);
                Err(match e {
                    ModelhostError::Load { .. } => e,
                    other => ModelhostError::load(other.to_string()),
                })
            }
        }
    }

    /// Prepare and dispatch `request`. A context that exited before taking
    /// the request is replaced once.
    async fn launch(&mut self, request: InferenceRequest) -> Result<Waiter> {
        self.prepare(&request).await?;
        let message = match self.start(request) {
            Ok(waiter) => return Ok(waiter),
            Err(message) => message,
        };

        warn!(task = %self.task, "worker context gone before the request; starting a fresh one");
        self.teardown();
        self.set_state(ModelLoadState::Unloaded);
        let request = message.into_request().ok_or(ModelhostError::ContextClosed)?;
        self.prepare(&request).await?;
        self.start(request).map_err(|_| ModelhostError::ContextClosed)
    }

    /// Mark the request in flight and post it; hands the message back if the
    /// context has exited.
    fn start(&mut self, request: InferenceRequest) -> std::result::Result<Waiter, ControlMessage> {
        let epoch = {
            let mut shared = lock(&self.shared);
            shared.in_flight = true;
            shared.partial.clear();
            shared.epoch
        };
        let waiter = self.bus.waiter_for(epoch, StatusKind::Complete);

        let message = ControlMessage::from(request);
        let posted = match &self.context {
            Some(live) => live.worker.post(message),
            None => Err(message),
        };
        if let Err(message) = posted {
            lock(&self.shared).in_flight = false;
            return Err(message);
        }
        Ok(waiter)
    }

    fn begin_load(&mut self) -> Result<Waiter> {
        let epoch = self.spawn_context()?;
        self.set_state(ModelLoadState::Loading {
            progress: 0.0,
            message: "Loading model...".to_string(),
        });

        let waiter = self.bus.waiter_for(epoch, StatusKind::Ready);
        if let Err(e) = self.dispatch(ControlMessage::load(self.load_options.clone())) {
            self.teardown();
            self.set_state(ModelLoadState::Failed {
                reason: e.to_string(),
            });
            return Err(e);
        }
        info!(task = %self.task, epoch, "loading model");
        Ok(waiter)
    }

    fn unload(&mut self) {
        self.teardown();
        self.set_state(ModelLoadState::Unloaded);
        info!(task = %self.task, "model unloaded");
    }

    fn dispatch(&self, message: ControlMessage) -> Result<()> {
        match &self.context {
            Some(live) => live.worker.send(message),
            None => Err(ModelhostError::ContextClosed),
        }
    }

    fn set_state(&self, state: ModelLoadState) {
        let mut notices = Vec::new();
        lock(&self.shared).set_state(state, &mut notices);
        deliver(self.observer.as_ref(), self.task, notices);
    }

    /// Replace any existing context with a fresh one; returns its epoch.
    fn spawn_context(&mut self) -> Result<u64> {
        self.teardown();

        self.next_epoch += 1;
        let epoch = self.next_epoch;
        let mut worker = WorkerContext::spawn(self.task, (self.factory)(), epoch)?;
        let events = worker.take_events().ok_or(ModelhostError::ContextClosed)?;
        {
            let mut shared = lock(&self.shared);
            shared.epoch = epoch;
            shared.fatal_errors = !worker.survives_inference_error();
            shared.last_error = None;
        }

        let pump = tokio::spawn(pump(
            self.task,
            epoch,
            events,
            Arc::clone(&self.shared),
            self.bus.clone(),
            Arc::clone(&self.observer),
        ));
        self.context = Some(LiveContext { worker, pump });
        Ok(epoch)
    }

    /// Destroy the current context. Its later events are ignored and any
    /// in-flight request is abandoned.
    fn teardown(&mut self) -> Option<WorkerExit> {
        let live = self.context.take()?;
        live.pump.abort();
        let epoch = live.worker.epoch();
        let exit = live.worker.terminate();

        let was_live = {
            let mut shared = lock(&self.shared);
            if shared.epoch == epoch {
                shared.epoch = 0;
                shared.in_flight = false;
                true
            } else {
                false
            }
        };
        if was_live {
            self.bus.publish(BusMessage::Closed { epoch });
        }
        debug!(task = %self.task, epoch, "worker context torn down");
        Some(exit)
    }
}

impl Drop for LifecycleController {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{CallLog, ScriptedBackend};
    use crate::task::ChatMessage;

    const WAIT: Duration = Duration::from_secs(5);

    fn factory(template: ScriptedBackend) -> BackendFactory {
        Arc::new(move || Box::new(template.clone()) as Box<dyn ModelBackend>)
    }

    fn chat(text: &str) -> InferenceRequest {
        InferenceRequest::Chat {
            messages: vec![ChatMessage::user(text)],
        }
    }

    #[derive(Default)]
    struct StateLog(Mutex<Vec<ModelLoadState>>);

    impl LifecycleObserver for StateLog {
        fn on_state_change(&self, _task: Task, state: &ModelLoadState) {
            self.0.lock().unwrap().push(state.clone());
        }
    }

    #[tokio::test]
    async fn test_toggle_loads_then_unloads() {
        let calls = CallLog::new();
        let log = Arc::new(StateLog::default());
        let mut controller = LifecycleController::new(
            Task::Transcription,
            factory(ScriptedBackend::new(Task::Transcription).with_call_log(calls.clone())),
        )
        .with_observer(log.clone());

        let ready = controller.waiter(StatusKind::Ready);
        controller.toggle_model().unwrap();
        assert!(controller.state().is_loading());
        tokio::time::timeout(WAIT, ready.wait()).await.unwrap().unwrap();
        assert_eq!(controller.state(), ModelLoadState::Ready);

        controller.toggle_model().unwrap();
        assert_eq!(controller.state(), ModelLoadState::Unloaded);

        let states = log.0.lock().unwrap().clone();
        assert!(matches!(states[0], ModelLoadState::Loading { .. }));
        assert_eq!(states[1..], [ModelLoadState::Ready, ModelLoadState::Unloaded]);
        assert_eq!(calls.count("load"), 1);
    }

    #[tokio::test]
    async fn test_validation_error_never_spawns_context() {
        let log = CallLog::new();
        let mut controller = LifecycleController::new(
            Task::SpeechSynthesis,
            factory(ScriptedBackend::new(Task::SpeechSynthesis).with_call_log(log.clone())),
        );

        let result = controller
            .submit(InferenceRequest::Synthesize {
                text: String::new(),
                voice: "af".to_string(),
            })
            .await;

        assert!(matches!(result, Err(ModelhostError::Validation { .. })));
        assert_eq!(controller.state(), ModelLoadState::Unloaded);
        assert!(log.calls().is_empty());
    }

    #[tokio::test]
    async fn test_request_for_other_task_is_rejected() {
        let mut controller =
            LifecycleController::new(Task::Chat, factory(ScriptedBackend::new(Task::Chat)));
        let result = controller
            .submit(InferenceRequest::Transcribe { audio: vec![0.0] })
            .await;
        assert!(matches!(result, Err(ModelhostError::Validation { .. })));
    }

    #[tokio::test]
    async fn test_run_auto_loads_once() {
        let log = CallLog::new();
        let mut controller = LifecycleController::new(
            Task::Chat,
            factory(
                ScriptedBackend::new(Task::Chat)
                    .with_tokens(&["Hi", "!"])
                    .with_call_log(log.clone()),
            ),
        );

        let result = tokio::time::timeout(WAIT, controller.run(chat("hello")))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(result, TaskResult::Reply("Hi!".to_string()));
        assert_eq!(log.calls(), vec!["load", "infer"]);
        assert!(!controller.is_busy());
        assert_eq!(controller.partial_output(), "");
    }

    #[tokio::test]
    async fn test_second_submit_while_busy_is_rejected() {
        let mut controller = LifecycleController::new(
            Task::Chat,
            factory(
                ScriptedBackend::new(Task::Chat)
                    .with_tokens(&["x"; 100])
                    .with_token_delay(Duration::from_millis(10)),
            ),
        );

        controller.submit(chat("first")).await.unwrap();
        assert!(controller.is_busy());
        let second = controller.submit(chat("second")).await;
        assert!(matches!(second, Err(ModelhostError::Busy { .. })));
        assert!(controller.interrupt());
    }

    #[tokio::test]
    async fn test_failed_auto_load_restores_unloaded() {
        let calls = CallLog::new();
        let log = Arc::new(StateLog::default());
        let mut controller = LifecycleController::new(
            Task::Transcription,
            factory(
                ScriptedBackend::new(Task::Transcription)
                    .with_load_failure("weights missing")
                    .with_call_log(calls.clone()),
            ),
        )
        .with_observer(log.clone());

        let result = controller
            .submit(InferenceRequest::Transcribe { audio: vec![0.0; 8] })
            .await;

        match result {
            Err(ModelhostError::Load { message }) => assert_eq!(message, "weights missing"),
            other => panic!("expected load error, got {other:?}"),
        }
        assert_eq!(controller.state(), ModelLoadState::Unloaded);
        assert!(!controller.is_busy());
        assert_eq!(calls.count("infer"), 0);
        assert_eq!(
            log.0.lock().unwrap().last(),
            Some(&ModelLoadState::Unloaded)
        );
    }

    #[tokio::test]
    async fn test_failed_toggle_then_retry_uses_fresh_context() {
        let log = CallLog::new();
        let mut controller = LifecycleController::new(
            Task::Chat,
            factory(
                ScriptedBackend::new(Task::Chat)
                    .with_load_failure("no gpu")
                    .with_call_log(log.clone()),
            ),
        );

        let failed = controller.waiter(StatusKind::Ready);
        controller.toggle_model().unwrap();
        assert!(failed.wait().await.is_err());
        assert!(matches!(controller.state(), ModelLoadState::Failed { .. }));

        let failed_again = controller.waiter(StatusKind::Ready);
        controller.toggle_model().unwrap();
        assert!(failed_again.wait().await.is_err());
        assert_eq!(log.count("load"), 2);

        controller.reset().unwrap();
        assert_eq!(controller.state(), ModelLoadState::Unloaded);
    }

    #[tokio::test]
    async fn test_reset_when_ready_keeps_model() {
        let log = CallLog::new();
        let mut controller = LifecycleController::new(
            Task::Chat,
            factory(ScriptedBackend::new(Task::Chat).with_call_log(log.clone())),
        );
        controller.run(chat("remember me")).await.unwrap();

        controller.reset().unwrap();
        controller.run(chat("again")).await.unwrap();

        assert_eq!(controller.state(), ModelLoadState::Ready);
        assert_eq!(log.calls(), vec!["load", "infer", "reset", "infer"]);
    }

    #[tokio::test]
    async fn test_interrupt_without_request_is_noop() {
        let controller =
            LifecycleController::new(Task::Chat, factory(ScriptedBackend::new(Task::Chat)));
        assert!(!controller.interrupt());
    }

    fn ready_with_request(fatal_errors: bool) -> Shared {
        Shared {
            state: ModelLoadState::Ready,
            epoch: 4,
            in_flight: true,
            fatal_errors,
            ..Shared::default()
        }
    }

    #[test]
    fn test_context_exit_keeps_last_error_as_reason() {
        let mut shared = ready_with_request(false);
        shared.apply(Task::Chat, 4, &WorkerEvent::error("device lost"));
        assert_eq!(shared.state, ModelLoadState::Ready);

        shared.context_exited();
        assert_eq!(
            shared.state,
            ModelLoadState::Failed {
                reason: "device lost".to_string()
            }
        );
    }

    #[test]
    fn test_context_exit_without_error_uses_generic_reason() {
        let mut shared = ready_with_request(false);
        let notices = shared.context_exited();
        assert_eq!(notices.len(), 2);
        assert_eq!(
            shared.state,
            ModelLoadState::Failed {
                reason: CONTEXT_EXITED.to_string()
            }
        );
    }

    #[test]
    fn test_fatal_request_error_detaches_context_at_once() {
        let mut shared = ready_with_request(true);
        shared.apply(Task::Transcription, 4, &WorkerEvent::error("decoder crashed"));

        assert_eq!(shared.epoch, 0);
        assert!(!shared.in_flight);
        assert_eq!(
            shared.state,
            ModelLoadState::Failed {
                reason: "decoder crashed".to_string()
            }
        );
        // Whatever the dying context still sends is ignored.
        assert!(shared.apply(Task::Transcription, 4, &WorkerEvent::Ready).is_none());
    }

    #[tokio::test]
    async fn test_run_until_interrupts_when_stop_fires() {
        let log = CallLog::new();
        let mut controller = LifecycleController::new(
            Task::Chat,
            factory(
                ScriptedBackend::new(Task::Chat)
                    .with_tokens(&["w "; 400])
                    .with_token_delay(Duration::from_millis(5))
                    .with_call_log(log.clone()),
            ),
        );

        let stop = tokio::time::sleep(Duration::from_millis(100));
        let result = tokio::time::timeout(WAIT, controller.run_until(chat("ramble"), stop))
            .await
            .unwrap()
            .unwrap();

        match result {
            TaskResult::Reply(text) => assert!(text.len() < 400 * 2, "{text}"),
            other => panic!("expected reply, got {other:?}"),
        }
        assert!(log.saw_cancel());
        assert!(!controller.is_busy());
    }

    #[tokio::test]
    async fn test_shutdown_releases_backend() {
        let log = CallLog::new();
        let template = ScriptedBackend::new(Task::Transcription).with_call_log(log.clone());
        let mut controller = LifecycleController::new(Task::Transcription, factory(template));
        controller
            .run(InferenceRequest::Transcribe { audio: vec![0.0] })
            .await
            .unwrap();

        controller.shutdown().await;

        assert_eq!(controller.state(), ModelLoadState::Unloaded);
        // The factory's template is still alive; the context's instance is gone.
        assert_eq!(log.drops(), 1);
    }
}
