//! Worker-side protocol state machine.
//!
//! `Idle -> Loading -> Ready <-> Generating`, with `Failed` reachable from
//! `Loading` and `Generating`. The functions here only decide; the worker
//! context performs the resulting [`Action`].

use super::messages::{ControlMessage, WorkerEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProtocolState {
    #[default]
    Idle,
    Loading,
    Ready,
    Generating,
    Failed,
}

/// What the worker must do in response to a control message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Call the backend's `load`
    BeginLoad,
    /// Already loaded: answer with `ready` right away
    AcknowledgeReady,
    /// Call the backend's `infer`
    BeginInference,
    /// Answer with an `error` event without touching the backend
    Reject(String),
    /// Raise the cancel flag of the running inference
    Cancel,
    /// Clear backend memory
    ClearMemory,
    /// Release the loaded model
    Release,
    /// Nothing to do
    Ignore,
    /// Message not valid in this state; log and ignore
    Violation(String),
}

impl ProtocolState {
    /// Decide the next state and action for an incoming control message.
    pub fn on_control(self, message: &ControlMessage) -> (ProtocolState, Action) {
        use ProtocolState::*;

        match (self, message) {
            (Idle | Failed, ControlMessage::Load { .. }) => (Loading, Action::BeginLoad),
            (Ready, ControlMessage::Load { .. }) => (Ready, Action::AcknowledgeReady),
            (Loading | Generating, ControlMessage::Load { .. }) => {
                (self, self.violation(message))
            }

            (Ready, ControlMessage::Generate { .. } | ControlMessage::Run { .. }) => {
                (Generating, Action::BeginInference)
            }
            (Idle | Failed | Loading, ControlMessage::Generate { .. } | ControlMessage::Run { .. }) => (
                self,
                Action::Reject("Model not loaded".to_string()),
            ),
            (Generating, ControlMessage::Generate { .. } | ControlMessage::Run { .. }) => {
                (self, self.violation(message))
            }

            (Generating, ControlMessage::Interrupt) => (Generating, Action::Cancel),
            (_, ControlMessage::Interrupt) => (self, Action::Ignore),

            (Generating, ControlMessage::Reset) => (Generating, Action::Cancel),
            (Failed, ControlMessage::Reset) => (Idle, Action::ClearMemory),
            (Loading, ControlMessage::Reset) => (self, self.violation(message)),
            (_, ControlMessage::Reset) => (self, Action::ClearMemory),

            (Ready, ControlMessage::Unload) => (Idle, Action::Release),
            (Idle, ControlMessage::Unload) => (Idle, Action::Ignore),
            (Failed, ControlMessage::Unload) => (Idle, Action::Release),
            (Loading | Generating, ControlMessage::Unload) => (self, self.violation(message)),
        }
    }

    /// State after the worker emitted `event`.
    ///
    /// An `error` during generation returns to `Ready`; the worker moves to
    /// `Failed` itself when the backend cannot survive the error.
    pub fn on_event(self, event: &WorkerEvent) -> ProtocolState {
        use ProtocolState::*;

        match (self, event) {
            (Loading, WorkerEvent::Ready) => Ready,
            (Loading, WorkerEvent::Error { .. }) => Failed,
            (Generating, WorkerEvent::Complete { .. } | WorkerEvent::Error { .. }) => Ready,
            (state, _) => state,
        }
    }

    pub fn is_busy(self) -> bool {
        matches!(self, ProtocolState::Loading | ProtocolState::Generating)
    }

    fn violation(self, message: &ControlMessage) -> Action {
        Action::Violation(format!("'{}' while {:?}", message.kind(), self))
    }
}
