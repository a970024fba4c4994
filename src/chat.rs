//! Chat history kept on the controlling side.
//!
//! The whole history is re-sent with every turn; the worker never sees a
//! partial conversation.

use crate::error::{ModelhostError, Result};
use crate::task::{ChatMessage, InferenceRequest, Role};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChatSession {
    system_prompt: Option<String>,
    messages: Vec<ChatMessage>,
}

impl ChatSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start every conversation with a system message.
    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        let prompt = prompt.into();
        self.system_prompt = (!prompt.trim().is_empty()).then_some(prompt);
        self.clear();
        self
    }

    /// Append the user's input and return the request carrying the full history.
    ///
    /// # Errors
    /// `Validation` for blank input or while the previous turn has no reply.
    pub fn user_turn(&mut self, input: &str) -> Result<InferenceRequest> {
        let input = input.trim();
        if input.is_empty() {
            return Err(ModelhostError::validation("Please enter a prompt"));
        }
        if self.awaiting_reply() {
            return Err(ModelhostError::validation(
                "The previous message has not been answered yet",
            ));
        }

        self.messages.push(ChatMessage::user(input));
        Ok(InferenceRequest::Chat {
            messages: self.messages.clone(),
        })
    }

    /// Append the assistant's reply to the last user turn.
    pub fn record_reply(&mut self, reply: impl Into<String>) {
        if self.awaiting_reply() {
            self.messages.push(ChatMessage::assistant(reply));
        }
    }

    /// Drop the unanswered last user turn, e.g. after a failed request.
    pub fn abandon_turn(&mut self) -> Option<ChatMessage> {
        if self.awaiting_reply() {
            self.messages.pop()
        } else {
            None
        }
    }

    /// Start a new chat, keeping the system prompt.
    pub fn clear(&mut self) {
        self.messages.clear();
        if let Some(prompt) = &self.system_prompt {
            self.messages.push(ChatMessage::system(prompt.clone()));
        }
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    /// Number of user turns so far.
    pub fn turns(&self) -> usize {
        self.messages.iter().filter(|m| m.role == Role::User).count()
    }

    fn awaiting_reply(&self) -> bool {
        self.messages.last().is_some_and(|m| m.role == Role::User)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_turns_accumulate_history() {
        let mut session = ChatSession::new();

        let first = session.user_turn("Hi").unwrap();
        assert_eq!(
            first,
            InferenceRequest::Chat {
                messages: vec![ChatMessage::user("Hi")]
            }
        );
        session.record_reply("Hello!");

        let second = session.user_turn("  How are you?  ").unwrap();
        match second {
            InferenceRequest::Chat { messages } => {
                assert_eq!(messages.len(), 3);
                assert_eq!(messages[1], ChatMessage::assistant("Hello!"));
                assert_eq!(messages[2], ChatMessage::user("How are you?"));
            }
            other => panic!("expected chat request, got {other:?}"),
        }
        assert_eq!(session.turns(), 2);
    }

    #[test]
    fn test_blank_input_is_rejected() {
        let mut session = ChatSession::new();
        assert!(matches!(
            session.user_turn("   "),
            Err(ModelhostError::Validation { .. })
        ));
        assert!(session.messages().is_empty());
    }

    #[test]
    fn test_second_turn_before_reply_is_rejected() {
        let mut session = ChatSession::new();
        session.user_turn("one").unwrap();
        assert!(session.user_turn("two").is_err());

        assert_eq!(session.abandon_turn(), Some(ChatMessage::user("one")));
        assert!(session.user_turn("two").is_ok());
    }

    #[test]
    fn test_clear_keeps_system_prompt() {
        let mut session = ChatSession::new().with_system_prompt("Be brief.");
        session.user_turn("hello").unwrap();
        session.record_reply("hi");

        session.clear();

        assert_eq!(session.messages(), &[ChatMessage::system("Be brief.")]);
        assert_eq!(session.turns(), 0);
    }

    #[test]
    fn test_reply_without_turn_is_ignored() {
        let mut session = ChatSession::new();
        session.record_reply("unprompted");
        assert!(session.messages().is_empty());
    }
}
