//! Event log and derived projection.
//!
//! The same fold runs on both ends of a connection. The server applies taps
//! with [`Sequencing::Assign`] and becomes the source of truth; a client
//! applies what it receives with [`Sequencing::Accept`] and ends up with a
//! mirror of the part of the log it is allowed to see.
//!
//! Validation happens before any mutation, so a rejected tap leaves the
//! projection untouched.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use crate::protocol::{Event, EventKind};

/// Who decides a tap's sequence id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sequencing {
    /// Server: the id is the tap's index in the log
    Assign,
    /// Client mirror: keep the id the server assigned
    Accept,
}

/// Reasons a tap is refused. Refused taps are dropped, never committed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("{0} required")]
    MissingField(&'static str),
    #[error("Conversation '{0}' already exists")]
    DuplicateConversation(String),
    #[error("Conversation '{0}' not found")]
    ConversationNotFound(String),
    #[error("Message body required")]
    EmptyBody,
    #[error("'{0}' taps cannot be committed")]
    ReservedKind(EventKind),
}

/// A line of conversation history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub sequence_id: u64,
    pub user: String,
    pub body: String,
}

impl std::fmt::Display for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.user, self.body)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conversation {
    /// Id of the createConversation tap
    pub sequence_id: u64,
    pub title: String,
    /// username → admission id
    members: HashMap<String, u64>,
    messages: Vec<Message>,
}

impl Conversation {
    fn new(sequence_id: u64, title: String) -> Self {
        Self {
            sequence_id,
            title,
            members: HashMap::new(),
            messages: Vec::new(),
        }
    }

    /// Admission id for `user`, `None` if they are not a member.
    ///
    /// An admission id of 0 also means "not a member".
    pub fn admission(&self, user: &str) -> Option<u64> {
        self.members.get(user).copied().filter(|id| *id > 0)
    }

    pub fn is_member(&self, user: &str) -> bool {
        self.admission(user).is_some()
    }

    /// Members in name order.
    pub fn members(&self) -> Vec<String> {
        let mut members: Vec<String> = self.members.keys().cloned().collect();
        members.sort();
        members
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn last_message(&self) -> Option<&Message> {
        self.messages.last()
    }

    /// Admit `user` at `sequence_id` unless already admitted.
    fn admit(&mut self, user: &str, sequence_id: u64) {
        self.members.entry(user.to_string()).or_insert(sequence_id);
    }

    fn push_message(&mut self, event: &Event) {
        self.messages.push(Message {
            sequence_id: event.sequence_id,
            user: event.user.clone(),
            body: event.value.clone(),
        });
    }
}

/// The projection: committed log plus the state folded from it.
#[derive(Debug, Clone, Default)]
pub struct Data {
    log: Vec<Arc<Event>>,
    users: BTreeSet<String>,
    conversations: BTreeMap<String, Conversation>,
}

impl Data {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate `event`, fold it in, append it to the log.
    ///
    /// Returns the committed tap. With [`Sequencing::Assign`] its
    /// `sequence_id` is the log index it landed at; synthesized message text
    /// is written back into `value` so mirrors derive the same history.
    pub fn apply(
        &mut self,
        mut event: Event,
        sequencing: Sequencing,
    ) -> Result<Arc<Event>, ValidationError> {
        self.validate(&event)?;

        if sequencing == Sequencing::Assign {
            event.sequence_id = self.log.len() as u64;
        }
        let id = event.sequence_id;

        match event.kind {
            EventKind::Auth => {
                self.users.insert(event.user.clone());
            }
            EventKind::CreateConversation => {
                let mut conversation = Conversation::new(id, event.conversation.clone());
                conversation.admit(&event.user, id);
                for participant in &event.args {
                    self.users.insert(participant.clone());
                    conversation.admit(participant, id);
                }
                if event.value.is_empty() {
                    event.value = created_text(&event.args);
                }
                conversation.push_message(&event);
                self.conversations.insert(conversation.title.clone(), conversation);
            }
            EventKind::Message => {
                if let Some(conversation) = self.conversations.get_mut(&event.conversation) {
                    conversation.push_message(&event);
                }
            }
            EventKind::Invite => {
                for invitee in &event.args {
                    self.users.insert(invitee.clone());
                }
                event.value = format!("{} invited {}", event.user, event.args.join(", "));
                if let Some(conversation) = self.conversations.get_mut(&event.conversation) {
                    for invitee in &event.args {
                        conversation.admit(invitee, id);
                    }
                    conversation.push_message(&event);
                }
            }
            // validate() refuses these
            EventKind::Error => {}
        }

        let event = Arc::new(event);
        self.log.push(event.clone());
        Ok(event)
    }

    /// Check `event` against the current state without touching it.
    pub fn validate(&self, event: &Event) -> Result<(), ValidationError> {
        if event.kind == EventKind::Error {
            return Err(ValidationError::ReservedKind(event.kind));
        }
        if event.user.is_empty() {
            return Err(ValidationError::MissingField("user"));
        }

        match event.kind {
            EventKind::Auth | EventKind::Error => Ok(()),
            EventKind::CreateConversation => {
                if event.conversation.is_empty() {
                    return Err(ValidationError::MissingField("conversation"));
                }
                if self.conversations.contains_key(&event.conversation) {
                    return Err(ValidationError::DuplicateConversation(
                        event.conversation.clone(),
                    ));
                }
                Ok(())
            }
            EventKind::Message => {
                if event.conversation.is_empty() {
                    return Err(ValidationError::MissingField("conversation"));
                }
                if event.value.is_empty() {
                    return Err(ValidationError::EmptyBody);
                }
                self.require_conversation(&event.conversation)
            }
            EventKind::Invite => {
                if event.conversation.is_empty() {
                    return Err(ValidationError::MissingField("conversation"));
                }
                if event.args.is_empty() {
                    return Err(ValidationError::MissingField("args"));
                }
                self.require_conversation(&event.conversation)
            }
        }
    }

    fn require_conversation(&self, title: &str) -> Result<(), ValidationError> {
        if self.conversations.contains_key(title) {
            Ok(())
        } else {
            Err(ValidationError::ConversationNotFound(title.to_string()))
        }
    }

    /// Causal visibility: auth taps are public, conversation taps are seen
    /// only by members admitted at or before the tap.
    pub fn visible(&self, user: &str, event: &Event) -> bool {
        match event.kind {
            EventKind::Auth => true,
            EventKind::CreateConversation | EventKind::Message | EventKind::Invite => self
                .conversations
                .get(&event.conversation)
                .and_then(|c| c.admission(user))
                .is_some_and(|admitted| admitted <= event.sequence_id),
            EventKind::Error => false,
        }
    }

    /// Number of committed taps.
    pub fn len(&self) -> usize {
        self.log.len()
    }

    pub fn is_empty(&self) -> bool {
        self.log.is_empty()
    }

    pub fn log(&self) -> &[Arc<Event>] {
        &self.log
    }

    /// Known users in name order.
    pub fn users(&self) -> Vec<String> {
        self.users.iter().cloned().collect()
    }

    pub fn has_user(&self, user: &str) -> bool {
        self.users.contains(user)
    }

    pub fn conversation(&self, title: &str) -> Option<&Conversation> {
        self.conversations.get(title)
    }

    /// Conversations in title order.
    pub fn conversations(&self) -> impl Iterator<Item = &Conversation> {
        self.conversations.values()
    }
}

fn created_text(participants: &[String]) -> String {
    let mut text = String::from("Created conversation");
    if !participants.is_empty() {
        text.push_str(" with ");
        text.push_str(&participants.join(", "));
    }
    text
}
