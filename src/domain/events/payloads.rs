//! Domain Event Payloads
//!
//! Type-tagged payloads for every event the chat modules emit. One tagged
//! union instead of an inheritance chain: each variant carries primitive or
//! nested-primitive fields only, so an envelope can cross a process boundary
//! unchanged.

use serde::{Deserialize, Serialize};

/// Bounded context that owns an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventSource {
    Conversations,
    Messages,
    Blocks,
    Calls,
    Privacy,
    Media,
}

impl EventSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventSource::Conversations => "conversations",
            EventSource::Messages => "messages",
            EventSource::Blocks => "blocks",
            EventSource::Calls => "calls",
            EventSource::Privacy => "privacy",
            EventSource::Media => "media",
        }
    }
}

impl std::fmt::Display for EventSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Domain event payload union
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "t", content = "d")]
pub enum DomainEvent {
    // Message events
    #[serde(rename = "MESSAGE_SENT")]
    MessageSent(MessageSentPayload),
    #[serde(rename = "MESSAGE_EDITED")]
    MessageEdited(MessageEditedPayload),
    #[serde(rename = "MESSAGE_DELETED")]
    MessageDeleted(MessageDeletedPayload),

    // Conversation events
    #[serde(rename = "CONVERSATION_CREATED")]
    ConversationCreated(ConversationCreatedPayload),
    #[serde(rename = "PARTICIPANT_ADDED")]
    ParticipantAdded(ParticipantChangedPayload),
    #[serde(rename = "PARTICIPANT_REMOVED")]
    ParticipantRemoved(ParticipantChangedPayload),

    // Block events
    #[serde(rename = "USER_BLOCKED")]
    UserBlocked(BlockPayload),
    #[serde(rename = "USER_UNBLOCKED")]
    UserUnblocked(BlockPayload),

    // Call events
    #[serde(rename = "CALL_STARTED")]
    CallStarted(CallStartedPayload),
    #[serde(rename = "CALL_ENDED")]
    CallEnded(CallEndedPayload),

    // Privacy events
    #[serde(rename = "PRIVACY_LEVEL_CHANGED")]
    PrivacyLevelChanged(PrivacyLevelChangedPayload),

    // Media events
    #[serde(rename = "MEDIA_ATTACHED")]
    MediaAttached(MediaAttachedPayload),

    // Typing events
    #[serde(rename = "TYPING_STARTED")]
    TypingStarted(TypingStartedPayload),
}

impl DomainEvent {
    /// Get the event type name used for dispatch and dedup keys
    pub fn event_type(&self) -> &'static str {
        match self {
            DomainEvent::MessageSent(_) => "MESSAGE_SENT",
            DomainEvent::MessageEdited(_) => "MESSAGE_EDITED",
            DomainEvent::MessageDeleted(_) => "MESSAGE_DELETED",
            DomainEvent::ConversationCreated(_) => "CONVERSATION_CREATED",
            DomainEvent::ParticipantAdded(_) => "PARTICIPANT_ADDED",
            DomainEvent::ParticipantRemoved(_) => "PARTICIPANT_REMOVED",
            DomainEvent::UserBlocked(_) => "USER_BLOCKED",
            DomainEvent::UserUnblocked(_) => "USER_UNBLOCKED",
            DomainEvent::CallStarted(_) => "CALL_STARTED",
            DomainEvent::CallEnded(_) => "CALL_ENDED",
            DomainEvent::PrivacyLevelChanged(_) => "PRIVACY_LEVEL_CHANGED",
            DomainEvent::MediaAttached(_) => "MEDIA_ATTACHED",
            DomainEvent::TypingStarted(_) => "TYPING_STARTED",
        }
    }

    /// Bounded context the event belongs to
    pub fn source(&self) -> EventSource {
        match self {
            DomainEvent::MessageSent(_)
            | DomainEvent::MessageEdited(_)
            | DomainEvent::MessageDeleted(_) => EventSource::Messages,
            DomainEvent::ConversationCreated(_)
            | DomainEvent::ParticipantAdded(_)
            | DomainEvent::ParticipantRemoved(_)
            | DomainEvent::TypingStarted(_) => EventSource::Conversations,
            DomainEvent::UserBlocked(_) | DomainEvent::UserUnblocked(_) => EventSource::Blocks,
            DomainEvent::CallStarted(_) | DomainEvent::CallEnded(_) => EventSource::Calls,
            DomainEvent::PrivacyLevelChanged(_) => EventSource::Privacy,
            DomainEvent::MediaAttached(_) => EventSource::Media,
        }
    }

    /// Identifier of the aggregate the event is about (the ordering unit)
    pub fn aggregate_id(&self) -> String {
        match self {
            DomainEvent::MessageSent(e) => e.conversation_id.clone(),
            DomainEvent::MessageEdited(e) => e.conversation_id.clone(),
            DomainEvent::MessageDeleted(e) => e.conversation_id.clone(),
            DomainEvent::ConversationCreated(e) => e.conversation_id.clone(),
            DomainEvent::ParticipantAdded(e) => e.conversation_id.clone(),
            DomainEvent::ParticipantRemoved(e) => e.conversation_id.clone(),
            DomainEvent::UserBlocked(e) => e.blocker_id.clone(),
            DomainEvent::UserUnblocked(e) => e.blocker_id.clone(),
            DomainEvent::CallStarted(e) => e.call_id.clone(),
            DomainEvent::CallEnded(e) => e.call_id.clone(),
            DomainEvent::PrivacyLevelChanged(e) => e.user_id.clone(),
            DomainEvent::MediaAttached(e) => e.conversation_id.clone(),
            DomainEvent::TypingStarted(e) => e.conversation_id.clone(),
        }
    }

    /// Conversation the event is scoped to, when there is one. Drives
    /// conversation-channel routing for the broadcast fan-out.
    pub fn conversation_id(&self) -> Option<&str> {
        match self {
            DomainEvent::MessageSent(e) => Some(&e.conversation_id),
            DomainEvent::MessageEdited(e) => Some(&e.conversation_id),
            DomainEvent::MessageDeleted(e) => Some(&e.conversation_id),
            DomainEvent::ConversationCreated(e) => Some(&e.conversation_id),
            DomainEvent::ParticipantAdded(e) => Some(&e.conversation_id),
            DomainEvent::ParticipantRemoved(e) => Some(&e.conversation_id),
            DomainEvent::CallStarted(e) => Some(&e.conversation_id),
            DomainEvent::CallEnded(e) => Some(&e.conversation_id),
            DomainEvent::MediaAttached(e) => Some(&e.conversation_id),
            DomainEvent::TypingStarted(e) => Some(&e.conversation_id),
            DomainEvent::UserBlocked(_)
            | DomainEvent::UserUnblocked(_)
            | DomainEvent::PrivacyLevelChanged(_) => None,
        }
    }

    /// Schema version of the payload as constructed.
    ///
    /// This reflects the shape compiled into this binary, never a value
    /// negotiated with a peer. Bump it together with a registered hop in
    /// the version registry when a payload's shape changes.
    pub fn schema_version(&self) -> u32 {
        match self {
            // v1 carried `body`; v2 renamed it to `content`
            DomainEvent::MessageSent(_) => 2,
            _ => 1,
        }
    }

    /// Payload-specific required fields, checked by `EventEnvelope::validate`
    pub(crate) fn required_fields(&self) -> Vec<(&'static str, &str)> {
        match self {
            DomainEvent::MessageSent(e) => vec![
                ("message_id", e.message_id.as_str()),
                ("conversation_id", e.conversation_id.as_str()),
                ("sender_id", e.sender_id.as_str()),
                ("content", e.content.as_str()),
            ],
            DomainEvent::MessageEdited(e) => vec![
                ("message_id", e.message_id.as_str()),
                ("conversation_id", e.conversation_id.as_str()),
                ("editor_id", e.editor_id.as_str()),
            ],
            DomainEvent::MessageDeleted(e) => vec![
                ("message_id", e.message_id.as_str()),
                ("conversation_id", e.conversation_id.as_str()),
                ("deleted_by", e.deleted_by.as_str()),
            ],
            DomainEvent::ConversationCreated(e) => vec![
                ("conversation_id", e.conversation_id.as_str()),
                ("creator_id", e.creator_id.as_str()),
            ],
            DomainEvent::ParticipantAdded(e) | DomainEvent::ParticipantRemoved(e) => vec![
                ("conversation_id", e.conversation_id.as_str()),
                ("user_id", e.user_id.as_str()),
            ],
            DomainEvent::UserBlocked(e) | DomainEvent::UserUnblocked(e) => vec![
                ("blocker_id", e.blocker_id.as_str()),
                ("blocked_id", e.blocked_id.as_str()),
            ],
            DomainEvent::CallStarted(e) => vec![
                ("call_id", e.call_id.as_str()),
                ("conversation_id", e.conversation_id.as_str()),
                ("caller_id", e.caller_id.as_str()),
            ],
            DomainEvent::CallEnded(e) => vec![
                ("call_id", e.call_id.as_str()),
                ("conversation_id", e.conversation_id.as_str()),
            ],
            DomainEvent::PrivacyLevelChanged(e) => vec![
                ("user_id", e.user_id.as_str()),
                ("field", e.field.as_str()),
                ("level", e.level.as_str()),
            ],
            DomainEvent::MediaAttached(e) => vec![
                ("media_id", e.media_id.as_str()),
                ("message_id", e.message_id.as_str()),
                ("conversation_id", e.conversation_id.as_str()),
            ],
            DomainEvent::TypingStarted(e) => vec![
                ("conversation_id", e.conversation_id.as_str()),
                ("user_id", e.user_id.as_str()),
            ],
        }
    }
}

// Event payload structs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageSentPayload {
    pub message_id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageEditedPayload {
    pub message_id: String,
    pub conversation_id: String,
    pub editor_id: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageDeletedPayload {
    pub message_id: String,
    pub conversation_id: String,
    pub deleted_by: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationCreatedPayload {
    pub conversation_id: String,
    pub creator_id: String,
    pub participant_ids: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParticipantChangedPayload {
    pub conversation_id: String,
    pub user_id: String,
    pub actor_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockPayload {
    pub blocker_id: String,
    pub blocked_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallStartedPayload {
    pub call_id: String,
    pub conversation_id: String,
    pub caller_id: String,
    /// "audio" or "video"
    pub media_kind: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallEndedPayload {
    pub call_id: String,
    pub conversation_id: String,
    pub ended_by: String,
    pub duration_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrivacyLevelChangedPayload {
    pub user_id: String,
    /// Which profile field the level applies to (e.g. "last_seen", "avatar")
    pub field: String,
    /// "everyone", "contacts" or "nobody"
    pub level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaAttachedPayload {
    pub media_id: String,
    pub message_id: String,
    pub conversation_id: String,
    pub mime_type: String,
    pub size_bytes: u64,
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TypingStartedPayload {
    pub conversation_id: String,
    pub user_id: String,
    pub started_at_ms: i64,
}
