use std::fmt;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Title the backend assigns until the council names a conversation.
pub const DEFAULT_CONVERSATION_TITLE: &str = "New Conversation";

/// Opaque server-side identifier for one conversation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationId(String);

impl ConversationId {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(&self.0)
    }
}

impl From<&str> for ConversationId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Local identifier for one message inside a transcript.
///
/// Never sent over the wire; reassigned every time a snapshot is loaded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId(pub u64);

impl MessageId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }
}

/// Identifier for one streaming exchange.
///
/// Allocated per submitted turn so log lines and rejections can name the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamSessionId(pub u64);

impl StreamSessionId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }
}

/// Monotonic token naming one activation of the active conversation.
///
/// It advances every time the active conversation changes, so a session opened
/// under an older epoch is stale even if the user switches back to the same id.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConversationEpoch(pub u64);

impl ConversationEpoch {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

/// Routing key binding one stream session to the conversation it was opened against.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionTarget {
    pub conversation_id: ConversationId,
    pub epoch: ConversationEpoch,
    pub session_id: StreamSessionId,
}

impl SessionTarget {
    pub fn new(
        conversation_id: ConversationId,
        epoch: ConversationEpoch,
        session_id: StreamSessionId,
    ) -> Self {
        Self {
            conversation_id,
            epoch,
            session_id,
        }
    }
}

/// Chat speaker role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// One of the three sequential phases of a council reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StageSlot {
    Stage1,
    Stage2,
    Stage3,
}

impl StageSlot {
    pub const ALL: [StageSlot; 3] = [Self::Stage1, Self::Stage2, Self::Stage3];

    pub const fn number(self) -> u8 {
        match self {
            Self::Stage1 => 1,
            Self::Stage2 => 2,
            Self::Stage3 => 3,
        }
    }
}

/// Per-stage "in progress" flags of an assistant message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageLoading {
    #[serde(default)]
    pub stage1: bool,
    #[serde(default)]
    pub stage2: bool,
    #[serde(default)]
    pub stage3: bool,
}

impl StageLoading {
    pub fn get(&self, slot: StageSlot) -> bool {
        match slot {
            StageSlot::Stage1 => self.stage1,
            StageSlot::Stage2 => self.stage2,
            StageSlot::Stage3 => self.stage3,
        }
    }

    pub fn set(&mut self, slot: StageSlot, loading: bool) {
        match slot {
            StageSlot::Stage1 => self.stage1 = loading,
            StageSlot::Stage2 => self.stage2 = loading,
            StageSlot::Stage3 => self.stage3 = loading,
        }
    }

    pub fn any(&self) -> bool {
        self.stage1 || self.stage2 || self.stage3
    }
}

/// Immutable user turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserMessage {
    pub content: String,
    #[serde(default, with = "timestamp", skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

/// Assistant reply; the only entity mutated while a turn streams.
///
/// Stage payloads and metadata are opaque JSON, stored and surfaced as-is.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AssistantMessage {
    #[serde(default)]
    pub stage1: Option<Value>,
    #[serde(default)]
    pub stage2: Option<Value>,
    #[serde(default)]
    pub stage3: Option<Value>,
    #[serde(default)]
    pub metadata: Option<Value>,
    #[serde(default)]
    pub loading: StageLoading,
    #[serde(default, with = "timestamp", skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl AssistantMessage {
    /// Creates an empty draft: no stage results, no stage in progress.
    pub fn draft(timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp: Some(timestamp),
            ..Self::default()
        }
    }

    pub fn stage(&self, slot: StageSlot) -> Option<&Value> {
        match slot {
            StageSlot::Stage1 => self.stage1.as_ref(),
            StageSlot::Stage2 => self.stage2.as_ref(),
            StageSlot::Stage3 => self.stage3.as_ref(),
        }
    }

    pub fn start_stage(&mut self, slot: StageSlot) {
        self.loading.set(slot, true);
    }

    /// Stores a finished stage result. Metadata travels with stage 2 only.
    pub fn complete_stage(&mut self, slot: StageSlot, data: Option<Value>, metadata: Option<Value>) {
        match slot {
            StageSlot::Stage1 => self.stage1 = data,
            StageSlot::Stage2 => {
                self.stage2 = data;
                self.metadata = metadata;
            }
            StageSlot::Stage3 => self.stage3 = data,
        }
        self.loading.set(slot, false);
    }

    /// True when nothing has been recorded yet: no stage result and nothing loading.
    pub fn is_blank(&self) -> bool {
        StageSlot::ALL.iter().all(|slot| self.stage(*slot).is_none()) && !self.loading.any()
    }
}

/// Role-tagged message body, matching the backend's `role` discriminator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "lowercase")]
pub enum MessageBody {
    User(UserMessage),
    Assistant(AssistantMessage),
}

/// One transcript entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(skip)]
    pub id: MessageId,
    #[serde(flatten)]
    pub body: MessageBody,
}

impl Message {
    pub fn user(id: MessageId, content: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            id,
            body: MessageBody::User(UserMessage {
                content: content.into(),
                timestamp: Some(timestamp),
            }),
        }
    }

    pub fn assistant_draft(id: MessageId, timestamp: DateTime<Utc>) -> Self {
        Self {
            id,
            body: MessageBody::Assistant(AssistantMessage::draft(timestamp)),
        }
    }

    pub fn role(&self) -> Role {
        match self.body {
            MessageBody::User(_) => Role::User,
            MessageBody::Assistant(_) => Role::Assistant,
        }
    }

    pub fn as_user(&self) -> Option<&UserMessage> {
        match &self.body {
            MessageBody::User(message) => Some(message),
            MessageBody::Assistant(_) => None,
        }
    }

    pub fn as_assistant(&self) -> Option<&AssistantMessage> {
        match &self.body {
            MessageBody::Assistant(message) => Some(message),
            MessageBody::User(_) => None,
        }
    }

    pub fn as_assistant_mut(&mut self) -> Option<&mut AssistantMessage> {
        match &mut self.body {
            MessageBody::Assistant(message) => Some(message),
            MessageBody::User(_) => None,
        }
    }
}

/// One conversation as the backend returns it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    #[serde(default, with = "timestamp", skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default = "default_title", deserialize_with = "title_or_default")]
    pub title: String,
    #[serde(default)]
    pub messages: Vec<Message>,
}

impl Conversation {
    pub fn new(id: ConversationId) -> Self {
        Self {
            id,
            created_at: None,
            title: default_title(),
            messages: Vec::new(),
        }
    }

    pub fn summary(&self) -> ConversationSummary {
        ConversationSummary {
            id: self.id.clone(),
            created_at: self.created_at,
            title: self.title.clone(),
            message_count: self.messages.len(),
        }
    }
}

/// Sidebar row for one conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub id: ConversationId,
    #[serde(default, with = "timestamp", skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default = "default_title", deserialize_with = "title_or_default")]
    pub title: String,
    #[serde(default)]
    pub message_count: usize,
}

fn default_title() -> String {
    DEFAULT_CONVERSATION_TITLE.to_string()
}

// The backend sends `null` or "" for conversations the council has not titled yet.
fn title_or_default<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw = Option::<String>::deserialize(deserializer)?;
    Ok(raw
        .map(|title| title.trim().to_string())
        .filter(|title| !title.is_empty())
        .unwrap_or_else(default_title))
}

/// Parses an RFC 3339 timestamp, or a naive ISO 8601 one interpreted as UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }
    raw.parse::<NaiveDateTime>().ok().map(|naive| naive.and_utc())
}

mod timestamp {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &Option<DateTime<Utc>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(value) => serializer.serialize_some(&value.to_rfc3339()),
            None => serializer.serialize_none(),
        }
    }

    // Unparseable timestamps degrade to `None` instead of rejecting the whole snapshot.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = Option::<String>::deserialize(deserializer)?;
        Ok(raw.as_deref().and_then(super::parse_timestamp))
    }
}
