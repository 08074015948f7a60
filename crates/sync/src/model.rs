use rapport_storage::{
    ConversationId, ConversationRecord, IdentityId, MessageId, MessageRecord, ReadWatermark,
};
use serde::{Deserialize, Serialize};
use snafu::ResultExt;

use crate::error::{InvalidPushEventSnafu, InvalidPushPayloadSnafu, SyncResult};

/// A server-confirmed message. Immutable apart from `read`, which only ever flips to `true`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: IdentityId,
    pub receiver_id: IdentityId,
    pub body: String,
    pub created_at_unix_millis: u64,
    pub read: bool,
}

impl Message {
    /// Ordering key of a timeline: `(created_at, id)` ascending.
    pub fn timeline_key(&self) -> (u64, MessageId) {
        (self.created_at_unix_millis, self.id)
    }

    pub fn involves(&self, identity: IdentityId) -> bool {
        self.sender_id == identity || self.receiver_id == identity
    }

    pub fn is_unread_for(&self, identity: IdentityId) -> bool {
        self.receiver_id == identity && !self.read
    }

    /// Read bound that covers this message and everything ordered before it.
    pub fn read_watermark(&self) -> ReadWatermark {
        ReadWatermark {
            created_at_unix_millis: self.created_at_unix_millis,
            message_id: self.id,
        }
    }

    pub fn is_covered_by(&self, watermark: ReadWatermark) -> bool {
        watermark.covers(self.created_at_unix_millis, self.id)
    }
}

impl From<MessageRecord> for Message {
    fn from(record: MessageRecord) -> Self {
        Self {
            id: record.id,
            conversation_id: record.conversation_id,
            sender_id: record.sender_id,
            receiver_id: record.receiver_id,
            body: record.body,
            created_at_unix_millis: record.created_at_unix_millis,
            read: record.read,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conversation {
    pub id: ConversationId,
    pub participants: [IdentityId; 2],
    pub created_at_unix_millis: u64,
}

impl Conversation {
    pub fn has_participant(&self, identity: IdentityId) -> bool {
        self.participants.contains(&identity)
    }

    pub fn other_participant(&self, identity: IdentityId) -> Option<IdentityId> {
        match self.participants {
            [first, second] if first == identity => Some(second),
            [first, second] if second == identity => Some(first),
            _ => None,
        }
    }
}

impl From<ConversationRecord> for Conversation {
    fn from(record: ConversationRecord) -> Self {
        Self {
            id: record.id,
            participants: [record.participant_low, record.participant_high],
            created_at_unix_millis: record.created_at_unix_millis,
        }
    }
}

/// Directory position of a summary. Larger keys sort first.
///
/// Field order encodes the directory invariant: conversations with messages outrank empty
/// ones, then the newer timestamp wins, then the larger id breaks ties deterministically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct SortKey {
    pub has_messages: bool,
    pub timestamp_unix_millis: u64,
    pub tiebreak: [u8; 16],
}

/// One row of the match directory, as seen by the session identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationSummary {
    pub conversation: Conversation,
    pub peer_id: IdentityId,
    pub last_message: Option<Message>,
    pub unread_count: u64,
}

impl ConversationSummary {
    pub fn id(&self) -> ConversationId {
        self.conversation.id
    }

    pub fn sort_key(&self) -> SortKey {
        match &self.last_message {
            Some(message) => SortKey {
                has_messages: true,
                timestamp_unix_millis: message.created_at_unix_millis,
                tiebreak: message.id.as_uuid().into_bytes(),
            },
            None => SortKey {
                has_messages: false,
                timestamp_unix_millis: self.conversation.created_at_unix_millis,
                tiebreak: self.conversation.id.as_uuid().into_bytes(),
            },
        }
    }

    pub fn preview(&self) -> Option<&str> {
        self.last_message.as_ref().map(|message| message.body.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub display_name: String,
    #[serde(default)]
    pub avatar_url: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub subtype: Option<String>,
}

/// Directory row enriched with the peer's profile for presentation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationEntry {
    pub summary: ConversationSummary,
    pub profile: Option<Profile>,
}

/// Wire shape of a "message created" push event. Ids travel as UUID strings and
/// `created_at` as unix milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushEvent {
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub receiver_id: String,
    pub body: String,
    pub created_at: u64,
}

impl PushEvent {
    pub fn from_json(raw: &str) -> SyncResult<Self> {
        serde_json::from_str(raw).context(InvalidPushPayloadSnafu {
            stage: "push-event-decode",
        })
    }

    pub fn to_json(&self) -> SyncResult<String> {
        serde_json::to_string(self).context(InvalidPushPayloadSnafu {
            stage: "push-event-encode",
        })
    }

    /// Push events only announce confirmed writes, so they always arrive unread.
    pub fn into_message(self) -> SyncResult<Message> {
        let stage = "push-event-parse-ids";
        Ok(Message {
            id: MessageId::parse(&self.id).context(InvalidPushEventSnafu { stage })?,
            conversation_id: ConversationId::parse(&self.conversation_id)
                .context(InvalidPushEventSnafu { stage })?,
            sender_id: IdentityId::parse(&self.sender_id).context(InvalidPushEventSnafu { stage })?,
            receiver_id: IdentityId::parse(&self.receiver_id)
                .context(InvalidPushEventSnafu { stage })?,
            body: self.body,
            created_at_unix_millis: self.created_at,
            read: false,
        })
    }
}

impl From<&Message> for PushEvent {
    fn from(message: &Message) -> Self {
        Self {
            id: message.id.to_string(),
            conversation_id: message.conversation_id.to_string(),
            sender_id: message.sender_id.to_string(),
            receiver_id: message.receiver_id.to_string(),
            body: message.body.clone(),
            created_at: message.created_at_unix_millis,
        }
    }
}
