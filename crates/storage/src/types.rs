use super::ids::{ConversationId, IdentityId, MessageId};

/// A persisted pairing of two identities.
///
/// Participants are stored normalized (`participant_low < participant_high`), so the pair
/// carries no notion of who initiated the match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationRecord {
    pub id: ConversationId,
    pub participant_low: IdentityId,
    pub participant_high: IdentityId,
    pub created_at_unix_millis: u64,
}

impl ConversationRecord {
    pub fn has_participant(&self, identity: IdentityId) -> bool {
        self.participant_low == identity || self.participant_high == identity
    }

    /// Returns the participant that is not `identity`, or `None` when `identity` is not a member.
    pub fn other_participant(&self, identity: IdentityId) -> Option<IdentityId> {
        if self.participant_low == identity {
            Some(self.participant_high)
        } else if self.participant_high == identity {
            Some(self.participant_low)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewConversation {
    pub first: IdentityId,
    pub second: IdentityId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRecord {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: IdentityId,
    pub receiver_id: IdentityId,
    pub body: String,
    pub created_at_unix_millis: u64,
    pub read: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    pub conversation_id: ConversationId,
    pub sender_id: IdentityId,
    pub receiver_id: IdentityId,
    pub body: String,
}

/// Inclusive `(created_at, id)` bound of the messages one read mark covers.
///
/// Messages that arrive after the bound was taken stay unread even if they land while the mark
/// is being applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ReadWatermark {
    pub created_at_unix_millis: u64,
    pub message_id: MessageId,
}

impl ReadWatermark {
    pub fn covers(&self, created_at_unix_millis: u64, message_id: MessageId) -> bool {
        (created_at_unix_millis, message_id) <= (self.created_at_unix_millis, self.message_id)
    }
}
