use std::fmt;

use rapport_storage::{ConversationId, StorageError};
use snafu::Snafu;

/// Why an outgoing body was refused before reaching the durable store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationReason {
    Empty,
    TooLong { max: usize, actual: usize },
    Unsanitary,
}

impl fmt::Display for ValidationReason {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(formatter, "message body is empty"),
            Self::TooLong { max, actual } => {
                write!(formatter, "message body has {actual} characters (max {max})")
            }
            Self::Unsanitary => write!(formatter, "message body has no displayable content"),
        }
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SyncError {
    #[snafu(display("message rejected on `{stage}`: {reason}"))]
    Validation {
        stage: &'static str,
        reason: ValidationReason,
    },
    #[snafu(display("send rate limit exceeded; resets at unix millis {reset_at_unix_millis}"))]
    RateLimited {
        stage: &'static str,
        reset_at_unix_millis: u64,
    },
    #[snafu(display("durable store failed on `{stage}`: {source}"))]
    Transport {
        stage: &'static str,
        source: StorageError,
    },
    #[snafu(display("conversation '{conversation_id}' was not found"))]
    ConversationNotFound {
        stage: &'static str,
        conversation_id: ConversationId,
    },
    #[snafu(display("session identity is not a participant of conversation '{conversation_id}'"))]
    NotParticipant {
        stage: &'static str,
        conversation_id: ConversationId,
    },
    #[snafu(display("push frame could not be decoded on `{stage}`: {source}"))]
    InvalidPushPayload {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("push event is malformed on `{stage}`: {source}"))]
    InvalidPushEvent {
        stage: &'static str,
        source: StorageError,
    },
    #[snafu(display("profile lookup failed on `{stage}`: {details}"))]
    ProfileLookup {
        stage: &'static str,
        details: String,
    },
}

impl SyncError {
    /// Only durable-store failures are worth a retry affordance; everything else is deterministic.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport { .. })
    }

    pub fn reset_at_unix_millis(&self) -> Option<u64> {
        match self {
            Self::RateLimited {
                reset_at_unix_millis,
                ..
            } => Some(*reset_at_unix_millis),
            _ => None,
        }
    }

    pub fn validation_reason(&self) -> Option<&ValidationReason> {
        match self {
            Self::Validation { reason, .. } => Some(reason),
            _ => None,
        }
    }
}

pub type SyncResult<T> = Result<T, SyncError>;
