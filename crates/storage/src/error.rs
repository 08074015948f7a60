use snafu::Snafu;

use crate::ids::{ConversationId, IdentityId};

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum StorageError {
    #[snafu(display("conversation '{conversation_id}' does not exist"))]
    ConversationNotFound {
        stage: &'static str,
        conversation_id: ConversationId,
    },
    #[snafu(display("identity '{identity}' cannot be matched with itself"))]
    SelfMatch {
        stage: &'static str,
        identity: IdentityId,
    },
    #[snafu(display("pair is already matched in conversation '{existing_id}'"))]
    AlreadyMatched {
        stage: &'static str,
        existing_id: String,
    },
    #[snafu(display(
        "sender '{sender_id}' and receiver '{receiver_id}' are not the participants of conversation '{conversation_id}'"
    ))]
    ParticipantMismatch {
        stage: &'static str,
        conversation_id: ConversationId,
        sender_id: IdentityId,
        receiver_id: IdentityId,
    },
    #[snafu(display("'{raw}' is not a valid {id_type}"))]
    InvalidId {
        stage: &'static str,
        id_type: &'static str,
        raw: String,
        source: uuid::Error,
    },
    #[snafu(display("stored data broke an invariant on `{stage}`: {details}"))]
    InvariantViolation {
        stage: &'static str,
        details: String,
    },
    #[snafu(display("could not create database directory {path}"))]
    CreateSqliteDirectory {
        stage: &'static str,
        path: String,
        source: std::io::Error,
    },
    #[snafu(display("'{database_url}' is not a usable sqlite location"))]
    SqliteConnectOptions {
        stage: &'static str,
        database_url: String,
        source: sqlx::Error,
    },
    #[snafu(display("could not open message store at '{database_url}'"))]
    SqliteConnect {
        stage: &'static str,
        database_url: String,
        source: sqlx::Error,
    },
    #[snafu(display("could not apply pragma '{pragma}' to message store"))]
    SqlitePragma {
        stage: &'static str,
        pragma: &'static str,
        source: sqlx::Error,
    },
    #[snafu(display("message store schema migration failed"))]
    SqliteMigrate {
        stage: &'static str,
        source: sqlx::migrate::MigrateError,
    },
    #[snafu(display("message store query failed on `{stage}`: {source}"))]
    SqliteQuery {
        stage: &'static str,
        source: sqlx::Error,
    },
}

impl StorageError {
    /// Returns the pipeline stage that produced this error.
    pub fn stage(&self) -> &'static str {
        match self {
            Self::ConversationNotFound { stage, .. }
            | Self::SelfMatch { stage, .. }
            | Self::AlreadyMatched { stage, .. }
            | Self::ParticipantMismatch { stage, .. }
            | Self::InvalidId { stage, .. }
            | Self::InvariantViolation { stage, .. }
            | Self::CreateSqliteDirectory { stage, .. }
            | Self::SqliteConnectOptions { stage, .. }
            | Self::SqliteConnect { stage, .. }
            | Self::SqlitePragma { stage, .. }
            | Self::SqliteMigrate { stage, .. }
            | Self::SqliteQuery { stage, .. } => stage,
        }
    }
}

pub type StorageResult<T> = Result<T, StorageError>;
