use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

pub mod error;
pub mod ids;
pub mod sqlite;
pub mod types;

pub use error::{StorageError, StorageResult};
pub use ids::{ConversationId, IdentityId, MessageId};
pub use sqlite::SqliteStorage;
pub use types::{ConversationRecord, MessageRecord, NewConversation, NewMessage, ReadWatermark};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub trait ConversationStore: Send + Sync {
    fn create_conversation(
        &self,
        input: NewConversation,
    ) -> BoxFuture<'_, StorageResult<ConversationRecord>>;
    fn list_conversations(
        &self,
        identity: IdentityId,
    ) -> BoxFuture<'_, StorageResult<Vec<ConversationRecord>>>;
    fn get_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> BoxFuture<'_, StorageResult<Option<ConversationRecord>>>;
}

pub trait MessageStore: Send + Sync {
    fn insert_message(&self, input: NewMessage) -> BoxFuture<'_, StorageResult<MessageRecord>>;
    fn list_messages(
        &self,
        conversation_id: ConversationId,
    ) -> BoxFuture<'_, StorageResult<Vec<MessageRecord>>>;
    fn unread_counts(
        &self,
        identity: IdentityId,
    ) -> BoxFuture<'_, StorageResult<HashMap<ConversationId, u64>>>;
    fn latest_messages(
        &self,
        conversation_ids: Vec<ConversationId>,
    ) -> BoxFuture<'_, StorageResult<Vec<MessageRecord>>>;
    /// Flips unread messages addressed to `receiver_id` up to and including `through`.
    fn mark_read(
        &self,
        conversation_id: ConversationId,
        receiver_id: IdentityId,
        through: ReadWatermark,
    ) -> BoxFuture<'_, StorageResult<u64>>;
}

pub trait ChatStore: ConversationStore + MessageStore {}

impl<T> ChatStore for T where T: ConversationStore + MessageStore {}
