use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use rapport_storage::{ChatStore, ConversationId, IdentityId, MessageId, ReadWatermark};
use snafu::ResultExt;
use tokio::sync::RwLock;

use crate::error::{SyncResult, TransportSnafu};
use crate::model::Message;

/// Ordered message history of one conversation.
///
/// Messages are kept strictly ascending by `(created_at, id)` and each id appears once,
/// no matter which path delivered it or in what order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Timeline {
    messages: Vec<Message>,
    ids: HashSet<MessageId>,
}

impl Timeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_messages(messages: impl IntoIterator<Item = Message>) -> Self {
        let mut timeline = Self::new();
        for message in messages {
            timeline.append(message);
        }
        timeline
    }

    /// Inserts `message` at its ordered position. Returns `false` when the id is already present.
    pub fn append(&mut self, message: Message) -> bool {
        if !self.ids.insert(message.id) {
            return false;
        }

        let key = message.timeline_key();
        let index = self
            .messages
            .partition_point(|existing| existing.timeline_key() < key);
        self.messages.insert(index, message);
        true
    }

    pub fn latest(&self) -> Option<&Message> {
        self.messages.last()
    }

    pub fn get(&self, message_id: MessageId) -> Option<&Message> {
        if !self.ids.contains(&message_id) {
            return None;
        }
        self.messages.iter().find(|message| message.id == message_id)
    }

    pub fn contains(&self, message_id: MessageId) -> bool {
        self.ids.contains(&message_id)
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn unread_for(&self, identity: IdentityId) -> u64 {
        self.messages
            .iter()
            .filter(|message| message.is_unread_for(identity))
            .count() as u64
    }

    /// Flips unread messages addressed to `identity` up to `through`. Returns how many changed.
    pub fn mark_read_for(&mut self, identity: IdentityId, through: ReadWatermark) -> usize {
        let mut flipped = 0;
        for message in self
            .messages
            .iter_mut()
            .filter(|message| message.is_unread_for(identity) && message.is_covered_by(through))
        {
            message.read = true;
            flipped += 1;
        }
        flipped
    }

    /// Folds an older copy of this timeline into `self`.
    ///
    /// Messages only `previous` knows about are re-appended, and a `read` flag that was
    /// already `true` in `previous` stays `true`.
    pub fn absorb(&mut self, previous: Timeline) {
        for message in previous.messages {
            if !self.contains(message.id) {
                self.append(message);
                continue;
            }
            if !message.read {
                continue;
            }
            if let Some(existing) = self
                .messages
                .iter_mut()
                .find(|existing| existing.id == message.id)
            {
                existing.read = true;
            }
        }
    }
}

/// Session-scoped timelines keyed by conversation id.
pub struct TimelineCache {
    store: Arc<dyn ChatStore>,
    entries: RwLock<HashMap<ConversationId, Timeline>>,
}

impl TimelineCache {
    pub fn new(store: Arc<dyn ChatStore>) -> Self {
        Self {
            store,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Fetches the authoritative history and installs it as the cached entry.
    ///
    /// On transport failure the previous entry is left untouched. Messages appended while the
    /// fetch was in flight survive the swap.
    pub async fn load(&self, conversation_id: ConversationId) -> SyncResult<Timeline> {
        let records = self
            .store
            .list_messages(conversation_id)
            .await
            .context(TransportSnafu {
                stage: "timeline-load",
            })?;

        let mut fetched = Timeline::from_messages(records.into_iter().map(Message::from));
        let mut entries = self.entries.write().await;
        if let Some(previous) = entries.remove(&conversation_id) {
            fetched.absorb(previous);
        }

        tracing::debug!(
            conversation_id = %conversation_id,
            messages = fetched.len(),
            "timeline loaded"
        );
        let snapshot = fetched.clone();
        entries.insert(conversation_id, fetched);
        Ok(snapshot)
    }

    /// Idempotent append keyed by the message's conversation.
    pub async fn append(&self, message: Message) -> bool {
        let conversation_id = message.conversation_id;
        let message_id = message.id;
        let mut entries = self.entries.write().await;
        let inserted = entries.entry(conversation_id).or_default().append(message);
        if !inserted {
            tracing::debug!(
                conversation_id = %conversation_id,
                message_id = %message_id,
                "duplicate message ignored by timeline cache"
            );
        }
        inserted
    }

    pub async fn latest(&self, conversation_id: ConversationId) -> Option<Message> {
        let entries = self.entries.read().await;
        entries
            .get(&conversation_id)
            .and_then(|timeline| timeline.latest().cloned())
    }

    pub async fn snapshot(&self, conversation_id: ConversationId) -> Option<Timeline> {
        self.entries.read().await.get(&conversation_id).cloned()
    }

    pub async fn mark_read(
        &self,
        conversation_id: ConversationId,
        identity: IdentityId,
        through: ReadWatermark,
    ) -> usize {
        let mut entries = self.entries.write().await;
        entries
            .get_mut(&conversation_id)
            .map_or(0, |timeline| timeline.mark_read_for(identity, through))
    }

    pub async fn clear(&self) {
        self.entries.write().await.clear();
    }
}
