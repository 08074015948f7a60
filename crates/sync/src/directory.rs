use std::collections::HashMap;

use rapport_storage::{ConversationId, IdentityId, MessageId};

use crate::model::{Conversation, ConversationSummary, Message};

/// Conversation summaries for one identity, kept in directory order.
///
/// Conversations with messages come first, newest `last_message` leading; the rest follow by
/// newest creation time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MatchDirectory {
    summaries: Vec<ConversationSummary>,
    // Latest message each rebuilt unread count already includes.
    counted_through: HashMap<ConversationId, (u64, MessageId)>,
}

impl MatchDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the directory from raw conversations and messages in one grouping pass.
    pub fn build(
        conversations: Vec<Conversation>,
        messages: &[Message],
        identity: IdentityId,
    ) -> Self {
        let mut aggregates: HashMap<ConversationId, (Option<&Message>, u64)> = HashMap::new();
        for message in messages {
            let (latest, unread) = aggregates.entry(message.conversation_id).or_default();
            if latest.is_none_or(|current| current.timeline_key() < message.timeline_key()) {
                *latest = Some(message);
            }
            if message.is_unread_for(identity) {
                *unread += 1;
            }
        }

        let summaries = conversations
            .into_iter()
            .filter_map(|conversation| {
                let (latest, unread) = aggregates
                    .get(&conversation.id)
                    .copied()
                    .unwrap_or_default();
                summarize(conversation, latest.cloned(), unread, identity)
            })
            .collect();

        Self::from_summaries(summaries)
    }

    /// Builds the directory from store-side aggregates: one latest message per conversation and
    /// unread counts already scoped to `identity`.
    pub fn from_aggregates(
        conversations: Vec<Conversation>,
        latest: Vec<Message>,
        unread: &HashMap<ConversationId, u64>,
        identity: IdentityId,
    ) -> Self {
        let mut latest_by_conversation = latest
            .into_iter()
            .map(|message| (message.conversation_id, message))
            .collect::<HashMap<_, _>>();

        let summaries = conversations
            .into_iter()
            .filter_map(|conversation| {
                let last_message = latest_by_conversation.remove(&conversation.id);
                let unread_count = unread.get(&conversation.id).copied().unwrap_or(0);
                summarize(conversation, last_message, unread_count, identity)
            })
            .collect();

        Self::from_summaries(summaries)
    }

    fn from_summaries(mut summaries: Vec<ConversationSummary>) -> Self {
        summaries.sort_by_key(|summary| std::cmp::Reverse(summary.sort_key()));
        let counted_through = summaries
            .iter()
            .filter_map(|summary| {
                let last = summary.last_message.as_ref()?;
                Some((summary.id(), last.timeline_key()))
            })
            .collect();
        Self {
            summaries,
            counted_through,
        }
    }

    /// Folds one observed message into its summary.
    ///
    /// The preview only moves forward. The unread counter is bumped when `identity` received
    /// the message, the conversation is not `active`, the message is `fresh` to this session
    /// and the last rebuild did not already count it. It may drift and is corrected by the next
    /// rebuild.
    pub fn apply_incoming(
        &mut self,
        message: &Message,
        fresh: bool,
        active: Option<ConversationId>,
        identity: IdentityId,
    ) -> bool {
        let refreshed = self.refresh(message, identity);

        let counts = fresh
            && message.receiver_id == identity
            && active != Some(message.conversation_id)
            && self
                .counted_through
                .get(&message.conversation_id)
                .is_none_or(|counted| *counted < message.timeline_key());
        if counts && let Some(summary) = self.get_mut(message.conversation_id) {
            summary.unread_count += 1;
            return true;
        }
        refreshed
    }

    /// Folds a confirmed outgoing message into its summary. Never touches the unread counter.
    pub fn apply_outgoing(&mut self, message: &Message, identity: IdentityId) -> bool {
        self.refresh(message, identity)
    }

    /// Lowers the unread counter by `count` messages that were just marked read. Returns `true`
    /// when the counter moved.
    pub fn release_unread(&mut self, conversation_id: ConversationId, count: u64) -> bool {
        match self.get_mut(conversation_id) {
            Some(summary) if summary.unread_count > 0 && count > 0 => {
                summary.unread_count = summary.unread_count.saturating_sub(count);
                true
            }
            _ => false,
        }
    }

    pub fn summaries(&self) -> &[ConversationSummary] {
        &self.summaries
    }

    pub fn get(&self, conversation_id: ConversationId) -> Option<&ConversationSummary> {
        self.summaries
            .iter()
            .find(|summary| summary.id() == conversation_id)
    }

    pub fn unread_count(&self, conversation_id: ConversationId) -> u64 {
        self.get(conversation_id)
            .map_or(0, |summary| summary.unread_count)
    }

    pub fn len(&self) -> usize {
        self.summaries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.summaries.is_empty()
    }

    fn get_mut(&mut self, conversation_id: ConversationId) -> Option<&mut ConversationSummary> {
        self.summaries
            .iter_mut()
            .find(|summary| summary.id() == conversation_id)
    }

    /// Makes `message` the conversation's preview and re-seats the row.
    ///
    /// Returns `false` for messages foreign to `identity` and for messages that are not newer
    /// than the current preview.
    fn refresh(&mut self, message: &Message, identity: IdentityId) -> bool {
        if !message.involves(identity) {
            return false;
        }

        let position = self
            .summaries
            .iter()
            .position(|summary| summary.id() == message.conversation_id);
        let mut summary = match position {
            Some(index) => {
                let current = &self.summaries[index];
                if current
                    .last_message
                    .as_ref()
                    .is_some_and(|last| last.timeline_key() >= message.timeline_key())
                {
                    tracing::debug!(
                        conversation_id = %message.conversation_id,
                        message_id = %message.id,
                        "directory preview already current"
                    );
                    return false;
                }
                self.summaries.remove(index)
            }
            None => match provisional_summary(message, identity) {
                Some(summary) => summary,
                None => return false,
            },
        };

        summary.last_message = Some(message.clone());
        self.reseat(summary);
        true
    }

    fn reseat(&mut self, summary: ConversationSummary) {
        let key = summary.sort_key();
        let index = self
            .summaries
            .partition_point(|existing| existing.sort_key() > key);
        self.summaries.insert(index, summary);
    }
}

fn summarize(
    conversation: Conversation,
    last_message: Option<Message>,
    unread_count: u64,
    identity: IdentityId,
) -> Option<ConversationSummary> {
    let Some(peer_id) = conversation.other_participant(identity) else {
        tracing::debug!(
            conversation_id = %conversation.id,
            "skipping conversation without the session identity"
        );
        return None;
    };

    Some(ConversationSummary {
        conversation,
        peer_id,
        last_message,
        unread_count,
    })
}

/// Row for a conversation first seen through a live message; the next rebuild replaces it.
fn provisional_summary(message: &Message, identity: IdentityId) -> Option<ConversationSummary> {
    let conversation = Conversation {
        id: message.conversation_id,
        participants: [message.sender_id, message.receiver_id],
        created_at_unix_millis: message.created_at_unix_millis,
    };
    tracing::debug!(
        conversation_id = %conversation.id,
        "adding provisional directory entry"
    );
    summarize(conversation, None, 0, identity)
}
