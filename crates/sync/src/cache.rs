use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use rapport_storage::{ChatStore, ConversationId, IdentityId, MessageId, ReadWatermark};
use snafu::{OptionExt, ResultExt};
use tokio::sync::{RwLock, broadcast};

use crate::directory::MatchDirectory;
use crate::error::{ConversationNotFoundSnafu, NotParticipantSnafu, SyncResult, TransportSnafu};
use crate::model::{Conversation, ConversationSummary, Message};
use crate::timeline::{Timeline, TimelineCache};

/// Change notifications for the presentation layer. Delivery is best-effort.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    DirectoryChanged,
    ConversationOpened {
        conversation_id: ConversationId,
    },
    MessageSurfaced {
        conversation_id: ConversationId,
        message_id: MessageId,
    },
    ReadMarked {
        conversation_id: ConversationId,
        flipped: u64,
    },
}

/// The conversation currently on screen with its live-rendered timeline.
#[derive(Debug, Clone)]
pub struct ActiveView {
    pub conversation_id: ConversationId,
    pub timeline: Timeline,
}

/// State owned by one authenticated session: timelines, directory and the active view.
///
/// Constructed at login and dropped at logout. Every mutation re-asserts the ordering and
/// dedup rules, so completions may land in any order.
pub struct SessionCache {
    identity: IdentityId,
    store: Arc<dyn ChatStore>,
    timelines: TimelineCache,
    directory: RwLock<MatchDirectory>,
    active: RwLock<Option<ActiveView>>,
    navigation: AtomicU64,
    events: broadcast::Sender<SessionEvent>,
}

impl SessionCache {
    pub fn new(identity: IdentityId, store: Arc<dyn ChatStore>, event_buffer: usize) -> Self {
        let (events, _) = broadcast::channel(event_buffer.max(1));
        Self {
            identity,
            timelines: TimelineCache::new(Arc::clone(&store)),
            store,
            directory: RwLock::new(MatchDirectory::new()),
            active: RwLock::new(None),
            navigation: AtomicU64::new(0),
            events,
        }
    }

    pub fn identity(&self) -> IdentityId {
        self.identity
    }

    pub fn store(&self) -> &Arc<dyn ChatStore> {
        &self.store
    }

    pub fn timelines(&self) -> &TimelineCache {
        &self.timelines
    }

    /// Rebuilds the directory from store aggregates and replaces the cached one wholesale.
    pub async fn reload_directory(&self) -> SyncResult<Vec<ConversationSummary>> {
        let stage = "directory-reload";
        let conversations = self
            .store
            .list_conversations(self.identity)
            .await
            .context(TransportSnafu { stage })?;
        let conversation_ids = conversations.iter().map(|record| record.id).collect();
        let latest = self
            .store
            .latest_messages(conversation_ids)
            .await
            .context(TransportSnafu { stage })?;
        let unread = self
            .store
            .unread_counts(self.identity)
            .await
            .context(TransportSnafu { stage })?;

        let directory = MatchDirectory::from_aggregates(
            conversations.into_iter().map(Conversation::from).collect(),
            latest.into_iter().map(Message::from).collect(),
            &unread,
            self.identity,
        );
        let summaries = directory.summaries().to_vec();
        *self.directory.write().await = directory;

        tracing::debug!(
            identity = %self.identity,
            conversations = summaries.len(),
            "directory reloaded"
        );
        self.emit(SessionEvent::DirectoryChanged);
        Ok(summaries)
    }

    pub async fn directory(&self) -> MatchDirectory {
        self.directory.read().await.clone()
    }

    /// Runs `apply` against the directory and emits `DirectoryChanged` when it reports a change.
    pub async fn update_directory(&self, apply: impl FnOnce(&mut MatchDirectory) -> bool) -> bool {
        let changed = apply(&mut *self.directory.write().await);
        if changed {
            self.emit(SessionEvent::DirectoryChanged);
        }
        changed
    }

    /// Resolves the other participant, preferring the directory and falling back to the store.
    pub async fn resolve_peer(
        &self,
        conversation_id: ConversationId,
        stage: &'static str,
    ) -> SyncResult<IdentityId> {
        if let Some(summary) = self.directory.read().await.get(conversation_id) {
            return Ok(summary.peer_id);
        }

        let record = self
            .store
            .get_conversation(conversation_id)
            .await
            .context(TransportSnafu { stage })?
            .context(ConversationNotFoundSnafu {
                stage,
                conversation_id,
            })?;
        record
            .other_participant(self.identity)
            .context(NotParticipantSnafu {
                stage,
                conversation_id,
            })
    }

    /// Starts a navigation and returns its generation. Older generations lose any race to
    /// install the active view.
    pub fn begin_navigation(&self) -> u64 {
        self.navigation.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Installs `conversation_id` as the active view if `generation` is still the latest
    /// navigation. The view starts from the cached timeline.
    pub async fn activate_if_current(
        &self,
        generation: u64,
        conversation_id: ConversationId,
    ) -> Option<Timeline> {
        let mut active = self.active.write().await;
        if self.navigation.load(Ordering::SeqCst) != generation {
            return None;
        }

        let timeline = self
            .timelines
            .snapshot(conversation_id)
            .await
            .unwrap_or_default();
        *active = Some(ActiveView {
            conversation_id,
            timeline: timeline.clone(),
        });
        drop(active);

        self.emit(SessionEvent::ConversationOpened { conversation_id });
        Some(timeline)
    }

    pub async fn deactivate(&self) -> Option<ConversationId> {
        self.begin_navigation();
        self.active
            .write()
            .await
            .take()
            .map(|view| view.conversation_id)
    }

    pub async fn active_conversation(&self) -> Option<ConversationId> {
        self.active
            .read()
            .await
            .as_ref()
            .map(|view| view.conversation_id)
    }

    pub async fn active_timeline(&self) -> Option<Timeline> {
        self.active
            .read()
            .await
            .as_ref()
            .map(|view| view.timeline.clone())
    }

    /// Appends `message` to the active view when it belongs there. Returns `true` if it was new.
    pub async fn surface(&self, message: &Message) -> bool {
        let surfaced = {
            let mut active = self.active.write().await;
            match active.as_mut() {
                Some(view) if view.conversation_id == message.conversation_id => {
                    view.timeline.append(message.clone())
                }
                _ => false,
            }
        };

        if surfaced {
            self.emit(SessionEvent::MessageSurfaced {
                conversation_id: message.conversation_id,
                message_id: message.id,
            });
        }
        surfaced
    }

    /// Latest message the session knows for `conversation_id`, from the cached timeline or the
    /// directory preview, as a read bound.
    pub async fn read_watermark(&self, conversation_id: ConversationId) -> Option<ReadWatermark> {
        let cached = self
            .timelines
            .latest(conversation_id)
            .await
            .map(|message| message.read_watermark());
        let previewed = self
            .directory
            .read()
            .await
            .get(conversation_id)
            .and_then(|summary| summary.last_message.as_ref())
            .map(Message::read_watermark);
        cached.max(previewed)
    }

    /// Flips cached read flags for the session identity up to `through`, in both the timeline
    /// cache and the active view.
    pub async fn mark_cached_read(
        &self,
        conversation_id: ConversationId,
        through: ReadWatermark,
    ) -> usize {
        let flipped = self
            .timelines
            .mark_read(conversation_id, self.identity, through)
            .await;

        let mut active = self.active.write().await;
        if let Some(view) = active
            .as_mut()
            .filter(|view| view.conversation_id == conversation_id)
        {
            view.timeline.mark_read_for(self.identity, through);
        }
        flipped
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Broadcasts without waiting; having no subscribers is not an error.
    pub fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    pub async fn clear(&self) {
        self.begin_navigation();
        *self.active.write().await = None;
        *self.directory.write().await = MatchDirectory::new();
        self.timelines.clear().await;
    }
}
