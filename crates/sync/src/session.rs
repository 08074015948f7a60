use std::collections::HashSet;
use std::sync::Arc;

use rapport_storage::{ChatStore, ConversationId, IdentityId};
use tokio::sync::{Mutex, broadcast};

use crate::cache::{SessionCache, SessionEvent};
use crate::config::{SettingsStore, SyncSettings};
use crate::directory::MatchDirectory;
use crate::error::SyncResult;
use crate::merger::{LiveEventMerger, LiveFeed, LiveSubscription, MergeOutcome};
use crate::model::{ConversationEntry, ConversationSummary, Message};
use crate::presence::{Presence, ProfileDirectory};
use crate::read_state::ReadStateReconciler;
use crate::send::SendPipeline;
use crate::timeline::Timeline;
use crate::typing::TypingCoordinator;

/// External services a session talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub store: Arc<dyn ChatStore>,
    pub presence: Arc<dyn Presence>,
    pub profiles: Arc<dyn ProfileDirectory>,
}

/// Everything the presentation layer needs for one signed-in identity.
///
/// Built by [`ChatSession::login`] and torn down by [`ChatSession::shutdown`]. All state is
/// scoped to this value; nothing is process-global.
pub struct ChatSession {
    cache: Arc<SessionCache>,
    settings: Arc<SettingsStore>,
    pipeline: SendPipeline,
    reconciler: Arc<ReadStateReconciler>,
    merger: Arc<LiveEventMerger>,
    typing: Arc<TypingCoordinator>,
    presence: Arc<dyn Presence>,
    profiles: Arc<dyn ProfileDirectory>,
    live: Mutex<Option<LiveSubscription>>,
}

impl ChatSession {
    /// Builds the session and performs the first directory reload.
    pub async fn login(
        identity: IdentityId,
        collaborators: Collaborators,
        settings: Arc<SettingsStore>,
    ) -> SyncResult<Self> {
        let Collaborators {
            store,
            presence,
            profiles,
        } = collaborators;
        let event_buffer = settings.settings().event_buffer;

        let cache = Arc::new(SessionCache::new(identity, store, event_buffer));
        let reconciler = Arc::new(ReadStateReconciler::new(
            Arc::clone(&cache),
            Arc::clone(&settings),
        ));
        let merger = Arc::new(LiveEventMerger::new(
            Arc::clone(&cache),
            Arc::clone(&reconciler),
        ));
        let session = Self {
            pipeline: SendPipeline::new(Arc::clone(&cache), Arc::clone(&settings)),
            typing: Arc::new(TypingCoordinator::new(Arc::clone(&presence))),
            cache,
            settings,
            reconciler,
            merger,
            presence,
            profiles,
            live: Mutex::new(None),
        };

        let summaries = session.cache.reload_directory().await?;
        tracing::info!(
            identity = %identity,
            conversations = summaries.len(),
            "chat session started"
        );
        Ok(session)
    }

    pub fn identity(&self) -> IdentityId {
        self.cache.identity()
    }

    pub fn settings(&self) -> Arc<SyncSettings> {
        self.settings.settings()
    }

    pub async fn reload_directory(&self) -> SyncResult<Vec<ConversationSummary>> {
        self.cache.reload_directory().await
    }

    pub async fn directory(&self) -> MatchDirectory {
        self.cache.directory().await
    }

    /// Directory rows enriched with peer profiles from one batched lookup.
    ///
    /// A failed lookup is logged and the rows come back without profiles.
    pub async fn list_conversations(&self) -> Vec<ConversationEntry> {
        let summaries = self.cache.directory().await.summaries().to_vec();
        let mut peers = summaries
            .iter()
            .map(|summary| summary.peer_id)
            .collect::<Vec<_>>();
        peers.sort();
        peers.dedup();

        let mut profiles = if peers.is_empty() {
            Default::default()
        } else {
            match self.profiles.resolve(peers).await {
                Ok(profiles) => profiles,
                Err(error) => {
                    tracing::warn!(error = %error, "profile resolution failed");
                    Default::default()
                }
            }
        };

        summaries
            .into_iter()
            .map(|summary| ConversationEntry {
                profile: profiles.remove(&summary.peer_id),
                summary,
            })
            .collect()
    }

    /// Loads the authoritative timeline, makes it the active view and schedules a read mark.
    ///
    /// If another navigation started while loading, the result is cached but the active view
    /// is left to the newer navigation.
    pub async fn open_conversation(&self, conversation_id: ConversationId) -> SyncResult<Timeline> {
        self.cache
            .resolve_peer(conversation_id, "open-conversation")
            .await?;
        let generation = self.cache.begin_navigation();
        let loaded = self.cache.timelines().load(conversation_id).await?;

        match self
            .cache
            .activate_if_current(generation, conversation_id)
            .await
        {
            Some(timeline) => {
                tracing::debug!(
                    conversation_id = %conversation_id,
                    messages = timeline.len(),
                    "conversation opened"
                );
                if let Some(through) = timeline.latest().map(Message::read_watermark) {
                    self.reconciler.schedule(conversation_id, through);
                }
                Ok(timeline)
            }
            None => {
                tracing::debug!(
                    conversation_id = %conversation_id,
                    "navigation superseded while loading"
                );
                Ok(loaded)
            }
        }
    }

    pub async fn close_conversation(&self) {
        if let Some(conversation_id) = self.cache.deactivate().await {
            self.typing.stop(conversation_id);
        }
    }

    pub async fn active_conversation(&self) -> Option<ConversationId> {
        self.cache.active_conversation().await
    }

    pub async fn active_timeline(&self) -> Option<Timeline> {
        self.cache.active_timeline().await
    }

    /// Sends `body` and, once confirmed, lowers this session's typing signal.
    pub async fn send_message(
        &self,
        conversation_id: ConversationId,
        body: &str,
    ) -> SyncResult<Message> {
        let message = self.pipeline.send(conversation_id, body).await?;
        self.typing.stop(conversation_id);
        Ok(message)
    }

    pub async fn mark_read(&self, conversation_id: ConversationId) -> u64 {
        self.reconciler.mark_read(conversation_id).await
    }

    /// Merges one already-decoded live event, bypassing the push channel.
    pub async fn apply_live(&self, message: Message) -> MergeOutcome {
        self.merger.apply(message).await
    }

    pub fn on_input_changed(&self, conversation_id: ConversationId, input: &str) {
        let idle = self.settings.settings().typing_idle();
        self.typing.on_input_changed(conversation_id, input, idle);
    }

    pub fn is_typing(&self, conversation_id: ConversationId) -> bool {
        self.typing.is_typing(conversation_id)
    }

    pub fn is_online(&self, identity: IdentityId) -> bool {
        self.presence.is_online(identity)
    }

    pub fn last_seen_text(&self, identity: IdentityId) -> String {
        self.presence.last_seen_text(identity)
    }

    /// Peers currently typing in `conversation_id`; the session identity is never included.
    pub fn typing_users(&self, conversation_id: ConversationId) -> HashSet<IdentityId> {
        let identity = self.identity();
        let mut users = self.presence.typing_users(conversation_id);
        users.remove(&identity);
        users
    }

    /// Opens the push channel. A previous subscription is closed first.
    pub async fn subscribe_live(&self) -> LiveFeed {
        let (feed, subscription) = LiveSubscription::spawn(Arc::clone(&self.merger));
        let previous = self.live.lock().await.replace(subscription);
        if let Some(previous) = previous {
            previous.close().await;
        }
        tracing::debug!(identity = %self.identity(), "live subscription opened");
        feed
    }

    pub async fn is_live(&self) -> bool {
        self.live
            .lock()
            .await
            .as_ref()
            .is_some_and(LiveSubscription::is_running)
    }

    pub fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.cache.subscribe()
    }

    pub fn pending_read_marks(&self) -> usize {
        self.reconciler.pending_count()
    }

    pub async fn flush_read_marks(&self) {
        self.reconciler.flush().await;
    }

    /// Closes the push channel, lowers typing signals, completes scheduled read marks and drops
    /// all cached state.
    pub async fn shutdown(self) {
        let identity = self.identity();
        let subscription = self.live.lock().await.take();
        if let Some(subscription) = subscription {
            subscription.close().await;
        }
        self.typing.stop_all();
        self.reconciler.flush().await;
        self.cache.clear().await;
        tracing::info!(identity = %identity, "chat session closed");
    }
}
