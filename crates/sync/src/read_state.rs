use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use futures::future::join_all;
use rapport_storage::{ConversationId, ReadWatermark};
use tokio::task::JoinHandle;

use crate::cache::{SessionCache, SessionEvent};
use crate::config::SettingsStore;

/// Flips read flags for the session identity once a conversation is being viewed.
///
/// Failures here are non-critical: they are logged and the next open retries.
pub struct ReadStateReconciler {
    cache: Arc<SessionCache>,
    settings: Arc<SettingsStore>,
    pending: Mutex<HashMap<ConversationId, JoinHandle<()>>>,
}

impl ReadStateReconciler {
    pub fn new(cache: Arc<SessionCache>, settings: Arc<SettingsStore>) -> Self {
        Self {
            cache,
            settings,
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Marks the messages the session currently knows of as read. Returns how many stored rows
    /// flipped.
    pub async fn mark_read(&self, conversation_id: ConversationId) -> u64 {
        match self.cache.read_watermark(conversation_id).await {
            Some(through) => self.mark_read_through(conversation_id, through).await,
            None => 0,
        }
    }

    /// Marks unread messages addressed to the session identity up to `through` as read, in the
    /// store first and then in the cached timelines and the directory counter.
    ///
    /// Messages ordered after `through` stay unread everywhere, including ones that arrive while
    /// the store update is in flight.
    pub async fn mark_read_through(
        &self,
        conversation_id: ConversationId,
        through: ReadWatermark,
    ) -> u64 {
        let identity = self.cache.identity();
        let flipped = match self
            .cache
            .store()
            .mark_read(conversation_id, identity, through)
            .await
        {
            Ok(flipped) => flipped,
            Err(error) => {
                tracing::warn!(
                    conversation_id = %conversation_id,
                    error = %error,
                    "failed to mark conversation read"
                );
                return 0;
            }
        };

        let cached = self.cache.mark_cached_read(conversation_id, through).await;
        self.cache
            .update_directory(|directory| directory.release_unread(conversation_id, flipped))
            .await;

        if flipped > 0 || cached > 0 {
            tracing::debug!(
                conversation_id = %conversation_id,
                flipped,
                cached,
                "conversation marked read"
            );
            self.cache.emit(SessionEvent::ReadMarked {
                conversation_id,
                flipped,
            });
        }
        flipped
    }

    /// Runs `mark_read_through` after the settle delay. A newer schedule for the same
    /// conversation replaces the pending one.
    pub fn schedule(self: &Arc<Self>, conversation_id: ConversationId, through: ReadWatermark) {
        let delay = self.settings.settings().read_settle_delay();
        let reconciler = Arc::clone(self);
        let handle = tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            reconciler.mark_read_through(conversation_id, through).await;
        });

        let mut pending = self.pending();
        pending.retain(|_, handle| !handle.is_finished());
        if let Some(previous) = pending.insert(conversation_id, handle) {
            previous.abort();
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending()
            .values()
            .filter(|handle| !handle.is_finished())
            .count()
    }

    /// Waits for every scheduled mark to complete.
    pub async fn flush(&self) {
        let handles = self
            .pending()
            .drain()
            .map(|(_, handle)| handle)
            .collect::<Vec<_>>();

        for result in join_all(handles).await {
            if let Err(error) = result
                && error.is_panic()
            {
                tracing::warn!(error = %error, "scheduled read mark panicked");
            }
        }
    }

    fn pending(&self) -> std::sync::MutexGuard<'_, HashMap<ConversationId, JoinHandle<()>>> {
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
