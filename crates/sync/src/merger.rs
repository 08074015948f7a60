use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::cache::SessionCache;
use crate::model::{Message, PushEvent};
use crate::read_state::ReadStateReconciler;

/// What one live event did to session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// Neither sender nor receiver is the session identity.
    Discarded,
    /// Every view already held the message.
    Duplicate,
    Merged {
        surfaced: bool,
        directory_changed: bool,
        read_scheduled: bool,
    },
}

/// Routes push-delivered messages into the timeline cache, the active view and the directory.
pub struct LiveEventMerger {
    cache: Arc<SessionCache>,
    reconciler: Arc<ReadStateReconciler>,
}

impl LiveEventMerger {
    pub fn new(cache: Arc<SessionCache>, reconciler: Arc<ReadStateReconciler>) -> Self {
        Self { cache, reconciler }
    }

    pub async fn apply(&self, message: Message) -> MergeOutcome {
        let identity = self.cache.identity();
        if !message.involves(identity) {
            tracing::debug!(
                conversation_id = %message.conversation_id,
                message_id = %message.id,
                "discarding live event for another identity"
            );
            return MergeOutcome::Discarded;
        }

        let appended = self.cache.timelines().append(message.clone()).await;
        let active = self.cache.active_conversation().await;
        let is_open = active == Some(message.conversation_id);
        let received = message.receiver_id == identity;

        let mut surfaced = false;
        let mut read_scheduled = false;
        if is_open {
            surfaced = self.cache.surface(&message).await;
            if surfaced
                && received
                && let Some(through) = self.cache.read_watermark(message.conversation_id).await
            {
                self.reconciler.schedule(message.conversation_id, through);
                read_scheduled = true;
            }
        }

        // An open conversation still gets a fresh preview; `active` keeps its counter at zero.
        let directory_changed = self
            .cache
            .update_directory(|directory| {
                if received {
                    directory.apply_incoming(&message, appended, active, identity)
                } else {
                    directory.apply_outgoing(&message, identity)
                }
            })
            .await;

        if !appended && !surfaced && !directory_changed {
            return MergeOutcome::Duplicate;
        }
        MergeOutcome::Merged {
            surfaced,
            directory_changed,
            read_scheduled,
        }
    }

    /// Decodes and applies one raw push frame. Malformed frames are logged and dropped.
    pub async fn apply_frame(&self, raw: &str) -> Option<MergeOutcome> {
        match PushEvent::from_json(raw).and_then(PushEvent::into_message) {
            Ok(message) => Some(self.apply(message).await),
            Err(error) => {
                tracing::warn!(error = %error, "dropping malformed push frame");
                None
            }
        }
    }
}

#[derive(Debug)]
enum LiveFrame {
    Event(Message),
    Raw(String),
}

/// Producer half of the push channel. The transport feeds frames in; cloning is cheap.
#[derive(Debug, Clone)]
pub struct LiveFeed {
    frames: mpsc::UnboundedSender<LiveFrame>,
}

impl LiveFeed {
    /// Returns `false` once the session has stopped listening.
    pub fn push(&self, message: Message) -> bool {
        self.frames.send(LiveFrame::Event(message)).is_ok()
    }

    pub fn push_json(&self, raw: impl Into<String>) -> bool {
        self.frames.send(LiveFrame::Raw(raw.into())).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.frames.is_closed()
    }
}

/// Consumer half: the task draining the push channel into the merger.
pub struct LiveSubscription {
    cancel_tx: Option<oneshot::Sender<()>>,
    worker: Option<JoinHandle<()>>,
}

impl LiveSubscription {
    pub fn spawn(merger: Arc<LiveEventMerger>) -> (LiveFeed, Self) {
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let (cancel_tx, cancel_rx) = oneshot::channel();
        let worker = tokio::spawn(run_live_worker(merger, frames_rx, cancel_rx));
        (
            LiveFeed { frames: frames_tx },
            Self {
                cancel_tx: Some(cancel_tx),
                worker: Some(worker),
            },
        )
    }

    pub fn is_running(&self) -> bool {
        self.worker
            .as_ref()
            .is_some_and(|worker| !worker.is_finished())
    }

    /// Stops the worker and waits for the frame it is merging, if any, to finish.
    pub async fn close(mut self) {
        if let Some(cancel_tx) = self.cancel_tx.take() {
            let _ = cancel_tx.send(());
        }
        if let Some(worker) = self.worker.take()
            && let Err(error) = worker.await
        {
            tracing::warn!(error = %error, "live worker ended abnormally");
        }
    }
}

impl Drop for LiveSubscription {
    fn drop(&mut self) {
        if let Some(cancel_tx) = self.cancel_tx.take() {
            let _ = cancel_tx.send(());
        }
    }
}

async fn run_live_worker(
    merger: Arc<LiveEventMerger>,
    mut frames_rx: mpsc::UnboundedReceiver<LiveFrame>,
    mut cancel_rx: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = &mut cancel_rx => {
                tracing::debug!("live subscription cancelled");
                break;
            }
            frame = frames_rx.recv() => {
                match frame {
                    Some(LiveFrame::Event(message)) => {
                        merger.apply(message).await;
                    }
                    Some(LiveFrame::Raw(raw)) => {
                        merger.apply_frame(&raw).await;
                    }
                    None => {
                        // Degraded channel: the next open reloads from the store.
                        tracing::info!("push channel closed; falling back to reload on open");
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use rapport_storage::{ConversationStore, IdentityId, MessageId, NewConversation, SqliteStorage};

    use super::*;
    use crate::config::{SettingsStore, SyncSettings};

    struct Fixture {
        merger: Arc<LiveEventMerger>,
        cache: Arc<SessionCache>,
        template: Message,
    }

    async fn fixture() -> Fixture {
        let storage = Arc::new(
            SqliteStorage::open(":memory:")
                .await
                .expect("in-memory sqlite should open"),
        );
        let me = IdentityId::new_v7();
        let peer = IdentityId::new_v7();
        let conversation = storage
            .create_conversation(NewConversation {
                first: me,
                second: peer,
            })
            .await
            .expect("conversation should be created");

        let cache = Arc::new(SessionCache::new(me, storage, 16));
        cache.reload_directory().await.expect("directory reload");
        let settings = Arc::new(SettingsStore::from_settings(SyncSettings {
            read_settle_delay_ms: 0,
            ..SyncSettings::default()
        }));
        let reconciler = Arc::new(ReadStateReconciler::new(Arc::clone(&cache), settings));
        Fixture {
            merger: Arc::new(LiveEventMerger::new(Arc::clone(&cache), reconciler)),
            cache,
            template: Message {
                id: MessageId::new_v7(),
                conversation_id: conversation.id,
                sender_id: peer,
                receiver_id: me,
                body: "hello".to_string(),
                created_at_unix_millis: 1_000,
                read: false,
            },
        }
    }

    #[tokio::test]
    async fn foreign_events_touch_nothing() {
        let fixture = fixture().await;
        let foreign = Message {
            sender_id: IdentityId::new_v7(),
            receiver_id: IdentityId::new_v7(),
            ..fixture.template.clone()
        };

        assert_eq!(fixture.merger.apply(foreign).await, MergeOutcome::Discarded);
        assert!(
            fixture
                .cache
                .timelines()
                .snapshot(fixture.template.conversation_id)
                .await
                .is_none()
        );
    }

    #[tokio::test]
    async fn malformed_frames_are_dropped() {
        let fixture = fixture().await;
        assert_eq!(fixture.merger.apply_frame("not json").await, None);

        let mut frame = PushEvent::from(&fixture.template);
        frame.sender_id = "not-a-uuid".to_string();
        let raw = frame.to_json().expect("encode frame");
        assert_eq!(fixture.merger.apply_frame(&raw).await, None);

        let raw = PushEvent::from(&fixture.template)
            .to_json()
            .expect("encode frame");
        assert!(matches!(
            fixture.merger.apply_frame(&raw).await,
            Some(MergeOutcome::Merged {
                surfaced: false,
                directory_changed: true,
                read_scheduled: false,
            })
        ));
    }

    #[tokio::test]
    async fn dropping_the_subscription_stops_the_worker() {
        let fixture = fixture().await;
        let (feed, subscription) = LiveSubscription::spawn(Arc::clone(&fixture.merger));
        assert!(subscription.is_running());

        drop(subscription);
        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            while !feed.is_closed() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("worker should stop after cancel");
        assert!(!feed.push(fixture.template.clone()));
    }
}
