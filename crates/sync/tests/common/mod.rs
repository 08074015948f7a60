#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use rapport_storage::{
    BoxFuture, ConversationId, ConversationRecord, ConversationStore, IdentityId, MessageId,
    MessageRecord, MessageStore, NewConversation, NewMessage, ReadWatermark, SqliteStorage,
    StorageError, StorageResult,
};
use rapport_sync::{
    ChatSession, Collaborators, Message, PresenceHub, SessionEvent, SettingsStore, StaticProfiles,
    SyncSettings,
};
use tokio::sync::{Notify, broadcast};

/// SQLite store that counts write attempts and can simulate an outage.
pub struct CountingStore {
    inner: SqliteStorage,
    insert_attempts: AtomicUsize,
    mark_read_attempts: AtomicUsize,
    fail_writes: AtomicBool,
    fail_reads: AtomicBool,
    hold_mark_read: AtomicBool,
    mark_read_applied: Notify,
    mark_read_release: Notify,
}

impl CountingStore {
    pub async fn open_memory() -> Self {
        Self {
            inner: SqliteStorage::open(":memory:")
                .await
                .expect("in-memory sqlite should open"),
            insert_attempts: AtomicUsize::new(0),
            mark_read_attempts: AtomicUsize::new(0),
            fail_writes: AtomicBool::new(false),
            fail_reads: AtomicBool::new(false),
            hold_mark_read: AtomicBool::new(false),
            mark_read_applied: Notify::new(),
            mark_read_release: Notify::new(),
        }
    }

    pub fn inner(&self) -> &SqliteStorage {
        &self.inner
    }

    pub fn insert_attempts(&self) -> usize {
        self.insert_attempts.load(Ordering::SeqCst)
    }

    pub fn mark_read_attempts(&self) -> usize {
        self.mark_read_attempts.load(Ordering::SeqCst)
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// While held, `mark_read` applies its update and then parks until released.
    pub fn hold_mark_read(&self, hold: bool) {
        self.hold_mark_read.store(hold, Ordering::SeqCst);
    }

    pub async fn mark_read_applied(&self) {
        self.mark_read_applied.notified().await;
    }

    pub fn release_mark_read(&self) {
        self.mark_read_release.notify_one();
    }

    fn outage(stage: &'static str) -> StorageError {
        StorageError::InvariantViolation {
            stage,
            details: "simulated store outage".to_string(),
        }
    }
}

impl ConversationStore for CountingStore {
    fn create_conversation(
        &self,
        input: NewConversation,
    ) -> BoxFuture<'_, StorageResult<ConversationRecord>> {
        self.inner.create_conversation(input)
    }

    fn list_conversations(
        &self,
        identity: IdentityId,
    ) -> BoxFuture<'_, StorageResult<Vec<ConversationRecord>>> {
        self.inner.list_conversations(identity)
    }

    fn get_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> BoxFuture<'_, StorageResult<Option<ConversationRecord>>> {
        self.inner.get_conversation(conversation_id)
    }
}

impl MessageStore for CountingStore {
    fn insert_message(&self, input: NewMessage) -> BoxFuture<'_, StorageResult<MessageRecord>> {
        Box::pin(async move {
            self.insert_attempts.fetch_add(1, Ordering::SeqCst);
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(Self::outage("counting-store-insert"));
            }
            self.inner.insert_message(input).await
        })
    }

    fn list_messages(
        &self,
        conversation_id: ConversationId,
    ) -> BoxFuture<'_, StorageResult<Vec<MessageRecord>>> {
        Box::pin(async move {
            if self.fail_reads.load(Ordering::SeqCst) {
                return Err(Self::outage("counting-store-list-messages"));
            }
            self.inner.list_messages(conversation_id).await
        })
    }

    fn unread_counts(
        &self,
        identity: IdentityId,
    ) -> BoxFuture<'_, StorageResult<HashMap<ConversationId, u64>>> {
        self.inner.unread_counts(identity)
    }

    fn latest_messages(
        &self,
        conversation_ids: Vec<ConversationId>,
    ) -> BoxFuture<'_, StorageResult<Vec<MessageRecord>>> {
        self.inner.latest_messages(conversation_ids)
    }

    fn mark_read(
        &self,
        conversation_id: ConversationId,
        receiver_id: IdentityId,
        through: ReadWatermark,
    ) -> BoxFuture<'_, StorageResult<u64>> {
        Box::pin(async move {
            self.mark_read_attempts.fetch_add(1, Ordering::SeqCst);
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(Self::outage("counting-store-mark-read"));
            }
            let flipped = self
                .inner
                .mark_read(conversation_id, receiver_id, through)
                .await?;
            if self.hold_mark_read.load(Ordering::SeqCst) {
                self.mark_read_applied.notify_one();
                self.mark_read_release.notified().await;
            }
            Ok(flipped)
        })
    }
}

/// Alice and Bob matched in one conversation over a shared in-memory store.
pub struct Harness {
    pub store: Arc<CountingStore>,
    pub conversation: ConversationRecord,
    pub alice: IdentityId,
    pub bob: IdentityId,
    pub settings: Arc<SettingsStore>,
    pub presence: Arc<PresenceHub>,
    pub profiles: Arc<StaticProfiles>,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_settings(test_settings()).await
    }

    pub async fn with_settings(settings: SyncSettings) -> Self {
        let store = Arc::new(CountingStore::open_memory().await);
        let alice = IdentityId::new_v7();
        let bob = IdentityId::new_v7();
        let conversation = store
            .create_conversation(NewConversation {
                first: alice,
                second: bob,
            })
            .await
            .expect("conversation should be created");

        Self {
            store,
            conversation,
            alice,
            bob,
            settings: Arc::new(SettingsStore::from_settings(settings)),
            presence: PresenceHub::new(),
            profiles: Arc::new(StaticProfiles::new()),
        }
    }

    pub fn conversation_id(&self) -> ConversationId {
        self.conversation.id
    }

    pub async fn login(&self, identity: IdentityId) -> ChatSession {
        ChatSession::login(
            identity,
            Collaborators {
                store: self.store.clone(),
                presence: Arc::new(self.presence.handle(identity)),
                profiles: self.profiles.clone(),
            },
            Arc::clone(&self.settings),
        )
        .await
        .expect("login")
    }

    pub async fn match_with(&self, identity: IdentityId) -> ConversationRecord {
        self.store
            .create_conversation(NewConversation {
                first: identity,
                second: IdentityId::new_v7(),
            })
            .await
            .expect("conversation should be created")
    }

    pub async fn seed(
        &self,
        from: IdentityId,
        to: IdentityId,
        body: &str,
        created_at_unix_millis: u64,
    ) -> Message {
        self.seed_into(self.conversation.id, from, to, body, created_at_unix_millis)
            .await
    }

    pub async fn seed_into(
        &self,
        conversation_id: ConversationId,
        from: IdentityId,
        to: IdentityId,
        body: &str,
        created_at_unix_millis: u64,
    ) -> Message {
        let record = self
            .store
            .inner()
            .insert_message_at(
                NewMessage {
                    conversation_id,
                    sender_id: from,
                    receiver_id: to,
                    body: body.to_string(),
                },
                created_at_unix_millis,
            )
            .await
            .expect("seed message");
        Message::from(record)
    }

    /// Unsaved message from Alice to Bob, as the push channel would announce it.
    pub fn inbound(&self, body: &str, created_at_unix_millis: u64) -> Message {
        Message {
            id: MessageId::new_v7(),
            conversation_id: self.conversation.id,
            sender_id: self.alice,
            receiver_id: self.bob,
            body: body.to_string(),
            created_at_unix_millis,
            read: false,
        }
    }

    pub async fn unread_rows_for(&self, identity: IdentityId) -> u64 {
        self.store
            .inner()
            .unread_counts(identity)
            .await
            .expect("unread counts")
            .get(&self.conversation.id)
            .copied()
            .unwrap_or(0)
    }

    pub async fn rows(&self) -> Vec<Message> {
        self.store
            .inner()
            .list_messages(self.conversation.id)
            .await
            .expect("list messages")
            .into_iter()
            .map(Message::from)
            .collect()
    }
}

pub fn test_settings() -> SyncSettings {
    SyncSettings {
        read_settle_delay_ms: 0,
        ..SyncSettings::default()
    }
}

/// Fresh unread message that only exists on the push channel.
pub fn live_message(template: &Message, body: &str, created_at_unix_millis: u64) -> Message {
    Message {
        id: MessageId::new_v7(),
        body: body.to_string(),
        created_at_unix_millis,
        read: false,
        ..template.clone()
    }
}

pub fn assert_strictly_ordered(messages: &[Message]) {
    let keys = messages
        .iter()
        .map(Message::timeline_key)
        .collect::<Vec<_>>();
    assert!(
        keys.windows(2).all(|pair| pair[0] < pair[1]),
        "timeline out of order or duplicated: {keys:?}"
    );
}

pub async fn wait_for(
    events: &mut broadcast::Receiver<SessionEvent>,
    mut matches: impl FnMut(&SessionEvent) -> bool,
) {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Ok(event) if matches(&event) => return,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("session events closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for session event");
}
