use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use std::time::{SystemTime, UNIX_EPOCH};

use snafu::{OptionExt, ResultExt, ensure};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{FromRow, QueryBuilder, Sqlite, SqlitePool};

use super::error::{
    AlreadyMatchedSnafu, ConversationNotFoundSnafu, CreateSqliteDirectorySnafu,
    ParticipantMismatchSnafu, SelfMatchSnafu, SqliteConnectOptionsSnafu, SqliteConnectSnafu,
    SqliteMigrateSnafu, SqlitePragmaSnafu, SqliteQuerySnafu, StorageError, StorageResult,
};
use super::ids::{ConversationId, IdentityId, MessageId};
use super::types::{ConversationRecord, MessageRecord, NewConversation, NewMessage, ReadWatermark};
use super::{BoxFuture, ConversationStore, MessageStore};

// Keeps `IN (...)` lists far below SQLite's bound-parameter ceiling.
const LATEST_MESSAGE_BATCH_SIZE: usize = 500;

#[derive(Debug, Clone)]
pub struct SqliteStorage {
    pool: SqlitePool,
    database_url: String,
}

impl SqliteStorage {
    pub async fn open(database_location: &str) -> StorageResult<Self> {
        ensure_database_directory(database_location)?;

        let database_url = normalize_database_url(database_location);
        let in_memory = database_url.contains(":memory:");
        let mut connect_options = SqliteConnectOptions::from_str(&database_url)
            .context(SqliteConnectOptionsSnafu {
                stage: "sqlite-open-parse-url",
                database_url: database_url.clone(),
            })?
            .create_if_missing(true)
            .foreign_keys(true)
            .busy_timeout(Duration::from_millis(5_000));
        if !in_memory {
            connect_options = connect_options.journal_mode(SqliteJournalMode::Wal);
        }

        // An in-memory database lives and dies with its only connection, so it must never be recycled.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None::<Duration>)
            .max_lifetime(None::<Duration>)
            .connect_with(connect_options)
            .await
            .context(SqliteConnectSnafu {
                stage: "sqlite-open-connect",
                database_url: database_url.clone(),
            })?;

        sqlx::query("PRAGMA foreign_keys = ON;")
            .execute(&pool)
            .await
            .context(SqlitePragmaSnafu {
                stage: "sqlite-open-pragma-foreign-keys",
                pragma: "foreign_keys",
            })?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context(SqliteMigrateSnafu {
                stage: "sqlite-open-migrate",
            })?;

        tracing::debug!(database_url = %database_url, in_memory, "sqlite storage opened");
        Ok(Self { pool, database_url })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn database_url(&self) -> &str {
        &self.database_url
    }

    /// Inserts a message with an explicit server timestamp.
    ///
    /// Used for fixtures and imports of historical rows; live writes go through
    /// [`MessageStore::insert_message`], which stamps the current time.
    pub async fn insert_message_at(
        &self,
        input: NewMessage,
        created_at_unix_millis: u64,
    ) -> StorageResult<MessageRecord> {
        let created_at = u64_to_i64(created_at_unix_millis, "message-insert-created-at")?;
        self.insert_with_timestamp(input, created_at).await
    }

    async fn insert_with_timestamp(
        &self,
        input: NewMessage,
        created_at: i64,
    ) -> StorageResult<MessageRecord> {
        let mut tx = self.pool.begin().await.context(SqliteQuerySnafu {
            stage: "message-insert-begin",
        })?;

        let conversation = sqlx::query_as::<_, ConversationRow>(
            "SELECT id, participant_low, participant_high, created_at FROM conversations WHERE id = ?",
        )
        .bind(input.conversation_id.to_string())
        .fetch_optional(&mut *tx)
        .await
        .context(SqliteQuerySnafu {
            stage: "message-insert-load-conversation",
        })?
        .context(ConversationNotFoundSnafu {
            stage: "message-insert-conversation-missing",
            conversation_id: input.conversation_id,
        })
        .and_then(conversation_row_to_record)?;

        // Both ends of the write must be exactly the conversation's two participants.
        let receiver_matches =
            conversation.other_participant(input.sender_id) == Some(input.receiver_id);
        ensure!(
            receiver_matches,
            ParticipantMismatchSnafu {
                stage: "message-insert-participants",
                conversation_id: input.conversation_id,
                sender_id: input.sender_id,
                receiver_id: input.receiver_id,
            }
        );

        let message_id = MessageId::new_v7();
        sqlx::query(
            "INSERT INTO messages (id, conversation_id, sender_id, receiver_id, body, created_at, read, read_at) VALUES (?, ?, ?, ?, ?, ?, 0, NULL)",
        )
        .bind(message_id.to_string())
        .bind(input.conversation_id.to_string())
        .bind(input.sender_id.to_string())
        .bind(input.receiver_id.to_string())
        .bind(input.body.as_str())
        .bind(created_at)
        .execute(&mut *tx)
        .await
        .context(SqliteQuerySnafu {
            stage: "message-insert-apply",
        })?;

        tx.commit().await.context(SqliteQuerySnafu {
            stage: "message-insert-commit",
        })?;

        Ok(MessageRecord {
            id: message_id,
            conversation_id: input.conversation_id,
            sender_id: input.sender_id,
            receiver_id: input.receiver_id,
            body: input.body,
            created_at_unix_millis: i64_to_u64(created_at, "message-insert-created-at")?,
            read: false,
        })
    }
}

impl ConversationStore for SqliteStorage {
    fn create_conversation(
        &self,
        input: NewConversation,
    ) -> BoxFuture<'_, StorageResult<ConversationRecord>> {
        Box::pin(async move {
            ensure!(
                input.first != input.second,
                SelfMatchSnafu {
                    stage: "conversation-create-self-pair",
                    identity: input.first,
                }
            );

            let (low, high) = if input.first < input.second {
                (input.first, input.second)
            } else {
                (input.second, input.first)
            };

            let mut tx = self.pool.begin().await.context(SqliteQuerySnafu {
                stage: "conversation-create-begin",
            })?;

            let existing = sqlx::query_scalar::<_, String>(
                "SELECT id FROM conversations WHERE participant_low = ? AND participant_high = ?",
            )
            .bind(low.to_string())
            .bind(high.to_string())
            .fetch_optional(&mut *tx)
            .await
            .context(SqliteQuerySnafu {
                stage: "conversation-create-check-pair",
            })?;

            if let Some(existing_id) = existing {
                return AlreadyMatchedSnafu {
                    stage: "conversation-create-duplicate-pair",
                    existing_id,
                }
                .fail();
            }

            let conversation_id = ConversationId::new_v7();
            let now = unix_timestamp_millis();
            sqlx::query(
                "INSERT INTO conversations (id, participant_low, participant_high, created_at) VALUES (?, ?, ?, ?)",
            )
            .bind(conversation_id.to_string())
            .bind(low.to_string())
            .bind(high.to_string())
            .bind(now)
            .execute(&mut *tx)
            .await
            .context(SqliteQuerySnafu {
                stage: "conversation-create-insert",
            })?;

            tx.commit().await.context(SqliteQuerySnafu {
                stage: "conversation-create-commit",
            })?;

            Ok(ConversationRecord {
                id: conversation_id,
                participant_low: low,
                participant_high: high,
                created_at_unix_millis: i64_to_u64(now, "conversation-create-created-at")?,
            })
        })
    }

    fn list_conversations(
        &self,
        identity: IdentityId,
    ) -> BoxFuture<'_, StorageResult<Vec<ConversationRecord>>> {
        Box::pin(async move {
            let rows = sqlx::query_as::<_, ConversationRow>(
                "SELECT id, participant_low, participant_high, created_at FROM conversations WHERE participant_low = ? OR participant_high = ? ORDER BY created_at DESC, id DESC",
            )
            .bind(identity.to_string())
            .bind(identity.to_string())
            .fetch_all(&self.pool)
            .await
            .context(SqliteQuerySnafu {
                stage: "conversation-list-query",
            })?;

            rows.into_iter().map(conversation_row_to_record).collect()
        })
    }

    fn get_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> BoxFuture<'_, StorageResult<Option<ConversationRecord>>> {
        Box::pin(async move {
            let row = sqlx::query_as::<_, ConversationRow>(
                "SELECT id, participant_low, participant_high, created_at FROM conversations WHERE id = ?",
            )
            .bind(conversation_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .context(SqliteQuerySnafu {
                stage: "conversation-get-query",
            })?;

            row.map(conversation_row_to_record).transpose()
        })
    }
}

impl MessageStore for SqliteStorage {
    fn insert_message(&self, input: NewMessage) -> BoxFuture<'_, StorageResult<MessageRecord>> {
        Box::pin(async move {
            self.insert_with_timestamp(input, unix_timestamp_millis())
                .await
        })
    }

    fn list_messages(
        &self,
        conversation_id: ConversationId,
    ) -> BoxFuture<'_, StorageResult<Vec<MessageRecord>>> {
        Box::pin(async move {
            let rows = sqlx::query_as::<_, MessageRow>(
                "SELECT id, conversation_id, sender_id, receiver_id, body, created_at, read FROM messages WHERE conversation_id = ? ORDER BY created_at ASC, id ASC",
            )
            .bind(conversation_id.to_string())
            .fetch_all(&self.pool)
            .await
            .context(SqliteQuerySnafu {
                stage: "message-list-query",
            })?;

            rows.into_iter().map(message_row_to_record).collect()
        })
    }

    fn unread_counts(
        &self,
        identity: IdentityId,
    ) -> BoxFuture<'_, StorageResult<HashMap<ConversationId, u64>>> {
        Box::pin(async move {
            let rows = sqlx::query_as::<_, (String, i64)>(
                "SELECT conversation_id, COUNT(*) FROM messages WHERE receiver_id = ? AND read = 0 GROUP BY conversation_id",
            )
            .bind(identity.to_string())
            .fetch_all(&self.pool)
            .await
            .context(SqliteQuerySnafu {
                stage: "message-unread-counts-query",
            })?;

            rows.into_iter()
                .map(|(conversation_id, count)| {
                    Ok((
                        ConversationId::parse(&conversation_id)?,
                        i64_to_u64(count, "message-unread-counts-count")?,
                    ))
                })
                .collect()
        })
    }

    fn latest_messages(
        &self,
        conversation_ids: Vec<ConversationId>,
    ) -> BoxFuture<'_, StorageResult<Vec<MessageRecord>>> {
        Box::pin(async move {
            let mut latest = Vec::with_capacity(conversation_ids.len());

            for chunk in conversation_ids.chunks(LATEST_MESSAGE_BATCH_SIZE) {
                let mut builder = QueryBuilder::<Sqlite>::new(
                    "SELECT id, conversation_id, sender_id, receiver_id, body, created_at, read FROM (SELECT m.*, ROW_NUMBER() OVER (PARTITION BY m.conversation_id ORDER BY m.created_at DESC, m.id DESC) AS position FROM messages m WHERE m.conversation_id IN (",
                );
                let mut separated = builder.separated(", ");
                for conversation_id in chunk {
                    separated.push_bind(conversation_id.to_string());
                }
                separated.push_unseparated(")) WHERE position = 1");

                let rows = builder
                    .build_query_as::<MessageRow>()
                    .fetch_all(&self.pool)
                    .await
                    .context(SqliteQuerySnafu {
                        stage: "message-latest-query",
                    })?;

                for row in rows {
                    latest.push(message_row_to_record(row)?);
                }
            }

            Ok(latest)
        })
    }

    fn mark_read(
        &self,
        conversation_id: ConversationId,
        receiver_id: IdentityId,
        through: ReadWatermark,
    ) -> BoxFuture<'_, StorageResult<u64>> {
        Box::pin(async move {
            let through_created_at = u64_to_i64(
                through.created_at_unix_millis,
                "message-mark-read-watermark",
            )?;
            let result = sqlx::query(
                "UPDATE messages SET read = 1, read_at = ? WHERE conversation_id = ? AND receiver_id = ? AND read = 0 AND (created_at < ? OR (created_at = ? AND id <= ?))",
            )
            .bind(unix_timestamp_millis())
            .bind(conversation_id.to_string())
            .bind(receiver_id.to_string())
            .bind(through_created_at)
            .bind(through_created_at)
            .bind(through.message_id.to_string())
            .execute(&self.pool)
            .await
            .context(SqliteQuerySnafu {
                stage: "message-mark-read-apply",
            })?;

            Ok(result.rows_affected())
        })
    }
}

#[derive(Debug, FromRow)]
struct ConversationRow {
    id: String,
    participant_low: String,
    participant_high: String,
    created_at: i64,
}

#[derive(Debug, FromRow)]
struct MessageRow {
    id: String,
    conversation_id: String,
    sender_id: String,
    receiver_id: String,
    body: String,
    created_at: i64,
    read: bool,
}

fn conversation_row_to_record(row: ConversationRow) -> StorageResult<ConversationRecord> {
    Ok(ConversationRecord {
        id: ConversationId::parse(&row.id)?,
        participant_low: IdentityId::parse(&row.participant_low)?,
        participant_high: IdentityId::parse(&row.participant_high)?,
        created_at_unix_millis: i64_to_u64(row.created_at, "conversation-row-created-at")?,
    })
}

fn message_row_to_record(row: MessageRow) -> StorageResult<MessageRecord> {
    Ok(MessageRecord {
        id: MessageId::parse(&row.id)?,
        conversation_id: ConversationId::parse(&row.conversation_id)?,
        sender_id: IdentityId::parse(&row.sender_id)?,
        receiver_id: IdentityId::parse(&row.receiver_id)?,
        body: row.body,
        created_at_unix_millis: i64_to_u64(row.created_at, "message-row-created-at")?,
        read: row.read,
    })
}

fn unix_timestamp_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0_i64, |duration| duration.as_millis() as i64)
}

fn i64_to_u64(value: i64, stage: &'static str) -> StorageResult<u64> {
    value.try_into().map_err(|_| StorageError::InvariantViolation {
        stage,
        details: format!("negative sqlite integer '{value}' cannot map to u64"),
    })
}

fn u64_to_i64(value: u64, stage: &'static str) -> StorageResult<i64> {
    value.try_into().map_err(|_| StorageError::InvariantViolation {
        stage,
        details: format!("u64 '{value}' cannot map to sqlite i64"),
    })
}

fn ensure_database_directory(database_location: &str) -> StorageResult<()> {
    if database_location.starts_with("sqlite:") || database_location == ":memory:" {
        return Ok(());
    }

    let path = Path::new(database_location);
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).context(CreateSqliteDirectorySnafu {
            stage: "sqlite-open-create-directory",
            path: parent.display().to_string(),
        })?;
    }

    Ok(())
}

fn normalize_database_url(database_location: &str) -> String {
    if database_location.starts_with("sqlite:") {
        return database_location.to_string();
    }

    if database_location == ":memory:" {
        return "sqlite::memory:".to_string();
    }

    format!("sqlite://{database_location}")
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn open_memory() -> SqliteStorage {
        SqliteStorage::open(":memory:")
            .await
            .expect("in-memory sqlite should open")
    }

    async fn matched_pair(storage: &SqliteStorage) -> (ConversationRecord, IdentityId, IdentityId) {
        let alice = IdentityId::new_v7();
        let bob = IdentityId::new_v7();
        let conversation = storage
            .create_conversation(NewConversation {
                first: alice,
                second: bob,
            })
            .await
            .expect("conversation should be created");
        (conversation, alice, bob)
    }

    fn message(
        conversation: &ConversationRecord,
        from: IdentityId,
        to: IdentityId,
        body: &str,
    ) -> NewMessage {
        NewMessage {
            conversation_id: conversation.id,
            sender_id: from,
            receiver_id: to,
            body: body.to_string(),
        }
    }

    #[tokio::test]
    async fn pair_is_unordered_and_unique() {
        let storage = open_memory().await;
        let (conversation, alice, bob) = matched_pair(&storage).await;

        assert!(conversation.participant_low < conversation.participant_high);
        assert_eq!(conversation.other_participant(alice), Some(bob));
        assert_eq!(conversation.other_participant(bob), Some(alice));

        let reversed = storage
            .create_conversation(NewConversation {
                first: bob,
                second: alice,
            })
            .await;
        assert!(matches!(reversed, Err(StorageError::AlreadyMatched { .. })));

        let self_pair = storage
            .create_conversation(NewConversation {
                first: alice,
                second: alice,
            })
            .await;
        assert!(matches!(self_pair, Err(StorageError::SelfMatch { .. })));

        assert_eq!(storage.list_conversations(alice).await.unwrap().len(), 1);
        let stranger_conversations = storage
            .list_conversations(IdentityId::new_v7())
            .await
            .unwrap();
        assert!(stranger_conversations.is_empty());
    }

    #[tokio::test]
    async fn insert_rejects_outsiders_and_unknown_conversations() {
        let storage = open_memory().await;
        let (conversation, alice, _bob) = matched_pair(&storage).await;
        let stranger = IdentityId::new_v7();

        let rejected = storage
            .insert_message(message(&conversation, alice, stranger, "hi"))
            .await;
        assert!(matches!(
            rejected,
            Err(StorageError::ParticipantMismatch { .. })
        ));

        let missing = storage
            .insert_message(NewMessage {
                conversation_id: ConversationId::new_v7(),
                sender_id: alice,
                receiver_id: stranger,
                body: "hi".to_string(),
            })
            .await;
        assert!(matches!(
            missing,
            Err(StorageError::ConversationNotFound { .. })
        ));
        assert!(storage.list_messages(conversation.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn messages_list_in_timestamp_order_regardless_of_insert_order() {
        let storage = open_memory().await;
        let (conversation, alice, bob) = matched_pair(&storage).await;

        storage
            .insert_message_at(message(&conversation, alice, bob, "third"), 3_000)
            .await
            .unwrap();
        storage
            .insert_message_at(message(&conversation, bob, alice, "first"), 1_000)
            .await
            .unwrap();
        storage
            .insert_message_at(message(&conversation, alice, bob, "second"), 2_000)
            .await
            .unwrap();

        let bodies = storage
            .list_messages(conversation.id)
            .await
            .unwrap()
            .into_iter()
            .map(|record| record.body)
            .collect::<Vec<_>>();
        assert_eq!(bodies, vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn unread_counts_and_mark_read_are_scoped_to_receiver() {
        let storage = open_memory().await;
        let (conversation, alice, bob) = matched_pair(&storage).await;

        for body in ["a", "b", "c"] {
            storage
                .insert_message(message(&conversation, alice, bob, body))
                .await
                .unwrap();
        }
        let reply = storage
            .insert_message(message(&conversation, bob, alice, "reply"))
            .await
            .unwrap();
        let everything = ReadWatermark {
            created_at_unix_millis: reply.created_at_unix_millis,
            message_id: reply.id,
        };

        let bob_counts = storage.unread_counts(bob).await.unwrap();
        assert_eq!(bob_counts.get(&conversation.id), Some(&3));
        let alice_counts = storage.unread_counts(alice).await.unwrap();
        assert_eq!(alice_counts.get(&conversation.id), Some(&1));

        assert_eq!(
            storage
                .mark_read(conversation.id, bob, everything)
                .await
                .unwrap(),
            3
        );
        assert_eq!(
            storage
                .mark_read(conversation.id, bob, everything)
                .await
                .unwrap(),
            0
        );
        assert!(storage.unread_counts(bob).await.unwrap().is_empty());
        assert_eq!(
            storage.unread_counts(alice).await.unwrap().get(&conversation.id),
            Some(&1)
        );
    }

    #[tokio::test]
    async fn mark_read_stops_at_the_watermark() {
        let storage = open_memory().await;
        let (conversation, alice, bob) = matched_pair(&storage).await;

        let mut seen = Vec::new();
        for created_at in [1_000, 2_000, 2_000] {
            seen.push(
                storage
                    .insert_message_at(message(&conversation, alice, bob, "seen"), created_at)
                    .await
                    .unwrap(),
            );
        }
        seen.sort_by_key(|record| (record.created_at_unix_millis, record.id));
        let last_seen = seen.last().unwrap();
        let through = ReadWatermark {
            created_at_unix_millis: last_seen.created_at_unix_millis,
            message_id: last_seen.id,
        };
        let late = storage
            .insert_message_at(message(&conversation, alice, bob, "late"), 3_000)
            .await
            .unwrap();

        assert_eq!(storage.mark_read(conversation.id, bob, through).await.unwrap(), 3);
        let unread = storage
            .list_messages(conversation.id)
            .await
            .unwrap()
            .into_iter()
            .filter(|record| !record.read)
            .map(|record| record.id)
            .collect::<Vec<_>>();
        assert_eq!(unread, vec![late.id]);
        assert!(through.covers(last_seen.created_at_unix_millis, last_seen.id));
        assert!(!through.covers(late.created_at_unix_millis, late.id));
    }

    #[tokio::test]
    async fn latest_messages_returns_one_row_per_conversation() {
        let storage = open_memory().await;
        let (first, alice, bob) = matched_pair(&storage).await;
        let carol = IdentityId::new_v7();
        let second = storage
            .create_conversation(NewConversation {
                first: alice,
                second: carol,
            })
            .await
            .unwrap();
        let silent = storage
            .create_conversation(NewConversation {
                first: bob,
                second: carol,
            })
            .await
            .unwrap();

        storage
            .insert_message_at(message(&first, alice, bob, "old"), 1_000)
            .await
            .unwrap();
        storage
            .insert_message_at(message(&first, bob, alice, "new"), 5_000)
            .await
            .unwrap();
        storage
            .insert_message_at(message(&second, carol, alice, "only"), 2_000)
            .await
            .unwrap();

        let mut latest = storage
            .latest_messages(vec![first.id, second.id, silent.id])
            .await
            .unwrap();
        latest.sort_by_key(|record| record.created_at_unix_millis);

        assert_eq!(latest.len(), 2);
        assert_eq!(latest[0].body, "only");
        assert_eq!(latest[1].body, "new");
        assert!(storage.latest_messages(Vec::new()).await.unwrap().is_empty());
    }
}
