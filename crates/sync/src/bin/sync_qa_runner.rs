use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use snafu::{OptionExt, ResultExt, Snafu};
use tracing_subscriber::EnvFilter;

use rapport_storage::{
    ConversationRecord, ConversationStore, IdentityId, MessageId, MessageStore, NewConversation,
    NewMessage, SqliteStorage, StorageError,
};
use rapport_sync::{
    ChatSession, Collaborators, Message, PresenceHub, SessionEvent, SettingsStore, StaticProfiles,
    SyncError, SyncSettings, ValidationReason,
};

const IN_MEMORY_DATABASE: &str = ":memory:";
const CONFIGURED_DATABASE: &str = "configured";
// 2024-01-01T10:00:00Z
const TEN_O_CLOCK_UNIX_MILLIS: u64 = 1_704_103_200_000;
const MINUTE_MILLIS: u64 = 60_000;

#[derive(Debug, Clone)]
struct RunnerArgs {
    scenario: Scenario,
    database: DatabaseChoice,
    config_path: Option<PathBuf>,
}

/// Where scenario fixtures keep their rows.
#[derive(Debug, Clone, PartialEq, Eq)]
enum DatabaseChoice {
    InMemory,
    /// The `database_path` of the loaded settings.
    Configured,
    Path(String),
}

impl DatabaseChoice {
    fn parse(raw: String) -> Self {
        if raw == IN_MEMORY_DATABASE {
            Self::InMemory
        } else if raw == CONFIGURED_DATABASE {
            Self::Configured
        } else {
            Self::Path(raw)
        }
    }

    fn resolve(&self, settings: &SyncSettings) -> String {
        match self {
            Self::InMemory => IN_MEMORY_DATABASE.to_string(),
            Self::Configured => settings.database_path.clone(),
            Self::Path(path) => path.clone(),
        }
    }
}

/// Resolved inputs shared by every scenario of one run.
struct RunContext {
    db_path: String,
    settings: SyncSettings,
}

#[derive(Debug, Clone, Copy)]
enum Scenario {
    LoadOrdered,
    LiveDedup,
    BlankSend,
    UnreadIncrement,
    OpenMarksRead,
    RateLimit,
    All,
}

impl Scenario {
    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "load_ordered" => Some(Self::LoadOrdered),
            "live_dedup" => Some(Self::LiveDedup),
            "blank_send" => Some(Self::BlankSend),
            "unread_increment" => Some(Self::UnreadIncrement),
            "open_marks_read" => Some(Self::OpenMarksRead),
            "rate_limit" => Some(Self::RateLimit),
            "all" => Some(Self::All),
            _ => None,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Self::LoadOrdered => "load_ordered",
            Self::LiveDedup => "live_dedup",
            Self::BlankSend => "blank_send",
            Self::UnreadIncrement => "unread_increment",
            Self::OpenMarksRead => "open_marks_read",
            Self::RateLimit => "rate_limit",
            Self::All => "all",
        }
    }
}

#[derive(Debug, Snafu)]
enum RunnerError {
    #[snafu(display("missing required --scenario argument"))]
    MissingScenario { stage: &'static str },
    #[snafu(display("missing value for argument '{arg}'"))]
    MissingArgumentValue {
        stage: &'static str,
        arg: &'static str,
    },
    #[snafu(display("unknown scenario '{raw}'"))]
    UnknownScenario { stage: &'static str, raw: String },
    #[snafu(display("unknown argument '{raw}'"))]
    UnknownArgument { stage: &'static str, raw: String },
    #[snafu(display("storage operation failed on `{stage}`: {source}"))]
    Storage {
        stage: &'static str,
        source: StorageError,
    },
    #[snafu(display("sync operation failed on `{stage}`: {source}"))]
    Sync {
        stage: &'static str,
        source: SyncError,
    },
    #[snafu(display("scenario '{scenario}' failed: {reason}"))]
    ScenarioFailed {
        stage: &'static str,
        scenario: &'static str,
        reason: String,
    },
}

type RunnerResult<T> = Result<T, RunnerError>;

/// Two identities matched in one conversation, each with its own session.
struct Fixture {
    storage: Arc<SqliteStorage>,
    conversation: ConversationRecord,
    alice: IdentityId,
    bob: IdentityId,
    settings: Arc<SettingsStore>,
    presence: Arc<PresenceHub>,
}

impl Fixture {
    async fn new(context: &RunContext) -> RunnerResult<Self> {
        let storage = SqliteStorage::open(&context.db_path)
            .await
            .context(StorageSnafu {
                stage: "fixture-open-storage",
            })?;
        let storage = Arc::new(storage);
        let alice = IdentityId::new_v7();
        let bob = IdentityId::new_v7();
        let conversation = storage
            .create_conversation(NewConversation {
                first: alice,
                second: bob,
            })
            .await
            .context(StorageSnafu {
                stage: "fixture-create-conversation",
            })?;

        Ok(Self {
            storage,
            conversation,
            alice,
            bob,
            settings: Arc::new(SettingsStore::from_settings(context.settings.clone())),
            presence: PresenceHub::new(),
        })
    }

    async fn login(&self, identity: IdentityId) -> RunnerResult<ChatSession> {
        ChatSession::login(
            identity,
            Collaborators {
                store: self.storage.clone(),
                presence: Arc::new(self.presence.handle(identity)),
                profiles: Arc::new(StaticProfiles::new()),
            },
            Arc::clone(&self.settings),
        )
        .await
        .context(SyncSnafu {
            stage: "fixture-login",
        })
    }

    async fn seed(
        &self,
        from: IdentityId,
        to: IdentityId,
        body: &str,
        created_at_unix_millis: u64,
    ) -> RunnerResult<Message> {
        let record = self
            .storage
            .insert_message_at(
                NewMessage {
                    conversation_id: self.conversation.id,
                    sender_id: from,
                    receiver_id: to,
                    body: body.to_string(),
                },
                created_at_unix_millis,
            )
            .await
            .context(StorageSnafu {
                stage: "fixture-seed-message",
            })?;
        Ok(Message::from(record))
    }

    async fn stored_rows(&self) -> RunnerResult<Vec<Message>> {
        let records = self
            .storage
            .list_messages(self.conversation.id)
            .await
            .context(StorageSnafu {
                stage: "fixture-list-messages",
            })?;
        Ok(records.into_iter().map(Message::from).collect())
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    if let Err(error) = run().await {
        println!("runner_ok=false");
        eprintln!("runner_error={error}");
        std::process::exit(1);
    }
}

async fn run() -> RunnerResult<()> {
    let args = parse_args(env::args().skip(1))?;
    println!("scenario={}", args.scenario.name());
    let loaded = match args.config_path {
        Some(path) => SettingsStore::new(path),
        None => SettingsStore::load(),
    };
    let settings = qa_settings(&loaded.settings());
    let context = RunContext {
        db_path: args.database.resolve(&settings),
        settings,
    };
    println!("db_path={}", context.db_path);
    let context = &context;

    match args.scenario {
        Scenario::LoadOrdered => run_load_ordered(context).await,
        Scenario::LiveDedup => run_live_dedup(context).await,
        Scenario::BlankSend => run_blank_send(context).await,
        Scenario::UnreadIncrement => run_unread_increment(context).await,
        Scenario::OpenMarksRead => run_open_marks_read(context).await,
        Scenario::RateLimit => run_rate_limit(context).await,
        Scenario::All => run_all(context).await,
    }
}

fn parse_args(args: impl IntoIterator<Item = String>) -> RunnerResult<RunnerArgs> {
    let mut scenario = None;
    let mut database = DatabaseChoice::InMemory;
    let mut config_path = None;
    let mut pending = args.into_iter();

    while let Some(argument) = pending.next() {
        match argument.as_str() {
            "--scenario" => {
                let value = pending.next().context(MissingArgumentValueSnafu {
                    stage: "parse-args-scenario-value",
                    arg: "--scenario",
                })?;

                let parsed = Scenario::parse(&value).context(UnknownScenarioSnafu {
                    stage: "parse-args-scenario",
                    raw: value,
                })?;
                scenario = Some(parsed);
            }
            "--db" => {
                let value = pending.next().context(MissingArgumentValueSnafu {
                    stage: "parse-args-db-value",
                    arg: "--db",
                })?;
                database = DatabaseChoice::parse(value);
            }
            "--config" => {
                let value = pending.next().context(MissingArgumentValueSnafu {
                    stage: "parse-args-config-value",
                    arg: "--config",
                })?;
                config_path = Some(PathBuf::from(value));
            }
            _ => {
                return UnknownArgumentSnafu {
                    stage: "parse-args",
                    raw: argument,
                }
                .fail();
            }
        }
    }

    Ok(RunnerArgs {
        scenario: scenario.context(MissingScenarioSnafu {
            stage: "parse-args-scenario-required",
        })?,
        database,
        config_path,
    })
}

async fn run_all(context: &RunContext) -> RunnerResult<()> {
    run_load_ordered(context).await?;
    run_live_dedup(context).await?;
    run_blank_send(context).await?;
    run_unread_increment(context).await?;
    run_open_marks_read(context).await?;
    run_rate_limit(context).await?;
    println!("all_passed=true");
    Ok(())
}

async fn run_load_ordered(context: &RunContext) -> RunnerResult<()> {
    let fixture = Fixture::new(context).await?;
    // Insert out of order; the timeline must still come back sorted.
    let m3 = fixture
        .seed(fixture.alice, fixture.bob, "m3", at_minute(2))
        .await?;
    let m1 = fixture
        .seed(fixture.alice, fixture.bob, "m1", at_minute(0))
        .await?;
    let m2 = fixture
        .seed(fixture.bob, fixture.alice, "m2", at_minute(1))
        .await?;

    let session = fixture.login(fixture.bob).await?;
    let timeline = session
        .open_conversation(fixture.conversation.id)
        .await
        .context(SyncSnafu {
            stage: "scenario-load-ordered-open",
        })?;
    let ids = message_ids(timeline.messages());
    println!("timeline_len={}", ids.len());
    session.shutdown().await;

    expect(
        ids == vec![m1.id, m2.id, m3.id],
        "scenario-load-ordered-assert",
        "load_ordered",
        || format!("expected [m1, m2, m3] but got {ids:?}"),
    )?;
    println!("runner_ok=true");
    Ok(())
}

async fn run_live_dedup(context: &RunContext) -> RunnerResult<()> {
    let fixture = Fixture::new(context).await?;
    fixture
        .seed(fixture.alice, fixture.bob, "m1", at_minute(0))
        .await?;
    fixture
        .seed(fixture.alice, fixture.bob, "m2", at_minute(1))
        .await?;
    let m3 = fixture
        .seed(fixture.alice, fixture.bob, "m3", at_minute(2))
        .await?;

    let session = fixture.login(fixture.bob).await?;
    session
        .open_conversation(fixture.conversation.id)
        .await
        .context(SyncSnafu {
            stage: "scenario-live-dedup-open",
        })?;

    let m4 = Message {
        id: MessageId::new_v7(),
        created_at_unix_millis: at_minute(3),
        body: "m4".to_string(),
        ..m3.clone()
    };
    session.apply_live(m3.clone()).await;
    session.apply_live(m4.clone()).await;

    let timeline = session.active_timeline().await.unwrap_or_default();
    let ids = message_ids(timeline.messages());
    println!("timeline_len={}", ids.len());
    session.shutdown().await;

    expect(
        ids.len() == 4 && ids.last() == Some(&m4.id),
        "scenario-live-dedup-assert",
        "live_dedup",
        || format!("expected four messages ending in m4 but got {ids:?}"),
    )?;
    println!("runner_ok=true");
    Ok(())
}

async fn run_blank_send(context: &RunContext) -> RunnerResult<()> {
    let fixture = Fixture::new(context).await?;
    let session = fixture.login(fixture.alice).await?;

    let result = session.send_message(fixture.conversation.id, "   ").await;
    let rejected_as_empty = result
        .as_ref()
        .err()
        .and_then(SyncError::validation_reason)
        == Some(&ValidationReason::Empty);
    let rows = fixture.stored_rows().await?.len();
    println!("rejected_as_empty={rejected_as_empty}");
    println!("rows_written={rows}");
    session.shutdown().await;

    expect(
        rejected_as_empty && rows == 0,
        "scenario-blank-send-assert",
        "blank_send",
        || format!("expected empty-body rejection with zero rows, got {result:?} and {rows} rows"),
    )?;
    println!("runner_ok=true");
    Ok(())
}

async fn run_unread_increment(context: &RunContext) -> RunnerResult<()> {
    let fixture = Fixture::new(context).await?;
    let alice = fixture.login(fixture.alice).await?;
    let bob = fixture.login(fixture.bob).await?;
    let feed = bob.subscribe_live().await;
    let before = bob
        .directory()
        .await
        .unread_count(fixture.conversation.id);

    let sent = alice
        .send_message(fixture.conversation.id, "hi bob")
        .await
        .context(SyncSnafu {
            stage: "scenario-unread-increment-send",
        })?;
    let mut events = bob.events();
    feed.push(sent);
    // The feed is drained by a background task; wait for the directory to move.
    while !matches!(
        events.recv().await,
        Ok(SessionEvent::DirectoryChanged) | Err(_)
    ) {}

    let after = bob
        .directory()
        .await
        .unread_count(fixture.conversation.id);
    println!("unread_before={before}");
    println!("unread_after={after}");
    alice.shutdown().await;
    bob.shutdown().await;

    expect(
        after == before + 1,
        "scenario-unread-increment-assert",
        "unread_increment",
        || format!("expected unread to grow by one, went from {before} to {after}"),
    )?;
    println!("runner_ok=true");
    Ok(())
}

async fn run_open_marks_read(context: &RunContext) -> RunnerResult<()> {
    let fixture = Fixture::new(context).await?;
    for minute in 0..3 {
        fixture
            .seed(fixture.alice, fixture.bob, "unread", at_minute(minute))
            .await?;
    }
    fixture
        .seed(fixture.bob, fixture.alice, "reply", at_minute(3))
        .await?;

    let bob = fixture.login(fixture.bob).await?;
    let before = bob
        .directory()
        .await
        .unread_count(fixture.conversation.id);
    bob.open_conversation(fixture.conversation.id)
        .await
        .context(SyncSnafu {
            stage: "scenario-open-marks-read-open",
        })?;
    let pending = bob.pending_read_marks();
    bob.flush_read_marks().await;

    let after = bob
        .directory()
        .await
        .unread_count(fixture.conversation.id);
    let all_read = fixture
        .stored_rows()
        .await?
        .iter()
        .filter(|message| message.receiver_id == fixture.bob)
        .all(|message| message.read);
    println!("unread_before={before}");
    println!("unread_after={after}");
    println!("all_read={all_read}");
    println!("pending_read_marks={pending}");
    bob.shutdown().await;

    expect(
        before == 3 && after == 0 && all_read && pending == 1,
        "scenario-open-marks-read-assert",
        "open_marks_read",
        || {
            format!(
                "expected one pending mark taking 3 -> 0 with every row read, got {pending} pending, {before} -> {after}, read={all_read}"
            )
        },
    )?;
    println!("runner_ok=true");
    Ok(())
}

async fn run_rate_limit(context: &RunContext) -> RunnerResult<()> {
    let fixture = Fixture::new(context).await?;
    let alice = fixture.login(fixture.alice).await?;
    let max_sends = alice.settings().rate_limit_max_sends;

    for index in 0..max_sends {
        alice
            .send_message(fixture.conversation.id, &format!("message {index}"))
            .await
            .context(SyncSnafu {
                stage: "scenario-rate-limit-send",
            })?;
    }
    let started_at = unix_now_millis();
    let result = alice
        .send_message(fixture.conversation.id, "one too many")
        .await;
    let reset_at = result.as_ref().err().and_then(SyncError::reset_at_unix_millis);
    let rows = fixture.stored_rows().await?.len();
    println!("rows_written={rows}");
    println!("rate_limited={}", reset_at.is_some());
    alice.shutdown().await;

    expect(
        rows == max_sends as usize && reset_at.is_some_and(|reset_at| reset_at >= started_at),
        "scenario-rate-limit-assert",
        "rate_limit",
        || format!("expected {max_sends} rows and a future reset, got {rows} rows and {reset_at:?}"),
    )?;
    println!("runner_ok=true");
    Ok(())
}

/// Loaded settings with a settle delay short enough for scenarios to observe.
fn qa_settings(loaded: &SyncSettings) -> SyncSettings {
    SyncSettings {
        read_settle_delay_ms: 50,
        ..loaded.clone()
    }
}

fn at_minute(minute: u64) -> u64 {
    TEN_O_CLOCK_UNIX_MILLIS + minute * MINUTE_MILLIS
}

fn message_ids(messages: &[Message]) -> Vec<MessageId> {
    messages.iter().map(|message| message.id).collect()
}

fn unix_now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |duration| duration.as_millis() as u64)
}

fn expect(
    condition: bool,
    stage: &'static str,
    scenario: &'static str,
    reason: impl FnOnce() -> String,
) -> RunnerResult<()> {
    if condition {
        return Ok(());
    }
    ScenarioFailedSnafu {
        stage,
        scenario,
        reason: reason(),
    }
    .fail()
}
