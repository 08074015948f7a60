pub mod cache;
mod clock;
pub mod config;
pub mod directory;
pub mod error;
pub mod merger;
pub mod model;
pub mod presence;
pub mod read_state;
pub mod send;
pub mod session;
pub mod timeline;
pub mod typing;

pub use cache::{ActiveView, SessionCache, SessionEvent};
pub use config::{SettingsError, SettingsStore, SyncSettings};
pub use directory::MatchDirectory;
pub use error::{SyncError, SyncResult, ValidationReason};
pub use merger::{LiveEventMerger, LiveFeed, LiveSubscription, MergeOutcome};
pub use model::{
    Conversation, ConversationEntry, ConversationSummary, Message, Profile, PushEvent, SortKey,
};
pub use presence::{LocalPresence, Presence, PresenceHub, ProfileDirectory, StaticProfiles};
pub use read_state::ReadStateReconciler;
pub use send::{RateLimiter, SendPipeline, sanitize_body, validate_body};
pub use session::{ChatSession, Collaborators};
pub use timeline::{Timeline, TimelineCache};
pub use typing::TypingCoordinator;
