use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use rapport_storage::{BoxFuture, ConversationId, IdentityId};

use crate::clock::unix_now_millis;
use crate::error::{ProfileLookupSnafu, SyncResult};
use crate::model::Profile;

/// Online status and typing signals for the session identity and its peers.
///
/// Calls are fire-and-forget: implementations swallow their own failures.
pub trait Presence: Send + Sync {
    fn is_online(&self, identity: IdentityId) -> bool;
    fn last_seen_text(&self, identity: IdentityId) -> String;
    fn set_typing(&self, conversation_id: ConversationId, typing: bool);
    fn typing_users(&self, conversation_id: ConversationId) -> HashSet<IdentityId>;
}

/// Batched lookup of display profiles. Identities without a profile are absent from the map.
pub trait ProfileDirectory: Send + Sync {
    fn resolve(
        &self,
        identities: Vec<IdentityId>,
    ) -> BoxFuture<'_, SyncResult<HashMap<IdentityId, Profile>>>;
}

#[derive(Debug, Default)]
struct HubState {
    online: HashSet<IdentityId>,
    last_seen_unix_millis: HashMap<IdentityId, u64>,
    typing: HashMap<ConversationId, HashSet<IdentityId>>,
}

/// In-process presence shared by every session of one process.
#[derive(Debug, Default)]
pub struct PresenceHub {
    state: RwLock<HubState>,
}

impl PresenceHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Presence handle that publishes typing signals as `identity`.
    pub fn handle(self: &Arc<Self>, identity: IdentityId) -> LocalPresence {
        LocalPresence {
            identity,
            hub: Arc::clone(self),
        }
    }

    pub fn set_online(&self, identity: IdentityId, online: bool) {
        self.set_online_at(identity, online, unix_now_millis());
    }

    pub fn set_online_at(&self, identity: IdentityId, online: bool, now_unix_millis: u64) {
        let mut state = self.write();
        state.last_seen_unix_millis.insert(identity, now_unix_millis);
        if online {
            state.online.insert(identity);
        } else {
            state.online.remove(&identity);
            for typing in state.typing.values_mut() {
                typing.remove(&identity);
            }
        }
    }

    fn last_seen_text_at(&self, identity: IdentityId, now_unix_millis: u64) -> String {
        let state = self.read();
        if state.online.contains(&identity) {
            return "online".to_string();
        }

        match state.last_seen_unix_millis.get(&identity) {
            Some(last_seen) => humanize_last_seen(now_unix_millis.saturating_sub(*last_seen)),
            None => "offline".to_string(),
        }
    }

    // A poisoned lock only means a writer panicked mid-update; the sets stay usable.
    fn read(&self) -> RwLockReadGuard<'_, HubState> {
        self.state
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HubState> {
        self.state
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[derive(Debug, Clone)]
pub struct LocalPresence {
    identity: IdentityId,
    hub: Arc<PresenceHub>,
}

impl LocalPresence {
    pub fn identity(&self) -> IdentityId {
        self.identity
    }

    pub fn hub(&self) -> &Arc<PresenceHub> {
        &self.hub
    }
}

impl Presence for LocalPresence {
    fn is_online(&self, identity: IdentityId) -> bool {
        self.hub.read().online.contains(&identity)
    }

    fn last_seen_text(&self, identity: IdentityId) -> String {
        self.hub.last_seen_text_at(identity, unix_now_millis())
    }

    fn set_typing(&self, conversation_id: ConversationId, typing: bool) {
        let mut state = self.hub.write();
        if typing {
            state
                .typing
                .entry(conversation_id)
                .or_default()
                .insert(self.identity);
            return;
        }

        if let Some(users) = state.typing.get_mut(&conversation_id) {
            users.remove(&self.identity);
            if users.is_empty() {
                state.typing.remove(&conversation_id);
            }
        }
    }

    fn typing_users(&self, conversation_id: ConversationId) -> HashSet<IdentityId> {
        self.hub
            .read()
            .typing
            .get(&conversation_id)
            .cloned()
            .unwrap_or_default()
    }
}

fn humanize_last_seen(elapsed_millis: u64) -> String {
    let minutes = elapsed_millis / 60_000;
    let hours = minutes / 60;
    let days = hours / 24;
    match (days, hours, minutes) {
        (0, 0, 0) => "last seen just now".to_string(),
        (0, 0, 1) => "last seen 1 minute ago".to_string(),
        (0, 0, minutes) => format!("last seen {minutes} minutes ago"),
        (0, 1, _) => "last seen 1 hour ago".to_string(),
        (0, hours, _) => format!("last seen {hours} hours ago"),
        (1, _, _) => "last seen yesterday".to_string(),
        (days, _, _) => format!("last seen {days} days ago"),
    }
}

/// Profiles held in memory, for tests and local runs.
///
/// An offline directory fails every lookup, which lets callers exercise their fallback path.
#[derive(Debug, Default)]
pub struct StaticProfiles {
    profiles: RwLock<HashMap<IdentityId, Profile>>,
    offline: AtomicBool,
}

impl StaticProfiles {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, identity: IdentityId, profile: Profile) {
        self.profiles
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(identity, profile);
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }
}

impl ProfileDirectory for StaticProfiles {
    fn resolve(
        &self,
        identities: Vec<IdentityId>,
    ) -> BoxFuture<'_, SyncResult<HashMap<IdentityId, Profile>>> {
        Box::pin(async move {
            if self.offline.load(Ordering::SeqCst) {
                return ProfileLookupSnafu {
                    stage: "static-profiles-resolve",
                    details: format!(
                        "directory offline, {} identities unresolved",
                        identities.len()
                    ),
                }
                .fail();
            }
            let profiles = self
                .profiles
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            Ok(identities
                .into_iter()
                .filter_map(|identity| {
                    profiles
                        .get(&identity)
                        .map(|profile| (identity, profile.clone()))
                })
                .collect())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SyncError;

    #[test]
    fn typing_signals_are_scoped_to_conversation_and_sender() {
        let hub = PresenceHub::new();
        let alice = hub.handle(IdentityId::new_v7());
        let bob = hub.handle(IdentityId::new_v7());
        let conversation_id = ConversationId::new_v7();

        alice.set_typing(conversation_id, true);
        bob.set_typing(conversation_id, true);
        assert_eq!(bob.typing_users(conversation_id).len(), 2);
        assert!(bob.typing_users(ConversationId::new_v7()).is_empty());

        alice.set_typing(conversation_id, false);
        assert_eq!(
            bob.typing_users(conversation_id),
            HashSet::from([bob.identity()])
        );
    }

    #[test]
    fn going_offline_records_last_seen_and_clears_typing() {
        let hub = PresenceHub::new();
        let alice = hub.handle(IdentityId::new_v7());
        let conversation_id = ConversationId::new_v7();

        hub.set_online_at(alice.identity(), true, 0);
        alice.set_typing(conversation_id, true);
        assert!(alice.is_online(alice.identity()));
        assert_eq!(hub.last_seen_text_at(alice.identity(), 10), "online");

        hub.set_online_at(alice.identity(), false, 1_000);
        assert!(!alice.is_online(alice.identity()));
        assert!(alice.typing_users(conversation_id).is_empty());
        assert_eq!(
            hub.last_seen_text_at(alice.identity(), 1_000 + 3 * 60_000),
            "last seen 3 minutes ago"
        );
        assert_eq!(
            hub.last_seen_text_at(alice.identity(), 1_000 + 26 * 3_600_000),
            "last seen yesterday"
        );
        assert_eq!(hub.last_seen_text_at(IdentityId::new_v7(), 0), "offline");
    }

    #[tokio::test]
    async fn static_profiles_resolve_only_known_identities() {
        let profiles = StaticProfiles::new();
        let known = IdentityId::new_v7();
        profiles.insert(
            known,
            Profile {
                display_name: "Robin".to_string(),
                avatar_url: None,
                location: Some("Lisbon".to_string()),
                subtype: None,
            },
        );

        let resolved = profiles
            .resolve(vec![known, IdentityId::new_v7()])
            .await
            .unwrap();
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[&known].display_name, "Robin");
    }

    #[tokio::test]
    async fn offline_profiles_fail_the_lookup() {
        let profiles = StaticProfiles::new();
        profiles.set_offline(true);

        let error = profiles
            .resolve(vec![IdentityId::new_v7()])
            .await
            .unwrap_err();
        assert!(matches!(error, SyncError::ProfileLookup { .. }));

        profiles.set_offline(false);
        let resolved = profiles.resolve(vec![IdentityId::new_v7()]).await.unwrap();
        assert!(resolved.is_empty());
    }
}
