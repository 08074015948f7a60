use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use rapport_storage::ConversationId;
use tokio::task::JoinHandle;

use crate::presence::Presence;

#[derive(Debug, Default)]
struct TypingSlot {
    active: bool,
    generation: u64,
    idle: Option<JoinHandle<()>>,
}

/// Debounced typing signal per conversation, published through the presence collaborator.
pub struct TypingCoordinator {
    presence: Arc<dyn Presence>,
    slots: Mutex<HashMap<ConversationId, TypingSlot>>,
}

impl TypingCoordinator {
    pub fn new(presence: Arc<dyn Presence>) -> Self {
        Self {
            presence,
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Feeds the current composer contents.
    ///
    /// Non-empty input raises the signal once and re-arms the idle timer; empty input lowers it
    /// immediately.
    pub fn on_input_changed(
        self: &Arc<Self>,
        conversation_id: ConversationId,
        input: &str,
        idle: Duration,
    ) {
        let mut slots = self.slots();
        let slot = slots.entry(conversation_id).or_default();
        slot.generation += 1;
        if let Some(previous) = slot.idle.take() {
            previous.abort();
        }

        if input.trim().is_empty() {
            if slot.active {
                slot.active = false;
                self.presence.set_typing(conversation_id, false);
            }
            return;
        }

        if !slot.active {
            slot.active = true;
            self.presence.set_typing(conversation_id, true);
        }

        let generation = slot.generation;
        let coordinator = Arc::clone(self);
        slot.idle = Some(tokio::spawn(async move {
            tokio::time::sleep(idle).await;
            coordinator.expire(conversation_id, generation);
        }));
    }

    pub fn is_typing(&self, conversation_id: ConversationId) -> bool {
        self.slots()
            .get(&conversation_id)
            .is_some_and(|slot| slot.active)
    }

    /// Lowers the signal for one conversation if it is raised.
    pub fn stop(&self, conversation_id: ConversationId) {
        let mut slots = self.slots();
        if let Some(slot) = slots.remove(&conversation_id) {
            self.lower(conversation_id, slot);
        }
    }

    pub fn stop_all(&self) {
        let slots = std::mem::take(&mut *self.slots());
        for (conversation_id, slot) in slots {
            self.lower(conversation_id, slot);
        }
    }

    fn expire(&self, conversation_id: ConversationId, generation: u64) {
        let mut slots = self.slots();
        if let Some(slot) = slots.get_mut(&conversation_id)
            && slot.generation == generation
            && slot.active
        {
            slot.active = false;
            slot.idle = None;
            self.presence.set_typing(conversation_id, false);
        }
    }

    fn lower(&self, conversation_id: ConversationId, mut slot: TypingSlot) {
        if let Some(idle) = slot.idle.take() {
            idle.abort();
        }
        if slot.active {
            self.presence.set_typing(conversation_id, false);
        }
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<ConversationId, TypingSlot>> {
        self.slots
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use rapport_storage::IdentityId;

    use super::*;

    #[derive(Default)]
    struct RecordingPresence {
        signals: Mutex<Vec<(ConversationId, bool)>>,
    }

    impl RecordingPresence {
        fn signals(&self) -> Vec<(ConversationId, bool)> {
            self.signals.lock().unwrap().clone()
        }
    }

    impl Presence for RecordingPresence {
        fn is_online(&self, _identity: IdentityId) -> bool {
            true
        }

        fn last_seen_text(&self, _identity: IdentityId) -> String {
            "online".to_string()
        }

        fn set_typing(&self, conversation_id: ConversationId, typing: bool) {
            self.signals.lock().unwrap().push((conversation_id, typing));
        }

        fn typing_users(&self, _conversation_id: ConversationId) -> HashSet<IdentityId> {
            HashSet::new()
        }
    }

    const IDLE: Duration = Duration::from_secs(2);

    fn coordinator() -> (Arc<RecordingPresence>, Arc<TypingCoordinator>) {
        let presence = Arc::new(RecordingPresence::default());
        let coordinator = Arc::new(TypingCoordinator::new(presence.clone()));
        (presence, coordinator)
    }

    #[tokio::test(start_paused = true)]
    async fn raises_once_and_lowers_after_idle() {
        let (presence, coordinator) = coordinator();
        let conversation_id = ConversationId::new_v7();

        coordinator.on_input_changed(conversation_id, "h", IDLE);
        tokio::time::sleep(Duration::from_millis(500)).await;
        coordinator.on_input_changed(conversation_id, "he", IDLE);
        tokio::time::sleep(Duration::from_millis(1_900)).await;
        assert!(coordinator.is_typing(conversation_id));
        assert_eq!(presence.signals(), vec![(conversation_id, true)]);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!coordinator.is_typing(conversation_id));
        assert_eq!(
            presence.signals(),
            vec![(conversation_id, true), (conversation_id, false)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn empty_input_lowers_immediately() {
        let (presence, coordinator) = coordinator();
        let conversation_id = ConversationId::new_v7();

        coordinator.on_input_changed(conversation_id, "hey", IDLE);
        coordinator.on_input_changed(conversation_id, "", IDLE);
        assert!(!coordinator.is_typing(conversation_id));

        tokio::time::sleep(IDLE * 2).await;
        assert_eq!(
            presence.signals(),
            vec![(conversation_id, true), (conversation_id, false)]
        );

        coordinator.on_input_changed(conversation_id, "   ", IDLE);
        assert_eq!(presence.signals().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_all_lowers_every_raised_signal() {
        let (presence, coordinator) = coordinator();
        let first = ConversationId::new_v7();
        let second = ConversationId::new_v7();

        coordinator.on_input_changed(first, "a", IDLE);
        coordinator.on_input_changed(second, "b", IDLE);
        coordinator.stop_all();

        let lowered = presence
            .signals()
            .into_iter()
            .filter(|(_, typing)| !typing)
            .map(|(conversation_id, _)| conversation_id)
            .collect::<HashSet<_>>();
        assert_eq!(lowered, HashSet::from([first, second]));
        assert!(!coordinator.is_typing(first));
    }
}
