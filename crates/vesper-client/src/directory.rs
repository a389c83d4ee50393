//! Live conversation directory.
//!
//! Maintains the sorted set of conversations visible to one identity. Pure
//! data structure: the driver feeds it the initial query result and then
//! push events in backend-delivery order; it keeps the entries sorted by
//! last activity (most recent first, id ascending on ties) with no
//! duplicate ids.

use tracing::debug;
use vesper_core::{Conversation, ConversationId, Timestamp, UserId};

use crate::backend::DirectoryEvent;

/// Sorted, deduplicated directory for one identity.
///
/// Membership filtering is authoritative: events for conversations that do
/// not include the owner are dropped, and an upsert that removes the owner
/// evicts the entry.
#[derive(Debug, Clone)]
pub struct ConversationDirectory {
    owner: UserId,
    /// Always sorted by [`Conversation::directory_cmp`].
    entries: Vec<Conversation>,
}

impl ConversationDirectory {
    /// Empty directory owned by `owner`.
    pub fn new(owner: UserId) -> Self {
        Self { owner, entries: Vec::new() }
    }

    /// The identity this directory belongs to.
    pub fn owner(&self) -> &UserId {
        &self.owner
    }

    /// Entries, most recent activity first.
    pub fn entries(&self) -> &[Conversation] {
        &self.entries
    }

    /// Number of conversations.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the directory is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Replace contents with an initial query result.
    ///
    /// Tolerates backend sloppiness: non-member conversations are dropped
    /// and duplicate ids collapse to the entry with the newest activity.
    pub fn apply_initial(&mut self, conversations: Vec<Conversation>) {
        self.entries.clear();
        for conversation in conversations {
            if !conversation.has_member(&self.owner) {
                debug!(id = %conversation.id, "dropping non-member conversation from snapshot");
                continue;
            }
            match self.position_of(&conversation.id) {
                Some(existing) => {
                    if conversation.last_activity_at > self.entries[existing].last_activity_at {
                        self.entries.remove(existing);
                        self.insert_sorted(conversation);
                    }
                },
                None => self.insert_sorted(conversation),
            }
        }
    }

    /// Apply one push event. Returns whether the directory changed.
    pub fn apply(&mut self, event: DirectoryEvent) -> bool {
        match event {
            DirectoryEvent::Upserted(conversation) => self.apply_upsert(conversation),
            DirectoryEvent::Activity { id, at } => self.apply_activity(&id, at),
        }
    }

    fn apply_upsert(&mut self, conversation: Conversation) -> bool {
        let existing = self.position_of(&conversation.id);

        if !conversation.has_member(&self.owner) {
            // Membership revoked (or never present): the entry leaves the
            // directory.
            return match existing {
                Some(index) => {
                    self.entries.remove(index);
                    true
                },
                None => false,
            };
        }

        if let Some(index) = existing {
            // Activity never moves backwards; keep the newer time if the
            // upsert raced an activity event.
            let mut conversation = conversation;
            conversation.last_activity_at =
                self.entries[index].last_activity_at.max(conversation.last_activity_at);
            // Compare after clamping: an upsert differing only by a stale
            // timestamp changes nothing.
            if self.entries[index] == conversation {
                return false;
            }
            self.entries.remove(index);
            self.insert_sorted(conversation);
        } else {
            self.insert_sorted(conversation);
        }
        true
    }

    fn apply_activity(&mut self, id: &ConversationId, at: Timestamp) -> bool {
        let Some(index) = self.position_of(id) else {
            // Activity for a conversation we never saw; the backend will
            // deliver the upsert separately.
            debug!(%id, "activity for unknown conversation ignored");
            return false;
        };
        if at <= self.entries[index].last_activity_at {
            return false;
        }
        let mut conversation = self.entries.remove(index);
        conversation.last_activity_at = at;
        self.insert_sorted(conversation);
        true
    }

    fn position_of(&self, id: &ConversationId) -> Option<usize> {
        self.entries.iter().position(|c| &c.id == id)
    }

    fn insert_sorted(&mut self, conversation: Conversation) {
        let index = self
            .entries
            .partition_point(|existing| existing.directory_cmp(&conversation).is_lt());
        self.entries.insert(index, conversation);
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use vesper_core::Identity;

    use super::*;

    fn conversation(id: &str, members: &[&str], at: u64) -> Conversation {
        Conversation {
            id: ConversationId::from(id),
            members: members.iter().map(|m| Identity::from(*m)).collect(),
            last_activity_at: Timestamp::from_millis(at),
            name: None,
            image_url: None,
        }
    }

    fn ids(dir: &ConversationDirectory) -> Vec<&str> {
        dir.entries().iter().map(|c| c.id.as_str()).collect()
    }

    #[test]
    fn initial_snapshot_is_sorted_most_recent_first() {
        let mut dir = ConversationDirectory::new(UserId::new("u1"));
        dir.apply_initial(vec![
            conversation("a", &["u1", "u2"], 10),
            conversation("b", &["u1", "u3"], 30),
            conversation("c", &["u1", "u4"], 20),
        ]);
        assert_eq!(ids(&dir), vec!["b", "c", "a"]);
    }

    #[test]
    fn ties_break_by_id_ascending() {
        let mut dir = ConversationDirectory::new(UserId::new("u1"));
        dir.apply_initial(vec![
            conversation("b", &["u1", "u2"], 10),
            conversation("a", &["u1", "u3"], 10),
        ]);
        assert_eq!(ids(&dir), vec!["a", "b"]);
    }

    #[test]
    fn snapshot_drops_non_member_conversations() {
        let mut dir = ConversationDirectory::new(UserId::new("u1"));
        dir.apply_initial(vec![
            conversation("a", &["u1", "u2"], 10),
            conversation("x", &["u2", "u3"], 99),
        ]);
        assert_eq!(ids(&dir), vec!["a"]);
    }

    #[test]
    fn duplicate_ids_collapse_to_newest() {
        let mut dir = ConversationDirectory::new(UserId::new("u1"));
        dir.apply_initial(vec![
            conversation("a", &["u1", "u2"], 10),
            conversation("a", &["u1", "u2"], 25),
        ]);
        assert_eq!(dir.len(), 1);
        assert_eq!(dir.entries()[0].last_activity_at, Timestamp::from_millis(25));
    }

    #[test]
    fn activity_repositions_without_disturbing_others() {
        // Conversation ranked 3rd gets new activity and moves to 1st; the
        // others keep their relative order.
        let mut dir = ConversationDirectory::new(UserId::new("u1"));
        dir.apply_initial(vec![
            conversation("a", &["u1", "u2"], 30),
            conversation("b", &["u1", "u3"], 20),
            conversation("c", &["u1", "u4"], 10),
        ]);
        assert_eq!(ids(&dir), vec!["a", "b", "c"]);

        let changed = dir.apply(DirectoryEvent::Activity {
            id: ConversationId::from("c"),
            at: Timestamp::from_millis(40),
        });
        assert!(changed);
        assert_eq!(ids(&dir), vec!["c", "a", "b"]);
    }

    #[test]
    fn stale_activity_is_ignored() {
        let mut dir = ConversationDirectory::new(UserId::new("u1"));
        dir.apply_initial(vec![conversation("a", &["u1", "u2"], 30)]);

        let changed = dir.apply(DirectoryEvent::Activity {
            id: ConversationId::from("a"),
            at: Timestamp::from_millis(20),
        });
        assert!(!changed);
        assert_eq!(dir.entries()[0].last_activity_at, Timestamp::from_millis(30));
    }

    #[test]
    fn activity_for_unknown_conversation_is_ignored() {
        let mut dir = ConversationDirectory::new(UserId::new("u1"));
        let changed = dir.apply(DirectoryEvent::Activity {
            id: ConversationId::from("ghost"),
            at: Timestamp::from_millis(1),
        });
        assert!(!changed);
        assert!(dir.is_empty());
    }

    #[test]
    fn upsert_inserts_new_and_replaces_existing() {
        let mut dir = ConversationDirectory::new(UserId::new("u1"));
        assert!(dir.apply(DirectoryEvent::Upserted(conversation("a", &["u1", "u2"], 10))));
        assert_eq!(dir.len(), 1);

        // Same id again: replaced, not duplicated.
        let mut renamed = conversation("a", &["u1", "u2"], 10);
        renamed.name = Some("pair".to_string());
        assert!(dir.apply(DirectoryEvent::Upserted(renamed)));
        assert_eq!(dir.len(), 1);
        assert_eq!(dir.entries()[0].name.as_deref(), Some("pair"));
    }

    #[test]
    fn upsert_never_moves_activity_backwards() {
        let mut dir = ConversationDirectory::new(UserId::new("u1"));
        dir.apply(DirectoryEvent::Upserted(conversation("a", &["u1", "u2"], 30)));

        // Metadata refresh carrying an older timestamp keeps the newer one.
        let mut refresh = conversation("a", &["u1", "u2"], 5);
        refresh.name = Some("pair".to_string());
        dir.apply(DirectoryEvent::Upserted(refresh));
        assert_eq!(dir.entries()[0].last_activity_at, Timestamp::from_millis(30));
    }

    #[test]
    fn upsert_without_owner_evicts() {
        let mut dir = ConversationDirectory::new(UserId::new("u1"));
        dir.apply(DirectoryEvent::Upserted(conversation("a", &["u1", "u2"], 10)));

        let changed = dir.apply(DirectoryEvent::Upserted(conversation("a", &["u2", "u3"], 20)));
        assert!(changed);
        assert!(dir.is_empty());
    }

    #[test]
    fn identical_upsert_reports_no_change() {
        let mut dir = ConversationDirectory::new(UserId::new("u1"));
        let conv = conversation("a", &["u1", "u2"], 10);
        assert!(dir.apply(DirectoryEvent::Upserted(conv.clone())));
        assert!(!dir.apply(DirectoryEvent::Upserted(conv)));
    }

    #[test]
    fn stale_timestamp_only_upsert_reports_no_change() {
        // The clamped result is identical to the stored entry, so reporting
        // a change here would trigger a pointless republish downstream.
        let mut dir = ConversationDirectory::new(UserId::new("u1"));
        dir.apply(DirectoryEvent::Upserted(conversation("a", &["u1", "u2"], 30)));

        let changed = dir.apply(DirectoryEvent::Upserted(conversation("a", &["u1", "u2"], 5)));
        assert!(!changed);
        assert_eq!(dir.entries()[0].last_activity_at, Timestamp::from_millis(30));
    }

    fn arbitrary_event() -> impl Strategy<Value = DirectoryEvent> {
        let id = prop_oneof![Just("a"), Just("b"), Just("c"), Just("d")];
        let at = 0u64..100;
        prop_oneof![
            (id.clone(), at.clone()).prop_map(|(id, at)| {
                DirectoryEvent::Upserted(conversation(id, &["u1", "u2"], at))
            }),
            (id, at).prop_map(|(id, at)| DirectoryEvent::Activity {
                id: ConversationId::from(id),
                at: Timestamp::from_millis(at),
            }),
        ]
    }

    proptest! {
        /// For any event sequence the directory stays sorted and free of
        /// duplicate ids.
        #[test]
        fn directory_stays_sorted_and_deduplicated(
            events in prop::collection::vec(arbitrary_event(), 0..64)
        ) {
            let mut dir = ConversationDirectory::new(UserId::new("u1"));
            for event in events {
                dir.apply(event);

                for pair in dir.entries().windows(2) {
                    prop_assert!(pair[0].directory_cmp(&pair[1]).is_lt());
                }
                let mut seen = std::collections::HashSet::new();
                for entry in dir.entries() {
                    prop_assert!(seen.insert(entry.id.clone()));
                }
            }
        }
    }
}
