//! Fuzz target for the [`ConversationDirectory`]
//!
//! Prevent ordering corruption and duplicate entries from adversarial event
//! streams
//!
//! # Strategy
//!
//! - Arbitrary initial snapshots: duplicate ids, non-member conversations,
//!   unsorted input
//! - Arbitrary event streams: upserts and activity bumps in any order, with
//!   stale timestamps and membership revocations mixed in
//!
//! # Invariants
//!
//! - Entries always sorted: activity descending, id ascending on ties
//! - No duplicate conversation ids, ever
//! - Every entry includes the owner
//! - Activity timestamps never move backwards
//! - NEVER panic on any input

#![no_main]

use std::collections::{HashMap, HashSet};

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use vesper_client::{ConversationDirectory, DirectoryEvent};
use vesper_core::{Conversation, ConversationId, Identity, Timestamp, UserId};

#[derive(Debug, Clone, Arbitrary)]
struct FuzzConversation {
    id: u8,
    /// Member pool indices; the owner is only a member if one maps to 0.
    members: Vec<u8>,
    at: u32,
    named: bool,
}

#[derive(Debug, Clone, Arbitrary)]
enum FuzzEvent {
    Upsert(FuzzConversation),
    Activity { id: u8, at: u32 },
}

#[derive(Debug, Clone, Arbitrary)]
struct FuzzInput {
    snapshot: Vec<FuzzConversation>,
    events: Vec<FuzzEvent>,
}

fn build(fuzzed: &FuzzConversation) -> Conversation {
    let members = fuzzed
        .members
        .iter()
        .take(4)
        .map(|m| Identity::from(format!("user-{}", m % 5).as_str()))
        .collect();
    Conversation {
        id: ConversationId::new(format!("conv-{}", fuzzed.id % 16)),
        members,
        last_activity_at: Timestamp::from_millis(u64::from(fuzzed.at)),
        name: fuzzed.named.then(|| "named".to_string()),
        image_url: None,
    }
}

fuzz_target!(|input: FuzzInput| {
    let owner = UserId::new("user-0");
    let mut directory = ConversationDirectory::new(owner.clone());

    directory.apply_initial(input.snapshot.iter().map(build).collect());
    check(&directory, &owner, &HashMap::new());

    // Once in steady state, activity must be monotone per conversation.
    let mut floor: HashMap<ConversationId, Timestamp> = directory
        .entries()
        .iter()
        .map(|c| (c.id.clone(), c.last_activity_at))
        .collect();

    for event in &input.events {
        let event = match event {
            FuzzEvent::Upsert(fuzzed) => DirectoryEvent::Upserted(build(fuzzed)),
            FuzzEvent::Activity { id, at } => DirectoryEvent::Activity {
                id: ConversationId::new(format!("conv-{}", id % 16)),
                at: Timestamp::from_millis(u64::from(*at)),
            },
        };
        directory.apply(event);
        check(&directory, &owner, &floor);
        // Rebuild rather than accumulate: an evicted conversation may
        // legitimately return with any timestamp.
        floor = directory
            .entries()
            .iter()
            .map(|c| (c.id.clone(), c.last_activity_at))
            .collect();
    }
});

fn check(
    directory: &ConversationDirectory,
    owner: &UserId,
    floor: &HashMap<ConversationId, Timestamp>,
) {
    for pair in directory.entries().windows(2) {
        assert!(
            pair[0].directory_cmp(&pair[1]).is_lt(),
            "directory out of order: {} then {}",
            pair[0].id,
            pair[1].id
        );
    }

    let mut seen = HashSet::new();
    for entry in directory.entries() {
        assert!(seen.insert(entry.id.clone()), "duplicate id {}", entry.id);
        assert!(entry.has_member(owner), "non-member entry {}", entry.id);
        if let Some(previous) = floor.get(&entry.id) {
            assert!(
                entry.last_activity_at >= *previous,
                "activity moved backwards on {}",
                entry.id
            );
        }
    }
}
