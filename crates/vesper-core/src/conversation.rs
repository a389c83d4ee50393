//! Conversation model.
//!
//! A [`Conversation`] is a backend-managed message thread identified by its
//! member set. The backend is the single source of truth for conversation
//! identifiers; the client never derives an id from the member pair itself,
//! it only uses [`MemberPair`] as the canonical *lookup key* for the
//! backend's get-or-create operation.

use serde::{Deserialize, Serialize};

use crate::identity::{Identity, UserId};

/// Milliseconds since the Unix epoch, as reported by the backend.
///
/// Backend-assigned and monotone per conversation; the client never
/// fabricates these.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Wrap a raw millisecond value.
    pub const fn from_millis(millis: u64) -> Self {
        Self(millis)
    }

    /// The raw millisecond value.
    pub const fn as_millis(self) -> u64 {
        self.0
    }
}

/// Backend-assigned conversation identifier.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ConversationId(String);

impl ConversationId {
    /// Wrap a backend-assigned id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The raw id string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ConversationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::fmt::Debug for ConversationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ConversationId({})", self.0)
    }
}

impl From<&str> for ConversationId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Attempt to form a direct-conversation pair with a single member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("a direct conversation requires two distinct members")]
pub struct SelfPairError;

/// Canonical unordered pair of members for a 1:1 conversation.
///
/// Order of construction does not matter: `new(a, b)` and `new(b, a)` are
/// equal, hash identically, and serialize identically. This makes the pair
/// safe to use as the key for the backend's get-or-create operation.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MemberPair {
    lo: UserId,
    hi: UserId,
}

impl MemberPair {
    /// Form the canonical pair.
    ///
    /// # Errors
    ///
    /// Returns [`SelfPairError`] when both ids are the same user.
    pub fn new(a: UserId, b: UserId) -> Result<Self, SelfPairError> {
        match a.cmp(&b) {
            std::cmp::Ordering::Less => Ok(Self { lo: a, hi: b }),
            std::cmp::Ordering::Greater => Ok(Self { lo: b, hi: a }),
            std::cmp::Ordering::Equal => Err(SelfPairError),
        }
    }

    /// Both members, in canonical order.
    pub fn members(&self) -> [&UserId; 2] {
        [&self.lo, &self.hi]
    }

    /// Whether `user` is one of the two members.
    pub fn contains(&self, user: &UserId) -> bool {
        &self.lo == user || &self.hi == user
    }

    /// The member that is not `user`, when `user` is in the pair.
    pub fn other_than(&self, user: &UserId) -> Option<&UserId> {
        if &self.lo == user {
            Some(&self.hi)
        } else if &self.hi == user {
            Some(&self.lo)
        } else {
            None
        }
    }
}

/// A backend-managed message thread.
///
/// Created lazily by the backend on first resolution or first directory
/// sync; the client holds references, never ownership.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    /// Backend-assigned identifier.
    pub id: ConversationId,
    /// Member identities, including the viewer.
    pub members: Vec<Identity>,
    /// When the conversation last saw activity. Monotone per conversation.
    pub last_activity_at: Timestamp,
    /// Explicit name, for conversations the backend named.
    pub name: Option<String>,
    /// Explicit image, for conversations the backend decorated.
    pub image_url: Option<String>,
}

impl Conversation {
    /// Whether `user` is a member.
    pub fn has_member(&self, user: &UserId) -> bool {
        self.members.iter().any(|m| &m.id == user)
    }

    /// The member that is not `viewer`, for 1:1 conversations.
    pub fn counterpart(&self, viewer: &UserId) -> Option<&Identity> {
        if self.members.len() != 2 {
            return None;
        }
        self.members.iter().find(|m| &m.id != viewer)
    }

    /// Name to show `viewer` for this conversation.
    ///
    /// An explicit backend-assigned name wins; otherwise 1:1 conversations
    /// borrow the counterpart's display name.
    pub fn display_name_for(&self, viewer: &UserId) -> Option<&str> {
        self.name
            .as_deref()
            .or_else(|| self.counterpart(viewer).map(|m| m.display_name.as_str()))
    }

    /// Image to show `viewer`, same precedence as [`Self::display_name_for`].
    pub fn display_image_for(&self, viewer: &UserId) -> Option<&str> {
        self.image_url
            .as_deref()
            .or_else(|| self.counterpart(viewer).and_then(|m| m.avatar_url.as_deref()))
    }

    /// Directory ordering: `last_activity_at` descending, id ascending.
    ///
    /// The id tie-break keeps the directory deterministic when two
    /// conversations report the same activity time.
    pub fn directory_cmp(&self, other: &Self) -> std::cmp::Ordering {
        other
            .last_activity_at
            .cmp(&self.last_activity_at)
            .then_with(|| self.id.cmp(&other.id))
    }
}
