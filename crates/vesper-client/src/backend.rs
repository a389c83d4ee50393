//! Messaging backend capability interface.
//!
//! The remote messaging backend is opaque to this crate: anything that
//! implements [`ChatBackend`] is interchangeable. The trait is held as an
//! explicitly owned, injected instance (never ambient global state), and all
//! connection mutation goes through the coordinator that owns it.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use vesper_core::{
    Conversation, ConversationId, CredentialToken, Identity, MemberPair, Timestamp, UserId,
};

/// Errors reported by the backend (and by the identity provider, which
/// shares the same transport-level failure modes).
#[derive(Debug, Clone, Error)]
pub enum BackendError {
    /// The authenticated identity may not perform the operation.
    #[error("not authorized: {reason}")]
    NotAuthorized {
        /// Backend-reported reason.
        reason: String,
    },

    /// Network-level failure.
    #[error("transport failure: {reason}")]
    Transport {
        /// Underlying failure description.
        reason: String,
    },

    /// The backend client gave up waiting. The coordinator treats this the
    /// same as any other connect failure; timeout policy lives in the
    /// backend client, not here.
    #[error("operation timed out")]
    Timeout,

    /// Operation requires a live connection and there is none.
    #[error("no live connection")]
    NotConnected,

    /// The backend rejected the request as malformed.
    #[error("invalid request: {reason}")]
    InvalidRequest {
        /// Backend-reported reason.
        reason: String,
    },
}

impl BackendError {
    /// Whether retrying the same call can reasonably succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport { .. } | Self::Timeout | Self::NotConnected => true,
            Self::NotAuthorized { .. } | Self::InvalidRequest { .. } => false,
        }
    }
}

/// Membership filter for directory queries.
///
/// Membership filtering is authoritative: the directory only ever shows
/// conversations whose member set includes the subscribing identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationFilter {
    /// Only conversations containing this member.
    pub member: UserId,
}

/// Sort order for directory queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConversationSort {
    /// Most recent activity first. The only order the directory uses.
    #[default]
    LastActivityDesc,
}

/// Incremental directory change pushed by the backend.
///
/// Events arrive in backend-delivery order and are applied in that order,
/// never reordered by the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirectoryEvent {
    /// A conversation appeared or its metadata changed.
    Upserted(Conversation),
    /// New activity on an existing conversation.
    Activity {
        /// The affected conversation.
        id: ConversationId,
        /// New last-activity time.
        at: Timestamp,
    },
}

/// Result of a directory query: one initial snapshot, then a push feed.
#[derive(Debug)]
pub struct DirectoryFeed {
    /// Conversations matching the filter at query time.
    pub initial: Vec<Conversation>,
    /// Incremental updates, in backend-delivery order. Closed by the
    /// backend when the underlying connection goes away.
    pub updates: mpsc::Receiver<DirectoryEvent>,
}

/// Event on a single watched conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConversationEvent {
    /// A message arrived.
    Message {
        /// Who sent it.
        sender: UserId,
        /// Backend-assigned send time.
        sent_at: Timestamp,
        /// Message body.
        body: String,
    },
    /// Conversation metadata changed (name, image, membership).
    Updated(Conversation),
}

/// Capability interface to the remote messaging backend.
///
/// Implementations own transport, persistence, and timeout policy. The
/// contract the core relies on:
///
/// - `connect`/`disconnect` manage the single logical link; the caller
///   guarantees they are never issued concurrently
/// - `get_or_create_direct` canonicalizes by member set: the same pair
///   always yields the same conversation id, regardless of argument order
///   at the call site
/// - streams deliver events in backend order
#[async_trait]
pub trait ChatBackend: Send + Sync + 'static {
    /// Open the link for `identity`, authenticated by `credential`.
    async fn connect(
        &self,
        identity: &Identity,
        credential: &CredentialToken,
    ) -> Result<(), BackendError>;

    /// Tear down the current link. Safe to call when already down.
    async fn disconnect(&self) -> Result<(), BackendError>;

    /// Query conversations and subscribe to subsequent changes.
    async fn query_conversations(
        &self,
        filter: ConversationFilter,
        sort: ConversationSort,
    ) -> Result<DirectoryFeed, BackendError>;

    /// Resolve the canonical 1:1 conversation for `pair`, creating it if
    /// absent. The backend is the single source of truth for which
    /// conversation a pair maps to.
    async fn get_or_create_direct(&self, pair: &MemberPair) -> Result<Conversation, BackendError>;

    /// Begin watching a conversation for live events.
    async fn watch(
        &self,
        id: &ConversationId,
    ) -> Result<mpsc::Receiver<ConversationEvent>, BackendError>;
}
