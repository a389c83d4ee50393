//! Vesper client core.
//!
//! Session-bound connection lifecycle and conversation-directory
//! coordination for a real-time direct-message client. The core reconciles
//! two independently changing sources of truth, the identity provider and
//! the remote messaging backend, without leaking stale connections,
//! duplicating conversations, or racing two identity transitions against
//! each other.
//!
//! # Architecture
//!
//! The decision-making pieces are pure state machines (events in, actions
//! out); one tokio event loop executes their actions and feeds completions
//! back. Every connect/disconnect carries an [`OpToken`]; completions with
//! a superseded token are discarded, never applied. That tagging is the
//! whole concurrency story: there is no hard cancellation and no lock
//! ordering to get wrong.
//!
//! # Components
//!
//! - [`ConnectionCoordinator`]: the connect/disconnect state machine
//! - [`ConversationDirectory`]: sorted, deduplicated conversation list
//! - [`DirectConversationResolver`]: canonical 1:1 conversation resolution
//! - [`ChatClient`]: the driver tying them to a [`ChatBackend`] and an
//!   [`IdentityProvider`]

#![forbid(unsafe_code)]
#![deny(missing_docs)]

mod backend;
mod coordinator;
mod directory;
mod driver;
mod error;
mod provider;
mod resolver;

pub use backend::{
    BackendError, ChatBackend, ConversationEvent, ConversationFilter, ConversationSort,
    DirectoryEvent, DirectoryFeed,
};
pub use coordinator::{
    ConnectionCoordinator, ConnectionState, CoordinatorAction, CoordinatorEvent, OpToken,
};
pub use directory::ConversationDirectory;
pub use driver::{ChatClient, ClientConfig};
pub use error::ClientError;
pub use provider::{IdentityProvider, IdentityStore};
pub use resolver::{ConversationHandle, DirectConversationResolver, ResolvePolicy};
pub use vesper_core::{
    Conversation, ConversationId, CredentialToken, Identity, MemberPair, SelfPairError, Session,
    Timestamp, UserId,
};
