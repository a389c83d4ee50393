//! Vesper data model.
//!
//! Plain model types shared by the connection coordinator, the conversation
//! directory, and the direct-conversation resolver. This crate performs no
//! I/O: identities and sessions are produced by an external identity
//! provider, conversations are owned by the remote messaging backend, and
//! both are only *described* here.
//!
//! # Components
//!
//! - [`Identity`], [`Session`], [`CredentialToken`]: the authenticated-user
//!   side of the model
//! - [`Conversation`], [`MemberPair`], [`Timestamp`]: the messaging side

#![forbid(unsafe_code)]
#![deny(missing_docs)]

mod conversation;
mod identity;

pub use conversation::{Conversation, ConversationId, MemberPair, SelfPairError, Timestamp};
pub use identity::{CredentialToken, Identity, Session, UserId};
