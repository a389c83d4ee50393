//! Direct conversation resolution.
//!
//! Maps a pair of identities to the single canonical 1:1 conversation
//! between them, creating it on first contact. The backend's
//! get-or-create-by-members operation is the sole canonicalization
//! authority; this module never derives a conversation identifier from the
//! pair itself, which is what keeps `resolve(a, b)` and `resolve(b, a)`
//! landing on the same conversation.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tracing::debug;
use vesper_core::{Conversation, ConversationId, Identity, MemberPair};

use crate::{
    backend::{ChatBackend, ConversationEvent},
    coordinator::ConnectionState,
    error::ClientError,
};

/// What to do when a resolution is requested while the link is not yet
/// connected for the caller's identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResolvePolicy {
    /// Suspend until the coordinator reports connected. The sensible
    /// default for UI flows that start right after login.
    #[default]
    WaitForConnection,
    /// Fail immediately with a retryable error.
    FailFast,
}

/// A live, already-watching reference to one conversation.
///
/// The resolver only returns handles whose backend watch is established, so
/// the caller never observes a window where the conversation exists but
/// events can be missed. Dropping the handle drops the watch.
#[derive(Debug)]
pub struct ConversationHandle {
    /// The resolved conversation.
    pub conversation: Conversation,
    /// Identity the resolution was performed for. Callers must check this
    /// is still the current identity before wiring the handle into UI
    /// state; a handle that raced an identity switch is dropped, not shown.
    pub resolved_for: Identity,
    events: mpsc::Receiver<ConversationEvent>,
}

impl ConversationHandle {
    /// The conversation id.
    pub fn id(&self) -> &ConversationId {
        &self.conversation.id
    }

    /// Next live event, or `None` once the backend closed the watch.
    pub async fn next_event(&mut self) -> Option<ConversationEvent> {
        self.events.recv().await
    }
}

/// Resolves or creates direct conversations for the current identity.
///
/// Holds its own handle to the injected backend plus a view of the
/// coordinator's state; it never mutates connection state.
#[derive(Debug)]
pub struct DirectConversationResolver<B> {
    backend: Arc<B>,
    connection: watch::Receiver<ConnectionState>,
    policy: ResolvePolicy,
}

impl<B: ChatBackend> DirectConversationResolver<B> {
    /// Create a resolver over `backend`, observing the coordinator through
    /// `connection`.
    pub fn new(
        backend: Arc<B>,
        connection: watch::Receiver<ConnectionState>,
        policy: ResolvePolicy,
    ) -> Self {
        Self { backend, connection, policy }
    }

    /// Resolve the canonical conversation between `local` and `target`,
    /// creating it if absent, and begin watching it before returning.
    ///
    /// # Errors
    ///
    /// - [`ClientError::InvalidTarget`] when `local` and `target` are the
    ///   same user; no backend call is made
    /// - [`ClientError::TransientBackend`] when not connected under
    ///   [`ResolvePolicy::FailFast`], or on backend failure (retryable)
    /// - [`ClientError::NotAuthorized`] when `local` may not message
    ///   `target`
    /// - [`ClientError::StaleOperationDiscarded`] when the identity changed
    ///   while the resolution was in flight; callers drop this silently
    pub async fn resolve(
        &self,
        local: &Identity,
        target: &Identity,
    ) -> Result<ConversationHandle, ClientError> {
        let pair = MemberPair::new(local.id.clone(), target.id.clone())
            .map_err(|_| ClientError::InvalidTarget)?;

        self.await_connected(local).await?;

        let conversation = self.backend.get_or_create_direct(&pair).await?;
        let events = self.backend.watch(&conversation.id).await?;

        // The identity may have switched while the backend calls were in
        // flight. The watch is already attached backend-side; dropping the
        // receiver is the soft cancellation.
        if !self.connection.borrow().is_connected_for(local) {
            debug!(conversation = %conversation.id, identity = %local.id,
                   "identity changed during resolution; discarding handle");
            return Err(ClientError::StaleOperationDiscarded);
        }

        Ok(ConversationHandle { conversation, resolved_for: local.clone(), events })
    }

    async fn await_connected(&self, local: &Identity) -> Result<(), ClientError> {
        match self.policy {
            ResolvePolicy::FailFast => {
                let state = self.connection.borrow().clone();
                match state {
                    ConnectionState::Connected(ref identity) if identity == local => Ok(()),
                    ConnectionState::Connected(_) => Err(ClientError::StaleOperationDiscarded),
                    ConnectionState::Idle => Err(ClientError::IdentityMissing),
                    _ => Err(ClientError::TransientBackend {
                        reason: format!("not connected (state: {state:?})"),
                    }),
                }
            },
            ResolvePolicy::WaitForConnection => {
                let mut connection = self.connection.clone();
                connection
                    .wait_for(|state| state.is_connected_for(local))
                    .await
                    .map(|_| ())
                    .map_err(|_| ClientError::TransientBackend {
                        reason: "client stopped".to_string(),
                    })
            },
        }
    }
}

impl<B> Clone for DirectConversationResolver<B> {
    fn clone(&self) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
            connection: self.connection.clone(),
            policy: self.policy,
        }
    }
}
