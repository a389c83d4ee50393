//! Identity provider capability interface and session store.
//!
//! The identity provider is the external auth collaborator: it owns
//! sessions, replaces them on sign-in/sign-out, and answers profile
//! lookups. The core only reads it. [`IdentityStore`] sits between the
//! provider and the rest of the client: it mirrors the latest session into
//! a `watch` channel the driver consumes, and adds the self-excluding
//! profile search used when starting a new conversation.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tracing::debug;
use vesper_core::{Identity, Session, UserId};

use crate::{backend::BackendError, error::ClientError};

/// Capability interface to the identity/session source.
#[async_trait]
pub trait IdentityProvider: Send + Sync + 'static {
    /// The session as the provider currently knows it.
    async fn current_session(&self) -> Session;

    /// Subscribe to session replacements. Each subscriber gets every
    /// subsequent session, in order.
    fn session_events(&self) -> mpsc::Receiver<Session>;

    /// Look up one profile. `None` when the user has not created one yet;
    /// a missing profile is not an error.
    async fn fetch_profile(&self, id: &UserId) -> Result<Option<Identity>, BackendError>;

    /// Case-insensitive substring search over profile names.
    async fn search_profiles(&self, query: &str) -> Result<Vec<Identity>, BackendError>;
}

/// Holds the current authenticated identity and emits identity-change
/// events.
///
/// Wraps a provider and forwards its session feed into a `watch` channel,
/// so consumers always observe the *latest* session even when transitions
/// arrive faster than they are handled. Only the newest session matters to
/// the connection coordinator, so coalescing under load is correct here.
pub struct IdentityStore<P> {
    provider: Arc<P>,
    sessions: watch::Receiver<Session>,
    _forwarder: tokio::task::JoinHandle<()>,
}

impl<P: IdentityProvider> IdentityStore<P> {
    /// Start mirroring `provider`.
    pub async fn new(provider: Arc<P>) -> Self {
        let initial = provider.current_session().await;
        let (tx, sessions) = watch::channel(initial);

        let mut events = provider.session_events();
        let forwarder = tokio::spawn(async move {
            while let Some(session) = events.recv().await {
                debug!(valid = session.is_valid(), "session replaced");
                tx.send_replace(session);
            }
        });

        Self { provider, sessions, _forwarder: forwarder }
    }

    /// The session as most recently observed.
    pub fn current(&self) -> Session {
        self.sessions.borrow().clone()
    }

    /// The current identity, when a session exists (valid or expired).
    pub fn current_identity(&self) -> Option<Identity> {
        self.sessions.borrow().identity().cloned()
    }

    /// Watch session replacements. The receiver always starts at the
    /// latest value.
    pub fn subscribe(&self) -> watch::Receiver<Session> {
        self.sessions.clone()
    }

    /// Search profiles by name, excluding the searcher's own profile.
    ///
    /// # Errors
    ///
    /// [`ClientError::IdentityMissing`] without a current identity;
    /// provider failures map through [`ClientError::from`].
    pub async fn search(&self, query: &str) -> Result<Vec<Identity>, ClientError> {
        let Some(me) = self.current_identity() else {
            return Err(ClientError::IdentityMissing);
        };
        let results = self.provider.search_profiles(query).await?;
        Ok(results.into_iter().filter(|profile| profile.id != me.id).collect())
    }

    /// Fetch one profile by id.
    pub async fn fetch_profile(&self, id: &UserId) -> Result<Option<Identity>, ClientError> {
        Ok(self.provider.fetch_profile(id).await?)
    }
}

impl<P> Drop for IdentityStore<P> {
    fn drop(&mut self) {
        self._forwarder.abort();
    }
}

impl<P> std::fmt::Debug for IdentityStore<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityStore").field("session", &*self.sessions.borrow()).finish()
    }
}
