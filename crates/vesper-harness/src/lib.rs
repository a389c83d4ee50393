//! Test doubles for the Vesper client core.
//!
//! [`FakeBackend`] implements [`ChatBackend`] in memory with two modes:
//! automatic (every call completes immediately) and manual (connects and
//! disconnects park until the test releases them). Manual mode is how the
//! integration tests pin down every interleaving of network response timing
//! against identity transitions.
//!
//! The fakes assert the contracts the real backend would enforce
//! physically: connecting while a link is live panics, because a test that
//! provokes a double-connect has found a real coordinator bug.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![allow(clippy::panic, clippy::unwrap_used, clippy::expect_used)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::{Notify, mpsc, oneshot};
use tracing::debug;
use vesper_client::{
    BackendError, ChatBackend, ConversationEvent, ConversationFilter, ConversationSort,
    DirectoryEvent, DirectoryFeed, IdentityProvider,
};
use vesper_core::{
    Conversation, ConversationId, CredentialToken, Identity, MemberPair, Session, Timestamp,
    UserId,
};

/// One recorded backend call, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    /// `connect` for this user.
    Connect(UserId),
    /// `disconnect`.
    Disconnect,
    /// `query_conversations` filtered to this member.
    Query(UserId),
    /// `get_or_create_direct` for this pair.
    GetOrCreate(MemberPair),
    /// `watch` on this conversation.
    Watch(ConversationId),
}

#[derive(Default)]
struct BackendState {
    connected: Option<UserId>,
    conversations: HashMap<ConversationId, Conversation>,
    by_pair: HashMap<MemberPair, ConversationId>,
    profiles: HashMap<UserId, Identity>,
    denied: HashSet<MemberPair>,
    directory_feeds: Vec<mpsc::Sender<DirectoryEvent>>,
    watchers: HashMap<ConversationId, Vec<mpsc::Sender<ConversationEvent>>>,
    calls: Vec<Call>,
    pending_connects: VecDeque<(Identity, oneshot::Sender<Result<(), BackendError>>)>,
    pending_disconnects: VecDeque<oneshot::Sender<Result<(), BackendError>>>,
    next_conversation: u64,
    clock: u64,
}

/// In-memory [`ChatBackend`].
pub struct FakeBackend {
    state: Mutex<BackendState>,
    /// Manual mode parks connects/disconnects until released.
    manual: bool,
    pending: Notify,
}

impl FakeBackend {
    /// Backend where every call completes immediately.
    pub fn auto() -> Self {
        Self { state: Mutex::new(BackendState::default()), manual: false, pending: Notify::new() }
    }

    /// Backend where connects and disconnects park until the test calls
    /// [`Self::release_connect`] / [`Self::release_disconnect`].
    pub fn manual() -> Self {
        Self { state: Mutex::new(BackendState::default()), manual: true, pending: Notify::new() }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BackendState> {
        self.state.lock().expect("fake backend lock poisoned")
    }

    /// Register a profile used to fill in conversation members.
    pub fn register_profile(&self, identity: Identity) {
        self.lock().profiles.insert(identity.id.clone(), identity);
    }

    /// Make resolution of this pair fail with `NotAuthorized`.
    pub fn deny(&self, pair: MemberPair) {
        self.lock().denied.insert(pair);
    }

    /// All calls recorded so far, in order.
    pub fn calls(&self) -> Vec<Call> {
        self.lock().calls.clone()
    }

    /// Who the backend currently holds a link for.
    pub fn connected(&self) -> Option<UserId> {
        self.lock().connected.clone()
    }

    /// Next value of the fake activity clock.
    pub fn tick(&self) -> Timestamp {
        let mut state = self.lock();
        state.clock += 1;
        Timestamp::from_millis(state.clock)
    }

    /// Seed a pre-existing conversation (history, no events emitted).
    pub fn seed_conversation(&self, member_ids: &[&str], at: Timestamp) -> Conversation {
        let mut state = self.lock();
        let conversation = Self::build_conversation(&mut state, member_ids, at);
        state.conversations.insert(conversation.id.clone(), conversation.clone());
        if let [a, b] = member_ids {
            let pair = MemberPair::new(UserId::new(*a), UserId::new(*b))
                .expect("seeded pair must be distinct");
            state.by_pair.insert(pair, conversation.id.clone());
        }
        conversation
    }

    /// Report new activity on a conversation: bumps its timestamp and
    /// pushes the event to directory subscribers.
    pub async fn push_activity(&self, id: &ConversationId, at: Timestamp) {
        let feeds = {
            let mut state = self.lock();
            let conversation =
                state.conversations.get_mut(id).expect("activity on unknown conversation");
            conversation.last_activity_at = at;
            state.directory_feeds.clone()
        };
        for feed in feeds {
            let _ = feed.send(DirectoryEvent::Activity { id: id.clone(), at }).await;
        }
    }

    /// Deliver a message: watchers see the message, directory subscribers
    /// see the activity bump.
    pub async fn push_message(&self, id: &ConversationId, sender: &UserId, body: &str) {
        let at = self.tick();
        let (feeds, watchers) = {
            let mut state = self.lock();
            let conversation =
                state.conversations.get_mut(id).expect("message to unknown conversation");
            conversation.last_activity_at = at;
            (
                state.directory_feeds.clone(),
                state.watchers.get(id).cloned().unwrap_or_default(),
            )
        };
        for watcher in watchers {
            let _ = watcher
                .send(ConversationEvent::Message {
                    sender: sender.clone(),
                    sent_at: at,
                    body: body.to_string(),
                })
                .await;
        }
        for feed in feeds {
            let _ = feed.send(DirectoryEvent::Activity { id: id.clone(), at }).await;
        }
    }

    /// Announce a conversation to directory subscribers.
    pub async fn push_upsert(&self, conversation: Conversation) {
        let feeds = {
            let mut state = self.lock();
            state.conversations.insert(conversation.id.clone(), conversation.clone());
            state.directory_feeds.clone()
        };
        for feed in feeds {
            let _ = feed.send(DirectoryEvent::Upserted(conversation.clone())).await;
        }
    }

    /// Complete the oldest parked connect with `result`; waits for one to
    /// arrive if none is parked yet. Returns the identity it was issued
    /// for. Manual mode only.
    pub async fn release_connect(&self, result: Result<(), BackendError>) -> Identity {
        assert!(self.manual, "release_connect only makes sense in manual mode");
        loop {
            let notified = self.pending.notified();
            if let Some((identity, tx)) = self.lock().pending_connects.pop_front() {
                let _ = tx.send(result);
                return identity;
            }
            notified.await;
        }
    }

    /// Complete the oldest parked disconnect. Manual mode only.
    pub async fn release_disconnect(&self, result: Result<(), BackendError>) {
        assert!(self.manual, "release_disconnect only makes sense in manual mode");
        loop {
            let notified = self.pending.notified();
            if let Some(tx) = self.lock().pending_disconnects.pop_front() {
                let _ = tx.send(result);
                return;
            }
            notified.await;
        }
    }

    fn finish_connect(&self, identity: &Identity) {
        let mut state = self.lock();
        assert!(
            state.connected.is_none(),
            "double connect: link already live for {:?} when connecting {}",
            state.connected,
            identity.id,
        );
        state.connected = Some(identity.id.clone());
    }

    fn finish_disconnect(&self) {
        let mut state = self.lock();
        state.connected = None;
        // Link down: every feed dies with it.
        state.directory_feeds.clear();
        state.watchers.clear();
    }

    fn build_conversation(
        state: &mut BackendState,
        member_ids: &[&str],
        at: Timestamp,
    ) -> Conversation {
        state.next_conversation += 1;
        let id = ConversationId::new(format!("conv-{:04}", state.next_conversation));
        let members = member_ids
            .iter()
            .map(|m| {
                let user = UserId::new(*m);
                state.profiles.get(&user).cloned().unwrap_or_else(|| Identity::from(*m))
            })
            .collect();
        Conversation { id, members, last_activity_at: at, name: None, image_url: None }
    }
}

#[async_trait]
impl ChatBackend for FakeBackend {
    async fn connect(
        &self,
        identity: &Identity,
        _credential: &CredentialToken,
    ) -> Result<(), BackendError> {
        let gate = {
            let mut state = self.lock();
            state.calls.push(Call::Connect(identity.id.clone()));
            if self.manual {
                let (tx, rx) = oneshot::channel();
                state.pending_connects.push_back((identity.clone(), tx));
                Some(rx)
            } else {
                None
            }
        };

        let result = match gate {
            Some(rx) => {
                self.pending.notify_waiters();
                rx.await.map_err(|_| BackendError::Transport {
                    reason: "test dropped the pending connect".to_string(),
                })?
            },
            None => Ok(()),
        };

        if result.is_ok() {
            self.finish_connect(identity);
        }
        result
    }

    async fn disconnect(&self) -> Result<(), BackendError> {
        let gate = {
            let mut state = self.lock();
            state.calls.push(Call::Disconnect);
            if self.manual {
                let (tx, rx) = oneshot::channel();
                state.pending_disconnects.push_back(tx);
                Some(rx)
            } else {
                None
            }
        };

        let result = match gate {
            Some(rx) => {
                self.pending.notify_waiters();
                rx.await.map_err(|_| BackendError::Transport {
                    reason: "test dropped the pending disconnect".to_string(),
                })?
            },
            None => Ok(()),
        };

        // The link is down even when the backend reported an error.
        self.finish_disconnect();
        result
    }

    async fn query_conversations(
        &self,
        filter: ConversationFilter,
        _sort: ConversationSort,
    ) -> Result<DirectoryFeed, BackendError> {
        let mut state = self.lock();
        state.calls.push(Call::Query(filter.member.clone()));
        if state.connected.as_ref() != Some(&filter.member) {
            return Err(BackendError::NotConnected);
        }

        let initial: Vec<Conversation> = state
            .conversations
            .values()
            .filter(|c| c.has_member(&filter.member))
            .cloned()
            .collect();

        let (tx, updates) = mpsc::channel(32);
        state.directory_feeds.push(tx);
        debug!(member = %filter.member, conversations = initial.len(), "directory feed opened");
        Ok(DirectoryFeed { initial, updates })
    }

    async fn get_or_create_direct(&self, pair: &MemberPair) -> Result<Conversation, BackendError> {
        let (conversation, feeds) = {
            let mut state = self.lock();
            state.calls.push(Call::GetOrCreate(pair.clone()));
            if state.connected.is_none() {
                return Err(BackendError::NotConnected);
            }
            if state.denied.contains(pair) {
                return Err(BackendError::NotAuthorized {
                    reason: format!("{} may not message {}", pair.members()[0], pair.members()[1]),
                });
            }

            if let Some(id) = state.by_pair.get(pair) {
                let existing =
                    state.conversations.get(id).cloned().expect("pair index out of sync");
                (existing, Vec::new())
            } else {
                state.clock += 1;
                let at = Timestamp::from_millis(state.clock);
                let [a, b] = pair.members().map(UserId::as_str);
                let created = Self::build_conversation(&mut state, &[a, b], at);
                state.conversations.insert(created.id.clone(), created.clone());
                state.by_pair.insert(pair.clone(), created.id.clone());
                (created, state.directory_feeds.clone())
            }
        };

        // A newly created conversation shows up in live directories.
        for feed in feeds {
            let _ = feed.send(DirectoryEvent::Upserted(conversation.clone())).await;
        }
        Ok(conversation)
    }

    async fn watch(
        &self,
        id: &ConversationId,
    ) -> Result<mpsc::Receiver<ConversationEvent>, BackendError> {
        let mut state = self.lock();
        state.calls.push(Call::Watch(id.clone()));
        if state.connected.is_none() {
            return Err(BackendError::NotConnected);
        }
        if !state.conversations.contains_key(id) {
            return Err(BackendError::InvalidRequest { reason: format!("unknown conversation {id}") });
        }
        let (tx, rx) = mpsc::channel(32);
        state.watchers.entry(id.clone()).or_default().push(tx);
        Ok(rx)
    }
}

impl std::fmt::Debug for FakeBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("FakeBackend")
            .field("manual", &self.manual)
            .field("connected", &state.connected)
            .field("conversations", &state.conversations.len())
            .finish()
    }
}

struct ProviderState {
    current: Session,
    subscribers: Vec<mpsc::Sender<Session>>,
    profiles: Vec<Identity>,
}

/// Scriptable [`IdentityProvider`].
pub struct FakeProvider {
    state: Mutex<ProviderState>,
}

impl FakeProvider {
    /// Provider with nobody signed in.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ProviderState {
                current: Session::Absent,
                subscribers: Vec::new(),
                profiles: Vec::new(),
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ProviderState> {
        self.state.lock().expect("fake provider lock poisoned")
    }

    /// Replace the session and notify every subscriber.
    pub fn set_session(&self, session: Session) {
        let mut state = self.lock();
        state.current = session.clone();
        state.subscribers.retain(|tx| tx.try_send(session.clone()).is_ok());
    }

    /// Sign `identity` in with a development token.
    pub fn sign_in(&self, identity: Identity) {
        self.set_session(Session::valid_dev(identity));
    }

    /// Sign the current user out.
    pub fn sign_out(&self) {
        self.set_session(Session::Absent);
    }

    /// Add a searchable profile.
    pub fn add_profile(&self, identity: Identity) {
        self.lock().profiles.push(identity);
    }
}

impl Default for FakeProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl IdentityProvider for FakeProvider {
    async fn current_session(&self) -> Session {
        self.lock().current.clone()
    }

    fn session_events(&self) -> mpsc::Receiver<Session> {
        let (tx, rx) = mpsc::channel(32);
        self.lock().subscribers.push(tx);
        rx
    }

    async fn fetch_profile(&self, id: &UserId) -> Result<Option<Identity>, BackendError> {
        Ok(self.lock().profiles.iter().find(|p| &p.id == id).cloned())
    }

    async fn search_profiles(&self, query: &str) -> Result<Vec<Identity>, BackendError> {
        let needle = query.to_lowercase();
        Ok(self
            .lock()
            .profiles
            .iter()
            .filter(|p| p.display_name.to_lowercase().contains(&needle))
            .cloned()
            .collect())
    }
}

impl std::fmt::Debug for FakeProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FakeProvider").field("session", &self.lock().current).finish()
    }
}
