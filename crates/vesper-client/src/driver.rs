//! Production driver.
//!
//! [`ChatClient`] wires the pure state machines to real I/O: it runs the
//! single event loop, executes coordinator actions against the injected
//! backend, manages the directory subscription task, and publishes state
//! through `watch` channels.
//!
//! # Architecture
//!
//! ```text
//! ChatClient
//!   ├─ IdentityStore            (session feed from the provider)
//!   ├─ ConnectionCoordinator    (pure state machine)
//!   ├─ ConversationDirectory    (pure sorted directory, in its own task)
//!   └─ ChatBackend              (injected, exclusively owned here)
//! ```
//!
//! All core logic runs on one cooperative event loop; connects,
//! disconnects, and the directory feed run as spawned tasks whose *results*
//! come back through the loop, so ordering decisions are made in exactly
//! one place.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, warn};
use vesper_core::{Conversation, Identity, Session};

use crate::{
    backend::{ChatBackend, ConversationFilter, ConversationSort},
    coordinator::{ConnectionCoordinator, ConnectionState, CoordinatorAction, CoordinatorEvent},
    directory::ConversationDirectory,
    error::ClientError,
    provider::{IdentityProvider, IdentityStore},
    resolver::{DirectConversationResolver, ResolvePolicy},
};

/// Driver configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// What resolutions do when the link is not yet up.
    pub resolve_policy: ResolvePolicy,
    /// Capacity of the completion channel feeding the event loop.
    pub op_channel_capacity: usize,
    /// Capacity of the surfaced-failure channel.
    pub failure_channel_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            resolve_policy: ResolvePolicy::WaitForConnection,
            op_channel_capacity: 32,
            failure_channel_capacity: 8,
        }
    }
}

/// The running client core.
///
/// Owns the backend instance and the event loop task. Dropping the client
/// stops the loop and every subscription task.
pub struct ChatClient<B, P> {
    backend: Arc<B>,
    identities: Arc<IdentityStore<P>>,
    config: ClientConfig,
    connection: watch::Receiver<ConnectionState>,
    directory: watch::Receiver<Vec<Conversation>>,
    failures: Option<mpsc::Receiver<ClientError>>,
    ops_tx: mpsc::Sender<CoordinatorEvent>,
    task: tokio::task::JoinHandle<()>,
}

impl<B: ChatBackend, P: IdentityProvider> ChatClient<B, P> {
    /// Start the event loop against `backend`, following sessions from
    /// `identities`.
    pub fn start(backend: Arc<B>, identities: IdentityStore<P>, config: ClientConfig) -> Self {
        let identities = Arc::new(identities);
        let (connection_tx, connection) = watch::channel(ConnectionState::Idle);
        let (directory_tx, directory) = watch::channel(Vec::new());
        let (ops_tx, ops_rx) = mpsc::channel(config.op_channel_capacity);
        let (failures_tx, failures) = mpsc::channel(config.failure_channel_capacity);

        let task = tokio::spawn(run_loop(
            Arc::clone(&backend),
            identities.subscribe(),
            ops_tx.clone(),
            ops_rx,
            connection_tx,
            Arc::new(DirectoryPublisher::new(directory_tx)),
            failures_tx,
        ));

        Self {
            backend,
            identities,
            config,
            connection,
            directory,
            failures: Some(failures),
            ops_tx,
            task,
        }
    }

    /// Observe the connection state machine.
    pub fn connection(&self) -> watch::Receiver<ConnectionState> {
        self.connection.clone()
    }

    /// Observe the sorted conversation directory. Empty whenever no
    /// identity is connected.
    pub fn directory(&self) -> watch::Receiver<Vec<Conversation>> {
        self.directory.clone()
    }

    /// Build a resolver sharing this client's backend and connection view.
    pub fn resolver(&self) -> DirectConversationResolver<B> {
        DirectConversationResolver::new(
            Arc::clone(&self.backend),
            self.connection.clone(),
            self.config.resolve_policy,
        )
    }

    /// The identity store backing this client.
    pub fn identities(&self) -> &IdentityStore<P> {
        &self.identities
    }

    /// Surfaced recoverable failures (connect failures). Takeable once.
    pub fn take_failures(&mut self) -> Option<mpsc::Receiver<ClientError>> {
        self.failures.take()
    }

    /// Force a re-attempt after a connect failure. No-op while connected
    /// or while an operation is already in flight.
    pub async fn refresh(&self) {
        if self.ops_tx.send(CoordinatorEvent::Refresh).await.is_err() {
            warn!("refresh requested after event loop stopped");
        }
    }
}

impl<B, P> Drop for ChatClient<B, P> {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl<B, P> std::fmt::Debug for ChatClient<B, P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatClient").field("connection", &*self.connection.borrow()).finish()
    }
}

/// Handle on the running directory subscription task.
struct DirectorySub {
    shutdown: Option<oneshot::Sender<()>>,
    task: tokio::task::JoinHandle<()>,
}

impl DirectorySub {
    /// Idempotent teardown.
    fn close(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            drop(shutdown);
        }
    }
}

impl Drop for DirectorySub {
    fn drop(&mut self) {
        self.close();
        self.task.abort();
    }
}

/// Generation-gated writer for the directory watch channel.
///
/// The subscription task races its own teardown: a feed event can be in
/// flight inside [`run_directory`] at the moment the event loop closes the
/// subscription, and a publish landing after the close would resurrect the
/// old identity's entries. Same discipline as the coordinator's operation
/// tokens: every subscription gets a generation, and a publish quoting a
/// retired generation is dropped. Generation check and channel write happen
/// under one lock, so close-then-clear is atomic against late publishers.
struct DirectoryPublisher {
    tx: watch::Sender<Vec<Conversation>>,
    current: std::sync::Mutex<u64>,
}

impl DirectoryPublisher {
    fn new(tx: watch::Sender<Vec<Conversation>>) -> Self {
        Self { tx, current: std::sync::Mutex::new(0) }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, u64> {
        self.current.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Start a new subscription generation; older generations are retired.
    fn open(&self) -> u64 {
        let mut current = self.lock();
        *current += 1;
        *current
    }

    /// Retire the live generation and clear the published snapshot.
    fn close(&self) {
        let mut current = self.lock();
        *current += 1;
        self.tx.send_replace(Vec::new());
    }

    /// Publish `entries` for `generation`. Dropped if the generation was
    /// retired; returns whether the publish landed.
    fn publish(&self, generation: u64, entries: Vec<Conversation>) -> bool {
        let current = self.lock();
        if *current != generation {
            debug!(generation, "dropping publish for retired directory subscription");
            return false;
        }
        self.tx.send_replace(entries);
        true
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_loop<B: ChatBackend>(
    backend: Arc<B>,
    mut sessions: watch::Receiver<Session>,
    ops_tx: mpsc::Sender<CoordinatorEvent>,
    mut ops_rx: mpsc::Receiver<CoordinatorEvent>,
    connection_tx: watch::Sender<ConnectionState>,
    directory_tx: Arc<DirectoryPublisher>,
    failures_tx: mpsc::Sender<ClientError>,
) {
    let mut coordinator = ConnectionCoordinator::new();
    let mut directory_sub: Option<DirectorySub> = None;

    // Seed with whatever session the store already has; the watch channel
    // then wakes us for every replacement (coalesced to the latest, which
    // is exactly what reconciliation wants).
    let initial = sessions.borrow_and_update().clone();
    dispatch(
        CoordinatorEvent::SessionChanged(initial),
        &mut coordinator,
        &mut directory_sub,
        &backend,
        &ops_tx,
        &connection_tx,
        &directory_tx,
        &failures_tx,
    );

    loop {
        let event = tokio::select! {
            changed = sessions.changed() => match changed {
                Ok(()) => CoordinatorEvent::SessionChanged(sessions.borrow_and_update().clone()),
                // Identity store dropped: the client is shutting down.
                Err(_) => break,
            },
            op = ops_rx.recv() => match op {
                Some(event) => event,
                None => break,
            },
        };
        dispatch(
            event,
            &mut coordinator,
            &mut directory_sub,
            &backend,
            &ops_tx,
            &connection_tx,
            &directory_tx,
            &failures_tx,
        );
    }

    debug!("event loop stopped");
}

/// Feed one event through the coordinator and execute the resulting
/// actions. Action execution never blocks the loop: backend calls run in
/// spawned tasks and report back through `ops_tx`.
#[allow(clippy::too_many_arguments)]
fn dispatch<B: ChatBackend>(
    event: CoordinatorEvent,
    coordinator: &mut ConnectionCoordinator,
    directory_sub: &mut Option<DirectorySub>,
    backend: &Arc<B>,
    ops_tx: &mpsc::Sender<CoordinatorEvent>,
    connection_tx: &watch::Sender<ConnectionState>,
    directory_tx: &Arc<DirectoryPublisher>,
    failures_tx: &mpsc::Sender<ClientError>,
) {
    for action in coordinator.handle(event) {
        match action {
            CoordinatorAction::Connect { token, identity, credential } => {
                let backend = Arc::clone(backend);
                let ops_tx = ops_tx.clone();
                tokio::spawn(async move {
                    let result = backend.connect(&identity, &credential).await;
                    let _ = ops_tx.send(CoordinatorEvent::ConnectCompleted { token, result }).await;
                });
            },
            CoordinatorAction::Disconnect { token } => {
                let backend = Arc::clone(backend);
                let ops_tx = ops_tx.clone();
                tokio::spawn(async move {
                    let result = backend.disconnect().await;
                    let _ =
                        ops_tx.send(CoordinatorEvent::DisconnectCompleted { token, result }).await;
                });
            },
            CoordinatorAction::OpenDirectory { identity } => {
                // The coordinator always closes before reopening; the take
                // here only matters if that contract is ever broken.
                if let Some(mut stale) = directory_sub.take() {
                    warn!("directory subscription still open at reopen; closing it");
                    stale.close();
                }
                let generation = directory_tx.open();
                let (shutdown_tx, shutdown_rx) = oneshot::channel();
                let task = tokio::spawn(run_directory(
                    Arc::clone(backend),
                    identity,
                    Arc::clone(directory_tx),
                    generation,
                    shutdown_rx,
                ));
                *directory_sub = Some(DirectorySub { shutdown: Some(shutdown_tx), task });
            },
            CoordinatorAction::CloseDirectory => {
                if let Some(mut sub) = directory_sub.take() {
                    sub.close();
                }
                directory_tx.close();
            },
            CoordinatorAction::NotifyConnectFailed { identity, reason } => {
                let error = ClientError::ConnectFailure { identity: identity.id, reason };
                if failures_tx.try_send(error).is_err() {
                    debug!("failure channel full or closed; failure already logged");
                }
            },
        }
    }
    connection_tx.send_replace(coordinator.state().clone());
}

/// Directory subscription task: one backend query, then push events applied
/// in delivery order until shutdown or feed close. Publishes are tagged
/// with this subscription's generation; once the event loop retires it,
/// anything still in flight here lands nowhere.
async fn run_directory<B: ChatBackend>(
    backend: Arc<B>,
    identity: Identity,
    directory_tx: Arc<DirectoryPublisher>,
    generation: u64,
    mut shutdown: oneshot::Receiver<()>,
) {
    let filter = ConversationFilter { member: identity.id.clone() };
    let feed = tokio::select! {
        result = backend.query_conversations(filter, ConversationSort::LastActivityDesc) => {
            match result {
                Ok(feed) => feed,
                Err(err) => {
                    // The directory stays empty until the next connected
                    // period; the connection itself is unaffected.
                    warn!(identity = %identity.id, error = %err, "directory query failed");
                    return;
                },
            }
        },
        _ = &mut shutdown => return,
    };

    let mut directory = ConversationDirectory::new(identity.id.clone());
    directory.apply_initial(feed.initial);
    if !directory_tx.publish(generation, directory.entries().to_vec()) {
        return;
    }
    debug!(identity = %identity.id, conversations = directory.len(), "directory subscribed");

    let mut updates = feed.updates;
    loop {
        tokio::select! {
            biased;
            _ = &mut shutdown => break,
            event = updates.recv() => match event {
                Some(event) => {
                    if directory.apply(event)
                        && !directory_tx.publish(generation, directory.entries().to_vec())
                    {
                        break;
                    }
                },
                // Backend closed the feed, typically because the link went
                // down; the coordinator handles the rest.
                None => break,
            },
        }
    }
    debug!(identity = %identity.id, "directory subscription closed");
}
