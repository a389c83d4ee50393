//! Connection coordinator state machine.
//!
//! Owns the lifecycle of the single logical backend link and keeps it
//! synchronized with the current session. Pure state machine: events in,
//! actions out, caller handles I/O. This keeps every interleaving of
//! network response timing testable without a runtime.
//!
//! # Serialization
//!
//! At most one connect or disconnect is in flight at any time. An identity
//! switch while connected always drains the old link before the new connect
//! is issued. There is no hard cancellation: an in-flight operation for a
//! superseded identity runs to completion at the backend, and its completion
//! is recognized by [`OpToken`] and discarded (or drained, if it left a live
//! link behind).
//!
//! # Invariants
//!
//! - An operation is in flight if and only if the state is
//!   [`ConnectionState::Connecting`] or [`ConnectionState::Disconnecting`]
//! - A [`CoordinatorAction::Connect`] is never emitted while a link is live
//!   or a drain is pending
//! - Completions whose token is not the in-flight token never mutate state

use tracing::{debug, info, warn};
use vesper_core::{CredentialToken, Identity, Session};

use crate::backend::BackendError;

/// Tag for one issued connect or disconnect.
///
/// Tokens are unique per coordinator and never reused, so a completion
/// carrying a stale token can always be told apart from the current
/// operation, regardless of timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OpToken(u64);

impl OpToken {
    /// Raw counter value, for logging.
    pub const fn value(self) -> u64 {
        self.0
    }
}

/// Where the link currently is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    /// No link, nothing in flight.
    Idle,
    /// A connect for this identity is in flight.
    Connecting(Identity),
    /// The link is live for this identity.
    Connected(Identity),
    /// A disconnect for this identity's link is in flight.
    Disconnecting(Identity),
    /// The last connect for this identity failed. Behaves like
    /// [`Self::Idle`] for subsequent events; recorded so callers can show
    /// why they are offline. No retry happens until the next identity event
    /// or forced refresh.
    Failed {
        /// Identity the failed connect was issued for.
        identity: Identity,
        /// Backend-reported reason.
        reason: String,
    },
}

impl ConnectionState {
    /// The identity the link is live for, if any.
    pub fn connected_identity(&self) -> Option<&Identity> {
        match self {
            Self::Connected(identity) => Some(identity),
            _ => None,
        }
    }

    /// Whether the link is live for exactly this identity.
    pub fn is_connected_for(&self, identity: &Identity) -> bool {
        self.connected_identity() == Some(identity)
    }
}

/// Events fed into the coordinator.
#[derive(Debug)]
pub enum CoordinatorEvent {
    /// The identity provider reported a new session.
    SessionChanged(Session),
    /// Caller asks for a re-attempt after a failure. No-op unless a connect
    /// is actually wanted and not underway.
    Refresh,
    /// An issued connect finished.
    ConnectCompleted {
        /// Token the connect was issued with.
        token: OpToken,
        /// Backend result.
        result: Result<(), BackendError>,
    },
    /// An issued disconnect finished.
    DisconnectCompleted {
        /// Token the disconnect was issued with.
        token: OpToken,
        /// Backend result. Failures are recovered locally: the link is
        /// treated as down either way.
        result: Result<(), BackendError>,
    },
}

/// Actions for the driver to execute.
#[derive(Debug, Clone, PartialEq)]
pub enum CoordinatorAction {
    /// Issue `backend.connect` and feed the result back as
    /// [`CoordinatorEvent::ConnectCompleted`] with the same token.
    Connect {
        /// Token identifying this operation.
        token: OpToken,
        /// Identity to connect as.
        identity: Identity,
        /// Credential to present.
        credential: CredentialToken,
    },
    /// Issue `backend.disconnect` and feed the result back as
    /// [`CoordinatorEvent::DisconnectCompleted`] with the same token.
    Disconnect {
        /// Token identifying this operation.
        token: OpToken,
    },
    /// The link is live: open the directory subscription for this identity.
    OpenDirectory {
        /// Identity the directory belongs to.
        identity: Identity,
    },
    /// Tear down the directory subscription. Always emitted before the
    /// disconnect that ends a connected period, so the subscription is gone
    /// before the state returns to idle.
    CloseDirectory,
    /// Surface a recoverable connect failure to the caller.
    NotifyConnectFailed {
        /// Identity the connect was issued for.
        identity: Identity,
        /// Backend-reported reason.
        reason: String,
    },
}

#[derive(Debug)]
struct InFlight {
    token: OpToken,
    op: InFlightOp,
}

#[derive(Debug)]
enum InFlightOp {
    Connect(Identity),
    Disconnect,
}

/// Drives the connection state machine in response to identity changes.
#[derive(Debug)]
pub struct ConnectionCoordinator {
    state: ConnectionState,
    /// What the most recent session wants the link to be.
    desired: Option<(Identity, CredentialToken)>,
    in_flight: Option<InFlight>,
    next_token: u64,
    stale_discarded: u64,
}

impl ConnectionCoordinator {
    /// Create a coordinator with no session.
    pub fn new() -> Self {
        Self {
            state: ConnectionState::Idle,
            desired: None,
            in_flight: None,
            next_token: 0,
            stale_discarded: 0,
        }
    }

    /// Current state.
    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    /// The identity the coordinator is trying to keep connected, if any.
    pub fn desired_identity(&self) -> Option<&Identity> {
        self.desired.as_ref().map(|(identity, _)| identity)
    }

    /// Whether a connect or disconnect is currently in flight.
    pub fn has_in_flight(&self) -> bool {
        self.in_flight.is_some()
    }

    /// How many completions were discarded as stale. Diagnostic only; stale
    /// discards are internal and never surface to the user.
    pub fn stale_discarded(&self) -> u64 {
        self.stale_discarded
    }

    /// Process an event and return the actions to execute.
    pub fn handle(&mut self, event: CoordinatorEvent) -> Vec<CoordinatorAction> {
        match event {
            CoordinatorEvent::SessionChanged(session) => self.handle_session(&session),
            CoordinatorEvent::Refresh => self.handle_refresh(),
            CoordinatorEvent::ConnectCompleted { token, result } => {
                self.handle_connect_completed(token, result)
            },
            CoordinatorEvent::DisconnectCompleted { token, result } => {
                self.handle_disconnect_completed(token, &result)
            },
        }
    }

    /// Keep the link connected for `identity`. Idempotent: a no-op when the
    /// link is already live (or being established) for the same identity; a
    /// different identity drains the old link first.
    pub fn ensure_connected_for(
        &mut self,
        identity: Identity,
        credential: CredentialToken,
    ) -> Vec<CoordinatorAction> {
        self.handle(CoordinatorEvent::SessionChanged(Session::Valid { identity, credential }))
    }

    /// Drop any link. Safe from every state, including idle.
    pub fn disconnect_all(&mut self) -> Vec<CoordinatorAction> {
        self.handle(CoordinatorEvent::SessionChanged(Session::Absent))
    }

    fn handle_session(&mut self, session: &Session) -> Vec<CoordinatorAction> {
        self.desired = session
            .connectable()
            .map(|(identity, credential)| (identity.clone(), credential.clone()));

        if self.in_flight.is_some() {
            // Serialized: the pending completion will reconcile against the
            // updated desired identity.
            debug!(desired = ?self.desired_identity().map(|i| i.id.as_str()),
                   "session changed while operation in flight; deferring");
            return Vec::new();
        }
        self.reconcile()
    }

    fn handle_refresh(&mut self) -> Vec<CoordinatorAction> {
        if self.in_flight.is_some() {
            return Vec::new();
        }
        self.reconcile()
    }

    fn handle_connect_completed(
        &mut self,
        token: OpToken,
        result: Result<(), BackendError>,
    ) -> Vec<CoordinatorAction> {
        let Some(identity) = self.take_in_flight_connect(token) else {
            self.discard_stale(token, "connect");
            return Vec::new();
        };

        let still_wanted = self.desired_identity() == Some(&identity);

        match result {
            Ok(()) if still_wanted => {
                info!(identity = %identity.id, "connected");
                self.state = ConnectionState::Connected(identity.clone());
                vec![CoordinatorAction::OpenDirectory { identity }]
            },
            Ok(()) => {
                // The backend now holds a live link for a superseded
                // identity. Drain it before anything else; the result itself
                // is discarded.
                self.stale_discarded += 1;
                debug!(identity = %identity.id, "connect for superseded identity; draining");
                self.state = ConnectionState::Disconnecting(identity);
                vec![self.issue_disconnect()]
            },
            Err(err) if still_wanted => {
                warn!(identity = %identity.id, error = %err, "connect failed");
                let reason = err.to_string();
                self.state =
                    ConnectionState::Failed { identity: identity.clone(), reason: reason.clone() };
                vec![CoordinatorAction::NotifyConnectFailed { identity, reason }]
            },
            Err(err) => {
                // Failed connect for a superseded identity: nothing to
                // drain, nothing to surface. Move on to whatever the current
                // session wants.
                self.stale_discarded += 1;
                debug!(identity = %identity.id, error = %err,
                       "connect for superseded identity failed; discarding");
                self.state = ConnectionState::Idle;
                self.reconcile()
            },
        }
    }

    fn handle_disconnect_completed(
        &mut self,
        token: OpToken,
        result: &Result<(), BackendError>,
    ) -> Vec<CoordinatorAction> {
        match &self.in_flight {
            Some(op) if op.token == token && matches!(op.op, InFlightOp::Disconnect) => {},
            _ => {
                self.discard_stale(token, "disconnect");
                return Vec::new();
            },
        }
        self.in_flight = None;

        if let Err(err) = result {
            // Recovered locally: the link is considered down regardless.
            warn!(error = %err, "disconnect reported failure; treating link as down");
        }
        debug!("disconnected");
        self.state = ConnectionState::Idle;
        self.reconcile()
    }

    /// Close the gap between `state` and `desired`. Only called with no
    /// operation in flight; issues at most one operation.
    fn reconcile(&mut self) -> Vec<CoordinatorAction> {
        debug_assert!(self.in_flight.is_none());

        match (&self.state, &self.desired) {
            (ConnectionState::Connected(current), Some((wanted, _))) if current == wanted => {
                Vec::new()
            },
            (ConnectionState::Connected(current), _) => {
                // Logout or identity switch: the directory goes down first,
                // then the link drains. Any reconnect waits for completion.
                let current = current.clone();
                info!(identity = %current.id, "draining connection");
                self.state = ConnectionState::Disconnecting(current);
                vec![CoordinatorAction::CloseDirectory, self.issue_disconnect()]
            },
            (
                ConnectionState::Idle | ConnectionState::Failed { .. },
                Some((identity, credential)),
            ) => {
                let identity = identity.clone();
                let credential = credential.clone();
                info!(identity = %identity.id, "connecting");
                self.state = ConnectionState::Connecting(identity.clone());
                let token = self.issue(InFlightOp::Connect(identity.clone()));
                vec![CoordinatorAction::Connect { token, identity, credential }]
            },
            (ConnectionState::Failed { .. }, None) => {
                self.state = ConnectionState::Idle;
                Vec::new()
            },
            (ConnectionState::Idle, None) => Vec::new(),
            (ConnectionState::Connecting(_) | ConnectionState::Disconnecting(_), _) => {
                // Unreachable while the in-flight invariant holds.
                Vec::new()
            },
        }
    }

    fn issue(&mut self, op: InFlightOp) -> OpToken {
        let token = OpToken(self.next_token);
        self.next_token += 1;
        self.in_flight = Some(InFlight { token, op });
        token
    }

    fn issue_disconnect(&mut self) -> CoordinatorAction {
        let token = self.issue(InFlightOp::Disconnect);
        CoordinatorAction::Disconnect { token }
    }

    fn take_in_flight_connect(&mut self, token: OpToken) -> Option<Identity> {
        match &self.in_flight {
            Some(op) if op.token == token && matches!(op.op, InFlightOp::Connect(_)) => {
                match self.in_flight.take() {
                    Some(InFlight { op: InFlightOp::Connect(identity), .. }) => Some(identity),
                    _ => None,
                }
            },
            _ => None,
        }
    }

    fn discard_stale(&mut self, token: OpToken, kind: &str) {
        self.stale_discarded += 1;
        debug!(token = token.value(), kind, "discarding completion with stale token");
    }
}

impl Default for ConnectionCoordinator {
    fn default() -> Self {
        Self::new()
    }
}
