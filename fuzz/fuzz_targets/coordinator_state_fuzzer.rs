//! Fuzz target for the [`ConnectionCoordinator`] state machine
//!
//! Prevent connection leaks and double-connects via racing identity events
//!
//! # Strategy
//!
//! - Event sequences: Arbitrary interleavings of session changes, refreshes,
//!   and backend completions
//! - Duplicate completions: Replay tokens of already-completed operations,
//!   probing the stale-token discard path
//! - Failure injection: Arbitrary success/failure on every completion
//!
//! # Invariants
//!
//! - At most one connect/disconnect in flight, ever
//! - A `Connect` action is NEVER issued while the model backend holds a link
//! - A `Disconnect` action is NEVER issued while the directory is open
//! - `OpenDirectory` only ever fires for the identity the link is live for
//! - Completions with retired tokens never produce actions or change state
//! - NEVER panic on any event sequence

#![no_main]

use std::collections::VecDeque;

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use vesper_client::{
    BackendError, ConnectionCoordinator, ConnectionState, CoordinatorAction, CoordinatorEvent,
    OpToken,
};
use vesper_core::{Identity, Session};

#[derive(Debug, Clone, Arbitrary)]
enum FuzzEvent {
    SignIn { user: u8 },
    SignInWithAvatar { user: u8, avatar: u8 },
    SessionExpired { user: u8 },
    SignOut,
    Refresh,
    /// Complete the pending operation.
    Complete { ok: bool },
    /// Replay a completion for an operation that already finished.
    ReplayRetired { index: u8, ok: bool },
}

#[derive(Debug, Clone, Copy)]
enum OpKind {
    Connect,
    Disconnect,
}

#[derive(Debug)]
struct PendingOp {
    token: OpToken,
    kind: OpKind,
    identity: Option<Identity>,
}

fn user(n: u8) -> Identity {
    Identity::from(format!("user-{}", n % 4).as_str())
}

fn result_of(ok: bool) -> Result<(), BackendError> {
    if ok {
        Ok(())
    } else {
        Err(BackendError::Transport { reason: "fuzzed failure".to_string() })
    }
}

fuzz_target!(|events: Vec<FuzzEvent>| {
    let mut coordinator = ConnectionCoordinator::new();
    let mut pending: VecDeque<PendingOp> = VecDeque::new();
    let mut retired: Vec<(OpToken, OpKind)> = Vec::new();
    let mut live: Option<Identity> = None;
    let mut directory: Option<Identity> = None;

    for event in events {
        let coordinator_event = match event {
            FuzzEvent::SignIn { user: n } => {
                CoordinatorEvent::SessionChanged(Session::valid_dev(user(n)))
            },
            FuzzEvent::SignInWithAvatar { user: n, avatar } => {
                let identity = user(n).with_avatar(format!("https://cdn/a{}.png", avatar % 4));
                CoordinatorEvent::SessionChanged(Session::valid_dev(identity))
            },
            FuzzEvent::SessionExpired { user: n } => {
                CoordinatorEvent::SessionChanged(Session::Expired { identity: user(n) })
            },
            FuzzEvent::SignOut => CoordinatorEvent::SessionChanged(Session::Absent),
            FuzzEvent::Refresh => CoordinatorEvent::Refresh,
            FuzzEvent::Complete { ok } => {
                let Some(op) = pending.pop_front() else { continue };
                retired.push((op.token, op.kind));
                match op.kind {
                    OpKind::Connect => {
                        let result = result_of(ok);
                        if result.is_ok() {
                            assert!(live.is_none(), "model backend double-connected");
                            live = op.identity;
                        }
                        CoordinatorEvent::ConnectCompleted { token: op.token, result }
                    },
                    OpKind::Disconnect => {
                        live = None;
                        CoordinatorEvent::DisconnectCompleted {
                            token: op.token,
                            result: result_of(ok),
                        }
                    },
                }
            },
            FuzzEvent::ReplayRetired { index, ok } => {
                // A duplicate completion must be discarded without action or
                // state change, no matter what kind it was or how the
                // coordinator has moved on since.
                if retired.is_empty() {
                    continue;
                }
                let (token, kind) = retired[(index as usize) % retired.len()];
                let before = coordinator.state().clone();
                let replay = match kind {
                    OpKind::Connect => {
                        CoordinatorEvent::ConnectCompleted { token, result: result_of(ok) }
                    },
                    OpKind::Disconnect => {
                        CoordinatorEvent::DisconnectCompleted { token, result: result_of(ok) }
                    },
                };
                let actions = coordinator.handle(replay);
                assert!(actions.is_empty(), "retired token produced actions: {actions:?}");
                assert_eq!(coordinator.state(), &before, "retired token changed state");
                continue;
            },
        };

        let actions = coordinator.handle(coordinator_event);
        for action in actions {
            match action {
                CoordinatorAction::Connect { token, identity, .. } => {
                    assert!(live.is_none(), "connect issued over a live link");
                    assert!(pending.is_empty(), "two operations in flight");
                    pending.push_back(PendingOp {
                        token,
                        kind: OpKind::Connect,
                        identity: Some(identity),
                    });
                },
                CoordinatorAction::Disconnect { token } => {
                    assert!(pending.is_empty(), "two operations in flight");
                    assert!(directory.is_none(), "disconnect with the directory still open");
                    pending.push_back(PendingOp {
                        token,
                        kind: OpKind::Disconnect,
                        identity: None,
                    });
                },
                CoordinatorAction::OpenDirectory { identity } => {
                    assert!(directory.is_none(), "directory opened twice");
                    assert_eq!(live.as_ref(), Some(&identity), "directory without a link");
                    directory = Some(identity);
                },
                CoordinatorAction::CloseDirectory => directory = None,
                CoordinatorAction::NotifyConnectFailed { .. } => {},
            }
        }

        assert!(pending.len() <= 1, "more than one operation in flight");
        let transitional = matches!(
            coordinator.state(),
            ConnectionState::Connecting(_) | ConnectionState::Disconnecting(_)
        );
        assert_eq!(coordinator.has_in_flight(), transitional);
        if let ConnectionState::Connected(identity) = coordinator.state() {
            assert_eq!(live.as_ref(), Some(identity), "connected without a backend link");
        }
    }
});
