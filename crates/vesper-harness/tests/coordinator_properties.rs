//! Property tests for the connection coordinator.
//!
//! Runs random scripts of session changes, refreshes, and backend
//! completions against a model backend, checking the serialization
//! invariants on every step: at most one operation in flight, never a
//! connect while a link is live, directory closed before every disconnect,
//! and eventual settlement on the last desired identity.

use std::collections::VecDeque;

use proptest::prelude::*;
use vesper_client::{
    BackendError, ConnectionCoordinator, ConnectionState, CoordinatorAction, CoordinatorEvent,
    OpToken,
};
use vesper_core::{Identity, Session};

#[derive(Debug, Clone)]
enum ScriptOp {
    /// Sign in as one of a small pool of users.
    SignIn(u8),
    SignOut,
    Refresh,
    /// Complete the oldest pending backend operation.
    Complete { ok: bool },
}

fn script_op() -> impl Strategy<Value = ScriptOp> {
    prop_oneof![
        (0u8..3).prop_map(ScriptOp::SignIn),
        Just(ScriptOp::SignOut),
        Just(ScriptOp::Refresh),
        any::<bool>().prop_map(|ok| ScriptOp::Complete { ok }),
    ]
}

fn user(n: u8) -> Identity {
    Identity::from(format!("user-{n}").as_str())
}

#[derive(Debug)]
enum Pending {
    Connect { token: OpToken, identity: Identity },
    Disconnect { token: OpToken },
}

/// Model backend plus observed client-side resources.
#[derive(Debug, Default)]
struct World {
    live: Option<Identity>,
    pending: VecDeque<Pending>,
    directory: Option<Identity>,
}

impl World {
    /// Execute one batch of coordinator actions, checking per-action
    /// invariants as they land.
    fn execute(&mut self, actions: Vec<CoordinatorAction>) -> Result<(), TestCaseError> {
        for action in actions {
            match action {
                CoordinatorAction::Connect { token, identity, .. } => {
                    prop_assert!(self.live.is_none(), "connect issued over a live link");
                    prop_assert!(self.pending.is_empty(), "second operation issued in flight");
                    self.pending.push_back(Pending::Connect { token, identity });
                },
                CoordinatorAction::Disconnect { token } => {
                    prop_assert!(self.pending.is_empty(), "second operation issued in flight");
                    prop_assert!(
                        self.directory.is_none(),
                        "disconnect issued before the directory closed"
                    );
                    self.pending.push_back(Pending::Disconnect { token });
                },
                CoordinatorAction::OpenDirectory { identity } => {
                    prop_assert!(self.directory.is_none(), "directory opened twice");
                    prop_assert_eq!(
                        self.live.as_ref(),
                        Some(&identity),
                        "directory opened without a live link for its identity"
                    );
                    self.directory = Some(identity);
                },
                CoordinatorAction::CloseDirectory => {
                    self.directory = None;
                },
                CoordinatorAction::NotifyConnectFailed { .. } => {},
            }
        }
        Ok(())
    }

    /// Complete the oldest pending operation and return the event to feed
    /// back. `None` when nothing is pending.
    fn complete(&mut self, ok: bool) -> Option<CoordinatorEvent> {
        match self.pending.pop_front()? {
            Pending::Connect { token, identity } => {
                let result = if ok {
                    assert!(self.live.is_none(), "model backend double-connected");
                    self.live = Some(identity);
                    Ok(())
                } else {
                    Err(BackendError::Transport { reason: "scripted failure".to_string() })
                };
                Some(CoordinatorEvent::ConnectCompleted { token, result })
            },
            Pending::Disconnect { token } => {
                // The link is down even when the backend reports an error.
                self.live = None;
                let result = if ok {
                    Ok(())
                } else {
                    Err(BackendError::Transport { reason: "scripted failure".to_string() })
                };
                Some(CoordinatorEvent::DisconnectCompleted { token, result })
            },
        }
    }
}

fn check_invariants(
    coordinator: &ConnectionCoordinator,
    world: &World,
) -> Result<(), TestCaseError> {
    let transitional = matches!(
        coordinator.state(),
        ConnectionState::Connecting(_) | ConnectionState::Disconnecting(_)
    );
    prop_assert_eq!(coordinator.has_in_flight(), transitional);
    prop_assert_eq!(coordinator.has_in_flight(), !world.pending.is_empty());
    prop_assert!(world.pending.len() <= 1);

    if let ConnectionState::Connected(identity) = coordinator.state() {
        prop_assert_eq!(world.live.as_ref(), Some(identity));
    }
    Ok(())
}

fn step(
    coordinator: &mut ConnectionCoordinator,
    world: &mut World,
    event: CoordinatorEvent,
) -> Result<(), TestCaseError> {
    let actions = coordinator.handle(event);
    world.execute(actions)?;
    check_invariants(coordinator, world)
}

/// Run every pending completion to success, handling the follow-up
/// operations each completion triggers.
fn drain(coordinator: &mut ConnectionCoordinator, world: &mut World) -> Result<(), TestCaseError> {
    // Each completion can issue at most one follow-up operation, and the
    // chain is bounded: drain, reconnect, done.
    for _ in 0..8 {
        let Some(event) = world.complete(true) else {
            return Ok(());
        };
        step(coordinator, world, event)?;
    }
    prop_assert!(world.pending.is_empty(), "operation chain did not terminate");
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(512))]

    #[test]
    fn random_scripts_never_violate_serialization(ops in proptest::collection::vec(script_op(), 1..40)) {
        let mut coordinator = ConnectionCoordinator::new();
        let mut world = World::default();

        for op in ops {
            match op {
                ScriptOp::SignIn(n) => {
                    step(&mut coordinator, &mut world,
                         CoordinatorEvent::SessionChanged(Session::valid_dev(user(n))))?;
                },
                ScriptOp::SignOut => {
                    step(&mut coordinator, &mut world,
                         CoordinatorEvent::SessionChanged(Session::Absent))?;
                },
                ScriptOp::Refresh => {
                    step(&mut coordinator, &mut world, CoordinatorEvent::Refresh)?;
                },
                ScriptOp::Complete { ok } => {
                    if let Some(event) = world.complete(ok) {
                        step(&mut coordinator, &mut world, event)?;
                    }
                },
            }
        }

        // Settlement: once the backend answers everything (successfully) and
        // one refresh clears any failed state, the coordinator must sit
        // exactly where the last session event pointed it.
        drain(&mut coordinator, &mut world)?;
        step(&mut coordinator, &mut world, CoordinatorEvent::Refresh)?;
        drain(&mut coordinator, &mut world)?;

        match coordinator.desired_identity().cloned() {
            Some(identity) => {
                prop_assert_eq!(coordinator.state(), &ConnectionState::Connected(identity.clone()));
                prop_assert_eq!(world.live.as_ref(), Some(&identity));
                prop_assert_eq!(world.directory.as_ref(), Some(&identity));
            },
            None => {
                prop_assert_eq!(coordinator.state(), &ConnectionState::Idle);
                prop_assert!(world.live.is_none());
                prop_assert!(world.directory.is_none());
            },
        }
    }
}
