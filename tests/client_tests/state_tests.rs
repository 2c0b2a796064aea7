//! State Machine Tests
//!
//! Lifecycle transitions driven without a network.

use std::sync::Arc;
use std::time::Duration;

use atlasdir::client::{Action, ConnectionState, Event, Notification, StateMachine};
use atlasdir::{AtlasError, ReconnectPolicy, SetupFailurePolicy};

fn backoff(fail_after: Option<u32>) -> ReconnectPolicy {
    ReconnectPolicy::Backoff {
        initial_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(80),
        fail_after,
    }
}

fn refused() -> Event {
    Event::ConnectFailed(Arc::new(AtlasError::Transport("connection refused".into())))
}

fn notifications(actions: &[Action]) -> Vec<&Notification> {
    actions
        .iter()
        .filter_map(|action| match action {
            Action::Notify(notification) => Some(notification),
            _ => None,
        })
        .collect()
}

fn retry_delay(actions: &[Action]) -> Option<Duration> {
    actions.iter().find_map(|action| match action {
        Action::ScheduleRetry(delay) => Some(*delay),
        _ => None,
    })
}

fn has(actions: &[Action], wanted: fn(&Action) -> bool) -> bool {
    actions.iter().any(wanted)
}

fn connected(reconnect: ReconnectPolicy) -> StateMachine {
    let mut machine = StateMachine::new(reconnect, SetupFailurePolicy::Fatal, false);
    machine.handle(Event::Open);
    machine.handle(Event::ConnectSucceeded);
    assert_eq!(machine.state(), ConnectionState::Connected);
    machine
}

// =============================================================================
// Connect Tests
// =============================================================================

#[test]
fn test_setup_runs_before_ready() {
    let mut machine = StateMachine::new(ReconnectPolicy::Disabled, SetupFailurePolicy::Fatal, true);
    machine.handle(Event::Open);

    let actions = machine.handle(Event::ConnectSucceeded);
    assert_eq!(machine.state(), ConnectionState::Binding);
    assert!(matches!(actions[0], Action::Notify(Notification::Setup)));
    assert!(matches!(actions[1], Action::RunSetup));
    assert!(!has(&actions, |a| matches!(a, Action::Ready)));

    let actions = machine.handle(Event::SetupSucceeded);
    assert_eq!(machine.state(), ConnectionState::Connected);
    assert!(matches!(actions[0], Action::Ready));
    assert!(matches!(actions[1], Action::Notify(Notification::Connect)));
}

#[test]
fn test_connect_failure_without_reconnect_is_fatal() {
    let mut machine = StateMachine::new(ReconnectPolicy::Disabled, SetupFailurePolicy::Fatal, false);
    machine.handle(Event::Open);

    let actions = machine.handle(refused());
    assert!(machine.is_terminal());
    assert_eq!(machine.state(), ConnectionState::Closed);
    assert!(has(&actions, |a| matches!(a, Action::FailQueued)));

    let notes = notifications(&actions);
    assert!(matches!(notes[0], Notification::ConnectError(_)));
    match notes[1] {
        Notification::Error { error, fatal: true } => {
            assert!(matches!(**error, AtlasError::Transport(_)))
        }
        other => panic!("Expected fatal error, got {:?}", other),
    }
}

#[test]
fn test_backoff_delays_double_and_cap() {
    let mut machine = StateMachine::new(backoff(None), SetupFailurePolicy::Fatal, false);
    machine.handle(Event::Open);

    let mut delays = Vec::new();
    for _ in 0..6 {
        let actions = machine.handle(refused());
        delays.push(retry_delay(&actions).unwrap());
        assert!(matches!(machine.handle(Event::RetryElapsed)[0], Action::Connect));
    }

    let millis: Vec<u128> = delays.iter().map(Duration::as_millis).collect();
    assert_eq!(millis, vec![10, 20, 40, 80, 80, 80]);
    assert_eq!(machine.attempts(), 6);
    assert!(!machine.is_terminal());
}

#[test]
fn test_fail_after_five_attempts() {
    let mut machine = StateMachine::new(backoff(Some(5)), SetupFailurePolicy::Fatal, false);
    machine.handle(Event::Open);

    let mut connect_errors = 0;
    let mut fatal_errors = Vec::new();
    for _ in 0..5 {
        let actions = machine.handle(refused());
        for note in notifications(&actions) {
            match note {
                Notification::ConnectError(_) => connect_errors += 1,
                Notification::Error { error, fatal: true } => fatal_errors.push(error.clone()),
                _ => {}
            }
        }
        machine.handle(Event::RetryElapsed);
    }

    assert_eq!(connect_errors, 5);
    assert_eq!(fatal_errors.len(), 1);
    assert!(matches!(
        *fatal_errors[0],
        AtlasError::ReconnectExhausted { attempts: 5 }
    ));
    assert!(machine.is_terminal());
}

#[test]
fn test_successful_connect_resets_attempts() {
    let mut machine = StateMachine::new(backoff(Some(3)), SetupFailurePolicy::Fatal, false);
    machine.handle(Event::Open);
    machine.handle(refused());
    machine.handle(Event::RetryElapsed);
    machine.handle(refused());
    assert_eq!(machine.attempts(), 2);

    machine.handle(Event::RetryElapsed);
    machine.handle(Event::ConnectSucceeded);
    assert_eq!(machine.attempts(), 0);
}

// =============================================================================
// Close Tests
// =============================================================================

#[test]
fn test_close_requested_never_reconnects() {
    let mut machine = connected(backoff(None));

    let actions = machine.handle(Event::CloseRequested);
    assert_eq!(machine.state(), ConnectionState::Closing);
    assert!(matches!(actions[..], [Action::Teardown]));

    let actions = machine.handle(Event::TornDown);
    assert_eq!(machine.state(), ConnectionState::Closed);
    assert!(retry_delay(&actions).is_none());
    assert!(matches!(
        notifications(&actions)[..],
        [Notification::Close { had_error: false }]
    ));
    // Still reopenable on demand
    assert!(!machine.is_terminal());
    assert!(matches!(machine.handle(Event::Open)[0], Action::Connect));
}

#[test]
fn test_close_without_reconnect_is_terminal() {
    let mut machine = connected(ReconnectPolicy::Disabled);
    machine.handle(Event::CloseRequested);

    let actions = machine.handle(Event::TornDown);
    assert!(machine.is_terminal());
    assert!(has(&actions, |a| matches!(a, Action::FailQueued)));
    assert!(machine.handle(Event::Open).is_empty());
}

#[test]
fn test_lost_connection_reconnects() {
    let mut machine = connected(backoff(None));
    let error = Arc::new(AtlasError::Transport("reset by peer".into()));

    let actions = machine.handle(Event::ConnectionLost(Some(error)));
    assert!(matches!(
        notifications(&actions)[..],
        [Notification::Error { fatal: false, .. }]
    ));
    assert!(matches!(actions.last(), Some(Action::Teardown)));

    let actions = machine.handle(Event::TornDown);
    assert!(matches!(
        notifications(&actions)[..],
        [Notification::Close { had_error: true }]
    ));
    assert_eq!(retry_delay(&actions), Some(Duration::from_millis(10)));
    assert_eq!(machine.state(), ConnectionState::Connecting);

    assert!(matches!(machine.handle(Event::RetryElapsed)[..], [Action::Connect]));
}

#[test]
fn test_peer_close_without_reconnect_is_fatal() {
    let mut machine = connected(ReconnectPolicy::Disabled);
    machine.handle(Event::ConnectionLost(None));

    let actions = machine.handle(Event::TornDown);
    assert!(machine.is_terminal());
    let notes = notifications(&actions);
    assert!(matches!(notes[0], Notification::Close { had_error: false }));
    match notes[1] {
        Notification::Error { error, fatal: true } => {
            assert!(matches!(**error, AtlasError::ConnectionClosed))
        }
        other => panic!("Expected fatal error, got {:?}", other),
    }
}

#[test]
fn test_close_while_connecting_cancels_retry() {
    let mut machine = StateMachine::new(backoff(None), SetupFailurePolicy::Fatal, false);
    machine.handle(Event::Open);
    machine.handle(refused());

    let actions = machine.handle(Event::CloseRequested);
    assert!(matches!(actions[0], Action::CancelRetry));
    assert_eq!(machine.state(), ConnectionState::Closed);
    // The retry timer may still fire once; it must not reconnect
    assert!(machine.handle(Event::RetryElapsed).is_empty());
}

// =============================================================================
// Setup Failure Tests
// =============================================================================

#[test]
fn test_setup_failure_fatal_by_default() {
    let mut machine = StateMachine::new(backoff(None), SetupFailurePolicy::Fatal, true);
    machine.handle(Event::Open);
    machine.handle(Event::ConnectSucceeded);

    let error = Arc::new(AtlasError::operation(
        atlasdir::protocol::ResultCode::InvalidCredentials,
        "bad password",
    ));
    let actions = machine.handle(Event::SetupFailed(error));
    assert!(matches!(
        notifications(&actions)[..],
        [Notification::SetupError(_)]
    ));
    assert!(matches!(actions.last(), Some(Action::Teardown)));

    let actions = machine.handle(Event::TornDown);
    assert!(machine.is_terminal());
    assert!(retry_delay(&actions).is_none());
    assert!(notifications(&actions)
        .iter()
        .any(|note| note.is_fatal()));
}

#[test]
fn test_setup_failure_retry_counts_attempts() {
    let policy = SetupFailurePolicy::Retry {
        counts_toward_budget: true,
    };
    let mut machine = StateMachine::new(backoff(Some(2)), policy, true);
    machine.handle(Event::Open);

    let failure = || Event::SetupFailed(Arc::new(AtlasError::Transport("setup".into())));

    machine.handle(Event::ConnectSucceeded);
    machine.handle(failure());
    let actions = machine.handle(Event::TornDown);
    assert!(retry_delay(&actions).is_some());

    machine.handle(Event::RetryElapsed);
    machine.handle(Event::ConnectSucceeded);
    machine.handle(failure());
    let actions = machine.handle(Event::TornDown);
    assert!(machine.is_terminal());
    assert!(notifications(&actions).iter().any(|note| matches!(
        note,
        Notification::Error { error, fatal: true }
            if matches!(**error, AtlasError::ReconnectExhausted { attempts: 2 })
    )));
}

// =============================================================================
// Destroy Tests
// =============================================================================

#[test]
fn test_destroy_while_connected() {
    let mut machine = connected(backoff(None));

    let actions = machine.handle(Event::Destroy);
    assert!(machine.is_terminal());
    assert!(has(&actions, |a| matches!(a, Action::Teardown)));
    assert!(has(&actions, |a| matches!(a, Action::FailQueued)));
    assert!(matches!(actions.last(), Some(Action::Stop)));
    assert!(notifications(&actions)
        .iter()
        .any(|note| matches!(note, Notification::Destroy)));
}

#[test]
fn test_destroy_while_idle_skips_teardown() {
    let mut machine = StateMachine::new(backoff(None), SetupFailurePolicy::Fatal, false);

    let actions = machine.handle(Event::Destroy);
    assert!(!has(&actions, |a| matches!(a, Action::Teardown)));
    assert!(matches!(actions.last(), Some(Action::Stop)));
}
