use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use mockall::Sequence;
use parking_lot::Mutex;
use tracing_test::traced_test;

use super::*;
use crate::test_utils::connected_machine;
use crate::test_utils::test_connection_config;
use crate::metrics::BACKGROUND_EXCEPTIONS;
use crate::metrics::CONNECTIONS_TIMED_OUT;
use crate::metrics::SESSION_EXPIRED;
use crate::test_utils::MockEnsemble;
use crate::ConnectionConfig;
use crate::Error;
use crate::EventHandler;
use crate::EventType;
use crate::KeeperState;
use crate::MockConnector;
use crate::MockSession;
use crate::Session;
use crate::TransportError;
use crate::TransportEvent;

/// Connector mock that hands out `MockSession`s and records every handler
fn recording_connector(
    handlers: Arc<Mutex<Vec<EventHandler>>>,
    results: Vec<std::result::Result<(), TransportError>>,
) -> MockConnector {
    let mut connector = MockConnector::new();
    let mut seq = Sequence::new();
    for result in results {
        let handlers = Arc::clone(&handlers);
        connector
            .expect_connect()
            .times(1)
            .in_sequence(&mut seq)
            .returning(move |_, _, handler| {
                handlers.lock().push(handler);
                result.clone().map(|_| {
                    let mut session = MockSession::new();
                    session.expect_close().returning(|| Ok(()));
                    Arc::new(session) as Arc<dyn Session>
                })
            });
    }
    connector
}

#[tokio::test]
async fn test_acquire_handle_before_start() {
    let ensemble = MockEnsemble::new();
    let machine = ConnectionStateMachine::new(ensemble.connector(), test_connection_config());

    assert!(matches!(machine.acquire_handle(), Err(Error::NotStarted)));
}

#[tokio::test]
async fn test_start_then_connected() {
    let ensemble = MockEnsemble::new();
    let machine = ConnectionStateMachine::new(ensemble.connector(), test_connection_config());
    machine.start().expect("start");

    assert_eq!(machine.state(), ConnectionState::Latent);
    assert!(!machine.is_connected());
    // Still connecting: the handle is handed out anyway
    assert!(machine.acquire_handle().is_ok());

    ensemble.session_event(KeeperState::SyncConnected);
    assert!(machine.is_connected());
    assert!(machine.acquire_handle().is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_acquire_handle_times_out_when_never_connected() {
    let ensemble = MockEnsemble::new();
    let machine = ConnectionStateMachine::new(ensemble.connector(), test_connection_config());
    machine.start().expect("start");

    tokio::time::advance(Duration::from_millis(499)).await;
    assert!(machine.acquire_handle().is_ok());

    tokio::time::advance(Duration::from_millis(1)).await;
    match machine.acquire_handle() {
        Err(Error::ConnectionTimeout { elapsed }) => assert!(elapsed >= Duration::from_millis(500)),
        other => panic!("expected timeout, got {:?}", other.map(|_| ())),
    }
}

#[tokio::test(start_paused = true)]
async fn test_timeout_is_measured_from_disconnect() {
    let ensemble = MockEnsemble::new();
    let machine = connected_machine(&ensemble);

    // Connected for a long time: no timeout
    tokio::time::advance(Duration::from_secs(10)).await;
    assert!(machine.acquire_handle().is_ok());

    ensemble.session_event(KeeperState::Disconnected);
    tokio::time::advance(Duration::from_millis(300)).await;
    assert!(machine.acquire_handle().is_ok());

    tokio::time::advance(Duration::from_millis(300)).await;
    assert!(matches!(
        machine.acquire_handle(),
        Err(Error::ConnectionTimeout { .. })
    ));

    // Reconnecting clears the timeout
    ensemble.session_event(KeeperState::SyncConnected);
    assert!(machine.acquire_handle().is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_expiration_resets_session_transparently() {
    let ensemble = MockEnsemble::new();
    let machine = connected_machine(&ensemble);
    let connected_since = machine.status().since;

    tokio::time::advance(Duration::from_millis(50)).await;
    ensemble.expire_sessions();

    assert!(!machine.is_connected());
    assert_eq!(machine.state(), ConnectionState::Latent);
    assert_eq!(ensemble.session_count(), 1);
    assert_eq!(machine.pending_failures(), 0);

    tokio::time::advance(Duration::from_millis(50)).await;
    ensemble.session_event(KeeperState::SyncConnected);
    assert!(machine.is_connected());
    assert!(machine.status().since > connected_since);
    assert!(machine.acquire_handle().is_ok());
}

#[tokio::test]
#[traced_test]
async fn test_failed_reset_surfaces_on_next_acquire() {
    let ensemble = MockEnsemble::new();
    let machine = connected_machine(&ensemble);

    ensemble.refuse_connections(true);
    ensemble.expire_sessions();
    assert_eq!(machine.pending_failures(), 1);
    assert!(logs_contain("Session reset failed"));

    match machine.acquire_handle() {
        Err(Error::SessionExpired { source }) => {
            assert!(matches!(*source, Error::Transport(TransportError::ConnectionLoss)));
        }
        other => panic!("expected SessionExpired, got {:?}", other.map(|_| ())),
    }
    // Queue drained; lazy reopen still refused
    assert!(matches!(
        machine.acquire_handle(),
        Err(Error::Transport(TransportError::ConnectionLoss))
    ));

    ensemble.refuse_connections(false);
    assert!(machine.acquire_handle().is_ok());
    assert_eq!(ensemble.session_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_background_failure_reported_before_timeout() {
    let handlers = Arc::new(Mutex::new(Vec::new()));
    let connector = recording_connector(
        Arc::clone(&handlers),
        vec![Ok(()), Err(TransportError::Other("malformed".into()))],
    );
    let machine = ConnectionStateMachine::new(Arc::new(connector), test_connection_config());
    machine.start().expect("start");

    let first = handlers.lock()[0].clone();
    first(&TransportEvent::session(KeeperState::SyncConnected));
    first(&TransportEvent::session(KeeperState::Expired));

    tokio::time::advance(Duration::from_secs(5)).await;
    match machine.acquire_handle() {
        Err(Error::SessionExpired { source }) => {
            assert!(matches!(*source, Error::Transport(TransportError::Other(_))));
        }
        other => panic!("expected SessionExpired, got {:?}", other.map(|_| ())),
    }
    assert!(matches!(machine.acquire_handle(), Err(Error::ConnectionTimeout { .. })));
}

#[tokio::test]
async fn test_repeated_reset_failures_keep_one_entry_each() {
    let handlers = Arc::new(Mutex::new(Vec::new()));
    let mut results = vec![Ok(())];
    results.extend((0..12).map(|i| Err(TransportError::Other(format!("refused-{i}")))));
    let connector = recording_connector(Arc::clone(&handlers), results);
    let machine = ConnectionStateMachine::new(Arc::new(connector), test_connection_config());
    machine.start().expect("start");

    // Every failed connect still hands out a handler of the current generation
    for i in 0..12 {
        let handler = handlers.lock()[i].clone();
        handler(&TransportEvent::session(KeeperState::Expired));
    }

    assert_eq!(machine.pending_failures(), 10);
    for i in 2..12 {
        match machine.poll_next_failure() {
            Some(Error::SessionExpired { source }) => {
                assert_eq!(source.to_string(), format!("refused-{i}"));
            }
            other => panic!("expected SessionExpired, got {:?}", other.map(|_| ())),
        }
    }
    assert!(machine.poll_next_failure().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_health_counters() {
    let connect_string = "health-counters:2181";
    let config = ConnectionConfig {
        connect_string: connect_string.to_string(),
        ..test_connection_config()
    };
    let labels = [connect_string];
    let expired = SESSION_EXPIRED.with_label_values(&labels).get();
    let surfaced = BACKGROUND_EXCEPTIONS.with_label_values(&labels).get();
    let timed_out = CONNECTIONS_TIMED_OUT.with_label_values(&labels).get();

    let ensemble = MockEnsemble::new();
    let machine = ConnectionStateMachine::new(ensemble.connector(), config);
    machine.start().expect("start");
    ensemble.session_event(KeeperState::SyncConnected);

    ensemble.refuse_connections(true);
    ensemble.expire_sessions();
    assert_eq!(SESSION_EXPIRED.with_label_values(&labels).get(), expired + 1);

    assert!(matches!(machine.acquire_handle(), Err(Error::SessionExpired { .. })));
    assert_eq!(BACKGROUND_EXCEPTIONS.with_label_values(&labels).get(), surfaced + 1);

    tokio::time::advance(Duration::from_secs(1)).await;
    assert!(matches!(machine.acquire_handle(), Err(Error::ConnectionTimeout { .. })));
    assert_eq!(CONNECTIONS_TIMED_OUT.with_label_values(&labels).get(), timed_out + 1);
}

#[tokio::test]
async fn test_events_from_discarded_session_are_dropped() {
    let handlers = Arc::new(Mutex::new(Vec::new()));
    let connector = recording_connector(Arc::clone(&handlers), vec![Ok(()), Ok(())]);
    let machine = ConnectionStateMachine::new(Arc::new(connector), test_connection_config());
    machine.start().expect("start");

    let first = handlers.lock()[0].clone();
    first(&TransportEvent::session(KeeperState::SyncConnected));
    first(&TransportEvent::session(KeeperState::Expired));
    assert_eq!(handlers.lock().len(), 2);
    assert_eq!(machine.state(), ConnectionState::Latent);

    // Late delivery on the old session
    first(&TransportEvent::session(KeeperState::SyncConnected));
    assert_eq!(machine.state(), ConnectionState::Latent);

    let second = handlers.lock()[1].clone();
    second(&TransportEvent::session(KeeperState::SyncConnected));
    assert!(machine.is_connected());
}

#[tokio::test]
async fn test_substitute_observer_returns_previous() {
    let ensemble = MockEnsemble::new();
    let machine = connected_machine(&ensemble);

    let first_hits = Arc::new(AtomicUsize::new(0));
    let second_hits = Arc::new(AtomicUsize::new(0));

    let hits = Arc::clone(&first_hits);
    let first: EventHandler = Arc::new(move |_: &TransportEvent| {
        hits.fetch_add(1, Ordering::SeqCst);
    });
    let hits = Arc::clone(&second_hits);
    let second: EventHandler = Arc::new(move |_: &TransportEvent| {
        hits.fetch_add(1, Ordering::SeqCst);
    });

    assert!(machine.substitute_observer(Some(Arc::clone(&first))).is_none());
    ensemble.session_event(KeeperState::SyncConnected);
    assert_eq!(first_hits.load(Ordering::SeqCst), 1);

    let previous = machine
        .substitute_observer(Some(second))
        .expect("previous observer");
    assert!(Arc::ptr_eq(&previous, &first));

    ensemble.session_event(KeeperState::SyncConnected);
    assert_eq!(first_hits.load(Ordering::SeqCst), 1);
    assert_eq!(second_hits.load(Ordering::SeqCst), 1);

    assert!(machine.substitute_observer(None).is_some());
    ensemble.session_event(KeeperState::SyncConnected);
    assert_eq!(second_hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
#[traced_test]
async fn test_listeners_survive_observer_swap_and_panics() {
    let ensemble = MockEnsemble::new();
    let machine = connected_machine(&ensemble);

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    machine.listenable().add(Arc::new(move |event: &TransportEvent| {
        sink.lock().push(event.event_type);
    }));
    machine.substitute_observer(Some(Arc::new(|_: &TransportEvent| panic!("observer failure"))));

    ensemble.session_event(KeeperState::SyncConnected);
    machine.substitute_observer(None);
    ensemble.session_event(KeeperState::Disconnected);

    assert_eq!(*seen.lock(), vec![EventType::None, EventType::None]);
    assert!(logs_contain("Connection observer panicked"));
    assert!(!machine.is_connected());
}

#[tokio::test]
async fn test_close_is_idempotent_and_terminal() {
    let ensemble = MockEnsemble::new();
    let machine = connected_machine(&ensemble);
    machine.listenable().add(Arc::new(|_: &TransportEvent| {}));

    machine.close().expect("close");
    assert_eq!(machine.state(), ConnectionState::Closed);
    assert_eq!(ensemble.session_count(), 0);
    assert!(machine.listenable().is_empty());

    machine.close().expect("second close is a no-op");
    assert!(matches!(machine.acquire_handle(), Err(Error::Closed)));
    assert!(matches!(machine.start(), Err(Error::Closed)));
}
