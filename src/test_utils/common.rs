use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;
use tokio::time::Instant;

use super::MockEnsemble;
use crate::ConnectionConfig;
use crate::ConnectionStateMachine;
use crate::KeeperState;

pub(crate) fn test_connection_config() -> ConnectionConfig {
    ConnectionConfig {
        connect_string: "mock:2181".to_string(),
        session_timeout_ms: 1_000,
        connection_timeout_ms: 500,
    }
}

/// Started machine whose session is already confirmed
pub(crate) fn connected_machine(ensemble: &MockEnsemble) -> Arc<ConnectionStateMachine> {
    let machine = ConnectionStateMachine::new(ensemble.connector(), test_connection_config());
    machine.start().expect("start should succeed");
    ensemble.session_event(KeeperState::SyncConnected);
    assert!(machine.is_connected());
    machine
}

/// Polls `condition` until it holds or `timeout` elapses
pub(crate) async fn wait_until<F>(
    timeout: Duration,
    condition: F,
) -> bool
where
    F: Fn() -> bool,
{
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        sleep(Duration::from_millis(5)).await;
    }
}
