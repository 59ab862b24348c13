use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

use crate::Error;
use crate::Result;

/// Session and connection timing for [`ConnectionStateMachine`](crate::ConnectionStateMachine)
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ConnectionConfig {
    /// Comma separated `host:port` list handed to the transport
    #[serde(default = "default_connect_string")]
    pub connect_string: String,

    /// Session timeout requested from the service (milliseconds)
    #[serde(default = "default_session_timeout_ms")]
    pub session_timeout_ms: u64,

    /// How long `acquire_handle` tolerates a disconnected session before
    /// failing with `ConnectionTimeout` (milliseconds)
    #[serde(default = "default_connection_timeout_ms")]
    pub connection_timeout_ms: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_string: default_connect_string(),
            session_timeout_ms: default_session_timeout_ms(),
            connection_timeout_ms: default_connection_timeout_ms(),
        }
    }
}

impl ConnectionConfig {
    pub fn session_timeout(&self) -> Duration {
        Duration::from_millis(self.session_timeout_ms)
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.connect_string.trim().is_empty() {
            return Err(Error::Configuration("connect_string cannot be empty".into()));
        }

        if self.session_timeout_ms == 0 {
            return Err(Error::Configuration("session_timeout_ms must be greater than 0".into()));
        }

        if self.connection_timeout_ms == 0 {
            return Err(Error::Configuration(
                "connection_timeout_ms must be greater than 0".into(),
            ));
        }

        Ok(())
    }
}

fn default_connect_string() -> String {
    "127.0.0.1:2181".to_string()
}
fn default_session_timeout_ms() -> u64 {
    60_000
}
fn default_connection_timeout_ms() -> u64 {
    15_000
}
