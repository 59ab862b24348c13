//! Connection health counters
//!
//! Counters are labelled by connect string so several machines in one
//! process stay distinguishable. They are not registered anywhere by
//! default; call [`register_custom_metrics`] with the registry the
//! application exports.

use lazy_static::lazy_static;
use prometheus::IntCounterVec;
use prometheus::Opts;
use prometheus::Registry;

lazy_static! {
    /// Queued background failures handed to a synchronous caller
    pub static ref BACKGROUND_EXCEPTIONS: IntCounterVec = IntCounterVec::new(
        Opts::new("background_exceptions", "Background failures surfaced by acquire_handle"),
        &["connect_string"]
    )
    .expect("metric can not be created");

    pub static ref CONNECTIONS_TIMED_OUT: IntCounterVec = IntCounterVec::new(
        Opts::new("connections_timed_out", "acquire_handle calls failed by the connection timeout"),
        &["connect_string"]
    )
    .expect("metric can not be created");

    pub static ref SESSION_EXPIRED: IntCounterVec = IntCounterVec::new(
        Opts::new("session_expired", "Session expirations reported by the service"),
        &["connect_string"]
    )
    .expect("metric can not be created");
}

/// Registers every connection counter with `registry`.
///
/// # Errors
/// Fails if a counter with the same name is already registered.
pub fn register_custom_metrics(registry: &Registry) -> prometheus::Result<()> {
    registry.register(Box::new(BACKGROUND_EXCEPTIONS.clone()))?;
    registry.register(Box::new(CONNECTIONS_TIMED_OUT.clone()))?;
    registry.register(Box::new(SESSION_EXPIRED.clone()))?;
    Ok(())
}
