// -
// Connection

/// Upper bound of failures kept for the next synchronous caller
pub(crate) const MAX_BACKGROUND_FAILURES: usize = 10;

/// Env prefix for settings overrides, e.g. `CURATOR__CONNECTION__SESSION_TIMEOUT_MS`
pub(crate) const CONFIG_ENV_PREFIX: &str = "CURATOR";

/// Env var naming an optional settings file
pub(crate) const CONFIG_PATH_ENV: &str = "CURATOR_CONFIG_PATH";

// -
// Paths

pub(crate) const PATH_SEPARATOR: char = '/';
