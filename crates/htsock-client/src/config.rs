//! Client configuration.

use serde::{Deserialize, Deserializer};
use std::collections::HashMap;
use std::time::Duration;

/// Configuration for a [`ClientSocket`](crate::ClientSocket).
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClientConfig {
    /// Local cap on concurrent polls; the effective pool size is the
    /// smaller of this and what the server advertises.
    #[serde(default = "default_pool_size")]
    pub max_pool_size: usize,
    /// Coalescing window between the first queued message and the poll
    /// that flushes it, in seconds (fractional values allowed).
    #[serde(default, deserialize_with = "duration_secs")]
    pub buffer_time: Duration,
    /// Extra headers applied to every request (auth tokens and the like).
    #[serde(default)]
    pub request_headers: HashMap<String, String>,
    /// Install a ctrl-c hook once the socket opens that closes it with
    /// 1001 before the process exits.
    #[serde(default = "default_true")]
    pub close_on_shutdown: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            max_pool_size: default_pool_size(),
            buffer_time: Duration::ZERO,
            request_headers: HashMap::new(),
            close_on_shutdown: default_true(),
        }
    }
}

fn default_pool_size() -> usize {
    2
}

fn default_true() -> bool {
    true
}

/// Deserialize a duration from (possibly fractional) seconds.
fn duration_secs<'de, D: Deserializer<'de>>(de: D) -> Result<Duration, D::Error> {
    let secs = f64::deserialize(de)?;
    if !secs.is_finite() || secs < 0.0 {
        return Err(serde::de::Error::custom("buffer_time must be a non-negative number"));
    }
    Ok(Duration::from_secs_f64(secs))
}
