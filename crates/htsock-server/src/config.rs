//! Server configuration.

use serde::{Deserialize, Deserializer};
use std::time::Duration;
use tokio::net::TcpListener;

/// Configuration for a [`SocketServer`](crate::SocketServer).
///
/// Exactly one of `port`, `listener`, or `external` must be set:
///
/// - `port` (optionally with `host`): the server binds and owns its own
///   TCP listener.
/// - `listener`: the caller hands over a pre-bound [`TcpListener`] for the
///   server to serve on.
/// - `external`: no listener at all; the host application routes requests
///   into [`SocketServer::dispatch`](crate::SocketServer::dispatch) itself.
///
/// Everything except `listener` can be deserialized from a host
/// application's config file.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// Request path under which the transport is served.
    #[serde(default = "default_path")]
    pub path: String,
    /// Maximum number of poll responses held open per session, advertised
    /// to clients in the handshake.
    #[serde(default = "default_pool_size")]
    pub max_connection_pool_size: usize,
    /// Coalescing window between the first queued message and the flush,
    /// in seconds (fractional values allowed). Zero still defers the flush
    /// to the next scheduling tick.
    #[serde(default, deserialize_with = "duration_secs")]
    pub buffer_time: Duration,
    /// Adopt unknown `socket-id`s on poll requests instead of rejecting
    /// them with 404.
    #[serde(default)]
    pub allow_client_ids: bool,
    /// Whether [`SocketServer::clients`](crate::SocketServer::clients)
    /// reports live sessions.
    #[serde(default = "default_true")]
    pub client_tracking: bool,
    /// Port to bind an owned listener on.
    #[serde(default)]
    pub port: Option<u16>,
    /// Host to bind an owned listener on (only meaningful with `port`).
    #[serde(default)]
    pub host: Option<String>,
    /// Pre-bound listener to serve on.
    #[serde(skip)]
    pub listener: Option<TcpListener>,
    /// Serve no listener; the host dispatches requests itself.
    #[serde(default)]
    pub external: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            path: default_path(),
            max_connection_pool_size: default_pool_size(),
            buffer_time: Duration::ZERO,
            allow_client_ids: false,
            client_tracking: default_true(),
            port: None,
            host: None,
            listener: None,
            external: false,
        }
    }
}

fn default_path() -> String {
    "/".to_string()
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

impl ServerConfig {
    /// Number of binding options that are set. Valid configs have exactly one.
    pub(crate) fn bindings(&self) -> usize {
        usize::from(self.port.is_some())
            + usize::from(self.listener.is_some())
            + usize::from(self.external)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.path, "/");
        assert_eq!(cfg.max_connection_pool_size, 2);
        assert_eq!(cfg.buffer_time, Duration::ZERO);
        assert!(!cfg.allow_client_ids);
        assert!(cfg.client_tracking);
        assert_eq!(cfg.bindings(), 0);
    }

    #[test]
    fn from_toml() {
        let cfg: ServerConfig = toml::from_str(
            r#"
            path = "/sock"
            max_connection_pool_size = 4
            buffer_time = 0.05
            allow_client_ids = true
            port = 8080
            host = "0.0.0.0"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.path, "/sock");
        assert_eq!(cfg.max_connection_pool_size, 4);
        assert_eq!(cfg.buffer_time, Duration::from_millis(50));
        assert!(cfg.allow_client_ids);
        assert_eq!(cfg.port, Some(8080));
        assert_eq!(cfg.host.as_deref(), Some("0.0.0.0"));
        assert_eq!(cfg.bindings(), 1);
    }

    #[test]
    fn negative_buffer_time_rejected() {
        assert!(toml::from_str::<ServerConfig>("buffer_time = -1.0").is_err());
    }
}
