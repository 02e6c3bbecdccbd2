//! The client socket surface.
//!
//! A `ClientSocket` emulates a full-duplex connection over plain HTTP. It
//! opens a session with a `HEAD` handshake, then keeps up to
//! `min(server_max_pool, max_pool_size)` `PATCH` requests in flight; the
//! server answers one whenever it has messages, and queued outbound
//! messages ride in the next request body. The application watches the
//! returned [`EventStream`] for `Open`, `Message`, and `Close`.

use crate::config::ClientConfig;
use crate::driver;
use htsock_core::event::{event_channel, EventSender, EventStream};
use htsock_core::{SockError, SockResult};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::warn;

/// Lifecycle of a client socket. Transitions are one-way:
/// `Connecting` -> `Open` -> `Closing` -> `Closed` (failed handshakes skip
/// straight to `Closed`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// The handshake has not completed yet.
    Connecting,
    /// Polls are in flight; sends are accepted.
    Open,
    /// The close handshake is in progress.
    Closing,
    /// Terminal.
    Closed,
}

pub(crate) struct ClientInner {
    pub(crate) state: ClientState,
    pub(crate) session_id: Option<String>,
    pub(crate) server_max_pool: usize,
    /// Number of polls currently in flight.
    pub(crate) pool_size: usize,
    /// Messages waiting for the next poll, oldest first.
    pub(crate) outbound: Vec<Value>,
    /// Observable count of buffered messages.
    pub(crate) buffered_amount: usize,
    /// At most one pending deferred flush.
    pub(crate) flush_scheduled: bool,
    pub(crate) shutdown_hook: Option<JoinHandle<()>>,
}

pub(crate) struct ClientShared {
    pub(crate) url: String,
    pub(crate) config: ClientConfig,
    pub(crate) headers: HeaderMap,
    pub(crate) http: reqwest::Client,
    pub(crate) events: EventSender,
    pub(crate) inner: Mutex<ClientInner>,
}

/// Client peer of the transport. Cheap to clone; all clones share the same
/// underlying connection.
#[derive(Clone)]
pub struct ClientSocket {
    shared: Arc<ClientShared>,
}

impl ClientSocket {
    /// Start connecting to a server at `url` (scheme, host, and the
    /// server's configured path, e.g. `http://127.0.0.1:8080/sock`).
    ///
    /// Returns immediately with the socket in [`ClientState::Connecting`]
    /// and the handshake running in the background; must be called from
    /// within a tokio runtime. The stream delivers `Open` on success or a
    /// terminal `Close` with code 1002 when the handshake fails.
    pub fn connect(url: impl Into<String>, config: ClientConfig) -> (Self, EventStream) {
        let headers = build_headers(&config.request_headers);
        let (events, stream) = event_channel();
        let shared = Arc::new(ClientShared {
            url: url.into(),
            config,
            headers,
            http: reqwest::Client::builder().build().unwrap_or_default(),
            events,
            inner: Mutex::new(ClientInner {
                state: ClientState::Connecting,
                session_id: None,
                server_max_pool: 1,
                pool_size: 0,
                outbound: Vec::new(),
                buffered_amount: 0,
                flush_scheduled: false,
                shutdown_hook: None,
            }),
        });
        tokio::spawn(driver::connect(Arc::clone(&shared)));
        (Self { shared }, stream)
    }

    pub async fn state(&self) -> ClientState {
        self.shared.inner.lock().await.state
    }

    /// Session id assigned by the server (available once open).
    pub async fn session_id(&self) -> Option<String> {
        self.shared.inner.lock().await.session_id.clone()
    }

    /// Number of messages queued for the next poll.
    pub async fn buffered_amount(&self) -> usize {
        self.shared.inner.lock().await.buffered_amount
    }

    /// Number of polls currently in flight.
    pub async fn pool_size(&self) -> usize {
        self.shared.inner.lock().await.pool_size
    }

    /// Queue one message for the server.
    ///
    /// Sending before the handshake completed is a usage error; sending on
    /// a closing or closed socket silently drops the message. The first
    /// queued message schedules a deferred poll after the coalescing
    /// window; messages sent within the window share that poll.
    pub async fn send(&self, message: Value) -> SockResult<()> {
        let mut inner = self.shared.inner.lock().await;
        match inner.state {
            ClientState::Connecting => Err(SockError::Usage(
                "cannot send before the socket is open".into(),
            )),
            ClientState::Closing | ClientState::Closed => Ok(()),
            ClientState::Open => {
                inner.outbound.push(message);
                inner.buffered_amount = inner.outbound.len();
                if !inner.flush_scheduled {
                    inner.flush_scheduled = true;
                    let shared = Arc::clone(&self.shared);
                    tokio::spawn(async move {
                        tokio::time::sleep(shared.config.buffer_time).await;
                        let proceed = {
                            let mut inner = shared.inner.lock().await;
                            inner.flush_scheduled = false;
                            if inner.state == ClientState::Open {
                                inner.pool_size += 1;
                                true
                            } else {
                                false
                            }
                        };
                        // One extra poll carries the batch out; the pool
                        // settles back to its cap as polls complete.
                        if proceed {
                            driver::pool_slot(shared).await;
                        }
                    });
                }
                Ok(())
            }
        }
    }

    /// Close the socket.
    ///
    /// Emits the close event, then notifies the server with a `DELETE`
    /// (retried a few times on network failure). No-op if the socket is
    /// already closing or closed.
    pub async fn close(&self, code: u16, reason: &str) {
        driver::close(&self.shared, code, reason).await;
    }
}

/// Convert configured header pairs into a `HeaderMap`, skipping pairs that
/// are not valid HTTP headers.
fn build_headers(pairs: &std::collections::HashMap<String, String>) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in pairs {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                headers.insert(name, value);
            }
            _ => warn!(header = %name, "skipping invalid request header"),
        }
    }
    headers
}
