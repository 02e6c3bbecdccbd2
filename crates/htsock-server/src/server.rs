//! The socket server: accepts transport requests and owns the sessions.
//!
//! Requests on the configured path are dispatched by method: `HEAD` opens a
//! session, `PATCH` polls it, `DELETE` closes it. Anything else is handed
//! back to the host. The server owns the session registry and surfaces new
//! sessions as [`ServerEvent::Connection`]s.

use crate::config::ServerConfig;
use crate::listener;
use crate::registry::SessionRegistry;
use crate::session::{ParkedReply, PollAction, ServerSocket};
use bytes::Bytes;
use htsock_core::event::EventStream;
use htsock_core::proto::{self, CloseInfo};
use htsock_core::{SockError, SockResult};
use http::{HeaderValue, Method, Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::info;

/// Lifecycle of the server itself. One-way: `Running` -> `Closing` -> `Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ServerState {
    Running,
    Closing,
    Closed,
}

/// What the server tells the host application.
pub enum ServerEvent {
    /// A client completed the handshake.
    Connection {
        socket: Arc<ServerSocket>,
        events: EventStream,
        /// Headers of the request that opened the session, for host-side
        /// inspection (auth tokens and the like).
        headers: http::HeaderMap,
    },
    /// The server finished shutting down.
    Closed,
}

/// Outcome of dispatching one HTTP request.
pub enum Dispatch<B> {
    /// A transport response to write.
    Response(Response<Full<Bytes>>),
    /// Not a transport request; the request is handed back untouched.
    Unhandled(Request<B>),
    /// Tear the connection down without writing a response.
    Abort,
}

/// Accepts transport requests, tracks live sessions, and hands new
/// connections to the application.
pub struct SocketServer {
    path: String,
    max_pool: usize,
    buffer_time: Duration,
    allow_client_ids: bool,
    client_tracking: bool,
    registry: SessionRegistry,
    events: mpsc::UnboundedSender<ServerEvent>,
    state: Mutex<ServerState>,
    /// Flips to `true` once shutdown fully completes.
    closed_tx: watch::Sender<bool>,
    /// Tells the accept loop to stop.
    shutdown_tx: watch::Sender<bool>,
    owned_listener: Mutex<Option<TcpListener>>,
    local_addr: Option<SocketAddr>,
}

impl std::fmt::Debug for SocketServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketServer")
            .field("path", &self.path)
            .field("local_addr", &self.local_addr)
            .finish_non_exhaustive()
    }
}

impl SocketServer {
    /// Create a server from `config`.
    ///
    /// Binds the owned listener right away when `port` is configured, so
    /// [`local_addr`](Self::local_addr) is available before
    /// [`run`](Self::run) is called. Fails with a usage error unless exactly
    /// one of `port`, `listener`, `external` is set.
    pub async fn new(
        mut config: ServerConfig,
    ) -> SockResult<(Arc<Self>, mpsc::UnboundedReceiver<ServerEvent>)> {
        if config.bindings() != 1 {
            return Err(SockError::Usage(
                "exactly one of port, listener, or external must be configured".into(),
            ));
        }

        let owned_listener = match (config.port, config.listener.take()) {
            (Some(port), _) => {
                let host = config.host.clone().unwrap_or_else(|| "127.0.0.1".to_string());
                Some(TcpListener::bind((host.as_str(), port)).await?)
            }
            (None, provided) => provided,
        };
        let local_addr = match &owned_listener {
            Some(l) => Some(l.local_addr()?),
            None => None,
        };

        let (events, event_rx) = mpsc::unbounded_channel();
        let server = Arc::new(Self {
            path: config.path,
            max_pool: config.max_connection_pool_size,
            buffer_time: config.buffer_time,
            allow_client_ids: config.allow_client_ids,
            client_tracking: config.client_tracking,
            registry: SessionRegistry::new(),
            events,
            state: Mutex::new(ServerState::Running),
            closed_tx: watch::channel(false).0,
            shutdown_tx: watch::channel(false).0,
            owned_listener: Mutex::new(owned_listener),
            local_addr,
        });
        Ok((server, event_rx))
    }

    /// Address of the owned listener, when there is one.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Live sessions, when client tracking is enabled (empty otherwise).
    pub async fn clients(&self) -> Vec<Arc<ServerSocket>> {
        if !self.client_tracking {
            return Vec::new();
        }
        self.registry.snapshot().await
    }

    /// Number of live sessions.
    pub async fn session_count(&self) -> usize {
        self.registry.len().await
    }

    /// Serve the owned listener until [`close`](Self::close) is called.
    pub async fn run(self: Arc<Self>) -> SockResult<()> {
        let listener = self.owned_listener.lock().await.take().ok_or_else(|| {
            SockError::Usage("server has no owned listener to run".into())
        })?;
        let shutdown = self.shutdown_tx.subscribe();
        info!(
            addr = %listener.local_addr().map(|a| a.to_string()).unwrap_or_default(),
            path = %self.path,
            "socket server listening"
        );
        listener::serve(self, listener, shutdown).await;
        Ok(())
    }

    /// Shut the server down: stop accepting, terminate every live session,
    /// and emit [`ServerEvent::Closed`].
    ///
    /// Calling this after shutdown completed returns
    /// [`SockError::NotRunning`]; calling it while another shutdown is in
    /// flight waits for that shutdown to finish.
    pub async fn close(&self) -> SockResult<()> {
        let initiator = {
            let mut state = self.state.lock().await;
            match *state {
                ServerState::Closed => return Err(SockError::NotRunning),
                ServerState::Closing => false,
                ServerState::Running => {
                    *state = ServerState::Closing;
                    true
                }
            }
        };

        if !initiator {
            let mut closed = self.closed_tx.subscribe();
            while !*closed.borrow_and_update() {
                if closed.changed().await.is_err() {
                    break;
                }
            }
            return Ok(());
        }

        let _ = self.shutdown_tx.send(true);
        let sessions = self.registry.drain().await;
        info!(sessions = sessions.len(), "socket server closing");
        for session in sessions {
            session.terminate().await;
        }
        {
            let mut state = self.state.lock().await;
            *state = ServerState::Closed;
        }
        let _ = self.closed_tx.send(true);
        let _ = self.events.send(ServerEvent::Closed);
        info!("socket server closed");
        Ok(())
    }

    async fn is_running(&self) -> bool {
        *self.state.lock().await == ServerState::Running
    }

    /// Route one HTTP request through the transport.
    ///
    /// Returns [`Dispatch::Unhandled`] for requests on other paths or with
    /// other methods, and [`Dispatch::Abort`] once the server stopped
    /// running. Hosts embedding the server without a listener call this
    /// from their own request handler.
    pub async fn dispatch<B>(&self, req: Request<B>) -> SockResult<Dispatch<B>>
    where
        B: hyper::body::Body,
    {
        if !self.is_running().await {
            return Ok(Dispatch::Abort);
        }
        if req.uri().path() != self.path {
            return Ok(Dispatch::Unhandled(req));
        }
        let method = req.method().clone();
        if method == Method::HEAD {
            self.handshake(req.headers().clone()).await.map(Dispatch::Response)
        } else if method == Method::PATCH {
            self.poll(req).await
        } else if method == Method::DELETE {
            self.close_session(&req).await.map(Dispatch::Response)
        } else {
            Ok(Dispatch::Unhandled(req))
        }
    }

    /// Entry point for the owned listener.
    pub(crate) async fn handle(
        &self,
        req: Request<Incoming>,
    ) -> SockResult<Response<Full<Bytes>>> {
        match self.dispatch(req).await? {
            Dispatch::Response(resp) => Ok(resp),
            Dispatch::Unhandled(_) => text(StatusCode::NOT_FOUND, "Not Found"),
            Dispatch::Abort => Err(SockError::Aborted),
        }
    }

    /// `HEAD`: open a fresh session and advertise it.
    async fn handshake(&self, headers: http::HeaderMap) -> SockResult<Response<Full<Bytes>>> {
        let socket = self
            .create_session(proto::generate_session_id(), headers)
            .await;
        Response::builder()
            .status(StatusCode::OK)
            .header(proto::SOCKET_ID, socket.id())
            .header(proto::MAX_POOL_SIZE, self.max_pool.to_string())
            .header(http::header::CONTENT_TYPE, "application/json")
            .body(Full::new(Bytes::new()))
            .map_err(|e| SockError::Http(e.to_string()))
    }

    /// `PATCH`: deliver the inbound batch and complete or park the response.
    async fn poll<B>(&self, req: Request<B>) -> SockResult<Dispatch<B>>
    where
        B: hyper::body::Body,
    {
        let Some(id) = header_str(&req, proto::SOCKET_ID) else {
            return text(StatusCode::BAD_REQUEST, "Missing Socket-Id").map(Dispatch::Response);
        };
        let id = id.to_string();

        let session = match self.registry.get(&id).await {
            Some(session) => session,
            None if self.allow_client_ids => {
                self.create_session(id, req.headers().clone()).await
            }
            None => {
                return text(StatusCode::NOT_FOUND, "Invalid Socket-Id").map(Dispatch::Response)
            }
        };

        // An unreadable body counts as an empty batch.
        let body = match req.into_body().collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(_) => Bytes::new(),
        };

        match session.poll(&body).await {
            PollAction::Respond { status, close, body } => {
                batch_response(status, close, body).map(Dispatch::Response)
            }
            PollAction::Parked(mut rx) => match rx.recv().await {
                Some(ParkedReply::Flush { status, close, body }) => {
                    batch_response(status, close, body).map(Dispatch::Response)
                }
                Some(ParkedReply::Abort) | None => Ok(Dispatch::Abort),
            },
            PollAction::Abort => Ok(Dispatch::Abort),
        }
    }

    /// `DELETE`: close the session with the client's code and reason.
    async fn close_session<B>(&self, req: &Request<B>) -> SockResult<Response<Full<Bytes>>> {
        let Some(id) = header_str(req, proto::SOCKET_ID) else {
            return text(StatusCode::BAD_REQUEST, "Missing Socket-Id");
        };
        let Some(session) = self.registry.get(id).await else {
            return text(StatusCode::NOT_FOUND, "Invalid Socket-Id");
        };

        let code = proto::parse_close_code(header_str(req, proto::CLOSE_CODE).unwrap_or(""));
        let reason = header_str(req, proto::CLOSE_REASON).unwrap_or("").to_string();
        info!(session_id = %id, code, reason = %reason, "close requested by client");
        session.close_remote(code, &reason).await;
        text(StatusCode::OK, "")
    }

    async fn create_session(&self, id: String, headers: http::HeaderMap) -> Arc<ServerSocket> {
        let (socket, events) = ServerSocket::open(
            id,
            self.max_pool,
            self.buffer_time,
            self.registry.clone(),
        );
        self.registry.insert(socket.clone()).await;
        info!(session_id = %socket.id(), "session opened");
        let _ = self.events.send(ServerEvent::Connection {
            socket: socket.clone(),
            events,
            headers,
        });
        socket
    }
}

fn header_str<'a, B>(req: &'a Request<B>, name: &str) -> Option<&'a str> {
    req.headers().get(name).and_then(|v| v.to_str().ok())
}

pub(crate) fn text(status: StatusCode, body: &'static str) -> SockResult<Response<Full<Bytes>>> {
    Response::builder()
        .status(status)
        .body(Full::new(Bytes::from_static(body.as_bytes())))
        .map_err(|e| SockError::Http(e.to_string()))
}

/// Build a poll response carrying a message batch and, on the final drain,
/// the close metadata headers.
fn batch_response(
    status: StatusCode,
    close: Option<CloseInfo>,
    body: String,
) -> SockResult<Response<Full<Bytes>>> {
    let mut builder = Response::builder().status(status);
    if let Some(info) = close {
        builder = builder.header(proto::CLOSE_CODE, info.code.to_string());
        if let Ok(value) = HeaderValue::from_str(&info.reason) {
            builder = builder.header(proto::CLOSE_REASON, value);
        }
    }
    builder
        .body(Full::new(Bytes::from(body)))
        .map_err(|e| SockError::Http(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;

    fn external_config() -> ServerConfig {
        ServerConfig {
            external: true,
            ..ServerConfig::default()
        }
    }

    fn request(method: Method, path: &str, body: &str) -> Request<Full<Bytes>> {
        Request::builder()
            .method(method)
            .uri(path)
            .body(Full::new(Bytes::from(body.to_string())))
            .unwrap()
    }

    #[tokio::test]
    async fn rejects_ambiguous_bindings() {
        let err = SocketServer::new(ServerConfig::default()).await.unwrap_err();
        assert!(matches!(err, SockError::Usage(_)));

        let both = ServerConfig {
            port: Some(0),
            external: true,
            ..ServerConfig::default()
        };
        assert!(matches!(
            SocketServer::new(both).await.unwrap_err(),
            SockError::Usage(_)
        ));
    }

    #[tokio::test]
    async fn handshake_opens_a_session() {
        let (server, mut events) = SocketServer::new(external_config()).await.unwrap();

        let dispatch = server.dispatch(request(Method::HEAD, "/", "")).await.unwrap();
        let Dispatch::Response(resp) = dispatch else {
            panic!("expected a handshake response");
        };
        assert_eq!(resp.status(), StatusCode::OK);
        let id = resp.headers()[proto::SOCKET_ID].to_str().unwrap().to_string();
        assert_eq!(id.len(), 32);
        assert_eq!(resp.headers()[proto::MAX_POOL_SIZE], "2");

        match events.recv().await.unwrap() {
            ServerEvent::Connection { socket, .. } => assert_eq!(socket.id(), id),
            ServerEvent::Closed => panic!("unexpected close event"),
        }
        assert_eq!(server.session_count().await, 1);
    }

    #[tokio::test]
    async fn poll_requires_a_session_id() {
        let (server, _events) = SocketServer::new(external_config()).await.unwrap();
        let Dispatch::Response(resp) = server
            .dispatch(request(Method::PATCH, "/", "[]"))
            .await
            .unwrap()
        else {
            panic!("expected a response");
        };
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn poll_rejects_unknown_session_ids() {
        let (server, _events) = SocketServer::new(external_config()).await.unwrap();
        let req = Request::builder()
            .method(Method::PATCH)
            .uri("/")
            .header(proto::SOCKET_ID, "deadbeef")
            .body(Full::new(Bytes::from_static(b"[]")))
            .unwrap();
        let Dispatch::Response(resp) = server.dispatch(req).await.unwrap() else {
            panic!("expected a response");
        };
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn poll_adopts_unknown_ids_when_configured() {
        let config = ServerConfig {
            allow_client_ids: true,
            ..external_config()
        };
        let (server, mut events) = SocketServer::new(config).await.unwrap();
        let req = Request::builder()
            .method(Method::PATCH)
            .uri("/")
            .header(proto::SOCKET_ID, "adopted-id")
            .body(Full::new(Bytes::from_static(b"[\"hello\"]")))
            .unwrap();

        // The poll parks; the session now exists and got the message.
        let dispatch = tokio::time::timeout(
            std::time::Duration::from_millis(200),
            server.dispatch(req),
        )
        .await;
        assert!(dispatch.is_err(), "adopted poll should stay parked");

        let ServerEvent::Connection { socket, events: mut session_events, .. } =
            events.recv().await.unwrap()
        else {
            panic!("expected a connection event");
        };
        assert_eq!(socket.id(), "adopted-id");
        match session_events.recv().await.unwrap() {
            htsock_core::SocketEvent::Message(v) => assert_eq!(v, "hello"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn unrelated_requests_fall_through() {
        let (server, _events) = SocketServer::new(external_config()).await.unwrap();
        assert!(matches!(
            server.dispatch(request(Method::GET, "/", "")).await.unwrap(),
            Dispatch::Unhandled(_)
        ));
        assert!(matches!(
            server.dispatch(request(Method::HEAD, "/elsewhere", "")).await.unwrap(),
            Dispatch::Unhandled(_)
        ));
    }

    #[tokio::test]
    async fn delete_closes_the_session() {
        let (server, mut events) = SocketServer::new(external_config()).await.unwrap();
        let Dispatch::Response(resp) =
            server.dispatch(request(Method::HEAD, "/", "")).await.unwrap()
        else {
            panic!("expected a handshake response");
        };
        let id = resp.headers()[proto::SOCKET_ID].to_str().unwrap().to_string();
        let ServerEvent::Connection { events: mut session_events, .. } =
            events.recv().await.unwrap()
        else {
            panic!("expected a connection event");
        };

        let req = Request::builder()
            .method(Method::DELETE)
            .uri("/")
            .header(proto::SOCKET_ID, &id)
            .header(proto::CLOSE_CODE, "1001")
            .header(proto::CLOSE_REASON, "bye")
            .body(Full::new(Bytes::new()))
            .unwrap();
        let Dispatch::Response(resp) = server.dispatch(req).await.unwrap() else {
            panic!("expected a response");
        };
        assert_eq!(resp.status(), StatusCode::OK);

        match session_events.recv().await.unwrap() {
            htsock_core::SocketEvent::Close(info) => {
                assert_eq!(info, CloseInfo::new(1001, "bye"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert_eq!(server.session_count().await, 0);
    }

    #[tokio::test]
    async fn delete_defaults_unparseable_close_codes() {
        let (server, mut events) = SocketServer::new(external_config()).await.unwrap();
        let Dispatch::Response(resp) =
            server.dispatch(request(Method::HEAD, "/", "")).await.unwrap()
        else {
            panic!("expected a handshake response");
        };
        let id = resp.headers()[proto::SOCKET_ID].to_str().unwrap().to_string();
        let ServerEvent::Connection { events: mut session_events, .. } =
            events.recv().await.unwrap()
        else {
            panic!("expected a connection event");
        };

        let req = Request::builder()
            .method(Method::DELETE)
            .uri("/")
            .header(proto::SOCKET_ID, &id)
            .header(proto::CLOSE_CODE, "abc")
            .body(Full::new(Bytes::new()))
            .unwrap();
        let Dispatch::Response(resp) = server.dispatch(req).await.unwrap() else {
            panic!("expected a response");
        };
        assert_eq!(resp.status(), StatusCode::OK);

        match session_events.recv().await.unwrap() {
            htsock_core::SocketEvent::Close(info) => assert_eq!(info.code, 1000),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn close_is_terminal() {
        let (server, mut events) = SocketServer::new(external_config()).await.unwrap();
        let _ = server.dispatch(request(Method::HEAD, "/", "")).await.unwrap();
        events.recv().await.unwrap();

        server.close().await.unwrap();
        assert!(matches!(events.recv().await, Some(ServerEvent::Closed)));
        assert_eq!(server.session_count().await, 0);
        assert!(matches!(server.close().await, Err(SockError::NotRunning)));

        // Requests after shutdown are dropped, not answered.
        assert!(matches!(
            server.dispatch(request(Method::HEAD, "/", "")).await.unwrap(),
            Dispatch::Abort
        ));
    }
}
