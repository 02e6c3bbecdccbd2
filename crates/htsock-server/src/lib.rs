//! htsock-server: server peer of the htsock transport.
//!
//! Emulates a full-duplex socket for clients that can only issue outbound
//! HTTP requests. Clients open a session with `HEAD` and then keep a small
//! pool of `PATCH` requests in flight; the server holds those responses
//! open and completes one whenever it has messages to deliver, while the
//! request bodies carry the client-to-server direction. `DELETE` closes the
//! session from either side's initiative.
//!
//! The server can own its HTTP listener (bind a port or adopt a
//! [`tokio::net::TcpListener`]) or be embedded behind a host application
//! that routes requests into [`SocketServer::dispatch`].

pub mod config;
mod listener;
pub mod registry;
pub mod server;
pub mod session;

pub use config::ServerConfig;
pub use server::{Dispatch, ServerEvent, SocketServer};
pub use session::{ServerSocket, SessionState};

pub use htsock_core::event::EventStream;
pub use htsock_core::{CloseInfo, SockError, SockResult, SocketEvent};
