//! htsock-client: client peer of the htsock transport.
//!
//! For environments that can only issue outbound HTTP requests, this crate
//! emulates a full-duplex socket: a `HEAD` handshake opens a session, a
//! small pool of long-lived `PATCH` requests serves as the reverse channel
//! for server-to-client messages, and queued outbound messages ride in the
//! request bodies. The application sees a socket-like surface: an event
//! stream of `Open` / `Message` / `Close`, plus `send` and `close`.

pub mod config;
mod driver;
pub mod socket;

pub use config::ClientConfig;
pub use socket::{ClientSocket, ClientState};

pub use htsock_core::event::EventStream;
pub use htsock_core::{CloseInfo, SockError, SockResult, SocketEvent};
