//! htsock-core: shared protocol layer for the htsock transport.
//!
//! Provides the error taxonomy, wire constants (header names and close
//! codes), the JSON batch codec, session-id generation, and the event type
//! both peers surface.

pub mod error;
pub mod event;
pub mod proto;

// Re-export commonly used items at crate root.
pub use error::{SockError, SockResult};
pub use event::SocketEvent;
pub use proto::{CloseInfo, CLOSE_GOING_AWAY, CLOSE_NORMAL, CLOSE_PROTOCOL_ERROR};
