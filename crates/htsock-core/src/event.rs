//! The event stream a socket surfaces to the application.

use crate::proto::CloseInfo;
use serde_json::Value;
use tokio::sync::mpsc;

/// What a socket tells the application over its lifetime.
///
/// `Open` is emitted once by client sockets when the handshake completes
/// (server sessions are born open, announced by the server's connection
/// event instead). `Close` is terminal and emitted at most once; after it,
/// no further events arrive on the stream.
#[derive(Debug, Clone)]
pub enum SocketEvent {
    /// The socket is ready to send and receive.
    Open,
    /// One message from the remote peer, in delivery order.
    Message(Value),
    /// The socket closed, with the negotiated code and reason.
    Close(CloseInfo),
}

/// Receiving half of a socket's event stream.
pub type EventStream = mpsc::UnboundedReceiver<SocketEvent>;

/// Sending half, held by the transport internals.
pub type EventSender = mpsc::UnboundedSender<SocketEvent>;

/// Create a connected event channel pair.
pub fn event_channel() -> (mpsc::UnboundedSender<SocketEvent>, EventStream) {
    mpsc::unbounded_channel()
}
