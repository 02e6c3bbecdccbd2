//! Per-session server socket.
//!
//! A `ServerSocket` owns everything the server keeps per accepted client:
//! the outbound message buffer, the queue of poll responses currently held
//! open, the single-slot flush timer that coalesces rapid sends, and the
//! lifecycle state. Polls either complete immediately (buffered data or a
//! close in progress) or park until a flush arrives.

use crate::registry::SessionRegistry;
use htsock_core::event::{event_channel, EventSender, EventStream, SocketEvent};
use htsock_core::proto::{self, CloseInfo, CLOSE_NORMAL};
use http::StatusCode;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// Lifecycle of a server session. Transitions are one-way:
/// `Open` -> `Closing` -> `Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Accepting polls, parking responses, delivering messages.
    Open,
    /// A close was requested locally; the final drain response is still
    /// owed to the client.
    Closing,
    /// Fully torn down and out of the registry.
    Closed,
}

/// How a held-open poll response is completed.
pub(crate) enum ParkedReply {
    /// Write this response out.
    Flush {
        status: StatusCode,
        close: Option<CloseInfo>,
        body: String,
    },
    /// Tear the connection down without writing anything.
    Abort,
}

/// One poll response currently held open.
///
/// `tx` is a capacity-one channel whose receiver sits with the waiting
/// HTTP handler; at most one reply ever travels through it. A watcher task
/// holds a second sender and waits on `closed()`, so the entry is removed
/// as soon as the requester disconnects, without waiting for traffic.
struct Parked {
    id: u64,
    tx: mpsc::Sender<ParkedReply>,
}

/// What the dispatcher should do with a poll request.
pub(crate) enum PollAction {
    /// Complete the response right away.
    Respond {
        status: StatusCode,
        close: Option<CloseInfo>,
        body: String,
    },
    /// Hold the response open until a reply arrives.
    Parked(mpsc::Receiver<ParkedReply>),
    /// Tear the connection down without writing anything.
    Abort,
}

struct SessionInner {
    state: SessionState,
    /// Messages queued for the client, oldest first.
    outbound: Vec<Value>,
    /// Held-open poll responses, oldest first.
    parked: VecDeque<Parked>,
    next_parked_id: u64,
    /// At most one pending deferred flush.
    flush_timer: Option<JoinHandle<()>>,
    close_info: Option<CloseInfo>,
}

impl Default for SessionInner {
    fn default() -> Self {
        Self {
            state: SessionState::Open,
            outbound: Vec::new(),
            parked: VecDeque::new(),
            next_parked_id: 0,
            flush_timer: None,
            close_info: None,
        }
    }
}

/// Server-side half of one client connection.
pub struct ServerSocket {
    id: String,
    max_pool: usize,
    buffer_time: Duration,
    registry: SessionRegistry,
    events: EventSender,
    inner: Mutex<SessionInner>,
}

impl ServerSocket {
    /// Create a session in the open state. The caller registers it.
    pub(crate) fn open(
        id: String,
        max_pool: usize,
        buffer_time: Duration,
        registry: SessionRegistry,
    ) -> (Arc<Self>, EventStream) {
        let (events, stream) = event_channel();
        let socket = Arc::new(Self {
            id,
            max_pool,
            buffer_time,
            registry,
            events,
            inner: Mutex::new(SessionInner::default()),
        });
        (socket, stream)
    }

    /// The session id assigned at handshake.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn state(&self) -> SessionState {
        self.inner.lock().await.state
    }

    /// Number of messages currently queued for the client.
    pub async fn buffered_amount(&self) -> usize {
        self.inner.lock().await.outbound.len()
    }

    /// Number of poll responses currently held open.
    pub async fn parked_len(&self) -> usize {
        self.inner.lock().await.parked.len()
    }

    /// Handle one poll request whose body has already been read.
    ///
    /// Inbound messages are delivered first; then the response is either
    /// completed (close drain, buffered data) or parked. Parking beyond the
    /// pool limit completes the oldest held response with an empty batch.
    pub(crate) async fn poll(self: &Arc<Self>, body: &[u8]) -> PollAction {
        let mut terminated = false;
        let action = {
            let mut inner = self.inner.lock().await;
            if inner.state == SessionState::Closed {
                return PollAction::Abort;
            }

            if let Some(items) = proto::decode_batch(body) {
                for item in items {
                    let _ = self.events.send(SocketEvent::Message(item));
                }
            }

            if inner.state == SessionState::Closing {
                let close = inner.close_info.clone().unwrap_or_else(CloseInfo::normal);
                let batch = std::mem::take(&mut inner.outbound);
                self.terminate_locked(&mut inner);
                terminated = true;
                PollAction::Respond {
                    status: StatusCode::GONE,
                    close: Some(close),
                    body: proto::encode_batch(&batch),
                }
            } else if !inner.outbound.is_empty() && inner.flush_timer.is_none() {
                let batch = std::mem::take(&mut inner.outbound);
                PollAction::Respond {
                    status: StatusCode::OK,
                    close: None,
                    body: proto::encode_batch(&batch),
                }
            } else {
                let id = inner.next_parked_id;
                inner.next_parked_id += 1;
                let (tx, rx) = mpsc::channel(1);
                inner.parked.push_back(Parked { id, tx: tx.clone() });
                if inner.parked.len() > self.max_pool {
                    if let Some(oldest) = inner.parked.pop_front() {
                        let _ = oldest.tx.try_send(ParkedReply::Flush {
                            status: StatusCode::OK,
                            close: None,
                            body: "[]".to_string(),
                        });
                    }
                }

                // Unpark the entry the moment its requester goes away,
                // independent of any future traffic on the session.
                let socket = Arc::clone(self);
                tokio::spawn(async move {
                    tx.closed().await;
                    socket.remove_parked(id).await;
                });

                trace!(session_id = %self.id, parked = inner.parked.len(), "poll parked");
                PollAction::Parked(rx)
            }
        };
        if terminated {
            self.registry.remove(&self.id).await;
        }
        action
    }

    /// Drop a parked entry once its requester has disconnected. Called by
    /// the per-entry watcher; a no-op when the entry was already flushed.
    async fn remove_parked(&self, id: u64) {
        let mut inner = self.inner.lock().await;
        if let Some(pos) = inner.parked.iter().position(|p| p.id == id) {
            inner.parked.remove(pos);
            trace!(session_id = %self.id, parked = inner.parked.len(), "dead poll unparked");
        }
    }

    /// Queue one message for the client.
    ///
    /// The first queued message schedules a deferred flush; messages sent
    /// within the coalescing window ride the same flush. When no poll
    /// response is parked at flush time, the batch stays queued until the
    /// next poll picks it up. Sends on a closing or closed session are
    /// dropped.
    pub async fn send(self: &Arc<Self>, message: Value) {
        let mut inner = self.inner.lock().await;
        if inner.state != SessionState::Open {
            return;
        }
        inner.outbound.push(message);
        if inner.flush_timer.is_some() {
            return;
        }
        let socket = Arc::clone(self);
        inner.flush_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(socket.buffer_time).await;
            socket.fire_flush().await;
        }));
    }

    /// The deferred flush scheduled by [`send`](Self::send).
    async fn fire_flush(self: Arc<Self>) {
        let (parked, batch) = {
            let mut inner = self.inner.lock().await;
            inner.flush_timer = None;
            if inner.state != SessionState::Open || inner.outbound.is_empty() {
                return;
            }
            let Some(parked) = pop_live(&mut inner) else {
                // Nothing parked: the batch waits for the next poll.
                return;
            };
            let batch = std::mem::take(&mut inner.outbound);
            (parked, batch)
        };
        let body = proto::encode_batch(&batch);
        trace!(session_id = %self.id, messages = batch.len(), "flushing to parked poll");
        if parked
            .tx
            .try_send(ParkedReply::Flush {
                status: StatusCode::OK,
                close: None,
                body,
            })
            .is_err()
        {
            // The requester vanished between the liveness check and the
            // send; put the batch back so the next poll delivers it.
            let mut inner = self.inner.lock().await;
            let mut restored = batch;
            restored.append(&mut inner.outbound);
            inner.outbound = restored;
        }
    }

    /// Close the session from the server side.
    ///
    /// Emits the close event once and, when a poll response is parked,
    /// drains the remaining buffer into it with a 410 and tears the session
    /// down. With nothing parked the session stays in `Closing` and the
    /// next poll carries the drain response.
    pub async fn close(&self, code: u16, reason: &str) {
        let flush = {
            let mut inner = self.inner.lock().await;
            if inner.state != SessionState::Open {
                return;
            }
            inner.state = SessionState::Closing;
            let info = CloseInfo::new(code, reason);
            inner.close_info = Some(info.clone());
            let _ = self.events.send(SocketEvent::Close(info.clone()));
            debug!(session_id = %self.id, code, reason, "session closing");
            match pop_live(&mut inner) {
                Some(parked) => {
                    let batch = std::mem::take(&mut inner.outbound);
                    self.terminate_locked(&mut inner);
                    Some((parked, info, proto::encode_batch(&batch)))
                }
                None => None,
            }
        };
        if let Some((parked, info, body)) = flush {
            let _ = parked.tx.try_send(ParkedReply::Flush {
                status: StatusCode::GONE,
                close: Some(info),
                body,
            });
            self.registry.remove(&self.id).await;
        }
    }

    /// Close requested by the client (DELETE): straight to closed.
    pub(crate) async fn close_remote(&self, code: u16, reason: &str) {
        {
            let mut inner = self.inner.lock().await;
            if inner.state == SessionState::Open {
                let info = CloseInfo::new(code, reason);
                inner.close_info = Some(info.clone());
                inner.state = SessionState::Closing;
                let _ = self.events.send(SocketEvent::Close(info));
            }
            self.terminate_locked(&mut inner);
        }
        self.registry.remove(&self.id).await;
    }

    /// Unconditional teardown: abort every held response, cancel the flush
    /// timer, leave the registry. Emits a close event only if none was
    /// emitted yet.
    pub async fn terminate(&self) {
        {
            let mut inner = self.inner.lock().await;
            self.terminate_locked(&mut inner);
        }
        self.registry.remove(&self.id).await;
    }

    fn terminate_locked(&self, inner: &mut SessionInner) {
        if inner.state == SessionState::Closed {
            return;
        }
        if inner.state == SessionState::Open {
            let info = CloseInfo::new(CLOSE_NORMAL, "socket was terminated");
            inner.close_info = Some(info.clone());
            let _ = self.events.send(SocketEvent::Close(info));
        }
        inner.state = SessionState::Closed;
        if let Some(timer) = inner.flush_timer.take() {
            timer.abort();
        }
        while let Some(parked) = inner.parked.pop_front() {
            let _ = parked.tx.try_send(ParkedReply::Abort);
        }
        debug!(session_id = %self.id, "session terminated");
    }
}

/// Pop the oldest parked response whose requester is still connected.
/// Watchers remove dead entries eagerly; the skip here covers the window
/// between a disconnect and its watcher running.
fn pop_live(inner: &mut SessionInner) -> Option<Parked> {
    while let Some(parked) = inner.parked.pop_front() {
        if !parked.tx.is_closed() {
            return Some(parked);
        }
    }
    None
}
