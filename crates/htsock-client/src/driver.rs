//! The connection-pool driver.
//!
//! After the handshake, the driver keeps up to
//! `min(server_max_pool, max_pool_size)` `PATCH` requests in flight. Each
//! pool slot loops: snapshot and clear the outbound buffer, send it as the
//! request body, deliver whatever the response carries, then re-claim a
//! slot if the socket is still open and the pool is below its cap. Network
//! failures are uniformly retryable (the batch goes back to the front of
//! the buffer and the slot pauses a second); a session the server no longer
//! knows answers 404, which closes the socket.

use crate::socket::{ClientShared, ClientState};
use htsock_core::event::SocketEvent;
use htsock_core::proto::{self, CloseInfo, CLOSE_GOING_AWAY, CLOSE_NORMAL, CLOSE_PROTOCOL_ERROR};
use reqwest::header::HeaderValue;
use reqwest::StatusCode;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Pause before retrying a failed poll, and between close attempts.
const RETRY_DELAY: Duration = Duration::from_secs(1);
/// How many times the close `DELETE` is attempted.
const CLOSE_ATTEMPTS: u32 = 3;

/// Perform the `HEAD` handshake, then start filling the pool.
pub(crate) async fn connect(shared: Arc<ClientShared>) {
    let response = shared
        .http
        .head(&shared.url)
        .headers(shared.headers.clone())
        .send()
        .await;

    let response = match response {
        Ok(response) => response,
        Err(e) => {
            close_local(&shared, CLOSE_PROTOCOL_ERROR, &format!("error while connecting: {e}"))
                .await;
            return;
        }
    };

    let status = response.status();
    if !status.is_success() {
        let message = status.canonical_reason().unwrap_or("unexpected status");
        close_local(
            &shared,
            CLOSE_PROTOCOL_ERROR,
            &format!("{}: {}", status.as_u16(), message),
        )
        .await;
        return;
    }

    let session_id = response
        .headers()
        .get(proto::SOCKET_ID)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let server_max_pool = response
        .headers()
        .get(proto::MAX_POOL_SIZE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<usize>().ok());
    let (Some(session_id), Some(server_max_pool)) = (session_id, server_max_pool) else {
        close_local(&shared, CLOSE_PROTOCOL_ERROR, "server returned malformed data").await;
        return;
    };

    {
        let mut inner = shared.inner.lock().await;
        if inner.state != ClientState::Connecting {
            // Closed while the handshake was in flight.
            return;
        }
        inner.state = ClientState::Open;
        inner.server_max_pool = server_max_pool.max(1);
        inner.session_id = Some(session_id.clone());
        info!(
            session_id = %session_id,
            server_max_pool = inner.server_max_pool,
            "socket open"
        );
        let _ = shared.events.send(SocketEvent::Open);

        if shared.config.close_on_shutdown {
            let hook_shared = Arc::clone(&shared);
            inner.shutdown_hook = Some(tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("shutdown signal received, closing socket");
                    // Detach our own handle so close() does not abort us
                    // mid-handshake.
                    {
                        let mut inner = hook_shared.inner.lock().await;
                        drop(inner.shutdown_hook.take());
                    }
                    close(&hook_shared, CLOSE_GOING_AWAY, "client is shutting down").await;
                }
            }));
        }
    }

    fill_pool(&shared).await;
}

/// Start polls until the pool reaches its cap. Slots are counted before
/// the tasks spawn so concurrent fills cannot overshoot.
pub(crate) async fn fill_pool(shared: &Arc<ClientShared>) {
    let start = {
        let mut inner = shared.inner.lock().await;
        if inner.state != ClientState::Open {
            return;
        }
        let cap = inner.server_max_pool.min(shared.config.max_pool_size);
        let mut started = 0;
        while inner.pool_size < cap {
            inner.pool_size += 1;
            started += 1;
        }
        started
    };
    for _ in 0..start {
        tokio::spawn(pool_slot(Arc::clone(shared)));
    }
}

/// One pool slot: poll repeatedly while the socket is open and the slot is
/// still wanted. The caller has already counted this slot in `pool_size`.
pub(crate) async fn pool_slot(shared: Arc<ClientShared>) {
    loop {
        poll_round(&shared).await;

        let mut inner = shared.inner.lock().await;
        inner.pool_size -= 1;
        let cap = inner.server_max_pool.min(shared.config.max_pool_size);
        if inner.state == ClientState::Open && inner.pool_size < cap {
            inner.pool_size += 1;
        } else {
            break;
        }
    }
}

/// Issue one poll and handle its outcome.
async fn poll_round(shared: &Arc<ClientShared>) {
    let (session_id, batch) = {
        let mut inner = shared.inner.lock().await;
        if inner.state != ClientState::Open {
            return;
        }
        let Some(session_id) = inner.session_id.clone() else {
            return;
        };
        let batch = std::mem::take(&mut inner.outbound);
        inner.buffered_amount = 0;
        (session_id, batch)
    };

    let result = shared
        .http
        .patch(&shared.url)
        .headers(shared.headers.clone())
        .header(proto::SOCKET_ID, &session_id)
        .json(&batch)
        .send()
        .await;

    match result {
        Err(e) => {
            debug!(error = %e, "poll failed, retrying");
            restore_batch(shared, batch).await;
            tokio::time::sleep(RETRY_DELAY).await;
        }
        Ok(response) => handle_poll_response(shared, response).await,
    }
}

async fn handle_poll_response(shared: &Arc<ClientShared>, response: reqwest::Response) {
    let status = response.status();

    if status == StatusCode::NOT_FOUND {
        close_local(shared, CLOSE_NORMAL, "socket was closed by server").await;
        return;
    }
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        close_local(shared, CLOSE_PROTOCOL_ERROR, "internal server error").await;
        return;
    }
    if !status.is_success() && status != StatusCode::GONE {
        // TODO: requeue the in-flight batch instead of dropping it once
        // consumers can tolerate redelivery.
        warn!(status = %status, "poll answered with unexpected status, dropping batch");
        return;
    }

    // 410 is the final drain: it still carries messages, plus the close
    // metadata in its headers.
    let close = if status == StatusCode::GONE {
        let code = proto::parse_close_code(
            response
                .headers()
                .get(proto::CLOSE_CODE)
                .and_then(|v| v.to_str().ok())
                .unwrap_or(""),
        );
        let reason = response
            .headers()
            .get(proto::CLOSE_REASON)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        Some(CloseInfo::new(code, reason))
    } else {
        None
    };

    let bytes = match response.bytes().await {
        Ok(bytes) => bytes,
        Err(e) => {
            debug!(error = %e, "failed to read poll response");
            return;
        }
    };
    let Some(items) = proto::decode_batch(&bytes) else {
        return;
    };
    for item in items {
        let _ = shared.events.send(SocketEvent::Message(item));
    }
    if let Some(info) = close {
        close_local(shared, info.code, &info.reason).await;
    }
}

/// Put an undelivered batch back at the front of the buffer, keeping order.
async fn restore_batch(shared: &Arc<ClientShared>, batch: Vec<Value>) {
    if batch.is_empty() {
        return;
    }
    let mut inner = shared.inner.lock().await;
    let mut restored = batch;
    restored.append(&mut inner.outbound);
    inner.outbound = restored;
    inner.buffered_amount = inner.outbound.len();
}

/// Close without notifying the server: handshake failures and closes the
/// server itself initiated (404, 410, 500).
pub(crate) async fn close_local(shared: &Arc<ClientShared>, code: u16, reason: &str) {
    {
        let mut inner = shared.inner.lock().await;
        if matches!(inner.state, ClientState::Closing | ClientState::Closed) {
            return;
        }
        inner.state = ClientState::Closed;
        if let Some(hook) = inner.shutdown_hook.take() {
            hook.abort();
        }
    }
    info!(code, reason, "socket closed");
    let _ = shared
        .events
        .send(SocketEvent::Close(CloseInfo::new(code, reason)));
}

/// Full close: emit the close event, tell the server with a `DELETE`
/// (retried on network failure), then settle into the closed state.
pub(crate) async fn close(shared: &Arc<ClientShared>, code: u16, reason: &str) {
    let session_id = {
        let mut inner = shared.inner.lock().await;
        if matches!(inner.state, ClientState::Closing | ClientState::Closed) {
            return;
        }
        inner.state = ClientState::Closing;
        if let Some(hook) = inner.shutdown_hook.take() {
            hook.abort();
        }
        inner.session_id.clone()
    };
    info!(code, reason, "closing socket");
    let _ = shared
        .events
        .send(SocketEvent::Close(CloseInfo::new(code, reason)));

    if let Some(id) = session_id {
        let mut request = shared
            .http
            .delete(&shared.url)
            .headers(shared.headers.clone())
            .header(proto::SOCKET_ID, &id)
            .header(proto::CLOSE_CODE, code.to_string());
        if let Ok(value) = HeaderValue::from_str(reason) {
            request = request.header(proto::CLOSE_REASON, value);
        }

        for attempt in 1..=CLOSE_ATTEMPTS {
            let Some(req) = request.try_clone() else {
                break;
            };
            match req.send().await {
                Ok(_) => break,
                Err(e) => {
                    debug!(attempt, error = %e, "close notification failed");
                    if attempt < CLOSE_ATTEMPTS {
                        tokio::time::sleep(RETRY_DELAY).await;
                    }
                }
            }
        }
    }

    let mut inner = shared.inner.lock().await;
    inner.state = ClientState::Closed;
}
