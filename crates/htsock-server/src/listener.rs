//! The owned HTTP listener.
//!
//! Accepts TCP connections and serves HTTP/1.1 on each, routing every
//! request through [`SocketServer::dispatch`]. A request the transport does
//! not handle gets a plain 404; a request the transport aborts (a destroyed
//! parked response, or any request after shutdown) errors the service,
//! which makes hyper drop the connection without writing a response.

use crate::server::SocketServer;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, warn};

pub(crate) async fn serve(
    server: Arc<SocketServer>,
    listener: TcpListener,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            accepted = listener.accept() => {
                let (stream, remote) = match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        continue;
                    }
                };
                let server = Arc::clone(&server);
                tokio::spawn(async move {
                    let io = TokioIo::new(stream);
                    let service = service_fn(move |req| {
                        let server = Arc::clone(&server);
                        async move { server.handle(req).await }
                    });
                    if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                        debug!(remote = %remote, error = %e, "connection ended");
                    }
                });
            }
        }
    }
    debug!("listener stopped");
}
