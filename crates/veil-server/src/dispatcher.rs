//! TCP dispatcher
//!
//! Accepts connections on a tokio listener and serves each one on a
//! blocking thread with a [`NetworkChannel`], answering requests until the
//! peer disconnects. Every request runs against the database snapshot
//! current when it arrived. On shutdown the open connections are closed
//! and [`Dispatcher::serve`] returns once their threads have finished.

use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::{Arc, Mutex};

use tokio::net::TcpListener;
use tokio::task::JoinSet;
use veil_core::{Error, HeBackend, NetworkChannel, TransparentBackend};

use crate::error::Result;
use crate::metrics;
use crate::session::handle_request;
use crate::shared::SharedSenderDb;

/// Sockets of connections still being served, keyed by connection number
#[derive(Default)]
struct OpenConnections {
    streams: Mutex<HashMap<u64, TcpStream>>,
}

impl OpenConnections {
    fn register(&self, id: u64, stream: &TcpStream) {
        let Ok(clone) = stream.try_clone() else {
            return;
        };
        if let Ok(mut streams) = self.streams.lock() {
            streams.insert(id, clone);
        }
    }

    fn remove(&self, id: u64) {
        if let Ok(mut streams) = self.streams.lock() {
            streams.remove(&id);
        }
    }

    fn close_all(&self) -> usize {
        let Ok(mut streams) = self.streams.lock() else {
            return 0;
        };
        for stream in streams.values() {
            let _ = stream.shutdown(Shutdown::Both);
        }
        let count = streams.len();
        streams.clear();
        count
    }
}

pub struct Dispatcher<B: HeBackend = TransparentBackend> {
    db: Arc<SharedSenderDb>,
    pool: Arc<rayon::ThreadPool>,
    _backend: PhantomData<fn() -> B>,
}

impl<B: HeBackend + 'static> Dispatcher<B> {
    pub fn new(db: Arc<SharedSenderDb>, pool: Arc<rayon::ThreadPool>) -> Self {
        Self {
            db,
            pool,
            _backend: PhantomData,
        }
    }

    /// Bind `addr` and serve until `shutdown` resolves
    pub async fn run(self, addr: SocketAddr, shutdown: impl Future<Output = ()>) -> Result<()> {
        let listener = TcpListener::bind(addr).await?;
        self.serve(listener, shutdown).await
    }

    /// Serve connections from an already bound listener
    pub async fn serve(self, listener: TcpListener, shutdown: impl Future<Output = ()>) -> Result<()> {
        tracing::info!(addr = %listener.local_addr()?, "Dispatcher listening");
        tokio::pin!(shutdown);

        let open = Arc::new(OpenConnections::default());
        let mut connections = JoinSet::new();
        let mut next_id = 0u64;

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    let closed = open.close_all();
                    tracing::info!(open_connections = closed, "Dispatcher shutting down");
                    while connections.join_next().await.is_some() {}
                    return Ok(());
                }
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            tracing::warn!(error = %e, "accept failed");
                            continue;
                        }
                    };
                    let stream = match stream.into_std().and_then(|s| s.set_nonblocking(false).map(|_| s)) {
                        Ok(s) => s,
                        Err(e) => {
                            tracing::warn!(%peer, error = %e, "failed to prepare connection");
                            continue;
                        }
                    };

                    let id = next_id;
                    next_id += 1;
                    open.register(id, &stream);

                    let db = Arc::clone(&self.db);
                    let pool = Arc::clone(&self.pool);
                    let open = Arc::clone(&open);
                    connections.spawn_blocking(move || {
                        metrics::record_connection_opened();
                        match NetworkChannel::from_stream(stream) {
                            Ok(channel) => serve_connection::<B>(&db, &pool, channel, peer),
                            Err(e) => tracing::warn!(%peer, error = %e, "failed to set up channel"),
                        }
                        open.remove(id);
                        metrics::record_connection_closed();
                    });
                }
            }
        }
    }
}

fn serve_connection<B: HeBackend>(
    db: &SharedSenderDb,
    pool: &rayon::ThreadPool,
    mut channel: NetworkChannel,
    peer: SocketAddr,
) {
    tracing::debug!(%peer, "connection opened");
    loop {
        let snapshot = match db.snapshot() {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::warn!(%peer, error = %e, "closing connection");
                break;
            }
        };

        match handle_request::<B, _>(&snapshot, &mut channel, pool) {
            Ok(operation) => tracing::info!(%peer, %operation, "request served"),
            Err(Error::TransportError(e)) => {
                tracing::debug!(%peer, reason = %e, "connection closed");
                break;
            }
            Err(e @ Error::MalformedMessage(_)) => {
                tracing::warn!(%peer, error = %e, "dropping connection after malformed frame");
                break;
            }
            Err(e) => tracing::warn!(%peer, error = %e, "request failed"),
        }
    }
}
