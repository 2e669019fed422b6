//! HTTP front end
//!
//! Accepts inbound connections and serves each on its own task. Every
//! request is handed to the forwarder together with the shared address
//! table. An optional semaphore caps concurrent connections.

use crate::context::AppContext;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// How long open connections get to finish after shutdown is requested
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

pub struct ProxyServer {
    context: Arc<AppContext>,
    limiter: Option<Arc<Semaphore>>,
    accepted: Arc<AtomicU64>,
}

impl ProxyServer {
    /// `max_connections` of 0 leaves concurrency unbounded
    pub fn new(context: Arc<AppContext>, max_connections: usize) -> Self {
        let limiter = (max_connections > 0).then(|| Arc::new(Semaphore::new(max_connections)));
        Self {
            context,
            limiter,
            accepted: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn connections_accepted(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }

    /// Serve until `shutdown` resolves, then let open connections finish
    pub async fn run_until<F>(&self, listener: TcpListener, shutdown: F) -> std::io::Result<()>
    where
        F: Future<Output = ()>,
    {
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, peers = self.context.table.len(), "Proxy listening");

        let (stop_tx, stop_rx) = watch::channel(false);
        let mut connections = JoinSet::new();
        tokio::pin!(shutdown);

        loop {
            let permit = match self.acquire(&mut shutdown).await {
                Some(permit) => permit,
                None => break,
            };

            tokio::select! {
                _ = &mut shutdown => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        self.accepted.fetch_add(1, Ordering::Relaxed);
                        let context = Arc::clone(&self.context);
                        let stop = stop_rx.clone();
                        connections.spawn(serve_connection(context, stream, peer, stop, permit));
                    }
                    Err(e) => error!(error = %e, "Accept failed"),
                },
            }

            // Reap finished connection tasks
            while connections.try_join_next().is_some() {}
        }

        info!(open = connections.len(), "Proxy shutting down");
        let _ = stop_tx.send(true);
        let drained = tokio::time::timeout(DRAIN_TIMEOUT, async {
            while connections.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(open = connections.len(), "Aborting connections still open after drain timeout");
            connections.abort_all();
        }
        Ok(())
    }

    /// Wait for a connection slot; `None` when shutdown came first
    async fn acquire<F>(&self, shutdown: &mut std::pin::Pin<&mut F>) -> Option<Option<OwnedSemaphorePermit>>
    where
        F: Future<Output = ()>,
    {
        let Some(limiter) = &self.limiter else {
            return Some(None);
        };
        tokio::select! {
            _ = shutdown.as_mut() => None,
            permit = Arc::clone(limiter).acquire_owned() => permit.ok().map(Some),
        }
    }
}

async fn serve_connection(
    context: Arc<AppContext>,
    stream: TcpStream,
    peer: SocketAddr,
    mut stop: watch::Receiver<bool>,
    _permit: Option<OwnedSemaphorePermit>,
) {
    debug!(peer = %peer, "Connection accepted");

    let service = service_fn(move |request: Request<Incoming>| {
        let context = Arc::clone(&context);
        async move {
            let response = context.forwarder.handle(request, &context.table).await;
            Ok::<_, Infallible>(response)
        }
    });

    let connection = http1::Builder::new().serve_connection(TokioIo::new(stream), service);
    tokio::pin!(connection);

    tokio::select! {
        result = connection.as_mut() => {
            if let Err(e) = result {
                debug!(peer = %peer, error = %e, "Connection ended with error");
            }
        }
        _ = stop.changed() => {
            connection.as_mut().graceful_shutdown();
            if let Err(e) = connection.await {
                debug!(peer = %peer, error = %e, "Connection ended with error during shutdown");
            }
        }
    }
    debug!(peer = %peer, "Connection closed");
}
