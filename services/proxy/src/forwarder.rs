//! Request forwarding
//!
//! Each routed request gets its own upstream TCP connection. Request and
//! response bodies are streamed frame by frame in both directions; neither
//! side is buffered whole. The upstream connection task lives inside the
//! response body, so a client that goes away mid-stream releases the
//! upstream socket as soon as hyper drops the body.

use crate::address_table::{AddressTable, Target};
use crate::error::{ProxyBody, ProxyError};
use crate::routing::{self, ProvenanceHeaders};
use bytes::Bytes;
use http_body_util::BodyExt;
use hyper::body::{Body, Frame, Incoming, SizeHint};
use hyper::client::conn::http1;
use hyper::header::{HeaderMap, HeaderName, HeaderValue, CONNECTION, HOST};
use hyper::{Method, Request, Response, Uri, Version};
use hyper_util::rt::TokioIo;
use peer_config::{SERVER_ADDR_HEADER, SERVER_PORT_HEADER};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Headers that describe one connection rather than the exchange
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Lifecycle of one routed request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardState {
    Received,
    HeaderValidated,
    Dialing,
    Forwarding,
    Completed,
    Rejected,
    UpstreamFailed,
}

impl ForwardState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ForwardState::Completed | ForwardState::Rejected | ForwardState::UpstreamFailed
        )
    }

    pub fn can_transition_to(self, next: ForwardState) -> bool {
        use ForwardState::*;
        match (self, next) {
            (Received, HeaderValidated) | (Received, Rejected) => true,
            (HeaderValidated, Dialing) | (HeaderValidated, Rejected) => true,
            (Dialing, Forwarding) => true,
            (Forwarding, Completed) => true,
            (HeaderValidated | Dialing | Forwarding, UpstreamFailed) => true,
            _ => false,
        }
    }
}

/// Counters shared by every request a forwarder handles
#[derive(Debug, Default)]
struct ForwarderMetrics {
    received: AtomicU64,
    rejected: AtomicU64,
    dial_attempts: AtomicU64,
    completed: AtomicU64,
    upstream_failed: AtomicU64,
}

/// Snapshot of forwarder counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ForwarderStats {
    pub received: u64,
    pub rejected: u64,
    pub dial_attempts: u64,
    pub completed: u64,
    pub upstream_failed: u64,
}

/// One request moving through the forwarder
#[derive(Debug)]
struct Exchange {
    id: u64,
    state: ForwardState,
    method: Method,
    url: String,
    caller: String,
    callee: String,
    started: Instant,
    metrics: Arc<ForwarderMetrics>,
}

impl Exchange {
    fn advance(&mut self, next: ForwardState) {
        if !self.state.can_transition_to(next) {
            warn!(exchange = self.id, from = ?self.state, to = ?next, "Ignoring illegal state transition");
            return;
        }
        trace!(exchange = self.id, from = ?self.state, to = ?next, "State transition");
        self.state = next;

        match next {
            ForwardState::Rejected => {
                self.metrics.rejected.fetch_add(1, Ordering::Relaxed);
            }
            ForwardState::Completed => {
                self.metrics.completed.fetch_add(1, Ordering::Relaxed);
                self.log_finished();
            }
            ForwardState::UpstreamFailed => {
                self.metrics.upstream_failed.fetch_add(1, Ordering::Relaxed);
                self.log_finished();
            }
            _ => {}
        }
    }

    fn log_finished(&self) {
        debug!(
            exchange = self.id,
            caller = %self.caller,
            callee = %self.callee,
            url = %self.url,
            method = %self.method,
            state = ?self.state,
            elapsed_ms = self.started.elapsed().as_millis() as u64,
            "Exchange finished"
        );
    }
}

/// Forwards routed requests to the target named in their headers
#[derive(Debug, Clone)]
pub struct RequestForwarder {
    connect_timeout: Duration,
    next_id: Arc<AtomicU64>,
    metrics: Arc<ForwarderMetrics>,
}

impl RequestForwarder {
    pub fn new(connect_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            next_id: Arc::new(AtomicU64::new(1)),
            metrics: Arc::new(ForwarderMetrics::default()),
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    pub fn stats(&self) -> ForwarderStats {
        ForwarderStats {
            received: self.metrics.received.load(Ordering::Relaxed),
            rejected: self.metrics.rejected.load(Ordering::Relaxed),
            dial_attempts: self.metrics.dial_attempts.load(Ordering::Relaxed),
            completed: self.metrics.completed.load(Ordering::Relaxed),
            upstream_failed: self.metrics.upstream_failed.load(Ordering::Relaxed),
        }
    }

    fn exchange(&self, method: &Method, uri: &Uri) -> Exchange {
        self.metrics.received.fetch_add(1, Ordering::Relaxed);
        Exchange {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            state: ForwardState::Received,
            method: method.clone(),
            url: uri.to_string(),
            caller: String::new(),
            callee: String::new(),
            started: Instant::now(),
            metrics: Arc::clone(&self.metrics),
        }
    }

    /// Route one inbound request: validate its headers, then forward it.
    ///
    /// Always yields a response; failures become plain-text 400s.
    pub async fn handle<B>(&self, request: Request<B>, table: &AddressTable) -> Response<ProxyBody>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        let mut exchange = self.exchange(request.method(), request.uri());

        let routed = routing::parse(request.headers(), table).and_then(|route| {
            let provenance = ProvenanceHeaders::for_route(&route, table)?;
            Ok((route, provenance))
        });
        let (route, provenance) = match routed {
            Ok(routed) => routed,
            Err(e) => {
                debug!(exchange = exchange.id, method = %exchange.method, url = %exchange.url, error = %e, "Rejected request");
                exchange.advance(ForwardState::Rejected);
                return ProxyError::from(e).into_response();
            }
        };

        exchange.advance(ForwardState::HeaderValidated);
        match self.dispatch(request, &route.target, &provenance, exchange).await {
            Ok(response) => response,
            Err(e) => e.into_response(),
        }
    }

    /// Forward a request whose headers were already validated
    pub async fn forward<B>(
        &self,
        request: Request<B>,
        target: &Target,
        provenance: &ProvenanceHeaders,
    ) -> Result<Response<ProxyBody>, ProxyError>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        let mut exchange = self.exchange(request.method(), request.uri());
        exchange.advance(ForwardState::HeaderValidated);
        self.dispatch(request, target, provenance, exchange).await
    }

    async fn dispatch<B>(
        &self,
        request: Request<B>,
        target: &Target,
        provenance: &ProvenanceHeaders,
        mut exchange: Exchange,
    ) -> Result<Response<ProxyBody>, ProxyError>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        exchange.caller = provenance.caller().to_string();
        exchange.callee = provenance.callee().to_string();

        let upstream_request = match upstream_request(request, target, provenance) {
            Ok(request) => request,
            Err(e) => {
                exchange.advance(ForwardState::Rejected);
                return Err(e);
            }
        };
        exchange.url = format!("http://{}{}", target, upstream_request.uri());

        exchange.advance(ForwardState::Dialing);
        let stream = match self.dial(target).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(exchange = exchange.id, target = %target, error = %e, "Dial failed");
                exchange.advance(ForwardState::UpstreamFailed);
                return Err(e);
            }
        };

        let (mut sender, connection) = match http1::handshake(TokioIo::new(stream)).await {
            Ok(handshake) => handshake,
            Err(e) => {
                exchange.advance(ForwardState::UpstreamFailed);
                return Err(ProxyError::upstream(target, e));
            }
        };
        let connection_id = exchange.id;
        let driver = tokio::spawn(async move {
            if let Err(e) = connection.await {
                debug!(exchange = connection_id, error = %e, "Upstream connection ended with error");
            }
        });

        exchange.advance(ForwardState::Forwarding);
        let response = match sender.send_request(upstream_request).await {
            Ok(response) => response,
            Err(e) => {
                driver.abort();
                warn!(exchange = exchange.id, target = %target, error = %e, "Upstream request failed");
                exchange.advance(ForwardState::UpstreamFailed);
                return Err(ProxyError::upstream(target, e));
            }
        };

        let (mut parts, body) = response.into_parts();
        strip_hop_by_hop(&mut parts.headers);
        let body = UpstreamBody {
            inner: body,
            driver: Some(driver),
            exchange,
        };
        Ok(Response::from_parts(parts, body.boxed()))
    }

    async fn dial(&self, target: &Target) -> Result<TcpStream, ProxyError> {
        self.metrics.dial_attempts.fetch_add(1, Ordering::Relaxed);
        let connect = TcpStream::connect((target.host.as_str(), target.port));
        let stream = tokio::time::timeout(self.connect_timeout, connect)
            .await
            .map_err(|_| ProxyError::ConnectTimeout {
                target: target.clone(),
                timeout: self.connect_timeout,
            })?
            .map_err(|e| ProxyError::Connect {
                target: target.clone(),
                message: e.to_string(),
            })?;
        if let Err(e) = stream.set_nodelay(true) {
            trace!(error = %e, "Could not set TCP_NODELAY");
        }
        Ok(stream)
    }
}

/// Rewrite an inbound request for the target: origin-form URI, target
/// `Host`, no routing or hop-by-hop headers, fresh provenance headers
fn upstream_request<B>(
    request: Request<B>,
    target: &Target,
    provenance: &ProvenanceHeaders,
) -> Result<Request<B>, ProxyError> {
    let (mut parts, body) = request.into_parts();

    let path = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    parts.uri = Uri::try_from(path).map_err(|e| ProxyError::InvalidRequest(e.to_string()))?;
    parts.version = Version::HTTP_11;

    strip_hop_by_hop(&mut parts.headers);
    parts.headers.remove(SERVER_ADDR_HEADER);
    parts.headers.remove(SERVER_PORT_HEADER);

    let host = HeaderValue::from_str(&target.authority())
        .map_err(|e| ProxyError::InvalidRequest(format!("host {}: {}", target, e)))?;
    parts.headers.insert(HOST, host);
    provenance.apply(&mut parts.headers);

    Ok(Request::from_parts(parts, body))
}

/// Drop hop-by-hop headers, including any named by `Connection`
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();
    for name in listed {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}

/// Upstream response body that owns the upstream connection driver.
///
/// Finishing the body completes the exchange; dropping it early aborts the
/// driver and closes the upstream socket.
struct UpstreamBody {
    inner: Incoming,
    driver: Option<JoinHandle<()>>,
    exchange: Exchange,
}

impl Body for UpstreamBody {
    type Data = Bytes;
    type Error = hyper::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        let polled = Pin::new(&mut this.inner).poll_frame(cx);
        match &polled {
            Poll::Ready(None) => this.exchange.advance(ForwardState::Completed),
            Poll::Ready(Some(Err(e))) => {
                warn!(exchange = this.exchange.id, error = %e, "Upstream body failed");
                this.exchange.advance(ForwardState::UpstreamFailed);
            }
            _ => {}
        }
        polled
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

impl Drop for UpstreamBody {
    fn drop(&mut self) {
        if !self.exchange.state.is_terminal() {
            if self.inner.is_end_stream() {
                self.exchange.advance(ForwardState::Completed);
            } else {
                debug!(exchange = self.exchange.id, "Client dropped response mid-stream");
                self.exchange.advance(ForwardState::UpstreamFailed);
            }
        }
        if let Some(driver) = self.driver.take() {
            driver.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_machine_transitions() {
        use ForwardState::*;
        assert!(Received.can_transition_to(HeaderValidated));
        assert!(Received.can_transition_to(Rejected));
        assert!(Dialing.can_transition_to(UpstreamFailed));
        assert!(Forwarding.can_transition_to(Completed));

        assert!(!Received.can_transition_to(Forwarding));
        assert!(!Completed.can_transition_to(UpstreamFailed));
        assert!(!Dialing.can_transition_to(Rejected));
        assert!(Completed.is_terminal() && Rejected.is_terminal() && UpstreamFailed.is_terminal());
    }

    #[test]
    fn test_illegal_transition_is_ignored() {
        let forwarder = RequestForwarder::new(Duration::from_secs(1));
        let mut exchange = forwarder.exchange(&Method::GET, &Uri::from_static("/"));
        exchange.advance(ForwardState::Completed);
        assert_eq!(exchange.state, ForwardState::Received);
        assert_eq!(forwarder.stats().completed, 0);
    }

    #[test]
    fn test_strip_hop_by_hop_honours_connection_list() {
        let mut headers = HeaderMap::new();
        headers.insert(CONNECTION, HeaderValue::from_static("keep-alive, x-trace-hop"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.insert("x-trace-hop", HeaderValue::from_static("1"));
        headers.insert("content-type", HeaderValue::from_static("text/plain"));

        strip_hop_by_hop(&mut headers);
        assert_eq!(headers.len(), 1);
        assert!(headers.contains_key("content-type"));
    }

    #[test]
    fn test_upstream_request_rewrites_headers() {
        let mut request = Request::builder()
            .method(Method::POST)
            .uri("http://proxy.local/api/items?page=2")
            .header("x-server-addr", "10.0.0.2")
            .header("x-server-port", "9000")
            .header("x-remote-addr", "alpha")
            .header("x-caller", "forged:agent")
            .header("connection", "close")
            .header("host", "proxy.local")
            .body(())
            .unwrap();
        request.headers_mut().insert("accept", HeaderValue::from_static("*/*"));

        let target = Target::new("10.0.0.2", 9000);
        let provenance = ProvenanceHeaders::new("alpha", "beta").unwrap();
        let upstream = upstream_request(request, &target, &provenance).unwrap();

        assert_eq!(upstream.uri(), "/api/items?page=2");
        let headers = upstream.headers();
        assert_eq!(headers.get(HOST).unwrap(), "10.0.0.2:9000");
        assert_eq!(headers.get("x-caller").unwrap(), "alpha:agent");
        assert_eq!(headers.get("x-callee").unwrap(), "beta:daemon");
        assert!(headers.get("x-server-addr").is_none());
        assert!(headers.get("x-server-port").is_none());
        assert!(headers.get(CONNECTION).is_none());
        assert_eq!(headers.get("x-remote-addr").unwrap(), "alpha");
        assert_eq!(headers.get("accept").unwrap(), "*/*");
    }
}
