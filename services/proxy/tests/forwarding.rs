//! End-to-end forwarding through a running proxy to a recording upstream

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::{Body, Frame, Incoming};
use hyper::header::HeaderMap;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use peer_proxy::{AddressTable, AppContext, ProxyServer, RequestForwarder, Target};
use relay_channels::{ChannelConfig, ChannelRegistry, InMemoryBroker};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

#[derive(Debug, Clone)]
struct Seen {
    uri: String,
    method: String,
    headers: HeaderMap,
    body: Bytes,
}

struct Upstream {
    addr: SocketAddr,
    accepted: Arc<AtomicUsize>,
    seen: Arc<Mutex<Vec<Seen>>>,
}

impl Upstream {
    /// Echo server recording every request it sees
    async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepted = Arc::new(AtomicUsize::new(0));
        let seen = Arc::new(Mutex::new(Vec::new()));

        let (accepted_clone, seen_clone) = (Arc::clone(&accepted), Arc::clone(&seen));
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else { return };
                accepted_clone.fetch_add(1, Ordering::SeqCst);
                let seen = Arc::clone(&seen_clone);
                tokio::spawn(async move {
                    let service = service_fn(move |request: Request<Incoming>| {
                        let seen = Arc::clone(&seen);
                        async move {
                            let (parts, body) = request.into_parts();
                            let body = body.collect().await?.to_bytes();
                            seen.lock().unwrap().push(Seen {
                                uri: parts.uri.to_string(),
                                method: parts.method.to_string(),
                                headers: parts.headers,
                                body: body.clone(),
                            });
                            let mut response = Response::new(Full::new(body));
                            response
                                .headers_mut()
                                .insert("x-upstream", "echo".parse().unwrap());
                            Ok::<_, hyper::Error>(response)
                        }
                    });
                    let _ = hyper::server::conn::http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });

        Self {
            addr,
            accepted,
            seen,
        }
    }

    fn target(&self) -> Target {
        Target::new("127.0.0.1", self.addr.port())
    }

    fn requests(&self) -> Vec<Seen> {
        self.seen.lock().unwrap().clone()
    }
}

struct Proxy {
    addr: SocketAddr,
    context: Arc<AppContext>,
    _stop: oneshot::Sender<()>,
}

async fn start_proxy(table: AddressTable) -> Proxy {
    let channels = ChannelRegistry::new(Arc::new(InMemoryBroker::new()), ChannelConfig::default()).unwrap();
    let context = Arc::new(AppContext::new(
        table,
        channels,
        RequestForwarder::new(Duration::from_secs(1)),
    ));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (stop, stopped) = oneshot::channel::<()>();
    let server = ProxyServer::new(Arc::clone(&context), 0);
    tokio::spawn(async move {
        server
            .run_until(listener, async {
                let _ = stopped.await;
            })
            .await
            .unwrap();
    });

    Proxy {
        addr,
        context,
        _stop: stop,
    }
}

fn peers() -> AddressTable {
    AddressTable::new([
        ("alpha", Target::new("10.0.0.1", 9000)),
        // Decoy: a table entry must never redirect a request
        ("decoy", Target::new("127.0.0.1", 1)),
    ])
    .unwrap()
}

async fn send(
    proxy: SocketAddr,
    request: Request<Full<Bytes>>,
) -> (Response<Incoming>, JoinHandle<()>) {
    let stream = TcpStream::connect(proxy).await.unwrap();
    let (mut sender, connection) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .unwrap();
    let driver = tokio::spawn(async move {
        let _ = connection.await;
    });
    let response = sender.send_request(request).await.unwrap();
    (response, driver)
}

fn routed(addr: &str, port: &str) -> hyper::http::request::Builder {
    Request::builder()
        .uri("/api/items?page=2")
        .header("host", "proxy.local")
        .header("x-server-addr", addr)
        .header("x-server-port", port)
        .header("x-remote-addr", "alpha")
}

async fn body_text(response: Response<Incoming>) -> String {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    String::from_utf8(bytes.to_vec()).unwrap()
}

#[tokio::test]
async fn test_forwards_to_header_target_with_provenance() {
    let upstream = Upstream::start().await;
    let proxy = start_proxy(peers()).await;

    let request = routed("127.0.0.1", &upstream.addr.port().to_string())
        .method("POST")
        .header("x-caller", "forged:agent")
        .body(Full::new(Bytes::from("hello upstream")))
        .unwrap();
    let (response, _driver) = send(proxy.addr, request).await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers().get("x-upstream").unwrap(), "echo");
    assert_eq!(body_text(response).await, "hello upstream");

    let seen = upstream.requests();
    assert_eq!(seen.len(), 1);
    let request = &seen[0];
    assert_eq!(request.method, "POST");
    assert_eq!(request.uri, "/api/items?page=2");
    assert_eq!(request.body, Bytes::from("hello upstream"));
    assert_eq!(
        request.headers.get("host").unwrap().to_str().unwrap(),
        upstream.target().to_string()
    );
    assert_eq!(request.headers.get("x-caller").unwrap(), "alpha:agent");
    assert_eq!(
        request.headers.get("x-callee").unwrap().to_str().unwrap(),
        format!("{}:daemon", upstream.target())
    );
    assert!(request.headers.get("x-server-addr").is_none());
    assert!(request.headers.get("x-server-port").is_none());

    assert_eq!(proxy.context.forwarder.stats().dial_attempts, 1);
    // The server side may release the body just after the client has read it
    let completed = tokio::time::timeout(Duration::from_secs(5), async {
        while proxy.context.forwarder.stats().completed < 1 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(completed.is_ok());
}

#[tokio::test]
async fn test_known_callee_is_named_by_table() {
    let upstream = Upstream::start().await;
    let table = AddressTable::new([
        ("alpha", Target::new("10.0.0.1", 9000)),
        ("store", upstream.target()),
    ])
    .unwrap();
    let proxy = start_proxy(table).await;

    let request = routed("127.0.0.1", &upstream.addr.port().to_string())
        .body(Full::new(Bytes::new()))
        .unwrap();
    let (response, _driver) = send(proxy.addr, request).await;
    assert_eq!(response.status(), StatusCode::OK);
    body_text(response).await;

    let seen = upstream.requests();
    assert_eq!(seen[0].headers.get("x-callee").unwrap(), "store:daemon");
    assert_eq!(seen[0].headers.get("x-caller").unwrap(), "alpha:agent");
}

#[tokio::test]
async fn test_bad_headers_fail_closed_without_dialing() {
    let upstream = Upstream::start().await;
    let proxy = start_proxy(peers()).await;
    let port = upstream.addr.port().to_string();

    let cases = vec![
        // Missing X-Server-Addr
        Request::builder()
            .uri("/")
            .header("x-server-port", port.as_str())
            .header("x-remote-addr", "alpha")
            .body(Full::new(Bytes::new()))
            .unwrap(),
        // Non-numeric port
        routed("127.0.0.1", "http").body(Full::new(Bytes::new())).unwrap(),
        // Unknown caller
        Request::builder()
            .uri("/")
            .header("x-server-addr", "127.0.0.1")
            .header("x-server-port", port.as_str())
            .header("x-remote-addr", "mallory")
            .body(Full::new(Bytes::new()))
            .unwrap(),
    ];

    for request in cases {
        let (response, _driver) = send(proxy.addr, request).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            response.headers().get("content-type").unwrap(),
            "text/plain; charset=utf-8"
        );
        body_text(response).await;
    }

    assert_eq!(upstream.accepted.load(Ordering::SeqCst), 0);
    let stats = proxy.context.forwarder.stats();
    assert_eq!(stats.dial_attempts, 0);
    assert_eq!(stats.rejected, 3);
}

#[tokio::test]
async fn test_out_of_range_port_names_port() {
    let upstream = Upstream::start().await;
    let proxy = start_proxy(peers()).await;

    let request = routed("127.0.0.1", "70000").body(Full::new(Bytes::new())).unwrap();
    let (response, _driver) = send(proxy.addr, request).await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(body_text(response).await.contains("port"));
    assert_eq!(upstream.accepted.load(Ordering::SeqCst), 0);
    assert_eq!(proxy.context.forwarder.stats().dial_attempts, 0);
}

#[tokio::test]
async fn test_unreachable_target_is_400_naming_target() {
    let closed_port = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };
    let proxy = start_proxy(peers()).await;

    let request = routed("127.0.0.1", &closed_port.to_string())
        .body(Full::new(Bytes::new()))
        .unwrap();
    let (response, _driver) = send(proxy.addr, request).await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let text = body_text(response).await;
    assert!(text.contains(&format!("127.0.0.1:{}", closed_port)));
    assert_eq!(proxy.context.forwarder.stats().upstream_failed, 1);

    // The proxy keeps serving after an upstream failure
    let upstream = Upstream::start().await;
    let request = routed("127.0.0.1", &upstream.addr.port().to_string())
        .body(Full::new(Bytes::from("still up")))
        .unwrap();
    let (response, _driver) = send(proxy.addr, request).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_text(response).await, "still up");
}

/// Response body fed chunk by chunk from a channel
struct ChannelBody(mpsc::Receiver<Bytes>);

impl Body for ChannelBody {
    type Data = Bytes;
    type Error = Infallible;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, Infallible>>> {
        self.0
            .poll_recv(cx)
            .map(|chunk| chunk.map(|bytes| Ok(Frame::data(bytes))))
    }
}

/// Upstream whose response bodies are driven by the test
async fn start_streaming_upstream() -> (SocketAddr, mpsc::UnboundedReceiver<mpsc::Sender<Bytes>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (feeds_tx, feeds) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else { return };
            let feeds_tx = feeds_tx.clone();
            tokio::spawn(async move {
                let service = service_fn(move |_request: Request<Incoming>| {
                    let (tx, rx) = mpsc::channel(4);
                    let _ = feeds_tx.send(tx);
                    async move { Ok::<_, Infallible>(Response::new(ChannelBody(rx))) }
                });
                let _ = hyper::server::conn::http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });

    (addr, feeds)
}

#[tokio::test]
async fn test_response_streams_and_disconnect_releases_upstream() {
    let (upstream, mut feeds) = start_streaming_upstream().await;
    let proxy = start_proxy(peers()).await;

    let request = routed("127.0.0.1", &upstream.port().to_string())
        .body(Full::new(Bytes::new()))
        .unwrap();
    let (response, driver) = send(proxy.addr, request).await;
    assert_eq!(response.status(), StatusCode::OK);

    let feed = tokio::time::timeout(Duration::from_secs(5), feeds.recv())
        .await
        .unwrap()
        .unwrap();

    // First chunk arrives before the upstream has finished the body
    let mut body = response.into_body();
    feed.send(Bytes::from("event: 1\n")).await.unwrap();
    let frame = tokio::time::timeout(Duration::from_secs(5), body.frame())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(frame.into_data().unwrap(), Bytes::from("event: 1\n"));

    // Client goes away mid-stream
    drop(body);
    driver.abort();

    let released = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match feed.try_send(Bytes::from("event: more\n")) {
                Err(mpsc::error::TrySendError::Closed(_)) => break,
                _ => tokio::time::sleep(Duration::from_millis(20)).await,
            }
        }
    })
    .await;
    assert!(released.is_ok(), "upstream response was never released");
}
