//! End-to-end broker scenarios over scripted transports.

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use http::header::{HeaderValue, HOST, LOCATION};
use http::{Method, StatusCode, Uri};
use parking_lot::Mutex;
use tokio::sync::watch;

use bellhop::broker::{
    default_request_broker, BaseRequestBroker, BrokerOptions, CacheOptions, ConnectionBroker,
    ConnectionCache, MockConnectionBroker, ProxyConnectionBroker, ProxySelector,
    ProxyStreamBroker, RedirectRequestBroker, RequestBroker, StreamBroker,
};
use bellhop::conn::{ClientConnection, RequestHead, ResponseHead, ServerConnection};
use bellhop::stream::Stream;
use bellhop::Error;

fn init_tracing() {
    let _ = tracing_subscriber::fmt::try_init();
}

/// A gate the tests open to let scripted dials proceed.
#[derive(Clone)]
struct Gate {
    tx: Arc<watch::Sender<bool>>,
}

impl Gate {
    fn closed() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    fn open() -> Self {
        let gate = Self::closed();
        gate.raise();
        gate
    }

    fn raise(&self) {
        self.tx.send_replace(true);
    }

    async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|open| *open).await;
    }
}

#[derive(Clone, Copy)]
enum Dial {
    Succeed,
    Fail,
}

/// A stream broker whose dials block on a gate and follow a script,
/// serving each successful dial with an in-memory echo server.
struct ScriptedStreamBroker {
    gate: Gate,
    cancel: Gate,
    cancelled: AtomicBool,
    plan: Mutex<VecDeque<Dial>>,
    dials: AtomicUsize,
}

impl ScriptedStreamBroker {
    fn new(gate: Gate, plan: Vec<Dial>) -> Self {
        Self {
            gate,
            cancel: Gate::closed(),
            cancelled: AtomicBool::new(false),
            plan: Mutex::new(plan.into_iter().collect()),
            dials: AtomicUsize::new(0),
        }
    }

    fn dials(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }

    fn echo_stream() -> Stream {
        let (client_io, server_io) = tokio::io::duplex(16 * 1024);
        let server = ServerConnection::new(
            Stream::new(Box::new(server_io)),
            Arc::new(|head: &RequestHead, _body: &Bytes| {
                (
                    ResponseHead::new(StatusCode::OK),
                    Bytes::from(head.uri.path().to_owned()),
                )
            }),
        );
        tokio::spawn(async move {
            let _ = server.process_requests().await;
        });
        Stream::new(Box::new(client_io))
    }
}

#[async_trait]
impl StreamBroker for ScriptedStreamBroker {
    async fn get_stream(&self, _uri: &Uri) -> Result<Stream, Error> {
        if self.cancelled.load(Ordering::SeqCst) {
            return Err(Error::Aborted);
        }
        self.dials.fetch_add(1, Ordering::SeqCst);
        tokio::select! {
            _ = self.gate.wait() => {}
            _ = self.cancel.wait() => return Err(Error::Aborted),
        }
        let step = self.plan.lock().pop_front().unwrap_or(Dial::Succeed);
        match step {
            Dial::Succeed => Ok(Self::echo_stream()),
            Dial::Fail => Err(Error::from(io::Error::other("scripted dial failure"))),
        }
    }

    fn cancel_pending(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.cancel.raise();
    }
}

fn head_for(uri: &'static str) -> RequestHead {
    RequestHead::get(Uri::from_static(uri))
}

// Scenario: the pool grows to its bound before reusing, then picks the
// least-loaded ready connection with ties going to list order.
#[tokio::test]
async fn pool_grows_to_cap_then_reuses_least_loaded() {
    init_tracing();
    let broker = Arc::new(ScriptedStreamBroker::new(Gate::open(), Vec::new()));
    let cache = ConnectionCache::new(
        broker.clone(),
        CacheOptions {
            connections_per_host: 2,
        },
    );

    let uri = Uri::from_static("http://x.example/");
    let (first, via_proxy) = cache.get_connection(&uri, false).await.unwrap();
    assert!(!via_proxy);
    let (second, _) = cache.get_connection(&uri, false).await.unwrap();
    assert_eq!(broker.dials(), 2);
    assert!(!Arc::ptr_eq(&first, &second));

    // both idle: ties go to list order
    let (third, _) = cache.get_connection(&uri, false).await.unwrap();
    assert_eq!(broker.dials(), 2);
    assert!(Arc::ptr_eq(&third, &first));

    // a dispatched request loads the first connection, so selection
    // moves to the second
    let mut head = head_for("/busy");
    head.headers
        .insert(HOST, HeaderValue::from_static("x.example"));
    let request = first.clone().request(&head).await.unwrap();
    assert_eq!(first.outstanding_requests(), 1);

    let (fourth, _) = cache.get_connection(&uri, false).await.unwrap();
    assert!(Arc::ptr_eq(&fourth, &second));
    assert_eq!(broker.dials(), 2);

    request.finish().await.unwrap();
}

// Scenario: a second caller finds a pending slot and waits instead of
// dialing; one dial serves both.
#[tokio::test]
async fn waiters_share_a_single_dial() {
    init_tracing();
    let gate = Gate::closed();
    let broker = Arc::new(ScriptedStreamBroker::new(gate.clone(), Vec::new()));
    let cache = Arc::new(ConnectionCache::new(
        broker.clone(),
        CacheOptions {
            connections_per_host: 1,
        },
    ));

    let uri = Uri::from_static("http://x.example/");
    let first = {
        let cache = cache.clone();
        let uri = uri.clone();
        tokio::spawn(async move { cache.get_connection(&uri, false).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    let second = {
        let cache = cache.clone();
        let uri = uri.clone();
        tokio::spawn(async move { cache.get_connection(&uri, false).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(broker.dials(), 1, "the waiter must not dial");

    gate.raise();
    let (first_conn, _) = first.await.unwrap().unwrap();
    let (second_conn, _) = second.await.unwrap().unwrap();
    assert!(Arc::ptr_eq(&first_conn, &second_conn));
    assert_eq!(broker.dials(), 1);
}

// Scenario: the dialer fails, the waiter wakes to an erased entry and
// dials for itself.
#[tokio::test]
async fn failed_dial_hands_off_to_waiter() {
    init_tracing();
    let gate = Gate::closed();
    let broker = Arc::new(ScriptedStreamBroker::new(
        gate.clone(),
        vec![Dial::Fail, Dial::Succeed],
    ));
    let cache = Arc::new(ConnectionCache::new(
        broker.clone(),
        CacheOptions {
            connections_per_host: 1,
        },
    ));

    let uri = Uri::from_static("http://x.example/");
    let first = {
        let cache = cache.clone();
        let uri = uri.clone();
        tokio::spawn(async move { cache.get_connection(&uri, false).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    let second = {
        let cache = cache.clone();
        let uri = uri.clone();
        tokio::spawn(async move { cache.get_connection(&uri, false).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    gate.raise();
    assert!(matches!(first.await.unwrap(), Err(Error::Socket(_))));
    let (conn, _) = second.await.unwrap().unwrap();
    assert!(conn.new_requests_allowed());
    assert_eq!(broker.dials(), 2, "the waiter dials after the failure");
}

// Scenario: shutdown cancels the in-flight dial and every later call
// fails aborted.
#[tokio::test]
async fn close_connections_aborts_dialer_and_later_calls() {
    init_tracing();
    let broker = Arc::new(ScriptedStreamBroker::new(Gate::closed(), Vec::new()));
    let cache = Arc::new(ConnectionCache::new(
        broker.clone(),
        CacheOptions {
            connections_per_host: 1,
        },
    ));

    let uri = Uri::from_static("http://x.example/");
    let dialing = {
        let cache = cache.clone();
        let uri = uri.clone();
        tokio::spawn(async move { cache.get_connection(&uri, false).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    cache.close_connections();
    assert!(matches!(dialing.await.unwrap(), Err(Error::Aborted)));
    assert!(matches!(
        cache.get_connection(&uri, false).await,
        Err(Error::Aborted)
    ));
}

// Invariant: under N concurrent callers with a bound of K, at most K
// dials happen and every caller receives a connection.
#[tokio::test]
async fn concurrent_checkouts_bound_dial_fanout() {
    init_tracing();
    let gate = Gate::closed();
    let broker = Arc::new(ScriptedStreamBroker::new(gate.clone(), Vec::new()));
    let cache = Arc::new(ConnectionCache::new(
        broker.clone(),
        CacheOptions {
            connections_per_host: 2,
        },
    ));

    let uri = Uri::from_static("http://x.example/");
    let mut callers = Vec::new();
    for _ in 0..5 {
        let cache = cache.clone();
        let uri = uri.clone();
        callers.push(tokio::spawn(async move {
            cache.get_connection(&uri, false).await
        }));
    }
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(broker.dials(), 2, "fan-out stays at the per-host bound");

    gate.raise();
    for caller in callers {
        assert!(caller.await.unwrap().is_ok());
    }
    assert_eq!(broker.dials(), 2);
}

// force_new reserves capacity but never reuses.
#[tokio::test]
async fn force_new_bypasses_reuse() {
    init_tracing();
    let broker = Arc::new(ScriptedStreamBroker::new(Gate::open(), Vec::new()));
    let cache = ConnectionCache::new(
        broker.clone(),
        CacheOptions {
            connections_per_host: 1,
        },
    );

    let uri = Uri::from_static("http://x.example/");
    let (first, _) = cache.get_connection(&uri, false).await.unwrap();
    let (second, _) = cache.get_connection(&uri, true).await.unwrap();
    assert!(!Arc::ptr_eq(&first, &second));
    assert_eq!(broker.dials(), 2);
}

fn mock_broker_with_counter(
    routes: &'static [(&'static str, StatusCode, Option<&'static str>)],
) -> (Arc<MockConnectionBroker>, Arc<AtomicUsize>) {
    let served = Arc::new(AtomicUsize::new(0));
    let counter = served.clone();
    let broker = MockConnectionBroker::new(Arc::new(
        move |_uri: &Uri, head: &RequestHead, _body: &Bytes| {
            counter.fetch_add(1, Ordering::SeqCst);
            let path = head.uri.path();
            for (route, status, location) in routes {
                if *route == path {
                    let mut response = ResponseHead::new(*status);
                    if let Some(location) = location {
                        response
                            .headers
                            .insert(LOCATION, HeaderValue::from_static(location));
                    }
                    return (response, Bytes::from_static(b"done"));
                }
            }
            (ResponseHead::new(StatusCode::NOT_FOUND), Bytes::new())
        },
    ));
    (Arc::new(broker), served)
}

// Scenario: 301 then 200; exactly two requests, and the caller
// observes the permanent target.
#[tokio::test]
async fn redirects_follow_and_rewrite_permanently() {
    init_tracing();
    let (mock, served) = mock_broker_with_counter(&[
        ("/", StatusCode::MOVED_PERMANENTLY, Some("/v2")),
        ("/v2", StatusCode::OK, None),
    ]);
    let base: Arc<dyn RequestBroker> = Arc::new(BaseRequestBroker::new(mock));
    let redirect = RedirectRequestBroker::new(base);

    let mut head = head_for("http://x.example/");
    let mut request = redirect.request(&mut head, false).await.unwrap();
    assert_eq!(request.response().await.unwrap().status, StatusCode::OK);
    assert_eq!(served.load(Ordering::SeqCst), 2);
    assert_eq!(head.uri, Uri::from_static("http://x.example/v2"));
}

// Scenario: 302 loops A → B → A; the chain fails and the caller's uri
// is restored to A.
#[tokio::test]
async fn circular_redirects_fail() {
    init_tracing();
    let (mock, _served) = mock_broker_with_counter(&[
        ("/a", StatusCode::FOUND, Some("/b")),
        ("/b", StatusCode::FOUND, Some("/a")),
    ]);
    let base: Arc<dyn RequestBroker> = Arc::new(BaseRequestBroker::new(mock));
    let redirect = RedirectRequestBroker::new(base);

    let mut head = head_for("http://x.example/a");
    match redirect.request(&mut head, false).await {
        Err(Error::CircularRedirect(uri)) => {
            assert_eq!(uri, Uri::from_static("http://x.example/a"))
        }
        other => panic!("unexpected: {other:?}"),
    }
    assert_eq!(head.uri, Uri::from_static("http://x.example/a"));
}

// Redirection is suppressed when the request declares a body.
#[tokio::test]
async fn redirects_are_suppressed_for_request_bodies() {
    init_tracing();
    let (mock, served) =
        mock_broker_with_counter(&[("/", StatusCode::MOVED_PERMANENTLY, Some("/v2"))]);
    let base: Arc<dyn RequestBroker> = Arc::new(BaseRequestBroker::new(mock));
    let redirect = RedirectRequestBroker::new(base);

    let mut head = RequestHead::new(Method::POST, Uri::from_static("http://x.example/"));
    head.headers.insert(
        http::header::CONTENT_LENGTH,
        HeaderValue::from_static("4"),
    );

    let mut request = redirect.request(&mut head, false).await.unwrap();
    request.write_body(b"data").await.unwrap();
    assert_eq!(
        request.response().await.unwrap().status,
        StatusCode::MOVED_PERMANENTLY
    );
    assert_eq!(served.load(Ordering::SeqCst), 1, "no automatic re-dispatch");
    assert_eq!(head.uri, Uri::from_static("http://x.example/"));
}

// Round-trip: pipelined requests on one mock connection come back in
// order, each echoing its own framing.
#[tokio::test]
async fn pipelined_round_trip_through_mock_broker() {
    init_tracing();
    let mock: Arc<dyn ConnectionBroker> = Arc::new(MockConnectionBroker::new(Arc::new(
        |_uri: &Uri, head: &RequestHead, _body: &Bytes| {
            let id = head
                .headers
                .get("x-request-id")
                .and_then(|value| value.to_str().ok())
                .unwrap_or("?");
            (
                ResponseHead::new(StatusCode::OK),
                Bytes::from(format!("{} {} {id}", head.method, head.uri.path())),
            )
        },
    )));
    let base = BaseRequestBroker::new(mock);

    // same uri, so every dispatch pipelines onto the same connection
    let mut requests = Vec::new();
    for id in ["1", "2", "3"] {
        let mut head = head_for("http://x.example/echo");
        head.headers
            .insert("x-request-id", HeaderValue::from_static(id));
        requests.push((base.request(&mut head, false).await.unwrap(), id));
    }
    for (mut request, id) in requests {
        assert_eq!(request.response().await.unwrap().status, StatusCode::OK);
        assert_eq!(
            request.body().unwrap().as_ref(),
            format!("GET /echo {id}").as_bytes()
        );
    }
}

// The wire sees origin-form and a Host header; the caller's uri is
// untouched on return.
#[tokio::test]
async fn dispatch_uses_origin_form_and_restores_the_uri() {
    init_tracing();
    let seen: Arc<Mutex<Vec<(String, String)>>> = Arc::new(Mutex::new(Vec::new()));
    let record = seen.clone();
    let mock: Arc<dyn ConnectionBroker> = Arc::new(MockConnectionBroker::new(Arc::new(
        move |_uri: &Uri, head: &RequestHead, _body: &Bytes| {
            let host = head
                .headers
                .get(HOST)
                .and_then(|value| value.to_str().ok())
                .unwrap_or("")
                .to_owned();
            record.lock().push((head.uri.to_string(), host));
            (ResponseHead::new(StatusCode::OK), Bytes::new())
        },
    )));
    let base = BaseRequestBroker::new(mock);

    let mut head = head_for("http://x.example:8080/path?q=1");
    let request = base.request(&mut head, false).await.unwrap();
    request.finish().await.unwrap();

    assert_eq!(head.uri, Uri::from_static("http://x.example:8080/path?q=1"));
    let seen = seen.lock();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].0, "/path?q=1", "direct requests use origin-form");
    assert_eq!(seen[0].1, "x.example:8080");
}

/// Hands out one doomed connection, then delegates to the mock.
struct FlakyConnectionBroker {
    mock: Arc<MockConnectionBroker>,
    doomed: Mutex<Option<Arc<ClientConnection>>>,
    calls: AtomicUsize,
}

#[async_trait]
impl ConnectionBroker for FlakyConnectionBroker {
    async fn get_connection(
        &self,
        uri: &Uri,
        force_new: bool,
    ) -> Result<(Arc<ClientConnection>, bool), Error> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(doomed) = self.doomed.lock().take() {
            return Ok((doomed, false));
        }
        self.mock.get_connection(uri, force_new).await
    }

    fn close_connections(&self) {
        self.mock.close_connections();
    }
}

fn dead_connection() -> Arc<ClientConnection> {
    let (io, peer) = tokio::io::duplex(64);
    drop(peer);
    Arc::new(ClientConnection::new(Stream::new(Box::new(io))))
}

// Socket errors before dispatch are retried on a fresh connection.
#[tokio::test]
async fn socket_errors_retry_on_a_fresh_connection() {
    init_tracing();
    let (mock, served) = mock_broker_with_counter(&[("/", StatusCode::OK, None)]);
    let flaky = Arc::new(FlakyConnectionBroker {
        mock,
        doomed: Mutex::new(Some(dead_connection())),
        calls: AtomicUsize::new(0),
    });
    let base = BaseRequestBroker::new(flaky.clone());

    let mut head = head_for("http://x.example/");
    let request = base.request(&mut head, false).await.unwrap();
    request.finish().await.unwrap();

    assert_eq!(flaky.calls.load(Ordering::SeqCst), 2);
    assert_eq!(served.load(Ordering::SeqCst), 1);
    assert_eq!(head.uri, Uri::from_static("http://x.example/"));
}

// A connection poisoned by an earlier pipelined failure is retried the
// same way.
#[tokio::test]
async fn prior_request_failures_retry_on_a_fresh_connection() {
    init_tracing();

    // poison a connection: its first exchange dies with the peer
    let (io, peer) = tokio::io::duplex(1024);
    let poisoned = Arc::new(ClientConnection::new(Stream::new(Box::new(io))));
    let mut head = head_for("/doomed");
    head.headers
        .insert(HOST, HeaderValue::from_static("x.example"));
    let mut doomed = poisoned.clone().request(&head).await.unwrap();
    drop(peer);
    assert!(matches!(doomed.response().await, Err(Error::Socket(_))));
    assert!(matches!(
        poisoned.clone().request(&head).await,
        Err(Error::PriorRequestFailed)
    ));

    let (mock, served) = mock_broker_with_counter(&[("/", StatusCode::OK, None)]);
    let flaky = Arc::new(FlakyConnectionBroker {
        mock,
        doomed: Mutex::new(Some(poisoned)),
        calls: AtomicUsize::new(0),
    });
    let base = BaseRequestBroker::new(flaky.clone());

    let mut head = head_for("http://x.example/");
    let request = base.request(&mut head, false).await.unwrap();
    request.finish().await.unwrap();
    assert_eq!(flaky.calls.load(Ordering::SeqCst), 2);
    assert_eq!(served.load(Ordering::SeqCst), 1);
}

// A capped broker surfaces the retryable error once the cap is spent.
#[tokio::test]
async fn retry_limit_caps_the_loop() {
    init_tracing();
    let (mock, _served) = mock_broker_with_counter(&[("/", StatusCode::OK, None)]);
    let flaky = Arc::new(FlakyConnectionBroker {
        mock,
        doomed: Mutex::new(Some(dead_connection())),
        calls: AtomicUsize::new(0),
    });
    let base = BaseRequestBroker::new(flaky.clone()).with_retry_limit(Some(0));

    let mut head = head_for("http://x.example/");
    assert!(matches!(
        base.request(&mut head, false).await,
        Err(Error::Socket(_))
    ));
    assert_eq!(head.uri, Uri::from_static("http://x.example/"));
}

// Proxied plain-http requests reach the proxy's origin in
// absolute-form.
#[tokio::test]
async fn proxied_requests_use_absolute_form() {
    init_tracing();
    let seen: Arc<Mutex<Vec<(Uri, Uri)>>> = Arc::new(Mutex::new(Vec::new()));
    let record = seen.clone();
    let mock = Arc::new(MockConnectionBroker::new(Arc::new(
        move |uri: &Uri, head: &RequestHead, _body: &Bytes| {
            record.lock().push((uri.clone(), head.uri.clone()));
            (ResponseHead::new(StatusCode::OK), Bytes::new())
        },
    )));
    let selector: ProxySelector =
        Arc::new(|_uri| vec![Uri::from_static("http://proxy.local:3128")]);
    let proxied: Arc<dyn ConnectionBroker> =
        Arc::new(ProxyConnectionBroker::new(mock, selector));
    let base = BaseRequestBroker::new(proxied);

    let mut head = head_for("http://x.example/path");
    let request = base.request(&mut head, false).await.unwrap();
    request.finish().await.unwrap();

    let seen = seen.lock();
    assert_eq!(seen.len(), 1);
    assert_eq!(
        seen[0].0,
        Uri::from_static("http://proxy.local:3128"),
        "connection brokered for the proxy origin"
    );
    assert_eq!(
        seen[0].1,
        Uri::from_static("http://x.example/path"),
        "request line kept absolute-form through the proxy"
    );
    assert_eq!(head.uri, Uri::from_static("http://x.example/path"));
}

// CONNECT is brokered to the Host header's origin; the request line
// keeps the bare tunnel destination.
#[tokio::test]
async fn connect_is_brokered_by_host_header() {
    init_tracing();
    let seen: Arc<Mutex<Vec<(Uri, Uri)>>> = Arc::new(Mutex::new(Vec::new()));
    let record = seen.clone();
    let mock: Arc<dyn ConnectionBroker> = Arc::new(MockConnectionBroker::new(Arc::new(
        move |uri: &Uri, head: &RequestHead, _body: &Bytes| {
            record.lock().push((uri.clone(), head.uri.clone()));
            (ResponseHead::new(StatusCode::OK), Bytes::new())
        },
    )));
    let base = BaseRequestBroker::new(mock);

    let mut head = RequestHead::new(Method::CONNECT, Uri::from_static("target.example:443"));
    head.headers
        .insert(HOST, HeaderValue::from_static("proxy.local:3128"));

    let mut request = base.request(&mut head, true).await.unwrap();
    assert_eq!(request.response().await.unwrap().status, StatusCode::OK);
    assert_eq!(
        head.uri,
        Uri::from_static("target.example:443"),
        "CONNECT keeps the authority in the request line"
    );

    let seen = seen.lock();
    assert_eq!(seen.len(), 1);
    assert_eq!(
        seen[0].0,
        "http://proxy.local:3128".parse::<Uri>().unwrap(),
        "the connection goes to the Host header's origin"
    );
    assert_eq!(seen[0].1, Uri::from_static("target.example:443"));
}

/// A request broker that answers CONNECT over a scripted in-memory
/// proxy which echoes all tunneled bytes.
struct TunnelRequestBroker {
    connects: AtomicUsize,
}

#[async_trait]
impl RequestBroker for TunnelRequestBroker {
    async fn request(
        &self,
        head: &mut RequestHead,
        _force_new: bool,
    ) -> Result<bellhop::ClientRequest, Error> {
        assert_eq!(head.method, Method::CONNECT);
        self.connects.fetch_add(1, Ordering::SeqCst);

        let (client_io, server_io) = tokio::io::duplex(16 * 1024);
        tokio::spawn(async move {
            use tokio::io::{AsyncReadExt, AsyncWriteExt};
            let mut server_io = server_io;
            let mut buf = Vec::new();
            let mut byte = [0u8; 1];
            // consume the CONNECT head
            while !buf.ends_with(b"\r\n\r\n") {
                if server_io.read_exact(&mut byte).await.is_err() {
                    return;
                }
                buf.push(byte[0]);
            }
            if server_io
                .write_all(b"HTTP/1.1 200 OK\r\n\r\n")
                .await
                .is_err()
            {
                return;
            }
            // echo the tunnel
            let mut chunk = [0u8; 1024];
            loop {
                match server_io.read(&mut chunk).await {
                    Ok(0) | Err(_) => return,
                    Ok(n) => {
                        if server_io.write_all(&chunk[..n]).await.is_err() {
                            return;
                        }
                    }
                }
            }
        });

        let conn = Arc::new(ClientConnection::new(Stream::new(Box::new(client_io))));
        conn.request(head).await
    }
}

// CONNECT tunneling: the stream broker issues CONNECT upward, then
// hands back the raw tunnel.
#[tokio::test]
async fn proxy_stream_broker_tunnels_https_targets() {
    init_tracing();
    let tunnel_broker: Arc<dyn RequestBroker> = Arc::new(TunnelRequestBroker {
        connects: AtomicUsize::new(0),
    });
    let selector: ProxySelector =
        Arc::new(|_uri| vec![Uri::from_static("http://proxy.local:3128")]);

    // the direct parent must never be consulted for a proxied target
    let direct = Arc::new(ScriptedStreamBroker::new(Gate::open(), Vec::new()));
    let proxy = ProxyStreamBroker::new(direct.clone(), Arc::downgrade(&tunnel_broker), selector);

    let uri = Uri::from_static("https://target.example/");
    let tunnel = proxy.get_stream(&uri).await.unwrap();
    assert_eq!(direct.dials(), 0);

    tunnel.write_all(b"ping").await.unwrap();
    let mut buf = BytesMut::new();
    while buf.len() < 4 {
        assert!(tunnel.read_buf(&mut buf).await.unwrap() > 0);
    }
    assert_eq!(&buf[..], b"ping");
}

// The canonical factory builds, closes, and drops cleanly.
#[tokio::test]
async fn default_pipeline_constructs_and_shuts_down() {
    init_tracing();
    let brokers = default_request_broker(BrokerOptions::default()).with_redirects();
    let cache = brokers.connection_broker();
    let _outer = brokers.request_broker();

    brokers.close_connections();
    // the socket broker is latched: nothing dials after shutdown
    assert!(matches!(
        cache
            .get_connection(&Uri::from_static("http://x.example/"), false)
            .await,
        Err(Error::Aborted)
    ));
    drop(brokers);
}
