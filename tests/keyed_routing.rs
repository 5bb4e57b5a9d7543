//! End-to-end routing through a running gateway.
//!
//! One gateway and one backend are shared by every test. The backend answers
//! `GET /hello` with the body "canary". Four services sit in front of it:
//!
//! - `simple`: the only pool member has a host name that does not resolve, the `canary`
//!   key is pinned to the backend.
//! - `pending`: the pool holds the backend, the `canary` pin is never
//!   published.
//! - `late`: like `pending`, but one test publishes the pin after startup.
//! - `named`: pool member and pin both address the backend as `localhost`.

use std::collections::HashMap;
use std::convert::Infallible;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::time::{Duration, Instant};

use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use once_cell::sync::Lazy;
use rstest::rstest;

use keyed_gateway::balancer::{PinnedServer, Server};
use keyed_gateway::config::{GatewayConfig, RouteConfig, ServerEntry, ServiceConfig};
use keyed_gateway::{build_server, Gateway};

struct Harness {
    gateway: SocketAddr,
    backend: SocketAddr,
    late_pin: PinnedServer,
}

static HARNESS: Lazy<Harness> = Lazy::new(start_harness);

async fn canary(req: Request<Incoming>) -> Result<Response<Full<Bytes>>, Infallible> {
    let mut response = Response::new(Full::new(Bytes::from_static(b"canary")));
    if req.uri().path() != "/hello" {
        *response.status_mut() = StatusCode::NOT_FOUND;
    }
    Ok(response)
}

fn start_backend() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    listener.set_nonblocking(true).unwrap();

    std::thread::spawn(move || {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(async move {
            let listener = tokio::net::TcpListener::from_std(listener).unwrap();
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    continue;
                };
                tokio::spawn(async move {
                    let _ = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service_fn(canary))
                        .await;
                });
            }
        });
    });
    addr
}

fn free_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

fn wait_for(addr: SocketAddr) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if TcpStream::connect(addr).is_ok() {
            return;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    panic!("gateway did not start on {addr}");
}

fn start_harness() -> Harness {
    let backend = start_backend();
    let gateway: SocketAddr = format!("127.0.0.1:{}", free_port()).parse().unwrap();

    let backend_address = backend.to_string();
    let named = format!("localhost:{}", backend.port());
    let service = |servers: Vec<String>, pin: Option<String>| ServiceConfig {
        servers: servers.into_iter().map(ServerEntry::Address).collect(),
        pinned: HashMap::from([("canary".to_string(), pin)]),
        ..ServiceConfig::default()
    };
    let route = |name: &str| RouteConfig {
        id: name.to_string(),
        path: format!("/{name}/**"),
        service: name.to_string(),
        strip_prefix: true,
    };

    let config = GatewayConfig {
        listen: gateway.to_string(),
        routes: vec![
            route("simple"),
            route("pending"),
            route("late"),
            route("named"),
        ],
        services: HashMap::from([
            (
                "simple".to_string(),
                service(
                    vec![format!("normal-routing-notexist-localhost:{}", backend.port())],
                    Some(backend_address.clone()),
                ),
            ),
            ("pending".to_string(), service(vec![backend_address.clone()], None)),
            ("late".to_string(), service(vec![backend_address], None)),
            (
                "named".to_string(),
                service(vec![named.clone()], Some(named)),
            ),
        ]),
        ..GatewayConfig::default()
    };
    let gw = Gateway::from_config(&config).unwrap();
    let late_pin = gw.pin("late", "canary").unwrap();
    let (proxy, _pins) = gw.into_parts();

    let listen = config.listen.clone();
    std::thread::spawn(move || build_server(proxy, &listen).unwrap().run_forever());
    wait_for(gateway);

    Harness {
        gateway,
        backend,
        late_pin,
    }
}

struct Reply {
    status: u16,
    body: String,
}

fn decode_chunked(mut raw: &str) -> String {
    let mut body = String::new();
    loop {
        let Some((size, rest)) = raw.split_once("\r\n") else {
            return body;
        };
        let size = usize::from_str_radix(size.trim(), 16).unwrap_or(0);
        if size == 0 || rest.len() < size {
            return body;
        }
        body.push_str(&rest[..size]);
        raw = rest[size..].trim_start_matches("\r\n");
    }
}

fn get(path: &str, headers: &[(&str, &str)]) -> Reply {
    let addr = HARNESS.gateway;
    let mut stream = TcpStream::connect(addr).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();

    let mut request = format!("GET {path} HTTP/1.1\r\nHost: {addr}\r\nConnection: close\r\n");
    for (name, value) in headers {
        request.push_str(&format!("{name}: {value}\r\n"));
    }
    request.push_str("\r\n");
    stream.write_all(request.as_bytes()).unwrap();

    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).unwrap();
    let raw = String::from_utf8_lossy(&raw).into_owned();

    let (head, body) = raw.split_once("\r\n\r\n").unwrap_or((raw.as_str(), ""));
    let status = head
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse().ok())
        .unwrap_or(0);
    let chunked = head
        .to_ascii_lowercase()
        .contains("transfer-encoding: chunked");
    let body = if chunked {
        decode_chunked(body)
    } else {
        body.to_string()
    };

    Reply { status, body }
}

#[rstest]
#[case("true")]
#[case("TRUE")]
#[case("True")]
fn test_canary_header_routes_to_pinned_server(#[case] value: &str) {
    let reply = get("/simple/hello", &[("X-Canary-Test", value)]);
    assert_eq!(reply.status, 200);
    assert_eq!(reply.body, "canary");
}

#[test]
fn test_header_name_is_case_insensitive() {
    let reply = get("/simple/hello", &[("x-canary-test", "true")]);
    assert_eq!(reply.status, 200);
    assert_eq!(reply.body, "canary");
}

#[test]
fn test_without_header_uses_unroutable_pool() {
    let reply = get("/simple/hello", &[]);
    assert_eq!(reply.status, 500);
}

#[rstest]
#[case("false")]
#[case("yes")]
#[case("")]
fn test_other_header_values_use_pool(#[case] value: &str) {
    let reply = get("/simple/hello", &[("X-Canary-Test", value)]);
    assert_eq!(reply.status, 500);
}

#[test]
fn test_unpublished_pin_fails_instead_of_falling_back() {
    let reply = get("/pending/hello", &[("X-Canary-Test", "true")]);
    assert_eq!(reply.status, 503);

    // The pool itself is healthy.
    let reply = get("/pending/hello", &[]);
    assert_eq!(reply.status, 200);
    assert_eq!(reply.body, "canary");
}

#[test]
fn test_pin_by_host_name_is_resolved() {
    let reply = get("/named/hello", &[("X-Canary-Test", "true")]);
    assert_eq!(reply.status, 200);
    assert_eq!(reply.body, "canary");
}

#[test]
fn test_pool_member_by_host_name_is_resolved() {
    let reply = get("/named/hello", &[]);
    assert_eq!(reply.status, 200);
    assert_eq!(reply.body, "canary");
}

#[test]
fn test_unknown_route_returns_404() {
    let reply = get("/nowhere", &[("X-Canary-Test", "true")]);
    assert_eq!(reply.status, 404);
}

#[test]
fn test_pin_published_after_startup() {
    let harness = &*HARNESS;
    assert!(!harness.late_pin.is_published());
    assert_eq!(get("/late/hello", &[("X-Canary-Test", "true")]).status, 503);

    let backend = Server::new(harness.backend.ip().to_string(), harness.backend.port());
    harness.late_pin.publish("canary", backend).unwrap();

    let reply = get("/late/hello", &[("X-Canary-Test", "true")]);
    assert_eq!(reply.status, 200);
    assert_eq!(reply.body, "canary");
}

#[test]
fn test_concurrent_requests_keep_their_own_routing_key() {
    let handles: Vec<_> = (0..32)
        .map(|i| {
            std::thread::spawn(move || {
                let flagged = i % 2 == 0;
                let path = if i % 4 < 2 { "/simple/hello" } else { "/pending/hello" };
                let headers: &[(&str, &str)] = if flagged {
                    &[("X-Canary-Test", "true")]
                } else {
                    &[]
                };
                (path, flagged, get(path, headers))
            })
        })
        .collect();

    for handle in handles {
        let (path, flagged, reply) = handle.join().unwrap();
        let expected = match (path, flagged) {
            ("/simple/hello", true) => 200,
            ("/simple/hello", false) => 500,
            (_, true) => 503,
            (_, false) => 200,
        };
        assert_eq!(reply.status, expected, "{path} flagged={flagged}");
        if expected == 200 {
            assert_eq!(reply.body, "canary");
        }
    }
}
