//! Tests for request forwarding to a backend

use http_ssh_gateway::config::TransportSettings;
use http_ssh_gateway::http::request::{Method, RequestBuilder};
use http_ssh_gateway::proxy::transport::{DirectDialer, Transport};
use http_ssh_gateway::proxy::upstream::{ReverseProxy, parse_response_head};
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;

fn transport(settings: TransportSettings) -> Transport {
    Transport::new(
        Box::new(DirectDialer::new(settings.handshake_timeout())),
        settings,
    )
}

/// Read one request head (and a Content-Length body) from a client
async fn read_request(socket: &mut TcpStream) -> String {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        let n = socket.read(&mut chunk).await.unwrap();
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
        let raw = String::from_utf8_lossy(&buf).to_string();
        if let Some(end) = raw.find("\r\n\r\n") {
            let length = raw[..end]
                .lines()
                .find_map(|l| l.strip_prefix("Content-Length: "))
                .and_then(|v| v.parse::<usize>().ok())
                .unwrap_or(0);
            if buf.len() >= end + 4 + length {
                return raw;
            }
        }
    }
    String::from_utf8_lossy(&buf).to_string()
}

/// Backend that answers one request with `response` and reports what it got
async fn one_shot_backend(response: &'static [u8]) -> (String, oneshot::Receiver<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let (tx, rx) = oneshot::channel();

    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let request = read_request(&mut socket).await;
        socket.write_all(response).await.unwrap();
        socket.shutdown().await.ok();
        let _ = tx.send(request);
    });

    (addr, rx)
}

#[test]
fn test_build_request_head_rewrites_host_and_path() {
    let t = transport(TransportSettings::default());
    let proxy = ReverseProxy::new("localhost:3000", &t);

    let request = RequestBuilder::new()
        .method(Method::GET)
        .path("/server1/api/users?page=2")
        .header("Host", "localhost:8888")
        .header("User-Agent", "Test")
        .build()
        .unwrap();

    let bytes = proxy.build_request_head(&request, "api/users", None);
    let raw = String::from_utf8_lossy(&bytes);

    assert!(raw.starts_with("GET /api/users?page=2 HTTP/1.1\r\n"));
    assert!(raw.contains("Host: localhost:3000\r\n"));
    assert!(!raw.contains("localhost:8888"));
    assert!(raw.contains("User-Agent: Test\r\n"));
    assert!(raw.contains("Connection: close\r\n"));
}

#[test]
fn test_build_request_head_empty_residual_is_root() {
    let t = transport(TransportSettings::default());
    let proxy = ReverseProxy::new("localhost:3000", &t);

    let request = RequestBuilder::new()
        .method(Method::GET)
        .path("/server1")
        .build()
        .unwrap();

    let raw = String::from_utf8(proxy.build_request_head(&request, "", None)).unwrap();
    assert!(raw.starts_with("GET / HTTP/1.1\r\n"));
}

#[test]
fn test_build_request_head_removes_hop_by_hop_headers() {
    let t = transport(TransportSettings::default());
    let proxy = ReverseProxy::new("localhost:3000", &t);

    let request = RequestBuilder::new()
        .method(Method::POST)
        .path("/x")
        .header("Connection", "keep-alive")
        .header("Upgrade", "websocket")
        .header("Transfer-Encoding", "chunked")
        .header("Content-Type", "application/json")
        .body(b"{}".to_vec())
        .build()
        .unwrap();

    let raw = String::from_utf8(proxy.build_request_head(&request, "x", None)).unwrap();

    assert!(raw.contains("Connection: close\r\n"));
    assert!(!raw.contains("keep-alive"));
    assert!(!raw.contains("Upgrade"));
    assert!(!raw.contains("Transfer-Encoding"));
    assert!(raw.contains("Content-Length: 2\r\n"));
    assert!(raw.ends_with("\r\n\r\n"));
    assert!(!raw.contains("{}"));
}

#[test]
fn test_build_request_head_appends_forwarded_for() {
    let t = transport(TransportSettings::default());
    let proxy = ReverseProxy::new("localhost:3000", &t);
    let client = Some(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 7)));

    let fresh = RequestBuilder::new().method(Method::GET).path("/").build().unwrap();
    let raw = String::from_utf8(proxy.build_request_head(&fresh, "", client)).unwrap();
    assert!(raw.contains("X-Forwarded-For: 10.0.0.7\r\n"));

    let chained = RequestBuilder::new()
        .method(Method::GET)
        .path("/")
        .header("X-Forwarded-For", "192.168.1.1")
        .build()
        .unwrap();
    let raw = String::from_utf8(proxy.build_request_head(&chained, "", client)).unwrap();
    assert!(raw.contains("X-Forwarded-For: 192.168.1.1, 10.0.0.7\r\n"));
}

#[test]
fn test_parse_response_head() {
    let (status, headers) =
        parse_response_head(b"HTTP/1.1 302 Found\r\nLocation: /endpoint\r\n\r\n").unwrap();
    assert_eq!(status.as_u16(), 302);
    assert_eq!(headers.get("location"), Some("/endpoint"));

    assert!(parse_response_head(b"garbage\r\n\r\n").is_err());
    assert!(parse_response_head(b"HTTP/1.1 abc Nope\r\n\r\n").is_err());
}

#[tokio::test]
async fn test_forward_content_length_response() {
    let (addr, seen) = one_shot_backend(
        b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: 5\r\n\r\nhello",
    )
    .await;
    let t = transport(TransportSettings::default());

    let request = RequestBuilder::new()
        .method(Method::GET)
        .path("/server1/endpoint")
        .build()
        .unwrap();
    let captured = ReverseProxy::new(addr.clone(), &t)
        .forward(&request, "endpoint", None)
        .await
        .unwrap();

    assert_eq!(captured.status.as_u16(), 200);
    assert_eq!(captured.body, b"hello".to_vec());

    let raw = seen.await.unwrap();
    assert!(raw.starts_with("GET /endpoint HTTP/1.1\r\n"));
    assert!(raw.contains(&format!("Host: {}\r\n", addr)));
}

#[tokio::test]
async fn test_forward_chunked_response() {
    let (addr, _) = one_shot_backend(
        b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n",
    )
    .await;
    let t = transport(TransportSettings::default());

    let request = RequestBuilder::new().method(Method::GET).path("/").build().unwrap();
    let captured = ReverseProxy::new(addr, &t)
        .forward(&request, "", None)
        .await
        .unwrap();

    assert_eq!(captured.body, b"hello world".to_vec());
}

#[tokio::test]
async fn test_forward_close_delimited_response() {
    let (addr, _) = one_shot_backend(b"HTTP/1.0 200 OK\r\n\r\nuntil the end").await;
    let t = transport(TransportSettings::default());

    let request = RequestBuilder::new().method(Method::GET).path("/").build().unwrap();
    let captured = ReverseProxy::new(addr, &t)
        .forward(&request, "", None)
        .await
        .unwrap();

    assert_eq!(captured.body, b"until the end".to_vec());
}

#[tokio::test]
async fn test_forward_head_request_has_no_body() {
    let (addr, _) =
        one_shot_backend(b"HTTP/1.1 200 OK\r\nContent-Length: 1234\r\n\r\n").await;
    let t = transport(TransportSettings::default());

    let request = RequestBuilder::new().method(Method::HEAD).path("/").build().unwrap();
    let captured = ReverseProxy::new(addr, &t)
        .forward(&request, "", None)
        .await
        .unwrap();

    assert!(captured.body.is_empty());
    assert_eq!(captured.headers.get("Content-Length"), Some("1234"));
}

#[tokio::test]
async fn test_forward_skips_interim_responses() {
    let (addr, _) = one_shot_backend(
        b"HTTP/1.1 103 Early Hints\r\nLink: </a.css>\r\n\r\nHTTP/1.1 204 No Content\r\n\r\n",
    )
    .await;
    let t = transport(TransportSettings::default());

    let request = RequestBuilder::new().method(Method::GET).path("/").build().unwrap();
    let captured = ReverseProxy::new(addr, &t)
        .forward(&request, "", None)
        .await
        .unwrap();

    assert_eq!(captured.status.as_u16(), 204);
}

#[tokio::test]
async fn test_forward_truncated_body_is_an_error() {
    let (addr, _) =
        one_shot_backend(b"HTTP/1.1 200 OK\r\nContent-Length: 100\r\n\r\nshort").await;
    let t = transport(TransportSettings::default());

    let request = RequestBuilder::new().method(Method::GET).path("/").build().unwrap();
    let result = ReverseProxy::new(addr, &t).forward(&request, "", None).await;

    let err = result.unwrap_err();
    assert_eq!(err.status_code(), 500);
    assert!(err.to_string().contains("Connection closed"));
}

#[tokio::test]
async fn test_forward_connection_refused() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    drop(listener);

    let t = transport(TransportSettings::default());
    let request = RequestBuilder::new().method(Method::GET).path("/").build().unwrap();
    let result = ReverseProxy::new(addr, &t).forward(&request, "", None).await;

    assert_eq!(result.unwrap_err().status_code(), 500);
}

#[tokio::test]
async fn test_forward_idle_backend_times_out() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let _ = read_request(&mut socket).await;
        tokio::time::sleep(Duration::from_secs(5)).await;
    });

    let settings = TransportSettings {
        idle_timeout_secs: 1,
        ..TransportSettings::default()
    };
    let t = transport(settings);
    let request = RequestBuilder::new().method(Method::GET).path("/").build().unwrap();
    let result = ReverseProxy::new(addr, &t).forward(&request, "", None).await;

    assert!(result.unwrap_err().to_string().contains("idle timeout"));
}

#[tokio::test]
async fn test_forward_expect_continue_sends_body_after_100() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let (tx, rx) = oneshot::channel();

    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut head = Vec::new();
        let mut byte = [0u8; 1];
        while !head.ends_with(b"\r\n\r\n") {
            socket.read_exact(&mut byte).await.unwrap();
            head.push(byte[0]);
        }
        socket.write_all(b"HTTP/1.1 100 Continue\r\n\r\n").await.unwrap();

        let mut body = [0u8; 4];
        socket.read_exact(&mut body).await.unwrap();
        socket
            .write_all(b"HTTP/1.1 201 Created\r\nContent-Length: 2\r\n\r\nok")
            .await
            .unwrap();
        let _ = tx.send((String::from_utf8(head).unwrap(), body.to_vec()));
    });

    let t = transport(TransportSettings::default());
    let request = RequestBuilder::new()
        .method(Method::POST)
        .path("/upload")
        .header("Expect", "100-continue")
        .body(b"data".to_vec())
        .build()
        .unwrap();

    let captured = ReverseProxy::new(addr, &t)
        .forward(&request, "upload", None)
        .await
        .unwrap();

    assert_eq!(captured.status.as_u16(), 201);
    assert_eq!(captured.body, b"ok".to_vec());

    let (head, body) = rx.await.unwrap();
    assert!(head.contains("Expect: 100-continue\r\n"));
    assert_eq!(body, b"data".to_vec());
}

#[tokio::test]
async fn test_forward_expect_continue_final_answer_skips_body() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();

    // Answer as soon as the head arrives, without waiting for the body
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut head = Vec::new();
        let mut byte = [0u8; 1];
        while !head.ends_with(b"\r\n\r\n") {
            socket.read_exact(&mut byte).await.unwrap();
            head.push(byte[0]);
        }
        socket
            .write_all(b"HTTP/1.1 413 Payload Too Large\r\nContent-Length: 0\r\n\r\n")
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;
    });

    let settings = TransportSettings {
        expect_continue_timeout_ms: 5000,
        ..TransportSettings::default()
    };
    let t = transport(settings);
    let request = RequestBuilder::new()
        .method(Method::POST)
        .path("/upload")
        .header("Expect", "100-continue")
        .header("Content-Length", "4")
        .body(b"data".to_vec())
        .build()
        .unwrap();

    let captured = ReverseProxy::new(addr, &t)
        .forward(&request, "upload", None)
        .await
        .unwrap();

    assert_eq!(captured.status.as_u16(), 413);
}
