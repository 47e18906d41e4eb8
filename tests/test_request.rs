use http_ssh_gateway::http::headers::HeaderMap;
use http_ssh_gateway::http::request::{Method, Request, RequestBuilder};

fn request(version: &str, headers: &[(&str, &str)]) -> Request {
    Request {
        method: Method::GET,
        path: "/".to_string(),
        version: version.to_string(),
        headers: headers.iter().copied().collect::<HeaderMap>(),
        body: vec![],
    }
}

#[test]
fn test_request_header_retrieval_ignores_case() {
    let req = request("HTTP/1.1", &[("Host", "example.com"), ("Content-Type", "text/html")]);

    assert_eq!(req.header("host"), Some("example.com"));
    assert_eq!(req.header("CONTENT-TYPE"), Some("text/html"));
    assert_eq!(req.header("Missing"), None);
}

#[test]
fn test_request_keep_alive_defaults() {
    assert!(request("HTTP/1.1", &[]).keep_alive());
    assert!(!request("HTTP/1.0", &[]).keep_alive());
}

#[test]
fn test_request_keep_alive_explicit_header() {
    assert!(request("HTTP/1.0", &[("Connection", "Keep-Alive")]).keep_alive());
    assert!(!request("HTTP/1.1", &[("Connection", "close")]).keep_alive());
}

#[test]
fn test_request_host_and_expect() {
    let req = request("HTTP/1.1", &[("Host", "localhost:8888"), ("Expect", "100-continue")]);

    assert_eq!(req.host(), Some("localhost:8888"));
    assert!(req.expects_continue());
    assert_eq!(request("HTTP/1.1", &[("Host", "")]).host(), None);
}

#[test]
fn test_request_builder_defaults_version() {
    let req = RequestBuilder::new()
        .method(Method::PUT)
        .path("/server1/item")
        .header("X-Test", "1")
        .body(b"data".to_vec())
        .build()
        .unwrap();

    assert_eq!(req.version, "HTTP/1.1");
    assert_eq!(req.header("x-test"), Some("1"));
    assert_eq!(req.body, b"data".to_vec());
}

#[test]
fn test_request_builder_requires_method() {
    assert!(RequestBuilder::new().path("/").build().is_err());
}

#[test]
fn test_request_method_from_string() {
    assert_eq!(Method::from_str("GET"), Some(Method::GET));
    assert_eq!(Method::from_str("POST"), Some(Method::POST));
    assert_eq!(Method::from_str("get"), None); // Case-sensitive
    assert_eq!(Method::from_str(""), None);
}
