//! Request parsing, header handling and response serialization

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use switchyard::http::Handler;
use switchyard::http::parser::{MAX_BODY_SIZE, MAX_HEAD_SIZE, ParseError, parse_http_request};
use switchyard::http::request::{Method, Request, RequestBuilder};
use switchyard::http::response::{Response, ResponseBuilder, StatusCode};
use switchyard::http::writer::serialize_response;

mod common;

/// Answers with the request body it was handed.
struct EchoBody;

#[async_trait]
impl Handler for EchoBody {
    async fn handle(&self, request: Request) -> Response {
        Response::ok(request.body)
    }
}

#[test]
fn test_parse_post_with_body() {
    let req = b"POST /api HTTP/1.1\r\nHost: localhost\r\ncontent-length: 5\r\n\r\nhello";
    let (parsed, consumed) = parse_http_request(req).unwrap();

    assert_eq!(parsed.method, Method::POST);
    assert_eq!(parsed.body, b"hello".to_vec());
    assert_eq!(consumed, req.len());
    assert!(parsed.remote_addr.is_none());
}

#[test]
fn test_parse_errors() {
    assert_eq!(
        parse_http_request(b"GET / HTTP/1.1\r\nHost: x\r\n").unwrap_err(),
        ParseError::Incomplete
    );
    assert_eq!(
        parse_http_request(b"POST / HTTP/1.1\r\nContent-Length: 10\r\n\r\nhi").unwrap_err(),
        ParseError::Incomplete
    );
    assert_eq!(
        parse_http_request(b"BREW / HTTP/1.1\r\n\r\n").unwrap_err(),
        ParseError::InvalidMethod
    );
    assert_eq!(
        parse_http_request(b"GET / HTTP/1.1\r\nBroken\r\n\r\n").unwrap_err(),
        ParseError::InvalidHeader
    );
    assert_eq!(
        parse_http_request(b"GET / HTTP/1.1\r\nContent-Length: x\r\n\r\n").unwrap_err(),
        ParseError::InvalidContentLength
    );
}

#[test]
fn test_header_lookup_ignores_case() {
    let req = RequestBuilder::new()
        .method(Method::GET)
        .path("/")
        .header("X-Forwarded-For", "1.2.3.4")
        .build()
        .unwrap();

    assert_eq!(req.header("x-forwarded-for"), Some("1.2.3.4"));
    assert_eq!(req.header("Missing"), None);
}

#[test]
fn test_set_header_replaces_other_casing() {
    let mut req = RequestBuilder::new()
        .method(Method::GET)
        .path("/")
        .header("host", "old")
        .build()
        .unwrap();

    req.set_header("Host", "new");

    assert_eq!(req.headers.len(), 1);
    assert_eq!(req.header("HOST"), Some("new"));
}

#[test]
fn test_path_and_query_split() {
    let req = Request {
        method: Method::GET,
        path: "/search?q=rust&page=2".to_string(),
        version: "HTTP/1.1".to_string(),
        headers: HashMap::new(),
        body: vec![],
        remote_addr: None,
    };

    assert_eq!(req.path_only(), "/search");
    assert_eq!(req.query(), Some("q=rust&page=2"));
}

#[test]
fn test_keep_alive_rules() {
    let build = |version: &str, connection: Option<&str>| {
        let mut builder = RequestBuilder::new().method(Method::GET).path("/").version(version);
        if let Some(value) = connection {
            builder = builder.header("Connection", value);
        }
        builder.build().unwrap()
    };

    assert!(build("HTTP/1.1", None).keep_alive());
    assert!(!build("HTTP/1.1", Some("close")).keep_alive());
    assert!(!build("HTTP/1.0", None).keep_alive());
    assert!(build("HTTP/1.0", Some("Keep-Alive")).keep_alive());
}

#[test]
fn test_status_code_round_trip_through_numbers() {
    for code in [200, 201, 204, 400, 401, 404, 405, 413, 431, 500, 501, 502, 503, 504, 302, 429] {
        assert_eq!(StatusCode::from_u16(code).as_u16(), code);
    }
    assert_eq!(StatusCode::from_u16(429), StatusCode::Other(429));
    assert!(StatusCode::from_u16(304).is_bodyless());
    assert!(!StatusCode::Ok.is_bodyless());
}

#[test]
fn test_builder_keeps_explicit_content_length() {
    let response = ResponseBuilder::new(StatusCode::Ok)
        .header("content-length", "999")
        .body(b"test".to_vec())
        .build();

    assert_eq!(response.headers.len(), 1);
    assert_eq!(response.header("Content-Length"), Some("999"));
}

#[test]
fn test_service_unavailable_helper() {
    let response = Response::service_unavailable();

    assert_eq!(response.status, StatusCode::ServiceUnavailable);
    assert_eq!(response.body, b"Service not available");
    assert_eq!(response.header("Content-Length"), Some("21"));
}

#[test]
fn test_serialize_marks_closing_connections() {
    let mut response = Response::ok("hi");
    response.set_header("Connection", "keep-alive");

    let open = String::from_utf8(serialize_response(&response, true)).unwrap();
    let closing = String::from_utf8(serialize_response(&response, false)).unwrap();

    assert!(open.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(!open.contains("Connection"));
    assert!(closing.contains("Connection: close\r\n"));
    assert!(closing.ends_with("\r\n\r\nhi"));
}

#[test]
fn test_parse_chunked_body() {
    let req = b"POST /x HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n\
        5\r\nhello\r\n6\r\n world\r\n0\r\n\r\nGET /next HTTP/1.1\r\n\r\n";

    let (parsed, consumed) = parse_http_request(req).unwrap();

    assert_eq!(parsed.body, b"hello world");
    assert_eq!(parsed.header("Transfer-Encoding"), None);
    assert_eq!(parsed.header("Content-Length"), Some("11"));
    assert_eq!(&req[consumed..], b"GET /next HTTP/1.1\r\n\r\n");
}

#[test]
fn test_parse_chunked_body_waits_for_terminator() {
    let partial = b"POST /x HTTP/1.1\r\ntransfer-encoding: chunked\r\n\r\n5\r\nhello\r\n";
    assert_eq!(parse_http_request(partial).unwrap_err(), ParseError::Incomplete);

    let gzip = b"POST /x HTTP/1.1\r\nTransfer-Encoding: gzip\r\n\r\n";
    assert_eq!(
        parse_http_request(gzip).unwrap_err(),
        ParseError::UnsupportedTransferEncoding
    );
}

#[test]
fn test_parse_size_caps() {
    let mut endless = b"GET / HTTP/1.1\r\nX-Filler: ".to_vec();
    endless.resize(MAX_HEAD_SIZE, b'a');
    assert_eq!(parse_http_request(&endless).unwrap_err(), ParseError::HeadTooLarge);

    let huge = format!(
        "POST / HTTP/1.1\r\nContent-Length: {}\r\n\r\n",
        MAX_BODY_SIZE + 1
    );
    assert_eq!(
        parse_http_request(huge.as_bytes()).unwrap_err(),
        ParseError::BodyTooLarge
    );
}

#[test]
fn test_serialize_keeps_repeated_headers() {
    let response = ResponseBuilder::new(StatusCode::Ok)
        .header("Set-Cookie", "a=1")
        .header("Set-Cookie", "b=2")
        .build();

    let text = String::from_utf8(serialize_response(&response, true)).unwrap();

    assert!(text.contains("Set-Cookie: a=1\r\n"));
    assert!(text.contains("Set-Cookie: b=2\r\n"));
}

#[tokio::test]
async fn test_connection_accepts_chunked_upload() {
    let proxy = common::spawn_proxy(Arc::new(EchoBody)).await;

    let response = common::send_raw(
        proxy,
        b"POST /up HTTP/1.1\r\nTransfer-Encoding: chunked\r\nConnection: close\r\n\r\n\
          5\r\nhello\r\n0\r\n\r\n",
    )
    .await;

    assert_eq!(response.status, StatusCode::Ok);
    assert_eq!(response.body, b"hello");
}

#[tokio::test]
async fn test_connection_rejects_oversized_head() {
    let proxy = common::spawn_proxy(Arc::new(EchoBody)).await;
    let mut endless = b"GET / HTTP/1.1\r\nX-Filler: ".to_vec();
    endless.resize(MAX_HEAD_SIZE, b'a');

    let response = common::send_raw(proxy, &endless).await;

    assert_eq!(response.status, StatusCode::RequestHeaderFieldsTooLarge);
}

#[tokio::test]
async fn test_connection_rejects_oversized_body() {
    let proxy = common::spawn_proxy(Arc::new(EchoBody)).await;
    let head = format!(
        "POST / HTTP/1.1\r\nContent-Length: {}\r\n\r\n",
        MAX_BODY_SIZE + 1
    );

    let response = common::send_raw(proxy, head.as_bytes()).await;

    assert_eq!(response.status, StatusCode::PayloadTooLarge);
}
