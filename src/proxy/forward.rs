//! Single-target forwarding handle
//!
//! An [`HttpForwarder`] is bound to one upstream URL when it is built and
//! relays buffered requests to it over a fresh TCP connection per exchange.

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use url::Url;

use crate::config::Timeouts;
use crate::http::parser::{self, ParseError, find_headers_end};
use crate::http::request::{Method, Request};
use crate::http::response::{Response, ResponseBuilder, StatusCode};

/// Upper bound on an upstream response head.
const MAX_HEAD_SIZE: usize = 64 * 1024;

const HOP_BY_HOP: [&str; 6] = [
    "Connection",
    "Keep-Alive",
    "Proxy-Connection",
    "Transfer-Encoding",
    "Upgrade",
    "TE",
];

/// Forwards a request to the one upstream this handle is bound to.
///
/// An `Err` means the exchange itself failed (refused, timed out, cut
/// short). An upstream that answers with a 5xx status is still `Ok`.
#[async_trait]
pub trait Forwarder: Send + Sync {
    async fn forward(&self, request: &Request) -> Result<Response>;

    /// The URL every request is sent to.
    fn target(&self) -> &Url;
}

/// Plain HTTP/1.1 forwarder over `tokio::net::TcpStream`.
#[derive(Debug, Clone)]
pub struct HttpForwarder {
    target: Url,
    /// `host:port` to dial
    authority: String,
    /// Value for the outgoing `Host` header
    host_header: String,
    timeouts: Timeouts,
}

impl HttpForwarder {
    pub fn new(target: Url, timeouts: Timeouts) -> Result<Self> {
        if target.scheme() != "http" {
            anyhow::bail!("unsupported upstream scheme {}", target.scheme());
        }
        let host = target.host_str().context("upstream URL missing host")?;
        let port = target.port_or_known_default().unwrap_or(80);

        let host_header = match target.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        };

        Ok(Self {
            authority: format!("{}:{}", host, port),
            host_header,
            target,
            timeouts,
        })
    }

    /// Path sent upstream: the target's base path joined to the request path.
    pub fn upstream_path(&self, request: &Request) -> String {
        let mut path = join_paths(self.target.path(), request.path_only());
        if let Some(query) = request.query() {
            path.push('?');
            path.push_str(query);
        }
        path
    }

    /// Build HTTP request bytes to send upstream
    pub fn build_http_request(&self, request: &Request) -> Vec<u8> {
        let mut buffer = Vec::with_capacity(512 + request.body.len());

        buffer.extend_from_slice(
            format!(
                "{} {} HTTP/1.1\r\n",
                request.method.as_str(),
                self.upstream_path(request)
            )
            .as_bytes(),
        );

        let mut outgoing = request.clone();
        for header in HOP_BY_HOP {
            outgoing.remove_header(header);
        }
        outgoing.set_header("Host", self.host_header.clone());
        outgoing.set_header("Connection", "close");
        if !request.body.is_empty() || request.header("Content-Length").is_some() {
            outgoing.set_header("Content-Length", request.body.len().to_string());
        }
        if let Some(peer) = request.remote_addr {
            let forwarded = match request.header("X-Forwarded-For") {
                Some(prior) if !prior.is_empty() => format!("{}, {}", prior, peer.ip()),
                _ => peer.ip().to_string(),
            };
            outgoing.set_header("X-Forwarded-For", forwarded);
        }

        for (key, value) in &outgoing.headers {
            buffer.extend_from_slice(format!("{}: {}\r\n", key, value).as_bytes());
        }
        buffer.extend_from_slice(b"\r\n");
        buffer.extend_from_slice(&request.body);

        buffer
    }

    async fn exchange(&self, mut stream: TcpStream, request: &Request) -> Result<Response> {
        stream.write_all(&self.build_http_request(request)).await?;
        stream.flush().await?;

        read_http_response(&mut stream, request.method == Method::HEAD).await
    }
}

#[async_trait]
impl Forwarder for HttpForwarder {
    async fn forward(&self, request: &Request) -> Result<Response> {
        let stream = timeout(self.timeouts.connect, TcpStream::connect(&self.authority))
            .await
            .context("connection timeout")?
            .with_context(|| format!("failed to connect to {}", self.authority))?;

        timeout(self.timeouts.request, self.exchange(stream, request))
            .await
            .context("request timeout")?
    }

    fn target(&self) -> &Url {
        &self.target
    }
}

/// Joins two path segments with exactly one slash between them.
pub fn join_paths(base: &str, tail: &str) -> String {
    if tail.is_empty() {
        return if base.is_empty() { "/".to_string() } else { base.to_string() };
    }
    match (base.ends_with('/'), tail.starts_with('/')) {
        (true, true) => format!("{}{}", base, &tail[1..]),
        (false, false) => format!("{}/{}", base, tail),
        _ => format!("{}{}", base, tail),
    }
}

/// Reads one response off `stream`. The upstream was asked to close the
/// connection, so bodies without framing run to EOF.
pub async fn read_http_response<S>(stream: &mut S, head_only: bool) -> Result<Response>
where
    S: AsyncRead + Unpin,
{
    let mut buffer = BytesMut::with_capacity(8192);

    let head_end = loop {
        if let Some(end) = find_headers_end(&buffer) {
            break end;
        }
        if buffer.len() > MAX_HEAD_SIZE {
            anyhow::bail!("response headers too large");
        }
        if stream.read_buf(&mut buffer).await? == 0 {
            anyhow::bail!("connection closed before complete response received");
        }
    };

    let head = buffer.split_to(head_end + 4);
    let (status, mut headers) = parse_response_head(&head)?;

    let chunked = header_value(&headers, "Transfer-Encoding")
        .map(|te| te.to_ascii_lowercase().contains("chunked"))
        .unwrap_or(false);
    let content_length = header_value(&headers, "Content-Length")
        .map(|cl| cl.parse::<usize>().context("invalid Content-Length"))
        .transpose()?;

    for header in HOP_BY_HOP {
        headers.retain(|(name, _)| !name.eq_ignore_ascii_case(header));
    }

    let body = if head_only || status.is_bodyless() {
        Vec::new()
    } else if chunked {
        headers.retain(|(name, _)| !name.eq_ignore_ascii_case("Content-Length"));
        let raw = read_to_close(stream, buffer).await?;
        decode_chunked(&raw)?
    } else if let Some(length) = content_length {
        read_exact_body(stream, buffer, length).await?
    } else {
        read_to_close(stream, buffer).await?
    };

    Ok(ResponseBuilder::new(status)
        .headers(headers)
        .body(body)
        .build())
}

fn parse_response_head(head: &[u8]) -> Result<(StatusCode, Vec<(String, String)>)> {
    let text = std::str::from_utf8(head).context("invalid UTF-8 in response headers")?;
    let mut lines = text.split("\r\n");

    let status_line = lines.next().context("empty response")?;
    let mut parts = status_line.splitn(3, ' ');
    let version = parts.next().unwrap_or_default();
    if !version.starts_with("HTTP/") {
        anyhow::bail!("invalid status line: {}", status_line);
    }
    let code: u16 = parts
        .next()
        .context("missing status code")?
        .parse()
        .context("invalid status code")?;

    let mut headers = Vec::new();
    for line in lines.filter(|l| !l.is_empty()) {
        if let Some((key, value)) = line.split_once(':') {
            headers.push((key.trim().to_string(), value.trim().to_string()));
        }
    }

    Ok((StatusCode::from_u16(code), headers))
}

fn header_value<'a>(headers: &'a [(String, String)], key: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(key))
        .map(|(_, v)| v.as_str())
}

async fn read_exact_body<S>(stream: &mut S, mut buffer: BytesMut, length: usize) -> Result<Vec<u8>>
where
    S: AsyncRead + Unpin,
{
    while buffer.len() < length {
        if stream.read_buf(&mut buffer).await? == 0 {
            anyhow::bail!("connection closed before complete body received");
        }
    }
    buffer.truncate(length);
    Ok(buffer.to_vec())
}

async fn read_to_close<S>(stream: &mut S, mut buffer: BytesMut) -> Result<Vec<u8>>
where
    S: AsyncRead + Unpin,
{
    while stream.read_buf(&mut buffer).await? != 0 {}
    Ok(buffer.to_vec())
}

/// Decodes a complete chunked body; trailers are discarded.
pub fn decode_chunked(raw: &[u8]) -> Result<Vec<u8>> {
    match parser::decode_chunked(raw, usize::MAX) {
        Ok((body, _)) => Ok(body),
        Err(ParseError::Incomplete) => anyhow::bail!("truncated chunk"),
        Err(e) => anyhow::bail!("invalid chunked body: {:?}", e),
    }
}
