use crate::http::request::{Method, Request};
use std::collections::HashMap;
use std::ops::Range;

/// Largest request head (request line plus headers) accepted from a client.
pub const MAX_HEAD_SIZE: usize = 16 * 1024;

/// Largest request body accepted from a client, framed or chunked.
pub const MAX_BODY_SIZE: usize = 8 * 1024 * 1024;

#[derive(Debug, PartialEq, Eq)]
pub enum ParseError {
    InvalidRequest,
    InvalidMethod,
    InvalidHeader,
    InvalidContentLength,
    InvalidChunk,
    UnsupportedTransferEncoding,
    HeadTooLarge,
    BodyTooLarge,
    Incomplete,
}

/// Parses one request off the front of `buf`.
///
/// Returns the request and the number of bytes it occupied, or
/// `ParseError::Incomplete` when more bytes are needed. Chunked bodies are
/// decoded; the request then carries a `Content-Length` instead of
/// `Transfer-Encoding`.
pub fn parse_http_request(buf: &[u8]) -> Result<(Request, usize), ParseError> {
    let headers_end = match find_headers_end(buf) {
        Some(end) if end + 4 > MAX_HEAD_SIZE => return Err(ParseError::HeadTooLarge),
        Some(end) => end,
        None if buf.len() >= MAX_HEAD_SIZE => return Err(ParseError::HeadTooLarge),
        None => return Err(ParseError::Incomplete),
    };
    let header_bytes = &buf[..headers_end];
    let body_bytes = &buf[headers_end + 4..];

    let headers_str =
        std::str::from_utf8(header_bytes).map_err(|_| ParseError::InvalidRequest)?;

    let mut lines = headers_str.split("\r\n");

    let request_line = lines.next().ok_or(ParseError::InvalidRequest)?;
    let mut parts = request_line.split_whitespace();

    let method_str = parts.next().ok_or(ParseError::InvalidRequest)?;
    let path = parts.next().ok_or(ParseError::InvalidRequest)?;
    let version = parts.next().ok_or(ParseError::InvalidRequest)?;

    let method = Method::from_str(method_str).ok_or(ParseError::InvalidMethod)?;

    let mut headers = HashMap::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }

        let (key, value) = line.split_once(':').ok_or(ParseError::InvalidHeader)?;
        headers.insert(key.trim().to_string(), value.trim().to_string());
    }

    let transfer_encoding = header_value(&headers, "Transfer-Encoding").map(str::to_string);

    let (body, body_len) = match transfer_encoding {
        // Transfer-Encoding wins over Content-Length when both are sent.
        Some(te) => {
            let last = te.rsplit(',').next().unwrap_or_default().trim();
            if !last.eq_ignore_ascii_case("chunked") {
                return Err(ParseError::UnsupportedTransferEncoding);
            }
            let (body, consumed) = decode_chunked(body_bytes, MAX_BODY_SIZE)?;
            headers.retain(|k, _| {
                !k.eq_ignore_ascii_case("Transfer-Encoding")
                    && !k.eq_ignore_ascii_case("Content-Length")
            });
            headers.insert("Content-Length".to_string(), body.len().to_string());
            (body, consumed)
        }
        None => {
            let content_length = header_value(&headers, "Content-Length")
                .map(|v| {
                    v.parse::<usize>()
                        .map_err(|_| ParseError::InvalidContentLength)
                })
                .transpose()?
                .unwrap_or(0);

            if content_length > MAX_BODY_SIZE {
                return Err(ParseError::BodyTooLarge);
            }
            if body_bytes.len() < content_length {
                return Err(ParseError::Incomplete);
            }
            (body_bytes[..content_length].to_vec(), content_length)
        }
    };

    let request = Request {
        method,
        path: path.to_string(),
        version: version.to_string(),
        headers,
        body,
        remote_addr: None,
    };

    Ok((request, headers_end + 4 + body_len))
}

/// Decodes a chunked body from the front of `buf`.
///
/// Returns the payload and the number of bytes the encoding occupied,
/// trailers included. Chunk data is only copied once the terminating chunk
/// has arrived, so re-running this on a growing buffer stays linear in the
/// number of chunks.
pub fn decode_chunked(buf: &[u8], limit: usize) -> Result<(Vec<u8>, usize), ParseError> {
    let mut pos = 0;
    let mut total: usize = 0;
    let mut chunks: Vec<Range<usize>> = Vec::new();

    loop {
        let line = next_line(buf, pos)?;
        let size_line =
            std::str::from_utf8(&buf[line.clone()]).map_err(|_| ParseError::InvalidChunk)?;
        let size_hex = size_line.split(';').next().unwrap_or_default().trim();
        let size =
            usize::from_str_radix(size_hex, 16).map_err(|_| ParseError::InvalidChunk)?;
        pos = line.end + 2;

        if size == 0 {
            break;
        }

        total = total.checked_add(size).ok_or(ParseError::BodyTooLarge)?;
        if total > limit {
            return Err(ParseError::BodyTooLarge);
        }
        let data_end = pos.checked_add(size).ok_or(ParseError::InvalidChunk)?;
        if buf.len() < data_end + 2 {
            return Err(ParseError::Incomplete);
        }
        if &buf[data_end..data_end + 2] != b"\r\n" {
            return Err(ParseError::InvalidChunk);
        }
        chunks.push(pos..data_end);
        pos = data_end + 2;
    }

    // Trailer section runs to the first empty line.
    loop {
        let line = next_line(buf, pos)?;
        pos = line.end + 2;
        if line.is_empty() {
            break;
        }
    }

    let mut body = Vec::with_capacity(total);
    for chunk in chunks {
        body.extend_from_slice(&buf[chunk]);
    }
    Ok((body, pos))
}

fn next_line(buf: &[u8], from: usize) -> Result<Range<usize>, ParseError> {
    let rest = buf.get(from..).unwrap_or_default();
    match rest.windows(2).position(|w| w == b"\r\n") {
        Some(len) => Ok(from..from + len),
        None if rest.len() > MAX_HEAD_SIZE => Err(ParseError::InvalidChunk),
        None => Err(ParseError::Incomplete),
    }
}

fn header_value<'a>(headers: &'a HashMap<String, String>, key: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(key))
        .map(|(_, v)| v.as_str())
}

pub(crate) fn find_headers_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_leaves_pipelined_bytes() {
        let req = b"GET /a HTTP/1.1\r\nHost: x\r\n\r\nGET /b HTTP/1.1\r\n\r\n";

        let (parsed, consumed) = parse_http_request(req).unwrap();

        assert_eq!(parsed.path, "/a");
        assert_eq!(&req[consumed..], b"GET /b HTTP/1.1\r\n\r\n");
    }

    #[test]
    fn chunked_decode_reports_consumed_bytes() {
        let raw = b"4\r\nWiki\r\n5;ext=1\r\npedia\r\n0\r\nX-Trailer: 1\r\n\r\nNEXT";

        let (body, consumed) = decode_chunked(raw, MAX_BODY_SIZE).unwrap();

        assert_eq!(body, b"Wikipedia");
        assert_eq!(&raw[consumed..], b"NEXT");
    }

    #[test]
    fn chunked_decode_waits_for_last_chunk() {
        let decode = |raw: &[u8]| decode_chunked(raw, MAX_BODY_SIZE);

        assert_eq!(decode(b"5\r\nhel"), Err(ParseError::Incomplete));
        assert_eq!(decode(b"5\r\nhello\r\n0\r\n"), Err(ParseError::Incomplete));
        assert_eq!(decode(b"zz\r\n"), Err(ParseError::InvalidChunk));
        assert_eq!(decode_chunked(b"5\r\nhello\r\n", 4), Err(ParseError::BodyTooLarge));
    }
}
