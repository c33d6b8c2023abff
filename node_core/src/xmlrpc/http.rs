//! Minimal, purpose-built HTTP/1.1 framing for carrying XML-RPC bodies. Only what the master
//! and peer-negotiation RPC surfaces need: a POST request/response with a `Content-Length`
//! body. No chunked transfer encoding, no persistent-connection re-use beyond what callers
//! manage themselves.

use crate::error::{ErrorKind, NodeError};

fn malformed(detail: impl Into<String>) -> NodeError {
    NodeError::with_detail(ErrorKind::ProtocolMalformed, detail.into())
}

pub fn build_post_request(host: &str, port: u16, path: &str, body: &str) -> Vec<u8> {
    let mut request = format!(
        "POST {path} HTTP/1.1\r\n\
         Host: {host}:{port}\r\n\
         User-Agent: node-core-xmlrpc/1.0\r\n\
         Content-Type: text/xml\r\n\
         Content-Length: {len}\r\n\
         Connection: close\r\n\r\n",
        path = path,
        host = host,
        port = port,
        len = body.len()
    );
    request.push_str(body);
    request.into_bytes()
}

pub fn build_ok_response(body: &str) -> Vec<u8> {
    let mut response = format!(
        "HTTP/1.1 200 OK\r\n\
         Content-Type: text/xml\r\n\
         Content-Length: {len}\r\n\
         Connection: close\r\n\r\n",
        len = body.len()
    );
    response.push_str(body);
    response.into_bytes()
}

/// Incrementally accumulates bytes from a non-blocking socket read and, once a full
/// `Content-Length`-framed HTTP message has arrived, yields its first line (status line or
/// request line) and body. Designed to be polled with whatever has been read so far on every
/// readiness event - it never blocks and never assumes a full message arrives in one read.
#[derive(Default)]
pub struct HttpMessageParser {
    header_end: Option<usize>,
    content_length: Option<usize>,
    first_line: Option<String>,
}

impl HttpMessageParser {
    pub fn new() -> HttpMessageParser {
        HttpMessageParser::default()
    }

    /// Returns `Some((first_line, body))` once the full message has been seen in `accumulated`,
    /// `None` if more bytes are still needed.
    pub fn try_parse(&mut self, accumulated: &[u8]) -> crate::error::Result<Option<(String, String)>> {
        if self.header_end.is_none() {
            let marker = b"\r\n\r\n";
            let idx = match find_subslice(accumulated, marker) {
                Some(idx) => idx,
                None => return Ok(None),
            };

            let header_text = std::str::from_utf8(&accumulated[..idx]).map_err(|_| malformed("header is not valid UTF-8"))?;
            let mut lines = header_text.split("\r\n");
            let first_line = lines.next().ok_or_else(|| malformed("empty HTTP message"))?.to_string();

            let mut content_length = None;
            for line in lines {
                if let Some((name, value)) = line.split_once(':') {
                    if name.trim().eq_ignore_ascii_case("content-length") {
                        content_length = Some(
                            value
                                .trim()
                                .parse::<usize>()
                                .map_err(|_| malformed("invalid Content-Length"))?,
                        );
                    }
                }
            }

            self.first_line = Some(first_line);
            self.content_length = Some(content_length.unwrap_or(0));
            self.header_end = Some(idx + marker.len());
        }

        let header_end = self.header_end.unwrap();
        let content_length = self.content_length.unwrap();

        if accumulated.len() < header_end + content_length {
            return Ok(None);
        }

        let body = String::from_utf8(accumulated[header_end..header_end + content_length].to_vec())
            .map_err(|_| malformed("body is not valid UTF-8"))?;
        Ok(Some((self.first_line.clone().unwrap(), body)))
    }

    /// Total bytes consumed by the parsed message, available once `try_parse` returned `Some`.
    pub fn consumed_len(&self) -> Option<usize> {
        Some(self.header_end? + self.content_length?)
    }
}

pub fn parse_status_code(status_line: &str) -> crate::error::Result<u16> {
    status_line
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse().ok())
        .ok_or_else(|| malformed("malformed status line"))
}

pub fn parse_request_path(request_line: &str) -> crate::error::Result<String> {
    request_line
        .split_whitespace()
        .nth(1)
        .map(|path| path.to_string())
        .ok_or_else(|| malformed("malformed request line"))
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|window| window == needle)
}
