/// The request/response contract sessions and the forwarder speak: any type
/// that can serialize itself to bytes and parse itself back. `Wire` is that
/// contract as a Rust trait. `HttpRequest`/`HttpResponse` below hand-roll
/// just the HTTP/1.1 line-and-header framing the forwarder needs — not a
/// general-purpose HTTP message type.
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseError(pub String);

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "parse error: {}", self.0)
    }
}

impl std::error::Error for ParseError {}

/// A type that can be framed onto the wire and parsed back off it.
pub trait Wire: Sized {
    fn to_wire(&self) -> String;
    fn from_wire(s: &str) -> Result<Self, ParseError>;
}

/// Case-insensitive header map, preserving a stable iteration order for
/// serialization (`BTreeMap` keyed on the lower-cased name).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(BTreeMap<String, String>);

impl Headers {
    pub fn new() -> Self {
        Headers(BTreeMap::new())
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.insert(name.into().to_ascii_lowercase(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(&name.to_ascii_lowercase())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// An HTTP/1.1 request the forwarder receives from a client and relays
/// upstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub method: String,
    pub target: String,
    pub headers: Headers,
    pub body: Vec<u8>,
}

impl HttpRequest {
    pub fn new(method: impl Into<String>, target: impl Into<String>) -> Self {
        HttpRequest {
            method: method.into(),
            target: target.into(),
            headers: Headers::new(),
            body: Vec::new(),
        }
    }

    /// Parses `Host` into `(name, optional port)`, case-folding the name,
    /// per the forwarder's routing step.
    pub fn host(&self) -> Option<(String, Option<u16>)> {
        let raw = self.headers.get("host")?;
        let lower = raw.to_ascii_lowercase();
        match lower.rsplit_once(':') {
            Some((name, port)) if port.chars().all(|c| c.is_ascii_digit()) && !port.is_empty() => {
                Some((name.to_string(), port.parse().ok()))
            }
            _ => Some((lower, None)),
        }
    }

    pub fn keep_alive(&self) -> bool {
        match self.headers.get("connection") {
            Some(v) => !v.eq_ignore_ascii_case("close"),
            None => true,
        }
    }

    /// Sets `Content-Length` from the current body, as the forwarder does
    /// before relaying a request it may have rewritten.
    pub fn prepare_payload(&mut self) {
        self.headers.insert("content-length", self.body.len().to_string());
    }

    pub fn set_host_if_missing(&mut self, host: &str) {
        if !self.headers.contains("host") {
            self.headers.insert("host", host);
        }
    }
}

impl Wire for HttpRequest {
    fn to_wire(&self) -> String {
        let mut out = format!("{} {} HTTP/1.1\r\n", self.method, self.target);
        for (name, value) in self.headers.iter() {
            out.push_str(name);
            out.push_str(": ");
            out.push_str(value);
            out.push_str("\r\n");
        }
        out.push_str("\r\n");
        if !self.body.is_empty() {
            out.push_str(&String::from_utf8_lossy(&self.body));
        }
        out
    }

    fn from_wire(s: &str) -> Result<Self, ParseError> {
        let (head, body) = split_head_body(s)?;
        let mut lines = head.split("\r\n");
        let request_line = lines
            .next()
            .ok_or_else(|| ParseError("missing request line".into()))?;
        let mut parts = request_line.splitn(3, ' ');
        let method = parts
            .next()
            .ok_or_else(|| ParseError("missing method".into()))?
            .to_string();
        let target = parts
            .next()
            .ok_or_else(|| ParseError("missing target".into()))?
            .to_string();

        let mut headers = Headers::new();
        for line in lines {
            if line.is_empty() {
                continue;
            }
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| ParseError(format!("malformed header line: {line}")))?;
            headers.insert(name.trim(), value.trim());
        }

        Ok(HttpRequest {
            method,
            target,
            headers,
            body: body.as_bytes().to_vec(),
        })
    }
}

/// An HTTP/1.1 response the forwarder receives from an upstream and
/// relays back to the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub reason: String,
    pub headers: Headers,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn new(status: u16, reason: impl Into<String>) -> Self {
        HttpResponse {
            status,
            reason: reason.into(),
            headers: Headers::new(),
            body: Vec::new(),
        }
    }

    pub fn with_body(status: u16, reason: impl Into<String>, body: impl Into<Vec<u8>>) -> Self {
        let mut response = HttpResponse::new(status, reason);
        response.body = body.into();
        response.prepare_payload();
        response
    }

    pub fn keep_alive(&self) -> bool {
        match self.headers.get("connection") {
            Some(v) => !v.eq_ignore_ascii_case("close"),
            None => true,
        }
    }

    pub fn prepare_payload(&mut self) {
        self.headers.insert("content-length", self.body.len().to_string());
    }
}

impl Wire for HttpResponse {
    fn to_wire(&self) -> String {
        let mut out = format!("HTTP/1.1 {} {}\r\n", self.status, self.reason);
        for (name, value) in self.headers.iter() {
            out.push_str(name);
            out.push_str(": ");
            out.push_str(value);
            out.push_str("\r\n");
        }
        out.push_str("\r\n");
        if !self.body.is_empty() {
            out.push_str(&String::from_utf8_lossy(&self.body));
        }
        out
    }

    fn from_wire(s: &str) -> Result<Self, ParseError> {
        let (head, body) = split_head_body(s)?;
        let mut lines = head.split("\r\n");
        let status_line = lines
            .next()
            .ok_or_else(|| ParseError("missing status line".into()))?;
        let mut parts = status_line.splitn(3, ' ');
        let _version = parts
            .next()
            .ok_or_else(|| ParseError("missing http version".into()))?;
        let status: u16 = parts
            .next()
            .ok_or_else(|| ParseError("missing status code".into()))?
            .parse()
            .map_err(|_| ParseError("status code is not numeric".into()))?;
        let reason = parts.next().unwrap_or("").to_string();

        let mut headers = Headers::new();
        for line in lines {
            if line.is_empty() {
                continue;
            }
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| ParseError(format!("malformed header line: {line}")))?;
            headers.insert(name.trim(), value.trim());
        }

        Ok(HttpResponse {
            status,
            reason,
            headers,
            body: body.as_bytes().to_vec(),
        })
    }
}

/// Splits a raw HTTP/1.1 message into its head (request/status line plus
/// headers) and body, on the first blank line.
fn split_head_body(s: &str) -> Result<(&str, &str), ParseError> {
    match s.split_once("\r\n\r\n") {
        Some((head, body)) => Ok((head, body)),
        None => Ok((s.trim_end_matches("\r\n"), "")),
    }
}

/// Incrementally attempts to decode a response from accumulated bytes,
/// used by the session's one-shot receive handler: buffers bytes and
/// attempts to decode a response after each chunk.
/// Returns `Ok(None)` if more bytes are needed, i.e. the header block
/// hasn't arrived yet or the declared `Content-Length` hasn't been fully
/// buffered.
pub fn try_decode_response(buffer: &[u8]) -> Result<Option<HttpResponse>, ParseError> {
    let text = match std::str::from_utf8(buffer) {
        Ok(text) => text,
        Err(_) => return Ok(None),
    };
    let header_end = match text.find("\r\n\r\n") {
        Some(idx) => idx + 4,
        None => return Ok(None),
    };
    let response = HttpResponse::from_wire(text)?;
    let declared_len: usize = response
        .headers
        .get("content-length")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    if buffer.len() - header_end < declared_len {
        return Ok(None);
    }
    Ok(Some(response))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_round_trip() {
        let mut req = HttpRequest::new("GET", "/status");
        req.headers.insert("Host", "example.com:8443");
        req.body = b"hi".to_vec();
        req.prepare_payload();

        let wire = req.to_wire();
        let parsed = HttpRequest::from_wire(&wire).unwrap();
        assert_eq!(parsed.method, "GET");
        assert_eq!(parsed.target, "/status");
        assert_eq!(parsed.headers.get("host"), Some("example.com:8443"));
        assert_eq!(parsed.body, b"hi");
    }

    #[test]
    fn test_host_with_port() {
        let mut req = HttpRequest::new("GET", "/");
        req.headers.insert("Host", "Example.COM:9443");
        assert_eq!(
            req.host(),
            Some(("example.com".to_string(), Some(9443)))
        );
    }

    #[test]
    fn test_host_without_port() {
        let mut req = HttpRequest::new("GET", "/");
        req.headers.insert("Host", "example.com");
        assert_eq!(req.host(), Some(("example.com".to_string(), None)));
    }

    #[test]
    fn test_keep_alive_defaults_true() {
        let req = HttpRequest::new("GET", "/");
        assert!(req.keep_alive());
    }

    #[test]
    fn test_keep_alive_honors_connection_close() {
        let mut req = HttpRequest::new("GET", "/");
        req.headers.insert("Connection", "close");
        assert!(!req.keep_alive());
    }

    #[test]
    fn test_response_round_trip() {
        let response = HttpResponse::with_body(200, "OK", b"pong".to_vec());
        let wire = response.to_wire();
        let parsed = HttpResponse::from_wire(&wire).unwrap();
        assert_eq!(parsed.status, 200);
        assert_eq!(parsed.reason, "OK");
        assert_eq!(parsed.body, b"pong");
    }

    #[test]
    fn test_try_decode_response_waits_for_full_body() {
        let full = HttpResponse::with_body(200, "OK", b"0123456789".to_vec()).to_wire();
        let partial = &full.as_bytes()[..full.len() - 5];
        assert_eq!(try_decode_response(partial).unwrap(), None);
        assert!(try_decode_response(full.as_bytes()).unwrap().is_some());
    }

    #[test]
    fn test_try_decode_response_waits_for_headers() {
        let partial = b"HTTP/1.1 200 OK\r\nContent-Le";
        assert_eq!(try_decode_response(partial).unwrap(), None);
    }
}
