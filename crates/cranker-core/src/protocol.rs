//! Cranker wire protocol: the framing used on the WebSocket that carries one
//! proxied HTTP exchange between a router socket and a connector socket.
//!
//! A request is one text frame (request line + headers + end marker),
//! optionally followed by binary body frames and a final `_3` text frame. A
//! response is one text frame (status line + source method/path + headers)
//! followed by binary body frames until the socket closes.

use crate::error::{ProtocolError, ProtocolResult};

/// The only cranker protocol version this crate speaks.
pub const CRANKER_PROTOCOL_VERSION_1_0: &str = "1.0";

/// HTTP version advertised on framed requests/responses.
pub const SUPPORTING_HTTP_VERSION: &str = "HTTP/1.1";

/// Header that, when present with value `"1"`, turns on verbose per-message logging.
pub const DEBUG_HEADER: &str = "X-ROUTER_DEBUG_MODE";
const DEBUG_HEADER_ENABLED: &str = "1";

/// End marker meaning "binary body frames follow, terminated by a later `_3`".
pub const BODY_PENDING_MARKER: &str = "_1";
/// End marker meaning "this request has no body".
pub const NO_BODY_MARKER: &str = "_2";
/// End marker meaning "the body stream has ended" (also a standalone legal message).
pub const BODY_ENDED_MARKER: &str = "_3";

/// Validates a `CrankerProtocol` handshake header value.
pub fn validate_protocol_version(version: &str) -> ProtocolResult<()> {
    if version == CRANKER_PROTOCOL_VERSION_1_0 {
        Ok(())
    } else {
        Err(ProtocolError::InvalidVersion(version.to_string()))
    }
}

/// The end-of-message marker on a framed request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndMarker {
    /// `_1`: binary frames follow.
    BodyPending,
    /// `_2`: no body at all.
    NoBody,
    /// `_3`: body stream ended (or this is the whole message).
    BodyEnded,
}

impl EndMarker {
    fn as_str(self) -> &'static str {
        match self {
            Self::BodyPending => BODY_PENDING_MARKER,
            Self::NoBody => NO_BODY_MARKER,
            Self::BodyEnded => BODY_ENDED_MARKER,
        }
    }

    fn parse(s: &str) -> ProtocolResult<Self> {
        match s {
            BODY_PENDING_MARKER => Ok(Self::BodyPending),
            NO_BODY_MARKER => Ok(Self::NoBody),
            BODY_ENDED_MARKER => Ok(Self::BodyEnded),
            other => Err(ProtocolError::UnknownEndMarker(other.to_string())),
        }
    }
}

/// A parsed cranker request message (the text frame, not the binary body).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrankerRequest {
    /// `None` for a standalone `_3` message (no request line at all).
    pub method: Option<String>,
    pub dest: Option<String>,
    pub headers: Vec<String>,
    pub end_marker: EndMarker,
}

impl CrankerRequest {
    pub fn is_body_pending(&self) -> bool {
        self.end_marker == EndMarker::BodyPending
    }

    pub fn is_body_ended(&self) -> bool {
        self.end_marker == EndMarker::BodyEnded
    }

    pub fn has_no_body(&self) -> bool {
        self.end_marker == EndMarker::NoBody
    }

    pub fn is_debug(&self) -> bool {
        has_debug_header(&self.headers)
    }
}

/// Builds the text frame for a request: `METHOD DEST HTTP/1.1\nHeader: v\n...\n\nMARKER`.
///
/// `headers` are already-formatted `"Name:Value"` lines.
pub fn encode_request(method: &str, dest: &str, headers: &[String], end_marker: EndMarker) -> String {
    let mut out = String::with_capacity(64 + headers.iter().map(|h| h.len() + 1).sum::<usize>());
    out.push_str(method);
    out.push(' ');
    out.push_str(dest);
    out.push(' ');
    out.push_str(SUPPORTING_HTTP_VERSION);
    out.push('\n');
    for header in headers {
        out.push_str(header);
        out.push('\n');
    }
    out.push('\n');
    out.push_str(end_marker.as_str());
    out
}

/// Parses a request text frame. A bare `_3` is a legal "body has ended" message.
pub fn parse_request(msg: &str) -> ProtocolResult<CrankerRequest> {
    if msg == BODY_ENDED_MARKER {
        return Ok(CrankerRequest {
            method: None,
            dest: None,
            headers: Vec::new(),
            end_marker: EndMarker::BodyEnded,
        });
    }

    let lines: Vec<&str> = msg.split('\n').collect();
    if lines.len() < 3 {
        return Err(ProtocolError::Malformed(
            "request message needs a request line, a blank line and an end marker".to_string(),
        ));
    }

    let request_line = lines[0];
    let mut parts = request_line.splitn(3, ' ');
    let method = parts
        .next()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ProtocolError::Malformed("missing method".to_string()))?;
    let dest = parts
        .next()
        .ok_or_else(|| ProtocolError::Malformed("missing destination".to_string()))?;

    let end_marker_str = lines[lines.len() - 1];
    let blank_separator = lines[lines.len() - 2];
    if !blank_separator.is_empty() {
        return Err(ProtocolError::Malformed(
            "missing blank line before end marker".to_string(),
        ));
    }
    let headers = lines[1..lines.len() - 2]
        .iter()
        .map(|s| s.to_string())
        .collect();

    Ok(CrankerRequest {
        method: Some(method.to_string()),
        dest: Some(dest.to_string()),
        headers,
        end_marker: EndMarker::parse(end_marker_str)?,
    })
}

/// A parsed cranker response message (status line + echoed request line + headers).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrankerResponse {
    pub status: u16,
    pub reason: String,
    /// The method of the originating client request, echoed for diagnostics.
    pub source_method: String,
    /// The path of the originating client request, echoed for diagnostics.
    pub source_url: String,
    pub headers: Vec<String>,
}

impl CrankerResponse {
    pub fn is_debug(&self) -> bool {
        has_debug_header(&self.headers)
    }
}

/// Builds the text frame for a response.
pub fn encode_response(
    status: u16,
    reason: &str,
    source_method: &str,
    source_url: &str,
    headers: &[String],
) -> String {
    let mut out = String::with_capacity(64 + headers.iter().map(|h| h.len() + 1).sum::<usize>());
    out.push_str(SUPPORTING_HTTP_VERSION);
    out.push(' ');
    out.push_str(&status.to_string());
    out.push(' ');
    out.push_str(reason);
    out.push_str(" \n");
    out.push_str(source_method);
    out.push(' ');
    out.push_str(source_url);
    out.push('\n');
    for header in headers {
        out.push_str(header);
        out.push('\n');
    }
    out
}

/// Parses a response text frame.
pub fn parse_response(msg: &str) -> ProtocolResult<CrankerResponse> {
    let mut lines = msg.split('\n');
    let status_line = lines
        .next()
        .ok_or_else(|| ProtocolError::Malformed("empty response message".to_string()))?;
    let mut status_bits = status_line.trim().splitn(3, ' ');
    status_bits.next(); // "HTTP/1.1"
    let status: u16 = status_bits
        .next()
        .ok_or_else(|| ProtocolError::Malformed("missing status code".to_string()))?
        .parse()
        .map_err(|_| ProtocolError::Malformed("non-numeric status code".to_string()))?;
    let reason = status_bits.next().unwrap_or("").to_string();

    let source_line = lines
        .next()
        .ok_or_else(|| ProtocolError::Malformed("missing echoed source request line".to_string()))?;
    let mut source_bits = source_line.splitn(2, ' ');
    let source_method = source_bits.next().unwrap_or("").to_string();
    let source_url = source_bits.next().unwrap_or("").to_string();

    let headers = lines
        .filter(|l| !l.is_empty())
        .map(|s| s.to_string())
        .collect();

    Ok(CrankerResponse {
        status,
        reason,
        source_method,
        source_url,
        headers,
    })
}

fn has_debug_header(headers: &[String]) -> bool {
    let prefix = format!("{DEBUG_HEADER}:");
    headers.iter().any(|h| {
        h.strip_prefix(&prefix)
            .map(|v| v.trim() == DEBUG_HEADER_ENABLED)
            .unwrap_or(false)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_no_body_request() {
        let headers = vec!["Host:example.com".to_string(), "Accept:*/*".to_string()];
        let frame = encode_request("GET", "/svc/ping", &headers, EndMarker::NoBody);
        let parsed = parse_request(&frame).unwrap();
        assert_eq!(parsed.method.as_deref(), Some("GET"));
        assert_eq!(parsed.dest.as_deref(), Some("/svc/ping"));
        assert_eq!(parsed.headers, headers);
        assert!(parsed.has_no_body());
    }

    #[test]
    fn round_trips_a_body_pending_request() {
        let headers = vec!["Content-Length:10".to_string()];
        let frame = encode_request("POST", "/svc/echo", &headers, EndMarker::BodyPending);
        let parsed = parse_request(&frame).unwrap();
        assert!(parsed.is_body_pending());
        assert_eq!(parsed.headers, headers);
    }

    #[test]
    fn bare_body_ended_marker_is_a_legal_message() {
        let parsed = parse_request(BODY_ENDED_MARKER).unwrap();
        assert!(parsed.is_body_ended());
        assert!(parsed.method.is_none());
    }

    #[test]
    fn rejects_unknown_end_marker() {
        let err = parse_request("GET /x HTTP/1.1\n\n_9").unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownEndMarker(_)));
    }

    #[test]
    fn round_trips_a_response() {
        let headers = vec!["Content-Type:text/plain".to_string()];
        let frame = encode_response(200, "OK", "GET", "/svc/ping", &headers);
        let parsed = parse_response(&frame).unwrap();
        assert_eq!(parsed.status, 200);
        assert_eq!(parsed.reason, "OK");
        assert_eq!(parsed.source_method, "GET");
        assert_eq!(parsed.source_url, "/svc/ping");
        assert_eq!(parsed.headers, headers);
    }

    #[test]
    fn detects_debug_header() {
        let headers = vec![format!("{DEBUG_HEADER}:1")];
        let frame = encode_request("GET", "/x", &headers, EndMarker::NoBody);
        let parsed = parse_request(&frame).unwrap();
        assert!(parsed.is_debug());
    }

    #[test]
    fn validates_protocol_version() {
        assert!(validate_protocol_version("1.0").is_ok());
        assert!(validate_protocol_version("2.0").is_err());
        assert!(validate_protocol_version("").is_err());
    }
}
