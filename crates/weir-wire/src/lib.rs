// weir-rs - The Weir SIP Stack
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! SIP message codec for the datagram boundary.
//!
//! The transaction layer treats parsing as an external collaborator: a
//! datagram either yields a [`SipMessage`] or is dropped at this boundary
//! and never reaches the state machines. Serialization freezes requests and
//! responses into the byte images the state machines retransmit verbatim.
//!
//! The parser is deliberately tolerant: it understands the start line,
//! `Name: value` headers and a `Content-Length`-delimited body, which is all
//! transaction matching needs. Header value grammars are not interpreted.

use bytes::{BufMut, Bytes, BytesMut};
use memchr::memmem;
use smol_str::SmolStr;
use weir_core::{Headers, Method, Request, RequestLine, Response, SipMessage, StatusLine};

/// Largest message accepted from a single datagram (the UDP maximum).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 65_535;

const SIP_VERSION: &str = "SIP/2.0";

/// Parses a datagram into a request or response, dispatching on the start
/// line. Returns `None` for anything malformed; the caller drops the
/// datagram and carries on.
pub fn parse_message(datagram: &Bytes) -> Option<SipMessage> {
    let head = head_str(datagram)?;
    let first = head.split("\r\n").next()?.trim_start();
    if first.starts_with(SIP_VERSION) {
        parse_response(datagram).map(SipMessage::Response)
    } else {
        parse_request(datagram).map(SipMessage::Request)
    }
}

/// Parses a SIP request from raw network bytes.
pub fn parse_request(datagram: &Bytes) -> Option<Request> {
    if datagram.len() > DEFAULT_MAX_MESSAGE_SIZE {
        return None;
    }
    let (head, body_bytes) = split_head_body(datagram)?;
    let mut lines = head.split("\r\n");
    let (method, uri) = parse_request_line(lines.next()?.trim())?;
    let headers = parse_headers(lines)?;
    // A CSeq disagreeing with the request line is a malformed message, not a
    // matching problem.
    if let Some(cseq) = headers.get("CSeq") {
        let cseq_method = cseq.split_whitespace().nth(1).map(Method::from_token);
        if cseq_method.as_ref() != Some(&method) {
            return None;
        }
    }
    let body = extract_body(body_bytes, &headers)?;
    Some(Request::new(RequestLine::new(method, uri), headers, body))
}

/// Parses a SIP response from raw network bytes.
pub fn parse_response(datagram: &Bytes) -> Option<Response> {
    if datagram.len() > DEFAULT_MAX_MESSAGE_SIZE {
        return None;
    }
    let (head, body_bytes) = split_head_body(datagram)?;
    let mut lines = head.split("\r\n");
    let start = parse_status_line(lines.next()?.trim())?;
    let headers = parse_headers(lines)?;
    let body = extract_body(body_bytes, &headers)?;
    Some(Response::new(start, headers, body))
}

/// Serializes a request, appending `Content-Length` when the builder left it
/// out, so stream transports can frame the message.
pub fn serialize_request(req: &Request) -> Bytes {
    let mut out = BytesMut::with_capacity(256 + req.body.len());
    out.put_slice(req.start.method.as_str().as_bytes());
    out.put_u8(b' ');
    out.put_slice(req.start.uri.as_bytes());
    out.put_u8(b' ');
    out.put_slice(SIP_VERSION.as_bytes());
    out.put_slice(b"\r\n");
    write_headers_and_body(&mut out, &req.headers, &req.body);
    out.freeze()
}

/// Serializes a response, appending `Content-Length` when absent.
pub fn serialize_response(res: &Response) -> Bytes {
    let mut out = BytesMut::with_capacity(256 + res.body.len());
    out.put_slice(SIP_VERSION.as_bytes());
    out.put_u8(b' ');
    out.put_slice(res.start.code.to_string().as_bytes());
    out.put_u8(b' ');
    out.put_slice(res.start.reason.as_bytes());
    out.put_slice(b"\r\n");
    write_headers_and_body(&mut out, &res.headers, &res.body);
    out.freeze()
}

fn write_headers_and_body(out: &mut BytesMut, headers: &Headers, body: &Bytes) {
    for header in headers {
        out.put_slice(header.name.as_bytes());
        out.put_slice(b": ");
        out.put_slice(header.value.as_bytes());
        out.put_slice(b"\r\n");
    }
    if !headers.contains("Content-Length") {
        out.put_slice(b"Content-Length: ");
        out.put_slice(body.len().to_string().as_bytes());
        out.put_slice(b"\r\n");
    }
    out.put_slice(b"\r\n");
    out.put_slice(body);
}

/// Returns the header section as UTF-8, without requiring the body to be
/// text.
fn head_str(datagram: &Bytes) -> Option<&str> {
    let end = memmem::find(datagram, b"\r\n\r\n").unwrap_or(datagram.len());
    std::str::from_utf8(&datagram[..end]).ok()
}

fn split_head_body(datagram: &Bytes) -> Option<(&str, &[u8])> {
    match memmem::find(datagram, b"\r\n\r\n") {
        Some(pos) => {
            let head = std::str::from_utf8(&datagram[..pos]).ok()?;
            Some((head, &datagram[pos + 4..]))
        }
        // Tolerate datagrams that end right after the last header line.
        None => {
            let head = std::str::from_utf8(datagram).ok()?;
            Some((head.trim_end_matches("\r\n"), &[]))
        }
    }
}

fn parse_request_line(line: &str) -> Option<(Method, SmolStr)> {
    let mut parts = line.split_whitespace();
    let method = Method::from_token(parts.next()?);
    let uri = SmolStr::new(parts.next()?);
    let version = parts.next()?;
    if version != SIP_VERSION {
        return None;
    }
    Some((method, uri))
}

fn parse_status_line(line: &str) -> Option<StatusLine> {
    let rest = line.strip_prefix(SIP_VERSION)?.trim_start();
    let mut parts = rest.splitn(2, ' ');
    let code: u16 = parts.next()?.parse().ok()?;
    if !(100..=699).contains(&code) {
        return None;
    }
    let reason = parts.next().unwrap_or("").trim();
    Some(StatusLine::new(code, reason))
}

fn parse_headers<'a>(lines: impl Iterator<Item = &'a str>) -> Option<Headers> {
    let mut headers = Headers::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let colon = line.find(':')?;
        let name = line[..colon].trim();
        let value = line[colon + 1..].trim();
        if name.is_empty() {
            return None;
        }
        headers.push(SmolStr::new(name), SmolStr::new(value));
    }
    Some(headers)
}

fn extract_body(body_bytes: &[u8], headers: &Headers) -> Option<Bytes> {
    match headers.get("Content-Length") {
        Some(value) => {
            let len: usize = value.trim().parse().ok()?;
            if len > body_bytes.len() {
                // Truncated datagram.
                return None;
            }
            Some(Bytes::copy_from_slice(&body_bytes[..len]))
        }
        None => Some(Bytes::copy_from_slice(body_bytes)),
    }
}
