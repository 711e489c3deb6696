// weir-rs - The Weir SIP Stack
// SPDX-License-Identifier: Apache-2.0 OR MIT

use bytes::Bytes;
use smol_str::SmolStr;

use crate::{headers::Headers, method::Method};

/// RFC 3261 magic cookie that prefixes every compliant Via branch.
pub const MAGIC_COOKIE: &str = "z9hG4bK";

/// First line of a SIP request: `Method SP Request-URI SP SIP-Version`.
///
/// The Request-URI is carried as an opaque token; URI grammar belongs to the
/// layers above and below this stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestLine {
    pub method: Method,
    pub uri: SmolStr,
}

impl RequestLine {
    pub fn new(method: Method, uri: impl Into<SmolStr>) -> Self {
        Self {
            method,
            uri: uri.into(),
        }
    }
}

/// First line of a SIP response: `SIP-Version SP Status-Code SP Reason`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusLine {
    pub code: u16,
    pub reason: SmolStr,
}

impl StatusLine {
    /// Creates a status line. SIP status codes occupy 100..=699.
    pub fn new(code: u16, reason: impl Into<SmolStr>) -> Self {
        debug_assert!((100..=699).contains(&code), "status code out of range");
        Self {
            code,
            reason: reason.into(),
        }
    }
}

/// In-memory representation of a SIP request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub start: RequestLine,
    pub headers: Headers,
    pub body: Bytes,
}

impl Request {
    pub fn new(start: RequestLine, headers: Headers, body: Bytes) -> Self {
        Self {
            start,
            headers,
            body,
        }
    }

    /// Returns the request method.
    pub fn method(&self) -> &Method {
        &self.start.method
    }

    /// Returns the topmost Via header value, if present.
    pub fn top_via(&self) -> Option<&SmolStr> {
        self.headers.get("Via")
    }

    /// Returns the branch parameter of the top Via, provided it carries the
    /// RFC 3261 magic cookie. Cookieless branches are treated as absent.
    pub fn branch(&self) -> Option<SmolStr> {
        branch_from_via(self.top_via()?).map(SmolStr::new)
    }

    /// Returns the transport token of the top Via (`UDP`, `TCP`, `TLS`, ...).
    pub fn top_via_protocol(&self) -> Option<SmolStr> {
        transport_from_via(self.top_via()?).map(SmolStr::new)
    }

    /// Returns the method named in the CSeq header.
    pub fn cseq_method(&self) -> Option<Method> {
        cseq_method(&self.headers)
    }

    /// Returns the sequence number from the CSeq header.
    pub fn cseq_number(&self) -> Option<u32> {
        let cseq = self.headers.get("CSeq")?;
        cseq.split_whitespace().next()?.parse().ok()
    }
}

/// In-memory representation of a SIP response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub start: StatusLine,
    pub headers: Headers,
    pub body: Bytes,
}

impl Response {
    pub fn new(start: StatusLine, headers: Headers, body: Bytes) -> Self {
        Self {
            start,
            headers,
            body,
        }
    }

    /// Returns the status code.
    pub fn code(&self) -> u16 {
        self.start.code
    }

    /// Returns `true` for 1xx responses.
    pub fn is_provisional(&self) -> bool {
        self.start.code < 200
    }

    /// Returns `true` for responses with code >= 200.
    pub fn is_final(&self) -> bool {
        self.start.code >= 200
    }

    /// Returns `true` for 2xx responses.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.start.code)
    }

    /// Returns the topmost Via header value, if present.
    pub fn top_via(&self) -> Option<&SmolStr> {
        self.headers.get("Via")
    }

    /// Returns the cookie-prefixed branch of the top Via, if any.
    pub fn branch(&self) -> Option<SmolStr> {
        branch_from_via(self.top_via()?).map(SmolStr::new)
    }

    /// Returns the method named in the CSeq header. Responses are matched to
    /// client transactions by branch plus this method.
    pub fn cseq_method(&self) -> Option<Method> {
        cseq_method(&self.headers)
    }
}

/// Either a SIP request or a SIP response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SipMessage {
    Request(Request),
    Response(Response),
}

impl SipMessage {
    pub fn is_request(&self) -> bool {
        matches!(self, Self::Request(_))
    }

    pub fn is_response(&self) -> bool {
        matches!(self, Self::Response(_))
    }

    pub fn as_request(&self) -> Option<&Request> {
        match self {
            Self::Request(req) => Some(req),
            _ => None,
        }
    }

    pub fn as_response(&self) -> Option<&Response> {
        match self {
            Self::Response(res) => Some(res),
            _ => None,
        }
    }
}

/// Builds a response for the given request, echoing the header fields RFC
/// 3261 §8.2.6.2 requires: all Via values in order, From, To, Call-ID and
/// CSeq. Used by server transactions for 100 Trying and by TUs for
/// everything else.
pub fn create_response(request: &Request, code: u16, reason: &str) -> Response {
    let mut headers = Headers::new();
    for via in request.headers.get_all("Via") {
        headers.push("Via", via.clone());
    }
    for name in ["From", "To", "Call-ID", "CSeq"] {
        if let Some(value) = request.headers.get(name) {
            headers.push(name, value.clone());
        }
    }
    headers.push("Content-Length", "0");

    Response::new(StatusLine::new(code, reason), headers, Bytes::new())
}

/// Extracts the `branch=` parameter from a Via header value, returning it
/// only when it starts with the RFC 3261 magic cookie.
pub fn branch_from_via(via: &str) -> Option<&str> {
    via.split(';').skip(1).find_map(|part| {
        let mut split = part.splitn(2, '=');
        let name = split.next()?.trim();
        let value = split.next()?.trim();
        if name.eq_ignore_ascii_case("branch") && value.starts_with(MAGIC_COOKIE) {
            Some(value)
        } else {
            None
        }
    })
}

/// Extracts the transport token from a Via sent-protocol
/// (`SIP/2.0/UDP host;...` yields `UDP`).
pub fn transport_from_via(via: &str) -> Option<&str> {
    let sent_protocol = via.split_whitespace().next()?;
    let mut parts = sent_protocol.split('/');
    let _name = parts.next()?;
    let _version = parts.next()?;
    parts.next()
}

fn cseq_method(headers: &Headers) -> Option<Method> {
    let cseq = headers.get("CSeq")?;
    let token = cseq.split_whitespace().nth(1)?;
    Some(Method::from_token(token))
}
