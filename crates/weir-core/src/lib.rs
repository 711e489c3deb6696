// weir-rs - The Weir SIP Stack
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Core SIP message types.
//!
//! This crate holds the in-memory representation of SIP requests and
//! responses together with the small read-only view the transaction layer
//! consumes: method, status code, top-Via branch and transport, and the
//! CSeq method. Parsing and serialization live in `weir-wire`; header and
//! URI grammars beyond what transaction matching needs are out of scope.

pub mod headers;
pub mod method;
pub mod msg;

pub use headers::{Header, Headers};
pub use method::Method;
pub use msg::{
    branch_from_via, create_response, transport_from_via, Request, RequestLine, Response,
    SipMessage, StatusLine, MAGIC_COOKIE,
};
