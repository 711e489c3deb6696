// weir-rs - The Weir SIP Stack
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Test harness for the Weir stack.
//!
//! Builders produce the canonical requests the integration tests drive
//! through the transaction layer; [`CapturingDispatcher`] and
//! [`RecordingUser`] stand in for the transport and the TU so tests can
//! assert on the exact ordered action trace.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Mutex;
use weir_core::{Headers, Method, Request, RequestLine, Response, SipMessage};
use weir_transaction::{
    ServerTransactionHandle, TransactionKey, TransactionUser, TransportContext,
    TransportDispatcher,
};
use weir_wire::parse_message;

/// Constructs a minimal OPTIONS request with the provided branch.
pub fn build_options(uri: &str, branch: &str) -> Request {
    build_request(Method::Options, uri, branch, "options-callid@example.com")
}

/// Constructs a minimal INVITE request.
pub fn build_invite(uri: &str, branch: &str, call_id: &str) -> Request {
    build_request(Method::Invite, uri, branch, call_id)
}

/// Constructs a request of the given method with a full canonical header
/// set: Via (with branch), From, To, Call-ID, CSeq, Max-Forwards and
/// Content-Length.
pub fn build_request(method: Method, uri: &str, branch: &str, call_id: &str) -> Request {
    let mut headers = Headers::new();
    headers.push(
        "Via",
        format!("SIP/2.0/UDP client.example.com:5060;branch={branch}"),
    );
    headers.push("From", "<sip:alice@example.com>;tag=1234");
    headers.push("To", "<sip:bob@example.com>");
    headers.push("Call-ID", call_id);
    headers.push("CSeq", format!("1 {}", method.as_str()));
    headers.push("Max-Forwards", "70");
    headers.push("Content-Length", "0");
    Request::new(RequestLine::new(method, uri), headers, Bytes::new())
}

/// A dispatcher that records every outbound payload instead of sending it.
#[derive(Default)]
pub struct CapturingDispatcher {
    sent: Mutex<Vec<Bytes>>,
}

impl CapturingDispatcher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Number of payloads dispatched so far.
    pub async fn sent_count(&self) -> usize {
        self.sent.lock().await.len()
    }

    /// Every dispatched payload, reparsed, in send order.
    pub async fn sent_messages(&self) -> Vec<SipMessage> {
        self.sent
            .lock()
            .await
            .iter()
            .map(|bytes| parse_message(bytes).expect("dispatched bytes must be valid SIP"))
            .collect()
    }

    /// Status codes of dispatched responses, in send order.
    pub async fn sent_response_codes(&self) -> Vec<u16> {
        self.sent_messages()
            .await
            .iter()
            .filter_map(|m| m.as_response().map(|r| r.code()))
            .collect()
    }

    /// Methods of dispatched requests, in send order.
    pub async fn sent_request_methods(&self) -> Vec<Method> {
        self.sent_messages()
            .await
            .iter()
            .filter_map(|m| m.as_request().map(|r| r.method().clone()))
            .collect()
    }
}

#[async_trait]
impl TransportDispatcher for CapturingDispatcher {
    async fn dispatch(&self, _ctx: &TransportContext, payload: Bytes) -> Result<()> {
        self.sent.lock().await.push(payload);
        Ok(())
    }
}

/// A TU that records every callback it receives.
#[derive(Default)]
pub struct RecordingUser {
    incoming: Mutex<Vec<(Request, ServerTransactionHandle)>>,
    provisional: Mutex<Vec<u16>>,
    finals: Mutex<Vec<u16>>,
    timeouts: Mutex<Vec<TransactionKey>>,
    transport_failures: Mutex<Vec<TransactionKey>>,
    terminated: Mutex<Vec<TransactionKey>>,
}

impl RecordingUser {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn incoming_count(&self) -> usize {
        self.incoming.lock().await.len()
    }

    /// Handle of the n-th incoming request seen so far.
    pub async fn handle(&self, index: usize) -> ServerTransactionHandle {
        self.incoming.lock().await[index].1.clone()
    }

    pub async fn provisional_codes(&self) -> Vec<u16> {
        self.provisional.lock().await.clone()
    }

    pub async fn final_codes(&self) -> Vec<u16> {
        self.finals.lock().await.clone()
    }

    pub async fn timeout_count(&self) -> usize {
        self.timeouts.lock().await.len()
    }

    pub async fn transport_failure_count(&self) -> usize {
        self.transport_failures.lock().await.len()
    }

    pub async fn terminated_keys(&self) -> Vec<TransactionKey> {
        self.terminated.lock().await.clone()
    }

}

#[async_trait]
impl TransactionUser for RecordingUser {
    async fn on_incoming_request(&self, request: Request, handle: ServerTransactionHandle) {
        self.incoming.lock().await.push((request, handle));
    }

    async fn on_provisional(&self, _key: &TransactionKey, response: &Response) {
        self.provisional.lock().await.push(response.code());
    }

    async fn on_final(&self, _key: &TransactionKey, response: &Response) {
        self.finals.lock().await.push(response.code());
    }

    async fn on_timeout(&self, key: &TransactionKey) {
        self.timeouts.lock().await.push(key.clone());
    }

    async fn on_transport_failure(&self, key: &TransactionKey) {
        self.transport_failures.lock().await.push(key.clone());
    }

    async fn on_terminated(&self, key: &TransactionKey) {
        self.terminated.lock().await.push(key.clone());
    }
}
