// weir-rs - The Weir SIP Stack
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Minimal answering UA over loopback UDP: one manager acts as the UAS and
//! replies 200 OK, another acts as the UAC and originates an OPTIONS
//! transaction toward it.
//!
//! Run with `cargo run -p weir-transaction --example udp_loopback`.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::info;
use weir_core::{create_response, Headers, Method, Request, RequestLine, Response};
use weir_transaction::{
    generate_branch_id, ServerTransactionHandle, TransactionKey, TransactionManager,
    TransactionUser, TransportContext, TransportDispatcher,
};
use weir_transport::{
    buffer::BufferPool, run_udp, send_stream, send_udp, stats::TransportStats, InboundPacket,
};
use weir_wire::parse_message;

struct SocketDispatcher {
    socket: Arc<UdpSocket>,
}

#[async_trait]
impl TransportDispatcher for SocketDispatcher {
    async fn dispatch(&self, ctx: &TransportContext, payload: Bytes) -> Result<()> {
        match &ctx.stream {
            Some(writer) => send_stream(writer, payload).await,
            None => send_udp(&self.socket, &ctx.peer, &payload).await,
        }
    }
}

struct Answerer;

#[async_trait]
impl TransactionUser for Answerer {
    async fn on_incoming_request(&self, request: Request, handle: ServerTransactionHandle) {
        info!(method = %request.method(), "uas: incoming request, answering 200");
        handle
            .send_final(create_response(&request, 200, "OK"))
            .await;
    }
}

struct Caller {
    done: mpsc::Sender<u16>,
}

#[async_trait]
impl TransactionUser for Caller {
    async fn on_provisional(&self, _key: &TransactionKey, response: &Response) {
        info!(code = response.code(), "uac: provisional");
    }

    async fn on_final(&self, _key: &TransactionKey, response: &Response) {
        info!(code = response.code(), "uac: final");
        let _ = self.done.send(response.code()).await;
    }

    async fn on_timeout(&self, key: &TransactionKey) {
        info!(branch = %key.branch, "uac: transaction timed out");
        let _ = self.done.send(0).await;
    }
}

fn spawn_endpoint(socket: Arc<UdpSocket>, manager: TransactionManager) -> Arc<TransportStats> {
    let pool = Arc::new(BufferPool::with_capacity(8));
    let stats = Arc::new(TransportStats::new());
    let (tx, mut rx) = mpsc::channel::<InboundPacket>(64);
    tokio::spawn(run_udp(socket, pool, stats.clone(), tx));
    tokio::spawn(async move {
        while let Some(packet) = rx.recv().await {
            let Some(message) = parse_message(&packet.payload) else {
                continue;
            };
            let ctx = TransportContext::new(packet.transport, packet.peer, packet.stream);
            manager.receive(message, ctx).await;
        }
    });
    stats
}

fn build_options(target: &str) -> Request {
    let mut headers = Headers::new();
    headers.push(
        "Via",
        format!("SIP/2.0/UDP 127.0.0.1:0;branch={}", generate_branch_id()),
    );
    headers.push("From", "<sip:uac@127.0.0.1>;tag=loop");
    headers.push("To", format!("<{target}>"));
    headers.push("Call-ID", "loopback@127.0.0.1");
    headers.push("CSeq", "1 OPTIONS");
    headers.push("Max-Forwards", "70");
    headers.push("Content-Length", "0");
    Request::new(RequestLine::new(Method::Options, target), headers, Bytes::new())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let uas_socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await?);
    let uas_addr = uas_socket.local_addr()?;
    let uas = TransactionManager::new(
        Arc::new(SocketDispatcher {
            socket: uas_socket.clone(),
        }),
        Arc::new(Answerer),
    );
    let uas_stats = spawn_endpoint(uas_socket, uas);
    info!(%uas_addr, "uas listening");

    let uac_socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await?);
    let (done_tx, mut done_rx) = mpsc::channel(1);
    let caller = Arc::new(Caller { done: done_tx });
    let uac = TransactionManager::new(
        Arc::new(SocketDispatcher {
            socket: uac_socket.clone(),
        }),
        caller.clone(),
    );
    let uac_stats = spawn_endpoint(uac_socket, uac.clone());

    let ctx = TransportContext::new(weir_transport::TransportKind::Udp, uas_addr, None);
    uac.start_client_transaction(build_options("sip:uas@127.0.0.1"), ctx, caller)
        .await?;

    match tokio::time::timeout(Duration::from_secs(5), done_rx.recv()).await {
        Ok(Some(code)) if code >= 200 => info!(code, "transaction completed"),
        Ok(Some(_)) => anyhow::bail!("transaction timed out"),
        _ => anyhow::bail!("no answer within 5s"),
    }
    uas_stats.log_summary("uas");
    uac_stats.log_summary("uac");
    Ok(())
}
