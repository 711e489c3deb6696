// weir-rs - The Weir SIP Stack
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Async SIP transports for UDP and TCP.
//!
//! Receive loops forward every datagram or stream frame as an
//! [`InboundPacket`] on an mpsc channel; the transaction layer parses and
//! routes from there. UDP receives draw fixed-size buffers from a
//! [`buffer::BufferPool`]; TCP frames messages by `Content-Length`. Each
//! loop bumps the [`stats::TransportStats`] it was given, so the embedding
//! application owns its counters instead of a process-wide sink.
//!
//! # Example
//! ```no_run
//! use std::sync::Arc;
//! use tokio::net::UdpSocket;
//! use tokio::sync::mpsc;
//! use weir_transport::{buffer::BufferPool, run_udp, stats::TransportStats, InboundPacket};
//! # async fn example() -> anyhow::Result<()> {
//! let socket = Arc::new(UdpSocket::bind("0.0.0.0:5060").await?);
//! let pool = Arc::new(BufferPool::with_capacity(32));
//! let stats = Arc::new(TransportStats::new());
//! let (tx, mut rx) = mpsc::channel::<InboundPacket>(100);
//! tokio::spawn(run_udp(socket, pool, stats.clone(), tx));
//! while let Some(packet) = rx.recv().await {
//!     // parse and hand to the transaction manager
//! }
//! stats.log_summary("udp");
//! # Ok(())
//! # }
//! ```

pub mod buffer;
pub mod pool;
pub mod stats;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use buffer::BufferPool;
use stats::TransportStats;

/// Maximum size of SIP headers before `\r\n\r\n` (64 KB). Protects stream
/// sessions against peers that never terminate the header section.
const MAX_HEADER_SIZE: usize = 64 * 1024;

/// Maximum body size accepted from a `Content-Length` header (10 MB).
const MAX_BODY_SIZE: usize = 10 * 1024 * 1024;

/// Maximum accumulated stream buffer before the session is closed (16 MB).
pub(crate) const MAX_BUFFER_SIZE: usize = 16 * 1024 * 1024;

/// Maximum number of concurrent inbound stream sessions per listener.
const MAX_CONCURRENT_SESSIONS: usize = 1024;

/// Idle cutoff for stream sessions with no inbound data.
const SESSION_IDLE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(60);

/// Timeout for outbound TCP connection establishment.
const CONNECT_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

/// Indicates which transport carried an inbound or outbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    Udp,
    Tcp,
    Tls,
}

impl TransportKind {
    /// Returns the lowercase transport name for metrics and logging.
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Udp => "udp",
            TransportKind::Tcp => "tcp",
            TransportKind::Tls => "tls",
        }
    }

    /// Returns the Via sent-protocol token per RFC 3261.
    pub fn via_transport(&self) -> &'static str {
        match self {
            TransportKind::Udp => "UDP",
            TransportKind::Tcp => "TCP",
            TransportKind::Tls => "TLS",
        }
    }

    /// Parses a transport token (from a Via header or URI parameter).
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "udp" => Some(TransportKind::Udp),
            "tcp" => Some(TransportKind::Tcp),
            "tls" => Some(TransportKind::Tls),
            _ => None,
        }
    }

    /// Returns `true` when the substrate guarantees delivery (TCP, TLS).
    /// Reliable transports suppress the retransmission timers of the
    /// transaction layer.
    pub fn is_reliable(&self) -> bool {
        matches!(self, TransportKind::Tcp | TransportKind::Tls)
    }

    /// Returns `true` for connection-oriented transports.
    pub fn is_stream_based(&self) -> bool {
        matches!(self, TransportKind::Tcp | TransportKind::Tls)
    }
}

/// A packet received by a transport listener, tagged with its origin.
#[derive(Debug, Clone)]
pub struct InboundPacket {
    pub transport: TransportKind,
    pub peer: SocketAddr,
    pub payload: Bytes,
    /// Writer channel of the originating stream session, when there is one.
    /// Responses should go back down the same connection (RFC 3261 §18.2.2).
    pub stream: Option<mpsc::Sender<Bytes>>,
}

/// Runs a UDP receive loop, forwarding datagrams to the provided channel.
///
/// A buffer is taken from the pool before each receive and returned after
/// the datagram has been dispatched. Receive errors are logged and the loop
/// re-arms; only a dropped receiver ends it.
pub async fn run_udp(
    socket: Arc<UdpSocket>,
    pool: Arc<BufferPool>,
    stats: Arc<TransportStats>,
    tx: mpsc::Sender<InboundPacket>,
) -> Result<()> {
    let bind = socket.local_addr()?;
    info!(%bind, "listening (udp)");
    loop {
        let mut buf = pool.take();
        match socket.recv_from(&mut buf[..]).await {
            Ok((n, peer)) => {
                if n == buf.len() {
                    stats.record_truncated();
                    error!(%peer, max = n, "udp datagram likely truncated (buffer full)");
                }
                stats.record_datagram();
                let packet = InboundPacket {
                    transport: TransportKind::Udp,
                    peer,
                    payload: Bytes::copy_from_slice(&buf[..n]),
                    stream: None,
                };
                let delivered = tx.send(packet).await;
                pool.put(buf);
                if delivered.is_err() {
                    error!("receiver dropped; shutting down udp loop");
                    break;
                }
            }
            Err(e) => {
                pool.put(buf);
                stats.record_recv_error();
                error!(%e, "udp recv_from error");
            }
        }
    }
    Ok(())
}

/// Sends a UDP datagram using an existing bound socket.
pub async fn send_udp(socket: &UdpSocket, to: &SocketAddr, data: &[u8]) -> Result<()> {
    socket.send_to(data, to).await?;
    Ok(())
}

/// Accepts TCP connections, streaming complete SIP frames to the channel.
pub async fn run_tcp(
    bind: &str,
    stats: Arc<TransportStats>,
    tx: mpsc::Sender<InboundPacket>,
) -> Result<()> {
    let listener = TcpListener::bind(bind).await?;
    info!(%bind, "listening (tcp)");
    let limiter = Arc::new(tokio::sync::Semaphore::new(MAX_CONCURRENT_SESSIONS));

    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                stats.record_recv_error();
                error!(%e, "tcp accept error");
                continue;
            }
        };
        let permit = match limiter.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                warn!(%peer, "tcp session limit reached; dropping connection");
                continue;
            }
        };
        stats.record_session();
        let tx = tx.clone();
        let stats = stats.clone();
        tokio::spawn(async move {
            let _permit = permit;
            run_stream_session(peer, stream, TransportKind::Tcp, stats, tx).await;
        });
    }
}

/// Connects to the destination and writes the bytes over a one-shot TCP
/// connection. Prefer [`pool::ConnectionPool`] for reusable connections.
pub async fn send_tcp(to: &SocketAddr, data: &[u8]) -> Result<()> {
    let mut stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(to))
        .await
        .map_err(|_| anyhow!("tcp connect timeout after {:?} to {}", CONNECT_TIMEOUT, to))??;
    stream.write_all(data).await?;
    Ok(())
}

/// Sends buffered bytes via a per-connection writer channel.
pub async fn send_stream(writer: &mpsc::Sender<Bytes>, data: Bytes) -> Result<()> {
    writer
        .send(data)
        .await
        .map_err(|_| anyhow!("connection writer dropped"))?;
    Ok(())
}

async fn run_stream_session(
    peer: SocketAddr,
    stream: TcpStream,
    transport: TransportKind,
    stats: Arc<TransportStats>,
    tx: mpsc::Sender<InboundPacket>,
) {
    let (mut reader, mut writer) = tokio::io::split(stream);
    let (writer_tx, mut writer_rx) = mpsc::channel::<Bytes>(32);

    let writer_handle = tokio::spawn(async move {
        while let Some(buf) = writer_rx.recv().await {
            if let Err(e) = writer.write_all(&buf).await {
                error!(%e, "stream write error");
                break;
            }
        }
    });

    let mut buf = BytesMut::with_capacity(4096);
    loop {
        if buf.len() >= MAX_BUFFER_SIZE {
            warn!(%peer, buffer_size = buf.len(), "stream buffer overflow, closing connection");
            stats.record_framing_error();
            break;
        }

        // Idle sessions are closed so slow peers cannot hold a session slot.
        match tokio::time::timeout(SESSION_IDLE_TIMEOUT, reader.read_buf(&mut buf)).await {
            Ok(Ok(0)) => break,
            Ok(Ok(_)) => {
                match drain_sip_frames(&mut buf) {
                    Ok(frames) => {
                        for payload in frames {
                            stats.record_frame();
                            let packet = InboundPacket {
                                transport,
                                peer,
                                payload,
                                stream: Some(writer_tx.clone()),
                            };
                            if tx.send(packet).await.is_err() {
                                error!("receiver dropped; shutting down stream session");
                                return;
                            }
                        }
                    }
                    Err(e) => {
                        stats.record_framing_error();
                        warn!(%peer, %e, "sip framing error, closing connection");
                        break;
                    }
                }
            }
            Ok(Err(e)) => {
                stats.record_recv_error();
                error!(%e, "stream read error");
                break;
            }
            Err(_) => {
                warn!(%peer, timeout_secs = SESSION_IDLE_TIMEOUT.as_secs(), "stream session idle timeout");
                break;
            }
        }
    }

    drop(writer_tx);
    let _ = writer_handle.await;
}

/// Splits buffered stream data into complete SIP messages using
/// `Content-Length`, tolerating CRLF keep-alive pings (RFC 5626).
///
/// Returns an error (closing the connection) when header or body limits are
/// exceeded.
pub(crate) fn drain_sip_frames(buf: &mut BytesMut) -> Result<Vec<Bytes>> {
    let mut frames = Vec::new();
    loop {
        consume_leading_crlf(buf);
        if buf.is_empty() {
            break;
        }

        let head_end = match memchr::memmem::find(buf.as_ref(), b"\r\n\r\n") {
            Some(pos) => pos,
            None => {
                if buf.len() > MAX_HEADER_SIZE {
                    return Err(anyhow!(
                        "sip headers exceed {} bytes without terminator",
                        MAX_HEADER_SIZE
                    ));
                }
                break;
            }
        };
        if head_end > MAX_HEADER_SIZE {
            return Err(anyhow!(
                "sip headers are {} bytes, limit is {}",
                head_end,
                MAX_HEADER_SIZE
            ));
        }

        let content_length = parse_content_length(&buf[..head_end])?;
        if let Some(cl) = content_length {
            if cl > MAX_BODY_SIZE {
                return Err(anyhow!("content-length {} exceeds limit {}", cl, MAX_BODY_SIZE));
            }
        }

        // RFC 3261 §18.3 makes Content-Length mandatory on streams; a
        // missing header is treated as a zero-length body.
        let body_length = match content_length {
            Some(cl) => cl,
            None => {
                warn!("stream message missing Content-Length; assuming empty body");
                0
            }
        };

        let needed = head_end + 4 + body_length;
        if buf.len() < needed {
            break;
        }
        frames.push(buf.split_to(needed).freeze());
    }
    Ok(frames)
}

fn consume_leading_crlf(buf: &mut BytesMut) {
    while buf.starts_with(b"\r\n") || buf.starts_with(b"\n") || buf.starts_with(b"\r") {
        let skip = if buf.starts_with(b"\r\n") { 2 } else { 1 };
        buf.advance(skip);
    }
}

fn parse_content_length(headers: &[u8]) -> Result<Option<usize>> {
    let mut found: Option<usize> = None;
    for line in headers.split(|b| *b == b'\n') {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        let Some(colon) = memchr::memchr(b':', line) else {
            continue;
        };
        let name = trim_ascii(&line[..colon]);
        // "l" is the compact form of Content-Length (RFC 3261 §7.3.3).
        if !eq_ignore_case(name, b"content-length") && !eq_ignore_case(name, b"l") {
            continue;
        }
        let value = trim_ascii(&line[colon + 1..]);
        let parsed = parse_usize(value)?;
        match found {
            Some(existing) if existing != parsed => {
                return Err(anyhow!("conflicting Content-Length headers"));
            }
            _ => found = Some(parsed),
        }
    }
    Ok(found)
}

fn trim_ascii(input: &[u8]) -> &[u8] {
    let mut start = 0;
    let mut end = input.len();
    while start < end && input[start].is_ascii_whitespace() {
        start += 1;
    }
    while end > start && input[end - 1].is_ascii_whitespace() {
        end -= 1;
    }
    &input[start..end]
}

fn eq_ignore_case(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len()
        && a.iter()
            .zip(b.iter())
            .all(|(x, y)| x.eq_ignore_ascii_case(y))
}

fn parse_usize(value: &[u8]) -> Result<usize> {
    if value.is_empty() {
        return Err(anyhow!("empty Content-Length value"));
    }
    let mut acc: usize = 0;
    for &b in value {
        if !b.is_ascii_digit() {
            return Err(anyhow!("non-digit in Content-Length"));
        }
        acc = acc
            .checked_mul(10)
            .and_then(|v| v.checked_add((b - b'0') as usize))
            .ok_or_else(|| anyhow!("Content-Length overflows usize"))?;
    }
    Ok(acc)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_reliability() {
        assert!(!TransportKind::Udp.is_reliable());
        assert!(TransportKind::Tcp.is_reliable());
        assert!(TransportKind::Tls.is_reliable());
        assert!(!TransportKind::Udp.is_stream_based());
        assert!(TransportKind::Tls.is_stream_based());
    }

    #[test]
    fn transport_names_round_trip() {
        for kind in [TransportKind::Udp, TransportKind::Tcp, TransportKind::Tls] {
            assert_eq!(TransportKind::parse(kind.via_transport()), Some(kind));
            assert_eq!(TransportKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(TransportKind::parse("sctp"), None);
    }

    #[test]
    fn drains_multiple_frames_and_bodies() {
        let msg1 = b"OPTIONS sip:a SIP/2.0\r\nContent-Length: 4\r\n\r\nbody";
        let msg2 = b"SIP/2.0 200 OK\r\nContent-Length: 0\r\n\r\n";
        let payload = [msg1.as_slice(), msg2.as_slice()].concat();
        let mut buf = BytesMut::from(&payload[..]);
        let frames = drain_sip_frames(&mut buf).unwrap();
        assert_eq!(frames.len(), 2);
        assert!(buf.is_empty());
        assert_eq!(frames[0].as_ref(), msg1);
        assert_eq!(frames[1].as_ref(), msg2);
    }

    #[test]
    fn leaves_partial_body_in_buffer() {
        let payload = b"OPTIONS sip:a SIP/2.0\r\nContent-Length: 5\r\n\r\nhi";
        let mut buf = BytesMut::from(&payload[..]);
        let frames = drain_sip_frames(&mut buf).unwrap();
        assert!(frames.is_empty());
        assert_eq!(buf.len(), payload.len());
    }

    #[test]
    fn discards_crlf_keepalives() {
        let mut buf = BytesMut::from(&b"\r\n\r\n"[..]);
        let frames = drain_sip_frames(&mut buf).unwrap();
        assert!(frames.is_empty());
        assert!(buf.is_empty());

        let msg = b"\r\n\r\nOPTIONS sip:a SIP/2.0\r\nContent-Length: 0\r\n\r\n";
        let mut buf = BytesMut::from(&msg[..]);
        let frames = drain_sip_frames(&mut buf).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].as_ref(), &msg[4..]);
    }

    #[test]
    fn rejects_oversized_headers() {
        let mut headers = String::from("OPTIONS sip:a SIP/2.0\r\nX-Pad: ");
        headers.push_str(&"A".repeat(70 * 1024));
        headers.push_str("\r\n\r\n");
        let mut buf = BytesMut::from(headers.as_bytes());
        assert!(drain_sip_frames(&mut buf).is_err());
    }

    #[test]
    fn rejects_oversized_content_length() {
        let msg = format!(
            "OPTIONS sip:a SIP/2.0\r\nContent-Length: {}\r\n\r\n",
            MAX_BODY_SIZE + 1
        );
        let mut buf = BytesMut::from(msg.as_bytes());
        assert!(drain_sip_frames(&mut buf).is_err());
    }

    #[test]
    fn rejects_conflicting_content_lengths() {
        let msg = b"OPTIONS sip:a SIP/2.0\r\nContent-Length: 4\r\nContent-Length: 5\r\n\r\nbody";
        let mut buf = BytesMut::from(&msg[..]);
        assert!(drain_sip_frames(&mut buf).is_err());
    }

    #[test]
    fn parses_compact_content_length() {
        let msg = b"OPTIONS sip:a SIP/2.0\r\nl: 4\r\n\r\nbody";
        let mut buf = BytesMut::from(&msg[..]);
        let frames = drain_sip_frames(&mut buf).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].as_ref(), msg.as_slice());
    }

    #[test]
    fn missing_content_length_assumes_empty_body() {
        let msg = b"OPTIONS sip:a SIP/2.0\r\nVia: SIP/2.0/TCP host\r\n\r\n";
        let mut buf = BytesMut::from(&msg[..]);
        let frames = drain_sip_frames(&mut buf).unwrap();
        assert_eq!(frames.len(), 1);
    }

    #[tokio::test]
    async fn udp_round_trip_through_pool() {
        let server = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let server_addr = server.local_addr().unwrap();
        let pool = Arc::new(BufferPool::with_capacity(2));
        let stats = Arc::new(TransportStats::new());
        let (tx, mut rx) = mpsc::channel(8);
        tokio::spawn(run_udp(server.clone(), pool.clone(), stats.clone(), tx));

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        send_udp(&client, &server_addr, b"OPTIONS sip:a SIP/2.0\r\n\r\n")
            .await
            .unwrap();

        let packet = rx.recv().await.expect("packet");
        assert_eq!(packet.transport, TransportKind::Udp);
        assert_eq!(packet.payload.as_ref(), b"OPTIONS sip:a SIP/2.0\r\n\r\n");
        assert_eq!(packet.peer, client.local_addr().unwrap());

        let snap = stats.snapshot();
        assert_eq!(snap.datagrams_received, 1);
        assert_eq!(snap.datagrams_truncated, 0);
        assert_eq!(snap.recv_errors, 0);
    }
}
