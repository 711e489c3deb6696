// weir-rs - The Weir SIP Stack
// SPDX-License-Identifier: Apache-2.0 OR MIT

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    sync::{
        mpsc::{self, Sender},
        Mutex,
    },
};
use tracing::{debug, warn};

use crate::{drain_sip_frames, InboundPacket, TransportKind, MAX_BUFFER_SIZE};

/// Maximum number of pooled TCP connections.
const MAX_POOL_SIZE: usize = 1000;

/// Pooled connections idle longer than this are closed.
const IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Connection entry with activity tracking for eviction.
#[derive(Debug)]
struct PoolEntry {
    sender: Sender<Bytes>,
    last_used: Instant,
    task_handles: Vec<tokio::task::AbortHandle>,
}

impl Drop for PoolEntry {
    fn drop(&mut self) {
        for handle in &self.task_handles {
            handle.abort();
        }
    }
}

impl PoolEntry {
    fn new(sender: Sender<Bytes>) -> Self {
        Self {
            sender,
            last_used: Instant::now(),
            task_handles: Vec::new(),
        }
    }

    fn touch(&mut self) {
        self.last_used = Instant::now();
    }

    fn is_idle(&self, timeout: Duration) -> bool {
        self.last_used.elapsed() > timeout
    }
}

/// Outbound TCP connection pool with idle cleanup and LRU eviction.
///
/// Retransmissions of a request must reuse the connection the transaction
/// first sent on; pooling by peer address gives that without threading
/// writer channels through the transaction records.
#[derive(Debug)]
pub struct ConnectionPool {
    tcp: DashMap<SocketAddr, PoolEntry>,
    max_size: usize,
    idle_timeout: Duration,
    inbound_tx: Arc<Mutex<Option<Sender<InboundPacket>>>>,
}

impl Default for ConnectionPool {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionPool {
    pub fn new() -> Self {
        Self::with_limits(MAX_POOL_SIZE, IDLE_TIMEOUT)
    }

    /// Creates a pool with custom limits.
    pub fn with_limits(max_size: usize, idle_timeout: Duration) -> Self {
        Self {
            tcp: DashMap::new(),
            max_size,
            idle_timeout,
            inbound_tx: Arc::new(Mutex::new(None)),
        }
    }

    /// Registers an inbound packet sink so responses arriving on outbound
    /// TCP connections get routed back to the transaction layer.
    pub async fn set_inbound_tx(&self, tx: Sender<InboundPacket>) {
        let mut guard = self.inbound_tx.lock().await;
        *guard = Some(tx);
    }

    /// Returns the current number of pooled connections.
    pub fn len(&self) -> usize {
        self.tcp.len()
    }

    /// Returns `true` if the pool is empty.
    pub fn is_empty(&self) -> bool {
        self.tcp.is_empty()
    }

    /// Removes idle connections, returning how many were closed.
    pub fn cleanup_idle(&self) -> usize {
        let mut removed = 0;
        self.tcp.retain(|addr, entry| {
            if entry.is_idle(self.idle_timeout) {
                debug!(peer = %addr, "removing idle connection");
                removed += 1;
                false
            } else {
                true
            }
        });
        removed
    }

    /// Evicts roughly 10% of capacity, oldest first.
    fn evict_lru(&self) {
        let evict_count = (self.max_size / 10).max(1);
        let mut entries: Vec<_> = self
            .tcp
            .iter()
            .map(|entry| (*entry.key(), entry.value().last_used))
            .collect();
        entries.sort_by_key(|(_, last_used)| *last_used);
        for (addr, _) in entries.iter().take(evict_count) {
            debug!(peer = %addr, "evicting LRU connection");
            self.tcp.remove(addr);
        }
    }

    /// Sends bytes over a pooled TCP connection, opening one if missing.
    pub async fn send_tcp(&self, addr: SocketAddr, payload: Bytes) -> Result<()> {
        if let Some(mut entry) = self.tcp.get_mut(&addr) {
            entry.touch();
            if entry.sender.send(payload.clone()).await.is_ok() {
                return Ok(());
            }
            // Writer gone; drop the stale entry and reconnect.
            drop(entry);
            self.tcp.remove(&addr);
        }

        if self.tcp.len() >= self.max_size {
            self.cleanup_idle();
            if self.tcp.len() >= self.max_size {
                self.evict_lru();
            }
        }

        let stream = tokio::time::timeout(Duration::from_secs(5), TcpStream::connect(addr))
            .await
            .map_err(|_| anyhow!("tcp pool connect timeout to {}", addr))??;
        let (mut reader, mut writer) = stream.into_split();
        let (tx, mut rx) = mpsc::channel::<Bytes>(64);
        let mut entry = PoolEntry::new(tx.clone());

        let writer_handle = tokio::spawn(async move {
            while let Some(buf) = rx.recv().await {
                if writer.write_all(&buf).await.is_err() {
                    break;
                }
            }
        });
        entry.task_handles.push(writer_handle.abort_handle());

        // Reader task: frames inbound data and forwards it to the
        // registered sink. Without a sink the peer's responses are dropped.
        let inbound_tx = self.inbound_tx.lock().await.clone();
        let stream_tx = tx.clone();
        let reader_handle = tokio::spawn(async move {
            let mut buf = BytesMut::with_capacity(4096);
            loop {
                if buf.len() >= MAX_BUFFER_SIZE {
                    warn!(peer = %addr, "pooled connection buffer overflow");
                    break;
                }
                match reader.read_buf(&mut buf).await {
                    Ok(0) => break,
                    Ok(_) => {
                        let frames = match drain_sip_frames(&mut buf) {
                            Ok(frames) => frames,
                            Err(e) => {
                                warn!(peer = %addr, %e, "framing error on pooled connection");
                                break;
                            }
                        };
                        if let Some(sink) = inbound_tx.as_ref() {
                            for payload in frames {
                                let packet = InboundPacket {
                                    transport: TransportKind::Tcp,
                                    peer: addr,
                                    payload,
                                    stream: Some(stream_tx.clone()),
                                };
                                if sink.send(packet).await.is_err() {
                                    return;
                                }
                            }
                        }
                    }
                    Err(e) => {
                        debug!(peer = %addr, %e, "pooled connection read error");
                        break;
                    }
                }
            }
        });
        entry.task_handles.push(reader_handle.abort_handle());

        entry
            .sender
            .send(payload)
            .await
            .map_err(|_| anyhow!("pooled connection writer closed"))?;
        self.tcp.insert(addr, entry);
        Ok(())
    }
}
