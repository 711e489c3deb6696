// weir-rs - The Weir SIP Stack
// SPDX-License-Identifier: Apache-2.0 OR MIT

use std::sync::atomic::{AtomicU64, Ordering};

/// Receive-side counters for one listener loop.
///
/// Created by whoever wires a listener up and shared with it as an explicit
/// collaborator; there is no process-wide sink. Counters use relaxed
/// atomics, cheap enough to bump on every datagram.
#[derive(Debug, Default)]
pub struct TransportStats {
    datagrams_received: AtomicU64,
    datagrams_truncated: AtomicU64,
    recv_errors: AtomicU64,
    sessions_accepted: AtomicU64,
    frames_received: AtomicU64,
    framing_errors: AtomicU64,
}

/// A point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub datagrams_received: u64,
    pub datagrams_truncated: u64,
    pub recv_errors: u64,
    pub sessions_accepted: u64,
    pub frames_received: u64,
    pub framing_errors: u64,
}

impl TransportStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_datagram(&self) {
        self.datagrams_received.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_truncated(&self) {
        self.datagrams_truncated.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_recv_error(&self) {
        self.recv_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_session(&self) {
        self.sessions_accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_frame(&self) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_framing_error(&self) {
        self.framing_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Takes a snapshot of the current counters.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            datagrams_received: self.datagrams_received.load(Ordering::Relaxed),
            datagrams_truncated: self.datagrams_truncated.load(Ordering::Relaxed),
            recv_errors: self.recv_errors.load(Ordering::Relaxed),
            sessions_accepted: self.sessions_accepted.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            framing_errors: self.framing_errors.load(Ordering::Relaxed),
        }
    }

    /// Emits the counters as one structured tracing event, labelled with the
    /// listener they belong to.
    pub fn log_summary(&self, listener: &str) {
        let snap = self.snapshot();
        tracing::info!(
            listener,
            datagrams = snap.datagrams_received,
            truncated = snap.datagrams_truncated,
            recv_errors = snap.recv_errors,
            sessions = snap.sessions_accepted,
            frames = snap.frames_received,
            framing_errors = snap.framing_errors,
            "transport stats"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate_into_snapshot() {
        let stats = TransportStats::new();
        stats.record_datagram();
        stats.record_datagram();
        stats.record_truncated();
        stats.record_session();
        stats.record_frame();
        stats.record_framing_error();

        let snap = stats.snapshot();
        assert_eq!(snap.datagrams_received, 2);
        assert_eq!(snap.datagrams_truncated, 1);
        assert_eq!(snap.recv_errors, 0);
        assert_eq!(snap.sessions_accepted, 1);
        assert_eq!(snap.frames_received, 1);
        assert_eq!(snap.framing_errors, 1);
    }

    #[test]
    fn fresh_stats_snapshot_is_zeroed() {
        assert_eq!(TransportStats::new().snapshot(), StatsSnapshot::default());
    }
}
