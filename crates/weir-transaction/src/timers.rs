// weir-rs - The Weir SIP Stack
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Transport-aware timer durations per RFC 3261 §17.
//!
//! Retransmission exists to paper over datagram loss, so the timers split by
//! how reliable the wire is:
//!
//! - the retransmission timers A, E and G never arm on reliable transports;
//! - the cleanup timers D, I, J and K collapse to zero on reliable
//!   transports (they arm and fire immediately, so the transaction leaves
//!   its wait state in the next manager step);
//! - the timeout timers B, F and H run at 64·T1 everywhere.

use std::time::Duration;

use crate::TransactionTimer;

/// Transport class used for timer calculations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    /// Unreliable datagram transport; full timer set applies.
    Udp,
    /// Reliable stream transport; retransmission timers are suppressed.
    Tcp,
    /// Reliable secure stream transport; treated like TCP.
    Tls,
}

impl Transport {
    /// Returns `true` if the substrate guarantees delivery.
    pub fn is_reliable(self) -> bool {
        matches!(self, Transport::Tcp | Transport::Tls)
    }
}

/// RFC 3261 base timer values (Table 4). T1 estimates the round-trip time,
/// T2 caps retransmission intervals, T4 bounds how long a message lingers in
/// the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerDefaults {
    pub t1: Duration,
    pub t2: Duration,
    pub t4: Duration,
}

impl Default for TimerDefaults {
    fn default() -> Self {
        Self {
            t1: Duration::from_millis(500),
            t2: Duration::from_secs(4),
            t4: Duration::from_secs(5),
        }
    }
}

/// Maps each named transaction timer to its arming duration for the bound
/// transport.
#[derive(Debug, Clone, Copy)]
pub struct TransportAwareTimers {
    transport: Transport,
    defaults: TimerDefaults,
}

impl TransportAwareTimers {
    /// Creates a timer calculator with default base values.
    pub fn new(transport: Transport) -> Self {
        Self {
            transport,
            defaults: TimerDefaults::default(),
        }
    }

    /// Creates a timer calculator with custom base values (test hook).
    pub fn with_defaults(transport: Transport, defaults: TimerDefaults) -> Self {
        Self {
            transport,
            defaults,
        }
    }

    pub fn t1(&self) -> Duration {
        self.defaults.t1
    }

    pub fn t2(&self) -> Duration {
        self.defaults.t2
    }

    pub fn t4(&self) -> Duration {
        self.defaults.t4
    }

    pub fn is_reliable(&self) -> bool {
        self.transport.is_reliable()
    }

    /// Returns the initial arming duration for a timer, or `None` when the
    /// timer never arms on this transport.
    ///
    /// `Some(Duration::ZERO)` means "arm and fire immediately": the manager
    /// still routes the firing through its mailbox so the transition happens
    /// inside the serialization domain.
    pub fn arm_duration(&self, timer: TransactionTimer) -> Option<Duration> {
        let TimerDefaults { t1, t2: _, t4 } = self.defaults;
        let reliable = self.transport.is_reliable();
        match timer {
            // Retransmission timers: suppressed entirely on reliable wires.
            TransactionTimer::A | TransactionTimer::E | TransactionTimer::G => {
                (!reliable).then_some(t1)
            }
            // Timeout timers: 64*T1 regardless of transport.
            TransactionTimer::B | TransactionTimer::F | TransactionTimer::H => {
                Some(t1.saturating_mul(64))
            }
            // Wait for retransmitted finals to drain (client INVITE).
            TransactionTimer::D => Some(if reliable {
                Duration::ZERO
            } else {
                Duration::from_secs(32).max(t1.saturating_mul(64))
            }),
            // Wait for ACK retransmissions (server INVITE).
            TransactionTimer::I => Some(if reliable { Duration::ZERO } else { t4 }),
            // Wait for request retransmissions (server non-INVITE).
            TransactionTimer::J => Some(if reliable {
                Duration::ZERO
            } else {
                t1.saturating_mul(64)
            }),
            // Wait for response retransmissions (client non-INVITE).
            TransactionTimer::K => Some(if reliable { Duration::ZERO } else { t4 }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn udp() -> TransportAwareTimers {
        TransportAwareTimers::new(Transport::Udp)
    }

    fn tcp() -> TransportAwareTimers {
        TransportAwareTimers::new(Transport::Tcp)
    }

    #[test]
    fn retransmission_timers_never_arm_on_reliable() {
        for timer in [TransactionTimer::A, TransactionTimer::E, TransactionTimer::G] {
            assert_eq!(udp().arm_duration(timer), Some(Duration::from_millis(500)));
            assert_eq!(tcp().arm_duration(timer), None);
            assert_eq!(
                TransportAwareTimers::new(Transport::Tls).arm_duration(timer),
                None
            );
        }
    }

    #[test]
    fn timeout_timers_are_transport_independent() {
        for timer in [TransactionTimer::B, TransactionTimer::F, TransactionTimer::H] {
            assert_eq!(udp().arm_duration(timer), Some(Duration::from_secs(32)));
            assert_eq!(tcp().arm_duration(timer), Some(Duration::from_secs(32)));
        }
    }

    #[test]
    fn wait_timers_collapse_to_zero_on_reliable() {
        for timer in [
            TransactionTimer::D,
            TransactionTimer::I,
            TransactionTimer::J,
            TransactionTimer::K,
        ] {
            assert_eq!(tcp().arm_duration(timer), Some(Duration::ZERO));
            assert!(udp().arm_duration(timer).unwrap() > Duration::ZERO);
        }
    }

    #[test]
    fn udp_wait_timer_values() {
        assert_eq!(
            udp().arm_duration(TransactionTimer::D),
            Some(Duration::from_secs(32))
        );
        assert_eq!(
            udp().arm_duration(TransactionTimer::I),
            Some(Duration::from_secs(5))
        );
        assert_eq!(
            udp().arm_duration(TransactionTimer::J),
            Some(Duration::from_secs(32))
        );
        assert_eq!(
            udp().arm_duration(TransactionTimer::K),
            Some(Duration::from_secs(5))
        );
    }

    #[test]
    fn timer_d_stays_at_least_32s_with_larger_t1() {
        let defaults = TimerDefaults {
            t1: Duration::from_secs(1),
            ..TimerDefaults::default()
        };
        let timers = TransportAwareTimers::with_defaults(Transport::Udp, defaults);
        // 64*T1 = 64s dominates the 32s floor.
        assert_eq!(
            timers.arm_duration(TransactionTimer::D),
            Some(Duration::from_secs(64))
        );
    }

    #[test]
    fn custom_defaults_flow_through() {
        let defaults = TimerDefaults {
            t1: Duration::from_millis(5),
            t2: Duration::from_millis(20),
            t4: Duration::from_millis(30),
        };
        let timers = TransportAwareTimers::with_defaults(Transport::Udp, defaults);
        assert_eq!(
            timers.arm_duration(TransactionTimer::F),
            Some(Duration::from_millis(320))
        );
        assert_eq!(
            timers.arm_duration(TransactionTimer::K),
            Some(Duration::from_millis(30))
        );
        assert_eq!(timers.t2(), Duration::from_millis(20));
    }
}
