// weir-rs - The Weir SIP Stack
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! RFC 3261 §17 transaction layer.
//!
//! Sits between a transport and the transaction user (TU): absorbs
//! retransmissions, enforces response orderings, drives the per-transaction
//! timers and delivers exactly-once request/response events upward. The four
//! automata live in [`fsm`]; [`manager`] owns the table of live transactions
//! and routes every inbound message, timer firing and TU call through one
//! serialization domain.

use rand::{distributions::Alphanumeric, Rng};
use smol_str::SmolStr;
use weir_core::{Method, Request, Response, MAGIC_COOKIE};

pub mod fsm;
pub mod manager;
pub mod timers;

pub use fsm::{
    ClientAction, ClientEvent, ClientInviteFsm, ClientNonInviteFsm, ServerAction, ServerEvent,
    ServerInviteFsm, ServerNonInviteFsm, TerminationKind,
};
pub use manager::{
    ServerTransactionHandle, TransactionLimits, TransactionManager, TransactionUser,
    TransportContext, TransportDispatcher,
};
pub use timers::{TimerDefaults, Transport, TransportAwareTimers};

/// Timers referenced by the SIP transaction state machines (RFC 3261 §17).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionTimer {
    A,
    B,
    D,
    E,
    F,
    G,
    H,
    I,
    J,
    K,
}

/// Client INVITE transaction states (RFC 3261 Figure 5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientInviteState {
    Calling,
    Proceeding,
    Completed,
    Terminated,
}

/// Client non-INVITE transaction states (RFC 3261 Figure 6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientNonInviteState {
    Trying,
    Proceeding,
    Completed,
    Terminated,
}

/// Server INVITE transaction states (RFC 3261 Figure 7). The transaction is
/// created directly in Proceeding and answers 100 Trying immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerInviteState {
    Proceeding,
    Completed,
    Confirmed,
    Terminated,
}

/// Server non-INVITE transaction states (RFC 3261 Figure 8).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerNonInviteState {
    Trying,
    Proceeding,
    Completed,
    Terminated,
}

/// Which side of the wire a transaction sits on. Part of the matching key:
/// the same branch names distinct client and server transactions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionRole {
    Client,
    Server,
}

/// Unique key identifying a transaction: `(branch, method, role)`.
///
/// The branch is the top-Via parameter carrying the `z9hG4bK` cookie; the
/// method is the request method for requests and the CSeq method for
/// responses, except that an inbound ACK folds onto the INVITE key of the
/// server transaction it acknowledges.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransactionKey {
    pub branch: SmolStr,
    pub method: Method,
    pub role: TransactionRole,
}

impl TransactionKey {
    /// Derives the key under which an inbound or outbound request matches.
    /// Returns `None` when the top Via has no RFC 3261 branch.
    pub fn from_request(request: &Request, role: TransactionRole) -> Option<Self> {
        let branch = request.branch()?;
        let method = match request.method() {
            Method::Ack if role == TransactionRole::Server => Method::Invite,
            m => m.clone(),
        };
        Some(Self {
            branch,
            method,
            role,
        })
    }

    /// Derives the client-transaction key a response matches: top-Via branch
    /// plus the CSeq method.
    pub fn from_response(response: &Response) -> Option<Self> {
        Some(Self {
            branch: response.branch()?,
            method: response.cseq_method()?,
            role: TransactionRole::Client,
        })
    }
}

/// Generates a fresh RFC 3261 branch: the magic cookie plus a random token.
pub fn generate_branch_id() -> SmolStr {
    let mut rng = rand::thread_rng();
    let suffix: String = (&mut rng)
        .sample_iter(&Alphanumeric)
        .take(16)
        .map(char::from)
        .collect();
    SmolStr::new(format!("{MAGIC_COOKIE}{suffix}"))
}
