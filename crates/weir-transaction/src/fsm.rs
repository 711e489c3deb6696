// weir-rs - The Weir SIP Stack
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The four RFC 3261 transaction state machines.
//!
//! Each machine is a pure step function `(state, event) -> actions`: it
//! never blocks, never talks to the network, and never touches a clock. The
//! manager feeds it events and executes the returned actions (transmit,
//! arm/cancel timers, notify the TU, terminate). Messages are frozen to
//! their serialized byte image on first use so retransmissions repeat the
//! exact bytes originally sent.

use std::time::Duration;

use bytes::Bytes;
use weir_core::{Headers, Method, Request, RequestLine, Response};
use weir_wire::{serialize_request, serialize_response};

use crate::timers::TransportAwareTimers;
use crate::{
    ClientInviteState, ClientNonInviteState, ServerInviteState, ServerNonInviteState,
    TransactionTimer,
};

/// Why a transaction reached Terminated. The manager maps this onto the TU
/// callbacks: `Timeout` and `TransportError` get their dedicated
/// notification before the common terminated event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationKind {
    /// Ordinary end of life: final handled, wait timers drained.
    Completed,
    /// Timer B, F or H elapsed without the awaited message.
    Timeout,
    /// The transport reported an unrecoverable send failure.
    TransportError,
}

/// Events driving the client-side machines.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// TU hands over the request to send (first event after creation).
    SendRequest(Request),
    ReceiveProvisional(Response),
    ReceiveFinal(Response),
    TimerFired(TransactionTimer),
    TransportError,
}

/// Actions emitted by the client-side machines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientAction {
    /// Put these bytes on the wire toward the transaction's remote.
    Transmit(Bytes),
    /// Hand the response to the TU (provisional or final by status class).
    Deliver(Response),
    /// Send the ACK this machine built for a non-2xx final.
    EmitAck(Bytes),
    Schedule {
        timer: TransactionTimer,
        duration: Duration,
    },
    Cancel(TransactionTimer),
    Terminate(TerminationKind),
}

/// Events driving the server-side machines.
#[derive(Debug, Clone)]
pub enum ServerEvent {
    /// TU posts a provisional response.
    SendProvisional(Response),
    /// TU posts a final response.
    SendFinal(Response),
    /// The matcher routed an ACK into this (INVITE) transaction.
    ReceiveAck,
    TimerFired(TransactionTimer),
    TransportError,
}

/// Actions emitted by the server-side machines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerAction {
    Transmit(Bytes),
    Schedule {
        timer: TransactionTimer,
        duration: Duration,
    },
    Cancel(TransactionTimer),
    Terminate(TerminationKind),
}

/// Client INVITE transaction (RFC 3261 §17.1.1).
pub struct ClientInviteFsm {
    pub state: ClientInviteState,
    timers: TransportAwareTimers,
    a_interval: Duration,
    request: Option<Request>,
    request_bytes: Option<Bytes>,
    ack: Option<Bytes>,
}

impl ClientInviteFsm {
    pub fn new(timers: TransportAwareTimers) -> Self {
        Self {
            state: ClientInviteState::Calling,
            a_interval: timers.t1(),
            timers,
            request: None,
            request_bytes: None,
            ack: None,
        }
    }

    pub fn on_event(&mut self, event: ClientEvent) -> Vec<ClientAction> {
        use ClientInviteState::*;
        match (&self.state, event) {
            (Calling, ClientEvent::SendRequest(request)) => self.handle_send(request),
            (Calling | Proceeding, ClientEvent::ReceiveProvisional(response)) => {
                self.handle_provisional(response)
            }
            (Calling | Proceeding | Completed, ClientEvent::ReceiveFinal(response)) => {
                self.handle_final(response)
            }
            (Calling, ClientEvent::TimerFired(TransactionTimer::A)) => self.handle_timer_a(),
            (Calling, ClientEvent::TimerFired(TransactionTimer::B)) => self.handle_timer_b(),
            (Completed, ClientEvent::TimerFired(TransactionTimer::D)) => self.handle_timer_d(),
            (Terminated, _) => Vec::new(),
            (_, ClientEvent::TransportError) => self.handle_transport_error(),
            _ => Vec::new(),
        }
    }

    fn handle_send(&mut self, request: Request) -> Vec<ClientAction> {
        let bytes = serialize_request(&request);
        self.request = Some(request);
        self.request_bytes = Some(bytes.clone());
        let mut actions = vec![ClientAction::Transmit(bytes)];
        if let Some(duration) = self.timers.arm_duration(TransactionTimer::A) {
            actions.push(ClientAction::Schedule {
                timer: TransactionTimer::A,
                duration,
            });
        }
        if let Some(duration) = self.timers.arm_duration(TransactionTimer::B) {
            actions.push(ClientAction::Schedule {
                timer: TransactionTimer::B,
                duration,
            });
        }
        actions
    }

    fn handle_provisional(&mut self, response: Response) -> Vec<ClientAction> {
        self.state = ClientInviteState::Proceeding;
        vec![
            ClientAction::Cancel(TransactionTimer::A),
            ClientAction::Deliver(response),
        ]
    }

    fn handle_final(&mut self, response: Response) -> Vec<ClientAction> {
        if self.state == ClientInviteState::Completed {
            // Retransmitted final: answer with the ACK already built, the TU
            // has been told once.
            if response.is_success() {
                return Vec::new();
            }
            return match &self.ack {
                Some(ack) => vec![ClientAction::EmitAck(ack.clone())],
                None => Vec::new(),
            };
        }

        if response.is_success() {
            // The ACK for a 2xx belongs to the dialog layer above.
            self.state = ClientInviteState::Terminated;
            vec![
                ClientAction::Cancel(TransactionTimer::A),
                ClientAction::Cancel(TransactionTimer::B),
                ClientAction::Deliver(response),
                ClientAction::Terminate(TerminationKind::Completed),
            ]
        } else {
            self.state = ClientInviteState::Completed;
            let mut actions = vec![
                ClientAction::Cancel(TransactionTimer::A),
                ClientAction::Cancel(TransactionTimer::B),
            ];
            if let Some(request) = &self.request {
                let ack = serialize_request(&build_ack(request, &response));
                self.ack = Some(ack.clone());
                actions.push(ClientAction::EmitAck(ack));
            }
            actions.push(ClientAction::Deliver(response));
            if let Some(duration) = self.timers.arm_duration(TransactionTimer::D) {
                actions.push(ClientAction::Schedule {
                    timer: TransactionTimer::D,
                    duration,
                });
            }
            actions
        }
    }

    fn handle_timer_a(&mut self) -> Vec<ClientAction> {
        // Timer A doubles without cap (RFC 3261 §17.1.1.2; only E and G are
        // bounded by T2).
        self.a_interval = self.a_interval.saturating_mul(2);
        match &self.request_bytes {
            Some(bytes) => vec![
                ClientAction::Transmit(bytes.clone()),
                ClientAction::Schedule {
                    timer: TransactionTimer::A,
                    duration: self.a_interval,
                },
            ],
            None => Vec::new(),
        }
    }

    fn handle_timer_b(&mut self) -> Vec<ClientAction> {
        self.state = ClientInviteState::Terminated;
        vec![
            ClientAction::Cancel(TransactionTimer::A),
            ClientAction::Terminate(TerminationKind::Timeout),
        ]
    }

    fn handle_timer_d(&mut self) -> Vec<ClientAction> {
        self.state = ClientInviteState::Terminated;
        vec![ClientAction::Terminate(TerminationKind::Completed)]
    }

    fn handle_transport_error(&mut self) -> Vec<ClientAction> {
        self.state = ClientInviteState::Terminated;
        vec![ClientAction::Terminate(TerminationKind::TransportError)]
    }
}

/// Client non-INVITE transaction (RFC 3261 §17.1.2).
pub struct ClientNonInviteFsm {
    pub state: ClientNonInviteState,
    timers: TransportAwareTimers,
    e_interval: Duration,
    request_bytes: Option<Bytes>,
}

impl ClientNonInviteFsm {
    pub fn new(timers: TransportAwareTimers) -> Self {
        Self {
            state: ClientNonInviteState::Trying,
            e_interval: timers.t1(),
            timers,
            request_bytes: None,
        }
    }

    pub fn on_event(&mut self, event: ClientEvent) -> Vec<ClientAction> {
        use ClientNonInviteState::*;
        match (&self.state, event) {
            (Trying, ClientEvent::SendRequest(request)) => self.handle_send(request),
            (Trying | Proceeding, ClientEvent::ReceiveProvisional(response)) => {
                self.handle_provisional(response)
            }
            (Trying | Proceeding, ClientEvent::ReceiveFinal(response)) => {
                self.handle_final(response)
            }
            (Trying | Proceeding, ClientEvent::TimerFired(TransactionTimer::E)) => {
                self.handle_timer_e()
            }
            (Trying | Proceeding, ClientEvent::TimerFired(TransactionTimer::F)) => {
                self.handle_timer_f()
            }
            (Completed, ClientEvent::TimerFired(TransactionTimer::K)) => self.handle_timer_k(),
            (Terminated, _) => Vec::new(),
            (_, ClientEvent::TransportError) => self.handle_transport_error(),
            _ => Vec::new(),
        }
    }

    fn handle_send(&mut self, request: Request) -> Vec<ClientAction> {
        let bytes = serialize_request(&request);
        self.request_bytes = Some(bytes.clone());
        let mut actions = vec![ClientAction::Transmit(bytes)];
        if let Some(duration) = self.timers.arm_duration(TransactionTimer::E) {
            actions.push(ClientAction::Schedule {
                timer: TransactionTimer::E,
                duration,
            });
        }
        if let Some(duration) = self.timers.arm_duration(TransactionTimer::F) {
            actions.push(ClientAction::Schedule {
                timer: TransactionTimer::F,
                duration,
            });
        }
        actions
    }

    fn handle_provisional(&mut self, response: Response) -> Vec<ClientAction> {
        // Timer E keeps running; once Proceeding it rearms at T2.
        self.state = ClientNonInviteState::Proceeding;
        vec![ClientAction::Deliver(response)]
    }

    fn handle_final(&mut self, response: Response) -> Vec<ClientAction> {
        self.state = ClientNonInviteState::Completed;
        let mut actions = vec![
            ClientAction::Cancel(TransactionTimer::E),
            ClientAction::Cancel(TransactionTimer::F),
            ClientAction::Deliver(response),
        ];
        if let Some(duration) = self.timers.arm_duration(TransactionTimer::K) {
            actions.push(ClientAction::Schedule {
                timer: TransactionTimer::K,
                duration,
            });
        }
        actions
    }

    fn handle_timer_e(&mut self) -> Vec<ClientAction> {
        self.e_interval = if self.state == ClientNonInviteState::Proceeding {
            self.timers.t2()
        } else {
            self.e_interval.saturating_mul(2).min(self.timers.t2())
        };
        match &self.request_bytes {
            Some(bytes) => vec![
                ClientAction::Transmit(bytes.clone()),
                ClientAction::Schedule {
                    timer: TransactionTimer::E,
                    duration: self.e_interval,
                },
            ],
            None => Vec::new(),
        }
    }

    fn handle_timer_f(&mut self) -> Vec<ClientAction> {
        self.state = ClientNonInviteState::Terminated;
        vec![
            ClientAction::Cancel(TransactionTimer::E),
            ClientAction::Terminate(TerminationKind::Timeout),
        ]
    }

    fn handle_timer_k(&mut self) -> Vec<ClientAction> {
        self.state = ClientNonInviteState::Terminated;
        vec![ClientAction::Terminate(TerminationKind::Completed)]
    }

    fn handle_transport_error(&mut self) -> Vec<ClientAction> {
        self.state = ClientNonInviteState::Terminated;
        vec![ClientAction::Terminate(TerminationKind::TransportError)]
    }
}

/// Server INVITE transaction (RFC 3261 §17.2.1). Created in Proceeding; the
/// manager feeds it the 100 Trying right away.
pub struct ServerInviteFsm {
    pub state: ServerInviteState,
    timers: TransportAwareTimers,
    g_interval: Duration,
    last_response: Option<Bytes>,
    last_final: Option<Bytes>,
}

impl ServerInviteFsm {
    pub fn new(timers: TransportAwareTimers) -> Self {
        Self {
            state: ServerInviteState::Proceeding,
            g_interval: timers.t1(),
            timers,
            last_response: None,
            last_final: None,
        }
    }

    pub fn on_event(&mut self, event: ServerEvent) -> Vec<ServerAction> {
        use ServerInviteState::*;
        match (&self.state, event) {
            (Proceeding, ServerEvent::SendProvisional(response)) => {
                self.handle_provisional(response)
            }
            (Proceeding, ServerEvent::SendFinal(response)) => self.handle_final(response),
            // A final posted after the transaction closed is silently
            // discarded; the TU has already been told it is over.
            (Completed | Confirmed | Terminated, ServerEvent::SendFinal(_)) => Vec::new(),
            (Completed, ServerEvent::ReceiveAck) => self.handle_ack(),
            (Completed, ServerEvent::TimerFired(TransactionTimer::G)) => self.handle_timer_g(),
            (Completed, ServerEvent::TimerFired(TransactionTimer::H)) => self.handle_timer_h(),
            (Confirmed, ServerEvent::TimerFired(TransactionTimer::I)) => self.handle_timer_i(),
            (Terminated, _) => Vec::new(),
            (_, ServerEvent::TransportError) => self.handle_transport_error(),
            _ => Vec::new(),
        }
    }

    /// A retransmission of the original INVITE arrived: replay the most
    /// recent response for this state.
    pub fn on_retransmit(&self) -> Vec<ServerAction> {
        match self.state {
            ServerInviteState::Proceeding => match &self.last_response {
                Some(bytes) => vec![ServerAction::Transmit(bytes.clone())],
                None => Vec::new(),
            },
            ServerInviteState::Completed => match &self.last_final {
                Some(bytes) => vec![ServerAction::Transmit(bytes.clone())],
                None => Vec::new(),
            },
            _ => Vec::new(),
        }
    }

    fn handle_provisional(&mut self, response: Response) -> Vec<ServerAction> {
        let bytes = serialize_response(&response);
        self.last_response = Some(bytes.clone());
        vec![ServerAction::Transmit(bytes)]
    }

    fn handle_final(&mut self, response: Response) -> Vec<ServerAction> {
        if response.is_provisional() {
            return self.handle_provisional(response);
        }
        let bytes = serialize_response(&response);
        if response.is_success() {
            // 2xx: the transaction is done; retransmitting the 2xx and
            // matching its ACK belong to the TU at the dialog layer.
            self.state = ServerInviteState::Terminated;
            vec![
                ServerAction::Transmit(bytes),
                ServerAction::Terminate(TerminationKind::Completed),
            ]
        } else {
            self.state = ServerInviteState::Completed;
            self.last_final = Some(bytes.clone());
            self.g_interval = self.timers.t1();
            let mut actions = vec![ServerAction::Transmit(bytes)];
            if let Some(duration) = self.timers.arm_duration(TransactionTimer::G) {
                actions.push(ServerAction::Schedule {
                    timer: TransactionTimer::G,
                    duration,
                });
            }
            if let Some(duration) = self.timers.arm_duration(TransactionTimer::H) {
                actions.push(ServerAction::Schedule {
                    timer: TransactionTimer::H,
                    duration,
                });
            }
            actions
        }
    }

    fn handle_ack(&mut self) -> Vec<ServerAction> {
        self.state = ServerInviteState::Confirmed;
        let mut actions = vec![
            ServerAction::Cancel(TransactionTimer::G),
            ServerAction::Cancel(TransactionTimer::H),
        ];
        if let Some(duration) = self.timers.arm_duration(TransactionTimer::I) {
            actions.push(ServerAction::Schedule {
                timer: TransactionTimer::I,
                duration,
            });
        }
        actions
    }

    fn handle_timer_g(&mut self) -> Vec<ServerAction> {
        match &self.last_final {
            Some(bytes) => {
                let action = ServerAction::Transmit(bytes.clone());
                self.g_interval = self.g_interval.saturating_mul(2).min(self.timers.t2());
                vec![
                    action,
                    ServerAction::Schedule {
                        timer: TransactionTimer::G,
                        duration: self.g_interval,
                    },
                ]
            }
            None => Vec::new(),
        }
    }

    fn handle_timer_h(&mut self) -> Vec<ServerAction> {
        self.state = ServerInviteState::Terminated;
        vec![
            ServerAction::Cancel(TransactionTimer::G),
            ServerAction::Terminate(TerminationKind::Timeout),
        ]
    }

    fn handle_timer_i(&mut self) -> Vec<ServerAction> {
        self.state = ServerInviteState::Terminated;
        vec![ServerAction::Terminate(TerminationKind::Completed)]
    }

    fn handle_transport_error(&mut self) -> Vec<ServerAction> {
        self.state = ServerInviteState::Terminated;
        vec![ServerAction::Terminate(TerminationKind::TransportError)]
    }
}

/// Server non-INVITE transaction (RFC 3261 §17.2.2).
pub struct ServerNonInviteFsm {
    pub state: ServerNonInviteState,
    timers: TransportAwareTimers,
    last_provisional: Option<Bytes>,
    last_final: Option<Bytes>,
}

impl ServerNonInviteFsm {
    pub fn new(timers: TransportAwareTimers) -> Self {
        Self {
            state: ServerNonInviteState::Trying,
            timers,
            last_provisional: None,
            last_final: None,
        }
    }

    pub fn on_event(&mut self, event: ServerEvent) -> Vec<ServerAction> {
        use ServerNonInviteState::*;
        match (&self.state, event) {
            (Trying | Proceeding, ServerEvent::SendProvisional(response)) => {
                self.handle_provisional(response)
            }
            (Trying | Proceeding, ServerEvent::SendFinal(response)) => self.handle_final(response),
            (Completed | Terminated, ServerEvent::SendFinal(_)) => Vec::new(),
            (Completed, ServerEvent::TimerFired(TransactionTimer::J)) => self.handle_timer_j(),
            (Terminated, _) => Vec::new(),
            (_, ServerEvent::TransportError) => self.handle_transport_error(),
            _ => Vec::new(),
        }
    }

    /// A retransmission of the request arrived. In Trying it is absorbed
    /// without a send and without telling the TU; afterwards the last
    /// response for the state is replayed.
    pub fn on_retransmit(&self) -> Vec<ServerAction> {
        match self.state {
            ServerNonInviteState::Trying => Vec::new(),
            ServerNonInviteState::Proceeding => match &self.last_provisional {
                Some(bytes) => vec![ServerAction::Transmit(bytes.clone())],
                None => Vec::new(),
            },
            ServerNonInviteState::Completed => match &self.last_final {
                Some(bytes) => vec![ServerAction::Transmit(bytes.clone())],
                None => Vec::new(),
            },
            ServerNonInviteState::Terminated => Vec::new(),
        }
    }

    fn handle_provisional(&mut self, response: Response) -> Vec<ServerAction> {
        self.state = ServerNonInviteState::Proceeding;
        let bytes = serialize_response(&response);
        self.last_provisional = Some(bytes.clone());
        vec![ServerAction::Transmit(bytes)]
    }

    fn handle_final(&mut self, response: Response) -> Vec<ServerAction> {
        if response.is_provisional() {
            return self.handle_provisional(response);
        }
        self.state = ServerNonInviteState::Completed;
        let bytes = serialize_response(&response);
        self.last_final = Some(bytes.clone());
        let mut actions = vec![ServerAction::Transmit(bytes)];
        if let Some(duration) = self.timers.arm_duration(TransactionTimer::J) {
            actions.push(ServerAction::Schedule {
                timer: TransactionTimer::J,
                duration,
            });
        }
        actions
    }

    fn handle_timer_j(&mut self) -> Vec<ServerAction> {
        self.state = ServerNonInviteState::Terminated;
        vec![ServerAction::Terminate(TerminationKind::Completed)]
    }

    fn handle_transport_error(&mut self) -> Vec<ServerAction> {
        self.state = ServerNonInviteState::Terminated;
        vec![ServerAction::Terminate(TerminationKind::TransportError)]
    }
}

/// Builds the ACK for a non-2xx final response per RFC 3261 §17.1.1.3:
/// Request-URI, Call-ID, From and top Via are taken from the original
/// request, To from the response (it carries the tag), CSeq keeps the
/// original number with method ACK.
pub fn build_ack(request: &Request, response: &Response) -> Request {
    let mut headers = Headers::new();
    if let Some(via) = request.top_via() {
        headers.push("Via", via.clone());
    }
    if let Some(from) = request.headers.get("From") {
        headers.push("From", from.clone());
    }
    match response.headers.get("To") {
        Some(to) => headers.push("To", to.clone()),
        None => {
            if let Some(to) = request.headers.get("To") {
                headers.push("To", to.clone());
            }
        }
    }
    if let Some(call_id) = request.headers.get("Call-ID") {
        headers.push("Call-ID", call_id.clone());
    }
    if let Some(seq) = request.cseq_number() {
        headers.push("CSeq", format!("{seq} ACK"));
    }
    headers.push("Max-Forwards", "70");
    headers.push("Content-Length", "0");

    Request::new(
        RequestLine::new(Method::Ack, request.start.uri.clone()),
        headers,
        Bytes::new(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timers::Transport;
    use weir_core::create_response;

    fn timers_udp() -> TransportAwareTimers {
        TransportAwareTimers::new(Transport::Udp)
    }

    fn timers_tcp() -> TransportAwareTimers {
        TransportAwareTimers::new(Transport::Tcp)
    }

    fn sample_request(method: Method) -> Request {
        let mut headers = Headers::new();
        headers.push("Via", "SIP/2.0/UDP client.example.com;branch=z9hG4bKtest");
        headers.push("From", "<sip:alice@example.com>;tag=1928301774");
        headers.push("To", "<sip:bob@example.com>");
        headers.push("Call-ID", "a84b4c76e66710");
        headers.push("CSeq", format!("7 {}", method.as_str()));
        Request::new(
            RequestLine::new(method, "sip:bob@example.com"),
            headers,
            Bytes::new(),
        )
    }

    fn sample_invite() -> Request {
        sample_request(Method::Invite)
    }

    fn response_for(request: &Request, code: u16) -> Response {
        create_response(request, code, "Reason")
    }

    fn scheduled(actions: &[ClientAction], timer: TransactionTimer) -> Option<Duration> {
        actions.iter().find_map(|a| match a {
            ClientAction::Schedule { timer: t, duration } if *t == timer => Some(*duration),
            _ => None,
        })
    }

    fn server_scheduled(actions: &[ServerAction], timer: TransactionTimer) -> Option<Duration> {
        actions.iter().find_map(|a| match a {
            ServerAction::Schedule { timer: t, duration } if *t == timer => Some(*duration),
            _ => None,
        })
    }

    // --- client INVITE ---

    #[test]
    fn client_invite_sends_and_arms_a_and_b() {
        let mut fsm = ClientInviteFsm::new(timers_udp());
        let actions = fsm.on_event(ClientEvent::SendRequest(sample_invite()));
        assert!(matches!(actions[0], ClientAction::Transmit(_)));
        assert_eq!(
            scheduled(&actions, TransactionTimer::A),
            Some(Duration::from_millis(500))
        );
        assert_eq!(
            scheduled(&actions, TransactionTimer::B),
            Some(Duration::from_secs(32))
        );
    }

    #[test]
    fn client_invite_timer_a_doubles_without_cap() {
        let mut fsm = ClientInviteFsm::new(timers_udp());
        fsm.on_event(ClientEvent::SendRequest(sample_invite()));
        let mut expected = Duration::from_millis(500);
        for _ in 0..5 {
            expected *= 2;
            let actions = fsm.on_event(ClientEvent::TimerFired(TransactionTimer::A));
            assert!(matches!(actions[0], ClientAction::Transmit(_)));
            assert_eq!(scheduled(&actions, TransactionTimer::A), Some(expected));
        }
        // 500ms * 2^5 = 16s, past the T2 cap that applies only to E and G.
        assert_eq!(expected, Duration::from_secs(16));
    }

    #[test]
    fn client_invite_reliable_never_arms_timer_a() {
        let mut fsm = ClientInviteFsm::new(timers_tcp());
        let actions = fsm.on_event(ClientEvent::SendRequest(sample_invite()));
        assert_eq!(scheduled(&actions, TransactionTimer::A), None);
        assert!(scheduled(&actions, TransactionTimer::B).is_some());
    }

    #[test]
    fn client_invite_provisional_enters_proceeding_and_stops_a() {
        let mut fsm = ClientInviteFsm::new(timers_udp());
        let req = sample_invite();
        fsm.on_event(ClientEvent::SendRequest(req.clone()));
        let actions = fsm.on_event(ClientEvent::ReceiveProvisional(response_for(&req, 180)));
        assert_eq!(fsm.state, ClientInviteState::Proceeding);
        assert!(actions.contains(&ClientAction::Cancel(TransactionTimer::A)));
        assert!(actions.iter().any(|a| matches!(a, ClientAction::Deliver(_))));
        // A late firing of Timer A in Proceeding is a no-op.
        assert!(fsm
            .on_event(ClientEvent::TimerFired(TransactionTimer::A))
            .is_empty());
    }

    #[test]
    fn client_invite_2xx_terminates_without_ack() {
        let mut fsm = ClientInviteFsm::new(timers_udp());
        let req = sample_invite();
        fsm.on_event(ClientEvent::SendRequest(req.clone()));
        let actions = fsm.on_event(ClientEvent::ReceiveFinal(response_for(&req, 200)));
        assert_eq!(fsm.state, ClientInviteState::Terminated);
        assert!(actions.iter().any(|a| matches!(a, ClientAction::Deliver(_))));
        assert!(!actions.iter().any(|a| matches!(a, ClientAction::EmitAck(_))));
        assert!(actions.contains(&ClientAction::Terminate(TerminationKind::Completed)));
    }

    #[test]
    fn client_invite_non_2xx_emits_ack_and_arms_d() {
        let mut fsm = ClientInviteFsm::new(timers_udp());
        let req = sample_invite();
        fsm.on_event(ClientEvent::SendRequest(req.clone()));
        let actions = fsm.on_event(ClientEvent::ReceiveFinal(response_for(&req, 486)));
        assert_eq!(fsm.state, ClientInviteState::Completed);
        assert!(actions.iter().any(|a| matches!(a, ClientAction::EmitAck(_))));
        assert!(actions.iter().any(|a| matches!(a, ClientAction::Deliver(_))));
        assert_eq!(
            scheduled(&actions, TransactionTimer::D),
            Some(Duration::from_secs(32))
        );

        // The retransmitted 486 re-emits the identical ACK, no re-delivery.
        let first_ack = actions
            .iter()
            .find_map(|a| match a {
                ClientAction::EmitAck(bytes) => Some(bytes.clone()),
                _ => None,
            })
            .unwrap();
        let actions = fsm.on_event(ClientEvent::ReceiveFinal(response_for(&req, 486)));
        assert_eq!(actions, vec![ClientAction::EmitAck(first_ack)]);

        let actions = fsm.on_event(ClientEvent::TimerFired(TransactionTimer::D));
        assert_eq!(fsm.state, ClientInviteState::Terminated);
        assert!(actions.contains(&ClientAction::Terminate(TerminationKind::Completed)));
    }

    #[test]
    fn client_invite_timer_b_times_out_only_in_calling() {
        let mut fsm = ClientInviteFsm::new(timers_udp());
        let req = sample_invite();
        fsm.on_event(ClientEvent::SendRequest(req.clone()));
        fsm.on_event(ClientEvent::ReceiveProvisional(response_for(&req, 100)));
        assert!(fsm
            .on_event(ClientEvent::TimerFired(TransactionTimer::B))
            .is_empty());

        let mut fsm = ClientInviteFsm::new(timers_udp());
        fsm.on_event(ClientEvent::SendRequest(sample_invite()));
        let actions = fsm.on_event(ClientEvent::TimerFired(TransactionTimer::B));
        assert_eq!(fsm.state, ClientInviteState::Terminated);
        assert!(actions.contains(&ClientAction::Terminate(TerminationKind::Timeout)));
    }

    #[test]
    fn client_invite_late_provisional_after_final_ignored() {
        let mut fsm = ClientInviteFsm::new(timers_udp());
        let req = sample_invite();
        fsm.on_event(ClientEvent::SendRequest(req.clone()));
        fsm.on_event(ClientEvent::ReceiveFinal(response_for(&req, 486)));
        assert!(fsm
            .on_event(ClientEvent::ReceiveProvisional(response_for(&req, 180)))
            .is_empty());
    }

    // --- client non-INVITE ---

    #[test]
    fn client_non_invite_timer_e_backoff_caps_at_t2() {
        let mut fsm = ClientNonInviteFsm::new(timers_udp());
        fsm.on_event(ClientEvent::SendRequest(sample_request(Method::Options)));
        let expected = [1000u64, 2000, 4000, 4000, 4000];
        for ms in expected {
            let actions = fsm.on_event(ClientEvent::TimerFired(TransactionTimer::E));
            assert_eq!(
                scheduled(&actions, TransactionTimer::E),
                Some(Duration::from_millis(ms))
            );
        }
    }

    #[test]
    fn client_non_invite_timer_e_pins_to_t2_in_proceeding() {
        let mut fsm = ClientNonInviteFsm::new(timers_udp());
        let req = sample_request(Method::Options);
        fsm.on_event(ClientEvent::SendRequest(req.clone()));
        fsm.on_event(ClientEvent::ReceiveProvisional(response_for(&req, 100)));
        assert_eq!(fsm.state, ClientNonInviteState::Proceeding);
        let actions = fsm.on_event(ClientEvent::TimerFired(TransactionTimer::E));
        assert_eq!(
            scheduled(&actions, TransactionTimer::E),
            Some(Duration::from_secs(4))
        );
    }

    #[test]
    fn client_non_invite_final_completes_and_arms_k() {
        let mut fsm = ClientNonInviteFsm::new(timers_udp());
        let req = sample_request(Method::Options);
        fsm.on_event(ClientEvent::SendRequest(req.clone()));
        let actions = fsm.on_event(ClientEvent::ReceiveFinal(response_for(&req, 200)));
        assert_eq!(fsm.state, ClientNonInviteState::Completed);
        assert!(actions.contains(&ClientAction::Cancel(TransactionTimer::E)));
        assert!(actions.contains(&ClientAction::Cancel(TransactionTimer::F)));
        assert_eq!(
            scheduled(&actions, TransactionTimer::K),
            Some(Duration::from_secs(5))
        );

        // Retransmitted finals are absorbed: the TU hears exactly one final.
        assert!(fsm
            .on_event(ClientEvent::ReceiveFinal(response_for(&req, 200)))
            .is_empty());

        let actions = fsm.on_event(ClientEvent::TimerFired(TransactionTimer::K));
        assert_eq!(fsm.state, ClientNonInviteState::Terminated);
        assert!(actions.contains(&ClientAction::Terminate(TerminationKind::Completed)));
    }

    #[test]
    fn client_non_invite_timer_f_times_out() {
        let mut fsm = ClientNonInviteFsm::new(timers_udp());
        fsm.on_event(ClientEvent::SendRequest(sample_request(Method::Options)));
        let actions = fsm.on_event(ClientEvent::TimerFired(TransactionTimer::F));
        assert_eq!(fsm.state, ClientNonInviteState::Terminated);
        assert!(actions.contains(&ClientAction::Terminate(TerminationKind::Timeout)));
    }

    #[test]
    fn client_non_invite_reliable_arms_k_at_zero() {
        let mut fsm = ClientNonInviteFsm::new(timers_tcp());
        let req = sample_request(Method::Options);
        let actions = fsm.on_event(ClientEvent::SendRequest(req.clone()));
        assert_eq!(scheduled(&actions, TransactionTimer::E), None);
        let actions = fsm.on_event(ClientEvent::ReceiveFinal(response_for(&req, 200)));
        assert_eq!(scheduled(&actions, TransactionTimer::K), Some(Duration::ZERO));
    }

    // --- server INVITE ---

    fn completed_server_invite() -> (ServerInviteFsm, Request) {
        let mut fsm = ServerInviteFsm::new(timers_udp());
        let req = sample_invite();
        fsm.on_event(ServerEvent::SendProvisional(create_response(
            &req, 100, "Trying",
        )));
        fsm.on_event(ServerEvent::SendFinal(response_for(&req, 486)));
        (fsm, req)
    }

    #[test]
    fn server_invite_2xx_goes_straight_to_terminated() {
        let mut fsm = ServerInviteFsm::new(timers_udp());
        let req = sample_invite();
        let actions = fsm.on_event(ServerEvent::SendFinal(response_for(&req, 200)));
        assert_eq!(fsm.state, ServerInviteState::Terminated);
        assert!(matches!(actions[0], ServerAction::Transmit(_)));
        assert!(actions.contains(&ServerAction::Terminate(TerminationKind::Completed)));
        // No retransmission machinery: the TU owns the 2xx from here.
        assert!(server_scheduled(&actions, TransactionTimer::G).is_none());
        assert!(server_scheduled(&actions, TransactionTimer::H).is_none());
    }

    #[test]
    fn server_invite_non_2xx_completes_and_arms_g_h() {
        let (fsm, _req) = completed_server_invite();
        assert_eq!(fsm.state, ServerInviteState::Completed);

        let mut fsm = ServerInviteFsm::new(timers_udp());
        let req = sample_invite();
        let actions = fsm.on_event(ServerEvent::SendFinal(response_for(&req, 486)));
        assert_eq!(
            server_scheduled(&actions, TransactionTimer::G),
            Some(Duration::from_millis(500))
        );
        assert_eq!(
            server_scheduled(&actions, TransactionTimer::H),
            Some(Duration::from_secs(32))
        );
    }

    #[test]
    fn server_invite_timer_g_backoff_follows_min_double_t2() {
        let (mut fsm, _req) = completed_server_invite();
        let expected = [1000u64, 2000, 4000, 4000];
        for ms in expected {
            let actions = fsm.on_event(ServerEvent::TimerFired(TransactionTimer::G));
            assert!(matches!(actions[0], ServerAction::Transmit(_)));
            assert_eq!(
                server_scheduled(&actions, TransactionTimer::G),
                Some(Duration::from_millis(ms))
            );
        }
    }

    #[test]
    fn server_invite_final_in_completed_is_discarded() {
        let (mut fsm, req) = completed_server_invite();
        assert!(fsm
            .on_event(ServerEvent::SendFinal(response_for(&req, 500)))
            .is_empty());
        assert_eq!(fsm.state, ServerInviteState::Completed);
    }

    #[test]
    fn server_invite_retransmit_replays_state_response() {
        let mut fsm = ServerInviteFsm::new(timers_udp());
        let req = sample_invite();
        // Before any response there is nothing to replay.
        assert!(fsm.on_retransmit().is_empty());
        fsm.on_event(ServerEvent::SendProvisional(create_response(
            &req, 100, "Trying",
        )));
        assert_eq!(fsm.on_retransmit().len(), 1);

        fsm.on_event(ServerEvent::SendFinal(response_for(&req, 486)));
        let actions = fsm.on_retransmit();
        assert_eq!(actions.len(), 1);
        assert!(matches!(actions[0], ServerAction::Transmit(_)));
    }

    #[test]
    fn server_invite_ack_confirms_and_arms_i() {
        let (mut fsm, _req) = completed_server_invite();
        let actions = fsm.on_event(ServerEvent::ReceiveAck);
        assert_eq!(fsm.state, ServerInviteState::Confirmed);
        assert!(actions.contains(&ServerAction::Cancel(TransactionTimer::G)));
        assert!(actions.contains(&ServerAction::Cancel(TransactionTimer::H)));
        assert_eq!(
            server_scheduled(&actions, TransactionTimer::I),
            Some(Duration::from_secs(5))
        );

        let actions = fsm.on_event(ServerEvent::TimerFired(TransactionTimer::I));
        assert_eq!(fsm.state, ServerInviteState::Terminated);
        assert!(actions.contains(&ServerAction::Terminate(TerminationKind::Completed)));
    }

    #[test]
    fn server_invite_timer_h_times_out_without_ack() {
        let (mut fsm, _req) = completed_server_invite();
        let actions = fsm.on_event(ServerEvent::TimerFired(TransactionTimer::H));
        assert_eq!(fsm.state, ServerInviteState::Terminated);
        assert!(actions.contains(&ServerAction::Cancel(TransactionTimer::G)));
        assert!(actions.contains(&ServerAction::Terminate(TerminationKind::Timeout)));
    }

    #[test]
    fn server_invite_reliable_suppresses_g_and_zeroes_i() {
        let mut fsm = ServerInviteFsm::new(timers_tcp());
        let req = sample_invite();
        let actions = fsm.on_event(ServerEvent::SendFinal(response_for(&req, 486)));
        assert!(server_scheduled(&actions, TransactionTimer::G).is_none());
        assert!(server_scheduled(&actions, TransactionTimer::H).is_some());
        let actions = fsm.on_event(ServerEvent::ReceiveAck);
        assert_eq!(
            server_scheduled(&actions, TransactionTimer::I),
            Some(Duration::ZERO)
        );
    }

    // --- server non-INVITE ---

    #[test]
    fn server_non_invite_absorbs_retransmissions_in_trying() {
        let fsm = ServerNonInviteFsm::new(timers_udp());
        assert!(fsm.on_retransmit().is_empty());
    }

    #[test]
    fn server_non_invite_replays_provisional_then_final() {
        let mut fsm = ServerNonInviteFsm::new(timers_udp());
        let req = sample_request(Method::Options);
        fsm.on_event(ServerEvent::SendProvisional(response_for(&req, 100)));
        assert_eq!(fsm.state, ServerNonInviteState::Proceeding);
        assert_eq!(fsm.on_retransmit().len(), 1);

        let actions = fsm.on_event(ServerEvent::SendFinal(response_for(&req, 200)));
        assert_eq!(fsm.state, ServerNonInviteState::Completed);
        assert_eq!(
            server_scheduled(&actions, TransactionTimer::J),
            Some(Duration::from_secs(32))
        );
        assert_eq!(fsm.on_retransmit().len(), 1);

        let actions = fsm.on_event(ServerEvent::TimerFired(TransactionTimer::J));
        assert_eq!(fsm.state, ServerNonInviteState::Terminated);
        assert!(actions.contains(&ServerAction::Terminate(TerminationKind::Completed)));
    }

    #[test]
    fn server_non_invite_discards_second_final() {
        let mut fsm = ServerNonInviteFsm::new(timers_udp());
        let req = sample_request(Method::Options);
        fsm.on_event(ServerEvent::SendFinal(response_for(&req, 200)));
        assert!(fsm
            .on_event(ServerEvent::SendFinal(response_for(&req, 500)))
            .is_empty());
    }

    #[test]
    fn server_non_invite_reliable_arms_j_at_zero() {
        let mut fsm = ServerNonInviteFsm::new(timers_tcp());
        let req = sample_request(Method::Options);
        let actions = fsm.on_event(ServerEvent::SendFinal(response_for(&req, 200)));
        assert_eq!(
            server_scheduled(&actions, TransactionTimer::J),
            Some(Duration::ZERO)
        );
    }

    // --- transport errors ---

    #[test]
    fn transport_error_terminates_every_machine() {
        let mut fsm = ClientInviteFsm::new(timers_udp());
        fsm.on_event(ClientEvent::SendRequest(sample_invite()));
        let actions = fsm.on_event(ClientEvent::TransportError);
        assert!(actions.contains(&ClientAction::Terminate(TerminationKind::TransportError)));
        // Terminated machines ignore everything afterwards.
        assert!(fsm.on_event(ClientEvent::TransportError).is_empty());

        let mut fsm = ServerNonInviteFsm::new(timers_udp());
        let actions = fsm.on_event(ServerEvent::TransportError);
        assert!(actions.contains(&ServerAction::Terminate(TerminationKind::TransportError)));
    }

    // --- ACK construction ---

    #[test]
    fn ack_follows_rfc_3261_17_1_1_3() {
        let req = sample_invite();
        let mut resp = create_response(&req, 486, "Busy Here");
        // The UAS added a To tag in its response.
        let resp_headers = {
            let mut h = Headers::new();
            for header in &resp.headers {
                if header.name.eq_ignore_ascii_case("To") {
                    h.push("To", "<sip:bob@example.com>;tag=8321234356");
                } else {
                    h.push(header.name.clone(), header.value.clone());
                }
            }
            h
        };
        resp.headers = resp_headers;

        let ack = build_ack(&req, &resp);
        assert_eq!(ack.method(), &Method::Ack);
        assert_eq!(ack.start.uri, req.start.uri);
        assert_eq!(ack.top_via(), req.top_via());
        assert_eq!(ack.headers.get("From"), req.headers.get("From"));
        assert_eq!(
            ack.headers.get("To").map(|v| v.as_str()),
            Some("<sip:bob@example.com>;tag=8321234356")
        );
        assert_eq!(ack.headers.get("Call-ID"), req.headers.get("Call-ID"));
        assert_eq!(ack.headers.get("CSeq").map(|v| v.as_str()), Some("7 ACK"));
    }
}
