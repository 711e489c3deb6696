// weir-rs - The Weir SIP Stack
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Transaction manager: owns the table of live transactions, matches every
//! inbound message to one, runs their timers and applies the actions the
//! state machines emit.
//!
//! All events that can mutate a transaction — inbound messages, TU sends,
//! timer firings, transport errors — funnel through one command mailbox, so
//! the TU never observes a transaction mid-transition. Timer callbacks carry
//! only the transaction key; a firing whose record has already left the
//! table resolves to a no-op.

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tokio::{
    sync::{mpsc, oneshot},
    time,
};
use tracing::{debug, error, warn};
use weir_core::{create_response, Method, Request, Response, SipMessage};
use weir_transport::TransportKind;

use crate::{
    fsm::{
        ClientAction, ClientEvent, ClientInviteFsm, ClientNonInviteFsm, ServerAction, ServerEvent,
        ServerInviteFsm, ServerNonInviteFsm, TerminationKind,
    },
    timers::{TimerDefaults, Transport, TransportAwareTimers},
    TransactionKey, TransactionRole, TransactionTimer,
};

/// Default SIP timer values per RFC 3261 §17.
const T1_DEFAULT: Duration = Duration::from_millis(500);
const T2_DEFAULT: Duration = Duration::from_secs(4);
const T4_DEFAULT: Duration = Duration::from_secs(5);

/// Caps on concurrently live transactions, per role.
///
/// Without a cap a peer can exhaust memory by flooding requests with unique
/// branches. When the cap is reached the oldest transaction is evicted.
#[derive(Debug, Clone, Copy)]
pub struct TransactionLimits {
    pub max_server_transactions: usize,
    pub max_client_transactions: usize,
}

impl Default for TransactionLimits {
    fn default() -> Self {
        Self {
            max_server_transactions: 10_000,
            max_client_transactions: 10_000,
        }
    }
}

impl TransactionLimits {
    pub fn new(max_server: usize, max_client: usize) -> Self {
        Self {
            max_server_transactions: max_server,
            max_client_transactions: max_client,
        }
    }

    /// No caps; for tests only.
    pub fn unlimited() -> Self {
        Self::new(usize::MAX, usize::MAX)
    }
}

/// Dispatches outbound data generated by the transaction manager.
#[async_trait]
pub trait TransportDispatcher: Send + Sync + 'static {
    async fn dispatch(&self, ctx: &TransportContext, payload: Bytes) -> Result<()>;
}

/// Callbacks delivered to the transaction user. Every method has an empty
/// default so a TU implements only what it cares about.
#[async_trait]
pub trait TransactionUser: Send + Sync + 'static {
    /// A request that matched no server transaction; `handle` posts
    /// responses into the transaction created for it.
    async fn on_incoming_request(&self, request: Request, handle: ServerTransactionHandle) {
        let _ = (request, handle);
    }

    /// A 1xx response reached a client transaction.
    async fn on_provisional(&self, key: &TransactionKey, response: &Response) {
        let _ = (key, response);
    }

    /// The first final response reached a client transaction. Delivered at
    /// most once per transaction.
    async fn on_final(&self, key: &TransactionKey, response: &Response) {
        let _ = (key, response);
    }

    /// Timer B, F or H elapsed without the awaited message.
    async fn on_timeout(&self, key: &TransactionKey) {
        let _ = key;
    }

    /// The transport failed underneath the transaction.
    async fn on_transport_failure(&self, key: &TransactionKey) {
        let _ = key;
    }

    /// The transaction entered Terminated and left the table.
    async fn on_terminated(&self, key: &TransactionKey) {
        let _ = key;
    }
}

/// Where a transaction's messages go: transport kind, remote address and,
/// for stream transports, the writer channel of the originating connection.
#[derive(Debug, Clone)]
pub struct TransportContext {
    pub transport: TransportKind,
    pub peer: SocketAddr,
    pub stream: Option<mpsc::Sender<Bytes>>,
}

impl TransportContext {
    pub fn new(
        transport: TransportKind,
        peer: SocketAddr,
        stream: Option<mpsc::Sender<Bytes>>,
    ) -> Self {
        Self {
            transport,
            peer,
            stream,
        }
    }

    /// Reports whether the wire under this context is reliable.
    pub fn reliable(&self) -> bool {
        self.transport.is_reliable()
    }
}

enum ManagerCommand {
    ServerTimerFired {
        key: TransactionKey,
        timer: TransactionTimer,
    },
    ClientTimerFired {
        key: TransactionKey,
        timer: TransactionTimer,
    },
    ClientTransportError {
        key: TransactionKey,
    },
    ServerTransportError {
        key: TransactionKey,
    },
}

enum ServerKind {
    Invite(ServerInviteFsm),
    NonInvite(ServerNonInviteFsm),
}

struct ServerEntry {
    kind: ServerKind,
    ctx: TransportContext,
    timers: HashMap<TransactionTimer, oneshot::Sender<()>>,
    started: Instant,
}

enum ClientKind {
    Invite(ClientInviteFsm),
    NonInvite(ClientNonInviteFsm),
}

struct ClientEntry {
    kind: ClientKind,
    ctx: TransportContext,
    tu: Arc<dyn TransactionUser>,
    timers: HashMap<TransactionTimer, oneshot::Sender<()>>,
    started: Instant,
}

impl ServerEntry {
    fn cancel_timer(&mut self, timer: TransactionTimer) {
        if let Some(cancel) = self.timers.remove(&timer) {
            let _ = cancel.send(());
        }
    }

    fn cancel_all(&mut self) {
        for (_, cancel) in self.timers.drain() {
            let _ = cancel.send(());
        }
    }
}

impl ClientEntry {
    fn cancel_timer(&mut self, timer: TransactionTimer) {
        if let Some(cancel) = self.timers.remove(&timer) {
            let _ = cancel.send(());
        }
    }

    fn cancel_all(&mut self) {
        for (_, cancel) in self.timers.drain() {
            let _ = cancel.send(());
        }
    }
}

fn transport_class(kind: TransportKind) -> Transport {
    match kind {
        TransportKind::Udp => Transport::Udp,
        TransportKind::Tcp => Transport::Tcp,
        TransportKind::Tls => Transport::Tls,
    }
}

/// Owns SIP transactions and drives their timers and actions.
#[derive(Clone)]
pub struct TransactionManager {
    inner: Arc<ManagerInner>,
    cmd_tx: mpsc::Sender<ManagerCommand>,
}

struct ManagerInner {
    dispatcher: Arc<dyn TransportDispatcher>,
    tu: Arc<dyn TransactionUser>,
    server: DashMap<TransactionKey, ServerEntry>,
    client: DashMap<TransactionKey, ClientEntry>,
    timer_defaults: TimerDefaults,
    pool: weir_transport::pool::ConnectionPool,
    limits: TransactionLimits,
}

impl TransactionManager {
    /// Creates a manager using the supplied dispatcher and server-side TU.
    pub fn new(dispatcher: Arc<dyn TransportDispatcher>, tu: Arc<dyn TransactionUser>) -> Self {
        Self::with_timers(dispatcher, tu, T1_DEFAULT, T2_DEFAULT, T4_DEFAULT)
    }

    /// Creates a manager with custom T1/T2/T4 (test hook).
    pub fn with_timers(
        dispatcher: Arc<dyn TransportDispatcher>,
        tu: Arc<dyn TransactionUser>,
        t1: Duration,
        t2: Duration,
        t4: Duration,
    ) -> Self {
        Self::with_timers_and_limits(dispatcher, tu, t1, t2, t4, TransactionLimits::default())
    }

    /// Creates a manager with custom timers and transaction caps.
    pub fn with_timers_and_limits(
        dispatcher: Arc<dyn TransportDispatcher>,
        tu: Arc<dyn TransactionUser>,
        t1: Duration,
        t2: Duration,
        t4: Duration,
        limits: TransactionLimits,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(128);
        let manager = Self {
            inner: Arc::new(ManagerInner {
                dispatcher,
                tu,
                server: DashMap::new(),
                client: DashMap::new(),
                timer_defaults: TimerDefaults { t1, t2, t4 },
                pool: weir_transport::pool::ConnectionPool::new(),
                limits,
            }),
            cmd_tx,
        };
        manager.spawn_command_loop(cmd_rx);
        manager
    }

    /// Number of live client transactions.
    pub fn client_count(&self) -> usize {
        self.inner.client.len()
    }

    /// Number of live server transactions.
    pub fn server_count(&self) -> usize {
        self.inner.server.len()
    }

    /// Whether a transaction with this key is live.
    pub fn contains(&self, key: &TransactionKey) -> bool {
        match key.role {
            TransactionRole::Client => self.inner.client.contains_key(key),
            TransactionRole::Server => self.inner.server.contains_key(key),
        }
    }

    fn spawn_command_loop(&self, mut rx: mpsc::Receiver<ManagerCommand>) {
        let manager = self.clone();
        tokio::spawn(async move {
            while let Some(cmd) = rx.recv().await {
                match cmd {
                    ManagerCommand::ServerTimerFired { key, timer } => {
                        manager.handle_server_timer(key, timer).await;
                    }
                    ManagerCommand::ClientTimerFired { key, timer } => {
                        manager.handle_client_timer(key, timer).await;
                    }
                    ManagerCommand::ClientTransportError { key } => {
                        manager.handle_client_transport_error(key).await;
                    }
                    ManagerCommand::ServerTransportError { key } => {
                        manager.handle_server_transport_error(key).await;
                    }
                }
            }
        });
    }

    /// Routes one parsed inbound message: responses into client
    /// transactions, ACKs onto the server INVITE they acknowledge, other
    /// requests into existing server transactions or to the TU as a new one.
    pub async fn receive(&self, message: SipMessage, ctx: TransportContext) {
        match message {
            SipMessage::Response(response) => self.receive_response(response).await,
            SipMessage::Request(request) => self.receive_request(request, ctx).await,
        }
    }

    /// Feeds a network response into the matching client transaction.
    /// Responses matching nothing are dropped silently.
    pub async fn receive_response(&self, response: Response) {
        let Some(key) = TransactionKey::from_response(&response) else {
            debug!("response without branch or CSeq dropped");
            return;
        };
        let actions = {
            let Some(mut entry) = self.inner.client.get_mut(&key) else {
                debug!(branch = %key.branch, code = response.code(), "no matching client transaction; dropping response");
                return;
            };
            let event = if response.is_provisional() {
                ClientEvent::ReceiveProvisional(response)
            } else {
                ClientEvent::ReceiveFinal(response)
            };
            match &mut entry.kind {
                ClientKind::Invite(fsm) => fsm.on_event(event),
                ClientKind::NonInvite(fsm) => fsm.on_event(event),
            }
        };
        self.apply_client_actions(&key, actions).await;
    }

    /// Feeds a network request in: retransmissions are absorbed by their
    /// transaction, ACKs confirm the server INVITE, anything new creates a
    /// server transaction and is handed to the TU.
    pub async fn receive_request(&self, request: Request, ctx: TransportContext) {
        if request.method() == &Method::Ack {
            self.receive_ack(request).await;
            return;
        }

        let Some(key) = TransactionKey::from_request(&request, TransactionRole::Server) else {
            warn!(method = %request.method(), "request without RFC 3261 branch dropped");
            return;
        };

        if let Some(entry) = self.inner.server.get(&key) {
            let actions = match &entry.kind {
                ServerKind::Invite(fsm) => fsm.on_retransmit(),
                ServerKind::NonInvite(fsm) => fsm.on_retransmit(),
            };
            drop(entry);
            debug!(branch = %key.branch, method = %key.method, "absorbed request retransmission");
            self.apply_server_actions(&key, actions).await;
            return;
        }

        self.enforce_server_limit();

        let timers = TransportAwareTimers::with_defaults(
            transport_class(ctx.transport),
            self.inner.timer_defaults,
        );
        let mut initial_actions = Vec::new();
        let kind = if request.method() == &Method::Invite {
            let mut fsm = ServerInviteFsm::new(timers);
            // Answer 100 Trying up front so retransmissions of the INVITE
            // have a response to replay while the TU decides.
            let trying = create_response(&request, 100, "Trying");
            initial_actions = fsm.on_event(ServerEvent::SendProvisional(trying));
            ServerKind::Invite(fsm)
        } else {
            ServerKind::NonInvite(ServerNonInviteFsm::new(timers))
        };

        let entry = ServerEntry {
            kind,
            ctx,
            timers: HashMap::new(),
            started: Instant::now(),
        };
        self.inner.server.insert(key.clone(), entry);
        self.apply_server_actions(&key, initial_actions).await;

        let handle = ServerTransactionHandle {
            manager: self.clone(),
            key: key.clone(),
        };
        self.inner.tu.on_incoming_request(request, handle).await;
    }

    async fn receive_ack(&self, request: Request) {
        let Some(key) = TransactionKey::from_request(&request, TransactionRole::Server) else {
            debug!("ACK without RFC 3261 branch dropped");
            return;
        };
        let actions = {
            let Some(mut entry) = self.inner.server.get_mut(&key) else {
                // The ACK for a 2xx never matches here; it reaches the TU
                // through the dialog layer's own path.
                debug!(branch = %key.branch, "ACK matched no INVITE server transaction; dropped");
                return;
            };
            match &mut entry.kind {
                ServerKind::Invite(fsm) => fsm.on_event(ServerEvent::ReceiveAck),
                ServerKind::NonInvite(_) => Vec::new(),
            }
        };
        self.apply_server_actions(&key, actions).await;
    }

    /// Starts a client transaction and transmits the initial request.
    ///
    /// Rejects requests that cannot open one: ACK (it belongs to an INVITE
    /// transaction or to the dialog layer) and requests whose top Via lacks
    /// an RFC 3261 branch.
    pub async fn start_client_transaction(
        &self,
        request: Request,
        ctx: TransportContext,
        tu: Arc<dyn TransactionUser>,
    ) -> Result<TransactionKey> {
        if request.method() == &Method::Ack {
            bail!("ACK does not open a client transaction");
        }
        let key = TransactionKey::from_request(&request, TransactionRole::Client)
            .ok_or_else(|| anyhow!("client request is missing an RFC 3261 Via branch"))?;
        if self.inner.client.contains_key(&key) {
            bail!("a client transaction for branch {} already exists", key.branch);
        }

        self.enforce_client_limit().await;

        let timers = TransportAwareTimers::with_defaults(
            transport_class(ctx.transport),
            self.inner.timer_defaults,
        );
        let (kind, actions) = if request.method() == &Method::Invite {
            let mut fsm = ClientInviteFsm::new(timers);
            let actions = fsm.on_event(ClientEvent::SendRequest(request));
            (ClientKind::Invite(fsm), actions)
        } else {
            let mut fsm = ClientNonInviteFsm::new(timers);
            let actions = fsm.on_event(ClientEvent::SendRequest(request));
            (ClientKind::NonInvite(fsm), actions)
        };

        let entry = ClientEntry {
            kind,
            ctx,
            tu,
            timers: HashMap::new(),
            started: Instant::now(),
        };
        self.inner.client.insert(key.clone(), entry);
        self.apply_client_actions(&key, actions).await;
        Ok(key)
    }

    /// Posts a provisional response into a server transaction.
    pub async fn send_provisional(&self, key: &TransactionKey, response: Response) {
        let Some(actions) = self.server_event_actions(key, ServerEvent::SendProvisional(response))
        else {
            return;
        };
        self.apply_server_actions(key, actions).await;
    }

    /// Posts a final response into a server transaction. Finals posted after
    /// the transaction closed are silently discarded.
    pub async fn send_final(&self, key: &TransactionKey, response: Response) {
        let Some(actions) = self.server_event_actions(key, ServerEvent::SendFinal(response)) else {
            return;
        };
        self.apply_server_actions(key, actions).await;
    }

    fn server_event_actions(
        &self,
        key: &TransactionKey,
        event: ServerEvent,
    ) -> Option<Vec<ServerAction>> {
        let mut entry = self.inner.server.get_mut(key)?;
        Some(match &mut entry.kind {
            ServerKind::Invite(fsm) => fsm.on_event(event),
            ServerKind::NonInvite(fsm) => fsm.on_event(event),
        })
    }

    async fn handle_server_timer(&self, key: TransactionKey, timer: TransactionTimer) {
        let actions = {
            let Some(mut entry) = self.inner.server.get_mut(&key) else {
                // Record already gone; a late firing is a no-op.
                return;
            };
            entry.cancel_timer(timer);
            match &mut entry.kind {
                ServerKind::Invite(fsm) => fsm.on_event(ServerEvent::TimerFired(timer)),
                ServerKind::NonInvite(fsm) => fsm.on_event(ServerEvent::TimerFired(timer)),
            }
        };
        self.apply_server_actions(&key, actions).await;
    }

    async fn handle_client_timer(&self, key: TransactionKey, timer: TransactionTimer) {
        let actions = {
            let Some(mut entry) = self.inner.client.get_mut(&key) else {
                return;
            };
            entry.cancel_timer(timer);
            match &mut entry.kind {
                ClientKind::Invite(fsm) => fsm.on_event(ClientEvent::TimerFired(timer)),
                ClientKind::NonInvite(fsm) => fsm.on_event(ClientEvent::TimerFired(timer)),
            }
        };
        self.apply_client_actions(&key, actions).await;
    }

    async fn handle_client_transport_error(&self, key: TransactionKey) {
        let actions = {
            let Some(mut entry) = self.inner.client.get_mut(&key) else {
                return;
            };
            match &mut entry.kind {
                ClientKind::Invite(fsm) => fsm.on_event(ClientEvent::TransportError),
                ClientKind::NonInvite(fsm) => fsm.on_event(ClientEvent::TransportError),
            }
        };
        self.apply_client_actions(&key, actions).await;
    }

    async fn handle_server_transport_error(&self, key: TransactionKey) {
        let actions = {
            let Some(mut entry) = self.inner.server.get_mut(&key) else {
                return;
            };
            match &mut entry.kind {
                ServerKind::Invite(fsm) => fsm.on_event(ServerEvent::TransportError),
                ServerKind::NonInvite(fsm) => fsm.on_event(ServerEvent::TransportError),
            }
        };
        self.apply_server_actions(&key, actions).await;
    }

    async fn apply_server_actions(&self, key: &TransactionKey, actions: Vec<ServerAction>) {
        for action in actions {
            match action {
                ServerAction::Transmit(bytes) => {
                    let Some(ctx) = self.inner.server.get(key).map(|e| e.ctx.clone()) else {
                        continue;
                    };
                    if let Err(e) = self.dispatch_with_pool(&ctx, bytes).await {
                        error!(%e, branch = %key.branch, "server transmit failed");
                        let _ = self
                            .cmd_tx
                            .send(ManagerCommand::ServerTransportError { key: key.clone() })
                            .await;
                    }
                }
                ServerAction::Schedule { timer, duration } => {
                    self.schedule_server_timer(key.clone(), timer, duration);
                }
                ServerAction::Cancel(timer) => {
                    if let Some(mut entry) = self.inner.server.get_mut(key) {
                        entry.cancel_timer(timer);
                    }
                }
                ServerAction::Terminate(kind) => {
                    if let Some((_, mut entry)) = self.inner.server.remove(key) {
                        entry.cancel_all();
                        match kind {
                            TerminationKind::Timeout => self.inner.tu.on_timeout(key).await,
                            TerminationKind::TransportError => {
                                self.inner.tu.on_transport_failure(key).await
                            }
                            TerminationKind::Completed => {}
                        }
                        self.inner.tu.on_terminated(key).await;
                    }
                }
            }
        }
    }

    async fn apply_client_actions(&self, key: &TransactionKey, actions: Vec<ClientAction>) {
        for action in actions {
            match action {
                ClientAction::Transmit(bytes) | ClientAction::EmitAck(bytes) => {
                    let Some(ctx) = self.inner.client.get(key).map(|e| e.ctx.clone()) else {
                        continue;
                    };
                    if let Err(e) = self.dispatch_with_pool(&ctx, bytes).await {
                        error!(%e, branch = %key.branch, "client transmit failed");
                        let _ = self
                            .cmd_tx
                            .send(ManagerCommand::ClientTransportError { key: key.clone() })
                            .await;
                    }
                }
                ClientAction::Deliver(response) => {
                    let Some(tu) = self.inner.client.get(key).map(|e| e.tu.clone()) else {
                        continue;
                    };
                    if response.is_provisional() {
                        tu.on_provisional(key, &response).await;
                    } else {
                        tu.on_final(key, &response).await;
                    }
                }
                ClientAction::Schedule { timer, duration } => {
                    self.schedule_client_timer(key.clone(), timer, duration);
                }
                ClientAction::Cancel(timer) => {
                    if let Some(mut entry) = self.inner.client.get_mut(key) {
                        entry.cancel_timer(timer);
                    }
                }
                ClientAction::Terminate(kind) => {
                    if let Some((_, mut entry)) = self.inner.client.remove(key) {
                        entry.cancel_all();
                        match kind {
                            TerminationKind::Timeout => entry.tu.on_timeout(key).await,
                            TerminationKind::TransportError => {
                                entry.tu.on_transport_failure(key).await
                            }
                            TerminationKind::Completed => {}
                        }
                        entry.tu.on_terminated(key).await;
                    }
                }
            }
        }
    }

    /// Arms (or rearms) a timer for a server transaction. A zero duration
    /// fires immediately through the mailbox so the transition still happens
    /// inside the serialization domain.
    fn schedule_server_timer(
        &self,
        key: TransactionKey,
        timer: TransactionTimer,
        duration: Duration,
    ) {
        if duration.is_zero() {
            if let Some(mut entry) = self.inner.server.get_mut(&key) {
                entry.cancel_timer(timer);
            } else {
                return;
            }
            let cmd_tx = self.cmd_tx.clone();
            tokio::spawn(async move {
                let _ = cmd_tx
                    .send(ManagerCommand::ServerTimerFired { key, timer })
                    .await;
            });
            return;
        }
        let Some(mut entry) = self.inner.server.get_mut(&key) else {
            return;
        };
        entry.cancel_timer(timer);
        let (cancel_tx, mut cancel_rx) = oneshot::channel();
        entry.timers.insert(timer, cancel_tx);
        let cmd_tx = self.cmd_tx.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = time::sleep(duration) => {
                    let _ = cmd_tx.send(ManagerCommand::ServerTimerFired { key, timer }).await;
                }
                _ = &mut cancel_rx => {}
            }
        });
    }

    /// Arms (or rearms) a timer for a client transaction.
    fn schedule_client_timer(
        &self,
        key: TransactionKey,
        timer: TransactionTimer,
        duration: Duration,
    ) {
        if duration.is_zero() {
            if let Some(mut entry) = self.inner.client.get_mut(&key) {
                entry.cancel_timer(timer);
            } else {
                return;
            }
            let cmd_tx = self.cmd_tx.clone();
            tokio::spawn(async move {
                let _ = cmd_tx
                    .send(ManagerCommand::ClientTimerFired { key, timer })
                    .await;
            });
            return;
        }
        let Some(mut entry) = self.inner.client.get_mut(&key) else {
            return;
        };
        entry.cancel_timer(timer);
        let (cancel_tx, mut cancel_rx) = oneshot::channel();
        entry.timers.insert(timer, cancel_tx);
        let cmd_tx = self.cmd_tx.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = time::sleep(duration) => {
                    let _ = cmd_tx.send(ManagerCommand::ClientTimerFired { key, timer }).await;
                }
                _ = &mut cancel_rx => {}
            }
        });
    }

    async fn dispatch_with_pool(&self, ctx: &TransportContext, bytes: Bytes) -> Result<()> {
        match ctx.transport {
            TransportKind::Tcp if ctx.stream.is_none() => {
                self.inner.pool.send_tcp(ctx.peer, bytes).await
            }
            _ => self.inner.dispatcher.dispatch(ctx, bytes).await,
        }
    }

    fn enforce_server_limit(&self) {
        if self.inner.server.len() < self.inner.limits.max_server_transactions {
            return;
        }
        let oldest = self
            .inner
            .server
            .iter()
            .min_by_key(|entry| entry.started)
            .map(|entry| entry.key().clone());
        if let Some(key) = oldest {
            warn!(branch = %key.branch, "server transaction cap reached; evicting oldest");
            if let Some((_, mut entry)) = self.inner.server.remove(&key) {
                entry.cancel_all();
            }
        }
    }

    async fn enforce_client_limit(&self) {
        if self.inner.client.len() < self.inner.limits.max_client_transactions {
            return;
        }
        let oldest = self
            .inner
            .client
            .iter()
            .min_by_key(|entry| entry.started)
            .map(|entry| entry.key().clone());
        if let Some(key) = oldest {
            warn!(branch = %key.branch, "client transaction cap reached; evicting oldest");
            if let Some((_, mut entry)) = self.inner.client.remove(&key) {
                entry.cancel_all();
                entry.tu.on_terminated(&key).await;
            }
        }
    }
}

/// Handle for posting responses into a server transaction.
#[derive(Clone)]
pub struct ServerTransactionHandle {
    manager: TransactionManager,
    key: TransactionKey,
}

impl ServerTransactionHandle {
    pub async fn send_provisional(&self, response: Response) {
        self.manager.send_provisional(&self.key, response).await;
    }

    pub async fn send_final(&self, response: Response) {
        self.manager.send_final(&self.key, response).await;
    }

    pub fn key(&self) -> &TransactionKey {
        &self.key
    }
}
