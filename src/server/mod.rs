//! Ensemble's server-side functionality modules.
//!
//! A server runs one main event-loop task driving everything: listener
//! accepts, connection events, the health-check tick, and through them the
//! handshake, election, and consensus handlers. All membership and round
//! state is owned by that task alone.

mod handshake;
mod paxos;
mod quorum;
mod statemach;

pub use statemach::WorkloadFn;

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Duration, Instant, MissedTickBehavior};

use crate::conn::{ConnEvent, ConnId, ConnPool};
use crate::server::paxos::PaxosEngine;
use crate::server::quorum::Quorum;
use crate::server::statemach::StateMachine;
use crate::utils::{tcp_bind_with_retry, EnsembleError};
use crate::wire::{
    CodecError, Command, CommandType, ErrorCode, HostId, PeerState,
    DEFAULT_MAX_FRAME,
};

/// Configuration parameters struct.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct ServerConfig {
    /// Timeout of a peer handshake (connect + response) in millisecs.
    pub handshake_timeout_ms: u64,

    /// Interval of the quorum health-check tick in millisecs.
    pub health_check_interval_ms: u64,

    /// Abandonment deadline of one consensus round in millisecs.
    pub request_timeout_ms: u64,

    /// Cap on a single wire frame's payload length in bytes.
    pub max_frame_size: usize,

    /// Acceptance policy: unanimous among live peers (default), or
    /// majority-of-live when set to false.
    pub require_unanimous: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            handshake_timeout_ms: 3000,
            health_check_interval_ms: 1000,
            request_timeout_ms: 5000,
            max_frame_size: DEFAULT_MAX_FRAME,
            require_unanimous: true,
        }
    }
}

impl ServerConfig {
    fn sanitize(&self) -> Result<(), EnsembleError> {
        if self.handshake_timeout_ms == 0 {
            return logged_err!(
                "invalid config.handshake_timeout_ms '{}'",
                self.handshake_timeout_ms
            );
        }
        if self.health_check_interval_ms == 0 {
            return logged_err!(
                "invalid config.health_check_interval_ms '{}'",
                self.health_check_interval_ms
            );
        }
        if self.request_timeout_ms == 0 {
            return logged_err!(
                "invalid config.request_timeout_ms '{}'",
                self.request_timeout_ms
            );
        }
        if self.max_frame_size == 0 {
            return logged_err!(
                "invalid config.max_frame_size '{}'",
                self.max_frame_size
            );
        }
        Ok(())
    }
}

/// Cluster view published by the event loop for embedder observability.
#[derive(Debug, Clone, Default)]
struct ClusterStatus {
    /// Endpoint currently believed to lead the cluster.
    leader: Option<SocketAddr>,

    /// Number of live servers in the local view, self included.
    live: usize,
}

/// An outbound handshake awaiting its response.
struct PendingHandshake {
    endpoint: SocketAddr,
    deadline: Instant,
}

/// An Ensemble server: one member of the replicated execution cluster.
///
/// Constructed with a bind address and a workload callback; peers (self
/// included) are registered with [`add`](Server::add) before
/// [`start`](Server::start) spawns the event loop.
pub struct Server {
    me: SocketAddr,
    config: ServerConfig,
    workload_fn: WorkloadFn,
    endpoints: Vec<SocketAddr>,
    tx_shutdown: Option<watch::Sender<bool>>,
    rx_status: Option<watch::Receiver<ClusterStatus>>,
    _node_handle: Option<JoinHandle<()>>,
}

impl Server {
    /// Creates a new server with the default configuration.
    pub fn new(
        bind_addr: SocketAddr,
        workload_fn: impl Fn(&[u8]) -> Vec<u8> + Send + Sync + 'static,
    ) -> Self {
        Server {
            me: bind_addr,
            config: ServerConfig::default(),
            workload_fn: Arc::new(workload_fn),
            endpoints: Vec::new(),
            tx_shutdown: None,
            rx_status: None,
            _node_handle: None,
        }
    }

    /// Creates a new server, overlaying configuration fields parsed from
    /// the given TOML string onto the defaults.
    pub fn new_with_config(
        bind_addr: SocketAddr,
        workload_fn: impl Fn(&[u8]) -> Vec<u8> + Send + Sync + 'static,
        config_str: Option<&str>,
    ) -> Result<Self, EnsembleError> {
        let config = parsed_config!(config_str => ServerConfig;
                                    handshake_timeout_ms,
                                    health_check_interval_ms,
                                    request_timeout_ms, max_frame_size,
                                    require_unanimous)?;
        config.sanitize()?;
        let mut server = Self::new(bind_addr, workload_fn);
        server.config = config;
        Ok(server)
    }

    /// Registers a server endpoint of the cluster, self included. Must be
    /// called before `start()`; duplicates are rejected.
    pub fn add(&mut self, endpoint: SocketAddr) -> Result<(), EnsembleError> {
        if self._node_handle.is_some() {
            return logged_err!("add('{}') after start", endpoint);
        }
        if self.endpoints.contains(&endpoint) {
            return logged_err!("duplicate server endpoint '{}'", endpoint);
        }
        self.endpoints.push(endpoint);
        Ok(())
    }

    /// Binds the listener and spawns the event-loop task. Handshakes with
    /// unreachable peers do not block startup; they are retried on every
    /// health-check tick.
    pub async fn start(&mut self) -> Result<(), EnsembleError> {
        if self._node_handle.is_some() {
            return logged_err!("server '{}' already started", self.me);
        }

        let my_id = HostId(rand::random::<u128>());
        let mut quorum = Quorum::new(self.me, my_id);
        for &endpoint in &self.endpoints {
            quorum.add(endpoint)?;
        }
        quorum.mark_started();

        let listener = tcp_bind_with_retry(self.me, 10).await?;
        let (pool, rx_event) = ConnPool::new(self.config.max_frame_size);
        let engine = PaxosEngine::new(
            self.me,
            self.config.require_unanimous,
            Duration::from_millis(self.config.request_timeout_ms),
        );
        let statemach = StateMachine::new(self.workload_fn.clone());

        let (tx_status, rx_status) = watch::channel(ClusterStatus::default());
        let (tx_shutdown, rx_shutdown) = watch::channel(false);
        let (tx_connected, rx_connected) = mpsc::unbounded_channel();

        let node = ServerNode {
            config: self.config.clone(),
            me: self.me,
            quorum,
            pool,
            engine,
            statemach,
            listener,
            rx_event,
            tx_connected,
            rx_connected,
            pending_connects: HashSet::new(),
            pending_handshakes: HashMap::new(),
            tx_status,
            rx_shutdown,
        };
        pf_info!(
            "server {} ({}) starting with {} configured servers",
            self.me,
            my_id,
            self.endpoints.len()
        );
        self._node_handle = Some(tokio::spawn(node.run()));
        self.tx_shutdown = Some(tx_shutdown);
        self.rx_status = Some(rx_status);
        Ok(())
    }

    /// Endpoint this server currently believes leads the cluster.
    pub fn leader(&self) -> Option<SocketAddr> {
        self.rx_status.as_ref().and_then(|rx| rx.borrow().leader)
    }

    /// Do we currently believe we are the leader?
    pub fn is_leader(&self) -> bool {
        self.leader() == Some(self.me)
    }

    /// Number of live servers in this server's local view, self included.
    pub fn live_servers(&self) -> usize {
        self.rx_status.as_ref().map_or(0, |rx| rx.borrow().live)
    }

    /// Signals the event-loop task to terminate.
    pub fn shutdown(&mut self) {
        if let Some(tx) = self.tx_shutdown.take() {
            let _ = tx.send(true);
        }
    }
}

/// The server's event-loop state, owned entirely by the spawned task.
struct ServerNode {
    config: ServerConfig,
    me: SocketAddr,

    quorum: Quorum,
    pool: ConnPool,
    engine: PaxosEngine,
    statemach: StateMachine,

    listener: TcpListener,
    rx_event: mpsc::UnboundedReceiver<ConnEvent>,

    /// Results of background connect attempts toward peers.
    tx_connected:
        mpsc::UnboundedSender<(SocketAddr, Result<TcpStream, EnsembleError>)>,
    rx_connected:
        mpsc::UnboundedReceiver<(SocketAddr, Result<TcpStream, EnsembleError>)>,

    /// Peers with a connect attempt currently in flight.
    pending_connects: HashSet<SocketAddr>,

    /// Outbound handshakes awaiting their response, by connection.
    pending_handshakes: HashMap<ConnId, PendingHandshake>,

    tx_status: watch::Sender<ClusterStatus>,
    rx_shutdown: watch::Receiver<bool>,
}

impl ServerNode {
    /// Main event loop.
    async fn run(mut self) {
        // first health pass bootstraps the handshakes (and promotes self
        // right away in a single-node quorum)
        self.health_check();

        let mut tick = time::interval(Duration::from_millis(
            self.config.health_check_interval_ms,
        ));
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tick.tick().await; // consume the immediate first tick

        loop {
            tokio::select! {
                // shutdown signal (or all Server handles dropped)
                _ = self.rx_shutdown.changed() => break,

                // new inbound connection (peer or client)
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        let conn = self.pool.register(stream);
                        pf_debug!("accepted connection {} from '{}'", conn, addr);
                    }
                    Err(e) => pf_warn!("error accepting connection: {}", e),
                },

                // background connect attempt finished
                Some((endpoint, result)) = self.rx_connected.recv() => {
                    self.handle_connect_result(endpoint, result);
                },

                // connection event (frame / corrupt / closed)
                Some(event) = self.rx_event.recv() => {
                    self.handle_event(event);
                },

                // periodic quorum health check
                _ = tick.tick() => self.health_check(),
            }
        }

        pf_debug!("server {} event loop exited", self.me);
    }

    /// Dispatches one connection event.
    fn handle_event(&mut self, event: ConnEvent) {
        match event {
            ConnEvent::Frame(conn, cmd) => self.handle_frame(conn, cmd),

            ConnEvent::Corrupt(conn, err) => {
                pf_warn!("corrupt frame on conn {}: {}", conn, err);
                if let CodecError::FrameOversize { .. } = err {
                    // tell the sender before dropping the connection
                    self.pool.send(
                        conn,
                        Command::request_fail(Some(ErrorCode::FrameOversize)),
                    );
                }
                self.pool.close(conn);
            }

            ConnEvent::Closed(conn) => {
                self.pool.forget(conn);
                self.pending_handshakes.remove(&conn);
                self.engine.drop_client(conn);
                if let Some(endpoint) = self.quorum.peer_by_conn(conn) {
                    pf_info!("connection to peer {} lost", endpoint);
                    self.demote_peer(endpoint);
                }
            }
        }
    }

    /// Dispatches one received command frame. Field presence was validated
    /// by the codec for the frame's type.
    fn handle_frame(&mut self, conn: ConnId, cmd: Command) {
        match cmd.kind {
            CommandType::HandshakeStart => self.handle_handshake_start(conn),

            CommandType::HandshakeResponse => {
                self.handle_handshake_response(conn, cmd)
            }

            CommandType::RequestPrepare => {
                if let Some(id) = cmd.proposal_id {
                    self.engine.receive_prepare(conn, id);
                }
            }

            CommandType::RequestPromise | CommandType::RequestFail => {
                let promised = cmd.kind == CommandType::RequestPromise;
                match self.pool.peer_of(conn) {
                    Some(endpoint) => self.engine.receive_promise(
                        &self.statemach,
                        endpoint,
                        promised,
                    ),
                    None => {
                        pf_warn!("phase-1 answer on unbound conn {}", conn)
                    }
                }
            }

            CommandType::RequestAccept => {
                if let Some(workload) = cmd.workload {
                    self.engine.receive_accept(&self.statemach, conn, workload);
                }
            }

            CommandType::RequestAccepted => match self.pool.peer_of(conn) {
                Some(endpoint) => {
                    if let Some(workload) = cmd.workload {
                        self.engine.receive_accepted(endpoint, workload);
                    }
                }
                None => pf_warn!("accepted answer on unbound conn {}", conn),
            },

            CommandType::ClientRequest => {
                if let Some(workload) = cmd.workload {
                    self.engine.start(
                        &self.quorum,
                        &self.statemach,
                        conn,
                        workload,
                    );
                }
            }
        }
        self.flush_outbox();
    }

    /// Periodic health pass: expire stale handshakes and rounds, retry dead
    /// peers, re-run the election, publish the refreshed view.
    fn health_check(&mut self) {
        let now = Instant::now();
        self.expire_handshakes(now);
        self.retry_unconnected_peers();

        let suspects = self.engine.expire_rounds(now);
        for endpoint in suspects {
            pf_warn!("peer {} unresponsive, demoting", endpoint);
            self.demote_peer(endpoint);
        }
        self.flush_outbox();

        self.run_election();
        self.publish_status();
    }

    /// Marks a peer dead, closes its installed connection, and aborts the
    /// consensus rounds still waiting on it.
    fn demote_peer(&mut self, endpoint: SocketAddr) {
        if let Some(conn) = self.quorum.lookup(endpoint).and_then(|p| p.conn) {
            self.pool.close(conn);
        }
        self.quorum.set_conn(endpoint, None);
        self.quorum.adjust_state(endpoint, PeerState::Dead);
        self.engine.abort_for_peer(endpoint);
        self.flush_outbox();
    }

    /// Transmits everything the engine staged.
    fn flush_outbox(&mut self) {
        for (conn, cmd) in self.engine.take_outbox() {
            if !self.pool.send(conn, cmd) {
                pf_debug!("dropping command for closed conn {}", conn);
            }
        }
    }

    /// Publishes the current cluster view for embedder observability.
    fn publish_status(&self) {
        let mut live = self
            .quorum
            .servers()
            .filter(|p| p.state.is_alive())
            .count();
        if self.quorum.lookup(self.me).is_none() {
            live += 1; // self is live even when not a configured participant
        }
        let leader = if self.quorum.we_are_the_leader() {
            Some(self.me)
        } else {
            self.quorum
                .servers()
                .find(|p| p.state == PeerState::AliveLeader)
                .map(|p| p.endpoint)
        };
        let _ = self.tx_status.send_replace(ClusterStatus { leader, live });
    }
}
