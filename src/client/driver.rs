//! Client driver task: leader discovery and request pipelining.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{self, Duration, Instant};

use crate::client::{ClientConfig, RequestError};
use crate::conn::{ConnEvent, ConnId, ConnPool};
use crate::utils::{tcp_connect_with_retry, EnsembleError};
use crate::wire::{Command, CommandType, ErrorCode, HostId, PeerState};

/// One workload submission handed from `Client::send()` to the driver.
pub(super) struct Submission {
    pub(super) workload: Bytes,
    pub(super) timeout: Duration,
    pub(super) slot: oneshot::Sender<Result<Bytes, RequestError>>,
}

/// What the client knows about one configured server.
#[derive(Default)]
struct ServerInfo {
    conn: Option<ConnId>,
    host_id: Option<HostId>,
    state: PeerState,
}

/// One submitted request awaiting its response. The record stays queued
/// after a timeout (with the slot taken) so that FIFO response matching
/// stays aligned with the server's reply order.
struct PendingRequest {
    request_id: u64,
    deadline: Instant,
    slot: Option<oneshot::Sender<Result<Bytes, RequestError>>>,
}

/// The client's driver task state.
pub(super) struct ClientDriver {
    config: ClientConfig,
    endpoints: Vec<SocketAddr>,

    pool: ConnPool,
    rx_event: mpsc::UnboundedReceiver<ConnEvent>,
    rx_submit: mpsc::UnboundedReceiver<Submission>,

    servers: HashMap<SocketAddr, ServerInfo>,
    leader: Option<SocketAddr>,

    /// Monotonic request id counter.
    next_request_id: u64,

    /// Outstanding requests in submission order.
    pending: VecDeque<PendingRequest>,
}

impl ClientDriver {
    pub(super) fn new(
        config: ClientConfig,
        endpoints: Vec<SocketAddr>,
        rx_submit: mpsc::UnboundedReceiver<Submission>,
    ) -> Self {
        let (pool, rx_event) = ConnPool::new(config.max_frame_size);
        let servers = endpoints
            .iter()
            .map(|ep| (*ep, ServerInfo::default()))
            .collect();
        ClientDriver {
            config,
            endpoints,
            pool,
            rx_event,
            rx_submit,
            servers,
            leader: None,
            next_request_id: 0,
            pending: VecDeque::new(),
        }
    }

    /// Runs the driver: leader discovery first (reported through
    /// `tx_ready`), then the submission/response loop.
    pub(super) async fn run(
        mut self,
        tx_ready: oneshot::Sender<Result<(), EnsembleError>>,
    ) {
        let deadline = Instant::now()
            + Duration::from_millis(self.config.start_timeout_ms);
        let result = self.discover_leader(deadline).await;
        let failed = result.is_err();
        if tx_ready.send(result).is_err() || failed {
            return;
        }

        loop {
            let next_deadline = self
                .pending
                .iter()
                .filter(|req| req.slot.is_some())
                .map(|req| req.deadline)
                .min();

            tokio::select! {
                submission = self.rx_submit.recv() => match submission {
                    Some(submission) => self.handle_submit(submission).await,
                    None => break, // Client handle dropped
                },

                Some(event) = self.rx_event.recv() => self.absorb_event(event),

                _ = time::sleep_until(next_deadline.unwrap_or_else(
                    || Instant::now() + Duration::from_secs(3600),
                )), if next_deadline.is_some() => self.expire_requests(),
            }
        }

        pf_debug!("client driver exited");
    }

    /// Handshakes every configured server repeatedly until one of them
    /// reports itself leader, or the overall deadline passes.
    async fn discover_leader(
        &mut self,
        deadline: Instant,
    ) -> Result<(), EnsembleError> {
        loop {
            self.handshake_round().await;
            if let Some(leader) = self.pick_leader() {
                pf_info!("leader discovered at {}", leader);
                self.leader = Some(leader);
                return Ok(());
            }
            if Instant::now() >= deadline {
                return logged_err!("no leader discovered within start timeout");
            }
            time::sleep(Duration::from_millis(200)).await;
        }
    }

    /// One handshake pass: (re)connect missing connections, send
    /// `handshake-start` everywhere, and absorb responses until all asked
    /// servers answered or the handshake timeout fires.
    async fn handshake_round(&mut self) {
        let timeout = Duration::from_millis(self.config.handshake_timeout_ms);

        let mut awaiting: Vec<ConnId> = Vec::new();
        for endpoint in self.endpoints.clone() {
            if self.servers[&endpoint].conn.is_none() {
                match time::timeout(
                    timeout,
                    tcp_connect_with_retry(endpoint, 0),
                )
                .await
                {
                    Ok(Ok(stream)) => {
                        let conn = self.pool.register(stream);
                        self.pool.bind_peer(conn, endpoint);
                        let info = self.servers.get_mut(&endpoint).unwrap();
                        info.conn = Some(conn);
                        info.state = PeerState::Unknown;
                    }
                    _ => {
                        pf_debug!("server {} unreachable", endpoint);
                        self.servers.get_mut(&endpoint).unwrap().state =
                            PeerState::Dead;
                        continue;
                    }
                }
            }
            let conn = self.servers[&endpoint].conn.unwrap();
            if self.pool.send(conn, Command::handshake_start()) {
                awaiting.push(conn);
            }
        }

        let round_deadline = Instant::now() + timeout;
        while !awaiting.is_empty() {
            match time::timeout_at(round_deadline, self.rx_event.recv()).await
            {
                Ok(Some(ConnEvent::Frame(conn, cmd)))
                    if cmd.kind == CommandType::HandshakeResponse =>
                {
                    awaiting.retain(|c| *c != conn);
                    if let Some(endpoint) = self.pool.peer_of(conn) {
                        let info =
                            self.servers.get_mut(&endpoint).unwrap();
                        info.host_id = cmd.host_id;
                        info.state =
                            cmd.host_state.unwrap_or(PeerState::Unknown);
                    }
                }
                Ok(Some(event)) => self.absorb_event(event),
                Ok(None) | Err(_) => break,
            }
        }
    }

    /// The server to route requests to: the one reporting `AliveLeader`
    /// (lowest host id on the off chance several claim it).
    fn pick_leader(&self) -> Option<SocketAddr> {
        self.servers
            .iter()
            .filter(|(_, info)| {
                info.state == PeerState::AliveLeader && info.conn.is_some()
            })
            .min_by_key(|(_, info)| info.host_id)
            .map(|(endpoint, _)| *endpoint)
    }

    fn leader_conn(&self) -> Option<ConnId> {
        self.leader
            .and_then(|ep| self.servers.get(&ep))
            .and_then(|info| info.conn)
    }

    /// Routes one submission to the leader's connection, re-running a
    /// discovery round first if the leader is currently unknown.
    async fn handle_submit(&mut self, submission: Submission) {
        if self.leader_conn().is_none() {
            self.leader = None;
            self.handshake_round().await;
            self.leader = self.pick_leader();
        }

        match self.leader_conn() {
            None => {
                let _ = submission.slot.send(Err(RequestError::NoLeader));
            }
            Some(conn) => {
                self.next_request_id += 1;
                if !self
                    .pool
                    .send(conn, Command::client_request(submission.workload))
                {
                    let _ = submission
                        .slot
                        .send(Err(RequestError::ConnectionLost));
                    return;
                }
                self.pending.push_back(PendingRequest {
                    request_id: self.next_request_id,
                    deadline: Instant::now() + submission.timeout,
                    slot: Some(submission.slot),
                });
            }
        }
    }

    /// Digests one connection event outside a handshake round.
    fn absorb_event(&mut self, event: ConnEvent) {
        match event {
            ConnEvent::Frame(conn, cmd) => {
                let endpoint = self.pool.peer_of(conn);
                match cmd.kind {
                    CommandType::HandshakeResponse => {
                        if let Some(info) =
                            endpoint.and_then(|ep| self.servers.get_mut(&ep))
                        {
                            info.host_id = cmd.host_id;
                            info.state =
                                cmd.host_state.unwrap_or(PeerState::Unknown);
                        }
                    }
                    CommandType::RequestAccepted
                        if endpoint.is_some() && endpoint == self.leader =>
                    {
                        self.complete_front(Ok(cmd
                            .workload
                            .unwrap_or_default()));
                    }
                    CommandType::RequestFail
                        if endpoint.is_some() && endpoint == self.leader =>
                    {
                        let code = cmd
                            .error
                            .unwrap_or(ErrorCode::IncorrectProposal);
                        self.complete_front(Err(RequestError::Server(code)));
                    }
                    _ => {
                        pf_debug!(
                            "ignoring {:?} frame on conn {}",
                            cmd.kind,
                            conn
                        );
                    }
                }
            }

            ConnEvent::Corrupt(conn, err) => {
                pf_warn!("corrupt frame on conn {}: {}", conn, err);
                self.pool.close(conn);
                self.conn_gone(conn);
            }

            ConnEvent::Closed(conn) => {
                self.pool.forget(conn);
                self.conn_gone(conn);
            }
        }
    }

    /// Fulfills the oldest outstanding request: the server answers in
    /// submission order, so the k-th response pairs with the k-th request.
    fn complete_front(&mut self, result: Result<Bytes, RequestError>) {
        match self.pending.pop_front() {
            Some(mut request) => {
                if let Some(slot) = request.slot.take() {
                    let _ = slot.send(result);
                }
                // a taken slot means the request already timed out; the
                // response is consumed to keep the pairing aligned
            }
            None => pf_warn!("response received with no request outstanding"),
        }
    }

    /// Reacts to a lost connection: if it was the leader's, every
    /// outstanding request fails with `connection-lost`.
    fn conn_gone(&mut self, conn: ConnId) {
        let mut lost_leader = false;
        for (endpoint, info) in self.servers.iter_mut() {
            if info.conn == Some(conn) {
                info.conn = None;
                info.state = PeerState::Dead;
                if self.leader == Some(*endpoint) {
                    lost_leader = true;
                }
            }
        }
        if lost_leader {
            pf_warn!("connection to leader lost");
            self.leader = None;
            for request in self.pending.iter_mut() {
                if let Some(slot) = request.slot.take() {
                    let _ = slot.send(Err(RequestError::ConnectionLost));
                }
            }
            self.pending.clear();
        }
    }

    /// Fails every outstanding request whose deadline has passed. The
    /// records stay queued for response matching.
    fn expire_requests(&mut self) {
        let now = Instant::now();
        for request in self.pending.iter_mut() {
            if request.deadline <= now {
                if let Some(slot) = request.slot.take() {
                    pf_debug!("request {} timed out", request.request_id);
                    let _ = slot.send(Err(RequestError::Timeout));
                }
            }
        }
    }
}

#[cfg(test)]
mod cluster_tests {
    use super::*;
    use crate::client::Client;
    use crate::server::Server;
    use crate::wire;
    use bytes::BytesMut;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    fn ep(port: u16) -> SocketAddr {
        format!("127.0.0.1:{}", port).parse().unwrap()
    }

    /// Tightened timers so clusters converge quickly under test.
    const TEST_CONFIG: &str = "health_check_interval_ms = 100\n\
                               handshake_timeout_ms = 1000";

    /// Starts one server per port, each configured with the full endpoint
    /// list and counting workload executions into `invocations`.
    async fn spawn_cluster(
        ports: &[u16],
        start: &[u16],
        invocations: &Arc<AtomicUsize>,
    ) -> Vec<Server> {
        let mut servers = Vec::new();
        for &port in start {
            let counter = invocations.clone();
            let mut server = Server::new_with_config(
                ep(port),
                move |workload: &[u8]| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    workload.to_vec()
                },
                Some(TEST_CONFIG),
            )
            .unwrap();
            for &p in ports {
                server.add(ep(p)).unwrap();
            }
            server.start().await.unwrap();
            servers.push(server);
        }
        servers
    }

    /// Waits until every server sees `live` live members and all agree on
    /// one leader.
    async fn await_convergence(servers: &[Server], live: usize) {
        for _ in 0..100 {
            let views: Vec<_> =
                servers.iter().map(|s| (s.leader(), s.live_servers())).collect();
            let leader = views[0].0;
            if leader.is_some()
                && views.iter().all(|(l, n)| *l == leader && *n == live)
            {
                // one extra settle tick so freshly-promoted state is served
                time::sleep(Duration::from_millis(200)).await;
                return;
            }
            time::sleep(Duration::from_millis(100)).await;
        }
        panic!("cluster did not converge");
    }

    async fn connected_client(ports: &[u16]) -> Client {
        let mut client = Client::new();
        for &port in ports {
            client.add(ep(port)).unwrap();
        }
        client.start().await.unwrap();
        client
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn pipelined_requests_three_servers() {
        let ports = [1337u16, 1338, 1339];
        let invocations = Arc::new(AtomicUsize::new(0));
        let servers = spawn_cluster(&ports, &ports, &invocations).await;
        await_convergence(&servers, 3).await;

        let client = connected_client(&ports).await;
        let mut futures = Vec::new();
        for i in 0..1000usize {
            let fut = client
                .send(i.to_string().into_bytes(), Duration::from_secs(10))
                .unwrap();
            futures.push((i, fut));
        }
        for (i, fut) in futures {
            let response = fut.await.unwrap();
            assert_eq!(response, Bytes::from(i.to_string().into_bytes()));
        }

        // every server (leader included) executed every workload once
        assert_eq!(invocations.load(Ordering::SeqCst), 3000);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn leader_self_executes() {
        let ports = [21440u16, 21441, 21442];
        let invocations = Arc::new(AtomicUsize::new(0));
        let servers = spawn_cluster(&ports, &ports, &invocations).await;
        await_convergence(&servers, 3).await;

        let client = connected_client(&ports).await;
        let response = client
            .send(&b"hello"[..], Duration::from_secs(10))
            .unwrap()
            .await
            .unwrap();
        assert_eq!(response, Bytes::from_static(b"hello"));
        assert_eq!(invocations.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn dead_peer_at_startup() {
        let ports = [21450u16, 21451, 21452];
        let invocations = Arc::new(AtomicUsize::new(0));
        // the third configured server never starts
        let servers =
            spawn_cluster(&ports, &ports[..2], &invocations).await;
        await_convergence(&servers, 2).await;

        let client = connected_client(&ports).await;
        let response = client
            .send(&b"still-works"[..], Duration::from_secs(10))
            .unwrap()
            .await
            .unwrap();
        assert_eq!(response, Bytes::from_static(b"still-works"));
        assert_eq!(invocations.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn single_node_cluster() {
        let ports = [21460u16];
        let invocations = Arc::new(AtomicUsize::new(0));
        let servers = spawn_cluster(&ports, &ports, &invocations).await;
        await_convergence(&servers, 1).await;
        assert!(servers[0].is_leader());

        let client = connected_client(&ports).await;
        for i in 0..10usize {
            let response = client
                .send(format!("req-{}", i).into_bytes(), Duration::from_secs(5))
                .unwrap()
                .await
                .unwrap();
            assert_eq!(
                response,
                Bytes::from(format!("req-{}", i).into_bytes())
            );
        }
        assert_eq!(invocations.load(Ordering::SeqCst), 10);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn oversize_workload_fails_typed() {
        let ports = [21470u16];
        let invocations = Arc::new(AtomicUsize::new(0));

        // server caps frames at 1 KiB; the client's own cap stays default
        let counter = invocations.clone();
        let mut server = Server::new_with_config(
            ep(ports[0]),
            move |workload: &[u8]| {
                counter.fetch_add(1, Ordering::SeqCst);
                workload.to_vec()
            },
            Some(
                "health_check_interval_ms = 100\n\
                 handshake_timeout_ms = 1000\n\
                 max_frame_size = 1024",
            ),
        )
        .unwrap();
        server.add(ep(ports[0])).unwrap();
        server.start().await.unwrap();
        let servers = vec![server];
        await_convergence(&servers, 1).await;

        let client = connected_client(&ports).await;
        let oversized = client
            .send(vec![7u8; 2048], Duration::from_secs(5))
            .unwrap();
        let trailing = client
            .send(&b"after"[..], Duration::from_secs(5))
            .unwrap();

        assert_eq!(
            oversized.await,
            Err(RequestError::Server(ErrorCode::FrameOversize))
        );
        // the server closed the connection after replying; everything else
        // outstanding fails connection-lost
        assert_eq!(trailing.await, Err(RequestError::ConnectionLost));
        assert_eq!(invocations.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn request_timeout_fires() {
        let addr = ep(21480);

        // a fake server that completes the handshake claiming leadership,
        // then swallows every client request
        tokio::spawn(async move {
            let listener = TcpListener::bind(addr).await.unwrap();
            loop {
                let (mut stream, _) = listener.accept().await.unwrap();
                tokio::spawn(async move {
                    let mut buf = BytesMut::new();
                    loop {
                        match wire::read_frame(
                            &mut buf,
                            &mut stream,
                            wire::DEFAULT_MAX_FRAME,
                        )
                        .await
                        {
                            Ok(cmd)
                                if cmd.kind
                                    == CommandType::HandshakeStart =>
                            {
                                let reply = wire::encode_frame(
                                    &Command::handshake_response(
                                        HostId(1),
                                        addr,
                                        PeerState::AliveLeader,
                                    ),
                                    wire::DEFAULT_MAX_FRAME,
                                )
                                .unwrap();
                                stream.write_all(&reply).await.unwrap();
                            }
                            Ok(_) => {} // never reply
                            Err(_) => break,
                        }
                    }
                });
            }
        });

        let client = connected_client(&[21480]).await;
        let started = Instant::now();
        let result = client
            .send(&b"void"[..], Duration::from_millis(100))
            .unwrap()
            .await;
        let elapsed = started.elapsed();

        assert_eq!(result, Err(RequestError::Timeout));
        assert!(elapsed >= Duration::from_millis(100));
        assert!(elapsed < Duration::from_millis(300));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn two_node_cluster_survives_lone() {
        let ports = [21490u16, 21491];
        let invocations = Arc::new(AtomicUsize::new(0));
        // only the first of the two configured servers runs
        let servers =
            spawn_cluster(&ports, &ports[..1], &invocations).await;
        await_convergence(&servers, 1).await;
        assert!(servers[0].is_leader());

        let client = connected_client(&ports).await;
        let response = client
            .send(&b"lone-survivor"[..], Duration::from_secs(10))
            .unwrap()
            .await
            .unwrap();
        assert_eq!(response, Bytes::from_static(b"lone-survivor"));
        assert_eq!(invocations.load(Ordering::SeqCst), 1);
    }
}
