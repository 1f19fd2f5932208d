//! Peer handshake bootstrap and leader election handlers.
//!
//! For every configured peer the server initiates a TCP connect, sends
//! `handshake-start`, and expects a `handshake-response` carrying the peer's
//! identity, endpoint, and state within the handshake timeout. Successful
//! handshakes install the connection into the quorum; failures mark the peer
//! dead, to be retried on the next health-check tick. Election is purely
//! local: the live server with the numerically lowest host id leads.

use std::net::SocketAddr;

use tokio::net::TcpStream;
use tokio::time::{self, Duration, Instant};

use crate::conn::ConnId;
use crate::server::{PendingHandshake, ServerNode};
use crate::utils::{tcp_connect_with_retry, EnsembleError};
use crate::wire::{Command, PeerState};

impl ServerNode {
    /// Spawns connect attempts toward every peer that is neither connected
    /// nor mid-handshake. Covers both the startup bootstrap and the
    /// per-tick retry of dead peers.
    pub(super) fn retry_unconnected_peers(&mut self) {
        let to_connect: Vec<SocketAddr> = self
            .quorum
            .others()
            .filter(|p| p.conn.is_none())
            .map(|p| p.endpoint)
            .filter(|ep| {
                !self.pending_connects.contains(ep)
                    && !self
                        .pending_handshakes
                        .values()
                        .any(|h| h.endpoint == *ep)
            })
            .collect();
        for endpoint in to_connect {
            self.spawn_connect(endpoint);
        }
    }

    /// Starts one background connect attempt; its result comes back through
    /// the connect channel so the event loop never blocks on dialing.
    fn spawn_connect(&mut self, endpoint: SocketAddr) {
        self.pending_connects.insert(endpoint);
        let tx_connected = self.tx_connected.clone();
        let timeout = Duration::from_millis(self.config.handshake_timeout_ms);
        tokio::spawn(async move {
            let result = match time::timeout(
                timeout,
                tcp_connect_with_retry(endpoint, 0),
            )
            .await
            {
                Ok(Ok(stream)) => Ok(stream),
                Ok(Err(e)) => Err(e),
                Err(_) => Err(EnsembleError::msg("connect timed out")),
            };
            let _ = tx_connected.send((endpoint, result));
        });
    }

    /// Handles the result of a background connect attempt: on success sends
    /// `handshake-start` and arms the response deadline; on failure marks
    /// the peer dead.
    pub(super) fn handle_connect_result(
        &mut self,
        endpoint: SocketAddr,
        result: Result<TcpStream, EnsembleError>,
    ) {
        self.pending_connects.remove(&endpoint);
        match result {
            Ok(stream) => {
                let conn = self.pool.register(stream);
                self.pool.send(conn, Command::handshake_start());
                self.pending_handshakes.insert(
                    conn,
                    PendingHandshake {
                        endpoint,
                        deadline: Instant::now()
                            + Duration::from_millis(
                                self.config.handshake_timeout_ms,
                            ),
                    },
                );
                pf_debug!("handshake started -> {}", endpoint);
            }
            Err(e) => {
                pf_debug!("connect to peer {} failed: {}", endpoint, e);
                self.quorum.adjust_state(endpoint, PeerState::Dead);
            }
        }
    }

    /// Replies to an incoming `handshake-start` with our own identity,
    /// endpoint, and state.
    pub(super) fn handle_handshake_start(&mut self, conn: ConnId) {
        pf_debug!("received handshake request on conn {}", conn);
        self.pool.send(
            conn,
            Command::handshake_response(
                self.quorum.my_id(),
                self.quorum.me(),
                self.quorum.my_state(),
            ),
        );
    }

    /// Handles a `handshake-response`: validates the claimed endpoint
    /// against the one we dialed, records identity and state, and installs
    /// the connection into the quorum if none is present.
    pub(super) fn handle_handshake_response(
        &mut self,
        conn: ConnId,
        cmd: Command,
    ) {
        let pending = match self.pending_handshakes.remove(&conn) {
            Some(pending) => pending,
            None => {
                pf_warn!("unsolicited handshake response on conn {}", conn);
                self.pool.close(conn);
                return;
            }
        };

        // field presence was validated by the codec
        let (host_id, host_endpoint, host_state) =
            match (cmd.host_id, cmd.host_endpoint, cmd.host_state) {
                (Some(id), Some(ep), Some(state)) => (id, ep, state),
                _ => {
                    self.pool.close(conn);
                    return;
                }
            };

        // the endpoint this host thinks it is must be the endpoint we just
        // connected to; a mismatch means a misconfigured peer list
        if host_endpoint != pending.endpoint {
            pf_error!(
                "peer at {} claims endpoint {}, marking dead",
                pending.endpoint,
                host_endpoint
            );
            self.pool.close(conn);
            self.quorum.adjust_state(pending.endpoint, PeerState::Dead);
            return;
        }

        self.quorum.set_host_id(pending.endpoint, host_id);
        // a peer we just exchanged frames with is live even if it still
        // reports Unknown at bootstrap
        let state = if host_state.is_alive() {
            host_state
        } else {
            PeerState::AliveFollower
        };
        self.quorum.adjust_state(pending.endpoint, state);

        if self
            .quorum
            .lookup(pending.endpoint)
            .and_then(|p| p.conn)
            .is_none()
        {
            self.quorum.set_conn(pending.endpoint, Some(conn));
            self.pool.bind_peer(conn, pending.endpoint);
            pf_info!(
                "handshaked with peer {} (id {})",
                pending.endpoint,
                host_id
            );
        } else {
            // an installed connection already exists, discard the extra one
            self.pool.close(conn);
        }
    }

    /// Times out handshakes whose response never arrived.
    pub(super) fn expire_handshakes(&mut self, now: Instant) {
        let expired: Vec<ConnId> = self
            .pending_handshakes
            .iter()
            .filter(|(_, pending)| pending.deadline <= now)
            .map(|(conn, _)| *conn)
            .collect();
        for conn in expired {
            if let Some(pending) = self.pending_handshakes.remove(&conn) {
                pf_warn!("handshake with {} timed out", pending.endpoint);
                self.pool.close(conn);
                self.quorum.adjust_state(pending.endpoint, PeerState::Dead);
            }
        }
    }

    /// Re-runs the deterministic local election over the current view.
    pub(super) fn run_election(&mut self) {
        let was_leader = self.quorum.we_are_the_leader();
        let leader = self.quorum.elect();
        if self.quorum.we_are_the_leader() != was_leader {
            if self.quorum.we_are_the_leader() {
                pf_info!("server {} is now the leader", self.me);
            } else {
                pf_info!("server {} now follows {}", self.me, leader);
            }
        }
    }
}
