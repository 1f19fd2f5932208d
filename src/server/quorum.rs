//! Quorum membership table and deterministic leader election.

use std::collections::HashMap;
use std::net::SocketAddr;

use crate::conn::ConnId;
use crate::utils::EnsembleError;
use crate::wire::{HostId, PeerState};

/// One known server of the cluster, self included.
#[derive(Debug, Clone)]
pub(crate) struct Peer {
    /// 128-bit identity, learned through the handshake (always known for
    /// self).
    pub(crate) host_id: Option<HostId>,

    /// The peer's listening endpoint; key of the quorum table.
    pub(crate) endpoint: SocketAddr,

    /// Liveness state from our local point of view.
    pub(crate) state: PeerState,

    /// Installed connection to this peer, if any. The pool owns the
    /// connection; this is only its id, cleared on disconnect.
    pub(crate) conn: Option<ConnId>,
}

/// Membership table of all configured servers, keyed by endpoint.
///
/// Membership is static: all `add()` calls happen before `mark_started()`.
/// The table is only ever touched from the server's event-loop task.
pub(crate) struct Quorum {
    peers: HashMap<SocketAddr, Peer>,
    me: SocketAddr,
    my_id: HostId,
    /// Our own role belief; mirrored into the table when self is a
    /// configured participant.
    my_role: PeerState,
    started: bool,
}

impl Quorum {
    /// Creates an empty quorum for the server at `me` with identity `my_id`.
    /// Self becomes part of the table only through an explicit `add(me)`.
    pub(crate) fn new(me: SocketAddr, my_id: HostId) -> Self {
        Quorum {
            peers: HashMap::new(),
            me,
            my_id,
            my_role: PeerState::Unknown,
            started: false,
        }
    }

    /// Registers a server endpoint. Rejects duplicates and any call after
    /// the quorum has started.
    pub(crate) fn add(&mut self, endpoint: SocketAddr) -> Result<(), EnsembleError> {
        if self.started {
            return logged_err!("add('{}') after start", endpoint);
        }
        if self.peers.contains_key(&endpoint) {
            return logged_err!("duplicate server endpoint '{}'", endpoint);
        }
        let host_id = if endpoint == self.me {
            Some(self.my_id)
        } else {
            None
        };
        self.peers.insert(
            endpoint,
            Peer {
                host_id,
                endpoint,
                state: PeerState::Unknown,
                conn: None,
            },
        );
        Ok(())
    }

    /// Freezes membership; self is considered live from now on.
    pub(crate) fn mark_started(&mut self) {
        self.started = true;
        self.my_role = PeerState::AliveFollower;
        if let Some(me) = self.peers.get_mut(&self.me) {
            me.state = PeerState::AliveFollower;
        }
    }

    pub(crate) fn me(&self) -> SocketAddr {
        self.me
    }

    pub(crate) fn my_id(&self) -> HostId {
        self.my_id
    }

    /// Our own liveness state (leader or follower).
    pub(crate) fn my_state(&self) -> PeerState {
        self.my_role
    }

    /// Do we currently believe we are the leader?
    pub(crate) fn we_are_the_leader(&self) -> bool {
        self.my_state() == PeerState::AliveLeader
    }

    pub(crate) fn lookup(&self, endpoint: SocketAddr) -> Option<&Peer> {
        self.peers.get(&endpoint)
    }

    /// All configured servers, self included.
    pub(crate) fn servers(&self) -> impl Iterator<Item = &Peer> {
        self.peers.values()
    }

    /// All configured servers except self.
    pub(crate) fn others(&self) -> impl Iterator<Item = &Peer> {
        let me = self.me;
        self.peers.values().filter(move |p| p.endpoint != me)
    }

    /// Updates a peer's liveness state. Setting a peer `AliveLeader` demotes
    /// any previously believed leader, keeping at most one leader per view.
    pub(crate) fn adjust_state(&mut self, endpoint: SocketAddr, state: PeerState) {
        if state == PeerState::AliveLeader {
            for peer in self.peers.values_mut() {
                if peer.state == PeerState::AliveLeader {
                    peer.state = PeerState::AliveFollower;
                }
            }
        }
        if let Some(peer) = self.peers.get_mut(&endpoint) {
            peer.state = state;
        }
    }

    /// Records a peer's identity learned through the handshake.
    pub(crate) fn set_host_id(&mut self, endpoint: SocketAddr, host_id: HostId) {
        if let Some(peer) = self.peers.get_mut(&endpoint) {
            peer.host_id = Some(host_id);
        }
    }

    /// Attaches or clears a peer's installed connection.
    pub(crate) fn set_conn(&mut self, endpoint: SocketAddr, conn: Option<ConnId>) {
        if let Some(peer) = self.peers.get_mut(&endpoint) {
            peer.conn = conn;
        }
    }

    /// Finds the peer a given connection is installed for.
    pub(crate) fn peer_by_conn(&self, conn: ConnId) -> Option<SocketAddr> {
        self.peers
            .values()
            .find(|p| p.conn == Some(conn))
            .map(|p| p.endpoint)
    }

    /// Deterministic local leader election: among the live servers (self
    /// always counts), the numerically lowest host id wins. Updates self's
    /// and the peers' states accordingly and returns the elected endpoint.
    ///
    /// The rule is symmetric across servers, so under a stable view all
    /// members converge on the same leader without an election exchange.
    pub(crate) fn elect(&mut self) -> SocketAddr {
        let mut leader = (self.my_id, self.me);
        for peer in self.others() {
            if let (true, Some(id)) = (peer.state.is_alive(), peer.host_id) {
                if id < leader.0 {
                    leader = (id, peer.endpoint);
                }
            }
        }

        let (_, leader_ep) = leader;
        for peer in self.peers.values_mut() {
            if peer.endpoint == leader_ep {
                peer.state = PeerState::AliveLeader;
            } else if peer.state == PeerState::AliveLeader {
                peer.state = PeerState::AliveFollower;
            }
        }
        self.my_role = if leader_ep == self.me {
            PeerState::AliveLeader
        } else {
            PeerState::AliveFollower
        };
        leader_ep
    }
}
