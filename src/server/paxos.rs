//! Consensus engine: one instance of single-decree Paxos per client request.
//!
//! The engine is a synchronous state machine. Handlers mutate proposal
//! records and push outgoing commands into an outbox which the event loop
//! drains to the connection pool; this keeps every phase transition
//! inspectable and unit-testable without any I/O.
//!
//! Leader side: a `Proposal` record per in-flight client request tracks the
//! phase-1 promise map and the phase-2 executed-workload aggregation.
//! Responses carry no round number on the wire, so they are matched to
//! proposals through per-peer FIFO expectation queues (frames on one
//! connection are delivered in order in both directions).
//!
//! Follower side: a single monotonic `highest_seen` proposal id; prepare
//! uses strict `>` comparison, accept executes the workload directly.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;

use bytes::Bytes;
use tokio::time::{Duration, Instant};

use crate::conn::ConnId;
use crate::server::quorum::Quorum;
use crate::server::statemach::StateMachine;
use crate::wire::{Command, ErrorCode, ProposalId};

/// Per-peer phase-1 answer bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResponseState {
    None,
    Ack,
    Reject,
}

/// Leader-local bookkeeping for one in-flight consensus round.
#[derive(Debug)]
struct Proposal {
    /// Round number, unique and monotonic for this leader instance.
    id: ProposalId,

    /// The value under agreement: the client's opaque workload.
    workload: Bytes,

    /// Connection to answer the originating client on.
    client_conn: ConnId,

    /// Phase-1 answers per polled peer; after entering phase 2 only `Ack`
    /// entries (plus self) remain and double as the awaited-response set.
    accepted: HashMap<SocketAddr, ResponseState>,

    /// Executed workloads received per peer (self included).
    responses: HashMap<SocketAddr, Bytes>,

    /// Most recently received executed workload.
    last_response: Bytes,

    /// Connection each polled peer was reached through when the round
    /// started.
    peer_conns: HashMap<SocketAddr, ConnId>,

    /// True once phase 2 (accept fan-out) has begun.
    accepting: bool,

    /// Round abandonment deadline.
    deadline: Instant,
}

/// The consensus engine of one server, driving both roles.
pub(crate) struct PaxosEngine {
    /// Our own endpoint, used as the key for self-executed responses.
    me: SocketAddr,

    /// Leader-local proposal counter; never decremented, never reused.
    next_proposal_id: ProposalId,

    /// Follower-local highest proposal id promised so far.
    highest_seen: ProposalId,

    /// In-flight proposals by round number.
    proposals: HashMap<ProposalId, Proposal>,

    /// Per-peer FIFO of rounds awaiting a promise/fail answer.
    pending_prepare: HashMap<SocketAddr, VecDeque<ProposalId>>,

    /// Per-peer FIFO of rounds awaiting an accepted answer.
    pending_accept: HashMap<SocketAddr, VecDeque<ProposalId>>,

    /// Per-client FIFO of rounds, so replies leave in submission order.
    client_fifo: HashMap<ConnId, VecDeque<ProposalId>>,

    /// Finished rounds whose replies wait for earlier rounds of the same
    /// client to finish.
    finished: HashMap<ProposalId, Command>,

    /// Unanimous-among-live acceptance policy (default); false switches to
    /// majority-of-live, counting the leader's own ack.
    require_unanimous: bool,

    /// Per-round deadline length.
    request_timeout: Duration,

    /// Outgoing commands staged for the event loop to transmit.
    outbox: Vec<(ConnId, Command)>,
}

impl PaxosEngine {
    pub(crate) fn new(
        me: SocketAddr,
        require_unanimous: bool,
        request_timeout: Duration,
    ) -> Self {
        PaxosEngine {
            me,
            next_proposal_id: 0,
            highest_seen: 0,
            proposals: HashMap::new(),
            pending_prepare: HashMap::new(),
            pending_accept: HashMap::new(),
            client_fifo: HashMap::new(),
            finished: HashMap::new(),
            require_unanimous,
            request_timeout,
            outbox: Vec::new(),
        }
    }

    /// Hands the staged outgoing commands to the caller.
    pub(crate) fn take_outbox(&mut self) -> Vec<(ConnId, Command)> {
        std::mem::take(&mut self.outbox)
    }

    // ==================== leader role (initiator) ====================

    /// Starts a new consensus round for a client request.
    pub(crate) fn start(
        &mut self,
        quorum: &Quorum,
        statemach: &StateMachine,
        client_conn: ConnId,
        workload: Bytes,
    ) {
        if !quorum.we_are_the_leader() {
            // routing error, not a crash: the client talked to a follower
            self.outbox.push((
                client_conn,
                Command::request_fail(Some(ErrorCode::NotLeader)),
            ));
            return;
        }

        // a new round always gets a fresh, larger proposal id
        self.next_proposal_id += 1;
        let id = self.next_proposal_id;

        let polled: Vec<(SocketAddr, ConnId)> = quorum
            .others()
            .filter(|p| p.state.is_alive())
            .filter_map(|p| p.conn.map(|c| (p.endpoint, c)))
            .collect();

        let mut proposal = Proposal {
            id,
            workload,
            client_conn,
            accepted: HashMap::new(),
            responses: HashMap::new(),
            last_response: Bytes::new(),
            peer_conns: HashMap::new(),
            accepting: false,
            deadline: Instant::now() + self.request_timeout,
        };
        self.client_fifo
            .entry(client_conn)
            .or_default()
            .push_back(id);

        if polled.is_empty() {
            // single live node: no peers to poll, self-execute and answer
            pf_debug!("round {} has no live peers, self-deciding", id);
            let result = statemach.execute(&proposal.workload);
            proposal.accepted.insert(self.me, ResponseState::Ack);
            proposal.responses.insert(self.me, result.clone());
            proposal.last_response = result;
            self.proposals.insert(id, proposal);
            self.try_complete(id);
            return;
        }

        for (endpoint, conn) in polled {
            proposal.accepted.insert(endpoint, ResponseState::None);
            proposal.peer_conns.insert(endpoint, conn);
            self.outbox.push((conn, Command::request_prepare(id)));
            self.pending_prepare
                .entry(endpoint)
                .or_default()
                .push_back(id);
        }
        pf_trace!(
            "round {} prepare sent to {} peers",
            id,
            proposal.accepted.len()
        );
        self.proposals.insert(id, proposal);
    }

    /// Handles a phase-1 answer (`request-promise` or `request-fail`) from
    /// the peer at `endpoint`.
    pub(crate) fn receive_promise(
        &mut self,
        statemach: &StateMachine,
        endpoint: SocketAddr,
        promised: bool,
    ) {
        let id = match self
            .pending_prepare
            .get_mut(&endpoint)
            .and_then(|q| q.pop_front())
        {
            Some(id) => id,
            None => {
                pf_warn!("unexpected phase-1 answer <- {}", endpoint);
                return;
            }
        };
        if !self.proposals.contains_key(&id) {
            return; // round already failed or aborted
        }

        {
            let proposal = self.proposals.get_mut(&id).unwrap();
            debug_assert_eq!(
                proposal.accepted.get(&endpoint),
                Some(&ResponseState::None)
            );
            proposal.accepted.insert(
                endpoint,
                if promised {
                    ResponseState::Ack
                } else {
                    ResponseState::Reject
                },
            );
        }

        if !promised && self.require_unanimous {
            // one rejection sinks the round under the unanimous policy
            pf_debug!("round {} rejected by {}", id, endpoint);
            self.finish(id, Command::request_fail(Some(ErrorCode::IncorrectProposal)));
            return;
        }

        let proposal = &self.proposals[&id];
        if proposal
            .accepted
            .values()
            .any(|s| *s == ResponseState::None)
        {
            return; // phase 1 still in flight
        }

        if !self.require_unanimous {
            // majority-of-live, counting our own (implicit) ack
            let acks = proposal
                .accepted
                .values()
                .filter(|s| **s == ResponseState::Ack)
                .count();
            let live = proposal.accepted.len() + 1;
            if acks + 1 < live / 2 + 1 {
                pf_debug!("round {} below majority ({}/{})", id, acks + 1, live);
                self.finish(
                    id,
                    Command::request_fail(Some(ErrorCode::IncorrectProposal)),
                );
                return;
            }
        }

        // all polled peers answered; under the unanimous policy any reject
        // would have finished the round already, so everyone promised
        pf_debug!("round {} promised by all polled peers", id);
        self.enter_accept_phase(statemach, id);
    }

    /// Phase 2: sends `request-accept` to every promised peer and
    /// self-executes the workload (the leader is not in its own polled set).
    fn enter_accept_phase(&mut self, statemach: &StateMachine, id: ProposalId) {
        let (workload, targets) = {
            let proposal = self.proposals.get_mut(&id).unwrap();
            proposal.accepting = true;
            proposal
                .accepted
                .retain(|_, state| *state == ResponseState::Ack);
            let targets: Vec<(SocketAddr, ConnId)> = proposal
                .accepted
                .keys()
                .filter_map(|ep| proposal.peer_conns.get(ep).map(|c| (*ep, *c)))
                .collect();
            (proposal.workload.clone(), targets)
        };

        for (endpoint, conn) in targets {
            self.outbox
                .push((conn, Command::request_accept(workload.clone())));
            self.pending_accept
                .entry(endpoint)
                .or_default()
                .push_back(id);
        }

        // synthetic accepted for self: the leader is not in its own polled
        // set, so it executes the workload manually
        let result = statemach.execute(&workload);
        let proposal = self.proposals.get_mut(&id).unwrap();
        proposal.accepted.insert(self.me, ResponseState::Ack);
        proposal.responses.insert(self.me, result.clone());
        proposal.last_response = result;

        self.try_complete(id);
    }

    /// Handles a `request-accepted` answer carrying the executed workload
    /// from the peer at `endpoint`.
    pub(crate) fn receive_accepted(
        &mut self,
        endpoint: SocketAddr,
        result: Bytes,
    ) {
        let id = match self
            .pending_accept
            .get_mut(&endpoint)
            .and_then(|q| q.pop_front())
        {
            Some(id) => id,
            None => {
                pf_warn!("unexpected accepted answer <- {}", endpoint);
                return;
            }
        };
        if let Some(proposal) = self.proposals.get_mut(&id) {
            debug_assert!(!proposal.responses.contains_key(&endpoint));
            proposal.responses.insert(endpoint, result.clone());
            proposal.last_response = result;
            self.try_complete(id);
        }
    }

    /// Completes a round once every awaited peer has returned an executed
    /// workload, checking the responses for divergence first.
    fn try_complete(&mut self, id: ProposalId) {
        let proposal = match self.proposals.get(&id) {
            Some(p) => p,
            None => return,
        };
        if proposal.responses.len() < proposal.accepted.len() {
            return;
        }

        let mut responses = proposal.responses.values();
        let first = responses.next().cloned().unwrap_or_default();
        let reply = if responses.any(|r| *r != first) {
            pf_warn!("round {} responses diverged across replicas", id);
            Command::request_fail(Some(ErrorCode::InconsistentResponse))
        } else {
            Command::request_accepted(proposal.last_response.clone())
        };
        pf_trace!(
            "round {} complete with {} responses",
            id,
            proposal.responses.len()
        );
        self.finish(id, reply);
    }

    /// Records a round's reply and flushes the client's reply queue in
    /// submission order.
    fn finish(&mut self, id: ProposalId, reply: Command) {
        let proposal = match self.proposals.remove(&id) {
            Some(p) => p,
            None => return,
        };
        let client_conn = proposal.client_conn;
        self.finished.insert(id, reply);

        let fifo = match self.client_fifo.get_mut(&client_conn) {
            Some(f) => f,
            None => {
                // client is gone; drop the reply
                self.finished.remove(&id);
                return;
            }
        };
        while let Some(front) = fifo.front().copied() {
            match self.finished.remove(&front) {
                Some(cmd) => {
                    fifo.pop_front();
                    self.outbox.push((client_conn, cmd));
                }
                None => break, // an earlier round is still in flight
            }
        }
        if fifo.is_empty() {
            self.client_fifo.remove(&client_conn);
        }
    }

    /// Aborts every round still waiting on a peer that died. Returns the
    /// number of aborted rounds.
    pub(crate) fn abort_for_peer(&mut self, endpoint: SocketAddr) -> usize {
        self.pending_prepare.remove(&endpoint);
        self.pending_accept.remove(&endpoint);

        let stuck: Vec<ProposalId> = self
            .proposals
            .values()
            .filter(|p| {
                p.accepted.contains_key(&endpoint)
                    && !p.responses.contains_key(&endpoint)
            })
            .map(|p| p.id)
            .collect();
        for id in &stuck {
            pf_debug!("aborting round {} for dead peer {}", id, endpoint);
            self.finish(
                *id,
                Command::request_fail(Some(ErrorCode::IncorrectProposal)),
            );
        }
        stuck.len()
    }

    /// Forgets the reply queue of a client connection that is gone.
    /// In-flight rounds still run to completion; their replies are dropped
    /// in `finish()`.
    pub(crate) fn drop_client(&mut self, client_conn: ConnId) {
        if let Some(fifo) = self.client_fifo.remove(&client_conn) {
            for id in fifo {
                self.finished.remove(&id);
            }
        }
    }

    /// Fails every round whose deadline has passed. Returns the endpoints
    /// of peers that were still being awaited, for the caller to demote.
    pub(crate) fn expire_rounds(&mut self, now: Instant) -> Vec<SocketAddr> {
        let expired: Vec<ProposalId> = self
            .proposals
            .values()
            .filter(|p| p.deadline <= now)
            .map(|p| p.id)
            .collect();

        let mut suspects: Vec<SocketAddr> = Vec::new();
        for id in expired {
            let proposal = &self.proposals[&id];
            for (endpoint, state) in &proposal.accepted {
                let waiting = if proposal.accepting {
                    !proposal.responses.contains_key(endpoint)
                } else {
                    *state == ResponseState::None
                };
                if *endpoint != self.me
                    && waiting
                    && !suspects.contains(endpoint)
                {
                    suspects.push(*endpoint);
                }
            }
            pf_warn!("round {} timed out, aborting", id);
            self.finish(
                id,
                Command::request_fail(Some(ErrorCode::IncorrectProposal)),
            );
        }
        suspects
    }

    /// Any rounds currently in flight?
    pub(crate) fn idle(&self) -> bool {
        self.proposals.is_empty()
    }

    // ==================== follower role (acceptor) ====================

    /// Handles `request-prepare`: promise iff the incoming id is strictly
    /// greater than everything promised before.
    pub(crate) fn receive_prepare(
        &mut self,
        conn: ConnId,
        proposal_id: ProposalId,
    ) {
        if proposal_id > self.highest_seen {
            self.highest_seen = proposal_id;
            self.outbox.push((conn, Command::request_promise()));
        } else {
            pf_debug!(
                "rejecting stale prepare {} (highest seen {})",
                proposal_id,
                self.highest_seen
            );
            self.outbox.push((conn, Command::request_fail(None)));
        }
    }

    /// Handles `request-accept`: executes the workload and replies with the
    /// result. The proposal id is deliberately not re-checked here; the
    /// guarantee comes from the preceding promise round alone.
    pub(crate) fn receive_accept(
        &mut self,
        statemach: &StateMachine,
        conn: ConnId,
        workload: Bytes,
    ) {
        let result = statemach.execute(&workload);
        self.outbox.push((conn, Command::request_accepted(result)));
    }
}

#[cfg(test)]
mod paxos_tests {
    use super::*;
    use crate::wire::{CommandType, HostId, PeerState};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn ep(port: u16) -> SocketAddr {
        format!("127.0.0.1:{}", port).parse().unwrap()
    }

    fn echo_machine() -> StateMachine {
        StateMachine::new(Arc::new(|w: &[u8]| w.to_vec()))
    }

    /// Quorum of self plus two live peers on fake connections 11 and 12,
    /// with self already elected leader.
    fn three_node_leader_quorum() -> Quorum {
        let mut quorum = Quorum::new(ep(1337), HostId(1));
        quorum.add(ep(1337)).unwrap();
        quorum.add(ep(1338)).unwrap();
        quorum.add(ep(1339)).unwrap();
        quorum.mark_started();
        quorum.set_host_id(ep(1338), HostId(2));
        quorum.adjust_state(ep(1338), PeerState::AliveFollower);
        quorum.set_conn(ep(1338), Some(11));
        quorum.set_host_id(ep(1339), HostId(3));
        quorum.adjust_state(ep(1339), PeerState::AliveFollower);
        quorum.set_conn(ep(1339), Some(12));
        quorum.elect();
        assert!(quorum.we_are_the_leader());
        quorum
    }

    fn engine() -> PaxosEngine {
        PaxosEngine::new(ep(1337), true, Duration::from_secs(5))
    }

    #[test]
    fn follower_rejects_stale_prepare() {
        let mut engine = engine();
        engine.receive_prepare(7, 5);
        engine.receive_prepare(7, 3);
        engine.receive_prepare(7, 5); // equal id must also be rejected
        let out = engine.take_outbox();
        assert_eq!(out.len(), 3);
        assert_eq!(out[0].1.kind, CommandType::RequestPromise);
        assert_eq!(out[1].1.kind, CommandType::RequestFail);
        assert_eq!(out[2].1.kind, CommandType::RequestFail);
    }

    #[test]
    fn follower_accept_executes_workload() {
        let invocations = Arc::new(AtomicUsize::new(0));
        let counter = invocations.clone();
        let sm = StateMachine::new(Arc::new(move |w: &[u8]| {
            counter.fetch_add(1, Ordering::SeqCst);
            w.to_vec()
        }));
        let mut engine = engine();
        engine.receive_accept(&sm, 7, Bytes::from_static(b"task"));
        let out = engine.take_outbox();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].1.kind, CommandType::RequestAccepted);
        assert_eq!(out[0].1.workload.as_ref().unwrap(), "task");
        assert_eq!(invocations.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn happy_path_three_nodes() {
        let quorum = three_node_leader_quorum();
        let sm = echo_machine();
        let mut engine = engine();

        engine.start(&quorum, &sm, 99, Bytes::from_static(b"hello"));
        let out = engine.take_outbox();
        // prepare to both peers, nothing to the client yet
        assert_eq!(out.len(), 2);
        assert!(out
            .iter()
            .all(|(_, cmd)| cmd.kind == CommandType::RequestPrepare
                && cmd.proposal_id == Some(1)));

        engine.receive_promise(&sm, ep(1338), true);
        assert!(engine.take_outbox().is_empty());
        engine.receive_promise(&sm, ep(1339), true);
        let out = engine.take_outbox();
        // accept to both peers; leader self-executed but client still waits
        assert_eq!(out.len(), 2);
        assert!(out
            .iter()
            .all(|(_, cmd)| cmd.kind == CommandType::RequestAccept));

        engine.receive_accepted(ep(1338), Bytes::from_static(b"hello"));
        assert!(engine.take_outbox().is_empty());
        engine.receive_accepted(ep(1339), Bytes::from_static(b"hello"));
        let out = engine.take_outbox();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].0, 99);
        assert_eq!(out[0].1.kind, CommandType::RequestAccepted);
        assert_eq!(out[0].1.workload.as_ref().unwrap(), "hello");
        assert!(engine.idle());
    }

    #[test]
    fn rejection_fails_round_with_incorrect_proposal() {
        let quorum = three_node_leader_quorum();
        let sm = echo_machine();
        let mut engine = engine();

        engine.start(&quorum, &sm, 99, Bytes::from_static(b"hello"));
        engine.take_outbox();

        engine.receive_promise(&sm, ep(1338), false);
        let out = engine.take_outbox();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].0, 99);
        assert_eq!(out[0].1.kind, CommandType::RequestFail);
        assert_eq!(out[0].1.error, Some(ErrorCode::IncorrectProposal));

        // the straggler's promise is ignored gracefully
        engine.receive_promise(&sm, ep(1339), true);
        assert!(engine.take_outbox().is_empty());
        assert!(engine.idle());
    }

    #[test]
    fn not_leader_guard() {
        let mut quorum = Quorum::new(ep(1337), HostId(9));
        quorum.add(ep(1337)).unwrap();
        quorum.add(ep(1338)).unwrap();
        quorum.mark_started();
        // never elected: still a follower
        let sm = echo_machine();
        let mut engine = engine();
        engine.start(&quorum, &sm, 42, Bytes::from_static(b"nope"));
        let out = engine.take_outbox();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].0, 42);
        assert_eq!(out[0].1.error, Some(ErrorCode::NotLeader));
    }

    #[test]
    fn single_node_self_decides() {
        let mut quorum = Quorum::new(ep(1337), HostId(9));
        quorum.add(ep(1337)).unwrap();
        quorum.mark_started();
        quorum.elect();

        let invocations = Arc::new(AtomicUsize::new(0));
        let counter = invocations.clone();
        let sm = StateMachine::new(Arc::new(move |w: &[u8]| {
            counter.fetch_add(1, Ordering::SeqCst);
            w.to_vec()
        }));
        let mut engine = engine();
        engine.start(&quorum, &sm, 42, Bytes::from_static(b"solo"));
        let out = engine.take_outbox();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].0, 42);
        assert_eq!(out[0].1.kind, CommandType::RequestAccepted);
        assert_eq!(out[0].1.workload.as_ref().unwrap(), "solo");
        assert_eq!(invocations.load(Ordering::SeqCst), 1);
        assert!(engine.idle());
    }

    #[test]
    fn proposal_ids_strictly_increase() {
        let quorum = three_node_leader_quorum();
        let sm = echo_machine();
        let mut engine = engine();

        for expect in 1..=5u64 {
            engine.start(&quorum, &sm, 99, Bytes::from_static(b"w"));
            let out = engine.take_outbox();
            assert!(out
                .iter()
                .all(|(_, cmd)| cmd.proposal_id == Some(expect)));
        }
    }

    #[test]
    fn responses_in_submission_order() {
        // rounds can finish out of order when their polled sets differ:
        // round 1 waits on a slow peer that round 2 (started after that
        // peer was demoted) never polled
        let mut quorum = three_node_leader_quorum();
        let sm = echo_machine();
        let mut engine = engine();

        engine.start(&quorum, &sm, 99, Bytes::from_static(b"first"));
        quorum.adjust_state(ep(1339), PeerState::Dead);
        engine.start(&quorum, &sm, 99, Bytes::from_static(b"second"));
        engine.take_outbox();

        engine.receive_promise(&sm, ep(1338), true); // round 1
        engine.receive_promise(&sm, ep(1338), true); // round 2 -> accepting
        engine.take_outbox();

        // round 2 completes first; its reply must be held back
        engine.receive_accepted(ep(1338), Bytes::from_static(b"second"));
        assert!(engine.take_outbox().is_empty());

        // round 1 finally gets its straggler promise and both accepteds
        engine.receive_promise(&sm, ep(1339), true);
        engine.take_outbox();
        engine.receive_accepted(ep(1338), Bytes::from_static(b"first"));
        engine.receive_accepted(ep(1339), Bytes::from_static(b"first"));
        let out = engine.take_outbox();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].1.workload.as_ref().unwrap(), "first");
        assert_eq!(out[1].1.workload.as_ref().unwrap(), "second");
    }

    #[test]
    fn divergent_responses_fail_inconsistent() {
        let quorum = three_node_leader_quorum();
        let sm = echo_machine();
        let mut engine = engine();

        engine.start(&quorum, &sm, 99, Bytes::from_static(b"hello"));
        engine.take_outbox();
        engine.receive_promise(&sm, ep(1338), true);
        engine.receive_promise(&sm, ep(1339), true);
        engine.take_outbox();

        engine.receive_accepted(ep(1338), Bytes::from_static(b"hello"));
        engine.receive_accepted(ep(1339), Bytes::from_static(b"HELLO"));
        let out = engine.take_outbox();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].1.kind, CommandType::RequestFail);
        assert_eq!(out[0].1.error, Some(ErrorCode::InconsistentResponse));
    }

    #[test]
    fn majority_policy_tolerates_one_reject() {
        let quorum = three_node_leader_quorum();
        let sm = echo_machine();
        let mut engine =
            PaxosEngine::new(ep(1337), false, Duration::from_secs(5));

        engine.start(&quorum, &sm, 99, Bytes::from_static(b"maj"));
        engine.take_outbox();

        // 1338 rejects, but self + 1339 still form a majority of three
        engine.receive_promise(&sm, ep(1338), false);
        assert!(engine.take_outbox().is_empty());
        engine.receive_promise(&sm, ep(1339), true);
        let out = engine.take_outbox();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].1.kind, CommandType::RequestAccept);

        engine.receive_accepted(ep(1339), Bytes::from_static(b"maj"));
        let out = engine.take_outbox();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].0, 99);
        assert_eq!(out[0].1.kind, CommandType::RequestAccepted);
    }

    #[test]
    fn peer_death_aborts_waiting_rounds() {
        let quorum = three_node_leader_quorum();
        let sm = echo_machine();
        let mut engine = engine();

        engine.start(&quorum, &sm, 99, Bytes::from_static(b"doomed"));
        engine.take_outbox();
        engine.receive_promise(&sm, ep(1338), true);

        let aborted = engine.abort_for_peer(ep(1339));
        assert_eq!(aborted, 1);
        let out = engine.take_outbox();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].1.kind, CommandType::RequestFail);
        assert_eq!(out[0].1.error, Some(ErrorCode::IncorrectProposal));
        assert!(engine.idle());
    }

    #[test]
    fn expiry_fails_round_and_names_suspects() {
        let quorum = three_node_leader_quorum();
        let sm = echo_machine();
        let mut engine =
            PaxosEngine::new(ep(1337), true, Duration::from_millis(0));

        engine.start(&quorum, &sm, 99, Bytes::from_static(b"slow"));
        engine.take_outbox();
        engine.receive_promise(&sm, ep(1338), true);

        let suspects =
            engine.expire_rounds(Instant::now() + Duration::from_millis(1));
        assert!(suspects.contains(&ep(1339)));
        let out = engine.take_outbox();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].1.error, Some(ErrorCode::IncorrectProposal));
        assert!(engine.idle());
    }
}
