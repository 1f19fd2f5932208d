//! Length-prefixed wire codec for cluster commands.
//!
//! Every frame is a 4-byte big-endian payload length followed by exactly that
//! many payload bytes. The payload is a MessagePack-encoded [`Command`]
//! record whose fields (beyond the type tag) are all optional; receivers
//! validate the presence of the fields required by the received type.

use std::fmt;
use std::net::SocketAddr;

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncReadExt;

use crate::utils::EnsembleError;

/// Default cap on a single frame's payload length in bytes.
pub const DEFAULT_MAX_FRAME: usize = 16 * 1024 * 1024;

/// Monotonic per-leader consensus round number. 0 is never a valid round.
pub(crate) type ProposalId = u64;

/// 128-bit server identity, freshly randomized per server process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct HostId(pub u128);

// MessagePack has no native 128-bit integer, so a `HostId` travels as a
// `(high, low)` pair of u64s.
impl Serialize for HostId {
    fn serialize<S: serde::Serializer>(
        &self,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        ((self.0 >> 64) as u64, self.0 as u64).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for HostId {
    fn deserialize<D: serde::Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Self, D::Error> {
        let (high, low) = <(u64, u64)>::deserialize(deserializer)?;
        Ok(HostId(((high as u128) << 64) | (low as u128)))
    }
}

impl fmt::Display for HostId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

/// Peer liveness state from a server's local point of view.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default,
)]
pub(crate) enum PeerState {
    #[default]
    Unknown,
    AliveFollower,
    AliveLeader,
    Dead,
}

impl PeerState {
    /// Is this peer usable for consensus rounds?
    #[inline]
    pub(crate) fn is_alive(self) -> bool {
        matches!(self, PeerState::AliveFollower | PeerState::AliveLeader)
    }
}

/// Wire-visible error codes returned to clients in `request-fail` replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    /// Not all live peers acknowledged this round's proposal id.
    IncorrectProposal,

    /// Peers returned differing executed workloads for the same accept.
    InconsistentResponse,

    /// The request reached a server that is not the leader.
    NotLeader,

    /// The request's frame exceeded the server's frame size cap.
    FrameOversize,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            ErrorCode::IncorrectProposal => "incorrect-proposal",
            ErrorCode::InconsistentResponse => "inconsistent-response",
            ErrorCode::NotLeader => "not-leader",
            ErrorCode::FrameOversize => "frame-oversize",
        };
        write!(f, "{}", name)
    }
}

/// Command frame type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) enum CommandType {
    HandshakeStart,
    HandshakeResponse,
    RequestPrepare,
    RequestPromise,
    RequestFail,
    RequestAccept,
    RequestAccepted,
    ClientRequest,
}

/// Tagged command record carried by every frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct Command {
    /// Command type tag.
    pub(crate) kind: CommandType,

    /// Consensus round number (prepare only).
    pub(crate) proposal_id: Option<ProposalId>,

    /// Opaque workload or executed-workload bytes.
    pub(crate) workload: Option<Bytes>,

    /// Responder identity (handshake-response only).
    pub(crate) host_id: Option<HostId>,

    /// Responder's own endpoint (handshake-response only).
    pub(crate) host_endpoint: Option<SocketAddr>,

    /// Responder's own liveness state (handshake-response only).
    pub(crate) host_state: Option<PeerState>,

    /// Failure code (request-fail toward clients only).
    pub(crate) error: Option<ErrorCode>,
}

impl Command {
    fn new(kind: CommandType) -> Self {
        Command {
            kind,
            proposal_id: None,
            workload: None,
            host_id: None,
            host_endpoint: None,
            host_state: None,
            error: None,
        }
    }

    pub(crate) fn handshake_start() -> Self {
        Self::new(CommandType::HandshakeStart)
    }

    pub(crate) fn handshake_response(
        host_id: HostId,
        host_endpoint: SocketAddr,
        host_state: PeerState,
    ) -> Self {
        let mut cmd = Self::new(CommandType::HandshakeResponse);
        cmd.host_id = Some(host_id);
        cmd.host_endpoint = Some(host_endpoint);
        cmd.host_state = Some(host_state);
        cmd
    }

    pub(crate) fn request_prepare(proposal_id: ProposalId) -> Self {
        let mut cmd = Self::new(CommandType::RequestPrepare);
        cmd.proposal_id = Some(proposal_id);
        cmd
    }

    pub(crate) fn request_promise() -> Self {
        Self::new(CommandType::RequestPromise)
    }

    pub(crate) fn request_fail(error: Option<ErrorCode>) -> Self {
        let mut cmd = Self::new(CommandType::RequestFail);
        cmd.error = error;
        cmd
    }

    pub(crate) fn request_accept(workload: Bytes) -> Self {
        let mut cmd = Self::new(CommandType::RequestAccept);
        cmd.workload = Some(workload);
        cmd
    }

    pub(crate) fn request_accepted(workload: Bytes) -> Self {
        let mut cmd = Self::new(CommandType::RequestAccepted);
        cmd.workload = Some(workload);
        cmd
    }

    pub(crate) fn client_request(workload: Bytes) -> Self {
        let mut cmd = Self::new(CommandType::ClientRequest);
        cmd.workload = Some(workload);
        cmd
    }

    /// Checks that the fields required by this command's type are present.
    pub(crate) fn validate(&self) -> Result<(), CodecError> {
        let complete = match self.kind {
            CommandType::HandshakeResponse => {
                self.host_id.is_some()
                    && self.host_endpoint.is_some()
                    && self.host_state.is_some()
            }
            CommandType::RequestPrepare => self.proposal_id.is_some(),
            CommandType::RequestAccept
            | CommandType::RequestAccepted
            | CommandType::ClientRequest => self.workload.is_some(),
            CommandType::HandshakeStart
            | CommandType::RequestPromise
            | CommandType::RequestFail => true,
        };
        if complete {
            Ok(())
        } else {
            Err(CodecError::DecodeMalformed(format!(
                "missing required field for {:?}",
                self.kind
            )))
        }
    }
}

/// Codec-level error cases, distinguishable per the framing contract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Frame length header exceeds the configured cap.
    FrameOversize { len: usize, cap: usize },

    /// EOF arrived in the middle of a frame.
    FrameTruncated,

    /// Payload bytes failed to parse into a valid command.
    DecodeMalformed(String),
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            CodecError::FrameOversize { len, cap } => {
                write!(f, "frame-oversize: length {} > cap {}", len, cap)
            }
            CodecError::FrameTruncated => write!(f, "frame-truncated"),
            CodecError::DecodeMalformed(m) => {
                write!(f, "decode-malformed: {}", m)
            }
        }
    }
}

impl From<CodecError> for EnsembleError {
    fn from(e: CodecError) -> Self {
        EnsembleError(e.to_string())
    }
}

/// Failure cases of a frame read, separating clean connection shutdown from
/// codec-level corruption.
#[derive(Debug)]
pub(crate) enum ReadError {
    /// Clean EOF on a frame boundary.
    Eof,

    /// Framing or payload corruption; the connection should be dropped.
    Codec(CodecError),

    /// Transport-level failure (reset, etc.).
    Io(std::io::Error),
}

/// Encodes a command into a ready-to-write frame. Fails with
/// `frame-oversize` if the encoded payload exceeds `cap` bytes.
pub(crate) fn encode_frame(
    cmd: &Command,
    cap: usize,
) -> Result<Bytes, CodecError> {
    let payload = rmp_serde::to_vec(cmd)
        .map_err(|e| CodecError::DecodeMalformed(e.to_string()))?;
    if payload.len() > cap {
        return Err(CodecError::FrameOversize {
            len: payload.len(),
            cap,
        });
    }
    let mut frame = BytesMut::with_capacity(4 + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame.freeze())
}

/// Receives one command frame from readable connection `conn_read`, using
/// `read_buf` as buffer storage for partial reads.
///
/// CANCELLATION SAFETY: this function is intended to be used as a
/// `tokio::select!` branch, so it cannot use `read_u32()`/`read_exact()`
/// (not cancellation-safe). Bytes already read before a cancellation stay in
/// the read buffer and are continued by future invocations.
pub(crate) async fn read_frame<Conn>(
    read_buf: &mut BytesMut,
    conn_read: &mut Conn,
    cap: usize,
) -> Result<Command, ReadError>
where
    Conn: AsyncReadExt + Unpin,
{
    // read the 4-byte length header first
    while read_buf.len() < 4 {
        let n = conn_read.read_buf(read_buf).await.map_err(ReadError::Io)?;
        if n == 0 {
            return if read_buf.is_empty() {
                Err(ReadError::Eof)
            } else {
                Err(ReadError::Codec(CodecError::FrameTruncated))
            };
        }
    }
    let len = u32::from_be_bytes(read_buf[..4].try_into().unwrap()) as usize;
    if len > cap {
        return Err(ReadError::Codec(CodecError::FrameOversize { len, cap }));
    }

    // then read the payload itself
    let end = 4 + len;
    if read_buf.capacity() < end {
        read_buf.reserve(end - read_buf.capacity());
    }
    while read_buf.len() < end {
        let n = conn_read.read_buf(read_buf).await.map_err(ReadError::Io)?;
        if n == 0 {
            return Err(ReadError::Codec(CodecError::FrameTruncated));
        }
    }

    let cmd: Command = rmp_serde::from_slice(&read_buf[4..end])
        .map_err(|e| ReadError::Codec(CodecError::DecodeMalformed(e.to_string())))?;
    cmd.validate().map_err(ReadError::Codec)?;

    // no more awaits ahead, safe to discard the bytes used by this frame
    if read_buf.len() > end {
        let buf_tail = Bytes::copy_from_slice(&read_buf[end..]);
        read_buf.clear();
        read_buf.extend_from_slice(&buf_tail);
    } else {
        read_buf.clear();
    }

    Ok(cmd)
}

#[cfg(test)]
mod wire_tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    async fn roundtrip(cmd: Command) -> Command {
        let frame = encode_frame(&cmd, DEFAULT_MAX_FRAME).unwrap();
        let (mut tx, mut rx) = tokio::io::duplex(64 * 1024);
        tx.write_all(&frame).await.unwrap();
        let mut buf = BytesMut::new();
        read_frame(&mut buf, &mut rx, DEFAULT_MAX_FRAME)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn roundtrip_all_types() {
        let addr: SocketAddr = "127.0.0.1:7000".parse().unwrap();
        let cmds = vec![
            Command::handshake_start(),
            Command::handshake_response(
                HostId(0xdead_beef_dead_beef_0123),
                addr,
                PeerState::AliveLeader,
            ),
            Command::request_prepare(42),
            Command::request_promise(),
            Command::request_fail(Some(ErrorCode::IncorrectProposal)),
            Command::request_accept(Bytes::from_static(b"workload")),
            Command::request_accepted(Bytes::from_static(b"result")),
            Command::client_request(Bytes::from_static(b"payload")),
        ];
        for cmd in cmds {
            assert_eq!(roundtrip(cmd.clone()).await, cmd);
        }
    }

    #[tokio::test]
    async fn roundtrip_host_id_high_bits() {
        let addr: SocketAddr = "10.0.0.9:31337".parse().unwrap();
        let cmd = Command::handshake_response(
            HostId(u128::MAX - 7),
            addr,
            PeerState::AliveFollower,
        );
        assert_eq!(roundtrip(cmd.clone()).await, cmd);
    }

    #[test]
    fn validate_missing_fields() {
        let mut cmd = Command::request_prepare(7);
        cmd.proposal_id = None;
        assert!(cmd.validate().is_err());

        let mut cmd = Command::client_request(Bytes::from_static(b"w"));
        cmd.workload = None;
        assert!(cmd.validate().is_err());

        let addr: SocketAddr = "127.0.0.1:7001".parse().unwrap();
        let mut cmd = Command::handshake_response(
            HostId(1),
            addr,
            PeerState::AliveFollower,
        );
        cmd.host_endpoint = None;
        assert!(cmd.validate().is_err());
    }

    #[tokio::test]
    async fn frame_at_cap_ok_above_cap_oversize() {
        // find the payload size of a frame holding an N-byte workload, then
        // cap exactly at it
        let workload = Bytes::from(vec![0u8; 1024]);
        let frame =
            encode_frame(&Command::client_request(workload.clone()), usize::MAX)
                .unwrap();
        let cap = frame.len() - 4;

        let (mut tx, mut rx) = tokio::io::duplex(64 * 1024);
        tx.write_all(&frame).await.unwrap();
        let mut buf = BytesMut::new();
        assert!(read_frame(&mut buf, &mut rx, cap).await.is_ok());

        // one byte over the cap must be rejected from the header alone
        tx.write_all(&frame).await.unwrap();
        let mut buf = BytesMut::new();
        match read_frame(&mut buf, &mut rx, cap - 1).await {
            Err(ReadError::Codec(CodecError::FrameOversize { .. })) => {}
            other => panic!("expected oversize, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn truncated_frame() {
        let frame = encode_frame(
            &Command::client_request(Bytes::from_static(b"hello")),
            DEFAULT_MAX_FRAME,
        )
        .unwrap();
        let (mut tx, mut rx) = tokio::io::duplex(64 * 1024);
        tx.write_all(&frame[..frame.len() - 2]).await.unwrap();
        drop(tx); // EOF mid-frame
        let mut buf = BytesMut::new();
        match read_frame(&mut buf, &mut rx, DEFAULT_MAX_FRAME).await {
            Err(ReadError::Codec(CodecError::FrameTruncated)) => {}
            other => panic!("expected truncated, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn clean_eof() {
        let (tx, mut rx) = tokio::io::duplex(64);
        drop(tx);
        let mut buf = BytesMut::new();
        match read_frame(&mut buf, &mut rx, DEFAULT_MAX_FRAME).await {
            Err(ReadError::Eof) => {}
            other => panic!("expected eof, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn malformed_payload() {
        let garbage = [0u8, 0, 0, 4, 0xc1, 0xc1, 0xc1, 0xc1];
        let (mut tx, mut rx) = tokio::io::duplex(64);
        tx.write_all(&garbage).await.unwrap();
        let mut buf = BytesMut::new();
        match read_frame(&mut buf, &mut rx, DEFAULT_MAX_FRAME).await {
            Err(ReadError::Codec(CodecError::DecodeMalformed(_))) => {}
            other => panic!("expected malformed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn pipelined_frames_share_buffer() {
        let first = encode_frame(
            &Command::client_request(Bytes::from_static(b"one")),
            DEFAULT_MAX_FRAME,
        )
        .unwrap();
        let second = encode_frame(
            &Command::client_request(Bytes::from_static(b"two")),
            DEFAULT_MAX_FRAME,
        )
        .unwrap();
        let (mut tx, mut rx) = tokio::io::duplex(64 * 1024);
        tx.write_all(&first).await.unwrap();
        tx.write_all(&second).await.unwrap();

        let mut buf = BytesMut::new();
        let one = read_frame(&mut buf, &mut rx, DEFAULT_MAX_FRAME)
            .await
            .unwrap();
        let two = read_frame(&mut buf, &mut rx, DEFAULT_MAX_FRAME)
            .await
            .unwrap();
        assert_eq!(one.workload.unwrap(), Bytes::from_static(b"one"));
        assert_eq!(two.workload.unwrap(), Bytes::from_static(b"two"));
    }
}
