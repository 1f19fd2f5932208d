//! Asynchronous connection layer: per-connection messenger tasks plus the
//! connection pool owned by a driving event loop.
//!
//! Each TCP connection is serviced by one spawned messenger task that owns
//! the split stream halves. Outbound commands are enqueued FIFO through the
//! pool; inbound frames and connection lifecycle changes are delivered to
//! the owning event loop as [`ConnEvent`]s over a single mpsc channel.
//! Dropping a connection's handle is the close signal: the messenger drains
//! its queued writes, shuts the socket, and reports `Closed`.

use std::collections::HashMap;
use std::net::SocketAddr;

use bytes::BytesMut;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use crate::utils::EnsembleError;
use crate::wire::{self, CodecError, Command, ReadError};

/// Connection identifier, unique within one pool.
pub(crate) type ConnId = u64;

/// Notification delivered from a messenger task to the owning event loop.
#[derive(Debug)]
pub(crate) enum ConnEvent {
    /// A complete command frame arrived on this connection.
    Frame(ConnId, Command),

    /// The inbound byte stream is corrupt (oversize/truncated/malformed).
    /// Reading has stopped; queued writes still drain until the handle is
    /// dropped.
    Corrupt(ConnId, CodecError),

    /// The connection is gone (EOF, reset, or closed by the pool).
    Closed(ConnId),
}

/// Pool-side handle to one live connection.
struct ConnHandle {
    /// Sender side of the messenger's write queue.
    tx_send: mpsc::UnboundedSender<Command>,

    /// Peer endpoint this connection is installed for, if any.
    peer: Option<SocketAddr>,
}

/// Connection pool keyed by connection id, owned by a single event loop.
pub(crate) struct ConnPool {
    conns: HashMap<ConnId, ConnHandle>,
    next_id: ConnId,
    tx_event: mpsc::UnboundedSender<ConnEvent>,
    max_frame: usize,
}

impl ConnPool {
    /// Creates a new pool. Events from all registered connections arrive on
    /// the returned channel's receiver, which the caller keeps.
    pub(crate) fn new(
        max_frame: usize,
    ) -> (Self, mpsc::UnboundedReceiver<ConnEvent>) {
        let (tx_event, rx_event) = mpsc::unbounded_channel();
        (
            ConnPool {
                conns: HashMap::new(),
                next_id: 0,
                tx_event,
                max_frame,
            },
            rx_event,
        )
    }

    /// Registers an established TCP stream and spawns its messenger task.
    pub(crate) fn register(&mut self, stream: TcpStream) -> ConnId {
        self.next_id += 1;
        let id = self.next_id;

        let (tx_send, rx_send) = mpsc::unbounded_channel();
        self.conns.insert(
            id,
            ConnHandle {
                tx_send,
                peer: None,
            },
        );

        let messenger = MessengerTask::new(
            id,
            stream,
            rx_send,
            self.tx_event.clone(),
            self.max_frame,
        );
        tokio::spawn(async move { messenger.run().await });

        id
    }

    /// Enqueues a command on a connection's FIFO write queue. Returns false
    /// if the connection is no longer in the pool.
    pub(crate) fn send(&self, id: ConnId, cmd: Command) -> bool {
        match self.conns.get(&id) {
            Some(handle) => handle.tx_send.send(cmd).is_ok(),
            None => false,
        }
    }

    /// Closes a connection by dropping its handle; queued writes drain
    /// first, then the messenger reports `Closed`.
    pub(crate) fn close(&mut self, id: ConnId) {
        self.conns.remove(&id);
    }

    /// Removes a connection entry after its `Closed` event.
    pub(crate) fn forget(&mut self, id: ConnId) {
        self.conns.remove(&id);
    }

    /// Binds a connection to the peer endpoint it is installed for.
    pub(crate) fn bind_peer(&mut self, id: ConnId, peer: SocketAddr) {
        if let Some(handle) = self.conns.get_mut(&id) {
            handle.peer = Some(peer);
        }
    }

    /// Looks up the peer endpoint a connection is installed for.
    pub(crate) fn peer_of(&self, id: ConnId) -> Option<SocketAddr> {
        self.conns.get(&id).and_then(|h| h.peer)
    }
}

/// Per-connection messenger task.
struct MessengerTask {
    id: ConnId,

    conn_read: OwnedReadHalf,
    conn_write: OwnedWriteHalf,

    rx_send: mpsc::UnboundedReceiver<Command>,
    tx_event: mpsc::UnboundedSender<ConnEvent>,

    read_buf: BytesMut,
    write_buf: BytesMut,
    write_buf_cursor: usize,

    /// True while a partially-written frame is waiting for socket space.
    retrying: bool,

    /// False after a read error; writes still drain.
    reading: bool,

    max_frame: usize,
}

impl MessengerTask {
    fn new(
        id: ConnId,
        stream: TcpStream,
        rx_send: mpsc::UnboundedReceiver<Command>,
        tx_event: mpsc::UnboundedSender<ConnEvent>,
        max_frame: usize,
    ) -> Self {
        let (conn_read, conn_write) = stream.into_split();
        MessengerTask {
            id,
            conn_read,
            conn_write,
            rx_send,
            tx_event,
            read_buf: BytesMut::with_capacity(4 + 1024),
            write_buf: BytesMut::with_capacity(4 + 1024),
            write_buf_cursor: 0,
            retrying: false,
            reading: true,
            max_frame,
        }
    }

    /// Tries to push the staged frame bytes into the socket without
    /// blocking. Returns `Ok(false)` if the socket would block; the caller
    /// retries on the next `writable()` wakeup.
    ///
    /// DEADLOCK AVOIDANCE: `write_all()` is avoided here because, with TCP
    /// buffers full in both directions, two endpoints both blocked on
    /// writing would deadlock; `try_write` keeps the select loop reading.
    fn flush_write_buf(
        write_buf: &mut BytesMut,
        write_buf_cursor: &mut usize,
        conn_write: &OwnedWriteHalf,
    ) -> Result<bool, EnsembleError> {
        while *write_buf_cursor < write_buf.len() {
            match conn_write.try_write(&write_buf[*write_buf_cursor..]) {
                Ok(n) => {
                    *write_buf_cursor += n;
                }
                Err(ref err)
                    if err.kind() == std::io::ErrorKind::WouldBlock =>
                {
                    return Ok(false);
                }
                Err(err) => return Err(err.into()),
            }
        }

        write_buf.clear();
        *write_buf_cursor = 0;
        Ok(true)
    }

    /// Stages a new frame into the write buffer and flushes what fits.
    fn write_frame(&mut self, cmd: &Command) -> Result<bool, EnsembleError> {
        debug_assert!(self.write_buf.is_empty());
        let frame = wire::encode_frame(cmd, self.max_frame)?;
        self.write_buf.extend_from_slice(&frame);
        Self::flush_write_buf(
            &mut self.write_buf,
            &mut self.write_buf_cursor,
            &self.conn_write,
        )
    }

    async fn run(mut self) {
        pf_debug!("messenger task for conn {} spawned", self.id);

        loop {
            tokio::select! {
                // next command to send out
                cmd = self.rx_send.recv(), if !self.retrying => {
                    match cmd {
                        Some(cmd) => match self.write_frame(&cmd) {
                            Ok(true) => {}
                            Ok(false) => {
                                self.retrying = true;
                            }
                            Err(e) => {
                                pf_debug!("error writing conn {}: {}", self.id, e);
                                break;
                            }
                        },
                        // handle dropped by the pool: close after drain
                        None => break,
                    }
                },

                // retrying last unsuccessful flush
                _ = self.conn_write.writable(), if self.retrying => {
                    match Self::flush_write_buf(
                        &mut self.write_buf,
                        &mut self.write_buf_cursor,
                        &self.conn_write,
                    ) {
                        Ok(true) => {
                            self.retrying = false;
                        }
                        Ok(false) => {}
                        Err(e) => {
                            pf_debug!("error flushing conn {}: {}", self.id, e);
                            break;
                        }
                    }
                },

                // new frame arrives
                frame = wire::read_frame(
                    &mut self.read_buf,
                    &mut self.conn_read,
                    self.max_frame,
                ), if self.reading => {
                    match frame {
                        Ok(cmd) => {
                            if self.tx_event
                                .send(ConnEvent::Frame(self.id, cmd))
                                .is_err()
                            {
                                break; // event loop is gone
                            }
                        }
                        Err(ReadError::Codec(e)) => {
                            // reading stops; let the owner decide whether to
                            // reply before dropping the handle
                            let _ = self.tx_event
                                .send(ConnEvent::Corrupt(self.id, e));
                            self.reading = false;
                        }
                        Err(_) => break, // EOF or reset
                    }
                },
            }
        }

        let _ = self.tx_event.send(ConnEvent::Closed(self.id));
        pf_debug!("messenger task for conn {} exited", self.id);
    }
}
