//! Ensemble's client-side functionality modules.
//!
//! The client keeps one persistent connection to every configured server,
//! discovers the leader through its own startup handshake, and pipelines
//! requests FIFO over the leader's connection. Responses come back in
//! submission order, so the k-th received response answers the k-th
//! submitted request.

mod driver;

use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Duration;

use crate::client::driver::{ClientDriver, Submission};
use crate::utils::EnsembleError;
use crate::wire::{ErrorCode, DEFAULT_MAX_FRAME};

/// Configuration parameters struct.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct ClientConfig {
    /// Timeout of one server handshake (connect + response) in millisecs.
    pub handshake_timeout_ms: u64,

    /// Overall deadline of leader discovery during `start()` in millisecs.
    pub start_timeout_ms: u64,

    /// Cap on a single wire frame's payload length in bytes.
    pub max_frame_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            handshake_timeout_ms: 3000,
            start_timeout_ms: 10000,
            max_frame_size: DEFAULT_MAX_FRAME,
        }
    }
}

impl ClientConfig {
    fn sanitize(&self) -> Result<(), EnsembleError> {
        if self.handshake_timeout_ms == 0 {
            return logged_err!(
                "invalid config.handshake_timeout_ms '{}'",
                self.handshake_timeout_ms
            );
        }
        if self.start_timeout_ms < self.handshake_timeout_ms {
            return logged_err!(
                "invalid config.start_timeout_ms '{}'",
                self.start_timeout_ms
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

/// Typed failure of one submitted request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestError {
    /// The per-request deadline fired before a response arrived.
    Timeout,

    /// The leader's connection was lost with the request outstanding.
    ConnectionLost,

    /// No server currently claims leadership.
    NoLeader,

    /// The cluster answered with a typed error code.
    Server(ErrorCode),
}

impl fmt::Display for RequestError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RequestError::Timeout => write!(f, "timeout"),
            RequestError::ConnectionLost => write!(f, "connection-lost"),
            RequestError::NoLeader => write!(f, "no-leader"),
            RequestError::Server(code) => write!(f, "server-error/{}", code),
        }
    }
}

impl std::error::Error for RequestError {}

/// Future resolving to one request's agreed response.
pub struct ResponseFuture(
    oneshot::Receiver<Result<Bytes, RequestError>>,
);

impl Future for ResponseFuture {
    type Output = Result<Bytes, RequestError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.0).poll(cx).map(|res| match res {
            Ok(result) => result,
            // driver gone with the slot unfulfilled
            Err(_) => Err(RequestError::ConnectionLost),
        })
    }
}

/// An Ensemble client handle.
///
/// Mirrors the server API: register every server endpoint with
/// [`add`](Client::add), then [`start`](Client::start) to handshake and
/// discover the leader, then [`send`](Client::send) workloads.
pub struct Client {
    config: ClientConfig,
    endpoints: Vec<SocketAddr>,
    tx_submit: Option<mpsc::UnboundedSender<Submission>>,
    _driver_handle: Option<JoinHandle<()>>,
}

impl Client {
    /// Creates a new client with the default configuration.
    pub fn new() -> Self {
        Client {
            config: ClientConfig::default(),
            endpoints: Vec::new(),
            tx_submit: None,
            _driver_handle: None,
        }
    }

    /// Creates a new client, overlaying configuration fields parsed from
    /// the given TOML string onto the defaults.
    pub fn new_with_config(
        config_str: Option<&str>,
    ) -> Result<Self, EnsembleError> {
        let config = parsed_config!(config_str => ClientConfig;
                                    handshake_timeout_ms, start_timeout_ms,
                                    max_frame_size)?;
        config.sanitize()?;
        let mut client = Self::new();
        client.config = config;
        Ok(client)
    }

    /// Registers a server endpoint. Must be called before `start()`;
    /// duplicates are rejected.
    pub fn add(&mut self, endpoint: SocketAddr) -> Result<(), EnsembleError> {
        if self.tx_submit.is_some() {
            return logged_err!("add('{}') after start", endpoint);
        }
        if self.endpoints.contains(&endpoint) {
            return logged_err!("duplicate server endpoint '{}'", endpoint);
        }
        self.endpoints.push(endpoint);
        Ok(())
    }

    /// Connects to every configured server, runs the handshake against
    /// each, and retries until some server reports itself leader (servers
    /// may still be electing). Fails after `start_timeout_ms`.
    pub async fn start(&mut self) -> Result<(), EnsembleError> {
        if self.tx_submit.is_some() {
            return logged_err!("client already started");
        }
        if self.endpoints.is_empty() {
            return logged_err!("no server endpoints configured");
        }

        let (tx_submit, rx_submit) = mpsc::unbounded_channel();
        let (tx_ready, rx_ready) = oneshot::channel();
        let driver = ClientDriver::new(
            self.config.clone(),
            self.endpoints.clone(),
            rx_submit,
        );
        self._driver_handle = Some(tokio::spawn(driver.run(tx_ready)));

        rx_ready.await??;
        self.tx_submit = Some(tx_submit);
        Ok(())
    }

    /// Submits one workload with a per-request deadline, returning a future
    /// of the agreed response. Requests are pipelined: many may be in
    /// flight over the leader's connection at once.
    pub fn send(
        &self,
        workload: impl Into<Bytes>,
        timeout: Duration,
    ) -> Result<ResponseFuture, EnsembleError> {
        let tx_submit = match self.tx_submit.as_ref() {
            Some(tx) => tx,
            None => return logged_err!("send() before start()"),
        };
        let (tx, rx) = oneshot::channel();
        tx_submit
            .send(Submission {
                workload: workload.into(),
                timeout,
                slot: tx,
            })
            .map_err(|_| EnsembleError::msg("client driver has exited"))?;
        Ok(ResponseFuture(rx))
    }
}

impl Default for Client {
    fn default() -> Self {
        Self::new()
    }
}
