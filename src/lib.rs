//! Public interface to the Ensemble core library, linked by both the server
//! executable and the client executable.
//!
//! Ensemble replicates opaque byte-string workloads across a small static
//! cluster of servers. Each client request is one instance of single-decree
//! Paxos: the elected leader runs a prepare/promise round against all live
//! peers, then an accept/accepted round in which every live server (the
//! leader included) executes the workload through the embedder-supplied
//! callback, and finally forwards the agreed result back to the client.

#[macro_use]
mod utils;

mod client;
mod conn;
mod server;
mod wire;

pub use client::{Client, ClientConfig, RequestError, ResponseFuture};
pub use server::{Server, ServerConfig, WorkloadFn};
pub use utils::EnsembleError;
pub use wire::{CodecError, ErrorCode};
