//! Ensemble client executable: submits workloads and prints the agreed
//! responses.

use std::collections::HashSet;
use std::net::SocketAddr;

use clap::Parser;

use env_logger::Env;

use tokio::runtime::Builder;
use tokio::time::Duration;

use ensemble::{pf_error, pf_info, pf_warn, Client, EnsembleError};

/// Command line arguments definition.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    /// List of server endpoints of the cluster.
    /// Example: '-s host1:port1 -s host2:port2 -s host3:port3'.
    #[arg(short, long)]
    servers: Vec<SocketAddr>,

    /// Number of workloads to submit (pipelined).
    #[arg(short, long, default_value_t = 1)]
    count: usize,

    /// Workload payload prefix; the request index is appended.
    #[arg(short, long, default_value_t = String::from("workload"))]
    payload: String,

    /// Per-request timeout in millisecs.
    #[arg(short, long, default_value_t = 10000)]
    timeout_ms: u64,

    /// TOML string of configuration field overrides.
    #[arg(long)]
    config: Option<String>,
}

impl CliArgs {
    /// Sanitize command line arguments, return `Ok(())` on success or
    /// `Err(EnsembleError)` on any error.
    fn sanitize(&self) -> Result<(), EnsembleError> {
        if self.servers.is_empty() {
            return Err(EnsembleError("no server endpoints given".into()));
        }
        let mut servers_set = HashSet::new();
        for addr in self.servers.iter() {
            if !servers_set.insert(addr) {
                return Err(EnsembleError(format!(
                    "duplicate server address '{}' given",
                    addr
                )));
            }
        }
        if self.count == 0 {
            Err(EnsembleError("invalid count 0".into()))
        } else if self.timeout_ms == 0 {
            Err(EnsembleError("invalid timeout_ms 0".into()))
        } else {
            Ok(())
        }
    }
}

// Client executable main entrance.
fn client_main() -> Result<(), EnsembleError> {
    // read in and parse command line arguments
    let args = CliArgs::parse();
    args.sanitize()?;

    // create tokio multi-threaded runtime
    let runtime = Builder::new_multi_thread()
        .enable_all()
        .worker_threads(2)
        .thread_name("tokio-worker-client")
        .build()?;

    // enter tokio runtime, discover the leader, and pipeline the workloads
    runtime.block_on(async move {
        let mut client = Client::new_with_config(args.config.as_deref())?;
        for &server in &args.servers {
            client.add(server)?;
        }
        client.start().await?;

        let timeout = Duration::from_millis(args.timeout_ms);
        let mut futures = Vec::with_capacity(args.count);
        for i in 0..args.count {
            let workload = format!("{}-{}", args.payload, i);
            futures.push((i, client.send(workload.into_bytes(), timeout)?));
        }

        let mut failures = 0;
        for (i, future) in futures {
            match future.await {
                Ok(response) => pf_info!(
                    "request {} -> '{}'",
                    i,
                    String::from_utf8_lossy(&response)
                ),
                Err(e) => {
                    failures += 1;
                    pf_warn!("request {} failed: {}", i, e);
                }
            }
        }
        if failures > 0 {
            return Err(EnsembleError(format!(
                "{} of {} requests failed",
                failures, args.count
            )));
        }
        Ok(())
    })
}

fn main() {
    env_logger::Builder::from_env(Env::default().default_filter_or("info"))
        .format_timestamp(None)
        .format_module_path(true)
        .format_target(false)
        .init();

    if let Err(e) = client_main() {
        pf_error!("client_main exited: {}", e);
    }
}
