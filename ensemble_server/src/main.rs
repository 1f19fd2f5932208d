//! Ensemble server node executable, serving the stock echo workload.

use std::collections::HashSet;
use std::net::SocketAddr;

use clap::Parser;

use env_logger::Env;

use tokio::runtime::Builder;

use ensemble::{pf_error, pf_info, EnsembleError, Server};

/// Command line arguments definition.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    /// Endpoint to bind and serve on; must appear in the replica list.
    #[arg(short, long)]
    bind: SocketAddr,

    /// List of all server endpoints of the cluster, self included.
    /// Example: '-r host1:port1 -r host2:port2 -r host3:port3'.
    #[arg(short, long)]
    replicas: Vec<SocketAddr>,

    /// Number of tokio worker threads.
    #[arg(long, default_value_t = 2)]
    threads: usize,

    /// TOML string of configuration field overrides.
    #[arg(short, long)]
    config: Option<String>,
}

impl CliArgs {
    /// Sanitize command line arguments, return `Ok(())` on success or
    /// `Err(EnsembleError)` on any error.
    fn sanitize(&self) -> Result<(), EnsembleError> {
        // check for duplicate replicas
        let mut replicas_set = HashSet::new();
        for addr in self.replicas.iter() {
            if !replicas_set.insert(addr) {
                return Err(EnsembleError(format!(
                    "duplicate replica address '{}' given",
                    addr
                )));
            }
        }

        if !self.replicas.contains(&self.bind) {
            Err(EnsembleError(format!(
                "bind address '{}' not in replica list",
                self.bind
            )))
        } else if self.bind.port() <= 1024 {
            Err(EnsembleError(format!(
                "invalid bind port {}",
                self.bind.port()
            )))
        } else if self.threads < 2 {
            Err(EnsembleError(format!(
                "invalid number of threads {}",
                self.threads
            )))
        } else {
            Ok(())
        }
    }
}

// Server node executable main entrance.
fn server_main() -> Result<(), EnsembleError> {
    // read in and parse command line arguments
    let args = CliArgs::parse();
    args.sanitize()?;

    // create tokio multi-threaded runtime
    let runtime = Builder::new_multi_thread()
        .enable_all()
        .worker_threads(args.threads)
        .thread_name(format!("tokio-worker-{}", args.bind.port()))
        .build()?;

    // enter tokio runtime, set up the server, and serve until ctrl-c
    runtime.block_on(async move {
        let mut server = Server::new_with_config(
            args.bind,
            |workload: &[u8]| workload.to_vec(),
            args.config.as_deref(),
        )?;
        for &replica in &args.replicas {
            server.add(replica)?;
        }
        server.start().await?;
        pf_info!("server {} serving echo workload", args.bind);

        tokio::signal::ctrl_c().await?;
        pf_info!("interrupted, shutting down");
        server.shutdown();
        Ok::<(), EnsembleError>(())
    })
}

fn main() {
    env_logger::Builder::from_env(Env::default().default_filter_or("info"))
        .format_timestamp(None)
        .format_module_path(true)
        .format_target(false)
        .init();

    if let Err(e) = server_main() {
        pf_error!("server_main exited: {}", e);
    }
}
