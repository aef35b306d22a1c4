use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::coordinator::CoordinatorConfig;
use crate::gateway::GatewayConfig;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Key-value store replicated with two-phase commit",
    long_about = None
)]
pub struct Cli {
    /// File that receives a plain-text copy of the log. Servers default to
    /// `server.log`; client-side commands only log to a file when asked.
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Log file used by the long-running server commands when none is given.
pub const DEFAULT_SERVER_LOG: &str = "server.log";

impl Cli {
    /// Where this invocation appends its log, if anywhere.
    pub fn log_file(&self) -> Option<&Path> {
        match &self.log_file {
            Some(path) => Some(path.as_path()),
            None if self.command.is_server() => Some(Path::new(DEFAULT_SERVER_LOG)),
            None => None,
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Host replica stores, one RPC listener per address.
    Replicas(ReplicasArgs),
    /// Serve the line protocol over TCP, writing through 2PC.
    TcpGateway(GatewayArgs),
    /// Serve the line protocol over UDP, writing through 2PC.
    UdpGateway(GatewayArgs),
    /// Send one request to a gateway and print the response.
    Client(ClientArgs),
    /// Seed key1..keyN with value1..valueN through 2PC.
    Populate(PopulateArgs),
    /// Run concurrent PUT, GET and DELETE operations against the cluster.
    Workload(WorkloadArgs),
}

impl Command {
    /// Replicas and gateways run until interrupted; the rest are one-shot.
    pub fn is_server(&self) -> bool {
        matches!(
            self,
            Command::Replicas(_) | Command::TcpGateway(_) | Command::UdpGateway(_)
        )
    }
}

#[derive(Args, Debug, Clone)]
pub struct ReplicasArgs {
    /// Addresses to serve replicas on; replica N listens on the Nth address.
    #[arg(long = "listen", num_args = 1.., default_values_t = default_replica_addrs())]
    pub listen: Vec<SocketAddr>,
}

/// 127.0.0.1:1099 through 127.0.0.1:1103.
pub fn default_replica_addrs() -> Vec<SocketAddr> {
    (1099..=1103)
        .map(|port| SocketAddr::from(([127, 0, 0, 1], port)))
        .collect()
}

/// Replica addresses and coordinator tuning shared by every command that
/// drives transactions.
#[derive(Args, Debug, Clone)]
pub struct ClusterArgs {
    /// Replica RPC addresses, in cluster order.
    #[arg(long = "replica", required = true, num_args = 1..)]
    pub replicas: Vec<String>,

    /// Give up on a replica call after this many milliseconds (default:
    /// wait forever).
    #[arg(long)]
    pub call_timeout_ms: Option<u64>,

    /// Serialize transactions on the same key.
    #[arg(long)]
    pub sequence_keys: bool,

    /// Bound on connecting to a replica, in milliseconds.
    #[arg(long, default_value_t = 5000)]
    pub connect_timeout_ms: u64,
}

impl ClusterArgs {
    pub fn coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            call_timeout: self.call_timeout_ms.map(Duration::from_millis),
            sequence_keys: self.sequence_keys,
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

#[derive(Args, Debug, Clone)]
pub struct GatewayArgs {
    /// Address to accept client requests on.
    #[arg(long)]
    pub listen: SocketAddr,

    #[command(flatten)]
    pub cluster: ClusterArgs,

    /// Maximum number of worker tasks handling requests.
    #[arg(long, default_value_t = 10)]
    pub workers: usize,

    /// Retire a worker after this many idle seconds (default: 30 for TCP,
    /// 60 for UDP).
    #[arg(long)]
    pub idle_secs: Option<u64>,
}

impl GatewayArgs {
    pub fn gateway_config(&self, mut defaults: GatewayConfig) -> GatewayConfig {
        defaults.pool.max_workers = self.workers.max(1);
        if let Some(secs) = self.idle_secs {
            defaults.pool.idle_timeout = Duration::from_secs(secs);
        }
        defaults
    }
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Tcp,
    Udp,
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    #[arg(long, value_enum, default_value_t = Transport::Tcp)]
    pub transport: Transport,

    /// Gateway address.
    #[arg(long)]
    pub server: SocketAddr,

    /// PUT, GET or DELETE.
    pub operation: String,

    pub key: String,

    /// Required for PUT.
    pub value: Option<String>,
}

impl ClientArgs {
    /// The request line this invocation sends.
    pub fn request_line(&self) -> String {
        let operation = self.operation.to_uppercase();
        match &self.value {
            Some(value) => format!("{operation} {} {value}", self.key),
            None => format!("{operation} {}", self.key),
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct PopulateArgs {
    #[command(flatten)]
    pub cluster: ClusterArgs,

    /// How many keys to seed.
    #[arg(long, default_value_t = 5)]
    pub count: usize,
}

#[derive(Args, Debug, Clone)]
pub struct WorkloadArgs {
    #[command(flatten)]
    pub cluster: ClusterArgs,

    /// Keys per operation round.
    #[arg(long, default_value_t = 5)]
    pub keys: usize,

    /// Operations in flight at once.
    #[arg(long, default_value_t = 1)]
    pub concurrency: usize,
}
