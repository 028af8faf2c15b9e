use std::path::PathBuf;

use clap::Parser;

/// Replicated, persistent chat server.
#[derive(Parser, Debug)]
#[command(name = "parley-server")]
pub struct Args {
    /// Which port to serve clients on.
    pub chat_port: u16,

    /// Which port to serve replicas (other servers) on.
    pub replica_port: u16,

    /// Filename of this server's local database.
    #[arg(value_name = "database.db")]
    pub database: PathBuf,

    /// Externally reachable host other replicas should dial us on.
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,

    /// Address of an already-running member of a cluster of replicas
    /// that this server should join.
    #[arg(long, value_name = "IP:PORT")]
    pub cluster: Option<String>,

    /// How many minutes to wait before exiting, to test crash/failstop
    /// fault tolerance.
    #[arg(long, value_name = "MIN")]
    pub self_destruct: Option<f64>,
}
