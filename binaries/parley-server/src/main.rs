mod chat;
mod config;
mod mailbox;
mod node;
mod peers;
mod pubsub;
mod replica;
mod store;

use std::fmt::Display;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use clap::Parser;
use futures_concurrency::future::Race;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use parley_structs::chat::{ChatRpcError, ChatService};
use parley_structs::replica::{ReplicaRpcError, ReplicaService};
use parley_wire::serve;

use crate::config::Args;
use crate::node::Node;
use crate::store::Store;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("parley_server=debug"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args = Args::parse();
    let store = Store::open(&args.database).await?;
    let identity = format!("{}:{}", args.host, args.replica_port);
    let node = Node::new(identity.as_str(), store);

    let chat_listener = TcpListener::bind(("0.0.0.0", args.chat_port)).await?;
    let replica_listener = TcpListener::bind(("0.0.0.0", args.replica_port)).await?;
    tracing::info!(
        "serving clients on {}:{} and replicas on {identity}",
        args.host,
        args.chat_port
    );

    if let Some(cluster) = &args.cluster {
        node.bootstrap(cluster).await?;
    }

    let mut servers: Vec<Pin<Box<dyn Future<Output = anyhow::Result<()>>>>> = Vec::new();
    servers.push(Box::pin(serve(chat_listener, ChatService(node.clone()))));
    servers.push(Box::pin(serve(replica_listener, ReplicaService(node))));
    if let Some(minutes) = args.self_destruct {
        servers.push(Box::pin(async move {
            tokio::time::sleep(Duration::from_secs_f64(minutes * 60.0)).await;
            tracing::info!("self-destruct timer elapsed, exiting");
            Ok(())
        }));
    }
    servers.race().await?;
    Ok(())
}

fn fatal_chat_error(err: impl Display) -> ChatRpcError {
    tracing::error!("fatal error: {err}");
    ChatRpcError::Internal(err.to_string())
}

fn fatal_replica_error(err: impl Display) -> ReplicaRpcError {
    tracing::error!("fatal error: {err}");
    ReplicaRpcError::Internal(err.to_string())
}
