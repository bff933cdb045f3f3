mod api;
mod cache;
mod cluster;
mod config;
mod error;
mod log;
mod logging;
mod persistence;

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tonic::transport::Server;
use tracing::info;

use cluster::rpc::raft_proto::raft_rpc_server::RaftRpcServer;
use cluster::rpc::RaftService;
use config::Config;

/// A replicated in-memory key/value store using leader-based consensus
/// (Raft). Each process is one node in a fixed, statically-configured
/// cluster.
#[derive(Parser, Debug)]
#[command(name = "raftkv", version)]
struct Args {
    /// This node's id; must match a key in the cluster config's `nodes` map.
    #[arg(long)]
    node_id: String,

    /// Path to the cluster config TOML file.
    #[arg(long, default_value = "config/cluster.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init();

    let args = Args::parse();
    let config = Config::load(&args.config)?;

    let rpc_addr = *config
        .cluster
        .nodes
        .get(&args.node_id)
        .ok_or_else(|| anyhow::anyhow!("node id {:?} not present in cluster config", args.node_id))?;
    let http_addr = *config
        .cluster
        .http_addrs
        .get(&args.node_id)
        .ok_or_else(|| anyhow::anyhow!("node id {:?} missing an http address", args.node_id))?;

    info!(
        node_id = %args.node_id,
        %rpc_addr,
        %http_addr,
        peers = config.cluster.nodes.len() - 1,
        "starting raftkv node"
    );

    let node = cluster::Node::new(args.node_id.clone(), config)?;
    cluster::spawn_background_tasks(node.clone());

    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);

    let mut rpc_server = {
        let node = node.clone();
        let mut shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move {
            Server::builder()
                .add_service(RaftRpcServer::new(RaftService::new(node)))
                .serve_with_shutdown(rpc_addr, async move {
                    let _ = shutdown_rx.recv().await;
                })
                .await
        })
    };

    let mut http_server = {
        let app = api::router(node.clone());
        let mut shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move {
            let listener = tokio::net::TcpListener::bind(http_addr).await?;
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.recv().await;
                })
                .await
        })
    };

    // `&mut` branches, not by-value: a plain `select!` would drop whichever
    // task handle didn't win the race, making it impossible to await that
    // server's clean shutdown below once ctrl_c fires.
    tokio::select! {
        result = &mut rpc_server => {
            result??;
            return Ok(());
        }
        result = &mut http_server => {
            result??;
            return Ok(());
        }
        _ = tokio::signal::ctrl_c() => {
            info!("received shutdown signal, draining in-flight work");
        }
    }

    // Stop accepting new client/RPC requests; both servers finish whatever
    // they're already handling before their `serve` futures resolve (spec
    // section 6: "stop accepting client requests, finish in-flight
    // applies, persist state, and exit").
    let _ = shutdown_tx.send(());
    rpc_server.await??;
    http_server.await??;

    // Let the apply loop catch up to whatever was committed before the
    // servers stopped, rather than exiting with committed-but-unapplied
    // entries still pending.
    while node.last_applied() < node.commit_index().await {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    node.persist_current().await?;
    info!("shutdown complete");
    Ok(())
}
