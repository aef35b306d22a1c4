use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use futures::future::join_all;
use tokio::{
    net::{TcpListener, UdpSocket},
    sync::watch,
};
use tracing::{error, info, warn};

use two_phase_kv::{
    cli::{Cli, ClientArgs, ClusterArgs, Command, Transport},
    client,
    cluster::ClusterView,
    coordinator::Coordinator,
    gateway::{GatewayConfig, TcpGateway, UdpGateway},
    logging::init_tracing,
    router::RequestRouter,
    rpc::ReplicaServer,
    store::ReplicaStore,
};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_file());

    match cli.command {
        Command::Replicas(args) => run_replicas(args.listen).await?,
        Command::TcpGateway(args) => {
            let router = build_router(&args.cluster)?;
            let listener = TcpListener::bind(args.listen)
                .await
                .with_context(|| format!("failed to bind {}", args.listen))?;
            let config = args.gateway_config(GatewayConfig::tcp_defaults());
            let gateway = TcpGateway::new(listener, router, config);
            info!("tcp gateway listening on {}", gateway.local_addr()?);
            gateway.run_until(ctrl_c()).await?;
        }
        Command::UdpGateway(args) => {
            let router = build_router(&args.cluster)?;
            let socket = UdpSocket::bind(args.listen)
                .await
                .with_context(|| format!("failed to bind {}", args.listen))?;
            let config = args.gateway_config(GatewayConfig::udp_defaults());
            let gateway = UdpGateway::new(socket, router, config);
            info!("udp gateway listening on {}", gateway.local_addr()?);
            gateway.run_until(ctrl_c()).await?;
        }
        Command::Client(args) => run_client(args).await?,
        Command::Populate(args) => {
            let coordinator = build_coordinator(&args.cluster)?;
            let committed = client::prepopulate(&coordinator, args.count).await;
            println!("pre-populated {committed} of {} keys", args.count);
        }
        Command::Workload(args) => {
            let coordinator = Arc::new(build_coordinator(&args.cluster)?);
            let outcomes = client::run_workload(coordinator, args.keys, args.concurrency).await;
            for outcome in &outcomes {
                println!("{:?} -> {}", outcome.step, outcome.response);
            }
        }
    }

    Ok(())
}

async fn ctrl_c() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!("failed to listen for ctrl-c: {err:?}");
        std::future::pending::<()>().await;
    }
}

/// Hosts one replica store per address until ctrl-c.
async fn run_replicas(addrs: Vec<std::net::SocketAddr>) -> Result<()> {
    let (stop_tx, stop_rx) = watch::channel(false);
    let mut servers = Vec::with_capacity(addrs.len());

    for (i, addr) in addrs.iter().enumerate() {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind replica listener on {addr}"))?;
        let store = Arc::new(ReplicaStore::new(format!("replica-{}", i + 1)));
        let server = ReplicaServer::new(listener, store);
        info!(replica = %server.store().name(), "replica listening on {}", server.local_addr()?);

        let mut stop_rx = stop_rx.clone();
        servers.push(tokio::spawn(server.run_until(async move {
            let _ = stop_rx.wait_for(|stop| *stop).await;
        })));
    }

    ctrl_c().await;
    let _ = stop_tx.send(true);

    for result in join_all(servers).await {
        match result {
            Ok(Ok(())) => {}
            Ok(Err(err)) => error!("replica server exited with error: {err:?}"),
            Err(err) => error!("replica server task failed: {err:?}"),
        }
    }
    Ok(())
}

fn build_coordinator(args: &ClusterArgs) -> Result<Coordinator> {
    let view = ClusterView::from_addrs(&args.replicas, args.connect_timeout())?;
    info!(replicas = view.len(), "cluster configured");
    Ok(Coordinator::with_config(view, args.coordinator_config()))
}

fn build_router(args: &ClusterArgs) -> Result<Arc<RequestRouter>> {
    let coordinator = build_coordinator(args)?;
    Ok(Arc::new(RequestRouter::new(Arc::new(coordinator))))
}

async fn run_client(args: ClientArgs) -> Result<()> {
    let request = args.request_line();
    let response = match args.transport {
        Transport::Tcp => client::send_tcp(args.server, &request).await?,
        Transport::Udp => client::send_udp(args.server, &request).await?,
    };
    println!("{response}");
    Ok(())
}
