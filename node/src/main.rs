use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use weft_node::server;
use weft_protocol::{MeshConfig, MeshNode};

#[derive(Parser)]
#[command(name = "weft-node", about = "Weft decentralized container mesh node")]
struct Cli {
    /// Service name to advertise (e.g. "python", "go")
    #[arg(env = "SERVICE_NAME")]
    service_name: String,

    /// Mesh port (defaults to the service's well-known port)
    #[arg(env = "MESH_PORT")]
    port: Option<u16>,

    /// Comma-separated capability tags (e.g. "python,ai")
    #[arg(value_delimiter = ',')]
    capabilities: Vec<String>,

    /// Address other nodes can reach us at
    #[arg(long, default_value = "localhost", env = "MESH_HOST")]
    host: String,

    /// Stable node id (defaults to a random UUID)
    #[arg(long, env = "CONTAINER_ID")]
    node_id: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let mut config = MeshConfig::for_service(&cli.service_name);
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(node_id) = cli.node_id {
        config.node_id = node_id;
    }
    config.host = cli.host;
    config.capabilities = cli.capabilities;

    tracing::info!(
        node = %config.node_id,
        service = %config.service_name,
        port = config.port,
        capabilities = ?config.capabilities,
        "Starting weft node"
    );

    let node = MeshNode::new(config);
    node.start().await;

    let app = server::create_router(node.clone());
    let addr = format!("0.0.0.0:{}", node.config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Mesh endpoint listening on {addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    node.shutdown().await;
    tracing::info!("Node shut down");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.ok();
    };
    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();
    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT"),
        _ = terminate => tracing::info!("Received SIGTERM"),
    }
}
