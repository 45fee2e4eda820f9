mod arm;
mod auth;
mod builder;
mod config;
mod error;
mod executor;
mod http;
mod lro;
mod observe;
mod server;
mod status;

use rmcp::transport::stdio;
use rmcp::ServiceExt;
use server::AzureVmMcpServer;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // A local .env seeds the environment; real variables win.
    dotenv::dotenv().ok();

    // Write structured logs to stderr so stdout stays clean for MCP JSON-RPC.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_env("RUST_LOG")
                .add_directive("azure_vm_mcp_server=info".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    tracing::info!("Starting azure-vm-mcp-server v{}", env!("CARGO_PKG_VERSION"));

    let config = config::Config::from_env()?;
    let server = AzureVmMcpServer::new(config)?;

    let transport = stdio();

    tracing::info!("MCP server listening on stdio");

    let running = server.serve(transport).await?;
    running.waiting().await?;

    Ok(())
}
