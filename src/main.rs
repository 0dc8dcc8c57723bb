//! toolgate - main entry point.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use toolgate::catalog::{CatalogStore, ToolQuery};
use toolgate::config::{GatewayConfig, default_config_path};
use toolgate::gateway::ToolGateway;
use toolgate::proxy::{ServerRefresher, ToolProxy};
use toolgate::server::GatewayServer;
use toolgate::sync::SyncService;
use toolgate::upstream::{ToolSource, UpstreamInvoker, UpstreamManager};

#[derive(Parser)]
#[command(name = "toolgate", version, about = "Code-mode gateway for MCP tool servers")]
struct Cli {
    /// Path to the gateway configuration file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the gateway on stdio (default).
    Serve,
    /// Sync all enabled servers once and print the summaries.
    Sync,
    /// List catalog tools.
    Tools {
        /// Substring filter.
        #[arg(long)]
        query: Option<String>,
        /// Restrict to one server id.
        #[arg(long)]
        server: Option<String>,
    },
}

/// Everything wired together; dropped in shutdown order.
struct App {
    catalog: Arc<CatalogStore>,
    manager: Arc<UpstreamManager>,
    sync: Arc<SyncService>,
    gateway: Arc<ToolGateway>,
}

impl App {
    async fn build(config: &GatewayConfig) -> anyhow::Result<Self> {
        let catalog = Arc::new(CatalogStore::open(&config.db_path).await?);
        catalog.upsert_servers(&config.servers).await?;

        let manager = Arc::new(UpstreamManager::new(
            config.servers.clone(),
            config.retry.clone(),
        ));
        let sync = Arc::new(SyncService::new(
            Arc::clone(&manager) as Arc<dyn ToolSource>,
            Arc::clone(&catalog),
            config.snapshot_dir.clone(),
        )?);
        let proxy = Arc::new(
            ToolProxy::new(
                Arc::clone(&catalog),
                Arc::clone(&manager) as Arc<dyn UpstreamInvoker>,
                &config.servers,
            )
            .with_refresher(Arc::clone(&sync) as Arc<dyn ServerRefresher>),
        );
        let gateway = Arc::new(ToolGateway::new(
            Arc::clone(&catalog),
            proxy,
            &config.sandbox,
        ));

        Ok(Self {
            catalog,
            manager,
            sync,
            gateway,
        })
    }

    /// Ordered shutdown: upstream transports first, then the catalog
    /// handle, exactly once. Errors are logged, never propagated.
    async fn shutdown(self) {
        let App {
            catalog,
            manager,
            sync,
            gateway,
        } = self;
        manager.close_all().await;
        drop(gateway);
        drop(sync);
        drop(manager);
        match Arc::try_unwrap(catalog) {
            Ok(store) => store.close(),
            Err(_) => tracing::warn!("catalog handle still shared at shutdown"),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let _ = dotenvy::dotenv();

    // stdout is the JSON-RPC wire; all diagnostics go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config_path = cli.config.clone().unwrap_or_else(default_config_path);
    let config = GatewayConfig::load_from(&config_path).await?;
    tracing::info!(
        config = %config_path.display(),
        servers = config.servers.len(),
        "configuration loaded"
    );

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config).await,
        Command::Sync => sync_once(config).await,
        Command::Tools { query, server } => list_tools(config, query, server).await,
    }
}

async fn serve(config: GatewayConfig) -> anyhow::Result<()> {
    let app = App::build(&config).await?;

    // Prime the catalog before accepting traffic; a failing upstream only
    // costs its own summary.
    for summary in app.sync.sync_all_servers().await {
        if let Some(error) = &summary.error {
            tracing::warn!(server_id = %summary.server_id, error = %error, "initial sync failed");
        }
    }

    let scheduler = config
        .sync_interval_secs
        .map(|secs| app.sync.start_interval_sync(secs));

    let server = GatewayServer::new(Arc::clone(&app.gateway));
    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                tracing::error!(error = %e, "server loop failed");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupt received, shutting down");
        }
    }

    if let Some(scheduler) = scheduler {
        scheduler.abort();
    }
    drop(server);
    app.shutdown().await;
    Ok(())
}

async fn sync_once(config: GatewayConfig) -> anyhow::Result<()> {
    let app = App::build(&config).await?;
    let summaries = app.sync.sync_all_servers().await;
    println!("{}", serde_json::to_string_pretty(&summaries)?);
    app.shutdown().await;
    Ok(())
}

async fn list_tools(
    config: GatewayConfig,
    query: Option<String>,
    server: Option<String>,
) -> anyhow::Result<()> {
    let catalog = Arc::new(CatalogStore::open(&config.db_path).await?);
    let tools = catalog
        .search_tools(&ToolQuery {
            query,
            server_id: server,
            limit: Some(100),
        })
        .await?;

    if tools.is_empty() {
        println!("no tools in catalog (run `toolgate sync` first)");
    }
    for tool in tools {
        let description = tool.description.as_deref().unwrap_or("");
        println!("{}/{} {}", tool.server_id, tool.tool_name, description);
    }

    if let Ok(store) = Arc::try_unwrap(catalog) {
        store.close();
    }
    Ok(())
}
