use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};

use herald::{config::Config, storage::Store, AppContext};

#[derive(Parser)]
#[command(
    name = "herald",
    about = "MCP server that dispatches coding-agent tasks against configured projects",
    version
)]
struct Args {
    /// Path to the YAML configuration file
    #[arg(long, default_value = "herald.yaml", env = "HERALD_CONFIG")]
    config: PathBuf,

    /// Log filter (trace, debug, info, warn, error); overrides the config
    #[arg(long, env = "HERALD_LOG")]
    log: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = Config::load(&args.config)?;
    let log_filter = args
        .log
        .clone()
        .unwrap_or_else(|| config.server.log_level.clone());
    tracing_subscriber::fmt()
        .with_env_filter(log_filter)
        .compact()
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %args.config.display(),
        "herald starting"
    );

    let projects = herald::project::ProjectManager::new(&config.projects);
    projects.validate()?;
    if config.projects.is_empty() {
        warn!("no projects configured; start_task will have nothing to target");
    }

    let work_dir = config.work_dir();
    let store = Arc::new(Store::open(&work_dir).await?);
    info!(work_dir = %work_dir.display(), "storage ready");

    let ctx = AppContext::build(config, Some(store)).await?;

    // Hourly sweep of expired authorization codes and dead tokens.
    {
        let oauth = ctx.oauth.clone();
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(std::time::Duration::from_secs(60 * 60));
            interval.tick().await;
            loop {
                interval.tick().await;
                oauth.cleanup().await;
            }
        });
    }

    herald::mcp::serve(ctx).await
}
