//! Secondary entrypoint (spec §6 "Exit codes & CLI"): boots the template
//! VM, snapshots it, writes metadata, and exits. Non-zero exit on failure,
//! same shape as a standalone installer binary crate.

use std::process::ExitCode;
use std::sync::Arc;

use sandbox_core::config::Config;
use sandbox_core::host_actions::SystemHostActions;
use sandbox_core::store::Store;
use sandbox_core::Orchestrator;
use sqlx::PgPool;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,sandbox_core=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match run().await {
        Ok(snapshot_id) => {
            info!(snapshot_id = %snapshot_id, "template snapshot build complete");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "template snapshot build failed");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> anyhow::Result<String> {
    let config = Config::from_env();
    let db = PgPool::connect(&config.database_url).await?;
    sqlx::migrate!("./migrations").run(&db).await?;

    let store = Store::new(db);
    let host = Arc::new(SystemHostActions);
    let orchestrator = Orchestrator::new(config, store, host)?;
    orchestrator.bootstrap().await?;

    let meta = orchestrator.build_template_snapshot().await?;
    Ok(meta.id)
}
