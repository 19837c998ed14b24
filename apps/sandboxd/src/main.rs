mod docs;
mod error;
mod routes;

use std::sync::Arc;

use sandbox_core::config::Config;
use sandbox_core::host_actions::SystemHostActions;
use sandbox_core::store::Store;
use sandbox_core::Orchestrator;
use sqlx::PgPool;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;
use tracing_subscriber::EnvFilter;
use utoipa::OpenApi as _;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("warn,sandboxd=info,sandbox_core=info")
            .add_directive("hyper_util=warn".parse().unwrap())
            .add_directive("sqlx=warn".parse().unwrap())
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = Config::from_env();
    let db = PgPool::connect(&config.database_url).await?;
    sqlx::migrate!("./migrations").run(&db).await?;

    let store = Store::new(db);
    let host = Arc::new(SystemHostActions);
    let bind = config.bind.clone();
    let orchestrator = Arc::new(Orchestrator::new(config, store, host)?);

    // Invariant 6: normalize any transient state left by a prior crash, and
    // seed the IP/CID allocators above whatever the store has observed.
    orchestrator.bootstrap().await?;
    info!("orchestrator bootstrapped");

    let state = routes::AppState { orchestrator };

    let openapi = docs::ApiDoc::openapi();
    let app = routes::router(state)
        .merge(docs::router(openapi))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
                .max_age(std::time::Duration::from_secs(3600)),
        );

    info!(%bind, "sandboxd listening");
    let listener = tokio::net::TcpListener::bind(&bind).await?;
    axum::serve(listener, app.into_make_service()).await?;
    Ok(())
}
