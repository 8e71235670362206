use anyhow::Context;
use plenary::config::get_settings;
use plenary::db::Database;
use plenary::engine::EngineContext;
use plenary::llm::select_provider;
use plenary::scripts::install_seed_data;
use plenary::server::build_router;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let settings = get_settings().clone();
    let db = Database::new(&settings.database_path)
        .with_context(|| format!("opening database at {}", settings.database_path))?;
    install_seed_data(&db).context("installing seed data")?;

    let llm = select_provider(&settings);
    tracing::info!(
        provider = llm.provider_name(),
        model = llm.model_name(),
        env = settings.env,
        "llm provider selected"
    );

    let bind_addr = settings.bind_addr.clone();
    let ctx = Arc::new(EngineContext { db: Arc::new(db), llm, settings });
    let router = build_router(ctx);

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("binding {}", bind_addr))?;
    tracing::info!("listening on {}", bind_addr);
    axum::serve(listener, router).await.context("serving")?;
    Ok(())
}
