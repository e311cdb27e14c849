use anyhow::Result;
use scheduler_avatars::{
    app, config::AppConfig, db, services::avatar_service::AvatarService, state::AppState,
    storage,
};
use std::{io::ErrorKind, sync::Arc};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // --- Optional .env ---
    dotenvy::dotenv().ok();

    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + migrate flag ---
    let (cfg, migrate) = AppConfig::from_env_and_args()?;

    tracing::info!("Starting scheduler-avatars with config: {:?}", cfg);

    // --- Initialize SQLite connection ---
    let db = Arc::new(db::connect(&cfg.database_url, cfg.db_max_connections).await?);

    // --- Handle migration mode ---
    if migrate {
        db::migrate(&db).await?;
        tracing::info!("Database migration complete.");
        return Ok(()); // exit after migration
    }
    db::migrate(&db).await?;

    // --- Initialize object store + core service ---
    let handles = storage::from_config(&cfg.storage).await?;
    tracing::info!(
        backend = handles.store.backend_name(),
        bucket = handles.store.bucket(),
        "object store ready"
    );
    let state = AppState {
        db: db.clone(),
        avatars: AvatarService::new(db, handles.store, cfg.avatars.clone()),
        local: handles.local,
    };

    // --- Start server ---
    let addr = cfg.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", cfg.port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!("Server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app(state)).await?;

    Ok(())
}
