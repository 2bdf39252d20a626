use onlynow::{app, config::Config, db, rooms, AppState};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("onlynow=info,tower_http=info")),
        )
        .init();

    let config = Config::from_env()?;
    let db_pool = db::connect(&config.database_url).await?;

    let app_state = AppState::new(db_pool, config);
    let config = app_state.config.clone();

    rooms::spawn_reaper(app_state.rooms.clone(), app_state.hub.clone(), config.sweep_every);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    info!(addr = %config.bind_addr, relay = %config.relay, "only now is listening");
    axum::serve(listener, app(app_state)).await?;

    Ok(())
}
