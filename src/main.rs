use std::sync::Arc;

use codessa::api::server;
use codessa::config::{self, Settings};
use codessa::core_state::CoreState;
use codessa::db;
use codessa::pipeline::collaborators::Collaborators;
use codessa::webhooks::worker::{DeliveryWorker, HttpSender};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    codessa::init_tracing();
    tracing::info!("{} starting v{}", config::APP_NAME, config::APP_VERSION);

    let settings = Settings::from_env();

    std::fs::create_dir_all(config::app_data_dir())?;
    let conn = db::open_database(&config::database_path())?;

    let collaborators = Collaborators::from_settings(&settings);
    let core = Arc::new(CoreState::new(conn, collaborators));

    let sender = Arc::new(HttpSender::new()?);
    let worker = DeliveryWorker::new(core.clone(), sender).spawn();

    let result = server::serve(core, &settings.bind_addr).await;

    worker.stop().await;
    result?;
    Ok(())
}
