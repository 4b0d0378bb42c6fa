//! Reference Keel application: users and posts behind a JSON API.

mod controllers;
mod migrations;
mod models;
mod providers;

use anyhow::Context;
use keel_core::{logging, AppConfig, Application, DatabasePool, TimingMiddleware};
use providers::{DatabaseServiceProvider, RouteServiceProvider};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // A missing .env file is fine; the environment may be set directly
    dotenv::dotenv().ok();

    let config = AppConfig::from_env().context("invalid configuration")?;
    logging::init(config.log_format);

    let pool = DatabasePool::connect(&config.db_url, Some(config.db_max_connections))
        .await
        .context("failed to connect to the database")?;
    migrations::run(&pool).await.context("migrations failed")?;

    tracing::info!(app = %config.name, env = %config.env, "Starting application");

    let mut app = Application::new(config);
    app.middleware(TimingMiddleware::new());
    app.register(DatabaseServiceProvider::new(pool))
        .register(RouteServiceProvider);

    app.serve().await?;
    tracing::info!("Server stopped");
    Ok(())
}
