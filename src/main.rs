use anyhow::Result;
use clap::Parser;
use letterflow::dispatch::DispatchOptions;
use letterflow::engine::Engine;
use letterflow::transport::HttpMailTransport;
use letterflow::{config, db, directory::SqliteDirectory};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::info;

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let database_url = std::env::var("DATABASE_URL")
        .unwrap_or_else(|_| format!("sqlite://{}/letterflow.db", cfg.app.data_dir));

    let pool = db::init_pool(&database_url).await?;
    db::run_migrations(&pool).await?;

    let directory = Arc::new(SqliteDirectory::new(pool.clone()));
    let transport = Arc::new(HttpMailTransport::from_config(&cfg.transport)?);
    let (cancel_tx, cancel_rx) = watch::channel(false);

    let engine = Engine::new(
        pool,
        directory,
        transport,
        DispatchOptions::from_config(&cfg.app),
        cancel_rx,
    );

    let interval = Duration::from_millis(cfg.app.sweep_interval_ms);
    let loop_handle = tokio::spawn(async move { engine.run(interval).await });

    tokio::signal::ctrl_c().await?;
    info!("ctrl-c received; finishing current run before exit");
    let _ = cancel_tx.send(true);
    loop_handle.await?;

    Ok(())
}
