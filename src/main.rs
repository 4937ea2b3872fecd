use env_logger::Env;
use jobhub::{build_hub, builtin_workflows, AppConfig, AppError};
use log::{error, info};
use tokio::sync::watch;

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
    if let Err(e) = run().await {
        error!("worker:fatal error={e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), AppError> {
    let cfg = AppConfig::from_env()?;
    let hub = build_hub(&cfg, builtin_workflows()?)?;

    let schedules = hub.triggers.bootstrap().await?;
    info!("worker:bootstrap schedules={}", schedules.len());
    let guard = hub.triggers.clone().spawn_resume_guard();

    let worker = hub.worker(cfg.worker.clone());
    let (shutdown, rx) = watch::channel(false);
    let running = tokio::spawn(worker.run(rx));

    tokio::signal::ctrl_c().await?;
    info!("worker:shutdown requested, draining in-flight deliveries");
    // Sin receptores sólo si el worker ya terminó.
    let _ = shutdown.send(true);
    if let Err(e) = running.await {
        error!("worker:join error={e}");
    }
    guard.abort();
    Ok(())
}
