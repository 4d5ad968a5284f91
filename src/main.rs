use anyhow::{Context, Result};
use tracing::{info, warn};

use dynasess_core::config;
use dynasess_core::{SessionHandler, SessionRuntime};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("dynasess=info".parse()?)
                .add_directive("dynasess_core=info".parse()?),
        )
        .with_ansi(false)
        .init();

    info!("dynasess sweeper {} starting...", dynasess_core::VERSION);

    let mut cfg = config::load_config_from_env().context("loading session store config")?;
    let once = std::env::var("GC_ONCE").is_ok_and(|v| v == "1" || v.eq_ignore_ascii_case("true"));

    // One-shot runs sweep inline; the daemon lets the runtime own the schedule.
    cfg.gc.enabled = !once;

    let runtime = SessionRuntime::connect(cfg)
        .await
        .context("connecting to sessions table")?;

    if once {
        let handler = runtime.handler();
        let report = handler
            .garbage_collect(runtime.store().client().now())
            .await;
        runtime.shutdown().await;
        if let Some(reason) = report.aborted {
            anyhow::bail!("sweep aborted: {reason}");
        }
        if report.failed > 0 {
            warn!("{} expired sessions could not be deleted", report.failed);
        }
        return Ok(());
    }

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("Shutdown signal received");
    runtime.shutdown().await;

    Ok(())
}
