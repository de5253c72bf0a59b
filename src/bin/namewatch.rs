//! namewatch: daemon that watches chat group members for profile changes.
//!
//! Runs the scan scheduler, the notification dispatch loop and the admin
//! HTTP surface until Ctrl-C.

use std::sync::Arc;

use anyhow::Context as _;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use namewatch::config::{Cli, Config};
use namewatch::context::WatchContext;
use namewatch::platform::http::HttpPlatformClient;
use namewatch::platform::MembershipClient;
use namewatch::storage::Storage;
use namewatch::{admin, logging};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Config::from_cli_and_env(cli).context("invalid configuration")?;

    logging::init();
    info!("namewatch starting");
    info!(db = %config.db_path.display(), "  database");
    info!(bridge = %config.platform_url, "  platform bridge");

    let storage = Storage::open(&config.db_path)
        .with_context(|| format!("failed to open {}", config.db_path.display()))?
        .into_shared();
    let client: Arc<dyn MembershipClient> = Arc::new(HttpPlatformClient::new(
        config.platform_url.clone(),
        config.platform_token.clone(),
    ));

    let shutdown = CancellationToken::new();
    let ctx = WatchContext::build(storage, client, config.settings.clone(), shutdown.clone())
        .await
        .context("failed to initialise core")?;

    for seed in &config.groups {
        if let Err(e) = ctx.register_group(seed.group_id, &seed.title).await {
            warn!(group = %logging::group(seed.group_id), error = %e, "failed to register configured group");
        }
    }

    let notifier_task = tokio::spawn(ctx.notifier.clone().run(shutdown.clone()));
    ctx.announce_startup().await;
    let scheduler_task = tokio::spawn(ctx.scheduler.clone().run());

    let admin_ctx = ctx.clone();
    let bind_addr = config.bind_addr.clone();
    let admin_task = tokio::spawn(async move {
        if let Err(e) = admin::serve(admin_ctx, &bind_addr).await {
            error!(addr = %bind_addr, error = %e, "admin server failed");
        }
    });

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutdown requested");
    shutdown.cancel();

    // The scheduler finishes any in-flight scan, the notifier finishes any
    // in-flight send; everything still queued stays in the outbox.
    for (name, task) in [
        ("scheduler", scheduler_task),
        ("notifier", notifier_task),
        ("admin", admin_task),
    ] {
        if let Err(e) = task.await {
            error!(task = name, error = %e, "task ended abnormally");
        }
    }
    info!("namewatch stopped");
    Ok(())
}
