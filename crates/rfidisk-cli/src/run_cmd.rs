//! `rfidisk run`: wire the link, registry, supervisor and controller
//! together and run until interrupted.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use rfidisk_core::{
    DesktopNotifier, Display, LifecycleController, Notifier, NullNotifier, ProcessSupervisor,
    RunningLink, SerialLink, Supervisor, TagRegistry,
};

use crate::config::RfidiskConfig;

const WARNING: &str = "\
WARNING: rfidisk runs the command configured for each tag verbatim through
/bin/sh. Anyone who can edit the tag store can run commands as this user.
Use at your own risk.";

/// Run the daemon.
pub async fn run_daemon(config: RfidiskConfig) -> anyhow::Result<()> {
    eprintln!("{WARNING}\n");

    let registry = TagRegistry::open(&config.tags_path)
        .with_context(|| format!("failed to load tag store {}", config.tags_path.display()))?;
    info!(
        path = %config.tags_path.display(),
        tags = registry.len(),
        "tag store loaded"
    );
    let registry = Arc::new(registry);

    // Set up graceful shutdown: first signal cancels, second force-exits.
    let cancel = CancellationToken::new();
    let cancel_clone = cancel.clone();
    let got_first_signal = Arc::new(AtomicBool::new(false));
    let got_first_clone = Arc::clone(&got_first_signal);

    tokio::spawn(async move {
        loop {
            tokio::signal::ctrl_c().await.ok();
            if got_first_clone.swap(true, Ordering::SeqCst) {
                eprintln!("\nForce exit.");
                std::process::exit(130);
            }
            eprintln!("\nShutting down (Ctrl+C again to force)...");
            cancel_clone.cancel();
        }
    });

    let link = SerialLink::new(config.link.clone());
    let initial = match link.open().await {
        Ok(device) => Some(device),
        Err(e) => {
            warn!(
                device = %config.link.device_path.display(),
                error = %e,
                "reader not available yet, will keep retrying"
            );
            None
        }
    };
    let RunningLink {
        handle,
        events,
        task,
    } = link.start(initial, cancel.clone());

    let supervisor: Arc<dyn Supervisor> = Arc::new(ProcessSupervisor::new(config.supervisor.clone()));
    let notifier: Arc<dyn Notifier> = if config.desktop_notifications {
        Arc::new(DesktopNotifier::new(config.notification_icon.clone()))
    } else {
        Arc::new(NullNotifier)
    };

    let controller = LifecycleController::new(
        config.controller.clone(),
        registry,
        supervisor,
        notifier,
        Display::new(handle),
    );

    info!(
        device = %config.link.device_path.display(),
        removal_delay = ?config.controller.removal_delay,
        "rfidisk running"
    );
    let result = controller.run(events, cancel.clone()).await;

    cancel.cancel();
    if let Err(e) = task.await {
        warn!(error = %e, "link task did not shut down cleanly");
    }

    result?;
    info!("rfidisk stopped");
    Ok(())
}
