use anyhow::{Context, Result};
use sessions_core::config::DaemonConfig;
use sessions_core::poller::PollLoop;
use sessions_core::registry::HttpRegistry;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{error, info};

pub fn run(config: &DaemonConfig) -> Result<()> {
    // The blocking client must be built outside the runtime.
    let registry = Arc::new(HttpRegistry::new(&config.registry)?);
    info!(url = %registry.base_url(), "using registry");
    let poll = PollLoop::start(config, registry).context("startup failed")?;
    let stop = Arc::new(AtomicBool::new(false));

    let every = poll.config().refresh_interval().max(Duration::from_secs(1));

    // `poll` must outlive the runtime: the blocking client cannot be dropped
    // on an async worker.
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on({
        let poll = poll.clone();
        let stop = stop.clone();
        async move {
            {
                let poll = poll.clone();
                let stop = stop.clone();
                tokio::task::spawn_blocking(move || poll.poll_until(&stop));
            }

            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let poll = poll.clone();
                        // Not awaited: a slow sweep may overlap the next one.
                        tokio::task::spawn_blocking(move || match poll.refresh_active() {
                            Ok(report) => info!(
                                sessions = report.visits.len(),
                                offloaded = report.offloaded,
                                "refresh sweep done"
                            ),
                            Err(e) => error!(error = %e, "refresh sweep failed"),
                        });
                    }
                    signal = tokio::signal::ctrl_c() => {
                        signal.context("failed to listen for ctrl-c")?;
                        info!("shutting down");
                        break;
                    }
                }
            }
            stop.store(true, Ordering::SeqCst);
            anyhow::Ok(())
        }
    })?;

    // In-flight offloads and builds are not cancelled; give them a moment.
    rt.shutdown_timeout(Duration::from_secs(5));
    drop(poll);
    Ok(())
}
