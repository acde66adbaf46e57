//! Poll loop: the two sweeps that feed the dispatcher.
//!
//! - [`PollLoop::poll_until`] long-polls the registry for sessions with queued
//!   actions, pausing briefly after an empty reply. Any error escaping a
//!   sweep is logged and the whole sweep is retried after the cooldown,
//!   forever.
//! - [`PollLoop::refresh_active`] is the periodic sweep over running sessions:
//!   optional offload, then an `update_raw:from_server` visit.
//!
//! Sweeps are sequential inside and share no lock with each other; the
//! caller may run them concurrently.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::json;
use tracing::{debug, error, info, warn};

use crate::action::Action;
use crate::config::{DaemonConfig, PollConfig};
use crate::dispatcher::{Dispatcher, VisitReport};
use crate::error::{Result, SessionsError};
use crate::launcher::CommandLauncher;
use crate::offload::{default_mover, OffloadEngine};
use crate::paths::FolderLayout;
use crate::raw::EpuScanner;
use crate::registry::Registry;
use crate::types::Resources;
use crate::workspace::WorkspaceBuilder;

const REFRESH: [Action; 1] = [Action::UpdateRaw { from_server: true }];

/// Outcome of one refresh sweep.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepReport {
    pub visits: Vec<VisitReport>,
    pub offloaded: usize,
    pub offload_failures: usize,
}

#[derive(Clone)]
pub struct PollLoop {
    registry: Arc<dyn Registry>,
    dispatcher: Dispatcher,
    offload: Option<OffloadEngine>,
    config: PollConfig,
}

impl PollLoop {
    pub fn new(
        registry: Arc<dyn Registry>,
        dispatcher: Dispatcher,
        offload: Option<OffloadEngine>,
        config: PollConfig,
    ) -> Self {
        Self {
            registry,
            dispatcher,
            offload,
            config,
        }
    }

    /// Validate the folder layout, load reference data from the registry and
    /// wire up the production components.
    pub fn start(config: &DaemonConfig, registry: Arc<dyn Registry>) -> Result<Self> {
        let layout = FolderLayout::resolve(config.data_root()?)?;
        for (name, path) in layout.folders() {
            info!(folder = name, path = %path.display(), "data folder");
        }

        let sessions = registry.sessions(json!({}))?;
        info!(count = sessions.len(), "loaded sessions");
        let resources = Arc::new(Resources::new(registry.resources()?));
        info!(count = resources.len(), "loaded resources");
        let sessions_config = registry.sessions_config()?;
        debug!(
            instruments = sessions_config.acquisition.len(),
            gain = sessions_config.data.gain.is_some(),
            "loaded sessions config"
        );

        let builder = Arc::new(WorkspaceBuilder::new(
            registry.clone(),
            resources.clone(),
            layout.clone(),
        ));
        let launcher = Arc::new(CommandLauncher::new(registry.clone(), resources));
        let dispatcher = Dispatcher::new(
            registry.clone(),
            Arc::new(EpuScanner::default()),
            builder,
            launcher,
            config.otf.clone(),
        );
        let offload = config.offload.enabled.then(|| {
            OffloadEngine::new(
                registry.clone(),
                default_mover(),
                layout,
                config.offload.clone(),
            )
        });
        Ok(Self::new(registry, dispatcher, offload, config.poll.clone()))
    }

    pub fn config(&self) -> &PollConfig {
        &self.config
    }

    /// One pass over the sessions the registry reports as needing attention.
    pub fn poll_once(&self) -> Result<Vec<VisitReport>> {
        let sessions = self.registry.poll_active_sessions()?;
        debug!(count = sessions.len(), "polled active sessions");
        let mut reports = Vec::with_capacity(sessions.len());
        for mut session in sessions {
            let tokens = std::mem::take(&mut session.extra.actions);
            let actions = Action::decode_queue(&tokens[..]);
            reports.push(self.dispatcher.visit(session, &actions)?);
        }
        Ok(reports)
    }

    /// Run [`poll_once`](Self::poll_once) until `stop` is set.
    pub fn poll_until(&self, stop: &AtomicBool) {
        info!("poll loop started");
        while !stop.load(Ordering::SeqCst) {
            match self.poll_once() {
                Ok(reports) if reports.is_empty() => sleep_unless(stop, self.config.idle_pause()),
                Ok(_) => {}
                Err(e) => {
                    error!(error = %e, cooldown_secs = self.config.retry_cooldown_secs, "poll sweep failed, retrying");
                    sleep_unless(stop, self.config.retry_cooldown());
                }
            }
        }
        info!("poll loop stopped");
    }

    /// Periodic sweep over every running session.
    pub fn refresh_active(&self) -> Result<SweepReport> {
        let sessions = self.registry.active_sessions()?;
        debug!(count = sessions.len(), "refreshing active sessions");
        let mut report = SweepReport::default();
        for mut session in sessions {
            if let Some(engine) = &self.offload {
                match engine.offload(&mut session) {
                    Ok(r) => report.offloaded += r.moved,
                    Err(e @ SessionsError::RegistryUnavailable(_)) => return Err(e),
                    Err(e) => {
                        warn!(session_id = session.id, error = %e, "offload failed, retrying next cycle");
                        report.offload_failures += 1;
                    }
                }
            }
            report.visits.push(self.dispatcher.visit(session, &REFRESH)?);
        }
        Ok(report)
    }
}

fn sleep_unless(stop: &AtomicBool, total: Duration) {
    let deadline = Instant::now() + total;
    while !stop.load(Ordering::SeqCst) {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        std::thread::sleep((deadline - now).min(Duration::from_millis(200)));
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
