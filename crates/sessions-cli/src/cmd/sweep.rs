use crate::output::{print_json, print_table};
use anyhow::{Context, Result};
use sessions_core::config::DaemonConfig;
use sessions_core::dispatcher::{ActionOutcome, LaunchOutcome, VisitReport};
use sessions_core::poller::PollLoop;
use sessions_core::registry::HttpRegistry;
use std::sync::Arc;

pub fn run(config: &DaemonConfig, json: bool) -> Result<()> {
    let registry = Arc::new(HttpRegistry::new(&config.registry)?);
    let poll = PollLoop::start(config, registry).context("startup failed")?;
    let report = poll.refresh_active().context("refresh sweep failed")?;

    if json {
        return print_json(&report);
    }

    let rows = report.visits.iter().map(visit_row).collect();
    print_table(&["SESSION", "ACTIONS", "PUSHED", "LAUNCH"], rows);
    println!(
        "\n{} sessions, {} files offloaded, {} offload failures",
        report.visits.len(),
        report.offloaded,
        report.offload_failures
    );
    Ok(())
}

fn visit_row(visit: &VisitReport) -> Vec<String> {
    let actions = visit
        .actions
        .iter()
        .map(|a| {
            let outcome = match &a.outcome {
                ActionOutcome::Applied => "applied",
                ActionOutcome::Unchanged => "unchanged",
                ActionOutcome::Skipped => "skipped",
                ActionOutcome::Failed { .. } => "failed",
            };
            format!("{}={outcome}", a.action)
        })
        .collect::<Vec<_>>()
        .join(",");
    let launch = match &visit.launch {
        LaunchOutcome::NotRequested => "-".to_string(),
        LaunchOutcome::Started => "started".to_string(),
        LaunchOutcome::Failed { reason } => format!("failed: {reason}"),
    };
    vec![
        visit.session_id.to_string(),
        actions,
        if visit.pushed { "yes" } else { "no" }.to_string(),
        launch,
    ]
}
