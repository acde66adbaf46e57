//! Session action dispatcher.
//!
//! One visit consumes a session's whole action queue. Each action may change
//! the in-memory session and mark it dirty; a failing action is logged and the
//! rest of the queue still runs. After the queue:
//!
//! 1. a dirty session gets its queue cleared, an update stamp, and is pushed
//!    back whole to the registry;
//! 2. if any action asked for it, the OTF launcher runs, after the push, so
//!    the registry already shows `launched` when processing starts.
//!
//! Actions are consumed at most once per visit regardless of their outcome.
//! Nothing is persisted locally: the next visit starts from whatever the
//! registry and the filesystem say.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use chrono::Local;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::action::Action;
use crate::config::OtfConfig;
use crate::error::Result;
use crate::io::last_modified;
use crate::launcher::OtfLauncher;
use crate::offload::offload_destination;
use crate::paths::{workspace_epu_dir, workspace_movies_star};
use crate::raw::{ParseOptions, RawParser};
use crate::registry::Registry;
use crate::types::{parse_stamp, OtfStatus, Session, SessionStatus};
use crate::workspace::WorkspaceBuilder;

// ---------------------------------------------------------------------------
// Visit results
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActionOutcome {
    /// The action changed the session.
    Applied,
    /// The action ran but found nothing to change.
    Unchanged,
    /// The session has no raw folder; nothing was attempted.
    Skipped,
    Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActionReport {
    pub action: Action,
    pub outcome: ActionOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LaunchOutcome {
    NotRequested,
    Started,
    Failed { reason: String },
}

/// What one visit did to one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VisitReport {
    pub session_id: i64,
    pub actions: Vec<ActionReport>,
    pub pushed: bool,
    pub launch: LaunchOutcome,
}

impl VisitReport {
    pub fn failures(&self) -> usize {
        self.actions
            .iter()
            .filter(|a| matches!(a.outcome, ActionOutcome::Failed { .. }))
            .count()
    }
}

#[derive(Debug, Default)]
struct VisitState {
    dirty: bool,
    launch: bool,
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<dyn Registry>,
    parser: Arc<dyn RawParser>,
    builder: Arc<WorkspaceBuilder>,
    launcher: Arc<dyn OtfLauncher>,
    otf: OtfConfig,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<dyn Registry>,
        parser: Arc<dyn RawParser>,
        builder: Arc<WorkspaceBuilder>,
        launcher: Arc<dyn OtfLauncher>,
        otf: OtfConfig,
    ) -> Self {
        Self {
            registry,
            parser,
            builder,
            launcher,
            otf,
        }
    }

    /// Run `actions` against `session`.
    ///
    /// Only a failed registry push escapes as an error; per-action failures
    /// and launch failures are reported in the returned [`VisitReport`].
    pub fn visit(&self, mut session: Session, actions: &[Action]) -> Result<VisitReport> {
        let mut report = VisitReport {
            session_id: session.id,
            actions: Vec::with_capacity(actions.len()),
            pushed: false,
            launch: LaunchOutcome::NotRequested,
        };
        info!(session_id = session.id, name = %session.name, actions = actions.len(), "visiting session");

        if session.raw_path().is_none() {
            debug!(session_id = session.id, "no raw path recorded, skipping actions");
            report.actions = actions
                .iter()
                .map(|&action| ActionReport {
                    action,
                    outcome: ActionOutcome::Skipped,
                })
                .collect();
            return Ok(report);
        }

        let mut state = VisitState::default();
        for &action in actions {
            debug!(session_id = session.id, %action, "handling action");
            let outcome = match self.apply(&mut session, action, &mut state) {
                Ok(true) => ActionOutcome::Applied,
                Ok(false) => ActionOutcome::Unchanged,
                Err(e) => {
                    error!(session_id = session.id, %action, error = %e, "action failed");
                    ActionOutcome::Failed {
                        reason: e.to_string(),
                    }
                }
            };
            report.actions.push(ActionReport { action, outcome });
        }

        if state.dirty {
            info!(session_id = session.id, name = %session.name, "updating session");
            session.extra.actions.clear();
            session.touch();
            self.registry.update_session(&session)?;
            report.pushed = true;
        } else {
            debug!(session_id = session.id, "no changes for this session, not updating");
        }

        if state.launch {
            report.launch = match self.launcher.launch(&session) {
                Ok(()) => LaunchOutcome::Started,
                Err(e) => {
                    error!(session_id = session.id, error = %e, "OTF launch failed");
                    LaunchOutcome::Failed {
                        reason: e.to_string(),
                    }
                }
            };
        }
        Ok(report)
    }

    fn apply(&self, session: &mut Session, action: Action, state: &mut VisitState) -> Result<bool> {
        match action {
            Action::UpdateRaw { from_server } => self.update_raw(session, from_server, state),
            Action::CreateOtf => {
                self.builder.build(session)?;
                state.dirty = true;
                Ok(true)
            }
            Action::LaunchOtf => {
                if let Some(otf) = session.extra.otf.as_mut() {
                    otf.status = Some(OtfStatus::Launched);
                }
                state.dirty = true;
                state.launch = true;
                Ok(true)
            }
        }
    }

    fn update_raw(&self, session: &mut Session, from_server: bool, state: &mut VisitState) -> Result<bool> {
        let Some(raw_path) = session.raw_path() else {
            return Ok(false);
        };
        let previous = session.extra.raw.clone().unwrap_or_default();
        let last_movie = previous.last_movie.clone().unwrap_or_default();
        let workspace: Option<PathBuf> = session
            .extra
            .otf
            .as_ref()
            .filter(|o| o.exists())
            .and_then(|o| o.path())
            .map(Path::to_path_buf);

        let mut opts = ParseOptions {
            last_movie: Some(last_movie.clone()).filter(|m| !m.is_empty()),
            offload_folder: Some(offload_destination(session, self.builder.layout(), &raw_path)),
            ..ParseOptions::default()
        };
        if let Some(ws) = &workspace {
            opts.output_star = Some(workspace_movies_star(ws));
            opts.backup_folder = Some(workspace_epu_dir(ws));
        }

        let mut parsed = self.parser.parse(&raw_path, &opts)?;
        if parsed.last_movie.is_none() && !last_movie.is_empty() {
            // The newest movie never goes backwards.
            warn!(session_id = session.id, last_movie = %last_movie, "rescan found no movies, keeping last known");
            parsed.last_movie = previous.last_movie.clone();
            parsed.last_movie_creation = previous.last_movie_creation.clone();
            parsed.movies = parsed.movies.max(previous.movies);
        }
        let movies = parsed.movies;
        let mut changed = false;

        if parsed.last_movie.as_deref().unwrap_or_default() != last_movie {
            parsed.path = Some(raw_path.display().to_string());
            if parsed.files.is_empty() {
                parsed.files = previous.files;
            }
            debug!(session_id = session.id, last_movie = ?parsed.last_movie, movies, "new raw data");
            session.extra.raw = Some(parsed);
            changed = true;
        } else if let Some(created) = parsed.last_movie_creation.as_deref().and_then(parse_stamp) {
            let quiet_for = Local::now().naive_local() - created;
            debug!(session_id = session.id, last_movie = %last_movie, %created, "raw data unchanged");
            if quiet_for >= self.otf.stale_after() && !self.otf_active(session) {
                info!(session_id = session.id, "raw data quiet, marking session finished");
                session.status = SessionStatus::Finished;
                if let Some(otf) = session.extra.otf.as_mut() {
                    otf.status = Some(OtfStatus::Finished);
                }
                changed = true;
            }
        }

        state.dirty |= changed;
        if !from_server {
            state.dirty = true;
        }

        if workspace.is_some() && session.otf_status() == Some(&OtfStatus::Created) {
            if movies > self.otf.launch_min_movies {
                info!(session_id = session.id, movies, "OTF workspace created, launching");
                if let Some(otf) = session.extra.otf.as_mut() {
                    otf.status = Some(OtfStatus::Launched);
                }
                state.dirty = true;
                state.launch = true;
                changed = true;
            } else {
                info!(session_id = session.id, movies, "OTF workspace created, waiting for more movies");
            }
        }
        Ok(changed)
    }

    /// Whether OTF processing may still be running for this session.
    ///
    /// In-progress status alone is enough when the workspace folder is gone;
    /// otherwise the newest file in the workspace must be recent.
    pub fn otf_active(&self, session: &Session) -> bool {
        let Some(otf) = session.extra.otf.as_ref() else {
            return false;
        };
        if !otf.status.as_ref().is_some_and(OtfStatus::is_in_progress) {
            return false;
        }
        let path = match otf.path() {
            Some(path) if otf.exists() => path,
            _ => return true,
        };
        match last_modified(path) {
            Ok((file, modified)) => {
                let age = SystemTime::now()
                    .duration_since(modified)
                    .unwrap_or_default();
                debug!(session_id = session.id, last = %file.display(), age_secs = age.as_secs(), "OTF workspace activity");
                let stale = self.otf.stale_after().to_std().unwrap_or_default();
                age < stale
            }
            Err(e) => {
                warn!(session_id = session.id, error = %e, "cannot inspect OTF workspace, assuming active");
                true
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{age_file, make_layout, raw_session, CannedParser, MemoryRegistry, RecordingLauncher};
    use crate::types::{format_stamp, OtfRecord, RawInfo, Resource, Resources};
    use serde_json::json;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    const DAY: i64 = 24 * 3600;

    struct Fixture {
        dir: TempDir,
        layout: crate::paths::FolderLayout,
        registry: Arc<MemoryRegistry>,
        launcher: Arc<RecordingLauncher>,
        parser: Arc<CannedParser>,
        dispatcher: Dispatcher,
    }

    fn fixture_with(parser: CannedParser, launcher: RecordingLauncher) -> Fixture {
        let dir = TempDir::new().unwrap();
        let layout = make_layout(dir.path());
        let registry = Arc::new(
            MemoryRegistry::default()
                .with_resource(1, "Krios")
                .with_config(json!({"acquisition": {"Krios": {"voltage": 300}}})),
        );
        let mut map = BTreeMap::new();
        map.insert(1, Resource { id: 1, name: "Krios".into() });
        let builder = Arc::new(WorkspaceBuilder::new(
            registry.clone(),
            Arc::new(Resources::new(map)),
            layout.clone(),
        ));
        let parser = Arc::new(parser);
        let launcher = Arc::new(launcher);
        let dispatcher = Dispatcher::new(
            registry.clone(),
            parser.clone(),
            builder,
            launcher.clone(),
            OtfConfig::default(),
        );
        Fixture {
            dir,
            layout,
            registry,
            launcher,
            parser,
            dispatcher,
        }
    }

    fn fixture(parser: CannedParser) -> Fixture {
        fixture_with(parser, RecordingLauncher::default())
    }

    fn parsed(last_movie: &str, movies: u64, age_secs: i64) -> RawInfo {
        let created = Local::now() - chrono::Duration::seconds(age_secs);
        RawInfo {
            last_movie: Some(last_movie.into()),
            last_movie_creation: Some(format_stamp(created)),
            movies,
            ..RawInfo::default()
        }
    }

    /// Session with an existing raw folder that already knows `last_movie`.
    fn known_session(fx: &Fixture, id: i64, last_movie: &str) -> Session {
        let raw = fx.layout.raw().join(format!("grid-{id}"));
        std::fs::create_dir_all(&raw).unwrap();
        let mut session = raw_session(id, &raw);
        session.extra.raw.as_mut().unwrap().last_movie = Some(last_movie.into());
        session
    }

    fn with_workspace(fx: &Fixture, session: &mut Session, status: OtfStatus, age_secs: i64) -> PathBuf {
        let ws = fx.layout.otf().join(format!("ws-{}", session.id));
        std::fs::create_dir_all(&ws).unwrap();
        let log = ws.join("pipeline.log");
        std::fs::write(&log, b"running").unwrap();
        age_file(&log, age_secs);
        age_file(&ws, age_secs);
        session.extra.otf = Some(OtfRecord {
            status: Some(status),
            ..OtfRecord::created(&ws)
        });
        ws
    }

    const REFRESH: Action = Action::UpdateRaw { from_server: true };
    const UPDATE: Action = Action::UpdateRaw { from_server: false };

    #[test]
    fn new_raw_data_is_adopted_and_pushed() {
        let fx = fixture(CannedParser::new(parsed("mic_005", 5, 60)));
        let raw = fx.layout.raw().join("grid-1");
        std::fs::create_dir_all(&raw).unwrap();
        let mut session = raw_session(1, &raw);
        session.extra.actions = vec!["update_raw".into()];

        let report = fx.dispatcher.visit(session, &[UPDATE]).unwrap();

        assert!(report.pushed);
        assert_eq!(report.actions[0].outcome, ActionOutcome::Applied);
        assert_eq!(report.launch, LaunchOutcome::NotRequested);
        let pushes = fx.registry.pushes();
        assert_eq!(pushes.len(), 1);
        let pushed = &pushes[0];
        let raw_info = pushed.extra.raw.as_ref().unwrap();
        assert_eq!(raw_info.last_movie.as_deref(), Some("mic_005"));
        assert_eq!(raw_info.movies, 5);
        assert_eq!(raw_info.path.as_deref(), Some(raw.to_str().unwrap()));
        assert!(pushed.extra.actions.is_empty());
        assert!(pushed.extra.updated.is_some());
        assert!(pushed.extra.otf.is_none());
        assert_eq!(pushed.status, SessionStatus::Running);
        assert!(fx.launcher.launched().is_empty());
    }

    #[test]
    fn offloaded_files_survive_raw_refresh() {
        let fx = fixture(CannedParser::new(parsed("mic_009", 9, 60)));
        let mut session = known_session(&fx, 2, "mic_008");
        session.extra.raw.as_mut().unwrap().files.insert(
            "/data/EPU/grid-2/mic_001.tiff".into(),
            crate::types::FileStat { size: 10, mtime: 1.0 },
        );

        fx.dispatcher.visit(session, &[REFRESH]).unwrap();
        let pushed = &fx.registry.pushes()[0];
        assert_eq!(pushed.extra.raw.as_ref().unwrap().files.len(), 1);
    }

    #[test]
    fn refresh_without_changes_does_not_push() {
        let fx = fixture(CannedParser::new(parsed("mic_010", 10, 600)));
        let session = known_session(&fx, 3, "mic_010");

        let report = fx.dispatcher.visit(session, &[REFRESH]).unwrap();
        assert!(!report.pushed);
        assert_eq!(report.actions[0].outcome, ActionOutcome::Unchanged);
        assert!(fx.registry.pushes().is_empty());
    }

    #[test]
    fn explicit_update_always_pushes() {
        let fx = fixture(CannedParser::new(parsed("mic_010", 10, 600)));
        let session = known_session(&fx, 4, "mic_010");

        let report = fx.dispatcher.visit(session, &[UPDATE]).unwrap();
        assert!(report.pushed);
        assert_eq!(report.actions[0].outcome, ActionOutcome::Unchanged);
        assert_eq!(fx.registry.pushes().len(), 1);
    }

    #[test]
    fn created_workspace_launches_above_threshold() {
        let fx = fixture(CannedParser::new(parsed("mic_017", 17, 60)));
        let mut session = known_session(&fx, 5, "mic_017");
        with_workspace(&fx, &mut session, OtfStatus::Created, 60);

        let report = fx.dispatcher.visit(session, &[REFRESH]).unwrap();

        assert!(report.pushed);
        assert_eq!(report.launch, LaunchOutcome::Started);
        assert_eq!(fx.launcher.launched(), vec![5]);
        let pushed = &fx.registry.pushes()[0];
        assert_eq!(pushed.otf_status(), Some(&OtfStatus::Launched));
    }

    #[test]
    fn created_workspace_waits_at_threshold() {
        let fx = fixture(CannedParser::new(parsed("mic_016", 16, 60)));
        let mut session = known_session(&fx, 6, "mic_016");
        with_workspace(&fx, &mut session, OtfStatus::Created, 60);

        let report = fx.dispatcher.visit(session, &[REFRESH]).unwrap();

        assert!(!report.pushed);
        assert_eq!(report.launch, LaunchOutcome::NotRequested);
        assert!(fx.launcher.launched().is_empty());
    }

    #[test]
    fn quiet_session_without_otf_finishes() {
        let fx = fixture(CannedParser::new(parsed("mic_100", 100, 2 * DAY)));
        let session = known_session(&fx, 7, "mic_100");

        let report = fx.dispatcher.visit(session, &[REFRESH]).unwrap();
        assert!(report.pushed);
        let pushed = &fx.registry.pushes()[0];
        assert_eq!(pushed.status, SessionStatus::Finished);
        assert!(pushed.extra.otf.is_none());
    }

    #[test]
    fn quiet_session_with_stale_workspace_finishes_both() {
        let fx = fixture(CannedParser::new(parsed("mic_100", 100, 2 * DAY)));
        let mut session = known_session(&fx, 8, "mic_100");
        with_workspace(&fx, &mut session, OtfStatus::Running, 2 * DAY);

        fx.dispatcher.visit(session, &[REFRESH]).unwrap();
        let pushed = &fx.registry.pushes()[0];
        assert_eq!(pushed.status, SessionStatus::Finished);
        assert_eq!(pushed.otf_status(), Some(&OtfStatus::Finished));
    }

    #[test]
    fn busy_workspace_keeps_session_running() {
        let fx = fixture(CannedParser::new(parsed("mic_100", 100, 2 * DAY)));
        let mut session = known_session(&fx, 9, "mic_100");
        with_workspace(&fx, &mut session, OtfStatus::Running, 600);

        let report = fx.dispatcher.visit(session, &[REFRESH]).unwrap();
        assert!(!report.pushed);
        assert!(fx.registry.pushes().is_empty());
    }

    #[test]
    fn in_progress_otf_without_folder_counts_as_active() {
        let fx = fixture(CannedParser::new(parsed("mic_100", 100, 2 * DAY)));
        let mut session = known_session(&fx, 10, "mic_100");
        session.extra.otf = Some(OtfRecord {
            status: Some(OtfStatus::Launched),
            ..OtfRecord::created(&fx.dir.path().join("OTF/removed"))
        });

        assert!(fx.dispatcher.otf_active(&session));
        let report = fx.dispatcher.visit(session, &[REFRESH]).unwrap();
        assert!(!report.pushed);
    }

    #[test]
    fn workspace_gets_epu_mirror_options() {
        let fx = fixture(CannedParser::new(parsed("mic_001", 1, 60)));
        let mut session = known_session(&fx, 11, "mic_001");
        let ws = with_workspace(&fx, &mut session, OtfStatus::Launched, 60);

        fx.dispatcher.visit(session, &[REFRESH]).unwrap();
        let calls = fx.parser.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].output_star, Some(ws.join("EPU/movies.star")));
        assert_eq!(calls[0].backup_folder, Some(ws.join("EPU")));
        assert_eq!(calls[0].last_movie.as_deref(), Some("mic_001"));
        assert_eq!(calls[0].offload_folder, Some(fx.layout.offload().join("grid-11")));
    }

    #[test]
    fn empty_rescan_never_rewinds_last_movie() {
        let fx = fixture(CannedParser::new(RawInfo::default()));
        let mut session = known_session(&fx, 18, "mic_050");
        {
            let raw = session.extra.raw.as_mut().unwrap();
            raw.movies = 50;
            raw.last_movie_creation = Some(format_stamp(Local::now() - chrono::Duration::seconds(2 * DAY)));
        }

        let report = fx.dispatcher.visit(session, &[REFRESH]).unwrap();

        assert_eq!(report.actions[0].outcome, ActionOutcome::Applied);
        let pushed = &fx.registry.pushes()[0];
        let raw = pushed.extra.raw.as_ref().unwrap();
        assert_eq!(raw.last_movie.as_deref(), Some("mic_050"));
        assert_eq!(raw.movies, 50);
        assert_eq!(pushed.status, SessionStatus::Finished);
    }

    #[test]
    fn empty_rescan_of_recent_session_changes_nothing() {
        let fx = fixture(CannedParser::new(RawInfo::default()));
        let mut session = known_session(&fx, 19, "mic_050");
        session.extra.raw.as_mut().unwrap().last_movie_creation = Some(format_stamp(Local::now()));

        let report = fx.dispatcher.visit(session, &[REFRESH]).unwrap();
        assert!(!report.pushed);
        assert_eq!(report.actions[0].outcome, ActionOutcome::Unchanged);
    }

    #[test]
    fn missing_raw_path_skips_everything() {
        let fx = fixture(CannedParser::new(parsed("mic_001", 1, 60)));
        let session = Session::new(12, "empty", 1);

        let report = fx.dispatcher.visit(session, &[UPDATE, Action::CreateOtf, Action::LaunchOtf]).unwrap();
        assert!(report
            .actions
            .iter()
            .all(|a| a.outcome == ActionOutcome::Skipped));
        assert!(!report.pushed);
        assert!(fx.parser.calls().is_empty());
        assert!(fx.launcher.launched().is_empty());
    }

    #[test]
    fn failing_action_does_not_stop_the_queue() {
        let fx = fixture(CannedParser::failing());
        let mut session = known_session(&fx, 13, "mic_001");
        with_workspace(&fx, &mut session, OtfStatus::Created, 60);
        session.extra.actions = vec!["update_raw".into(), "launch_otf".into()];

        let report = fx.dispatcher.visit(session, &[UPDATE, Action::LaunchOtf]).unwrap();

        assert!(matches!(report.actions[0].outcome, ActionOutcome::Failed { .. }));
        assert_eq!(report.actions[1].outcome, ActionOutcome::Applied);
        assert_eq!(report.failures(), 1);
        assert!(report.pushed);
        let pushed = &fx.registry.pushes()[0];
        assert!(pushed.extra.actions.is_empty());
        assert_eq!(pushed.otf_status(), Some(&OtfStatus::Launched));
        assert_eq!(fx.launcher.launched(), vec![13]);
    }

    #[test]
    fn failed_build_does_not_mark_dirty() {
        let fx = fixture(CannedParser::new(parsed("mic_001", 1, 60)));
        // Raw path recorded but never written to disk.
        let session = raw_session(14, &fx.layout.raw().join("grid-14"));

        let report = fx.dispatcher.visit(session, &[Action::CreateOtf]).unwrap();
        assert!(matches!(report.actions[0].outcome, ActionOutcome::Failed { .. }));
        assert!(!report.pushed);
        assert!(fx.registry.pushes().is_empty());
    }

    #[test]
    fn create_otf_builds_and_pushes() {
        let fx = fixture(CannedParser::new(parsed("mic_001", 1, 60)));
        let session = known_session(&fx, 15, "mic_001");

        let report = fx.dispatcher.visit(session, &[Action::CreateOtf]).unwrap();
        assert!(report.pushed);
        let pushed = &fx.registry.pushes()[0];
        let otf = pushed.extra.otf.as_ref().unwrap();
        assert_eq!(otf.status, Some(OtfStatus::Created));
        assert!(otf.path().unwrap().join("README.txt").exists());
        assert!(fx.launcher.launched().is_empty());
    }

    #[test]
    fn launch_failure_keeps_launched_status() {
        let fx = fixture_with(
            CannedParser::new(parsed("mic_001", 1, 60)),
            RecordingLauncher::failing(),
        );
        let mut session = known_session(&fx, 16, "mic_001");
        with_workspace(&fx, &mut session, OtfStatus::Created, 60);

        let report = fx.dispatcher.visit(session, &[Action::LaunchOtf]).unwrap();
        assert!(matches!(report.launch, LaunchOutcome::Failed { .. }));
        assert_eq!(
            fx.registry.pushes()[0].otf_status(),
            Some(&OtfStatus::Launched)
        );
    }

    #[test]
    fn push_failure_escapes_the_visit() {
        let fx = fixture(CannedParser::new(parsed("mic_002", 2, 60)));
        let session = known_session(&fx, 17, "mic_001");
        fx.registry.set_unavailable(true);

        assert!(fx.dispatcher.visit(session, &[UPDATE]).is_err());
        assert!(fx.launcher.launched().is_empty());
    }

    /// Registry whose first `session_users` call parks until released, which
    /// holds a workspace build open.
    struct GatedRegistry {
        inner: Arc<MemoryRegistry>,
        gated: std::sync::atomic::AtomicBool,
        entered: std::sync::Barrier,
        release: std::sync::Barrier,
    }

    impl Registry for GatedRegistry {
        fn sessions(&self, filter: serde_json::Value) -> Result<BTreeMap<i64, Session>> {
            self.inner.sessions(filter)
        }

        fn resources(&self) -> Result<BTreeMap<i64, Resource>> {
            self.inner.resources()
        }

        fn config(&self, section: &str) -> Result<serde_json::Value> {
            self.inner.config(section)
        }

        fn session_users(&self, session_id: i64) -> Result<crate::types::SessionUsers> {
            if !self.gated.swap(true, std::sync::atomic::Ordering::SeqCst) {
                self.entered.wait();
                self.release.wait();
            }
            self.inner.session_users(session_id)
        }

        fn poll_active_sessions(&self) -> Result<Vec<Session>> {
            self.inner.poll_active_sessions()
        }

        fn update_session(&self, session: &Session) -> Result<()> {
            self.inner.update_session(session)
        }
    }

    #[test]
    fn overlapping_builds_of_one_session_are_refused() {
        let dir = TempDir::new().unwrap();
        let layout = make_layout(dir.path());
        let memory = Arc::new(
            MemoryRegistry::default()
                .with_resource(1, "Krios")
                .with_config(json!({"acquisition": {"Krios": {"voltage": 300}}})),
        );
        let registry = Arc::new(GatedRegistry {
            inner: memory.clone(),
            gated: Default::default(),
            entered: std::sync::Barrier::new(2),
            release: std::sync::Barrier::new(2),
        });
        let mut map = BTreeMap::new();
        map.insert(1, Resource { id: 1, name: "Krios".into() });
        let builder = Arc::new(WorkspaceBuilder::new(
            registry.clone(),
            Arc::new(Resources::new(map)),
            layout.clone(),
        ));
        let dispatcher = Dispatcher::new(
            registry.clone(),
            Arc::new(CannedParser::new(parsed("mic_001", 1, 60))),
            builder,
            Arc::new(RecordingLauncher::default()),
            OtfConfig::default(),
        );
        let raw = layout.raw().join("grid-20");
        std::fs::create_dir_all(&raw).unwrap();
        let session = raw_session(20, &raw);

        let (first, second) = std::thread::scope(|s| {
            let first = s.spawn(|| dispatcher.visit(session.clone(), &[Action::CreateOtf]));
            registry.entered.wait();
            let second = dispatcher.visit(session.clone(), &[Action::CreateOtf]);
            registry.release.wait();
            (first.join().unwrap(), second)
        });

        let second = second.unwrap();
        match &second.actions[0].outcome {
            ActionOutcome::Failed { reason } => assert!(reason.contains("already running"), "{reason}"),
            other => panic!("expected a refused build, got {other:?}"),
        }
        assert!(!second.pushed);

        let first = first.unwrap();
        assert_eq!(first.actions[0].outcome, ActionOutcome::Applied);
        assert!(first.pushed);
        let pushes = memory.pushes();
        assert_eq!(pushes.len(), 1);
        let otf = pushes[0].extra.otf.as_ref().unwrap();
        assert!(otf.path().unwrap().join("README.txt").exists());
        assert!(otf.path().unwrap().join("relion_it_options.py").exists());
    }
}
