//! In-memory collaborators shared by the unit tests.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use filetime::{set_file_mtime, FileTime};
use serde_json::{json, Value};

use crate::error::{Result, SessionsError};
use crate::launcher::OtfLauncher;
use crate::paths::{FolderLayout, GROUPS_DIR, OFFLOAD_DIR, OTF_DIR, RAW_DIR};
use crate::raw::{ParseOptions, RawParser};
use crate::registry::Registry;
use crate::types::{RawInfo, Resource, Session, SessionUsers};

pub fn make_layout(dir: &Path) -> FolderLayout {
    for sub in [RAW_DIR, OFFLOAD_DIR, OTF_DIR, GROUPS_DIR] {
        std::fs::create_dir_all(dir.join(sub)).unwrap();
    }
    FolderLayout::resolve(dir).unwrap()
}

/// Set the mtime of `path` to `age_secs` seconds ago.
pub fn age_file(path: &Path, age_secs: i64) {
    let now = FileTime::now().unix_seconds();
    set_file_mtime(path, FileTime::from_unix_time(now - age_secs, 0)).unwrap();
}

pub fn raw_session(id: i64, raw: &Path) -> Session {
    let mut session = Session::new(id, format!("grid-{id}"), 1);
    session.extra.raw = Some(RawInfo {
        path: Some(raw.display().to_string()),
        ..RawInfo::default()
    });
    session
}

// ---------------------------------------------------------------------------
// MemoryRegistry
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryRegistry {
    sessions: Mutex<BTreeMap<i64, Session>>,
    resources: BTreeMap<i64, Resource>,
    config: Value,
    users: SessionUsers,
    pushes: Mutex<Vec<Session>>,
    polls: AtomicUsize,
    unavailable: AtomicBool,
}

impl MemoryRegistry {
    pub fn with_resource(mut self, id: i64, name: &str) -> Self {
        self.resources.insert(
            id,
            Resource {
                id,
                name: name.to_string(),
            },
        );
        self
    }

    pub fn with_config(mut self, config: Value) -> Self {
        self.config = config;
        self
    }

    pub fn with_users(mut self, users: SessionUsers) -> Self {
        self.users = users;
        self
    }

    pub fn with_session(self, session: Session) -> Self {
        self.sessions.lock().unwrap().insert(session.id, session);
        self
    }

    pub fn set_unavailable(&self, down: bool) {
        self.unavailable.store(down, Ordering::SeqCst);
    }

    /// Every record pushed through `update_session`, in order.
    pub fn pushes(&self) -> Vec<Session> {
        self.pushes.lock().unwrap().clone()
    }

    /// Number of `poll_active_sessions` calls so far.
    pub fn polls(&self) -> usize {
        self.polls.load(Ordering::SeqCst)
    }

    pub fn stored(&self, id: i64) -> Option<Session> {
        self.sessions.lock().unwrap().get(&id).cloned()
    }

    fn check(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(SessionsError::RegistryUnavailable("connection refused".into()));
        }
        Ok(())
    }
}

impl Registry for MemoryRegistry {
    fn sessions(&self, _filter: Value) -> Result<BTreeMap<i64, Session>> {
        self.check()?;
        Ok(self.sessions.lock().unwrap().clone())
    }

    fn resources(&self) -> Result<BTreeMap<i64, Resource>> {
        self.check()?;
        Ok(self.resources.clone())
    }

    fn config(&self, _section: &str) -> Result<Value> {
        self.check()?;
        if self.config.is_null() {
            return Ok(json!({}));
        }
        Ok(self.config.clone())
    }

    fn session_users(&self, _session_id: i64) -> Result<SessionUsers> {
        self.check()?;
        Ok(self.users.clone())
    }

    fn poll_active_sessions(&self) -> Result<Vec<Session>> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        self.check()?;
        Ok(self
            .sessions
            .lock()
            .unwrap()
            .values()
            .filter(|s| !s.extra.actions.is_empty())
            .cloned()
            .collect())
    }

    fn update_session(&self, session: &Session) -> Result<()> {
        self.check()?;
        self.pushes.lock().unwrap().push(session.clone());
        self.sessions
            .lock()
            .unwrap()
            .insert(session.id, session.clone());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// CannedParser
// ---------------------------------------------------------------------------

/// Parser returning a fixed result and remembering what it was asked.
pub struct CannedParser {
    info: Option<RawInfo>,
    calls: Mutex<Vec<ParseOptions>>,
}

impl CannedParser {
    pub fn new(info: RawInfo) -> Self {
        Self {
            info: Some(info),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn failing() -> Self {
        Self {
            info: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<ParseOptions> {
        self.calls.lock().unwrap().clone()
    }
}

impl RawParser for CannedParser {
    fn parse(&self, raw_path: &Path, opts: &ParseOptions) -> Result<RawInfo> {
        self.calls.lock().unwrap().push(opts.clone());
        match &self.info {
            Some(info) => Ok(RawInfo {
                path: Some(raw_path.display().to_string()),
                ..info.clone()
            }),
            None => Err(SessionsError::Parse("corrupt session metadata".into())),
        }
    }
}

// ---------------------------------------------------------------------------
// RecordingLauncher
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct RecordingLauncher {
    launched: Mutex<Vec<i64>>,
    fail: bool,
}

impl RecordingLauncher {
    pub fn failing() -> Self {
        Self {
            launched: Mutex::new(Vec::new()),
            fail: true,
        }
    }

    pub fn launched(&self) -> Vec<i64> {
        self.launched.lock().unwrap().clone()
    }
}

impl OtfLauncher for RecordingLauncher {
    fn launch(&self, session: &Session) -> Result<()> {
        self.launched.lock().unwrap().push(session.id);
        if self.fail {
            return Err(SessionsError::Launch("command not found".into()));
        }
        Ok(())
    }
}
