//! OTF workspace materialization.
//!
//! A workspace lives at `<OTF>/<YYYYMMDD>_<instrument>_<session>_OTF` and holds:
//!
//! ```text
//! data                  -> link to the raw session folder
//! gain.mrc              -> link to the instrument gain reference (if found)
//! README.txt            sectioned key = value summary of the session
//! relion_it_options.py  literal key/value dump for the processing pipeline
//! ```
//!
//! Building always starts from an empty folder: a rebuild destroys whatever
//! the previous build (or a processing run) left there. Builds for the same
//! session are serialized through [`BuildLocks`].

use std::collections::{BTreeMap, HashSet};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::Local;
use tracing::{info, warn};

use crate::config::{value_text, SessionsConfig};
use crate::error::{Result, SessionsError};
use crate::io::{atomic_write, recreate_dir, symlink};
use crate::paths::{
    FolderLayout, WORKSPACE_DATA, WORKSPACE_GAIN, WORKSPACE_OPTIONS, WORKSPACE_README,
};
use crate::registry::Registry;
use crate::template;
use crate::types::{OtfRecord, Resources, Session, SessionUsers};

/// Glob of the movies inside the linked raw folder.
pub const PREPROCESSING_IMAGES: &str = "data/Images-Disc1/GridSquare_*/Data/Foil*fractions.tiff";

// ---------------------------------------------------------------------------
// BuildLocks
// ---------------------------------------------------------------------------

/// Session ids with a workspace build in flight.
#[derive(Debug, Default)]
pub struct BuildLocks {
    active: Mutex<HashSet<i64>>,
}

pub struct BuildGuard<'a> {
    locks: &'a BuildLocks,
    session_id: i64,
}

impl BuildLocks {
    pub fn try_acquire(&self, session_id: i64) -> Result<BuildGuard<'_>> {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        if !active.insert(session_id) {
            return Err(SessionsError::BuildInProgress(session_id));
        }
        Ok(BuildGuard {
            locks: self,
            session_id,
        })
    }
}

impl Drop for BuildGuard<'_> {
    fn drop(&mut self) {
        self.locks
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.session_id);
    }
}

// ---------------------------------------------------------------------------
// WorkspaceBuilder
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuiltWorkspace {
    pub path: PathBuf,
    pub gain: Option<PathBuf>,
}

pub struct WorkspaceBuilder {
    registry: Arc<dyn Registry>,
    resources: Arc<Resources>,
    layout: FolderLayout,
    locks: BuildLocks,
}

impl WorkspaceBuilder {
    pub fn new(registry: Arc<dyn Registry>, resources: Arc<Resources>, layout: FolderLayout) -> Self {
        Self {
            registry,
            resources,
            layout,
            locks: BuildLocks::default(),
        }
    }

    pub fn layout(&self) -> &FolderLayout {
        &self.layout
    }

    pub fn workspace_name(date: &str, microscope: &str, session_name: &str) -> String {
        format!("{date}_{microscope}_{session_name}_OTF")
    }

    /// Build the workspace and record it in `session.extra.otf`.
    ///
    /// Everything that can fail on remote input (users, config, templates) is
    /// resolved before the old workspace is touched. The session is only
    /// modified once the folder is complete.
    pub fn build(&self, session: &mut Session) -> Result<BuiltWorkspace> {
        let raw_path = session
            .raw_path()
            .ok_or_else(|| SessionsError::InputMissing(PathBuf::new()))?;
        info!(session_id = session.id, raw = %raw_path.display(), "creating OTF workspace");
        if !raw_path.exists() {
            return Err(SessionsError::InputMissing(raw_path));
        }
        let _guard = self.locks.try_acquire(session.id)?;

        let microscope = self.resources.name(session.resource_id)?.to_string();
        let users = self.registry.session_users(session.id)?;
        let config = self.registry.sessions_config()?;
        let acquisition = config.acquisition_for(&microscope)?;
        let readme = readme_text(&users, &microscope, &raw_path, &acquisition);
        let options = options_text(&config, &acquisition)?;
        let gain = find_gain(&config, &microscope)?;

        let date = Local::now().format("%Y%m%d").to_string();
        let path = self
            .layout
            .otf()
            .join(Self::workspace_name(&date, &microscope, &session.name));

        recreate_dir(&path)?;
        symlink(&raw_path, &path.join(WORKSPACE_DATA))?;
        if let Some(gain) = &gain {
            symlink(gain, &path.join(WORKSPACE_GAIN))?;
        } else {
            warn!(session_id = session.id, microscope = %microscope, "no gain reference found");
        }
        atomic_write(&path.join(WORKSPACE_README), readme.as_bytes())?;
        atomic_write(&path.join(WORKSPACE_OPTIONS), options.as_bytes())?;

        session.extra.otf = Some(OtfRecord::created(&path));
        session.data_path = Some(path.display().to_string());
        info!(session_id = session.id, path = %path.display(), "OTF workspace ready");
        Ok(BuiltWorkspace { path, gain })
    }
}

/// First gain reference matching the instrument pattern, fully resolved.
fn find_gain(config: &SessionsConfig, microscope: &str) -> Result<Option<PathBuf>> {
    let Some(pattern) = config.data.gain.as_deref() else {
        return Ok(None);
    };
    let pattern = template::render(pattern, &template::vars([("microscope", microscope.to_string())]))?;
    let mut matches: Vec<PathBuf> = glob::glob(&pattern)
        .map_err(|e| SessionsError::Template(format!("bad gain pattern '{pattern}': {e}")))?
        .filter_map(|entry| entry.ok())
        .collect();
    matches.sort();
    match matches.into_iter().next() {
        Some(gain) => Ok(Some(std::fs::canonicalize(gain)?)),
        None => Ok(None),
    }
}

/// Sectioned `key = value` summary: GENERAL, ACQUISITION, PREPROCESSING.
fn readme_text(
    users: &SessionUsers,
    microscope: &str,
    raw_path: &Path,
    acquisition: &BTreeMap<String, String>,
) -> String {
    let general = [
        ("group", value_text(&users.group)),
        ("user", users.owner_name().to_string()),
        ("operator", users.operator_name().to_string()),
        ("microscope", microscope.to_string()),
        ("raw_data", raw_path.display().to_string()),
    ];
    let preprocessing = [
        ("images", PREPROCESSING_IMAGES.to_string()),
        ("software", "None".to_string()),
    ];

    let mut out = String::new();
    write_section(&mut out, "GENERAL", general.iter().map(|(k, v)| (*k, v.as_str())));
    write_section(
        &mut out,
        "ACQUISITION",
        acquisition.iter().map(|(k, v)| (k.as_str(), v.as_str())),
    );
    write_section(
        &mut out,
        "PREPROCESSING",
        preprocessing.iter().map(|(k, v)| (*k, v.as_str())),
    );
    out
}

fn write_section<'a>(out: &mut String, name: &str, entries: impl Iterator<Item = (&'a str, &'a str)>) {
    let _ = writeln!(out, "[{name}]");
    for (key, value) in entries {
        let _ = writeln!(out, "{} = {value}", key.to_lowercase());
    }
    out.push('\n');
}

/// `{'key' : 'value', ...}` with values rendered from the acquisition params.
fn options_text(config: &SessionsConfig, acquisition: &BTreeMap<String, String>) -> Result<String> {
    let lines = config
        .relion_options()
        .into_iter()
        .map(|(key, tmpl)| -> Result<String> {
            Ok(format!("'{key}' : '{}'", template::render(&tmpl, acquisition)?))
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(format!("{{\n{}\n}}\n", lines.join(",\n")))
}
