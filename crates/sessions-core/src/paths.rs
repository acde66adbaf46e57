use crate::error::{Result, SessionsError};
use std::path::{Path, PathBuf};

// ---------------------------------------------------------------------------
// Directory constants
// ---------------------------------------------------------------------------

pub const RAW_DIR: &str = "EPU";
pub const OFFLOAD_DIR: &str = "Offload";
pub const OTF_DIR: &str = "OTF";
pub const GROUPS_DIR: &str = "Groups";

/// Entries inside an OTF workspace.
pub const WORKSPACE_DATA: &str = "data";
pub const WORKSPACE_GAIN: &str = "gain.mrc";
pub const WORKSPACE_README: &str = "README.txt";
pub const WORKSPACE_OPTIONS: &str = "relion_it_options.py";
pub const WORKSPACE_EPU: &str = "EPU";
pub const MOVIES_STAR: &str = "movies.star";

// ---------------------------------------------------------------------------
// FolderLayout
// ---------------------------------------------------------------------------

/// Canonical locations of the four subtrees under the sessions data root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FolderLayout {
    root: PathBuf,
    raw: PathBuf,
    offload: PathBuf,
    otf: PathBuf,
    groups: PathBuf,
}

impl FolderLayout {
    /// Resolve and validate the layout under `root`.
    ///
    /// The root and every subtree must already exist; the daemon refuses to
    /// start on an incomplete layout.
    pub fn resolve(root: &Path) -> Result<Self> {
        let root = check_folder("SESSIONS_DATA_FOLDER", root)?;
        Ok(Self {
            raw: check_folder(RAW_DIR, &root.join(RAW_DIR))?,
            offload: check_folder(OFFLOAD_DIR, &root.join(OFFLOAD_DIR))?,
            otf: check_folder(OTF_DIR, &root.join(OTF_DIR))?,
            groups: check_folder(GROUPS_DIR, &root.join(GROUPS_DIR))?,
            root,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn raw(&self) -> &Path {
        &self.raw
    }

    pub fn offload(&self) -> &Path {
        &self.offload
    }

    pub fn otf(&self) -> &Path {
        &self.otf
    }

    pub fn groups(&self) -> &Path {
        &self.groups
    }

    /// `(name, path)` pairs in display order.
    pub fn folders(&self) -> [(&'static str, &Path); 4] {
        [
            (RAW_DIR, self.raw()),
            (OFFLOAD_DIR, self.offload()),
            (OTF_DIR, self.otf()),
            (GROUPS_DIR, self.groups()),
        ]
    }

    /// Default offload destination for a raw session folder.
    pub fn offload_destination(&self, raw_path: &Path) -> PathBuf {
        match raw_path.file_name() {
            Some(name) => self.offload.join(name),
            None => self.offload.clone(),
        }
    }
}

fn check_folder(name: &str, path: &Path) -> Result<PathBuf> {
    if !path.is_dir() {
        return Err(SessionsError::MissingFolder {
            name: name.to_string(),
            path: path.to_path_buf(),
        });
    }
    Ok(std::fs::canonicalize(path)?)
}

// ---------------------------------------------------------------------------
// Workspace path helpers
// ---------------------------------------------------------------------------

pub fn workspace_epu_dir(workspace: &Path) -> PathBuf {
    workspace.join(WORKSPACE_EPU)
}

pub fn workspace_movies_star(workspace: &Path) -> PathBuf {
    workspace_epu_dir(workspace).join(MOVIES_STAR)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
