use chrono::{DateTime, Local, NaiveDateTime};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

// ---------------------------------------------------------------------------
// SessionStatus
// ---------------------------------------------------------------------------

/// Status of a session as stored by the registry.
///
/// Values this daemon never writes are carried through unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum SessionStatus {
    #[default]
    Running,
    Finished,
    Other(String),
}

impl SessionStatus {
    pub fn as_str(&self) -> &str {
        match self {
            SessionStatus::Running => "running",
            SessionStatus::Finished => "finished",
            SessionStatus::Other(s) => s,
        }
    }
}

impl From<String> for SessionStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "running" => SessionStatus::Running,
            "finished" => SessionStatus::Finished,
            _ => SessionStatus::Other(s),
        }
    }
}

impl From<SessionStatus> for String {
    fn from(s: SessionStatus) -> Self {
        s.as_str().to_string()
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// OtfStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum OtfStatus {
    Created,
    Launched,
    Running,
    Finished,
    Other(String),
}

impl OtfStatus {
    pub fn as_str(&self) -> &str {
        match self {
            OtfStatus::Created => "created",
            OtfStatus::Launched => "launched",
            OtfStatus::Running => "running",
            OtfStatus::Finished => "finished",
            OtfStatus::Other(s) => s,
        }
    }

    /// Statuses under which a processing run may still be producing output.
    pub fn is_in_progress(&self) -> bool {
        matches!(
            self,
            OtfStatus::Created | OtfStatus::Launched | OtfStatus::Running
        )
    }
}

impl From<String> for OtfStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "created" => OtfStatus::Created,
            "launched" => OtfStatus::Launched,
            "running" => OtfStatus::Running,
            "finished" => OtfStatus::Finished,
            _ => OtfStatus::Other(s),
        }
    }
}

impl From<OtfStatus> for String {
    fn from(s: OtfStatus) -> Self {
        s.as_str().to_string()
    }
}

impl fmt::Display for OtfStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// RawInfo
// ---------------------------------------------------------------------------

/// Size and modification time of an offloaded file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileStat {
    pub size: u64,
    /// Seconds since the Unix epoch.
    pub mtime: f64,
}

impl FileStat {
    pub fn from_metadata(meta: &std::fs::Metadata) -> Self {
        let mtime = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_secs_f64())
            .unwrap_or_default();
        Self {
            size: meta.len(),
            mtime,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_movie: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_movie_creation: Option<String>,
    #[serde(default)]
    pub movies: u64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub files: BTreeMap<String, FileStat>,
    #[serde(flatten)]
    pub other: Map<String, Value>,
}

// ---------------------------------------------------------------------------
// OtfRecord / OffloadInfo
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OtfRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<OtfStatus>,
    #[serde(flatten)]
    pub other: Map<String, Value>,
}

impl OtfRecord {
    pub fn created(path: &Path) -> Self {
        Self {
            path: Some(path.display().to_string()),
            status: Some(OtfStatus::Created),
            other: Map::new(),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        non_empty(self.path.as_deref()).map(Path::new)
    }

    /// Whether the workspace folder is present on disk.
    pub fn exists(&self) -> bool {
        self.path().is_some_and(Path::exists)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OffloadInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(flatten)]
    pub other: Map<String, Value>,
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionExtra {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<RawInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub otf: Option<OtfRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offload: Option<OffloadInfo>,
    /// Pending action tokens queued by the registry.
    #[serde(default)]
    pub actions: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated: Option<String>,
    #[serde(flatten)]
    pub other: Map<String, Value>,
}

/// A session record. Owned by the registry; pushed back whole after changes,
/// so every field the daemon does not model is kept in `other`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: i64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub resource_id: i64,
    #[serde(default)]
    pub status: SessionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_path: Option<String>,
    #[serde(default)]
    pub extra: SessionExtra,
    #[serde(flatten)]
    pub other: Map<String, Value>,
}

impl Session {
    pub fn new(id: i64, name: impl Into<String>, resource_id: i64) -> Self {
        Self {
            id,
            name: name.into(),
            resource_id,
            ..Self::default()
        }
    }

    /// The raw data folder, only when recorded and non-empty.
    pub fn raw_path(&self) -> Option<PathBuf> {
        let raw = self.extra.raw.as_ref()?;
        non_empty(raw.path.as_deref()).map(PathBuf::from)
    }

    pub fn otf_status(&self) -> Option<&OtfStatus> {
        self.extra.otf.as_ref()?.status.as_ref()
    }

    /// Stamp `extra.updated` with the current local time.
    pub fn touch(&mut self) {
        self.extra.updated = Some(now_stamp());
    }
}

// ---------------------------------------------------------------------------
// Reference data
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub id: i64,
    pub name: String,
}

/// Resources cached at startup, for instrument-name lookups.
#[derive(Debug, Clone, Default)]
pub struct Resources(BTreeMap<i64, Resource>);

impl Resources {
    pub fn new(resources: BTreeMap<i64, Resource>) -> Self {
        Self(resources)
    }

    pub(crate) fn len(&self) -> usize {
        self.0.len()
    }

    /// Instrument name of a resource.
    pub fn name(&self, id: i64) -> crate::error::Result<&str> {
        self.0
            .get(&id)
            .map(|r| r.name.as_str())
            .ok_or(crate::error::SessionsError::UnknownResource(id))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserRef {
    #[serde(default)]
    pub name: Option<String>,
}

/// People attached to a session, as returned by `get_session_users`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionUsers {
    #[serde(default)]
    pub group: Value,
    #[serde(default)]
    pub owner: UserRef,
    #[serde(default)]
    pub operator: Option<UserRef>,
}

impl SessionUsers {
    pub fn owner_name(&self) -> &str {
        self.owner.name.as_deref().unwrap_or("")
    }

    pub fn operator_name(&self) -> &str {
        self.operator
            .as_ref()
            .and_then(|o| o.name.as_deref())
            .unwrap_or("No-operator")
    }
}

// ---------------------------------------------------------------------------
// Timestamps
// ---------------------------------------------------------------------------

const STAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Current local time in the registry's `YYYY-MM-DD HH:MM:SS` form.
pub fn now_stamp() -> String {
    format_stamp(Local::now())
}

pub fn format_stamp(ts: DateTime<Local>) -> String {
    ts.format(STAMP_FORMAT).to_string()
}

/// Parse a registry timestamp into local wall-clock time.
pub fn parse_stamp(s: &str) -> Option<NaiveDateTime> {
    let s = s.trim();
    NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f")
        .ok()
        .or_else(|| {
            DateTime::parse_from_rfc3339(s)
                .ok()
                .map(|t| t.with_timezone(&Local).naive_local())
        })
}

fn non_empty(s: Option<&str>) -> Option<&str> {
    s.filter(|s| !s.trim().is_empty())
}
