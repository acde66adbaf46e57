//! Moving stabilized raw files to long-term storage.
//!
//! A file is offloaded once it has not been modified for the quiet window, so
//! files the instrument is still writing are never touched. Moved files are
//! recorded in `extra.raw.files` and the session is pushed every
//! `flush_every` files and once more at the end of the walk. A rerun over the
//! same tree is naturally idempotent: moved files are simply gone.

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::time::SystemTime;

use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::config::OffloadConfig;
use crate::error::{Result, SessionsError};
use crate::paths::FolderLayout;
use crate::registry::Registry;
use crate::types::{FileStat, Session};

// ---------------------------------------------------------------------------
// FileMover
// ---------------------------------------------------------------------------

/// Destructive one-way move of a single file. The implementation's own
/// integrity guarantee is trusted; nothing is verified afterwards.
pub trait FileMover: Send + Sync {
    fn move_file(&self, src: &Path, dst: &Path) -> Result<()>;
}

/// `rsync -ac --remove-source-files`, for moves across network mounts.
pub struct RsyncMover;

impl FileMover for RsyncMover {
    fn move_file(&self, src: &Path, dst: &Path) -> Result<()> {
        ensure_parent(dst)?;
        let output = Command::new("rsync")
            .args(["-ac", "--remove-source-files"])
            .arg(src)
            .arg(dst)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()?;
        if !output.status.success() {
            let hint = String::from_utf8_lossy(&output.stderr)
                .chars()
                .take(500)
                .collect::<String>();
            return Err(std::io::Error::other(format!(
                "rsync {} failed ({}): {hint}",
                src.display(),
                output.status
            ))
            .into());
        }
        Ok(())
    }
}

/// In-process move: rename, or copy then remove across filesystems.
pub struct LocalMover;

impl FileMover for LocalMover {
    fn move_file(&self, src: &Path, dst: &Path) -> Result<()> {
        ensure_parent(dst)?;
        if std::fs::rename(src, dst).is_err() {
            std::fs::copy(src, dst)?;
            std::fs::remove_file(src)?;
        }
        Ok(())
    }
}

fn ensure_parent(dst: &Path) -> Result<()> {
    if let Some(parent) = dst.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(())
}

/// rsync when it is installed, the in-process mover otherwise.
pub fn default_mover() -> Arc<dyn FileMover> {
    if which::which("rsync").is_ok() {
        Arc::new(RsyncMover)
    } else {
        warn!("rsync not found on PATH, offloading with in-process moves");
        Arc::new(LocalMover)
    }
}

// ---------------------------------------------------------------------------
// OffloadEngine
// ---------------------------------------------------------------------------

/// Destination root for a session's raw files: the recorded offload path,
/// or the raw folder's name under the offload tree.
pub fn offload_destination(session: &Session, layout: &FolderLayout, raw_path: &Path) -> PathBuf {
    session
        .extra
        .offload
        .as_ref()
        .and_then(|o| o.path.as_deref())
        .filter(|p| !p.trim().is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| layout.offload_destination(raw_path))
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OffloadReport {
    pub moved: usize,
    pub pushes: usize,
}

#[derive(Clone)]
pub struct OffloadEngine {
    registry: Arc<dyn Registry>,
    mover: Arc<dyn FileMover>,
    layout: FolderLayout,
    config: OffloadConfig,
}

impl OffloadEngine {
    pub fn new(
        registry: Arc<dyn Registry>,
        mover: Arc<dyn FileMover>,
        layout: FolderLayout,
        config: OffloadConfig,
    ) -> Self {
        Self {
            registry,
            mover,
            layout,
            config,
        }
    }

    pub fn destination(&self, session: &Session, raw_path: &Path) -> PathBuf {
        offload_destination(session, &self.layout, raw_path)
    }

    /// Move every quiet file of the session's raw tree.
    ///
    /// A failed move stops the walk for this cycle; progress made so far is
    /// still pushed before the error is returned.
    pub fn offload(&self, session: &mut Session) -> Result<OffloadReport> {
        let Some(src) = session.raw_path() else {
            return Ok(OffloadReport::default());
        };
        if !src.is_dir() {
            return Err(SessionsError::InputMissing(src));
        }
        let dst = self.destination(session, &src);
        let scan_start = SystemTime::now();
        let flush_every = self.config.flush_every.max(1);

        let mut report = OffloadReport::default();
        let mut pending: Vec<(String, FileStat)> = Vec::new();

        for (file, meta) in self.quiet_files(&src, scan_start)? {
            let rel = file.strip_prefix(&src).unwrap_or(&file);
            let target = dst.join(rel);
            if let Err(e) = self.mover.move_file(&file, &target) {
                warn!(session_id = session.id, file = %file.display(), error = %e, "offload move failed");
                if !pending.is_empty() {
                    if let Err(flush_err) = self.flush(session, &mut pending) {
                        warn!(session_id = session.id, error = %flush_err, "could not push offload progress");
                    } else {
                        report.pushes += 1;
                    }
                }
                return Err(e);
            }
            debug!(session_id = session.id, file = %file.display(), "offloaded");
            pending.push((file.display().to_string(), FileStat::from_metadata(&meta)));
            report.moved += 1;

            if pending.len() >= flush_every {
                self.flush(session, &mut pending)?;
                report.pushes += 1;
            }
        }

        if !pending.is_empty() {
            self.flush(session, &mut pending)?;
            report.pushes += 1;
        }
        if report.moved > 0 {
            info!(session_id = session.id, moved = report.moved, dst = %dst.display(), "offload pass done");
        }
        Ok(report)
    }

    /// Regular files under `src` untouched for the whole quiet window.
    fn quiet_files(
        &self,
        src: &Path,
        scan_start: SystemTime,
    ) -> Result<Vec<(PathBuf, std::fs::Metadata)>> {
        let window = self.config.quiet_window();
        let mut files = Vec::new();
        for entry in WalkDir::new(src).sort_by_file_name() {
            let entry = entry.map_err(std::io::Error::from)?;
            if !entry.file_type().is_file() {
                continue;
            }
            let meta = entry.metadata().map_err(std::io::Error::from)?;
            let quiet = scan_start
                .duration_since(meta.modified()?)
                .is_ok_and(|age| age >= window);
            if quiet {
                files.push((entry.into_path(), meta));
            }
        }
        Ok(files)
    }

    fn flush(&self, session: &mut Session, pending: &mut Vec<(String, FileStat)>) -> Result<()> {
        let raw = session.extra.raw.get_or_insert_with(Default::default);
        raw.files.extend(pending.drain(..));
        session.touch();
        self.registry.update_session(session)
    }
}
