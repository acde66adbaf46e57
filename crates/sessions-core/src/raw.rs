//! Raw acquisition folder inspection.
//!
//! The real acquisition layout is parsed by an external metadata tool; the
//! daemon only needs movie counts and the newest movie. [`RawParser`] is that
//! seam, and [`EpuScanner`] is a filesystem-only implementation good enough
//! for folders that follow the usual `*fractions.tiff` naming.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, Local};
use walkdir::WalkDir;

use crate::error::{Result, SessionsError};
use crate::io::atomic_write;
use crate::types::{format_stamp, RawInfo};

/// Knobs passed to the parser for one scan.
#[derive(Debug, Clone, Default)]
pub struct ParseOptions {
    /// Last movie already known; lets incremental parsers skip work.
    pub last_movie: Option<String>,
    /// Where to write the movie listing, when an OTF workspace exists.
    pub output_star: Option<PathBuf>,
    /// Where to mirror parsed metadata, when an OTF workspace exists.
    pub backup_folder: Option<PathBuf>,
    /// Where already-offloaded files of this session live. Movies found there
    /// still count.
    pub offload_folder: Option<PathBuf>,
}

pub trait RawParser: Send + Sync {
    fn parse(&self, raw_path: &Path, opts: &ParseOptions) -> Result<RawInfo>;
}

// ---------------------------------------------------------------------------
// EpuScanner
// ---------------------------------------------------------------------------

pub const DEFAULT_MOVIE_SUFFIX: &str = "fractions.tiff";

pub struct EpuScanner {
    movie_suffix: String,
}

impl Default for EpuScanner {
    fn default() -> Self {
        Self::new(DEFAULT_MOVIE_SUFFIX)
    }
}

impl EpuScanner {
    pub fn new(movie_suffix: impl Into<String>) -> Self {
        Self {
            movie_suffix: movie_suffix.into(),
        }
    }

    /// Movies under `raw_path` and, when present, `offload_folder`, keyed by
    /// their path relative to either root. A movie caught mid-move shows up
    /// in both trees; the raw copy wins.
    fn movies(&self, raw_path: &Path, offload_folder: Option<&Path>) -> Result<Vec<Movie>> {
        let mut found: BTreeMap<PathBuf, Movie> = BTreeMap::new();
        if let Some(offloaded) = offload_folder.filter(|p| p.is_dir()) {
            self.collect(offloaded, &mut found)?;
        }
        self.collect(raw_path, &mut found)?;

        let mut movies: Vec<Movie> = found.into_values().collect();
        // Oldest first; ties broken by path so the listing is stable.
        movies.sort_by(|a, b| a.modified.cmp(&b.modified).then_with(|| a.rel.cmp(&b.rel)));
        Ok(movies)
    }

    fn collect(&self, root: &Path, found: &mut BTreeMap<PathBuf, Movie>) -> Result<()> {
        for entry in WalkDir::new(root).follow_links(true) {
            let entry = entry.map_err(|e| SessionsError::Parse(e.to_string()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let is_movie = entry
                .file_name()
                .to_str()
                .is_some_and(|n| n.ends_with(&self.movie_suffix));
            if !is_movie {
                continue;
            }
            let modified = entry
                .metadata()
                .map_err(|e| SessionsError::Parse(e.to_string()))?
                .modified()?;
            let path = entry.into_path();
            let rel = path.strip_prefix(root).unwrap_or(&path).to_path_buf();
            found.insert(
                rel.clone(),
                Movie {
                    rel,
                    path,
                    modified,
                },
            );
        }
        Ok(())
    }
}

struct Movie {
    rel: PathBuf,
    path: PathBuf,
    modified: SystemTime,
}

impl RawParser for EpuScanner {
    fn parse(&self, raw_path: &Path, opts: &ParseOptions) -> Result<RawInfo> {
        if !raw_path.is_dir() {
            return Err(SessionsError::InputMissing(raw_path.to_path_buf()));
        }
        let movies = self.movies(raw_path, opts.offload_folder.as_deref())?;

        let mut info = RawInfo {
            path: Some(raw_path.display().to_string()),
            movies: movies.len() as u64,
            ..RawInfo::default()
        };
        if let Some(newest) = movies.last() {
            info.last_movie = Some(newest.rel.display().to_string());
            info.last_movie_creation = Some(format_stamp(DateTime::<Local>::from(newest.modified)));
        }

        if let Some(backup) = &opts.backup_folder {
            crate::io::ensure_dir(backup)?;
        }
        if let Some(star) = &opts.output_star {
            atomic_write(star, movies_star(raw_path, &movies).as_bytes())?;
        }
        Ok(info)
    }
}

/// STAR table listing every movie. Movies still in the raw folder are
/// relative to it; offloaded ones keep their absolute path.
fn movies_star(raw_path: &Path, movies: &[Movie]) -> String {
    let mut out = String::from("\ndata_Movies\n\nloop_\n_rlnMicrographMovieName #1\n");
    for movie in movies {
        let name = movie.path.strip_prefix(raw_path).unwrap_or(&movie.path);
        out.push_str(&name.display().to_string());
        out.push('\n');
    }
    out
}
