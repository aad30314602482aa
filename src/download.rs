#![forbid(unsafe_code)]

//! Info lookups and the download-then-serve flow.
//!
//! A download owns a [`ScratchDir`] from the moment it starts until the
//! response body built from it is dropped. Nothing else deletes it.

use serde::Serialize;
use std::{
    fs, io,
    path::{Path, PathBuf},
    sync::Arc,
};
use tempfile::TempDir;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::config::ServiceConfig;
use crate::engine::{DownloadOptions, MediaEngine, TranscodeTarget};
use crate::error::FetchError;
use crate::formats::{FormatOption, format_catalog};

pub const SCRATCH_PREFIX: &str = "ydl_";
pub const MAX_FILENAME_CHARS: usize = 200;
pub const FALLBACK_FILENAME: &str = "video";

/// Characters that break paths or header quoting on at least one platform.
const UNSAFE_FILENAME_CHARS: [char; 9] = ['\\', '/', '*', '?', ':', '"', '<', '>', '|'];

/// Response payload for `/fetch_info`.
#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct MediaInfo {
    pub title: Option<String>,
    pub uploader: Option<String>,
    pub duration: Option<serde_json::Number>,
    pub thumbnail: Option<String>,
    pub webpage_url: Option<String>,
    pub formats: Vec<FormatOption>,
}

#[derive(Clone, Debug, Default)]
pub struct DownloadRequest {
    pub url: Option<String>,
    pub selector: Option<String>,
    pub filename: Option<String>,
    pub audio_only: bool,
}

/// Per-request temporary directory, removed on drop. Removal errors are
/// logged and otherwise ignored.
#[derive(Debug)]
pub struct ScratchDir {
    path: PathBuf,
    dir: Option<TempDir>,
}

impl ScratchDir {
    pub fn create_in(root: &Path) -> io::Result<Self> {
        fs::create_dir_all(root)?;
        let dir = tempfile::Builder::new()
            .prefix(SCRATCH_PREFIX)
            .tempdir_in(root)?;
        Ok(Self {
            path: dir.path().to_path_buf(),
            dir: Some(dir),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        if let Some(dir) = self.dir.take()
            && let Err(err) = dir.close()
        {
            debug!(path = %self.path.display(), error = %err, "scratch directory not removed");
        }
    }
}

/// A finished download waiting to be streamed. Dropping it removes the
/// scratch directory, so keep it alive until the body is done.
#[derive(Debug)]
pub struct PreparedDownload {
    pub path: PathBuf,
    pub filename: String,
    pub target: TranscodeTarget,
    scratch: ScratchDir,
}

impl PreparedDownload {
    pub fn scratch_path(&self) -> &Path {
        self.scratch.path()
    }
}

/// Runs info lookups and downloads against one engine.
#[derive(Clone)]
pub struct Orchestrator {
    engine: Arc<dyn MediaEngine>,
    ffmpeg_path: String,
    scratch_root: PathBuf,
}

impl Orchestrator {
    pub fn new(engine: Arc<dyn MediaEngine>, config: &ServiceConfig) -> Self {
        Self {
            engine,
            ffmpeg_path: config.ffmpeg_path.clone(),
            scratch_root: config.scratch_root.clone(),
        }
    }

    pub fn ffmpeg_path(&self) -> &str {
        &self.ffmpeg_path
    }

    /// Metadata plus the static format catalog. Blocks on the engine.
    pub fn resolve_info(&self, url: Option<&str>) -> Result<MediaInfo, FetchError> {
        let url = non_empty(url)
            .ok_or_else(|| FetchError::Validation("Missing 'url' parameter".to_string()))?;
        let info = self.engine.resolve_metadata(url).map_err(|err| {
            warn!(url, error = %err, "metadata lookup failed");
            FetchError::Extraction(err)
        })?;
        Ok(MediaInfo {
            title: info.title,
            uploader: info.uploader,
            duration: info.duration,
            thumbnail: info.thumbnail,
            webpage_url: info.webpage_url,
            formats: format_catalog(),
        })
    }

    /// Downloads into a fresh scratch directory and picks the file to serve.
    /// On error the scratch directory is already gone when this returns.
    pub fn prepare_download(
        &self,
        request: DownloadRequest,
    ) -> Result<PreparedDownload, FetchError> {
        let (Some(url), Some(selector)) = (
            non_empty(request.url.as_deref()),
            non_empty(request.selector.as_deref()),
        ) else {
            return Err(FetchError::Validation(
                "Missing 'url' or 'format_id' query parameters".to_string(),
            ));
        };

        let scratch = ScratchDir::create_in(&self.scratch_root).map_err(FetchError::Scratch)?;
        let target = TranscodeTarget::choose(selector, request.audio_only);
        let options = DownloadOptions::new(selector, target, scratch.path(), &self.ffmpeg_path);

        let media = self
            .engine
            .download_and_transcode(url, &options)
            .map_err(|err| {
                warn!(url, error = %err, "download failed");
                FetchError::Download(err)
            })?;

        let path = media
            .predicted_path
            .map(|predicted| expected_output_path(&predicted, target))
            .filter(|path| path.starts_with(scratch.path()) && path.is_file())
            .or_else(|| first_regular_file(scratch.path()))
            .ok_or(FetchError::FileNotFound)?;

        let base = non_empty(request.filename.as_deref()).or(non_empty(media.title.as_deref()));
        let filename = download_filename(base, target);
        debug!(path = %path.display(), %filename, "download ready");

        Ok(PreparedDownload {
            path,
            filename,
            target,
            scratch,
        })
    }
}

/// Post-processing rewrites the container, so the predicted extension is
/// replaced by the one the target produces.
pub fn expected_output_path(predicted: &Path, target: TranscodeTarget) -> PathBuf {
    let already_matches = predicted
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case(target.extension()));
    match target {
        TranscodeTarget::Video if already_matches => predicted.to_path_buf(),
        _ => predicted.with_extension(target.extension()),
    }
}

/// First regular file directly inside `dir`, by name.
fn first_regular_file(dir: &Path) -> Option<PathBuf> {
    WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_map(Result::ok)
        .find(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
}

/// Drops path-hostile and control characters, trims, and caps the length.
pub fn clean_filename(raw: &str) -> String {
    let stripped = raw
        .chars()
        .filter(|c| !UNSAFE_FILENAME_CHARS.contains(c) && !c.is_control())
        .collect::<String>();
    stripped.trim().chars().take(MAX_FILENAME_CHARS).collect()
}

/// Attachment name: cleaned base (or `video`) plus the target's extension.
pub fn download_filename(base: Option<&str>, target: TranscodeTarget) -> String {
    let cleaned = clean_filename(base.unwrap_or(FALLBACK_FILENAME));
    let stem = if cleaned.is_empty() {
        FALLBACK_FILENAME.to_string()
    } else {
        cleaned
    };
    format!("{stem}.{}", target.extension())
}

/// `1`, `true` and `yes` in any case.
pub fn is_truthy(value: &str) -> bool {
    matches!(
        value.to_ascii_lowercase().as_str(),
        "1" | "true" | "yes"
    )
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|value| !value.is_empty())
}
