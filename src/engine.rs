#![forbid(unsafe_code)]

//! The extraction engine seam.
//!
//! Everything that touches the network or a transcoder goes through
//! [`MediaEngine`]. Production uses [`YtDlpEngine`], which drives the `yt-dlp`
//! executable and lets its post-processors call ffmpeg. Tests swap in fakes.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use thiserror::Error;
use tracing::debug;

use crate::formats::{AUDIO_EXTENSION, AUDIO_SELECTOR, VIDEO_EXTENSION};

/// Bitrate handed to the mp3 extraction step.
pub const AUDIO_QUALITY: &str = "192K";

/// Output template, relative to the scratch directory.
pub const OUTPUT_TEMPLATE: &str = "%(title)s.%(ext)s";

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("could not launch {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    /// Non-zero exit; the message is the engine's own error text.
    #[error("{0}")]
    Failed(String),
    #[error("unreadable engine output: {0}")]
    InvalidOutput(#[from] serde_json::Error),
}

/// The subset of yt-dlp's info dict this service reads. Every field is
/// optional because extractors disagree on what they fill in.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct MediaMetadata {
    pub title: Option<String>,
    pub uploader: Option<String>,
    /// Kept as a raw JSON number; extractors report both ints and floats.
    pub duration: Option<serde_json::Number>,
    pub thumbnail: Option<String>,
    pub webpage_url: Option<String>,
    /// Filename the engine prepared from the output template.
    #[serde(rename = "_filename")]
    pub prepared_filename: Option<String>,
    pub filename: Option<String>,
}

impl MediaMetadata {
    pub fn predicted_filename(&self) -> Option<&str> {
        self.prepared_filename
            .as_deref()
            .or(self.filename.as_deref())
    }
}

/// Which post-processing chain a download goes through.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TranscodeTarget {
    /// Best audio stream, extracted to mp3.
    Audio,
    /// Caller's selector, merged and converted to mp4.
    Video,
}

impl TranscodeTarget {
    pub fn extension(self) -> &'static str {
        match self {
            Self::Audio => AUDIO_EXTENSION,
            Self::Video => VIDEO_EXTENSION,
        }
    }

    /// Audio wins when the caller asks for it or passes the audio selector.
    pub fn choose(selector: &str, audio_only: bool) -> Self {
        if audio_only || selector == AUDIO_SELECTOR {
            Self::Audio
        } else {
            Self::Video
        }
    }
}

#[derive(Clone, Debug)]
pub struct DownloadOptions {
    pub selector: String,
    pub output_dir: PathBuf,
    pub target: TranscodeTarget,
    pub ffmpeg_location: String,
}

impl DownloadOptions {
    /// Forces the audio selector for audio targets.
    pub fn new(
        selector: &str,
        target: TranscodeTarget,
        output_dir: &Path,
        ffmpeg_location: &str,
    ) -> Self {
        let selector = match target {
            TranscodeTarget::Audio => AUDIO_SELECTOR.to_string(),
            TranscodeTarget::Video => selector.to_string(),
        };
        Self {
            selector,
            output_dir: output_dir.to_path_buf(),
            target,
            ffmpeg_location: ffmpeg_location.to_string(),
        }
    }

    fn output_template(&self) -> PathBuf {
        self.output_dir.join(OUTPUT_TEMPLATE)
    }
}

/// What the engine reports back after a download.
#[derive(Clone, Debug, Default)]
pub struct DownloadedMedia {
    /// Path predicted from the template, before post-processing renamed it.
    pub predicted_path: Option<PathBuf>,
    pub title: Option<String>,
}

pub trait MediaEngine: Send + Sync {
    /// Metadata only, nothing is written to disk.
    fn resolve_metadata(&self, url: &str) -> Result<MediaMetadata, EngineError>;

    /// Downloads and post-processes `url` into `options.output_dir`.
    fn download_and_transcode(
        &self,
        url: &str,
        options: &DownloadOptions,
    ) -> Result<DownloadedMedia, EngineError>;
}

#[derive(Clone, Debug)]
pub struct YtDlpEngine {
    program: String,
}

impl YtDlpEngine {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Runs `<engine> --version`, used as a startup probe.
    pub fn version(&self) -> Result<String, EngineError> {
        let output = self.run(vec!["--version".to_string()])?;
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    fn run(&self, args: Vec<String>) -> Result<Output, EngineError> {
        debug!(program = %self.program, ?args, "invoking extraction engine");
        let output = Command::new(&self.program)
            .args(&args)
            .output()
            .map_err(|source| EngineError::Spawn {
                program: self.program.clone(),
                source,
            })?;
        if !output.status.success() {
            let message = engine_error_message(&output.stderr)
                .unwrap_or_else(|| format!("{} exited with {}", self.program, output.status));
            return Err(EngineError::Failed(message));
        }
        Ok(output)
    }
}

impl MediaEngine for YtDlpEngine {
    fn resolve_metadata(&self, url: &str) -> Result<MediaMetadata, EngineError> {
        let output = self.run(metadata_args(url))?;
        Ok(serde_json::from_slice(&output.stdout)?)
    }

    fn download_and_transcode(
        &self,
        url: &str,
        options: &DownloadOptions,
    ) -> Result<DownloadedMedia, EngineError> {
        let output = self.run(download_args(url, options))?;
        let info: MediaMetadata = serde_json::from_slice(&output.stdout)?;
        Ok(DownloadedMedia {
            predicted_path: info.predicted_filename().map(PathBuf::from),
            title: info.title,
        })
    }
}

fn metadata_args(url: &str) -> Vec<String> {
    [
        "--dump-single-json",
        "--skip-download",
        "--quiet",
        "--no-warnings",
        "--",
        url,
    ]
    .into_iter()
    .map(str::to_string)
    .collect()
}

/// `--dump-single-json --no-simulate` downloads and still prints the info
/// dict, which carries the prepared `_filename`.
fn download_args(url: &str, options: &DownloadOptions) -> Vec<String> {
    let mut args = vec![
        "--dump-single-json".to_string(),
        "--no-simulate".to_string(),
        "--quiet".to_string(),
        "--no-warnings".to_string(),
        "--no-progress".to_string(),
        "--no-playlist".to_string(),
        "--format".to_string(),
        options.selector.clone(),
        "--output".to_string(),
        options.output_template().to_string_lossy().into_owned(),
        "--merge-output-format".to_string(),
        VIDEO_EXTENSION.to_string(),
        "--ffmpeg-location".to_string(),
        options.ffmpeg_location.clone(),
    ];
    match options.target {
        TranscodeTarget::Audio => args.extend(
            [
                "--extract-audio",
                "--audio-format",
                AUDIO_EXTENSION,
                "--audio-quality",
                AUDIO_QUALITY,
            ]
            .map(str::to_string),
        ),
        TranscodeTarget::Video => {
            args.extend(["--recode-video", VIDEO_EXTENSION].map(str::to_string))
        }
    }
    args.push("--".to_string());
    args.push(url.to_string());
    args
}

/// yt-dlp prints its `ERROR: ...` line last; earlier lines are noise.
fn engine_error_message(stderr: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(stderr);
    let lines = text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>();
    lines
        .iter()
        .rev()
        .find(|line| line.starts_with("ERROR:"))
        .or_else(|| lines.last())
        .map(|line| line.to_string())
}


#[cfg(test)]
mod tests {
    use super::*;
    #[cfg(unix)]
    use std::os::unix::fs::PermissionsExt;
    use std::fs;
    use tempfile::tempdir;

    fn options(target: TranscodeTarget) -> DownloadOptions {
        DownloadOptions::new(
            "bestvideo[height<=480]+bestaudio/best[height<=480]",
            target,
            Path::new("/tmp/ydl_test"),
            "/opt/ffmpeg",
        )
    }

    fn arg_after<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
        args.iter()
            .position(|arg| arg == flag)
            .and_then(|index| args.get(index + 1))
            .map(String::as_str)
    }

    #[test]
    fn choose_prefers_audio_for_sentinel_or_flag() {
        assert_eq!(
            TranscodeTarget::choose("bestaudio", false),
            TranscodeTarget::Audio
        );
        assert_eq!(
            TranscodeTarget::choose("best[height<=720]", true),
            TranscodeTarget::Audio
        );
        assert_eq!(
            TranscodeTarget::choose("best[height<=720]", false),
            TranscodeTarget::Video
        );
    }

    #[test]
    fn audio_options_force_best_audio() {
        let options = options(TranscodeTarget::Audio);
        assert_eq!(options.selector, "bestaudio");
    }

    #[test]
    fn download_args_for_video_recode_to_mp4() {
        let args = download_args("https://example.test/v", &options(TranscodeTarget::Video));
        assert_eq!(
            arg_after(&args, "--format"),
            Some("bestvideo[height<=480]+bestaudio/best[height<=480]")
        );
        assert_eq!(
            arg_after(&args, "--output"),
            Some("/tmp/ydl_test/%(title)s.%(ext)s")
        );
        assert_eq!(arg_after(&args, "--merge-output-format"), Some("mp4"));
        assert_eq!(arg_after(&args, "--recode-video"), Some("mp4"));
        assert_eq!(arg_after(&args, "--ffmpeg-location"), Some("/opt/ffmpeg"));
        assert!(args.contains(&"--no-playlist".to_string()));
        assert!(!args.contains(&"--extract-audio".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("https://example.test/v"));
    }

    #[test]
    fn download_args_for_audio_extract_mp3() {
        let args = download_args("https://example.test/v", &options(TranscodeTarget::Audio));
        assert_eq!(arg_after(&args, "--format"), Some("bestaudio"));
        assert!(args.contains(&"--extract-audio".to_string()));
        assert_eq!(arg_after(&args, "--audio-format"), Some("mp3"));
        assert_eq!(arg_after(&args, "--audio-quality"), Some("192K"));
        assert!(!args.contains(&"--recode-video".to_string()));
    }

    #[test]
    fn url_is_never_parsed_as_a_flag() {
        let args = metadata_args("--exec=rm");
        let separator = args.iter().position(|arg| arg == "--").unwrap();
        assert_eq!(args[separator + 1], "--exec=rm");
        assert!(args.contains(&"--skip-download".to_string()));
    }

    #[test]
    fn error_message_prefers_error_line() {
        let stderr = b"WARNING: something odd\nERROR: [generic] Unable to download webpage\n\n";
        assert_eq!(
            engine_error_message(stderr).as_deref(),
            Some("ERROR: [generic] Unable to download webpage")
        );
        assert_eq!(
            engine_error_message(b"plain failure\n").as_deref(),
            Some("plain failure")
        );
        assert_eq!(engine_error_message(b"  \n"), None);
    }

    #[test]
    fn metadata_accepts_float_duration_and_missing_fields() {
        let info: MediaMetadata =
            serde_json::from_str(r#"{"title":"T","duration":12.5,"_filename":"/x/T.webm"}"#)
                .unwrap();
        assert_eq!(info.duration.as_ref().and_then(|d| d.as_f64()), Some(12.5));
        assert_eq!(info.predicted_filename(), Some("/x/T.webm"));
        assert!(info.uploader.is_none());
    }

    #[test]
    fn predicted_filename_accepts_both_keys() {
        let both: MediaMetadata =
            serde_json::from_str(r#"{"_filename":"/x/a.webm","filename":"/x/b.webm"}"#).unwrap();
        assert_eq!(both.predicted_filename(), Some("/x/a.webm"));
        let public_only: MediaMetadata =
            serde_json::from_str(r#"{"filename":"/x/b.webm"}"#).unwrap();
        assert_eq!(public_only.predicted_filename(), Some("/x/b.webm"));
    }

    #[test]
    fn missing_program_is_a_spawn_error() {
        let engine = YtDlpEngine::new("/nonexistent/yt-dlp-binary");
        let err = engine.resolve_metadata("https://example.test").unwrap_err();
        assert!(matches!(err, EngineError::Spawn { .. }));
    }

    #[cfg(unix)]
    fn install_ytdlp_stub(dir: &Path) -> PathBuf {
        let script_path = dir.join("yt-dlp");
        let script = r#"#!/usr/bin/env bash
set -eu
args=("$@")
output=""
url=""
while [[ $# -gt 0 ]]; do
  case "$1" in
    --output)
      shift
      output="$1"
      ;;
    --)
      shift
      url="$1"
      ;;
  esac
  shift
done

if [[ "$url" == *unreachable* ]]; then
  echo "WARNING: retrying" >&2
  echo "ERROR: [generic] Unable to download webpage: unreachable" >&2
  exit 1
fi

if printf '%s\n' "${args[@]}" | grep -q -- '^--version$'; then
  echo "2024.01.01"
  exit 0
fi

if printf '%s\n' "${args[@]}" | grep -q -- '^--skip-download$'; then
  printf '{"title":"My Clip","uploader":"Someone","duration":125,"thumbnail":null,"webpage_url":"%s"}\n' "$url"
  exit 0
fi

predicted="${output//%(title)s/My Clip}"
predicted="${predicted//%(ext)s/webm}"
final="${predicted%.webm}.mp4"
if printf '%s\n' "${args[@]}" | grep -q -- '^--extract-audio$'; then
  final="${predicted%.webm}.mp3"
fi
echo "media" > "$final"
printf '{"title":"My Clip","_filename":"%s"}\n' "$predicted"
"#;
        fs::write(&script_path, script).unwrap();
        let mut perms = fs::metadata(&script_path).unwrap().permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&script_path, perms).unwrap();
        script_path
    }

    #[cfg(unix)]
    #[test]
    fn stub_engine_reports_metadata_and_version() {
        let dir = tempdir().unwrap();
        let engine = YtDlpEngine::new(install_ytdlp_stub(dir.path()).to_string_lossy());
        assert_eq!(engine.version().unwrap(), "2024.01.01");

        let info = engine
            .resolve_metadata("https://example.test/watch?v=abc")
            .unwrap();
        assert_eq!(info.title.as_deref(), Some("My Clip"));
        assert_eq!(info.uploader.as_deref(), Some("Someone"));
        assert_eq!(info.duration.unwrap().as_u64(), Some(125));
        assert!(info.thumbnail.is_none());
        assert_eq!(
            info.webpage_url.as_deref(),
            Some("https://example.test/watch?v=abc")
        );
    }

    #[cfg(unix)]
    #[test]
    fn stub_engine_downloads_into_output_dir() {
        let dir = tempdir().unwrap();
        let scratch = tempdir().unwrap();
        let engine = YtDlpEngine::new(install_ytdlp_stub(dir.path()).to_string_lossy());
        let options = DownloadOptions::new(
            "bestaudio",
            TranscodeTarget::Audio,
            scratch.path(),
            "ffmpeg",
        );

        let media = engine
            .download_and_transcode("https://example.test/watch?v=abc", &options)
            .unwrap();
        assert_eq!(media.title.as_deref(), Some("My Clip"));
        assert_eq!(
            media.predicted_path,
            Some(scratch.path().join("My Clip.webm"))
        );
        assert!(scratch.path().join("My Clip.mp3").exists());
    }

    #[cfg(unix)]
    #[test]
    fn stub_engine_failure_carries_error_line() {
        let dir = tempdir().unwrap();
        let engine = YtDlpEngine::new(install_ytdlp_stub(dir.path()).to_string_lossy());
        let err = engine
            .resolve_metadata("https://unreachable.test/")
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "ERROR: [generic] Unable to download webpage: unreachable"
        );
    }
}
