#![forbid(unsafe_code)]

//! Static quality catalog offered to clients.
//!
//! The catalog is a list of recommended yt-dlp format selectors, not a list of
//! formats the source is known to carry. Each video selector falls back on its
//! own (`bestvideo[height<=h]+bestaudio` first, then `best[height<=h]`), so
//! availability is settled by the engine at download time.

use serde::Serialize;
use std::collections::HashSet;

/// Heights offered to clients, highest first.
pub const TARGET_HEIGHTS: [u32; 6] = [1080, 720, 480, 360, 240, 144];

/// Selector that routes a download through mp3 extraction.
pub const AUDIO_SELECTOR: &str = "bestaudio";

pub const VIDEO_EXTENSION: &str = "mp4";
pub const AUDIO_EXTENSION: &str = "mp3";

#[derive(Clone, Copy, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FormatKind {
    Video,
    Audio,
}

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct FormatOption {
    #[serde(rename = "id")]
    pub selector: String,
    pub label: String,
    #[serde(rename = "ext")]
    pub extension: String,
    #[serde(rename = "type")]
    pub kind: FormatKind,
}

impl FormatOption {
    fn video(height: u32) -> Self {
        Self {
            selector: video_selector(height),
            label: format!("{height}p"),
            extension: VIDEO_EXTENSION.to_string(),
            kind: FormatKind::Video,
        }
    }

    fn audio() -> Self {
        Self {
            selector: AUDIO_SELECTOR.to_string(),
            label: "MP3 (audio only)".to_string(),
            extension: AUDIO_EXTENSION.to_string(),
            kind: FormatKind::Audio,
        }
    }
}

/// Merged video+audio capped at `height`, or the best single file at that cap.
pub fn video_selector(height: u32) -> String {
    format!("bestvideo[height<={height}]+bestaudio/best[height<={height}]")
}

/// Builds the catalog: one entry per target height, then the audio entry.
pub fn format_catalog() -> Vec<FormatOption> {
    let options = TARGET_HEIGHTS
        .iter()
        .copied()
        .map(FormatOption::video)
        .chain(std::iter::once(FormatOption::audio()));
    dedupe_by_selector(options)
}

fn dedupe_by_selector(options: impl IntoIterator<Item = FormatOption>) -> Vec<FormatOption> {
    let mut seen = HashSet::new();
    options
        .into_iter()
        .filter(|option| seen.insert(option.selector.clone()))
        .collect()
}
