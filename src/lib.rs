#![forbid(unsafe_code)]

//! HTTP facade over yt-dlp: look up media info, then download a chosen
//! quality and stream it back as an attachment.

pub mod api;
pub mod config;
pub mod download;
pub mod engine;
pub mod error;
pub mod formats;
