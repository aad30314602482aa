#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use std::{
    collections::HashMap,
    env, fs,
    path::{Path, PathBuf},
};

pub const DEFAULT_ENV_PATH: &str = ".env";
pub const DEFAULT_PORT: u16 = 5000;
pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_FFMPEG_PATH: &str = "ffmpeg";
pub const DEFAULT_YTDLP_PATH: &str = "yt-dlp";

/// Everything the service needs to know about its host, resolved once at
/// startup and handed to the engine and router explicitly.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Transcoder binary handed to the engine's post-processors.
    pub ffmpeg_path: String,
    /// Extraction engine executable.
    pub ytdlp_path: String,
    /// Parent directory for per-request scratch directories.
    pub scratch_root: PathBuf,
    pub host: String,
    pub port: u16,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: DEFAULT_FFMPEG_PATH.to_string(),
            ytdlp_path: DEFAULT_YTDLP_PATH.to_string(),
            scratch_root: env::temp_dir(),
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub ffmpeg_path: Option<String>,
    pub ytdlp_path: Option<String>,
    pub scratch_root: Option<PathBuf>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub env_path: Option<PathBuf>,
}

pub fn resolve_service_config(overrides: ConfigOverrides) -> Result<ServiceConfig> {
    let env_path = overrides
        .env_path
        .as_deref()
        .unwrap_or_else(|| Path::new(DEFAULT_ENV_PATH));
    let file_vars = read_env_file(env_path)?;
    Ok(build_service_config_with_overrides(
        &file_vars,
        env_var_string,
        overrides,
    ))
}

#[cfg(test)]
fn build_service_config(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
) -> ServiceConfig {
    build_service_config_with_overrides(file_vars, env_lookup, ConfigOverrides::default())
}

fn build_service_config_with_overrides(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
    overrides: ConfigOverrides,
) -> ServiceConfig {
    let ffmpeg_path = non_blank(overrides.ffmpeg_path)
        .or_else(|| lookup_value("FFMPEG_PATH", file_vars, &env_lookup))
        .unwrap_or_else(|| DEFAULT_FFMPEG_PATH.to_string());
    let ytdlp_path = non_blank(overrides.ytdlp_path)
        .or_else(|| lookup_value("YTDLP_PATH", file_vars, &env_lookup))
        .unwrap_or_else(|| DEFAULT_YTDLP_PATH.to_string());
    let scratch_root = overrides
        .scratch_root
        .or_else(|| lookup_value("SCRATCH_ROOT", file_vars, &env_lookup).map(PathBuf::from))
        .unwrap_or_else(env::temp_dir);
    let host = non_blank(overrides.host)
        .or_else(|| lookup_value("HOST", file_vars, &env_lookup))
        .unwrap_or_else(|| DEFAULT_HOST.to_string());
    let port = overrides
        .port
        .or_else(|| {
            lookup_value("PORT", file_vars, &env_lookup).and_then(|value| value.parse::<u16>().ok())
        })
        .unwrap_or(DEFAULT_PORT);

    ServiceConfig {
        ffmpeg_path,
        ytdlp_path,
        scratch_root,
        host,
        port,
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn env_var_string(key: &str) -> Option<String> {
    non_blank(env::var(key).ok())
}

fn lookup_value(
    key: &str,
    file_vars: &HashMap<String, String>,
    env_lookup: &impl Fn(&str) -> Option<String>,
) -> Option<String> {
    env_lookup(key).or_else(|| non_blank(file_vars.get(key).cloned()))
}

pub fn read_env_file(path: &Path) -> Result<HashMap<String, String>> {
    let mut vars = HashMap::new();
    if !path.exists() {
        return Ok(vars);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let line = trimmed.strip_prefix("export ").unwrap_or(trimmed);
        let Some((key, value_raw)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let value = value_raw.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|value| value.strip_suffix('"'))
            .or_else(|| {
                value
                    .strip_prefix('\'')
                    .and_then(|value| value.strip_suffix('\''))
            })
            .unwrap_or(value);
        vars.insert(key.to_string(), value.to_string());
    }
    Ok(vars)
}
