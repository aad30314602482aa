#![forbid(unsafe_code)]

//! Entry point for the clipfetch HTTP service.
//!
//! Configuration comes from flags, then the environment, then `.env`. The
//! server never downloads anything on its own; every engine call is driven by
//! a request.

use std::{
    net::{IpAddr, SocketAddr},
    path::PathBuf,
    sync::Arc,
};

use anyhow::{Context, Result, anyhow};
use clipfetch::api::{AppState, router};
use clipfetch::config::{ConfigOverrides, ServiceConfig, resolve_service_config};
use clipfetch::download::Orchestrator;
use clipfetch::engine::YtDlpEngine;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone)]
struct ServerArgs {
    config: ServiceConfig,
    listen_host: IpAddr,
}

impl ServerArgs {
    fn parse() -> Result<Self> {
        Self::from_iter(std::env::args().skip(1))
    }

    fn from_iter<I>(iter: I) -> Result<Self>
    where
        I: IntoIterator<Item = String>,
    {
        let mut overrides = ConfigOverrides::default();
        let mut args = iter.into_iter();
        while let Some(arg) = args.next() {
            let (flag, inline) = match arg.split_once('=') {
                Some((flag, value)) if flag.starts_with("--") => {
                    (flag.to_string(), Some(value.to_string()))
                }
                _ => (arg.clone(), None),
            };
            let mut value = || {
                inline
                    .clone()
                    .or_else(|| args.next())
                    .ok_or_else(|| anyhow!("{flag} requires a value"))
            };
            match flag.as_str() {
                "--host" => overrides.host = Some(value()?),
                "--port" => overrides.port = Some(parse_port_arg(&value()?)?),
                "--ffmpeg" => overrides.ffmpeg_path = Some(value()?),
                "--yt-dlp" => overrides.ytdlp_path = Some(value()?),
                "--scratch-root" => overrides.scratch_root = Some(PathBuf::from(value()?)),
                "--env-file" => overrides.env_path = Some(PathBuf::from(value()?)),
                _ => return Err(anyhow!("unknown argument: {arg}")),
            }
        }

        let config = resolve_service_config(overrides)?;
        let listen_host = parse_host_arg(&config.host)?;
        Ok(Self {
            config,
            listen_host,
        })
    }
}

fn parse_port_arg(value: &str) -> Result<u16> {
    value
        .parse::<u16>()
        .context("expected a numeric port between 0 and 65535")
}

fn parse_host_arg(value: &str) -> Result<IpAddr> {
    value
        .parse::<IpAddr>()
        .context("expected a valid IPv4 or IPv6 address for --host/HOST")
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let ServerArgs {
        config,
        listen_host,
    } = ServerArgs::parse()?;

    let engine = YtDlpEngine::new(config.ytdlp_path.clone());
    let probe = engine.clone();
    match tokio::task::spawn_blocking(move || probe.version()).await {
        Ok(Ok(version)) => info!(engine = %engine.program(), %version, "extraction engine found"),
        Ok(Err(err)) => warn!(engine = %engine.program(), error = %err, "extraction engine unavailable"),
        Err(err) => warn!(error = %err, "engine probe did not finish"),
    }

    let orchestrator = Orchestrator::new(Arc::new(engine), &config);
    let app = router(AppState::new(orchestrator));

    let addr = SocketAddr::new(listen_host, config.port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {}", addr))?;
    info!(
        %addr,
        ffmpeg = %config.ffmpeg_path,
        scratch_root = %config.scratch_root.display(),
        "clipfetch listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running HTTP server")?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = signal::ctrl_c().await {
        warn!(error = %err, "failed to install Ctrl+C handler");
    }
}
