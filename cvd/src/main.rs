//! The cvd daemon binary.

#![allow(clippy::missing_docs_in_private_items)]

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use cvd::config::Config;
use cvd::registry::Registry;
use cvd::server;

#[derive(Parser)]
#[command(name = "cvd", version, about = "Container daemon for the chef toolchain")]
struct Cli {
    /// Configuration file; a platform default is written when missing.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory for per-container staging state.
    #[arg(long)]
    runtime_root: Option<PathBuf>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let config_path = match cli.config {
        Some(p) => p,
        None => dirs::config_dir()
            .context("no configuration directory for this platform")?
            .join("chef")
            .join("cvd.json"),
    };
    let config = Config::load_or_init(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;

    let runtime_root = match cli.runtime_root {
        Some(p) => p,
        None => dirs::data_local_dir()
            .context("no data directory for this platform")?
            .join("chef")
            .join("cvd"),
    };
    std::fs::create_dir_all(&runtime_root)
        .with_context(|| format!("creating {}", runtime_root.display()))?;

    let shutdown = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&shutdown))
        .context("installing SIGINT handler")?;
    #[cfg(unix)]
    signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&shutdown))
        .context("installing SIGTERM handler")?;

    let listener = server::bind(&config.api_address).context("binding API socket")?;

    run(&config, runtime_root, listener, &shutdown)
}

#[cfg(target_os = "linux")]
fn run(
    config: &Config,
    runtime_root: PathBuf,
    listener: server::Listener,
    shutdown: &AtomicBool,
) -> Result<()> {
    use containerv::backend::linux::LinuxBackend;
    use containerv::bpf::BpfManager;

    let bpf = Arc::new(BpfManager::init());
    let backend = LinuxBackend::new(Arc::clone(&bpf));
    let mut registry = Registry::new(backend, runtime_root).with_security(
        config.security.default_policy.clone(),
        config.custom_path_rules().context("security.custom_paths")?,
    );

    server::serve(&listener, &mut registry, shutdown).context("serving")?;
    registry.shutdown();
    info!("exiting");
    Ok(())
}

#[cfg(windows)]
fn run(
    config: &Config,
    runtime_root: PathBuf,
    listener: server::Listener,
    shutdown: &AtomicBool,
) -> Result<()> {
    use containerv::backend::windows::{GuestConfig, HcsBackend};

    let backend = HcsBackend::new(GuestConfig::default())?;
    let mut registry = Registry::new(backend, runtime_root).with_security(
        config.security.default_policy.clone(),
        config.custom_path_rules().context("security.custom_paths")?,
    );

    server::serve(&listener, &mut registry, shutdown).context("serving")?;
    registry.shutdown();
    info!("exiting");
    Ok(())
}

#[cfg(not(any(target_os = "linux", windows)))]
fn run(
    _config: &Config,
    _runtime_root: PathBuf,
    _listener: server::Listener,
    _shutdown: &AtomicBool,
) -> Result<()> {
    anyhow::bail!("no container backend for this platform")
}
