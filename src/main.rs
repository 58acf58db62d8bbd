use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use clap::Parser;
use tokio::runtime::Handle;
use tracing::info;
use tracing_subscriber::EnvFilter;

pub mod download;
pub mod error;
pub mod host;
pub mod instance;
pub mod models;
pub mod orchestrator;
pub mod providers;

use crate::error::LaunchError;
use crate::instance::LaunchInstance;
use crate::models::configuration::{
    CACHE_LOCATION, LauncherConfig, WindowType, default_platform, parse_int_pair, read_yaml_file,
    tile_windows,
};
use crate::orchestrator::Orchestrator;
use crate::providers::http_transport::HttpTransport;

#[derive(Parser, Debug)]
#[command(name = "launcher")]
#[command(version)]
#[command(about = "Fetches the packages each instance needs, then runs it.")]
struct Cli {
    /// Base URL of the default package host
    #[arg(short = 'u', long, env = "LAUNCHER_HOST_URL")]
    host_url: Option<String>,

    /// Platform to request packages for, e.g. linux_amd64
    #[arg(short = 'p', long)]
    platform: Option<String>,

    /// Download contents files again even when a cached copy exists
    #[arg(short = 'f', long)]
    force_refresh: bool,

    /// Write the log to this file instead of stderr
    #[arg(short = 'l', long)]
    log: Option<PathBuf>,

    #[arg(short = 't', long, value_enum, default_value_t = WindowType::Toplevel)]
    window_type: WindowType,

    /// Window size as W,H
    #[arg(short = 's', long, value_parser = parse_int_pair, allow_hyphen_values = true)]
    size: Option<(i32, i32)>,

    /// Window origin as X,Y
    #[arg(short = 'o', long, value_parser = parse_int_pair, allow_hyphen_values = true)]
    origin: Option<(i32, i32)>,

    /// Where hosts and packages are cached
    #[arg(long, default_value = CACHE_LOCATION)]
    root: String,

    /// How many mirrors to try before the host itself
    #[arg(long, default_value_t = 2)]
    max_mirrors: usize,

    /// Milliseconds to sleep when a tick finds nothing to do
    #[arg(long, default_value_t = 5)]
    idle_ms: u64,

    /// Instance manifests, one instance each
    #[arg(required = true)]
    manifests: Vec<PathBuf>,
}

impl Cli {
    fn config(&self) -> LauncherConfig {
        LauncherConfig {
            root_dir: PathBuf::from(shellexpand::tilde(&self.root).as_ref()),
            host_url: self.host_url.clone(),
            platform: self.platform.clone().unwrap_or_else(default_platform),
            force_refresh: self.force_refresh,
            max_mirrors: self.max_mirrors,
            idle_interval: Duration::from_millis(self.idle_ms),
        }
    }
}

fn init_tracing(log: Option<&Path>) -> Result<(), LaunchError> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,hyper=warn,reqwest=warn"));

    match log {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|source| LaunchError::Log {
                    path: path.to_path_buf(),
                    source,
                })?;
            let _ = tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .try_init();
        }
        None => {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .try_init();
        }
    }
    Ok(())
}

/// Relative paths inside a manifest are relative to the manifest itself.
fn manifest_dir(path: &Path) -> PathBuf {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    init_tracing(cli.log.as_deref())?;

    let config = cli.config();
    info!(
        root = %config.root_dir.display(),
        platform = %config.platform,
        host = ?config.host_url,
        "starting"
    );

    let placements = tile_windows(
        cli.window_type,
        cli.origin.unwrap_or((0, 0)),
        cli.size.unwrap_or((0, 0)),
        cli.manifests.len(),
    );
    let transport = HttpTransport::new(Handle::current())?;
    let mut orchestrator =
        Orchestrator::new(config.clone(), Box::new(transport), Handle::current());

    for (path, placement) in cli.manifests.iter().zip(placements) {
        let manifest = read_yaml_file(path).await?;
        let instance = LaunchInstance::new(
            manifest,
            &manifest_dir(path),
            config.host_url.as_deref(),
            placement,
            Handle::current(),
        )?;
        orchestrator.add_instance(Box::new(instance));
    }

    orchestrator.run().await;
    Ok(())
}
