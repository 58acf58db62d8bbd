use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};

use bytes::Bytes;
use tokio::process::{Child, Command};
use tokio::runtime::Handle;
use tracing::{debug, error, info, warn};

use crate::download::{CorrelationId, FileSink};
use crate::error::{ArtifactError, LaunchError};
use crate::models::configuration::{InstanceManifest, WindowPlacement};
use crate::orchestrator::{Feed, FeedStatus, Instance, InstanceRequest, PackageRequest};

/// `LAUNCHER_PACKAGE_<NAME>` with the name upper-cased and everything but
/// ASCII alphanumerics replaced by `_`.
pub fn package_env_var(name: &str) -> String {
    let name: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
        .collect();
    format!("LAUNCHER_PACKAGE_{}", name)
}

/// An instance described by a manifest: fetches what it needs, then runs
/// its command and stops when the command exits.
pub struct LaunchInstance {
    name: String,
    base_dir: PathBuf,
    placement: WindowPlacement,
    command: Vec<String>,
    requests: VecDeque<InstanceRequest>,
    packages: BTreeMap<CorrelationId, String>,
    fetches: BTreeMap<CorrelationId, FileSink>,
    /// Finished transfers whose output is still being written.
    flushing: BTreeMap<CorrelationId, FileSink>,
    package_paths: BTreeMap<String, PathBuf>,
    child: Option<Child>,
    failed: bool,
    stopped: bool,
}

impl LaunchInstance {
    /// Relative fetch outputs and the command's working directory are
    /// resolved against `base_dir`. Outputs are written on `runtime`.
    pub fn new(
        manifest: InstanceManifest,
        base_dir: &Path,
        default_host: Option<&str>,
        placement: WindowPlacement,
        runtime: Handle,
    ) -> Result<Self, LaunchError> {
        let mut requests = VecDeque::new();
        let mut packages = BTreeMap::new();
        let mut fetches = BTreeMap::new();
        let mut correlation_id: CorrelationId = 0;

        for package in manifest.packages {
            let host_url = package
                .host
                .or_else(|| default_host.map(str::to_string))
                .ok_or_else(|| LaunchError::MissingHost {
                    package: package.name.clone(),
                })?;
            correlation_id += 1;
            packages.insert(correlation_id, package.name.clone());
            requests.push_back(InstanceRequest::FetchPackage(PackageRequest {
                host_url: Some(host_url),
                name: package.name,
                version: package.version,
                alt_host: package.alt_host,
                correlation_id,
            }));
        }

        for fetch in manifest.fetch {
            correlation_id += 1;
            fetches.insert(
                correlation_id,
                FileSink::new(runtime.clone(), base_dir.join(&fetch.output)),
            );
            requests.push_back(match fetch.post {
                Some(body) => InstanceRequest::PostUrl {
                    url: fetch.url,
                    body: Bytes::from(body),
                    correlation_id,
                },
                None => InstanceRequest::FetchUrl {
                    url: fetch.url,
                    correlation_id,
                },
            });
        }

        Ok(LaunchInstance {
            name: manifest.name,
            base_dir: base_dir.to_path_buf(),
            placement,
            command: manifest.command,
            requests,
            packages,
            fetches,
            flushing: BTreeMap::new(),
            package_paths: BTreeMap::new(),
            child: None,
            failed: false,
            stopped: false,
        })
    }

    fn stop(&mut self) -> Option<InstanceRequest> {
        self.stopped = true;
        Some(InstanceRequest::Stop)
    }

    fn poll_flushing(&mut self) {
        let mut written = Vec::new();
        for (correlation_id, sink) in self.flushing.iter_mut() {
            match sink.poll_flushed() {
                None => continue,
                Some(Ok(())) => {
                    info!(instance = %self.name, path = %sink.path().display(), "fetched");
                }
                Some(Err(e)) => {
                    error!(
                        instance = %self.name,
                        path = %sink.path().display(),
                        error = %e,
                        "failed to write fetched file"
                    );
                    self.failed = true;
                }
            }
            written.push(*correlation_id);
        }
        for correlation_id in written {
            self.flushing.remove(&correlation_id);
        }
    }

    fn spawn_command(&self) -> Result<Option<Child>, LaunchError> {
        let Some((program, args)) = self.command.split_first() else {
            return Ok(None);
        };
        let mut command = Command::new(program);
        command
            .args(args)
            .current_dir(&self.base_dir)
            .kill_on_drop(true)
            .env("LAUNCHER_INSTANCE", &self.name)
            .env("LAUNCHER_WINDOW_TYPE", self.placement.window_type.as_str())
            .env(
                "LAUNCHER_WINDOW_ORIGIN",
                format!("{},{}", self.placement.x, self.placement.y),
            )
            .env(
                "LAUNCHER_WINDOW_SIZE",
                format!("{},{}", self.placement.width, self.placement.height),
            );
        for (package, path) in &self.package_paths {
            command.env(package_env_var(package), path);
        }
        let child = command.spawn().map_err(|source| LaunchError::Spawn {
            program: program.clone(),
            source,
        })?;
        info!(instance = %self.name, program = %program, pid = ?child.id(), "command started");
        Ok(Some(child))
    }
}

impl Instance for LaunchInstance {
    fn name(&self) -> &str {
        &self.name
    }

    fn next_request(&mut self) -> Option<InstanceRequest> {
        if self.stopped {
            return None;
        }
        if let Some(request) = self.requests.pop_front() {
            return Some(request);
        }
        self.poll_flushing();
        if self.failed {
            warn!(instance = %self.name, "stopping after a failed download");
            return self.stop();
        }
        if !self.packages.is_empty() || !self.fetches.is_empty() || !self.flushing.is_empty() {
            return None;
        }

        match self.child.as_mut() {
            None => match self.spawn_command() {
                Ok(Some(child)) => {
                    self.child = Some(child);
                    None
                }
                Ok(None) => {
                    debug!(instance = %self.name, "nothing to run");
                    self.stop()
                }
                Err(e) => {
                    error!(instance = %self.name, error = %e, "failed to start command");
                    self.stop()
                }
            },
            Some(child) => match child.try_wait() {
                Ok(None) => None,
                Ok(Some(status)) => {
                    info!(instance = %self.name, %status, "command exited");
                    self.stop()
                }
                Err(e) => {
                    error!(instance = %self.name, error = %e, "failed to wait for command");
                    self.stop()
                }
            },
        }
    }

    fn feed(&mut self, feed: Feed<'_>) -> bool {
        let Some(sink) = self.fetches.get_mut(&feed.correlation_id) else {
            return false;
        };
        let reason = match feed.status {
            FeedStatus::InProgress => match sink.write(Bytes::copy_from_slice(feed.chunk)) {
                Ok(()) => return true,
                Err(e) => e.to_string(),
            },
            FeedStatus::Done => {
                sink.close();
                if let Some(sink) = self.fetches.remove(&feed.correlation_id) {
                    debug!(instance = %self.name, bytes = feed.total_size, "transfer done");
                    self.flushing.insert(feed.correlation_id, sink);
                }
                return true;
            }
            FeedStatus::HttpError => format!("HTTP {}", feed.http_status_code),
            FeedStatus::TransportError => "transport error".to_string(),
        };

        if let Some(sink) = self.fetches.remove(&feed.correlation_id) {
            error!(
                instance = %self.name,
                path = %sink.path().display(),
                %reason,
                "fetch failed"
            );
        }
        self.failed = true;
        false
    }

    fn artifact_ready(
        &mut self,
        correlation_id: CorrelationId,
        result: Result<PathBuf, ArtifactError>,
    ) {
        let Some(package) = self.packages.remove(&correlation_id) else {
            return;
        };
        match result {
            Ok(path) => {
                debug!(instance = %self.name, %package, path = %path.display(), "package in place");
                self.package_paths.insert(package, path);
            }
            Err(e) => {
                error!(instance = %self.name, %package, error = %e, "package unavailable");
                self.failed = true;
            }
        }
    }

    fn finish(&mut self) {
        if let Some(child) = self.child.as_mut() {
            if let Ok(None) = child.try_wait() {
                info!(instance = %self.name, "killing command");
                if let Err(e) = child.start_kill() {
                    warn!(instance = %self.name, error = %e, "failed to kill command");
                }
            }
        }
    }
}
