//! Turns instance requests into transfers and transfer progress into
//! instance callbacks.
//!
//! Nothing here blocks. The owner of the [`Orchestrator`] calls
//! [`Orchestrator::tick`] whenever it has idle cycles (or uses
//! [`Orchestrator::run`]) until every instance has stopped.

mod install;
mod request;

pub use install::MARKER_FILENAME;
pub use request::{Feed, FeedStatus, Instance, InstanceRequest, PackageRequest};

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

use tokio::runtime::Handle;
use tracing::{debug, info, warn};

use crate::download::{DownloadTask, FailureKind, InstanceId, OwnerToken, PollResult, Sink};
use crate::error::{ArtifactError, FetchError, HostError};
use crate::host::{HostId, HostRegistry};
use crate::models::artifact::PackageKey;
use crate::models::configuration::LauncherConfig;
use crate::providers::progress::{ProgressReporter, TracingProgress};
use crate::providers::transport::{TransferRequest, Transport};
use install::InstallJob;

/// Upper bound on requests taken from one instance per tick.
const MAX_REQUESTS_PER_TICK: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorState {
    Idle,
    Running,
    /// An instance is being torn down.
    Draining,
}

pub struct Orchestrator {
    config: LauncherConfig,
    transport: Box<dyn Transport>,
    runtime: Handle,
    progress: Box<dyn ProgressReporter>,
    registry: HostRegistry,
    instances: BTreeMap<InstanceId, Box<dyn Instance>>,
    /// Plain URL transfers, serviced in registration order.
    tasks: BTreeMap<u64, DownloadTask>,
    installs: BTreeMap<u64, InstallJob>,
    next_instance: u64,
    next_task: u64,
    next_install: u64,
    state: OrchestratorState,
}

impl Orchestrator {
    /// `runtime` runs package unpacking off the tick path.
    pub fn new(config: LauncherConfig, transport: Box<dyn Transport>, runtime: Handle) -> Self {
        let registry = HostRegistry::new(config.root_dir.clone(), config.force_refresh);
        Orchestrator {
            config,
            transport,
            runtime,
            progress: Box::new(TracingProgress::default()),
            registry,
            instances: BTreeMap::new(),
            tasks: BTreeMap::new(),
            installs: BTreeMap::new(),
            next_instance: 1,
            next_task: 0,
            next_install: 0,
            state: OrchestratorState::Idle,
        }
    }

    pub fn with_progress(mut self, progress: Box<dyn ProgressReporter>) -> Self {
        self.progress = progress;
        self
    }

    pub fn registry(&self) -> &HostRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut HostRegistry {
        &mut self.registry
    }

    pub fn state(&self) -> OrchestratorState {
        self.state
    }

    pub fn is_idle(&self) -> bool {
        self.instances.is_empty()
    }

    pub fn live_task_count(&self) -> usize {
        self.tasks.len()
    }

    pub fn pending_install_count(&self) -> usize {
        self.installs.len()
    }

    pub fn add_instance(&mut self, instance: Box<dyn Instance>) -> InstanceId {
        let id = InstanceId(self.next_instance);
        self.next_instance += 1;
        info!(instance = %instance.name(), id = id.0, "instance started");
        self.instances.insert(id, instance);
        self.state = OrchestratorState::Running;
        id
    }

    pub fn submit(&mut self, instance: InstanceId, request: InstanceRequest) {
        let Some(name) = self.instances.get(&instance).map(|i| i.name().to_string()) else {
            warn!(instance = instance.0, ?request, "request from unknown instance");
            return;
        };
        match request {
            InstanceRequest::FetchUrl { url, correlation_id } => {
                self.start_transfer(instance, correlation_id, TransferRequest::get(url));
            }
            InstanceRequest::PostUrl {
                url,
                body,
                correlation_id,
            } => {
                self.start_transfer(instance, correlation_id, TransferRequest::post(url, body));
            }
            InstanceRequest::FetchPackage(request) => self.start_install(instance, request),
            InstanceRequest::Notify(message) => {
                info!(instance = %name, %message, "Got notify");
            }
            InstanceRequest::Stop => {
                info!(instance = %name, "Got stop");
                self.terminate_instance(instance);
            }
        }
    }

    fn start_transfer(
        &mut self,
        instance: InstanceId,
        correlation_id: u64,
        request: TransferRequest,
    ) {
        let task = DownloadTask::start(
            self.transport.as_ref(),
            request,
            Sink::Stream,
            OwnerToken::instance(instance, correlation_id),
        );
        self.tasks.insert(self.next_task, task);
        self.next_task += 1;
    }

    fn start_install(&mut self, instance: InstanceId, request: PackageRequest) {
        let owner = OwnerToken::instance(instance, request.correlation_id);
        let Some(host_url) = request
            .host_url
            .clone()
            .or_else(|| self.config.host_url.clone())
        else {
            self.report_artifact(owner, Err(ArtifactError::NoHost { name: request.name }));
            return;
        };
        debug!(
            package = %request.name,
            version = %request.version,
            host = %host_url,
            "package requested"
        );
        let host = self.registry.resolve(&host_url);
        let mut job = InstallJob::new(owner, host, request);
        match self.step_install(&mut job) {
            Some(result) => self.report_artifact(owner, result),
            None => {
                self.installs.insert(self.next_install, job);
                self.next_install += 1;
            }
        }
    }

    /// One non-blocking pass over everything in flight. Returns whether
    /// anything happened, so callers can back off when it did not.
    pub fn tick(&mut self) -> bool {
        let mut busy = self.collect_requests();
        busy |= self.poll_installs();
        busy |= self.poll_tasks();
        busy
    }

    /// Ticks until the last instance has stopped, sleeping for the
    /// configured idle interval whenever a tick finds nothing to do.
    pub async fn run(&mut self) {
        while !self.is_idle() {
            if self.tick() {
                tokio::task::yield_now().await;
            } else {
                tokio::time::sleep(self.config.idle_interval).await;
            }
        }
        info!("clean exit");
    }

    fn collect_requests(&mut self) -> bool {
        let mut busy = false;
        let ids: Vec<InstanceId> = self.instances.keys().copied().collect();
        for id in ids {
            for _ in 0..MAX_REQUESTS_PER_TICK {
                let request = self.instances.get_mut(&id).and_then(|i| i.next_request());
                let Some(request) = request else {
                    break;
                };
                busy = true;
                self.submit(id, request);
            }
        }
        busy
    }

    fn poll_installs(&mut self) -> bool {
        let mut busy = false;
        let mut failed_hosts: HashMap<HostId, FetchError> = HashMap::new();
        for host in self.registry.hosts_mut() {
            match host.poll_descriptor() {
                Some(Ok(())) => busy = true,
                Some(Err(e)) => {
                    busy = true;
                    failed_hosts.insert(host.id(), e);
                }
                None => {}
            }
        }

        let ids: Vec<u64> = self.installs.keys().copied().collect();
        for id in ids {
            let Some(mut job) = self.installs.remove(&id) else {
                continue;
            };
            let outcome = match failed_hosts.get(&job.host) {
                Some(e) if job.is_awaiting_descriptor() => {
                    Some(Err(ArtifactError::Fetch(e.clone())))
                }
                _ => self.step_install(&mut job),
            };
            match outcome {
                Some(result) => {
                    busy = true;
                    self.report_artifact(job.owner, result);
                }
                None => {
                    self.installs.insert(id, job);
                }
            }
        }
        busy
    }

    fn poll_tasks(&mut self) -> bool {
        let mut busy = false;
        let mut finished = Vec::new();
        for (id, task) in self.tasks.iter_mut() {
            let owner = task.owner();
            let Some(instance) = owner.instance.and_then(|i| self.instances.get_mut(&i)) else {
                task.cancel();
                task.poll();
                finished.push(*id);
                continue;
            };
            match task.poll() {
                PollResult::InProgress => {}
                PollResult::Progress(chunk) => {
                    busy = true;
                    let wanted = instance.feed(Feed {
                        correlation_id: owner.correlation_id,
                        status: FeedStatus::InProgress,
                        http_status_code: task.http_status(),
                        total_size: task.total_size().unwrap_or(0),
                        chunk: &chunk,
                    });
                    if !wanted {
                        debug!(url = %task.url(), "instance declined further data");
                        task.cancel();
                    }
                }
                PollResult::Complete(total) => {
                    busy = true;
                    instance.feed(Feed {
                        correlation_id: owner.correlation_id,
                        status: FeedStatus::Done,
                        http_status_code: task.http_status(),
                        total_size: total,
                        chunk: &[],
                    });
                    finished.push(*id);
                }
                // The owner asked for this; it gets no terminal feed.
                PollResult::Failed(FailureKind::Cancelled) => finished.push(*id),
                PollResult::Failed(kind) => {
                    busy = true;
                    let (status, code) = match kind {
                        FailureKind::HttpError(code) => (FeedStatus::HttpError, code),
                        _ => (FeedStatus::TransportError, 0),
                    };
                    instance.feed(Feed {
                        correlation_id: owner.correlation_id,
                        status,
                        http_status_code: code,
                        total_size: task.bytes_transferred(),
                        chunk: &[],
                    });
                    finished.push(*id);
                }
            }
        }
        for id in finished {
            self.tasks.remove(&id);
        }
        busy
    }

    fn report_artifact(&mut self, owner: OwnerToken, result: Result<PathBuf, ArtifactError>) {
        match &result {
            Ok(path) => info!(
                correlation_id = owner.correlation_id,
                path = %path.display(),
                "package ready"
            ),
            Err(e) => warn!(correlation_id = owner.correlation_id, error = %e, "package failed"),
        }
        if let Some(instance) = owner.instance.and_then(|id| self.instances.get_mut(&id)) {
            instance.artifact_ready(owner.correlation_id, result);
        }
    }

    /// Finishes the instance and cancels everything it still owns.
    pub fn terminate_instance(&mut self, id: InstanceId) {
        let Some(mut instance) = self.instances.remove(&id) else {
            return;
        };
        self.state = OrchestratorState::Draining;
        instance.finish();

        let owned_tasks: Vec<u64> = self
            .tasks
            .iter()
            .filter(|(_, task)| task.owner().is_owned_by(id))
            .map(|(key, _)| *key)
            .collect();
        for key in &owned_tasks {
            if let Some(mut task) = self.tasks.remove(key) {
                task.cancel();
                task.poll();
            }
        }
        let owned_installs: Vec<u64> = self
            .installs
            .iter()
            .filter(|(_, job)| job.owner.is_owned_by(id))
            .map(|(key, _)| *key)
            .collect();
        for key in &owned_installs {
            if let Some(job) = self.installs.remove(key) {
                job.abandon();
            }
        }
        info!(
            instance = %instance.name(),
            tasks = owned_tasks.len(),
            installs = owned_installs.len(),
            "instance finished"
        );

        if self.instances.is_empty() {
            self.drain();
        } else {
            self.state = OrchestratorState::Running;
        }
    }

    fn drain(&mut self) {
        for host in self.registry.hosts_mut() {
            host.cancel_descriptor_fetch();
        }
        for (_, mut task) in std::mem::take(&mut self.tasks) {
            task.cancel();
            task.poll();
        }
        for (_, job) in std::mem::take(&mut self.installs) {
            job.abandon();
        }
        self.state = OrchestratorState::Idle;
        debug!("no instances left");
    }

    /// Moves `name`/`version` from the host at `host_url` to the alt host
    /// it knows as `alias`. Transfers already running keep their URL.
    pub fn migrate_package(
        &mut self,
        host_url: &str,
        name: &str,
        version: &str,
        alias: &str,
    ) -> Result<HostId, HostError> {
        let from = self.registry.resolve(host_url);
        let to = self.registry.resolve_alt_host(from, alias)?;
        self.registry
            .migrate(from, &PackageKey::new(name, version), alias, to);
        Ok(to)
    }
}
