use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::Orchestrator;
use super::request::PackageRequest;
use crate::download::{DownloadTask, FailureKind, OwnerToken, PollResult, Sink};
use crate::error::{ArtifactError, FetchError};
use crate::host::{DescriptorStatus, HostId, ResolvedArtifact, integrity};
use crate::models::artifact::ArtifactDescriptor;
use crate::models::download_marker::MarkerFile;
use crate::providers::extractor::Extractor;
use crate::providers::file_marker_manager::FileMarkerManager;
use crate::providers::marker_manager::MarkerManager;
use crate::providers::transport::TransferRequest;
use crate::providers::zip_extractor::ZipExtractor;

pub const MARKER_FILENAME: &str = ".unpacked.yaml";

pub(super) type InstallResult = Result<PathBuf, ArtifactError>;

/// Where a resolved package lives locally.
struct Target {
    resolved: ResolvedArtifact,
    archive: PathBuf,
    package_dir: PathBuf,
}

pub(super) enum InstallStage {
    /// Waiting for the host's contents file.
    AwaitingDescriptor,
    /// Hashing the archive on the runtime. `downloaded_from` is `None` for
    /// a copy that was already on disk.
    Verifying {
        downloaded_from: Option<String>,
        result: oneshot::Receiver<bool>,
        handle: JoinHandle<()>,
    },
    Downloading(DownloadTask),
    /// Unpacking on the runtime.
    Finalizing {
        result: oneshot::Receiver<InstallResult>,
        handle: JoinHandle<()>,
    },
}

/// One `FetchPackage` request on its way to a verified local copy.
pub(super) struct InstallJob {
    pub(super) owner: OwnerToken,
    pub(super) host: HostId,
    name: String,
    version: String,
    alt_host: Option<String>,
    target: Option<Target>,
    candidates: VecDeque<String>,
    last_error: Option<ArtifactError>,
    pub(super) stage: InstallStage,
}

impl InstallJob {
    pub(super) fn new(owner: OwnerToken, host: HostId, request: PackageRequest) -> Self {
        InstallJob {
            owner,
            host,
            name: request.name,
            version: request.version,
            alt_host: request.alt_host,
            target: None,
            candidates: VecDeque::new(),
            last_error: None,
            stage: InstallStage::AwaitingDescriptor,
        }
    }

    pub(super) fn is_awaiting_descriptor(&self) -> bool {
        matches!(self.stage, InstallStage::AwaitingDescriptor)
    }

    /// Whether this job is currently writing or unpacking `archive`.
    fn is_installing(&self, archive: &Path) -> bool {
        let busy = matches!(
            self.stage,
            InstallStage::Verifying { .. }
                | InstallStage::Downloading(_)
                | InstallStage::Finalizing { .. }
        );
        busy && self.target.as_ref().is_some_and(|t| t.archive == archive)
    }

    /// Stops whatever the job is doing; nothing is reported afterwards.
    pub(super) fn abandon(self) {
        match self.stage {
            InstallStage::AwaitingDescriptor => {}
            InstallStage::Downloading(mut task) => {
                task.cancel();
                task.poll();
            }
            InstallStage::Verifying { handle, .. } | InstallStage::Finalizing { handle, .. } => {
                handle.abort();
            }
        }
        debug!(package = %self.name, version = %self.version, "package install abandoned");
    }
}

enum Step {
    /// Nothing more to do this tick.
    Wait(InstallStage),
    Next(InstallStage),
    Finish(InstallResult),
}

fn failure_error(url: &str, kind: FailureKind) -> ArtifactError {
    let url = url.to_string();
    ArtifactError::Fetch(match kind {
        FailureKind::HttpError(status) => FetchError::Http { url, status },
        FailureKind::TransportError => FetchError::Transport { url },
        FailureKind::Cancelled => FetchError::Cancelled { url },
    })
}

/// Unpacks a verified archive into its package directory unless the marker
/// says this exact archive was unpacked there already.
async fn unpack_package(
    descriptor: Arc<ArtifactDescriptor>,
    archive: PathBuf,
    package_dir: PathBuf,
) -> InstallResult {
    let extractor = ZipExtractor::new();
    let marker_path = package_dir.join(MARKER_FILENAME);
    let unpacked = FileMarkerManager::new()
        .invoke_if_different(&marker_path, &MarkerFile::for_artifact(&descriptor), || {
            extractor.extract_to_disk(&archive, &package_dir)
        })
        .await?;
    if unpacked {
        info!(package = %descriptor.name, dir = %package_dir.display(), "package unpacked");
    }
    Ok(package_dir)
}

impl Orchestrator {
    /// Advances one install as far as it can go without blocking. `Some`
    /// once it has an outcome for its owner.
    pub(super) fn step_install(&mut self, job: &mut InstallJob) -> Option<InstallResult> {
        loop {
            let stage = std::mem::replace(&mut job.stage, InstallStage::AwaitingDescriptor);
            let step = match stage {
                InstallStage::AwaitingDescriptor => self.resolve_package(job),
                InstallStage::Verifying {
                    downloaded_from,
                    mut result,
                    handle,
                } => match result.try_recv() {
                    Ok(verified) => self.check_verification(job, downloaded_from, verified),
                    Err(oneshot::error::TryRecvError::Empty) => Step::Wait(InstallStage::Verifying {
                        downloaded_from,
                        result,
                        handle,
                    }),
                    Err(oneshot::error::TryRecvError::Closed) => {
                        Step::Finish(Err(ArtifactError::Abandoned))
                    }
                },
                InstallStage::Downloading(task) => self.poll_package_download(job, task),
                InstallStage::Finalizing { mut result, handle } => match result.try_recv() {
                    Ok(outcome) => Step::Finish(outcome),
                    Err(oneshot::error::TryRecvError::Empty) => {
                        Step::Wait(InstallStage::Finalizing { result, handle })
                    }
                    Err(oneshot::error::TryRecvError::Closed) => {
                        Step::Finish(Err(ArtifactError::Abandoned))
                    }
                },
            };
            match step {
                Step::Wait(stage) => {
                    job.stage = stage;
                    return None;
                }
                Step::Next(stage) => job.stage = stage,
                Step::Finish(result) => return Some(result),
            }
        }
    }

    fn resolve_package(&mut self, job: &mut InstallJob) -> Step {
        let status = self
            .registry
            .get_mut(job.host)
            .ensure_descriptor(self.transport.as_ref());
        if status == DescriptorStatus::Pending {
            return Step::Wait(InstallStage::AwaitingDescriptor);
        }

        if let Some(alias) = job.alt_host.take() {
            return match self.registry.resolve_alt_host(job.host, &alias) {
                Ok(alt) => {
                    job.host = alt;
                    Step::Next(InstallStage::AwaitingDescriptor)
                }
                Err(e) => Step::Finish(Err(e.into())),
            };
        }

        let resolved = match self
            .registry
            .lookup_artifact(job.host, &job.name, &job.version, &self.config.platform)
        {
            Ok(resolved) => resolved,
            Err(e) => return Step::Finish(Err(e.into())),
        };
        let host = self.registry.get(resolved.host);
        let archive = host.package_path(&resolved.descriptor);
        if self.installs.values().any(|other| other.is_installing(&archive)) {
            // Same file already on its way; check it again once that is done.
            return Step::Wait(InstallStage::AwaitingDescriptor);
        }
        let package_dir = host.package_dir(&resolved.descriptor);
        let candidates = host.download_candidates(&resolved.descriptor, self.config.max_mirrors);
        job.target = Some(Target {
            resolved,
            archive,
            package_dir,
        });
        job.candidates = candidates.into();
        self.verify_archive(job, None)
    }

    /// Checks the archive on disk against its descriptor off the tick path.
    fn verify_archive(&mut self, job: &mut InstallJob, downloaded_from: Option<String>) -> Step {
        let Some(target) = job.target.as_ref() else {
            return Step::Finish(Err(ArtifactError::Abandoned));
        };
        let (tx, rx) = oneshot::channel();
        let descriptor = Arc::clone(&target.resolved.descriptor);
        let archive = target.archive.clone();
        let handle = self.runtime.spawn(async move {
            let _ = tx.send(integrity::verify_local(&descriptor, &archive).await);
        });
        Step::Next(InstallStage::Verifying {
            downloaded_from,
            result: rx,
            handle,
        })
    }

    fn check_verification(
        &mut self,
        job: &mut InstallJob,
        downloaded_from: Option<String>,
        verified: bool,
    ) -> Step {
        match (downloaded_from, verified) {
            (None, true) => {
                info!(package = %job.name, version = %job.version, "package already up to date");
                self.finalize_package(job)
            }
            (None, false) => self.next_candidate(job),
            (Some(_), true) => {
                self.progress.set_progress(1.0);
                self.finalize_package(job)
            }
            (Some(url), false) => {
                let Some(target) = job.target.as_ref() else {
                    return Step::Finish(Err(ArtifactError::Abandoned));
                };
                warn!(
                    %url,
                    path = %target.archive.display(),
                    "downloaded package failed verification"
                );
                job.last_error = Some(ArtifactError::IntegrityMismatch {
                    path: target.archive.clone(),
                });
                self.next_candidate(job)
            }
        }
    }

    fn next_candidate(&mut self, job: &mut InstallJob) -> Step {
        let Some(target) = job.target.as_ref() else {
            return Step::Finish(Err(ArtifactError::Abandoned));
        };
        let Some(url) = job.candidates.pop_front() else {
            let error = job.last_error.take().unwrap_or(ArtifactError::Abandoned);
            return Step::Finish(Err(error));
        };
        self.progress
            .set_label(&format!("Downloading {} {}", job.name, job.version));
        self.progress.set_progress(0.0);
        let task = DownloadTask::start(
            self.transport.as_ref(),
            TransferRequest::get(url),
            Sink::file(self.runtime.clone(), &target.archive),
            job.owner,
        );
        Step::Next(InstallStage::Downloading(task))
    }

    fn poll_package_download(&mut self, job: &mut InstallJob, mut task: DownloadTask) -> Step {
        match task.poll() {
            PollResult::Progress(_) => {
                let expected = job
                    .target
                    .as_ref()
                    .map(|t| t.resolved.descriptor.expected_size)
                    .or(task.total_size())
                    .unwrap_or(0);
                if expected > 0 {
                    let fraction = task.bytes_transferred() as f64 / expected as f64;
                    self.progress.set_progress(fraction.min(1.0));
                }
                Step::Wait(InstallStage::Downloading(task))
            }
            PollResult::InProgress => Step::Wait(InstallStage::Downloading(task)),
            PollResult::Failed(kind) => {
                warn!(
                    package = %job.name,
                    url = %task.url(),
                    ?kind,
                    "package download failed"
                );
                job.last_error = Some(failure_error(task.url(), kind));
                if kind == FailureKind::Cancelled {
                    job.candidates.clear();
                }
                self.next_candidate(job)
            }
            PollResult::Complete(bytes) => {
                debug!(package = %job.name, bytes, "verifying downloaded package");
                self.verify_archive(job, Some(task.url().to_string()))
            }
        }
    }

    fn finalize_package(&mut self, job: &mut InstallJob) -> Step {
        let Some(target) = job.target.as_ref() else {
            return Step::Finish(Err(ArtifactError::Abandoned));
        };
        if target.resolved.descriptor.solo {
            return Step::Finish(Ok(target.archive.clone()));
        }

        let (tx, rx) = oneshot::channel();
        let unpack = unpack_package(
            Arc::clone(&target.resolved.descriptor),
            target.archive.clone(),
            target.package_dir.clone(),
        );
        let handle = self.runtime.spawn(async move {
            // The receiver is gone only if the install was abandoned.
            let _ = tx.send(unpack.await);
        });
        Step::Next(InstallStage::Finalizing { result: rx, handle })
    }
}

