//! Download hosts: where an artifact comes from and whether the local copy
//! is still good.
//!
//! A [`Host`] starts out undescribed. [`Host::ensure_descriptor`] either
//! loads the cached `contents.yaml` or starts the one fetch of it; every
//! later caller sees that same fetch until [`Host::poll_descriptor`] reports
//! the outcome. Hosts are created and shared through [`HostRegistry`].

pub mod integrity;
mod registry;

pub use registry::{HostRegistry, ResolvedArtifact};

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rand::rng;
use rand::seq::SliceRandom;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::download::{DownloadTask, FailureKind, OwnerToken, PollResult, Sink};
use crate::error::{FetchError, HostError};
use crate::models::artifact::{ArtifactDescriptor, PackageKey};
use crate::models::contents::ContentsFile;
use crate::providers::transport::{TransferRequest, Transport};

pub const CONTENTS_FILENAME: &str = "contents.yaml";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HostId(usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorStatus {
    Ready,
    Pending,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Migration {
    pub alias: String,
    pub host: HostId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    Found(Arc<ArtifactDescriptor>),
    Migrated(HostId),
}

#[derive(Debug, Default)]
struct PackageRecord {
    /// One entry per advertised platform.
    descriptors: Vec<Arc<ArtifactDescriptor>>,
    superseded_by: Option<Migration>,
}

/// Strips surrounding whitespace and trailing slashes.
pub fn normalize_url(url: &str) -> String {
    url.trim().trim_end_matches('/').to_string()
}

fn host_dir_name(url: &str) -> String {
    let hostname = reqwest::Url::parse(url)
        .ok()
        .and_then(|parsed| parsed.host_str().map(str::to_string))
        .unwrap_or_else(|| "host".to_string());
    let hostname: String = hostname
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '.' { c } else { '_' })
        .collect();
    let digest = format!("{:x}", Sha256::digest(url.as_bytes()));
    format!("{}_{}", hostname, &digest[..16])
}

pub struct Host {
    id: HostId,
    host_url: String,
    url_prefix: String,
    host_dir: PathBuf,
    descriptive_name: String,
    force_refresh: bool,
    contents: Option<ContentsFile>,
    fetch: Option<DownloadTask>,
    mirrors: Vec<String>,
    alt_hosts: BTreeMap<String, String>,
    alt_host_ids: HashMap<String, HostId>,
    packages: HashMap<PackageKey, PackageRecord>,
}

impl Host {
    fn new(id: HostId, host_url: String, root_dir: &Path, force_refresh: bool) -> Self {
        let host_dir = root_dir.join("hosts").join(host_dir_name(&host_url));
        Host {
            id,
            url_prefix: format!("{}/", host_url),
            descriptive_name: host_url.clone(),
            host_url,
            host_dir,
            force_refresh,
            contents: None,
            fetch: None,
            mirrors: Vec::new(),
            alt_hosts: BTreeMap::new(),
            alt_host_ids: HashMap::new(),
            packages: HashMap::new(),
        }
    }

    pub fn id(&self) -> HostId {
        self.id
    }

    pub fn host_url(&self) -> &str {
        &self.host_url
    }

    pub fn url_prefix(&self) -> &str {
        &self.url_prefix
    }

    pub fn host_dir(&self) -> &Path {
        &self.host_dir
    }

    pub fn descriptive_name(&self) -> &str {
        &self.descriptive_name
    }

    pub fn has_contents_file(&self) -> bool {
        self.contents.is_some()
    }

    pub fn contents_url(&self) -> String {
        format!("{}{}", self.url_prefix, CONTENTS_FILENAME)
    }

    fn contents_path(&self) -> PathBuf {
        self.host_dir.join(CONTENTS_FILENAME)
    }

    /// Makes sure the contents file is loaded or being fetched. Never issues
    /// a second fetch while one is in flight.
    pub fn ensure_descriptor(&mut self, transport: &dyn Transport) -> DescriptorStatus {
        if self.contents.is_some() {
            return DescriptorStatus::Ready;
        }
        if self.fetch.is_some() {
            return DescriptorStatus::Pending;
        }
        if !self.force_refresh && self.read_contents_file() {
            return DescriptorStatus::Ready;
        }
        self.fetch = Some(DownloadTask::start(
            transport,
            TransferRequest::get(self.contents_url()),
            Sink::Memory(Vec::new()),
            OwnerToken::internal(),
        ));
        DescriptorStatus::Pending
    }

    /// Loads a previously downloaded contents file from the host directory.
    pub fn read_contents_file(&mut self) -> bool {
        let path = self.contents_path();
        let raw = match std::fs::read(&path) {
            Ok(raw) => raw,
            Err(e) => {
                debug!(path = %path.display(), error = %e, "no cached contents file");
                return false;
            }
        };
        match ContentsFile::parse(&raw) {
            Ok(contents) => {
                info!(host = %self.host_url, path = %path.display(), "read cached contents file");
                self.load_contents(contents);
                true
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "ignoring unreadable contents file");
                false
            }
        }
    }

    /// Advances the in-flight contents fetch by one step. `None` while it is
    /// still running or when there is none.
    pub fn poll_descriptor(&mut self) -> Option<Result<(), FetchError>> {
        let task = self.fetch.as_mut()?;
        let url = task.url().to_string();
        match task.poll() {
            PollResult::Progress(_) | PollResult::InProgress => None,
            PollResult::Failed(kind) => {
                self.fetch = None;
                warn!(host = %self.host_url, ?kind, "contents fetch failed");
                Some(Err(match kind {
                    FailureKind::HttpError(status) => FetchError::Http { url, status },
                    FailureKind::TransportError => FetchError::Transport { url },
                    FailureKind::Cancelled => FetchError::Cancelled { url },
                }))
            }
            PollResult::Complete(_) => {
                let task = self.fetch.take()?;
                let Sink::Memory(raw) = task.into_sink() else {
                    return Some(Err(FetchError::Transport { url }));
                };
                let contents = match ContentsFile::parse(&raw) {
                    Ok(contents) => contents,
                    Err(e) => {
                        return Some(Err(FetchError::InvalidContents {
                            url,
                            reason: e.to_string(),
                        }));
                    }
                };
                self.store_contents_file(&raw);
                self.load_contents(contents);
                Some(Ok(()))
            }
        }
    }

    /// Drops an in-flight contents fetch; the host stays undescribed.
    pub fn cancel_descriptor_fetch(&mut self) {
        if let Some(mut task) = self.fetch.take() {
            task.cancel();
            task.poll();
        }
    }

    fn store_contents_file(&self, raw: &[u8]) {
        let path = self.contents_path();
        let result = std::fs::create_dir_all(&self.host_dir)
            .and_then(|_| std::fs::write(&path, raw));
        if let Err(e) = result {
            warn!(path = %path.display(), error = %e, "failed to cache contents file");
        }
    }

    fn load_contents(&mut self, contents: ContentsFile) {
        if let Some(name) = &contents.host.descriptive_name {
            self.descriptive_name = name.clone();
        }
        for mirror in &contents.host.mirrors {
            self.add_mirror(mirror);
        }
        for alt in &contents.host.alt_hosts {
            self.alt_hosts.insert(alt.alias.clone(), normalize_url(&alt.url));
        }

        let mut grouped: HashMap<PackageKey, Vec<Arc<ArtifactDescriptor>>> = HashMap::new();
        for descriptor in contents.descriptors() {
            grouped
                .entry(descriptor.key())
                .or_default()
                .push(Arc::new(descriptor));
        }
        for (key, descriptors) in grouped {
            let record = self.packages.entry(key).or_default();
            if record.superseded_by.is_none() {
                record.descriptors = descriptors;
            }
        }

        info!(
            host = %self.host_url,
            name = %self.descriptive_name,
            packages = self.packages.len(),
            mirrors = self.mirrors.len(),
            "contents loaded"
        );
        self.contents = Some(contents);
    }

    pub fn add_mirror(&mut self, mirror_url: &str) {
        let mirror = format!("{}/", normalize_url(mirror_url));
        if !self.mirrors.contains(&mirror) {
            self.mirrors.push(mirror);
        }
    }

    pub fn mirrors(&self) -> &[String] {
        &self.mirrors
    }

    /// Up to `count` distinct mirrors in random order.
    pub fn choose_mirrors(&self, count: usize) -> Vec<String> {
        let mut chosen = self.mirrors.clone();
        chosen.shuffle(&mut rng());
        chosen.truncate(count);
        chosen
    }

    pub fn alt_host_url(&self, alias: &str) -> Option<&str> {
        self.alt_hosts.get(alias).map(String::as_str)
    }

    pub fn lookup_artifact(
        &self,
        name: &str,
        version: &str,
        platform: &str,
    ) -> Result<Lookup, HostError> {
        let key = PackageKey::new(name, version);
        let not_found = || HostError::ArtifactNotFound {
            name: name.to_string(),
            version: version.to_string(),
            platform: platform.to_string(),
        };
        let Some(record) = self.packages.get(&key) else {
            if self.contents.is_none() {
                return Err(HostError::Undescribed {
                    host: self.host_url.clone(),
                });
            }
            return Err(not_found());
        };
        if let Some(migration) = &record.superseded_by {
            return Ok(Lookup::Migrated(migration.host));
        }
        record
            .descriptors
            .iter()
            .find(|d| d.matches_platform(platform))
            .or_else(|| record.descriptors.iter().find(|d| d.is_platform_independent()))
            .map(|d| Lookup::Found(Arc::clone(d)))
            .ok_or_else(not_found)
    }

    /// Marks the package as served elsewhere and hands back its descriptors.
    fn supersede(
        &mut self,
        key: &PackageKey,
        alias: &str,
        host: HostId,
    ) -> Vec<Arc<ArtifactDescriptor>> {
        let record = self.packages.entry(key.clone()).or_default();
        record.superseded_by = Some(Migration {
            alias: alias.to_string(),
            host,
        });
        record.descriptors.clone()
    }

    fn adopt(&mut self, key: PackageKey, descriptors: Vec<Arc<ArtifactDescriptor>>) {
        let record = self.packages.entry(key).or_default();
        if record.descriptors.is_empty() {
            record.descriptors = descriptors;
        }
        record.superseded_by = None;
    }

    pub fn migration(&self, key: &PackageKey) -> Option<&Migration> {
        self.packages.get(key)?.superseded_by.as_ref()
    }

    pub fn artifact_url(&self, artifact: &ArtifactDescriptor) -> String {
        format!("{}{}", self.url_prefix, artifact.filename.trim_start_matches('/'))
    }

    /// Where to try, in order: randomly chosen mirrors, then the host itself.
    pub fn download_candidates(
        &self,
        artifact: &ArtifactDescriptor,
        max_mirrors: usize,
    ) -> Vec<String> {
        let filename = artifact.filename.trim_start_matches('/');
        let mut candidates: Vec<String> = self
            .choose_mirrors(max_mirrors)
            .into_iter()
            .map(|mirror| format!("{}{}", mirror, filename))
            .collect();
        candidates.push(self.artifact_url(artifact));
        candidates
    }

    pub fn package_dir(&self, artifact: &ArtifactDescriptor) -> PathBuf {
        self.host_dir.join(artifact.relative_dir())
    }

    pub fn package_path(&self, artifact: &ArtifactDescriptor) -> PathBuf {
        self.package_dir(artifact).join(artifact.local_name())
    }
}
