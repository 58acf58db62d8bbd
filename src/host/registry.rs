use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info};

use super::{Host, HostId, Lookup, normalize_url};
use crate::error::HostError;
use crate::models::artifact::{ArtifactDescriptor, PackageKey};

/// A descriptor together with the host that serves it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedArtifact {
    pub host: HostId,
    pub descriptor: Arc<ArtifactDescriptor>,
}

/// Owns every [`Host`]; at most one per normalized URL.
pub struct HostRegistry {
    root_dir: PathBuf,
    force_refresh: bool,
    hosts: Vec<Host>,
    by_url: HashMap<String, HostId>,
}

impl HostRegistry {
    pub fn new(root_dir: impl Into<PathBuf>, force_refresh: bool) -> Self {
        HostRegistry {
            root_dir: root_dir.into(),
            force_refresh,
            hosts: Vec::new(),
            by_url: HashMap::new(),
        }
    }

    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    pub fn resolve(&mut self, base_url: &str) -> HostId {
        let url = normalize_url(base_url);
        if let Some(id) = self.by_url.get(&url) {
            return *id;
        }
        let id = HostId(self.hosts.len());
        debug!(host = %url, "new host");
        self.hosts
            .push(Host::new(id, url.clone(), &self.root_dir, self.force_refresh));
        self.by_url.insert(url, id);
        id
    }

    pub fn get(&self, id: HostId) -> &Host {
        &self.hosts[id.0]
    }

    pub fn get_mut(&mut self, id: HostId) -> &mut Host {
        &mut self.hosts[id.0]
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    pub fn hosts_mut(&mut self) -> impl Iterator<Item = &mut Host> {
        self.hosts.iter_mut()
    }

    /// Resolves an alias from `id`'s contents file, memoized per host.
    pub fn resolve_alt_host(&mut self, id: HostId, alias: &str) -> Result<HostId, HostError> {
        if let Some(alt) = self.get(id).alt_host_ids.get(alias) {
            return Ok(*alt);
        }
        let url = self
            .get(id)
            .alt_host_url(alias)
            .ok_or_else(|| HostError::AltHostNotFound {
                host: self.get(id).host_url().to_string(),
                alias: alias.to_string(),
            })?
            .to_string();
        let alt = self.resolve(&url);
        self.get_mut(id).alt_host_ids.insert(alias.to_string(), alt);
        Ok(alt)
    }

    /// Finds the descriptor for `name`/`version`, following migrations.
    pub fn lookup_artifact(
        &self,
        id: HostId,
        name: &str,
        version: &str,
        platform: &str,
    ) -> Result<ResolvedArtifact, HostError> {
        let mut current = id;
        for _ in 0..=self.hosts.len() {
            match self.get(current).lookup_artifact(name, version, platform)? {
                Lookup::Found(descriptor) => {
                    return Ok(ResolvedArtifact {
                        host: current,
                        descriptor,
                    });
                }
                Lookup::Migrated(next) => current = next,
            }
        }
        Err(HostError::ArtifactNotFound {
            name: name.to_string(),
            version: version.to_string(),
            platform: platform.to_string(),
        })
    }

    /// Redirects future lookups of `key` on `from` to `to`. Descriptors
    /// already handed out are untouched.
    pub fn migrate(&mut self, from: HostId, key: &PackageKey, alias: &str, to: HostId) {
        if from == to {
            return;
        }
        let descriptors = self.get_mut(from).supersede(key, alias, to);
        self.get_mut(to).adopt(key.clone(), descriptors);
        info!(
            package = %key.name,
            version = %key.version,
            from = %self.get(from).host_url(),
            to = %self.get(to).host_url(),
            alias,
            "package migrated"
        );
    }
}
