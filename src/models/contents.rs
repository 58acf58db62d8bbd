use tracing::warn;

use crate::models::artifact::ArtifactDescriptor;

/// The `contents.yaml` document a host publishes at its root.
#[derive(Debug, Default, serde::Deserialize)]
pub struct ContentsFile {
    #[serde(default)]
    pub host: HostSection,
    #[serde(default)]
    pub packages: Vec<PackageEntry>,
}

#[derive(Debug, Default, serde::Deserialize)]
pub struct HostSection {
    #[serde(default, rename = "descriptiveName")]
    pub descriptive_name: Option<String>,
    #[serde(default)]
    pub mirrors: Vec<String>,
    #[serde(default, rename = "altHosts")]
    pub alt_hosts: Vec<AltHostEntry>,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct AltHostEntry {
    pub alias: String,
    pub url: String,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct PackageEntry {
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub platform: String,
    #[serde(default)]
    pub solo: bool,
    pub file: FileEntry,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct FileEntry {
    pub filename: String,
    pub size: u64,
    pub sha256: String,
}

impl ContentsFile {
    pub fn parse(raw: &[u8]) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_slice(raw)
    }

    /// Entries whose names would place files outside the host directory
    /// are dropped.
    pub fn descriptors(&self) -> impl Iterator<Item = ArtifactDescriptor> + '_ {
        self.packages.iter().filter_map(|package| {
            let descriptor = ArtifactDescriptor {
                name: package.name.clone(),
                version: package.version.clone(),
                platform: package.platform.clone(),
                solo: package.solo,
                filename: package.file.filename.clone(),
                expected_size: package.file.size,
                expected_hash: package.file.sha256.to_ascii_lowercase(),
            };
            if descriptor.has_contained_layout() {
                Some(descriptor)
            } else {
                warn!(
                    name = %package.name,
                    version = %package.version,
                    platform = %package.platform,
                    filename = %package.file.filename,
                    "ignoring package with unsafe path"
                );
                None
            }
        })
    }
}
