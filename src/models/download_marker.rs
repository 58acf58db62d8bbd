use crate::models::artifact::ArtifactDescriptor;

/// Records which archive a package directory was unpacked from.
#[derive(Debug, serde::Deserialize, serde::Serialize, Clone, PartialEq, Eq)]
pub struct MarkerFile {
    pub name: String,
    pub version: String,
    pub platform: String,
    pub sha256: String,
}

impl MarkerFile {
    pub fn for_artifact(artifact: &ArtifactDescriptor) -> Self {
        MarkerFile {
            name: artifact.name.clone(),
            version: artifact.version.clone(),
            platform: artifact.platform.clone(),
            sha256: artifact.expected_hash.clone(),
        }
    }
}
