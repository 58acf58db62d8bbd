use std::path::{Component, Path, PathBuf};

/// A single normal path component: not empty, not `.` or `..`, not
/// absolute, and free of separators.
fn is_plain_component(part: &str) -> bool {
    let mut components = Path::new(part).components();
    let single = matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    );
    single && !part.contains(['/', '\\'])
}

/// Package identity within one host, platform aside.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PackageKey {
    pub name: String,
    pub version: String,
}

impl PackageKey {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        PackageKey {
            name: name.into(),
            version: version.into(),
        }
    }
}

/// One downloadable file as advertised by a host's contents file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactDescriptor {
    pub name: String,
    pub version: String,
    /// Empty for platform-independent artifacts.
    pub platform: String,
    /// A single file rather than an archive to unpack.
    pub solo: bool,
    /// Path relative to the host URL.
    pub filename: String,
    pub expected_size: u64,
    pub expected_hash: String,
}

impl ArtifactDescriptor {
    pub fn key(&self) -> PackageKey {
        PackageKey::new(&self.name, &self.version)
    }

    pub fn matches_platform(&self, platform: &str) -> bool {
        self.platform == platform
    }

    pub fn is_platform_independent(&self) -> bool {
        self.platform.is_empty()
    }

    /// `<name>/<version>/<platform>` below a host directory.
    pub fn relative_dir(&self) -> PathBuf {
        let version = if self.version.is_empty() { "_" } else { &self.version };
        let platform = if self.platform.is_empty() { "any" } else { &self.platform };
        Path::new(&self.name).join(version).join(platform)
    }

    /// Whether the local layout stays inside the host directory. Every
    /// field that ends up in a path must be a plain component, and
    /// `filename` may not step up or out with `.`/`..` segments.
    pub fn has_contained_layout(&self) -> bool {
        let optional = |part: &str| part.is_empty() || is_plain_component(part);
        let filename_ok = !self.filename.contains('\\')
            && self
                .filename
                .split('/')
                .filter(|segment| !segment.is_empty())
                .all(is_plain_component);
        is_plain_component(&self.name)
            && optional(&self.version)
            && optional(&self.platform)
            && filename_ok
            && is_plain_component(self.local_name())
    }

    /// Final path component of `filename`.
    pub fn local_name(&self) -> &str {
        self.filename
            .rsplit('/')
            .find(|part| !part.is_empty())
            .unwrap_or(&self.name)
    }
}
