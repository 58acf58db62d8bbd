use std::path::PathBuf;

use thiserror::Error;

/// Failure to retrieve a document over the transport.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("HTTP {status} fetching {url}")]
    Http { url: String, status: u16 },

    #[error("transport error fetching {url}")]
    Transport { url: String },

    #[error("fetch of {url} was cancelled")]
    Cancelled { url: String },

    #[error("invalid contents file at {url}: {reason}")]
    InvalidContents { url: String, reason: String },
}

/// Lookups against a host that found nothing.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HostError {
    #[error("host {host} has no contents file yet")]
    Undescribed { host: String },

    #[error("no package {name} {version} for platform {platform}")]
    ArtifactNotFound {
        name: String,
        version: String,
        platform: String,
    },

    #[error("host {host} does not define alt host {alias}")]
    AltHostNotFound { host: String, alias: String },
}

/// Why a package could not be put in place for an instance.
#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    NotFound(#[from] HostError),

    #[error("downloaded file {} does not match its descriptor", path.display())]
    IntegrityMismatch { path: PathBuf },

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to extract {}: {reason}", path.display())]
    Extract { path: PathBuf, reason: String },

    #[error("package {name} names no host and no default host is configured")]
    NoHost { name: String },

    #[error("package install was abandoned")]
    Abandoned,
}

/// Errors surfaced while setting up instances from the command line.
#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("failed to read manifest {}: {source}", path.display())]
    ReadManifest {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse manifest {}: {source}", path.display())]
    ParseManifest {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("package {package} names no host and no --host-url was given")]
    MissingHost { package: String },

    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to open log file {}: {source}", path.display())]
    Log {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
