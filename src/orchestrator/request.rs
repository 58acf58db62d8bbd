use std::path::PathBuf;

use bytes::Bytes;

use crate::download::CorrelationId;
use crate::error::ArtifactError;

/// A package an instance needs put in place before it can run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageRequest {
    /// Falls back to the configured default host when absent.
    pub host_url: Option<String>,
    pub name: String,
    pub version: String,
    pub alt_host: Option<String>,
    pub correlation_id: CorrelationId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstanceRequest {
    FetchUrl {
        url: String,
        correlation_id: CorrelationId,
    },
    PostUrl {
        url: String,
        body: Bytes,
        correlation_id: CorrelationId,
    },
    FetchPackage(PackageRequest),
    Stop,
    Notify(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedStatus {
    InProgress,
    Done,
    HttpError,
    TransportError,
}

impl FeedStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, FeedStatus::InProgress)
    }
}

/// One delivery to an instance for a plain URL transfer. Terminal feeds
/// carry an empty chunk.
#[derive(Debug, Clone, Copy)]
pub struct Feed<'a> {
    pub correlation_id: CorrelationId,
    pub status: FeedStatus,
    pub http_status_code: u16,
    pub total_size: u64,
    pub chunk: &'a [u8],
}

/// The side of a running instance the orchestrator talks to.
pub trait Instance {
    fn name(&self) -> &str;

    /// Drained every tick until it returns `None`.
    fn next_request(&mut self) -> Option<InstanceRequest>;

    /// Returning `false` cancels the transfer; no further feeds follow for it.
    fn feed(&mut self, feed: Feed<'_>) -> bool;

    fn artifact_ready(
        &mut self,
        correlation_id: CorrelationId,
        result: Result<PathBuf, ArtifactError>,
    );

    /// Called once when the instance is torn down.
    fn finish(&mut self);
}
