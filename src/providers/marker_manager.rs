use std::future::Future;
use std::path::Path;

use crate::error::ArtifactError;
use crate::models::download_marker::MarkerFile;

pub trait MarkerManager {
    /// Runs `callback` unless the marker at `path` already records
    /// `marker_file`, then records it.
    fn invoke_if_different<F, Fut>(
        &self,
        path: &Path,
        marker_file: &MarkerFile,
        callback: F,
    ) -> impl Future<Output = Result<bool, ArtifactError>> + Send
    where
        F: Fn() -> Fut + Send,
        Fut: Future<Output = Result<(), ArtifactError>> + Send;
}
