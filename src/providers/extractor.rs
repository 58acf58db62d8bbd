use std::future::Future;
use std::path::Path;

use crate::error::ArtifactError;

pub trait Extractor {
    /// Unpacks `archive` below `folder`, creating it if needed.
    fn extract_to_disk(
        &self,
        archive: &Path,
        folder: &Path,
    ) -> impl Future<Output = Result<(), ArtifactError>> + Send;
}
