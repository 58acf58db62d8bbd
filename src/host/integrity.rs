use std::path::Path;

use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;
use tracing::debug;

use crate::models::artifact::ArtifactDescriptor;

const BUFFER_SIZE: usize = 64 * 1024;

/// Lowercase hex SHA-256 of a file's contents.
pub async fn file_sha256(path: &Path) -> std::io::Result<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; BUFFER_SIZE];
    loop {
        let bytes_read = file.read(&mut buffer).await?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// True iff `local_path` is a regular file of the advertised size and hash.
/// Any failure, including a missing file, counts as "download again".
pub async fn verify_local(artifact: &ArtifactDescriptor, local_path: &Path) -> bool {
    let Ok(metadata) = tokio::fs::metadata(local_path).await else {
        debug!(path = %local_path.display(), "no local copy");
        return false;
    };
    if !metadata.is_file() || metadata.len() != artifact.expected_size {
        debug!(
            path = %local_path.display(),
            size = metadata.len(),
            expected = artifact.expected_size,
            "size mismatch"
        );
        return false;
    }
    match file_sha256(local_path).await {
        Ok(hash) if hash.eq_ignore_ascii_case(&artifact.expected_hash) => true,
        Ok(hash) => {
            debug!(
                path = %local_path.display(),
                %hash,
                expected = %artifact.expected_hash,
                "hash mismatch"
            );
            false
        }
        Err(e) => {
            debug!(path = %local_path.display(), error = %e, "unreadable local copy");
            false
        }
    }
}
