use std::future::Future;
use std::path::Path;

use tracing::debug;

use super::marker_manager::MarkerManager;
use crate::error::ArtifactError;
use crate::models::download_marker::MarkerFile;

/// Keeps the marker as a YAML file next to the unpacked package.
#[derive(Debug, Default, Clone, Copy)]
pub struct FileMarkerManager {}

impl FileMarkerManager {
    pub fn new() -> Self {
        FileMarkerManager {}
    }
}

fn io_error(path: &Path, source: std::io::Error) -> ArtifactError {
    ArtifactError::Io {
        path: path.to_path_buf(),
        source,
    }
}

impl MarkerManager for FileMarkerManager {
    async fn invoke_if_different<F, Fut>(
        &self,
        path: &Path,
        marker_file: &MarkerFile,
        callback: F,
    ) -> Result<bool, ArtifactError>
    where
        F: Fn() -> Fut + Send,
        Fut: Future<Output = Result<(), ArtifactError>> + Send,
    {
        let yaml = serde_yaml::to_string(marker_file).map_err(|e| ArtifactError::Extract {
            path: path.to_path_buf(),
            reason: format!("failed to encode marker: {}", e),
        })?;

        let (is_different, exists) = match tokio::fs::read(path).await {
            Ok(existing) => (existing != yaml.as_bytes(), true),
            Err(_) => (true, false),
        };

        if !is_different {
            debug!(marker = %path.display(), "marker unchanged, skipping");
            return Ok(false);
        }

        if exists {
            tokio::fs::remove_file(path)
                .await
                .map_err(|e| io_error(path, e))?;
        }

        callback().await?;

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| io_error(parent, e))?;
        }
        tokio::fs::write(path, yaml.as_bytes())
            .await
            .map_err(|e| io_error(path, e))?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tempfile::tempdir;
    use tokio::fs;

    fn marker(sha256: &str) -> MarkerFile {
        MarkerFile {
            name: "images".to_string(),
            version: "1.0".to_string(),
            platform: String::new(),
            sha256: sha256.to_string(),
        }
    }

    #[tokio::test]
    async fn test_invoke_if_different_creates_file_when_missing() {
        // Arrange
        let temp_dir = tempdir().unwrap();
        let marker_path = temp_dir.path().join("marker.yaml");
        let marker_file = marker("dummysha256");
        let manager = FileMarkerManager::new();

        let callback_called = Arc::new(AtomicBool::new(false));
        let callback = || {
            let callback_called = Arc::clone(&callback_called);
            async move {
                callback_called.store(true, Ordering::SeqCst);
                Ok(())
            }
        };

        // Act
        let invoked = manager
            .invoke_if_different(&marker_path, &marker_file, callback)
            .await
            .unwrap();

        // Assert
        assert!(invoked);
        assert!(callback_called.load(Ordering::SeqCst));
        let written_content = fs::read_to_string(&marker_path).await.unwrap();
        let expected_content = serde_yaml::to_string(&marker_file).unwrap();
        assert_eq!(written_content, expected_content);
    }

    #[tokio::test]
    async fn test_invoke_if_different_does_not_call_callback_when_file_is_same() {
        // Arrange
        let temp_dir = tempdir().unwrap();
        let marker_path = temp_dir.path().join("marker.yaml");
        let marker_file = marker("dummysha256");
        fs::write(&marker_path, serde_yaml::to_string(&marker_file).unwrap())
            .await
            .unwrap();
        let manager = FileMarkerManager::new();

        let callback_called = Arc::new(AtomicBool::new(false));
        let callback = || {
            let callback_called = Arc::clone(&callback_called);
            async move {
                callback_called.store(true, Ordering::SeqCst);
                Ok(())
            }
        };

        // Act
        let invoked = manager
            .invoke_if_different(&marker_path, &marker_file, callback)
            .await
            .unwrap();

        // Assert
        assert!(!invoked);
        assert!(!callback_called.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_failed_callback_leaves_no_marker() {
        // Arrange
        let temp_dir = tempdir().unwrap();
        let marker_path = temp_dir.path().join("marker.yaml");
        fs::write(&marker_path, serde_yaml::to_string(&marker("oldsha256")).unwrap())
            .await
            .unwrap();
        let manager = FileMarkerManager::new();

        // Act
        let result = manager
            .invoke_if_different(&marker_path, &marker("newsha256"), || async {
                Err(ArtifactError::Abandoned)
            })
            .await;

        // Assert
        assert!(result.is_err());
        assert!(!marker_path.exists());
    }
}
