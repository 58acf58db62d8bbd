use std::io::Read;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::ArtifactError;

#[derive(Debug, Default, Clone, Copy)]
pub struct ZipExtractor {}

impl ZipExtractor {
    pub fn new() -> Self {
        ZipExtractor {}
    }
}

struct Entry {
    outpath: PathBuf,
    is_dir: bool,
    mode: Option<u32>,
    content: Vec<u8>,
}

fn extract_error(path: &Path, reason: impl ToString) -> ArtifactError {
    ArtifactError::Extract {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    }
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> ArtifactError + '_ {
    move |source| ArtifactError::Io {
        path: path.to_path_buf(),
        source,
    }
}

impl crate::providers::extractor::Extractor for ZipExtractor {
    async fn extract_to_disk(&self, archive: &Path, folder: &Path) -> Result<(), ArtifactError> {
        let content = tokio::fs::read(archive).await.map_err(io_error(archive))?;
        let mut zip = zip::ZipArchive::new(std::io::Cursor::new(content))
            .map_err(|e| extract_error(archive, format!("Failed to read zip archive: {}", e)))?;

        for i in 0..zip.len() {
            let entry = {
                let mut file = zip.by_index(i).map_err(|e| {
                    extract_error(archive, format!("Failed to get by index {}, {}", i, e))
                })?;
                let Some(relative) = file.enclosed_name() else {
                    warn!(entry = file.name(), "skipping archive entry outside the package");
                    continue;
                };
                let mut content = Vec::new();
                if !file.is_dir() {
                    file.read_to_end(&mut content).map_err(|e| {
                        let message = format!("Failed to read file {}, {}", file.name(), e);
                        extract_error(archive, message)
                    })?;
                }
                Entry {
                    outpath: folder.join(relative),
                    is_dir: file.is_dir(),
                    mode: file.unix_mode(),
                    content,
                }
            };

            if entry.is_dir {
                tokio::fs::create_dir_all(&entry.outpath)
                    .await
                    .map_err(io_error(&entry.outpath))?;
                continue;
            }
            if let Some(parent) = entry.outpath.parent() {
                tokio::fs::create_dir_all(parent).await.map_err(io_error(parent))?;
            }
            tokio::fs::write(&entry.outpath, &entry.content)
                .await
                .map_err(io_error(&entry.outpath))?;
            if let Some(mode) = entry.mode {
                let permissions = std::fs::Permissions::from_mode(mode & 0o777);
                tokio::fs::set_permissions(&entry.outpath, permissions)
                    .await
                    .map_err(io_error(&entry.outpath))?;
            }
            debug!(path = %entry.outpath.display(), bytes = entry.content.len(), "extracted");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::providers::extractor::Extractor;

    use super::*;
    use std::fs;
    use std::io::Write;
    use tempfile::tempdir;

    fn write_zip(path: &Path, entries: &[(&str, &[u8], u32)]) {
        let mut zip_buffer = Vec::new();
        {
            let mut zip_writer = zip::ZipWriter::new(std::io::Cursor::new(&mut zip_buffer));
            for (name, content, mode) in entries {
                let options: zip::write::FileOptions<()> =
                    zip::write::FileOptions::default().unix_permissions(*mode);
                zip_writer.start_file(*name, options).unwrap();
                zip_writer.write_all(content).unwrap();
            }
            zip_writer.finish().unwrap();
        }
        fs::write(path, zip_buffer).unwrap();
    }

    #[tokio::test]
    async fn test_extract_to_disk() {
        // Arrange
        let temp_dir = tempdir().unwrap();
        let archive = temp_dir.path().join("package.zip");
        let folder = temp_dir.path().join("package");
        write_zip(
            &archive,
            &[
                ("test_file.txt", b"Hello, world!", 0o644),
                ("bin/test_executable", b"Executable content", 0o755),
            ],
        );

        // Act
        let extractor = ZipExtractor::new();
        extractor.extract_to_disk(&archive, &folder).await.unwrap();

        // Assert
        let extracted_file_path = folder.join("test_file.txt");
        let extracted_executable_path = folder.join("bin").join("test_executable");

        assert_eq!(fs::read_to_string(extracted_file_path).unwrap(), "Hello, world!");
        assert_eq!(
            fs::read_to_string(&extracted_executable_path).unwrap(),
            "Executable content"
        );

        let metadata = fs::metadata(&extracted_executable_path).unwrap();
        assert_eq!(metadata.permissions().mode() & 0o777, 0o755);
    }

    #[tokio::test]
    async fn test_extract_rejects_non_zip_content() {
        // Arrange
        let temp_dir = tempdir().unwrap();
        let archive = temp_dir.path().join("package.zip");
        fs::write(&archive, b"definitely not a zip").unwrap();

        // Act
        let result = ZipExtractor::new()
            .extract_to_disk(&archive, &temp_dir.path().join("out"))
            .await;

        // Assert
        assert!(matches!(result, Err(ArtifactError::Extract { .. })));
    }
}
