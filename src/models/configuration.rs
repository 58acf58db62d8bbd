use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::LaunchError;

pub static CACHE_LOCATION: &str = "~/.launcher";

static ARCH_MAPPING: std::sync::LazyLock<HashMap<&str, &str>> = std::sync::LazyLock::new(|| {
    let mut map = HashMap::new();
    map.insert("x86_64", "amd64");
    map.insert("aarch64", "arm64");
    map
});

/// `<os>_<arch>` using the short architecture names hosts publish under.
pub fn platform_string(os: &str, arch: &str) -> String {
    let arch = ARCH_MAPPING.get(arch).copied().unwrap_or(arch);
    format!("{}_{}", os, arch)
}

pub fn default_platform() -> String {
    platform_string(std::env::consts::OS, std::env::consts::ARCH)
}

pub fn default_root_dir() -> PathBuf {
    PathBuf::from(shellexpand::tilde(CACHE_LOCATION).as_ref())
}

/// Settings the orchestration core resolves against.
#[derive(Debug, Clone)]
pub struct LauncherConfig {
    pub root_dir: PathBuf,
    pub host_url: Option<String>,
    pub platform: String,
    pub force_refresh: bool,
    pub max_mirrors: usize,
    pub idle_interval: Duration,
}

impl Default for LauncherConfig {
    fn default() -> Self {
        LauncherConfig {
            root_dir: default_root_dir(),
            host_url: None,
            platform: default_platform(),
            force_refresh: false,
            max_mirrors: 2,
            idle_interval: Duration::from_millis(5),
        }
    }
}

/// What one instance needs before, and runs after, its downloads.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct InstanceManifest {
    pub name: String,
    #[serde(default)]
    pub packages: Vec<PackageRequirement>,
    #[serde(default)]
    pub fetch: Vec<FetchEntry>,
    #[serde(default)]
    pub command: Vec<String>,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct PackageRequirement {
    pub name: String,
    #[serde(default)]
    pub version: String,
    pub host: Option<String>,
    #[serde(rename = "altHost")]
    pub alt_host: Option<String>,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct FetchEntry {
    pub url: String,
    pub post: Option<String>,
    pub output: PathBuf,
}

pub async fn read_yaml_file(path: &Path) -> Result<InstanceManifest, LaunchError> {
    let file = tokio::fs::read(path)
        .await
        .map_err(|source| LaunchError::ReadManifest {
            path: path.to_path_buf(),
            source,
        })?;
    serde_yaml::from_slice(&file).map_err(|source| LaunchError::ParseManifest {
        path: path.to_path_buf(),
        source,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum WindowType {
    Toplevel,
    Embedded,
    Fullscreen,
    Hidden,
}

impl WindowType {
    pub fn as_str(&self) -> &'static str {
        match self {
            WindowType::Toplevel => "toplevel",
            WindowType::Embedded => "embedded",
            WindowType::Fullscreen => "fullscreen",
            WindowType::Hidden => "hidden",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowPlacement {
    pub window_type: WindowType,
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

/// Parses `"a,b"`.
pub fn parse_int_pair(arg: &str) -> Result<(i32, i32), String> {
    let (a, b) = arg
        .split_once(',')
        .ok_or_else(|| format!("expected two comma-separated integers, got {:?}", arg))?;
    let a = a.trim().parse().map_err(|_| format!("invalid integer {:?}", a))?;
    let b = b.trim().parse().map_err(|_| format!("invalid integer {:?}", b))?;
    Ok((a, b))
}

/// One rectangle per instance. Embedded instances share the requested area
/// in a grid; every other window type gets the same rectangle.
pub fn tile_windows(
    window_type: WindowType,
    origin: (i32, i32),
    size: (i32, i32),
    count: usize,
) -> Vec<WindowPlacement> {
    let (x, y) = origin;
    let (mut width, mut height) = size;
    if window_type != WindowType::Embedded || count == 0 {
        return vec![
            WindowPlacement {
                window_type,
                x,
                y,
                width,
                height,
            };
            count
        ];
    }

    if width == 0 && height == 0 {
        width = 640;
        height = 480;
    }
    let rows = ((count as f64).sqrt() as usize).max(1);
    let columns = count.div_ceil(rows);
    let cell_width = width / columns as i32;
    let cell_height = height / rows as i32;

    (0..count)
        .map(|i| {
            let (row, column) = (i / columns, i % columns);
            WindowPlacement {
                window_type,
                x: x + column as i32 * cell_width,
                y: y + row as i32 * cell_height,
                width: cell_width,
                height: cell_height,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use tokio::fs;

    #[tokio::test]
    async fn test_read_yaml_file() {
        // Arrange
        let temp_dir = tempdir().unwrap();
        let test_file_path = temp_dir.path().join("instance.yaml");
        let test_content = r#"
        name: demo
        packages:
            - name: coreapi
              version: "1.0"
            - name: images
              host: http://alt.example.test/packages/
              altHost: beta
        fetch:
            - url: http://example.test/data.bin
              output: data/data.bin
            - url: http://example.test/form
              post: a=1&b=2
              output: reply.txt
        command: ["./run.sh", "--fast"]
"#;
        fs::write(&test_file_path, test_content).await.unwrap();

        // Act
        let manifest = read_yaml_file(&test_file_path).await.unwrap();

        // Assert
        assert_eq!(manifest.name, "demo");
        assert_eq!(manifest.packages.len(), 2);
        assert_eq!(manifest.packages[0].version, "1.0");
        assert_eq!(manifest.packages[1].alt_host.as_deref(), Some("beta"));
        assert_eq!(manifest.fetch[1].post.as_deref(), Some("a=1&b=2"));
        assert_eq!(manifest.command, vec!["./run.sh", "--fast"]);
    }

    #[tokio::test]
    async fn test_read_yaml_file_reports_missing_file() {
        let result = read_yaml_file(Path::new("/nonexistent/instance.yaml")).await;
        assert!(matches!(result, Err(LaunchError::ReadManifest { .. })));
    }

    #[test]
    fn test_platform_string_maps_architecture() {
        assert_eq!(platform_string("linux", "aarch64"), "linux_arm64");
        assert_eq!(platform_string("linux", "x86_64"), "linux_amd64");
        assert_eq!(platform_string("windows", "x86"), "windows_x86");
    }

    #[test]
    fn test_parse_int_pair() {
        assert_eq!(parse_int_pair("800,600"), Ok((800, 600)));
        assert!(parse_int_pair("800").is_err());
        assert!(parse_int_pair("800,abc").is_err());
    }

    #[test]
    fn test_tile_embedded_windows_in_grid() {
        // Act
        let placements = tile_windows(WindowType::Embedded, (0, 0), (0, 0), 3);

        // Assert
        // one row of three columns in the default 640x480 area
        assert_eq!(placements.len(), 3);
        assert_eq!(placements[0].width, 213);
        assert_eq!(placements[0].height, 480);
        assert_eq!(placements[2].x, 426);
        assert_eq!(placements[2].y, 0);
    }

    #[test]
    fn test_tile_four_embedded_windows_two_by_two() {
        let placements = tile_windows(WindowType::Embedded, (10, 20), (400, 400), 4);
        assert_eq!(placements[3].x, 210);
        assert_eq!(placements[3].y, 220);
        assert_eq!(placements[3].width, 200);
    }

    #[test]
    fn test_toplevel_windows_share_rectangle() {
        let placements = tile_windows(WindowType::Toplevel, (5, 5), (300, 200), 2);
        assert!(placements.iter().all(|p| p.x == 5 && p.width == 300));
    }

    #[test]
    fn test_default_config_uses_cache_location() {
        let config = LauncherConfig::default();
        assert!(config.root_dir.ends_with(".launcher"));
        assert_eq!(config.max_mirrors, 2);
    }
}
