use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

pub const CONFIG_VERSION: u32 = 1;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexerConfig {
    pub version: u32,
    pub mount_root: String,
    pub ignored_directories: Vec<String>,
    pub state_path: String,
    pub catalog_path: String,
    pub watch_mounts: bool,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            mount_root: "/media".to_string(),
            ignored_directories: Vec::new(),
            state_path: "fingerprints.redb".to_string(),
            catalog_path: "catalog.redb".to_string(),
            watch_mounts: true,
        }
    }
}

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Yaml(serde_yaml::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(err) => write!(f, "io error: {}", err),
            ConfigError::Yaml(err) => write!(f, "yaml error: {}", err),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(err: std::io::Error) -> Self {
        ConfigError::Io(err)
    }
}

impl From<serde_yaml::Error> for ConfigError {
    fn from(err: serde_yaml::Error) -> Self {
        ConfigError::Yaml(err)
    }
}

pub fn config_path_from_env() -> PathBuf {
    match env::var("MEDIAINDEXER_CONFIG") {
        Ok(value) if !value.trim().is_empty() => PathBuf::from(value),
        _ => default_config_path(),
    }
}

fn default_config_path() -> PathBuf {
    match env::current_exe() {
        Ok(exe) => exe
            .parent()
            .map(|dir| dir.join("config.yaml"))
            .unwrap_or_else(|| PathBuf::from("config.yaml")),
        Err(_) => PathBuf::from("config.yaml"),
    }
}

/// Loads the config at `path`, writing the defaults there first when the file
/// does not exist. The flag is true when the file was created.
pub fn load_or_create_config(path: &Path) -> Result<(IndexerConfig, bool), ConfigError> {
    if path.exists() {
        let contents = fs::read_to_string(path)?;
        let mut config: IndexerConfig = serde_yaml::from_str(&contents)?;
        if config.version < CONFIG_VERSION {
            config.version = CONFIG_VERSION;
        }
        if config.mount_root.trim().is_empty() {
            config.mount_root = "/media".to_string();
        }
        if config.state_path.trim().is_empty() {
            config.state_path = "fingerprints.redb".to_string();
        }
        if config.catalog_path.trim().is_empty() {
            config.catalog_path = "catalog.redb".to_string();
        }
        config
            .ignored_directories
            .retain(|dir| !dir.trim().is_empty());
        return Ok((config, false));
    }

    let config = IndexerConfig::default();
    save_config(path, &config)?;
    Ok((config, true))
}

pub fn save_config(path: &Path, config: &IndexerConfig) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let contents = serde_yaml::to_string(config)?;
    fs::write(path, contents)?;
    Ok(())
}

pub fn resolve_path(config_path: &Path, value: &str) -> PathBuf {
    let raw = PathBuf::from(value);
    if raw.is_absolute() {
        return raw;
    }
    let base = config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    base.join(raw)
}

pub fn resolve_ignored(config_path: &Path, config: &IndexerConfig) -> Vec<PathBuf> {
    config
        .ignored_directories
        .iter()
        .map(|dir| resolve_path(config_path, dir.trim()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_is_created_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conf/config.yaml");
        let (config, created) = load_or_create_config(&path).unwrap();
        assert!(created);
        assert!(path.exists());
        assert_eq!(config, IndexerConfig::default());

        let (again, created) = load_or_create_config(&path).unwrap();
        assert!(!created);
        assert_eq!(again, config);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        fs::write(
            &path,
            "mount_root: /mnt/usb\n\
             ignored_directories:\n  - /mnt/usb/android\n  - ''\n\
             state_path: ''\n",
        )
        .unwrap();
        let (config, created) = load_or_create_config(&path).unwrap();
        assert!(!created);
        assert_eq!(config.mount_root, "/mnt/usb");
        assert_eq!(config.ignored_directories, vec!["/mnt/usb/android"]);
        assert_eq!(config.state_path, "fingerprints.redb");
        assert_eq!(config.catalog_path, "catalog.redb");
        assert!(config.watch_mounts);
    }

    #[test]
    fn broken_yaml_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        fs::write(&path, "watch_mounts: [").unwrap();
        assert!(matches!(
            load_or_create_config(&path),
            Err(ConfigError::Yaml(_))
        ));
    }

    #[test]
    fn relative_paths_resolve_next_to_the_config() {
        let config_path = Path::new("/etc/mediaindexer/config.yaml");
        assert_eq!(
            resolve_path(config_path, "catalog.redb"),
            PathBuf::from("/etc/mediaindexer/catalog.redb")
        );
        assert_eq!(
            resolve_path(config_path, "/var/lib/state.redb"),
            PathBuf::from("/var/lib/state.redb")
        );
        assert_eq!(
            resolve_path(Path::new("config.yaml"), "a.redb"),
            PathBuf::from("./a.redb")
        );
    }

    #[test]
    fn ignored_directories_resolve_too() {
        let config = IndexerConfig {
            ignored_directories: vec!["skip".to_string(), "/abs".to_string()],
            ..IndexerConfig::default()
        };
        assert_eq!(
            resolve_ignored(Path::new("/etc/mi/config.yaml"), &config),
            vec![PathBuf::from("/etc/mi/skip"), PathBuf::from("/abs")]
        );
    }
}
