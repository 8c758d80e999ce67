//! Store settings: which backend to open and how to bound work against it

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::model::BackendConfig;
use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreSettings {
    #[serde(default = "default_backend")]
    pub backend: BackendConfig,

    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    #[serde(default = "default_min_connections")]
    pub min_connections: u32,

    #[serde(default = "default_acquire_timeout_secs")]
    pub acquire_timeout_secs: u64,

    /// Upper bound for a store call that owns its transaction
    #[serde(default = "default_operation_timeout_secs")]
    pub operation_timeout_secs: u64,

    #[serde(default)]
    pub transfer: TransferSettings,

    /// Where to record the active backend after a migration, so the next
    /// process start opens the right one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub descriptor_path: Option<PathBuf>,
}

/// External bulk transfer tool used by backend migration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferSettings {
    #[serde(default = "default_transfer_program")]
    pub program: String,

    #[serde(default = "default_transfer_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            program: default_transfer_program(),
            timeout_secs: default_transfer_timeout_secs(),
        }
    }
}

impl TransferSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
            acquire_timeout_secs: default_acquire_timeout_secs(),
            operation_timeout_secs: default_operation_timeout_secs(),
            transfer: TransferSettings::default(),
            descriptor_path: None,
        }
    }
}

impl StoreSettings {
    pub fn new(backend: BackendConfig) -> Self {
        Self {
            backend,
            ..Default::default()
        }
    }

    /// Load settings from a TOML (`.toml`) or YAML (anything else) file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = expand_tilde(path.as_ref())?;
        let contents = std::fs::read_to_string(&path)?;

        let mut settings: StoreSettings =
            if path.extension().and_then(|s| s.to_str()) == Some("toml") {
                toml::from_str(&contents)
                    .map_err(|e| Error::Config(format!("Invalid TOML: {}", e)))?
            } else {
                serde_yaml::from_str(&contents)
                    .map_err(|e| Error::Config(format!("Invalid YAML: {}", e)))?
            };

        settings.expand_paths()?;
        settings.validate()?;
        debug!("Loaded store settings from {:?}", path);
        Ok(settings)
    }

    /// Environment overrides (`GOVSTORE_*`) take precedence over the file
    pub fn merge_env(&mut self) {
        if let Ok(path) = std::env::var("GOVSTORE_SQLITE_PATH") {
            self.backend = BackendConfig::sqlite(path);
        }
        if let Ok(val) = std::env::var("GOVSTORE_OPERATION_TIMEOUT_SECS") {
            match val.parse() {
                Ok(secs) => self.operation_timeout_secs = secs,
                Err(_) => warn!("Invalid GOVSTORE_OPERATION_TIMEOUT_SECS '{}', ignoring", val),
            }
        }
        if let Ok(program) = std::env::var("GOVSTORE_TRANSFER_PROGRAM") {
            self.transfer.program = program;
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.backend.validate()?;
        if self.max_connections == 0 {
            return Err(Error::Config("max_connections must be at least 1".to_string()));
        }
        if self.min_connections > self.max_connections {
            return Err(Error::Config(format!(
                "min_connections ({}) exceeds max_connections ({})",
                self.min_connections, self.max_connections
            )));
        }
        if self.operation_timeout_secs == 0 {
            return Err(Error::Config(
                "operation_timeout_secs must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs)
    }

    fn expand_paths(&mut self) -> Result<()> {
        if let BackendConfig::Sqlite { path } = &mut self.backend {
            *path = expand_tilde(path)?;
        }
        if let Some(path) = self.descriptor_path.as_mut() {
            *path = expand_tilde(path)?;
        }
        Ok(())
    }
}

/// Read a backend descriptor file (JSON, TOML or YAML by extension)
pub fn read_backend_descriptor(path: impl AsRef<Path>) -> Result<BackendConfig> {
    let path = expand_tilde(path.as_ref())?;
    let contents = std::fs::read_to_string(&path)?;

    let backend = match path.extension().and_then(|s| s.to_str()) {
        Some("json") => serde_json::from_str(&contents)?,
        Some("toml") => toml::from_str(&contents)
            .map_err(|e| Error::Config(format!("Invalid TOML: {}", e)))?,
        _ => serde_yaml::from_str(&contents)
            .map_err(|e| Error::Config(format!("Invalid YAML: {}", e)))?,
    };
    Ok(backend)
}

/// Write a backend descriptor file, format chosen by extension.
///
/// Written to a sibling temp file and renamed into place so a reader never
/// sees a partial descriptor.
pub fn write_backend_descriptor(path: impl AsRef<Path>, backend: &BackendConfig) -> Result<()> {
    let path = expand_tilde(path.as_ref())?;

    let contents = match path.extension().and_then(|s| s.to_str()) {
        Some("json") => serde_json::to_string_pretty(backend)?,
        Some("toml") => toml::to_string_pretty(backend)
            .map_err(|e| Error::Config(format!("Failed to encode TOML: {}", e)))?,
        _ => serde_yaml::to_string(backend)
            .map_err(|e| Error::Config(format!("Failed to encode YAML: {}", e)))?,
    };

    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, contents)?;
    std::fs::rename(&tmp, &path)?;

    debug!("Wrote backend descriptor to {:?}", path);
    Ok(())
}

/// Replace a leading `~` with the home directory
pub fn expand_tilde(path: &Path) -> Result<PathBuf> {
    match path.strip_prefix("~") {
        Ok(rest) => Ok(dirs::home_dir()
            .ok_or_else(|| Error::Config("Could not determine home directory".to_string()))?
            .join(rest)),
        Err(_) => Ok(path.to_path_buf()),
    }
}

fn default_backend() -> BackendConfig {
    BackendConfig::sqlite("~/.govstore/config.db")
}

fn default_max_connections() -> u32 {
    5
}

fn default_min_connections() -> u32 {
    1
}

fn default_acquire_timeout_secs() -> u64 {
    5
}

fn default_operation_timeout_secs() -> u64 {
    30
}

fn default_transfer_program() -> String {
    "pgloader".to_string()
}

fn default_transfer_timeout_secs() -> u64 {
    3600
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults() {
        let settings = StoreSettings::default();
        assert_eq!(settings.max_connections, 5);
        assert_eq!(settings.operation_timeout(), Duration::from_secs(30));
        assert_eq!(settings.transfer.program, "pgloader");
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_from_yaml_file() {
        let mut file = NamedTempFile::with_suffix(".yaml").unwrap();
        writeln!(
            file,
            r#"
backend:
  type: postgres
  config:
    host: localhost
    user: gov
    password: secret
    db_name: config
operation_timeout_secs: 10
"#
        )
        .unwrap();

        let settings = StoreSettings::from_file(file.path()).unwrap();
        assert_eq!(settings.operation_timeout_secs, 10);
        match settings.backend {
            BackendConfig::Postgres(pg) => {
                assert_eq!(pg.port, 5432);
                assert_eq!(pg.ssl_mode(), "disable");
            }
            other => panic!("unexpected backend {:?}", other),
        }
    }

    #[test]
    fn test_from_toml_file() {
        let mut file = NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(
            file,
            r#"
max_connections = 8

[backend]
type = "sqlite"

[backend.config]
path = "/tmp/govstore.db"

[transfer]
program = "/usr/local/bin/pgloader"
"#
        )
        .unwrap();

        let settings = StoreSettings::from_file(file.path()).unwrap();
        assert_eq!(settings.max_connections, 8);
        assert_eq!(settings.backend, BackendConfig::sqlite("/tmp/govstore.db"));
        assert_eq!(settings.transfer.timeout_secs, 3600);
    }

    #[test]
    fn test_min_above_max_rejected() {
        let settings = StoreSettings {
            max_connections: 2,
            min_connections: 3,
            ..Default::default()
        };
        assert!(matches!(settings.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_expand_tilde_leaves_absolute_paths() {
        let path = Path::new("/var/lib/govstore.db");
        assert_eq!(expand_tilde(path).unwrap(), path);
    }

    #[test]
    fn test_read_json_descriptor() {
        let mut file = NamedTempFile::with_suffix(".json").unwrap();
        write!(file, r#"{{"type":"sqlite","config":{{"path":"/tmp/next.db"}}}}"#).unwrap();
        let backend = read_backend_descriptor(file.path()).unwrap();
        assert_eq!(backend, BackendConfig::sqlite("/tmp/next.db"));
    }

    #[test]
    fn test_descriptor_written_then_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let backend = BackendConfig::sqlite("/data/govstore.db");

        for name in ["backend.json", "backend.toml", "nested/backend.yaml"] {
            let path = dir.path().join(name);
            write_backend_descriptor(&path, &backend).unwrap();
            assert_eq!(read_backend_descriptor(&path).unwrap(), backend, "{}", name);
            assert!(!path.with_extension("tmp").exists());
        }
    }
}
