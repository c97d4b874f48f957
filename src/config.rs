//! Engine configuration
//!
//! Stored as `<data_dir>/config.json`. Every field has a default, so a missing
//! or partial file still yields a usable configuration.

use crate::core::error::{Error, Result};
use crate::core::kernel::iproute::DEFAULT_ROUTE_PROTOCOL;
use crate::utils::get_data_dir;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::warn;

pub const CONFIG_FILE_NAME: &str = "config.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Name of the managed `inet` table
    #[serde(default = "default_table_name")]
    pub table_name: String,
    /// iproute2 protocol id tagging managed policy rules and routes
    #[serde(default = "default_route_protocol")]
    pub route_protocol: u32,
    /// Root of the proc filesystem (sysctl writes)
    #[serde(default = "default_proc_root")]
    pub proc_root: PathBuf,
    /// Bounded capacity of the log callback queue
    #[serde(default = "default_log_queue_capacity")]
    pub log_queue_capacity: usize,
    #[serde(default = "default_true")]
    pub audit_log: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            table_name: default_table_name(),
            route_protocol: default_route_protocol(),
            proc_root: default_proc_root(),
            log_queue_capacity: default_log_queue_capacity(),
            audit_log: true,
        }
    }
}

fn default_table_name() -> String {
    "phantom".to_string()
}

fn default_route_protocol() -> u32 {
    DEFAULT_ROUTE_PROTOCOL
}

fn default_proc_root() -> PathBuf {
    PathBuf::from("/proc")
}

fn default_log_queue_capacity() -> usize {
    256
}

fn default_true() -> bool {
    true
}

impl EngineConfig {
    /// # Errors
    ///
    /// [`Error::Validation`] for a table name nft would reject, a route
    /// protocol outside 5..=255 (lower ids belong to the kernel and boot
    /// scripts), or a zero queue capacity.
    pub fn validate(&self) -> Result<()> {
        let name_ok = !self.table_name.is_empty()
            && self.table_name.len() <= 32
            && self
                .table_name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
            && self
                .table_name
                .chars()
                .next()
                .is_some_and(|c| c.is_ascii_alphabetic());
        if !name_ok {
            return Err(Error::validation(
                "table_name",
                format!("'{}' is not a valid nftables table name", self.table_name),
            ));
        }
        if !(5..=255).contains(&self.route_protocol) {
            return Err(Error::validation(
                "route_protocol",
                format!("{} is outside 5..=255", self.route_protocol),
            ));
        }
        if self.log_queue_capacity == 0 {
            return Err(Error::validation("log_queue_capacity", "must be positive"));
        }
        Ok(())
    }
}

pub fn default_config_path() -> Option<PathBuf> {
    get_data_dir().map(|dir| dir.join(CONFIG_FILE_NAME))
}

/// Reads `path`, falling back to defaults when it is missing or unreadable.
pub fn load_config_from(path: &Path) -> EngineConfig {
    match std::fs::read_to_string(path) {
        Ok(json) => match serde_json::from_str::<EngineConfig>(&json) {
            Ok(config) => return config,
            Err(e) => warn!("Ignoring malformed config {}: {e}", path.display()),
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Cannot read config {}: {e}", path.display()),
    }
    EngineConfig::default()
}

/// Loads the config from the default location, or returns defaults.
pub fn load_config() -> EngineConfig {
    default_config_path().map_or_else(EngineConfig::default, |p| load_config_from(&p))
}

/// Writes `config` to `path` atomically: temp file in the same directory,
/// mode 0600, then rename.
///
/// # Errors
///
/// I/O and serialization errors.
pub fn save_config_to(config: &EngineConfig, path: &Path) -> Result<()> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir)?;

    let json = serde_json::to_string_pretty(config)?;
    let mut file = tempfile::NamedTempFile::new_in(dir)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.as_file()
            .set_permissions(std::fs::Permissions::from_mode(0o600))?;
    }

    file.write_all(json.as_bytes())?;
    file.as_file().sync_all()?;
    file.persist(path).map_err(|e| {
        if e.error.kind() == std::io::ErrorKind::StorageFull {
            Error::Io(std::io::Error::new(
                std::io::ErrorKind::StorageFull,
                "Disk full: cannot save configuration",
            ))
        } else {
            Error::Io(e.error)
        }
    })?;
    Ok(())
}

/// # Errors
///
/// [`Error::Internal`] when no data directory can be determined, otherwise
/// as [`save_config_to`].
pub fn save_config(config: &EngineConfig) -> Result<()> {
    let path = default_config_path()
        .ok_or_else(|| Error::Internal("no data directory for config".into()))?;
    save_config_to(config, &path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: EngineConfig = serde_json::from_str(r#"{"table_name":"edge"}"#).unwrap();
        assert_eq!(config.table_name, "edge");
        assert_eq!(config.route_protocol, DEFAULT_ROUTE_PROTOCOL);
        assert!(config.audit_log);
        assert_eq!(config.log_queue_capacity, 256);
    }

    #[test]
    fn test_validation() {
        assert!(EngineConfig::default().validate().is_ok());
        let bad_table = EngineConfig {
            table_name: "bad name".into(),
            ..EngineConfig::default()
        };
        assert!(bad_table.validate().is_err());
        let bad_proto = EngineConfig {
            route_protocol: 3,
            ..EngineConfig::default()
        };
        assert!(bad_proto.validate().is_err());
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join(CONFIG_FILE_NAME);
        let config = EngineConfig {
            table_name: "edge".into(),
            route_protocol: 200,
            ..EngineConfig::default()
        };
        save_config_to(&config, &path).unwrap();
        assert_eq!(load_config_from(&path), config);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn test_missing_or_malformed_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        assert_eq!(load_config_from(&path), EngineConfig::default());
        std::fs::write(&path, "{not json").unwrap();
        assert_eq!(load_config_from(&path), EngineConfig::default());
    }
}
