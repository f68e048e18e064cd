use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, StoreError};
use crate::mirror::MirrorConfig;
use crate::mirror::discovery::ConnectionProfile;
use crate::resilience::RetryPolicy;

pub const DEFAULT_CONFIG_FILE: &str = "rowmirror.json";

const ENV_FILE: &str = "ROWMIRROR_FILE";
const ENV_SHEET: &str = "ROWMIRROR_SHEET";
const ENV_DATABASE_URL: &str = "ROWMIRROR_DATABASE_URL";
const ENV_TABLE: &str = "ROWMIRROR_TABLE";

/// Application settings persisted as JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub default_file_path: PathBuf,
    pub default_sheet_name: String,
    /// Back the workbook up before bulk operations.
    pub auto_backup: bool,
    pub backup_retention_days: u32,
    pub backup_dir: PathBuf,
    pub mirror: Option<MirrorSettings>,
    pub discovery: Option<DiscoverySettings>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            default_file_path: PathBuf::from("entries.xlsx"),
            default_sheet_name: "Data1".to_string(),
            auto_backup: true,
            backup_retention_days: 30,
            backup_dir: PathBuf::from("backups"),
            mirror: None,
            discovery: None,
        }
    }
}

/// Connection details of the mirror database.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MirrorSettings {
    pub url: String,
    /// Table name; the sheet name is used when absent.
    #[serde(default)]
    pub table: Option<String>,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default = "default_retry_initial_delay_ms")]
    pub retry_initial_delay_ms: u64,
}

impl MirrorSettings {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            table: None,
            connect_timeout_secs: default_connect_timeout_secs(),
            retry_attempts: default_retry_attempts(),
            retry_initial_delay_ms: default_retry_initial_delay_ms(),
        }
    }
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_retry_attempts() -> u32 {
    RetryPolicy::default().max_attempts
}

fn default_retry_initial_delay_ms() -> u64 {
    RetryPolicy::default().initial_delay.as_millis() as u64
}

/// Opt-in credential discovery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoverySettings {
    pub enabled: bool,
    /// Profiles tried in order.
    pub candidates: Vec<ConnectionProfile>,
    /// Database created and used on the discovered server.
    pub database: String,
    pub start_service: bool,
    /// Commands tried in order to start the service, e.g. `["systemctl", "start", "mysql"]`.
    pub service_commands: Vec<Vec<String>>,
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self {
            enabled: false,
            candidates: Vec::new(),
            database: "rowmirror".to_string(),
            start_service: false,
            service_commands: Vec::new(),
        }
    }
}

impl Settings {
    /// Loads settings with priority: environment > file > defaults. A missing
    /// file yields the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_with(path, |key| std::env::var(key).ok())
    }

    /// Like [`Settings::load`] with a custom environment lookup.
    pub fn load_with<E>(path: Option<&Path>, env: E) -> Result<Self>
    where
        E: Fn(&str) -> Option<String>,
    {
        let path = path.map(Path::to_path_buf).unwrap_or_else(Self::default_config_path);
        let mut settings = if path.exists() {
            let contents = std::fs::read_to_string(&path).map_err(|err| StoreError::Config {
                path: path.clone(),
                reason: err.to_string(),
            })?;
            serde_json::from_str(&contents).map_err(|err| StoreError::Config {
                path: path.clone(),
                reason: err.to_string(),
            })?
        } else {
            Self::default()
        };

        if let Some(file) = env(ENV_FILE) {
            settings.default_file_path = PathBuf::from(file);
        }
        if let Some(sheet) = env(ENV_SHEET) {
            settings.default_sheet_name = sheet;
        }
        if let Some(url) = env(ENV_DATABASE_URL) {
            match &mut settings.mirror {
                Some(mirror) => mirror.url = url,
                None => settings.mirror = Some(MirrorSettings::new(url)),
            }
        }
        if let Some(table) = env(ENV_TABLE) {
            if let Some(mirror) = &mut settings.mirror {
                mirror.table = Some(table);
            }
        }

        Ok(settings)
    }

    pub fn default_config_path() -> PathBuf {
        PathBuf::from(DEFAULT_CONFIG_FILE)
    }

    /// Writes the settings as pretty-printed JSON.
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json).map_err(|err| StoreError::access(path, err))
    }

    /// The mirror to use for `sheet`, or `None` when mirroring is off.
    pub fn mirror_config(&self, sheet: &str) -> Result<Option<MirrorConfig>> {
        let Some(mirror) = &self.mirror else {
            return Ok(None);
        };
        let table = mirror.table.as_deref().unwrap_or(sheet);
        let config = MirrorConfig::new(mirror.url.clone(), table)?
            .with_connect_timeout(Duration::from_secs(mirror.connect_timeout_secs))
            .with_retry(RetryPolicy::new(
                mirror.retry_attempts,
                Duration::from_millis(mirror.retry_initial_delay_ms),
            ));
        Ok(Some(config))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::error::ErrorKind;
    use tempfile::tempdir;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn missing_file_uses_defaults() {
        let dir = tempdir().unwrap();
        let settings = Settings::load_with(Some(&dir.path().join("absent.json")), no_env).unwrap();

        assert_eq!(settings, Settings::default());
        assert_eq!(settings.default_sheet_name, "Data1");
        assert!(settings.mirror_config("Data1").unwrap().is_none());
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{"default_sheet_name": "Line2", "mirror": {"url": "sqlite://mirror.db"}}"#,
        )
        .unwrap();

        let settings = Settings::load_with(Some(&path), no_env).unwrap();
        assert_eq!(settings.default_sheet_name, "Line2");
        assert_eq!(settings.backup_retention_days, 30);

        let mirror = settings.mirror_config("Line 2").unwrap().unwrap();
        assert_eq!(mirror.table(), "Line2");
        assert_eq!(mirror.retry().max_attempts, 3);
        assert_eq!(mirror.connect_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn environment_overrides_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"default_file_path": "from-file.xlsx"}"#).unwrap();

        let env: HashMap<&str, &str> = HashMap::from([
            ("ROWMIRROR_FILE", "from-env.xlsx"),
            ("ROWMIRROR_DATABASE_URL", "mysql://root@localhost/plant"),
            ("ROWMIRROR_TABLE", "entries"),
        ]);
        let settings =
            Settings::load_with(Some(&path), |key| env.get(key).map(|value| value.to_string()))
                .unwrap();

        assert_eq!(settings.default_file_path, PathBuf::from("from-env.xlsx"));
        let mirror = settings.mirror_config("Data1").unwrap().unwrap();
        assert_eq!(mirror.table(), "entries");
        assert_eq!(mirror.url(), "mysql://root@localhost/plant");
    }

    #[test]
    fn invalid_json_is_a_config_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{ not json").unwrap();

        let err = Settings::load_with(Some(&path), no_env).unwrap_err();
        assert!(matches!(err, StoreError::Config { .. }));
        assert_eq!(err.kind(), ErrorKind::Other);
    }

    #[test]
    fn saved_settings_load_back() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("settings.json");
        let mut settings = Settings::default();
        settings.auto_backup = false;
        settings.discovery = Some(DiscoverySettings {
            enabled: true,
            candidates: vec![ConnectionProfile::new("localhost", 3306, "root", "")],
            ..DiscoverySettings::default()
        });

        settings.save(&path).unwrap();
        assert_eq!(Settings::load_with(Some(&path), no_env).unwrap(), settings);
    }
}
