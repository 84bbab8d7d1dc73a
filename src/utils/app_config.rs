/// Application configuration management
/// Stored in ~/.config/docker-stack-backup/config.toml unless overridden

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::core::backup::{PasswordSource, ResticSettings, RetentionPolicy, VerifyDepth};
use crate::core::cloud::RcloneSettings;
use crate::core::dirlist::DirListManager;
use crate::core::docker::ComposeRuntime;
use crate::core::error::ConfigError;
use crate::utils::constants::*;
use crate::utils::helpers::expand_home;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub paths: PathsConfig,
    pub docker: DockerConfig,
    pub backup: BackupConfig,
    pub cloud: CloudConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Managed root; every subdirectory with a compose manifest is a stack
    pub base_dir: Option<PathBuf>,
    pub dirlist_file: PathBuf,
    pub pid_file: PathBuf,
    pub log_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        let config_dir = dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_NAME);
        let run_dir = dirs::runtime_dir().unwrap_or_else(std::env::temp_dir);
        let log_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_NAME)
            .join("logs");

        Self {
            base_dir: None,
            dirlist_file: config_dir.join(DIRLIST_FILE_NAME),
            pid_file: run_dir.join(format!("{}.pid", APP_NAME)),
            log_dir,
        }
    }
}

/// Timeouts in seconds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DockerConfig {
    pub stop_timeout: u64,
    pub start_timeout: u64,
    pub status_timeout: u64,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            stop_timeout: DEFAULT_STOP_TIMEOUT,
            start_timeout: DEFAULT_START_TIMEOUT,
            status_timeout: DEFAULT_STATUS_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    pub repository: String,
    pub password: Option<String>,
    pub password_file: Option<PathBuf>,
    pub password_command: Option<String>,
    pub hostname: Option<String>,
    pub backup_timeout: u64,
    pub verify: bool,
    pub verify_depth: VerifyDepth,
    pub auto_prune: bool,
    pub keep_daily: u32,
    pub keep_weekly: u32,
    pub keep_monthly: u32,
    pub keep_yearly: u32,
    pub dry_run: bool,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            repository: String::new(),
            password: None,
            password_file: None,
            password_command: None,
            hostname: None,
            backup_timeout: DEFAULT_BACKUP_TIMEOUT,
            verify: true,
            verify_depth: VerifyDepth::default(),
            auto_prune: false,
            keep_daily: 7,
            keep_weekly: 4,
            keep_monthly: 6,
            keep_yearly: 0,
            dry_run: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CloudConfig {
    pub remote: Option<String>,
    pub path: String,
    pub transfers: u32,
    pub bandwidth_limit: Option<String>,
    pub retries: u32,
    pub transfer_timeout: u64,
    pub dry_run: bool,
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            remote: None,
            path: "restic".to_string(),
            transfers: DEFAULT_TRANSFERS,
            bandwidth_limit: None,
            retries: DEFAULT_TRANSFER_RETRIES,
            transfer_timeout: DEFAULT_TRANSFER_TIMEOUT,
            dry_run: false,
        }
    }
}

impl AppConfig {
    /// Config file location: `$DOCKER_STACK_BACKUP_CONFIG`, else the user config dir
    pub fn default_path() -> PathBuf {
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            if !path.trim().is_empty() {
                return expand_home(path.trim());
            }
        }
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_NAME)
            .join("config.toml")
    }

    /// Load configuration from file.
    ///
    /// An explicitly given file must exist; a missing default file yields
    /// the built-in defaults.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let path = match explicit {
            Some(path) => path.to_path_buf(),
            None => Self::default_path(),
        };

        if !path.exists() {
            if explicit.is_some() {
                return Err(ConfigError::NotFound(path));
            }
            return Ok(Self::default().normalized());
        }

        let contents = fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;
        Self::parse(&contents).map_err(|source| ConfigError::Parse { path, source })
    }

    pub fn parse(contents: &str) -> Result<Self, toml::de::Error> {
        let config: Self = toml::from_str(contents)?;
        Ok(config.normalized())
    }

    fn normalized(mut self) -> Self {
        let expand = |path: &Path| expand_home(&path.to_string_lossy());
        self.paths.base_dir = self.paths.base_dir.as_deref().map(expand);
        self.paths.dirlist_file = expand(&self.paths.dirlist_file);
        self.paths.pid_file = expand(&self.paths.pid_file);
        self.paths.log_dir = expand(&self.paths.log_dir);
        self.backup.password_file = self.backup.password_file.as_deref().map(expand);
        self
    }

    /// Everything a backup run needs. Called before anything is touched.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let base_dir = self.base_dir()?;
        if !base_dir.is_dir() {
            return Err(ConfigError::Invalid {
                field: "paths.base_dir",
                reason: format!("{} is not a directory", base_dir.display()),
            });
        }
        if self.docker.stop_timeout == 0 || self.docker.start_timeout == 0 {
            return Err(ConfigError::Invalid {
                field: "docker",
                reason: "stop and start timeouts must be positive".into(),
            });
        }
        self.password_source()?;
        if self.backup.repository.trim().is_empty() {
            return Err(ConfigError::Missing("backup.repository"));
        }
        Ok(())
    }

    /// Checks for the cloud commands only
    pub fn validate_cloud(&self) -> Result<(), ConfigError> {
        self.remote()?;
        if self.cloud.retries == 0 {
            return Err(ConfigError::Invalid {
                field: "cloud.retries",
                reason: "must be at least 1".into(),
            });
        }
        Ok(())
    }

    pub fn base_dir(&self) -> Result<&Path, ConfigError> {
        self.paths
            .base_dir
            .as_deref()
            .ok_or(ConfigError::Missing("paths.base_dir"))
    }

    fn remote(&self) -> Result<&str, ConfigError> {
        self.cloud
            .remote
            .as_deref()
            .filter(|r| !r.trim().is_empty())
            .ok_or(ConfigError::Missing("cloud.remote"))
    }

    /// Exactly one credential source must be configured
    pub fn password_source(&self) -> Result<PasswordSource, ConfigError> {
        let backup = &self.backup;
        let mut sources = Vec::new();
        if let Some(password) = &backup.password {
            sources.push(PasswordSource::Inline(password.clone()));
        }
        if let Some(file) = &backup.password_file {
            sources.push(PasswordSource::File(file.clone()));
        }
        if let Some(command) = &backup.password_command {
            sources.push(PasswordSource::Command(command.clone()));
        }

        match sources.len() {
            1 => Ok(sources.remove(0)),
            0 => Err(ConfigError::Missing(
                "backup.password, backup.password_file or backup.password_command",
            )),
            n => Err(ConfigError::Invalid {
                field: "backup",
                reason: format!("{} password sources set, use exactly one", n),
            }),
        }
    }

    pub fn restic_settings(&self) -> Result<ResticSettings, ConfigError> {
        let backup = &self.backup;
        if backup.repository.trim().is_empty() {
            return Err(ConfigError::Missing("backup.repository"));
        }
        Ok(ResticSettings {
            repository: backup.repository.clone(),
            password: self.password_source()?,
            verify: backup.verify,
            verify_depth: backup.verify_depth,
            auto_prune: backup.auto_prune,
            retention: RetentionPolicy {
                keep_daily: backup.keep_daily,
                keep_weekly: backup.keep_weekly,
                keep_monthly: backup.keep_monthly,
                keep_yearly: backup.keep_yearly,
            },
            backup_timeout: Duration::from_secs(backup.backup_timeout),
            dry_run: backup.dry_run,
        })
    }

    pub fn rclone_settings(&self) -> Result<RcloneSettings, ConfigError> {
        self.validate_cloud()?;
        let cloud = &self.cloud;
        Ok(RcloneSettings {
            remote: self.remote()?.to_string(),
            path: cloud.path.clone(),
            transfers: cloud.transfers,
            bandwidth_limit: cloud.bandwidth_limit.clone(),
            retries: cloud.retries,
            transfer_timeout: Duration::from_secs(cloud.transfer_timeout),
            dry_run: cloud.dry_run,
        })
    }

    pub fn compose_runtime(&self) -> ComposeRuntime {
        ComposeRuntime::new(
            Duration::from_secs(self.docker.stop_timeout),
            Duration::from_secs(self.docker.start_timeout),
            Duration::from_secs(self.docker.status_timeout),
        )
    }

    pub fn dirlist_manager(&self) -> Result<DirListManager, ConfigError> {
        Ok(DirListManager::new(
            self.base_dir()?,
            &self.paths.dirlist_file,
        ))
    }

    /// Effective configuration as TOML, inline password masked
    pub fn to_redacted_toml(&self) -> Result<String, toml::ser::Error> {
        let mut shown = self.clone();
        if shown.backup.password.is_some() {
            shown.backup.password = Some("********".to_string());
        }
        toml::to_string_pretty(&shown)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_apply_to_missing_sections() {
        let config = AppConfig::parse(
            r#"
            [paths]
            base_dir = "/srv/stacks"

            [backup]
            repository = "/mnt/restic"
            password_file = "/etc/restic.pass"
            "#,
        )
        .unwrap();

        assert_eq!(config.paths.base_dir, Some(PathBuf::from("/srv/stacks")));
        assert_eq!(config.docker.stop_timeout, DEFAULT_STOP_TIMEOUT);
        assert_eq!(config.cloud.retries, DEFAULT_TRANSFER_RETRIES);
        assert!(config.backup.verify);
        assert_eq!(config.backup.verify_depth, VerifyDepth::Metadata);
        assert_eq!(
            config.password_source().unwrap(),
            PasswordSource::File(PathBuf::from("/etc/restic.pass"))
        );
    }

    #[test]
    fn test_unknown_verify_depth_is_rejected() {
        let err = AppConfig::parse("[backup]\nverify_depth = \"everything\"\n");
        assert!(err.is_err());

        let config = AppConfig::parse("[backup]\nverify_depth = \"data\"\n").unwrap();
        assert_eq!(config.backup.verify_depth, VerifyDepth::Data);
    }

    #[test]
    fn test_exactly_one_password_source() {
        let mut config = AppConfig::default();
        assert!(matches!(
            config.password_source(),
            Err(ConfigError::Missing(_))
        ));

        config.backup.password = Some("secret".into());
        config.backup.password_command = Some("pass show restic".into());
        assert!(matches!(
            config.password_source(),
            Err(ConfigError::Invalid { .. })
        ));

        config.backup.password_command = None;
        assert_eq!(
            config.password_source().unwrap(),
            PasswordSource::Inline("secret".into())
        );
    }

    #[test]
    fn test_validate_requires_existing_base_dir() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AppConfig::default();
        config.backup.repository = "/mnt/restic".into();
        config.backup.password = Some("secret".into());

        assert!(matches!(config.validate(), Err(ConfigError::Missing("paths.base_dir"))));

        config.paths.base_dir = Some(dir.path().join("missing"));
        assert!(matches!(config.validate(), Err(ConfigError::Invalid { .. })));

        config.paths.base_dir = Some(dir.path().to_path_buf());
        config.validate().unwrap();
    }

    #[test]
    fn test_cloud_requires_remote() {
        let mut config = AppConfig::default();
        assert!(matches!(
            config.rclone_settings(),
            Err(ConfigError::Missing("cloud.remote"))
        ));

        config.cloud.remote = Some("b2:bucket".into());
        let settings = config.rclone_settings().unwrap();
        assert_eq!(settings.transfers, DEFAULT_TRANSFERS);
        assert_eq!(settings.transfer_timeout, Duration::from_secs(DEFAULT_TRANSFER_TIMEOUT));
    }

    #[test]
    fn test_explicit_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.toml");
        assert!(matches!(
            AppConfig::load(Some(&missing)),
            Err(ConfigError::NotFound(_))
        ));

        let path = dir.path().join("config.toml");
        fs::write(&path, "[docker]\nstop_timeout = 60\n").unwrap();
        assert_eq!(AppConfig::load(Some(&path)).unwrap().docker.stop_timeout, 60);
    }

    #[test]
    fn test_redacted_output_masks_password() {
        let mut config = AppConfig::default();
        config.backup.password = Some("hunter2".into());
        let shown = config.to_redacted_toml().unwrap();
        assert!(!shown.contains("hunter2"));
        assert!(shown.contains("********"));
    }
}
