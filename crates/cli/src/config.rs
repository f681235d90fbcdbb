//! Configuration management for the CLI
//!
//! Settings are layered: built-in defaults, then an optional
//! `~/.config/db-bounce/config.toml`, then `DB_BOUNCE_*` environment variables.

use anyhow::{bail, Context, Result};
use bounce_lib::{
    MatchOptions, NamePredicate, RestartOptions, RunOptions, WriteMode, DEFAULT_NAME_FRAGMENT,
};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Prefix for environment overrides
pub const ENV_PREFIX: &str = "DB_BOUNCE";

/// Log output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// How controllers are written back
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteModeSetting {
    #[default]
    Unconditional,
    Optimistic,
}

impl From<WriteModeSetting> for WriteMode {
    fn from(v: WriteModeSetting) -> Self {
        match v {
            WriteModeSetting::Unconditional => WriteMode::Unconditional,
            WriteModeSetting::Optimistic => WriteMode::Optimistic,
        }
    }
}

/// Tunables that are not exposed as flags
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// Pods whose name contains this fragment are restarted
    #[serde(default = "default_name_fragment")]
    pub name_fragment: String,

    /// Restart a controller once even if several matching pods name it
    #[serde(default = "default_dedupe_targets")]
    pub dedupe_targets: bool,

    /// Follow ReplicaSet owners to their Deployment
    #[serde(default)]
    pub follow_replica_sets: bool,

    #[serde(default)]
    pub write_mode: WriteModeSetting,

    /// Conflict retries in optimistic write mode
    #[serde(default = "default_max_conflict_retries")]
    pub max_conflict_retries: u32,

    /// Restarts in flight at once
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    #[serde(default)]
    pub log_format: LogFormat,
}

fn default_name_fragment() -> String {
    DEFAULT_NAME_FRAGMENT.to_string()
}

fn default_dedupe_targets() -> bool {
    true
}

fn default_max_conflict_retries() -> u32 {
    3
}

fn default_concurrency() -> usize {
    1
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            name_fragment: default_name_fragment(),
            dedupe_targets: default_dedupe_targets(),
            follow_replica_sets: false,
            write_mode: WriteModeSetting::default(),
            max_conflict_retries: default_max_conflict_retries(),
            concurrency: default_concurrency(),
            log_format: LogFormat::default(),
        }
    }
}

impl Settings {
    /// Load settings from the user config file and environment
    pub fn load() -> Result<Self> {
        let path = Self::config_path();
        Self::load_from(path.as_deref(), ENV_PREFIX)
    }

    /// Load settings from an optional file and environment variables with `env_prefix`
    pub fn load_from(file: Option<&Path>, env_prefix: &str) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = file {
            builder = builder.add_source(config::File::from(path).required(false));
        }

        let config = builder
            .add_source(config::Environment::with_prefix(env_prefix).try_parsing(true))
            .build()
            .context("Failed to read settings")?;

        let settings: Settings = config
            .try_deserialize()
            .context("Failed to parse settings")?;
        settings.validate()?;

        Ok(settings)
    }

    fn validate(&self) -> Result<()> {
        if self.name_fragment.is_empty() {
            bail!("name_fragment must not be empty");
        }
        if self.concurrency == 0 {
            bail!("concurrency must be at least 1");
        }
        Ok(())
    }

    pub fn run_options(&self) -> RunOptions {
        RunOptions {
            matching: MatchOptions {
                predicate: NamePredicate::new(self.name_fragment.clone()),
                dedupe: self.dedupe_targets,
                follow_replica_sets: self.follow_replica_sets,
            },
            restart: RestartOptions {
                write_mode: self.write_mode.into(),
                max_conflict_retries: self.max_conflict_retries,
            },
            concurrency: self.concurrency,
        }
    }

    /// Get the configuration file path
    fn config_path() -> Option<PathBuf> {
        let home = dirs_next::home_dir()?;
        Some(home.join(".config").join("db-bounce").join("config.toml"))
    }
}

/// Kubeconfig path from the flag; empty means ambient cluster access
pub fn kubeconfig_path(flag: &str) -> Option<PathBuf> {
    let flag = flag.trim();
    if flag.is_empty() {
        None
    } else {
        Some(PathBuf::from(flag))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn toml_file(contents: &str) -> NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_defaults_without_sources() {
        let settings = Settings::load_from(None, "DB_BOUNCE_TEST_DEFAULTS").unwrap();

        assert_eq!(settings.name_fragment, "database");
        assert!(settings.dedupe_targets);
        assert!(!settings.follow_replica_sets);
        assert_eq!(settings.write_mode, WriteModeSetting::Unconditional);
        assert_eq!(settings.concurrency, 1);
        assert_eq!(settings.log_format, LogFormat::Text);
    }

    #[test]
    fn test_missing_file_is_ignored() {
        let path = Path::new("/nonexistent/db-bounce/config.toml");
        let settings = Settings::load_from(Some(path), "DB_BOUNCE_TEST_MISSING").unwrap();
        assert_eq!(settings.name_fragment, "database");
    }

    #[test]
    fn test_file_values() {
        let file = toml_file(
            r#"
name_fragment = "postgres"
follow_replica_sets = true
write_mode = "optimistic"
max_conflict_retries = 5
concurrency = 4
log_format = "json"
"#,
        );

        let settings = Settings::load_from(Some(file.path()), "DB_BOUNCE_TEST_FILE").unwrap();
        assert_eq!(settings.name_fragment, "postgres");
        assert!(settings.follow_replica_sets);
        assert_eq!(settings.write_mode, WriteModeSetting::Optimistic);
        assert_eq!(settings.log_format, LogFormat::Json);

        let options = settings.run_options();
        assert!(options.matching.predicate.matches("orders-postgres-0"));
        assert_eq!(options.restart.write_mode, WriteMode::Optimistic);
        assert_eq!(options.restart.max_conflict_retries, 5);
        assert_eq!(options.concurrency, 4);
    }

    #[test]
    fn test_environment_overrides_file() {
        let file = toml_file("name_fragment = \"postgres\"\nconcurrency = 2\n");
        std::env::set_var("DB_BOUNCE_TEST_ENV_NAME_FRAGMENT", "mysql");
        std::env::set_var("DB_BOUNCE_TEST_ENV_DEDUPE_TARGETS", "false");

        let settings = Settings::load_from(Some(file.path()), "DB_BOUNCE_TEST_ENV").unwrap();
        assert_eq!(settings.name_fragment, "mysql");
        assert!(!settings.dedupe_targets);
        assert_eq!(settings.concurrency, 2);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let file = toml_file("concurrency = 0\n");
        assert!(Settings::load_from(Some(file.path()), "DB_BOUNCE_TEST_INVALID").is_err());

        let file = toml_file("name_fragment = \"\"\n");
        assert!(Settings::load_from(Some(file.path()), "DB_BOUNCE_TEST_INVALID").is_err());

        let file = toml_file("write_mode = \"sometimes\"\n");
        assert!(Settings::load_from(Some(file.path()), "DB_BOUNCE_TEST_INVALID").is_err());
    }

    #[test]
    fn test_kubeconfig_path() {
        assert_eq!(kubeconfig_path(""), None);
        assert_eq!(
            kubeconfig_path("/etc/kube/admin.conf"),
            Some(PathBuf::from("/etc/kube/admin.conf"))
        );
    }
}
