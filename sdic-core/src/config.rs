//! Checker configuration.
//!
//! The optional `servers.toml` at the constraint root maps server names to
//! connection URIs and carries run settings:
//!
//! ```toml
//! [settings]
//! output = "console"
//! query_timeout_secs = 300
//!
//! [servers.payments]
//! uri = "postgres://checker@db/payments"
//! ```
//!
//! # Security
//! URIs may contain passwords; nothing in this module logs them.

use crate::error::SdicError;
use crate::models::ServerDescriptor;
use crate::Result;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration file name, looked up at the constraint root.
pub const CONFIG_FILE_NAME: &str = "servers.toml";

/// Where violation reports are delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Destination {
    /// Human-readable report on stdout
    #[default]
    Console,
    /// One structured ERROR log entry per report
    Syslog,
}

/// `[servers.<name>]` table.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerEntry {
    /// Driver connection URI, credentials included
    pub uri: String,
}

/// `[settings]` table.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    /// Report destination
    pub output: Destination,
    /// Per-query timeout; 0 disables it
    pub query_timeout_secs: u64,
    /// Time allowed to open one server connection
    pub connect_timeout_secs: u64,
    /// Lock directory; the system temp directory when unset
    pub lock_dir: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            output: Destination::Console,
            query_timeout_secs: 300,
            connect_timeout_secs: 30,
            lock_dir: None,
        }
    }
}

/// Parsed `servers.toml`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CheckerConfig {
    /// Run-wide settings
    pub settings: Settings,
    /// Servers keyed by name, which is also their constraint directory
    pub servers: BTreeMap<String, ServerEntry>,
}

impl CheckerConfig {
    /// Parses and validates TOML configuration text.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| SdicError::configuration(format!("Invalid TOML: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Loads the configuration file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            SdicError::io(
                format!("Failed to read configuration file {}", path.display()),
                e,
            )
        })?;
        Self::from_toml_str(&content).map_err(|e| match e {
            SdicError::Configuration { message } => {
                SdicError::configuration(format!("{}: {}", path.display(), message))
            }
            other => other,
        })
    }

    /// Validates server names and URIs.
    pub fn validate(&self) -> Result<()> {
        for (name, entry) in &self.servers {
            validate_server_name(name)?;
            if entry.uri.trim().is_empty() {
                return Err(SdicError::configuration(format!(
                    "server '{}' has an empty uri",
                    name
                )));
            }
        }
        Ok(())
    }

    /// Known servers, ordered by name.
    pub fn server_descriptors(&self) -> Vec<ServerDescriptor> {
        self.servers
            .iter()
            .map(|(name, entry)| ServerDescriptor::new(name.clone(), entry.uri.clone()))
            .collect()
    }

    /// Adds or replaces one server, as done for a command-line override.
    pub fn upsert_server(&mut self, name: &str, uri: &str) -> Result<()> {
        validate_server_name(name)?;
        if uri.trim().is_empty() {
            return Err(SdicError::configuration("server uri cannot be empty"));
        }
        self.servers.insert(
            name.to_string(),
            ServerEntry {
                uri: uri.to_string(),
            },
        );
        Ok(())
    }
}

/// Server names are used verbatim as directory names.
pub fn validate_server_name(name: &str) -> Result<()> {
    if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\\']) {
        return Err(SdicError::configuration(format!(
            "invalid server name '{}': must be a plain directory name",
            name
        )));
    }
    Ok(())
}

/// Resolved settings for a single run.
#[derive(Debug, Clone)]
pub struct RunSettings {
    /// Report destination
    pub destination: Destination,
    /// `None` disables the per-query timeout
    pub query_timeout: Option<Duration>,
    /// Time allowed to open one server connection
    pub connect_timeout: Duration,
    /// Directory holding the lock file
    pub lock_dir: PathBuf,
    /// Lock file stem, normally the executable name
    pub lock_name: String,
}

impl RunSettings {
    /// Builds run settings from the `[settings]` table.
    pub fn from_settings(settings: &Settings, lock_name: impl Into<String>) -> Self {
        Self {
            destination: settings.output,
            query_timeout: timeout_from_secs(settings.query_timeout_secs),
            connect_timeout: Duration::from_secs(settings.connect_timeout_secs.max(1)),
            lock_dir: settings
                .lock_dir
                .clone()
                .unwrap_or_else(std::env::temp_dir),
            lock_name: lock_name.into(),
        }
    }
}

impl Default for RunSettings {
    fn default() -> Self {
        Self::from_settings(&Settings::default(), crate::lock::default_lock_name())
    }
}

/// Zero seconds means "no timeout".
pub const fn timeout_from_secs(secs: u64) -> Option<Duration> {
    if secs == 0 {
        None
    } else {
        Some(Duration::from_secs(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let config = CheckerConfig::from_toml_str(
            r#"
            [settings]
            output = "syslog"
            query_timeout_secs = 10
            lock_dir = "/var/lock"

            [servers.payments]
            uri = "postgres://checker@db/payments"

            [servers.analytics]
            uri = "mysql://checker@db/analytics"
            "#,
        )
        .unwrap();

        assert_eq!(config.settings.output, Destination::Syslog);
        assert_eq!(config.settings.query_timeout_secs, 10);
        assert_eq!(config.settings.connect_timeout_secs, 30);

        let names: Vec<String> = config
            .server_descriptors()
            .into_iter()
            .map(|s| s.name)
            .collect();
        assert_eq!(names, vec!["analytics", "payments"]);
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = CheckerConfig::from_toml_str("").unwrap();
        assert!(config.servers.is_empty());
        assert_eq!(config.settings.output, Destination::Console);
        assert_eq!(config.settings.query_timeout_secs, 300);
    }

    #[test]
    fn test_rejects_unknown_keys_and_bad_values() {
        assert!(CheckerConfig::from_toml_str("[settings]\ncolour = true").is_err());
        assert!(CheckerConfig::from_toml_str("[servers.x]\nuri = \"\"").is_err());
        assert!(CheckerConfig::from_toml_str("[servers.\"../etc\"]\nuri = \"sqlite::memory:\"").is_err());
        assert!(CheckerConfig::from_toml_str("[settings]\noutput = \"email\"").is_err());
    }

    #[test]
    fn test_upsert_server_overrides_uri() {
        let mut config =
            CheckerConfig::from_toml_str("[servers.payments]\nuri = \"sqlite://old.db\"").unwrap();
        config.upsert_server("payments", "sqlite://new.db").unwrap();
        assert_eq!(config.servers["payments"].uri, "sqlite://new.db");
        assert!(config.upsert_server("a/b", "sqlite://x.db").is_err());
    }

    #[test]
    fn test_run_settings_timeout_zero_disables() {
        let settings = Settings {
            query_timeout_secs: 0,
            ..Settings::default()
        };
        let run = RunSettings::from_settings(&settings, "checker");
        assert_eq!(run.query_timeout, None);
        assert_eq!(run.lock_name, "checker");
        assert_eq!(run.connect_timeout, Duration::from_secs(30));
    }
}
