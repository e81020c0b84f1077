//! Configuration management for the relay.
//!
//! Handles loading configuration from `config.toml` in the platform config
//! directory (or an explicit path). Command-line flags override file values.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::Deserialize;

use crate::protocol::Secret;
use crate::server::ServerSettings;

#[derive(Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub client: ClientConfig,
}

#[derive(Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen: String,
    pub secret: Option<String>,
    pub secret_file: Option<PathBuf>,
    pub connect_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let settings = ServerSettings::default();
        Self {
            listen: settings.listen,
            secret: None,
            secret_file: None,
            connect_timeout_secs: settings.connect_timeout.as_secs(),
        }
    }
}

#[derive(Default, Deserialize)]
pub struct ClientConfig {
    pub server: Option<String>,
    pub token: Option<String>,
}

impl Config {
    /// Load from `path`, or from the default location if none is given.
    ///
    /// An explicit path must exist; a missing default file yields defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => {
                let path = Self::config_path()?;
                if !path.exists() {
                    return Ok(Self::default());
                }
                path
            }
        };

        let contents = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn config_path() -> Result<PathBuf> {
        let proj_dirs =
            ProjectDirs::from("", "", "wsrelay").context("Could not determine config directory")?;

        Ok(proj_dirs.config_dir().join("config.toml"))
    }
}

impl ServerConfig {
    /// The configured secret: inline value first, then `secret_file`.
    pub fn secret(&self) -> Result<Secret> {
        match (&self.secret, &self.secret_file) {
            (Some(secret), _) => Secret::new(secret.as_str()),
            (None, Some(path)) => Secret::load(path),
            (None, None) => anyhow::bail!(
                "No secret configured. Use --secret, set WSRELAY_SECRET, \
                 or add secret/secret_file to the [server] section of {:?}",
                Config::config_path().unwrap_or_default()
            ),
        }
    }

    pub fn settings(&self) -> ServerSettings {
        ServerSettings {
            listen: self.listen.clone(),
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_load_full_config() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            r#"
[server]
listen = "127.0.0.1:9000"
secret = "abc"
connect_timeout_secs = 3

[client]
server = "wss://relay.example/"
token = "abc"
"#,
        )
        .unwrap();

        let config = Config::load(Some(&path)).unwrap();
        let settings = config.server.settings();

        assert_eq!(settings.listen, "127.0.0.1:9000");
        assert_eq!(settings.connect_timeout, Duration::from_secs(3));
        assert!(config.server.secret().unwrap().matches(Some(b"abc")));
        assert_eq!(config.client.server.as_deref(), Some("wss://relay.example/"));
    }

    #[test]
    fn test_secret_file_fallback() {
        let dir = tempdir().unwrap();
        let secret_path = dir.path().join("secret");
        fs::write(&secret_path, "from-file\n").unwrap();
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            format!("[server]\nsecret_file = {:?}\n", secret_path.display().to_string()),
        )
        .unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert!(config.server.secret().unwrap().matches(Some(b"from-file")));
    }

    #[test]
    fn test_defaults_when_section_is_empty() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[server]\nsecret = \"abc\"\n").unwrap();

        let settings = Config::load(Some(&path)).unwrap().server.settings();
        assert_eq!(settings.listen, "0.0.0.0:8080");
        assert_eq!(settings.connect_timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_missing_secret_is_an_error() {
        assert!(ServerConfig::default().secret().is_err());
    }

    #[test]
    fn test_explicit_path_must_exist() {
        let dir = tempdir().unwrap();
        assert!(Config::load(Some(&dir.path().join("absent.toml"))).is_err());
    }

    #[test]
    fn test_rejects_unparseable_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[server\nlisten = ").unwrap();
        assert!(Config::load(Some(&path)).is_err());
    }
}
