//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! The login secret is loaded from the SESSION_SECRET env var or
//! `login.secret_file`, never stored in the TOML directly.

use common::Secret;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub backend: BackendConfig,
    pub credentials: CredentialsConfig,
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub login: Option<LoginConfig>,
}

/// API backend the session authenticates against
#[derive(Debug, Deserialize)]
pub struct BackendConfig {
    pub base_url: String,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    /// Renew this many seconds before the access token expires
    #[serde(default = "default_renewal_lead")]
    pub renewal_lead_secs: u64,
}

#[derive(Debug, Deserialize)]
pub struct CredentialsConfig {
    /// JSON file holding `accessToken` / `refreshToken`
    pub path: PathBuf,
}

/// Listener settings
#[derive(Debug, Deserialize)]
pub struct GatewayConfig {
    pub listen_addr: SocketAddr,
    pub admin_addr: SocketAddr,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

/// Optional unattended login at startup
#[derive(Debug, Deserialize)]
pub struct LoginConfig {
    pub identifier: String,
    #[serde(skip)]
    pub secret: Option<Secret<String>>,
    /// Path to a file containing the secret (alternative to SESSION_SECRET)
    #[serde(default)]
    pub secret_file: Option<PathBuf>,
}

fn default_timeout() -> u64 {
    30
}

fn default_renewal_lead() -> u64 {
    60
}

fn default_max_connections() -> usize {
    1000
}

impl BackendConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn renewal_lead_time(&self) -> Duration {
        Duration::from_secs(self.renewal_lead_secs)
    }
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    ///
    /// Secret resolution order:
    /// 1. SESSION_SECRET env var
    /// 2. `login.secret_file` path from config
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;

        session_auth::parse_base_url(&config.backend.base_url).map_err(|_| {
            common::Error::Config(format!(
                "base_url must be an http:// or https:// URL, got: {}",
                config.backend.base_url
            ))
        })?;

        if config.backend.timeout_secs == 0 {
            return Err(common::Error::Config(
                "timeout_secs must be greater than 0".into(),
            ));
        }

        if config.gateway.max_connections == 0 {
            return Err(common::Error::Config(
                "max_connections must be greater than 0".into(),
            ));
        }

        if let Some(login) = config.login.as_mut() {
            if let Ok(secret) = std::env::var("SESSION_SECRET") {
                login.secret = Some(Secret::new(secret));
            } else if let Some(ref secret_file) = login.secret_file {
                let secret = std::fs::read_to_string(secret_file).map_err(|e| {
                    common::Error::Config(format!(
                        "failed to read secret_file {}: {e}",
                        secret_file.display()
                    ))
                })?;
                let secret = secret.trim().to_owned();
                if !secret.is_empty() {
                    login.secret = Some(Secret::new(secret));
                }
            }
        }

        Ok(config)
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("session-gateway.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Serializes tests that mutate environment variables.
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    /// SAFETY: Callers must hold ENV_MUTEX to prevent concurrent env mutation.
    unsafe fn set_env(key: &str, val: &str) {
        unsafe { std::env::set_var(key, val) };
    }

    unsafe fn remove_env(key: &str) {
        unsafe { std::env::remove_var(key) };
    }

    const BASE_TOML: &str = r#"
[backend]
base_url = "http://127.0.0.1:8000/api/"

[credentials]
path = "/var/lib/session-gateway/credentials.json"

[gateway]
listen_addr = "127.0.0.1:8080"
admin_addr = "127.0.0.1:9090"
"#;

    fn write_config(dir: &Path, contents: &str) -> PathBuf {
        let path = dir.join("config.toml");
        std::fs::write(&path, contents).unwrap();
        path
    }

    fn with_login(secret_file: &str) -> String {
        format!(
            "{BASE_TOML}\n[login]\nidentifier = \"user@example.com\"\nsecret_file = \"{secret_file}\"\n"
        )
    }

    #[test]
    fn test_load_valid_config_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(dir.path(), BASE_TOML);

        let config = Config::load(&path).unwrap();
        assert_eq!(config.backend.base_url, "http://127.0.0.1:8000/api/");
        assert_eq!(config.backend.timeout(), Duration::from_secs(30));
        assert_eq!(config.backend.renewal_lead_time(), Duration::from_secs(60));
        assert_eq!(config.gateway.max_connections, 1000);
        assert_eq!(config.gateway.admin_addr.port(), 9090);
        assert!(config.login.is_none());
    }

    #[test]
    fn test_load_missing_file() {
        let result = Config::load(Path::new("/nonexistent/path/config.toml"));
        assert!(matches!(result, Err(common::Error::Io(_))));
    }

    #[test]
    fn test_load_invalid_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(dir.path(), "not valid {{{{ toml");
        assert!(matches!(Config::load(&path), Err(common::Error::Toml(_))));
    }

    #[test]
    fn test_missing_section_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(dir.path(), "[backend]\nbase_url = \"http://x/\"\n");
        assert!(Config::load(&path).is_err());
    }

    #[test]
    fn test_invalid_base_url_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let contents = BASE_TOML.replace("http://127.0.0.1:8000/api/", "127.0.0.1:8000/api/");
        let path = write_config(dir.path(), &contents);

        let err = Config::load(&path).unwrap_err().to_string();
        assert!(
            err.contains("base_url must be an http"),
            "error message should explain the issue, got: {err}"
        );
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let contents = BASE_TOML.replace(
            "base_url = \"http://127.0.0.1:8000/api/\"",
            "base_url = \"http://127.0.0.1:8000/api/\"\ntimeout_secs = 0",
        );
        let path = write_config(dir.path(), &contents);
        assert!(Config::load(&path).is_err(), "timeout_secs = 0 must be rejected");
    }

    #[test]
    fn test_zero_max_connections_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let contents = format!("{BASE_TOML}max_connections = 0\n");
        let path = write_config(dir.path(), &contents);
        assert!(Config::load(&path).is_err(), "max_connections = 0 must be rejected");
    }

    #[test]
    fn test_custom_lead_time() {
        let dir = tempfile::tempdir().unwrap();
        let contents = BASE_TOML.replace(
            "base_url = \"http://127.0.0.1:8000/api/\"",
            "base_url = \"http://127.0.0.1:8000/api/\"\nrenewal_lead_secs = 90",
        );
        let path = write_config(dir.path(), &contents);
        let config = Config::load(&path).unwrap();
        assert_eq!(config.backend.renewal_lead_time(), Duration::from_secs(90));
    }

    #[test]
    fn test_secret_from_file() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let secret_path = dir.path().join("secret");
        std::fs::write(&secret_path, "hunter2\n").unwrap();
        let path = write_config(dir.path(), &with_login(&secret_path.display().to_string()));

        unsafe { remove_env("SESSION_SECRET") };
        let config = Config::load(&path).unwrap();
        let login = config.login.unwrap();
        assert_eq!(login.identifier, "user@example.com");
        assert_eq!(login.secret.unwrap().expose(), "hunter2");
    }

    #[test]
    fn test_secret_env_overrides_file() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let secret_path = dir.path().join("secret");
        std::fs::write(&secret_path, "from-file").unwrap();
        let path = write_config(dir.path(), &with_login(&secret_path.display().to_string()));

        unsafe { set_env("SESSION_SECRET", "from-env") };
        let config = Config::load(&path).unwrap();
        unsafe { remove_env("SESSION_SECRET") };

        assert_eq!(config.login.unwrap().secret.unwrap().expose(), "from-env");
    }

    #[test]
    fn test_secret_env_overrides_nonexistent_file() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(dir.path(), &with_login("/nonexistent/secret"));

        unsafe { set_env("SESSION_SECRET", "env-wins") };
        let config = Config::load(&path).unwrap();
        unsafe { remove_env("SESSION_SECRET") };

        assert_eq!(config.login.unwrap().secret.unwrap().expose(), "env-wins");
    }

    #[test]
    fn test_secret_file_nonexistent_returns_error() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(dir.path(), &with_login("/nonexistent/secret"));

        unsafe { remove_env("SESSION_SECRET") };
        assert!(Config::load(&path).is_err());
    }

    #[test]
    fn test_secret_file_whitespace_yields_none() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let secret_path = dir.path().join("secret");
        std::fs::write(&secret_path, "  \n  ").unwrap();
        let path = write_config(dir.path(), &with_login(&secret_path.display().to_string()));

        unsafe { remove_env("SESSION_SECRET") };
        let config = Config::load(&path).unwrap();
        assert!(config.login.unwrap().secret.is_none());
    }

    #[test]
    fn test_resolve_path_cli_arg() {
        let path = Config::resolve_path(Some("/custom/path.toml"));
        assert_eq!(path, PathBuf::from("/custom/path.toml"));
    }

    #[test]
    fn test_resolve_path_env_var() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { set_env("CONFIG_PATH", "/env/path.toml") };
        let path = Config::resolve_path(None);
        assert_eq!(path, PathBuf::from("/env/path.toml"));
        unsafe { remove_env("CONFIG_PATH") };
    }

    #[test]
    fn test_resolve_path_default() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { remove_env("CONFIG_PATH") };
        let path = Config::resolve_path(None);
        assert_eq!(path, PathBuf::from("session-gateway.toml"));
    }

    #[test]
    fn test_resolve_path_cli_overrides_env() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { set_env("CONFIG_PATH", "/env/should-lose.toml") };
        let path = Config::resolve_path(Some("/cli/wins.toml"));
        assert_eq!(path, PathBuf::from("/cli/wins.toml"));
        unsafe { remove_env("CONFIG_PATH") };
    }
}
