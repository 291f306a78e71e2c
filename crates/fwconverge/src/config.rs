//! Management server connection settings.
//!
//! ```yaml
//! url: https://smc.example.net:8082
//! apiVersion: "7.1"
//! domain: Shared Domain
//! timeoutSecs: 30
//! verifyTls: true
//! apiKeyFile: ~/.config/fwconverge/api-key
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use secrecy::SecretString;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::secrets::ApiKeySource;

pub const ENV_ADDRESS: &str = "SMC_ADDRESS";
pub const ENV_API_VERSION: &str = "SMC_API_VERSION";
pub const ENV_DOMAIN: &str = "SMC_DOMAIN";
pub const ENV_TIMEOUT: &str = "SMC_TIMEOUT";
pub const ENV_API_KEY: &str = "SMC_API_KEY";

fn default_api_version() -> String {
    "6.10".to_string()
}

fn default_timeout() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientConfig {
    /// Base address of the management API, without the version segment.
    #[serde(default)]
    pub url: String,

    #[serde(default = "default_api_version")]
    pub api_version: String,

    /// Administrative domain to log in to. The server default when unset.
    #[serde(default)]
    pub domain: Option<String>,

    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    #[serde(default = "default_true")]
    pub verify_tls: bool,

    #[serde(default)]
    pub api_key: Option<String>,

    #[serde(default)]
    pub api_key_file: Option<String>,

    #[serde(default)]
    pub api_key_env_var: Option<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            api_version: default_api_version(),
            domain: None,
            timeout_secs: default_timeout(),
            verify_tls: true,
            api_key: None,
            api_key_file: None,
            api_key_env_var: None,
        }
    }
}

impl ClientConfig {
    /// Default config location: `<config dir>/fwconverge/config.yaml`.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("fwconverge").join("config.yaml"))
    }

    /// Reads a config file, then applies environment overrides.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
            path: path.to_path_buf(),
            source: e,
        })?;

        let mut config = Self::from_yaml(&content)?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Loads `path` when given, else the default file when it exists, else
    /// the environment alone.
    pub fn discover(path: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = path {
            return Self::load(path);
        }

        if let Some(default) = Self::default_path().filter(|p| p.is_file()) {
            log::debug!("Using client config {}", default.display());
            return Self::load(default);
        }

        let mut config = Self::default();
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(content)?)
    }

    /// Environment variables win over file values.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(url) = env_value(ENV_ADDRESS) {
            self.url = url;
        }
        if let Some(version) = env_value(ENV_API_VERSION) {
            self.api_version = version;
        }
        if let Some(domain) = env_value(ENV_DOMAIN) {
            self.domain = Some(domain);
        }
        if let Some(timeout) = env_value(ENV_TIMEOUT) {
            self.timeout_secs = timeout.parse().map_err(|_| ConfigError::Validation {
                message: format!("{} must be a number of seconds, got '{}'", ENV_TIMEOUT, timeout),
            })?;
        }
        if !self.key_source().is_configured() && env_value(ENV_API_KEY).is_some() {
            self.api_key_env_var = Some(ENV_API_KEY.to_string());
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.url.trim().is_empty() {
            return Err(ConfigError::Validation {
                message: format!("url is required (or set {})", ENV_ADDRESS),
            });
        }
        if !self.url.starts_with("http://") && !self.url.starts_with("https://") {
            return Err(ConfigError::Validation {
                message: format!("url must start with http:// or https://, got '{}'", self.url),
            });
        }
        if self.timeout_secs == 0 {
            return Err(ConfigError::Validation {
                message: "timeoutSecs must be greater than zero".to_string(),
            });
        }
        if !self.key_source().is_configured() {
            return Err(ConfigError::Validation {
                message: format!(
                    "an API key is required: set apiKey, apiKeyFile, apiKeyEnvVar or {}",
                    ENV_API_KEY
                ),
            });
        }
        Ok(())
    }

    fn key_source(&self) -> ApiKeySource<'_> {
        ApiKeySource {
            inline: self.api_key.as_deref(),
            file: self.api_key_file.as_deref(),
            env_var: self.api_key_env_var.as_deref(),
        }
    }

    pub fn api_key(&self) -> Result<SecretString, ConfigError> {
        Ok(self.key_source().resolve()?)
    }

    /// Versioned API root, e.g. `https://smc:8082/6.10`.
    pub fn base_url(&self) -> String {
        format!(
            "{}/{}",
            self.url.trim_end_matches('/'),
            self.api_version.trim_matches('/')
        )
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn env_value(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;
    use serial_test::serial;
    use tempfile::TempDir;

    fn clear_env() {
        for name in [ENV_ADDRESS, ENV_API_VERSION, ENV_DOMAIN, ENV_TIMEOUT, ENV_API_KEY] {
            std::env::remove_var(name);
        }
    }

    #[test]
    #[serial]
    fn test_load_from_file() {
        clear_env();
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(
            &path,
            "url: https://smc.example.net:8082/\napiVersion: \"7.1\"\napiKey: secret\nverifyTls: false\n",
        )
        .unwrap();

        let config = ClientConfig::load(&path).unwrap();
        assert_eq!(config.base_url(), "https://smc.example.net:8082/7.1");
        assert!(!config.verify_tls);
        assert_eq!(config.timeout(), Duration::from_secs(30));
        assert_eq!(config.api_key().unwrap().expose_secret(), "secret");
    }

    #[test]
    #[serial]
    fn test_env_overrides_file_values() {
        clear_env();
        std::env::set_var(ENV_ADDRESS, "https://other:8082");
        std::env::set_var(ENV_TIMEOUT, "5");
        std::env::set_var(ENV_API_KEY, "from-env");

        let mut config = ClientConfig::from_yaml("url: https://smc:8082\n").unwrap();
        config.apply_env_overrides().unwrap();
        config.validate().unwrap();

        assert_eq!(config.url, "https://other:8082");
        assert_eq!(config.timeout_secs, 5);
        assert_eq!(config.api_key().unwrap().expose_secret(), "from-env");
        clear_env();
    }

    #[test]
    #[serial]
    fn test_invalid_timeout_env() {
        clear_env();
        std::env::set_var(ENV_TIMEOUT, "soon");
        let mut config = ClientConfig::default();
        assert!(config.apply_env_overrides().is_err());
        clear_env();
    }

    #[test]
    #[serial]
    fn test_validate_requires_url_and_key() {
        clear_env();
        let config = ClientConfig::from_yaml("apiKey: k\n").unwrap();
        assert!(config.validate().is_err());

        let config = ClientConfig::from_yaml("url: ftp://smc\napiKey: k\n").unwrap();
        assert!(config.validate().is_err());

        let config = ClientConfig::from_yaml("url: https://smc\n").unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("API key"));
    }

    #[test]
    fn test_missing_file() {
        let err = ClientConfig::load("/nonexistent/fwconverge/config.yaml").unwrap_err();
        assert!(matches!(err, ConfigError::ReadFile { .. }));
    }
}
