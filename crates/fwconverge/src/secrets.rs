//! Management API key resolution.
//!
//! A key can be given inline (`apiKey`), in a file (`apiKeyFile`, e.g. a
//! mounted container secret) or through an environment variable
//! (`apiKeyEnvVar`). The first non-empty source wins, in that order.

use std::fs;

use secrecy::SecretString;

#[derive(Debug, thiserror::Error)]
pub enum SecretError {
    #[error("No API key source configured")]
    NoSource,

    #[error("Failed to read API key file '{path}': {source}")]
    FileRead {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("API key file '{path}' is empty")]
    EmptyFile { path: String },

    #[error("Environment variable '{name}' is not set or not valid UTF-8")]
    EnvVar { name: String },
}

pub type Result<T> = std::result::Result<T, SecretError>;

/// The places an API key may come from. Empty strings count as unset.
#[derive(Debug, Clone, Copy, Default)]
pub struct ApiKeySource<'a> {
    pub inline: Option<&'a str>,
    pub file: Option<&'a str>,
    pub env_var: Option<&'a str>,
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

impl ApiKeySource<'_> {
    pub fn is_configured(&self) -> bool {
        non_empty(self.inline).is_some()
            || non_empty(self.file).is_some()
            || non_empty(self.env_var).is_some()
    }

    /// Reads the key. File contents and variable values are trimmed.
    pub fn resolve(&self) -> Result<SecretString> {
        if let Some(key) = non_empty(self.inline) {
            return Ok(SecretString::from(key.to_string()));
        }

        if let Some(path) = non_empty(self.file) {
            let path = expand_home(path);
            let content = fs::read_to_string(&path).map_err(|source| SecretError::FileRead {
                path: path.clone(),
                source,
            })?;
            let key = content.trim();
            if key.is_empty() {
                return Err(SecretError::EmptyFile { path });
            }
            return Ok(SecretString::from(key.to_string()));
        }

        if let Some(name) = non_empty(self.env_var) {
            let value = std::env::var(name).map_err(|_| SecretError::EnvVar {
                name: name.to_string(),
            })?;
            return Ok(SecretString::from(value.trim().to_string()));
        }

        Err(SecretError::NoSource)
    }
}

fn expand_home(path: &str) -> String {
    match (path.strip_prefix("~/"), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest).to_string_lossy().into_owned(),
        _ => path.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;
    use serial_test::serial;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    #[serial]
    fn test_sources_are_tried_in_order() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "from-file").unwrap();
        let path = file.path().to_str().unwrap().to_string();
        std::env::set_var("FWCONVERGE_TEST_KEY_1", "from-env\n");

        let mut source = ApiKeySource {
            inline: Some("inline"),
            file: Some(&path),
            env_var: Some("FWCONVERGE_TEST_KEY_1"),
        };
        assert_eq!(source.resolve().unwrap().expose_secret(), "inline");

        source.inline = Some("");
        assert_eq!(source.resolve().unwrap().expose_secret(), "from-file");

        source.file = None;
        assert_eq!(source.resolve().unwrap().expose_secret(), "from-env");

        std::env::remove_var("FWCONVERGE_TEST_KEY_1");
    }

    #[test]
    #[serial]
    fn test_unset_env_var() {
        std::env::remove_var("FWCONVERGE_TEST_KEY_2");
        let source = ApiKeySource {
            env_var: Some("FWCONVERGE_TEST_KEY_2"),
            ..ApiKeySource::default()
        };
        assert!(matches!(source.resolve(), Err(SecretError::EnvVar { .. })));
    }

    #[test]
    fn test_file_errors() {
        let missing = ApiKeySource {
            file: Some("/nonexistent/fwconverge/key"),
            ..ApiKeySource::default()
        };
        assert!(matches!(missing.resolve(), Err(SecretError::FileRead { .. })));

        let empty = NamedTempFile::new().unwrap();
        let source = ApiKeySource {
            file: empty.path().to_str(),
            ..ApiKeySource::default()
        };
        assert!(matches!(source.resolve(), Err(SecretError::EmptyFile { .. })));
    }

    #[test]
    fn test_blank_sources_are_not_configured() {
        let source = ApiKeySource {
            inline: Some(" "),
            env_var: Some(""),
            ..ApiKeySource::default()
        };
        assert!(!source.is_configured());
        assert!(matches!(source.resolve(), Err(SecretError::NoSource)));
    }

    #[test]
    fn test_expand_home() {
        assert_eq!(expand_home("/abs/path"), "/abs/path");
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_home("~/keys/smc"), home.join("keys/smc").to_string_lossy());
        }
    }
}
