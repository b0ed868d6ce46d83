//! Tool configuration loading.
//!
//! Flag defaults shared by the three binaries can live in an optional
//! `dsub.toml`. String values support environment expansion with the
//! `${VAR}` and `${VAR:-default}` forms (`$$` escapes a literal dollar
//! sign), so credentials and per-machine paths stay out of the file.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Default interval between provider polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Optional defaults loaded from `dsub.toml`.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ToolConfig {
    /// Default provider name when `--provider` is not given.
    pub provider: Option<String>,

    /// Default logging path template.
    pub logging: Option<String>,

    /// Cloud project passed through to provider bindings.
    pub project: Option<String>,

    /// Workspace root for the local provider.
    pub workspace_root: Option<PathBuf>,

    /// Poll interval override, in seconds.
    pub poll_interval_secs: Option<u64>,

    /// Environment variables added to every submission.
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl ToolConfig {
    pub fn poll_interval(&self) -> Duration {
        self.poll_interval_secs
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_POLL_INTERVAL)
    }
}

/// Loads configuration from a TOML file, expanding environment references
/// in the env table.
pub fn load_config(path: &Path) -> Result<ToolConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    load_config_str(&content)
        .with_context(|| format!("failed to parse config file: {}", path.display()))
}

/// Loads configuration from a TOML string.
pub fn load_config_str(content: &str) -> Result<ToolConfig> {
    let mut config: ToolConfig = toml::from_str(content).context("invalid TOML")?;
    for (key, value) in config.env.iter_mut() {
        *value = expand_env_value(value)
            .map_err(|e| anyhow::anyhow!("failed to expand env var '{key}': {e}"))?;
    }
    Ok(config)
}

/// Loads `dsub.toml` from the working directory when present; otherwise
/// returns defaults.
pub fn load_default_config() -> Result<ToolConfig> {
    let path = Path::new("dsub.toml");
    if path.is_file() {
        load_config(path)
    } else {
        Ok(ToolConfig::default())
    }
}

/// Expands `${VAR}` and `${VAR:-default}` references in a value; `$$`
/// yields a literal dollar sign, and a dollar sign not followed by `{`
/// stays literal. A reference with no default fails when the variable is
/// unset.
fn expand_env_value(value: &str) -> Result<String, String> {
    let mut out = String::with_capacity(value.len());
    let mut rest = value;

    while let Some(dollar) = rest.find('$') {
        out.push_str(&rest[..dollar]);
        let tail = &rest[dollar + 1..];
        if let Some(after) = tail.strip_prefix('$') {
            out.push('$');
            rest = after;
        } else if let Some(body) = tail.strip_prefix('{') {
            let close = body
                .find('}')
                .ok_or_else(|| format!("unterminated reference in '{value}'"))?;
            out.push_str(&resolve_reference(&body[..close])?);
            rest = &body[close + 1..];
        } else {
            out.push('$');
            rest = tail;
        }
    }

    out.push_str(rest);
    Ok(out)
}

/// Resolves the inside of one `${...}` reference.
fn resolve_reference(reference: &str) -> Result<String, String> {
    let (name, fallback) = match reference.split_once(":-") {
        Some((name, fallback)) => (name, Some(fallback)),
        None => (reference, None),
    };
    if name.is_empty() {
        return Err("reference has no variable name".to_string());
    }
    match (std::env::var(name), fallback) {
        (Ok(value), _) => Ok(value),
        (Err(_), Some(fallback)) => Ok(fallback.to_string()),
        (Err(_), None) => Err(format!("environment variable '{name}' is not set")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_config() {
        let config = load_config_str(
            r#"
            provider = "local"
            logging = "/var/log/dsub"
            poll_interval_secs = 30

            [env]
            STAGE = "test"
            "#,
        )
        .unwrap();
        assert_eq!(config.provider.as_deref(), Some("local"));
        assert_eq!(config.poll_interval(), Duration::from_secs(30));
        assert_eq!(config.env["STAGE"], "test");
    }

    #[test]
    fn empty_config_uses_defaults() {
        let config = load_config_str("").unwrap();
        assert!(config.provider.is_none());
        assert_eq!(config.poll_interval(), DEFAULT_POLL_INTERVAL);
    }

    #[test]
    fn expands_env_with_default() {
        unsafe { std::env::remove_var("DSUB_TEST_UNSET") };
        let config = load_config_str(
            r#"
            [env]
            A = "${DSUB_TEST_UNSET:-fallback}"
            "#,
        )
        .unwrap();
        assert_eq!(config.env["A"], "fallback");
    }

    #[test]
    fn missing_required_env_is_an_error() {
        unsafe { std::env::remove_var("DSUB_TEST_UNSET") };
        let err = load_config_str(
            r#"
            [env]
            A = "${DSUB_TEST_UNSET}"
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("A"));
    }

    #[test]
    fn escaped_dollar_sign() {
        assert_eq!(expand_env_value("cost: $$5").unwrap(), "cost: $5");
        assert_eq!(expand_env_value("lone $ sign").unwrap(), "lone $ sign");
    }

    #[test]
    fn unclosed_reference_is_an_error() {
        assert!(expand_env_value("${OOPS").is_err());
        assert!(expand_env_value("${}").is_err());
    }
}
