//! Configuration loader and validator for the GitHub→Discord mirror bot.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema exactly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    pub discord: Discord,
    pub github: Github,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    pub poll_interval_secs: u64,
}

/// Discord REST API settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Discord {
    pub bot_token: String,
}

/// GitHub API settings. The token is optional: the public API works
/// unauthenticated, just with a lower rate limit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Github {
    #[serde(default)]
    pub token: Option<String>,
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.app.data_dir)
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    if cfg.app.poll_interval_secs == 0 {
        return Err(ConfigError::Invalid("app.poll_interval_secs must be > 0"));
    }

    if cfg.discord.bot_token.trim().is_empty() {
        return Err(ConfigError::Invalid("discord.bot_token must be non-empty"));
    }

    if let Some(token) = &cfg.github.token {
        if token.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "github.token must be non-empty when set (omit the key instead)",
            ));
        }
    }

    Ok(())
}

/// Example YAML content, kept in sync with the schema above.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  poll_interval_secs: 300

discord:
  bot_token: "YOUR_DISCORD_BOT_TOKEN"

github:
  token: "YOUR_GITHUB_TOKEN"
"#
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn parse_example_ok() {
        let cfg: Config = serde_yaml::from_str(example()).unwrap();
        validate(&cfg).unwrap();
    }

    #[test]
    fn github_token_is_optional() {
        let yaml = r#"
app:
  data_dir: "./data"
  poll_interval_secs: 300
discord:
  bot_token: "t"
github: {}
"#;
        let cfg: Config = serde_yaml::from_str(yaml).unwrap();
        validate(&cfg).unwrap();
        assert!(cfg.github.token.is_none());
    }

    #[test]
    fn invalid_bot_token() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.discord.bot_token = "".into();
        let err = validate(&cfg).unwrap_err();
        match err {
            ConfigError::Invalid(msg) => assert!(msg.contains("discord.bot_token")),
            _ => panic!("wrong error"),
        }
    }

    #[test]
    fn invalid_poll_interval() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.app.poll_interval_secs = 0;
        let err = validate(&cfg).unwrap_err();
        match err {
            ConfigError::Invalid(msg) => assert!(msg.contains("poll_interval_secs")),
            _ => panic!("wrong error"),
        }
    }

    #[test]
    fn empty_github_token_rejected() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.github.token = Some("  ".into());
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn ensure_dirs_creates_data_dir() {
        let td = tempdir().unwrap();
        let data_path = td.path().join("data");
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.app.data_dir = data_path.to_string_lossy().to_string();
        cfg.ensure_dirs().unwrap();
        assert!(data_path.exists());
    }

    #[test]
    fn load_from_file_ok() {
        let td = tempdir().unwrap();
        let p = td.path().join("config.yaml");
        fs::write(&p, example()).unwrap();
        let cfg = load(Some(&p)).unwrap();
        assert_eq!(cfg.app.poll_interval_secs, 300);
    }
}
