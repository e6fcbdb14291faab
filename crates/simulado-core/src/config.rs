//! Engine configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Top-level simulado configuration, as read from `simulado.toml`.
///
/// Note: Custom Debug impl masks the database URL, which usually carries a
/// password.
#[derive(Clone, Serialize, Deserialize)]
pub struct SimuladoConfig {
    /// PostgreSQL connection string; the in-memory store is used when absent.
    #[serde(default)]
    pub database_url: Option<String>,
    /// Question count used when a request does not name one.
    #[serde(default = "default_total_questions")]
    pub default_total_questions: u32,
    /// Larger requested totals are rejected.
    #[serde(default = "default_max_total_questions")]
    pub max_total_questions: u32,
    #[serde(default = "default_duration_minutes")]
    pub default_duration_minutes: u32,
    /// Open study sessions without a heartbeat for this long are swept.
    #[serde(default = "default_idle_timeout")]
    pub study_idle_timeout_minutes: u32,
    /// Delay before the single retry of a transient store failure.
    #[serde(default = "default_retry_delay")]
    pub store_retry_delay_ms: u64,
    /// Default question bank file or directory.
    #[serde(default)]
    pub bank_path: Option<PathBuf>,
}

impl std::fmt::Debug for SimuladoConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimuladoConfig")
            .field("database_url", &self.database_url.as_ref().map(|_| "***"))
            .field("default_total_questions", &self.default_total_questions)
            .field("max_total_questions", &self.max_total_questions)
            .field("default_duration_minutes", &self.default_duration_minutes)
            .field("study_idle_timeout_minutes", &self.study_idle_timeout_minutes)
            .field("store_retry_delay_ms", &self.store_retry_delay_ms)
            .field("bank_path", &self.bank_path)
            .finish()
    }
}

fn default_total_questions() -> u32 {
    45
}
fn default_max_total_questions() -> u32 {
    180
}
fn default_duration_minutes() -> u32 {
    300
}
fn default_idle_timeout() -> u32 {
    30
}
fn default_retry_delay() -> u64 {
    50
}

impl Default for SimuladoConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            default_total_questions: default_total_questions(),
            max_total_questions: default_max_total_questions(),
            default_duration_minutes: default_duration_minutes(),
            study_idle_timeout_minutes: default_idle_timeout(),
            store_retry_delay_ms: default_retry_delay(),
            bank_path: None,
        }
    }
}

impl SimuladoConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.store_retry_delay_ms)
    }

    pub fn study_idle_timeout(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.study_idle_timeout_minutes as i64)
    }

    fn validate(&self) -> Result<()> {
        if self.max_total_questions == 0 {
            anyhow::bail!("max_total_questions must be at least 1");
        }
        if self.default_total_questions == 0 || self.default_total_questions > self.max_total_questions {
            anyhow::bail!(
                "default_total_questions must be between 1 and {}",
                self.max_total_questions
            );
        }
        if self.default_duration_minutes == 0 {
            anyhow::bail!("default_duration_minutes must be at least 1");
        }
        Ok(())
    }
}

/// Resolve environment variable references like `${VAR_NAME}` in a string.
fn resolve_env_vars(s: &str) -> String {
    let mut result = s.to_string();
    while let Some(start) = result.find("${") {
        let Some(end) = result[start..].find('}') else {
            break;
        };
        let var_name = &result[start + 2..start + end];
        let value = std::env::var(var_name).unwrap_or_default();
        result = format!("{}{}{}", &result[..start], value, &result[start + end + 1..]);
    }
    result
}

/// Load configuration from well-known paths.
///
/// Search order:
/// 1. `simulado.toml` in the current directory
/// 2. `~/.config/simulado/config.toml`
///
/// `SIMULADO_DATABASE_URL` overrides `database_url`.
pub fn load_config() -> Result<SimuladoConfig> {
    load_config_from(None)
}

/// Load config from an explicit path, or search the default locations.
pub fn load_config_from(path: Option<&Path>) -> Result<SimuladoConfig> {
    let config_path = match path {
        Some(p) if p.exists() => Some(p.to_path_buf()),
        Some(p) => anyhow::bail!("config file not found: {}", p.display()),
        None => {
            let local = PathBuf::from("simulado.toml");
            if local.exists() {
                Some(local)
            } else {
                dirs_path()
                    .map(|dir| dir.join("config.toml"))
                    .filter(|global| global.exists())
            }
        }
    };

    let mut config = match config_path {
        Some(path) => {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read config: {}", path.display()))?;
            toml::from_str::<SimuladoConfig>(&content)
                .with_context(|| format!("failed to parse config: {}", path.display()))?
        }
        None => SimuladoConfig::default(),
    };

    if let Ok(url) = std::env::var("SIMULADO_DATABASE_URL") {
        config.database_url = Some(url);
    }

    config.database_url = config
        .database_url
        .as_deref()
        .map(resolve_env_vars)
        .filter(|url| !url.trim().is_empty());
    config.bank_path = config
        .bank_path
        .as_ref()
        .map(|p| PathBuf::from(resolve_env_vars(&p.to_string_lossy())));

    config.validate()?;
    Ok(config)
}

fn dirs_path() -> Option<PathBuf> {
    std::env::var("HOME")
        .ok()
        .map(|h| PathBuf::from(h).join(".config").join("simulado"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_env_vars_basic() {
        std::env::set_var("_SIMULADO_TEST_VAR", "secret");
        assert_eq!(resolve_env_vars("${_SIMULADO_TEST_VAR}"), "secret");
        assert_eq!(
            resolve_env_vars("postgres://app:${_SIMULADO_TEST_VAR}@db/simulado"),
            "postgres://app:secret@db/simulado"
        );
        assert_eq!(resolve_env_vars("no vars here"), "no vars here");
        std::env::remove_var("_SIMULADO_TEST_VAR");
    }

    #[test]
    fn default_config() {
        let config = SimuladoConfig::default();
        assert_eq!(config.default_total_questions, 45);
        assert_eq!(config.max_total_questions, 180);
        assert_eq!(config.default_duration_minutes, 300);
        assert_eq!(config.study_idle_timeout_minutes, 30);
        assert_eq!(config.retry_delay(), Duration::from_millis(50));
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let config: SimuladoConfig = toml::from_str(
            r#"
max_total_questions = 90
bank_path = "banks/enem"
"#,
        )
        .unwrap();
        assert_eq!(config.max_total_questions, 90);
        assert_eq!(config.default_total_questions, 45);
        assert_eq!(config.bank_path, Some(PathBuf::from("banks/enem")));
        assert!(config.database_url.is_none());
    }

    #[test]
    fn load_from_explicit_path_validates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("simulado.toml");
        std::fs::write(&path, "default_total_questions = 500\n").unwrap();
        assert!(load_config_from(Some(&path)).is_err());

        std::fs::write(&path, "default_total_questions = 20\n").unwrap();
        let config = load_config_from(Some(&path)).unwrap();
        assert_eq!(config.default_total_questions, 20);
    }

    #[test]
    fn missing_explicit_path_is_an_error() {
        assert!(load_config_from(Some(Path::new("/nonexistent/simulado.toml"))).is_err());
    }

    #[test]
    fn debug_masks_database_url() {
        let config = SimuladoConfig {
            database_url: Some("postgres://app:hunter2@db/simulado".into()),
            ..SimuladoConfig::default()
        };
        let shown = format!("{config:?}");
        assert!(!shown.contains("hunter2"));
    }
}
