// Runtime settings for the worker, read from AUTOCODER_* environment variables

use anyhow::{bail, Context, Result};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Settings {
    /// Path of the language adapter file
    pub languages_path: PathBuf,
    /// Maximum number of fix requests per workflow
    pub retry_budget: u32,
    /// Whether provisioning failures are treated as transient
    pub retry_provisioning: bool,
    pub default_timeout: Duration,
    /// Ceiling applied to every per-call timeout override
    pub max_timeout: Duration,
    pub session_idle_timeout: Duration,
    pub reap_interval: Duration,
    /// Host directory holding per-session workspaces; tmpfs when unset
    pub workspace_root: Option<PathBuf>,
    /// Permission bits for per-session workspace directories
    pub workspace_mode: u32,
    pub sandbox_user: String,
    pub fix_service_url: Option<String>,
    pub fix_timeout: Duration,
    pub max_concurrent_workflows: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            languages_path: PathBuf::from("config/languages.json"),
            retry_budget: 3,
            retry_provisioning: false,
            default_timeout: Duration::from_millis(10_000),
            max_timeout: Duration::from_millis(60_000),
            session_idle_timeout: Duration::from_secs(300),
            reap_interval: Duration::from_secs(30),
            workspace_root: None,
            workspace_mode: 0o770,
            sandbox_user: "1000:1000".to_string(),
            fix_service_url: None,
            fix_timeout: Duration::from_millis(30_000),
            max_concurrent_workflows: 16,
        }
    }
}

impl Settings {
    /// Load settings from the process environment
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load settings through an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let settings = Self {
            languages_path: lookup("AUTOCODER_LANGUAGES")
                .map(PathBuf::from)
                .unwrap_or(defaults.languages_path),
            retry_budget: parse_or(&lookup, "AUTOCODER_RETRY_BUDGET", defaults.retry_budget)?,
            retry_provisioning: parse_or(
                &lookup,
                "AUTOCODER_RETRY_PROVISIONING",
                defaults.retry_provisioning,
            )?,
            default_timeout: millis_or(&lookup, "AUTOCODER_DEFAULT_TIMEOUT_MS", defaults.default_timeout)?,
            max_timeout: millis_or(&lookup, "AUTOCODER_MAX_TIMEOUT_MS", defaults.max_timeout)?,
            session_idle_timeout: secs_or(
                &lookup,
                "AUTOCODER_SESSION_IDLE_SECS",
                defaults.session_idle_timeout,
            )?,
            reap_interval: secs_or(&lookup, "AUTOCODER_REAP_INTERVAL_SECS", defaults.reap_interval)?,
            workspace_root: lookup("AUTOCODER_WORKSPACE_ROOT")
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from),
            workspace_mode: match lookup("AUTOCODER_WORKSPACE_MODE") {
                Some(raw) => u32::from_str_radix(raw.trim().trim_start_matches("0o"), 8)
                    .with_context(|| format!("AUTOCODER_WORKSPACE_MODE is not octal: {}", raw))?,
                None => defaults.workspace_mode,
            },
            sandbox_user: lookup("AUTOCODER_SANDBOX_USER").unwrap_or(defaults.sandbox_user),
            fix_service_url: lookup("AUTOCODER_FIX_URL").filter(|v| !v.trim().is_empty()),
            fix_timeout: millis_or(&lookup, "AUTOCODER_FIX_TIMEOUT_MS", defaults.fix_timeout)?,
            max_concurrent_workflows: parse_or(
                &lookup,
                "AUTOCODER_MAX_WORKFLOWS",
                defaults.max_concurrent_workflows,
            )?,
        };

        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<()> {
        if self.workspace_root.is_some() && crate::engine::sandbox_owner(&self.sandbox_user).is_none() {
            bail!(
                "AUTOCODER_SANDBOX_USER must be numeric uid[:gid] when AUTOCODER_WORKSPACE_ROOT is set, got '{}'",
                self.sandbox_user
            );
        }
        if self.default_timeout.is_zero() || self.max_timeout.is_zero() {
            bail!("Execution timeouts must be greater than zero");
        }
        if self.default_timeout > self.max_timeout {
            bail!(
                "Default timeout ({}ms) exceeds the timeout ceiling ({}ms)",
                self.default_timeout.as_millis(),
                self.max_timeout.as_millis()
            );
        }
        if self.reap_interval.is_zero() {
            bail!("Session reap interval must be greater than zero");
        }
        if self.workspace_mode > 0o777 {
            bail!("Workspace mode {:o} is not a permission mask", self.workspace_mode);
        }
        if self.max_concurrent_workflows == 0 {
            bail!("AUTOCODER_MAX_WORKFLOWS must be at least 1");
        }
        Ok(())
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("Invalid value for {}: {} ({})", key, raw, e)),
        None => Ok(default),
    }
}

fn millis_or<F>(lookup: &F, key: &str, default: Duration) -> Result<Duration>
where
    F: Fn(&str) -> Option<String>,
{
    parse_or(lookup, key, default.as_millis() as u64).map(Duration::from_millis)
}

fn secs_or<F>(lookup: &F, key: &str, default: Duration) -> Result<Duration>
where
    F: Fn(&str) -> Option<String>,
{
    parse_or(lookup, key, default.as_secs()).map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_when_unset() {
        let settings = Settings::from_lookup(|_| None).unwrap();
        assert_eq!(settings.retry_budget, 3);
        assert_eq!(settings.default_timeout, Duration::from_secs(10));
        assert_eq!(settings.workspace_mode, 0o770);
        assert!(settings.workspace_root.is_none());
        assert!(settings.fix_service_url.is_none());
    }

    #[test]
    fn test_overrides() {
        let settings = Settings::from_lookup(lookup_from(&[
            ("AUTOCODER_RETRY_BUDGET", "0"),
            ("AUTOCODER_DEFAULT_TIMEOUT_MS", "2500"),
            ("AUTOCODER_WORKSPACE_ROOT", "/srv/autocoder"),
            ("AUTOCODER_WORKSPACE_MODE", "0o750"),
            ("AUTOCODER_RETRY_PROVISIONING", "true"),
        ]))
        .unwrap();

        assert_eq!(settings.retry_budget, 0);
        assert_eq!(settings.default_timeout, Duration::from_millis(2500));
        assert_eq!(settings.workspace_root, Some(PathBuf::from("/srv/autocoder")));
        assert_eq!(settings.workspace_mode, 0o750);
        assert!(settings.retry_provisioning);
    }

    #[test]
    fn test_host_workspace_needs_numeric_user() {
        let result = Settings::from_lookup(lookup_from(&[
            ("AUTOCODER_WORKSPACE_ROOT", "/srv/autocoder"),
            ("AUTOCODER_SANDBOX_USER", "sandbox"),
        ]));
        assert!(result.is_err());

        let settings = Settings::from_lookup(lookup_from(&[("AUTOCODER_SANDBOX_USER", "sandbox")])).unwrap();
        assert_eq!(settings.sandbox_user, "sandbox");
    }

    #[test]
    fn test_rejects_default_above_ceiling() {
        let result = Settings::from_lookup(lookup_from(&[
            ("AUTOCODER_DEFAULT_TIMEOUT_MS", "90000"),
            ("AUTOCODER_MAX_TIMEOUT_MS", "60000"),
        ]));
        assert!(result.is_err());
    }

    #[test]
    fn test_rejects_garbage_numbers() {
        let result = Settings::from_lookup(lookup_from(&[("AUTOCODER_RETRY_BUDGET", "many")]));
        assert!(result.is_err());
    }
}
