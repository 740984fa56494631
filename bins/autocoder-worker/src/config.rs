// Language adapter registry for the Autocoder worker
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::error::RegistryError;

/// Placeholder substituted with the in-sandbox source path
pub const FILE_PLACEHOLDER: &str = "{file}";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LanguageExecution {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    pub file_extension: String,
}

/// Execution environment descriptor for one language
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LanguageAdapter {
    pub name: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default = "default_version")]
    pub version: String,
    pub image: String,
    pub execution: LanguageExecution,
    pub memory_limit_mb: u32,
    pub cpu_limit: f32,
    #[serde(default = "default_pids_limit")]
    pub pids_limit: u32,
    #[serde(default = "default_disk_quota_mb")]
    pub disk_quota_mb: u32,
    /// Default wall-clock budget; the global default applies when absent
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Keep the sandbox warm across calls of the same session
    #[serde(default = "default_reuse_workspace")]
    pub reuse_workspace: bool,
}

fn default_version() -> String {
    "latest".to_string()
}

fn default_pids_limit() -> u32 {
    128
}

fn default_disk_quota_mb() -> u32 {
    64
}

fn default_reuse_workspace() -> bool {
    true
}

impl LanguageAdapter {
    /// Source file name written into the sandbox working directory
    pub fn source_file_name(&self) -> String {
        let ext = self.execution.file_extension.trim_start_matches('.');
        if ext.is_empty() {
            "main".to_string()
        } else {
            format!("main.{}", ext)
        }
    }

    /// Expand the command template for a source file path
    pub fn command_line(&self, file_path: &str) -> Vec<String> {
        std::iter::once(&self.execution.command)
            .chain(self.execution.args.iter())
            .map(|part| part.replace(FILE_PLACEHOLDER, file_path))
            .collect()
    }

    pub fn default_timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    pub fn memory_limit_bytes(&self) -> i64 {
        (self.memory_limit_mb as i64) * 1024 * 1024
    }

    pub fn nano_cpus(&self) -> i64 {
        (self.cpu_limit as f64 * 1_000_000_000.0) as i64
    }

    fn validate(&self) -> Result<(), RegistryError> {
        let invalid = |reason: &str| RegistryError::Invalid {
            name: self.name.clone(),
            reason: reason.to_string(),
        };

        if self.name.trim().is_empty() {
            return Err(invalid("name cannot be empty"));
        }
        if self.image.trim().is_empty() {
            return Err(invalid("image cannot be empty"));
        }
        if self.execution.command.trim().is_empty() {
            return Err(invalid("command cannot be empty"));
        }
        let mentions_file = self.execution.command.contains(FILE_PLACEHOLDER)
            || self.execution.args.iter().any(|a| a.contains(FILE_PLACEHOLDER));
        if !mentions_file {
            return Err(invalid("command template must reference {file}"));
        }
        if self.memory_limit_mb == 0 || self.pids_limit == 0 || self.disk_quota_mb == 0 {
            return Err(invalid("resource limits must be positive"));
        }
        if self.cpu_limit.is_nan() || self.cpu_limit <= 0.0 {
            return Err(invalid("cpu_limit must be positive"));
        }
        if self.timeout_ms == Some(0) {
            return Err(invalid("timeout_ms must be positive"));
        }
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct LanguagesJson {
    languages: Vec<LanguageAdapter>,
}

/// Process-wide language registry.
///
/// Populated once at startup; there is no mutation API afterwards, so lookups
/// never race with registration.
#[derive(Debug, Clone)]
pub struct LanguageRegistry {
    adapters: HashMap<String, Arc<LanguageAdapter>>,
    /// Lowercased name or alias -> canonical name
    index: HashMap<String, String>,
}

impl LanguageRegistry {
    /// Build a registry, validating every adapter and rejecting name clashes
    pub fn from_adapters(adapters: Vec<LanguageAdapter>) -> Result<Self, RegistryError> {
        let mut registry = Self {
            adapters: HashMap::new(),
            index: HashMap::new(),
        };

        for adapter in adapters {
            adapter.validate()?;
            let canonical = adapter.name.trim().to_lowercase();

            let keys = std::iter::once(canonical.clone())
                .chain(adapter.aliases.iter().map(|a| a.trim().to_lowercase()));
            for key in keys {
                if registry.index.insert(key.clone(), canonical.clone()).is_some() {
                    return Err(RegistryError::Duplicate(key));
                }
            }

            registry.adapters.insert(canonical, Arc::new(adapter));
        }

        Ok(registry)
    }

    /// Load adapters from languages.json
    pub fn load(config_path: &Path) -> Result<Self> {
        let content = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read {}", config_path.display()))?;

        let languages_json: LanguagesJson = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {}", config_path.display()))?;

        let registry = Self::from_adapters(languages_json.languages)
            .context("Invalid language configuration")?;

        info!(
            path = %config_path.display(),
            languages = ?registry.languages(),
            "Loaded language adapters"
        );
        Ok(registry)
    }

    /// Load from `config_path` when it exists, else use the built-in set
    pub fn load_or_builtin(config_path: &Path) -> Result<Self> {
        if config_path.exists() {
            return Self::load(config_path);
        }

        warn!(
            path = %config_path.display(),
            "Language config not found, using built-in adapters"
        );
        Ok(Self::builtin())
    }

    /// Built-in adapters: python, bash, javascript
    pub fn builtin() -> Self {
        Self::from_adapters(builtin_adapters()).expect("built-in adapters are valid")
    }

    /// Resolve a language identifier (case-insensitive, name or alias)
    pub fn resolve(&self, language: &str) -> Result<Arc<LanguageAdapter>, RegistryError> {
        let key = language.trim().to_lowercase();
        self.index
            .get(&key)
            .and_then(|canonical| self.adapters.get(canonical))
            .cloned()
            .ok_or_else(|| RegistryError::NotSupported(language.to_string()))
    }

    /// Canonical names of all registered languages, sorted
    pub fn languages(&self) -> Vec<String> {
        let mut names: Vec<String> = self.adapters.keys().cloned().collect();
        names.sort();
        names
    }
}

fn builtin_adapters() -> Vec<LanguageAdapter> {
    let adapter = |name: &str, aliases: &[&str], image: &str, command: &str, args: &[&str], ext: &str| {
        LanguageAdapter {
            name: name.to_string(),
            aliases: aliases.iter().map(|a| a.to_string()).collect(),
            version: default_version(),
            image: image.to_string(),
            execution: LanguageExecution {
                command: command.to_string(),
                args: args.iter().map(|a| a.to_string()).collect(),
                file_extension: ext.to_string(),
            },
            memory_limit_mb: 128,
            cpu_limit: 0.5,
            pids_limit: default_pids_limit(),
            disk_quota_mb: default_disk_quota_mb(),
            timeout_ms: None,
            reuse_workspace: true,
        }
    };

    vec![
        adapter("python", &["py", "python3"], "python:3.11-slim", "python3", &["-u", "{file}"], ".py"),
        adapter("bash", &["sh", "shell"], "bash:5.2", "bash", &["{file}"], ".sh"),
        adapter("javascript", &["js", "node"], "node:20-slim", "node", &["{file}"], ".js"),
    ]
}
