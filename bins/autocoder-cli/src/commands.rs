// CLI commands for managing Autocoder
use anyhow::{bail, Context, Result};
use autocoder_common::redis;
use autocoder_common::types::{WorkflowEvent, WorkflowJob};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{self, Write};
use std::path::Path;
use std::time::Duration;
use uuid::Uuid;

pub const DEFAULT_LANGUAGES_PATH: &str = "config/languages.json";
const FILE_PLACEHOLDER: &str = "{file}";
const FOLLOW_POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LanguageExecution {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    pub file_extension: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LanguageConfig {
    pub name: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    pub version: String,
    pub image: String,
    pub execution: LanguageExecution,
    pub memory_limit_mb: u32,
    pub cpu_limit: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pids_limit: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk_quota_mb: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default = "default_reuse_workspace")]
    pub reuse_workspace: bool,
}

fn default_reuse_workspace() -> bool {
    true
}

impl LanguageConfig {
    /// Canonical name plus aliases, lowercased
    fn names(&self) -> impl Iterator<Item = String> + '_ {
        std::iter::once(&self.name)
            .chain(self.aliases.iter())
            .map(|n| n.trim().to_lowercase())
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct LanguagesJson {
    pub languages: Vec<LanguageConfig>,
}

/// Load languages configuration
fn load_languages_config(config_path: &Path) -> Result<LanguagesJson> {
    if !config_path.exists() {
        return Ok(LanguagesJson::default());
    }

    let content = fs::read_to_string(config_path)
        .with_context(|| format!("Failed to read {}", config_path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse {}", config_path.display()))
}

/// Save languages configuration
fn save_languages_config(config_path: &Path, config: &LanguagesJson) -> Result<()> {
    // Ensure config directory exists
    if let Some(parent) = config_path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let json_content = serde_json::to_string_pretty(&config)
        .context("Failed to serialize languages.json")?;

    fs::write(config_path, json_content)
        .with_context(|| format!("Failed to write {}", config_path.display()))?;

    Ok(())
}

/// Build an adapter entry from command-line values, applying defaults
#[allow(clippy::too_many_arguments)]
pub fn new_adapter(
    name: &str,
    ext: &str,
    version: &str,
    image: Option<&str>,
    command: Option<&str>,
    args: Vec<String>,
    aliases: Vec<String>,
    memory: u32,
    cpu: f32,
    timeout_ms: Option<u64>,
    reuse_workspace: bool,
) -> Result<LanguageConfig> {
    let name = name.trim().to_lowercase();
    if name.is_empty() || ext.trim().is_empty() {
        bail!("Language name and extension cannot be empty");
    }
    if !args.iter().any(|a| a.contains(FILE_PLACEHOLDER)) {
        bail!("Command arguments must reference the source file as {}", FILE_PLACEHOLDER);
    }
    if memory == 0 || cpu <= 0.0 {
        bail!("Memory and CPU limits must be positive");
    }
    if timeout_ms == Some(0) {
        bail!("Timeout must be positive");
    }

    let file_extension = if ext.starts_with('.') {
        ext.to_string()
    } else {
        format!(".{}", ext)
    };

    Ok(LanguageConfig {
        image: image
            .map(|i| i.to_string())
            .unwrap_or_else(|| format!("{}:{}", name, version)),
        execution: LanguageExecution {
            command: command.unwrap_or(&name).to_string(),
            args,
            file_extension,
        },
        name,
        aliases,
        version: version.to_string(),
        memory_limit_mb: memory,
        cpu_limit: cpu,
        pids_limit: None,
        disk_quota_mb: None,
        timeout_ms,
        reuse_workspace,
    })
}

/// Add a language adapter to the config file
pub fn add_language(config_path: &Path, adapter: LanguageConfig) -> Result<()> {
    println!("🚀 Adding language: {}", adapter.name);

    let mut languages_json = load_languages_config(config_path)?;

    // Names and aliases share one case-insensitive namespace
    for taken in languages_json.languages.iter().flat_map(|l| l.names()) {
        if let Some(clash) = adapter.names().find(|n| *n == taken) {
            bail!("Language name or alias '{}' already exists in config", clash);
        }
    }

    println!("📝 Updating {}...", config_path.display());
    let image = adapter.image.clone();
    let name = adapter.name.clone();
    languages_json.languages.push(adapter);
    save_languages_config(config_path, &languages_json)?;

    println!("✅ Language '{}' added successfully!", name);
    println!("\n📋 Next steps:");
    println!("  1. Pull the sandbox image: docker pull {}", image);
    println!("  2. Restart the worker to load the adapter");

    Ok(())
}

/// Remove a language adapter from the config file
pub fn remove_language(config_path: &Path, name: &str, yes: bool) -> Result<()> {
    println!("🗑️  Removing language: {}", name);

    let mut languages_json = load_languages_config(config_path)?;

    let wanted = name.trim().to_lowercase();
    let lang_index = languages_json
        .languages
        .iter()
        .position(|l| l.name.to_lowercase() == wanted)
        .ok_or_else(|| anyhow::anyhow!("Language '{}' not found in config", name))?;

    // Confirm deletion
    if !yes {
        println!("⚠️  This will remove the '{}' entry from {}", wanted, config_path.display());
        print!("\nContinue? (y/N): ");
        io::stdout().flush()?;

        let mut input = String::new();
        io::stdin().read_line(&mut input)?;

        if !input.trim().eq_ignore_ascii_case("y") {
            println!("❌ Aborted");
            return Ok(());
        }
    }

    languages_json.languages.remove(lang_index);
    println!("📝 Removing from {}...", config_path.display());
    save_languages_config(config_path, &languages_json)?;

    println!("✅ Language '{}' removed successfully!", wanted);
    println!("\n📋 Restart the worker to apply the change");

    Ok(())
}

/// List all configured languages
pub fn list_languages(config_path: &Path) -> Result<()> {
    let languages_json = load_languages_config(config_path)?;

    if languages_json.languages.is_empty() {
        println!("No languages configured.");
        println!("\n💡 Add a language with: autocoder-cli add-lang --name <name> --ext <ext>");
        return Ok(());
    }

    println!("📋 Configured Languages:\n");
    println!("{:<12} {:<10} {:<24} {:<18} {:<8} {:<10}",
             "Name", "Version", "Image", "Aliases", "Reuse", "CPU/Mem");
    println!("{}", "─".repeat(100));

    for lang in &languages_json.languages {
        println!("{:<12} {:<10} {:<24} {:<18} {:<8} {:.1}/{} MB",
                 lang.name,
                 lang.version,
                 lang.image,
                 lang.aliases.join(","),
                 if lang.reuse_workspace { "yes" } else { "no" },
                 lang.cpu_limit,
                 lang.memory_limit_mb);
    }

    println!("\n✅ Total: {} language(s)", languages_json.languages.len());

    Ok(())
}

async fn connect() -> Result<::redis::aio::ConnectionManager> {
    let redis_url = autocoder_common::config::redis_url();
    let client = ::redis::Client::open(redis_url.as_str())?;
    ::redis::aio::ConnectionManager::new(client)
        .await
        .with_context(|| format!("Failed to connect to Redis at {}", redis_url))
}

/// Queue a workflow job, optionally following its events
pub async fn submit(
    language: &str,
    file: &Path,
    session: Option<String>,
    timeout_ms: Option<u64>,
    follow: bool,
) -> Result<()> {
    let code = fs::read_to_string(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;
    if code.trim().is_empty() {
        bail!("{} is empty", file.display());
    }

    let session_id = session.unwrap_or_else(|| format!("cli-{}", Uuid::new_v4()));
    let mut job = WorkflowJob::new(session_id, language, code);
    job.timeout_ms = timeout_ms;

    let mut conn = connect().await?;
    redis::push_job(&mut conn, &job).await.context("Failed to queue workflow")?;

    println!("📨 Submitted workflow {}", job.id);
    println!("   session: {}  language: {}", job.session_id, job.language);

    if follow {
        follow_events(&mut conn, &job.id).await?;
    } else {
        println!("\n💡 Cancel with: autocoder-cli cancel --id {}", job.id);
    }

    Ok(())
}

/// Print mirrored events until the workflow reaches a terminal status
async fn follow_events(conn: &mut ::redis::aio::ConnectionManager, workflow_id: &Uuid) -> Result<()> {
    let mut next = 0;
    loop {
        let events = redis::read_events(conn, workflow_id, next).await?;
        for event in &events {
            print_event(event);
            if event.is_terminal() {
                return Ok(());
            }
        }
        next += events.len();

        // The status key is written after the last event, so drain once more
        if let Some(status) = redis::get_status(conn, workflow_id).await? {
            for event in redis::read_events(conn, workflow_id, next).await? {
                print_event(&event);
            }
            println!("🏁 Workflow finished: {}", status);
            return Ok(());
        }

        tokio::time::sleep(FOLLOW_POLL_INTERVAL).await;
    }
}

fn print_event(event: &WorkflowEvent) {
    println!("{}", format_event(event));
    if let Some(result) = &event.result {
        if let Some(stdout) = result.stdout.as_deref().filter(|s| !s.is_empty()) {
            println!("  stdout:\n{}", indent(stdout));
        }
        if let Some(stderr) = result.stderr.as_deref().filter(|s| !s.is_empty()) {
            println!("  stderr:\n{}", indent(stderr));
        }
    }
}

fn format_event(event: &WorkflowEvent) -> String {
    let mut line = format!("[step {}] {}", event.step, event.status);
    if let Some(kind) = event.kind {
        line.push_str(&format!(" ({})", kind));
    }
    if let Some(exit_code) = event.result.as_ref().and_then(|r| r.exit_code) {
        line.push_str(&format!(" exit={}", exit_code));
    }
    if let Some(error) = &event.error {
        line.push_str(&format!(" - {}", error));
    }
    line
}

fn indent(text: &str) -> String {
    text.lines().map(|l| format!("    {}", l)).collect::<Vec<_>>().join("\n")
}

/// Flag a workflow for cancellation
pub async fn cancel(workflow_id: Uuid) -> Result<()> {
    let mut conn = connect().await?;
    redis::request_cancel(&mut conn, &workflow_id)
        .await
        .context("Failed to set cancel flag")?;

    match redis::get_status(&mut conn, &workflow_id).await? {
        Some(status) => println!("⚠️  Workflow {} already finished: {}", workflow_id, status),
        None => println!("🛑 Cancellation requested for {}", workflow_id),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use autocoder_common::types::{EventResult, Status, StepKind};

    fn ruby() -> LanguageConfig {
        new_adapter(
            "Ruby",
            "rb",
            "3.3",
            None,
            None,
            vec!["{file}".to_string()],
            vec!["rb".to_string()],
            128,
            0.5,
            Some(5000),
            true,
        )
        .unwrap()
    }

    #[test]
    fn test_new_adapter_defaults() {
        let adapter = ruby();
        assert_eq!(adapter.name, "ruby");
        assert_eq!(adapter.image, "ruby:3.3");
        assert_eq!(adapter.execution.command, "ruby");
        assert_eq!(adapter.execution.file_extension, ".rb");
        assert_eq!(adapter.timeout_ms, Some(5000));
    }

    #[test]
    fn test_new_adapter_rejects_missing_placeholder() {
        let result = new_adapter(
            "ruby", "rb", "3.3", None, None,
            vec!["main.rb".to_string()], vec![], 128, 0.5, None, true,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_add_list_remove_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config/languages.json");

        add_language(&path, ruby()).unwrap();
        let saved = load_languages_config(&path).unwrap();
        assert_eq!(saved.languages.len(), 1);
        assert_eq!(saved.languages[0].aliases, vec!["rb".to_string()]);

        list_languages(&path).unwrap();

        remove_language(&path, "RUBY", true).unwrap();
        assert!(load_languages_config(&path).unwrap().languages.is_empty());
    }

    #[test]
    fn test_add_rejects_alias_clash() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("languages.json");
        add_language(&path, ruby()).unwrap();

        let mut clash = new_adapter(
            "crystal", "cr", "1.12", None, None,
            vec!["{file}".to_string()], vec!["RB".to_string()], 128, 0.5, None, true,
        )
        .unwrap();
        assert!(add_language(&path, clash.clone()).is_err());

        clash.aliases.clear();
        add_language(&path, clash).unwrap();
        assert_eq!(load_languages_config(&path).unwrap().languages.len(), 2);
    }

    #[test]
    fn test_remove_unknown_language_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("languages.json");
        assert!(remove_language(&path, "cobol", true).is_err());
    }

    #[test]
    fn test_reads_worker_config_file() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../config/languages.json");
        let config = load_languages_config(&path).unwrap();
        assert!(config.languages.iter().any(|l| l.name == "python"));
    }

    #[test]
    fn test_format_event() {
        let event = WorkflowEvent::new(Status::Failed, 1)
            .with_kind(StepKind::Execute)
            .with_result(EventResult {
                stdout: None,
                stderr: Some("boom".to_string()),
                exit_code: Some(1),
            })
            .with_error("exit code 1");
        assert_eq!(format_event(&event), "[step 1] failed (execute) exit=1 - exit code 1");
    }
}
