mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "autocoder-cli")]
#[command(about = "Autocoder CLI - Manage language adapters and submit fix-retry workflows", long_about = None)]
struct Cli {
    /// Language adapter file
    #[arg(long, global = true, default_value = commands::DEFAULT_LANGUAGES_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Add a language adapter
    AddLang {
        /// Language name (e.g., ruby, go)
        #[arg(short, long)]
        name: String,

        /// Source file extension (e.g., rb, go)
        #[arg(short, long)]
        ext: String,

        /// Language version (e.g., 3.3, 1.22)
        #[arg(short, long, default_value = "latest")]
        version: String,

        /// Sandbox image (defaults to {name}:{version})
        #[arg(short, long)]
        image: Option<String>,

        /// Interpreter command (defaults to the language name)
        #[arg(short, long)]
        command: Option<String>,

        /// Command arguments; `{file}` is replaced with the source path
        #[arg(long, num_args = 1.., default_values_t = vec!["{file}".to_string()])]
        args: Vec<String>,

        /// Alternative names accepted for this language
        #[arg(short, long)]
        alias: Vec<String>,

        /// Memory limit in MB
        #[arg(short, long, default_value = "128")]
        memory: u32,

        /// CPU limit
        #[arg(long, default_value = "0.5")]
        cpu: f32,

        /// Default execution timeout in milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,

        /// Acquire a fresh sandbox for every execution
        #[arg(long, default_value = "false")]
        no_reuse: bool,
    },

    /// Remove a language adapter
    RemoveLang {
        /// Language name
        #[arg(short, long)]
        name: String,

        /// Skip confirmation
        #[arg(short, long, default_value = "false")]
        yes: bool,
    },

    /// List configured language adapters
    ListLangs,

    /// Submit a fix-retry workflow
    Submit {
        /// Language name or alias
        #[arg(short, long)]
        language: String,

        /// File holding the code to run
        #[arg(short, long)]
        file: PathBuf,

        /// Session id (defaults to a fresh one)
        #[arg(short, long)]
        session: Option<String>,

        /// Per-execution timeout in milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,

        /// Print workflow events until the workflow finishes
        #[arg(long, default_value = "false")]
        follow: bool,
    },

    /// Request cancellation of a running workflow
    Cancel {
        /// Workflow id
        #[arg(short, long)]
        id: Uuid,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::AddLang {
            name,
            ext,
            version,
            image,
            command,
            args,
            alias,
            memory,
            cpu,
            timeout_ms,
            no_reuse,
        } => {
            let adapter = commands::new_adapter(
                &name,
                &ext,
                &version,
                image.as_deref(),
                command.as_deref(),
                args,
                alias,
                memory,
                cpu,
                timeout_ms,
                !no_reuse,
            )?;
            commands::add_language(&cli.config, adapter)?;
        }
        Commands::RemoveLang { name, yes } => {
            commands::remove_language(&cli.config, &name, yes)?;
        }
        Commands::ListLangs => {
            commands::list_languages(&cli.config)?;
        }
        Commands::Submit {
            language,
            file,
            session,
            timeout_ms,
            follow,
        } => {
            commands::submit(&language, &file, session, timeout_ms, follow).await?;
        }
        Commands::Cancel { id } => {
            commands::cancel(id).await?;
        }
    }

    Ok(())
}
