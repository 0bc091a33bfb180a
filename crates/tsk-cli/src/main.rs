use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::{debug, warn};
use tsk_config::{ClientConfig, UnknownKeyPolicy};

mod commands;

#[derive(Parser)]
#[command(name = "tsk")]
#[command(about = "Shared task list client", long_about = None)]
struct Cli {
    /// Layered config paths in merge order (repeatable)
    #[arg(long = "config", global = true)]
    config_paths: Vec<String>,

    /// Run against an in-memory paper server instead of the configured API
    #[arg(long, global = true, default_value_t = false)]
    paper: bool,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch the task list and print it
    List,

    /// Print every view change and notice until Ctrl-C
    Watch,

    /// Create a task
    Add {
        /// Task title
        title: String,
    },

    /// Mark a task completed
    Done {
        /// Task id
        id: String,
    },

    /// Mark a task not completed
    Undo {
        /// Task id
        id: String,
    },

    /// Delete a task
    Rm {
        /// Task id
        id: String,
    },

    /// Compute layered config hash + print canonical JSON
    ConfigHash {
        /// Paths in merge order (base -> env -> local...)
        #[arg(required = true)]
        paths: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Silent if the file does not exist; production injects env vars directly.
    let _ = dotenvy::from_filename(".env.local");

    init_tracing();

    let cli = Cli::parse();

    if let Commands::ConfigHash { paths } = &cli.cmd {
        let path_refs: Vec<&str> = paths.iter().map(|s| s.as_str()).collect();
        let loaded = tsk_config::load_layered_yaml(&path_refs)?;
        println!("config_hash={}", loaded.config_hash);
        println!("{}", loaded.canonical_json);
        return Ok(());
    }

    let cfg = load_config(&cli.config_paths)?;
    let client = commands::Client::connect(&cfg, cli.paper)?;

    match cli.cmd {
        Commands::List => commands::list(&client).await?,
        Commands::Watch => commands::watch(&client).await?,
        Commands::Add { title } => {
            commands::add(&client, &title).await?;
        }
        Commands::Done { id } => commands::set_completed(&client, &id, true).await?,
        Commands::Undo { id } => commands::set_completed(&client, &id, false).await?,
        Commands::Rm { id } => commands::remove(&client, &id).await?,
        Commands::ConfigHash { .. } => {}
    }

    client.shutdown().await;
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();
}

/// No paths means built-in defaults.
fn load_config(paths: &[String]) -> Result<ClientConfig> {
    if paths.is_empty() {
        return Ok(ClientConfig::default());
    }
    let path_refs: Vec<&str> = paths.iter().map(|s| s.as_str()).collect();
    let loaded = tsk_config::load_layered_yaml(&path_refs)?;
    for key in tsk_config::report_unknown_keys(&loaded.config_json, UnknownKeyPolicy::Warn)? {
        warn!(key = %key, "unknown config key ignored");
    }
    debug!(config_hash = %loaded.config_hash, "config loaded");
    // Already validated by the loader.
    Ok(loaded.config)
}
