//! modelship CLI
//!
//! Command-line interface for the modelship registry and prediction server.

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

/// modelship - versioned model registry and prediction server
#[derive(Parser, Debug)]
#[command(name = "modelship")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Daemon API address
    #[arg(long, default_value = "http://localhost:8000", global = true)]
    api: String,

    /// Registered model name
    #[arg(short, long, default_value = "ml-demo-model", global = true)]
    model: String,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Register a version from a training run
    Register {
        /// Training run identifier
        run: String,

        /// Artifact location
        artifact: String,

        /// Version description
        #[arg(long, default_value = "")]
        description: String,

        /// Tag as key=value (repeatable)
        #[arg(long = "tag", value_parser = commands::parse_tag)]
        tags: Vec<(String, String)>,
    },

    /// Set a tag on a version
    Tag {
        version: u64,
        key: String,
        value: String,
    },

    /// Point an alias at a version
    SetAlias {
        /// Alias to set (e.g., staging, prod)
        alias: String,

        /// Version number (defaults to the latest version)
        #[arg(long)]
        version: Option<u64>,
    },

    /// List versions of the model
    ListVersions,

    /// List versions with the aliases pointing at each
    ListAliases,

    /// Check that aliases resolve
    VerifyAliases {
        #[arg(default_values = ["staging", "prod"])]
        aliases: Vec<String>,
    },

    /// Register a run and point an alias at it
    Promote {
        /// Training run identifier
        #[arg(long, conflicts_with = "runs", requires = "artifact")]
        run: Option<String>,

        /// Artifact location of the run
        #[arg(long, conflicts_with = "runs")]
        artifact: Option<String>,

        /// JSON file of run records; the latest finished run is promoted
        #[arg(long)]
        runs: Option<PathBuf>,

        /// Alias to point at the promoted version
        #[arg(long, default_value = "prod")]
        alias: String,

        /// Version description
        #[arg(long, default_value = "Auto-registered from latest successful training run.")]
        description: String,

        /// Tag as key=value (repeatable)
        #[arg(long = "tag", value_parser = commands::parse_tag)]
        tags: Vec<(String, String)>,
    },

    /// Request predictions
    Predict {
        /// Inline JSON rows, or @path to read them from a file
        input: String,

        /// Model reference to serve from (defaults to the server's)
        #[arg(long)]
        model_ref: Option<String>,
    },

    /// Show server health
    Health,

    /// Show predictor cache status
    Cache,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::WARN
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);

    let client = commands::ApiClient::new(&cli.api);
    let model = cli.model;

    match cli.command {
        Commands::Register {
            run,
            artifact,
            description,
            tags,
        } => {
            commands::register(&client, &model, run, artifact, description, tags).await?;
        }
        Commands::Tag { version, key, value } => {
            commands::tag(&client, &model, version, key, value).await?;
        }
        Commands::SetAlias { alias, version } => {
            commands::set_alias(&client, &model, &alias, version).await?;
        }
        Commands::ListVersions => {
            commands::list_versions(&client, &model).await?;
        }
        Commands::ListAliases => {
            commands::list_aliases(&client, &model).await?;
        }
        Commands::VerifyAliases { aliases } => {
            commands::verify_aliases(&client, &model, &aliases).await?;
        }
        Commands::Promote {
            run,
            artifact,
            runs,
            alias,
            description,
            tags,
        } => {
            let source = match (runs, run, artifact) {
                (Some(path), _, _) => commands::PromoteSource::Runs(path),
                (None, Some(run), Some(artifact)) => commands::PromoteSource::Run { run, artifact },
                _ => anyhow::bail!("either --runs or both --run and --artifact are required"),
            };
            commands::promote(&client, &model, source, alias, description, tags).await?;
        }
        Commands::Predict { input, model_ref } => {
            commands::predict(&client, &input, model_ref).await?;
        }
        Commands::Health => {
            commands::health(&client).await?;
        }
        Commands::Cache => {
            commands::cache(&client).await?;
        }
    }

    Ok(())
}
