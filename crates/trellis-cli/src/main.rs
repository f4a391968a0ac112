use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};

mod commands;
mod ui;

#[derive(Parser)]
#[command(name = "trellis")]
#[command(about = "Maintenance jobs for Trellis graph databases.")]
#[command(version)]
struct Cli {
    /// Engine config file (defaults to $TRELLIS_DATA_DIR/engine.toml)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Recompute relation tiers, neighbor counts and contexts for every element
    Reindex,

    /// Recompute neighbor counts from live adjacency
    RefreshNeighbors {
        /// Refresh identifications (tags) instead of other elements
        #[arg(long)]
        tags: bool,
    },

    /// Recompute contexts of elements flagged as stale
    IndexDirty,

    /// Audit counters, relation tiers and reference counts
    Verify {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show element counts
    Stats {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Search indexed elements
    Search {
        /// Phrase to look for
        #[arg(value_name = "TERM")]
        term: String,

        /// Who is searching
        #[arg(long, value_enum, default_value = "public")]
        audience: AudienceArg,

        /// Owner to search as when the audience is `owner`
        #[arg(long)]
        owner: Option<String>,

        /// Maximum number of results
        #[arg(long, default_value = "20")]
        limit: usize,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum AudienceArg {
    Owner,
    Friends,
    Public,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing for debug logs (hidden by default)
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .init();

    let cli = Cli::parse();
    let config = commands::load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Reindex => commands::reindex::run(config).await,
        Commands::RefreshNeighbors { tags } => commands::reindex::refresh(config, tags).await,
        Commands::IndexDirty => commands::reindex::index_dirty(config).await,
        Commands::Verify { json } => commands::verify::run(config, json).await,
        Commands::Stats { json } => commands::stats::run(config, json).await,
        Commands::Search {
            term,
            audience,
            owner,
            limit,
        } => {
            let audience = match audience {
                AudienceArg::Owner => commands::search::owner_audience(owner)?,
                AudienceArg::Friends => trellis_graph::Audience::Friends,
                AudienceArg::Public => trellis_graph::Audience::Public,
            };
            commands::search::run(config, &term, audience, limit).await
        }
    }
}
