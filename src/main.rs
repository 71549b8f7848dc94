//! # PDM Assist CLI (`pdm`)
//!
//! Runs the web application and exposes its operations on the command line.
//!
//! ## Usage
//!
//! ```bash
//! pdm --config ./config/pdm.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `pdm init` | Create the SQLite database and schema |
//! | `pdm user add <email>` | Create a login |
//! | `pdm user passwd <email>` | Change a password (revokes sessions) |
//! | `pdm user list` | List logins |
//! | `pdm serve` | Start the web application |
//! | `pdm search "<query>"` | Material search |
//! | `pdm equivalents "<material>"` | Equivalent designations in other standards |
//! | `pdm validate --file rows.json` | Cross-check rows against web sources |
//! | `pdm parse-table [file]` | Extract markdown tables (stdin by default) as JSON |
//! | `pdm pivot-sql --file req.json` | Print the SQL for a pivot request |
//! | `pdm feedback list\|stats` | Inspect ratings |
//! | `pdm sessions purge` | Delete expired and revoked sessions |
//!
//! Logging goes to stderr and is controlled by `RUST_LOG`
//! (default `pdm_assist=info,tower_http=info`).

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use pdm_assist::{commands, config, server};

/// PDM Assist: AI-assisted search, enrichment and validation of material
/// master data.
#[derive(Parser)]
#[command(
    name = "pdm",
    about = "PDM Assist: AI-assisted search, enrichment and validation of material records",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/pdm.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Safe to run repeatedly.
    Init,

    /// Manage logins.
    User {
        #[command(subcommand)]
        action: UserAction,
    },

    /// Start the web application on `[server].bind`.
    Serve,

    /// Search materials through the search workflow or the AI provider.
    Search {
        query: String,

        /// Print the full outcome as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Find equivalent designations of a material in other standards.
    Equivalents {
        material: String,

        /// Restrict to these standards (repeatable), e.g. `--standard DIN`.
        #[arg(long = "standard")]
        standards: Vec<String>,

        #[arg(long)]
        json: bool,
    },

    /// Validate material rows read from a JSON file.
    Validate {
        #[arg(long)]
        file: PathBuf,

        /// Fields to check (repeatable); defaults to every populated field.
        #[arg(long = "field")]
        fields: Vec<String>,
    },

    /// Extract markdown tables from text and print them as JSON.
    ParseTable {
        /// Input file; reads stdin when omitted.
        file: Option<PathBuf>,
    },

    /// Print the SQL statement for a pivot request (JSON file).
    PivotSql {
        #[arg(long)]
        file: PathBuf,
    },

    /// Inspect collected ratings.
    Feedback {
        #[command(subcommand)]
        action: FeedbackAction,
    },

    /// Session maintenance.
    Sessions {
        #[command(subcommand)]
        action: SessionsAction,
    },
}

#[derive(Subcommand)]
enum UserAction {
    /// Create a login. The password is read from stdin unless `--password` is given.
    Add {
        email: String,

        #[arg(long)]
        name: Option<String>,

        #[arg(long)]
        password: Option<String>,
    },
    /// Change a password. Reads stdin unless `--password` is given.
    Passwd {
        email: String,

        #[arg(long)]
        password: Option<String>,
    },
    List,
}

#[derive(Subcommand)]
enum FeedbackAction {
    /// Most recent ratings first.
    List {
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
    /// Count, average and per-rating histogram.
    Stats,
}

#[derive(Subcommand)]
enum SessionsAction {
    /// Delete expired and revoked sessions.
    Purge,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("pdm_assist=info,tower_http=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    // Commands that don't require config
    if let Commands::ParseTable { file } = &cli.command {
        commands::run_parse_table(file.as_deref())?;
        return Ok(());
    }

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => commands::run_init(&cfg).await?,
        Commands::User { action } => match action {
            UserAction::Add {
                email,
                name,
                password,
            } => commands::run_user_add(&cfg, &email, name.as_deref(), password).await?,
            UserAction::Passwd { email, password } => {
                commands::run_user_passwd(&cfg, &email, password).await?
            }
            UserAction::List => commands::run_user_list(&cfg).await?,
        },
        Commands::Serve => server::run_server(&cfg).await?,
        Commands::Search { query, json } => commands::run_search(&cfg, &query, json).await?,
        Commands::Equivalents {
            material,
            standards,
            json,
        } => commands::run_equivalents(&cfg, &material, &standards, json).await?,
        Commands::Validate { file, fields } => {
            commands::run_validate(&cfg, &file, &fields).await?
        }
        Commands::ParseTable { .. } => {
            // Handled above (before config loading)
            unreachable!()
        }
        Commands::PivotSql { file } => commands::run_pivot_sql(&cfg, &file)?,
        Commands::Feedback { action } => match action {
            FeedbackAction::List { limit } => commands::run_feedback_list(&cfg, limit).await?,
            FeedbackAction::Stats => commands::run_feedback_stats(&cfg).await?,
        },
        Commands::Sessions { action } => match action {
            SessionsAction::Purge => commands::run_sessions_purge(&cfg).await?,
        },
    }

    Ok(())
}
