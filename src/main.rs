//! # Sourcebook CLI (`sbk`)
//!
//! ## Usage
//!
//! ```bash
//! sbk --config ./config/sourcebook.toml <command>
//! ```
//!
//! | Command | Description |
//! |---------|-------------|
//! | `sbk init` | Create the SQLite database and run schema migrations |
//! | `sbk serve` | Start the JSON HTTP API |
//! | `sbk documents` | List documents, filterable by status and classification |

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use sourcebook::config;
use sourcebook::db;
use sourcebook::migrate;
use sourcebook::models::{Classification, DocumentStatus};
use sourcebook::server;
use sourcebook::store::{DocumentFilter, DocumentStore};

/// Sourcebook — document compliance pipeline and citation-grounded chat.
#[derive(Parser)]
#[command(
    name = "sbk",
    about = "Sourcebook — document compliance pipeline and citation-grounded chat",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/sourcebook.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file and all required tables. Idempotent —
    /// running it multiple times is safe.
    Init,

    /// Start the HTTP server on `[server].bind`.
    Serve,

    /// List documents.
    Documents {
        /// Filter by status (`draft`, `scanning`, `scanned`, `pending_metadata`,
        /// `published`, `rejected`).
        #[arg(long)]
        status: Option<String>,

        /// Filter by classification (`public`, `internal`, `confidential`).
        #[arg(long)]
        classification: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            let pool = db::connect(&cfg).await?;
            migrate::run_migrations(&pool).await?;
            println!("Database initialized successfully.");
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
        Commands::Documents {
            status,
            classification,
        } => {
            let status = match status.as_deref() {
                Some(s) => Some(
                    DocumentStatus::parse(s)
                        .ok_or_else(|| anyhow::anyhow!("unknown status: {}", s))?,
                ),
                None => None,
            };
            let classification = match classification.as_deref() {
                Some(s) => Some(
                    Classification::parse(s)
                        .ok_or_else(|| anyhow::anyhow!("unknown classification: {}", s))?,
                ),
                None => None,
            };

            let pool = db::connect(&cfg).await?;
            migrate::run_migrations(&pool).await?;
            let store = DocumentStore::new(pool);
            let docs = store
                .list(DocumentFilter {
                    status,
                    classification,
                })
                .await?;

            if docs.is_empty() {
                println!("No documents.");
            }
            for d in docs {
                println!(
                    "{}  v{}  {:16}  {}",
                    d.id,
                    d.version,
                    d.status.as_str(),
                    d.title
                );
            }
        }
    }

    Ok(())
}
