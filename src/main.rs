//! # docchat CLI
//!
//! The `docchat` binary ingests PDF and EPUB documents into a local SQLite
//! library and answers questions about them through a local Ollama model.
//!
//! ## Usage
//!
//! ```bash
//! docchat --config ./config/docchat.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `docchat init` | Create the SQLite database and schema |
//! | `docchat ingest [PATHS..]` | Ingest files or directories (default: `ingest.documents_dir`) |
//! | `docchat reprocess [PATHS..]` | Delete and re-ingest documents (`--all`, `--failed`) |
//! | `docchat docs list` | List documents with their status |
//! | `docchat docs show <id>` | Show one document, its chunks and images |
//! | `docchat docs delete <id>` | Delete a document and everything derived from it |
//! | `docchat images pending` | Caption and embed images that lack an embedding |
//! | `docchat images reset` | Clear all image captions and embeddings |
//! | `docchat search "<query>"` | Show the chunks and images a question retrieves |
//! | `docchat ask "<question>"` | Answer a question from the library |
//! | `docchat models` | List installed generation models |
//! | `docchat stats` | Library statistics |
//!
//! ## Examples
//!
//! ```bash
//! docchat init
//! docchat ingest ~/Books --progress human
//! docchat reprocess --failed
//! docchat ask "How do orb weavers build their webs?" --hybrid
//! ```

use std::path::PathBuf;

use anyhow::bail;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use docchat::progress::ProgressMode;
use docchat::{chat, config, documents, generate, ingest, migrate, retrieve, stats};

/// docchat: chat with your PDF and EPUB library.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. A missing default config file means built-in defaults.
#[derive(Parser)]
#[command(
    name = "docchat",
    about = "docchat: retrieval-augmented chat over a local PDF/EPUB library",
    version,
    long_about = "docchat ingests PDF and EPUB documents (text and images), embeds them \
    into a local SQLite library, and answers questions by retrieving the most relevant \
    excerpts and passing them to a local Ollama model."
)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Defaults to `./config/docchat.toml`. When that default file does not
    /// exist, built-in defaults are used.
    #[arg(long, global = true, default_value = DEFAULT_CONFIG)]
    config: PathBuf,

    /// Increase log verbosity (`-v` info, `-vv` debug). `RUST_LOG` wins when set.
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

const DEFAULT_CONFIG: &str = "./config/docchat.toml";

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file and all tables. Idempotent.
    Init,

    /// Ingest documents.
    ///
    /// Each path may be a file or a directory; directories are walked
    /// recursively for `.pdf` and `.epub` files. Files whose content was
    /// already ingested are skipped.
    Ingest {
        /// Files or directories. Defaults to `ingest.documents_dir`.
        paths: Vec<PathBuf>,

        /// Reprocess files even if their content is already in the library.
        #[arg(long)]
        force: bool,

        /// Progress on stderr: `human`, `json` or `off`. Default: human on a TTY.
        #[arg(long)]
        progress: Option<String>,

        /// Give up after this many seconds.
        #[arg(long)]
        timeout_secs: Option<u64>,
    },

    /// Delete and re-ingest documents.
    ///
    /// This is how a failed document is retried.
    Reprocess {
        /// Files to reprocess.
        paths: Vec<PathBuf>,

        /// Reprocess every stored document whose file still exists.
        #[arg(long, conflicts_with = "failed")]
        all: bool,

        /// Reprocess every document that did not finish processing.
        #[arg(long)]
        failed: bool,

        /// Progress on stderr: `human`, `json` or `off`.
        #[arg(long)]
        progress: Option<String>,

        /// Give up after this many seconds.
        #[arg(long)]
        timeout_secs: Option<u64>,
    },

    /// Inspect and manage documents.
    Docs {
        #[command(subcommand)]
        action: DocsAction,
    },

    /// Manage image captions and embeddings.
    Images {
        #[command(subcommand)]
        action: ImagesAction,
    },

    /// Show what a query retrieves, without generating an answer.
    Search {
        /// The search query string.
        query: String,

        /// Filter semantic hits by query keywords.
        #[arg(long)]
        hybrid: bool,

        /// Number of chunks (and images) to return. Defaults to `retrieval.top_k`.
        #[arg(long)]
        limit: Option<usize>,

        /// Give up after this many seconds.
        #[arg(long)]
        timeout_secs: Option<u64>,
    },

    /// Ask a question about the library.
    Ask {
        /// The question.
        query: String,

        /// Generation model. Defaults to `ollama.model`, else the best installed model.
        #[arg(long)]
        model: Option<String>,

        /// Print the answer only once it is complete.
        #[arg(long)]
        no_stream: bool,

        /// Filter semantic hits by query keywords.
        #[arg(long)]
        hybrid: bool,

        /// Give up after this many seconds.
        #[arg(long)]
        timeout_secs: Option<u64>,
    },

    /// List generation models installed on the Ollama backend.
    Models,

    /// Show library statistics.
    Stats,
}

/// Document subcommands.
#[derive(Subcommand)]
enum DocsAction {
    /// List all documents, newest first.
    List,
    /// Show one document with its chunks and images.
    Show {
        /// Document UUID.
        id: String,
    },
    /// Delete a document, its chunks, images and extracted image files.
    Delete {
        /// Document UUID.
        id: String,
    },
}

/// Image subcommands.
#[derive(Subcommand)]
enum ImagesAction {
    /// Caption and embed every image that lacks an embedding.
    Pending {
        /// Progress on stderr: `human`, `json` or `off`.
        #[arg(long)]
        progress: Option<String>,

        /// Give up after this many seconds.
        #[arg(long)]
        timeout_secs: Option<u64>,
    },
    /// Clear captions and embeddings on all images.
    Reset,
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn progress_mode(flag: Option<&str>) -> anyhow::Result<ProgressMode> {
    match flag {
        None => Ok(ProgressMode::default_for_tty()),
        Some(s) => match ProgressMode::parse(s) {
            Some(mode) => Ok(mode),
            None => bail!("invalid --progress value '{}': expected human, json or off", s),
        },
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    // An explicitly named config file must exist
    let cfg = if cli.config.as_os_str() == DEFAULT_CONFIG {
        config::load_config_or_default(&cli.config)?
    } else {
        config::load_config(&cli.config)?
    };

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Ingest {
            paths,
            force,
            progress,
            timeout_secs,
        } => {
            let mode = progress_mode(progress.as_deref())?;
            ingest::run_ingest(&cfg, &paths, force, timeout_secs, mode).await?;
        }
        Commands::Reprocess {
            paths,
            all,
            failed,
            progress,
            timeout_secs,
        } => {
            let mode = progress_mode(progress.as_deref())?;
            ingest::run_reprocess(&cfg, &paths, all, failed, timeout_secs, mode).await?;
        }
        Commands::Docs { action } => match action {
            DocsAction::List => documents::run_docs_list(&cfg).await?,
            DocsAction::Show { id } => documents::run_docs_show(&cfg, &id).await?,
            DocsAction::Delete { id } => documents::run_docs_delete(&cfg, &id).await?,
        },
        Commands::Images { action } => match action {
            ImagesAction::Pending {
                progress,
                timeout_secs,
            } => {
                let mode = progress_mode(progress.as_deref())?;
                ingest::run_images_pending(&cfg, timeout_secs, mode).await?;
            }
            ImagesAction::Reset => ingest::run_images_reset(&cfg).await?,
        },
        Commands::Search {
            query,
            hybrid,
            limit,
            timeout_secs,
        } => {
            retrieve::run_search(&cfg, &query, hybrid, limit, timeout_secs).await?;
        }
        Commands::Ask {
            query,
            model,
            no_stream,
            hybrid,
            timeout_secs,
        } => {
            chat::run_ask(&cfg, &query, model.as_deref(), no_stream, hybrid, timeout_secs).await?;
        }
        Commands::Models => generate::run_models(&cfg).await?,
        Commands::Stats => stats::run_stats(&cfg).await?,
    }

    Ok(())
}
