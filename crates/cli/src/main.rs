//! Operator CLI for the Folio history chunk store.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use figment::Figment;
use figment::providers::{Env, Format, Toml};
use folio_chunk_store::{ChunkStore, GcOptions};
use folio_core::config::AppConfig;
use folio_core::{Chunk, ProjectId};
use folio_metadata::ChunkRecord;
use futures::TryStreamExt;
use std::path::Path;
use std::time::Duration;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "folio")]
#[command(about = "Operator CLI for the Folio history chunk store")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(long, global = true, env = "FOLIO_CONFIG", default_value = "folio.toml")]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Clone)]
struct ProjectArgs {
    /// Project id: numeric (relational) or 24-hex ObjectId (document store)
    project_id: String,
}

impl ProjectArgs {
    fn parse(&self) -> Result<ProjectId> {
        ProjectId::parse(&self.project_id)
            .with_context(|| format!("invalid project id {:?}", self.project_id))
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Create a project with an empty chunk at version 0
    Init {
        /// Use this id instead of allocating one
        #[arg(long)]
        project_id: Option<String>,
    },
    /// Show the latest chunk's metadata
    Latest {
        #[command(flatten)]
        project: ProjectArgs,
        /// Allow the lookup to be served by a read replica
        #[arg(long, default_value_t = false)]
        read_only: bool,
    },
    /// List a project's chunks
    Chunks {
        #[command(flatten)]
        project: ProjectArgs,
        /// Start from the chunk containing this version
        #[arg(long)]
        from_version: Option<i64>,
    },
    /// Load a chunk and summarize its history
    Show {
        #[command(flatten)]
        project: ProjectArgs,
        /// Chunk containing this version (default: latest)
        #[arg(long, conflicts_with = "at")]
        version: Option<i64>,
        /// Chunk covering this RFC 3339 timestamp
        #[arg(long)]
        at: Option<String>,
    },
    /// Soft-delete every chunk of a project
    Delete {
        #[command(flatten)]
        project: ProjectArgs,
    },
    /// Re-merge the latest chunk into the project record
    Sync {
        #[command(flatten)]
        project: ProjectArgs,
    },
    /// Physically delete old chunks
    Gc {
        /// Old chunks per batch (default: gc.max_delete_keys)
        #[arg(long)]
        batch_size: Option<usize>,
        /// Stop after this many batches
        #[arg(long)]
        max_batches: Option<u32>,
        /// Minimum age of a deleted chunk, in seconds (default: gc.min_age_secs)
        #[arg(long)]
        min_age_secs: Option<u64>,
        /// Time limit for the sweep, in seconds (default: gc.timeout_secs)
        #[arg(long)]
        timeout_secs: Option<u64>,
        /// Print Prometheus metrics after the sweep
        #[arg(long, default_value_t = false)]
        metrics: bool,
    },
    /// Check connectivity of every configured metadata backend
    Health,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let Cli { config, command } = Cli::parse();
    let config = load_config(Path::new(&config))?;

    folio_core::metrics::register_metrics();
    let store = folio_chunk_store::from_config(&config)
        .await
        .context("failed to initialize chunk store")?;

    match command {
        Commands::Init { project_id } => handle_init_command(&store, project_id).await,
        Commands::Latest { project, read_only } => {
            let project_id = project.parse()?;
            let record = store
                .load_latest_raw(&project_id, read_only)
                .await
                .context("failed to load latest chunk")?;
            print_record(&record)
        }
        Commands::Chunks {
            project,
            from_version,
        } => handle_chunks_command(&store, &project.parse()?, from_version).await,
        Commands::Show {
            project,
            version,
            at,
        } => handle_show_command(&store, &project.parse()?, version, at).await,
        Commands::Delete { project } => {
            let project_id = project.parse()?;
            let deleted = store
                .delete_project_chunks(&project_id)
                .await
                .context("failed to delete project chunks")?;
            println!("Deleted {deleted} chunks of project {project_id}");
            Ok(())
        }
        Commands::Sync { project } => {
            let project_id = project.parse()?;
            store
                .sync_project_record(&project_id)
                .await
                .context("failed to sync project record")?;
            println!("Project record of {project_id} is up to date");
            Ok(())
        }
        Commands::Gc {
            batch_size,
            max_batches,
            min_age_secs,
            timeout_secs,
            metrics,
        } => {
            let mut opts = GcOptions::from(&config.gc);
            if let Some(batch_size) = batch_size {
                opts.batch_size = batch_size.max(1);
            }
            if max_batches.is_some() {
                opts.max_batches = max_batches;
            }
            if let Some(secs) = min_age_secs {
                opts.min_age = Duration::from_secs(secs);
            }
            if let Some(secs) = timeout_secs {
                opts.timeout = Duration::from_secs(secs);
            }
            handle_gc_command(&store, &opts, metrics).await
        }
        Commands::Health => handle_health_command(&store).await,
    }
}

/// Load configuration from an optional TOML file overlaid with `FOLIO_`
/// environment variables (`FOLIO_GC__MAX_DELETE_KEYS=500`).
fn load_config(path: &Path) -> Result<AppConfig> {
    let mut figment = Figment::new();
    if path.exists() {
        tracing::debug!(config_path = %path.display(), "Loading configuration from file");
        figment = figment.merge(Toml::file(path));
    } else {
        tracing::debug!(config_path = %path.display(), "No config file found, using defaults");
    }

    let config: AppConfig = figment
        .merge(Env::prefixed("FOLIO_").split("__"))
        .extract()
        .context("failed to load configuration")?;
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("invalid configuration: {e}"))?;
    Ok(config)
}

async fn handle_init_command(store: &ChunkStore, project_id: Option<String>) -> Result<()> {
    let project_id = project_id
        .map(|id| ProjectId::parse(&id).with_context(|| format!("invalid project id {id:?}")))
        .transpose()?;
    let project_id = store
        .initialize_project(project_id, None)
        .await
        .context("failed to initialize project")?;
    println!("{project_id}");
    Ok(())
}

async fn handle_chunks_command(
    store: &ChunkStore,
    project_id: &ProjectId,
    from_version: Option<i64>,
) -> Result<()> {
    let mut chunks = std::pin::pin!(
        store.get_project_chunks_from_version(project_id, from_version.unwrap_or(0))
    );
    let mut count = 0usize;
    while let Some(record) = chunks
        .try_next()
        .await
        .context("failed to list project chunks")?
    {
        print_record(&record)?;
        count += 1;
    }
    if count == 0 {
        eprintln!("No chunks found.");
    }
    Ok(())
}

async fn handle_show_command(
    store: &ChunkStore,
    project_id: &ProjectId,
    version: Option<i64>,
    at: Option<String>,
) -> Result<()> {
    let chunk = match (version, at) {
        (Some(version), _) => store.load_at_version(project_id, version).await,
        (None, Some(at)) => {
            let timestamp = OffsetDateTime::parse(&at, &Rfc3339)
                .with_context(|| format!("invalid timestamp {at:?}"))?;
            store.load_at_timestamp(project_id, timestamp).await
        }
        (None, None) => store.load_latest(project_id).await,
    }
    .context("failed to load chunk")?;
    print_chunk_summary(&chunk)
}

async fn handle_gc_command(store: &ChunkStore, opts: &GcOptions, metrics: bool) -> Result<()> {
    tracing::info!(
        batch_size = opts.batch_size,
        max_batches = ?opts.max_batches,
        min_age_secs = opts.min_age.as_secs(),
        timeout_secs = opts.timeout.as_secs(),
        "Starting old chunk garbage collection"
    );
    let deleted = store
        .delete_old_chunks(opts)
        .await
        .context("garbage collection failed")?;
    println!("Deleted {deleted} old chunks");
    if metrics {
        print!("{}", folio_core::metrics::gather_text());
    }
    Ok(())
}

async fn handle_health_command(store: &ChunkStore) -> Result<()> {
    for backend in store.selector().all() {
        backend
            .health_check()
            .await
            .with_context(|| format!("{} backend is unhealthy", backend.backend_name()))?;
        println!("{}: ok", backend.backend_name());
    }
    Ok(())
}

fn format_timestamp(ts: Option<OffsetDateTime>) -> Result<Option<String>> {
    ts.map(|ts| ts.format(&Rfc3339))
        .transpose()
        .context("failed to format timestamp")
}

fn print_record(record: &ChunkRecord) -> Result<()> {
    let json = serde_json::json!({
        "id": record.id.as_str(),
        "startVersion": record.start_version,
        "endVersion": record.end_version,
        "endTimestamp": format_timestamp(record.end_timestamp)?,
    });
    println!("{json}");
    Ok(())
}

fn print_chunk_summary(chunk: &Chunk) -> Result<()> {
    let history = chunk.history();
    let json = serde_json::json!({
        "startVersion": chunk.start_version(),
        "endVersion": chunk.end_version(),
        "endTimestamp": format_timestamp(chunk.end_timestamp())?,
        "changes": history.count_changes(),
        "snapshotFiles": history.snapshot().files().keys().collect::<Vec<_>>(),
        "blobs": history.find_blob_hashes().len(),
    });
    println!(
        "{}",
        serde_json::to_string_pretty(&json).context("failed to render chunk summary")?
    );
    Ok(())
}
