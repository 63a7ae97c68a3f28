//! Drift CLI - drive document sync from the terminal
//!
//! Inspect the operation queue, push documents, and resolve conflicts
//! against a Drift sync server.

use std::env;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::aot::Generator;
use clap_complete::{generate, shells};
use drift_core::client::{AuthProvider, RemoteSyncClient};
use drift_core::db::{Database, SqliteVersionRepository, VersionRepository};
use drift_core::models::{ConflictResolution, PendingOperation, SyncConflict};
use drift_core::queue::OperationQueue;
use drift_core::sync::{SyncCoordinator, SyncOperationHandler};
use drift_core::DocumentSnapshot;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;

#[derive(Parser)]
#[command(name = "drift")]
#[command(about = "Offline-first document sync from the command line")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Sync server base URL (falls back to DRIFT_SERVER_URL)
    #[arg(long, value_name = "URL")]
    server_url: Option<String>,

    /// Bearer token for the sync API (falls back to DRIFT_TOKEN)
    #[arg(long, value_name = "TOKEN")]
    token: Option<String>,

    /// Optional path to local sync database file
    #[arg(long, value_name = "PATH")]
    db_path: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show sync status: pending operations, conflicts, last sync
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Replay the operation queue and pull the remote state
    Sync,
    /// Upload a document from a file
    Push {
        /// Workspace-relative document path
        path: String,
        /// File to read the content from
        file: PathBuf,
        /// Optional file to read sidecar metadata from
        #[arg(long, value_name = "PATH")]
        sidecar: Option<PathBuf>,
    },
    /// List queued operations awaiting replay
    Pending {
        /// Only show operations parked at the retry ceiling
        #[arg(long)]
        stuck: bool,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// List unresolved conflicts
    Conflicts {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show both sides of a conflict
    Show {
        /// Conflict ID
        conflict_id: String,
    },
    /// Resolve a conflict
    Resolve {
        /// Conflict ID
        conflict_id: String,
        /// Which side wins
        #[arg(value_enum)]
        resolution: ResolutionArg,
    },
    /// Download a document from the server
    Fetch {
        /// Server document ID
        document_id: String,
        /// Optional output path (stdout when omitted)
        #[arg(short, long, value_name = "PATH")]
        output: Option<PathBuf>,
    },
    /// Show storage usage against the plan quota
    Usage {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Clear local sync state (version ledger and cached remote data)
    Reset {
        /// Confirm the reset
        #[arg(long)]
        yes: bool,
    },
    /// Generate shell completion scripts
    Completions {
        /// Target shell
        #[arg(value_enum)]
        shell: CompletionShell,
        /// Optional output path (stdout when omitted)
        #[arg(short, long, value_name = "PATH")]
        output: Option<PathBuf>,
    },
}

#[derive(Debug, Error)]
enum CliError {
    #[error(transparent)]
    Core(#[from] drift_core::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    #[error("Sync server is not configured. Pass --server-url or set DRIFT_SERVER_URL.")]
    ServerNotConfigured,
    #[error("Sync failed: {0}")]
    SyncFailed(String),
    #[error("Upload was not accepted: {0}")]
    UploadRejected(String),
    #[error("Resolution failed: {0}")]
    ResolutionFailed(String),
    #[error("Refusing to reset local sync state without --yes")]
    ResetNotConfirmed,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
enum ResolutionArg {
    /// Keep the local content; the remote side becomes a conflicted copy
    Local,
    /// Keep the remote content; the local side becomes a conflicted copy
    Remote,
    /// Keep both: remote at the original path, local as a conflicted copy
    Both,
}

impl From<ResolutionArg> for ConflictResolution {
    fn from(arg: ResolutionArg) -> Self {
        match arg {
            ResolutionArg::Local => Self::Local,
            ResolutionArg::Remote => Self::Remote,
            ResolutionArg::Both => Self::Both,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
enum CompletionShell {
    Bash,
    Zsh,
    Fish,
}

/// One wired-up sync engine for a CLI invocation.
///
/// The connectivity sender stays alive for the lifetime of the engine; a CLI
/// session assumes it is online and lets individual calls fail with network
/// errors instead.
struct Engine {
    db: Arc<Database>,
    client: Arc<RemoteSyncClient>,
    queue: Arc<OperationQueue>,
    coordinator: SyncCoordinator,
    _online_tx: watch::Sender<bool>,
}

struct StaticTokenProvider {
    token: Option<String>,
}

impl AuthProvider for StaticTokenProvider {
    fn bearer_token(&self) -> Option<String> {
        self.token.clone()
    }
}

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        eprintln!("Error: {error}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), CliError> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("drift=info".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();

    if let Commands::Completions { shell, output } = &cli.command {
        return run_completions(*shell, output.as_deref());
    }

    let server_url = cli
        .server_url
        .or_else(|| env::var("DRIFT_SERVER_URL").ok())
        .ok_or(CliError::ServerNotConfigured)?;
    let token = cli.token.or_else(|| env::var("DRIFT_TOKEN").ok());
    let db_path = resolve_db_path(cli.db_path);
    let engine = connect(&server_url, token, &db_path)?;

    match cli.command {
        Commands::Status { json } => run_status(&engine, json).await?,
        Commands::Sync => run_sync(&engine).await?,
        Commands::Push {
            path,
            file,
            sidecar,
        } => run_push(&engine, &path, &file, sidecar.as_deref()).await?,
        Commands::Pending { stuck, json } => run_pending(&engine, stuck, json)?,
        Commands::Conflicts { json } => run_conflicts(&engine, json)?,
        Commands::Show { conflict_id } => run_show(&engine, &conflict_id).await?,
        Commands::Resolve {
            conflict_id,
            resolution,
        } => run_resolve(&engine, &conflict_id, resolution).await?,
        Commands::Fetch {
            document_id,
            output,
        } => run_fetch(&engine, &document_id, output.as_deref()).await?,
        Commands::Usage { json } => run_usage(&engine, json).await?,
        Commands::Reset { yes } => run_reset(&engine, yes)?,
        Commands::Completions { .. } => unreachable!("handled before engine setup"),
    }

    Ok(())
}

fn connect(server_url: &str, token: Option<String>, db_path: &Path) -> Result<Engine, CliError> {
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let db = Arc::new(Database::open(db_path)?);
    let auth: Arc<dyn AuthProvider> = Arc::new(StaticTokenProvider { token });
    let client = Arc::new(RemoteSyncClient::new(server_url, Arc::clone(&auth))?);
    let handler = Arc::new(SyncOperationHandler::new(
        Arc::clone(&client),
        Arc::clone(&db),
    ));
    let queue = OperationQueue::new(Arc::clone(&db), handler)?;
    let (online_tx, online_rx) = watch::channel(true);
    let coordinator = SyncCoordinator::new(
        Arc::clone(&client),
        Arc::clone(&db),
        Arc::clone(&queue),
        auth,
        online_rx,
    );

    Ok(Engine {
        db,
        client,
        queue,
        coordinator,
        _online_tx: online_tx,
    })
}

async fn run_status(engine: &Engine, as_json: bool) -> Result<(), CliError> {
    // Best effort: refresh from the server, but still report local state
    // when the pull fails.
    engine.coordinator.perform_sync().await;
    let status = engine.coordinator.status();

    if as_json {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    let now_ms = Utc::now().timestamp_millis();
    let last_synced = status.last_synced_at.map_or_else(
        || "never".to_string(),
        |timestamp| format_relative_time(timestamp, now_ms),
    );
    println!("State:       {:?}", status.state);
    println!("Pending:     {}", status.pending_operations);
    println!(
        "Conflicts:   {}",
        if status.has_conflicts { "yes" } else { "no" }
    );
    println!("Last sync:   {last_synced}");
    if let Some(error) = &status.last_error {
        println!("Last error:  {error}");
    }

    Ok(())
}

async fn run_sync(engine: &Engine) -> Result<(), CliError> {
    engine.queue.process_queue().await;

    if !engine.coordinator.perform_sync().await {
        let status = engine.coordinator.status();
        return Err(CliError::SyncFailed(
            status
                .last_error
                .unwrap_or_else(|| "no session or no connectivity".to_string()),
        ));
    }

    let pending = engine.queue.pending_len();
    let stuck = engine.queue.stuck()?.len();
    println!("Sync completed");
    if pending > 0 {
        println!("{pending} operation(s) still pending");
    }
    if stuck > 0 {
        println!("{stuck} operation(s) stuck; inspect with `drift pending --stuck`");
    }

    Ok(())
}

async fn run_push(
    engine: &Engine,
    path: &str,
    file: &Path,
    sidecar_file: Option<&Path>,
) -> Result<(), CliError> {
    let content = std::fs::read_to_string(file)?;
    let sidecar = match sidecar_file {
        Some(sidecar_path) => std::fs::read_to_string(sidecar_path)?,
        None => "{}".to_string(),
    };
    let base_version = engine
        .db
        .with_conn(|conn| SqliteVersionRepository::new(conn).get(path))?
        .map(|record| record.version);

    let snapshot = DocumentSnapshot::new(path, &content, &sidecar);
    if engine
        .coordinator
        .upload_document(&snapshot, base_version)
        .await
    {
        let version = engine
            .coordinator
            .cached_document(path)
            .map_or(1, |document| document.version);
        println!("{path} uploaded (version {version})");
        return Ok(());
    }

    let status = engine.coordinator.status();
    if let Some(conflict_id) = status.active_conflict {
        return Err(CliError::UploadRejected(format!(
            "version conflict; inspect with `drift show {conflict_id}`"
        )));
    }
    match status.last_error {
        Some(error) => println!("{path} queued for retry ({error})"),
        None => println!("{path} queued for replay"),
    }

    Ok(())
}

#[derive(Debug, Serialize)]
struct PendingListItem {
    id: String,
    kind: String,
    path: String,
    retry_count: u32,
    last_error: Option<String>,
    created_at: i64,
    relative_time: String,
}

fn run_pending(engine: &Engine, stuck_only: bool, as_json: bool) -> Result<(), CliError> {
    let operations = if stuck_only {
        engine.queue.stuck()?
    } else {
        engine.queue.pending()?
    };

    if as_json {
        let items = operations
            .iter()
            .map(operation_to_list_item)
            .collect::<Vec<PendingListItem>>();
        println!("{}", serde_json::to_string_pretty(&items)?);
        return Ok(());
    }

    if operations.is_empty() {
        println!("No pending operations");
        return Ok(());
    }

    let now_ms = Utc::now().timestamp_millis();
    for operation in &operations {
        let short_id = short_id(&operation.id.to_string());
        let kind = operation.kind.as_str();
        let age = format_relative_time(operation.created_at, now_ms);
        let retries = if operation.retry_count > 0 {
            format!("  retries: {}", operation.retry_count)
        } else {
            String::new()
        };
        println!("{short_id:<13}  {kind:<6}  {:<40}  {age}{retries}", operation.path);
        if let Some(error) = &operation.last_error {
            println!("{:13}  last error: {error}", "");
        }
    }

    Ok(())
}

fn operation_to_list_item(operation: &PendingOperation) -> PendingListItem {
    let now_ms = Utc::now().timestamp_millis();
    PendingListItem {
        id: operation.id.to_string(),
        kind: operation.kind.as_str().to_string(),
        path: operation.path.clone(),
        retry_count: operation.retry_count,
        last_error: operation.last_error.clone(),
        created_at: operation.created_at,
        relative_time: format_relative_time(operation.created_at, now_ms),
    }
}

fn run_conflicts(engine: &Engine, as_json: bool) -> Result<(), CliError> {
    let conflicts = engine.coordinator.conflicts();

    if as_json {
        println!("{}", serde_json::to_string_pretty(&conflicts)?);
        return Ok(());
    }

    if conflicts.is_empty() {
        println!("No unresolved conflicts");
        return Ok(());
    }

    let now_ms = Utc::now().timestamp_millis();
    for conflict in &conflicts {
        println!("{}", format_conflict_line(conflict, now_ms));
    }

    Ok(())
}

fn format_conflict_line(conflict: &SyncConflict, now_ms: i64) -> String {
    format!(
        "{:<13}  {:<40}  local v{} vs remote v{}  {}",
        short_id(&conflict.id),
        conflict.path,
        conflict.local_version,
        conflict.remote_version,
        format_relative_time(conflict.created_at, now_ms),
    )
}

async fn run_show(engine: &Engine, conflict_id: &str) -> Result<(), CliError> {
    let detail = engine.client.get_conflict(conflict_id).await?;

    println!("Conflict {} on {}", detail.id, detail.path);
    println!();
    println!("--- local (version {}) ---", detail.local.version);
    println!("{}", detail.local.content);
    println!("--- remote (version {}) ---", detail.remote.version);
    println!("{}", detail.remote.content);

    Ok(())
}

async fn run_resolve(
    engine: &Engine,
    conflict_id: &str,
    resolution: ResolutionArg,
) -> Result<(), CliError> {
    if engine
        .coordinator
        .resolve_conflict(conflict_id, resolution.into())
        .await
    {
        println!("Resolved {conflict_id}");
        return Ok(());
    }

    let status = engine.coordinator.status();
    Err(CliError::ResolutionFailed(
        status
            .last_error
            .unwrap_or_else(|| "server rejected the resolution".to_string()),
    ))
}

async fn run_fetch(
    engine: &Engine,
    document_id: &str,
    output_path: Option<&Path>,
) -> Result<(), CliError> {
    let document = engine.coordinator.fetch_remote_document(document_id).await?;

    if let Some(path) = output_path {
        std::fs::write(path, &document.content)?;
        println!("{}", path.display());
    } else {
        io::stdout().write_all(document.content.as_bytes())?;
    }

    Ok(())
}

async fn run_usage(engine: &Engine, as_json: bool) -> Result<(), CliError> {
    let usage = engine.coordinator.refresh_usage().await?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&usage)?);
        return Ok(());
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let percent = (usage.used_fraction() * 100.0).round() as u64;
    println!(
        "{} document(s), {} of {} used ({percent}%), {} tier",
        usage.document_count,
        format_bytes(usage.total_size_bytes),
        format_bytes(usage.limit_bytes),
        usage.tier,
    );

    Ok(())
}

fn run_reset(engine: &Engine, confirmed: bool) -> Result<(), CliError> {
    if !confirmed {
        return Err(CliError::ResetNotConfirmed);
    }

    engine.coordinator.reset()?;
    println!("Local sync state cleared");
    Ok(())
}

fn run_completions(shell: CompletionShell, output_path: Option<&Path>) -> Result<(), CliError> {
    let mut command = Cli::command();
    let mut buffer = Vec::new();

    match shell {
        CompletionShell::Bash => generate_for_shell(shells::Bash, &mut command, &mut buffer),
        CompletionShell::Zsh => generate_for_shell(shells::Zsh, &mut command, &mut buffer),
        CompletionShell::Fish => generate_for_shell(shells::Fish, &mut command, &mut buffer),
    }

    if let Some(path) = output_path {
        std::fs::write(path, &buffer)?;
        println!("{}", path.display());
    } else {
        io::stdout().write_all(&buffer)?;
    }

    Ok(())
}

fn generate_for_shell<G: Generator>(
    generator: G,
    command: &mut clap::Command,
    buffer: &mut Vec<u8>,
) {
    generate(generator, command, "drift", buffer);
}

fn short_id(id: &str) -> String {
    id.chars().take(13).collect()
}

fn format_relative_time(timestamp_ms: i64, now_ms: i64) -> String {
    let diff = now_ms.saturating_sub(timestamp_ms);
    let minute = 60_000;
    let hour = 60 * minute;
    let day = 24 * hour;
    let week = 7 * day;

    if diff < minute {
        "just now".to_string()
    } else if diff < hour {
        format!("{}m ago", diff / minute)
    } else if diff < day {
        format!("{}h ago", diff / hour)
    } else if diff < week {
        format!("{}d ago", diff / day)
    } else {
        format!("{}w ago", diff / week)
    }
}

fn format_bytes(bytes: i64) -> String {
    const KIB: i64 = 1024;
    const MIB: i64 = 1024 * KIB;
    const GIB: i64 = 1024 * MIB;

    #[allow(clippy::cast_precision_loss)]
    match bytes {
        b if b >= GIB => format!("{:.1} GiB", b as f64 / GIB as f64),
        b if b >= MIB => format!("{:.1} MiB", b as f64 / MIB as f64),
        b if b >= KIB => format!("{:.1} KiB", b as f64 / KIB as f64),
        b => format!("{b} B"),
    }
}

fn resolve_db_path(cli_db_path: Option<PathBuf>) -> PathBuf {
    cli_db_path
        .or_else(|| env::var_os("DRIFT_DB_PATH").map(PathBuf::from))
        .unwrap_or_else(default_db_path)
}

fn default_db_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("drift")
        .join("drift.db")
}
