// src/main.rs

use anyhow::{bail, Context, Result};
use blob_transfer::prelude::*;
use clap::{Parser, Subcommand, ValueEnum};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing_subscriber::EnvFilter;

/// Resumable, chunked blob uploads and downloads.
#[derive(Debug, Parser)]
#[command(name = "blob-transfer", version)]
struct Cli {
    /// Transfer database
    #[arg(long, default_value = "transfers.db")]
    db: PathBuf,

    /// Service root URL
    #[arg(long, default_value = "http://127.0.0.1:10000/devstoreaccount1")]
    endpoint: String,

    /// JSON manager configuration
    #[arg(long)]
    config: Option<PathBuf>,

    /// Concurrent chunk executions
    #[arg(long)]
    concurrency: Option<usize>,

    /// Bandwidth cap in bytes per second
    #[arg(long)]
    limit: Option<u64>,

    /// Extra request header, `name:value`; repeatable
    #[arg(long = "header", value_name = "NAME:VALUE")]
    headers: Vec<String>,

    /// Shared access signature appended to every request
    #[arg(long)]
    sas: Option<String>,

    /// Per-request timeout in seconds
    #[arg(long, default_value_t = 60)]
    timeout: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Download `container/blob` into a local file
    Download {
        remote: String,
        destination: PathBuf,
        /// First byte to fetch
        #[arg(long, default_value_t = 0)]
        start: u64,
        /// Exclusive end of the range; defaults to the end of the object
        #[arg(long)]
        end: Option<u64>,
        /// Expected SHA-256 of the downloaded bytes
        #[arg(long)]
        sha256: Option<String>,
    },
    /// Upload a local file as `container/blob`
    Upload { source: PathBuf, remote: String },
    /// List known transfers
    List {
        /// Remote path prefix
        #[arg(long)]
        container: Option<String>,
        #[arg(long, value_enum)]
        state: Option<StateArg>,
    },
    Pause { id: TransferId },
    Resume { id: TransferId },
    Cancel { id: TransferId },
    /// Cancel a transfer and forget it
    Remove { id: TransferId },
    /// Run unfinished transfers until they settle
    Run,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum StateArg {
    Pending,
    InProgress,
    Paused,
    Complete,
    Failed,
    Cancelled,
}

impl From<StateArg> for TransferState {
    fn from(state: StateArg) -> Self {
        match state {
            StateArg::Pending => TransferState::Pending,
            StateArg::InProgress => TransferState::InProgress,
            StateArg::Paused => TransferState::Paused,
            StateArg::Complete => TransferState::Complete,
            StateArg::Failed => TransferState::Failed,
            StateArg::Cancelled => TransferState::Cancelled,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli).await?;
    let executor = build_executor(&cli, &config)?;
    let store = SqliteTransferStore::open(&cli.db)
        .await
        .with_context(|| format!("opening {}", cli.db.display()))?;
    let manager = TransferManager::new(Arc::new(store), executor, config).await?;

    match cli.command {
        Command::Download {
            remote,
            destination,
            start,
            end,
            sha256,
        } => {
            let (container, blob) = split_remote(&remote)?;
            let mut request =
                TransferRequest::download(container, blob, destination).with_range(start, end);
            if let Some(digest) = sha256 {
                request = request.with_sha256(digest);
            }
            let events = manager.subscribe();
            let id = manager.add(request).await?;
            println!("{id}");
            drive(&manager, events, HashSet::from([id])).await
        }
        Command::Upload { source, remote } => {
            let (container, blob) = split_remote(&remote)?;
            let events = manager.subscribe();
            let id = manager
                .add(TransferRequest::upload(source, container, blob))
                .await?;
            println!("{id}");
            drive(&manager, events, HashSet::from([id])).await
        }
        Command::List { container, state } => {
            let mut filter = TransferFilter::new();
            if let Some(container) = container {
                filter = filter.container(container);
            }
            if let Some(state) = state {
                filter = filter.state(state.into());
            }
            for record in manager.transfers().await.filter_where(&filter).all() {
                print_record(record);
            }
            Ok(())
        }
        Command::Pause { id } => Ok(manager.pause(&id).await?),
        Command::Resume { id } => {
            let events = manager.subscribe();
            manager.resume(&id).await?;
            drive(&manager, events, HashSet::from([id])).await
        }
        Command::Cancel { id } => Ok(manager.cancel(&id).await?),
        Command::Remove { id } => Ok(manager.remove(&id).await?),
        Command::Run => {
            let events = manager.subscribe();
            let active: HashSet<TransferId> = manager
                .transfers()
                .await
                .filter(|t| matches!(t.state, TransferState::Pending | TransferState::InProgress))
                .ids()
                .into_iter()
                .collect();
            if active.is_empty() {
                println!("nothing to run");
                return Ok(());
            }
            drive(&manager, events, active).await
        }
    }
}

async fn load_config(cli: &Cli) -> Result<ManagerConfig> {
    let mut config = match &cli.config {
        Some(path) => ManagerConfig::from_json_file(path).await?,
        None => ManagerConfig::default(),
    };
    if let Some(slots) = cli.concurrency {
        config = config.with_max_concurrent_chunks(slots);
    }
    if let Some(rate) = cli.limit {
        config = config.with_max_bytes_per_sec(rate);
    }
    Ok(config)
}

fn build_executor(cli: &Cli, config: &ManagerConfig) -> Result<Arc<dyn ChunkExecutor>> {
    let mut pipeline = ReqwestPipeline::new(&cli.endpoint, Duration::from_secs(cli.timeout))?;
    for header in &cli.headers {
        let (name, value) = header
            .split_once(':')
            .with_context(|| format!("header {header:?} is not `name:value`"))?;
        pipeline = pipeline.with_header(name.trim(), value.trim());
    }
    if let Some(sas) = &cli.sas {
        pipeline = pipeline.with_query_string(sas);
    }

    let mut executor = HttpChunkExecutor::new(pipeline);
    if let Some(rate) = config.max_bytes_per_sec {
        executor = executor.with_limiter(SpeedLimiter::new(rate));
    }
    Ok(Arc::new(executor))
}

fn split_remote(remote: &str) -> Result<(&str, &str)> {
    match remote.split_once('/') {
        Some((container, blob)) if !container.is_empty() && !blob.is_empty() => Ok((container, blob)),
        _ => bail!("remote path {remote:?} is not `container/blob`"),
    }
}

/// Dispatch chunks until every transfer in `pending` has settled or Ctrl-C.
async fn drive(
    manager: &TransferManager,
    mut events: UnboundedReceiver<TransferEvent>,
    mut pending: HashSet<TransferId>,
) -> Result<()> {
    let dispatcher = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.run().await })
    };

    let mut failed = 0usize;
    while !pending.is_empty() {
        let event = tokio::select! {
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                println!("interrupted; unfinished chunks resume on the next run");
                break;
            }
        };
        if !pending.contains(&event.id()) {
            continue;
        }
        match &event {
            TransferEvent::Progress { id, state, progress } => {
                let percent = progress.fraction().map_or_else(
                    || format!("{} bytes", progress.bytes_transferred),
                    |f| format!("{:.1}%", f * 100.0),
                );
                println!("{id} {state} {percent}");
                if *state == TransferState::Paused || state.is_terminal() {
                    pending.remove(id);
                }
            }
            TransferEvent::Completed { id } => {
                println!("{id} complete");
                pending.remove(id);
            }
            TransferEvent::Failed { id, error } => {
                println!("{id} failed: {error}");
                failed += 1;
                pending.remove(id);
            }
        }
    }

    manager.shutdown();
    dispatcher.await??;
    if failed > 0 {
        bail!("{failed} transfer(s) failed");
    }
    Ok(())
}

fn print_record(record: &TransferRecord) {
    let total = record
        .total_bytes()
        .map_or_else(|| "?".to_string(), |t| t.to_string());
    println!(
        "{}  {:<8} {:<11} {:>12}/{:<12} {} -> {}",
        record.id,
        format!("{:?}", record.kind).to_lowercase(),
        record.state.as_str(),
        record.bytes_transferred,
        total,
        record.source,
        record.destination,
    );
}
