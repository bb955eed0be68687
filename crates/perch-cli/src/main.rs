mod writer;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use perch_client::HttpProvider;
use perch_core::bus::{ChannelSubscriber, LocalEventBus};
use perch_core::entities::{
    ReplyTarget, extract_hashtags_with_indices, extract_mentions_with_indices,
    extract_reply_screen_name, extract_urls_with_indices,
};
use perch_core::keywords::KeywordSource;
use perch_core::models::RecordKind;
use perch_core::throttle::ThrottledProvider;
use perch_core::traits::{EventBus, Provider, Subscriber};
use perch_core::{CollectionTask, PeriodicSearch, PeriodicTask, Settings, Watchdog};

use crate::writer::{CsvResultsWriter, spawn_writer};

const RESULTS_CHANNEL: &str = "results";
const POLL_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(name = "perch", version, about = "Resilient periodic search collector")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Collect search results under watchdog supervision until the budget runs out
    Collect {
        /// Search API base URL
        #[arg(short, long, env = "PERCH_API_BASE_URL")]
        base_url: String,

        /// Bearer token for the search API
        #[arg(short = 't', long, env = "PERCH_API_TOKEN")]
        api_token: Option<String>,

        /// Directory receiving the CSV result files
        #[arg(short, long)]
        output_dir: Option<PathBuf>,

        /// Keyword file, one term per line
        #[arg(short, long)]
        keywords: Option<PathBuf>,

        /// Supervision budget in seconds
        #[arg(long)]
        budget_secs: Option<u64>,
    },

    /// Print mentions, hashtags, URLs and the reply target found in a text
    Extract {
        /// Text to scan
        text: String,
    },

    /// Print where perch reads or writes a folder
    Where {
        #[arg(value_enum)]
        folder: Folder,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Folder {
    Output,
    Keywords,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("perch=info".parse()?))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut settings = Settings::from_env().context("Invalid PERCH_* configuration")?;

    match cli.command {
        Commands::Collect {
            base_url,
            api_token,
            output_dir,
            keywords,
            budget_secs,
        } => {
            settings.api_base_url = Some(base_url);
            settings.api_token = api_token.or(settings.api_token);
            if let Some(dir) = output_dir {
                settings.output_dir = dir;
            }
            if let Some(file) = keywords {
                settings.keywords_file = file;
            }
            if let Some(secs) = budget_secs.filter(|s| *s > 0) {
                settings.supervision_budget = Duration::from_secs(secs);
            }
            cmd_collect(&settings).await?;
        }
        Commands::Extract { text } => cmd_extract(&text)?,
        Commands::Where { folder } => cmd_where(&settings, folder)?,
    }

    Ok(())
}

async fn cmd_collect(settings: &Settings) -> Result<()> {
    let base_url = settings
        .api_base_url
        .as_deref()
        .context("PERCH_API_BASE_URL not set")?;
    let provider = HttpProvider::new(base_url, settings.api_token.clone())
        .map_err(|e| anyhow::anyhow!(e))
        .context("Failed to create search API client")?;
    let provider = ThrottledProvider::new(provider, settings.throttle.clone());

    let keywords = KeywordSource::from_file(&settings.keywords_file)
        .map_err(|e| anyhow::anyhow!(e))
        .with_context(|| format!("Failed to read keywords from {}", settings.keywords_file.display()))?;
    tracing::info!(
        keywords = keywords.len(),
        file = %settings.keywords_file.display(),
        "Keywords loaded"
    );

    let interrupt = CancellationToken::new();
    let on_signal = interrupt.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("Interrupted, stopping collection");
                on_signal.cancel();
            }
            Err(e) => tracing::error!(error = %e, "Failed to listen for interrupt"),
        }
    });

    let writer = run_collection(provider, keywords, settings, interrupt, POLL_INTERVAL).await?;

    tracing::info!(
        files = writer.files_written(),
        output = %writer.output_dir().display(),
        "Collection finished"
    );
    Ok(())
}

/// Collects under watchdog supervision until the budget runs out or
/// `interrupt` fires, then stops everything in order and returns the
/// flushed writer.
///
/// Each rotated results file ends the current task run; the watchdog then
/// either starts a fresh instance or, past its deadline, stops watching.
async fn run_collection<P: Provider + 'static>(
    provider: P,
    keywords: KeywordSource,
    settings: &Settings,
    interrupt: CancellationToken,
    poll_every: Duration,
) -> Result<CsvResultsWriter> {
    // 1. Results writer on the "results" channel
    let (subscriber, rx) = ChannelSubscriber::new();
    let writer = CsvResultsWriter::new(&settings.output_dir, settings.records_per_file)?;
    let writer_shutdown = CancellationToken::new();
    let (rotations, mut rotated) = mpsc::unbounded_channel();
    let writer_handle = spawn_writer(writer, rx, writer_shutdown.clone(), rotations);

    // 2. Supervised collection task
    let bus: Arc<dyn EventBus> = Arc::new(LocalEventBus::new());
    let search = PeriodicSearch::new(provider, settings);
    let task = CollectionTask::new(search, keywords, settings);
    let mut periodic = PeriodicTask::new(task, settings.task_schedule()?, bus);
    periodic
        .subscribe(
            RESULTS_CHANNEL,
            RecordKind::Tweet,
            [Arc::new(subscriber) as Arc<dyn Subscriber>],
        )
        .map_err(|e| anyhow::anyhow!(e))?;

    let watchdog = Watchdog::with_schedule(
        periodic,
        settings.watchdog_schedule()?,
        settings.supervision_budget,
    );
    watchdog
        .start_watching()
        .await
        .map_err(|e| anyhow::anyhow!(e))
        .context("Failed to start watchdog")?;

    tracing::info!(
        budget_secs = settings.supervision_budget.as_secs(),
        output = %settings.output_dir.display(),
        "Collection started"
    );

    // 3. Block until supervision ends
    let mut poll = tokio::time::interval(poll_every);
    loop {
        tokio::select! {
            _ = poll.tick() => {
                if watchdog.has_stopped_watching() {
                    break;
                }
            }
            Some(path) = rotated.recv() => {
                tracing::debug!(path = %path.display(), "Results file full, ending current run");
                watchdog.recycle().await;
            }
            () = interrupt.cancelled() => break,
        }
    }

    // 4. Orderly stop
    watchdog.shutdown().await;
    drop(watchdog);
    writer_shutdown.cancel();
    let writer = writer_handle
        .await
        .context("Results writer panicked")??;
    Ok(writer)
}

fn cmd_extract(text: &str) -> Result<()> {
    let reply_to = match extract_reply_screen_name(text) {
        ReplyTarget::Reply(name) => Some(name),
        ReplyTarget::EmptyInput | ReplyTarget::NotAReply => None,
    };
    let report = serde_json::json!({
        "mentions": extract_mentions_with_indices(text),
        "hashtags": extract_hashtags_with_indices(text),
        "urls": extract_urls_with_indices(text),
        "reply_to": reply_to,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn cmd_where(settings: &Settings, folder: Folder) -> Result<()> {
    let path = match folder {
        Folder::Output => settings.output_dir.clone(),
        Folder::Keywords => settings
            .keywords_file
            .parent()
            .map(PathBuf::from)
            .unwrap_or_default(),
    };
    let resolved = std::path::absolute(&path)
        .with_context(|| format!("Failed to resolve {}", path.display()))?;
    println!("{}", resolved.display());
    Ok(())
}
