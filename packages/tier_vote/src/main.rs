use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

use eventsub_client::{HelixClient, SubscriptionMultiplexer, WsConnector};
use tier_vote::config::{DataDir, FileConfig, RuntimeConfig, load_config};
use tier_vote::db::Database;
use tier_vote::{
    ChannelListener, Editor, EditorContext, IngestMetrics, ListenOutcome, StateCache, StateStore,
    TierListRepository, TierListTemplate, store_loader,
};

#[derive(Parser)]
#[command(name = "tier-vote")]
#[command(about = "Run tier list votes from Twitch chat")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Custom data directory (defaults to ~/.tier_vote)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Listen to channels and record chat votes until interrupted
    Serve(ServeArgs),

    /// Print a channel's stored tier list as JSON
    Show(ShowArgs),

    /// List channels with stored tier lists
    Channels,

    /// Replace a channel's tier list with a JSON template
    Apply(ApplyArgs),
}

#[derive(Parser)]
struct ServeArgs {
    /// Channel login or id to listen to (repeatable)
    #[arg(short, long = "channel", required = true)]
    channels: Vec<String>,
}

#[derive(Parser)]
struct ShowArgs {
    /// Broadcaster id
    channel_id: String,
}

#[derive(Parser)]
struct ApplyArgs {
    /// Broadcaster id
    channel_id: String,

    /// Path to a JSON file with `tiers` and `items`
    template: PathBuf,

    /// Open voting after applying
    #[arg(long)]
    voting: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_directive = if cli.debug {
        "tier_vote=debug,eventsub_client=debug,info"
    } else {
        "tier_vote=info,eventsub_client=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(env_filter)
        .init();

    let data_dir = DataDir::new(cli.data_dir)?;
    let file_config: FileConfig = load_config(&data_dir.root)
        .extract()
        .context("Failed to load configuration")?;
    let runtime = RuntimeConfig::from_file(&file_config);

    let db = Database::new(&data_dir).await?;
    let repository = TierListRepository::new(db.pool.clone());

    match cli.command {
        Commands::Serve(args) => serve(args, runtime, repository).await,
        Commands::Show(args) => show(&repository, &args.channel_id).await,
        Commands::Channels => {
            for channel_id in repository.list_channels().await? {
                println!("{channel_id}");
            }
            Ok(())
        }
        Commands::Apply(args) => apply(args, runtime, repository).await,
    }
}

async fn serve(args: ServeArgs, runtime: RuntimeConfig, repository: TierListRepository) -> Result<()> {
    info!("Starting tier vote ingest for {} channel(s)", args.channels.len());

    let metrics = Arc::new(IngestMetrics::new());
    let helix = Arc::new(HelixClient::new(runtime.helix.clone()).context("Invalid Twitch credentials")?);
    let multiplexer = Arc::new(SubscriptionMultiplexer::new(
        helix.clone(),
        helix,
        Arc::new(WsConnector),
        runtime.multiplexer.clone(),
    ));
    let cache = Arc::new(StateCache::new(
        runtime.cache.capacity,
        store_loader(EditorContext {
            store: Arc::new(repository),
            metrics: metrics.clone(),
            save_delay: runtime.cache.save_delay,
        }),
        metrics.clone(),
    ));
    let listener = ChannelListener::new(
        multiplexer.clone(),
        cache.clone(),
        metrics.clone(),
        runtime.listener.clone(),
    );

    let refresh = keep_listening(&listener, &args.channels, runtime.listener.check_interval);
    run_until_shutdown(refresh, tokio::signal::ctrl_c()).await?;
    info!("Received shutdown signal, cleaning up...");

    multiplexer.shutdown();

    info!("Flushing tier lists...");
    if let Err(e) = cache.flush_all().await {
        warn!("Failed to flush tier lists during shutdown: {}", e);
    }

    let snapshot = serde_json::to_string(&metrics.snapshot())?;
    info!(metrics = %snapshot, "Shutdown complete");
    Ok(())
}

/// Drive `work` until `shutdown` resolves, abandoning it mid-await if needed.
async fn run_until_shutdown(
    work: impl Future<Output = ()>,
    shutdown: impl Future<Output = std::io::Result<()>>,
) -> Result<()> {
    tokio::select! {
        result = shutdown => result.context("Failed to install Ctrl+C handler"),
        _ = work => Ok(()),
    }
}

/// Re-listening doubles as the heartbeat that keeps each channel subscribed.
async fn keep_listening(listener: &ChannelListener, channels: &[String], every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        refresh_channels(listener, channels).await;
    }
}

async fn refresh_channels(listener: &ChannelListener, channels: &[String]) {
    for channel in channels {
        match listener.listen(channel).await {
            Ok(ListenOutcome::Listening) => {}
            Ok(ListenOutcome::InvalidChannel) => warn!("No such channel: {}", channel),
            Ok(ListenOutcome::Full) => {
                warn!("Subscription limit reached, cannot listen to {}", channel)
            }
            Err(e) => warn!("Failed to listen to {}: {:#}", channel, e),
        }
    }
}

async fn show(repository: &TierListRepository, channel_id: &str) -> Result<()> {
    let state = repository
        .get_state(channel_id)
        .await?
        .with_context(|| format!("No tier list stored for channel {channel_id}"))?;
    println!("{}", serde_json::to_string_pretty(&state)?);
    Ok(())
}

async fn apply(args: ApplyArgs, runtime: RuntimeConfig, repository: TierListRepository) -> Result<()> {
    let raw = std::fs::read_to_string(&args.template)
        .with_context(|| format!("Failed to read {}", args.template.display()))?;
    let template: TierListTemplate = serde_json::from_str(&raw)
        .with_context(|| format!("Invalid template in {}", args.template.display()))?;
    let template = template.validate()?;

    let editor = Editor::load(
        &args.channel_id,
        EditorContext {
            store: Arc::new(repository),
            metrics: Arc::new(IngestMetrics::new()),
            save_delay: runtime.cache.save_delay,
        },
    )
    .await?;
    editor.overwrite(template);
    editor.set_voting(args.voting);
    editor.save().await?;

    println!(
        "Applied template to {}: {} tiers, {} items",
        args.channel_id,
        editor.snapshot().tiers.len(),
        editor.snapshot().items.len()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn shutdown_interrupts_work_stuck_in_an_await() {
        let stuck = std::future::pending::<()>();
        let shutdown = async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            Ok(())
        };
        run_until_shutdown(stuck, shutdown).await.unwrap();
    }

    #[tokio::test]
    async fn failed_signal_handler_is_an_error() {
        let shutdown = async { Err(std::io::Error::other("no signals")) };
        let err = run_until_shutdown(std::future::pending(), shutdown)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Ctrl+C"));
    }
}
