//! Feedpipe - feed import tool

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use feedpipe_common::logging::{init_logging, LogConfig, LogLevel};
use feedpipe_ingest::db::{self, DbConfig, PgEntityStorage, PgFeedLock, PgFeedStore, PgQueue};
use feedpipe_ingest::{
    Actor, BatchStrategy, DirectStrategy, ExecutionStrategy, FeedImporter, FeedStore,
    FeedTypeRegistry, ImportContext, ImportScheduler, IngestConfig, LoggingListener, NewFeed,
    QueueStrategy, StrategyKind,
};
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

/// Pause between worker passes that found nothing to do
const IDLE_POLL: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(name = "feedpipe")]
#[command(author, version, about = "Staged feed import pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Act as this user instead of the system
    #[arg(long, global = true, env = "FEEDPIPE_USER")]
    user: Option<String>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Apply database migrations
    Migrate,

    /// Manage feeds
    Feed {
        #[command(subcommand)]
        action: FeedCommand,
    },

    /// Start an import
    Import {
        feed_id: Uuid,

        /// direct, batch or queue
        #[arg(short, long, default_value = "direct")]
        strategy: StrategyKind,
    },

    /// Drive an interactive batch import
    Batch {
        #[command(subcommand)]
        action: BatchCommand,
    },

    /// Drain import queues
    Worker {
        /// Make one pass over every queue and exit
        #[arg(long)]
        once: bool,

        /// PROCESS operations per queue per pass
        #[arg(long)]
        max_items: Option<u64>,

        /// Do not start due imports
        #[arg(long)]
        no_scheduler: bool,
    },

    /// Cancel a running import and release its lock
    Unlock { feed_id: Uuid },
}

#[derive(Subcommand, Debug)]
enum FeedCommand {
    /// Register a feed
    Create {
        #[arg(long = "type")]
        feed_type: String,

        #[arg(long)]
        title: String,

        /// File path, directory or URL
        #[arg(long)]
        source: String,

        #[arg(long)]
        owner: Option<String>,

        /// Exclude the feed from scheduled imports
        #[arg(long)]
        inactive: bool,
    },

    /// List feeds
    List,

    /// Show a feed with its import state
    Show { feed_id: Uuid },
}

#[derive(Subcommand, Debug)]
enum BatchCommand {
    /// Run the next operations of the import
    Step { feed_id: Uuid },

    /// Report progress without running anything
    Status { feed_id: Uuid },
}

struct App {
    config: IngestConfig,
    importer: Arc<FeedImporter>,
    queue: Arc<PgQueue>,
}

impl App {
    async fn connect(config: IngestConfig, pool: Arc<PgPool>) -> Result<Self> {
        let types = FeedTypeRegistry::load(&config.feed_types_path).with_context(|| {
            format!("Failed to load feed types from {}", config.feed_types_path.display())
        })?;
        info!(feed_types = ?types.ids(), "Feed types loaded");

        let importer = FeedImporter::new(
            Arc::new(PgFeedStore::new(pool.clone())),
            Arc::new(PgFeedLock::new(pool.clone())),
            Arc::new(PgEntityStorage::new(pool.clone())),
            Arc::new(types),
        )
        .with_lock_timeout(config.lock_timeout())
        .with_listener(Arc::new(LoggingListener));

        Ok(Self {
            importer: Arc::new(importer),
            queue: Arc::new(PgQueue::new(pool)),
            config,
        })
    }

    fn direct(&self) -> DirectStrategy {
        DirectStrategy::new(self.importer.clone())
    }

    fn batch(&self) -> BatchStrategy {
        BatchStrategy::new(
            self.importer.clone(),
            self.queue.clone(),
            self.config.ops_per_request,
            self.config.queue_lease(),
        )
    }

    fn queued(&self) -> QueueStrategy {
        QueueStrategy::new(
            self.importer.clone(),
            self.queue.clone(),
            self.config.worker_settings(),
        )
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut log_config = LogConfig::builder()
        .level(LogLevel::Info)
        .log_file_prefix("feedpipe")
        .build()
        .with_env_overrides()?;
    if cli.verbose {
        log_config.level = LogLevel::Debug;
    }
    let _guard = init_logging(&log_config)?;

    let config = IngestConfig::from_env()?;
    let pool = Arc::new(db::create_pool(&DbConfig::from_env()?).await?);

    let ctx = match cli.user.as_deref() {
        Some(user) => ImportContext::new(Actor::user(user)),
        None => ImportContext::system(),
    };

    if let Command::Migrate = cli.command {
        db::run_migrations(&pool).await?;
        return Ok(());
    }

    let app = App::connect(config, pool).await?;

    match cli.command {
        Command::Migrate => {},
        Command::Feed { action } => run_feed_command(&app, action).await?,
        Command::Import { feed_id, strategy } => match strategy {
            StrategyKind::Direct => {
                let summary = app.direct().start_import(&ctx, feed_id).await?;
                println!("{}", serde_json::to_string_pretty(&summary)?);
            },
            StrategyKind::Batch => {
                let progress = app.batch().start_batch_import(&ctx, feed_id).await?;
                println!("{}", serde_json::to_string_pretty(&progress)?);
            },
            StrategyKind::Queue => {
                app.queued().start_queued_import(&ctx, feed_id).await?;
                println!("Import of {} queued", feed_id);
            },
        },
        Command::Batch { action } => {
            let batch = app.batch();
            let progress = match action {
                BatchCommand::Step { feed_id } => batch.step(&ctx, feed_id).await?,
                BatchCommand::Status { feed_id } => batch.progress(feed_id).await?,
            };
            println!("{}", serde_json::to_string_pretty(&progress)?);
        },
        Command::Worker {
            once,
            max_items,
            no_scheduler,
        } => run_worker(&app, &ctx, once, max_items, no_scheduler).await?,
        Command::Unlock { feed_id } => {
            // Purging by feed covers batch and worker queues alike
            app.queued().cancel(&ctx, feed_id).await?;
            println!("Feed {} unlocked", feed_id);
        },
    }

    Ok(())
}

async fn run_feed_command(app: &App, action: FeedCommand) -> Result<()> {
    let feeds = app.importer.feeds();
    match action {
        FeedCommand::Create {
            feed_type,
            title,
            source,
            owner,
            inactive,
        } => {
            let feed_type = feed_type.to_lowercase();
            app.importer.types().get(&feed_type)?;
            let feed = feeds
                .create(NewFeed {
                    feed_type,
                    title,
                    source,
                    owner,
                    active: !inactive,
                })
                .await?;
            println!("{}", feed.id);
        },
        FeedCommand::List => {
            for feed in feeds.list().await? {
                let status = if feed.lock.is_some() {
                    format!("importing ({:.0}%)", feed.import_progress() * 100.0)
                } else if feed.queued_at.is_some() {
                    "queued".to_string()
                } else {
                    "idle".to_string()
                };
                println!(
                    "{}  {:<12} {:<24} items={:<6} {}",
                    feed.id, feed.feed_type, feed.title, feed.item_count, status
                );
            }
        },
        FeedCommand::Show { feed_id } => {
            let feed = app.importer.load_feed(feed_id).await?;
            println!("{}", serde_json::to_string_pretty(&feed)?);
        },
    }
    Ok(())
}

async fn run_worker(
    app: &App,
    ctx: &ImportContext,
    once: bool,
    max_items: Option<u64>,
    no_scheduler: bool,
) -> Result<()> {
    let strategy = Arc::new(app.queued());
    let max_items = max_items.unwrap_or(app.config.worker_max_items);
    let queues: Vec<String> = app
        .importer
        .types()
        .ids()
        .iter()
        .map(|id| QueueStrategy::queue_name(id))
        .collect();

    let scheduler = Arc::new(ImportScheduler::new(
        strategy.clone(),
        app.config.scheduler_interval(),
        app.config.stale_queued(),
    ));

    if once {
        if !no_scheduler {
            scheduler.run_once(ctx).await?;
        }
        for queue in &queues {
            let report = strategy.work(ctx, queue, max_items).await?;
            println!("{}: {}", queue, serde_json::to_string(&report)?);
        }
        return Ok(());
    }

    let scheduler_handle = (!no_scheduler).then(|| scheduler.clone().spawn(ctx.clone()));
    info!(queues = ?queues, max_items, "Worker started");

    loop {
        let mut executed = 0;
        for queue in &queues {
            executed += strategy.work(ctx, queue, max_items).await?.executed;
        }
        if executed > 0 {
            continue;
        }

        tokio::select! {
            _ = tokio::time::sleep(IDLE_POLL) => {},
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            },
        }
    }

    if let Some(handle) = scheduler_handle {
        handle.abort();
    }
    Ok(())
}
