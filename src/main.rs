use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueHint};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use feedpoll::feed::{validate_request_url, FeedStore, NewFeed, RefreshReport};
use feedpoll::{Config, Database, FeedpollError, HttpFetcher, Puller, Result, SqliteFeedStore};

/// Feed poll scheduler and fetch-policy engine.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(
        short,
        long,
        env = "FEEDPOLL_CONFIG",
        default_value = "config.toml",
        value_hint(ValueHint::FilePath)
    )]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Poll feeds in the background until interrupted.
    Run,
    /// Refresh one feed now, ignoring its schedule.
    Refresh {
        /// Feed ID.
        id: i64,
    },
    /// Refresh every feed, suspended ones included.
    RefreshAll,
    /// Subscribe to a feed.
    Add {
        /// Feed URL.
        url: String,
        /// Upstream proxy for this feed.
        #[arg(long)]
        proxy: Option<String>,
        /// Website the feed belongs to.
        #[arg(long)]
        site_url: Option<String>,
    },
    /// Unsubscribe from a feed and delete its items.
    Remove {
        /// Feed ID.
        id: i64,
    },
    /// Stop polling a feed.
    Suspend {
        /// Feed ID.
        id: i64,
    },
    /// Resume polling a suspended feed.
    Resume {
        /// Feed ID.
        id: i64,
    },
    /// Show the fetch state of every feed.
    Status,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Load configuration
    let config = match Config::load_with_env(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load {}: {e}", cli.config.display());
            eprintln!("Using default configuration.");
            let mut config = Config::default();
            config.apply_env_overrides();
            config
        }
    };

    if let Err(e) = config.validate() {
        eprintln!("{e}");
        return ExitCode::FAILURE;
    }

    // Initialize logging
    if matches!(cli.command, Command::Run) {
        if let Err(e) = feedpoll::logging::init(&config.logging) {
            eprintln!("Failed to initialize logging: {e}");
            // Fall back to console-only logging
            feedpoll::logging::init_console_only(&config.logging.level);
        }
    } else {
        feedpoll::logging::init_console_only(&config.logging.level);
    }

    match execute(cli.command, config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

async fn execute(command: Command, config: Config) -> Result<()> {
    let db = Database::open(&config.database.path).await?;
    let sqlite = Arc::new(SqliteFeedStore::new(db.pool().clone()));
    let store: Arc<dyn FeedStore> = sqlite.clone();
    let puller = Puller::new(
        Arc::clone(&store),
        HttpFetcher::shared(&config.poller),
        config.poller.clone(),
    );

    match command {
        Command::Run => run(puller).await,
        Command::Refresh { id } => {
            let summary = puller.refresh_feed(id).await?;
            if summary.not_modified {
                println!("Feed {id}: not modified");
            } else {
                println!("Feed {id}: {} new item(s)", summary.new_items);
            }
            Ok(())
        }
        Command::RefreshAll => {
            let report = puller.refresh_all().await?;
            print_report(&report);
            Ok(())
        }
        Command::Add {
            url,
            proxy,
            site_url,
        } => {
            validate_request_url(&url, config.poller.allow_private_network).await?;
            let mut feed = NewFeed::new(url);
            if let Some(proxy) = proxy {
                url::Url::parse(&proxy)
                    .map_err(|e| FeedpollError::InvalidUrl(format!("proxy {proxy}: {e}")))?;
                feed = feed.with_proxy_url(proxy);
            }
            if let Some(site_url) = site_url {
                feed = feed.with_site_url(site_url);
            }
            let state = store.register_feed(&feed).await?;
            println!("Added feed {}: {}", state.id, state.url);
            Ok(())
        }
        Command::Remove { id } => {
            require(store.remove_feed(id).await?, id)?;
            println!("Removed feed {id}");
            Ok(())
        }
        Command::Suspend { id } => {
            require(store.set_suspended(id, true).await?, id)?;
            println!("Suspended feed {id}");
            Ok(())
        }
        Command::Resume { id } => {
            require(store.set_suspended(id, false).await?, id)?;
            println!("Resumed feed {id}");
            Ok(())
        }
        Command::Status => print_status(&sqlite).await,
    }
}

async fn run(puller: Puller) -> Result<()> {
    info!("feedpoll {}", env!("CARGO_PKG_VERSION"));

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();

        async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!("Shutdown requested");
                    cancel.cancel();
                }
                Err(e) => error!("Failed to listen for Ctrl-C: {e}"),
            }
        }
    });

    puller.start(cancel).await
}

fn require(found: bool, id: i64) -> Result<()> {
    if found {
        Ok(())
    } else {
        Err(FeedpollError::NotFound(format!("feed {id}")))
    }
}

fn print_report(report: &RefreshReport) {
    println!("Refreshed {} feed(s)", report.refreshed);
    for failure in &report.failures {
        println!("  feed {}: {}", failure.feed_id, failure.error);
    }
}

async fn print_status(store: &SqliteFeedStore) -> Result<()> {
    let states = store.list_feed_runtime_states().await?;
    if states.is_empty() {
        println!("No feeds registered");
        return Ok(());
    }

    for state in states {
        let status = if state.suspended {
            "suspended".to_string()
        } else if state.consecutive_failures > 0 {
            format!("failing ({})", state.consecutive_failures)
        } else {
            "ok".to_string()
        };
        let next_check = state
            .next_check_at
            .map(|at| at.to_rfc3339())
            .unwrap_or_else(|| "-".to_string());
        let items = store.count_items(state.id).await?;

        println!(
            "{:>4}  {:<12} {:>6} items  next {}  {}",
            state.id, status, items, next_check, state.url
        );
        if let Some(latest) = store.list_items(state.id, 1).await?.first() {
            println!("      latest: {}", latest.title);
        }
        if let Some(error) = &state.last_error {
            println!("      last error: {error}");
        }
    }
    Ok(())
}
