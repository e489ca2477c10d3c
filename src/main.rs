mod aggregation;
mod catalog;
mod config;
mod enrichment;
mod error;
mod event_store;
mod genre_index;
mod preparation;
mod protocol;
mod report;
mod selection;
mod time_bucketer;

use std::collections::HashMap;
use std::io::BufRead;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use log::{debug, error, info, warn};
use tokio::sync::broadcast::{self, error::RecvError};

use crate::catalog::SpotifyCatalogApi;
use crate::config::{log_level_filter, sanitize_config, Config};
use crate::enrichment::{
    ensure_genre_index, CancellationToken, EnrichmentClient, IndexSource, RateBudget,
    RetryPolicy, ThreadSleeper,
};
use crate::error::EnrichmentError;
use crate::event_store::{EventStore, UserRecord};
use crate::genre_index::{ArtifactCache, GenreIndex};
use crate::protocol::{Message, ViewMessage};
use crate::report::DashboardReport;
use crate::selection::{spawn_linked_views_reactor, LinkedViewsReactor, SelectionPublisher};
use crate::time_bucketer::PeriodFilter;

const CONFIG_DIR_NAME: &str = "tunelens";
const CONFIG_FILE_NAME: &str = "config.toml";

#[derive(Debug, Parser)]
#[command(name = "tunelens", version, about = "Listening-history dashboards with catalog genre enrichment")]
struct Cli {
    /// Config file (defaults to the platform config directory).
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Raise log verbosity (-v debug, -vv trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Build the combined event log from per-user export folders.
    Prepare {
        #[arg(long)]
        data_dir: Option<PathBuf>,
        #[arg(long)]
        index: Option<PathBuf>,
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Fetch artist genres for every user without a genre artifact.
    Enrich {
        #[arg(long)]
        user: Option<String>,
        /// Refetch even when an artifact exists.
        #[arg(long)]
        force: bool,
    },
    /// Write dashboard reports.
    Report {
        #[arg(long)]
        user: Option<String>,
        /// `year`, a month name like `Jan`, or `YYYY-MM`.
        #[arg(long)]
        month: Option<String>,
    },
    /// Combine per-user genre artifacts into one file.
    MergeGenres {
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Enrich, then write reports with whatever genre data is available.
    Run {
        #[arg(long)]
        user: Option<String>,
        #[arg(long)]
        month: Option<String>,
    },
    /// Select periods from stdin (one per line) and print the linked views as JSON.
    Explore {
        #[arg(long)]
        user: String,
    },
}

fn default_config_path() -> anyhow::Result<PathBuf> {
    let config_dir = dirs::config_dir().context("no platform config directory available")?;
    Ok(config_dir.join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME))
}

/// Reads the config, writing the defaults first when the file does not exist.
/// Returns whether the file was created.
fn load_or_create_config(config_file: &Path) -> anyhow::Result<(Config, bool)> {
    let mut created = false;
    if !config_file.exists() {
        if let Some(parent) = config_file.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let default_config =
            toml::to_string(&Config::default()).context("failed to serialize default config")?;
        std::fs::write(config_file, default_config)
            .with_context(|| format!("failed to write {}", config_file.display()))?;
        created = true;
    }
    let config_content = std::fs::read_to_string(config_file)
        .with_context(|| format!("failed to read {}", config_file.display()))?;
    let config = toml::from_str::<Config>(&config_content)
        .with_context(|| format!("failed to parse {}", config_file.display()))?;
    Ok((sanitize_config(config), created))
}

fn init_logging(config: &Config, verbose: u8) {
    let level = match verbose {
        0 => log_level_filter(&config.logging.level),
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    let mut clog = colog::default_builder();
    clog.filter(None, level);
    clog.init();

    std::panic::set_hook(Box::new(|panic_info| {
        let current_thread = std::thread::current();
        let thread_name = current_thread.name().unwrap_or("unnamed");
        log::error!("panic in thread '{}': {}", thread_name, panic_info);
    }));
}

fn load_event_store(config: &Config) -> anyhow::Result<EventStore> {
    let path = Path::new(&config.paths.event_log);
    let store = EventStore::load_from_path(path)
        .with_context(|| format!("failed to load event log {}", path.display()))?;
    info!("Loaded {} users from {}", store.users().len(), path.display());
    Ok(store)
}

fn selected_users<'a>(store: &'a EventStore, user: Option<&str>) -> anyhow::Result<Vec<&'a UserRecord>> {
    match user {
        Some(user) => {
            let record = store
                .find_user(user)
                .with_context(|| format!("user '{user}' not found in event log"))?;
            Ok(vec![record])
        }
        None => Ok(store.users().iter().collect()),
    }
}

fn parse_period(month: Option<&str>) -> anyhow::Result<PeriodFilter> {
    match month {
        Some(month) => Ok(month.parse::<PeriodFilter>()?),
        None => Ok(PeriodFilter::Year),
    }
}

fn run_prepare(
    config: &Config,
    data_dir: Option<PathBuf>,
    index: Option<PathBuf>,
    output: Option<PathBuf>,
) -> anyhow::Result<()> {
    let data_dir = data_dir.unwrap_or_else(|| PathBuf::from(&config.paths.data_dir));
    let index = index.unwrap_or_else(|| PathBuf::from(&config.paths.index_file));
    let output = output.unwrap_or_else(|| PathBuf::from(&config.paths.event_log));
    let (document, summary) = preparation::prepare_combined_log(&data_dir, &index)
        .with_context(|| format!("failed to prepare users listed in {}", index.display()))?;
    preparation::write_combined_log(&output, &document)?;
    if summary.files_skipped > 0 {
        warn!("{} listed files could not be used", summary.files_skipped);
    }
    Ok(())
}

/// Genre indices per user after enrichment, plus the first run-level failure.
struct EnrichmentOutcome {
    indices: HashMap<String, GenreIndex>,
    failure: Option<EnrichmentError>,
}

fn run_enrichment(config: &Config, users: &[&UserRecord], force: bool) -> EnrichmentOutcome {
    let max_age = if force {
        Some(std::time::Duration::ZERO)
    } else {
        config.enrichment.artifact_max_age()
    };
    let cache = ArtifactCache::new(&config.paths.genre_dir, max_age);
    let credentials = config.enrichment.credentials();
    let api = SpotifyCatalogApi::new(
        &config.enrichment.token_url,
        &config.enrichment.search_url,
        config.enrichment.connect_timeout(),
        config.enrichment.read_timeout(),
    );
    let policy = RetryPolicy {
        max_rate_limited_retries: config.enrichment.max_rate_limited_retries,
        ..RetryPolicy::default()
    };
    let mut client = EnrichmentClient::new(api, ThreadSleeper, policy, CancellationToken::new());
    let mut budget = RateBudget::per_second(config.enrichment.requests_per_second);

    let mut outcome = EnrichmentOutcome {
        indices: HashMap::new(),
        failure: None,
    };
    for user in users {
        let mut index = GenreIndex::new();
        match ensure_genre_index(
            user,
            &cache,
            &mut client,
            credentials.as_ref(),
            &mut budget,
            &mut index,
        ) {
            Ok(IndexSource::Fetched(report)) => info!(
                "User {}: {} of {} batches succeeded, {} artists indexed",
                user.user,
                report.succeeded_batches(),
                report.batches.len(),
                index.len()
            ),
            Ok(IndexSource::Cached) => debug!("User {}: using cached genre artifact", user.user),
            Ok(IndexSource::NothingToEnrich) => info!("User {}: no music artists to enrich", user.user),
            Err(err) => {
                error!(
                    "Enrichment for {} stopped: {err} ({} artists kept for this run only)",
                    user.user,
                    index.len()
                );
                let fatal = matches!(
                    err,
                    EnrichmentError::AuthFailure(_)
                        | EnrichmentError::AuthExpired(_)
                        | EnrichmentError::MissingCredentials
                );
                outcome.indices.insert(user.user.clone(), index);
                outcome.failure.get_or_insert(err);
                if fatal {
                    break;
                }
                continue;
            }
        }
        outcome.indices.insert(user.user.clone(), index);
    }
    debug!(
        "Enrichment client finished in state {:?}, artifacts in {}",
        client.state(),
        cache.dir().display()
    );
    outcome
}

fn write_reports(
    config: &Config,
    users: &[&UserRecord],
    filter: &PeriodFilter,
    indices: &HashMap<String, GenreIndex>,
) -> anyhow::Result<()> {
    let cache = ArtifactCache::new(&config.paths.genre_dir, None);
    let report_dir = Path::new(&config.paths.report_dir);
    for user in users {
        let cached;
        let index = match indices.get(&user.user) {
            Some(index) => Some(index),
            None => {
                cached = cache
                    .load(&user.user)
                    .with_context(|| format!("failed to read genre artifact for {}", user.user))?;
                cached.as_ref()
            }
        };
        if index.is_none() {
            info!("User {}: no genre data, genre view omitted", user.user);
        }
        let report = DashboardReport::build(user, index, &config.aggregation, filter);
        report::write_report(&report, report_dir, filter)?;
    }
    Ok(())
}

fn run_explore(config: &Config, user: &str) -> anyhow::Result<()> {
    let store = load_event_store(config)?;
    let record = store
        .find_user(user)
        .with_context(|| format!("user '{user}' not found in event log"))?
        .clone();

    let (bus_sender, _) = broadcast::channel(64);
    let reactor = LinkedViewsReactor::new(
        [record],
        config.aggregation.time_bands.clone(),
        config.aggregation.top_artists,
        bus_sender.subscribe(),
        bus_sender.clone(),
    );
    let mut receiver = bus_sender.subscribe();
    spawn_linked_views_reactor(reactor);
    let mut publisher = SelectionPublisher::new(user, bus_sender.clone());

    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        let line = line.context("failed to read selection from stdin")?;
        let label = line.trim();
        let changed = if label.is_empty() {
            publisher.clear()
        } else {
            match publisher.select_label(label) {
                Ok(changed) => changed,
                Err(err) => {
                    warn!("{err}");
                    continue;
                }
            }
        };
        if !changed {
            info!("{} is already selected", publisher.state().current());
            continue;
        }
        loop {
            match receiver.blocking_recv() {
                Ok(Message::Views(ViewMessage::LinkedViewsUpdated(update))) if update.user == user => {
                    let json = serde_json::to_string_pretty(&update.views)
                        .context("failed to serialize linked views")?;
                    println!("{json}");
                    break;
                }
                Ok(Message::Views(ViewMessage::LinkedViewsUpdated(update))) => {
                    debug!("Explore: ignoring views for {}", update.user)
                }
                Ok(Message::Views(ViewMessage::UnknownUser(user))) => {
                    bail!("selection reactor does not know user '{user}'")
                }
                Ok(Message::Selection(_)) => {}
                Err(RecvError::Lagged(skipped)) => warn!("Explore lagged, skipped {skipped} message(s)"),
                Err(RecvError::Closed) => bail!("selection bus closed"),
            }
        }
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config_file = match cli.config {
        Some(path) => path,
        None => default_config_path()?,
    };
    let (config, created) = load_or_create_config(&config_file)?;
    init_logging(&config, cli.verbose);
    if created {
        info!(
            "Config file not found. Created default config. path={}",
            config_file.display()
        );
    }
    debug!("Using config {}: {:?}", config_file.display(), config);

    match cli.command {
        Command::Prepare {
            data_dir,
            index,
            output,
        } => run_prepare(&config, data_dir, index, output),
        Command::Enrich { user, force } => {
            let store = load_event_store(&config)?;
            let users = selected_users(&store, user.as_deref())?;
            let outcome = run_enrichment(&config, &users, force);
            match outcome.failure {
                Some(err) => Err(err).context("enrichment did not complete"),
                None => Ok(()),
            }
        }
        Command::Report { user, month } => {
            let filter = parse_period(month.as_deref())?;
            let store = load_event_store(&config)?;
            let users = selected_users(&store, user.as_deref())?;
            write_reports(&config, &users, &filter, &HashMap::new())
        }
        Command::MergeGenres { output } => {
            let output = output.unwrap_or_else(|| PathBuf::from(&config.paths.merged_genres));
            let users = preparation::merge_genre_artifacts(Path::new(&config.paths.genre_dir), &output)?;
            info!("Merged genre data for: {}", users.join(", "));
            Ok(())
        }
        Command::Run { user, month } => {
            let filter = parse_period(month.as_deref())?;
            let store = load_event_store(&config)?;
            let users = selected_users(&store, user.as_deref())?;
            let outcome = run_enrichment(&config, &users, false);
            if let Some(err) = &outcome.failure {
                warn!("Continuing with partial genre data: {err}");
            }
            write_reports(&config, &users, &filter, &outcome.indices)
        }
        Command::Explore { user } => run_explore(&config, &user),
    }
}
