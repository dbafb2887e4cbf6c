use clap::Parser;
use libebbtide::logging::LoggingConfig;
use libebbtide::report::{OutputFormat, Reporter};
use libebbtide::{Config, Criteria, CriteriaBuilder, Orchestrator, Result, Summary, Target, Timeline};
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};
use tracing::warn;

#[derive(Parser, Debug)]
#[command(name = "ebb-list")]
#[command(version, about = "List timeline items and what a prune would do with them")]
#[command(long_about = r#"Walk your timelines page by page and show what would happen to every item.

ebb-list never deletes anything: every run is a dry run. Without --max-age or
--before every item is listed with the action a prune would take. With a
threshold, newer items are shown as "keep" and the walk stops at the first
item past the threshold.

EXAMPLES:
    # List posts on every enabled platform
    ebb-list

    # Only Mastodon favourites
    ebb-list --platform mastodon --timeline likes

    # What would a 90 day prune touch?
    ebb-list --max-age 90d

    # Everything from before 2024
    ebb-list --before 2024-01-01

    # Just the first page
    ebb-list --single-batch --batch-size 20

    # JSON output for scripting
    ebb-list --format json | jq '.[] | select(.disposition == "delete") | .post.id'

    # JSONL output (one JSON object per line, streamed per page)
    ebb-list --format jsonl | grep '"pinned":true'

OUTPUT FORMATS:
    text  - date | platform | disposition | id | preview (default)
    json  - JSON array of every item
    jsonl - JSON lines, one item per line, written as each page arrives

CONFIGURATION:
    Configuration file: ~/.config/ebbtide/config.toml
    Override with --config or EBBTIDE_CONFIG.

EXIT CODES:
    0 - Success (including empty timelines)
    1 - A platform run failed, or configuration error
    2 - Authentication error
    3 - Invalid input
"#)]
struct Cli {
    /// Platforms to list
    #[arg(short, long, value_name = "PLATFORM")]
    #[arg(help = "Platform to list (bluesky, mastodon); repeat or comma-separate for several. Defaults to every enabled platform")]
    platform: Vec<String>,

    /// Account to walk
    #[arg(short, long, default_value = "", value_name = "USER")]
    #[arg(help = "Account to walk (Bluesky handle or DID, Mastodon account id). Defaults to your own account")]
    user: String,

    /// Timeline to walk
    #[arg(short, long, value_name = "TIMELINE")]
    #[arg(help = "Timeline to walk: posts, likes, or reposts (default: from config, else posts)")]
    timeline: Option<String>,

    /// Age threshold
    #[arg(long, value_name = "DURATION")]
    #[arg(help = "Only items older than this qualify (e.g. 30d, 12h, 2weeks)")]
    max_age: Option<String>,

    /// Date threshold
    #[arg(long, value_name = "DATE")]
    #[arg(help = "Only items created before this date qualify (YYYY-MM-DD, RFC 3339, Unix timestamp, or 'last month')")]
    before: Option<String>,

    /// Page size
    #[arg(long, value_name = "N")]
    #[arg(help = "Items requested per page, 1-100 (default: from config, else 50)")]
    batch_size: Option<u32>,

    /// Stop after one page
    #[arg(long)]
    #[arg(help = "Process a single page and stop")]
    single_batch: bool,

    /// Output format
    #[arg(short, long, default_value = "text", value_name = "FORMAT")]
    #[arg(help = "Output format: text (human-readable), json (array), or jsonl (streaming)")]
    #[arg(value_parser = ["text", "json", "jsonl"])]
    format: String,

    /// Configuration file
    #[arg(short, long, env = "EBBTIDE_CONFIG", value_name = "PATH")]
    #[arg(help = "Path to the configuration file")]
    config: Option<PathBuf>,

    /// Enable verbose logging to stderr
    #[arg(short, long)]
    #[arg(help = "Enable verbose logging (useful for debugging)")]
    verbose: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    LoggingConfig::from_env(cli.verbose).init();

    match run(cli).await {
        Ok(summaries) => {
            if summaries.iter().any(Summary::is_failure) {
                std::process::exit(1);
            }
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(e.exit_code());
        }
    }
}

async fn run(cli: Cli) -> Result<Vec<Summary>> {
    let config = Config::load_from(cli.config.as_deref())?;
    let format: OutputFormat = cli.format.parse()?;
    let criteria = build_criteria(&cli, &config)?;
    let platforms = config.select_platforms(&cli.platform)?;

    let orchestrator = Orchestrator::from_config(&config, &platforms).await?;
    let targets: Vec<Target> = platforms
        .into_iter()
        .map(|platform| Target::new(platform, cli.user.clone()))
        .collect();

    let reporter = Mutex::new(Reporter::new(format));
    let summaries = orchestrator
        .run_all(&targets, &criteria, |round| {
            let mut reporter = reporter.lock().unwrap_or_else(PoisonError::into_inner);
            if let Err(e) = reporter.round(round, &mut std::io::stdout().lock()) {
                warn!(error = %e, "failed to write listing");
            }
        })
        .await;

    reporter
        .into_inner()
        .unwrap_or_else(PoisonError::into_inner)
        .finish(&mut std::io::stdout().lock())?;

    for summary in &summaries {
        if let Some(outcome) = summary.outcome.as_ref().filter(|o| o.is_failure()) {
            eprintln!("Error: {}: {}", summary.platform, outcome);
        }
    }

    Ok(summaries)
}

/// Listing criteria: always a dry run, thresholds only when asked for
fn build_criteria(cli: &Cli, config: &Config) -> Result<Criteria> {
    let timeline: Timeline = match &cli.timeline {
        Some(timeline) => timeline.parse()?,
        None => config.prune.timeline,
    };

    let mut builder = CriteriaBuilder::default()
        .dry_run(true)
        .timeline(timeline)
        .preserve_pinned(config.prune.preserve_pinned)
        .preserve_self_like(config.prune.preserve_self_like)
        .action(config.prune.action)
        .batch_size(cli.batch_size.unwrap_or(config.prune.batch_size))
        .continue_to_end(!cli.single_batch);

    if let Some(max_age) = &cli.max_age {
        builder = builder.max_age_str(max_age)?;
    }
    if let Some(before) = &cli.before {
        builder = builder.before_date_str(before)?;
    }

    builder.build()
}
