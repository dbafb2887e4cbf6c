use clap::Parser;
use libebbtide::logging::LoggingConfig;
use libebbtide::report::{round_progress_text, write_summaries, OutputFormat};
use libebbtide::{
    ActionMode, Config, Criteria, EbbtideError, Orchestrator, Result, Summary, Target, Timeline,
};
use std::io::Write;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "ebb-prune")]
#[command(version, about = "Delete, unlike, or unshare old items across your timelines")]
#[command(long_about = r#"Walk your timelines newest first and act on every item past the threshold.

Each platform runs concurrently and within its own rate limit. Pinned posts
and likes of your own posts are preserved unless told otherwise. A failed
platform never stops the others.

EXAMPLES:
    # Everything older than 90 days, on every enabled platform
    ebb-prune --max-age 90d

    # Preview first
    ebb-prune --max-age 90d --dry-run

    # Unlike Bluesky likes from before 2024
    ebb-prune --platform bluesky --timeline likes --before 2024-01-01

    # Undo old boosts only
    ebb-prune --platform mastodon --timeline reposts --max-age 30d

    # One page at a time, e.g. from cron
    ebb-prune --max-age 1y --single-batch --batch-size 25

    # Machine-readable summaries
    ebb-prune --max-age 90d --format json | jq '.[] | .counts.deleted'

SAFETY:
    Without --max-age or --before (here or in the [prune] section) every
    item on the timeline qualifies. ebb-prune refuses to run like that unless
    --all or --dry-run is given.

    SIGINT stops after the current item; completed actions are reported.

OUTPUT FORMATS:
    text  - one progress line per page, then one summary line per platform (default)
    json  - JSON array of run summaries
    jsonl - one run summary per line

CONFIGURATION:
    Configuration file: ~/.config/ebbtide/config.toml
    Override with --config or EBBTIDE_CONFIG. Flags override [prune].

EXIT CODES:
    0 - Every platform run completed
    1 - A platform run failed, or configuration error
    2 - Authentication error
    3 - Invalid input
"#)]
struct Cli {
    /// Platforms to prune
    #[arg(short, long, value_name = "PLATFORM")]
    #[arg(help = "Platform to prune (bluesky, mastodon); repeat or comma-separate for several. Defaults to every enabled platform")]
    platform: Vec<String>,

    /// Account to walk
    #[arg(short, long, default_value = "", value_name = "USER")]
    #[arg(help = "Account to walk (Bluesky handle or DID, Mastodon account id). Defaults to your own account")]
    user: String,

    /// Age threshold
    #[arg(long, value_name = "DURATION")]
    #[arg(help = "Act on items older than this (e.g. 30d, 12h, 2weeks)")]
    max_age: Option<String>,

    /// Date threshold
    #[arg(long, value_name = "DATE")]
    #[arg(help = "Act on items created before this date (YYYY-MM-DD, RFC 3339, Unix timestamp, or 'last month')")]
    before: Option<String>,

    /// Action
    #[arg(short, long, value_name = "ACTION")]
    #[arg(help = "delete, unlike, unshare, or auto (unlike likes, unshare reposts, delete the rest)")]
    #[arg(value_parser = ["delete", "unlike", "unshare", "auto"])]
    action: Option<String>,

    /// Timeline to walk
    #[arg(short, long, value_name = "TIMELINE")]
    #[arg(help = "Timeline to walk: posts, likes, or reposts")]
    timeline: Option<String>,

    /// Page size
    #[arg(long, value_name = "N")]
    #[arg(help = "Items requested per page, 1-100")]
    batch_size: Option<u32>,

    /// Stop after one page
    #[arg(long)]
    #[arg(help = "Process a single page and stop")]
    single_batch: bool,

    /// Do not preserve pinned posts
    #[arg(long)]
    #[arg(help = "Act on pinned posts too")]
    no_preserve_pinned: bool,

    /// Do not preserve self-likes
    #[arg(long)]
    #[arg(help = "Act on likes of your own posts too")]
    no_preserve_self_like: bool,

    /// Report without acting
    #[arg(short = 'n', long)]
    #[arg(help = "Show what would be done without changing anything")]
    dry_run: bool,

    /// Allow running without a threshold
    #[arg(long)]
    #[arg(help = "Act on every item when no --max-age or --before is set")]
    all: bool,

    /// Output format
    #[arg(short, long, default_value = "text", value_name = "FORMAT")]
    #[arg(help = "Output format: text (progress and summary), json (array), or jsonl (streaming)")]
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

    let cancel = CancellationToken::new();
    spawn_interrupt_handler(cancel.clone());

    let orchestrator = Orchestrator::from_config(&config, &platforms)
        .await?
        .with_cancellation(cancel);
    let targets: Vec<Target> = platforms
        .into_iter()
        .map(|platform| Target::new(platform, cli.user.clone()))
        .collect();

    info!(
        platforms = targets.len(),
        dry_run = criteria.dry_run,
        timeline = %criteria.timeline,
        "starting prune"
    );

    let summaries = orchestrator
        .run_all(&targets, &criteria, |round| {
            if format == OutputFormat::Text {
                let mut stdout = std::io::stdout().lock();
                if let Err(e) = writeln!(stdout, "{}", round_progress_text(round)) {
                    warn!(error = %e, "failed to write progress");
                }
            }
        })
        .await;

    write_summaries(&summaries, format, &mut std::io::stdout().lock())?;

    for summary in &summaries {
        if let Some(outcome) = summary.outcome.as_ref().filter(|o| o.is_failure()) {
            eprintln!("Error: {}: {}", summary.platform, outcome);
        }
    }

    Ok(summaries)
}

/// Criteria from the `[prune]` section with flags layered on top
fn build_criteria(cli: &Cli, config: &Config) -> Result<Criteria> {
    let mut builder = config.prune.to_criteria_builder()?;

    if let Some(max_age) = &cli.max_age {
        builder = builder.max_age_str(max_age)?;
    }
    if let Some(before) = &cli.before {
        builder = builder.before_date_str(before)?;
    }
    if let Some(action) = &cli.action {
        builder = builder.action(action.parse::<ActionMode>()?);
    }
    if let Some(timeline) = &cli.timeline {
        builder = builder.timeline(timeline.parse::<Timeline>()?);
    }
    if let Some(batch_size) = cli.batch_size {
        builder = builder.batch_size(batch_size);
    }
    if cli.single_batch {
        builder = builder.continue_to_end(false);
    }
    if cli.no_preserve_pinned {
        builder = builder.preserve_pinned(false);
    }
    if cli.no_preserve_self_like {
        builder = builder.preserve_self_like(false);
    }

    let criteria = builder.dry_run(cli.dry_run).build()?;

    if !criteria.has_threshold() && !criteria.dry_run && !cli.all {
        return Err(EbbtideError::InvalidInput(
            "no --max-age or --before threshold; pass --all to act on every item".to_string(),
        ));
    }

    Ok(criteria)
}

/// Cancel every run on the first SIGINT
fn spawn_interrupt_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, stopping after the current item");
            cancel.cancel();
        }
    });
}
