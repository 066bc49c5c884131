//! rpvald - RPKI relying-party validator daemon.
//!
//! Loads the configured TALs, then iterates fetch-and-validate cycles
//! until the set of referenced repositories stops changing. In server
//! mode it keeps revalidating every refresh interval; in oneoff mode it
//! writes the ROA list once stability is reached and exits.
//!
//! The HTTP serving layer, output signing and metrics registration are
//! external collaborators; this binary publishes the snapshot they read
//! and nothing more.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use rpval_core::config::{Config, RunMode, DEFAULT_MAX_ITERATIONS, DEFAULT_RRDP_MAX_RESPONSE};
use rpval_daemon::http::ReqwestFetcher;
use rpval_daemon::Orchestrator;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// rpval - RPKI relying party validator
#[derive(Parser, Debug)]
#[command(name = "rpvald")]
#[command(version, about, long_about = None)]
struct Args {
    /// TAL files to validate from (repeatable)
    #[arg(long = "tal", required = true)]
    tals: Vec<PathBuf>,

    /// Display names for the TALs, parallel to --tal
    #[arg(long = "tal-name")]
    tal_names: Vec<String>,

    /// Base directory for the object cache
    #[arg(long, default_value = "cache")]
    cache: PathBuf,

    /// Walk publication points via manifests
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    use_manifest: bool,

    /// Manifests must be complete or the CA is invalidated
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    strict_manifests: bool,

    /// Manifest entry hashes must match or the CA is invalidated
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    strict_hash: bool,

    /// Decode CMS with strict settings
    #[arg(long, default_value_t = false, action = clap::ArgAction::Set)]
    strict_cms: bool,

    /// Enable RRDP fetching
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    rrdp: bool,

    /// Fall back to rsync when RRDP fails
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    rrdp_failover: bool,

    /// Where to persist RRDP session state
    #[arg(long, default_value = "cache/rrdp.json")]
    rrdp_file: PathBuf,

    /// The rsync binary to invoke
    #[arg(long, default_value = "rsync")]
    rsync_bin: PathBuf,

    /// Rsync invocation timeout (e.g. 20m, 300s)
    #[arg(long, default_value = "20m", value_parser = parse_duration)]
    rsync_timeout: Duration,

    /// Revalidation interval in server mode (e.g. 20m)
    #[arg(long, default_value = "20m", value_parser = parse_duration)]
    refresh: Duration,

    /// Max non-stable iterations before giving up
    #[arg(long, default_value_t = DEFAULT_MAX_ITERATIONS)]
    max_iterations: u32,

    /// User-Agent for RRDP and TAL requests
    #[arg(long)]
    useragent: Option<String>,

    /// Output mode: server or oneoff
    #[arg(long, default_value = "server")]
    mode: String,

    /// In oneoff mode, wait for a stable state before writing output
    #[arg(long = "output-wait", default_value_t = true, action = clap::ArgAction::Set)]
    wait_stable: bool,

    /// Output ROA file for oneoff mode; `-` for stdout
    #[arg(long = "output-roa", default_value = "output.json")]
    output: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// Parses `30s` / `20m` / `1h` style durations; a bare number is seconds.
fn parse_duration(value: &str) -> Result<Duration, String> {
    let value = value.trim();
    let (digits, unit) = match value.find(|c: char| !c.is_ascii_digit()) {
        Some(idx) => value.split_at(idx),
        None => (value, "s"),
    };
    let amount: u64 = digits
        .parse()
        .map_err(|_| format!("invalid duration {value}"))?;
    let secs = match unit {
        "s" => amount,
        "m" => amount * 60,
        "h" => amount * 3600,
        _ => return Err(format!("invalid duration unit {unit}")),
    };
    Ok(Duration::from_secs(secs))
}

fn config_from_args(args: &Args) -> Result<Config> {
    let mode = match args.mode.as_str() {
        "server" => RunMode::Server,
        "oneoff" => RunMode::Oneoff,
        other => bail!("mode {other} is not recognized; choose server or oneoff"),
    };
    Ok(Config {
        tal_paths: args.tals.clone(),
        tal_names: args.tal_names.clone(),
        base_path: args.cache.clone(),
        use_manifest: args.use_manifest,
        strict_manifests: args.strict_manifests,
        strict_hash: args.strict_hash,
        strict_cms: args.strict_cms,
        rrdp_enabled: args.rrdp,
        rrdp_failover: args.rrdp_failover,
        rrdp_state_path: args.rrdp_file.clone(),
        rrdp_max_response: DEFAULT_RRDP_MAX_RESPONSE,
        rsync_bin: args.rsync_bin.clone(),
        rsync_timeout: args.rsync_timeout,
        refresh: args.refresh,
        max_iterations: args.max_iterations,
        mode,
        wait_stable: args.wait_stable,
        output_path: args.output.clone(),
        user_agent: args
            .useragent
            .clone()
            .unwrap_or_else(rpval_core::config::default_user_agent),
        ..Config::default()
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter =
        EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = config_from_args(&args)?;
    info!(
        tals = config.tal_paths.len(),
        cache = %config.base_path.display(),
        "validator started"
    );

    let http = ReqwestFetcher::new(
        &config.user_agent,
        config.http_timeout,
        config.rrdp_max_response,
    )
    .context("failed to build the HTTP client")?;

    let mut orchestrator =
        Orchestrator::new(config, http).context("failed to initialize the validator")?;

    // Any error surfacing here is fatal by the error policy: convergence
    // cap, unloadable TAL, uncreatable cache, unwritable output.
    orchestrator.run().await.context("validator terminated")?;
    Ok(())
}
