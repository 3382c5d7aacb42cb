//! Tunium - a pluggable tunneling proxy

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use clap::{ArgAction, Args, Parser, Subcommand};
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use tunium::app::{profile, Hub};
use tunium::config::{CoreConfig, FileConfig, Overrides};
use tunium::error::{Error, Result};
use tunium::preset::Role;

/// Period of the configuration file watcher
const WATCH_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Parser, Debug)]
#[command(name = "tunium", version, about = "A pluggable tunneling proxy")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the local end: accept application traffic and forward it wrapped
    Client(RunArgs),
    /// Run the remote end: unwrap traffic and dial the real destination
    Server(RunArgs),
}

#[derive(Args, Debug, Clone)]
struct RunArgs {
    /// Bind host
    #[arg(long)]
    host: Option<String>,

    /// Bind port (default 1080)
    #[arg(long)]
    port: Option<u16>,

    /// Shared secret (required here or in the config file)
    #[arg(long)]
    key: Option<String>,

    /// Path to a JSON configuration file
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,

    /// host:port fallback on preset failure (server role)
    #[arg(long)]
    redirect: Option<String>,

    /// Log level: error, warn, info, verbose, debug (default verbose)
    #[arg(long)]
    log_level: Option<String>,

    /// Idle timeout in seconds (default 600)
    #[arg(long)]
    timeout: Option<u64>,

    /// Force log level to error
    #[arg(short, long)]
    quiet: bool,

    /// Hot-reload the config file on change
    #[arg(
        short,
        long,
        default_value_t = true,
        action = ArgAction::Set,
        num_args = 0..=1,
        default_missing_value = "true"
    )]
    watch: bool,

    /// Write performance statistics on exit
    #[arg(long)]
    profile: bool,
}

fn main() {
    if let Err(e) = run() {
        eprintln!("tunium: {}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    let (role, args) = match cli.command {
        Command::Client(args) => (Role::Client, args),
        Command::Server(args) => (Role::Server, args),
    };

    let file = match &args.config {
        Some(path) => FileConfig::load(path)?,
        None => FileConfig::default(),
    };

    init_logging(&args, &file)?;

    let overrides = Overrides {
        host: args.host.clone(),
        port: args.port,
        key: args.key.clone(),
        redirect: args.redirect.clone(),
        timeout: args.timeout,
    };
    let config = CoreConfig::build(role, file, overrides.clone())?;

    profile::register_metrics();
    info!("Tunium v{} starting as {}", env!("CARGO_PKG_VERSION"), role.as_str());

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(serve(role, args, overrides, config))
}

async fn serve(role: Role, args: RunArgs, overrides: Overrides, config: CoreConfig) -> Result<()> {
    let hub = Arc::new(Hub::new(config));

    let watcher = match (&args.config, args.watch) {
        (Some(path), true) => Some(tokio::spawn(watch_config(
            path.clone(),
            role,
            overrides,
            hub.clone(),
        ))),
        _ => None,
    };

    let mut runner = {
        let hub = hub.clone();
        tokio::spawn(async move { hub.run().await })
    };

    let result = tokio::select! {
        finished = &mut runner => join_result(finished),
        signal = tokio::signal::ctrl_c() => {
            signal?;
            info!("interrupt received; shutting down");
            hub.close();
            join_result(runner.await)
        }
    };

    if let Some(watcher) = watcher {
        watcher.abort();
    }

    if args.profile {
        info!("profile report:\n{}", profile::report());
    }

    result
}

fn join_result(joined: std::result::Result<Result<()>, tokio::task::JoinError>) -> Result<()> {
    joined.map_err(|e| Error::Config(format!("runtime task failed: {}", e)))?
}

/// Poll the config file's mtime and install re-validated snapshots.
/// Invalid edits are logged and ignored; running relays are never touched.
async fn watch_config(path: PathBuf, role: Role, overrides: Overrides, hub: Arc<Hub>) {
    let mut last_seen = modified_at(&path);
    let mut ticker = tokio::time::interval(WATCH_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        let current = modified_at(&path);
        if current == last_seen {
            continue;
        }
        last_seen = current;

        match FileConfig::load(&path) {
            Ok(file) => match CoreConfig::build(role, file, overrides.clone()) {
                Ok(config) => {
                    hub.install_config(config);
                }
                Err(e) => warn!(error = %e, "ignoring invalid config update"),
            },
            Err(e) => warn!(error = %e, "failed to re-read config file"),
        }
    }
}

fn modified_at(path: &PathBuf) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

fn init_logging(args: &RunArgs, file: &FileConfig) -> Result<()> {
    let name = if args.quiet {
        "error"
    } else {
        args.log_level
            .as_deref()
            .or(file.log_level.as_deref())
            .unwrap_or("verbose")
    };

    let level = match name {
        "error" => Level::ERROR,
        "warn" => Level::WARN,
        "info" => Level::INFO,
        "verbose" => Level::DEBUG,
        "debug" => Level::TRACE,
        other => {
            return Err(Error::Config(format!("unknown log level: {}", other)));
        }
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| Error::Config(format!("Failed to set tracing subscriber: {}", e)))?;
    Ok(())
}
