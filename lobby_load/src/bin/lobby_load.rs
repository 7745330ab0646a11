use std::{
    env,
    fmt::{self, Display},
    future::Future,
    path::Path,
    str::FromStr,
    time::Duration,
};

use clap::{Args, Parser, Subcommand};
use lobby_load::{
    config::{self, Config, Telemetry},
    seed, session,
};
use lobby_signal::Broadcaster;
use metrics_exporter_prometheus::PrometheusBuilder;
use rustc_hash::FxHashMap;
use tokio::{runtime::Builder, signal, task::JoinHandle};
use tracing::{debug, error, info, warn};
use tracing_subscriber::{EnvFilter, util::SubscriberInitExt};

#[derive(thiserror::Error, Debug)]
enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("Invalid configuration: {0}")]
    Config(#[from] config::Error),
    #[error("Session driver returned an error: {0}")]
    Session(#[from] session::Error),
    #[error("Credential resolver returned an error: {0}")]
    Seed(#[from] seed::Error),
    #[error("Could not join the spawned task: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error(transparent)]
    Registration(#[from] lobby_signal::RegisterError),
}

fn default_config_path() -> String {
    "/etc/lobby-load/lobby-load.yaml".to_string()
}

#[derive(Default, Clone, Debug)]
struct CliKeyValues {
    inner: FxHashMap<String, String>,
}

impl CliKeyValues {
    #[cfg(test)]
    fn get(&self, key: &str) -> Option<&str> {
        self.inner.get(key).map(String::as_str)
    }
}

impl Display for CliKeyValues {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        for (k, v) in &self.inner {
            write!(f, "{k}={v},")?;
        }
        Ok(())
    }
}

impl FromStr for CliKeyValues {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let mut labels = FxHashMap::default();
        for pair in input.split(',').filter(|pair| !pair.is_empty()) {
            let Some((key, value)) = pair.split_once('=') else {
                return Err(format!("expected KEY=VAL, found '{pair}'"));
            };
            if key.is_empty() {
                return Err(format!("empty key in '{pair}'"));
            }
            labels.insert(key.to_string(), value.to_string());
        }
        Ok(Self { inner: labels })
    }
}

#[derive(Parser)]
#[clap(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Ramp virtual users against the lobby
    Run(RunCommand),
    /// Resolve user emails to user IDs and write them to a file
    SeedUsers(SeedUsersCommand),
    /// Validate configuration file and exit
    ConfigCheck(ConfigCheckCommand),
}

#[derive(Args)]
struct RunCommand {
    /// path on disk to the configuration file
    #[clap(long, default_value_t = default_config_path())]
    config_path: String,
    /// additional labels to apply to all metrics, format KEY=VAL,KEY2=VAL
    #[clap(long)]
    global_labels: Option<CliKeyValues>,
    /// the maximum time to wait, in seconds, for controlled shutdown
    #[clap(long, default_value_t = 30)]
    max_shutdown_delay: u16,
}

#[derive(Args)]
struct SeedUsersCommand {
    /// path on disk to the configuration file
    #[clap(long, default_value_t = default_config_path())]
    config_path: String,
    /// the maximum time to wait, in seconds, for controlled shutdown
    #[clap(long, default_value_t = 30)]
    max_shutdown_delay: u16,
}

#[derive(Args)]
struct ConfigCheckCommand {
    /// path on disk to the configuration file
    #[clap(long, default_value_t = default_config_path())]
    config_path: String,
}

fn load_config(config_path: &str) -> Result<Config, Error> {
    let config = if let Ok(env_var_value) = env::var("LOBBY_LOAD_CONFIG") {
        debug!("Using config from env var 'LOBBY_LOAD_CONFIG'");
        config::parse(&env_var_value)
    } else {
        debug!("Attempting to open configuration file at: {config_path}");
        config::load_config_from_path(Path::new(config_path))
    };
    config.map_err(|err| {
        error!("Configuration validation failed: {err}");
        Error::Config(err)
    })
}

fn validate_config(config_path: &str) -> Result<Config, Error> {
    let config = load_config(config_path)?;
    info!("Configuration file is valid");
    Ok(config)
}

fn get_config(config_path: &str, global_labels: Option<&CliKeyValues>) -> Result<Config, Error> {
    let mut config = load_config(config_path)?;

    if let Some(labels) = global_labels {
        match config.telemetry {
            Some(Telemetry::Prometheus {
                ref mut global_labels,
                ..
            }) => {
                for (k, v) in &labels.inner {
                    global_labels.insert(k.clone(), v.clone());
                }
            }
            None => warn!("--global-labels given but no telemetry is configured"),
        }
    }
    Ok(config)
}

fn install_telemetry(telemetry: Option<Telemetry>) {
    let Some(Telemetry::Prometheus {
        addr,
        global_labels,
    }) = telemetry
    else {
        debug!("No telemetry configured");
        return;
    };

    let mut builder = PrometheusBuilder::new().with_http_listener(addr);
    for (k, v) in global_labels {
        builder = builder.add_global_label(k, v);
    }
    tokio::spawn(async move {
        if let Err(err) = builder.install() {
            error!("Failed to install prometheus recorder: {err}");
        }
    });
}

/// Wait for `task` or ctrl-c, whichever comes first, then signal shutdown
/// and wait for every registered watcher to go away.
async fn supervise<T, E>(
    mut task: JoinHandle<Result<T, E>>,
    shutdown_broadcast: Broadcaster,
) -> Result<T, Error>
where
    Error: From<E>,
{
    let finished = tokio::select! {
        _ = signal::ctrl_c() => {
            info!("received ctrl-c");
            None
        }
        res = &mut task => Some(res),
    };
    shutdown_broadcast.signal_and_wait().await;
    let res = match finished {
        Some(res) => res,
        None => task.await,
    };
    Ok(res??)
}

async fn run(config: Config) -> Result<(), Error> {
    let (shutdown_watcher, shutdown_broadcast) = lobby_signal::signal();
    install_telemetry(config.telemetry.clone());

    let driver = session::Driver::new(&config, shutdown_watcher.register()?)?;
    drop(shutdown_watcher);

    let summary = supervise(tokio::spawn(driver.spin()), shutdown_broadcast).await?;
    info!(
        "Run finished: {started} started, {completed} completed ({sessions} with a lobby session), {stopped} stopped, {login_failed} login failures, {gave_up} gave up",
        started = summary.started,
        completed = summary.completed,
        sessions = summary.lobby_sessions,
        stopped = summary.stopped,
        login_failed = summary.login_failed,
        gave_up = summary.gave_up,
    );
    Ok(())
}

async fn seed_users(config: Config) -> Result<(), Error> {
    let (shutdown_watcher, shutdown_broadcast) = lobby_signal::signal();
    install_telemetry(config.telemetry.clone());

    let resolver = seed::Resolver::new(&config, shutdown_watcher.register()?)?;
    drop(shutdown_watcher);

    let summary = supervise(tokio::spawn(resolver.run()), shutdown_broadcast).await?;
    info!(
        "Seeding finished: {resolved} resolved, {unresolved} unresolved",
        resolved = summary.resolved,
        unresolved = summary.unresolved,
    );
    Ok(())
}

fn block_on<F>(max_shutdown_delay: u16, future: F) -> Result<(), Error>
where
    F: Future<Output = Result<(), Error>>,
{
    let max_shutdown_delay = Duration::from_secs(max_shutdown_delay.into());
    let runtime = Builder::new_multi_thread()
        .enable_io()
        .enable_time()
        .build()?;
    let res = runtime.block_on(future);
    info!(
        "Shutting down runtime with a {} second delay. May leave orphaned tasks.",
        max_shutdown_delay.as_secs(),
    );
    runtime.shutdown_timeout(max_shutdown_delay);
    info!("Bye. :)");
    res
}

fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_ansi(false)
        .finish()
        .init();

    let version = env!("CARGO_PKG_VERSION");
    match Cli::parse().command {
        Commands::ConfigCheck(cmd) => match validate_config(&cmd.config_path) {
            Ok(_) => std::process::exit(0),
            Err(_) => std::process::exit(1),
        },
        Commands::Run(cmd) => {
            info!("Starting lobby-load {version} run.");
            let config = get_config(&cmd.config_path, cmd.global_labels.as_ref())?;
            block_on(cmd.max_shutdown_delay, run(config))
        }
        Commands::SeedUsers(cmd) => {
            info!("Starting lobby-load {version} seed-users.");
            let config = get_config(&cmd.config_path, None)?;
            block_on(cmd.max_shutdown_delay, seed_users(config))
        }
    }
}
