use std::{
    env,
    io::{self, Write},
    path::{Path, PathBuf},
};

use clap::{Args, Parser, Subcommand};
use metrics_exporter_prometheus::PrometheusBuilder;
use rand::{SeedableRng, rngs::SmallRng};
use tagserve::{
    config::{self, Config, Telemetry},
    generator::{self, Tagserve},
    harness::{self, TagserveElement, Variables},
    signals::{self, Shutdown},
};
use tagserve_payload::{ModelSource, SampleGenerator, generator::DEFAULT_WINDOW_MILLIS};
use tokio::{
    runtime::Builder,
    signal,
    task::JoinSet,
    time::{Duration, sleep},
};
use tracing::{debug, error, info};
use tracing_subscriber::{EnvFilter, util::SubscriberInitExt};

#[derive(thiserror::Error, Debug)]
enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("Failed to load tagserve config: {0}")]
    Config(#[from] config::Error),
    #[error("Tagserve generator returned an error: {0}")]
    Generator(#[from] generator::Error),
    #[error("Harness step failed: {0}")]
    Harness(#[from] harness::Error),
    #[error("Traffic model is invalid: {0}")]
    Payload(#[from] tagserve_payload::Error),
    #[error("Tagserve failed to signal shutdown: {0}")]
    Signal(#[from] signals::Error),
    #[error("Failed to install prometheus recorder: {0}")]
    Prometheus(#[from] metrics_exporter_prometheus::BuildError),
}

fn default_config_path() -> String {
    "/etc/tagserve/tagserve.yaml".to_string()
}

#[derive(Parser)]
#[clap(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run tagserve with specified configuration
    Run(RunCommand),
    /// Validate configuration file and every traffic model it names, then exit
    ConfigCheck(ConfigCheckCommand),
    /// Draw tag requests from a traffic model and print them
    Sample(SampleCommand),
}

#[derive(Args)]
struct RunCommand {
    /// path on disk to the configuration file
    #[clap(long, default_value_t = default_config_path())]
    config_path: String,
    /// the time, in seconds, to run before signaling shutdown; unbounded if
    /// unset
    #[clap(long)]
    experiment_duration_seconds: Option<u32>,
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

#[derive(Args)]
struct SampleCommand {
    /// path on disk to the traffic model
    model_path: PathBuf,
    /// the variable each message is stored under
    #[clap(long, default_value_t = harness::default_variable_name())]
    variable_name: String,
    /// number of iterations to run
    #[clap(long, default_value_t = 1)]
    count: u64,
    /// seed for the random number generator
    #[clap(long, default_value_t = 19_690_616)]
    seed: u64,
    /// width of each sample's time window, in milliseconds
    #[clap(long, default_value_t = DEFAULT_WINDOW_MILLIS)]
    window_millis: u64,
}

fn load_config(config_path: &str) -> Result<Config, Error> {
    let res = if let Ok(env_var_value) = env::var("TAGSERVE_CONFIG") {
        debug!("Using config from env var 'TAGSERVE_CONFIG'");
        config::parse_config(&env_var_value)
    } else {
        debug!("Attempting to open configuration file at: {config_path}");
        config::load_config_from_path(Path::new(config_path))
    };
    res.map_err(|err| {
        error!("Configuration validation failed: {err}");
        Error::Config(err)
    })
}

fn check_config(config_path: &str) -> Result<(), Error> {
    let config = load_config(config_path)?;
    for generator in &config.generator {
        SampleGenerator::load(&generator.model, generator.window_millis)?;
    }
    info!(
        generators = config.generator.len(),
        "Configuration file is valid"
    );
    Ok(())
}

fn sample(cmd: SampleCommand) -> Result<(), Error> {
    let element = TagserveElement::from_config(
        harness::Config {
            model: ModelSource::Path(cmd.model_path),
            variable_name: cmd.variable_name,
        },
        cmd.window_millis,
    );
    let mut rng = SmallRng::seed_from_u64(cmd.seed);
    let mut variables = Variables::default();

    let stdout = io::stdout();
    let mut out = io::BufWriter::new(stdout.lock());
    for _ in 0..cmd.count {
        element.iteration_start(&mut rng, &mut variables)?;
        for (name, value) in variables.iter() {
            out.write_all(name.as_bytes())?;
            out.write_all(b"\t")?;
            out.write_all(value)?;
            out.write_all(b"\n")?;
        }
    }
    out.flush()?;
    Ok(())
}

async fn inner_main(experiment_duration: Option<Duration>, config: Config) -> Result<(), Error> {
    let shutdown = Shutdown::new();

    if let Some(Telemetry::Prometheus {
        addr,
        global_labels,
    }) = config.telemetry
    {
        let mut builder = PrometheusBuilder::new().with_http_listener(addr);
        for (k, v) in global_labels {
            builder = builder.add_global_label(k, v);
        }
        builder.install()?;
        info!("Prometheus exporter listening on {addr}");
    }

    let mut gsrv_joinset = JoinSet::new();
    for cfg in config.generator {
        let server = Tagserve::new(&cfg, shutdown.clone())?;
        gsrv_joinset.spawn(server.spin());
    }

    let experiment = async move {
        match experiment_duration {
            Some(duration) => sleep(duration).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(experiment);

    let res = loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("received ctrl-c");
                break Ok(());
            },
            () = &mut experiment => {
                info!("experiment duration exceeded, signaling for shutdown");
                break Ok(());
            },
            res = gsrv_joinset.join_next() => {
                match res {
                    Some(Ok(Ok(completed))) => {
                        debug!(completed, "Generator finished");
                    }
                    Some(Ok(Err(err))) => {
                        error!("Generator shut down unexpectedly: {err}");
                        break Err(Error::Generator(err));
                    }
                    Some(Err(err)) => error!("Could not join the spawned generator task: {err}"),
                    None => {
                        info!("all generators finished");
                        break Ok(());
                    }
                }
            },
        }
    };

    shutdown.signal()?;
    while let Some(res) = gsrv_joinset.join_next().await {
        match res {
            Ok(Ok(completed)) => debug!(completed, "Generator finished"),
            Ok(Err(err)) => error!("Generator failed during shutdown: {err}"),
            Err(err) => error!("Could not join the spawned generator task: {err}"),
        }
    }
    res
}

fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_ansi(false)
        .finish()
        .init();

    let cmd = match Cli::parse().command {
        Commands::Run(cmd) => cmd,
        Commands::ConfigCheck(cmd) => return check_config(&cmd.config_path),
        Commands::Sample(cmd) => return sample(cmd),
    };

    let version = env!("CARGO_PKG_VERSION");
    info!("Starting tagserve {version} run.");

    let config = load_config(&cmd.config_path)?;
    let experiment_duration = cmd
        .experiment_duration_seconds
        .map(|secs| Duration::from_secs(secs.into()));
    let max_shutdown_delay = Duration::from_secs(cmd.max_shutdown_delay.into());

    let runtime = Builder::new_multi_thread()
        .enable_io()
        .enable_time()
        .build()?;
    let res = runtime.block_on(inner_main(experiment_duration, config));
    info!(
        "Shutting down runtime with a {} second delay. May leave orphaned tasks.",
        max_shutdown_delay.as_secs(),
    );
    runtime.shutdown_timeout(max_shutdown_delay);
    info!("Bye. :)");
    res
}
