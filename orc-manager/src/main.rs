//! The OpenStack resource controller manager
//!
//! `orc-manager run` starts the selected controllers against the cluster of the ambient
//! kubeconfig or service account, and stops them on ctrl-c. `orc-manager crd` prints the custom
//! resource definitions to install first.
use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use kube::Client;
use orc_controllers::{
    scope::{CloudsYamlScopes, InMemoryConnector},
    CONTROLLERS,
};
use orc_runtime::Config;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_MAX_BACKOFF_SECONDS: u64 = 300;

#[derive(Parser)]
#[command(name = "orc-manager", version, about)]
struct App {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the controllers (the default)
    Run(RunArgs),
    /// Print the custom resource definitions as a multi-document YAML stream
    Crd,
}

#[derive(Args)]
struct RunArgs {
    /// Controllers to start, comma separated; all of them when omitted
    #[arg(long, value_delimiter = ',')]
    controllers: Vec<String>,
    /// Only watch objects in this namespace
    #[arg(long)]
    namespace: Option<String>,
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
    /// Longest delay between retries of a failing object
    #[arg(long, default_value_t = DEFAULT_MAX_BACKOFF_SECONDS, value_parser = clap::value_parser!(u64).range(1..))]
    max_backoff_seconds: u64,
}

impl Default for RunArgs {
    fn default() -> Self {
        Self {
            controllers: Vec::new(),
            namespace: None,
            log_format: LogFormat::Text,
            max_backoff_seconds: DEFAULT_MAX_BACKOFF_SECONDS,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

fn init_logging(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Json => registry.with(fmt::layer().json()).init(),
        LogFormat::Text => registry.with(fmt::layer()).init(),
    }
}

fn print_crds() -> Result<()> {
    for crd in orc_controllers::crds() {
        print!("---\n{}", serde_yaml::to_string(&crd)?);
    }
    Ok(())
}

async fn run(args: RunArgs) -> Result<()> {
    init_logging(args.log_format);
    let names = if args.controllers.is_empty() {
        CONTROLLERS.iter().map(|name| name.to_string()).collect()
    } else {
        args.controllers
    };
    let config = Config {
        namespace: args.namespace,
        max_backoff: Duration::from_secs(args.max_backoff_seconds),
        ..Config::default()
    };
    let client = Client::try_default().await.context("connecting to the cluster")?;
    let shutdown = CancellationToken::new();

    warn!("no OpenStack SDK is linked in, credentials are served by the in-memory cloud");
    let scopes = CloudsYamlScopes::new(InMemoryConnector::default());
    let controllers = names
        .iter()
        .map(|name| {
            orc_controllers::controller(name, scopes.clone(), client.clone(), config.clone(), shutdown.clone())
        })
        .collect::<Result<Vec<_>, _>>()?;
    info!(controllers = ?names, namespace = ?config.namespace, "starting");

    let on_signal = shutdown.clone();
    tokio::spawn(async move {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(%err, "cannot listen for ctrl-c");
            return;
        }
        info!("shutting down");
        on_signal.cancel();
    });

    futures::future::join_all(controllers).await;
    info!("all controllers stopped");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let app = App::parse();
    match app.command {
        Some(Command::Crd) => print_crds(),
        Some(Command::Run(args)) => run(args).await,
        None => run(RunArgs::default()).await,
    }
}
