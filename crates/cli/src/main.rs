use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use charter_api::{Collaborators, Driver, ExecutorFactory, Operation, Outcome, StepResult, SystemClock};
use charter_bridge::{bridge_name, detect_isolation, serve_envelope, BridgeManager, Envelope};
use charter_core::{Error, PhysicalId, ReleaseSpec, Settings};
use charter_kubehub::KubeconfigResolver;
use charter_persist::HttpFetcher;
use clap::{Parser, Subcommand, ValueEnum};
use metrics::counter;
use serde_json::{json, Value as Json};
use tokio::io::AsyncReadExt;
use tracing::{error, info};

mod aws;
mod executors;
mod helm;
mod lambda;
mod runner;

use aws::{AwsCli, SchemeFetcher};
use executors::{LocalExecutors, HTTP_TIMEOUT};
use lambda::LambdaHost;
use runner::{ProcessRunner, Runner};

#[derive(Parser, Debug)]
#[command(name = "charterctl", version, about = "Charter release provisioner")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Json)]
    output: Output,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output {
    Human,
    Json,
}

#[derive(clap::Args, Debug)]
struct StepArgs {
    /// Release spec file (YAML or JSON)
    #[arg(long = "spec")]
    spec: PathBuf,
    /// Resume token returned by the previous step
    #[arg(long = "token")]
    token: Option<PathBuf>,
    /// Write the next resume token here when the step is still in progress
    #[arg(long = "save-token")]
    save_token: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run one step of a release install
    Install(StepArgs),
    /// Run one step of a release update
    Update(StepArgs),
    /// Run one step of a release uninstall
    Uninstall(StepArgs),
    /// Report the recorded release
    Read {
        #[arg(long = "spec")]
        spec: PathBuf,
    },
    /// List releases (not implemented by the driver)
    List {
        #[arg(long = "spec")]
        spec: PathBuf,
    },
    /// Serve one bridge envelope read from stdin
    Relay,
    /// Print the bridge name a spec would use, if the cluster is isolated
    BridgeName {
        #[arg(long = "spec")]
        spec: PathBuf,
    },
}

fn init_tracing() {
    let env = std::env::var("CHARTER_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("CHARTER_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid CHARTER_METRICS_ADDR; expected host:port");
        }
    }
}

fn read_spec(path: &Path) -> Result<ReleaseSpec> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading spec {}", path.display()))?;
    serde_yaml::from_str(&text).with_context(|| format!("parsing spec {}", path.display()))
}

fn read_token(path: Option<&Path>) -> Result<Option<Json>> {
    let Some(path) = path else { return Ok(None) };
    let text = std::fs::read_to_string(path).with_context(|| format!("reading token {}", path.display()))?;
    Ok(Some(serde_json::from_str(&text).with_context(|| format!("parsing token {}", path.display()))?))
}

struct Wiring {
    aws: AwsCli,
    runner: Arc<dyn Runner>,
    settings: Settings,
}

impl Wiring {
    fn new(settings: Settings) -> Self {
        let runner: Arc<dyn Runner> = Arc::new(ProcessRunner);
        let aws = AwsCli::new(runner.clone(), settings.region.clone(), settings.work_dir.clone());
        Self { aws, runner, settings }
    }

    fn executors(&self) -> Result<LocalExecutors> {
        let archives = Arc::new(SchemeFetcher::new(self.aws.clone(), HttpFetcher::new(HTTP_TIMEOUT)?));
        Ok(LocalExecutors::new(self.settings.clone(), self.runner.clone(), archives))
    }

    fn driver(&self) -> Result<Driver> {
        let aws = Arc::new(self.aws.clone());
        let host = Arc::new(LambdaHost::new(self.aws.clone()));
        let c = Collaborators {
            kubeconfigs: KubeconfigResolver { directory: aws.clone(), tokens: aws.clone(), secrets: aws.clone() },
            directory: aws.clone(),
            routes: aws.clone(),
            bridges: BridgeManager::new(host, self.settings.bridge.clone()),
            archives: Arc::new(SchemeFetcher::new(self.aws.clone(), HttpFetcher::new(HTTP_TIMEOUT)?)),
            executors: Arc::new(self.executors()?),
            clock: Arc::new(SystemClock),
        };
        Ok(Driver::new(self.settings.clone(), c))
    }
}

fn step_document(r: &StepResult) -> Result<Json> {
    let spec = serde_json::to_value(&r.spec).context("encoding spec")?;
    Ok(match &r.outcome {
        Outcome::Complete => json!({"outcome": "Complete", "spec": spec}),
        Outcome::InProgress { stage, token, delay_secs } => {
            json!({"outcome": "InProgress", "stage": stage.as_str(), "delaySecs": delay_secs, "spec": spec, "token": token.to_value().context("encoding resume token")?})
        }
        Outcome::Failed { message } => json!({"outcome": "Failed", "message": message, "spec": spec}),
    })
}

fn report(r: &StepResult, output: Output, save_token: Option<&Path>) -> Result<bool> {
    if let (Outcome::InProgress { token, .. }, Some(path)) = (&r.outcome, save_token) {
        let text = serde_json::to_string_pretty(&token.to_value().context("encoding resume token")?)?;
        std::fs::write(path, text).with_context(|| format!("writing token {}", path.display()))?;
    }
    match output {
        Output::Json => println!("{}", serde_json::to_string_pretty(&step_document(r)?)?),
        Output::Human => match &r.outcome {
            Outcome::Complete => println!("Complete"),
            Outcome::InProgress { stage, delay_secs, .. } => println!("InProgress\t{}\tretry in {}s", stage, delay_secs),
            Outcome::Failed { message } => println!("Failed\t{}", message),
        },
    }
    Ok(!matches!(r.outcome, Outcome::Failed { .. }))
}

async fn relay(w: &Wiring) -> Result<Json> {
    let mut input = Vec::new();
    tokio::io::stdin().read_to_end(&mut input).await.context("reading envelope")?;
    let envelope: Envelope = serde_json::from_slice(&input).context("decoding envelope")?;
    let kubeconfig = envelope.kubeconfig.clone().unwrap_or_default();
    let namespace = envelope.target().map(|t| t.namespace).unwrap_or_default();
    let ops = w.executors()?.direct(&kubeconfig, &namespace).await?;
    let response = serve_envelope(&envelope, ops.as_ref()).await?;
    Ok(serde_json::to_value(&response)?)
}

fn relay_error(err: &anyhow::Error) -> Json {
    let kind = match err.downcast_ref::<Error>() {
        Some(Error::Validation(_)) => "ValidationError",
        Some(Error::NotFound(_)) => "NotFoundError",
        Some(_) => "CharterError",
        None => "errorString",
    };
    json!({"errorType": kind, "errorMessage": format!("{:#}", err)})
}

async fn print_bridge_name(w: &Wiring, spec: &ReleaseSpec) -> Result<()> {
    let locator = match &spec.id {
        Some(id) => PhysicalId::decode(id)?.locator()?,
        None => spec.locator()?,
    };
    match detect_isolation(spec, &w.aws, &w.aws).await? {
        Some(network) => println!("{}", bridge_name(&w.settings.bridge.prefix, &locator, &network)),
        None => info!("cluster is reachable directly; no bridge needed"),
    }
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let w = Wiring::new(Settings::from_env());

    let (op, args) = match cli.command {
        Commands::Relay => {
            return match relay(&w).await {
                Ok(doc) => {
                    counter!("charter_relay_requests_total", 1u64, "outcome" => "ok");
                    println!("{}", serde_json::to_string(&doc)?);
                    Ok(())
                }
                Err(e) => {
                    counter!("charter_relay_requests_total", 1u64, "outcome" => "error");
                    error!(error = %format!("{:#}", e), "relay failed");
                    println!("{}", serde_json::to_string(&relay_error(&e))?);
                    std::process::exit(1);
                }
            };
        }
        Commands::BridgeName { spec } => return print_bridge_name(&w, &read_spec(&spec)?).await,
        Commands::Install(a) => (Operation::Install, a),
        Commands::Update(a) => (Operation::Update, a),
        Commands::Uninstall(a) => (Operation::Uninstall, a),
        Commands::Read { spec } => (Operation::Read, StepArgs { spec, token: None, save_token: None }),
        Commands::List { spec } => (Operation::List, StepArgs { spec, token: None, save_token: None }),
    };

    let spec = read_spec(&args.spec)?;
    let token = read_token(args.token.as_deref())?;
    let driver = w.driver()?;
    let result = driver.step(op, spec, token.as_ref()).await;
    if !report(&result, cli.output, args.save_token.as_deref())? {
        std::process::exit(2);
    }
    Ok(())
}
