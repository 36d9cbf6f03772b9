use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use tokio::signal;
use tracing::{error, info, warn};
use vista_core::{PipelineStats, Resource, ResourceKind};
use vista_kubehub::NamespacePolicy;
use vista_persist::{KvBackend, MemoryBackend, SqliteBackend};
use vista_publish::{BrokerSink, Fanout, HttpSink, RegistrySink, RestProxyProducer, RetryPolicy, TopicMap};
use vista_store::{spawn_dispatch, Repository};

#[derive(Parser, Debug)]
#[command(name = "vistad", version, about = "Vista service catalog daemon")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    #[command(flatten)]
    store: StoreArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Backend { Memory, Sqlite }

#[derive(Args, Debug)]
struct StoreArgs {
    /// Catalog backend
    #[arg(long = "backend", value_enum, global = true, env = "VISTA_BACKEND", default_value_t = Backend::Sqlite)]
    backend: Backend,

    /// SQLite file (default: ~/.vista/catalog.db)
    #[arg(long = "db-path", global = true, env = "VISTA_DB_PATH")]
    db_path: Option<String>,
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Kinds to watch
    #[arg(long = "kinds", env = "VISTA_KINDS", value_delimiter = ',', default_value = "service,deployment,statefulset")]
    kinds: Vec<String>,

    /// Namespaces never emitted (repeatable)
    #[arg(long = "exclude-namespace", env = "VISTA_EXCLUDE_NAMESPACES", value_delimiter = ',', default_value = "kube-system", action = ArgAction::Append)]
    exclude_namespaces: Vec<String>,

    /// REST endpoint receiving POST/PUT/DELETE per change (repeatable)
    #[arg(long = "http-sink", env = "VISTA_HTTP_SINKS", value_delimiter = ',', action = ArgAction::Append)]
    http_sinks: Vec<String>,

    /// Service registry agent base URL
    #[arg(long = "registry-agent", env = "VISTA_REGISTRY_AGENT")]
    registry_agent: Option<String>,

    /// Message broker REST proxy base URL
    #[arg(long = "broker-rest", env = "VISTA_BROKER_REST")]
    broker_rest: Option<String>,

    /// Prefix for broker topic names
    #[arg(long = "topic-prefix", env = "VISTA_TOPIC_PREFIX", default_value = "catalog.")]
    topic_prefix: String,

    #[arg(long = "retry-attempts", env = "VISTA_RETRY_ATTEMPTS", default_value_t = 4)]
    retry_attempts: u32,

    #[arg(long = "retry-initial-ms", env = "VISTA_RETRY_INITIAL_MS", default_value_t = 100)]
    retry_initial_ms: u64,

    #[arg(long = "retry-max-ms", env = "VISTA_RETRY_MAX_MS", default_value_t = 2000)]
    retry_max_ms: u64,

    /// Per-request timeout for sink calls
    #[arg(long = "sink-timeout-ms", env = "VISTA_SINK_TIMEOUT_MS", default_value_t = 5000)]
    sink_timeout_ms: u64,

    /// Prometheus exporter listen address (host:port)
    #[arg(long = "metrics-addr", env = "VISTA_METRICS_ADDR")]
    metrics_addr: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Watch the cluster and publish catalog changes until interrupted
    Run(RunArgs),
    /// List persisted catalog entries
    Ls {
        /// Only entries of this kind
        #[arg(long = "kind")]
        kind: Option<String>,
    },
}

fn init_tracing() {
    let env = std::env::var("VISTA_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics(addr: Option<&str>) {
    let Some(addr) = addr else { return };
    match addr.parse::<std::net::SocketAddr>() {
        Ok(sock) => match metrics_exporter_prometheus::PrometheusBuilder::new().with_http_listener(sock).install() {
            Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
            Err(e) => warn!(error = %e, "failed to install metrics exporter"),
        },
        Err(_) => warn!(addr = %addr, "invalid metrics address; expected host:port"),
    }
}

fn open_backend(args: &StoreArgs) -> Result<Arc<dyn KvBackend>> {
    Ok(match args.backend {
        Backend::Memory => Arc::new(MemoryBackend::new()),
        Backend::Sqlite => {
            let path = args.db_path.clone().unwrap_or_else(vista_persist::default_db_path);
            info!(path = %path, "opening sqlite catalog");
            Arc::new(SqliteBackend::open(&path)?)
        }
    })
}

fn parse_kinds(raw: &[String]) -> Result<Vec<ResourceKind>> {
    let mut kinds = Vec::new();
    for s in raw.iter().map(|s| s.trim()).filter(|s| !s.is_empty()) {
        let k = ResourceKind::from_str(s).with_context(|| format!("--kinds: {}", s))?;
        if !kinds.contains(&k) {
            kinds.push(k);
        }
    }
    Ok(kinds)
}

fn build_fanout(args: &RunArgs) -> Result<Fanout> {
    let policy = RetryPolicy::default()
        .with_attempts(args.retry_attempts)
        .with_backoff(Duration::from_millis(args.retry_initial_ms), Duration::from_millis(args.retry_max_ms));
    let timeout = Duration::from_millis(args.sink_timeout_ms);
    let mut fanout = Fanout::new(policy);
    for url in &args.http_sinks {
        fanout.add_sink(Arc::new(HttpSink::new(url, timeout)?));
    }
    if let Some(url) = &args.registry_agent {
        fanout.add_sink(Arc::new(RegistrySink::new(url, timeout)?));
    }
    if let Some(url) = &args.broker_rest {
        let producer = Arc::new(RestProxyProducer::new(url, timeout)?);
        let topics = TopicMap::with_prefix(&args.topic_prefix);
        fanout.add_sink(Arc::new(BrokerSink::new(format!("broker:{}", url), producer, topics)));
    }
    if fanout.is_empty() {
        warn!("no sinks configured; changes are recorded but not published");
    }
    Ok(fanout)
}

async fn run(store: &StoreArgs, args: RunArgs) -> Result<()> {
    init_metrics(args.metrics_addr.as_deref());
    let kinds = parse_kinds(&args.kinds)?;
    let stats = Arc::new(PipelineStats::new());
    let repo = Repository::new(open_backend(store)?, stats.clone());
    let fanout = build_fanout(&args)?;
    info!(sinks = fanout.len(), kinds = ?kinds, "starting pipeline");

    let client = vista_kubehub::kube_client().await?;
    let policy = Arc::new(NamespacePolicy::new(args.exclude_namespaces.iter().cloned()));
    let (tx, handle, dispatch) = spawn_dispatch(repo, fanout, stats.clone());

    let watchers: Vec<_> = kinds
        .iter()
        .map(|k| vista_kubehub::start_kind(*k, client.clone(), policy.clone(), tx.clone()))
        .collect();
    drop(tx);

    signal::ctrl_c().await.context("waiting for Ctrl-C")?;
    info!("shutdown requested");
    for w in &watchers {
        w.abort();
    }
    for w in watchers {
        match w.await {
            Ok(Err(e)) => error!(error = ?e, "watcher failed"),
            Err(e) if !e.is_cancelled() => error!(error = %e, "watcher task panicked"),
            _ => {}
        }
    }
    if let Err(e) = dispatch.await {
        error!(error = %e, "dispatch task panicked");
    }
    info!(entries = handle.current().items.len(), stats = ?stats.snapshot(), "stopped");
    Ok(())
}

fn render_row(r: &Resource) -> String {
    let ns = if r.meta().namespace.is_empty() { "-" } else { r.meta().namespace.as_str() };
    format!("{:<12} {:<14} {:<24} {:>4}  {}", r.kind().as_str(), ns, r.meta().name, r.generation(), r.id())
}

fn ls(store: &StoreArgs, kind: Option<&str>, output: Output) -> Result<()> {
    let repo = Repository::new(open_backend(store)?, Arc::new(PipelineStats::new()));
    let items = match kind {
        Some(k) => repo.get_all_of(ResourceKind::from_str(k)?)?,
        None => repo.get_all_resources()?,
    };
    match output {
        Output::Human => {
            println!("{:<12} {:<14} {:<24} {:>4}  ID", "KIND", "NAMESPACE", "NAME", "GEN");
            for r in &items {
                println!("{}", render_row(r));
            }
        }
        Output::Json => println!("{}", serde_json::to_string_pretty(&items)?),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    match cli.command {
        Commands::Run(args) => run(&cli.store, args).await,
        Commands::Ls { kind } => ls(&cli.store, kind.as_deref(), cli.output),
    }
}
