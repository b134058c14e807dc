//! Lattice Fleet - multi-cluster query service for GitOps automation objects

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use lattice_fleet::authz::NamespaceAuthorizer;
use lattice_fleet::cache::ResourceCache;
use lattice_fleet::clusters::single::local_cluster;
use lattice_fleet::clusters::{
    ClusterFetcher, ClusterRegistry, KubeStatusProber, SecretClusterFetcher, SingleClusterFetcher,
    StatusProber, TlsConfig,
};
use lattice_fleet::config::{
    ClusterMode, CredentialSource, InClusterCredentials, KubeTimeouts, ServerConfig,
    ServiceCredentials, StaticCredentials,
};
use lattice_fleet::identity::TokenReviewResolver;
use lattice_fleet::kinds::ResourceKind;
use lattice_fleet::pool::factory::kube_client_for;
use lattice_fleet::pool::{ClientIdentity, ClientsPool, ImpersonatingClientFactory};
use lattice_fleet::retry::{retry_with_backoff, RetryConfig};
use lattice_fleet::server::api::{self, ApiState};
use lattice_fleet::server::CoreServer;
use lattice_fleet::telemetry::{init_telemetry, TelemetryConfig};
use lattice_fleet::{Error, DEFAULT_API_PORT, DEFAULT_CLUSTER_NAME, FLEET_CLUSTER_LABEL};

/// Attempts at loading the fleet before serving
const STARTUP_LOAD_ATTEMPTS: u32 = 5;

/// Lattice Fleet - one read API over many Kubernetes clusters
#[derive(Parser, Debug)]
#[command(name = "lattice-fleet", version, about, long_about = None)]
struct Cli {
    #[command(flatten)]
    credentials: CredentialArgs,

    #[command(flatten)]
    serve: ServeArgs,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Serve the query API (default)
    Serve,

    /// Print the GitOps install status of the home cluster
    Status,
}

/// Credentials the server uses for its own calls.
///
/// Without `--server` the in-cluster service account is used.
#[derive(Args, Debug)]
struct CredentialArgs {
    /// API server URL of the home cluster
    #[arg(long, env = "FLEET_SERVER")]
    server: Option<String>,

    /// File holding a bearer token for the home cluster
    #[arg(long, env = "FLEET_TOKEN_FILE")]
    token_file: Option<PathBuf>,

    /// PEM CA bundle for the home cluster
    #[arg(long, env = "FLEET_CA_FILE")]
    ca_file: Option<PathBuf>,

    /// Skip TLS verification for the home cluster
    #[arg(long, env = "FLEET_INSECURE")]
    insecure: bool,

    /// Name the home cluster is served under
    #[arg(long, env = "FLEET_CLUSTER_NAME", default_value = DEFAULT_CLUSTER_NAME)]
    cluster_name: String,

    /// Connect timeout for every cluster client, in seconds
    #[arg(long, env = "FLEET_CONNECT_TIMEOUT_SECS", default_value = "5")]
    connect_timeout_secs: u64,

    /// Read timeout for every cluster client, in seconds
    #[arg(long, env = "FLEET_READ_TIMEOUT_SECS", default_value = "30")]
    read_timeout_secs: u64,
}

impl CredentialArgs {
    async fn source(&self) -> anyhow::Result<Arc<dyn CredentialSource>> {
        let Some(server) = &self.server else {
            return Ok(Arc::new(InClusterCredentials::new()));
        };

        let bearer_token = match &self.token_file {
            Some(path) => Some(
                tokio::fs::read_to_string(path)
                    .await
                    .with_context(|| format!("reading token file {}", path.display()))?
                    .trim()
                    .to_string(),
            ),
            None => None,
        };
        let ca_data = match &self.ca_file {
            Some(path) => Some(
                tokio::fs::read(path)
                    .await
                    .with_context(|| format!("reading CA file {}", path.display()))?,
            ),
            None => None,
        };

        Ok(Arc::new(StaticCredentials(ServiceCredentials {
            server: server.clone(),
            bearer_token,
            tls: TlsConfig {
                ca_data,
                insecure: self.insecure,
                ..Default::default()
            },
        })))
    }

    fn timeouts(&self) -> KubeTimeouts {
        KubeTimeouts {
            connect: Duration::from_secs(self.connect_timeout_secs),
            read: Duration::from_secs(self.read_timeout_secs),
        }
    }
}

#[derive(Args, Debug)]
struct ServeArgs {
    /// Address the HTTP API listens on
    #[arg(long, env = "FLEET_LISTEN_ADDR")]
    listen_addr: Option<SocketAddr>,

    /// Discover remote clusters from labelled Secrets in this namespace
    #[arg(long, env = "FLEET_NAMESPACE")]
    fleet_namespace: Option<String>,

    /// Label selector for cluster Secrets
    #[arg(long, env = "FLEET_LABEL_SELECTOR")]
    label_selector: Option<String>,

    /// In fleet mode, do not serve the home cluster
    #[arg(long, env = "FLEET_EXCLUDE_LOCAL")]
    exclude_local: bool,

    /// Seconds between fleet membership refreshes
    #[arg(long, env = "FLEET_REFRESH_SECS", default_value = "60")]
    refresh_secs: u64,

    /// Per-request deadline in seconds
    #[arg(long, env = "FLEET_REQUEST_TIMEOUT_SECS", default_value = "30")]
    request_timeout_secs: u64,

    /// Kinds kept in the watch-fed cache
    #[arg(long, env = "FLEET_CACHE_KINDS", value_delimiter = ',', default_value = "namespaces")]
    cache_kinds: Vec<String>,

    /// Watch re-establish attempts before giving up (0 = forever)
    #[arg(long, env = "FLEET_WATCH_MAX_ATTEMPTS", default_value = "0")]
    watch_max_attempts: u32,

    /// Consecutive watch failures before a cluster cache is marked unavailable
    #[arg(long, env = "FLEET_DEGRADE_AFTER", default_value = "5")]
    degrade_after: u32,

    /// Seconds an unused per-user client is kept
    #[arg(long, env = "FLEET_CLIENT_IDLE_SECS", default_value = "900")]
    client_idle_secs: u64,

    /// Maximum concurrent permission checks per request
    #[arg(long, env = "FLEET_AUTHZ_CONCURRENCY", default_value = "16")]
    authz_concurrency: usize,

    /// Audiences caller tokens must carry (any audience if unset)
    #[arg(long, env = "FLEET_TOKEN_AUDIENCES", value_delimiter = ',')]
    token_audiences: Vec<String>,
}

impl ServeArgs {
    fn server_config(&self, creds: &CredentialArgs) -> anyhow::Result<ServerConfig> {
        let cached_kinds = self
            .cache_kinds
            .iter()
            .filter(|k| !k.is_empty())
            .map(|k| k.parse::<ResourceKind>())
            .collect::<Result<Vec<_>, _>>()?;

        let mode = match &self.fleet_namespace {
            Some(namespace) => ClusterMode::Fleet {
                namespace: namespace.clone(),
                label_selector: self
                    .label_selector
                    .clone()
                    .unwrap_or_else(|| format!("{FLEET_CLUSTER_LABEL}=true")),
                include_local: !self.exclude_local,
            },
            None => ClusterMode::Single,
        };

        let config = ServerConfig {
            listen_addr: self
                .listen_addr
                .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], DEFAULT_API_PORT))),
            cluster_name: creds.cluster_name.clone(),
            mode,
            refresh_interval: Duration::from_secs(self.refresh_secs),
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            cached_kinds,
            watch_retry: RetryConfig::with_max_attempts(self.watch_max_attempts),
            degrade_after: self.degrade_after,
            client_idle_ttl: Duration::from_secs(self.client_idle_secs),
            authz_concurrency: self.authz_concurrency,
            kube_timeouts: creds.timeouts(),
        };
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _telemetry = init_telemetry(TelemetryConfig::default())?;

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Status) => run_status(&cli.credentials).await,
        Some(Commands::Serve) | None => run_serve(&cli.credentials, &cli.serve).await,
    }
}

/// Print the install status of the home cluster
async fn run_status(creds: &CredentialArgs) -> anyhow::Result<()> {
    let credentials = creds.source().await?;
    let home = local_cluster(&creds.cluster_name, credentials.as_ref()).await?;
    let client = kube_client_for(&home, &ClientIdentity::Service, creds.timeouts()).await?;

    let status = KubeStatusProber::new(client).status().await;
    println!("{}: {status}", home.name);
    Ok(())
}

/// Run the query API until SIGINT/SIGTERM
async fn run_serve(creds: &CredentialArgs, args: &ServeArgs) -> anyhow::Result<()> {
    let config = args.server_config(creds)?;
    info!(
        listen = %config.listen_addr,
        cluster = %config.cluster_name,
        mode = ?config.mode,
        "Starting fleet server"
    );

    let credentials = creds.source().await?;
    let home = local_cluster(&config.cluster_name, credentials.as_ref()).await?;
    let home_client = kube_client_for(&home, &ClientIdentity::Service, config.kube_timeouts).await?;

    let fetcher: Arc<dyn ClusterFetcher> = match &config.mode {
        ClusterMode::Single => Arc::new(SingleClusterFetcher::new(
            config.cluster_name.clone(),
            credentials.clone(),
        )),
        ClusterMode::Fleet {
            namespace,
            label_selector,
            include_local,
        } => {
            let fetcher =
                SecretClusterFetcher::new(home_client.clone(), namespace.clone(), label_selector.clone());
            if *include_local {
                Arc::new(fetcher.with_local(config.cluster_name.clone(), credentials.clone()))
            } else {
                Arc::new(fetcher)
            }
        }
    };

    let registry = Arc::new(ClusterRegistry::new(fetcher, config.cluster_name.clone()));
    let initial = retry_with_backoff(
        &RetryConfig::with_max_attempts(STARTUP_LOAD_ATTEMPTS),
        "load fleet",
        Error::is_permanent,
        || registry.refresh(),
    )
    .await;
    match initial {
        Ok(set) => info!(clusters = set.len(), "Loaded fleet"),
        Err(e) if matches!(config.mode, ClusterMode::Single) || e.is_permanent() => {
            return Err(e).context("loading fleet");
        }
        Err(e) => warn!(error = %e, "Initial fleet load failed, refresh loop will retry"),
    }

    let shutdown = CancellationToken::new();

    tokio::spawn(
        registry
            .clone()
            .run_refresh_loop(config.refresh_interval, shutdown.child_token()),
    );

    let pool = Arc::new(ClientsPool::new(
        registry.clone(),
        Arc::new(ImpersonatingClientFactory::new(config.kube_timeouts)),
    ));
    tokio::spawn(pool.clone().run_maintenance(
        registry.subscribe(),
        config.client_idle_ttl,
        shutdown.child_token(),
    ));

    let cache = Arc::new(ResourceCache::new(
        pool.clone(),
        config.cached_kinds.clone(),
        config.watch_retry.clone(),
        config.degrade_after,
    ));
    let cache_task = cache.start(shutdown.child_token());

    let server = Arc::new(CoreServer::new(
        pool,
        cache,
        NamespaceAuthorizer::new(config.authz_concurrency),
        config.request_timeout,
    ));
    let resolver = if args.token_audiences.is_empty() {
        TokenReviewResolver::new(home_client)
    } else {
        TokenReviewResolver::with_audiences(home_client, args.token_audiences.clone())
    };
    let state = ApiState {
        server,
        resolver: Arc::new(resolver),
    };

    tokio::spawn(shutdown_on_signal(shutdown.clone()));

    api::serve(config.listen_addr, api::router(state), shutdown.clone()).await?;

    shutdown.cancel();
    if let Err(e) = cache_task.await {
        warn!(error = %e, "Cache task did not stop cleanly");
    }
    info!("Fleet server stopped");
    Ok(())
}

async fn shutdown_on_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("Shutdown signal received");
    shutdown.cancel();
}
