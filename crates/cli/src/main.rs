#![forbid(unsafe_code)]

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use kindex_api::{ApiControl, ApiWatcher, ControlOptions};
use kindex_kubehub::{ClientSettings, KubeconfigRef, TlsFiles};
use kindex_plugins::query::reverse_name;
use kindex_plugins::{Chain, Kubernetes, KubernetesOptions, PodNames, PodNamesOptions, QType, Query, Resolver};
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const STATUS_EVERY: Duration = Duration::from_secs(30);

#[derive(Parser, Debug)]
#[command(name = "kindexd", version, about = "Watches cluster objects and answers their DNS names")]
struct Cli {
    #[command(flatten)]
    transport: Transport,

    #[command(flatten)]
    scope: Scope,

    /// Zones answered by the kubernetes resolver
    #[arg(long = "zone", global = true, env = "KINDEX_ZONES", value_delimiter = ',', default_values = ["cluster.local", "in-addr.arpa", "ip6.arpa"])]
    zones: Vec<String>,

    /// TTL of every answer, in seconds
    #[arg(long, global = true, env = "KINDEX_TTL", default_value_t = 5, value_parser = clap::value_parser!(u32).range(0..=3600))]
    ttl: u32,

    /// Zones answered by the pod-name resolver; empty disables it
    #[arg(long = "pod-zone", global = true, env = "KINDEX_POD_ZONES", value_delimiter = ',')]
    pod_zones: Vec<String>,

    /// Seconds to wait for the initial sync before serving anyway
    #[arg(long, global = true, env = "KINDEX_SYNC_TIMEOUT_SECS", default_value_t = 5)]
    sync_timeout_secs: u64,

    /// Pause after a failed list or watch before listing again
    #[arg(long, global = true, env = "KINDEX_RELIST_PAUSE_MS", default_value_t = 1000)]
    relist_pause_ms: u64,

    /// Log filter directives
    #[arg(long, global = true, env = "KINDEX_LOG", default_value = "info")]
    log: String,

    /// Serve Prometheus metrics on this host:port
    #[arg(long, global = true, env = "KINDEX_METRICS_ADDR")]
    metrics_addr: Option<SocketAddr>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug)]
struct Transport {
    /// API server URL
    #[arg(long, global = true, env = "KINDEX_ENDPOINT")]
    endpoint: Option<String>,

    /// Client certificate, key and CA bundle for the endpoint
    #[arg(long, global = true, env = "KINDEX_TLS", num_args = 3, value_delimiter = ' ', value_names = ["CERT", "KEY", "CA"])]
    tls: Option<Vec<PathBuf>>,

    /// Kubeconfig file; needs --context
    #[arg(long, global = true, env = "KINDEX_KUBECONFIG", requires = "context")]
    kubeconfig: Option<PathBuf>,

    /// Context within --kubeconfig
    #[arg(long, global = true, env = "KINDEX_CONTEXT", requires = "kubeconfig")]
    context: Option<String>,
}

#[derive(Args, Debug)]
struct Scope {
    /// Only watch objects matching this label selector
    #[arg(long, global = true, env = "KINDEX_LABEL_SELECTOR")]
    label_selector: Option<String>,

    /// Only expose namespaces matching this label selector
    #[arg(long, global = true, env = "KINDEX_NAMESPACE_LABEL_SELECTOR")]
    namespace_label_selector: Option<String>,

    /// Namespaces whose names resolve (default: all)
    #[arg(long = "namespaces", global = true, env = "KINDEX_NAMESPACES", value_delimiter = ',')]
    namespaces: Vec<String>,

    /// Do not watch pods
    #[arg(long, global = true, env = "KINDEX_NO_PODS", action = ArgAction::SetTrue)]
    no_pods: bool,

    /// Do not watch endpoints
    #[arg(long, global = true, env = "KINDEX_NO_ENDPOINTS", action = ArgAction::SetTrue)]
    no_endpoints: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Keep the watches running and log a status line until Ctrl-C
    Serve,
    /// Answer a single query
    Resolve {
        /// Name to look up; an IP address is turned into its PTR name
        name: String,
        /// a, aaaa or ptr (default: ptr for addresses, a otherwise)
        #[arg(long = "type", short = 't')]
        qtype: Option<String>,
    },
    /// Print one store as JSON
    Dump {
        /// Watch name: service, pod, endpoints or namespace
        watch: String,
    },
}

fn init_tracing(directives: &str) {
    let filter = EnvFilter::try_new(directives).unwrap_or_else(|e| {
        eprintln!("ignoring log directives {directives:?}: {e}");
        EnvFilter::new("info")
    });
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics(addr: Option<SocketAddr>) {
    let Some(addr) = addr else { return };
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => info!(%addr, "serving Prometheus metrics"),
        Err(e) => warn!(%addr, error = %e, "metrics exporter not installed"),
    }
}

impl Transport {
    fn settings(&self) -> Result<ClientSettings> {
        let tls = match self.tls.as_deref() {
            None => None,
            Some([cert, key, ca]) => Some(TlsFiles { cert: cert.clone(), key: key.clone(), ca: ca.clone() }),
            Some(other) => bail!("--tls takes exactly three paths, got {}", other.len()),
        };
        if tls.is_some() && self.endpoint.is_none() {
            warn!("--tls is ignored without --endpoint");
        }
        let kubeconfig = match (&self.kubeconfig, &self.context) {
            (Some(path), Some(context)) => Some(KubeconfigRef { path: path.clone(), context: context.clone() }),
            _ => None,
        };
        Ok(ClientSettings { endpoint: self.endpoint.clone(), tls, kubeconfig })
    }
}

struct Resolvers {
    consumers: Vec<Arc<dyn ApiWatcher>>,
    chain: Chain,
}

fn resolvers(cli: &Cli) -> Resolvers {
    let kubernetes = Arc::new(Kubernetes::new(KubernetesOptions {
        zones: cli.zones.clone(),
        ttl: cli.ttl,
        label_selector: cli.scope.label_selector.clone(),
        namespace_label_selector: cli.scope.namespace_label_selector.clone(),
        namespaces: cli.scope.namespaces.clone(),
        init_pod_cache: !cli.scope.no_pods,
        init_endpoints_cache: !cli.scope.no_endpoints,
    }));
    let mut consumers: Vec<Arc<dyn ApiWatcher>> = vec![kubernetes.clone() as Arc<dyn ApiWatcher>];
    let mut chain: Vec<Arc<dyn Resolver>> = vec![kubernetes as Arc<dyn Resolver>];
    if !cli.pod_zones.is_empty() {
        if cli.scope.no_pods {
            warn!("pod-name zones configured without a pod watch; their lookups will fail");
        }
        let podnames = Arc::new(PodNames::new(PodNamesOptions { zones: cli.pod_zones.clone(), ttl: cli.ttl }));
        consumers.push(podnames.clone());
        chain.push(podnames);
    }
    Resolvers { consumers, chain: Chain::new(chain) }
}

async fn start(cli: &Cli, consumers: Vec<Arc<dyn ApiWatcher>>) -> Result<ApiControl> {
    let settings = cli.transport.settings()?;
    let client = kindex_api::connect(&settings).await.context("connecting to the API server")?;
    let opts = ControlOptions {
        sync_timeout: Duration::from_secs(cli.sync_timeout_secs),
        relist_pause: Duration::from_millis(cli.relist_pause_ms),
    };
    Ok(kindex_api::start(client, consumers, opts).await?)
}

async fn shutdown(control: ApiControl) -> Result<()> {
    control.stop()?;
    control.join().await;
    Ok(())
}

fn log_status(control: &ApiControl) {
    let sizes: Vec<String> = control
        .watch_names()
        .into_iter()
        .map(|name| format!("{}={}", name, control.lister(name).map(|l| l.len()).unwrap_or(0)))
        .collect();
    info!(synced = control.has_synced(), modified = control.modified(), stores = %sizes.join(","), "status");
}

fn parse_query(name: &str, qtype: Option<&str>) -> Result<Query> {
    let qtype = qtype.map(QType::from_str).transpose().map_err(anyhow::Error::msg)?;
    Ok(match name.parse::<IpAddr>() {
        Ok(ip) => Query::new(&reverse_name(ip), qtype.unwrap_or(QType::Ptr)),
        Err(_) => Query::new(name, qtype.unwrap_or(QType::A)),
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log);
    init_metrics(cli.metrics_addr);
    let Resolvers { consumers, chain } = resolvers(&cli);

    match &cli.command {
        Commands::Serve => {
            let control = start(&cli, consumers).await?;
            log_status(&control);
            let mut ticker = tokio::time::interval(STATUS_EVERY);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => log_status(&control),
                    res = signal::ctrl_c() => {
                        if let Err(e) = res {
                            warn!(error = %e, "ctrl-c handler failed");
                        }
                        info!("shutting down");
                        break;
                    }
                }
            }
            shutdown(control).await?;
        }
        Commands::Resolve { name, qtype } => {
            let query = parse_query(name, qtype.as_deref())?;
            let control = start(&cli, consumers).await?;
            let response = chain.resolve(&query);
            println!(";; {} {} status: {:?}", query.name, query.qtype, response.rcode);
            for record in &response.answers {
                println!("{}", record);
            }
            shutdown(control).await?;
        }
        Commands::Dump { watch } => {
            let control = start(&cli, consumers).await?;
            let Some(lister) = control.lister(watch) else {
                let known = control.watch_names().join(", ");
                shutdown(control).await?;
                bail!("no watch named {:?} (known: {})", watch, known);
            };
            println!("{}", serde_json::to_string_pretty(&lister.to_json()?)?);
            shutdown(control).await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_map_onto_client_settings() {
        let cli = Cli::parse_from([
            "kindexd",
            "--endpoint",
            "https://10.0.0.1:6443",
            "--tls",
            "/t/cert",
            "/t/key",
            "/t/ca",
            "resolve",
            "svc-a.ns1.svc.cluster.local",
        ]);
        let settings = cli.transport.settings().expect("settings");
        assert_eq!(settings.endpoint.as_deref(), Some("https://10.0.0.1:6443"));
        assert_eq!(settings.tls.map(|t| t.ca), Some(PathBuf::from("/t/ca")));
        assert!(settings.kubeconfig.is_none());
    }

    #[test]
    fn context_requires_kubeconfig() {
        assert!(Cli::try_parse_from(["kindexd", "--context", "prod", "serve"]).is_err());
        let cli = Cli::parse_from(["kindexd", "--kubeconfig", "/k/config", "--context", "prod", "serve"]);
        let kc = cli.transport.settings().expect("settings").kubeconfig.expect("kubeconfig");
        assert_eq!(kc.context, "prod");
    }

    #[test]
    fn metrics_address_must_be_host_port() {
        assert!(Cli::try_parse_from(["kindexd", "--metrics-addr", "localhost", "serve"]).is_err());
        let cli = Cli::parse_from(["kindexd", "--metrics-addr", "127.0.0.1:9090", "serve"]);
        assert_eq!(cli.metrics_addr, Some("127.0.0.1:9090".parse().expect("addr")));
    }

    #[test]
    fn ttl_is_bounded() {
        assert!(Cli::try_parse_from(["kindexd", "--ttl", "3601", "serve"]).is_err());
        assert_eq!(Cli::parse_from(["kindexd", "serve"]).ttl, 5);
    }

    #[test]
    fn podnames_joins_the_chain_only_with_zones() {
        let cli = Cli::parse_from(["kindexd", "serve"]);
        assert_eq!(resolvers(&cli).consumers.len(), 1);
        let cli = Cli::parse_from(["kindexd", "--pod-zone", "pods.local", "serve"]);
        assert_eq!(resolvers(&cli).consumers.len(), 2);
    }

    #[test]
    fn addresses_become_ptr_queries() {
        let q = parse_query("10.0.0.5", None).expect("query");
        assert_eq!((q.name.as_str(), q.qtype), ("5.0.0.10.in-addr.arpa.", QType::Ptr));
        let q = parse_query("Svc-A.ns1.svc.cluster.local", Some("aaaa")).expect("query");
        assert_eq!((q.name.as_str(), q.qtype), ("svc-a.ns1.svc.cluster.local.", QType::Aaaa));
        assert!(parse_query("x", Some("mx")).is_err());
    }
}
