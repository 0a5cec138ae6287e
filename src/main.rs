use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use switchyard::config::{Config, Timeouts};
use switchyard::gateway::{AuthGate, GatewayRouter, MemorySecretStore, SecretStore};
use switchyard::http::Handler;
use switchyard::metrics::{MetricsEndpoint, MetricsSink, NoopMetrics, PrometheusMetrics};
use switchyard::proxy::health::{self, TcpDialer};
use switchyard::proxy::{LoadBalancer, ServerPool};
use switchyard::server;

#[derive(Parser)]
#[command(name = "switchyard")]
#[command(about = "Liveness-aware load balancer and authenticated API gateway")]
struct Cli {
    /// YAML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Round-robin load balancer over a static backend pool
    Lb {
        /// Comma-separated backend URLs
        #[arg(long)]
        backends: Option<String>,

        /// Port to serve on (all interfaces)
        #[arg(long)]
        port: Option<u16>,
    },

    /// Path-prefix API gateway
    Gateway {
        /// Port to serve on (all interfaces)
        #[arg(long)]
        port: Option<u16>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_level(true)
        .init();

    let cli = Cli::parse();
    let mut cfg = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::load(),
    };

    let prometheus = match &cfg.metrics.listen_addr {
        Some(_) => Some(Arc::new(PrometheusMetrics::new()?)),
        None => None,
    };
    let metrics: Arc<dyn MetricsSink> = match &prometheus {
        Some(p) => p.clone(),
        None => Arc::new(NoopMetrics),
    };
    if let (Some(addr), Some(p)) = (cfg.metrics.listen_addr.clone(), prometheus) {
        tokio::spawn(async move {
            if let Err(e) = server::listener::run(&addr, Arc::new(MetricsEndpoint::new(p))).await {
                tracing::error!(error = %e, "Metrics listener stopped");
            }
        });
    }

    let handler: Arc<dyn Handler> = match cli.command {
        Commands::Lb { backends, port } => {
            if let Some(backends) = backends {
                cfg.load_balancer.backends = backends;
            }
            if let Some(port) = port {
                cfg.server.listen_addr = format!("0.0.0.0:{}", port);
            }
            start_load_balancer(&cfg, metrics)?
        }
        Commands::Gateway { port } => {
            if let Some(port) = port {
                cfg.server.listen_addr = format!("0.0.0.0:{}", port);
            }
            start_gateway(&cfg, metrics)?
        }
    };

    tokio::select! {
        res = server::listener::run(&cfg.server.listen_addr, handler) => {
            res?;
        }

        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutdown signal received");
        }
    }

    Ok(())
}

fn start_load_balancer(
    cfg: &Config,
    metrics: Arc<dyn MetricsSink>,
) -> anyhow::Result<Arc<dyn Handler>> {
    let lb = &cfg.load_balancer;
    let pool = Arc::new(ServerPool::from_backend_list(&lb.backends, lb.timeouts())?);

    tokio::spawn(health::run(
        pool.clone(),
        Arc::new(TcpDialer),
        lb.health_check_interval(),
        lb.probe_timeout(),
    ));

    tracing::info!(backends = pool.len(), "Load Balancer started");
    Ok(Arc::new(LoadBalancer::new(pool, lb.backoff.policy(), metrics)))
}

fn start_gateway(
    cfg: &Config,
    metrics: Arc<dyn MetricsSink>,
) -> anyhow::Result<Arc<dyn Handler>> {
    cfg.validate_gateway()?;
    let gw = &cfg.gateway;

    let store = Arc::new(MemorySecretStore::new());
    if let Some(value) = &gw.api_key.value {
        match store.save(&gw.api_key.engine, &gw.api_key.key_name, value) {
            Ok(result) => tracing::info!(result = %result, "API key stored"),
            Err(e) => tracing::error!(error = %e, "Failed to store API key"),
        }
    }

    let gate = AuthGate::new(
        gw.jwt_secret.as_bytes(),
        store,
        gw.api_key.engine.clone(),
        gw.api_key.key_name.clone(),
    );
    let router = GatewayRouter::from_config(gw, gate, metrics, Timeouts::default())?;

    tracing::info!(endpoints = router.endpoints().len(), "API Gateway started");
    Ok(Arc::new(router))
}
