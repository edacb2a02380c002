//! capbroker server binary.
//!
//! Serves the capability broker over WebSocket until Ctrl-C, then drains.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use capbroker_core::{EngineConfig, IdStrategy};
use capbroker_server::network::{NetworkConfig, NetworkModule, TlsConfig};
use capbroker_server::service::{ContextBinding, ServerConfig};
use clap::{Parser, ValueEnum};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "capbroker")]
#[command(about = "Capability broker: routes invocations between consumer and provider apps")]
struct Args {
    /// Address to bind.
    #[arg(long, env = "CAPBROKER_HOST", default_value = "0.0.0.0")]
    host: String,

    /// Port to bind; 0 picks an ephemeral port.
    #[arg(long, env = "CAPBROKER_PORT", default_value_t = 9998)]
    port: u16,

    /// PEM certificate; enables TLS together with `--tls-key`.
    #[arg(long, env = "CAPBROKER_TLS_CERT", value_name = "PATH", requires = "tls_key")]
    tls_cert: Option<PathBuf>,

    /// PEM private key.
    #[arg(long, env = "CAPBROKER_TLS_KEY", value_name = "PATH", requires = "tls_cert")]
    tls_key: Option<PathBuf>,

    /// Drop pending correlations older than this many seconds.
    #[arg(long, env = "CAPBROKER_CORRELATION_TTL_SECS", value_name = "SECS")]
    correlation_ttl_secs: Option<u64>,

    /// Correlation handle format.
    #[arg(long, env = "CAPBROKER_ID_STRATEGY", value_enum, default_value_t = IdArg::Uuid)]
    id_strategy: IdArg,

    /// Where `context.connectionId` comes from.
    #[arg(long, env = "CAPBROKER_CONTEXT_BINDING", value_enum, default_value_t = BindingArg::Transport)]
    context_binding: BindingArg,

    /// Operations allowed in flight before load shedding.
    #[arg(long, env = "CAPBROKER_MAX_CONCURRENT", default_value_t = 1000)]
    max_concurrent: u32,

    /// Per-operation timeout in milliseconds.
    #[arg(long, env = "CAPBROKER_OPERATION_TIMEOUT_MS", default_value_t = 30_000)]
    operation_timeout_ms: u64,

    /// Emit logs as JSON lines.
    #[arg(long, env = "CAPBROKER_LOG_JSON")]
    log_json: bool,

    /// Serve Prometheus metrics on this address.
    #[arg(long, env = "CAPBROKER_METRICS_ADDR", value_name = "ADDR")]
    metrics_addr: Option<SocketAddr>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum IdArg {
    Uuid,
    Sequential,
}

impl From<IdArg> for IdStrategy {
    fn from(arg: IdArg) -> Self {
        match arg {
            IdArg::Uuid => Self::Uuid,
            IdArg::Sequential => Self::Sequential,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum BindingArg {
    Transport,
    Declared,
}

impl From<BindingArg> for ContextBinding {
    fn from(arg: BindingArg) -> Self {
        match arg {
            BindingArg::Transport => Self::Transport,
            BindingArg::Declared => Self::Declared,
        }
    }
}

impl Args {
    fn network_config(&self) -> NetworkConfig {
        let tls = match (&self.tls_cert, &self.tls_key) {
            (Some(cert_path), Some(key_path)) => Some(TlsConfig {
                cert_path: cert_path.clone(),
                key_path: key_path.clone(),
            }),
            _ => None,
        };
        NetworkConfig {
            host: self.host.clone(),
            port: self.port,
            tls,
            ..NetworkConfig::default()
        }
    }

    fn server_config(&self) -> ServerConfig {
        ServerConfig {
            engine: EngineConfig {
                id_strategy: self.id_strategy.into(),
                correlation_ttl: self.correlation_ttl_secs.map(Duration::from_secs),
            },
            default_operation_timeout_ms: self.operation_timeout_ms,
            max_concurrent_operations: self.max_concurrent,
            context_binding: self.context_binding.into(),
            ..ServerConfig::default()
        }
    }
}

fn setup_tracing(json: bool) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("capbroker_server=info,capbroker_core=info,warn"));

    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    setup_tracing(args.log_json);

    if let Some(addr) = args.metrics_addr {
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .context("failed to start Prometheus exporter")?;
        info!(%addr, "Prometheus exporter listening");
    }

    let mut module = NetworkModule::new(args.network_config(), args.server_config());
    let port = module.start().await?;
    info!(port, binding = ?args.context_binding, "capbroker starting");

    module
        .serve(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %err, "failed to listen for Ctrl-C");
                std::future::pending::<()>().await;
            }
            info!("shutdown signal received");
        })
        .await
}
