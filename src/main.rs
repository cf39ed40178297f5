//! podtunnel CLI - forward local ports to a pod
//!
//! Each `-p LOCAL:REMOTE` mapping forwards one local connection to the pod
//! and then exits; mappings run concurrently and independently.

use anyhow::{bail, Context, Result};
use clap::{ArgGroup, Parser};
use futures::future::join_all;
use podtunnel_client::{
    load_kubeconfig, resolve_context, ApiWorkloadLocator, PortForward, PortMapping, StaticLocator,
    TunnelConfig, WorkloadLocator,
};
use podtunnel_transport::{SessionDialer, UpgradeDialer};
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// podtunnel - Forward local ports to a Kubernetes pod
#[derive(Parser, Debug)]
#[command(name = "podtunnel")]
#[command(about = "Forward local ports to a Kubernetes pod over the API server")]
#[command(version = env!("GIT_TAG"))]
#[command(group(ArgGroup::new("target").required(true).args(["selector", "pod"])))]
#[command(long_about = r#"
Forward one local connection per port mapping to a pod, through the API
server's portforward subresource.

EXAMPLES:
  # Forward localhost:3000 to port 8080 of the first running pod labelled app=web
  podtunnel -n shop -l app=web -p 3000:8080

  # Forward two ports of a named pod, picking a free local port for the second
  podtunnel --pod db-0 -p 5432 -p :9187

ENVIRONMENT VARIABLES:
  KUBECONFIG   Kubeconfig files to merge when --kubeconfig is not given
  RUST_LOG     Log filter (overridden by --verbose)
"#)]
struct Cli {
    /// Path to the kubeconfig file (defaults to $KUBECONFIG, then ~/.kube/config)
    #[arg(long)]
    kubeconfig: Option<PathBuf>,

    /// Kubeconfig context (defaults to current-context)
    #[arg(long)]
    context: Option<String>,

    /// Namespace (defaults to the context's namespace)
    #[arg(short, long)]
    namespace: Option<String>,

    /// Label selector used to pick the pod
    #[arg(short = 'l', long)]
    selector: Option<String>,

    /// Pod name
    #[arg(long)]
    pod: Option<String>,

    /// Port mapping LOCAL:REMOTE, PORT or :REMOTE (repeatable)
    #[arg(short = 'p', long = "port", required = true)]
    ports: Vec<PortMapping>,

    /// Local address to listen on
    #[arg(long, default_value = "127.0.0.1")]
    address: IpAddr,

    /// Give up waiting for a local connection after this many seconds (0 waits forever)
    #[arg(long)]
    accept_timeout: Option<u64>,

    /// Give up dialing the API server after this many seconds (0 waits forever)
    #[arg(long)]
    dial_timeout: Option<u64>,

    /// Give up waiting for a stream acknowledgement after this many seconds
    /// (default 30, 0 waits forever)
    #[arg(long)]
    stream_timeout: Option<u64>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn setup_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();
}

/// Seconds to a deadline; 0 means unbounded
fn deadline(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

fn tunnel_config(cli: &Cli, mapping: PortMapping) -> Result<TunnelConfig> {
    let mut builder = TunnelConfig::builder()
        .bind_address(cli.address)
        .mapping(mapping)
        .dial_timeout(cli.dial_timeout.and_then(deadline))
        .accept_timeout(cli.accept_timeout.and_then(deadline));
    if let Some(secs) = cli.stream_timeout {
        builder = builder.stream_create_timeout(deadline(secs));
    }
    builder
        .build()
        .map_err(|e| anyhow::anyhow!("Invalid mapping {}: {}", mapping, e))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose);

    info!(
        "podtunnel {} ({}, built {})",
        env!("GIT_TAG"),
        env!("GIT_HASH"),
        env!("BUILD_TIME")
    );

    let kubeconfig =
        load_kubeconfig(cli.kubeconfig.as_deref()).context("Failed to load kubeconfig")?;
    let context = resolve_context(kubeconfig, cli.context.as_deref())
        .await
        .context("Failed to resolve kubeconfig context")?;
    let namespace = cli.namespace.clone().unwrap_or(context.namespace.clone());

    info!(
        "Using context {} ({}), namespace {}",
        context.name, context.descriptor.server, namespace
    );

    let configs = cli
        .ports
        .iter()
        .map(|mapping| tunnel_config(&cli, *mapping))
        .collect::<Result<Vec<_>>>()?;

    let session_config = configs
        .first()
        .map(|c| c.session_config())
        .unwrap_or_default();
    let dialer: Arc<dyn SessionDialer> = Arc::new(
        UpgradeDialer::new(Arc::new(context.descriptor.endpoint()), session_config)
            .context("Failed to configure API server connection")?,
    );

    let locator: Box<dyn WorkloadLocator> = match &cli.pod {
        Some(pod) => Box::new(StaticLocator::new(pod.clone())),
        None => Box::new(
            ApiWorkloadLocator::new(context.config.clone(), cli.selector.clone())
                .context("Failed to configure pod lookup")?,
        ),
    };

    let total = configs.len();
    let forwards = join_all(configs.into_iter().map(|config| {
        let forward = PortForward::new(dialer.clone(), config);
        let locator = locator.as_ref();
        let namespace = namespace.as_str();
        async move {
            let mapping = forward.config().mapping;
            (mapping, forward.locate_and_run(locator, namespace).await)
        }
    }));

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let results = tokio::select! {
        _ = &mut ctrl_c => {
            info!("Received Ctrl+C, shutting down...");
            return Ok(());
        }
        results = forwards => results,
    };

    let mut failed = 0;
    for (mapping, outcome) in results {
        match outcome {
            Ok(stats) => info!(
                "{}: done ({} bytes sent, {} bytes received)",
                mapping, stats.local_to_remote, stats.remote_to_local
            ),
            Err(e) => {
                failed += 1;
                error!("{}: {} error: {}", mapping, e.component(), e);
            }
        }
    }

    if failed > 0 {
        bail!("{} of {} port forwards failed", failed, total);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(["podtunnel", "--pod", "web-0", "-p", "3000:8080"].iter().chain(args))
            .unwrap()
    }

    #[test]
    fn test_stream_timeout_defaults_and_unbounded() {
        let mapping = PortMapping::new(3000, 8080);

        let config = tunnel_config(&parse(&[]), mapping).unwrap();
        assert_eq!(
            config.stream_create_timeout,
            TunnelConfig::default().stream_create_timeout
        );

        let config = tunnel_config(&parse(&["--stream-timeout", "0"]), mapping).unwrap();
        assert_eq!(config.stream_create_timeout, None);

        let config = tunnel_config(&parse(&["--stream-timeout", "5"]), mapping).unwrap();
        assert_eq!(config.stream_create_timeout, Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_zero_means_no_deadline() {
        let cli = parse(&["--dial-timeout", "0", "--accept-timeout", "7"]);
        let config = tunnel_config(&cli, PortMapping::new(3000, 8080)).unwrap();

        assert_eq!(config.dial_timeout, None);
        assert_eq!(config.accept_timeout, Some(Duration::from_secs(7)));
    }

    #[test]
    fn test_kubeconfig_is_not_read_from_the_environment() {
        std::env::set_var("KUBECONFIG", "/tmp/a.yaml:/tmp/b.yaml");
        assert_eq!(parse(&[]).kubeconfig, None);
        std::env::remove_var("KUBECONFIG");
    }
}
