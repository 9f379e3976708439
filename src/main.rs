//! k8s-endpoint-updater - publish replica addresses as Kubernetes Endpoints

use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use k8s_endpoint_updater::config::{Cli, Command};
use k8s_endpoint_updater::{KubeEndpointStore, PodInfo, Provider, Reconciler, Result};

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    // kube and reqwest both pull in rustls; pick the provider explicitly.
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!("failed to install crypto provider: {e:?}");
        return ExitCode::FAILURE;
    }

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "endpoint update failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    cli.kubernetes.validate()?;

    let namespace = cli.kubernetes.namespace.as_str();
    let service = cli.kubernetes.service.as_str();

    match &cli.command {
        Command::Update(args) => {
            args.provider.validate()?;
            let provider = Provider::from_config(&args.provider.to_config())?;

            let reconciler = Reconciler::new(KubeEndpointStore::new(cli.kubernetes.client().await?))
                .discovery_retry(cli.retry.policy())
                .write_retry(cli.retry.policy());

            info!(%namespace, %service, provider = %provider.kind(), "updating endpoints");
            let pods = reconciler.converge(&provider, namespace, service).await?;
            info!(%namespace, %service, pods = pods.len(), "finished updating endpoints");

            if args.wait_forever {
                info!("waiting forever");
                std::future::pending::<()>().await;
            }
        }

        Command::Remove(args) => {
            let gone: Vec<PodInfo> = args.addresses.iter().copied().map(PodInfo::unnamed).collect();

            let reconciler = Reconciler::new(KubeEndpointStore::new(cli.kubernetes.client().await?))
                .write_retry(cli.retry.policy());

            info!(%namespace, %service, addresses = gone.len(), "removing endpoint addresses");
            reconciler.remove(namespace, service, &gone).await?;
            info!(%namespace, %service, "finished removing endpoint addresses");
        }
    }

    Ok(())
}
