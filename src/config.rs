//! Command line configuration.
//!
//! Everything is parsed once into owned values and handed to constructors;
//! there is no process-wide configuration state. Validation happens before
//! any external call is made.

use std::net::IpAddr;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};

use crate::error::{Error, Result};
use crate::provider::{DEFAULT_ENV_PREFIX, EtcdKind, ProviderConfig, ProviderKind};
use crate::retry::RetryPolicy;

/// Discover replica addresses and reconcile them into Kubernetes Endpoints.
#[derive(Parser, Debug)]
#[command(name = "k8s-endpoint-updater", version, about, long_about = None)]
pub struct Cli {
    /// Cluster connection and target service.
    #[command(flatten)]
    pub kubernetes: KubernetesArgs,

    /// Retry ceilings.
    #[command(flatten)]
    pub retry: RetryArgs,

    /// What to do.
    #[command(subcommand)]
    pub command: Command,
}

/// Subcommands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Discover replicas and merge their addresses into the service's Endpoints
    Update(UpdateArgs),

    /// Remove addresses from the service's Endpoints
    Remove(RemoveArgs),
}

/// Cluster connection and target service.
#[derive(Args, Debug, Clone)]
pub struct KubernetesArgs {
    /// API server address. When empty, kubeconfig or in-cluster settings are
    /// inferred.
    #[arg(long, env = "KUBERNETES_ADDRESS", global = true)]
    pub kubernetes_address: Option<String>,

    /// Use the in-cluster service account configuration.
    #[arg(long, global = true)]
    pub kubernetes_in_cluster: bool,

    /// Namespace of the service whose Endpoints are updated.
    #[arg(long, env = "K8S_ENDPOINT_UPDATER_NAMESPACE", default_value = "default", global = true)]
    pub namespace: String,

    /// Name of the service whose Endpoints are updated.
    #[arg(long, env = "K8S_ENDPOINT_UPDATER_SERVICE", default_value = "", global = true)]
    pub service: String,
}

impl KubernetesArgs {
    /// Checks the target and connection settings.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] on empty or contradictory settings.
    pub fn validate(&self) -> Result<()> {
        if self.namespace.is_empty() {
            return Err(Error::invalid_config("namespace must not be empty"));
        }
        if self.service.is_empty() {
            return Err(Error::invalid_config("service must not be empty"));
        }
        let has_address = self
            .kubernetes_address
            .as_deref()
            .is_some_and(|a| !a.is_empty());
        if self.kubernetes_in_cluster && has_address {
            return Err(Error::invalid_config(
                "kubernetes address and in-cluster config are mutually exclusive",
            ));
        }

        Ok(())
    }

    /// Builds a Kubernetes client from these settings.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if no usable configuration is found.
    pub async fn client(&self) -> Result<kube::Client> {
        let config = if self.kubernetes_in_cluster {
            kube::Config::incluster()
                .map_err(|e| Error::invalid_config(format!("in-cluster config: {e}")))?
        } else if let Some(address) = self.kubernetes_address.as_deref().filter(|a| !a.is_empty()) {
            let url = address.parse().map_err(|e| {
                Error::invalid_config(format!("kubernetes address '{address}': {e}"))
            })?;
            kube::Config::new(url)
        } else {
            kube::Config::infer()
                .await
                .map_err(|e| Error::invalid_config(format!("inferring kube config: {e}")))?
        };

        kube::Client::try_from(config)
            .map_err(|e| Error::invalid_config(format!("building kube client: {e}")))
    }
}

/// Retry ceilings, shared by discovery and the record write.
#[derive(Args, Debug, Clone)]
pub struct RetryArgs {
    /// Give up retrying after this many seconds.
    #[arg(long, default_value_t = 600, global = true)]
    pub retry_max_elapsed_secs: u64,

    /// Upper bound in seconds for a single wait between attempts.
    #[arg(
        long,
        default_value_t = 60,
        value_parser = clap::value_parser!(u64).range(1..),
        global = true
    )]
    pub retry_max_interval_secs: u64,
}

impl RetryArgs {
    /// The resulting backoff policy.
    #[must_use]
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            Duration::from_secs(self.retry_max_elapsed_secs),
            Duration::from_secs(self.retry_max_interval_secs),
        )
    }
}

/// Arguments of the `update` subcommand.
#[derive(Args, Debug, Clone)]
pub struct UpdateArgs {
    /// Discovery backend settings.
    #[command(flatten)]
    pub provider: ProviderArgs,

    /// Keep the process alive after a successful update.
    #[arg(long)]
    pub wait_forever: bool,
}

/// Discovery backend settings.
#[derive(Args, Debug, Clone)]
pub struct ProviderArgs {
    /// Backend used to look up pod IPs.
    #[arg(long, value_enum, default_value_t = ProviderKind::Env)]
    pub provider_kind: ProviderKind,

    /// Bridge interface of the guest VM on the host network.
    #[arg(long, default_value = "")]
    pub provider_bridge_name: String,

    /// Prefix of environment variables holding pod IPs.
    #[arg(long, default_value = DEFAULT_ENV_PREFIX)]
    pub provider_env_prefix: String,

    /// Address of the etcd server.
    #[arg(long, default_value = "")]
    pub provider_etcd_address: String,

    /// etcd API version to use.
    #[arg(long, value_enum, default_value_t = EtcdKind::V2)]
    pub provider_etcd_kind: EtcdKind,

    /// Prefix of etcd keys holding pod IPs.
    #[arg(long, default_value = "")]
    pub provider_etcd_prefix: String,

    /// Names of the pods to look up, comma separated.
    #[arg(long, env = "K8S_ENDPOINT_UPDATER_POD_NAMES", value_delimiter = ',')]
    pub pod_names: Vec<String>,
}

impl ProviderArgs {
    /// Checks that the selected backend has what it needs.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] naming the first missing setting.
    pub fn validate(&self) -> Result<()> {
        match self.provider_kind {
            ProviderKind::Bridge => {
                if self.provider_bridge_name.is_empty() {
                    return Err(Error::invalid_config("bridge name must not be empty"));
                }
            }
            ProviderKind::Env => {
                if self.provider_env_prefix.is_empty() {
                    return Err(Error::invalid_config("env prefix must not be empty"));
                }
                self.validate_pod_names()?;
            }
            ProviderKind::Etcd => {
                if self.provider_etcd_address.is_empty() {
                    return Err(Error::invalid_config("etcd address must not be empty"));
                }
                self.validate_pod_names()?;
            }
        }

        Ok(())
    }

    fn validate_pod_names(&self) -> Result<()> {
        if self.pod_names.is_empty() {
            return Err(Error::invalid_config("pod names must not be empty"));
        }
        if self.pod_names.iter().any(|n| n.trim().is_empty()) {
            return Err(Error::invalid_config("pod names must not contain empty names"));
        }
        Ok(())
    }

    /// Converts into the provider configuration.
    #[must_use]
    pub fn to_config(&self) -> ProviderConfig {
        ProviderConfig {
            kind: self.provider_kind,
            bridge_name: self.provider_bridge_name.clone(),
            env_prefix: self.provider_env_prefix.clone(),
            etcd_address: self.provider_etcd_address.clone(),
            etcd_kind: self.provider_etcd_kind,
            etcd_prefix: self.provider_etcd_prefix.clone(),
            pod_names: self.pod_names.iter().map(|n| n.trim().to_string()).collect(),
        }
    }
}

/// Arguments of the `remove` subcommand.
#[derive(Args, Debug, Clone)]
pub struct RemoveArgs {
    /// Address to remove; repeat for several.
    #[arg(long = "address", required = true)]
    pub addresses: Vec<IpAddr>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        let argv = std::iter::once("k8s-endpoint-updater").chain(args.iter().copied());
        Cli::try_parse_from(argv).unwrap()
    }

    #[test]
    fn cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn update_defaults() {
        let cli = parse(&["--service", "master", "update", "--pod-names", "a,b"]);

        assert_eq!(cli.kubernetes.namespace, "default");
        assert_eq!(cli.kubernetes.service, "master");
        assert_eq!(cli.retry.policy().max_elapsed, Duration::from_secs(600));

        let Command::Update(args) = cli.command else {
            panic!("expected update command");
        };
        assert_eq!(args.provider.provider_kind, ProviderKind::Env);
        assert_eq!(args.provider.provider_env_prefix, DEFAULT_ENV_PREFIX);
        assert_eq!(args.provider.provider_etcd_kind, EtcdKind::V2);
        assert_eq!(args.provider.pod_names, vec!["a", "b"]);
        assert!(!args.wait_forever);
        assert!(args.provider.validate().is_ok());
    }

    #[test]
    fn global_args_after_subcommand() {
        let cli = parse(&[
            "update",
            "--provider-kind",
            "bridge",
            "--provider-bridge-name",
            "br-abc",
            "--namespace",
            "kvm",
            "--service",
            "master",
            "--retry-max-elapsed-secs",
            "30",
        ]);

        assert_eq!(cli.kubernetes.namespace, "kvm");
        assert_eq!(cli.retry.policy().max_elapsed, Duration::from_secs(30));
        let Command::Update(args) = cli.command else {
            panic!("expected update command");
        };
        assert_eq!(args.provider.provider_kind, ProviderKind::Bridge);
        assert!(args.provider.validate().is_ok());
    }

    #[test]
    fn etcd_kind_values() {
        let cli = parse(&[
            "update",
            "--provider-kind",
            "etcd",
            "--provider-etcd-kind",
            "etcdv3",
            "--provider-etcd-address",
            "http://127.0.0.1:2379",
            "--pod-names",
            "master-1",
        ]);

        let Command::Update(args) = cli.command else {
            panic!("expected update command");
        };
        assert_eq!(args.provider.provider_etcd_kind, EtcdKind::V3);
        let config = args.provider.to_config();
        assert_eq!(config.kind, ProviderKind::Etcd);
        assert_eq!(config.pod_names, vec!["master-1"]);
    }

    #[test]
    fn retry_interval_must_be_positive() {
        let result = Cli::try_parse_from([
            "k8s-endpoint-updater",
            "--retry-max-interval-secs",
            "0",
            "remove",
            "--address",
            "10.0.0.1",
        ]);
        assert!(result.is_err());

        let cli = parse(&["--retry-max-interval-secs", "1", "remove", "--address", "10.0.0.1"]);
        assert_eq!(cli.retry.policy().max_interval, Duration::from_secs(1));
    }

    #[test]
    fn remove_requires_an_address() {
        let result = Cli::try_parse_from(["k8s-endpoint-updater", "--service", "api", "remove"]);
        assert!(result.is_err());

        let cli = parse(&["remove", "--address", "10.0.0.1", "--address", "10.0.0.2"]);
        let Command::Remove(args) = cli.command else {
            panic!("expected remove command");
        };
        assert_eq!(args.addresses.len(), 2);
    }

    #[test]
    fn remove_rejects_invalid_address() {
        let result = Cli::try_parse_from(["k8s-endpoint-updater", "remove", "--address", "nope"]);
        assert!(result.is_err());
    }

    #[test]
    fn kubernetes_validation() {
        let cli = parse(&["update", "--pod-names", "a"]);
        assert!(matches!(cli.kubernetes.validate(), Err(Error::InvalidConfig(_))));

        let mut kubernetes = parse(&["--service", "api", "update", "--pod-names", "a"]).kubernetes;
        assert!(kubernetes.validate().is_ok());

        kubernetes.kubernetes_in_cluster = true;
        kubernetes.kubernetes_address = Some("https://10.0.0.1:6443".to_string());
        assert!(matches!(kubernetes.validate(), Err(Error::InvalidConfig(_))));

        kubernetes.kubernetes_in_cluster = false;
        kubernetes.namespace = String::new();
        assert!(matches!(kubernetes.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn provider_validation_per_kind() {
        let base = ProviderArgs {
            provider_kind: ProviderKind::Env,
            provider_bridge_name: String::new(),
            provider_env_prefix: DEFAULT_ENV_PREFIX.to_string(),
            provider_etcd_address: String::new(),
            provider_etcd_kind: EtcdKind::V2,
            provider_etcd_prefix: String::new(),
            pod_names: Vec::new(),
        };

        // env without pod names
        assert!(matches!(base.validate(), Err(Error::InvalidConfig(_))));

        let env_empty_prefix = ProviderArgs {
            provider_env_prefix: String::new(),
            pod_names: vec!["a".to_string()],
            ..base.clone()
        };
        assert!(matches!(env_empty_prefix.validate(), Err(Error::InvalidConfig(_))));

        let bridge = ProviderArgs {
            provider_kind: ProviderKind::Bridge,
            ..base.clone()
        };
        assert!(matches!(bridge.validate(), Err(Error::InvalidConfig(_))));

        let etcd = ProviderArgs {
            provider_kind: ProviderKind::Etcd,
            provider_etcd_address: "http://127.0.0.1:2379".to_string(),
            pod_names: vec!["a".to_string(), " ".to_string()],
            ..base
        };
        assert!(matches!(etcd.validate(), Err(Error::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn client_rejects_malformed_address() {
        let kubernetes = KubernetesArgs {
            kubernetes_address: Some("not a url".to_string()),
            kubernetes_in_cluster: false,
            namespace: "default".to_string(),
            service: "api".to_string(),
        };

        assert!(matches!(kubernetes.client().await, Err(Error::InvalidConfig(_))));
    }
}
