//! Replica discovery backends.
//!
//! A [`Provider`] yields the [`PodInfo`] of every replica whose address should
//! be published. Exactly one backend is active per invocation:
//!
//! - [`BridgeProvider`]: derives the single replica address from a local
//!   bridge interface.
//! - [`EnvProvider`]: reads one environment variable per replica name.
//! - [`EtcdProvider`]: reads one key per replica name from a key/value store.

mod bridge;
mod env;
mod etcd;

use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

pub use bridge::BridgeProvider;
pub use env::{DEFAULT_ENV_PREFIX, EnvProvider, pod_name_to_env_var};
pub use etcd::{EtcdClient, EtcdKind, EtcdProvider, KeyValueStore};

use crate::error::Result;

/// A discovered replica.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PodInfo {
    /// Replica name, when the backend knows it.
    pub name: Option<String>,
    /// Replica address.
    pub ip: IpAddr,
}

impl PodInfo {
    /// Creates a named replica.
    #[must_use]
    pub fn new(name: impl Into<String>, ip: IpAddr) -> Self {
        Self {
            name: Some(name.into()),
            ip,
        }
    }

    /// Creates a replica known only by its address.
    #[must_use]
    pub fn unnamed(ip: IpAddr) -> Self {
        Self { name: None, ip }
    }
}

impl From<IpAddr> for PodInfo {
    fn from(ip: IpAddr) -> Self {
        Self::unnamed(ip)
    }
}

/// Discovery backend kinds selectable from configuration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum ProviderKind {
    /// Increment the IPv4 address of a local bridge interface.
    Bridge,
    /// Read replica addresses from environment variables.
    Env,
    /// Read replica addresses from etcd.
    Etcd,
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Bridge => "bridge",
            Self::Env => "env",
            Self::Etcd => "etcd",
        })
    }
}

/// Settings for every backend; only those of the selected kind are used.
#[derive(Clone, Debug)]
pub struct ProviderConfig {
    /// Which backend to build.
    pub kind: ProviderKind,
    /// Interface inspected by the bridge backend.
    pub bridge_name: String,
    /// Variable name prefix used by the env backend.
    pub env_prefix: String,
    /// Base URL of the etcd server.
    pub etcd_address: String,
    /// etcd API flavour.
    pub etcd_kind: EtcdKind,
    /// Prefix prepended to every etcd key.
    pub etcd_prefix: String,
    /// Expected replica names for the env and etcd backends.
    pub pod_names: Vec<String>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            kind: ProviderKind::Env,
            bridge_name: String::new(),
            env_prefix: DEFAULT_ENV_PREFIX.to_string(),
            etcd_address: String::new(),
            etcd_kind: EtcdKind::V2,
            etcd_prefix: String::new(),
            pod_names: Vec::new(),
        }
    }
}

/// The active discovery backend.
#[derive(Debug)]
pub enum Provider {
    /// See [`BridgeProvider`].
    Bridge(BridgeProvider),
    /// See [`EnvProvider`].
    Env(EnvProvider),
    /// See [`EtcdProvider`].
    Etcd(EtcdProvider),
}

impl Provider {
    /// Builds the backend selected by `config.kind`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::InvalidConfig`] when a setting required by the
    /// selected backend is missing.
    pub fn from_config(config: &ProviderConfig) -> Result<Self> {
        match config.kind {
            ProviderKind::Bridge => Ok(Self::Bridge(BridgeProvider::new(&config.bridge_name)?)),
            ProviderKind::Env => Ok(Self::Env(EnvProvider::new(
                config.pod_names.clone(),
                &config.env_prefix,
            )?)),
            ProviderKind::Etcd => {
                let client = EtcdClient::new(&config.etcd_address, config.etcd_kind)?;
                Ok(Self::Etcd(EtcdProvider::new(
                    Arc::new(client),
                    config.pod_names.clone(),
                    &config.etcd_prefix,
                )?))
            }
        }
    }

    /// The kind of this backend.
    #[must_use]
    pub fn kind(&self) -> ProviderKind {
        match self {
            Self::Bridge(_) => ProviderKind::Bridge,
            Self::Env(_) => ProviderKind::Env,
            Self::Etcd(_) => ProviderKind::Etcd,
        }
    }

    /// Discovers the current replicas.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Discovery`] when the backend fails. The bridge and
    /// etcd backends are all-or-nothing.
    pub async fn lookup(&self) -> Result<Vec<PodInfo>> {
        match self {
            Self::Bridge(p) => p.lookup(),
            Self::Env(p) => Ok(p.lookup()),
            Self::Etcd(p) => p.lookup().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;
    use crate::Error;

    #[test]
    fn provider_kind_display_matches_cli_value() {
        use clap::ValueEnum;

        for kind in ProviderKind::value_variants() {
            assert_eq!(ProviderKind::from_str(&kind.to_string(), false), Ok(*kind));
        }
        assert!(ProviderKind::from_str("dns", false).is_err());
    }

    #[test]
    fn pod_info_constructors() {
        let ip = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));

        let named = PodInfo::new("worker-1", ip);
        assert_eq!(named.name.as_deref(), Some("worker-1"));

        let unnamed: PodInfo = ip.into();
        assert!(unnamed.name.is_none());
        assert_eq!(unnamed.ip, ip);
    }

    #[test]
    fn from_config_builds_env_provider() {
        let config = ProviderConfig {
            pod_names: vec!["worker-1".to_string()],
            ..Default::default()
        };

        let provider = Provider::from_config(&config).unwrap();
        assert_eq!(provider.kind(), ProviderKind::Env);
    }

    #[test]
    fn from_config_builds_bridge_provider() {
        let config = ProviderConfig {
            kind: ProviderKind::Bridge,
            bridge_name: "br0".to_string(),
            ..Default::default()
        };

        let provider = Provider::from_config(&config).unwrap();
        assert_eq!(provider.kind(), ProviderKind::Bridge);
    }

    #[test]
    fn from_config_builds_etcd_provider() {
        let config = ProviderConfig {
            kind: ProviderKind::Etcd,
            etcd_address: "http://127.0.0.1:2379".to_string(),
            pod_names: vec!["worker-1".to_string()],
            ..Default::default()
        };

        let provider = Provider::from_config(&config).unwrap();
        assert_eq!(provider.kind(), ProviderKind::Etcd);
    }

    #[test]
    fn from_config_rejects_missing_settings() {
        let bridge = ProviderConfig {
            kind: ProviderKind::Bridge,
            ..Default::default()
        };
        assert!(matches!(
            Provider::from_config(&bridge),
            Err(Error::InvalidConfig(_))
        ));

        let env = ProviderConfig::default();
        assert!(matches!(
            Provider::from_config(&env),
            Err(Error::InvalidConfig(_))
        ));

        let etcd = ProviderConfig {
            kind: ProviderKind::Etcd,
            pod_names: vec!["worker-1".to_string()],
            ..Default::default()
        };
        assert!(matches!(
            Provider::from_config(&etcd),
            Err(Error::InvalidConfig(_))
        ));
    }
}
