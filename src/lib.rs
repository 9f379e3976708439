#![deny(missing_docs)]
#![deny(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! Publish the addresses of workload replicas as Kubernetes `Endpoints`.
//!
//! Replicas that do not run as regular pods (VMs behind a bridge, processes
//! outside the cluster) are invisible to the endpoints controller. This crate
//! discovers their addresses and reconciles them into the `Endpoints` record
//! of a selector-less `Service`, so consumers can reach them through the
//! service as usual.
//!
//! # Features
//!
//! - **Pluggable discovery**: bridge interface, environment variables or etcd keys
//! - **Idempotent merge**: addresses are unioned by IP, re-runs change nothing
//! - **Bounded retry**: discovery and the record write retry independently
//!   with exponential backoff
//!
//! # Usage
//!
//! ```ignore
//! use k8s_endpoint_updater::{KubeEndpointStore, Provider, ProviderConfig, Reconciler};
//!
//! let provider = Provider::from_config(&ProviderConfig {
//!     pod_names: vec!["master-438601543-dxvjb".to_string()],
//!     ..Default::default()
//! })?;
//!
//! let client = kube::Client::try_default().await?;
//! let reconciler = Reconciler::new(KubeEndpointStore::new(client));
//!
//! reconciler.converge(&provider, "default", "master").await?;
//! ```

pub mod config;
mod error;
mod k8s;
pub mod provider;
mod reconciler;
pub mod retry;

pub use error::{Error, Result};
pub use k8s::{EndpointStore, KubeEndpointStore};
pub use provider::{PodInfo, Provider, ProviderConfig, ProviderKind};
pub use reconciler::{AddressSet, Reconciler};
pub use retry::RetryPolicy;
