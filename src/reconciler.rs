//! Convergence of an `Endpoints` record to the discovered replica set.
//!
//! # How It Works
//!
//! 1. Discovers replicas with the configured [`Provider`], under retry
//! 2. Deduplicates them by IP into an [`AddressSet`]
//! 3. Creates the record with one subset, or merges into the existing record
//!    when creation reports that it already exists, under a separate retry
//!
//! Merging is a union keyed by the textual IP. Addresses already present are
//! left untouched, so repeated runs converge to the same record. Addresses are
//! only removed through [`Reconciler::remove_addresses`].
//!
//! There is no lock on the record: two reconcilers writing the same record at
//! once can lose an update.

use std::collections::{BTreeMap, HashSet};
use std::net::IpAddr;

use k8s_openapi::api::core::v1::{EndpointAddress, EndpointPort, EndpointSubset, Endpoints};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use crate::error::{Error, Result};
use crate::k8s::EndpointStore;
use crate::provider::{PodInfo, Provider};
use crate::retry::{RetryPolicy, retry_with_backoff};

/// The desired members of one service's record, keyed by IP.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AddressSet {
    /// Namespace of the service.
    pub namespace: String,
    /// Name of the service.
    pub service: String,
    members: BTreeMap<String, PodInfo>,
}

impl AddressSet {
    /// Builds the set from discovered replicas. For duplicate IPs the last
    /// replica wins.
    #[must_use]
    pub fn new<'a>(
        namespace: impl Into<String>,
        service: impl Into<String>,
        pods: impl IntoIterator<Item = &'a PodInfo>,
    ) -> Self {
        let members = pods
            .into_iter()
            .map(|pod| (pod.ip.to_string(), pod.clone()))
            .collect();

        Self {
            namespace: namespace.into(),
            service: service.into(),
            members,
        }
    }

    /// Number of distinct addresses.
    #[must_use]
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Whether the set holds no address.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Whether the set holds the given IP, in textual form.
    #[must_use]
    pub fn contains(&self, ip: &str) -> bool {
        self.members.contains_key(ip)
    }

    /// The members, ordered by IP text.
    pub fn members(&self) -> impl Iterator<Item = &PodInfo> {
        self.members.values()
    }

    /// The IPs, ordered by their text.
    pub fn ips(&self) -> impl Iterator<Item = &str> {
        self.members.keys().map(String::as_str)
    }

    fn endpoint_addresses(&self) -> Vec<EndpointAddress> {
        self.ips().map(endpoint_address).collect()
    }
}

/// Drives discovery and the record store to convergence.
pub struct Reconciler<S> {
    store: S,
    discovery_retry: RetryPolicy,
    write_retry: RetryPolicy,
}

impl<S: EndpointStore> Reconciler<S> {
    /// Creates a reconciler with default retry policies.
    #[must_use]
    pub fn new(store: S) -> Self {
        Self {
            store,
            discovery_retry: RetryPolicy::default(),
            write_retry: RetryPolicy::default(),
        }
    }

    /// Sets the retry policy for discovery.
    #[must_use]
    pub fn discovery_retry(mut self, policy: RetryPolicy) -> Self {
        self.discovery_retry = policy;
        self
    }

    /// Sets the retry policy for record writes.
    #[must_use]
    pub fn write_retry(mut self, policy: RetryPolicy) -> Self {
        self.write_retry = policy;
        self
    }

    /// The underlying store.
    #[must_use]
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Discovers replicas and reconciles them into the service's record.
    ///
    /// Discovery and the write are retried independently: once discovery has
    /// succeeded it is not repeated, whatever happens to the write.
    ///
    /// # Errors
    ///
    /// Returns the last error of whichever step exhausted its retries, or the
    /// first non-retryable error.
    pub async fn converge(
        &self,
        provider: &Provider,
        namespace: &str,
        service: &str,
    ) -> Result<Vec<PodInfo>> {
        let pods =
            retry_with_backoff(&self.discovery_retry, "discover pods", || provider.lookup())
                .await?;

        tracing::info!(
            provider = %provider.kind(),
            %namespace,
            %service,
            pods = pods.len(),
            "discovered pods"
        );

        retry_with_backoff(&self.write_retry, "reconcile endpoints", || {
            self.reconcile(namespace, service, &pods)
        })
        .await?;

        Ok(pods)
    }

    /// Removes replicas from the service's record, under retry.
    ///
    /// # Errors
    ///
    /// Returns the last error once retries are exhausted, or the first
    /// non-retryable error.
    pub async fn remove(&self, namespace: &str, service: &str, gone: &[PodInfo]) -> Result<()> {
        retry_with_backoff(&self.write_retry, "remove endpoints", || {
            self.remove_addresses(namespace, service, gone)
        })
        .await
    }

    /// Creates the service's record from `desired`, or merges `desired` into
    /// the existing record. Single attempt.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if `desired` is empty,
    /// [`Error::NotFound`] if the service does not exist, and any store
    /// failure other than the create conflict.
    pub async fn reconcile(
        &self,
        namespace: &str,
        service: &str,
        desired: &[PodInfo],
    ) -> Result<()> {
        if desired.is_empty() {
            return Err(Error::invalid_config(format!(
                "no addresses to publish for {namespace}/{service}"
            )));
        }

        let ports = self.store.service_ports(namespace, service).await?;
        let desired = AddressSet::new(namespace, service, desired);
        let candidate = desired_record(&desired, &ports);

        match self.store.create_record(namespace, &candidate).await {
            Ok(_) => {
                tracing::info!(
                    %namespace,
                    %service,
                    addresses = desired.len(),
                    "created endpoints"
                );
                return Ok(());
            }
            Err(Error::AlreadyExists { .. }) => {
                tracing::debug!(%namespace, %service, "endpoints exist, merging");
            }
            Err(e) => return Err(e),
        }

        let mut record = match self.store.get_record(namespace, service).await {
            Ok(record) => record,
            Err(Error::NotFound { .. }) => {
                return Err(Error::execution_failed(format!(
                    "endpoints {namespace}/{service} disappeared after create conflict"
                )));
            }
            Err(e) => return Err(e),
        };

        if !merge_addresses(&mut record, &desired, &ports) {
            tracing::info!(%namespace, %service, "endpoints already up to date");
            return Ok(());
        }

        self.store.update_record(namespace, &record).await?;
        tracing::info!(%namespace, %service, addresses = desired.len(), "merged endpoints");

        Ok(())
    }

    /// Drops the addresses of `gone` from every subset of the service's
    /// record. Single attempt.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the record does not exist, and any
    /// store failure.
    pub async fn remove_addresses(
        &self,
        namespace: &str,
        service: &str,
        gone: &[PodInfo],
    ) -> Result<()> {
        let mut record = self.store.get_record(namespace, service).await?;
        let gone = AddressSet::new(namespace, service, gone);

        let removed = subtract_addresses(&mut record, &gone);
        if removed == 0 {
            tracing::info!(%namespace, %service, "no addresses to remove");
            return Ok(());
        }

        self.store.update_record(namespace, &record).await?;
        tracing::info!(%namespace, %service, removed, "removed endpoint addresses");

        Ok(())
    }
}

/// The textual form of a parsed address, so `2001:DB8::1` and `2001:db8::1`
/// compare equal. Unparseable text is kept as is.
fn canonical_ip(ip: &str) -> String {
    ip.parse::<IpAddr>()
        .map_or_else(|_| ip.to_string(), |ip| ip.to_string())
}

fn endpoint_address(ip: &str) -> EndpointAddress {
    EndpointAddress {
        ip: ip.to_string(),
        ..Default::default()
    }
}

/// The record written when none exists yet: exactly one subset.
fn desired_record(desired: &AddressSet, ports: &[EndpointPort]) -> Endpoints {
    Endpoints {
        metadata: ObjectMeta {
            name: Some(desired.service.clone()),
            namespace: Some(desired.namespace.clone()),
            ..Default::default()
        },
        subsets: Some(vec![desired_subset(desired, ports)]),
    }
}

fn desired_subset(desired: &AddressSet, ports: &[EndpointPort]) -> EndpointSubset {
    EndpointSubset {
        addresses: Some(desired.endpoint_addresses()),
        ports: (!ports.is_empty()).then(|| ports.to_vec()),
        ..Default::default()
    }
}

/// Unions `desired` into every subset of `record`. Returns whether anything
/// changed.
fn merge_addresses(record: &mut Endpoints, desired: &AddressSet, ports: &[EndpointPort]) -> bool {
    let subsets = record.subsets.get_or_insert_with(Vec::new);

    if subsets.is_empty() {
        if desired.is_empty() {
            return false;
        }
        subsets.push(desired_subset(desired, ports));
        return true;
    }

    let mut changed = false;

    for subset in subsets.iter_mut() {
        let present: HashSet<String> = subset
            .addresses
            .iter()
            .chain(subset.not_ready_addresses.iter())
            .flatten()
            .map(|a| canonical_ip(&a.ip))
            .collect();

        let missing: Vec<EndpointAddress> = desired
            .ips()
            .filter(|ip| !present.contains(*ip))
            .map(endpoint_address)
            .collect();

        if !missing.is_empty() {
            subset.addresses.get_or_insert_with(Vec::new).extend(missing);
            changed = true;
        }

        if subset.ports.as_ref().is_none_or(Vec::is_empty) && !ports.is_empty() {
            subset.ports = Some(ports.to_vec());
            changed = true;
        }
    }

    changed
}

/// Removes every address listed in `gone` from every subset of `record`.
/// Returns the number of addresses dropped.
fn subtract_addresses(record: &mut Endpoints, gone: &AddressSet) -> usize {
    let mut removed = 0;

    for subset in record.subsets.iter_mut().flatten() {
        for addresses in [&mut subset.addresses, &mut subset.not_ready_addresses]
            .into_iter()
            .flatten()
        {
            let before = addresses.len();
            addresses.retain(|a| !gone.contains(&canonical_ip(&a.ip)));
            removed += before - addresses.len();
        }
    }

    removed
}
