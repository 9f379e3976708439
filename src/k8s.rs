//! Kubernetes access to `Service` ports and `Endpoints` records.
//!
//! This module is a thin adapter over the cluster API. It carries no
//! business logic: API failures are handed back unchanged as
//! [`Error::Store`], except for the two statuses callers branch on.
//!
//! # How It Works
//!
//! 1. Reads the target `Service` and translates its declared ports into
//!    `EndpointPort`s
//! 2. Reads, creates or replaces `Endpoints` objects
//! 3. Maps HTTP 404 to [`Error::NotFound`] and a create conflict (409) to
//!    [`Error::AlreadyExists`]
//!
//! # Example
//!
//! ```ignore
//! use k8s_endpoint_updater::{EndpointStore, KubeEndpointStore};
//!
//! let client = kube::Client::try_default().await?;
//! let store = KubeEndpointStore::new(client);
//!
//! let ports = store.service_ports("default", "my-service").await?;
//! let record = store.get_record("default", "my-service").await?;
//! ```

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{EndpointPort, Endpoints, Service, ServicePort};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::PostParams;
use kube::{Api, Client};

use crate::error::{Error, Result};

/// Read and write access to `Endpoints` records and `Service` ports.
#[async_trait]
pub trait EndpointStore: Send + Sync {
    /// Returns the declared ports of a service, as endpoint ports.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the service does not exist.
    async fn service_ports(&self, namespace: &str, service: &str) -> Result<Vec<EndpointPort>>;

    /// Returns the named record.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the record does not exist.
    async fn get_record(&self, namespace: &str, name: &str) -> Result<Endpoints>;

    /// Creates a record.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyExists`] if a record with the same name exists.
    async fn create_record(&self, namespace: &str, record: &Endpoints) -> Result<Endpoints>;

    /// Replaces a record.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the record does not exist and
    /// [`Error::Store`] on any other API failure.
    async fn update_record(&self, namespace: &str, record: &Endpoints) -> Result<Endpoints>;
}

/// [`EndpointStore`] backed by the Kubernetes API.
#[derive(Clone)]
pub struct KubeEndpointStore {
    client: Client,
}

impl KubeEndpointStore {
    /// Creates a store using the given client.
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn services(&self, namespace: &str) -> Api<Service> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn endpoints(&self, namespace: &str) -> Api<Endpoints> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl EndpointStore for KubeEndpointStore {
    async fn service_ports(&self, namespace: &str, service: &str) -> Result<Vec<EndpointPort>> {
        let Some(svc) = self.services(namespace).get_opt(service).await? else {
            return Err(Error::not_found("Service", namespace, service));
        };

        let ports = svc
            .spec
            .and_then(|spec| spec.ports)
            .unwrap_or_default()
            .iter()
            .map(endpoint_port)
            .collect();

        Ok(ports)
    }

    async fn get_record(&self, namespace: &str, name: &str) -> Result<Endpoints> {
        self.endpoints(namespace)
            .get_opt(name)
            .await?
            .ok_or_else(|| Error::not_found("Endpoints", namespace, name))
    }

    async fn create_record(&self, namespace: &str, record: &Endpoints) -> Result<Endpoints> {
        match self
            .endpoints(namespace)
            .create(&PostParams::default(), record)
            .await
        {
            Ok(created) => Ok(created),
            Err(kube::Error::Api(ae)) if ae.code == 409 => Err(Error::AlreadyExists {
                namespace: namespace.to_string(),
                name: record_name(record).to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn update_record(&self, namespace: &str, record: &Endpoints) -> Result<Endpoints> {
        let name = record_name(record);

        match self
            .endpoints(namespace)
            .replace(name, &PostParams::default(), record)
            .await
        {
            Ok(updated) => Ok(updated),
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                Err(Error::not_found("Endpoints", namespace, name))
            }
            Err(e) => Err(e.into()),
        }
    }
}

fn record_name(record: &Endpoints) -> &str {
    record.metadata.name.as_deref().unwrap_or_default()
}

/// Translates a declared service port into the port an endpoint serves.
///
/// A numeric target port wins over the service port. A named target port
/// can only be resolved against pod specs, so it falls back to the service
/// port.
fn endpoint_port(port: &ServicePort) -> EndpointPort {
    let number = match &port.target_port {
        Some(IntOrString::Int(n)) if *n > 0 => *n,
        _ => port.port,
    };

    EndpointPort {
        name: port.name.clone(),
        port: number,
        protocol: port.protocol.clone(),
        app_protocol: port.app_protocol.clone(),
    }
}
