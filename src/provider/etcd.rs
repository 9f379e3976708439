//! etcd key lookup discovery.
//!
//! One key per expected replica name, holding the replica IP. Lookups are
//! all-or-nothing: a single failing key fails the whole discovery.

use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};

use super::PodInfo;
use crate::error::{Error, Result};

/// Read access to a key/value store.
#[async_trait]
pub trait KeyValueStore: fmt::Debug + Send + Sync {
    /// Returns the value stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Discovery`] if the key is missing or the store cannot
    /// be reached.
    async fn get(&self, key: &str) -> Result<String>;
}

/// Discovers replicas from per-replica keys.
#[derive(Clone, Debug)]
pub struct EtcdProvider {
    store: Arc<dyn KeyValueStore>,
    pod_names: Vec<String>,
    prefix: String,
}

impl EtcdProvider {
    /// Creates a provider reading `prefix + name` for every replica name.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if no names are given.
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        pod_names: Vec<String>,
        prefix: &str,
    ) -> Result<Self> {
        if pod_names.is_empty() {
            return Err(Error::invalid_config("pod names must not be empty"));
        }

        Ok(Self {
            store,
            pod_names,
            prefix: prefix.to_string(),
        })
    }

    /// Looks up every replica, in configuration order.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Discovery`] on the first failed lookup or unparseable
    /// value.
    pub async fn lookup(&self) -> Result<Vec<PodInfo>> {
        let mut pods = Vec::with_capacity(self.pod_names.len());

        for name in &self.pod_names {
            let key = format!("{}{name}", self.prefix);
            let value = self.store.get(&key).await?;

            let ip = value.trim().parse::<IpAddr>().map_err(|e| {
                Error::discovery(format!("key {key} holds invalid IP '{value}': {e}"))
            })?;

            tracing::debug!(pod = %name, %ip, "found pod in etcd");
            pods.push(PodInfo::new(name.clone(), ip));
        }

        Ok(pods)
    }
}

/// etcd API flavour.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum EtcdKind {
    /// The v2 keys API.
    #[default]
    #[value(name = "etcdv2")]
    V2,
    /// The v3 JSON gateway.
    #[value(name = "etcdv3")]
    V3,
}

/// HTTP client for etcd.
#[derive(Clone, Debug)]
pub struct EtcdClient {
    http: reqwest::Client,
    address: String,
    kind: EtcdKind,
}

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

impl EtcdClient {
    /// Creates a client for the server at `address`, e.g. `http://127.0.0.1:2379`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if the address is empty or the HTTP
    /// client cannot be built.
    pub fn new(address: &str, kind: EtcdKind) -> Result<Self> {
        if address.is_empty() {
            return Err(Error::invalid_config("etcd address must not be empty"));
        }

        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| Error::invalid_config(format!("building etcd client: {e}")))?;

        Ok(Self {
            http,
            address: address.trim_end_matches('/').to_string(),
            kind,
        })
    }

    async fn get_v2(&self, key: &str) -> Result<String> {
        let url = format!("{}/v2/keys/{}", self.address, key.trim_start_matches('/'));

        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::discovery(format!("GET {url}: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::discovery(format!("GET {url}: status {status}")));
        }

        let body: V2Response = response
            .json()
            .await
            .map_err(|e| Error::discovery(format!("decoding {url}: {e}")))?;

        body.node
            .and_then(|n| n.value)
            .ok_or_else(|| Error::discovery(format!("key {key} has no value")))
    }

    async fn get_v3(&self, key: &str) -> Result<String> {
        let url = format!("{}/v3/kv/range", self.address);
        let request = V3RangeRequest {
            key: BASE64.encode(key),
        };

        let response = self
            .http
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| Error::discovery(format!("POST {url}: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::discovery(format!("POST {url}: status {status}")));
        }

        let body: V3RangeResponse = response
            .json()
            .await
            .map_err(|e| Error::discovery(format!("decoding {url}: {e}")))?;

        let Some(kv) = body.kvs.into_iter().next() else {
            return Err(Error::discovery(format!("key {key} not found")));
        };

        let raw = BASE64
            .decode(kv.value.unwrap_or_default())
            .map_err(|e| Error::discovery(format!("decoding value of {key}: {e}")))?;

        String::from_utf8(raw).map_err(|e| Error::discovery(format!("value of {key}: {e}")))
    }
}

#[async_trait]
impl KeyValueStore for EtcdClient {
    async fn get(&self, key: &str) -> Result<String> {
        match self.kind {
            EtcdKind::V2 => self.get_v2(key).await,
            EtcdKind::V3 => self.get_v3(key).await,
        }
    }
}

#[derive(Deserialize)]
struct V2Response {
    node: Option<V2Node>,
}

#[derive(Deserialize)]
struct V2Node {
    value: Option<String>,
}

#[derive(Serialize)]
struct V3RangeRequest {
    key: String,
}

#[derive(Deserialize)]
struct V3RangeResponse {
    #[serde(default)]
    kvs: Vec<V3KeyValue>,
}

#[derive(Deserialize)]
struct V3KeyValue {
    value: Option<String>,
}
