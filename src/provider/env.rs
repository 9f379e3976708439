//! Environment variable discovery.
//!
//! Each expected replica name maps to one variable, e.g.
//! `worker-2528079433-dpl9w` becomes
//! `K8S_ENDPOINT_UPDATER_POD_WORKER_2528079433_DPL9W`. The variable holds the
//! replica IP.

use std::net::{IpAddr, Ipv4Addr};

use super::PodInfo;
use crate::error::{Error, Result};

/// Prefix used when none is configured.
pub const DEFAULT_ENV_PREFIX: &str = "K8S_ENDPOINT_UPDATER_POD_";

/// Discovers replicas from process environment variables.
#[derive(Clone, Debug)]
pub struct EnvProvider {
    pod_names: Vec<String>,
    prefix: String,
}

impl EnvProvider {
    /// Creates a provider for the given replica names.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if no names or an empty prefix are
    /// given.
    pub fn new(pod_names: Vec<String>, prefix: &str) -> Result<Self> {
        if pod_names.is_empty() {
            return Err(Error::invalid_config("pod names must not be empty"));
        }
        if prefix.is_empty() {
            return Err(Error::invalid_config("env prefix must not be empty"));
        }

        Ok(Self {
            pod_names,
            prefix: prefix.to_string(),
        })
    }

    /// Reads one replica per configured name, in configuration order.
    ///
    /// An unset or malformed variable yields `0.0.0.0` instead of an error.
    #[must_use]
    pub fn lookup(&self) -> Vec<PodInfo> {
        self.resolve(|key| std::env::var(key).ok())
    }

    fn resolve<F>(&self, var: F) -> Vec<PodInfo>
    where
        F: Fn(&str) -> Option<String>,
    {
        self.pod_names
            .iter()
            .map(|name| {
                let key = pod_name_to_env_var(name, &self.prefix);
                let value = var(&key).unwrap_or_default();

                let ip = value.trim().parse::<IpAddr>().unwrap_or_else(|_| {
                    tracing::warn!(
                        pod = %name,
                        variable = %key,
                        "no valid IP in environment variable"
                    );
                    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
                });

                PodInfo::new(name.clone(), ip)
            })
            .collect()
    }
}

/// Derives the environment variable name holding the IP of `pod_name`.
#[must_use]
pub fn pod_name_to_env_var(pod_name: &str, prefix: &str) -> String {
    let words: Vec<String> = split_words(pod_name)
        .into_iter()
        .filter(|w| w != "-" && w != "_" && !w.trim().is_empty())
        .collect();

    format!("{prefix}{}", words.join("_").to_uppercase())
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum CharClass {
    Lower,
    Upper,
    Other,
}

/// Digits stay glued to the surrounding word. Any numeric character counts,
/// not only decimal digits, so `²` joins a word like `2` does. Kubernetes
/// names are ASCII, where the two notions agree.
fn char_class(c: char) -> CharClass {
    if c.is_lowercase() || c.is_numeric() {
        CharClass::Lower
    } else if c.is_uppercase() {
        CharClass::Upper
    } else {
        CharClass::Other
    }
}

/// Splits a name into runs of the same character class.
///
/// An upper-case run followed by a lower-case run hands its last letter to
/// the lower-case run: "PDFLoader" splits into "PDF" and "Loader".
fn split_words(src: &str) -> Vec<String> {
    let mut runs: Vec<Vec<char>> = Vec::new();
    let mut last = None;

    for c in src.chars() {
        let class = char_class(c);
        match runs.last_mut() {
            Some(run) if last == Some(class) => run.push(c),
            _ => runs.push(vec![c]),
        }
        last = Some(class);
    }

    for i in 0..runs.len().saturating_sub(1) {
        if runs[i][0].is_uppercase() && runs[i + 1][0].is_lowercase() {
            if let Some(c) = runs[i].pop() {
                runs[i + 1].insert(0, c);
            }
        }
    }

    runs.into_iter()
        .filter(|run| !run.is_empty())
        .map(|run| run.into_iter().collect())
        .collect()
}
