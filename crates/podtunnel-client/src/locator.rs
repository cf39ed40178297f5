//! Workload lookup
//!
//! Turns a namespace plus selector (or an explicit pod name) into the single
//! [`TargetIdentity`] a tunnel forwards to.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, ListParams};
use kube::Client;
use podtunnel_transport::tls::ensure_crypto_provider;
use std::fmt;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum LocateError {
    #[error("Pod lookup failed: {0}")]
    Kube(kube::Error),

    #[error("Pod lookup returned {status}: {body}")]
    Api { status: u16, body: String },

    #[error("No pods found in namespace {namespace:?}{}", selector_suffix(.selector))]
    NoPods {
        namespace: String,
        selector: Option<String>,
    },

    #[error("Invalid target: {0}")]
    InvalidTarget(String),

}

impl From<kube::Error> for LocateError {
    fn from(err: kube::Error) -> Self {
        match err {
            kube::Error::Api(response) => LocateError::Api {
                status: response.code,
                body: response.message,
            },
            other => LocateError::Kube(other),
        }
    }
}

fn selector_suffix(selector: &Option<String>) -> String {
    match selector {
        Some(selector) => format!(" matching {:?}", selector),
        None => String::new(),
    }
}

/// The pod a tunnel forwards to
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TargetIdentity {
    pub namespace: String,
    pub pod: String,
}

impl TargetIdentity {
    pub fn new(namespace: impl Into<String>, pod: impl Into<String>) -> Result<Self, LocateError> {
        let target = Self {
            namespace: namespace.into(),
            pod: pod.into(),
        };
        target.validate()?;
        Ok(target)
    }

    pub fn validate(&self) -> Result<(), LocateError> {
        for (what, value) in [("namespace", &self.namespace), ("pod name", &self.pod)] {
            if value.is_empty() {
                return Err(LocateError::InvalidTarget(format!("{} is empty", what)));
            }
            if value.contains('/') {
                return Err(LocateError::InvalidTarget(format!(
                    "{} {:?} contains '/'",
                    what, value
                )));
            }
        }
        Ok(())
    }
}

impl fmt::Display for TargetIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.pod)
    }
}

/// Resolves the single pod a tunnel should reach
#[async_trait]
pub trait WorkloadLocator: Send + Sync {
    async fn locate(&self, namespace: &str) -> Result<TargetIdentity, LocateError>;
}

/// Always answers with a fixed pod name
#[derive(Debug, Clone)]
pub struct StaticLocator {
    pod: String,
}

impl StaticLocator {
    pub fn new(pod: impl Into<String>) -> Self {
        Self { pod: pod.into() }
    }
}

#[async_trait]
impl WorkloadLocator for StaticLocator {
    async fn locate(&self, namespace: &str) -> Result<TargetIdentity, LocateError> {
        TargetIdentity::new(namespace, self.pod.clone())
    }
}

fn is_running(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .map(|phase| phase == "Running")
        .unwrap_or(false)
}

/// First running pod, else the first pod listed
fn choose_pod(pods: &[Pod]) -> Option<&Pod> {
    pods.iter().find(|p| is_running(p)).or_else(|| pods.first())
}

/// Lists pods through the control plane's pods API
#[derive(Clone)]
pub struct ApiWorkloadLocator {
    client: Client,
    label_selector: Option<String>,
}

impl fmt::Debug for ApiWorkloadLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiWorkloadLocator")
            .field("label_selector", &self.label_selector)
            .finish()
    }
}

impl ApiWorkloadLocator {
    /// Must be called inside a Tokio runtime
    pub fn new(config: kube::Config, label_selector: Option<String>) -> Result<Self, LocateError> {
        ensure_crypto_provider();
        let client = Client::try_from(config).map_err(LocateError::Kube)?;

        Ok(Self {
            client,
            label_selector: label_selector.filter(|s| !s.is_empty()),
        })
    }
}

#[async_trait]
impl WorkloadLocator for ApiWorkloadLocator {
    async fn locate(&self, namespace: &str) -> Result<TargetIdentity, LocateError> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let params = match &self.label_selector {
            Some(selector) => ListParams::default().labels(selector),
            None => ListParams::default(),
        };

        debug!(
            "Listing pods in {} (selector: {:?})",
            namespace, self.label_selector
        );
        let pods = api.list(&params).await?;

        let name = choose_pod(&pods.items)
            .and_then(|pod| pod.metadata.name.clone())
            .ok_or_else(|| LocateError::NoPods {
                namespace: namespace.to_string(),
                selector: self.label_selector.clone(),
            })?;

        debug!(
            "Selected pod {} out of {} in {}",
            name,
            pods.items.len(),
            namespace
        );
        TargetIdentity::new(namespace, name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::PodStatus;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    #[test]
    fn test_target_validation() {
        assert!(TargetIdentity::new("default", "web-0").is_ok());
        assert!(TargetIdentity::new("", "web-0").is_err());
        assert!(TargetIdentity::new("default", "").is_err());
        assert!(TargetIdentity::new("default", "web/0").is_err());
    }

    #[test]
    fn test_no_pods_message() {
        let err = LocateError::NoPods {
            namespace: "shop".to_string(),
            selector: None,
        };
        assert_eq!(err.to_string(), "No pods found in namespace \"shop\"");
    }

    fn pod(name: &str, phase: Option<&str>) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            status: phase.map(|phase| PodStatus {
                phase: Some(phase.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn chosen(pods: &[Pod]) -> Option<&str> {
        choose_pod(pods).and_then(|p| p.metadata.name.as_deref())
    }

    #[test]
    fn test_choose_pod() {
        assert_eq!(chosen(&[]), None);
        assert_eq!(
            chosen(&[pod("a", Some("Pending")), pod("b", Some("Running"))]),
            Some("b")
        );
        assert_eq!(chosen(&[pod("a", None), pod("b", Some("Failed"))]), Some("a"));
    }

    #[tokio::test]
    async fn test_static_locator() {
        let target = StaticLocator::new("db-0").locate("data").await.unwrap();
        assert_eq!(target.to_string(), "data/db-0");
    }
}
