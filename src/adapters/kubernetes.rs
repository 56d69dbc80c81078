//! Kubernetes Registry Adapter
//!
//! Implements the `PeerRegistry` port on top of the Kubernetes API: pods are
//! listed by label selector in one namespace, zones come from node labels.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, Pod, Service};
use kube::api::{Api, ListParams};
use kube::{Client, ResourceExt};
use tracing::{debug, instrument};

use crate::domain::{PeerRecord, PeerRegistry};
use crate::error::{Error, Result};

/// Well-known node label carrying the zone.
pub const ZONE_LABEL: &str = "topology.kubernetes.io/zone";

/// Deprecated zone label still set by older clusters.
pub const LEGACY_ZONE_LABEL: &str = "failure-domain.beta.kubernetes.io/zone";

/// Kubernetes-backed peer registry.
#[derive(Clone)]
pub struct KubernetesRegistry {
    client: Client,
    namespace: String,
}

impl KubernetesRegistry {
    pub fn new(client: Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn pods_api(&self) -> Api<Pod> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn nodes_api(&self) -> Api<Node> {
        Api::all(self.client.clone())
    }

    fn services_api(&self) -> Api<Service> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    /// Fetch the named service and render its pod selector.
    ///
    /// A missing service or one without a selector is an error: without it
    /// there is no peer set to probe.
    #[instrument(skip(self))]
    pub async fn service_selector(&self, service_name: &str) -> Result<String> {
        let service = self
            .services_api()
            .get_opt(service_name)
            .await?
            .ok_or_else(|| Error::ServiceNotFound {
                namespace: self.namespace.clone(),
                name: service_name.to_string(),
            })?;

        let selector = service
            .spec
            .and_then(|spec| spec.selector)
            .unwrap_or_default();

        if selector.is_empty() {
            return Err(Error::Config(format!(
                "service {}/{} has no pod selector",
                self.namespace, service_name
            )));
        }

        Ok(render_selector(&selector))
    }

    /// Convert a pod into a peer record.
    fn peer_record(pod: &Pod) -> PeerRecord {
        let status = pod.status.as_ref();

        PeerRecord {
            name: pod.name_any(),
            ip: status.and_then(|s| s.pod_ip.clone()),
            node_name: pod
                .spec
                .as_ref()
                .and_then(|s| s.node_name.clone())
                .unwrap_or_default(),
            phase: status.and_then(|s| s.phase.clone()),
        }
    }
}

impl std::fmt::Debug for KubernetesRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubernetesRegistry")
            .field("namespace", &self.namespace)
            .finish()
    }
}

#[async_trait]
impl PeerRegistry for KubernetesRegistry {
    #[instrument(skip(self))]
    async fn list_peers(&self, selector: &str) -> Result<Vec<PeerRecord>> {
        let params = ListParams::default().labels(selector);
        let pods = self.pods_api().list(&params).await?;

        debug!(count = pods.items.len(), "Listed pods");
        Ok(pods.items.iter().map(Self::peer_record).collect())
    }

    #[instrument(skip(self))]
    async fn node_zone(&self, node_name: &str) -> Result<String> {
        let node = self.nodes_api().get(node_name).await?;
        Ok(zone_from_labels(node.labels()))
    }
}

/// Zone from node labels, preferring the current well-known label.
pub fn zone_from_labels(labels: &BTreeMap<String, String>) -> String {
    labels
        .get(ZONE_LABEL)
        .or_else(|| labels.get(LEGACY_ZONE_LABEL))
        .cloned()
        .unwrap_or_default()
}

/// Render a selector map as `k=v,k2=v2`, keys in sorted order.
pub fn render_selector(selector: &BTreeMap<String, String>) -> String {
    selector
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{PodSpec, PodStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_render_selector_sorted() {
        let selector = labels(&[("tier", "probe"), ("app", "kube-latency")]);
        assert_eq!(render_selector(&selector), "app=kube-latency,tier=probe");
    }

    #[test]
    fn test_render_single_selector() {
        assert_eq!(render_selector(&labels(&[("app", "probe")])), "app=probe");
    }

    #[test]
    fn test_zone_prefers_current_label() {
        let node_labels = labels(&[(ZONE_LABEL, "eu-west-1a"), (LEGACY_ZONE_LABEL, "old")]);
        assert_eq!(zone_from_labels(&node_labels), "eu-west-1a");
    }

    #[test]
    fn test_zone_falls_back_to_legacy_label() {
        let node_labels = labels(&[(LEGACY_ZONE_LABEL, "us-east-1c")]);
        assert_eq!(zone_from_labels(&node_labels), "us-east-1c");
    }

    #[test]
    fn test_unlabeled_node_has_empty_zone() {
        assert_eq!(zone_from_labels(&BTreeMap::new()), "");
    }

    #[test]
    fn test_peer_record_from_pod() {
        let pod = Pod {
            metadata: ObjectMeta {
                name: Some("kube-latency-abc".into()),
                ..Default::default()
            },
            spec: Some(PodSpec {
                node_name: Some("node-1".into()),
                ..Default::default()
            }),
            status: Some(PodStatus {
                pod_ip: Some("10.2.0.7".into()),
                phase: Some("Running".into()),
                ..Default::default()
            }),
        };

        let record = KubernetesRegistry::peer_record(&pod);

        assert_eq!(record.name, "kube-latency-abc");
        assert_eq!(record.ip.as_deref(), Some("10.2.0.7"));
        assert_eq!(record.node_name, "node-1");
        assert_eq!(record.phase.as_deref(), Some("Running"));
        assert_eq!(record.address(), Some("10.2.0.7".parse().unwrap()));
    }

    #[test]
    fn test_pending_pod_has_no_address() {
        let pod = Pod {
            metadata: ObjectMeta {
                name: Some("kube-latency-pending".into()),
                ..Default::default()
            },
            spec: Some(PodSpec::default()),
            status: Some(PodStatus {
                phase: Some("Pending".into()),
                ..Default::default()
            }),
        };

        let record = KubernetesRegistry::peer_record(&pod);

        assert!(record.address().is_none());
        assert_eq!(record.node_name, "");
    }
}
