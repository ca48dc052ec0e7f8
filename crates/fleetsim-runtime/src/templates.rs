//! Template objects that make a tenant look like a populated cluster

use crate::control_plane::CLUSTER_LABEL;
use crate::error::{Result, RuntimeError};
use fleetsim_core::{node_name, pod_name, tenant_namespace, Inventory};
use k8s_openapi::api::core::v1::{
    Container, Namespace, Node, NodeSpec, Pod, PodSpec, PodStatus, Toleration,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeMap;

/// kwok only simulates nodes carrying this annotation
const KWOK_NODE_ANNOTATION: &str = "kwok.x-k8s.io/node";

/// Shape of every tenant's template inventory
#[derive(Debug, Clone)]
pub struct TemplateConfig {
    pub nodes_per_cluster: usize,
    pub pods_per_node: usize,
    pub node_cpu: String,
    pub node_memory: String,
    pub node_max_pods: String,
    pub pod_image: String,
}

impl Default for TemplateConfig {
    fn default() -> Self {
        Self {
            nodes_per_cluster: 3,
            pods_per_node: 2,
            node_cpu: "8".to_string(),
            node_memory: "32Gi".to_string(),
            node_max_pods: "110".to_string(),
            pod_image: "registry.k8s.io/pause:3.9".to_string(),
        }
    }
}

fn cluster_labels(cluster: &str) -> BTreeMap<String, String> {
    BTreeMap::from([(CLUSTER_LABEL.to_string(), cluster.to_string())])
}

/// Names of the objects `tenant_manifest` creates
pub fn inventory(cluster: &str, config: &TemplateConfig) -> Inventory {
    let mut inventory = Inventory::default();
    for n in 0..config.nodes_per_cluster {
        let node = node_name(cluster, n);
        for p in 0..config.pods_per_node {
            inventory.pods.push(pod_name(&node, p));
        }
        inventory.nodes.push(node);
    }
    inventory
}

/// Namespace, nodes and pods of one tenant as a multi-document manifest
pub fn tenant_manifest(cluster: &str, config: &TemplateConfig) -> Result<String> {
    let namespace = tenant_namespace(cluster);
    let labels = cluster_labels(cluster);
    let mut docs = vec![to_yaml(&Namespace {
        metadata: ObjectMeta {
            name: Some(namespace.clone()),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        ..Default::default()
    })?];

    for n in 0..config.nodes_per_cluster {
        let node = node_name(cluster, n);
        docs.push(to_yaml(&Node {
            metadata: ObjectMeta {
                name: Some(node.clone()),
                labels: Some({
                    let mut l = labels.clone();
                    l.insert("kubernetes.io/hostname".to_string(), node.clone());
                    l.insert("type".to_string(), "kwok".to_string());
                    l
                }),
                annotations: Some(BTreeMap::from([(
                    KWOK_NODE_ANNOTATION.to_string(),
                    "fake".to_string(),
                )])),
                ..Default::default()
            },
            spec: Some(NodeSpec::default()),
            status: None,
        })?);

        for p in 0..config.pods_per_node {
            docs.push(to_yaml(&Pod {
                metadata: ObjectMeta {
                    name: Some(pod_name(&node, p)),
                    namespace: Some(namespace.clone()),
                    labels: Some(labels.clone()),
                    ..Default::default()
                },
                spec: Some(PodSpec {
                    node_name: Some(node.clone()),
                    containers: vec![Container {
                        name: "app".to_string(),
                        image: Some(config.pod_image.clone()),
                        ..Default::default()
                    }],
                    tolerations: Some(vec![Toleration {
                        key: Some(KWOK_NODE_ANNOTATION.to_string()),
                        operator: Some("Exists".to_string()),
                        effect: Some("NoSchedule".to_string()),
                        ..Default::default()
                    }]),
                    ..Default::default()
                }),
                status: Some(PodStatus {
                    phase: Some("Running".to_string()),
                    ..Default::default()
                }),
            })?);
        }
    }

    Ok(docs.join("---\n"))
}

/// Status patch applied to every node after creation
pub fn node_status_patch(config: &TemplateConfig) -> serde_json::Value {
    let resources = json!({
        "cpu": config.node_cpu,
        "memory": config.node_memory,
        "pods": config.node_max_pods,
    });
    json!({
        "status": {
            "capacity": resources,
            "allocatable": resources,
            "conditions": [{
                "type": "Ready",
                "status": "True",
                "reason": "KubeletReady",
                "message": "kubelet is posting ready status",
            }],
        }
    })
}

fn to_yaml<T: Serialize>(value: &T) -> Result<String> {
    serde_yaml::to_string(value)
        .map_err(|e| RuntimeError::internal_error(format!("template serialization: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn docs(manifest: &str) -> Vec<serde_yaml::Value> {
        manifest
            .split("---\n")
            .map(|d| serde_yaml::from_str(d).unwrap())
            .collect()
    }

    #[test]
    fn test_tenant_manifest_shape() {
        let config = TemplateConfig {
            nodes_per_cluster: 2,
            pods_per_node: 3,
            ..TemplateConfig::default()
        };
        let manifest = tenant_manifest("alpha", &config).unwrap();
        let docs = docs(&manifest);
        assert_eq!(docs.len(), 1 + 2 + 2 * 3);

        assert_eq!(docs[0]["kind"], "Namespace");
        assert_eq!(docs[0]["metadata"]["name"], "fleet-alpha");

        let nodes: Vec<_> = docs.iter().filter(|d| d["kind"] == "Node").collect();
        assert_eq!(nodes[0]["metadata"]["name"], "alpha-node-0");
        assert_eq!(nodes[0]["metadata"]["labels"][CLUSTER_LABEL], "alpha");
        assert!(nodes[0].get("status").is_none());

        let pods: Vec<_> = docs.iter().filter(|d| d["kind"] == "Pod").collect();
        assert_eq!(pods.len(), 6);
        assert_eq!(pods[0]["metadata"]["namespace"], "fleet-alpha");
        assert_eq!(pods[0]["spec"]["nodeName"], "alpha-node-0");
        assert_eq!(pods[0]["status"]["phase"], "Running");
    }

    #[test]
    fn test_inventory_matches_manifest() {
        let config = TemplateConfig::default();
        let inventory = inventory("alpha", &config);
        assert_eq!(inventory.nodes.len(), config.nodes_per_cluster);
        assert_eq!(
            inventory.pods.len(),
            config.nodes_per_cluster * config.pods_per_node
        );

        let manifest = tenant_manifest("alpha", &config).unwrap();
        for name in inventory.nodes.iter().chain(inventory.pods.iter()) {
            assert!(manifest.contains(name.as_str()));
        }
    }

    #[test]
    fn test_node_status_patch() {
        let patch = node_status_patch(&TemplateConfig::default());
        assert_eq!(patch["status"]["capacity"]["cpu"], "8");
        assert_eq!(patch["status"]["allocatable"]["pods"], "110");
        assert_eq!(patch["status"]["conditions"][0]["type"], "Ready");
    }
}
