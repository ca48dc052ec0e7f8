//! Rewrites the controller's registration manifest for one tenant
//!
//! The controller hands out a manifest meant for a dedicated cluster: it
//! creates the agent namespace and puts the agent objects in it. Inside the
//! shared control plane every tenant gets its own namespace instead, so:
//!
//! - `Namespace` documents are dropped
//! - namespaced objects are moved to the tenant namespace
//! - binding subjects that point at the agent namespace follow them
//! - cluster-scoped bindings get a per-cluster name so tenants don't
//!   overwrite each other's

use crate::error::{Result, RuntimeError};
use serde::Deserialize;
use serde_yaml::Value;

const CLUSTER_SCOPED_KINDS: &[&str] = &[
    "ClusterRole",
    "ClusterRoleBinding",
    "CustomResourceDefinition",
    "PriorityClass",
    "APIService",
    "MutatingWebhookConfiguration",
    "ValidatingWebhookConfiguration",
    "StorageClass",
    "PersistentVolume",
    "Node",
];

/// Rewrite `manifest` so it lands in `tenant_namespace`
pub fn scope_manifest(
    manifest: &str,
    agent_namespace: &str,
    tenant_namespace: &str,
    cluster: &str,
) -> Result<String> {
    let mut out = Vec::new();

    for document in serde_yaml::Deserializer::from_str(manifest) {
        let mut doc = Value::deserialize(document)
            .map_err(|e| RuntimeError::manifest(format!("unparseable document: {}", e)))?;
        if doc.is_null() {
            continue;
        }

        let kind = doc
            .get("kind")
            .and_then(Value::as_str)
            .ok_or_else(|| RuntimeError::manifest("document without kind"))?
            .to_string();

        match kind.as_str() {
            "Namespace" => continue,
            "ClusterRoleBinding" => {
                suffix_name(&mut doc, cluster);
                redirect_subjects(&mut doc, agent_namespace, tenant_namespace);
            }
            "RoleBinding" => {
                set_namespace(&mut doc, tenant_namespace);
                redirect_subjects(&mut doc, agent_namespace, tenant_namespace);
            }
            k if CLUSTER_SCOPED_KINDS.contains(&k) => {}
            _ => set_namespace(&mut doc, tenant_namespace),
        }

        let yaml = serde_yaml::to_string(&doc)
            .map_err(|e| RuntimeError::manifest(format!("re-serialization failed: {}", e)))?;
        out.push(yaml);
    }

    if out.is_empty() {
        return Err(RuntimeError::manifest("manifest contains no objects"));
    }
    Ok(out.join("---\n"))
}

fn metadata(doc: &mut Value) -> Option<&mut serde_yaml::Mapping> {
    doc.get_mut("metadata").and_then(Value::as_mapping_mut)
}

fn set_namespace(doc: &mut Value, namespace: &str) {
    if let Some(meta) = metadata(doc) {
        meta.insert(Value::from("namespace"), Value::from(namespace));
    }
}

fn suffix_name(doc: &mut Value, cluster: &str) {
    if let Some(meta) = metadata(doc) {
        let renamed = meta
            .get("name")
            .and_then(Value::as_str)
            .map(|name| format!("{}-{}", name, cluster));
        if let Some(renamed) = renamed {
            meta.insert(Value::from("name"), Value::from(renamed));
        }
    }
}

fn redirect_subjects(doc: &mut Value, from: &str, to: &str) {
    let subjects = match doc.get_mut("subjects").and_then(Value::as_sequence_mut) {
        Some(subjects) => subjects,
        None => return,
    };
    for subject in subjects.iter_mut() {
        if let Some(map) = subject.as_mapping_mut() {
            if map.get("namespace").and_then(Value::as_str) == Some(from) {
                map.insert(Value::from("namespace"), Value::from(to));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MANIFEST: &str = r#"
apiVersion: v1
kind: Namespace
metadata:
  name: cattle-system
---
apiVersion: v1
kind: ServiceAccount
metadata:
  name: cattle
  namespace: cattle-system
---
apiVersion: rbac.authorization.k8s.io/v1
kind: ClusterRoleBinding
metadata:
  name: cattle-admin-binding
roleRef:
  apiGroup: rbac.authorization.k8s.io
  kind: ClusterRole
  name: cattle-admin
subjects:
- kind: ServiceAccount
  name: cattle
  namespace: cattle-system
---
apiVersion: rbac.authorization.k8s.io/v1
kind: ClusterRole
metadata:
  name: cattle-admin
rules:
- apiGroups: ["*"]
  resources: ["*"]
  verbs: ["*"]
---
apiVersion: v1
kind: Secret
metadata:
  name: cattle-credentials-abc123
  namespace: cattle-system
type: Opaque
data:
  token: dG9rZW4=
---
"#;

    fn parse(out: &str) -> Vec<Value> {
        serde_yaml::Deserializer::from_str(out)
            .map(|d| Value::deserialize(d).unwrap())
            .collect()
    }

    #[test]
    fn test_scope_manifest() {
        let out = scope_manifest(MANIFEST, "cattle-system", "fleet-alpha", "alpha").unwrap();
        let docs = parse(&out);

        // Namespace dropped, trailing empty document ignored
        assert_eq!(docs.len(), 4);
        assert!(docs.iter().all(|d| d["kind"] != "Namespace"));

        let sa = &docs[0];
        assert_eq!(sa["metadata"]["namespace"], "fleet-alpha");

        let crb = &docs[1];
        assert_eq!(crb["metadata"]["name"], "cattle-admin-binding-alpha");
        assert_eq!(crb["subjects"][0]["namespace"], "fleet-alpha");
        assert!(crb["metadata"].get("namespace").is_none());

        let role = &docs[2];
        assert_eq!(role["metadata"]["name"], "cattle-admin");
        assert!(role["metadata"].get("namespace").is_none());

        let secret = &docs[3];
        assert_eq!(secret["metadata"]["namespace"], "fleet-alpha");
        assert_eq!(secret["data"]["token"], "dG9rZW4=");
    }

    #[test]
    fn test_scope_manifest_rejects_garbage() {
        assert!(scope_manifest("", "cattle-system", "fleet-alpha", "alpha").is_err());
        assert!(scope_manifest("metadata: {name: x}", "cattle-system", "fleet-alpha", "alpha").is_err());
        assert!(
            scope_manifest("kind: Namespace\nmetadata: {name: x}\n", "cattle-system", "fleet-alpha", "alpha")
                .is_err()
        );
    }
}
