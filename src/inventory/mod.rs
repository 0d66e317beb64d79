//! Read-only view of live cluster resources.

pub mod kubernetes;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::models::ResourceType;
use crate::Result;

pub use self::kubernetes::KubernetesInventory;

/// Label the pod controller stamps on every pod of one template revision.
pub const POD_TEMPLATE_HASH_LABEL: &str = "pod-template-hash";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnerReference {
    pub kind: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceDescriptor {
    pub name: String,
    pub namespace: String,
    pub labels: BTreeMap<String, String>,
    pub owners: Vec<OwnerReference>,
    pub pod_ip: Option<String>,
    pub phase: Option<String>,
    pub created: Option<DateTime<Utc>>,
}

impl ResourceDescriptor {
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            labels: BTreeMap::new(),
            owners: Vec::new(),
            pod_ip: None,
            phase: None,
            created: None,
        }
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn with_owner(mut self, kind: impl Into<String>, name: impl Into<String>) -> Self {
        self.owners.push(OwnerReference {
            kind: kind.into(),
            name: name.into(),
        });
        self
    }

    /// Key this resource is merged under, matching the metric grouping label.
    pub fn identity(&self, resource: ResourceType) -> &str {
        match resource {
            ResourceType::Deployment => &self.name,
            ResourceType::Pod => self
                .labels
                .get(POD_TEMPLATE_HASH_LABEL)
                .map(String::as_str)
                .unwrap_or(&self.name),
        }
    }

    /// Name of the deployment behind a pod, via its owning replica set.
    pub fn owning_deployment(&self) -> Option<String> {
        let replica_set = self.owners.iter().find(|owner| owner.kind == "ReplicaSet")?;
        let deployment = match self.labels.get(POD_TEMPLATE_HASH_LABEL) {
            Some(hash) => replica_set
                .name
                .strip_suffix(hash.as_str())
                .and_then(|prefix| prefix.strip_suffix('-'))
                .unwrap_or(&replica_set.name),
            None => &replica_set.name,
        };
        Some(deployment.to_string())
    }
}

/// Lists resources from the orchestration platform.
#[async_trait]
pub trait ResourceInventory: Send + Sync {
    /// Lists resources of one type. An empty namespace means every namespace.
    async fn list_resources(
        &self,
        resource: ResourceType,
        namespace: &str,
    ) -> Result<Vec<ResourceDescriptor>>;

    /// Confirms the platform API answers at all.
    async fn check(&self) -> Result<()>;
}
