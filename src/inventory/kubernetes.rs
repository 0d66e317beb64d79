use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, error};

use super::{OwnerReference, ResourceDescriptor, ResourceInventory};
use crate::models::ResourceType;
use crate::{GatewayError, Result};

#[derive(Debug, Deserialize)]
struct ObjectList {
    #[serde(default)]
    items: Vec<Object>,
}

#[derive(Debug, Deserialize)]
struct Object {
    metadata: ObjectMeta,
    #[serde(default)]
    status: Option<ObjectStatus>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ObjectMeta {
    name: String,
    #[serde(default)]
    namespace: String,
    #[serde(default)]
    labels: BTreeMap<String, String>,
    #[serde(default)]
    owner_references: Vec<OwnerReference>,
    creation_timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Default, Deserialize)]
struct ObjectStatus {
    #[serde(rename = "podIP")]
    pod_ip: Option<String>,
    phase: Option<String>,
}

impl From<Object> for ResourceDescriptor {
    fn from(object: Object) -> Self {
        let status = object.status.unwrap_or_default();
        ResourceDescriptor {
            name: object.metadata.name,
            namespace: object.metadata.namespace,
            labels: object.metadata.labels,
            owners: object.metadata.owner_references,
            pod_ip: status.pod_ip,
            phase: status.phase,
            created: object.metadata.creation_timestamp,
        }
    }
}

/// Inventory backed by the Kubernetes REST API.
#[derive(Debug, Clone)]
pub struct KubernetesInventory {
    client: reqwest::Client,
    api_url: String,
    token: Option<String>,
}

impl KubernetesInventory {
    pub fn new(
        api_url: impl Into<String>,
        token: Option<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| GatewayError::Config(format!("Failed to build inventory client: {}", e)))?;

        Ok(Self {
            client,
            api_url: api_url.into().trim_end_matches('/').to_string(),
            token,
        })
    }

    fn collection_path(resource: ResourceType, namespace: &str) -> String {
        let (group, kind) = match resource {
            ResourceType::Deployment => ("/apis/apps/v1", "deployments"),
            ResourceType::Pod => ("/api/v1", "pods"),
        };
        if namespace.is_empty() {
            format!("{}/{}", group, kind)
        } else {
            format!("{}/namespaces/{}/{}", group, namespace, kind)
        }
    }

    async fn get(&self, path: &str) -> Result<reqwest::Response> {
        let mut request = self.client.get(format!("{}{}", self.api_url, path));
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| GatewayError::InventoryUnavailable(e.to_string()))?;

        if !response.status().is_success() {
            let err = GatewayError::InventoryUnavailable(format!(
                "GET {} answered {}",
                path,
                response.status()
            ));
            error!(%err, "inventory listing failed");
            return Err(err);
        }
        Ok(response)
    }
}

#[async_trait]
impl ResourceInventory for KubernetesInventory {
    async fn list_resources(
        &self,
        resource: ResourceType,
        namespace: &str,
    ) -> Result<Vec<ResourceDescriptor>> {
        let path = Self::collection_path(resource, namespace);
        debug!(%resource, namespace, "Listing resources");

        let list: ObjectList = self
            .get(&path)
            .await?
            .json()
            .await
            .map_err(|e| GatewayError::InventoryUnavailable(format!("undecodable list: {}", e)))?;

        Ok(list.items.into_iter().map(ResourceDescriptor::from).collect())
    }

    async fn check(&self) -> Result<()> {
        self.get("/version").await.map(|_| ())
    }
}
