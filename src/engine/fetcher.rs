//! Kubernetes-backed [`ResourceFetcher`].

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Namespace, Node};
use kube::{Api, Client};

use crate::engine::pipeline::{FetchError, ResourceFetcher};

/// Fetches namespace and node manifests through the cluster API.
#[derive(Clone)]
pub struct KubeResourceFetcher {
    client: Client,
}

impl KubeResourceFetcher {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ResourceFetcher for KubeResourceFetcher {
    async fn get_namespace(&self, name: &str) -> Result<serde_json::Value, FetchError> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let manifest = api
            .get(name)
            .await
            .map_err(|e| FetchError(format!("failed to retrieve namespace '{}': {}", name, e)))?;
        serde_json::to_value(&manifest)
            .map_err(|e| FetchError(format!("failed to serialize namespace '{}': {}", name, e)))
    }

    async fn get_node(&self, name: &str) -> Result<serde_json::Value, FetchError> {
        let api: Api<Node> = Api::all(self.client.clone());
        let manifest = api
            .get(name)
            .await
            .map_err(|e| FetchError(format!("failed to retrieve node '{}': {}", name, e)))?;
        serde_json::to_value(&manifest)
            .map_err(|e| FetchError(format!("failed to serialize node '{}': {}", name, e)))
    }
}
