use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use reqwest::{Client, Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use std::time::Duration;

use super::Backend;
use crate::config::BackendConfig;
use crate::error::{Error, Result};
use crate::models::cluster::{
    ClusterHeader, ClusterNode, ClusterRequest, ClusterResource, ClusterTopology, HelmApp,
    LogEntry, NodeResources, ProvisionRequest,
};
use crate::models::status::{AppStatusEntry, KubeStatusEntry, VmStatusEntry};

/// REST client for the provisioning backend.
pub struct BackendClient {
    pub address: String,
    http: Client,
    // No timeout: cluster creation runs as long as the backend needs.
    long_http: Client,
    authorization: Option<String>,
}

impl BackendClient {
    pub fn new(cfg: &BackendConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(cfg.request_timeout_secs))
            .build()?;
        let long_http = Client::builder().build()?;

        let authorization = cfg.username.as_ref().map(|user| {
            let pass = cfg.password.as_deref().unwrap_or_default();
            format!("Basic {}", STANDARD.encode(format!("{}:{}", user, pass)))
        });

        Ok(Self {
            address: cfg.base_url.trim_end_matches('/').to_string(),
            http,
            long_http,
            authorization,
        })
    }

    fn request(&self, client: &Client, method: Method, path: &str) -> RequestBuilder {
        let mut req = client
            .request(method, format!("{}{}", self.address, path))
            .header("Accept", "application/json");
        if let Some(auth) = &self.authorization {
            req = req.header("Authorization", auth);
        }
        req
    }

    async fn check(method: &'static str, path: &str, resp: Response) -> Result<Response> {
        if resp.status().as_u16() >= 400 {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::Backend {
                method,
                path: path.to_string(),
                status,
                body,
            });
        }
        Ok(resp)
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let resp = self.request(&self.http, Method::GET, path).send().await?;
        Ok(Self::check("GET", path, resp).await?.json().await?)
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: &impl serde::Serialize,
    ) -> Result<T> {
        let name = method_name(&method);
        let resp = self
            .request(&self.http, method, path)
            .header("Content-Type", "application/json")
            .json(body)
            .send()
            .await?;
        Ok(Self::check(name, path, resp).await?.json().await?)
    }

    async fn send_body(
        &self,
        method: Method,
        path: &str,
        body: &(impl serde::Serialize + Sync),
    ) -> Result<()> {
        let name = method_name(&method);
        let resp = self
            .request(&self.http, method, path)
            .header("Content-Type", "application/json")
            .json(body)
            .send()
            .await?;
        Self::check(name, path, resp).await?;
        Ok(())
    }

    async fn send_empty(&self, method: Method, path: &str) -> Result<()> {
        let name = method_name(&method);
        let resp = self.request(&self.http, method, path).send().await?;
        Self::check(name, path, resp).await?;
        Ok(())
    }
}

fn method_name(method: &Method) -> &'static str {
    match *method {
        Method::GET => "GET",
        Method::POST => "POST",
        Method::PUT => "PUT",
        Method::DELETE => "DELETE",
        _ => "REQUEST",
    }
}

/// Names and ids come from request paths; each is encoded as one segment.
fn cluster_path(name: &str) -> String {
    format!("/api/v1/clusters/{}", urlencoding::encode(name))
}

fn item_path(name: &str, collection: &str, id: &str) -> String {
    format!("{}/{}/{}", cluster_path(name), collection, urlencoding::encode(id))
}

#[async_trait]
impl Backend for BackendClient {
    async fn get_clusters(&self) -> Result<Vec<ClusterHeader>> {
        self.get_json("/api/v1/clusters").await
    }

    async fn get_cluster(&self, name: &str) -> Result<ClusterTopology> {
        self.get_json(&cluster_path(name)).await
    }

    async fn get_cluster_nodes(&self, name: &str) -> Result<Vec<ClusterNode>> {
        self.get_json(&format!("{}/nodes", cluster_path(name))).await
    }

    async fn delete_cluster(&self, name: &str) -> Result<()> {
        self.send_empty(Method::DELETE, &cluster_path(name)).await
    }

    async fn get_vm_status(&self, name: &str) -> Result<Vec<VmStatusEntry>> {
        self.get_json(&format!("{}/status/vms", cluster_path(name))).await
    }

    async fn get_kube_status(&self, name: &str) -> Result<Vec<KubeStatusEntry>> {
        self.get_json(&format!("{}/status/kube", cluster_path(name))).await
    }

    async fn get_apps_status(&self, name: &str) -> Result<Vec<AppStatusEntry>> {
        self.get_json(&format!("{}/apps/status", cluster_path(name))).await
    }

    async fn add_node(&self, name: &str, node: &ClusterNode) -> Result<ClusterNode> {
        self.send_json(Method::POST, &format!("{}/nodes", cluster_path(name)), node)
            .await
    }

    async fn change_node_resources(
        &self,
        name: &str,
        node_name: &str,
        resources: NodeResources,
    ) -> Result<()> {
        let path = format!("{}/resources", item_path(name, "nodes", node_name));
        self.send_body(Method::PUT, &path, &resources).await
    }

    async fn delete_node(&self, name: &str, node_name: &str) -> Result<ClusterNode> {
        let path = item_path(name, "nodes", node_name);
        let resp = self.request(&self.http, Method::DELETE, &path).send().await?;
        Ok(Self::check("DELETE", &path, resp).await?.json().await?)
    }

    async fn save_helm_app(&self, name: &str, app: &HelmApp) -> Result<String> {
        self.send_json(Method::POST, &format!("{}/apps", cluster_path(name)), app)
            .await
    }

    async fn update_helm_app(&self, name: &str, app: &HelmApp) -> Result<()> {
        let path = format!("{}/apps", cluster_path(name));
        self.send_body(Method::PUT, &path, app).await
    }

    async fn install_helm_app(&self, name: &str, id: &str) -> Result<()> {
        let path = format!("{}/install", item_path(name, "apps", id));
        self.send_empty(Method::POST, &path).await
    }

    async fn uninstall_helm_app(&self, name: &str, id: &str) -> Result<()> {
        let path = format!("{}/uninstall", item_path(name, "apps", id));
        self.send_empty(Method::DELETE, &path).await
    }

    async fn delete_helm_app(&self, name: &str, id: &str) -> Result<()> {
        let path = item_path(name, "apps", id);
        self.send_empty(Method::DELETE, &path).await
    }

    async fn save_cluster_resource(
        &self,
        name: &str,
        resource: &ClusterResource,
    ) -> Result<String> {
        let path = format!("{}/cluster-resources", cluster_path(name));
        self.send_json(Method::POST, &path, resource).await
    }

    async fn update_cluster_resource(
        &self,
        name: &str,
        resource: &ClusterResource,
    ) -> Result<()> {
        let path = format!("{}/cluster-resources", cluster_path(name));
        self.send_body(Method::PUT, &path, resource).await
    }

    async fn install_cluster_resource(&self, name: &str, id: &str) -> Result<()> {
        let path = format!("{}/install", item_path(name, "cluster-resources", id));
        self.send_empty(Method::POST, &path).await
    }

    async fn uninstall_cluster_resource(&self, name: &str, id: &str) -> Result<()> {
        let path = format!("{}/uninstall", item_path(name, "cluster-resources", id));
        self.send_empty(Method::DELETE, &path).await
    }

    async fn delete_cluster_resource(&self, name: &str, id: &str) -> Result<()> {
        let path = item_path(name, "cluster-resources", id);
        self.send_empty(Method::DELETE, &path).await
    }

    async fn generate_default_cluster(&self) -> Result<ClusterRequest> {
        self.get_json("/api/v1/clusters/generate").await
    }

    async fn create_cluster(&self, request: &ProvisionRequest) -> Result<()> {
        let path = "/api/v1/clusters";
        let resp = self
            .request(&self.long_http, Method::POST, path)
            .header("Content-Type", "application/json")
            .json(request)
            .send()
            .await?;
        Self::check("POST", path, resp).await?;
        Ok(())
    }

    async fn get_task_log(&self, name: &str) -> Result<Vec<LogEntry>> {
        self.get_json(&format!("{}/logs", cluster_path(name))).await
    }

    async fn clear_task_log(&self, name: &str) -> Result<()> {
        let path = format!("{}/logs", cluster_path(name));
        self.send_empty(Method::DELETE, &path).await
    }
}
