//! Compute v1 REST adapter implementing the cloud capability traits.
//!
//! Mutations return a long running operation, every mutating call waits for
//! its operation to finish so callers observe the resulting state. Access
//! tokens and, when not configured, project and zone come from the GCE
//! metadata server.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use glbc_apis::{
    BackendService, BackendServiceGroupHealth, ForwardingRule, HttpHealthCheck, InstanceGroup,
    InstanceGroupsListInstances, InstanceWithNamedPorts, NamedPort, NodePort, TargetHttpProxy,
    UrlMap, name_from_link, names::be_name,
};
use opentelemetry::{
    KeyValue,
    global::{self},
    metrics::{Counter, Meter},
};
use reqwest::{Method, RequestBuilder, Response, StatusCode, header::ACCEPT};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::json;
use tokio::{sync::Mutex, time::sleep};

use crate::{
    cloud::{
        BackendServices, CloudResult, ForwardingRules, HttpHealthChecks, InstanceGroups,
        TargetHttpProxies, UrlMaps,
    },
    errors::CloudError,
    utils::metric_name,
};

const GCE_CLOUD: &'static str = "gce_cloud";

const COMPUTE_ENDPOINT: &'static str = "https://compute.googleapis.com/compute/v1";
const METADATA_ENDPOINT: &'static str = "http://metadata.google.internal/computeMetadata/v1";

const OPERATION_POLL_INTERVAL: Duration = Duration::from_secs(1);
const OPERATION_TIMEOUT: Duration = Duration::from_secs(600);
/// Tokens are refreshed this long before they expire.
const TOKEN_EXPIRY_MARGIN: Duration = Duration::from_secs(60);

#[derive(Deserialize)]
struct AccessToken {
    access_token: String,
    expires_in: u64,
}

struct CachedToken {
    token: String,
    expires_at: Instant,
}

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
struct Operation {
    name: String,
    #[serde(default)]
    self_link: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    error: Option<OperationErrors>,
}

#[derive(Deserialize, Debug, Default)]
struct OperationErrors {
    #[serde(default)]
    errors: Vec<OperationError>,
}

#[derive(Deserialize, Debug, Default)]
struct OperationError {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
}

impl Operation {
    fn is_done(&self) -> bool {
        self.status == "DONE"
    }

    fn into_result(self) -> CloudResult<()> {
        match self.error {
            Some(error) if !error.errors.is_empty() => Err(CloudError::Operation {
                name: self.name,
                message: error
                    .errors
                    .iter()
                    .map(|e| format!("{}: {}", e.code, e.message))
                    .collect::<Vec<String>>()
                    .join(", "),
            }),
            _ => Ok(()),
        }
    }
}

#[derive(Deserialize)]
struct ApiErrorBody {
    error: ApiErrorDetail,
}

#[derive(Deserialize)]
struct ApiErrorDetail {
    #[serde(default)]
    message: String,
}

/// Maps a non-success response body to a [`CloudError::Api`].
fn api_error(status: StatusCode, body: &str) -> CloudError {
    let message = serde_json::from_str::<ApiErrorBody>(body)
        .map(|b| b.error.message)
        .unwrap_or_else(|_| body.to_string());
    CloudError::Api {
        code: status.as_u16(),
        message,
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct InstanceReference {
    instance: String,
}

pub(crate) struct GceCloud {
    client: reqwest::Client,
    project: String,
    zone: String,
    token: Mutex<Option<CachedToken>>,
    api_calls: Counter<u64>,
    api_errors: Counter<u64>,
}

impl GceCloud {
    fn with_project(client: reqwest::Client, project: String, zone: String) -> Self {
        let meter: Meter = global::meter(GCE_CLOUD);
        let api_calls = meter
            .u64_counter(metric_name("gce_api_calls"))
            .with_description("Count of compute API requests")
            .build();
        let api_errors = meter
            .u64_counter(metric_name("gce_api_errors"))
            .with_description("Count of failed compute API requests")
            .build();
        Self {
            client,
            project,
            zone,
            token: Default::default(),
            api_calls,
            api_errors,
        }
    }

    /// Creates the adapter, asking the metadata server for whatever of
    /// project and zone is not given.
    pub(crate) async fn new(
        project: Option<String>,
        zone: Option<String>,
    ) -> Result<Self, CloudError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()?;
        let project = match project {
            Some(project) => project,
            None => metadata(&client, "project/project-id").await?,
        };
        let zone = match zone {
            Some(zone) => zone,
            None => name_from_link(&metadata(&client, "instance/zone").await?).to_string(),
        };
        info!("using GCE project {} in zone {}", project, zone);
        Ok(Self::with_project(client, project, zone))
    }

    pub(crate) fn zone(&self) -> &str {
        &self.zone
    }

    fn global_url(&self, path: &str) -> String {
        format!(
            "{}/projects/{}/global/{}",
            COMPUTE_ENDPOINT, self.project, path
        )
    }

    fn zonal_url(&self, zone: &str, path: &str) -> String {
        format!(
            "{}/projects/{}/zones/{}/{}",
            COMPUTE_ENDPOINT, self.project, zone, path
        )
    }

    fn instance_link(&self, zone: &str, name: &str) -> String {
        self.zonal_url(zone, &format!("instances/{}", name))
    }

    async fn token(&self) -> CloudResult<String> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            if Instant::now() + TOKEN_EXPIRY_MARGIN < token.expires_at {
                return Ok(token.token.clone());
            }
        }
        debug!("refreshing compute API access token");
        let body = metadata(&self.client, "instance/service-accounts/default/token").await?;
        let token: AccessToken = serde_json::from_str(&body)?;
        *cached = Some(CachedToken {
            token: token.access_token.clone(),
            expires_at: Instant::now() + Duration::from_secs(token.expires_in),
        });
        Ok(token.access_token)
    }

    async fn send(&self, request: RequestBuilder, operation: &'static str) -> CloudResult<Response> {
        let labels = &[KeyValue::new("operation", operation)];
        self.api_calls.add(1, labels);
        let response = request
            .header(ACCEPT, "application/json")
            .bearer_auth(self.token().await?)
            .send()
            .await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        self.api_errors.add(1, labels);
        let body = response.text().await.unwrap_or_default();
        Err(api_error(status, &body))
    }

    async fn get<T: DeserializeOwned>(&self, url: String, operation: &'static str) -> CloudResult<T> {
        Ok(self
            .send(self.client.get(url), operation)
            .await?
            .json::<T>()
            .await?)
    }

    /// Issues a mutation and waits for the resulting operation.
    async fn mutate<B: Serialize + ?Sized>(
        &self,
        method: Method,
        url: String,
        body: Option<&B>,
        operation: &'static str,
    ) -> CloudResult<()> {
        let mut request = self.client.request(method, url);
        if let Some(body) = body {
            request = request.json(body);
        }
        let op: Operation = self.send(request, operation).await?.json().await?;
        self.wait_for_operation(op).await
    }

    async fn delete(&self, url: String, operation: &'static str) -> CloudResult<()> {
        self.mutate::<()>(Method::DELETE, url, None, operation)
            .await
    }

    async fn wait_for_operation(&self, mut op: Operation) -> CloudResult<()> {
        let deadline = Instant::now() + OPERATION_TIMEOUT;
        while !op.is_done() {
            if Instant::now() > deadline {
                return Err(CloudError::Operation {
                    name: op.name,
                    message: format!("not done after {:?}", OPERATION_TIMEOUT),
                });
            }
            sleep(OPERATION_POLL_INTERVAL).await;
            let link = op.self_link.clone();
            op = self.get(link, "operation").await?;
        }
        debug!("operation {} done", op.name);
        op.into_result()
    }
}

async fn metadata(client: &reqwest::Client, path: &str) -> CloudResult<String> {
    let response = client
        .get(format!("{}/{}", METADATA_ENDPOINT, path))
        .header("Metadata-Flavor", "Google")
        .send()
        .await?;
    let status = response.status();
    let body = response.text().await?;
    if !status.is_success() {
        return Err(CloudError::Any(anyhow::anyhow!(
            "metadata server returned {} for {}: {}",
            status,
            path,
            body
        )));
    }
    Ok(body.trim().to_string())
}

#[async_trait]
impl BackendServices for GceCloud {
    async fn get_backend_service(&self, name: &str) -> CloudResult<BackendService> {
        self.get(self.global_url(&format!("backendServices/{}", name)), "backendServices.get")
            .await
    }

    async fn create_backend_service(&self, be: &BackendService) -> CloudResult<()> {
        self.mutate(
            Method::POST,
            self.global_url("backendServices"),
            Some(be),
            "backendServices.insert",
        )
        .await
    }

    async fn update_backend_service(&self, be: &BackendService) -> CloudResult<()> {
        self.mutate(
            Method::PUT,
            self.global_url(&format!("backendServices/{}", be.name)),
            Some(be),
            "backendServices.update",
        )
        .await
    }

    async fn delete_backend_service(&self, name: &str) -> CloudResult<()> {
        self.delete(
            self.global_url(&format!("backendServices/{}", name)),
            "backendServices.delete",
        )
        .await
    }

    async fn get_health(
        &self,
        name: &str,
        instance_group_link: &str,
    ) -> CloudResult<BackendServiceGroupHealth> {
        let request = self
            .client
            .post(self.global_url(&format!("backendServices/{}/getHealth", name)))
            .json(&json!({ "group": instance_group_link }));
        Ok(self
            .send(request, "backendServices.getHealth")
            .await?
            .json()
            .await?)
    }
}

#[async_trait]
impl InstanceGroups for GceCloud {
    async fn get_instance_group(&self, name: &str, zone: &str) -> CloudResult<InstanceGroup> {
        self.get(
            self.zonal_url(zone, &format!("instanceGroups/{}", name)),
            "instanceGroups.get",
        )
        .await
    }

    async fn create_instance_group(&self, name: &str, zone: &str) -> CloudResult<InstanceGroup> {
        self.mutate(
            Method::POST,
            self.zonal_url(zone, "instanceGroups"),
            Some(&json!({ "name": name })),
            "instanceGroups.insert",
        )
        .await?;
        self.get_instance_group(name, zone).await
    }

    async fn delete_instance_group(&self, name: &str, zone: &str) -> CloudResult<()> {
        self.delete(
            self.zonal_url(zone, &format!("instanceGroups/{}", name)),
            "instanceGroups.delete",
        )
        .await
    }

    async fn list_instances_in_instance_group(
        &self,
        name: &str,
        zone: &str,
        state: &str,
    ) -> CloudResult<Vec<InstanceWithNamedPorts>> {
        let url = self.zonal_url(zone, &format!("instanceGroups/{}/listInstances", name));
        let mut instances = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut request = self
                .client
                .post(&url)
                .json(&json!({ "instanceState": state }));
            if let Some(token) = &page_token {
                request = request.query(&[("pageToken", token)]);
            }
            let page: InstanceGroupsListInstances = self
                .send(request, "instanceGroups.listInstances")
                .await?
                .json()
                .await?;
            instances.extend(page.items);
            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }
        Ok(instances)
    }

    async fn add_instances_to_instance_group(
        &self,
        name: &str,
        zone: &str,
        instance_names: &[String],
    ) -> CloudResult<()> {
        let instances: Vec<InstanceReference> = instance_names
            .iter()
            .map(|n| InstanceReference {
                instance: self.instance_link(zone, n),
            })
            .collect();
        self.mutate(
            Method::POST,
            self.zonal_url(zone, &format!("instanceGroups/{}/addInstances", name)),
            Some(&json!({ "instances": instances })),
            "instanceGroups.addInstances",
        )
        .await
    }

    async fn remove_instances_from_instance_group(
        &self,
        name: &str,
        zone: &str,
        instance_names: &[String],
    ) -> CloudResult<()> {
        let instances: Vec<InstanceReference> = instance_names
            .iter()
            .map(|n| InstanceReference {
                instance: self.instance_link(zone, n),
            })
            .collect();
        self.mutate(
            Method::POST,
            self.zonal_url(zone, &format!("instanceGroups/{}/removeInstances", name)),
            Some(&json!({ "instances": instances })),
            "instanceGroups.removeInstances",
        )
        .await
    }

    async fn add_port_to_instance_group(
        &self,
        ig: &InstanceGroup,
        port: NodePort,
    ) -> CloudResult<NamedPort> {
        if let Some(existing) = ig.named_port(port) {
            return Ok(existing.clone());
        }
        let named_port = NamedPort {
            name: be_name(port),
            port,
        };
        let mut named_ports = ig.named_ports.clone();
        named_ports.push(named_port.clone());
        let zone = if ig.zone.is_empty() {
            self.zone.as_str()
        } else {
            name_from_link(&ig.zone)
        };
        info!("adding port {} to instance group {}", port, ig.name);
        self.mutate(
            Method::POST,
            self.zonal_url(zone, &format!("instanceGroups/{}/setNamedPorts", ig.name)),
            Some(&json!({
                "namedPorts": named_ports,
                "fingerprint": ig.fingerprint,
            })),
            "instanceGroups.setNamedPorts",
        )
        .await?;
        Ok(named_port)
    }
}

#[async_trait]
impl ForwardingRules for GceCloud {
    async fn get_global_forwarding_rule(&self, name: &str) -> CloudResult<ForwardingRule> {
        self.get(
            self.global_url(&format!("forwardingRules/{}", name)),
            "globalForwardingRules.get",
        )
        .await
    }

    async fn create_global_forwarding_rule(
        &self,
        proxy: &TargetHttpProxy,
        name: &str,
        port_range: &str,
    ) -> CloudResult<ForwardingRule> {
        let rule = ForwardingRule {
            name: name.to_string(),
            target: proxy.self_link.clone(),
            port_range: port_range.to_string(),
            ip_protocol: "TCP".to_string(),
            ..Default::default()
        };
        self.mutate(
            Method::POST,
            self.global_url("forwardingRules"),
            Some(&rule),
            "globalForwardingRules.insert",
        )
        .await?;
        self.get_global_forwarding_rule(name).await
    }

    async fn delete_global_forwarding_rule(&self, name: &str) -> CloudResult<()> {
        self.delete(
            self.global_url(&format!("forwardingRules/{}", name)),
            "globalForwardingRules.delete",
        )
        .await
    }

    async fn set_proxy_for_global_forwarding_rule(
        &self,
        fw: &ForwardingRule,
        proxy: &TargetHttpProxy,
    ) -> CloudResult<()> {
        self.mutate(
            Method::POST,
            self.global_url(&format!("forwardingRules/{}/setTarget", fw.name)),
            Some(&json!({ "target": proxy.self_link })),
            "globalForwardingRules.setTarget",
        )
        .await
    }
}

#[async_trait]
impl TargetHttpProxies for GceCloud {
    async fn get_target_http_proxy(&self, name: &str) -> CloudResult<TargetHttpProxy> {
        self.get(
            self.global_url(&format!("targetHttpProxies/{}", name)),
            "targetHttpProxies.get",
        )
        .await
    }

    async fn create_target_http_proxy(
        &self,
        url_map: &UrlMap,
        name: &str,
    ) -> CloudResult<TargetHttpProxy> {
        let proxy = TargetHttpProxy {
            name: name.to_string(),
            url_map: url_map.self_link.clone(),
            ..Default::default()
        };
        self.mutate(
            Method::POST,
            self.global_url("targetHttpProxies"),
            Some(&proxy),
            "targetHttpProxies.insert",
        )
        .await?;
        self.get_target_http_proxy(name).await
    }

    async fn delete_target_http_proxy(&self, name: &str) -> CloudResult<()> {
        self.delete(
            self.global_url(&format!("targetHttpProxies/{}", name)),
            "targetHttpProxies.delete",
        )
        .await
    }

    async fn set_url_map_for_target_http_proxy(
        &self,
        proxy: &TargetHttpProxy,
        url_map: &UrlMap,
    ) -> CloudResult<()> {
        self.mutate(
            Method::POST,
            self.global_url(&format!("targetHttpProxies/{}/setUrlMap", proxy.name)),
            Some(&json!({ "urlMap": url_map.self_link })),
            "targetHttpProxies.setUrlMap",
        )
        .await
    }
}

#[async_trait]
impl UrlMaps for GceCloud {
    async fn get_url_map(&self, name: &str) -> CloudResult<UrlMap> {
        self.get(self.global_url(&format!("urlMaps/{}", name)), "urlMaps.get")
            .await
    }

    async fn create_url_map(&self, backend: &BackendService, name: &str) -> CloudResult<UrlMap> {
        let url_map = UrlMap {
            name: name.to_string(),
            default_service: backend.self_link.clone(),
            ..Default::default()
        };
        self.mutate(
            Method::POST,
            self.global_url("urlMaps"),
            Some(&url_map),
            "urlMaps.insert",
        )
        .await?;
        self.get_url_map(name).await
    }

    async fn update_url_map(&self, url_map: &UrlMap) -> CloudResult<UrlMap> {
        self.mutate(
            Method::PUT,
            self.global_url(&format!("urlMaps/{}", url_map.name)),
            Some(url_map),
            "urlMaps.update",
        )
        .await?;
        self.get_url_map(&url_map.name).await
    }

    async fn delete_url_map(&self, name: &str) -> CloudResult<()> {
        self.delete(self.global_url(&format!("urlMaps/{}", name)), "urlMaps.delete")
            .await
    }
}

#[async_trait]
impl HttpHealthChecks for GceCloud {
    async fn get_http_health_check(&self, name: &str) -> CloudResult<HttpHealthCheck> {
        self.get(
            self.global_url(&format!("httpHealthChecks/{}", name)),
            "httpHealthChecks.get",
        )
        .await
    }

    async fn create_http_health_check(&self, hc: &HttpHealthCheck) -> CloudResult<()> {
        self.mutate(
            Method::POST,
            self.global_url("httpHealthChecks"),
            Some(hc),
            "httpHealthChecks.insert",
        )
        .await
    }

    async fn delete_http_health_check(&self, name: &str) -> CloudResult<()> {
        self.delete(
            self.global_url(&format!("httpHealthChecks/{}", name)),
            "httpHealthChecks.delete",
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cloud() -> GceCloud {
        GceCloud::with_project(
            reqwest::Client::new(),
            "my-project".to_string(),
            "us-central1-b".to_string(),
        )
    }

    #[test]
    fn resource_urls() {
        let gce = cloud();
        assert_eq!(
            "https://compute.googleapis.com/compute/v1/projects/my-project/global/urlMaps/k8s-um-default-foo",
            gce.global_url("urlMaps/k8s-um-default-foo")
        );
        assert_eq!(
            "https://compute.googleapis.com/compute/v1/projects/my-project/zones/us-central1-b/instances/n1",
            gce.instance_link(gce.zone(), "n1")
        );
    }

    #[test]
    fn api_errors_keep_status_and_message() {
        let e = api_error(
            StatusCode::NOT_FOUND,
            r#"{"error":{"code":404,"message":"The resource 'k8s-be-30001' was not found"}}"#,
        );
        assert!(e.is_not_found());
        assert_eq!(
            "compute API error 404: The resource 'k8s-be-30001' was not found",
            e.to_string()
        );
        let e = api_error(StatusCode::BAD_GATEWAY, "upstream hiccup");
        assert!(!e.is_not_found());
        assert_eq!("compute API error 502: upstream hiccup", e.to_string());
    }

    #[test]
    fn operation_errors() {
        let op: Operation = serde_json::from_str(
            r#"{
                "name": "operation-1",
                "status": "DONE",
                "error": {"errors": [{"code": "RESOURCE_IN_USE_BY_ANOTHER_RESOURCE", "message": "in use"}]}
            }"#,
        )
        .unwrap();
        assert!(op.is_done());
        match op.into_result() {
            Err(CloudError::Operation { name, message }) => {
                assert_eq!("operation-1", name);
                assert_eq!("RESOURCE_IN_USE_BY_ANOTHER_RESOURCE: in use", message);
            }
            other => panic!("unexpected {:?}", other),
        }

        let op: Operation =
            serde_json::from_str(r#"{"name": "operation-2", "status": "RUNNING"}"#).unwrap();
        assert!(!op.is_done());
        assert!(op.into_result().is_ok());
    }
}
