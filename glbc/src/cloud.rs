//! Narrow per-resource capability traits over the compute API.
//!
//! The pools only ever see these traits, so the REST adapter in
//! [`crate::gce`] and the in-memory fakes in [`crate::fakes`] are
//! interchangeable.

use std::sync::Arc;

use async_trait::async_trait;
use glbc_apis::{
    BackendService, BackendServiceGroupHealth, ForwardingRule, HttpHealthCheck, InstanceGroup,
    InstanceWithNamedPorts, NamedPort, NodePort, TargetHttpProxy, UrlMap,
};

use crate::errors::CloudError;

pub(crate) type CloudResult<T> = Result<T, CloudError>;

#[async_trait]
pub(crate) trait BackendServices: Send + Sync {
    async fn get_backend_service(&self, name: &str) -> CloudResult<BackendService>;
    async fn create_backend_service(&self, be: &BackendService) -> CloudResult<()>;
    async fn update_backend_service(&self, be: &BackendService) -> CloudResult<()>;
    async fn delete_backend_service(&self, name: &str) -> CloudResult<()>;
    /// Health of the instances of `instance_group_link` as seen by the backend.
    async fn get_health(
        &self,
        name: &str,
        instance_group_link: &str,
    ) -> CloudResult<BackendServiceGroupHealth>;
}

#[async_trait]
pub(crate) trait InstanceGroups: Send + Sync {
    async fn get_instance_group(&self, name: &str, zone: &str) -> CloudResult<InstanceGroup>;
    async fn create_instance_group(&self, name: &str, zone: &str) -> CloudResult<InstanceGroup>;
    async fn delete_instance_group(&self, name: &str, zone: &str) -> CloudResult<()>;
    async fn list_instances_in_instance_group(
        &self,
        name: &str,
        zone: &str,
        state: &str,
    ) -> CloudResult<Vec<InstanceWithNamedPorts>>;
    async fn add_instances_to_instance_group(
        &self,
        name: &str,
        zone: &str,
        instance_names: &[String],
    ) -> CloudResult<()>;
    async fn remove_instances_from_instance_group(
        &self,
        name: &str,
        zone: &str,
        instance_names: &[String],
    ) -> CloudResult<()>;
    /// Adds a named port `k8s-be-<port>` to the group and returns it.
    async fn add_port_to_instance_group(
        &self,
        ig: &InstanceGroup,
        port: NodePort,
    ) -> CloudResult<NamedPort>;
}

#[async_trait]
pub(crate) trait ForwardingRules: Send + Sync {
    async fn get_global_forwarding_rule(&self, name: &str) -> CloudResult<ForwardingRule>;
    async fn create_global_forwarding_rule(
        &self,
        proxy: &TargetHttpProxy,
        name: &str,
        port_range: &str,
    ) -> CloudResult<ForwardingRule>;
    async fn delete_global_forwarding_rule(&self, name: &str) -> CloudResult<()>;
    async fn set_proxy_for_global_forwarding_rule(
        &self,
        fw: &ForwardingRule,
        proxy: &TargetHttpProxy,
    ) -> CloudResult<()>;
}

#[async_trait]
pub(crate) trait TargetHttpProxies: Send + Sync {
    async fn get_target_http_proxy(&self, name: &str) -> CloudResult<TargetHttpProxy>;
    async fn create_target_http_proxy(
        &self,
        url_map: &UrlMap,
        name: &str,
    ) -> CloudResult<TargetHttpProxy>;
    async fn delete_target_http_proxy(&self, name: &str) -> CloudResult<()>;
    async fn set_url_map_for_target_http_proxy(
        &self,
        proxy: &TargetHttpProxy,
        url_map: &UrlMap,
    ) -> CloudResult<()>;
}

#[async_trait]
pub(crate) trait UrlMaps: Send + Sync {
    async fn get_url_map(&self, name: &str) -> CloudResult<UrlMap>;
    async fn create_url_map(&self, backend: &BackendService, name: &str) -> CloudResult<UrlMap>;
    async fn update_url_map(&self, url_map: &UrlMap) -> CloudResult<UrlMap>;
    async fn delete_url_map(&self, name: &str) -> CloudResult<()>;
}

#[async_trait]
pub(crate) trait HttpHealthChecks: Send + Sync {
    async fn get_http_health_check(&self, name: &str) -> CloudResult<HttpHealthCheck>;
    async fn create_http_health_check(&self, hc: &HttpHealthCheck) -> CloudResult<()>;
    async fn delete_http_health_check(&self, name: &str) -> CloudResult<()>;
}

/// Everything an L7 needs: forwarding rule, target proxy and url map.
pub(crate) trait LoadBalancers: ForwardingRules + TargetHttpProxies + UrlMaps {}

impl<T: ForwardingRules + TargetHttpProxies + UrlMaps> LoadBalancers for T {}

/// The set of cloud clients handed to the cluster manager.
#[derive(Clone)]
pub(crate) struct CloudClients {
    pub(crate) backend_services: Arc<dyn BackendServices>,
    pub(crate) instance_groups: Arc<dyn InstanceGroups>,
    pub(crate) load_balancers: Arc<dyn LoadBalancers>,
    pub(crate) health_checks: Arc<dyn HttpHealthChecks>,
}

impl CloudClients {
    /// Uses one provider implementing every capability for all clients.
    pub(crate) fn from_provider<C>(cloud: Arc<C>) -> Self
    where
        C: BackendServices + InstanceGroups + LoadBalancers + HttpHealthChecks + 'static,
    {
        Self {
            backend_services: cloud.clone(),
            instance_groups: cloud.clone(),
            load_balancers: cloud.clone(),
            health_checks: cloud,
        }
    }
}
