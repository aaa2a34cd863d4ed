//! Typed model of the GCE compute resources managed by the L7 load-balancer
//! controller, in the JSON shape of the compute v1 REST API.

use serde::{Deserialize, Serialize};

pub mod names;

/// Service node port, the identity of a backend service.
pub type NodePort = i64;

/// State string required by the compute API to list all instances of a group.
pub const ALL_INSTANCES: &'static str = "ALL";

/// Returns true if the two self links are equal and non-empty.
pub fn compare_links(l1: &str, l2: &str) -> bool {
    l1 == l2 && !l1.is_empty()
}

/// Returns the last path segment of a self link, which is the resource name.
pub fn name_from_link(link: &str) -> &str {
    link.rsplit('/').next().unwrap_or(link)
}

#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Backend {
    /// Self link of the instance group serving this backend.
    #[serde(default)]
    pub group: String,
}

#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BackendService {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub self_link: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub protocol: String,
    #[serde(default)]
    pub backends: Vec<Backend>,
    /// The API expects exactly one, it means little to kubernetes.
    #[serde(default)]
    pub health_checks: Vec<String>,
    #[serde(default)]
    pub port: NodePort,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub port_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
}

impl BackendService {
    /// Returns true if this backend points at exactly the given instance group.
    pub fn links_to(&self, instance_group_link: &str) -> bool {
        self.backends.len() == 1 && compare_links(&self.backends[0].group, instance_group_link)
    }
}

#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct HealthStatus {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub instance: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ip_address: String,
    #[serde(default)]
    pub port: i64,
    #[serde(default)]
    pub health_state: String,
}

#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BackendServiceGroupHealth {
    #[serde(default)]
    pub health_status: Vec<HealthStatus>,
}

#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NamedPort {
    pub name: String,
    pub port: NodePort,
}

#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct InstanceGroup {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub self_link: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub zone: String,
    #[serde(default)]
    pub named_ports: Vec<NamedPort>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
}

impl InstanceGroup {
    pub fn named_port(&self, port: NodePort) -> Option<&NamedPort> {
        self.named_ports.iter().find(|np| np.port == port)
    }
}

#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct InstanceWithNamedPorts {
    /// Self link of the VM instance.
    pub instance: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub status: String,
}

impl InstanceWithNamedPorts {
    /// The instance name, which is the kubernetes node name.
    pub fn node_name(&self) -> &str {
        name_from_link(&self.instance)
    }
}

#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct InstanceGroupsListInstances {
    #[serde(default)]
    pub items: Vec<InstanceWithNamedPorts>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_page_token: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct HttpHealthCheck {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub self_link: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default)]
    pub port: i64,
    #[serde(default)]
    pub request_path: String,
    /// How often to health check.
    #[serde(default)]
    pub check_interval_sec: i64,
    /// How long to wait before claiming failure of a health check.
    #[serde(default)]
    pub timeout_sec: i64,
    /// Number of healthchecks to pass for a vm to be deemed healthy.
    #[serde(default)]
    pub healthy_threshold: i64,
    /// Number of healthchecks to fail before the vm is deemed unhealthy.
    #[serde(default)]
    pub unhealthy_threshold: i64,
}

#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PathRule {
    pub paths: Vec<String>,
    pub service: String,
}

#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PathMatcher {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub default_service: String,
    #[serde(default)]
    pub path_rules: Vec<PathRule>,
}

#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct HostRule {
    pub hosts: Vec<String>,
    pub path_matcher: String,
}

#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UrlMap {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub self_link: String,
    #[serde(default)]
    pub default_service: String,
    #[serde(default)]
    pub host_rules: Vec<HostRule>,
    #[serde(default)]
    pub path_matchers: Vec<PathMatcher>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
}

impl UrlMap {
    /// Names of all backend services referenced by this url map, its default
    /// service included.
    pub fn backend_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .path_matchers
            .iter()
            .flat_map(|pm| pm.path_rules.iter())
            .map(|rule| rule.service.as_str())
            .chain(std::iter::once(self.default_service.as_str()))
            .map(|link| name_from_link(link).to_string())
            .filter(|name| !name.is_empty())
            .collect();
        names.sort();
        names.dedup();
        names
    }
}

#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TargetHttpProxy {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub self_link: String,
    #[serde(default)]
    pub url_map: String,
}

#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ForwardingRule {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub self_link: String,
    #[serde(default)]
    pub target: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub port_range: String,
    #[serde(rename = "IPProtocol", default, skip_serializing_if = "String::is_empty")]
    pub ip_protocol: String,
    #[serde(rename = "IPAddress", default, skip_serializing_if = "String::is_empty")]
    pub ip_address: String,
}
