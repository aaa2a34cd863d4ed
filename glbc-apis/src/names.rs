//! Deterministic naming of cloud resources.
//!
//! Every resource is named from the logical key that owns it, so a restarted
//! controller finds and reuses the resources it created before instead of
//! duplicating them.

use sha2::{Digest, Sha256};

use crate::NodePort;

pub const DEFAULT_PORT: i64 = 80;
pub const DEFAULT_HEALTH_CHECK_PATH: &'static str = "/";
pub const DEFAULT_PORT_RANGE: &'static str = "80";
pub const DEFAULT_HTTP_HEALTH_CHECK: &'static str = "k8s-default-health-check";

/// A single instance group is created per cluster, tagged with the cluster name.
pub const INSTANCE_GROUP_PREFIX: &'static str = "k8s-ig";

/// A backend is created per node port, tagged with the node port. This allows
/// sharing of backends across load balancers.
pub const BACKEND_PREFIX: &'static str = "k8s-be";

// A single target proxy/url map/forwarding rule is created per load balancer,
// tagged with the namespace/name of the Ingress.
pub const TARGET_PROXY_PREFIX: &'static str = "k8s-tp";
pub const FORWARDING_RULE_PREFIX: &'static str = "k8s-fw";
pub const URL_MAP_PREFIX: &'static str = "k8s-um";

/// The compute API uses the name of a path matcher to match a host rule.
pub const HOST_RULE_PREFIX: &'static str = "host";

/// GCE names are at most 63 characters, the last one is reserved for
/// `ALPHANUMERIC_CHAR` when a name is truncated.
pub const NAME_LEN_LIMIT: usize = 62;
pub const ALPHANUMERIC_CHAR: char = '0';

pub fn be_name(port: NodePort) -> String {
    format!("{}-{}", BACKEND_PREFIX, port)
}

pub fn default_instance_group_name(cluster_name: &str) -> String {
    truncate(&format!("{}-{}", INSTANCE_GROUP_PREFIX, cluster_name))
}

/// Load balancer name for an Ingress key of the form `namespace/name`.
pub fn lb_name(key: &str) -> String {
    key.replace('/', "-")
}

pub fn url_map_name(lb_name: &str) -> String {
    truncate(&format!("{}-{}", URL_MAP_PREFIX, lb_name))
}

pub fn target_proxy_name(lb_name: &str) -> String {
    truncate(&format!("{}-{}", TARGET_PROXY_PREFIX, lb_name))
}

pub fn forwarding_rule_name(lb_name: &str) -> String {
    truncate(&format!("{}-{}", FORWARDING_RULE_PREFIX, lb_name))
}

/// Name of the path matcher for the given host rule. The host rule can be a
/// wildcard, the name used to associate the two cannot.
pub fn path_matcher_name(host: &str) -> String {
    let digest = Sha256::digest(host.as_bytes());
    let hex: String = digest
        .iter()
        .take(16)
        .map(|b| format!("{:02x}", b))
        .collect();
    format!("{}{}", HOST_RULE_PREFIX, hex)
}

/// Truncates the given key to the GCE length limit. GCE requires names to end
/// with an alphanumeric, but allows characters like '-'.
pub fn truncate(key: &str) -> String {
    if key.len() > NAME_LEN_LIMIT {
        let mut truncated: String = key.chars().take(NAME_LEN_LIMIT).collect();
        truncated.push(ALPHANUMERIC_CHAR);
        truncated
    } else {
        key.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_names() {
        assert_eq!("k8s-be-30001", be_name(30001));
        assert_eq!("k8s-ig-prod", default_instance_group_name("prod"));
        assert_eq!("default-foo", lb_name("default/foo"));
        assert_eq!("k8s-um-default-foo", url_map_name("default-foo"));
        assert_eq!("k8s-tp-default-foo", target_proxy_name("default-foo"));
        assert_eq!("k8s-fw-default-foo", forwarding_rule_name("default-foo"));
    }

    #[test]
    fn long_names_are_truncated() {
        let key = format!("ns/{}", "a".repeat(80));
        let name = url_map_name(&lb_name(&key));
        assert_eq!(NAME_LEN_LIMIT + 1, name.len());
        assert!(name.ends_with(ALPHANUMERIC_CHAR));
        assert!(name.starts_with("k8s-um-ns-"));
    }

    #[test]
    fn path_matcher_names_are_stable_and_valid() {
        let a = path_matcher_name("*.example.com");
        assert_eq!(a, path_matcher_name("*.example.com"));
        assert_ne!(a, path_matcher_name("example.com"));
        assert!(a.starts_with(HOST_RULE_PREFIX));
        assert!(a.len() < NAME_LEN_LIMIT);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric()));
    }
}
