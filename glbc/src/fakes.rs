//! In-memory implementations of the cloud capability traits.
//!
//! Used by the unit tests and by the dry-run mode of the controller. Every
//! resource gets its name as self link, every forwarding rule a fresh
//! `0.0.0.N` address.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
};

use async_trait::async_trait;
use glbc_apis::{
    BackendService, BackendServiceGroupHealth, ForwardingRule, HealthStatus,
    HttpHealthCheck, InstanceGroup, InstanceWithNamedPorts, NamedPort, NodePort,
    TargetHttpProxy, UrlMap, names::be_name,
};

use crate::{
    cloud::{
        BackendServices, CloudClients, CloudResult, ForwardingRules, HttpHealthChecks, InstanceGroups,
        TargetHttpProxies, UrlMaps,
    },
    errors::CloudError,
};

/// A recorded call against a fake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Call {
    Get(String),
    Create(String),
    Update(String),
    Delete(String),
    ListInstances(String),
    AddInstances(Vec<String>),
    RemoveInstances(Vec<String>),
    AddNamedPort(NodePort),
    SetTarget(String),
    SetUrlMap(String),
}

#[derive(Default)]
struct CallLog(Mutex<Vec<Call>>);

#[cfg_attr(not(test), allow(dead_code))]
impl CallLog {
    fn record(&self, call: Call) {
        if let Ok(mut calls) = self.0.lock() {
            calls.push(call);
        }
    }

    fn snapshot(&self) -> Vec<Call> {
        self.0.lock().map(|c| c.clone()).unwrap_or_default()
    }

    fn clear(&self) {
        if let Ok(mut calls) = self.0.lock() {
            calls.clear();
        }
    }
}

fn lock_poisoned() -> CloudError {
    CloudError::Any(anyhow::anyhow!("fake cloud state lock poisoned"))
}

/// Fails with the status GCE returns for resources still referenced elsewhere.
fn check_not_in_use(fail_deletes: &Mutex<BTreeSet<String>>, name: &str) -> CloudResult<()> {
    if fail_deletes.lock().map_err(|_| lock_poisoned())?.contains(name) {
        return Err(CloudError::Api {
            code: 400,
            message: format!("resource {} is in use", name),
        });
    }
    Ok(())
}

#[derive(Default)]
pub(crate) struct FakeBackendServices {
    backends: Mutex<BTreeMap<String, BackendService>>,
    health_state: Mutex<Option<String>>,
    fail_creates: AtomicBool,
    /// Backends whose deletion fails as if still in use.
    fail_deletes: Mutex<BTreeSet<String>>,
    calls: CallLog,
}

#[cfg(test)]
impl FakeBackendServices {
    pub(crate) fn calls(&self) -> Vec<Call> {
        self.calls.snapshot()
    }

    pub(crate) fn clear_calls(&self) {
        self.calls.clear()
    }

    /// Names of all existing backend services.
    pub(crate) fn names(&self) -> Vec<String> {
        self.backends
            .lock()
            .map(|b| b.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub(crate) fn backend(&self, name: &str) -> Option<BackendService> {
        self.backends
            .lock()
            .ok()
            .and_then(|b| b.get(name).cloned())
    }

    /// Replaces the stored backend as if modified out-of-band.
    pub(crate) fn put(&self, be: BackendService) {
        if let Ok(mut backends) = self.backends.lock() {
            backends.insert(be.name.clone(), be);
        }
    }

    pub(crate) fn set_health_state(&self, state: Option<&str>) {
        if let Ok(mut s) = self.health_state.lock() {
            *s = state.map(|s| s.to_string());
        }
    }

    pub(crate) fn fail_creates(&self, fail: bool) {
        self.fail_creates.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn fail_delete(&self, name: &str) {
        if let Ok(mut names) = self.fail_deletes.lock() {
            names.insert(name.to_string());
        }
    }

    pub(crate) fn clear_delete_failures(&self) {
        if let Ok(mut names) = self.fail_deletes.lock() {
            names.clear();
        }
    }
}

#[async_trait]
impl BackendServices for FakeBackendServices {
    async fn get_backend_service(&self, name: &str) -> CloudResult<BackendService> {
        self.calls.record(Call::Get(name.to_string()));
        let backends = self.backends.lock().map_err(|_| lock_poisoned())?;
        backends
            .get(name)
            .cloned()
            .ok_or_else(|| CloudError::not_found("BackendService", name))
    }

    async fn create_backend_service(&self, be: &BackendService) -> CloudResult<()> {
        self.calls.record(Call::Create(be.name.clone()));
        if self.fail_creates.load(Ordering::SeqCst) {
            return Err(CloudError::Api {
                code: 503,
                message: format!("backend service {} not created", be.name),
            });
        }
        let mut backends = self.backends.lock().map_err(|_| lock_poisoned())?;
        let mut be = be.clone();
        be.self_link = be.name.clone();
        backends.insert(be.name.clone(), be);
        Ok(())
    }

    async fn update_backend_service(&self, be: &BackendService) -> CloudResult<()> {
        self.calls.record(Call::Update(be.name.clone()));
        let mut backends = self.backends.lock().map_err(|_| lock_poisoned())?;
        match backends.get_mut(&be.name) {
            Some(existing) => {
                *existing = be.clone();
                Ok(())
            }
            None => Err(CloudError::not_found("BackendService", &be.name)),
        }
    }

    async fn delete_backend_service(&self, name: &str) -> CloudResult<()> {
        self.calls.record(Call::Delete(name.to_string()));
        check_not_in_use(&self.fail_deletes, name)?;
        let mut backends = self.backends.lock().map_err(|_| lock_poisoned())?;
        backends
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| CloudError::not_found("BackendService", name))
    }

    async fn get_health(
        &self,
        name: &str,
        instance_group_link: &str,
    ) -> CloudResult<BackendServiceGroupHealth> {
        let backends = self.backends.lock().map_err(|_| lock_poisoned())?;
        let be = backends
            .get(name)
            .ok_or_else(|| CloudError::not_found("BackendService", name))?;
        if !be.links_to(instance_group_link) {
            return Err(CloudError::not_found("InstanceGroup", instance_group_link));
        }
        let state = self.health_state.lock().map_err(|_| lock_poisoned())?;
        Ok(BackendServiceGroupHealth {
            health_status: state
                .iter()
                .map(|s| HealthStatus {
                    health_state: s.clone(),
                    port: be.port,
                    ..Default::default()
                })
                .collect(),
        })
    }
}

#[derive(Default)]
struct FakeGroup {
    ig: InstanceGroup,
    instances: BTreeSet<String>,
    generation: usize,
}

impl FakeGroup {
    fn bump_fingerprint(&mut self) {
        self.generation += 1;
        self.ig.fingerprint = Some(format!("fp-{}", self.generation));
    }
}

#[derive(Default)]
pub(crate) struct FakeInstanceGroups {
    groups: Mutex<BTreeMap<String, FakeGroup>>,
    calls: CallLog,
}

#[cfg(test)]
impl FakeInstanceGroups {
    pub(crate) fn calls(&self) -> Vec<Call> {
        self.calls.snapshot()
    }

    pub(crate) fn clear_calls(&self) {
        self.calls.clear()
    }

    /// Members of the named group, `None` if the group does not exist.
    pub(crate) fn instances(&self, name: &str) -> Option<BTreeSet<String>> {
        self.groups
            .lock()
            .ok()
            .and_then(|g| g.get(name).map(|g| g.instances.clone()))
    }

    pub(crate) fn group(&self, name: &str) -> Option<InstanceGroup> {
        self.groups
            .lock()
            .ok()
            .and_then(|g| g.get(name).map(|g| g.ig.clone()))
    }

    /// Changes the fingerprint as if the group was modified out-of-band.
    pub(crate) fn touch(&self, name: &str) {
        if let Ok(mut groups) = self.groups.lock() {
            if let Some(group) = groups.get_mut(name) {
                group.bump_fingerprint();
            }
        }
    }

    /// Drops the group as if deleted out-of-band.
    pub(crate) fn remove(&self, name: &str) {
        if let Ok(mut groups) = self.groups.lock() {
            groups.remove(name);
        }
    }
}

#[async_trait]
impl InstanceGroups for FakeInstanceGroups {
    async fn get_instance_group(&self, name: &str, _zone: &str) -> CloudResult<InstanceGroup> {
        self.calls.record(Call::Get(name.to_string()));
        let groups = self.groups.lock().map_err(|_| lock_poisoned())?;
        groups
            .get(name)
            .map(|g| g.ig.clone())
            .ok_or_else(|| CloudError::not_found("InstanceGroup", name))
    }

    async fn create_instance_group(&self, name: &str, zone: &str) -> CloudResult<InstanceGroup> {
        self.calls.record(Call::Create(name.to_string()));
        let mut groups = self.groups.lock().map_err(|_| lock_poisoned())?;
        let ig = InstanceGroup {
            name: name.to_string(),
            self_link: name.to_string(),
            zone: zone.to_string(),
            fingerprint: Some("fp-0".to_string()),
            ..Default::default()
        };
        groups.insert(
            name.to_string(),
            FakeGroup {
                ig: ig.clone(),
                ..Default::default()
            },
        );
        Ok(ig)
    }

    async fn delete_instance_group(&self, name: &str, _zone: &str) -> CloudResult<()> {
        self.calls.record(Call::Delete(name.to_string()));
        let mut groups = self.groups.lock().map_err(|_| lock_poisoned())?;
        groups
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| CloudError::not_found("InstanceGroup", name))
    }

    async fn list_instances_in_instance_group(
        &self,
        name: &str,
        zone: &str,
        _state: &str,
    ) -> CloudResult<Vec<InstanceWithNamedPorts>> {
        self.calls.record(Call::ListInstances(name.to_string()));
        let groups = self.groups.lock().map_err(|_| lock_poisoned())?;
        let group = groups
            .get(name)
            .ok_or_else(|| CloudError::not_found("InstanceGroup", name))?;
        Ok(group
            .instances
            .iter()
            .map(|i| InstanceWithNamedPorts {
                instance: format!(
                    "https://www.googleapis.com/compute/v1/projects/project/zones/{}/instances/{}",
                    zone, i
                ),
                status: "RUNNING".to_string(),
            })
            .collect())
    }

    async fn add_instances_to_instance_group(
        &self,
        name: &str,
        _zone: &str,
        instance_names: &[String],
    ) -> CloudResult<()> {
        self.calls.record(Call::AddInstances(instance_names.to_vec()));
        let mut groups = self.groups.lock().map_err(|_| lock_poisoned())?;
        let group = groups
            .get_mut(name)
            .ok_or_else(|| CloudError::not_found("InstanceGroup", name))?;
        group.instances.extend(instance_names.iter().cloned());
        Ok(())
    }

    async fn remove_instances_from_instance_group(
        &self,
        name: &str,
        _zone: &str,
        instance_names: &[String],
    ) -> CloudResult<()> {
        self.calls
            .record(Call::RemoveInstances(instance_names.to_vec()));
        let mut groups = self.groups.lock().map_err(|_| lock_poisoned())?;
        let group = groups
            .get_mut(name)
            .ok_or_else(|| CloudError::not_found("InstanceGroup", name))?;
        for i in instance_names {
            group.instances.remove(i);
        }
        Ok(())
    }

    async fn add_port_to_instance_group(
        &self,
        ig: &InstanceGroup,
        port: NodePort,
    ) -> CloudResult<NamedPort> {
        self.calls.record(Call::AddNamedPort(port));
        let mut groups = self.groups.lock().map_err(|_| lock_poisoned())?;
        let group = groups
            .get_mut(&ig.name)
            .ok_or_else(|| CloudError::not_found("InstanceGroup", &ig.name))?;
        if ig.fingerprint != group.ig.fingerprint {
            return Err(CloudError::Api {
                code: 412,
                message: format!(
                    "stale fingerprint {:?} for instance group {}",
                    ig.fingerprint, ig.name
                ),
            });
        }
        let named_port = NamedPort {
            name: be_name(port),
            port,
        };
        if group.ig.named_port(port).is_none() {
            group.ig.named_ports.push(named_port.clone());
            group.bump_fingerprint();
        }
        Ok(named_port)
    }
}

#[derive(Default)]
pub(crate) struct FakeLoadBalancers {
    forwarding_rules: Mutex<BTreeMap<String, ForwardingRule>>,
    proxies: Mutex<BTreeMap<String, TargetHttpProxy>>,
    url_maps: Mutex<BTreeMap<String, UrlMap>>,
    next_ip: AtomicUsize,
    /// Resources whose deletion fails as if still in use.
    fail_deletes: Mutex<BTreeSet<String>>,
    calls: CallLog,
}

#[cfg(test)]
impl FakeLoadBalancers {
    pub(crate) fn calls(&self) -> Vec<Call> {
        self.calls.snapshot()
    }

    pub(crate) fn clear_calls(&self) {
        self.calls.clear()
    }

    pub(crate) fn forwarding_rule(&self, name: &str) -> Option<ForwardingRule> {
        self.forwarding_rules
            .lock()
            .ok()
            .and_then(|f| f.get(name).cloned())
    }

    pub(crate) fn proxy(&self, name: &str) -> Option<TargetHttpProxy> {
        self.proxies.lock().ok().and_then(|p| p.get(name).cloned())
    }

    pub(crate) fn url_map(&self, name: &str) -> Option<UrlMap> {
        self.url_maps.lock().ok().and_then(|u| u.get(name).cloned())
    }

    /// Number of forwarding rules, target proxies and url maps.
    pub(crate) fn fail_delete(&self, name: &str) {
        if let Ok(mut names) = self.fail_deletes.lock() {
            names.insert(name.to_string());
        }
    }

    pub(crate) fn clear_delete_failures(&self) {
        if let Ok(mut names) = self.fail_deletes.lock() {
            names.clear();
        }
    }

    pub(crate) fn counts(&self) -> (usize, usize, usize) {
        (
            self.forwarding_rules.lock().map(|f| f.len()).unwrap_or_default(),
            self.proxies.lock().map(|p| p.len()).unwrap_or_default(),
            self.url_maps.lock().map(|u| u.len()).unwrap_or_default(),
        )
    }

    /// Points the forwarding rule at another target as if modified out-of-band.
    pub(crate) fn set_target(&self, name: &str, target: &str) {
        if let Ok(mut rules) = self.forwarding_rules.lock() {
            if let Some(fw) = rules.get_mut(name) {
                fw.target = target.to_string();
            }
        }
    }

    /// Points the proxy at another url map as if modified out-of-band.
    pub(crate) fn set_url_map(&self, name: &str, url_map: &str) {
        if let Ok(mut proxies) = self.proxies.lock() {
            if let Some(tp) = proxies.get_mut(name) {
                tp.url_map = url_map.to_string();
            }
        }
    }
}

#[async_trait]
impl ForwardingRules for FakeLoadBalancers {
    async fn get_global_forwarding_rule(&self, name: &str) -> CloudResult<ForwardingRule> {
        self.calls.record(Call::Get(name.to_string()));
        let rules = self.forwarding_rules.lock().map_err(|_| lock_poisoned())?;
        rules
            .get(name)
            .cloned()
            .ok_or_else(|| CloudError::not_found("ForwardingRule", name))
    }

    async fn create_global_forwarding_rule(
        &self,
        proxy: &TargetHttpProxy,
        name: &str,
        port_range: &str,
    ) -> CloudResult<ForwardingRule> {
        self.calls.record(Call::Create(name.to_string()));
        let ip = self.next_ip.fetch_add(1, Ordering::SeqCst) + 1;
        let rule = ForwardingRule {
            name: name.to_string(),
            self_link: name.to_string(),
            target: proxy.self_link.clone(),
            port_range: port_range.to_string(),
            ip_protocol: "TCP".to_string(),
            ip_address: format!("0.0.0.{}", ip),
        };
        let mut rules = self.forwarding_rules.lock().map_err(|_| lock_poisoned())?;
        rules.insert(name.to_string(), rule.clone());
        Ok(rule)
    }

    async fn delete_global_forwarding_rule(&self, name: &str) -> CloudResult<()> {
        self.calls.record(Call::Delete(name.to_string()));
        let mut rules = self.forwarding_rules.lock().map_err(|_| lock_poisoned())?;
        rules
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| CloudError::not_found("ForwardingRule", name))
    }

    async fn set_proxy_for_global_forwarding_rule(
        &self,
        fw: &ForwardingRule,
        proxy: &TargetHttpProxy,
    ) -> CloudResult<()> {
        self.calls.record(Call::SetTarget(fw.name.clone()));
        let mut rules = self.forwarding_rules.lock().map_err(|_| lock_poisoned())?;
        let rule = rules
            .get_mut(&fw.name)
            .ok_or_else(|| CloudError::not_found("ForwardingRule", &fw.name))?;
        rule.target = proxy.self_link.clone();
        Ok(())
    }
}

#[async_trait]
impl TargetHttpProxies for FakeLoadBalancers {
    async fn get_target_http_proxy(&self, name: &str) -> CloudResult<TargetHttpProxy> {
        self.calls.record(Call::Get(name.to_string()));
        let proxies = self.proxies.lock().map_err(|_| lock_poisoned())?;
        proxies
            .get(name)
            .cloned()
            .ok_or_else(|| CloudError::not_found("TargetHttpProxy", name))
    }

    async fn create_target_http_proxy(
        &self,
        url_map: &UrlMap,
        name: &str,
    ) -> CloudResult<TargetHttpProxy> {
        self.calls.record(Call::Create(name.to_string()));
        let proxy = TargetHttpProxy {
            name: name.to_string(),
            self_link: name.to_string(),
            url_map: url_map.self_link.clone(),
        };
        let mut proxies = self.proxies.lock().map_err(|_| lock_poisoned())?;
        proxies.insert(name.to_string(), proxy.clone());
        Ok(proxy)
    }

    async fn delete_target_http_proxy(&self, name: &str) -> CloudResult<()> {
        self.calls.record(Call::Delete(name.to_string()));
        let mut proxies = self.proxies.lock().map_err(|_| lock_poisoned())?;
        proxies
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| CloudError::not_found("TargetHttpProxy", name))
    }

    async fn set_url_map_for_target_http_proxy(
        &self,
        proxy: &TargetHttpProxy,
        url_map: &UrlMap,
    ) -> CloudResult<()> {
        self.calls.record(Call::SetUrlMap(proxy.name.clone()));
        let mut proxies = self.proxies.lock().map_err(|_| lock_poisoned())?;
        let tp = proxies
            .get_mut(&proxy.name)
            .ok_or_else(|| CloudError::not_found("TargetHttpProxy", &proxy.name))?;
        tp.url_map = url_map.self_link.clone();
        Ok(())
    }
}

#[async_trait]
impl UrlMaps for FakeLoadBalancers {
    async fn get_url_map(&self, name: &str) -> CloudResult<UrlMap> {
        self.calls.record(Call::Get(name.to_string()));
        let url_maps = self.url_maps.lock().map_err(|_| lock_poisoned())?;
        url_maps
            .get(name)
            .cloned()
            .ok_or_else(|| CloudError::not_found("UrlMap", name))
    }

    async fn create_url_map(&self, backend: &BackendService, name: &str) -> CloudResult<UrlMap> {
        self.calls.record(Call::Create(name.to_string()));
        let url_map = UrlMap {
            name: name.to_string(),
            self_link: name.to_string(),
            default_service: backend.self_link.clone(),
            ..Default::default()
        };
        let mut url_maps = self.url_maps.lock().map_err(|_| lock_poisoned())?;
        url_maps.insert(name.to_string(), url_map.clone());
        Ok(url_map)
    }

    async fn update_url_map(&self, url_map: &UrlMap) -> CloudResult<UrlMap> {
        self.calls.record(Call::Update(url_map.name.clone()));
        let mut url_maps = self.url_maps.lock().map_err(|_| lock_poisoned())?;
        let existing = url_maps
            .get_mut(&url_map.name)
            .ok_or_else(|| CloudError::not_found("UrlMap", &url_map.name))?;
        *existing = url_map.clone();
        Ok(url_map.clone())
    }

    async fn delete_url_map(&self, name: &str) -> CloudResult<()> {
        self.calls.record(Call::Delete(name.to_string()));
        check_not_in_use(&self.fail_deletes, name)?;
        let mut url_maps = self.url_maps.lock().map_err(|_| lock_poisoned())?;
        url_maps
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| CloudError::not_found("UrlMap", name))
    }
}

#[derive(Default)]
pub(crate) struct FakeHealthChecks {
    health_checks: Mutex<BTreeMap<String, HttpHealthCheck>>,
    calls: CallLog,
}

#[cfg(test)]
impl FakeHealthChecks {
    pub(crate) fn calls(&self) -> Vec<Call> {
        self.calls.snapshot()
    }

    pub(crate) fn health_check(&self, name: &str) -> Option<HttpHealthCheck> {
        self.health_checks
            .lock()
            .ok()
            .and_then(|h| h.get(name).cloned())
    }
}

#[async_trait]
impl HttpHealthChecks for FakeHealthChecks {
    async fn get_http_health_check(&self, name: &str) -> CloudResult<HttpHealthCheck> {
        self.calls.record(Call::Get(name.to_string()));
        let health_checks = self.health_checks.lock().map_err(|_| lock_poisoned())?;
        health_checks
            .get(name)
            .cloned()
            .ok_or_else(|| CloudError::not_found("HttpHealthCheck", name))
    }

    async fn create_http_health_check(&self, hc: &HttpHealthCheck) -> CloudResult<()> {
        self.calls.record(Call::Create(hc.name.clone()));
        let mut hc = hc.clone();
        hc.self_link = hc.name.clone();
        let mut health_checks = self.health_checks.lock().map_err(|_| lock_poisoned())?;
        health_checks.insert(hc.name.clone(), hc);
        Ok(())
    }

    async fn delete_http_health_check(&self, name: &str) -> CloudResult<()> {
        self.calls.record(Call::Delete(name.to_string()));
        let mut health_checks = self.health_checks.lock().map_err(|_| lock_poisoned())?;
        health_checks
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| CloudError::not_found("HttpHealthCheck", name))
    }
}

/// In-memory cloud with one fake per capability, used by tests and dry runs.
#[derive(Default, Clone)]
pub(crate) struct FakeCloud {
    pub(crate) backend_services: Arc<FakeBackendServices>,
    pub(crate) instance_groups: Arc<FakeInstanceGroups>,
    pub(crate) load_balancers: Arc<FakeLoadBalancers>,
    pub(crate) health_checks: Arc<FakeHealthChecks>,
}

impl FakeCloud {
    pub(crate) fn clients(&self) -> CloudClients {
        CloudClients {
            backend_services: self.backend_services.clone(),
            instance_groups: self.instance_groups.clone(),
            load_balancers: self.load_balancers.clone(),
            health_checks: self.health_checks.clone(),
        }
    }
}

/// Backend service pointing at `group`, for tests.
#[cfg(test)]
pub(crate) fn backend_in_group(port: NodePort, group: &str) -> BackendService {
    BackendService {
        name: be_name(port),
        self_link: be_name(port),
        backends: vec![glbc_apis::Backend {
            group: group.to_string(),
        }],
        port,
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fake_backends_report_not_found() {
        let fake = FakeBackendServices::default();
        let err = fake.get_backend_service("k8s-be-80").await.unwrap_err();
        assert!(err.is_not_found());
        fake.create_backend_service(&BackendService {
            name: "k8s-be-80".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();
        assert_eq!("k8s-be-80", fake.get_backend_service("k8s-be-80").await.unwrap().self_link);
        fake.delete_backend_service("k8s-be-80").await.unwrap();
        assert!(fake.delete_backend_service("k8s-be-80").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn fake_forwarding_rules_get_distinct_ips() {
        let fake = FakeLoadBalancers::default();
        let tp = TargetHttpProxy {
            name: "tp".to_string(),
            self_link: "tp".to_string(),
            url_map: "um".to_string(),
        };
        let a = fake.create_global_forwarding_rule(&tp, "fw-a", "80").await.unwrap();
        let b = fake.create_global_forwarding_rule(&tp, "fw-b", "80").await.unwrap();
        assert_eq!("0.0.0.1", a.ip_address);
        assert_eq!("0.0.0.2", b.ip_address);
        assert_eq!((2, 0, 0), fake.counts());
    }
}
