use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    sync::Arc,
};

use glbc_apis::{
    BackendService, ForwardingRule, HostRule, PathMatcher, PathRule, TargetHttpProxy, UrlMap,
    compare_links,
    names::{
        DEFAULT_PORT_RANGE, forwarding_rule_name, lb_name, path_matcher_name, target_proxy_name,
        url_map_name,
    },
};
use tokio::sync::Mutex;

use crate::{
    cloud::LoadBalancers,
    errors::{CloudError, ControllerError},
};

/// Host rule matching every host.
pub(crate) const DEFAULT_HOST: &'static str = "*";
/// Path rule matching every path.
pub(crate) const DEFAULT_PATH: &'static str = "/*";

/// Desired routing of one load balancer: host -> path -> backend self link.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub(crate) struct GceUrlMap {
    /// Falls back to the cluster default backend when `None`.
    pub(crate) default_backend: Option<String>,
    pub(crate) hosts: BTreeMap<String, BTreeMap<String, String>>,
}

impl GceUrlMap {
    pub(crate) fn put(&mut self, host: &str, path: &str, backend_link: impl Into<String>) {
        let host = if host.is_empty() { DEFAULT_HOST } else { host };
        let path = if path.is_empty() { DEFAULT_PATH } else { path };
        self.hosts
            .entry(host.to_string())
            .or_default()
            .insert(path.to_string(), backend_link.into());
    }
}

/// A load balancer: forwarding rule -> target http proxy -> url map.
pub(crate) struct L7 {
    name: String,
    cloud: Arc<dyn LoadBalancers>,
    default_backend: BackendService,
    um: Option<UrlMap>,
    tp: Option<TargetHttpProxy>,
    fw: Option<ForwardingRule>,
}

impl fmt::Debug for L7 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("L7")
            .field("name", &self.name)
            .field("url_map", &self.um.as_ref().map(|um| &um.name))
            .field("target_proxy", &self.tp.as_ref().map(|tp| &tp.name))
            .field("forwarding_rule", &self.fw.as_ref().map(|fw| &fw.name))
            .finish()
    }
}

impl L7 {
    fn new(name: String, cloud: Arc<dyn LoadBalancers>, default_backend: BackendService) -> Self {
        Self {
            name,
            cloud,
            default_backend,
            um: None,
            tp: None,
            fw: None,
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    async fn check_url_map(&mut self) -> Result<(), ControllerError> {
        if self.default_backend.self_link.is_empty() {
            return Err(ControllerError::Invalid(
                "cannot create url map without default backend".to_string(),
            ));
        }
        let name = url_map_name(&self.name);
        match self.cloud.get_url_map(&name).await {
            Ok(um) => {
                debug!("url map {} already exists", um.name);
                self.um = Some(um);
            }
            Err(e) if e.is_not_found() => {
                info!(
                    "creating url map {} for backend {}",
                    name, self.default_backend.name
                );
                self.um = Some(self.cloud.create_url_map(&self.default_backend, &name).await?);
            }
            Err(e) => Err(e)?,
        }
        Ok(())
    }

    async fn check_proxy(&mut self) -> Result<(), ControllerError> {
        let Some(um) = &self.um else {
            return Err(ControllerError::Invalid(
                "cannot create proxy without url map".to_string(),
            ));
        };
        let name = target_proxy_name(&self.name);
        let proxy = match self.cloud.get_target_http_proxy(&name).await {
            Ok(mut proxy) => {
                if !compare_links(&proxy.url_map, &um.self_link) {
                    info!(
                        "proxy {} has the wrong url map, setting {} overwriting {}",
                        proxy.name, um.self_link, proxy.url_map
                    );
                    self.cloud.set_url_map_for_target_http_proxy(&proxy, um).await?;
                    proxy.url_map = um.self_link.clone();
                }
                proxy
            }
            Err(e) if e.is_not_found() => {
                info!("creating new http proxy for url map {}", um.name);
                self.cloud.create_target_http_proxy(um, &name).await?
            }
            Err(e) => Err(e)?,
        };
        self.tp = Some(proxy);
        Ok(())
    }

    async fn check_forwarding_rule(&mut self) -> Result<(), ControllerError> {
        let Some(tp) = &self.tp else {
            return Err(ControllerError::Invalid(
                "cannot create forwarding rule without proxy".to_string(),
            ));
        };
        let name = forwarding_rule_name(&self.name);
        let fw = match self.cloud.get_global_forwarding_rule(&name).await {
            Ok(mut fw) => {
                if !compare_links(&fw.target, &tp.self_link) {
                    info!(
                        "forwarding rule {} has the wrong proxy, setting {} overwriting {}",
                        fw.name, tp.self_link, fw.target
                    );
                    self.cloud
                        .set_proxy_for_global_forwarding_rule(&fw, tp)
                        .await?;
                    fw.target = tp.self_link.clone();
                }
                fw
            }
            Err(e) if e.is_not_found() => {
                info!("creating forwarding rule for proxy {}", tp.name);
                self.cloud
                    .create_global_forwarding_rule(tp, &name, DEFAULT_PORT_RANGE)
                    .await?
            }
            Err(e) => Err(e)?,
        };
        self.fw = Some(fw);
        Ok(())
    }

    /// Creates missing resources and repairs broken links, url map first.
    async fn edge_hop(&mut self) -> Result<(), ControllerError> {
        self.check_url_map().await?;
        self.check_proxy().await?;
        self.check_forwarding_rule().await?;
        Ok(())
    }

    /// External IP of the forwarding rule.
    pub(crate) fn ip(&self) -> Option<&str> {
        self.fw
            .as_ref()
            .map(|fw| fw.ip_address.as_str())
            .filter(|ip| !ip.is_empty())
    }

    pub(crate) fn url_map(&self) -> Option<&UrlMap> {
        self.um.as_ref()
    }

    pub(crate) fn target_proxy(&self) -> Option<&TargetHttpProxy> {
        self.tp.as_ref()
    }

    pub(crate) fn forwarding_rule(&self) -> Option<&ForwardingRule> {
        self.fw.as_ref()
    }

    /// Names of the backends referenced by the path rules of the url map.
    pub(crate) fn backend_names(&self) -> Vec<String> {
        self.um
            .as_ref()
            .map(|um| um.backend_names())
            .unwrap_or_default()
    }

    /// Replaces the routing of the url map with `gce_url_map`. Hosts missing
    /// from `gce_url_map` lose their host rule and path matcher.
    pub(crate) async fn update_url_map(
        &mut self,
        gce_url_map: &GceUrlMap,
    ) -> Result<(), ControllerError> {
        let Some(mut um) = self.um.clone() else {
            return Err(ControllerError::Invalid(format!(
                "cannot add urls to {} without a url map",
                self.name
            )));
        };
        info!("updating url map of {}", self.name);
        let default_service = gce_url_map
            .default_backend
            .clone()
            .unwrap_or_else(|| self.default_backend.self_link.clone());
        um.default_service = default_service.clone();
        um.host_rules = Vec::with_capacity(gce_url_map.hosts.len());
        um.path_matchers = Vec::with_capacity(gce_url_map.hosts.len());
        for (host, paths) in &gce_url_map.hosts {
            let pm_name = path_matcher_name(host);
            um.host_rules.push(HostRule {
                hosts: vec![host.clone()],
                path_matcher: pm_name.clone(),
            });
            um.path_matchers.push(PathMatcher {
                name: pm_name,
                default_service: default_service.clone(),
                path_rules: paths
                    .iter()
                    .map(|(path, link)| PathRule {
                        paths: vec![path.clone()],
                        service: link.clone(),
                    })
                    .collect(),
            });
        }
        debug!("updating url map {:?}", um);
        self.um = Some(self.cloud.update_url_map(&um).await?);
        Ok(())
    }

    /// Deletes forwarding rule, target proxy and url map, in that order.
    pub(crate) async fn cleanup(&mut self) -> Result<(), CloudError> {
        if let Some(fw) = &self.fw {
            info!("deleting global forwarding rule {}", fw.name);
            tolerate_not_found(self.cloud.delete_global_forwarding_rule(&fw.name).await)?;
            self.fw = None;
        }
        if let Some(tp) = &self.tp {
            info!("deleting target proxy {}", tp.name);
            tolerate_not_found(self.cloud.delete_target_http_proxy(&tp.name).await)?;
            self.tp = None;
        }
        if let Some(um) = &self.um {
            info!("deleting url map {}", um.name);
            tolerate_not_found(self.cloud.delete_url_map(&um.name).await)?;
            self.um = None;
        }
        Ok(())
    }
}

fn tolerate_not_found(result: Result<(), CloudError>) -> Result<(), CloudError> {
    match result {
        Err(e) if e.is_not_found() => {
            debug!("already deleted: {}", e);
            Ok(())
        }
        result => result,
    }
}

/// Owns one L7 per Ingress, keyed by load balancer name.
pub(crate) struct LoadBalancerPool {
    cloud: Arc<dyn LoadBalancers>,
    default_backend: BackendService,
    pool: Mutex<BTreeMap<String, Arc<Mutex<L7>>>>,
}

impl LoadBalancerPool {
    pub(crate) fn new(cloud: Arc<dyn LoadBalancers>, default_backend: BackendService) -> Self {
        Self {
            cloud,
            default_backend,
            pool: Default::default(),
        }
    }

    /// The L7 of the Ingress key.
    pub(crate) async fn get(&self, key: &str) -> Result<Arc<Mutex<L7>>, ControllerError> {
        let name = lb_name(key);
        self.pool
            .lock()
            .await
            .get(&name)
            .cloned()
            .ok_or_else(|| ControllerError::LoadBalancerNotFound(name))
    }

    /// Makes sure the L7 of the Ingress key exists and is wired up. A partially
    /// created L7 stays in the pool so that GC can clean it up.
    pub(crate) async fn ensure(&self, key: &str) -> Result<Arc<Mutex<L7>>, ControllerError> {
        let name = lb_name(key);
        let lb = {
            let mut pool = self.pool.lock().await;
            pool.entry(name.clone())
                .or_insert_with(|| {
                    info!("creating l7 {}", name);
                    Arc::new(Mutex::new(L7::new(
                        name.clone(),
                        self.cloud.clone(),
                        self.default_backend.clone(),
                    )))
                })
                .clone()
        };
        lb.lock().await.edge_hop().await?;
        Ok(lb)
    }

    /// Ensures an L7 for every key. Never deletes.
    pub(crate) async fn sync(&self, keys: &BTreeSet<String>) -> Result<(), ControllerError> {
        debug!("syncing load balancers {:?}", keys);
        let mut results = Vec::with_capacity(keys.len());
        for key in keys {
            results.push(self.ensure(key).await.map(|_| ()));
        }
        ControllerError::combine(results)
    }

    /// Tears down the L7 of the key and drops it from the pool.
    pub(crate) async fn delete(&self, key: &str) -> Result<(), ControllerError> {
        let lb = self.get(key).await?;
        let mut lb = lb.lock().await;
        info!("deleting load balancer {}", lb.name());
        lb.cleanup().await?;
        self.pool.lock().await.remove(lb.name());
        Ok(())
    }

    /// Deletes every L7 whose key is not in `keys`. A failed teardown does not
    /// stop the others.
    pub(crate) async fn gc(&self, keys: &BTreeSet<String>) -> Result<(), ControllerError> {
        let known: BTreeSet<String> = keys.iter().map(|k| lb_name(k)).collect();
        let managed: Vec<String> = self.pool.lock().await.keys().cloned().collect();
        let mut results = Vec::new();
        for name in managed {
            if known.contains(&name) {
                continue;
            }
            info!("garbage collecting load balancer {}", name);
            results.push(self.delete(&name).await);
        }
        ControllerError::combine(results)
    }

    pub(crate) async fn shutdown(&self) -> Result<(), ControllerError> {
        self.gc(&BTreeSet::new()).await?;
        info!("load balancer pool shutdown");
        Ok(())
    }

    /// Names of the managed load balancers.
    pub(crate) async fn names(&self) -> Vec<String> {
        self.pool.lock().await.keys().cloned().collect()
    }
}
