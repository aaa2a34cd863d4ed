use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

use glbc_apis::{
    Backend, BackendService, InstanceGroup, NamedPort, NodePort,
    names::{DEFAULT_HTTP_HEALTH_CHECK, be_name},
};
use tokio::sync::Mutex;

use crate::{
    cloud::BackendServices,
    errors::{CloudError, ControllerError},
    healthchecks::HealthChecker,
    instances::NodePool,
};

/// Health state reported when the backend or its health is unavailable.
pub(crate) const UNKNOWN_HEALTH: &'static str = "Unknown";

/// Owns one backend service per service node port, all pointing at the default
/// instance group and the shared health check.
pub(crate) struct BackendPool {
    cloud: Arc<dyn BackendServices>,
    node_pool: Arc<NodePool>,
    health_checker: Arc<HealthChecker>,
    default_port: NodePort,
    /// Backends managed by this pool, including ones whose creation failed.
    pool: Mutex<BTreeMap<NodePort, BackendService>>,
}

impl BackendPool {
    /// Creates the pool together with the backend of the default port.
    pub(crate) async fn new(
        cloud: Arc<dyn BackendServices>,
        node_pool: Arc<NodePool>,
        health_checker: Arc<HealthChecker>,
        default_port: NodePort,
    ) -> Result<Self, CloudError> {
        let pool = Self {
            cloud,
            node_pool,
            health_checker,
            default_port,
            pool: Default::default(),
        };
        pool.add(default_port).await?;
        Ok(pool)
    }

    pub(crate) fn default_port(&self) -> NodePort {
        self.default_port
    }

    /// The backend of the default port.
    pub(crate) async fn default_backend(&self) -> Result<BackendService, CloudError> {
        self.get(self.default_port).await
    }

    pub(crate) async fn get(&self, port: NodePort) -> Result<BackendService, CloudError> {
        let be = self.cloud.get_backend_service(&be_name(port)).await?;
        self.pool.lock().await.insert(port, be.clone());
        Ok(be)
    }

    async fn create(
        &self,
        ig: &InstanceGroup,
        named_port: &NamedPort,
        name: &str,
    ) -> Result<BackendService, CloudError> {
        let hc = self.health_checker.get(DEFAULT_HTTP_HEALTH_CHECK).await?;
        info!(
            "creating backend {} for instance group {} named port {}",
            name, ig.name, named_port.name
        );
        self.cloud
            .create_backend_service(&BackendService {
                name: name.to_string(),
                protocol: "HTTP".to_string(),
                backends: vec![Backend {
                    group: ig.self_link.clone(),
                }],
                health_checks: vec![hc.self_link],
                port: named_port.port,
                port_name: named_port.name.clone(),
                ..Default::default()
            })
            .await?;
        self.cloud.get_backend_service(name).await
    }

    /// Points the backend at the instance group if the link is broken.
    async fn edge_hop(
        &self,
        mut be: BackendService,
        ig: &InstanceGroup,
    ) -> Result<BackendService, CloudError> {
        if be.links_to(&ig.self_link) {
            return Ok(be);
        }
        info!(
            "backend {} has a broken edge, adding link to {}",
            be.name, ig.name
        );
        be.backends = vec![Backend {
            group: ig.self_link.clone(),
        }];
        self.cloud.update_backend_service(&be).await?;
        Ok(be)
    }

    async fn ensure(&self, port: NodePort) -> Result<BackendService, CloudError> {
        let name = be_name(port);
        let (ig, named_port) = self.node_pool.add_named_port(port).await?;
        let be = match self.cloud.get_backend_service(&name).await {
            Ok(be) => be,
            Err(e) if e.is_not_found() => self.create(&ig, &named_port, &name).await?,
            Err(e) => Err(e)?,
        };
        self.edge_hop(be, &ig).await
    }

    /// Makes sure a backend for the port exists and points at the default
    /// instance group. The port is managed by the pool even if this fails.
    pub(crate) async fn add(&self, port: NodePort) -> Result<(), CloudError> {
        let result = self.ensure(port).await;
        let be = match &result {
            Ok(be) => be.clone(),
            Err(_) => BackendService {
                name: be_name(port),
                port,
                ..Default::default()
            },
        };
        self.pool.lock().await.insert(port, be);
        result.map(|_| ())
    }

    /// Deletes the backend of the port, a missing backend is not an error.
    pub(crate) async fn delete(&self, port: NodePort) -> Result<(), CloudError> {
        let name = be_name(port);
        info!("deleting backend {}", name);
        match self.cloud.delete_backend_service(&name).await {
            Ok(()) => (),
            Err(e) if e.is_not_found() => {
                debug!("backend {} does not exist: {}", name, e);
            }
            Err(e) => Err(e)?,
        }
        self.pool.lock().await.remove(&port);
        Ok(())
    }

    /// Adds a backend for every port plus the default port. Never deletes.
    pub(crate) async fn sync(&self, ports: &BTreeSet<NodePort>) -> Result<(), ControllerError> {
        debug!("syncing backends {:?}", ports);
        let mut ports = ports.clone();
        ports.insert(self.default_port);
        let mut results = Vec::with_capacity(ports.len());
        for port in ports {
            results.push(self.add(port).await.map_err(ControllerError::from));
        }
        ControllerError::combine(results)
    }

    /// Deletes every managed backend whose port is not in `ports`, except the
    /// default backend. A failed delete does not stop the others.
    pub(crate) async fn gc(&self, ports: &BTreeSet<NodePort>) -> Result<(), ControllerError> {
        let managed: Vec<NodePort> = self.pool.lock().await.keys().cloned().collect();
        let mut results = Vec::new();
        for port in managed {
            if ports.contains(&port) || port == self.default_port {
                continue;
            }
            info!("garbage collecting backend for port {}", port);
            results.push(self.delete(port).await.map_err(ControllerError::from));
        }
        ControllerError::combine(results)
    }

    /// Deletes every backend, the default backend last.
    pub(crate) async fn shutdown(&self) -> Result<(), ControllerError> {
        self.gc(&BTreeSet::new()).await?;
        if self.pool.lock().await.contains_key(&self.default_port) {
            self.delete(self.default_port).await?;
        }
        info!("backend pool shutdown");
        Ok(())
    }

    /// Health state of the first instance behind the named backend.
    pub(crate) async fn status(&self, name: &str) -> String {
        let be = match self.cloud.get_backend_service(name).await {
            Ok(be) => be,
            Err(e) => {
                debug!("no health for backend {}: {}", name, e);
                return UNKNOWN_HEALTH.to_string();
            }
        };
        let Some(group) = be.backends.first() else {
            return UNKNOWN_HEALTH.to_string();
        };
        match self.cloud.get_health(name, &group.group).await {
            Ok(health) => health
                .health_status
                .into_iter()
                .next()
                .map(|hs| hs.health_state)
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| UNKNOWN_HEALTH.to_string()),
            Err(e) => {
                debug!("no health for backend {}: {}", name, e);
                UNKNOWN_HEALTH.to_string()
            }
        }
    }

    /// Self links of the managed backends that exist, by node port.
    pub(crate) async fn links(&self) -> BTreeMap<NodePort, String> {
        self.pool
            .lock()
            .await
            .iter()
            .filter(|(_, be)| !be.self_link.is_empty())
            .map(|(port, be)| (*port, be.self_link.clone()))
            .collect()
    }

    /// Ports of all managed backends.
    pub(crate) async fn ports(&self) -> BTreeSet<NodePort> {
        self.pool.lock().await.keys().cloned().collect()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::fakes::{Call, FakeCloud, backend_in_group};

    pub(crate) const IG: &str = "k8s-ig-testcluster";
    pub(crate) const DEFAULT_NODE_PORT: NodePort = 30000;

    pub(crate) async fn new_backend_pool(fake: &FakeCloud) -> (BackendPool, Arc<NodePool>) {
        let hc = Arc::new(HealthChecker::new(fake.health_checks.clone(), "/"));
        hc.add(DEFAULT_HTTP_HEALTH_CHECK).await.unwrap();
        let nodes = Arc::new(
            NodePool::new(fake.instance_groups.clone(), IG, "zone-a")
                .await
                .unwrap(),
        );
        let pool = BackendPool::new(
            fake.backend_services.clone(),
            nodes.clone(),
            hc,
            DEFAULT_NODE_PORT,
        )
        .await
        .unwrap();
        (pool, nodes)
    }

    fn ports(ports: &[NodePort]) -> BTreeSet<NodePort> {
        ports.iter().cloned().collect()
    }

    fn count(calls: Vec<Call>, f: impl Fn(&Call) -> bool) -> usize {
        calls.iter().filter(|c| f(c)).count()
    }

    #[tokio::test]
    async fn backends_are_created_once() {
        let fake = FakeCloud::default();
        let (pool, _) = new_backend_pool(&fake).await;
        fake.backend_services.clear_calls();

        pool.add(30001).await.unwrap();
        pool.add(30001).await.unwrap();
        let calls = fake.backend_services.calls();
        assert_eq!(1, count(calls.clone(), |c| matches!(c, Call::Create(_))));
        assert_eq!(0, count(calls, |c| matches!(c, Call::Update(_))));

        let be = pool.get(30001).await.unwrap();
        assert_eq!("k8s-be-30001", be.name);
        assert_eq!("HTTP", be.protocol);
        assert_eq!("k8s-be-30001", be.port_name);
        assert_eq!(30001, be.port);
        assert!(be.links_to(IG));
        assert_eq!(vec![DEFAULT_HTTP_HEALTH_CHECK.to_string()], be.health_checks);
        assert!(fake.instance_groups.group(IG).unwrap().named_port(30001).is_some());
    }

    #[tokio::test]
    async fn broken_edges_are_repaired() {
        let fake = FakeCloud::default();
        let (pool, _) = new_backend_pool(&fake).await;
        pool.add(30001).await.unwrap();
        fake.backend_services
            .put(backend_in_group(30001, "some-other-group"));
        fake.backend_services.clear_calls();

        pool.add(30001).await.unwrap();
        assert_eq!(
            vec![
                Call::Get("k8s-be-30001".to_string()),
                Call::Update("k8s-be-30001".to_string())
            ],
            fake.backend_services.calls()
        );
        assert!(fake.backend_services.backend("k8s-be-30001").unwrap().links_to(IG));
    }

    #[tokio::test]
    async fn gc_keeps_desired_and_default_backends() {
        let fake = FakeCloud::default();
        let (pool, _) = new_backend_pool(&fake).await;
        pool.sync(&ports(&[81, 82, 83])).await.unwrap();
        pool.add(90).await.unwrap();
        assert_eq!(
            vec!["k8s-be-30000", "k8s-be-81", "k8s-be-82", "k8s-be-83", "k8s-be-90"],
            fake.backend_services.names()
        );

        pool.gc(&ports(&[81, 82, 83])).await.unwrap();
        assert_eq!(
            vec!["k8s-be-30000", "k8s-be-81", "k8s-be-82", "k8s-be-83"],
            fake.backend_services.names()
        );

        fake.backend_services.clear_calls();
        pool.gc(&ports(&[81, 82, 83])).await.unwrap();
        assert!(fake.backend_services.calls().is_empty());

        pool.gc(&BTreeSet::new()).await.unwrap();
        assert_eq!(vec!["k8s-be-30000"], fake.backend_services.names());
        assert_eq!(ports(&[DEFAULT_NODE_PORT]), pool.ports().await);
    }

    #[tokio::test]
    async fn stray_backends_are_collected() {
        let fake = FakeCloud::default();
        let (pool, _) = new_backend_pool(&fake).await;
        pool.add(90).await.unwrap();

        pool.sync(&ports(&[81, 82, 83])).await.unwrap();
        pool.gc(&ports(&[81, 82, 83])).await.unwrap();
        assert!(pool.get(90).await.unwrap_err().is_not_found());
        for port in [81, 82, 83] {
            pool.get(port).await.unwrap();
        }
    }

    #[tokio::test]
    async fn gc_deletes_past_failures() {
        let fake = FakeCloud::default();
        let (pool, _) = new_backend_pool(&fake).await;
        pool.sync(&ports(&[81, 82, 83])).await.unwrap();
        fake.backend_services.fail_delete("k8s-be-81");

        assert!(pool.gc(&BTreeSet::new()).await.is_err());
        assert_eq!(
            vec!["k8s-be-30000", "k8s-be-81"],
            fake.backend_services.names()
        );
        assert_eq!(ports(&[81, DEFAULT_NODE_PORT]), pool.ports().await);

        fake.backend_services.clear_delete_failures();
        pool.gc(&BTreeSet::new()).await.unwrap();
        assert_eq!(vec!["k8s-be-30000"], fake.backend_services.names());
    }

    #[tokio::test]
    async fn failed_backends_are_still_managed() {
        let fake = FakeCloud::default();
        let (pool, _) = new_backend_pool(&fake).await;
        fake.backend_services.fail_creates(true);
        assert!(pool.add(30001).await.is_err());
        assert!(pool.ports().await.contains(&30001));
        assert!(!pool.links().await.contains_key(&30001));

        fake.backend_services.fail_creates(false);
        pool.gc(&BTreeSet::new()).await.unwrap();
        assert_eq!(ports(&[DEFAULT_NODE_PORT]), pool.ports().await);
    }

    #[tokio::test]
    async fn shutdown_deletes_default_backend_last() {
        let fake = FakeCloud::default();
        let (pool, _) = new_backend_pool(&fake).await;
        pool.add(80).await.unwrap();
        fake.backend_services.clear_calls();

        pool.shutdown().await.unwrap();
        assert_eq!(
            vec![
                Call::Delete("k8s-be-80".to_string()),
                Call::Delete("k8s-be-30000".to_string())
            ],
            fake.backend_services.calls()
        );
        assert!(fake.backend_services.names().is_empty());
        // The instance group is not touched.
        assert!(fake.instance_groups.group(IG).is_some());

        fake.backend_services.clear_calls();
        pool.shutdown().await.unwrap();
        assert!(fake.backend_services.calls().is_empty());
    }

    #[tokio::test]
    async fn status_and_links() {
        let fake = FakeCloud::default();
        let (pool, _) = new_backend_pool(&fake).await;
        pool.add(30001).await.unwrap();

        assert_eq!(UNKNOWN_HEALTH, pool.status("k8s-be-30001").await);
        fake.backend_services.set_health_state(Some("HEALTHY"));
        assert_eq!("HEALTHY", pool.status("k8s-be-30001").await);
        assert_eq!(UNKNOWN_HEALTH, pool.status("k8s-be-1").await);

        let links = pool.links().await;
        assert_eq!(Some(&"k8s-be-30001".to_string()), links.get(&30001));
        assert_eq!(Some(&"k8s-be-30000".to_string()), links.get(&DEFAULT_NODE_PORT));
        assert_eq!(
            "k8s-be-30000",
            pool.default_backend().await.unwrap().self_link
        );
    }
}
