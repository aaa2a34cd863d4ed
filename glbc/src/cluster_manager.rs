use std::sync::Arc;

use glbc_apis::{
    NodePort,
    names::{DEFAULT_HTTP_HEALTH_CHECK, default_instance_group_name},
};

use crate::{
    backends::BackendPool,
    cloud::CloudClients,
    errors::{CloudError, ControllerError},
    healthchecks::HealthChecker,
    instances::NodePool,
    loadbalancers::LoadBalancerPool,
};

/// Composition root of the cloud resource pools of one cluster.
pub(crate) struct ClusterManager {
    pub(crate) cluster_name: String,
    pub(crate) health_checker: Arc<HealthChecker>,
    pub(crate) instance_pool: Arc<NodePool>,
    pub(crate) backend_pool: Arc<BackendPool>,
    pub(crate) l7_pool: Arc<LoadBalancerPool>,
}

impl ClusterManager {
    /// Creates the pools in dependency order: health check, instance group,
    /// backends (including the default backend), load balancers.
    pub(crate) async fn new(
        cloud: CloudClients,
        cluster_name: &str,
        zone: &str,
        default_backend_port: NodePort,
        health_check_path: &str,
    ) -> Result<Self, CloudError> {
        let health_checker = Arc::new(HealthChecker::new(cloud.health_checks, health_check_path));
        health_checker.add(DEFAULT_HTTP_HEALTH_CHECK).await?;

        let instance_pool = Arc::new(
            NodePool::new(
                cloud.instance_groups,
                default_instance_group_name(cluster_name),
                zone,
            )
            .await?,
        );
        let backend_pool = Arc::new(
            BackendPool::new(
                cloud.backend_services,
                instance_pool.clone(),
                health_checker.clone(),
                default_backend_port,
            )
            .await?,
        );
        let default_backend = backend_pool.default_backend().await?;
        let l7_pool = Arc::new(LoadBalancerPool::new(cloud.load_balancers, default_backend));
        info!(
            "cluster manager of {} ready, default backend node port {}",
            cluster_name, default_backend_port
        );
        Ok(Self {
            cluster_name: cluster_name.to_string(),
            health_checker,
            instance_pool,
            backend_pool,
            l7_pool,
        })
    }

    /// Deletes all cloud resources: load balancers, backends, the instance
    /// group and finally the health check. Safe to call repeatedly.
    pub(crate) async fn shutdown(&self) -> Result<(), ControllerError> {
        info!("deleting all cloud resources of cluster {}", self.cluster_name);
        self.l7_pool.shutdown().await?;
        self.backend_pool.shutdown().await?;
        self.instance_pool.shutdown().await?;
        self.health_checker.delete(DEFAULT_HTTP_HEALTH_CHECK).await?;
        Ok(())
    }

    /// Succeeds if the default backend can be read from the cloud.
    pub(crate) async fn is_healthy(&self) -> Result<(), ControllerError> {
        self.backend_pool.default_backend().await?;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::BTreeSet;

    use super::*;
    use crate::fakes::{Call, FakeCloud};

    pub(crate) const CLUSTER: &str = "testcluster";
    pub(crate) const DEFAULT_NODE_PORT: NodePort = 30000;

    pub(crate) async fn new_cluster_manager(fake: &FakeCloud) -> ClusterManager {
        ClusterManager::new(fake.clients(), CLUSTER, "zone-a", DEFAULT_NODE_PORT, "/")
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn bootstrap_creates_shared_resources() {
        let fake = FakeCloud::default();
        let cm = new_cluster_manager(&fake).await;
        assert!(fake.health_checks.health_check(DEFAULT_HTTP_HEALTH_CHECK).is_some());
        assert!(fake.instance_groups.group("k8s-ig-testcluster").is_some());
        assert_eq!(vec!["k8s-be-30000"], fake.backend_services.names());
        assert!(
            fake.backend_services
                .backend("k8s-be-30000")
                .unwrap()
                .links_to("k8s-ig-testcluster")
        );
        assert!(cm.l7_pool.names().await.is_empty());
        cm.is_healthy().await.unwrap();

        // A second controller reuses everything.
        new_cluster_manager(&fake).await;
        let creates = |calls: Vec<Call>| calls.iter().filter(|c| matches!(c, Call::Create(_))).count();
        assert_eq!(1, creates(fake.health_checks.calls()));
        assert_eq!(1, creates(fake.instance_groups.calls()));
        assert_eq!(1, creates(fake.backend_services.calls()));
    }

    #[tokio::test]
    async fn shutdown_deletes_everything_once() {
        let fake = FakeCloud::default();
        let cm = new_cluster_manager(&fake).await;
        let ports: BTreeSet<NodePort> = [30001, 30002].into_iter().collect();
        cm.backend_pool.sync(&ports).await.unwrap();
        cm.l7_pool
            .sync(&["default/foo".to_string()].into_iter().collect())
            .await
            .unwrap();
        cm.instance_pool
            .sync(&["n1".to_string(), "n2".to_string()])
            .await
            .unwrap();

        cm.shutdown().await.unwrap();
        assert_eq!((0, 0, 0), fake.load_balancers.counts());
        assert!(fake.backend_services.names().is_empty());
        assert!(fake.instance_groups.group("k8s-ig-testcluster").is_none());
        assert!(fake.health_checks.health_check(DEFAULT_HTTP_HEALTH_CHECK).is_none());
        assert!(cm.is_healthy().await.is_err());

        fake.backend_services.clear_calls();
        fake.instance_groups.clear_calls();
        fake.load_balancers.clear_calls();
        cm.shutdown().await.unwrap();
        assert!(fake.backend_services.calls().is_empty());
        assert!(fake.instance_groups.calls().is_empty());
        assert!(fake.load_balancers.calls().is_empty());
        let hc_deletes = fake
            .health_checks
            .calls()
            .iter()
            .filter(|c| matches!(c, Call::Delete(_)))
            .count();
        assert_eq!(1, hc_deletes);
    }
}
