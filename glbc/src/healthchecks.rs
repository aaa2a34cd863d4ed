use std::{
    collections::HashSet,
    sync::{Arc, Mutex, PoisonError},
};

use glbc_apis::{HttpHealthCheck, names::DEFAULT_PORT};

use crate::{cloud::HttpHealthChecks, errors::CloudError};

/// Manages the http health checks shared by all backends. Health checks are
/// created once and never updated.
pub(crate) struct HealthChecker {
    cloud: Arc<dyn HttpHealthChecks>,
    request_path: String,
    /// Health checks deleted by this process.
    deleted: Mutex<HashSet<String>>,
}

impl HealthChecker {
    pub(crate) fn new(cloud: Arc<dyn HttpHealthChecks>, request_path: impl Into<String>) -> Self {
        Self {
            cloud,
            request_path: request_path.into(),
            deleted: Default::default(),
        }
    }

    /// Creates the named health check unless it exists.
    pub(crate) async fn add(&self, name: &str) -> Result<(), CloudError> {
        match self.cloud.get_http_health_check(name).await {
            Ok(hc) => {
                info!("health check {} already exists", hc.name);
            }
            Err(e) if e.is_not_found() => {
                info!("creating health check {}", name);
                self.cloud
                    .create_http_health_check(&HttpHealthCheck {
                        name: name.to_string(),
                        description: "Default kubernetes L7 Loadbalancing health check."
                            .to_string(),
                        port: DEFAULT_PORT,
                        request_path: self.request_path.clone(),
                        check_interval_sec: 1,
                        timeout_sec: 1,
                        healthy_threshold: 1,
                        unhealthy_threshold: 10,
                        ..Default::default()
                    })
                    .await?;
            }
            Err(e) => Err(e)?,
        }
        self.deleted
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name);
        Ok(())
    }

    pub(crate) async fn get(&self, name: &str) -> Result<HttpHealthCheck, CloudError> {
        self.cloud.get_http_health_check(name).await
    }

    /// Deletes the named health check. Deleting a health check that does not
    /// exist succeeds.
    pub(crate) async fn delete(&self, name: &str) -> Result<(), CloudError> {
        if self
            .deleted
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(name)
        {
            debug!("health check {} already deleted", name);
            return Ok(());
        }
        info!("deleting health check {}", name);
        match self.cloud.delete_http_health_check(name).await {
            Ok(()) => (),
            Err(e) if e.is_not_found() => {
                debug!("health check {} does not exist: {}", name, e);
            }
            Err(e) => Err(e)?,
        }
        self.deleted
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use glbc_apis::names::DEFAULT_HTTP_HEALTH_CHECK;

    use super::*;
    use crate::fakes::{Call, FakeHealthChecks};

    #[tokio::test]
    async fn health_check_is_created_once_with_fixed_policy() {
        let fake = Arc::new(FakeHealthChecks::default());
        let checker = HealthChecker::new(fake.clone(), "/healthz");
        checker.add(DEFAULT_HTTP_HEALTH_CHECK).await.unwrap();
        checker.add(DEFAULT_HTTP_HEALTH_CHECK).await.unwrap();

        let creates = fake
            .calls()
            .into_iter()
            .filter(|c| matches!(c, Call::Create(_)))
            .count();
        assert_eq!(1, creates);

        let hc = checker.get(DEFAULT_HTTP_HEALTH_CHECK).await.unwrap();
        assert_eq!("/healthz", hc.request_path);
        assert_eq!(80, hc.port);
        assert_eq!(1, hc.check_interval_sec);
        assert_eq!(1, hc.timeout_sec);
        assert_eq!(1, hc.healthy_threshold);
        assert_eq!(10, hc.unhealthy_threshold);
        assert_eq!(DEFAULT_HTTP_HEALTH_CHECK, hc.self_link);
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let fake = Arc::new(FakeHealthChecks::default());
        let checker = HealthChecker::new(fake.clone(), "/");
        checker.add(DEFAULT_HTTP_HEALTH_CHECK).await.unwrap();
        checker.delete(DEFAULT_HTTP_HEALTH_CHECK).await.unwrap();
        checker.delete(DEFAULT_HTTP_HEALTH_CHECK).await.unwrap();
        assert!(fake.health_check(DEFAULT_HTTP_HEALTH_CHECK).is_none());

        let deletes = fake
            .calls()
            .into_iter()
            .filter(|c| matches!(c, Call::Delete(_)))
            .count();
        assert_eq!(1, deletes);

        // Never created, the 404 is tolerated.
        checker.delete("k8s-be-30001").await.unwrap();
    }
}
