//! Write-back of load balancer state into Ingress objects.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::networking::v1::Ingress;
use kube::{
    Api, Client, ResourceExt,
    api::{Patch, PatchParams},
};
use serde_json::json;

use crate::{
    MANAGER,
    backends::{BackendPool, UNKNOWN_HEALTH},
    errors::{ControllerError, ExtKubeApiError},
    loadbalancers::L7,
};

/// Prefix of the annotations describing the load balancer of an Ingress.
pub(crate) const ANNOTATION_PREFIX: &'static str = "ingress.kubernetes.io";

pub(crate) fn annotation(name: &str) -> String {
    format!("{}/{}", ANNOTATION_PREFIX, name)
}

/// Annotations naming the resources of the L7 and the health of its backends.
pub(crate) async fn load_balancer_annotations(
    l7: &L7,
    backend_pool: &BackendPool,
) -> BTreeMap<String, String> {
    let mut backend_state = BTreeMap::new();
    for name in l7.backend_names() {
        let state = backend_pool.status(&name).await;
        backend_state.insert(name, state);
    }
    let backends =
        serde_json::to_string(&backend_state).unwrap_or_else(|_| UNKNOWN_HEALTH.to_string());

    let mut annotations = BTreeMap::new();
    let resource_names = [
        ("url-map", l7.url_map().map(|um| um.name.clone())),
        ("forwarding-rule", l7.forwarding_rule().map(|fw| fw.name.clone())),
        ("target-proxy", l7.target_proxy().map(|tp| tp.name.clone())),
    ];
    for (name, value) in resource_names {
        if let Some(value) = value {
            annotations.insert(annotation(name), value);
        }
    }
    annotations.insert(annotation("backends"), backends);
    annotations
}

fn current_ip(ing: &Ingress) -> Option<&str> {
    ing.status
        .as_ref()?
        .load_balancer
        .as_ref()?
        .ingress
        .as_ref()?
        .first()?
        .ip
        .as_deref()
}

/// Only the annotations whose value differs from the Ingress.
pub(crate) fn changed_annotations(
    ing: &Ingress,
    annotations: BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let existing = ing.annotations();
    annotations
        .into_iter()
        .filter(|(k, v)| existing.get(k) != Some(v))
        .collect()
}

#[async_trait]
pub(crate) trait IngressStatusWriter: Send + Sync {
    /// Publishes the load balancer IP in the Ingress status if it changed.
    async fn update_status(&self, ing: &Ingress, ip: &str) -> Result<(), ControllerError>;

    /// Merges the annotations into the Ingress metadata if any changed.
    async fn update_annotations(
        &self,
        ing: &Ingress,
        annotations: BTreeMap<String, String>,
    ) -> Result<(), ControllerError>;
}

pub(crate) struct KubeIngressStatusWriter {
    client: Client,
}

impl KubeIngressStatusWriter {
    pub(crate) fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, ing: &Ingress) -> Api<Ingress> {
        Api::namespaced(
            self.client.clone(),
            ing.namespace().as_deref().unwrap_or("default"),
        )
    }

    fn patch_params() -> PatchParams {
        PatchParams {
            field_manager: Some(MANAGER.to_string()),
            ..Default::default()
        }
    }
}

#[async_trait]
impl IngressStatusWriter for KubeIngressStatusWriter {
    async fn update_status(&self, ing: &Ingress, ip: &str) -> Result<(), ControllerError> {
        if current_ip(ing) == Some(ip) {
            return Ok(());
        }
        let name = ing.name_any();
        info!(
            "updating load balancer IP of Ingress {}/{} to {}",
            ing.namespace().unwrap_or_default(),
            name,
            ip
        );
        let patch = json!({
            "status": {
                "loadBalancer": {
                    "ingress": [{ "ip": ip }]
                }
            }
        });
        match self
            .api(ing)
            .patch_status(&name, &Self::patch_params(), &Patch::Merge(&patch))
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => {
                debug!("Ingress {} is gone, skipping status update", name);
                Ok(())
            }
            Err(e) if e.is_conflict() => {
                debug!("conflict updating status of Ingress {}: {}", name, e);
                Err(e.into())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn update_annotations(
        &self,
        ing: &Ingress,
        annotations: BTreeMap<String, String>,
    ) -> Result<(), ControllerError> {
        let changed = changed_annotations(ing, annotations);
        if changed.is_empty() {
            return Ok(());
        }
        let name = ing.name_any();
        debug!("updating annotations of Ingress {}: {:?}", name, changed);
        let patch = json!({
            "metadata": {
                "annotations": changed
            }
        });
        match self
            .api(ing)
            .patch(&name, &Self::patch_params(), &Patch::Merge(&patch))
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Mutex;

    use k8s_openapi::api::networking::v1::{
        IngressLoadBalancerIngress, IngressLoadBalancerStatus, IngressStatus,
    };
    use kube::api::ObjectMeta;

    use super::*;
    use crate::utils::object_key;

    /// Records status and annotation updates keyed by `namespace/name`.
    #[derive(Default)]
    pub(crate) struct RecordingStatusWriter {
        pub(crate) ips: Mutex<BTreeMap<String, String>>,
        pub(crate) annotations: Mutex<BTreeMap<String, BTreeMap<String, String>>>,
    }

    #[async_trait]
    impl IngressStatusWriter for RecordingStatusWriter {
        async fn update_status(&self, ing: &Ingress, ip: &str) -> Result<(), ControllerError> {
            self.ips
                .lock()
                .unwrap()
                .insert(object_key(ing), ip.to_string());
            Ok(())
        }

        async fn update_annotations(
            &self,
            ing: &Ingress,
            annotations: BTreeMap<String, String>,
        ) -> Result<(), ControllerError> {
            self.annotations
                .lock()
                .unwrap()
                .insert(object_key(ing), annotations);
            Ok(())
        }
    }

    #[test]
    fn only_changed_annotations_are_patched() {
        let mut existing = BTreeMap::new();
        existing.insert(annotation("url-map"), "k8s-um-default-foo".to_string());
        existing.insert("other".to_string(), "x".to_string());
        let ing = Ingress {
            metadata: ObjectMeta {
                name: Some("foo".to_string()),
                annotations: Some(existing),
                ..Default::default()
            },
            ..Default::default()
        };
        let mut desired = BTreeMap::new();
        desired.insert(annotation("url-map"), "k8s-um-default-foo".to_string());
        desired.insert(annotation("backends"), "{}".to_string());
        let changed = changed_annotations(&ing, desired);
        assert_eq!(1, changed.len());
        assert_eq!(Some(&"{}".to_string()), changed.get("ingress.kubernetes.io/backends"));
    }

    #[test]
    fn current_ip_of_ingress() {
        let mut ing = Ingress::default();
        assert_eq!(None, current_ip(&ing));
        ing.status = Some(IngressStatus {
            load_balancer: Some(IngressLoadBalancerStatus {
                ingress: Some(vec![IngressLoadBalancerIngress {
                    ip: Some("1.2.3.4".to_string()),
                    ..Default::default()
                }]),
            }),
        });
        assert_eq!(Some("1.2.3.4"), current_ip(&ing));
    }
}
