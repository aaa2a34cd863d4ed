use std::{collections::BTreeSet, sync::Arc};

use glbc_apis::{ALL_INSTANCES, InstanceGroup, NamedPort, NodePort};
use tokio::sync::Mutex;

use crate::{cloud::InstanceGroups, errors::CloudError};

/// Owns the default instance group of the cluster and keeps its members equal
/// to the set of cluster nodes.
pub(crate) struct NodePool {
    cloud: Arc<dyn InstanceGroups>,
    name: String,
    zone: String,
    /// `None` once the instance group was deleted by `shutdown`.
    default_ig: Mutex<Option<InstanceGroup>>,
}

async fn get_or_create_instance_group(
    cloud: &dyn InstanceGroups,
    name: &str,
    zone: &str,
) -> Result<InstanceGroup, CloudError> {
    match cloud.get_instance_group(name, zone).await {
        Ok(ig) => {
            info!("instance group {} already exists", ig.name);
            Ok(ig)
        }
        Err(e) if e.is_not_found() => {
            info!("creating instance group {} in zone {}", name, zone);
            cloud.create_instance_group(name, zone).await
        }
        Err(e) => Err(e),
    }
}

impl NodePool {
    pub(crate) async fn new(
        cloud: Arc<dyn InstanceGroups>,
        name: impl Into<String>,
        zone: impl Into<String>,
    ) -> Result<Self, CloudError> {
        let name = name.into();
        let zone = zone.into();
        let ig = get_or_create_instance_group(cloud.as_ref(), &name, &zone).await?;
        Ok(Self {
            cloud,
            name,
            zone,
            default_ig: Mutex::new(Some(ig)),
        })
    }

    /// The default instance group, as last seen by this pool.
    pub(crate) async fn default_instance_group(&self) -> Result<InstanceGroup, CloudError> {
        self.default_ig
            .lock()
            .await
            .clone()
            .ok_or_else(|| CloudError::not_found("InstanceGroup", &self.name))
    }

    pub(crate) async fn instance_group_link(&self) -> Result<String, CloudError> {
        Ok(self.default_instance_group().await?.self_link)
    }

    pub(crate) async fn get(&self, name: &str) -> Result<InstanceGroup, CloudError> {
        self.cloud.get_instance_group(name, &self.zone).await
    }

    /// Registers the named port `k8s-be-<port>` on the default instance group.
    pub(crate) async fn add_named_port(
        &self,
        port: NodePort,
    ) -> Result<(InstanceGroup, NamedPort), CloudError> {
        let mut guard = self.default_ig.lock().await;
        let cached = guard
            .as_ref()
            .ok_or_else(|| CloudError::not_found("InstanceGroup", &self.name))?;
        if let Some(named_port) = cached.named_port(port) {
            return Ok((cached.clone(), named_port.clone()));
        }
        // setNamedPorts needs the current fingerprint and port list.
        let ig = self.get(&self.name).await?;
        let named_port = match ig.named_port(port) {
            Some(named_port) => named_port.clone(),
            None => {
                info!("adding port {} to instance group {}", port, ig.name);
                self.cloud.add_port_to_instance_group(&ig, port).await?
            }
        };
        let ig = self.get(&self.name).await?;
        *guard = Some(ig.clone());
        Ok((ig, named_port))
    }

    async fn list(&self) -> Result<BTreeSet<String>, CloudError> {
        Ok(self
            .cloud
            .list_instances_in_instance_group(&self.name, &self.zone, ALL_INSTANCES)
            .await?
            .iter()
            .map(|i| i.node_name().to_string())
            .collect())
    }

    async fn sync_members(&self, nodes: &BTreeSet<String>) -> Result<(), CloudError> {
        let current = self.list().await?;
        let remove: Vec<String> = current.difference(nodes).cloned().collect();
        let add: Vec<String> = nodes.difference(&current).cloned().collect();
        if !remove.is_empty() {
            info!("removing nodes {:?} from {}", remove, self.name);
            self.cloud
                .remove_instances_from_instance_group(&self.name, &self.zone, &remove)
                .await?;
        }
        if !add.is_empty() {
            info!("adding nodes {:?} to {}", add, self.name);
            self.cloud
                .add_instances_to_instance_group(&self.name, &self.zone, &add)
                .await?;
        }
        Ok(())
    }

    /// Makes the members of the default instance group equal to `node_names`.
    /// A group deleted out-of-band is recreated.
    pub(crate) async fn sync(&self, node_names: &[String]) -> Result<(), CloudError> {
        if self.default_ig.lock().await.is_none() {
            debug!("instance group {} is shut down, skipping sync", self.name);
            return Ok(());
        }
        let nodes: BTreeSet<String> = node_names.iter().cloned().collect();
        debug!("syncing nodes {:?}", nodes);
        match self.sync_members(&nodes).await {
            Err(e) if e.is_not_found() => {
                warn!("instance group {} vanished, recreating it: {}", self.name, e);
                let ig =
                    get_or_create_instance_group(self.cloud.as_ref(), &self.name, &self.zone)
                        .await?;
                *self.default_ig.lock().await = Some(ig);
                self.sync_members(&nodes).await
            }
            result => result,
        }
    }

    /// Deletes the default instance group. Callers must delete every backend
    /// referencing it first.
    pub(crate) async fn shutdown(&self) -> Result<(), CloudError> {
        let mut guard = self.default_ig.lock().await;
        if guard.is_none() {
            return Ok(());
        }
        info!("deleting instance group {}", self.name);
        match self.cloud.delete_instance_group(&self.name, &self.zone).await {
            Ok(()) => (),
            Err(e) if e.is_not_found() => (),
            Err(e) => Err(e)?,
        }
        *guard = None;
        Ok(())
    }
}
