use std::{collections::BTreeSet, sync::Arc, time::Duration};

use glbc_apis::NodePort;
use k8s_openapi::api::{
    core::v1::{Node, Service},
    networking::v1::Ingress,
};
use kube::ResourceExt;
use kube_runtime::reflector::{ObjectRef, Store};
use tokio::{
    sync::{Mutex, watch},
    time::{MissedTickBehavior, interval},
};

use crate::{
    cluster_manager::ClusterManager,
    errors::ControllerError,
    informer::WatchEvent,
    status::{IngressStatusWriter, load_balancer_annotations},
    task_queue::TaskQueue,
    translator::{Translator, references_service},
    utils::{object_key, split_key},
};

/// The only key of the node queue, every sync covers all nodes.
pub(crate) const NODE_SYNC_KEY: &'static str = "nodes";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunState {
    Running,
    Stopping,
    Stopped,
}

/// Watches Ingresses, Services and Nodes and drives the cluster manager
/// towards the state they describe.
pub(crate) struct LoadBalancerController {
    cluster_manager: Arc<ClusterManager>,
    translator: Translator,
    ingresses: Store<Ingress>,
    nodes: Store<Node>,
    status_writer: Arc<dyn IngressStatusWriter>,
    ingress_queue: TaskQueue,
    node_queue: TaskQueue,
    resync_period: Duration,
    /// Set once the queues have been shut down.
    shutdown: Mutex<bool>,
    state: watch::Sender<RunState>,
}

impl LoadBalancerController {
    pub(crate) fn new(
        cluster_manager: Arc<ClusterManager>,
        ingresses: Store<Ingress>,
        services: Store<Service>,
        nodes: Store<Node>,
        status_writer: Arc<dyn IngressStatusWriter>,
        resync_period: Duration,
    ) -> Arc<Self> {
        let translator = Translator::new(services, cluster_manager.backend_pool.default_port());
        let (state, _) = watch::channel(RunState::Running);
        Arc::new(Self {
            cluster_manager,
            translator,
            ingresses,
            nodes,
            status_writer,
            ingress_queue: TaskQueue::new("ingresses"),
            node_queue: TaskQueue::new("nodes"),
            resync_period,
            shutdown: Mutex::new(false),
            state,
        })
    }

    /// Reconciles the cloud with all Ingresses, then garbage collects
    /// whatever no Ingress needs anymore. GC runs even if reconciling failed.
    pub(crate) async fn sync(&self, key: &str) -> Result<(), ControllerError> {
        debug!("syncing {}", key);
        let ingresses = self.ingresses.state();
        let node_ports = self
            .translator
            .to_node_ports(ingresses.iter().map(|ing| ing.as_ref()));
        let lb_keys: BTreeSet<String> = ingresses
            .iter()
            .map(|ing| object_key(ing.as_ref()))
            .collect();

        let reconciled = self.reconcile(key, &node_ports, &lb_keys).await;
        let l7_gc = self.cluster_manager.l7_pool.gc(&lb_keys).await;
        let backend_gc = self.cluster_manager.backend_pool.gc(&node_ports).await;
        ControllerError::combine([reconciled, l7_gc, backend_gc])
    }

    async fn reconcile(
        &self,
        key: &str,
        node_ports: &BTreeSet<NodePort>,
        lb_keys: &BTreeSet<String>,
    ) -> Result<(), ControllerError> {
        let backend_pool = &self.cluster_manager.backend_pool;
        backend_pool.sync(node_ports).await?;
        self.cluster_manager.l7_pool.sync(lb_keys).await?;

        let (namespace, name) = split_key(key)?;
        let Some(ing) = self
            .ingresses
            .get(&ObjectRef::<Ingress>::new(name).within(namespace))
        else {
            debug!("Ingress {} is gone, nothing to update", key);
            return Ok(());
        };
        let lb = self.cluster_manager.l7_pool.ensure(key).await?;
        let url_map = self
            .translator
            .to_url_map(&ing, &backend_pool.links().await)?;
        let mut lb = lb.lock().await;
        lb.update_url_map(&url_map).await?;
        if let Some(ip) = lb.ip() {
            self.status_writer.update_status(&ing, ip).await?;
        }
        let annotations = load_balancer_annotations(&lb, backend_pool).await;
        self.status_writer
            .update_annotations(&ing, annotations)
            .await
    }

    /// Puts every node of the cluster into the instance group.
    pub(crate) async fn sync_nodes(&self, _key: &str) -> Result<(), ControllerError> {
        let mut names: Vec<String> = self
            .nodes
            .state()
            .iter()
            .filter(|node| node.metadata.deletion_timestamp.is_none())
            .map(|node| node.name_any())
            .collect();
        names.sort();
        self.cluster_manager.instance_pool.sync(&names).await?;
        Ok(())
    }

    pub(crate) fn on_ingress(&self, event: WatchEvent<Ingress>) {
        match event {
            WatchEvent::Added(ing) | WatchEvent::Deleted(ing) => {
                self.ingress_queue.add(object_key(ing.as_ref()))
            }
            WatchEvent::Updated { old, new } => {
                if old != new {
                    self.ingress_queue.add(object_key(new.as_ref()))
                }
            }
        }
    }

    /// Enqueues the Ingresses of the Service's namespace that route to it.
    pub(crate) fn on_service(&self, event: WatchEvent<Service>) {
        let svc = match event {
            WatchEvent::Added(svc) => svc,
            WatchEvent::Updated { old, new } if old != new => new,
            _ => return,
        };
        let namespace = svc.namespace();
        let name = svc.name_any();
        for ing in self.ingresses.state() {
            if ing.namespace() == namespace && references_service(&ing, &name) {
                debug!("Service {} changed, enqueuing Ingress {}", name, ing.name_any());
                self.ingress_queue.add(object_key(ing.as_ref()));
            }
        }
    }

    pub(crate) fn on_node(&self, event: WatchEvent<Node>) {
        match event {
            WatchEvent::Added(_) | WatchEvent::Deleted(_) => self.node_queue.add(NODE_SYNC_KEY),
            WatchEvent::Updated { .. } => (),
        }
    }

    fn resync(&self) {
        for ing in self.ingresses.state() {
            self.ingress_queue.add(object_key(ing.as_ref()));
        }
        self.node_queue.add(NODE_SYNC_KEY);
    }

    /// Starts the queue workers and the periodic resync. Returns once
    /// [`Self::stop`] has completed.
    pub(crate) async fn run(self: Arc<Self>) {
        let me = self.clone();
        self.ingress_queue.run(move |key| {
            let me = me.clone();
            async move { me.sync(&key).await }
        });
        let me = self.clone();
        self.node_queue.run(move |key| {
            let me = me.clone();
            async move { me.sync_nodes(&key).await }
        });
        info!(
            "controller started, resyncing every {:?}",
            self.resync_period
        );

        let mut state = self.state.subscribe();
        let mut resync = interval(self.resync_period);
        resync.set_missed_tick_behavior(MissedTickBehavior::Delay);
        resync.tick().await;
        loop {
            if *state.borrow_and_update() != RunState::Running {
                break;
            }
            tokio::select! {
                _ = resync.tick() => self.resync(),
                changed = state.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        if state.wait_for(|s| *s == RunState::Stopped).await.is_err() {
            warn!("controller state channel closed");
        }
        info!("controller stopped");
    }

    /// Shuts the queues down, waiting for in-flight syncs, and with
    /// `delete_all` removes every cloud resource of the cluster. Safe to call
    /// repeatedly and concurrently.
    pub(crate) async fn stop(&self, delete_all: bool) -> Result<(), ControllerError> {
        let mut shutdown = self.shutdown.lock().await;
        if !*shutdown {
            info!("shutting down controller queues");
            self.state.send_replace(RunState::Stopping);
            self.ingress_queue.shutdown().await;
            self.node_queue.shutdown().await;
            *shutdown = true;
        }
        let result = if delete_all {
            info!("deleting all load balancers and backends");
            self.cluster_manager.shutdown().await
        } else {
            Ok(())
        };
        self.state.send_replace(RunState::Stopped);
        result
    }

    pub(crate) fn cluster_manager(&self) -> &ClusterManager {
        &self.cluster_manager
    }
}
