#[macro_use]
extern crate log;

use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{Context, anyhow, bail};
use glbc_apis::NodePort;
use k8s_openapi::api::{
    core::v1::{Node, Service},
    networking::v1::Ingress,
};
use kube::{Api, Client};
use kube_runtime::reflector;
use opentelemetry::global;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use tokio::{
    signal::unix::{SignalKind, signal},
    time::{Instant, sleep},
};

use admin_server::start_admin_server;
use cloud::CloudClients;
use cluster_manager::ClusterManager;
use controller::LoadBalancerController;
use errors::ExtKubeApiError;
use fakes::FakeCloud;
use gce::GceCloud;
use informer::Informer;
use status::KubeIngressStatusWriter;

mod admin_server;
mod backends;
mod cloud;
mod cluster_manager;
mod controller;
mod errors;
mod fakes;
mod gce;
mod healthchecks;
mod informer;
mod instances;
mod loadbalancers;
mod status;
mod task_queue;
mod translator;
mod utils;

/// The K8s field manager name.
const MANAGER: &'static str = "glbc";

/// Zone reported by the in-memory cloud of a dry run.
const DRY_RUN_ZONE: &'static str = "dry-run";

/// How long to wait for the default backend service to get a node port.
const DEFAULT_BACKEND_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Clone)]
struct Configuration {
    cluster_name: String,
    /// `namespace/name` of the service every unmatched request goes to.
    default_backend_service: String,
    health_check_path: String,
    resync_period: Duration,
    delete_all_on_quit: bool,
    /// Manage in-memory cloud resources instead of real ones.
    dry_run: bool,
    listen_addr: SocketAddr,
    gce_project: Option<String>,
    gce_zone: Option<String>,
}

impl Configuration {
    fn from_env() -> anyhow::Result<Self> {
        let resync_period = match env_var("GLBC_RESYNC_PERIOD_SECS") {
            Some(v) => v
                .parse::<u64>()
                .with_context(|| format!("invalid GLBC_RESYNC_PERIOD_SECS {:?}", v))?,
            None => 30,
        };
        if resync_period == 0 {
            bail!("GLBC_RESYNC_PERIOD_SECS must be positive");
        }
        let listen_addr = env_var("GLBC_LISTEN_ADDR").unwrap_or_else(|| "0.0.0.0".to_string());
        let listen_port = env_var("GLBC_LISTEN_PORT").unwrap_or_else(|| "8081".to_string());
        let listen_addr = format!("{}:{}", listen_addr, listen_port)
            .parse()
            .with_context(|| format!("invalid listen address {}:{}", listen_addr, listen_port))?;
        Ok(Self {
            cluster_name: env_var("GLBC_CLUSTER_NAME")
                .unwrap_or_else(|| "default-cluster-name".to_string()),
            default_backend_service: env_var("GLBC_DEFAULT_BACKEND_SERVICE")
                .unwrap_or_else(|| "kube-system/default-http-backend".to_string()),
            health_check_path: env_var("GLBC_HEALTH_CHECK_PATH")
                .unwrap_or_else(|| glbc_apis::names::DEFAULT_HEALTH_CHECK_PATH.to_string()),
            resync_period: Duration::from_secs(resync_period),
            delete_all_on_quit: env_flag("GLBC_DELETE_ALL_ON_QUIT")?,
            dry_run: env_flag("GLBC_DRY_RUN")?,
            listen_addr,
            gce_project: env_var("GCE_PROJECT"),
            gce_zone: env_var("GCE_ZONE"),
        })
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_flag(name: &str) -> anyhow::Result<bool> {
    match env_var(name).map(|v| v.to_lowercase()).as_deref() {
        None | Some("false") | Some("0") => Ok(false),
        Some("true") | Some("1") => Ok(true),
        Some(other) => Err(anyhow!("invalid boolean {:?} for {}", other, name)),
    }
}

/// Waits for the service to exist and returns its first node port.
async fn wait_for_node_port(client: Client, service: &str) -> anyhow::Result<NodePort> {
    let (namespace, name) = utils::split_key(service)
        .with_context(|| "default backend service must be of the form namespace/name")?;
    let api: Api<Service> = Api::namespaced(client, namespace);
    info!("waiting for default backend service {}", service);
    let deadline = Instant::now() + DEFAULT_BACKEND_TIMEOUT;
    loop {
        match api.get(name).await {
            Ok(svc) => {
                let node_port = svc
                    .spec
                    .iter()
                    .flat_map(|spec| spec.ports.iter().flatten())
                    .filter_map(|p| p.node_port)
                    .find(|port| *port != 0);
                if let Some(node_port) = node_port {
                    info!("default backend node port {}", node_port);
                    return Ok(node_port as NodePort);
                }
                debug!("service {} has no node port yet", service);
            }
            Err(e) if e.is_not_found() => debug!("service {} not found yet", service),
            Err(e) => warn!("failed to get service {}: {}", service, e),
        }
        if Instant::now() > deadline {
            bail!(
                "default backend service {} has no node port after {:?}",
                service,
                DEFAULT_BACKEND_TIMEOUT
            );
        }
        sleep(Duration::from_secs(1)).await;
    }
}

async fn shutdown_signal() -> anyhow::Result<()> {
    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = sigterm.recv() => info!("received SIGTERM"),
        r = tokio::signal::ctrl_c() => {
            r?;
            info!("received SIGINT");
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow!("failed to install rustls crypto provider"))?;
    let configuration = Configuration::from_env()?;
    info!("starting with {:?}", configuration);

    let registry = prometheus::Registry::new();
    let exporter = opentelemetry_prometheus::exporter()
        .with_registry(registry.clone())
        .build()?;
    let meter_provider = SdkMeterProvider::builder().with_reader(exporter).build();
    global::set_meter_provider(meter_provider.clone());

    let client = Client::try_default().await?;
    let default_backend_port =
        wait_for_node_port(client.clone(), &configuration.default_backend_service).await?;

    let (cloud, zone) = if configuration.dry_run {
        warn!("dry run, cloud resources are kept in memory");
        let zone = configuration
            .gce_zone
            .clone()
            .unwrap_or_else(|| DRY_RUN_ZONE.to_string());
        (FakeCloud::default().clients(), zone)
    } else {
        let gce = GceCloud::new(
            configuration.gce_project.clone(),
            configuration.gce_zone.clone(),
        )
        .await?;
        let zone = gce.zone().to_string();
        (CloudClients::from_provider(Arc::new(gce)), zone)
    };
    let cluster_manager = Arc::new(
        ClusterManager::new(
            cloud,
            &configuration.cluster_name,
            &zone,
            default_backend_port,
            &configuration.health_check_path,
        )
        .await?,
    );

    let (ingress_store, ingress_writer) = reflector::store::<Ingress>();
    let (service_store, service_writer) = reflector::store::<Service>();
    let (node_store, node_writer) = reflector::store::<Node>();
    let controller = LoadBalancerController::new(
        cluster_manager,
        ingress_store.clone(),
        service_store.clone(),
        node_store.clone(),
        Arc::new(KubeIngressStatusWriter::new(client.clone())),
        configuration.resync_period,
    );

    let c = controller.clone();
    tokio::spawn(
        Informer::new(ingress_writer)
            .run(Api::<Ingress>::all(client.clone()), move |e| c.on_ingress(e)),
    );
    let c = controller.clone();
    tokio::spawn(
        Informer::new(service_writer)
            .run(Api::<Service>::all(client.clone()), move |e| c.on_service(e)),
    );
    let c = controller.clone();
    tokio::spawn(
        Informer::new(node_writer).run(Api::<Node>::all(client.clone()), move |e| c.on_node(e)),
    );
    // Syncing against a partial cache would garbage collect live load balancers.
    ingress_store.wait_until_ready().await?;
    service_store.wait_until_ready().await?;
    node_store.wait_until_ready().await?;

    let (_, admin_server) = start_admin_server(
        configuration.listen_addr,
        registry,
        controller.clone(),
    )
    .await?;
    info!("start controller ...");
    tokio::select! {
        _ = controller.clone().run() => {
            // Exiting now would restart the pod and recreate everything.
            info!("handled quit, awaiting pod deletion");
            shutdown_signal().await?;
        }
        r = shutdown_signal() => {
            r?;
            controller.stop(configuration.delete_all_on_quit).await?;
        }
    };
    admin_server.abort();
    if let Err(e) = meter_provider.shutdown() {
        debug!("meter provider shutdown: {}", e);
    }
    info!("exiting");
    Ok(())
}
