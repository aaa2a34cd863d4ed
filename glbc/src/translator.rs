//! Translation of Ingress objects into node ports and url maps.

use std::collections::{BTreeMap, BTreeSet};

use glbc_apis::NodePort;
use k8s_openapi::api::{
    core::v1::Service,
    networking::v1::{Ingress, IngressBackend, IngressServiceBackend},
};
use kube::ResourceExt;
use kube_runtime::reflector::{ObjectRef, Store};

use crate::{errors::ControllerError, loadbalancers::GceUrlMap};

pub(crate) struct Translator {
    services: Store<Service>,
    default_backend_port: NodePort,
}

/// Service backends of the default backend and of all http paths.
fn service_backends(ing: &Ingress) -> impl Iterator<Item = &IngressServiceBackend> {
    let spec = ing.spec.as_ref();
    let default_backend = spec
        .and_then(|s| s.default_backend.as_ref())
        .and_then(|b| b.service.as_ref());
    let paths = spec
        .and_then(|s| s.rules.as_ref())
        .into_iter()
        .flatten()
        .filter_map(|rule| rule.http.as_ref())
        .flat_map(|http| http.paths.iter())
        .filter_map(|path| path.backend.service.as_ref());
    default_backend.into_iter().chain(paths)
}

/// Returns true if the Ingress routes any traffic to the named service.
pub(crate) fn references_service(ing: &Ingress, name: &str) -> bool {
    service_backends(ing).any(|be| be.name == name)
}

fn describe_port(be: &IngressServiceBackend) -> String {
    match &be.port {
        Some(port) => match (&port.number, &port.name) {
            (Some(number), _) => number.to_string(),
            (None, Some(name)) => name.clone(),
            (None, None) => String::new(),
        },
        None => String::new(),
    }
}

impl Translator {
    pub(crate) fn new(services: Store<Service>, default_backend_port: NodePort) -> Self {
        Self {
            services,
            default_backend_port,
        }
    }

    /// Node port of the service port referenced by the backend, looked up by
    /// port number or port name.
    pub(crate) fn node_port(
        &self,
        namespace: &str,
        be: &IngressServiceBackend,
    ) -> Result<NodePort, ControllerError> {
        let not_found = |reason: &str| ControllerError::NodePortNotFound {
            namespace: namespace.to_string(),
            service: be.name.clone(),
            port: describe_port(be),
            reason: reason.to_string(),
        };
        let svc = self
            .services
            .get(&ObjectRef::<Service>::new(&be.name).within(namespace))
            .ok_or_else(|| not_found("service not found in store"))?;
        let wanted = be
            .port
            .as_ref()
            .ok_or_else(|| not_found("backend has no service port"))?;
        let port = svc
            .spec
            .as_ref()
            .and_then(|s| s.ports.as_ref())
            .into_iter()
            .flatten()
            .find(|p| match (&wanted.number, &wanted.name) {
                (Some(number), _) => p.port == *number,
                (None, Some(name)) => p.name.as_ref() == Some(name),
                (None, None) => false,
            })
            .ok_or_else(|| not_found("no matching service port"))?;
        match port.node_port {
            Some(node_port) if node_port != 0 => Ok(node_port as NodePort),
            _ => Err(not_found("service port has no node port")),
        }
    }

    fn backend_node_port(&self, namespace: &str, be: &IngressBackend) -> Option<NodePort> {
        let service = be.service.as_ref()?;
        match self.node_port(namespace, service) {
            Ok(port) => Some(port),
            Err(e) => {
                info!("{}", e);
                None
            }
        }
    }

    /// All node ports the Ingresses route to, plus the cluster default backend
    /// port. Unresolvable backends are skipped.
    pub(crate) fn to_node_ports<'a>(
        &self,
        ingresses: impl IntoIterator<Item = &'a Ingress>,
    ) -> BTreeSet<NodePort> {
        let mut ports = BTreeSet::new();
        ports.insert(self.default_backend_port);
        for ing in ingresses {
            let namespace = ing.namespace().unwrap_or_default();
            for be in service_backends(ing) {
                match self.node_port(&namespace, be) {
                    Ok(port) => {
                        ports.insert(port);
                    }
                    Err(e) => info!("{}", e),
                }
            }
        }
        ports
    }

    /// The url map of the Ingress, resolved against the backend self links.
    /// Paths whose service has no node port are left out, a node port without
    /// a backend is an error.
    pub(crate) fn to_url_map(
        &self,
        ing: &Ingress,
        links: &BTreeMap<NodePort, String>,
    ) -> Result<GceUrlMap, ControllerError> {
        let namespace = ing.namespace().unwrap_or_default();
        let mut url_map = GceUrlMap::default();
        let Some(spec) = ing.spec.as_ref() else {
            return Ok(url_map);
        };
        for rule in spec.rules.iter().flatten() {
            let Some(http) = rule.http.as_ref() else {
                warn!(
                    "ignoring non http rule of Ingress {}/{}",
                    namespace,
                    ing.name_any()
                );
                continue;
            };
            let host = rule.host.as_deref().unwrap_or_default();
            for path in &http.paths {
                let Some(port) = self.backend_node_port(&namespace, &path.backend) else {
                    continue;
                };
                let link = links
                    .get(&port)
                    .ok_or(ControllerError::MissingBackend(port))?;
                url_map.put(host, path.path.as_deref().unwrap_or_default(), link.clone());
            }
        }
        url_map.default_backend = spec
            .default_backend
            .as_ref()
            .and_then(|be| self.backend_node_port(&namespace, be))
            .and_then(|port| links.get(&port).cloned());
        Ok(url_map)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use k8s_openapi::api::{
        core::v1::{ServicePort, ServiceSpec},
        networking::v1::{
            HTTPIngressPath, HTTPIngressRuleValue, IngressRule, IngressSpec, ServiceBackendPort,
        },
    };
    use kube::api::ObjectMeta;
    use kube_runtime::{reflector, watcher};

    use super::*;
    use crate::loadbalancers::{DEFAULT_HOST, DEFAULT_PATH};

    pub(crate) fn service(namespace: &str, name: &str, ports: &[(&str, i32, i32)]) -> Service {
        Service {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                ports: Some(
                    ports
                        .iter()
                        .map(|(port_name, port, node_port)| ServicePort {
                            name: Some(port_name.to_string()),
                            port: *port,
                            node_port: Some(*node_port),
                            ..Default::default()
                        })
                        .collect(),
                ),
                type_: Some("NodePort".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    pub(crate) fn backend(service: &str, port: i32) -> IngressBackend {
        IngressBackend {
            service: Some(IngressServiceBackend {
                name: service.to_string(),
                port: Some(ServiceBackendPort {
                    number: Some(port),
                    name: None,
                }),
            }),
            resource: None,
        }
    }

    fn named_backend(service: &str, port: &str) -> IngressBackend {
        IngressBackend {
            service: Some(IngressServiceBackend {
                name: service.to_string(),
                port: Some(ServiceBackendPort {
                    number: None,
                    name: Some(port.to_string()),
                }),
            }),
            resource: None,
        }
    }

    /// Ingress in `namespace` with rules host -> [(path, backend)].
    pub(crate) fn ingress(
        namespace: &str,
        name: &str,
        default_backend: Option<IngressBackend>,
        rules: Vec<(&str, Vec<(&str, IngressBackend)>)>,
    ) -> Ingress {
        Ingress {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            spec: Some(IngressSpec {
                default_backend,
                rules: Some(
                    rules
                        .into_iter()
                        .map(|(host, paths)| IngressRule {
                            host: if host.is_empty() {
                                None
                            } else {
                                Some(host.to_string())
                            },
                            http: Some(HTTPIngressRuleValue {
                                paths: paths
                                    .into_iter()
                                    .map(|(path, backend)| HTTPIngressPath {
                                        path: if path.is_empty() {
                                            None
                                        } else {
                                            Some(path.to_string())
                                        },
                                        path_type: "ImplementationSpecific".to_string(),
                                        backend,
                                    })
                                    .collect(),
                            }),
                        })
                        .collect(),
                ),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn translator(services: Vec<Service>) -> Translator {
        let (reader, mut writer) = reflector::store::<Service>();
        for svc in services {
            writer.apply_watcher_event(&watcher::Event::Apply(svc));
        }
        Translator::new(reader, 30000)
    }

    fn services() -> Vec<Service> {
        vec![
            service("default", "foo", &[("http", 80, 30081)]),
            service("default", "bar", &[("http", 80, 30082), ("admin", 8080, 30083)]),
            service("other", "baz", &[("http", 80, 30090)]),
        ]
    }

    #[test]
    fn node_ports_by_number_and_name() {
        let t = translator(services());
        let svc = |b: IngressBackend| b.service.unwrap();
        assert_eq!(30081, t.node_port("default", &svc(backend("foo", 80))).unwrap());
        assert_eq!(30083, t.node_port("default", &svc(named_backend("bar", "admin"))).unwrap());
        assert!(matches!(
            t.node_port("default", &svc(backend("foo", 81))),
            Err(ControllerError::NodePortNotFound { .. })
        ));
        assert!(matches!(
            t.node_port("default", &svc(backend("baz", 80))),
            Err(ControllerError::NodePortNotFound { .. })
        ));
    }

    #[test]
    fn node_ports_of_all_ingresses() {
        let t = translator(services());
        let a = ingress(
            "default",
            "a",
            Some(backend("foo", 80)),
            vec![("foo.example.com", vec![("/admin", named_backend("bar", "admin"))])],
        );
        let b = ingress(
            "other",
            "b",
            None,
            vec![("", vec![("", backend("baz", 80)), ("/x", backend("missing", 80))])],
        );
        let ports = t.to_node_ports(vec![&a, &b]);
        assert_eq!(
            vec![30000, 30081, 30083, 30090],
            ports.into_iter().collect::<Vec<NodePort>>()
        );
        assert!(references_service(&a, "bar"));
        assert!(references_service(&a, "foo"));
        assert!(!references_service(&b, "foo"));
    }

    #[test]
    fn url_map_of_ingress() {
        let t = translator(services());
        let ing = ingress(
            "default",
            "a",
            Some(backend("bar", 80)),
            vec![
                (
                    "foo.example.com",
                    vec![("/foo", backend("foo", 80)), ("/gone", backend("gone", 80))],
                ),
                ("", vec![("", named_backend("bar", "admin"))]),
            ],
        );
        let links: BTreeMap<NodePort, String> = [
            (30081, "k8s-be-30081".to_string()),
            (30082, "k8s-be-30082".to_string()),
            (30083, "k8s-be-30083".to_string()),
        ]
        .into_iter()
        .collect();

        let url_map = t.to_url_map(&ing, &links).unwrap();
        assert_eq!(Some("k8s-be-30082".to_string()), url_map.default_backend);
        assert_eq!(2, url_map.hosts.len());
        let foo = &url_map.hosts["foo.example.com"];
        assert_eq!(1, foo.len());
        assert_eq!("k8s-be-30081", foo["/foo"]);
        assert_eq!("k8s-be-30083", url_map.hosts[DEFAULT_HOST][DEFAULT_PATH]);
    }

    #[test]
    fn url_map_requires_backends() {
        let t = translator(services());
        let ing = ingress(
            "default",
            "a",
            None,
            vec![("", vec![("/foo", backend("foo", 80))])],
        );
        assert!(matches!(
            t.to_url_map(&ing, &BTreeMap::new()),
            Err(ControllerError::MissingBackend(30081))
        ));
        let no_default = t
            .to_url_map(
                &ing,
                &[(30081, "k8s-be-30081".to_string())].into_iter().collect(),
            )
            .unwrap();
        assert_eq!(None, no_default.default_backend);
    }
}
