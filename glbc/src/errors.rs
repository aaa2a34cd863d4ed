use glbc_apis::NodePort;

/// Extension methods for Kubernetes API errors.
pub(crate) trait ExtKubeApiError {
    fn is_not_found(&self) -> bool;
    fn is_conflict(&self) -> bool;
}

impl ExtKubeApiError for kube::Error {
    fn is_not_found(&self) -> bool {
        match self {
            kube::Error::Api(e) if e.code == 404 || e.code == 410 => true,
            _ => false,
        }
    }

    fn is_conflict(&self) -> bool {
        match self {
            kube::Error::Api(e) if e.code == 409 => true,
            _ => false,
        }
    }
}

/// Errors returned by the cloud capability traits.
#[derive(thiserror::Error, Debug)]
pub(crate) enum CloudError {
    /// The named resource does not exist.
    #[error("{kind} {name} not found")]
    NotFound { kind: &'static str, name: String },
    /// The compute API answered with a non-success status.
    #[error("compute API error {code}: {message}")]
    Api { code: u16, message: String },
    /// A long running operation finished with errors.
    #[error("operation {name} failed: {message}")]
    Operation { name: String, message: String },
    /// Transport errors
    #[error("{0}")]
    Http(#[from] reqwest::Error),
    /// Serialization errors
    #[error("{0}")]
    Serde(#[from] serde_json::Error),
    /// Any other kind of errors, e.g. failures talking to the metadata server.
    #[error("{0}")]
    Any(#[from] anyhow::Error),
}

impl CloudError {
    pub(crate) fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        CloudError::NotFound {
            kind,
            name: name.into(),
        }
    }

    pub(crate) fn is_not_found(&self) -> bool {
        match self {
            CloudError::NotFound { .. } => true,
            CloudError::Api { code, .. } if *code == 404 => true,
            _ => false,
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub(crate) enum ControllerError {
    /// Cloud API error
    #[error("{0}")]
    Cloud(#[from] CloudError),
    /// Kubernetes API error
    #[error("{0}")]
    KubeApi(#[from] kube::Error),
    /// An Ingress backend references a Service (or Service port) without a
    /// node port. Traffic to other backends can still be forwarded.
    #[error("could not find nodeport for backend {service}:{port} in namespace {namespace}: {reason}")]
    NodePortNotFound {
        namespace: String,
        service: String,
        port: String,
        reason: String,
    },
    /// A node port is required by an Ingress but its backend service does not
    /// exist (yet). Requeued until it does.
    #[error("no backend service exists for node port {0}")]
    MissingBackend(NodePort),
    /// The load balancer pool has no entry for the given name.
    #[error("load balancer {0} not in pool")]
    LoadBalancerNotFound(String),
    /// Keys and configuration that cannot be parsed.
    #[error("{0}")]
    Invalid(String),
    /// Several independent steps failed, e.g. reconciliation and GC.
    #[error("{}", join_errors(.0))]
    Multiple(Vec<ControllerError>),
    /// Serialization errors
    #[error("{0}")]
    Serde(#[from] serde_json::Error),
    /// Any other kind of errors
    #[error("{0}")]
    Any(#[from] anyhow::Error),
}

fn join_errors(errors: &[ControllerError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<String>>()
        .join("; ")
}

impl ControllerError {
    /// Combines independent results into one, keeping every error.
    pub(crate) fn combine(
        results: impl IntoIterator<Item = Result<(), ControllerError>>,
    ) -> Result<(), ControllerError> {
        let mut errors: Vec<ControllerError> = results.into_iter().filter_map(Result::err).collect();
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(ControllerError::Multiple(errors)),
        }
    }

    pub(crate) fn is_not_found(&self) -> bool {
        match self {
            ControllerError::Cloud(e) => e.is_not_found(),
            ControllerError::KubeApi(e) => e.is_not_found(),
            ControllerError::LoadBalancerNotFound(_) => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn combine_keeps_every_error() {
        assert!(ControllerError::combine(vec![Ok(()), Ok(())]).is_ok());

        let single = ControllerError::combine(vec![Ok(()), Err(ControllerError::MissingBackend(80))]);
        assert!(matches!(single, Err(ControllerError::MissingBackend(80))));

        let both = ControllerError::combine(vec![
            Err(ControllerError::Invalid("lb gc".to_string())),
            Err(ControllerError::Invalid("backend gc".to_string())),
        ]);
        match both {
            Err(ControllerError::Multiple(errors)) => assert_eq!(2, errors.len()),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn not_found() {
        assert!(CloudError::not_found("BackendService", "k8s-be-80").is_not_found());
        assert!(
            CloudError::Api {
                code: 404,
                message: "gone".to_string()
            }
            .is_not_found()
        );
        assert!(
            !CloudError::Api {
                code: 403,
                message: "quota".to_string()
            }
            .is_not_found()
        );
        assert!(ControllerError::from(CloudError::not_found("UrlMap", "um")).is_not_found());
    }
}
