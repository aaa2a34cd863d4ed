use kube::{Resource, ResourceExt};

use crate::errors::ControllerError;

/// The `namespace/name` key of a namespaced object, or just its name.
pub(crate) fn object_key<K: Resource>(obj: &K) -> String {
    match obj.namespace() {
        Some(ns) if !ns.is_empty() => format!("{}/{}", ns, obj.name_any()),
        _ => obj.name_any(),
    }
}

/// Splits a `namespace/name` key.
pub(crate) fn split_key(key: &str) -> Result<(&str, &str), ControllerError> {
    match key.split_once('/') {
        Some((ns, name)) if !ns.is_empty() && !name.is_empty() && !name.contains('/') => {
            Ok((ns, name))
        }
        _ => Err(ControllerError::Invalid(format!(
            "expected key of the form namespace/name, got {:?}",
            key
        ))),
    }
}

pub(crate) fn metric_name(name: &str) -> String {
    format!("glbc_{}", name)
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::networking::v1::Ingress;
    use kube::api::ObjectMeta;

    use super::*;

    #[test]
    fn keys() {
        let ing = Ingress {
            metadata: ObjectMeta {
                name: Some("foo".to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        assert_eq!("default/foo", object_key(&ing));
        assert_eq!(("default", "foo"), split_key("default/foo").unwrap());
        assert!(split_key("foo").is_err());
        assert!(split_key("a/b/c").is_err());
        assert!(split_key("/foo").is_err());
    }
}
