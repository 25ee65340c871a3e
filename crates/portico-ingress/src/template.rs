//! Ingress template
//!
//! The derived Ingress is fully determined by its Service: same name and
//! namespace, a controller reference back to the Service, and a single rule
//! routing `host` + `path` to the Service itself.

use std::collections::BTreeMap;

use portico_common::{
    BackendPort, DerivedObject, DerivedSpec, IngressBackend, IngressPath, IngressRule,
    OwnerReference, PathType, SourceObject, LABEL_MANAGED_BY, LABEL_MANAGED_BY_PORTICO,
};

/// Default trigger annotation; its presence (any value) requests an Ingress
pub const DEFAULT_ANNOTATION: &str = "ingress/http";

/// Shape of the generated Ingress
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngressTemplate {
    /// IngressClass name
    pub ingress_class: String,
    /// Host of the single rule
    pub host: String,
    /// HTTP path of the single rule
    pub path: String,
    /// Path match semantics
    pub path_type: PathType,
    /// Service port the backend targets
    pub service_port: i32,
}

impl Default for IngressTemplate {
    fn default() -> Self {
        Self {
            ingress_class: "nginx".to_string(),
            host: "example.com".to_string(),
            path: "/".to_string(),
            path_type: PathType::Prefix,
            service_port: 80,
        }
    }
}

impl IngressTemplate {
    /// Build the derived object for `source`
    pub fn build(&self, source: &SourceObject) -> DerivedObject {
        DerivedObject {
            name: source.name.clone(),
            namespace: source.namespace.clone(),
            owner: Some(OwnerReference::controller_for(source)),
            labels: BTreeMap::from([(
                LABEL_MANAGED_BY.to_string(),
                LABEL_MANAGED_BY_PORTICO.to_string(),
            )]),
            resource_version: 0,
            spec: DerivedSpec {
                ingress_class: Some(self.ingress_class.clone()),
                rules: vec![IngressRule {
                    host: Some(self.host.clone()),
                    paths: vec![IngressPath {
                        path: self.path.clone(),
                        path_type: self.path_type,
                        backend: IngressBackend {
                            service_name: source.name.clone(),
                            port: BackendPort::Number(self.service_port),
                        },
                    }],
                }],
            },
        }
    }
}
