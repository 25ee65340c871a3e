//! Conversions between Kubernetes API types and the Portico object model

use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::networking::v1 as networking;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference as K8sOwnerRef};
use portico_common::{
    BackendPort, DerivedObject, DerivedSpec, Error, IngressBackend, IngressPath, IngressRule,
    ObjectKind, OwnerReference, PathType, SourceObject,
};
use tracing::trace;

fn resource_version(meta: &ObjectMeta) -> u64 {
    meta.resource_version
        .as_deref()
        .and_then(|rv| rv.parse().ok())
        .unwrap_or(0)
}

fn required_name(meta: &ObjectMeta, kind: ObjectKind) -> Result<String, Error> {
    meta.name
        .clone()
        .filter(|n| !n.is_empty())
        .ok_or_else(|| Error::conversion(kind.as_str(), "metadata.name is missing"))
}

/// Mirror a Service as a source object
pub fn source_from_service(svc: &Service) -> Result<SourceObject, Error> {
    let meta = &svc.metadata;
    Ok(SourceObject {
        name: required_name(meta, ObjectKind::Source)?,
        namespace: meta.namespace.clone().unwrap_or_default(),
        uid: meta.uid.clone(),
        annotations: meta.annotations.clone().unwrap_or_default(),
        labels: meta.labels.clone().unwrap_or_default(),
        resource_version: resource_version(meta),
    })
}

/// Mirror an Ingress as a derived object
///
/// Paths whose backend is not a Service are dropped from the mirror.
pub fn derived_from_ingress(ing: &networking::Ingress) -> Result<DerivedObject, Error> {
    let meta = &ing.metadata;
    let spec = ing.spec.as_ref();

    let rules = spec
        .and_then(|s| s.rules.as_ref())
        .map(|rules| rules.iter().map(rule_from_k8s).collect())
        .unwrap_or_default();

    Ok(DerivedObject {
        name: required_name(meta, ObjectKind::Derived)?,
        namespace: meta.namespace.clone().unwrap_or_default(),
        owner: controller_of(meta),
        labels: meta.labels.clone().unwrap_or_default(),
        resource_version: resource_version(meta),
        spec: DerivedSpec {
            ingress_class: spec.and_then(|s| s.ingress_class_name.clone()),
            rules,
        },
    })
}

/// The owner reference flagged `controller: true`, if any
fn controller_of(meta: &ObjectMeta) -> Option<OwnerReference> {
    meta.owner_references
        .as_ref()?
        .iter()
        .find(|r| r.controller == Some(true))
        .map(|r| OwnerReference {
            api_version: r.api_version.clone(),
            kind: r.kind.clone(),
            name: r.name.clone(),
            uid: r.uid.clone(),
            controller: true,
        })
}

fn rule_from_k8s(rule: &networking::IngressRule) -> IngressRule {
    let paths = rule
        .http
        .as_ref()
        .map(|http| http.paths.iter().filter_map(path_from_k8s).collect())
        .unwrap_or_default();
    IngressRule {
        host: rule.host.clone(),
        paths,
    }
}

fn path_from_k8s(path: &networking::HTTPIngressPath) -> Option<IngressPath> {
    let Some(service) = path.backend.service.as_ref() else {
        trace!(path = ?path.path, "Skipping non-service backend");
        return None;
    };
    let port = match service.port.as_ref() {
        Some(networking::ServiceBackendPort {
            number: Some(n), ..
        }) => BackendPort::Number(*n),
        Some(networking::ServiceBackendPort { name: Some(n), .. }) => BackendPort::Name(n.clone()),
        _ => BackendPort::Number(0),
    };
    Some(IngressPath {
        path: path.path.clone().unwrap_or_default(),
        path_type: PathType::parse(&path.path_type).unwrap_or(PathType::ImplementationSpecific),
        backend: IngressBackend {
            service_name: service.name.clone(),
            port,
        },
    })
}

/// Render a derived object as an Ingress ready to be created
pub fn ingress_from_derived(obj: &DerivedObject) -> networking::Ingress {
    let owner_references = obj.owner.as_ref().map(|o| {
        vec![K8sOwnerRef {
            api_version: o.api_version.clone(),
            kind: o.kind.clone(),
            name: o.name.clone(),
            uid: o.uid.clone(),
            controller: Some(o.controller),
            block_owner_deletion: Some(true),
        }]
    });

    let rules = obj
        .spec
        .rules
        .iter()
        .map(|rule| networking::IngressRule {
            host: rule.host.clone(),
            http: Some(networking::HTTPIngressRuleValue {
                paths: rule.paths.iter().map(path_to_k8s).collect(),
            }),
        })
        .collect();

    networking::Ingress {
        metadata: ObjectMeta {
            name: Some(obj.name.clone()),
            namespace: (!obj.namespace.is_empty()).then(|| obj.namespace.clone()),
            labels: (!obj.labels.is_empty()).then(|| obj.labels.clone()),
            owner_references,
            ..Default::default()
        },
        spec: Some(networking::IngressSpec {
            ingress_class_name: obj.spec.ingress_class.clone(),
            rules: Some(rules),
            ..Default::default()
        }),
        status: None,
    }
}

fn path_to_k8s(path: &IngressPath) -> networking::HTTPIngressPath {
    let port = match &path.backend.port {
        BackendPort::Number(n) => networking::ServiceBackendPort {
            number: Some(*n),
            name: None,
        },
        BackendPort::Name(n) => networking::ServiceBackendPort {
            number: None,
            name: Some(n.clone()),
        },
    };
    networking::HTTPIngressPath {
        path: Some(path.path.clone()),
        path_type: path.path_type.as_str().to_string(),
        backend: networking::IngressBackend {
            service: Some(networking::IngressServiceBackend {
                name: path.backend.service_name.clone(),
                port: Some(port),
            }),
            resource: None,
        },
    }
}
