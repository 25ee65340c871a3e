//! Typed object model
//!
//! [`SourceObject`] mirrors the annotated Service; [`DerivedObject`] mirrors
//! the Ingress produced from it. Both are plain values decoupled from the
//! Kubernetes API types so the cache, router and engine can be exercised
//! without a cluster. Conversions to and from `k8s-openapi` types live in
//! `portico-ingress`.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ObjectReference;
use serde::{Deserialize, Serialize};

use crate::ResourceKey;

/// The two kinds of object the controller deals with
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ObjectKind {
    /// The watched resource carrying the intent (a Service)
    Source,
    /// The resource generated from a source (an Ingress)
    Derived,
}

impl ObjectKind {
    /// API kind of the source resource
    pub const SOURCE_KIND: &'static str = "Service";
    /// API version of the source resource
    pub const SOURCE_API_VERSION: &'static str = "v1";
    /// API kind of the derived resource
    pub const DERIVED_KIND: &'static str = "Ingress";
    /// API version of the derived resource
    pub const DERIVED_API_VERSION: &'static str = "networking.k8s.io/v1";

    /// Kubernetes kind name
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectKind::Source => Self::SOURCE_KIND,
            ObjectKind::Derived => Self::DERIVED_KIND,
        }
    }

    /// Kubernetes apiVersion
    pub fn api_version(&self) -> &'static str {
        match self {
            ObjectKind::Source => Self::SOURCE_API_VERSION,
            ObjectKind::Derived => Self::DERIVED_API_VERSION,
        }
    }
}

impl std::fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Non-owning back-reference from a derived object to its source
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnerReference {
    /// apiVersion of the owner
    pub api_version: String,
    /// Kind of the owner
    pub kind: String,
    /// Name of the owner (same namespace as the dependent)
    pub name: String,
    /// UID of the owner
    pub uid: String,
    /// Whether the owner is the managing controller
    pub controller: bool,
}

impl OwnerReference {
    /// Controller reference pointing at the given source
    pub fn controller_for(source: &SourceObject) -> Self {
        Self {
            api_version: ObjectKind::SOURCE_API_VERSION.to_string(),
            kind: ObjectKind::SOURCE_KIND.to_string(),
            name: source.name.clone(),
            uid: source.uid.clone().unwrap_or_default(),
            controller: true,
        }
    }
}

/// Read-only mirror of a source object
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceObject {
    /// Object name
    pub name: String,
    /// Object namespace (empty when cluster-scoped)
    pub namespace: String,
    /// Server-assigned UID
    pub uid: Option<String>,
    /// Annotations
    pub annotations: BTreeMap<String, String>,
    /// Labels
    pub labels: BTreeMap<String, String>,
    /// Monotonic resource version (0 when unknown)
    pub resource_version: u64,
}

impl SourceObject {
    /// Whether the given annotation key is present, regardless of value
    pub fn has_annotation(&self, key: &str) -> bool {
        self.annotations.contains_key(key)
    }
}

/// How an Ingress path is matched
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PathType {
    /// Match on path prefix split by `/`
    #[default]
    Prefix,
    /// Match the path exactly
    Exact,
    /// Matching is up to the IngressClass
    ImplementationSpecific,
}

impl PathType {
    /// Wire name as used by networking/v1
    pub fn as_str(&self) -> &'static str {
        match self {
            PathType::Prefix => "Prefix",
            PathType::Exact => "Exact",
            PathType::ImplementationSpecific => "ImplementationSpecific",
        }
    }

    /// Parse a wire name; unknown values yield `None`
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "Prefix" => Some(PathType::Prefix),
            "Exact" => Some(PathType::Exact),
            "ImplementationSpecific" => Some(PathType::ImplementationSpecific),
            _ => None,
        }
    }
}

/// Service port a backend targets
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackendPort {
    /// Numeric port
    Number(i32),
    /// Named port
    Name(String),
}

/// Backend service of an Ingress path
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngressBackend {
    /// Backend Service name
    pub service_name: String,
    /// Backend Service port
    pub port: BackendPort,
}

/// One HTTP path of an Ingress rule
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngressPath {
    /// URL path
    pub path: String,
    /// Match semantics
    pub path_type: PathType,
    /// Target backend
    pub backend: IngressBackend,
}

/// One host rule of an Ingress
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngressRule {
    /// Host to match; `None` matches all hosts
    pub host: Option<String>,
    /// HTTP paths
    pub paths: Vec<IngressPath>,
}

/// Spec of a derived object, fully determined by its source
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DerivedSpec {
    /// IngressClass name
    pub ingress_class: Option<String>,
    /// Routing rules
    pub rules: Vec<IngressRule>,
}

/// Mirror of a derived object
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DerivedObject {
    /// Object name
    pub name: String,
    /// Object namespace
    pub namespace: String,
    /// Controller owner reference, if any
    pub owner: Option<OwnerReference>,
    /// Labels
    pub labels: BTreeMap<String, String>,
    /// Monotonic resource version (0 when unknown or not yet persisted)
    pub resource_version: u64,
    /// Desired routing
    pub spec: DerivedSpec,
}

/// Uniform access to the identity of a cached object
pub trait WatchedObject: Clone + PartialEq + Send + Sync + 'static {
    /// Which kind this object type is
    const KIND: ObjectKind;

    /// Object name
    fn name(&self) -> &str;

    /// Object namespace
    fn namespace(&self) -> &str;

    /// Resource version (0 when unknown)
    fn resource_version(&self) -> u64;

    /// Controller owner reference, if the kind carries one
    fn owner(&self) -> Option<&OwnerReference>;

    /// Queue / cache key for this object
    fn key(&self) -> ResourceKey {
        ResourceKey::new(self.namespace(), self.name())
    }

    /// Kubernetes object reference, used as the subject of Events
    fn object_ref(&self) -> ObjectReference {
        let namespace = self.namespace();
        ObjectReference {
            api_version: Some(Self::KIND.api_version().to_string()),
            kind: Some(Self::KIND.as_str().to_string()),
            name: Some(self.name().to_string()),
            namespace: (!namespace.is_empty()).then(|| namespace.to_string()),
            ..Default::default()
        }
    }
}

impl WatchedObject for SourceObject {
    const KIND: ObjectKind = ObjectKind::Source;

    fn name(&self) -> &str {
        &self.name
    }

    fn namespace(&self) -> &str {
        &self.namespace
    }

    fn resource_version(&self) -> u64 {
        self.resource_version
    }

    fn owner(&self) -> Option<&OwnerReference> {
        None
    }

    fn object_ref(&self) -> ObjectReference {
        let namespace = self.namespace();
        ObjectReference {
            api_version: Some(ObjectKind::SOURCE_API_VERSION.to_string()),
            kind: Some(ObjectKind::SOURCE_KIND.to_string()),
            name: Some(self.name.clone()),
            namespace: (!namespace.is_empty()).then(|| namespace.to_string()),
            uid: self.uid.clone(),
            ..Default::default()
        }
    }
}

impl WatchedObject for DerivedObject {
    const KIND: ObjectKind = ObjectKind::Derived;

    fn name(&self) -> &str {
        &self.name
    }

    fn namespace(&self) -> &str {
        &self.namespace
    }

    fn resource_version(&self) -> u64 {
        self.resource_version
    }

    fn owner(&self) -> Option<&OwnerReference> {
        self.owner.as_ref()
    }
}
