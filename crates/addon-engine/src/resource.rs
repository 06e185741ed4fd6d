//! Resource identities, ownership labels and manifest parsing.
//!
//! Every object the engine touches is addressed by a [`ResourceIdentity`] and
//! carried around as a [`DynamicObject`], so no operation needs compile-time
//! knowledge of the kinds it deploys.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::DynamicObject;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Label naming the kind of the source object that caused a resource to exist.
pub const REFERENCE_KIND_LABEL: &str = "addons.cto.dev/reference-kind";
/// Label naming the source object.
pub const REFERENCE_NAME_LABEL: &str = "addons.cto.dev/reference-name";
/// Label naming the source object's namespace.
pub const REFERENCE_NAMESPACE_LABEL: &str = "addons.cto.dev/reference-namespace";

/// A (group, version, kind) triple.
///
/// The string form is `Kind.version.group`, or `Kind.version` for the core
/// group, e.g. `ClusterRole.v1.rbac.authorization.k8s.io`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct ResourceKind {
    pub group: String,
    pub version: String,
    pub kind: String,
}

impl ResourceKind {
    pub fn new(group: impl Into<String>, version: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            version: version.into(),
            kind: kind.into(),
        }
    }

    /// Build from an `apiVersion` string and a kind.
    #[must_use]
    pub fn from_api_version(api_version: &str, kind: &str) -> Self {
        let (group, version) = parse_api_version(api_version);
        Self::new(group, version, kind)
    }

    #[must_use]
    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }

    #[must_use]
    pub fn to_gvk(&self) -> kube::core::GroupVersionKind {
        kube::core::GroupVersionKind::gvk(&self.group, &self.version, &self.kind)
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.group.is_empty() {
            write!(f, "{}.{}", self.kind, self.version)
        } else {
            write!(f, "{}.{}.{}", self.kind, self.version, self.group)
        }
    }
}

impl FromStr for ResourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(3, '.');
        let kind = parts.next().unwrap_or_default();
        let version = parts.next().unwrap_or_default();
        let group = parts.next().unwrap_or_default();
        if kind.is_empty() || version.is_empty() {
            return Err(format!("invalid resource kind {s:?}, expected Kind.version[.group]"));
        }
        Ok(Self::new(group, version, kind))
    }
}

impl From<ResourceKind> for String {
    fn from(kind: ResourceKind) -> Self {
        kind.to_string()
    }
}

impl TryFrom<String> for ResourceKind {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Canonical key for a deployed object, independent of its content.
///
/// `namespace` is empty for cluster-scoped kinds.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ResourceIdentity {
    pub group: String,
    pub version: String,
    pub kind: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    pub name: String,
}

impl ResourceIdentity {
    pub fn new(kind: &ResourceKind, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            group: kind.group.clone(),
            version: kind.version.clone(),
            kind: kind.kind.clone(),
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    #[must_use]
    pub fn resource_kind(&self) -> ResourceKind {
        ResourceKind::new(&self.group, &self.version, &self.kind)
    }

    /// Identity of a live object, trusting its own type and metadata.
    #[must_use]
    pub fn of(object: &DynamicObject) -> Option<Self> {
        let types = object.types.as_ref()?;
        let kind = ResourceKind::from_api_version(&types.api_version, &types.kind);
        let name = object.metadata.name.clone()?;
        Some(Self::new(
            &kind,
            object.metadata.namespace.clone().unwrap_or_default(),
            name,
        ))
    }

    /// Identity of an object returned by listing `kind`. List items from the
    /// API server usually omit `apiVersion` and `kind`, so the listed kind
    /// is authoritative.
    #[must_use]
    pub fn listed(kind: &ResourceKind, object: &DynamicObject) -> Option<Self> {
        let name = object.metadata.name.clone().filter(|n| !n.is_empty())?;
        Some(Self::new(
            kind,
            object.metadata.namespace.clone().unwrap_or_default(),
            name,
        ))
    }
}

impl fmt::Display for ResourceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}:{}", self.group, self.kind, self.namespace, self.name)
    }
}

/// The (kind, name, namespace) marker naming the source object that caused a
/// resource to exist.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OwnershipLabels {
    pub kind: String,
    pub name: String,
    pub namespace: String,
}

impl OwnershipLabels {
    pub fn new(kind: impl Into<String>, name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            name: name.into(),
            namespace: namespace.into(),
        }
    }

    /// Read the triple back from a label map. All three labels must be present.
    #[must_use]
    pub fn from_labels(labels: Option<&BTreeMap<String, String>>) -> Option<Self> {
        let labels = labels?;
        Some(Self {
            kind: labels.get(REFERENCE_KIND_LABEL)?.clone(),
            name: labels.get(REFERENCE_NAME_LABEL)?.clone(),
            namespace: labels.get(REFERENCE_NAMESPACE_LABEL)?.clone(),
        })
    }

    #[must_use]
    pub fn of(object: &DynamicObject) -> Option<Self> {
        Self::from_labels(object.metadata.labels.as_ref())
    }

    /// The three labels, as a selector map.
    #[must_use]
    pub fn selector(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            (REFERENCE_KIND_LABEL.to_string(), self.kind.clone()),
            (REFERENCE_NAME_LABEL.to_string(), self.name.clone()),
            (REFERENCE_NAMESPACE_LABEL.to_string(), self.namespace.clone()),
        ])
    }

    /// Stamp the triple on an object, keeping any labels it already has.
    pub fn stamp(&self, object: &mut DynamicObject) {
        object
            .metadata
            .labels
            .get_or_insert_with(BTreeMap::new)
            .extend(self.selector());
    }
}

impl fmt::Display for OwnershipLabels {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}/{}", self.kind, self.namespace, self.name)
    }
}

/// Add an owner reference unless one for the same owner is already present.
pub fn add_owner_reference(object: &mut DynamicObject, owner: &OwnerReference) {
    let refs = object.metadata.owner_references.get_or_insert_with(Vec::new);
    let present = refs.iter().any(|r| {
        (!owner.uid.is_empty() && r.uid == owner.uid)
            || (r.kind == owner.kind && r.name == owner.name && r.api_version == owner.api_version)
    });
    if !present {
        refs.push(owner.clone());
    }
}

/// Clear fields the API server owns so desired state can be compared and written.
pub fn strip_server_fields(object: &mut DynamicObject) {
    let meta = &mut object.metadata;
    meta.resource_version = None;
    meta.uid = None;
    meta.creation_timestamp = None;
    meta.deletion_timestamp = None;
    meta.deletion_grace_period_seconds = None;
    meta.generation = None;
    meta.managed_fields = None;
    meta.self_link = None;
    if let Value::Object(data) = &mut object.data {
        data.remove("status");
    }
}

/// Split a manifest bundle on `---` separator lines, dropping empty documents.
#[must_use]
pub fn split_documents(text: &str) -> Vec<String> {
    let mut documents = Vec::new();
    let mut current = String::new();
    for line in text.lines() {
        if is_separator(line) {
            push_document(&mut documents, &mut current);
        } else {
            current.push_str(line);
            current.push('\n');
        }
    }
    push_document(&mut documents, &mut current);
    documents
}

fn is_separator(line: &str) -> bool {
    line.strip_prefix("---")
        .is_some_and(|rest| rest.trim().is_empty() || rest.trim_start().starts_with('#'))
}

fn push_document(documents: &mut Vec<String>, current: &mut String) {
    let doc = std::mem::take(current);
    if !is_blank_document(&doc) {
        documents.push(doc);
    }
}

/// A document holding nothing but whitespace and comments.
#[must_use]
pub fn is_blank_document(doc: &str) -> bool {
    doc.lines()
        .map(str::trim)
        .all(|line| line.is_empty() || line.starts_with('#'))
}

/// Parse one document into objects. `v1/List`-style documents expand to
/// their items, in order.
///
/// # Errors
///
/// Returns a message when the document is not YAML/JSON, is not a mapping,
/// or lacks `apiVersion`, `kind` or `metadata.name`.
pub fn parse_document(doc: &str) -> Result<Vec<DynamicObject>, String> {
    let value: Value = serde_yaml::from_str(doc).map_err(|e| e.to_string())?;
    if !value.is_object() {
        return Err("document is not a mapping".to_string());
    }

    let kind = value.get("kind").and_then(Value::as_str).unwrap_or_default();
    if kind.ends_with("List") {
        if let Some(items) = value.get("items").and_then(Value::as_array) {
            return items.iter().cloned().map(to_dynamic_object).collect();
        }
    }
    to_dynamic_object(value).map(|object| vec![object])
}

fn to_dynamic_object(value: Value) -> Result<DynamicObject, String> {
    for field in ["apiVersion", "kind"] {
        if value.get(field).and_then(Value::as_str).map_or(true, str::is_empty) {
            return Err(format!("missing {field}"));
        }
    }
    let object: DynamicObject = serde_json::from_value(value).map_err(|e| e.to_string())?;
    if object.metadata.name.as_deref().map_or(true, str::is_empty) {
        return Err("missing metadata.name".to_string());
    }
    Ok(object)
}

/// Split an `apiVersion` into (group, version). Core resources have an empty group.
#[must_use]
pub fn parse_api_version(api_version: &str) -> (&str, &str) {
    match api_version.rsplit_once('/') {
        Some((group, version)) => (group, version),
        None => ("", api_version),
    }
}
