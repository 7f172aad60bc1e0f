use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid resource kind `{0}`, expected [group/]version/Kind")]
pub struct InvalidKind(pub String);

/*
 * ResourceKind identifies a resource type by group, version and kind.
 *
 * On the wire (and on the command line) it is written as
 * `group/version/Kind`, or `version/Kind` for the core group:
 *
 *   v1/Pod
 *   apps/v1/Deployment
 *   kustomize.toolkit.fluxcd.io/v1/Kustomization
 */
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ResourceKind {
    pub group: String,
    pub version: String,
    pub kind: String,
}

impl ResourceKind {

    pub fn new(group: &str, version: &str, kind: &str) -> Self {
	Self{
	    group: group.to_string(),
	    version: version.to_string(),
	    kind: kind.to_string(),
	}
    }

    pub fn api_version(&self) -> String {
	if self.group.is_empty() {
	    self.version.clone()
	} else {
	    format!("{}/{}", self.group, self.version)
	}
    }

    /*
     * Two kinds are the same type when group and kind agree, regardless of
     * the served version. Flux inventories and owner references only carry
     * group and kind.
     */
    pub fn same_type(&self, group: &str, kind: &str) -> bool {
	self.group == group && self.kind == kind
    }

    pub fn pod() -> Self { Self::new("", "v1", "Pod") }
    pub fn service() -> Self { Self::new("", "v1", "Service") }
    pub fn deployment() -> Self { Self::new("apps", "v1", "Deployment") }
    pub fn replica_set() -> Self { Self::new("apps", "v1", "ReplicaSet") }
    pub fn ingress() -> Self { Self::new("networking.k8s.io", "v1", "Ingress") }
    pub fn kustomization() -> Self { Self::new("kustomize.toolkit.fluxcd.io", "v1", "Kustomization") }
    pub fn helm_release() -> Self { Self::new("helm.toolkit.fluxcd.io", "v2", "HelmRelease") }
    pub fn git_repository() -> Self { Self::new("source.toolkit.fluxcd.io", "v1", "GitRepository") }
    pub fn oci_repository() -> Self { Self::new("source.toolkit.fluxcd.io", "v1beta2", "OCIRepository") }
    pub fn helm_repository() -> Self { Self::new("source.toolkit.fluxcd.io", "v1", "HelmRepository") }
    pub fn helm_chart() -> Self { Self::new("source.toolkit.fluxcd.io", "v1", "HelmChart") }
    pub fn bucket() -> Self { Self::new("source.toolkit.fluxcd.io", "v1", "Bucket") }
    pub fn terraform() -> Self { Self::new("infra.contrib.fluxcd.io", "v1alpha2", "Terraform") }
    pub fn carvel_app() -> Self { Self::new("kappctrl.k14s.io", "v1alpha1", "App") }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
	write!(f, "{}/{}", self.api_version(), self.kind)
    }
}

impl FromStr for ResourceKind {
    type Err = InvalidKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
	let parts: Vec<&str> = s.split('/').collect();
	let kind = match parts.as_slice() {
	    [version, kind] => Self::new("", version, kind),
	    [group, version, kind] => Self::new(group, version, kind),
	    _ => return Err(InvalidKind(s.to_string())),
	};

	if kind.version.is_empty() || kind.kind.is_empty() {
	    return Err(InvalidKind(s.to_string()));
	}
	Ok(kind)
    }
}

impl TryFrom<String> for ResourceKind {
    type Error = InvalidKind;

    fn try_from(s: String) -> Result<Self, Self::Error> {
	s.parse()
    }
}

impl From<ResourceKind> for String {
    fn from(kind: ResourceKind) -> String {
	kind.to_string()
    }
}

/*
 * The addressable key of an object inside one kind. Cluster scoped objects
 * carry an empty namespace.
 */
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: &str, name: &str) -> Self {
	Self{
	    namespace: namespace.to_string(),
	    name: name.to_string(),
	}
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
	if self.namespace.is_empty() {
	    write!(f, "{}", self.name)
	} else {
	    write!(f, "{}/{}", self.namespace, self.name)
	}
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectRef {
    pub kind: ResourceKind,
    #[serde(flatten)]
    pub key: ObjectKey,
}

impl ObjectRef {
    pub fn new(kind: ResourceKind, namespace: &str, name: &str) -> Self {
	Self{
	    kind: kind,
	    key: ObjectKey::new(namespace, name),
	}
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
	write!(f, "{} {}", self.kind, self.key)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

/*
 * A controller reported condition, as found in `.status.conditions[]`.
 */
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,

    pub status: ConditionStatus,

    #[serde(default)]
    pub reason: String,

    #[serde(default)]
    pub message: String,
}

impl Condition {
    pub fn new(type_: &str, status: ConditionStatus, reason: &str) -> Self {
	Self{
	    type_: type_.to_string(),
	    status: status,
	    reason: reason.to_string(),
	    message: String::new(),
	}
    }
}

/*
 * ResourceObject is the relay's view of one cluster object: the identity
 * and metadata needed for correlation, parsed once, plus the opaque body as
 * received from upstream.
 */
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceObject {
    pub kind: ResourceKind,

    #[serde(flatten)]
    pub key: ObjectKey,

    #[serde(default)]
    pub uid: String,

    #[serde(default)]
    pub resource_version: String,

    #[serde(default)]
    pub generation: Option<i64>,

    #[serde(default)]
    pub labels: BTreeMap<String, String>,

    #[serde(default)]
    pub owner_uids: Vec<String>,

    // set between a DELETE event and the final eviction
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub deleted: bool,

    #[serde(default)]
    pub body: Value,
}

impl ResourceObject {

    pub fn new(kind: ResourceKind, namespace: &str, name: &str) -> Self {
	Self{
	    kind: kind,
	    key: ObjectKey::new(namespace, name),
	    uid: String::new(),
	    resource_version: String::new(),
	    generation: None,
	    labels: BTreeMap::new(),
	    owner_uids: Vec::new(),
	    deleted: false,
	    body: Value::Null,
	}
    }

    /*
     * Builds an object from a raw manifest (for instance the JSON
     * serialisation of a kube DynamicObject), picking the metadata the relay
     * indexes on.
     */
    pub fn from_manifest(kind: ResourceKind, body: Value) -> Self {
	let meta = body.get("metadata");
	let text = |field: &str| -> String {
	    meta.and_then(|m| m.get(field))
		.and_then(Value::as_str)
		.unwrap_or_default()
		.to_string()
	};

	let owner_uids = meta
	    .and_then(|m| m.get("ownerReferences"))
	    .and_then(Value::as_array)
	    .map(|owners| {
		owners.iter()
		    .filter_map(|o| o.get("uid").and_then(Value::as_str))
		    .map(String::from)
		    .collect()
	    })
	    .unwrap_or_default();

	let mut obj = Self::new(kind, &text("namespace"), &text("name"));
	obj.uid = text("uid");
	obj.resource_version = text("resourceVersion");
	obj.generation = meta.and_then(|m| m.get("generation")).and_then(Value::as_i64);
	obj.labels = string_map(body.pointer("/metadata/labels"));
	obj.owner_uids = owner_uids;
	obj.body = body;
	obj
    }

    /*
     * A body-less stand-in for an object that is known only by its key,
     * used for synthetic deletes after a re-list.
     */
    pub fn tombstone(kind: ResourceKind, key: ObjectKey) -> Self {
	let mut obj = Self::new(kind, &key.namespace, &key.name);
	obj.deleted = true;
	obj
    }

    pub fn object_ref(&self) -> ObjectRef {
	ObjectRef{
	    kind: self.kind.clone(),
	    key: self.key.clone(),
	}
    }

    pub fn namespace(&self) -> &str {
	&self.key.namespace
    }

    pub fn name(&self) -> &str {
	&self.key.name
    }

    /*
     * Reads a string map (labels, selectors) at a JSON pointer inside the
     * body. Non-string values are skipped.
     */
    pub fn string_map_at(&self, pointer: &str) -> BTreeMap<String, String> {
	string_map(self.body.pointer(pointer))
    }

    pub fn bool_at(&self, pointer: &str) -> bool {
	self.body.pointer(pointer).and_then(Value::as_bool).unwrap_or(false)
    }

    /*
     * `.status.conditions[]`; malformed entries are ignored rather than
     * failing the whole object.
     */
    pub fn conditions(&self) -> Vec<Condition> {
	self.body.pointer("/status/conditions")
	    .and_then(Value::as_array)
	    .map(|conds| {
		conds.iter()
		    .filter_map(|c| serde_json::from_value(c.clone()).ok())
		    .collect()
	    })
	    .unwrap_or_default()
    }

    /*
     * Flux inventory entry ids, `.status.inventory.entries[].id`.
     */
    pub fn inventory_ids(&self) -> Vec<String> {
	self.body.pointer("/status/inventory/entries")
	    .and_then(Value::as_array)
	    .map(|entries| {
		entries.iter()
		    .filter_map(|e| e.get("id").and_then(Value::as_str))
		    .map(String::from)
		    .collect()
	    })
	    .unwrap_or_default()
    }

    /*
     * The id this object is listed under in a Flux inventory.
     */
    pub fn inventory_id(&self) -> String {
	inventory_id(&self.key.namespace, &self.key.name, &self.kind.group, &self.kind.kind)
    }

    /*
     * Service names referenced by an Ingress, from both the default backend
     * and every rule path.
     */
    pub fn backend_services(&self) -> Vec<String> {
	let mut names = Vec::new();

	if let Some(name) = self.body.pointer("/spec/defaultBackend/service/name").and_then(Value::as_str) {
	    names.push(name.to_string());
	}

	let rules = self.body.pointer("/spec/rules").and_then(Value::as_array);
	for rule in rules.into_iter().flatten() {
	    let paths = rule.pointer("/http/paths").and_then(Value::as_array);
	    for path in paths.into_iter().flatten() {
		if let Some(name) = path.pointer("/backend/service/name").and_then(Value::as_str) {
		    names.push(name.to_string());
		}
	    }
	}

	names.sort();
	names.dedup();
	names
    }
}

/*
 * Flux inventory ids are `${namespace}_${name}_${group}_${kind}`; none of
 * the four parts may contain an underscore.
 */
pub fn inventory_id(namespace: &str, name: &str, group: &str, kind: &str) -> String {
    format!("{}_{}_{}_{}", namespace, name, group, kind)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InventoryEntry {
    pub namespace: String,
    pub name: String,
    pub group: String,
    pub kind: String,
}

impl InventoryEntry {
    pub fn parse(id: &str) -> Option<Self> {
	let parts: Vec<&str> = id.splitn(4, '_').collect();
	match parts.as_slice() {
	    [namespace, name, group, kind] if !name.is_empty() && !kind.is_empty() => Some(Self{
		namespace: namespace.to_string(),
		name: name.to_string(),
		group: group.to_string(),
		kind: kind.to_string(),
	    }),
	    _ => None,
	}
    }
}

fn string_map(value: Option<&Value>) -> BTreeMap<String, String> {
    value.and_then(Value::as_object)
	.map(|map| {
	    map.iter()
		.filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
		.collect()
	})
	.unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_core_and_grouped_kinds() {
	let pod: ResourceKind = "v1/Pod".parse().unwrap();
	assert_eq!(pod, ResourceKind::pod());
	assert_eq!(pod.to_string(), "v1/Pod");

	let kustomization: ResourceKind = "kustomize.toolkit.fluxcd.io/v1/Kustomization".parse().unwrap();
	assert_eq!(kustomization, ResourceKind::kustomization());
	assert_eq!(kustomization.api_version(), "kustomize.toolkit.fluxcd.io/v1");

	assert!("Pod".parse::<ResourceKind>().is_err());
	assert!("a/b/c/d".parse::<ResourceKind>().is_err());
	assert!("v1/".parse::<ResourceKind>().is_err());
    }

    #[test]
    fn kind_serializes_as_string() {
	let json = serde_json::to_string(&ResourceKind::deployment()).unwrap();
	assert_eq!(json, "\"apps/v1/Deployment\"");

	let kind: ResourceKind = serde_json::from_str("\"v1/Service\"").unwrap();
	assert_eq!(kind, ResourceKind::service());
    }

    #[test]
    fn manifest_metadata_is_indexed() {
	let body = json!({
	    "apiVersion": "v1",
	    "kind": "Pod",
	    "metadata": {
		"name": "web-0",
		"namespace": "shop",
		"uid": "u-1",
		"resourceVersion": "42",
		"labels": {"app": "web", "tier": "front"},
		"ownerReferences": [{"uid": "rs-1", "kind": "ReplicaSet", "name": "web-abc"}]
	    },
	    "status": {
		"conditions": [
		    {"type": "Ready", "status": "True"},
		    {"type": "Broken", "status": "Maybe"}
		]
	    }
	});

	let pod = ResourceObject::from_manifest(ResourceKind::pod(), body);
	assert_eq!(pod.key, ObjectKey::new("shop", "web-0"));
	assert_eq!(pod.uid, "u-1");
	assert_eq!(pod.resource_version, "42");
	assert_eq!(pod.labels.get("app").map(String::as_str), Some("web"));
	assert_eq!(pod.owner_uids, vec!["rs-1".to_string()]);

	// the malformed condition is skipped
	let conditions = pod.conditions();
	assert_eq!(conditions.len(), 1);
	assert_eq!(conditions[0].status, ConditionStatus::True);
    }

    #[test]
    fn inventory_ids_round_trip_through_entries() {
	let svc = ResourceObject::new(ResourceKind::service(), "shop", "web");
	assert_eq!(svc.inventory_id(), "shop_web__Service");

	let entry = InventoryEntry::parse("shop_web_apps_Deployment").unwrap();
	assert_eq!(entry.namespace, "shop");
	assert_eq!(entry.group, "apps");
	assert_eq!(entry.kind, "Deployment");

	let cluster_scoped = InventoryEntry::parse("_flux-system__Namespace").unwrap();
	assert_eq!(cluster_scoped.namespace, "");
	assert_eq!(cluster_scoped.name, "flux-system");

	assert!(InventoryEntry::parse("garbage").is_none());
    }

    #[test]
    fn ingress_backends_are_collected() {
	let mut ing = ResourceObject::new(ResourceKind::ingress(), "shop", "edge");
	ing.body = json!({
	    "spec": {
		"defaultBackend": {"service": {"name": "fallback"}},
		"rules": [
		    {"http": {"paths": [
			{"backend": {"service": {"name": "web"}}},
			{"backend": {"service": {"name": "api"}}}
		    ]}},
		    {"http": {"paths": [{"backend": {"service": {"name": "web"}}}]}}
		]
	    }
	});

	assert_eq!(ing.backend_services(), vec!["api", "fallback", "web"]);
    }
}
