use crate::resource::ObjectRef;
use crate::status::StatusLabelSet;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewMember {
    #[serde(rename = "ref")]
    pub object: ObjectRef,
    pub labels: StatusLabelSet,
}

/*
 * CompositeView joins a root object with the objects related to it, one
 * member list per relation (e.g. a Service view has `pods`, `deployments`,
 * `ingresses` and `syncObjects`).
 *
 * Member lists are sorted by reference, so two views computed over the same
 * cache contents compare equal no matter in which order objects arrived.
 */
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompositeView {
    pub root: ObjectRef,
    pub labels: StatusLabelSet,
    pub relations: BTreeMap<String, Vec<ViewMember>>,
}

impl CompositeView {

    pub fn new(root: ObjectRef, labels: StatusLabelSet) -> Self {
	Self{
	    root: root,
	    labels: labels,
	    relations: BTreeMap::new(),
	}
    }

    pub fn members(&self, relation: &str) -> &[ViewMember] {
	self.relations.get(relation).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn member_refs(&self, relation: &str) -> Vec<&ObjectRef> {
	self.members(relation).iter().map(|m| &m.object).collect()
    }
}
