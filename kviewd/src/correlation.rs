use crate::cache::{Applied, ResourceCache};
use crate::rollup::Classifier;
use kview_api::{CompositeView, InventoryEntry, ObjectRef, ResourceKind, ResourceObject, SubscriptionFilter, ViewMember};

use log;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

/*
 * Where the labels of a join target are read from.
 */
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum LabelSource {
    /* metadata.labels */
    Metadata,
    /* spec.template.metadata.labels */
    PodTemplate,
}

impl LabelSource {
    fn labels(&self, obj: &ResourceObject) -> BTreeMap<String, String> {
	match self {
	    LabelSource::Metadata => obj.labels.clone(),
	    LabelSource::PodTemplate => obj.string_map_at("/spec/template/metadata/labels"),
	}
    }
}

/*
 * Where the selector of a join source is read from.
 */
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum SelectorSource {
    /* spec.selector as a plain map (Service) */
    Map,
    /* spec.selector.matchLabels (Deployment, ReplicaSet, ...) */
    MatchLabels,
}

impl SelectorSource {
    fn selector(&self, obj: &ResourceObject) -> BTreeMap<String, String> {
	match self {
	    SelectorSource::Map => obj.string_map_at("/spec/selector"),
	    SelectorSource::MatchLabels => obj.string_map_at("/spec/selector/matchLabels"),
	}
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Matcher {
    /* target labels contain every pair of the source selector */
    LabelSelector {
	selector: SelectorSource,
	labels: LabelSource,
    },

    /* target has an owner reference to the source uid */
    OwnerReference,

    /* target's Flux inventory lists the source */
    InventoryListedBy,

    /* source's Flux inventory lists the target */
    InventoryLists,

    /* target (an Ingress) routes to the source Service by name */
    ServiceBackend,
}

/*
 * One declarative join: every `source` object gets a `relation` member
 * list made of the `target` objects accepted by `matcher`.
 */
#[derive(Debug, Clone)]
pub struct JoinRule {
    pub relation: String,
    pub source: ResourceKind,
    pub target: ResourceKind,
    pub matcher: Matcher,
}

impl JoinRule {

    pub fn new(relation: &str, source: ResourceKind, target: ResourceKind, matcher: Matcher) -> Self {
	Self{
	    relation: relation.to_string(),
	    source: source,
	    target: target,
	    matcher: matcher,
	}
    }

    /*
     * Inventory joins cross namespaces: a Kustomization in flux-system
     * manages objects everywhere.
     */
    pub fn cross_namespace(&self) -> bool {
	matches!(self.matcher, Matcher::InventoryListedBy | Matcher::InventoryLists)
    }

    /*
     * Exact match test between a source and a candidate target.
     */
    pub fn matches(&self, source: &ResourceObject, target: &ResourceObject) -> bool {
	if target.kind != self.target || source.kind != self.source {
	    return false;
	}

	match &self.matcher {
	    Matcher::LabelSelector { selector, labels } => {
		if source.namespace() != target.namespace() {
		    return false;
		}
		let selector = selector.selector(source);
		contains_all(&labels.labels(target), &selector)
	    },
	    Matcher::OwnerReference => {
		!source.uid.is_empty() && target.owner_uids.iter().any(|uid| uid == &source.uid)
	    },
	    Matcher::InventoryListedBy => {
		let id = source.inventory_id();
		target.inventory_ids().iter().any(|entry| entry == &id)
	    },
	    Matcher::InventoryLists => {
		let id = target.inventory_id();
		source.inventory_ids().iter().any(|entry| entry == &id)
	    },
	    Matcher::ServiceBackend => {
		source.namespace() == target.namespace()
		    && target.backend_services().iter().any(|name| name == source.name())
	    },
	}
    }
}

/*
 * An empty selector selects nothing.
 */
fn contains_all(labels: &BTreeMap<String, String>, selector: &BTreeMap<String, String>) -> bool {
    !selector.is_empty() && selector.iter().all(|(k, v)| labels.get(k) == Some(v))
}

pub fn default_rules() -> Vec<JoinRule> {
    let service_selector = Matcher::LabelSelector{
	selector: SelectorSource::Map,
	labels: LabelSource::Metadata,
    };
    let service_to_template = Matcher::LabelSelector{
	selector: SelectorSource::Map,
	labels: LabelSource::PodTemplate,
    };
    let match_labels = Matcher::LabelSelector{
	selector: SelectorSource::MatchLabels,
	labels: LabelSource::Metadata,
    };

    vec![
	JoinRule::new("pods", ResourceKind::service(), ResourceKind::pod(), service_selector),
	JoinRule::new("deployments", ResourceKind::service(), ResourceKind::deployment(), service_to_template),
	JoinRule::new("ingresses", ResourceKind::service(), ResourceKind::ingress(), Matcher::ServiceBackend),
	JoinRule::new("syncObjects", ResourceKind::service(), ResourceKind::kustomization(), Matcher::InventoryListedBy),

	JoinRule::new("pods", ResourceKind::deployment(), ResourceKind::pod(), match_labels),
	JoinRule::new("replicaSets", ResourceKind::deployment(), ResourceKind::replica_set(), Matcher::OwnerReference),
	JoinRule::new("syncObjects", ResourceKind::deployment(), ResourceKind::kustomization(), Matcher::InventoryListedBy),

	JoinRule::new("deployments", ResourceKind::kustomization(), ResourceKind::deployment(), Matcher::InventoryLists),
	JoinRule::new("services", ResourceKind::kustomization(), ResourceKind::service(), Matcher::InventoryLists),
    ]
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViewChange {
    Updated(CompositeView),
    Removed(ObjectRef),
}

/*
 * A memoized view plus the members it was built from.
 */
#[derive(Debug, Clone)]
struct Memo {
    view: CompositeView,
    deps: BTreeSet<ObjectRef>,
}

type Postings = HashMap<(String, String), BTreeSet<String>>;

/*
 * CorrelationIndex keeps every CompositeView up to date incrementally.
 *
 * Besides the memoized views it maintains secondary indexes (label
 * postings, selectors, owner and uid maps, inventory ids, ingress backends)
 * so that a mutation only touches the views that could depend on it: the
 * object's own view, the views it was a member of, and the views it newly
 * matches. Nothing here rescans a whole kind.
 */
pub struct CorrelationIndex {
    rules: Vec<JoinRule>,
    kinds: HashSet<ResourceKind>,

    views: HashMap<ObjectRef, Memo>,
    dependents: HashMap<ObjectRef, BTreeSet<ObjectRef>>,

    labels: HashMap<(ResourceKind, LabelSource, String), Postings>,
    selectors: HashMap<(ResourceKind, SelectorSource, String), BTreeMap<String, BTreeMap<String, String>>>,
    uids: HashMap<String, ObjectRef>,
    owners: HashMap<String, BTreeSet<ObjectRef>>,
    listed_by: HashMap<String, BTreeSet<ObjectRef>>,
    backends: HashMap<(String, String), BTreeSet<ObjectRef>>,
}

impl CorrelationIndex {

    pub fn new(rules: Vec<JoinRule>) -> Self {
	let kinds = rules.iter()
	    .flat_map(|rule| [rule.source.clone(), rule.target.clone()])
	    .collect();

	Self{
	    rules: rules,
	    kinds: kinds,
	    views: HashMap::new(),
	    dependents: HashMap::new(),
	    labels: HashMap::new(),
	    selectors: HashMap::new(),
	    uids: HashMap::new(),
	    owners: HashMap::new(),
	    listed_by: HashMap::new(),
	    backends: HashMap::new(),
	}
    }

    pub fn rules(&self) -> &[JoinRule] {
	&self.rules
    }

    /*
     * Kinds a view rooted at `kind` is built from, and whether they have to
     * be watched across all namespaces.
     */
    pub fn dependencies(&self, kind: &ResourceKind) -> Vec<(ResourceKind, bool)> {
	self.rules.iter()
	    .filter(|rule| &rule.source == kind)
	    .map(|rule| (rule.target.clone(), rule.cross_namespace()))
	    .collect()
    }

    pub fn view(&self, root: &ObjectRef) -> Option<&CompositeView> {
	self.views.get(root).map(|memo| &memo.view)
    }

    /*
     * Views whose root is visible through `filter`, in root order.
     */
    pub fn views_for(&self, filter: &SubscriptionFilter) -> Vec<CompositeView> {
	let mut views: Vec<CompositeView> = self.views.values()
	    .filter(|memo| filter.matches(&memo.view.root.kind, &memo.view.root.key.namespace))
	    .map(|memo| memo.view.clone())
	    .collect();
	views.sort_by(|a, b| a.root.cmp(&b.root));
	views
    }

    pub fn len(&self) -> usize {
	self.views.len()
    }

    /*
     * Folds one cache mutation into the index and recomputes every view it
     * may affect. Must be called after the cache has applied the event, and
     * before a soft-deleted entry is evicted.
     */
    pub fn apply(&mut self, applied: &Applied, cache: &ResourceCache, classifier: &Classifier) -> Vec<ViewChange> {
	let object = match (applied.previous(), applied.current()) {
	    (_, Some(current)) => current.object_ref(),
	    (Some(previous), None) => previous.object_ref(),
	    (None, None) => return vec![],
	};

	if !self.kinds.contains(&object.kind) {
	    return vec![];
	}

	if let Some(previous) = applied.previous() {
	    self.unindex(previous);
	}
	if let Some(current) = applied.current() {
	    self.index(current);
	}

	let mut affected: BTreeSet<ObjectRef> = BTreeSet::new();
	if self.rules.iter().any(|rule| rule.source == object.kind) {
	    affected.insert(object.clone());
	}
	if let Some(roots) = self.dependents.get(&object) {
	    affected.extend(roots.iter().cloned());
	}
	if let Some(current) = applied.current() {
	    for rule in self.rules.iter().filter(|rule| rule.target == object.kind) {
		affected.extend(self.sources_matching(rule, current));
	    }
	}

	log::debug!("{} affects {} view(s)", object, affected.len());

	affected.into_iter()
	    .filter_map(|root| self.recompute(&root, cache, classifier))
	    .collect()
    }

    /*
     * Recomputes every view from the cache alone, discarding all memoized
     * state. Incremental maintenance must always agree with this.
     */
    pub fn rebuild(&mut self, cache: &ResourceCache, classifier: &Classifier) {
	let rules = std::mem::take(&mut self.rules);
	*self = Self::new(rules);

	let mut kinds: Vec<ResourceKind> = self.kinds.iter().cloned().collect();
	kinds.sort();
	for kind in &kinds {
	    for obj in cache.list(kind, None) {
		self.index(&obj);
	    }
	}

	let sources: BTreeSet<ResourceKind> = self.rules.iter().map(|rule| rule.source.clone()).collect();
	for kind in &sources {
	    for obj in cache.list(kind, None) {
		self.recompute(&obj.object_ref(), cache, classifier);
	    }
	}
    }

    fn recompute(&mut self, root: &ObjectRef, cache: &ResourceCache, classifier: &Classifier) -> Option<ViewChange> {
	let Some(source) = cache.get(&root.kind, &root.key) else {
	    let memo = self.views.remove(root)?;
	    self.drop_dependents(root, &memo.deps);
	    return Some(ViewChange::Removed(root.clone()));
	};

	let memo = self.compute(&source, cache, classifier);
	if let Some(existing) = self.views.get(root) {
	    if existing.view == memo.view && existing.deps == memo.deps {
		return None;
	    }
	}

	if let Some(existing) = self.views.remove(root) {
	    self.drop_dependents(root, &existing.deps);
	}
	for dep in &memo.deps {
	    self.dependents.entry(dep.clone()).or_default().insert(root.clone());
	}

	let view = memo.view.clone();
	self.views.insert(root.clone(), memo);
	Some(ViewChange::Updated(view))
    }

    fn drop_dependents(&mut self, root: &ObjectRef, deps: &BTreeSet<ObjectRef>) {
	for dep in deps {
	    if let Some(roots) = self.dependents.get_mut(dep) {
		roots.remove(root);
		if roots.is_empty() {
		    self.dependents.remove(dep);
		}
	    }
	}
    }

    fn compute(&self, source: &ResourceObject, cache: &ResourceCache, classifier: &Classifier) -> Memo {
	let mut view = CompositeView::new(source.object_ref(), classifier.classify(source));
	let mut deps = BTreeSet::new();

	for rule in self.rules.iter().filter(|rule| rule.source == source.kind) {
	    let mut members: Vec<ViewMember> = self.targets_of(rule, source).into_iter()
		.filter_map(|target| cache.get(&target.kind, &target.key))
		.filter(|target| rule.matches(source, target))
		.map(|target| ViewMember{
		    object: target.object_ref(),
		    labels: classifier.classify(&target),
		})
		.collect();
	    members.sort_by(|a, b| a.object.cmp(&b.object));
	    members.dedup_by(|a, b| a.object == b.object);

	    deps.extend(members.iter().map(|m| m.object.clone()));
	    view.relations.entry(rule.relation.clone()).or_default().extend(members);
	}

	Memo{
	    view: view,
	    deps: deps,
	}
    }

    /*
     * Candidate targets of `source` under `rule`, from the indexes. Callers
     * confirm each candidate with `JoinRule::matches`.
     */
    fn targets_of(&self, rule: &JoinRule, source: &ResourceObject) -> BTreeSet<ObjectRef> {
	let ns = source.namespace().to_string();

	match &rule.matcher {
	    Matcher::LabelSelector { selector, labels } => {
		let selector = selector.selector(source);
		let Some(postings) = self.labels.get(&(rule.target.clone(), *labels, ns.clone())) else {
		    return BTreeSet::new();
		};

		let mut names: Option<BTreeSet<String>> = None;
		for pair in selector {
		    let Some(posting) = postings.get(&pair) else {
			return BTreeSet::new();
		    };
		    names = Some(match names {
			None => posting.clone(),
			Some(names) => names.intersection(posting).cloned().collect(),
		    });
		}

		names.unwrap_or_default().into_iter()
		    .map(|name| ObjectRef::new(rule.target.clone(), &ns, &name))
		    .collect()
	    },
	    Matcher::OwnerReference => {
		self.owners.get(&source.uid)
		    .map(|refs| refs.iter().filter(|r| r.kind == rule.target).cloned().collect())
		    .unwrap_or_default()
	    },
	    Matcher::InventoryListedBy => {
		self.listed_by.get(&source.inventory_id())
		    .map(|refs| refs.iter().filter(|r| r.kind == rule.target).cloned().collect())
		    .unwrap_or_default()
	    },
	    Matcher::InventoryLists => {
		source.inventory_ids().iter()
		    .filter_map(|id| InventoryEntry::parse(id))
		    .filter(|entry| rule.target.same_type(&entry.group, &entry.kind))
		    .map(|entry| ObjectRef::new(rule.target.clone(), &entry.namespace, &entry.name))
		    .collect()
	    },
	    Matcher::ServiceBackend => {
		self.backends.get(&(ns, source.name().to_string()))
		    .map(|refs| refs.iter().filter(|r| r.kind == rule.target).cloned().collect())
		    .unwrap_or_default()
	    },
	}
    }

    /*
     * Sources whose `rule` view would accept `target`; the reverse of
     * `targets_of`.
     */
    fn sources_matching(&self, rule: &JoinRule, target: &ResourceObject) -> BTreeSet<ObjectRef> {
	let ns = target.namespace().to_string();

	match &rule.matcher {
	    Matcher::LabelSelector { selector, labels } => {
		let target_labels = labels.labels(target);
		self.selectors.get(&(rule.source.clone(), *selector, ns.clone()))
		    .map(|sources| {
			sources.iter()
			    .filter(|(_, sel)| contains_all(&target_labels, sel))
			    .map(|(name, _)| ObjectRef::new(rule.source.clone(), &ns, name))
			    .collect()
		    })
		    .unwrap_or_default()
	    },
	    Matcher::OwnerReference => {
		target.owner_uids.iter()
		    .filter_map(|uid| self.uids.get(uid))
		    .filter(|r| r.kind == rule.source)
		    .cloned()
		    .collect()
	    },
	    Matcher::InventoryListedBy => {
		target.inventory_ids().iter()
		    .filter_map(|id| InventoryEntry::parse(id))
		    .filter(|entry| rule.source.same_type(&entry.group, &entry.kind))
		    .map(|entry| ObjectRef::new(rule.source.clone(), &entry.namespace, &entry.name))
		    .collect()
	    },
	    Matcher::InventoryLists => {
		self.listed_by.get(&target.inventory_id())
		    .map(|refs| refs.iter().filter(|r| r.kind == rule.source).cloned().collect())
		    .unwrap_or_default()
	    },
	    Matcher::ServiceBackend => {
		target.backend_services().iter()
		    .map(|name| ObjectRef::new(rule.source.clone(), &ns, name))
		    .collect()
	    },
	}
    }

    fn index(&mut self, obj: &ResourceObject) {
	self.update_index(obj, true);
    }

    fn unindex(&mut self, obj: &ResourceObject) {
	self.update_index(obj, false);
    }

    fn update_index(&mut self, obj: &ResourceObject, add: bool) {
	let me = obj.object_ref();
	let ns = obj.namespace().to_string();

	for source in [LabelSource::Metadata, LabelSource::PodTemplate] {
	    let key = (obj.kind.clone(), source, ns.clone());
	    for pair in source.labels(obj) {
		if add {
		    self.labels.entry(key.clone()).or_default().entry(pair).or_default().insert(obj.name().to_string());
		} else if let Some(postings) = self.labels.get_mut(&key) {
		    if let Some(names) = postings.get_mut(&pair) {
			names.remove(obj.name());
			if names.is_empty() {
			    postings.remove(&pair);
			}
		    }
		}
	    }
	}

	for source in [SelectorSource::Map, SelectorSource::MatchLabels] {
	    let key = (obj.kind.clone(), source, ns.clone());
	    let selector = source.selector(obj);
	    if add && !selector.is_empty() {
		self.selectors.entry(key).or_default().insert(obj.name().to_string(), selector);
	    } else if !add {
		if let Some(sources) = self.selectors.get_mut(&key) {
		    sources.remove(obj.name());
		}
	    }
	}

	if !obj.uid.is_empty() {
	    if add {
		self.uids.insert(obj.uid.clone(), me.clone());
	    } else if self.uids.get(&obj.uid) == Some(&me) {
		self.uids.remove(&obj.uid);
	    }
	}

	for uid in &obj.owner_uids {
	    set_membership(&mut self.owners, uid.clone(), &me, add);
	}

	for id in obj.inventory_ids() {
	    set_membership(&mut self.listed_by, id, &me, add);
	}

	for name in obj.backend_services() {
	    set_membership(&mut self.backends, (ns.clone(), name), &me, add);
	}
    }
}

fn set_membership<K: std::hash::Hash + Eq>(map: &mut HashMap<K, BTreeSet<ObjectRef>>, key: K, member: &ObjectRef, add: bool) {
    if add {
	map.entry(key).or_default().insert(member.clone());
    } else if let Some(members) = map.get_mut(&key) {
	members.remove(member);
	if members.is_empty() {
	    map.remove(&key);
	}
    }
}
