use kview_api::{Condition, ConditionStatus, ResourceKind, ResourceObject, StatusLabel, StatusLabelSet};

use std::collections::HashMap;

pub const READY: &str = "Ready";
pub const STALLED: &str = "Stalled";
pub const RECONCILING: &str = "Reconciling";
pub const ARTIFACT_IN_STORAGE: &str = "ArtifactInStorage";
pub const DEPENDENCY_NOT_READY: &str = "DependencyNotReady";

const DEFAULT_SUSPEND_POINTER: &str = "/spec/suspend";
const DEFAULT_ARTIFACT_LABEL: &str = "Artifact";

/*
 * Rewrites a controller specific condition into the vocabulary the rules
 * understand, e.g. Carvel's `ReconcileSucceeded=True` into `Ready=True`.
 */
#[derive(Debug, Clone)]
pub struct ConditionAlias {
    pub from: String,
    pub when: ConditionStatus,
    pub to: String,
    pub status: ConditionStatus,
}

/*
 * How the conditions of one kind are read.
 */
#[derive(Debug, Clone)]
pub struct KindProfile {

    /* `Ready=Unknown` with one of these reasons yields the paired label instead of Reconciling */
    pub unknown_overrides: Vec<(String, StatusLabel)>,

    /* text of the ArtifactPresent label */
    pub artifact_label: String,

    pub aliases: Vec<ConditionAlias>,

    /* JSON pointer of the boolean that suspends reconciliation */
    pub suspend_pointer: String,
}

impl Default for KindProfile {
    fn default() -> Self {
	Self{
	    unknown_overrides: vec![],
	    artifact_label: DEFAULT_ARTIFACT_LABEL.to_string(),
	    aliases: vec![],
	    suspend_pointer: DEFAULT_SUSPEND_POINTER.to_string(),
	}
    }
}

impl KindProfile {

    pub fn with_unknown_override(mut self, reason: &str, label: StatusLabel) -> Self {
	self.unknown_overrides.push((reason.to_string(), label));
	self
    }

    pub fn with_artifact_label(mut self, label: &str) -> Self {
	self.artifact_label = label.to_string();
	self
    }

    pub fn with_alias(mut self, from: &str, when: ConditionStatus, to: &str, status: ConditionStatus) -> Self {
	self.aliases.push(ConditionAlias{
	    from: from.to_string(),
	    when: when,
	    to: to.to_string(),
	    status: status,
	});
	self
    }

    pub fn with_suspend_pointer(mut self, pointer: &str) -> Self {
	self.suspend_pointer = pointer.to_string();
	self
    }
}

/*
 * The facts the rules look at, extracted once per classification.
 */
struct Facts<'a> {
    stalled: bool,
    ready: Option<&'a Condition>,
    reconciling: bool,
    artifact: bool,
    suspended: bool,
}

impl Facts<'_> {
    fn ready_is(&self, status: ConditionStatus) -> bool {
	self.ready.map(|c| c.status == status).unwrap_or(false)
    }

    fn ready_reason(&self) -> &str {
	self.ready.map(|c| c.reason.as_str()).unwrap_or("")
    }

    fn waiting_on_dependency(&self) -> bool {
	self.ready_is(ConditionStatus::False) && self.ready_reason() == DEPENDENCY_NOT_READY
    }
}

type Rule = fn(&Facts, &KindProfile) -> Option<StatusLabel>;

fn stalled(facts: &Facts, _: &KindProfile) -> Option<StatusLabel> {
    facts.stalled.then_some(StatusLabel::Stalled)
}

fn ready(facts: &Facts, _: &KindProfile) -> Option<StatusLabel> {
    facts.ready_is(ConditionStatus::True).then_some(StatusLabel::Ready)
}

// waiting on a dependency is transient and reported as Reconciling instead
fn not_ready(facts: &Facts, _: &KindProfile) -> Option<StatusLabel> {
    (facts.ready_is(ConditionStatus::False) && !facts.waiting_on_dependency()).then_some(StatusLabel::NotReady)
}

fn ready_unknown(facts: &Facts, profile: &KindProfile) -> Option<StatusLabel> {
    if !facts.ready_is(ConditionStatus::Unknown) {
	return None;
    }

    let reason = facts.ready_reason();
    let label = profile.unknown_overrides.iter()
	.find(|(r, _)| r == reason)
	.map(|(_, label)| label.clone())
	.unwrap_or(StatusLabel::Reconciling);
    Some(label)
}

fn reconciling(facts: &Facts, _: &KindProfile) -> Option<StatusLabel> {
    (facts.reconciling || facts.waiting_on_dependency()).then_some(StatusLabel::Reconciling)
}

fn artifact(facts: &Facts, profile: &KindProfile) -> Option<StatusLabel> {
    facts.artifact.then(|| StatusLabel::ArtifactPresent(profile.artifact_label.clone()))
}

fn suspended(facts: &Facts, _: &KindProfile) -> Option<StatusLabel> {
    facts.suspended.then_some(StatusLabel::Suspended)
}

/*
 * Every rule runs; each may contribute one label. Ready, NotReady and the
 * Unknown rule are mutually exclusive only because `Ready` has one status.
 */
const RULES: &[Rule] = &[stalled, ready, not_ready, ready_unknown, reconciling, artifact, suspended];

/*
 * Classifier turns a resource's conditions and suspend flag into the set
 * of status labels shown by the UI.
 */
#[derive(Debug, Clone)]
pub struct Classifier {
    profiles: HashMap<(String, String), KindProfile>,
    fallback: KindProfile,
}

impl Default for Classifier {
    fn default() -> Self {
	let mut classifier = Self::empty();

	classifier.set_profile(&ResourceKind::terraform(), KindProfile::default()
	    .with_unknown_override("TerraformPlannedWithChanges", StatusLabel::ApprovalRequired));

	classifier.set_profile(&ResourceKind::helm_repository(), KindProfile::default().with_artifact_label("Indexed"));
	classifier.set_profile(&ResourceKind::helm_chart(), KindProfile::default().with_artifact_label("Packaged"));
	classifier.set_profile(&ResourceKind::git_repository(), KindProfile::default());
	classifier.set_profile(&ResourceKind::oci_repository(), KindProfile::default());
	classifier.set_profile(&ResourceKind::bucket(), KindProfile::default());

	classifier.set_profile(&ResourceKind::carvel_app(), KindProfile::default()
	    .with_alias("ReconcileSucceeded", ConditionStatus::True, READY, ConditionStatus::True)
	    .with_alias("ReconcileFailed", ConditionStatus::True, READY, ConditionStatus::False)
	    .with_suspend_pointer("/spec/paused"));

	classifier
    }
}

impl Classifier {

    pub fn empty() -> Self {
	Self{
	    profiles: HashMap::new(),
	    fallback: KindProfile::default(),
	}
    }

    /*
     * Profiles are keyed by group and kind, so every served version of a
     * CRD is read the same way.
     */
    pub fn set_profile(&mut self, kind: &ResourceKind, profile: KindProfile) {
	self.profiles.insert((kind.group.clone(), kind.kind.clone()), profile);
    }

    pub fn profile(&self, kind: &ResourceKind) -> &KindProfile {
	self.profiles.get(&(kind.group.clone(), kind.kind.clone())).unwrap_or(&self.fallback)
    }

    pub fn classify(&self, obj: &ResourceObject) -> StatusLabelSet {
	let profile = self.profile(&obj.kind);
	let suspended = obj.bool_at(&profile.suspend_pointer);

	classify_with(profile, &obj.conditions(), suspended)
    }

    pub fn classify_conditions(&self, kind: &ResourceKind, conditions: &[Condition], suspended: bool) -> StatusLabelSet {
	classify_with(self.profile(kind), conditions, suspended)
    }
}

fn classify_with(profile: &KindProfile, conditions: &[Condition], suspended: bool) -> StatusLabelSet {
    let mut conditions: Vec<Condition> = conditions.to_vec();
    for alias in &profile.aliases {
	let translated: Vec<Condition> = conditions.iter()
	    .filter(|c| c.type_ == alias.from && c.status == alias.when)
	    .map(|c| Condition{
		type_: alias.to.clone(),
		status: alias.status,
		reason: c.reason.clone(),
		message: c.message.clone(),
	    })
	    .collect();
	conditions.extend(translated);
    }

    let find = |type_: &str| conditions.iter().find(|c| c.type_ == type_);
    let is_true = |type_: &str| find(type_).map(|c| c.status == ConditionStatus::True).unwrap_or(false);

    let facts = Facts{
	stalled: is_true(STALLED),
	ready: find(READY),
	reconciling: is_true(RECONCILING),
	artifact: is_true(ARTIFACT_IN_STORAGE),
	suspended: suspended,
    };

    RULES.iter()
	.filter_map(|rule| rule(&facts, profile))
	.collect()
}
