use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/*
 * One UI status badge. Labels are not exclusive: a resource can be
 * Suspended and Ready, or Stalled and Reconciling, at the same time.
 */
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum StatusLabel {
    Ready,
    NotReady,
    Reconciling,
    Stalled,
    ApprovalRequired,
    Suspended,

    /* an artifact is in storage; the text is source specific ("Indexed", "Packaged", ...) */
    ArtifactPresent(String),
}

impl fmt::Display for StatusLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
	match self {
	    StatusLabel::Ready => write!(f, "Ready"),
	    StatusLabel::NotReady => write!(f, "NotReady"),
	    StatusLabel::Reconciling => write!(f, "Reconciling"),
	    StatusLabel::Stalled => write!(f, "Stalled"),
	    StatusLabel::ApprovalRequired => write!(f, "ApprovalRequired"),
	    StatusLabel::Suspended => write!(f, "Suspended"),
	    StatusLabel::ArtifactPresent(text) => write!(f, "{}", text),
	}
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StatusLabelSet(BTreeSet<StatusLabel>);

impl StatusLabelSet {

    pub fn new() -> Self {
	Self(BTreeSet::new())
    }

    pub fn insert(&mut self, label: StatusLabel) -> bool {
	self.0.insert(label)
    }

    pub fn contains(&self, label: &StatusLabel) -> bool {
	self.0.contains(label)
    }

    pub fn is_empty(&self) -> bool {
	self.0.is_empty()
    }

    pub fn len(&self) -> usize {
	self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &StatusLabel> {
	self.0.iter()
    }
}

impl FromIterator<StatusLabel> for StatusLabelSet {
    fn from_iter<I: IntoIterator<Item = StatusLabel>>(iter: I) -> Self {
	Self(iter.into_iter().collect())
    }
}

impl fmt::Display for StatusLabelSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
	let labels: Vec<String> = self.0.iter().map(|l| l.to_string()).collect();
	write!(f, "[{}]", labels.join(", "))
    }
}
