use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// One member of a proxy family: the node hosting it and the invoker
/// locator clients connect to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Replicant {
    pub node: String,
    pub locator: String,
}

impl Replicant {
    pub fn new(node: impl Into<String>, locator: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            locator: locator.into(),
        }
    }
}

impl fmt::Display for Replicant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.node, self.locator)
    }
}

/// Immutable snapshot of a family's targets.
///
/// Views are replaced wholesale, never edited, so a proxy holding an
/// `Arc<ReplicantView>` always iterates a consistent list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicantView {
    view_id: u64,
    replicants: Arc<[Replicant]>,
}

impl ReplicantView {
    pub fn new(view_id: u64, replicants: Vec<Replicant>) -> Self {
        Self {
            view_id,
            replicants: replicants.into(),
        }
    }

    /// The view installed before any membership change was delivered.
    pub fn empty() -> Self {
        Self::new(0, Vec::new())
    }

    pub fn view_id(&self) -> u64 {
        self.view_id
    }

    pub fn replicants(&self) -> &[Replicant] {
        &self.replicants
    }

    pub fn len(&self) -> usize {
        self.replicants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.replicants.is_empty()
    }

    pub fn contains(&self, replicant: &Replicant) -> bool {
        self.replicants.contains(replicant)
    }

    /// Replicants not listed in `exclude`, in view order.
    pub fn candidates<'a>(&'a self, exclude: &'a [Replicant]) -> impl Iterator<Item = &'a Replicant> {
        self.replicants.iter().filter(move |r| !exclude.contains(r))
    }
}

impl Default for ReplicantView {
    fn default() -> Self {
        Self::empty()
    }
}
