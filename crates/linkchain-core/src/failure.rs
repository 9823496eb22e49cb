//! Failure aggregation for a single chain run.

use crate::ids::LinkId;
use std::fmt;
use std::sync::Arc;

/// One failure reported by a link, tagged with the link that reported it.
#[derive(Debug, Clone)]
pub struct LinkFailure {
    link_id: LinkId,
    link_name: String,
    error: Arc<anyhow::Error>,
}

impl LinkFailure {
    pub fn new(link_id: LinkId, link_name: impl Into<String>, error: anyhow::Error) -> Self {
        Self {
            link_id,
            link_name: link_name.into(),
            error: Arc::new(error),
        }
    }

    pub fn link_id(&self) -> LinkId {
        self.link_id
    }

    pub fn link_name(&self) -> &str {
        &self.link_name
    }

    pub fn error(&self) -> &anyhow::Error {
        &self.error
    }

    /// The failure reason without the link prefix.
    pub fn reason(&self) -> String {
        self.error.to_string()
    }
}

impl fmt::Display for LinkFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {:#}", self.link_name, self.error)
    }
}

/// Every failure collected during one chain run, in the order reported.
///
/// Ordered chains fail fast, so their reports carry exactly one failure.
/// Unordered chains wait for every link, so the report carries one failure
/// per failed link.
#[derive(Debug, Clone, Default)]
pub struct FailureReport {
    failures: Vec<LinkFailure>,
}

impl FailureReport {
    pub fn new(failures: Vec<LinkFailure>) -> Self {
        Self { failures }
    }

    pub fn len(&self) -> usize {
        self.failures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, LinkFailure> {
        self.failures.iter()
    }

    pub fn first(&self) -> Option<&LinkFailure> {
        self.failures.first()
    }

    /// Reasons only, in report order.
    pub fn reasons(&self) -> Vec<String> {
        self.failures.iter().map(LinkFailure::reason).collect()
    }

    /// Names of the failed links, in report order.
    pub fn link_names(&self) -> Vec<&str> {
        self.failures.iter().map(LinkFailure::link_name).collect()
    }

    pub fn into_failures(self) -> Vec<LinkFailure> {
        self.failures
    }
}

impl fmt::Display for FailureReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} link(s) failed", self.failures.len())?;
        for (i, failure) in self.failures.iter().enumerate() {
            let sep = if i == 0 { ": " } else { "; " };
            write!(f, "{sep}{failure}")?;
        }
        Ok(())
    }
}

impl std::error::Error for FailureReport {}

impl IntoIterator for FailureReport {
    type Item = LinkFailure;
    type IntoIter = std::vec::IntoIter<LinkFailure>;

    fn into_iter(self) -> Self::IntoIter {
        self.failures.into_iter()
    }
}

impl<'a> IntoIterator for &'a FailureReport {
    type Item = &'a LinkFailure;
    type IntoIter = std::slice::Iter<'a, LinkFailure>;

    fn into_iter(self) -> Self::IntoIter {
        self.failures.iter()
    }
}
