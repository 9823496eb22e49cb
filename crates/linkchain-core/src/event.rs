//! Lifecycle events published to chain subscribers.

use crate::failure::FailureReport;
use crate::ids::{LinkId, RunId};

/// A transition observed on a chain.
#[derive(Debug, Clone)]
pub enum ChainEvent {
    Started {
        run_id: RunId,
        links: usize,
        in_order: bool,
    },
    LinkStarted {
        link_id: LinkId,
        name: String,
    },
    LinkCompleted {
        link_id: LinkId,
        name: String,
    },
    LinkFailed {
        link_id: LinkId,
        name: String,
        reason: String,
    },
    LinkCancelled {
        link_id: LinkId,
        name: String,
    },
    Completed {
        run_id: RunId,
    },
    Failed {
        run_id: RunId,
        report: FailureReport,
    },
}

impl ChainEvent {
    /// Short dotted name, matching the `event` field of the log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            ChainEvent::Started { .. } => "chain.started",
            ChainEvent::LinkStarted { .. } => "link.started",
            ChainEvent::LinkCompleted { .. } => "link.completed",
            ChainEvent::LinkFailed { .. } => "link.failed",
            ChainEvent::LinkCancelled { .. } => "link.cancelled",
            ChainEvent::Completed { .. } => "chain.completed",
            ChainEvent::Failed { .. } => "chain.failed",
        }
    }

    /// Whether this event ends a run.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ChainEvent::Completed { .. } | ChainEvent::Failed { .. })
    }

    /// Name of the link this event concerns, if any.
    pub fn link_name(&self) -> Option<&str> {
        match self {
            ChainEvent::LinkStarted { name, .. }
            | ChainEvent::LinkCompleted { name, .. }
            | ChainEvent::LinkFailed { name, .. }
            | ChainEvent::LinkCancelled { name, .. } => Some(name),
            _ => None,
        }
    }
}
