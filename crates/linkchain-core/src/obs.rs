//! Structured observability hooks for chain and link lifecycle events.
//!
//! This module provides:
//! - Run-scoped tracing spans via the `RunSpan` RAII guard
//! - Emission functions for chain start, link transitions and terminal outcomes
//!
//! Events are emitted at `info!` level, failures at `warn!`, and dropped late
//! signals at `debug!`. For JSON output, initialise tracing with `json = true`.

use crate::ids::{ChainId, LinkId, RunId};
use tracing::{debug, info, warn};

/// RAII guard that enters a run-scoped tracing span.
///
/// # Example
///
/// ```ignore
/// let _span = RunSpan::enter(chain.id(), run_id);
/// // tracing calls are now associated with chain_id and run_id
/// ```
pub struct RunSpan {
    _span: tracing::span::EnteredSpan,
}

impl RunSpan {
    pub fn enter(chain_id: ChainId, run_id: RunId) -> Self {
        let span = tracing::info_span!(
            "linkchain.run",
            chain_id = %chain_id.short(),
            run_id = %run_id.short(),
        );
        Self {
            _span: span.entered(),
        }
    }
}

/// Emit event: chain run started.
pub fn emit_chain_started(chain_id: ChainId, run_id: RunId, links: usize, in_order: bool) {
    info!(
        event = "chain.started",
        chain_id = %chain_id,
        run_id = %run_id,
        links = links,
        in_order = in_order,
    );
}

pub fn emit_link_started(link_id: LinkId, name: &str) {
    info!(event = "link.started", link_id = %link_id, link = %name);
}

pub fn emit_link_completed(link_id: LinkId, name: &str) {
    info!(event = "link.completed", link_id = %link_id, link = %name);
}

pub fn emit_link_failed(link_id: LinkId, name: &str, reason: &dyn std::fmt::Display) {
    warn!(event = "link.failed", link_id = %link_id, link = %name, reason = %reason);
}

pub fn emit_link_cancelled(link_id: LinkId, name: &str) {
    info!(event = "link.cancelled", link_id = %link_id, link = %name);
}

/// Emit event: a report from a link the chain no longer tracks was dropped.
pub fn emit_late_signal(link_id: LinkId, name: &str, signal: &str) {
    debug!(event = "link.late_signal", link_id = %link_id, link = %name, signal = %signal);
}

pub fn emit_chain_completed(chain_id: ChainId, run_id: RunId) {
    info!(event = "chain.completed", chain_id = %chain_id, run_id = %run_id);
}

pub fn emit_chain_failed(chain_id: ChainId, run_id: RunId, failures: usize) {
    warn!(
        event = "chain.failed",
        chain_id = %chain_id,
        run_id = %run_id,
        failures = failures,
    );
}
