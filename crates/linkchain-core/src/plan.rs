//! Run plans: a serializable description of a chain of timed links.
//!
//! Plans are JSON documents:
//!
//! ```json
//! {
//!   "name": "warmup",
//!   "in_order": true,
//!   "links": [
//!     { "name": "fetch", "delay_ms": 50 },
//!     { "name": "store", "delay_ms": 20, "outcome": { "fail": "disk-error" } },
//!     { "name": "slow", "delay_ms": 500, "timeout_ms": 100 }
//!   ]
//! }
//! ```

use crate::chain::Chain;
use crate::error::{ChainError, ChainResult};
use crate::link::ChainLink;
use crate::links::TaskLink;
use anyhow::anyhow;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

/// How a planned link settles.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LinkOutcome {
    #[default]
    Succeed,
    Fail(String),
}

/// One planned link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkPlan {
    pub name: String,

    /// How long the link works before settling.
    #[serde(default)]
    pub delay_ms: u64,

    #[serde(default)]
    pub outcome: LinkOutcome,

    /// Fail the link if it has not settled after this long.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,

    /// Disabled links are left out of the built chain.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl LinkPlan {
    pub fn new(name: impl Into<String>, delay_ms: u64) -> Self {
        Self {
            name: name.into(),
            delay_ms,
            outcome: LinkOutcome::Succeed,
            timeout_ms: None,
            enabled: true,
        }
    }

    pub fn failing(mut self, reason: impl Into<String>) -> Self {
        self.outcome = LinkOutcome::Fail(reason.into());
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Build the link. It must be started inside a tokio `LocalSet`.
    pub fn build(&self) -> ChainLink {
        let delay = Duration::from_millis(self.delay_ms);
        let outcome = self.outcome.clone();
        let mut task = TaskLink::new(move || {
            let outcome = outcome.clone();
            async move {
                tokio::time::sleep(delay).await;
                match outcome {
                    LinkOutcome::Succeed => Ok(()),
                    LinkOutcome::Fail(reason) => Err(anyhow!(reason)),
                }
            }
        });
        if let Some(timeout_ms) = self.timeout_ms {
            task = task.with_timeout(Duration::from_millis(timeout_ms));
        }
        task.into_link(self.name.clone())
    }
}

/// A whole chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainPlan {
    pub name: String,

    #[serde(default)]
    pub in_order: bool,

    pub links: Vec<LinkPlan>,
}

impl ChainPlan {
    pub fn from_json_str(json: &str) -> ChainResult<Self> {
        let plan: Self = serde_json::from_str(json)?;
        plan.validate()?;
        Ok(plan)
    }

    pub fn load(path: &Path) -> ChainResult<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    /// Link names must be non-empty and unique.
    pub fn validate(&self) -> ChainResult<()> {
        if self.name.trim().is_empty() {
            return Err(ChainError::Plan("plan name must not be empty".to_string()));
        }

        let mut seen = HashSet::new();
        for link in &self.links {
            if link.name.trim().is_empty() {
                return Err(ChainError::Plan("link name must not be empty".to_string()));
            }
            if !seen.insert(link.name.as_str()) {
                return Err(ChainError::Plan(format!("duplicate link name: {}", link.name)));
            }
        }
        Ok(())
    }

    /// Hex SHA-256 of the plan's canonical JSON.
    pub fn digest(&self) -> ChainResult<String> {
        let bytes = serde_json::to_vec(self)?;
        Ok(hex::encode(Sha256::digest(&bytes)))
    }

    pub fn enabled_links(&self) -> impl Iterator<Item = &LinkPlan> {
        self.links.iter().filter(|link| link.enabled)
    }

    /// Build an idle chain holding one [`TaskLink`] per enabled link.
    pub fn build(&self) -> ChainResult<Chain> {
        self.validate()?;
        let chain = if self.in_order {
            Chain::ordered()
        } else {
            Chain::new()
        };
        for link in self.enabled_links() {
            chain.add(&link.build())?;
        }
        Ok(chain)
    }
}
