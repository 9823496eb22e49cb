//! linkchain core library
//!
//! Groups asynchronous operations ("links") into a [`Chain`] that runs them
//! either all at once or strictly in order, aggregates their failures, and
//! fires exactly one terminal callback per run.
//!
//! Everything runs on one control thread. Work finishing elsewhere is brought
//! back through a [`Dispatcher`], or through a tokio `LocalSet` when using
//! [`TaskLink`].

pub mod chain;
pub mod dispatch;
pub mod error;
pub mod event;
pub mod failure;
pub mod ids;
pub mod link;
pub mod links;
pub mod obs;
pub mod plan;
pub mod subscribers;
pub mod telemetry;

pub use chain::{AdoptionPolicy, Chain, RunOutcome};
pub use dispatch::{Dispatcher, LinkResolver, RemoteDispatcher};
pub use error::{ChainError, ChainResult};
pub use event::ChainEvent;
pub use failure::{FailureReport, LinkFailure};
pub use ids::{ChainId, LinkId, RunId};
pub use link::{ChainLink, LinkState, LinkWork, WeakLink};
pub use links::{FnLink, SubChainLink, TaskLink};
pub use obs::{
    emit_chain_completed, emit_chain_failed, emit_chain_started, emit_late_signal,
    emit_link_cancelled, emit_link_completed, emit_link_failed, emit_link_started, RunSpan,
};
pub use plan::{ChainPlan, LinkOutcome, LinkPlan};
pub use subscribers::{SubscriptionId, Subscribers};
pub use telemetry::init_tracing;

/// linkchain version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
