//! Ready-made link kinds.
//!
//! - [`FnLink`]: start hook from a closure
//! - [`TaskLink`]: spawns a future on the current tokio `LocalSet`
//! - [`SubChainLink`]: runs a whole chain as one link

use crate::chain::Chain;
use crate::event::ChainEvent;
use crate::link::{ChainLink, LinkWork};
use crate::subscribers::SubscriptionId;
use anyhow::anyhow;
use futures::future::{FutureExt, LocalBoxFuture};
use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::warn;

type StartFn = Box<dyn FnMut(&ChainLink) -> anyhow::Result<()>>;
type CancelFn = Box<dyn FnMut(&ChainLink)>;

/// Link work backed by closures.
pub struct FnLink {
    on_start: StartFn,
    on_cancel: Option<CancelFn>,
}

impl FnLink {
    pub fn new(on_start: impl FnMut(&ChainLink) -> anyhow::Result<()> + 'static) -> Self {
        Self {
            on_start: Box::new(on_start),
            on_cancel: None,
        }
    }

    pub fn on_cancel(mut self, on_cancel: impl FnMut(&ChainLink) + 'static) -> Self {
        self.on_cancel = Some(Box::new(on_cancel));
        self
    }

    pub fn into_link(self, name: impl Into<String>) -> ChainLink {
        ChainLink::new(name, self)
    }
}

impl LinkWork for FnLink {
    fn on_start(&mut self, link: &ChainLink) -> anyhow::Result<()> {
        (self.on_start)(link)
    }

    fn on_cancelled_due_to_failure(&mut self, link: &ChainLink) {
        if let Some(on_cancel) = self.on_cancel.as_mut() {
            on_cancel(link);
        }
    }
}

type TaskFactory = Box<dyn FnMut() -> LocalBoxFuture<'static, anyhow::Result<()>>>;

/// Link work that runs a future on the current tokio `LocalSet`.
///
/// The future's output resolves the link: `Ok` completes it, `Err` fails it.
/// With a timeout, a future that has not settled in time fails the link with
/// "timed out after N ms".
///
/// A chain only cancels links it never started in the abandoned run, so no
/// task of that run exists to stop; cancellation just drops the handle left
/// from an earlier run.
///
/// # Panics
///
/// Starting the link outside a `LocalSet` panics, as `spawn_local` does.
pub struct TaskLink {
    factory: TaskFactory,
    timeout: Option<Duration>,
    handle: Option<JoinHandle<()>>,
}

impl TaskLink {
    pub fn new<F, Fut>(mut factory: F) -> Self
    where
        F: FnMut() -> Fut + 'static,
        Fut: Future<Output = anyhow::Result<()>> + 'static,
    {
        Self {
            factory: Box::new(move || factory().boxed_local()),
            timeout: None,
            handle: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn into_link(self, name: impl Into<String>) -> ChainLink {
        ChainLink::new(name, self)
    }
}

impl LinkWork for TaskLink {
    fn on_start(&mut self, link: &ChainLink) -> anyhow::Result<()> {
        if let Some(previous) = self.handle.take() {
            previous.abort();
        }

        let task = (self.factory)();
        let timeout = self.timeout;
        let link = link.clone();

        self.handle = Some(tokio::task::spawn_local(async move {
            let outcome = match timeout {
                Some(limit) => match tokio::time::timeout(limit, task).await {
                    Ok(outcome) => outcome,
                    Err(_) => Err(anyhow!("timed out after {} ms", limit.as_millis())),
                },
                None => task.await,
            };

            let reported = match outcome {
                Ok(()) => link.complete(),
                Err(reason) => link.fail(reason),
            };
            if let Err(err) = reported {
                warn!(link = %link.name(), error = %err, "task link could not report");
            }
        }));
        Ok(())
    }

    fn on_cancelled_due_to_failure(&mut self, _link: &ChainLink) {
        // Finished by now; the link was not started in this run.
        self.handle = None;
    }
}

/// Link work that runs an inner chain.
///
/// The link completes when the inner chain completes and fails with the inner
/// [`FailureReport`](crate::FailureReport) as its reason. The inner chain's own
/// callbacks and subscribers are left alone.
pub struct SubChainLink {
    chain: Chain,
    subscription: Option<SubscriptionId>,
}

impl SubChainLink {
    pub fn new(chain: Chain) -> Self {
        Self {
            chain,
            subscription: None,
        }
    }

    pub fn chain(&self) -> &Chain {
        &self.chain
    }

    pub fn into_link(self, name: impl Into<String>) -> ChainLink {
        ChainLink::new(name, self)
    }

    fn detach(&mut self) {
        if let Some(id) = self.subscription.take() {
            self.chain.unsubscribe(id);
        }
    }
}

impl LinkWork for SubChainLink {
    fn on_start(&mut self, link: &ChainLink) -> anyhow::Result<()> {
        self.detach();

        let weak = link.downgrade();
        self.subscription = Some(self.chain.subscribe(move |event| {
            let Some(link) = weak.upgrade() else {
                return;
            };
            let reported = match event {
                ChainEvent::Completed { .. } => link.complete(),
                ChainEvent::Failed { report, .. } => link.fail(report.clone()),
                _ => return,
            };
            if let Err(err) = reported {
                warn!(link = %link.name(), error = %err, "sub-chain link could not report");
            }
        }));

        if let Err(err) = self.chain.start() {
            self.detach();
            return Err(err.into());
        }
        Ok(())
    }

    fn on_cancelled_due_to_failure(&mut self, _link: &ChainLink) {
        self.detach();
    }
}

impl Drop for SubChainLink {
    fn drop(&mut self) {
        self.detach();
    }
}
