//! Chain links: one asynchronous operation that starts once and terminates once.
//!
//! A [`ChainLink`] is a cheap, cloneable handle. The work itself is supplied by
//! a [`LinkWork`] implementation; the handle takes care of the ownership
//! protocol with the owning [`Chain`] and of routing synchronous start-up
//! errors into the same failure path used for asynchronous failures.

use crate::chain::{Chain, WeakChain};
use crate::error::{ChainError, ChainResult};
use crate::ids::LinkId;
use crate::obs;
use anyhow::anyhow;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};

/// The work behind a link.
pub trait LinkWork {
    /// Begin the operation.
    ///
    /// Implementations arrange for exactly one of [`ChainLink::complete`] or
    /// [`ChainLink::fail`] to be called once the operation settles, usually
    /// later and off this call stack. Returning `Err` is reported as the link's
    /// failure.
    fn on_start(&mut self, link: &ChainLink) -> anyhow::Result<()>;

    /// Called when an ordered chain abandons its run before this link started.
    ///
    /// Advisory only: the link is already detached, so anything it reports
    /// afterwards is dropped.
    fn on_cancelled_due_to_failure(&mut self, _link: &ChainLink) {}
}

/// Lifecycle of a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Unbound,
    Bound,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl LinkState {
    pub fn is_resolved(&self) -> bool {
        matches!(
            self,
            LinkState::Completed | LinkState::Failed | LinkState::Cancelled
        )
    }
}

struct LinkInner {
    id: LinkId,
    name: String,
    state: Cell<LinkState>,
    attempts: Cell<u64>,
    owner: RefCell<Option<WeakChain>>,
    work: RefCell<Box<dyn LinkWork>>,
}

/// Handle to a link. Clones refer to the same link.
#[derive(Clone)]
pub struct ChainLink {
    inner: Rc<LinkInner>,
}

/// Non-owning handle to a link, for work that must refer back to its own link.
#[derive(Clone)]
pub struct WeakLink {
    inner: Weak<LinkInner>,
}

impl WeakLink {
    pub fn upgrade(&self) -> Option<ChainLink> {
        self.inner.upgrade().map(|inner| ChainLink { inner })
    }
}

impl ChainLink {
    pub fn new(name: impl Into<String>, work: impl LinkWork + 'static) -> Self {
        Self {
            inner: Rc::new(LinkInner {
                id: LinkId::new(),
                name: name.into(),
                state: Cell::new(LinkState::Unbound),
                attempts: Cell::new(0),
                owner: RefCell::new(None),
                work: RefCell::new(Box::new(work)),
            }),
        }
    }

    pub fn id(&self) -> LinkId {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn state(&self) -> LinkState {
        self.inner.state.get()
    }

    /// The chain this link currently reports to.
    pub fn chain(&self) -> Option<Chain> {
        self.inner
            .owner
            .borrow()
            .as_ref()
            .and_then(WeakChain::upgrade)
    }

    /// How many times this link has been started.
    pub fn attempts(&self) -> u64 {
        self.inner.attempts.get()
    }

    pub fn is_bound(&self) -> bool {
        self.chain().is_some()
    }

    pub fn ptr_eq(&self, other: &ChainLink) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn downgrade(&self) -> WeakLink {
        WeakLink {
            inner: Rc::downgrade(&self.inner),
        }
    }

    /// Point this link at a new owner, or detach it with `None`.
    ///
    /// If another chain currently owns the link, that chain is asked to
    /// release it first; a refusal leaves the link untouched and returns
    /// [`ChainError::AdoptionRefused`].
    pub fn bind(&self, chain: Option<&Chain>) -> ChainResult<()> {
        if let (Some(next), Some(current)) = (chain, self.chain()) {
            if !current.ptr_eq(next) && !current.on_link_adopted_by_another_chain(self, next) {
                return Err(ChainError::AdoptionRefused {
                    link: self.inner.name.clone(),
                });
            }
        }

        *self.inner.owner.borrow_mut() = chain.map(Chain::downgrade);

        match (chain, self.state()) {
            (Some(_), _) => self.set_state(LinkState::Bound),
            (None, LinkState::Bound | LinkState::Running) => self.set_state(LinkState::Unbound),
            (None, _) => {}
        }
        Ok(())
    }

    /// Run the link's start hook.
    ///
    /// An error from the hook is converted into a failure report to the
    /// owning chain, so nothing raised by the hook escapes this call. The only
    /// errors returned are structural ones from the chain itself.
    pub fn start(&self) -> ChainResult<()> {
        self.inner.attempts.set(self.inner.attempts.get() + 1);
        self.set_state(LinkState::Running);

        let outcome = match self.inner.work.try_borrow_mut() {
            Ok(mut work) => work.on_start(self),
            Err(_) => Err(anyhow!(
                "link {} restarted while its start hook was still running",
                self.inner.name
            )),
        };

        match outcome {
            Ok(()) => Ok(()),
            Err(error) => self.fail(error),
        }
    }

    /// Report success to the owning chain. A no-op once detached.
    pub fn complete(&self) -> ChainResult<()> {
        match self.chain() {
            Some(chain) => chain.on_link_complete(self),
            None => {
                obs::emit_late_signal(self.id(), self.name(), "complete");
                Ok(())
            }
        }
    }

    /// Report failure to the owning chain. A no-op once detached.
    pub fn fail(&self, reason: impl Into<anyhow::Error>) -> ChainResult<()> {
        match self.chain() {
            Some(chain) => chain.on_link_failure(self, reason.into()),
            None => {
                obs::emit_late_signal(self.id(), self.name(), "fail");
                Ok(())
            }
        }
    }

    pub(crate) fn set_state(&self, state: LinkState) {
        self.inner.state.set(state);
    }

    /// Detach without consulting the current owner.
    pub(crate) fn detach(&self) {
        *self.inner.owner.borrow_mut() = None;
        if matches!(self.state(), LinkState::Bound | LinkState::Running) {
            self.set_state(LinkState::Unbound);
        }
    }

    /// Deliver the cancellation notice of an abandoned ordered run.
    pub(crate) fn cancel_due_to_failure(&self) {
        self.detach();
        self.set_state(LinkState::Cancelled);

        match self.inner.work.try_borrow_mut() {
            Ok(mut work) => work.on_cancelled_due_to_failure(self),
            Err(_) => {
                tracing::debug!(link = %self.inner.name, "cancel hook skipped, start hook still running")
            }
        }
    }
}

impl fmt::Debug for ChainLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChainLink")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("state", &self.state())
            .field("bound", &self.is_bound())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Idle;

    impl LinkWork for Idle {
        fn on_start(&mut self, _link: &ChainLink) -> anyhow::Result<()> {
            Ok(())
        }
    }

    struct Broken;

    impl LinkWork for Broken {
        fn on_start(&mut self, _link: &ChainLink) -> anyhow::Result<()> {
            Err(anyhow!("setup failed"))
        }
    }

    #[test]
    fn test_new_link_is_unbound() {
        let link = ChainLink::new("idle", Idle);
        assert_eq!(link.name(), "idle");
        assert_eq!(link.state(), LinkState::Unbound);
        assert!(!link.is_bound());
        assert_eq!(link.attempts(), 0);
    }

    #[test]
    fn test_unbound_reports_are_noops() {
        let link = ChainLink::new("idle", Idle);
        link.complete().unwrap();
        link.fail(anyhow!("ignored")).unwrap();
        assert_eq!(link.state(), LinkState::Unbound);
    }

    #[test]
    fn test_start_unbound_swallows_hook_error() {
        let link = ChainLink::new("broken", Broken);
        link.start().unwrap();
        assert_eq!(link.state(), LinkState::Running);
        link.start().unwrap();
        assert_eq!(link.attempts(), 2);
    }

    #[test]
    fn test_bind_and_unbind_update_state() {
        let chain = Chain::new();
        let link = ChainLink::new("idle", Idle);

        link.bind(Some(&chain)).unwrap();
        assert_eq!(link.state(), LinkState::Bound);
        assert!(link.chain().unwrap().ptr_eq(&chain));

        link.bind(None).unwrap();
        assert_eq!(link.state(), LinkState::Unbound);
        assert!(link.chain().is_none());
    }

    #[test]
    fn test_owner_dropped_means_unbound() {
        let link = ChainLink::new("idle", Idle);
        {
            let chain = Chain::new();
            link.bind(Some(&chain)).unwrap();
        }
        assert!(!link.is_bound());
    }

    #[test]
    fn test_weak_link_upgrade() {
        let link = ChainLink::new("idle", Idle);
        let weak = link.downgrade();
        assert!(weak.upgrade().unwrap().ptr_eq(&link));
        drop(link);
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn test_resolved_states() {
        assert!(LinkState::Completed.is_resolved());
        assert!(LinkState::Failed.is_resolved());
        assert!(LinkState::Cancelled.is_resolved());
        assert!(!LinkState::Running.is_resolved());
    }
}
