//! The chain: runs a set of links either all at once or strictly in order,
//! aggregates their failures, and fires exactly one terminal callback per run.
//!
//! All calls are expected on one control thread. Nothing here blocks; a chain
//! returns from [`Chain::start`] as soon as the current batch is issued and
//! resumes inside whichever link report settles the next step.

use crate::error::{ChainError, ChainResult};
use crate::event::ChainEvent;
use crate::failure::{FailureReport, LinkFailure};
use crate::ids::{ChainId, RunId};
use crate::link::{ChainLink, LinkState};
use crate::obs;
use crate::subscribers::{SubscriptionId, Subscribers};
use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// What a chain does when another chain tries to bind one of its links.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AdoptionPolicy {
    /// Release the link to the new owner (last bind wins).
    #[default]
    Release,
    /// Keep links this chain holds; the rebind fails.
    Refuse,
}

/// Terminal outcome of one run.
#[derive(Debug, Clone)]
pub enum RunOutcome {
    Completed,
    Failed(FailureReport),
}

impl RunOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, RunOutcome::Completed)
    }

    pub fn into_result(self) -> Result<(), FailureReport> {
        match self {
            RunOutcome::Completed => Ok(()),
            RunOutcome::Failed(report) => Err(report),
        }
    }
}

type CompleteCallback = Rc<dyn Fn()>;
type FailureCallback = Rc<dyn Fn(FailureReport)>;

struct ChainState {
    links: Vec<ChainLink>,
    causes: Vec<LinkFailure>,
    locked: bool,
    in_order: bool,
    adoption: AdoptionPolicy,
    run_id: Option<RunId>,
    on_complete: Option<CompleteCallback>,
    on_failure: Option<FailureCallback>,
    waiter: Option<oneshot::Sender<RunOutcome>>,
}

struct ChainInner {
    id: ChainId,
    state: RefCell<ChainState>,
    observers: Subscribers<ChainEvent>,
}

/// Handle to a chain. Clones refer to the same chain.
#[derive(Clone)]
pub struct Chain {
    inner: Rc<ChainInner>,
}

#[derive(Clone)]
pub(crate) struct WeakChain {
    inner: Weak<ChainInner>,
}

impl WeakChain {
    pub(crate) fn upgrade(&self) -> Option<Chain> {
        self.inner.upgrade().map(|inner| Chain { inner })
    }
}

/// Scheduling decision taken after a link resolves.
enum Next {
    StartLink(ChainLink),
    Wait,
    Complete,
    Fail,
    Abandon(Vec<ChainLink>),
}

impl Chain {
    /// An empty, unordered chain.
    pub fn new() -> Self {
        Self {
            inner: Rc::new(ChainInner {
                id: ChainId::new(),
                state: RefCell::new(ChainState {
                    links: Vec::new(),
                    causes: Vec::new(),
                    locked: false,
                    in_order: false,
                    adoption: AdoptionPolicy::default(),
                    run_id: None,
                    on_complete: None,
                    on_failure: None,
                    waiter: None,
                }),
                observers: Subscribers::new(),
            }),
        }
    }

    /// An empty chain whose links run one at a time.
    pub fn ordered() -> Self {
        let chain = Self::new();
        chain.inner.state.borrow_mut().in_order = true;
        chain
    }

    pub fn id(&self) -> ChainId {
        self.inner.id
    }

    pub fn in_order(&self) -> bool {
        self.inner.state.borrow().in_order
    }

    /// Choose the scheduling discipline for the next run.
    pub fn set_in_order(&self, in_order: bool) -> ChainResult<()> {
        let mut state = self.inner.state.borrow_mut();
        if state.locked {
            return Err(ChainError::Locked { op: "set_in_order" });
        }
        state.in_order = in_order;
        Ok(())
    }

    pub fn adoption_policy(&self) -> AdoptionPolicy {
        self.inner.state.borrow().adoption
    }

    pub fn set_adoption_policy(&self, policy: AdoptionPolicy) {
        self.inner.state.borrow_mut().adoption = policy;
    }

    pub fn set_on_complete(&self, callback: impl Fn() + 'static) {
        self.inner.state.borrow_mut().on_complete = Some(Rc::new(callback));
    }

    pub fn set_on_failure(&self, callback: impl Fn(FailureReport) + 'static) {
        self.inner.state.borrow_mut().on_failure = Some(Rc::new(callback));
    }

    pub fn subscribe(&self, observer: impl Fn(&ChainEvent) + 'static) -> SubscriptionId {
        self.inner.observers.subscribe(observer)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.observers.unsubscribe(id)
    }

    /// Number of links still tracked.
    pub fn len(&self) -> usize {
        self.inner.state.borrow().links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.state.borrow().links.is_empty()
    }

    pub fn is_locked(&self) -> bool {
        self.inner.state.borrow().locked
    }

    /// Tracked links in insertion order.
    pub fn links(&self) -> Vec<ChainLink> {
        self.inner.state.borrow().links.clone()
    }

    pub fn contains(&self, link: &ChainLink) -> bool {
        self.inner
            .state
            .borrow()
            .links
            .iter()
            .any(|held| held.ptr_eq(link))
    }

    /// Id of the run in progress, if the chain is locked.
    pub fn current_run(&self) -> Option<RunId> {
        let state = self.inner.state.borrow();
        if state.locked {
            state.run_id
        } else {
            None
        }
    }

    pub fn ptr_eq(&self, other: &Chain) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn downgrade(&self) -> WeakChain {
        WeakChain {
            inner: Rc::downgrade(&self.inner),
        }
    }

    /// Append a link and bind it to this chain.
    ///
    /// A link owned by another chain is taken over, subject to that chain's
    /// [`AdoptionPolicy`].
    pub fn add(&self, link: &ChainLink) -> ChainResult<()> {
        {
            let state = self.inner.state.borrow();
            if state.locked {
                return Err(ChainError::Locked { op: "add" });
            }
            if state.links.iter().any(|held| held.ptr_eq(link)) {
                return Err(ChainError::AlreadyMember {
                    link: link.name().to_string(),
                });
            }
        }

        link.bind(Some(self))?;
        self.inner.state.borrow_mut().links.push(link.clone());
        Ok(())
    }

    /// Drop every link and detach it from this chain.
    pub fn clear(&self) -> ChainResult<()> {
        let links = {
            let mut state = self.inner.state.borrow_mut();
            if state.locked {
                return Err(ChainError::Locked { op: "clear" });
            }
            std::mem::take(&mut state.links)
        };

        for link in links {
            link.detach();
        }
        Ok(())
    }

    /// Begin a run.
    ///
    /// An empty chain completes immediately. Otherwise the chain locks and
    /// starts either every link (unordered) or just the first (ordered).
    pub fn start(&self) -> ChainResult<()> {
        let run_id = RunId::new();
        let (batch, links, in_order) = {
            let mut state = self.inner.state.borrow_mut();
            if state.locked {
                return Err(ChainError::Locked { op: "start" });
            }
            state.run_id = Some(run_id);
            state.locked = !state.links.is_empty();

            let batch: Vec<ChainLink> = if state.in_order {
                state.links.first().cloned().into_iter().collect()
            } else {
                state.links.clone()
            };
            (batch, state.links.len(), state.in_order)
        };

        let _span = obs::RunSpan::enter(self.id(), run_id);
        obs::emit_chain_started(self.id(), run_id, links, in_order);
        self.inner.observers.emit(&ChainEvent::Started {
            run_id,
            links,
            in_order,
        });

        if links == 0 {
            self.deliver_complete();
            return Ok(());
        }

        // Links in the batch may resolve synchronously and change the live set
        // before later entries are visited.
        for link in batch {
            if self.current_run() == Some(run_id) && self.contains(&link) {
                self.start_link(&link)?;
            }
        }
        Ok(())
    }

    /// Start the chain and wait for the terminal outcome of this run.
    ///
    /// Terminal callbacks and subscribers are still notified.
    pub async fn run(&self) -> ChainResult<RunOutcome> {
        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.inner.state.borrow_mut();
            if state.locked {
                return Err(ChainError::Locked { op: "run" });
            }
            state.waiter = Some(tx);
        }

        if let Err(error) = self.start() {
            self.inner.state.borrow_mut().waiter = None;
            return Err(error);
        }

        rx.await.map_err(|_| ChainError::Abandoned)
    }

    /// Accept a success report from `link`.
    ///
    /// Reports from links this chain no longer tracks, or never started, are
    /// dropped.
    pub fn on_link_complete(&self, link: &ChainLink) -> ChainResult<()> {
        let next = {
            let mut state = self.inner.state.borrow_mut();
            if !state.locked {
                return Err(ChainError::NotRunning { op: "complete" });
            }
            if Self::untrack(&mut state, link) {
                Some(Self::settle(&state))
            } else {
                None
            }
        };

        let Some(next) = next else {
            obs::emit_late_signal(link.id(), link.name(), "complete");
            return Ok(());
        };

        let _span = self.run_span();
        link.detach();
        link.set_state(LinkState::Completed);
        obs::emit_link_completed(link.id(), link.name());
        self.inner.observers.emit(&ChainEvent::LinkCompleted {
            link_id: link.id(),
            name: link.name().to_string(),
        });

        self.advance(next)
    }

    /// Accept a failure report from `link`.
    ///
    /// Ordered chains abandon the run at once; unordered chains wait for the
    /// remaining links before reporting.
    pub fn on_link_failure(&self, link: &ChainLink, error: anyhow::Error) -> ChainResult<()> {
        let reason = error.to_string();
        let next = {
            let mut state = self.inner.state.borrow_mut();
            if !state.locked {
                return Err(ChainError::NotRunning { op: "fail" });
            }
            if Self::untrack(&mut state, link) {
                state
                    .causes
                    .push(LinkFailure::new(link.id(), link.name(), error));
                if state.in_order && !state.links.is_empty() {
                    Some(Next::Abandon(std::mem::take(&mut state.links)))
                } else {
                    Some(Self::settle(&state))
                }
            } else {
                None
            }
        };

        let Some(next) = next else {
            obs::emit_late_signal(link.id(), link.name(), "fail");
            return Ok(());
        };

        let _span = self.run_span();
        link.detach();
        link.set_state(LinkState::Failed);
        obs::emit_link_failed(link.id(), link.name(), &reason);
        self.inner.observers.emit(&ChainEvent::LinkFailed {
            link_id: link.id(),
            name: link.name().to_string(),
            reason,
        });

        self.advance(next)
    }

    /// Asked by `link` before it binds to `other`. Returns whether this chain
    /// lets go of it.
    pub fn on_link_adopted_by_another_chain(&self, link: &ChainLink, other: &Chain) -> bool {
        let released = {
            let mut state = self.inner.state.borrow_mut();
            let position = state.links.iter().position(|held| held.ptr_eq(link));
            if state.adoption == AdoptionPolicy::Refuse && position.is_some() {
                warn!(
                    link = %link.name(),
                    chain_id = %self.id(),
                    other_chain_id = %other.id(),
                    "refused to release link to another chain"
                );
                return false;
            }
            position.map(|index| state.links.remove(index)).is_some()
        };

        if released {
            link.detach();
        }
        debug!(
            event = "link.adopted",
            link = %link.name(),
            from = %self.id(),
            to = %other.id(),
            was_tracked = released,
        );
        true
    }

    fn untrack(state: &mut ChainState, link: &ChainLink) -> bool {
        if link.state() != LinkState::Running {
            return false;
        }
        match state.links.iter().position(|held| held.ptr_eq(link)) {
            Some(index) => {
                state.links.remove(index);
                true
            }
            None => false,
        }
    }

    fn settle(state: &ChainState) -> Next {
        match state.links.first() {
            Some(first) if state.in_order => Next::StartLink(first.clone()),
            Some(_) => Next::Wait,
            None if state.causes.is_empty() => Next::Complete,
            None => Next::Fail,
        }
    }

    fn advance(&self, next: Next) -> ChainResult<()> {
        match next {
            Next::StartLink(link) => self.start_link(&link),
            Next::Wait => Ok(()),
            Next::Complete => {
                self.deliver_complete();
                Ok(())
            }
            Next::Fail => {
                self.deliver_failure();
                Ok(())
            }
            Next::Abandon(remaining) => {
                for link in remaining {
                    link.cancel_due_to_failure();
                    obs::emit_link_cancelled(link.id(), link.name());
                    self.inner.observers.emit(&ChainEvent::LinkCancelled {
                        link_id: link.id(),
                        name: link.name().to_string(),
                    });
                }
                self.deliver_failure();
                Ok(())
            }
        }
    }

    fn start_link(&self, link: &ChainLink) -> ChainResult<()> {
        obs::emit_link_started(link.id(), link.name());
        self.inner.observers.emit(&ChainEvent::LinkStarted {
            link_id: link.id(),
            name: link.name().to_string(),
        });
        link.start()
    }

    fn deliver_complete(&self) {
        let (run_id, callback, waiter) = {
            let mut state = self.inner.state.borrow_mut();
            state.locked = false;
            (
                state.run_id.take().unwrap_or_default(),
                state.on_complete.clone(),
                state.waiter.take(),
            )
        };

        obs::emit_chain_completed(self.id(), run_id);
        if let Some(callback) = callback {
            callback();
        }
        self.inner
            .observers
            .emit(&ChainEvent::Completed { run_id });
        if let Some(waiter) = waiter {
            let _ = waiter.send(RunOutcome::Completed);
        }
    }

    fn deliver_failure(&self) {
        let (run_id, report, callback, waiter) = {
            let mut state = self.inner.state.borrow_mut();
            state.locked = false;
            (
                state.run_id.take().unwrap_or_default(),
                FailureReport::new(std::mem::take(&mut state.causes)),
                state.on_failure.clone(),
                state.waiter.take(),
            )
        };

        obs::emit_chain_failed(self.id(), run_id, report.len());
        if let Some(callback) = callback {
            callback(report.clone());
        }
        self.inner.observers.emit(&ChainEvent::Failed {
            run_id,
            report: report.clone(),
        });
        if let Some(waiter) = waiter {
            let _ = waiter.send(RunOutcome::Failed(report));
        }
    }

    fn run_span(&self) -> Option<obs::RunSpan> {
        let run_id = self.inner.state.borrow().run_id;
        run_id.map(|run_id| obs::RunSpan::enter(self.id(), run_id))
    }
}

impl Default for Chain {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.borrow();
        f.debug_struct("Chain")
            .field("id", &self.inner.id)
            .field("links", &state.links.len())
            .field("locked", &state.locked)
            .field("in_order", &state.in_order)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::LinkWork;
    use anyhow::anyhow;
    use std::cell::Cell;

    struct Idle;

    impl LinkWork for Idle {
        fn on_start(&mut self, _link: &ChainLink) -> anyhow::Result<()> {
            Ok(())
        }
    }

    struct Instant;

    impl LinkWork for Instant {
        fn on_start(&mut self, link: &ChainLink) -> anyhow::Result<()> {
            link.complete()?;
            Ok(())
        }
    }

    fn counter(chain: &Chain) -> (Rc<Cell<u32>>, Rc<RefCell<Vec<String>>>) {
        let completes = Rc::new(Cell::new(0));
        let failures = Rc::new(RefCell::new(Vec::new()));
        {
            let completes = Rc::clone(&completes);
            chain.set_on_complete(move || completes.set(completes.get() + 1));
        }
        {
            let failures = Rc::clone(&failures);
            chain.set_on_failure(move |report| failures.borrow_mut().extend(report.reasons()));
        }
        (completes, failures)
    }

    #[test]
    fn test_empty_chain_completes_synchronously() {
        let chain = Chain::new();
        let (completes, failures) = counter(&chain);

        chain.start().unwrap();

        assert_eq!(completes.get(), 1);
        assert!(failures.borrow().is_empty());
        assert!(!chain.is_locked());
    }

    #[test]
    fn test_start_locks_until_links_resolve() {
        let chain = Chain::new();
        let (completes, _) = counter(&chain);
        let link = ChainLink::new("idle", Idle);
        chain.add(&link).unwrap();

        chain.start().unwrap();
        assert!(chain.is_locked());
        assert!(chain.current_run().is_some());
        assert_eq!(link.state(), LinkState::Running);

        link.complete().unwrap();
        assert!(!chain.is_locked());
        assert!(chain.is_empty());
        assert_eq!(completes.get(), 1);
        assert_eq!(link.state(), LinkState::Completed);
        assert!(!link.is_bound());
    }

    #[test]
    fn test_synchronous_links_complete_within_start() {
        let chain = Chain::new();
        let (completes, _) = counter(&chain);
        chain.add(&ChainLink::new("a", Instant)).unwrap();
        chain.add(&ChainLink::new("b", Instant)).unwrap();

        chain.start().unwrap();

        assert_eq!(completes.get(), 1);
        assert!(!chain.is_locked());
    }

    #[test]
    fn test_duplicate_add_rejected() {
        let chain = Chain::new();
        let link = ChainLink::new("idle", Idle);
        chain.add(&link).unwrap();

        let err = chain.add(&link).unwrap_err();
        assert!(matches!(err, ChainError::AlreadyMember { .. }));
        assert_eq!(chain.len(), 1);
    }

    #[test]
    fn test_clear_detaches_links() {
        let chain = Chain::new();
        let link = ChainLink::new("idle", Idle);
        chain.add(&link).unwrap();

        chain.clear().unwrap();

        assert!(chain.is_empty());
        assert!(!link.is_bound());
        assert_eq!(link.state(), LinkState::Unbound);
    }

    #[test]
    fn test_report_to_unlocked_chain_is_misuse() {
        let chain = Chain::new();
        let link = ChainLink::new("idle", Idle);
        chain.add(&link).unwrap();

        let err = link.complete().unwrap_err();
        assert!(matches!(err, ChainError::NotRunning { op: "complete" }));
        let err = link.fail(anyhow!("boom")).unwrap_err();
        assert!(matches!(err, ChainError::NotRunning { op: "fail" }));
    }

    #[test]
    fn test_set_in_order_rejected_while_locked() {
        let chain = Chain::new();
        chain.add(&ChainLink::new("idle", Idle)).unwrap();
        chain.start().unwrap();

        assert!(matches!(
            chain.set_in_order(true),
            Err(ChainError::Locked { op: "set_in_order" })
        ));
        assert!(!chain.in_order());
    }

    #[test]
    fn test_unstarted_link_report_is_ignored() {
        let chain = Chain::ordered();
        let (completes, _) = counter(&chain);
        let first = ChainLink::new("first", Idle);
        let second = ChainLink::new("second", Idle);
        chain.add(&first).unwrap();
        chain.add(&second).unwrap();
        chain.start().unwrap();

        second.complete().unwrap();

        assert_eq!(chain.len(), 2);
        assert_eq!(second.state(), LinkState::Bound);
        assert_eq!(completes.get(), 0);
    }

    #[test]
    fn test_refuse_policy_keeps_link() {
        let owner = Chain::new();
        owner.set_adoption_policy(AdoptionPolicy::Refuse);
        let thief = Chain::new();
        let link = ChainLink::new("idle", Idle);
        owner.add(&link).unwrap();

        let err = thief.add(&link).unwrap_err();

        assert!(matches!(err, ChainError::AdoptionRefused { .. }));
        assert!(owner.contains(&link));
        assert!(thief.is_empty());
        assert!(link.chain().unwrap().ptr_eq(&owner));
    }

    #[test]
    fn test_run_outcome_into_result() {
        assert!(RunOutcome::Completed.into_result().is_ok());
        let failed = RunOutcome::Failed(FailureReport::default());
        assert!(!failed.is_completed());
        assert!(failed.into_result().is_err());
    }
}
