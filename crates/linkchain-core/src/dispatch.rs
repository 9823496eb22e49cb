//! Control-thread dispatch.
//!
//! A [`Dispatcher`] is built once by the host and owned by the control
//! thread. It queues callbacks for "later" and is the single place where work
//! finished on other threads is marshalled back onto the control thread:
//!
//! - [`Dispatcher::defer`] queues a control-thread callback.
//! - [`RemoteDispatcher`] is the `Send` side other threads use to queue
//!   `Send` callbacks.
//! - [`LinkResolver`] carries exactly one terminal report for one start of a
//!   link from any thread; the report is applied when the control thread next
//!   calls [`Dispatcher::run_pending`].
//!
//! A callback that returns an error is logged and counted, never propagated.

use crate::ids::LinkId;
use crate::link::{ChainLink, WeakLink};
use crate::obs;
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use tokio::sync::mpsc;
use tracing::{debug, error};

type LocalCallback = Box<dyn FnOnce() -> anyhow::Result<()>>;
type RemoteCallback = Box<dyn FnOnce() -> anyhow::Result<()> + Send>;

enum RemoteMessage {
    Call(RemoteCallback),
    Resolve {
        token: u64,
        outcome: anyhow::Result<()>,
    },
    /// A resolver was dropped without reporting.
    Forget { token: u64 },
}

/// The link a resolver reports for, and which start of it.
struct PendingResolution {
    link: WeakLink,
    attempt: u64,
}

/// Queue of work to run on the control thread.
pub struct Dispatcher {
    local: RefCell<VecDeque<LocalCallback>>,
    tx: mpsc::UnboundedSender<RemoteMessage>,
    rx: RefCell<mpsc::UnboundedReceiver<RemoteMessage>>,
    next_token: Cell<u64>,
    resolvers: RefCell<HashMap<u64, PendingResolution>>,
    failed: Cell<u64>,
}

impl Dispatcher {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            local: RefCell::new(VecDeque::new()),
            tx,
            rx: RefCell::new(rx),
            next_token: Cell::new(0),
            resolvers: RefCell::new(HashMap::new()),
            failed: Cell::new(0),
        }
    }

    /// Queue `callback` to run on the next [`run_pending`](Self::run_pending).
    pub fn defer(&self, callback: impl FnOnce() -> anyhow::Result<()> + 'static) {
        self.local.borrow_mut().push_back(Box::new(callback));
    }

    /// A handle other threads can use to queue work onto this dispatcher.
    pub fn remote(&self) -> RemoteDispatcher {
        RemoteDispatcher {
            tx: self.tx.clone(),
        }
    }

    /// A one-shot reporter for the current start of `link`, usable from any
    /// thread.
    ///
    /// Create it once the link has started, usually inside its start hook. A
    /// report that arrives after the link was started again is dropped as a
    /// late signal.
    pub fn resolver(&self, link: &ChainLink) -> LinkResolver {
        let token = self.next_token.get();
        self.next_token.set(token + 1);
        self.resolvers.borrow_mut().insert(
            token,
            PendingResolution {
                link: link.downgrade(),
                attempt: link.attempts(),
            },
        );
        LinkResolver {
            token,
            link: link.id(),
            tx: self.tx.clone(),
            sent: false,
        }
    }

    /// Run everything queued so far on the calling thread.
    ///
    /// Local callbacks queued while draining wait for the next call; remote
    /// messages that arrive during the drain are handled in it. Returns the
    /// number of callbacks and link reports processed.
    pub fn run_pending(&self) -> usize {
        let batch: Vec<LocalCallback> = self.local.borrow_mut().drain(..).collect();
        let mut ran = batch.len();
        for callback in batch {
            if let Err(err) = callback() {
                self.report(err);
            }
        }

        loop {
            let message = match self.rx.borrow_mut().try_recv() {
                Ok(message) => message,
                Err(_) => break,
            };

            let outcome = match message {
                RemoteMessage::Call(callback) => callback(),
                RemoteMessage::Resolve { token, outcome } => self.apply_resolution(token, outcome),
                RemoteMessage::Forget { token } => {
                    self.resolvers.borrow_mut().remove(&token);
                    continue;
                }
            };
            ran += 1;
            if let Err(err) = outcome {
                self.report(err);
            }
        }

        ran
    }

    /// Number of local callbacks waiting to run.
    pub fn pending(&self) -> usize {
        self.local.borrow().len()
    }

    /// Number of callbacks that returned an error so far.
    pub fn failed_callbacks(&self) -> u64 {
        self.failed.get()
    }

    pub(crate) fn outstanding_resolvers(&self) -> usize {
        self.resolvers.borrow().len()
    }

    fn apply_resolution(&self, token: u64, outcome: anyhow::Result<()>) -> anyhow::Result<()> {
        let pending = self.resolvers.borrow_mut().remove(&token);
        let Some((link, attempt)) =
            pending.and_then(|pending| pending.link.upgrade().map(|link| (link, pending.attempt)))
        else {
            debug!(token, "resolution for unknown or dropped link ignored");
            return Ok(());
        };

        let signal = if outcome.is_ok() { "complete" } else { "fail" };
        if link.attempts() != attempt {
            obs::emit_late_signal(link.id(), link.name(), signal);
            return Ok(());
        }

        match outcome {
            Ok(()) => link.complete()?,
            Err(reason) => link.fail(reason)?,
        }
        Ok(())
    }

    fn report(&self, err: anyhow::Error) {
        self.failed.set(self.failed.get() + 1);
        error!(error = %format!("{err:#}"), "dispatched callback failed");
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

/// Thread-safe handle for queueing work onto a [`Dispatcher`].
#[derive(Clone)]
pub struct RemoteDispatcher {
    tx: mpsc::UnboundedSender<RemoteMessage>,
}

impl RemoteDispatcher {
    /// Queue `callback`. Returns `false` if the dispatcher is gone.
    pub fn call(&self, callback: impl FnOnce() -> anyhow::Result<()> + Send + 'static) -> bool {
        self.tx
            .send(RemoteMessage::Call(Box::new(callback)))
            .is_ok()
    }
}

/// Carries one terminal report for a link back to the control thread.
///
/// Consumed by [`complete`](Self::complete) or [`fail`](Self::fail), so a
/// resolver can report at most once. Dropping it unsent releases its slot in
/// the dispatcher.
pub struct LinkResolver {
    token: u64,
    link: LinkId,
    tx: mpsc::UnboundedSender<RemoteMessage>,
    sent: bool,
}

impl LinkResolver {
    pub fn link_id(&self) -> LinkId {
        self.link
    }

    pub fn complete(self) -> bool {
        self.send(Ok(()))
    }

    pub fn fail(self, reason: impl Into<anyhow::Error>) -> bool {
        self.send(Err(reason.into()))
    }

    fn send(mut self, outcome: anyhow::Result<()>) -> bool {
        self.sent = true;
        self.tx
            .send(RemoteMessage::Resolve {
                token: self.token,
                outcome,
            })
            .is_ok()
    }
}

impl Drop for LinkResolver {
    fn drop(&mut self) {
        if !self.sent {
            let _ = self.tx.send(RemoteMessage::Forget { token: self.token });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::links::FnLink;
    use anyhow::anyhow;
    use std::rc::Rc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_defer_runs_on_next_drain() {
        let dispatcher = Dispatcher::new();
        let hits = Rc::new(Cell::new(0));

        let inner = Rc::clone(&hits);
        dispatcher.defer(move || {
            inner.set(inner.get() + 1);
            Ok(())
        });

        assert_eq!(hits.get(), 0);
        assert_eq!(dispatcher.pending(), 1);
        assert_eq!(dispatcher.run_pending(), 1);
        assert_eq!(hits.get(), 1);
        assert_eq!(dispatcher.run_pending(), 0);
    }

    #[test]
    fn test_callbacks_queued_while_draining_wait() {
        let dispatcher = Rc::new(Dispatcher::new());
        let hits = Rc::new(Cell::new(0));

        let weak = Rc::downgrade(&dispatcher);
        let inner = Rc::clone(&hits);
        dispatcher.defer(move || {
            if let Some(dispatcher) = weak.upgrade() {
                dispatcher.defer(move || {
                    inner.set(inner.get() + 1);
                    Ok(())
                });
            }
            Ok(())
        });

        assert_eq!(dispatcher.run_pending(), 1);
        assert_eq!(hits.get(), 0);
        assert_eq!(dispatcher.run_pending(), 1);
        assert_eq!(hits.get(), 1);
    }

    #[test]
    fn test_failing_callback_is_counted_not_propagated() {
        let dispatcher = Dispatcher::new();
        dispatcher.defer(|| Err(anyhow!("boom")));
        dispatcher.defer(|| Ok(()));

        assert_eq!(dispatcher.run_pending(), 2);
        assert_eq!(dispatcher.failed_callbacks(), 1);
    }

    #[test]
    fn test_remote_calls_from_other_thread() {
        let dispatcher = Dispatcher::new();
        let remote = dispatcher.remote();
        let hits = Arc::new(AtomicUsize::new(0));

        let inner = Arc::clone(&hits);
        std::thread::spawn(move || {
            remote.call(move || {
                inner.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        })
        .join()
        .unwrap();

        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert_eq!(dispatcher.run_pending(), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unsent_resolvers_are_forgotten() {
        let dispatcher = Dispatcher::new();
        let link = FnLink::new(|_| Ok(())).into_link("abandoned");

        for _ in 0..1000 {
            drop(dispatcher.resolver(&link));
        }
        assert_eq!(dispatcher.outstanding_resolvers(), 1000);

        assert_eq!(dispatcher.run_pending(), 0);
        assert_eq!(dispatcher.outstanding_resolvers(), 0);
    }

    #[test]
    fn test_sent_resolver_releases_its_slot() {
        let dispatcher = Dispatcher::new();
        let link = FnLink::new(|_| Ok(())).into_link("detached");

        let resolver = dispatcher.resolver(&link);
        assert_eq!(dispatcher.outstanding_resolvers(), 1);
        assert!(resolver.complete());

        assert_eq!(dispatcher.run_pending(), 1);
        assert_eq!(dispatcher.outstanding_resolvers(), 0);
        assert_eq!(dispatcher.failed_callbacks(), 0);
    }

    #[test]
    fn test_remote_call_fails_after_dispatcher_dropped() {
        let dispatcher = Dispatcher::new();
        let remote = dispatcher.remote();
        drop(dispatcher);
        assert!(!remote.call(|| Ok(())));
    }
}
