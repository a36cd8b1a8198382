#![forbid(unsafe_code)]

//! Settle-once deferred values with chained reactions.
//!
//! # Design
//!
//! [`Deferred<T, E>`] wraps its lifecycle state, settled payload and two
//! queues (reactions and cleanup actions) in shared, reference-counted
//! storage. The producer side holds a [`Resolver`] to the same storage and
//! settles it exactly once. Subscribing returns a new child `Deferred` whose
//! outcome is computed from the parent's outcome and the reaction's return
//! value.
//!
//! # Invariants
//!
//! 1. The state leaves `Pending` at most once; later settlement calls are
//!    no-ops.
//! 2. The payload is `Ok(value)` iff fulfilled and `Err(reason)` iff
//!    rejected (stored as `Option<Result<T, E>>`, so never both).
//! 3. Every queued reaction and cleanup runs exactly once, in registration
//!    order, reactions before cleanups.
//! 4. Queues are moved out before any callback runs, so a subscription made
//!    during propagation takes the already-settled path instead of landing
//!    in the batch being drained.
//! 5. No `RefCell` borrow is held while user callbacks run.
//!
//! # Failure Modes
//!
//! - **Initializer returns `Err`**: the instance is rejected with that error.
//! - **Reaction returns `Err`**: the child is rejected with that error.
//! - **Resolver dropped unsettled**: the instance stays pending forever and
//!   its reactions never run. There is no cancellation.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, trace};

use crate::event_loop::EventLoop;

static NEXT_DEFERRED_ID: AtomicU64 = AtomicU64::new(1);

/// Queued callback receiving a copy of the parent's outcome.
type Reaction<T, E> = Box<dyn FnOnce(Result<T, E>)>;

// ─── State ───────────────────────────────────────────────────────────────────

/// Lifecycle state of a [`Deferred`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeferredState {
    /// Not yet settled.
    Pending,
    /// Settled with a value.
    Fulfilled,
    /// Settled with a reason.
    Rejected,
}

impl DeferredState {
    fn of<T, E>(outcome: Option<&Result<T, E>>) -> Self {
        match outcome {
            None => Self::Pending,
            Some(Ok(_)) => Self::Fulfilled,
            Some(Err(_)) => Self::Rejected,
        }
    }

    /// Whether this is a terminal state.
    #[inline]
    #[must_use]
    pub fn is_settled(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl fmt::Display for DeferredState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => f.write_str("pending"),
            Self::Fulfilled => f.write_str("fulfilled"),
            Self::Rejected => f.write_str("rejected"),
        }
    }
}

// ─── Thenable / Step ─────────────────────────────────────────────────────────

/// Anything that eventually produces a `Result<T, E>` and can report it.
///
/// A reaction that returns a `Thenable` does not settle its child directly;
/// the child follows the thenable's outcome instead. [`Deferred`] implements
/// this trait, and so can any other deferred-value type that wants to chain
/// with it.
pub trait Thenable<T, E> {
    /// Register `callback` to receive the outcome exactly once.
    ///
    /// If the outcome is already known, the callback may run before this
    /// method returns.
    fn on_settled(&self, callback: Box<dyn FnOnce(Result<T, E>)>);
}

/// What a reaction produced for its child.
pub enum Step<T, E> {
    /// Fulfill the child with this value.
    Ready(T),
    /// Reject the child with this reason.
    Fail(E),
    /// Settle the child to whatever this thenable settles to.
    Follow(Box<dyn Thenable<T, E>>),
}

impl<T: fmt::Debug, E: fmt::Debug> fmt::Debug for Step<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ready(value) => f.debug_tuple("Ready").field(value).finish(),
            Self::Fail(reason) => f.debug_tuple("Fail").field(reason).finish(),
            Self::Follow(_) => f.write_str("Follow(..)"),
        }
    }
}

/// Conversion from a reaction's return value into a [`Step`].
///
/// `Ok`/`Err` settle the child directly; a `Deferred` (or boxed
/// [`Thenable`]) is followed, which is how nested deferred values flatten.
pub trait IntoStep<E> {
    /// The child's fulfilled payload type.
    type Value;

    fn into_step(self) -> Step<Self::Value, E>;
}

impl<T, E> IntoStep<E> for Step<T, E> {
    type Value = T;

    fn into_step(self) -> Step<T, E> {
        self
    }
}

impl<T, E> IntoStep<E> for Result<T, E> {
    type Value = T;

    fn into_step(self) -> Step<T, E> {
        match self {
            Ok(value) => Step::Ready(value),
            Err(reason) => Step::Fail(reason),
        }
    }
}

impl<T: Clone + 'static, E: Clone + 'static> IntoStep<E> for Deferred<T, E> {
    type Value = T;

    fn into_step(self) -> Step<T, E> {
        Step::Follow(Box::new(self))
    }
}

impl<T, E> IntoStep<E> for Box<dyn Thenable<T, E>> {
    type Value = T;

    fn into_step(self) -> Step<T, E> {
        Step::Follow(self)
    }
}

// ─── Shared interior ─────────────────────────────────────────────────────────

struct DeferredInner<T, E> {
    id: u64,
    /// `None` while pending; written exactly once.
    outcome: Option<Result<T, E>>,
    reactions: Vec<Reaction<T, E>>,
    cleanups: Vec<Reaction<T, E>>,
}

type Shared<T, E> = Rc<RefCell<DeferredInner<T, E>>>;

fn new_shared<T, E>() -> Shared<T, E> {
    Rc::new(RefCell::new(DeferredInner {
        id: NEXT_DEFERRED_ID.fetch_add(1, Ordering::Relaxed),
        outcome: None,
        reactions: Vec::new(),
        cleanups: Vec::new(),
    }))
}

fn settle<T: Clone, E: Clone>(shared: &Shared<T, E>, outcome: Result<T, E>) -> bool {
    {
        let mut inner = shared.borrow_mut();
        if inner.outcome.is_some() {
            debug!(
                deferred_id = inner.id,
                state = %DeferredState::of(inner.outcome.as_ref()),
                attempted = %DeferredState::of(Some(&outcome)),
                "deferred.settle.ignored"
            );
            return false;
        }
        trace!(
            deferred_id = inner.id,
            state = %DeferredState::of(Some(&outcome)),
            reactions = inner.reactions.len(),
            cleanups = inner.cleanups.len(),
            "deferred.settle"
        );
        inner.outcome = Some(outcome);
    }
    propagate(shared);
    true
}

/// Drain both queues against the settled outcome.
fn propagate<T: Clone, E: Clone>(shared: &Shared<T, E>) {
    let (outcome, reactions, cleanups) = {
        let mut inner = shared.borrow_mut();
        let Some(outcome) = inner.outcome.clone() else {
            return;
        };
        let reactions = std::mem::take(&mut inner.reactions);
        let cleanups = std::mem::take(&mut inner.cleanups);
        (outcome, reactions, cleanups)
    };

    for reaction in reactions {
        reaction(outcome.clone());
    }
    for cleanup in cleanups {
        cleanup(outcome.clone());
    }
}

// ─── Deferred ────────────────────────────────────────────────────────────────

/// A value that will be known later, observed through chained reactions.
///
/// Cloning a `Deferred` creates a new handle to the **same** instance.
pub struct Deferred<T, E> {
    inner: Shared<T, E>,
}

impl<T, E> Clone for Deferred<T, E> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<T: fmt::Debug, E: fmt::Debug> fmt::Debug for Deferred<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("Deferred")
            .field("id", &inner.id)
            .field("state", &DeferredState::of(inner.outcome.as_ref()))
            .field("outcome", &inner.outcome)
            .field("reactions", &inner.reactions.len())
            .field("cleanups", &inner.cleanups.len())
            .finish()
    }
}

impl<T: Clone + 'static, E: Clone + 'static> Deferred<T, E> {
    // ── Constructors ─────────────────────────────────────────────────

    /// Create a pending instance and the resolver that settles it.
    #[must_use]
    pub fn pending() -> (Self, Resolver<T, E>) {
        let inner = new_shared();
        let resolver = Resolver {
            inner: Rc::clone(&inner),
        };
        (Self { inner }, resolver)
    }

    /// Create an instance whose `initializer` runs on the current thread's
    /// [`EventLoop`].
    ///
    /// The initializer is never called inside `new`; it runs as a macrotask
    /// once the loop gets control, so every subscription made by the caller
    /// in the meantime is registered before the producer can settle.
    /// Returning `Err(reason)` rejects the instance with `reason`.
    pub fn new<I>(initializer: I) -> Self
    where
        I: FnOnce(Resolver<T, E>) -> Result<(), E> + 'static,
    {
        Self::new_in(&EventLoop::current(), initializer)
    }

    /// Like [`new`](Self::new), scheduling the initializer on `event_loop`.
    pub fn new_in<I>(event_loop: &EventLoop, initializer: I) -> Self
    where
        I: FnOnce(Resolver<T, E>) -> Result<(), E> + 'static,
    {
        let (deferred, resolver) = Self::pending();
        event_loop.schedule(move || {
            if let Err(reason) = initializer(resolver.clone()) {
                resolver.reject(reason);
            }
        });
        deferred
    }

    /// An instance already fulfilled with `value`.
    #[must_use]
    pub fn of_value(value: T) -> Self {
        Self::settled(Ok(value))
    }

    /// An instance already rejected with `reason`.
    #[must_use]
    pub fn of_error(reason: E) -> Self {
        Self::settled(Err(reason))
    }

    /// An instance already settled to `outcome`.
    #[must_use]
    pub fn settled(outcome: Result<T, E>) -> Self {
        let (deferred, resolver) = Self::pending();
        resolver.settle(outcome);
        deferred
    }

    // ── Queries ──────────────────────────────────────────────────────

    /// Unique identifier for this instance (for tracing/logging).
    #[inline]
    #[must_use]
    pub fn id(&self) -> u64 {
        self.inner.borrow().id
    }

    #[must_use]
    pub fn state(&self) -> DeferredState {
        DeferredState::of(self.inner.borrow().outcome.as_ref())
    }

    #[must_use]
    pub fn is_settled(&self) -> bool {
        self.inner.borrow().outcome.is_some()
    }

    /// The fulfilled value, if fulfilled.
    #[must_use]
    pub fn value(&self) -> Option<T> {
        match &self.inner.borrow().outcome {
            Some(Ok(value)) => Some(value.clone()),
            _ => None,
        }
    }

    /// The rejection reason, if rejected.
    #[must_use]
    pub fn reason(&self) -> Option<E> {
        match &self.inner.borrow().outcome {
            Some(Err(reason)) => Some(reason.clone()),
            _ => None,
        }
    }

    /// The settled outcome, or `None` while pending.
    #[must_use]
    pub fn outcome(&self) -> Option<Result<T, E>> {
        self.inner.borrow().outcome.clone()
    }

    // ── Subscription ─────────────────────────────────────────────────

    /// React to both outcomes.
    ///
    /// Exactly one of the two callbacks runs, once, with the parent's
    /// payload. A rejection handler that returns `Ok` recovers: the child
    /// fulfills.
    pub fn subscribe<F, R, SF, SR>(&self, on_fulfilled: F, on_rejected: R) -> Deferred<SF::Value, E>
    where
        F: FnOnce(T) -> SF + 'static,
        R: FnOnce(E) -> SR + 'static,
        SF: IntoStep<E>,
        SR: IntoStep<E, Value = SF::Value>,
        SF::Value: Clone + 'static,
    {
        self.react(
            move |value| on_fulfilled(value).into_step(),
            move |reason| on_rejected(reason).into_step(),
        )
    }

    /// React to fulfillment. A rejection passes through to the child
    /// unchanged.
    pub fn then<F, S>(&self, on_fulfilled: F) -> Deferred<S::Value, E>
    where
        F: FnOnce(T) -> S + 'static,
        S: IntoStep<E>,
        S::Value: Clone + 'static,
    {
        self.react(move |value| on_fulfilled(value).into_step(), Step::Fail)
    }

    /// React to rejection. A fulfilled value passes through to the child
    /// unchanged.
    pub fn catch<F, S>(&self, on_rejected: F) -> Deferred<T, E>
    where
        F: FnOnce(E) -> S + 'static,
        S: IntoStep<E, Value = T>,
    {
        self.react(Step::Ready, move |reason| on_rejected(reason).into_step())
    }

    /// Subscribe without callbacks: the child mirrors this instance.
    #[must_use]
    pub fn follow(&self) -> Deferred<T, E> {
        self.react(Step::Ready, Step::Fail)
    }

    /// Run `action` once this instance settles, whatever the outcome.
    ///
    /// The returned child settles to the same outcome as this instance;
    /// `action` can observe settlement but cannot change it. If already
    /// settled, `action` runs before this method returns.
    pub fn always<F>(&self, action: F) -> Deferred<T, E>
    where
        F: FnOnce() + 'static,
    {
        let settled = self.outcome();
        if let Some(outcome) = settled {
            action();
            return Self::settled(outcome);
        }

        let (child, resolver) = Self::pending();
        self.inner
            .borrow_mut()
            .cleanups
            .push(Box::new(move |outcome: Result<T, E>| {
                action();
                resolver.settle(outcome);
            }));
        child
    }

    fn react<U, F, R>(&self, on_fulfilled: F, on_rejected: R) -> Deferred<U, E>
    where
        U: Clone + 'static,
        F: FnOnce(T) -> Step<U, E> + 'static,
        R: FnOnce(E) -> Step<U, E> + 'static,
    {
        let (child, resolver) = Deferred::pending();
        self.push_reaction(Box::new(move |outcome: Result<T, E>| {
            let step = match outcome {
                Ok(value) => on_fulfilled(value),
                Err(reason) => on_rejected(reason),
            };
            resolver.resolve(step);
        }));
        child
    }

    fn push_reaction(&self, reaction: Reaction<T, E>) {
        let settled = {
            let mut inner = self.inner.borrow_mut();
            inner.reactions.push(reaction);
            inner.outcome.is_some()
        };
        if settled {
            propagate(&self.inner);
        }
    }
}

impl<T: Clone + 'static, E: Clone + 'static> Thenable<T, E> for Deferred<T, E> {
    fn on_settled(&self, callback: Box<dyn FnOnce(Result<T, E>)>) {
        self.push_reaction(callback);
    }
}

// ─── Resolver ────────────────────────────────────────────────────────────────

/// Producer handle that settles a [`Deferred`].
///
/// Cheaply cloneable; all clones settle the same instance and the first
/// settlement wins.
pub struct Resolver<T, E> {
    inner: Shared<T, E>,
}

impl<T, E> Clone for Resolver<T, E> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<T, E> fmt::Debug for Resolver<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("Resolver")
            .field("deferred_id", &inner.id)
            .field("state", &DeferredState::of(inner.outcome.as_ref()))
            .finish()
    }
}

impl<T: Clone + 'static, E: Clone + 'static> Resolver<T, E> {
    /// Fulfill with `value`. Returns `false` if already settled.
    pub fn fulfill(&self, value: T) -> bool {
        settle(&self.inner, Ok(value))
    }

    /// Reject with `reason`. Returns `false` if already settled.
    pub fn reject(&self, reason: E) -> bool {
        settle(&self.inner, Err(reason))
    }

    /// Settle to `outcome`. Returns `false` if already settled.
    pub fn settle(&self, outcome: Result<T, E>) -> bool {
        settle(&self.inner, outcome)
    }

    /// Settle from anything a reaction could return.
    ///
    /// A thenable is followed: the instance settles when it does.
    pub fn resolve<S>(&self, step: S)
    where
        S: IntoStep<E, Value = T>,
    {
        match step.into_step() {
            Step::Ready(value) => {
                self.fulfill(value);
            }
            Step::Fail(reason) => {
                self.reject(reason);
            }
            Step::Follow(thenable) => {
                let resolver = self.clone();
                thenable.on_settled(Box::new(move |outcome: Result<T, E>| {
                    resolver.settle(outcome);
                }));
            }
        }
    }

    #[must_use]
    pub fn is_settled(&self) -> bool {
        self.inner.borrow().outcome.is_some()
    }

    /// A consumer handle to the instance this resolver settles.
    #[must_use]
    pub fn deferred(&self) -> Deferred<T, E> {
        Deferred {
            inner: Rc::clone(&self.inner),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
