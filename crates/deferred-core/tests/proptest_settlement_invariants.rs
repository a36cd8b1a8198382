#![forbid(unsafe_code)]

//! Property-based invariant tests for deferred settlement.
//!
//! These tests verify invariants that must hold for **any** sequence of
//! settlement calls and subscriptions:
//!
//! 1. Only the first settlement call has an effect.
//! 2. Reactions registered before settlement fire in registration order,
//!    each exactly once, followed by cleanup actions in their own order.
//! 3. Every child settles, and its outcome follows the propagation rules
//!    (passthrough, handler result, or mirror for cleanups).
//! 4. Subscriptions made after settlement behave exactly like those made
//!    before it.

use std::cell::RefCell;
use std::rc::Rc;

use deferred_core::{Deferred, DeferredState};
use proptest::prelude::*;

// ── Strategies ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
enum Settle {
    Fulfill(i32),
    Reject(i32),
}

#[derive(Debug, Clone, Copy)]
enum Subscription {
    Then,
    Catch,
    Both,
    Follow,
    Always,
}

fn settle_op() -> impl Strategy<Value = Settle> {
    prop_oneof![
        any::<i32>().prop_map(Settle::Fulfill),
        any::<i32>().prop_map(Settle::Reject),
    ]
}

fn settle_ops() -> impl Strategy<Value = Vec<Settle>> {
    proptest::collection::vec(settle_op(), 1..16)
}

fn subscriptions() -> impl Strategy<Value = Vec<Subscription>> {
    proptest::collection::vec(
        prop_oneof![
            Just(Subscription::Then),
            Just(Subscription::Catch),
            Just(Subscription::Both),
            Just(Subscription::Follow),
            Just(Subscription::Always),
        ],
        0..24,
    )
}

// ── Helpers ─────────────────────────────────────────────────────────────

type Fired = Rc<RefCell<Vec<usize>>>;

fn apply(resolver: &deferred_core::Resolver<i32, i32>, op: Settle) -> bool {
    match op {
        Settle::Fulfill(v) => resolver.fulfill(v),
        Settle::Reject(r) => resolver.reject(r),
    }
}

fn expected_outcome(op: Settle) -> Result<i32, i32> {
    match op {
        Settle::Fulfill(v) => Ok(v),
        Settle::Reject(r) => Err(r),
    }
}

/// Register `sub` as entry `index`; the callback that runs records `index`.
fn register(
    deferred: &Deferred<i32, i32>,
    sub: Subscription,
    index: usize,
    fired: &Fired,
) -> Deferred<i32, i32> {
    let fired = Rc::clone(fired);
    match sub {
        Subscription::Then => deferred.then(move |v| {
            fired.borrow_mut().push(index);
            Ok(v.wrapping_add(1))
        }),
        Subscription::Catch => deferred.catch(move |r| {
            fired.borrow_mut().push(index);
            Ok(r.wrapping_neg())
        }),
        Subscription::Both => {
            let fired_err = Rc::clone(&fired);
            deferred.subscribe(
                move |v| {
                    fired.borrow_mut().push(index);
                    Ok(v.wrapping_mul(2))
                },
                move |r| {
                    fired_err.borrow_mut().push(index);
                    Err(r.wrapping_sub(1))
                },
            )
        }
        Subscription::Follow => deferred.follow(),
        Subscription::Always => deferred.always(move || fired.borrow_mut().push(index)),
    }
}

/// Whether `sub` runs a callback for `outcome`.
fn fires(sub: Subscription, outcome: &Result<i32, i32>) -> bool {
    match sub {
        Subscription::Then => outcome.is_ok(),
        Subscription::Catch => outcome.is_err(),
        Subscription::Both | Subscription::Always => true,
        Subscription::Follow => false,
    }
}

fn child_outcome(sub: Subscription, outcome: &Result<i32, i32>) -> Result<i32, i32> {
    match (sub, *outcome) {
        (Subscription::Then, Ok(v)) => Ok(v.wrapping_add(1)),
        (Subscription::Catch, Err(r)) => Ok(r.wrapping_neg()),
        (Subscription::Both, Ok(v)) => Ok(v.wrapping_mul(2)),
        (Subscription::Both, Err(r)) => Err(r.wrapping_sub(1)),
        (_, passthrough) => passthrough,
    }
}

/// Reaction entries fire first in registration order, then cleanups.
fn expected_firing(subs: &[Subscription], outcome: &Result<i32, i32>) -> Vec<usize> {
    let reactions = subs
        .iter()
        .enumerate()
        .filter(|(_, s)| !matches!(s, Subscription::Always) && fires(**s, outcome))
        .map(|(i, _)| i);
    let cleanups = subs
        .iter()
        .enumerate()
        .filter(|(_, s)| matches!(s, Subscription::Always))
        .map(|(i, _)| i);
    reactions.chain(cleanups).collect()
}

// ═════════════════════════════════════════════════════════════════════════
// 1. Settle-once
// ═════════════════════════════════════════════════════════════════════════

proptest! {
    #[test]
    fn only_first_settlement_counts(ops in settle_ops()) {
        let (deferred, resolver) = Deferred::<i32, i32>::pending();

        let accepted: Vec<bool> = ops.iter().map(|op| apply(&resolver, *op)).collect();

        prop_assert!(accepted[0], "first settlement must be accepted");
        prop_assert!(accepted[1..].iter().all(|a| !a),
            "later settlements must be rejected: {:?}", accepted);

        let expected = expected_outcome(ops[0]);
        prop_assert_eq!(deferred.outcome(), Some(expected));
        prop_assert_eq!(deferred.value(), expected.ok());
        prop_assert_eq!(deferred.reason(), expected.err());
    }
}

proptest! {
    #[test]
    fn state_matches_single_settlement(ops in settle_ops()) {
        let (many, many_resolver) = Deferred::<i32, i32>::pending();
        let (once, once_resolver) = Deferred::<i32, i32>::pending();

        for op in &ops {
            apply(&many_resolver, *op);
        }
        apply(&once_resolver, ops[0]);

        prop_assert_eq!(many.state(), once.state());
        prop_assert_eq!(many.outcome(), once.outcome());
    }
}

// ═════════════════════════════════════════════════════════════════════════
// 2. Registration order, exactly once
// ═════════════════════════════════════════════════════════════════════════

proptest! {
    #[test]
    fn reactions_fire_in_order_exactly_once(
        subs in subscriptions(),
        ops in settle_ops()
    ) {
        let (deferred, resolver) = Deferred::<i32, i32>::pending();
        let fired: Fired = Rc::new(RefCell::new(Vec::new()));

        let children: Vec<_> = subs
            .iter()
            .enumerate()
            .map(|(i, sub)| register(&deferred, *sub, i, &fired))
            .collect();

        prop_assert!(fired.borrow().is_empty(), "nothing fires while pending");
        prop_assert!(children.iter().all(|c| c.state() == DeferredState::Pending));

        for op in &ops {
            apply(&resolver, *op);
        }

        let outcome = expected_outcome(ops[0]);
        prop_assert_eq!(&*fired.borrow(), &expected_firing(&subs, &outcome));

        for (sub, child) in subs.iter().zip(&children) {
            prop_assert_eq!(child.outcome(), Some(child_outcome(*sub, &outcome)),
                "child of {:?}", sub);
        }
    }
}

// ═════════════════════════════════════════════════════════════════════════
// 3. Late subscriptions behave like early ones
// ═════════════════════════════════════════════════════════════════════════

proptest! {
    #[test]
    fn late_subscriptions_fire_immediately(
        subs in subscriptions(),
        op in settle_op()
    ) {
        let (deferred, resolver) = Deferred::<i32, i32>::pending();
        apply(&resolver, op);
        let outcome = expected_outcome(op);

        let fired: Fired = Rc::new(RefCell::new(Vec::new()));
        for (i, sub) in subs.iter().enumerate() {
            let before = fired.borrow().len();
            let child = register(&deferred, *sub, i, &fired);
            let after = fired.borrow().len();

            prop_assert_eq!(after - before, usize::from(fires(*sub, &outcome)),
                "{:?} must fire synchronously iff its branch matches", sub);
            prop_assert_eq!(child.outcome(), Some(child_outcome(*sub, &outcome)));
        }
    }
}
