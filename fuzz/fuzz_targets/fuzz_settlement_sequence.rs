#![no_main]

use std::cell::Cell;
use std::rc::Rc;

use arbitrary::Arbitrary;
use deferred_core::{Deferred, EventLoop, Resolver};
use libfuzzer_sys::fuzz_target;

const MAX_SLOTS: usize = 64;

#[derive(Arbitrary, Debug)]
enum FuzzOp {
    /// New pending instance with an external resolver.
    Pending,
    /// New instance whose initializer runs on the loop.
    Spawn { fulfill: bool, payload: i16 },
    Fulfill { slot: u8, value: i16 },
    Reject { slot: u8, reason: i16 },
    Then { slot: u8 },
    Catch { slot: u8, recover: bool },
    Both { slot: u8 },
    Follow { slot: u8 },
    Always { slot: u8 },
    /// `then` returning another slot's instance.
    Flatten { slot: u8, inner: u8 },
    Turn,
    RunUntilIdle,
}

#[derive(Clone, Copy)]
enum Branch {
    Fulfilled,
    Rejected,
    Any,
}

struct Slot {
    deferred: Deferred<i32, i32>,
    resolver: Option<Resolver<i32, i32>>,
    first_seen: Option<Result<i32, i32>>,
}

struct Callback {
    parent: usize,
    branch: Branch,
    calls: Rc<Cell<u32>>,
}

struct Harness {
    event_loop: EventLoop,
    slots: Vec<Slot>,
    callbacks: Vec<Callback>,
}

impl Harness {
    fn pick(&self, slot: u8) -> Option<usize> {
        (!self.slots.is_empty()).then(|| usize::from(slot) % self.slots.len())
    }

    fn push(&mut self, deferred: Deferred<i32, i32>, resolver: Option<Resolver<i32, i32>>) {
        if self.slots.len() < MAX_SLOTS {
            self.slots.push(Slot {
                deferred,
                resolver,
                first_seen: None,
            });
        }
    }

    fn counter(&mut self, parent: usize, branch: Branch) -> Rc<Cell<u32>> {
        let calls = Rc::new(Cell::new(0));
        self.callbacks.push(Callback {
            parent,
            branch,
            calls: Rc::clone(&calls),
        });
        calls
    }

    fn apply(&mut self, op: FuzzOp) {
        match op {
            FuzzOp::Pending => {
                let (deferred, resolver) = Deferred::pending();
                self.push(deferred, Some(resolver));
            }
            FuzzOp::Spawn { fulfill, payload } => {
                let payload = i32::from(payload);
                let deferred = Deferred::new_in(&self.event_loop, move |resolver| {
                    if fulfill {
                        resolver.fulfill(payload);
                        Ok(())
                    } else {
                        Err(payload)
                    }
                });
                self.push(deferred, None);
            }
            FuzzOp::Fulfill { slot, value } => self.settle(slot, Ok(i32::from(value))),
            FuzzOp::Reject { slot, reason } => self.settle(slot, Err(i32::from(reason))),
            FuzzOp::Then { slot } => {
                let Some(i) = self.pick(slot) else { return };
                let calls = self.counter(i, Branch::Fulfilled);
                let child = self.slots[i].deferred.then(move |v| {
                    calls.set(calls.get() + 1);
                    Ok(v.wrapping_add(1))
                });
                self.push(child, None);
            }
            FuzzOp::Catch { slot, recover } => {
                let Some(i) = self.pick(slot) else { return };
                let calls = self.counter(i, Branch::Rejected);
                let child = self.slots[i].deferred.catch(move |r| {
                    calls.set(calls.get() + 1);
                    if recover { Ok(r) } else { Err(r.wrapping_sub(1)) }
                });
                self.push(child, None);
            }
            FuzzOp::Both { slot } => {
                let Some(i) = self.pick(slot) else { return };
                let calls = self.counter(i, Branch::Any);
                let on_err = Rc::clone(&calls);
                let child = self.slots[i].deferred.subscribe(
                    move |v| {
                        calls.set(calls.get() + 1);
                        Ok(v)
                    },
                    move |r| {
                        on_err.set(on_err.get() + 1);
                        Err(r)
                    },
                );
                self.push(child, None);
            }
            FuzzOp::Follow { slot } => {
                let Some(i) = self.pick(slot) else { return };
                let child = self.slots[i].deferred.follow();
                self.push(child, None);
            }
            FuzzOp::Always { slot } => {
                let Some(i) = self.pick(slot) else { return };
                let calls = self.counter(i, Branch::Any);
                let child = self.slots[i]
                    .deferred
                    .always(move || calls.set(calls.get() + 1));
                self.push(child, None);
            }
            FuzzOp::Flatten { slot, inner } => {
                let (Some(i), Some(j)) = (self.pick(slot), self.pick(inner)) else {
                    return;
                };
                let inner = self.slots[j].deferred.clone();
                let calls = self.counter(i, Branch::Fulfilled);
                let child = self.slots[i].deferred.then(move |_| {
                    calls.set(calls.get() + 1);
                    inner
                });
                self.push(child, None);
            }
            FuzzOp::Turn => {
                self.event_loop.turn();
            }
            FuzzOp::RunUntilIdle => {
                self.event_loop.run_until_idle();
            }
        }
    }

    fn settle(&mut self, slot: u8, outcome: Result<i32, i32>) {
        let Some(i) = self.pick(slot) else { return };
        let Some(resolver) = self.slots[i].resolver.as_ref() else {
            return;
        };
        let was_settled = self.slots[i].deferred.is_settled();
        let accepted = resolver.settle(outcome);
        assert_eq!(accepted, !was_settled, "settle accepted iff previously pending");
    }

    fn check(&mut self) {
        for slot in &mut self.slots {
            let outcome = slot.deferred.outcome();
            match slot.first_seen {
                Some(first) => assert_eq!(Some(first), outcome, "settled outcome changed"),
                None => slot.first_seen = outcome,
            }
            match outcome {
                Some(Ok(v)) => {
                    assert_eq!(slot.deferred.value(), Some(v));
                    assert_eq!(slot.deferred.reason(), None);
                }
                Some(Err(r)) => {
                    assert_eq!(slot.deferred.value(), None);
                    assert_eq!(slot.deferred.reason(), Some(r));
                }
                None => {
                    assert_eq!(slot.deferred.value(), None);
                    assert_eq!(slot.deferred.reason(), None);
                }
            }
        }

        for callback in &self.callbacks {
            let parent = self.slots[callback.parent].deferred.outcome();
            let expected = match (callback.branch, parent) {
                (_, None) => 0,
                (Branch::Any, Some(_)) => 1,
                (Branch::Fulfilled, Some(outcome)) => u32::from(outcome.is_ok()),
                (Branch::Rejected, Some(outcome)) => u32::from(outcome.is_err()),
            };
            assert_eq!(callback.calls.get(), expected, "callback ran wrong number of times");
        }
    }
}

fuzz_target!(|ops: Vec<FuzzOp>| {
    let mut harness = Harness {
        event_loop: EventLoop::new(),
        slots: Vec::new(),
        callbacks: Vec::new(),
    };
    for op in ops.into_iter().take(512) {
        harness.apply(op);
        harness.check();
    }
    harness.event_loop.run_until_idle();
    harness.check();
});
