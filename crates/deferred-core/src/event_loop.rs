#![forbid(unsafe_code)]

//! Single-threaded macrotask loop.
//!
//! Deferred values never run producer code inside the call that created
//! them; the initializer is queued here instead and runs once the caller's
//! stack has unwound and the loop gets control back.
//!
//! # Sources of work
//!
//! - **Macrotasks** ([`EventLoop::schedule`]): strict FIFO.
//! - **Timers** ([`EventLoop::set_timeout`]): become macrotasks once the
//!   loop's [`Clock`] reaches their deadline. Equal deadlines keep
//!   registration order.
//! - **Blocking jobs** ([`EventLoop::spawn_blocking`]): run on a worker
//!   thread; the result crosses back over an `mpsc` channel and the
//!   completion callback runs on the loop thread as a macrotask.
//!
//! # Invariants
//!
//! 1. Tasks run one at a time, on the thread that owns the loop.
//! 2. No `RefCell` borrow of loop state is held while a task runs, so
//!    tasks may freely schedule more work.
//! 3. A lab-clock loop never sleeps: `run()` jumps virtual time to the next
//!    timer deadline when nothing else is ready.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::thread;

use tracing::trace;
use web_time::{Duration, Instant};

use crate::clock::Clock;

type Task = Box<dyn FnOnce()>;
type JobPayload = thread::Result<Box<dyn Any + Send>>;
type JobHandler = Box<dyn FnOnce(JobPayload)>;

static NEXT_LOOP_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static CURRENT: RefCell<Option<EventLoop>> = const { RefCell::new(None) };
}

/// Identifier of a pending timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

/// Identifier of a blocking job handed to a worker thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JobId(u64);

/// Counters describing one `run` / `run_until_idle` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// Macrotasks executed, including fired timers and job completions.
    pub tasks_run: u64,
    /// Timers whose deadline was reached.
    pub timers_fired: u64,
    /// Blocking jobs whose result was delivered back to the loop.
    pub jobs_completed: u64,
}

struct JobDone {
    id: u64,
    payload: JobPayload,
}

struct LoopInner {
    id: u64,
    clock: Clock,
    tasks: RefCell<VecDeque<Task>>,
    /// Keyed by `(deadline, seq)` so equal deadlines pop in registration order.
    timers: RefCell<BTreeMap<(Instant, u64), Task>>,
    jobs: RefCell<HashMap<u64, JobHandler>>,
    next_seq: Cell<u64>,
    done_tx: mpsc::Sender<JobDone>,
    done_rx: mpsc::Receiver<JobDone>,
}

/// A single-threaded macrotask loop.
///
/// Cloning an `EventLoop` creates a new handle to the **same** queues.
#[derive(Clone)]
pub struct EventLoop {
    inner: Rc<LoopInner>,
}

impl fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLoop")
            .field("id", &self.inner.id)
            .field("clock", &self.inner.clock)
            .field("tasks", &self.pending_tasks())
            .field("timers", &self.pending_timers())
            .field("jobs", &self.pending_jobs())
            .finish()
    }
}

impl Default for EventLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl EventLoop {
    /// Create a loop driven by wall-clock time.
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock(Clock::Real)
    }

    /// Create a loop reading time from `clock`.
    #[must_use]
    pub fn with_clock(clock: Clock) -> Self {
        let (done_tx, done_rx) = mpsc::channel();
        Self {
            inner: Rc::new(LoopInner {
                id: NEXT_LOOP_ID.fetch_add(1, Ordering::Relaxed),
                clock,
                tasks: RefCell::new(VecDeque::new()),
                timers: RefCell::new(BTreeMap::new()),
                jobs: RefCell::new(HashMap::new()),
                next_seq: Cell::new(0),
                done_tx,
                done_rx,
            }),
        }
    }

    /// The loop installed on this thread, creating a wall-clock loop on
    /// first use.
    #[must_use]
    pub fn current() -> Self {
        CURRENT.with(|slot| {
            slot.borrow_mut()
                .get_or_insert_with(EventLoop::new)
                .clone()
        })
    }

    /// Install this loop as the thread's current loop until the returned
    /// guard is dropped.
    #[must_use = "the loop is only current while the guard is alive"]
    pub fn enter(&self) -> EnterGuard {
        let previous = CURRENT.with(|slot| slot.borrow_mut().replace(self.clone()));
        EnterGuard { previous }
    }

    /// Unique identifier for this loop (for tracing).
    #[inline]
    #[must_use]
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Current time according to the loop's clock.
    #[must_use]
    pub fn now(&self) -> Instant {
        self.inner.clock.now()
    }

    /// The loop's time source.
    #[must_use]
    pub fn clock(&self) -> &Clock {
        &self.inner.clock
    }

    // ── Scheduling ───────────────────────────────────────────────────

    /// Queue `task` to run after every task queued before it.
    pub fn schedule(&self, task: impl FnOnce() + 'static) {
        self.inner.tasks.borrow_mut().push_back(Box::new(task));
    }

    /// Run `task` once `delay` has elapsed on the loop's clock.
    pub fn set_timeout(&self, delay: Duration, task: impl FnOnce() + 'static) -> TimerId {
        let seq = self.next_seq();
        let deadline = self.now() + delay;
        self.inner
            .timers
            .borrow_mut()
            .insert((deadline, seq), Box::new(task));
        trace!(loop_id = self.inner.id, timer = seq, delay_us = delay.as_micros() as u64, "timer.set");
        TimerId(seq)
    }

    /// Run `work` on a worker thread and deliver its result to
    /// `on_complete` on this loop's thread.
    ///
    /// If `work` panics, `on_complete` receives the panic payload as `Err`.
    pub fn spawn_blocking<R, W, C>(&self, work: W, on_complete: C) -> io::Result<JobId>
    where
        R: Send + 'static,
        W: FnOnce() -> R + Send + 'static,
        C: FnOnce(thread::Result<R>) + 'static,
    {
        let id = self.next_seq();
        let tx = self.inner.done_tx.clone();
        thread::Builder::new()
            .name(format!("deferred-worker-{id}"))
            .spawn(move || {
                let payload = panic::catch_unwind(AssertUnwindSafe(work))
                    .map(|value| Box::new(value) as Box<dyn Any + Send>);
                // The loop may already be gone; nobody is left to notify.
                let _ = tx.send(JobDone { id, payload });
            })?;

        let handler: JobHandler = Box::new(move |payload| match payload {
            Ok(boxed) => match boxed.downcast::<R>() {
                Ok(value) => on_complete(Ok(*value)),
                Err(other) => on_complete(Err(other)),
            },
            Err(panic) => on_complete(Err(panic)),
        });
        self.inner.jobs.borrow_mut().insert(id, handler);
        trace!(loop_id = self.inner.id, job = id, "job.spawned");
        Ok(JobId(id))
    }

    // ── Introspection ────────────────────────────────────────────────

    /// Macrotasks ready to run now.
    #[must_use]
    pub fn pending_tasks(&self) -> usize {
        self.inner.tasks.borrow().len()
    }

    /// Timers not yet fired.
    #[must_use]
    pub fn pending_timers(&self) -> usize {
        self.inner.timers.borrow().len()
    }

    /// Blocking jobs whose completion has not been delivered yet.
    #[must_use]
    pub fn pending_jobs(&self) -> usize {
        self.inner.jobs.borrow().len()
    }

    /// Whether there is no queued, timed or outstanding work at all.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.pending_tasks() == 0 && self.pending_timers() == 0 && self.pending_jobs() == 0
    }

    // ── Driving ──────────────────────────────────────────────────────

    /// Run at most one ready macrotask.
    ///
    /// Finished jobs and due timers are moved onto the task queue first.
    /// Returns `true` if a task ran.
    pub fn turn(&self) -> bool {
        let mut summary = RunSummary::default();
        self.harvest(&mut summary);
        self.run_one(&mut summary)
    }

    /// Run every task that is ready now, including tasks those tasks
    /// schedule. Never waits and never advances the clock.
    pub fn run_until_idle(&self) -> RunSummary {
        let mut summary = RunSummary::default();
        loop {
            self.harvest(&mut summary);
            if !self.run_one(&mut summary) {
                return summary;
            }
        }
    }

    /// Run until no tasks, timers or jobs remain.
    ///
    /// With a real clock this blocks until the next timer deadline or job
    /// completion. With a lab clock, outstanding jobs are waited for first
    /// and then time jumps to the next deadline.
    pub fn run(&self) -> RunSummary {
        let mut summary = RunSummary::default();
        loop {
            self.harvest(&mut summary);
            if self.run_one(&mut summary) {
                continue;
            }

            let next_deadline = self.next_deadline();
            let jobs_outstanding = self.pending_jobs() > 0;
            match (next_deadline, &self.inner.clock) {
                (None, _) if !jobs_outstanding => break,
                (Some(deadline), Clock::Lab(lab)) if !jobs_outstanding => {
                    lab.advance_to(deadline);
                }
                // Lab time stands still while real work is outstanding.
                (_, Clock::Lab(_)) => self.wait_for_job(None, &mut summary),
                (deadline, Clock::Real) => self.wait_for_job(deadline, &mut summary),
            }
        }
        trace!(
            loop_id = self.inner.id,
            tasks_run = summary.tasks_run,
            timers_fired = summary.timers_fired,
            jobs_completed = summary.jobs_completed,
            "loop.idle"
        );
        summary
    }

    fn next_seq(&self) -> u64 {
        let seq = self.inner.next_seq.get();
        self.inner.next_seq.set(seq + 1);
        seq
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.inner
            .timers
            .borrow()
            .first_key_value()
            .map(|((deadline, _), _)| *deadline)
    }

    fn run_one(&self, summary: &mut RunSummary) -> bool {
        let task = self.inner.tasks.borrow_mut().pop_front();
        match task {
            Some(task) => {
                trace!(loop_id = self.inner.id, "macrotask.run");
                task();
                summary.tasks_run += 1;
                true
            }
            None => false,
        }
    }

    /// Move finished jobs and due timers onto the task queue.
    fn harvest(&self, summary: &mut RunSummary) {
        while let Ok(done) = self.inner.done_rx.try_recv() {
            self.deliver(done, summary);
        }

        let now = self.now();
        loop {
            let due = {
                let mut timers = self.inner.timers.borrow_mut();
                let is_due = timers
                    .first_key_value()
                    .is_some_and(|((deadline, _), _)| *deadline <= now);
                if is_due { timers.pop_first() } else { None }
            };
            let Some(((_, seq), task)) = due else {
                break;
            };
            trace!(loop_id = self.inner.id, timer = seq, "timer.fired");
            summary.timers_fired += 1;
            self.inner.tasks.borrow_mut().push_back(task);
        }
    }

    fn deliver(&self, done: JobDone, summary: &mut RunSummary) {
        let handler = self.inner.jobs.borrow_mut().remove(&done.id);
        if let Some(handler) = handler {
            trace!(loop_id = self.inner.id, job = done.id, ok = done.payload.is_ok(), "job.completed");
            summary.jobs_completed += 1;
            let payload = done.payload;
            self.schedule(move || handler(payload));
        }
    }

    /// Block until a job completes or `deadline` passes.
    fn wait_for_job(&self, deadline: Option<Instant>, summary: &mut RunSummary) {
        let received = match deadline {
            Some(deadline) => {
                let timeout = deadline.saturating_duration_since(self.now());
                if timeout.is_zero() {
                    return;
                }
                if self.pending_jobs() == 0 {
                    thread::sleep(timeout);
                    return;
                }
                self.inner.done_rx.recv_timeout(timeout).ok()
            }
            // The loop holds a sender itself, so this cannot disconnect.
            None => self.inner.done_rx.recv().ok(),
        };
        if let Some(done) = received {
            self.deliver(done, summary);
        }
    }
}

/// Restores the previously current loop when dropped.
#[derive(Debug)]
pub struct EnterGuard {
    previous: Option<EventLoop>,
}

impl Drop for EnterGuard {
    fn drop(&mut self) {
        let previous = self.previous.take();
        CURRENT.with(|slot| *slot.borrow_mut() = previous);
    }
}
