#![forbid(unsafe_code)]

//! Settle-once deferred values for single-threaded, callback-driven code.
//!
//! - [`Deferred`]: a value that is not known yet. Producers settle it once
//!   through a [`Resolver`]; consumers attach reactions with
//!   [`then`](Deferred::then), [`catch`](Deferred::catch),
//!   [`subscribe`](Deferred::subscribe) and [`always`](Deferred::always),
//!   each returning a new chained `Deferred`.
//! - [`EventLoop`]: the macrotask loop that runs producer initializers,
//!   timers and blocking-job completions.
//! - [`adapters`]: file reading and delays expressed as deferred values.
//!
//! # Example
//!
//! ```
//! use deferred_core::{Deferred, EventLoop};
//!
//! let event_loop = EventLoop::new();
//! let answer = Deferred::<i32, String>::new_in(&event_loop, |resolver| {
//!     resolver.fulfill(41);
//!     Ok(())
//! })
//! .then(|v| Ok(v + 1));
//!
//! // The initializer has not run yet.
//! assert!(!answer.is_settled());
//!
//! event_loop.run();
//! assert_eq!(answer.value(), Some(42));
//! ```

pub mod adapters;
pub mod clock;
pub mod deferred;
pub mod error;
pub mod event_loop;

pub use adapters::{delay, read_to_string};
pub use clock::{Clock, LabClock};
pub use deferred::{Deferred, DeferredState, IntoStep, Resolver, Step, Thenable};
pub use error::DeferredError;
pub use event_loop::{EnterGuard, EventLoop, JobId, RunSummary, TimerId};
