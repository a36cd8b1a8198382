#![forbid(unsafe_code)]

//! Callback-to-deferred adapters for the two external services the
//! pipeline needs: file reading and timers.
//!
//! Both are thin: they create a [`Deferred`] whose initializer hands the
//! work to the current [`EventLoop`] and settles from the completion
//! callback. Nothing here touches `Deferred` internals.

use std::fs;
use std::path::PathBuf;

use tracing::debug;
use web_time::Duration;

use crate::deferred::Deferred;
use crate::error::DeferredError;
use crate::event_loop::EventLoop;

/// Read a UTF-8 text file without blocking the loop.
///
/// The read runs on a worker thread. The result fulfills with the file
/// contents or rejects with [`DeferredError::Io`] (including
/// `InvalidData` for non-UTF-8 content).
pub fn read_to_string(path: impl Into<PathBuf>) -> Deferred<String, DeferredError> {
    let path = path.into();
    Deferred::new(move |resolver| {
        let worker_path = path.clone();
        let spawn_path = path.clone();
        EventLoop::current()
            .spawn_blocking(
                move || fs::read_to_string(&worker_path),
                move |completed| {
                    let outcome = match completed {
                        Ok(Ok(text)) => {
                            debug!(
                                path = %path.display(),
                                bytes = text.len(),
                                "read_to_string.done"
                            );
                            Ok(text)
                        }
                        Ok(Err(source)) => Err(DeferredError::io(&path, source)),
                        Err(panic) => Err(DeferredError::worker_panicked(
                            format!("read {}", path.display()),
                            panic.as_ref(),
                        )),
                    };
                    resolver.settle(outcome);
                },
            )
            .map(|_job| ())
            .map_err(|source| DeferredError::io(&spawn_path, source))
    })
}

/// Fulfill with `value` once `duration` has elapsed on the loop's clock.
pub fn delay<T, E>(duration: Duration, value: T) -> Deferred<T, E>
where
    T: Clone + 'static,
    E: Clone + 'static,
{
    Deferred::new(move |resolver| {
        EventLoop::current().set_timeout(duration, move || {
            resolver.fulfill(value);
        });
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, LabClock};
    use crate::deferred::DeferredState;
    use std::io::Write;

    #[test]
    fn read_to_string_fulfills_with_contents() {
        let event_loop = EventLoop::new();
        let _guard = event_loop.enter();

        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        write!(file, "hello deferred").expect("write temp file");

        let text = read_to_string(file.path());
        assert_eq!(text.state(), DeferredState::Pending);

        event_loop.run();
        assert_eq!(text.value().as_deref(), Some("hello deferred"));
    }

    #[test]
    fn read_to_string_rejects_missing_file() {
        let event_loop = EventLoop::new();
        let _guard = event_loop.enter();
        let dir = tempfile::tempdir().expect("temp dir");
        let missing = dir.path().join("does-not-exist.txt");

        let text = read_to_string(&missing);
        event_loop.run();

        let reason = text.reason().expect("missing file rejects");
        assert_eq!(reason.io_kind(), Some(std::io::ErrorKind::NotFound));
        assert!(reason.to_string().contains("does-not-exist.txt"));
    }

    #[test]
    fn read_to_string_rejects_invalid_utf8() {
        let event_loop = EventLoop::new();
        let _guard = event_loop.enter();
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        file.write_all(&[0xff, 0xfe, 0xfd]).expect("write temp file");

        let text = read_to_string(file.path());
        event_loop.run();

        let reason = text.reason().expect("invalid utf-8 rejects");
        assert_eq!(reason.io_kind(), Some(std::io::ErrorKind::InvalidData));
    }

    #[test]
    fn delay_fulfills_after_duration() {
        let clock = LabClock::new();
        let event_loop = EventLoop::with_clock(Clock::Lab(clock.clone()));
        let _guard = event_loop.enter();

        let delayed = delay::<_, String>(Duration::from_millis(2000), "later");
        event_loop.run_until_idle();
        assert_eq!(delayed.state(), DeferredState::Pending);

        clock.advance(Duration::from_millis(1999));
        event_loop.run_until_idle();
        assert_eq!(delayed.state(), DeferredState::Pending);

        clock.advance(Duration::from_millis(1));
        event_loop.run_until_idle();
        assert_eq!(delayed.value(), Some("later"));
    }

    #[test]
    fn delay_timer_starts_when_initializer_runs() {
        let clock = LabClock::new();
        let event_loop = EventLoop::with_clock(Clock::Lab(clock.clone()));
        let _guard = event_loop.enter();

        let delayed = delay::<_, String>(Duration::from_millis(10), 1_u8);
        assert_eq!(event_loop.pending_timers(), 0);
        event_loop.run_until_idle();
        assert_eq!(event_loop.pending_timers(), 1);

        event_loop.run();
        assert_eq!(delayed.value(), Some(1));
        assert_eq!(clock.elapsed(), Duration::from_millis(10));
    }
}
