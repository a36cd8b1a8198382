#![forbid(unsafe_code)]

//! The read → wait → strip vowels → print pipeline.
//!
//! Every step is a reaction on a deferred value. Output goes to two
//! caller-supplied writers so tests can capture it; the binary passes
//! stdout and stderr.

use std::cell::{Cell, RefCell};
use std::io::{self, Write};
use std::path::PathBuf;
use std::rc::Rc;

use deferred_core::{DeferredError, EventLoop, RunSummary, delay, read_to_string};
use tracing::{debug, info, warn};
use web_time::Duration;

use crate::error::{DemoError, Result};

/// Inputs for one pipeline run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    pub path: PathBuf,
    pub delay: Duration,
    pub preview_chars: usize,
}

impl PipelineConfig {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            delay: Duration::from_millis(2000),
            preview_chars: 200,
        }
    }
}

/// How a pipeline run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineStatus {
    /// The rejection handler ran.
    pub failed: bool,
    /// Time spent in the loop, on the loop's clock.
    pub elapsed: Duration,
    pub summary: RunSummary,
}

/// Remove lowercase ASCII vowels. Uppercase vowels are kept.
#[must_use]
pub fn strip_vowels(text: &str) -> String {
    text.chars()
        .filter(|c| !matches!(c, 'a' | 'e' | 'i' | 'o' | 'u'))
        .collect()
}

/// The first `max_chars` characters of `text`.
#[must_use]
pub fn preview(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((end, _)) => &text[..end],
        None => text,
    }
}

struct Console<O, E> {
    out: O,
    err: E,
    write_error: Option<io::Error>,
}

impl<O: Write, E: Write> Console<O, E> {
    fn out_line(&mut self, line: &str) {
        let result = writeln!(self.out, "{line}").and_then(|()| self.out.flush());
        self.record(result);
    }

    fn err_line(&mut self, line: &str) {
        let result = writeln!(self.err, "{line}").and_then(|()| self.err.flush());
        self.record(result);
    }

    /// Keep the first write failure; later writes are still attempted.
    fn record(&mut self, result: io::Result<()>) {
        if let Err(error) = result {
            self.write_error.get_or_insert(error);
        }
    }
}

/// Build the pipeline on `event_loop` and run the loop to completion.
///
/// Returns `Err` only if writing output failed. A failed read is reported
/// on `err` and through [`PipelineStatus::failed`].
pub fn run_pipeline<O, E>(
    event_loop: &EventLoop,
    config: &PipelineConfig,
    out: O,
    err: E,
) -> Result<PipelineStatus>
where
    O: Write + 'static,
    E: Write + 'static,
{
    let _entered = event_loop.enter();
    let console = Rc::new(RefCell::new(Console {
        out,
        err,
        write_error: None,
    }));
    let failed = Rc::new(Cell::new(false));
    let started = event_loop.now();

    let pause = config.delay;
    let preview_chars = config.preview_chars;
    let read_console = Rc::clone(&console);
    let print_console = Rc::clone(&console);
    let err_console = Rc::clone(&console);
    let done_console = Rc::clone(&console);
    let failed_flag = Rc::clone(&failed);

    let _done = read_to_string(&config.path)
        .then(move |text| {
            let chars = text.chars().count();
            info!(chars, "pipeline.read");
            read_console
                .borrow_mut()
                .out_line(&format!("{chars} characters read"));
            delay::<_, DeferredError>(pause, strip_vowels(&text))
        })
        .then(move |stripped| {
            print_console
                .borrow_mut()
                .out_line(preview(&stripped, preview_chars));
            Ok(())
        })
        .catch(move |error| {
            warn!(%error, "pipeline.failed");
            failed_flag.set(true);
            let mut console = err_console.borrow_mut();
            console.err_line("An error occurred!");
            console.err_line(&error.to_string());
            Ok(())
        })
        .always(move || done_console.borrow_mut().out_line("===All done==="));

    let summary = event_loop.run();
    let elapsed = event_loop.now().saturating_duration_since(started);
    debug!(
        tasks_run = summary.tasks_run,
        timers_fired = summary.timers_fired,
        jobs_completed = summary.jobs_completed,
        elapsed_ms = elapsed.as_millis() as u64,
        "pipeline.finished"
    );

    if let Some(error) = console.borrow_mut().write_error.take() {
        return Err(DemoError::Io(error));
    }
    Ok(PipelineStatus {
        failed: failed.get(),
        elapsed,
        summary,
    })
}
