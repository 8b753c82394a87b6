// Bounded polling for event-loop driven backends

use std::time::{Duration, Instant};

/// Wall-clock budget for connecting to, or pulling from, an event-loop backend
pub const EVENT_LOOP_TIMEOUT: Duration = Duration::from_millis(5000);

/// Result of one step of an event source
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Progress<T> {
    /// Nothing decisive happened yet, keep driving
    Pending,
    Done(T),
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitOutcome<T> {
    Done(T),
    Failed(String),
    TimedOut(Duration),
}

/// Drive `step` until it reports completion or failure, or until `timeout`
/// has elapsed.
///
/// `step` is expected to service the event source itself (iterate a mainloop,
/// sleep briefly) and then evaluate its predicate. It always runs at least once.
pub fn drive_until<T, F>(timeout: Duration, mut step: F) -> WaitOutcome<T>
where
    F: FnMut() -> Progress<T>,
{
    let start = Instant::now();
    loop {
        match step() {
            Progress::Done(value) => return WaitOutcome::Done(value),
            Progress::Failed(reason) => return WaitOutcome::Failed(reason),
            Progress::Pending => {}
        }

        let elapsed = start.elapsed();
        if elapsed >= timeout {
            return WaitOutcome::TimedOut(elapsed);
        }
    }
}
