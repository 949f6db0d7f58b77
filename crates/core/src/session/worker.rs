use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use tracing::debug;

use crate::{RemixError, Result};

/// Cancellation signal handed to a loop body. Fires when the worker is
/// stopped or dropped.
pub type CancelSignal = Receiver<()>;

struct Running<S> {
    cancel: Sender<()>,
    handle: JoinHandle<(S, Result<()>)>,
}

/// Runs a cancellable loop on a named thread.
///
/// The loop state moves onto the thread while running and comes back when
/// the loop is stopped, so it can be restarted later where it left off. A
/// body that ends with an error is reported by the next [`LoopWorker::stop`].
pub struct LoopWorker<S: Send + 'static> {
    name: &'static str,
    state: Option<S>,
    running: Option<Running<S>>,
}

impl<S: Send + 'static> LoopWorker<S> {
    pub fn new(name: &'static str, state: S) -> Self {
        Self {
            name,
            state: Some(state),
            running: None,
        }
    }

    /// True while the loop thread is alive.
    pub fn is_running(&self) -> bool {
        self.running
            .as_ref()
            .is_some_and(|running| !running.handle.is_finished())
    }

    /// True when the loop ended on its own and has not been stopped yet.
    pub fn is_finished(&self) -> bool {
        self.running
            .as_ref()
            .is_some_and(|running| running.handle.is_finished())
    }

    /// True when no thread is attached, before the first start or after a
    /// stop.
    pub fn is_idle(&self) -> bool {
        self.running.is_none()
    }

    /// Loop state, available while the worker is stopped.
    pub fn state(&self) -> Option<&S> {
        self.state.as_ref()
    }

    /// Spawns `body` on a new thread. Does nothing if the loop is already
    /// running. `body` should return once the cancel signal fires. A loop
    /// that already ended is collected first and its error returned.
    pub fn start<F>(&mut self, body: F) -> Result<()>
    where
        F: FnOnce(&mut S, &CancelSignal) -> Result<()> + Send + 'static,
    {
        if self.is_running() {
            return Ok(());
        }
        self.stop()?;

        let mut state = self
            .state
            .take()
            .ok_or(RemixError::WorkerPanicked(self.name))?;
        let (cancel, cancelled) = crossbeam_channel::bounded::<()>(1);

        let handle = thread::Builder::new()
            .name(self.name.into())
            .spawn(move || {
                let outcome = body(&mut state, &cancelled);
                (state, outcome)
            })?;

        debug!(worker = self.name, "loop started");
        self.running = Some(Running { cancel, handle });
        Ok(())
    }

    /// Cancels the loop and waits for it to hand its state back. Calls that
    /// are in flight on the loop thread finish first. Returns the error the
    /// loop ended with, if any; the state is restored either way.
    pub fn stop(&mut self) -> Result<()> {
        let Some(Running { cancel, handle }) = self.running.take() else {
            return Ok(());
        };

        // Dropping the sender wakes every pending receive on the signal.
        drop(cancel);
        let (state, outcome) = handle
            .join()
            .map_err(|_| RemixError::WorkerPanicked(self.name))?;

        debug!(worker = self.name, failed = outcome.is_err(), "loop stopped");
        self.state = Some(state);
        outcome
    }
}

impl<S: Send + 'static> Drop for LoopWorker<S> {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

impl<S: Send + 'static> std::fmt::Debug for LoopWorker<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopWorker")
            .field("name", &self.name)
            .field("running", &self.is_running())
            .finish()
    }
}

/// Sleeps for `seconds` unless cancelled first. Returns `true` when the
/// sleep was cut short by cancellation.
pub fn sleep_or_cancel(cancel: &CancelSignal, seconds: f64) -> bool {
    if seconds.is_nan() || seconds <= 0.0 {
        return is_cancelled(cancel);
    }

    let timeout = Duration::try_from_secs_f64(seconds).unwrap_or(Duration::MAX);
    !matches!(cancel.recv_timeout(timeout), Err(RecvTimeoutError::Timeout))
}

pub fn is_cancelled(cancel: &CancelSignal) -> bool {
    !matches!(
        cancel.try_recv(),
        Err(crossbeam_channel::TryRecvError::Empty)
    )
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;

    #[test]
    fn stopping_returns_the_loop_state() {
        let mut worker = LoopWorker::new("counter", 0u32);
        worker
            .start(|count, cancel| {
                while !sleep_or_cancel(cancel, 0.001) {
                    *count += 1;
                }
                Ok(())
            })
            .unwrap();
        assert!(worker.is_running());
        assert!(worker.state().is_none());

        thread::sleep(Duration::from_millis(20));
        worker.stop().unwrap();
        assert!(!worker.is_running());
        let after_first = *worker.state().unwrap();
        assert!(after_first > 0);

        worker
            .start(|count, _cancel| {
                *count += 1000;
                Ok(())
            })
            .unwrap();
        worker.stop().unwrap();
        assert_eq!(*worker.state().unwrap(), after_first + 1000);
    }

    #[test]
    fn cancellation_interrupts_long_sleeps() {
        let mut worker = LoopWorker::new("sleeper", false);
        worker
            .start(|cancelled, cancel| {
                *cancelled = sleep_or_cancel(cancel, 3600.0);
                Ok(())
            })
            .unwrap();

        let began = Instant::now();
        worker.stop().unwrap();
        assert!(began.elapsed() < Duration::from_secs(5));
        assert_eq!(worker.state(), Some(&true));
    }

    #[test]
    fn panicking_loop_is_reported() {
        let mut worker = LoopWorker::new("doomed", ());
        worker.start(|_, _| panic!("boom")).unwrap();

        assert!(matches!(
            worker.stop(),
            Err(RemixError::WorkerPanicked("doomed"))
        ));
        assert!(matches!(
            worker.start(|_, _| Ok(())),
            Err(RemixError::WorkerPanicked("doomed"))
        ));
    }

    #[test]
    fn loop_that_fails_reports_its_error_on_stop() {
        let mut worker = LoopWorker::new("failing", 0u32);
        worker
            .start(|attempts, _| {
                *attempts += 1;
                Err(RemixError::msg("out of beats"))
            })
            .unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while !worker.is_finished() {
            assert!(Instant::now() < deadline, "loop never ended");
            thread::sleep(Duration::from_millis(1));
        }
        assert!(!worker.is_running());
        assert!(!worker.is_idle());

        let err = worker.stop().unwrap_err();
        assert_eq!(err.to_string(), "out of beats");
        assert!(worker.is_idle());
        assert_eq!(worker.state(), Some(&1));
    }

    #[test]
    fn restarting_a_failed_loop_surfaces_the_failure_first() {
        let mut worker = LoopWorker::new("failing", ());
        worker.start(|_, _| Err(RemixError::msg("first run failed"))).unwrap();
        while !worker.is_finished() {
            thread::sleep(Duration::from_millis(1));
        }

        assert!(worker.start(|_, _| Ok(())).is_err());
        assert!(worker.is_idle());
        worker.start(|_, _| Ok(())).unwrap();
        worker.stop().unwrap();
    }

    #[test]
    fn elapsed_sleep_is_not_a_cancellation() {
        let (_cancel, cancelled) = crossbeam_channel::bounded::<()>(1);
        assert!(!sleep_or_cancel(&cancelled, 0.001));
        assert!(!sleep_or_cancel(&cancelled, -1.0));
    }
}
