//! [`Worker`] – a named OS thread running a fixed-interval tick with
//! cooperative cancellation.
//!
//! The thread checks a shared `AtomicBool` between ticks and while pacing, so
//! [`Worker::stop`] takes effect within one pacing slice once the current tick
//! returns.  A tick that blocks for longer than the join timeout causes
//! `stop` to detach the thread and report `false`.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

/// Longest single sleep while waiting for the next tick.
const PACING_SLICE: Duration = Duration::from_millis(5);

/// Poll period while waiting for a stopped thread to finish.
const JOIN_POLL: Duration = Duration::from_millis(1);

pub struct Worker {
    name: String,
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    /// Spawn a thread that calls `tick` every `interval` until stopped.
    ///
    /// Ticks are paced from their start time; a tick that overruns the
    /// interval is followed immediately by the next one.
    pub fn spawn<F>(name: impl Into<String>, interval: Duration, mut tick: F) -> io::Result<Self>
    where
        F: FnMut() + Send + 'static,
    {
        let name = name.into();
        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&shutdown);
        let thread_name = name.clone();

        let handle = thread::Builder::new().name(name.clone()).spawn(move || {
            debug!(worker = %thread_name, ?interval, "worker started");
            while !flag.load(Ordering::Acquire) {
                let started = Instant::now();
                tick();
                pace(started, interval, &flag);
            }
            debug!(worker = %thread_name, "worker exiting");
        })?;

        Ok(Self {
            name,
            shutdown,
            handle: Some(handle),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// `true` until the thread has exited.
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Ask the thread to stop without waiting for it.
    pub fn signal_stop(&self) {
        self.shutdown.store(true, Ordering::Release);
    }

    /// Signal stop and wait up to `join_timeout` for the thread to exit.
    ///
    /// Returns `false` if the thread is still running when the timeout
    /// expires; it is then detached and will exit on its own once its
    /// current tick returns.
    pub fn stop(mut self, join_timeout: Duration) -> bool {
        self.signal_stop();
        let Some(handle) = self.handle.take() else {
            return true;
        };

        let deadline = Instant::now() + join_timeout;
        while !handle.is_finished() {
            if Instant::now() >= deadline {
                warn!(worker = %self.name, ?join_timeout, "worker did not stop in time, detaching");
                return false;
            }
            thread::sleep(JOIN_POLL);
        }
        if handle.join().is_err() {
            warn!(worker = %self.name, "worker thread panicked");
        }
        true
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.signal_stop();
    }
}

/// Sleep until `started + interval`, waking early if `shutdown` is set.
fn pace(started: Instant, interval: Duration, shutdown: &AtomicBool) {
    let deadline = started + interval;
    loop {
        if shutdown.load(Ordering::Acquire) {
            return;
        }
        let now = Instant::now();
        if now >= deadline {
            return;
        }
        thread::sleep((deadline - now).min(PACING_SLICE));
    }
}
