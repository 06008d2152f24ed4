//! One-shot, re-armable timer running its callback on a dedicated thread
//!
//! The callback returns the delay before it should fire again, or `None`
//! to let the timer end. `stop()` cancels a pending deadline and joins the
//! thread, so once it returns the callback is guaranteed not to be running.

use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

struct TimerState {
    deadline: Option<Instant>,
    stopped: bool,
}

struct TimerShared {
    state: Mutex<TimerState>,
    cond: Condvar,
}

/// Timer handle; dropping it stops the timer
pub struct Timer {
    shared: Arc<TimerShared>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Timer {
    /// Start a timer firing `callback` after `delay`.
    pub fn start<F>(name: &str, delay: Duration, mut callback: F) -> io::Result<Self>
    where
        F: FnMut() -> Option<Duration> + Send + 'static,
    {
        let shared = Arc::new(TimerShared {
            state: Mutex::new(TimerState {
                deadline: Some(Instant::now() + delay),
                stopped: false,
            }),
            cond: Condvar::new(),
        });

        let worker = Arc::clone(&shared);
        let handle = thread::Builder::new().name(name.to_string()).spawn(move || loop {
            {
                let mut state = worker.state.lock();
                loop {
                    if state.stopped {
                        return;
                    }
                    match state.deadline {
                        None => return,
                        Some(deadline) if Instant::now() >= deadline => {
                            state.deadline = None;
                            break;
                        }
                        Some(deadline) => {
                            worker.cond.wait_until(&mut state, deadline);
                        }
                    }
                }
            }

            let Some(next) = callback() else {
                return;
            };

            let mut state = worker.state.lock();
            if state.stopped {
                return;
            }
            state.deadline = Some(Instant::now() + next);
        })?;

        Ok(Self {
            shared,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Cancel the timer and wait for its thread to exit.
    ///
    /// Must not be called from within the callback.
    pub fn stop(&self) {
        {
            let mut state = self.shared.state.lock();
            state.stopped = true;
            state.deadline = None;
        }
        self.shared.cond.notify_all();

        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.stop();
    }
}
