// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Periodic callback scheduler.
//!
//! A single timer thread drives every registered callback at its own period,
//! with roughly millisecond granularity. The neighbor caches register their
//! maintenance sweeps here. Callbacks run outside the scheduler lock, so a
//! slow callback delays other callbacks but never deadlocks against code
//! that registers new ones.

use parking_lot::Condvar;
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use std::time::Instant;

/// A periodic callback scheduler backed by one timer thread.
pub struct Timer {
    inner: Arc<TimerInner>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

struct TimerInner {
    state: Mutex<TimerState>,
    wake: Condvar,
}

struct TimerState {
    tasks: Vec<Task>,
    stopped: bool,
}

struct Task {
    period: Duration,
    next_due: Instant,
    // Taken out of the slot while the callback runs so the lock is not held
    // across user code.
    callback: Option<Box<dyn FnMut() + Send>>,
}

impl Timer {
    /// Creates a scheduler with no registered callbacks and no thread.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(TimerInner {
                state: Mutex::new(TimerState {
                    tasks: Vec::new(),
                    stopped: false,
                }),
                wake: Condvar::new(),
            }),
            thread: Mutex::new(None),
        }
    }

    /// Registers `callback` to run every `period`, starting one period from
    /// now. Callbacks cannot be unregistered; they live as long as the
    /// scheduler.
    pub fn every(&self, period: Duration, callback: impl FnMut() + Send + 'static) {
        let mut state = self.inner.state.lock();
        state.tasks.push(Task {
            period,
            next_due: Instant::now() + period,
            callback: Some(Box::new(callback)),
        });
        self.inner.wake.notify_all();
    }

    /// Starts the timer thread. Idempotent.
    pub fn start(&self) -> std::io::Result<()> {
        let mut thread = self.thread.lock();
        if thread.is_some() {
            return Ok(());
        }
        let inner = self.inner.clone();
        *thread = Some(
            std::thread::Builder::new()
                .name("timer".into())
                .spawn(move || run(&inner))?,
        );
        Ok(())
    }

    /// Stops the timer thread and waits for it to exit. Idempotent.
    pub fn stop(&self) {
        {
            let mut state = self.inner.state.lock();
            state.stopped = true;
            self.inner.wake.notify_all();
        }
        if let Some(thread) = self.thread.lock().take() {
            let _ = thread.join();
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(inner: &TimerInner) {
    let mut state = inner.state.lock();
    loop {
        if state.stopped {
            break;
        }
        let now = Instant::now();
        let mut due_index = None;
        let mut earliest: Option<Instant> = None;
        for (index, task) in state.tasks.iter().enumerate() {
            if task.callback.is_none() {
                continue;
            }
            if task.next_due <= now {
                due_index = Some(index);
                break;
            }
            earliest = Some(match earliest {
                Some(deadline) => deadline.min(task.next_due),
                None => task.next_due,
            });
        }
        match due_index {
            Some(index) => {
                let mut callback = state.tasks[index].callback.take().unwrap();
                let period = state.tasks[index].period;
                let mut next_due = state.tasks[index].next_due;
                drop(state);

                callback();

                next_due += period;
                let now = Instant::now();
                if next_due <= now {
                    // The callback overran one or more periods; skip the
                    // missed ticks rather than firing a burst.
                    next_due = now + period;
                }
                state = inner.state.lock();
                state.tasks[index].callback = Some(callback);
                state.tasks[index].next_due = next_due;
            }
            None => match earliest {
                Some(deadline) => {
                    let _ = inner.wake.wait_until(&mut state, deadline);
                }
                None => inner.wake.wait(&mut state),
            },
        }
    }
}
