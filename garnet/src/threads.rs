use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use parking_lot::{Condvar, Mutex};

use crate::{Parker, RaiseError, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    Created,
    Running,
    Paused,
    Dead,
}

/// Requests other threads leave for a runtime thread. They only take
/// effect when the thread polls at a safe point.
#[derive(Debug, Default)]
pub struct ThreadInterrupt {
    kill: AtomicBool,
    pause: AtomicBool,
    parker: Parker,
}

impl ThreadInterrupt {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    #[inline]
    pub fn is_pending(&self) -> bool {
        self.kill.load(Ordering::Acquire) || self.pause.load(Ordering::Acquire)
    }

    pub fn request_kill(&self) {
        self.kill.store(true, Ordering::Release);
        self.parker.unpark();
    }

    pub fn pause(&self) {
        self.pause.store(true, Ordering::Release);
    }

    pub fn resume(&self) {
        self.pause.store(false, Ordering::Release);
        self.parker.unpark();
    }

    pub fn is_paused(&self) -> bool {
        self.pause.load(Ordering::Acquire)
    }

    /// Parks while paused. Returns true when the thread has to die.
    pub fn check_and_park(&self) -> bool {
        loop {
            if self.kill.load(Ordering::Acquire) {
                return true;
            }
            if !self.pause.load(Ordering::Acquire) {
                return false;
            }
            self.parker.park();
        }
    }
}

pub type ThreadOutcome = Result<Value, RaiseError>;

#[derive(Debug)]
pub struct ThreadShared {
    pub id: u64,
    pub state: Mutex<ThreadState>,
    pub interrupt: Arc<ThreadInterrupt>,
    outcome: Mutex<Option<ThreadOutcome>>,
    done: (Mutex<bool>, Condvar),
}

impl ThreadShared {
    pub fn new(id: u64) -> Arc<Self> {
        Arc::new(Self {
            id,
            state: Mutex::new(ThreadState::Created),
            interrupt: ThreadInterrupt::new(),
            outcome: Mutex::new(None),
            done: (Mutex::new(false), Condvar::new()),
        })
    }

    pub(crate) fn finish(&self, outcome: ThreadOutcome) {
        *self.outcome.lock() = Some(outcome);
        *self.state.lock() = ThreadState::Dead;
        let (ref mx, ref cv) = self.done;
        *mx.lock() = true;
        cv.notify_all();
    }

    pub fn is_finished(&self) -> bool {
        *self.done.0.lock()
    }
}

/// Handle to a runtime thread running a block on its own native thread.
#[derive(Debug)]
pub struct RuntimeThread {
    shared: Arc<ThreadShared>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl RuntimeThread {
    pub(crate) fn new(shared: Arc<ThreadShared>, handle: JoinHandle<()>) -> Self {
        Self {
            shared,
            handle: Mutex::new(Some(handle)),
        }
    }

    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn state(&self) -> ThreadState {
        *self.shared.state.lock()
    }

    pub fn is_finished(&self) -> bool {
        self.shared.is_finished()
    }

    pub fn kill(&self) {
        log::debug!("kill requested for thread {}", self.shared.id);
        self.shared.interrupt.request_kill();
    }

    pub fn pause(&self) {
        self.shared.interrupt.pause();
        let mut state = self.shared.state.lock();
        if *state == ThreadState::Running {
            *state = ThreadState::Paused;
        }
    }

    pub fn resume(&self) {
        {
            let mut state = self.shared.state.lock();
            if *state == ThreadState::Paused {
                *state = ThreadState::Running;
            }
        }
        self.shared.interrupt.resume();
    }

    pub fn join_timeout(&self, dur: Duration) -> bool {
        let (ref mx, ref cv) = self.shared.done;
        let mut done = mx.lock();
        if *done {
            return true;
        }
        let res = cv.wait_for(&mut done, dur);
        !res.timed_out() || *done
    }

    /// Waits for the thread and hands back the value of its block, or the
    /// error that escaped it. A killed thread yields nil.
    pub fn join(&self) -> ThreadOutcome {
        if let Some(handle) = self.handle.lock().take() {
            // panics inside the thread leave no outcome behind
            let _ = handle.join();
        }
        let outcome = self.shared.outcome.lock().take();
        outcome.unwrap_or_else(|| {
            Err(RaiseError::new(
                crate::ErrorKind::RuntimeError,
                "thread terminated without a result",
            ))
        })
    }
}

pub(crate) fn spawn_native<F>(
    name: String,
    stack_size: usize,
    f: F,
) -> std::io::Result<JoinHandle<()>>
where
    F: FnOnce(),
    F: Send + 'static,
{
    thread::Builder::new().name(name).stack_size(stack_size).spawn(f)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn pause_parks_until_resume() {
        let interrupt = ThreadInterrupt::new();
        let released = Arc::new(AtomicBool::new(false));
        interrupt.pause();
        assert!(interrupt.is_pending());

        let worker = {
            let (interrupt, released) = (interrupt.clone(), released.clone());
            thread::spawn(move || {
                let killed = interrupt.check_and_park();
                released.store(true, Ordering::SeqCst);
                killed
            })
        };

        thread::sleep(Duration::from_millis(50));
        assert!(!released.load(Ordering::SeqCst));
        interrupt.resume();
        let start = Instant::now();
        while !released.load(Ordering::SeqCst) && start.elapsed() < Duration::from_secs(1) {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(!worker.join().unwrap());
        assert!(!interrupt.is_pending());
    }

    #[test]
    fn kill_wakes_a_paused_thread() {
        let interrupt = ThreadInterrupt::new();
        interrupt.pause();
        let worker = {
            let interrupt = interrupt.clone();
            thread::spawn(move || interrupt.check_and_park())
        };
        thread::sleep(Duration::from_millis(20));
        interrupt.request_kill();
        assert!(worker.join().unwrap());
    }
}
