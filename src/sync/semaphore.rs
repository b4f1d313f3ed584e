//! Counting semaphore and the simulate/render rendezvous built on it.

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

#[derive(Debug)]
struct State {
    count: u32,
    closed: bool,
}

/// Counting semaphore that can be closed to release every waiter.
#[derive(Debug)]
pub struct Semaphore {
    state: Mutex<State>,
    available: Condvar,
}

impl Semaphore {
    pub fn new(initial: u32) -> Self {
        Self {
            state: Mutex::new(State {
                count: initial,
                closed: false,
            }),
            available: Condvar::new(),
        }
    }

    pub fn post(&self) {
        let mut state = self.state.lock();
        state.count += 1;
        self.available.notify_one();
    }

    /// Block until a permit is available. Returns `false` once closed.
    pub fn wait(&self) -> bool {
        let mut state = self.state.lock();
        while state.count == 0 && !state.closed {
            self.available.wait(&mut state);
        }
        Self::take(&mut state)
    }

    /// Like [`Semaphore::wait`], giving up after `timeout`.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while state.count == 0 && !state.closed {
            if self.available.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }
        Self::take(&mut state)
    }

    pub fn try_wait(&self) -> bool {
        Self::take(&mut self.state.lock())
    }

    fn take(state: &mut State) -> bool {
        if state.closed || state.count == 0 {
            return false;
        }
        state.count -= 1;
        true
    }

    /// Wake every waiter; later waits return `false` immediately.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.available.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

/// Hand-off between a simulation thread and a render thread.
///
/// The simulation of frame `n + 1` overlaps rendering of frame `n`, but the
/// simulation never overwrites render input the render thread has not
/// picked up yet.
///
/// ```ignore
/// // simulate thread
/// while sync.wait_render() { simulate(); sync.post_simulate(); }
/// // render thread
/// while sync.wait_simulate() { take_snapshot(); sync.post_render(); render(); }
/// ```
#[derive(Debug)]
pub struct FrameSync {
    simulated: Semaphore,
    rendered: Semaphore,
}

impl Default for FrameSync {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameSync {
    pub fn new() -> Self {
        Self {
            simulated: Semaphore::new(0),
            // The first simulation step does not wait for a render.
            rendered: Semaphore::new(1),
        }
    }

    /// Simulation side: wait until the previous frame's input was consumed.
    pub fn wait_render(&self) -> bool {
        self.rendered.wait()
    }

    /// Simulation side: publish a simulated frame.
    pub fn post_simulate(&self) {
        self.simulated.post();
    }

    /// Render side: wait for a simulated frame.
    pub fn wait_simulate(&self) -> bool {
        self.simulated.wait()
    }

    /// Render side: the simulated frame has been consumed.
    pub fn post_render(&self) {
        self.rendered.post();
    }

    /// Release both threads for shutdown.
    pub fn close(&self) {
        log::debug!("Closing frame sync");
        self.simulated.close();
        self.rendered.close();
    }

    pub fn is_closed(&self) -> bool {
        self.simulated.is_closed()
    }
}
