//! One-shot, auto-resetting wakeup used between the hardware and a playback task.

use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// A latch that is set by [`CompletionSignal::signal`] and cleared by the wait that observes it.
///
/// Signals raised while nobody waits are not lost: the next wait returns immediately. Several
/// signals before a wait collapse into one wakeup.
#[derive(Debug, Default)]
pub struct CompletionSignal {
    fired: Mutex<bool>,
    cv: Condvar,
}

impl CompletionSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the latch and wake the waiter.
    pub fn signal(&self) {
        let mut fired = self.fired.lock().unwrap_or_else(|p| p.into_inner());
        *fired = true;
        drop(fired);
        self.cv.notify_all();
    }

    /// Block until signaled, then reset.
    pub fn wait(&self) {
        let mut fired = self.fired.lock().unwrap_or_else(|p| p.into_inner());
        while !*fired {
            fired = self.cv.wait(fired).unwrap_or_else(|p| p.into_inner());
        }
        *fired = false;
    }

    /// Like [`CompletionSignal::wait`] but gives up after `timeout`.
    ///
    /// Returns `true` if the signal was observed (and reset).
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let fired = self.fired.lock().unwrap_or_else(|p| p.into_inner());
        let (mut fired, _) = self
            .cv
            .wait_timeout_while(fired, timeout, |fired| !*fired)
            .unwrap_or_else(|p| p.into_inner());
        let seen = *fired;
        *fired = false;
        seen
    }

    /// Drop a pending signal without waiting.
    pub fn clear(&self) {
        let mut fired = self.fired.lock().unwrap_or_else(|p| p.into_inner());
        *fired = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn signal_before_wait_is_latched() {
        let s = CompletionSignal::new();
        s.signal();
        s.signal();
        s.wait();
        assert!(!s.wait_timeout(Duration::from_millis(5)), "signals collapse into one");
    }

    #[test]
    fn wait_wakes_on_signal_from_other_thread() {
        let s = Arc::new(CompletionSignal::new());
        let s2 = s.clone();
        let handle = thread::spawn(move || s2.wait());
        thread::sleep(Duration::from_millis(10));
        s.signal();
        handle.join().unwrap();
    }

    #[test]
    fn clear_drops_pending_signal() {
        let s = CompletionSignal::new();
        s.signal();
        s.clear();
        assert!(!s.wait_timeout(Duration::from_millis(5)));
    }
}
