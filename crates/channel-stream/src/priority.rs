//! Scheduling priority of playback threads.
//!
//! The engine counts priorities the way its config does: lower values are more urgent. The
//! [`ThreadScheduler`] seam reads and applies them on the calling thread; [`OsScheduler`] maps
//! them onto `thread-priority`'s cross-platform scale (0..=99, higher is more urgent).

use anyhow::{Context, Result, anyhow};
use thread_priority::{ThreadPriority, ThreadPriorityValue};

/// Reads and sets the scheduling priority of the *calling* thread.
pub trait ThreadScheduler: Send + Sync {
    /// Priority of the calling thread, if the platform reports a meaningful one.
    fn current_priority(&self) -> Option<i32>;
    /// Run the calling thread at `priority` from now on.
    fn apply_priority(&self, priority: i32) -> Result<()>;
}

/// Priority for a playback task: one step more urgent than its caller, clamped to
/// `[min, max]`.
pub fn elevated_priority(caller: i32, min: i32, max: i32) -> i32 {
    caller.saturating_sub(1).clamp(min, max.max(min))
}

fn os_max() -> i32 {
    u8::from(ThreadPriorityValue::MAX) as i32
}

fn to_os_value(priority: i32) -> u8 {
    (os_max() - priority).clamp(0, os_max()) as u8
}

fn from_os_value(raw: u8) -> i32 {
    os_max() - raw as i32
}

/// [`ThreadScheduler`] backed by the operating system.
#[derive(Clone, Copy, Debug, Default)]
pub struct OsScheduler;

impl ThreadScheduler for OsScheduler {
    fn current_priority(&self) -> Option<i32> {
        match thread_priority::get_current_thread_priority() {
            // Time-shared threads have no static priority and report 0.
            Ok(ThreadPriority::Crossplatform(value)) => {
                let raw = u8::from(value);
                (raw > 0).then(|| from_os_value(raw))
            }
            Ok(_) => None,
            Err(e) => {
                tracing::debug!("thread priority unavailable: {e}");
                None
            }
        }
    }

    fn apply_priority(&self, priority: i32) -> Result<()> {
        let raw = to_os_value(priority);
        let value = ThreadPriorityValue::try_from(raw).map_err(|e| anyhow!(e))?;
        thread_priority::set_current_thread_priority(ThreadPriority::Crossplatform(value))
            .with_context(|| format!("set thread priority {priority} (os value {raw})"))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::cell::Cell;

    thread_local! {
        static FAKE_PRIORITY: Cell<Option<i32>> = const { Cell::new(None) };
    }

    /// Keeps one priority per thread in a thread-local, so a test can see what each thread set.
    #[derive(Debug, Default)]
    pub(crate) struct ThreadLocalScheduler;

    impl ThreadLocalScheduler {
        pub(crate) fn set_current(priority: Option<i32>) {
            FAKE_PRIORITY.with(|p| p.set(priority));
        }
    }

    impl ThreadScheduler for ThreadLocalScheduler {
        fn current_priority(&self) -> Option<i32> {
            FAKE_PRIORITY.with(Cell::get)
        }

        fn apply_priority(&self, priority: i32) -> Result<()> {
            FAKE_PRIORITY.with(|p| p.set(Some(priority)));
            Ok(())
        }
    }

    /// Refuses every change, like an unprivileged process asking for more urgency.
    #[derive(Debug, Default)]
    pub(crate) struct RefusingScheduler;

    impl ThreadScheduler for RefusingScheduler {
        fn current_priority(&self) -> Option<i32> {
            None
        }

        fn apply_priority(&self, priority: i32) -> Result<()> {
            Err(anyhow!("permission denied for priority {priority}"))
        }
    }

    #[test]
    fn priority_is_one_step_more_urgent_and_clamped() {
        assert_eq!(elevated_priority(0x30, 0x18, 0x3F), 0x2F);
        assert_eq!(elevated_priority(0x18, 0x18, 0x3F), 0x18);
        assert_eq!(elevated_priority(0x10, 0x18, 0x3F), 0x18);
        assert_eq!(elevated_priority(0x50, 0x18, 0x3F), 0x3F);
        assert_eq!(elevated_priority(i32::MIN, 0x18, 0x3F), 0x18);
    }

    #[test]
    fn os_scale_is_inverted_and_clamped() {
        assert_eq!(to_os_value(0x2F), (os_max() - 0x2F) as u8);
        assert_eq!(from_os_value(to_os_value(0x2F)), 0x2F);
        assert_eq!(to_os_value(-5), os_max() as u8);
        assert_eq!(to_os_value(1_000), 0);
        assert!(to_os_value(0x18) > to_os_value(0x3F), "lower value is more urgent");
    }

    #[test]
    fn os_scheduler_reports_priority_within_scale() {
        if let Some(priority) = OsScheduler.current_priority() {
            assert!((0..os_max()).contains(&priority));
        }
    }

    #[test]
    fn thread_local_scheduler_is_per_thread() {
        ThreadLocalScheduler::set_current(Some(0x20));
        let other = std::thread::spawn(|| ThreadLocalScheduler.current_priority())
            .join()
            .unwrap();
        assert_eq!(other, None);
        assert_eq!(ThreadLocalScheduler.current_priority(), Some(0x20));
    }
}
