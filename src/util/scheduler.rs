use std::future::Future;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time;

/// Shared timer facility for all receive windows and router stubs of a protocol stack.
///
/// The scheduler captures a tokio runtime handle at construction, so tasks scheduled from any
///  thread all land on that one runtime. The host owns the scheduler's lifetime and shares it
///  via `Arc`; components that are handed a scheduler never shut it down.
pub struct TimeScheduler {
    runtime: Handle,
}

impl TimeScheduler {
    /// Captures the current tokio runtime.
    ///
    /// Panics when called outside a runtime context.
    pub fn new() -> TimeScheduler {
        TimeScheduler {
            runtime: Handle::current(),
        }
    }

    pub fn spawn(&self, task: impl Future<Output = ()> + Send + 'static) -> ScheduledTask {
        ScheduledTask {
            handle: self.runtime.spawn(task),
        }
    }

    pub fn schedule_once(&self, delay: Duration, task: impl Future<Output = ()> + Send + 'static) -> ScheduledTask {
        self.spawn(async move {
            time::sleep(delay).await;
            task.await;
        })
    }

    /// Runs `task` periodically, the first time after `initial_delay`. Each run starts `period`
    ///  after the previous run *finished* (fixed delay rather than fixed rate), so a slow run
    ///  never causes overlapping executions.
    pub fn schedule_with_fixed_delay<F, Fut>(&self, initial_delay: Duration, period: Duration, mut task: F) -> ScheduledTask
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.spawn(async move {
            time::sleep(initial_delay).await;
            loop {
                task().await;
                time::sleep(period).await;
            }
        })
    }
}

/// Handle to a task running on a [TimeScheduler].
///
/// The task is aborted on [ScheduledTask::cancel] and when the handle is dropped, so evicting a
///  handle from a registry doubles as cancellation. Abortion is asynchronous: an in-flight run
///  may still complete once, and scheduled work must tolerate finding its registration gone.
pub struct ScheduledTask {
    handle: JoinHandle<()>,
}

impl ScheduledTask {
    pub fn cancel(&self) {
        self.handle.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for ScheduledTask {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
