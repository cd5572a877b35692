//! What a sleeping lock needs from the thread scheduler.

/// Thread id. `0` is never a thread.
pub type Tid = u32;

/// The slice of the scheduler that [`SleepMutex`](super::mutex::SleepMutex)
/// uses to put contending threads to sleep instead of spinning.
///
/// In the kernel this is the thread manager's `thread_sleep` and
/// `thread_wakeup`.
pub trait Scheduler: Send + Sync {
    /// The running thread.
    fn current(&self) -> Tid;

    /// Blocks the running thread until someone calls `wakeup` for it. A wakeup
    /// delivered before the thread gets here must make this return at once.
    /// Spurious returns are allowed.
    fn sleep(&self);

    fn wakeup(&self, tid: Tid);
}
