//! Threading: thread table, scheduler, mutexes and context switching.

pub mod context;
pub mod mutex;
pub mod scheduler;
pub mod thread;

pub use scheduler::{execute_next_thread, lock, thread_exit, unlock};
pub use thread::{SchedulingPolicy, Thread, ThreadState};

/// Terminate a thread that is not the running one.
///
/// The thread is pulled out of whatever queue its state places it in
/// (ready queue, timer sleep queue, mutex wait queue) and handed to the
/// reaper. Never triggers a context switch; terminating the running thread
/// goes through [`thread_exit`] instead.
pub fn terminate_thread(handle: u16) -> bool {
    scheduler::lock();
    let ok = scheduler::with_scheduler(|s| {
        if handle == s.running_thread() {
            return false;
        }
        match s.thread(handle).map(|t| t.state) {
            Some(ThreadState::Sleeping) => {
                crate::time::timer::remove_sleeper(handle);
            }
            Some(ThreadState::Waiting) => {
                mutex::remove_waiter(handle);
            }
            Some(_) => {}
            None => return false,
        }
        s.terminate_thread(handle)
    })
    .unwrap_or(false);
    scheduler::unlock();
    ok
}
