//! Blocking kernel mutexes.
//!
//! A mutex records its owning thread by handle and queues contenders in
//! FIFO order. Acquire and release run inside scheduler-locked regions; a
//! blocked thread is parked in `Waiting` and the mutex hands ownership over
//! on release, atomically with rescheduling the next waiter.

use super::scheduler::Scheduler;
use super::thread::ThreadState;
use crate::util::handle::HandleTable;
use alloc::collections::VecDeque;
use alloc::string::String;

/// Result of an acquire attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    /// The caller owns the mutex now.
    Acquired,
    /// The caller was parked in the wait queue; it owns the mutex when the
    /// blocking call returns.
    Blocked,
    /// No such mutex.
    UnknownMutex,
    /// The caller already owns another mutex.
    AlreadyOwning,
}

/// Errors of a release attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseError {
    UnknownMutex,
    /// Only the owner may release.
    NotOwner,
}

/// An owner-bearing lock with a FIFO wait queue.
pub struct KernelMutex {
    pub handle: u16,
    pub name: String,
    /// Owning thread handle, 0 when free.
    owner: u16,
    wait_queue: VecDeque<u16>,
}

impl KernelMutex {
    pub fn owner(&self) -> u16 {
        self.owner
    }

    pub fn waiters(&self) -> usize {
        self.wait_queue.len()
    }
}

/// All mutexes, keyed by handle.
pub struct MutexTable {
    table: HandleTable<KernelMutex>,
}

impl MutexTable {
    pub const fn new() -> Self {
        Self {
            table: HandleTable::new(),
        }
    }

    /// Create a mutex; returns its handle or `None` when the handle space
    /// is exhausted.
    pub fn create(&mut self, name: String) -> Option<u16> {
        self.table.insert_with(|handle| KernelMutex {
            handle,
            name,
            owner: 0,
            wait_queue: VecDeque::new(),
        })
    }

    /// Drop a mutex object. Refused while owned or contended.
    pub fn destroy(&mut self, handle: u16) -> bool {
        let Some(mutex) = self.table.get(handle) else {
            return false;
        };
        if mutex.owner != 0 || !mutex.wait_queue.is_empty() {
            return false;
        }
        self.table.remove(handle).is_some()
    }

    pub fn get(&self, handle: u16) -> Option<&KernelMutex> {
        self.table.get(handle)
    }

    /// Try to take the mutex for the scheduler's running thread. On
    /// contention the caller is parked; the global wrapper then triggers
    /// the context switch.
    pub fn acquire(&mut self, scheduler: &mut Scheduler, handle: u16) -> AcquireOutcome {
        let current = scheduler.running_thread();
        let Some(mutex) = self.table.get_mut(handle) else {
            return AcquireOutcome::UnknownMutex;
        };
        let already_owning = scheduler
            .thread(current)
            .map(|t| t.mutex_id != 0)
            .unwrap_or(false);
        if already_owning {
            log::warn!(
                "mutex: thread {} attempted to acquire \"{}\" while owning another mutex",
                current,
                mutex.name
            );
            return AcquireOutcome::AlreadyOwning;
        }

        if mutex.owner == 0 {
            mutex.owner = current;
            if let Some(thread) = scheduler.thread_mut(current) {
                thread.mutex_id = handle;
            }
            AcquireOutcome::Acquired
        } else {
            mutex.wait_queue.push_back(current);
            if let Some(thread) = scheduler.thread_mut(current) {
                thread.state = ThreadState::Waiting;
            }
            AcquireOutcome::Blocked
        }
    }

    /// Release the mutex. Ownership moves to the first waiter, which is
    /// rescheduled in the same step; with no waiters the mutex becomes
    /// free.
    pub fn release(&mut self, scheduler: &mut Scheduler, handle: u16) -> Result<(), ReleaseError> {
        let current = scheduler.running_thread();
        let Some(mutex) = self.table.get_mut(handle) else {
            return Err(ReleaseError::UnknownMutex);
        };
        if mutex.owner != current {
            log::warn!(
                "mutex: thread {} attempted to release \"{}\" owned by {}",
                current,
                mutex.name,
                mutex.owner
            );
            return Err(ReleaseError::NotOwner);
        }

        if let Some(thread) = scheduler.thread_mut(current) {
            thread.mutex_id = 0;
        }
        match mutex.wait_queue.pop_front() {
            Some(next) => {
                mutex.owner = next;
                if let Some(thread) = scheduler.thread_mut(next) {
                    thread.mutex_id = handle;
                }
                scheduler.schedule(next);
            }
            None => {
                mutex.owner = 0;
            }
        }
        Ok(())
    }

    /// Drop a terminating thread from a mutex wait queue.
    pub fn remove_waiter(&mut self, thread: u16) -> bool {
        for (_, mutex) in self.table.iter_mut() {
            if let Some(pos) = mutex.wait_queue.iter().position(|&h| h == thread) {
                mutex.wait_queue.remove(pos);
                return true;
            }
        }
        false
    }
}

impl Default for MutexTable {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Global table
// ---------------------------------------------------------------------------

use super::scheduler;
use spin::Mutex;

static MUTEXES: Mutex<MutexTable> = Mutex::new(MutexTable::new());

/// Create a named mutex.
pub fn create_mutex(name: String) -> Option<u16> {
    scheduler::lock();
    let handle = MUTEXES.lock().create(name);
    scheduler::unlock();
    handle
}

/// Destroy an uncontended, unowned mutex.
pub fn release_mutex_object(handle: u16) -> bool {
    scheduler::lock();
    let ok = MUTEXES.lock().destroy(handle);
    scheduler::unlock();
    ok
}

/// Acquire a mutex, blocking the calling thread on contention.
pub fn acquire(handle: u16) -> AcquireOutcome {
    scheduler::lock();
    let outcome = scheduler::with_scheduler(|s| MUTEXES.lock().acquire(s, handle))
        .unwrap_or(AcquireOutcome::UnknownMutex);
    if outcome == AcquireOutcome::Blocked {
        // Parked: give the CPU away; the switch happens at the final
        // unlock, and this call returns once ownership arrived.
        scheduler::execute_next_thread();
    }
    scheduler::unlock();
    outcome
}

/// Release a mutex owned by the calling thread.
pub fn release(handle: u16) -> Result<(), ReleaseError> {
    scheduler::lock();
    let result = scheduler::with_scheduler(|s| MUTEXES.lock().release(s, handle))
        .unwrap_or(Err(ReleaseError::UnknownMutex));
    scheduler::unlock();
    result
}

/// Remove a terminating thread from any mutex wait queue.
pub fn remove_waiter(thread: u16) -> bool {
    MUTEXES.lock().remove_waiter(thread)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::thread::{SchedulingPolicy, Stack, StartInfo};
    use alloc::string::ToString;

    fn dummy_main(_info: &mut StartInfo) -> i32 {
        0
    }

    fn scheduler_with_threads(count: usize) -> (Scheduler, alloc::vec::Vec<u16>) {
        let mut s = Scheduler::new();
        s.init(0, 0).unwrap();
        let mut handles = alloc::vec::Vec::new();
        for i in 0..count {
            let h = s
                .schedule_new_thread(
                    alloc::format!("T{}", i + 1),
                    dummy_main,
                    0,
                    0,
                    0,
                    Some(SchedulingPolicy::Normal),
                    Stack::default(),
                    0,
                )
                .unwrap();
            handles.push(h);
        }
        (s, handles)
    }

    fn run_thread(s: &mut Scheduler, handle: u16) {
        // Force the scheduler's view of the running thread for the test.
        let running = s.running_thread();
        if let Some(t) = s.thread_mut(running) {
            if t.state == ThreadState::Running {
                t.state = ThreadState::Waiting;
            }
        }
        while s.running_thread() != handle {
            if s.prepare_switch().is_none() {
                panic!("thread {} never became running", handle);
            }
        }
    }

    #[test]
    fn test_ownership_transfer_scenario() {
        let (mut s, threads) = scheduler_with_threads(3);
        let (t1, t2, t3) = (threads[0], threads[1], threads[2]);
        let mut mutexes = MutexTable::new();
        let m = mutexes.create("disk".to_string()).unwrap();

        // T1 takes the mutex.
        run_thread(&mut s, t1);
        assert_eq!(mutexes.acquire(&mut s, m), AcquireOutcome::Acquired);
        assert_eq!(mutexes.get(m).unwrap().owner(), t1);
        assert_eq!(s.thread(t1).unwrap().mutex_id, m);

        // T2 contends and blocks.
        run_thread(&mut s, t2);
        assert_eq!(mutexes.acquire(&mut s, m), AcquireOutcome::Blocked);
        assert_eq!(s.thread(t2).unwrap().state, ThreadState::Waiting);
        assert_eq!(mutexes.get(m).unwrap().waiters(), 1);

        // T3 may not release someone else's mutex.
        run_thread(&mut s, t3);
        assert_eq!(mutexes.release(&mut s, m), Err(ReleaseError::NotOwner));

        // T1 releases: T2 becomes owner and is ready again.
        // (T1 is not running; emulate by switching back.)
        s.thread_mut(t3).unwrap().state = ThreadState::Waiting;
        s.schedule(t1);
        run_thread(&mut s, t1);
        assert_eq!(mutexes.release(&mut s, m), Ok(()));
        assert_eq!(mutexes.get(m).unwrap().owner(), t2);
        assert_eq!(s.thread(t2).unwrap().state, ThreadState::Ready);
        assert_eq!(s.thread(t2).unwrap().mutex_id, m);
        assert_eq!(s.thread(t1).unwrap().mutex_id, 0);
    }

    #[test]
    fn test_release_without_waiters_frees_mutex() {
        let (mut s, threads) = scheduler_with_threads(1);
        let mut mutexes = MutexTable::new();
        let m = mutexes.create("m".to_string()).unwrap();

        run_thread(&mut s, threads[0]);
        assert_eq!(mutexes.acquire(&mut s, m), AcquireOutcome::Acquired);
        assert_eq!(mutexes.release(&mut s, m), Ok(()));
        assert_eq!(mutexes.get(m).unwrap().owner(), 0);
    }

    #[test]
    fn test_single_mutex_per_thread() {
        let (mut s, threads) = scheduler_with_threads(1);
        let mut mutexes = MutexTable::new();
        let a = mutexes.create("a".to_string()).unwrap();
        let b = mutexes.create("b".to_string()).unwrap();

        run_thread(&mut s, threads[0]);
        assert_eq!(mutexes.acquire(&mut s, a), AcquireOutcome::Acquired);
        assert_eq!(mutexes.acquire(&mut s, b), AcquireOutcome::AlreadyOwning);
    }

    #[test]
    fn test_destroy_refuses_owned_mutex() {
        let (mut s, threads) = scheduler_with_threads(1);
        let mut mutexes = MutexTable::new();
        let m = mutexes.create("m".to_string()).unwrap();
        run_thread(&mut s, threads[0]);
        mutexes.acquire(&mut s, m);
        assert!(!mutexes.destroy(m));
        mutexes.release(&mut s, m).unwrap();
        assert!(mutexes.destroy(m));
    }

    #[test]
    fn test_remove_waiter() {
        let (mut s, threads) = scheduler_with_threads(2);
        let mut mutexes = MutexTable::new();
        let m = mutexes.create("m".to_string()).unwrap();

        run_thread(&mut s, threads[0]);
        mutexes.acquire(&mut s, m);
        run_thread(&mut s, threads[1]);
        mutexes.acquire(&mut s, m);
        assert_eq!(mutexes.get(m).unwrap().waiters(), 1);
        assert!(mutexes.remove_waiter(threads[1]));
        assert_eq!(mutexes.get(m).unwrap().waiters(), 0);
    }
}
