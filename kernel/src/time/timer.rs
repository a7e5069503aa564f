//! Millisecond timer and sleep queue.
//!
//! Sleeping threads are parked in a queue sorted by wake time. The tick
//! handler advances uptime and reschedules every thread whose wake time has
//! arrived. Preemption on top of the tick is the interrupt handler's
//! business; it must check the scheduler's preemption flag first.

use crate::task::scheduler::{self, Scheduler};
use crate::task::thread::ThreadState;
use alloc::collections::VecDeque;
use core::sync::atomic::{AtomicU64, Ordering};
use spin::Mutex;

/// Milliseconds advanced per timer tick.
pub const TICK_PERIOD_MS: u64 = 1;

static UPTIME_MS: AtomicU64 = AtomicU64::new(0);
static SLEEPERS: Mutex<SleepQueue> = Mutex::new(SleepQueue::new());

/// Sleep queue ordered by wake time.
pub struct SleepQueue {
    // (wake time in ms, thread handle), sorted ascending by wake time.
    entries: VecDeque<(u64, u16)>,
}

impl SleepQueue {
    pub const fn new() -> Self {
        Self {
            entries: VecDeque::new(),
        }
    }

    /// Insert keeping the queue sorted; equal wake times keep FIFO order.
    pub fn insert(&mut self, wake_at: u64, thread: u16) {
        let pos = self
            .entries
            .iter()
            .position(|&(t, _)| t > wake_at)
            .unwrap_or(self.entries.len());
        self.entries.insert(pos, (wake_at, thread));
    }

    /// Pop every thread due at `now`.
    pub fn pop_due(&mut self, now: u64) -> impl Iterator<Item = u16> + '_ {
        core::iter::from_fn(move || {
            if self.entries.front().map(|&(t, _)| t <= now).unwrap_or(false) {
                self.entries.pop_front().map(|(_, h)| h)
            } else {
                None
            }
        })
    }

    /// Drop a terminating thread from the queue.
    pub fn remove(&mut self, thread: u16) -> bool {
        if let Some(pos) = self.entries.iter().position(|&(_, h)| h == thread) {
            self.entries.remove(pos);
            true
        } else {
            false
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for SleepQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Milliseconds since boot.
pub fn uptime_ms() -> u64 {
    UPTIME_MS.load(Ordering::SeqCst)
}

/// Park the calling thread for at least `ms` milliseconds.
pub fn sleep_milli(ms: u64) {
    scheduler::lock();
    let wake_at = uptime_ms() + ms;
    scheduler::with_scheduler(|s| {
        let current = s.running_thread();
        if let Some(thread) = s.thread_mut(current) {
            thread.state = ThreadState::Sleeping;
        }
        SLEEPERS.lock().insert(wake_at, current);
    });
    scheduler::execute_next_thread();
    scheduler::unlock();
}

/// Advance time by one tick and wake due sleepers. Called by the timer
/// interrupt with the scheduler locked.
pub fn tick() {
    let now = UPTIME_MS.fetch_add(TICK_PERIOD_MS, Ordering::SeqCst) + TICK_PERIOD_MS;
    scheduler::with_scheduler(|s| wake_due(s, &mut SLEEPERS.lock(), now));
}

/// Reschedule every sleeper whose wake time has arrived.
pub fn wake_due(scheduler: &mut Scheduler, sleepers: &mut SleepQueue, now: u64) -> usize {
    let mut woken = 0;
    let due: alloc::vec::Vec<u16> = sleepers.pop_due(now).collect();
    for handle in due {
        if scheduler.schedule(handle) {
            woken += 1;
        }
    }
    woken
}

/// Drop a terminating thread from the sleep queue.
pub fn remove_sleeper(thread: u16) -> bool {
    SLEEPERS.lock().remove(thread)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::thread::{SchedulingPolicy, Stack, StartInfo};
    use alloc::string::ToString;

    fn dummy_main(_info: &mut StartInfo) -> i32 {
        0
    }

    #[test]
    fn test_sorted_insert_and_fifo_ties() {
        let mut q = SleepQueue::new();
        q.insert(30, 1);
        q.insert(10, 2);
        q.insert(20, 3);
        q.insert(10, 4);

        let due: alloc::vec::Vec<u16> = q.pop_due(25).collect();
        // 10ms sleepers first in insertion order, then the 20ms one.
        assert_eq!(due, alloc::vec![2, 4, 3]);
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn test_nothing_due_before_wake_time() {
        let mut q = SleepQueue::new();
        q.insert(100, 1);
        assert_eq!(q.pop_due(99).count(), 0);
        assert_eq!(q.pop_due(100).count(), 1);
    }

    #[test]
    fn test_wake_due_reschedules_sleepers() {
        let mut s = Scheduler::new();
        s.init(0, 0).unwrap();
        let t = s
            .schedule_new_thread(
                "sleeper".to_string(),
                dummy_main,
                0,
                0,
                0,
                Some(SchedulingPolicy::Normal),
                Stack::default(),
                0,
            )
            .unwrap();

        // Park the thread manually as sleep_milli would.
        let mut q = SleepQueue::new();
        s.ready_queue().remove(t);
        s.thread_mut(t).unwrap().state = ThreadState::Sleeping;
        q.insert(50, t);

        assert_eq!(wake_due(&mut s, &mut q, 49), 0);
        assert_eq!(s.thread(t).unwrap().state, ThreadState::Sleeping);
        assert_eq!(wake_due(&mut s, &mut q, 50), 1);
        assert_eq!(s.thread(t).unwrap().state, ThreadState::Ready);
    }

    #[test]
    fn test_remove_sleeping_thread() {
        let mut q = SleepQueue::new();
        q.insert(10, 7);
        assert!(q.remove(7));
        assert!(!q.remove(7));
        assert!(q.is_empty());
    }
}
