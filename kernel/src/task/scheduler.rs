//! The scheduler: multi-level ready queue, context-switch policy and the
//! lock that postpones preemption.
//!
//! A single core runs one thread at a time. Threads are addressed by `u16`
//! handles into the scheduler's thread table; the ready queue stores
//! handles, never references. Selection order is fixed: the reaper whenever
//! terminated threads await cleanup, then the highest nonempty priority
//! class, then the idle thread.
//!
//! `lock`/`unlock` implement the two-counter discipline: the first lock
//! disables interrupts, every lock postpones context switches. A switch
//! requested while locked is remembered and performed by the final
//! `unlock`, so every suspended thread sleeps at the same point inside
//! `unlock` with interrupts still disabled and exactly one interrupt-
//! disable level held. A brand-new thread balances that level in
//! [`thread_enter`].

use super::context;
use super::thread::{SchedulingPolicy, Stack, StartInfo, Thread, ThreadMain, ThreadState, KERNEL_STACK_SIZE};
use crate::util::handle::HandleTable;
use alloc::collections::VecDeque;
use alloc::string::String;
use alloc::string::ToString;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use spin::Mutex;

const BOOTSTRAP_THREAD_NAME: &str = "Bootstrap";
const IDLE_THREAD_NAME: &str = "Idle";
const REAPER_THREAD_NAME: &str = "Reaper";

/// Three FIFO queues in strict priority order.
pub struct MultiLevelQueue {
    low_latency: VecDeque<u16>,
    normal: VecDeque<u16>,
    background: VecDeque<u16>,
}

impl MultiLevelQueue {
    pub const fn new() -> Self {
        Self {
            low_latency: VecDeque::new(),
            normal: VecDeque::new(),
            background: VecDeque::new(),
        }
    }

    /// Append a thread to the queue of its priority class.
    pub fn enqueue(&mut self, handle: u16, policy: SchedulingPolicy) {
        match policy {
            SchedulingPolicy::LowLatency => self.low_latency.push_back(handle),
            SchedulingPolicy::Normal => self.normal.push_back(handle),
            SchedulingPolicy::Background => self.background.push_back(handle),
        }
    }

    /// Pop the head of the highest-priority nonempty queue.
    pub fn dequeue(&mut self) -> Option<u16> {
        self.low_latency
            .pop_front()
            .or_else(|| self.normal.pop_front())
            .or_else(|| self.background.pop_front())
    }

    /// Remove a specific thread from whichever queue holds it.
    pub fn remove(&mut self, handle: u16) -> bool {
        for queue in [&mut self.low_latency, &mut self.normal, &mut self.background] {
            if let Some(pos) = queue.iter().position(|&h| h == handle) {
                queue.remove(pos);
                return true;
            }
        }
        false
    }

    pub fn is_empty(&self) -> bool {
        self.low_latency.is_empty() && self.normal.is_empty() && self.background.is_empty()
    }

    pub fn len(&self) -> usize {
        self.low_latency.len() + self.normal.len() + self.background.len()
    }
}

impl Default for MultiLevelQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Scheduler state: thread table, queues and the special threads.
pub struct Scheduler {
    threads: HandleTable<Thread>,
    ready: MultiLevelQueue,
    terminated: VecDeque<u16>,
    running: u16,
    idle: u16,
    reaper: u16,
    allow_preemption: bool,
    on_context_switch: Option<fn(&Thread)>,
}

impl Scheduler {
    pub const fn new() -> Self {
        Self {
            threads: HandleTable::new(),
            ready: MultiLevelQueue::new(),
            terminated: VecDeque::new(),
            running: 0,
            idle: 0,
            reaper: 0,
            allow_preemption: false,
            on_context_switch: None,
        }
    }

    /// Create the bootstrap, idle and reaper threads.
    ///
    /// The code running since power-on becomes the `Bootstrap` thread; it
    /// still runs on the bootloader stack and is discarded as soon as the
    /// kernel hands off to its first real thread. Idle and reaper start in
    /// `Waiting` and are never placed in the ready queue.
    pub fn init(&mut self, base_pt_addr: u64, boot_stack_top: u64) -> Option<u16> {
        let bootstrap = self.threads.insert_with(|handle| {
            let mut t = Thread::new(
                BOOTSTRAP_THREAD_NAME.to_string(),
                SchedulingPolicy::LowLatency,
                base_pt_addr,
            );
            t.handle = handle;
            t.state = ThreadState::Running;
            t.kernel_rsp = boot_stack_top;
            t
        })?;
        self.running = bootstrap;

        self.idle = self.create_system_thread(IDLE_THREAD_NAME, idle_main, base_pt_addr)?;
        self.reaper = self.create_system_thread(REAPER_THREAD_NAME, reaper_main, base_pt_addr)?;
        self.allow_preemption = true;
        Some(bootstrap)
    }

    /// A thread outside the ready queue (idle, reaper): waiting, no policy.
    fn create_system_thread(&mut self, name: &str, main: ThreadMain, base_pt_addr: u64) -> Option<u16> {
        let handle = self.threads.insert_with(|handle| {
            let mut t = Thread::new(name.to_string(), SchedulingPolicy::Background, base_pt_addr);
            t.handle = handle;
            t.state = ThreadState::Waiting;
            t.policy = None;
            t.start_info = StartInfo {
                argc: 0,
                argv: 0,
                main: Some(main),
            };
            t
        })?;
        self.setup_kernel_stack(handle);
        Some(handle)
    }

    /// Allocate the fixed-size kernel stack and seed its trampoline frame.
    fn setup_kernel_stack(&mut self, handle: u16) {
        let mut stack = alloc::vec![0u8; KERNEL_STACK_SIZE].into_boxed_slice();
        let top = stack.as_mut_ptr() as u64 + KERNEL_STACK_SIZE as u64;
        let rsp = context::seed_trampoline(top, thread_enter as usize as u64);
        if let Some(thread) = self.threads.get_mut(handle) {
            thread.kernel_stack = Some(stack);
            thread.kernel_rsp = rsp;
        }
    }

    /// Put a fresh thread into the table and the ready queue.
    ///
    /// Refuses a `None` policy. Returns the new handle, or `None` when the
    /// thread cannot be created (the kernel stack is released again).
    #[allow(clippy::too_many_arguments)]
    pub fn schedule_new_thread(
        &mut self,
        name: String,
        main: ThreadMain,
        argc: i32,
        argv: u64,
        base_pt_addr: u64,
        policy: Option<SchedulingPolicy>,
        user_stack: Stack,
        app_handle: u16,
    ) -> Option<u16> {
        let Some(policy) = policy else {
            log::error!("scheduler: refusing to schedule thread \"{}\" without policy", name);
            return None;
        };
        let handle = self.threads.insert_with(|handle| {
            let mut t = Thread::new(name, policy, base_pt_addr);
            t.handle = handle;
            t.app_handle = app_handle;
            t.user_stack = user_stack;
            t.start_info = StartInfo {
                argc,
                argv,
                main: Some(main),
            };
            t
        })?;
        self.setup_kernel_stack(handle);
        self.ready.enqueue(handle, policy);
        if let Some(thread) = self.threads.get_mut(handle) {
            thread.state = ThreadState::Ready;
        }
        handle.into()
    }

    /// Wake an initialized thread: `Ready` state plus ready-queue position.
    ///
    /// The caller must have removed the thread from its previous wait
    /// queue. Refuses the running thread and unknown handles.
    pub fn schedule(&mut self, handle: u16) -> bool {
        if handle == self.running {
            return false;
        }
        let Some(thread) = self.threads.get_mut(handle) else {
            return false;
        };
        let Some(policy) = thread.policy else {
            return false;
        };
        thread.state = ThreadState::Ready;
        self.ready.enqueue(handle, policy);
        log::trace!("scheduler: thread {} scheduled", handle);
        true
    }

    /// Pick the next thread: reaper while cleanup is pending, then the
    /// ready queue, then idle.
    fn next_scheduled(&mut self) -> u16 {
        if !self.terminated.is_empty() {
            return self.reaper;
        }
        self.ready.dequeue().unwrap_or(self.idle)
    }

    /// Decide and stage a context switch.
    ///
    /// Returns the location of the outgoing thread's saved stack pointer
    /// and the incoming thread's stack pointer, or `None` when the current
    /// thread keeps running. Must run with switches postponed (the global
    /// wrapper guarantees this).
    pub fn prepare_switch(&mut self) -> Option<(*mut u64, u64)> {
        let next = self.next_scheduled();
        if next == self.idle {
            if self.running == self.idle {
                return None;
            }
            // Let the last non-idle thread keep running.
            if self
                .threads
                .get(self.running)
                .map(|t| t.state == ThreadState::Running)
                .unwrap_or(false)
            {
                return None;
            }
        }
        if next == self.running {
            return None;
        }

        if self.running == self.idle {
            // The idle thread is never queued for regular scheduling.
            if let Some(idle) = self.threads.get_mut(self.idle) {
                idle.state = ThreadState::Waiting;
            }
        } else if let Some(current) = self.threads.get_mut(self.running) {
            if current.state == ThreadState::Running {
                current.state = ThreadState::Ready;
                let policy = current.policy;
                if let Some(policy) = policy {
                    self.ready.enqueue(self.running, policy);
                }
            }
        }

        let old = self.running;
        self.running = next;
        self.allow_preemption = next != self.idle;
        let new_rsp = {
            let thread = self.threads.get_mut(next)?;
            thread.state = ThreadState::Running;
            thread.kernel_rsp
        };
        if let Some(hook) = self.on_context_switch {
            if let Some(thread) = self.threads.get(next) {
                log::trace!(
                    "scheduler: context switch {} -> {} \"{}\"",
                    old,
                    next,
                    thread.name
                );
                hook(thread);
            }
        }
        let old_slot = self.threads.get_mut(old).map(|t| &mut t.kernel_rsp as *mut u64)?;
        Some((old_slot, new_rsp))
    }

    /// Mark a thread terminated and queue it for the reaper. The caller
    /// triggers the context switch when the running thread terminated
    /// itself.
    pub fn terminate(&mut self, handle: u16) -> bool {
        let Some(thread) = self.threads.get_mut(handle) else {
            return false;
        };
        thread.state = ThreadState::Terminated;
        thread.policy = None;
        self.terminated.push_back(handle);
        true
    }

    /// Terminate a thread that is not running: it is pulled out of the
    /// ready queue if present and handed to the reaper. The running thread
    /// is refused; terminating it requires the switching path.
    pub fn terminate_thread(&mut self, handle: u16) -> bool {
        if handle == self.running || !self.threads.contains(handle) {
            return false;
        }
        self.ready.remove(handle);
        self.terminate(handle)
    }

    /// Drop reaped threads from the table, freeing their kernel stacks.
    pub fn reap_terminated(&mut self) -> usize {
        let mut reaped = 0;
        while let Some(handle) = self.terminated.pop_front() {
            if self.threads.remove(handle).is_some() {
                reaped += 1;
            }
        }
        reaped
    }

    pub fn running_thread(&self) -> u16 {
        self.running
    }

    pub fn idle_thread(&self) -> u16 {
        self.idle
    }

    pub fn reaper_thread(&self) -> u16 {
        self.reaper
    }

    pub fn is_preemption_allowed(&self) -> bool {
        self.allow_preemption
    }

    pub fn ready_queue(&mut self) -> &mut MultiLevelQueue {
        &mut self.ready
    }

    pub fn has_terminated_threads(&self) -> bool {
        !self.terminated.is_empty()
    }

    pub fn set_on_context_switch(&mut self, hook: fn(&Thread)) {
        self.on_context_switch = Some(hook);
    }

    pub fn thread(&self, handle: u16) -> Option<&Thread> {
        self.threads.get(handle)
    }

    pub fn thread_mut(&mut self, handle: u16) -> Option<&mut Thread> {
        self.threads.get_mut(handle)
    }

    pub fn thread_count(&self) -> usize {
        self.threads.len()
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Global instance and the lock discipline
// ---------------------------------------------------------------------------

static SCHEDULER: Mutex<Option<Scheduler>> = Mutex::new(None);

/// Interrupt-disable depth; the first lock disables interrupts.
static IRQ_DISABLE_COUNT: AtomicU32 = AtomicU32::new(0);
/// Context-switch postponement depth.
static POSTPONE_COUNT: AtomicU32 = AtomicU32::new(0);
/// A switch was requested while postponed.
static SWITCH_PENDING: AtomicBool = AtomicBool::new(false);
/// Until the interrupt controller is set up, `unlock` must never turn
/// interrupts on.
static INTERRUPTS_READY: AtomicBool = AtomicBool::new(false);

/// Allow `unlock` to re-enable interrupts from now on. Called once the
/// IDT is loaded and the PIC remapped.
pub fn enable_interrupt_delivery() {
    INTERRUPTS_READY.store(true, Ordering::SeqCst);
    if IRQ_DISABLE_COUNT.load(Ordering::SeqCst) == 0 {
        interrupts_enable();
    }
}

fn interrupts_enable_checked() {
    if INTERRUPTS_READY.load(Ordering::SeqCst) {
        interrupts_enable();
    }
}

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
fn interrupts_disable() {
    x86_64::instructions::interrupts::disable();
}

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
fn interrupts_enable() {
    x86_64::instructions::interrupts::enable();
}

#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
fn interrupts_disable() {}

#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
fn interrupts_enable() {}

/// Enter a scheduler-locked region: interrupts off, switches postponed.
/// Reentrant.
pub fn lock() {
    if IRQ_DISABLE_COUNT.fetch_add(1, Ordering::SeqCst) == 0 {
        interrupts_disable();
    }
    POSTPONE_COUNT.fetch_add(1, Ordering::SeqCst);
}

/// Leave a scheduler-locked region. When the last postponement lock drops
/// and a switch is pending, it happens here; when the last interrupt lock
/// drops, interrupts come back on.
pub fn unlock() {
    if POSTPONE_COUNT.fetch_sub(1, Ordering::SeqCst) == 1 && SWITCH_PENDING.swap(false, Ordering::SeqCst)
    {
        perform_switch();
    }
    if IRQ_DISABLE_COUNT.fetch_sub(1, Ordering::SeqCst) == 1 {
        interrupts_enable_checked();
    }
}

/// Current depth of both lock counters, for the round-trip assertions of
/// the test suite and debug dumps.
pub fn lock_depth() -> (u32, u32) {
    (
        IRQ_DISABLE_COUNT.load(Ordering::SeqCst),
        POSTPONE_COUNT.load(Ordering::SeqCst),
    )
}

/// Trigger a context switch to the next ready thread.
///
/// The caller is responsible for holding the scheduler lock; the switch is
/// then deferred to the final `unlock`.
pub fn execute_next_thread() {
    if POSTPONE_COUNT.load(Ordering::SeqCst) > 0 {
        SWITCH_PENDING.store(true, Ordering::SeqCst);
        return;
    }
    perform_switch();
}

fn perform_switch() {
    let staged = SCHEDULER.lock().as_mut().and_then(|s| s.prepare_switch());
    if let Some((old_slot, new_rsp)) = staged {
        unsafe { context::switch_to_thread(old_slot, new_rsp) };
    }
}

/// Entry shim of every new thread.
///
/// The first context switch lands here with one interrupt-disable level
/// held on behalf of the thread that switched away; balance it, run the
/// thread main, then terminate.
pub extern "C" fn thread_enter() {
    if IRQ_DISABLE_COUNT.fetch_sub(1, Ordering::SeqCst) == 1 {
        interrupts_enable_checked();
    }

    let (main, mut start_info) = {
        lock();
        let info = SCHEDULER
            .lock()
            .as_ref()
            .and_then(|s| s.thread(s.running_thread()))
            .map(|t| t.start_info)
            .unwrap_or_default();
        unlock();
        (info.main, info)
    };

    let code = match main {
        Some(main) => main(&mut start_info),
        None => {
            log::error!("scheduler: thread entered without a main function");
            -1
        }
    };
    thread_exit(code);
}

/// Terminate the running thread. Never returns.
pub fn thread_exit(code: i32) -> ! {
    lock();
    let handle = SCHEDULER
        .lock()
        .as_mut()
        .map(|s| {
            let running = s.running_thread();
            s.terminate(running);
            running
        })
        .unwrap_or(0);
    log::trace!("scheduler: thread {} exited with code {}", handle, code);
    crate::process::notify_thread_exited(handle, code);
    execute_next_thread();
    unlock();
    unreachable!("terminated thread was rescheduled");
}

/// Initialize the global scheduler.
pub fn init(base_pt_addr: u64, boot_stack_top: u64) -> bool {
    let mut guard = SCHEDULER.lock();
    let mut scheduler = Scheduler::new();
    if scheduler.init(base_pt_addr, boot_stack_top).is_none() {
        return false;
    }
    *guard = Some(scheduler);
    drop(guard);
    log::info!("scheduler: bootstrap, idle and reaper threads ready");
    true
}

/// Run `f` on the global scheduler under its spin lock, within a
/// scheduler-locked region.
pub fn with_scheduler<R>(f: impl FnOnce(&mut Scheduler) -> R) -> Option<R> {
    lock();
    let result = SCHEDULER.lock().as_mut().map(f);
    unlock();
    result
}

/// Handle of the running thread (0 before the scheduler is up).
pub fn current_thread_handle() -> u16 {
    SCHEDULER
        .lock()
        .as_ref()
        .map(|s| s.running_thread())
        .unwrap_or(0)
}

/// The idle thread's main: yield after every interrupt wakeup. Preemption
/// is disabled while idle runs; this loop hands the CPU back instead.
fn idle_main(_info: &mut StartInfo) -> i32 {
    loop {
        halt();
        lock();
        execute_next_thread();
        unlock();
    }
}

/// The reaper's main: free terminated threads' stacks, then sleep until
/// selected again.
fn reaper_main(_info: &mut StartInfo) -> i32 {
    loop {
        lock();
        if let Some(scheduler) = SCHEDULER.lock().as_mut() {
            let reaped = scheduler.reap_terminated();
            if reaped > 0 {
                log::trace!("scheduler: reaped {} threads", reaped);
            }
            let reaper = scheduler.reaper_thread();
            if let Some(me) = scheduler.thread_mut(reaper) {
                me.state = ThreadState::Waiting;
            }
        }
        execute_next_thread();
        unlock();
    }
}

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
fn halt() {
    x86_64::instructions::hlt();
}

#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
fn halt() {
    core::hint::spin_loop();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy_main(_info: &mut StartInfo) -> i32 {
        0
    }

    fn started_scheduler() -> Scheduler {
        let mut s = Scheduler::new();
        s.init(0x1000, 0xFFFF_8000_0010_0000).unwrap();
        s
    }

    fn spawn(s: &mut Scheduler, name: &str, policy: SchedulingPolicy) -> u16 {
        s.schedule_new_thread(
            name.to_string(),
            dummy_main,
            0,
            0,
            0x1000,
            Some(policy),
            Stack::default(),
            0,
        )
        .unwrap()
    }

    /// Switch away from the running thread as if it blocked.
    fn block_and_switch(s: &mut Scheduler) -> u16 {
        let running = s.running_thread();
        s.thread_mut(running).unwrap().state = ThreadState::Waiting;
        s.prepare_switch();
        s.running_thread()
    }

    #[test]
    fn test_multilevel_queue_priorities() {
        let mut q = MultiLevelQueue::new();
        q.enqueue(1, SchedulingPolicy::Background);
        q.enqueue(2, SchedulingPolicy::Normal);
        q.enqueue(3, SchedulingPolicy::LowLatency);
        q.enqueue(4, SchedulingPolicy::Normal);
        assert_eq!(q.dequeue(), Some(3));
        assert_eq!(q.dequeue(), Some(2));
        assert_eq!(q.dequeue(), Some(4));
        assert_eq!(q.dequeue(), Some(1));
        assert_eq!(q.dequeue(), None);
    }

    #[test]
    fn test_queue_roundtrip_without_higher_priority() {
        let mut q = MultiLevelQueue::new();
        q.enqueue(9, SchedulingPolicy::Normal);
        assert_eq!(q.dequeue(), Some(9));
    }

    #[test]
    fn test_refuses_thread_without_policy() {
        let mut s = started_scheduler();
        let before = s.thread_count();
        let result = s.schedule_new_thread(
            "nope".to_string(),
            dummy_main,
            0,
            0,
            0,
            None,
            Stack::default(),
            0,
        );
        assert!(result.is_none());
        assert_eq!(s.thread_count(), before);
    }

    #[test]
    fn test_priority_scheduling_order() {
        let mut s = started_scheduler();
        let t1 = spawn(&mut s, "T1", SchedulingPolicy::Background);
        let t2 = spawn(&mut s, "T2", SchedulingPolicy::Normal);
        let t3 = spawn(&mut s, "T3", SchedulingPolicy::LowLatency);
        let t4 = spawn(&mut s, "T4", SchedulingPolicy::Normal);

        assert_eq!(block_and_switch(&mut s), t3);
        assert_eq!(block_and_switch(&mut s), t2);
        assert_eq!(block_and_switch(&mut s), t4);
        assert_eq!(block_and_switch(&mut s), t1);
    }

    #[test]
    fn test_fifo_within_class() {
        let mut s = started_scheduler();
        let a = spawn(&mut s, "a", SchedulingPolicy::Normal);
        let b = spawn(&mut s, "b", SchedulingPolicy::Normal);
        let c = spawn(&mut s, "c", SchedulingPolicy::Normal);

        // Each thread runs once before any runs twice: the running thread
        // is requeued behind the others on every switch.
        assert_eq!(block_and_switch(&mut s), a);
        s.prepare_switch();
        assert_eq!(s.running_thread(), b);
        s.prepare_switch();
        assert_eq!(s.running_thread(), c);
        s.prepare_switch();
        assert_eq!(s.running_thread(), a);
    }

    #[test]
    fn test_empty_queue_selects_idle() {
        let mut s = started_scheduler();
        let idle = s.idle_thread();
        assert_eq!(block_and_switch(&mut s), idle);
        // Idle stays put when nothing else is ready.
        assert!(s.prepare_switch().is_none());
        assert!(!s.is_preemption_allowed());
    }

    #[test]
    fn test_running_thread_keeps_cpu_over_idle() {
        let mut s = started_scheduler();
        let bootstrap = s.running_thread();
        // Running and nothing ready: no switch to idle.
        assert!(s.prepare_switch().is_none());
        assert_eq!(s.running_thread(), bootstrap);
    }

    #[test]
    fn test_reaper_runs_when_threads_terminate() {
        let mut s = started_scheduler();
        let t = spawn(&mut s, "doomed", SchedulingPolicy::Normal);
        assert!(s.terminate_thread(t));
        let reaper = s.reaper_thread();
        let running = s.running_thread();
        s.thread_mut(running).unwrap().state = ThreadState::Waiting;
        s.prepare_switch();
        assert_eq!(s.running_thread(), reaper);

        // Reaping removes the thread and frees its slot.
        assert_eq!(s.reap_terminated(), 1);
        assert!(s.thread(t).is_none());
    }

    #[test]
    fn test_terminate_refuses_running_thread() {
        let mut s = started_scheduler();
        let running = s.running_thread();
        assert!(!s.terminate_thread(running));
    }

    #[test]
    fn test_lock_unlock_round_trip() {
        // Other test threads may bump the global counters concurrently;
        // retry until an undisturbed round trip is observed.
        for _ in 0..100 {
            let before = lock_depth();
            lock();
            lock();
            let depth = lock_depth();
            unlock();
            unlock();
            let after = lock_depth();
            if depth == (before.0 + 2, before.1 + 2) && after == before {
                return;
            }
        }
        panic!("lock depth never returned to its pre-lock value");
    }

    #[test]
    fn test_terminated_thread_not_requeued() {
        let mut s = started_scheduler();
        let t = spawn(&mut s, "t", SchedulingPolicy::Normal);
        assert_eq!(block_and_switch(&mut s), t);
        // Thread terminates itself: not requeued, reaper next.
        s.terminate(t);
        s.prepare_switch();
        assert_eq!(s.running_thread(), s.reaper_thread());
    }
}
