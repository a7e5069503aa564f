//! Standard streams.
//!
//! Keyboard input arrives from interrupt context through a bounded
//! lock-free queue; `read_std_in` drains it, sleeping between polls while
//! it is empty. Output is routed through replaceable sink functions so the
//! terminal renderer (outside this tree) can take over from the serial
//! fallback.

use conquer_once::spin::OnceCell;
use crossbeam_queue::ArrayQueue;

/// Capacity of the keycode queue. Keycodes beyond this are dropped with a
/// warning, never blocking the interrupt handler.
const KEY_QUEUE_SIZE: usize = 128;

static KEY_QUEUE: OnceCell<ArrayQueue<u16>> = OnceCell::uninit();

/// Sink of standard output text.
static STDOUT_SINK: spin::Mutex<fn(&str)> = spin::Mutex::new(serial_sink);
/// Sink of standard error text.
static STDERR_SINK: spin::Mutex<fn(&str)> = spin::Mutex::new(serial_sink);

fn serial_sink(text: &str) {
    log::info!(target: "stdout", "{}", text);
}

/// Initialize the keycode queue. Must run before the keyboard interrupt is
/// unmasked.
pub fn init() {
    KEY_QUEUE
        .try_init_once(|| ArrayQueue::new(KEY_QUEUE_SIZE))
        .expect("stdio: init called twice");
}

/// Push a keycode from interrupt context. Must not allocate or block.
pub fn push_keycode(code: u16) {
    if let Ok(queue) = KEY_QUEUE.try_get() {
        if queue.push(code).is_err() {
            log::warn!("stdio: keycode queue full, dropping input");
        }
    } else {
        log::warn!("stdio: keycode arrived before stdio init");
    }
}

/// Pop a keycode without blocking.
pub fn try_read_keycode() -> Option<u16> {
    KEY_QUEUE.try_get().ok().and_then(|queue| queue.pop())
}

/// Blocking keycode read: polls the queue, sleeping between attempts.
pub fn read_keycode() -> u16 {
    loop {
        if let Some(code) = try_read_keycode() {
            return code;
        }
        crate::time::sleep_milli(2);
    }
}

/// Replace the standard output sink (e.g. with the terminal renderer).
pub fn set_stdout_sink(sink: fn(&str)) {
    *STDOUT_SINK.lock() = sink;
}

pub fn set_stderr_sink(sink: fn(&str)) {
    *STDERR_SINK.lock() = sink;
}

/// Write to standard output; returns the number of bytes consumed.
pub fn write_std_out(text: &str) -> usize {
    let sink = *STDOUT_SINK.lock();
    sink(text);
    text.len()
}

/// Write to standard error; returns the number of bytes consumed.
pub fn write_std_err(text: &str) -> usize {
    let sink = *STDERR_SINK.lock();
    sink(text);
    text.len()
}
