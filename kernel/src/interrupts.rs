//! Interrupt handling: IDT, legacy PIC, timer tick and keyboard input.
//!
//! The timer tick is the only code that preempts on its own initiative,
//! and only when the scheduler currently allows it.

use crate::task::scheduler;
use conquer_once::spin::OnceCell;
use pic8259::ChainedPics;
use spin::Mutex;
use x86_64::instructions::port::Port;
use x86_64::structures::idt::{InterruptDescriptorTable, InterruptStackFrame};

pub const PIC_1_OFFSET: u8 = 32;
pub const PIC_2_OFFSET: u8 = PIC_1_OFFSET + 8;

pub static PICS: Mutex<ChainedPics> =
    Mutex::new(unsafe { ChainedPics::new(PIC_1_OFFSET, PIC_2_OFFSET) });

#[derive(Debug, Clone, Copy)]
#[repr(u8)]
pub enum InterruptIndex {
    Timer = PIC_1_OFFSET,
    Keyboard,
}

impl InterruptIndex {
    fn as_u8(self) -> u8 {
        self as u8
    }
}

static IDT: OnceCell<InterruptDescriptorTable> = OnceCell::uninit();

/// Build and load the IDT, remap the PIC and unmask timer and keyboard.
pub fn init() {
    let _ = IDT.try_init_once(|| {
        let mut idt = InterruptDescriptorTable::new();
        idt.breakpoint.set_handler_fn(breakpoint_handler);
        idt.double_fault.set_handler_fn(double_fault_handler);
        idt.page_fault.set_handler_fn(page_fault_handler);
        idt.general_protection_fault
            .set_handler_fn(general_protection_handler);
        idt[InterruptIndex::Timer.as_u8()].set_handler_fn(timer_handler);
        idt[InterruptIndex::Keyboard.as_u8()].set_handler_fn(keyboard_handler);
        idt
    });
    let idt = IDT.try_get().expect("interrupts: IDT initialization failed");
    idt.load();

    unsafe {
        PICS.lock().initialize();
        // Unmask only timer and keyboard lines.
        PICS.lock().write_masks(0b1111_1100, 0b1111_1111);
    }
    scheduler::enable_interrupt_delivery();
    log::info!("interrupts: IDT loaded, PIC remapped");
}

extern "x86-interrupt" fn breakpoint_handler(frame: InterruptStackFrame) {
    log::warn!("interrupts: breakpoint at {:?}", frame.instruction_pointer);
}

extern "x86-interrupt" fn double_fault_handler(frame: InterruptStackFrame, code: u64) -> ! {
    panic!("double fault (code {}): {:?}", code, frame);
}

extern "x86-interrupt" fn general_protection_handler(frame: InterruptStackFrame, code: u64) {
    panic!("general protection fault (code {}): {:?}", code, frame);
}

extern "x86-interrupt" fn page_fault_handler(
    frame: InterruptStackFrame,
    code: x86_64::structures::idt::PageFaultErrorCode,
) {
    let addr = x86_64::registers::control::Cr2::read();
    panic!("page fault at {:?} ({:?}): {:?}", addr, code, frame);
}

/// Timer tick: advance time, wake sleepers, then preempt when allowed.
extern "x86-interrupt" fn timer_handler(_frame: InterruptStackFrame) {
    unsafe {
        PICS.lock().notify_end_of_interrupt(InterruptIndex::Timer.as_u8());
    }

    scheduler::lock();
    crate::time::tick();
    let preempt = scheduler::with_scheduler(|s| s.is_preemption_allowed()).unwrap_or(false);
    if preempt {
        scheduler::execute_next_thread();
    }
    scheduler::unlock();
}

/// Keyboard: push the scancode into the stdin queue.
extern "x86-interrupt" fn keyboard_handler(_frame: InterruptStackFrame) {
    let mut port = Port::new(0x60);
    let scancode: u8 = unsafe { port.read() };
    crate::io::stdio::push_keycode(scancode as u16);

    unsafe {
        PICS.lock()
            .notify_end_of_interrupt(InterruptIndex::Keyboard.as_u8());
    }
}
