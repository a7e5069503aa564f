//! Boot sequence.
//!
//! Phases run in strict order: serial/logging, memory (frames, address
//! space, heap), threading (scheduler, interrupts, timer), filesystems
//! (block devices, VFS, FAT mount), then the handoff to the first kernel
//! thread. A failed mandatory phase is fatal: the reason is written to the
//! log and the CPU parks in an interrupt-wait loop.

use crate::fs::vfs::path::Path;
use crate::task::thread::StartInfo;

/// Park the CPU forever. The terminal fate of failed mandatory boot
/// phases and runtime-support callbacks.
pub fn halt_forever() -> ! {
    loop {
        #[cfg(all(target_arch = "x86_64", target_os = "none"))]
        x86_64::instructions::hlt();
        #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
        core::hint::spin_loop();
    }
}

macro_rules! fatal {
    ($($arg:tt)*) => {{
        log::error!($($arg)*);
        log::error!("boot: halting");
        halt_forever();
    }};
}

/// Kernel entry, called by the boot stub with the bootloader's info.
#[cfg(target_os = "none")]
pub fn boot(boot_info: &'static mut bootloader_api::BootInfo) -> ! {
    // Phase 0: output.
    #[cfg(target_arch = "x86_64")]
    crate::serial::init();
    crate::logger::init(log::LevelFilter::Info);
    log::info!("vesper: booting");

    // Phase 1: memory.
    let hhdm_offset = match boot_info.physical_memory_offset.into_option() {
        Some(offset) => offset,
        None => fatal!("boot: bootloader provided no physical memory mapping"),
    };
    let mut phys_map = crate::memory::map::from_boot_regions(&boot_info.memory_regions);
    let kernel_code = crate::memory::map::MemoryRegion::new(
        boot_info.kernel_addr,
        boot_info.kernel_len,
        crate::memory::map::MemoryRegionKind::KernelCode,
    );
    if phys_map
        .claim(kernel_code, crate::memory::paging::PAGE_SIZE)
        .is_err()
    {
        log::warn!("boot: kernel image region not claimable in the physical map");
    }
    if let Err(err) = crate::memory::init(phys_map, hhdm_offset, kernel_code) {
        fatal!("boot: memory initialization failed: {:?}", err);
    }

    // Phase 2: threading.
    let base_pt = crate::memory::paging::current_base_page_table();
    let stack_top = current_stack_pointer();
    if !crate::task::scheduler::init(base_pt, stack_top) {
        fatal!("boot: scheduler initialization failed");
    }
    crate::task::scheduler::with_scheduler(|s| s.set_on_context_switch(load_thread_address_space));
    crate::io::stdio::init();
    #[cfg(target_arch = "x86_64")]
    crate::interrupts::init();

    // Phase 3: filesystems. The bootstrap stack belongs to the bootloader;
    // everything after this handoff runs on kernel-owned stacks.
    let ramdisk = boot_info
        .ramdisk_addr
        .into_option()
        .map(|addr| (addr, boot_info.ramdisk_len));
    if let Some((addr, len)) = ramdisk {
        let image =
            unsafe { core::slice::from_raw_parts(addr as *const u8, len as usize) }.to_vec();
        let disk = crate::block::ram_disk::RamDisk::from_image(512, image);
        match crate::block::register_device(
            alloc::string::String::from("ramdisk"),
            alloc::boxed::Box::new(disk),
        ) {
            Some(device) => mount_root(device),
            None => fatal!("boot: ramdisk registration failed"),
        }
    } else {
        log::warn!("boot: no ramdisk, starting without a root filesystem");
    }

    // Reclaim what the bootloader no longer needs.
    crate::memory::with_vmm(|vmm| vmm.pmm().claim_bootloader_reclaimable());

    let spawned = crate::task::scheduler::with_scheduler(|s| {
        s.schedule_new_thread(
            alloc::string::String::from("kmain"),
            kernel_main_thread,
            0,
            0,
            base_pt,
            Some(crate::task::thread::SchedulingPolicy::Normal),
            crate::task::thread::Stack::default(),
            0,
        )
    })
    .flatten();
    if spawned.is_none() {
        fatal!("boot: failed to spawn the main kernel thread");
    }

    // Discard the bootstrap thread; its stack dies with the bootloader
    // memory.
    crate::task::scheduler::thread_exit(0);
}

/// Mount the root device with the FAT driver. Fatal on failure: the
/// system loader image lives on the root volume.
#[cfg_attr(not(target_os = "none"), allow(dead_code))]
fn mount_root(device: u16) {
    use crate::fs::vfs::status::MountStatus;
    let status = crate::fs::vfs::with_vfs(|vfs| {
        let driver = vfs.install_driver(alloc::boxed::Box::new(crate::fs::fat::FatDriver::new()));
        vfs.mount(Path::root(), device, driver)
    });
    if status != MountStatus::Mounted {
        fatal!("boot: mounting the root volume failed: {:?}", status);
    }
}

/// First real kernel thread: bring up user space.
#[cfg_attr(not(target_os = "none"), allow(dead_code))]
fn kernel_main_thread(_info: &mut StartInfo) -> i32 {
    log::info!("vesper: kernel threads running, uptime {} ms", crate::time::uptime_ms());
    match crate::process::start_app(
        &Path::new("/apps/init"),
        &[],
        Path::root(),
        0,
        0,
        0,
    ) {
        Ok(app) => {
            log::info!("vesper: init app {} started", app);
        }
        Err(err) => {
            log::warn!("vesper: no init app started: {:?}", err);
        }
    }
    0
}

/// Hook run on every context switch: load the incoming thread's address
/// space.
#[cfg_attr(not(target_os = "none"), allow(dead_code))]
fn load_thread_address_space(thread: &crate::task::thread::Thread) {
    let base_pt = thread.base_page_table_addr;
    if base_pt != 0 {
        crate::memory::with_vmm(|vmm| {
            if vmm.current_base().phys != base_pt {
                vmm.load_vas(base_pt);
            }
        });
    }
}

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
fn current_stack_pointer() -> u64 {
    let rsp: u64;
    unsafe { core::arch::asm!("mov {}, rsp", out(reg) rsp) };
    rsp
}

#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
#[allow(dead_code)]
fn current_stack_pointer() -> u64 {
    0
}
