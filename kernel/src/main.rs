//! Boot stub: hands the bootloader's info to the kernel.

#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]

#[cfg(target_os = "none")]
mod stub {
    use bootloader_api::{entry_point, BootInfo, BootloaderConfig};

    pub static BOOTLOADER_CONFIG: BootloaderConfig = {
        let mut config = BootloaderConfig::new_default();
        config.mappings.physical_memory = Some(bootloader_api::config::Mapping::FixedAddress(
            kernel::memory::layout::HHDM_BASE,
        ));
        config
    };

    entry_point!(kernel_entry, config = &BOOTLOADER_CONFIG);

    fn kernel_entry(boot_info: &'static mut BootInfo) -> ! {
        kernel::boot::boot(boot_info)
    }

    #[panic_handler]
    fn panic(info: &core::panic::PanicInfo) -> ! {
        log::error!("kernel panic: {}", info);
        kernel::boot::halt_forever()
    }
}

#[cfg(not(target_os = "none"))]
fn main() {
    // The kernel only runs on the bare-metal target; this stub exists so
    // hosted builds of the workspace succeed.
    eprintln!("vesper: build for the x86_64-unknown-none target to boot this kernel");
}
