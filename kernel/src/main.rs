//! Bare-metal entry point for the Helios kernel.
//!
//! The bootloader hands over a physical-memory map and a straight map of
//! all physical memory; boot wires the allocator stack together in
//! dependency order (heap → buddy → page-table driver → kernel address
//! space → slab/kmalloc → filesystems → tick source) and then parks the
//! BSP on the idle loop. Everything interesting happens in the library
//! crate.

#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
mod boot {
    extern crate alloc;

    use alloc::sync::Arc;
    use alloc::vec::Vec;

    use bootloader_api::config::Mapping;
    use bootloader_api::info::MemoryRegionKind;
    use bootloader_api::{entry_point, BootInfo, BootloaderConfig};

    use helios_kernel::arch::x86_64::mmu::X86PageOps;
    use helios_kernel::arch::x86_64::serial::SerialConsole;
    use helios_kernel::arch::x86_64::timer as tick_source;
    use helios_kernel::mm::frame_allocator::PhysMemory;
    use helios_kernel::mm::vmm::Memory;
    use helios_kernel::mm::{heap, Zone, PAGE_SIZE};
    use helios_kernel::state::{init_kernel, KernelState};
    use helios_kernel::println;

    /// Kernel block for dynamic kernel mappings.
    const KERNEL_DYN_BASE: u64 = 0xFFFF_C000_0000_0000;
    const KERNEL_DYN_SIZE: u64 = 1 << 30;

    /// Frames reserved for page tables at boot.
    const TABLE_POOL_FRAMES: usize = 1024;

    pub static BOOTLOADER_CONFIG: BootloaderConfig = {
        let mut config = BootloaderConfig::new_default();
        config.mappings.physical_memory = Some(Mapping::Dynamic);
        config
    };

    entry_point!(kernel_main, config = &BOOTLOADER_CONFIG);

    fn kernel_main(boot_info: &'static mut BootInfo) -> ! {
        // The heap comes first: every later structure lives on it.
        heap::init();

        println!("helios v{}", env!("CARGO_PKG_VERSION"));

        let phys_offset = boot_info
            .physical_memory_offset
            .into_option()
            .expect("bootloader must map physical memory");

        // Donate every usable region to the buddy zones.
        let mut phys = PhysMemory::new(phys_offset, 1);
        for region in boot_info.memory_regions.iter() {
            if region.kind == MemoryRegionKind::Usable {
                let _ = phys.add_system_region(0, region.start, region.end);
            }
        }

        // Page-table driver with a frame pool for intermediate tables.
        let ops: &'static X86PageOps =
            alloc::boxed::Box::leak(alloc::boxed::Box::new(X86PageOps::new(phys_offset)));
        let mut table_frames = Vec::with_capacity(TABLE_POOL_FRAMES);
        for _ in 0..TABLE_POOL_FRAMES {
            match phys.alloc(0, Zone::Kernel, 0).or_else(|_| phys.alloc(0, Zone::NumaAware, 0)) {
                Ok(virt) => table_frames.push(phys.v2p(virt)),
                Err(_) => break,
            }
        }
        ops.donate_table_frames(table_frames);

        // The kernel address space over the live boot tables.
        let mut mem = Memory::new(phys, ops.current_space(), ops);
        mem.block_add(KERNEL_DYN_BASE, KERNEL_DYN_BASE + KERNEL_DYN_SIZE - 1)
            .expect("kernel block");

        let state = init_kernel(KernelState::bootstrap(mem).expect("kernel state"))
            .expect("kernel state published once");

        state.consoles.register(Arc::new(SerialConsole));
        helios_kernel::drivers::console::init_logging();
        log::info!("memory and filesystems up");

        // Boot image, when the loader placed one at the fixed base.
        let initramfs_virt = phys_offset + helios_kernel::fs::initramfs::INITRAMFS_PHYS_BASE;
        // SAFETY: The straight map covers the fixed initramfs window; the
        // slice is only parsed, never written.
        let image = unsafe {
            core::slice::from_raw_parts(initramfs_virt as *const u8, (PAGE_SIZE * 4096) as usize)
        };
        match state.load_initramfs(image) {
            Ok(()) => log::info!("initramfs mounted at /"),
            Err(e) => log::warn!("no initramfs: {}", e),
        }

        // Idle task for the BSP, then the tick source.
        {
            let mut tasks = state.tasks.lock();
            let idle = tasks.alloc();
            tasks.set_idle(0, idle);
        }
        tick_source::init();
        log::info!("scheduling at {} Hz", helios_kernel::timer::HZ);

        x86_64::instructions::interrupts::enable();
        loop {
            x86_64::instructions::hlt();
        }
    }

    #[panic_handler]
    fn panic(info: &core::panic::PanicInfo) -> ! {
        // Fatal path: quiesce locally, tell the other CPUs to stop, then
        // paint the diagnostic and halt for good.
        x86_64::instructions::interrupts::disable();
        println!("");
        println!("==== kernel panic ====");
        println!("{}", info);
        helios_kernel::arch::halt();
    }
}

#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
fn main() {
    // The kernel only runs on bare-metal x86_64; the host build exists
    // for `cargo test` against the library crate.
}
