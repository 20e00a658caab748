//! End-to-end scenarios across the assembled kernel state.

extern crate alloc;

use alloc::sync::Arc;

use crate::error::KernelError;
use crate::mm::frame_allocator::PhysMemory;
use crate::mm::{Zone, PAGE_SIZE};
use crate::sched::TaskState;
use crate::state::test_support::fresh_state;
use crate::syscall::process::tests::spawn_current;
use crate::syscall::{driver, io, process};

#[test]
fn boot_allocator_stack_end_to_end() {
    // Buddy zones feed the kernel address space, which feeds the slab
    // allocator, which backs kmalloc: one allocation through every
    // layer, then back down again.
    let state = fresh_state();

    let page = {
        let mut mm = state.mm.lock();
        mm.alloc_pages(1, Zone::NumaAware, 0).unwrap()
    };
    let obj = state.kmalloc(96).unwrap();
    assert_ne!(obj, 0);
    state.kfree(obj).unwrap();
    state.mm.lock().free_pages(page).unwrap();
}

#[test]
fn buddy_boot_region_carves_and_restores() {
    // Boot scenario: a multi-GiB donation lands in top orders, an
    // order-9 block splits it, and the free restores the top order.
    let mut phys = PhysMemory::new(0, 1);
    phys.add_region(Zone::NumaAware, 0, 0x4000_0000, 0x1_0000_0000)
        .unwrap();
    let zone = phys.zone(Zone::NumaAware, 0);
    let top_before = zone.free_count(crate::mm::PHYS_BUDDY_MAX_ORDER);
    assert!(top_before >= 3);

    let run = phys.alloc(9, Zone::NumaAware, 0).unwrap();
    assert_eq!(run % (PAGE_SIZE << 9), 0);
    phys.free(run, 9, Zone::NumaAware, 0);
    assert_eq!(
        phys.zone(Zone::NumaAware, 0)
            .free_count(crate::mm::PHYS_BUDDY_MAX_ORDER),
        top_before
    );
}

#[test]
fn devfs_round_trip_with_blocking_reader() {
    let state = fresh_state();

    // The driver process registers /dev/console and pushes five bytes.
    let (driver_pid, _driver_task) = spawn_current(&state, 1);
    let index = driver::driver_register(&state, 1, "console").unwrap() as usize;
    {
        let mut tasks = state.tasks.lock();
        for b in *b"hell" {
            state.devfs.driver_putc(&mut tasks, index, driver_pid, b).unwrap();
        }
        assert_eq!(
            state
                .devfs
                .driver_write(&mut tasks, index, driver_pid, b"o")
                .unwrap(),
            1
        );
    }

    // A user process opens the device through the VFS and drains it.
    let (user_pid, user_task) = spawn_current(&state, 0);
    let fdn = io::open_path(&state, user_pid, "/dev/console").unwrap();
    let mut buf = [0u8; 10];
    assert_eq!(io::sys_read(&state, 0, fdn, &mut buf).unwrap(), 5);
    assert_eq!(&buf[..5], b"hello");

    // Empty device: the reader blocks...
    assert_eq!(
        io::sys_read(&state, 0, fdn, &mut buf).unwrap_err(),
        KernelError::WouldBlock
    );
    assert_eq!(
        state.tasks.lock().task(user_task).unwrap().state,
        TaskState::Blocked
    );

    // ...until the driver's next write of three bytes wakes it, and the
    // retried read returns exactly those three.
    {
        let mut tasks = state.tasks.lock();
        state
            .devfs
            .driver_write(&mut tasks, index, driver_pid, b"xyz")
            .unwrap();
    }
    assert_eq!(
        state.tasks.lock().task(user_task).unwrap().state,
        TaskState::Ready
    );
    assert_eq!(io::sys_read(&state, 0, fdn, &mut buf).unwrap(), 3);
    assert_eq!(&buf[..3], b"xyz");
}

#[test]
fn user_write_reaches_the_driver() {
    let state = fresh_state();
    let (driver_pid, driver_task) = spawn_current(&state, 1);
    let index = driver::driver_register(&state, 1, "tty0").unwrap() as usize;

    // Driver parks waiting for work.
    state.tasks.lock().block(driver_task, None).unwrap();

    let (user_pid, _user_task) = spawn_current(&state, 0);
    let fdn = io::open_path(&state, user_pid, "/dev/tty0").unwrap();
    assert_eq!(io::sys_write(&state, 0, fdn, b"ls\n").unwrap(), 3);

    // The write readied the driver, and the bytes sit in its output
    // ring.
    assert_eq!(
        state.tasks.lock().task(driver_task).unwrap().state,
        TaskState::Ready
    );
    assert_eq!(
        state.devfs.driver_getc(index, driver_pid).unwrap(),
        Some(b'l')
    );
    assert_eq!(
        state.devfs.driver_getc(index, driver_pid).unwrap(),
        Some(b's')
    );
    assert_eq!(
        state.devfs.driver_getc(index, driver_pid).unwrap(),
        Some(b'\n')
    );
    assert_eq!(state.devfs.driver_getc(index, driver_pid).unwrap(), None);
}

#[test]
fn fork_shares_pages_through_shadow_objects() {
    let state = fresh_state();
    let (parent_pid, _task) = spawn_current(&state, 0);

    // Give the parent one mapped page inside its program block.
    {
        let mut mm = state.mm.lock();
        let mut procs = state.procs.lock();
        let ifs = mm.ifs();
        let proc = procs.get_mut(parent_pid).unwrap();
        proc.vmem
            .alloc_pages_at(
                &mut mm.phys,
                ifs,
                crate::process::PROC_PROG_ADDR,
                1,
                Zone::NumaAware,
                0,
            )
            .unwrap();
    }

    let child_pid = process::sys_fork(&state, 0).unwrap();

    let procs = state.procs.lock();
    let parent = procs.get(parent_pid).unwrap();
    let child = procs.get(child_pid).unwrap();

    let pe = parent.vmem.entry_at(crate::process::PROC_PROG_ADDR).unwrap();
    let ce = child.vmem.entry_at(crate::process::PROC_PROG_ADDR).unwrap();

    // Both sides hold CoW-marked shadow entries over one shared backing
    // object; the physical page is not copied.
    assert!(pe.2.contains(crate::mm::VmFlags::COW));
    assert!(ce.2.contains(crate::mm::VmFlags::COW));
    let parent_of = |o: &crate::mm::vas::ObjectRef| match &o.lock().kind {
        crate::mm::vas::ObjectKind::Shadow { parent } => parent.clone(),
        crate::mm::vas::ObjectKind::Backing => panic!("expected a shadow"),
    };
    let shared_a = parent_of(&pe.3);
    let shared_b = parent_of(&ce.3);
    assert!(Arc::ptr_eq(&shared_a, &shared_b));
    assert_eq!(shared_a.lock().pages.len(), 1);
    // Two shadows plus our two probes reference the backing object.
    assert_eq!(Arc::strong_count(&shared_a), 4);
}

#[test]
fn initramfs_file_reads_through_the_vfs() {
    let state = fresh_state();
    let image = crate::fs::initramfs::test_support::build_image(&[
        ("init", false, b"#!init"),
        ("motd", false, b"hello from the boot image"),
    ]);
    state.load_initramfs(image).unwrap();

    let (pid, _task) = spawn_current(&state, 0);
    let fdn = io::open_path(&state, pid, "/motd").unwrap();
    let mut buf = [0u8; 64];
    let n = io::sys_read(&state, 0, fdn, &mut buf).unwrap() as usize;
    assert_eq!(&buf[..n], b"hello from the boot image");
    // Reads past EOF return zero.
    assert_eq!(io::sys_read(&state, 0, fdn, &mut buf).unwrap(), 0);
}

#[test]
fn fork_then_exit_records_status() {
    let state = fresh_state();
    let (pid, _task) = spawn_current(&state, 0);
    let child = process::sys_fork(&state, 0).unwrap();
    assert_ne!(child, pid);
    process::sys_exit(&state, 0, 3).unwrap();
    assert_eq!(state.procs.lock().get(pid).unwrap().exit_status, 3);
}
