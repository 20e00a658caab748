//! Device filesystem.
//!
//! Each registered driver device appears under a name and couples its
//! owning driver process to user tasks through a pair of SPSC rings:
//! the input ring carries driver-produced data towards readers, the
//! output ring carries user-written data towards the driver. Only the
//! owner may push to the input ring or drain the output ring.
//!
//! A user read on an empty character device parks the calling task on
//! the descriptor's blocked list; the driver-side putc/write hooks wake
//! parked readers. A user write readies the driver's task so it can
//! observe the new data.

extern crate alloc;

use alloc::string::String;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;

use spin::Mutex;

use super::{FdStorage, FileDescriptor, FsModule, Vnode};
use crate::error::{KernelError, KernelResult};
use crate::ipc::{Message, Ring};
use crate::process::{Pid, PATH_MAX};
use crate::sched::{TaskId, TaskManager};

/// Device table capacity
pub const DEVFS_MAX_DEVS: usize = 1024;

/// Character or block device.
pub enum Device {
    /// Paired input/output rings
    Char(CharDevice),
    /// Reserved; the core has no block drivers
    Block,
}

/// The two rings of a character device.
#[derive(Default)]
pub struct CharDevice {
    /// Driver-produced data destined to readers
    pub ibuf: Ring,
    /// User-produced data destined to the driver
    pub obuf: Ring,
}

/// One registered device.
pub struct DevfsEntry {
    pub name: String,
    pub flags: u32,
    pub device: Device,
    /// The driver process owning this device
    pub owner: Pid,
    /// The owner's task, readied when users write
    pub owner_task: TaskId,
    /// Serializes multi-byte producers/consumers on one ring side
    lock: Mutex<()>,
    /// Descriptors with parked readers, woken on driver pushes
    readers: Mutex<Vec<Weak<FileDescriptor>>>,
}

impl DevfsEntry {
    fn chr(&self) -> KernelResult<&CharDevice> {
        match &self.device {
            Device::Char(c) => Ok(c),
            Device::Block => Err(KernelError::Unsupported),
        }
    }
}

/// The device table plus the `devfs` filesystem module.
pub struct Devfs {
    entries: Mutex<Vec<Option<Arc<DevfsEntry>>>>,
}

impl Default for Devfs {
    fn default() -> Self {
        Self::new()
    }
}

impl Devfs {
    pub const fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
        }
    }

    /// Register a character or block device for `owner`.
    ///
    /// Returns the device index used by the driver-side hooks.
    pub fn register(
        &self,
        name: &str,
        device: Device,
        owner: Pid,
        owner_task: TaskId,
    ) -> KernelResult<usize> {
        if name.is_empty() || name.len() >= PATH_MAX {
            return Err(KernelError::Invalid);
        }
        let mut entries = self.entries.lock();
        if entries
            .iter()
            .flatten()
            .any(|e| e.name == name)
        {
            return Err(KernelError::Exists);
        }
        let entry = Arc::new(DevfsEntry {
            name: String::from(name),
            flags: 0,
            device,
            owner,
            owner_task,
            lock: Mutex::new(()),
            readers: Mutex::new(Vec::new()),
        });
        if let Some(slot) = entries.iter().position(|e| e.is_none()) {
            entries[slot] = Some(entry);
            return Ok(slot);
        }
        if entries.len() >= DEVFS_MAX_DEVS {
            return Err(KernelError::Busy);
        }
        entries.push(Some(entry));
        Ok(entries.len() - 1)
    }

    /// Remove a device; only the owner may do this.
    pub fn unregister(&self, index: usize, owner: Pid) -> KernelResult<()> {
        let mut entries = self.entries.lock();
        let slot = entries.get_mut(index).ok_or(KernelError::Invalid)?;
        match slot {
            Some(e) if e.owner == owner => {
                *slot = None;
                Ok(())
            }
            Some(_) => Err(KernelError::Invalid),
            None => Err(KernelError::NotFound),
        }
    }

    pub fn entry(&self, index: usize) -> KernelResult<Arc<DevfsEntry>> {
        self.entries
            .lock()
            .get(index)
            .and_then(|e| e.clone())
            .ok_or(KernelError::NotFound)
    }

    pub fn lookup_index(&self, name: &str) -> KernelResult<usize> {
        self.entries
            .lock()
            .iter()
            .position(|e| e.as_ref().map(|e| e.name == name).unwrap_or(false))
            .ok_or(KernelError::NotFound)
    }

    fn owned_entry(&self, index: usize, owner: Pid) -> KernelResult<Arc<DevfsEntry>> {
        let entry = self.entry(index)?;
        if entry.owner != owner {
            return Err(KernelError::Invalid);
        }
        Ok(entry)
    }

    /// Wake every task parked on a descriptor of `entry`.
    fn wake_readers(entry: &DevfsEntry, tasks: &mut TaskManager) {
        let mut readers = entry.readers.lock();
        readers.retain(|weak| {
            if let Some(fd) = weak.upgrade() {
                for task in fd.take_parked() {
                    let _ = tasks.wake(task);
                }
                true
            } else {
                false
            }
        });
    }

    /// Driver hook: push one byte of input data.
    pub fn driver_putc(
        &self,
        tasks: &mut TaskManager,
        index: usize,
        owner: Pid,
        byte: u8,
    ) -> KernelResult<()> {
        let entry = self.owned_entry(index, owner)?;
        let _guard = entry.lock.lock();
        entry.chr()?.ibuf.put(byte).map_err(|_| KernelError::Busy)?;
        drop(_guard);
        Self::wake_readers(&entry, tasks);
        Ok(())
    }

    /// Driver hook: push a buffer of input data, returning the bytes
    /// accepted before the ring filled.
    pub fn driver_write(
        &self,
        tasks: &mut TaskManager,
        index: usize,
        owner: Pid,
        buf: &[u8],
    ) -> KernelResult<usize> {
        let entry = self.owned_entry(index, owner)?;
        let guard = entry.lock.lock();
        let chr = entry.chr()?;
        let mut written = 0;
        for &b in buf {
            if chr.ibuf.put(b).is_err() {
                break;
            }
            written += 1;
        }
        drop(guard);
        if written > 0 {
            Self::wake_readers(&entry, tasks);
        }
        Ok(written)
    }

    /// Driver hook: drain one byte of user output data.
    pub fn driver_getc(&self, index: usize, owner: Pid) -> KernelResult<Option<u8>> {
        let entry = self.owned_entry(index, owner)?;
        let _guard = entry.lock.lock();
        Ok(entry.chr()?.obuf.get())
    }

    /// Message hand-off from a driver process.
    pub fn deliver(
        &self,
        tasks: &mut TaskManager,
        index: usize,
        owner: Pid,
        msg: Message,
    ) -> KernelResult<()> {
        match msg {
            Message::Byte(b) => self.driver_putc(tasks, index, owner, b),
        }
    }
}

impl FsModule for Devfs {
    fn type_name(&self) -> &'static str {
        "devfs"
    }

    fn lookup(&self, name: &str) -> KernelResult<Arc<Vnode>> {
        let index = self.lookup_index(name)?;
        let mut inode = FdStorage::default();
        inode.write_u64(0, index as u64);
        Ok(Vnode::new(inode))
    }

    fn open(&self, vnode: &Vnode, fd: &FileDescriptor, _oflag: u32) -> KernelResult<()> {
        *fd.fsdata.lock() = vnode.inode;
        Ok(())
    }

    fn read(
        &self,
        tasks: &mut TaskManager,
        caller: TaskId,
        fd: &Arc<FileDescriptor>,
        buf: &mut [u8],
    ) -> KernelResult<usize> {
        let index = fd.fsdata.lock().read_u64(0) as usize;
        let entry = self.entry(index)?;
        let chr = entry.chr()?;

        if chr.ibuf.is_empty() {
            // Park the caller on the descriptor and remember the
            // descriptor on the entry so driver pushes can find it.
            fd.park(caller);
            let mut readers = entry.readers.lock();
            if !readers.iter().any(|w| w.as_ptr() == Arc::as_ptr(fd)) {
                readers.push(Arc::downgrade(fd));
            }
            drop(readers);
            tasks.block(caller, None)?;
            return Err(KernelError::WouldBlock);
        }

        let mut len = 0;
        while len < buf.len() {
            match chr.ibuf.get() {
                Some(b) => {
                    buf[len] = b;
                    len += 1;
                }
                None => break,
            }
        }
        Ok(len)
    }

    fn write(
        &self,
        tasks: &mut TaskManager,
        _caller: TaskId,
        fd: &Arc<FileDescriptor>,
        buf: &[u8],
    ) -> KernelResult<usize> {
        let index = fd.fsdata.lock().read_u64(0) as usize;
        let entry = self.entry(index)?;
        let chr = entry.chr()?;

        if !chr.obuf.has_room() {
            return Ok(0);
        }
        let mut len = 0;
        for &b in buf {
            if chr.obuf.put(b).is_err() {
                break;
            }
            len += 1;
        }
        // Wake up the driver process so it can observe the new data.
        let _ = tasks.wake(entry.owner_task);
        Ok(len)
    }
}
