//! Virtual filesystem dispatch.
//!
//! Filesystem modules register by name and are composed through mounts;
//! a path resolves to the module with the longest matching mount prefix.
//! File descriptors delegate read/write to the module behind their
//! vnode, carry a blocked-task list for readers that must wait, and give
//! each module 96 bytes of private storage.

pub mod devfs;
pub mod initramfs;

extern crate alloc;

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::Mutex;

use crate::error::{KernelError, KernelResult};
use crate::sched::{TaskId, TaskManager};

/// Longest filesystem type name
pub const VFS_MAX_TYPE: usize = 64;
/// Registered module limit
pub const VFS_MAX_MODULES: usize = 32;
/// Filesystem-private bytes per descriptor and per vnode
pub const FS_STORAGE_BYTES: usize = 96;

/// Fixed-size private storage for filesystem modules.
#[derive(Clone, Copy)]
pub struct FdStorage(pub [u8; FS_STORAGE_BYTES]);

impl Default for FdStorage {
    fn default() -> Self {
        Self([0; FS_STORAGE_BYTES])
    }
}

impl FdStorage {
    /// Read the u64 at `slot` (12 slots available).
    pub fn read_u64(&self, slot: usize) -> u64 {
        let off = slot * 8;
        u64::from_ne_bytes(self.0[off..off + 8].try_into().expect("slot in range"))
    }

    /// Write the u64 at `slot`.
    pub fn write_u64(&mut self, slot: usize, value: u64) {
        let off = slot * 8;
        self.0[off..off + 8].copy_from_slice(&value.to_ne_bytes());
    }
}

/// An in-memory filesystem node.
pub struct Vnode {
    /// Module-private inode storage
    pub inode: FdStorage,
    pub flags: u32,
}

impl Vnode {
    pub fn new(inode: FdStorage) -> Arc<Self> {
        Arc::new(Self { inode, flags: 0 })
    }
}

/// A filesystem module: the dispatch record behind every descriptor.
pub trait FsModule: Send + Sync {
    fn type_name(&self) -> &'static str;

    /// Resolve `name` (relative to the module's mount) to a vnode.
    fn lookup(&self, name: &str) -> KernelResult<Arc<Vnode>>;

    /// Seed a fresh descriptor's private storage from a vnode.
    fn open(&self, vnode: &Vnode, fd: &FileDescriptor, oflag: u32) -> KernelResult<()>;

    /// Read into `buf`. `WouldBlock` means the caller was parked on the
    /// descriptor's blocked list and must retry after wake-up.
    fn read(
        &self,
        tasks: &mut TaskManager,
        caller: TaskId,
        fd: &Arc<FileDescriptor>,
        buf: &mut [u8],
    ) -> KernelResult<usize>;

    /// Write from `buf`, returning the bytes accepted.
    fn write(
        &self,
        tasks: &mut TaskManager,
        caller: TaskId,
        fd: &Arc<FileDescriptor>,
        buf: &[u8],
    ) -> KernelResult<usize>;
}

/// An open file: blocked readers, owning module, private storage, vnode.
///
/// Shared between processes through `Arc`; the strong count is the
/// descriptor's reference count.
pub struct FileDescriptor {
    /// Tasks blocked on this descriptor
    pub blocked: Mutex<Vec<TaskId>>,
    /// The filesystem module behind the descriptor
    pub module: Arc<dyn FsModule>,
    /// Module-private storage
    pub fsdata: Mutex<FdStorage>,
    /// The vnode the descriptor refers to
    pub vnode: Option<Arc<Vnode>>,
}

impl FileDescriptor {
    pub fn new(module: Arc<dyn FsModule>, fsdata: FdStorage) -> Self {
        Self {
            blocked: Mutex::new(Vec::new()),
            module,
            fsdata: Mutex::new(fsdata),
            vnode: None,
        }
    }

    pub fn with_vnode(module: Arc<dyn FsModule>, fsdata: FdStorage, vnode: Arc<Vnode>) -> Self {
        Self {
            blocked: Mutex::new(Vec::new()),
            module,
            fsdata: Mutex::new(fsdata),
            vnode: Some(vnode),
        }
    }

    /// Park `task` on this descriptor.
    pub fn park(&self, task: TaskId) {
        let mut blocked = self.blocked.lock();
        if !blocked.contains(&task) {
            blocked.push(task);
        }
    }

    /// Take every parked task.
    pub fn take_parked(&self) -> Vec<TaskId> {
        core::mem::take(&mut *self.blocked.lock())
    }

    /// Delegate a read to the owning module.
    pub fn read(
        self: &Arc<Self>,
        tasks: &mut TaskManager,
        caller: TaskId,
        buf: &mut [u8],
    ) -> KernelResult<usize> {
        self.module.clone().read(tasks, caller, self, buf)
    }

    /// Delegate a write to the owning module.
    pub fn write(
        self: &Arc<Self>,
        tasks: &mut TaskManager,
        caller: TaskId,
        buf: &[u8],
    ) -> KernelResult<usize> {
        self.module.clone().write(tasks, caller, self, buf)
    }
}

/// The module registry and mount table.
pub struct Vfs {
    modules: Vec<Arc<dyn FsModule>>,
    mounts: Vec<(String, Arc<dyn FsModule>)>,
}

impl Default for Vfs {
    fn default() -> Self {
        Self::new()
    }
}

impl Vfs {
    pub const fn new() -> Self {
        Self {
            modules: Vec::new(),
            mounts: Vec::new(),
        }
    }

    /// Register a filesystem module under its type name.
    pub fn register(&mut self, module: Arc<dyn FsModule>) -> KernelResult<()> {
        let name = module.type_name();
        if name.is_empty() || name.len() >= VFS_MAX_TYPE {
            return Err(KernelError::Invalid);
        }
        if self.modules.len() >= VFS_MAX_MODULES {
            return Err(KernelError::Busy);
        }
        if self.modules.iter().any(|m| m.type_name() == name) {
            return Err(KernelError::Exists);
        }
        self.modules.push(module);
        Ok(())
    }

    pub fn module(&self, type_name: &str) -> KernelResult<Arc<dyn FsModule>> {
        self.modules
            .iter()
            .find(|m| m.type_name() == type_name)
            .cloned()
            .ok_or(KernelError::NotFound)
    }

    /// Mount a registered module at `dir`.
    pub fn mount(&mut self, type_name: &str, dir: &str) -> KernelResult<()> {
        let module = self.module(type_name)?;
        if self.mounts.iter().any(|(d, _)| d == dir) {
            return Err(KernelError::Exists);
        }
        self.mounts.push((String::from(dir), module));
        Ok(())
    }

    /// Longest-prefix mount match: returns the module and the remainder
    /// of the path relative to the mount point.
    pub fn resolve<'p>(&self, path: &'p str) -> KernelResult<(Arc<dyn FsModule>, &'p str)> {
        let mut best: Option<(&str, &Arc<dyn FsModule>)> = None;
        for (dir, module) in &self.mounts {
            let matches = if dir == "/" {
                true
            } else {
                path == dir.as_str()
                    || (path.starts_with(dir.as_str()) && path.as_bytes()[dir.len()] == b'/')
            };
            if matches && best.map(|(d, _)| dir.len() > d.len()).unwrap_or(true) {
                best = Some((dir.as_str(), module));
            }
        }
        let (dir, module) = best.ok_or(KernelError::NotFound)?;
        let rest = if dir == "/" {
            path.trim_start_matches('/')
        } else {
            path[dir.len()..].trim_start_matches('/')
        };
        Ok((module.clone(), rest))
    }

    /// Open `path`: resolve the mount, look the name up, and build a
    /// descriptor seeded by the module.
    pub fn open(&self, path: &str, oflag: u32) -> KernelResult<Arc<FileDescriptor>> {
        if path.is_empty() || path.len() >= crate::process::PATH_MAX {
            return Err(KernelError::Invalid);
        }
        let (module, rest) = self.resolve(path)?;
        let vnode = module.lookup(rest)?;
        let fd = FileDescriptor::with_vnode(module.clone(), FdStorage::default(), vnode.clone());
        module.open(&vnode, &fd, oflag)?;
        Ok(Arc::new(fd))
    }
}

#[cfg(test)]
pub mod test_support {
    use super::*;

    struct NullFs;

    impl FsModule for NullFs {
        fn type_name(&self) -> &'static str {
            "nullfs"
        }
        fn lookup(&self, _name: &str) -> KernelResult<Arc<Vnode>> {
            Err(KernelError::NotFound)
        }
        fn open(&self, _vnode: &Vnode, _fd: &FileDescriptor, _oflag: u32) -> KernelResult<()> {
            Ok(())
        }
        fn read(
            &self,
            _tasks: &mut TaskManager,
            _caller: TaskId,
            _fd: &Arc<FileDescriptor>,
            _buf: &mut [u8],
        ) -> KernelResult<usize> {
            Err(KernelError::Unsupported)
        }
        fn write(
            &self,
            _tasks: &mut TaskManager,
            _caller: TaskId,
            _fd: &Arc<FileDescriptor>,
            _buf: &[u8],
        ) -> KernelResult<usize> {
            Err(KernelError::Unsupported)
        }
    }

    pub fn null_module() -> Arc<dyn FsModule> {
        Arc::new(NullFs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_slots_round_trip() {
        let mut s = FdStorage::default();
        s.write_u64(0, 0xDEAD_BEEF);
        s.write_u64(11, 42);
        assert_eq!(s.read_u64(0), 0xDEAD_BEEF);
        assert_eq!(s.read_u64(11), 42);
        assert_eq!(s.read_u64(5), 0);
    }

    #[test]
    fn register_enforces_uniqueness() {
        let mut vfs = Vfs::new();
        vfs.register(test_support::null_module()).unwrap();
        assert_eq!(
            vfs.register(test_support::null_module()).unwrap_err(),
            KernelError::Exists
        );
        assert!(vfs.module("nullfs").is_ok());
        assert!(vfs.module("nofs").is_err());
    }

    #[test]
    fn resolve_prefers_longest_prefix() {
        let mut vfs = Vfs::new();
        vfs.register(test_support::null_module()).unwrap();
        vfs.mount("nullfs", "/").unwrap();
        vfs.mount("nullfs", "/dev").unwrap();
        assert_eq!(vfs.mount("nullfs", "/dev").unwrap_err(), KernelError::Exists);

        let (_, rest) = vfs.resolve("/etc/motd").unwrap();
        assert_eq!(rest, "etc/motd");
        let (_, rest) = vfs.resolve("/dev/console").unwrap();
        assert_eq!(rest, "console");
        let (_, rest) = vfs.resolve("/device").unwrap();
        assert_eq!(rest, "device", "prefix must stop at a component boundary");
    }

    #[test]
    fn parked_tasks_drain_once() {
        let fd = FileDescriptor::new(test_support::null_module(), FdStorage::default());
        fd.park(TaskId(1));
        fd.park(TaskId(2));
        fd.park(TaskId(1));
        let parked = fd.take_parked();
        assert_eq!(parked, alloc::vec![TaskId(1), TaskId(2)]);
        assert!(fd.take_parked().is_empty());
    }
}
