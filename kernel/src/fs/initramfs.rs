//! Boot-image filesystem.
//!
//! A flat directory of up to 128 fixed-size entries sitting at a known
//! physical location, followed by the file payloads. Each entry is 32
//! bytes: a 15-byte NUL-padded name, one attribute byte (bit 0 marks a
//! directory), then the payload offset and size as little-endian u64s.
//! Offsets are relative to the directory base.

extern crate alloc;

use alloc::sync::Arc;

use super::{FdStorage, FileDescriptor, FsModule, Vnode};
use crate::error::{KernelError, KernelResult};
use crate::sched::{TaskId, TaskManager};

/// Directory slots in the image
pub const INITRAMFS_ENTRIES: usize = 128;
/// Bytes per directory entry
pub const ENTRY_SIZE: usize = 32;
/// Name bytes per entry
pub const NAME_LEN: usize = 15;
/// Attribute bit: entry is a directory
pub const ATTR_DIR: u8 = 0x01;

/// Where the boot image sits in physical memory.
pub const INITRAMFS_PHYS_BASE: u64 = 0xC003_0000;

/// One parsed directory entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InitramfsFile {
    pub index: usize,
    pub offset: u64,
    pub size: u64,
    pub directory: bool,
}

/// The initramfs module over a borrowed image.
pub struct Initramfs {
    image: &'static [u8],
}

impl Initramfs {
    /// Wrap an image. The directory must be fully present; payloads are
    /// bounds-checked per access.
    pub fn new(image: &'static [u8]) -> KernelResult<Self> {
        if image.len() < INITRAMFS_ENTRIES * ENTRY_SIZE {
            return Err(KernelError::Invalid);
        }
        Ok(Self { image })
    }

    fn entry_bytes(&self, index: usize) -> &[u8] {
        &self.image[index * ENTRY_SIZE..(index + 1) * ENTRY_SIZE]
    }

    fn entry_name(&self, index: usize) -> &str {
        let raw = &self.entry_bytes(index)[..NAME_LEN];
        let len = raw.iter().position(|&b| b == 0).unwrap_or(NAME_LEN);
        core::str::from_utf8(&raw[..len]).unwrap_or("")
    }

    /// Linear scan of the directory for `name`.
    pub fn find(&self, name: &str) -> KernelResult<InitramfsFile> {
        if name.is_empty() {
            return Err(KernelError::Invalid);
        }
        for index in 0..INITRAMFS_ENTRIES {
            if self.entry_name(index) != name {
                continue;
            }
            let e = self.entry_bytes(index);
            let attr = e[NAME_LEN];
            let offset = u64::from_le_bytes(e[16..24].try_into().expect("entry layout"));
            let size = u64::from_le_bytes(e[24..32].try_into().expect("entry layout"));
            return Ok(InitramfsFile {
                index,
                offset,
                size,
                directory: attr & ATTR_DIR != 0,
            });
        }
        Err(KernelError::NotFound)
    }

    /// Payload bytes of `file`.
    pub fn contents(&self, file: &InitramfsFile) -> KernelResult<&[u8]> {
        let start = file.offset as usize;
        let end = start
            .checked_add(file.size as usize)
            .ok_or(KernelError::Invalid)?;
        if end > self.image.len() {
            return Err(KernelError::Invalid);
        }
        Ok(&self.image[start..end])
    }

    /// Copy up to `buf.len()` bytes of `path` starting at `off`.
    pub fn readfile(&self, path: &str, buf: &mut [u8], off: u64) -> KernelResult<usize> {
        let file = self.find(path)?;
        let data = self.contents(&file)?;
        if off >= data.len() as u64 {
            return Ok(0);
        }
        let avail = &data[off as usize..];
        let n = avail.len().min(buf.len());
        buf[..n].copy_from_slice(&avail[..n]);
        Ok(n)
    }

    /// Size of `path` (fstat).
    pub fn fstat(&self, path: &str) -> KernelResult<u64> {
        Ok(self.find(path)?.size)
    }
}

// Descriptor storage slots: 0 = entry index, 1 = offset, 2 = size,
// 3 = read position.
const SLOT_INDEX: usize = 0;
const SLOT_OFFSET: usize = 1;
const SLOT_SIZE: usize = 2;
const SLOT_POS: usize = 3;

impl FsModule for Initramfs {
    fn type_name(&self) -> &'static str {
        "initramfs"
    }

    fn lookup(&self, name: &str) -> KernelResult<Arc<Vnode>> {
        let file = self.find(name)?;
        let mut inode = FdStorage::default();
        inode.write_u64(SLOT_INDEX, file.index as u64);
        inode.write_u64(SLOT_OFFSET, file.offset);
        inode.write_u64(SLOT_SIZE, file.size);
        Ok(Vnode::new(inode))
    }

    fn open(&self, vnode: &Vnode, fd: &FileDescriptor, _oflag: u32) -> KernelResult<()> {
        let mut data = fd.fsdata.lock();
        *data = vnode.inode;
        data.write_u64(SLOT_POS, 0);
        Ok(())
    }

    fn read(
        &self,
        _tasks: &mut TaskManager,
        _caller: TaskId,
        fd: &Arc<FileDescriptor>,
        buf: &mut [u8],
    ) -> KernelResult<usize> {
        let mut data = fd.fsdata.lock();
        let file = InitramfsFile {
            index: data.read_u64(SLOT_INDEX) as usize,
            offset: data.read_u64(SLOT_OFFSET),
            size: data.read_u64(SLOT_SIZE),
            directory: false,
        };
        let pos = data.read_u64(SLOT_POS);
        let bytes = self.contents(&file)?;
        if pos >= bytes.len() as u64 {
            return Ok(0);
        }
        let avail = &bytes[pos as usize..];
        let n = avail.len().min(buf.len());
        buf[..n].copy_from_slice(&avail[..n]);
        data.write_u64(SLOT_POS, pos + n as u64);
        Ok(n)
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

#[cfg(test)]
pub mod test_support {
    use super::*;
    use alloc::vec::Vec;

    /// Build an image holding `files` as (name, directory, payload).
    pub fn build_image(files: &[(&str, bool, &[u8])]) -> &'static [u8] {
        assert!(files.len() <= INITRAMFS_ENTRIES);
        let dir_len = INITRAMFS_ENTRIES * ENTRY_SIZE;
        let mut payload_off = dir_len as u64;
        let mut image = Vec::new();
        image.resize(dir_len, 0u8);

        for (i, (name, dir, data)) in files.iter().enumerate() {
            assert!(name.len() <= NAME_LEN);
            let base = i * ENTRY_SIZE;
            image[base..base + name.len()].copy_from_slice(name.as_bytes());
            image[base + NAME_LEN] = if *dir { ATTR_DIR } else { 0 };
            image[base + 16..base + 24].copy_from_slice(&payload_off.to_le_bytes());
            image[base + 24..base + 32].copy_from_slice(&(data.len() as u64).to_le_bytes());
            payload_off += data.len() as u64;
        }
        for (_, _, data) in files {
            image.extend_from_slice(data);
        }
        Vec::leak(image)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fs() -> Initramfs {
        let image = test_support::build_image(&[
            ("init", false, b"\x7fELFfake-init-binary"),
            ("etc", true, b""),
            ("motd", false, b"welcome to the machine"),
        ]);
        Initramfs::new(image).unwrap()
    }

    #[test]
    fn find_scans_the_flat_directory() {
        let fs = fs();
        let init = fs.find("init").unwrap();
        assert!(!init.directory);
        assert_eq!(init.size, 20);

        let etc = fs.find("etc").unwrap();
        assert!(etc.directory);

        assert_eq!(fs.find("missing").unwrap_err(), KernelError::NotFound);
        assert_eq!(fs.find("").unwrap_err(), KernelError::Invalid);
    }

    #[test]
    fn readfile_respects_offset_and_size() {
        let fs = fs();
        let mut buf = [0u8; 7];
        assert_eq!(fs.readfile("motd", &mut buf, 0).unwrap(), 7);
        assert_eq!(&buf, b"welcome");
        assert_eq!(fs.readfile("motd", &mut buf, 11).unwrap(), 7);
        assert_eq!(&buf, b"the mac");
        // Offset past the end yields EOF, not an error
        assert_eq!(fs.readfile("motd", &mut buf, 1000).unwrap(), 0);
        assert_eq!(fs.fstat("motd").unwrap(), 22);
    }

    #[test]
    fn descriptor_read_tracks_position() {
        use super::super::FileDescriptor;
        use alloc::sync::Arc;

        let fs = Arc::new(fs());
        let module: Arc<dyn FsModule> = fs.clone();
        let vnode = module.lookup("motd").unwrap();
        let fd = FileDescriptor::with_vnode(module.clone(), FdStorage::default(), vnode.clone());
        module.open(&vnode, &fd, 0).unwrap();
        let fd = Arc::new(fd);

        let mut tasks = TaskManager::new();
        let t = tasks.alloc();
        let mut buf = [0u8; 8];
        assert_eq!(fd.read(&mut tasks, t, &mut buf).unwrap(), 8);
        assert_eq!(&buf, b"welcome ");
        assert_eq!(fd.read(&mut tasks, t, &mut buf).unwrap(), 8);
        assert_eq!(&buf, b"to the m");
        assert_eq!(fd.read(&mut tasks, t, &mut buf).unwrap(), 6);
        assert_eq!(fd.read(&mut tasks, t, &mut buf).unwrap(), 0, "EOF");
        assert_eq!(
            fd.write(&mut tasks, t, b"nope").unwrap_err(),
            KernelError::Unsupported
        );
    }
}
