// src/mem.rs

use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use std::ptr::NonNull;

use crate::error::{Error, Result};

bitflags::bitflags! {
    /// Allocation flags for a [`MemBlock`].
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct MemFlags: u32 {
        /// Back the block with a file descriptor that can cross a process
        /// boundary via the connection's ancillary channel.
        const WITH_FD = 1 << 0;
        /// Seal the backing file against size changes after creation.
        /// Best-effort; a failure to seal is logged, not fatal.
        const SEAL = 1 << 1;
        /// Map the block readable in this process.
        const MAP_READ = 1 << 2;
        /// Map the block writable in this process.
        const MAP_WRITE = 1 << 3;
        /// Map the block readable and writable.
        const MAP_READWRITE = Self::MAP_READ.bits() | Self::MAP_WRITE.bits();
    }
}

/// A `MAP_SHARED` mapping, unmapped on drop.
struct Mapping {
    ptr: NonNull<u8>,
    len: usize,
}

// Safety: the mapping is plain bytes; cross-process aliasing is the caller's
// problem and is why the slice accessors on MemBlock are unsafe.
unsafe impl Send for Mapping {}

impl Drop for Mapping {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.len);
        }
    }
}

enum Backing {
    /// Process-local memory, exclusively owned by this block.
    Heap(Box<[u8]>),
    /// Sharable descriptor, optionally mapped into this address space.
    Fd { fd: OwnedFd, map: Option<Mapping> },
}

/// A block of memory, optionally backed by a descriptor that can be handed
/// to another process and mapped there.
///
/// Dropping the block unmaps the mapping (if any) and closes the descriptor
/// (if any); there is no separate free call.
pub struct MemBlock {
    flags: MemFlags,
    size: usize,
    backing: Backing,
}

impl MemBlock {
    /// Allocate a new block of `size` bytes.
    ///
    /// Without [`MemFlags::WITH_FD`] this is plain zeroed heap memory.
    /// With it, the block is backed by an anonymous sharable file, truncated
    /// to exactly `size` bytes, optionally sealed and optionally mapped
    /// `MAP_SHARED` with the requested protection. [`MemFlags::SEAL`]
    /// combined with [`MemFlags::MAP_WRITE`] yields a content-writable,
    /// size-frozen region.
    pub fn alloc(flags: MemFlags, size: usize) -> Result<MemBlock> {
        if size == 0 {
            return Err(Error::InvalidArguments);
        }

        if !flags.contains(MemFlags::WITH_FD) {
            let mut bytes = Vec::new();
            bytes.try_reserve_exact(size).map_err(|_| Error::OutOfMemory)?;
            bytes.resize(size, 0);
            return Ok(MemBlock {
                flags,
                size,
                backing: Backing::Heap(bytes.into_boxed_slice()),
            });
        }

        let fd = create_anon_fd()?;

        if unsafe { libc::ftruncate(fd.as_raw_fd(), size as libc::off_t) } < 0 {
            let err = io::Error::last_os_error();
            tracing::error!("failed to truncate memory fd to {} bytes: {}", size, err);
            // OwnedFd closes the descriptor on the way out.
            return Err(Error::System(err));
        }

        if flags.contains(MemFlags::SEAL) {
            seal_size(&fd);
        }

        let map = if flags.intersects(MemFlags::MAP_READWRITE) {
            Some(map_shared(&fd, size, prot_bits(flags))?)
        } else {
            None
        };

        Ok(MemBlock {
            flags,
            size,
            backing: Backing::Fd { fd, map },
        })
    }

    /// Map a block received from a peer, taking ownership of the descriptor.
    ///
    /// The flag rules are the same as for [`alloc`]; `WITH_FD` is implied.
    ///
    /// [`alloc`]: MemBlock::alloc
    pub fn import(fd: OwnedFd, flags: MemFlags, size: usize) -> Result<MemBlock> {
        if size == 0 {
            return Err(Error::InvalidArguments);
        }

        let flags = flags | MemFlags::WITH_FD;
        let map = if flags.intersects(MemFlags::MAP_READWRITE) {
            Some(map_shared(&fd, size, prot_bits(flags))?)
        } else {
            None
        };

        Ok(MemBlock {
            flags,
            size,
            backing: Backing::Fd { fd, map },
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn flags(&self) -> MemFlags {
        self.flags
    }

    /// The backing descriptor, if the block has one. Stage it with
    /// [`Connection::add_fd`] to hand the region to a peer.
    ///
    /// [`Connection::add_fd`]: crate::connection::Connection::add_fd
    pub fn fd(&self) -> Option<BorrowedFd<'_>> {
        match &self.backing {
            Backing::Heap(_) => None,
            Backing::Fd { fd, .. } => Some(fd.as_fd()),
        }
    }

    /// Base address of the block's local memory, if any. `None` for an
    /// fd-backed block that was not mapped.
    pub fn as_ptr(&self) -> Option<NonNull<u8>> {
        match &self.backing {
            Backing::Heap(bytes) => NonNull::new(bytes.as_ptr() as *mut u8),
            Backing::Fd { map, .. } => map.as_ref().map(|m| m.ptr),
        }
    }

    /// View the block's memory. `None` unless the block is heap-backed or
    /// was mapped with [`MemFlags::MAP_READ`].
    ///
    /// # Safety
    /// A shared mapping may be written concurrently by another process
    /// holding the same descriptor; the caller must coordinate access.
    pub unsafe fn as_slice(&self) -> Option<&[u8]> {
        match &self.backing {
            Backing::Heap(bytes) => Some(bytes),
            Backing::Fd { map, .. } => {
                if !self.flags.contains(MemFlags::MAP_READ) {
                    return None;
                }
                map.as_ref()
                    .map(|m| unsafe { std::slice::from_raw_parts(m.ptr.as_ptr(), m.len) })
            }
        }
    }

    /// Mutably view the block's memory. `None` unless the block is
    /// heap-backed or was mapped with [`MemFlags::MAP_WRITE`].
    ///
    /// # Safety
    /// Same aliasing caveat as [`as_slice`]: the caller must ensure no other
    /// mapper touches the region concurrently.
    ///
    /// [`as_slice`]: MemBlock::as_slice
    pub unsafe fn as_mut_slice(&mut self) -> Option<&mut [u8]> {
        match &mut self.backing {
            Backing::Heap(bytes) => Some(bytes),
            Backing::Fd { map, .. } => {
                if !self.flags.contains(MemFlags::MAP_WRITE) {
                    return None;
                }
                map.as_mut()
                    .map(|m| unsafe { std::slice::from_raw_parts_mut(m.ptr.as_ptr(), m.len) })
            }
        }
    }
}

fn prot_bits(flags: MemFlags) -> libc::c_int {
    let mut prot = 0;
    if flags.contains(MemFlags::MAP_READ) {
        prot |= libc::PROT_READ;
    }
    if flags.contains(MemFlags::MAP_WRITE) {
        prot |= libc::PROT_WRITE;
    }
    prot
}

fn map_shared(fd: &OwnedFd, size: usize, prot: libc::c_int) -> Result<Mapping> {
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            size,
            prot,
            libc::MAP_SHARED,
            fd.as_raw_fd(),
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        tracing::error!("failed to map {} bytes: {}", size, io::Error::last_os_error());
        return Err(Error::OutOfMemory);
    }
    Ok(Mapping {
        ptr: NonNull::new(ptr as *mut u8).unwrap(),
        len: size,
    })
}

#[cfg(target_os = "linux")]
fn create_anon_fd() -> Result<OwnedFd> {
    use std::os::fd::FromRawFd;

    let name = c"fdwire-memfd";
    let fd = unsafe {
        libc::memfd_create(name.as_ptr(), libc::MFD_CLOEXEC | libc::MFD_ALLOW_SEALING)
    };
    if fd < 0 {
        let err = io::Error::last_os_error();
        tracing::error!("failed to create memfd: {}", err);
        return Err(Error::System(err));
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

#[cfg(not(target_os = "linux"))]
fn create_anon_fd() -> Result<OwnedFd> {
    use std::ffi::CString;
    use std::os::fd::FromRawFd;
    use std::sync::atomic::{AtomicU32, Ordering};

    // shm_open requires a name; unlink immediately so the object is anonymous.
    static COUNTER: AtomicU32 = AtomicU32::new(0);
    let name = format!(
        "/fdwire-{}-{}",
        std::process::id(),
        COUNTER.fetch_add(1, Ordering::Relaxed)
    );
    let c_name = CString::new(name).map_err(|_| Error::InvalidArguments)?;

    let fd = unsafe {
        libc::shm_open(
            c_name.as_ptr(),
            libc::O_RDWR | libc::O_CREAT | libc::O_EXCL,
            0o600,
        )
    };
    if fd < 0 {
        let err = io::Error::last_os_error();
        tracing::error!("failed to create shm object: {}", err);
        return Err(Error::System(err));
    }

    unsafe {
        libc::shm_unlink(c_name.as_ptr());
        libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC);
    }

    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

#[cfg(target_os = "linux")]
fn seal_size(fd: &OwnedFd) {
    let seals = libc::F_SEAL_GROW | libc::F_SEAL_SHRINK | libc::F_SEAL_SEAL;
    if unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_ADD_SEALS, seals) } < 0 {
        tracing::warn!("failed to add seals: {}", io::Error::last_os_error());
    }
}

#[cfg(not(target_os = "linux"))]
fn seal_size(_fd: &OwnedFd) {
    tracing::warn!("file sealing is not supported on this platform");
}
