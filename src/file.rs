//! The file capability consumed by the storage layers.  Two implementations
//! are provided: [`PosixFile`] wraps a real file descriptor and uses `fcntl`
//! byte-range locks, and [`MemoryFile`] keeps the whole store in a stable,
//! page-aligned heap buffer.  The memory-backed form is what the unit tests
//! build their stores on; it also serves hosts without mmap support.

use std::fmt;
use std::sync::{Condvar, Mutex};

use crate::error::{Error, Result};
use crate::util::constants::BYTES_IN_PAGE;

/// The two lock strengths.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockKind {
    Shared,
    Exclusive,
}

/// The two lock ranges, each one byte of the header.  Every open database
/// holds `Open` shared for its lifetime; a transaction holds `Writer`
/// exclusive for its duration.  Keeping the ranges distinct lets a writer
/// start while other handles keep the store open for reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockRange {
    Open,
    Writer,
}

impl LockRange {
    fn index(self) -> usize {
        match self {
            LockRange::Open => 0,
            LockRange::Writer => 1,
        }
    }
}

/// Abstraction over the backing file.  All offsets are absolute.  `lock`
/// follows `fcntl` semantics: a new lock taken by the same handle on a range
/// replaces the lock it already holds there.
pub trait File: Send + Sync + fmt::Debug {
    fn length(&self) -> Result<u64>;

    /// Grow or shrink the file to exactly `new_len` bytes.  Grown bytes read
    /// as zero.
    fn truncate(&self, new_len: u64) -> Result<()>;

    /// Read exactly `buf.len()` bytes at `offset`.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Write all of `buf` at `offset`, extending the file if needed.
    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()>;

    /// Make previous writes durable.
    fn sync(&self) -> Result<()>;

    /// Block until the requested lock is held.
    fn lock(&self, range: LockRange, kind: LockKind) -> Result<()>;

    /// Take the requested lock if that is possible without blocking.
    /// Returns false when a conflicting lock is held elsewhere.
    fn try_lock(&self, range: LockRange, kind: LockKind) -> Result<bool>;

    fn unlock(&self, range: LockRange) -> Result<()>;
}

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        pub use self::posix::PosixFile;
    }
}

#[cfg(unix)]
mod posix {
    use super::*;

    use std::fs::OpenOptions;
    use std::os::unix::fs::FileExt;
    use std::os::unix::io::{AsRawFd, RawFd};
    use std::path::{Path, PathBuf};

    /// A store file backed by a real file descriptor.  Locking uses `fcntl`
    /// record locks: they are advisory, byte-ranged, and released
    /// automatically if the process dies.
    #[derive(Debug)]
    pub struct PosixFile {
        file: std::fs::File,
        path: PathBuf,
    }

    impl PosixFile {
        pub fn open(path: &Path, writable: bool) -> Result<PosixFile> {
            let file = OpenOptions::new()
                .read(true)
                .write(writable)
                .create(writable)
                .open(path)
                .map_err(Error::from)?;
            Ok(PosixFile {
                file,
                path: path.to_path_buf(),
            })
        }

        pub fn path(&self) -> &Path {
            &self.path
        }

        pub(crate) fn raw_fd(&self) -> RawFd {
            self.file.as_raw_fd()
        }

        fn fcntl_lock(
            &self,
            range: LockRange,
            lock_type: libc::c_short,
            wait: bool,
        ) -> Result<bool> {
            let mut fl: libc::flock = unsafe { std::mem::zeroed() };
            fl.l_type = lock_type;
            fl.l_whence = libc::SEEK_SET as libc::c_short;
            fl.l_start = range.index() as libc::off_t;
            fl.l_len = 1;
            let cmd = if wait { libc::F_SETLKW } else { libc::F_SETLK };
            let rc = unsafe { libc::fcntl(self.file.as_raw_fd(), cmd, &fl) };
            if rc == 0 {
                return Ok(true);
            }
            let err = std::io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EACCES) | Some(libc::EAGAIN) if !wait => Ok(false),
                _ => Err(err.into()),
            }
        }
    }

    fn lock_type(kind: LockKind) -> libc::c_short {
        match kind {
            LockKind::Shared => libc::F_RDLCK as libc::c_short,
            LockKind::Exclusive => libc::F_WRLCK as libc::c_short,
        }
    }

    impl File for PosixFile {
        fn length(&self) -> Result<u64> {
            Ok(self.file.metadata().map_err(Error::from)?.len())
        }

        fn truncate(&self, new_len: u64) -> Result<()> {
            self.file.set_len(new_len).map_err(Error::from)
        }

        fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
            self.file.read_exact_at(buf, offset).map_err(Error::from)
        }

        fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
            self.file.write_all_at(buf, offset).map_err(Error::from)
        }

        fn sync(&self) -> Result<()> {
            self.file.sync_data().map_err(Error::from)
        }

        fn lock(&self, range: LockRange, kind: LockKind) -> Result<()> {
            self.fcntl_lock(range, lock_type(kind), true).map(|_| ())
        }

        fn try_lock(&self, range: LockRange, kind: LockKind) -> Result<bool> {
            self.fcntl_lock(range, lock_type(kind), false)
        }

        fn unlock(&self, range: LockRange) -> Result<()> {
            self.fcntl_lock(range, libc::F_UNLCK as libc::c_short, true)
                .map(|_| ())
        }
    }
}

/// The page-aligned backing buffer of a [`MemoryFile`].  The allocation is
/// made once and never moves: regions hand out raw pointers into it.
struct AlignedBuf {
    ptr: *mut u8,
    capacity: usize,
}

impl AlignedBuf {
    fn new(capacity: usize) -> AlignedBuf {
        let layout = std::alloc::Layout::from_size_align(capacity, BYTES_IN_PAGE).unwrap();
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        if ptr.is_null() {
            std::alloc::handle_alloc_error(layout);
        }
        AlignedBuf { ptr, capacity }
    }
}

impl Drop for AlignedBuf {
    fn drop(&mut self) {
        let layout = std::alloc::Layout::from_size_align(self.capacity, BYTES_IN_PAGE).unwrap();
        unsafe { std::alloc::dealloc(self.ptr, layout) };
    }
}

unsafe impl Send for AlignedBuf {}
unsafe impl Sync for AlignedBuf {}

#[derive(Default)]
struct MemLockState {
    shared: usize,
    exclusive: bool,
}

impl MemLockState {
    fn acquirable(&self, kind: LockKind) -> bool {
        match kind {
            LockKind::Shared => !self.exclusive,
            LockKind::Exclusive => !self.exclusive && self.shared == 0,
        }
    }

    fn apply(&mut self, kind: LockKind) {
        match kind {
            LockKind::Shared => self.shared += 1,
            LockKind::Exclusive => self.exclusive = true,
        }
    }

    fn release(&mut self, kind: Option<LockKind>) {
        match kind {
            Some(LockKind::Shared) => self.shared -= 1,
            Some(LockKind::Exclusive) => self.exclusive = false,
            None => {}
        }
    }
}

struct MemShared {
    buf: AlignedBuf,
    len: Mutex<u64>,
    locks: Mutex<[MemLockState; 2]>,
    lock_cv: Condvar,
}

/// An in-memory store file.  `duplicate` produces further handles over the
/// same backing buffer, each with its own lock identity, so tests can model
/// several databases sharing one "file".
pub struct MemoryFile {
    shared: std::sync::Arc<MemShared>,
    held: Mutex<[Option<LockKind>; 2]>,
}

impl fmt::Debug for MemoryFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryFile")
            .field("capacity", &self.shared.buf.capacity)
            .finish()
    }
}

impl MemoryFile {
    pub fn new(capacity: usize) -> MemoryFile {
        MemoryFile {
            shared: std::sync::Arc::new(MemShared {
                buf: AlignedBuf::new(capacity),
                len: Mutex::new(0),
                locks: Mutex::new([MemLockState::default(), MemLockState::default()]),
                lock_cv: Condvar::new(),
            }),
            held: Mutex::new([None, None]),
        }
    }

    /// A new handle over the same backing buffer.
    pub fn duplicate(&self) -> MemoryFile {
        MemoryFile {
            shared: self.shared.clone(),
            held: Mutex::new([None, None]),
        }
    }

    pub fn capacity(&self) -> u64 {
        self.shared.buf.capacity as u64
    }

    pub(crate) fn base_ptr(&self) -> *mut u8 {
        self.shared.buf.ptr
    }
}

impl Drop for MemoryFile {
    fn drop(&mut self) {
        let _ = self.unlock(LockRange::Open);
        let _ = self.unlock(LockRange::Writer);
    }
}

impl File for MemoryFile {
    fn length(&self) -> Result<u64> {
        Ok(*self.shared.len.lock().unwrap())
    }

    fn truncate(&self, new_len: u64) -> Result<()> {
        if new_len > self.capacity() {
            return Err(Error::StoreFull);
        }
        let mut len = self.shared.len.lock().unwrap();
        if new_len < *len {
            // Shrunk bytes must read back as zero if the file grows again.
            unsafe {
                std::ptr::write_bytes(
                    self.shared.buf.ptr.add(new_len as usize),
                    0,
                    (*len - new_len) as usize,
                );
            }
        }
        *len = new_len;
        Ok(())
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let len = *self.shared.len.lock().unwrap();
        let end = offset + buf.len() as u64;
        if end > len {
            return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into());
        }
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.shared.buf.ptr.add(offset as usize),
                buf.as_mut_ptr(),
                buf.len(),
            );
        }
        Ok(())
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        let end = offset + buf.len() as u64;
        if end > self.capacity() {
            return Err(Error::StoreFull);
        }
        let mut len = self.shared.len.lock().unwrap();
        unsafe {
            std::ptr::copy_nonoverlapping(
                buf.as_ptr(),
                self.shared.buf.ptr.add(offset as usize),
                buf.len(),
            );
        }
        if end > *len {
            *len = end;
        }
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }

    fn lock(&self, range: LockRange, kind: LockKind) -> Result<()> {
        let mut held = self.held.lock().unwrap();
        let slot = range.index();
        if held[slot] == Some(kind) {
            return Ok(());
        }
        let mut states = self.shared.locks.lock().unwrap();
        states[slot].release(held[slot].take());
        self.shared.lock_cv.notify_all();
        while !states[slot].acquirable(kind) {
            states = self.shared.lock_cv.wait(states).unwrap();
        }
        states[slot].apply(kind);
        held[slot] = Some(kind);
        Ok(())
    }

    fn try_lock(&self, range: LockRange, kind: LockKind) -> Result<bool> {
        let mut held = self.held.lock().unwrap();
        let slot = range.index();
        if held[slot] == Some(kind) {
            return Ok(true);
        }
        let mut states = self.shared.locks.lock().unwrap();
        // Check as if our current lock were released, so that a failed
        // attempt leaves the handle's lock untouched.
        let mut probe = MemLockState {
            shared: states[slot].shared,
            exclusive: states[slot].exclusive,
        };
        probe.release(held[slot]);
        if !probe.acquirable(kind) {
            return Ok(false);
        }
        states[slot].release(held[slot].take());
        states[slot].apply(kind);
        held[slot] = Some(kind);
        self.shared.lock_cv.notify_all();
        Ok(true)
    }

    fn unlock(&self, range: LockRange) -> Result<()> {
        let mut held = self.held.lock().unwrap();
        let slot = range.index();
        let mut states = self.shared.locks.lock().unwrap();
        states[slot].release(held[slot].take());
        self.shared.lock_cv.notify_all();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_file_read_write() {
        let f = MemoryFile::new(1 << 16);
        f.write_at(10, b"hello").unwrap();
        assert_eq!(f.length().unwrap(), 15);
        let mut buf = [0u8; 5];
        f.read_at(10, &mut buf).unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn memory_file_capacity() {
        let f = MemoryFile::new(16);
        assert!(matches!(f.write_at(8, &[0u8; 16]), Err(Error::StoreFull)));
        assert!(matches!(f.truncate(17), Err(Error::StoreFull)));
    }

    #[test]
    fn memory_file_shrink_zeroes() {
        let f = MemoryFile::new(64);
        f.write_at(0, b"abcdefgh").unwrap();
        f.truncate(4).unwrap();
        f.truncate(8).unwrap();
        let mut buf = [0xffu8; 8];
        f.read_at(0, &mut buf).unwrap();
        assert_eq!(&buf, b"abcd\0\0\0\0");
    }

    #[test]
    fn writer_range_is_exclusive() {
        let a = MemoryFile::new(16);
        let b = a.duplicate();
        a.lock(LockRange::Writer, LockKind::Exclusive).unwrap();
        assert!(!b.try_lock(LockRange::Writer, LockKind::Exclusive).unwrap());
        a.unlock(LockRange::Writer).unwrap();
        assert!(b.try_lock(LockRange::Writer, LockKind::Exclusive).unwrap());
        b.unlock(LockRange::Writer).unwrap();
    }

    #[test]
    fn open_and_writer_ranges_are_independent() {
        let a = MemoryFile::new(16);
        let b = a.duplicate();
        a.lock(LockRange::Open, LockKind::Shared).unwrap();
        b.lock(LockRange::Open, LockKind::Shared).unwrap();
        // Readers keep the store open while one handle writes.
        assert!(a.try_lock(LockRange::Writer, LockKind::Exclusive).unwrap());
        assert!(!b.try_lock(LockRange::Writer, LockKind::Exclusive).unwrap());
        a.unlock(LockRange::Writer).unwrap();
        assert!(b.try_lock(LockRange::Writer, LockKind::Exclusive).unwrap());
    }

    #[test]
    fn failed_try_lock_keeps_previous_lock() {
        let a = MemoryFile::new(16);
        let b = a.duplicate();
        a.lock(LockRange::Writer, LockKind::Shared).unwrap();
        b.lock(LockRange::Writer, LockKind::Shared).unwrap();
        assert!(!a.try_lock(LockRange::Writer, LockKind::Exclusive).unwrap());
        // a still holds its shared lock, so b cannot upgrade either.
        assert!(!b.try_lock(LockRange::Writer, LockKind::Exclusive).unwrap());
    }
}
