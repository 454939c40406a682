//! The append transaction.  One writer at a time: `begin` takes the
//! in-process writer mutex and upgrades the OS file lock to exclusive, and
//! both are released when the transaction commits, rolls back, or is
//! dropped.  Bytes are reserved at a cursor that starts at the committed
//! tail; nothing reserved becomes visible to readers until the commit
//! publishes a new footer.

use std::ptr::NonNull;
use std::sync::atomic::Ordering;
use std::sync::MutexGuard;

use crate::database::Database;
use crate::error::{Error, Result};
use crate::file::{LockKind, LockRange};
use crate::header::{Footer, STORE_ALIGN};
use crate::index::{IndexKind, IndexSet};
use strum::IntoEnumIterator;
use crate::storage::Storage;
use crate::util::constants::{ADDRESS_SPACE_BYTES, SEGMENT_BYTES};
use crate::util::conversions::{is_power_of_two, raw_align_up};
use crate::util::Address;

pub struct Transaction<'db> {
    db: &'db Database,
    _writer: MutexGuard<'db, ()>,
    /// Copy of the footer this transaction builds on.
    base: Footer,
    /// Address of that footer; the new footer's `prev`.
    base_pos: Address,
    /// The append cursor: one past the highest reserved byte.
    size: u64,
    finished: bool,
}

impl Database {
    /// Open a transaction, blocking until any other writer (in this process
    /// or another) has finished.
    pub fn begin(&self) -> Result<Transaction<'_>> {
        self.check_writable()?;
        let writer = self.writer.lock().unwrap();
        self.storage()
            .file()
            .lock(LockRange::Writer, LockKind::Exclusive)?;
        Transaction::start(self, writer)
    }

    /// Open a transaction if no other writer currently holds one; fails
    /// with [`Error::AlreadyOpen`] instead of blocking.
    pub fn try_begin(&self) -> Result<Transaction<'_>> {
        self.check_writable()?;
        let writer = match self.writer.try_lock() {
            Ok(guard) => guard,
            Err(std::sync::TryLockError::WouldBlock) => return Err(Error::AlreadyOpen),
            Err(std::sync::TryLockError::Poisoned(e)) => panic!("writer mutex poisoned: {e}"),
        };
        if !self
            .storage()
            .file()
            .try_lock(LockRange::Writer, LockKind::Exclusive)?
        {
            return Err(Error::AlreadyOpen);
        }
        Transaction::start(self, writer)
    }

    fn check_writable(&self) -> Result<()> {
        if !self.is_writable() {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                "the database is not writable",
            )));
        }
        Ok(())
    }
}

impl<'db> Transaction<'db> {
    fn start(db: &'db Database, writer: MutexGuard<'db, ()>) -> Result<Transaction<'db>> {
        // Another process may have committed while we waited for the lock.
        db.refresh_footer()?;
        let base_pos = db.footer_pos();
        let base: Footer = *db.get_footer();
        trace!(
            "transaction open on generation {}, cursor at {}",
            base.generation,
            base.size
        );
        Ok(Transaction {
            db,
            _writer: writer,
            base,
            base_pos,
            size: base.size,
            finished: false,
        })
    }

    pub fn db(&self) -> &'db Database {
        self.db
    }

    /// The generation this transaction builds on.
    pub fn base_generation(&self) -> u64 {
        self.base.generation
    }

    /// The root the named index had when this transaction began.
    pub fn base_index_root(&self, kind: crate::index::IndexKind) -> Address {
        self.base.index_records[kind as usize]
    }

    /// The number of bytes reserved so far.
    pub fn bytes_reserved(&self) -> u64 {
        self.size - self.base.size
    }

    /// Reserve `size` bytes at the cursor, aligned to `align`, growing the
    /// file as needed.  The reservation is not published until commit.
    pub fn alloc(&mut self, size: u64, align: u64) -> Result<Address> {
        assert!(is_power_of_two(align) && align <= SEGMENT_BYTES);
        let aligned = raw_align_up(self.size, align);
        let end = match aligned.checked_add(size) {
            Some(end) if end <= ADDRESS_SPACE_BYTES => end,
            _ => return Err(Error::StoreFull),
        };
        self.db.storage().map_bytes(end)?;
        self.size = end;
        Ok(Address::new(aligned))
    }

    /// Reserve and return a writable view of the new bytes.  The view
    /// borrows the transaction, so it must be dropped before the next
    /// reservation or the commit.
    pub fn alloc_rw(&mut self, size: u64, align: u64) -> Result<(Address, WriteGuard<'_>)> {
        let addr = self.alloc(size, align)?;
        let guard = WriteGuard::new(self.db.storage(), addr, size, false);
        Ok((addr, guard))
    }

    /// A writable view of bytes previously reserved by this transaction.
    pub fn getrw(&mut self, addr: Address, size: u64) -> Result<WriteGuard<'_>> {
        debug_assert!(
            addr.as_u64() >= self.base.size && addr.as_u64() + size <= self.size,
            "getrw of {size} bytes at {addr} is outside this transaction"
        );
        Ok(WriteGuard::new(self.db.storage(), addr, size, true))
    }

    /// Overwrite previously reserved bytes.
    pub fn write(&mut self, addr: Address, bytes: &[u8]) -> Result<()> {
        debug_assert!(
            addr.as_u64() >= self.base.size && addr.as_u64() + bytes.len() as u64 <= self.size,
            "write of {} bytes at {addr} is outside this transaction",
            bytes.len()
        );
        self.db.storage().copy_to_store(addr, bytes);
        Ok(())
    }

    /// Reserve space for `bytes` and write it.
    pub fn alloc_and_write(&mut self, bytes: &[u8], align: u64) -> Result<Address> {
        let addr = self.alloc(bytes.len() as u64, align)?;
        self.db.storage().copy_to_store(addr, bytes);
        Ok(addr)
    }

    /// Reserve space for a POD value and write it with its natural
    /// alignment.
    pub fn alloc_and_write_pod<T: bytemuck::NoUninit>(&mut self, value: &T) -> Result<Address> {
        self.alloc_and_write(bytemuck::bytes_of(value), std::mem::align_of::<T>() as u64)
    }

    /// Overwrite a previously reserved POD value.
    pub fn write_pod<T: bytemuck::NoUninit>(&mut self, addr: Address, value: &T) -> Result<()> {
        self.write(addr, bytemuck::bytes_of(value))
    }

    /// Flush the given indices, append the new footer and publish it.
    /// Returns the generation number of the committed state.  If nothing
    /// was reserved and no index changed, no new generation is created.
    pub fn commit(mut self, indices: IndexSet) -> Result<u64> {
        let result = self.commit_inner(indices);
        if result.is_err() {
            // A failed commit may have published nothing or only parts of
            // the footer: leave the reserved bytes to be overwritten by a
            // future transaction, but refuse to open one on this handle.
            self.db
                .read_only_after_failure
                .store(true, Ordering::Release);
        }
        self.finish();
        result
    }

    fn commit_inner(&mut self, mut indices: IndexSet) -> Result<u64> {
        let mut records = self.base.index_records;
        for kind in IndexKind::iter() {
            if let Some(mut core) = indices.take(kind) {
                records[kind as usize] = core.flush(self)?;
            }
        }

        if self.size == self.base.size && records == self.base.index_records {
            trace!("commit of an empty transaction; no new generation");
            return Ok(self.base.generation);
        }

        let footer_addr = self.alloc(Footer::SIZE, STORE_ALIGN)?;
        let footer = Footer::new(
            self.base.generation + 1,
            self.size,
            self.base_pos,
            records,
        );
        self.db
            .storage()
            .copy_to_store(footer_addr, bytemuck::bytes_of(&footer));

        // The footer (and everything it references) must be durable before
        // the header names it: a crash between the two syncs leaves the
        // previous generation intact.
        self.db.storage().sync()?;
        self.db.publish_footer_head(footer_addr)?;

        self.db.set_footer_pos(footer_addr);
        debug!(
            "committed generation {} at {footer_addr}, store size {}",
            footer.generation, footer.size
        );
        Ok(footer.generation)
    }

    /// Abandon the transaction.  Reserved bytes are left in the file as
    /// garbage for the next transaction to overwrite.
    pub fn rollback(mut self) {
        trace!("transaction rolled back, {} bytes dropped", self.bytes_reserved());
        self.finish();
    }

    fn finish(&mut self) {
        if !self.finished {
            self.finished = true;
            let _ = self.db.storage().file().unlock(LockRange::Writer);
        }
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if !self.finished {
            trace!(
                "transaction dropped without commit, {} bytes dropped",
                self.bytes_reserved()
            );
        }
        self.finish();
    }
}

/// A writable window onto reserved bytes.  When the range lies within one
/// region this writes straight through to mapped memory; when it spans
/// regions the writes collect in a shadow buffer that is copied back,
/// piecewise, when the guard drops.
pub struct WriteGuard<'t> {
    storage: &'t Storage,
    addr: Address,
    repr: GuardRepr,
}

enum GuardRepr {
    Direct { ptr: NonNull<u8>, len: usize },
    Shadow { buf: Box<[u8]> },
}

impl<'t> WriteGuard<'t> {
    fn new(storage: &'t Storage, addr: Address, size: u64, preload: bool) -> WriteGuard<'t> {
        let repr = if size == 0 || storage.request_spans_regions(addr, size) {
            let mut buf = vec![0u8; size as usize].into_boxed_slice();
            if preload {
                storage.copy_from_store(addr, &mut buf);
            }
            GuardRepr::Shadow { buf }
        } else {
            GuardRepr::Direct {
                ptr: storage.address_to_pointer(addr),
                len: size as usize,
            }
        };
        WriteGuard { storage, addr, repr }
    }

    pub fn address(&self) -> Address {
        self.addr
    }

    /// Fill the window from a POD value.  The window must be exactly the
    /// value's size.
    pub fn set_pod<T: bytemuck::NoUninit>(&mut self, value: &T) {
        self[..].copy_from_slice(bytemuck::bytes_of(value));
    }
}

impl std::ops::Deref for WriteGuard<'_> {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        match &self.repr {
            GuardRepr::Direct { ptr, len } => unsafe {
                std::slice::from_raw_parts(ptr.as_ptr(), *len)
            },
            GuardRepr::Shadow { buf } => buf,
        }
    }
}

impl std::ops::DerefMut for WriteGuard<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        match &mut self.repr {
            GuardRepr::Direct { ptr, len } => unsafe {
                std::slice::from_raw_parts_mut(ptr.as_ptr(), *len)
            },
            GuardRepr::Shadow { buf } => buf,
        }
    }
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        if let GuardRepr::Shadow { buf } = &self.repr {
            self.storage.copy_to_store(self.addr, buf);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::AccessMode;
    use crate::test_support::*;

    #[test]
    fn alloc_respects_alignment_and_order() {
        let db = empty_store();
        let mut txn = db.begin().unwrap();
        let a = txn.alloc(3, 1).unwrap();
        let b = txn.alloc(8, 8).unwrap();
        assert!(b > a);
        assert!(b.is_aligned_to(8));
        assert_eq!(txn.bytes_reserved(), (b.as_u64() + 8) - a.as_u64());
        txn.rollback();
    }

    #[test]
    fn commit_publishes_a_new_generation() {
        let db = empty_store();
        let gen0_size = db.get_footer().size;

        let mut txn = db.begin().unwrap();
        let addr = txn.alloc_and_write(b"payload", 1).unwrap();
        let generation = txn.commit(IndexSet::default()).unwrap();
        assert_eq!(generation, 1);

        let footer = db.get_footer();
        assert_eq!(footer.generation, 1);
        assert_eq!(footer.size, addr.as_u64() + 7 + pad_to_footer(addr.as_u64() + 7));
        assert!(footer.size > gen0_size);
        assert_eq!(&db.getro(addr, 7)[..], b"payload");
    }

    // The footer lands 8-aligned immediately after the payload.
    fn pad_to_footer(end: u64) -> u64 {
        crate::util::conversions::raw_align_up(end, STORE_ALIGN) - end + Footer::SIZE
    }

    #[test]
    fn empty_commit_creates_no_generation() {
        let db = empty_store();
        let txn = db.begin().unwrap();
        assert_eq!(txn.commit(IndexSet::default()).unwrap(), 0);
        assert_eq!(db.get_current_revision(), 0);
    }

    #[test]
    fn rollback_resets_the_cursor() {
        let db = empty_store();
        {
            let mut txn = db.begin().unwrap();
            txn.alloc_and_write(b"doomed", 1).unwrap();
            txn.rollback();
        }
        let mut txn = db.begin().unwrap();
        let addr = txn.alloc(1, 1).unwrap();
        // The next transaction allocates over the abandoned bytes.
        assert_eq!(addr.as_u64(), db.get_footer().size);
        txn.rollback();
    }

    #[test]
    fn second_writer_is_excluded() {
        let file = store_file();
        let db1 = open_store(&file, AccessMode::ReadWrite);
        let db2 = open_store(&file, AccessMode::ReadWrite);

        let txn = db1.begin().unwrap();
        assert!(matches!(db2.try_begin(), Err(Error::AlreadyOpen)));
        txn.rollback();
        db2.try_begin().unwrap().rollback();
    }

    #[test]
    fn generations_chain_backward() {
        let db = empty_store();
        for expected in 1..=3u64 {
            let mut txn = db.begin().unwrap();
            txn.alloc_and_write(b"x", 1).unwrap();
            assert_eq!(txn.commit(IndexSet::default()).unwrap(), expected);
        }
        let f3 = *db.get_footer();
        let f2: Footer = *db.at(f3.prev);
        let f1: Footer = *db.at(f2.prev);
        assert_eq!((f1.generation, f2.generation, f3.generation), (1, 2, 3));
        assert_eq!(f2.size, f3.prev.as_u64() + Footer::SIZE);
    }

    #[test]
    fn write_guard_shadow_lands_on_drop() {
        let db = empty_store();
        let mut txn = db.begin().unwrap();
        // Straddle the first region boundary after the header segment.
        let target = 2 * crate::util::constants::SEGMENT_BYTES - 4;
        let pad = target - db.get_footer().size;
        txn.alloc(pad, 1).unwrap();
        let (addr, mut guard) = txn.alloc_rw(8, 1).unwrap();
        guard.copy_from_slice(b"spanning");
        drop(guard);
        assert_eq!(&db.getro(addr, 8)[..], b"spanning");
        txn.commit(IndexSet::default()).unwrap();
        assert_eq!(&db.getro(addr, 8)[..], b"spanning");
    }
}
