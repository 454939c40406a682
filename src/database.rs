//! The database: a storage plus the decoded header and the chain of
//! committed footers.  Opening validates the prologue, walks the footer
//! chain to the newest generation whose CRC holds, and leaves the file
//! mapped for lock-free reads.  All mutation goes through
//! [`crate::transaction::Transaction`].

use atomic::Atomic;
use bytemuck::NoUninit;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::{Error, Result};
use crate::file::{File, LockKind, LockRange};
use crate::header::{Footer, Header, FIRST_ALLOC, FOOTER_HEAD_OFFSET, VERSION};
use crate::index::{IndexKind, INDEX_COUNT};
use crate::region::RegionFactory;
use crate::storage::{Storage, StoreBytes, StoreRef};
use crate::util::logger;
use crate::util::Address;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    ReadOnly,
    ReadWrite,
}

/// Advisory flag read by the out-of-process garbage collector: whether and
/// how it should reclaim unreferenced bytes after commits.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, NoUninit)]
pub enum VacuumMode {
    Disabled,
    Immediate,
    Spawn,
}

pub struct Database {
    storage: Storage,
    uuid: uuid::Uuid,
    access: AccessMode,
    /// Address of the newest committed footer.  Readers snapshot this once
    /// per operation; commits publish a new value after the header update is
    /// durable.
    footer_pos: AtomicU64,
    vacuum: Atomic<VacuumMode>,
    /// In-process writer exclusion; the cross-process half is the exclusive
    /// file lock taken in `begin`.
    pub(crate) writer: Mutex<()>,
    /// Set when a commit fails part-way: the database then refuses further
    /// transactions until reopened.
    pub(crate) read_only_after_failure: AtomicBool,
}

impl Database {
    /// Open (or, in read-write mode, create) the store at `path` with the
    /// default mmap-backed region sizes.
    #[cfg(unix)]
    pub fn open(path: &std::path::Path, access: AccessMode) -> Result<Database> {
        let writable = access == AccessMode::ReadWrite;
        let file = Arc::new(crate::file::PosixFile::open(path, writable)?);
        let factory = crate::region::MmapRegionFactory::with_default_sizes(file.clone(), writable);
        Self::from_parts(file, Box::new(factory), access)
    }

    /// Open a store over an arbitrary file capability and region factory.
    /// This is how the unit tests build memory-backed stores, and how an
    /// embedder supplies its own mapping primitives.
    pub fn from_parts(
        file: Arc<dyn File>,
        factory: Box<dyn RegionFactory>,
        access: AccessMode,
    ) -> Result<Database> {
        logger::try_init();

        file.lock(LockRange::Open, LockKind::Shared)?;
        let result = Self::open_locked(file.clone(), factory, access);
        if result.is_err() {
            let _ = file.unlock(LockRange::Open);
        }
        result
    }

    fn open_locked(
        file: Arc<dyn File>,
        factory: Box<dyn RegionFactory>,
        access: AccessMode,
    ) -> Result<Database> {
        if file.length()? == 0 {
            match access {
                AccessMode::ReadWrite => Self::build_new_store(&*file)?,
                AccessMode::ReadOnly => return Err(Error::CorruptHeader),
            }
        }

        let header = Self::read_header(&*file)?;
        let storage = Storage::new(file, factory)?;

        let db = Database {
            storage,
            uuid: uuid::Uuid::from_bytes(header.uuid),
            access,
            footer_pos: AtomicU64::new(0),
            vacuum: Atomic::new(VacuumMode::Disabled),
            writer: Mutex::new(()),
            read_only_after_failure: AtomicBool::new(false),
        };

        let head = db.recover_footer(header.footer_head)?;
        db.footer_pos.store(head.as_u64(), Ordering::Release);
        debug!(
            "opened store {} at generation {}",
            db.uuid,
            db.get_footer().generation
        );
        Ok(db)
    }

    fn read_header(file: &dyn File) -> Result<Header> {
        let len = file.length()?;
        if len < std::mem::size_of::<Header>() as u64 {
            return Err(Error::CorruptHeader);
        }
        let mut buf = [0u8; std::mem::size_of::<Header>()];
        file.read_at(0, &mut buf)?;
        let header: Header = bytemuck::pod_read_unaligned(&buf);
        if !header.is_valid() {
            return Err(Error::CorruptHeader);
        }
        if header.version != VERSION {
            return Err(Error::UnsupportedVersion(header.version));
        }
        Ok(header)
    }

    /// Write the prologue and the generation-zero footer of a fresh store.
    fn build_new_store(file: &dyn File) -> Result<()> {
        let uuid = uuid::Uuid::new_v4();
        info!("initializing new store {uuid}");

        let footer = Footer::new(
            0,
            FIRST_ALLOC.as_u64() + Footer::SIZE,
            Address::NULL,
            [Address::NULL; INDEX_COUNT],
        );
        file.write_at(FIRST_ALLOC.as_u64(), bytemuck::bytes_of(&footer))?;
        file.sync()?;

        let mut header = Header::new(uuid.into_bytes());
        header.footer_head = FIRST_ALLOC;
        file.write_at(0, bytemuck::bytes_of(&header))?;
        file.sync()
    }

    /// Walk the footer chain from `head` to the newest footer that
    /// validates, rewinding (and republishing the header, when writable)
    /// past any generation whose CRC does not hold.
    fn recover_footer(&self, head: Address) -> Result<Address> {
        let mut pos = head;
        let mut rewound = false;
        loop {
            match self.checked_footer(pos) {
                Some(_) => break,
                None => {
                    warn!("bad footer CRC at {pos}; rewinding to the previous generation");
                    rewound = true;
                    let prev = self.footer_prev_unchecked(pos);
                    match prev {
                        // The chain runs backward through strictly lower
                        // addresses; anything else means the file is beyond
                        // recovery.
                        Some(prev) if prev < pos => pos = prev,
                        _ => return Err(Error::CorruptHeader),
                    }
                }
            }
        }
        if rewound && self.access == AccessMode::ReadWrite {
            self.publish_footer_head(pos)?;
        }
        Ok(pos)
    }

    /// Decode and validate the footer at `pos`.  Returns `None` when the
    /// record is unreadable, fails its CRC, or is inconsistent with the
    /// position it was read from.
    fn checked_footer(&self, pos: Address) -> Option<Footer> {
        if pos.is_null()
            || !pos.is_aligned_to(crate::header::STORE_ALIGN)
            || pos.as_u64() + Footer::SIZE > self.storage.mapped_size()
        {
            return None;
        }
        let footer: Footer = *self.storage.at(pos);
        if !footer.is_valid() || footer.size != pos.as_u64() + Footer::SIZE {
            return None;
        }
        Some(footer)
    }

    /// The `prev` field of the (possibly corrupt) footer record at `pos`,
    /// if the record lies within the mapped file at all.
    fn footer_prev_unchecked(&self, pos: Address) -> Option<Address> {
        if pos.is_null() || pos.as_u64() + Footer::SIZE > self.storage.mapped_size() {
            return None;
        }
        let footer: StoreRef<'_, Footer> = self.storage.at(pos);
        Some(footer.prev)
    }

    /// Rewrite the header's footer-head word.  The caller is responsible
    /// for having made the named footer durable first.
    pub(crate) fn publish_footer_head(&self, pos: Address) -> Result<()> {
        let file = self.storage.file();
        file.write_at(FOOTER_HEAD_OFFSET, &pos.as_u64().to_le_bytes())?;
        file.sync()
    }

    /// Re-read the footer head from the file.  Called after taking the
    /// exclusive lock: another process may have committed since this
    /// database last looked.
    pub(crate) fn refresh_footer(&self) -> Result<()> {
        let header = Self::read_header(&**self.storage.file())?;
        let pos = header.footer_head;
        if pos.as_u64() == self.footer_pos.load(Ordering::Acquire) {
            return Ok(());
        }
        self.storage.map_bytes(pos.as_u64() + Footer::SIZE)?;
        let footer = self.checked_footer(pos).ok_or(Error::BadFooterCrc)?;
        self.storage.map_bytes(footer.size)?;
        self.footer_pos.store(pos.as_u64(), Ordering::Release);
        Ok(())
    }

    pub(crate) fn storage(&self) -> &Storage {
        &self.storage
    }

    /// Address of the newest committed footer.
    pub fn footer_pos(&self) -> Address {
        Address::new(self.footer_pos.load(Ordering::Acquire))
    }

    pub(crate) fn set_footer_pos(&self, pos: Address) {
        self.footer_pos.store(pos.as_u64(), Ordering::Release);
    }

    /// The current committed footer.
    pub fn get_footer(&self) -> StoreRef<'_, Footer> {
        self.storage.at(self.footer_pos())
    }

    /// The generation number of the newest commit.
    pub fn get_current_revision(&self) -> u64 {
        self.get_footer().generation
    }

    /// Walk the footer chain back to generation `generation`.  Returns
    /// `None` when the store has no such generation.
    pub fn footer_for_generation(&self, generation: u64) -> Option<Footer> {
        let mut footer: Footer = *self.get_footer();
        loop {
            if footer.generation == generation {
                return Some(footer);
            }
            if footer.generation < generation || footer.prev.is_null() {
                return None;
            }
            footer = *self.storage.at(footer.prev);
        }
    }

    /// Typed read accessor.  The returned handle borrows mapped memory
    /// where the range lies in one region, and owns a copy otherwise; it is
    /// valid for as long as the database lives.
    pub fn at<T: bytemuck::AnyBitPattern>(&self, addr: Address) -> StoreRef<'_, T> {
        self.storage.at(addr)
    }

    /// Raw read accessor for `size` bytes at `addr`.
    pub fn getro(&self, addr: Address, size: u64) -> StoreBytes<'_> {
        self.storage.getro(addr, size)
    }

    /// The root of an index as of the current committed generation.
    pub fn index_root(&self, kind: IndexKind) -> Address {
        self.get_footer().index_records[kind as usize]
    }

    pub fn uuid(&self) -> uuid::Uuid {
        self.uuid
    }

    pub fn access(&self) -> AccessMode {
        self.access
    }

    pub fn is_writable(&self) -> bool {
        self.access == AccessMode::ReadWrite
            && !self.read_only_after_failure.load(Ordering::Acquire)
    }

    /// Close the database, releasing the shared file lock.  Dropping the
    /// database has the same effect; `close` makes the intent explicit.
    pub fn close(self) {}

    pub fn set_vacuum_mode(&self, mode: VacuumMode) {
        self.vacuum.store(mode, atomic::Ordering::Release);
    }

    pub fn vacuum_mode(&self) -> VacuumMode {
        self.vacuum.load(atomic::Ordering::Acquire)
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        let _ = self.storage.file().unlock(LockRange::Open);
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("uuid", &self.uuid)
            .field("access", &self.access)
            .field("footer_pos", &self.footer_pos())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::*;
    use crate::util::constants::SEGMENT_BYTES;

    #[test]
    fn fresh_store_has_generation_zero() {
        let db = empty_store();
        let footer = db.get_footer();
        assert_eq!(footer.generation, 0);
        assert!(footer.prev.is_null());
        assert_eq!(footer.size, SEGMENT_BYTES + Footer::SIZE);
        assert!(footer.index_records.iter().all(|r| r.is_null()));
    }

    #[test]
    fn reopen_preserves_identity() {
        let file = store_file();
        let uuid = {
            let db = open_store(&file, AccessMode::ReadWrite);
            db.uuid()
        };
        let db = open_store(&file, AccessMode::ReadOnly);
        assert_eq!(db.uuid(), uuid);
        assert_eq!(db.get_current_revision(), 0);
    }

    #[test]
    fn empty_read_only_open_fails() {
        let file = std::sync::Arc::new(crate::file::MemoryFile::new(STORE_CAPACITY));
        let result = Database::from_parts(
            std::sync::Arc::new(file.duplicate()),
            test_factory(&file),
            AccessMode::ReadOnly,
        );
        assert!(matches!(result, Err(Error::CorruptHeader)));
    }

    #[test]
    fn corrupt_magic_is_rejected() {
        let file = store_file();
        {
            let _ = open_store(&file, AccessMode::ReadWrite);
        }
        file.write_at(0, b"not a store").unwrap();
        let result = Database::from_parts(
            std::sync::Arc::new(file.duplicate()),
            test_factory(&file),
            AccessMode::ReadWrite,
        );
        assert!(matches!(result, Err(Error::CorruptHeader)));
    }

    #[test]
    fn vacuum_mode_round_trips() {
        let db = empty_store();
        assert_eq!(db.vacuum_mode(), VacuumMode::Disabled);
        db.set_vacuum_mode(VacuumMode::Immediate);
        assert_eq!(db.vacuum_mode(), VacuumMode::Immediate);
    }
}
