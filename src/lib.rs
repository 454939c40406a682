//! pstore is a persistent, append-only, content-addressed data store.  A
//! single on-disk file holds indices of strings, digests and tickets;
//! multiple processes read it lock-free through memory-mapped segments
//! while writers serialize under an exclusive transaction lock.
//!
//! The major parts:
//! * [Addresses](util/address/struct.Address.html): stable 64-bit byte
//!   positions in the logical file, decomposed into (segment, offset).
//! * [Storage](storage/struct.Storage.html): the segment address table over
//!   the mapped regions produced by a
//!   [RegionFactory](region/trait.RegionFactory.html).
//! * [Database](database/struct.Database.html) and
//!   [Transaction](transaction/struct.Transaction.html): the footer chain
//!   of committed generations and the append allocator that extends it.
//! * [Indices](index/index.html): copy-on-write hash array mapped tries,
//!   one root per kind in every footer.
//! * [Indirect strings](indirect_string/index.html): the content-addressed
//!   string pool on top of the name index.

#[macro_use]
extern crate log;

pub mod util;
pub mod database;
pub mod error;
pub mod file;
pub mod header;
pub mod index;
pub mod indirect_string;
pub mod region;
pub mod storage;
pub mod transaction;

pub use crate::database::{AccessMode, Database, VacuumMode};
pub use crate::error::{AndThenTuple, Category, Error, Result};
pub use crate::file::{File, LockKind, LockRange, MemoryFile};
pub use crate::header::{Footer, Header};
pub use crate::index::{Digest, Extent, IndexKind, IndexSet, NameIndex};
pub use crate::indirect_string::{IndirectString, IndirectStringAdder};
pub use crate::region::{Region, RegionFactory};
pub use crate::storage::{Storage, StoreBytes, StoreRef};
pub use crate::transaction::{Transaction, WriteGuard};
pub use crate::util::Address;

#[cfg(unix)]
pub use crate::file::PosixFile;

/// Common scaffolding for the unit tests: memory-backed stores with
/// single-segment regions, so that spanning paths are easy to reach.
#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Arc;

    use crate::database::{AccessMode, Database};
    use crate::file::MemoryFile;
    use crate::region::{HeapRegionFactory, RegionFactory};
    use crate::util::constants::SEGMENT_BYTES;

    /// Enough room for every scenario the tests build.
    pub const STORE_CAPACITY: usize = 48 * SEGMENT_BYTES as usize;

    pub fn store_file() -> MemoryFile {
        MemoryFile::new(STORE_CAPACITY)
    }

    /// One region per segment: spanning requests start at the second
    /// segment boundary.
    pub fn test_factory(file: &MemoryFile) -> Box<dyn RegionFactory> {
        Box::new(HeapRegionFactory::new(
            Arc::new(file.duplicate()),
            SEGMENT_BYTES,
            SEGMENT_BYTES,
        ))
    }

    pub fn open_store(file: &MemoryFile, access: AccessMode) -> Database {
        Database::from_parts(Arc::new(file.duplicate()), test_factory(file), access).unwrap()
    }

    pub fn empty_store() -> Database {
        open_store(&store_file(), AccessMode::ReadWrite)
    }
}
