//! The index kinds and the typed map/set facades over the HAMT core.  The
//! write, digest and ticket indices map content digests to extents; the
//! name index is a set of content-addressed strings.  Each committed footer
//! records one root per kind.

pub mod hamt;

use bytemuck::{Pod, Zeroable};
use enum_map::EnumMap;
use fnv::FnvHasher;
use std::alloc::Layout;
use std::hash::Hasher;
use std::marker::PhantomData;

use crate::database::Database;
use crate::error::Result;
use crate::transaction::Transaction;
use crate::util::Address;

use self::hamt::{Hamt, HamtEntry, HamtProbe};

/// The indices recorded in every footer, in slot order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, enum_map::Enum, strum_macros::EnumIter)]
pub enum IndexKind {
    Write,
    Digest,
    Ticket,
    Name,
}

/// The number of `index_records` slots in a footer.
pub const INDEX_COUNT: usize = 4;

/// FNV-1a over a byte string.  The trie layout on disk is a pure function
/// of this hash, so it must be identical in every process that opens the
/// store; a randomized hasher can never be used here.
pub(crate) fn stable_hash(bytes: &[u8]) -> u64 {
    let mut hasher = FnvHasher::default();
    hasher.write(bytes);
    hasher.finish()
}

/// A 128-bit content digest, little-endian on disk.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct Digest {
    pub low: u64,
    pub high: u64,
}

impl Digest {
    pub const fn new(value: u128) -> Digest {
        Digest {
            low: value as u64,
            high: (value >> 64) as u64,
        }
    }

    pub const fn as_u128(&self) -> u128 {
        ((self.high as u128) << 64) | self.low as u128
    }
}

/// The location and length of a stored blob.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct Extent {
    pub addr: Address,
    pub size: u64,
}

impl Extent {
    pub const fn new(addr: Address, size: u64) -> Extent {
        Extent { addr, size }
    }
}

/// A map from POD keys to POD values.  A leaf record is the key followed by
/// the value at its natural offset; keys compare and hash by their bytes.
pub struct HamtMap<K, V> {
    core: Hamt,
    _marker: PhantomData<fn() -> (K, V)>,
}

/// The layout of a leaf record: (record layout, value offset).
fn pair_layout<K, V>() -> (Layout, usize) {
    let (layout, value_offset) = Layout::new::<K>().extend(Layout::new::<V>()).unwrap();
    (layout.pad_to_align(), value_offset)
}

struct MapProbe<'a, K, V> {
    key: &'a K,
    _marker: PhantomData<fn() -> V>,
}

impl<K: Pod, V: Pod> HamtProbe for MapProbe<'_, K, V> {
    fn probe_hash(&self, _db: &Database) -> Result<u64> {
        Ok(stable_hash(bytemuck::bytes_of(self.key)))
    }

    fn matches(&self, db: &Database, leaf: Address) -> Result<bool> {
        let stored = db.getro(leaf, std::mem::size_of::<K>() as u64);
        Ok(&stored[..] == bytemuck::bytes_of(self.key))
    }

    fn stored_hash(&self, db: &Database, leaf: Address) -> Result<u64> {
        let stored = db.getro(leaf, std::mem::size_of::<K>() as u64);
        Ok(stable_hash(&stored))
    }
}

struct MapInsert<'a, K, V> {
    key: &'a K,
    value: &'a V,
}

impl<K: Pod, V: Pod> HamtProbe for MapInsert<'_, K, V> {
    fn probe_hash(&self, db: &Database) -> Result<u64> {
        MapProbe::<K, V> {
            key: self.key,
            _marker: PhantomData,
        }
        .probe_hash(db)
    }

    fn matches(&self, db: &Database, leaf: Address) -> Result<bool> {
        MapProbe::<K, V> {
            key: self.key,
            _marker: PhantomData,
        }
        .matches(db, leaf)
    }

    fn stored_hash(&self, db: &Database, leaf: Address) -> Result<u64> {
        MapProbe::<K, V> {
            key: self.key,
            _marker: PhantomData,
        }
        .stored_hash(db, leaf)
    }
}

impl<K: Pod, V: Pod> HamtEntry for MapInsert<'_, K, V> {
    fn write_leaf(&self, txn: &mut Transaction<'_>) -> Result<Address> {
        let (layout, value_offset) = pair_layout::<K, V>();
        let leaf = txn.alloc(layout.size() as u64, layout.align() as u64)?;
        txn.write(leaf, bytemuck::bytes_of(self.key))?;
        txn.write(leaf + value_offset as u64, bytemuck::bytes_of(self.value))?;
        Ok(leaf)
    }

    fn replaces(&self, db: &Database, leaf: Address) -> Result<bool> {
        let (_, value_offset) = pair_layout::<K, V>();
        let stored = db.getro(leaf + value_offset as u64, std::mem::size_of::<V>() as u64);
        Ok(&stored[..] != bytemuck::bytes_of(self.value))
    }
}

impl<K: Pod, V: Pod> HamtMap<K, V> {
    pub fn empty() -> Self {
        HamtMap {
            core: Hamt::empty(),
            _marker: PhantomData,
        }
    }

    /// Rebuild from a footer's root record; null means empty.
    pub fn from_root(root: Address) -> Self {
        HamtMap {
            core: Hamt::from_root(root),
            _marker: PhantomData,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.core.is_empty()
    }

    /// Insert or update.  Returns the leaf record address and true when the
    /// key was new.  Re-inserting an equal (key, value) pair writes
    /// nothing; an equal key with a different value writes a superseding
    /// leaf.
    pub fn insert(
        &mut self,
        txn: &mut Transaction<'_>,
        key: &K,
        value: &V,
    ) -> Result<(Address, bool)> {
        self.core.insert(txn, &MapInsert { key, value })
    }

    pub fn find(&self, db: &Database, key: &K) -> Result<Option<V>> {
        let probe = MapProbe::<K, V> {
            key,
            _marker: PhantomData,
        };
        match self.core.find(db, &probe)? {
            None => Ok(None),
            Some(leaf) => {
                let (_, value_offset) = pair_layout::<K, V>();
                let bytes = db.getro(leaf + value_offset as u64, std::mem::size_of::<V>() as u64);
                Ok(Some(bytemuck::pod_read_unaligned(&bytes)))
            }
        }
    }

    /// Serialize any in-heap nodes; returns the tagged root word for the
    /// footer's record slot.
    pub fn flush(&mut self, txn: &mut Transaction<'_>) -> Result<Address> {
        self.core.flush(txn)
    }

    fn into_core(self) -> Hamt {
        self.core
    }
}

/// A set whose members manage their own leaf records (the name index stores
/// indirect-string pointer slots).  Lookup and insertion go through the
/// [`HamtProbe`]/[`HamtEntry`] implementations of the member type.
pub struct HamtSet {
    core: Hamt,
}

impl HamtSet {
    pub fn empty() -> HamtSet {
        HamtSet { core: Hamt::empty() }
    }

    pub fn from_root(root: Address) -> HamtSet {
        HamtSet {
            core: Hamt::from_root(root),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.core.is_empty()
    }

    /// Insert a member.  The second `insert` of an equal member returns the
    /// existing leaf and false without allocating.
    pub fn insert<E: HamtEntry>(
        &mut self,
        txn: &mut Transaction<'_>,
        entry: &E,
    ) -> Result<(Address, bool)> {
        self.core.insert(txn, entry)
    }

    pub fn find<P: HamtProbe>(&self, db: &Database, probe: &P) -> Result<Option<Address>> {
        self.core.find(db, probe)
    }

    pub fn flush(&mut self, txn: &mut Transaction<'_>) -> Result<Address> {
        self.core.flush(txn)
    }

    fn into_core(self) -> Hamt {
        self.core
    }
}

/// Digest of a transaction payload to the extent holding it.
pub type WriteIndex = HamtMap<Digest, Extent>;
/// Digest of a fragment to the extent holding it.
pub type DigestIndex = HamtMap<Digest, Extent>;
/// Digest of a ticket to the extent holding it.
pub type TicketIndex = HamtMap<Digest, Extent>;
/// The content-addressed string pool.
pub type NameIndex = HamtSet;

fn map_index(db: &Database, kind: IndexKind, create: bool) -> Option<HamtMap<Digest, Extent>> {
    let root = db.index_root(kind);
    if root.is_null() && !create {
        return None;
    }
    Some(HamtMap::from_root(root))
}

/// The write index as of the current committed generation, or `None` when
/// it has never been populated and `create` is false.
pub fn get_write_index(db: &Database, create: bool) -> Option<WriteIndex> {
    map_index(db, IndexKind::Write, create)
}

pub fn get_digest_index(db: &Database, create: bool) -> Option<DigestIndex> {
    map_index(db, IndexKind::Digest, create)
}

pub fn get_ticket_index(db: &Database, create: bool) -> Option<TicketIndex> {
    map_index(db, IndexKind::Ticket, create)
}

pub fn get_name_index(db: &Database, create: bool) -> Option<NameIndex> {
    let root = db.index_root(IndexKind::Name);
    if root.is_null() && !create {
        return None;
    }
    Some(NameIndex::from_root(root))
}

/// The indices a transaction hands back at commit.  A kind that is absent
/// keeps the root it had in the base generation; a kind that is present is
/// flushed and its new root recorded.  A trie belongs to exactly one
/// transaction while it is being modified, which handing it to `commit`
/// makes literal.
#[derive(Default)]
pub struct IndexSet {
    cores: EnumMap<IndexKind, Option<Hamt>>,
}

impl IndexSet {
    pub fn new() -> IndexSet {
        IndexSet::default()
    }

    pub fn with_write(mut self, index: WriteIndex) -> IndexSet {
        self.cores[IndexKind::Write] = Some(index.into_core());
        self
    }

    pub fn with_digest(mut self, index: DigestIndex) -> IndexSet {
        self.cores[IndexKind::Digest] = Some(index.into_core());
        self
    }

    pub fn with_ticket(mut self, index: TicketIndex) -> IndexSet {
        self.cores[IndexKind::Ticket] = Some(index.into_core());
        self
    }

    pub fn with_name(mut self, index: NameIndex) -> IndexSet {
        self.cores[IndexKind::Name] = Some(index.into_core());
        self
    }

    pub(crate) fn take(&mut self, kind: IndexKind) -> Option<Hamt> {
        self.cores[kind].take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::*;
    use strum::IntoEnumIterator;

    #[test]
    fn kinds_cover_every_record_slot() {
        assert_eq!(IndexKind::iter().count(), INDEX_COUNT);
        let db = empty_store();
        for kind in IndexKind::iter() {
            assert!(db.index_root(kind).is_null());
        }
    }

    #[test]
    fn digest_round_trip() {
        let d = Digest::new(0x0123_4567_89ab_cdef_fedc_ba98_7654_3210);
        assert_eq!(d.as_u128(), 0x0123_4567_89ab_cdef_fedc_ba98_7654_3210);
        assert_eq!(d.low, 0xfedc_ba98_7654_3210);
        assert_eq!(d.high, 0x0123_4567_89ab_cdef);
    }

    #[test]
    fn map_insert_and_find() {
        let db = empty_store();
        let mut txn = db.begin().unwrap();
        let mut index = get_write_index(&db, true).unwrap();

        let key = Digest::new(42);
        let extent = Extent::new(Address::new(4096), 17);
        let (_, inserted) = index.insert(&mut txn, &key, &extent).unwrap();
        assert!(inserted);
        assert_eq!(index.find(&db, &key).unwrap(), Some(extent));
        assert_eq!(index.find(&db, &Digest::new(43)).unwrap(), None);
        txn.rollback();
    }

    #[test]
    fn map_replaces_changed_values_only() {
        let db = empty_store();
        let mut txn = db.begin().unwrap();
        let mut index = get_write_index(&db, true).unwrap();

        let key = Digest::new(7);
        let first = Extent::new(Address::new(8), 1);
        index.insert(&mut txn, &key, &first).unwrap();

        // Same key, same value: nothing is written.
        let reserved = txn.bytes_reserved();
        let (_, inserted) = index.insert(&mut txn, &key, &first).unwrap();
        assert!(!inserted);
        assert_eq!(txn.bytes_reserved(), reserved);

        // Same key, new value: the value is superseded.
        let second = Extent::new(Address::new(16), 2);
        let (_, inserted) = index.insert(&mut txn, &key, &second).unwrap();
        assert!(!inserted);
        assert_eq!(index.find(&db, &key).unwrap(), Some(second));
        txn.rollback();
    }

    #[test]
    fn missing_index_is_absent_until_created() {
        let db = empty_store();
        assert!(get_ticket_index(&db, false).is_none());
        assert!(get_ticket_index(&db, true).unwrap().is_empty());
    }

    #[test]
    fn committed_index_survives_reopen() {
        let file = store_file();
        {
            let db = open_store(&file, crate::database::AccessMode::ReadWrite);
            let mut txn = db.begin().unwrap();
            let mut index = get_digest_index(&db, true).unwrap();
            for k in 0..50u128 {
                index
                    .insert(&mut txn, &Digest::new(k), &Extent::new(Address::new(8 * (k as u64 + 1)), k as u64))
                    .unwrap();
            }
            txn.commit(IndexSet::new().with_digest(index)).unwrap();
        }

        let db = open_store(&file, crate::database::AccessMode::ReadOnly);
        let index = get_digest_index(&db, false).unwrap();
        for k in 0..50u128 {
            assert_eq!(
                index.find(&db, &Digest::new(k)).unwrap(),
                Some(Extent::new(Address::new(8 * (k as u64 + 1)), k as u64))
            );
        }
    }
}
