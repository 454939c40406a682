//! Content-addressed strings.  A stored string is two records: an
//! eight-byte pointer slot, whose address is what the rest of the store
//! refers to, and the body (a varint length followed by the bytes), placed
//! elsewhere.  The indirection allows a reference to a string to be written
//! before the string itself: inside the writing transaction the slot holds
//! a tagged pointer to the in-memory body, and the adder's flush appends
//! the bodies and patches every slot before the commit makes anything
//! visible.
//!
//! The name index guarantees each distinct body is stored at most once per
//! database: equality and hashing are defined by the body's bytes.

use std::borrow::Cow;

use crate::database::Database;
use crate::error::Result;
use crate::index::hamt::{HamtEntry, HamtProbe};
use crate::index::{stable_hash, NameIndex};
use crate::transaction::Transaction;
use crate::util::{varint, Address};

/// Tag bit marking a pointer slot that still names an in-process body.
/// Slot values are either a body address (aligned, bit zero clear) or a
/// pointer to a [`PendingBody`] with this bit set.
const HEAP_POINTER_TAG: u64 = 1;

/// An owned body awaiting its store write.  Boxed by the adder so that its
/// address is stable while further strings are added.
struct PendingBody {
    bytes: Box<str>,
}

/// A string that is either still in memory or stored behind a pointer slot.
#[derive(Clone, Copy)]
pub struct IndirectString<'a> {
    db: &'a Database,
    repr: Repr<'a>,
}

#[derive(Clone, Copy)]
enum Repr<'a> {
    /// Not yet written: a borrowed view of the body.
    View(&'a str),
    /// The address of a pointer slot in the store.
    Stored(Address),
}

impl<'a> IndirectString<'a> {
    pub fn new(db: &'a Database, view: &'a str) -> IndirectString<'a> {
        IndirectString {
            db,
            repr: Repr::View(view),
        }
    }

    pub fn from_address(db: &'a Database, addr: Address) -> IndirectString<'a> {
        IndirectString {
            db,
            repr: Repr::Stored(addr),
        }
    }

    /// The pointer-slot address, for stored strings.
    pub fn address(&self) -> Option<Address> {
        match self.repr {
            Repr::View(_) => None,
            Repr::Stored(addr) => Some(addr),
        }
    }

    /// Resolve to the body.  Borrows mapped memory where the body lies in
    /// one region; owns a copy where it spans.
    ///
    /// A slot still carrying an in-process body pointer resolves through
    /// that pointer.  Such slots exist only inside the transaction that
    /// wrote them, and only while the adder that owns the bodies is alive;
    /// a committed store never contains one (see
    /// [`IndirectStringAdder::flush`]).
    pub fn as_string_view(&self) -> Cow<'a, str> {
        match self.repr {
            Repr::View(view) => Cow::Borrowed(view),
            Repr::Stored(slot) => {
                let word = u64::from_le_bytes(self.db.getro(slot, 8)[..].try_into().unwrap());
                if word & HEAP_POINTER_TAG != 0 {
                    let pending = (word & !HEAP_POINTER_TAG) as *const PendingBody;
                    let view: &'a str = unsafe { &(*pending).bytes };
                    return Cow::Borrowed(view);
                }
                self.read_body(Address::new(word))
            }
        }
    }

    fn read_body(&self, body: Address) -> Cow<'a, str> {
        // The length prefix may sit at the very end of the mapped file;
        // read only what is there.
        let avail = std::cmp::min(
            varint::MAX_ENCODED_LEN as u64,
            self.db.storage().mapped_size() - body.as_u64(),
        );
        let prefix = self.db.getro(body, avail);
        let (len, prefix_len) =
            varint::decode(&prefix).unwrap_or_else(|| panic!("corrupt string body at {body}"));
        drop(prefix);

        match self.db.getro(body + prefix_len as u64, len) {
            crate::storage::StoreBytes::Mapped(bytes) => Cow::Borrowed(
                std::str::from_utf8(bytes)
                    .unwrap_or_else(|_| panic!("corrupt string body at {body}")),
            ),
            crate::storage::StoreBytes::Owned(bytes) => Cow::Owned(
                String::from_utf8(bytes.into_vec())
                    .unwrap_or_else(|_| panic!("corrupt string body at {body}")),
            ),
        }
    }
}

impl PartialEq for IndirectString<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.as_string_view() == other.as_string_view()
    }
}

impl Eq for IndirectString<'_> {}

impl std::hash::Hash for IndirectString<'_> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        state.write(self.as_string_view().as_bytes());
    }
}

impl std::fmt::Debug for IndirectString<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "IndirectString({:?})", self.as_string_view())
    }
}

impl HamtProbe for IndirectString<'_> {
    fn probe_hash(&self, _db: &Database) -> Result<u64> {
        Ok(stable_hash(self.as_string_view().as_bytes()))
    }

    fn matches(&self, db: &Database, leaf: Address) -> Result<bool> {
        let stored = IndirectString::from_address(db, leaf);
        Ok(stored.as_string_view() == self.as_string_view())
    }

    fn stored_hash(&self, db: &Database, leaf: Address) -> Result<u64> {
        let stored = IndirectString::from_address(db, leaf);
        Ok(stable_hash(stored.as_string_view().as_bytes()))
    }
}

/// The insertion key the adder uses: a pending body plus the tagged word
/// that its pointer slot is seeded with.
struct NameInsert<'a> {
    body: &'a str,
    slot_word: u64,
}

impl HamtProbe for NameInsert<'_> {
    fn probe_hash(&self, _db: &Database) -> Result<u64> {
        Ok(stable_hash(self.body.as_bytes()))
    }

    fn matches(&self, db: &Database, leaf: Address) -> Result<bool> {
        let stored = IndirectString::from_address(db, leaf);
        Ok(stored.as_string_view() == self.body)
    }

    fn stored_hash(&self, db: &Database, leaf: Address) -> Result<u64> {
        let stored = IndirectString::from_address(db, leaf);
        Ok(stable_hash(stored.as_string_view().as_bytes()))
    }
}

impl HamtEntry for NameInsert<'_> {
    fn write_leaf(&self, txn: &mut Transaction<'_>) -> Result<Address> {
        txn.alloc_and_write(&self.slot_word.to_le_bytes(), 8)
    }
}

/// Batches strings into one transaction, writing each distinct body exactly
/// once.  `add` performs the first phase (pointer slot into the name
/// index); `flush` performs the second (bodies appended, slots patched).
#[derive(Default)]
pub struct IndirectStringAdder {
    pending: Vec<(Box<PendingBody>, Address)>,
}

impl IndirectStringAdder {
    pub fn new() -> IndirectStringAdder {
        IndirectStringAdder::default()
    }

    /// Insert `body` into the name index.  Returns the pointer-slot address
    /// and whether the string was new; adding a string equal to one already
    /// in the index (or already added to this adder) writes nothing.
    pub fn add(
        &mut self,
        txn: &mut Transaction<'_>,
        index: &mut NameIndex,
        body: &str,
    ) -> Result<(Address, bool)> {
        let pending = Box::new(PendingBody { bytes: body.into() });
        let ptr = &*pending as *const PendingBody as u64;
        debug_assert!(ptr & HEAP_POINTER_TAG == 0);
        let entry = NameInsert {
            body: &pending.bytes,
            slot_word: ptr | HEAP_POINTER_TAG,
        };
        let (slot, inserted) = index.insert(txn, &entry)?;
        if inserted {
            self.pending.push((pending, slot));
        }
        Ok((slot, inserted))
    }

    /// Append the body of every string added so far and patch its pointer
    /// slot with the body address.  Must be called before the transaction
    /// commits: a committed slot must never carry an in-process pointer.
    pub fn flush(&mut self, txn: &mut Transaction<'_>) -> Result<()> {
        for (pending, slot) in self.pending.drain(..) {
            let body = pending.bytes.as_bytes();
            let mut prefix_buf = [0u8; varint::MAX_ENCODED_LEN];
            let prefix = varint::encode(body.len() as u64, &mut prefix_buf);

            // Bodies keep bit zero of their address clear for the slot tag.
            let body_addr = txn.alloc((prefix.len() + body.len()) as u64, 2)?;
            txn.write(body_addr, prefix)?;
            txn.write(body_addr + prefix.len() as u64, body)?;
            txn.write(slot, &body_addr.as_u64().to_le_bytes())?;
            trace!("string body {} bytes at {body_addr}", body.len());
        }
        Ok(())
    }

    /// True when every added string has had its body written.
    pub fn is_flushed(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::{get_name_index, IndexSet};
    use crate::test_support::*;

    #[test]
    fn in_memory_equality() {
        let db = empty_store();
        let x = IndirectString::new(&db, "body");
        let y = IndirectString::new(&db, "body");
        let z = IndirectString::new(&db, "other");
        assert_eq!(x.as_string_view(), "body");
        assert_eq!(x, y);
        assert_ne!(x, z);
    }

    #[test]
    fn store_round_trip() {
        let db = empty_store();
        let slot = {
            let mut txn = db.begin().unwrap();
            let mut names = get_name_index(&db, true).unwrap();
            let mut adder = IndirectStringAdder::new();

            let (slot, inserted) = adder.add(&mut txn, &mut names, "string").unwrap();
            assert!(inserted);
            // Phase one wrote exactly the pointer slot.
            assert_eq!(txn.bytes_reserved(), 8);

            // Before the bodies land, the slot resolves through memory.
            assert_eq!(
                IndirectString::from_address(&db, slot).as_string_view(),
                "string"
            );

            adder.flush(&mut txn).unwrap();
            assert!(adder.is_flushed());
            txn.commit(IndexSet::new().with_name(names)).unwrap();
            slot
        };

        let stored = IndirectString::from_address(&db, slot);
        assert_eq!(stored.as_string_view(), "string");
        assert_eq!(stored, IndirectString::new(&db, "string"));
    }

    #[test]
    fn adding_twice_writes_once() {
        let db = empty_store();
        let mut txn = db.begin().unwrap();
        let mut names = get_name_index(&db, true).unwrap();
        let mut adder = IndirectStringAdder::new();

        let (first, inserted) = adder.add(&mut txn, &mut names, "x").unwrap();
        assert!(inserted);
        let (second, inserted) = adder.add(&mut txn, &mut names, "x").unwrap();
        assert!(!inserted);
        assert_eq!(first, second);
        // One pointer slot, no second body.
        assert_eq!(txn.bytes_reserved(), 8);

        adder.flush(&mut txn).unwrap();
        txn.commit(IndexSet::new().with_name(names)).unwrap();
    }

    #[test]
    fn nothing_added() {
        let db = empty_store();
        let mut txn = db.begin().unwrap();
        let mut adder = IndirectStringAdder::new();
        adder.flush(&mut txn).unwrap();
        assert_eq!(txn.bytes_reserved(), 0);
        txn.commit(IndexSet::default()).unwrap();
        assert_eq!(db.get_current_revision(), 0);
    }

    #[test]
    fn find_after_reopen() {
        let file = store_file();
        {
            let db = open_store(&file, crate::database::AccessMode::ReadWrite);
            let mut txn = db.begin().unwrap();
            let mut names = get_name_index(&db, true).unwrap();
            let mut adder = IndirectStringAdder::new();
            for body in ["hello", "world", ""] {
                adder.add(&mut txn, &mut names, body).unwrap();
            }
            adder.flush(&mut txn).unwrap();
            txn.commit(IndexSet::new().with_name(names)).unwrap();
        }

        let db = open_store(&file, crate::database::AccessMode::ReadOnly);
        let names = get_name_index(&db, false).unwrap();
        for body in ["hello", "world", ""] {
            let probe = IndirectString::new(&db, body);
            let leaf = names.find(&db, &probe).unwrap().expect(body);
            assert_eq!(
                IndirectString::from_address(&db, leaf).as_string_view(),
                body
            );
        }
        assert!(names
            .find(&db, &IndirectString::new(&db, "absent"))
            .unwrap()
            .is_none());
    }
}
