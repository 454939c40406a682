//! The copy-on-write hash array mapped trie underneath every index.
//!
//! Hash bits are consumed six at a time from the low end, giving 64-way
//! branches; keys whose full hashes collide chain in a linear node.  A node
//! reference is a tagged word: an untagged store address names a leaf
//! record, the low tag bits mark in-store branch and linear nodes, and
//! during an open transaction a reference may instead be an in-heap node
//! awaiting serialization.  Committed nodes are immutable; an insert
//! path-copies from the root, materializing only the branches it walks
//! through, and `flush` serializes the heap nodes post-order so that every
//! child's address is known before its parent is written.

use crate::database::Database;
use crate::error::Result;
use crate::header::STORE_ALIGN;
use crate::storage::StoreBytes;
use crate::transaction::Transaction;
use crate::util::Address;

/// Hash bits consumed per level.
pub const BITS_PER_LEVEL: usize = 6;
/// Fan-out of a branch node.
pub const FANOUT: usize = 1 << BITS_PER_LEVEL;
/// The deepest level a branch can occupy: past this every hash bit has been
/// consumed and colliding keys chain linearly.
pub const MAX_DEPTH: usize = (64 + BITS_PER_LEVEL - 1) / BITS_PER_LEVEL;

const BRANCH_TAG: u64 = 0b01;
const LINEAR_TAG: u64 = 0b10;
const TAG_MASK: u64 = 0b11;

/// The hash bits selecting a branch slot at `depth`.
fn slice_hash(hash: u64, depth: usize) -> usize {
    debug_assert!(depth < MAX_DEPTH);
    ((hash >> (depth * BITS_PER_LEVEL)) & (FANOUT as u64 - 1)) as usize
}

/// How a lookup key behaves against the trie: the key hashes itself, can
/// hash the key held by a stored leaf, and can compare itself to one.
pub trait HamtProbe {
    fn probe_hash(&self, db: &Database) -> Result<u64>;
    fn matches(&self, db: &Database, leaf: Address) -> Result<bool>;
    fn stored_hash(&self, db: &Database, leaf: Address) -> Result<u64>;
}

/// A probe that can also store itself as a new leaf record.
pub trait HamtEntry: HamtProbe {
    fn write_leaf(&self, txn: &mut Transaction<'_>) -> Result<Address>;

    /// On an equal-key hit: should the existing leaf be superseded?  Map
    /// entries answer true when the stored value differs; set members never
    /// replace.
    fn replaces(&self, db: &Database, leaf: Address) -> Result<bool> {
        let _ = (db, leaf);
        Ok(false)
    }
}

/// A node reference.  The `Branch`/`Linear` variants name committed,
/// immutable records; the heap variants exist only inside an open
/// transaction.
enum Child {
    Leaf(Address),
    Branch(Address),
    Linear(Address),
    HeapBranch(Box<BranchNode>),
    HeapLinear(Box<LinearNode>),
}

/// An in-heap branch: a bitmap of occupied slots and one child per set bit,
/// in slot order.
struct BranchNode {
    bitmap: u64,
    children: Vec<Child>,
}

/// An in-heap collision chain: leaves whose keys share all 64 hash bits.
struct LinearNode {
    leaves: Vec<Address>,
}

fn decode_child(word: u64) -> Child {
    let addr = Address::new(word & !TAG_MASK);
    match word & TAG_MASK {
        0 => Child::Leaf(addr),
        BRANCH_TAG => Child::Branch(addr),
        LINEAR_TAG => Child::Linear(addr),
        _ => panic!("corrupt trie child word {word:#x}"),
    }
}

fn read_word(db: &Database, addr: Address) -> u64 {
    let bytes = db.getro(addr, 8);
    u64::from_le_bytes(bytes[..].try_into().unwrap())
}

fn read_branch(db: &Database, addr: Address) -> BranchNode {
    let bitmap = read_word(db, addr);
    let n = bitmap.count_ones() as u64;
    let words: StoreBytes<'_> = db.getro(addr + 8, n * 8);
    let children = words
        .chunks_exact(8)
        .map(|c| decode_child(u64::from_le_bytes(c.try_into().unwrap())))
        .collect();
    BranchNode { bitmap, children }
}

fn read_linear(db: &Database, addr: Address) -> LinearNode {
    let count = read_word(db, addr);
    let words: StoreBytes<'_> = db.getro(addr + 8, count * 8);
    let leaves = words
        .chunks_exact(8)
        .map(|c| Address::new(u64::from_le_bytes(c.try_into().unwrap())))
        .collect();
    LinearNode { leaves }
}

/// The child of the stored branch at `addr` in slot `index`, without
/// materializing the node.
fn store_branch_child(db: &Database, addr: Address, index: usize) -> Option<Child> {
    let bitmap = read_word(db, addr);
    let bit = 1u64 << index;
    if bitmap & bit == 0 {
        return None;
    }
    let pos = (bitmap & (bit - 1)).count_ones() as u64;
    Some(decode_child(read_word(db, addr + 8 + pos * 8)))
}

/// One trie.  The typed maps and sets in [`crate::index`] wrap this.
pub struct Hamt {
    root: Option<Child>,
}

impl Hamt {
    pub fn empty() -> Hamt {
        Hamt { root: None }
    }

    /// Rebuild from a root word recorded in a footer; null means empty.
    pub fn from_root(root: Address) -> Hamt {
        if root.is_null() {
            Hamt::empty()
        } else {
            Hamt {
                root: Some(decode_child(root.as_u64())),
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    /// Walk the trie for `probe` without materializing any node onto the
    /// heap.  Returns the address of the matching leaf record.
    pub fn find<P: HamtProbe>(&self, db: &Database, probe: &P) -> Result<Option<Address>> {
        let Some(root) = &self.root else {
            return Ok(None);
        };
        let hash = probe.probe_hash(db)?;
        let mut depth = 0;
        // Store-side children are decoded a slot at a time; heap-side
        // children are borrowed in place.
        let mut owned;
        let mut node = root;
        loop {
            match node {
                Child::Leaf(leaf) => {
                    return Ok(if probe.matches(db, *leaf)? {
                        Some(*leaf)
                    } else {
                        None
                    });
                }
                Child::Linear(addr) => {
                    let chain = read_linear(db, *addr);
                    return Self::scan_chain(db, &chain.leaves, probe);
                }
                Child::HeapLinear(chain) => {
                    return Self::scan_chain(db, &chain.leaves, probe);
                }
                Child::Branch(addr) => {
                    match store_branch_child(db, *addr, slice_hash(hash, depth)) {
                        None => return Ok(None),
                        Some(child) => {
                            owned = child;
                            node = &owned;
                        }
                    }
                }
                Child::HeapBranch(branch) => {
                    let index = slice_hash(hash, depth);
                    let bit = 1u64 << index;
                    if branch.bitmap & bit == 0 {
                        return Ok(None);
                    }
                    let pos = (branch.bitmap & (bit - 1)).count_ones() as usize;
                    node = &branch.children[pos];
                }
            }
            depth += 1;
        }
    }

    fn scan_chain<P: HamtProbe>(
        db: &Database,
        leaves: &[Address],
        probe: &P,
    ) -> Result<Option<Address>> {
        for &leaf in leaves {
            if probe.matches(db, leaf)? {
                return Ok(Some(leaf));
            }
        }
        Ok(None)
    }

    /// Insert `entry`, path-copying from the root.  Returns the leaf record
    /// address and whether a new leaf was created; inserting an equal key a
    /// second time returns the existing leaf and false without allocating.
    pub fn insert<E: HamtEntry>(
        &mut self,
        txn: &mut Transaction<'_>,
        entry: &E,
    ) -> Result<(Address, bool)> {
        let hash = entry.probe_hash(txn.db())?;
        match self.root.take() {
            None => {
                let leaf = entry.write_leaf(txn)?;
                debug_assert!(leaf.is_aligned_to(4));
                self.root = Some(Child::Leaf(leaf));
                Ok((leaf, true))
            }
            Some(mut root) => {
                let result = Self::insert_child(&mut root, txn, entry, hash, 0);
                self.root = Some(root);
                result
            }
        }
    }

    fn insert_child<E: HamtEntry>(
        child: &mut Child,
        txn: &mut Transaction<'_>,
        entry: &E,
        hash: u64,
        depth: usize,
    ) -> Result<(Address, bool)> {
        loop {
            match child {
                // Committed nodes on the walked path materialize onto the
                // heap; everything off the path stays shared.
                Child::Branch(addr) => {
                    let node = read_branch(txn.db(), *addr);
                    *child = Child::HeapBranch(Box::new(node));
                }
                Child::Linear(addr) => {
                    let node = read_linear(txn.db(), *addr);
                    *child = Child::HeapLinear(Box::new(node));
                }
                Child::Leaf(existing) => {
                    let existing = *existing;
                    if entry.matches(txn.db(), existing)? {
                        if entry.replaces(txn.db(), existing)? {
                            let leaf = entry.write_leaf(txn)?;
                            *child = Child::Leaf(leaf);
                            return Ok((leaf, false));
                        }
                        return Ok((existing, false));
                    }
                    let existing_hash = entry.stored_hash(txn.db(), existing)?;
                    let leaf = entry.write_leaf(txn)?;
                    debug_assert!(leaf.is_aligned_to(4));
                    *child = Self::split_leaf(existing, existing_hash, leaf, hash, depth);
                    return Ok((leaf, true));
                }
                Child::HeapBranch(node) => {
                    let index = slice_hash(hash, depth);
                    let bit = 1u64 << index;
                    let pos = (node.bitmap & (bit - 1)).count_ones() as usize;
                    if node.bitmap & bit == 0 {
                        let leaf = entry.write_leaf(txn)?;
                        debug_assert!(leaf.is_aligned_to(4));
                        node.children.insert(pos, Child::Leaf(leaf));
                        node.bitmap |= bit;
                        return Ok((leaf, true));
                    }
                    return Self::insert_child(&mut node.children[pos], txn, entry, hash, depth + 1);
                }
                Child::HeapLinear(node) => {
                    for (i, &leaf) in node.leaves.iter().enumerate() {
                        if entry.matches(txn.db(), leaf)? {
                            if entry.replaces(txn.db(), leaf)? {
                                let new_leaf = entry.write_leaf(txn)?;
                                node.leaves[i] = new_leaf;
                                return Ok((new_leaf, false));
                            }
                            return Ok((leaf, false));
                        }
                    }
                    let leaf = entry.write_leaf(txn)?;
                    node.leaves.push(leaf);
                    return Ok((leaf, true));
                }
            }
        }
    }

    /// Build the structure discriminating two leaves whose keys differ:
    /// single-slot branches down to the level where their hash slices
    /// diverge, or a collision chain when every hash bit agrees.
    fn split_leaf(
        existing: Address,
        existing_hash: u64,
        new_leaf: Address,
        new_hash: u64,
        depth: usize,
    ) -> Child {
        if existing_hash == new_hash {
            return Child::HeapLinear(Box::new(LinearNode {
                leaves: vec![existing, new_leaf],
            }));
        }
        debug_assert!(depth < MAX_DEPTH);
        let existing_index = slice_hash(existing_hash, depth);
        let new_index = slice_hash(new_hash, depth);
        if existing_index == new_index {
            let inner = Self::split_leaf(existing, existing_hash, new_leaf, new_hash, depth + 1);
            return Child::HeapBranch(Box::new(BranchNode {
                bitmap: 1u64 << existing_index,
                children: vec![inner],
            }));
        }
        let (first, second) = if existing_index < new_index {
            (existing, new_leaf)
        } else {
            (new_leaf, existing)
        };
        Child::HeapBranch(Box::new(BranchNode {
            bitmap: (1u64 << existing_index) | (1u64 << new_index),
            children: vec![Child::Leaf(first), Child::Leaf(second)],
        }))
    }

    /// Serialize every in-heap node, replacing it with its store address,
    /// and return the tagged root word to be recorded in the footer.  A
    /// trie that was never modified returns its existing root without
    /// allocating.  Returns null for an empty trie.
    pub fn flush(&mut self, txn: &mut Transaction<'_>) -> Result<Address> {
        match self.root.take() {
            None => Ok(Address::NULL),
            Some(root) => {
                let word = Self::flush_child(root, txn)?;
                self.root = Some(decode_child(word));
                Ok(Address::new(word))
            }
        }
    }

    fn flush_child(child: Child, txn: &mut Transaction<'_>) -> Result<u64> {
        let branch = match child {
            Child::HeapBranch(node) => node,
            other => return Self::flush_simple(other, txn),
        };

        // Post-order over the heap branches with an explicit stack: a frame
        // holds the children still to visit and the serialized words of
        // those already done.  Depth is bounded by the hash width.
        struct Frame {
            bitmap: u64,
            pending: std::vec::IntoIter<Child>,
            words: Vec<u64>,
        }
        let frame = |node: Box<BranchNode>| Frame {
            bitmap: node.bitmap,
            pending: node.children.into_iter(),
            words: Vec::new(),
        };

        let mut stack = vec![frame(branch)];
        loop {
            let top = stack.last_mut().unwrap();
            match top.pending.next() {
                Some(Child::HeapBranch(node)) => stack.push(frame(node)),
                Some(other) => {
                    let word = Self::flush_simple(other, txn)?;
                    stack.last_mut().unwrap().words.push(word);
                }
                None => {
                    let done = stack.pop().unwrap();
                    let word = Self::write_branch(txn, done.bitmap, &done.words)?;
                    match stack.last_mut() {
                        Some(parent) => parent.words.push(word),
                        None => return Ok(word),
                    }
                }
            }
        }
    }

    fn flush_simple(child: Child, txn: &mut Transaction<'_>) -> Result<u64> {
        match child {
            Child::Leaf(addr) => Ok(addr.as_u64()),
            Child::Branch(addr) => Ok(addr.as_u64() | BRANCH_TAG),
            Child::Linear(addr) => Ok(addr.as_u64() | LINEAR_TAG),
            Child::HeapLinear(node) => {
                let mut bytes = Vec::with_capacity((1 + node.leaves.len()) * 8);
                bytes.extend_from_slice(&(node.leaves.len() as u64).to_le_bytes());
                for leaf in &node.leaves {
                    bytes.extend_from_slice(&leaf.as_u64().to_le_bytes());
                }
                let addr = txn.alloc_and_write(&bytes, STORE_ALIGN)?;
                Ok(addr.as_u64() | LINEAR_TAG)
            }
            Child::HeapBranch(_) => unreachable!("heap branches are flushed by the stack walk"),
        }
    }

    fn write_branch(txn: &mut Transaction<'_>, bitmap: u64, words: &[u64]) -> Result<u64> {
        debug_assert_eq!(bitmap.count_ones() as usize, words.len());
        let mut bytes = Vec::with_capacity((1 + words.len()) * 8);
        bytes.extend_from_slice(&bitmap.to_le_bytes());
        for word in words {
            bytes.extend_from_slice(&word.to_le_bytes());
        }
        let addr = txn.alloc_and_write(&bytes, STORE_ALIGN)?;
        Ok(addr.as_u64() | BRANCH_TAG)
    }
}

/// Visit every leaf record reachable from the committed root word `root`.
pub fn for_each_leaf<F: FnMut(Address)>(db: &Database, root: Address, mut f: F) -> Result<()> {
    walk_committed(db, root, Address::NULL, &mut f)
}

/// The leaves reachable from `root` that were written at or after
/// `threshold`.  Because the store is append-only, a subtree whose node
/// address precedes the threshold already existed in the older generation
/// and is pruned without being entered: structural sharing makes the
/// equality check constant time.
pub fn diff(db: &Database, root: Address, threshold: Address) -> Result<Vec<Address>> {
    let mut out = Vec::new();
    walk_committed(db, root, threshold, &mut |leaf| out.push(leaf))?;
    Ok(out)
}

fn walk_committed<F: FnMut(Address)>(
    db: &Database,
    root: Address,
    threshold: Address,
    f: &mut F,
) -> Result<()> {
    if root.is_null() {
        return Ok(());
    }
    let mut stack = vec![decode_child(root.as_u64())];
    while let Some(child) = stack.pop() {
        match child {
            Child::Leaf(addr) => {
                if addr >= threshold {
                    f(addr);
                }
            }
            Child::Branch(addr) => {
                if addr >= threshold {
                    let node = read_branch(db, addr);
                    stack.extend(node.children);
                }
            }
            Child::Linear(addr) => {
                if addr >= threshold {
                    let node = read_linear(db, addr);
                    for leaf in node.leaves {
                        if leaf >= threshold {
                            f(leaf);
                        }
                    }
                }
            }
            Child::HeapBranch(_) | Child::HeapLinear(_) => {
                unreachable!("committed roots never reference heap nodes")
            }
        }
    }
    Ok(())
}
