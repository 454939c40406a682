//! The segment address table (SAT) and the address-to-pointer translation
//! built on it.  The SAT is a process-local array with one entry per
//! possible segment; an entry holds a pointer to the segment's base inside a
//! mapped region together with a handle on the owning region.  Entries are
//! published exactly once, in segment order, as the file grows, and are
//! never mutated afterwards, so the read path takes no locks.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::Result;
use crate::file::File;
use crate::region::{Region, RegionFactory};
use crate::util::constants::*;
use crate::util::conversions;
use crate::util::once_ptr::OncePtr;
use crate::util::{Address, Segment};

/// An entry in the segment address table.
pub(crate) struct SatEntry {
    /// The base of this segment's data.  Always lies within the memory
    /// mapped by `region`.
    value: NonNull<u8>,
    /// The mapped region to which `value` points.
    region: Arc<Region>,
}

unsafe impl Send for SatEntry {}
unsafe impl Sync for SatEntry {}

impl SatEntry {
    pub(crate) fn region(&self) -> &Arc<Region> {
        &self.region
    }

    #[cfg(debug_assertions)]
    fn is_valid(&self) -> bool {
        let ptr = self.value.as_ptr() as usize;
        let base = self.region.base().as_ptr() as usize;
        ptr >= base && ptr + SEGMENT_BYTES as usize <= base + self.region.size() as usize
    }
}

pub struct Storage {
    /// The segment address table.
    sat: Box<[OncePtr<SatEntry>]>,
    file: Arc<dyn File>,
    factory: Mutex<Box<dyn RegionFactory>>,
    regions: Mutex<Vec<Arc<Region>>>,
    /// One past the highest byte covered by the SAT.
    mapped_end: AtomicU64,
}

impl Storage {
    pub fn new(file: Arc<dyn File>, mut factory: Box<dyn RegionFactory>) -> Result<Storage> {
        let initial = factory.init()?;
        let storage = Storage {
            sat: (0..SAT_ELEMENTS).map(|_| OncePtr::new()).collect(),
            file,
            factory: Mutex::new(factory),
            regions: Mutex::new(Vec::new()),
            mapped_end: AtomicU64::new(0),
        };
        storage.install_regions(initial);
        Ok(storage)
    }

    pub(crate) fn file(&self) -> &Arc<dyn File> {
        &self.file
    }

    /// One past the highest mapped byte.
    pub fn mapped_size(&self) -> u64 {
        self.mapped_end.load(Ordering::Acquire)
    }

    /// Ensure the file and the SAT cover `[0, new_size)`.  After success
    /// every segment in that range has a live SAT entry.
    pub fn map_bytes(&self, new_size: u64) -> Result<()> {
        if new_size <= self.mapped_size() {
            return Ok(());
        }
        let mut factory = self.factory.lock().unwrap();
        // Re-check under the lock: a concurrent grow may have covered us.
        if new_size <= self.mapped_size() {
            return Ok(());
        }
        debug!("growing store coverage to {new_size} bytes");
        let appended = factory.add(new_size)?;
        self.install_regions(appended);
        Ok(())
    }

    fn install_regions(&self, regions: Vec<Arc<Region>>) {
        for region in regions {
            self.slice_region_into_segments(&region);
            let end = region.file_end();
            self.regions.lock().unwrap().push(region);
            self.mapped_end.store(end, Ordering::Release);
        }
    }

    /// Walk `region` in segment-sized strides, publishing an entry for each
    /// covered segment until the region or the table is exhausted.
    fn slice_region_into_segments(&self, region: &Arc<Region>) {
        debug_assert!(conversions::raw_is_aligned(region.file_offset(), SEGMENT_BYTES));
        debug_assert!(conversions::raw_is_aligned(region.size(), SEGMENT_BYTES));
        let first = (region.file_offset() >> LOG_SEGMENT_BYTES) as usize;
        let count = (region.size() >> LOG_SEGMENT_BYTES) as usize;
        for k in 0..count {
            let segment = first + k;
            if segment >= SAT_ELEMENTS {
                break;
            }
            let value = unsafe {
                NonNull::new_unchecked(region.base().as_ptr().add(k << LOG_SEGMENT_BYTES))
            };
            let entry = SatEntry {
                value,
                region: region.clone(),
            };
            debug_assert!(entry.is_valid());
            self.sat[segment].init(entry);
        }
    }

    pub(crate) fn segment_entry(&self, segment: Segment) -> Option<&SatEntry> {
        self.sat[segment].get(Ordering::Acquire)
    }

    /// The base pointer of a segment.  The segment must lie within the
    /// mapped portion of the file.
    pub fn segment_base(&self, segment: Segment) -> NonNull<u8> {
        match self.segment_entry(segment) {
            Some(entry) => entry.value,
            None => panic!("segment {segment} is not mapped"),
        }
    }

    /// Translate a store address to a pointer into mapped memory.  The
    /// pointer remains valid for as long as the storage lives: regions are
    /// never unmapped before the database closes.
    pub fn address_to_pointer(&self, addr: Address) -> NonNull<u8> {
        debug_assert!(!addr.is_null());
        let base = self.segment_base(addr.segment());
        unsafe { NonNull::new_unchecked(base.as_ptr().add(addr.offset() as usize)) }
    }

    /// True if `[addr, addr + size)` is not contained in a single region.
    /// With the `always_spanning` feature every request reports true, which
    /// forces all accesses through the piecewise copy paths.
    pub fn request_spans_regions(&self, addr: Address, size: u64) -> bool {
        if cfg!(feature = "always_spanning") {
            return true;
        }
        if size == 0 {
            return false;
        }
        match self.segment_entry(addr.segment()) {
            Some(entry) => addr.as_u64() + size > entry.region.file_end(),
            None => panic!("address {addr} is not mapped"),
        }
    }

    /// Apply `copier` piecewise over `[addr, addr + size)`, in ascending
    /// segment order, calling it exactly once per covered region slice.  The
    /// copier receives (in-store pointer, buffer pointer, length); the same
    /// walk serves both directions of copy, so the buffer pointer is always
    /// mutable.
    pub(crate) fn copy<F>(&self, addr: Address, size: u64, buf: NonNull<u8>, mut copier: F)
    where
        F: FnMut(NonNull<u8>, NonNull<u8>, u64),
    {
        debug_assert!(addr.as_u64() + size <= self.mapped_size());
        let mut pos = addr;
        let mut done: u64 = 0;
        while done < size {
            let entry = self
                .segment_entry(pos.segment())
                .unwrap_or_else(|| panic!("segment {} is not mapped", pos.segment()));
            let in_region = entry.region.file_end() - pos.as_u64();
            let n = std::cmp::min(size - done, in_region);
            let in_store = self.address_to_pointer(pos);
            let out = unsafe { NonNull::new_unchecked(buf.as_ptr().add(done as usize)) };
            copier(in_store, out, n);
            pos = Address::new(pos.as_u64() + n);
            done += n;
        }
    }

    /// Copy `dst.len()` bytes out of the store, piecewise across region
    /// boundaries.
    pub fn copy_from_store(&self, addr: Address, dst: &mut [u8]) {
        let buf = NonNull::new(dst.as_mut_ptr()).unwrap();
        self.copy(addr, dst.len() as u64, buf, |in_store, out, len| unsafe {
            std::ptr::copy_nonoverlapping(in_store.as_ptr(), out.as_ptr(), len as usize);
        });
    }

    /// Copy `src` into the store, piecewise across region boundaries.
    pub fn copy_to_store(&self, addr: Address, src: &[u8]) {
        // The walk only reads through the buffer pointer in this direction.
        let buf = NonNull::new(src.as_ptr() as *mut u8).unwrap();
        self.copy(addr, src.len() as u64, buf, |in_store, out, len| unsafe {
            std::ptr::copy_nonoverlapping(out.as_ptr(), in_store.as_ptr(), len as usize);
        });
    }

    /// Read `size` bytes at `addr`, borrowing mapped memory when the range
    /// lies within one region and falling back to an owned copy when it
    /// spans.
    pub fn getro(&self, addr: Address, size: u64) -> StoreBytes<'_> {
        assert!(
            addr.as_u64() + size <= self.mapped_size(),
            "read of {size} bytes at {addr} is beyond the mapped file"
        );
        if size == 0 {
            return StoreBytes::Mapped(&[]);
        }
        if self.request_spans_regions(addr, size) {
            let mut buf = vec![0u8; size as usize].into_boxed_slice();
            self.copy_from_store(addr, &mut buf);
            StoreBytes::Owned(buf)
        } else {
            let ptr = self.address_to_pointer(addr);
            StoreBytes::Mapped(unsafe {
                std::slice::from_raw_parts(ptr.as_ptr(), size as usize)
            })
        }
    }

    /// Typed read at `addr`.  Falls back to an owned copy when the range
    /// spans regions or the mapped bytes are not sufficiently aligned.
    pub fn at<T: bytemuck::AnyBitPattern>(&self, addr: Address) -> StoreRef<'_, T> {
        let size = std::mem::size_of::<T>() as u64;
        assert!(
            addr.as_u64() + size <= self.mapped_size(),
            "read of {size} bytes at {addr} is beyond the mapped file"
        );
        if !self.request_spans_regions(addr, size) {
            let ptr = self.address_to_pointer(addr);
            if ptr.as_ptr() as usize % std::mem::align_of::<T>() == 0 {
                return StoreRef::Mapped(unsafe { &*ptr.as_ptr().cast::<T>() });
            }
        }
        let mut buf = vec![0u8; size as usize];
        self.copy_from_store(addr, &mut buf);
        StoreRef::Owned(Box::new(bytemuck::pod_read_unaligned(&buf)))
    }

    /// Mark the address range `[first, last)` read-only, region by region.
    pub fn protect(&self, first: Address, last: Address) -> Result<()> {
        debug_assert!(first <= last);
        let mut pos = first.as_u64();
        let end = std::cmp::min(last.as_u64(), self.mapped_size());
        while pos < end {
            let entry = self.segment_base_entry(pos);
            let region = entry.region();
            let slice_end = std::cmp::min(end, region.file_end());
            region.protect(pos - region.file_offset(), slice_end - region.file_offset())?;
            pos = slice_end;
        }
        Ok(())
    }

    fn segment_base_entry(&self, pos: u64) -> &SatEntry {
        let segment = (pos >> LOG_SEGMENT_BYTES) as usize;
        self.segment_entry(segment)
            .unwrap_or_else(|| panic!("segment {segment} is not mapped"))
    }

    /// Flush mapped writes and the backing file.
    pub fn sync(&self) -> Result<()> {
        let regions = self.regions.lock().unwrap();
        for region in regions.iter() {
            region.sync()?;
        }
        drop(regions);
        self.file.sync()
    }
}

/// A byte range read out of the store: either a borrow of mapped memory or
/// an owned copy of a spanning range.
pub enum StoreBytes<'s> {
    Mapped(&'s [u8]),
    Owned(Box<[u8]>),
}

impl std::ops::Deref for StoreBytes<'_> {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        match self {
            StoreBytes::Mapped(s) => s,
            StoreBytes::Owned(b) => b,
        }
    }
}

/// A typed value read out of the store: a borrow of mapped memory where
/// possible, an owned copy otherwise.
pub enum StoreRef<'s, T> {
    Mapped(&'s T),
    Owned(Box<T>),
}

impl<T> std::ops::Deref for StoreRef<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        match self {
            StoreRef::Mapped(r) => r,
            StoreRef::Owned(b) => b,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::MemoryFile;
    use crate::region::HeapRegionFactory;

    /// A storage whose regions are a single segment each, so that modest
    /// allocations can straddle region boundaries.
    fn segment_per_region_storage(segments: usize) -> Storage {
        let file = Arc::new(MemoryFile::new(segments * SEGMENT_BYTES as usize));
        let factory = HeapRegionFactory::new(file.clone(), SEGMENT_BYTES, SEGMENT_BYTES);
        Storage::new(file, Box::new(factory)).unwrap()
    }

    #[test]
    fn map_bytes_fills_the_table() {
        let storage = segment_per_region_storage(3);
        storage.map_bytes(2 * SEGMENT_BYTES + 1).unwrap();
        assert_eq!(storage.mapped_size(), 3 * SEGMENT_BYTES);
        for segment in 0..3 {
            assert!(storage.segment_entry(segment).is_some());
        }
        assert!(storage.segment_entry(3).is_none());

        // Translation is stable: the same address resolves to the same
        // pointer for the lifetime of the storage.
        let addr = Address::new(SEGMENT_BYTES + 100);
        assert_eq!(
            storage.address_to_pointer(addr),
            storage.address_to_pointer(addr)
        );
    }

    #[test]
    fn protect_partitions_by_region() {
        let storage = segment_per_region_storage(3);
        storage.map_bytes(3 * SEGMENT_BYTES).unwrap();
        // Heap regions accept protection requests as no-ops; the walk
        // itself must still partition the range without faulting.
        storage
            .protect(Address::new(100), Address::new(3 * SEGMENT_BYTES))
            .unwrap();
    }

    #[test]
    #[should_panic]
    fn unmapped_segment_base_panics() {
        let storage = segment_per_region_storage(1);
        storage.map_bytes(SEGMENT_BYTES).unwrap();
        let _ = storage.segment_base(7);
    }

    #[test]
    fn spanning_detection() {
        let storage = segment_per_region_storage(2);
        storage.map_bytes(2 * SEGMENT_BYTES).unwrap();
        let near_end = Address::new(SEGMENT_BYTES - 8);
        assert!(!storage.request_spans_regions(near_end, 8) || cfg!(feature = "always_spanning"));
        assert!(storage.request_spans_regions(near_end, 9));
    }

    #[test]
    fn copy_across_regions_round_trips() {
        let storage = segment_per_region_storage(2);
        storage.map_bytes(2 * SEGMENT_BYTES).unwrap();

        let addr = Address::new(SEGMENT_BYTES - 8);
        let data: Vec<u8> = (0..20).collect();
        storage.copy_to_store(addr, &data);

        let mut back = vec![0u8; 20];
        storage.copy_from_store(addr, &mut back);
        assert_eq!(back, data);

        // The piecewise result matches what the two segments hold.
        let bytes = storage.getro(addr, 20);
        assert_eq!(&bytes[..], &data[..]);
    }

    #[test]
    fn copier_called_once_per_region_slice() {
        let storage = segment_per_region_storage(4);
        storage.map_bytes(4 * SEGMENT_BYTES).unwrap();

        let addr = Address::new(SEGMENT_BYTES - 4);
        let mut lens = Vec::new();
        let mut sink = vec![0u8; (2 * SEGMENT_BYTES + 8) as usize];
        let buf = NonNull::new(sink.as_mut_ptr()).unwrap();
        storage.copy(addr, sink.len() as u64, buf, |_, _, len| lens.push(len));
        assert_eq!(lens, vec![4, SEGMENT_BYTES, SEGMENT_BYTES, 4]);
    }

    #[test]
    fn typed_reads() {
        let storage = segment_per_region_storage(2);
        storage.map_bytes(2 * SEGMENT_BYTES).unwrap();

        let aligned = Address::new(64);
        storage.copy_to_store(aligned, &0xdead_beef_u64.to_le_bytes());
        assert_eq!(*storage.at::<u64>(aligned), 0xdead_beef);

        // A value straddling the region boundary comes back as an owned copy.
        let spanning = Address::new(SEGMENT_BYTES - 4);
        storage.copy_to_store(spanning, &0x0123_4567_89ab_cdef_u64.to_le_bytes());
        let read = storage.at::<u64>(spanning);
        assert!(matches!(read, StoreRef::Owned(_)));
        assert_eq!(*read, 0x0123_4567_89ab_cdef);
    }
}
