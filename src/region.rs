//! Memory-mapped views of the store file.  A region is a contiguous mapping
//! of one or more segments; the segment address table slices each region
//! into segment-sized entries.  Regions are only ever appended: growing the
//! file produces new regions, and a region that has been handed out is never
//! remapped, so pointers into it stay valid until the database closes.

use std::ptr::NonNull;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::file::File;
use crate::util::constants::*;
use crate::util::conversions;

enum Backing {
    /// A real `mmap(MAP_SHARED)` view; unmapped on drop.
    #[cfg(unix)]
    Mmap,
    /// A slice of a [`crate::file::MemoryFile`] buffer.  The handle keeps
    /// the buffer alive for as long as any region points into it.
    Heap(#[allow(dead_code)] Arc<crate::file::MemoryFile>),
}

/// One contiguous mapping of the file.
pub struct Region {
    base: NonNull<u8>,
    size: u64,
    file_offset: u64,
    read_only: bool,
    backing: Backing,
}

// The raw base pointer refers to mapped or heap memory whose lifetime is
// managed by this struct; accesses are coordinated by the storage layer.
unsafe impl Send for Region {}
unsafe impl Sync for Region {}

impl Region {
    pub fn base(&self) -> NonNull<u8> {
        self.base
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// The file offset at which this region begins.
    pub fn file_offset(&self) -> u64 {
        self.file_offset
    }

    /// The file offset one past the end of this region.
    pub fn file_end(&self) -> u64 {
        self.file_offset + self.size
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Transition the sub-range `[first, last)` (offsets within this region)
    /// to read-only.  The range is widened inwards to whole pages: bytes
    /// sharing a page with a writable neighbour stay writable.
    pub fn protect(&self, first: u64, last: u64) -> Result<()> {
        debug_assert!(first <= last && last <= self.size);
        let start = conversions::raw_align_up(first, BYTES_IN_PAGE as u64);
        let end = conversions::raw_align_down(last, BYTES_IN_PAGE as u64);
        if start >= end {
            return Ok(());
        }
        match &self.backing {
            #[cfg(unix)]
            Backing::Mmap => {
                let rc = unsafe {
                    libc::mprotect(
                        self.base.as_ptr().add(start as usize).cast(),
                        (end - start) as usize,
                        libc::PROT_READ,
                    )
                };
                if rc != 0 {
                    return Err(std::io::Error::last_os_error().into());
                }
                Ok(())
            }
            Backing::Heap(_) => Ok(()),
        }
    }

    /// Flush modified pages of this region back to the file.
    pub fn sync(&self) -> Result<()> {
        match &self.backing {
            #[cfg(unix)]
            Backing::Mmap => {
                let rc = unsafe {
                    libc::msync(self.base.as_ptr().cast(), self.size as usize, libc::MS_SYNC)
                };
                if rc != 0 {
                    return Err(std::io::Error::last_os_error().into());
                }
                Ok(())
            }
            Backing::Heap(_) => Ok(()),
        }
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        match &self.backing {
            #[cfg(unix)]
            Backing::Mmap => unsafe {
                libc::munmap(self.base.as_ptr().cast(), self.size as usize);
            },
            Backing::Heap(_) => {}
        }
    }
}

impl std::fmt::Debug for Region {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Region")
            .field("file_offset", &self.file_offset)
            .field("size", &self.size)
            .field("read_only", &self.read_only)
            .finish()
    }
}

/// Produces the memory-mapped views of the file.  `init` covers the current
/// file length; `add` extends coverage (growing the file where necessary)
/// and returns only the regions appended by the call.
pub trait RegionFactory: Send {
    fn init(&mut self) -> Result<Vec<Arc<Region>>>;
    fn add(&mut self, new_size: u64) -> Result<Vec<Arc<Region>>>;
    fn full_region_bytes(&self) -> u64;
    fn min_region_bytes(&self) -> u64;
}

fn check_region_params(full: u64, min: u64) {
    assert!(
        conversions::is_power_of_two(full) && conversions::is_power_of_two(min),
        "region sizes must be powers of two"
    );
    assert!(min >= SEGMENT_BYTES, "min region smaller than a segment");
    assert!(
        conversions::raw_is_aligned(full, min),
        "full region not a multiple of min region"
    );
    assert!(full <= ADDRESS_SPACE_BYTES);
}

/// The coverage target for `new_size` bytes of store: the tail is rounded up
/// to the minimum region size so that the final region is never smaller.
fn coverage_target(new_size: u64, min: u64) -> Result<u64> {
    if new_size > ADDRESS_SPACE_BYTES {
        return Err(Error::StoreFull);
    }
    Ok(conversions::raw_align_up(new_size, min))
}

/// Split `[mapped_end, target)` into region extents of at most `full` bytes.
fn carve(mapped_end: u64, target: u64, full: u64) -> Vec<(u64, u64)> {
    let mut extents = Vec::new();
    let mut pos = mapped_end;
    while pos < target {
        let len = std::cmp::min(full, target - pos);
        extents.push((pos, len));
        pos += len;
    }
    extents
}

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        pub use self::mmap::MmapRegionFactory;
    }
}

#[cfg(unix)]
mod mmap {
    use super::*;
    use crate::file::PosixFile;

    /// Region factory backed by `mmap` over a [`PosixFile`].
    pub struct MmapRegionFactory {
        file: Arc<PosixFile>,
        writable: bool,
        full: u64,
        min: u64,
        mapped_end: u64,
    }

    impl MmapRegionFactory {
        pub fn new(file: Arc<PosixFile>, writable: bool, full: u64, min: u64) -> MmapRegionFactory {
            check_region_params(full, min);
            MmapRegionFactory {
                file,
                writable,
                full,
                min,
                mapped_end: 0,
            }
        }

        pub fn with_default_sizes(file: Arc<PosixFile>, writable: bool) -> MmapRegionFactory {
            Self::new(file, writable, FULL_REGION_BYTES, MIN_REGION_BYTES)
        }

        fn map_one(&self, offset: u64, len: u64) -> Result<Arc<Region>> {
            let prot = if self.writable {
                libc::PROT_READ | libc::PROT_WRITE
            } else {
                libc::PROT_READ
            };
            let ptr = unsafe {
                libc::mmap(
                    std::ptr::null_mut(),
                    len as usize,
                    prot,
                    libc::MAP_SHARED,
                    self.file.raw_fd(),
                    offset as libc::off_t,
                )
            };
            if ptr == libc::MAP_FAILED {
                return Err(std::io::Error::last_os_error().into());
            }
            trace!("mapped region at file offset {offset}, {len} bytes");
            Ok(Arc::new(Region {
                base: NonNull::new(ptr.cast()).unwrap(),
                size: len,
                file_offset: offset,
                read_only: !self.writable,
                backing: Backing::Mmap,
            }))
        }
    }

    impl RegionFactory for MmapRegionFactory {
        fn init(&mut self) -> Result<Vec<Arc<Region>>> {
            let len = self.file.length()?;
            self.add(len)
        }

        fn add(&mut self, new_size: u64) -> Result<Vec<Arc<Region>>> {
            let target = coverage_target(new_size, self.min)?;
            if target <= self.mapped_end {
                return Ok(Vec::new());
            }
            if self.writable && self.file.length()? < target {
                // The file is grown before it is mapped: touching a page
                // beyond the end of the backing file is fatal.
                self.file.truncate(target)?;
            }
            let mut regions = Vec::new();
            for (offset, len) in carve(self.mapped_end, target, self.full) {
                regions.push(self.map_one(offset, len)?);
            }
            self.mapped_end = target;
            Ok(regions)
        }

        fn full_region_bytes(&self) -> u64 {
            self.full
        }

        fn min_region_bytes(&self) -> u64 {
            self.min
        }
    }
}

/// Region factory that slices the stable buffer of a [`crate::file::MemoryFile`].
pub struct HeapRegionFactory {
    file: Arc<crate::file::MemoryFile>,
    full: u64,
    min: u64,
    mapped_end: u64,
}

impl HeapRegionFactory {
    pub fn new(file: Arc<crate::file::MemoryFile>, full: u64, min: u64) -> HeapRegionFactory {
        check_region_params(full, min);
        HeapRegionFactory {
            file,
            full,
            min,
            mapped_end: 0,
        }
    }
}

impl RegionFactory for HeapRegionFactory {
    fn init(&mut self) -> Result<Vec<Arc<Region>>> {
        let len = self.file.length()?;
        self.add(len)
    }

    fn add(&mut self, new_size: u64) -> Result<Vec<Arc<Region>>> {
        let target = coverage_target(new_size, self.min)?;
        if target <= self.mapped_end {
            return Ok(Vec::new());
        }
        if target > self.file.capacity() {
            return Err(Error::StoreFull);
        }
        if self.file.length()? < target {
            self.file.truncate(target)?;
        }
        let mut regions = Vec::new();
        for (offset, len) in carve(self.mapped_end, target, self.full) {
            let base = unsafe { self.file.base_ptr().add(offset as usize) };
            regions.push(Arc::new(Region {
                base: NonNull::new(base).unwrap(),
                size: len,
                file_offset: offset,
                read_only: false,
                backing: Backing::Heap(self.file.clone()),
            }));
        }
        self.mapped_end = target;
        Ok(regions)
    }

    fn full_region_bytes(&self) -> u64 {
        self.full
    }

    fn min_region_bytes(&self) -> u64 {
        self.min
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::MemoryFile;

    #[test]
    fn carve_splits_at_full_region_size() {
        let full = 2 * SEGMENT_BYTES;
        let extents = carve(0, 5 * SEGMENT_BYTES, full);
        assert_eq!(
            extents,
            vec![
                (0, full),
                (full, full),
                (2 * full, SEGMENT_BYTES),
            ]
        );
    }

    #[test]
    fn tail_rounds_up_to_min_region() {
        assert_eq!(
            coverage_target(SEGMENT_BYTES + 1, SEGMENT_BYTES).unwrap(),
            2 * SEGMENT_BYTES
        );
        assert_eq!(coverage_target(0, SEGMENT_BYTES).unwrap(), 0);
        assert!(matches!(
            coverage_target(ADDRESS_SPACE_BYTES + 1, SEGMENT_BYTES),
            Err(Error::StoreFull)
        ));
    }

    #[test]
    fn heap_factory_appends_only() {
        let file = Arc::new(MemoryFile::new(8 * SEGMENT_BYTES as usize));
        let mut factory = HeapRegionFactory::new(file, 2 * SEGMENT_BYTES, SEGMENT_BYTES);
        assert!(factory.init().unwrap().is_empty());

        let first = factory.add(SEGMENT_BYTES).unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].size(), SEGMENT_BYTES);

        // Growing returns only the regions appended by this call, with sizes
        // that are multiples of the minimum and capped at the full size.
        let more = factory.add(5 * SEGMENT_BYTES).unwrap();
        assert_eq!(more.len(), 2);
        assert_eq!(more[0].file_offset(), SEGMENT_BYTES);
        assert_eq!(more[0].size(), 2 * SEGMENT_BYTES);
        assert_eq!(more[1].size(), 2 * SEGMENT_BYTES);

        // Already covered: nothing new.
        assert!(factory.add(3 * SEGMENT_BYTES).unwrap().is_empty());
    }

    #[test]
    fn heap_factory_store_full() {
        let file = Arc::new(MemoryFile::new(2 * SEGMENT_BYTES as usize));
        let mut factory = HeapRegionFactory::new(file, SEGMENT_BYTES, SEGMENT_BYTES);
        assert!(factory.add(2 * SEGMENT_BYTES).is_ok());
        assert!(matches!(
            factory.add(3 * SEGMENT_BYTES),
            Err(Error::StoreFull)
        ));
    }
}
