/// log2 of the number of bytes in a segment
pub const LOG_SEGMENT_BYTES: usize = 22;
/// The number of bytes in a segment: the slab of address space described by
/// one segment address table entry.
pub const SEGMENT_BYTES: u64 = 1 << LOG_SEGMENT_BYTES;
/// Mask for the offset portion of an address.
pub const OFFSET_MASK: u64 = SEGMENT_BYTES - 1;

/// The number of bits in a segment number.
pub const SEGMENT_NUMBER_BITS: usize = 16;
/// The number of entries in the segment address table.
pub const SAT_ELEMENTS: usize = 1 << SEGMENT_NUMBER_BITS;

/// log2 of the total addressable store size.
pub const LOG_ADDRESS_SPACE: usize = LOG_SEGMENT_BYTES + SEGMENT_NUMBER_BITS;
/// One past the largest representable store address (256 GiB).
pub const ADDRESS_SPACE_BYTES: u64 = 1 << LOG_ADDRESS_SPACE;

/// log2 of the default size of a single memory-mapped region.
pub const LOG_FULL_REGION_BYTES: usize = 32;
/// The default size of a single memory-mapped region (4 GiB).
pub const FULL_REGION_BYTES: u64 = 1 << LOG_FULL_REGION_BYTES;

/// log2 of the default minimum unit of file growth.
pub const LOG_MIN_REGION_BYTES: usize = 22;
/// The default minimum unit of file growth (4 MiB). The tail region of the
/// file is always rounded up to a multiple of this value.
pub const MIN_REGION_BYTES: u64 = 1 << LOG_MIN_REGION_BYTES;

/// log2 of the number of bytes in a page, as assumed for protection requests.
pub const LOG_BYTES_IN_PAGE: usize = 12;
/// The number of bytes in a page.
pub const BYTES_IN_PAGE: usize = 1 << LOG_BYTES_IN_PAGE;
