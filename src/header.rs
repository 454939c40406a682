//! The on-disk prologue and the per-generation footer records.  Both are
//! fixed-size, explicitly padded, little-endian `#[repr(C)]` structures: the
//! layout is the wire contract and must never depend on the compiler's field
//! ordering.  Each record carries a CRC over its immutable prefix.

use bytemuck::{Pod, Zeroable};
use static_assertions::const_assert_eq;
use std::mem::offset_of;

use crate::index::INDEX_COUNT;
use crate::util::constants::SEGMENT_BYTES;
use crate::util::Address;

/// The store file signature.
pub const MAGIC: [u8; 8] = *b"pStorev1";
/// The signature that opens every footer record.
pub const FOOTER_SIGNATURE: [u8; 8] = *b"pFooter1";
/// The current file format version.
pub const VERSION: u16 = 1;

/// Alignment of footers and of every record the index layer writes.
pub const STORE_ALIGN: u64 = 8;

/// The fixed header at offset zero.  `footer_head` is the only mutable field
/// in the file: it is rewritten, after a sync, as the final step of every
/// commit, and is therefore excluded from the header CRC.
#[repr(C)]
#[derive(Debug, Copy, Clone, Pod, Zeroable)]
pub struct Header {
    pub magic: [u8; 8],
    pub version: u16,
    pub _pad0: [u8; 2],
    pub uuid: [u8; 16],
    pub crc: u32,
    pub _pad1: [u8; 8],
    pub footer_head: Address,
}

const_assert_eq!(std::mem::size_of::<Header>(), 48);

/// The number of bytes of `Header` covered by its CRC.
const HEADER_CRC_BYTES: usize = offset_of!(Header, crc);

/// The file offset of `Header::footer_head`, the single word rewritten when
/// a commit is published.
pub const FOOTER_HEAD_OFFSET: u64 = offset_of!(Header, footer_head) as u64;

/// The address of the first byte after the (padded) header: the header
/// occupies the whole of segment zero.
pub const FIRST_ALLOC: Address = Address::new(SEGMENT_BYTES);

impl Header {
    pub fn new(uuid: [u8; 16]) -> Header {
        let mut header = Header {
            magic: MAGIC,
            version: VERSION,
            _pad0: [0; 2],
            uuid,
            crc: 0,
            _pad1: [0; 8],
            footer_head: Address::NULL,
        };
        header.crc = header.compute_crc();
        header
    }

    pub fn compute_crc(&self) -> u32 {
        crc32fast::hash(&bytemuck::bytes_of(self)[..HEADER_CRC_BYTES])
    }

    /// True if the signature and CRC hold.  Version acceptance is a separate
    /// check so that an unsupported version can be reported as such.
    pub fn is_valid(&self) -> bool {
        self.magic == MAGIC && self.crc == self.compute_crc()
    }
}

/// The per-generation trailer.  Footers form a singly-linked list backward
/// through `prev`; the head of the list is named by `Header::footer_head`.
#[repr(C)]
#[derive(Debug, Copy, Clone, Pod, Zeroable)]
pub struct Footer {
    pub signature: [u8; 8],
    /// Monotonic commit counter; the initial footer is generation zero.
    pub generation: u64,
    /// The logical file length at the moment this generation committed.
    pub size: u64,
    /// The previous generation's footer, or null for generation zero.
    pub prev: Address,
    /// Root of each index, by kind; null where an index has never been
    /// populated.
    pub index_records: [Address; INDEX_COUNT],
    pub crc: u32,
    pub _pad: [u8; 4],
}

const_assert_eq!(std::mem::size_of::<Footer>(), 72);

/// The number of bytes of `Footer` covered by its CRC.
const FOOTER_CRC_BYTES: usize = offset_of!(Footer, crc);

impl Footer {
    pub const SIZE: u64 = std::mem::size_of::<Footer>() as u64;

    pub fn new(
        generation: u64,
        size: u64,
        prev: Address,
        index_records: [Address; INDEX_COUNT],
    ) -> Footer {
        let mut footer = Footer {
            signature: FOOTER_SIGNATURE,
            generation,
            size,
            prev,
            index_records,
            crc: 0,
            _pad: [0; 4],
        };
        footer.crc = footer.compute_crc();
        footer
    }

    pub fn compute_crc(&self) -> u32 {
        crc32fast::hash(&bytemuck::bytes_of(self)[..FOOTER_CRC_BYTES])
    }

    pub fn is_valid(&self) -> bool {
        self.signature == FOOTER_SIGNATURE && self.crc == self.compute_crc()
    }
}
