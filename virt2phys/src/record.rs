// Decoding of the two per-page records the kernel exposes.
// https://www.kernel.org/doc/Documentation/vm/pagemap.txt
//
// Both records are a single little-endian 64-bit word. Fields are pulled out
// with explicit masks and shifts; the layout is kernel ABI, not a C bitfield.

use std::fmt;
use std::str::FromStr;

use bitflags::bitflags;
use byteorder::{ByteOrder, LittleEndian};

use crate::error::{Error, Result};
use crate::RECORD_SIZE;

// Bits 0-54  page frame number (PFN) if present
const PFN_MASK: u64 = (1 << 55) - 1;
const SOFT_DIRTY_BIT: u32 = 55;
const EXCLUSIVE_BIT: u32 = 56;
const UFFD_WP_BIT: u32 = 57;
// bits 58-60 are zero/reserved and never looked at
const FILE_SHARED_BIT: u32 = 61;
const SWAPPED_BIT: u32 = 62;
const PRESENT_BIT: u32 = 63;

// Bits 0-4 swap type, bits 5-54 swap offset if swapped
const SWAP_TYPE_MASK: u64 = (1 << 5) - 1;
const SWAP_OFFSET_SHIFT: u32 = 5;

fn bit(word: u64, n: u32) -> bool {
    word & (1 << n) != 0
}

fn read_word(bytes: &[u8]) -> Result<u64> {
    if bytes.len() < RECORD_SIZE {
        return Err(Error::MalformedRecord {
            offset: None,
            len: bytes.len(),
            source: None,
        });
    }
    Ok(LittleEndian::read_u64(&bytes[..RECORD_SIZE]))
}

/// One `/proc/<pid>/pagemap` entry, describing a single virtual page.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PagemapEntry {
    pub raw: u64,
    pub pfn: u64,
    pub soft_dirty: bool,
    pub exclusive: bool,
    pub uffd_write_protect: bool,
    pub file_shared: bool,
    pub swapped: bool,
    pub present: bool,
}

impl PagemapEntry {
    pub fn from_raw(raw: u64) -> Self {
        PagemapEntry {
            raw,
            pfn: raw & PFN_MASK,
            soft_dirty: bit(raw, SOFT_DIRTY_BIT),
            exclusive: bit(raw, EXCLUSIVE_BIT),
            uffd_write_protect: bit(raw, UFFD_WP_BIT),
            file_shared: bit(raw, FILE_SHARED_BIT),
            swapped: bit(raw, SWAPPED_BIT),
            present: bit(raw, PRESENT_BIT),
        }
    }

    /// Physical address of the frame backing this page. Only meaningful when present.
    pub fn physical_address(&self, page_size: u64) -> u64 {
        self.pfn.wrapping_mul(page_size)
    }

    /// The pfn field reinterpreted as a swap entry, if the page is swapped out.
    pub fn swap(&self) -> Option<SwapEntry> {
        if !self.swapped {
            return None;
        }
        Some(SwapEntry {
            swap_type: (self.pfn & SWAP_TYPE_MASK) as u8,
            offset: self.pfn >> SWAP_OFFSET_SHIFT,
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SwapEntry {
    pub swap_type: u8,
    pub offset: u64,
}

bitflags! {
    /// One `/proc/kpageflags` word, describing a single physical page.
    ///
    /// Bits 32 and up are only exported by kernels built with
    /// CONFIG_PAGE_FLAGS_HACKING-style debugging, and their meaning has
    /// shifted between versions. Bits with no name here are kept as-is.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct KPageFlags: u64 {
        const LOCKED = 1 << 0;
        const ERROR = 1 << 1;
        const REFERENCED = 1 << 2;
        const UPTODATE = 1 << 3;
        const DIRTY = 1 << 4;
        const LRU = 1 << 5;
        const ACTIVE = 1 << 6;
        const SLAB = 1 << 7;
        const WRITEBACK = 1 << 8;
        const RECLAIM = 1 << 9;
        const BUDDY = 1 << 10;
        const MMAP = 1 << 11;
        const ANON = 1 << 12;
        const SWAPCACHE = 1 << 13;
        const SWAPBACKED = 1 << 14;
        const COMPOUND_HEAD = 1 << 15;
        const COMPOUND_TAIL = 1 << 16;
        const HUGE = 1 << 17;
        const UNEVICTABLE = 1 << 18;
        const HWPOISON = 1 << 19;
        const NOPAGE = 1 << 20;
        const KSM = 1 << 21;
        const THP = 1 << 22;
        // BALLOON on older kernels
        const OFFLINE = 1 << 23;
        const ZERO_PAGE = 1 << 24;
        const IDLE = 1 << 25;
        const PGTABLE = 1 << 26;

        const RESERVED = 1 << 32;
        const MLOCKED = 1 << 33;
        const MAPPEDTODISK = 1 << 34;
        const PRIVATE = 1 << 35;
        const PRIVATE_2 = 1 << 36;
        const OWNER_PRIVATE = 1 << 37;
        const ARCH = 1 << 38;
        const UNCACHED = 1 << 39;
        const SOFTDIRTY = 1 << 40;
        const ARCH_2 = 1 << 41;
    }
}

impl KPageFlags {
    pub fn raw(&self) -> u64 {
        self.bits()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.iter_names().map(|(name, _)| name).collect()
    }
}

/// Decode a pagemap record. Every 64-bit pattern is a valid record.
pub fn decode_translation(bytes: &[u8]) -> Result<PagemapEntry> {
    read_word(bytes).map(PagemapEntry::from_raw)
}

/// Decode a kpageflags record, keeping undefined bits verbatim.
pub fn decode_pageflags(bytes: &[u8]) -> Result<KPageFlags> {
    read_word(bytes).map(KPageFlags::from_bits_retain)
}

/// Which physical pages count as page cache.
///
/// The kernel overloads MAPPEDTODISK and ANON differently across versions, so
/// none of these is authoritative. `MappedNotAnon` is what the tool has always
/// done; the others exist for kernels where that gives nonsense.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PageCacheFilter {
    MappedNotAnon,
    MappedToDisk,
    LruNotAnon,
}

impl Default for PageCacheFilter {
    fn default() -> Self {
        PageCacheFilter::MappedNotAnon
    }
}

impl PageCacheFilter {
    pub fn matches(&self, flags: &KPageFlags) -> bool {
        match self {
            PageCacheFilter::MappedNotAnon => {
                flags.contains(KPageFlags::MAPPEDTODISK) && !flags.contains(KPageFlags::ANON)
            }
            PageCacheFilter::MappedToDisk => flags.contains(KPageFlags::MAPPEDTODISK),
            PageCacheFilter::LruNotAnon => {
                flags.contains(KPageFlags::LRU) && !flags.contains(KPageFlags::ANON)
            }
        }
    }
}

impl FromStr for PageCacheFilter {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "mapped-not-anon" => Ok(PageCacheFilter::MappedNotAnon),
            "mapped-to-disk" => Ok(PageCacheFilter::MappedToDisk),
            "lru-not-anon" => Ok(PageCacheFilter::LruNotAnon),
            other => Err(Error::InvalidArgument(format!(
                "unknown page cache filter '{}' (expected mapped-not-anon, mapped-to-disk or lru-not-anon)",
                other
            ))),
        }
    }
}

impl fmt::Display for PageCacheFilter {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            PageCacheFilter::MappedNotAnon => "mapped-not-anon",
            PageCacheFilter::MappedToDisk => "mapped-to-disk",
            PageCacheFilter::LruNotAnon => "lru-not-anon",
        };
        f.write_str(name)
    }
}
