//! Guest allocator heap model.
//!
//! Read-only interpretation of the guest memory manager's on-RAM
//! structures for one heap. The model is rebuilt from guest memory every
//! time the allocator collaborator reports a structural change; it is
//! never patched in place and never mutates guest memory.
//!
//! ## Wire layout (big-endian)
//!
//! ```text
//! heap header (16 bytes)
//!   +0  id            u16
//!   +2  flags         u16
//!   +4  size          u32   total heap size including this header
//!   +8  mpt_offset    u32   offset to first master pointer table, 0 = none
//!   +12 reserved      u32
//!
//! master pointer table
//!   +0  count         u16
//!   +2  next_mpt      u32   heap offset of next table, 0 = end of chain
//!   +6  entries       count × u32
//!
//! chunk (repeated; a zero first word terminates the list)
//!   +0  word0         u32   free:1 | reserved:3 | lock_count:4 | body_size:24
//!   +4  handle_offset u32   back-offset to master pointer, 0 = unmovable
//!   +8  body          body_size bytes
//!   ... trailer       u32   total chunk size (backward-walk link)
//! ```
//!
//! The first master pointer table sits immediately after the heap header;
//! chained tables live inside chunk bodies and are re-opened to the system
//! by the resync overlay pass.

use crate::shadow::ShadowBits;
use crate::AddrRange;
use thiserror::Error;

pub const HEAP_HEADER_SIZE: u32 = 16;
pub const CHUNK_HEADER_SIZE: u32 = 8;
pub const CHUNK_TRAILER_SIZE: u32 = 4;
pub const MPT_HEADER_SIZE: u32 = 6;

/// Role bits for heap bookkeeping structures: chunk headers, trailers, and
/// the heap header are the allocator's private property.
pub const BOOKKEEPING_ROLE: ShadowBits =
    ShadowBits::NO_APP_ACCESS.union(ShadowBits::NO_SYSTEM_ACCESS);

/// Role bits for master pointer tables: closed to applications, open to
/// the rest of the system (many system routines dereference handles
/// directly).
pub const MPT_ROLE: ShadowBits = ShadowBits::NO_APP_ACCESS;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HeapScanError {
    #[error("heap header at 0x{0:08X} is truncated")]
    TruncatedHeader(u32),
    #[error("heap at 0x{addr:08X} declares size {size} but only {avail} bytes back it")]
    BadHeapSize { addr: u32, size: u32, avail: u32 },
    #[error("chunk at 0x{addr:08X} overruns the heap end 0x{end:08X}")]
    ChunkOverrun { addr: u32, end: u32 },
    #[error("master pointer table offset 0x{0:X} lies outside the heap")]
    BadMptOffset(u32),
    #[error("master pointer table chain revisits offset 0x{0:X}")]
    MptLoop(u32),
    #[error("no registered heap with id {0}")]
    UnknownHeap(u16),
    #[error("heap base 0x{0:08X} is not backed by any bank")]
    Unbacked(u32),
}

/// One master pointer table: maps handles to chunk pointers.
#[derive(Debug, Clone)]
pub struct MasterPointerTable {
    pub range: AddrRange,
    pub entry_count: u16,
}

/// One allocation record inside a guest heap.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub header_range: AddrRange,
    pub body_range: AddrRange,
    pub trailer_range: AddrRange,
    pub free: bool,
    pub lock_count: u16,
}

impl Chunk {
    /// Full extent: header through trailer.
    pub fn range(&self) -> AddrRange {
        AddrRange::new(self.header_range.begin, self.trailer_range.end)
    }

    /// Shadow role for the chunk body. Free chunks belong to the
    /// allocator alone; unlocked chunks may move, so applications must go
    /// through handles; locked chunks are open.
    pub fn body_role(&self) -> ShadowBits {
        if self.free {
            BOOKKEEPING_ROLE
        } else if self.lock_count == 0 {
            ShadowBits::NO_APP_ACCESS
        } else {
            ShadowBits::empty()
        }
    }
}

/// A range/role pair produced by the resynchronizer's derivation pass and
/// applied with `set_access`.
#[derive(Debug, Clone, Copy)]
pub struct RoleMark {
    pub range: AddrRange,
    pub role: ShadowBits,
}

/// Model of one guest heap, scanned from guest memory.
#[derive(Debug, Clone)]
pub struct Heap {
    pub id: u16,
    pub range: AddrRange,
    pub header_range: AddrRange,
    pub mpts: Vec<MasterPointerTable>,
    pub chunks: Vec<Chunk>,
}

#[inline]
fn be16(data: &[u8], off: usize) -> u16 {
    u16::from_be_bytes([data[off], data[off + 1]])
}

#[inline]
fn be32(data: &[u8], off: usize) -> u32 {
    u32::from_be_bytes([data[off], data[off + 1], data[off + 2], data[off + 3]])
}

impl Heap {
    /// Scan a heap image from guest memory. `data` is the bank backing
    /// slice starting at the heap header; `base` is the header's emulated
    /// address.
    pub fn scan(data: &[u8], base: u32) -> Result<Heap, HeapScanError> {
        if data.len() < HEAP_HEADER_SIZE as usize {
            return Err(HeapScanError::TruncatedHeader(base));
        }
        let id = be16(data, 0);
        let size = be32(data, 4);
        let mpt_offset = be32(data, 8);
        if size < HEAP_HEADER_SIZE || size as usize > data.len() {
            return Err(HeapScanError::BadHeapSize {
                addr: base,
                size,
                avail: data.len() as u32,
            });
        }

        let mut heap = Heap {
            id,
            range: AddrRange::new(base, base + size),
            header_range: AddrRange::new(base, base + HEAP_HEADER_SIZE),
            mpts: Vec::new(),
            chunks: Vec::new(),
        };

        // Master pointer table chain.
        let mut off = mpt_offset;
        let mut visited: Vec<u32> = Vec::new();
        while off != 0 {
            if visited.contains(&off) {
                return Err(HeapScanError::MptLoop(off));
            }
            visited.push(off);
            if off < HEAP_HEADER_SIZE || off + MPT_HEADER_SIZE > size {
                return Err(HeapScanError::BadMptOffset(off));
            }
            let o = off as usize;
            let count = be16(data, o);
            let next = be32(data, o + 2);
            let end = off + MPT_HEADER_SIZE + count as u32 * 4;
            if end > size {
                return Err(HeapScanError::BadMptOffset(off));
            }
            heap.mpts.push(MasterPointerTable {
                range: AddrRange::new(base + off, base + end),
                entry_count: count,
            });
            off = next;
        }

        // Chunk list: starts after the first (in-line) master pointer
        // table, or directly after the header when the heap has none.
        let mut cursor = match heap.mpts.first() {
            Some(mpt) if mpt.range.begin == base + HEAP_HEADER_SIZE => mpt.range.end - base,
            _ => HEAP_HEADER_SIZE,
        };
        while cursor + CHUNK_HEADER_SIZE <= size {
            let word0 = be32(data, cursor as usize);
            if word0 == 0 {
                break;
            }
            let free = word0 & 0x8000_0000 != 0;
            let lock_count = ((word0 >> 24) & 0x0F) as u16;
            let body_size = word0 & 0x00FF_FFFF;
            let total = CHUNK_HEADER_SIZE + body_size + CHUNK_TRAILER_SIZE;
            if cursor + total > size {
                return Err(HeapScanError::ChunkOverrun {
                    addr: base + cursor,
                    end: base + size,
                });
            }
            let header = base + cursor;
            heap.chunks.push(Chunk {
                header_range: AddrRange::new(header, header + CHUNK_HEADER_SIZE),
                body_range: AddrRange::new(
                    header + CHUNK_HEADER_SIZE,
                    header + CHUNK_HEADER_SIZE + body_size,
                ),
                trailer_range: AddrRange::new(
                    header + CHUNK_HEADER_SIZE + body_size,
                    header + total,
                ),
                free,
                lock_count,
            });
            cursor += total;
        }

        log::debug!(
            "scanned heap {:#06X} at {:#010X}: {} chunks, {} MPTs, {} bytes",
            heap.id,
            base,
            heap.chunks.len(),
            heap.mpts.len(),
            size
        );
        Ok(heap)
    }

    /// Chunk containing `addr`, if any.
    pub fn chunk_containing(&self, addr: u32) -> Option<&Chunk> {
        self.chunks.iter().find(|c| c.range().contains(addr))
    }

    /// Role marks for the chunk pass of a resync. With `changed = None`
    /// every chunk (and the heap header) is re-derived; with a delta list
    /// only chunks whose header address appears in it are.
    pub fn chunk_pass_roles(&self, changed: Option<&[u32]>) -> Vec<RoleMark> {
        let mut marks = Vec::new();
        if changed.is_none() {
            marks.push(RoleMark {
                range: self.header_range,
                role: BOOKKEEPING_ROLE,
            });
        }
        for chunk in &self.chunks {
            if let Some(list) = changed {
                if !list.contains(&chunk.header_range.begin) {
                    continue;
                }
            }
            marks.push(RoleMark {
                range: chunk.header_range,
                role: BOOKKEEPING_ROLE,
            });
            marks.push(RoleMark {
                range: chunk.body_range,
                role: chunk.body_role(),
            });
            marks.push(RoleMark {
                range: chunk.trailer_range,
                role: BOOKKEEPING_ROLE,
            });
        }
        marks
    }

    /// Overlay marks reapplied after every chunk pass: master pointer
    /// tables stay readable by the system but closed to applications.
    /// Applied last so the chunk pass cannot re-restrict them.
    pub fn mpt_overlay_roles(&self) -> Vec<RoleMark> {
        self.mpts
            .iter()
            .map(|mpt| RoleMark {
                range: mpt.range,
                role: MPT_ROLE,
            })
            .collect()
    }
}

/// Registry of scanned heaps, indexed by id and by containing address.
/// Always an explicit map, never pointer arithmetic against guest arrays.
#[derive(Default)]
pub struct HeapRegistry {
    heaps: Vec<Heap>,
}

impl HeapRegistry {
    pub fn new() -> Self {
        HeapRegistry { heaps: Vec::new() }
    }

    /// Insert or replace the heap with the same id.
    pub fn insert(&mut self, heap: Heap) {
        if let Some(slot) = self.heaps.iter_mut().find(|h| h.id == heap.id) {
            *slot = heap;
        } else {
            self.heaps.push(heap);
            self.heaps.sort_by_key(|h| h.range.begin);
        }
    }

    pub fn remove(&mut self, id: u16) -> Option<Heap> {
        let idx = self.heaps.iter().position(|h| h.id == id)?;
        Some(self.heaps.remove(idx))
    }

    pub fn clear(&mut self) {
        self.heaps.clear();
    }

    pub fn by_id(&self, id: u16) -> Option<&Heap> {
        self.heaps.iter().find(|h| h.id == id)
    }

    /// Heap whose range contains `addr`.
    pub fn containing(&self, addr: u32) -> Option<&Heap> {
        self.heaps.iter().find(|h| h.range.contains(addr))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Heap> {
        self.heaps.iter()
    }

    pub fn len(&self) -> usize {
        self.heaps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heaps.is_empty()
    }
}

// ─── Test image builder ─────────────────────────────────────────────────────
