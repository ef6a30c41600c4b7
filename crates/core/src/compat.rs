//! Bug-compatibility allow-list.
//!
//! Some historically-confirmed OS and library defects touch memory in
//! ways this core flags, yet real ROMs shipped with them for years and
//! the touches are harmless. Reporting them would bury genuine
//! application bugs, so a curated table of named exceptions downgrades
//! those specific diagnoses to `Ok`.
//!
//! This table is policy data, not a workaround for the core's own
//! correctness. Each entry names the guest function the faulting PC must
//! be inside, the violation kinds it excuses, and the last OS version the
//! defect shipped in. The version thresholds are empirical constants
//! reproduced literally; they are not re-derived.
//!
//! An allowed access still fully executes: the table changes the
//! diagnosis, never the behavior.

use std::collections::HashMap;

use crate::classify::ViolationKind;
use crate::{AddrRange, OsVersion};

/// ROM-image function lookup, provided by the loader collaborator.
///
/// `generation` changes whenever a different ROM image is loaded, which
/// naturally invalidates cached function ranges.
pub trait RomSymbols {
    fn generation(&self) -> u64;
    fn function_range(&self, name: &str) -> Option<AddrRange>;
}

struct CompatEntry {
    /// Human-readable defect name, for logs.
    name: &'static str,
    /// Guest function the faulting PC must be inside.
    function: &'static str,
    /// Last OS version the defect shipped in.
    max_version: OsVersion,
    /// Violation kinds this entry excuses.
    kinds: &'static [ViolationKind],
    /// Whether only reads are excused.
    reads_only: bool,
    /// Address window the access must fall entirely inside, if any.
    addr_window: Option<AddrRange>,
    /// Largest excused access size in bytes.
    max_size: u32,
}

const COMPAT_TABLE: &[CompatEntry] = &[
    // The boot-time ROM checksum sums from address 0 and legitimately
    // reads the reset vector. Fixed in the 3.5 ROM line.
    CompatEntry {
        name: "boot checksum reads the null vector",
        function: "PrvBootChecksum",
        max_version: OsVersion::new(3, 3),
        kinds: &[ViolationKind::LowMem],
        reads_only: true,
        addr_window: Some(AddrRange::new(0, 4)),
        max_size: 4,
    },
    // The heap scrambler walks free blocks by direct pointer while
    // compacting.
    CompatEntry {
        name: "heap scramble walks free chunks",
        function: "MemHeapScramble",
        max_version: OsVersion::new(3, 5),
        kinds: &[ViolationKind::FreeChunk, ViolationKind::MemMgr],
        reads_only: false,
        addr_window: None,
        max_size: 4,
    },
    // Window-handle validation probes a possibly stale pointer before
    // checking the handle table.
    CompatEntry {
        name: "window validation probes stale handles",
        function: "WinValidateHandle",
        max_version: OsVersion::new(4, 0),
        kinds: &[ViolationKind::UnlockedChunk, ViolationKind::FreeChunk],
        reads_only: true,
        addr_window: None,
        max_size: 4,
    },
    // The sleep routine re-reads the interrupt vectors it is about to
    // repoint.
    CompatEntry {
        name: "sleep handler peeks interrupt vectors",
        function: "HwrSleep",
        max_version: OsVersion::new(4, 0),
        kinds: &[ViolationKind::LowMem],
        reads_only: true,
        addr_window: Some(AddrRange::new(0, 0x100)),
        max_size: 4,
    },
];

struct CachedRange {
    generation: u64,
    range: Option<AddrRange>,
}

/// Applies the allow-list, caching function-range lookups per ROM
/// generation. Ranges are resolved lazily the first time a function is
/// probed; a new ROM image (new generation) re-resolves on next use.
#[derive(Default)]
pub struct CompatChecker {
    cache: HashMap<&'static str, CachedRange>,
}

impl CompatChecker {
    pub fn new() -> Self {
        CompatChecker { cache: HashMap::new() }
    }

    /// Drop all cached function ranges (session reset).
    pub fn reset(&mut self) {
        self.cache.clear();
    }

    fn function_range(
        &mut self,
        symbols: &dyn RomSymbols,
        function: &'static str,
    ) -> Option<AddrRange> {
        let generation = symbols.generation();
        match self.cache.get(function) {
            Some(c) if c.generation == generation => c.range,
            _ => {
                let range = symbols.function_range(function);
                self.cache.insert(function, CachedRange { generation, range });
                range
            }
        }
    }

    /// Downgrade `kind` to `Ok` if a table entry excuses this access.
    ///
    /// `pc` is the faulting program counter; entries only match while it
    /// is inside their named function on an OS version at or below their
    /// threshold.
    pub fn allow_for_bugs(
        &mut self,
        symbols: Option<&dyn RomSymbols>,
        os: OsVersion,
        pc: u32,
        addr: u32,
        size: u32,
        for_read: bool,
        kind: ViolationKind,
    ) -> ViolationKind {
        if kind == ViolationKind::Ok {
            return kind;
        }
        let Some(symbols) = symbols else {
            return kind;
        };
        for entry in COMPAT_TABLE {
            if os > entry.max_version
                || size > entry.max_size
                || (entry.reads_only && !for_read)
                || !entry.kinds.contains(&kind)
            {
                continue;
            }
            if let Some(window) = entry.addr_window {
                if !(window.contains(addr) && addr + size <= window.end) {
                    continue;
                }
            }
            match self.function_range(symbols, entry.function) {
                Some(range) if range.contains(pc) => {
                    log::debug!(
                        "allowing {:?} at {:#010X} for known defect: {}",
                        kind,
                        addr,
                        entry.name
                    );
                    return ViolationKind::Ok;
                }
                _ => {}
            }
        }
        kind
    }
}
