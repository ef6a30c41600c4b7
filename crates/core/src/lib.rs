//! # stylus-core
//!
//! Memory-emulation core for the Stylus legacy-PDA emulator.
//!
//! The emulated device exposes one flat 32-bit address space to the CPU
//! interpreter and the OS-call trampolines. The hardware has no memory
//! protection unit, so this core reconstructs protection after the fact:
//! every access is screened against a shadow bitmap derived from the guest
//! allocator's own heap structures, and anything illegal is classified
//! into a typed diagnosis instead of silently corrupting guest state.
//!
//! ## Architecture
//!
//! - [`MemorySubsystem`] — Top-level context that wires banks, shadow
//!   memory, heap models, and the classifier; owns the session lifecycle
//! - [`bank`] — Per-region address banks (DRAM, storage RAM, ROM,
//!   hardware registers, optional framebuffer)
//! - [`shadow`] — Per-byte protection flags and bulk range marking
//! - [`heap`] — Guest allocator heap/chunk/MPT model and resync roles
//! - [`classify`] — Violation taxonomy and the first-match-wins walk
//! - [`compat`] — Version-gated allow-list of known benign OS defects
//! - [`ui`] — UI-object registry and direct-field-access policy
//! - [`session`] — Auxiliary-cache blob save/load
//! - [`debugger`] — Data/instruction breaks and the RAM viewer
//!
//! The CPU runs on exactly one thread and calls everything here
//! synchronously; the core performs no locking, no blocking, and no I/O.

pub mod bank;
pub mod classify;
pub mod compat;
pub mod debugger;
pub mod heap;
pub mod session;
pub mod shadow;
pub mod ui;

use std::cell::Cell;
use std::rc::Rc;

use serde::{Deserialize, Serialize};

pub use bank::{AddressBank, FrameBufferBank, RamBank, RegisterBank, RomBank};
pub use classify::{AccessViolation, ViolationKind};
pub use compat::{CompatChecker, RomSymbols};
pub use debugger::{BreakHit, Debugger};
pub use heap::{Chunk, Heap, HeapRegistry, HeapScanError, MasterPointerTable};
pub use session::{AuxState, SessionError};
pub use shadow::{ShadowBits, ShadowMemory};
pub use ui::{UiObjectKind, UiRegistry};

use classify::ClassifyInputs;

// Address map
/// Dynamic RAM base address.
pub const DRAM_BASE: u32 = 0x0000_0000;
/// Default dynamic RAM size: 1 MB (configurable per device model).
pub const DEFAULT_DRAM_SIZE: usize = 0x0010_0000;
/// Battery-backed storage RAM base address.
pub const SRAM_BASE: u32 = 0x1000_0000;
/// Default storage RAM size: 2 MB.
pub const DEFAULT_SRAM_SIZE: usize = 0x0020_0000;
/// OS ROM base address.
pub const ROM_BASE: u32 = 0x10C0_0000;
/// Memory-mapped hardware register page.
pub const REG_BASE: u32 = 0xFFFF_F000;
/// Hardware register page size.
pub const REG_SIZE: usize = 0x1000;

/// Exception vector table: the first 256 bytes of dynamic RAM.
pub const VECTOR_TABLE_END: u32 = 0x0000_0100;
/// System globals follow the vector table.
pub const SYS_GLOBALS_END: u32 = 0x0000_0C00;

/// A half-open `[begin, end)` range of emulated addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddrRange {
    pub begin: u32,
    pub end: u32,
}

impl AddrRange {
    pub const fn new(begin: u32, end: u32) -> Self {
        AddrRange { begin, end }
    }

    pub const fn len(self) -> u32 {
        self.end - self.begin
    }

    pub const fn is_empty(self) -> bool {
        self.begin >= self.end
    }

    #[inline(always)]
    pub const fn contains(self, addr: u32) -> bool {
        addr >= self.begin && addr < self.end
    }

    /// Whether a `size`-byte access at `addr` lies fully inside.
    #[inline(always)]
    pub const fn contains_span(self, addr: u32, size: u32) -> bool {
        addr >= self.begin && addr <= self.end && self.end - addr >= size
    }

    /// Overlap test. The test range may start before, inside, or after
    /// this range; only start-after-end or end-before-start pairs are
    /// disjoint.
    #[inline(always)]
    pub const fn intersects(self, other: AddrRange) -> bool {
        !(other.begin >= self.end || other.end <= self.begin)
    }
}

/// Access width of one emulated load or store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessWidth {
    Byte,
    Word,
    Long,
}

impl AccessWidth {
    #[inline(always)]
    pub const fn bytes(self) -> u32 {
        match self {
            AccessWidth::Byte => 1,
            AccessWidth::Word => 2,
            AccessWidth::Long => 4,
        }
    }
}

/// Guest OS version, compared lexicographically (major, then minor).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OsVersion {
    pub major: u8,
    pub minor: u8,
}

impl OsVersion {
    pub const fn new(major: u8, minor: u8) -> Self {
        OsVersion { major, minor }
    }
}

/// One guest stack: the boot stack or a task stack. Maintained by the
/// CPU-context collaborator, consulted read-only here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackRange {
    pub bottom: u32,
    pub top: u32,
    pub low_water_mark: u32,
    pub boot: bool,
}

impl StackRange {
    pub fn range(self) -> AddrRange {
        AddrRange::new(self.bottom, self.top)
    }

    #[inline(always)]
    pub fn contains(self, addr: u32) -> bool {
        addr >= self.bottom && addr < self.top
    }

    /// The live stack pointer may sit one past the top of its stack.
    #[inline(always)]
    pub fn contains_sp(self, sp: u32) -> bool {
        sp >= self.bottom && sp <= self.top
    }
}

/// Caller privilege tier, derived from the faulting program counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessTier {
    /// Guest application code.
    Application,
    /// System code outside the allocator (ROM, or a recognized
    /// RAM-resident OS component).
    System,
    /// The allocator itself.
    MemoryManager,
}

impl AccessTier {
    /// The shadow bit that forbids this tier.
    #[inline(always)]
    pub fn shadow_mask(self) -> ShadowBits {
        match self {
            AccessTier::Application => ShadowBits::NO_APP_ACCESS,
            AccessTier::System => ShadowBits::NO_SYSTEM_ACCESS,
            AccessTier::MemoryManager => ShadowBits::NO_MEMMGR_ACCESS,
        }
    }
}

/// Per-access CPU state handed in by the interpreter.
#[derive(Debug, Clone, Copy)]
pub struct CpuContext {
    pub pc: u32,
    pub sp: u32,
}

/// Session-creation configuration.
pub struct MemoryConfig {
    pub dram_size: usize,
    pub sram_size: usize,
    pub rom_image: Vec<u8>,
    /// Dedicated external framebuffer bank `(base, size)`, for device
    /// models whose screen is not in dynamic RAM.
    pub framebuffer: Option<(u32, usize)>,
    pub os_version: OsVersion,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        MemoryConfig {
            dram_size: DEFAULT_DRAM_SIZE,
            sram_size: DEFAULT_SRAM_SIZE,
            rom_image: Vec::new(),
            framebuffer: None,
            os_version: OsVersion::new(3, 5),
        }
    }
}

/// Nestable trust boundary: while any guard is alive, access checking and
/// classification are disabled for the current call stack. Dropping the
/// guard always restores the prior depth, including on unwind.
pub struct FullAccessGuard {
    depth: Rc<Cell<u32>>,
}

impl Drop for FullAccessGuard {
    fn drop(&mut self) {
        self.depth.set(self.depth.get().saturating_sub(1));
    }
}

/// The memory subsystem: every piece of state the emulated address space
/// needs, owned explicitly and threaded by reference into every call site.
///
/// Created once per session ([`MemorySubsystem::new`]), reset in place on
/// session reset ([`reset`](Self::reset)), and torn down by `Drop` at
/// session disposal.
pub struct MemorySubsystem {
    dram: RamBank,
    sram: RamBank,
    rom: RomBank,
    regs: RegisterBank,
    framebuffer: Option<FrameBufferBank>,

    heaps: HeapRegistry,
    ui: UiRegistry,
    compat: CompatChecker,
    pub debugger: Debugger,
    rom_symbols: Option<Box<dyn RomSymbols>>,

    stacks: Vec<StackRange>,
    allocator_ranges: Vec<AddrRange>,
    system_ranges: Vec<AddrRange>,
    screen_range: Option<AddrRange>,
    os_version: OsVersion,

    full_access_depth: Rc<Cell<u32>>,
    violations: Vec<AccessViolation>,
    dirty: Option<(u32, u32)>,
    tracked_chunks: Vec<u32>,
}

impl MemorySubsystem {
    /// Session initialization: size and zero the banks, then close the
    /// vector table and system globals to applications.
    pub fn new(config: MemoryConfig) -> Self {
        let mut mem = MemorySubsystem {
            dram: RamBank::new("dram", DRAM_BASE, config.dram_size, 0),
            sram: RamBank::new("sram", SRAM_BASE, config.sram_size, 1),
            rom: RomBank::new(ROM_BASE, config.rom_image),
            regs: RegisterBank::new(REG_BASE, REG_SIZE),
            framebuffer: config.framebuffer.map(|(base, size)| FrameBufferBank::new(base, size)),
            heaps: HeapRegistry::new(),
            ui: UiRegistry::new(),
            compat: CompatChecker::new(),
            debugger: Debugger::new(),
            rom_symbols: None,
            stacks: Vec::new(),
            allocator_ranges: Vec::new(),
            system_ranges: Vec::new(),
            screen_range: None,
            os_version: config.os_version,
            full_access_depth: Rc::new(Cell::new(0)),
            violations: Vec::new(),
            dirty: None,
            tracked_chunks: Vec::new(),
        };
        mem.mark_static_regions();
        mem
    }

    /// The exception vectors are nobody's to touch directly (even ROM
    /// code goes through trusted paths; the known offenders are on the
    /// allow-list). The globals area is system territory only.
    fn mark_static_regions(&mut self) {
        self.set_access(
            DRAM_BASE,
            VECTOR_TABLE_END,
            ShadowBits::NO_APP_ACCESS | ShadowBits::NO_SYSTEM_ACCESS,
        );
        self.set_access(VECTOR_TABLE_END, SYS_GLOBALS_END, ShadowBits::NO_APP_ACCESS);
    }

    pub fn os_version(&self) -> OsVersion {
        self.os_version
    }

    pub fn set_os_version(&mut self, os: OsVersion) {
        self.os_version = os;
    }

    /// Install the ROM symbol resolver used by the bug-compatibility
    /// cache.
    pub fn set_rom_symbols(&mut self, symbols: Box<dyn RomSymbols>) {
        self.rom_symbols = Some(symbols);
    }

    // ─── Bank dispatch ──────────────────────────────────────────────────────

    fn bank(&self, addr: u32) -> Option<&dyn AddressBank> {
        if self.dram.range().contains(addr) {
            return Some(&self.dram);
        }
        if self.sram.range().contains(addr) {
            return Some(&self.sram);
        }
        if self.rom.range().contains(addr) {
            return Some(&self.rom);
        }
        if self.regs.range().contains(addr) {
            return Some(&self.regs);
        }
        if let Some(fb) = &self.framebuffer {
            if fb.range().contains(addr) {
                return Some(fb);
            }
        }
        None
    }

    fn bank_mut(&mut self, addr: u32) -> Option<&mut dyn AddressBank> {
        if self.dram.range().contains(addr) {
            return Some(&mut self.dram);
        }
        if self.sram.range().contains(addr) {
            return Some(&mut self.sram);
        }
        if self.rom.range().contains(addr) {
            return Some(&mut self.rom);
        }
        if self.regs.range().contains(addr) {
            return Some(&mut self.regs);
        }
        if let Some(fb) = &mut self.framebuffer {
            if fb.range().contains(addr) {
                return Some(fb);
            }
        }
        None
    }

    fn for_each_shadow(&mut self, mut f: impl FnMut(&mut ShadowMemory)) {
        if let Some(s) = self.dram.shadow_mut() {
            f(s);
        }
        if let Some(s) = self.sram.shadow_mut() {
            f(s);
        }
        if let Some(s) = self.rom.shadow_mut() {
            f(s);
        }
    }

    /// Per-access cycle cost for the CPU loop. Unmapped addresses cost as
    /// much as a register access.
    pub fn access_cost(&self, addr: u32, width: AccessWidth) -> u8 {
        self.bank(addr).map_or(4, |b| b.cycle_cost(width))
    }

    // ─── Shadow marking (clamped per bank; no-op for unchecked banks) ───────

    pub fn mark_range(&mut self, begin: u32, end: u32, bits: ShadowBits) {
        self.for_each_shadow(|s| s.mark_range(begin, end, bits));
    }

    pub fn unmark_range(&mut self, begin: u32, end: u32, bits: ShadowBits) {
        self.for_each_shadow(|s| s.unmark_range(begin, end, bits));
    }

    /// Reclassify a range for a new role (see [`ShadowMemory::set_access`]).
    pub fn set_access(&mut self, begin: u32, end: u32, role: ShadowBits) {
        self.for_each_shadow(|s| s.set_access(begin, end, role));
    }

    // ─── Collaborator state ─────────────────────────────────────────────────

    /// Replace the stack set reported by the CPU-context collaborator.
    pub fn set_stacks(&mut self, stacks: Vec<StackRange>) {
        let old = std::mem::replace(&mut self.stacks, stacks);
        for s in &old {
            self.unmark_range(s.bottom, s.top, ShadowBits::STACK_BUFFER);
        }
        let new = self.stacks.clone();
        for s in &new {
            self.mark_range(s.bottom, s.top, ShadowBits::STACK_BUFFER);
        }
    }

    /// Register the allocator's code ranges; a PC inside one runs at the
    /// memory-manager tier.
    pub fn set_allocator_ranges(&mut self, ranges: Vec<AddrRange>) {
        self.allocator_ranges = ranges;
    }

    /// Register a recognized RAM-resident OS component; a PC inside one
    /// runs at the system tier even though it is not in ROM.
    pub fn add_system_component(&mut self, range: AddrRange) {
        self.system_ranges.push(range);
    }

    /// Set (or clear) the screen-buffer range. Marks the shadow bit and
    /// drives dirty-region notification on stores.
    pub fn set_screen_range(&mut self, range: Option<AddrRange>) {
        if let Some(old) = self.screen_range {
            self.unmark_range(old.begin, old.end, ShadowBits::SCREEN_BUFFER);
        }
        self.screen_range = range;
        if let Some(r) = range {
            self.mark_range(r.begin, r.end, ShadowBits::SCREEN_BUFFER);
        }
    }

    fn tier(&self, pc: u32) -> AccessTier {
        if self.allocator_ranges.iter().any(|r| r.contains(pc)) {
            return AccessTier::MemoryManager;
        }
        if self.rom.range().contains(pc) || self.system_ranges.iter().any(|r| r.contains(pc)) {
            return AccessTier::System;
        }
        AccessTier::Application
    }

    // ─── Scoped full access ─────────────────────────────────────────────────

    /// Enter a full-access scope. While the returned guard lives, no
    /// access checking or classification happens; nesting composes via a
    /// depth counter. Single-thread only by construction (the counter is
    /// an unsynchronized cell).
    pub fn full_access(&self) -> FullAccessGuard {
        self.full_access_depth.set(self.full_access_depth.get() + 1);
        FullAccessGuard { depth: Rc::clone(&self.full_access_depth) }
    }

    fn full_access_active(&self) -> bool {
        self.full_access_depth.get() > 0
    }

    // ─── Emulated access (the fast path) ────────────────────────────────────

    /// Emulated load. Checks, classifies, then performs the raw read; a
    /// violation never aborts the access.
    #[inline]
    pub fn read(&mut self, ctx: &CpuContext, addr: u32, width: AccessWidth) -> u32 {
        self.check_access(ctx, addr, width, true);
        match self.bank(addr) {
            Some(b) => match width {
                AccessWidth::Byte => b.read8(addr) as u32,
                AccessWidth::Word => b.read16(addr) as u32,
                AccessWidth::Long => b.read32(addr),
            },
            None => 0,
        }
    }

    /// Emulated store. Unmapped or read-only destinations drop the value.
    #[inline]
    pub fn write(&mut self, ctx: &CpuContext, addr: u32, width: AccessWidth, value: u32) {
        self.check_access(ctx, addr, width, false);
        if let Some(b) = self.bank_mut(addr) {
            match width {
                AccessWidth::Byte => b.write8(addr, value as u8),
                AccessWidth::Word => b.write16(addr, value as u16),
                AccessWidth::Long => b.write32(addr, value),
            }
        }
    }

    #[inline(always)]
    pub fn read_byte(&mut self, ctx: &CpuContext, addr: u32) -> u8 {
        self.read(ctx, addr, AccessWidth::Byte) as u8
    }

    #[inline(always)]
    pub fn read_word(&mut self, ctx: &CpuContext, addr: u32) -> u16 {
        self.read(ctx, addr, AccessWidth::Word) as u16
    }

    #[inline(always)]
    pub fn read_long(&mut self, ctx: &CpuContext, addr: u32) -> u32 {
        self.read(ctx, addr, AccessWidth::Long)
    }

    #[inline(always)]
    pub fn write_byte(&mut self, ctx: &CpuContext, addr: u32, v: u8) {
        self.write(ctx, addr, AccessWidth::Byte, v as u32);
    }

    #[inline(always)]
    pub fn write_word(&mut self, ctx: &CpuContext, addr: u32, v: u16) {
        self.write(ctx, addr, AccessWidth::Word, v as u32);
    }

    #[inline(always)]
    pub fn write_long(&mut self, ctx: &CpuContext, addr: u32, v: u32) {
        self.write(ctx, addr, AccessWidth::Long, v);
    }

    fn check_access(&mut self, ctx: &CpuContext, addr: u32, width: AccessWidth, for_read: bool) {
        let size = width.bytes();

        // Data breakpoints fire even inside full-access scopes.
        let data_break = self
            .bank(addr)
            .and_then(|b| b.shadow())
            .map_or(false, |sh| sh.contains(addr) && sh.test(addr, width, ShadowBits::DATA_BREAK));
        if data_break {
            self.debugger.note_access(addr, for_read, ctx.pc);
        }

        if !self.full_access_active() {
            let shadow_violation = match self.bank(addr) {
                Some(b) => {
                    let mask = self.tier(ctx.pc).shadow_mask();
                    let rom_store = !for_read && !b.writable();
                    let bits_hit = b
                        .shadow()
                        .map_or(false, |sh| sh.contains(addr) && sh.test(addr, width, mask));
                    rom_store || bits_hit
                }
                // Unmapped hole: always a violation.
                None => true,
            };
            let below_sp = classify::below_stack_pointer(&self.stacks, ctx.sp, addr);
            if shadow_violation || below_sp {
                let kind = self.diagnose(ctx, addr, size, for_read);
                if kind != ViolationKind::Ok {
                    self.violations.push(AccessViolation { address: addr, size, for_read, kind });
                }
            }
        }

        if !for_read {
            if let Some(screen) = self.screen_range {
                if screen.intersects(AddrRange::new(addr, addr + size)) {
                    self.note_dirty(addr, addr + size);
                }
            }
        }
    }

    // ─── Classification (the slow path) ─────────────────────────────────────

    fn diagnose(&mut self, ctx: &CpuContext, addr: u32, size: u32, for_read: bool) -> ViolationKind {
        let kind = {
            let inputs = ClassifyInputs {
                low_mem: AddrRange::new(DRAM_BASE, VECTOR_TABLE_END),
                globals: AddrRange::new(VECTOR_TABLE_END, SYS_GLOBALS_END),
                screen: self.screen_range,
                sp: ctx.sp,
                stacks: &self.stacks,
                heaps: &self.heaps,
                ui: &self.ui,
                os_version: self.os_version,
            };
            classify::classify(&inputs, addr, size, for_read)
        };
        self.compat.allow_for_bugs(
            self.rom_symbols.as_deref(),
            self.os_version,
            ctx.pc,
            addr,
            size,
            for_read,
            kind,
        )
    }

    /// Diagnose an access without performing it, e.g. for a "why did the
    /// last access fail" host flow. Deterministic for a given CPU context
    /// and heap state; honors full-access scopes and the allow-list.
    pub fn classify(&mut self, ctx: &CpuContext, addr: u32, size: u32, for_read: bool) -> ViolationKind {
        if self.full_access_active() {
            return ViolationKind::Ok;
        }
        self.diagnose(ctx, addr, size, for_read)
    }

    /// Drain the deferred violation queue. Records are moved out; the
    /// reporting collaborator owns them from here.
    pub fn take_violations(&mut self) -> Vec<AccessViolation> {
        std::mem::take(&mut self.violations)
    }

    // ─── Dirty-screen tracking ──────────────────────────────────────────────

    fn note_dirty(&mut self, begin: u32, end: u32) {
        self.dirty = Some(match self.dirty {
            Some((b, e)) => (b.min(begin), e.max(end)),
            None => (begin, end),
        });
    }

    /// Drain the accumulated dirty span of screen addresses, if any store
    /// touched the screen buffer since the last drain.
    pub fn take_dirty_span(&mut self) -> Option<(u32, u32)> {
        self.dirty.take()
    }

    // ─── Heap resynchronization ─────────────────────────────────────────────

    fn scan_heap_at(&self, base: u32) -> Result<Heap, HeapScanError> {
        let bank = self.bank(base).ok_or(HeapScanError::Unbacked(base))?;
        let avail = (bank.range().end - base) as usize;
        let data = bank.bytes(base, avail).ok_or(HeapScanError::Unbacked(base))?;
        Heap::scan(data, base)
    }

    /// First discovery of a heap at `base`: scan it, register it, and
    /// derive its shadow bits. Returns the heap id.
    pub fn register_heap(&mut self, base: u32) -> Result<u16, HeapScanError> {
        let heap = self.scan_heap_at(base)?;
        let id = heap.id;
        self.heaps.insert(heap);
        self.apply_resync(id, None);
        Ok(id)
    }

    /// Allocator notification: the heap's structure changed. The chunk
    /// list is rebuilt from guest memory (never patched) and every range
    /// is re-derived.
    pub fn heap_changed(&mut self, id: u16) -> Result<(), HeapScanError> {
        let base = self
            .heaps
            .by_id(id)
            .map(|h| h.range.begin)
            .ok_or(HeapScanError::UnknownHeap(id))?;
        let heap = self.scan_heap_at(base)?;
        self.heaps.insert(heap);
        self.apply_resync(id, None);
        Ok(())
    }

    /// Allocator notification with a delta: only the chunks whose header
    /// addresses are listed are re-derived (plus the overlays, which are
    /// always reapplied).
    pub fn resync_chunks(&mut self, id: u16, changed: &[u32]) -> Result<(), HeapScanError> {
        let base = self
            .heaps
            .by_id(id)
            .map(|h| h.range.begin)
            .ok_or(HeapScanError::UnknownHeap(id))?;
        let heap = self.scan_heap_at(base)?;
        self.heaps.insert(heap);
        self.apply_resync(id, Some(changed));
        Ok(())
    }

    /// Forget a heap (storage card removal and the like). Its shadow
    /// range reverts to closed.
    pub fn remove_heap(&mut self, id: u16) {
        if let Some(heap) = self.heaps.remove(id) {
            let r = heap.range;
            self.tracked_chunks.retain(|a| !r.contains(*a));
            self.set_access(r.begin, r.end, ShadowBits::NO_APP_ACCESS | ShadowBits::NO_SYSTEM_ACCESS);
        }
    }

    fn apply_resync(&mut self, id: u16, changed: Option<&[u32]>) {
        let (marks, overlays, heap_range, chunk_addrs) = match self.heaps.by_id(id) {
            Some(h) => (
                h.chunk_pass_roles(changed),
                h.mpt_overlay_roles(),
                h.range,
                h.chunks.iter().map(|c| c.header_range.begin).collect::<Vec<_>>(),
            ),
            None => return,
        };

        for m in &marks {
            self.set_access(m.range.begin, m.range.end, m.role);
        }

        // Overlays strictly after the chunk pass, or the chunk pass would
        // re-restrict them.
        for m in &overlays {
            self.set_access(m.range.begin, m.range.end, m.role);
        }
        self.apply_boot_stack_overlay(heap_range);

        self.tracked_chunks.retain(|a| !heap_range.contains(*a));
        self.tracked_chunks.extend(chunk_addrs);
        self.tracked_chunks.sort_unstable();

        log::debug!(
            "resync heap {}: {} role marks, {} overlays",
            id,
            marks.len(),
            overlays.len()
        );
    }

    /// The allocator's bootstrap free-block creation would classify the
    /// live boot stack as a free chunk; force the range open instead.
    fn apply_boot_stack_overlay(&mut self, heap_range: AddrRange) {
        if let Some(boot) = self.stacks.iter().find(|s| s.boot).copied() {
            if heap_range.intersects(boot.range()) {
                self.set_access(boot.bottom, boot.top, ShadowBits::empty());
            }
        }
    }

    // ─── UI-object overlays ─────────────────────────────────────────────────

    /// Register a live UI object reported by the registry collaborator.
    pub fn register_ui_object(&mut self, kind: UiObjectKind, range: AddrRange) {
        self.ui.register(kind, range);
    }

    pub fn clear_ui_objects(&mut self) {
        self.ui.clear();
    }

    /// Close registered UI-object structs to direct application access.
    pub fn mark_ui_objects(&mut self) {
        let ranges: Vec<AddrRange> = self.ui.iter().map(|o| o.range).collect();
        for r in ranges {
            self.mark_range(r.begin, r.end, ShadowBits::NO_APP_ACCESS);
        }
    }

    /// Reopen UI-object structs (e.g. while the OS itself redraws).
    pub fn unmark_ui_objects(&mut self) {
        let ranges: Vec<AddrRange> = self.ui.iter().map(|o| o.range).collect();
        for r in ranges {
            self.unmark_range(r.begin, r.end, ShadowBits::NO_APP_ACCESS);
        }
    }

    // ─── Breakpoints ────────────────────────────────────────────────────────

    pub fn set_data_break(&mut self, addr: u32) {
        self.mark_range(addr, addr + 1, ShadowBits::DATA_BREAK);
    }

    pub fn clear_data_break(&mut self, addr: u32) {
        self.unmark_range(addr, addr + 1, ShadowBits::DATA_BREAK);
    }

    pub fn set_instruction_break(&mut self, addr: u32) {
        self.mark_range(addr, addr + 1, ShadowBits::INSTRUCTION_BREAK);
    }

    pub fn clear_instruction_break(&mut self, addr: u32) {
        self.unmark_range(addr, addr + 1, ShadowBits::INSTRUCTION_BREAK);
    }

    /// Polled by the CPU loop before dispatching each instruction.
    #[inline(always)]
    pub fn instruction_break_at(&self, pc: u32) -> bool {
        self.bank(pc)
            .and_then(|b| b.shadow())
            .map_or(false, |sh| {
                sh.contains(pc) && sh.test(pc, AccessWidth::Byte, ShadowBits::INSTRUCTION_BREAK)
            })
    }

    // ─── Host-side raw access ───────────────────────────────────────────────

    /// Copy bytes into emulated memory without checks (ROM/RAM image
    /// loading, session RAM restore). Returns false if the span is not
    /// backed by a writable bank.
    pub fn load_bytes(&mut self, addr: u32, bytes: &[u8]) -> bool {
        match self.bank_mut(addr).and_then(|b| b.bytes_mut(addr, bytes.len())) {
            Some(dst) => {
                dst.copy_from_slice(bytes);
                true
            }
            None => false,
        }
    }

    /// Borrow emulated memory without checks (host-side inspection).
    pub fn peek_bytes(&self, addr: u32, len: usize) -> Option<&[u8]> {
        self.bank(addr).and_then(|b| b.bytes(addr, len))
    }

    /// Hex + ASCII dump of an emulated range, for crash diagnostics. Runs
    /// under a full-access scope so dumping forbidden memory produces no
    /// violations of its own.
    pub fn dump_range(&mut self, ctx: &CpuContext, begin: u32, len: u32) -> String {
        let _guard = self.full_access();
        let bytes: Vec<u8> = (0..len).map(|k| self.read_byte(ctx, begin + k)).collect();
        debugger::dump_ram(&bytes, begin)
    }

    // ─── Session lifecycle ──────────────────────────────────────────────────

    /// Session reset: every checked byte reverts to "no access", then the
    /// long-lived markings and every registered heap are re-derived.
    pub fn reset(&mut self) {
        if let Some(s) = self.dram.shadow_mut() {
            s.reset();
        }
        if let Some(s) = self.sram.shadow_mut() {
            s.reset();
        }
        if let Some(s) = self.rom.shadow_mut() {
            s.clear();
        }
        self.mark_static_regions();
        if let Some(r) = self.screen_range {
            self.mark_range(r.begin, r.end, ShadowBits::SCREEN_BUFFER);
        }
        let stacks = self.stacks.clone();
        for s in &stacks {
            self.mark_range(s.bottom, s.top, ShadowBits::STACK_BUFFER);
        }

        self.violations.clear();
        self.dirty = None;
        self.debugger.reset();
        self.compat.reset();
        self.full_access_depth.set(0);

        let ids: Vec<u16> = self.heaps.iter().map(|h| h.id).collect();
        for id in ids {
            if let Err(e) = self.heap_changed(id) {
                log::warn!("reset: heap {} failed rescan: {}", id, e);
            }
        }
    }

    /// Persist the auxiliary caches. The shadow bitmap itself is never
    /// saved; a load recomputes it.
    pub fn save_session(&self) -> Result<Vec<u8>, SessionError> {
        session::save_to_vec(&AuxState {
            os_version: self.os_version,
            heap_bases: self.heaps.iter().map(|h| h.range.begin).collect(),
            tracked_chunks: self.tracked_chunks.clone(),
        })
    }

    /// Restore the auxiliary caches, then recompute every shadow bit with
    /// a full resync against the (already restored) guest RAM.
    pub fn load_session(&mut self, blob: &[u8]) -> Result<(), SessionError> {
        let aux = session::load_from_slice(blob)?;
        self.os_version = aux.os_version;
        self.tracked_chunks = aux.tracked_chunks;
        self.heaps.clear();
        self.reset();
        for base in aux.heap_bases {
            if let Err(e) = self.register_heap(base) {
                log::warn!("session load: heap at {:#010X} failed rescan: {}", base, e);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use heap::image::HeapImage;

    const HEAP_BASE: u32 = 0x4000;

    fn app_ctx() -> CpuContext {
        CpuContext { pc: 0x0002_0000, sp: 0x000F_0000 }
    }

    fn subsystem() -> MemorySubsystem {
        MemorySubsystem::new(MemoryConfig {
            dram_size: 0x2_0000,
            sram_size: 0x1_0000,
            rom_image: vec![0u8; 0x1000],
            framebuffer: None,
            os_version: OsVersion::new(3, 5),
        })
    }

    /// Install a heap image into DRAM and register it.
    fn with_heap(mem: &mut MemorySubsystem, img: HeapImage) -> u16 {
        let bytes = img.build();
        assert!(mem.load_bytes(HEAP_BASE, &bytes));
        mem.register_heap(HEAP_BASE).unwrap()
    }

    fn set_chunk_word0(mem: &mut MemorySubsystem, header_addr: u32, free: bool, lock: u8, body: u32) {
        let mut w = body & 0x00FF_FFFF;
        w |= ((lock as u32) & 0x0F) << 24;
        if free {
            w |= 0x8000_0000;
        }
        mem.load_bytes(header_addr, &w.to_be_bytes());
    }

    #[test]
    fn test_heap_header_classifies_memmgr() {
        let mut mem = subsystem();
        with_heap(&mut mem, HeapImage::new(1).chunk(0x10, false, 1));
        let ctx = app_ctx();
        for k in 0..heap::HEAP_HEADER_SIZE {
            assert_eq!(
                mem.classify(&ctx, HEAP_BASE + k, 1, true),
                ViolationKind::MemMgr
            );
        }
    }

    #[test]
    fn test_scenario_lock_transition() {
        let mut mem = subsystem();
        let id = with_heap(&mut mem, HeapImage::new(1).chunk(0x10, false, 1));
        let ctx = app_ctx();
        let (header, body) = {
            let c = &mem.heaps.by_id(id).unwrap().chunks[0];
            (c.header_range.begin, c.body_range.begin)
        };

        // Locked chunk body: open.
        assert_eq!(mem.classify(&ctx, body, 2, true), ViolationKind::Ok);
        mem.read_word(&ctx, body);
        assert!(mem.take_violations().is_empty());

        // Drop the lock count to zero and resync: same bytes now diagnose
        // as unlocked-chunk access.
        set_chunk_word0(&mut mem, header, false, 0, 0x10);
        mem.heap_changed(id).unwrap();
        assert_eq!(mem.classify(&ctx, body, 2, true), ViolationKind::UnlockedChunk);
        mem.read_word(&ctx, body);
        let v = mem.take_violations();
        assert_eq!(v.len(), 1);
        assert_eq!(v[0].kind, ViolationKind::UnlockedChunk);
        assert!(v[0].for_read);

        // Free it: free-chunk access.
        set_chunk_word0(&mut mem, header, true, 0, 0x10);
        mem.heap_changed(id).unwrap();
        assert_eq!(mem.classify(&ctx, body, 2, true), ViolationKind::FreeChunk);
    }

    #[test]
    fn test_scenario_low_mem_write() {
        let mut mem = subsystem();
        with_heap(&mut mem, HeapImage::new(1).chunk(0x10, false, 1));
        let ctx = app_ctx();

        mem.write_long(&ctx, 0x0000_0004, 0xDEAD_BEEF);
        let v = mem.take_violations();
        assert_eq!(v.len(), 1);
        assert_eq!(v[0].kind, ViolationKind::LowMem);
        assert!(!v[0].for_read);
        // The access executed regardless.
        assert_eq!(mem.peek_bytes(4, 4).unwrap(), &0xDEAD_BEEFu32.to_be_bytes());
    }

    #[test]
    fn test_scenario_below_stack_pointer() {
        let mut mem = subsystem();
        mem.set_stacks(vec![
            StackRange { bottom: 0x0001_F000, top: 0x0002_0000, low_water_mark: 0x0001_F000, boot: true },
            StackRange { bottom: 0x8800, top: 0x9000, low_water_mark: 0x8800, boot: false },
        ]);
        let ctx = CpuContext { pc: 0x0002_0000, sp: 0x8804 };

        assert_eq!(mem.classify(&ctx, 0x8800, 1, true), ViolationKind::LowStack);
        {
            let _guard = mem.full_access();
            assert_eq!(mem.classify(&ctx, 0x8800, 1, true), ViolationKind::Ok);
        }
        // Guard dropped: the prior behavior is restored exactly.
        assert_eq!(mem.classify(&ctx, 0x8800, 1, true), ViolationKind::LowStack);

        // Inside the boot stack the same geometry is exempt: the read
        // below SP goes through without a violation.
        let boot_ctx = CpuContext { pc: 0x0002_0000, sp: 0x0001_F004 };
        mem.read_byte(&boot_ctx, 0x0001_F000);
        assert!(mem.take_violations().is_empty());
    }

    #[test]
    fn test_nested_guards_restore_depth() {
        let mut mem = subsystem();
        let ctx = app_ctx();
        {
            let _outer = mem.full_access();
            {
                let _inner = mem.full_access();
                mem.read_long(&ctx, 0x0000_0000);
            }
            // Still inside the outer scope.
            mem.read_long(&ctx, 0x0000_0000);
            assert!(mem.take_violations().is_empty());
        }
        mem.read_long(&ctx, 0x0000_0000);
        assert_eq!(mem.take_violations().len(), 1);
    }

    struct TestSymbols;

    impl RomSymbols for TestSymbols {
        fn generation(&self) -> u64 {
            1
        }
        fn function_range(&self, name: &str) -> Option<AddrRange> {
            match name {
                "PrvBootChecksum" => Some(AddrRange::new(ROM_BASE + 0x100, ROM_BASE + 0x180)),
                _ => None,
            }
        }
    }

    #[test]
    fn test_scenario_bug_compat_version_gate() {
        let mut mem = subsystem();
        mem.set_rom_symbols(Box::new(TestSymbols));
        mem.set_os_version(OsVersion::new(3, 3));
        let ctx = CpuContext { pc: ROM_BASE + 0x110, sp: 0x000F_0000 };

        // Inside the checksum routine on an old OS: the null-vector read
        // is a known defect, diagnosed Ok.
        assert_eq!(mem.classify(&ctx, 0, 4, true), ViolationKind::Ok);
        mem.read_long(&ctx, 0);
        assert!(mem.take_violations().is_empty());

        // Same read on a newer OS: the gate closes.
        mem.set_os_version(OsVersion::new(4, 0));
        assert_eq!(mem.classify(&ctx, 0, 4, true), ViolationKind::LowMem);
        mem.read_long(&ctx, 0);
        assert_eq!(mem.take_violations().len(), 1);
    }

    #[test]
    fn test_screen_dirty_span() {
        let mut mem = subsystem();
        mem.set_screen_range(Some(AddrRange::new(0x0001_0000, 0x0001_3000)));
        let ctx = app_ctx();

        assert!(mem.take_dirty_span().is_none());
        mem.write_word(&ctx, 0x0001_0100, 0xFFFF);
        mem.write_byte(&ctx, 0x0001_2000, 0x01);
        assert_eq!(mem.take_dirty_span(), Some((0x0001_0100, 0x0001_2001)));
        assert!(mem.take_dirty_span().is_none());
        // Screen stores are not violations.
        assert!(mem.take_violations().is_empty());
    }

    #[test]
    fn test_unmapped_hole() {
        let mut mem = subsystem();
        let ctx = app_ctx();
        assert_eq!(mem.read_long(&ctx, 0x0800_0000), 0);
        let v = mem.take_violations();
        assert_eq!(v.len(), 1);
        assert_eq!(v[0].kind, ViolationKind::Unknown);
    }

    #[test]
    fn test_rom_store_violates_but_rom_unchanged() {
        let mut mem = subsystem();
        let ctx = app_ctx();
        mem.write_word(&ctx, ROM_BASE + 0x10, 0xBEEF);
        assert_eq!(mem.take_violations().len(), 1);
        assert_eq!(mem.peek_bytes(ROM_BASE + 0x10, 2).unwrap(), &[0, 0]);
    }

    #[test]
    fn test_memmgr_tier_may_touch_heap_structures() {
        let mut mem = subsystem();
        with_heap(&mut mem, HeapImage::new(1).chunk(0x10, true, 0));
        mem.set_allocator_ranges(vec![AddrRange::new(ROM_BASE, ROM_BASE + 0x1000)]);
        let alloc_ctx = CpuContext { pc: ROM_BASE + 0x20, sp: 0x000F_0000 };

        // The allocator reads its own chunk headers without tripping.
        mem.read_long(&alloc_ctx, HEAP_BASE + heap::HEAP_HEADER_SIZE);
        assert!(mem.take_violations().is_empty());

        // An application doing the same is flagged.
        mem.read_long(&app_ctx(), HEAP_BASE + heap::HEAP_HEADER_SIZE);
        assert_eq!(mem.take_violations().len(), 1);
    }

    #[test]
    fn test_mpt_overlay_open_to_system() {
        let mut mem = subsystem();
        let id = with_heap(&mut mem, HeapImage::new(1).chunk(0x10, false, 1));
        let mpt = mem.heaps.by_id(id).unwrap().mpts[0].range;

        // System code dereferences master pointers directly: allowed.
        mem.add_system_component(AddrRange::new(0x0001_8000, 0x0001_9000));
        let sys_ctx = CpuContext { pc: 0x0001_8010, sp: 0x000F_0000 };
        mem.read_long(&sys_ctx, mpt.begin + heap::MPT_HEADER_SIZE);
        assert!(mem.take_violations().is_empty());

        // Applications are not.
        mem.read_long(&app_ctx(), mpt.begin + heap::MPT_HEADER_SIZE);
        let v = mem.take_violations();
        assert_eq!(v.len(), 1);
        assert_eq!(v[0].kind, ViolationKind::MemMgr);
    }

    #[test]
    fn test_data_break_hits_even_under_full_access() {
        let mut mem = subsystem();
        let ctx = app_ctx();
        mem.set_data_break(0x5000);

        let _guard = mem.full_access();
        mem.write_byte(&ctx, 0x5000, 0xAA);
        let hit = mem.debugger.take_hit().unwrap();
        assert_eq!(hit.addr, 0x5000);
        assert!(!hit.for_read);
        // No violation, though: full access suppresses classification.
        assert!(mem.take_violations().is_empty());
    }

    #[test]
    fn test_instruction_break() {
        let mut mem = subsystem();
        mem.set_instruction_break(0x6000);
        assert!(mem.instruction_break_at(0x6000));
        assert!(!mem.instruction_break_at(0x6001));
        mem.clear_instruction_break(0x6000);
        assert!(!mem.instruction_break_at(0x6000));
    }

    #[test]
    fn test_dump_range_reports_nothing() {
        let mut mem = subsystem();
        with_heap(&mut mem, HeapImage::new(1).chunk(0x10, true, 0));
        let ctx = app_ctx();

        // Dumping the heap header (forbidden to apps) stays silent.
        let dump = mem.dump_range(&ctx, HEAP_BASE, 0x20);
        assert!(dump.contains("00004000:"));
        assert!(mem.take_violations().is_empty());
    }

    #[test]
    fn test_session_save_load_resyncs() {
        let mut mem = subsystem();
        let id = with_heap(&mut mem, HeapImage::new(7).chunk(0x10, false, 0));
        let body = mem.heaps.by_id(id).unwrap().chunks[0].body_range.begin;
        mem.set_os_version(OsVersion::new(3, 1));
        let blob = mem.save_session().unwrap();

        // Fresh subsystem with the same RAM contents (the emulator's own
        // session machinery restores RAM before calling us).
        let mut restored = subsystem();
        let img = HeapImage::new(7).chunk(0x10, false, 0).build();
        restored.load_bytes(HEAP_BASE, &img);
        restored.load_session(&blob).unwrap();

        assert_eq!(restored.os_version(), OsVersion::new(3, 1));
        assert_eq!(
            restored.classify(&app_ctx(), body, 2, true),
            ViolationKind::UnlockedChunk
        );
    }

    #[test]
    fn test_reset_rederives_shadow() {
        let mut mem = subsystem();
        let id = with_heap(&mut mem, HeapImage::new(1).chunk(0x10, false, 1));
        let body = mem.heaps.by_id(id).unwrap().chunks[0].body_range.begin;
        let ctx = app_ctx();

        mem.reset();
        // Locked chunk body is re-opened by the post-reset resync.
        mem.read_word(&ctx, body);
        assert!(mem.take_violations().is_empty());
        // Memory far outside any derived range stays closed.
        mem.read_word(&ctx, 0x0001_8000);
        assert_eq!(mem.take_violations().len(), 1);
    }

    #[test]
    fn test_ui_mark_unmark() {
        let mut mem = subsystem();
        let ctx = app_ctx();
        mem.register_ui_object(UiObjectKind::Window, AddrRange::new(0x7000, 0x7030));
        mem.mark_ui_objects();

        // Direct poke at an unsanctioned field offset.
        mem.write_word(&ctx, 0x7020, 1);
        let v = mem.take_violations();
        assert_eq!(v.len(), 1);
        assert_eq!(v[0].kind, ViolationKind::UiObject(UiObjectKind::Window));

        // Window bounds read is sanctioned on this OS version, so the
        // shadow trip resolves to Ok and nothing is queued.
        mem.read_word(&ctx, 0x7000);
        assert!(mem.take_violations().is_empty());

        mem.unmark_ui_objects();
        mem.write_word(&ctx, 0x7020, 1);
        assert!(mem.take_violations().is_empty());
    }

    #[test]
    fn test_access_cost_by_bank() {
        let mem = subsystem();
        assert_eq!(mem.access_cost(0x1000, AccessWidth::Word), 1);
        assert_eq!(mem.access_cost(SRAM_BASE, AccessWidth::Word), 2);
        assert_eq!(mem.access_cost(ROM_BASE, AccessWidth::Long), 4);
        assert_eq!(mem.access_cost(REG_BASE, AccessWidth::Byte), 4);
    }
}
