//! Violation classification: turning a detected illegal access into a
//! typed diagnosis.
//!
//! The access fast path only decides "violation or not"; this slow path
//! produces the rich diagnosis. Classification order matters because some
//! ranges legitimately nest inside others (the boot stack lives inside the
//! dynamic heap, UI objects live inside chunks), so the walk is strictly
//! first-match-wins. The result is then passed through the
//! bug-compatibility allow-list before anything reaches the violation
//! queue.

use crate::heap::HeapRegistry;
use crate::ui::{field_access_allowed, UiObjectKind, UiRegistry};
use crate::{AddrRange, OsVersion, StackRange};

/// Diagnosis of one emulated access. Flat taxonomy; `Ok` means the access
/// is (or has been ruled) benign.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViolationKind {
    Ok,
    Unknown,
    LowMem,
    GlobalVar,
    Screen,
    LowStack,
    FreeChunk,
    UnlockedChunk,
    MemMgr,
    UiObject(UiObjectKind),
}

/// One classified access violation, constructed on the slow path only and
/// drained by the embedder. Never retained by this core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessViolation {
    pub address: u32,
    pub size: u32,
    pub for_read: bool,
    pub kind: ViolationKind,
}

/// Everything the classifier walk consults, borrowed from the subsystem.
pub(crate) struct ClassifyInputs<'a> {
    pub low_mem: AddrRange,
    pub globals: AddrRange,
    pub screen: Option<AddrRange>,
    pub sp: u32,
    pub stacks: &'a [StackRange],
    pub heaps: &'a HeapRegistry,
    pub ui: &'a UiRegistry,
    pub os_version: OsVersion,
}

/// Is `addr` scratch space below the live stack pointer: inside a task
/// stack, under `sp`, and not in the boot stack? Stack memory is usually
/// marked fully accessible, so this is checked independently of the
/// shadow bits.
pub(crate) fn below_stack_pointer(stacks: &[StackRange], sp: u32, addr: u32) -> bool {
    stacks.iter().any(|s| {
        !s.boot && s.contains(addr) && s.contains_sp(sp) && addr < sp
    })
}

/// The classification walk. First match wins.
pub(crate) fn classify(inputs: &ClassifyInputs<'_>, addr: u32, size: u32, for_read: bool) -> ViolationKind {
    let span = AddrRange::new(addr, addr.saturating_add(size));

    // 1. Low-memory vector table.
    if inputs.low_mem.intersects(span) {
        return ViolationKind::LowMem;
    }

    // 2. System globals.
    if inputs.globals.intersects(span) {
        return ViolationKind::GlobalVar;
    }

    // 3. Screen buffer. Diagnostic only: the dirty-region notification
    //    already happened on the fast path, and the reporter decides
    //    whether screen pokes are worth surfacing.
    if let Some(screen) = inputs.screen {
        if screen.intersects(span) {
            return ViolationKind::Screen;
        }
    }

    // 4. Below the live stack pointer.
    if below_stack_pointer(inputs.stacks, inputs.sp, addr) {
        return ViolationKind::LowStack;
    }

    // 5. Registered UI object: per-kind, version-gated field policy.
    if let Some(obj) = inputs.ui.containing(addr, size) {
        let offset = addr.wrapping_sub(obj.range.begin);
        if addr >= obj.range.begin
            && field_access_allowed(obj.kind, offset, size, for_read, inputs.os_version)
        {
            return ViolationKind::Ok;
        }
        return ViolationKind::UiObject(obj.kind);
    }

    // 6. Heap structures: header, master pointer tables, chunk
    //    header/body/trailer.
    if let Some(heap) = inputs.heaps.containing(addr) {
        if heap.header_range.intersects(span) {
            return ViolationKind::MemMgr;
        }
        if heap.mpts.iter().any(|m| m.range.intersects(span)) {
            return ViolationKind::MemMgr;
        }
        for chunk in &heap.chunks {
            if !chunk.range().intersects(span) {
                continue;
            }
            if chunk.header_range.intersects(span) || chunk.trailer_range.intersects(span) {
                return ViolationKind::MemMgr;
            }
            if chunk.free {
                return ViolationKind::FreeChunk;
            }
            if chunk.lock_count == 0 {
                return ViolationKind::UnlockedChunk;
            }
            // Locked chunk body: open.
            return ViolationKind::Ok;
        }
        // Inside the heap but in no chunk: allocator slack space.
        return ViolationKind::MemMgr;
    }

    // 7. No match.
    ViolationKind::Unknown
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::image::HeapImage;
    use crate::heap::Heap;

    fn inputs<'a>(heaps: &'a HeapRegistry, ui: &'a UiRegistry, stacks: &'a [StackRange]) -> ClassifyInputs<'a> {
        ClassifyInputs {
            low_mem: AddrRange::new(0, 0x100),
            globals: AddrRange::new(0x100, 0x2000),
            screen: Some(AddrRange::new(0x000A_0000, 0x000A_3000)),
            sp: 0,
            stacks,
            heaps,
            ui,
            os_version: OsVersion::new(3, 5),
        }
    }

    #[test]
    fn test_low_mem_and_globals_first() {
        let heaps = HeapRegistry::new();
        let ui = UiRegistry::new();
        let inp = inputs(&heaps, &ui, &[]);
        assert_eq!(classify(&inp, 0x0004, 4, false), ViolationKind::LowMem);
        assert_eq!(classify(&inp, 0x0100, 2, true), ViolationKind::GlobalVar);
        // A span straddling the boundary diagnoses as the earlier range.
        assert_eq!(classify(&inp, 0x00FE, 4, true), ViolationKind::LowMem);
    }

    #[test]
    fn test_screen_is_diagnostic() {
        let heaps = HeapRegistry::new();
        let ui = UiRegistry::new();
        let inp = inputs(&heaps, &ui, &[]);
        assert_eq!(classify(&inp, 0x000A_0010, 2, false), ViolationKind::Screen);
    }

    #[test]
    fn test_low_stack() {
        let heaps = HeapRegistry::new();
        let ui = UiRegistry::new();
        let stacks = [
            StackRange { bottom: 0x8000, top: 0x9000, low_water_mark: 0x8800, boot: false },
        ];
        let mut inp = inputs(&heaps, &ui, &stacks);
        inp.sp = 0x8804;
        assert_eq!(classify(&inp, 0x8800, 1, true), ViolationKind::LowStack);
        assert_eq!(classify(&inp, 0x8804, 1, true), ViolationKind::Unknown);
    }

    #[test]
    fn test_boot_stack_exempt() {
        let heaps = HeapRegistry::new();
        let ui = UiRegistry::new();
        let stacks = [
            StackRange { bottom: 0x8000, top: 0x9000, low_water_mark: 0x8000, boot: true },
        ];
        let mut inp = inputs(&heaps, &ui, &stacks);
        inp.sp = 0x8804;
        assert_eq!(classify(&inp, 0x8800, 1, true), ViolationKind::Unknown);
    }

    #[test]
    fn test_ui_object_gating() {
        let heaps = HeapRegistry::new();
        let mut ui = UiRegistry::new();
        ui.register(UiObjectKind::Window, AddrRange::new(0x4000, 0x4030));
        let inp = inputs(&heaps, &ui, &[]);

        // bounds read: sanctioned on 3.5.
        assert_eq!(classify(&inp, 0x4000, 4, true), ViolationKind::Ok);
        // bounds write: never sanctioned.
        assert_eq!(
            classify(&inp, 0x4000, 4, false),
            ViolationKind::UiObject(UiObjectKind::Window)
        );
        // Unlisted field.
        assert_eq!(
            classify(&inp, 0x4020, 2, true),
            ViolationKind::UiObject(UiObjectKind::Window)
        );
    }

    #[test]
    fn test_heap_walk() {
        let img = HeapImage::new(1).chunk(0x10, true, 0).chunk(0x10, false, 0).chunk(0x10, false, 2).build();
        let heap = Heap::scan(&img, 0x4000).unwrap();
        let free_body = heap.chunks[0].body_range.begin;
        let unlocked_body = heap.chunks[1].body_range.begin;
        let locked_body = heap.chunks[2].body_range.begin;
        let header = heap.chunks[0].header_range.begin;

        let mut heaps = HeapRegistry::new();
        heaps.insert(heap);
        let ui = UiRegistry::new();
        let inp = inputs(&heaps, &ui, &[]);

        assert_eq!(classify(&inp, 0x4000, 2, true), ViolationKind::MemMgr); // heap header
        assert_eq!(classify(&inp, header, 4, true), ViolationKind::MemMgr); // chunk header
        assert_eq!(classify(&inp, free_body, 2, true), ViolationKind::FreeChunk);
        assert_eq!(classify(&inp, unlocked_body, 2, true), ViolationKind::UnlockedChunk);
        assert_eq!(classify(&inp, locked_body, 2, true), ViolationKind::Ok);
    }

    #[test]
    fn test_unknown_outside_everything() {
        let heaps = HeapRegistry::new();
        let ui = UiRegistry::new();
        let inp = inputs(&heaps, &ui, &[]);
        assert_eq!(classify(&inp, 0x00F0_0000, 4, true), ViolationKind::Unknown);
    }
}
