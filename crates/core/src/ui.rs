//! UI-object registry and the direct-field-access policy.
//!
//! The guest OS keeps windows, forms, and widgets as plain structs in the
//! dynamic heap, and early applications poked their fields directly. Later
//! OS releases replaced direct access with accessor traps, so whether a
//! given field touch is legitimate depends on the running OS version.
//!
//! The UI-registry collaborator reports live objects; each access into one
//! is checked against a per-kind allow-list of field windows, every entry
//! gated by the last OS version on which direct access was still
//! sanctioned.

use crate::{AddrRange, OsVersion};

/// Kinds of guest UI objects with distinct field rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UiObjectKind {
    Field,
    Control,
    List,
    Table,
    Bitmap,
    Window,
    Form,
}

/// One live UI object reported by the registry collaborator.
#[derive(Debug, Clone)]
pub struct UiObject {
    pub kind: UiObjectKind,
    pub range: AddrRange,
}

/// An allowed direct-access window into a UI struct.
///
/// `begin`/`end` are byte offsets from the object start; `max_version` is
/// the last OS release on which the access is sanctioned.
struct FieldRule {
    member: &'static str,
    begin: u32,
    end: u32,
    reads_only: bool,
    max_version: OsVersion,
}

const V3_1: OsVersion = OsVersion::new(3, 1);
const V3_5: OsVersion = OsVersion::new(3, 5);
const V4_0: OsVersion = OsVersion::new(4, 0);

const WINDOW_RULES: &[FieldRule] = &[
    FieldRule { member: "bounds", begin: 0, end: 8, reads_only: true, max_version: V4_0 },
    FieldRule { member: "flags", begin: 8, end: 10, reads_only: true, max_version: V4_0 },
    FieldRule { member: "bitmapP", begin: 12, end: 16, reads_only: true, max_version: V3_5 },
];

const FORM_RULES: &[FieldRule] = &[
    FieldRule { member: "bounds", begin: 0, end: 8, reads_only: true, max_version: V4_0 },
    FieldRule { member: "formId", begin: 10, end: 12, reads_only: true, max_version: V4_0 },
    FieldRule { member: "focusIndex", begin: 16, end: 18, reads_only: false, max_version: V3_5 },
];

const FIELD_RULES: &[FieldRule] = &[
    FieldRule { member: "id", begin: 0, end: 2, reads_only: true, max_version: V4_0 },
    FieldRule { member: "rect", begin: 2, end: 10, reads_only: true, max_version: V3_5 },
    FieldRule { member: "textHandle", begin: 16, end: 20, reads_only: true, max_version: V3_1 },
];

const CONTROL_RULES: &[FieldRule] = &[
    FieldRule { member: "id", begin: 0, end: 2, reads_only: true, max_version: V4_0 },
    FieldRule { member: "style", begin: 10, end: 11, reads_only: true, max_version: V4_0 },
];

const LIST_RULES: &[FieldRule] = &[
    FieldRule { member: "bounds", begin: 0, end: 8, reads_only: true, max_version: V3_5 },
];

const TABLE_RULES: &[FieldRule] = &[
    FieldRule { member: "id", begin: 0, end: 2, reads_only: true, max_version: V3_5 },
];

const BITMAP_RULES: &[FieldRule] = &[
    FieldRule { member: "dimensions", begin: 0, end: 4, reads_only: true, max_version: V4_0 },
    FieldRule { member: "rowBytes", begin: 4, end: 6, reads_only: true, max_version: V3_5 },
];

fn rules_for(kind: UiObjectKind) -> &'static [FieldRule] {
    match kind {
        UiObjectKind::Window => WINDOW_RULES,
        UiObjectKind::Form => FORM_RULES,
        UiObjectKind::Field => FIELD_RULES,
        UiObjectKind::Control => CONTROL_RULES,
        UiObjectKind::List => LIST_RULES,
        UiObjectKind::Table => TABLE_RULES,
        UiObjectKind::Bitmap => BITMAP_RULES,
    }
}

/// Is a direct access of `size` bytes at byte offset `offset` into an
/// object of `kind` sanctioned on OS `os`?
pub fn field_access_allowed(
    kind: UiObjectKind,
    offset: u32,
    size: u32,
    for_read: bool,
    os: OsVersion,
) -> bool {
    rules_for(kind).iter().any(|r| {
        offset >= r.begin
            && offset + size <= r.end
            && (for_read || !r.reads_only)
            && os <= r.max_version
    })
}

/// Live UI objects, refreshed by the registry collaborator.
#[derive(Default)]
pub struct UiRegistry {
    objects: Vec<UiObject>,
}

impl UiRegistry {
    pub fn new() -> Self {
        UiRegistry { objects: Vec::new() }
    }

    pub fn register(&mut self, kind: UiObjectKind, range: AddrRange) {
        self.objects.push(UiObject { kind, range });
    }

    pub fn clear(&mut self) {
        self.objects.clear();
    }

    /// Object whose range intersects the access span, if any.
    pub fn containing(&self, addr: u32, size: u32) -> Option<&UiObject> {
        self.objects
            .iter()
            .find(|o| o.range.intersects(AddrRange::new(addr, addr + size)))
    }

    pub fn iter(&self) -> impl Iterator<Item = &UiObject> {
        self.objects.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}
