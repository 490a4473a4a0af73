// Shared identifiers used across the lock manager.
//
// Kept deliberately small: this crate has a single subsystem, so `common`
// only needs the identifier types every other module refers to.

use std::fmt;

/// Identifier for a job (transaction) interacting with the lock manager.
///
/// Kept as a plain `i32` rather than a newtype because jobs are supplied by
/// the caller (the transaction subsystem) and never decoded internally the
/// way slot ids are.
pub type JobId = i32;

/// Opaque 64-bit identifier for an arena-allocated record (`Resource`,
/// `Request`, or `Job`). `SlotId::NONE` is the sentinel "no slot" value.
///
/// Arenas decode a `SlotId` into a (chunk, offset) pair internally; callers
/// must never construct one except via `SlotArena::allocate` or by reading
/// it back out of a record field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotId(i64);

impl SlotId {
    /// The sentinel value denoting "no slot".
    pub const NONE: SlotId = SlotId(-1);

    #[inline]
    pub(crate) fn new(raw: i64) -> Self {
        debug_assert!(raw >= 0, "slot ids must be non-negative");
        SlotId(raw)
    }

    #[inline]
    pub fn is_none(&self) -> bool {
        self.0 < 0
    }

    #[inline]
    pub fn is_some(&self) -> bool {
        !self.is_none()
    }

    #[inline]
    pub(crate) fn raw(&self) -> i64 {
        self.0
    }
}

impl Default for SlotId {
    fn default() -> Self {
        SlotId::NONE
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            write!(f, "<none>")
        } else {
            write!(f, "#{}", self.0)
        }
    }
}
