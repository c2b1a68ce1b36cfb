//! Identifiers for objects hosted by a worker
//!
//! Usocks and owner machines live in per-worker registries and are
//! addressed by id rather than by reference. Ids come from a per-worker
//! monotonic counter and are never reused, so a stale id simply fails
//! to resolve instead of aliasing a newer object.

use core::fmt;

/// Identifier of a usock within its worker
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct UsockId(u64);

/// Identifier of an owner machine within its worker
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct MachineId(u64);

macro_rules! impl_id {
    ($name:ident, $tag:literal) => {
        impl $name {
            #[inline]
            pub const fn new(raw: u64) -> Self {
                $name(raw)
            }

            #[inline]
            pub const fn as_u64(self) -> u64 {
                self.0
            }
        }

        impl From<u64> for $name {
            #[inline]
            fn from(raw: u64) -> Self {
                $name(raw)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({})"), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($tag, "#{}"), self.0)
            }
        }
    };
}

impl_id!(UsockId, "usock");
impl_id!(MachineId, "machine");
