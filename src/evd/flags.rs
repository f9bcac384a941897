use std::fmt;
use std::ops::{Add, AddAssign, BitAnd, BitAndAssign, BitOr, BitOrAssign, Sub, SubAssign};

/// Kinds of events an EVD accepts.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(transparent)]
pub struct EvdFlags(u32);

impl EvdFlags {
    pub const EMPTY: Self = Self(0);
    pub const SOFTWARE: Self = Self(0x01);
    pub const CR: Self = Self(0x10);
    pub const DTO: Self = Self(0x20);
    pub const CONNECTION: Self = Self(0x40);
    pub const RMR_BIND: Self = Self(0x80);
    pub const ASYNC: Self = Self(0x100);

    pub const ALL: Self = Self(0x1f1);

    /// Get the raw bits.
    #[inline]
    pub fn bits(self) -> u32 {
        self.0
    }

    /// Build from raw bits, dropping unknown ones.
    #[inline]
    pub fn from_bits_truncate(bits: u32) -> Self {
        Self(bits & Self::ALL.0)
    }

    /// Whether every flag in `other` is set.
    #[inline]
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Whether any flag in `other` is set.
    #[inline]
    pub fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    #[inline]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Whether events of these kinds come out of a completion queue.
    #[inline]
    pub fn needs_cq(self) -> bool {
        self.intersects(Self::DTO + Self::RMR_BIND)
    }
}

impl fmt::Debug for EvdFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(EvdFlags, &str); 6] = [
            (EvdFlags::SOFTWARE, "SOFTWARE"),
            (EvdFlags::CR, "CR"),
            (EvdFlags::DTO, "DTO"),
            (EvdFlags::CONNECTION, "CONNECTION"),
            (EvdFlags::RMR_BIND, "RMR_BIND"),
            (EvdFlags::ASYNC, "ASYNC"),
        ];
        let mut list = f.debug_set();
        for (flag, name) in NAMES {
            if self.contains(flag) {
                list.entry(&format_args!("{}", name));
            }
        }
        list.finish()
    }
}

impl Add for EvdFlags {
    type Output = Self;

    fn add(self, rhs: Self) -> Self::Output {
        Self(self.0 | rhs.0)
    }
}

impl AddAssign for EvdFlags {
    fn add_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl Sub for EvdFlags {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self::Output {
        Self(self.0 & !rhs.0)
    }
}

impl SubAssign for EvdFlags {
    fn sub_assign(&mut self, rhs: Self) {
        self.0 &= !rhs.0;
    }
}

impl BitAnd for EvdFlags {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self::Output {
        Self(self.0 & rhs.0)
    }
}

impl BitAndAssign for EvdFlags {
    fn bitand_assign(&mut self, rhs: Self) {
        self.0 &= rhs.0;
    }
}

impl BitOr for EvdFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self::Output {
        self + rhs
    }
}

impl BitOrAssign for EvdFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        *self += rhs;
    }
}
