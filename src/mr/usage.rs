use std::ops::{BitAnd, BitAndAssign, BitOr, BitOrAssign};

use rdma_sys::ibv_access_flags;

use crate::err::{Error, Result};

/// Permitted usages of a memory region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[repr(transparent)]
pub struct Usage(u8);

impl Usage {
    /// Remote peers may read from this region.
    pub const READ_SRC: Self = Self(1 << 0);

    /// Local reads may land into this region.
    pub const READ_DST: Self = Self(1 << 1);

    /// Bits defined so far; the rest are reserved for future operation kinds.
    const DEFINED: u8 = Self::READ_SRC.0 | Self::READ_DST.0;

    /// Get the raw bitmask, as it travels in the wire descriptor.
    #[inline]
    pub fn bits(self) -> u8 {
        self.0
    }

    /// Rebuild a bitmask from its wire form, verbatim.
    #[inline]
    pub(crate) fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    /// Whether every bit of `other` is set in `self`.
    #[inline]
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Registration accepts only known, non-empty combinations.
    pub(crate) fn validate(self) -> Result<()> {
        if self.0 == 0 || self.0 & !Self::DEFINED != 0 {
            return Err(Error::Inval);
        }
        Ok(())
    }

    /// Translate into provider access flags: a read source must be remotely
    /// readable, a read destination must be locally writable by the NIC.
    pub(crate) fn to_access(self) -> ibv_access_flags {
        let mut access = ibv_access_flags(0);
        if self.contains(Self::READ_SRC) {
            access |= ibv_access_flags::IBV_ACCESS_REMOTE_READ;
        }
        if self.contains(Self::READ_DST) {
            access |= ibv_access_flags::IBV_ACCESS_LOCAL_WRITE;
        }
        access
    }
}

impl BitOr for Usage {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self::Output {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for Usage {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for Usage {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self::Output {
        Self(self.0 & rhs.0)
    }
}

impl BitAndAssign for Usage {
    fn bitand_assign(&mut self, rhs: Self) {
        self.0 &= rhs.0;
    }
}

/// Placement hint for a registered region.
///
/// Only [`Placement::Volatile`] registers today; persistence-aware
/// registration is reserved until the provider side is defined, and reports
/// [`Error::NoSupp`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// Plain registration of volatile memory.
    #[default]
    Volatile,
    /// Persistence-aware registration of persistent memory.
    Persistent,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn access_flags_mapping() {
        assert_eq!(
            Usage::READ_SRC.to_access(),
            ibv_access_flags::IBV_ACCESS_REMOTE_READ
        );
        assert_eq!(
            Usage::READ_DST.to_access(),
            ibv_access_flags::IBV_ACCESS_LOCAL_WRITE
        );
        assert_eq!(
            (Usage::READ_SRC | Usage::READ_DST).to_access(),
            ibv_access_flags::IBV_ACCESS_REMOTE_READ | ibv_access_flags::IBV_ACCESS_LOCAL_WRITE
        );
    }

    #[test]
    fn validation() {
        assert!(Usage::READ_SRC.validate().is_ok());
        assert!((Usage::READ_SRC | Usage::READ_DST).validate().is_ok());
        assert_eq!(Usage::from_bits(0).validate(), Err(Error::Inval));
        assert_eq!(Usage::from_bits(1 << 5).validate(), Err(Error::Inval));
    }

    #[test]
    fn contains() {
        let both = Usage::READ_SRC | Usage::READ_DST;
        assert!(both.contains(Usage::READ_SRC));
        assert!(both.contains(Usage::READ_DST));
        assert!(!Usage::READ_SRC.contains(Usage::READ_DST));
    }
}
