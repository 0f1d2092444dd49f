//! Type aliases for RDMA-related quantities.

/// Local key (LKey) is a [`u32`] that names a local memory region in a work request.
pub type LKey = u32;

/// Remote key (RKey) is a [`u32`] that names a remote memory region in a work request.
pub type RKey = u32;

/// Work request identifier (WrId) is a [`u64`] designated by the user to
/// identify a work request; completions carry it back verbatim.
pub type WrId = u64;

/// Re-export of [`rdma_sys`] types.
pub mod sys {
    pub use rdma_sys::*;
}
