//! Memory regions: local registrations and remote descriptors.

mod remote;
mod usage;

use std::cell::UnsafeCell;
use std::ffi::c_void;
use std::fmt;
use std::marker::PhantomData;
use std::mem::ManuallyDrop;
use std::ptr::{self, NonNull};

use rdma_sys::*;

pub use self::remote::*;
pub use self::usage::*;
use crate::err::{self, Error, Result};
use crate::peer::Peer;
use crate::types::{LKey, RKey};

/// Local memory region.
///
/// A memory region is a span of process virtual memory registered with the
/// provider so that the NIC may access it by key. The memory itself stays
/// owned by the caller and must outlive the registration (`'mem`).
///
/// A region registered as a read destination can have its content modified by
/// the NIC even though this type only borrows the buffer immutably.
pub struct Mr<'mem> {
    peer: Peer,
    mr: NonNull<ibv_mr>,
    usage: Usage,
    _marker: PhantomData<&'mem UnsafeCell<[u8]>>,
}

// SAFETY: the provider permits sharing registrations across threads;
// registration and deregistration consume `self` and cannot race inspection.
unsafe impl Send for Mr<'_> {}
unsafe impl Sync for Mr<'_> {}

impl<'mem> Mr<'mem> {
    /// Register a memory region with the given peer's protection domain.
    ///
    /// The access flags are derived from `usage`; an empty or unknown usage
    /// combination and a zero-length buffer are invalid. `placement` other
    /// than [`Placement::Volatile`] is reported as not supported.
    pub fn reg(peer: &Peer, buf: &'mem [u8], usage: Usage, placement: Placement) -> Result<Self> {
        // SAFETY: address, length and lifetime all come from the same slice.
        unsafe { Self::reg_with_ref(peer, buf.as_ptr() as *mut u8, buf.len(), usage, placement, buf) }
    }

    /// Register a memory region with the memory reference decoupled into a
    /// raw pointer, a length, and a lifetime provider.
    ///
    /// # Safety
    ///
    /// The memory area `[addr..addr + len)` must be valid and outlive the
    /// lifetime provided by `_marker`.
    pub unsafe fn reg_with_ref<Marker>(
        peer: &Peer,
        addr: *mut u8,
        len: usize,
        usage: Usage,
        placement: Placement,
        _marker: &'mem Marker,
    ) -> Result<Self>
    where
        Marker: ?Sized,
    {
        usage.validate()?;
        if addr.is_null() || len == 0 {
            return Err(Error::Inval);
        }
        if placement != Placement::Volatile {
            return Err(Error::NoSupp);
        }

        // SAFETY: FFI.
        let mr = ibv_reg_mr(
            peer.as_raw_pd(),
            addr as *mut c_void,
            len,
            usage.to_access().0 as i32,
        );
        let mr = NonNull::new(mr).ok_or_else(|| err::last_os("ibv_reg_mr"))?;

        Ok(Self {
            peer: peer.clone(),
            mr,
            usage,
            _marker: PhantomData,
        })
    }

    /// Deregister the memory region.
    ///
    /// The caller must guarantee that no outstanding work request names this
    /// region; the provider's failure to deregister is surfaced and the
    /// region handed back for a retry.
    pub fn dereg(self) -> std::result::Result<(), (Self, Error)> {
        let this = ManuallyDrop::new(self);
        // SAFETY: FFI.
        let ret = unsafe { ibv_dereg_mr(this.mr.as_ptr()) };
        if ret == 0 {
            // Release the peer back-reference without running `Mr::drop`.
            // SAFETY: `this` is never touched again.
            drop(unsafe { ptr::read(&this.peer) });
            Ok(())
        } else {
            Err((ManuallyDrop::into_inner(this), err::provider(ret, "ibv_dereg_mr")))
        }
    }

    /// Get the underlying `ibv_mr` pointer.
    #[inline]
    pub(crate) fn as_raw(&self) -> *mut ibv_mr {
        self.mr.as_ptr()
    }

    /// Get the start address of the registered memory area.
    #[inline]
    pub fn addr(&self) -> *mut u8 {
        // SAFETY: the pointed-to `ibv_mr` instance is valid.
        unsafe { (*self.as_raw()).addr as *mut u8 }
    }

    /// Get the length of the registered memory area.
    #[allow(clippy::len_without_is_empty)]
    #[inline]
    pub fn len(&self) -> usize {
        // SAFETY: the pointed-to `ibv_mr` instance is valid.
        unsafe { (*self.as_raw()).length }
    }

    /// Get the local key of the memory region.
    #[inline]
    pub fn lkey(&self) -> LKey {
        // SAFETY: the pointed-to `ibv_mr` instance is valid.
        unsafe { (*self.as_raw()).lkey }
    }

    /// Get the remote key of the memory region.
    #[inline]
    pub fn rkey(&self) -> RKey {
        // SAFETY: the pointed-to `ibv_mr` instance is valid.
        unsafe { (*self.as_raw()).rkey }
    }

    /// Get the permitted usages of the memory region.
    #[inline]
    pub fn usage(&self) -> Usage {
        self.usage
    }

    /// View this local region as a remote region, for handing to peers.
    #[inline]
    pub fn as_remote(&self) -> RemoteMr {
        RemoteMr::new(self.addr() as u64, self.len(), self.rkey(), self.usage)
    }

    /// Serialize into the fixed wire descriptor a peer can decode with
    /// [`RemoteMr::from_descriptor`].
    #[inline]
    pub fn descriptor(&self) -> [u8; DESCRIPTOR_SIZE] {
        self.as_remote().to_descriptor()
    }
}

impl Drop for Mr<'_> {
    fn drop(&mut self) {
        // SAFETY: call only once, and no UAF since I will be dropped.
        if unsafe { ibv_dereg_mr(self.mr.as_ptr()) } != 0 {
            log::warn!("cannot dereg MR on drop");
        }
    }
}

impl fmt::Debug for Mr<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mr")
            .field("addr", &self.addr())
            .field("len", &self.len())
            .field("usage", &self.usage)
            .finish()
    }
}
