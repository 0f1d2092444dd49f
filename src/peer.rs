//! Peer: protection-domain owner and root of the object graph.

use std::io::Error as IoError;
use std::ptr::{self, NonNull};
use std::sync::Arc;
use std::{fmt, mem};

use rdma_sys::*;

use crate::cfg::ConnCfg;
use crate::cm::CmId;
use crate::cq::Cq;
use crate::ctx::Context;
use crate::err::{self, Error, Result};

/// Wrapper for `*mut ibv_pd`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub(crate) struct IbvPd(NonNull<ibv_pd>);

impl IbvPd {
    /// Deallocate the PD.
    ///
    /// # Safety
    ///
    /// - A PD must not be deallocated more than once.
    /// - Deallocated PDs must not be used anymore.
    pub unsafe fn dealloc(self) -> Result<()> {
        // SAFETY: FFI.
        let ret = ibv_dealloc_pd(self.as_ptr());
        if ret == 0 {
            Ok(())
        } else {
            Err(err::provider(ret, "ibv_dealloc_pd"))
        }
    }
}

impl_raw_handle!(IbvPd => ibv_pd);

/// Ownership holder of the protection domain.
struct PeerInner {
    ctx: Context,
    pd: IbvPd,
}

impl Drop for PeerInner {
    fn drop(&mut self) {
        // Last-resort cleanup; `Peer::close` is the reporting path.
        // SAFETY: call only once, and no UAF since I will be dropped.
        if unsafe { self.pd.dealloc() }.is_err() {
            log::warn!("cannot dealloc PD on drop");
        }
    }
}

/// A peer: one protection domain bound to one device context.
///
/// The peer is the sole factory for memory regions, connection requests, and
/// endpoints; every derived object holds a back-reference to it and must be
/// destroyed first.
pub struct Peer {
    inner: Arc<PeerInner>,
    pd: IbvPd,
}

impl Peer {
    /// Make a clone of the `Arc` pointer.
    pub(crate) fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            pd: self.pd,
        }
    }
}

impl Peer {
    /// Allocate a protection domain for the given device context.
    ///
    /// A provider-reported `ENOMEM` maps to [`Error::NoMem`] so callers can
    /// retry allocation failures uniformly.
    pub fn new(ctx: &Context) -> Result<Self> {
        // SAFETY: FFI.
        let pd = unsafe { ibv_alloc_pd(ctx.as_raw()) };
        let Some(pd) = NonNull::new(pd) else {
            return Err(match IoError::last_os_error().raw_os_error() {
                Some(0) | None => Error::Unknown,
                Some(libc::ENOMEM) => {
                    err::capture(libc::ENOMEM, "ibv_alloc_pd");
                    Error::NoMem
                }
                Some(errno) => err::provider(errno, "ibv_alloc_pd"),
            });
        };
        let pd = IbvPd(pd);

        Ok(Self {
            inner: Arc::new(PeerInner { ctx: *ctx, pd }),
            pd,
        })
    }

    /// Tear down the protection domain.
    ///
    /// Fails with [`Error::Provider`] (errno `EBUSY`) while memory regions,
    /// requests, connections, or endpoints derived from this peer are alive;
    /// the peer is handed back so the caller can retry after releasing them.
    pub fn close(self) -> std::result::Result<(), (Peer, Error)> {
        match Arc::try_unwrap(self.inner) {
            Ok(inner) => {
                let ctx = inner.ctx;
                let pd = inner.pd;
                // Deallocation is reported here, not via `PeerInner::drop`.
                mem::forget(inner);
                // SAFETY: the last reference was just consumed.
                match unsafe { pd.dealloc() } {
                    Ok(()) => Ok(()),
                    Err(e) => Err((
                        Peer {
                            inner: Arc::new(PeerInner { ctx, pd }),
                            pd,
                        },
                        e,
                    )),
                }
            }
            Err(inner) => {
                let e = err::provider(libc::EBUSY, "ibv_dealloc_pd");
                Err((Peer { pd: inner.pd, inner }, e))
            }
        }
    }

    /// Get the underlying `ibv_pd` pointer.
    #[inline]
    pub(crate) fn as_raw_pd(&self) -> *mut ibv_pd {
        self.pd.as_ptr()
    }

    /// Get the underlying device [`Context`].
    #[inline]
    pub fn context(&self) -> &Context {
        &self.inner.ctx
    }

    /// Create a reliable-connected queue pair on the identifier, within this
    /// peer's protection domain. The identifier owns the queue pair.
    pub(crate) fn create_qp(&self, id: CmId, cq: &Cq, cfg: &ConnCfg) -> Result<()> {
        let mut attr = ibv_qp_init_attr {
            qp_context: ptr::null_mut(),
            send_cq: cq.as_raw(),
            recv_cq: cq.as_raw(),
            srq: ptr::null_mut(),
            cap: ibv_qp_cap {
                max_send_wr: cfg.sq_size,
                max_recv_wr: cfg.rq_size,
                max_send_sge: 1,
                max_recv_sge: 1,
                max_inline_data: 0,
            },
            qp_type: ibv_qp_type::IBV_QPT_RC,
            sq_sig_all: 0,
        };
        // SAFETY: FFI; `attr` outlives the call.
        let ret = unsafe { rdma_create_qp(id.as_ptr(), self.as_raw_pd(), &mut attr) };
        err::from_c_ret(ret, "rdma_create_qp")
    }
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!("Peer<{:p}>", self.pd.as_ptr()))
    }
}
