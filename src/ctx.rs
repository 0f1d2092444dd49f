//! Device context.

use std::fmt;
use std::ptr::NonNull;

use rdma_sys::*;

use crate::cm::CmId;
use crate::err::{self, Error, Result};
use crate::utils::interop;

/// How a resolved address is going to be used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddrUse {
    /// The address is local: a listening endpoint will bind to it.
    Local,
    /// The address is remote: an outgoing connection will target it.
    Remote,
}

/// An RDMA-capable device context.
///
/// The context is borrowed from the provider's device list and is not owned
/// by this type; it stays valid for the lifetime of the process (or until the
/// device is removed), so `Context` is freely copyable.
#[derive(Clone, Copy)]
pub struct Context {
    ctx: NonNull<ibv_context>,
}

// SAFETY: the underlying `ibv_context` may be shared across threads.
unsafe impl Send for Context {}
unsafe impl Sync for Context {}

impl Context {
    const RESOLVE_TIMEOUT_MS: i32 = 1000;

    /// Look up the device context behind a textual network address.
    ///
    /// A throwaway synchronous communication identifier is bound to the
    /// address ([`AddrUse::Local`]) or resolves it ([`AddrUse::Remote`]); the
    /// device the connection manager picked is the result.
    pub fn resolve(addr: &str, usage: AddrUse) -> Result<Self> {
        let sa = interop::resolve_sockaddr(addr, "0")?;
        let id = CmId::create_sync()?;
        let res = match usage {
            AddrUse::Local => id.bind_addr(&sa),
            AddrUse::Remote => id.resolve_addr(&sa, Self::RESOLVE_TIMEOUT_MS),
        };
        let verbs = id.verbs();
        // SAFETY: created above, used no further.
        let destroyed = unsafe { id.destroy() };
        res?;
        destroyed?;
        NonNull::new(verbs).map(|ctx| Self { ctx }).ok_or(Error::Unknown)
    }

    /// Wrap a raw device context obtained elsewhere.
    ///
    /// # Safety
    ///
    /// `ctx` must point to a live `ibv_context` that outlives every object
    /// derived from the returned `Context`.
    pub unsafe fn from_raw(ctx: *mut ibv_context) -> Result<Self> {
        NonNull::new(ctx).map(|ctx| Self { ctx }).ok_or(Error::Inval)
    }

    /// Get the underlying `ibv_context` pointer.
    #[inline]
    pub fn as_raw(&self) -> *mut ibv_context {
        self.ctx.as_ptr()
    }

    /// Query device attributes.
    pub(crate) fn query_device(&self) -> Result<ibv_device_attr> {
        // SAFETY: POD type.
        let mut attr: ibv_device_attr = unsafe { std::mem::zeroed() };
        // SAFETY: FFI.
        let ret = unsafe { ibv_query_device(self.as_raw(), &mut attr) };
        if ret == 0 {
            Ok(attr)
        } else {
            Err(err::provider(ret, "ibv_query_device"))
        }
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!("Context<{:p}>", self.as_raw()))
    }
}
