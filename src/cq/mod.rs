//! Completion queue and work completion.
//!
//! Every connection owns one [`Cq`]: a completion queue paired with its
//! completion channel, so a connection can be torn down without racing other
//! connections' completions.

mod comp;

use std::ptr::{self, NonNull};
use std::{fmt, mem};

use rdma_sys::*;

pub use self::comp::*;
use crate::ctx::Context;
use crate::err::{self, Result};

/// A completion queue and the completion channel it notifies through.
pub(crate) struct Cq {
    channel: NonNull<ibv_comp_channel>,
    cq: NonNull<ibv_cq>,
}

// SAFETY: the provider allows sharing CQs and completion channels across
// threads; the single-consumer discipline is enforced by the owning types.
unsafe impl Send for Cq {}
unsafe impl Sync for Cq {}

impl Cq {
    /// Create a completion queue of the given depth with a fresh completion
    /// channel, armed for the first notification.
    pub fn new(ctx: &Context, depth: u32) -> Result<Self> {
        // SAFETY: FFI.
        let channel = unsafe { ibv_create_comp_channel(ctx.as_raw()) };
        let channel =
            NonNull::new(channel).ok_or_else(|| err::last_os("ibv_create_comp_channel"))?;

        // SAFETY: FFI.
        let cq = unsafe {
            ibv_create_cq(
                ctx.as_raw(),
                depth as i32,
                ptr::null_mut(),
                channel.as_ptr(),
                0,
            )
        };
        let Some(cq) = NonNull::new(cq) else {
            let e = err::last_os("ibv_create_cq");
            // SAFETY: created above, not yet shared.
            unsafe { ibv_destroy_comp_channel(channel.as_ptr()) };
            return Err(e);
        };

        let this = Self { channel, cq };
        this.arm()?;
        Ok(this)
    }

    /// Get the underlying `ibv_cq` pointer.
    pub fn as_raw(&self) -> *mut ibv_cq {
        self.cq.as_ptr()
    }

    /// Request a notification for the next completion.
    pub fn arm(&self) -> Result<()> {
        // SAFETY: FFI.
        let ret = unsafe { ibv_req_notify_cq(self.cq.as_ptr(), 0) };
        if ret == 0 {
            Ok(())
        } else {
            Err(err::provider(ret, "ibv_req_notify_cq"))
        }
    }

    /// Non-blockingly poll one work completion.
    pub fn poll_one(&self) -> Result<Option<ibv_wc>> {
        // SAFETY: POD type.
        let mut wc: ibv_wc = unsafe { mem::zeroed() };
        // SAFETY: FFI; `wc` outlives the call.
        let num = unsafe { ibv_poll_cq(self.cq.as_ptr(), 1, &mut wc) };
        match num {
            0 => Ok(None),
            1.. => Ok(Some(wc)),
            _ => Err(err::provider(-num, "ibv_poll_cq")),
        }
    }

    /// Block until the completion channel fires, acknowledge the event, and
    /// re-arm the queue.
    pub fn wait(&self) -> Result<()> {
        let mut cq = ptr::null_mut();
        let mut cq_ctx = ptr::null_mut();
        // SAFETY: FFI.
        let ret = unsafe { ibv_get_cq_event(self.channel.as_ptr(), &mut cq, &mut cq_ctx) };
        err::from_c_ret(ret, "ibv_get_cq_event")?;
        // SAFETY: FFI; acknowledging the event just received.
        unsafe { ibv_ack_cq_events(self.cq.as_ptr(), 1) };
        self.arm()
    }

    /// Discard everything currently queued. Returns the number of discarded
    /// completions.
    pub fn drain(&self) -> usize {
        let mut n = 0;
        while let Ok(Some(_)) = self.poll_one() {
            n += 1;
        }
        n
    }
}

impl Drop for Cq {
    fn drop(&mut self) {
        // SAFETY: call only once, and no UAF since I will be dropped. The CQ
        // goes first; the channel must outlive the queues it notifies for.
        unsafe {
            if ibv_destroy_cq(self.cq.as_ptr()) != 0 {
                log::warn!("cannot destroy CQ on drop");
            }
            if ibv_destroy_comp_channel(self.channel.as_ptr()) != 0 {
                log::warn!("cannot destroy completion channel on drop");
            }
        }
    }
}

impl fmt::Debug for Cq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!("Cq<{:p}>", self.as_raw()))
    }
}
