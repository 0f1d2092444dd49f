//! Connections: live queue pairs with their dedicated completion queues.

mod req;

use std::ops::{BitOr, BitOrAssign};
use std::ptr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Mutex;
use std::{fmt, mem};

use rdma_sys::*;

pub use self::req::ConnReq;
use crate::cm::{CmId, EventChannel};
use crate::cq::{Completion, Cq};
use crate::err::{self, Error, Result};
use crate::mr::{Mr, RemoteMr, Usage};
use crate::peer::Peer;
use crate::types::WrId;

/// Flags modifying a posted operation. The unset bits are reserved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct PostFlags(u32);

impl PostFlags {
    /// No flags: the transport may elide the completion.
    pub const NONE: Self = Self(0);

    /// Generate a completion even where the underlying transport could
    /// elide it.
    pub const WAIT_FOR_COMPLETION: Self = Self(1 << 0);

    /// Whether every bit of `other` is set in `self`.
    #[inline]
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for PostFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self::Output {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for PostFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// Lifecycle event of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnEvent {
    /// The handshake completed; private data is available.
    Established,
    /// The connection was shut down in an orderly way by either side.
    Closed,
    /// The connection was torn down by an abnormal path (rejection,
    /// unreachable peer, device removal).
    Lost,
}

/// Internal lifecycle state. A remote-initiated close is indistinguishable
/// from a local one at this level: the provider delivers the same
/// `DISCONNECTED` event for both, so the close-initiated states of the
/// conceptual machine collapse into one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum State {
    Established = 0,
    CloseInitiated = 1,
    Closed = 2,
    Lost = 3,
}

impl From<u8> for State {
    fn from(v: u8) -> Self {
        match v {
            0 => State::Established,
            1 => State::CloseInitiated,
            2 => State::Closed,
            _ => State::Lost,
        }
    }
}

/// Advance the state machine by one connection-manager event. Returns the new
/// state and the event to deliver, if any; `None` means the event is
/// swallowed.
fn transition(state: State, event: rdma_cm_event_type::Type) -> (State, Option<ConnEvent>) {
    match event {
        // `connect` already consumed the handshake; repeats are duplicates.
        rdma_cm_event_type::RDMA_CM_EVENT_ESTABLISHED => (state, None),

        rdma_cm_event_type::RDMA_CM_EVENT_DISCONNECTED => match state {
            State::Closed | State::Lost => (state, None),
            _ => (State::Closed, Some(ConnEvent::Closed)),
        },

        rdma_cm_event_type::RDMA_CM_EVENT_CONNECT_ERROR
        | rdma_cm_event_type::RDMA_CM_EVENT_UNREACHABLE
        | rdma_cm_event_type::RDMA_CM_EVENT_REJECTED
        | rdma_cm_event_type::RDMA_CM_EVENT_DEVICE_REMOVAL => match state {
            State::Lost => (state, None),
            _ => (State::Lost, Some(ConnEvent::Lost)),
        },

        _ => (state, None),
    }
}

/// Validate the arguments of a read post before any resource is touched.
fn check_read_args(
    dst_len: usize,
    dst_usage: Usage,
    dst_offset: usize,
    src_len: usize,
    src_usage: Usage,
    src_offset: usize,
    len: usize,
) -> Result<()> {
    if !dst_usage.contains(Usage::READ_DST) || !src_usage.contains(Usage::READ_SRC) {
        return Err(Error::Inval);
    }
    let dst_end = dst_offset.checked_add(len).ok_or(Error::Inval)?;
    let src_end = src_offset.checked_add(len).ok_or(Error::Inval)?;
    if dst_end > dst_len || src_end > src_len || len > u32::MAX as usize {
        return Err(Error::Inval);
    }
    Ok(())
}

/// A live connection.
///
/// The connection exclusively owns its queue pair and completion queue and is
/// safe to share across threads: posts may come from anywhere (serialized
/// internally), while [`Conn::next_event`] and [`Conn::next_completion`] are
/// each single-consumer (a second concurrent caller blocks).
pub struct Conn {
    peer: Peer,
    id: CmId,
    cq: Cq,
    evch: EventChannel,
    state: AtomicU8,
    /// `Established` queued for the first `next_event`; doubles as the
    /// single-consumer lock of the event stream.
    pending: Mutex<Option<ConnEvent>>,
    pdata: Box<[u8]>,
    timeout_ms: i32,
    post_lock: Mutex<()>,
    cq_lock: Mutex<()>,
}

impl Conn {
    pub(crate) fn new(
        peer: Peer,
        id: CmId,
        cq: Cq,
        evch: EventChannel,
        pdata: Box<[u8]>,
        timeout_ms: i32,
    ) -> Self {
        Self {
            peer,
            id,
            cq,
            evch,
            state: AtomicU8::new(State::Established as u8),
            pending: Mutex::new(Some(ConnEvent::Established)),
            pdata,
            timeout_ms,
            post_lock: Mutex::new(()),
            cq_lock: Mutex::new(()),
        }
    }

    fn state(&self) -> State {
        State::from(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: State) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Get the private data captured when the connection was established.
    /// Empty if the peer supplied none. The buffer is owned by the connection
    /// and valid until its destruction.
    pub fn private_data(&self) -> &[u8] {
        &self.pdata
    }

    /// Read the next lifecycle event, blocking until one is available.
    ///
    /// Unknown and duplicate connection-manager events are discarded. A
    /// failure of the blocking wait itself (e.g. the event channel dying)
    /// marks the connection [`ConnEvent::Lost`] and surfaces as
    /// [`Error::Provider`] with the channel's errno.
    pub fn next_event(&self) -> Result<ConnEvent> {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(event) = pending.take() {
            return Ok(event);
        }

        loop {
            let event = match self.evch.get_event() {
                Ok(event) => event,
                Err(e) => {
                    self.set_state(State::Lost);
                    return Err(e);
                }
            };
            let kind = event.kind();
            let status = event.status();
            let name = event.kind_str();
            drop(event);

            let (next, deliver) = transition(self.state(), kind);
            self.set_state(next);
            match deliver {
                Some(ConnEvent::Lost) => {
                    // Keep the failing event code reachable through the
                    // provider-error channel.
                    err::capture(status.abs(), name);
                    return Ok(ConnEvent::Lost);
                }
                Some(event) => return Ok(event),
                None => log::debug!("discarding {} on connection", name),
            }
        }
    }

    /// Post a disconnect. Idempotent in effect: once the connection has
    /// reached `Closed` or `Lost` this is a no-op returning success.
    pub fn disconnect(&self) -> Result<()> {
        match self.state() {
            State::Closed | State::Lost => Ok(()),
            _ => {
                let _ = self.state.compare_exchange(
                    State::Established as u8,
                    State::CloseInitiated as u8,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                );
                self.id.disconnect()
            }
        }
    }

    /// Post a one-sided read of `len` bytes from `src` at `src_offset` into
    /// `dst` at `dst_offset`.
    ///
    /// `dst` must permit [`Usage::READ_DST`] and `src` must permit
    /// [`Usage::READ_SRC`]; offsets must stay within the regions. Violations
    /// are reported as [`Error::Inval`] before anything is posted.
    ///
    /// `op_context` is an opaque caller token carried back verbatim in the
    /// matching [`Completion`]. Without
    /// [`PostFlags::WAIT_FOR_COMPLETION`] a successful read may complete
    /// silently.
    #[allow(clippy::too_many_arguments)]
    pub fn read(
        &self,
        dst: &Mr,
        dst_offset: usize,
        src: &RemoteMr,
        src_offset: usize,
        len: usize,
        flags: PostFlags,
        op_context: WrId,
    ) -> Result<()> {
        check_read_args(
            dst.len(),
            dst.usage(),
            dst_offset,
            src.len,
            src.usage,
            src_offset,
            len,
        )?;

        let mut sge = ibv_sge {
            addr: dst.addr() as u64 + dst_offset as u64,
            length: len as u32,
            lkey: dst.lkey(),
        };
        // SAFETY: POD type.
        let mut wr = unsafe { mem::zeroed::<ibv_send_wr>() };
        wr = ibv_send_wr {
            wr_id: op_context,
            next: ptr::null_mut(),
            sg_list: &mut sge,
            num_sge: 1,
            opcode: ibv_wr_opcode::IBV_WR_RDMA_READ,
            send_flags: if flags.contains(PostFlags::WAIT_FOR_COMPLETION) {
                ibv_send_flags::IBV_SEND_SIGNALED.0
            } else {
                0
            },
            wr: wr_t {
                rdma: rdma_t {
                    remote_addr: src.addr + src_offset as u64,
                    rkey: src.rkey,
                },
            },
            ..wr
        };

        let _guard = self.post_lock.lock().unwrap_or_else(|e| e.into_inner());
        // SAFETY: FFI; `wr` and `sge` outlive the call, and the QP lives as
        // long as the connection.
        let ret = unsafe {
            let mut bad_wr = ptr::null_mut();
            ibv_post_send(self.id.qp(), &mut wr, &mut bad_wr)
        };
        if ret == 0 {
            Ok(())
        } else {
            Err(err::provider(ret, "ibv_post_send"))
        }
    }

    /// Get the next completion, blocking until one is delivered.
    ///
    /// Policy: poll once; when the queue is empty, block on the completion
    /// channel, re-arm, and poll again. After the connection has left the
    /// established state this drains the remaining flush completions and then
    /// fails with [`Error::Provider`] (`ESHUTDOWN`) instead of waiting on a
    /// channel that can never fire again.
    pub fn next_completion(&self) -> Result<Completion> {
        let _guard = self.cq_lock.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            if let Some(wc) = self.cq.poll_one()? {
                return Completion::from_wc(&wc);
            }
            if matches!(self.state(), State::Closed | State::Lost) {
                return Err(err::provider(libc::ESHUTDOWN, "ibv_get_cq_event"));
            }
            self.cq.wait()?;
        }
    }

    /// Close the connection, consuming it on success and failure alike so
    /// that a partially destroyed connection can never be touched again.
    ///
    /// Performs the drain-on-close discipline: disconnect if still up, wait
    /// for the provider to report the disconnect, discard the flush tail,
    /// then tear down the queue pair, completion queue, identifier, and event
    /// channel, bottom-up.
    pub fn close(self) -> Result<()> {
        let res = self.drain_for_close();
        drop(self);
        res
    }

    /// Disconnect-and-drain, leaving resource destruction to `Drop`.
    fn drain_for_close(&self) -> Result<()> {
        if !matches!(self.state(), State::Closed | State::Lost) {
            self.disconnect()?;
            // Hold off destroying the QP until the provider confirms the
            // disconnect; completions may still be in flight until then.
            loop {
                match self.evch.wait_event(self.timeout_ms) {
                    Ok(event) => {
                        let kind = event.kind();
                        drop(event);
                        if kind == rdma_cm_event_type::RDMA_CM_EVENT_DISCONNECTED {
                            self.set_state(State::Closed);
                            break;
                        }
                    }
                    // Timeout or a dead channel; proceed with teardown.
                    Err(_) => break,
                }
            }
        }
        let discarded = self.cq.drain();
        if discarded > 0 {
            log::debug!("discarded {} flushed completions on close", discarded);
        }
        Ok(())
    }
}

// SAFETY: all shared internals are synchronized above; the raw provider
// handles may be used from any thread under those locks.
unsafe impl Send for Conn {}
unsafe impl Sync for Conn {}

impl Drop for Conn {
    fn drop(&mut self) {
        let _ = self.drain_for_close();
        // SAFETY: destruction happens exactly once, here; the CQ and event
        // channel follow in field order, after the objects referencing them.
        unsafe {
            self.id.destroy_qp();
            if self.id.destroy().is_err() {
                log::warn!("cannot destroy connection identifier on drop");
            }
        }
    }
}

impl fmt::Debug for Conn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Conn")
            .field("state", &self.state())
            .field("peer", &self.peer)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn established_duplicates_are_swallowed() {
        let (next, deliver) = transition(
            State::Established,
            rdma_cm_event_type::RDMA_CM_EVENT_ESTABLISHED,
        );
        assert_eq!(next, State::Established);
        assert_eq!(deliver, None);
    }

    #[test]
    fn disconnect_yields_closed_exactly_once() {
        let (next, deliver) = transition(
            State::CloseInitiated,
            rdma_cm_event_type::RDMA_CM_EVENT_DISCONNECTED,
        );
        assert_eq!(next, State::Closed);
        assert_eq!(deliver, Some(ConnEvent::Closed));

        let (next, deliver) = transition(next, rdma_cm_event_type::RDMA_CM_EVENT_DISCONNECTED);
        assert_eq!(next, State::Closed);
        assert_eq!(deliver, None);
    }

    #[test]
    fn remote_disconnect_from_established_closes() {
        let (next, deliver) = transition(
            State::Established,
            rdma_cm_event_type::RDMA_CM_EVENT_DISCONNECTED,
        );
        assert_eq!(next, State::Closed);
        assert_eq!(deliver, Some(ConnEvent::Closed));
    }

    #[test]
    fn abnormal_events_yield_lost() {
        for kind in [
            rdma_cm_event_type::RDMA_CM_EVENT_CONNECT_ERROR,
            rdma_cm_event_type::RDMA_CM_EVENT_UNREACHABLE,
            rdma_cm_event_type::RDMA_CM_EVENT_REJECTED,
            rdma_cm_event_type::RDMA_CM_EVENT_DEVICE_REMOVAL,
        ] {
            let (next, deliver) = transition(State::Established, kind);
            assert_eq!(next, State::Lost);
            assert_eq!(deliver, Some(ConnEvent::Lost));
            assert_eq!(transition(next, kind), (State::Lost, None));
        }
    }

    #[test]
    fn unrelated_events_are_swallowed() {
        let (next, deliver) = transition(
            State::Closed,
            rdma_cm_event_type::RDMA_CM_EVENT_TIMEWAIT_EXIT,
        );
        assert_eq!(next, State::Closed);
        assert_eq!(deliver, None);
    }

    #[test]
    fn read_args_usage_checks() {
        let both = Usage::READ_SRC | Usage::READ_DST;
        assert!(check_read_args(4096, both, 0, 4096, both, 0, 4096).is_ok());
        assert_eq!(
            check_read_args(4096, Usage::READ_SRC, 0, 4096, both, 0, 16),
            Err(Error::Inval)
        );
        assert_eq!(
            check_read_args(4096, both, 0, 4096, Usage::READ_DST, 0, 16),
            Err(Error::Inval)
        );
    }

    #[test]
    fn read_args_bounds_checks() {
        let both = Usage::READ_SRC | Usage::READ_DST;
        // dst_offset + len > dst_len
        assert_eq!(
            check_read_args(4096, both, 4000, 4096, both, 0, 128),
            Err(Error::Inval)
        );
        // src_offset + len > src_len
        assert_eq!(
            check_read_args(4096, both, 0, 4096, both, 4095, 2),
            Err(Error::Inval)
        );
        // offset + len overflows
        assert_eq!(
            check_read_args(4096, both, usize::MAX, 4096, both, 0, 2),
            Err(Error::Inval)
        );
        // exact fit is fine
        assert!(check_read_args(4096, both, 256, 4096, both, 512, 128).is_ok());
    }

    #[test]
    fn post_flags() {
        assert!(PostFlags::WAIT_FOR_COMPLETION.contains(PostFlags::WAIT_FOR_COMPLETION));
        assert!(!PostFlags::NONE.contains(PostFlags::WAIT_FOR_COMPLETION));
        let mut flags = PostFlags::NONE;
        flags |= PostFlags::WAIT_FOR_COMPLETION;
        assert_eq!(flags, PostFlags::WAIT_FOR_COMPLETION);
    }
}
