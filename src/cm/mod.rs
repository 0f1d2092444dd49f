//! Connection-manager plumbing: event channels, communication identifiers,
//! and lifecycle events.
//!
//! These wrappers are deliberately thin. Ownership is decided by the types
//! that embed them: a [`CmId`] is a plain copyable pointer with unsafe
//! destroy methods, while [`EventChannel`] and [`CmEvent`] release their
//! resource on drop.

use std::ffi::CStr;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::ptr::{self, NonNull};
use std::slice;

use rdma_sys::*;

use crate::err::{self, Error, Result};
use crate::utils::interop;

/// Wrapper for `*mut rdma_cm_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub(crate) struct CmId(NonNull<rdma_cm_id>);

impl CmId {
    /// Create an identifier in synchronous mode (no event channel): resolution
    /// calls on it block internally instead of producing events.
    pub fn create_sync() -> Result<Self> {
        let mut id = ptr::null_mut();
        // SAFETY: FFI.
        let ret = unsafe {
            rdma_create_id(
                ptr::null_mut(),
                &mut id,
                ptr::null_mut(),
                rdma_port_space::RDMA_PS_TCP,
            )
        };
        err::from_c_ret(ret, "rdma_create_id")?;
        NonNull::new(id).map(Self).ok_or(Error::Unknown)
    }

    /// Create an identifier bound to the given event channel.
    pub fn create_on(channel: &EventChannel) -> Result<Self> {
        let mut id = ptr::null_mut();
        // SAFETY: FFI.
        let ret = unsafe {
            rdma_create_id(
                channel.as_ptr(),
                &mut id,
                ptr::null_mut(),
                rdma_port_space::RDMA_PS_TCP,
            )
        };
        err::from_c_ret(ret, "rdma_create_id")?;
        NonNull::new(id).map(Self).ok_or(Error::Unknown)
    }

    /// Wrap an identifier delivered by a `CONNECT_REQUEST` event. The caller
    /// takes over its destruction.
    pub fn from_event_id(id: *mut rdma_cm_id) -> Result<Self> {
        NonNull::new(id).map(Self).ok_or(Error::Unknown)
    }

    /// Resolve the destination address, blocking up to `timeout_ms`.
    pub fn resolve_addr(&self, dst: &SocketAddr, timeout_ms: i32) -> Result<()> {
        let (mut storage, _len) = interop::to_c_sockaddr(dst);
        // SAFETY: FFI; `storage` outlives the call.
        let ret = unsafe {
            rdma_resolve_addr(
                self.as_ptr(),
                ptr::null_mut(),
                &mut storage as *mut _ as *mut libc::sockaddr,
                timeout_ms,
            )
        };
        err::from_c_ret(ret, "rdma_resolve_addr")
    }

    /// Resolve a route to the already-resolved destination.
    pub fn resolve_route(&self, timeout_ms: i32) -> Result<()> {
        // SAFETY: FFI.
        let ret = unsafe { rdma_resolve_route(self.as_ptr(), timeout_ms) };
        err::from_c_ret(ret, "rdma_resolve_route")
    }

    /// Bind to a local address.
    pub fn bind_addr(&self, addr: &SocketAddr) -> Result<()> {
        let (mut storage, _len) = interop::to_c_sockaddr(addr);
        // SAFETY: FFI; `storage` outlives the call.
        let ret = unsafe {
            rdma_bind_addr(
                self.as_ptr(),
                &mut storage as *mut _ as *mut libc::sockaddr,
            )
        };
        err::from_c_ret(ret, "rdma_bind_addr")
    }

    /// Start listening for incoming connection requests.
    pub fn listen(&self, backlog: i32) -> Result<()> {
        // SAFETY: FFI.
        let ret = unsafe { rdma_listen(self.as_ptr(), backlog) };
        err::from_c_ret(ret, "rdma_listen")
    }

    /// Post an outgoing connect with the given parameters.
    pub fn connect(&self, param: &mut rdma_conn_param) -> Result<()> {
        // SAFETY: FFI; `param` outlives the call.
        let ret = unsafe { rdma_connect(self.as_ptr(), param) };
        err::from_c_ret(ret, "rdma_connect")
    }

    /// Accept an incoming connect with the given parameters.
    pub fn accept(&self, param: &mut rdma_conn_param) -> Result<()> {
        // SAFETY: FFI; `param` outlives the call.
        let ret = unsafe { rdma_accept(self.as_ptr(), param) };
        err::from_c_ret(ret, "rdma_accept")
    }

    /// Reject an incoming connect without accepting it.
    pub fn reject(&self) -> Result<()> {
        // SAFETY: FFI.
        let ret = unsafe { rdma_reject(self.as_ptr(), ptr::null(), 0) };
        err::from_c_ret(ret, "rdma_reject")
    }

    /// Post a disconnect. An identifier that is already disconnected reports
    /// `EINVAL`, which counts as success here.
    pub fn disconnect(&self) -> Result<()> {
        // SAFETY: FFI.
        let ret = unsafe { rdma_disconnect(self.as_ptr()) };
        if ret == 0 {
            return Ok(());
        }
        match std::io::Error::last_os_error().raw_os_error() {
            Some(libc::EINVAL) => Ok(()),
            _ => Err(err::last_os("rdma_disconnect")),
        }
    }

    /// Migrate the identifier onto another event channel.
    pub fn migrate(&self, channel: &EventChannel) -> Result<()> {
        // SAFETY: FFI.
        let ret = unsafe { rdma_migrate_id(self.as_ptr(), channel.as_ptr()) };
        err::from_c_ret(ret, "rdma_migrate_id")
    }

    /// Get the verbs device context the identifier is bound to. Null until an
    /// address has been resolved or bound.
    pub fn verbs(&self) -> *mut ibv_context {
        // SAFETY: the pointed-to `rdma_cm_id` instance is valid.
        unsafe { self.as_ref().verbs }
    }

    /// Get the queue pair owned by this identifier, null if none was created.
    pub fn qp(&self) -> *mut ibv_qp {
        // SAFETY: the pointed-to `rdma_cm_id` instance is valid.
        unsafe { self.as_ref().qp }
    }

    /// Destroy the queue pair owned by this identifier, if any.
    ///
    /// # Safety
    ///
    /// - No work request may be posted afterwards.
    /// - Must be called at most once per created queue pair.
    pub unsafe fn destroy_qp(self) {
        if !self.as_ref().qp.is_null() {
            rdma_destroy_qp(self.as_ptr());
        }
    }

    /// Destroy the identifier.
    ///
    /// # Safety
    ///
    /// - An identifier must not be destroyed more than once.
    /// - Destroyed identifiers must not be used anymore.
    pub unsafe fn destroy(self) -> Result<()> {
        let ret = rdma_destroy_id(self.as_ptr());
        err::from_c_ret(ret, "rdma_destroy_id")
    }
}

impl_raw_handle!(CmId => rdma_cm_id);

/// Connection-manager event channel.
pub(crate) struct EventChannel(NonNull<rdma_event_channel>);

impl_raw_handle!(EventChannel => rdma_event_channel);

impl EventChannel {
    pub fn new() -> Result<Self> {
        // SAFETY: FFI.
        let channel = unsafe { rdma_create_event_channel() };
        NonNull::new(channel)
            .map(Self)
            .ok_or_else(|| err::last_os("rdma_create_event_channel"))
    }

    pub fn fd(&self) -> RawFd {
        // SAFETY: the channel is alive until drop.
        unsafe { self.as_ref().fd }
    }

    /// Block until the next event arrives.
    pub fn get_event(&self) -> Result<CmEvent> {
        let mut evt = ptr::null_mut();
        // SAFETY: FFI.
        let ret = unsafe { rdma_get_cm_event(self.as_ptr(), &mut evt) };
        err::from_c_ret(ret, "rdma_get_cm_event")?;
        NonNull::new(evt).map(CmEvent).ok_or(Error::Unknown)
    }

    /// Block up to `timeout_ms` for the next event; a negative timeout blocks
    /// indefinitely.
    pub fn wait_event(&self, timeout_ms: i32) -> Result<CmEvent> {
        interop::wait_readable(self.fd(), timeout_ms, "rdma_get_cm_event")?;
        self.get_event()
    }
}

impl Drop for EventChannel {
    fn drop(&mut self) {
        // SAFETY: call only once, and no UAF since I will be dropped.
        unsafe { rdma_destroy_event_channel(self.as_ptr()) };
    }
}

/// A connection-manager event, acknowledged back to the provider on drop.
pub(crate) struct CmEvent(NonNull<rdma_cm_event>);

impl_raw_handle!(CmEvent => rdma_cm_event);

impl CmEvent {
    pub fn kind(&self) -> rdma_cm_event_type::Type {
        // SAFETY: the pointed-to event is valid until acknowledged.
        unsafe { self.as_ref().event }
    }

    /// Provider status code carried by the event (e.g. the reject reason).
    pub fn status(&self) -> i32 {
        // SAFETY: as above.
        unsafe { self.as_ref().status }
    }

    /// The identifier the event refers to. For `CONNECT_REQUEST` this is the
    /// newly created child identifier, owned by the consumer from then on.
    pub fn id(&self) -> *mut rdma_cm_id {
        // SAFETY: as above.
        unsafe { self.as_ref().id }
    }

    /// The private-data blob carried by the handshake, empty if none. Only
    /// meaningful for `CONNECT_REQUEST` and `ESTABLISHED` events; copy it out
    /// before the event is dropped.
    pub fn private_data(&self) -> &[u8] {
        // SAFETY: reading the `conn` arm of the parameter union is valid for
        // connection-oriented port spaces; the blob lives until acknowledge.
        unsafe {
            let conn = self.as_ref().param.conn;
            if conn.private_data.is_null() || conn.private_data_len == 0 {
                &[]
            } else {
                slice::from_raw_parts(conn.private_data as *const u8, conn.private_data_len as usize)
            }
        }
    }

    /// Read-atomic depth the initiator asked for, from a `CONNECT_REQUEST`.
    pub fn conn_responder_resources(&self) -> u8 {
        // SAFETY: see `private_data`.
        unsafe { self.as_ref().param.conn.responder_resources }
    }

    /// Outstanding-read depth the initiator offers, from a `CONNECT_REQUEST`.
    pub fn conn_initiator_depth(&self) -> u8 {
        // SAFETY: see `private_data`.
        unsafe { self.as_ref().param.conn.initiator_depth }
    }

    /// Human-readable event name, for log lines.
    pub fn kind_str(&self) -> &'static str {
        // SAFETY: FFI; librdmacm returns a static string.
        unsafe {
            CStr::from_ptr(rdma_event_str(self.kind()))
                .to_str()
                .unwrap_or("UNKNOWN")
        }
    }
}

impl Drop for CmEvent {
    fn drop(&mut self) {
        // SAFETY: call only once, and no UAF since I will be dropped.
        let ret = unsafe { rdma_ack_cm_event(self.as_ptr()) };
        if ret != 0 {
            log::warn!("failed to acknowledge a connection-manager event");
        }
    }
}
