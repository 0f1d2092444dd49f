//! Connection requests: half-open connections before the queue pair is armed.

use std::ffi::c_void;
use std::mem::{self, ManuallyDrop};
use std::ptr;

use rdma_sys::*;

use super::Conn;
use crate::cfg::ConnCfg;
use crate::cm::{CmId, EventChannel};
use crate::cq::Cq;
use crate::err::{self, Error, Result};
use crate::peer::Peer;
use crate::utils::interop;

/// Private data is limited to one length byte on the wire.
const MAX_PRIVATE_DATA: usize = 255;

/// Which side opened the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Outgoing,
    Incoming,
}

/// A half-open connection.
///
/// Either a locally initiated outgoing attempt (address and route already
/// resolved, queue pair and completion queue created) or a server-accepted
/// incoming offer. Terminated by [`ConnReq::connect`], which consumes it into
/// a [`Conn`], or by [`ConnReq::close`], which rejects/destroys it.
pub struct ConnReq {
    peer: Peer,
    id: CmId,
    cq: Cq,
    side: Side,
    /// Private data cached from the `CONNECT_REQUEST` event (incoming only).
    pdata: Box<[u8]>,
    /// Read-atomic depths negotiated into connect/accept parameters.
    responder_resources: u8,
    initiator_depth: u8,
    cfg: ConnCfg,
}

impl ConnReq {
    /// Start an outgoing connection attempt towards `addr:service`.
    ///
    /// Resolves the address and the route through the connection manager
    /// (blocking, bounded by `cfg.timeout_ms`), then creates the completion
    /// queue and queue pair within the peer's protection domain. Any provider
    /// failure releases the partially acquired resources.
    pub fn new(peer: &Peer, addr: &str, service: &str, cfg: &ConnCfg) -> Result<Self> {
        cfg.validate()?;
        let sa = interop::resolve_sockaddr(addr, service)?;
        let id = CmId::create_sync()?;

        let res = (|| {
            id.resolve_addr(&sa, cfg.timeout_ms as i32)?;
            id.resolve_route(cfg.timeout_ms as i32)?;
            let attr = peer.context().query_device()?;
            let cq = Cq::new(peer.context(), cfg.cq_size)?;
            peer.create_qp(id, &cq, cfg)?;
            Ok((cq, attr))
        })();
        match res {
            Ok((cq, attr)) => Ok(Self {
                peer: peer.clone(),
                id,
                cq,
                side: Side::Outgoing,
                pdata: Box::default(),
                responder_resources: depth_cap(attr.max_qp_rd_atom),
                initiator_depth: depth_cap(attr.max_qp_init_rd_atom),
                cfg: *cfg,
            }),
            Err(e) => {
                // SAFETY: created above, not yet shared.
                unsafe {
                    id.destroy_qp();
                    if id.destroy().is_err() {
                        log::warn!("cannot destroy identifier of a failed request");
                    }
                }
                Err(e)
            }
        }
    }

    /// Wrap the identifier of a dequeued `CONNECT_REQUEST` and create the
    /// queue pair and completion queue against the peer. Takes over the
    /// identifier; on failure the offer is rejected and the identifier
    /// destroyed.
    pub(crate) fn incoming(
        peer: &Peer,
        id: CmId,
        pdata: Box<[u8]>,
        responder_resources: u8,
        initiator_depth: u8,
        cfg: &ConnCfg,
    ) -> Result<Self> {
        let res = (|| {
            let attr = peer.context().query_device()?;
            let cq = Cq::new(peer.context(), cfg.cq_size)?;
            peer.create_qp(id, &cq, cfg)?;
            Ok((cq, attr))
        })();
        match res {
            Ok((cq, attr)) => Ok(Self {
                peer: peer.clone(),
                id,
                cq,
                side: Side::Incoming,
                pdata,
                // Accept must not exceed what the initiator asked for.
                responder_resources: responder_resources.min(depth_cap(attr.max_qp_rd_atom)),
                initiator_depth: initiator_depth.min(depth_cap(attr.max_qp_init_rd_atom)),
                cfg: *cfg,
            }),
            Err(e) => {
                if id.reject().is_err() {
                    log::warn!("cannot reject a failed incoming request");
                }
                // SAFETY: ownership of the event identifier is ours.
                unsafe {
                    id.destroy_qp();
                    if id.destroy().is_err() {
                        log::warn!("cannot destroy identifier of a failed request");
                    }
                }
                Err(e)
            }
        }
    }

    /// Promote the request into a connection.
    ///
    /// Arms the queue pair and posts the connect (outgoing) or accept
    /// (incoming) with `pdata` as the handshake's private data (at most 255
    /// bytes), then waits — bounded by the request's `timeout_ms` — for the
    /// connection manager to report `ESTABLISHED`. The request is consumed:
    /// on success its identifier, queue pair, and completion queue transfer
    /// into the returned [`Conn`]; on failure they are all released and no
    /// half-connected state remains observable.
    pub fn connect(self, pdata: &[u8]) -> Result<Conn> {
        if pdata.len() > MAX_PRIVATE_DATA {
            return Err(Error::Inval);
        }

        let this = ManuallyDrop::new(self);
        // SAFETY: every field is read out exactly once; `this` is never
        // dropped, so nothing is double-freed.
        let peer = unsafe { ptr::read(&this.peer) };
        let cq = unsafe { ptr::read(&this.cq) };
        let cached = unsafe { ptr::read(&this.pdata) };
        let (id, side, cfg) = (this.id, this.side, this.cfg);
        let depths = (this.responder_resources, this.initiator_depth);

        match Self::establish(id, side, &cfg, depths, pdata) {
            Ok((evch, event_data)) => {
                // The established event carries the accept-side blob for an
                // outgoing request; an incoming one keeps what the initiator
                // sent with `CONNECT_REQUEST`.
                let pdata = if event_data.is_empty() { cached } else { event_data };
                Ok(Conn::new(peer, id, cq, evch, pdata, cfg.timeout_ms as i32))
            }
            Err(e) => {
                let _ = id.disconnect();
                // SAFETY: transferred out of the request above; destroyed once.
                unsafe {
                    id.destroy_qp();
                    if id.destroy().is_err() {
                        log::warn!("cannot destroy identifier of a failed connect");
                    }
                }
                drop(cq);
                drop(peer);
                Err(e)
            }
        }
    }

    /// Arm the handshake and wait for `ESTABLISHED` on a fresh event channel.
    fn establish(
        id: CmId,
        side: Side,
        cfg: &ConnCfg,
        (responder_resources, initiator_depth): (u8, u8),
        pdata: &[u8],
    ) -> Result<(EventChannel, Box<[u8]>)> {
        let evch = EventChannel::new()?;
        id.migrate(&evch)?;

        // SAFETY: POD type.
        let mut param: rdma_conn_param = unsafe { mem::zeroed() };
        if !pdata.is_empty() {
            param.private_data = pdata.as_ptr() as *const c_void;
            param.private_data_len = pdata.len() as u8;
        }
        param.responder_resources = responder_resources;
        param.initiator_depth = initiator_depth;
        param.flow_control = 1;
        param.retry_count = 7;
        param.rnr_retry_count = 7;

        match side {
            Side::Outgoing => id.connect(&mut param)?,
            Side::Incoming => id.accept(&mut param)?,
        }

        loop {
            let event = evch.wait_event(cfg.timeout_ms as i32)?;
            match event.kind() {
                rdma_cm_event_type::RDMA_CM_EVENT_ESTABLISHED => {
                    let data = event.private_data().to_vec().into_boxed_slice();
                    return Ok((evch, data));
                }
                rdma_cm_event_type::RDMA_CM_EVENT_CONNECT_ERROR
                | rdma_cm_event_type::RDMA_CM_EVENT_REJECTED
                | rdma_cm_event_type::RDMA_CM_EVENT_UNREACHABLE
                | rdma_cm_event_type::RDMA_CM_EVENT_DEVICE_REMOVAL => {
                    err::capture(event.status().abs(), event.kind_str());
                    return Err(Error::Provider);
                }
                _ => log::debug!("discarding {} while connecting", event.kind_str()),
            }
        }
    }

    /// Destroy the request without connecting. An unconnected incoming offer
    /// is rejected first. On failure the request is handed back for a retry.
    pub fn close(self) -> std::result::Result<(), (Self, Error)> {
        if self.side == Side::Incoming {
            if let Err(e) = self.id.reject() {
                return Err((self, e));
            }
        }
        let this = ManuallyDrop::new(self);
        // SAFETY: fields released exactly once; `this` is never dropped.
        unsafe {
            this.id.destroy_qp();
            drop(ptr::read(&this.cq));
            if this.id.destroy().is_err() {
                log::warn!("cannot destroy request identifier");
            }
            drop(ptr::read(&this.peer));
            drop(ptr::read(&this.pdata));
        }
        Ok(())
    }
}

impl Drop for ConnReq {
    fn drop(&mut self) {
        if self.side == Side::Incoming && self.id.reject().is_err() {
            log::warn!("cannot reject incoming request on drop");
        }
        // SAFETY: destruction happens exactly once, here; the CQ follows in
        // field order.
        unsafe {
            self.id.destroy_qp();
            if self.id.destroy().is_err() {
                log::warn!("cannot destroy request identifier on drop");
            }
        }
    }
}

/// Clamp a device-reported read-atomic depth into the connect parameter's
/// byte range.
fn depth_cap(max: i32) -> u8 {
    max.clamp(1, u8::MAX as i32) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn depth_cap_bounds() {
        assert_eq!(depth_cap(0), 1);
        assert_eq!(depth_cap(16), 16);
        assert_eq!(depth_cap(1 << 20), 255);
    }
}
