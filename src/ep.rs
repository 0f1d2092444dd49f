//! Endpoint: passive listener producing incoming connection requests.

use rdma_sys::*;

use crate::cfg::ConnCfg;
use crate::cm::{CmId, EventChannel};
use crate::conn::ConnReq;
use crate::err::{self, Result};
use crate::peer::Peer;
use crate::utils::interop;

const LISTEN_BACKLOG: i32 = 10;

/// The listening resources, gone once the endpoint is shut down.
struct Listener {
    evch: EventChannel,
    id: CmId,
}

/// A passive listener bound to a local address.
///
/// [`Endpoint::next_conn_req`] is single-consumer, which the `&mut self`
/// receiver enforces.
pub struct Endpoint {
    peer: Peer,
    listener: Option<Listener>,
}

impl Endpoint {
    /// Bind a listening identifier to `addr:service` and start accepting.
    pub fn listen(peer: &Peer, addr: &str, service: &str) -> Result<Self> {
        let sa = interop::resolve_sockaddr(addr, service)?;
        let evch = EventChannel::new()?;
        let id = CmId::create_on(&evch)?;

        if let Err(e) = id.bind_addr(&sa).and_then(|()| id.listen(LISTEN_BACKLOG)) {
            // SAFETY: created above, not yet shared.
            unsafe {
                if id.destroy().is_err() {
                    log::warn!("cannot destroy listening identifier");
                }
            }
            return Err(e);
        }

        Ok(Self {
            peer: peer.clone(),
            listener: Some(Listener { evch, id }),
        })
    }

    /// Block until the next incoming connection request arrives and wrap it.
    ///
    /// Events other than `CONNECT_REQUEST` that show up on the listening
    /// channel are discarded with a log line. After [`Endpoint::shutdown`]
    /// this fails with [`crate::Error::Provider`] (`ESHUTDOWN`).
    pub fn next_conn_req(&mut self, cfg: &ConnCfg) -> Result<ConnReq> {
        cfg.validate()?;
        let listener = match &self.listener {
            Some(listener) => listener,
            None => return Err(err::provider(libc::ESHUTDOWN, "rdma_get_cm_event")),
        };

        loop {
            let event = listener.evch.get_event()?;
            if event.kind() == rdma_cm_event_type::RDMA_CM_EVENT_CONNECT_REQUEST {
                let id = CmId::from_event_id(event.id())?;
                let pdata = event.private_data().to_vec().into_boxed_slice();
                let responder_resources = event.conn_responder_resources();
                let initiator_depth = event.conn_initiator_depth();
                // Acknowledging hands the child identifier over to us.
                drop(event);
                return ConnReq::incoming(
                    &self.peer,
                    id,
                    pdata,
                    responder_resources,
                    initiator_depth,
                    cfg,
                );
            }
            log::debug!("discarding {} on listening endpoint", event.kind_str());
        }
    }

    /// Stop listening and release the identifier and event channel.
    /// Idempotent. Requests already handed out are unaffected.
    pub fn shutdown(&mut self) -> Result<()> {
        if let Some(listener) = self.listener.take() {
            // SAFETY: taken out; destroyed exactly once, before its channel.
            unsafe { listener.id.destroy()? };
        }
        Ok(())
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        if let Some(listener) = self.listener.take() {
            // SAFETY: as in `shutdown`.
            if unsafe { listener.id.destroy() }.is_err() {
                log::warn!("cannot destroy listening identifier on drop");
            }
        }
    }
}
