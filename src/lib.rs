//! A library for reliable, connection-oriented remote access to (persistent)
//! memory over RDMA-capable network interfaces.
//!
//! Client processes use it to read bytes directly out of a peer's registered
//! memory — and, by symmetry, to expose their own memory to remote readers —
//! without copying through the kernel or traversing the remote CPU.
//!
//! The object graph is rooted at a [`Peer`], which owns a protection domain
//! bound to one device [`Context`]. A peer registers local buffers as memory
//! regions ([`Mr`]), and either listens for incoming connections through an
//! [`Endpoint`] or initiates outgoing ones through a [`ConnReq`]. A request is
//! promoted to a live [`Conn`] by [`ConnReq::connect`], optionally carrying a
//! small private-data blob in the handshake. An established connection
//! accepts remote-read posts ([`Conn::read`]) against a [`RemoteMr`] decoded
//! from a peer's wire descriptor, and delivers [`Completion`]s and lifecycle
//! [`ConnEvent`]s.
//!
//! # Example
//!
//! Read 4 KiB out of a remote peer whose memory descriptor arrived as the
//! private data of the connection handshake:
//!
//! ```no_run
//! use rrpma::wrap::RegisteredMem;
//! use rrpma::{AddrUse, CompletionStatus, ConnCfg, ConnReq, Context, Peer};
//! use rrpma::{PostFlags, RemoteMr, Usage};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let ctx = Context::resolve("192.168.0.2", AddrUse::Remote)?;
//! let peer = Peer::new(&ctx)?;
//!
//! let req = ConnReq::new(&peer, "192.168.0.2", "7204", &ConnCfg::default())?;
//! let conn = req.connect(&[])?;
//!
//! let src = RemoteMr::from_descriptor(conn.private_data())?;
//! let dst = RegisteredMem::new(&peer, 4096, Usage::READ_DST)?;
//!
//! conn.read(dst.mr(), 0, &src, 0, 4096, PostFlags::WAIT_FOR_COMPLETION, 1)?;
//! let cmpl = conn.next_completion()?;
//! assert_eq!(cmpl.status, CompletionStatus::Success);
//! # Ok(())
//! # }
//! ```

#[cfg(not(target_os = "linux"))]
compile_error!("`rrpma` currently only supports Linux");

#[cfg(not(target_pointer_width = "64"))]
compile_error!("`rrpma` currently only supports 64-bit platforms");

/// Shared utility functions.
#[macro_use]
mod utils;

/// Connection-manager plumbing, internal.
mod cm;

/// Completion queues; internal except for the completion value types.
mod cq;

mod cfg;
mod conn;
mod ctx;
mod ep;
mod mr;
mod peer;

/// Error codes and the thread-local provider-error channel.
pub mod err;

/// Type aliases for RDMA-related quantities.
pub mod types;

/// Higher-level wrappings of registered memory.
pub mod wrap;

pub use cfg::ConnCfg;
pub use conn::{Conn, ConnEvent, ConnReq, PostFlags};
pub use cq::{Completion, CompletionStatus, Op};
pub use ctx::{AddrUse, Context};
pub use ep::Endpoint;
pub use err::{Error, Result};
pub use mr::{Mr, Placement, RemoteMr, Usage, DESCRIPTOR_SIZE};
pub use peer::Peer;
