//! Read a remote buffer exposed by `read-server` and time the transfer.
//!
//! Usage: read-client <addr> <port>

use anyhow::Context as _;
use quanta::Instant;
use rrpma::wrap::RegisteredMem;
use rrpma::{AddrUse, ConnCfg, ConnEvent, ConnReq, Context, Peer, PostFlags, RemoteMr, Usage};

const LEN: usize = 4096;

fn main() -> anyhow::Result<()> {
    let mut args = std::env::args().skip(1);
    let addr = args.next().context("usage: read-client <addr> <port>")?;
    let port = args.next().context("usage: read-client <addr> <port>")?;

    let ctx = Context::resolve(&addr, AddrUse::Remote)?;
    let peer = Peer::new(&ctx)?;

    let req = ConnReq::new(&peer, &addr, &port, &ConnCfg::default())?;
    let conn = req.connect("hello-rpma-世界".as_bytes())?;
    assert_eq!(conn.next_event()?, ConnEvent::Established);

    let src = RemoteMr::from_descriptor(conn.private_data())?;
    let dst = RegisteredMem::new(&peer, LEN, Usage::READ_DST)?;

    let time = Instant::now();
    conn.read(dst.mr(), 0, &src, 0, LEN, PostFlags::WAIT_FOR_COMPLETION, 1)?;
    let cmpl = conn.next_completion()?;
    println!("time elapsed (read): {:?}", time.elapsed());

    assert_eq!(cmpl.op_context, 1);
    assert!(cmpl.status.is_success(), "read failed: {}", cmpl.status);
    assert_eq!(&dst[..], &[0xAB; LEN][..]);
    println!("read {} bytes of 0xAB", LEN);

    conn.disconnect()?;
    while conn.next_event()? != ConnEvent::Closed {}

    conn.close()?;
    drop(dst);
    peer.close().map_err(|(_, e)| e)?;
    Ok(())
}
