//! Expose a buffer of `0xAB` bytes to remote readers.
//!
//! Usage: read-server <addr> <port>
//!
//! The 24-byte descriptor of the exposed region travels to the client as the
//! private data of the accept; whatever private data the client sent with its
//! connect is printed once the connection is established.

use anyhow::Context as _;
use rrpma::wrap::RegisteredMem;
use rrpma::{AddrUse, ConnCfg, ConnEvent, Context, Endpoint, Peer, Usage};

const LEN: usize = 4096;

fn main() -> anyhow::Result<()> {
    let mut args = std::env::args().skip(1);
    let addr = args.next().context("usage: read-server <addr> <port>")?;
    let port = args.next().context("usage: read-server <addr> <port>")?;

    let ctx = Context::resolve(&addr, AddrUse::Local)?;
    let peer = Peer::new(&ctx)?;

    let mut src = RegisteredMem::new(&peer, LEN, Usage::READ_SRC)?;
    src.fill(0xAB);

    let mut ep = Endpoint::listen(&peer, &addr, &port)?;
    println!("listening on {}:{}", addr, port);

    let req = ep.next_conn_req(&ConnCfg::default())?;
    let conn = req.connect(&src.mr().descriptor())?;

    assert_eq!(conn.next_event()?, ConnEvent::Established);
    println!(
        "established; client private data: {:?}",
        String::from_utf8_lossy(conn.private_data())
    );

    // Serve until the client hangs up.
    while conn.next_event()? != ConnEvent::Closed {}
    println!("closed");

    conn.close()?;
    ep.shutdown()?;
    drop(src);
    peer.close().map_err(|(_, e)| e)?;
    Ok(())
}
