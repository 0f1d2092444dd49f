//! End-to-end scenarios over a real RDMA-capable interface.
//!
//! These tests need an RDMA device (a Soft-RoCE `rxe` interface is enough)
//! and are gated on `RRPMA_TEST_ADDR` naming a local address served by one;
//! without it they pass vacuously.

use std::thread;

use rrpma::wrap::RegisteredMem;
use rrpma::{
    err, AddrUse, ConnCfg, ConnEvent, ConnReq, Context, Endpoint, Error, Peer, PostFlags,
    RemoteMr, Usage,
};

const LEN: usize = 4096;
const PORT: &str = "7299";
const GREETING: &str = "hello-rpma-世界";

fn test_addr() -> Option<String> {
    std::env::var("RRPMA_TEST_ADDR").ok()
}

fn server(addr: String) -> anyhow::Result<()> {
    let ctx = Context::resolve(&addr, AddrUse::Local)?;
    let peer = Peer::new(&ctx)?;

    let mut src = RegisteredMem::new(&peer, LEN, Usage::READ_SRC)?;
    src.fill(0xAB);

    let mut ep = Endpoint::listen(&peer, &addr, PORT)?;
    let req = ep.next_conn_req(&ConnCfg::default())?;
    let conn = req.connect(&src.mr().descriptor())?;

    // Private-data round trip: the 17-byte greeting sent on connect.
    assert_eq!(conn.next_event()?, ConnEvent::Established);
    assert_eq!(conn.private_data(), GREETING.as_bytes());

    // Graceful disconnect: the client hangs up first.
    assert_eq!(conn.next_event()?, ConnEvent::Closed);

    // Flush completions (none here) drained, then a channel-closed failure.
    assert_eq!(conn.next_completion().unwrap_err(), Error::Provider);
    assert_eq!(err::provider_error(), libc::ESHUTDOWN);

    // Cleanup order: the peer refuses to die while dependents are alive.
    let peer = match peer.close() {
        Err((peer, Error::Provider)) => peer,
        Ok(()) => panic!("peer closed while dependents are alive"),
        Err((_, e)) => panic!("unexpected peer close error: {e}"),
    };

    conn.close()?;
    ep.shutdown()?;
    drop(src);
    peer.close().map_err(|(_, e)| e)?;
    Ok(())
}

fn client(addr: String) -> anyhow::Result<()> {
    let ctx = Context::resolve(&addr, AddrUse::Remote)?;
    let peer = Peer::new(&ctx)?;

    let req = ConnReq::new(&peer, &addr, PORT, &ConnCfg::default())?;
    let conn = req.connect(GREETING.as_bytes())?;
    assert_eq!(conn.next_event()?, ConnEvent::Established);

    let src = RemoteMr::from_descriptor(conn.private_data())?;
    assert_eq!(src.len, LEN);
    assert!(src.usage.contains(Usage::READ_SRC));

    let dst = RegisteredMem::new(&peer, LEN, Usage::READ_DST)?;

    // Scenario: full loopback read.
    conn.read(dst.mr(), 0, &src, 0, LEN, PostFlags::WAIT_FOR_COMPLETION, 1)?;
    let cmpl = conn.next_completion()?;
    assert_eq!(cmpl.op_context, 1);
    assert!(cmpl.status.is_success());
    assert_eq!(&dst[..], &[0xAB; LEN][..]);

    // Scenario: partial read into a fresh destination.
    let part = RegisteredMem::new(&peer, LEN, Usage::READ_DST)?;
    conn.read(part.mr(), 256, &src, 512, 128, PostFlags::WAIT_FOR_COMPLETION, 2)?;
    let cmpl = conn.next_completion()?;
    assert_eq!(cmpl.op_context, 2);
    assert!(cmpl.status.is_success());
    assert!(part[..256].iter().all(|&b| b == 0x00));
    assert!(part[256..384].iter().all(|&b| b == 0xAB));
    assert!(part[384..].iter().all(|&b| b == 0x00));

    // Completion order equals post order.
    conn.read(dst.mr(), 0, &src, 0, 1, PostFlags::WAIT_FOR_COMPLETION, 10)?;
    conn.read(dst.mr(), 1, &src, 1, 1, PostFlags::WAIT_FOR_COMPLETION, 11)?;
    conn.read(dst.mr(), 2, &src, 2, 1, PostFlags::WAIT_FOR_COMPLETION, 12)?;
    for expected in [10, 11, 12] {
        let cmpl = conn.next_completion()?;
        assert_eq!(cmpl.op_context, expected);
        assert!(cmpl.status.is_success());
    }

    // Scenario: permission violation is caught before anything is posted.
    let no_read = RemoteMr::new(src.addr, src.len, src.rkey, Usage::READ_DST);
    assert_eq!(
        conn.read(dst.mr(), 0, &no_read, 0, 16, PostFlags::WAIT_FOR_COMPLETION, 3),
        Err(Error::Inval)
    );

    // Out-of-bounds offsets are invalid and make no post.
    assert_eq!(
        conn.read(dst.mr(), LEN - 64, &src, 0, 128, PostFlags::WAIT_FOR_COMPLETION, 4),
        Err(Error::Inval)
    );
    assert_eq!(
        conn.read(dst.mr(), 0, &src, LEN - 64, 128, PostFlags::WAIT_FOR_COMPLETION, 5),
        Err(Error::Inval)
    );

    conn.disconnect()?;
    assert_eq!(conn.next_event()?, ConnEvent::Closed);

    conn.close()?;
    drop((dst, part));
    peer.close().map_err(|(_, e)| e)?;
    Ok(())
}

#[test]
fn loopback_scenarios() {
    let Some(addr) = test_addr() else {
        eprintln!("RRPMA_TEST_ADDR not set; skipping loopback scenarios");
        return;
    };

    let server_addr = addr.clone();
    let server = thread::spawn(move || server(server_addr));
    // Give the listener a head start; the connector retries are bounded by
    // its timeout, not by this.
    thread::sleep(std::time::Duration::from_millis(200));
    let client = thread::spawn(move || client(addr));

    client.join().unwrap().unwrap();
    server.join().unwrap().unwrap();
}

#[test]
fn endpoint_shutdown_fails_next_request() {
    let Some(addr) = test_addr() else {
        eprintln!("RRPMA_TEST_ADDR not set; skipping endpoint shutdown test");
        return;
    };

    let ctx = Context::resolve(&addr, AddrUse::Local).unwrap();
    let peer = Peer::new(&ctx).unwrap();
    let mut ep = Endpoint::listen(&peer, &addr, "7301").unwrap();
    ep.shutdown().unwrap();
    ep.shutdown().unwrap();

    match ep.next_conn_req(&ConnCfg::default()) {
        Err(e) => assert_eq!(e, Error::Provider),
        Ok(_) => panic!("request dequeued from a shut-down endpoint"),
    }
    assert_eq!(err::provider_error(), libc::ESHUTDOWN);

    drop(ep);
    peer.close().map_err(|(_, e)| e).unwrap();
}

#[test]
fn peer_cycles_do_not_leak() {
    let Some(addr) = test_addr() else {
        eprintln!("RRPMA_TEST_ADDR not set; skipping peer cycle test");
        return;
    };

    let ctx = Context::resolve(&addr, AddrUse::Local).unwrap();
    for _ in 0..64 {
        let peer = Peer::new(&ctx).unwrap();
        peer.close().map_err(|(_, e)| e).unwrap();
    }
}
