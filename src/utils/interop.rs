//! Provide interoperability with C socket addresses and file descriptors.

use std::io::Error as IoError;
use std::net::{SocketAddr, ToSocketAddrs};
use std::os::fd::RawFd;
use std::{mem, ptr};

use crate::err::{self, Error, Result};

/// Resolve a textual address and service into the first matching socket
/// address. Resolution failures are argument problems, not provider ones.
pub(crate) fn resolve_sockaddr(addr: &str, service: &str) -> Result<SocketAddr> {
    let port: u16 = service.parse().map_err(|_| Error::Inval)?;
    (addr, port)
        .to_socket_addrs()
        .map_err(|_| Error::Inval)?
        .next()
        .ok_or(Error::Inval)
}

/// Convert a socket address into a C `sockaddr_storage` and its length.
pub(crate) fn to_c_sockaddr(addr: &SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    // SAFETY: POD type.
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let len = match addr {
        SocketAddr::V4(v4) => {
            let sin = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: v4.port().to_be(),
                sin_addr: libc::in_addr {
                    s_addr: u32::from_ne_bytes(v4.ip().octets()),
                },
                sin_zero: [0; 8],
            };
            // SAFETY: `sockaddr_storage` is sized and aligned for any sockaddr.
            unsafe { ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in, sin) };
            mem::size_of::<libc::sockaddr_in>()
        }
        SocketAddr::V6(v6) => {
            let sin6 = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: v6.port().to_be(),
                sin6_flowinfo: v6.flowinfo(),
                sin6_addr: libc::in6_addr {
                    s6_addr: v6.ip().octets(),
                },
                sin6_scope_id: v6.scope_id(),
            };
            // SAFETY: as above.
            unsafe { ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in6, sin6) };
            mem::size_of::<libc::sockaddr_in6>()
        }
    };
    (storage, len as libc::socklen_t)
}

/// Block until the file descriptor becomes readable.
///
/// A negative timeout blocks indefinitely; expiry surfaces as a provider
/// failure with `ETIMEDOUT`.
pub(crate) fn wait_readable(fd: RawFd, timeout_ms: i32, what: &str) -> Result<()> {
    let mut pfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };
    loop {
        // SAFETY: FFI; `pfd` outlives the call.
        let ret = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
        match ret {
            1.. => return Ok(()),
            0 => return Err(err::provider(libc::ETIMEDOUT, what)),
            _ if IoError::last_os_error().raw_os_error() == Some(libc::EINTR) => continue,
            _ => return Err(err::last_os(what)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_loopback() {
        let addr = resolve_sockaddr("127.0.0.1", "7204").unwrap();
        assert_eq!(addr, "127.0.0.1:7204".parse().unwrap());
    }

    #[test]
    fn bad_service_is_invalid() {
        assert_eq!(resolve_sockaddr("127.0.0.1", "rpma"), Err(Error::Inval));
    }

    #[test]
    fn v4_sockaddr_roundtrip() {
        let addr: SocketAddr = "192.0.2.1:7204".parse().unwrap();
        let (storage, len) = to_c_sockaddr(&addr);
        assert_eq!(len as usize, mem::size_of::<libc::sockaddr_in>());
        // SAFETY: written as `sockaddr_in` above.
        let sin = unsafe { *(&storage as *const _ as *const libc::sockaddr_in) };
        assert_eq!(sin.sin_family, libc::AF_INET as libc::sa_family_t);
        assert_eq!(u16::from_be(sin.sin_port), 7204);
        assert_eq!(sin.sin_addr.s_addr.to_ne_bytes(), [192, 0, 2, 1]);
    }
}
