//! Original destination recovery
//!
//! After a netfilter REDIRECT, the socket's peer address is useless for
//! routing: the address the application actually dialed is stored by the
//! kernel and retrieved with `SO_ORIGINAL_DST`. On platforms without the
//! option the peer address is returned unchanged, which is correct for the
//! single-host developer case.

use std::io;
use std::net::SocketAddr;

use tokio::net::TcpStream;

/// Linux kernel constant: `SO_ORIGINAL_DST` (`SOL_IP` level)
#[cfg(target_os = "linux")]
pub const SO_ORIGINAL_DST: libc::c_int = 80;

/// Recover the pre-redirect destination of an accepted connection.
///
/// # Errors
///
/// Returns an error when `getsockopt` fails for a reason other than the
/// option being unavailable on this socket.
#[cfg(target_os = "linux")]
pub fn original_destination(stream: &TcpStream) -> io::Result<SocketAddr> {
    use std::mem;
    use std::net::{Ipv4Addr, SocketAddrV4};
    use std::os::unix::io::AsRawFd;

    let fd = stream.as_raw_fd();
    let mut addr: libc::sockaddr_in = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;

    let ret = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_IP,
            SO_ORIGINAL_DST,
            std::ptr::addr_of_mut!(addr).cast::<libc::c_void>(),
            &mut len,
        )
    };

    if ret != 0 {
        let err = io::Error::last_os_error();
        // ENOPROTOOPT: conntrack not available. ENOENT: no NAT entry, i.e.
        // the peer dialed us directly. Both degrade to the peer address.
        if matches!(err.raw_os_error(), Some(libc::ENOPROTOOPT | libc::ENOENT)) {
            return stream.peer_addr();
        }
        return Err(err);
    }

    let port = u16::from_be(addr.sin_port);
    let ip = Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr));
    Ok(SocketAddr::V4(SocketAddrV4::new(ip, port)))
}

/// Recover the pre-redirect destination of an accepted connection.
///
/// # Errors
///
/// Propagates `peer_addr` errors.
#[cfg(not(target_os = "linux"))]
pub fn original_destination(stream: &TcpStream) -> io::Result<SocketAddr> {
    stream.peer_addr()
}
