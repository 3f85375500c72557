//! Socket bring-up helpers.

use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::fd::AsRawFd;

use socket2::{Domain, Protocol, Socket, Type};

/// Create the listening socket: address and port reuse, non-blocking,
/// bound and listening.
pub fn bind_listener(addr: SocketAddr, backlog: u32) -> io::Result<TcpListener> {
    let domain = match addr {
        SocketAddr::V4(_) => Domain::IPV4,
        SocketAddr::V6(_) => Domain::IPV6,
    };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;

    socket.set_reuse_address(true)?;

    // Port reuse so a future sharded layout can bind one listener per
    // loop on the same address.
    let optval: libc::c_int = 1;
    let rc = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_REUSEPORT,
            &optval as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }

    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog as i32)?;

    Ok(socket.into())
}

/// Prepare an accepted socket for the reactor: non-blocking, with the
/// configured transport options applied.
pub fn prepare_stream(stream: &TcpStream, nodelay: bool, keepalive: bool) -> io::Result<()> {
    stream.set_nonblocking(true)?;
    if nodelay {
        stream.set_nodelay(true)?;
    }
    if keepalive {
        enable_keepalive(stream)?;
    }
    Ok(())
}

/// Enable SO_KEEPALIVE probing on a connected socket.
pub fn enable_keepalive(stream: &TcpStream) -> io::Result<()> {
    let optval: libc::c_int = 1;
    let rc = unsafe {
        libc::setsockopt(
            stream.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_KEEPALIVE,
            &optval as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
