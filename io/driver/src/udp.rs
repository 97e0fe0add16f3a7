//! UDP socket setup and raw receive helpers.
//!
//! This module owns the pieces of the datagram path that go below the
//! standard library:
//!
//! - listener construction with `SO_REUSEADDR` + `SO_REUSEPORT`, so every
//!   worker thread binds the same ports and the kernel load-balances
//!   incoming datagrams across them
//! - connected outbound session sockets bound to the relay's client-facing
//!   source address
//! - batched receives via `recvmmsg` on Linux (one syscall fills several
//!   chunk regions of one buffer), with a single `recvfrom` elsewhere
//! - sockaddr conversion for the raw receive path

use crate::buffer::Buffer;
use std::io;
use std::mem;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6, UdpSocket};
use std::os::unix::io::{AsRawFd, RawFd};

/// Upper bound on datagrams drained by one batched receive.
pub const MAX_BATCH: usize = 32;

/// Source address and length of one received datagram, filled per chunk
/// region by [`recv_batch`].
#[derive(Debug, Clone, Copy)]
pub struct RecvMeta {
    pub source: SocketAddr,
    pub len: usize,
}

impl RecvMeta {
    pub(crate) const EMPTY: RecvMeta = RecvMeta {
        source: SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0)),
        len: 0,
    };
}

/// Enable `SO_REUSEPORT` so multiple sockets can bind the same port and the
/// kernel distributes incoming datagrams among them.
pub fn set_reuse_port(fd: RawFd) -> io::Result<()> {
    let optval: libc::c_int = 1;
    let rc = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEPORT,
            &optval as *const _ as *const libc::c_void,
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn new_socket(addr: SocketAddr) -> io::Result<socket2::Socket> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::DGRAM,
        Some(socket2::Protocol::UDP),
    )?;
    socket.set_reuse_address(true)?;
    set_reuse_port(socket.as_raw_fd())?;
    socket.set_nonblocking(true)?;
    Ok(socket)
}

/// Create a non-blocking listener socket sharing `addr` with every other
/// worker thread bound to the same port.
pub fn bind_listener(addr: SocketAddr) -> io::Result<UdpSocket> {
    let socket = new_socket(addr)?;
    socket.bind(&addr.into())?;
    Ok(socket.into())
}

/// Create a connected outbound socket for a session: bound to the relay's
/// client-facing source address, connected to `dest`.
pub fn connect_session(source: SocketAddr, dest: SocketAddr) -> io::Result<UdpSocket> {
    let socket = new_socket(source)?;
    socket.bind(&source.into())?;
    socket.connect(&dest.into())?;
    Ok(socket.into())
}

/// Receive a batch of datagrams into the chunk regions of `buf`.
///
/// Fills `metas[..n]` and returns `n`. `WouldBlock` is propagated for the
/// caller's drain loop; every other error is a fatal condition at the call
/// site.
#[cfg(target_os = "linux")]
pub fn recv_batch(fd: RawFd, buf: &mut Buffer, metas: &mut [RecvMeta]) -> io::Result<usize> {
    let count = buf.chunk_capacity().min(metas.len()).min(MAX_BATCH);
    let chunk_size = buf.chunk_size();

    let mut addrs: [libc::sockaddr_storage; MAX_BATCH] = unsafe { mem::zeroed() };
    let mut iovecs: [libc::iovec; MAX_BATCH] = unsafe { mem::zeroed() };
    let mut msgs: [libc::mmsghdr; MAX_BATCH] = unsafe { mem::zeroed() };

    let data = buf.data_mut();
    for i in 0..count {
        iovecs[i] = libc::iovec {
            iov_base: unsafe { data.as_mut_ptr().add(i * chunk_size) } as *mut libc::c_void,
            iov_len: chunk_size,
        };
        msgs[i].msg_hdr.msg_name = &mut addrs[i] as *mut _ as *mut libc::c_void;
        msgs[i].msg_hdr.msg_namelen = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        msgs[i].msg_hdr.msg_iov = &mut iovecs[i];
        msgs[i].msg_hdr.msg_iovlen = 1;
    }

    let received = unsafe {
        libc::recvmmsg(
            fd,
            msgs.as_mut_ptr(),
            count as libc::c_uint,
            0,
            std::ptr::null_mut(),
        )
    };
    if received < 0 {
        return Err(io::Error::last_os_error());
    }

    let received = received as usize;
    for i in 0..received {
        let source = sockaddr_to_std(&addrs[i], msgs[i].msg_hdr.msg_namelen)
            .unwrap_or(RecvMeta::EMPTY.source);
        metas[i] = RecvMeta {
            source,
            len: msgs[i].msg_len as usize,
        };
    }
    Ok(received)
}

/// Single-datagram receive for platforms without `recvmmsg`.
#[cfg(not(target_os = "linux"))]
pub fn recv_batch(fd: RawFd, buf: &mut Buffer, metas: &mut [RecvMeta]) -> io::Result<usize> {
    debug_assert!(!metas.is_empty());
    let chunk_size = buf.chunk_size();

    let mut addr: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut addr_len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;

    let received = unsafe {
        libc::recvfrom(
            fd,
            buf.data_mut().as_mut_ptr() as *mut libc::c_void,
            chunk_size,
            0,
            &mut addr as *mut _ as *mut libc::sockaddr,
            &mut addr_len,
        )
    };
    if received < 0 {
        return Err(io::Error::last_os_error());
    }

    metas[0] = RecvMeta {
        source: sockaddr_to_std(&addr, addr_len).unwrap_or(RecvMeta::EMPTY.source),
        len: received as usize,
    };
    Ok(1)
}

/// Convert a kernel-filled `sockaddr_storage` into a `SocketAddr`.
///
/// Returns `None` for families other than IPv4/IPv6 or when the kernel
/// reported fewer bytes than the family's sockaddr needs; the receive
/// path substitutes an unspecified source in that case.
pub fn sockaddr_to_std(storage: &libc::sockaddr_storage, len: libc::socklen_t) -> Option<SocketAddr> {
    let len = len as usize;
    match storage.ss_family as libc::c_int {
        libc::AF_INET if len >= mem::size_of::<libc::sockaddr_in>() => {
            let v4 = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
            // s_addr holds the octets in network order in memory.
            let ip = Ipv4Addr::from(v4.sin_addr.s_addr.to_ne_bytes());
            Some(SocketAddr::V4(SocketAddrV4::new(ip, u16::from_be(v4.sin_port))))
        }
        libc::AF_INET6 if len >= mem::size_of::<libc::sockaddr_in6>() => {
            let v6 = unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
            Some(SocketAddr::V6(SocketAddrV6::new(
                Ipv6Addr::from(v6.sin6_addr.s6_addr),
                u16::from_be(v6.sin6_port),
                u32::from_be(v6.sin6_flowinfo),
                v6.sin6_scope_id,
            )))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_listener_sets_nonblocking() {
        let socket = bind_listener("127.0.0.1:0".parse().unwrap()).unwrap();
        let mut scratch = [0u8; 16];
        // Non-blocking socket with nothing queued returns WouldBlock.
        let err = socket.recv_from(&mut scratch).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }

    #[test]
    fn test_listeners_share_port() {
        let first = bind_listener("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = first.local_addr().unwrap();
        // A second bind of the same port succeeds because of SO_REUSEPORT.
        let second = bind_listener(addr).unwrap();
        assert_eq!(second.local_addr().unwrap().port(), addr.port());
    }

    #[test]
    fn test_connect_session_shares_listener_port() {
        let listener = bind_listener("127.0.0.1:0".parse().unwrap()).unwrap();
        let source = listener.local_addr().unwrap();
        let dest: SocketAddr = "127.0.0.1:9".parse().unwrap();

        let session = connect_session(source, dest).unwrap();
        assert_eq!(session.local_addr().unwrap().port(), source.port());
        assert_eq!(session.peer_addr().unwrap(), dest);
    }

    #[test]
    fn test_recv_batch_reads_datagram() {
        let mut pool = crate::buffer_pool::BufferPool::with_layout(4, 2048);
        let listener = bind_listener("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = listener.local_addr().unwrap();

        let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
        sender.send_to(b"hello batch", addr).unwrap();

        // Give the loopback datagram a moment to land.
        std::thread::sleep(std::time::Duration::from_millis(50));

        let id = pool.allocate();
        let mut metas = [RecvMeta::EMPTY; MAX_BATCH];
        let n = recv_batch(listener.as_raw_fd(), pool.get_mut(id), &mut metas).unwrap();

        assert_eq!(n, 1);
        assert_eq!(metas[0].len, 11);
        assert_eq!(metas[0].source, sender.local_addr().unwrap());
        assert_eq!(&pool.get(id).data()[..11], b"hello batch");
    }

    #[test]
    fn test_sockaddr_conversion_v4() {
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let v4 = libc::sockaddr_in {
            sin_family: libc::AF_INET as libc::sa_family_t,
            sin_port: 8080u16.to_be(),
            sin_addr: libc::in_addr {
                s_addr: u32::from_ne_bytes([192, 0, 2, 7]),
            },
            sin_zero: [0; 8],
        };
        unsafe { std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in, v4) };

        let len = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
        let addr = sockaddr_to_std(&storage, len).unwrap();
        assert_eq!(addr, "192.0.2.7:8080".parse().unwrap());
    }

    #[test]
    fn test_sockaddr_conversion_v6() {
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut v6: libc::sockaddr_in6 = unsafe { mem::zeroed() };
        v6.sin6_family = libc::AF_INET6 as libc::sa_family_t;
        v6.sin6_port = 443u16.to_be();
        v6.sin6_addr.s6_addr = Ipv6Addr::LOCALHOST.octets();
        unsafe { std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in6, v6) };

        let len = mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t;
        let addr = sockaddr_to_std(&storage, len).unwrap();
        assert_eq!(addr, "[::1]:443".parse().unwrap());
    }

    #[test]
    fn test_sockaddr_conversion_rejects_bad_input() {
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        storage.ss_family = libc::AF_UNIX as libc::sa_family_t;
        let full = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        assert!(sockaddr_to_std(&storage, full).is_none());

        // Right family, short length.
        storage.ss_family = libc::AF_INET as libc::sa_family_t;
        assert!(sockaddr_to_std(&storage, 4).is_none());
    }

    #[test]
    fn test_recv_batch_would_block_when_empty() {
        let mut pool = crate::buffer_pool::BufferPool::with_layout(4, 2048);
        let listener = bind_listener("127.0.0.1:0".parse().unwrap()).unwrap();

        let id = pool.allocate();
        let mut metas = [RecvMeta::EMPTY; MAX_BATCH];
        let err = recv_batch(listener.as_raw_fd(), pool.get_mut(id), &mut metas).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }
}
