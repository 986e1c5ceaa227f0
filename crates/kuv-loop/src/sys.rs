//! Socket handle passing over Unix domain sockets
//!
//! A handle travels as `SCM_RIGHTS` ancillary data next to a small
//! payload. The receiver gets a new descriptor for the same open socket;
//! the sender may close its copy right after `send_fd` returns.

use std::io;
use std::mem;
use std::os::fd::{FromRawFd, OwnedFd, RawFd};
use std::ptr;

use cfg_if::cfg_if;
use nix::errno::Errno;

cfg_if! {
    if #[cfg(any(target_os = "linux", target_os = "android"))] {
        const SEND_FLAGS: libc::c_int = libc::MSG_NOSIGNAL;
        const RECV_FLAGS: libc::c_int = libc::MSG_CMSG_CLOEXEC;
    } else {
        const SEND_FLAGS: libc::c_int = 0;
        const RECV_FLAGS: libc::c_int = 0;
    }
}

/// Descriptors accepted per `recv_fds` call; extra ones are truncated by the kernel
pub const MAX_FDS_PER_READ: usize = 32;

/// Errno carried by an `io::Error`, `EIO` when there is none
#[inline]
pub fn errno_of(err: &io::Error) -> Errno {
    err.raw_os_error().map(Errno::from_raw).unwrap_or(Errno::EIO)
}

fn cmsg_space(fds: usize) -> usize {
    unsafe { libc::CMSG_SPACE((fds * mem::size_of::<RawFd>()) as libc::c_uint) as usize }
}

/// Control buffer aligned for `cmsghdr`
fn control_buffer(len: usize) -> Vec<u64> {
    vec![0u64; len.div_ceil(mem::size_of::<u64>())]
}

/// Send `payload` with one descriptor attached
pub fn send_fd(sock: RawFd, payload: &[u8], fd: RawFd) -> Result<usize, Errno> {
    let mut iov = libc::iovec {
        iov_base: payload.as_ptr() as *mut libc::c_void,
        iov_len: payload.len(),
    };
    let space = cmsg_space(1);
    let mut control = control_buffer(space);

    // Safety: msghdr is plain data; all-zero is an empty header
    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = control.as_mut_ptr() as *mut libc::c_void;
    msg.msg_controllen = space as _;

    // Safety: control has room for one cmsghdr carrying one RawFd
    unsafe {
        let cmsg = libc::CMSG_FIRSTHDR(&msg);
        (*cmsg).cmsg_level = libc::SOL_SOCKET;
        (*cmsg).cmsg_type = libc::SCM_RIGHTS;
        (*cmsg).cmsg_len = libc::CMSG_LEN(mem::size_of::<RawFd>() as libc::c_uint) as _;
        ptr::write_unaligned(libc::CMSG_DATA(cmsg) as *mut RawFd, fd);
    }

    loop {
        let n = unsafe { libc::sendmsg(sock, &msg, SEND_FLAGS) };
        match Errno::result(n) {
            Err(Errno::EINTR) => continue,
            other => return other.map(|n| n as usize),
        }
    }
}

/// Receive into `buf`, appending any attached descriptors to `fds`
///
/// Returns the number of payload bytes; `0` means the peer closed.
/// Descriptors are owned: dropping them closes them.
pub fn recv_fds(sock: RawFd, buf: &mut [u8], fds: &mut Vec<OwnedFd>) -> Result<usize, Errno> {
    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr() as *mut libc::c_void,
        iov_len: buf.len(),
    };
    let space = cmsg_space(MAX_FDS_PER_READ);
    let mut control = control_buffer(space);

    // Safety: as in send_fd
    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = control.as_mut_ptr() as *mut libc::c_void;
    msg.msg_controllen = space as _;

    let n = loop {
        let n = unsafe { libc::recvmsg(sock, &mut msg, RECV_FLAGS) };
        match Errno::result(n) {
            Err(Errno::EINTR) => continue,
            other => break other?,
        }
    };

    // Safety: the kernel filled msg_control; CMSG_* walk stays inside msg_controllen
    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
        while !cmsg.is_null() {
            if (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == libc::SCM_RIGHTS {
                let data = libc::CMSG_DATA(cmsg) as *const RawFd;
                let len = (*cmsg).cmsg_len as usize - libc::CMSG_LEN(0) as usize;
                for i in 0..len / mem::size_of::<RawFd>() {
                    fds.push(OwnedFd::from_raw_fd(ptr::read_unaligned(data.add(i))));
                }
            }
            cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
        }
    }

    if msg.msg_flags & libc::MSG_CTRUNC != 0 {
        return Err(Errno::EMSGSIZE);
    }
    Ok(n as usize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;

    #[test]
    fn test_fd_roundtrip_shares_socket() {
        let (tx, rx) = UnixStream::pair().unwrap();
        let (mut inner_a, inner_b) = UnixStream::pair().unwrap();

        assert_eq!(send_fd(tx.as_raw_fd(), b"D", inner_b.as_raw_fd()).unwrap(), 1);
        drop(inner_b);

        let mut buf = [0u8; 8];
        let mut fds = Vec::new();
        assert_eq!(recv_fds(rx.as_raw_fd(), &mut buf, &mut fds).unwrap(), 1);
        assert_eq!(buf[0], b'D');
        assert_eq!(fds.len(), 1);

        // the received descriptor is the other end of inner_a
        let mut received = UnixStream::from(fds.pop().unwrap());
        received.write_all(b"via fd").unwrap();
        let mut out = [0u8; 6];
        inner_a.read_exact(&mut out).unwrap();
        assert_eq!(&out, b"via fd");
    }

    #[test]
    fn test_plain_bytes_carry_no_fds() {
        let (mut tx, rx) = UnixStream::pair().unwrap();
        tx.write_all(b"hello").unwrap();

        let mut buf = [0u8; 8];
        let mut fds = Vec::new();
        assert_eq!(recv_fds(rx.as_raw_fd(), &mut buf, &mut fds).unwrap(), 5);
        assert!(fds.is_empty());
    }

    #[test]
    fn test_recv_eof() {
        let (tx, rx) = UnixStream::pair().unwrap();
        drop(tx);
        let mut buf = [0u8; 8];
        let mut fds = Vec::new();
        assert_eq!(recv_fds(rx.as_raw_fd(), &mut buf, &mut fds).unwrap(), 0);
    }

    #[test]
    fn test_recv_would_block() {
        let (_tx, rx) = UnixStream::pair().unwrap();
        rx.set_nonblocking(true).unwrap();
        let mut buf = [0u8; 8];
        let mut fds = Vec::new();
        assert_eq!(
            recv_fds(rx.as_raw_fd(), &mut buf, &mut fds),
            Err(Errno::EAGAIN)
        );
    }
}
