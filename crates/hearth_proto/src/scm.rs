//! Ancillary file-descriptor framing shared by both sides of the control
//! socket: every frame is `{length, id}` followed by its payload, exactly
//! as [`crate::message::FrameHeader`] describes, but a fixed subset of ids
//! also carry `SCM_RIGHTS` fds alongside the bytes (see
//! `ClientMessageId::expected_fds`/`ServerMessageId::expected_fds`).
//!
//! `nix::unistd::read`/`write` can't touch ancillary data, so any frame
//! with a nonzero fd count must go through `sendmsg`/`recvmsg` instead;
//! this module is the one place that happens, so `hearth_client::control`
//! and `hearth_server`'s accept/service loop share one implementation of
//! the `SOCK_SEQPACKET` message-plus-fds framing instead of each hand
//! rolling their own `cmsg_space!` bookkeeping.

use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

use nix::sys::socket::{
    recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags, UnixAddr,
};

use crate::error::ProtoError;

/// Up to this many fds ride on one frame; `STREAM_CONNECTED`'s two SAB fds
/// is the largest case today. Sized with headroom so a future message
/// needing one more fd doesn't require touching this constant's callers.
pub const MAX_FRAME_FDS: usize = 4;

/// Send one already-framed byte buffer (header + payload) plus zero or
/// more ancillary fds in a single `sendmsg`. The fds are borrowed: the
/// caller keeps ownership and closes them (or not) as its own protocol
/// bookkeeping dictates.
pub fn send_frame(fd: RawFd, bytes: &[u8], fds: &[RawFd]) -> Result<(), ProtoError> {
    let iov = [std::io::IoSlice::new(bytes)];
    let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
    if fds.is_empty() {
        sendmsg::<UnixAddr>(borrowed.as_raw_fd(), &iov, &[], MsgFlags::empty(), None)
            .map_err(|e| ProtoError::Errno(e as i32))?;
    } else {
        let cmsg = [ControlMessage::ScmRights(fds)];
        sendmsg::<UnixAddr>(borrowed.as_raw_fd(), &iov, &cmsg, MsgFlags::empty(), None)
            .map_err(|e| ProtoError::Errno(e as i32))?;
    }
    Ok(())
}

/// Receive one `SOCK_SEQPACKET` datagram into `buf`, plus up to
/// `MAX_FRAME_FDS` ancillary fds. Returns the number of bytes read and the
/// fds that came with it, in the order the peer passed them to
/// [`send_frame`]. A `0`-byte return with no fds is EOF, matching plain
/// `read`'s convention.
pub fn recv_frame(fd: RawFd, buf: &mut [u8]) -> Result<(usize, Vec<OwnedFd>), ProtoError> {
    let mut iov = [std::io::IoSliceMut::new(buf)];
    let mut cmsg_buf = nix::cmsg_space!([RawFd; MAX_FRAME_FDS]);
    let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
    let msg = recvmsg::<UnixAddr>(
        borrowed.as_raw_fd(),
        &mut iov,
        Some(&mut cmsg_buf),
        MsgFlags::empty(),
    )
    .map_err(|e| ProtoError::Errno(e as i32))?;

    let mut fds = Vec::new();
    for cmsg in msg.cmsgs().map_err(|e| ProtoError::Errno(e as i32))? {
        if let ControlMessageOwned::ScmRights(raw_fds) = cmsg {
            for raw in raw_fds {
                // SAFETY: the kernel just handed us ownership of this fd
                // via SCM_RIGHTS; nothing else in the process has a handle
                // to it yet.
                fds.push(unsafe { OwnedFd::from_raw_fd(raw) });
            }
        }
    }

    Ok((msg.bytes, fds))
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};
    use nix::sys::memfd::{memfd_create, MemFdCreateFlag};

    #[test]
    fn frame_without_fds_round_trips() {
        let (a, b) = socketpair(AddressFamily::Unix, SockType::SeqPacket, None, SockFlag::empty()).unwrap();
        send_frame(a.as_raw_fd(), b"hello", &[]).unwrap();
        let mut buf = [0u8; 16];
        let (n, fds) = recv_frame(b.as_raw_fd(), &mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello");
        assert!(fds.is_empty());
    }

    #[test]
    fn frame_with_one_fd_round_trips() {
        let (a, b) = socketpair(AddressFamily::Unix, SockType::SeqPacket, None, SockFlag::empty()).unwrap();
        let shm = memfd_create(c"scm-test", MemFdCreateFlag::MFD_CLOEXEC).unwrap();
        send_frame(a.as_raw_fd(), b"fd-carrying", &[shm.as_raw_fd()]).unwrap();

        let mut buf = [0u8; 32];
        let (n, fds) = recv_frame(b.as_raw_fd(), &mut buf).unwrap();
        assert_eq!(&buf[..n], b"fd-carrying");
        assert_eq!(fds.len(), 1);
    }

    #[test]
    fn eof_is_zero_bytes_no_fds() {
        let (a, b) = socketpair(AddressFamily::Unix, SockType::SeqPacket, None, SockFlag::empty()).unwrap();
        drop(a);
        let mut buf = [0u8; 8];
        let (n, fds) = recv_frame(b.as_raw_fd(), &mut buf).unwrap();
        assert_eq!(n, 0);
        assert!(fds.is_empty());
    }
}
