//! Server entry point: binds the control socket, accepts connections,
//! and drives the routing engine's idle-check timer.
//!
//! Grounded in the teacher's `gecko_platform::get_backend()` dispatch
//! (`gecko_platform/src/lib.rs`) for the "pick device kinds for this
//! host" shape, generalized from OS selection to device-kind selection:
//! this CORE has no real per-OS backend, only the fallback/cpal/loopback
//! device kinds `hearth_server::fallback` and `hearth_server::loopback`
//! provide.

use std::collections::HashMap;
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::time::Instant;

use nix::poll::{PollFd, PollFlags, PollTimeout};
use nix::sys::socket::{
    accept, bind, listen, socket, AddressFamily, Backlog, SockFlag, SockType, UnixAddr,
};
use tracing::{info, warn};

use hearth_proto::constants::MAX_CONTROL_FRAME;
use hearth_proto::message::{ClientMessageId, FrameHeader, FRAME_HEADER_SIZE};
use hearth_proto::scm::{recv_frame, send_frame};
use hearth_proto::{ClientMessage, ConnectionType, Direction, StreamId};
use hearth_sab::{ServerStateOwner, ServerStateRegion, SharedAudioBuffer};
use hearth_server::device::Device;
use hearth_server::fallback::{enumerate_hardware_outputs, new_fallback_backend, CpalOutputBackend};
use hearth_server::rclient::{identify_peer, RClient};
use hearth_server::routing::Router;
use hearth_server::wire::{decode_client_message, encode_server_message};
use hearth_server::ServerConfig;

const FALLBACK_OUTPUT_IDX: u32 = 0;
const FALLBACK_INPUT_IDX: u32 = 1;

/// Resources a completed `CONNECT_STREAM` handshake hands to this
/// connection's owner: the client's audio-notify fd and the server's own
/// mapped view of the SAB, kept alive for as long as the stream is open.
struct StreamResources {
    #[allow(dead_code)]
    audio_notify_fd: Option<OwnedFd>,
    #[allow(dead_code)]
    sab: SharedAudioBuffer,
}

struct Connection {
    fd: OwnedFd,
    client: RClient,
    streams: HashMap<StreamId, StreamResources>,
}

fn main() {
    tracing_subscriber::fmt::init();

    let config = ServerConfig::load();
    if let Err(e) = std::fs::create_dir_all(&config.socket_dir) {
        warn!("failed to create socket dir {:?}: {}", config.socket_dir, e);
    }

    let mut router = build_router();
    let socket_path = config.socket_dir.join(ConnectionType::Unified.socket_name());
    let _ = std::fs::remove_file(&socket_path);

    let listener = match bind_listener(&socket_path) {
        Ok(fd) => fd,
        Err(e) => {
            warn!("failed to bind control socket {:?}: {}", socket_path, e);
            return;
        }
    };
    info!("hearthd listening on {:?}", socket_path);

    // One region for the whole process's lifetime; every accepted client
    // gets its own `SCM_RIGHTS` duplicate of the same underlying fd in its
    // `CLIENT_CONNECTED` reply.
    let server_state = match ServerStateOwner::create() {
        Ok(s) => s,
        Err(e) => {
            warn!("failed to allocate server-state region: {e}");
            return;
        }
    };

    let mut connections: HashMap<RawFd, Connection> = HashMap::new();
    let mut next_client_id: u16 = 1;
    let mut last_timer = Instant::now();

    loop {
        let mut fds = Vec::with_capacity(connections.len() + 1);
        fds.push(PollFd::new(
            unsafe { BorrowedFd::borrow_raw(listener.as_raw_fd()) },
            PollFlags::POLLIN,
        ));
        let fd_order: Vec<RawFd> = connections.keys().copied().collect();
        for &fd in &fd_order {
            fds.push(PollFd::new(
                unsafe { BorrowedFd::borrow_raw(fd) },
                PollFlags::POLLIN,
            ));
        }

        let timeout = PollTimeout::try_from(config.timer_period.as_millis() as i32)
            .unwrap_or(PollTimeout::NONE);
        if nix::poll::poll(&mut fds, timeout).is_err() {
            continue;
        }

        if fds[0]
            .revents()
            .map(|r| r.contains(PollFlags::POLLIN))
            .unwrap_or(false)
        {
            accept_one(
                listener.as_raw_fd(),
                &mut connections,
                &mut next_client_id,
                &server_state,
            );
        }

        for (i, &fd) in fd_order.iter().enumerate() {
            let revents = fds[i + 1].revents().unwrap_or(PollFlags::empty());
            if revents.intersects(PollFlags::POLLHUP | PollFlags::POLLERR) {
                if let Some(mut conn) = connections.remove(&fd) {
                    conn.client.disconnect(&mut router, server_state.region());
                }
                continue;
            }
            if revents.contains(PollFlags::POLLIN) {
                let should_drop =
                    service_connection(&mut connections, fd, &mut router, server_state.region());
                if should_drop {
                    if let Some(mut conn) = connections.remove(&fd) {
                        conn.client.disconnect(&mut router, server_state.region());
                    }
                }
            }
        }

        let now = Instant::now();
        if now.duration_since(last_timer) >= config.timer_period {
            router.run_idle_check(now);
            router.drain_pending_retries(now);
            last_timer = now;
        }
    }
}

fn build_router() -> Router {
    let mut router = Router::new(FALLBACK_OUTPUT_IDX, FALLBACK_INPUT_IDX);
    router.add_device(Device::new(
        FALLBACK_OUTPUT_IDX,
        Direction::Output,
        "fallback-output",
        8,
        new_fallback_backend(8),
    ));
    router.add_device(Device::new(
        FALLBACK_INPUT_IDX,
        Direction::Input,
        "fallback-input",
        8,
        new_fallback_backend(8),
    ));

    let mut next_idx = 2;
    for hw in enumerate_hardware_outputs() {
        let backend = CpalOutputBackend::new(hw);
        router.add_device(Device::new(next_idx, Direction::Output, "hardware-output", 8, Box::new(backend)));
        next_idx += 1;
    }

    router
}

/// Bind the control socket as `AF_UNIX, SOCK_SEQPACKET` per the external
/// interface contract: every control message is one packet, never a byte
/// stream, so message boundaries come from the kernel instead of the
/// length prefix alone.
fn bind_listener(path: &std::path::Path) -> nix::Result<OwnedFd> {
    let fd = socket(
        AddressFamily::Unix,
        SockType::SeqPacket,
        SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
        None,
    )?;
    let addr = UnixAddr::new(path)?;
    bind(fd.as_raw_fd(), &addr)?;
    listen(&fd, Backlog::new(128).unwrap_or(Backlog::MAXCONN))?;
    Ok(fd)
}

fn accept_one(
    listener_fd: RawFd,
    connections: &mut HashMap<RawFd, Connection>,
    next_client_id: &mut u16,
    server_state: &ServerStateOwner,
) {
    match accept(listener_fd) {
        Ok(raw) => {
            // SAFETY: `accept` returns a freshly-opened fd we now own exclusively.
            let fd = unsafe { OwnedFd::from_raw_fd(raw) };
            if let Err(e) = set_nonblocking(&fd) {
                warn!("failed to set accepted socket nonblocking: {e}");
                return;
            }
            let identity = match identify_peer(fd.as_raw_fd()) {
                Ok(id) => id,
                Err(e) => {
                    warn!("failed to identify peer: {e}");
                    return;
                }
            };
            let client_id = *next_client_id;
            *next_client_id = next_client_id.wrapping_add(1).max(1);

            let raw_fd = fd.as_raw_fd();
            let client = RClient::new(client_id, identity);
            let conn = Connection {
                fd,
                client,
                streams: HashMap::new(),
            };

            let state_fd = match server_state.dup_fd() {
                Ok(f) => f,
                Err(e) => {
                    warn!("failed to dup server-state fd for client {client_id}: {e}");
                    return;
                }
            };
            let reply = hearth_proto::ServerMessage::ClientConnected { client_id };
            let (id, payload) = encode_server_message(&reply);
            let mut frame = FrameHeader {
                length: (FRAME_HEADER_SIZE + payload.len()) as u32,
                id: id as u32,
            }
            .to_bytes()
            .to_vec();
            frame.extend_from_slice(&payload);
            if let Err(e) = send_frame(conn.fd.as_raw_fd(), &frame, &[state_fd.as_raw_fd()]) {
                warn!("failed to send CLIENT_CONNECTED to client {client_id}: {e}");
                return;
            }

            connections.insert(raw_fd, conn);
            info!(client_id, uid = identity.uid, "client connected");
        }
        Err(nix::errno::Errno::EAGAIN) => {}
        Err(e) => warn!("accept failed: {e}"),
    }
}

fn set_nonblocking(fd: &OwnedFd) -> nix::Result<()> {
    use nix::fcntl::{fcntl, FcntlArg, OFlag};
    let flags = OFlag::from_bits_truncate(fcntl(fd.as_raw_fd(), FcntlArg::F_GETFL)?);
    fcntl(fd.as_raw_fd(), FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK))?;
    Ok(())
}

/// Read and dispatch exactly one frame from `fd`'s connection. Each
/// `SOCK_SEQPACKET` packet is one logical message: a single `recvmsg()`
/// yields the whole payload plus any ancillary fds together, so header and
/// payload are sliced out of one buffer rather than read in two calls.
/// `CONNECT_STREAM` is special-cased here (it is the one client message
/// carrying an `SCM_RIGHTS` fd); everything else goes through
/// `RClient::handle_message` unchanged. Returns `true` if the connection
/// should be torn down (EOF or protocol error).
fn service_connection(
    connections: &mut HashMap<RawFd, Connection>,
    fd: RawFd,
    router: &mut Router,
    state: &ServerStateRegion,
) -> bool {
    let Some(conn) = connections.get_mut(&fd) else {
        return true;
    };

    let mut buf = [0u8; MAX_CONTROL_FRAME];
    let (n, mut fds) = match recv_frame(conn.fd.as_raw_fd(), &mut buf) {
        Ok((0, _)) => return true,
        Ok(v) => v,
        Err(e) => {
            if matches!(&e, hearth_proto::ProtoError::Errno(errno) if *errno == nix::errno::Errno::EAGAIN as i32) {
                return false;
            }
            return true;
        }
    };

    if n < FRAME_HEADER_SIZE {
        warn!("short frame from client {}: {} bytes", fd, n);
        return true;
    }

    let header = match FrameHeader::from_bytes(&buf[..FRAME_HEADER_SIZE]) {
        Ok(h) => h,
        Err(e) => {
            warn!("bad frame header: {e}");
            return true;
        }
    };

    if FrameHeader::validate_length(header.length, n).is_err() {
        warn!("frame length mismatch: declared {}, received {}", header.length, n);
        return true;
    }

    let payload = &buf[FRAME_HEADER_SIZE..n];

    let Ok(msg_id) = ClientMessageId::from_wire(header.id) else {
        warn!("unknown client message id {}", header.id);
        return true;
    };

    if FrameHeader::validate_fd_count(msg_id.expected_fds(), fds.len()).is_err() {
        warn!(
            "fd count mismatch for {:?}: expected {}, got {}",
            msg_id,
            msg_id.expected_fds(),
            fds.len()
        );
        return true;
    }

    let msg = match decode_client_message(msg_id, payload) {
        Ok(m) => m,
        Err(e) => {
            warn!("failed to decode message {:?}: {e}", msg_id);
            return false;
        }
    };

    if let ClientMessage::ConnectStream {
        direction,
        format,
        buffer_frames,
        cb_threshold,
        dev_idx,
        ..
    } = msg
    {
        let audio_notify_fd = fds.pop();
        let reply = match conn.client.handle_connect_stream(
            router,
            state,
            direction,
            format,
            buffer_frames,
            cb_threshold,
            0,
            dev_idx,
            audio_notify_fd,
        ) {
            Ok(outcome) => {
                let reply_msg = hearth_proto::ServerMessage::StreamConnected {
                    stream_id: outcome.stream_id,
                    err: 0,
                    samples_shm_size: outcome.samples_shm_size,
                };
                let stream_fds = [
                    outcome.header_fd.as_raw_fd(),
                    outcome.samples_fd.as_raw_fd(),
                ];
                let sent = send_reply(conn.fd.as_raw_fd(), &reply_msg, &stream_fds);
                conn.streams.insert(
                    outcome.stream_id,
                    StreamResources {
                        audio_notify_fd: outcome.audio_notify_fd,
                        sab: outcome.sab,
                    },
                );
                sent
            }
            Err(e) => {
                let reply_msg = hearth_proto::ServerMessage::StreamConnected {
                    stream_id: StreamId::new(conn.client.client_id, 0),
                    err: e.as_wire_code(),
                    samples_shm_size: 0,
                };
                send_reply(conn.fd.as_raw_fd(), &reply_msg, &[])
            }
        };
        let _ = sent_or_warn(reply);
        return false;
    }

    if let ClientMessage::DisconnectStream { stream_id } = msg {
        conn.streams.remove(&stream_id);
    }

    if let Some(reply) = conn.client.handle_message(router, state, msg) {
        let _ = send_reply(conn.fd.as_raw_fd(), &reply, &[]);
    }
    false
}

fn send_reply(fd: RawFd, msg: &hearth_proto::ServerMessage, fds: &[RawFd]) -> Result<(), hearth_proto::ProtoError> {
    let (id, payload) = encode_server_message(msg);
    let header = FrameHeader {
        length: (FRAME_HEADER_SIZE + payload.len()) as u32,
        id: id as u32,
    };
    let mut buf = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len());
    buf.extend_from_slice(&header.to_bytes());
    buf.extend_from_slice(&payload);
    send_frame(fd, &buf, fds)
}

fn sent_or_warn(result: Result<(), hearth_proto::ProtoError>) -> Result<(), hearth_proto::ProtoError> {
    if let Err(e) = &result {
        warn!("failed to send reply: {e}");
    }
    result
}
