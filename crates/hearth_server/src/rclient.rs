//! Per-connection request handling and peer-credential identification.
//!
//! One `RClient` per accepted control-socket connection, mirroring the
//! client side's `ControlTask` ownership discipline: this owns the
//! connection's client id, its registered notifications, and its
//! `STREAM_CONNECTED`/`CONNECT_STREAM` bookkeeping exclusively. Grounded
//! in the teacher's single-responsibility-per-task style
//! (`gecko_core`'s engine owning device state exclusively while streams
//! own their own buffers).

use std::collections::HashSet;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::atomic::Ordering;

use nix::sys::socket::{getsockopt, sockopt::PeerCredentials, UnixCredentials};
use tracing::info;

use hearth_proto::{
    AudioFormat, ClientMessage, Direction, NotificationKind, ServerMessage, StreamId,
};
use hearth_sab::{ServerStateRegion, SharedAudioBuffer};

use crate::error::ServerError;
use crate::routing::Router;
use crate::stream_list::{ClientType, StreamParams};

/// The credentials identified for a connecting peer via `SO_PEERCRED`.
/// Not currently used to deny connections (the control socket's
/// filesystem permissions are the access boundary), but exposed so a
/// future policy (e.g. per-uid stream quotas) has it available without
/// re-threading the accept path.
#[derive(Debug, Clone, Copy)]
pub struct PeerIdentity {
    pub pid: i32,
    pub uid: u32,
    pub gid: u32,
}

pub fn identify_peer(fd: RawFd) -> Result<PeerIdentity, ServerError> {
    let creds: UnixCredentials = getsockopt(
        &unsafe { std::os::fd::BorrowedFd::borrow_raw(fd) },
        PeerCredentials,
    )
    .map_err(|e| ServerError::Errno(e as i32))?;
    Ok(PeerIdentity {
        pid: creds.pid(),
        uid: creds.uid(),
        gid: creds.gid(),
    })
}

/// Everything a completed `CONNECT_STREAM` handshake produces: the ids and
/// size to encode into the `STREAM_CONNECTED` payload, the two SAB fds to
/// send alongside it over `SCM_RIGHTS`, and the resources the caller must
/// keep alive for the stream's lifetime (the client's audio-notify fd and
/// the server's own mapped view of the SAB).
pub struct ConnectStreamOutcome {
    pub stream_id: StreamId,
    pub samples_shm_size: u64,
    pub header_fd: OwnedFd,
    pub samples_fd: OwnedFd,
    pub audio_notify_fd: Option<OwnedFd>,
    pub sab: SharedAudioBuffer,
}

pub struct RClient {
    pub client_id: u16,
    pub identity: PeerIdentity,
    pub registered_notifications: HashSet<NotificationKind>,
    next_stream_index: u16,
}

impl RClient {
    pub fn new(client_id: u16, identity: PeerIdentity) -> Self {
        Self {
            client_id,
            identity,
            registered_notifications: HashSet::new(),
            next_stream_index: 0,
        }
    }

    fn allocate_stream_id(&mut self, router: &Router) -> Result<StreamId, ServerError> {
        let start = self.next_stream_index;
        loop {
            let candidate = StreamId::new(self.client_id, self.next_stream_index);
            self.next_stream_index = self.next_stream_index.wrapping_add(1);
            if router.streams().get(candidate).is_none() {
                return Ok(candidate);
            }
            if self.next_stream_index == start {
                return Err(ServerError::NotSupported("stream id space exhausted"));
            }
        }
    }

    /// §4.10 step 2: validate, allocate the SAB, create the rstream, run
    /// `stream_added`, and build the reply. `audio_notify_fd` is the
    /// client's end of the audio-notify socket, received over `SCM_RIGHTS`
    /// alongside `CONNECT_STREAM`; this CORE's bookkeeping keeps it (the
    /// caller stores it per-connection), it does not yet push
    /// `REQUEST_DATA`/`DATA_READY` traffic across it.
    pub fn handle_connect_stream(
        &mut self,
        router: &mut Router,
        state: &ServerStateRegion,
        direction: Direction,
        format: AudioFormat,
        buffer_frames: u32,
        cb_threshold: u32,
        flags: u32,
        dev_idx: Option<u32>,
        audio_notify_fd: Option<OwnedFd>,
    ) -> Result<ConnectStreamOutcome, ServerError> {
        let stream_id = self.allocate_stream_id(router)?;
        let used_size = format.frames_to_bytes(cb_threshold) as u64;
        let frame_bytes = format.bytes_per_frame() as u32;

        let (sab, header_fd, samples_fd) =
            SharedAudioBuffer::create(frame_bytes, buffer_frames, used_size as u32)?;

        let params = StreamParams {
            direction,
            format,
            client_type: ClientType::Pcm,
            buffer_frames,
            cb_threshold,
            flags,
            pinned_dev_idx: dev_idx,
        };
        let client_shm_fd = audio_notify_fd.as_ref().map(|fd| fd.as_raw_fd());
        router.streams_mut().create(stream_id, params, client_shm_fd)?;

        let rstream_view = router
            .streams()
            .get(stream_id)
            .map(clone_view)
            .expect("just created");

        if let Err(e) = router.stream_added(&rstream_view) {
            let _ = router.streams_mut().destroy(stream_id);
            return Err(e);
        }

        sync_derived_state(router, state);

        Ok(ConnectStreamOutcome {
            stream_id,
            samples_shm_size: used_size,
            header_fd,
            samples_fd,
            audio_notify_fd,
            sab,
        })
    }

    pub fn handle_disconnect_stream(
        &mut self,
        router: &mut Router,
        state: &ServerStateRegion,
        stream_id: StreamId,
    ) -> Result<(), ServerError> {
        let rstream = router.streams_mut().destroy(stream_id)?;
        router.stream_removed(&rstream);
        sync_derived_state(router, state);
        Ok(())
    }

    pub fn register_notification(&mut self, kind: NotificationKind) {
        self.registered_notifications.insert(kind);
    }

    /// Disconnect cleanup: tear down every stream still open for this
    /// client, mirroring `stream_list::remove_all_for_client` plus the
    /// routing detach each one needs.
    pub fn disconnect(&mut self, router: &mut Router, state: &ServerStateRegion) {
        let ids: Vec<StreamId> = router
            .streams()
            .iter()
            .filter(|s| s.id.client_id() == self.client_id)
            .map(|s| s.id)
            .collect();
        for id in ids {
            if let Ok(rstream) = router.streams_mut().destroy(id) {
                router.stream_removed(&rstream);
            }
        }
        sync_derived_state(router, state);
        info!(client_id = self.client_id, "client disconnected, streams torn down");
    }

    /// Top-level request dispatcher for one parsed [`ClientMessage`],
    /// excluding `CONNECT_STREAM`: that one carries an ancillary fd the
    /// generic decode-then-dispatch path here never sees, so the
    /// accept/service loop calls [`RClient::handle_connect_stream`]
    /// directly instead of routing through this method. Returns `None` for
    /// messages this CORE passes through without a synchronous reply
    /// (dump/debug/admin calls, modeled as `Opaque`).
    pub fn handle_message(
        &mut self,
        router: &mut Router,
        state: &ServerStateRegion,
        msg: ClientMessage,
    ) -> Option<ServerMessage> {
        match msg {
            ClientMessage::ConnectStream { .. } => {
                debug_assert!(
                    false,
                    "CONNECT_STREAM must be handled via handle_connect_stream directly"
                );
                None
            }
            ClientMessage::DisconnectStream { stream_id } => {
                let _ = self.handle_disconnect_stream(router, state, stream_id);
                None
            }
            ClientMessage::SelectNode { direction, node_id } => {
                let _ = router.select_node(direction, node_id);
                bump_nodes_generation(state);
                sync_derived_state(router, state);
                Some(ServerMessage::ActiveNodeChanged { direction, node_id })
            }
            ClientMessage::AddActiveNode { direction, node_id } => {
                let _ = router.add_active_node(direction, node_id);
                bump_nodes_generation(state);
                sync_derived_state(router, state);
                Some(ServerMessage::ActiveNodeChanged { direction, node_id })
            }
            ClientMessage::RmActiveNode { direction, node_id } => {
                router.disable_dev(node_id, crate::routing::DisableMode::Soft);
                bump_nodes_generation(state);
                sync_derived_state(router, state);
                let _ = direction;
                None
            }
            ClientMessage::Suspend => {
                router.suspend();
                sync_derived_state(router, state);
                None
            }
            ClientMessage::Resume => {
                router.resume();
                sync_derived_state(router, state);
                None
            }
            ClientMessage::RequestFloop { client_types_mask } => {
                match router.loopback.request_floop(client_types_mask) {
                    Ok(dev_idx) => Some(ServerMessage::RequestFloopReady { dev_idx }),
                    Err(_) => None,
                }
            }
            ClientMessage::SetSystemVolume { volume } => {
                state.write(|r| r.system_volume.store(volume, Ordering::Relaxed));
                Some(ServerMessage::OutputVolumeChanged { volume })
            }
            ClientMessage::SetSystemMute { mute } => {
                state.write(|r| r.system_mute.store(mute, Ordering::Relaxed));
                Some(ServerMessage::OutputMuteChanged { mute })
            }
            ClientMessage::RegisterNotification { kind } => {
                self.register_notification(kind);
                None
            }
            ClientMessage::Opaque { .. } => None,
        }
    }
}

/// Writes the fields of [`ServerStateRegion`] that are derived from
/// router state rather than set directly by a single client request:
/// stream counts per direction and the NC-blocked flag. Called after
/// every operation that can move either, so a client reading the region
/// after a change notification observes the new value (§5, §8).
fn sync_derived_state(router: &mut Router, state: &ServerStateRegion) {
    router.recompute_nc_blocked(false);
    let num_output = router.streams().iter_direction(Direction::Output).count() as u32;
    let num_input = router.streams().iter_direction(Direction::Input).count() as u32;
    let nc_blocked = router.nc_blocked();
    state.write(|r| {
        r.num_output_streams.store(num_output, Ordering::Relaxed);
        r.num_input_streams.store(num_input, Ordering::Relaxed);
        r.nc_blocked.store(nc_blocked, Ordering::Relaxed);
    });
}

fn bump_nodes_generation(state: &ServerStateRegion) {
    state.write(|r| {
        r.nodes_generation.fetch_add(1, Ordering::Relaxed);
    });
}

fn clone_view(rstream: &crate::stream_list::RStream) -> crate::stream_list::RStream {
    crate::stream_list::RStream {
        id: rstream.id,
        direction: rstream.direction,
        format: rstream.format,
        client_type: rstream.client_type,
        buffer_frames: rstream.buffer_frames,
        cb_threshold: rstream.cb_threshold,
        flags: rstream.flags,
        client_shm_fd: rstream.client_shm_fd,
        pinned_dev_idx: rstream.pinned_dev_idx,
        start_ts: rstream.start_ts,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Device;
    use crate::fallback::new_fallback_backend;
    use hearth_proto::SampleFormat;
    use hearth_sab::ServerStateOwner;

    fn test_identity() -> PeerIdentity {
        PeerIdentity {
            pid: 1,
            uid: 1000,
            gid: 1000,
        }
    }

    fn make_router() -> Router {
        let mut router = Router::new(0, 1);
        router.add_device(Device::new(0, Direction::Output, "fallback-output", 8, new_fallback_backend(8)));
        router.add_device(Device::new(1, Direction::Input, "fallback-input", 8, new_fallback_backend(8)));
        router.set_hotword_pause_at_suspend(false);
        router
    }

    #[test]
    fn connect_then_disconnect_stream_round_trips() {
        let mut router = make_router();
        router.add_device(Device::new(0, Direction::Output, "fallback-output", 8, new_fallback_backend(8)));
        let mut client = RClient::new(7, test_identity());
        let owner = ServerStateOwner::create().unwrap();

        let fmt = AudioFormat::new(SampleFormat::S16Le, 48_000, 2);
        let outcome = client
            .handle_connect_stream(&mut router, owner.region(), Direction::Output, fmt, 4096, 480, 0, None, None)
            .unwrap();
        let id = outcome.stream_id;
        assert_eq!(id.client_id(), 7);
        assert!(outcome.samples_shm_size > 0);
        assert_eq!(owner.region().read().num_output_streams, 1);

        client.handle_disconnect_stream(&mut router, owner.region(), id).unwrap();
        assert!(router.streams().get(id).is_none());
        assert_eq!(owner.region().read().num_output_streams, 0);
    }

    #[test]
    fn disconnect_tears_down_all_streams_for_client() {
        let mut router = make_router();
        let mut client = RClient::new(3, test_identity());
        let fmt = AudioFormat::new(SampleFormat::S16Le, 48_000, 2);
        let owner = ServerStateOwner::create().unwrap();

        client
            .handle_connect_stream(&mut router, owner.region(), Direction::Output, fmt, 4096, 480, 0, None, None)
            .unwrap();
        client
            .handle_connect_stream(&mut router, owner.region(), Direction::Input, fmt, 4096, 480, 0, None, None)
            .unwrap();
        assert_eq!(router.streams().len(), 2);

        client.disconnect(&mut router, owner.region());
        assert_eq!(router.streams().len(), 0);
        let snap = owner.region().read();
        assert_eq!(snap.num_output_streams, 0);
        assert_eq!(snap.num_input_streams, 0);
    }

    #[test]
    fn set_system_volume_and_mute_write_through_to_state_region() {
        let mut router = make_router();
        let mut client = RClient::new(9, test_identity());
        let owner = ServerStateOwner::create().unwrap();

        client.handle_message(
            &mut router,
            owner.region(),
            ClientMessage::SetSystemVolume { volume: 73 },
        );
        client.handle_message(
            &mut router,
            owner.region(),
            ClientMessage::SetSystemMute { mute: true },
        );

        let snap = owner.region().read();
        assert_eq!(snap.system_volume, 73);
        assert!(snap.system_mute);
    }

    #[test]
    fn node_change_bumps_nodes_generation() {
        let mut router = make_router();
        let mut client = RClient::new(4, test_identity());
        let owner = ServerStateOwner::create().unwrap();
        let before = owner.region().read().nodes_generation;

        client.handle_message(
            &mut router,
            owner.region(),
            ClientMessage::RmActiveNode { direction: Direction::Output, node_id: 0 },
        );

        assert_eq!(owner.region().read().nodes_generation, before + 1);
    }

    #[test]
    fn stream_id_allocation_is_scoped_to_client() {
        let mut router = make_router();
        let mut client_a = RClient::new(1, test_identity());
        let mut client_b = RClient::new(2, test_identity());

        let a = client_a.allocate_stream_id(&router).unwrap();
        let b = client_b.allocate_stream_id(&router).unwrap();
        assert_eq!(a.client_id(), 1);
        assert_eq!(b.client_id(), 2);
    }
}
