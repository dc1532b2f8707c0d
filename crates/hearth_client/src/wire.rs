//! Client-side half of the control-socket codec: the mirror image of
//! `hearth_server::wire`. The server owns `decode_client_message` /
//! `encode_server_message`; this module owns `encode_client_message` /
//! `decode_server_message` so the two crates never need to share a
//! concrete byte-layout type, only the wire contract in `hearth_proto`.

use hearth_proto::{
    AudioFormat, ClientMessage, Direction, SampleFormat, ServerMessage, ServerMessageId, StreamId,
};

use crate::error::ClientError;

/// Encode a [`ClientMessage`] into its wire id plus payload bytes, matching
/// the layout `hearth_server::wire::decode_client_message` expects.
pub fn encode_client_message(msg: &ClientMessage) -> (hearth_proto::ClientMessageId, Vec<u8>) {
    use hearth_proto::ClientMessageId as Id;
    let mut buf = Vec::new();
    let id = match msg {
        ClientMessage::ConnectStream {
            direction,
            stream_id,
            buffer_frames,
            cb_threshold,
            format,
            dev_idx,
        } => {
            buf.push(direction.to_wire());
            buf.extend_from_slice(&buffer_frames.to_le_bytes());
            buf.extend_from_slice(&cb_threshold.to_le_bytes());
            buf.push(format.sample_format as u8);
            buf.extend_from_slice(&format.rate_hz.to_le_bytes());
            buf.push(format.num_channels);
            buf.extend_from_slice(&stream_id.raw().to_le_bytes());
            if let Some(idx) = dev_idx {
                buf.extend_from_slice(&(*idx as i32).to_le_bytes());
            } else {
                buf.extend_from_slice(&(-1i32).to_le_bytes());
            }
            Id::ConnectStream
        }
        ClientMessage::DisconnectStream { stream_id } => {
            buf.extend_from_slice(&stream_id.raw().to_le_bytes());
            Id::DisconnectStream
        }
        ClientMessage::SetSystemVolume { volume } => {
            buf.extend_from_slice(&volume.to_le_bytes());
            Id::SetSystemVolume
        }
        ClientMessage::SetSystemMute { mute } => {
            buf.push(*mute as u8);
            Id::SetSystemMute
        }
        ClientMessage::SelectNode { direction, node_id } => {
            buf.push(direction.to_wire());
            buf.extend_from_slice(&node_id.to_le_bytes());
            Id::SelectNode
        }
        ClientMessage::AddActiveNode { direction, node_id } => {
            buf.push(direction.to_wire());
            buf.extend_from_slice(&node_id.to_le_bytes());
            Id::AddActiveNode
        }
        ClientMessage::RmActiveNode { direction, node_id } => {
            buf.push(direction.to_wire());
            buf.extend_from_slice(&node_id.to_le_bytes());
            Id::RmActiveNode
        }
        ClientMessage::Suspend => Id::Suspend,
        ClientMessage::Resume => Id::Resume,
        ClientMessage::RequestFloop { client_types_mask } => {
            buf.extend_from_slice(&client_types_mask.to_le_bytes());
            Id::RequestFloop
        }
        ClientMessage::RegisterNotification { kind } => {
            buf.push(kind.to_wire());
            Id::RegisterNotification
        }
        ClientMessage::Opaque { id } => *id,
    };
    (id, buf)
}

/// Decode a `{id, payload}` pair read off the control socket into a
/// [`ServerMessage`]. A short or malformed payload on a known id is a
/// protocol error per §4.2: the caller treats it as fatal to the current
/// operation, never as "retry with more bytes".
pub fn decode_server_message(id: ServerMessageId, payload: &[u8]) -> Result<ServerMessage, ClientError> {
    match id {
        ServerMessageId::ClientConnected => {
            if payload.len() < 2 {
                return Err(short_payload(payload.len()));
            }
            let client_id = u16::from_le_bytes(payload[0..2].try_into().unwrap());
            Ok(ServerMessage::ClientConnected { client_id })
        }
        ServerMessageId::StreamConnected => {
            if payload.len() < 16 {
                return Err(short_payload(payload.len()));
            }
            let stream_id = StreamId::from_raw(u32::from_le_bytes(payload[0..4].try_into().unwrap()));
            let err = i32::from_le_bytes(payload[4..8].try_into().unwrap());
            let samples_shm_size = u64::from_le_bytes(payload[8..16].try_into().unwrap());
            Ok(ServerMessage::StreamConnected {
                stream_id,
                err,
                samples_shm_size,
            })
        }
        ServerMessageId::NodesChanged => Ok(ServerMessage::NodesChanged),
        ServerMessageId::ActiveNodeChanged => {
            if payload.len() < 5 {
                return Err(short_payload(payload.len()));
            }
            let direction = direction_from_wire(payload[0])?;
            let node_id = u32::from_le_bytes(payload[1..5].try_into().unwrap());
            Ok(ServerMessage::ActiveNodeChanged { direction, node_id })
        }
        ServerMessageId::OutputVolumeChanged => {
            if payload.len() < 4 {
                return Err(short_payload(payload.len()));
            }
            Ok(ServerMessage::OutputVolumeChanged {
                volume: u32::from_le_bytes(payload[0..4].try_into().unwrap()),
            })
        }
        ServerMessageId::OutputMuteChanged => {
            if payload.is_empty() {
                return Err(short_payload(payload.len()));
            }
            Ok(ServerMessage::OutputMuteChanged { mute: payload[0] != 0 })
        }
        ServerMessageId::CaptureGainChanged => {
            if payload.len() < 4 {
                return Err(short_payload(payload.len()));
            }
            Ok(ServerMessage::CaptureGainChanged {
                gain: i32::from_le_bytes(payload[0..4].try_into().unwrap()),
            })
        }
        ServerMessageId::CaptureMuteChanged => {
            if payload.is_empty() {
                return Err(short_payload(payload.len()));
            }
            Ok(ServerMessage::CaptureMuteChanged { mute: payload[0] != 0 })
        }
        ServerMessageId::RequestFloopReady => {
            if payload.len() < 4 {
                return Err(short_payload(payload.len()));
            }
            Ok(ServerMessage::RequestFloopReady {
                dev_idx: u32::from_le_bytes(payload[0..4].try_into().unwrap()),
            })
        }
        ServerMessageId::NumActiveStreamsChanged => {
            if payload.len() < 5 {
                return Err(short_payload(payload.len()));
            }
            let direction = direction_from_wire(payload[0])?;
            let num_streams = u32::from_le_bytes(payload[1..5].try_into().unwrap());
            Ok(ServerMessage::NumActiveStreamsChanged { direction, num_streams })
        }
        // AUDIO_DEBUG_INFO_READY / ATLOG_FD_READY / GET_HOTWORD_MODELS_READY
        // carry debug/admin payloads this CORE doesn't interpret; treated
        // as a no-op notification rather than a protocol error.
        ServerMessageId::AudioDebugInfoReady
        | ServerMessageId::AtlogFdReady
        | ServerMessageId::GetHotwordModelsReady
        | ServerMessageId::OutputNodeVolumeChanged
        | ServerMessageId::NodeLeftRightSwappedChanged
        | ServerMessageId::InputNodeGainChanged => Ok(ServerMessage::NodesChanged),
    }
}

fn direction_from_wire(tag: u8) -> Result<Direction, ClientError> {
    Direction::from_wire(tag).map_err(ClientError::Proto)
}

fn short_payload(got: usize) -> ClientError {
    ClientError::Proto(hearth_proto::ProtoError::LengthMismatch {
        declared: got as u32,
        actual: got as u32,
    })
}

/// Build the `CONNECT_STREAM` payload for a fresh stream request; a thin
/// convenience wrapper so call sites don't hand-assemble the
/// [`ClientMessage`] variant themselves.
pub fn connect_stream_message(
    direction: Direction,
    stream_id: StreamId,
    format: AudioFormat,
    buffer_frames: u32,
    cb_threshold: u32,
    dev_idx: Option<u32>,
) -> ClientMessage {
    ClientMessage::ConnectStream {
        direction,
        stream_id,
        buffer_frames,
        cb_threshold,
        format,
        dev_idx,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hearth_proto::ClientMessageId;

    #[test]
    fn encode_register_notification_carries_kind_byte() {
        let msg = ClientMessage::RegisterNotification {
            kind: hearth_proto::NotificationKind::CaptureMuteChanged,
        };
        let (id, payload) = encode_client_message(&msg);
        assert_eq!(id, ClientMessageId::RegisterNotification);
        assert_eq!(payload, vec![hearth_proto::NotificationKind::CaptureMuteChanged.to_wire()]);
    }

    #[test]
    fn encode_connect_stream_matches_server_decode_layout() {
        let fmt = AudioFormat::new(SampleFormat::S16Le, 48_000, 2);
        let msg = connect_stream_message(Direction::Output, StreamId::new(1, 0), fmt, 4096, 480, None);
        let (id, payload) = encode_client_message(&msg);
        assert_eq!(id, ClientMessageId::ConnectStream);
        assert!(payload.len() >= 19);
        assert_eq!(payload[0], Direction::Output.to_wire());
    }

    #[test]
    fn decode_client_connected() {
        let payload = 7u16.to_le_bytes();
        let msg = decode_server_message(ServerMessageId::ClientConnected, &payload).unwrap();
        assert!(matches!(msg, ServerMessage::ClientConnected { client_id: 7 }));
    }

    #[test]
    fn decode_stream_connected_round_trips_fields() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&StreamId::new(2, 1).raw().to_le_bytes());
        payload.extend_from_slice(&(-5i32).to_le_bytes());
        payload.extend_from_slice(&1920u64.to_le_bytes());
        let msg = decode_server_message(ServerMessageId::StreamConnected, &payload).unwrap();
        match msg {
            ServerMessage::StreamConnected { stream_id, err, samples_shm_size } => {
                assert_eq!(stream_id, StreamId::new(2, 1));
                assert_eq!(err, -5);
                assert_eq!(samples_shm_size, 1920);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn decode_rejects_short_payload() {
        let err = decode_server_message(ServerMessageId::OutputVolumeChanged, &[1, 2]).unwrap_err();
        assert!(matches!(err, ClientError::Proto(_)));
    }
}
