//! Byte-level encode/decode for the control-socket payloads the request
//! dispatcher (`rclient::RClient::handle_message`) actually acts on.
//! `hearth_proto` defines the frame header and the tagged message enums;
//! this module is the server-side half of turning those enums into and
//! out of the bytes that follow the `{length, id}` header on the wire.

use hearth_proto::{
    AudioFormat, ClientMessage, ClientMessageId, Direction, SampleFormat, ServerMessage,
    ServerMessageId,
};

use crate::error::ServerError;

fn direction_from_wire(tag: u8) -> Result<Direction, ServerError> {
    Direction::from_wire(tag).map_err(ServerError::Proto)
}

fn direction_to_wire(d: Direction) -> u8 {
    d.to_wire()
}

/// Decode the payload following a `CONNECT_STREAM`-class frame into a
/// [`ClientMessage`]. The server allocates its own `stream_id`, so the
/// client-suggested value the wire carries is read but not trusted.
pub fn decode_client_message(id: ClientMessageId, payload: &[u8]) -> Result<ClientMessage, ServerError> {
    match id {
        ClientMessageId::ConnectStream => {
            if payload.len() < 19 {
                return Err(short_payload(id, payload.len()));
            }
            let direction = direction_from_wire(payload[0])?;
            let buffer_frames = u32::from_le_bytes(payload[1..5].try_into().unwrap());
            let cb_threshold = u32::from_le_bytes(payload[5..9].try_into().unwrap());
            let sample_format = SampleFormat::from_wire(payload[9])?;
            let rate_hz = u32::from_le_bytes(payload[10..14].try_into().unwrap());
            let num_channels = payload[14];
            // payload[15..19] carries the client's suggested stream_id,
            // read past but discarded: the server is the sole allocator.
            let dev_idx = if payload.len() >= 19 + 4 {
                let raw = i32::from_le_bytes(payload[19..23].try_into().unwrap());
                if raw < 0 {
                    None
                } else {
                    Some(raw as u32)
                }
            } else {
                None
            };

            Ok(ClientMessage::ConnectStream {
                direction,
                stream_id: hearth_proto::StreamId::from_raw(0),
                buffer_frames,
                cb_threshold,
                format: AudioFormat::new(sample_format, rate_hz, num_channels),
                dev_idx,
            })
        }
        ClientMessageId::DisconnectStream => {
            if payload.len() < 4 {
                return Err(short_payload(id, payload.len()));
            }
            let raw = u32::from_le_bytes(payload[0..4].try_into().unwrap());
            Ok(ClientMessage::DisconnectStream {
                stream_id: hearth_proto::StreamId::from_raw(raw),
            })
        }
        ClientMessageId::SetSystemVolume => {
            if payload.len() < 4 {
                return Err(short_payload(id, payload.len()));
            }
            let volume = u32::from_le_bytes(payload[0..4].try_into().unwrap());
            Ok(ClientMessage::SetSystemVolume { volume })
        }
        ClientMessageId::SetSystemMute => {
            if payload.is_empty() {
                return Err(short_payload(id, payload.len()));
            }
            Ok(ClientMessage::SetSystemMute { mute: payload[0] != 0 })
        }
        ClientMessageId::SelectNode | ClientMessageId::AddActiveNode | ClientMessageId::RmActiveNode => {
            if payload.len() < 5 {
                return Err(short_payload(id, payload.len()));
            }
            let direction = direction_from_wire(payload[0])?;
            let node_id = u32::from_le_bytes(payload[1..5].try_into().unwrap());
            Ok(match id {
                ClientMessageId::SelectNode => ClientMessage::SelectNode { direction, node_id },
                ClientMessageId::AddActiveNode => ClientMessage::AddActiveNode { direction, node_id },
                _ => ClientMessage::RmActiveNode { direction, node_id },
            })
        }
        ClientMessageId::Suspend => Ok(ClientMessage::Suspend),
        ClientMessageId::Resume => Ok(ClientMessage::Resume),
        ClientMessageId::RequestFloop => {
            if payload.len() < 4 {
                return Err(short_payload(id, payload.len()));
            }
            let client_types_mask = u32::from_le_bytes(payload[0..4].try_into().unwrap());
            Ok(ClientMessage::RequestFloop { client_types_mask })
        }
        ClientMessageId::RegisterNotification => {
            if payload.is_empty() {
                return Err(short_payload(id, payload.len()));
            }
            let kind = hearth_proto::NotificationKind::from_wire(payload[0]).map_err(ServerError::Proto)?;
            Ok(ClientMessage::RegisterNotification { kind })
        }
        other => Ok(ClientMessage::Opaque { id: other }),
    }
}

fn short_payload(id: ClientMessageId, got: usize) -> ServerError {
    let _ = id;
    ServerError::Proto(hearth_proto::ProtoError::LengthMismatch {
        declared: got as u32,
        actual: got as u32,
    })
}

/// Encode a [`ServerMessage`] into its wire id plus payload bytes (the
/// two shm fds `STREAM_CONNECTED`/`CLIENT_CONNECTED` carry travel
/// out-of-band via `SCM_RIGHTS`, not in this payload).
pub fn encode_server_message(msg: &ServerMessage) -> (ServerMessageId, Vec<u8>) {
    let id = msg.id();
    let mut buf = Vec::new();
    match msg {
        ServerMessage::ClientConnected { client_id } => {
            buf.extend_from_slice(&client_id.to_le_bytes());
        }
        ServerMessage::StreamConnected {
            stream_id,
            err,
            samples_shm_size,
        } => {
            buf.extend_from_slice(&stream_id.raw().to_le_bytes());
            buf.extend_from_slice(&err.to_le_bytes());
            buf.extend_from_slice(&samples_shm_size.to_le_bytes());
        }
        ServerMessage::NodesChanged => {}
        ServerMessage::ActiveNodeChanged { direction, node_id } => {
            buf.push(direction_to_wire(*direction));
            buf.extend_from_slice(&node_id.to_le_bytes());
        }
        ServerMessage::OutputVolumeChanged { volume } => {
            buf.extend_from_slice(&volume.to_le_bytes());
        }
        ServerMessage::OutputMuteChanged { mute } => {
            buf.push(*mute as u8);
        }
        ServerMessage::CaptureGainChanged { gain } => {
            buf.extend_from_slice(&gain.to_le_bytes());
        }
        ServerMessage::CaptureMuteChanged { mute } => {
            buf.push(*mute as u8);
        }
        ServerMessage::RequestFloopReady { dev_idx } => {
            buf.extend_from_slice(&dev_idx.to_le_bytes());
        }
        ServerMessage::NumActiveStreamsChanged { direction, num_streams } => {
            buf.push(direction_to_wire(*direction));
            buf.extend_from_slice(&num_streams.to_le_bytes());
        }
    }
    (id, buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_set_system_volume() {
        let payload = 42u32.to_le_bytes();
        let msg = decode_client_message(ClientMessageId::SetSystemVolume, &payload).unwrap();
        assert!(matches!(msg, ClientMessage::SetSystemVolume { volume: 42 }));
    }

    #[test]
    fn decode_rejects_short_payload() {
        let err = decode_client_message(ClientMessageId::SetSystemVolume, &[1, 2]).unwrap_err();
        assert!(matches!(err, ServerError::Proto(_)));
    }

    #[test]
    fn decode_select_node_reads_direction_and_node_id() {
        let mut payload = vec![1u8]; // Direction::Input
        payload.extend_from_slice(&7u32.to_le_bytes());
        let msg = decode_client_message(ClientMessageId::SelectNode, &payload).unwrap();
        match msg {
            ClientMessage::SelectNode { direction, node_id } => {
                assert_eq!(direction, Direction::Input);
                assert_eq!(node_id, 7);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn encode_then_id_round_trips() {
        let msg = ServerMessage::OutputVolumeChanged { volume: 55 };
        let (id, payload) = encode_server_message(&msg);
        assert_eq!(id, ServerMessageId::OutputVolumeChanged);
        assert_eq!(u32::from_le_bytes(payload[0..4].try_into().unwrap()), 55);
    }

    #[test]
    fn opaque_ids_decode_without_payload_interpretation() {
        let msg = decode_client_message(ClientMessageId::DumpMain, &[]).unwrap();
        assert!(matches!(msg, ClientMessage::Opaque { id: ClientMessageId::DumpMain }));
    }

    #[test]
    fn register_notification_decodes_kind() {
        let msg = decode_client_message(ClientMessageId::RegisterNotification, &[2]).unwrap();
        match msg {
            ClientMessage::RegisterNotification { kind } => {
                assert_eq!(kind, hearth_proto::NotificationKind::OutputVolumeChanged);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn register_notification_rejects_empty_payload() {
        let err = decode_client_message(ClientMessageId::RegisterNotification, &[]).unwrap_err();
        assert!(matches!(err, ServerError::Proto(_)));
    }
}
