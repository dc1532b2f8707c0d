//! Control-socket message framing.
//!
//! Every client↔server datagram begins with `{length: u32, id: u32}`. The
//! length is the *total* frame size including this header. Ancillary file
//! descriptors travel alongside via `SCM_RIGHTS`; which ids carry fds, and
//! how many, is fixed per id (see [`ClientMessageId::expected_fds`] /
//! [`ServerMessageId::expected_fds`]).
//!
//! Messages are represented as tagged variants carrying their own payload,
//! per the redesign note to drop the "header struct plus cast" pattern in
//! favor of a real union type.

use crate::error::ProtoError;
use crate::format::{AudioFormat, Direction, StreamId};

/// Client→server message identifiers. Every variant here is one an
/// implementer must handle; unknown ids on the wire are a protocol error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ClientMessageId {
    ConnectStream = 0,
    DisconnectStream,
    SetSystemVolume,
    SetSystemMute,
    SetUserMute,
    SetSystemMuteLocked,
    SetSystemCaptureMute,
    SetSystemCaptureMuteLocked,
    SetNodeAttr,
    SelectNode,
    AddActiveNode,
    RmActiveNode,
    ReloadDsp,
    DumpDspInfo,
    DumpAudioThread,
    GetAtlogFd,
    DumpMain,
    DumpBt,
    SetBtWbsEnabled,
    DumpSnapshots,
    AddTestDev,
    Suspend,
    Resume,
    GetHotwordModels,
    SetHotwordModel,
    RegisterNotification,
    SetAecDump,
    ReloadAecConfig,
    SetAecRef,
    RequestFloop,
}

impl ClientMessageId {
    pub fn from_wire(id: u32) -> Result<Self, ProtoError> {
        use ClientMessageId::*;
        const TABLE: &[ClientMessageId] = &[
            ConnectStream,
            DisconnectStream,
            SetSystemVolume,
            SetSystemMute,
            SetUserMute,
            SetSystemMuteLocked,
            SetSystemCaptureMute,
            SetSystemCaptureMuteLocked,
            SetNodeAttr,
            SelectNode,
            AddActiveNode,
            RmActiveNode,
            ReloadDsp,
            DumpDspInfo,
            DumpAudioThread,
            GetAtlogFd,
            DumpMain,
            DumpBt,
            SetBtWbsEnabled,
            DumpSnapshots,
            AddTestDev,
            Suspend,
            Resume,
            GetHotwordModels,
            SetHotwordModel,
            RegisterNotification,
            SetAecDump,
            ReloadAecConfig,
            SetAecRef,
            RequestFloop,
        ];
        TABLE
            .get(id as usize)
            .copied()
            .ok_or(ProtoError::UnknownMessageId(id))
    }

    /// `CONNECT_STREAM` carries the audio-notify socket end and optionally
    /// a client-provided shm fd; every other client message carries none.
    pub fn expected_fds(&self) -> usize {
        match self {
            ClientMessageId::ConnectStream => 1,
            _ => 0,
        }
    }
}

/// Server→client message identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ServerMessageId {
    ClientConnected = 0,
    StreamConnected,
    AudioDebugInfoReady,
    AtlogFdReady,
    GetHotwordModelsReady,
    RequestFloopReady,
    OutputVolumeChanged,
    OutputMuteChanged,
    CaptureGainChanged,
    CaptureMuteChanged,
    NodesChanged,
    ActiveNodeChanged,
    OutputNodeVolumeChanged,
    NodeLeftRightSwappedChanged,
    InputNodeGainChanged,
    NumActiveStreamsChanged,
}

impl ServerMessageId {
    /// `CLIENT_CONNECTED` carries the server-state shm fd; `STREAM_CONNECTED`
    /// carries the SAB header and samples fds. Notifications carry none.
    pub fn expected_fds(&self) -> usize {
        match self {
            ServerMessageId::ClientConnected => 1,
            ServerMessageId::StreamConnected => 2,
            _ => 0,
        }
    }

    pub fn from_wire(id: u32) -> Result<Self, ProtoError> {
        use ServerMessageId::*;
        const TABLE: &[ServerMessageId] = &[
            ClientConnected,
            StreamConnected,
            AudioDebugInfoReady,
            AtlogFdReady,
            GetHotwordModelsReady,
            RequestFloopReady,
            OutputVolumeChanged,
            OutputMuteChanged,
            CaptureGainChanged,
            CaptureMuteChanged,
            NodesChanged,
            ActiveNodeChanged,
            OutputNodeVolumeChanged,
            NodeLeftRightSwappedChanged,
            InputNodeGainChanged,
            NumActiveStreamsChanged,
        ];
        TABLE
            .get(id as usize)
            .copied()
            .ok_or(ProtoError::UnknownMessageId(id))
    }
}

/// A parsed client→server request. Payload fields are populated only for
/// the ids that carry them; other ids are unit-like.
#[derive(Debug, Clone)]
pub enum ClientMessage {
    ConnectStream {
        direction: Direction,
        stream_id: StreamId,
        buffer_frames: u32,
        cb_threshold: u32,
        format: AudioFormat,
        dev_idx: Option<u32>,
    },
    DisconnectStream {
        stream_id: StreamId,
    },
    SetSystemVolume {
        volume: u32,
    },
    SetSystemMute {
        mute: bool,
    },
    SelectNode {
        direction: Direction,
        node_id: u32,
    },
    AddActiveNode {
        direction: Direction,
        node_id: u32,
    },
    RmActiveNode {
        direction: Direction,
        node_id: u32,
    },
    Suspend,
    Resume,
    RequestFloop {
        client_types_mask: u32,
    },
    RegisterNotification {
        kind: NotificationKind,
    },
    /// Catch-all for ids whose payload this CORE passes through without
    /// interpreting further (dump/debug/BT/AEC/hotword-model admin calls):
    /// still validated for framing, just not decoded field-by-field here.
    Opaque {
        id: ClientMessageId,
    },
}

/// The subset of [`ServerMessageId`] notifications a client may subscribe
/// to via `REGISTER_NOTIFICATION`, shared between the client's
/// subscription bookkeeping and the server's per-`RClient` registered set
/// so both halves of the wire agree on one tag table instead of keeping
/// two independently-maintained copies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NotificationKind {
    NodesChanged,
    ActiveNodeChanged,
    OutputVolumeChanged,
    OutputMuteChanged,
    CaptureGainChanged,
    CaptureMuteChanged,
    NumActiveStreamsChanged,
}

impl NotificationKind {
    pub fn to_wire(self) -> u8 {
        match self {
            NotificationKind::NodesChanged => 0,
            NotificationKind::ActiveNodeChanged => 1,
            NotificationKind::OutputVolumeChanged => 2,
            NotificationKind::OutputMuteChanged => 3,
            NotificationKind::CaptureGainChanged => 4,
            NotificationKind::CaptureMuteChanged => 5,
            NotificationKind::NumActiveStreamsChanged => 6,
        }
    }

    pub fn from_wire(tag: u8) -> Result<Self, ProtoError> {
        match tag {
            0 => Ok(NotificationKind::NodesChanged),
            1 => Ok(NotificationKind::ActiveNodeChanged),
            2 => Ok(NotificationKind::OutputVolumeChanged),
            3 => Ok(NotificationKind::OutputMuteChanged),
            4 => Ok(NotificationKind::CaptureGainChanged),
            5 => Ok(NotificationKind::CaptureMuteChanged),
            6 => Ok(NotificationKind::NumActiveStreamsChanged),
            other => Err(ProtoError::UnknownMessageId(other as u32)),
        }
    }
}

/// A parsed server→client reply or notification.
#[derive(Debug, Clone)]
pub enum ServerMessage {
    ClientConnected {
        client_id: u16,
    },
    StreamConnected {
        stream_id: StreamId,
        err: i32,
        samples_shm_size: u64,
    },
    NodesChanged,
    ActiveNodeChanged {
        direction: Direction,
        node_id: u32,
    },
    OutputVolumeChanged {
        volume: u32,
    },
    OutputMuteChanged {
        mute: bool,
    },
    CaptureGainChanged {
        gain: i32,
    },
    CaptureMuteChanged {
        mute: bool,
    },
    RequestFloopReady {
        dev_idx: u32,
    },
    NumActiveStreamsChanged {
        direction: Direction,
        num_streams: u32,
    },
}

impl ServerMessage {
    pub fn id(&self) -> ServerMessageId {
        match self {
            ServerMessage::ClientConnected { .. } => ServerMessageId::ClientConnected,
            ServerMessage::StreamConnected { .. } => ServerMessageId::StreamConnected,
            ServerMessage::NodesChanged => ServerMessageId::NodesChanged,
            ServerMessage::ActiveNodeChanged { .. } => ServerMessageId::ActiveNodeChanged,
            ServerMessage::OutputVolumeChanged { .. } => ServerMessageId::OutputVolumeChanged,
            ServerMessage::OutputMuteChanged { .. } => ServerMessageId::OutputMuteChanged,
            ServerMessage::CaptureGainChanged { .. } => ServerMessageId::CaptureGainChanged,
            ServerMessage::CaptureMuteChanged { .. } => ServerMessageId::CaptureMuteChanged,
            ServerMessage::RequestFloopReady { .. } => ServerMessageId::RequestFloopReady,
            ServerMessage::NumActiveStreamsChanged { .. } => {
                ServerMessageId::NumActiveStreamsChanged
            }
        }
    }
}

/// The `{length, id}` frame header every control-socket datagram begins
/// with.
#[derive(Debug, Clone, Copy)]
pub struct FrameHeader {
    pub length: u32,
    pub id: u32,
}

pub const FRAME_HEADER_SIZE: usize = 8;

impl FrameHeader {
    pub fn to_bytes(self) -> [u8; FRAME_HEADER_SIZE] {
        let mut buf = [0u8; FRAME_HEADER_SIZE];
        buf[0..4].copy_from_slice(&self.length.to_le_bytes());
        buf[4..8].copy_from_slice(&self.id.to_le_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self, ProtoError> {
        if buf.len() < FRAME_HEADER_SIZE {
            return Err(ProtoError::LengthMismatch {
                declared: FRAME_HEADER_SIZE as u32,
                actual: buf.len() as u32,
            });
        }
        let length = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        let id = u32::from_le_bytes(buf[4..8].try_into().unwrap());
        Ok(FrameHeader { length, id })
    }

    /// Validate that a frame claiming `declared` total bytes actually
    /// arrived as `actual` bytes. Truncated frames are a protocol error on
    /// both sides of the wire.
    pub fn validate_length(declared: u32, actual: usize) -> Result<(), ProtoError> {
        if declared as usize != actual {
            return Err(ProtoError::LengthMismatch {
                declared,
                actual: actual as u32,
            });
        }
        Ok(())
    }

    pub fn validate_fd_count(expected: usize, actual: usize) -> Result<(), ProtoError> {
        if expected != actual {
            return Err(ProtoError::FdCountMismatch { expected, actual });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_header_roundtrips() {
        let h = FrameHeader { length: 42, id: 7 };
        let bytes = h.to_bytes();
        let back = FrameHeader::from_bytes(&bytes).unwrap();
        assert_eq!(back.length, 42);
        assert_eq!(back.id, 7);
    }

    #[test]
    fn truncated_frame_is_length_mismatch() {
        let err = FrameHeader::from_bytes(&[0u8; 4]).unwrap_err();
        assert!(matches!(err, ProtoError::LengthMismatch { .. }));
    }

    #[test]
    fn connect_stream_expects_one_fd() {
        assert_eq!(ClientMessageId::ConnectStream.expected_fds(), 1);
        assert_eq!(ClientMessageId::Suspend.expected_fds(), 0);
    }

    #[test]
    fn stream_connected_expects_two_fds() {
        assert_eq!(ServerMessageId::StreamConnected.expected_fds(), 2);
        assert_eq!(ServerMessageId::ClientConnected.expected_fds(), 1);
    }

    #[test]
    fn unknown_message_id_is_rejected() {
        assert!(matches!(
            ClientMessageId::from_wire(9999),
            Err(ProtoError::UnknownMessageId(9999))
        ));
    }

    #[test]
    fn length_validation_catches_short_read() {
        let err = FrameHeader::validate_length(16, 10).unwrap_err();
        assert!(matches!(err, ProtoError::LengthMismatch { .. }));
    }
}
