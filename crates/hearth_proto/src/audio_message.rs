//! The fixed-size datagram exchanged over a stream's audio-notify socket.

use crate::error::ProtoError;

pub const AUDIO_MESSAGE_SIZE: usize = 6;

/// `id ∈ {REQUEST_DATA, DATA_READY}`; a third id, `DATA_CAPTURED`, is the
/// capture-direction acknowledgement analogous to `DATA_READY` on
/// playback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AudioMessageId {
    RequestData = 0,
    DataReady = 1,
    DataCaptured = 2,
}

impl AudioMessageId {
    pub fn from_wire(tag: u8) -> Result<Self, ProtoError> {
        match tag {
            0 => Ok(AudioMessageId::RequestData),
            1 => Ok(AudioMessageId::DataReady),
            2 => Ok(AudioMessageId::DataCaptured),
            other => Err(ProtoError::UnknownMessageId(other as u32)),
        }
    }
}

/// `{id: u8, error: i8, frames: u32}`. Exactly 6 bytes on the wire; a short
/// or long read is fatal to the stream, never resynchronized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioMessage {
    pub id: AudioMessageId,
    pub error: i8,
    pub frames: u32,
}

impl AudioMessage {
    pub fn request_data(frames: u32) -> Self {
        Self {
            id: AudioMessageId::RequestData,
            error: 0,
            frames,
        }
    }

    pub fn data_ready(frames: u32, error: i8) -> Self {
        Self {
            id: AudioMessageId::DataReady,
            error,
            frames,
        }
    }

    pub fn data_captured(frames: u32) -> Self {
        Self {
            id: AudioMessageId::DataCaptured,
            error: 0,
            frames,
        }
    }

    pub fn to_bytes(self) -> [u8; AUDIO_MESSAGE_SIZE] {
        let mut buf = [0u8; AUDIO_MESSAGE_SIZE];
        buf[0] = self.id as u8;
        buf[1] = self.error as u8;
        buf[2..6].copy_from_slice(&self.frames.to_le_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self, ProtoError> {
        if buf.len() != AUDIO_MESSAGE_SIZE {
            return Err(ProtoError::AudioMessageSize {
                expected: AUDIO_MESSAGE_SIZE,
                actual: buf.len(),
            });
        }
        let id = AudioMessageId::from_wire(buf[0])?;
        let error = buf[1] as i8;
        let frames = u32::from_le_bytes(buf[2..6].try_into().unwrap());
        Ok(Self { id, error, frames })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrips_through_bytes() {
        let msg = AudioMessage::data_ready(480, 0);
        let bytes = msg.to_bytes();
        assert_eq!(bytes.len(), AUDIO_MESSAGE_SIZE);
        let back = AudioMessage::from_bytes(&bytes).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn wrong_size_is_fatal() {
        let err = AudioMessage::from_bytes(&[0u8; 5]).unwrap_err();
        assert!(matches!(err, ProtoError::AudioMessageSize { .. }));
    }

    #[test]
    fn negative_error_byte_roundtrips() {
        let msg = AudioMessage::data_ready(0, -1);
        let back = AudioMessage::from_bytes(&msg.to_bytes()).unwrap();
        assert_eq!(back.error, -1);
    }
}
