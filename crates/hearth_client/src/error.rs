use thiserror::Error;

use hearth_proto::ProtoError;
use hearth_sab::SabError;

/// Client-side error type. Transport/protocol failures bubble up through
/// `#[from]` wrapping from the lower crates, matching the
/// `EngineError`/`PlatformError` split this crate's teacher used for its
/// own engine/platform boundary.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("not connected to server")]
    NotConnected,

    #[error("connect timed out")]
    ConnectTimedOut,

    #[error("stream {0:?} not found")]
    UnknownStream(hearth_proto::StreamId),

    #[error("stream id space exhausted for this client")]
    StreamIdsExhausted,

    #[error("unexpected server reply where STREAM_CONNECTED was expected")]
    UnexpectedReply,

    #[error("server rejected stream connect: {0}")]
    ServerRejected(i32),

    #[error(transparent)]
    Proto(#[from] ProtoError),

    #[error(transparent)]
    Sab(#[from] SabError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("errno {0}")]
    Errno(i32),
}

impl ClientError {
    pub fn as_wire_code(&self) -> i32 {
        match self {
            ClientError::NotConnected => -libc::ENOTCONN,
            ClientError::ConnectTimedOut => -libc::ETIMEDOUT,
            ClientError::UnknownStream(_) => -libc::EINVAL,
            ClientError::StreamIdsExhausted => -libc::EAGAIN,
            ClientError::UnexpectedReply => -libc::EPROTO,
            ClientError::ServerRejected(e) => *e,
            ClientError::Proto(e) => e.as_wire_code(),
            ClientError::Sab(_) => -libc::EIO,
            ClientError::Io(_) => -libc::EIO,
            ClientError::Errno(e) => -e.abs(),
        }
    }
}
