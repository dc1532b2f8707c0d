use thiserror::Error;

/// Protocol-level failures: framing, fd counts, and format negotiation.
///
/// Transport and protocol errors are fatal to the current connection or
/// stream per the external error taxonomy; callers do not retry the same
/// frame, they tear down and reconnect.
#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("frame length mismatch: header said {declared}, read {actual}")]
    LengthMismatch { declared: u32, actual: u32 },

    #[error("unknown message id {0}")]
    UnknownMessageId(u32),

    #[error("expected {expected} ancillary fd(s), got {actual}")]
    FdCountMismatch { expected: usize, actual: usize },

    #[error("audio message has wrong size: expected {expected} bytes, got {actual}")]
    AudioMessageSize { expected: usize, actual: usize },

    #[error("unsupported sample format tag {0}")]
    UnknownSampleFormat(u8),

    #[error("rejected big-endian format; only little-endian sample formats are negotiable")]
    BigEndianRejected,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("errno {0}")]
    Errno(i32),
}

impl ProtoError {
    /// The negative errno-style code this error should be reported on the
    /// wire as, matching the CRAS convention of carrying raw negative
    /// `errno` values in reply messages instead of a stringly-typed error.
    pub fn as_wire_code(&self) -> i32 {
        match self {
            ProtoError::Errno(e) => -e.abs(),
            ProtoError::LengthMismatch { .. } | ProtoError::FdCountMismatch { .. } => -libc_eproto(),
            ProtoError::UnknownMessageId(_) => -libc_einval(),
            ProtoError::AudioMessageSize { .. } => -libc_eproto(),
            ProtoError::UnknownSampleFormat(_) | ProtoError::BigEndianRejected => -libc_einval(),
            ProtoError::Io(_) => -libc_eio(),
        }
    }
}

fn libc_eproto() -> i32 {
    libc::EPROTO
}
fn libc_einval() -> i32 {
    libc::EINVAL
}
fn libc_eio() -> i32 {
    libc::EIO
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_code_is_negative() {
        let e = ProtoError::UnknownMessageId(99);
        assert!(e.as_wire_code() < 0);
    }

    #[test]
    fn errno_passthrough_is_negated() {
        let e = ProtoError::Errno(5);
        assert_eq!(e.as_wire_code(), -5);
    }
}
