use thiserror::Error;

use hearth_proto::ProtoError;
use hearth_sab::SabError;

/// Server-side error type, mirroring the client's `#[from]`-wrapping
/// split. Device errors are not represented here as a hard failure type:
/// per §7 they are local to one device and routing handles them by
/// engaging the fallback, not by bubbling an error to the caller.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("device {0} not found")]
    UnknownDevice(u32),

    #[error("node {0} not found")]
    UnknownNode(u32),

    #[error("stream {0:?} not found")]
    UnknownStream(hearth_proto::StreamId),

    #[error("format not supported by device {dev_idx}: {format:?}")]
    UnsupportedFormat {
        dev_idx: u32,
        format: hearth_proto::AudioFormat,
    },

    #[error("device {0} failed to open")]
    DeviceOpenFailed(u32),

    #[error("flexible loopback capacity exceeded ({max} pairs already allocated)")]
    FloopCapacityExceeded { max: usize },

    #[error("feature not supported: {0}")]
    NotSupported(&'static str),

    #[error(transparent)]
    Proto(#[from] ProtoError),

    #[error(transparent)]
    Sab(#[from] SabError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("errno {0}")]
    Errno(i32),
}

impl ServerError {
    pub fn as_wire_code(&self) -> i32 {
        match self {
            ServerError::UnknownDevice(_) | ServerError::UnknownNode(_) | ServerError::UnknownStream(_) => {
                -libc::EINVAL
            }
            ServerError::UnsupportedFormat { .. } => -libc::EINVAL,
            ServerError::DeviceOpenFailed(_) => -libc::EIO,
            ServerError::FloopCapacityExceeded { .. } => -libc::EAGAIN,
            ServerError::NotSupported(_) => -libc::ENOTSUP,
            ServerError::Proto(e) => e.as_wire_code(),
            ServerError::Sab(_) => -libc::EIO,
            ServerError::Io(_) => -libc::EIO,
            ServerError::Errno(e) => -e.abs(),
        }
    }
}
