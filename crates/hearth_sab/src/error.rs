use thiserror::Error;

#[derive(Debug, Error)]
pub enum SabError {
    #[error("sab header version mismatch: expected {expected}, got {actual}")]
    VersionMismatch { expected: u32, actual: u32 },

    #[error("mmap failed: {0}")]
    Mmap(#[from] std::io::Error),

    #[error("requested {requested} bytes but only {available} are free in buffer half")]
    InsufficientSpace { requested: usize, available: usize },

    #[error("read of {requested} frames exceeds {available} readable frames")]
    InsufficientData { requested: usize, available: usize },

    #[error("buffer invariant violated: read_offset {read_offset} > write_offset {write_offset}")]
    InvariantViolated {
        read_offset: usize,
        write_offset: usize,
    },

    #[error("region size {actual} does not match expected layout size {expected}")]
    SizeMismatch { expected: usize, actual: usize },

    #[error(transparent)]
    Proto(#[from] hearth_proto::ProtoError),
}
