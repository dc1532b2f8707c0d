//! Shared-memory regions used by the audio data plane: the per-stream
//! shared audio buffer (header + ping-pong samples ring) and the
//! process-wide server-state region.
//!
//! Both regions are single-writer; the SAB relies on a strict
//! one-producer/one-consumer split per direction with no locking at all,
//! while the server-state region uses an explicit seqlock-style
//! `update_count` protocol since it has many concurrent readers.

pub mod buffer;
pub mod error;
pub mod header;
pub mod server_state;

pub use buffer::{alloc_shm, SharedAudioBuffer};
pub use error::SabError;
pub use header::{SabHeader, SAB_HEADER_SIZE, SAB_HEADER_VERSION};
pub use server_state::{
    ServerStateHandle, ServerStateOwner, ServerStateRegion, ServerStateSnapshot,
    SERVER_STATE_REGION_SIZE, SERVER_STATE_VERSION,
};
