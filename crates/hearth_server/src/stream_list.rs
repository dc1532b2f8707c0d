//! Stream list and rstream (server side), §4.5.
//!
//! Grounded in the teacher's `gecko_core::stream` module for the
//! create/destroy/iterate shape, generalized to the server-side record a
//! connected client's stream becomes once `CONNECT_STREAM` completes:
//! the shm fds the client handed over, the negotiated format, and
//! whichever device it ends up pinned or attached to.

use std::collections::HashMap;

use hearth_proto::{AudioFormat, Direction, StreamId};

use crate::error::ServerError;

/// `0` is reserved for client effects disabled; bits beyond that are
/// opaque to routing and only meaningful to the DSP stage, which this
/// CORE does not implement — kept as a bitmask so future effect bits
/// don't require a wire change.
pub type StreamFlags = u32;

/// Marks a stream as a hotword-detector stream; routing refuses to pin
/// it to a device whose active node isn't the `HOTWORD` node type.
pub const STREAM_FLAG_HOTWORD: StreamFlags = 1 << 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientType {
    Legacy,
    Pcm,
    Test,
}

/// One connected stream, as tracked by the server after `CONNECT_STREAM`.
/// Mirrors the data model's `rstream` fields.
pub struct RStream {
    pub id: StreamId,
    pub direction: Direction,
    pub format: AudioFormat,
    pub client_type: ClientType,
    pub buffer_frames: u32,
    pub cb_threshold: u32,
    pub flags: StreamFlags,
    pub client_shm_fd: Option<std::os::unix::io::RawFd>,
    pub pinned_dev_idx: Option<u32>,
    pub start_ts: std::time::Instant,
}

impl RStream {
    pub fn is_pinned(&self) -> bool {
        self.pinned_dev_idx.is_some()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct StreamParams {
    pub direction: Direction,
    pub format: AudioFormat,
    pub client_type: ClientType,
    pub buffer_frames: u32,
    pub cb_threshold: u32,
    pub flags: StreamFlags,
    pub pinned_dev_idx: Option<u32>,
}

/// The full set of connected streams, keyed by [`StreamId`]. Owned
/// exclusively by the routing engine; `changed` fires after every
/// mutation so routing can re-run device attachment without the stream
/// list itself knowing about devices.
pub struct StreamList<F: FnMut()> {
    streams: HashMap<StreamId, RStream>,
    changed: F,
}

impl<F: FnMut()> StreamList<F> {
    pub fn new(changed: F) -> Self {
        Self {
            streams: HashMap::new(),
            changed,
        }
    }

    pub fn create(
        &mut self,
        id: StreamId,
        params: StreamParams,
        client_shm_fd: Option<std::os::unix::io::RawFd>,
    ) -> Result<(), ServerError> {
        if self.streams.contains_key(&id) {
            return Err(ServerError::UnknownStream(id));
        }
        let rstream = RStream {
            id,
            direction: params.direction,
            format: params.format,
            client_type: params.client_type,
            buffer_frames: params.buffer_frames,
            cb_threshold: params.cb_threshold,
            flags: params.flags,
            client_shm_fd,
            pinned_dev_idx: params.pinned_dev_idx,
            start_ts: std::time::Instant::now(),
        };
        self.streams.insert(id, rstream);
        (self.changed)();
        Ok(())
    }

    pub fn destroy(&mut self, id: StreamId) -> Result<RStream, ServerError> {
        let rstream = self
            .streams
            .remove(&id)
            .ok_or(ServerError::UnknownStream(id))?;
        (self.changed)();
        Ok(rstream)
    }

    pub fn get(&self, id: StreamId) -> Option<&RStream> {
        self.streams.get(&id)
    }

    pub fn get_mut(&mut self, id: StreamId) -> Option<&mut RStream> {
        self.streams.get_mut(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &RStream> {
        self.streams.values()
    }

    pub fn iter_direction(&self, direction: Direction) -> impl Iterator<Item = &RStream> {
        self.streams.values().filter(move |s| s.direction == direction)
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    /// True if any stream is pinned to `dev_idx` — used to veto a device
    /// closing or being disabled while it still has a pinned consumer.
    pub fn has_pinned(&self, dev_idx: u32) -> bool {
        self.streams
            .values()
            .any(|s| s.pinned_dev_idx == Some(dev_idx))
    }

    pub fn count_for_client(&self, client_id: u16) -> usize {
        self.streams
            .keys()
            .filter(|id| id.client_id() == client_id)
            .count()
    }

    /// Remove and return every stream belonging to `client_id`, for use
    /// when a client disconnects without an orderly `DISCONNECT_STREAM`
    /// per stream.
    pub fn remove_all_for_client(&mut self, client_id: u16) -> Vec<RStream> {
        let ids: Vec<StreamId> = self
            .streams
            .keys()
            .filter(|id| id.client_id() == client_id)
            .copied()
            .collect();
        let removed = ids
            .into_iter()
            .filter_map(|id| self.streams.remove(&id))
            .collect::<Vec<_>>();
        if !removed.is_empty() {
            (self.changed)();
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hearth_proto::SampleFormat;
    use std::cell::Cell;
    use std::rc::Rc;

    fn params(direction: Direction) -> StreamParams {
        StreamParams {
            direction,
            format: AudioFormat::new(SampleFormat::S16Le, 48_000, 2),
            client_type: ClientType::Pcm,
            buffer_frames: 4096,
            cb_threshold: 480,
            flags: 0,
            pinned_dev_idx: None,
        }
    }

    #[test]
    fn create_then_destroy_round_trips() {
        let hits = Rc::new(Cell::new(0));
        let hits2 = hits.clone();
        let mut list = StreamList::new(move || hits2.set(hits2.get() + 1));
        let id = StreamId::new(1, 0);

        list.create(id, params(Direction::Output), None).unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(hits.get(), 1);

        list.destroy(id).unwrap();
        assert_eq!(list.len(), 0);
        assert_eq!(hits.get(), 2);
    }

    #[test]
    fn duplicate_id_is_rejected() {
        let mut list = StreamList::new(|| {});
        let id = StreamId::new(1, 0);
        list.create(id, params(Direction::Output), None).unwrap();
        let err = list.create(id, params(Direction::Output), None).unwrap_err();
        assert!(matches!(err, ServerError::UnknownStream(_)));
    }

    #[test]
    fn pinned_stream_is_reported_by_has_pinned() {
        let mut list = StreamList::new(|| {});
        let id = StreamId::new(1, 0);
        let mut p = params(Direction::Input);
        p.pinned_dev_idx = Some(9);
        list.create(id, p, None).unwrap();
        assert!(list.has_pinned(9));
        assert!(!list.has_pinned(3));
    }

    #[test]
    fn remove_all_for_client_clears_only_that_client() {
        let mut list = StreamList::new(|| {});
        list.create(StreamId::new(1, 0), params(Direction::Output), None)
            .unwrap();
        list.create(StreamId::new(1, 1), params(Direction::Input), None)
            .unwrap();
        list.create(StreamId::new(2, 0), params(Direction::Output), None)
            .unwrap();

        let removed = list.remove_all_for_client(1);
        assert_eq!(removed.len(), 2);
        assert_eq!(list.len(), 1);
        assert_eq!(list.count_for_client(2), 1);
    }
}
