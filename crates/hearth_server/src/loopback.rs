//! Loopback taps and flexible loopback ("floop"), §4.9.
//!
//! Grounded in the teacher's observer-callback shape (the platform
//! backend trait's notification hooks in `gecko_platform/src/traits.rs`)
//! generalized from "notify the platform layer" to "notify whichever
//! loopback registration is listening for this tap type".

use std::collections::{HashMap, VecDeque};

use hearth_proto::Direction;

use crate::error::ServerError;
use crate::stream_list::ClientType;

pub const NUM_FLOOP_PAIRS_MAX: usize = 20;

/// Bytes buffered per floop pair between the output-tap write
/// (`feed_floop`) and the input side draining it; sized generously since
/// this CORE's floop input device has no separate consumer task to pace
/// against yet.
pub const FLOOP_RING_CAPACITY: usize = 64 * 1024;

/// Which mix stage a loopback registration taps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopbackType {
    PreDsp,
    PostDsp,
}

impl LoopbackType {
    pub fn direction(&self) -> Direction {
        match self {
            LoopbackType::PreDsp => Direction::PostMixPreDsp,
            LoopbackType::PostDsp => Direction::PostDsp,
        }
    }
}

/// One `{type, data_hook, control_hook}` registration against a single
/// output device. The control hook fires `true`/`false` across an
/// `OPEN -> closed -> open` transition so the receiver can realign its
/// timebase; the data hook fires once per block written to hardware.
pub struct LoopbackRegistration {
    pub loop_type: LoopbackType,
    pub control_hook: Box<dyn FnMut(bool) + Send>,
    pub data_hook: Box<dyn FnMut(&[u8]) + Send>,
}

/// A flexible loopback pair: an output-side tap device and the
/// input-side device a client attaches to read it from, connected by a
/// byte ring the tap writes into and the input side drains.
pub struct FloopPair {
    pub output_tap_idx: u32,
    pub input_idx: u32,
    pub client_types_mask: u32,
    pub enabled: bool,
    ring: VecDeque<u8>,
}

impl FloopPair {
    /// Appends `samples`, dropping the oldest bytes first if the ring is
    /// at capacity — the input side sees a gap rather than the writer
    /// blocking or the pair growing unbounded.
    fn push_samples(&mut self, samples: &[u8]) {
        if samples.len() >= FLOOP_RING_CAPACITY {
            self.ring.clear();
            self.ring.extend(&samples[samples.len() - FLOOP_RING_CAPACITY..]);
            return;
        }
        let overflow = (self.ring.len() + samples.len()).saturating_sub(FLOOP_RING_CAPACITY);
        for _ in 0..overflow {
            self.ring.pop_front();
        }
        self.ring.extend(samples.iter().copied());
    }

    /// Drains up to `max` bytes off the front of the ring, oldest first.
    pub fn drain_ring(&mut self, max: usize) -> Vec<u8> {
        let n = self.ring.len().min(max);
        self.ring.drain(..n).collect()
    }

    pub fn ring_len(&self) -> usize {
        self.ring.len()
    }
}

#[derive(Default)]
pub struct LoopbackRegistry {
    registrations: HashMap<u32, Vec<LoopbackRegistration>>,
    floop_pairs: Vec<FloopPair>,
    next_floop_dev_idx: u32,
}

impl LoopbackRegistry {
    pub fn new() -> Self {
        Self {
            registrations: HashMap::new(),
            floop_pairs: Vec::new(),
            next_floop_dev_idx: 1000,
        }
    }

    pub fn register(&mut self, output_dev_idx: u32, registration: LoopbackRegistration) {
        self.registrations
            .entry(output_dev_idx)
            .or_default()
            .push(registration);
    }

    /// Fired when `output_dev_idx` transitions OPEN -> closed -> open.
    pub fn notify_control(&mut self, output_dev_idx: u32, opened: bool) {
        if let Some(regs) = self.registrations.get_mut(&output_dev_idx) {
            for reg in regs.iter_mut() {
                (reg.control_hook)(opened);
            }
        }
    }

    /// Fired for every block mixed to `output_dev_idx`, once per
    /// registration whose tap type matches `loop_type`.
    pub fn notify_data(&mut self, output_dev_idx: u32, loop_type: LoopbackType, samples: &[u8]) {
        if let Some(regs) = self.registrations.get_mut(&output_dev_idx) {
            for reg in regs.iter_mut().filter(|r| r.loop_type == loop_type) {
                (reg.data_hook)(samples);
            }
        }
        self.feed_floop(output_dev_idx, loop_type, samples);
    }

    /// §4.9 flexible loopback allocation. Returns the existing pair's
    /// input device index if one with a matching mask exists; otherwise
    /// allocates a new pair, bounded by [`NUM_FLOOP_PAIRS_MAX`].
    pub fn request_floop(&mut self, client_types_mask: u32) -> Result<u32, ServerError> {
        if let Some(pair) = self
            .floop_pairs
            .iter()
            .find(|p| p.client_types_mask == client_types_mask)
        {
            return Ok(pair.input_idx);
        }

        if self.floop_pairs.len() >= NUM_FLOOP_PAIRS_MAX {
            return Err(ServerError::FloopCapacityExceeded {
                max: NUM_FLOOP_PAIRS_MAX,
            });
        }

        let output_tap_idx = self.next_floop_dev_idx;
        let input_idx = self.next_floop_dev_idx + 1;
        self.next_floop_dev_idx += 2;

        self.floop_pairs.push(FloopPair {
            output_tap_idx,
            input_idx,
            client_types_mask,
            enabled: false,
            ring: VecDeque::new(),
        });

        Ok(input_idx)
    }

    /// A floop pair becomes enabled only once a matching client stream
    /// attaches; disabled again once the last one detaches.
    pub fn set_floop_enabled(&mut self, input_idx: u32, enabled: bool) {
        if let Some(pair) = self.floop_pairs.iter_mut().find(|p| p.input_idx == input_idx) {
            pair.enabled = enabled;
        }
    }

    /// The output-tap device indices of every enabled floop pair whose
    /// mask matches `client_type`, for `stream_added` to attach an
    /// output stream to so its frames get copied into the pair's ring.
    pub fn matching_floop_devices(&self, client_type: ClientType) -> Vec<u32> {
        let bit = client_type_bit(client_type);
        self.floop_pairs
            .iter()
            .filter(|p| p.client_types_mask & bit != 0)
            .map(|p| p.output_tap_idx)
            .collect()
    }

    fn feed_floop(&mut self, output_dev_idx: u32, loop_type: LoopbackType, samples: &[u8]) {
        for pair in self.floop_pairs.iter_mut().filter(|p| p.enabled) {
            if pair.output_tap_idx == output_dev_idx && loop_type == LoopbackType::PostDsp {
                pair.push_samples(samples);
            }
        }
    }

    pub fn floop_pair_count(&self) -> usize {
        self.floop_pairs.len()
    }

    /// Drains the ring for the pair whose input device is `input_idx`,
    /// for the floop input device's read path to hand to its client.
    pub fn drain_floop_ring(&mut self, input_idx: u32, max: usize) -> Vec<u8> {
        self.floop_pairs
            .iter_mut()
            .find(|p| p.input_idx == input_idx)
            .map(|p| p.drain_ring(max))
            .unwrap_or_default()
    }
}

fn client_type_bit(client_type: ClientType) -> u32 {
    match client_type {
        ClientType::Legacy => 1 << 0,
        ClientType::Pcm => 1 << 1,
        ClientType::Test => 1 << 2,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_floop_reuses_matching_mask() {
        let mut reg = LoopbackRegistry::new();
        let a = reg.request_floop(0b01).unwrap();
        let b = reg.request_floop(0b01).unwrap();
        assert_eq!(a, b);
        assert_eq!(reg.floop_pair_count(), 1);
    }

    #[test]
    fn request_floop_allocates_distinct_pairs_for_distinct_masks() {
        let mut reg = LoopbackRegistry::new();
        let a = reg.request_floop(0b01).unwrap();
        let b = reg.request_floop(0b10).unwrap();
        assert_ne!(a, b);
        assert_eq!(reg.floop_pair_count(), 2);
    }

    #[test]
    fn request_floop_enforces_capacity() {
        let mut reg = LoopbackRegistry::new();
        for mask in 0..NUM_FLOOP_PAIRS_MAX as u32 {
            reg.request_floop(1 << (mask % 31)).unwrap();
        }
        let err = reg.request_floop(0xffff_ffff).unwrap_err();
        assert!(matches!(err, ServerError::FloopCapacityExceeded { .. }));
    }

    #[test]
    fn feed_floop_copies_enabled_post_dsp_samples_into_ring() {
        let mut reg = LoopbackRegistry::new();
        let input_idx = reg.request_floop(0b01).unwrap();
        let output_tap_idx = reg.matching_floop_devices(ClientType::Legacy)[0];
        reg.set_floop_enabled(input_idx, true);

        reg.notify_data(output_tap_idx, LoopbackType::PostDsp, &[1, 2, 3, 4]);

        let drained = reg.drain_floop_ring(input_idx, 16);
        assert_eq!(drained, vec![1, 2, 3, 4]);
    }

    #[test]
    fn feed_floop_ignores_disabled_pairs_and_pre_dsp_taps() {
        let mut reg = LoopbackRegistry::new();
        let input_idx = reg.request_floop(0b01).unwrap();
        let output_tap_idx = reg.matching_floop_devices(ClientType::Legacy)[0];

        // Disabled: nothing copied.
        reg.notify_data(output_tap_idx, LoopbackType::PostDsp, &[9, 9]);
        assert_eq!(reg.drain_floop_ring(input_idx, 16), Vec::<u8>::new());

        // Enabled but pre-DSP tap: still nothing copied.
        reg.set_floop_enabled(input_idx, true);
        reg.notify_data(output_tap_idx, LoopbackType::PreDsp, &[9, 9]);
        assert_eq!(reg.drain_floop_ring(input_idx, 16), Vec::<u8>::new());
    }

    #[test]
    fn floop_ring_drops_oldest_bytes_past_capacity() {
        let mut reg = LoopbackRegistry::new();
        let input_idx = reg.request_floop(0b01).unwrap();
        let output_tap_idx = reg.matching_floop_devices(ClientType::Legacy)[0];
        reg.set_floop_enabled(input_idx, true);

        let first = vec![1u8; FLOOP_RING_CAPACITY - 2];
        reg.notify_data(output_tap_idx, LoopbackType::PostDsp, &first);
        reg.notify_data(output_tap_idx, LoopbackType::PostDsp, &[2, 2, 2, 2]);

        let drained = reg.drain_floop_ring(input_idx, FLOOP_RING_CAPACITY);
        assert_eq!(drained.len(), FLOOP_RING_CAPACITY);
        assert_eq!(&drained[drained.len() - 4..], &[2, 2, 2, 2]);
    }

    #[test]
    fn matching_floop_devices_filters_by_client_type_bit() {
        let mut reg = LoopbackRegistry::new();
        let input_idx = reg.request_floop(client_type_bit(ClientType::Pcm)).unwrap();
        reg.set_floop_enabled(input_idx, true);
        let matches = reg.matching_floop_devices(ClientType::Pcm);
        assert_eq!(matches.len(), 1);
        assert!(reg.matching_floop_devices(ClientType::Legacy).is_empty());
    }
}
