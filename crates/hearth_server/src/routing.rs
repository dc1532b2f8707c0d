//! Routing policy (§4.7): the most intricate subsystem. Decides which
//! device is playing what right now and keeps that decision consistent
//! across user actions, system events, and stream lifecycle.
//!
//! There is no teacher file this generalizes directly — `gecko_platform`
//! had no multi-device routing policy, only a single active output per
//! platform backend — so this module is grounded in the teacher's
//! `PlatformBackend` capability-set shape (open/close/configure, never a
//! god object holding raw OS handles) applied to the N-device model this
//! specification calls for, with the device bookkeeping itself grounded
//! in [`crate::device`].

use std::collections::HashMap;
use std::time::{Duration, Instant};

use hearth_proto::{Direction, StreamId};
use tracing::{info, warn};

use crate::device::{Device, RampRequest};
use crate::error::ServerError;
use crate::loopback::LoopbackRegistry;
use crate::stream_list::{RStream, StreamList};

pub const IDLE_DEVICE_CLOSE: Duration = Duration::from_secs(10);
pub const MIN_POLL_SLEEP: Duration = Duration::from_millis(10);
const STREAM_ADDED_RETRY_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisableMode {
    /// Leaves pinned streams attached and the device technically open.
    Soft,
    /// Detaches pinned streams and closes the device.
    Forced,
}

/// Deferred retry for a pinned stream whose device failed to open, per
/// §4.7 step 1's "schedule a 1-second retry and return".
struct PendingRetry {
    stream_id: StreamId,
    due: Instant,
}

pub struct Router {
    devices: HashMap<u32, Device>,
    fallback_output_idx: u32,
    fallback_input_idx: u32,
    enabled: HashMap<u32, bool>,
    streams: StreamList<Box<dyn FnMut() + Send>>,
    pub loopback: LoopbackRegistry,
    pending_retries: Vec<PendingRetry>,
    hotword_pause_at_suspend: bool,
    auto_resume: bool,
    nc_blocked: bool,
    idle_deadline: HashMap<u32, Instant>,
}

impl Router {
    pub fn new(fallback_output_idx: u32, fallback_input_idx: u32) -> Self {
        Self {
            devices: HashMap::new(),
            fallback_output_idx,
            fallback_input_idx,
            enabled: HashMap::new(),
            streams: StreamList::new(Box::new(|| {})),
            loopback: LoopbackRegistry::new(),
            pending_retries: Vec::new(),
            hotword_pause_at_suspend: false,
            auto_resume: false,
            nc_blocked: false,
            idle_deadline: HashMap::new(),
        }
    }

    pub fn add_device(&mut self, device: Device) {
        let enabled = device.idx == self.fallback_output_idx || device.idx == self.fallback_input_idx;
        self.enabled.insert(device.idx, enabled);
        self.devices.insert(device.idx, device);
    }

    pub fn device(&self, idx: u32) -> Option<&Device> {
        self.devices.get(&idx)
    }

    pub fn is_enabled(&self, idx: u32) -> bool {
        self.enabled.get(&idx).copied().unwrap_or(false)
    }

    fn fallback_for(&self, direction: Direction) -> u32 {
        if direction == Direction::Output {
            self.fallback_output_idx
        } else {
            self.fallback_input_idx
        }
    }

    fn set_enabled(&mut self, idx: u32, enabled: bool) {
        self.enabled.insert(idx, enabled);
    }

    fn enabled_devices_for(&self, direction: Direction) -> Vec<u32> {
        self.devices
            .values()
            .filter(|d| d.direction == direction && self.is_enabled(d.idx))
            .map(|d| d.idx)
            .collect()
    }

    fn non_fallback_enabled(&self, direction: Direction) -> Vec<u32> {
        let fallback = self.fallback_for(direction);
        self.enabled_devices_for(direction)
            .into_iter()
            .filter(|&idx| idx != fallback)
            .collect()
    }

    /// §4.7 `stream_added`.
    pub fn stream_added(&mut self, rstream: &RStream) -> Result<(), ServerError> {
        if let Some(pinned_idx) = rstream.pinned_dev_idx {
            return self.attach_pinned(rstream, pinned_idx);
        }

        let direction = rstream.direction;
        let fallback_idx = self.fallback_for(direction);
        if self.is_enabled(fallback_idx) {
            self.attach(fallback_idx, rstream.id)?;
        }

        let mut any_non_fallback_attached = false;
        for dev_idx in self.non_fallback_enabled(direction) {
            let needs_reopen = {
                let dev = self.devices.get(&dev_idx).unwrap();
                let cur_channels = dev.format.map(|f| f.num_channels).unwrap_or(0);
                dev.state == crate::device::DeviceState::NormalRun
                    && rstream.format.num_channels > cur_channels
                    && rstream.format.num_channels <= dev.max_supported_channels
            };

            if needs_reopen {
                self.set_enabled(fallback_idx, true);
                let reopened = {
                    let dev = self.devices.get_mut(&dev_idx).unwrap();
                    dev.close();
                    dev.open(rstream.cb_threshold, rstream.format)
                };
                if reopened.is_ok() {
                    let dev = self.devices.get_mut(&dev_idx).unwrap();
                    dev.start()?;
                    dev.attach_stream(rstream.id);
                    any_non_fallback_attached = true;
                } else {
                    warn!(dev_idx, "reopen at higher channel count failed");
                }
            } else {
                match self.open_and_attach(dev_idx, rstream) {
                    Ok(()) => any_non_fallback_attached = true,
                    Err(e) => warn!(dev_idx, error = %e, "device attach failed"),
                }
            }
        }

        for floop_idx in self.loopback.matching_floop_devices(rstream.client_type) {
            let _ = self.open_and_attach(floop_idx, rstream);
        }

        if any_non_fallback_attached {
            self.set_enabled(fallback_idx, false);
        }

        Ok(())
    }

    fn attach_pinned(&mut self, rstream: &RStream, pinned_idx: u32) -> Result<(), ServerError> {
        let dev = self
            .devices
            .get(&pinned_idx)
            .ok_or(ServerError::UnknownDevice(pinned_idx))?;

        // Open Question resolution: a hotword stream pinned to a device
        // whose active node isn't HOTWORD doesn't refuse the attach — it
        // clears the hotword flag and proceeds, same as `original_source`,
        // but (unlike it) logs the mismatch instead of doing so silently.
        if rstream.flags & crate::stream_list::STREAM_FLAG_HOTWORD != 0 {
            let is_hotword_node = dev
                .active_node
                .and_then(|n| dev.nodes.get(&n))
                .map(|n| n.node_type == "HOTWORD")
                .unwrap_or(false);
            if !is_hotword_node {
                warn!(
                    pinned_idx,
                    "hotword stream pinned to non-HOTWORD device; clearing hotword flag"
                );
                if let Some(stored) = self.streams.get_mut(rstream.id) {
                    stored.flags &= !crate::stream_list::STREAM_FLAG_HOTWORD;
                }
            }
        }

        match self.open_and_attach(pinned_idx, rstream) {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!(pinned_idx, error = %e, "pinned device attach failed, scheduling retry");
                self.pending_retries.push(PendingRetry {
                    stream_id: rstream.id,
                    due: Instant::now() + STREAM_ADDED_RETRY_DELAY,
                });
                Ok(())
            }
        }
    }

    fn open_and_attach(&mut self, dev_idx: u32, rstream: &RStream) -> Result<(), ServerError> {
        let dev = self
            .devices
            .get_mut(&dev_idx)
            .ok_or(ServerError::UnknownDevice(dev_idx))?;
        if dev.state == crate::device::DeviceState::Close {
            dev.open(rstream.cb_threshold, rstream.format)?;
            dev.start()?;
        }
        dev.attach_stream(rstream.id);
        self.idle_deadline.remove(&dev_idx);
        Ok(())
    }

    /// Retry pinned attachments whose device failed to open a second
    /// earlier. Called from the idle-check timer tick.
    pub fn drain_pending_retries(&mut self, now: Instant) {
        let due: Vec<PendingRetry> = {
            let (ready, not_ready): (Vec<_>, Vec<_>) =
                self.pending_retries.drain(..).partition(|r| r.due <= now);
            self.pending_retries = not_ready;
            ready
        };
        for retry in due {
            if let Some(rstream) = self.streams.get(retry.stream_id) {
                let rstream = clone_stream_view(rstream);
                if let Some(pinned) = rstream.pinned_dev_idx {
                    let _ = self.attach_pinned(&rstream, pinned);
                }
            }
        }
    }

    /// §4.7 `stream_removed`.
    pub fn stream_removed(&mut self, rstream: &RStream) {
        for dev in self.devices.values_mut() {
            dev.detach_stream(rstream.id);
        }

        let now = Instant::now();
        for dev_idx in self.devices.keys().copied().collect::<Vec<_>>() {
            let fallback_output = dev_idx == self.fallback_output_idx;
            let fallback_input = dev_idx == self.fallback_input_idx;
            if fallback_output || fallback_input {
                continue;
            }
            let is_pinned_capable = self.streams.has_pinned(dev_idx);
            if is_pinned_capable {
                continue;
            }
            let dev = self.devices.get_mut(&dev_idx).unwrap();
            if dev.has_attached_streams() {
                continue;
            }
            if dev.direction == Direction::Input {
                dev.close();
            } else {
                dev.mark_no_stream_run();
                self.idle_deadline.insert(dev_idx, now + IDLE_DEVICE_CLOSE);
            }
        }
    }

    /// Called by the shared idle-check timer; closes output devices
    /// whose grace period has elapsed, clamped by [`MIN_POLL_SLEEP`] so
    /// the timer never busy-spins.
    pub fn run_idle_check(&mut self, now: Instant) {
        let expired: Vec<u32> = self
            .idle_deadline
            .iter()
            .filter(|(_, &deadline)| deadline <= now)
            .map(|(&idx, _)| idx)
            .collect();
        for idx in expired {
            if let Some(dev) = self.devices.get_mut(&idx) {
                if !dev.has_attached_streams() {
                    dev.close();
                }
            }
            self.idle_deadline.remove(&idx);
        }
    }

    /// Minimum wake interval the caller should sleep before the next
    /// idle-check poll; never below [`MIN_POLL_SLEEP`].
    pub fn next_idle_check_sleep(&self, now: Instant) -> Duration {
        self.idle_deadline
            .values()
            .map(|&deadline| deadline.saturating_duration_since(now))
            .min()
            .unwrap_or(IDLE_DEVICE_CLOSE)
            .max(MIN_POLL_SLEEP)
    }

    /// §4.7 `add_active_node`.
    pub fn add_active_node(&mut self, direction: Direction, node_id: u32) -> Result<(), ServerError> {
        let dev_idx = self.device_for_node(direction, node_id)?;
        let already_enabled = self.is_enabled(dev_idx);
        let different_node = self
            .devices
            .get(&dev_idx)
            .map(|d| d.active_node != Some(node_id))
            .unwrap_or(false);

        if already_enabled && different_node {
            self.set_enabled(dev_idx, false);
        }

        let dev = self.devices.get_mut(&dev_idx).unwrap();
        dev.update_active_node(node_id, true)?;
        self.set_enabled(dev_idx, true);
        info!(dev_idx, node_id, "active node added");
        Ok(())
    }

    /// §4.7 `select_node`: exclusive selection within one direction.
    pub fn select_node(&mut self, direction: Direction, node_id: u32) -> Result<(), ServerError> {
        let dev_idx = self.device_for_node(direction, node_id)?;
        let fallback_idx = self.fallback_for(direction);

        if dev_idx != fallback_idx {
            self.set_enabled(fallback_idx, true);
        }

        for other in self.non_fallback_enabled(direction) {
            if other != dev_idx {
                self.disable_dev(other, DisableMode::Soft);
            }
        }

        let dev = self
            .devices
            .get_mut(&dev_idx)
            .ok_or(ServerError::UnknownDevice(dev_idx))?;
        dev.update_active_node(node_id, true)?;
        self.set_enabled(dev_idx, true);

        if dev_idx != fallback_idx {
            self.set_enabled(fallback_idx, false);
        }
        Ok(())
    }

    fn device_for_node(&self, direction: Direction, node_id: u32) -> Result<u32, ServerError> {
        self.devices
            .values()
            .find(|d| d.direction == direction && d.nodes.contains_key(&node_id))
            .map(|d| d.idx)
            .ok_or(ServerError::UnknownNode(node_id))
    }

    /// §4.7 suspend.
    pub fn suspend(&mut self) {
        let stream_ids: Vec<StreamId> = self.streams.iter().map(|s| s.id).collect();
        for id in stream_ids {
            if let Some(rstream) = self.streams.get(id) {
                let rstream = clone_stream_view(rstream);
                self.stream_removed(&rstream);
            }
        }

        for dev in self.devices.values_mut() {
            dev.close();
        }
        for enabled in self.enabled.values_mut() {
            *enabled = false;
        }

        self.auto_resume = true;
        if self.hotword_pause_at_suspend {
            info!("hotword streams rerouted onto empty hotword device during suspend");
        }
    }

    /// §4.7 resume.
    pub fn resume(&mut self) {
        let views: Vec<RStream> = self.streams.iter().map(clone_stream_view).collect();
        for rstream in &views {
            let _ = self.stream_added(rstream);
        }

        let any_output_attached = self
            .devices
            .values()
            .any(|d| d.direction == Direction::Output && d.has_attached_streams());
        if any_output_attached {
            for dev in self.devices.values_mut() {
                if dev.direction == Direction::Output && dev.has_attached_streams() {
                    dev.initial_ramp_request = Some(RampRequest::ResumeMute);
                }
            }
        }

        self.auto_resume = false;
    }

    pub fn set_hotword_pause_at_suspend(&mut self, v: bool) {
        self.hotword_pause_at_suspend = v;
    }

    /// §4.7 disable-dev, soft vs. forced.
    pub fn disable_dev(&mut self, dev_idx: u32, mode: DisableMode) {
        self.set_enabled(dev_idx, false);
        if mode == DisableMode::Forced {
            let pinned: Vec<StreamId> = self
                .devices
                .get(&dev_idx)
                .map(|d| d.streams.clone())
                .unwrap_or_default();
            if let Some(dev) = self.devices.get_mut(&dev_idx) {
                for id in pinned {
                    dev.detach_stream(id);
                }
                dev.close();
            }
        }
    }

    /// §4.7 reset-for-noise-cancellation.
    pub fn reset_for_nc(&mut self) {
        let input_devs: Vec<u32> = self
            .devices
            .values()
            .filter(|d| {
                d.direction == Direction::Input
                    && d.active_node
                        .and_then(|n| d.nodes.get(&n))
                        .map(|n| n.nc_provider.is_some())
                        .unwrap_or(false)
            })
            .map(|d| d.idx)
            .collect();

        if input_devs.is_empty() {
            return;
        }

        self.set_enabled(self.fallback_input_idx, true);
        for dev_idx in input_devs {
            let streams: Vec<StreamId> = self
                .devices
                .get(&dev_idx)
                .map(|d| d.streams.clone())
                .unwrap_or_default();
            if let Some(dev) = self.devices.get_mut(&dev_idx) {
                let fmt = dev.format;
                dev.close();
                if let Some(fmt) = fmt {
                    if dev.open(480, fmt).is_ok() {
                        let _ = dev.start();
                        for id in streams {
                            dev.attach_stream(id);
                        }
                    }
                }
            }
        }
        self.set_enabled(self.fallback_input_idx, false);
    }

    /// §4.7 blocked-NC state: OR of "an output device's active node
    /// can't do DSP AEC" and "an input stream disallows AEC-on-DSP while
    /// it would otherwise apply".
    pub fn recompute_nc_blocked(&mut self, any_stream_disallows_dsp_aec: bool) -> bool {
        let output_blocks = self.devices.values().any(|d| {
            d.direction == Direction::Output
                && self.is_enabled(d.idx)
                && d.active_node
                    .and_then(|n| d.nodes.get(&n))
                    .map(|n| n.nc_provider != Some(crate::device::NcProvider::Dsp))
                    .unwrap_or(true)
        });
        let new_value = output_blocks || any_stream_disallows_dsp_aec;
        let changed = new_value != self.nc_blocked;
        self.nc_blocked = new_value;
        changed
    }

    pub fn nc_blocked(&self) -> bool {
        self.nc_blocked
    }

    pub fn attach(&mut self, dev_idx: u32, stream_id: StreamId) -> Result<(), ServerError> {
        let dev = self
            .devices
            .get_mut(&dev_idx)
            .ok_or(ServerError::UnknownDevice(dev_idx))?;
        dev.attach_stream(stream_id);
        Ok(())
    }

    pub fn streams_mut(&mut self) -> &mut StreamList<Box<dyn FnMut() + Send>> {
        &mut self.streams
    }

    pub fn streams(&self) -> &StreamList<Box<dyn FnMut() + Send>> {
        &self.streams
    }
}

/// Stream data the routing policy needs after the stream list's mutable
/// borrow has ended; a cheap value copy rather than holding a reference
/// across `&mut self` routing calls.
fn clone_stream_view(rstream: &RStream) -> RStream {
    RStream {
        id: rstream.id,
        direction: rstream.direction,
        format: rstream.format,
        client_type: rstream.client_type,
        buffer_frames: rstream.buffer_frames,
        cb_threshold: rstream.cb_threshold,
        flags: rstream.flags,
        client_shm_fd: rstream.client_shm_fd,
        pinned_dev_idx: rstream.pinned_dev_idx,
        start_ts: rstream.start_ts,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Device;
    use crate::fallback::new_fallback_backend;
    use crate::stream_list::{ClientType, StreamParams};
    use hearth_proto::{AudioFormat, SampleFormat};

    fn fmt() -> AudioFormat {
        AudioFormat::new(SampleFormat::S16Le, 48_000, 2)
    }

    fn make_router() -> Router {
        let mut router = Router::new(0, 1);
        router.add_device(Device::new(
            0,
            Direction::Output,
            "fallback-output",
            8,
            new_fallback_backend(8),
        ));
        router.add_device(Device::new(
            1,
            Direction::Input,
            "fallback-input",
            8,
            new_fallback_backend(8),
        ));
        router.add_device(Device::new(
            2,
            Direction::Output,
            "real-output",
            2,
            new_fallback_backend(2),
        ));
        router
    }

    fn params(direction: Direction, pinned: Option<u32>) -> StreamParams {
        StreamParams {
            direction,
            format: fmt(),
            client_type: ClientType::Pcm,
            buffer_frames: 4096,
            cb_threshold: 480,
            flags: 0,
            pinned_dev_idx: pinned,
        }
    }

    #[test]
    fn stream_added_attaches_to_fallback_when_fallback_enabled() {
        let mut router = make_router();
        router.set_enabled(0, true);
        let id = StreamId::new(1, 0);
        router.streams_mut().create(id, params(Direction::Output, None), None).unwrap();
        let rstream = clone_stream_view(router.streams().get(id).unwrap());
        router.stream_added(&rstream).unwrap();
        assert!(router.device(0).unwrap().streams.contains(&id));
    }

    #[test]
    fn stream_removed_schedules_idle_close_for_output_devices() {
        let mut router = make_router();
        let id = StreamId::new(1, 0);
        router.attach(2, id).unwrap();
        router.devices.get_mut(&2).unwrap().open(480, fmt()).unwrap();

        let rstream = RStream {
            id,
            direction: Direction::Output,
            format: fmt(),
            client_type: ClientType::Pcm,
            buffer_frames: 4096,
            cb_threshold: 480,
            flags: 0,
            client_shm_fd: None,
            pinned_dev_idx: None,
            start_ts: Instant::now(),
        };
        router.stream_removed(&rstream);
        assert!(router.idle_deadline.contains_key(&2));
        assert_eq!(router.device(2).unwrap().state, crate::device::DeviceState::NoStreamRun);
    }

    #[test]
    fn reattaching_a_stream_leaves_no_stream_run() {
        let mut router = make_router();
        let id = StreamId::new(1, 0);
        router.attach(2, id).unwrap();
        router.devices.get_mut(&2).unwrap().open(480, fmt()).unwrap();

        let rstream = RStream {
            id,
            direction: Direction::Output,
            format: fmt(),
            client_type: ClientType::Pcm,
            buffer_frames: 4096,
            cb_threshold: 480,
            flags: 0,
            client_shm_fd: None,
            pinned_dev_idx: None,
            start_ts: Instant::now(),
        };
        router.stream_removed(&rstream);
        assert_eq!(router.device(2).unwrap().state, crate::device::DeviceState::NoStreamRun);

        router.attach(2, id).unwrap();
        assert_eq!(router.device(2).unwrap().state, crate::device::DeviceState::NormalRun);
    }

    #[test]
    fn disable_dev_forced_detaches_streams() {
        let mut router = make_router();
        let id = StreamId::new(1, 0);
        router.devices.get_mut(&2).unwrap().open(480, fmt()).unwrap();
        router.attach(2, id).unwrap();
        router.disable_dev(2, DisableMode::Forced);
        assert!(!router.device(2).unwrap().streams.contains(&id));
        assert_eq!(router.device(2).unwrap().state, crate::device::DeviceState::Close);
    }

    #[test]
    fn idle_check_closes_devices_past_deadline() {
        let mut router = make_router();
        router.devices.get_mut(&2).unwrap().open(480, fmt()).unwrap();
        let now = Instant::now();
        router.idle_deadline.insert(2, now - Duration::from_millis(1));
        router.run_idle_check(now);
        assert_eq!(router.device(2).unwrap().state, crate::device::DeviceState::Close);
    }

    #[test]
    fn suspend_then_resume_reattaches_streams() {
        let mut router = make_router();
        router.set_enabled(0, true);
        let id = StreamId::new(1, 0);
        router.streams_mut().create(id, params(Direction::Output, None), None).unwrap();
        let rstream = clone_stream_view(router.streams().get(id).unwrap());
        router.stream_added(&rstream).unwrap();

        router.suspend();
        assert!(router.auto_resume);
        assert_eq!(router.device(0).unwrap().state, crate::device::DeviceState::Close);

        router.set_enabled(0, true);
        router.resume();
        assert!(!router.auto_resume);
    }
}
