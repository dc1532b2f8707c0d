//! Device & node model (§4.6).
//!
//! A device's capability set replaces the C "struct of function pointers
//! plus self" pattern per the redesign note: device kinds (real, fallback,
//! loopback, test, floop) all implement [`DeviceBackend`], and the
//! `Device` record itself holds only state, never function pointers.
//! Grounded in the teacher's `PlatformBackend` trait
//! (`gecko_platform/src/traits.rs`), generalized from OS-specific virtual
//! sink/node/port/link operations to this specification's abstract
//! open/close/reconfigure capability set.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use hearth_proto::{AudioFormat, Direction};

use crate::error::ServerError;

/// Index 0 is reserved ("no device"); indices below this are reserved for
/// fallback/silent devices, per the data model.
pub const NO_DEVICE_IDX: u32 = 0;
pub const MAX_SPECIAL_DEVICE_IDX: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    Close,
    Open,
    NormalRun,
    NoStreamRun,
}

/// The capability set a device kind must implement. Real devices wrap
/// whatever external backend claims the hardware; the fallback, loopback,
/// and test kinds this CORE ships are pure in-process implementations.
pub trait DeviceBackend: Send {
    fn open(&mut self, cb_threshold: u32, format: AudioFormat) -> Result<(), ServerError>;
    fn close(&mut self);
    /// Must be safe to call while closed.
    fn update_active_node(&mut self, node_idx: u32, dev_enabled: bool) -> Result<(), ServerError>;
    fn supports_format(&self, format: &AudioFormat) -> bool;
    fn max_supported_channels(&self) -> u8;
    /// Whether this device kind requires an explicit `start()` before
    /// producing/consuming audio; devices that don't skip `OPEN` and go
    /// straight to `NORMAL_RUN`.
    fn requires_start(&self) -> bool {
        true
    }
    fn start(&mut self) -> Result<(), ServerError> {
        Ok(())
    }
}

/// A selectable endpoint on a device.
#[derive(Debug, Clone)]
pub struct Node {
    pub dev: u32,
    pub idx: u32,
    pub node_type: String,
    pub position: String,
    pub plugged: bool,
    /// 0..100.
    pub volume: u32,
    pub ui_gain_scaler: f32,
    pub left_right_swapped: bool,
    pub display_rotation: i32,
    pub active_hotword_model: Option<String>,
    pub nc_provider: Option<NcProvider>,
    pub is_hotword_capable: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NcProvider {
    Dsp,
    Ap,
}

impl Node {
    /// Effective output volume: `max(0, system_volume - (100 - node.volume))`.
    pub fn effective_output_volume(&self, system_volume: u32) -> u32 {
        let deficit = 100u32.saturating_sub(self.volume);
        system_volume.saturating_sub(deficit)
    }

    /// Derive `ui_gain_scaler` from a 0..100 UI gain value via the
    /// piecewise dBFS mapping in §4.6: `[0,50)` maps to `[-2000, 0)` in
    /// 100*dBFS units, `[50,100]` maps to `[0, max_gain]`.
    pub fn input_gain_from_ui(ui_value: u32, max_gain_centidb: i32) -> i32 {
        let ui_value = ui_value.min(100) as i32;
        if ui_value < 50 {
            // -2000 at 0, approaching 0 as ui_value approaches 50.
            (ui_value - 50) * (2000 / 50)
        } else {
            (ui_value - 50) * (max_gain_centidb / 50)
        }
    }
}

/// A device (iodev): an input or output endpoint.
pub struct Device {
    pub idx: u32,
    pub direction: Direction,
    pub name: String,
    pub nodes: HashMap<u32, Node>,
    pub active_node: Option<u32>,
    pub format: Option<AudioFormat>,
    pub state: DeviceState,
    pub is_enabled: bool,
    pub min_buffer_level: u32,
    pub echo_reference_dev: Option<u32>,
    pub streams: Vec<hearth_proto::StreamId>,
    pub open_ts: Option<Instant>,
    pub idle_timeout: Option<Instant>,
    pub highest_hw_level: u32,
    pub num_underruns: u32,
    /// Decremented on reset; when it reaches zero no further
    /// underrun-triggered resets are attempted until refilled by the
    /// periodic timer, per `cras_iodev_list.c`'s reset-quota accounting.
    pub reset_quota: u32,
    pub initial_ramp_request: Option<RampRequest>,
    pub is_pinned_only: bool,
    pub max_supported_channels: u8,
    pub last_wake: Option<Instant>,
    pub wake_ts: Option<Instant>,
    backend: Box<dyn DeviceBackend>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RampRequest {
    ResumeMute,
}

pub const DEFAULT_RESET_QUOTA: u32 = 3;

impl Device {
    pub fn new(
        idx: u32,
        direction: Direction,
        name: impl Into<String>,
        max_supported_channels: u8,
        backend: Box<dyn DeviceBackend>,
    ) -> Self {
        Self {
            idx,
            direction,
            name: name.into(),
            nodes: HashMap::new(),
            active_node: None,
            format: None,
            state: DeviceState::Close,
            is_enabled: false,
            min_buffer_level: 0,
            echo_reference_dev: None,
            streams: Vec::new(),
            open_ts: None,
            idle_timeout: None,
            highest_hw_level: 0,
            num_underruns: 0,
            reset_quota: DEFAULT_RESET_QUOTA,
            initial_ramp_request: None,
            is_pinned_only: false,
            max_supported_channels,
            last_wake: None,
            wake_ts: None,
            backend,
        }
    }

    pub fn open(&mut self, cb_threshold: u32, format: AudioFormat) -> Result<(), ServerError> {
        if !self.backend.supports_format(&format) {
            return Err(ServerError::UnsupportedFormat {
                dev_idx: self.idx,
                format,
            });
        }
        self.backend.open(cb_threshold, format)?;
        self.format = Some(format);
        self.open_ts = Some(Instant::now());
        self.state = if self.backend.requires_start() {
            DeviceState::Open
        } else {
            DeviceState::NormalRun
        };
        Ok(())
    }

    pub fn start(&mut self) -> Result<(), ServerError> {
        self.backend.start()?;
        self.state = DeviceState::NormalRun;
        Ok(())
    }

    /// Release all attached streams, stop ramps, release hardware, clear
    /// format, set CLOSE.
    pub fn close(&mut self) {
        self.backend.close();
        self.format = None;
        self.streams.clear();
        self.initial_ramp_request = None;
        self.state = DeviceState::Close;
        self.open_ts = None;
        self.idle_timeout = None;
    }

    pub fn update_active_node(&mut self, node_idx: u32, dev_enabled: bool) -> Result<(), ServerError> {
        if !self.nodes.contains_key(&node_idx) {
            return Err(ServerError::UnknownNode(node_idx));
        }
        self.backend.update_active_node(node_idx, dev_enabled)?;
        self.active_node = Some(node_idx);
        Ok(())
    }

    pub fn has_attached_streams(&self) -> bool {
        !self.streams.is_empty()
    }

    pub fn attach_stream(&mut self, id: hearth_proto::StreamId) {
        if !self.streams.contains(&id) {
            self.streams.push(id);
        }
        self.idle_timeout = None;
        if self.state == DeviceState::NoStreamRun {
            self.state = DeviceState::NormalRun;
        }
    }

    /// NORMAL_RUN -> NO_STREAM_RUN: the last default stream detached but
    /// the device stays open through its idle grace period rather than
    /// closing immediately, per spec.md's documented device state machine.
    pub fn mark_no_stream_run(&mut self) {
        if self.state == DeviceState::NormalRun {
            self.state = DeviceState::NoStreamRun;
        }
    }

    pub fn detach_stream(&mut self, id: hearth_proto::StreamId) {
        self.streams.retain(|&s| s != id);
    }

    /// Record an underrun and decide whether the reset quota allows a
    /// reopen; decrements the quota on a granted reset, per
    /// `cras_iodev_list.c`.
    pub fn record_underrun_and_try_reset(&mut self) -> bool {
        self.num_underruns += 1;
        if self.reset_quota > 0 {
            self.reset_quota -= 1;
            true
        } else {
            false
        }
    }

    /// Periodic refill of the reset quota, called by the same timer that
    /// drives idle-device closing.
    pub fn refill_reset_quota(&mut self) {
        self.reset_quota = DEFAULT_RESET_QUOTA;
    }

    pub fn update_highest_hw_level(&mut self, level: u32) {
        if level > self.highest_hw_level {
            self.highest_hw_level = level;
        }
    }

    /// The next scheduler wake time for this device, folding in
    /// `dev_io.h`'s `dev_io_next_output_wake`/`dev_io_next_input_wake`
    /// into the device itself rather than a free function over a list.
    pub fn next_wake(&self) -> Option<Instant> {
        self.wake_ts
    }

    pub fn set_wake_schedule(&mut self, last_wake: Instant, wake_ts: Instant) {
        self.last_wake = Some(last_wake);
        self.wake_ts = Some(wake_ts);
    }
}

/// Computes the minimum wake time across a set of open devices, mirroring
/// `dev_io_next_output_wake`/`dev_io_next_input_wake`'s aggregation over
/// `open_dev` lists.
pub fn min_wake<'a>(devices: impl Iterator<Item = &'a Device>) -> Option<Instant> {
    devices.filter_map(Device::next_wake).min()
}

/// A device kind requiring no hardware at all: always ready, produces or
/// discards silence. Used for the fallback and test devices.
pub struct SilentBackend {
    max_channels: u8,
}

impl SilentBackend {
    pub fn new(max_channels: u8) -> Self {
        Self { max_channels }
    }
}

impl DeviceBackend for SilentBackend {
    fn open(&mut self, _cb_threshold: u32, _format: AudioFormat) -> Result<(), ServerError> {
        Ok(())
    }

    fn close(&mut self) {}

    fn update_active_node(&mut self, _node_idx: u32, _dev_enabled: bool) -> Result<(), ServerError> {
        Ok(())
    }

    fn supports_format(&self, format: &AudioFormat) -> bool {
        format.num_channels <= self.max_channels
    }

    fn max_supported_channels(&self) -> u8 {
        self.max_channels
    }

    fn requires_start(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hearth_proto::SampleFormat;

    fn test_device(idx: u32, direction: Direction) -> Device {
        Device::new(idx, direction, "test", 8, Box::new(SilentBackend::new(8)))
    }

    #[test]
    fn open_skips_open_state_for_no_start_backends() {
        let mut dev = test_device(3, Direction::Output);
        let fmt = AudioFormat::new(SampleFormat::S16Le, 48_000, 2);
        dev.open(480, fmt).unwrap();
        assert_eq!(dev.state, DeviceState::NormalRun);
    }

    #[test]
    fn volume_formula_matches_spec_example() {
        let node = Node {
            dev: 3,
            idx: 0,
            node_type: "HEADPHONE".into(),
            position: "".into(),
            plugged: true,
            volume: 80,
            ui_gain_scaler: 1.0,
            left_right_swapped: false,
            display_rotation: 0,
            active_hotword_model: None,
            nc_provider: None,
            is_hotword_capable: false,
        };
        // system 100, node 80 -> max(0, 100 - (100-80)) = 80
        assert_eq!(node.effective_output_volume(100), 80);
        // system 50, node 80 -> max(0, 50 - 20) = 30
        assert_eq!(node.effective_output_volume(50), 30);
    }

    #[test]
    fn volume_formula_floors_at_zero() {
        let node = Node {
            dev: 3,
            idx: 0,
            node_type: "HEADPHONE".into(),
            position: "".into(),
            plugged: true,
            volume: 10,
            ui_gain_scaler: 1.0,
            left_right_swapped: false,
            display_rotation: 0,
            active_hotword_model: None,
            nc_provider: None,
            is_hotword_capable: false,
        };
        assert_eq!(node.effective_output_volume(5), 0);
    }

    #[test]
    fn input_gain_mapping_symmetric_around_fifty() {
        assert_eq!(Node::input_gain_from_ui(50, 2000), 0);
        assert_eq!(Node::input_gain_from_ui(0, 2000), -2000);
        assert_eq!(Node::input_gain_from_ui(100, 2000), 2000);
    }

    #[test]
    fn reset_quota_decrements_until_exhausted() {
        let mut dev = test_device(3, Direction::Input);
        for _ in 0..DEFAULT_RESET_QUOTA {
            assert!(dev.record_underrun_and_try_reset());
        }
        assert!(!dev.record_underrun_and_try_reset());
        dev.refill_reset_quota();
        assert!(dev.record_underrun_and_try_reset());
    }

    #[test]
    fn wake_schedule_reports_minimum_across_devices() {
        let mut a = test_device(1, Direction::Output);
        let mut b = test_device(2, Direction::Output);
        let now = Instant::now();
        a.set_wake_schedule(now, now + Duration::from_millis(20));
        b.set_wake_schedule(now, now + Duration::from_millis(5));
        let devices = [&a, &b];
        let min = min_wake(devices.into_iter());
        assert_eq!(min, Some(now + Duration::from_millis(5)));
    }
}
