//! The fallback/silent device and the cpal-backed hardware device.
//!
//! Every direction always has exactly one fallback device so routing
//! never has "no device to attach a stream to" as a failure mode — it
//! falls back instead of erroring. Grounded in the teacher's
//! `AudioDevice::enumerate_all`/`default_output`/`default_input` cpal
//! enumeration (`gecko_core/src/device.rs`) for hardware discovery, with
//! the actual stream callback shaped after `gecko_core/src/stream.rs`'s
//! `cpal::Stream` + `rtrb` ring-buffer bridge.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{info, warn};

use hearth_proto::{AudioFormat, SampleFormat};

use crate::device::{DeviceBackend, SilentBackend};
use crate::error::ServerError;

/// A device that always accepts any open and discards or emits silence.
/// Used for the two fallback devices (one per direction) that routing
/// attaches streams to whenever no real device is suitable, and for the
/// server's in-process test device (`ADD_TEST_DEV`).
pub fn new_fallback_backend(max_channels: u8) -> Box<dyn DeviceBackend> {
    Box::new(SilentBackend::new(max_channels))
}

/// Enumerates the host's real input/output devices via cpal. Device
/// discovery failures are non-fatal — routing always has the fallback to
/// lean on — so this returns an empty vec rather than an error when the
/// host reports none.
pub fn enumerate_hardware_outputs() -> Vec<cpal::Device> {
    let host = cpal::default_host();
    match host.output_devices() {
        Ok(devices) => devices.collect(),
        Err(e) => {
            warn!("failed to enumerate output devices: {e}");
            Vec::new()
        }
    }
}

pub fn enumerate_hardware_inputs() -> Vec<cpal::Device> {
    let host = cpal::default_host();
    match host.input_devices() {
        Ok(devices) => devices.collect(),
        Err(e) => {
            warn!("failed to enumerate input devices: {e}");
            Vec::new()
        }
    }
}

/// cpal has no native 24-in-32 packed sample type; hardware devices
/// negotiating `S24Le` fall back to the silent device rather than
/// mis-render samples.
fn supports_cpal_sample_format(fmt: SampleFormat) -> bool {
    matches!(fmt, SampleFormat::U8 | SampleFormat::S16Le | SampleFormat::S32Le)
}

/// A real output device backed by a `cpal::Stream`. Mirrors the
/// teacher's stream-ownership discipline: the `cpal::Stream` itself
/// isn't held across the routing lock, only opened/closed through this
/// capability set. Produced samples are handed to the stream through a
/// shared `rtrb` ring, the same realtime hand-off the teacher's
/// `stream.rs` uses between the application callback and the cpal
/// thread.
pub struct CpalOutputBackend {
    device: cpal::Device,
    stream: Option<cpal::Stream>,
    consumer: Arc<Mutex<Option<rtrb::Consumer<i16>>>>,
    producer: Option<rtrb::Producer<i16>>,
    max_channels: u8,
}

impl CpalOutputBackend {
    pub fn new(device: cpal::Device) -> Self {
        let max_channels = device
            .default_output_config()
            .map(|c| c.channels() as u8)
            .unwrap_or(2);
        Self {
            device,
            stream: None,
            consumer: Arc::new(Mutex::new(None)),
            producer: None,
            max_channels,
        }
    }

    /// The caller's realtime write path: push produced i16 samples into
    /// the ring the cpal callback drains from. Not part of
    /// `DeviceBackend` since routing writes samples through the
    /// device-io loop, not through the open/close capability set.
    pub fn push_samples(&mut self, samples: &[i16]) -> usize {
        let Some(producer) = self.producer.as_mut() else {
            return 0;
        };
        let mut written = 0;
        for &s in samples {
            if producer.push(s).is_err() {
                break;
            }
            written += 1;
        }
        written
    }
}

impl DeviceBackend for CpalOutputBackend {
    fn open(&mut self, cb_threshold: u32, format: AudioFormat) -> Result<(), ServerError> {
        if format.sample_format != SampleFormat::S16Le {
            return Err(ServerError::UnsupportedFormat { dev_idx: 0, format });
        }

        let config = cpal::StreamConfig {
            channels: format.num_channels as u16,
            sample_rate: cpal::SampleRate(format.rate_hz),
            buffer_size: cpal::BufferSize::Default,
        };

        let ring_capacity = (cb_threshold as usize * format.num_channels as usize).max(1) * 4;
        let (producer, consumer) = rtrb::RingBuffer::<i16>::new(ring_capacity);
        *self.consumer.lock() = Some(consumer);
        self.producer = Some(producer);

        let consumer_handle = self.consumer.clone();
        let error_callback = |err: cpal::StreamError| {
            warn!(%err, "cpal output stream error");
        };

        let stream = self
            .device
            .build_output_stream(
                &config,
                move |data: &mut [i16], _info| {
                    let mut guard = consumer_handle.lock();
                    if let Some(consumer) = guard.as_mut() {
                        for sample in data.iter_mut() {
                            *sample = consumer.pop().unwrap_or(0);
                        }
                    } else {
                        data.fill(0);
                    }
                },
                error_callback,
                None,
            )
            .map_err(|_| ServerError::DeviceOpenFailed(0))?;

        self.stream = Some(stream);
        info!("opened cpal output device");
        Ok(())
    }

    fn close(&mut self) {
        self.stream = None;
        self.producer = None;
        *self.consumer.lock() = None;
    }

    fn update_active_node(&mut self, _node_idx: u32, _dev_enabled: bool) -> Result<(), ServerError> {
        Ok(())
    }

    fn supports_format(&self, format: &AudioFormat) -> bool {
        format.num_channels <= self.max_channels
            && format.sample_format == SampleFormat::S16Le
            && supports_cpal_sample_format(format.sample_format)
    }

    fn max_supported_channels(&self) -> u8 {
        self.max_channels
    }

    fn start(&mut self) -> Result<(), ServerError> {
        if let Some(stream) = &self.stream {
            stream.play().map_err(|_| ServerError::DeviceOpenFailed(0))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hearth_proto::SampleFormat;

    #[test]
    fn fallback_backend_accepts_any_channel_count_within_max() {
        let mut backend = new_fallback_backend(8);
        let fmt = AudioFormat::new(SampleFormat::S16Le, 48_000, 6);
        assert!(backend.supports_format(&fmt));
        backend.open(480, fmt).unwrap();
        backend.close();
    }

    #[test]
    fn fallback_backend_rejects_over_max_channels() {
        let backend = new_fallback_backend(2);
        let fmt = AudioFormat::new(SampleFormat::S16Le, 48_000, 6);
        assert!(!backend.supports_format(&fmt));
    }

    #[test]
    fn s24le_has_no_cpal_mapping() {
        assert!(!supports_cpal_sample_format(SampleFormat::S24Le));
        assert!(supports_cpal_sample_format(SampleFormat::S16Le));
    }
}
