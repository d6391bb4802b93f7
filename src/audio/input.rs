//! Microphone acquisition behind a swappable input interface.
//!
//! The cpal stream object is not `Send`, so the device is owned by a
//! dedicated thread; frames cross to the session over a bounded channel and
//! are dropped under backpressure rather than stalling the audio callback.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use crossbeam_channel::{bounded, Receiver, Sender};
use tracing::{debug, warn};

use crate::error::VoiceError;

/// Live frames plus the device format they arrive in.
pub struct FrameStream {
    pub frames: Receiver<Vec<f32>>,
    pub sample_rate: u32,
    pub channels: u16,
}

/// One exclusive microphone endpoint.
///
/// `start` must release any prior acquisition first; no two captures may
/// hold the device at once. `stop` is idempotent.
pub trait AudioInput: Send {
    /// Acquire the device and begin delivering interleaved f32 frames.
    ///
    /// # Errors
    ///
    /// `PermissionDenied` when no input device is available or access is
    /// refused; `Audio` for device failures after acquisition.
    fn start(&mut self) -> Result<FrameStream, VoiceError>;

    /// Release the device. No-op when not capturing.
    fn stop(&mut self);

    fn is_active(&self) -> bool;
}

/// cpal-backed microphone input.
pub struct CpalInput {
    device_name: Option<String>,
    channel_capacity: usize,
    stop_flag: Option<Arc<AtomicBool>>,
    worker: Option<JoinHandle<()>>,
}

impl CpalInput {
    pub fn new(device_name: Option<String>, channel_capacity: usize) -> Self {
        Self {
            device_name,
            channel_capacity: channel_capacity.max(4),
            stop_flag: None,
            worker: None,
        }
    }
}

impl AudioInput for CpalInput {
    fn start(&mut self) -> Result<FrameStream, VoiceError> {
        // The device is exclusive; release any previous capture first.
        self.stop();

        let (frame_tx, frame_rx) = bounded(self.channel_capacity);
        let (ready_tx, ready_rx) = bounded(1);
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);
        let device_name = self.device_name.clone();

        let worker = thread::Builder::new()
            .name("iasted-mic".into())
            .spawn(move || run_capture_thread(device_name, frame_tx, ready_tx, thread_stop))
            .map_err(|e| VoiceError::Audio(format!("failed to spawn capture thread: {e}")))?;

        let ready = ready_rx
            .recv_timeout(Duration::from_secs(5))
            .map_err(|_| VoiceError::Audio("capture thread did not report readiness".into()))?;
        match ready {
            Ok((sample_rate, channels)) => {
                self.stop_flag = Some(stop);
                self.worker = Some(worker);
                debug!(sample_rate, channels, "microphone acquired");
                Ok(FrameStream {
                    frames: frame_rx,
                    sample_rate,
                    channels,
                })
            }
            Err(err) => {
                let _ = worker.join();
                Err(err)
            }
        }
    }

    fn stop(&mut self) {
        if let Some(flag) = self.stop_flag.take() {
            flag.store(true, Ordering::Relaxed);
        }
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
            debug!("microphone released");
        }
    }

    fn is_active(&self) -> bool {
        self.worker.is_some()
    }
}

impl Drop for CpalInput {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_capture_thread(
    device_name: Option<String>,
    frame_tx: Sender<Vec<f32>>,
    ready_tx: Sender<Result<(u32, u16), VoiceError>>,
    stop: Arc<AtomicBool>,
) {
    let host = cpal::default_host();
    let device = match resolve_device(&host, device_name.as_deref()) {
        Ok(device) => device,
        Err(err) => {
            let _ = ready_tx.send(Err(err));
            return;
        }
    };
    let supported = match device.default_input_config() {
        Ok(supported) => supported,
        Err(err) => {
            let _ = ready_tx.send(Err(VoiceError::PermissionDenied(format!(
                "input config unavailable: {err}"
            ))));
            return;
        }
    };
    let sample_format = supported.sample_format();
    let config: cpal::StreamConfig = supported.config();
    let sample_rate = config.sample_rate.0;
    let channels = config.channels;

    let err_fn = |err: cpal::StreamError| warn!(error = %err, "input stream error");
    let build_result = match sample_format {
        cpal::SampleFormat::F32 => {
            let tx = frame_tx.clone();
            device.build_input_stream(
                &config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    // Dropping frames beats blocking the audio callback.
                    let _ = tx.try_send(data.to_vec());
                },
                err_fn,
                None,
            )
        }
        cpal::SampleFormat::I16 => {
            let tx = frame_tx.clone();
            device.build_input_stream(
                &config,
                move |data: &[i16], _: &cpal::InputCallbackInfo| {
                    let frame: Vec<f32> = data.iter().map(|s| f32::from(*s) / 32_768.0).collect();
                    let _ = tx.try_send(frame);
                },
                err_fn,
                None,
            )
        }
        cpal::SampleFormat::U16 => {
            let tx = frame_tx.clone();
            device.build_input_stream(
                &config,
                move |data: &[u16], _: &cpal::InputCallbackInfo| {
                    let frame: Vec<f32> = data
                        .iter()
                        .map(|s| (f32::from(*s) - 32_768.0) / 32_768.0)
                        .collect();
                    let _ = tx.try_send(frame);
                },
                err_fn,
                None,
            )
        }
        other => {
            let _ = ready_tx.send(Err(VoiceError::Audio(format!(
                "unsupported input sample format {other:?}"
            ))));
            return;
        }
    };

    let stream = match build_result {
        Ok(stream) => stream,
        Err(cpal::BuildStreamError::DeviceNotAvailable) => {
            let _ = ready_tx.send(Err(VoiceError::PermissionDenied(
                "input device not available".into(),
            )));
            return;
        }
        Err(err) => {
            let _ = ready_tx.send(Err(VoiceError::Audio(format!(
                "failed to open input stream: {err}"
            ))));
            return;
        }
    };
    if let Err(err) = stream.play() {
        let _ = ready_tx.send(Err(VoiceError::Audio(format!(
            "failed to start input stream: {err}"
        ))));
        return;
    }
    let _ = ready_tx.send(Ok((sample_rate, channels)));

    while !stop.load(Ordering::Relaxed) {
        thread::sleep(Duration::from_millis(25));
    }
    drop(stream);
}

fn resolve_device(host: &cpal::Host, name: Option<&str>) -> Result<cpal::Device, VoiceError> {
    match name {
        None => host
            .default_input_device()
            .ok_or_else(|| VoiceError::PermissionDenied("no input device available".into())),
        Some(wanted) => {
            let devices = host
                .input_devices()
                .map_err(|e| VoiceError::PermissionDenied(format!("cannot list devices: {e}")))?;
            for device in devices {
                if device.name().map(|n| n == wanted).unwrap_or(false) {
                    return Ok(device);
                }
            }
            Err(VoiceError::PermissionDenied(format!(
                "input device '{wanted}' not found"
            )))
        }
    }
}
