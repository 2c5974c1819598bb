//! Platform backed by the system audio host through `cpal`.

use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, StreamConfig};

use super::Platform;
use crate::{
    CaptureConfig, CaptureConstraints, CaptureTrack, DeviceStream, PipelineContext, PlatformError,
    SampleTap, FEATURE_PROCESSOR,
};

/// Captures from an input device of the default host.
///
/// Native processes are always allowed to capture, so the secure-context
/// probe passes. The block-synchronous processor runs inside the device
/// callback and is only offered when `block_processing` is enabled.
#[derive(Debug, Clone)]
pub struct CpalPlatform {
    device: Option<String>,
    block_processing: bool,
}

impl CpalPlatform {
    pub fn new() -> Self {
        Self {
            device: None,
            block_processing: true,
        }
    }

    pub fn from_config(config: &CaptureConfig) -> Self {
        Self {
            device: config.device.clone(),
            block_processing: config.block_processing,
        }
    }
}

impl Default for CpalPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl Platform for CpalPlatform {
    fn is_secure_context(&self) -> bool {
        true
    }

    fn supports_capture(&self) -> bool {
        cpal::default_host().input_devices().is_ok()
    }

    fn supports_pipeline(&self) -> bool {
        !cpal::available_hosts().is_empty()
    }

    fn create_context(&self) -> Result<PipelineContext, PlatformError> {
        let host = cpal::default_host();
        let device = pick_input_device(&host, self.device.as_deref())?;
        let config = device
            .default_input_config()
            .map_err(|e| PlatformError::Context(e.to_string()))?;
        Ok(PipelineContext::new(config.sample_rate().0))
    }

    fn open_stream(
        &self,
        context: &PipelineContext,
        constraints: &CaptureConstraints,
    ) -> Result<DeviceStream, PlatformError> {
        tracing::debug!(
            echo_cancellation = constraints.echo_cancellation,
            noise_suppression = constraints.noise_suppression,
            auto_gain_control = constraints.auto_gain_control,
            "input processing is left to the operating system"
        );

        let tap = SampleTap::new(context.clone());
        let track = CpalTrack::spawn(self.device.clone(), tap.clone(), context.sample_rate())?;
        let label = track.label.clone();
        Ok(DeviceStream::new(label, tap, vec![Box::new(track)]))
    }

    fn load_module(&self, context: &PipelineContext, name: &str) -> Result<(), PlatformError> {
        if self.block_processing && name == FEATURE_PROCESSOR {
            context.register_module(name)
        } else {
            Err(PlatformError::ModuleUnavailable(name.to_string()))
        }
    }
}

/// Commands sent to the capture thread
enum TrackCommand {
    Stop,
}

/// Capture track whose `cpal::Stream` lives on a dedicated thread, since the
/// stream itself cannot be moved between threads on every host.
struct CpalTrack {
    label: String,
    command_tx: mpsc::Sender<TrackCommand>,
    thread_handle: Option<JoinHandle<()>>,
}

impl CpalTrack {
    fn spawn(
        device: Option<String>,
        tap: Arc<SampleTap>,
        sample_rate: u32,
    ) -> Result<Self, PlatformError> {
        let (command_tx, command_rx) = mpsc::channel();
        let (ready_tx, ready_rx) = mpsc::sync_channel(1);

        let thread_handle = thread::Builder::new()
            .name("audio-capture".to_string())
            .spawn(move || {
                let (stream, label) = match build_capture(device.as_deref(), tap, sample_rate) {
                    Ok(started) => started,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(label));

                // Park until stopped or the track is dropped.
                match command_rx.recv() {
                    Ok(TrackCommand::Stop) => tracing::info!("audio capture stopping"),
                    Err(_) => tracing::info!("audio capture channel disconnected"),
                }
                drop(stream);
            })
            .map_err(|e| PlatformError::Stream(e.to_string()))?;

        match ready_rx.recv() {
            Ok(Ok(label)) => Ok(Self {
                label,
                command_tx,
                thread_handle: Some(thread_handle),
            }),
            Ok(Err(e)) => {
                let _ = thread_handle.join();
                Err(e)
            }
            Err(_) => {
                let _ = thread_handle.join();
                Err(PlatformError::Stream(
                    "capture thread exited before the stream started".to_string(),
                ))
            }
        }
    }
}

impl CaptureTrack for CpalTrack {
    fn label(&self) -> &str {
        &self.label
    }

    fn is_live(&self) -> bool {
        self.thread_handle.is_some()
    }

    fn stop(&mut self) {
        let _ = self.command_tx.send(TrackCommand::Stop);
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for CpalTrack {
    fn drop(&mut self) {
        self.stop();
    }
}

fn build_capture(
    filter: Option<&str>,
    tap: Arc<SampleTap>,
    context_rate: u32,
) -> Result<(cpal::Stream, String), PlatformError> {
    let host = cpal::default_host();
    let device = pick_input_device(&host, filter)?;
    let label = device.name().unwrap_or_else(|_| "input".into());

    let supported = device.default_input_config().map_err(|e| match e {
        cpal::DefaultStreamConfigError::DeviceNotAvailable => {
            PlatformError::DeviceNotFound(label.clone())
        }
        other => classify_backend_error(other.to_string()),
    })?;

    let sample_rate = supported.sample_rate().0;
    if sample_rate != context_rate {
        tracing::warn!(
            sample_rate,
            context_rate,
            "capture device rate differs from the pipeline context"
        );
    }
    let channels = supported.channels() as usize;
    tracing::info!(device = %label, sample_rate, channels, "audio capture starting");

    let config: StreamConfig = supported.config();
    let stream = match supported.sample_format() {
        SampleFormat::F32 => build_stream::<f32>(&device, &config, channels, tap),
        SampleFormat::I16 => build_stream::<i16>(&device, &config, channels, tap),
        SampleFormat::U16 => build_stream::<u16>(&device, &config, channels, tap),
        other => {
            return Err(PlatformError::Stream(format!(
                "unsupported sample format {other:?}"
            )))
        }
    }
    .map_err(|e| match e {
        cpal::BuildStreamError::DeviceNotAvailable => PlatformError::DeviceNotFound(label.clone()),
        other => classify_backend_error(other.to_string()),
    })?;

    stream
        .play()
        .map_err(|e| classify_backend_error(e.to_string()))?;

    Ok((stream, label))
}

/// Hosts surface a refused microphone permission as a backend error.
fn classify_backend_error(message: String) -> PlatformError {
    let lower = message.to_lowercase();
    if lower.contains("permission") || lower.contains("denied") || lower.contains("not authorized") {
        PlatformError::PermissionDenied(message)
    } else {
        PlatformError::Stream(message)
    }
}

/// Build an input stream that down-mixes every callback to mono
fn build_stream<T>(
    device: &Device,
    config: &StreamConfig,
    channels: usize,
    tap: Arc<SampleTap>,
) -> Result<cpal::Stream, cpal::BuildStreamError>
where
    T: cpal::SizedSample,
    f32: cpal::FromSample<T>,
{
    let channels = channels.max(1);
    let mut mono: Vec<f32> = Vec::with_capacity(4096);
    let failed = tap.clone();

    device.build_input_stream(
        config,
        move |data: &[T], _: &cpal::InputCallbackInfo| {
            mono.clear();
            mono.extend(data.chunks(channels).map(|frame| {
                let sum: f32 = frame
                    .iter()
                    .map(|s| -> f32 { cpal::Sample::from_sample(*s) })
                    .sum();
                sum / frame.len() as f32
            }));
            tap.push_block(&mono);
        },
        move |err| {
            tracing::warn!(%err, "audio stream error");
            failed.fail(err.to_string());
        },
        None,
    )
}

fn pick_input_device(host: &cpal::Host, filter: Option<&str>) -> Result<Device, PlatformError> {
    if let Some(filter) = filter {
        let needle = filter.to_lowercase();
        let devices = host
            .input_devices()
            .map_err(|e| PlatformError::DeviceNotFound(e.to_string()))?;
        for device in devices {
            if let Ok(name) = device.name() {
                if name.to_lowercase().contains(&needle) {
                    return Ok(device);
                }
            }
        }
        return Err(PlatformError::DeviceNotFound(filter.to_string()));
    }

    host.default_input_device()
        .ok_or_else(|| PlatformError::DeviceNotFound("no default input device".to_string()))
}

/// Capture device as reported by the default host.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct InputDeviceInfo {
    pub name: String,
    pub is_default: bool,
    pub sample_rate: Option<u32>,
    pub channels: Option<u16>,
}

pub fn list_input_devices() -> Result<Vec<InputDeviceInfo>, PlatformError> {
    let host = cpal::default_host();
    let default_name = host.default_input_device().and_then(|d| d.name().ok());
    let devices = host
        .input_devices()
        .map_err(|e| PlatformError::DeviceNotFound(e.to_string()))?;

    Ok(devices
        .filter_map(|device| {
            let name = device.name().ok()?;
            let config = device.default_input_config().ok();
            Some(InputDeviceInfo {
                is_default: default_name.as_deref() == Some(name.as_str()),
                sample_rate: config.as_ref().map(|c| c.sample_rate().0),
                channels: config.as_ref().map(|c| c.channels()),
                name,
            })
        })
        .collect())
}
