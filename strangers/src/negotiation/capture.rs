//! Microphone capture for the `webrtc` backend.
//!
//! The default input device is opened with `cpal` on a dedicated thread,
//! since `cpal::Stream` is not `Send`, and stays open until the audio track
//! is stopped. Captured buffers are mixed down to mono, resampled to 8 kHz
//! and written to the track as 20 ms G.711 mu-law (PCMU) samples.

use std::thread;
use std::time::Duration;

use cpal::Sample as _;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{
    BuildStreamError, DefaultStreamConfigError, FromSample, PlayStreamError, SampleFormat,
    SizedSample, StreamConfig,
};
use tokio::sync::{mpsc, oneshot};
use webrtc::media::Sample;

use super::peer::MediaAccessError;
use super::rtc::SampleTrack;

/// PCMU clock rate.
pub(super) const PCMU_RATE: u32 = 8000;

const FRAME_DURATION: Duration = Duration::from_millis(20);

/// Samples per 20 ms frame at 8 kHz.
const FRAME_SAMPLES: usize = 160;

/// How often the capture thread checks whether its track was stopped.
const STOP_POLL: Duration = Duration::from_millis(20);

/// Open the default microphone and feed `track` until the track is stopped.
///
/// # Errors
///
/// - [`MediaAccessError::NoDevices`] if there is no input device.
/// - [`MediaAccessError::PermissionDenied`] if the platform refuses access.
/// - [`MediaAccessError::Device`] if the device cannot be configured or started.
pub(super) async fn start_microphone(track: SampleTrack) -> Result<(), MediaAccessError> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or(MediaAccessError::NoDevices)?;
    let supported = device.default_input_config().map_err(config_error)?;
    let format = supported.sample_format();
    let config: StreamConfig = supported.config();
    tracing::info!(
        device = %device.name().unwrap_or_else(|_| "unknown".to_owned()),
        rate = config.sample_rate.0,
        channels = config.channels,
        ?format,
        "opening microphone"
    );

    let (buffers_tx, buffers_rx) = mpsc::unbounded_channel();
    let (ready_tx, ready_rx) = oneshot::channel();
    let downsampler = Downsampler::new(config.sample_rate.0, config.channels);
    let stop_signal = track.clone();

    thread::Builder::new()
        .name("strangers-mic".to_owned())
        .spawn(move || {
            let stream = match open_stream(&device, &config, format, buffers_tx) {
                Ok(stream) => stream,
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };
            if ready_tx.send(Ok(())).is_err() {
                return;
            }
            while !stop_signal.is_stopped() {
                thread::sleep(STOP_POLL);
            }
            drop(stream);
            tracing::debug!("microphone released");
        })
        .map_err(|e| MediaAccessError::Device(e.to_string()))?;

    ready_rx
        .await
        .map_err(|_| MediaAccessError::Device("capture thread exited".to_owned()))??;

    tokio::spawn(pump(buffers_rx, downsampler, track));
    Ok(())
}

fn open_stream(
    device: &cpal::Device,
    config: &StreamConfig,
    format: SampleFormat,
    buffers: mpsc::UnboundedSender<Vec<f32>>,
) -> Result<cpal::Stream, MediaAccessError> {
    let stream = match format {
        SampleFormat::F32 => build_stream::<f32>(device, config, buffers),
        SampleFormat::I16 => build_stream::<i16>(device, config, buffers),
        SampleFormat::U16 => build_stream::<u16>(device, config, buffers),
        other => {
            return Err(MediaAccessError::Device(format!(
                "unsupported sample format {other:?}"
            )));
        }
    }
    .map_err(build_error)?;
    stream.play().map_err(play_error)?;
    Ok(stream)
}

fn build_stream<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    buffers: mpsc::UnboundedSender<Vec<f32>>,
) -> Result<cpal::Stream, BuildStreamError>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    device.build_input_stream(
        config,
        move |data: &[T], _: &cpal::InputCallbackInfo| {
            let _ = buffers.send(data.iter().map(|&s| f32::from_sample(s)).collect());
        },
        |err| tracing::warn!(error = %err, "microphone stream error"),
        None,
    )
}

/// Encode captured buffers and write them to the track.
async fn pump(
    mut buffers: mpsc::UnboundedReceiver<Vec<f32>>,
    mut downsampler: Downsampler,
    track: SampleTrack,
) {
    let mut pending = Vec::with_capacity(FRAME_SAMPLES * 2);
    while let Some(buffer) = buffers.recv().await {
        if track.is_stopped() {
            break;
        }
        downsampler.push(&buffer, &mut pending);
        while pending.len() >= FRAME_SAMPLES {
            let encoded: Vec<u8> = pending.drain(..FRAME_SAMPLES).map(mulaw_encode).collect();
            let sample = Sample {
                data: encoded.into(),
                duration: FRAME_DURATION,
                ..Default::default()
            };
            if let Err(e) = track.write_sample(&sample).await {
                tracing::warn!(error = %e, "microphone frame dropped");
            }
        }
    }
    tracing::debug!("microphone pump finished");
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

fn config_error(error: DefaultStreamConfigError) -> MediaAccessError {
    match error {
        DefaultStreamConfigError::DeviceNotAvailable => MediaAccessError::NoDevices,
        DefaultStreamConfigError::BackendSpecific { err } => backend_error(&err.description),
        other => MediaAccessError::Device(other.to_string()),
    }
}

fn build_error(error: BuildStreamError) -> MediaAccessError {
    match error {
        BuildStreamError::DeviceNotAvailable => MediaAccessError::NoDevices,
        BuildStreamError::BackendSpecific { err } => backend_error(&err.description),
        other => MediaAccessError::Device(other.to_string()),
    }
}

fn play_error(error: PlayStreamError) -> MediaAccessError {
    match error {
        PlayStreamError::DeviceNotAvailable => MediaAccessError::NoDevices,
        PlayStreamError::BackendSpecific { err } => backend_error(&err.description),
    }
}

/// Backends only report refused access through their message text.
fn backend_error(description: &str) -> MediaAccessError {
    let lower = description.to_ascii_lowercase();
    if ["permission", "denied", "not authorized"]
        .iter()
        .any(|needle| lower.contains(needle))
    {
        MediaAccessError::PermissionDenied
    } else {
        MediaAccessError::Device(description.to_owned())
    }
}

// ---------------------------------------------------------------------------
// Signal processing
// ---------------------------------------------------------------------------

/// Mixes interleaved frames to mono and resamples them to [`PCMU_RATE`].
///
/// Input samples between two output ticks are averaged. Inputs slower than
/// 8 kHz repeat the held value.
#[derive(Debug)]
struct Downsampler {
    in_rate: u32,
    channels: usize,
    phase: u32,
    sum: f32,
    count: u32,
}

impl Downsampler {
    fn new(in_rate: u32, channels: u16) -> Self {
        Self {
            in_rate: if in_rate == 0 { PCMU_RATE } else { in_rate },
            channels: usize::from(channels.max(1)),
            phase: 0,
            sum: 0.0,
            count: 0,
        }
    }

    #[allow(clippy::cast_precision_loss)]
    fn push(&mut self, interleaved: &[f32], out: &mut Vec<f32>) {
        for frame in interleaved.chunks(self.channels) {
            self.sum += frame.iter().sum::<f32>() / frame.len() as f32;
            self.count += 1;
            self.phase += PCMU_RATE;
            let mut emitted = false;
            while self.phase >= self.in_rate {
                self.phase -= self.in_rate;
                out.push(self.sum / self.count as f32);
                emitted = true;
            }
            if emitted {
                self.sum = 0.0;
                self.count = 0;
            }
        }
    }
}

/// G.711 mu-law code for one sample in `[-1.0, 1.0]`.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn mulaw_encode(sample: f32) -> u8 {
    const BIAS: u32 = 0x84;
    const CLIP: u32 = 32635;

    let sign: u8 = if sample < 0.0 { 0x80 } else { 0 };
    let scaled = (sample.clamp(-1.0, 1.0).abs() * 32767.0) as u32;
    let magnitude = scaled.min(CLIP) + BIAS;
    // Highest set bit is 7..=14, giving a segment of 0..=7.
    let exponent = 24 - magnitude.leading_zeros();
    let mantissa = (magnitude >> (exponent + 3)) & 0x0F;
    !(sign | ((exponent << 4) | mantissa) as u8)
}
