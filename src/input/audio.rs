//! Audio capture and conversion.
//!
//! Everything downstream works on 16kHz mono `f32` samples. Microphone audio
//! is captured at the device's native format with cpal, mixed to mono and
//! resampled. Uploaded clips are decoded from WAV with hound.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Stream, StreamConfig};
use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Target sample rate for Whisper (16kHz)
pub const SAMPLE_RATE: u32 = 16000;

/// How long a read waits for the device before reporting a stall.
const READ_TIMEOUT: Duration = Duration::from_secs(3);

/// Callback chunks buffered between the audio thread and the reader.
const CALLBACK_QUEUE: usize = 256;

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("No audio input device found")]
    NoInputDevice,

    #[error("Failed to get default input config: {0}")]
    NoInputConfig(String),

    #[error("Failed to build audio stream: {0}")]
    StreamBuildFailed(String),

    #[error("Failed to start audio stream: {0}")]
    StreamStartFailed(String),

    #[error("Audio stream error: {0}")]
    StreamError(String),

    #[error("No audio received for {0:?}")]
    Stalled(Duration),

    #[error("Invalid audio: {0}")]
    InvalidAudio(String),
}

/// Mono audio at a known sample rate.
#[derive(Debug, Clone)]
pub struct AudioBuffer {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl AudioBuffer {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    /// Get duration in seconds
    pub fn duration_secs(&self) -> f32 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f32 / self.sample_rate as f32
    }

    /// Calculate RMS (Root Mean Square) level in dB
    pub fn rms_db(&self) -> f32 {
        rms_db(&self.samples)
    }

    /// Convert to 16kHz for Whisper.
    pub fn into_whisper_rate(self) -> Self {
        if self.sample_rate == SAMPLE_RATE {
            return self;
        }
        let samples = resample(&self.samples, self.sample_rate, SAMPLE_RATE);
        Self::new(samples, SAMPLE_RATE)
    }

    /// Decode a WAV file (any channel count, int or float samples) to mono.
    pub fn from_wav_bytes(bytes: &[u8]) -> Result<Self, CaptureError> {
        let reader = hound::WavReader::new(std::io::Cursor::new(bytes))
            .map_err(|e| CaptureError::InvalidAudio(format!("not a WAV file: {e}")))?;
        let spec = reader.spec();

        if spec.channels == 0 || spec.sample_rate == 0 {
            return Err(CaptureError::InvalidAudio("WAV header has no channels".into()));
        }

        let interleaved: Vec<f32> = match spec.sample_format {
            hound::SampleFormat::Float => reader
                .into_samples::<f32>()
                .collect::<Result<_, _>>()
                .map_err(|e| CaptureError::InvalidAudio(e.to_string()))?,
            hound::SampleFormat::Int => {
                let scale = (1_i64 << (spec.bits_per_sample.clamp(1, 32) - 1)) as f32;
                reader
                    .into_samples::<i32>()
                    .map(|s| s.map(|v| v as f32 / scale))
                    .collect::<Result<_, _>>()
                    .map_err(|e| CaptureError::InvalidAudio(e.to_string()))?
            }
        };

        debug!(
            "Decoded WAV: {} Hz, {} channels, {} bits",
            spec.sample_rate, spec.channels, spec.bits_per_sample
        );

        Ok(Self::new(
            to_mono(&interleaved, spec.channels),
            spec.sample_rate,
        ))
    }
}

/// RMS level of `samples` in dB; negative infinity for silence.
pub fn rms_db(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return f32::NEG_INFINITY;
    }

    let sum_squares: f32 = samples.iter().map(|&s| s * s).sum();
    let rms = (sum_squares / samples.len() as f32).sqrt();

    if rms > 0.0 {
        20.0 * rms.log10()
    } else {
        f32::NEG_INFINITY
    }
}

/// Average interleaved channels into mono.
pub fn to_mono(data: &[f32], channels: u16) -> Vec<f32> {
    if channels <= 1 {
        return data.to_vec();
    }
    let ch = channels as usize;
    data.chunks_exact(ch)
        .map(|frame| frame.iter().sum::<f32>() / ch as f32)
        .collect()
}

/// A blocking source of fixed-size 16kHz mono frames.
pub trait AudioSource {
    /// Block until the next frame is available.
    fn read_frame(&mut self) -> Result<Vec<f32>, CaptureError>;
}

/// Default microphone captured with cpal.
///
/// `cpal::Stream` is not `Send`, so a source must be created on the thread
/// that reads from it.
pub struct MicrophoneSource {
    _stream: Stream,
    chunks: Receiver<Vec<f32>>,
    failed: Arc<AtomicBool>,
    native_rate: u32,
    /// Frame length at the native rate.
    frame_len: usize,
    pending: Vec<f32>,
}

impl MicrophoneSource {
    /// Open the default input device, producing frames of `frame_secs`.
    pub fn open(frame_secs: f32) -> Result<Self, CaptureError> {
        let host = cpal::default_host();
        let device = host
            .default_input_device()
            .ok_or(CaptureError::NoInputDevice)?;

        let device_name = device
            .description()
            .map(|d| d.name().to_owned())
            .unwrap_or_else(|_| "unknown".into());
        info!("Using audio input device: {}", device_name);

        let default_config = device
            .default_input_config()
            .map_err(|e| CaptureError::NoInputConfig(e.to_string()))?;

        let native_rate = default_config.sample_rate();
        let native_channels = default_config.channels();
        let stream_config = StreamConfig {
            channels: native_channels,
            sample_rate: native_rate,
            buffer_size: cpal::BufferSize::Default,
        };

        info!(
            "Device input: {} Hz, {} channels (will resample to {} Hz)",
            native_rate, native_channels, SAMPLE_RATE
        );

        let (tx, chunks) = sync_channel::<Vec<f32>>(CALLBACK_QUEUE);
        let failed = Arc::new(AtomicBool::new(false));
        let failed_cb = Arc::clone(&failed);

        let stream = device
            .build_input_stream(
                &stream_config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    // Never block the audio thread.
                    if tx.try_send(to_mono(data, native_channels)).is_err() {
                        debug!("Capture queue full, dropping chunk");
                    }
                },
                move |err| {
                    error!("Audio stream error: {}", err);
                    failed_cb.store(true, Ordering::SeqCst);
                },
                None,
            )
            .map_err(|e| CaptureError::StreamBuildFailed(e.to_string()))?;

        stream
            .play()
            .map_err(|e| CaptureError::StreamStartFailed(e.to_string()))?;

        let frame_len = ((native_rate as f32 * frame_secs) as usize).max(1);

        Ok(Self {
            _stream: stream,
            chunks,
            failed,
            native_rate,
            frame_len,
            pending: Vec::with_capacity(frame_len * 2),
        })
    }
}

impl AudioSource for MicrophoneSource {
    fn read_frame(&mut self) -> Result<Vec<f32>, CaptureError> {
        while self.pending.len() < self.frame_len {
            if self.failed.load(Ordering::SeqCst) {
                return Err(CaptureError::StreamError("input device failed".into()));
            }
            match self.chunks.recv_timeout(READ_TIMEOUT) {
                Ok(chunk) => self.pending.extend_from_slice(&chunk),
                Err(RecvTimeoutError::Timeout) => return Err(CaptureError::Stalled(READ_TIMEOUT)),
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(CaptureError::StreamError("input stream closed".into()))
                }
            }
        }

        let rest = self.pending.split_off(self.frame_len);
        let frame = std::mem::replace(&mut self.pending, rest);
        Ok(resample(&frame, self.native_rate, SAMPLE_RATE))
    }
}

/// Resample mono audio, sinc-interpolated with a linear fallback.
pub fn resample(samples: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == to_rate || samples.is_empty() {
        return samples.to_vec();
    }
    resample_sinc(samples, from_rate, to_rate)
}

/// Simple linear resampling (fast, lower quality)
fn resample_linear(samples: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if samples.is_empty() {
        return Vec::new();
    }

    let ratio = to_rate as f64 / from_rate as f64;
    let new_len = (samples.len() as f64 * ratio) as usize;
    let mut result = Vec::with_capacity(new_len);

    for i in 0..new_len {
        let src_idx = i as f64 / ratio;
        let floor = (src_idx.floor() as usize).min(samples.len() - 1);
        let ceil = (floor + 1).min(samples.len() - 1);
        let frac = (src_idx - floor as f64) as f32;
        result.push(samples[floor] * (1.0 - frac) + samples[ceil] * frac);
    }

    result
}

/// High-quality sinc resampling via rubato
fn resample_sinc(samples: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    let params = SincInterpolationParameters {
        sinc_len: 256,
        f_cutoff: 0.95,
        interpolation: SincInterpolationType::Linear,
        oversampling_factor: 256,
        window: WindowFunction::BlackmanHarris2,
    };

    let ratio = to_rate as f64 / from_rate as f64;
    let chunk_size = 1024;
    let mut resampler = match SincFixedIn::<f32>::new(ratio, 2.0, params, chunk_size, 1) {
        Ok(r) => r,
        Err(e) => {
            warn!("Failed to create sinc resampler: {}, falling back to linear", e);
            return resample_linear(samples, from_rate, to_rate);
        }
    };

    let mut output = Vec::with_capacity((samples.len() as f64 * ratio) as usize + chunk_size);

    for chunk in samples.chunks(chunk_size) {
        let mut input = chunk.to_vec();
        input.resize(chunk_size, 0.0);

        match resampler.process(&[input], None) {
            Ok(resampled) => {
                let Some(channel) = resampled.first() else {
                    continue;
                };
                // The last chunk was padded; keep only its share.
                let take = if chunk.len() < chunk_size {
                    ((chunk.len() as f64 * ratio).ceil() as usize).min(channel.len())
                } else {
                    channel.len()
                };
                output.extend_from_slice(&channel[..take]);
            }
            Err(e) => {
                warn!("Sinc resampling error: {}, falling back to linear", e);
                return resample_linear(samples, from_rate, to_rate);
            }
        }
    }

    debug!(
        "Sinc resampled {} -> {} samples ({}Hz -> {}Hz)",
        samples.len(),
        output.len(),
        from_rate,
        to_rate
    );

    output
}
