//! Audio capture and processing for the dictaflow daemon.
//!
//! Captures microphone input on a dedicated thread, down-mixes to mono and
//! hands the samples to the session, which resamples them to 16kHz PCM16 for
//! the streaming backends.

use anyhow::{Context, Result};
use audioadapter_buffers::direct::SequentialSliceOfVecs;
use rubato::audioadapter::Adapter;
use rubato::{Fft, FixedSync, Resampler};
use std::sync::mpsc as std_mpsc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Sample rate the streaming backends are configured for.
pub const TARGET_SAMPLE_RATE: u32 = 16000;

/// Convert multi-channel interleaved samples to mono by averaging all channels.
pub fn to_mono(samples: &[f32], channels: u16) -> Vec<f32> {
    if channels <= 1 {
        return samples.to_vec();
    }

    let channels = channels as usize;
    samples
        .chunks_exact(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect()
}

/// Convert f32 samples in [-1, 1] to signed 16-bit PCM, clamping overshoot.
pub fn to_pcm16(samples: &[f32]) -> Vec<i16> {
    samples
        .iter()
        .map(|&s| (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16)
        .collect()
}

/// Resampler for converting audio between sample rates.
pub struct AudioResampler {
    resampler: Fft<f32>,
    chunk_size_in: usize,
}

impl AudioResampler {
    /// Create a new resampler.
    ///
    /// # Arguments
    /// * `input_rate` - Input sample rate in Hz
    /// * `output_rate` - Output sample rate in Hz
    /// * `chunk_size` - Number of input samples per processing chunk
    pub fn new(input_rate: u32, output_rate: u32, chunk_size: usize) -> Result<Self> {
        let resampler = Fft::new(
            input_rate as usize,
            output_rate as usize,
            chunk_size,
            1, // sub_chunks
            1, // channels
            FixedSync::Input,
        )
        .context("Failed to create resampler")?;

        Ok(Self {
            resampler,
            chunk_size_in: chunk_size,
        })
    }

    /// Resample audio data. Trailing samples short of a full chunk are ignored.
    pub fn process(&mut self, input: &[f32]) -> Result<Vec<f32>> {
        let mut output = Vec::new();

        for chunk in input.chunks_exact(self.chunk_size_in) {
            let input_vecs = vec![chunk.to_vec()];
            let input_adapter = SequentialSliceOfVecs::new(&input_vecs, 1, chunk.len())
                .context("Invalid resampler input")?;
            let resampled = self
                .resampler
                .process(&input_adapter, 0, None)
                .context("Resampling failed")?;

            for frame_idx in 0..resampled.frames() {
                output.push(resampled.read_sample(0, frame_idx).unwrap_or(0.0));
            }
        }

        Ok(output)
    }

    /// Get the required input chunk size.
    pub fn chunk_size(&self) -> usize {
        self.chunk_size_in
    }
}

/// A running capture: mono samples at `sample_rate` until stopped or dropped.
pub struct CaptureStream {
    pub samples: mpsc::UnboundedReceiver<Vec<f32>>,
    pub sample_rate: u32,
    stop: Option<Box<dyn FnOnce() + Send>>,
}

impl CaptureStream {
    pub fn new(
        samples: mpsc::UnboundedReceiver<Vec<f32>>,
        sample_rate: u32,
        stop: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            samples,
            sample_rate,
            stop: Some(Box::new(stop)),
        }
    }

    /// Stop the underlying device stream. Safe to call more than once.
    pub fn stop(&mut self) {
        if let Some(stop) = self.stop.take() {
            stop();
        }
    }
}

impl Drop for CaptureStream {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Something that can open a microphone stream.
pub trait AudioSource: Send + Sync {
    /// Open the named input device, or the default one when `device` is `None`.
    fn open(&self, device: Option<&str>) -> Result<CaptureStream>;
}

/// Audio capture from a system input device via cpal.
///
/// cpal streams are not `Send` on every platform, so each capture lives on
/// its own thread for the duration of the session.
#[derive(Debug, Default, Clone, Copy)]
pub struct Microphone;

impl AudioSource for Microphone {
    fn open(&self, device: Option<&str>) -> Result<CaptureStream> {
        let device = device.map(str::to_string);
        let (ready_tx, ready_rx) = std_mpsc::channel::<Result<u32>>();
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();
        let (sample_tx, sample_rx) = mpsc::unbounded_channel();

        std::thread::Builder::new()
            .name("audio-capture".to_string())
            .spawn(move || {
                let capture = match AudioCapture::start(device.as_deref(), sample_tx) {
                    Ok(capture) => capture,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(capture.sample_rate()));
                // Blocks until stop is requested or the CaptureStream is dropped
                let _ = stop_rx.recv();
                capture.stop();
                debug!("Audio capture thread exiting");
            })
            .context("Failed to spawn audio capture thread")?;

        let sample_rate = ready_rx
            .recv()
            .context("Audio capture thread exited before starting")??;

        Ok(CaptureStream::new(sample_rx, sample_rate, move || {
            let _ = stop_tx.send(());
        }))
    }
}

/// Audio capture from an input device.
struct AudioCapture {
    stream: cpal::Stream,
    sample_rate: u32,
}

impl AudioCapture {
    /// Start capturing, forwarding mono sample blocks to `sender`.
    fn start(device_name: Option<&str>, sender: mpsc::UnboundedSender<Vec<f32>>) -> Result<Self> {
        use cpal::traits::{DeviceTrait, StreamTrait};

        let device = find_input_device(device_name)?;
        let config = device
            .default_input_config()
            .context("Failed to get default input config")?;

        let sample_rate = config.sample_rate();
        let channels = config.channels();
        info!(
            sample_rate = sample_rate,
            channels = channels,
            device = device_name.unwrap_or("default"),
            "Opening input device"
        );

        let err_fn = |err| warn!(error = %err, "Audio stream error");

        let stream = match config.sample_format() {
            cpal::SampleFormat::F32 => device.build_input_stream(
                &config.into(),
                move |data: &[f32], _| {
                    let _ = sender.send(to_mono(data, channels));
                },
                err_fn,
                None,
            ),
            cpal::SampleFormat::I16 => device.build_input_stream(
                &config.into(),
                move |data: &[i16], _| {
                    let samples: Vec<f32> = data.iter().map(|&s| s as f32 / 32768.0).collect();
                    let _ = sender.send(to_mono(&samples, channels));
                },
                err_fn,
                None,
            ),
            cpal::SampleFormat::U16 => device.build_input_stream(
                &config.into(),
                move |data: &[u16], _| {
                    let samples: Vec<f32> = data
                        .iter()
                        .map(|&s| (s as f32 - 32768.0) / 32768.0)
                        .collect();
                    let _ = sender.send(to_mono(&samples, channels));
                },
                err_fn,
                None,
            ),
            format => anyhow::bail!("Unsupported sample format: {:?}", format),
        }
        .context("Failed to build input stream")?;

        stream.play().context("Failed to start audio stream")?;

        Ok(Self {
            stream,
            sample_rate,
        })
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn stop(self) {
        use cpal::traits::StreamTrait;
        let _ = self.stream.pause();
    }
}

#[allow(deprecated)]
fn find_input_device(name: Option<&str>) -> Result<cpal::Device> {
    use cpal::traits::{DeviceTrait, HostTrait};

    let host = cpal::default_host();
    let Some(name) = name else {
        return host
            .default_input_device()
            .context("No input device available");
    };

    let mut devices = host
        .input_devices()
        .context("Failed to enumerate input devices")?;
    devices
        .find(|d| d.name().map(|n| n == name).unwrap_or(false))
        .with_context(|| format!("Input device not found: {name}"))
}

#[cfg(test)]
#[path = "audio_test.rs"]
mod tests;
