//! Per-session microphone pump: capture -> 16kHz PCM16 -> transport, plus
//! the level meter loop.

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::audio::{AudioResampler, AudioSource, CaptureStream, TARGET_SAMPLE_RATE, to_pcm16};
use crate::level::{FRAME_INTERVAL, LevelAnalyzer, LevelSink};
use crate::provider::AudioChunk;

/// Input samples per resampler chunk at the device rate.
const RESAMPLE_CHUNK: usize = 1024;

/// A running capture task. Stopping it always leaves the meter at zero.
pub(crate) struct CaptureTask {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl CaptureTask {
    /// Open the input device and start forwarding audio to `audio`.
    pub(crate) async fn spawn(
        source: Arc<dyn AudioSource>,
        device: Option<String>,
        audio: mpsc::Sender<AudioChunk>,
        levels: Arc<dyn LevelSink>,
    ) -> Result<Self> {
        let stream = tokio::task::spawn_blocking(move || source.open(device.as_deref()))
            .await
            .context("Audio capture task failed")??;

        let resampler = if stream.sample_rate == TARGET_SAMPLE_RATE {
            None
        } else {
            debug!(from = stream.sample_rate, to = TARGET_SAMPLE_RATE, "Resampling capture");
            Some(AudioResampler::new(
                stream.sample_rate,
                TARGET_SAMPLE_RATE,
                RESAMPLE_CHUNK,
            )?)
        };

        let cancel = CancellationToken::new();
        let task = tokio::spawn(run(stream, resampler, audio, levels, cancel.clone()));
        Ok(Self { cancel, task })
    }

    /// Stop capturing and wait for the final zero level to be emitted.
    pub(crate) async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            warn!(error = %e, "Capture task ended abnormally");
        }
    }
}

/// Tracks audio blocks dropped while the transport queue is full.
#[derive(Debug, Default)]
struct Backlog {
    dropped: usize,
}

impl Backlog {
    /// Queue `chunk` without waiting. Warns once when a stall starts.
    fn send(&mut self, audio: &mpsc::Sender<AudioChunk>, chunk: AudioChunk) {
        match audio.try_send(chunk) {
            Ok(()) => {
                if self.dropped > 0 {
                    info!(dropped = self.dropped, "Transport caught up");
                    self.dropped = 0;
                }
            }
            Err(TrySendError::Full(_)) => {
                if self.dropped == 0 {
                    warn!("Transport is backlogged, dropping audio");
                }
                self.dropped += 1;
            }
            Err(TrySendError::Closed(_)) => trace!("Transport closed, dropping audio block"),
        }
    }
}

async fn run(
    mut stream: CaptureStream,
    mut resampler: Option<AudioResampler>,
    audio: mpsc::Sender<AudioChunk>,
    levels: Arc<dyn LevelSink>,
    cancel: CancellationToken,
) {
    let mut analyzer = LevelAnalyzer::new();
    let mut pending: Vec<f32> = Vec::new();
    let mut backlog = Backlog::default();
    let mut frames = tokio::time::interval(FRAME_INTERVAL);
    frames.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            block = stream.samples.recv() => {
                let Some(samples) = block else {
                    debug!("Capture stream ended");
                    break;
                };
                analyzer.push(&samples);

                let out = match resampler.as_mut() {
                    None => samples,
                    Some(resampler) => {
                        pending.extend_from_slice(&samples);
                        let whole = pending.len() - pending.len() % resampler.chunk_size();
                        if whole == 0 {
                            continue;
                        }
                        let ready: Vec<f32> = pending.drain(..whole).collect();
                        match resampler.process(&ready) {
                            Ok(out) => out,
                            Err(e) => {
                                warn!(error = %e, "Resampling failed");
                                continue;
                            }
                        }
                    }
                };

                backlog.send(&audio, to_pcm16(&out));
            }
            _ = frames.tick() => {
                let frame = analyzer.frame();
                levels.audio_level(frame.level, &frame.bars);
            }
        }
    }

    stream.stop();
    levels.reset();
}
