//! Microphone level metering for visualizations.
//!
//! Once per animation frame the analyzer takes the newest block of samples,
//! computes a byte-scaled magnitude spectrum (the same scale a browser
//! `AnalyserNode` reports) and derives a single eased level plus a small
//! eased bar spectrum.

use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};
use std::collections::VecDeque;
use std::f32::consts::PI;
use std::sync::Arc;
use std::time::Duration;

/// FFT window length. Yields `FFT_SIZE / 2` frequency bins.
pub const FFT_SIZE: usize = 256;

/// Number of bars in the emitted spectrum.
pub const BAR_COUNT: usize = 24;

/// Frame cadence of the meter loop (~60 fps).
pub const FRAME_INTERVAL: Duration = Duration::from_millis(16);

const LEVEL_BINS: usize = 20;
const LEVEL_GAIN: f32 = 1.5;
const LEVEL_RISE: f32 = 0.5;
const LEVEL_FALL: f32 = 0.4;

const BINS_PER_BAR: usize = 2;
const BAR_GAIN: f32 = 1.8;
const BAR_RISE: f32 = 0.6;
const BAR_FALL: f32 = 0.4;

const MIN_DECIBELS: f32 = -100.0;
const MAX_DECIBELS: f32 = -30.0;
const SMOOTHING: f32 = 0.8;

/// Receiver of per-frame meter output.
pub trait LevelSink: Send + Sync {
    fn audio_level(&self, level: f32, bars: &[f32; BAR_COUNT]);

    /// Return visualizations to idle.
    fn reset(&self) {
        self.audio_level(0.0, &[0.0; BAR_COUNT]);
    }
}

/// One frame of meter output.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LevelFrame {
    pub level: f32,
    pub bars: [f32; BAR_COUNT],
}

impl LevelFrame {
    pub const SILENT: LevelFrame = LevelFrame {
        level: 0.0,
        bars: [0.0; BAR_COUNT],
    };
}

/// Move `previous` toward `target`, faster on the way up than down.
pub fn ease(previous: f32, target: f32, rise: f32, fall: f32) -> f32 {
    let factor = if target > previous { rise } else { fall };
    previous + (target - previous) * factor
}

/// Spectrum analyzer with eased level and bar outputs.
pub struct LevelAnalyzer {
    fft: Arc<dyn Fft<f32>>,
    window: Vec<f32>,
    recent: VecDeque<f32>,
    smoothed: Vec<f32>,
    frame: LevelFrame,
}

impl Default for LevelAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

impl LevelAnalyzer {
    pub fn new() -> Self {
        let fft = FftPlanner::new().plan_fft_forward(FFT_SIZE);
        let window = (0..FFT_SIZE).map(blackman).collect();
        Self {
            fft,
            window,
            recent: VecDeque::from(vec![0.0; FFT_SIZE]),
            smoothed: vec![0.0; FFT_SIZE / 2],
            frame: LevelFrame::SILENT,
        }
    }

    /// Feed captured samples; only the newest `FFT_SIZE` are kept.
    pub fn push(&mut self, samples: &[f32]) {
        let skip = samples.len().saturating_sub(FFT_SIZE);
        for &s in &samples[skip..] {
            self.recent.pop_front();
            self.recent.push_back(s);
        }
    }

    /// Analyze the current window and advance the eased outputs by one frame.
    pub fn frame(&mut self) -> LevelFrame {
        let bins = self.byte_spectrum();

        let level_target =
            (mean(&bins[..LEVEL_BINS]) / 255.0 * LEVEL_GAIN).clamp(0.0, 1.0);
        self.frame.level = ease(self.frame.level, level_target, LEVEL_RISE, LEVEL_FALL);

        for (i, bar) in self.frame.bars.iter_mut().enumerate() {
            let group = &bins[i * BINS_PER_BAR..(i + 1) * BINS_PER_BAR];
            let target = (mean(group) / 255.0 * BAR_GAIN).clamp(0.0, 1.0);
            *bar = ease(*bar, target, BAR_RISE, BAR_FALL);
        }

        self.frame
    }

    /// Forget all history, as if freshly created.
    pub fn reset(&mut self) {
        self.recent.iter_mut().for_each(|s| *s = 0.0);
        self.smoothed.iter_mut().for_each(|m| *m = 0.0);
        self.frame = LevelFrame::SILENT;
    }

    /// Magnitudes per bin on a 0..=255 scale.
    fn byte_spectrum(&mut self) -> Vec<f32> {
        let mut buffer: Vec<Complex<f32>> = self
            .recent
            .iter()
            .zip(&self.window)
            .map(|(s, w)| Complex::new(s * w, 0.0))
            .collect();
        self.fft.process(&mut buffer);

        buffer
            .iter()
            .take(FFT_SIZE / 2)
            .zip(self.smoothed.iter_mut())
            .map(|(c, smoothed)| {
                let magnitude = c.norm() / FFT_SIZE as f32;
                *smoothed = SMOOTHING * *smoothed + (1.0 - SMOOTHING) * magnitude;
                let db = 20.0 * smoothed.max(f32::MIN_POSITIVE).log10();
                ((db - MIN_DECIBELS) / (MAX_DECIBELS - MIN_DECIBELS) * 255.0).clamp(0.0, 255.0)
            })
            .collect()
    }
}

fn blackman(n: usize) -> f32 {
    let alpha = 0.16;
    let x = 2.0 * PI * n as f32 / FFT_SIZE as f32;
    0.5 * (1.0 - alpha) - 0.5 * x.cos() + 0.5 * alpha * (2.0 * x).cos()
}

fn mean(values: &[f32]) -> f32 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f32>() / values.len() as f32
}
