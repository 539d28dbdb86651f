//! Synthesis adapter: runs the speech model on one text unit and turns its
//! float output into canonical 16-bit mono PCM.
//!
//! The model itself is a black box behind [`SpeechModel`]. Everything after
//! the model call (downmix, validation, edge-silence trimming, tempo and
//! sample-rate conversion, quantization) happens here so every binding gets
//! the same treatment.

use serde::Serialize;

use crate::error::PipelineError;
use crate::segment::TextUnit;

/// Amplitude below which edge samples count as silence (fraction of full scale).
pub const SILENCE_THRESHOLD: f32 = 0.0025;
pub const MIN_SPEED: f32 = 0.5;
pub const MAX_SPEED: f32 = 2.0;

/// Raw model output: interleaved float samples.
#[derive(Debug, Clone)]
pub struct Waveform {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub channels: u16,
}

impl Waveform {
    pub fn mono(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
            channels: 1,
        }
    }
}

/// Identity of a loaded model, reported by the health endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct ModelInfo {
    pub name: String,
    pub device: String,
    pub sample_rate: u32,
}

/// Capability interface for a text-to-speech model.
///
/// Implementations are loaded once at startup and shared read-only across
/// requests, so `synthesize` takes `&self` and may be called concurrently.
/// It blocks; callers run it off the async runtime.
pub trait SpeechModel: Send + Sync {
    fn synthesize(&self, text: &str) -> anyhow::Result<Waveform>;

    fn info(&self) -> ModelInfo;
}

/// 16-bit signed mono PCM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PcmBuffer {
    pub samples: Vec<i16>,
    pub sample_rate: u32,
}

impl PcmBuffer {
    pub const CHANNELS: u16 = 1;
    pub const BITS_PER_SAMPLE: u16 = 16;

    pub fn duration_secs(&self) -> f32 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f32 / self.sample_rate as f32
    }

    pub fn byte_len(&self) -> usize {
        self.samples.len() * 2
    }

    /// Little-endian sample bytes, the layout both WAV and raw `s16le` use.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.byte_len());
        for s in &self.samples {
            out.extend_from_slice(&s.to_le_bytes());
        }
        out
    }

    /// Append another buffer recorded at the same rate.
    pub fn append(&mut self, other: PcmBuffer) {
        debug_assert_eq!(self.sample_rate, other.sample_rate);
        self.samples.extend(other.samples);
    }
}

/// Per-request knobs for the adapter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SynthesisOptions {
    /// Output rate; `None` keeps the model's native rate.
    pub sample_rate: Option<u32>,
    pub speed: f32,
    pub trim_silence: bool,
}

impl Default for SynthesisOptions {
    fn default() -> Self {
        Self {
            sample_rate: None,
            speed: 1.0,
            trim_silence: true,
        }
    }
}

/// Clamp a tempo factor into the supported range. Non-finite input falls
/// back to normal speed.
pub fn clamp_speed(speed: f32) -> f32 {
    if speed.is_finite() {
        speed.clamp(MIN_SPEED, MAX_SPEED)
    } else {
        1.0
    }
}

/// Synthesize one unit into PCM.
///
/// Tempo change is a plain linear-interpolation resample, so pitch moves
/// with speed. It is not a phase vocoder.
pub fn synthesize_unit(
    model: &dyn SpeechModel,
    unit: &TextUnit,
    opts: &SynthesisOptions,
) -> Result<PcmBuffer, PipelineError> {
    let fail = |message: String| PipelineError::synthesis(unit.ordinal, message);

    let wave = model
        .synthesize(&unit.content)
        .map_err(|e| fail(format!("{e:#}")))?;
    if wave.sample_rate == 0 {
        return Err(fail("model reported a zero sample rate".to_string()));
    }
    if wave.channels == 0 {
        return Err(fail("model reported zero channels".to_string()));
    }

    let mono = downmix(&wave.samples, wave.channels);
    if mono.is_empty() {
        return Err(fail("model returned an empty waveform".to_string()));
    }
    if let Some(pos) = mono.iter().position(|s| !s.is_finite()) {
        return Err(fail(format!("non-finite sample at index {pos}")));
    }

    let voiced = if opts.trim_silence {
        trim_silence(&mono, SILENCE_THRESHOLD)
    } else {
        &mono[..]
    };

    let target_rate = opts.sample_rate.unwrap_or(wave.sample_rate);
    let ratio = target_rate as f64 / wave.sample_rate as f64 / clamp_speed(opts.speed) as f64;
    let resampled = resample_linear(voiced, ratio);

    Ok(PcmBuffer {
        samples: quantize(&resampled),
        sample_rate: target_rate,
    })
}

/// Average interleaved channels into one.
pub fn downmix(samples: &[f32], channels: u16) -> Vec<f32> {
    let channels = channels.max(1) as usize;
    if channels == 1 {
        return samples.to_vec();
    }
    samples
        .chunks_exact(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect()
}

/// Drop the contiguous near-silent run at each edge. Interior silence is
/// kept, and a waveform that is silent throughout is returned unchanged.
pub fn trim_silence(samples: &[f32], threshold: f32) -> &[f32] {
    let loud = |s: &f32| s.abs() >= threshold;
    match (
        samples.iter().position(loud),
        samples.iter().rposition(loud),
    ) {
        (Some(start), Some(end)) => &samples[start..=end],
        _ => samples,
    }
}

/// Resample by `ratio` (output length / input length) with linear
/// interpolation between neighbouring samples.
pub fn resample_linear(samples: &[f32], ratio: f64) -> Vec<f32> {
    if samples.is_empty() || !(ratio.is_finite() && ratio > 0.0) {
        return samples.to_vec();
    }
    if (ratio - 1.0).abs() < 1e-9 {
        return samples.to_vec();
    }

    let last = samples.len() - 1;
    let out_len = ((samples.len() as f64 * ratio).round() as usize).max(1);
    let mut out = Vec::with_capacity(out_len);
    for i in 0..out_len {
        let pos = i as f64 / ratio;
        let idx = (pos.floor() as usize).min(last);
        let frac = (pos - idx as f64).clamp(0.0, 1.0) as f32;
        let a = samples[idx];
        let b = samples[(idx + 1).min(last)];
        out.push(a + (b - a) * frac);
    }
    out
}

/// Clamp to [-1.0, 1.0] and scale to the i16 range.
pub fn quantize(samples: &[f32]) -> Vec<i16> {
    const I16_MAX_F32: f32 = i16::MAX as f32;
    samples
        .iter()
        .map(|&s| (s.clamp(-1.0, 1.0) * I16_MAX_F32) as i16)
        .collect()
}
